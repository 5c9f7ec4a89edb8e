//! Outbound half of the protocol.
//!
//! [`InternalCallClient`] signs each call, attaches propagated identity, posts
//! the JSON parameters and turns the callee's envelope into either a decoded
//! [`CallOutput`] or a typed [`InternalCallError`].

pub mod transport;

pub use transport::*;

use std::sync::Arc;

use error_stack::Report;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::audit::{AuditLogger, AuditScope, DIRECTION_SEND};
use crate::clock::{Clock, SystemClock};
use crate::constants::{HEADER_REQUEST_ID, HEADER_SIGN, HEADER_TIMESTAMP, MSG_TRANSPORT_FAILURE};
use crate::context::ContextPropagator;
use crate::envelope::{CallOutput, Envelope};
use crate::error::InternalCallError;
use crate::logging::is_debug_enabled;
use crate::request_signing::{generate_request_id, KeyMaterial, RequestSigner};
use crate::settings::Settings;

pub struct InternalCallClient {
    signer: RequestSigner,
    transport: Arc<dyn Transport>,
    propagator: Option<Arc<dyn ContextPropagator>>,
    audit: Option<Arc<dyn AuditLogger>>,
    clock: Arc<dyn Clock>,
}

pub struct InternalCallClientBuilder {
    signer: RequestSigner,
    transport: Option<Arc<dyn Transport>>,
    propagator: Option<Arc<dyn ContextPropagator>>,
    audit: Option<Arc<dyn AuditLogger>>,
    clock: Option<Arc<dyn Clock>>,
}

impl InternalCallClientBuilder {
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    #[must_use]
    pub fn propagator(mut self, propagator: Arc<dyn ContextPropagator>) -> Self {
        self.propagator = Some(propagator);
        self
    }

    #[must_use]
    pub fn audit_logger(mut self, audit: Arc<dyn AuditLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    #[must_use]
    pub fn build(self) -> InternalCallClient {
        InternalCallClient {
            signer: self.signer,
            transport: self
                .transport
                .unwrap_or_else(|| Arc::new(UreqTransport::default())),
            propagator: self.propagator,
            audit: self.audit,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
        }
    }
}

impl InternalCallClient {
    #[must_use]
    pub fn builder(signer: RequestSigner) -> InternalCallClientBuilder {
        InternalCallClientBuilder {
            signer,
            transport: None,
            propagator: None,
            audit: None,
            clock: None,
        }
    }

    /// Builds a client using the `ureq` transport configured by `settings`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `keys` holds no private key.
    pub fn from_settings(
        settings: &Settings,
        keys: &KeyMaterial,
    ) -> Result<InternalCallClientBuilder, Report<InternalCallError>> {
        let signer = RequestSigner::from_key_material(keys)?;
        Ok(Self::builder(signer)
            .transport(Arc::new(UreqTransport::from_settings(&settings.client))))
    }

    /// Calls `url` with `params` as the JSON body.
    ///
    /// # Errors
    ///
    /// - [`InternalCallError::ClientProtocol`] if the callee rejected the signature headers
    /// - [`InternalCallError::Business`] for a domain failure reported by the callee
    /// - [`InternalCallError::System`] for an unexpected callee failure
    /// - [`InternalCallError::Transport`] for non-2xx responses, I/O failures and
    ///   responses that do not decode
    pub fn call<P, T>(&self, url: &str, params: &P) -> Result<CallOutput<T>, Report<InternalCallError>>
    where
        P: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.call_with_cancellation(url, params, &CancellationToken::new())
    }

    /// Calls `url` with an empty JSON object as the body.
    ///
    /// # Errors
    ///
    /// See [`InternalCallClient::call`].
    pub fn call_without_params<T>(&self, url: &str) -> Result<CallOutput<T>, Report<InternalCallError>>
    where
        T: DeserializeOwned,
    {
        self.call(url, &Value::Object(serde_json::Map::new()))
    }

    /// Like [`InternalCallClient::call`], aborting with a transport error once
    /// `token` is cancelled.
    ///
    /// # Errors
    ///
    /// See [`InternalCallClient::call`].
    pub fn call_with_cancellation<P, T>(
        &self,
        url: &str,
        params: &P,
        token: &CancellationToken,
    ) -> Result<CallOutput<T>, Report<InternalCallError>>
    where
        P: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let mut audit = AuditScope::new(self.audit.as_deref(), DIRECTION_SEND);
        let result = self.execute(url, params, token, &mut audit);
        if let Err(report) = &result {
            audit.add("error", report.current_context().message());
        }
        result
    }

    fn execute<P, T>(
        &self,
        url: &str,
        params: &P,
        token: &CancellationToken,
        audit: &mut AuditScope<'_>,
    ) -> Result<CallOutput<T>, Report<InternalCallError>>
    where
        P: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let request_id = generate_request_id();
        let timestamp = self.clock.now_millis();
        audit
            .add("url", url)
            .add("params", params)
            .add("requestId", &request_id);

        url::Url::parse(url).map_err(|e| {
            Report::new(InternalCallError::transport(format!(
                "invalid url '{}': {}",
                url, e
            )))
        })?;

        let body = serde_json::to_string(params).map_err(|e| {
            Report::new(InternalCallError::transport(format!(
                "failed to encode params: {}",
                e
            )))
        })?;

        let signed = self.signer.sign_request(&request_id, timestamp)?;
        let mut headers = Vec::new();

        if let Some(propagator) = &self.propagator {
            let identity = propagator.create_outbound_headers();
            for (name, value) in identity.iter() {
                if is_protocol_header(name) {
                    log::warn!(
                        "propagated header '{}' collides with a signature header, dropping it",
                        name
                    );
                    continue;
                }
                headers.push((name.to_string(), value.to_string()));
            }
            audit.add("identity", &identity);
        }
        headers.extend(
            signed
                .to_pairs()
                .into_iter()
                .map(|(name, value)| (name.as_str().to_string(), value)),
        );

        ensure_not_cancelled(token)?;
        log::debug!("internal call {} -> {}", request_id, url);

        let response = self.transport.post_json(&transport::OutboundRequest {
            url,
            headers,
            body,
        })?;

        ensure_not_cancelled(token)?;

        if !response.is_success() {
            log::warn!(
                "internal call {} to {} failed with HTTP {}",
                request_id,
                url,
                response.status
            );
            audit.add("status", response.status);
            return Err(Report::new(InternalCallError::transport(format!(
                "{}: HTTP {}",
                MSG_TRANSPORT_FAILURE, response.status
            ))));
        }

        if is_debug_enabled() {
            log::debug!("internal call {} response: {}", request_id, response.body);
        }

        let envelope: Envelope<Value> = serde_json::from_str(&response.body).map_err(|e| {
            Report::new(InternalCallError::transport(format!(
                "malformed envelope: {}",
                e
            )))
        })?;

        audit
            .add("code", envelope.code.as_u16())
            .add("msg", &envelope.msg);

        let data = envelope.into_result().map_err(|err| {
            log::warn!("internal call {} to {} returned {}", request_id, url, err);
            Report::new(err).attach(format!("requestId: {}", request_id))
        })?;
        audit.add("data", &data);

        CallOutput::from_data(data).map_err(|e| {
            Report::new(InternalCallError::transport(format!(
                "failed to decode result: {}",
                e
            )))
        })
    }
}

fn is_protocol_header(name: &str) -> bool {
    [HEADER_SIGN, HEADER_REQUEST_ID, HEADER_TIMESTAMP]
        .iter()
        .any(|header| header.as_str().eq_ignore_ascii_case(name))
}

fn ensure_not_cancelled(token: &CancellationToken) -> Result<(), Report<InternalCallError>> {
    if token.is_cancelled() {
        return Err(Report::new(InternalCallError::transport("call cancelled")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use serde::Deserialize;
    use serde_json::json;

    use crate::context::{PropagatedIdentity, StaticPropagator};
    use crate::error::ErrorKind;
    use crate::request_signing::SignableContent;
    use crate::test_support::tests::{test_key_material, FixedClock, RecordingAuditLogger};

    #[derive(Debug, Deserialize, PartialEq)]
    struct Account {
        id: u64,
    }

    /// Replies with a canned response and remembers what it was sent.
    struct CannedTransport {
        status: u16,
        body: String,
        seen: Mutex<Vec<(Vec<(String, String)>, String)>>,
    }

    impl CannedTransport {
        fn new(status: u16, body: Value) -> Arc<Self> {
            Arc::new(Self {
                status,
                body: body.to_string(),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn last_headers(&self) -> Vec<(String, String)> {
            self.seen.lock().unwrap().last().unwrap().0.clone()
        }

        fn last_body(&self) -> String {
            self.seen.lock().unwrap().last().unwrap().1.clone()
        }
    }

    impl Transport for CannedTransport {
        fn post_json(
            &self,
            request: &OutboundRequest<'_>,
        ) -> Result<TransportResponse, Report<InternalCallError>> {
            self.seen
                .lock()
                .unwrap()
                .push((request.headers.clone(), request.body.clone()));
            Ok(TransportResponse {
                status: self.status,
                body: self.body.clone(),
            })
        }
    }

    struct FailingTransport;

    impl Transport for FailingTransport {
        fn post_json(
            &self,
            _request: &OutboundRequest<'_>,
        ) -> Result<TransportResponse, Report<InternalCallError>> {
            Err(Report::new(InternalCallError::transport(
                "transport failure: connection reset",
            )))
        }
    }

    fn client_with(transport: Arc<dyn Transport>, audit: Arc<RecordingAuditLogger>) -> InternalCallClient {
        let signer = RequestSigner::from_key_material(&test_key_material()).unwrap();
        InternalCallClient::builder(signer)
            .transport(transport)
            .audit_logger(audit)
            .clock(Arc::new(FixedClock::new(1_700_000_000_000)))
            .build()
    }

    fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
        headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_call_sends_verifiable_signature_headers() {
        let transport = CannedTransport::new(200, json!({"code": 200}));
        let client = client_with(transport.clone(), Arc::default());

        let output: CallOutput<Account> = client
            .call("http://accounts.internal/get", &json!({"id": 1}))
            .unwrap();
        assert!(output.is_empty());

        let headers = transport.last_headers();
        let request_id = header(&headers, "requestId").unwrap();
        let timestamp = header(&headers, "timestamp").unwrap();
        let sign = header(&headers, "sign").unwrap();
        assert_eq!(timestamp, "1700000000000");

        let content = SignableContent::new(request_id, 1_700_000_000_000);
        let key = test_key_material();
        assert!(crate::request_signing::verify(
            &content,
            sign,
            key.verifying_key().unwrap()
        ));
        assert_eq!(transport.last_body(), r#"{"id":1}"#);
    }

    #[test]
    fn test_call_without_params_sends_empty_object() {
        let transport = CannedTransport::new(200, json!({"code": 200}));
        let client = client_with(transport.clone(), Arc::default());

        let _: CallOutput<Account> = client.call_without_params("http://a.internal/x").unwrap();
        assert_eq!(transport.last_body(), "{}");
    }

    #[test]
    fn test_each_call_uses_fresh_request_id() {
        let transport = CannedTransport::new(200, json!({"code": 200}));
        let client = client_with(transport.clone(), Arc::default());

        let _: CallOutput<Account> = client.call_without_params("http://a.internal/x").unwrap();
        let first = header(&transport.last_headers(), "requestId").unwrap().to_string();
        let _: CallOutput<Account> = client.call_without_params("http://a.internal/x").unwrap();
        let second = header(&transport.last_headers(), "requestId").unwrap().to_string();

        assert_ne!(first, second);
    }

    #[test]
    fn test_success_decodes_single_and_list() {
        let single = CannedTransport::new(200, json!({"code": 200, "data": {"id": 7}}));
        let client = client_with(single, Arc::default());
        let output: CallOutput<Account> = client.call_without_params("http://a.internal/x").unwrap();
        assert_eq!(output, CallOutput::Single(Account { id: 7 }));

        let list = CannedTransport::new(200, json!({"code": 200, "data": [{"id": 1}, {"id": 2}]}));
        let client = client_with(list, Arc::default());
        let output: CallOutput<Account> = client.call_without_params("http://a.internal/x").unwrap();
        assert_eq!(output.into_vec(), vec![Account { id: 1 }, Account { id: 2 }]);
    }

    #[test]
    fn test_envelope_codes_map_to_error_kinds() {
        let cases = [
            (400, ErrorKind::ClientProtocol, "duplicate request"),
            (500, ErrorKind::Business, "insufficient balance"),
            (501, ErrorKind::System, "database down"),
        ];

        for (code, kind, msg) in cases {
            let transport = CannedTransport::new(200, json!({"code": code, "msg": msg}));
            let client = client_with(transport, Arc::default());

            let err = client
                .call_without_params::<Account>("http://a.internal/x")
                .unwrap_err();
            assert_eq!(err.current_context().kind(), kind);
            assert_eq!(err.current_context().message(), msg);
        }
    }

    #[test]
    fn test_non_2xx_is_transport_error_without_decoding() {
        let transport = CannedTransport::new(502, json!({"code": 200, "data": {"id": 1}}));
        let client = client_with(transport, Arc::default());

        let err = client
            .call_without_params::<Account>("http://a.internal/x")
            .unwrap_err();
        assert_eq!(err.current_context().kind(), ErrorKind::Transport);
        assert_eq!(err.current_context().message(), "transport failure: HTTP 502");
    }

    #[test]
    fn test_malformed_body_is_transport_error() {
        let transport = Arc::new(CannedTransport {
            status: 200,
            body: "<html>oops</html>".into(),
            seen: Mutex::new(Vec::new()),
        });
        let client = client_with(transport, Arc::default());

        let err = client
            .call_without_params::<Account>("http://a.internal/x")
            .unwrap_err();
        assert_eq!(err.current_context().kind(), ErrorKind::Transport);
        assert!(err.current_context().message().starts_with("malformed envelope"));
    }

    #[test]
    fn test_invalid_url_fails_before_sending() {
        let transport = CannedTransport::new(200, json!({"code": 200}));
        let client = client_with(transport.clone(), Arc::default());

        let err = client.call_without_params::<Account>("not a url").unwrap_err();
        assert_eq!(err.current_context().kind(), ErrorKind::Transport);
        assert!(transport.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_cancelled_token_stops_call_before_sending() {
        let transport = CannedTransport::new(200, json!({"code": 200}));
        let client = client_with(transport.clone(), Arc::default());
        let token = CancellationToken::new();
        token.cancel();

        let err = client
            .call_with_cancellation::<_, Account>("http://a.internal/x", &json!({}), &token)
            .unwrap_err();
        assert_eq!(err.current_context().message(), "call cancelled");
        assert!(transport.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_propagated_identity_is_sent_and_audited() {
        let transport = CannedTransport::new(200, json!({"code": 200}));
        let audit = Arc::new(RecordingAuditLogger::default());
        let identity: PropagatedIdentity = [("x-caller", "billing"), ("sign", "forged")]
            .into_iter()
            .collect();
        let signer = RequestSigner::from_key_material(&test_key_material()).unwrap();
        let client = InternalCallClient::builder(signer)
            .transport(transport.clone())
            .propagator(Arc::new(StaticPropagator::new(identity)))
            .audit_logger(audit.clone())
            .build();

        let _: CallOutput<Account> = client.call_without_params("http://a.internal/x").unwrap();

        let headers = transport.last_headers();
        assert_eq!(header(&headers, "x-caller"), Some("billing"));
        let signs: Vec<_> = headers.iter().filter(|(k, _)| k == "sign").collect();
        assert_eq!(signs.len(), 1);
        assert_ne!(signs[0].1, "forged");

        let records = audit.records();
        assert_eq!(records[0].get("identity").unwrap()["x-caller"], json!("billing"));
    }

    #[test]
    fn test_audit_record_flushed_once_on_success() {
        let transport = CannedTransport::new(200, json!({"code": 200, "data": {"id": 3}}));
        let audit = Arc::new(RecordingAuditLogger::default());
        let client = client_with(transport, audit.clone());

        let _: CallOutput<Account> = client
            .call("http://a.internal/x", &json!({"id": 3}))
            .unwrap();

        let records = audit.records();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.get("direction"), Some(&json!("send")));
        assert_eq!(record.get("url"), Some(&json!("http://a.internal/x")));
        assert_eq!(record.get("params"), Some(&json!({"id": 3})));
        assert!(record.get("requestId").is_some());
        assert_eq!(record.get("code"), Some(&json!(200)));
        assert_eq!(record.get("data"), Some(&json!({"id": 3})));
        assert!(record.get("error").is_none());
    }

    #[test]
    fn test_audit_record_flushed_once_on_every_failure() {
        let failures: [Arc<dyn Transport>; 5] = [
            CannedTransport::new(200, json!({"code": 400, "msg": "verification failed"})),
            CannedTransport::new(200, json!({"code": 500, "msg": "insufficient balance"})),
            CannedTransport::new(200, json!({"code": 501, "msg": "boom"})),
            CannedTransport::new(503, json!({})),
            Arc::new(FailingTransport),
        ];

        for transport in failures {
            let audit = Arc::new(RecordingAuditLogger::default());
            let client = client_with(transport, audit.clone());

            let result = client.call_without_params::<Account>("http://a.internal/x");
            assert!(result.is_err());

            let records = audit.records();
            assert_eq!(records.len(), 1);
            assert!(records[0].get("error").is_some());
            assert!(records[0].get("requestId").is_some());
        }
    }
}
