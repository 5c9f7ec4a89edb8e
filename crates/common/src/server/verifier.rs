//! Inbound verification pipeline.
//!
//! [`InboundVerifier::handle`] runs the checks below in order and stops at the
//! first failure. Every outcome is returned as an [`Envelope`]; the HTTP layer
//! always answers 200.
//!
//! 1. header extraction (`sign`, `requestId`, `timestamp`)
//! 2. identity propagation
//! 3. signature verification
//! 4. freshness (expired, or too far in the future)
//! 5. replay reservation
//! 6. argument decoding and deadline check
//! 7. invocation
//!
//! Nothing after a failed step runs; in particular the operation is never
//! invoked for a rejected request.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use error_stack::Report;
use http::header::HeaderName;
use http::HeaderMap;
use rsa::pkcs1v15::VerifyingKey;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sha2::Sha256;

use crate::audit::{AuditLogger, AuditScope, DIRECTION_RECEIVE};
use crate::clock::{Clock, SystemClock};
use crate::constants::{
    HEADER_REQUEST_ID, HEADER_SIGN, HEADER_TIMESTAMP, MSG_DEADLINE_EXCEEDED,
    MSG_DUPLICATE_REQUEST, MSG_INVALID_BODY, MSG_REQUEST_EXPIRED, MSG_REQUEST_FROM_FUTURE,
    MSG_SIGNATURE_PARAMS_INVALID, MSG_SIGNATURE_PARAMS_MISSING, MSG_VERIFICATION_FAILED,
};
use crate::context::{CallContext, ContextPropagator, InboundScope, PropagatedIdentity};
use crate::envelope::Envelope;
use crate::error::{InternalCallError, OperationError};
use crate::replay::ReplayGuard;
use crate::request_signing::{verify, KeyMaterial, SignableContent};
use crate::settings::Settings;

/// The parts of an inbound HTTP request the pipeline looks at.
#[derive(Debug, Clone, Copy)]
pub struct InboundRequest<'a> {
    pub uri: &'a str,
    pub headers: &'a HeaderMap,
    pub body: &'a [u8],
}

/// Signature headers of a request that passed every check.
struct Admitted {
    request_id: String,
    identity: PropagatedIdentity,
}

pub struct InboundVerifier {
    verifying_key: VerifyingKey<Sha256>,
    replay_guard: Arc<dyn ReplayGuard>,
    propagator: Option<Arc<dyn ContextPropagator>>,
    audit: Option<Arc<dyn AuditLogger>>,
    clock: Arc<dyn Clock>,
    freshness_window: Duration,
    nonce_ttl: Duration,
    max_clock_skew: Duration,
    invocation_deadline: Option<Duration>,
}

pub struct InboundVerifierBuilder {
    verifier: InboundVerifier,
}

impl InboundVerifierBuilder {
    #[must_use]
    pub fn propagator(mut self, propagator: Arc<dyn ContextPropagator>) -> Self {
        self.verifier.propagator = Some(propagator);
        self
    }

    #[must_use]
    pub fn audit_logger(mut self, audit: Arc<dyn AuditLogger>) -> Self {
        self.verifier.audit = Some(audit);
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.verifier.clock = clock;
        self
    }

    #[must_use]
    pub fn freshness_window(mut self, window: Duration) -> Self {
        self.verifier.freshness_window = window;
        self
    }

    /// Minimum lifetime of a request id reservation. A request stamped ahead
    /// of the local clock is reserved until its freshness window closes, even
    /// when that is later than `ttl`.
    #[must_use]
    pub fn nonce_ttl(mut self, ttl: Duration) -> Self {
        self.verifier.nonce_ttl = ttl;
        self
    }

    #[must_use]
    pub fn max_clock_skew(mut self, skew: Duration) -> Self {
        self.verifier.max_clock_skew = skew;
        self
    }

    /// Budget for one inbound call, measured from the start of verification.
    ///
    /// The budget is checked once, right before the operation is invoked: a
    /// call whose budget is already spent gets 501 "deadline exceeded". A
    /// running operation is not interrupted and can still overrun the budget;
    /// long operations should consult [`CallContext::remaining`] themselves.
    #[must_use]
    pub fn invocation_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.verifier.invocation_deadline = deadline;
        self
    }

    #[must_use]
    pub fn build(self) -> InboundVerifier {
        self.verifier
    }
}

impl InboundVerifier {
    #[must_use]
    pub fn builder(
        verifying_key: VerifyingKey<Sha256>,
        replay_guard: Arc<dyn ReplayGuard>,
    ) -> InboundVerifierBuilder {
        let defaults = Settings::default();
        InboundVerifierBuilder {
            verifier: Self {
                verifying_key,
                replay_guard,
                propagator: None,
                audit: None,
                clock: Arc::new(SystemClock),
                freshness_window: defaults.signing.freshness_window(),
                nonce_ttl: defaults.signing.nonce_ttl(),
                max_clock_skew: defaults.signing.max_clock_skew(),
                invocation_deadline: defaults.server.invocation_deadline(),
            },
        }
    }

    /// Builds a verifier with the windows and deadline from `settings`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `keys` holds no public key.
    pub fn from_settings(
        settings: &Settings,
        keys: &KeyMaterial,
        replay_guard: Arc<dyn ReplayGuard>,
    ) -> Result<InboundVerifierBuilder, Report<InternalCallError>> {
        let verifying_key = keys.verifying_key()?.clone();
        Ok(Self::builder(verifying_key, replay_guard)
            .freshness_window(settings.signing.freshness_window())
            .nonce_ttl(settings.signing.nonce_ttl())
            .max_clock_skew(settings.signing.max_clock_skew())
            .invocation_deadline(settings.server.invocation_deadline()))
    }

    /// Verifies `request` and, if it is admitted, invokes `op` with the
    /// decoded JSON body.
    pub fn handle<A, T, E, F>(
        &self,
        request: &InboundRequest<'_>,
        operation: &str,
        op: F,
    ) -> Envelope<Value>
    where
        A: DeserializeOwned,
        T: Serialize,
        E: Into<OperationError>,
        F: FnOnce(A, &CallContext) -> Result<T, E>,
    {
        self.handle_with_path_params(request, operation, BTreeMap::new(), op)
    }

    pub(crate) fn handle_with_path_params<A, T, E, F>(
        &self,
        request: &InboundRequest<'_>,
        operation: &str,
        path_params: BTreeMap<String, String>,
        op: F,
    ) -> Envelope<Value>
    where
        A: DeserializeOwned,
        T: Serialize,
        E: Into<OperationError>,
        F: FnOnce(A, &CallContext) -> Result<T, E>,
    {
        let started = Instant::now();
        let mut audit = AuditScope::new(self.audit.as_deref(), DIRECTION_RECEIVE);
        audit
            .add("uri", request.uri)
            .add("operation", operation)
            .add("args", audit_args(request.body));

        let scope = InboundScope::enter(self.propagator.as_deref());

        let envelope = match self.admit(request, &scope, &mut audit) {
            Ok(admitted) => {
                let ctx = CallContext::new(
                    admitted.request_id,
                    request.uri.to_string(),
                    operation.to_string(),
                    admitted.identity,
                    self.deadline_from(started),
                )
                .with_path_params(path_params);
                self.invoke(request.body, &ctx, op)
            }
            Err(rejection) => rejection,
        };
        drop(scope);

        audit
            .add("code", envelope.code.as_u16())
            .add("msg", &envelope.msg);
        if envelope.is_success() {
            audit.add("data", &envelope.data);
        }
        envelope
    }

    fn admit(
        &self,
        request: &InboundRequest<'_>,
        scope: &InboundScope<'_>,
        audit: &mut AuditScope<'_>,
    ) -> Result<Admitted, Envelope<Value>> {
        let (Some(sign), Some(request_id), Some(timestamp)) = (
            header_value(request.headers, &HEADER_SIGN),
            header_value(request.headers, &HEADER_REQUEST_ID),
            header_value(request.headers, &HEADER_TIMESTAMP),
        ) else {
            return Err(reject(request.uri, MSG_SIGNATURE_PARAMS_MISSING));
        };
        audit.add("requestId", request_id);

        let identity = match &self.propagator {
            Some(propagator) => {
                let identity =
                    PropagatedIdentity::from_headers(request.headers, &propagator.declared_keys());
                scope.install(&identity);
                audit.add("identity", &identity);
                identity
            }
            None => PropagatedIdentity::new(),
        };

        let Ok(timestamp) = timestamp.trim().parse::<i64>() else {
            return Err(reject(request.uri, MSG_SIGNATURE_PARAMS_INVALID));
        };

        let content = SignableContent::new(request_id, timestamp);
        if !verify(&content, sign, &self.verifying_key) {
            return Err(reject(request.uri, MSG_VERIFICATION_FAILED));
        }

        let now = self.clock.now_millis();
        let age = now.saturating_sub(timestamp);
        if age > duration_millis(self.freshness_window) {
            return Err(reject(request.uri, MSG_REQUEST_EXPIRED));
        }
        if -age > duration_millis(self.max_clock_skew) {
            return Err(reject(request.uri, MSG_REQUEST_FROM_FUTURE));
        }

        match self.replay_guard.reserve(request_id, self.reservation_ttl(age)) {
            Ok(true) => {}
            Ok(false) => return Err(reject(request.uri, MSG_DUPLICATE_REQUEST)),
            Err(report) => {
                log::error!("replay guard unavailable for {}: {:?}", request.uri, report);
                return Err(Envelope::system_error(report.current_context().message()));
            }
        }

        log::debug!("admitted internal call {} to {}", request_id, request.uri);
        Ok(Admitted {
            request_id: request_id.to_string(),
            identity,
        })
    }

    /// How long a request id of a request `age` milliseconds old stays
    /// reserved: at least the nonce TTL, and never shorter than the time left
    /// until the request falls out of the freshness window.
    fn reservation_ttl(&self, age: i64) -> Duration {
        let ahead = u64::try_from(age.saturating_neg())
            .map(Duration::from_millis)
            .unwrap_or(Duration::ZERO);
        self.freshness_window
            .saturating_add(ahead)
            .max(self.nonce_ttl)
    }

    fn deadline_from(&self, started: Instant) -> Option<Instant> {
        let budget = self.invocation_deadline?;
        let deadline = started.checked_add(budget);
        if deadline.is_none() {
            log::warn!(
                "invocation deadline {:?} is out of range, running without one",
                budget
            );
        }
        deadline
    }

    fn invoke<A, T, E, F>(&self, body: &[u8], ctx: &CallContext, op: F) -> Envelope<Value>
    where
        A: DeserializeOwned,
        T: Serialize,
        E: Into<OperationError>,
        F: FnOnce(A, &CallContext) -> Result<T, E>,
    {
        let args: A = match decode_args(body) {
            Ok(args) => args,
            Err(e) => {
                log::warn!("invalid body for {}: {}", ctx.uri(), e);
                return Envelope::client_error(MSG_INVALID_BODY);
            }
        };

        if ctx.is_past_deadline() {
            log::error!("deadline spent before invoking {}", ctx.uri());
            return Envelope::system_error(MSG_DEADLINE_EXCEEDED);
        }

        match catch_unwind(AssertUnwindSafe(|| op(args, ctx))) {
            Ok(Ok(result)) => match serde_json::to_value(result) {
                Ok(Value::Null) => Envelope::success(None),
                Ok(data) => Envelope::success(Some(data)),
                Err(e) => {
                    log::error!("failed to encode result of {}: {}", ctx.uri(), e);
                    Envelope::system_error(format!("failed to encode result: {}", e))
                }
            },
            Ok(Err(err)) => {
                let err: OperationError = err.into();
                match err {
                    OperationError::Business(_) => {
                        log::info!("{} failed with {}", ctx.uri(), err);
                    }
                    OperationError::System(_) => {
                        log::error!("{} failed with {}", ctx.uri(), err);
                    }
                }
                err.into()
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                log::error!("{} panicked: {}", ctx.uri(), message);
                Envelope::system_error(message)
            }
        }
    }
}

fn reject(uri: &str, message: &str) -> Envelope<Value> {
    log::warn!("rejected internal call to {}: {}", uri, message);
    Envelope::client_error(message)
}

fn header_value<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
}

fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// An empty body decodes as JSON `null`, so operations without arguments can
/// take `()` or an `Option`.
fn decode_args<A: DeserializeOwned>(body: &[u8]) -> Result<A, serde_json::Error> {
    if body.iter().all(u8::is_ascii_whitespace) {
        serde_json::from_value(Value::Null)
    } else {
        serde_json::from_slice(body)
    }
}

fn audit_args(body: &[u8]) -> Value {
    if body.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "operation panicked".to_string()
    }
}
