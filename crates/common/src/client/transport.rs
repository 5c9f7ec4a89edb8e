//! Blocking HTTP transport for outbound calls.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use ureq::Agent;

use crate::constants::MSG_TRANSPORT_FAILURE;
use crate::error::InternalCallError;
use crate::settings::ClientSettings;

/// A fully prepared outbound POST.
#[derive(Debug, Clone)]
pub struct OutboundRequest<'a> {
    pub url: &'a str,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

impl TransportResponse {
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Sends a JSON POST and returns the raw status and body.
///
/// Implementations report a non-2xx status as a normal response; only I/O
/// level failures are errors.
pub trait Transport: Send + Sync {
    /// # Errors
    ///
    /// Returns a transport error if the request cannot be sent or the
    /// response cannot be read.
    fn post_json(
        &self,
        request: &OutboundRequest<'_>,
    ) -> Result<TransportResponse, Report<InternalCallError>>;
}

/// [`Transport`] backed by `ureq`.
///
/// Every call builds its own agent, so the connection it opens is closed when
/// the call returns.
#[derive(Debug, Clone)]
pub struct UreqTransport {
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl UreqTransport {
    #[must_use]
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            read_timeout,
        }
    }

    #[must_use]
    pub fn from_settings(settings: &ClientSettings) -> Self {
        Self::new(settings.connect_timeout(), settings.read_timeout())
    }

    fn agent(&self) -> Agent {
        Agent::config_builder()
            .http_status_as_error(false)
            .timeout_connect(Some(self.connect_timeout))
            .timeout_recv_response(Some(self.read_timeout))
            .timeout_recv_body(Some(self.read_timeout))
            .build()
            .into()
    }
}

impl Default for UreqTransport {
    fn default() -> Self {
        Self::from_settings(&ClientSettings::default())
    }
}

impl Transport for UreqTransport {
    fn post_json(
        &self,
        request: &OutboundRequest<'_>,
    ) -> Result<TransportResponse, Report<InternalCallError>> {
        let agent = self.agent();

        let mut builder = agent
            .post(request.url)
            .header("Content-Type", "application/json");
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send(request.body.as_bytes()).map_err(|e| {
            Report::new(InternalCallError::transport(format!(
                "{}: {}",
                MSG_TRANSPORT_FAILURE, e
            )))
        })?;

        let status = response.status().as_u16();
        let body = response.into_body().read_to_string().map_err(|e| {
            Report::new(InternalCallError::transport(format!(
                "{}: failed to read response: {}",
                MSG_TRANSPORT_FAILURE, e
            )))
        })?;

        Ok(TransportResponse { status, body })
    }
}

/// Cooperative cancellation for an outbound call.
///
/// Checked before the request is sent and again before the response is
/// decoded; a call already blocked in the transport runs until its timeouts.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
