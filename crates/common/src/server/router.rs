//! Explicit registration of verified operations by path.

use std::collections::BTreeMap;

use error_stack::Report;
use http::header::{self, HeaderValue};
use http::{Method, Request, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::context::CallContext;
use crate::envelope::Envelope;
use crate::error::{InternalCallError, OperationError};
use crate::server::verifier::{InboundRequest, InboundVerifier};

type Handler = Box<
    dyn Fn(&InboundVerifier, &InboundRequest<'_>, BTreeMap<String, String>) -> Envelope<Value>
        + Send
        + Sync,
>;

struct Route {
    handler: Handler,
}

/// Dispatches POSTed internal calls to registered operations, running every
/// call through the [`InboundVerifier`] first.
pub struct InternalRouter {
    verifier: InboundVerifier,
    routes: matchit::Router<Route>,
}

impl InternalRouter {
    #[must_use]
    pub fn new(verifier: InboundVerifier) -> Self {
        Self {
            verifier,
            routes: matchit::Router::new(),
        }
    }

    /// Registers `op` under `path`. Path parameters use `matchit` syntax
    /// (`/accounts/{id}`) and are readable through [`CallContext::path_param`].
    /// The path template doubles as the operation name in audit records.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `path` is malformed or conflicts with a
    /// route registered earlier.
    pub fn route<A, T, E, F>(mut self, path: &str, op: F) -> Result<Self, Report<InternalCallError>>
    where
        A: DeserializeOwned,
        T: Serialize,
        E: Into<OperationError>,
        F: Fn(A, &CallContext) -> Result<T, E> + Send + Sync + 'static,
    {
        let operation = path.to_string();
        let handler: Handler = Box::new(
            move |verifier: &InboundVerifier,
                  request: &InboundRequest<'_>,
                  params: BTreeMap<String, String>| {
                verifier.handle_with_path_params(request, &operation, params, &op)
            },
        );

        self.routes
            .insert(path, Route { handler })
            .map_err(|e| {
                Report::new(InternalCallError::configuration(format!(
                    "invalid route '{}': {}",
                    path, e
                )))
            })?;
        Ok(self)
    }

    /// Serves one HTTP request.
    ///
    /// Non-POST requests get 405 and unknown paths 404; every call that
    /// reaches an operation's path is answered 200 with a JSON envelope.
    #[must_use]
    pub fn handle(&self, request: &Request<Vec<u8>>) -> Response<Vec<u8>> {
        if request.method() != Method::POST {
            log::warn!(
                "{} {} is not allowed on the internal router",
                request.method(),
                request.uri().path()
            );
            let mut response = status_response(StatusCode::METHOD_NOT_ALLOWED);
            response
                .headers_mut()
                .insert(header::ALLOW, HeaderValue::from_static("POST"));
            return response;
        }

        let path = request.uri().path();
        let Ok(matched) = self.routes.at(path) else {
            log::warn!("no internal route for {}", path);
            return status_response(StatusCode::NOT_FOUND);
        };

        let params = matched
            .params
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect();

        let inbound = InboundRequest {
            uri: path,
            headers: request.headers(),
            body: request.body(),
        };
        let envelope = (matched.value.handler)(&self.verifier, &inbound, params);

        json_response(&envelope)
    }
}

fn status_response(status: StatusCode) -> Response<Vec<u8>> {
    let mut response = Response::new(Vec::new());
    *response.status_mut() = status;
    response
}

fn json_response(envelope: &Envelope<Value>) -> Response<Vec<u8>> {
    let body = serde_json::to_vec(envelope).unwrap_or_else(|e| {
        log::error!("failed to encode envelope: {}", e);
        br#"{"code":501,"msg":"failed to encode envelope"}"#.to_vec()
    });

    let mut response = Response::new(body);
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}
