//! Identity propagation across the call boundary.
//!
//! The caller's [`ContextPropagator`] turns its current identity into extra
//! request headers. On the callee the verifier reads the declared headers back
//! into a [`PropagatedIdentity`], hands it to the propagator for the duration
//! of one call and clears it afterwards, because the worker thread serving the
//! call is reused for unrelated calls.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use http::HeaderMap;
use serde::Serialize;

/// Header name to value mapping carried alongside a call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct PropagatedIdentity(BTreeMap<String, String>);

impl PropagatedIdentity {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads the `keys` headers from `headers`, skipping absent or non-UTF-8 values.
    #[must_use]
    pub fn from_headers(headers: &HeaderMap, keys: &[String]) -> Self {
        let entries = keys
            .iter()
            .filter_map(|key| {
                let value = headers.get(key.as_str())?.to_str().ok()?;
                Some((key.to_ascii_lowercase(), value.to_string()))
            })
            .collect();
        Self(entries)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into().to_ascii_lowercase(), value.into());
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(&key.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for PropagatedIdentity {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut identity = Self::new();
        for (key, value) in iter {
            identity.insert(key, value);
        }
        identity
    }
}

/// Pluggable identity/trace propagation.
pub trait ContextPropagator: Send + Sync {
    /// Header names this propagator reads on inbound calls.
    fn declared_keys(&self) -> Vec<String>;

    /// Headers to attach to an outbound call.
    fn create_outbound_headers(&self) -> PropagatedIdentity;

    /// Makes `identity` current for the inbound call being served.
    fn install_inbound_context(&self, identity: &PropagatedIdentity);

    /// Forgets whatever the last inbound call installed.
    fn clear(&self);
}

thread_local! {
    static CURRENT_IDENTITY: RefCell<Option<PropagatedIdentity>> = const { RefCell::new(None) };
}

/// Forwards the identity of the inbound call being served to any outbound
/// call made while serving it.
///
/// The installed identity is bound to the serving thread and shared by every
/// `ForwardingPropagator` on it.
#[derive(Debug, Clone)]
pub struct ForwardingPropagator {
    keys: Vec<String>,
}

impl ForwardingPropagator {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys
                .into_iter()
                .map(|k| k.into().to_ascii_lowercase())
                .collect(),
        }
    }

    /// The identity installed on this thread, if an inbound call is in progress.
    #[must_use]
    pub fn current() -> Option<PropagatedIdentity> {
        CURRENT_IDENTITY.with(|current| current.borrow().clone())
    }
}

impl ContextPropagator for ForwardingPropagator {
    fn declared_keys(&self) -> Vec<String> {
        self.keys.clone()
    }

    fn create_outbound_headers(&self) -> PropagatedIdentity {
        Self::current()
            .map(|identity| {
                identity
                    .iter()
                    .filter(|(key, _)| self.keys.iter().any(|k| k == key))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn install_inbound_context(&self, identity: &PropagatedIdentity) {
        CURRENT_IDENTITY.with(|current| *current.borrow_mut() = Some(identity.clone()));
    }

    fn clear(&self) {
        CURRENT_IDENTITY.with(|current| *current.borrow_mut() = None);
    }
}

/// Attaches a fixed identity to every outbound call, e.g. the caller's
/// service name.
#[derive(Debug, Clone, Default)]
pub struct StaticPropagator {
    identity: PropagatedIdentity,
}

impl StaticPropagator {
    #[must_use]
    pub fn new(identity: PropagatedIdentity) -> Self {
        Self { identity }
    }
}

impl ContextPropagator for StaticPropagator {
    fn declared_keys(&self) -> Vec<String> {
        self.identity.iter().map(|(k, _)| k.to_string()).collect()
    }

    fn create_outbound_headers(&self) -> PropagatedIdentity {
        self.identity.clone()
    }

    fn install_inbound_context(&self, _identity: &PropagatedIdentity) {}

    fn clear(&self) {}
}

/// Clears the propagator when created and again when dropped, so nothing
/// installed during a call survives it, even if the call unwinds.
pub(crate) struct InboundScope<'a> {
    propagator: Option<&'a dyn ContextPropagator>,
}

impl<'a> InboundScope<'a> {
    pub(crate) fn enter(propagator: Option<&'a dyn ContextPropagator>) -> Self {
        if let Some(propagator) = propagator {
            propagator.clear();
        }
        Self { propagator }
    }

    pub(crate) fn install(&self, identity: &PropagatedIdentity) {
        if let Some(propagator) = self.propagator {
            propagator.install_inbound_context(identity);
        }
    }
}

impl Drop for InboundScope<'_> {
    fn drop(&mut self) {
        if let Some(propagator) = self.propagator {
            propagator.clear();
        }
    }
}

/// Request-scoped values visible to a business operation.
#[derive(Debug, Clone)]
pub struct CallContext {
    request_id: String,
    uri: String,
    operation: String,
    identity: PropagatedIdentity,
    path_params: BTreeMap<String, String>,
    deadline: Option<Instant>,
}

impl CallContext {
    pub(crate) fn new(
        request_id: String,
        uri: String,
        operation: String,
        identity: PropagatedIdentity,
        deadline: Option<Instant>,
    ) -> Self {
        Self {
            request_id,
            uri,
            operation,
            identity,
            path_params: BTreeMap::new(),
            deadline,
        }
    }

    pub(crate) fn with_path_params(mut self, params: BTreeMap<String, String>) -> Self {
        self.path_params = params;
        self
    }

    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    #[must_use]
    pub fn operation(&self) -> &str {
        &self.operation
    }

    #[must_use]
    pub fn identity(&self) -> &PropagatedIdentity {
        &self.identity
    }

    #[must_use]
    pub fn path_param(&self, name: &str) -> Option<&str> {
        self.path_params.get(name).map(String::as_str)
    }

    /// Time left before the inbound deadline, `None` when no deadline is set.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    #[must_use]
    pub fn is_past_deadline(&self) -> bool {
        self.deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
    }
}
