//! Replay protection for inbound calls.
//!
//! A [`ReplayGuard`] reserves each `requestId` for a fixed TTL with a single
//! atomic test-and-set. Backends must not split this into a lookup followed by
//! a write: two concurrent deliveries of the same request would both pass.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use error_stack::Report;

use crate::error::InternalCallError;

/// Atomic reserve-with-TTL over a shared key-value store.
pub trait ReplayGuard: Send + Sync {
    /// Returns `true` iff this call inserted the marker for `key`, `false` if
    /// an unexpired marker already existed.
    ///
    /// # Errors
    ///
    /// Returns a store error if the backend cannot be reached.
    fn reserve(&self, key: &str, ttl: Duration) -> Result<bool, Report<InternalCallError>>;
}

const DEFAULT_SWEEP_INTERVAL: usize = 1024;

#[derive(Debug, Default)]
struct Markers {
    expiries: HashMap<String, Instant>,
    inserts_since_sweep: usize,
}

/// Process-local replay guard.
///
/// Suitable when a single process serves all calls for a key pair; multiple
/// replicas need a shared backend implementing [`ReplayGuard`].
#[derive(Debug)]
pub struct InMemoryReplayGuard {
    markers: Mutex<Markers>,
    sweep_interval: usize,
}

impl InMemoryReplayGuard {
    #[must_use]
    pub fn new() -> Self {
        Self::with_sweep_interval(DEFAULT_SWEEP_INTERVAL)
    }

    /// Expired markers are purged every `sweep_interval` insertions.
    #[must_use]
    pub fn with_sweep_interval(sweep_interval: usize) -> Self {
        Self {
            markers: Mutex::new(Markers::default()),
            sweep_interval: sweep_interval.max(1),
        }
    }

    /// Number of markers currently held, expired or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.markers
            .lock()
            .map(|markers| markers.expiries.len())
            .unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryReplayGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayGuard for InMemoryReplayGuard {
    fn reserve(&self, key: &str, ttl: Duration) -> Result<bool, Report<InternalCallError>> {
        let mut markers = self.markers.lock().map_err(|_| {
            Report::new(InternalCallError::Store {
                message: "replay marker lock poisoned".into(),
            })
        })?;

        let now = Instant::now();
        if let Some(expires_at) = markers.expiries.get(key) {
            if *expires_at > now {
                return Ok(false);
            }
        }

        let Some(expires_at) = now.checked_add(ttl) else {
            return Err(Report::new(InternalCallError::Store {
                message: format!("replay marker ttl {:?} is out of range", ttl),
            }));
        };
        markers.expiries.insert(key.to_string(), expires_at);
        markers.inserts_since_sweep += 1;
        if markers.inserts_since_sweep >= self.sweep_interval {
            markers.expiries.retain(|_, expires_at| *expires_at > now);
            markers.inserts_since_sweep = 0;
            log::debug!(
                "swept replay markers, {} still active",
                markers.expiries.len()
            );
        }

        Ok(true)
    }
}
