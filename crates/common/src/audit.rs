//! Per-call audit records.
//!
//! Each outbound and inbound call accumulates one [`AuditRecord`] and hands it
//! to the configured [`AuditLogger`] exactly once when the call finishes,
//! whichever way it finishes.

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use serde_json::Value;

pub const DIRECTION_SEND: &str = "send";
pub const DIRECTION_RECEIVE: &str = "receive";

/// Ordered field name to JSON value mapping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuditRecord {
    fields: Vec<(String, Value)>,
}

impl AuditRecord {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `key`, keeping its original position if it was already present.
    pub fn add<V: Serialize>(&mut self, key: &str, value: V) -> &mut Self {
        let value = serde_json::to_value(value)
            .unwrap_or_else(|e| Value::String(format!("<unserializable: {}>", e)));

        match self.fields.iter_mut().find(|(k, _)| k == key) {
            Some((_, existing)) => *existing = value,
            None => self.fields.push((key.to_string(), value)),
        }
        self
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(k, _)| k.as_str())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl Serialize for AuditRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (key, value) in &self.fields {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

/// Sink for audit records.
pub trait AuditLogger: Send + Sync {
    fn record(&self, record: &AuditRecord);
}

/// Writes each record as one JSON line through the `log` facade.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAuditLogger;

impl AuditLogger for LogAuditLogger {
    fn record(&self, record: &AuditRecord) {
        match serde_json::to_string(record) {
            Ok(json) => log::info!(target: "internal_call::audit", "{}", json),
            Err(e) => log::error!("Failed to serialize audit record: {}", e),
        }
    }
}

/// Accumulates a record for one call and flushes it when dropped.
pub(crate) struct AuditScope<'a> {
    logger: Option<&'a dyn AuditLogger>,
    record: AuditRecord,
}

impl<'a> AuditScope<'a> {
    pub(crate) fn new(logger: Option<&'a dyn AuditLogger>, direction: &str) -> Self {
        let mut record = AuditRecord::new();
        if logger.is_some() {
            record.add("direction", direction);
        }
        Self { logger, record }
    }

    /// Skips serialization entirely when no logger is configured.
    pub(crate) fn add<V: Serialize>(&mut self, key: &str, value: V) -> &mut Self {
        if self.logger.is_some() {
            self.record.add(key, value);
        }
        self
    }
}

impl Drop for AuditScope<'_> {
    fn drop(&mut self) {
        if let Some(logger) = self.logger {
            logger.record(&self.record);
        }
    }
}
