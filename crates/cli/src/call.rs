//! Issue a signed call against a live endpoint.

use std::path::Path;
use std::sync::Arc;

use internal_call_common::audit::LogAuditLogger;
use internal_call_common::client::InternalCallClient;
use internal_call_common::context::{PropagatedIdentity, StaticPropagator};
use internal_call_common::envelope::CallOutput;
use serde_json::Value;

use crate::config::load_keys;
use crate::error::CliError;

/// Parse `name=value` identity header arguments.
pub(crate) fn parse_headers(pairs: &[String]) -> Result<PropagatedIdentity, CliError> {
    pairs
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
                .filter(|(name, _)| !name.is_empty())
                .ok_or_else(|| CliError::Config(format!("Invalid header '{}', expected name=value", pair)))
        })
        .collect()
}

fn parse_params(params: Option<&str>) -> Result<Value, CliError> {
    match params {
        Some(raw) => Ok(serde_json::from_str(raw)?),
        None => Ok(Value::Object(serde_json::Map::new())),
    }
}

pub fn call(
    file: &Path,
    url: &str,
    params: Option<&str>,
    headers: &[String],
    verbose: bool,
) -> Result<(), CliError> {
    let (settings, keys) = load_keys(file, verbose)?;
    let params = parse_params(params)?;
    let identity = parse_headers(headers)?;

    let mut builder = InternalCallClient::from_settings(&settings, &keys)?;
    if !identity.is_empty() {
        builder = builder.propagator(Arc::new(StaticPropagator::new(identity)));
    }
    if verbose {
        builder = builder.audit_logger(Arc::new(LogAuditLogger));
        println!("POST {}", url);
    }
    let client = builder.build();

    let output: CallOutput<Value> = client.call(url, &params)?;
    let rendered = match output {
        CallOutput::Empty => None,
        CallOutput::Single(value) => Some(value),
        CallOutput::List(values) => Some(Value::Array(values)),
    };

    match rendered {
        Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        None => println!("(no result)"),
    }
    Ok(())
}
