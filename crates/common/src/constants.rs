use std::time::Duration;

use http::header::HeaderName;

pub const HEADER_SIGN: HeaderName = HeaderName::from_static("sign");
pub const HEADER_REQUEST_ID: HeaderName = HeaderName::from_static("requestid");
pub const HEADER_TIMESTAMP: HeaderName = HeaderName::from_static("timestamp");

pub const DEFAULT_FRESHNESS_WINDOW: Duration = Duration::from_millis(10_000);
pub const DEFAULT_NONCE_TTL: Duration = Duration::from_secs(10);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(2_000);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(10_000);

pub const DEFAULT_RSA_KEY_BITS: usize = 2048;
pub const MIN_RSA_KEY_BITS: usize = 1024;

pub const MSG_SIGNATURE_PARAMS_MISSING: &str = "signature parameters missing";
pub const MSG_SIGNATURE_PARAMS_INVALID: &str = "signature parameters invalid";
pub const MSG_VERIFICATION_FAILED: &str = "verification failed";
pub const MSG_REQUEST_EXPIRED: &str = "request expired";
pub const MSG_REQUEST_FROM_FUTURE: &str = "request timestamp in the future";
pub const MSG_DUPLICATE_REQUEST: &str = "duplicate request";
pub const MSG_INVALID_BODY: &str = "invalid request body";
pub const MSG_DEADLINE_EXCEEDED: &str = "deadline exceeded";
pub const MSG_TRANSPORT_FAILURE: &str = "transport failure";
