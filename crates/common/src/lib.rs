//! Signed service-to-service calls.
//!
//! A caller signs `requestId=<id>&timestamp=<ms>` with its RSA private key and
//! sends the signature in headers next to a JSON body. The callee verifies the
//! signature, rejects stale and replayed requests, runs the operation and
//! answers with a `{code, msg, data}` envelope.
//!
//! # Modules
//!
//! - [`audit`]: Per-call audit records and sinks
//! - [`client`]: Outbound caller and HTTP transport
//! - [`clock`]: Wall-clock abstraction
//! - [`constants`]: Header names, defaults and protocol messages
//! - [`context`]: Identity propagation and the per-call context
//! - [`envelope`]: Response envelope and decoded call output
//! - [`error`]: Error types and the business/system split
//! - [`logging`]: `fern` logger setup for binaries
//! - [`replay`]: Replay guard over an atomic reserve-with-TTL store
//! - [`request_signing`]: RSA signing, verification and key handling
//! - [`server`]: Inbound verification pipeline and router
//! - [`settings`]: Configuration management and validation
//! - [`test_support`]: Testing utilities and mocks

pub mod audit;
pub mod client;
pub mod clock;
pub mod constants;
pub mod context;
pub mod envelope;
pub mod error;
pub mod logging;
pub mod replay;
pub mod request_signing;
pub mod server;
pub mod settings;
