//! Inbound half of the protocol: the verification pipeline and the router
//! that puts operations behind it.

pub mod router;
pub mod verifier;

pub use router::InternalRouter;
pub use verifier::{InboundRequest, InboundVerifier, InboundVerifierBuilder};
