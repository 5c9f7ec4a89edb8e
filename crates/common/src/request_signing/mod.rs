//! Request signing utilities for internal calls.
//!
//! This module provides RSA (PKCS#1 v1.5, SHA-256) signing of the canonical
//! `requestId=<id>&timestamp=<ts>` content, key loading and key generation.

pub mod keys;
pub mod signing;

pub use keys::*;
pub use signing::*;
