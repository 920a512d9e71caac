//! # Request Signing
//!
//! The vendor recomputes a keyed hash over a canonical form of every request
//! and rejects calls whose `signature` header does not match. Canonicalization
//! is therefore part of the wire contract and must stay byte-stable.

/// HMAC-MD5 signatures over canonicalized request parameters.
pub mod signature;

pub use signature::{canonicalize, sign, string_to_sign, RequestSigner};
