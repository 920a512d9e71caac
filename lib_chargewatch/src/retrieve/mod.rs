//! # Data Retrieval Module
//!
//! Generic HTTP plumbing for the vendor client: one pooled `reqwest` client
//! per process, wrapped in `reqwest-middleware` with an exponential-backoff
//! retry layer, plus the mapping from transport outcomes onto [`SyncError`].
//!
//! The status client in `stations` owns request construction and payload
//! validation. This module only moves bytes and classifies failures.
//!
//! [`SyncError`]: crate::errors::SyncError

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Pooled HTTP API client with retry middleware and failure classification.
pub mod ky_http;
