//! replica-convergence - end-to-end convergence checks for a replicated control plane
//!
//! The harness changes a piece of shared configuration, waits with bounded
//! exponential backoff for its effect to become observable, and then asks
//! every replica of the service whether it sees the same effect. A change
//! that produces no observable difference is a pass, not a failure.
//!
//! # Modules
//!
//! - [`retry`] - Backoff policy and the generic `poll_until` convergence wait
//! - [`settings`] - Read-modify-write of control-plane settings
//! - [`scale`] - Deployment scaling with a wait for ready replicas
//! - [`inspect`] - Per-replica remote command execution
//! - [`rancher`] - Control-plane HTTP client and default-version reader
//! - [`verify`] - The mutate, poll, inspect state machine and its verdict
//! - [`session`] - Explicit client lifecycle with ordered cleanup
//! - [`scenario`] - The metadata-source propagation run
//! - [`config`] - Harness configuration file and overrides
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod inspect;
pub mod rancher;
pub mod retry;
pub mod scale;
pub mod scenario;
pub mod session;
pub mod settings;
pub mod verify;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
