//! Live tests for the convergence harness
//!
//! Each test tells the story of one step an operator relies on when checking
//! that a setting change has reached every control-plane replica.
//!
//! - `components`: Stories about the individual building blocks (reading the
//!   setting, scaling, probing replicas) against the real APIs
//!
//! - `metadata_propagation`: The full run, from priming the metadata source
//!   to the per-replica verdict, including restoring the cluster afterwards

mod components;
mod helpers;
mod metadata_propagation;
