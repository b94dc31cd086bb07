//! Shared setup for live tests

use std::path::PathBuf;

use replica_convergence::config::{HarnessConfig, CONFIG_ENV};
use replica_convergence::retry::BackoffPolicy;
use replica_convergence::session::Session;

/// Load the harness config named by `CONVERGENCE_CONFIG`, with credentials
/// from the environment filled in.
pub fn live_config() -> HarnessConfig {
    let path = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
    let mut config = HarnessConfig::load(path.as_deref()).expect("failed to load harness config");

    if let Ok(host) = std::env::var("RANCHER_HOST") {
        config.rancher.host = host;
    }
    if let Ok(token) = std::env::var("RANCHER_ADMIN_TOKEN") {
        config.rancher.admin_token = token;
    }
    config.validate().expect("harness config is not runnable");
    config
}

/// Acquire a session for the live config
pub async fn live_session(config: &HarnessConfig) -> Session {
    Session::acquire(config)
        .await
        .expect("failed to acquire session")
}

pub fn policy(config: &HarnessConfig) -> BackoffPolicy {
    config.backoff.to_policy().expect("invalid backoff")
}
