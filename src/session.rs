//! Explicitly acquired harness session.
//!
//! A [`Session`] owns the cluster client and the control-plane client for one
//! run, hands out the components built on them, and remembers how to undo
//! what the run changed. [`Session::release`] replays those undo actions in
//! reverse order.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::{error, info, warn};

use crate::config::{HarnessConfig, VersionSource};
use crate::inspect::{KubePodApi, ReplicaInspector};
use crate::rancher::{
    DefaultVersionSettingReader, RancherClient, RancherVersionReader, VersionReader,
};
use crate::retry::BackoffPolicy;
use crate::scale::{KubeDeploymentApi, ReplicaScaler, ScaleTarget};
use crate::settings::{ConfigMutator, KubeSettingsApi, SettingsApi};
use crate::Error;

/// Connect timeout for the cluster client
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Read timeout for the cluster client; exec streams stay open for a while
pub const READ_TIMEOUT: Duration = Duration::from_secs(120);

/// A change made during the run that should be undone on release
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CleanupAction {
    /// Put a setting key back to the value it had
    RestoreSetting {
        /// Setting name
        name: String,
        /// Key inside the setting
        key: String,
        /// Previous value; `None` means the key was absent and is removed
        value: Option<String>,
    },
    /// Scale a deployment back to its previous replica count
    RestoreReplicas {
        /// Deployment namespace
        namespace: String,
        /// Deployment name
        name: String,
        /// Desired replica count before the run
        replicas: i32,
    },
}

impl fmt::Display for CleanupAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RestoreSetting {
                name,
                key,
                value: Some(value),
            } => write!(f, "restore setting {name}.{key} to {value}"),
            Self::RestoreSetting {
                name,
                key,
                value: None,
            } => write!(f, "remove setting {name}.{key}"),
            Self::RestoreReplicas {
                namespace,
                name,
                replicas,
            } => write!(f, "scale {namespace}/{name} back to {replicas}"),
        }
    }
}

/// Clients and pending cleanup for one harness run
pub struct Session {
    client: Client,
    rancher: RancherClient,
    cleanup: Vec<CleanupAction>,
}

impl Session {
    /// Connect to the control plane and the cluster it runs on.
    ///
    /// Uses `config.kubeconfig` when set, otherwise asks the control plane to
    /// generate a kubeconfig for `rancher.clusterId`.
    pub async fn acquire(config: &HarnessConfig) -> Result<Self, Error> {
        let rancher = RancherClient::new(&config.rancher)?;

        let kubeconfig = match &config.kubeconfig {
            Some(path) => read_kubeconfig(path)?,
            None => {
                info!(cluster = %config.rancher.cluster_id, "Generating kubeconfig");
                let yaml = rancher.generate_kubeconfig(&config.rancher.cluster_id).await?;
                Kubeconfig::from_yaml(&yaml).map_err(|e| Error::Decode {
                    resource: format!("kubeconfig for cluster {}", config.rancher.cluster_id),
                    message: e.to_string(),
                })?
            }
        };
        let client = create_client(kubeconfig).await?;

        info!(rancher = %rancher.base_url(), "Session acquired");
        Ok(Self::from_parts(client, rancher))
    }

    /// Assemble a session from already-built clients
    pub fn from_parts(client: Client, rancher: RancherClient) -> Self {
        Self {
            client,
            rancher,
            cleanup: Vec::new(),
        }
    }

    /// Setting reader/writer backed by the cluster
    pub fn settings(&self) -> ConfigMutator {
        ConfigMutator::new(self.settings_api())
    }

    /// Deployment scaler backed by the cluster
    pub fn scaler(&self) -> ReplicaScaler {
        ReplicaScaler::new(Arc::new(KubeDeploymentApi::new(self.client.clone())))
    }

    /// Replica inspector backed by the cluster's exec channel
    pub fn inspector(&self) -> ReplicaInspector {
        ReplicaInspector::new(Arc::new(KubePodApi::new(self.client.clone())))
    }

    /// Reader of the observed default version, from the configured source
    pub fn version_reader(&self, source: VersionSource) -> Arc<dyn VersionReader> {
        match source {
            VersionSource::DefaultSetting => {
                Arc::new(DefaultVersionSettingReader::new(self.settings_api()))
            }
            VersionSource::NewestRelease => {
                Arc::new(RancherVersionReader::new(self.rancher.clone()))
            }
        }
    }

    fn settings_api(&self) -> Arc<dyn SettingsApi> {
        Arc::new(KubeSettingsApi::new(self.client.clone()))
    }

    /// Remember a change to undo on release
    pub fn register_cleanup(&mut self, action: CleanupAction) {
        info!(action = %action, "Registered cleanup");
        self.cleanup.push(action);
    }

    /// Run every registered cleanup action, newest first, and drop the session.
    ///
    /// All actions are attempted even when some fail; failures are returned
    /// together as [`Error::Cleanup`].
    pub async fn release(mut self, policy: &BackoffPolicy) -> Result<(), Error> {
        let actions = std::mem::take(&mut self.cleanup);
        run_cleanup(actions, &self.settings(), &self.scaler(), policy).await
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.cleanup.is_empty() {
            warn!(
                pending = self.cleanup.len(),
                "Session dropped without release; cleanup actions were not run"
            );
        }
    }
}

/// Run `actions` in reverse registration order.
pub async fn run_cleanup(
    actions: Vec<CleanupAction>,
    settings: &ConfigMutator,
    scaler: &ReplicaScaler,
    policy: &BackoffPolicy,
) -> Result<(), Error> {
    let mut failures = Vec::new();

    for action in actions.into_iter().rev() {
        let result = match &action {
            CleanupAction::RestoreSetting {
                name,
                key,
                value: Some(value),
            } => settings.update(name, key, value).await.map(|_| ()),
            CleanupAction::RestoreSetting {
                name,
                key,
                value: None,
            } => settings.remove(name, key).await.map(|_| ()),
            CleanupAction::RestoreReplicas {
                namespace,
                name,
                replicas,
            } => scaler
                .scale_to(&ScaleTarget::new(namespace, name, *replicas), policy)
                .await
                .map(|_| ()),
        };

        match result {
            Ok(()) => info!(action = %action, "Cleanup complete"),
            Err(e) => {
                error!(action = %action, error = %e, "Cleanup failed");
                failures.push(format!("{action}: {e}"));
            }
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(Error::Cleanup { failures })
    }
}

fn read_kubeconfig(path: &Path) -> Result<Kubeconfig, Error> {
    Kubeconfig::read_from(path).map_err(|e| {
        Error::config(format!(
            "failed to read kubeconfig {}: {}",
            path.display(),
            e
        ))
    })
}

async fn create_client(kubeconfig: Kubeconfig) -> Result<Client, Error> {
    let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::config(format!("failed to load kubeconfig: {e}")))?;
    config.connect_timeout = Some(CONNECT_TIMEOUT);
    config.read_timeout = Some(READ_TIMEOUT);
    Client::try_from(config).map_err(|e| Error::config(format!("failed to create client: {e}")))
}
