//! Harness configuration.
//!
//! Loaded from an optional YAML file, then overridden by command-line flags
//! and environment variables. Every section has defaults, so an empty file
//! (or no file) describes the metadata-URL propagation check against a
//! standard control-plane install:
//!
//! ```yaml
//! rancher:
//!   host: rancher.example.com
//!   adminToken: token-abcde:secret
//!   insecure: true
//! target:
//!   replicas: 3
//! setting:
//!   primeValue: https://releases.rancher.com/kontainer-driver-metadata/dev-v2.8/data.json
//!   targetValue: https://releases.rancher.com/kontainer-driver-metadata/release-v2.8/data.json
//! versions:
//!   source: default-setting
//! backoff:
//!   initialDelayMs: 1000
//!   factor: 2.0
//!   steps: 7
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::BackoffPolicy;
use crate::{Error, Result};

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "CONVERGENCE_CONFIG";

/// Namespace of the control-plane deployment
pub const DEFAULT_NAMESPACE: &str = "cattle-system";
/// Control-plane deployment name
pub const DEFAULT_DEPLOYMENT: &str = "rancher";
/// Label selector matching control-plane pods
pub const DEFAULT_LABEL_SELECTOR: &str = "app=rancher";
/// Container commands are executed in
pub const DEFAULT_CONTAINER: &str = "rancher";
/// Setting holding the metadata source
pub const DEFAULT_SETTING: &str = "rke-metadata-config";
/// Key of the metadata URL inside the setting
pub const DEFAULT_SETTING_KEY: &str = "url";
/// Metadata source applied before the baseline is taken
pub const DEV_METADATA_URL: &str =
    "https://releases.rancher.com/kontainer-driver-metadata/dev-v2.8/data.json";
/// Metadata source whose effect is verified
pub const RELEASE_METADATA_URL: &str =
    "https://releases.rancher.com/kontainer-driver-metadata/release-v2.8/data.json";

/// Complete harness configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct HarnessConfig {
    /// Control plane connection
    pub rancher: RancherConfig,
    /// Kubeconfig for the cluster running the control plane. When unset, one
    /// is generated through the control plane for `rancher.clusterId`.
    pub kubeconfig: Option<PathBuf>,
    /// Deployment whose replicas are verified
    pub target: TargetConfig,
    /// Setting that is mutated
    pub setting: SettingConfig,
    /// How the observed value is read
    pub versions: VersionConfig,
    /// Retry schedule for every wait in the run
    pub backoff: BackoffConfig,
    /// Undo the run's mutations when the session is released
    pub restore_on_exit: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            rancher: RancherConfig::default(),
            kubeconfig: None,
            target: TargetConfig::default(),
            setting: SettingConfig::default(),
            versions: VersionConfig::default(),
            backoff: BackoffConfig::default(),
            restore_on_exit: true,
        }
    }
}

/// Control plane connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct RancherConfig {
    /// Host name or base URL
    pub host: String,
    /// Bearer token
    pub admin_token: String,
    /// Skip TLS verification
    pub insecure: bool,
    /// Managed cluster the control plane itself runs on
    pub cluster_id: String,
}

impl Default for RancherConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            admin_token: String::new(),
            insecure: true,
            cluster_id: "local".to_string(),
        }
    }
}

/// Deployment under test
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct TargetConfig {
    /// Namespace of the deployment and its pods
    pub namespace: String,
    /// Deployment that gets scaled
    pub deployment: String,
    /// Selects the replicas to inspect
    pub label_selector: String,
    /// Container the command runs in
    pub container: String,
    /// Replica count to scale to before verifying
    pub replicas: i32,
    /// Per-replica command; empty means the release list command for the cluster type
    pub command: Vec<String>,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            deployment: DEFAULT_DEPLOYMENT.to_string(),
            label_selector: DEFAULT_LABEL_SELECTOR.to_string(),
            container: DEFAULT_CONTAINER.to_string(),
            replicas: 3,
            command: Vec::new(),
        }
    }
}

/// Setting mutated by the run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct SettingConfig {
    /// Setting resource name
    pub name: String,
    /// Key inside the setting's JSON value
    pub key: String,
    /// Applied before the baseline is read
    pub prime_value: Option<String>,
    /// Applied after the baseline; its effect is what gets verified
    pub target_value: String,
}

impl Default for SettingConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_SETTING.to_string(),
            key: DEFAULT_SETTING_KEY.to_string(),
            prime_value: Some(DEV_METADATA_URL.to_string()),
            target_value: RELEASE_METADATA_URL.to_string(),
        }
    }
}

/// Observed-value lookup
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct VersionConfig {
    /// Distribution whose default version is observed (`rke2` or `k3s`)
    pub cluster_type: String,
    /// Explicit versions; when non-empty they are returned as the observation
    pub filters: Vec<String>,
    /// Where the default version is read from
    pub source: VersionSource,
}

impl Default for VersionConfig {
    fn default() -> Self {
        Self {
            cluster_type: "rke2".to_string(),
            filters: Vec::new(),
            source: VersionSource::default(),
        }
    }
}

/// Source of the observed default version
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum VersionSource {
    /// The `<clusterType>-default-version` setting
    #[default]
    DefaultSetting,
    /// The newest entry of the control plane's release list
    NewestRelease,
}

/// Serialized form of [`BackoffPolicy`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct BackoffConfig {
    /// Delay before the first retry
    pub initial_delay_ms: u64,
    /// Multiplier applied to the delay after each attempt
    pub factor: f64,
    /// Maximum number of attempts
    pub steps: u32,
    /// Upper bound on a single delay
    pub max_delay_ms: Option<u64>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            factor: 2.0,
            steps: 7,
            max_delay_ms: None,
        }
    }
}

impl BackoffConfig {
    /// Build the validated policy
    pub fn to_policy(&self) -> Result<BackoffPolicy> {
        let policy = BackoffPolicy::new(
            Duration::from_millis(self.initial_delay_ms),
            self.factor,
            self.steps,
        )?;
        Ok(match self.max_delay_ms {
            Some(ms) => policy.with_max_delay(Duration::from_millis(ms)),
            None => policy,
        })
    }
}

impl HarnessConfig {
    /// Load from a YAML file, or defaults when no path is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_yaml(&data)
            .map_err(|e| Error::config(format!("failed to parse {}: {}", path.display(), e)))
    }

    /// Parse from YAML text
    pub fn from_yaml(yaml: &str) -> std::result::Result<Self, serde_yaml::Error> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml)
    }

    /// Reject configurations that cannot produce a meaningful run
    pub fn validate(&self) -> Result<()> {
        if self.rancher.host.trim().is_empty() {
            return Err(Error::config("rancher.host is required"));
        }
        if self.rancher.admin_token.is_empty() {
            return Err(Error::config("rancher.adminToken is required"));
        }
        if self.kubeconfig.is_none() && self.rancher.cluster_id.is_empty() {
            return Err(Error::config(
                "either kubeconfig or rancher.clusterId must be set",
            ));
        }
        if self.target.replicas < 1 {
            return Err(Error::config(format!(
                "target.replicas must be at least 1, got {}",
                self.target.replicas
            )));
        }
        if self.setting.name.is_empty() || self.setting.key.is_empty() {
            return Err(Error::config("setting.name and setting.key are required"));
        }
        if self.setting.target_value.is_empty() {
            return Err(Error::config("setting.targetValue is required"));
        }
        self.backoff.to_policy()?;
        Ok(())
    }

    /// Command run in every replica
    pub fn replica_command(&self) -> Vec<String> {
        if self.target.command.is_empty() {
            crate::rancher::release_list_command(&self.versions.cluster_type)
        } else {
            self.target.command.clone()
        }
    }
}

/// Values supplied on the command line or through the environment.
///
/// `None` leaves the file value in place.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Replaces `rancher.host`
    pub rancher_host: Option<String>,
    /// Replaces `rancher.adminToken`
    pub admin_token: Option<String>,
    /// Replaces `rancher.insecure`
    pub insecure: Option<bool>,
    /// Replaces `kubeconfig`
    pub kubeconfig: Option<PathBuf>,
    /// Replaces `target.replicas`
    pub replicas: Option<i32>,
    /// Replaces `setting.targetValue`
    pub target_value: Option<String>,
    /// Replaces `restoreOnExit`
    pub restore_on_exit: Option<bool>,
}

impl ConfigOverrides {
    /// Apply every set override to `config`
    pub fn apply_to(self, config: &mut HarnessConfig) {
        if let Some(host) = self.rancher_host {
            config.rancher.host = host;
        }
        if let Some(token) = self.admin_token {
            config.rancher.admin_token = token;
        }
        if let Some(insecure) = self.insecure {
            config.rancher.insecure = insecure;
        }
        if let Some(path) = self.kubeconfig {
            config.kubeconfig = Some(path);
        }
        if let Some(replicas) = self.replicas {
            config.target.replicas = replicas;
        }
        if let Some(value) = self.target_value {
            config.setting.target_value = value;
        }
        if let Some(restore) = self.restore_on_exit {
            config.restore_on_exit = restore;
        }
    }
}
