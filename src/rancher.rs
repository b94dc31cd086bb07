//! Control-plane HTTP client: kubeconfig generation and release metadata.
//!
//! The observed value the harness polls for is the default Kubernetes version
//! of a cluster type. Two readers provide it:
//!
//! - [`DefaultVersionSettingReader`] reads the `<distro>-default-version`
//!   setting, which the control plane recomputes from its metadata source.
//! - [`RancherVersionReader`] takes the newest release listed at
//!   `/v1-<distro>-release/releases`.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::config::RancherConfig;
use crate::settings::SettingsApi;
use crate::Error;

/// Request timeout for control-plane HTTP calls
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Cluster distributions whose release metadata is served by the control plane
pub const SUPPORTED_CLUSTER_TYPES: &[&str] = &["rke2", "k3s"];

/// Reads the default (newest) Kubernetes versions for a cluster type
#[cfg_attr(test, automock)]
#[async_trait]
pub trait VersionReader: Send + Sync {
    /// Versions newest first; non-empty `filters` are returned unchanged
    async fn default_versions(
        &self,
        cluster_type: &str,
        filters: &[String],
    ) -> Result<Vec<String>, Error>;
}

#[derive(Debug, Deserialize)]
struct ReleaseList {
    #[serde(default)]
    data: Vec<Release>,
}

#[derive(Debug, Deserialize)]
struct Release {
    id: String,
}

#[derive(Debug, Deserialize)]
struct GeneratedKubeconfig {
    config: String,
}

/// Authenticated HTTP client for the control plane API
#[derive(Clone)]
pub struct RancherClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl RancherClient {
    /// Build a client from connection settings
    pub fn new(config: &RancherConfig) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.insecure)
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url(&config.host),
            token: config.admin_token.clone(),
        })
    }

    /// Base URL every request is made against
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        context: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<T, Error> {
        let response = request
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| Error::api(context, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("{status} - {body}");
            return Err(if status.as_u16() == 404 {
                Error::not_found("endpoint", context)
            } else if status.is_server_error() || status.as_u16() == 429 {
                Error::api(context, message)
            } else {
                Error::api_permanent(context, message)
            });
        }

        response.json().await.map_err(|e| Error::Decode {
            resource: context.to_string(),
            message: e.to_string(),
        })
    }

    /// Ask the control plane for a kubeconfig of one of its managed clusters
    pub async fn generate_kubeconfig(&self, cluster_id: &str) -> Result<String, Error> {
        let url = format!(
            "{}/v3/clusters/{}?action=generateKubeconfig",
            self.base_url, cluster_id
        );
        debug!(url = %url, "Generating kubeconfig");
        let generated: GeneratedKubeconfig = self
            .send_json(
                &format!("generate kubeconfig for cluster {cluster_id}"),
                self.http.post(&url),
            )
            .await?;
        Ok(generated.config)
    }

    /// Release ids published for a cluster type, in server order
    pub async fn releases(&self, cluster_type: &str) -> Result<Vec<String>, Error> {
        if !SUPPORTED_CLUSTER_TYPES.contains(&cluster_type) {
            return Err(Error::config(format!(
                "unsupported cluster type '{cluster_type}' (expected one of {})",
                SUPPORTED_CLUSTER_TYPES.join(", ")
            )));
        }
        let url = format!("{}/v1-{}-release/releases", self.base_url, cluster_type);
        let list: ReleaseList = self
            .send_json(&format!("list {cluster_type} releases"), self.http.get(&url))
            .await?;
        Ok(list.data.into_iter().map(|r| r.id).collect())
    }
}

fn base_url(host: &str) -> String {
    let host = host.trim().trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("https://{host}")
    }
}

/// [`VersionReader`] backed by the control plane's release endpoints
pub struct RancherVersionReader {
    client: RancherClient,
}

impl RancherVersionReader {
    /// Create a reader over the given client
    pub fn new(client: RancherClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl VersionReader for RancherVersionReader {
    async fn default_versions(
        &self,
        cluster_type: &str,
        filters: &[String],
    ) -> Result<Vec<String>, Error> {
        if !filters.is_empty() {
            return Ok(filters.to_vec());
        }
        let mut versions = self.client.releases(cluster_type).await?;
        sort_newest_first(&mut versions);
        Ok(versions)
    }
}

/// [`VersionReader`] backed by the `<cluster_type>-default-version` setting
pub struct DefaultVersionSettingReader {
    settings: Arc<dyn SettingsApi>,
}

impl DefaultVersionSettingReader {
    /// Create a reader over the given settings store
    pub fn new(settings: Arc<dyn SettingsApi>) -> Self {
        Self { settings }
    }
}

/// Name of the setting holding the channel default for `cluster_type`
pub fn default_version_setting(cluster_type: &str) -> String {
    format!("{cluster_type}-default-version")
}

#[async_trait]
impl VersionReader for DefaultVersionSettingReader {
    async fn default_versions(
        &self,
        cluster_type: &str,
        filters: &[String],
    ) -> Result<Vec<String>, Error> {
        if !filters.is_empty() {
            return Ok(filters.to_vec());
        }
        if !SUPPORTED_CLUSTER_TYPES.contains(&cluster_type) {
            return Err(Error::config(format!(
                "unsupported cluster type '{cluster_type}' (expected one of {})",
                SUPPORTED_CLUSTER_TYPES.join(", ")
            )));
        }

        let name = default_version_setting(cluster_type);
        let raw = self.settings.get(&name).await?;
        let value = match raw.value.trim() {
            "" => raw.default.trim(),
            value => value,
        };
        if value.is_empty() {
            return Err(Error::not_found("setting value", &name));
        }
        debug!(setting = %name, version = %value, "Read default version");

        let version = if value.starts_with('v') {
            value.to_string()
        } else {
            format!("v{value}")
        };
        Ok(vec![version])
    }
}

fn parse_version(id: &str) -> Option<semver::Version> {
    semver::Version::parse(id.strip_prefix('v').unwrap_or(id)).ok()
}

/// Order release ids newest first by semantic version.
///
/// Ids that don't parse keep their relative order after all parsed ones.
pub fn sort_newest_first(versions: &mut [String]) {
    versions.sort_by(|a, b| match (parse_version(a), parse_version(b)) {
        (Some(a), Some(b)) => b.cmp(&a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
}

/// Command that dumps a replica's in-memory release list for `cluster_type`
pub fn release_list_command(cluster_type: &str) -> Vec<String> {
    vec![
        "curl".to_string(),
        "--insecure".to_string(),
        format!("https://0.0.0.0/v1-{cluster_type}-release/releases"),
    ]
}
