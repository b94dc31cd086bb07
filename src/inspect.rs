//! Per-replica remote command execution.
//!
//! The inspector takes one snapshot of the replicas behind a label selector
//! and runs the same command in each of them. A failing replica is recorded
//! and the rest are still inspected.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams, ListParams};
use kube::Client;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::Error;

/// Which replicas to inspect and which container to exec into
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicaSelector {
    /// Namespace of the replicas
    pub namespace: String,
    /// Label selector matching the replicas (e.g. `app=rancher`)
    pub label_selector: String,
    /// Container to run the command in
    pub container: String,
}

impl ReplicaSelector {
    /// Create a selector
    pub fn new(
        namespace: impl Into<String>,
        label_selector: impl Into<String>,
        container: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            label_selector: label_selector.into(),
            container: container.into(),
        }
    }
}

/// Captured output of one remote command
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
}

/// Result of running the command in one replica
#[derive(Debug)]
pub struct ReplicaOutput {
    /// Pod name
    pub replica: String,
    /// Captured output, or the exec failure for this replica only
    pub result: Result<ExecOutput, Error>,
}

/// Pod listing and remote execution
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PodApi: Send + Sync {
    /// Names of live pods matching `label_selector`, in listing order
    async fn list(&self, namespace: &str, label_selector: &str) -> Result<Vec<String>, Error>;

    /// Run `command` in `container` of `pod` without a TTY
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
    ) -> Result<ExecOutput, Error>;
}

/// [`PodApi`] backed by the core/v1 Pod API and the websocket exec channel
pub struct KubePodApi {
    client: Client,
}

impl KubePodApi {
    /// Create a pod API backed by the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

async fn read_all<R: AsyncRead + Unpin>(reader: Option<R>) -> std::io::Result<String> {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        reader.read_to_end(&mut buf).await?;
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

#[async_trait]
impl PodApi for KubePodApi {
    async fn list(&self, namespace: &str, label_selector: &str) -> Result<Vec<String>, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api
            .list(&ListParams::default().labels(label_selector))
            .await
            .map_err(|e| Error::ListReplicas {
                namespace: namespace.to_string(),
                selector: label_selector.to_string(),
                message: e.to_string(),
            })?;

        // Terminating pods are on their way out and no longer count as replicas
        Ok(pods
            .items
            .into_iter()
            .filter(|pod| pod.metadata.deletion_timestamp.is_none())
            .filter_map(|pod| pod.metadata.name)
            .collect())
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
    ) -> Result<ExecOutput, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = AttachParams::default()
            .container(container)
            .stdin(false)
            .stdout(true)
            .stderr(true)
            .tty(false);

        let mut attached = api
            .exec(pod, command.to_vec(), &params)
            .await
            .map_err(|e| Error::exec(pod, format!("failed to start exec: {e}")))?;

        let stdout = attached.stdout();
        let stderr = attached.stderr();
        let status = attached.take_status();

        let (stdout, stderr) = tokio::try_join!(read_all(stdout), read_all(stderr))
            .map_err(|e| Error::exec(pod, format!("failed to read output: {e}")))?;

        let status = match status {
            Some(status) => status.await,
            None => None,
        };
        attached
            .join()
            .await
            .map_err(|e| Error::exec(pod, format!("exec session failed: {e}")))?;

        if let Some(status) = status {
            if status.status.as_deref() == Some("Failure") {
                let message = status.message.unwrap_or_else(|| "command failed".to_string());
                return Err(Error::exec(pod, format!("{message}: {}", stderr.trim())));
            }
        }

        debug!(pod = %pod, bytes = stdout.len(), "Exec completed");
        Ok(ExecOutput { stdout, stderr })
    }
}

/// Runs a command across every replica behind a selector
#[derive(Clone)]
pub struct ReplicaInspector {
    api: Arc<dyn PodApi>,
}

impl ReplicaInspector {
    /// Create an inspector over the given pod API
    pub fn new(api: Arc<dyn PodApi>) -> Self {
        Self { api }
    }

    /// List the replicas once, then exec `command` in all of them concurrently.
    ///
    /// Returns one [`ReplicaOutput`] per listed replica, in listing order,
    /// whether or not its exec succeeded. Only the listing itself can fail.
    pub async fn inspect(
        &self,
        selector: &ReplicaSelector,
        command: &[String],
    ) -> Result<Vec<ReplicaOutput>, Error> {
        let replicas = self
            .api
            .list(&selector.namespace, &selector.label_selector)
            .await?;
        info!(
            namespace = %selector.namespace,
            selector = %selector.label_selector,
            count = replicas.len(),
            "Inspecting replicas"
        );

        let execs = replicas.into_iter().map(|replica| {
            let api = Arc::clone(&self.api);
            async move {
                let result = api
                    .exec(
                        &selector.namespace,
                        &replica,
                        &selector.container,
                        command,
                    )
                    .await;
                if let Err(e) = &result {
                    warn!(replica = %replica, error = %e, "Exec failed");
                }
                ReplicaOutput { replica, result }
            }
        });

        Ok(join_all(execs).await)
    }
}
