//! Deployment scaling with a bounded wait for ready replicas.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::retry::{poll_until, BackoffPolicy, PollError};
use crate::Error;

/// A deployment and the replica count it should run
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScaleTarget {
    /// Deployment namespace
    pub namespace: String,
    /// Deployment name
    pub name: String,
    /// Desired replica count
    pub replicas: i32,
}

impl ScaleTarget {
    /// Create a scale request
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, replicas: i32) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            replicas,
        }
    }

    fn display_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// Replica counts of a deployment at one observation
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeploymentReplicas {
    /// `spec.replicas`
    pub desired: i32,
    /// `status.readyReplicas`
    pub ready: i32,
}

/// Result of a successful [`ReplicaScaler::scale_to`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScaleOutcome {
    /// Desired replicas already matched; nothing was written
    Unchanged,
    /// Desired replicas were changed from `previous` and are now ready
    Scaled {
        /// Desired replica count before the change
        previous: i32,
    },
}

/// Deployment access needed for scaling
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DeploymentApi: Send + Sync {
    /// Get desired and ready replica counts
    async fn get(&self, namespace: &str, name: &str) -> Result<DeploymentReplicas, Error>;

    /// Set `spec.replicas`
    async fn set_replicas(&self, namespace: &str, name: &str, replicas: i32) -> Result<(), Error>;
}

/// [`DeploymentApi`] backed by the apps/v1 Deployment API
pub struct KubeDeploymentApi {
    client: Client,
}

impl KubeDeploymentApi {
    /// Create a deployment API backed by the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DeploymentApi for KubeDeploymentApi {
    async fn get(&self, namespace: &str, name: &str) -> Result<DeploymentReplicas, Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let deployment = api
            .get(name)
            .await
            .map_err(|e| Error::from_kube("deployment", &format!("{namespace}/{name}"), e))?;

        // Kubernetes defaults an unset spec.replicas to 1
        let desired = deployment
            .spec
            .as_ref()
            .and_then(|s| s.replicas)
            .unwrap_or(1);
        let ready = deployment
            .status
            .as_ref()
            .and_then(|s| s.ready_replicas)
            .unwrap_or(0);

        Ok(DeploymentReplicas { desired, ready })
    }

    async fn set_replicas(&self, namespace: &str, name: &str, replicas: i32) -> Result<(), Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "spec": { "replicas": replicas } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| Error::from_kube("deployment", &format!("{namespace}/{name}"), e))?;
        Ok(())
    }
}

/// Scales deployments and waits for the new replicas to become ready
#[derive(Clone)]
pub struct ReplicaScaler {
    api: Arc<dyn DeploymentApi>,
}

impl ReplicaScaler {
    /// Create a scaler over the given deployment API
    pub fn new(api: Arc<dyn DeploymentApi>) -> Self {
        Self { api }
    }

    /// Scale `target` and block until its ready replicas match.
    ///
    /// A deployment whose desired count already equals the target is left
    /// untouched. Fetch failures while waiting are retried within `policy`.
    pub async fn scale_to(
        &self,
        target: &ScaleTarget,
        policy: &BackoffPolicy,
    ) -> Result<ScaleOutcome, Error> {
        let current = self.api.get(&target.namespace, &target.name).await?;
        if current.desired == target.replicas {
            info!(
                deployment = %target.display_name(),
                replicas = target.replicas,
                "Deployment already at desired replicas"
            );
            return Ok(ScaleOutcome::Unchanged);
        }

        self.api
            .set_replicas(&target.namespace, &target.name, target.replicas)
            .await?;
        info!(
            deployment = %target.display_name(),
            from = current.desired,
            to = target.replicas,
            "Scaling deployment"
        );

        let api = Arc::clone(&self.api);
        let result = poll_until(
            policy,
            "scale deployment",
            || {
                let api = Arc::clone(&api);
                let namespace = target.namespace.clone();
                let name = target.name.clone();
                async move { api.get(&namespace, &name).await }
            },
            |replicas| {
                debug!(
                    deployment = %target.display_name(),
                    ready = replicas.ready,
                    desired = target.replicas,
                    "Waiting for deployment to scale"
                );
                replicas.ready == target.replicas
            },
        )
        .await;

        match result {
            Ok(_) => {
                info!(
                    deployment = %target.display_name(),
                    replicas = target.replicas,
                    "Deployment scaled"
                );
                Ok(ScaleOutcome::Scaled {
                    previous: current.desired,
                })
            }
            Err(PollError::Exhausted {
                attempts,
                last_value,
            }) => Err(Error::ScaleTimeout {
                namespace: target.namespace.clone(),
                name: target.name.clone(),
                desired: target.replicas,
                last_ready: last_value.map(|r| r.ready),
                attempts,
            }),
            Err(e) => Err(e.into_error("scale deployment", |r| {
                format!("{}/{} ready", r.ready, r.desired)
            })),
        }
    }
}
