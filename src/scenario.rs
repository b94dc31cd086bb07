//! The metadata-source propagation check, end to end.
//!
//! 1. Remember the current metadata URL so it can be restored.
//! 2. Point the setting at the priming source.
//! 3. Scale the control plane so there is more than one replica to compare.
//! 4. Run the verifier with the target source as its mutation.

use std::sync::Arc;

use tracing::info;

use crate::config::HarnessConfig;
use crate::inspect::{ReplicaInspector, ReplicaSelector};
use crate::rancher::VersionReader;
use crate::retry::BackoffPolicy;
use crate::scale::{ReplicaScaler, ScaleOutcome, ScaleTarget};
use crate::session::{CleanupAction, Session};
use crate::settings::ConfigMutator;
use crate::verify::{ConvergenceVerifier, Verdict, VerificationPlan};
use crate::Error;

/// Components a scenario run talks to
pub struct ScenarioContext {
    /// Reads and writes the metadata setting
    pub settings: ConfigMutator,
    /// Scales the control-plane deployment
    pub scaler: ReplicaScaler,
    /// Runs the check command on each replica
    pub inspector: ReplicaInspector,
    /// Observes the default version between polls
    pub reader: Arc<dyn VersionReader>,
}

impl ScenarioContext {
    /// Build from a live session
    pub fn from_session(session: &Session, config: &HarnessConfig) -> Self {
        Self {
            settings: session.settings(),
            scaler: session.scaler(),
            inspector: session.inspector(),
            reader: session.version_reader(config.versions.source),
        }
    }
}

/// Verification plan described by `config`
pub fn plan_from_config(config: &HarnessConfig) -> VerificationPlan {
    VerificationPlan {
        setting: config.setting.name.clone(),
        key: config.setting.key.clone(),
        mutations: vec![config.setting.target_value.clone()],
        cluster_type: config.versions.cluster_type.clone(),
        filters: config.versions.filters.clone(),
        selector: ReplicaSelector::new(
            &config.target.namespace,
            &config.target.label_selector,
            &config.target.container,
        ),
        command: config.replica_command(),
    }
}

/// Run the scenario against a live session.
///
/// Undo actions are registered on `session` as soon as each change is made,
/// so the caller can release the session on any exit path.
pub async fn run_metadata_scenario(
    session: &mut Session,
    config: &HarnessConfig,
) -> Result<Verdict, Error> {
    let ctx = ScenarioContext::from_session(session, config);
    run_with(&ctx, config, |action| {
        if config.restore_on_exit {
            session.register_cleanup(action);
        }
    })
    .await
}

/// Run the scenario with explicit components, reporting every undo action
/// through `on_change`.
pub async fn run_with(
    ctx: &ScenarioContext,
    config: &HarnessConfig,
    mut on_change: impl FnMut(CleanupAction),
) -> Result<Verdict, Error> {
    let policy = config.backoff.to_policy()?;
    let setting = &config.setting;

    // Undo is registered before the first write.
    let original = ctx.settings.read(&setting.name).await?;
    on_change(CleanupAction::RestoreSetting {
        name: setting.name.clone(),
        key: setting.key.clone(),
        value: original.get(&setting.key).map(str::to_string),
    });

    if let Some(prime) = &setting.prime_value {
        ctx.settings.update(&setting.name, &setting.key, prime).await?;
        info!(setting = %setting.name, value = %prime, "Primed metadata source");
    }

    let target = ScaleTarget::new(
        &config.target.namespace,
        &config.target.deployment,
        config.target.replicas,
    );
    if let ScaleOutcome::Scaled { previous } = scale(&ctx.scaler, &target, &policy).await? {
        on_change(CleanupAction::RestoreReplicas {
            namespace: target.namespace.clone(),
            name: target.name.clone(),
            replicas: previous,
        });
    }

    let mut verifier = ConvergenceVerifier::new(
        ctx.settings.clone(),
        Arc::clone(&ctx.reader),
        ctx.inspector.clone(),
        policy,
    );
    verifier.run(&plan_from_config(config)).await
}

async fn scale(
    scaler: &ReplicaScaler,
    target: &ScaleTarget,
    policy: &BackoffPolicy,
) -> Result<ScaleOutcome, Error> {
    let outcome = scaler.scale_to(target, policy).await?;
    info!(
        deployment = %target.name,
        replicas = target.replicas,
        outcome = ?outcome,
        "Replicas ready"
    );
    Ok(outcome)
}
