//! Stories about the harness building blocks against real APIs

use replica_convergence::inspect::ReplicaSelector;
use replica_convergence::scale::{ScaleOutcome, ScaleTarget};
use replica_convergence::session::CleanupAction;

use super::helpers::{live_config, live_session, policy};

/// Story: Operator inspects the metadata setting before touching it
///
/// The setting's value is a JSON map; the harness must be able to read the
/// metadata URL out of it without changing anything.
#[tokio::test]
#[ignore = "requires a live control plane - run with: cargo test --test kind -- --ignored"]
async fn story_operator_reads_current_metadata_source() {
    let config = live_config();
    let session = live_session(&config).await;

    let setting = session
        .settings()
        .read(&config.setting.name)
        .await
        .expect("failed to read setting");

    let url = setting
        .get(&config.setting.key)
        .expect("setting has no url key");
    assert!(url.starts_with("http"), "unexpected metadata url: {url}");

    session.release(&policy(&config)).await.expect("release failed");
}

/// Story: Scaling to the current replica count is a no-op
///
/// Running the harness twice in a row must not bounce the control plane.
#[tokio::test]
#[ignore = "requires a live control plane - run with: cargo test --test kind -- --ignored"]
async fn story_scaling_to_current_count_writes_nothing() {
    let config = live_config();
    let mut session = live_session(&config).await;
    let scaler = session.scaler();
    let policy = policy(&config);

    let target = ScaleTarget::new(
        &config.target.namespace,
        &config.target.deployment,
        config.target.replicas,
    );
    let first = scaler.scale_to(&target, &policy).await.expect("scale failed");
    let second = scaler.scale_to(&target, &policy).await.expect("scale failed");
    assert_eq!(second, ScaleOutcome::Unchanged);

    if let ScaleOutcome::Scaled { previous } = first {
        session.register_cleanup(CleanupAction::RestoreReplicas {
            namespace: target.namespace.clone(),
            name: target.name.clone(),
            replicas: previous,
        });
    }
    session.release(&policy).await.expect("release failed");
}

/// Story: Every replica answers the release list command
///
/// Before trusting a verdict the operator wants to know the replica command
/// works in each pod at all.
#[tokio::test]
#[ignore = "requires a live control plane - run with: cargo test --test kind -- --ignored"]
async fn story_every_replica_answers_the_release_command() {
    let config = live_config();
    let session = live_session(&config).await;

    let selector = ReplicaSelector::new(
        &config.target.namespace,
        &config.target.label_selector,
        &config.target.container,
    );
    let outputs = session
        .inspector()
        .inspect(&selector, &config.replica_command())
        .await
        .expect("failed to list replicas");

    assert!(!outputs.is_empty(), "no replicas matched {}", selector.label_selector);
    for output in &outputs {
        let exec = output
            .result
            .as_ref()
            .unwrap_or_else(|e| panic!("command failed in {}: {e}", output.replica));
        assert!(
            exec.stdout.contains("data"),
            "{} returned no release list",
            output.replica
        );
    }

    session.release(&policy(&config)).await.expect("release failed");
}
