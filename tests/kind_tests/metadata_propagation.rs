//! Stories about the full metadata-source propagation run

use replica_convergence::scenario::run_metadata_scenario;
use replica_convergence::verify::Verdict;

use super::helpers::{live_config, live_session, policy};

/// Story: Switching the metadata source reaches every replica
///
/// The operator primes the dev source, scales the control plane out, then
/// switches to the release source. Either the default version stays put
/// (nothing to assert) or every replica serves the new one.
///
/// Expected behavior:
/// - The verdict passes
/// - When the version changed, every replica's output contains it
/// - The original metadata URL is back in place after release
#[tokio::test]
#[ignore = "requires a live control plane - run with: cargo test --test kind -- --ignored"]
async fn story_metadata_source_change_converges_on_every_replica() {
    let config = live_config();
    let mut session = live_session(&config).await;

    let original = session
        .settings()
        .read(&config.setting.name)
        .await
        .expect("failed to read setting")
        .get(&config.setting.key)
        .map(str::to_string);

    let result = run_metadata_scenario(&mut session, &config).await;
    let settings = session.settings();
    session.release(&policy(&config)).await.expect("release failed");

    let verdict = result.expect("scenario failed");
    println!("{verdict}");
    assert!(verdict.is_pass(), "{verdict}");
    if let Verdict::Converged { after, outcomes, .. } = &verdict {
        assert!(outcomes.iter().all(|o| o.output.contains(after.as_str())));
    }

    if config.restore_on_exit {
        let restored = settings
            .read(&config.setting.name)
            .await
            .expect("failed to read setting");
        assert_eq!(restored.get(&config.setting.key).map(str::to_string), original);
    }
}
