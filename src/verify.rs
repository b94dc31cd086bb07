//! Convergence verification.
//!
//! A run moves through `Baseline -> Mutating -> Polling`, then either stops at
//! `NoChange` (the mutation had no observable effect) or goes on to
//! `Inspecting`, where every replica is asked for its view of the new value.
//!
//! ```text
//! Baseline ──► Mutating ──► Polling ──┬──► NoChange ───┐
//!                                     └──► Inspecting ─┴──► Done
//! ```

use std::fmt;
use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::inspect::{ReplicaInspector, ReplicaSelector};
use crate::rancher::VersionReader;
use crate::retry::{poll_until, BackoffPolicy, PollError};
use crate::settings::ConfigMutator;
use crate::Error;

/// Phase of a verification run
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VerifierState {
    /// Reading the observed value before any change
    #[default]
    Baseline,
    /// Applying the configured mutations
    Mutating,
    /// Waiting for the observed value to move away from the baseline
    Polling,
    /// The observed value never changed within the budget
    NoChange,
    /// Checking every replica for the new value
    Inspecting,
    /// Verdict reached
    Done,
}

impl fmt::Display for VerifierState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Baseline => write!(f, "Baseline"),
            Self::Mutating => write!(f, "Mutating"),
            Self::Polling => write!(f, "Polling"),
            Self::NoChange => write!(f, "NoChange"),
            Self::Inspecting => write!(f, "Inspecting"),
            Self::Done => write!(f, "Done"),
        }
    }
}

/// What to change and how to check it
#[derive(Clone, Debug)]
pub struct VerificationPlan {
    /// Setting to mutate
    pub setting: String,
    /// Key inside the setting
    pub key: String,
    /// Values written to `key`, in order, after the baseline is taken
    pub mutations: Vec<String>,
    /// Cluster type passed to the version reader
    pub cluster_type: String,
    /// Version filters passed to the version reader
    pub filters: Vec<String>,
    /// Replicas to inspect
    pub selector: ReplicaSelector,
    /// Command whose stdout should contain the new observed value
    pub command: Vec<String>,
}

/// Per-replica inspection result
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerificationOutcome {
    /// Pod name
    pub replica: String,
    /// Raw stdout of the command
    pub output: String,
    /// Whether `output` contains the new observed value
    pub matched: bool,
    /// Exec failure, if the command could not be run
    pub exec_error: Option<String>,
}

/// Final result of a run
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// The observed value stayed at `observed` for the whole budget
    NoChange {
        /// Value seen before and after the mutation
        observed: String,
    },
    /// Every replica reports the new value
    Converged {
        /// Observed value before the mutation
        before: String,
        /// Observed value the poll settled on
        after: String,
        /// One entry per inspected replica
        outcomes: Vec<VerificationOutcome>,
    },
    /// At least one replica does not report the new value
    Diverged {
        /// Observed value before the mutation
        before: String,
        /// Observed value the poll settled on
        after: String,
        /// One entry per inspected replica
        outcomes: Vec<VerificationOutcome>,
    },
}

impl Verdict {
    /// True for [`Verdict::NoChange`] and [`Verdict::Converged`]
    pub fn is_pass(&self) -> bool {
        !matches!(self, Verdict::Diverged { .. })
    }

    /// Per-replica outcomes; empty for [`Verdict::NoChange`]
    pub fn outcomes(&self) -> &[VerificationOutcome] {
        match self {
            Verdict::NoChange { .. } => &[],
            Verdict::Converged { outcomes, .. } | Verdict::Diverged { outcomes, .. } => outcomes,
        }
    }

    /// Replicas that did not report the new value
    pub fn mismatches(&self) -> Vec<&VerificationOutcome> {
        self.outcomes().iter().filter(|o| !o.matched).collect()
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::NoChange { observed } => write!(
                f,
                "PASS: observed value stayed at {observed}; nothing to assert"
            ),
            Verdict::Converged {
                before,
                after,
                outcomes,
            } => write!(
                f,
                "PASS: {before} -> {after}, all {} replicas converged",
                outcomes.len()
            ),
            Verdict::Diverged {
                before,
                after,
                outcomes,
            } => {
                let mismatches = self.mismatches();
                writeln!(
                    f,
                    "FAIL: {before} -> {after}, {} of {} replicas did not converge",
                    mismatches.len(),
                    outcomes.len()
                )?;
                for outcome in mismatches {
                    match &outcome.exec_error {
                        Some(error) => writeln!(f, "  {}: exec failed: {error}", outcome.replica)?,
                        None => {
                            writeln!(f, "  {}: output does not contain {after}", outcome.replica)?;
                            for line in outcome.output.lines() {
                                writeln!(f, "    | {line}")?;
                            }
                        }
                    }
                }
                Ok(())
            }
        }
    }
}

/// Drives one mutate-poll-inspect run
pub struct ConvergenceVerifier {
    mutator: ConfigMutator,
    reader: Arc<dyn VersionReader>,
    inspector: ReplicaInspector,
    policy: BackoffPolicy,
    state: VerifierState,
}

impl ConvergenceVerifier {
    /// Create a verifier; `policy` bounds the wait for the observed change
    pub fn new(
        mutator: ConfigMutator,
        reader: Arc<dyn VersionReader>,
        inspector: ReplicaInspector,
        policy: BackoffPolicy,
    ) -> Self {
        Self {
            mutator,
            reader,
            inspector,
            policy,
            state: VerifierState::default(),
        }
    }

    /// Phase the last run reached
    pub fn state(&self) -> VerifierState {
        self.state
    }

    fn enter(&mut self, next: VerifierState) {
        info!(from = %self.state, to = %next, "Verifier transition");
        self.state = next;
    }

    async fn observe(
        reader: &dyn VersionReader,
        cluster_type: &str,
        filters: &[String],
    ) -> Result<String, Error> {
        reader
            .default_versions(cluster_type, filters)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::not_found("default version", cluster_type))
    }

    /// Run the plan to a verdict.
    ///
    /// Setting, listing, and baseline failures abort the run. Exec failures
    /// are recorded against their replica and make the verdict fail.
    #[instrument(skip(self, plan), fields(setting = %plan.setting, key = %plan.key))]
    pub async fn run(&mut self, plan: &VerificationPlan) -> Result<Verdict, Error> {
        self.state = VerifierState::Baseline;
        let before = Self::observe(self.reader.as_ref(), &plan.cluster_type, &plan.filters).await?;
        info!(before = %before, "Baseline observed");

        self.enter(VerifierState::Mutating);
        for value in &plan.mutations {
            self.mutator.update(&plan.setting, &plan.key, value).await?;
        }

        self.enter(VerifierState::Polling);
        let reader = Arc::clone(&self.reader);
        let polled = poll_until(
            &self.policy,
            "observe change",
            || {
                let reader = Arc::clone(&reader);
                async move { Self::observe(reader.as_ref(), &plan.cluster_type, &plan.filters).await }
            },
            |observed| *observed != before,
        )
        .await;

        let after = match polled {
            Ok(after) => after,
            Err(PollError::Exhausted { attempts, .. }) => {
                self.enter(VerifierState::NoChange);
                info!(
                    observed = %before,
                    attempts,
                    "Observed value did not change; nothing to assert"
                );
                self.enter(VerifierState::Done);
                return Ok(Verdict::NoChange { observed: before });
            }
            Err(e) => return Err(e.into_error("observe change", |v: &String| v.clone())),
        };
        info!(before = %before, after = %after, "Observed value changed");

        self.enter(VerifierState::Inspecting);
        let replicas = self.inspector.inspect(&plan.selector, &plan.command).await?;
        if replicas.is_empty() {
            return Err(Error::NoReplicas {
                namespace: plan.selector.namespace.clone(),
                selector: plan.selector.label_selector.clone(),
            });
        }

        let outcomes: Vec<VerificationOutcome> = replicas
            .into_iter()
            .map(|replica| match replica.result {
                Ok(output) => VerificationOutcome {
                    matched: output.stdout.contains(after.as_str()),
                    replica: replica.replica,
                    output: output.stdout,
                    exec_error: None,
                },
                Err(e) => VerificationOutcome {
                    replica: replica.replica,
                    output: String::new(),
                    matched: false,
                    exec_error: Some(e.to_string()),
                },
            })
            .collect();

        self.enter(VerifierState::Done);
        let verdict = if outcomes.iter().all(|o| o.matched) {
            Verdict::Converged {
                before,
                after,
                outcomes,
            }
        } else {
            for outcome in outcomes.iter().filter(|o| !o.matched) {
                warn!(replica = %outcome.replica, "Replica did not converge");
            }
            Verdict::Diverged {
                before,
                after,
                outcomes,
            }
        };
        Ok(verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspect::{ExecOutput, MockPodApi};
    use crate::rancher::MockVersionReader;
    use crate::settings::{MockSettingsApi, RawSetting};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    const RELEASE_URL: &str = "https://releases/release-v2.8/data.json";

    fn fast_policy(attempts: u32) -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_millis(1), 2.0, attempts).unwrap()
    }

    fn plan() -> VerificationPlan {
        VerificationPlan {
            setting: "rke-metadata-config".to_string(),
            key: "url".to_string(),
            mutations: vec![RELEASE_URL.to_string()],
            cluster_type: "rke2".to_string(),
            filters: Vec::new(),
            selector: ReplicaSelector::new("cattle-system", "app=rancher", "rancher"),
            command: vec!["curl".to_string(), "--insecure".to_string()],
        }
    }

    fn settings() -> MockSettingsApi {
        let mut api = MockSettingsApi::new();
        api.expect_get().returning(|name| {
            Ok(RawSetting {
                name: name.to_string(),
                value: r#"{"url":"https://releases/dev-v2.8/data.json"}"#.to_string(),
                default: String::new(),
                resource_version: Some("1".to_string()),
            })
        });
        api.expect_replace()
            .times(1)
            .withf(|s: &RawSetting| s.value.contains("release-v2.8"))
            .returning(|_| Ok(()));
        api
    }

    /// Versions reader whose newest version flips to `after` on `flip_at`
    /// (1-based call count, counting the baseline read).
    fn versions(
        before: &'static str,
        after: &'static str,
        flip_at: u32,
    ) -> (MockVersionReader, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let mut reader = MockVersionReader::new();
        {
            let calls = calls.clone();
            reader
                .expect_default_versions()
                .withf(|cluster_type: &str, _: &[String]| cluster_type == "rke2")
                .returning(move |_, _| {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    let newest = if n >= flip_at { after } else { before };
                    Ok(vec![newest.to_string(), "v1.29.9+rke2r1".to_string()])
                });
        }
        (reader, calls)
    }

    fn pods(outputs: Vec<(&'static str, &'static str)>) -> MockPodApi {
        let names: Vec<String> = outputs.iter().map(|(n, _)| n.to_string()).collect();
        let count = outputs.len();
        let mut api = MockPodApi::new();
        api.expect_list().times(1).returning(move |_, _| Ok(names.clone()));
        api.expect_exec()
            .times(count)
            .returning(move |_, pod, _, _| {
                let stdout = outputs
                    .iter()
                    .find(|(name, _)| *name == pod)
                    .map(|(_, out)| out.to_string())
                    .unwrap_or_default();
                Ok(ExecOutput {
                    stdout,
                    stderr: String::new(),
                })
            });
        api
    }

    fn verifier(
        settings: MockSettingsApi,
        reader: MockVersionReader,
        pods: MockPodApi,
        attempts: u32,
    ) -> ConvergenceVerifier {
        ConvergenceVerifier::new(
            ConfigMutator::new(Arc::new(settings)),
            Arc::new(reader),
            ReplicaInspector::new(Arc::new(pods)),
            fast_policy(attempts),
        )
    }

    /// Story: the new version shows up and every replica serves it
    #[tokio::test]
    async fn story_all_replicas_converge() {
        // Baseline read is call 1; the fourth poll attempt is call 5
        let (reader, calls) = versions("v1.30.1", "v1.31.0", 5);
        let pods = pods(vec![
            ("rancher-0", r#"{"data":[{"id":"v1.31.0"}]}"#),
            ("rancher-1", r#"{"data":[{"id":"v1.31.0"}]}"#),
            ("rancher-2", r#"{"data":[{"id":"v1.31.0"}]}"#),
        ]);

        let mut verifier = verifier(settings(), reader, pods, 7);
        let verdict = verifier.run(&plan()).await.unwrap();

        assert!(verdict.is_pass());
        assert_eq!(verifier.state(), VerifierState::Done);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        match &verdict {
            Verdict::Converged {
                before,
                after,
                outcomes,
            } => {
                assert_eq!(before, "v1.30.1");
                assert_eq!(after, "v1.31.0");
                assert_eq!(outcomes.len(), 3);
                assert!(outcomes.iter().all(|o| o.matched));
            }
            other => panic!("expected Converged, got {other:?}"),
        }
    }

    /// Story: one stale replica fails the run and is named in the report
    #[tokio::test]
    async fn story_stale_replica_is_reported() {
        let (reader, _) = versions("v1.30.1", "v1.31.0", 3);
        let pods = pods(vec![
            ("rancher-0", r#"{"data":[{"id":"v1.31.0"}]}"#),
            ("rancher-1", r#"{"data":[{"id":"v1.30.1"}]}"#),
            ("rancher-2", r#"{"data":[{"id":"v1.31.0"}]}"#),
        ]);

        let mut verifier = verifier(settings(), reader, pods, 7);
        let verdict = verifier.run(&plan()).await.unwrap();

        assert!(!verdict.is_pass());
        let mismatches = verdict.mismatches();
        assert_eq!(mismatches.len(), 1);
        assert_eq!(mismatches[0].replica, "rancher-1");
        assert_eq!(mismatches[0].output, r#"{"data":[{"id":"v1.30.1"}]}"#);

        let report = verdict.to_string();
        assert!(report.starts_with("FAIL"));
        assert!(report.contains("rancher-1"));
        assert!(report.contains(r#"{"data":[{"id":"v1.30.1"}]}"#));
        assert!(!report.contains("rancher-0"));
    }

    /// Story: a mutation with no visible effect passes without touching pods
    #[tokio::test]
    async fn story_no_change_passes_without_inspection() {
        let (reader, calls) = versions("v1.30.1", "unused", u32::MAX);
        let mut pods = MockPodApi::new();
        pods.expect_list().never();
        pods.expect_exec().never();

        let mut verifier = verifier(settings(), reader, pods, 4);
        let verdict = verifier.run(&plan()).await.unwrap();

        assert_eq!(
            verdict,
            Verdict::NoChange {
                observed: "v1.30.1".to_string()
            }
        );
        assert!(verdict.is_pass());
        assert!(verdict.outcomes().is_empty());
        // Baseline plus the full budget
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(verifier.state(), VerifierState::Done);
    }

    #[tokio::test]
    async fn exec_failure_fails_the_verdict_but_keeps_other_outcomes() {
        let (reader, _) = versions("v1.30.1", "v1.31.0", 2);
        let mut pods = MockPodApi::new();
        pods.expect_list()
            .returning(|_, _| Ok(vec!["rancher-0".to_string(), "rancher-1".to_string()]));
        pods.expect_exec().times(2).returning(|_, pod, _, _| {
            if pod == "rancher-0" {
                Err(Error::exec(pod, "container not found"))
            } else {
                Ok(ExecOutput {
                    stdout: "v1.31.0".to_string(),
                    stderr: String::new(),
                })
            }
        });

        let mut verifier = verifier(settings(), reader, pods, 3);
        let verdict = verifier.run(&plan()).await.unwrap();

        assert!(!verdict.is_pass());
        assert_eq!(verdict.outcomes().len(), 2);
        let mismatches = verdict.mismatches();
        let failed = mismatches[0];
        assert_eq!(failed.replica, "rancher-0");
        assert!(failed.exec_error.as_deref().unwrap().contains("container not found"));
        assert!(verdict.to_string().contains("exec failed"));
    }

    #[tokio::test]
    async fn empty_replica_set_is_an_error() {
        let (reader, _) = versions("v1.30.1", "v1.31.0", 2);
        let mut pods = MockPodApi::new();
        pods.expect_list().returning(|_, _| Ok(Vec::new()));
        pods.expect_exec().never();

        let mut verifier = verifier(settings(), reader, pods, 3);
        let err = verifier.run(&plan()).await.unwrap_err();
        assert!(matches!(err, Error::NoReplicas { .. }));
        assert_eq!(verifier.state(), VerifierState::Inspecting);
    }

    #[tokio::test]
    async fn missing_setting_aborts_before_polling() {
        let (reader, calls) = versions("v1.30.1", "v1.31.0", 2);
        let mut settings = MockSettingsApi::new();
        settings
            .expect_get()
            .returning(|name| Err(Error::not_found("setting", name)));
        settings.expect_replace().never();
        let mut pods = MockPodApi::new();
        pods.expect_list().never();

        let mut verifier = verifier(settings, reader, pods, 3);
        let err = verifier.run(&plan()).await.unwrap_err();

        assert!(matches!(err, Error::NotFound { .. }));
        assert_eq!(verifier.state(), VerifierState::Mutating);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_reader_on_final_attempt_surfaces_its_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut reader = MockVersionReader::new();
        {
            let calls = calls.clone();
            reader.expect_default_versions().returning(move |_, _| {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok(vec!["v1.30.1".to_string()])
                } else {
                    Err(Error::api("list rke2 releases", "503 Service Unavailable"))
                }
            });
        }
        let mut pods = MockPodApi::new();
        pods.expect_list().never();

        let mut verifier = verifier(settings(), reader, pods, 3);
        let err = verifier.run(&plan()).await.unwrap_err();

        match err {
            Error::RetriesExhausted { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
    }

    /// Story: an API fault while waiting is not mistaken for "no change"
    #[tokio::test]
    async fn story_fault_during_polling_is_not_a_pass() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut reader = MockVersionReader::new();
        {
            let calls = calls.clone();
            reader.expect_default_versions().returning(move |_, _| {
                if calls.fetch_add(1, Ordering::SeqCst) == 1 {
                    Err(Error::api("list rke2 releases", "503 Service Unavailable"))
                } else {
                    Ok(vec!["v1.30.1".to_string()])
                }
            });
        }
        let mut pods = MockPodApi::new();
        pods.expect_list().never();

        let mut verifier = verifier(settings(), reader, pods, 3);
        let err = verifier.run(&plan()).await.unwrap_err();

        match err {
            Error::RetriesExhausted {
                attempts,
                last_observed,
                source,
                ..
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(last_observed.as_deref(), Some("v1.30.1"));
                assert!(source.to_string().contains("503"));
            }
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
        assert_eq!(verifier.state(), VerifierState::Polling);
    }

    #[tokio::test]
    async fn permanent_reader_error_aborts_polling_at_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut reader = MockVersionReader::new();
        {
            let calls = calls.clone();
            reader.expect_default_versions().returning(move |_, _| {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok(vec!["v1.30.1".to_string()])
                } else {
                    Err(Error::api_permanent("list rke2 releases", "403 Forbidden"))
                }
            });
        }

        let mut verifier = verifier(settings(), reader, MockPodApi::new(), 7);
        let err = verifier.run(&plan()).await.unwrap_err();

        assert!(matches!(err, Error::Api { retryable: false, .. }));
        // Baseline plus a single poll attempt
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn empty_version_list_is_not_found() {
        let mut reader = MockVersionReader::new();
        reader.expect_default_versions().returning(|_, _| Ok(Vec::new()));
        let mut settings = MockSettingsApi::new();
        settings.expect_get().never();

        let mut verifier = verifier(settings, reader, MockPodApi::new(), 3);
        let err = verifier.run(&plan()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
        assert_eq!(verifier.state(), VerifierState::Baseline);
    }

    #[tokio::test]
    async fn version_list_emptied_while_polling_aborts() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut reader = MockVersionReader::new();
        {
            let calls = calls.clone();
            reader.expect_default_versions().returning(move |_, _| {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok(vec!["v1.30.1".to_string()])
                } else {
                    Ok(Vec::new())
                }
            });
        }

        let mut verifier = verifier(settings(), reader, MockPodApi::new(), 5);
        let err = verifier.run(&plan()).await.unwrap_err();

        assert!(matches!(err, Error::NotFound { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(verifier.state(), VerifierState::Polling);
    }

    #[test]
    fn converged_report_is_one_line() {
        let verdict = Verdict::Converged {
            before: "v1.30.1".to_string(),
            after: "v1.31.0".to_string(),
            outcomes: vec![VerificationOutcome {
                replica: "rancher-0".to_string(),
                output: "v1.31.0".to_string(),
                matched: true,
                exec_error: None,
            }],
        };
        assert_eq!(
            verdict.to_string(),
            "PASS: v1.30.1 -> v1.31.0, all 1 replicas converged"
        );
    }
}
