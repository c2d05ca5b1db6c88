//! Spec phase state machine tests: the happy path through all five
//! phases, evaluator retry accounting, and attempt exhaustion.

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use foreman::domain::errors::DomainResult;
use foreman::domain::models::event::event_types;
use foreman::domain::models::{EvalResult, Spec, SpecPhase};
use foreman::domain::ports::{PhaseEvaluator, TurnUsage};
use foreman::worker::reporter::ArrayReporter;
use foreman::worker::spec::{
    ArtifactSet, ScriptedExecutor, SpecMachineConfig, SpecStateMachine, StructuralEvaluator,
};
use tokio::sync::Mutex;

fn machine_config(dir: &std::path::Path) -> SpecMachineConfig {
    SpecMachineConfig {
        max_attempts_per_phase: 3,
        single_phase: None,
        output_dir: dir.to_path_buf(),
        sandbox_id: "sb-spec".to_string(),
    }
}

#[tokio::test]
async fn happy_path_reaches_complete_with_artifacts() {
    // S4: every phase passes; artifacts exist at the documented paths,
    // the spec is complete, and validation succeeds.
    let dir = tempfile::tempdir().unwrap();
    let reporter = Arc::new(ArrayReporter::new());
    let machine = SpecStateMachine::new(
        Spec::new("Search", "Add full-text search"),
        Arc::new(ScriptedExecutor::new()),
        Arc::new(StructuralEvaluator::new()),
        reporter.clone(),
        machine_config(dir.path()),
    );

    let outcome = machine.run().await.unwrap();
    assert!(outcome.success);
    assert!(outcome.spec.is_complete());
    assert_eq!(outcome.spec.phase_data.len(), 5);

    // Artifact filesystem layout.
    for subdir in ["requirements", "design", "tasks", "tickets"] {
        let path = dir.path().join(subdir);
        assert!(path.exists(), "missing {subdir} directory");
        assert!(
            std::fs::read_dir(&path).unwrap().next().is_some(),
            "{subdir} is empty"
        );
    }
    for phase in SpecPhase::WORKFLOW {
        assert!(dir.path().join(format!("{}.json", phase.as_str())).exists());
    }

    // The generated graph validates.
    let set = ArtifactSet::load(dir.path()).await.unwrap();
    assert!(set.validate().is_valid());

    // Lifecycle events.
    assert!(reporter.has_event(event_types::SPEC_STARTED).await);
    assert!(reporter.has_event(event_types::SPEC_COMPLETED).await);
    assert_eq!(
        reporter.events_of_type(event_types::PHASE_COMPLETED).await.len(),
        5
    );
}

/// Fails the requirements phase a fixed number of times, passing
/// everything else structurally.
struct FlakyRequirementsEvaluator {
    inner: StructuralEvaluator,
    failures_left: Mutex<u32>,
}

#[async_trait]
impl PhaseEvaluator for FlakyRequirementsEvaluator {
    async fn evaluate(
        &self,
        phase: SpecPhase,
        output: &serde_json::Value,
        accumulated: &serde_json::Value,
    ) -> DomainResult<EvalResult> {
        if phase == SpecPhase::Requirements {
            let mut failures = self.failures_left.lock().await;
            if *failures > 0 {
                *failures -= 1;
                return Ok(EvalResult::scored(
                    0.4,
                    EvalResult::DEFAULT_THRESHOLD,
                    Some("requirements too thin".to_string()),
                ));
            }
        }
        self.inner.evaluate(phase, output, accumulated).await
    }
}

#[tokio::test]
async fn failing_evaluator_retries_with_feedback_then_passes() {
    // S5: REQUIREMENTS fails twice then passes. phase_attempts = 3 and
    // DESIGN proceeds with the accepted requirements.
    let dir = tempfile::tempdir().unwrap();
    let reporter = Arc::new(ArrayReporter::new());
    let machine = SpecStateMachine::new(
        Spec::new("Search", "Add search"),
        Arc::new(ScriptedExecutor::new()),
        Arc::new(FlakyRequirementsEvaluator {
            inner: StructuralEvaluator::new(),
            failures_left: Mutex::new(2),
        }),
        reporter.clone(),
        machine_config(dir.path()),
    );

    let outcome = machine.run().await.unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.spec.attempts_for(SpecPhase::Requirements), 3);
    assert!(outcome.spec.phase_data.contains_key("design"));

    let retries = reporter.events_of_type(event_types::PHASE_RETRY).await;
    assert_eq!(retries.len(), 2);
    for retry in retries {
        assert!(retry.event_data["feedback"]
            .as_str()
            .unwrap()
            .contains("too thin"));
    }
}

#[tokio::test]
async fn attempt_exhaustion_fails_the_spec_in_place() {
    // Three failed evaluations exhaust the phase; the spec stays at its
    // last good phase with last_error populated.
    let dir = tempfile::tempdir().unwrap();
    let reporter = Arc::new(ArrayReporter::new());
    let machine = SpecStateMachine::new(
        Spec::new("Search", "Add search"),
        Arc::new(ScriptedExecutor::new()),
        Arc::new(FlakyRequirementsEvaluator {
            inner: StructuralEvaluator::new(),
            failures_left: Mutex::new(99),
        }),
        reporter.clone(),
        machine_config(dir.path()),
    );

    let outcome = machine.run().await.unwrap();
    assert!(!outcome.success);
    assert_eq!(outcome.spec.current_phase, SpecPhase::Requirements);
    assert_eq!(outcome.spec.attempts_for(SpecPhase::Requirements), 3);
    assert!(outcome.spec.last_error.is_some());
    assert!(reporter.has_event(event_types::SPEC_FAILED).await);
    // Explore's artifact stayed frozen.
    assert!(outcome.spec.phase_data.contains_key("explore"));
}

#[tokio::test]
async fn single_phase_mode_runs_only_that_phase() {
    let dir = tempfile::tempdir().unwrap();
    let reporter = Arc::new(ArrayReporter::new());
    let mut config = machine_config(dir.path());
    config.single_phase = Some(SpecPhase::Explore);

    let machine = SpecStateMachine::new(
        Spec::new("s", "d"),
        Arc::new(ScriptedExecutor::new()),
        Arc::new(StructuralEvaluator::new()),
        reporter.clone(),
        config,
    );
    let outcome = machine.run().await.unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.phase_results.len(), 1);
    assert!(outcome.phase_results.contains_key("explore"));
}

#[tokio::test]
async fn checkpoints_accumulate_monotonically() {
    // Invariant 6: phases advance forward only; each checkpoint includes
    // everything frozen so far.
    let dir = tempfile::tempdir().unwrap();
    let reporter = Arc::new(ArrayReporter::new());
    let machine = SpecStateMachine::new(
        Spec::new("s", "d"),
        Arc::new(ScriptedExecutor::new()),
        Arc::new(StructuralEvaluator::new()),
        reporter.clone(),
        machine_config(dir.path()),
    );
    machine.run().await.unwrap();

    let completions = reporter.events_of_type(event_types::PHASE_COMPLETED).await;
    let mut seen_keys = 0;
    for completion in &completions {
        let keys = completion.event_data["checkpoint"]["phase_data"]
            .as_object()
            .unwrap()
            .len();
        assert!(keys > seen_keys, "checkpoint lost frozen phases");
        seen_keys = keys;
    }
}

#[tokio::test]
async fn total_usage_accumulates_across_phases() {
    let dir = tempfile::tempdir().unwrap();
    let machine = SpecStateMachine::new(
        Spec::new("s", "d"),
        Arc::new(ScriptedExecutor::new()),
        Arc::new(StructuralEvaluator::new()),
        Arc::new(ArrayReporter::new()),
        machine_config(dir.path()),
    );
    let outcome = machine.run().await.unwrap();
    let expected = TurnUsage {
        prompt_tokens: 500,
        completion_tokens: 250,
        cost_usd: 0.005,
    };
    assert_eq!(outcome.total_usage.prompt_tokens, expected.prompt_tokens);
    assert_eq!(outcome.total_usage.completion_tokens, expected.completion_tokens);
    assert!((outcome.total_usage.cost_usd - expected.cost_usd).abs() < 1e-9);
}
