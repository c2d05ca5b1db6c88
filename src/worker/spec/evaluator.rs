//! Phase evaluators.
//!
//! `StructuralEvaluator` scores the structured output of each phase
//! against shape and content heuristics; a score below the threshold
//! (default 0.7) fails the attempt and its feedback is appended to the
//! retry prompt. `ScriptedEvaluator` replays queued results for tests.

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::artifacts::validate_mermaid;
use crate::domain::errors::DomainResult;
use crate::domain::models::{EvalResult, SpecPhase};
use crate::domain::ports::PhaseEvaluator;

const NORMATIVE_KEYWORDS: [&str; 4] = ["SHALL", "MUST", "SHOULD", "MAY"];

/// Heuristic structural evaluator used in production.
pub struct StructuralEvaluator {
    threshold: f64,
}

impl StructuralEvaluator {
    pub fn new() -> Self {
        Self {
            threshold: EvalResult::DEFAULT_THRESHOLD,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    fn evaluate_explore(output: &serde_json::Value) -> (f64, Vec<String>) {
        let mut score: f64 = 0.0;
        let mut feedback = Vec::new();

        if output.get("architecture").and_then(|v| v.as_str()).map_or(0, str::len) >= 40 {
            score += 0.4;
        } else {
            feedback.push("architecture summary is missing or too thin".to_string());
        }
        match output.get("key_files").and_then(|v| v.as_array()) {
            Some(files) if !files.is_empty() => score += 0.3,
            _ => feedback.push("key_files must list the relevant paths".to_string()),
        }
        match output.get("patterns").and_then(|v| v.as_array()) {
            Some(patterns) if !patterns.is_empty() => score += 0.3,
            _ => feedback.push("patterns must name the conventions found".to_string()),
        }
        (score, feedback)
    }

    fn evaluate_requirements(output: &serde_json::Value) -> (f64, Vec<String>) {
        let mut feedback = Vec::new();
        let Some(requirements) = output.get("requirements").and_then(|v| v.as_array()) else {
            return (0.0, vec!["output must contain a requirements array".to_string()]);
        };
        if requirements.is_empty() {
            return (0.0, vec!["requirements array is empty".to_string()]);
        }

        let total = requirements.len() as f64;
        let well_formed_ids = requirements
            .iter()
            .filter(|r| {
                r.get("id")
                    .and_then(|v| v.as_str())
                    .is_some_and(|id| id.starts_with("REQ-") && id.split('-').count() == 4)
            })
            .count() as f64;
        let normative = requirements
            .iter()
            .filter(|r| {
                r.get("statement").and_then(|v| v.as_str()).is_some_and(|s| {
                    NORMATIVE_KEYWORDS.iter().any(|kw| s.contains(kw))
                })
            })
            .count() as f64;

        if well_formed_ids < total {
            feedback.push("every requirement id must match REQ-<AREA>-<SUB>-<NNN>".to_string());
        }
        if normative < total {
            feedback.push(
                "every statement must use normative language (SHALL/SHOULD/MAY/MUST)".to_string(),
            );
        }

        let score = 0.2 + 0.4 * (well_formed_ids / total) + 0.4 * (normative / total);
        (score, feedback)
    }

    fn evaluate_design(output: &serde_json::Value) -> (f64, Vec<String>) {
        let mut score: f64 = 0.0;
        let mut feedback = Vec::new();

        if output.get("overview").and_then(|v| v.as_str()).map_or(0, str::len) >= 40 {
            score += 0.3;
        } else {
            feedback.push("design overview is missing or too thin".to_string());
        }
        match output.get("components").and_then(|v| v.as_array()) {
            Some(components) if !components.is_empty() => score += 0.4,
            _ => feedback.push("components array is missing or empty".to_string()),
        }
        match output.get("diagram").and_then(|v| v.as_str()) {
            Some(diagram) if validate_mermaid(diagram) => score += 0.3,
            Some(_) => feedback.push("diagram is not valid Mermaid syntax".to_string()),
            None => feedback.push("a Mermaid diagram is required".to_string()),
        }
        (score, feedback)
    }

    fn evaluate_tasks(output: &serde_json::Value) -> (f64, Vec<String>) {
        let mut feedback = Vec::new();
        let Some(tasks) = output.get("tasks").and_then(|v| v.as_array()) else {
            return (0.0, vec!["output must contain a tasks array".to_string()]);
        };
        if tasks.is_empty() {
            return (0.0, vec!["tasks array is empty".to_string()]);
        }

        let total = tasks.len() as f64;
        let with_ids = tasks
            .iter()
            .filter(|t| {
                t.get("id")
                    .and_then(|v| v.as_str())
                    .is_some_and(|id| id.contains("TSK-"))
            })
            .count() as f64;
        let with_requirements = tasks
            .iter()
            .filter(|t| {
                t.get("requirements")
                    .and_then(|v| v.as_array())
                    .is_some_and(|reqs| !reqs.is_empty())
            })
            .count() as f64;

        if with_ids < total {
            feedback.push("every task id must contain TSK-<NNN>".to_string());
        }
        if with_requirements < total {
            feedback.push("every task must reference at least one requirement".to_string());
        }

        let score = 0.2 + 0.4 * (with_ids / total) + 0.4 * (with_requirements / total);
        (score, feedback)
    }

    fn evaluate_sync(output: &serde_json::Value) -> (f64, Vec<String>) {
        let mut score: f64 = 0.0;
        let mut feedback = Vec::new();

        match output.get("artifacts").and_then(|v| v.as_array()) {
            Some(artifacts) if !artifacts.is_empty() => score += 0.5,
            _ => feedback.push("artifacts must list the written files".to_string()),
        }
        match output.get("tickets").and_then(|v| v.as_array()) {
            Some(tickets) if !tickets.is_empty() => score += 0.5,
            _ => feedback.push("tickets array is missing or empty".to_string()),
        }
        (score, feedback)
    }
}

impl Default for StructuralEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PhaseEvaluator for StructuralEvaluator {
    async fn evaluate(
        &self,
        phase: SpecPhase,
        output: &serde_json::Value,
        _accumulated: &serde_json::Value,
    ) -> DomainResult<EvalResult> {
        let (score, feedback) = match phase {
            SpecPhase::Explore => Self::evaluate_explore(output),
            SpecPhase::Requirements => Self::evaluate_requirements(output),
            SpecPhase::Design => Self::evaluate_design(output),
            SpecPhase::Tasks => Self::evaluate_tasks(output),
            SpecPhase::Sync => Self::evaluate_sync(output),
            SpecPhase::Complete => (1.0, Vec::new()),
        };

        let feedback_text = if feedback.is_empty() {
            None
        } else {
            Some(feedback.join("; "))
        };
        Ok(EvalResult::scored(score, self.threshold, feedback_text))
    }
}

/// Replays queued results in order; repeats the last one when drained.
pub struct ScriptedEvaluator {
    results: Mutex<Vec<EvalResult>>,
    fallback: EvalResult,
}

impl ScriptedEvaluator {
    pub fn new(results: Vec<EvalResult>) -> Self {
        Self {
            results: Mutex::new(results),
            fallback: EvalResult::scored(1.0, EvalResult::DEFAULT_THRESHOLD, None),
        }
    }

    /// Always passes.
    pub fn passing() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl PhaseEvaluator for ScriptedEvaluator {
    async fn evaluate(
        &self,
        _phase: SpecPhase,
        _output: &serde_json::Value,
        _accumulated: &serde_json::Value,
    ) -> DomainResult<EvalResult> {
        let mut results = self.results.lock().await;
        if results.is_empty() {
            Ok(self.fallback.clone())
        } else {
            Ok(results.remove(0))
        }
    }
}
