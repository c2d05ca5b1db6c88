//! Spec phase workflow: prompts, executors, evaluators, artifacts,
//! validation, and the state machine.

pub mod artifacts;
pub mod evaluator;
pub mod executor;
pub mod machine;
pub mod phases;
pub mod validate;

pub use evaluator::{ScriptedEvaluator, StructuralEvaluator};
pub use executor::{AgentPhaseExecutor, ScriptedExecutor};
pub use machine::{SpecMachineConfig, SpecRunOutcome, SpecStateMachine};
pub use validate::{ArtifactSet, ValidationIssue, ValidationReport};
