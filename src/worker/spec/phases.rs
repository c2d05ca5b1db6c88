//! Per-phase prompt templates.
//!
//! Each phase prompt is parameterized by the spec title, description, and
//! the accumulated context from earlier phases. Executors must write their
//! structured output to `<output>/<phase>.json`; the state machine reads
//! that file, never chat text.

use crate::domain::models::SpecPhase;
use crate::domain::ports::PhaseContext;

/// Tools each phase is allowed to use.
pub fn allowed_tools(phase: SpecPhase) -> &'static [&'static str] {
    match phase {
        SpecPhase::Explore => &["Read", "Glob", "Grep"],
        SpecPhase::Requirements | SpecPhase::Design | SpecPhase::Tasks => {
            &["Read", "Glob", "Grep", "Write"]
        }
        SpecPhase::Sync => &["Read", "Write", "Glob"],
        SpecPhase::Complete => &[],
    }
}

/// Build the prompt for one phase attempt.
pub fn prompt_for(phase: SpecPhase, context: &PhaseContext) -> String {
    let output_file = context.output_dir.join(format!("{}.json", phase.as_str()));
    let output_file = output_file.display();

    let body = match phase {
        SpecPhase::Explore => format!(
            "Explore the codebase to understand its architecture, patterns, and the files \
             relevant to this spec.\n\nSpec: {title}\n\n{description}\n\n\
             Write your findings as JSON to {output_file} with keys: \
             `architecture` (string), `key_files` (array of paths), `patterns` (array of strings), \
             `constraints` (array of strings).",
            title = context.spec_title,
            description = context.spec_description,
        ),
        SpecPhase::Requirements => format!(
            "Derive structured requirements for this spec using normative language \
             (SHALL/SHOULD/MAY/MUST).\n\nSpec: {title}\n\n{description}\n\n\
             Exploration context:\n{context}\n\n\
             Write JSON to {output_file} with key `requirements`: an array of objects \
             {{`id`: \"REQ-<AREA>-<SUB>-<NNN>\", `title`, `statement`, `priority`}}.",
            title = context.spec_title,
            description = context.spec_description,
            context = context.accumulated,
        ),
        SpecPhase::Design => format!(
            "Produce an architecture design satisfying the requirements.\n\n\
             Spec: {title}\n\nAccumulated context:\n{context}\n\n\
             Write JSON to {output_file} with keys: `overview` (string), \
             `components` (array of {{`id`: \"DES-<NNN>\", `name`, `responsibility`, `requirements`}}), \
             `diagram` (a Mermaid `graph` definition).",
            title = context.spec_title,
            context = context.accumulated,
        ),
        SpecPhase::Tasks => format!(
            "Break the design into discrete, actionable tasks.\n\n\
             Spec: {title}\n\nAccumulated context:\n{context}\n\n\
             Write JSON to {output_file} with key `tasks`: an array of objects \
             {{`id`: \"TSK-<NNN>\", `title`, `description`, `requirements` (REQ ids), \
             `design_refs` (DES ids), `depends_on` (TSK ids), `owned_files` (globs)}}.",
            title = context.spec_title,
            context = context.accumulated,
        ),
        SpecPhase::Sync => format!(
            "Synchronize the generated artifacts: render requirements, design, tasks, and \
             tickets as markdown files with YAML frontmatter under the output directory, then \
             summarize.\n\nSpec: {title}\n\nAccumulated context:\n{context}\n\n\
             Write JSON to {output_file} with keys: `artifacts` (array of written paths), \
             `tickets` (array of {{`id`: \"TKT-<NNN>\", `title`, `dependencies`: \
             {{`blocked_by`, `blocks`}}}}).",
            title = context.spec_title,
            context = context.accumulated,
        ),
        SpecPhase::Complete => String::new(),
    };

    match &context.feedback {
        Some(feedback) => format!(
            "{body}\n\nA previous attempt did not pass evaluation. Address this feedback:\n{feedback}"
        ),
        None => body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn context() -> PhaseContext {
        PhaseContext {
            spec_id: uuid::Uuid::new_v4(),
            spec_title: "Search".to_string(),
            spec_description: "Add search".to_string(),
            accumulated: serde_json::json!({}),
            feedback: None,
            output_dir: PathBuf::from(".spec-output"),
        }
    }

    #[test]
    fn test_prompts_name_the_output_file() {
        for phase in SpecPhase::WORKFLOW {
            let prompt = prompt_for(phase, &context());
            assert!(
                prompt.contains(&format!("{}.json", phase.as_str())),
                "{phase:?} prompt must name its output file"
            );
        }
    }

    #[test]
    fn test_feedback_appended_on_retry() {
        let mut ctx = context();
        ctx.feedback = Some("ids must be unique".to_string());
        let prompt = prompt_for(SpecPhase::Requirements, &ctx);
        assert!(prompt.contains("ids must be unique"));
        assert!(prompt.contains("previous attempt"));
    }

    #[test]
    fn test_explore_is_read_only() {
        assert!(!allowed_tools(SpecPhase::Explore).contains(&"Write"));
        assert!(allowed_tools(SpecPhase::Sync).contains(&"Write"));
    }
}
