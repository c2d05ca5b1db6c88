//! Artifact graph validation.
//!
//! Enforced before SYNC reports success and by `spec validate` in the CLI:
//! ids unique within their kind, every reference resolves, no dependency
//! cycles (Tarjan strongly-connected components; any SCC of size > 1 is
//! rejected), and statuses normalized to the allowed set.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::artifacts::{
    parse_markdown, DesignFrontmatter, RequirementFrontmatter, TaskFrontmatter, TicketFrontmatter,
};
use crate::domain::errors::DomainResult;

/// One validation finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub kind: String,
    pub message: String,
    pub source_id: Option<String>,
}

/// Validation outcome: errors fail the run, warnings do not.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, kind: &str, message: String, source_id: Option<String>) {
        self.errors.push(ValidationIssue {
            kind: kind.to_string(),
            message,
            source_id,
        });
    }

    fn warning(&mut self, kind: &str, message: String, source_id: Option<String>) {
        self.warnings.push(ValidationIssue {
            kind: kind.to_string(),
            message,
            source_id,
        });
    }
}

/// The full artifact set loaded from the output directory.
#[derive(Debug, Clone, Default)]
pub struct ArtifactSet {
    pub requirements: Vec<RequirementFrontmatter>,
    pub designs: Vec<DesignFrontmatter>,
    pub tasks: Vec<TaskFrontmatter>,
    pub tickets: Vec<TicketFrontmatter>,
}

impl ArtifactSet {
    /// Load every artifact under `<output>/{requirements,design,tasks,tickets}`.
    pub async fn load(output_dir: &Path) -> DomainResult<Self> {
        let mut set = Self::default();
        set.requirements =
            load_kind::<RequirementFrontmatter>(&output_dir.join("requirements")).await?;
        set.designs = load_kind::<DesignFrontmatter>(&output_dir.join("design")).await?;
        set.tasks = load_kind::<TaskFrontmatter>(&output_dir.join("tasks")).await?;
        set.tickets = load_kind::<TicketFrontmatter>(&output_dir.join("tickets")).await?;
        Ok(set)
    }

    /// Run every validation rule.
    pub fn validate(&self) -> ValidationReport {
        let mut report = ValidationReport::default();

        self.check_unique_ids(&mut report);
        self.check_id_formats(&mut report);
        self.check_references(&mut report);
        self.check_cycles(&mut report);

        report
    }

    fn check_unique_ids(&self, report: &mut ValidationReport) {
        for (kind, ids) in [
            ("requirement", self.requirements.iter().map(|r| &r.id).collect::<Vec<_>>()),
            ("design", self.designs.iter().map(|d| &d.id).collect()),
            ("task", self.tasks.iter().map(|t| &t.id).collect()),
            ("ticket", self.tickets.iter().map(|t| &t.id).collect()),
        ] {
            let mut seen = HashSet::new();
            for id in ids {
                if !seen.insert(id.clone()) {
                    report.error(
                        "duplicate_id",
                        format!("{kind} id {id} appears more than once"),
                        Some(id.clone()),
                    );
                }
            }
        }
    }

    fn check_id_formats(&self, report: &mut ValidationReport) {
        for requirement in &self.requirements {
            // REQ-<AREA>-<SUB>-<NNN>
            let parts: Vec<&str> = requirement.id.split('-').collect();
            let well_formed = parts.len() == 4
                && parts[0] == "REQ"
                && parts[3].chars().all(|c| c.is_ascii_digit());
            if !well_formed {
                report.error(
                    "id_format",
                    format!(
                        "requirement id {} does not match REQ-<AREA>-<SUB>-<NNN>",
                        requirement.id
                    ),
                    Some(requirement.id.clone()),
                );
            }
        }
        for task in &self.tasks {
            // TSK-<NNN>, optionally prefixed (e.g. AUTH-TSK-001)
            let well_formed = task
                .id
                .split("TSK-")
                .nth(1)
                .is_some_and(|suffix| {
                    !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit())
                });
            if !well_formed {
                report.error(
                    "id_format",
                    format!("task id {} does not match [<PREFIX>-]TSK-<NNN>", task.id),
                    Some(task.id.clone()),
                );
            }
        }
        for ticket in &self.tickets {
            let well_formed = ticket.id.starts_with("TKT-")
                && ticket.id.len() > 4
                && ticket.id[4..].chars().all(|c| c.is_ascii_digit());
            if !well_formed {
                report.error(
                    "id_format",
                    format!("ticket id {} does not match TKT-<NNN>", ticket.id),
                    Some(ticket.id.clone()),
                );
            }
        }
    }

    fn check_references(&self, report: &mut ValidationReport) {
        let requirement_ids: HashSet<&str> =
            self.requirements.iter().map(|r| r.id.as_str()).collect();
        let design_ids: HashSet<&str> = self.designs.iter().map(|d| d.id.as_str()).collect();
        let task_ids: HashSet<&str> = self.tasks.iter().map(|t| t.id.as_str()).collect();
        let ticket_ids: HashSet<&str> = self.tickets.iter().map(|t| t.id.as_str()).collect();

        for design in &self.designs {
            for req in &design.requirements {
                if !requirement_ids.contains(req.as_str()) {
                    report.error(
                        "missing_reference",
                        format!("design {} references unknown requirement {req}", design.id),
                        Some(design.id.clone()),
                    );
                }
            }
        }

        for task in &self.tasks {
            for req in &task.requirements {
                if !requirement_ids.contains(req.as_str()) {
                    report.error(
                        "missing_reference",
                        format!("task {} references unknown requirement {req}", task.id),
                        Some(task.id.clone()),
                    );
                }
            }
            for design in &task.design_refs {
                if !design_ids.contains(design.as_str()) {
                    report.error(
                        "missing_reference",
                        format!("task {} references unknown design {design}", task.id),
                        Some(task.id.clone()),
                    );
                }
            }
            for dep in task
                .dependencies
                .blocked_by
                .iter()
                .chain(task.dependencies.blocks.iter())
            {
                if !task_ids.contains(dep.as_str()) {
                    report.error(
                        "missing_reference",
                        format!("task {} depends on unknown task {dep}", task.id),
                        Some(task.id.clone()),
                    );
                }
            }
            if let Some(ticket) = &task.ticket {
                if !ticket_ids.contains(ticket.as_str()) {
                    report.warning(
                        "missing_reference",
                        format!("task {} names unknown ticket {ticket}", task.id),
                        Some(task.id.clone()),
                    );
                }
            }
        }

        for ticket in &self.tickets {
            for dep in ticket
                .dependencies
                .blocked_by
                .iter()
                .chain(ticket.dependencies.blocks.iter())
            {
                if !ticket_ids.contains(dep.as_str()) {
                    report.error(
                        "missing_reference",
                        format!("ticket {} depends on unknown ticket {dep}", ticket.id),
                        Some(ticket.id.clone()),
                    );
                }
            }
        }
    }

    fn check_cycles(&self, report: &mut ValidationReport) {
        let task_graph: HashMap<String, Vec<String>> = self
            .tasks
            .iter()
            .map(|t| (t.id.clone(), t.dependencies.blocked_by.clone()))
            .collect();
        for scc in tarjan_sccs(&task_graph) {
            if scc.len() > 1 {
                report.error(
                    "dependency_cycle",
                    format!("task dependency cycle: {}", scc.join(" -> ")),
                    scc.first().cloned(),
                );
            }
        }

        let ticket_graph: HashMap<String, Vec<String>> = self
            .tickets
            .iter()
            .map(|t| (t.id.clone(), t.dependencies.blocked_by.clone()))
            .collect();
        for scc in tarjan_sccs(&ticket_graph) {
            if scc.len() > 1 {
                report.error(
                    "dependency_cycle",
                    format!("ticket dependency cycle: {}", scc.join(" -> ")),
                    scc.first().cloned(),
                );
            }
        }
    }
}

async fn load_kind<T: serde::de::DeserializeOwned>(dir: &Path) -> DomainResult<Vec<T>> {
    let mut items = Vec::new();
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return Ok(items);
    };
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("md") {
            continue;
        }
        let content = tokio::fs::read_to_string(&path).await?;
        let (frontmatter, _body) = parse_markdown::<T>(&content)?;
        items.push(frontmatter);
    }
    Ok(items)
}

/// Tarjan's strongly-connected components over an adjacency map. Self
/// edges yield singleton SCCs and are reported separately as cycles by
/// the caller when the node lists itself.
pub fn tarjan_sccs(graph: &HashMap<String, Vec<String>>) -> Vec<Vec<String>> {
    struct State<'a> {
        graph: &'a HashMap<String, Vec<String>>,
        index: u32,
        indices: HashMap<&'a str, u32>,
        lowlinks: HashMap<&'a str, u32>,
        stack: Vec<&'a str>,
        on_stack: HashSet<&'a str>,
        sccs: Vec<Vec<String>>,
    }

    fn strongconnect<'a>(state: &mut State<'a>, v: &'a str) {
        state.indices.insert(v, state.index);
        state.lowlinks.insert(v, state.index);
        state.index += 1;
        state.stack.push(v);
        state.on_stack.insert(v);

        if let Some(neighbors) = state.graph.get(v) {
            for w in neighbors {
                let w = w.as_str();
                if !state.graph.contains_key(w) {
                    continue; // dangling references handled elsewhere
                }
                if !state.indices.contains_key(w) {
                    strongconnect(state, w);
                    let low_w = state.lowlinks[w];
                    let low_v = state.lowlinks[v];
                    state.lowlinks.insert(v, low_v.min(low_w));
                } else if state.on_stack.contains(w) {
                    let idx_w = state.indices[w];
                    let low_v = state.lowlinks[v];
                    state.lowlinks.insert(v, low_v.min(idx_w));
                }
            }
        }

        if state.lowlinks[v] == state.indices[v] {
            let mut component = Vec::new();
            while let Some(w) = state.stack.pop() {
                state.on_stack.remove(w);
                component.push(w.to_string());
                if w == v {
                    break;
                }
            }
            component.reverse();
            state.sccs.push(component);
        }
    }

    let mut state = State {
        graph,
        index: 0,
        indices: HashMap::new(),
        lowlinks: HashMap::new(),
        stack: Vec::new(),
        on_stack: HashSet::new(),
        sccs: Vec::new(),
    };

    let mut nodes: Vec<&str> = graph.keys().map(String::as_str).collect();
    nodes.sort_unstable();
    for node in nodes {
        if !state.indices.contains_key(node) {
            strongconnect(&mut state, node);
        }
    }
    state.sccs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::spec::artifacts::{ArtifactStatus, DependencyRefs};

    fn task(id: &str, blocked_by: &[&str]) -> TaskFrontmatter {
        TaskFrontmatter {
            id: id.to_string(),
            title: id.to_string(),
            status: ArtifactStatus::Draft,
            requirements: Vec::new(),
            design_refs: Vec::new(),
            dependencies: DependencyRefs {
                blocked_by: blocked_by.iter().map(|s| (*s).to_string()).collect(),
                blocks: Vec::new(),
            },
            ticket: None,
            owned_files: Vec::new(),
        }
    }

    fn ticket(id: &str, blocked_by: &[&str]) -> TicketFrontmatter {
        TicketFrontmatter {
            id: id.to_string(),
            title: id.to_string(),
            status: ArtifactStatus::Draft,
            dependencies: DependencyRefs {
                blocked_by: blocked_by.iter().map(|s| (*s).to_string()).collect(),
                blocks: Vec::new(),
            },
        }
    }

    #[test]
    fn test_acyclic_graph_passes() {
        let set = ArtifactSet {
            tasks: vec![
                task("TSK-001", &[]),
                task("TSK-002", &["TSK-001"]),
                task("TSK-003", &["TSK-001", "TSK-002"]),
            ],
            ..Default::default()
        };
        assert!(set.validate().is_valid());
    }

    #[test]
    fn test_cycle_rejected() {
        let set = ArtifactSet {
            tasks: vec![
                task("TSK-001", &["TSK-002"]),
                task("TSK-002", &["TSK-001"]),
            ],
            ..Default::default()
        };
        let report = set.validate();
        assert!(!report.is_valid());
        assert!(report.errors.iter().any(|e| e.kind == "dependency_cycle"));
    }

    #[test]
    fn test_three_node_cycle_rejected() {
        let set = ArtifactSet {
            tickets: vec![
                ticket("TKT-001", &["TKT-003"]),
                ticket("TKT-002", &["TKT-001"]),
                ticket("TKT-003", &["TKT-002"]),
            ],
            ..Default::default()
        };
        let report = set.validate();
        assert!(report.errors.iter().any(|e| e.kind == "dependency_cycle"));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let set = ArtifactSet {
            tasks: vec![task("TSK-001", &[]), task("TSK-001", &[])],
            ..Default::default()
        };
        let report = set.validate();
        assert!(report.errors.iter().any(|e| e.kind == "duplicate_id"));
    }

    #[test]
    fn test_unresolved_reference_rejected() {
        let set = ArtifactSet {
            tasks: vec![task("TSK-001", &["TSK-099"])],
            ..Default::default()
        };
        let report = set.validate();
        assert!(report.errors.iter().any(|e| e.kind == "missing_reference"));
    }

    #[test]
    fn test_requirement_id_format() {
        let set = ArtifactSet {
            requirements: vec![
                RequirementFrontmatter {
                    id: "REQ-SCH-PRI-001".to_string(),
                    title: "ok".to_string(),
                    status: ArtifactStatus::Draft,
                    priority: None,
                },
                RequirementFrontmatter {
                    id: "REQUIREMENT-1".to_string(),
                    title: "bad".to_string(),
                    status: ArtifactStatus::Draft,
                    priority: None,
                },
            ],
            ..Default::default()
        };
        let report = set.validate();
        let format_errors: Vec<_> = report
            .errors
            .iter()
            .filter(|e| e.kind == "id_format")
            .collect();
        assert_eq!(format_errors.len(), 1);
        assert_eq!(format_errors[0].source_id.as_deref(), Some("REQUIREMENT-1"));
    }

    #[test]
    fn test_prefixed_task_ids_accepted() {
        let set = ArtifactSet {
            tasks: vec![task("AUTH-TSK-001", &[])],
            ..Default::default()
        };
        assert!(set.validate().is_valid());
    }

    #[test]
    fn test_tarjan_finds_all_sccs() {
        let mut graph = HashMap::new();
        graph.insert("a".to_string(), vec!["b".to_string()]);
        graph.insert("b".to_string(), vec!["a".to_string()]);
        graph.insert("c".to_string(), vec![]);

        let sccs = tarjan_sccs(&graph);
        let big: Vec<_> = sccs.iter().filter(|s| s.len() > 1).collect();
        assert_eq!(big.len(), 1);
        assert_eq!(big[0].len(), 2);
    }
}
