//! Property-based invariants: legal state-machine paths, strictly
//! increasing heartbeat sequences, frontmatter round-trips, budget
//! conservation, and SCC rejection.

mod common;

use proptest::prelude::*;

use foreman::domain::models::{Agent, AgentStatus, Budget, BudgetScope, Task, TaskStatus};
use foreman::worker::spec::artifacts::{
    parse_markdown, render_markdown, ArtifactStatus, DependencyRefs, TaskFrontmatter,
    TicketFrontmatter,
};
use foreman::worker::spec::validate::tarjan_sccs;

fn agent_status_strategy() -> impl Strategy<Value = AgentStatus> {
    prop_oneof![
        Just(AgentStatus::Spawning),
        Just(AgentStatus::Idle),
        Just(AgentStatus::Running),
        Just(AgentStatus::Degraded),
        Just(AgentStatus::Failed),
        Just(AgentStatus::Quarantined),
        Just(AgentStatus::Terminated),
    ]
}

fn task_status_strategy() -> impl Strategy<Value = TaskStatus> {
    prop_oneof![
        Just(TaskStatus::Pending),
        Just(TaskStatus::Assigned),
        Just(TaskStatus::Running),
        Just(TaskStatus::Succeeded),
        Just(TaskStatus::Failed),
        Just(TaskStatus::Canceled),
    ]
}

fn ident() -> impl Strategy<Value = String> {
    "[A-Za-z0-9 _.-]{1,40}"
}

proptest! {
    /// Every status an agent ever holds is reachable through the
    /// published graph; once TERMINATED, nothing moves.
    #[test]
    fn agent_observed_statuses_form_a_legal_path(
        targets in proptest::collection::vec(agent_status_strategy(), 0..30)
    ) {
        let mut agent = Agent::new("prop", "coder");
        let mut previous = agent.status;

        for target in targets {
            let legal = previous.can_transition_to(target);
            let result = agent.transition_to(target);
            prop_assert_eq!(result.is_ok(), legal);
            if legal {
                previous = target;
            } else {
                // A rejected transition never mutates.
                prop_assert_eq!(agent.status, previous);
            }
            if previous == AgentStatus::Terminated {
                prop_assert!(previous.valid_transitions().is_empty());
            }
        }
    }

    /// Same property for the task state machine.
    #[test]
    fn task_observed_statuses_form_a_legal_path(
        targets in proptest::collection::vec(task_status_strategy(), 0..30)
    ) {
        let mut task = Task::new("prop", "d");
        let mut previous = task.status;

        for target in targets {
            let legal = previous.can_transition_to(target);
            let result = task.transition_to(target);
            prop_assert_eq!(result.is_ok(), legal);
            if legal {
                previous = target;
            }
        }
    }

    /// Accepted heartbeat sequence numbers are strictly increasing: a
    /// message is applied iff its sequence exceeds the last accepted one.
    #[test]
    fn accepted_heartbeat_sequences_strictly_increase(
        sequences in proptest::collection::vec(0u64..200, 1..60)
    ) {
        let mut last_accepted: u64 = 0;
        let mut accepted = Vec::new();

        for sequence in sequences {
            // Replay rule from the monitor: apply only newer sequences.
            if sequence > last_accepted {
                accepted.push(sequence);
                last_accepted = sequence;
            }
        }

        prop_assert!(accepted.windows(2).all(|w| w[0] < w[1]));
    }

    /// parse(render(x)) = x for ticket frontmatter.
    #[test]
    fn ticket_frontmatter_round_trips(
        id_num in 1u32..999,
        title in ident(),
        blocked_by in proptest::collection::vec(1u32..999, 0..5),
        body in "[A-Za-z0-9 \n_.-]{0,200}",
    ) {
        let frontmatter = TicketFrontmatter {
            id: format!("TKT-{id_num:03}"),
            title,
            status: ArtifactStatus::Draft,
            dependencies: DependencyRefs {
                blocked_by: blocked_by.iter().map(|n| format!("TKT-{n:03}")).collect(),
                blocks: Vec::new(),
            },
        };
        let rendered = render_markdown(&frontmatter, body.trim()).unwrap();
        let (parsed, parsed_body): (TicketFrontmatter, String) =
            parse_markdown(&rendered).unwrap();
        prop_assert_eq!(parsed, frontmatter);
        prop_assert_eq!(parsed_body, body.trim());
    }

    /// parse(render(x)) = x for task frontmatter.
    #[test]
    fn task_frontmatter_round_trips(
        id_num in 1u32..999,
        title in ident(),
        requirements in proptest::collection::vec(1u32..99, 0..4),
    ) {
        let frontmatter = TaskFrontmatter {
            id: format!("TSK-{id_num:03}"),
            title,
            status: ArtifactStatus::Review,
            requirements: requirements
                .iter()
                .map(|n| format!("REQ-COR-SCH-{n:03}"))
                .collect(),
            design_refs: Vec::new(),
            dependencies: DependencyRefs::default(),
            ticket: None,
            owned_files: vec!["src/**/*.rs".to_string()],
        };
        let rendered = render_markdown(&frontmatter, "Body").unwrap();
        let (parsed, _): (TaskFrontmatter, String) = parse_markdown(&rendered).unwrap();
        prop_assert_eq!(parsed, frontmatter);
    }

    /// spent + reserved never exceeds the limit, whatever the operation
    /// sequence.
    #[test]
    fn budget_conservation_holds(
        ops in proptest::collection::vec((0u8..3, 0.0f64..2.0), 0..40)
    ) {
        let mut budget = Budget::new(BudgetScope::Task, "prop", 5.0);
        let mut outstanding: Vec<f64> = Vec::new();

        for (op, amount) in ops {
            match op {
                0 => {
                    if budget.reserve(amount).is_ok() {
                        outstanding.push(amount);
                    }
                }
                1 => {
                    if let Some(reserved) = outstanding.pop() {
                        // Actual settles at or below the reservation.
                        budget.settle(reserved, reserved.min(amount));
                    }
                }
                _ => {
                    if let Some(reserved) = outstanding.pop() {
                        budget.release(reserved);
                    }
                }
            }
            prop_assert!(
                budget.spent_usd + budget.reserved_usd <= budget.limit_usd + 1e-9,
                "spent {} + reserved {} > limit {}",
                budget.spent_usd,
                budget.reserved_usd,
                budget.limit_usd
            );
        }
    }

    /// A graph with a known cycle always yields an SCC of size > 1; a DAG
    /// never does.
    #[test]
    fn tarjan_detects_planted_cycles(chain_len in 2usize..12, close_cycle in any::<bool>()) {
        let mut graph = std::collections::HashMap::new();
        for i in 0..chain_len {
            let deps = if i == 0 {
                if close_cycle {
                    vec![format!("n{}", chain_len - 1)]
                } else {
                    Vec::new()
                }
            } else {
                vec![format!("n{}", i - 1)]
            };
            graph.insert(format!("n{i}"), deps);
        }

        let has_big_scc = tarjan_sccs(&graph).iter().any(|scc| scc.len() > 1);
        prop_assert_eq!(has_big_scc, close_cycle);
    }
}
