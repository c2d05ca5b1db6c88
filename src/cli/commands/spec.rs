//! `foreman spec` handlers.

use std::path::Path;

use anyhow::{Context, Result};

use crate::cli::display::table;
use crate::cli::ShowTarget;
use crate::domain::models::{Spec, SpecPhase, Ticket};
use crate::domain::ports::{SpecRepository, TicketRepository};
use crate::infrastructure::database::{SpecRepositoryImpl, TicketRepositoryImpl};
use crate::worker::spec::artifacts::{
    write_artifact, ArtifactStatus, DependencyRefs, TicketFrontmatter,
};
use crate::worker::spec::validate::ArtifactSet;

/// `spec show <target>`
pub async fn handle_show(target: ShowTarget, dir: &Path, json: bool) -> Result<()> {
    let set = ArtifactSet::load(dir)
        .await
        .context("failed to load artifacts")?;

    match target {
        ShowTarget::All => {
            if json {
                println!(
                    "{}",
                    serde_json::json!({
                        "requirements": set.requirements,
                        "designs": set.designs,
                        "tasks": set.tasks,
                        "tickets": set.tickets,
                    })
                );
            } else {
                println!(
                    "{} requirements, {} design elements, {} tasks, {} tickets",
                    set.requirements.len(),
                    set.designs.len(),
                    set.tasks.len(),
                    set.tickets.len()
                );
                println!("{}", table::tickets_table(&set));
                println!("{}", table::tasks_table(&set));
            }
        }
        ShowTarget::Tickets => {
            if json {
                println!("{}", serde_json::to_string_pretty(&set.tickets)?);
            } else {
                println!("{}", table::tickets_table(&set));
            }
        }
        ShowTarget::Tasks => {
            if json {
                println!("{}", serde_json::to_string_pretty(&set.tasks)?);
            } else {
                println!("{}", table::tasks_table(&set));
            }
        }
        ShowTarget::Ready => {
            let implemented: std::collections::HashSet<&str> = set
                .tasks
                .iter()
                .filter(|t| t.status == ArtifactStatus::Implemented)
                .map(|t| t.id.as_str())
                .collect();
            let ready: Vec<_> = set
                .tasks
                .iter()
                .filter(|t| {
                    t.status == ArtifactStatus::Draft
                        && t.dependencies
                            .blocked_by
                            .iter()
                            .all(|dep| implemented.contains(dep.as_str()))
                })
                .collect();
            if json {
                println!("{}", serde_json::to_string_pretty(&ready)?);
            } else if ready.is_empty() {
                println!("no tasks are ready");
            } else {
                for task in ready {
                    println!("{}  {}", task.id, task.title);
                }
            }
        }
        ShowTarget::Graph => {
            for line in table::graph_lines(&set) {
                println!("{line}");
            }
        }
    }
    Ok(())
}

/// `spec validate` — exit code 0 iff all invariants hold.
pub async fn handle_validate(dir: &Path, json: bool) -> Result<bool> {
    let set = ArtifactSet::load(dir)
        .await
        .context("failed to load artifacts")?;
    let report = set.validate();

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", table::render_report(&report));
    }
    Ok(report.is_valid())
}

/// `spec sync push` — upload local artifacts into the entity store.
pub async fn handle_sync_push(
    dir: &Path,
    spec_repo: &SpecRepositoryImpl,
    ticket_repo: &TicketRepositoryImpl,
    json: bool,
) -> Result<()> {
    let set = ArtifactSet::load(dir)
        .await
        .context("failed to load artifacts")?;
    let report = set.validate();
    anyhow::ensure!(
        report.is_valid(),
        "artifacts do not validate; run `foreman spec validate` first"
    );

    // One spec record anchors the pushed artifact set.
    let mut spec = Spec::new("Pushed artifacts", format!("Synced from {}", dir.display()));
    spec.current_phase = SpecPhase::Complete;
    spec_repo.create(&spec).await?;

    let mut pushed = 0usize;
    for frontmatter in &set.tickets {
        let ticket = Ticket::new(frontmatter.title.clone(), String::new()).with_spec(spec.id);
        ticket_repo.create(&ticket).await?;
        pushed += 1;
    }

    if json {
        println!(
            "{}",
            serde_json::json!({"spec_id": spec.id, "tickets_pushed": pushed})
        );
    } else {
        println!("pushed {pushed} tickets under spec {}", spec.id);
    }
    Ok(())
}

/// `spec sync pull` — materialize store tickets as local artifacts.
pub async fn handle_sync_pull(
    dir: &Path,
    spec_repo: &SpecRepositoryImpl,
    ticket_repo: &TicketRepositoryImpl,
    json: bool,
) -> Result<()> {
    let specs = spec_repo.list_active().await?;
    let mut pulled = 0usize;
    let ticket_dir = dir.join("tickets");

    for spec in &specs {
        for (index, ticket) in ticket_repo.list_by_spec(spec.id).await?.iter().enumerate() {
            let frontmatter = TicketFrontmatter {
                id: crate::worker::spec::artifacts::format_id("TKT", (pulled + index + 1) as u32),
                title: ticket.title.clone(),
                status: ArtifactStatus::Draft,
                dependencies: DependencyRefs::default(),
            };
            write_artifact(&ticket_dir, &frontmatter.id, &frontmatter, &ticket.description)
                .await?;
        }
        pulled += ticket_repo.list_by_spec(spec.id).await?.len();
    }

    if json {
        println!("{}", serde_json::json!({"tickets_pulled": pulled}));
    } else {
        println!("pulled {pulled} tickets into {}", ticket_dir.display());
    }
    Ok(())
}
