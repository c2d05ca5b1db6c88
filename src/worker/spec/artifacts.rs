//! Markdown artifacts with strict YAML frontmatter.
//!
//! The SYNC phase renders requirements, design, tasks, and tickets as
//! markdown files under the output directory:
//! `requirements/*.md`, `design/*.md`, `tasks/*.md`, `tickets/*.md`.
//! Every file begins with a `---` delimited YAML block; the body follows a
//! blank line. `parse(render(x)) = x` for every well-formed artifact.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::domain::errors::{DomainError, DomainResult};

/// Normalized artifact status set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArtifactStatus {
    Draft,
    Review,
    Implemented,
    Archived,
}

impl Default for ArtifactStatus {
    fn default() -> Self {
        Self::Draft
    }
}

impl ArtifactStatus {
    /// Fold free-form status strings onto the allowed set.
    pub fn normalize(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "draft" | "todo" | "new" | "open" | "pending" => Some(Self::Draft),
            "review" | "in_review" | "in-review" | "reviewing" => Some(Self::Review),
            "implemented" | "done" | "complete" | "completed" | "closed" => {
                Some(Self::Implemented)
            }
            "archived" | "obsolete" | "deprecated" => Some(Self::Archived),
            _ => None,
        }
    }
}

/// `dependencies:` block shared by task and ticket frontmatter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyRefs {
    #[serde(default)]
    pub blocked_by: Vec<String>,
    #[serde(default)]
    pub blocks: Vec<String>,
}

/// Frontmatter for `requirements/*.md` (`REQ-<AREA>-<SUB>-<NNN>`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequirementFrontmatter {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub status: ArtifactStatus,
    #[serde(default)]
    pub priority: Option<String>,
}

/// Frontmatter for `design/*.md` (`DES-<NNN>`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesignFrontmatter {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub status: ArtifactStatus,
    /// Requirement ids this design element satisfies
    #[serde(default)]
    pub requirements: Vec<String>,
}

/// Frontmatter for `tasks/*.md` (`TSK-<NNN>`, optionally prefixed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFrontmatter {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub status: ArtifactStatus,
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub design_refs: Vec<String>,
    #[serde(default)]
    pub dependencies: DependencyRefs,
    #[serde(default)]
    pub ticket: Option<String>,
    #[serde(default)]
    pub owned_files: Vec<String>,
}

/// Frontmatter for `tickets/*.md` (`TKT-<NNN>`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketFrontmatter {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub status: ArtifactStatus,
    #[serde(default)]
    pub dependencies: DependencyRefs,
}

/// Render a frontmatter model and body as a complete markdown document.
pub fn render_markdown<T: Serialize>(frontmatter: &T, body: &str) -> DomainResult<String> {
    let yaml = serde_yaml::to_string(frontmatter)?;
    Ok(format!("---\n{yaml}---\n\n{body}"))
}

/// Parse a markdown document into `(frontmatter, body)`.
pub fn parse_markdown<T: DeserializeOwned>(content: &str) -> DomainResult<(T, String)> {
    let text = content.trim_start();
    if !text.starts_with("---") {
        return Err(DomainError::ValidationFailed(
            "missing frontmatter delimiter".to_string(),
        ));
    }
    let after = &text[3..];
    let Some(end) = after.find("\n---") else {
        return Err(DomainError::ValidationFailed(
            "unclosed frontmatter block".to_string(),
        ));
    };
    let yaml = &after[..end];
    let body = after[end + 4..].trim_start_matches('\n').trim_end();

    let frontmatter = serde_yaml::from_str(yaml)?;
    Ok((frontmatter, body.to_string()))
}

/// Sequential zero-padded id of the form `<PREFIX>-NNN`.
pub fn format_id(prefix: &str, number: u32) -> String {
    format!("{prefix}-{number:03}")
}

/// Lightweight Mermaid syntax check: a known diagram header and balanced
/// content.
pub fn validate_mermaid(diagram: &str) -> bool {
    let trimmed = diagram.trim();
    let Some(first_line) = trimmed.lines().next() else {
        return false;
    };
    let header_ok = ["graph", "flowchart", "sequenceDiagram", "classDiagram", "stateDiagram"]
        .iter()
        .any(|prefix| first_line.trim_start().starts_with(prefix));
    header_ok && trimmed.lines().count() >= 2
}

/// The four artifact subdirectories under the output root.
pub fn artifact_dirs(output_dir: &Path) -> [PathBuf; 4] {
    [
        output_dir.join("requirements"),
        output_dir.join("design"),
        output_dir.join("tasks"),
        output_dir.join("tickets"),
    ]
}

/// Write one artifact file, creating the directory as needed.
pub async fn write_artifact<T: Serialize>(
    dir: &Path,
    id: &str,
    frontmatter: &T,
    body: &str,
) -> DomainResult<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(format!("{}.md", id.to_lowercase()));
    let content = render_markdown(frontmatter, body)?;
    tokio::fs::write(&path, content).await?;
    Ok(path)
}
