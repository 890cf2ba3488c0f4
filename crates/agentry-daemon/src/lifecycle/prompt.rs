//! Run prompt assembly.
//!
//! Section order is fixed so the same inputs always yield the same prompt:
//! Role (only with a profile template), Task, Project Memory (only when
//! there are entries), Write Scope.

use std::fmt::Write as _;

use crate::storage::{ProjectMemory, Task};

pub fn assemble_prompt(
    task: &Task,
    prompt_template: Option<&str>,
    memory: &[ProjectMemory],
    write_scope: &[String],
) -> String {
    let mut out = String::new();

    if let Some(template) = prompt_template.map(str::trim).filter(|t| !t.is_empty()) {
        let _ = write!(out, "## Role\n\n{template}\n\n");
    }

    let _ = write!(out, "## Task\n\n{}\n", task.title.trim());
    let description = task.description.trim();
    if !description.is_empty() {
        let _ = write!(out, "\n{description}\n");
    }

    if !memory.is_empty() {
        out.push_str("\n## Project Memory\n\n");
        for entry in memory {
            let _ = writeln!(out, "- [{}] {}", entry.memory_type, entry.content.trim());
        }
    }

    let patterns = write_scope
        .iter()
        .map(|p| format!("`{p}`"))
        .collect::<Vec<_>>()
        .join(", ");
    let _ = write!(
        out,
        "\n## Write Scope\n\nOnly modify files matching: {patterns}. \
         Changes outside these paths are recorded as scope violations.\n"
    );

    out
}
