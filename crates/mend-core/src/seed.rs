//! Error-log intake and initial-context seeding.
//!
//! Before the first inference call the session embeds short excerpts from the
//! files referenced in the error log, so the model starts with the failing
//! code in front of it instead of spending early turns rediscovering it.

use anyhow::{Context, Result};
use regex::Regex;
use std::path::Path;

/// Cap on error-log size fed into the prompt.
const MAX_LOG_LINES: usize = 2_000;
/// Lines of context shown on each side of a referenced line.
const EXCERPT_RADIUS: usize = 5;
/// How many distinct file excerpts to seed.
const MAX_SEED_FILES: usize = 3;

/// Read an error/build log, truncated to the first [`MAX_LOG_LINES`] lines.
pub fn read_error_log(path: &Path) -> Result<String> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read error log '{}'", path.display()))?;
    let lines: Vec<&str> = content.lines().take(MAX_LOG_LINES).collect();
    Ok(lines.join("\n"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentType {
    Frontend,
    Backend,
    Unknown,
}

impl ComponentType {
    pub fn label(&self) -> &'static str {
        match self {
            ComponentType::Frontend => "frontend",
            ComponentType::Backend => "backend",
            ComponentType::Unknown => "unknown",
        }
    }
}

/// Guess which side of the repository the errors come from, used only to
/// flavor the system prompt.
pub fn detect_component_type(error_log: &str) -> ComponentType {
    let lower = error_log.to_lowercase();
    if ["ui/", "vite", "react", "jsx", "tsx"]
        .iter()
        .any(|hint| lower.contains(hint))
    {
        return ComponentType::Frontend;
    }
    if ["backend/", "node", "express", "fastify"]
        .iter()
        .any(|hint| lower.contains(hint))
    {
        return ComponentType::Backend;
    }
    if error_log.contains("ui/") || error_log.contains("src/components") {
        ComponentType::Frontend
    } else if error_log.contains("backend/")
        || error_log.contains("src/lib")
        || error_log.contains("src/routes")
    {
        ComponentType::Backend
    } else {
        ComponentType::Unknown
    }
}

/// A `file:line` reference extracted from compiler/test output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorHint {
    pub file: String,
    pub line: usize,
}

/// Extract `file(line,col)` / `file:line:col` style references from the log.
pub fn extract_error_hints(error_log: &str) -> Vec<ErrorHint> {
    // Compiler formats seen in practice: tsc's `file(12,3)`, generic
    // `file:12:3`, and prose `Error in file:12`.
    let patterns = [
        r"((?:backend|ui|src)/[^\s:()]+\.[a-zA-Z]+)\((\d+),\d+\)",
        r"Error in ((?:backend|ui|src)/[^\s:()]+\.[a-zA-Z]+):(\d+)",
        r"((?:backend|ui|src)/[^\s:()]+\.[a-zA-Z]+):(\d+):\d+",
    ];

    let mut hints = Vec::new();
    for pattern in patterns {
        let re = match Regex::new(pattern) {
            Ok(re) => re,
            Err(_) => continue,
        };
        for caps in re.captures_iter(error_log) {
            let (Some(file), Some(line)) = (caps.get(1), caps.get(2)) else {
                continue;
            };
            let Ok(line) = line.as_str().parse::<usize>() else {
                continue;
            };
            let hint = ErrorHint {
                file: file.as_str().to_string(),
                line,
            };
            if !hints.contains(&hint) {
                hints.push(hint);
            }
        }
    }
    hints
}

/// Read a short excerpt around a 1-based line number.
pub fn read_excerpt(repo_root: &Path, file: &str, line: usize) -> Option<String> {
    let resolved = crate::util::resolve_under_root(repo_root, Path::new(file)).ok()?;
    let content = std::fs::read_to_string(&resolved.absolute).ok()?;
    let lines: Vec<&str> = content.lines().collect();
    if lines.is_empty() {
        return None;
    }

    let start = line.saturating_sub(1).saturating_sub(EXCERPT_RADIUS);
    let end = (line + EXCERPT_RADIUS).min(lines.len());
    if start >= end {
        return None;
    }

    let mut excerpt = String::new();
    for (offset, text) in lines[start..end].iter().enumerate() {
        excerpt.push_str(&format!("{:>5}| {}\n", start + offset + 1, text));
    }
    Some(excerpt)
}

/// Build the seeded-context block for the initial prompt: excerpts from up to
/// [`MAX_SEED_FILES`] files referenced in the errors.
pub fn seed_context_from_errors(repo_root: &Path, error_log: &str) -> String {
    let mut sections = Vec::new();
    for hint in extract_error_hints(error_log) {
        if let Some(excerpt) = read_excerpt(repo_root, &hint.file, hint.line) {
            sections.push(format!(
                "FILE: {}, around line {}\n{}",
                hint.file, hint.line, excerpt
            ));
        }
        if sections.len() >= MAX_SEED_FILES {
            break;
        }
    }

    if sections.is_empty() {
        "(no file excerpts found in errors)".to_string()
    } else {
        sections.join("\n\n")
    }
}
