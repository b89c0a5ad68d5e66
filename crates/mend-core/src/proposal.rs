//! The structured proposal contract shared by the propose, review, and apply
//! steps. This is the sole externally meaningful output of a session: a single
//! JSON document with an analysis and an ordered list of search/replace
//! changes.

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    /// Replace `search` text with `replace` text in an existing file.
    Modify,
    /// Create a new file whose full content is `replace`.
    Create,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Change {
    pub action: ChangeAction,
    /// Path from the repository root.
    pub file: String,
    /// Exact text to replace. Empty or absent for `create` actions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    pub replace: String,
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<Confidence>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredProposal {
    pub analysis: String,
    #[serde(default)]
    pub changes: Vec<Change>,
}

impl StructuredProposal {
    /// A well-formed document for fatal conditions: empty change list plus an
    /// explanatory analysis, so downstream automation can branch
    /// deterministically.
    pub fn failure(analysis: impl Into<String>) -> Self {
        Self {
            analysis: analysis.into(),
            changes: Vec::new(),
        }
    }

    pub fn to_json_pretty(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| {
            // Serialization of these plain-data types cannot fail in practice.
            "{\"analysis\": \"serialization error\", \"changes\": []}".to_string()
        })
    }

    /// Parse a terminal model response into a proposal, salvaging content
    /// wrapped in markdown fences or surrounding prose.
    pub fn from_model_content(content: &str) -> anyhow::Result<Self> {
        let trimmed = content.trim();
        if let Ok(proposal) = serde_json::from_str::<Self>(trimmed) {
            return Ok(proposal);
        }

        let unfenced = strip_markdown_fences(trimmed);
        if let Ok(proposal) = serde_json::from_str::<Self>(unfenced) {
            return Ok(proposal);
        }

        if let Some(fragment) = extract_json_fragment(unfenced, '{', '}') {
            if let Ok(proposal) = serde_json::from_str::<Self>(fragment) {
                return Ok(proposal);
            }
            let repaired = fix_json_issues(fragment);
            if let Ok(proposal) = serde_json::from_str::<Self>(&repaired) {
                return Ok(proposal);
            }
        }

        anyhow::bail!(
            "Response is not a valid proposal document: {}",
            crate::util::clip(trimmed, 200)
        )
    }

    /// Downstream validation: flag modify-changes whose search text is not
    /// found verbatim in the target file. The agent loop itself never calls
    /// this; the apply step does.
    pub fn validate_changes(&self, repo_root: &Path) -> Vec<String> {
        let mut issues = Vec::new();
        for (idx, change) in self.changes.iter().enumerate() {
            if change.action != ChangeAction::Modify {
                continue;
            }
            let Some(search) = change.search.as_deref().filter(|s| !s.is_empty()) else {
                issues.push(format!(
                    "change {}: modify action for {} has no search text",
                    idx, change.file
                ));
                continue;
            };
            let target = repo_root.join(&change.file);
            match std::fs::read_to_string(&target) {
                Ok(content) => {
                    if !content.contains(search) {
                        issues.push(format!(
                            "change {}: search text not found in {}",
                            idx, change.file
                        ));
                    }
                }
                Err(_) => {
                    issues.push(format!("change {}: file not found: {}", idx, change.file));
                }
            }
        }
        issues
    }
}

/// JSON schema for the proposal document, attached to every inference request
/// as a strict `response_format` so the final answer arrives machine-readable.
pub fn response_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "analysis": {
                "type": "string",
                "description": "Analysis of the task or requirements"
            },
            "changes": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "action": {
                            "type": "string",
                            "enum": ["modify", "create"],
                            "description": "Whether to modify existing file or create new file"
                        },
                        "file": {
                            "type": "string",
                            "description": "Path to the file (from repo root)"
                        },
                        "search": {
                            "type": "string",
                            "description": "Exact text to search for and replace (required for modify action, use empty string for create action)"
                        },
                        "replace": {
                            "type": "string",
                            "description": "Text to replace the search text with (for modify) or full file content (for create)"
                        },
                        "reasoning": {
                            "type": "string",
                            "description": "Description of what this change does and why"
                        },
                        "confidence": {
                            "type": "string",
                            "enum": ["high", "medium", "low"],
                            "description": "Confidence level in this change"
                        }
                    },
                    "required": ["action", "file", "search", "replace", "reasoning", "confidence"],
                    "additionalProperties": false
                }
            }
        },
        "required": ["analysis", "changes"],
        "additionalProperties": false
    })
}

/// Strip markdown code fences from a response
fn strip_markdown_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let clean = if trimmed.starts_with("```json") {
        trimmed.strip_prefix("```json").unwrap_or(trimmed)
    } else if trimmed.starts_with("```") {
        trimmed.strip_prefix("```").unwrap_or(trimmed)
    } else {
        trimmed
    };
    let clean = if clean.ends_with("```") {
        clean.strip_suffix("```").unwrap_or(clean)
    } else {
        clean
    };
    clean.trim()
}

/// Extract a balanced JSON fragment between matching delimiters.
/// Properly handles nested structures and ignores delimiters inside strings.
fn extract_json_fragment(text: &str, open: char, close: char) -> Option<&str> {
    let mut depth = 0;
    let mut in_string = false;
    let mut escape_next = false;
    let mut start_idx = None;

    for (i, c) in text.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }

        if c == '\\' && in_string {
            escape_next = true;
            continue;
        }

        if c == '"' {
            in_string = !in_string;
            continue;
        }

        if in_string {
            continue;
        }

        if c == open {
            if depth == 0 {
                start_idx = Some(i);
            }
            depth += 1;
        } else if c == close {
            depth -= 1;
            if depth == 0 {
                if let Some(start) = start_idx {
                    return Some(&text[start..=i]);
                }
            }
        }
    }

    None
}

/// Fix common JSON issues in model output: trailing commas, smart quotes,
/// stray control characters.
fn fix_json_issues(json: &str) -> String {
    let mut fixed = json.to_string();

    fixed = fixed.replace(",]", "]");
    fixed = fixed.replace(",}", "}");

    fixed = fixed.replace('\u{201C}', "\"");
    fixed = fixed.replace('\u{201D}', "\"");
    fixed = fixed.replace('\u{2018}', "'");
    fixed = fixed.replace('\u{2019}', "'");

    fixed
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAIN: &str = r#"{"analysis": "missing import", "changes": [{"action": "modify", "file": "backend/src/foo.ts", "search": "old", "replace": "new", "reasoning": "adds the import", "confidence": "high"}]}"#;

    #[test]
    fn parses_plain_json() {
        let proposal = StructuredProposal::from_model_content(PLAIN).unwrap();
        assert_eq!(proposal.changes.len(), 1);
        assert_eq!(proposal.changes[0].action, ChangeAction::Modify);
        assert_eq!(proposal.changes[0].confidence, Some(Confidence::High));
    }

    #[test]
    fn parses_fenced_json() {
        let fenced = format!("```json\n{}\n```", PLAIN);
        let proposal = StructuredProposal::from_model_content(&fenced).unwrap();
        assert_eq!(proposal.analysis, "missing import");
    }

    #[test]
    fn parses_json_embedded_in_prose() {
        let wrapped = format!("Here is my final answer:\n{}\nLet me know!", PLAIN);
        let proposal = StructuredProposal::from_model_content(&wrapped).unwrap();
        assert_eq!(proposal.changes.len(), 1);
    }

    #[test]
    fn rejects_non_json_content() {
        assert!(StructuredProposal::from_model_content("I could not find the bug.").is_err());
    }

    #[test]
    fn failure_document_has_empty_changes() {
        let doc = StructuredProposal::failure("max iterations reached");
        assert!(doc.changes.is_empty());
        let round_trip: StructuredProposal =
            serde_json::from_str(&doc.to_json_pretty()).unwrap();
        assert_eq!(round_trip.analysis, "max iterations reached");
    }

    #[test]
    fn validate_flags_missing_search_text() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.ts"), "export const x = 1;\n").unwrap();

        let proposal = StructuredProposal {
            analysis: "test".to_string(),
            changes: vec![
                Change {
                    action: ChangeAction::Modify,
                    file: "a.ts".to_string(),
                    search: Some("export const x = 1;".to_string()),
                    replace: "export const x = 2;".to_string(),
                    reasoning: "bump".to_string(),
                    confidence: None,
                },
                Change {
                    action: ChangeAction::Modify,
                    file: "a.ts".to_string(),
                    search: Some("not present".to_string()),
                    replace: "irrelevant".to_string(),
                    reasoning: "mismatch".to_string(),
                    confidence: None,
                },
            ],
        };

        let issues = proposal.validate_changes(dir.path());
        assert_eq!(issues.len(), 1);
        assert!(issues[0].contains("search text not found"));
    }
}
