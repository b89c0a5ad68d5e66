//! Conversation-history compression.
//!
//! As iterations accumulate, the outbound payload must stay bounded. The
//! primary policy keeps the two anchor messages (system + first user message)
//! verbatim, the most recent tool interaction, and a one-message summary of
//! everything elided. The escalated policy goes further: it substitutes a
//! semantic relevance digest for the general history.
//!
//! Invariants: the anchors are never dropped, and re-applying compression to
//! an already-compressed history changes nothing.

use super::agentic::Message;
use super::tools::ToolRegistry;

/// Fixed prefix identifying synthetic compression messages, so a second pass
/// recognizes and retains them instead of eliding them away.
pub const SUMMARY_PREFIX: &str = "[context compressed]";

/// Marker embedded when a tool result is cut down to its high-signal lines.
const TRUNCATION_MARKER: &str = "[truncated:";

/// Tool-result content above this many chars gets reduced to key lines.
const TOOL_RESULT_BUDGET: usize = 1_000;
/// Line scan and retention caps during truncation.
const SCAN_LINES: usize = 20;
const KEEP_LINES: usize = 10;

/// Lines containing these survive tool-result truncation.
const HIGH_SIGNAL_TOKENS: &[&str] = &[
    "error",
    "failed",
    "test",
    "import",
    "export",
    "function",
    "class",
    "interface",
];

/// Keyword vocabulary harvested from recent messages for the escalated
/// policy's semantic query.
const DIGEST_VOCAB: &[&str] = &[
    "test", "error", "coverage", "backend", "frontend", "api", "route", "component", "import",
    "build",
];

fn is_tool_interaction(message: &Message) -> bool {
    message.role == "tool" || (message.role == "assistant" && message.has_tool_calls())
}

fn is_summary(message: &Message) -> bool {
    message.role == "assistant"
        && !message.has_tool_calls()
        && message
            .content
            .as_deref()
            .map(|c| c.starts_with(SUMMARY_PREFIX))
            .unwrap_or(false)
}

/// Primary compression policy.
pub fn compress(messages: &[Message]) -> Vec<Message> {
    if messages.len() <= 4 {
        return messages.to_vec();
    }

    let mut compressed: Vec<Message> = messages[..2].to_vec();
    let rest = &messages[2..];

    let interaction_count = rest
        .iter()
        .filter(|m| m.role == "assistant" && m.has_tool_calls())
        .count();
    let elided = interaction_count.saturating_sub(1);

    // The most recent tool interaction: the last assistant message carrying
    // tool calls plus the result messages that follow it.
    let mut recent = Vec::new();
    if let Some(idx) = rest
        .iter()
        .rposition(|m| m.role == "assistant" && m.has_tool_calls())
    {
        recent.push(rest[idx].clone());
        for message in &rest[idx + 1..] {
            if message.role == "tool" {
                recent.push(truncate_tool_result(message));
            } else {
                break;
            }
        }
    }

    let existing_summary = rest.iter().find(|m| is_summary(m)).cloned();
    if elided > 0 {
        compressed.push(Message::assistant_text(format!(
            "{} Elided {} earlier tool interactions. Key context is preserved in the most \
             recent messages. Continue focused exploration or synthesize findings.",
            SUMMARY_PREFIX, elided
        )));
    } else if let Some(summary) = existing_summary {
        compressed.push(summary);
    }

    compressed.extend(recent);
    compressed
}

/// Escalated policy: replace the general history with a relevance digest
/// derived from semantic search over keywords harvested from recent
/// messages. Falls back to the primary policy when no keywords surface or
/// the semantic backend reports unavailable.
pub fn compress_escalated(messages: &[Message], registry: &ToolRegistry) -> Vec<Message> {
    if messages.len() <= 4 {
        return messages.to_vec();
    }

    let mut recent_content = String::new();
    for message in messages.iter().rev().take(6) {
        if let Some(content) = &message.content {
            recent_content.push_str(content);
            recent_content.push(' ');
        }
    }
    let lower = recent_content.to_lowercase();
    let keywords: Vec<&str> = DIGEST_VOCAB
        .iter()
        .copied()
        .filter(|k| lower.contains(k))
        .take(3)
        .collect();
    if keywords.is_empty() {
        return compress(messages);
    }

    let query = format!("{} implementation", keywords.join(" "));
    let result = registry.semantic_search(&query, "*.*", 3, 0.2);
    if result.get("error").is_some() {
        return compress(messages);
    }

    let mut digest_lines = Vec::new();
    if let Some(matches) = result["semantic_matches"].as_array() {
        for entry in matches {
            let file = entry["file_context"]["file"].as_str().unwrap_or("?");
            let start = entry["file_context"]["start_line"].as_u64().unwrap_or(0);
            let end = entry["file_context"]["end_line"].as_u64().unwrap_or(0);
            let snippet = entry["code_snippet"].as_str().unwrap_or("");
            digest_lines.push(format!(
                "- {} (lines {}-{}): {}",
                file,
                start,
                end,
                mend_core::util::clip(snippet, 200)
            ));
        }
    }
    if digest_lines.is_empty() {
        return compress(messages);
    }

    let digest = Message::assistant_text(format!(
        "{} Relevance digest replacing earlier exploration (query: '{}'):\n{}",
        SUMMARY_PREFIX,
        query,
        digest_lines.join("\n")
    ));

    let mut compressed: Vec<Message> = messages[..2].to_vec();
    compressed.push(digest);
    // Keep a short recent tail; the pre-call sanitizer drops any tool result
    // whose assistant pairing was cut here.
    let tail_start = messages.len().saturating_sub(4).max(2);
    compressed.extend(messages[tail_start..].iter().cloned());
    compressed
}

/// Cut an oversized tool result down to its high-signal lines, appending a
/// marker noting original vs. reduced size. Already-truncated content is
/// left alone.
fn truncate_tool_result(message: &Message) -> Message {
    let Some(content) = message.content.as_deref() else {
        return message.clone();
    };
    if content.len() <= TOOL_RESULT_BUDGET || content.contains(TRUNCATION_MARKER) {
        return message.clone();
    }

    let key_lines: Vec<&str> = content
        .lines()
        .take(SCAN_LINES)
        .filter(|line| {
            let lower = line.to_lowercase();
            HIGH_SIGNAL_TOKENS.iter().any(|token| lower.contains(token))
        })
        .take(KEEP_LINES)
        .collect();

    let kept = key_lines.join("\n");
    let reduced = format!(
        "{}\n\n[truncated: {} chars -> {} chars]",
        kept,
        content.len(),
        kept.len()
    );

    let mut truncated = message.clone();
    truncated.content = Some(reduced);
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::agentic::{FunctionCallMessage, ToolCallMessage};
    use mend_adapters::cache::ToolCacheStore;

    fn tool_call(id: &str, name: &str) -> ToolCallMessage {
        ToolCallMessage {
            id: id.to_string(),
            call_type: "function".to_string(),
            function: FunctionCallMessage {
                name: name.to_string(),
                arguments: "{}".to_string(),
            },
        }
    }

    fn interaction(id: &str, result: &str) -> Vec<Message> {
        vec![
            Message::assistant_with_calls(None, vec![tool_call(id, "read_file")]),
            Message::tool(id, result.to_string()),
        ]
    }

    fn history_with_interactions(count: usize) -> Vec<Message> {
        let mut messages = vec![
            Message::system("system prompt"),
            Message::user("first user message"),
        ];
        for i in 0..count {
            messages.extend(interaction(&format!("call-{}", i), "small result"));
        }
        messages
    }

    fn as_json(messages: &[Message]) -> String {
        serde_json::to_string(messages).unwrap()
    }

    #[test]
    fn compression_preserves_anchor_messages() {
        let messages = history_with_interactions(5);
        let compressed = compress(&messages);

        assert_eq!(as_json(&compressed[..2]), as_json(&messages[..2]));
        assert!(compressed.len() < messages.len());
    }

    #[test]
    fn compression_keeps_only_most_recent_interaction() {
        let messages = history_with_interactions(4);
        let compressed = compress(&messages);

        let tool_messages: Vec<&Message> =
            compressed.iter().filter(|m| m.role == "tool").collect();
        assert_eq!(tool_messages.len(), 1);
        assert_eq!(tool_messages[0].tool_call_id.as_deref(), Some("call-3"));

        let summary = compressed
            .iter()
            .find(|m| {
                m.content
                    .as_deref()
                    .map(|c| c.starts_with(SUMMARY_PREFIX))
                    .unwrap_or(false)
            })
            .expect("summary message present");
        assert!(summary.content.as_deref().unwrap().contains("3"));
    }

    #[test]
    fn compression_is_idempotent() {
        let messages = history_with_interactions(6);
        let once = compress(&messages);
        let twice = compress(&once);
        assert_eq!(as_json(&once), as_json(&twice));
    }

    #[test]
    fn short_histories_pass_through_unchanged() {
        let messages = history_with_interactions(1);
        assert_eq!(as_json(&compress(&messages)), as_json(&messages));
    }

    #[test]
    fn oversized_tool_results_keep_high_signal_lines() {
        let mut noise = String::new();
        noise.push_str("error TS2304: cannot find name 'foo'\n");
        noise.push_str("import { bar } from './bar';\n");
        for _ in 0..60 {
            noise.push_str("some irrelevant filler line of output here\n");
        }

        let mut messages = vec![
            Message::system("system"),
            Message::user("user"),
        ];
        messages.extend(interaction("a", "early result"));
        messages.extend(interaction("b", &noise));

        let compressed = compress(&messages);
        let result = compressed
            .iter()
            .find(|m| m.role == "tool" && m.tool_call_id.as_deref() == Some("b"))
            .unwrap();
        let content = result.content.as_deref().unwrap();
        assert!(content.contains("error TS2304"));
        assert!(content.contains("import { bar }"));
        assert!(content.contains("[truncated:"));
        assert!(!content.contains("irrelevant filler"));
    }

    #[test]
    fn escalated_compression_substitutes_relevance_digest() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("routes.ts"),
            "export function registerRoute(app) {\n  // api route for users\n  app.get('/api/users', listUsers);\n}\nexport function componentRoute(app) {\n  // component api route\n  app.get('/api/component', componentHandler);\n}\n",
        )
        .unwrap();
        let registry = ToolRegistry::new(dir.path(), ToolCacheStore::new(dir.path()), false);

        let mut messages = history_with_interactions(5);
        messages.push(Message::assistant_text(
            "The api route component wiring seems wrong",
        ));

        let compressed = compress_escalated(&messages, &registry);
        assert_eq!(as_json(&compressed[..2]), as_json(&messages[..2]));
        let digest = compressed[2].content.as_deref().unwrap();
        assert!(digest.starts_with(SUMMARY_PREFIX));
        assert!(digest.contains("routes.ts"));
    }

    #[test]
    fn escalated_compression_falls_back_without_keywords() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ToolRegistry::new(dir.path(), ToolCacheStore::new(dir.path()), false);

        let mut messages = vec![Message::system("system"), Message::user("user")];
        for i in 0..4 {
            messages.extend(interaction(&format!("c{}", i), "xyzzy"));
        }

        let compressed = compress_escalated(&messages, &registry);
        // No vocabulary keywords in recent content: behaves like the primary
        // policy, anchors intact.
        assert_eq!(as_json(&compressed[..2]), as_json(&messages[..2]));
        assert!(compressed.iter().any(|m| {
            m.content
                .as_deref()
                .map(|c| c.starts_with(SUMMARY_PREFIX))
                .unwrap_or(false)
        }));
    }
}
