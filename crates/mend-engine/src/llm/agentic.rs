//! The conversation session and agent loop.
//!
//! One session drives the exchange with the inference service: seed the
//! prompt, send the accumulated history plus the current tool schemas, and
//! either dispatch the requested tool calls (feeding results back as tool
//! messages) or accept a terminal response as the structured proposal. The
//! context compressor intervenes between turns once history grows, and a
//! synthesis directive bounds exploration regardless of model
//! cooperativeness.

use super::compress;
use super::models::{merge_usage, Usage, MAX_COMPLETION_TOKENS};
use super::prompts;
use super::tools::{ToolDefinition, ToolRegistry};
use crate::lab::sandbox::SandboxManager;
use mend_core::proposal::{response_schema, StructuredProposal};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use uuid::Uuid;

/// A message in the conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallMessage>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant_text(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant_with_calls(content: Option<String>, calls: Vec<ToolCallMessage>) -> Self {
        Self {
            role: "assistant".to_string(),
            content,
            tool_calls: Some(calls),
            tool_call_id: None,
        }
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool".to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls
            .as_ref()
            .map(|calls| !calls.is_empty())
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallMessage {
    pub id: String,
    #[serde(rename = "type", default = "default_call_type")]
    pub call_type: String,
    pub function: FunctionCallMessage,
}

fn default_call_type() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCallMessage {
    pub name: String,
    /// JSON-encoded arguments, as the wire protocol carries them.
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub max_completion_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDefinition>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseFormat {
    #[serde(rename = "type")]
    pub format_type: String,
    pub json_schema: JsonSchemaConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonSchemaConfig {
    pub name: String,
    pub strict: bool,
    pub schema: Value,
}

/// Strict schema wrapper applied to every request so the terminal answer
/// arrives as a proposal document.
pub fn proposal_response_format() -> ResponseFormat {
    ResponseFormat {
        format_type: "json_schema".to_string(),
        json_schema: JsonSchemaConfig {
            name: "ai_proposals".to_string(),
            strict: true,
            schema: response_schema(),
        },
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Choice {
    pub message: ResponseMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponseMessage {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCallMessage>>,
}

/// One outbound inference call per turn, behind whatever retry policy the
/// implementation carries. Boxed futures keep the trait object-safe.
pub trait ChatBackend: Send + Sync {
    fn send<'a>(
        &'a self,
        request: &'a ChatRequest,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<ChatResponse>> + Send + 'a>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Pending,
    Exploring,
    Synthesizing,
    Completed,
    Failed,
}

/// Why a session ended without a proposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// Network/HTTP failure reaching the inference service, including a
    /// rate limit that survived every retry.
    TransportFault { message: String },
    /// Two consecutive terminal responses failed to parse.
    MalformedOutput { message: String },
    /// The iteration budget ran out before a terminal response.
    IterationLimit { iterations: usize },
}

impl FailureReason {
    /// Analysis text for the failure document.
    pub fn analysis(&self) -> String {
        match self {
            FailureReason::TransportFault { message } => {
                format!("Inference service unavailable: {}", message)
            }
            FailureReason::MalformedOutput { message } => {
                format!("Model output was not a valid proposal: {}", message)
            }
            FailureReason::IterationLimit { iterations } => {
                format!("No proposal after {} iterations", iterations)
            }
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.analysis())
    }
}

/// Iteration thresholds for compression and forced synthesis.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Compress once past this iteration (and the history is long enough).
    pub compress_after_iteration: usize,
    /// Minimum history length before compression is worthwhile.
    pub compress_min_messages: usize,
    /// Inject the synthesis directive past this iteration.
    pub synthesis_after_iteration: usize,
    /// Switch to the escalated semantic-digest compression past this one.
    pub escalate_after_iteration: usize,
    pub temperature: f32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            compress_after_iteration: 2,
            compress_min_messages: 5,
            synthesis_after_iteration: 6,
            escalate_after_iteration: 8,
            temperature: 0.2,
        }
    }
}

pub struct ConversationSession {
    pub id: Uuid,
    model: String,
    config: SessionConfig,
    state: SessionState,
    iteration: usize,
    messages: Vec<Message>,
    usage: Option<Usage>,
}

impl ConversationSession {
    pub fn new(model: impl Into<String>, config: SessionConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            model: model.into(),
            config,
            state: SessionState::Pending,
            iteration: 0,
            messages: Vec::new(),
            usage: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn iterations(&self) -> usize {
        self.iteration
    }

    pub fn usage(&self) -> Option<&Usage> {
        self.usage.as_ref()
    }

    /// Drive the conversation until a structured proposal is produced or a
    /// bound is hit. Tool calls are executed synchronously, one at a time,
    /// in request order.
    pub async fn run(
        &mut self,
        backend: &dyn ChatBackend,
        registry: &mut ToolRegistry,
        sandboxes: &mut SandboxManager,
        system: &str,
        seed_text: &str,
        max_iterations: usize,
    ) -> Result<StructuredProposal, FailureReason> {
        self.state = SessionState::Exploring;
        self.messages = vec![Message::system(system), Message::user(seed_text)];
        let mut corrective_attempted = false;

        loop {
            if self.iteration >= max_iterations {
                self.state = SessionState::Failed;
                return Err(FailureReason::IterationLimit {
                    iterations: self.iteration,
                });
            }
            self.iteration += 1;
            eprintln!("  Iteration {}", self.iteration);

            if self.messages.len() > self.config.compress_min_messages {
                if self.iteration > self.config.escalate_after_iteration {
                    self.messages = compress::compress_escalated(&self.messages, registry);
                } else if self.iteration > self.config.compress_after_iteration {
                    self.messages = compress::compress(&self.messages);
                }
            }

            if self.iteration > self.config.synthesis_after_iteration {
                if self.state != SessionState::Synthesizing {
                    eprintln!(
                        "  Synthesis mode at iteration {}: requesting final output",
                        self.iteration
                    );
                    self.state = SessionState::Synthesizing;
                }
                // Re-injected each turn so compression cannot strip the
                // instruction before the model sees it.
                self.messages
                    .push(Message::user(prompts::SYNTHESIS_DIRECTIVE));
            }

            sanitize_messages(&mut self.messages);

            let request = ChatRequest {
                model: self.model.clone(),
                messages: self.messages.clone(),
                max_completion_tokens: MAX_COMPLETION_TOKENS,
                temperature: Some(self.config.temperature),
                response_format: Some(proposal_response_format()),
                tools: Some(registry.schemas()),
            };

            let response = match backend.send(&request).await {
                Ok(response) => response,
                Err(e) => {
                    self.state = SessionState::Failed;
                    return Err(FailureReason::TransportFault {
                        message: e.to_string(),
                    });
                }
            };
            self.usage = merge_usage(self.usage.take(), response.usage.clone());

            let Some(choice) = response.choices.into_iter().next() else {
                self.state = SessionState::Failed;
                return Err(FailureReason::TransportFault {
                    message: "No response choices from model".to_string(),
                });
            };

            if let Some(tool_calls) = choice
                .message
                .tool_calls
                .clone()
                .filter(|calls| !calls.is_empty())
            {
                eprintln!("  Model requested {} tool calls", tool_calls.len());
                self.messages.push(Message::assistant_with_calls(
                    choice.message.content.clone(),
                    tool_calls.clone(),
                ));

                for call in &tool_calls {
                    let result = match salvage_arguments(&call.function.arguments) {
                        Ok(args) => {
                            dispatch_tool(registry, sandboxes, &call.function.name, &args)
                        }
                        Err(e) => json!({ "error": format!("invalid arguments: {}", e) }),
                    };
                    let serialized = serde_json::to_string(&result).unwrap_or_else(|_| {
                        "{\"error\":\"unserializable tool result\"}".to_string()
                    });
                    self.messages.push(Message::tool(call.id.clone(), serialized));
                }

                corrective_attempted = false;
                continue;
            }

            // Terminal response: no tool calls.
            let content = choice.message.content.unwrap_or_default();
            match StructuredProposal::from_model_content(&content) {
                Ok(proposal) => {
                    self.state = SessionState::Completed;
                    eprintln!("  Session complete after {} iterations", self.iteration);
                    return Ok(proposal);
                }
                Err(e) => {
                    if corrective_attempted {
                        self.state = SessionState::Failed;
                        return Err(FailureReason::MalformedOutput {
                            message: e.to_string(),
                        });
                    }
                    eprintln!("  Terminal response did not parse; issuing corrective re-prompt");
                    corrective_attempted = true;
                    self.messages.push(Message::assistant_text(content));
                    self.messages
                        .push(Message::user(prompts::MALFORMED_OUTPUT_REPROMPT));
                }
            }
        }
    }
}

/// Route one tool invocation to the sandbox manager or the registry.
/// Failures come back as structured payloads; the session never aborts on a
/// tool error.
fn dispatch_tool(
    registry: &mut ToolRegistry,
    sandboxes: &mut SandboxManager,
    name: &str,
    args: &Value,
) -> Value {
    eprintln!("  Tool call: {}", name);
    let str_arg = |key: &str| args.get(key).and_then(Value::as_str).map(str::to_string);

    match name {
        "create_sandbox" => {
            let (Some(sandbox_name), Some(description)) =
                (str_arg("sandbox_name"), str_arg("description"))
            else {
                return json!({ "error": "create_sandbox requires sandbox_name and description" });
            };
            let kind = str_arg("sandbox_type").unwrap_or_else(|| "workspace".to_string());
            sandboxes.create(&sandbox_name, &description, &kind)
        }
        "run_in_sandbox" => {
            let (Some(sandbox_name), Some(kind), Some(payload), Some(description)) = (
                str_arg("sandbox_name"),
                str_arg("operation_type"),
                str_arg("operation_data"),
                str_arg("description"),
            ) else {
                return json!({
                    "error": "run_in_sandbox requires sandbox_name, operation_type, operation_data, and description"
                });
            };
            sandboxes.run(&sandbox_name, &kind, &payload, &description)
        }
        "inspect_sandbox" => {
            let Some(sandbox_name) = str_arg("sandbox_name") else {
                return json!({ "error": "inspect_sandbox requires sandbox_name" });
            };
            let scope = str_arg("inspection_type").unwrap_or_else(|| "all".to_string());
            sandboxes.inspect(&sandbox_name, &scope)
        }
        "cleanup_sandbox" => {
            let Some(sandbox_name) = str_arg("sandbox_name") else {
                return json!({ "error": "cleanup_sandbox requires sandbox_name" });
            };
            let force = args.get("force").and_then(Value::as_bool).unwrap_or(false);
            sandboxes.cleanup(&sandbox_name, force)
        }
        _ => registry.invoke(name, args),
    }
}

/// Best-effort recovery of tool-call arguments the model emitted as broken
/// JSON: direct parse, balanced-prefix truncation, then extraction of a
/// single common string field.
fn salvage_arguments(raw: &str) -> Result<Value, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(json!({}));
    }

    match serde_json::from_str::<Value>(trimmed) {
        Ok(value @ Value::Object(_)) => return Ok(value),
        Ok(other) => return Err(format!("arguments must be a JSON object, got {}", other)),
        Err(_) => {}
    }

    // The model often truncates mid-object; take the first balanced prefix.
    if trimmed.matches('{').count() > trimmed.matches('}').count() {
        if let Some(prefix) = balanced_prefix(trimmed) {
            if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(prefix) {
                return Ok(value);
            }
        }
    }

    for key in ["path", "query", "pattern"] {
        let pattern = format!(r#""{}"\s*:\s*"([^"]+)""#, key);
        if let Ok(re) = regex::Regex::new(&pattern) {
            if let Some(caps) = re.captures(trimmed) {
                return Ok(json!({ key: caps[1].to_string() }));
            }
        }
    }

    Err(format!(
        "unrecoverable JSON: {}",
        mend_core::util::clip(trimmed, 120)
    ))
}

fn balanced_prefix(text: &str) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;
    let mut started = false;

    for (i, c) in text.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => {
                depth += 1;
                started = true;
            }
            '}' if !in_string => {
                depth = depth.saturating_sub(1);
                if started && depth == 0 {
                    return Some(&text[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Enforce the message-pairing invariant before each outbound call:
/// assistant tool-call messages with no surviving results are dropped, and
/// so is any tool result whose invocation request is gone.
fn sanitize_messages(messages: &mut Vec<Message>) {
    let result_ids: HashSet<String> = messages
        .iter()
        .filter(|m| m.role == "tool")
        .filter_map(|m| m.tool_call_id.clone())
        .collect();

    // Drop assistant tool-call messages none of whose calls were answered.
    messages.retain(|message| match (&message.role, &message.tool_calls) {
        (role, Some(calls)) if role == "assistant" && !calls.is_empty() => {
            calls.iter().any(|call| result_ids.contains(&call.id))
        }
        _ => true,
    });

    // Drop tool results whose invocation request no longer precedes them.
    let mut announced: HashSet<String> = HashSet::new();
    let mut kept = Vec::with_capacity(messages.len());
    for message in messages.drain(..) {
        if message.role == "tool" {
            let valid = message
                .tool_call_id
                .as_ref()
                .map(|id| announced.contains(id))
                .unwrap_or(false);
            if valid {
                kept.push(message);
            }
        } else {
            if let Some(calls) = &message.tool_calls {
                for call in calls {
                    announced.insert(call.id.clone());
                }
            }
            kept.push(message);
        }
    }
    *messages = kept;
}

#[cfg(test)]
mod tests {
    use super::*;
    use mend_adapters::cache::ToolCacheStore;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    const PROPOSAL: &str = r#"{"analysis": "missing import of bar", "changes": [{"action": "modify", "file": "backend/src/foo.ts", "search": "const x = bar();", "replace": "import { bar } from './bar';\nconst x = bar();", "reasoning": "bar was used without an import", "confidence": "high"}]}"#;

    struct ScriptedBackend {
        responses: Mutex<VecDeque<ChatResponse>>,
        requests: Mutex<Vec<ChatRequest>>,
        repeat_last: bool,
    }

    impl ScriptedBackend {
        fn new(responses: Vec<ChatResponse>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                requests: Mutex::new(Vec::new()),
                repeat_last: false,
            }
        }

        fn repeating(response: ChatResponse) -> Self {
            Self {
                responses: Mutex::new(VecDeque::from(vec![response])),
                requests: Mutex::new(Vec::new()),
                repeat_last: true,
            }
        }

        fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        fn request(&self, idx: usize) -> ChatRequest {
            self.requests.lock().unwrap()[idx].clone()
        }
    }

    impl ChatBackend for ScriptedBackend {
        fn send<'a>(
            &'a self,
            request: &'a ChatRequest,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<ChatResponse>> + Send + 'a>> {
            Box::pin(async move {
                self.requests.lock().unwrap().push(request.clone());
                let mut responses = self.responses.lock().unwrap();
                if self.repeat_last && responses.len() == 1 {
                    return Ok(responses.front().cloned().unwrap());
                }
                responses
                    .pop_front()
                    .ok_or_else(|| anyhow::anyhow!("scripted backend exhausted"))
            })
        }
    }

    fn text_response(content: &str) -> ChatResponse {
        ChatResponse {
            choices: vec![Choice {
                message: ResponseMessage {
                    content: Some(content.to_string()),
                    tool_calls: None,
                },
                finish_reason: Some("stop".to_string()),
            }],
            usage: None,
        }
    }

    fn tool_call_response(id: &str, name: &str, arguments: &str) -> ChatResponse {
        ChatResponse {
            choices: vec![Choice {
                message: ResponseMessage {
                    content: None,
                    tool_calls: Some(vec![ToolCallMessage {
                        id: id.to_string(),
                        call_type: "function".to_string(),
                        function: FunctionCallMessage {
                            name: name.to_string(),
                            arguments: arguments.to_string(),
                        },
                    }]),
                },
                finish_reason: Some("tool_calls".to_string()),
            }],
            usage: None,
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        registry: ToolRegistry,
        sandboxes: SandboxManager,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.ts"), "const x = bar();\n").unwrap();
        let registry = ToolRegistry::new(dir.path(), ToolCacheStore::new(dir.path()), false);
        let sandboxes = SandboxManager::new(dir.path());
        Fixture {
            registry,
            sandboxes,
            _dir: dir,
        }
    }

    fn session() -> ConversationSession {
        ConversationSession::new("test-model", SessionConfig::default())
    }

    #[tokio::test]
    async fn completes_when_terminal_response_is_a_proposal() {
        let mut fx = fixture();
        let backend = ScriptedBackend::new(vec![
            tool_call_response("c1", "read_file", r#"{"path": "main.ts"}"#),
            text_response(PROPOSAL),
        ]);

        let mut session = session();
        let proposal = session
            .run(
                &backend,
                &mut fx.registry,
                &mut fx.sandboxes,
                "system",
                "seed",
                10,
            )
            .await
            .unwrap();

        assert_eq!(session.state(), SessionState::Completed);
        assert_eq!(proposal.changes.len(), 1);
        assert_eq!(backend.request_count(), 2);

        // The tool result was fed back before the terminal turn.
        let second = backend.request(1);
        let tool_message = second
            .messages
            .iter()
            .find(|m| m.role == "tool")
            .expect("tool result present");
        assert!(tool_message
            .content
            .as_deref()
            .unwrap()
            .contains("const x = bar();"));
    }

    #[tokio::test]
    async fn bounded_looping_fails_at_max_iterations() {
        let mut fx = fixture();
        let backend = ScriptedBackend::repeating(tool_call_response(
            "c1",
            "resolve_everything",
            "{}",
        ));

        let mut session = session();
        let err = session
            .run(
                &backend,
                &mut fx.registry,
                &mut fx.sandboxes,
                "system",
                "seed",
                3,
            )
            .await
            .unwrap_err();

        assert_eq!(err, FailureReason::IterationLimit { iterations: 3 });
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(backend.request_count(), 3, "one call per allowed iteration");
    }

    #[tokio::test]
    async fn unknown_tool_yields_structured_result_and_session_survives() {
        let mut fx = fixture();
        let backend = ScriptedBackend::new(vec![
            tool_call_response("c1", "summon_unicorn", "{}"),
            text_response(PROPOSAL),
        ]);

        let mut session = session();
        let proposal = session
            .run(
                &backend,
                &mut fx.registry,
                &mut fx.sandboxes,
                "system",
                "seed",
                10,
            )
            .await
            .unwrap();
        assert_eq!(proposal.analysis, "missing import of bar");

        let second = backend.request(1);
        let tool_message = second.messages.iter().find(|m| m.role == "tool").unwrap();
        assert!(tool_message
            .content
            .as_deref()
            .unwrap()
            .contains("Unknown function: summon_unicorn"));
    }

    #[tokio::test]
    async fn malformed_terminal_output_gets_one_corrective_reprompt() {
        let mut fx = fixture();
        let backend = ScriptedBackend::new(vec![
            text_response("Sorry, here is my analysis in prose."),
            text_response(PROPOSAL),
        ]);

        let mut session = session();
        let proposal = session
            .run(
                &backend,
                &mut fx.registry,
                &mut fx.sandboxes,
                "system",
                "seed",
                10,
            )
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::Completed);
        assert_eq!(proposal.changes.len(), 1);

        let second = backend.request(1);
        let last = second.messages.last().unwrap();
        assert_eq!(last.role, "user");
        assert!(last.content.as_deref().unwrap().contains("not valid JSON"));
    }

    #[tokio::test]
    async fn second_malformed_response_fails_the_session() {
        let mut fx = fixture();
        let backend = ScriptedBackend::new(vec![
            text_response("still prose"),
            text_response("more prose"),
        ]);

        let mut session = session();
        let err = session
            .run(
                &backend,
                &mut fx.registry,
                &mut fx.sandboxes,
                "system",
                "seed",
                10,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, FailureReason::MalformedOutput { .. }));
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(backend.request_count(), 2, "exactly one corrective re-prompt");
    }

    #[tokio::test]
    async fn transport_fault_ends_the_session() {
        let mut fx = fixture();
        let backend = ScriptedBackend::new(vec![]);

        let mut session = session();
        let err = session
            .run(
                &backend,
                &mut fx.registry,
                &mut fx.sandboxes,
                "system",
                "seed",
                10,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FailureReason::TransportFault { .. }));
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn synthesis_directive_injected_past_threshold() {
        let mut fx = fixture();
        let backend = ScriptedBackend::repeating(tool_call_response(
            "c1",
            "list_directory",
            r#"{"path": "."}"#,
        ));

        let mut session = ConversationSession::new(
            "test-model",
            SessionConfig {
                synthesis_after_iteration: 2,
                ..SessionConfig::default()
            },
        );
        let _ = session
            .run(
                &backend,
                &mut fx.registry,
                &mut fx.sandboxes,
                "system",
                "seed",
                4,
            )
            .await;

        assert_eq!(session.state(), SessionState::Failed);
        let third = backend.request(2);
        assert!(
            third
                .messages
                .iter()
                .any(|m| m.role == "user"
                    && m.content
                        .as_deref()
                        .map(|c| c.contains("SYNTHESIS REQUIRED"))
                        .unwrap_or(false)),
            "directive message present once past the threshold"
        );
    }

    #[test]
    fn salvage_recovers_truncated_objects() {
        let args = salvage_arguments(r#"{"path": "src/main.ts"} trailing garbage"#);
        // Direct parse fails on trailing garbage; balanced-prefix rescue does not
        // apply (braces balance), so the field extractor kicks in.
        assert_eq!(args.unwrap()["path"], json!("src/main.ts"));

        let truncated = salvage_arguments(r#"{"pattern": "foo", "nested": {"a": 1}"#);
        assert_eq!(truncated.unwrap()["pattern"], json!("foo"));

        assert!(salvage_arguments("complete nonsense").is_err());
        assert_eq!(salvage_arguments("").unwrap(), json!({}));
    }

    #[test]
    fn sanitize_drops_orphans_and_unanswered_calls() {
        let call = ToolCallMessage {
            id: "kept".to_string(),
            call_type: "function".to_string(),
            function: FunctionCallMessage {
                name: "read_file".to_string(),
                arguments: "{}".to_string(),
            },
        };
        let unanswered = ToolCallMessage {
            id: "unanswered".to_string(),
            call_type: "function".to_string(),
            function: FunctionCallMessage {
                name: "read_file".to_string(),
                arguments: "{}".to_string(),
            },
        };

        let mut messages = vec![
            Message::system("s"),
            Message::user("u"),
            Message::tool("orphan", "result with no request"),
            Message::assistant_with_calls(None, vec![call]),
            Message::tool("kept", "paired result"),
            Message::assistant_with_calls(None, vec![unanswered]),
        ];
        sanitize_messages(&mut messages);

        assert_eq!(messages.len(), 4);
        assert!(messages
            .iter()
            .all(|m| m.tool_call_id.as_deref() != Some("orphan")));
        assert!(!messages
            .iter()
            .any(|m| m.has_tool_calls()
                && m.tool_calls.as_ref().unwrap()[0].id == "unanswered"));
    }
}
