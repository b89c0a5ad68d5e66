//! Isolated sandboxes for speculative operations.
//!
//! A sandbox is a named directory under `.mend/sandboxes/`: either an empty
//! scratch workspace or a copy of the working tree with volatile directories
//! excluded. Every executed operation is appended to the sandbox's in-memory
//! record; records are never mutated after the fact. Cleanup without `force`
//! refuses while completed operations remain unreviewed, so results are not
//! silently discarded.
//!
//! Sandbox names are a per-session namespace: two concurrent sessions must
//! not share a name (nothing locks the directory).

use crate::llm::synth;
use chrono::{DateTime, Utc};
use mend_core::util::{clip, resolve_under_root, run_with_deadline};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

const SANDBOX_DIR: &str = ".mend/sandboxes";
const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_OUTPUT_CHARS: usize = 8_000;
const MAX_INSPECT_FILES: usize = 50;
const MAX_INSPECT_OPERATIONS: usize = 10;

/// Directories excluded from a repository copy.
const COPY_EXCLUDES: &[&str] = &[
    ".git",
    ".mend",
    "node_modules",
    "target",
    "dist",
    "build",
    ".next",
    "__pycache__",
    ".pytest_cache",
    ".venv",
    "venv",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxKind {
    /// Empty scratch directory.
    Workspace,
    /// Copy of the working tree.
    RepoCopy,
}

impl SandboxKind {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "workspace" => Some(SandboxKind::Workspace),
            "repo_copy" => Some(SandboxKind::RepoCopy),
            _ => None,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            SandboxKind::Workspace => "workspace",
            SandboxKind::RepoCopy => "repo_copy",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Command,
    CodeExecution,
    FileOperation,
    BuildTest,
}

impl OperationKind {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "command" => Some(OperationKind::Command),
            "code_execution" => Some(OperationKind::CodeExecution),
            "file_operation" => Some(OperationKind::FileOperation),
            "build_test" => Some(OperationKind::BuildTest),
            _ => None,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            OperationKind::Command => "command",
            OperationKind::CodeExecution => "code_execution",
            OperationKind::FileOperation => "file_operation",
            OperationKind::BuildTest => "build_test",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    Completed,
    Failed,
}

/// One executed operation. Append-only: recorded once, never mutated, except
/// for the reviewed flag consumed by the cleanup guard.
#[derive(Debug, Clone)]
pub struct Operation {
    pub id: String,
    pub kind: OperationKind,
    pub description: String,
    pub result: Value,
    pub status: OperationStatus,
    pub reviewed: bool,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxStatus {
    Active,
    Removed,
}

#[derive(Debug)]
pub struct Sandbox {
    pub name: String,
    pub kind: SandboxKind,
    pub description: String,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub operations: Vec<Operation>,
    pub status: SandboxStatus,
}

impl Sandbox {
    fn workspace(&self) -> PathBuf {
        self.path.join("workspace")
    }

    fn to_status_value(&self) -> Value {
        json!({
            "name": self.name.clone(),
            "type": self.kind.label(),
            "description": self.description.clone(),
            "created_at": self.created_at.to_rfc3339(),
            "status": match self.status {
                SandboxStatus::Active => "active",
                SandboxStatus::Removed => "removed",
            },
            "operations_count": self.operations.len()
        })
    }
}

pub struct SandboxManager {
    root: PathBuf,
    sandboxes: BTreeMap<String, Sandbox>,
    repo_root: PathBuf,
}

impl SandboxManager {
    pub fn new(repo_root: &Path) -> Self {
        Self {
            root: repo_root.join(SANDBOX_DIR),
            sandboxes: BTreeMap::new(),
            repo_root: repo_root.to_path_buf(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Sandbox> {
        self.sandboxes.get(name)
    }

    /// Create a sandbox. Names are caller-chosen and unique within the
    /// session.
    pub fn create(&mut self, name: &str, description: &str, kind: &str) -> Value {
        if name.trim().is_empty() || !is_safe_name(name) {
            return json!({
                "error": format!("Invalid sandbox name '{}': use letters, digits, - or _", name)
            });
        }
        if self.sandboxes.contains_key(name) {
            return json!({ "error": format!("Sandbox '{}' already exists", name) });
        }
        let Some(kind) = SandboxKind::parse(kind) else {
            return json!({
                "error": format!("Unknown sandbox type '{}': expected workspace or repo_copy", kind)
            });
        };

        let path = self.root.join(name);
        let workspace = path.join("workspace");
        if let Err(e) = std::fs::create_dir_all(&workspace) {
            return json!({ "error": format!("Failed to create sandbox '{}': {}", name, e) });
        }

        if kind == SandboxKind::RepoCopy {
            if let Err(e) = copy_repo(&self.repo_root, &workspace) {
                let _ = std::fs::remove_dir_all(&path);
                return json!({ "error": format!("Failed to copy repository into '{}': {}", name, e) });
            }
        }

        let sandbox = Sandbox {
            name: name.to_string(),
            kind,
            description: description.to_string(),
            path: path.clone(),
            created_at: Utc::now(),
            operations: Vec::new(),
            status: SandboxStatus::Active,
        };
        self.sandboxes.insert(name.to_string(), sandbox);

        eprintln!("  Created sandbox '{}' at {}", name, path.display());
        json!({
            "success": true,
            "sandbox_name": name,
            "sandbox_path": path.display().to_string(),
            "type": kind.label(),
            "description": description,
            "ready_for_operations": true
        })
    }

    /// Execute one operation inside a sandbox and append its record.
    pub fn run(&mut self, name: &str, kind: &str, payload: &str, description: &str) -> Value {
        let Some(kind) = OperationKind::parse(kind) else {
            return json!({ "error": format!("Unknown operation type: {}", kind) });
        };
        let Some(sandbox) = self.sandboxes.get_mut(name) else {
            return json!({ "error": format!("Sandbox '{}' not found", name) });
        };

        eprintln!(
            "  Running {} in sandbox '{}': {}",
            kind.label(),
            name,
            clip(description, 120)
        );

        let workspace = sandbox.workspace();
        let result = match kind {
            OperationKind::Command | OperationKind::BuildTest => {
                run_sandbox_command(&workspace, payload)
            }
            OperationKind::CodeExecution => run_sandbox_code(&workspace, payload),
            OperationKind::FileOperation => run_sandbox_file_operation(&workspace, payload),
        };

        let status = if result.get("success").and_then(Value::as_bool).unwrap_or(false) {
            OperationStatus::Completed
        } else {
            OperationStatus::Failed
        };
        let operation = Operation {
            id: format!("op-{}", sandbox.operations.len() + 1),
            kind,
            description: description.to_string(),
            result: result.clone(),
            status,
            reviewed: false,
            recorded_at: Utc::now(),
        };
        let operation_id = operation.id.clone();
        sandbox.operations.push(operation);

        json!({
            "success": true,
            "operation_id": operation_id,
            "operation_type": kind.label(),
            "result": result,
            "sandbox_status": "active"
        })
    }

    /// Inspect a sandbox. A scope that covers operations marks the reported
    /// operations reviewed, which is what the cleanup guard checks.
    pub fn inspect(&mut self, name: &str, scope: &str) -> Value {
        let Some(sandbox) = self.sandboxes.get_mut(name) else {
            return json!({ "error": format!("Sandbox '{}' not found", name) });
        };

        let mut result = Map::new();
        result.insert("success".into(), json!(true));
        result.insert("sandbox_name".into(), json!(name));
        result.insert("inspection_type".into(), json!(scope));

        if matches!(scope, "status" | "all") {
            result.insert("status".into(), sandbox.to_status_value());
        }

        if matches!(scope, "files" | "all") {
            let workspace = sandbox.workspace();
            let mut files = Vec::new();
            for entry in walkdir::WalkDir::new(&workspace)
                .into_iter()
                .flatten()
                .filter(|e| e.file_type().is_file())
            {
                if files.len() >= MAX_INSPECT_FILES {
                    break;
                }
                if let Ok(rel) = entry.path().strip_prefix(&workspace) {
                    files.push(rel.display().to_string());
                }
            }
            files.sort();
            result.insert("files".into(), json!(files));
        }

        if matches!(scope, "logs" | "results" | "operations" | "all") {
            let recent: Vec<Value> = sandbox
                .operations
                .iter()
                .rev()
                .take(MAX_INSPECT_OPERATIONS)
                .rev()
                .map(|op| {
                    json!({
                        "id": op.id.clone(),
                        "type": op.kind.label(),
                        "description": op.description.clone(),
                        "status": match op.status {
                            OperationStatus::Completed => "completed",
                            OperationStatus::Failed => "failed",
                        },
                        "recorded_at": op.recorded_at.to_rfc3339(),
                        "result": op.result.clone()
                    })
                })
                .collect();
            result.insert("operations".into(), json!(recent));

            // Reporting results counts as reviewing them.
            for op in &mut sandbox.operations {
                op.reviewed = true;
            }
        }

        Value::Object(result)
    }

    /// Remove a sandbox. Refused (without `force`) while completed
    /// operations remain unreviewed.
    pub fn cleanup(&mut self, name: &str, force: bool) -> Value {
        let Some(sandbox) = self.sandboxes.get(name) else {
            return json!({ "error": format!("Sandbox '{}' not found", name) });
        };

        if !force {
            let unreviewed: Vec<&Operation> = sandbox
                .operations
                .iter()
                .filter(|op| op.status == OperationStatus::Completed && !op.reviewed)
                .collect();
            if !unreviewed.is_empty() {
                return json!({
                    "success": false,
                    "warning": format!(
                        "Sandbox has {} completed operations that were not reviewed. \
                         Inspect the sandbox first or use force=true.",
                        unreviewed.len()
                    ),
                    "operations": unreviewed
                        .iter()
                        .rev()
                        .take(5)
                        .map(|op| op.description.clone())
                        .collect::<Vec<_>>()
                });
            }
        }

        let Some(mut sandbox) = self.sandboxes.remove(name) else {
            return json!({ "error": format!("Sandbox '{}' not found", name) });
        };
        sandbox.status = SandboxStatus::Removed;
        let operations_removed = sandbox.operations.len();
        if sandbox.path.exists() {
            if let Err(e) = std::fs::remove_dir_all(&sandbox.path) {
                eprintln!(
                    "  Warning: failed to remove sandbox directory {}: {}",
                    sandbox.path.display(),
                    e
                );
            }
        }

        eprintln!("  Cleaned up sandbox '{}'", name);
        json!({
            "success": true,
            "sandbox_name": name,
            "cleaned_up": true,
            "operations_removed": operations_removed
        })
    }
}

fn is_safe_name(name: &str) -> bool {
    name.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
}

/// Copy the working tree into the sandbox workspace, skipping volatile and
/// generated directories.
fn copy_repo(repo_root: &Path, workspace: &Path) -> Result<(), String> {
    for entry in walkdir::WalkDir::new(repo_root)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| {
            let name = e.file_name().to_string_lossy();
            !COPY_EXCLUDES.contains(&name.as_ref())
        })
        .flatten()
    {
        let rel = entry
            .path()
            .strip_prefix(repo_root)
            .map_err(|e| e.to_string())?;
        let dest = workspace.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&dest).map_err(|e| e.to_string())?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
            }
            std::fs::copy(entry.path(), &dest).map_err(|e| e.to_string())?;
        }
    }
    Ok(())
}

fn run_sandbox_command(workspace: &Path, command: &str) -> Value {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command).current_dir(workspace);

    match run_with_deadline(&mut cmd, COMMAND_TIMEOUT) {
        Ok(outcome) => {
            if outcome.timed_out {
                return json!({
                    "success": false,
                    "error": format!("Command timed out after {}s", COMMAND_TIMEOUT.as_secs()),
                    "command": command
                });
            }
            json!({
                "success": outcome.success(),
                "returncode": outcome.exit_code,
                "stdout": clip(&outcome.stdout, MAX_OUTPUT_CHARS),
                "stderr": clip(&outcome.stderr, MAX_OUTPUT_CHARS),
                "command": command
            })
        }
        Err(e) => json!({ "success": false, "error": e, "command": command }),
    }
}

/// "Code execution" runs a declarative tool program rooted at the sandbox
/// workspace - the same closed interpreter dynamic tools use, with its own
/// argument scope. No foreign code runs.
fn run_sandbox_code(workspace: &Path, source: &str) -> Value {
    let program = match synth::compile(source) {
        Ok(program) => program,
        Err(e) => {
            return json!({
                "success": false,
                "error": format!("Invalid code program: {}", e)
            });
        }
    };
    let output = synth::run(&program, &Map::new(), workspace);
    match output.get("error").cloned() {
        Some(error) => json!({ "success": false, "error": error, "output": output }),
        None => json!({ "success": true, "output": output }),
    }
}

fn run_sandbox_file_operation(workspace: &Path, payload: &str) -> Value {
    let operation: Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(e) => {
            return json!({ "success": false, "error": format!("Invalid file operation: {}", e) });
        }
    };

    if let Some(create) = operation.get("create_file") {
        let (Some(path), Some(content)) = (
            create.get("path").and_then(Value::as_str),
            create.get("content").and_then(Value::as_str),
        ) else {
            return json!({ "success": false, "error": "create_file needs path and content" });
        };
        let resolved = match resolve_under_root(workspace, Path::new(path)) {
            Ok(resolved) => resolved.absolute,
            Err(e) => return json!({ "success": false, "error": e }),
        };
        if let Some(parent) = resolved.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                return json!({ "success": false, "error": e.to_string() });
            }
        }
        return match std::fs::write(&resolved, content) {
            Ok(()) => json!({
                "success": true,
                "operation": "file_created",
                "path": path
            }),
            Err(e) => json!({ "success": false, "error": e.to_string() }),
        };
    }

    if let Some(read) = operation.get("read_file") {
        let Some(path) = read.get("path").and_then(Value::as_str) else {
            return json!({ "success": false, "error": "read_file needs path" });
        };
        let resolved = match resolve_under_root(workspace, Path::new(path)) {
            Ok(resolved) => resolved.absolute,
            Err(e) => return json!({ "success": false, "error": e }),
        };
        return match std::fs::read_to_string(&resolved) {
            Ok(content) => json!({
                "success": true,
                "operation": "file_read",
                "content": clip(&content, MAX_OUTPUT_CHARS)
            }),
            Err(e) => json!({ "success": false, "error": e.to_string() }),
        };
    }

    json!({ "success": false, "error": "Unknown file operation" })
}
