//! Tool registry: built-in exploration primitives plus runtime-synthesized
//! tools with inferred schemas and a persistent cache.
//!
//! Built-in schemas come from the declarative manifest `base_tools.json`
//! compiled into this crate; synthesized-tool schemas are generated at
//! runtime and unioned with the manifest before every inference call.
//!
//! Failure semantics: compilation and invocation errors are returned as
//! structured error payloads, never propagated; the session must stay alive
//! so the model can adapt.

use super::synth;
use chrono::{DateTime, Utc};
use mend_adapters::cache::{CachedTool, ToolCacheStore};
use mend_core::util::{clip, content_hash, debug_stderr_enabled, resolve_under_root};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Cap on file content returned to the model (avoids token blowups during
/// exploration).
const MAX_CONTENT_CHARS: usize = 8_000;
/// Matching-line cap per file for text search.
const MATCHES_PER_FILE: usize = 3;
/// Default file cap for text search.
const DEFAULT_MAX_MATCHES: usize = 10;
/// Directory-listing caps.
const MAX_DIR_ENTRIES: usize = 20;
/// Ceiling on files walked per search to bound worst-case latency.
const MAX_FILES_WALKED: usize = 2_000;
/// Semantic-search chunking limits.
const MAX_CHUNKS: usize = 200;
const MIN_CHUNK_CHARS: usize = 50;
const CHUNK_SOFT_LINES: usize = 5;
const CHUNK_HARD_LINES: usize = 20;
const EMBED_DIMS: usize = 256;

/// Directories never worth exploring or copying.
pub(crate) const EXCLUDED_DIRS: &[&str] = &[
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

const MANIFEST: &str = include_str!("base_tools.json");

/// Tool definitions for the LLM
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolOrigin {
    BuiltIn,
    Synthesized,
}

#[derive(Debug, Clone)]
struct SynthesizedTool {
    definition: ToolDefinition,
    source: String,
    hash: String,
    created_at: DateTime<Utc>,
    program: synth::ToolProgram,
}

/// Load built-in tool schemas from the embedded manifest.
pub fn load_base_tool_schemas() -> Vec<ToolDefinition> {
    match serde_json::from_str(MANIFEST) {
        Ok(tools) => tools,
        Err(e) => {
            eprintln!("  Warning: failed to load base tool manifest: {}", e);
            Vec::new()
        }
    }
}

pub struct ToolRegistry {
    repo_root: PathBuf,
    builtins: Vec<ToolDefinition>,
    synthesized: BTreeMap<String, SynthesizedTool>,
    cache: ToolCacheStore,
    semantic_disabled: bool,
    compiled_count: u64,
}

impl ToolRegistry {
    /// Build a registry rooted at the repository, reloading any previously
    /// synthesized tools from the cache store.
    pub fn new(repo_root: &Path, cache: ToolCacheStore, semantic_disabled: bool) -> Self {
        let mut registry = Self {
            repo_root: repo_root.to_path_buf(),
            builtins: load_base_tool_schemas(),
            synthesized: BTreeMap::new(),
            cache,
            semantic_disabled,
            compiled_count: 0,
        };
        registry.load_cached_tools();
        registry
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    /// Built-in schemas as loaded from the manifest.
    pub fn list_builtin_schemas(&self) -> &[ToolDefinition] {
        &self.builtins
    }

    /// The full schema list for one inference call: manifest built-ins
    /// unioned with every synthesized tool.
    pub fn schemas(&self) -> Vec<ToolDefinition> {
        let mut all = self.builtins.clone();
        all.extend(self.synthesized.values().map(|t| t.definition.clone()));
        all
    }

    pub fn origin_of(&self, name: &str) -> Option<ToolOrigin> {
        if self.builtins.iter().any(|t| t.function.name == name) {
            Some(ToolOrigin::BuiltIn)
        } else if self.synthesized.contains_key(name) {
            Some(ToolOrigin::Synthesized)
        } else {
            None
        }
    }

    #[cfg(test)]
    pub(crate) fn compiled_count(&self) -> u64 {
        self.compiled_count
    }

    /// Dispatch one tool invocation. Unknown names come back as structured
    /// error payloads so the model can recover within the conversation.
    pub fn invoke(&mut self, name: &str, args: &Value) -> Value {
        match name {
            "list_directory" => match str_arg(args, "path") {
                Some(path) => self.list_directory(&path),
                None => missing_arg("path"),
            },
            "read_file" => match str_arg(args, "path") {
                Some(path) => self.read_file(&path, str_arg(args, "lines").as_deref()),
                None => missing_arg("path"),
            },
            "search_files" => match str_arg(args, "pattern") {
                Some(pattern) => {
                    let file_type = str_arg(args, "file_type").unwrap_or_else(|| "*.ts".into());
                    let max = usize_arg(args, "max_matches").unwrap_or(DEFAULT_MAX_MATCHES);
                    self.search_files(&pattern, &file_type, max)
                }
                None => missing_arg("pattern"),
            },
            "find_imports" => match str_arg(args, "file_path") {
                Some(path) => self.find_imports(&path),
                None => missing_arg("file_path"),
            },
            "find_usage" => match str_arg(args, "symbol") {
                Some(symbol) => {
                    let file_type = str_arg(args, "file_type").unwrap_or_else(|| "*.ts".into());
                    self.search_files(&symbol, &file_type, DEFAULT_MAX_MATCHES)
                }
                None => missing_arg("symbol"),
            },
            "semantic_search" => match str_arg(args, "query") {
                Some(query) => {
                    let file_type = str_arg(args, "file_type").unwrap_or_else(|| "*.ts".into());
                    let max_results = usize_arg(args, "max_results").unwrap_or(8);
                    let threshold = f64_arg(args, "similarity_threshold").unwrap_or(0.3);
                    self.semantic_search(&query, &file_type, max_results, threshold)
                }
                None => missing_arg("query"),
            },
            "create_dynamic_tool" => {
                let (Some(tool_name), Some(source), Some(description)) = (
                    str_arg(args, "tool_name"),
                    str_arg(args, "tool_source"),
                    str_arg(args, "description"),
                ) else {
                    return json!({
                        "error": "create_dynamic_tool requires tool_name, tool_source, and description"
                    });
                };
                self.synthesize(&tool_name, &source, &description)
            }
            "call_dynamic_tool" => match str_arg(args, "tool_name") {
                Some(tool_name) => {
                    let arguments = args.get("arguments").cloned().unwrap_or(json!({}));
                    self.invoke_synthesized(&tool_name, &arguments)
                }
                None => missing_arg("tool_name"),
            },
            "get_dynamic_tools_info" => self.dynamic_tools_info(),
            other if self.synthesized.contains_key(other) => {
                self.invoke_synthesized(other, args)
            }
            other => json!({ "error": format!("Unknown function: {}", other) }),
        }
    }

    /// Compile and register a synthesized tool. Re-synthesis with
    /// byte-identical source is a no-op that reuses the cached entry.
    pub fn synthesize(&mut self, name: &str, source: &str, description: &str) -> Value {
        if name.trim().is_empty() {
            return json!({ "error": "tool name must be non-empty" });
        }
        if self.builtins.iter().any(|t| t.function.name == name) {
            return json!({
                "error": format!("'{}' is a built-in tool and cannot be replaced", name)
            });
        }

        let hash = content_hash(source);
        if let Some(existing) = self.synthesized.get(name) {
            if existing.hash == hash {
                if debug_stderr_enabled() {
                    eprintln!("  Using cached version of tool '{}'", name);
                }
                return json!({
                    "success": true,
                    "tool_name": name,
                    "description": existing.definition.function.description.clone(),
                    "cached": true
                });
            }
        }

        let program = match synth::compile(source) {
            Ok(program) => program,
            Err(e) => {
                return json!({ "error": format!("Failed to create tool '{}': {}", name, e) });
            }
        };
        self.compiled_count += 1;

        let schema = synth::schema(&program, name, description);
        let definition: ToolDefinition = match serde_json::from_value(schema.clone()) {
            Ok(definition) => definition,
            Err(e) => {
                return json!({ "error": format!("Failed to create tool '{}': {}", name, e) });
            }
        };

        let created_at = Utc::now();
        let _ = self.cache.save(&CachedTool {
            name: name.to_string(),
            source: source.to_string(),
            description: description.to_string(),
            hash: hash.clone(),
            created_at,
        });

        self.synthesized.insert(
            name.to_string(),
            SynthesizedTool {
                definition,
                source: source.to_string(),
                hash,
                created_at,
                program,
            },
        );

        eprintln!("  Created tool '{}' with inferred schema", name);
        json!({
            "success": true,
            "tool_name": name,
            "description": description,
            "schema": schema,
            "cached": false
        })
    }

    fn invoke_synthesized(&self, name: &str, arguments: &Value) -> Value {
        let Some(tool) = self.synthesized.get(name) else {
            return json!({ "error": format!("Dynamic tool '{}' not found", name) });
        };
        let args: Map<String, Value> = match arguments {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                return json!({
                    "error": format!("arguments must be a JSON object, got {}", other)
                });
            }
        };
        synth::run(&tool.program, &args, &self.repo_root)
    }

    fn dynamic_tools_info(&self) -> Value {
        let mut info = Map::new();
        for (name, tool) in &self.synthesized {
            info.insert(
                name.clone(),
                json!({
                    "description": tool.definition.function.description.clone(),
                    "available": true,
                    "created_at": tool.created_at.to_rfc3339(),
                    "source_hash": tool.hash.clone()
                }),
            );
        }
        Value::Object(info)
    }

    /// Recompile every cached tool at startup so prior sessions' tools are
    /// invocable again.
    fn load_cached_tools(&mut self) {
        let entries = self.cache.load_all();
        if entries.is_empty() {
            return;
        }

        let mut loaded = 0usize;
        for entry in entries {
            if self.synthesized.contains_key(&entry.name) {
                continue;
            }
            match synth::compile(&entry.source) {
                Ok(program) => {
                    self.compiled_count += 1;
                    let schema = synth::schema(&program, &entry.name, &entry.description);
                    let Ok(definition) = serde_json::from_value::<ToolDefinition>(schema) else {
                        continue;
                    };
                    self.synthesized.insert(
                        entry.name.clone(),
                        SynthesizedTool {
                            definition,
                            source: entry.source,
                            hash: entry.hash,
                            created_at: entry.created_at,
                            program,
                        },
                    );
                    loaded += 1;
                }
                Err(e) => {
                    if debug_stderr_enabled() {
                        eprintln!(
                            "  Warning: failed to load cached tool '{}': {}",
                            entry.name, e
                        );
                    }
                }
            }
        }

        if loaded > 0 {
            eprintln!("  Loaded {} cached tools on startup", loaded);
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    //  BUILT-IN TOOLS
    // ═══════════════════════════════════════════════════════════════════

    fn list_directory(&self, path: &str) -> Value {
        let target = if path == "." || path.is_empty() {
            self.repo_root.clone()
        } else {
            match resolve_under_root(&self.repo_root, Path::new(path)) {
                Ok(resolved) => resolved.absolute,
                Err(e) => return json!({ "error": format!("Invalid path '{}': {}", path, e) }),
            }
        };

        if !target.is_dir() {
            return json!({ "error": format!("Directory {} not found", path) });
        }

        let Ok(entries) = std::fs::read_dir(&target) else {
            return json!({ "error": format!("Error listing directory {}", path) });
        };

        let mut files = Vec::new();
        let mut directories = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            let entry_path = entry.path();
            if entry_path.is_dir() {
                if !name.starts_with('.') && !EXCLUDED_DIRS.contains(&name.as_str()) {
                    directories.push(name);
                }
            } else {
                files.push(name);
            }
        }
        files.sort();
        directories.sort();
        files.truncate(MAX_DIR_ENTRIES);
        directories.truncate(MAX_DIR_ENTRIES);

        json!({ "path": path, "files": files, "directories": directories })
    }

    fn read_file(&self, path: &str, lines: Option<&str>) -> Value {
        let target = match resolve_under_root(&self.repo_root, Path::new(path)) {
            Ok(resolved) => resolved.absolute,
            Err(e) => return json!({ "error": format!("Invalid path '{}': {}", path, e) }),
        };
        if !target.is_file() {
            return json!({ "error": format!("File {} not found", path) });
        }

        let content = match std::fs::read_to_string(&target) {
            Ok(content) => content,
            Err(e) => return json!({ "error": format!("Error reading file {}: {}", path, e) }),
        };
        let all_lines: Vec<&str> = content.lines().collect();
        let total_lines = all_lines.len();

        let mut selected = match lines.map(str::trim).filter(|s| !s.is_empty()) {
            Some(spec) => {
                if let Some((start, end)) = spec.split_once('-') {
                    let (Ok(start), Ok(end)) = (start.parse::<usize>(), end.parse::<usize>())
                    else {
                        return json!({ "error": format!("Invalid line range '{}'", spec) });
                    };
                    let start = start.max(1) - 1;
                    let end = end.min(total_lines);
                    if start >= end {
                        String::new()
                    } else {
                        all_lines[start..end].join("\n")
                    }
                } else {
                    let Ok(line) = spec.parse::<usize>() else {
                        return json!({ "error": format!("Invalid line selector '{}'", spec) });
                    };
                    // Show context around the requested line.
                    let start = line.saturating_sub(1).saturating_sub(5);
                    let end = (line + 5).min(total_lines);
                    if start >= end {
                        String::new()
                    } else {
                        all_lines[start..end].join("\n")
                    }
                }
            }
            None => content.clone(),
        };

        if selected.len() > MAX_CONTENT_CHARS {
            let mut cut: String = selected.chars().take(MAX_CONTENT_CHARS).collect();
            cut.push_str("\n/* truncated */");
            selected = cut;
        }

        json!({ "path": path, "content": selected, "total_lines": total_lines })
    }

    fn search_files(&self, pattern: &str, file_type: &str, max_matches: usize) -> Value {
        let max_matches = max_matches.max(1);
        let mut matches = Vec::new();

        for file in collect_matching_files(&self.repo_root, file_type) {
            let Ok(content) = std::fs::read_to_string(&file) else {
                continue;
            };
            if !content.contains(pattern) {
                continue;
            }

            let line_matches: Vec<Value> = content
                .lines()
                .enumerate()
                .filter(|(_, line)| line.contains(pattern))
                .take(MATCHES_PER_FILE)
                .map(|(i, line)| json!([i + 1, clip(line.trim(), 200)]))
                .collect();

            let rel = file.strip_prefix(&self.repo_root).unwrap_or(&file);
            matches.push(json!({
                "file": rel.display().to_string(),
                "matches": line_matches
            }));
            if matches.len() >= max_matches {
                break;
            }
        }

        json!({ "pattern": pattern, "matches": matches })
    }

    fn find_imports(&self, file_path: &str) -> Value {
        let target = match resolve_under_root(&self.repo_root, Path::new(file_path)) {
            Ok(resolved) => resolved.absolute,
            Err(e) => return json!({ "error": format!("Invalid path '{}': {}", file_path, e) }),
        };
        if !target.is_file() {
            return json!({ "error": format!("File {} not found", file_path) });
        }
        let content = match std::fs::read_to_string(&target) {
            Ok(content) => content,
            Err(e) => {
                return json!({
                    "error": format!("Error analyzing imports in {}: {}", file_path, e)
                });
            }
        };

        // Structural patterns for the languages this pipeline repairs:
        // TS/JS import/require, Python import, Rust use.
        let patterns = [
            r#"(?m)import.*from\s+['"]([^'"]+)['"]"#,
            r#"(?m)import\s+['"]([^'"]+)['"]"#,
            r#"(?m)require\(['"]([^'"]+)['"]\)"#,
            r"(?m)^\s*from\s+([\w.]+)\s+import",
            r"(?m)^\s*import\s+([\w.]+)\s*$",
            r"(?m)^\s*(?:pub\s+)?use\s+([\w:]+)",
        ];

        let mut imports = Vec::new();
        for pattern in patterns {
            let Ok(re) = Regex::new(pattern) else {
                continue;
            };
            for caps in re.captures_iter(&content) {
                if let Some(import) = caps.get(1) {
                    let import = import.as_str().to_string();
                    if !imports.contains(&import) {
                        imports.push(import);
                    }
                }
            }
        }

        json!({ "file": file_path, "imports": imports })
    }

    /// Rank code chunks against a query with hashed bag-of-tokens cosine
    /// similarity. No model download, so the unavailable path only triggers
    /// when the backend is disabled or the repo yields nothing chunkable.
    pub fn semantic_search(
        &self,
        query: &str,
        file_type: &str,
        max_results: usize,
        similarity_threshold: f64,
    ) -> Value {
        if self.semantic_disabled {
            return json!({
                "error": "Semantic search unavailable (disabled via MEND_DISABLE_SEMANTIC)",
                "fallback_suggestion": "Use search_files for exact text matches instead",
                "query": query
            });
        }

        let chunks = chunk_repository(&self.repo_root, file_type);
        if chunks.is_empty() {
            return json!({
                "error": "No code chunks found to search",
                "fallback_suggestion": "Use search_files for exact text matches instead",
                "query": query
            });
        }

        let query_vec = embed(query);
        let mut scored: Vec<(f64, &Chunk)> = chunks
            .iter()
            .map(|chunk| (cosine(&query_vec, &embed(&chunk.text)), chunk))
            .filter(|(similarity, _)| *similarity >= similarity_threshold)
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(max_results.max(1));

        let semantic_matches: Vec<Value> = scored
            .iter()
            .map(|(similarity, chunk)| {
                json!({
                    "similarity": (similarity * 1000.0).round() / 1000.0,
                    "file_context": {
                        "file": chunk.file,
                        "start_line": chunk.start_line,
                        "end_line": chunk.end_line
                    },
                    "code_snippet": clip(&chunk.text, 500)
                })
            })
            .collect();

        json!({
            "query": query,
            "total_chunks_analyzed": chunks.len(),
            "results_found": semantic_matches.len(),
            "semantic_matches": semantic_matches,
            "backend": "hashed-token-cosine"
        })
    }
}

fn missing_arg(name: &str) -> Value {
    json!({ "error": format!("missing required argument '{}'", name) })
}

fn str_arg(args: &Value, key: &str) -> Option<String> {
    args.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

fn usize_arg(args: &Value, key: &str) -> Option<usize> {
    args.get(key).and_then(|v| v.as_u64()).map(|v| v as usize)
}

fn f64_arg(args: &Value, key: &str) -> Option<f64> {
    args.get(key).and_then(|v| v.as_f64())
}

/// Walk the repository collecting files that match a `*.ext` style glob,
/// skipping excluded and hidden directories.
pub(crate) fn collect_matching_files(root: &Path, glob: &str) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
        let name = entry.file_name().to_string_lossy();
        if entry.file_type().is_dir() {
            !EXCLUDED_DIRS.contains(&name.as_ref()) && !(entry.depth() > 0 && name.starts_with('.'))
        } else {
            true
        }
    });

    for entry in walker.flatten() {
        if files.len() >= MAX_FILES_WALKED {
            break;
        }
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if glob_matches(&name, glob) {
            files.push(entry.into_path());
        }
    }
    files.sort();
    files
}

fn glob_matches(file_name: &str, glob: &str) -> bool {
    match glob {
        "*" | "*.*" | "" => true,
        _ => {
            if let Some(ext) = glob.strip_prefix("*.") {
                file_name
                    .rsplit_once('.')
                    .map(|(_, file_ext)| file_ext.eq_ignore_ascii_case(ext))
                    .unwrap_or(false)
            } else {
                file_name == glob
            }
        }
    }
}

struct Chunk {
    file: String,
    start_line: usize,
    end_line: usize,
    text: String,
}

/// Split matching files into rough logical chunks: boundaries at
/// definition-looking lines once a chunk has some body, or at a hard line
/// cap.
fn chunk_repository(root: &Path, file_type: &str) -> Vec<Chunk> {
    const BOUNDARY_PREFIXES: &[&str] = &[
        "function ",
        "class ",
        "interface ",
        "export ",
        "const ",
        "let ",
        "var ",
        "def ",
        "fn ",
        "pub ",
        "struct ",
        "impl ",
    ];

    let mut chunks = Vec::new();
    'files: for file in collect_matching_files(root, file_type) {
        let Ok(content) = std::fs::read_to_string(&file) else {
            continue;
        };
        let rel = file
            .strip_prefix(root)
            .unwrap_or(&file)
            .display()
            .to_string();

        let mut current: Vec<&str> = Vec::new();
        let mut chunk_start = 0usize;
        for (i, line) in content.lines().enumerate() {
            current.push(line);

            let at_boundary = BOUNDARY_PREFIXES
                .iter()
                .any(|prefix| line.trim_start().starts_with(prefix))
                && current.len() > CHUNK_SOFT_LINES;
            if at_boundary || current.len() > CHUNK_HARD_LINES {
                let text = current.join("\n");
                if text.trim().len() > MIN_CHUNK_CHARS {
                    chunks.push(Chunk {
                        file: rel.clone(),
                        start_line: chunk_start + 1,
                        end_line: i + 1,
                        text,
                    });
                }
                current.clear();
                chunk_start = i + 1;
                if chunks.len() >= MAX_CHUNKS {
                    break 'files;
                }
            }
        }
        let text = current.join("\n");
        if text.trim().len() > MIN_CHUNK_CHARS {
            chunks.push(Chunk {
                file: rel,
                start_line: chunk_start + 1,
                end_line: content.lines().count(),
                text,
            });
        }
        if chunks.len() >= MAX_CHUNKS {
            break;
        }
    }
    chunks
}

/// Hash tokens into a fixed-size count vector.
fn embed(text: &str) -> Vec<f64> {
    let mut vector = vec![0.0f64; EMBED_DIMS];
    let token_re = Regex::new(r"[A-Za-z_][A-Za-z0-9_]*").expect("static regex");
    for token in token_re.find_iter(&text.to_lowercase()) {
        let slot = fnv_slot(token.as_str());
        vector[slot] += 1.0;
    }
    vector
}

fn fnv_slot(token: &str) -> usize {
    const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;
    let mut hash = FNV_OFFSET_BASIS;
    for byte in token.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    (hash % EMBED_DIMS as u64) as usize
}

fn cosine(a: &[f64], b: &[f64]) -> f64 {
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f64 = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mend_adapters::cache::ToolCacheStore;

    const PROGRAM: &str = r#"{
        "params": [{"name": "pattern", "type": "string"}],
        "steps": [{"op": "filtered_search", "pattern": "{pattern}", "glob": "*.rs"}]
    }"#;

    fn registry_at(root: &Path) -> ToolRegistry {
        ToolRegistry::new(root, ToolCacheStore::new(root), false)
    }

    #[test]
    fn manifest_loads_and_contains_core_builtins() {
        let tools = load_base_tool_schemas();
        assert!(!tools.is_empty());
        for expected in [
            "list_directory",
            "read_file",
            "search_files",
            "find_imports",
            "semantic_search",
            "create_dynamic_tool",
            "create_sandbox",
            "cleanup_sandbox",
        ] {
            assert!(
                tools.iter().any(|t| t.function.name == expected),
                "manifest is missing {}",
                expected
            );
        }
    }

    #[test]
    fn synthesis_is_idempotent_for_identical_source() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = registry_at(dir.path());

        let first = registry.synthesize("grep_lines", PROGRAM, "search helper");
        assert_eq!(first["success"], serde_json::json!(true));
        assert_eq!(first["cached"], serde_json::json!(false));
        assert_eq!(registry.compiled_count(), 1);

        let second = registry.synthesize("grep_lines", PROGRAM, "search helper");
        assert_eq!(second["cached"], serde_json::json!(true));
        assert_eq!(registry.compiled_count(), 1, "second synthesis must not recompile");
    }

    #[test]
    fn synthesized_tools_survive_registry_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut registry = registry_at(dir.path());
            registry.synthesize("grep_lines", PROGRAM, "search helper");
        }

        let registry = registry_at(dir.path());
        assert_eq!(registry.origin_of("grep_lines"), Some(ToolOrigin::Synthesized));
        assert!(registry
            .schemas()
            .iter()
            .any(|t| t.function.name == "grep_lines"));
    }

    #[test]
    fn unknown_tool_returns_structured_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = registry_at(dir.path());
        let result = registry.invoke("summon_unicorn", &serde_json::json!({}));
        assert!(result["error"]
            .as_str()
            .unwrap()
            .contains("Unknown function: summon_unicorn"));
    }

    #[test]
    fn builtin_names_cannot_be_shadowed() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = registry_at(dir.path());
        let result = registry.synthesize("read_file", PROGRAM, "shadow attempt");
        assert!(result["error"].as_str().unwrap().contains("built-in"));
    }

    #[test]
    fn list_directory_reports_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = registry_at(dir.path());
        let result = registry.invoke("list_directory", &serde_json::json!({"path": "nope"}));
        assert!(result["error"].as_str().unwrap().contains("not found"));
    }

    #[test]
    fn read_file_supports_ranges_and_truncation() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("small.txt"), "a\nb\nc\nd\ne\n").unwrap();
        let big_line = "x".repeat(500);
        let big: String = (0..40).map(|_| format!("{}\n", big_line)).collect();
        std::fs::write(dir.path().join("big.txt"), big).unwrap();

        let mut registry = registry_at(dir.path());

        let ranged = registry.invoke(
            "read_file",
            &serde_json::json!({"path": "small.txt", "lines": "2-4"}),
        );
        assert_eq!(ranged["content"], serde_json::json!("b\nc\nd"));
        assert_eq!(ranged["total_lines"], serde_json::json!(5));

        let truncated = registry.invoke("read_file", &serde_json::json!({"path": "big.txt"}));
        assert!(truncated["content"]
            .as_str()
            .unwrap()
            .ends_with("/* truncated */"));
    }

    #[test]
    fn search_files_caps_files_and_lines() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..15 {
            std::fs::write(
                dir.path().join(format!("f{}.ts", i)),
                "needle one\nneedle two\nneedle three\nneedle four\n",
            )
            .unwrap();
        }

        let mut registry = registry_at(dir.path());
        let result = registry.invoke(
            "search_files",
            &serde_json::json!({"pattern": "needle", "file_type": "*.ts"}),
        );
        let matches = result["matches"].as_array().unwrap();
        assert_eq!(matches.len(), 10);
        assert_eq!(matches[0]["matches"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn find_imports_extracts_multiple_languages() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("mixed.ts"),
            "import { api } from './api';\nimport 'polyfill';\nconst fs = require('fs');\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("lib.rs"),
            "use serde::Deserialize;\npub use crate::util;\n",
        )
        .unwrap();

        let mut registry = registry_at(dir.path());

        let ts = registry.invoke("find_imports", &serde_json::json!({"file_path": "mixed.ts"}));
        let imports = ts["imports"].as_array().unwrap();
        assert!(imports.contains(&serde_json::json!("./api")));
        assert!(imports.contains(&serde_json::json!("polyfill")));
        assert!(imports.contains(&serde_json::json!("fs")));

        let rust = registry.invoke("find_imports", &serde_json::json!({"file_path": "lib.rs"}));
        let imports = rust["imports"].as_array().unwrap();
        assert!(imports.contains(&serde_json::json!("serde::Deserialize")));
    }

    #[test]
    fn semantic_search_degrades_gracefully_when_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = ToolRegistry::new(dir.path(), ToolCacheStore::new(dir.path()), true);
        let result = registry.invoke("semantic_search", &serde_json::json!({"query": "auth"}));
        assert!(result["error"].as_str().unwrap().contains("unavailable"));
        assert!(result["fallback_suggestion"].is_string());
    }

    #[test]
    fn semantic_search_ranks_relevant_chunks_first() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("auth.ts"),
            "export function validateAuthToken(token: string) {\n  const authHeader = token;\n  if (!authHeader) throw new Error('missing auth token');\n  return verifyToken(authHeader);\n}\nexport function unrelatedHelper() {\n  return 42;\n}\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("math.ts"),
            "export function addNumbers(a: number, b: number) {\n  const sum = a + b;\n  return sum;\n}\nexport function multiplyNumbers(a: number, b: number) {\n  return a * b;\n}\n",
        )
        .unwrap();

        let registry = registry_at(dir.path());
        let result = registry.semantic_search("validate auth token header", "*.ts", 3, 0.05);
        let matches = result["semantic_matches"].as_array().unwrap();
        assert!(!matches.is_empty());
        assert_eq!(
            matches[0]["file_context"]["file"],
            serde_json::json!("auth.ts")
        );
    }
}
