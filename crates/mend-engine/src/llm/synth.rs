//! Synthesized tools: declarative programs over a closed operation set.
//!
//! The model "creates" a tool by submitting a JSON program: declared
//! parameters plus a pipeline of tagged steps (`filtered_search`,
//! `structured_read`, `pattern_transform`, `count_matches`). A fixed
//! interpreter dispatches the steps, so no model-generated code is ever
//! executed; the source text is still hashed and cached like compiled code.
//!
//! Parameters are substituted into step fields via `{name}` placeholders.
//! Schema inference reflects over the declared parameters: the declared type
//! maps to a schema primitive (string when unspecified), and a parameter
//! without a default is required.

use mend_core::util::{clip, resolve_under_root};
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::path::Path;

/// Cap on any single step's textual output.
const MAX_STEP_OUTPUT_CHARS: usize = 8_000;
/// Per-file and overall match caps for search-flavored steps.
const MATCHES_PER_FILE: usize = 3;
const DEFAULT_MAX_MATCHES: i64 = 20;
const DEFAULT_READ_SPAN: i64 = 200;

#[derive(Debug, Clone, Deserialize)]
pub struct ToolProgram {
    #[serde(default)]
    pub params: Vec<ParamSpec>,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(rename = "type", default)]
    pub param_type: Option<String>,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    /// Regex search across files selected by a glob, capped match counts.
    FilteredSearch {
        pattern: String,
        #[serde(default)]
        glob: Option<String>,
        #[serde(default)]
        max_matches: Option<Value>,
    },
    /// Read a line slice of one file.
    StructuredRead {
        path: String,
        #[serde(default)]
        start: Option<Value>,
        #[serde(default)]
        end: Option<Value>,
    },
    /// Regex find/replace over a file's content or inline input. Pure
    /// transformation - never writes back.
    PatternTransform {
        #[serde(default)]
        path: Option<String>,
        #[serde(default)]
        input: Option<String>,
        find: String,
        replace: String,
    },
    /// Count regex matches across files selected by a glob.
    CountMatches {
        pattern: String,
        #[serde(default)]
        glob: Option<String>,
    },
}

/// Parse and validate a program. This is the whole of "compilation": after
/// this succeeds the program is invocable.
pub fn compile(source: &str) -> Result<ToolProgram, String> {
    let program: ToolProgram =
        serde_json::from_str(source).map_err(|e| format!("invalid tool program: {}", e))?;

    if program.steps.is_empty() {
        return Err("tool program has no steps".to_string());
    }

    let ident = Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").expect("static regex");
    let mut seen = Vec::new();
    for param in &program.params {
        if !ident.is_match(&param.name) {
            return Err(format!("invalid parameter name '{}'", param.name));
        }
        if seen.contains(&param.name.as_str()) {
            return Err(format!("duplicate parameter '{}'", param.name));
        }
        seen.push(param.name.as_str());
    }

    for placeholder in collect_placeholders(&program) {
        if !seen.contains(&placeholder.as_str()) {
            return Err(format!(
                "step references undeclared parameter '{{{}}}'",
                placeholder
            ));
        }
    }

    Ok(program)
}

fn collect_placeholders(program: &ToolProgram) -> Vec<String> {
    let re = Regex::new(r"\{([a-zA-Z_][a-zA-Z0-9_]*)\}").expect("static regex");
    let mut found = Vec::new();
    let mut scan = |text: &str| {
        for caps in re.captures_iter(text) {
            let name = caps[1].to_string();
            if !found.contains(&name) {
                found.push(name);
            }
        }
    };

    for step in &program.steps {
        match step {
            Step::FilteredSearch {
                pattern,
                glob,
                max_matches,
            } => {
                scan(pattern);
                if let Some(glob) = glob {
                    scan(glob);
                }
                scan_value(max_matches, &mut scan);
            }
            Step::StructuredRead { path, start, end } => {
                scan(path);
                scan_value(start, &mut scan);
                scan_value(end, &mut scan);
            }
            Step::PatternTransform {
                path,
                input,
                find,
                replace,
            } => {
                if let Some(path) = path {
                    scan(path);
                }
                if let Some(input) = input {
                    scan(input);
                }
                scan(find);
                scan(replace);
            }
            Step::CountMatches { pattern, glob } => {
                scan(pattern);
                if let Some(glob) = glob {
                    scan(glob);
                }
            }
        }
    }
    found
}

fn scan_value(value: &Option<Value>, scan: &mut impl FnMut(&str)) {
    if let Some(Value::String(text)) = value {
        scan(text);
    }
}

/// Build the function-calling schema for a compiled program.
pub fn schema(program: &ToolProgram, name: &str, description: &str) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();

    for param in &program.params {
        let param_type = match param.param_type.as_deref() {
            Some("integer") => "integer",
            Some("number") => "number",
            Some("boolean") => "boolean",
            Some("array") => "array",
            Some("object") => "object",
            _ => "string",
        };
        let description = param
            .description
            .clone()
            .unwrap_or_else(|| format!("Parameter {}", param.name));
        properties.insert(
            param.name.clone(),
            json!({ "type": param_type, "description": description }),
        );
        if param.default.is_none() {
            required.push(Value::String(param.name.clone()));
        }
    }

    json!({
        "type": "function",
        "function": {
            "name": name,
            "description": description,
            "parameters": {
                "type": "object",
                "properties": properties,
                "required": required
            }
        }
    })
}

/// Run a compiled program against the given root with JSON arguments.
/// Failures come back as structured error payloads, never as panics.
pub fn run(program: &ToolProgram, args: &Map<String, Value>, root: &Path) -> Value {
    let resolved = match resolve_args(program, args) {
        Ok(resolved) => resolved,
        Err(e) => return json!({ "error": e }),
    };

    let mut outputs = Vec::new();
    for (idx, step) in program.steps.iter().enumerate() {
        match run_step(step, &resolved, root) {
            Ok(output) => outputs.push(output),
            Err(e) => {
                return json!({
                    "error": format!("step {} failed: {}", idx + 1, e),
                    "steps": outputs
                });
            }
        }
    }

    json!({ "success": true, "steps": outputs })
}

/// Overlay provided arguments on declared defaults; missing required
/// parameters are an invocation error.
fn resolve_args(
    program: &ToolProgram,
    provided: &Map<String, Value>,
) -> Result<Map<String, Value>, String> {
    let mut resolved = Map::new();
    for param in &program.params {
        if let Some(value) = provided.get(&param.name) {
            resolved.insert(param.name.clone(), value.clone());
        } else if let Some(default) = &param.default {
            resolved.insert(param.name.clone(), default.clone());
        } else {
            return Err(format!("missing required parameter '{}'", param.name));
        }
    }
    Ok(resolved)
}

/// Substitute `{name}` placeholders with argument values.
fn render(template: &str, args: &Map<String, Value>) -> String {
    let mut out = template.to_string();
    for (name, value) in args {
        let placeholder = format!("{{{}}}", name);
        if !out.contains(&placeholder) {
            continue;
        }
        let rendered = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        out = out.replace(&placeholder, &rendered);
    }
    out
}

fn render_number(
    field: &Option<Value>,
    args: &Map<String, Value>,
    default: i64,
) -> Result<i64, String> {
    match field {
        None => Ok(default),
        Some(Value::Number(n)) => n
            .as_i64()
            .ok_or_else(|| format!("expected an integer, got {}", n)),
        Some(Value::String(text)) => {
            let rendered = render(text, args);
            rendered
                .trim()
                .parse::<i64>()
                .map_err(|_| format!("expected an integer, got '{}'", rendered))
        }
        Some(other) => Err(format!("expected an integer, got {}", other)),
    }
}

fn run_step(step: &Step, args: &Map<String, Value>, root: &Path) -> Result<Value, String> {
    match step {
        Step::FilteredSearch {
            pattern,
            glob,
            max_matches,
        } => {
            let pattern = render(pattern, args);
            let re = Regex::new(&pattern).map_err(|e| format!("invalid pattern: {}", e))?;
            let glob = glob
                .as_deref()
                .map(|g| render(g, args))
                .unwrap_or_else(|| "*.*".to_string());
            let cap = render_number(max_matches, args, DEFAULT_MAX_MATCHES)?.max(1) as usize;

            let mut matches = Vec::new();
            'files: for file in super::tools::collect_matching_files(root, &glob) {
                let Ok(content) = std::fs::read_to_string(&file) else {
                    continue;
                };
                let rel = file.strip_prefix(root).unwrap_or(&file).to_path_buf();
                let mut per_file = 0usize;
                for (line_no, line) in content.lines().enumerate() {
                    if !re.is_match(line) {
                        continue;
                    }
                    matches.push(json!({
                        "file": rel.display().to_string(),
                        "line": line_no + 1,
                        "text": clip(line.trim(), 200)
                    }));
                    per_file += 1;
                    if matches.len() >= cap {
                        break 'files;
                    }
                    if per_file >= MATCHES_PER_FILE {
                        break;
                    }
                }
            }

            Ok(json!({
                "op": "filtered_search",
                "pattern": pattern,
                "match_count": matches.len(),
                "matches": matches
            }))
        }
        Step::StructuredRead { path, start, end } => {
            let path = render(path, args);
            let resolved = resolve_under_root(root, Path::new(&path))?;
            let content = std::fs::read_to_string(&resolved.absolute)
                .map_err(|e| format!("failed to read {}: {}", path, e))?;

            let start = render_number(start, args, 1)?.max(1) as usize;
            let end = render_number(end, args, start as i64 + DEFAULT_READ_SPAN - 1)?.max(1) as usize;

            let lines: Vec<&str> = content.lines().collect();
            let slice_start = (start - 1).min(lines.len());
            let slice_end = end.min(lines.len());
            let slice = if slice_start < slice_end {
                lines[slice_start..slice_end].join("\n")
            } else {
                String::new()
            };

            Ok(json!({
                "op": "structured_read",
                "path": path,
                "start": start,
                "end": slice_end,
                "total_lines": lines.len(),
                "content": clip(&slice, MAX_STEP_OUTPUT_CHARS)
            }))
        }
        Step::PatternTransform {
            path,
            input,
            find,
            replace,
        } => {
            let source = match (path, input) {
                (Some(path), _) => {
                    let path = render(path, args);
                    let resolved = resolve_under_root(root, Path::new(&path))?;
                    std::fs::read_to_string(&resolved.absolute)
                        .map_err(|e| format!("failed to read {}: {}", path, e))?
                }
                (None, Some(input)) => render(input, args),
                (None, None) => return Err("pattern_transform needs 'path' or 'input'".to_string()),
            };

            let find = render(find, args);
            let re = Regex::new(&find).map_err(|e| format!("invalid pattern: {}", e))?;
            let replace = render(replace, args);
            let replacements = re.find_iter(&source).count();
            let transformed = re.replace_all(&source, replace.as_str()).into_owned();

            Ok(json!({
                "op": "pattern_transform",
                "replacements": replacements,
                "transformed": clip(&transformed, MAX_STEP_OUTPUT_CHARS)
            }))
        }
        Step::CountMatches { pattern, glob } => {
            let pattern = render(pattern, args);
            let re = Regex::new(&pattern).map_err(|e| format!("invalid pattern: {}", e))?;
            let glob = glob
                .as_deref()
                .map(|g| render(g, args))
                .unwrap_or_else(|| "*.*".to_string());

            let mut total = 0usize;
            let mut files_with_matches = 0usize;
            for file in super::tools::collect_matching_files(root, &glob) {
                let Ok(content) = std::fs::read_to_string(&file) else {
                    continue;
                };
                let count = re.find_iter(&content).count();
                if count > 0 {
                    files_with_matches += 1;
                    total += count;
                }
            }

            Ok(json!({
                "op": "count_matches",
                "pattern": pattern,
                "total_matches": total,
                "files_with_matches": files_with_matches
            }))
        }
    }
}
