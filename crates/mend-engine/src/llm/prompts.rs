//! Prompt construction for the repair session.

use mend_core::seed::ComponentType;

/// Injected once the iteration budget for exploration is spent: stop calling
/// tools and emit the final document.
pub const SYNTHESIS_DIRECTIVE: &str = "SYNTHESIS REQUIRED: You have explored enough. Provide \
your final JSON analysis and changes now. Focus on the most critical 2-3 changes needed. \
Return the complete JSON response - no more exploration.";

/// One corrective re-prompt after an unparseable terminal response.
pub const MALFORMED_OUTPUT_REPROMPT: &str = "Your previous response was not valid JSON. Return \
only a JSON object matching the required schema: {\"analysis\": string, \"changes\": \
[{\"action\": \"modify\"|\"create\", \"file\": string, \"search\": string, \"replace\": string, \
\"reasoning\": string, \"confidence\": \"high\"|\"medium\"|\"low\"}]}. No markdown fences, no \
surrounding prose.";

/// System message for the propose step, flavored by the detected component.
pub fn system_prompt(component: ComponentType) -> String {
    let expertise = match component {
        ComponentType::Frontend => "TypeScript/React frontend applications",
        ComponentType::Backend | ComponentType::Unknown => {
            "TypeScript/Node.js backend applications"
        }
    };
    let path_example = match component {
        ComponentType::Frontend => "'ui/src/file.tsx' not 'src/file.tsx'",
        ComponentType::Backend | ComponentType::Unknown => {
            "'backend/src/file.ts' not 'src/file.ts'"
        }
    };

    format!(
        "You are a code implementation assistant specialized in {expertise}. Analyze the \
failure, explore the repository with the available tools, and propose code changes. Always \
return valid JSON with a changes array, even if empty.

File paths must be from the repository root (e.g., {path_example}).

TOOL CALL FORMAT:
- Tool arguments must be a single valid JSON object: {{\"parameter\": \"value\"}}
- No extra text inside tool calls; malformed arguments are rejected

IMPLEMENTATION PATTERNS:
- To modify an existing file: action=\"modify\" with an exact search pattern taken from the \
file content, with enough surrounding context to match exactly once
- To create a new file: action=\"create\" with the full file content in the replace field

Synthesize findings early rather than exploring endlessly."
    )
}

/// The seeded first user message: failure text, component hint, file
/// excerpts, and a short map of the toolkit.
pub fn initial_prompt(error_log: &str, component: ComponentType, seeded_context: &str) -> String {
    format!(
        "Analyze the following build/test failure and propose fixes.

ERROR LOG:
{error_log}

COMPONENT TYPE: {component}

CONTEXT SEED (short excerpts from files referenced in errors):
{seeded_context}

TOOLKIT:
- Exploration: list_directory, read_file, search_files, find_imports, find_usage, \
semantic_search
- Dynamic tools: create_dynamic_tool compiles a declarative program (filtered_search, \
structured_read, pattern_transform, count_matches steps) into a reusable tool; \
call_dynamic_tool runs it; get_dynamic_tools_info lists what you have built
- Sandboxes: create_sandbox / run_in_sandbox / inspect_sandbox / cleanup_sandbox for \
validating risky changes in isolation before proposing them

WORKFLOW:
1. Explore the files referenced in the errors.
2. Read enough surrounding code to understand the failure.
3. Build a dynamic tool when repeated analysis would be cheaper as one primitive.
4. Use a sandbox to verify a candidate fix when the change is risky.
5. Finish with the JSON proposal document - analysis plus concrete search/replace changes.",
        error_log = error_log,
        component = component.label(),
        seeded_context = seeded_context,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_prompt_mentions_component_paths() {
        let frontend = system_prompt(ComponentType::Frontend);
        assert!(frontend.contains("ui/src/file.tsx"));
        let backend = system_prompt(ComponentType::Backend);
        assert!(backend.contains("backend/src/file.ts"));
    }

    #[test]
    fn initial_prompt_embeds_log_and_seed() {
        let prompt = initial_prompt("TS2304 in backend/src/foo.ts", ComponentType::Backend, "FILE: backend/src/foo.ts");
        assert!(prompt.contains("TS2304"));
        assert!(prompt.contains("COMPONENT TYPE: backend"));
        assert!(prompt.contains("FILE: backend/src/foo.ts"));
    }
}
