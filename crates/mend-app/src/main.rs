//! Mend - an AI repair agent for build and test failures.
//!
//! Reads an error log, drives a tool-calling conversation with the inference
//! service, and prints a single structured proposal document on stdout.
//! Everything diagnostic goes to stderr: stdout stays parseable as pure JSON
//! even when the session fails.

use anyhow::Result;
use clap::Parser;
use mend_adapters::cache::ToolCacheStore;
use mend_adapters::config::Config;
use mend_core::proposal::StructuredProposal;
use mend_core::seed;
use mend_engine::llm::prompts;
use mend_engine::{ConversationSession, HttpBackend, SandboxManager, SessionConfig, ToolRegistry};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "mend",
    about = "Propose code fixes for build/test failures",
    long_about = "Analyzes an error log by exploring the repository with \
                  AI-driven tools and emits a JSON change proposal on stdout.",
    version
)]
struct Args {
    /// Path to the error/build log to analyze
    log_file: PathBuf,

    /// Path to the repository (defaults to current directory)
    #[arg(default_value = ".")]
    path: PathBuf,

    /// Maximum conversation iterations before giving up
    #[arg(long, default_value_t = 100)]
    max_iterations: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let document = propose(&args).await;
    // The one and only stdout write: a well-formed proposal document,
    // whatever happened above.
    println!("{}", document.to_json_pretty());
    Ok(())
}

async fn propose(args: &Args) -> StructuredProposal {
    eprintln!("  Mend starting error analysis...");

    let config = Config::load();
    let Some(api_key) = config.get_api_key() else {
        eprintln!("  ! MEND_API_KEY / OPENAI_API_KEY is not set - skipping analysis");
        return StructuredProposal::failure("No API key");
    };

    let repo_root = match args.path.canonicalize() {
        Ok(root) => root,
        Err(e) => {
            eprintln!("  ! Cannot resolve repository root: {}", e);
            return StructuredProposal::failure(format!(
                "Repository root '{}' is not accessible: {}",
                args.path.display(),
                e
            ));
        }
    };

    let error_log = match seed::read_error_log(&args.log_file) {
        Ok(log) if !log.trim().is_empty() => log,
        Ok(_) => {
            eprintln!("  ! Error log is empty");
            return StructuredProposal::failure("Error log is empty");
        }
        Err(e) => {
            eprintln!("  ! {}", e);
            return StructuredProposal::failure(format!("Could not read error log: {}", e));
        }
    };

    let component = seed::detect_component_type(&error_log);
    eprintln!("  Detected component type: {}", component.label());

    eprintln!("  Seeding initial context from error files...");
    let seeded_context = seed::seed_context_from_errors(&repo_root, &error_log);

    let backend = match HttpBackend::new(config.api_url(), api_key) {
        Ok(backend) => backend,
        Err(e) => {
            eprintln!("  ! {}", e);
            return StructuredProposal::failure(format!("Could not initialize HTTP client: {}", e));
        }
    };

    let cache = ToolCacheStore::new(&repo_root);
    let mut registry = ToolRegistry::new(&repo_root, cache, config.semantic_search_disabled());
    let mut sandboxes = SandboxManager::new(&repo_root);

    let system = prompts::system_prompt(component);
    let seed_text = prompts::initial_prompt(&error_log, component, &seeded_context);

    let mut session = ConversationSession::new(config.model(), SessionConfig::default());
    let result = session
        .run(
            &backend,
            &mut registry,
            &mut sandboxes,
            &system,
            &seed_text,
            args.max_iterations,
        )
        .await;

    if let Some(usage) = session.usage() {
        eprintln!(
            "  Token usage: {} prompt / {} completion",
            usage.prompt_tokens, usage.completion_tokens
        );
    }

    match result {
        Ok(proposal) => {
            eprintln!(
                "  Analysis complete: {} proposed changes",
                proposal.changes.len()
            );
            proposal
        }
        Err(reason) => {
            eprintln!("  ! Session failed: {}", reason);
            StructuredProposal::failure(reason.analysis())
        }
    }
}
