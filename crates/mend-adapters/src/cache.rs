//! Persistent cache for synthesized tools.
//!
//! Entries live under `.mend/tools/` keyed by `<name>-<source hash>.json`, so
//! identical source is never compiled twice, within a run or across runs.
//!
//! # Error Handling
//!
//! Cache operations are best-effort. Callers typically use
//! `let _ = store.save(...)` because a cache failure is recoverable: the tool
//! is simply compiled again next time. Loads treat unreadable entries as
//! absent.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use mend_core::util::debug_stderr_enabled;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const CACHE_DIR: &str = ".mend";
const TOOLS_DIR: &str = "tools";
const LOCK_FILE: &str = ".lock";
const LOCK_TIMEOUT_SECS: u64 = 5;
const LOCK_RETRY_MS: u64 = 50;

/// A persisted synthesized-tool entry: enough to recompile the tool on the
/// next startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedTool {
    pub name: String,
    pub source: String,
    pub description: String,
    pub hash: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ToolCacheStore {
    dir: PathBuf,
}

impl ToolCacheStore {
    pub fn new(repo_root: &Path) -> Self {
        Self {
            dir: repo_root.join(CACHE_DIR).join(TOOLS_DIR),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, name: &str, hash: &str) -> PathBuf {
        self.dir.join(format!("{}-{}.json", sanitize_name(name), hash))
    }

    /// Persist an entry, creating the cache directory on first use.
    pub fn save(&self, entry: &CachedTool) -> Result<(), String> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| format!("Failed to create tool cache directory: {}", e))?;

        let _guard = self.acquire_lock()?;
        let path = self.entry_path(&entry.name, &entry.hash);
        let content = serde_json::to_string_pretty(entry)
            .map_err(|e| format!("Failed to serialize tool entry: {}", e))?;
        fs::write(&path, content).map_err(|e| format!("Failed to write tool entry: {}", e))?;

        if debug_stderr_enabled() {
            eprintln!(
                "  Cached tool '{}' to {}",
                entry.name,
                path.file_name().and_then(|n| n.to_str()).unwrap_or("?")
            );
        }
        Ok(())
    }

    /// Look up an entry by name and source hash.
    pub fn load(&self, name: &str, hash: &str) -> Option<CachedTool> {
        let path = self.entry_path(name, hash);
        let content = fs::read_to_string(path).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Load every cached entry, skipping unreadable files.
    pub fn load_all(&self) -> Vec<CachedTool> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };

        let mut tools = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(content) = fs::read_to_string(&path) else {
                continue;
            };
            match serde_json::from_str::<CachedTool>(&content) {
                Ok(tool) => tools.push(tool),
                Err(err) => {
                    if debug_stderr_enabled() {
                        eprintln!(
                            "  Warning: skipping unreadable tool cache entry {}: {}",
                            path.display(),
                            err
                        );
                    }
                }
            }
        }
        tools.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        tools
    }

    /// Advisory exclusive lock for writers. Content-addressed entries make
    /// concurrent identical writes idempotent anyway; the lock only prevents
    /// torn reads of an entry being written.
    fn acquire_lock(&self) -> Result<LockGuard, String> {
        let lock_path = self.dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| format!("Failed to open cache lock: {}", e))?;

        let deadline = Instant::now() + Duration::from_secs(LOCK_TIMEOUT_SECS);
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(LockGuard { file }),
                Err(_) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(LOCK_RETRY_MS));
                }
                Err(e) => return Err(format!("Timed out waiting for cache lock: {}", e)),
            }
        }
    }
}

struct LockGuard {
    file: std::fs::File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
        .collect();
    if cleaned.is_empty() {
        "tool".to_string()
    } else {
        cleaned
    }
}
