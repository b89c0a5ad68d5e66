//! Shared plumbing: bounded text, bounded subprocesses, and path confinement.
//!
//! Everything here exists because some tool output, command, or model-chosen
//! path is untrusted: content is clipped before it reaches the conversation,
//! commands are killed at a deadline, and candidate paths are resolved so
//! they cannot leave the directory they were given.

use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Clip a string to at most `max_chars` characters, ending in `...` when
/// anything was dropped. Cuts on character boundaries, never mid-codepoint.
pub fn clip(s: &str, max_chars: usize) -> String {
    if max_chars == 0 {
        return String::new();
    }
    if s.char_indices().nth(max_chars).is_none() {
        return s.to_string();
    }
    if max_chars <= 3 {
        return s.chars().take(max_chars).collect();
    }
    let cut = s
        .char_indices()
        .nth(max_chars - 3)
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    format!("{}...", &s[..cut])
}

/// Gate for the chattier stderr diagnostics.
pub fn debug_stderr_enabled() -> bool {
    std::env::var("MEND_DEBUG")
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(false)
}

/// What a bounded subprocess produced before it exited or was killed.
#[derive(Debug)]
pub struct ExecOutcome {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl ExecOutcome {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Run a command, killing it once `limit` elapses. Output is drained on
/// separate threads so a chatty child cannot deadlock against a full pipe.
pub fn run_with_deadline(command: &mut Command, limit: Duration) -> Result<ExecOutcome, String> {
    command.stdout(Stdio::piped()).stderr(Stdio::piped());
    let mut child = command
        .spawn()
        .map_err(|e| format!("Could not spawn command: {}", e))?;

    let out_pipe = child
        .stdout
        .take()
        .ok_or_else(|| "Could not attach to stdout".to_string())?;
    let err_pipe = child
        .stderr
        .take()
        .ok_or_else(|| "Could not attach to stderr".to_string())?;
    let out_reader = thread::spawn(move || drain(out_pipe));
    let err_reader = thread::spawn(move || drain(err_pipe));

    let started = Instant::now();
    let mut timed_out = false;
    let exit_code = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status.code(),
            Ok(None) => {}
            Err(e) => return Err(format!("Could not wait on command: {}", e)),
        }
        if started.elapsed() >= limit {
            timed_out = true;
            let _ = child.kill();
            break child.wait().ok().and_then(|status| status.code());
        }
        thread::sleep(POLL_INTERVAL);
    };

    Ok(ExecOutcome {
        exit_code,
        timed_out,
        stdout: out_reader.join().unwrap_or_default(),
        stderr: err_reader.join().unwrap_or_default(),
    })
}

fn drain(mut pipe: impl Read) -> String {
    let mut buf = Vec::new();
    let _ = pipe.read_to_end(&mut buf);
    String::from_utf8_lossy(&buf).into_owned()
}

/// A candidate path pinned under a root directory.
#[derive(Debug)]
pub struct RootedPath {
    pub absolute: PathBuf,
    pub relative: PathBuf,
}

/// Resolve a relative candidate under `root`, allowing files that do not
/// exist yet. Absolute paths and `..` segments are rejected outright, and
/// the nearest existing ancestor is canonicalized so a symlink inside the
/// tree cannot lead outside it.
pub fn resolve_under_root(root: &Path, candidate: &Path) -> Result<RootedPath, String> {
    let mut relative = PathBuf::new();
    for part in candidate.components() {
        match part {
            Component::Normal(segment) => relative.push(segment),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(format!(
                    "Parent traversal is not allowed: {}",
                    candidate.display()
                ));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(format!(
                    "Absolute paths are not allowed: {}",
                    candidate.display()
                ));
            }
        }
    }
    if relative.as_os_str().is_empty() {
        return Err("Path is empty".to_string());
    }

    let root = root
        .canonicalize()
        .map_err(|e| format!("Could not resolve root: {}", e))?;
    let absolute = root.join(&relative);

    let mut probe = absolute.clone();
    while !probe.exists() && probe.pop() {}
    if probe.exists() {
        let real = probe
            .canonicalize()
            .map_err(|e| format!("Could not resolve {}: {}", probe.display(), e))?;
        if !real.starts_with(&root) {
            return Err(format!("Path escapes the root: {}", candidate.display()));
        }
    }

    Ok(RootedPath { absolute, relative })
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Stable 64-bit FNV-1a digest of a text, as lowercase hex. Used to
/// content-address cached tool sources.
pub fn content_hash(text: &str) -> String {
    let digest = text.bytes().fold(FNV_OFFSET, |acc, byte| {
        (acc ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
    });
    format!("{:016x}", digest)
}

#[cfg(test)]
mod tests {
    use super::{clip, content_hash, resolve_under_root, run_with_deadline};
    use std::path::PathBuf;
    use std::process::Command;
    use std::time::Duration;

    #[test]
    fn clip_is_unicode_safe() {
        assert_eq!(clip("ééééé", 4), "é...");
        assert_eq!(clip("こんにちは", 3), "こんに");
        assert_eq!(clip("short", 10), "short");
        assert_eq!(clip("anything", 0), "");
    }

    #[test]
    fn content_hash_is_stable_and_discriminating() {
        assert_eq!(content_hash("hello"), content_hash("hello"));
        assert_ne!(content_hash("hello"), content_hash("world"));
        assert_eq!(content_hash("hello").len(), 16);
    }

    #[test]
    fn resolve_under_root_accepts_missing_files() {
        let root = tempfile::tempdir().unwrap();
        let candidate = PathBuf::from("new_dir/new_file.rs");
        let resolved = resolve_under_root(root.path(), &candidate).unwrap();
        assert_eq!(resolved.relative, candidate);
        assert!(resolved.absolute.ends_with("new_dir/new_file.rs"));
    }

    #[test]
    fn resolve_under_root_rejects_traversal_and_absolute_paths() {
        let root = tempfile::tempdir().unwrap();
        let err = resolve_under_root(root.path(), &PathBuf::from("../escape")).unwrap_err();
        assert!(err.contains("Parent traversal"));
        let err = resolve_under_root(root.path(), &PathBuf::from("/etc/passwd")).unwrap_err();
        assert!(err.contains("Absolute paths"));
    }

    #[test]
    fn run_with_deadline_captures_output() {
        let mut cmd = Command::new("echo");
        cmd.arg("hello");
        let outcome = run_with_deadline(&mut cmd, Duration::from_secs(5)).unwrap();
        assert!(outcome.success());
        assert!(outcome.stdout.contains("hello"));
    }

    #[test]
    fn run_with_deadline_reports_nonzero_exit() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "exit 3"]);
        let outcome = run_with_deadline(&mut cmd, Duration::from_secs(5)).unwrap();
        assert!(!outcome.success());
        assert_eq!(outcome.exit_code, Some(3));
    }
}
