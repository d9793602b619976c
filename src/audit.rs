//! Audit artifacts: per-module JSON-lines records of every model exchange.
//!
//! Each recorded entry captures the prompt, the raw response, whether it
//! came from cache, and the correction rounds spent. Artifacts exist for
//! dataset review and debugging only; writing them must never affect
//! control flow, so failures are logged and swallowed.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde_json::Value;

/// Identifies which module (and which revision of its instructions) an
/// artifact belongs to, plus free-form tags for run partitioning.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArtifactScope {
    /// Module name.
    pub module: String,
    /// Instruction version; bump when the prompt text changes so old and
    /// new artifacts do not interleave in one file.
    pub version: u32,
    /// Extra tags appended to the file name.
    pub tags: Vec<String>,
}

impl ArtifactScope {
    pub fn new(module: impl Into<String>, version: u32) -> Self {
        Self {
            module: module.into(),
            version,
            tags: Vec::new(),
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Deterministic artifact file name for this scope.
    fn file_name(&self) -> String {
        let mut name = format!("{}_v{}", sanitize(&self.module), self.version);
        for tag in &self.tags {
            name.push('_');
            name.push_str(&sanitize(tag));
        }
        name.push_str(".json");
        name
    }
}

/// Keep artifact file names portable.
fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Append-only writer of audit artifacts under one directory.
#[derive(Debug, Clone)]
pub struct AuditSink {
    dir: PathBuf,
}

impl AuditSink {
    /// Sink writing under `dir` (created on first record).
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Directory artifacts are written to.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append one JSON entry to the scope's artifact file. Non-fatal:
    /// any I/O failure is logged at warn and otherwise ignored.
    pub fn record(&self, scope: &ArtifactScope, entry: &Value) {
        if let Err(error) = self.try_record(scope, entry) {
            tracing::warn!(
                module = %scope.module,
                %error,
                "failed to write audit artifact"
            );
        }
    }

    fn try_record(&self, scope: &ArtifactScope, entry: &Value) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(scope.file_name());
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut line = entry.to_string();
        line.push('\n');
        file.write_all(line.as_bytes())
    }
}
