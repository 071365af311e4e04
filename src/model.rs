use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A stored blob: the relational record of one object-store upload. The row
/// and the object are committed together; a `Blob` never references a key
/// that was not fully uploaded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Blob {
    pub id: String,
    pub content_type: String,
    pub filename: String,
    pub url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Blob {
    pub fn new(filename: &str, content_type: &str, url: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            content_type: content_type.to_string(),
            filename: filename.to_string(),
            url: url.to_string(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Terminal state of one migration-tool invocation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Success,
    Failure,
    Timeout,
}

impl MigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStatus::Success => "success",
            MigrationStatus::Failure => "failure",
            MigrationStatus::Timeout => "timeout",
        }
    }
}

/// Point-in-time record of one migration run. The caller always gets the
/// complete captured output, never just a boolean.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationRun {
    pub command: String,
    pub flags: Vec<String>,
    pub status: MigrationStatus,
    pub exit_code: Option<i32>,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

/// Split a captured stream into ordered lines, dropping a trailing empty line
/// left by a final newline.
pub fn split_lines(raw: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(raw);
    let mut lines: Vec<String> = text.lines().map(|l| l.to_string()).collect();
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines
}
