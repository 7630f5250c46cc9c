//! Durable, symbolic facts produced by an agent turn.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// 1 MB payload cap on artifact summaries and tool-generated content; also
/// enforced by `write_file`/`edit_file`.
pub const MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

static IDENTIFIER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.-]{1,64}$").unwrap());

pub fn is_valid_identifier(identifier: &str) -> bool {
    IDENTIFIER_RE.is_match(identifier)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    CodeFile,
    Config,
    SearchResult,
    ErrorLog,
    TextContent,
    Result,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    Staged,
    Committed,
    NeedsReview,
    VerifiedInvariant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub identifier: String,
    #[serde(rename = "type")]
    pub artifact_type: ArtifactType,
    pub summary: String,
    pub status: ArtifactStatus,
    pub pinned: bool,
}

impl Artifact {
    pub fn new(identifier: impl Into<String>, summary: impl Into<String>) -> Self {
        Artifact {
            identifier: identifier.into(),
            artifact_type: ArtifactType::TextContent,
            summary: summary.into(),
            status: ArtifactStatus::Staged,
            pinned: false,
        }
    }

    /// True when this artifact is a meta/bookkeeping artifact (e.g. a
    /// computed `TOTAL`) rather than a domain artifact collected toward a
    /// mission's required count, per the Policy Engine's "N non-meta
    /// artifacts" condition.
    pub fn is_meta(&self) -> bool {
        matches!(
            self.identifier.as_str(),
            "TOTAL" | "RESOLVED_CODE" | "VERIFICATION"
        ) || self.identifier.ends_with("_COMPLETE")
            || self.identifier.ends_with("_VIOLATION")
    }
}
