//! The [`Page`] type and its tier and namespace conventions.

use serde::{Deserialize, Serialize};

/// Which tier a page currently lives in. A page id exists in at most one
/// tier at any observable moment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tier {
    L1,
    L2,
    L3,
}

/// A named unit of cached text owned exclusively by the [`crate::pager::Pager`].
/// Sessions only ever hold the `id` as a handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    pub id: String,
    pub content: String,
    pub token_cost: usize,
    pub last_accessed_turn: u64,
    pub priority: u8,
    pub pinned: bool,
    pub ttl: u32,
}

impl Page {
    pub fn new(id: impl Into<String>, content: impl Into<String>, token_cost: usize) -> Self {
        Page {
            id: id.into(),
            content: content.into(),
            token_cost,
            last_accessed_turn: 0,
            priority: 5,
            pinned: false,
            ttl: DEFAULT_TTL,
        }
    }

    /// Eviction candidate score: each priority rank is worth ten turns of
    /// recency. Lower scores are evicted first.
    pub fn eviction_score(&self) -> i64 {
        self.priority as i64 * 10 + self.last_accessed_turn as i64
    }

    pub fn is_system(&self) -> bool {
        self.id.starts_with("SYS:")
    }

    pub fn is_file(&self) -> bool {
        self.id.starts_with("FILE:")
    }

    pub fn is_artifact(&self) -> bool {
        self.id.starts_with("ARTIFACT:")
    }

    /// The display id stripped of its namespace prefix, for use in rendered
    /// headers (`=== <display-id> ===`).
    pub fn display_id(&self) -> &str {
        self.id
            .split_once(':')
            .map(|(_, rest)| rest)
            .unwrap_or(&self.id)
    }
}

/// Turns a page survives unaccessed before `tick()` demotes it to L2.
pub const DEFAULT_TTL: u32 = 8;

pub fn file_page_id(path: &str) -> String {
    format!("FILE:{path}")
}

pub fn sys_page_id(name: &str) -> String {
    format!("SYS:{name}")
}

pub fn artifact_page_id(identifier: &str) -> String {
    format!("ARTIFACT:{identifier}")
}
