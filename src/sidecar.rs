//! Thread-safe, disk-persistent key→value store with a vector index for
//! fuzzy recall, shared across sessions.
//!
//! Construction is always explicit (`Sidecar::open`); there is no lazily
//! initialized static instance anywhere in this crate. Callers who want
//! several `Session`s to share one Sidecar simply clone the same
//! `Arc<Sidecar>` into each.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::embedding::{cosine_similarity, Embedder, HashEmbedder};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub value: String,
    #[serde(rename = "type")]
    pub entry_type: String,
    pub metadata: Option<serde_json::Value>,
    pub ingested_at: chrono::DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SemanticHit {
    pub key: String,
    pub content: String,
    pub score: f32,
}

struct VectorEntry {
    key: String,
    embedding: Vec<f32>,
}

/// Everything protected by the single writer mutex: the in-memory
/// knowledge map (authoritative for the running process even if a disk
/// write fails) and the flat vector collection.
struct Inner {
    knowledge: HashMap<String, KnowledgeEntry>,
    vectors: Vec<VectorEntry>,
}

pub struct Sidecar {
    cache_dir: PathBuf,
    inner: Mutex<Inner>,
    embedder: Arc<dyn Embedder>,
}

const BRAIN_FILE: &str = "brain.json";

impl Sidecar {
    /// Opens (or creates) the on-disk store at `cache_dir`. Rebuilds the
    /// vector index from `brain.json` on cold start.
    pub fn open(cache_dir: impl AsRef<Path>) -> std::io::Result<Arc<Self>> {
        Self::open_with_embedder(cache_dir, Arc::new(HashEmbedder))
    }

    pub fn open_with_embedder(
        cache_dir: impl AsRef<Path>,
        embedder: Arc<dyn Embedder>,
    ) -> std::io::Result<Arc<Self>> {
        let cache_dir = cache_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&cache_dir)?;

        let knowledge = Self::load_from_disk(&cache_dir).unwrap_or_default();
        let mut vectors = Vec::with_capacity(knowledge.len());
        for (key, entry) in &knowledge {
            vectors.push(VectorEntry {
                key: key.clone(),
                embedding: embedder.embed(&entry.value),
            });
        }

        Ok(Arc::new(Sidecar {
            cache_dir,
            inner: Mutex::new(Inner { knowledge, vectors }),
            embedder,
        }))
    }

    fn load_from_disk(cache_dir: &Path) -> Option<HashMap<String, KnowledgeEntry>> {
        let path = cache_dir.join(BRAIN_FILE);
        let raw = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&raw).ok()
    }

    fn persist(&self, knowledge: &HashMap<String, KnowledgeEntry>) {
        let path = self.cache_dir.join(BRAIN_FILE);
        match serde_json::to_string_pretty(knowledge) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&path, json) {
                    warn!(error = %e, path = %path.display(), "sidecar persistence failed; in-memory copy remains authoritative");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize sidecar knowledge"),
        }
    }

    pub fn ingest(
        &self,
        key: &str,
        value: &str,
        entry_type: &str,
        metadata: Option<serde_json::Value>,
    ) {
        let embedding = self.embedder.embed(value);
        let mut inner = self.inner.lock();
        inner.knowledge.insert(
            key.to_string(),
            KnowledgeEntry {
                value: value.to_string(),
                entry_type: entry_type.to_string(),
                metadata,
                ingested_at: Utc::now(),
            },
        );
        inner.vectors.retain(|v| v.key != key);
        inner.vectors.push(VectorEntry {
            key: key.to_string(),
            embedding,
        });
        self.persist(&inner.knowledge);
    }

    pub fn query_semantic(&self, query: &str, k: usize) -> Vec<SemanticHit> {
        let query_embedding = self.embedder.embed(query);
        let inner = self.inner.lock();
        let mut scored: Vec<SemanticHit> = inner
            .vectors
            .iter()
            .filter_map(|v| {
                inner.knowledge.get(&v.key).map(|entry| SemanticHit {
                    key: v.key.clone(),
                    content: entry.value.clone(),
                    score: cosine_similarity(&query_embedding, &v.embedding),
                })
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        scored
    }

    pub fn query_exact(&self, key: &str) -> Option<String> {
        self.inner.lock().knowledge.get(key).map(|e| e.value.clone())
    }

    pub fn delete(&self, key: &str) {
        let mut inner = self.inner.lock();
        inner.knowledge.remove(key);
        inner.vectors.retain(|v| v.key != key);
        self.persist(&inner.knowledge);
    }

    pub fn all(&self) -> HashMap<String, String> {
        self.inner
            .lock()
            .knowledge
            .iter()
            .map(|(k, v)| (k.clone(), v.value.clone()))
            .collect()
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.knowledge.clear();
        inner.vectors.clear();
        self.persist(&inner.knowledge);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn ingest_then_query_exact_round_trips() {
        let dir = TempDir::new().unwrap();
        let sidecar = Sidecar::open(dir.path()).unwrap();
        sidecar.ingest("STATUS", "ONLINE", "text", None);
        assert_eq!(sidecar.query_exact("STATUS"), Some("ONLINE".to_string()));
    }

    #[test]
    fn sidecar_handoff_between_two_sessions() {
        // Session A writes, Session B picks it up before its first turn.
        let dir = TempDir::new().unwrap();
        let sidecar_a = Sidecar::open(dir.path()).unwrap();
        sidecar_a.ingest("STATUS", "ONLINE", "text", None);

        let sidecar_b = Sidecar::open(dir.path()).unwrap();
        assert_eq!(sidecar_b.query_exact("STATUS"), Some("ONLINE".to_string()));
    }

    #[test]
    fn query_semantic_ranks_closer_match_first() {
        let dir = TempDir::new().unwrap();
        let sidecar = Sidecar::open(dir.path()).unwrap();
        sidecar.ingest("A", "the quick brown fox jumps", "text", None);
        sidecar.ingest("B", "totally unrelated banking regulations", "text", None);
        let hits = sidecar.query_semantic("quick brown fox", 2);
        assert_eq!(hits.first().map(|h| h.key.as_str()), Some("A"));
    }

    #[test]
    fn reset_clears_knowledge_and_vectors() {
        let dir = TempDir::new().unwrap();
        let sidecar = Sidecar::open(dir.path()).unwrap();
        sidecar.ingest("A", "value", "text", None);
        sidecar.reset();
        assert!(sidecar.all().is_empty());
    }
}
