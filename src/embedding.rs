//! Text embedding for the Sidecar's vector index and the Gatekeeper's
//! Layer 4 relevance scoring.
//!
//! Embedding is kept independent of the model driver: [`Embedder`] is a
//! narrow, synchronous capability separate from [`crate::drivers::LlmDriver`].
//! [`crate::drivers::DriverEmbedder`] bridges a driver's `embed` into this
//! trait for callers who want remote-model embeddings instead.

use std::sync::Mutex;

use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};

pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Vec<f32>;
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// `bge-small-en-v1.5` via `fastembed`, a small general-purpose sentence
/// embedding model suited to local, non-networked relevance scoring.
pub struct FastEmbedEmbedder {
    model: Mutex<TextEmbedding>,
}

impl FastEmbedEmbedder {
    pub fn try_new() -> Result<Self, fastembed::Error> {
        let model = TextEmbedding::try_new(
            InitOptions::new(EmbeddingModel::BGESmallENV15).with_show_download_progress(false),
        )?;
        Ok(FastEmbedEmbedder {
            model: Mutex::new(model),
        })
    }
}

impl Embedder for FastEmbedEmbedder {
    fn embed(&self, text: &str) -> Vec<f32> {
        let mut model = self.model.lock().expect("embedding model mutex poisoned");
        model
            .embed(vec![text.to_string()], None)
            .ok()
            .and_then(|mut v| v.pop())
            .unwrap_or_default()
    }
}

/// Deterministic, dependency-free embedder used by the bundled `local`
/// driver and by tests that must not touch the network or download a
/// model. Hashes overlapping character trigrams into a fixed-width vector;
/// cosine similarity between two such vectors approximates lexical overlap,
/// which is good enough for the bootstrap-pass and fast-path branches that
/// dominate Layer 4 in practice.
#[derive(Debug, Default, Clone, Copy)]
pub struct HashEmbedder;

const HASH_DIMS: usize = 256;

impl Embedder for HashEmbedder {
    fn embed(&self, text: &str) -> Vec<f32> {
        let normalized = text.to_lowercase();
        let chars: Vec<char> = normalized.chars().collect();
        let mut vec = vec![0f32; HASH_DIMS];
        if chars.len() < 3 {
            if !chars.is_empty() {
                let idx = simple_hash(&normalized) % HASH_DIMS;
                vec[idx] += 1.0;
            }
            return vec;
        }
        for window in chars.windows(3) {
            let trigram: String = window.iter().collect();
            let idx = simple_hash(&trigram) % HASH_DIMS;
            vec[idx] += 1.0;
        }
        vec
    }
}

fn simple_hash(s: &str) -> usize {
    let mut hash: u64 = 14695981039346656037;
    for b in s.bytes() {
        hash ^= b as u64;
        hash = hash.wrapping_mul(1099511628211);
    }
    hash as usize
}
