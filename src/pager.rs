//! The hierarchical memory manager: L1 (active, token-bounded), L2
//! (unbounded staging) and L3 (vector-indexed archive, via the [`Sidecar`]).
//!
//! The Pager is owned exclusively by a single [`crate::session::Session`]
//!, so its methods take `&mut self` rather than going through
//! an internal lock — the concurrency model is single-threaded cooperative
//! per session.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::page::{file_page_id, Page, Tier};
use crate::sidecar::Sidecar;
use crate::tokenizer::Tokenizer;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PagerStats {
    pub l1_used: usize,
    pub l1_capacity: usize,
    pub l1_count: usize,
    pub l2_count: usize,
    pub l3_count: usize,
}

pub struct Pager {
    capacity_tokens: usize,
    l1: HashMap<String, Page>,
    l2: HashMap<String, Page>,
    l3_ids: HashMap<String, ()>,
    current_turn: u64,
    sidecar: Option<Arc<Sidecar>>,
    tokenizer: Arc<dyn Tokenizer>,
}

impl Pager {
    pub fn new(capacity_tokens: usize, tokenizer: Arc<dyn Tokenizer>) -> Self {
        Pager {
            capacity_tokens,
            l1: HashMap::new(),
            l2: HashMap::new(),
            l3_ids: HashMap::new(),
            current_turn: 0,
            sidecar: None,
            tokenizer,
        }
    }

    pub fn with_sidecar(mut self, sidecar: Arc<Sidecar>) -> Self {
        self.sidecar = Some(sidecar);
        self
    }

    pub fn current_turn(&self) -> u64 {
        self.current_turn
    }

    pub fn capacity_tokens(&self) -> usize {
        self.capacity_tokens
    }

    /// Only applies a new capacity if it differs from the current one by
    /// more than the 10-token damping threshold,
    /// preventing oscillation near the boundary.
    pub fn set_capacity_tokens(&mut self, proposed: usize) {
        const DAMPING_THRESHOLD: i64 = 10;
        let delta = proposed as i64 - self.capacity_tokens as i64;
        if delta.abs() > DAMPING_THRESHOLD {
            debug!(from = self.capacity_tokens, to = proposed, "resizing L1 capacity");
            self.capacity_tokens = proposed;
        }
    }

    pub fn l1_total_tokens(&self) -> usize {
        self.l1.values().map(|p| p.token_cost).sum()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.l1.contains_key(id) || self.l2.contains_key(id) || self.l3_ids.contains_key(id)
    }

    pub fn tier_of(&self, id: &str) -> Option<Tier> {
        if self.l1.contains_key(id) {
            Some(Tier::L1)
        } else if self.l2.contains_key(id) {
            Some(Tier::L2)
        } else if self.l3_ids.contains_key(id) {
            Some(Tier::L3)
        } else {
            None
        }
    }

    pub fn get(&self, id: &str) -> Option<&Page> {
        self.l1.get(id).or_else(|| self.l2.get(id))
    }

    pub fn l1_ids(&self) -> Vec<String> {
        self.l1.keys().cloned().collect()
    }

    /// `(display id, pinned)` pairs for every L1 page, for the Proposer's
    /// prompt-construction input.
    pub fn l1_summary(&self) -> Vec<(String, bool)> {
        let mut pages: Vec<&Page> = self.l1.values().collect();
        pages.sort_by(|a, b| a.id.cmp(&b.id));
        pages.iter().map(|p| (p.display_id().to_string(), p.pinned)).collect()
    }

    pub fn l2_ids(&self) -> Vec<String> {
        self.l2.keys().cloned().collect()
    }

    /// Load or overwrite a page that cannot be evicted.
    pub fn pin(&mut self, id: impl Into<String>, content: impl Into<String>) {
        let id = id.into();
        let content = content.into();
        let token_cost = self.tokenizer.count_tokens(&content);
        self.l2.remove(&id);
        self.l3_ids.remove(&id);
        let mut page = self.l1.remove(&id).unwrap_or_else(|| Page::new(&id, "", 0));
        page.content = content;
        page.token_cost = token_cost;
        page.pinned = true;
        page.last_accessed_turn = self.current_turn;
        self.l1.insert(id, page);
    }

    /// Hit path. Returns `false` only if the page cannot be admitted to L1
    /// even after evicting every non-pinned page.
    pub fn request_access(
        &mut self,
        id: &str,
        content: Option<String>,
        priority: u8,
    ) -> bool {
        if let Some(mut page) = self.l1.remove(id) {
            page.last_accessed_turn = self.current_turn;
            page.priority = page.priority.max(priority);
            if let Some(c) = content {
                page.token_cost = self.tokenizer.count_tokens(&c);
                page.content = c;
            }
            self.l1.insert(id.to_string(), page);
            return true;
        }

        let from_l2 = self.l2.contains_key(id);
        let mut page = if let Some(mut p) = self.l2.remove(id) {
            if let Some(c) = content {
                p.token_cost = self.tokenizer.count_tokens(&c);
                p.content = c;
            }
            p
        } else if let Some(c) = content {
            let token_cost = self.tokenizer.count_tokens(&c);
            Page::new(id, c, token_cost)
        } else {
            return false;
        };

        page.priority = page.priority.max(priority);
        page.last_accessed_turn = self.current_turn;

        if !self.make_room(page.token_cost) {
            // Admission failed: if the page came from L2, put it back there
            // instead of dropping it.
            if from_l2 {
                self.l2.insert(id.to_string(), page);
            }
            return false;
        }
        self.l3_ids.remove(id);
        self.l1.insert(id.to_string(), page);
        true
    }

    /// Place into L2 without promoting. No-op if already in L1; overwrites
    /// if already in L2.
    pub fn prefetch(&mut self, id: &str, content: impl Into<String>, priority: u8) {
        if self.l1.contains_key(id) {
            return;
        }
        let content = content.into();
        let token_cost = self.tokenizer.count_tokens(&content);
        let mut page = Page::new(id, content, token_cost);
        page.priority = priority;
        page.last_accessed_turn = self.current_turn;
        self.l3_ids.remove(id);
        self.l2.insert(id.to_string(), page);
    }

    /// Explicit demotion. Never moves a pinned page.
    pub fn evict_to_l2(&mut self, id: &str) {
        if let Some(page) = self.l1.get(id) {
            if page.pinned {
                warn!(id, "refusing to demote pinned page");
                return;
            }
        } else {
            return;
        }
        if let Some(page) = self.l1.remove(id) {
            self.l2.insert(id.to_string(), page);
        }
    }

    /// Hand the page to the Sidecar's vector index and remove it from
    /// L1/L2. No-op if the Sidecar is absent.
    pub fn archive_to_l3(&mut self, id: &str) {
        let Some(sidecar) = self.sidecar.clone() else {
            return;
        };
        let page = self.l1.remove(id).or_else(|| self.l2.remove(id));
        if let Some(page) = page {
            sidecar.ingest(id, &page.content, "archived_page", None);
            self.l3_ids.insert(id.to_string(), ());
        }
    }

    /// Semantic search over the Sidecar's vector index; matches are
    /// rehydrated into L2 (never directly L1, to avoid thrash).
    pub fn recall_from_l3(&mut self, query: &str, k: usize) -> Vec<String> {
        let Some(sidecar) = self.sidecar.clone() else {
            return Vec::new();
        };
        let hits = sidecar.query_semantic(query, k);
        let mut ids = Vec::with_capacity(hits.len());
        for hit in hits {
            self.prefetch(&hit.key, hit.content, 3);
            ids.push(hit.key);
        }
        ids
    }

    /// Called once per turn: increments the turn counter, decrements ttl on
    /// every non-pinned L1 page (demoting expired ones to L2), then runs
    /// capacity governance if L1 is over budget.
    pub fn tick(&mut self) {
        self.current_turn += 1;

        let expired: Vec<String> = self
            .l1
            .iter_mut()
            .filter_map(|(id, page)| {
                if page.pinned {
                    return None;
                }
                if page.ttl > 0 {
                    page.ttl -= 1;
                }
                if page.ttl == 0 {
                    Some(id.clone())
                } else {
                    None
                }
            })
            .collect();

        for id in expired {
            self.evict_to_l2(&id);
        }

        if self.l1_total_tokens() > self.capacity_tokens {
            self.make_room(0);
        }
    }

    /// Shared admission/eviction algorithm. `required` is the token cost of
    /// the page about to be inserted (0 when only restoring budget, as in
    /// `tick`). Returns `false` only if no amount of eviction can make room.
    fn make_room(&mut self, required: usize) -> bool {
        if required > self.capacity_tokens {
            return false;
        }
        while self.l1_total_tokens() + required > self.capacity_tokens {
            let victim = self
                .l1
                .iter()
                .filter(|(_, p)| !p.pinned)
                .min_by_key(|(_, p)| p.eviction_score())
                .map(|(id, _)| id.clone());

            match victim {
                Some(id) => self.evict_to_l2(&id),
                None => return false,
            }
        }
        true
    }

    /// Concatenated L1 view, pinned pages first then descending priority,
    /// with a header before each page's content.
    pub fn render(&self) -> String {
        let mut pages: Vec<&Page> = self.l1.values().collect();
        pages.sort_by(|a, b| {
            b.pinned
                .cmp(&a.pinned)
                .then(b.priority.cmp(&a.priority))
                .then(a.id.cmp(&b.id))
        });

        let mut out = String::new();
        for page in pages {
            out.push_str(&format!("=== {} ===\n", page.display_id()));
            out.push_str(&page.content);
            out.push('\n');
        }
        out
    }

    pub fn stats(&self) -> PagerStats {
        PagerStats {
            l1_used: self.l1_total_tokens(),
            l1_capacity: self.capacity_tokens,
            l1_count: self.l1.len(),
            l2_count: self.l2.len(),
            l3_count: self.l3_ids.len(),
        }
    }

    /// Remove any `FILE:*` page whose path is no longer present in the
    /// current workspace; called once per turn by the Session as physical GC.
    ///
    /// `valid_paths` must be the exact scanned display-paths `stage_context`
    /// used to build each `FILE:` id (not basenames) — a page's id is
    /// compared with its `FILE:` prefix stripped against this list verbatim.
    pub fn physical_gc(&mut self, valid_paths: &[String]) {
        let stale: Vec<String> = self
            .l1
            .keys()
            .chain(self.l2.keys())
            .filter(|id| id.starts_with("FILE:"))
            .filter(|id| {
                let path = id.trim_start_matches("FILE:");
                !valid_paths.iter().any(|p| p == path)
            })
            .cloned()
            .collect();
        for id in stale {
            debug!(id, "physical GC removing page missing from workspace");
            self.l1.remove(&id);
            self.l2.remove(&id);
        }
    }

    pub fn file_page_exists(&self, path: &str) -> bool {
        self.contains(&file_page_id(path))
    }

    /// A deep copy of every L1 page, for [`crate::snapshot`]'s
    /// `snapshot(label)` bucket.
    pub fn l1_pages(&self) -> Vec<Page> {
        self.l1.values().cloned().collect()
    }

    /// Wholesale-replaces L1 with `pages`, for `restore(label)`.
    /// Clears any L2/L3 membership for the restored ids first so tier
    /// exclusivity holds.
    pub fn restore_l1(&mut self, pages: Vec<Page>) {
        self.l1.clear();
        for page in pages {
            self.l2.remove(&page.id);
            self.l3_ids.remove(&page.id);
            self.l1.insert(page.id.clone(), page);
        }
    }

    // -- Comparator-only overlay operations; these intentionally bypass the
    // normal L1 budget and pinned-immortality invariants. Only
    // `crate::comparator::Comparator` calls these.

    pub(crate) fn comparator_evict_non_sys_from_l1(&mut self) {
        let victims: Vec<String> = self
            .l1
            .keys()
            .filter(|id| !id.starts_with("SYS:"))
            .cloned()
            .collect();
        for id in victims {
            if let Some(page) = self.l1.remove(&id) {
                self.l2.insert(id, page);
            }
        }
    }

    pub(crate) fn comparator_force_insert(&mut self, id: &str, content: &str, priority: u8) {
        self.l2.remove(id);
        let token_cost = self.tokenizer.count_tokens(content);
        let mut page = Page::new(id, content, token_cost);
        page.priority = priority;
        page.last_accessed_turn = self.current_turn;
        self.l1.insert(id.to_string(), page);
    }

    pub(crate) fn comparator_cost(&self, content: &str) -> usize {
        self.tokenizer.count_tokens(content)
    }

    pub(crate) fn comparator_evict_files_from_l1(&mut self) {
        let victims: Vec<String> = self
            .l1
            .keys()
            .filter(|id| id.starts_with("FILE:"))
            .cloned()
            .collect();
        for id in victims {
            if let Some(page) = self.l1.remove(&id) {
                self.l2.insert(id, page);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sidecar::Sidecar;
    use crate::tokenizer::HeuristicTokenizer;
    use tempfile::TempDir;

    fn pager(capacity: usize) -> Pager {
        Pager::new(capacity, Arc::new(HeuristicTokenizer))
    }

    fn pager_with_sidecar(capacity: usize) -> (Pager, TempDir) {
        let dir = TempDir::new().unwrap();
        let sidecar = Sidecar::open(dir.path()).unwrap();
        (Pager::new(capacity, Arc::new(HeuristicTokenizer)).with_sidecar(sidecar), dir)
    }

    #[test]
    fn request_access_admits_new_page() {
        let mut p = pager(1000);
        assert!(p.request_access("FILE:a.py", Some("hello".into()), 5));
        assert!(p.contains("FILE:a.py"));
        assert_eq!(p.tier_of("FILE:a.py"), Some(Tier::L1));
    }

    #[test]
    fn admission_refuses_oversized_page() {
        let mut p = pager(1);
        assert!(!p.request_access("FILE:big.py", Some("way too much text".into()), 5));
        assert!(!p.contains("FILE:big.py"));
    }

    #[test]
    fn l1_budget_invariant_holds_after_eviction() {
        let mut p = pager(5);
        p.request_access("FILE:a", Some("aa".into()), 5);
        p.request_access("FILE:b", Some("bb".into()), 5);
        p.request_access("FILE:c", Some("cc".into()), 5);
        assert!(p.l1_total_tokens() <= p.capacity_tokens());
    }

    #[test]
    fn pinned_page_survives_eviction_pressure() {
        let mut p = pager(3);
        p.pin("SYS:mission", "m");
        p.request_access("FILE:a", Some("aaaaaaaaaaaaaaaaaaaa".into()), 5);
        assert!(p.contains("SYS:mission"));
        assert_eq!(p.tier_of("SYS:mission"), Some(Tier::L1));
    }

    #[test]
    fn tick_increments_turn_exactly_once() {
        let mut p = pager(1000);
        assert_eq!(p.current_turn(), 0);
        p.tick();
        assert_eq!(p.current_turn(), 1);
        p.tick();
        assert_eq!(p.current_turn(), 2);
    }

    #[test]
    fn idempotent_stage_of_already_l1_page_is_noop() {
        let mut p = pager(1000);
        p.request_access("FILE:a", Some("content".into()), 5);
        let before = p.l1_total_tokens();
        assert!(p.request_access("FILE:a", None, 5));
        assert_eq!(p.l1_total_tokens(), before);
    }

    #[test]
    fn evict_to_l2_refuses_pinned_pages() {
        let mut p = pager(1000);
        p.pin("SYS:mission", "m");
        p.evict_to_l2("SYS:mission");
        assert_eq!(p.tier_of("SYS:mission"), Some(Tier::L1));
    }

    #[test]
    fn tier_exclusivity_holds_across_operations() {
        let mut p = pager(1000);
        p.request_access("FILE:a", Some("x".into()), 5);
        p.evict_to_l2("FILE:a");
        assert_eq!(p.tier_of("FILE:a"), Some(Tier::L2));
        assert!(!p.l1.contains_key("FILE:a"));
    }

    #[test]
    fn recall_from_l3_leaves_l3_after_rehydrating_to_l2() {
        let (mut p, _dir) = pager_with_sidecar(1000);
        p.request_access("FILE:a", Some("val_x = 42".into()), 5);
        p.archive_to_l3("FILE:a");
        assert_eq!(p.tier_of("FILE:a"), Some(Tier::L3));

        let hits = p.recall_from_l3("val_x", 5);
        assert!(hits.contains(&"FILE:a".to_string()));
        assert_eq!(p.tier_of("FILE:a"), Some(Tier::L2));
        assert!(!p.l3_ids.contains_key("FILE:a"));

        let stats = p.stats();
        assert_eq!(stats.l2_count, 1);
        assert_eq!(stats.l3_count, 0);
    }

    #[test]
    fn promotion_to_l1_clears_l3_membership() {
        let (mut p, _dir) = pager_with_sidecar(1000);
        p.request_access("FILE:a", Some("val_x = 42".into()), 5);
        p.archive_to_l3("FILE:a");
        assert_eq!(p.tier_of("FILE:a"), Some(Tier::L3));

        p.prefetch("FILE:a", "val_x = 42", 3);
        assert!(p.request_access("FILE:a", None, 5));
        assert_eq!(p.tier_of("FILE:a"), Some(Tier::L1));
        assert!(!p.l3_ids.contains_key("FILE:a"));
    }

    #[test]
    fn failed_admission_restores_page_to_l2_instead_of_dropping_it() {
        let mut p = pager(5);
        p.prefetch("FILE:big", "way too much text to ever fit", 3);
        assert_eq!(p.tier_of("FILE:big"), Some(Tier::L2));

        assert!(!p.request_access("FILE:big", None, 5));
        assert_eq!(p.tier_of("FILE:big"), Some(Tier::L2));
        assert!(p.l2.contains_key("FILE:big"));
    }
}
