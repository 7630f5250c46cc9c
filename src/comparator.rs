//! A temporary dual-slot overlay over the [`Pager`] for diff/merge tasks.
//!
//! The Comparator is stateless: it operates directly on a borrowed `Pager`
//! for the duration of a call and leaves no residue between calls. It is
//! the one component explicitly allowed to violate the L1 budget invariant
//! (`loadPair`, temporarily) and the pinned-immortality invariant does not
//! apply to its evictions either, since both are scoped, short-lived, and
//! return L1 to its normal invariant by design.

use crate::page::file_page_id;
use crate::pager::Pager;

pub struct Comparator;

impl Comparator {
    /// Evicts all non-`SYS:` pages from L1, then forcibly inserts both
    /// pages at priority 10, even if their combined cost exceeds capacity.
    /// Returns `false` only if `cost(A) + cost(B) > capacity`.
    pub fn load_pair(
        pager: &mut Pager,
        id_a: &str,
        content_a: &str,
        id_b: &str,
        content_b: &str,
    ) -> bool {
        let cost_a = pager.comparator_cost(content_a);
        let cost_b = pager.comparator_cost(content_b);
        if cost_a + cost_b > pager.capacity_tokens() {
            return false;
        }

        pager.comparator_evict_non_sys_from_l1();

        let page_a = file_page_id(id_a);
        let page_b = file_page_id(id_b);
        pager.comparator_force_insert(&page_a, content_a, 10);
        pager.comparator_force_insert(&page_b, content_b, 10);
        true
    }

    /// Evicts every `FILE:` page from L1 unconditionally.
    pub fn purge_pair(pager: &mut Pager) {
        pager.comparator_evict_files_from_l1();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::Tier;
    use crate::tokenizer::HeuristicTokenizer;
    use std::sync::Arc;

    fn pager(capacity: usize) -> Pager {
        Pager::new(capacity, Arc::new(HeuristicTokenizer))
    }

    #[test]
    fn comparator_purge_scenario() {
        // capacity 1000, SYS:mission pinned (10 tok),
        // FILE:old.py (50 tok), then load a 300/300 token pair.
        let mut p = pager(1000);
        p.pin("SYS:mission", "m".repeat(6));
        p.request_access("FILE:old.py", Some("o".repeat(30)), 5);

        let a = "a".repeat(171); // ~300 tokens via heuristic+margin
        let b = "b".repeat(171);
        assert!(Comparator::load_pair(&mut p, "a.py", &a, "b.py", &b));

        assert_eq!(p.tier_of("SYS:mission"), Some(Tier::L1));
        assert_eq!(p.tier_of("FILE:a.py"), Some(Tier::L1));
        assert_eq!(p.tier_of("FILE:b.py"), Some(Tier::L1));
        assert_eq!(p.tier_of("FILE:old.py"), Some(Tier::L2));

        Comparator::purge_pair(&mut p);
        assert_eq!(p.tier_of("SYS:mission"), Some(Tier::L1));
        assert_eq!(p.tier_of("FILE:a.py"), Some(Tier::L2));
        assert_eq!(p.tier_of("FILE:b.py"), Some(Tier::L2));
    }

    #[test]
    fn load_pair_refuses_when_combined_cost_exceeds_capacity() {
        let mut p = pager(10);
        assert!(!Comparator::load_pair(
            &mut p,
            "a.py",
            &"a".repeat(200),
            "b.py",
            &"b".repeat(200)
        ));
    }
}
