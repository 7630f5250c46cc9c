//! Time-travel over session state. `snapshot(label)` deep-copies
//! `{artifacts, L1 pages}` into a labeled bucket; `restore(label)`
//! overwrites the live artifacts and L1 from that bucket, clears decision
//! history, and sets the hypothesis to `RESTORED: <label>`. Mission and
//! hard constraints are untouched by either operation.

use std::collections::HashMap;

use crate::artifact::Artifact;
use crate::error::{KernelError, Result};
use crate::page::Page;
use crate::pager::Pager;
use crate::state::FrameworkState;

#[derive(Debug, Clone)]
pub struct SnapshotBucket {
    pub artifacts: Vec<Artifact>,
    pub l1_pages: Vec<Page>,
}

/// In-memory table of labeled snapshot buckets, owned by a [`crate::session::Session`].
/// Snapshot labels live in-memory only.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    buckets: HashMap<String, SnapshotBucket>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        SnapshotStore::default()
    }

    pub fn snapshot(&mut self, label: &str, framework_state: &FrameworkState, pager: &Pager) {
        self.buckets.insert(
            label.to_string(),
            SnapshotBucket {
                artifacts: framework_state.artifacts.clone(),
                l1_pages: pager.l1_pages(),
            },
        );
    }

    pub fn restore(&self, label: &str, framework_state: &mut FrameworkState, pager: &mut Pager) -> Result<()> {
        let bucket = self
            .buckets
            .get(label)
            .ok_or_else(|| KernelError::NotFound(format!("snapshot '{label}'")))?;
        framework_state.artifacts = bucket.artifacts.clone();
        pager.restore_l1(bucket.l1_pages.clone());
        framework_state.decision_history.clear();
        framework_state.hypothesis = format!("RESTORED: {label}");
        Ok(())
    }

    pub fn labels(&self) -> Vec<&str> {
        self.buckets.keys().map(|s| s.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::HeuristicTokenizer;
    use std::sync::Arc;

    #[test]
    fn snapshot_then_mutate_then_restore_round_trips() {
        // snapshot, mutate, restore: decision history clears and the
        // hypothesis marks the restore point.
        let mut pager = Pager::new(1000, Arc::new(HeuristicTokenizer));
        let mut fs = FrameworkState::new("mission");
        fs.artifacts.push(Artifact::new("LOGIC", "1234"));
        pager.pin("SYS:mission", "m");

        let mut store = SnapshotStore::new();
        store.snapshot("clean", &fs, &pager);

        fs.find_artifact("LOGIC"); // unchanged before mutation
        fs.artifacts[0].summary = "9999".to_string();
        fs.decision_history.push(crate::state::DecisionEntry {
            turn: 1,
            tool_call: "save_artifact".to_string(),
            target: "LOGIC: 9999".to_string(),
            rationale: "x".to_string(),
            verdict: crate::state::Verdict::Pass,
            execution_result: Some("SUCCESS".to_string()),
        });

        store.restore("clean", &mut fs, &mut pager).unwrap();

        assert_eq!(fs.find_artifact("LOGIC").unwrap().summary, "1234");
        assert!(fs.decision_history.is_empty());
        assert_eq!(fs.hypothesis, "RESTORED: clean");
    }

    #[test]
    fn restore_of_unknown_label_errors() {
        let mut pager = Pager::new(1000, Arc::new(HeuristicTokenizer));
        let mut fs = FrameworkState::new("mission");
        let store = SnapshotStore::new();
        assert!(store.restore("nope", &mut fs, &mut pager).is_err());
    }
}
