//! End-to-end runs of a full [`Session`] against real files on disk,
//! covering the scenarios that a module-level unit test can't: the
//! workspace scanner, the file-backed tool ABI, and the Gatekeeper wired
//! together across a whole mission.

use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;

use amnesic_kernel::config::KernelConfig;
use amnesic_kernel::drivers::LocalDriver;
use amnesic_kernel::embedding::HashEmbedder;
use amnesic_kernel::session::{Session, TurnOutcome};

fn config(root: &TempDir, mission: &str) -> KernelConfig {
    let mut cfg = KernelConfig::default();
    cfg.mission = mission.to_string();
    cfg.root_dirs = vec![root.path().to_path_buf()];
    cfg.l1_capacity_tokens = 1500;
    cfg.use_default_policies = false;
    cfg.recursion_limit = 10;
    cfg
}

/// Scenario 1, "island hop": two files each hold half a sum; the agent
/// stages both, records the values as artifacts, unstages, computes the
/// total, and halts.
#[tokio::test]
async fn island_hop_sums_two_staged_files() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("a.txt"), "val_x = 42").unwrap();
    std::fs::write(dir.path().join("b.txt"), "val_y = 58").unwrap();
    let a = dir.path().join("a.txt").display().to_string();
    let b = dir.path().join("b.txt").display().to_string();

    let driver = Arc::new(LocalDriver::new());
    driver.push_reply(json!({"thought_process": "load both halves", "tool_call": "stage_context", "target": format!("{a},{b}")}));
    driver.push_reply(json!({"thought_process": "from a.txt", "tool_call": "save_artifact", "target": "val_x: 42"}));
    driver.push_reply(json!({"thought_process": "from b.txt", "tool_call": "save_artifact", "target": "val_y: 58"}));
    driver.push_reply(json!({"thought_process": "done reading", "tool_call": "unstage_context", "target": "ALL"}));
    driver.push_reply(json!({"thought_process": "calculate the sum", "tool_call": "calculate", "target": "42 + 58"}));
    driver.push_reply(json!({"thought_process": "mission complete", "tool_call": "halt_and_ask", "target": "TOTAL computed"}));

    let mut session = Session::new(config(&dir, "sum val_x and val_y"), driver, Arc::new(HashEmbedder), None);

    let outcome = session.run().await;
    assert!(matches!(outcome, TurnOutcome::Halted(_)), "expected an orderly halt, got {outcome:?}");

    let total = session.framework_state().find_artifact("TOTAL").expect("TOTAL artifact");
    assert!(total.summary.contains("100"), "expected TOTAL to contain 100, got {}", total.summary);

    let history = &session.framework_state().decision_history;
    let stage_turn = history.iter().position(|e| e.tool_call == "stage_context").unwrap();
    let unstage_turn = history.iter().position(|e| e.tool_call == "unstage_context").unwrap();
    let halt_turn = history.iter().position(|e| e.tool_call == "halt_and_ask").unwrap();
    assert!(stage_turn < unstage_turn && unstage_turn < halt_turn, "expected stage -> unstage -> halt ordering");
}

/// Scenario 6, "calculator over the backpack": three numeric artifacts
/// collapse into one `TOTAL` via `SUM_BACKPACK`.
#[tokio::test]
async fn sum_backpack_totals_every_numeric_artifact() {
    let dir = TempDir::new().unwrap();

    let driver = Arc::new(LocalDriver::new());
    driver.push_reply(json!({"thought_process": "seed V1", "tool_call": "save_artifact", "target": "V1: 10"}));
    driver.push_reply(json!({"thought_process": "seed V2", "tool_call": "save_artifact", "target": "V2: 20"}));
    driver.push_reply(json!({"thought_process": "seed V3", "tool_call": "save_artifact", "target": "V3: 30"}));
    driver.push_reply(json!({"thought_process": "sum the backpack", "tool_call": "calculate", "target": "SUM_BACKPACK"}));
    driver.push_reply(json!({"thought_process": "mission complete", "tool_call": "halt_and_ask", "target": "total is 60"}));

    let mut session = Session::new(config(&dir, "collect three values and total them"), driver, Arc::new(HashEmbedder), None);

    let outcome = session.run().await;
    assert!(matches!(outcome, TurnOutcome::Halted(_)), "expected an orderly halt, got {outcome:?}");

    let total = session.framework_state().find_artifact("TOTAL").expect("TOTAL artifact");
    assert_eq!(total.summary, "Final (ADD): 60");
}

/// The recursion limit gives a hard cap: a driver that never halts leaves
/// the session cancelled, not stuck in an unbounded loop.
#[tokio::test]
async fn recursion_limit_bounds_a_driver_that_never_halts() {
    let dir = TempDir::new().unwrap();
    let driver = Arc::new(LocalDriver::new());
    for i in 0..5 {
        driver.push_reply(json!({"thought_process": "x", "tool_call": "save_artifact", "target": format!("V{i}: {i}")}));
    }

    let mut cfg = config(&dir, "mission with no terminal condition");
    cfg.recursion_limit = 3;
    let mut session = Session::new(cfg, driver, Arc::new(HashEmbedder), None);

    let outcome = session.run().await;
    assert!(matches!(outcome, TurnOutcome::Cancelled(_)), "expected the recursion limit to cancel the session, got {outcome:?}");
}
