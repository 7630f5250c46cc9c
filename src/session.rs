//! The Session / Graph Engine: owns the agent state and drives the
//! Proposer → Gatekeeper → Effector cycle with checkpointing.
//!
//! Per's design note, ownership here is explicit: the Session owns its
//! Pager, Gatekeeper, Proposer and an optional shared Sidecar handle; it
//! never hands out live pointers to its internals. The Proposer receives a
//! read-only [`ProposerView`] snapshot each turn instead.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::warn;

use crate::artifact::Artifact;
use crate::config::KernelConfig;
use crate::drivers::LlmDriver;
use crate::embedding::Embedder;
use crate::error::{KernelError, Result};
use crate::gatekeeper::{Gatekeeper, GatekeeperContext};
use crate::pager::Pager;
use crate::policy::PolicyEngine;
use crate::proposer::{Proposer, ProposerView};
use crate::sidecar::Sidecar;
use crate::snapshot::SnapshotStore;
use crate::state::{AgentState, DecisionEntry, FrameworkState, Proposal, Verdict, WorkspaceFile};
use crate::tokenizer::{HeuristicTokenizer, Tokenizer};
use crate::tools::{ToolContext, ToolRegistry};
use crate::workspace;

/// Persists [`AgentState`] between turns.
/// Node boundaries are the checkpoint points: replay from any checkpoint is
/// deterministic given the same model outputs.
pub trait Checkpointer: Send + Sync {
    fn save(&self, state: &AgentState);
    fn load(&self) -> Option<AgentState>;
}

/// Keeps the most recent checkpoint in memory; the default for sessions
/// that don't need cross-process durability.
#[derive(Default)]
pub struct InMemoryCheckpointer {
    slot: parking_lot::Mutex<Option<AgentState>>,
}

impl Checkpointer for InMemoryCheckpointer {
    fn save(&self, state: &AgentState) {
        *self.slot.lock() = Some(state.clone());
    }
    fn load(&self) -> Option<AgentState> {
        self.slot.lock().clone()
    }
}

/// Serializes the checkpoint to a JSON file on disk, for sessions that
/// must survive a process restart.
pub struct FileCheckpointer {
    path: PathBuf,
}

impl FileCheckpointer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileCheckpointer { path: path.into() }
    }
}

impl Checkpointer for FileCheckpointer {
    fn save(&self, state: &AgentState) {
        match serde_json::to_string_pretty(state) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.path, json) {
                    warn!(error = %e, path = %self.path.display(), "checkpoint write failed");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize checkpoint"),
        }
    }

    fn load(&self) -> Option<AgentState> {
        let raw = std::fs::read_to_string(&self.path).ok()?;
        serde_json::from_str(&raw).ok()
    }
}

/// What happened this turn, for the caller driving [`Session::run`].
#[derive(Debug, Clone)]
pub enum TurnOutcome {
    Continue,
    Halted(String),
    Cancelled(String),
}

/// The orchestration kernel's central state machine: `proposer →
/// gatekeeper → {effector | end}`, `effector → proposer`.
pub struct Session {
    config: KernelConfig,
    pager: Pager,
    gatekeeper: Gatekeeper,
    proposer: Proposer,
    tools: ToolRegistry,
    sidecar: Option<Arc<Sidecar>>,
    agent_state: AgentState,
    snapshots: SnapshotStore,
    shadow_fs: HashMap<String, String>,
    tokenizer: Arc<dyn Tokenizer>,
    checkpointer: Option<Arc<dyn Checkpointer>>,
}

impl Session {
    pub fn new(
        config: KernelConfig,
        driver: Arc<dyn LlmDriver>,
        embedder: Arc<dyn Embedder>,
        sidecar: Option<Arc<Sidecar>>,
    ) -> Self {
        let tokenizer: Arc<dyn Tokenizer> = Arc::new(HeuristicTokenizer);
        let mut pager = Pager::new(config.l1_capacity_tokens, tokenizer.clone());
        if let Some(sc) = &sidecar {
            pager = pager.with_sidecar(sc.clone());
        }
        pager.pin("SYS:mission", config.mission.clone());

        let policy_engine = if !config.use_default_policies {
            PolicyEngine::new(Vec::new())
        } else if config.warm_start {
            PolicyEngine::with_defaults_and_warm_start()
        } else {
            PolicyEngine::with_defaults()
        };

        let proposer = Proposer::new(driver, policy_engine)
            .with_retries(3)
            .with_max_recent_turns(config.max_recent_turns);

        let mut framework_state = FrameworkState::new(config.mission.clone());
        framework_state.elastic_mode = config.elastic_mode;
        framework_state.audit_profile = config.audit_profile.clone();
        framework_state.sanitization_mode = config.sanitization_mode;
        framework_state.terminal_condition = config.terminal_condition.clone();

        let agent_state = AgentState::new(framework_state, config.forbidden_tools.clone());

        Session {
            gatekeeper: Gatekeeper::new(embedder),
            tools: ToolRegistry::with_builtins(),
            agent_state,
            snapshots: SnapshotStore::new(),
            shadow_fs: HashMap::new(),
            tokenizer,
            checkpointer: None,
            config,
            pager,
            proposer,
            sidecar,
        }
    }

    pub fn with_checkpointer(mut self, checkpointer: Arc<dyn Checkpointer>) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    pub fn framework_state(&self) -> &FrameworkState {
        &self.agent_state.framework_state
    }

    pub fn last_proposal(&self) -> Option<&Proposal> {
        self.agent_state.last_proposal.as_ref()
    }

    /// Seeds an artifact into this session's initial state without going
    /// through the effector; used by the Pipeline to carry a prior
    /// step's output into the next step's sub-sessions. A no-op if the
    /// identifier is already present.
    pub fn seed_artifact(&mut self, artifact: Artifact) {
        if self.agent_state.framework_state.find_artifact(&artifact.identifier).is_none() {
            self.agent_state.framework_state.artifacts.push(artifact);
        }
    }

    pub fn pager(&self) -> &Pager {
        &self.pager
    }

    /// Restores `{artifacts, L1 pages}` from a labeled snapshot bucket.
    pub fn snapshot(&mut self, label: &str) {
        self.snapshots.snapshot(label, &self.agent_state.framework_state, &self.pager);
    }

    pub fn restore(&mut self, label: &str) -> Result<()> {
        self.snapshots.restore(label, &mut self.agent_state.framework_state, &mut self.pager)
    }

    /// Drives the loop until `halt_and_ask`, a HALT verdict, the recursion
    /// limit, or an external cancellation. Returns the final outcome.
    pub async fn run(&mut self) -> TurnOutcome {
        for _ in 0..self.config.recursion_limit {
            match self.run_turn().await {
                Ok(TurnOutcome::Continue) => continue,
                Ok(other) => return other,
                Err(KernelError::Cancelled(msg)) => return TurnOutcome::Cancelled(msg),
                Err(e) => return TurnOutcome::Cancelled(e.to_string()),
            }
        }
        TurnOutcome::Cancelled(format!(
            "recursion limit of {} turns exceeded",
            self.config.recursion_limit
        ))
    }

    /// One full `proposer → gatekeeper → {effector | end}` cycle.
    pub async fn run_turn(&mut self) -> Result<TurnOutcome> {
        self.housekeeping();

        self.agent_state.last_node = "proposer".to_string();
        let proposer_view = self.build_proposer_view_owned();
        let proposal = self
            .proposer
            .propose(&self.agent_state.framework_state, &proposer_view.as_view())
            .await?;
        self.agent_state.last_proposal = Some(proposal.clone());

        self.agent_state.last_node = "gatekeeper".to_string();
        let gatekeeper_ctx = self.build_gatekeeper_context();
        let verdict = self.gatekeeper.evaluate(&proposal, &gatekeeper_ctx.as_ctx());
        self.agent_state.last_audit = Some(verdict.clone());

        let turn = self.pager.current_turn();

        match verdict.verdict {
            Verdict::Halt => {
                self.record_decision(turn, &proposal, Verdict::Halt, None);
                self.agent_state.last_node = "end".to_string();
                self.checkpoint();
                Ok(TurnOutcome::Halted(verdict.rationale))
            }
            Verdict::Reject => {
                self.record_decision(turn, &proposal, Verdict::Reject, None);
                self.agent_state.framework_state.last_action_feedback = Some(format!(
                    "[{}] REJECTED: {}",
                    proposal.policy_name.as_deref().unwrap_or("Gatekeeper"),
                    verdict.correction.unwrap_or(verdict.rationale)
                ));
                self.checkpoint();
                Ok(TurnOutcome::Continue)
            }
            Verdict::Pass | Verdict::FailedExecution => {
                if proposal.tool_call == "halt_and_ask" {
                    self.record_decision(turn, &proposal, Verdict::Pass, None);
                    self.agent_state.last_node = "end".to_string();
                    self.checkpoint();
                    return Ok(TurnOutcome::Halted(proposal.target));
                }

                self.agent_state.last_node = "effector".to_string();
                let execution_result = self.run_effector(&proposal).await;
                let (verdict_for_history, feedback) = match &execution_result {
                    Ok(feedback) => (Verdict::Pass, feedback.clone()),
                    Err(e) => (Verdict::FailedExecution, e.clone().into_feedback()),
                };
                self.record_decision(
                    turn,
                    &proposal,
                    verdict_for_history,
                    Some(execution_result.as_ref().map(|_| "SUCCESS".to_string()).unwrap_or_else(|e| format!("ERROR: {e}"))),
                );
                self.agent_state.framework_state.last_action_feedback = Some(feedback);
                self.checkpoint();
                Ok(TurnOutcome::Continue)
            }
        }
    }

    /// Read-only introspection: a single Proposer/Gatekeeper pass over a
    /// throwaway snapshot of current state.
    pub async fn query(&self, question: &str) -> Result<String> {
        let view = self.build_proposer_view_owned();
        self.proposer.query(&self.agent_state.framework_state, &view.as_view(), question).await
    }

    fn housekeeping(&mut self) {
        self.pager.tick();

        if !self.config.sandbox {
            let scanned = workspace::scan(&self.config.root_dirs);
            let valid_paths: Vec<String> = scanned.iter().map(|f| f.path.clone()).collect();
            self.pager.physical_gc(&valid_paths);
            self.agent_state.active_file_map = scanned.into_iter().map(|f| WorkspaceFile { path: f.path }).collect();
        }

        if let Some(sidecar) = &self.sidecar {
            for (key, value) in sidecar.all() {
                if self.agent_state.framework_state.find_artifact(&key).is_none() {
                    self.agent_state.framework_state.artifacts.push(Artifact::new(key, value));
                }
            }
        }

        if self.config.elastic_mode {
            self.recompute_elastic_capacity();
        }
    }

    /// Resizes L1 capacity so that `capacity + overhead + reasoningFloor +
    /// outputFloor <= totalWindow`, never exceeding the session's initial
    /// configured cap, damped by [`Pager::set_capacity_tokens`].
    fn recompute_elastic_capacity(&mut self) {
        let overhead = self.tokenizer.count_tokens(&self.structural_overhead_text());
        let floors = self.config.context_floors.reasoning + self.config.context_floors.output + self.config.context_floors.overhead;
        let available = self.config.max_total_context.saturating_sub(overhead + floors);
        let proposed = available.min(self.config.l1_capacity_tokens);
        self.pager.set_capacity_tokens(proposed);
    }

    fn structural_overhead_text(&self) -> String {
        let fs = &self.agent_state.framework_state;
        format!(
            "{}\n{}\n{}",
            fs.mission,
            fs.plan.iter().map(|s| s.description.as_str()).collect::<Vec<_>>().join("\n"),
            crate::proposer::compress_history(&fs.decision_history, self.config.max_recent_turns)
        )
    }

    fn build_proposer_view_owned(&self) -> ProposerViewOwned {
        let l1_files = self.pager.l1_summary();
        let l2_files = self.pager.l2_ids();
        let rendered_l1 = self.pager.render();
        let workspace_paths: Vec<String> = self.agent_state.active_file_map.iter().map(|f| f.path.clone()).collect();
        ProposerViewOwned {
            l1_files,
            l2_files,
            rendered_l1,
            workspace_paths,
            disk_access_forbidden: self.config.sandbox,
        }
    }

    fn build_gatekeeper_context(&self) -> GatekeeperContextOwned {
        GatekeeperContextOwned {
            mission: self.agent_state.framework_state.mission.clone(),
            turn: self.pager.current_turn(),
            valid_files: self.agent_state.active_file_map.iter().map(|f| f.path.clone()).collect(),
            decision_history: self.agent_state.framework_state.decision_history.clone(),
            artifacts: self.agent_state.framework_state.artifacts.clone(),
            rendered_l1: self.pager.render(),
            elastic_mode: self.agent_state.framework_state.elastic_mode,
            sanitization_mode: self.agent_state.framework_state.sanitization_mode,
            forbidden_tools: self.agent_state.forbidden_tools.clone(),
            root_dirs: self.config.root_dirs.clone(),
            profile: self.config.resolve_audit_profile(),
        }
    }

    async fn run_effector(&mut self, proposal: &Proposal) -> std::result::Result<String, KernelError> {
        let mut ctx = ToolContext {
            pager: &mut self.pager,
            framework_state: &mut self.agent_state.framework_state,
            sidecar: self.sidecar.clone(),
            root_dirs: &self.config.root_dirs,
            sandbox: self.config.sandbox,
            shadow_fs: &mut self.shadow_fs,
        };
        self.tools.execute(&proposal.tool_call, &mut ctx, &proposal.target).await
    }

    fn record_decision(
        &mut self,
        turn: u64,
        proposal: &Proposal,
        verdict: Verdict,
        execution_result: Option<String>,
    ) {
        self.agent_state.framework_state.decision_history.push(DecisionEntry {
            turn,
            tool_call: proposal.tool_call.clone(),
            target: proposal.target.clone(),
            rationale: proposal.thought_process.clone(),
            verdict,
            execution_result,
        });
    }

    fn checkpoint(&self) {
        if let Some(cp) = &self.checkpointer {
            cp.save(&self.agent_state);
        }
    }
}

/// Owned snapshot backing a borrowed [`ProposerView`]; exists because the
/// Proposer's view type borrows from fields assembled fresh each turn.
struct ProposerViewOwned {
    l1_files: Vec<(String, bool)>,
    l2_files: Vec<String>,
    rendered_l1: String,
    workspace_paths: Vec<String>,
    disk_access_forbidden: bool,
}

impl ProposerViewOwned {
    fn as_view(&self) -> ProposerView<'_> {
        ProposerView {
            l1_files: &self.l1_files,
            l2_files: &self.l2_files,
            rendered_l1: &self.rendered_l1,
            workspace_paths: &self.workspace_paths,
            disk_access_forbidden: self.disk_access_forbidden,
        }
    }
}

struct GatekeeperContextOwned {
    mission: String,
    turn: u64,
    valid_files: Vec<String>,
    decision_history: Vec<DecisionEntry>,
    artifacts: Vec<Artifact>,
    rendered_l1: String,
    elastic_mode: bool,
    sanitization_mode: bool,
    forbidden_tools: Vec<String>,
    root_dirs: Vec<PathBuf>,
    profile: crate::config::AuditProfile,
}

impl GatekeeperContextOwned {
    fn as_ctx(&self) -> GatekeeperContext<'_> {
        GatekeeperContext {
            mission: &self.mission,
            turn: self.turn,
            valid_files: &self.valid_files,
            decision_history: &self.decision_history,
            artifacts: &self.artifacts,
            rendered_l1: &self.rendered_l1,
            elastic_mode: self.elastic_mode,
            sanitization_mode: self.sanitization_mode,
            forbidden_tools: &self.forbidden_tools,
            root_dirs: &self.root_dirs,
            profile: &self.profile,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::drivers::LocalDriver;
    use crate::embedding::HashEmbedder;
    use serde_json::json;

    fn session(config: KernelConfig, driver: Arc<LocalDriver>) -> Session {
        Session::new(config, driver, Arc::new(HashEmbedder), None)
    }

    fn base_config(mission: &str) -> KernelConfig {
        let mut cfg = KernelConfig::default();
        cfg.mission = mission.to_string();
        cfg.sandbox = true;
        cfg.use_default_policies = false;
        cfg
    }

    #[tokio::test]
    async fn effector_commits_a_save_artifact_proposal() {
        let driver = Arc::new(LocalDriver::new());
        driver.push_reply(json!({"thought_process": "save", "tool_call": "save_artifact", "target": "V1: 42"}));
        let mut s = session(base_config("collect values"), driver);

        let outcome = s.run_turn().await.unwrap();
        assert!(matches!(outcome, TurnOutcome::Continue));
        assert_eq!(s.framework_state().find_artifact("V1").unwrap().summary, "42");
        assert_eq!(s.framework_state().decision_history.len(), 1);
        assert_eq!(s.framework_state().decision_history[0].verdict, Verdict::Pass);
    }

    #[tokio::test]
    async fn halt_and_ask_proposal_ends_the_session_without_dispatch() {
        let driver = Arc::new(LocalDriver::new());
        driver.push_reply(json!({"thought_process": "done", "tool_call": "halt_and_ask", "target": "need guidance"}));
        let mut s = session(base_config("an open-ended mission"), driver);

        let outcome = s.run_turn().await.unwrap();
        match outcome {
            TurnOutcome::Halted(msg) => assert_eq!(msg, "need guidance"),
            other => panic!("expected Halted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_target_is_rejected_and_feeds_back() {
        let driver = Arc::new(LocalDriver::new());
        driver.push_reply(json!({"thought_process": "x", "tool_call": "save_artifact", "target": "not a valid key: 42"}));
        let mut s = session(base_config("mission"), driver);

        let outcome = s.run_turn().await.unwrap();
        assert!(matches!(outcome, TurnOutcome::Continue));
        assert!(s.framework_state().last_action_feedback.as_deref().unwrap().contains("REJECTED"));
    }

    #[tokio::test]
    async fn forbidden_tool_is_rejected_at_layer0() {
        let driver = Arc::new(LocalDriver::new());
        driver.push_reply(json!({"thought_process": "x", "tool_call": "write_file", "target": "out.md: hi"}));
        let mut cfg = base_config("mission");
        cfg.forbidden_tools = vec!["write_file".to_string()];
        let mut s = session(cfg, driver);

        let outcome = s.run_turn().await.unwrap();
        assert!(matches!(outcome, TurnOutcome::Continue));
        assert_eq!(s.framework_state().decision_history[0].verdict, Verdict::Reject);
    }

    #[tokio::test]
    async fn snapshot_and_restore_round_trip_through_a_session() {
        // snapshot/restore driven through the full turn cycle.
        let driver = Arc::new(LocalDriver::new());
        driver.push_reply(json!({"thought_process": "x", "tool_call": "save_artifact", "target": "V1: 1"}));
        driver.push_reply(json!({"thought_process": "x", "tool_call": "save_artifact", "target": "V1: 2"}));
        let mut s = session(base_config("mission"), driver);

        s.run_turn().await.unwrap();
        s.snapshot("base");
        s.run_turn().await.unwrap();
        assert_eq!(s.framework_state().find_artifact("V1").unwrap().summary, "2");

        s.restore("base").unwrap();
        assert_eq!(s.framework_state().find_artifact("V1").unwrap().summary, "1");
    }

    #[tokio::test]
    async fn completion_policy_halts_without_invoking_the_model() {
        let driver = Arc::new(LocalDriver::new());
        // Seed the TOTAL artifact as if `calculate` had already run, then
        // leave the script empty: if the policy engine didn't intercept the
        // second turn, the model would be invoked and fall back to a
        // differently-worded `halt_and_ask`.
        driver.push_reply(json!({"thought_process": "x", "tool_call": "calculate", "target": "1 + 1"}));

        let mut cfg = base_config("sum val_x and val_y");
        cfg.use_default_policies = true;
        let mut s = session(cfg, driver);

        s.run_turn().await.unwrap();

        let outcome = s.run_turn().await.unwrap();
        match outcome {
            TurnOutcome::Halted(msg) => assert!(msg.contains("mission complete")),
            other => panic!("expected a policy-forced halt, got {other:?}"),
        }
        assert_eq!(s.last_proposal().unwrap().policy_name.as_deref(), Some("CompletionPolicy"));
    }
}
