//! Builds the prompt from kernel state, invokes the model driver, and
//! parses the structured reply with the layered healer. Asks the
//! [`PolicyEngine`] first on every turn; a firing policy's proposal is
//! returned immediately without ever touching the model.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::drivers::LlmDriver;
use crate::error::{KernelError, Result};
use crate::healer;
use crate::policy::PolicyEngine;
use crate::state::{DecisionEntry, FrameworkState, Proposal, Verdict};

/// Everything the Proposer needs about current Pager/workspace state that
/// doesn't live in `FrameworkState` itself. Built fresh each turn by the
/// Session and handed to the Proposer as a read-only snapshot.
pub struct ProposerView<'a> {
    pub l1_files: &'a [(String, bool)], // (display id, pinned)
    pub l2_files: &'a [String],
    pub rendered_l1: &'a str,
    pub workspace_paths: &'a [String],
    pub disk_access_forbidden: bool,
}

pub struct Proposer {
    driver: Arc<dyn LlmDriver>,
    policy_engine: PolicyEngine,
    retries: u32,
    max_recent_turns: usize,
    deadline: Option<Duration>,
}

impl Proposer {
    pub fn new(driver: Arc<dyn LlmDriver>, policy_engine: PolicyEngine) -> Self {
        Proposer {
            driver,
            policy_engine,
            retries: 3,
            max_recent_turns: 8,
            deadline: None,
        }
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_max_recent_turns(mut self, n: usize) -> Self {
        self.max_recent_turns = n.max(1);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Runs the per-turn pipeline: policy engine first, then the model.
    pub async fn propose(&self, state: &FrameworkState, view: &ProposerView<'_>) -> Result<Proposal> {
        if let Some(p) = self.policy_engine.evaluate(state) {
            return Ok(p);
        }

        let system_prompt = build_system_prompt(state, view);
        let mut user_prompt = build_user_prompt(state, view, self.max_recent_turns);

        let mut last_error = String::new();
        for attempt in 0..=self.retries {
            let raw = match self.invoke_driver(&user_prompt, &system_prompt).await {
                Ok(raw) => raw,
                // A deadline is an external cancellation signal, not a
                // protocol problem the healer can retry past.
                Err(e @ KernelError::Cancelled(_)) => return Err(e),
                Err(e) => {
                    last_error = e.to_string();
                    continue;
                }
            };
            match self.parse_reply(&raw) {
                Some(proposal) => return Ok(proposal),
                None => {
                    last_error = format!("attempt {attempt}: could not parse a proposal from: {raw}");
                    warn!(attempt, "model protocol healer exhausted for this attempt");
                    user_prompt = format!(
                        "{user_prompt}\n\nYour previous reply could not be parsed. Reply with ONLY a JSON object \
                         of the form {{\"thought_process\": ..., \"tool_call\": ..., \"target\": ...}}."
                    );
                }
            }
        }

        // Every parse-repair layer is exhausted: surface a kernel-panic
        // proposal rather than an error, so the Graph Engine's "exactly
        // one history entry per turn" invariant still holds.
        Ok(proposal(
            "halt_and_ask",
            format!("kernel panic: {last_error}"),
            "KernelPanic",
        ))
    }

    /// Read-only introspection pass: runs a
    /// single Proposer invocation over the given state without touching
    /// the Policy Engine's turn-mutating side effects or the live session.
    pub async fn query(&self, state: &FrameworkState, view: &ProposerView<'_>, question: &str) -> Result<String> {
        let system_prompt = build_system_prompt(state, view);
        let user_prompt = format!("{}\n\nQuestion (does not consume a turn): {question}", build_user_prompt(state, view, self.max_recent_turns));
        self.driver
            .generate_raw(&user_prompt, &system_prompt)
            .await
    }

    async fn invoke_driver(&self, user_prompt: &str, system_prompt: &str) -> Result<String> {
        let fut = self.driver.generate_structured(user_prompt, SCHEMA_DESCRIPTION, system_prompt, self.retries);
        let value = match self.deadline {
            Some(d) => tokio::time::timeout(d, fut)
                .await
                .map_err(|_| KernelError::Cancelled("model driver call exceeded deadline".to_string()))??,
            None => fut.await?,
        };
        Ok(value.to_string())
    }

    fn parse_reply(&self, raw: &str) -> Option<Proposal> {
        let healed = healer::heal(raw)?;
        let tool_call = healed.get("tool_call")?.as_str()?.to_string();
        if !healer::KNOWN_TOOLS.contains(&tool_call.as_str()) {
            return None;
        }
        let target = healed.get("target").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let thought_process = healed
            .get("thought_process")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let policy_name = healed.get("policy_name").and_then(|v| v.as_str()).map(|s| s.to_string());
        Some(Proposal {
            thought_process,
            tool_call,
            target,
            policy_name,
        })
    }
}

const SCHEMA_DESCRIPTION: &str = r#"{"thought_process": string, "tool_call": string, "target": string, "policy_name": string|null}"#;

fn proposal(tool_call: impl Into<String>, target: impl Into<String>, policy_name: &str) -> Proposal {
    Proposal {
        thought_process: format!("synthesized by {policy_name}"),
        tool_call: tool_call.into(),
        target: target.into(),
        policy_name: Some(policy_name.to_string()),
    }
}

fn build_system_prompt(state: &FrameworkState, view: &ProposerView<'_>) -> String {
    let mode = if state.elastic_mode { "elastic" } else { "strict" };
    let disk = if view.disk_access_forbidden { "masked" } else { "visible" };
    format!(
        "You are the Proposer half of an orchestration kernel. Mode: {mode} amnesia, workspace disk access is {disk}. \
         In strict mode you may hold at most one FILE page in L1 at a time; in elastic mode you may hold several. \
         Respond with exactly one JSON object matching this schema: {SCHEMA_DESCRIPTION}. \
         tool_call must be one of: {}.",
        healer::KNOWN_TOOLS.join(", "),
    )
}

fn build_user_prompt(state: &FrameworkState, view: &ProposerView<'_>, max_recent_turns: usize) -> String {
    let mut out = String::new();
    out.push_str(&format!("MISSION: {}\n", state.mission));

    if !state.plan.is_empty() {
        out.push_str("PLAN:\n");
        for (i, step) in state.plan.iter().enumerate() {
            out.push_str(&format!("{}. [{:?}] {}\n", i + 1, step.status, step.description));
        }
    }

    out.push_str("L1 (active):\n");
    for (id, pinned) in view.l1_files {
        out.push_str(&format!("  - {id}{}\n", if *pinned { " [pinned]" } else { "" }));
    }

    out.push_str("L2 (staged):\n");
    for id in view.l2_files {
        out.push_str(&format!("  - {id}\n"));
    }

    out.push_str("ARTIFACTS (opaque pointers; stage_artifact to view contents):\n");
    for artifact in &state.artifacts {
        out.push_str(&format!("  - <{}>\n", artifact.identifier));
    }

    if view.disk_access_forbidden {
        out.push_str("WORKSPACE: (masked; disk access is forbidden this session)\n");
    } else {
        out.push_str("WORKSPACE:\n");
        for path in view.workspace_paths {
            out.push_str(&format!("  - {path}\n"));
        }
    }

    if let Some(feedback) = &state.last_action_feedback {
        out.push_str(&format!("LAST FEEDBACK: {feedback}\n"));
    }

    out.push_str("HISTORY:\n");
    out.push_str(&compress_history(&state.decision_history, max_recent_turns));
    out.push('\n');

    out.push_str("L1 CONTENT:\n");
    out.push_str(view.rendered_l1);

    out
}

/// Replaces the older portion of `history` with a single milestone line
/// once it exceeds `window`, keeping the last `window` entries verbatim.
pub fn compress_history(history: &[DecisionEntry], window: usize) -> String {
    if history.len() <= window {
        return history.iter().map(format_entry).collect::<Vec<_>>().join("\n");
    }

    let (older, recent) = history.split_at(history.len() - window);
    let successful = older.iter().filter(|e| e.verdict == Verdict::Pass).count();
    let rejected = older.iter().filter(|e| e.verdict == Verdict::Reject).count();
    let milestone = format!("MILESTONE: processed {} initial steps ({successful} successful, {rejected} rejected)", older.len());

    let mut lines = vec![milestone];
    lines.extend(recent.iter().map(format_entry));
    lines.join("\n")
}

fn format_entry(entry: &DecisionEntry) -> String {
    format!(
        "turn {}: {} {} -> {:?} ({})",
        entry.turn,
        entry.tool_call,
        entry.target,
        entry.verdict,
        entry.execution_result.as_deref().unwrap_or("NOT_EXECUTED")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::LocalDriver;
    use crate::policy::PolicyEngine;
    use serde_json::json;

    fn entry(turn: u64, verdict: Verdict) -> DecisionEntry {
        DecisionEntry {
            turn,
            tool_call: "stage_context".to_string(),
            target: format!("f{turn}.py"),
            rationale: "x".to_string(),
            verdict,
            execution_result: Some("SUCCESS".to_string()),
        }
    }

    #[test]
    fn compression_preserves_last_window_entries_verbatim() {
        let history: Vec<DecisionEntry> = (1..=12).map(|t| entry(t, Verdict::Pass)).collect();
        let compressed = compress_history(&history, 5);
        assert!(compressed.starts_with("MILESTONE:"));
        for t in 8..=12 {
            assert!(compressed.contains(&format!("turn {t}:")), "missing turn {t} in: {compressed}");
        }
        assert!(!compressed.contains("turn 1:"));
    }

    #[test]
    fn compression_is_noop_under_window() {
        let history: Vec<DecisionEntry> = (1..=3).map(|t| entry(t, Verdict::Pass)).collect();
        let compressed = compress_history(&history, 5);
        assert!(!compressed.contains("MILESTONE"));
        assert!(compressed.contains("turn 1:"));
    }

    #[tokio::test]
    async fn policy_fires_without_touching_the_model() {
        let driver = Arc::new(LocalDriver::new());
        // No scripted reply pushed; if the model were invoked this would
        // fall back to a halt, which we can distinguish from the policy's
        // own forced proposal below.
        let mut state = FrameworkState::new("sum val_x and val_y");
        state.artifacts.push(crate::artifact::Artifact::new("TOTAL", "100"));
        let proposer = Proposer::new(driver, PolicyEngine::with_defaults());
        let view = ProposerView {
            l1_files: &[],
            l2_files: &[],
            rendered_l1: "",
            workspace_paths: &[],
            disk_access_forbidden: false,
        };
        let proposal = proposer.propose(&state, &view).await.unwrap();
        assert_eq!(proposal.tool_call, "halt_and_ask");
        assert_eq!(proposal.policy_name.as_deref(), Some("CompletionPolicy"));
    }

    #[tokio::test]
    async fn falls_through_to_model_when_no_policy_fires() {
        let driver = Arc::new(LocalDriver::new());
        driver.push_reply(json!({"thought_process": "go", "tool_call": "stage_context", "target": "a.py"}));
        let state = FrameworkState::new("an open-ended mission with no completion signal");
        let proposer = Proposer::new(driver, PolicyEngine::with_defaults());
        let view = ProposerView {
            l1_files: &[],
            l2_files: &[],
            rendered_l1: "",
            workspace_paths: &[],
            disk_access_forbidden: false,
        };
        let proposal = proposer.propose(&state, &view).await.unwrap();
        assert_eq!(proposal.tool_call, "stage_context");
        assert!(proposal.policy_name.is_none());
    }

    #[tokio::test]
    async fn unparseable_reply_surfaces_kernel_panic_proposal_after_retries() {
        // A tool_call outside the known set never parses, so every retry
        // is exhausted and a synthetic halt_and_ask proposal is surfaced
        // instead of an error, preserving the one-history-entry-per-turn
        // invariant.
        let driver = Arc::new(LocalDriver::new());
        driver.push_reply(json!({"thought_process": "x", "tool_call": "not_a_real_tool", "target": "y"}));
        let state = FrameworkState::new("an open-ended mission with no completion signal");
        let proposer = Proposer::new(driver, PolicyEngine::with_defaults()).with_retries(0);
        let view = ProposerView {
            l1_files: &[],
            l2_files: &[],
            rendered_l1: "",
            workspace_paths: &[],
            disk_access_forbidden: false,
        };
        let proposal = proposer.propose(&state, &view).await.unwrap();
        assert_eq!(proposal.tool_call, "halt_and_ask");
        assert_eq!(proposal.policy_name.as_deref(), Some("KernelPanic"));
    }
}
