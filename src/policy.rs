//! The deterministic policy engine: priority-ordered rules that can
//! pre-empt the model entirely. Lives logically "inside" the Proposer but
//! is its own pluggable interface rather than hard-coded
//! branches — built-in policies are ordinary [`KernelPolicy`] instances.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::state::{FrameworkState, Proposal, Verdict};

/// A deterministic override rule evaluated before the model is asked for a
/// proposal. `condition` and `reaction` are plain functions rather than a
/// trait object's async methods: nothing here needs to suspend.
pub trait KernelPolicy: Send + Sync {
    fn name(&self) -> &str;
    fn priority(&self) -> i32;
    fn condition(&self, state: &FrameworkState) -> bool;
    fn reaction(&self, state: &FrameworkState) -> Option<Proposal>;
}

fn proposal(tool_call: impl Into<String>, target: impl Into<String>, policy_name: &str) -> Proposal {
    Proposal {
        thought_process: format!("forced by policy {policy_name}"),
        tool_call: tool_call.into(),
        target: target.into(),
        policy_name: Some(policy_name.to_string()),
    }
}

/// Priority 40. Fires when the last 4 decisions were all REJECT on the same
/// tool, forcing a full unstage and a hint toward the next sequential file.
pub struct StagnationBreaker;

impl KernelPolicy for StagnationBreaker {
    fn name(&self) -> &str {
        "StagnationBreaker"
    }
    fn priority(&self) -> i32 {
        40
    }
    fn condition(&self, state: &FrameworkState) -> bool {
        let recent = &state.decision_history;
        if recent.len() < 4 {
            return false;
        }
        let last4 = &recent[recent.len() - 4..];
        let all_reject = last4.iter().all(|e| e.verdict == Verdict::Reject);
        let same_tool = last4.windows(2).all(|w| w[0].tool_call == w[1].tool_call);
        all_reject && same_tool
    }
    fn reaction(&self, state: &FrameworkState) -> Option<Proposal> {
        let hint = next_sequential_file_hint(state);
        Some(proposal(
            "unstage_context",
            "ALL",
            &format!("{}{}", self.name(), hint),
        ))
    }
}

fn next_sequential_file_hint(state: &FrameworkState) -> String {
    state
        .plan
        .iter()
        .find(|s| matches!(s.status, crate::state::StepStatus::Pending))
        .map(|s| format!(" (hint: next file is '{}')", s.description))
        .unwrap_or_default()
}

static MISSION_COUNT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(\d+)\s+(?:files?|items?|parts?|values?)\b").unwrap());

fn mission_required_count(mission: &str) -> Option<usize> {
    MISSION_COUNT
        .captures(mission)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Priority 30. Fires when the mission specifies a required artifact count
/// N, fewer than N non-meta artifacts exist yet, and the agent's last
/// proposal was a premature `halt_and_ask`/`calculate`.
pub struct ProgressLock;

impl KernelPolicy for ProgressLock {
    fn name(&self) -> &str {
        "ProgressLock"
    }
    fn priority(&self) -> i32 {
        30
    }
    fn condition(&self, state: &FrameworkState) -> bool {
        let Some(n) = mission_required_count(&state.mission) else {
            return false;
        };
        if state.non_meta_artifact_count() >= n {
            return false;
        }
        state
            .decision_history
            .last()
            .map(|e| e.tool_call == "halt_and_ask" || e.tool_call == "calculate")
            .unwrap_or(false)
    }
    fn reaction(&self, state: &FrameworkState) -> Option<Proposal> {
        if !state.elastic_mode {
            if let Some(blocker) = state
                .last_action_feedback
                .as_deref()
                .and_then(extract_l1_violation_blocker)
            {
                return Some(proposal("unstage_context", blocker, self.name()));
            }
        }
        let next_target = state
            .plan
            .iter()
            .find(|s| !matches!(s.status, crate::state::StepStatus::Done))
            .map(|s| s.description.clone())
            .unwrap_or_else(|| "next expected stage".to_string());
        Some(proposal("stage_context", next_target, self.name()))
    }
}

fn extract_l1_violation_blocker(feedback: &str) -> Option<String> {
    static RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"L1 RAM VIOLATION \(FILE:([^)]+) is open\)").unwrap());
    RE.captures(feedback).and_then(|c| c.get(1)).map(|m| m.as_str().to_string())
}

/// Priority 25. Fires when the last feedback reports an L1 RAM violation
/// naming a blocking page, forcing it off L1 so the retry can admit.
pub struct L1ViolationHandler;

impl KernelPolicy for L1ViolationHandler {
    fn name(&self) -> &str {
        "L1ViolationHandler"
    }
    fn priority(&self) -> i32 {
        25
    }
    fn condition(&self, state: &FrameworkState) -> bool {
        state
            .last_action_feedback
            .as_deref()
            .map(|f| f.contains("L1 RAM VIOLATION"))
            .unwrap_or(false)
    }
    fn reaction(&self, state: &FrameworkState) -> Option<Proposal> {
        let blocker = state.last_action_feedback.as_deref().and_then(extract_l1_violation_blocker)?;
        Some(proposal("unstage_context", blocker, self.name()))
    }
}

/// Priority 20. Fires on a fatal "CRITICAL ERROR" feedback, halting rather
/// than letting the agent retry against a condition it cannot fix.
pub struct CriticalErrorHalt;

impl KernelPolicy for CriticalErrorHalt {
    fn name(&self) -> &str {
        "CriticalErrorHalt"
    }
    fn priority(&self) -> i32 {
        20
    }
    fn condition(&self, state: &FrameworkState) -> bool {
        state
            .last_action_feedback
            .as_deref()
            .map(|f| f.contains("CRITICAL ERROR"))
            .unwrap_or(false)
    }
    fn reaction(&self, state: &FrameworkState) -> Option<Proposal> {
        let feedback = state.last_action_feedback.clone().unwrap_or_default();
        Some(proposal("halt_and_ask", feedback, self.name()))
    }
}

static SEQUENTIAL_STEP_MISSION: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\s*1\.\s").unwrap());

fn completion_signal(state: &FrameworkState) -> Option<String> {
    if let Some(crate::state::TerminalCondition::RequiresToolSuccess(tool)) = &state.terminal_condition {
        if !state.has_tool_success(tool) {
            return None;
        }
    }

    let mission_lower = state.mission.to_lowercase();

    if (mission_lower.contains("sum") || mission_lower.contains("total") || mission_lower.contains("calculate"))
        && state.find_artifact("TOTAL").is_some()
    {
        return Some(format!(
            "mission complete: {}",
            state.find_artifact("TOTAL").unwrap().summary
        ));
    }

    if let Some(n) = mission_required_count(&state.mission) {
        if state.non_meta_artifact_count() >= n {
            return Some(format!("mission complete: collected {n} required artifacts"));
        }
    }

    if state.artifacts.iter().any(|a| {
        a.identifier == "VERIFICATION" || a.identifier.ends_with("_COMPLETE") || a.identifier.ends_with("_VIOLATION")
    }) {
        return Some("mission complete: verification artifact present".to_string());
    }

    None
}

fn mission_requires_write(mission: &str) -> bool {
    mission.to_lowercase().contains("write")
}

/// Priority 10. Fires on any mission-appropriate completion signal, unless
/// the mission demands a written output that hasn't happened yet.
pub struct CompletionPolicy;

impl KernelPolicy for CompletionPolicy {
    fn name(&self) -> &str {
        "CompletionPolicy"
    }
    fn priority(&self) -> i32 {
        10
    }
    fn condition(&self, state: &FrameworkState) -> bool {
        if completion_signal(state).is_none() {
            return false;
        }
        if state.terminal_condition.is_none() && mission_requires_write(&state.mission) && !state.has_tool_success("write_file") {
            return false;
        }
        true
    }
    fn reaction(&self, state: &FrameworkState) -> Option<Proposal> {
        let summary = completion_signal(state)?;
        Some(proposal("halt_and_ask", summary, self.name()))
    }
}

/// Priority 5. A simple extract mission ("find/get/extract X") whose target
/// artifact already exists; halts rather than continuing to search.
pub struct AutoHalt;

impl KernelPolicy for AutoHalt {
    fn name(&self) -> &str {
        "AutoHalt"
    }
    fn priority(&self) -> i32 {
        5
    }
    fn condition(&self, state: &FrameworkState) -> bool {
        let mission_lower = state.mission.to_lowercase();
        let is_simple_extract = ["find", "get", "extract"].iter().any(|kw| mission_lower.contains(kw))
            && mission_required_count(&state.mission).is_none();
        is_simple_extract && state.non_meta_artifact_count() > 0
    }
    fn reaction(&self, state: &FrameworkState) -> Option<Proposal> {
        let _ = state;
        Some(proposal("halt_and_ask", "target artifact already extracted", self.name()))
    }
}

/// Fires once, only on the first turn after a `restore`, re-proposing
/// continuation of the most recent in-progress plan step. Disabled unless
/// `KernelConfig::warm_start` registers it.
pub struct WarmStartContinuation;

impl KernelPolicy for WarmStartContinuation {
    fn name(&self) -> &str {
        "WarmStartContinuation"
    }
    fn priority(&self) -> i32 {
        35
    }
    fn condition(&self, state: &FrameworkState) -> bool {
        state.hypothesis.starts_with("RESTORED:") && state.decision_history.is_empty()
    }
    fn reaction(&self, state: &FrameworkState) -> Option<Proposal> {
        let step = state.plan.iter().find(|s| matches!(s.status, crate::state::StepStatus::InProgress))?;
        Some(proposal("stage_context", step.description.clone(), self.name()))
    }
}

/// Sorted, priority-ordered collection of policies with the anti-loop guard
///: a policy whose name appears in the most recent feedback as
/// REJECTED is skipped in favor of the next.
pub struct PolicyEngine {
    policies: Vec<Box<dyn KernelPolicy>>,
}

impl PolicyEngine {
    pub fn new(mut policies: Vec<Box<dyn KernelPolicy>>) -> Self {
        policies.sort_by(|a, b| b.priority().cmp(&a.priority()));
        PolicyEngine { policies }
    }

    /// The six mandatory built-ins, in no particular construction
    /// order — [`PolicyEngine::new`] sorts by priority.
    pub fn with_defaults() -> Self {
        Self::new(vec![
            Box::new(StagnationBreaker),
            Box::new(ProgressLock),
            Box::new(L1ViolationHandler),
            Box::new(CriticalErrorHalt),
            Box::new(CompletionPolicy),
            Box::new(AutoHalt),
        ])
    }

    pub fn with_defaults_and_warm_start() -> Self {
        let mut policies: Vec<Box<dyn KernelPolicy>> = vec![
            Box::new(StagnationBreaker),
            Box::new(WarmStartContinuation),
            Box::new(ProgressLock),
            Box::new(L1ViolationHandler),
            Box::new(CriticalErrorHalt),
            Box::new(CompletionPolicy),
            Box::new(AutoHalt),
        ];
        policies.sort_by(|a, b| b.priority().cmp(&a.priority()));
        PolicyEngine { policies }
    }

    fn rejected_policy_name(state: &FrameworkState) -> Option<&str> {
        let feedback = state.last_action_feedback.as_deref()?;
        let start = feedback.strip_prefix('[')?;
        let (name, rest) = start.split_once(']')?;
        if rest.trim_start().starts_with("REJECTED") {
            Some(name)
        } else {
            None
        }
    }

    /// Iterates policies in priority order; the first whose condition holds
    /// and which is not blocked by the anti-loop guard wins.
    pub fn evaluate(&self, state: &FrameworkState) -> Option<Proposal> {
        let skip = Self::rejected_policy_name(state);
        for policy in &self.policies {
            if Some(policy.name()) == skip {
                continue;
            }
            if !policy.condition(state) {
                continue;
            }
            if let Some(p) = policy.reaction(state) {
                return Some(p);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::Artifact;
    use crate::state::{DecisionEntry, PlanStep, StepStatus};

    fn mission_state(mission: &str) -> FrameworkState {
        FrameworkState::new(mission)
    }

    #[test]
    fn stagnation_breaker_fires_on_four_identical_rejects() {
        let mut state = mission_state("do something");
        for _ in 0..4 {
            state.decision_history.push(DecisionEntry {
                turn: 1,
                tool_call: "stage_context".to_string(),
                target: "a.py".to_string(),
                rationale: "x".to_string(),
                verdict: Verdict::Reject,
                execution_result: None,
            });
        }
        let policy = StagnationBreaker;
        assert!(policy.condition(&state));
        let p = policy.reaction(&state).unwrap();
        assert_eq!(p.tool_call, "unstage_context");
        assert_eq!(p.target, "ALL");
    }

    #[test]
    fn completion_policy_fires_on_total_artifact_for_sum_mission() {
        let mut state = mission_state("sum val_x and val_y");
        state.artifacts.push(Artifact::new("TOTAL", "100"));
        let policy = CompletionPolicy;
        assert!(policy.condition(&state));
        let p = policy.reaction(&state).unwrap();
        assert_eq!(p.tool_call, "halt_and_ask");
    }

    #[test]
    fn completion_policy_declines_when_mission_requires_write_not_yet_done() {
        let mut state = mission_state("sum val_x and val_y, then write the report");
        state.artifacts.push(Artifact::new("TOTAL", "100"));
        let policy = CompletionPolicy;
        assert!(!policy.condition(&state));
    }

    #[test]
    fn completion_policy_fires_once_write_file_succeeded() {
        let mut state = mission_state("sum val_x and val_y, then write the report");
        state.artifacts.push(Artifact::new("TOTAL", "100"));
        state.decision_history.push(DecisionEntry {
            turn: 1,
            tool_call: "write_file".to_string(),
            target: "report.md: 100".to_string(),
            rationale: "x".to_string(),
            verdict: Verdict::Pass,
            execution_result: Some("SUCCESS".to_string()),
        });
        let policy = CompletionPolicy;
        assert!(policy.condition(&state));
    }

    #[test]
    fn l1_violation_handler_extracts_blocker_id() {
        let mut state = mission_state("mission");
        state.last_action_feedback = Some("L1 RAM VIOLATION (FILE:big.py is open)".to_string());
        let policy = L1ViolationHandler;
        assert!(policy.condition(&state));
        let p = policy.reaction(&state).unwrap();
        assert_eq!(p.target, "big.py");
    }

    #[test]
    fn progress_lock_forces_next_stage_when_undercount() {
        let mut state = mission_state("collect 3 values");
        state.plan.push(PlanStep {
            description: "b.py".to_string(),
            status: StepStatus::Pending,
        });
        state.decision_history.push(DecisionEntry {
            turn: 1,
            tool_call: "halt_and_ask".to_string(),
            target: "premature".to_string(),
            rationale: "x".to_string(),
            verdict: Verdict::Reject,
            execution_result: None,
        });
        let policy = ProgressLock;
        assert!(policy.condition(&state));
    }

    #[test]
    fn engine_respects_priority_order() {
        let mut state = mission_state("sum val_x and val_y");
        state.artifacts.push(Artifact::new("TOTAL", "100"));
        state.last_action_feedback = Some("L1 RAM VIOLATION (FILE:x is open)".to_string());
        let engine = PolicyEngine::with_defaults();
        let p = engine.evaluate(&state).unwrap();
        // L1ViolationHandler (25) outranks CompletionPolicy (10).
        assert_eq!(p.policy_name.as_deref(), Some("L1ViolationHandler"));
    }

    #[test]
    fn anti_loop_guard_skips_recently_rejected_policy() {
        let mut state = mission_state("sum val_x and val_y");
        state.artifacts.push(Artifact::new("TOTAL", "100"));
        state.last_action_feedback = Some("[CompletionPolicy] REJECTED: not yet".to_string());
        let engine = PolicyEngine::with_defaults();
        let p = engine.evaluate(&state);
        // CompletionPolicy is skipped; AutoHalt's condition isn't met either, so no policy fires.
        assert!(p.is_none() || p.unwrap().policy_name.as_deref() != Some("CompletionPolicy"));
    }
}
