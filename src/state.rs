//! Per-session mutable state: [`FrameworkState`], [`AgentState`] and the
//! decision history.

use serde::{Deserialize, Serialize};

use crate::artifact::Artifact;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Done,
    Blocked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub description: String,
    pub status: StepStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Pass,
    Reject,
    Halt,
    FailedExecution,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionEntry {
    pub turn: u64,
    pub tool_call: String,
    pub target: String,
    pub rationale: String,
    pub verdict: Verdict,
    pub execution_result: Option<String>,
}

/// Names a tool whose success must appear in decision history before
/// `CompletionPolicy` may fire, replacing prose pattern-matching for
/// "mission requires a write".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TerminalCondition {
    RequiresToolSuccess(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameworkState {
    pub mission: String,
    pub hypothesis: String,
    pub hard_constraints: Vec<String>,
    pub plan: Vec<PlanStep>,
    pub artifacts: Vec<Artifact>,
    pub confidence: f32,
    pub open_unknowns: Vec<String>,
    pub strategy: String,
    pub current_step_index: usize,
    pub elastic_mode: bool,
    pub audit_profile: String,
    pub active_policy_names: Vec<String>,
    pub last_action_feedback: Option<String>,
    pub decision_history: Vec<DecisionEntry>,
    pub sanitization_mode: bool,
    pub terminal_condition: Option<TerminalCondition>,
}

impl FrameworkState {
    pub fn new(mission: impl Into<String>) -> Self {
        FrameworkState {
            mission: mission.into(),
            hypothesis: String::new(),
            hard_constraints: Vec::new(),
            plan: Vec::new(),
            artifacts: Vec::new(),
            confidence: 0.5,
            open_unknowns: Vec::new(),
            strategy: "default".to_string(),
            current_step_index: 0,
            elastic_mode: true,
            audit_profile: "FLUID_READ".to_string(),
            active_policy_names: Vec::new(),
            last_action_feedback: None,
            decision_history: Vec::new(),
            sanitization_mode: false,
            terminal_condition: None,
        }
    }

    pub fn non_meta_artifact_count(&self) -> usize {
        self.artifacts.iter().filter(|a| !a.is_meta()).count()
    }

    pub fn find_artifact(&self, identifier: &str) -> Option<&Artifact> {
        self.artifacts.iter().find(|a| a.identifier == identifier)
    }

    pub fn has_tool_success(&self, tool: &str) -> bool {
        self.decision_history
            .iter()
            .any(|e| e.tool_call == tool && e.execution_result.as_deref() == Some("SUCCESS"))
    }

    /// `history[-1]["auditor_verdict"]`-equivalent convenience accessor.
    pub fn last_decision(&self) -> Option<&DecisionEntry> {
        self.decision_history.last()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceFile {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub thought_process: String,
    pub tool_call: String,
    pub target: String,
    pub policy_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditResult {
    pub verdict: Verdict,
    pub rationale: String,
    pub confidence: f32,
    pub correction: Option<String>,
}

/// Graph-level state: framework state plus the bookkeeping the Session /
/// Graph Engine needs between node transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub framework_state: FrameworkState,
    pub active_file_map: Vec<WorkspaceFile>,
    pub last_proposal: Option<Proposal>,
    pub last_audit: Option<AuditResult>,
    pub last_node: String,
    pub forbidden_tools: Vec<String>,
}

impl AgentState {
    pub fn new(framework_state: FrameworkState, forbidden_tools: Vec<String>) -> Self {
        AgentState {
            framework_state,
            active_file_map: Vec::new(),
            last_proposal: None,
            last_audit: None,
            last_node: "start".to_string(),
            forbidden_tools,
        }
    }
}
