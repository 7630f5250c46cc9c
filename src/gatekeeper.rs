//! The layered validator of every proposed action.
//!
//! Five layers, evaluated in order; the first to reject returns
//! immediately. The Gatekeeper never issues tool calls — its only outputs
//! are a verdict, a rationale, a confidence, and an optional correction.

use std::path::PathBuf;
use std::sync::Arc;

use regex::Regex;
use once_cell::sync::Lazy;

use crate::artifact::{is_valid_identifier, Artifact};
use crate::config::AuditProfile;
use crate::embedding::{cosine_similarity, Embedder};
use crate::fs_safety;
use crate::state::{AuditResult, DecisionEntry, Proposal, Verdict};

const IDEMPOTENT_READS: &[&str] = &["stage_context", "unstage_context", "query_sidecar", "verify_step"];
const RELEVANCE_EXEMPT: &[&str] = &[
    "stage_context",
    "unstage_context",
    "halt_and_ask",
    "query_sidecar",
    "switch_strategy",
    "stage_artifact",
];
const RELEVANCE_GATED: &[&str] = &["save_artifact", "edit_file", "write_file", "calculate"];

static HOARDING_PHRASES: &[&str] = &["without unstaging", "keep both", "in addition to", "alongside"];

static SEQUENTIAL_STEP_MISSION: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\s*1\.\s").unwrap());
static MISSION_COUNT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\b(\d+)\s+(?:files?|items?|parts?|values?)\b").unwrap());

pub struct GatekeeperContext<'a> {
    pub mission: &'a str,
    pub turn: u64,
    pub valid_files: &'a [String],
    pub decision_history: &'a [DecisionEntry],
    pub artifacts: &'a [Artifact],
    pub rendered_l1: &'a str,
    pub elastic_mode: bool,
    pub sanitization_mode: bool,
    pub forbidden_tools: &'a [String],
    pub root_dirs: &'a [PathBuf],
    pub profile: &'a AuditProfile,
}

pub struct Gatekeeper {
    embedder: Arc<dyn Embedder>,
}

impl Gatekeeper {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Gatekeeper { embedder }
    }

    pub fn evaluate(&self, proposal: &Proposal, ctx: &GatekeeperContext) -> AuditResult {
        if let Some(verdict) = self.layer0_physical_preflight(proposal, ctx) {
            return verdict;
        }
        if let Some(verdict) = self.layer1_structural_hygiene(proposal, ctx) {
            return verdict;
        }
        if let Some(verdict) = self.layer2_state_correctness(proposal, ctx) {
            return verdict;
        }
        if let Some(verdict) = self.layer3_semantic_fidelity(proposal, ctx) {
            return verdict;
        }
        if let Some(verdict) = self.layer4_relevance(proposal, ctx) {
            return verdict;
        }

        AuditResult {
            verdict: Verdict::Pass,
            rationale: "accepted".to_string(),
            confidence: 0.9,
            correction: None,
        }
    }

    fn reject(rationale: impl Into<String>) -> AuditResult {
        let rationale = rationale.into();
        AuditResult {
            verdict: Verdict::Reject,
            correction: Some(rationale.clone()),
            rationale,
            confidence: 0.95,
        }
    }

    fn pass(rationale: impl Into<String>) -> AuditResult {
        AuditResult {
            verdict: Verdict::Pass,
            rationale: rationale.into(),
            confidence: 0.9,
            correction: None,
        }
    }

    fn layer0_physical_preflight(&self, proposal: &Proposal, ctx: &GatekeeperContext) -> Option<AuditResult> {
        if ctx.forbidden_tools.iter().any(|t| t == &proposal.tool_call) {
            return Some(Self::reject(format!(
                "tool '{}' is forbidden by session configuration",
                proposal.tool_call
            )));
        }

        for path in file_targets(&proposal.tool_call, &proposal.target) {
            if fs_safety::is_sensitive(&path) {
                return Some(Self::reject(format!("'{path}' is a sensitive path and may not be touched")));
            }
            if fs_safety::escapes_roots(ctx.root_dirs, &path) {
                return Some(Self::reject(format!("'{path}' resolves outside the allowed roots")));
            }
        }
        None
    }

    fn layer1_structural_hygiene(&self, proposal: &Proposal, ctx: &GatekeeperContext) -> Option<AuditResult> {
        if proposal.tool_call == "save_artifact" {
            let key = artifact_key(&proposal.target);
            if !is_valid_identifier(&key) {
                return Some(Self::reject(format!("semantic pollution: '{key}' violates the identifier grammar")));
            }
        }

        if !IDEMPOTENT_READS.contains(&proposal.tool_call.as_str()) {
            if let Some(last) = ctx.decision_history.last() {
                if last.tool_call == proposal.tool_call && last.target == proposal.target {
                    return Some(Self::reject("stagnation: immediate exact repeat of the previous action"));
                }
            }
        }
        None
    }

    fn layer2_state_correctness(&self, proposal: &Proposal, ctx: &GatekeeperContext) -> Option<AuditResult> {
        match proposal.tool_call.as_str() {
            "stage_context" => {
                let path = proposal.target.split(',').next().unwrap_or("").trim().to_string();
                if !ctx.valid_files.iter().any(|f| f == &path) {
                    return Some(Self::reject(format!("'{path}' is not present in the workspace map")));
                }
                if !ctx.elastic_mode && HOARDING_PHRASES.iter().any(|p| proposal.thought_process_contains(p)) {
                    return Some(Self::reject("One-File Limit: strict mode forbids hoarding multiple files"));
                }
            }
            "unstage_context" => {
                // idempotent either way; nothing to reject here, handled by caller checking L1 membership.
            }
            "save_artifact" => {
                let key = artifact_key(&proposal.target);
                let value = artifact_value(&proposal.target);
                if ctx.elastic_mode {
                    if let Some(existing) = ctx.artifacts.iter().find(|a| a.identifier == key) {
                        if existing.summary == value {
                            return Some(AuditResult {
                                verdict: Verdict::Reject,
                                rationale: "already up-to-date; move on".to_string(),
                                confidence: 0.6,
                                correction: Some("already up-to-date; move on".to_string()),
                            });
                        }
                    }
                }
            }
            "halt_and_ask" => {
                if let Some(n) = mission_required_count(ctx.mission) {
                    let non_meta = ctx.artifacts.iter().filter(|a| !a.is_meta()).count();
                    if non_meta < n {
                        return Some(Self::reject("premature halt: required artifacts not yet collected"));
                    }
                }
                if SEQUENTIAL_STEP_MISSION.is_match(ctx.mission) {
                    let threshold = sequential_step_threshold(ctx.mission);
                    let collected = ctx
                        .artifacts
                        .iter()
                        .filter(|a| a.identifier.starts_with("PART_") || a.identifier.starts_with("VAL_"))
                        .count();
                    if collected < threshold {
                        return Some(Self::reject("premature completion: sequential steps not all collected"));
                    }
                }
            }
            _ => {}
        }
        None
    }

    fn layer3_semantic_fidelity(&self, proposal: &Proposal, ctx: &GatekeeperContext) -> Option<AuditResult> {
        if proposal.tool_call != "save_artifact" {
            return None;
        }
        let value = artifact_value(&proposal.target);
        if value.trim().is_empty() {
            return None;
        }

        if ctx.sanitization_mode && looks_redacted(&value) {
            return None;
        }

        if collapsed_contains(ctx.rendered_l1, &value) {
            return None;
        }
        if ctx.artifacts.iter().any(|a| collapsed_contains(&a.summary, &value)) {
            return None;
        }
        if proposal.thought_process_contains("calculate") || is_numeric(&value) {
            return None;
        }

        Some(Self::reject("hallucination: claimed value is not grounded in L1 or prior artifacts"))
    }

    fn layer4_relevance(&self, proposal: &Proposal, ctx: &GatekeeperContext) -> Option<AuditResult> {
        if RELEVANCE_EXEMPT.contains(&proposal.tool_call.as_str())
            || !RELEVANCE_GATED.contains(&proposal.tool_call.as_str())
        {
            return None;
        }

        let action_text = format!("{} {} {}", proposal.tool_call, proposal.target, proposal.thought_process);
        let action_embedding = self.embedder.embed(&action_text);
        let mission_embedding = self.embedder.embed(ctx.mission);
        let relevance = cosine_similarity(&action_embedding, &mission_embedding);

        if SEQUENTIAL_STEP_MISSION.is_match(ctx.mission) && relevance > 0.55 {
            return Some(Self::pass("fast-path: sequential step with adequate relevance"));
        }

        if ctx.profile.fast_paths(&proposal.tool_call) && relevance >= ctx.profile.relevance_threshold {
            return Some(Self::pass("fast-path: profile permits and relevance threshold met"));
        }

        if ctx.turn <= 5 {
            tracing::debug!(relevance, turn = ctx.turn, "bootstrap PASS despite low relevance");
            return Some(Self::pass("bootstrap pass: within first 5 turns"));
        }

        if relevance < ctx.profile.relevance_threshold {
            return Some(Self::reject(format!(
                "relevance {relevance:.2} below profile threshold {:.2}",
                ctx.profile.relevance_threshold
            )));
        }

        None
    }
}

impl Proposal {
    fn thought_process_contains(&self, needle: &str) -> bool {
        self.thought_process.to_lowercase().contains(&needle.to_lowercase())
    }
}

fn file_targets(tool: &str, target: &str) -> Vec<String> {
    match tool {
        "stage_context" => target.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect(),
        "edit_file" | "write_file" => target
            .split_once(':')
            .map(|(p, _)| p.trim().to_string())
            .into_iter()
            .collect(),
        "compare_files" => target.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect(),
        _ => Vec::new(),
    }
}

fn artifact_key(target: &str) -> String {
    let stripped = target.strip_prefix("PINNED_L1:").unwrap_or(target);
    stripped
        .split(|c| c == ':' || c == '=')
        .next()
        .unwrap_or("")
        .trim()
        .to_string()
}

fn artifact_value(target: &str) -> String {
    let stripped = target.strip_prefix("PINNED_L1:").unwrap_or(target);
    match stripped.split_once(':').or_else(|| stripped.split_once('=')) {
        Some((_, v)) => v.trim().to_string(),
        None => String::new(),
    }
}

fn collapsed(text: &str) -> String {
    text.chars().filter(|c| !c.is_whitespace() && !c.is_ascii_punctuation()).collect::<String>().to_lowercase()
}

fn collapsed_contains(haystack: &str, needle: &str) -> bool {
    if needle.trim().is_empty() {
        return false;
    }
    collapsed(haystack).contains(&collapsed(needle))
}

fn is_numeric(value: &str) -> bool {
    value.trim().parse::<f64>().is_ok()
}

fn looks_redacted(value: &str) -> bool {
    value.contains("REDACTED") || value.trim() == "..."
}

fn mission_required_count(mission: &str) -> Option<usize> {
    MISSION_COUNT.captures(mission).and_then(|c| c.get(1)).and_then(|m| m.as_str().parse().ok())
}

fn sequential_step_threshold(mission: &str) -> usize {
    mission.lines().filter(|l| Regex::new(r"^\s*\d+\.\s").unwrap().is_match(l)).count().max(1)
}
