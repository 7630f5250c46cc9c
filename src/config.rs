//! Session configuration and Audit Profiles.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::state::TerminalCondition;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionStrategy {
    OnSave,
    OnLimit,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextMode {
    Diligent,
    Creative,
    Balanced,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ContextFloors {
    pub reasoning: usize,
    pub output: usize,
    pub overhead: usize,
}

impl Default for ContextFloors {
    fn default() -> Self {
        ContextFloors {
            reasoning: 512,
            output: 512,
            overhead: 256,
        }
    }
}

/// The strictness configuration for the Gatekeeper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditProfile {
    pub name: String,
    pub fast_path_tools: Vec<String>,
    pub relevance_threshold: f32,
    /// Tools that are always evaluated at full strictness; `*` matches any
    /// tool.
    pub strict_tools: Vec<String>,
    pub allow_forgiveness: bool,
}

impl AuditProfile {
    pub fn strict_audit() -> Self {
        AuditProfile {
            name: "STRICT_AUDIT".to_string(),
            fast_path_tools: Vec::new(),
            relevance_threshold: 0.7,
            strict_tools: vec!["*".to_string()],
            allow_forgiveness: false,
        }
    }

    pub fn fluid_read() -> Self {
        AuditProfile {
            name: "FLUID_READ".to_string(),
            fast_path_tools: vec![
                "stage_context".to_string(),
                "unstage_context".to_string(),
                "verify_step".to_string(),
                "query_sidecar".to_string(),
            ],
            relevance_threshold: 0.55,
            strict_tools: Vec::new(),
            allow_forgiveness: true,
        }
    }

    pub fn high_speed() -> Self {
        AuditProfile {
            name: "HIGH_SPEED".to_string(),
            fast_path_tools: vec![
                "stage_context".to_string(),
                "unstage_context".to_string(),
                "save_artifact".to_string(),
                "stage_artifact".to_string(),
                "verify_step".to_string(),
                "query_sidecar".to_string(),
                "calculate".to_string(),
            ],
            relevance_threshold: 0.45,
            strict_tools: Vec::new(),
            allow_forgiveness: true,
        }
    }

    pub fn is_strict_for(&self, tool: &str) -> bool {
        self.strict_tools.iter().any(|t| t == "*" || t == tool)
    }

    pub fn fast_paths(&self, tool: &str) -> bool {
        self.fast_path_tools.iter().any(|t| t == tool)
    }
}

#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub mission: String,
    pub root_dirs: Vec<PathBuf>,
    pub model_name: String,
    pub provider: String,
    pub l1_capacity_tokens: usize,
    pub deterministic_seed: Option<u64>,
    pub strategy: Option<String>,
    pub elastic_mode: bool,
    pub eviction_strategy: EvictionStrategy,
    pub forbidden_tools: Vec<String>,
    pub sandbox: bool,
    pub use_default_policies: bool,
    pub audit_profile: String,
    pub custom_audit_profiles: HashMap<String, AuditProfile>,
    pub recursion_limit: u32,
    pub max_total_context: usize,
    pub context_mode: ContextMode,
    pub context_floors: ContextFloors,
    pub sanitization_mode: bool,
    pub terminal_condition: Option<TerminalCondition>,
    pub warm_start: bool,
    pub max_recent_turns: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig {
            mission: String::new(),
            root_dirs: vec![PathBuf::from(".")],
            model_name: "local".to_string(),
            provider: "local".to_string(),
            l1_capacity_tokens: 4000,
            deterministic_seed: None,
            strategy: None,
            elastic_mode: true,
            eviction_strategy: EvictionStrategy::OnLimit,
            forbidden_tools: Vec::new(),
            sandbox: false,
            use_default_policies: true,
            audit_profile: "FLUID_READ".to_string(),
            custom_audit_profiles: HashMap::new(),
            recursion_limit: 50,
            max_total_context: 8192,
            context_mode: ContextMode::Balanced,
            context_floors: ContextFloors::default(),
            sanitization_mode: false,
            terminal_condition: None,
            warm_start: false,
            max_recent_turns: 8,
        }
    }
}

impl KernelConfig {
    pub fn resolve_audit_profile(&self) -> AuditProfile {
        if let Some(custom) = self.custom_audit_profiles.get(&self.audit_profile) {
            return custom.clone();
        }
        match self.audit_profile.as_str() {
            "STRICT_AUDIT" => AuditProfile::strict_audit(),
            "HIGH_SPEED" => AuditProfile::high_speed(),
            _ => AuditProfile::fluid_read(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_profile_resolves_to_fluid_read() {
        let cfg = KernelConfig::default();
        assert_eq!(cfg.resolve_audit_profile().name, "FLUID_READ");
    }

    #[test]
    fn strict_audit_marks_every_tool_strict() {
        let p = AuditProfile::strict_audit();
        assert!(p.is_strict_for("save_artifact"));
        assert!(p.is_strict_for("anything"));
    }
}
