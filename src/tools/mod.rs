//! The Tool ABI: every capability an agent can invoke, dispatched by
//! name through a [`ToolRegistry`]. Every tool signature is
//! `(&mut ToolContext, &str) -> Result<String>`; the returned string is the
//! feedback fed back into `FrameworkState::last_action_feedback` and into
//! the Policy Engine's regex-matched "last feedback" checks.

pub mod builtin;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::pager::Pager;
use crate::sidecar::Sidecar;
use crate::state::FrameworkState;

/// Everything a tool implementation needs, bundled so `ToolFn::call` stays
/// a two-argument signature regardless of how many collaborators a given
/// tool touches.
pub struct ToolContext<'a> {
    pub pager: &'a mut Pager,
    pub framework_state: &'a mut FrameworkState,
    pub sidecar: Option<Arc<Sidecar>>,
    pub root_dirs: &'a [PathBuf],
    pub sandbox: bool,
    pub shadow_fs: &'a mut HashMap<String, String>,
}

#[async_trait]
pub trait ToolFn: Send + Sync {
    async fn call(&self, ctx: &mut ToolContext<'_>, target: &str) -> Result<String>;
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn ToolFn>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        ToolRegistry { tools: HashMap::new() }
    }

    /// Registers the full, closed Tool ABI, matching
    /// `crate::healer::KNOWN_TOOLS` name-for-name except for `halt_and_ask`,
    /// which the Graph Engine intercepts before dispatch.
    pub fn with_builtins() -> Self {
        let mut registry = ToolRegistry::new();
        registry.register("stage_context", Arc::new(builtin::StageContext));
        registry.register("unstage_context", Arc::new(builtin::UnstageContext));
        registry.register("save_artifact", Arc::new(builtin::SaveArtifact));
        registry.register("stage_artifact", Arc::new(builtin::StageArtifact));
        registry.register("stage_multiple_artifacts", Arc::new(builtin::StageMultipleArtifacts));
        registry.register("delete_artifact", Arc::new(builtin::DeleteArtifact));
        registry.register("query_sidecar", Arc::new(builtin::QuerySidecar));
        registry.register("edit_file", Arc::new(builtin::EditFile));
        registry.register("write_file", Arc::new(builtin::WriteFile));
        registry.register("calculate", Arc::new(builtin::Calculate));
        registry.register("verify_step", Arc::new(builtin::VerifyStep));
        registry.register("compare_files", Arc::new(builtin::CompareFiles));
        registry.register("switch_strategy", Arc::new(builtin::SwitchStrategy));
        registry.register("set_audit_policy", Arc::new(builtin::SetAuditPolicy));
        registry.register("enable_policy", Arc::new(builtin::EnablePolicy));
        registry.register("disable_policy", Arc::new(builtin::DisablePolicy));
        registry
    }

    pub fn register(&mut self, name: &str, tool: Arc<dyn ToolFn>) {
        self.tools.insert(name.to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolFn>> {
        self.tools.get(name).cloned()
    }

    pub async fn execute(&self, name: &str, ctx: &mut ToolContext<'_>, target: &str) -> Result<String> {
        match self.tools.get(name) {
            Some(tool) => tool.call(ctx, target).await,
            None => Err(crate::error::KernelError::NotFound(format!("no tool registered under '{name}'"))),
        }
    }

    pub fn list(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }
}
