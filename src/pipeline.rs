//! Composes multiple [`Session`]s sharing one Sidecar.
//!
//! A pipeline is a sequence of steps, each either a *linear step* (one
//! mission, one sub-session) or a *map step* (an artifact carried from an
//! earlier step is split on commas/newlines and fanned out into one
//! sub-session per item, substituting `{item}` into a mission template).
//! Steps run strictly sequentially: only the Sidecar is shared, each
//! sub-session gets its own Pager, Gatekeeper and Policy engine.

use std::sync::Arc;

use crate::artifact::Artifact;
use crate::config::KernelConfig;
use crate::drivers::LlmDriver;
use crate::embedding::Embedder;
use crate::error::{KernelError, Result};
use crate::session::{Session, TurnOutcome};
use crate::sidecar::Sidecar;

/// A single mission run to completion inside a pipeline step.
#[derive(Debug, Clone)]
pub struct LinearStep {
    pub mission: String,
    pub audit_profile: Option<String>,
    pub forbidden_tools: Vec<String>,
}

/// Expands `input_artifact`'s comma/newline-delimited value into one
/// sub-session per item, substituting the literal `{item}` placeholder in
/// `mission_template`.
#[derive(Debug, Clone)]
pub struct MapStep {
    pub input_artifact: String,
    pub mission_template: String,
    pub audit_profile: Option<String>,
    pub forbidden_tools: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum PipelineStep {
    Linear(LinearStep),
    Map(MapStep),
}

/// The outcome of one sub-session, carried forward so later steps can read
/// the artifacts it produced.
#[derive(Debug, Clone)]
pub struct SessionResult {
    pub mission: String,
    pub outcome: TurnOutcome,
    pub artifacts: Vec<Artifact>,
}

#[derive(Debug, Clone)]
pub enum StepResult {
    Linear(SessionResult),
    Map(Vec<SessionResult>),
}

/// Runs a sequence of [`PipelineStep`]s, each against a fresh [`Session`]
/// built from a shared config template, driver and embedder.
pub struct Pipeline {
    base_config: KernelConfig,
    driver: Arc<dyn LlmDriver>,
    embedder: Arc<dyn Embedder>,
    sidecar: Arc<Sidecar>,
    steps: Vec<PipelineStep>,
    carried_artifacts: Vec<Artifact>,
}

impl Pipeline {
    pub fn new(
        base_config: KernelConfig,
        driver: Arc<dyn LlmDriver>,
        embedder: Arc<dyn Embedder>,
        sidecar: Arc<Sidecar>,
    ) -> Self {
        Pipeline {
            base_config,
            driver,
            embedder,
            sidecar,
            steps: Vec::new(),
            carried_artifacts: Vec::new(),
        }
    }

    pub fn add_linear_step(mut self, step: LinearStep) -> Self {
        self.steps.push(PipelineStep::Linear(step));
        self
    }

    pub fn add_map_step(mut self, step: MapStep) -> Self {
        self.steps.push(PipelineStep::Map(step));
        self
    }

    /// Runs every step in order. A step whose sub-session is cancelled (a
    /// driver timeout, the recursion limit, or an external abort) aborts the
    /// whole pipeline; a step that halts normally (`halt_and_ask` or a
    /// policy halt) is a completed step and the pipeline continues.
    pub async fn run(&mut self) -> Result<Vec<StepResult>> {
        let steps = self.steps.clone();
        let mut results = Vec::with_capacity(steps.len());

        for step in &steps {
            let result = match step {
                PipelineStep::Linear(linear) => StepResult::Linear(self.run_linear(linear).await?),
                PipelineStep::Map(map) => StepResult::Map(self.run_map(map).await?),
            };
            results.push(result);
        }

        Ok(results)
    }

    async fn run_linear(&mut self, step: &LinearStep) -> Result<SessionResult> {
        let result = self
            .run_sub_session(step.mission.clone(), step.audit_profile.clone(), step.forbidden_tools.clone())
            .await?;
        self.carried_artifacts = result.artifacts.clone();
        Ok(result)
    }

    async fn run_map(&mut self, step: &MapStep) -> Result<Vec<SessionResult>> {
        let source = self
            .carried_artifacts
            .iter()
            .find(|a| a.identifier == step.input_artifact)
            .ok_or_else(|| KernelError::NotFound(format!("map step input artifact '{}'", step.input_artifact)))?;

        let items: Vec<String> = source
            .summary
            .split(|c| c == ',' || c == '\n')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect();

        if items.is_empty() {
            return Err(KernelError::BadInput(format!(
                "map step input artifact '{}' expanded to zero items",
                step.input_artifact
            )));
        }

        let mut results = Vec::with_capacity(items.len());
        let mut merged_artifacts = Vec::new();
        for item in items {
            let mission = step.mission_template.replace("{item}", &item);
            let result = self
                .run_sub_session(mission, step.audit_profile.clone(), step.forbidden_tools.clone())
                .await?;
            merged_artifacts.extend(result.artifacts.clone());
            results.push(result);
        }
        self.carried_artifacts = merged_artifacts;
        Ok(results)
    }

    async fn run_sub_session(
        &self,
        mission: String,
        audit_profile: Option<String>,
        forbidden_tools: Vec<String>,
    ) -> Result<SessionResult> {
        let mut config = self.base_config.clone();
        config.mission = mission.clone();
        if let Some(profile) = audit_profile {
            config.audit_profile = profile;
        }
        if !forbidden_tools.is_empty() {
            config.forbidden_tools = forbidden_tools;
        }

        let mut session = Session::new(config, self.driver.clone(), self.embedder.clone(), Some(self.sidecar.clone()));
        for artifact in &self.carried_artifacts {
            session.seed_artifact(artifact.clone());
        }

        let outcome = session.run().await;
        if let TurnOutcome::Cancelled(msg) = &outcome {
            return Err(KernelError::Cancelled(msg.clone()));
        }

        Ok(SessionResult {
            mission,
            outcome,
            artifacts: session.framework_state().artifacts.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::LocalDriver;
    use crate::embedding::HashEmbedder;
    use serde_json::json;
    use tempfile::TempDir;

    fn base_config(recursion_limit: u32) -> KernelConfig {
        let mut cfg = KernelConfig::default();
        cfg.sandbox = true;
        cfg.use_default_policies = true;
        cfg.recursion_limit = recursion_limit;
        cfg
    }

    #[tokio::test]
    async fn linear_step_runs_to_completion_and_carries_artifacts() {
        let driver = Arc::new(LocalDriver::new());
        driver.push_reply(json!({"thought_process": "x", "tool_call": "save_artifact", "target": "NAMES: ana,bo,cy"}));
        driver.push_reply(json!({"thought_process": "x", "tool_call": "halt_and_ask", "target": "done collecting"}));

        let dir = TempDir::new().unwrap();
        let sidecar = Sidecar::open(dir.path()).unwrap();
        let mut pipeline = Pipeline::new(base_config(10), driver, Arc::new(HashEmbedder), sidecar).add_linear_step(LinearStep {
            mission: "collect names".to_string(),
            audit_profile: None,
            forbidden_tools: Vec::new(),
        });

        let results = pipeline.run().await.unwrap();
        assert_eq!(results.len(), 1);
        match &results[0] {
            StepResult::Linear(r) => {
                assert!(matches!(r.outcome, TurnOutcome::Halted(_)));
                assert!(r.artifacts.iter().any(|a| a.identifier == "NAMES"));
            }
            other => panic!("expected a linear result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn map_step_fans_out_one_sub_session_per_item() {
        let driver = Arc::new(LocalDriver::new());
        // Step 1: seed NAMES.
        driver.push_reply(json!({"thought_process": "x", "tool_call": "save_artifact", "target": "NAMES: ana,bo"}));
        driver.push_reply(json!({"thought_process": "x", "tool_call": "halt_and_ask", "target": "seeded"}));
        // Step 2, sub-session for "ana".
        driver.push_reply(json!({"thought_process": "x", "tool_call": "halt_and_ask", "target": "greeted ana"}));
        // Step 2, sub-session for "bo".
        driver.push_reply(json!({"thought_process": "x", "tool_call": "halt_and_ask", "target": "greeted bo"}));

        let dir = TempDir::new().unwrap();
        let sidecar = Sidecar::open(dir.path()).unwrap();
        let mut pipeline = Pipeline::new(base_config(10), driver, Arc::new(HashEmbedder), sidecar)
            .add_linear_step(LinearStep {
                mission: "collect names".to_string(),
                audit_profile: None,
                forbidden_tools: Vec::new(),
            })
            .add_map_step(MapStep {
                input_artifact: "NAMES".to_string(),
                mission_template: "greet {item}".to_string(),
                audit_profile: None,
                forbidden_tools: Vec::new(),
            });

        let results = pipeline.run().await.unwrap();
        assert_eq!(results.len(), 2);
        match &results[1] {
            StepResult::Map(sub_results) => {
                assert_eq!(sub_results.len(), 2);
                assert_eq!(sub_results[0].mission, "greet ana");
                assert_eq!(sub_results[1].mission, "greet bo");
            }
            other => panic!("expected a map result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn map_step_with_missing_input_artifact_errors() {
        let driver = Arc::new(LocalDriver::new());
        let dir = TempDir::new().unwrap();
        let sidecar = Sidecar::open(dir.path()).unwrap();
        let mut pipeline = Pipeline::new(base_config(10), driver, Arc::new(HashEmbedder), sidecar).add_map_step(MapStep {
            input_artifact: "NAMES".to_string(),
            mission_template: "greet {item}".to_string(),
            audit_profile: None,
            forbidden_tools: Vec::new(),
        });

        assert!(pipeline.run().await.is_err());
    }
}
