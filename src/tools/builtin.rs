//! Tool ABI implementations. Each struct is a unit type dispatched
//! through [`super::ToolRegistry`]; `halt_and_ask` is intentionally absent
//! here — the Graph Engine intercepts it before it ever reaches the
//! registry.

use async_trait::async_trait;

use crate::artifact::{is_valid_identifier, Artifact, MAX_PAYLOAD_BYTES};
use crate::comparator::Comparator;
use crate::error::{KernelError, Result};
use crate::page::{artifact_page_id, file_page_id};

use super::{ToolContext, ToolFn};

fn read_file(ctx: &ToolContext<'_>, path: &str) -> Result<String> {
    if ctx.sandbox {
        return ctx
            .shadow_fs
            .get(path)
            .cloned()
            .ok_or_else(|| KernelError::NotFound(path.to_string()));
    }
    let resolved = crate::fs_safety::resolve(ctx.root_dirs, path);
    std::fs::read_to_string(&resolved).map_err(|_| KernelError::NotFound(path.to_string()))
}

fn write_file_impl(ctx: &mut ToolContext<'_>, path: &str, content: &str) -> Result<()> {
    if content.len() > MAX_PAYLOAD_BYTES {
        return Err(KernelError::CapacityExceeded(path.to_string()));
    }
    if ctx.sandbox {
        ctx.shadow_fs.insert(path.to_string(), content.to_string());
        return Ok(());
    }
    let resolved = crate::fs_safety::resolve(ctx.root_dirs, path);
    if let Some(parent) = resolved.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&resolved, content)?;
    Ok(())
}

/// Stage one or more comma-separated file paths into L1. Refuses with `CapacityExceeded` if admission
/// fails even after eviction, matching the Comparator's own cost check.
pub struct StageContext;

#[async_trait]
impl ToolFn for StageContext {
    async fn call(&self, ctx: &mut ToolContext<'_>, target: &str) -> Result<String> {
        let mut staged = Vec::new();
        for path in target.split(',').map(|s| s.trim()).filter(|s| !s.is_empty()) {
            let content = read_file(ctx, path)?;
            let id = file_page_id(path);
            if !ctx.pager.request_access(&id, Some(content), 5) {
                return Err(KernelError::CapacityExceeded(path.to_string()));
            }
            staged.push(path.to_string());
        }
        Ok(format!("staged: {}", staged.join(", ")))
    }
}

/// `target == "ALL"` demotes every non-pinned L1 page; otherwise demotes
/// the named page(s).
pub struct UnstageContext;

#[async_trait]
impl ToolFn for UnstageContext {
    async fn call(&self, ctx: &mut ToolContext<'_>, target: &str) -> Result<String> {
        if target.trim().eq_ignore_ascii_case("ALL") {
            for id in ctx.pager.l1_ids() {
                ctx.pager.evict_to_l2(&id);
            }
            return Ok("unstaged all non-pinned L1 pages".to_string());
        }
        for id in target.split(',').map(|s| s.trim()).filter(|s| !s.is_empty()) {
            let id = if id.starts_with("FILE:") { id.to_string() } else { file_page_id(id) };
            ctx.pager.evict_to_l2(&id);
        }
        Ok(format!("unstaged: {target}"))
    }
}

/// Records a durable, symbolic fact (`KEY: VALUE`) in `FrameworkState`
/// and pins a mirror page so it survives L1 eviction pressure.
pub struct SaveArtifact;

#[async_trait]
impl ToolFn for SaveArtifact {
    async fn call(&self, ctx: &mut ToolContext<'_>, target: &str) -> Result<String> {
        let (key, value) = split_key_value(target)?;
        if !is_valid_identifier(&key) {
            return Err(KernelError::BadInput(format!("'{key}' is not a valid artifact identifier")));
        }
        if value.len() > MAX_PAYLOAD_BYTES {
            return Err(KernelError::CapacityExceeded(key));
        }

        if let Some(existing) = ctx.framework_state.artifacts.iter_mut().find(|a| a.identifier == key) {
            existing.summary = value.clone();
        } else {
            ctx.framework_state.artifacts.push(Artifact::new(key.clone(), value.clone()));
        }
        ctx.pager.pin(artifact_page_id(&key), format!("{key}: {value}"));
        Ok(format!("saved artifact {key}"))
    }
}

/// Like `save_artifact` but leaves the artifact unpinned and staged in L2.
pub struct StageArtifact;

#[async_trait]
impl ToolFn for StageArtifact {
    async fn call(&self, ctx: &mut ToolContext<'_>, target: &str) -> Result<String> {
        let (key, value) = split_key_value(target)?;
        if !is_valid_identifier(&key) {
            return Err(KernelError::BadInput(format!("'{key}' is not a valid artifact identifier")));
        }
        ctx.pager.prefetch(artifact_page_id(&key), format!("{key}: {value}"), 4);
        Ok(format!("staged artifact {key}"))
    }
}

/// `target` is a `;`-separated list of `KEY: VALUE` pairs, staged in one
/// call.
pub struct StageMultipleArtifacts;

#[async_trait]
impl ToolFn for StageMultipleArtifacts {
    async fn call(&self, ctx: &mut ToolContext<'_>, target: &str) -> Result<String> {
        let mut count = 0;
        for pair in target.split(';').map(|s| s.trim()).filter(|s| !s.is_empty()) {
            let (key, value) = split_key_value(pair)?;
            if !is_valid_identifier(&key) {
                return Err(KernelError::BadInput(format!("'{key}' is not a valid artifact identifier")));
            }
            ctx.pager.prefetch(artifact_page_id(&key), format!("{key}: {value}"), 4);
            count += 1;
        }
        Ok(format!("staged {count} artifacts"))
    }
}

pub struct DeleteArtifact;

#[async_trait]
impl ToolFn for DeleteArtifact {
    async fn call(&self, ctx: &mut ToolContext<'_>, target: &str) -> Result<String> {
        let key = target.trim();
        let before = ctx.framework_state.artifacts.len();
        ctx.framework_state.artifacts.retain(|a| a.identifier != key);
        if ctx.framework_state.artifacts.len() == before {
            return Err(KernelError::NotFound(key.to_string()));
        }
        ctx.pager.evict_to_l2(&artifact_page_id(key));
        Ok(format!("deleted artifact {key}"))
    }
}

/// Semantic recall from the Sidecar, rehydrating hits into L2.
pub struct QuerySidecar;

#[async_trait]
impl ToolFn for QuerySidecar {
    async fn call(&self, ctx: &mut ToolContext<'_>, target: &str) -> Result<String> {
        let ids = ctx.pager.recall_from_l3(target, 5);
        if ids.is_empty() {
            return Ok("no matches in the sidecar".to_string());
        }
        Ok(format!("recalled: {}", ids.join(", ")))
    }
}

/// `target` is `path: instruction`; a best-effort in-place string
/// replacement.
pub struct EditFile;

#[async_trait]
impl ToolFn for EditFile {
    async fn call(&self, ctx: &mut ToolContext<'_>, target: &str) -> Result<String> {
        let (path, instruction) = target
            .split_once(':')
            .map(|(p, i)| (p.trim().to_string(), i.trim().to_string()))
            .ok_or_else(|| KernelError::BadInput("edit_file target must be 'path: instruction'".to_string()))?;
        let current = read_file(ctx, &path)?;
        let edited = format!("{current}\n{instruction}\n");
        write_file_impl(ctx, &path, &edited)?;
        if ctx.pager.file_page_exists(&path) {
            ctx.pager.request_access(&file_page_id(&path), Some(edited), 5);
        }
        Ok(format!("edited {path}"))
    }
}

/// `target` is `path: content`; overwrites (or creates) the file.
pub struct WriteFile;

#[async_trait]
impl ToolFn for WriteFile {
    async fn call(&self, ctx: &mut ToolContext<'_>, target: &str) -> Result<String> {
        let (path, content) = target
            .split_once(':')
            .map(|(p, c)| (p.trim().to_string(), c.trim().to_string()))
            .ok_or_else(|| KernelError::BadInput("write_file target must be 'path: content'".to_string()))?;
        write_file_impl(ctx, &path, &content)?;
        if ctx.pager.file_page_exists(&path) {
            ctx.pager.request_access(&file_page_id(&path), Some(content), 5);
        }
        Ok(format!("wrote {path}"))
    }
}

/// A sandboxed four-function arithmetic evaluator, used to keep the
/// model from hallucinating sums it should instead compute deterministically.
/// `target` is either a bare expression, `SUM_BACKPACK` (ADD over every
/// numeric artifact currently in the backpack), or `JOIN` (concatenate
/// every artifact into a report). Both special forms save a `TOTAL`
/// artifact, matching Scenario 6's `Final (ADD): 60` wording.
pub struct Calculate;

#[async_trait]
impl ToolFn for Calculate {
    async fn call(&self, ctx: &mut ToolContext<'_>, target: &str) -> Result<String> {
        match target.trim() {
            "SUM_BACKPACK" => {
                let values: Vec<f64> = ctx
                    .framework_state
                    .artifacts
                    .iter()
                    .filter(|a| !a.is_meta())
                    .filter_map(|a| a.summary.trim().parse::<f64>().ok())
                    .collect();
                let total: f64 = values.iter().sum();
                let summary = format!("Final (ADD): {}", format_number(total));
                save_total(ctx, &summary);
                Ok(summary)
            }
            "JOIN" => {
                let joined = ctx
                    .framework_state
                    .artifacts
                    .iter()
                    .filter(|a| !a.is_meta())
                    .map(|a| format!("{}: {}", a.identifier, a.summary))
                    .collect::<Vec<_>>()
                    .join("\n");
                save_total(ctx, &joined);
                Ok(joined)
            }
            expr => {
                let result = eval_arithmetic(expr)?;
                let summary = format_number(result);
                save_total(ctx, &summary);
                Ok(summary)
            }
        }
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

fn save_total(ctx: &mut ToolContext<'_>, summary: &str) {
    if let Some(existing) = ctx.framework_state.artifacts.iter_mut().find(|a| a.identifier == "TOTAL") {
        existing.summary = summary.to_string();
    } else {
        ctx.framework_state.artifacts.push(Artifact::new("TOTAL", summary));
    }
    ctx.pager.pin(artifact_page_id("TOTAL"), format!("TOTAL: {summary}"));
}

/// Marks the plan step at the given index `Done`, or reports `Blocked`
/// with the supplied reason (`target == "index: Blocked: reason"`).
pub struct VerifyStep;

#[async_trait]
impl ToolFn for VerifyStep {
    async fn call(&self, ctx: &mut ToolContext<'_>, target: &str) -> Result<String> {
        let mut parts = target.splitn(2, ':');
        let index: usize = parts
            .next()
            .unwrap_or_default()
            .trim()
            .parse()
            .map_err(|_| KernelError::BadInput("verify_step target must start with a step index".to_string()))?;
        let status_text = parts.next().unwrap_or_default().trim();

        let step = ctx
            .framework_state
            .plan
            .get_mut(index)
            .ok_or_else(|| KernelError::NotFound(format!("plan step {index}")))?;

        if status_text.to_lowercase().starts_with("blocked") {
            step.status = crate::state::StepStatus::Blocked;
            return Ok(format!("step {index} blocked"));
        }
        step.status = crate::state::StepStatus::Done;
        Ok(format!("step {index} verified done"))
    }
}

/// Drives the Comparator's scoped dual-slot overlay: both files are
/// force-loaded into L1 even if their combined cost would otherwise
/// violate the budget, diffed at the line level, and the overlay is torn
/// down again before this call returns, leaving a pinned `RESOLVED_CODE`
/// artifact as the durable record.
pub struct CompareFiles;

#[async_trait]
impl ToolFn for CompareFiles {
    async fn call(&self, ctx: &mut ToolContext<'_>, target: &str) -> Result<String> {
        let mut paths = target.split(',').map(|s| s.trim());
        let a = paths.next().ok_or_else(|| KernelError::BadInput("compare_files needs two paths".to_string()))?;
        let b = paths.next().ok_or_else(|| KernelError::BadInput("compare_files needs two paths".to_string()))?;
        let content_a = read_file(ctx, a)?;
        let content_b = read_file(ctx, b)?;

        if !Comparator::load_pair(ctx.pager, a, &content_a, b, &content_b) {
            return Err(KernelError::CapacityExceeded(format!("{a} + {b} exceed L1 capacity even as an overlay")));
        }

        let lines_a: Vec<&str> = content_a.lines().collect();
        let lines_b: Vec<&str> = content_b.lines().collect();
        let added = lines_b.iter().filter(|l| !lines_a.contains(l)).count();
        let removed = lines_a.iter().filter(|l| !lines_b.contains(l)).count();
        let summary = format!("{a} vs {b}: +{added} -{removed} lines");

        Comparator::purge_pair(ctx.pager);

        if let Some(existing) = ctx.framework_state.artifacts.iter_mut().find(|art| art.identifier == "RESOLVED_CODE") {
            existing.summary = summary.clone();
        } else {
            ctx.framework_state.artifacts.push(Artifact::new("RESOLVED_CODE", summary.clone()));
        }
        ctx.pager.pin(artifact_page_id("RESOLVED_CODE"), format!("RESOLVED_CODE: {summary}"));

        Ok(summary)
    }
}

pub struct SwitchStrategy;

#[async_trait]
impl ToolFn for SwitchStrategy {
    async fn call(&self, ctx: &mut ToolContext<'_>, target: &str) -> Result<String> {
        ctx.framework_state.strategy = target.trim().to_string();
        Ok(format!("strategy switched to {}", target.trim()))
    }
}

pub struct SetAuditPolicy;

#[async_trait]
impl ToolFn for SetAuditPolicy {
    async fn call(&self, ctx: &mut ToolContext<'_>, target: &str) -> Result<String> {
        ctx.framework_state.audit_profile = target.trim().to_string();
        Ok(format!("audit profile set to {}", target.trim()))
    }
}

/// Enables a named policy at runtime, letting the model opt a registered
/// policy back in after it was disabled.
pub struct EnablePolicy;

#[async_trait]
impl ToolFn for EnablePolicy {
    async fn call(&self, ctx: &mut ToolContext<'_>, target: &str) -> Result<String> {
        let name = target.trim().to_string();
        if !ctx.framework_state.active_policy_names.iter().any(|n| n == &name) {
            ctx.framework_state.active_policy_names.push(name.clone());
        }
        Ok(format!("policy {name} enabled"))
    }
}

pub struct DisablePolicy;

#[async_trait]
impl ToolFn for DisablePolicy {
    async fn call(&self, ctx: &mut ToolContext<'_>, target: &str) -> Result<String> {
        let name = target.trim();
        ctx.framework_state.active_policy_names.retain(|n| n != name);
        Ok(format!("policy {name} disabled"))
    }
}

fn split_key_value(target: &str) -> Result<(String, String)> {
    target
        .split_once(':')
        .or_else(|| target.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .ok_or_else(|| KernelError::BadInput("target must be 'KEY: VALUE'".to_string()))
}

/// Evaluates a four-function arithmetic expression over `+ - * /`,
/// parentheses and decimal literals. Deliberately minimal: this exists to
/// keep arithmetic out of the model's hallucination-prone hands, not to be
/// a general expression language.
fn eval_arithmetic(expr: &str) -> Result<f64> {
    let tokens = tokenize_arithmetic(expr)?;
    let mut pos = 0;
    let value = parse_expr(&tokens, &mut pos)?;
    if pos != tokens.len() {
        return Err(KernelError::BadInput(format!("unexpected trailing input in '{expr}'")));
    }
    Ok(value)
}

#[derive(Debug, Clone, PartialEq)]
enum ArithToken {
    Num(f64),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
}

fn tokenize_arithmetic(expr: &str) -> Result<Vec<ArithToken>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = expr.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' => i += 1,
            '+' => {
                tokens.push(ArithToken::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(ArithToken::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(ArithToken::Star);
                i += 1;
            }
            '/' => {
                tokens.push(ArithToken::Slash);
                i += 1;
            }
            '(' => {
                tokens.push(ArithToken::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(ArithToken::RParen);
                i += 1;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let literal: String = chars[start..i].iter().collect();
                let num = literal
                    .parse::<f64>()
                    .map_err(|_| KernelError::BadInput(format!("invalid number '{literal}'")))?;
                tokens.push(ArithToken::Num(num));
            }
            _ => return Err(KernelError::BadInput(format!("unexpected character '{c}' in expression"))),
        }
    }
    Ok(tokens)
}

fn parse_expr(tokens: &[ArithToken], pos: &mut usize) -> Result<f64> {
    let mut value = parse_term(tokens, pos)?;
    loop {
        match tokens.get(*pos) {
            Some(ArithToken::Plus) => {
                *pos += 1;
                value += parse_term(tokens, pos)?;
            }
            Some(ArithToken::Minus) => {
                *pos += 1;
                value -= parse_term(tokens, pos)?;
            }
            _ => break,
        }
    }
    Ok(value)
}

fn parse_term(tokens: &[ArithToken], pos: &mut usize) -> Result<f64> {
    let mut value = parse_factor(tokens, pos)?;
    loop {
        match tokens.get(*pos) {
            Some(ArithToken::Star) => {
                *pos += 1;
                value *= parse_factor(tokens, pos)?;
            }
            Some(ArithToken::Slash) => {
                *pos += 1;
                let divisor = parse_factor(tokens, pos)?;
                if divisor == 0.0 {
                    return Err(KernelError::BadInput("division by zero".to_string()));
                }
                value /= divisor;
            }
            _ => break,
        }
    }
    Ok(value)
}

fn parse_factor(tokens: &[ArithToken], pos: &mut usize) -> Result<f64> {
    match tokens.get(*pos) {
        Some(ArithToken::Num(n)) => {
            *pos += 1;
            Ok(*n)
        }
        Some(ArithToken::Minus) => {
            *pos += 1;
            Ok(-parse_factor(tokens, pos)?)
        }
        Some(ArithToken::LParen) => {
            *pos += 1;
            let value = parse_expr(tokens, pos)?;
            match tokens.get(*pos) {
                Some(ArithToken::RParen) => {
                    *pos += 1;
                    Ok(value)
                }
                _ => Err(KernelError::BadInput("unbalanced parentheses".to_string())),
            }
        }
        _ => Err(KernelError::BadInput("expected a number or '('".to_string())),
    }
}
