//! The layered JSON-parsing healer.
//!
//! Small models emit a proposal in a wide variety of almost-JSON shapes.
//! Each stage below is a typed parse attempt that either returns the
//! healed object or falls through to the next stage; [`heal`] runs them in
//! order and returns the first success.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};

/// The full, closed set of registered tool names. Used by the direct
/// tool-call-syntax stage so every Tool ABI entry is recognized
/// (`enable_policy`, `disable_policy`, `stage_multiple_artifacts`,
/// `query_sidecar`, `set_audit_policy`).
pub const KNOWN_TOOLS: &[&str] = &[
    "stage_context",
    "unstage_context",
    "save_artifact",
    "stage_artifact",
    "stage_multiple_artifacts",
    "delete_artifact",
    "query_sidecar",
    "edit_file",
    "write_file",
    "calculate",
    "verify_step",
    "compare_files",
    "switch_strategy",
    "set_audit_policy",
    "enable_policy",
    "disable_policy",
    "halt_and_ask",
];

static THINK_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<think>.*?</think>").unwrap());
static BALANCED_BLOCK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{").unwrap());
static TOOL_CALL_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)tool[ _]?call\s*[:=]\s*(.+)").unwrap());
static TARGET_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)target\s*[:=]\s*(.+)").unwrap());
static CONTENT_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)content\s*[:=]\s*(.+)").unwrap());
static CALL_SYNTAX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([a-z_]+)\s*\((.*)\)\s*$").unwrap());
static BARE_CALL_SYNTAX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([a-z_]+)\s+(.+)$").unwrap());

pub fn strip_hidden_reasoning_tags(text: &str) -> String {
    THINK_TAG.replace_all(text, "").trim().to_string()
}

pub fn try_direct_json_parse(text: &str) -> Option<Value> {
    serde_json::from_str(text.trim()).ok()
}

/// Extracts the first balanced `{...}` block, tolerating leading/trailing
/// prose around it.
pub fn extract_balanced_block(text: &str) -> Option<String> {
    let start = BALANCED_BLOCK.find(text)?.start();
    let bytes = text.as_bytes();
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape = false;
    for (offset, &b) in bytes[start..].iter().enumerate() {
        let c = b as char;
        if escape {
            escape = false;
            continue;
        }
        match c {
            '\\' if in_string => escape = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..start + offset + 1].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Normalizes Python-ish literal syntax into valid JSON: single quotes to
/// double, and `True`/`False`/`None` to `true`/`false`/`null`.
pub fn normalize_quotes_and_bools(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_double = false;
    for c in text.chars() {
        match c {
            '"' => {
                in_double = !in_double;
                out.push(c);
            }
            '\'' if !in_double => out.push('"'),
            _ => out.push(c),
        }
    }
    out.replace("True", "true")
        .replace("False", "false")
        .replace("None", "null")
}

/// Parses `TOOL CALL: ...`, `TARGET: ...`, `CONTENT: ...` prose lines,
/// merging `CONTENT` into `TARGET` as `<target>: <content>` the way the
/// original tool-call grammar expects (e.g. for `write_file`).
pub fn parse_keyvalue_prose(text: &str) -> Option<Value> {
    let tool_call = TOOL_CALL_LINE.captures(text)?.get(1)?.as_str().trim().to_string();
    let target = TARGET_LINE
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default();
    let content = CONTENT_LINE.captures(text).and_then(|c| c.get(1)).map(|m| m.as_str().trim().to_string());

    let merged_target = match content {
        Some(content) if !target.is_empty() => format!("{target}: {content}"),
        Some(content) => content,
        None => target,
    };

    Some(json!({
        "thought_process": "healed from key/value prose",
        "tool_call": tool_call,
        "target": merged_target,
    }))
}

/// Recognizes direct tool-call syntax: `tool(arg)` or `tool arg`.
pub fn parse_direct_tool_call(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Some(caps) = CALL_SYNTAX.captures(trimmed) {
        let tool = caps.get(1)?.as_str();
        if KNOWN_TOOLS.contains(&tool) {
            let arg = caps.get(2).map(|m| m.as_str()).unwrap_or("").trim_matches(|c| c == '"' || c == '\'');
            return Some(json!({
                "thought_process": "healed from direct call syntax",
                "tool_call": tool,
                "target": arg,
            }));
        }
    }
    if let Some(caps) = BARE_CALL_SYNTAX.captures(trimmed) {
        let tool = caps.get(1)?.as_str();
        if KNOWN_TOOLS.contains(&tool) {
            let arg = caps.get(2).map(|m| m.as_str()).unwrap_or("").trim();
            return Some(json!({
                "thought_process": "healed from bare call syntax",
                "tool_call": tool,
                "target": arg,
            }));
        }
    }
    None
}

/// Runs every healing stage in order and returns the first success.
pub fn heal(raw: &str) -> Option<Value> {
    let stripped = strip_hidden_reasoning_tags(raw);

    if let Some(v) = try_direct_json_parse(&stripped) {
        return Some(v);
    }

    if let Some(block) = extract_balanced_block(&stripped) {
        if let Some(v) = try_direct_json_parse(&block) {
            return Some(v);
        }
        let normalized = normalize_quotes_and_bools(&block);
        if let Some(v) = try_direct_json_parse(&normalized) {
            return Some(v);
        }
    }

    if let Some(v) = parse_keyvalue_prose(&stripped) {
        return Some(v);
    }

    if let Some(v) = parse_direct_tool_call(&stripped) {
        return Some(v);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heals_direct_json() {
        let v = heal(r#"{"tool_call": "halt_and_ask", "target": "done", "thought_process": "x"}"#).unwrap();
        assert_eq!(v["tool_call"], "halt_and_ask");
    }

    #[test]
    fn heals_json_wrapped_in_prose_with_single_quotes_and_python_literals() {
        let raw = "Sure, here you go: {'tool_call': 'stage_context', 'target': 'a.py', 'thought_process': 'go', 'done': None} thanks";
        let v = heal(raw).unwrap();
        assert_eq!(v["tool_call"], "stage_context");
        assert_eq!(v["done"], Value::Null);
    }

    #[test]
    fn heals_hidden_reasoning_tags() {
        let raw = "<think>long internal monologue {not json}</think>{\"tool_call\": \"halt_and_ask\", \"target\": \"x\", \"thought_process\": \"y\"}";
        let v = heal(raw).unwrap();
        assert_eq!(v["tool_call"], "halt_and_ask");
    }

    #[test]
    fn heals_keyvalue_prose_merging_content_into_target() {
        let raw = "TOOL CALL: write_file\nTARGET: notes.md\nCONTENT: hello world";
        let v = heal(raw).unwrap();
        assert_eq!(v["tool_call"], "write_file");
        assert_eq!(v["target"], "notes.md: hello world");
    }

    #[test]
    fn heals_direct_call_syntax() {
        let v = heal("unstage_context(ALL)").unwrap();
        assert_eq!(v["tool_call"], "unstage_context");
        assert_eq!(v["target"], "ALL");
    }

    #[test]
    fn heals_bare_call_syntax_for_every_known_tool() {
        // Regression coverage: these tool names need bare-call recognition
        // alongside the rest of the known-tool set.
        for tool in ["enable_policy", "disable_policy", "query_sidecar", "set_audit_policy"] {
            let raw = format!("{tool} something");
            let v = heal(&raw).unwrap();
            assert_eq!(v["tool_call"], tool);
        }
    }

    #[test]
    fn returns_none_when_nothing_parses() {
        assert!(heal("completely unstructured nonsense with no markers").is_none());
    }
}
