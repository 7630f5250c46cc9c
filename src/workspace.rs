//! The workspace scanner: enumerates the
//! file-system roots the Session is allowed to see. Classes/functions/
//! imports extraction is a best-effort textual scan, not a real parser;
//! it exists only to give the Session and Proposer a shape to consume.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

const VENDOR_DIR_NAMES: &[&str] = &[
    "node_modules",
    "target",
    "vendor",
    "dist",
    "build",
    ".venv",
    "venv",
    "__pycache__",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionInfo {
    pub name: String,
    pub args: Vec<String>,
    pub line_start: usize,
    pub line_end: usize,
    pub docstring: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassInfo {
    pub name: String,
    pub line_start: usize,
    pub line_end: usize,
    pub methods: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannedFile {
    pub path: String,
    pub classes: Vec<ClassInfo>,
    pub functions: Vec<FunctionInfo>,
    pub imports: Vec<String>,
}

fn is_vendor_or_hidden(entry: &Path) -> bool {
    entry
        .file_name()
        .and_then(|n| n.to_str())
        .map(|name| name.starts_with('.') || VENDOR_DIR_NAMES.contains(&name))
        .unwrap_or(false)
}

/// Enumerates every regular file reachable under `roots`, skipping
/// vendor/hidden directories by default.
pub fn scan(roots: &[PathBuf]) -> Vec<ScannedFile> {
    let mut out = Vec::new();
    for root in roots {
        walk(root, &mut out);
    }
    out
}

fn walk(dir: &Path, out: &mut Vec<ScannedFile>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if is_vendor_or_hidden(&path) {
            continue;
        }
        if path.is_dir() {
            walk(&path, out);
        } else if path.is_file() {
            if let Ok(content) = std::fs::read_to_string(&path) {
                out.push(analyze_file(&path, &content));
            }
        }
    }
}

fn analyze_file(path: &Path, content: &str) -> ScannedFile {
    let mut functions = Vec::new();
    let mut classes = Vec::new();
    let mut imports = Vec::new();

    for (idx, line) in content.lines().enumerate() {
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix("def ") {
            if let Some((name, _)) = rest.split_once('(') {
                functions.push(FunctionInfo {
                    name: name.trim().to_string(),
                    args: Vec::new(),
                    line_start: idx + 1,
                    line_end: idx + 1,
                    docstring: None,
                });
            }
        } else if let Some(rest) = trimmed.strip_prefix("fn ") {
            if let Some((name, _)) = rest.split_once('(') {
                functions.push(FunctionInfo {
                    name: name.trim().to_string(),
                    args: Vec::new(),
                    line_start: idx + 1,
                    line_end: idx + 1,
                    docstring: None,
                });
            }
        } else if let Some(rest) = trimmed.strip_prefix("class ") {
            let name = rest
                .split(|c: char| c == '(' || c == ':')
                .next()
                .unwrap_or(rest)
                .trim()
                .to_string();
            classes.push(ClassInfo {
                name,
                line_start: idx + 1,
                line_end: idx + 1,
                methods: Vec::new(),
            });
        } else if trimmed.starts_with("import ") || trimmed.starts_with("use ") || trimmed.starts_with("from ") {
            imports.push(trimmed.to_string());
        }
    }

    ScannedFile {
        path: path.display().to_string(),
        classes,
        functions,
        imports,
    }
}

/// `symbolLookup`: the source slice of `symbolName` within `file`, for the
/// optional "contextual grep" stage syntax `path?query=symbol`.
pub fn symbol_lookup(file: &ScannedFile, content: &str, symbol_name: &str) -> Option<String> {
    let lines: Vec<&str> = content.lines().collect();
    for func in &file.functions {
        if func.name == symbol_name {
            let end = func.line_end.max(func.line_start).min(lines.len());
            return Some(lines[func.line_start.saturating_sub(1)..end].join("\n"));
        }
    }
    for class in &file.classes {
        if class.name == symbol_name {
            let end = class.line_end.max(class.line_start).min(lines.len());
            return Some(lines[class.line_start.saturating_sub(1)..end].join("\n"));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn scan_skips_vendor_and_hidden_dirs() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("node_modules")).unwrap();
        fs::write(dir.path().join("node_modules/junk.txt"), "junk").unwrap();
        fs::write(dir.path().join("real.txt"), "real").unwrap();

        let files = scan(&[dir.path().to_path_buf()]);
        assert!(files.iter().any(|f| f.path.ends_with("real.txt")));
        assert!(!files.iter().any(|f| f.path.contains("node_modules")));
    }

    #[test]
    fn analyze_file_detects_functions_and_imports() {
        let content = "import os\ndef foo(x):\n    return x\n";
        let scanned = analyze_file(Path::new("a.py"), content);
        assert_eq!(scanned.functions.len(), 1);
        assert_eq!(scanned.functions[0].name, "foo");
        assert_eq!(scanned.imports.len(), 1);
    }
}
