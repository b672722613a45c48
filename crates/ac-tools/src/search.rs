//! Search tools — `Glob` (filename pattern matching) and `Grep` (content
//! search), both constrained to a workspace root the same way [`crate::file_ops`]
//! is. Neither mutates anything, so both are always concurrency-safe.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use walkdir::WalkDir;

use crate::file_ops::validate_path;

#[derive(Debug, Clone, Deserialize)]
pub struct GlobRequest {
    /// Glob pattern, e.g. `"**/*.rs"`.
    pub pattern: String,
    /// Directory to search from, relative to the workspace root.
    #[serde(default = "default_dot")]
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GrepRequest {
    /// Regex pattern to search file contents for.
    pub pattern: String,
    /// Directory (or single file) to search, relative to the workspace root.
    #[serde(default = "default_dot")]
    pub path: String,
    /// Only search files whose name matches this glob (e.g. `"*.rs"`).
    #[serde(default)]
    pub glob: Option<String>,
    #[serde(default)]
    pub case_insensitive: bool,
}

fn default_dot() -> String {
    ".".into()
}

#[derive(Debug, Clone, Serialize)]
pub struct GrepMatch {
    pub path: String,
    pub line_number: usize,
    pub line: String,
}

/// Walk `path` under the workspace root, returning every file whose
/// relative path matches `pattern`, sorted for deterministic output.
pub async fn glob_search(workspace_root: &Path, req: GlobRequest) -> Result<Value, String> {
    let root = validate_path(workspace_root, &req.path)?;
    let pattern = glob::Pattern::new(&req.pattern)
        .map_err(|e| format!("invalid glob pattern '{}': {e}", req.pattern))?;

    let mut matches: Vec<String> = Vec::new();
    for entry in WalkDir::new(&root).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(&root).unwrap_or(entry.path());
        if pattern.matches_path(rel) || pattern.matches(&rel.to_string_lossy()) {
            matches.push(rel.to_string_lossy().into_owned());
        }
    }
    matches.sort();

    Ok(serde_json::json!({
        "pattern": req.pattern,
        "matches": matches,
        "count": matches.len(),
    }))
}

/// Search file contents line-by-line for `pattern`, optionally restricted by
/// a filename glob. Returns matches in deterministic (path, then line
/// number) order. Binary files are skipped rather than erroring out.
pub async fn grep_search(workspace_root: &Path, req: GrepRequest) -> Result<Value, String> {
    let root = validate_path(workspace_root, &req.path)?;

    let mut builder = regex::RegexBuilder::new(&req.pattern);
    builder.case_insensitive(req.case_insensitive);
    let re = builder
        .build()
        .map_err(|e| format!("invalid regex pattern '{}': {e}", req.pattern))?;

    let name_filter = req
        .glob
        .as_deref()
        .map(glob::Pattern::new)
        .transpose()
        .map_err(|e| format!("invalid glob filter: {e}"))?;

    let files: Vec<PathBuf> = if root.is_file() {
        vec![root.clone()]
    } else {
        WalkDir::new(&root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .collect()
    };

    let mut matches: Vec<GrepMatch> = Vec::new();
    for file in files {
        if let Some(filter) = &name_filter {
            let name = file.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            if !filter.matches(&name) {
                continue;
            }
        }
        let Ok(content) = tokio::fs::read_to_string(&file).await else {
            continue; // not valid UTF-8 (likely binary); skip
        };
        let rel = file.strip_prefix(workspace_root.canonicalize().unwrap_or_else(|_| workspace_root.to_path_buf()))
            .unwrap_or(&file)
            .to_string_lossy()
            .into_owned();
        for (idx, line) in content.lines().enumerate() {
            if re.is_match(line) {
                matches.push(GrepMatch { path: rel.clone(), line_number: idx + 1, line: line.to_string() });
            }
        }
    }

    Ok(serde_json::json!({
        "pattern": req.pattern,
        "matches": matches,
        "count": matches.len(),
    }))
}
