//! Search power tools: `glob`, `grep` and `semantic_search`
//!
//! File enumeration goes through the `glob` crate; generated and vendored
//! directories are skipped.

use std::cmp::Reverse;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::spec::{
    ToolContext, ToolError, ToolResult, ToolSpec, optional_bool, optional_str, optional_u64,
    required_str,
};

/// Maximum number of results to return to avoid overwhelming output
const MAX_RESULTS: usize = 100;

/// Maximum file size to search (skip large binaries)
const MAX_FILE_SIZE: u64 = 10 * 1024 * 1024; // 10MB

const MAX_GLOB_RESULTS: usize = 500;

const EXCLUDED_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "target",
    "dist",
    "build",
    "__pycache__",
    ".venv",
    "venv",
];

/// Workspace files matching `pattern`, relative to the workspace, sorted.
fn glob_files(root: &Path, pattern: &str) -> Result<Vec<PathBuf>, ToolError> {
    let full = root.join(pattern);
    let full = full.to_string_lossy();
    let entries = glob::glob(&full)
        .map_err(|e| ToolError::invalid_input(format!("Invalid glob pattern: {e}")))?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .filter(|path| path.is_file())
        .filter(|path| {
            let relative = path.strip_prefix(root).unwrap_or(path);
            !relative.components().any(|c| {
                c.as_os_str()
                    .to_str()
                    .is_some_and(|name| EXCLUDED_DIRS.contains(&name))
            })
        })
        .collect();
    files.sort();
    Ok(files)
}

fn relative_display(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

fn read_text(path: &Path) -> Option<String> {
    let metadata = fs::metadata(path).ok()?;
    if metadata.len() > MAX_FILE_SIZE {
        return None;
    }
    fs::read_to_string(path).ok()
}

// === GlobTool ===

pub struct GlobTool;

#[async_trait]
impl ToolSpec for GlobTool {
    fn name(&self) -> &'static str {
        "glob"
    }

    fn description(&self) -> &'static str {
        "List project files matching a glob pattern such as 'src/**/*.rs'."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Glob pattern relative to the project root"
                }
            },
            "required": ["pattern"]
        })
    }

    async fn execute(&self, input: Value, context: &ToolContext) -> Result<ToolResult, ToolError> {
        let pattern = required_str(&input, "pattern")?;
        let root = context.resolve_path(".")?;
        let files = glob_files(&root, pattern)?;

        if files.is_empty() {
            return Ok(ToolResult::success(format!("No files match '{pattern}'")));
        }
        let total = files.len();
        let mut listing: Vec<String> = files
            .iter()
            .take(MAX_GLOB_RESULTS)
            .map(|path| relative_display(&root, path))
            .collect();
        if total > MAX_GLOB_RESULTS {
            listing.push(format!("... {} more", total - MAX_GLOB_RESULTS));
        }
        Ok(ToolResult::success(listing.join("\n")))
    }
}

// === GrepTool ===

/// Result of a grep match
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrepMatch {
    pub file: String,
    pub line_number: usize,
    pub line: String,
    pub context_before: Vec<String>,
    pub context_after: Vec<String>,
}

/// Tool for searching files using regex patterns
pub struct GrepTool;

#[async_trait]
impl ToolSpec for GrepTool {
    fn name(&self) -> &'static str {
        "grep"
    }

    fn description(&self) -> &'static str {
        "Search for a regex pattern in project files. Returns matching lines with context."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Regular expression pattern to search for"
                },
                "file_pattern": {
                    "type": "string",
                    "description": "Glob selecting the files to search (default: **/*)"
                },
                "context_lines": {
                    "type": "integer",
                    "description": "Number of context lines before and after each match (default: 2)"
                },
                "case_insensitive": {
                    "type": "boolean",
                    "description": "Whether to perform case-insensitive matching (default: false)"
                },
                "max_results": {
                    "type": "integer",
                    "description": "Maximum number of results to return (default: 100)"
                }
            },
            "required": ["pattern"]
        })
    }

    async fn execute(&self, input: Value, context: &ToolContext) -> Result<ToolResult, ToolError> {
        let pattern_str = required_str(&input, "pattern")?;
        let file_pattern = optional_str(&input, "file_pattern").unwrap_or("**/*");
        let context_lines =
            usize::try_from(optional_u64(&input, "context_lines", 2)).unwrap_or(usize::MAX);
        let case_insensitive = optional_bool(&input, "case_insensitive", false);
        let max_results = usize::try_from(optional_u64(&input, "max_results", MAX_RESULTS as u64))
            .unwrap_or(MAX_RESULTS);

        let regex_pattern = if case_insensitive {
            format!("(?i){pattern_str}")
        } else {
            pattern_str.to_string()
        };
        let regex = Regex::new(&regex_pattern)
            .map_err(|e| ToolError::invalid_input(format!("Invalid regex pattern: {e}")))?;

        let root = context.resolve_path(".")?;
        let files = glob_files(&root, file_pattern)?;

        let mut results: Vec<GrepMatch> = Vec::new();
        let mut files_searched = 0;
        let mut total_matches = 0;

        for file_path in files {
            if context.cancel.is_cancelled() {
                return Err(ToolError::Cancelled);
            }
            let Some(file_content) = read_text(&file_path) else {
                continue;
            };
            files_searched += 1;
            let lines: Vec<&str> = file_content.lines().collect();

            for (line_idx, line) in lines.iter().enumerate() {
                if !regex.is_match(line) {
                    continue;
                }
                total_matches += 1;
                if results.len() >= max_results {
                    continue;
                }

                let context_before: Vec<String> = lines
                    [line_idx.saturating_sub(context_lines)..line_idx]
                    .iter()
                    .map(|s| (*s).to_string())
                    .collect();
                let after_end = line_idx.saturating_add(context_lines).min(lines.len() - 1);
                let context_after: Vec<String> = lines[line_idx + 1..=after_end]
                    .iter()
                    .map(|s| (*s).to_string())
                    .collect();

                results.push(GrepMatch {
                    file: relative_display(&root, &file_path),
                    line_number: line_idx + 1,
                    line: (*line).to_string(),
                    context_before,
                    context_after,
                });
            }
        }

        let result = json!({
            "matches": results,
            "total_matches": total_matches,
            "files_searched": files_searched,
            "truncated": total_matches > max_results,
        });
        ToolResult::json(&result).map_err(|e| ToolError::execution_failed(e.to_string()))
    }
}

// === SemanticSearchTool ===

/// Ranks files by how many of the query's terms they contain.
pub struct SemanticSearchTool;

const SNIPPETS_PER_FILE: usize = 3;

fn query_terms(query: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    query
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .map(str::to_lowercase)
        .filter(|term| term.len() >= 2)
        .filter(|term| seen.insert(term.clone()))
        .collect()
}

#[derive(Debug, Serialize)]
struct SemanticHit {
    file: String,
    score: usize,
    snippets: Vec<String>,
}

fn score_file(relative: &str, content: &str, terms: &[String]) -> Option<SemanticHit> {
    let lower = content.to_lowercase();
    let path_lower = relative.to_lowercase();

    let mut score = 0;
    let mut matched_terms = 0;
    for term in terms {
        let hits = lower.matches(term.as_str()).count();
        if hits > 0 {
            matched_terms += 1;
        }
        score += hits.min(20);
        if path_lower.contains(term.as_str()) {
            score += 10;
            matched_terms += usize::from(hits == 0);
        }
    }
    if matched_terms == 0 {
        return None;
    }
    // Files covering more distinct terms outrank repeated single-term hits.
    score += matched_terms * 25;

    let snippets = content
        .lines()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.to_lowercase();
            terms.iter().any(|t| line.contains(t.as_str()))
        })
        .take(SNIPPETS_PER_FILE)
        .map(|(i, line)| format!("{}: {}", i + 1, line.trim()))
        .collect();

    Some(SemanticHit {
        file: relative.to_string(),
        score,
        snippets,
    })
}

#[async_trait]
impl ToolSpec for SemanticSearchTool {
    fn name(&self) -> &'static str {
        "semantic_search"
    }

    fn description(&self) -> &'static str {
        "Find the project files most relevant to a natural-language query."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "What to look for, in words or identifiers"
                },
                "file_pattern": {
                    "type": "string",
                    "description": "Glob restricting the files considered (default: **/*)"
                },
                "max_results": {
                    "type": "integer",
                    "description": "Maximum number of files to return (default: 10)"
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, input: Value, context: &ToolContext) -> Result<ToolResult, ToolError> {
        let query = required_str(&input, "query")?;
        let file_pattern = optional_str(&input, "file_pattern").unwrap_or("**/*");
        let max_results = usize::try_from(optional_u64(&input, "max_results", 10)).unwrap_or(10);

        let terms = query_terms(query);
        if terms.is_empty() {
            return Err(ToolError::invalid_input("query has no searchable terms"));
        }

        let root = context.resolve_path(".")?;
        let mut hits: Vec<SemanticHit> = Vec::new();
        for path in glob_files(&root, file_pattern)? {
            if context.cancel.is_cancelled() {
                return Err(ToolError::Cancelled);
            }
            let Some(content) = read_text(&path) else {
                continue;
            };
            if let Some(hit) = score_file(&relative_display(&root, &path), &content, &terms) {
                hits.push(hit);
            }
        }

        hits.sort_by_key(|hit| (Reverse(hit.score), hit.file.clone()));
        hits.truncate(max_results);
        if hits.is_empty() {
            return Ok(ToolResult::success(format!("No files relevant to '{query}'")));
        }
        ToolResult::json(&hits).map_err(|e| ToolError::execution_failed(e.to_string()))
    }
}

// === Unit Tests ===
