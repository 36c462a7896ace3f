//! Directory walking shared by `list_files` and `search_in_files`.

use crate::error::ToolError;
use crate::sandbox::Workspace;
use globset::{Glob, GlobMatcher};
use ignore::WalkBuilder;
use std::path::{Path, PathBuf};

/// Directories never descended into.
pub const IGNORED_DIRS: &[&str] = &[
    ".agent-runtime",
    ".git",
    ".mypy_cache",
    ".pytest_cache",
    ".ruff_cache",
    ".venv",
    "__pycache__",
    "build",
    "dist",
    "node_modules",
    "target",
];

/// Matches a glob against either the relative path or the file name.
pub struct PathFilter {
    matcher: Option<GlobMatcher>,
}

impl PathFilter {
    pub fn new(pattern: Option<&str>) -> Result<Self, ToolError> {
        let matcher = match pattern {
            Some(p) => Some(
                Glob::new(p)
                    .map_err(|e| ToolError::Io(format!("invalid glob '{p}': {e}")))?
                    .compile_matcher(),
            ),
            None => None,
        };
        Ok(Self { matcher })
    }

    pub fn matches(&self, rel_path: &str) -> bool {
        let Some(matcher) = &self.matcher else {
            return true;
        };
        let base = rel_path.rsplit('/').next().unwrap_or(rel_path);
        matcher.is_match(rel_path) || matcher.is_match(base)
    }
}

/// Returns every regular file under `base`, sorted by relative path.
///
/// Ignore files (`.gitignore` and friends) are deliberately not consulted; only the
/// fixed [`IGNORED_DIRS`] list prunes the walk.
pub fn files_under(base: &Path) -> Vec<PathBuf> {
    let walker = WalkBuilder::new(base)
        .hidden(false)
        .ignore(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .parents(false)
        .sort_by_file_name(|a, b| a.cmp(b))
        .filter_entry(|entry| {
            let is_dir = entry.file_type().is_some_and(|t| t.is_dir());
            let name = entry.file_name().to_string_lossy();
            !(is_dir && entry.depth() > 0 && IGNORED_DIRS.contains(&&*name))
        })
        .build();

    let mut files: Vec<PathBuf> = walker
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_some_and(|t| t.is_file()))
        .filter(|entry| !entry.file_name().to_string_lossy().starts_with(".DS_Store"))
        .map(|entry| entry.into_path())
        .collect();
    files.sort();
    files
}

/// Resolves `raw` and lists the files it denotes: itself for a file, the walk for
/// a directory.
pub fn collect_files(
    workspace: &Workspace,
    raw: &str,
    filter: &PathFilter,
) -> Result<(PathBuf, Vec<(PathBuf, String)>), ToolError> {
    let base = workspace.resolve(raw)?;
    if !base.exists() {
        return Err(ToolError::PathDoesNotExist);
    }
    let candidates = if base.is_file() {
        vec![base.clone()]
    } else {
        files_under(&base)
    };
    let files = candidates
        .into_iter()
        .map(|path| {
            let rel = workspace.relative(&path);
            (path, rel)
        })
        .filter(|(_, rel)| filter.matches(rel))
        .collect();
    Ok((base, files))
}
