//! # Workspace Sandbox
//!
//! Every path a tool touches goes through [`Workspace::resolve`]. The check runs on
//! each call, so a path that becomes a symlink between calls is caught too.

use crate::error::ToolError;
use std::io;
use std::path::{Component, Path, PathBuf};

/// The project root that bounds all tool operations.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Creates a workspace rooted at the canonical form of `root`.
    pub fn new(root: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self {
            root: root.as_ref().canonicalize()?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves a tool-supplied path against the root.
    ///
    /// A blank path means the root itself. The path is normalized lexically first,
    /// then the deepest existing ancestor is canonicalized so that symlinks pointing
    /// out of the root are rejected as well. Dangling symlinks are rejected.
    pub fn resolve(&self, raw: &str) -> Result<PathBuf, ToolError> {
        let trimmed = raw.trim();
        let requested = if trimmed.is_empty() { "." } else { trimmed };
        let candidate = normalize(&self.root.join(requested));

        if !candidate.starts_with(&self.root) {
            return Err(ToolError::PathEscapesRoot);
        }

        // `symlink_metadata` sees dangling links, which `exists` would skip over.
        let mut existing = candidate.as_path();
        while existing.symlink_metadata().is_err() {
            match existing.parent() {
                Some(parent) => existing = parent,
                None => return Err(ToolError::PathEscapesRoot),
            }
        }
        let canonical = match existing.canonicalize() {
            Ok(canonical) => canonical,
            // A link whose target does not exist cannot be shown to stay inside.
            Err(_) if existing.is_symlink() => return Err(ToolError::PathEscapesRoot),
            Err(e) => return Err(e.into()),
        };
        if !canonical.starts_with(&self.root) {
            return Err(ToolError::PathEscapesRoot);
        }

        Ok(candidate)
    }

    /// Renders `path` relative to the root with forward slashes.
    pub fn relative(&self, path: &Path) -> String {
        let rel = path.strip_prefix(&self.root).unwrap_or(path);
        let parts: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        if parts.is_empty() {
            ".".to_string()
        } else {
            parts.join("/")
        }
    }
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}
