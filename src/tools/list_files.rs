use super::args::{int_arg, optional_str};
use super::walk::{PathFilter, collect_files};
use super::{Args, FileListing, Tool, ToolDefinition, ToolOutput};
use crate::error::ToolError;
use crate::sandbox::Workspace;
use serde_json::json;

const DEFAULT_LIMIT: i64 = 200;
const MAX_LIMIT: i64 = 1000;

pub struct ListFilesTool;

impl Tool for ListFilesTool {
    fn name(&self) -> &'static str {
        "list_files"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name(),
            description: "List files in the project recursively. Build, cache, dependency and VCS directories are skipped.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Directory or file relative to the project root. Defaults to the root."
                    },
                    "glob": {
                        "type": "string",
                        "description": "Optional glob matched against the relative path or the file name, e.g. *.rs"
                    },
                    "limit": {
                        "type": "integer",
                        "description": "Maximum number of files to return (1-1000, default 200)."
                    }
                }
            }),
        }
    }

    fn execute(&self, args: &Args, workspace: &Workspace) -> Result<ToolOutput, ToolError> {
        let raw = optional_str(args, "path").unwrap_or(".");
        let limit = int_arg(args, "limit", DEFAULT_LIMIT, 1, MAX_LIMIT)? as usize;
        let filter = PathFilter::new(optional_str(args, "glob"))?;

        let (base, files) = collect_files(workspace, raw, &filter)?;
        let truncated = files.len() > limit;
        let files = files.into_iter().take(limit).map(|(_, rel)| rel).collect();

        Ok(ToolOutput::Files(FileListing {
            path: workspace.relative(&base),
            files,
            truncated,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::Builder;

    fn setup_test_dir() -> (tempfile::TempDir, Workspace) {
        let tmp_dir = Builder::new().prefix("test-list-files").tempdir().unwrap();
        let root = tmp_dir.path();
        fs::write(root.join("b.txt"), "b").unwrap();
        fs::write(root.join("a.txt"), "a").unwrap();
        fs::create_dir_all(root.join("src/nested")).unwrap();
        fs::write(root.join("src/lib.rs"), "").unwrap();
        fs::write(root.join("src/nested/mod.rs"), "").unwrap();
        fs::create_dir_all(root.join("node_modules/pkg")).unwrap();
        fs::write(root.join("node_modules/pkg/index.js"), "").unwrap();
        fs::create_dir_all(root.join(".git")).unwrap();
        fs::write(root.join(".git/HEAD"), "ref").unwrap();
        fs::write(root.join(".DS_Store"), "").unwrap();
        let workspace = Workspace::new(root).unwrap();
        (tmp_dir, workspace)
    }

    fn list(workspace: &Workspace, args: serde_json::Value) -> Result<FileListing, ToolError> {
        match ListFilesTool.execute(args.as_object().unwrap(), workspace)? {
            ToolOutput::Files(listing) => Ok(listing),
            other => panic!("unexpected output: {other:?}"),
        }
    }

    #[test]
    fn test_lists_sorted_and_skips_ignored_dirs() {
        let (_tmp_dir, ws) = setup_test_dir();
        let listing = list(&ws, json!({})).unwrap();
        assert_eq!(
            listing.files,
            vec!["a.txt", "b.txt", "src/lib.rs", "src/nested/mod.rs"]
        );
        assert!(!listing.truncated);
        assert_eq!(listing.path, ".");
    }

    #[test]
    fn test_glob_and_limit() {
        let (_tmp_dir, ws) = setup_test_dir();
        let listing = list(&ws, json!({"glob": "*.rs"})).unwrap();
        assert_eq!(listing.files, vec!["src/lib.rs", "src/nested/mod.rs"]);

        let listing = list(&ws, json!({"limit": 1})).unwrap();
        assert_eq!(listing.files, vec!["a.txt"]);
        assert!(listing.truncated);
    }

    #[test]
    fn test_file_path_lists_itself() {
        let (_tmp_dir, ws) = setup_test_dir();
        let listing = list(&ws, json!({"path": "src/lib.rs"})).unwrap();
        assert_eq!(listing.files, vec!["src/lib.rs"]);
    }

    #[test]
    fn test_missing_and_escaping_paths() {
        let (_tmp_dir, ws) = setup_test_dir();
        assert_eq!(
            list(&ws, json!({"path": "nope"})).unwrap_err(),
            ToolError::PathDoesNotExist
        );
        assert_eq!(
            list(&ws, json!({"path": "../../etc/passwd"})).unwrap_err(),
            ToolError::PathEscapesRoot
        );
    }
}
