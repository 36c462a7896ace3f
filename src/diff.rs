use similar::TextDiff;

const CONTEXT_LINES: usize = 3;
const DEV_NULL: &str = "/dev/null";

/// Renders a unified diff for one file.
///
/// `None` on either side means the file is absent there, which is shown with the
/// `/dev/null` header. Identical contents produce an empty string. Creating or
/// deleting an empty file has no lines to show, so only the headers are rendered.
pub fn unified_diff(rel_path: &str, before: Option<&str>, after: Option<&str>) -> String {
    let old = before.unwrap_or_default();
    let new = after.unwrap_or_default();
    let existence_changed = before.is_some() != after.is_some();
    if old == new && !existence_changed {
        return String::new();
    }

    let from = match before {
        Some(_) => format!("a/{rel_path}"),
        None => DEV_NULL.to_string(),
    };
    let to = match after {
        Some(_) => format!("b/{rel_path}"),
        None => DEV_NULL.to_string(),
    };
    if old == new {
        return format!("--- {from}\n+++ {to}\n");
    }

    TextDiff::from_lines(old, new)
        .unified_diff()
        .context_radius(CONTEXT_LINES)
        .header(&from, &to)
        .to_string()
}

/// Counts added and removed lines, ignoring file and hunk headers.
pub fn count_changes(diff: &str) -> (usize, usize) {
    let mut added = 0;
    let mut removed = 0;
    for line in diff.lines() {
        if line.starts_with("+++") || line.starts_with("---") || line.starts_with("@@") {
            continue;
        }
        if line.starts_with('+') {
            added += 1;
        } else if line.starts_with('-') {
            removed += 1;
        }
    }
    (added, removed)
}
