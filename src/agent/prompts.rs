//! Prompt texts and the summaries built from tool results.

use super::ToolResult;
use super::changes::PendingChange;
use super::parse::Action;
use crate::diff::count_changes;
use crate::llm::{ChatMessage, Role};
use crate::tools::{ToolDefinition, ToolOutput};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are Agent, a local coding assistant. \
You can inspect and update files only with the provided tools. \
First gather context with list/read/search tools, then apply focused edits. \
Do not replace whole existing files when a targeted edit is sufficient. \
Prefer replace_in_file for updates to existing files. \
Prefer minimal safe changes. \
After tools are done, answer with a concise summary.";

pub const FALLBACK_NOTE: &str =
    "[agent mode fallback: tool calling is not supported by the current model payload format]";

pub const REPAIR_NUDGE: &str = "Your previous response had no file-changing actions. \
Now include at least one write_file/replace_in_file/delete_file action.";

pub const UNMET_CHANGES_WARNING: &str = "[Warning: no files were changed. \
Describe a targeted edit or allow a rewrite of a specific file.]";

pub const FALLBACK_UNMET_CHANGES_WARNING: &str = "[Warning: fallback mode could not change any files. \
Try asking for a targeted replace of a specific fragment.]";

const OBSERVATION_BUDGET: usize = 2600;
const DEFAULT_TITLE: &str = "Agent session";
const TITLE_MAX_CHARS: usize = 52;
const PENDING_PREVIEW: usize = 8;

static REASONING_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?is)<think\b[^>]*>.*?</think>",
        r"(?is)<analysis\b[^>]*>.*?</analysis>",
        r"(?is)```(?:thinking|reasoning|analysis)[\w -]*\n.*?```",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("Invalid regex"))
    .collect()
});
static BLANK_RUN_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").expect("Invalid regex"));
static WHITESPACE_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("Invalid regex"));

/// Title for a chat created from its first message.
pub fn chat_title(message: &str) -> String {
    let clean = WHITESPACE_REGEX.replace_all(message.trim(), " ");
    if clean.is_empty() {
        return DEFAULT_TITLE.to_string();
    }
    if clean.chars().count() > TITLE_MAX_CHARS {
        let head: String = clean.chars().take(TITLE_MAX_CHARS - 3).collect();
        return format!("{}...", head.trim_end());
    }
    clean.into_owned()
}

/// Removes model reasoning blocks from assistant text.
pub fn strip_reasoning(text: &str) -> String {
    let mut out = text.to_string();
    for pattern in REASONING_PATTERNS.iter() {
        out = pattern.replace_all(&out, "").into_owned();
    }
    BLANK_RUN_REGEX.replace_all(&out, "\n\n").trim().to_string()
}

/// Keeps the last `limit` user and assistant turns with non-empty,
/// reasoning-free content.
pub fn normalize_history(messages: &[ChatMessage], limit: usize) -> Vec<ChatMessage> {
    let turns: Vec<ChatMessage> = messages
        .iter()
        .filter(|m| matches!(m.role, Role::User | Role::Assistant))
        .filter_map(|m| {
            let content = match m.role {
                Role::Assistant => strip_reasoning(&m.content),
                _ => m.content.trim().to_string(),
            };
            (!content.is_empty()).then(|| ChatMessage::new(m.role, content))
        })
        .collect();
    let skip = turns.len().saturating_sub(limit);
    turns[skip..].to_vec()
}

fn history_block(history: &[ChatMessage], turns: usize, max_chars: usize) -> String {
    let skip = history.len().saturating_sub(turns);
    let lines: Vec<String> = history[skip..]
        .iter()
        .filter(|m| !m.content.trim().is_empty())
        .map(|m| {
            let label = if m.role == Role::User { "User" } else { "Agent" };
            format!("{label}: {}", clip(m.content.trim(), max_chars))
        })
        .collect();
    if lines.is_empty() {
        String::new()
    } else {
        format!("Conversation context:\n{}\n\n", lines.join("\n"))
    }
}

fn action_schema(tools: &[ToolDefinition]) -> String {
    let names: Vec<&str> = tools.iter().map(|t| t.name).collect();
    format!(
        "{{\n  \"actions\": [\n    {{\n      \"tool\": \"{}\",\n      \"args\": {{ ... }}\n    }}\n  ]\n}}",
        names.join("|")
    )
}

fn tool_catalog(tools: &[ToolDefinition]) -> String {
    tools
        .iter()
        .map(|tool| {
            let required: Vec<&str> = tool.parameters["required"]
                .as_array()
                .map(|r| r.iter().filter_map(Value::as_str).collect())
                .unwrap_or_default();
            let params: Vec<String> = tool.parameters["properties"]
                .as_object()
                .map(|props| {
                    props
                        .keys()
                        .map(|key| {
                            if required.contains(&key.as_str()) {
                                key.clone()
                            } else {
                                format!("{key}?")
                            }
                        })
                        .collect()
                })
                .unwrap_or_default();
            format!("- {}({}): {}", tool.name, params.join(", "), tool.description)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// First prompt of the text protocol, used when native tool calling is
/// unavailable.
pub fn fallback_prompt(task: &str, history: &[ChatMessage], tools: &[ToolDefinition]) -> String {
    format!(
        "Tool calling is unavailable. Respond ONLY with JSON actions.\n\
Do not ask the user to run commands manually.\n\
If request is unclear, first call list_files with path='.'.\n\
For existing files, prefer replace_in_file over write_file.\n\
Tools:\n{catalog}\n\
Schema:\n{schema}\n\
Examples:\n\
- user: \"what files are there?\" -> {{\"actions\":[{{\"tool\":\"list_files\",\"args\":{{\"path\":\".\",\"limit\":200}}}}]}}\n\
- user: \"read README.md\" -> {{\"actions\":[{{\"tool\":\"read_file\",\"args\":{{\"path\":\"README.md\"}}}}]}}\n\
- user: \"find TODO\" -> {{\"actions\":[{{\"tool\":\"search_in_files\",\"args\":{{\"query\":\"TODO\",\"path\":\".\"}}}}]}}\n\
No markdown, no explanations.\n\n\
{history}User task:\n{task}",
        catalog = tool_catalog(tools),
        schema = action_schema(tools),
        history = history_block(history, 8, 400),
    )
}

/// Follow-up prompt after an attempt that did not finish the task.
pub fn repair_prompt(
    task: &str,
    history: &[ChatMessage],
    previous_actions: &[Action],
    results: &[ToolResult],
    tools: &[ToolDefinition],
) -> String {
    let errors: Vec<String> = results
        .iter()
        .filter(|r| !r.ok)
        .map(|r| format!("- {}: {}", r.name, r.error.as_deref().unwrap_or("unknown error")))
        .collect();
    let errors = if errors.is_empty() {
        "- none".to_string()
    } else {
        errors.join("\n")
    };
    let observations = observations(results);
    let observations = if observations.is_empty() {
        "- none".to_string()
    } else {
        observations
    };
    let actions = serde_json::to_string(previous_actions).unwrap_or_else(|_| "[]".to_string());

    format!(
        "Previous tool plan did not finish the task. Return corrected JSON actions only.\n\
Rules:\n\
1) For replace_in_file, always provide path/find/replace.\n\
2) If you do not know exact text, first call read_file(path=...) and then write_file/replace_in_file.\n\
3) Do not ask user for manual terminal commands.\n\
4) Keep actions minimal and executable.\n\
5) Do not overwrite existing non-empty files with write_file unless explicitly needed.\n\
6) If task asks for code changes/tests/refactor/fix, include write_file/replace_in_file/delete_file actions.\n\n\
{history}\
Original user task:\n{task}\n\n\
Previous actions:\n{actions}\n\n\
Tool errors:\n{errors}\n\n\
Tool observations:\n{observations}\n\n\
If there are no tool errors but no file edits yet, continue with next actions using the observed file content.\n\n\
Response schema:\n{schema}\n\
No markdown, no explanations.",
        history = history_block(history, 6, 300),
        schema = action_schema(tools),
    )
}

/// Compact rendering of tool results for the repair prompt, within a fixed
/// character budget.
pub fn observations(results: &[ToolResult]) -> String {
    let mut budget = OBSERVATION_BUDGET;
    let mut chunks = Vec::new();
    for result in results {
        if budget == 0 {
            break;
        }
        let chunk = match (&result.result, &result.error) {
            (_, Some(error)) if !result.ok => format!("- {}: error: {error}\n", result.name),
            (Some(ToolOutput::Content(file)), _) => {
                format!("- read_file {}:\n{}\n", file.path, clip(&file.content, 900))
            }
            (Some(ToolOutput::Files(listing)), _) => {
                let preview: Vec<&str> = listing.files.iter().take(40).map(String::as_str).collect();
                format!("- list_files:\n{}\n", preview.join("\n"))
            }
            (Some(ToolOutput::Matches(report)), _) => {
                let rows: Vec<String> = report
                    .matches
                    .iter()
                    .take(20)
                    .map(|m| format!("{}:{}: {}", m.path, m.line, m.text.trim()))
                    .collect();
                format!("- search_in_files:\n{}\n", rows.join("\n"))
            }
            (Some(output), _) => {
                let compact = serde_json::to_string(output).unwrap_or_default();
                format!("- {}: {}\n", result.name, clip(&compact, 500))
            }
            (None, _) => format!("- {}: ok\n", result.name),
        };
        let chunk = clip(&chunk, budget);
        budget = budget.saturating_sub(chunk.chars().count());
        chunks.push(chunk.trim_end_matches('\n').to_string());
    }
    chunks.join("\n").trim().to_string()
}

/// Human-readable digest of the tools run by the text protocol.
pub fn summarize_tool_results(results: &[ToolResult]) -> String {
    let mut lines = vec!["Tools executed (fallback mode):".to_string()];
    for result in results {
        let name = &result.name;
        if !result.ok {
            let error = result.error.as_deref().unwrap_or("unknown error");
            lines.push(format!("- {name}: error: {error}"));
            continue;
        }
        match &result.result {
            Some(ToolOutput::Mutation(report)) if !report.applied => {
                let (added, removed) = count_changes(report.diff.as_deref().unwrap_or_default());
                if report.changed {
                    lines.push(format!("- {name}: pending {} (+{added} -{removed})", report.path));
                } else {
                    lines.push(format!("- {name}: no changes for {}", report.path));
                }
            }
            Some(ToolOutput::Mutation(report)) if report.changed => {
                lines.push(format!("- {name}: changed {}", report.path));
            }
            Some(ToolOutput::Files(listing)) => {
                lines.push(format!("- list_files: found {} files", listing.files.len()));
                lines.extend(listing.files.iter().take(40).cloned());
                if listing.files.len() > 40 {
                    lines.push(format!("... (+{} more)", listing.files.len() - 40));
                }
            }
            Some(ToolOutput::Content(file)) => {
                let marker = if file.truncated { " (truncated)" } else { "" };
                lines.push(format!("- read_file: {}{marker}", file.path));
                if !file.content.is_empty() {
                    lines.push(clip(&file.content, 2000));
                }
            }
            Some(ToolOutput::Matches(report)) => {
                lines.push(format!("- search_in_files: {} matches", report.matches.len()));
                for m in report.matches.iter().take(30) {
                    lines.push(format!("{}:{}: {}", m.path, m.line, m.text.trim()));
                }
                if report.matches.len() > 30 {
                    lines.push(format!("... (+{} more matches)", report.matches.len() - 30));
                }
            }
            _ => lines.push(format!("- {name}: ok")),
        }
    }
    lines.join("\n")
}

/// `Prepared changes: N (+a -d)` followed by a short per-change list.
pub fn summarize_pending(changes: &[PendingChange]) -> String {
    if changes.is_empty() {
        return String::new();
    }
    let counts: Vec<(usize, usize)> = changes.iter().map(|c| count_changes(&c.diff)).collect();
    let total_added: usize = counts.iter().map(|(a, _)| a).sum();
    let total_removed: usize = counts.iter().map(|(_, d)| d).sum();

    let mut lines = vec![format!(
        "Prepared changes: {} (+{total_added} -{total_removed}).",
        changes.len()
    )];
    for (change, (added, removed)) in changes.iter().zip(&counts).take(PENDING_PREVIEW) {
        lines.push(format!("- {}: {} (+{added} -{removed})", change.operation, change.path));
    }
    if changes.len() > PENDING_PREVIEW {
        lines.push(format!("... (+{} more)", changes.len() - PENDING_PREVIEW));
    }
    lines.join("\n")
}

/// Appends `- path` lines under a heading.
pub fn file_list(heading: &str, files: &[String]) -> String {
    let lines: Vec<String> = files.iter().map(|f| format!("- {f}")).collect();
    format!("{heading}\n{}", lines.join("\n"))
}

fn clip(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{FileContent, FileListing, MutationReport};
    use serde_json::json;

    #[test]
    fn test_chat_title() {
        assert_eq!(chat_title("  fix   the\n bug "), "fix the bug");
        assert_eq!(chat_title(" \n "), "Agent session");
        let long = "word ".repeat(20);
        let title = chat_title(&long);
        assert!(title.ends_with("..."));
        assert!(title.chars().count() <= 52);
        assert!(!title.contains(" ..."));
    }

    #[test]
    fn test_strip_reasoning() {
        let text = "<think>hmm\nplan</think>\n\n\n\nAnswer\n```reasoning\nsecret\n```\n<ANALYSIS>x</ANALYSIS>done";
        assert_eq!(strip_reasoning(text), "Answer\n\ndone");
    }

    #[test]
    fn test_normalize_history() {
        let messages = vec![
            ChatMessage::system("sys"),
            ChatMessage::user("one"),
            ChatMessage::assistant("<think>x</think>"),
            ChatMessage::tool("c", "read_file", "{}"),
            ChatMessage::assistant("two"),
            ChatMessage::user("three"),
        ];
        let history = normalize_history(&messages, 2);
        assert_eq!(history, vec![ChatMessage::assistant("two"), ChatMessage::user("three")]);
    }

    #[test]
    fn test_summarize_pending() {
        let change = |path: &str, diff: &str| PendingChange {
            operation: "write_file".into(),
            path: path.into(),
            diff: diff.into(),
            apply_args: json!({}),
        };
        let changes: Vec<PendingChange> = (0..10)
            .map(|i| change(&format!("f{i}.txt"), "--- /dev/null\n+++ b/f\n@@ -0,0 +1 @@\n+x\n"))
            .collect();
        let summary = summarize_pending(&changes);
        let lines: Vec<&str> = summary.lines().collect();
        assert_eq!(lines[0], "Prepared changes: 10 (+10 -0).");
        assert_eq!(lines[1], "- write_file: f0.txt (+1 -0)");
        assert_eq!(lines.last().copied(), Some("... (+2 more)"));
        assert_eq!(lines.len(), 10);
        assert_eq!(summarize_pending(&[]), "");
    }

    #[test]
    fn test_observations_respect_budget() {
        let big = ToolResult::success(
            "read_file",
            ToolOutput::Content(FileContent {
                path: "big.txt".into(),
                content: "x".repeat(5000),
                truncated: false,
                total_chars: 5000,
            }),
        );
        let results = vec![big.clone(), big.clone(), big.clone(), big];
        let text = observations(&results);
        assert!(text.chars().count() <= OBSERVATION_BUDGET);
        assert!(text.starts_with("- read_file big.txt:\n"));
        assert_eq!(text.lines().nth(1).map(str::len), Some(900));

        let failed = ToolResult::failure("read_file", "File not found: a");
        assert_eq!(observations(&[failed]), "- read_file: error: File not found: a");
    }

    #[test]
    fn test_summarize_tool_results() {
        let results = vec![
            ToolResult::success(
                "list_files",
                ToolOutput::Files(FileListing {
                    path: ".".into(),
                    files: vec!["a.py".into()],
                    truncated: false,
                }),
            ),
            ToolResult::success(
                "write_file",
                ToolOutput::Mutation(MutationReport {
                    path: "a.py".into(),
                    operation: "write_file",
                    changed: true,
                    applied: false,
                    diff: Some("+x\n".into()),
                    ..MutationReport::default()
                }),
            ),
            ToolResult::failure("delete_file", "Path escapes project root"),
        ];
        assert_eq!(
            summarize_tool_results(&results),
            "Tools executed (fallback mode):\n- list_files: found 1 files\na.py\n- write_file: pending a.py (+1 -0)\n- delete_file: error: Path escapes project root"
        );
    }

    #[test]
    fn test_prompts_carry_task_and_schema() {
        let tools = vec![ToolDefinition {
            name: "read_file",
            description: "Read a file.",
            parameters: json!({"type": "object", "properties": {"path": {}, "max_chars": {}}, "required": ["path"]}),
        }];
        let history = vec![ChatMessage::user("earlier question")];
        let prompt = fallback_prompt("do it", &history, &tools);
        assert!(prompt.starts_with("Tool calling is unavailable."));
        assert!(prompt.contains("- read_file(path, max_chars?): Read a file."));
        assert!(prompt.contains("\"tool\": \"read_file\""));
        assert!(prompt.contains("Conversation context:\nUser: earlier question\n\n"));
        assert!(prompt.ends_with("User task:\ndo it"));

        let repair = repair_prompt("do it", &[], &[], &[], &tools);
        assert!(repair.contains("Tool errors:\n- none"));
        assert!(repair.contains("Tool observations:\n- none"));
        assert!(repair.contains("Previous actions:\n[]"));
    }
}
