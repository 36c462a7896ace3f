//! # Action Parsing
//!
//! Turns tool intent out of free-form model text into [`Action`]s. Parsing is a
//! chain of strategies tried in order; the first that yields actions wins.
//!
//! 1. the whole reply is JSON (or contains one JSON object)
//! 2. fenced JSON code blocks
//! 3. call-like text such as `read_file(path="src/main.rs")`, anywhere in the reply
//! 4. fenced code blocks labelled with `path: <file>`, taken as whole-file writes

use crate::error::ToolError;
use crate::tools::Args;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Number, Value};
use std::collections::HashSet;

/// Tool names the model sometimes invents, mapped onto the catalog.
pub const TOOL_ALIASES: &[(&str, &str)] = &[("create_file", "write_file"), ("append_file", "write_file")];

pub const ARG_ALIASES: &[(&str, &str)] = &[
    ("file_path", "path"),
    ("filepath", "path"),
    ("filename", "path"),
    ("text", "content"),
];

/// Names accepted from call-like text. JSON actions are passed through as-is
/// and unknown names are reported by the executor.
const CALLABLE_TOOLS: &[&str] = &[
    "list_files",
    "read_file",
    "search_in_files",
    "write_file",
    "replace_in_file",
    "delete_file",
];

static FENCED_JSON_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)```(?:json)?\s*(.*?)```").expect("Invalid regex"));
static CALL_START_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b([A-Za-z_][A-Za-z0-9_]*)\s*\(").expect("Invalid regex"));
static PATH_BLOCK_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```[^\n`]*?\bpath:\s*([^\s`]+)[^\n]*\n(.*?)```").expect("Invalid regex")
});

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Action {
    pub tool: String,
    pub args: Args,
}

impl Action {
    pub fn new(tool: &str, args: Args) -> Self {
        let tool = canonical_tool_name(tool).to_string();
        let args = normalize_args(&tool, args);
        Self { tool, args }
    }
}

type Strategy = fn(&str) -> Option<Vec<Action>>;

const STRATEGIES: &[(&str, Strategy)] = &[
    ("direct_json", parse_direct_json),
    ("fenced_json", parse_fenced_json),
    ("call_like", parse_call_like),
    ("path_blocks", parse_path_blocks),
];

/// Extracts actions from `text`, deduplicated, in the order they appear.
pub fn parse_actions(text: &str) -> Vec<Action> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }
    for (name, strategy) in STRATEGIES {
        if let Some(actions) = strategy(text).filter(|actions| !actions.is_empty()) {
            tracing::debug!(strategy = name, count = actions.len(), "parsed text actions");
            return dedup(actions);
        }
    }
    Vec::new()
}

pub fn canonical_tool_name(name: &str) -> &str {
    let name = name.trim();
    TOOL_ALIASES
        .iter()
        .find(|(alias, _)| *alias == name)
        .map(|(_, canonical)| *canonical)
        .unwrap_or(name)
}

/// Renames aliased argument keys and fills the defaults the model tends to omit.
pub fn normalize_args(tool: &str, args: Args) -> Args {
    let mut normalized = Map::new();
    for (key, value) in args {
        let key = ARG_ALIASES
            .iter()
            .find(|(alias, _)| *alias == key)
            .map(|(_, canonical)| canonical.to_string())
            .unwrap_or(key);
        if !normalized.contains_key(&key) {
            normalized.insert(key, value);
        }
    }
    let defaulted = match tool {
        "replace_in_file" => Some("replace"),
        "write_file" => Some("content"),
        _ => None,
    };
    if let Some(key) = defaulted {
        normalized
            .entry(key)
            .or_insert_with(|| Value::String(String::new()));
    }
    normalized
}

/// Decodes the raw argument string of a native tool call.
pub fn decode_call_arguments(raw: &str) -> Result<Args, ToolError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(Value::Null) => Ok(Map::new()),
        Ok(_) => Err(ToolError::ArgumentsNotObject),
        Err(e) => Err(ToolError::InvalidArguments(e.to_string())),
    }
}

fn dedup(actions: Vec<Action>) -> Vec<Action> {
    let mut seen = HashSet::new();
    actions
        .into_iter()
        .filter(|action| seen.insert(serde_json::to_string(action).unwrap_or_default()))
        .collect()
}

fn decode_json_candidate(candidate: &str) -> Option<Value> {
    let text = candidate.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(value) = serde_json::from_str(text) {
        return Some(value);
    }
    let first = text.find('{')?;
    let last = text.rfind('}')?;
    if last <= first {
        return None;
    }
    serde_json::from_str(&text[first..=last]).ok()
}

fn actions_from_value(value: &Value) -> Option<Vec<Action>> {
    let items: Vec<&Value> = match value {
        Value::Object(obj) => {
            if let Some(Value::Array(actions)) = obj.get("actions") {
                actions.iter().collect()
            } else if let Some(action @ Value::Object(_)) = obj.get("action") {
                vec![action]
            } else if obj.contains_key("tool") || obj.contains_key("name") {
                vec![value]
            } else {
                return None;
            }
        }
        Value::Array(items) => items.iter().collect(),
        _ => return None,
    };
    Some(items.into_iter().filter_map(action_from_object).collect())
}

fn action_from_object(value: &Value) -> Option<Action> {
    let obj = value.as_object()?;
    let tool = obj
        .get("tool")
        .or_else(|| obj.get("name"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|tool| !tool.is_empty())?;
    let args = match obj.get("args").or_else(|| obj.get("arguments")) {
        Some(Value::Object(args)) => args.clone(),
        Some(Value::String(raw)) => decode_call_arguments(raw).unwrap_or_default(),
        _ => Map::new(),
    };
    Some(Action::new(tool, args))
}

fn parse_direct_json(text: &str) -> Option<Vec<Action>> {
    decode_json_candidate(text).and_then(|value| actions_from_value(&value))
}

fn parse_fenced_json(text: &str) -> Option<Vec<Action>> {
    FENCED_JSON_REGEX
        .captures_iter(text)
        .filter_map(|caps| decode_json_candidate(&caps[1]))
        .find_map(|value| actions_from_value(&value).filter(|actions| !actions.is_empty()))
}

fn parse_call_like(text: &str) -> Option<Vec<Action>> {
    let mut actions = Vec::new();
    let mut consumed = 0;
    for caps in CALL_START_REGEX.captures_iter(text) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        if whole.start() < consumed {
            continue;
        }
        let tool = canonical_tool_name(name.as_str());
        if !CALLABLE_TOOLS.contains(&tool) {
            continue;
        }
        if let Some((args, len)) = parse_call_args(&text[whole.end()..], tool) {
            consumed = whole.end() + len;
            actions.push(Action::new(tool, args));
        }
    }
    Some(actions)
}

fn parse_path_blocks(text: &str) -> Option<Vec<Action>> {
    let actions = PATH_BLOCK_REGEX
        .captures_iter(text)
        .map(|caps| {
            let mut args = Map::new();
            args.insert("path".into(), Value::String(caps[1].to_string()));
            args.insert("content".into(), Value::String(caps[2].to_string()));
            Action::new("write_file", args)
        })
        .collect();
    Some(actions)
}

/// Parses the argument list of a call-like expression, starting right after
/// the opening parenthesis. Values may be quoted strings (including triple
/// quotes), numbers, `True`/`False`/`None`, or bare text. Returns the arguments
/// and the number of bytes consumed through the closing parenthesis.
fn parse_call_args(rest: &str, tool: &str) -> Option<(Args, usize)> {
    let mut parser = ArgParser {
        chars: rest.chars().collect(),
        pos: 0,
    };
    let mut args = Map::new();
    let mut positional = 0;
    loop {
        parser.skip_ws();
        if parser.eat(')') {
            break;
        }
        let (key, value) = parser.argument()?;
        match key {
            Some(key) => {
                args.insert(key, value);
            }
            None => {
                if positional == 0 {
                    let key = if tool == "search_in_files" { "query" } else { "path" };
                    args.insert(key.to_string(), value);
                }
                positional += 1;
            }
        }
        parser.skip_ws();
        if parser.eat(')') {
            break;
        }
        if !parser.eat(',') {
            return None;
        }
    }
    let len = rest.chars().take(parser.pos).map(char::len_utf8).sum();
    Some((args, len))
}

struct ArgParser {
    chars: Vec<char>,
    pos: usize,
}

impl ArgParser {
    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn starts_with(&self, s: &str) -> bool {
        let mut idx = self.pos;
        for c in s.chars() {
            if self.chars.get(idx) != Some(&c) {
                return false;
            }
            idx += 1;
        }
        true
    }

    /// One `key=value` or positional value.
    fn argument(&mut self) -> Option<(Option<String>, Value)> {
        let start = self.pos;
        let mut key = String::new();
        while let Some(c) = self.peek().filter(|c| c.is_ascii_alphanumeric() || *c == '_') {
            key.push(c);
            self.pos += 1;
        }
        self.skip_ws();
        if !key.is_empty() && self.peek() == Some('=') && !self.starts_with("==") {
            self.pos += 1;
            self.skip_ws();
            return Some((Some(key), self.value()?));
        }
        self.pos = start;
        Some((None, self.value()?))
    }

    fn value(&mut self) -> Option<Value> {
        match self.peek()? {
            quote @ ('"' | '\'') => self.string(quote).map(Value::String),
            _ => Some(self.bare()),
        }
    }

    fn string(&mut self, quote: char) -> Option<String> {
        let triple: String = std::iter::repeat_n(quote, 3).collect();
        let delimiter = if self.starts_with(&triple) { triple } else { quote.to_string() };
        self.pos += delimiter.chars().count();

        let mut out = String::new();
        loop {
            if self.starts_with(&delimiter) {
                self.pos += delimiter.chars().count();
                return Some(out);
            }
            let c = self.peek()?;
            self.pos += 1;
            if c != '\\' {
                out.push(c);
                continue;
            }
            let escaped = self.peek()?;
            self.pos += 1;
            match escaped {
                'n' => out.push('\n'),
                't' => out.push('\t'),
                'r' => out.push('\r'),
                '0' => out.push('\0'),
                other => out.push(other),
            }
        }
    }

    /// Text up to the next top-level comma or the closing parenthesis.
    fn bare(&mut self) -> Value {
        let mut depth = 0i32;
        let mut raw = String::new();
        while let Some(c) = self.peek() {
            match c {
                '(' | '[' | '{' => depth += 1,
                ')' if depth == 0 => break,
                ')' | ']' | '}' => depth -= 1,
                ',' if depth == 0 => break,
                _ => {}
            }
            raw.push(c);
            self.pos += 1;
        }
        literal(raw.trim())
    }
}

fn literal(raw: &str) -> Value {
    match raw {
        "True" | "true" => return Value::Bool(true),
        "False" | "false" => return Value::Bool(false),
        "None" | "null" => return Value::Null,
        _ => {}
    }
    if let Ok(n) = raw.parse::<i64>() {
        return Value::Number(n.into());
    }
    if let Some(n) = raw.parse::<f64>().ok().and_then(Number::from_f64) {
        return Value::Number(n);
    }
    if let Ok(value @ (Value::Array(_) | Value::Object(_))) = serde_json::from_str::<Value>(raw) {
        return value;
    }
    Value::String(raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tools(actions: &[Action]) -> Vec<&str> {
        actions.iter().map(|a| a.tool.as_str()).collect()
    }

    #[test]
    fn test_direct_json_actions() {
        let actions = parse_actions(
            r#"{"actions":[{"tool":"write_file","args":{"path":"a.py","content":"x"}}]}"#,
        );
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].tool, "write_file");
        assert_eq!(actions[0].args["path"], "a.py");
        assert_eq!(actions[0].args["content"], "x");
    }

    #[test]
    fn test_json_embedded_in_prose() {
        let actions = parse_actions(
            "Sure! {\"action\": {\"name\": \"read_file\", \"arguments\": {\"file_path\": \"README.md\"}}} done",
        );
        assert_eq!(tools(&actions), vec!["read_file"]);
        assert_eq!(actions[0].args["path"], "README.md");
        assert!(actions[0].args.get("file_path").is_none());
    }

    #[test]
    fn test_fenced_json_and_aliases() {
        let text = "Plan:\n```json\n[{\"tool\": \"create_file\", \"args\": {\"filename\": \"b.txt\", \"text\": \"hi\"}}]\n```\nthen {oops}";
        let actions = parse_actions(text);
        assert_eq!(tools(&actions), vec!["write_file"]);
        assert_eq!(actions[0].args["path"], "b.txt");
        assert_eq!(actions[0].args["content"], "hi");
    }

    #[test]
    fn test_call_like_text() {
        let text = "I will do this:\nread_file(path='src/lib.rs')\nreplace_in_file(path=\"a.py\", find=\"x = 1\", count=0)\nlist_files('.', limit=20, recursive=True)";
        let actions = parse_actions(text);
        assert_eq!(tools(&actions), vec!["read_file", "replace_in_file", "list_files"]);
        assert_eq!(actions[1].args["replace"], "");
        assert_eq!(actions[1].args["count"], 0);
        assert_eq!(actions[2].args["path"], ".");
        assert_eq!(actions[2].args["limit"], 20);
        assert_eq!(actions[2].args["recursive"], true);
    }

    #[test]
    fn test_call_like_triple_quoted_and_unknown_names() {
        let text = "```python\nwrite_file(path=\"t.py\", content=\"\"\"def f():\n    return 'a, b'\n\"\"\")\nlaunch(x=1)\n```";
        let actions = parse_actions(text);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].args["content"], "def f():\n    return 'a, b'\n");
    }

    #[test]
    fn test_search_positional_is_query() {
        let actions = parse_actions("search_in_files(\"TODO\", path=\"src\")");
        assert_eq!(actions[0].args["query"], "TODO");
        assert_eq!(actions[0].args["path"], "src");
    }

    #[test]
    fn test_path_block_bridge() {
        let text = "Here is the file:\n```python path: pkg/util.py\nprint('hi')\n```";
        let actions = parse_actions(text);
        assert_eq!(tools(&actions), vec!["write_file"]);
        assert_eq!(actions[0].args["path"], "pkg/util.py");
        assert_eq!(actions[0].args["content"], "print('hi')\n");
    }

    #[test]
    fn test_duplicates_removed_and_prose_ignored() {
        let actions = parse_actions("read_file(path=\"a\")\n```\nread_file(path=\"a\")\n```");
        assert_eq!(actions.len(), 1);
        assert!(parse_actions("Nothing to do here.").is_empty());
        assert!(parse_actions("   ").is_empty());
    }

    #[test]
    fn test_decode_call_arguments() {
        assert_eq!(decode_call_arguments("").unwrap(), Map::new());
        assert_eq!(
            decode_call_arguments(r#"{"path": "a"}"#).unwrap(),
            json!({"path": "a"}).as_object().unwrap().clone()
        );
        assert_eq!(decode_call_arguments("[1]").unwrap_err(), ToolError::ArgumentsNotObject);
        assert!(matches!(
            decode_call_arguments("{broken").unwrap_err(),
            ToolError::InvalidArguments(_)
        ));
    }
}
