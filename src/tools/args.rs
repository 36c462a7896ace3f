//! Lenient accessors for model-supplied tool arguments.

use super::Args;
use crate::error::ToolError;
use serde_json::Value;

/// A string argument that must be present. Empty strings are allowed.
pub fn required_str<'a>(args: &'a Args, key: &str) -> Result<&'a str, ToolError> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::MissingArgument(key.to_string()))
}

/// A path argument: present and non-blank after trimming.
pub fn required_path<'a>(args: &'a Args, key: &str) -> Result<&'a str, ToolError> {
    let value = required_str(args, key)?.trim();
    if value.is_empty() {
        return Err(ToolError::MissingArgument(key.to_string()));
    }
    Ok(value)
}

/// A non-blank string argument, or `None` when absent, null or blank.
pub fn optional_str<'a>(args: &'a Args, key: &str) -> Option<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// An integer argument clamped into `[min, max]`. Numeric strings are accepted.
pub fn int_arg(args: &Args, key: &str, default: i64, min: i64, max: i64) -> Result<i64, ToolError> {
    let value = match args.get(key) {
        None | Some(Value::Null) => default,
        Some(Value::Number(n)) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => i,
            (None, Some(f)) if f.is_finite() => f as i64,
            _ => return Err(ToolError::ExpectedInteger),
        },
        Some(Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| ToolError::ExpectedInteger)?,
        Some(_) => return Err(ToolError::ExpectedInteger),
    };
    Ok(value.clamp(min, max))
}

pub fn bool_arg(args: &Args, key: &str, default: bool) -> bool {
    match args.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "true" | "1" | "yes" | "on"
        ),
        _ => default,
    }
}
