use crate::ExecError;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([A-Za-z_]\w*)\}").unwrap())
}

/// Always single-quote; rendered commands never depend on a value looking
/// "safe enough" to skip quoting.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn param_as_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Substitute `{ident}` placeholders with shell-quoted parameter values in a
/// single pass. Substituted values are never re-scanned, so JSON-bearing
/// params with braces cannot be mistaken for placeholders. A placeholder
/// with no matching param is an error.
pub fn render_template(
    template: &str,
    params: &Map<String, Value>,
) -> Result<String, ExecError> {
    let mut missing: Vec<String> = Vec::new();
    let rendered = placeholder_re().replace_all(template, |caps: &regex::Captures<'_>| {
        let ident = &caps[1];
        match params.get(ident) {
            Some(value) => shell_quote(&param_as_string(value)),
            None => {
                if !missing.iter().any(|m| m == ident) {
                    missing.push(ident.to_string());
                }
                caps[0].to_string()
            }
        }
    });

    if !missing.is_empty() {
        return Err(ExecError::Validation(format!(
            "unresolved template placeholders: {}",
            missing.join(", ")
        )));
    }
    Ok(rendered.into_owned())
}
