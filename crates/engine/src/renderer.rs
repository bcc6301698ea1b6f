//! Template rendering.
//!
//! Placeholders look like `{{name}}`. Whitespace inside the braces is ignored
//! and variable names match case-insensitively, so `{{ Name }}` resolves
//! the `name` variable. A placeholder with no matching variable is copied to
//! the output verbatim.

use std::collections::HashMap;

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

/// Variables available to a template, keyed case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct TemplateVars {
    values: HashMap<String, String>,
}

impl TemplateVars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.values.insert(name.trim().to_lowercase(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values
            .get(&name.trim().to_lowercase())
            .map(String::as_str)
    }
}

/// Substitute every resolvable `{{ var }}` placeholder in `body`.
pub fn render(body: &str, vars: &TemplateVars) -> String {
    let mut output = String::with_capacity(body.len());
    let mut rest = body;

    while let Some(start) = rest.find(OPEN) {
        output.push_str(&rest[..start]);
        let after_open = &rest[start + OPEN.len()..];

        let Some(end) = after_open.find(CLOSE) else {
            // Unterminated placeholder: keep the remainder as-is.
            output.push_str(&rest[start..]);
            return output;
        };

        let Some(name) = placeholder_name(&after_open[..end]) else {
            // Not a placeholder; a `{{name}}` may still start inside it.
            output.push('{');
            rest = &rest[start + 1..];
            continue;
        };

        match vars.get(name) {
            Some(value) => output.push_str(value),
            None => output.push_str(&rest[start..start + OPEN.len() + end + CLOSE.len()]),
        }
        rest = &after_open[end + CLOSE.len()..];
    }

    output.push_str(rest);
    output
}

/// Names of all well-formed placeholders in `body`, lower-cased, in order of
/// first appearance.
pub fn placeholders(body: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    let mut rest = body;

    while let Some(start) = rest.find(OPEN) {
        let after_open = &rest[start + OPEN.len()..];
        let Some(end) = after_open.find(CLOSE) else {
            break;
        };
        let Some(name) = placeholder_name(&after_open[..end]) else {
            rest = &rest[start + 1..];
            continue;
        };
        let name = name.to_lowercase();
        if !names.contains(&name) {
            names.push(name);
        }
        rest = &after_open[end + CLOSE.len()..];
    }

    names
}

/// A placeholder is a single identifier, optionally padded with whitespace.
fn placeholder_name(inner: &str) -> Option<&str> {
    let name = inner.trim();
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '.' || c == '-');
    valid.then_some(name)
}
