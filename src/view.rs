//! View definition parameterization and SQL text helpers.

use crate::error::{QueryError, Result};
use crate::model::ModelDescriptor;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)@\{([a-z0-9_]+?)\}").expect("placeholder pattern is valid")
});

static CREATE_VIEW_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)create\s+(or\s+replace\s+)?(materialized\s+)?view\s+(.*?)\s+as")
        .expect("create view pattern is valid")
});

/// Distinct placeholder names of a template, in order of first appearance
pub fn placeholders(template: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for captures in PLACEHOLDER.captures_iter(template) {
        let name = captures[1].to_string();
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

/// Escape a scalar for inlining into SQL.
///
/// Strings are single-quoted with embedded quotes doubled, numbers are bare,
/// everything else becomes `NULL`.
pub fn escape(value: &Value) -> String {
    match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        _ => "NULL".to_string(),
    }
}

/// Replace every `@{name}` with the escaped parameter value
pub fn substitute(template: &str, params: &Map<String, Value>) -> String {
    PLACEHOLDER
        .replace_all(template, |captures: &regex::Captures<'_>| {
            escape(params.get(&captures[1]).unwrap_or(&Value::Null))
        })
        .into_owned()
}

/// Collapse whitespace runs outside single-quoted literals into one space
pub fn collapse_whitespace(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let mut quoted = false;
    let mut space = false;

    for ch in input.chars() {
        if !quoted && ch.is_whitespace() {
            if !space {
                output.push(' ');
            }
            space = true;
        } else {
            output.push(ch);
            space = false;
        }

        if ch == '\'' {
            quoted = !quoted;
        }
    }

    output
}

/// Normalize a statement to one line terminated by a single `;`
pub fn sql(input: &str) -> String {
    let collapsed = collapse_whitespace(input);
    let body = collapsed.trim().trim_end_matches(';').trim_end();
    format!("{};", body)
}

/// Statement text without its trailing `;`
pub fn without_terminator(statement: &str) -> &str {
    statement.trim_end().trim_end_matches(';')
}

/// Remove the `CREATE [OR REPLACE] [MATERIALIZED] VIEW name AS` prefix
pub fn strip_create_view(definition: &str) -> String {
    CREATE_VIEW_PREFIX.replace(definition, "").into_owned()
}

/// Check that a CREATE VIEW statement creates `view_name`
pub fn validate_view_name(view_name: &str, definition: &str) -> Result<()> {
    let pattern = format!(
        r#"(?i)\s*create\s+(or\s+replace\s+)?(temp\s+|temporary\s+)?view\s+"?{}"?\s+"#,
        regex::escape(view_name)
    );
    let rx = Regex::new(&pattern).map_err(|e| QueryError::View(e.to_string()))?;

    if rx.is_match(definition) {
        Ok(())
    } else {
        Err(QueryError::View(
            "Given view definition does not match given view name".to_string(),
        ))
    }
}

/// View SQL of a model with `params` layered over the declared defaults.
///
/// Placeholders are substituted only for dynamic views. With `as_query`
/// the CREATE prefix is stripped, leaving the bare SELECT.
pub fn view_definition(
    model: &ModelDescriptor,
    params: Option<&Map<String, Value>>,
    as_query: bool,
) -> Result<String> {
    let definition = model.view().ok_or_else(|| {
        QueryError::View(format!("Model {} is not declared as a view", model.name))
    })?;

    let mut text = definition.template.clone();

    if definition.dynamic {
        let mut merged = definition.params.clone();
        if let Some(params) = params {
            for (key, value) in params {
                merged.insert(key.clone(), value.clone());
            }
        }
        text = substitute(&text, &merged);
    }

    if as_query {
        text = strip_create_view(&text);
    }

    Ok(sql(&text))
}
