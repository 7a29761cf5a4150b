//! SQL statement logging.

use std::time::Duration;

// Longest first so multi-word clauses win over their prefixes
const CLAUSES: [&str; 14] = [
    "LEFT OUTER JOIN",
    "INNER JOIN",
    "DEFAULT VALUES",
    "ORDER BY",
    "RETURNING",
    "SELECT",
    "OFFSET",
    "VALUES",
    "WHERE",
    "LIMIT",
    "FROM",
    "SET",
    "AND",
    "OR",
];

/// Break a statement onto one line per clause.
///
/// Quoted text is left alone; `AND`/`OR` are indented under their clause.
pub fn format_sql(sql: &str) -> String {
    let mut output = String::with_capacity(sql.len() + 16);
    let mut quote: Option<char> = None;
    let mut depth = 0usize;
    let mut rest = sql.trim();

    while let Some(ch) = rest.chars().next() {
        if let Some(open) = quote {
            if ch == open {
                quote = None;
            }
            output.push(ch);
            rest = &rest[ch.len_utf8()..];
            continue;
        }

        let at_boundary = output.is_empty() || output.ends_with(' ') || output.ends_with('(');
        if at_boundary {
            if let Some(clause) = CLAUSES.iter().find(|c| starts_with_word(rest, c)) {
                let nested = output.ends_with('(');
                if !output.is_empty() && !nested {
                    let trimmed = output.trim_end().len();
                    output.truncate(trimmed);
                    output.push('\n');
                    output.push_str(&"  ".repeat(depth));
                    if matches!(*clause, "AND" | "OR") {
                        output.push_str("  ");
                    }
                }
                output.push_str(clause);
                rest = &rest[clause.len()..];
                continue;
            }
        }

        match ch {
            '\'' | '"' => quote = Some(ch),
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            _ => {}
        }
        output.push(ch);
        rest = &rest[ch.len_utf8()..];
    }

    output
}

fn starts_with_word(text: &str, word: &str) -> bool {
    text.starts_with(word)
        && text[word.len()..]
            .chars()
            .next()
            .is_none_or(|c| c.is_whitespace() || c == '(' || c == ';')
}

/// Emit one executed statement with its duration
pub fn log_sql(sql: &str, elapsed: Duration, prettify: bool) {
    let text = if prettify {
        format_sql(sql)
    } else {
        sql.to_string()
    };

    tracing::debug!(
        target: "model_query::sql",
        elapsed_ms = elapsed.as_millis() as u64,
        "SQL Query: {}",
        text
    );
}

/// Statement logging switches, usually taken from
/// [`DatabaseConfig`](crate::config::DatabaseConfig)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SqlLogging {
    pub enabled: bool,
    pub prettify: bool,
}

impl SqlLogging {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            prettify: false,
        }
    }

    pub fn log(&self, sql: &str, elapsed: Duration) {
        if self.enabled {
            log_sql(sql, elapsed, self.prettify);
        }
    }
}

impl Default for SqlLogging {
    fn default() -> Self {
        Self {
            enabled: true,
            prettify: false,
        }
    }
}
