//! Connection and logging configuration.

use crate::error::{QueryError, Result};
use crate::logging::SqlLogging;
use serde::{Deserialize, Serialize};

/// Environment variable holding the fallback connection string
pub const DB_CONN_STR: &str = "DB_CONN_STR";
/// Environment flag enabling pretty-printed SQL logs
pub const SQL_PRETTIFY: &str = "SQL_PRETTIFY";
/// Environment flag switching SQL logging off when `0`
pub const SQL_LOGGING: &str = "SQL_LOGGING";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseConfig {
    pub connection_string: Option<String>,
    pub sql_logging: bool,
    pub sql_prettify: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            connection_string: None,
            sql_logging: true,
            sql_prettify: false,
        }
    }
}

impl DatabaseConfig {
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: Some(connection_string.into()),
            ..Default::default()
        }
    }

    /// Configuration from `DB_CONN_STR`, `SQL_PRETTIFY` and `SQL_LOGGING`
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            connection_string: lookup(DB_CONN_STR).filter(|s| !s.is_empty()),
            sql_logging: lookup(SQL_LOGGING)
                .map(|v| flag(&v))
                .unwrap_or(defaults.sql_logging),
            sql_prettify: lookup(SQL_PRETTIFY)
                .map(|v| flag(&v))
                .unwrap_or(defaults.sql_prettify),
        }
    }

    pub fn with_connection_string(mut self, connection_string: impl Into<String>) -> Self {
        self.connection_string = Some(connection_string.into());
        self
    }

    pub fn with_sql_logging(mut self, enabled: bool) -> Self {
        self.sql_logging = enabled;
        self
    }

    pub fn with_sql_prettify(mut self, prettify: bool) -> Self {
        self.sql_prettify = prettify;
        self
    }

    /// Configured connection string, falling back to `DB_CONN_STR`
    pub fn connection_string(&self) -> Result<String> {
        self.resolve_connection_string(|name| std::env::var(name).ok())
    }

    fn resolve_connection_string(&self, lookup: impl Fn(&str) -> Option<String>) -> Result<String> {
        self.connection_string
            .clone()
            .filter(|s| !s.is_empty())
            .or_else(|| lookup(DB_CONN_STR).filter(|s| !s.is_empty()))
            .ok_or_else(|| {
                QueryError::Config(
                    "Either environment DB_CONN_STR should be set or connectionString property given!"
                        .to_string(),
                )
            })
    }

    pub fn logging(&self) -> SqlLogging {
        SqlLogging {
            enabled: self.sql_logging,
            prettify: self.sql_prettify,
        }
    }
}

// Numeric flags count as set when positive
fn flag(value: &str) -> bool {
    let value = value.trim();
    match value.parse::<f64>() {
        Ok(number) => number > 0.0,
        Err(_) => value.eq_ignore_ascii_case("true"),
    }
}
