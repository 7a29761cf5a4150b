use crate::backend::{DatabaseBackend, Dialect, QueryResult, QueryRow};
use crate::error::{QueryError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;

/// Recording backend; queries answer from a queue of canned results
pub(crate) struct MockBackend {
    dialect: Dialect,
    executed: Vec<String>,
    responses: VecDeque<QueryResult>,
    failing: Option<String>,
    in_transaction: bool,
}

impl MockBackend {
    pub(crate) fn new() -> Self {
        Self::with_dialect(Dialect::Sqlite)
    }

    pub(crate) fn with_dialect(dialect: Dialect) -> Self {
        Self {
            dialect,
            executed: Vec::new(),
            responses: VecDeque::new(),
            failing: None,
            in_transaction: false,
        }
    }

    /// Queue the rows answered by the next query
    pub(crate) fn respond(&mut self, rows: Vec<Value>) {
        let rows = rows
            .into_iter()
            .map(|row| match row {
                Value::Object(columns) => QueryRow::from(columns),
                _ => QueryRow::new(),
            })
            .collect();
        self.responses.push_back(rows);
    }

    /// Fail every statement containing `pattern`
    pub(crate) fn fail_on(&mut self, pattern: &str) {
        self.failing = Some(pattern.to_string());
    }

    pub(crate) fn statements(&self) -> Vec<String> {
        self.executed.clone()
    }

    fn record(&mut self, sql: &str) -> Result<()> {
        self.executed.push(sql.to_string());
        match &self.failing {
            Some(pattern) if sql.contains(pattern.as_str()) => {
                Err(QueryError::Database(format!("forced failure: {}", sql)))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl DatabaseBackend for MockBackend {
    async fn connect(_url: &str) -> Result<Self> {
        Ok(Self::new())
    }

    fn dialect(&self) -> Dialect {
        self.dialect
    }

    async fn execute(&mut self, sql: &str) -> Result<u64> {
        self.record(sql)?;
        Ok(1)
    }

    async fn query(&mut self, sql: &str) -> Result<QueryResult> {
        self.record(sql)?;
        Ok(self.responses.pop_front().unwrap_or_default())
    }

    async fn begin_transaction(&mut self) -> Result<()> {
        if self.in_transaction {
            return Err(QueryError::Transaction("Already in transaction".to_string()));
        }
        self.executed.push("BEGIN".to_string());
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.executed.push("COMMIT".to_string());
        self.in_transaction = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.executed.push("ROLLBACK".to_string());
        self.in_transaction = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        true
    }

    async fn close(self) -> Result<()> {
        Ok(())
    }
}
