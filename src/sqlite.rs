use crate::backend::{DatabaseBackend, Dialect, QueryResult, QueryRow};
use crate::error::{QueryError, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row};
use std::str::FromStr;

pub struct SqliteBackend {
    pool: SqlitePool,
    in_transaction: bool,
}

impl SqliteBackend {
    /// Open a SQLite database.
    ///
    /// The pool holds exactly one long-lived connection, so transactions and
    /// in-memory databases stay on the same connection.
    pub async fn new(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        tracing::debug!(url, "Connected to SQLite");
        Ok(Self {
            pool,
            in_transaction: false,
        })
    }

    /// Create an in-memory SQLite database
    pub async fn memory() -> Result<Self> {
        Self::new("sqlite::memory:").await
    }

    /// Create a file-based SQLite database
    pub async fn file(path: &str) -> Result<Self> {
        Self::new(&format!("sqlite://{}", path)).await
    }

    /// Convert SQLite row to QueryRow
    fn convert_row(row: &SqliteRow) -> QueryRow {
        let mut query_row = QueryRow::new();

        for column in row.columns() {
            let column_name = column.name();

            let value = if let Ok(Some(value)) = row.try_get::<Option<String>, _>(column_name) {
                Value::String(value)
            } else if let Ok(Some(value)) = row.try_get::<Option<i64>, _>(column_name) {
                Value::Number(value.into())
            } else if let Ok(Some(value)) = row.try_get::<Option<f64>, _>(column_name) {
                serde_json::Number::from_f64(value)
                    .map(Value::Number)
                    .unwrap_or(Value::Null)
            } else if let Ok(Some(value)) = row.try_get::<Option<bool>, _>(column_name) {
                Value::Bool(value)
            } else if let Ok(Some(value)) = row.try_get::<Option<Vec<u8>>, _>(column_name) {
                Value::Array(value.into_iter().map(Value::from).collect())
            } else {
                Value::Null
            };

            query_row.insert(column_name.to_string(), value);
        }

        query_row
    }

    /// Names of user tables
    pub async fn list_tables(&mut self) -> Result<Vec<String>> {
        self.list_objects("table").await
    }

    /// Names of views
    pub async fn list_views(&mut self) -> Result<Vec<String>> {
        self.list_objects("view").await
    }

    async fn list_objects(&mut self, kind: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT name FROM sqlite_master WHERE type = ? AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .bind(kind)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(|row| row.get::<String, _>("name")).collect())
    }

    /// Get table info
    pub async fn table_info(&mut self, table_name: &str) -> Result<Vec<ColumnInfo>> {
        let query = format!("PRAGMA table_info(\"{}\")", table_name.replace('"', "\"\""));
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;

        let mut columns = Vec::new();
        for row in rows {
            columns.push(ColumnInfo {
                cid: row.get::<i32, _>("cid"),
                name: row.get::<String, _>("name"),
                type_name: row.get::<String, _>("type"),
                not_null: row.get::<i32, _>("notnull") != 0,
                default_value: row.try_get::<Option<String>, _>("dflt_value").ok().flatten(),
                primary_key: row.get::<i32, _>("pk") != 0,
            });
        }

        Ok(columns)
    }
}

/// Column information from PRAGMA table_info
#[derive(Debug, Clone)]
pub struct ColumnInfo {
    pub cid: i32,
    pub name: String,
    pub type_name: String,
    pub not_null: bool,
    pub default_value: Option<String>,
    pub primary_key: bool,
}

#[async_trait]
impl DatabaseBackend for SqliteBackend {
    async fn connect(url: &str) -> Result<Self> {
        Self::new(url).await
    }

    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn execute(&mut self, sql: &str) -> Result<u64> {
        let result = sqlx::query(sql).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn query(&mut self, sql: &str) -> Result<QueryResult> {
        let rows = sqlx::query(sql).fetch_all(&self.pool).await?;

        let result = rows.iter().map(Self::convert_row).collect();

        Ok(result)
    }

    async fn begin_transaction(&mut self) -> Result<()> {
        if self.in_transaction {
            return Err(QueryError::Transaction(
                "Already in transaction".to_string(),
            ));
        }

        self.execute("BEGIN TRANSACTION").await?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Err(QueryError::Transaction("Not in transaction".to_string()));
        }

        self.execute("COMMIT").await?;
        self.in_transaction = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Err(QueryError::Transaction("Not in transaction".to_string()));
        }

        self.execute("ROLLBACK").await?;
        self.in_transaction = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.pool.is_closed()
    }

    async fn close(self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}
