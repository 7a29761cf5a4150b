//! Statement-level access to a backend.
//!
//! [`QueryInterface`] renders and runs the statements the rest of the crate
//! needs, normalizing `RETURNING` projections and logging every statement.
//! [`Transaction`] is the same surface scoped to an open transaction.

use crate::backend::{DatabaseBackend, Dialect, QueryResult};
use crate::builder::{DeleteBuilder, InsertBuilder, Returning, SelectBuilder, UpdateBuilder, where_condition};
use crate::error::{QueryError, Result};
use crate::filter::WhereOptions;
use crate::logging::SqlLogging;
use crate::model::{ColumnIndex, ModelDescriptor};
use crate::query::FindOptions;
use crate::schema::{self, Registry};
use crate::view;
use serde_json::{Map, Value};
use std::time::Instant;

async fn run_query<B: DatabaseBackend>(backend: &mut B, logging: SqlLogging, sql: &str) -> Result<QueryResult> {
    let started = Instant::now();
    let result = backend.query(sql).await;
    logging.log(sql, started.elapsed());
    result
}

async fn run_execute<B: DatabaseBackend>(backend: &mut B, logging: SqlLogging, sql: &str) -> Result<u64> {
    let started = Instant::now();
    let result = backend.execute(sql).await;
    logging.log(sql, started.elapsed());
    result
}

// Without a projection there is nothing to read back
async fn run_returning<B: DatabaseBackend>(
    backend: &mut B,
    logging: SqlLogging,
    sql: &str,
    returning: &Returning,
) -> Result<QueryResult> {
    if *returning == Returning::None {
        run_execute(backend, logging, sql).await?;
        Ok(Vec::new())
    } else {
        run_query(backend, logging, sql).await
    }
}

fn insert_sql(model: &ModelDescriptor, values: &Map<String, Value>, returning: &Returning) -> String {
    InsertBuilder::new(model.table_name.clone())
        .values(values)
        .returning(returning.clone())
        .build()
}

pub struct QueryInterface<'a, B: DatabaseBackend> {
    backend: &'a mut B,
    logging: SqlLogging,
}

impl<'a, B: DatabaseBackend> QueryInterface<'a, B> {
    pub fn new(backend: &'a mut B, logging: SqlLogging) -> Self {
        Self { backend, logging }
    }

    pub fn dialect(&self) -> Dialect {
        self.backend.dialect()
    }

    /// Begin a transaction on the wrapped backend
    pub async fn transaction(&mut self) -> Result<Transaction<'_, B>> {
        Transaction::begin(&mut *self.backend, self.logging).await
    }

    pub async fn query(&mut self, sql: &str) -> Result<QueryResult> {
        run_query(self.backend, self.logging, sql).await
    }

    pub async fn execute(&mut self, sql: &str) -> Result<u64> {
        run_execute(self.backend, self.logging, sql).await
    }

    pub async fn insert(
        &mut self,
        model: &ModelDescriptor,
        values: &Map<String, Value>,
        returning: Returning,
    ) -> Result<QueryResult> {
        let sql = insert_sql(model, values, &returning);
        run_returning(self.backend, self.logging, &sql, &returning).await
    }

    pub async fn update(
        &mut self,
        model: &ModelDescriptor,
        values: &Map<String, Value>,
        filter: Option<&WhereOptions>,
        returning: Returning,
    ) -> Result<QueryResult> {
        let dialect = self.dialect();
        let mut builder = UpdateBuilder::new(model.table_name.clone())
            .set_many(values)
            .returning(returning.clone());
        if let Some(filter) = filter {
            builder = builder.where_clause(where_condition(filter, &model.table_name, dialect)?);
        }

        let sql = builder.build(dialect)?;
        run_returning(self.backend, self.logging, &sql, &returning).await
    }

    pub async fn delete(
        &mut self,
        model: &ModelDescriptor,
        filter: Option<&WhereOptions>,
        returning: Returning,
    ) -> Result<QueryResult> {
        let dialect = self.dialect();
        let mut builder = DeleteBuilder::new(model.table_name.clone()).returning(returning.clone());
        if let Some(filter) = filter {
            builder = builder.where_clause(where_condition(filter, &model.table_name, dialect)?);
        }

        let sql = builder.build(dialect);
        run_returning(self.backend, self.logging, &sql, &returning).await
    }

    pub async fn select(
        &mut self,
        registry: &Registry,
        model: &ModelDescriptor,
        options: &FindOptions,
    ) -> Result<QueryResult> {
        let sql = SelectBuilder::new(registry, model, options, self.dialect()).build()?;
        self.query(&sql).await
    }

    pub async fn count(
        &mut self,
        registry: &Registry,
        model: &ModelDescriptor,
        options: &FindOptions,
    ) -> Result<u64> {
        let sql = SelectBuilder::new(registry, model, options, self.dialect()).build_count()?;
        let rows = self.query(&sql).await?;

        let count = rows
            .first()
            .and_then(|row| row.get_i64("count").or_else(|| row.get_string("count").and_then(|s| s.parse().ok())))
            .ok_or_else(|| QueryError::Query(format!("Count of {} returned no rows", model.name)))?;

        Ok(count.max(0) as u64)
    }

    pub async fn create_table(&mut self, registry: &Registry, model: &ModelDescriptor) -> Result<()> {
        let sql = registry.generate_table_ddl(model, self.dialect());
        self.execute(&sql).await?;
        Ok(())
    }

    pub async fn drop_table(&mut self, model: &ModelDescriptor, cascade: bool) -> Result<()> {
        let sql = schema::generate_drop_table(model, cascade, self.dialect());
        self.execute(&sql).await?;
        Ok(())
    }

    /// Run a CREATE VIEW statement after checking it creates `view_name`
    pub async fn create_view(&mut self, view_name: &str, definition: &str) -> Result<()> {
        view::validate_view_name(view_name, definition)?;
        self.execute(definition).await?;
        Ok(())
    }

    pub async fn drop_view(&mut self, view_name: &str, cascade: bool) -> Result<()> {
        let sql = schema::generate_drop_view(view_name, cascade, self.dialect());
        self.execute(&sql).await?;
        Ok(())
    }

    pub async fn create_index(&mut self, model: &ModelDescriptor, index: &ColumnIndex, position: usize) -> Result<()> {
        let sql = schema::generate_create_index(model, index, position, self.dialect());
        self.execute(&sql).await?;
        Ok(())
    }

    pub async fn drop_index(&mut self, model: &ModelDescriptor, index: &ColumnIndex, position: usize) -> Result<()> {
        let sql = schema::generate_drop_index(model, index, position, self.dialect());
        self.execute(&sql).await?;
        Ok(())
    }
}

/// Open transaction on a borrowed backend.
///
/// Finish it with [`Transaction::commit`] or [`Transaction::rollback`]. A
/// guard dropped while still open leaves cleanup to the backend connection.
pub struct Transaction<'a, B: DatabaseBackend> {
    backend: &'a mut B,
    logging: SqlLogging,
    finished: bool,
}

impl<'a, B: DatabaseBackend> Transaction<'a, B> {
    pub async fn begin(backend: &'a mut B, logging: SqlLogging) -> Result<Self> {
        tracing::debug!("Beginning transaction");
        backend.begin_transaction().await?;
        Ok(Self {
            backend,
            logging,
            finished: false,
        })
    }

    pub async fn commit(mut self) -> Result<()> {
        self.finished = true;
        tracing::debug!("Committing transaction");
        self.backend.commit().await
    }

    pub async fn rollback(mut self) -> Result<()> {
        self.finished = true;
        tracing::debug!("Rolling back transaction");
        self.backend.rollback().await
    }

    pub fn dialect(&self) -> Dialect {
        self.backend.dialect()
    }

    pub async fn execute(&mut self, sql: &str) -> Result<u64> {
        run_execute(self.backend, self.logging, sql).await
    }

    pub async fn query(&mut self, sql: &str) -> Result<QueryResult> {
        run_query(self.backend, self.logging, sql).await
    }

    pub async fn insert(
        &mut self,
        model: &ModelDescriptor,
        values: &Map<String, Value>,
        returning: Returning,
    ) -> Result<QueryResult> {
        let sql = insert_sql(model, values, &returning);
        run_returning(self.backend, self.logging, &sql, &returning).await
    }
}

impl<'a, B: DatabaseBackend> Drop for Transaction<'a, B> {
    fn drop(&mut self) {
        if !self.finished {
            // async rollback is impossible here
            tracing::warn!("Transaction dropped without commit or rollback");
        }
    }
}
