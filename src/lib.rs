//! model-query - Model-driven queries and schema sync for SQL databases
//!
//! model-query sits between application code and a relational database. Models
//! are declared once, with attributes, associations, indices and optional view
//! definitions; from them the crate derives DDL, SELECT statements with joined
//! includes, and nested entity writes.
//!
//! # Architecture
//!
//! - **Models → Registry**: Declarations are validated and ordered by their references
//! - **Field Trees → Find Options**: Requested fields become attributes and includes
//! - **Filters → WHERE**: `$`-operator filter objects render to SQL conditions
//! - **Multiple Backends**: SQLite and PostgreSQL through sqlx
//!
//! # Features
//!
//! - **Schema Sync**: Tables in dependency order, then indices, then views
//! - **Auto Query**: Find options built from a tree of requested fields
//! - **Nested Writes**: An entity and its children created in one transaction
//! - **Dynamic Views**: View definitions with `@{param}` placeholders used as subqueries
//!
//! # Example
//!
//! ```rust,no_run
//! use model_query::prelude::*;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let mut registry = Registry::new();
//!     registry.register(
//!         ModelBuilder::table("Order")
//!             .attribute(Attribute::new("id", SqlType::Integer).primary_key().auto_increment())
//!             .attribute(Attribute::new("total", SqlType::Integer))
//!             .association(Association::has_many("lines", "OrderLine", "orderId"))
//!             .build()?,
//!     )?;
//!     registry.register(
//!         ModelBuilder::table("OrderLine")
//!             .attribute(Attribute::new("id", SqlType::Integer).primary_key().auto_increment())
//!             .attribute(Attribute::new("orderId", SqlType::Integer).references("Order", "id"))
//!             .attribute(Attribute::new("qty", SqlType::Integer))
//!             .build()?,
//!     )?;
//!
//!     #[cfg(feature = "sqlite")]
//!     {
//!         let config = DatabaseConfig::new("sqlite::memory:");
//!         let db = Database::<SqliteBackend>::connect(&config, registry).await?;
//!         db.sync(&SyncOptions::default()).await?;
//!
//!         db.create_entity("Order", &json!({ "total": 5, "lines": [{ "qty": 2 }] }), None)
//!             .await?;
//!
//!         let options = auto_query(db.registry(), "Order", &json!({ "total": true, "lines": { "qty": true } }), &[])?;
//!         let orders = db.find_all("Order", &options).await?;
//!         println!("Orders: {:?}", orders);
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! # Backend Support
//!
//! Enable backends via Cargo features:
//!
//! ```toml
//! [dependencies]
//! model-query = { version = "0.1", features = ["postgres", "sqlite"] }
//! ```

pub mod backend;
pub mod builder;
pub mod config;
pub mod entity;
pub mod error;
pub mod filter;
pub mod graph;
pub mod interface;
pub mod logging;
pub mod model;
pub mod query;
pub mod schema;
pub mod sync;
pub mod view;
pub mod writer;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(test)]
mod mock;

pub use backend::{DatabaseBackend, Dialect, QueryResult, QueryRow};
pub use builder::{
    ComparisonOp, Condition, DeleteBuilder, InsertBuilder, JoinType, LogicalOp, Returning,
    SelectBuilder, UpdateBuilder,
};
pub use config::DatabaseConfig;
pub use entity::Entity;
pub use error::{QueryError, Result};
pub use filter::{WhereKey, WhereOptions, WhereValue, to_where_options};
pub use graph::Graph;
pub use interface::{QueryInterface, Transaction};
pub use model::{
    Association, AssociationKind, Attribute, IndexOptions, ModelBuilder, ModelDescriptor, SortOrder,
};
pub use query::{FindOptions, IncludeOptions, OrderItem, PaginationInput, auto_count_query, auto_query};
pub use schema::{Registry, SqlType};
pub use sync::{Database, SyncOptions, database};

#[cfg(feature = "postgres")]
pub use postgres::PostgresBackend;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteBackend;

/// Prelude for common imports
pub mod prelude {
    pub use crate::backend::{DatabaseBackend, Dialect, QueryResult, QueryRow};
    pub use crate::config::DatabaseConfig;
    pub use crate::entity::Entity;
    pub use crate::error::{QueryError, Result};
    pub use crate::filter::{WhereOptions, to_where_options};
    pub use crate::model::{Association, Attribute, IndexOptions, ModelBuilder, SortOrder};
    pub use crate::query::{FindOptions, IncludeOptions, auto_count_query, auto_query, merge_query};
    pub use crate::schema::{Registry, SqlType};
    pub use crate::sync::{Database, SyncOptions, database};

    #[cfg(feature = "postgres")]
    pub use crate::postgres::PostgresBackend;

    #[cfg(feature = "sqlite")]
    pub use crate::sqlite::SqliteBackend;
}
