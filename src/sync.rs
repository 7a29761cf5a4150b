use crate::backend::{DatabaseBackend, Dialect, QueryResult};
use crate::config::DatabaseConfig;
use crate::entity::{Entity, coerce_numbers, stitch_rows};
use crate::error::{QueryError, Result};
use crate::filter::{WhereKey, WhereOptions, WhereValue};
use crate::interface::{QueryInterface, Transaction};
use crate::logging::SqlLogging;
use crate::model::ModelDescriptor;
use crate::query::FindOptions;
use crate::schema::Registry;
use crate::view;
use crate::writer::create_entity_in;
use futures::future::try_join_all;
use serde_json::Value;
use std::any::Any;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};

/// Options for [`Database::sync`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOptions {
    /// Drop tables before creating them
    pub force: bool,
    /// Leave views untouched
    pub with_no_views: bool,
    /// Create views without dropping the previous definition
    pub without_drop: bool,
    /// Drop with CASCADE where the dialect supports it
    pub cascade: bool,
}

/// Registered models bound to a backend.
///
/// The backend sits behind a shared lock; every operation takes it for the
/// duration of its statements, so a transaction never interleaves with
/// other work on the same connection.
pub struct Database<B: DatabaseBackend> {
    backend: Arc<RwLock<B>>,
    registry: Arc<Registry>,
    logging: SqlLogging,
}

impl<B: DatabaseBackend> Clone for Database<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            registry: Arc::clone(&self.registry),
            logging: self.logging,
        }
    }
}

impl<B: DatabaseBackend> Database<B> {
    /// Bind a validated registry to `backend`
    pub fn new(backend: B, registry: Registry) -> Result<Self> {
        Self::with_config(backend, registry, &DatabaseConfig::default())
    }

    pub fn with_config(backend: B, registry: Registry, config: &DatabaseConfig) -> Result<Self> {
        registry.validate()?;
        Ok(Self {
            backend: Arc::new(RwLock::new(backend)),
            registry: Arc::new(registry),
            logging: config.logging(),
        })
    }

    /// Connect through the configured connection string
    pub async fn connect(config: &DatabaseConfig, registry: Registry) -> Result<Self> {
        let url = config.connection_string()?;
        let backend = B::connect(&url).await?;
        let database = Self::with_config(backend, registry, config)?;
        tracing::info!(models = database.registry.list_models().len(), "Database models initialized...");
        Ok(database)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn model(&self, name: &str) -> Result<&ModelDescriptor> {
        self.registry.model(name)
    }

    pub async fn dialect(&self) -> Dialect {
        self.backend.read().await.dialect()
    }

    pub async fn is_connected(&self) -> bool {
        self.backend.read().await.is_connected()
    }

    /// Create tables in foreign key order, then their indices, then views.
    ///
    /// Views are created last since their definitions may select from any
    /// of the tables.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn sync(&self, options: &SyncOptions) -> Result<()> {
        for model in self.registry.table_order() {
            self.sync_model(&model.name, options).await?;
        }

        for model in self.registry.models_with_indices().filter(|m| !m.is_view()) {
            self.sync_indices(&model.name, options).await?;
        }

        if !options.with_no_views {
            let views = self
                .registry
                .views()
                .map(|model| self.sync_view(&model.name, options));
            try_join_all(views).await?;
        }

        tracing::info!("Database schema synchronized");
        Ok(())
    }

    /// Create one model; views are routed to [`Database::sync_view`]
    pub async fn sync_model(&self, name: &str, options: &SyncOptions) -> Result<()> {
        let model = self.registry.model(name)?;
        if model.is_view() {
            return self.sync_view(name, options).await;
        }

        let mut backend = self.backend.write().await;
        let mut interface = QueryInterface::new(&mut *backend, self.logging);
        if options.force {
            interface.drop_table(model, options.cascade).await?;
        }
        interface.create_table(&self.registry, model).await
    }

    /// Recreate a view from its declared definition and default parameters
    pub async fn sync_view(&self, name: &str, options: &SyncOptions) -> Result<()> {
        let model = self.registry.model(name)?;
        let definition = view::view_definition(model, None, false)?;

        let mut backend = self.backend.write().await;
        let mut interface = QueryInterface::new(&mut *backend, self.logging);
        if !options.without_drop {
            interface.drop_view(&model.table_name, options.cascade).await?;
        }
        interface.create_view(&model.table_name, &definition).await?;

        tracing::debug!(view = %model.table_name, "View synchronized");
        Ok(())
    }

    /// Create the declared indices of a model; unsafe ones are dropped first,
    /// and every one of them under `force`
    pub async fn sync_indices(&self, name: &str, options: &SyncOptions) -> Result<()> {
        let model = self.registry.model(name)?;

        let mut backend = self.backend.write().await;
        let mut interface = QueryInterface::new(&mut *backend, self.logging);
        for (i, index) in model.indices.iter().enumerate() {
            if options.force || !index.options.safe {
                interface.drop_index(model, index, i + 1).await?;
            }
            interface.create_index(model, index, i + 1).await?;
        }
        Ok(())
    }

    pub async fn drop_model(&self, name: &str, cascade: bool) -> Result<()> {
        let model = self.registry.model(name)?;

        let mut backend = self.backend.write().await;
        let mut interface = QueryInterface::new(&mut *backend, self.logging);
        if model.is_view() {
            interface.drop_view(&model.table_name, cascade).await
        } else {
            interface.drop_table(model, cascade).await
        }
    }

    /// Rows of a model as JSON objects, included associations nested
    #[tracing::instrument(level = "debug", skip(self, options))]
    pub async fn find_all(&self, name: &str, options: &FindOptions) -> Result<Vec<Value>> {
        let model = self.registry.model(name)?;

        let rows = {
            let mut backend = self.backend.write().await;
            QueryInterface::new(&mut *backend, self.logging)
                .select(&self.registry, model, options)
                .await?
        };

        let mut rows = stitch_rows(&self.registry, model, options, rows)?;
        if model.is_view() {
            for row in rows.iter_mut() {
                if let Value::Object(values) = row {
                    coerce_numbers(model, values);
                }
            }
        }
        Ok(rows)
    }

    pub async fn find_one(&self, name: &str, options: &FindOptions) -> Result<Option<Value>> {
        let options = FindOptions {
            limit: Some(1),
            ..options.clone()
        };
        Ok(self.find_all(name, &options).await?.into_iter().next())
    }

    /// Row whose first primary key equals `id`
    pub async fn find_by_pk(&self, name: &str, id: Value, options: &FindOptions) -> Result<Option<Value>> {
        let model = self.registry.model(name)?;
        let key = model
            .primary_keys()
            .first()
            .map(|k| k.to_string())
            .ok_or_else(|| QueryError::Query(format!("Model {} has no primary key", model.name)))?;

        let mut filter = options.where_.clone().unwrap_or_else(WhereOptions::new);
        filter.insert(WhereKey::Field(key), WhereValue::json(id));
        let options = FindOptions {
            where_: Some(filter),
            ..options.clone()
        };
        self.find_one(name, &options).await
    }

    pub async fn count(&self, name: &str, options: &FindOptions) -> Result<u64> {
        let model = self.registry.model(name)?;
        let mut backend = self.backend.write().await;
        QueryInterface::new(&mut *backend, self.logging)
            .count(&self.registry, model, options)
            .await
    }

    /// Create an entity and its nested children in one transaction.
    ///
    /// Any failure rolls the whole tree back and is returned to the caller.
    #[tracing::instrument(level = "debug", skip(self, input, fields))]
    pub async fn create_entity(&self, name: &str, input: &Value, fields: Option<&Value>) -> Result<Entity> {
        let model = self.registry.model(name)?;

        let mut backend = self.backend.write().await;
        let mut tx = Transaction::begin(&mut *backend, self.logging).await?;
        let result = create_entity_in(&mut tx, &self.registry, model, input, fields, None).await;

        match result {
            Ok(entity) => {
                tx.commit().await?;
                Ok(entity)
            }
            Err(e) => {
                tracing::warn!(model = %name, error = %e, "Entity creation failed, rolling back");
                tx.rollback().await?;
                Err(e)
            }
        }
    }

    pub async fn query(&self, sql: &str) -> Result<QueryResult> {
        let mut backend = self.backend.write().await;
        QueryInterface::new(&mut *backend, self.logging).query(sql).await
    }

    pub async fn execute(&self, sql: &str) -> Result<u64> {
        let mut backend = self.backend.write().await;
        QueryInterface::new(&mut *backend, self.logging).execute(sql).await
    }
}

static DATABASE: OnceCell<Arc<dyn Any + Send + Sync>> = OnceCell::const_new();

/// Process-wide database handle.
///
/// The first call connects with `init`; later calls return the same handle
/// and ignore `init`.
pub async fn database<B: DatabaseBackend + 'static>(
    init: Option<(&DatabaseConfig, Registry)>,
) -> Result<Arc<Database<B>>> {
    let handle = DATABASE
        .get_or_try_init(|| async move {
            let (config, registry) = init.ok_or_else(|| {
                QueryError::Config("First call of database() must provide valid options!".to_string())
            })?;
            let database = Database::<B>::connect(config, registry).await?;
            Ok::<_, QueryError>(Arc::new(database) as Arc<dyn Any + Send + Sync>)
        })
        .await?;

    Arc::clone(handle)
        .downcast::<Database<B>>()
        .map_err(|_| QueryError::Config("Database already initialized with another backend".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBackend;
    use crate::model::{Association, Attribute, IndexOptions, ModelBuilder};
    use crate::schema::SqlType;
    use serde_json::json;

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry
            .register(
                ModelBuilder::view(
                    "OrderTotals",
                    "CREATE VIEW \"OrderTotals\" AS SELECT \"orderId\", SUM(\"qty\") AS \"qty\" FROM \"OrderLine\" GROUP BY \"orderId\"",
                )
                .attribute(Attribute::new("orderId", SqlType::Integer).primary_key())
                .attribute(Attribute::new("qty", SqlType::Integer))
                .build()
                .unwrap(),
            )
            .unwrap();
        registry
            .register(
                ModelBuilder::table("OrderLine")
                    .attribute(Attribute::new("id", SqlType::Integer).primary_key().auto_increment())
                    .attribute(Attribute::new("orderId", SqlType::Integer).references("Order", "id"))
                    .attribute(Attribute::new("qty", SqlType::Integer).not_null())
                    .index("orderId", IndexOptions::default())
                    .build()
                    .unwrap(),
            )
            .unwrap();
        registry
            .register(
                ModelBuilder::table("Order")
                    .attribute(Attribute::new("id", SqlType::Integer).primary_key().auto_increment())
                    .attribute(Attribute::new("total", SqlType::Integer))
                    .association(Association::has_many("lines", "OrderLine", "orderId"))
                    .build()
                    .unwrap(),
            )
            .unwrap();
        registry
    }

    async fn statements(database: &Database<MockBackend>) -> Vec<String> {
        database.backend.read().await.statements()
    }

    fn position(statements: &[String], prefix: &str) -> usize {
        statements
            .iter()
            .position(|s| s.starts_with(prefix))
            .unwrap_or_else(|| panic!("no statement starting with {}", prefix))
    }

    #[tokio::test]
    async fn test_sync_orders_tables_indices_views() {
        let database = Database::new(MockBackend::new(), registry()).unwrap();
        database.sync(&SyncOptions::default()).await.unwrap();

        let executed = statements(&database).await;
        let order = position(&executed, "CREATE TABLE IF NOT EXISTS \"Order\"");
        let line = position(&executed, "CREATE TABLE IF NOT EXISTS \"OrderLine\"");
        let drop_index = position(&executed, "DROP INDEX IF EXISTS \"OrderLine_orderId_idx1\"");
        let create_index = position(&executed, "CREATE INDEX");
        let drop_view = position(&executed, "DROP VIEW IF EXISTS \"OrderTotals\"");
        let create_view = position(&executed, "CREATE VIEW \"OrderTotals\"");

        assert!(order < line);
        assert!(line < drop_index);
        assert!(drop_index < create_index);
        assert!(create_index < drop_view);
        assert!(drop_view < create_view);
        assert_eq!(executed.len(), 6);
    }

    #[tokio::test]
    async fn test_sync_without_views() {
        let database = Database::new(MockBackend::new(), registry()).unwrap();
        let options = SyncOptions {
            with_no_views: true,
            ..Default::default()
        };
        database.sync(&options).await.unwrap();

        assert!(!statements(&database).await.iter().any(|s| s.contains("VIEW")));
    }

    #[tokio::test]
    async fn test_force_drops_tables() {
        let database = Database::new(MockBackend::new(), registry()).unwrap();
        let options = SyncOptions {
            force: true,
            ..Default::default()
        };
        database.sync_model("Order", &options).await.unwrap();

        let executed = statements(&database).await;
        assert_eq!(executed[0], "DROP TABLE IF EXISTS \"Order\"");
        assert!(executed[1].starts_with("CREATE TABLE IF NOT EXISTS \"Order\""));
    }

    #[tokio::test]
    async fn test_cascade_on_postgres() {
        let database = Database::new(MockBackend::with_dialect(Dialect::Postgres), registry()).unwrap();
        let options = SyncOptions {
            force: true,
            cascade: true,
            ..Default::default()
        };
        database.sync_model("OrderTotals", &options).await.unwrap();

        assert_eq!(statements(&database).await[0], "DROP VIEW IF EXISTS \"OrderTotals\" CASCADE");
    }

    #[tokio::test]
    async fn test_view_without_drop() {
        let database = Database::new(MockBackend::new(), registry()).unwrap();
        let options = SyncOptions {
            without_drop: true,
            ..Default::default()
        };
        database.sync_view("OrderTotals", &options).await.unwrap();

        let executed = statements(&database).await;
        assert_eq!(executed.len(), 1);
        assert!(executed[0].starts_with("CREATE VIEW"));
    }

    #[tokio::test]
    async fn test_view_name_mismatch() {
        let mut registry = Registry::new();
        registry
            .register(
                ModelBuilder::view("Totals", "CREATE VIEW \"Other\" AS SELECT 1 AS \"one\"")
                    .build()
                    .unwrap(),
            )
            .unwrap();
        let database = Database::new(MockBackend::new(), registry).unwrap();

        let err = database.sync(&SyncOptions::default()).await.unwrap_err();
        assert!(matches!(err, QueryError::View(_)));
        assert!(!statements(&database).await.iter().any(|s| s.starts_with("CREATE VIEW")));
    }

    #[tokio::test]
    async fn test_safe_index_is_not_dropped() {
        let mut registry = Registry::new();
        registry
            .register(
                ModelBuilder::table("Tag")
                    .attribute(Attribute::new("label", SqlType::Text))
                    .index(
                        "label",
                        IndexOptions {
                            safe: true,
                            ..Default::default()
                        },
                    )
                    .build()
                    .unwrap(),
            )
            .unwrap();
        let database = Database::new(MockBackend::new(), registry).unwrap();
        database.sync_indices("Tag", &SyncOptions::default()).await.unwrap();

        let executed = statements(&database).await;
        assert_eq!(executed.len(), 1);
        assert!(executed[0].starts_with("CREATE INDEX IF NOT EXISTS"));

        let forced = SyncOptions {
            force: true,
            ..Default::default()
        };
        database.sync_indices("Tag", &forced).await.unwrap();

        let executed = statements(&database).await;
        assert_eq!(executed.len(), 3);
        assert!(executed[1].starts_with("DROP INDEX IF EXISTS"));
        assert!(executed[2].starts_with("CREATE INDEX IF NOT EXISTS"));
    }

    #[tokio::test]
    async fn test_unregistered_reference_is_rejected() {
        let mut registry = Registry::new();
        registry
            .register(
                ModelBuilder::table("OrderLine")
                    .attribute(Attribute::new("orderId", SqlType::Integer).references("Order", "id"))
                    .build()
                    .unwrap(),
            )
            .unwrap();

        let result = Database::new(MockBackend::new(), registry);
        assert!(matches!(result, Err(QueryError::ModelNotRegistered(name)) if name == "Order"));
    }

    #[tokio::test]
    async fn test_create_entity_commits() {
        let mut backend = MockBackend::new();
        backend.respond(vec![json!({ "id": 1, "total": 5 })]);
        backend.respond(vec![json!({ "id": 10, "orderId": 1, "qty": 2 })]);
        let database = Database::new(backend, registry()).unwrap();

        let entity = database
            .create_entity("Order", &json!({ "total": 5, "lines": [{ "qty": 2 }] }), None)
            .await
            .unwrap();

        assert_eq!(entity.get("lines"), Some(&json!([{ "id": 10, "orderId": 1, "qty": 2 }])));
        let executed = statements(&database).await;
        assert_eq!(executed.first().map(String::as_str), Some("BEGIN"));
        assert_eq!(executed.last().map(String::as_str), Some("COMMIT"));
    }

    #[tokio::test]
    async fn test_create_entity_rolls_back() {
        let mut backend = MockBackend::new();
        backend.respond(vec![json!({ "id": 1, "total": 5 })]);
        backend.fail_on("INSERT INTO \"OrderLine\"");
        let database = Database::new(backend, registry()).unwrap();

        let result = database
            .create_entity("Order", &json!({ "total": 5, "lines": [{ "qty": 2 }] }), None)
            .await;

        assert!(matches!(result, Err(QueryError::Database(_))));
        let executed = statements(&database).await;
        assert_eq!(executed.last().map(String::as_str), Some("ROLLBACK"));
        assert!(!executed.iter().any(|s| s == "COMMIT"));
    }

    #[tokio::test]
    async fn test_find_all_nests_includes() {
        let mut backend = MockBackend::new();
        backend.respond(vec![
            json!({ "id": 1, "total": 5, "lines.id": 10, "lines.qty": 2 }),
            json!({ "id": 1, "total": 5, "lines.id": 11, "lines.qty": 3 }),
        ]);
        let database = Database::new(backend, registry()).unwrap();

        let options: FindOptions = serde_json::from_value(json!({
            "attributes": ["id", "total"],
            "include": [{ "model": "OrderLine", "as": "lines", "attributes": ["id", "qty"] }]
        }))
        .unwrap();
        let rows = database.find_all("Order", &options).await.unwrap();

        assert_eq!(
            rows,
            vec![json!({ "id": 1, "total": 5, "lines": [{ "id": 10, "qty": 2 }, { "id": 11, "qty": 3 }] })]
        );
        assert!(statements(&database).await[0].contains("LEFT OUTER JOIN \"OrderLine\" AS \"lines\""));
    }

    #[tokio::test]
    async fn test_find_all_coerces_view_numbers() {
        let mut backend = MockBackend::new();
        backend.respond(vec![json!({ "orderId": "1", "qty": "5" })]);
        let database = Database::new(backend, registry()).unwrap();

        let rows = database.find_all("OrderTotals", &FindOptions::default()).await.unwrap();
        assert_eq!(rows, vec![json!({ "orderId": 1, "qty": 5 })]);
    }

    #[tokio::test]
    async fn test_find_by_pk() {
        let mut backend = MockBackend::new();
        backend.respond(vec![json!({ "id": 7, "total": 1 })]);
        let database = Database::new(backend, registry()).unwrap();

        let row = database.find_by_pk("Order", json!(7), &FindOptions::default()).await.unwrap();
        assert_eq!(row, Some(json!({ "id": 7, "total": 1 })));

        let sql = &statements(&database).await[0];
        assert!(sql.contains("\"Order\".\"id\" = 7"));
        assert!(sql.contains("LIMIT 1"));
    }

    #[tokio::test]
    async fn test_find_one_empty() {
        let database = Database::new(MockBackend::new(), registry()).unwrap();
        let row = database.find_one("Order", &FindOptions::default()).await.unwrap();
        assert!(row.is_none());
    }

    #[tokio::test]
    async fn test_count() {
        let mut backend = MockBackend::new();
        backend.respond(vec![json!({ "count": "3" })]);
        let database = Database::new(backend, registry()).unwrap();

        assert_eq!(database.count("Order", &FindOptions::default()).await.unwrap(), 3);
        assert!(statements(&database).await[0].starts_with("SELECT COUNT(*) AS \"count\""));
    }

    #[tokio::test]
    async fn test_unknown_model() {
        let database = Database::new(MockBackend::new(), registry()).unwrap();
        let result = database.find_all("Missing", &FindOptions::default()).await;
        assert!(matches!(result, Err(QueryError::ModelNotRegistered(_))));
    }

    #[tokio::test]
    async fn test_global_database() {
        let err = database::<MockBackend>(None).await.err().unwrap();
        assert!(matches!(err, QueryError::Config(_)));

        let config = DatabaseConfig::new("mock://");
        let first = database::<MockBackend>(Some((&config, registry()))).await.unwrap();
        let again = database::<MockBackend>(None).await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(first.registry().list_models().len(), 3);
    }
}
