use crate::backend::Dialect;
use crate::error::{QueryError, Result};
use crate::graph::Graph;
use crate::model::{ColumnIndex, ModelDescriptor};
use std::collections::HashMap;
use std::ops::ControlFlow;

/// SQL type mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlType {
    BigInt,
    Integer,
    SmallInt,
    Real,
    DoublePrecision,
    Numeric,
    Text,
    Varchar(u32),
    Boolean,
    Timestamp,
    Json,
    Bytea,
}

impl SqlType {
    pub fn to_sql(&self, dialect: Dialect) -> String {
        match (self, dialect) {
            (SqlType::BigInt, _) => "BIGINT".to_string(),
            (SqlType::Integer, _) => "INTEGER".to_string(),
            (SqlType::SmallInt, _) => "SMALLINT".to_string(),
            (SqlType::Real, _) => "REAL".to_string(),
            (SqlType::DoublePrecision, _) => "DOUBLE PRECISION".to_string(),
            (SqlType::Numeric, _) => "NUMERIC".to_string(),
            (SqlType::Text, _) => "TEXT".to_string(),
            (SqlType::Varchar(len), _) => format!("VARCHAR({})", len),
            (SqlType::Boolean, _) => "BOOLEAN".to_string(),
            (SqlType::Timestamp, Dialect::Postgres) => "TIMESTAMP WITH TIME ZONE".to_string(),
            (SqlType::Timestamp, Dialect::Sqlite) => "TIMESTAMP".to_string(),
            (SqlType::Json, Dialect::Postgres) => "JSONB".to_string(),
            (SqlType::Json, Dialect::Sqlite) => "TEXT".to_string(),
            (SqlType::Bytea, Dialect::Postgres) => "BYTEA".to_string(),
            (SqlType::Bytea, Dialect::Sqlite) => "BLOB".to_string(),
        }
    }

    /// Types whose values are coerced to JSON numbers when read from views
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            SqlType::BigInt
                | SqlType::Integer
                | SqlType::SmallInt
                | SqlType::Real
                | SqlType::DoublePrecision
                | SqlType::Numeric
        )
    }

    fn serial(&self) -> Option<&'static str> {
        match self {
            SqlType::SmallInt => Some("SMALLSERIAL"),
            SqlType::Integer => Some("SERIAL"),
            SqlType::BigInt => Some("BIGSERIAL"),
            _ => None,
        }
    }
}

/// Quote an identifier with double quotes
pub fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

/// Registry of declared models
#[derive(Debug, Clone, Default)]
pub struct Registry {
    models: Vec<ModelDescriptor>,
    by_name: HashMap<String, usize>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a model descriptor
    pub fn register(&mut self, model: ModelDescriptor) -> Result<()> {
        if self.by_name.contains_key(&model.name) {
            return Err(QueryError::Schema(format!(
                "Model {} already registered",
                model.name
            )));
        }

        self.by_name.insert(model.name.clone(), self.models.len());
        self.models.push(model);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ModelDescriptor> {
        self.by_name.get(name).map(|&i| &self.models[i])
    }

    pub fn model(&self, name: &str) -> Result<&ModelDescriptor> {
        self.get(name)
            .ok_or_else(|| QueryError::ModelNotRegistered(name.to_string()))
    }

    /// All models in registration order
    pub fn models(&self) -> impl Iterator<Item = &ModelDescriptor> {
        self.models.iter()
    }

    pub fn tables(&self) -> impl Iterator<Item = &ModelDescriptor> {
        self.models.iter().filter(|m| !m.is_view())
    }

    pub fn views(&self) -> impl Iterator<Item = &ModelDescriptor> {
        self.models.iter().filter(|m| m.is_view())
    }

    pub fn models_with_indices(&self) -> impl Iterator<Item = &ModelDescriptor> {
        self.models.iter().filter(|m| !m.indices.is_empty())
    }

    /// List all registered model names
    pub fn list_models(&self) -> Vec<String> {
        self.models.iter().map(|m| m.name.clone()).collect()
    }

    /// Graph of models reachable through associations.
    ///
    /// Many-to-many associations route through their join model. An edge
    /// already present is never added again and its target is not expanded
    /// again, so mutually referencing models terminate.
    pub fn association_graph(&self) -> Graph<String> {
        let mut graph = Graph::new();
        for model in &self.models {
            self.expand_associations(&model.name, &mut graph);
        }
        graph
    }

    fn expand_associations(&self, root: &str, graph: &mut Graph<String>) {
        let mut pending = vec![root.to_string()];

        while let Some(name) = pending.pop() {
            let Some(model) = self.get(&name) else {
                continue;
            };

            for association in &model.associations {
                let target = association.target.clone();

                match &association.through {
                    Some(through) => {
                        if graph.has_edge(&name, &through.model) {
                            continue;
                        }
                        graph.add_edge(name.clone(), [through.model.clone()]);
                        pending.push(through.model.clone());

                        if graph.has_edge(&through.model, &target) {
                            continue;
                        }
                        if !graph.has_vertex(&target) {
                            graph.add_edge(through.model.clone(), [target.clone()]);
                            pending.push(target);
                        }
                    }
                    None => {
                        if graph.has_edge(&name, &target) {
                            continue;
                        }
                        graph.add_edge(name.clone(), [target.clone()]);
                        pending.push(target);
                    }
                }
            }
        }
    }

    /// Graph of table models over foreign key references
    pub fn reference_graph(&self) -> Graph<String> {
        let mut graph = Graph::new();

        for model in self.tables() {
            if !graph.has_vertex(&model.name) {
                graph.add_vertex([model.name.clone()]);
            }
            for attribute in &model.attributes {
                if let Some(reference) = &attribute.references {
                    if reference.model != model.name
                        && !graph.has_edge(&model.name, &reference.model)
                    {
                        graph.add_edge(model.name.clone(), [reference.model.clone()]);
                    }
                }
            }
        }

        graph
    }

    /// Table models, each after the tables its foreign keys point at
    pub fn table_order(&self) -> Vec<&ModelDescriptor> {
        self.reference_graph()
            .dependency_order()
            .iter()
            .filter_map(|name| self.get(name))
            .filter(|m| !m.is_view())
            .collect()
    }

    /// Check that every model reachable through associations or references is registered
    pub fn validate(&self) -> Result<()> {
        let mut missing: Option<String> = None;

        self.association_graph().for_each(|name| {
            if self.get(name).is_none() {
                missing = Some(name.clone());
                return ControlFlow::Break(());
            }
            ControlFlow::Continue(())
        });

        if missing.is_none() {
            missing = self
                .models
                .iter()
                .flat_map(|m| m.attributes.iter())
                .filter_map(|a| a.references.as_ref())
                .find(|r| self.get(&r.model).is_none())
                .map(|r| r.model.clone());
        }

        match missing {
            Some(name) => Err(QueryError::ModelNotRegistered(name)),
            None => Ok(()),
        }
    }

    /// Generate DDL for all registered tables and their indices
    pub fn generate_ddl(&self, dialect: Dialect) -> String {
        let mut ddl = String::new();

        for model in self.table_order() {
            ddl.push_str(&self.generate_table_ddl(model, dialect));
            ddl.push_str(";\n\n");

            for (i, index) in model.indices.iter().enumerate() {
                ddl.push_str(&generate_create_index(model, index, i + 1, dialect));
                ddl.push_str(";\n\n");
            }
        }

        ddl.trim().to_string()
    }

    /// Generate CREATE TABLE SQL for a single table
    pub fn generate_table_ddl(&self, model: &ModelDescriptor, dialect: Dialect) -> String {
        let mut sql = format!("CREATE TABLE IF NOT EXISTS {} (\n", quote(&model.table_name));

        let primary_keys = model.primary_keys();
        let inline_key = primary_keys.len() == 1;

        let column_defs: Vec<String> = model
            .attributes
            .iter()
            .map(|attr| {
                let serial = attr.auto_increment && inline_key && attr.primary_key;
                let mut def = match (serial, dialect) {
                    (true, Dialect::Sqlite) => {
                        format!("    {} INTEGER PRIMARY KEY AUTOINCREMENT", quote(&attr.name))
                    }
                    (true, Dialect::Postgres) => format!(
                        "    {} {} PRIMARY KEY",
                        quote(&attr.name),
                        attr.sql_type.serial().unwrap_or("SERIAL")
                    ),
                    (false, _) => {
                        let mut def =
                            format!("    {} {}", quote(&attr.name), attr.sql_type.to_sql(dialect));
                        if attr.primary_key && inline_key {
                            def.push_str(" PRIMARY KEY");
                        } else if !attr.nullable {
                            def.push_str(" NOT NULL");
                        }
                        def
                    }
                };

                if attr.unique && !attr.primary_key {
                    def.push_str(" UNIQUE");
                }

                if let Some(default) = &attr.default {
                    def.push_str(&format!(" DEFAULT {}", default));
                }

                if let Some(reference) = &attr.references {
                    let table = self
                        .get(&reference.model)
                        .map(|m| m.table_name.as_str())
                        .unwrap_or(reference.model.as_str());
                    def.push_str(&format!(
                        " REFERENCES {} ({})",
                        quote(table),
                        quote(&reference.key)
                    ));
                }

                def
            })
            .collect();

        sql.push_str(&column_defs.join(",\n"));

        if primary_keys.len() > 1 {
            let keys: Vec<String> = primary_keys.iter().map(|k| quote(k)).collect();
            sql.push_str(&format!(",\n    PRIMARY KEY ({})", keys.join(", ")));
        }

        sql.push_str("\n)");
        sql
    }
}

/// DROP TABLE SQL
pub fn generate_drop_table(model: &ModelDescriptor, cascade: bool, dialect: Dialect) -> String {
    let cascade = if cascade && dialect.supports_cascade() {
        " CASCADE"
    } else {
        ""
    };
    format!("DROP TABLE IF EXISTS {}{}", quote(&model.table_name), cascade)
}

/// DROP VIEW SQL
pub fn generate_drop_view(view_name: &str, cascade: bool, dialect: Dialect) -> String {
    let cascade = if cascade && dialect.supports_cascade() {
        " CASCADE"
    } else {
        ""
    };
    format!("DROP VIEW IF EXISTS {}{}", quote(view_name), cascade)
}

/// DROP INDEX SQL for the index at a 1-based position
pub fn generate_drop_index(
    model: &ModelDescriptor,
    index: &ColumnIndex,
    position: usize,
    dialect: Dialect,
) -> String {
    let concurrently = if index.options.concurrently && dialect.supports_index_extensions() {
        " CONCURRENTLY"
    } else {
        ""
    };
    format!(
        "DROP INDEX{} IF EXISTS {}",
        concurrently,
        quote(&model.index_name(index, position))
    )
}

/// CREATE INDEX SQL for the index at a 1-based position.
///
/// Clause order: UNIQUE, CONCURRENTLY, IF NOT EXISTS, name, ON table, USING
/// method, column or expression with COLLATE, operator class, direction and
/// NULLS placement, TABLESPACE, WHERE predicate. Clauses SQLite lacks are
/// left out for that dialect.
pub fn generate_create_index(
    model: &ModelDescriptor,
    index: &ColumnIndex,
    position: usize,
    dialect: Dialect,
) -> String {
    let options = &index.options;
    let extended = dialect.supports_index_extensions();

    let mut sql = String::from("CREATE");
    if options.unique {
        sql.push_str(" UNIQUE");
    }
    sql.push_str(" INDEX");
    if options.concurrently && extended {
        sql.push_str(" CONCURRENTLY");
    }
    if options.safe {
        sql.push_str(" IF NOT EXISTS");
    }
    sql.push_str(&format!(
        " {} ON {}",
        quote(&model.index_name(index, position)),
        quote(&model.table_name)
    ));
    if let (Some(method), true) = (options.method, extended) {
        sql.push_str(&format!(" USING {}", method));
    }

    let mut target = match &options.expression {
        Some(expression) => format!("({})", expression),
        None => quote(&index.column),
    };
    if let Some(collation) = &options.collation {
        target.push_str(&format!(" COLLATE {}", collation));
    }
    if let (Some(op_class), true) = (&options.op_class, extended) {
        target.push_str(&format!(" {}", op_class));
    }
    if let Some(order) = options.order {
        target.push_str(&format!(" {}", order));
    }
    if extended {
        match options.nulls_first {
            Some(true) => target.push_str(" NULLS FIRST"),
            Some(false) => target.push_str(" NULLS LAST"),
            None => {}
        }
    }
    sql.push_str(&format!(" ({})", target));

    if let (Some(tablespace), true) = (&options.tablespace, extended) {
        sql.push_str(&format!(" TABLESPACE {}", tablespace));
    }
    if let Some(predicate) = &options.predicate {
        sql.push_str(&format!(" WHERE {}", predicate));
    }

    sql
}
