//! Model declarations.
//!
//! A [`ModelDescriptor`] is built once with [`ModelBuilder`] and never
//! mutated afterwards. Tables and views share the descriptor; the
//! [`ModelKind`] tag decides how synchronization and querying treat them.

use crate::error::{QueryError, Result};
use crate::schema::SqlType;
use crate::view;
use serde_json::{Map, Value};
use std::fmt;

/// Foreign key target of an attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub model: String,
    pub key: String,
}

/// Column declaration
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub sql_type: SqlType,
    pub primary_key: bool,
    pub nullable: bool,
    pub auto_increment: bool,
    pub unique: bool,
    pub default: Option<String>,
    pub references: Option<Reference>,
}

impl Attribute {
    pub fn new(name: impl Into<String>, sql_type: SqlType) -> Self {
        Self {
            name: name.into(),
            sql_type,
            primary_key: false,
            nullable: true,
            auto_increment: false,
            unique: false,
            default: None,
            references: None,
        }
    }

    /// Primary key column, implicitly NOT NULL
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Raw SQL default expression
    pub fn default_value(mut self, sql: impl Into<String>) -> Self {
        self.default = Some(sql.into());
        self
    }

    pub fn references(mut self, model: impl Into<String>, key: impl Into<String>) -> Self {
        self.references = Some(Reference {
            model: model.into(),
            key: key.into(),
        });
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationKind {
    BelongsTo,
    HasOne,
    HasMany,
    BelongsToMany,
}

impl AssociationKind {
    /// Whether the association resolves to a list of rows
    pub fn is_many(&self) -> bool {
        matches!(self, AssociationKind::HasMany | AssociationKind::BelongsToMany)
    }
}

/// Join model of a many-to-many association
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Through {
    pub model: String,
    /// Column on the join model pointing at the target
    pub other_key: String,
}

/// Relationship from the declaring model to `target`.
///
/// `foreign_key` lives on the declaring model for belongs-to, on the target
/// for has-one/has-many, and on the join model for belongs-to-many.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Association {
    pub alias: String,
    pub target: String,
    pub kind: AssociationKind,
    pub foreign_key: String,
    pub source_key: Option<String>,
    pub target_key: Option<String>,
    pub through: Option<Through>,
}

impl Association {
    fn new(
        kind: AssociationKind,
        alias: impl Into<String>,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self {
            alias: alias.into(),
            target: target.into(),
            kind,
            foreign_key: foreign_key.into(),
            source_key: None,
            target_key: None,
            through: None,
        }
    }

    pub fn belongs_to(
        alias: impl Into<String>,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self::new(AssociationKind::BelongsTo, alias, target, foreign_key)
    }

    pub fn has_one(
        alias: impl Into<String>,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self::new(AssociationKind::HasOne, alias, target, foreign_key)
    }

    pub fn has_many(
        alias: impl Into<String>,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self::new(AssociationKind::HasMany, alias, target, foreign_key)
    }

    pub fn belongs_to_many(
        alias: impl Into<String>,
        target: impl Into<String>,
        through: impl Into<String>,
        foreign_key: impl Into<String>,
        other_key: impl Into<String>,
    ) -> Self {
        let mut association =
            Self::new(AssociationKind::BelongsToMany, alias, target, foreign_key);
        association.through = Some(Through {
            model: through.into(),
            other_key: other_key.into(),
        });
        association
    }

    /// Key on the declaring model matched by the join (defaults to its primary key)
    pub fn source_key(mut self, key: impl Into<String>) -> Self {
        self.source_key = Some(key.into());
        self
    }

    /// Key on the target model matched by the join (defaults to its primary key)
    pub fn target_key(mut self, key: impl Into<String>) -> Self {
        self.target_key = Some(key.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexMethod {
    Btree,
    Hash,
    Gist,
    Spgist,
    Gin,
    Brin,
}

impl fmt::Display for IndexMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexMethod::Btree => write!(f, "BTREE"),
            IndexMethod::Hash => write!(f, "HASH"),
            IndexMethod::Gist => write!(f, "GIST"),
            IndexMethod::Spgist => write!(f, "SPGIST"),
            IndexMethod::Gin => write!(f, "GIN"),
            IndexMethod::Brin => write!(f, "BRIN"),
        }
    }
}

/// Sort direction, used by indices and ORDER BY
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SortOrder {
    #[serde(rename = "ASC")]
    Asc,
    #[serde(rename = "DESC")]
    Desc,
}

impl SortOrder {
    /// `desc` in any case is descending, everything else ascending
    pub fn parse(direction: &str) -> Self {
        if direction.eq_ignore_ascii_case("desc") {
            SortOrder::Desc
        } else {
            SortOrder::Asc
        }
    }
}

impl fmt::Display for SortOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortOrder::Asc => write!(f, "ASC"),
            SortOrder::Desc => write!(f, "DESC"),
        }
    }
}

/// Options of a single-column index
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexOptions {
    pub name: Option<String>,
    pub method: Option<IndexMethod>,
    pub unique: bool,
    pub concurrently: bool,
    /// Create with IF NOT EXISTS instead of dropping first
    pub safe: bool,
    pub nulls_first: Option<bool>,
    pub order: Option<SortOrder>,
    pub predicate: Option<String>,
    pub expression: Option<String>,
    pub collation: Option<String>,
    pub op_class: Option<String>,
    pub tablespace: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnIndex {
    pub column: String,
    pub options: IndexOptions,
}

/// Stored view query with default placeholder values
#[derive(Debug, Clone, PartialEq)]
pub struct ViewDefinition {
    pub template: String,
    pub params: Map<String, Value>,
    /// Placeholders are resolved per query, not only at creation
    pub dynamic: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModelKind {
    Table,
    View(ViewDefinition),
}

/// Immutable metadata of one declared model
#[derive(Debug, Clone, PartialEq)]
pub struct ModelDescriptor {
    pub name: String,
    pub table_name: String,
    pub attributes: Vec<Attribute>,
    pub associations: Vec<Association>,
    pub indices: Vec<ColumnIndex>,
    pub kind: ModelKind,
}

impl ModelDescriptor {
    pub fn is_view(&self) -> bool {
        matches!(self.kind, ModelKind::View(_))
    }

    pub fn view(&self) -> Option<&ViewDefinition> {
        match &self.kind {
            ModelKind::View(definition) => Some(definition),
            ModelKind::Table => None,
        }
    }

    pub fn is_dynamic_view(&self) -> bool {
        self.view().is_some_and(|v| v.dynamic)
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.attribute(name).is_some()
    }

    pub fn association(&self, alias: &str) -> Option<&Association> {
        self.associations.iter().find(|a| a.alias == alias)
    }

    pub fn attribute_names(&self) -> impl Iterator<Item = &str> {
        self.attributes.iter().map(|a| a.name.as_str())
    }

    pub fn primary_keys(&self) -> Vec<&str> {
        self.attributes
            .iter()
            .filter(|a| a.primary_key)
            .map(|a| a.name.as_str())
            .collect()
    }

    /// Name of the index at a 1-based declaration position
    pub fn index_name(&self, index: &ColumnIndex, position: usize) -> String {
        index
            .options
            .name
            .clone()
            .unwrap_or_else(|| format!("{}_{}_idx{}", self.table_name, index.column, position))
    }
}

/// Builder for [`ModelDescriptor`]
#[derive(Debug, Clone)]
pub struct ModelBuilder {
    name: String,
    table_name: Option<String>,
    attributes: Vec<Attribute>,
    associations: Vec<Association>,
    indices: Vec<ColumnIndex>,
    view: Option<ViewDefinition>,
}

impl ModelBuilder {
    pub fn table(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table_name: None,
            attributes: Vec::new(),
            associations: Vec::new(),
            indices: Vec::new(),
            view: None,
        }
    }

    /// View created once from `definition`
    pub fn view(name: impl Into<String>, definition: impl Into<String>) -> Self {
        let mut builder = Self::table(name);
        builder.view = Some(ViewDefinition {
            template: definition.into(),
            params: Map::new(),
            dynamic: false,
        });
        builder
    }

    /// View whose `@{name}` placeholders may be substituted per query
    pub fn dynamic_view(name: impl Into<String>, definition: impl Into<String>) -> Self {
        let mut builder = Self::view(name, definition);
        if let Some(view) = builder.view.as_mut() {
            view.dynamic = true;
        }
        builder
    }

    pub fn table_name(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = Some(table_name.into());
        self
    }

    pub fn attribute(mut self, attribute: Attribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn association(mut self, association: Association) -> Self {
        self.associations.push(association);
        self
    }

    pub fn index(mut self, column: impl Into<String>, options: IndexOptions) -> Self {
        self.indices.push(ColumnIndex {
            column: column.into(),
            options,
        });
        self
    }

    /// Pair of partial indices covering the NULL and NOT NULL halves of a column
    pub fn nullable_index(self, column: impl Into<String>, options: IndexOptions) -> Self {
        let column = column.into();
        let null = format!("\"{}\" IS NULL", column);
        let not_null = format!("\"{}\" IS NOT NULL", column);

        let is_null = IndexOptions {
            expression: Some(null.clone()),
            predicate: Some(null),
            ..options.clone()
        };
        let is_not_null = IndexOptions {
            expression: Some(not_null.clone()),
            predicate: Some(not_null),
            ..options
        };

        self.index(column.clone(), is_null).index(column, is_not_null)
    }

    /// Default value of a view placeholder
    pub fn view_param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        if let Some(view) = self.view.as_mut() {
            view.params.insert(name.into(), value.into());
        }
        self
    }

    pub fn build(self) -> Result<ModelDescriptor> {
        for (i, attribute) in self.attributes.iter().enumerate() {
            if self.attributes[..i].iter().any(|a| a.name == attribute.name) {
                return Err(QueryError::Declaration(format!(
                    "Attribute {} declared twice on model {}",
                    attribute.name, self.name
                )));
            }
        }

        for association in &self.associations {
            if self.attributes.iter().any(|a| a.name == association.alias) {
                return Err(QueryError::Declaration(format!(
                    "Association {} on model {} shadows an attribute",
                    association.alias, self.name
                )));
            }
        }

        for index in &self.indices {
            if index.options.expression.is_none()
                && !self.attributes.iter().any(|a| a.name == index.column)
            {
                return Err(QueryError::Declaration(format!(
                    "Index on unknown column {} of model {}",
                    index.column, self.name
                )));
            }
        }

        let kind = match self.view {
            Some(definition) => {
                if definition.template.trim().is_empty() {
                    return Err(QueryError::Declaration(
                        "View definition is missing!".to_string(),
                    ));
                }
                if definition.dynamic {
                    for param in view::placeholders(&definition.template) {
                        if !definition.params.contains_key(&param) {
                            return Err(QueryError::Declaration(format!(
                                "View definition contains param '{}', but it was not provided",
                                param
                            )));
                        }
                    }
                }
                ModelKind::View(definition)
            }
            None => ModelKind::Table,
        };

        Ok(ModelDescriptor {
            table_name: self.table_name.unwrap_or_else(|| self.name.clone()),
            name: self.name,
            attributes: self.attributes,
            associations: self.associations,
            indices: self.indices,
            kind,
        })
    }
}
