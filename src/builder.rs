use crate::backend::Dialect;
use crate::error::{QueryError, Result};
use crate::filter::{Operator, WhereKey, WhereOptions, WhereValue};
use crate::model::{Association, AssociationKind, ModelDescriptor};
use crate::query::{FindOptions, IncludeOptions, OrderItem};
use crate::schema::{Registry, quote};
use crate::view;
use serde_json::{Map, Value};
use std::fmt;

/// Comparison operators for WHERE clauses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Is,
    IsNot,
    Like,
    NotLike,
    ILike,
    NotILike,
    In,
    NotIn,
    Between,
    NotBetween,
    Regexp,
    NotRegexp,
    IRegexp,
    NotIRegexp,
    Overlap,
    Contains,
    Contained,
    Any,
    Adjacent,
    StrictLeft,
    StrictRight,
    NoExtendRight,
    NoExtendLeft,
    IsNull,
    IsNotNull,
}

impl ComparisonOp {
    pub fn to_sql(&self, dialect: Dialect) -> &'static str {
        match (self, dialect) {
            (ComparisonOp::Eq, _) => "=",
            (ComparisonOp::Ne, _) => "!=",
            (ComparisonOp::Lt, _) => "<",
            (ComparisonOp::Le, _) => "<=",
            (ComparisonOp::Gt, _) => ">",
            (ComparisonOp::Ge, _) => ">=",
            (ComparisonOp::Is, _) => "IS",
            (ComparisonOp::IsNot, _) => "IS NOT",
            (ComparisonOp::Like, _) => "LIKE",
            (ComparisonOp::NotLike, _) => "NOT LIKE",
            (ComparisonOp::ILike, Dialect::Postgres) => "ILIKE",
            (ComparisonOp::ILike, Dialect::Sqlite) => "LIKE",
            (ComparisonOp::NotILike, Dialect::Postgres) => "NOT ILIKE",
            (ComparisonOp::NotILike, Dialect::Sqlite) => "NOT LIKE",
            (ComparisonOp::In, _) => "IN",
            (ComparisonOp::NotIn, _) => "NOT IN",
            (ComparisonOp::Between, _) => "BETWEEN",
            (ComparisonOp::NotBetween, _) => "NOT BETWEEN",
            (ComparisonOp::Regexp, Dialect::Postgres) => "~",
            (ComparisonOp::Regexp, Dialect::Sqlite) => "REGEXP",
            (ComparisonOp::NotRegexp, Dialect::Postgres) => "!~",
            (ComparisonOp::NotRegexp, Dialect::Sqlite) => "NOT REGEXP",
            (ComparisonOp::IRegexp, Dialect::Postgres) => "~*",
            (ComparisonOp::IRegexp, Dialect::Sqlite) => "REGEXP",
            (ComparisonOp::NotIRegexp, Dialect::Postgres) => "!~*",
            (ComparisonOp::NotIRegexp, Dialect::Sqlite) => "NOT REGEXP",
            (ComparisonOp::Overlap, _) => "&&",
            (ComparisonOp::Contains, _) => "@>",
            (ComparisonOp::Contained, _) => "<@",
            (ComparisonOp::Any, _) => "= ANY",
            (ComparisonOp::Adjacent, _) => "-|-",
            (ComparisonOp::StrictLeft, _) => "<<",
            (ComparisonOp::StrictRight, _) => ">>",
            (ComparisonOp::NoExtendRight, _) => "&<",
            (ComparisonOp::NoExtendLeft, _) => "&>",
            (ComparisonOp::IsNull, _) => "IS NULL",
            (ComparisonOp::IsNotNull, _) => "IS NOT NULL",
        }
    }

    fn for_operator(op: Operator) -> Option<Self> {
        Some(match op {
            Operator::Gt => ComparisonOp::Gt,
            Operator::Gte => ComparisonOp::Ge,
            Operator::Lt => ComparisonOp::Lt,
            Operator::Lte => ComparisonOp::Le,
            Operator::Like => ComparisonOp::Like,
            Operator::NotLike => ComparisonOp::NotLike,
            Operator::ILike => ComparisonOp::ILike,
            Operator::NotILike => ComparisonOp::NotILike,
            Operator::Regexp => ComparisonOp::Regexp,
            Operator::NotRegexp => ComparisonOp::NotRegexp,
            Operator::IRegexp => ComparisonOp::IRegexp,
            Operator::NotIRegexp => ComparisonOp::NotIRegexp,
            Operator::Overlap => ComparisonOp::Overlap,
            Operator::Contains => ComparisonOp::Contains,
            Operator::Contained => ComparisonOp::Contained,
            Operator::Any => ComparisonOp::Any,
            Operator::Adjacent => ComparisonOp::Adjacent,
            Operator::StrictLeft => ComparisonOp::StrictLeft,
            Operator::StrictRight => ComparisonOp::StrictRight,
            Operator::NoExtendRight => ComparisonOp::NoExtendRight,
            Operator::NoExtendLeft => ComparisonOp::NoExtendLeft,
            _ => return None,
        })
    }

    fn takes_array(&self) -> bool {
        matches!(
            self,
            ComparisonOp::Overlap
                | ComparisonOp::Contains
                | ComparisonOp::Contained
                | ComparisonOp::Any
                | ComparisonOp::Adjacent
                | ComparisonOp::StrictLeft
                | ComparisonOp::StrictRight
                | ComparisonOp::NoExtendRight
                | ComparisonOp::NoExtendLeft
        )
    }
}

/// Logical operators for combining conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

impl fmt::Display for LogicalOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogicalOp::And => write!(f, "AND"),
            LogicalOp::Or => write!(f, "OR"),
        }
    }
}

/// Join type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    Left,
}

impl fmt::Display for JoinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinType::Inner => write!(f, "INNER JOIN"),
            JoinType::Left => write!(f, "LEFT OUTER JOIN"),
        }
    }
}

/// WHERE condition
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Simple {
        column: String,
        op: ComparisonOp,
        value: Option<Value>,
    },
    Compound {
        conditions: Vec<Condition>,
        op: LogicalOp,
    },
    Not(Box<Condition>),
    Raw(String),
}

impl Condition {
    pub fn eq(column: impl Into<String>, value: Value) -> Self {
        Condition::Simple {
            column: column.into(),
            op: ComparisonOp::Eq,
            value: Some(value),
        }
    }

    /// Conjunction, collapsing the single-condition case
    pub fn all(mut conditions: Vec<Condition>) -> Self {
        if conditions.len() == 1 {
            return conditions.remove(0);
        }
        Condition::Compound {
            conditions,
            op: LogicalOp::And,
        }
    }

    pub fn any(mut conditions: Vec<Condition>) -> Self {
        if conditions.len() == 1 {
            return conditions.remove(0);
        }
        Condition::Compound {
            conditions,
            op: LogicalOp::Or,
        }
    }

    pub fn to_sql(&self, dialect: Dialect) -> String {
        match self {
            Condition::Simple { column, op, value } => {
                let sql_op = op.to_sql(dialect);
                match (op, value) {
                    (ComparisonOp::IsNull | ComparisonOp::IsNotNull, _) => {
                        format!("{} {}", column, sql_op)
                    }
                    (ComparisonOp::In | ComparisonOp::NotIn, Some(Value::Array(items))) => {
                        if items.is_empty() {
                            format!("{} {} (NULL)", column, sql_op)
                        } else {
                            format!("{} {} ({})", column, sql_op, format_list(items))
                        }
                    }
                    (ComparisonOp::Between | ComparisonOp::NotBetween, Some(Value::Array(items)))
                        if items.len() == 2 =>
                    {
                        format!(
                            "{} {} {} AND {}",
                            column,
                            sql_op,
                            format_value(&items[0]),
                            format_value(&items[1])
                        )
                    }
                    (ComparisonOp::Any, Some(Value::Array(items))) => {
                        format!("{} {} (ARRAY[{}])", column, sql_op, format_list(items))
                    }
                    (op, Some(Value::Array(items))) if op.takes_array() => {
                        format!("{} {} ARRAY[{}]", column, sql_op, format_list(items))
                    }
                    (_, value) => {
                        let val = value
                            .as_ref()
                            .map(format_value)
                            .unwrap_or_else(|| "NULL".to_string());
                        format!("{} {} {}", column, sql_op, val)
                    }
                }
            }
            Condition::Compound { conditions, op } => {
                if conditions.is_empty() {
                    match op {
                        LogicalOp::And => "1 = 1".to_string(),
                        LogicalOp::Or => "0 = 1".to_string(),
                    }
                } else {
                    let parts = conditions
                        .iter()
                        .map(|c| c.to_sql(dialect))
                        .collect::<Vec<_>>()
                        .join(&format!(" {} ", op));
                    format!("({})", parts)
                }
            }
            Condition::Not(inner) => format!("NOT ({})", inner.to_sql(dialect)),
            Condition::Raw(sql) => sql.clone(),
        }
    }
}

/// Column reference, optionally descending into a JSON document
#[derive(Debug, Clone)]
struct ColumnRef {
    column: String,
    path: Vec<String>,
}

impl ColumnRef {
    fn new(qualifier: &str, name: &str) -> Self {
        Self {
            column: format!("{}.{}", quote(qualifier), quote(name)),
            path: Vec::new(),
        }
    }

    fn child(&self, key: &str) -> Self {
        let mut path = self.path.clone();
        path.push(key.to_string());
        Self {
            column: self.column.clone(),
            path,
        }
    }

    fn to_sql(&self, dialect: Dialect) -> String {
        if self.path.is_empty() {
            return self.column.clone();
        }
        match dialect {
            Dialect::Sqlite => format!(
                "json_extract({}, '$.{}')",
                self.column,
                self.path.join(".").replace('\'', "''")
            ),
            Dialect::Postgres => format!(
                "({}#>>'{{{}}}')",
                self.column,
                self.path.join(",").replace('\'', "''")
            ),
        }
    }
}

/// Lower a predicate tree to a condition over columns of `qualifier`
pub fn where_condition(
    clause: &WhereOptions,
    qualifier: &str,
    dialect: Dialect,
) -> Result<Condition> {
    let mut conditions = Vec::with_capacity(clause.len());

    for (key, value) in clause.iter() {
        let condition = match key {
            WhereKey::Field(name) => field_condition(&ColumnRef::new(qualifier, name), value, dialect)?,
            WhereKey::Op(Operator::And) => Condition::all(clauses(value, qualifier, dialect)?),
            WhereKey::Op(Operator::Or) => Condition::any(clauses(value, qualifier, dialect)?),
            WhereKey::Op(Operator::Not) => {
                Condition::Not(Box::new(Condition::all(clauses(value, qualifier, dialect)?)))
            }
            WhereKey::Op(op) => {
                return Err(QueryError::Filter(format!(
                    "Operator {} must be applied to a field",
                    op
                )));
            }
        };
        conditions.push(condition);
    }

    Ok(Condition::all(conditions))
}

// Operands of a top-level combinator: a list of clauses or one clause per entry
fn clauses(value: &WhereValue, qualifier: &str, dialect: Dialect) -> Result<Vec<Condition>> {
    match value {
        WhereValue::List(items) => items
            .iter()
            .map(|item| match item {
                WhereValue::Map(map) => where_condition(map, qualifier, dialect),
                other => Err(QueryError::Filter(format!(
                    "Invalid combinator operand: {}",
                    other.to_json()
                ))),
            })
            .collect(),
        WhereValue::Map(map) => map
            .iter()
            .map(|(key, value)| {
                let mut single = WhereOptions::new();
                single.insert(key.clone(), value.clone());
                where_condition(&single, qualifier, dialect)
            })
            .collect(),
        WhereValue::Value(operand) => Err(QueryError::Filter(format!(
            "Invalid combinator operand: {}",
            operand.to_json()
        ))),
    }
}

fn field_condition(column: &ColumnRef, value: &WhereValue, dialect: Dialect) -> Result<Condition> {
    match value {
        WhereValue::Value(operand) => Ok(equality(column, operand.to_json(), dialect)),
        WhereValue::List(_) => Ok(simple(column, ComparisonOp::In, Some(leaf_list(value)?), dialect)),
        WhereValue::Map(map) => {
            let mut conditions = Vec::with_capacity(map.len());
            for (key, inner) in map.iter() {
                conditions.push(match key {
                    WhereKey::Op(op) => operator_condition(column, *op, inner, dialect)?,
                    WhereKey::Field(name) => field_condition(&column.child(name), inner, dialect)?,
                });
            }
            Ok(Condition::all(conditions))
        }
    }
}

fn operator_condition(
    column: &ColumnRef,
    op: Operator,
    value: &WhereValue,
    dialect: Dialect,
) -> Result<Condition> {
    match op {
        Operator::And | Operator::Or => {
            let parts = match value {
                WhereValue::List(items) => items
                    .iter()
                    .map(|item| field_condition(column, item, dialect))
                    .collect::<Result<Vec<_>>>()?,
                WhereValue::Map(map) => map
                    .iter()
                    .map(|(key, inner)| {
                        let mut single = WhereOptions::new();
                        single.insert(key.clone(), inner.clone());
                        field_condition(column, &WhereValue::Map(single), dialect)
                    })
                    .collect::<Result<Vec<_>>>()?,
                WhereValue::Value(_) => vec![field_condition(column, value, dialect)?],
            };
            Ok(if op == Operator::And {
                Condition::all(parts)
            } else {
                Condition::any(parts)
            })
        }
        Operator::Eq => Ok(equality(column, leaf(value, op)?, dialect)),
        Operator::Ne => match leaf(value, op)? {
            Value::Null => Ok(simple(column, ComparisonOp::IsNotNull, None, dialect)),
            other => Ok(simple(column, ComparisonOp::Ne, Some(other), dialect)),
        },
        Operator::Not => match value {
            WhereValue::Value(operand) => match operand.to_json() {
                Value::Null => Ok(simple(column, ComparisonOp::IsNotNull, None, dialect)),
                Value::Bool(b) => Ok(simple(column, ComparisonOp::IsNot, Some(Value::Bool(b)), dialect)),
                other => Ok(simple(column, ComparisonOp::Ne, Some(other), dialect)),
            },
            other => Ok(Condition::Not(Box::new(field_condition(column, other, dialect)?))),
        },
        Operator::In | Operator::NotIn => {
            let cmp = if op == Operator::In {
                ComparisonOp::In
            } else {
                ComparisonOp::NotIn
            };
            let items = match value {
                WhereValue::Value(operand) => Value::Array(vec![operand.to_json()]),
                other => leaf_list(other)?,
            };
            Ok(simple(column, cmp, Some(items), dialect))
        }
        Operator::Between | Operator::NotBetween => {
            let cmp = if op == Operator::Between {
                ComparisonOp::Between
            } else {
                ComparisonOp::NotBetween
            };
            match leaf_list(value)? {
                Value::Array(bounds) if bounds.len() == 2 => {
                    Ok(simple(column, cmp, Some(Value::Array(bounds)), dialect))
                }
                _ => Err(QueryError::Filter(format!(
                    "Operator {} expects exactly two bounds",
                    op
                ))),
            }
        }
        other => {
            let cmp = ComparisonOp::for_operator(other).ok_or_else(|| {
                QueryError::Filter(format!("Unsupported operator {}", other))
            })?;
            let operand = match value {
                WhereValue::List(_) => Some(leaf_list(value)?),
                _ => Some(leaf(value, other)?),
            };
            Ok(simple(column, cmp, operand, dialect))
        }
    }
}

fn simple(column: &ColumnRef, op: ComparisonOp, value: Option<Value>, dialect: Dialect) -> Condition {
    Condition::Simple {
        column: column.to_sql(dialect),
        op,
        value,
    }
}

fn equality(column: &ColumnRef, value: Value, dialect: Dialect) -> Condition {
    match value {
        Value::Null => simple(column, ComparisonOp::IsNull, None, dialect),
        Value::Bool(_) => simple(column, ComparisonOp::Is, Some(value), dialect),
        other => simple(column, ComparisonOp::Eq, Some(other), dialect),
    }
}

fn leaf(value: &WhereValue, op: Operator) -> Result<Value> {
    match value {
        WhereValue::Value(operand) => Ok(operand.to_json()),
        other => Err(QueryError::Filter(format!(
            "Operator {} expects a scalar, got {}",
            op,
            other.to_json()
        ))),
    }
}

fn leaf_list(value: &WhereValue) -> Result<Value> {
    match value {
        WhereValue::List(items) => {
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    WhereValue::Value(operand) => values.push(operand.to_json()),
                    other => {
                        return Err(QueryError::Filter(format!(
                            "Expected a list of scalars, got {}",
                            other.to_json()
                        )));
                    }
                }
            }
            Ok(Value::Array(values))
        }
        other => Err(QueryError::Filter(format!(
            "Expected a list, got {}",
            other.to_json()
        ))),
    }
}

fn with_primary_keys(model: &ModelDescriptor, attributes: &[String]) -> Vec<String> {
    let mut columns: Vec<String> = model
        .primary_keys()
        .into_iter()
        .filter(|pk| !attributes.iter().any(|a| a == pk))
        .map(String::from)
        .collect();
    columns.extend(attributes.iter().cloned());
    columns
}

/// What a data-modifying statement reports back
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Returning {
    #[default]
    None,
    All,
    Columns(Vec<String>),
}

impl Returning {
    /// Explicit projection; an empty list means nothing is returned
    pub fn columns<S: Into<String>>(columns: impl IntoIterator<Item = S>) -> Self {
        let columns: Vec<String> = columns.into_iter().map(Into::into).collect();
        if columns.is_empty() {
            Returning::None
        } else {
            Returning::Columns(columns)
        }
    }

    fn to_sql(&self) -> Option<String> {
        match self {
            Returning::None => None,
            Returning::All => Some(" RETURNING *".to_string()),
            Returning::Columns(columns) => Some(format!(
                " RETURNING {}",
                columns.iter().map(|c| quote(c)).collect::<Vec<_>>().join(", ")
            )),
        }
    }
}

/// INSERT query builder
#[derive(Debug, Clone)]
pub struct InsertBuilder {
    table: String,
    values: Vec<(String, Value)>,
    returning: Returning,
}

impl InsertBuilder {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            values: Vec::new(),
            returning: Returning::None,
        }
    }

    /// Set a column value
    pub fn value(mut self, column: impl Into<String>, value: Value) -> Self {
        self.values.push((column.into(), value));
        self
    }

    pub fn values(mut self, values: &Map<String, Value>) -> Self {
        for (col, val) in values {
            self.values.push((col.clone(), val.clone()));
        }
        self
    }

    pub fn returning(mut self, returning: Returning) -> Self {
        self.returning = returning;
        self
    }

    /// Build the SQL query string
    pub fn build(self) -> String {
        let mut sql = format!("INSERT INTO {}", quote(&self.table));

        if self.values.is_empty() {
            sql.push_str(" DEFAULT VALUES");
        } else {
            let columns: Vec<String> = self.values.iter().map(|(c, _)| quote(c)).collect();
            let values: Vec<String> = self.values.iter().map(|(_, v)| format_value(v)).collect();
            sql.push_str(&format!(" ({}) VALUES ({})", columns.join(", "), values.join(", ")));
        }

        if let Some(returning) = self.returning.to_sql() {
            sql.push_str(&returning);
        }

        sql
    }
}

/// UPDATE query builder
#[derive(Debug, Clone)]
pub struct UpdateBuilder {
    table: String,
    set_values: Vec<(String, Value)>,
    where_clause: Option<Condition>,
    returning: Returning,
}

impl UpdateBuilder {
    /// Create a new UPDATE query builder
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            set_values: Vec::new(),
            where_clause: None,
            returning: Returning::None,
        }
    }

    /// Set a column value
    pub fn set(mut self, column: impl Into<String>, value: Value) -> Self {
        self.set_values.push((column.into(), value));
        self
    }

    pub fn set_many(mut self, values: &Map<String, Value>) -> Self {
        for (col, val) in values {
            self.set_values.push((col.clone(), val.clone()));
        }
        self
    }

    /// Add WHERE condition
    pub fn where_clause(mut self, condition: Condition) -> Self {
        self.where_clause = Some(condition);
        self
    }

    pub fn returning(mut self, returning: Returning) -> Self {
        self.returning = returning;
        self
    }

    /// Build the SQL query string
    pub fn build(self, dialect: Dialect) -> Result<String> {
        if self.set_values.is_empty() {
            return Err(QueryError::Query("UPDATE must have at least one SET value".to_string()));
        }

        let mut sql = format!("UPDATE {} SET ", quote(&self.table));

        let set_clauses: Vec<String> = self
            .set_values
            .iter()
            .map(|(col, val)| format!("{} = {}", quote(col), format_value(val)))
            .collect();

        sql.push_str(&set_clauses.join(", "));

        if let Some(where_clause) = &self.where_clause {
            sql.push_str(" WHERE ");
            sql.push_str(&where_clause.to_sql(dialect));
        }

        if let Some(returning) = self.returning.to_sql() {
            sql.push_str(&returning);
        }

        Ok(sql)
    }
}

/// DELETE query builder
#[derive(Debug, Clone)]
pub struct DeleteBuilder {
    table: String,
    where_clause: Option<Condition>,
    returning: Returning,
}

impl DeleteBuilder {
    /// Create a new DELETE query builder
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            where_clause: None,
            returning: Returning::None,
        }
    }

    /// Add WHERE condition
    pub fn where_clause(mut self, condition: Condition) -> Self {
        self.where_clause = Some(condition);
        self
    }

    pub fn returning(mut self, returning: Returning) -> Self {
        self.returning = returning;
        self
    }

    /// Build the SQL query string
    pub fn build(self, dialect: Dialect) -> String {
        let mut sql = format!("DELETE FROM {}", quote(&self.table));

        if let Some(where_clause) = &self.where_clause {
            sql.push_str(" WHERE ");
            sql.push_str(&where_clause.to_sql(dialect));
        }

        if let Some(returning) = self.returning.to_sql() {
            sql.push_str(&returning);
        }

        sql
    }
}

/// One joined association, flattened out of the include tree
struct JoinPlan<'a> {
    path: String,
    parent_path: String,
    parent: &'a ModelDescriptor,
    model: &'a ModelDescriptor,
    association: &'a Association,
    include: &'a IncludeOptions,
    view_params: Option<Map<String, Value>>,
}

impl JoinPlan<'_> {
    fn join_type(&self) -> JoinType {
        let required = self
            .include
            .required
            .unwrap_or(self.include.options.where_.is_some());
        if required { JoinType::Inner } else { JoinType::Left }
    }
}

/// Separator between association aliases in join alias paths
pub const ALIAS_PATH_DELIMITER: &str = "->";

/// SELECT query builder over a model and its includes.
///
/// Root columns are aliased by name, joined columns by their dotted alias
/// path (`lines.product.name`) so rows can be stitched back into nested
/// objects. With LIMIT/OFFSET and a to-many include, the root rows are
/// paginated in a subquery before joining.
pub struct SelectBuilder<'a> {
    registry: &'a Registry,
    model: &'a ModelDescriptor,
    options: &'a FindOptions,
    dialect: Dialect,
}

impl<'a> SelectBuilder<'a> {
    pub fn new(
        registry: &'a Registry,
        model: &'a ModelDescriptor,
        options: &'a FindOptions,
        dialect: Dialect,
    ) -> Self {
        Self {
            registry,
            model,
            options,
            dialect,
        }
    }

    /// Build the SQL query string
    pub fn build(&self) -> Result<String> {
        let root = self.model.name.as_str();
        let joins = self.plan_joins()?;
        let paginated = self.options.limit.is_some() || self.options.offset.is_some();
        let subquery = paginated && joins.iter().any(|j| j.association.kind.is_many());

        let mut columns: Vec<String> = self
            .root_attributes(!joins.is_empty())
            .iter()
            .map(|attr| format!("{}.{} AS {}", quote(root), quote(attr), quote(attr)))
            .collect();
        for join in &joins {
            let alias = join.path.replace(ALIAS_PATH_DELIMITER, ".");
            for attr in self.include_attributes(join) {
                columns.push(format!(
                    "{}.{} AS {}",
                    quote(&join.path),
                    quote(&attr),
                    quote(&format!("{}.{}", alias, attr))
                ));
            }
        }

        let mut sql = String::from("SELECT ");
        if self.options.distinct == Some(true) {
            sql.push_str("DISTINCT ");
        }
        sql.push_str(&columns.join(", "));

        if subquery {
            let mut inner = format!("SELECT {}.* FROM {} AS {}", quote(root), self.root_source()?, quote(root));
            let mut conditions = Vec::new();
            if let Some(clause) = &self.options.where_ {
                conditions.push(where_condition(clause, root, self.dialect)?);
            }
            for join in joins.iter().filter(|j| j.parent_path.is_empty()) {
                if join.join_type() == JoinType::Inner && join.association.kind.is_many() {
                    conditions.push(self.exists_condition(join)?);
                }
            }
            if !conditions.is_empty() {
                inner.push_str(" WHERE ");
                inner.push_str(&Condition::all(conditions).to_sql(self.dialect));
            }
            self.push_order(&mut inner);
            self.push_pagination(&mut inner);
            sql.push_str(&format!(" FROM ({}) AS {}", inner, quote(root)));
        } else {
            sql.push_str(&format!(" FROM {} AS {}", self.root_source()?, quote(root)));
        }

        for join in &joins {
            sql.push(' ');
            sql.push_str(&self.join_sql(join)?);
        }

        if !subquery {
            if let Some(clause) = &self.options.where_ {
                sql.push_str(" WHERE ");
                sql.push_str(&where_condition(clause, root, self.dialect)?.to_sql(self.dialect));
            }
        }

        self.push_order(&mut sql);

        if !subquery {
            self.push_pagination(&mut sql);
        }

        Ok(sql)
    }

    /// Build a COUNT query over the same joins and filters
    pub fn build_count(&self) -> Result<String> {
        let root = self.model.name.as_str();
        let joins = self.plan_joins()?;

        let counted = match (&self.options.col, self.options.distinct) {
            (Some(col), Some(true)) => format!("COUNT(DISTINCT {}.{})", quote(root), quote(col)),
            (Some(col), _) => format!("COUNT({}.{})", quote(root), quote(col)),
            (None, _) => "COUNT(*)".to_string(),
        };

        let mut sql = format!(
            "SELECT {} AS \"count\" FROM {} AS {}",
            counted,
            self.root_source()?,
            quote(root)
        );

        for join in &joins {
            sql.push(' ');
            sql.push_str(&self.join_sql(join)?);
        }

        if let Some(clause) = &self.options.where_ {
            sql.push_str(" WHERE ");
            sql.push_str(&where_condition(clause, root, self.dialect)?.to_sql(self.dialect));
        }

        Ok(sql)
    }

    // Joined rows are grouped by primary key, so it is selected even when
    // the requested attributes leave it out.
    fn root_attributes(&self, joined: bool) -> Vec<String> {
        match &self.options.attributes {
            Some(attributes) if joined => with_primary_keys(self.model, attributes),
            Some(attributes) => attributes.clone(),
            None => self.model.attribute_names().map(String::from).collect(),
        }
    }

    fn include_attributes(&self, join: &JoinPlan<'_>) -> Vec<String> {
        match &join.include.options.attributes {
            Some(attributes) => with_primary_keys(join.model, attributes),
            None => join.model.attribute_names().map(String::from).collect(),
        }
    }

    fn root_source(&self) -> Result<String> {
        source(self.model, self.options.view_params.as_ref())
    }

    fn plan_joins(&self) -> Result<Vec<JoinPlan<'a>>> {
        let mut plans = Vec::new();
        if let Some(includes) = &self.options.include {
            self.collect_joins(
                self.model,
                "",
                includes,
                self.options.view_params.as_ref(),
                &mut plans,
            )?;
        }
        Ok(plans)
    }

    fn collect_joins(
        &self,
        parent: &'a ModelDescriptor,
        parent_path: &str,
        includes: &'a [IncludeOptions],
        inherited: Option<&Map<String, Value>>,
        plans: &mut Vec<JoinPlan<'a>>,
    ) -> Result<()> {
        for include in includes {
            let association = parent.association(&include.alias).ok_or_else(|| {
                QueryError::Query(format!(
                    "Model {} has no association {}",
                    parent.name, include.alias
                ))
            })?;
            if association.target != include.model {
                return Err(QueryError::Query(format!(
                    "Association {}.{} targets {}, not {}",
                    parent.name, include.alias, association.target, include.model
                )));
            }
            let model = self.registry.model(&include.model)?;

            let path = if parent_path.is_empty() {
                include.alias.clone()
            } else {
                format!("{}{}{}", parent_path, ALIAS_PATH_DELIMITER, include.alias)
            };

            let view_params = match (inherited, &include.options.view_params) {
                (None, None) => None,
                (inherited, own) => {
                    let mut merged = inherited.cloned().unwrap_or_default();
                    if let Some(own) = own {
                        for (k, v) in own {
                            merged.insert(k.clone(), v.clone());
                        }
                    }
                    Some(merged)
                }
            };

            plans.push(JoinPlan {
                path: path.clone(),
                parent_path: parent_path.to_string(),
                parent,
                model,
                association,
                include,
                view_params: view_params.clone(),
            });

            if let Some(nested) = &include.options.include {
                self.collect_joins(model, &path, nested, view_params.as_ref(), plans)?;
            }
        }
        Ok(())
    }

    fn parent_alias(&self, join: &JoinPlan<'_>) -> String {
        if join.parent_path.is_empty() {
            self.model.name.clone()
        } else {
            join.parent_path.clone()
        }
    }

    fn join_sql(&self, join: &JoinPlan<'_>) -> Result<String> {
        let parent_alias = self.parent_alias(join);
        let alias = join.path.as_str();
        let target = source(join.model, join.view_params.as_ref())?;
        let join_type = join.join_type();
        let association = join.association;

        let mut sql = String::new();
        let mut on = match association.kind {
            AssociationKind::BelongsTo => {
                let target_key = key_or_primary(&association.target_key, join.model)?;
                vec![Condition::Raw(format!(
                    "{}.{} = {}.{}",
                    quote(alias),
                    quote(&target_key),
                    quote(&parent_alias),
                    quote(&association.foreign_key)
                ))]
            }
            AssociationKind::HasOne | AssociationKind::HasMany => {
                let source_key = key_or_primary(&association.source_key, join.parent)?;
                vec![Condition::Raw(format!(
                    "{}.{} = {}.{}",
                    quote(alias),
                    quote(&association.foreign_key),
                    quote(&parent_alias),
                    quote(&source_key)
                ))]
            }
            AssociationKind::BelongsToMany => {
                let through = association.through.as_ref().ok_or_else(|| {
                    QueryError::Query(format!(
                        "Association {} is missing its join model",
                        association.alias
                    ))
                })?;
                let through_model = self.registry.model(&through.model)?;
                let through_alias = format!("{}{}{}", alias, ALIAS_PATH_DELIMITER, through_model.name);
                let source_key = key_or_primary(&association.source_key, join.parent)?;
                sql.push_str(&format!(
                    "{} {} AS {} ON {}.{} = {}.{} ",
                    join_type,
                    quote(&through_model.table_name),
                    quote(&through_alias),
                    quote(&through_alias),
                    quote(&association.foreign_key),
                    quote(&parent_alias),
                    quote(&source_key)
                ));
                let target_key = key_or_primary(&association.target_key, join.model)?;
                vec![Condition::Raw(format!(
                    "{}.{} = {}.{}",
                    quote(alias),
                    quote(&target_key),
                    quote(&through_alias),
                    quote(&through.other_key)
                ))]
            }
        };

        if let Some(clause) = &join.include.options.where_ {
            on.push(where_condition(clause, alias, self.dialect)?);
        }

        let on_sql = match Condition::all(on) {
            Condition::Compound { conditions, .. } => conditions
                .iter()
                .map(|c| c.to_sql(self.dialect))
                .collect::<Vec<_>>()
                .join(" AND "),
            single => single.to_sql(self.dialect),
        };

        sql.push_str(&format!("{} {} AS {} ON {}", join_type, target, quote(alias), on_sql));
        Ok(sql)
    }

    // Keeps paginated root rows to those having at least one matching child
    fn exists_condition(&self, join: &JoinPlan<'_>) -> Result<Condition> {
        let association = join.association;
        if association.kind != AssociationKind::HasMany {
            return Ok(Condition::Raw("1 = 1".to_string()));
        }

        let alias = join.path.as_str();
        let source_key = key_or_primary(&association.source_key, join.parent)?;
        let mut sql = format!(
            "EXISTS (SELECT 1 FROM {} AS {} WHERE {}.{} = {}.{}",
            source(join.model, join.view_params.as_ref())?,
            quote(alias),
            quote(alias),
            quote(&association.foreign_key),
            quote(&self.model.name),
            quote(&source_key)
        );
        if let Some(clause) = &join.include.options.where_ {
            sql.push_str(" AND ");
            sql.push_str(&where_condition(clause, alias, self.dialect)?.to_sql(self.dialect));
        }
        sql.push(')');
        Ok(Condition::Raw(sql))
    }

    fn push_order(&self, sql: &mut String) {
        let Some(order) = &self.options.order else {
            return;
        };
        if order.is_empty() {
            return;
        }

        let items: Vec<String> = order
            .iter()
            .map(|OrderItem(field, direction)| {
                let (qualifier, column) = match field.rsplit_once('.') {
                    Some((path, column)) => (path.replace('.', ALIAS_PATH_DELIMITER), column),
                    None => (self.model.name.clone(), field.as_str()),
                };
                format!("{}.{} {}", quote(&qualifier), quote(column), direction)
            })
            .collect();

        sql.push_str(" ORDER BY ");
        sql.push_str(&items.join(", "));
    }

    fn push_pagination(&self, sql: &mut String) {
        match (self.options.limit, self.options.offset) {
            (Some(limit), Some(offset)) => sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, offset)),
            (Some(limit), None) => sql.push_str(&format!(" LIMIT {}", limit)),
            (None, Some(offset)) => match self.dialect {
                Dialect::Sqlite => sql.push_str(&format!(" LIMIT -1 OFFSET {}", offset)),
                Dialect::Postgres => sql.push_str(&format!(" OFFSET {}", offset)),
            },
            (None, None) => {}
        }
    }
}

fn key_or_primary(key: &Option<String>, model: &ModelDescriptor) -> Result<String> {
    if let Some(key) = key {
        return Ok(key.clone());
    }
    model
        .primary_keys()
        .first()
        .map(|k| k.to_string())
        .ok_or_else(|| QueryError::Query(format!("Model {} has no primary key", model.name)))
}

/// FROM/JOIN target of a model: its table, or the parameterized query of a
/// dynamic view when view parameters are supplied
pub fn source(model: &ModelDescriptor, view_params: Option<&Map<String, Value>>) -> Result<String> {
    match view_params {
        Some(params) if model.is_dynamic_view() => {
            let query = view::view_definition(model, Some(params), true)?;
            Ok(format!("({})", view::without_terminator(&query)))
        }
        _ => Ok(quote(&model.table_name)),
    }
}

fn format_list(values: &[Value]) -> String {
    values.iter().map(format_value).collect::<Vec<_>>().join(", ")
}

/// Format a JSON value as a SQL literal
pub fn format_value(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => b.to_string().to_uppercase(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        Value::Array(_) | Value::Object(_) => format!("'{}'", value.to_string().replace('\'', "''")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::to_where_options;
    use crate::model::{Attribute, ModelBuilder, SortOrder};
    use crate::schema::SqlType;
    use serde_json::json;

    fn shop() -> Registry {
        let mut registry = Registry::new();
        registry
            .register(
                ModelBuilder::table("Order")
                    .attribute(Attribute::new("id", SqlType::Integer).primary_key().auto_increment())
                    .attribute(Attribute::new("total", SqlType::Integer))
                    .attribute(Attribute::new("meta", SqlType::Json))
                    .association(Association::has_many("lines", "OrderLine", "orderId"))
                    .build()
                    .unwrap(),
            )
            .unwrap();
        registry
            .register(
                ModelBuilder::table("OrderLine")
                    .attribute(Attribute::new("id", SqlType::Integer).primary_key().auto_increment())
                    .attribute(Attribute::new("orderId", SqlType::Integer).references("Order", "id"))
                    .attribute(Attribute::new("qty", SqlType::Integer))
                    .association(Association::belongs_to("order", "Order", "orderId"))
                    .build()
                    .unwrap(),
            )
            .unwrap();
        registry
            .register(
                ModelBuilder::dynamic_view(
                    "BigOrders",
                    r#"CREATE VIEW "BigOrders" AS SELECT * FROM "Order" WHERE "total" > @{min}"#,
                )
                .attribute(Attribute::new("id", SqlType::Integer).primary_key())
                .attribute(Attribute::new("total", SqlType::Integer))
                .view_param("min", 100)
                .build()
                .unwrap(),
            )
            .unwrap();
        registry
    }

    fn render(filter: Value, dialect: Dialect) -> String {
        let clause = to_where_options(&filter).unwrap().where_.unwrap();
        where_condition(&clause, "Order", dialect).unwrap().to_sql(dialect)
    }

    #[test]
    fn test_render_comparisons() {
        assert_eq!(render(json!({ "total": ">=18" }), Dialect::Sqlite), "\"Order\".\"total\" >= 18");
        assert_eq!(
            render(json!({ "id": [1, 2], "total": null }), Dialect::Sqlite),
            "(\"Order\".\"id\" IN (1, 2) AND \"Order\".\"total\" IS NULL)"
        );
        assert_eq!(
            render(json!({ "total": { "start": 5, "end": 20 } }), Dialect::Postgres),
            "\"Order\".\"total\" BETWEEN 5 AND 20"
        );
    }

    #[test]
    fn test_render_in_operators() {
        assert_eq!(
            render(json!({ "id": { "$in": [1, 2] } }), Dialect::Sqlite),
            "\"Order\".\"id\" IN (1, 2)"
        );
        assert_eq!(render(json!({ "id": { "$in": 1 } }), Dialect::Sqlite), "\"Order\".\"id\" IN (1)");
        assert_eq!(
            render(json!({ "id": { "$notIn": [3] } }), Dialect::Sqlite),
            "\"Order\".\"id\" NOT IN (3)"
        );
        assert_eq!(
            render(json!({ "total": { "$between": [1, 4] } }), Dialect::Sqlite),
            "\"Order\".\"total\" BETWEEN 1 AND 4"
        );
    }

    #[test]
    fn test_render_ilike_per_dialect() {
        assert_eq!(render(json!({ "name": "%an%" }), Dialect::Postgres), "\"Order\".\"name\" ILIKE '%an%'");
        assert_eq!(render(json!({ "name": "%an%" }), Dialect::Sqlite), "\"Order\".\"name\" LIKE '%an%'");
    }

    #[test]
    fn test_render_combinators() {
        assert_eq!(
            render(json!({ "$or": [{ "id": 1 }, { "total": { "$lt": 5 } }] }), Dialect::Sqlite),
            "(\"Order\".\"id\" = 1 OR \"Order\".\"total\" < 5)"
        );
        assert_eq!(
            render(json!({ "total": { "$or": [null, 3] } }), Dialect::Sqlite),
            "(\"Order\".\"total\" IS NULL OR \"Order\".\"total\" = 3)"
        );
        assert_eq!(
            render(json!({ "total": { "$not": null, "$ne": 4 } }), Dialect::Sqlite),
            "(\"Order\".\"total\" IS NOT NULL AND \"Order\".\"total\" != 4)"
        );
    }

    #[test]
    fn test_render_unknown_key_as_json_path() {
        assert_eq!(
            render(json!({ "meta": { "color": "red" } }), Dialect::Sqlite),
            "json_extract(\"Order\".\"meta\", '$.color') = 'red'"
        );
        assert_eq!(
            render(json!({ "meta": { "size": { "$gt": 2 } } }), Dialect::Postgres),
            "(\"Order\".\"meta\"#>>'{size}') > 2"
        );
    }

    #[test]
    fn test_operator_without_field_fails() {
        let mut clause = WhereOptions::new();
        clause.insert(WhereKey::Op(Operator::Gt), WhereValue::json(json!(1)));
        assert!(where_condition(&clause, "Order", Dialect::Sqlite).is_err());
    }

    #[test]
    fn test_returning_normalization() {
        assert_eq!(Returning::columns(Vec::<String>::new()), Returning::None);

        let sql = InsertBuilder::new("Order")
            .value("total", json!(100))
            .returning(Returning::columns(["id", "total"]))
            .build();
        assert_eq!(sql, "INSERT INTO \"Order\" (\"total\") VALUES (100) RETURNING \"id\", \"total\"");

        let sql = InsertBuilder::new("Order").returning(Returning::All).build();
        assert_eq!(sql, "INSERT INTO \"Order\" DEFAULT VALUES RETURNING *");
    }

    #[test]
    fn test_update_and_delete() {
        let sql = UpdateBuilder::new("Order")
            .set("total", json!(5))
            .where_clause(Condition::eq("\"id\"", json!(1)))
            .returning(Returning::All)
            .build(Dialect::Sqlite)
            .unwrap();
        assert_eq!(sql, "UPDATE \"Order\" SET \"total\" = 5 WHERE \"id\" = 1 RETURNING *");

        assert!(UpdateBuilder::new("Order").build(Dialect::Sqlite).is_err());

        let sql = DeleteBuilder::new("Order")
            .where_clause(Condition::eq("\"id\"", json!(1)))
            .build(Dialect::Postgres);
        assert_eq!(sql, "DELETE FROM \"Order\" WHERE \"id\" = 1");
    }

    #[test]
    fn test_select_with_include() {
        let registry = shop();
        let model = registry.model("Order").unwrap();
        let options: FindOptions = serde_json::from_value(json!({
            "attributes": ["id", "total"],
            "where": { "total": { "$gte": 10 } },
            "include": [{ "model": "OrderLine", "as": "lines", "attributes": ["id", "qty"] }],
            "order": [["total", "DESC"]]
        }))
        .unwrap();

        let sql = SelectBuilder::new(&registry, model, &options, Dialect::Sqlite).build().unwrap();
        assert_eq!(
            sql,
            "SELECT \"Order\".\"id\" AS \"id\", \"Order\".\"total\" AS \"total\", \
             \"lines\".\"id\" AS \"lines.id\", \"lines\".\"qty\" AS \"lines.qty\" \
             FROM \"Order\" AS \"Order\" \
             LEFT OUTER JOIN \"OrderLine\" AS \"lines\" ON \"lines\".\"orderId\" = \"Order\".\"id\" \
             WHERE \"Order\".\"total\" >= 10 ORDER BY \"Order\".\"total\" DESC"
        );
    }

    #[test]
    fn test_joined_select_keeps_primary_keys() {
        let registry = shop();
        let model = registry.model("Order").unwrap();
        let options: FindOptions = serde_json::from_value(json!({
            "attributes": ["total"],
            "include": [{ "model": "OrderLine", "as": "lines", "attributes": ["qty"] }]
        }))
        .unwrap();

        let sql = SelectBuilder::new(&registry, model, &options, Dialect::Sqlite).build().unwrap();
        assert!(sql.starts_with(
            "SELECT \"Order\".\"id\" AS \"id\", \"Order\".\"total\" AS \"total\", \
             \"lines\".\"id\" AS \"lines.id\", \"lines\".\"qty\" AS \"lines.qty\" FROM"
        ));

        let plain: FindOptions = serde_json::from_value(json!({ "attributes": ["total"] })).unwrap();
        let sql = SelectBuilder::new(&registry, model, &plain, Dialect::Sqlite).build().unwrap();
        assert_eq!(sql, "SELECT \"Order\".\"total\" AS \"total\" FROM \"Order\" AS \"Order\"");
    }

    #[test]
    fn test_include_where_makes_inner_join() {
        let registry = shop();
        let model = registry.model("OrderLine").unwrap();
        let options: FindOptions = serde_json::from_value(json!({
            "include": [{ "model": "Order", "as": "order", "where": { "total": 5 } }]
        }))
        .unwrap();

        let sql = SelectBuilder::new(&registry, model, &options, Dialect::Sqlite).build().unwrap();
        assert!(sql.contains(
            "INNER JOIN \"Order\" AS \"order\" ON \"order\".\"id\" = \"OrderLine\".\"orderId\" AND \"order\".\"total\" = 5"
        ));
        assert!(sql.contains("\"order\".\"meta\" AS \"order.meta\""));
    }

    #[test]
    fn test_paginated_to_many_uses_subquery() {
        let registry = shop();
        let model = registry.model("Order").unwrap();
        let options = FindOptions {
            attributes: Some(vec!["id".to_string()]),
            include: Some(vec![IncludeOptions::new("OrderLine", "lines")]),
            order: Some(vec![OrderItem("id".to_string(), SortOrder::Asc)]),
            limit: Some(2),
            offset: Some(4),
            ..Default::default()
        };

        let sql = SelectBuilder::new(&registry, model, &options, Dialect::Postgres).build().unwrap();
        assert!(sql.contains(
            "FROM (SELECT \"Order\".* FROM \"Order\" AS \"Order\" ORDER BY \"Order\".\"id\" ASC LIMIT 2 OFFSET 4) AS \"Order\""
        ));
        assert!(sql.ends_with("ORDER BY \"Order\".\"id\" ASC"));
    }

    #[test]
    fn test_count_query() {
        let registry = shop();
        let model = registry.model("Order").unwrap();
        let options = FindOptions {
            distinct: Some(true),
            col: Some("id".to_string()),
            ..Default::default()
        };

        let sql = SelectBuilder::new(&registry, model, &options, Dialect::Sqlite)
            .build_count()
            .unwrap();
        assert_eq!(sql, "SELECT COUNT(DISTINCT \"Order\".\"id\") AS \"count\" FROM \"Order\" AS \"Order\"");
    }

    #[test]
    fn test_dynamic_view_source() {
        let registry = shop();
        let model = registry.model("BigOrders").unwrap();

        let plain = FindOptions::default();
        let sql = SelectBuilder::new(&registry, model, &plain, Dialect::Sqlite).build().unwrap();
        assert!(sql.contains("FROM \"BigOrders\" AS \"BigOrders\""));

        let mut params = Map::new();
        params.insert("min".to_string(), json!(500));
        let options = FindOptions {
            view_params: Some(params),
            ..Default::default()
        };
        let sql = SelectBuilder::new(&registry, model, &options, Dialect::Sqlite).build().unwrap();
        assert!(sql.contains("FROM (SELECT * FROM \"Order\" WHERE \"total\" > 500) AS \"BigOrders\""));
    }

    #[test]
    fn test_unknown_association_fails() {
        let registry = shop();
        let model = registry.model("Order").unwrap();
        let options = FindOptions {
            include: Some(vec![IncludeOptions::new("OrderLine", "items")]),
            ..Default::default()
        };
        let result = SelectBuilder::new(&registry, model, &options, Dialect::Sqlite).build();
        assert!(matches!(result, Err(QueryError::Query(_))));
    }

    #[test]
    fn test_format_value_string_escaping() {
        let value = Value::String("O'Reilly".to_string());
        assert_eq!(format_value(&value), "'O''Reilly'");
        assert_eq!(format_value(&json!(true)), "TRUE");
        assert_eq!(format_value(&json!({ "a": 1 })), "'{\"a\":1}'");
    }
}
