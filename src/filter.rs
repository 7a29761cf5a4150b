//! Filter translation.
//!
//! Caller filters are JSON objects whose values may carry inline operators
//! (`">=18"`, `"%abc%"`), `{start, end}` ranges, arrays, or `$`-prefixed
//! operator objects. They are translated into a [`WhereOptions`] tree that
//! [`crate::builder`] renders to SQL.
//!
//! Keys that are not operator tokens are kept as nested field names. This
//! allows filtering inside JSON columns, and also means a misspelled operator
//! becomes a literal path instead of an error.

use crate::error::{QueryError, Result};
use crate::query::FindOptions;
use chrono::{DateTime, FixedOffset, SecondsFormat};
use serde_json::{Map, Value};
use std::fmt;

/// Predicate operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    And,
    Or,
    Gt,
    Gte,
    Lt,
    Lte,
    Ne,
    Eq,
    Not,
    Between,
    NotBetween,
    In,
    NotIn,
    Like,
    NotLike,
    ILike,
    NotILike,
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
}

const OPERATORS: [(&str, Operator); 30] = [
    ("$and", Operator::And),
    ("$or", Operator::Or),
    ("$gt", Operator::Gt),
    ("$gte", Operator::Gte),
    ("$lt", Operator::Lt),
    ("$lte", Operator::Lte),
    ("$ne", Operator::Ne),
    ("$eq", Operator::Eq),
    ("$not", Operator::Not),
    ("$between", Operator::Between),
    ("$notBetween", Operator::NotBetween),
    ("$in", Operator::In),
    ("$notIn", Operator::NotIn),
    ("$like", Operator::Like),
    ("$notLike", Operator::NotLike),
    ("$iLike", Operator::ILike),
    ("$notILike", Operator::NotILike),
    ("$regexp", Operator::Regexp),
    ("$notRegexp", Operator::NotRegexp),
    ("$iRegexp", Operator::IRegexp),
    ("$notIRegexp", Operator::NotIRegexp),
    ("$overlap", Operator::Overlap),
    ("$contains", Operator::Contains),
    ("$contained", Operator::Contained),
    ("$any", Operator::Any),
    ("$adjacent", Operator::Adjacent),
    ("$strictLeft", Operator::StrictLeft),
    ("$strictRight", Operator::StrictRight),
    ("$noExtendRight", Operator::NoExtendRight),
    ("$noExtendLeft", Operator::NoExtendLeft),
];

impl Operator {
    /// Operator for a `$` token such as `$gte`
    pub fn from_token(token: &str) -> Option<Self> {
        OPERATORS
            .iter()
            .find(|(name, _)| *name == token)
            .map(|(_, op)| *op)
    }

    pub fn token(&self) -> &'static str {
        OPERATORS
            .iter()
            .find(|(_, op)| op == self)
            .map(|(name, _)| *name)
            .unwrap_or("$eq")
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.token())
    }
}

/// Leaf value of a predicate
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Json(Value),
    Timestamp(DateTime<FixedOffset>),
}

impl Operand {
    pub fn to_json(&self) -> Value {
        match self {
            Operand::Json(value) => value.clone(),
            Operand::Timestamp(ts) => {
                Value::String(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WhereKey {
    Field(String),
    Op(Operator),
}

impl WhereKey {
    pub fn parse(key: &str) -> Self {
        match Operator::from_token(key) {
            Some(op) => WhereKey::Op(op),
            None => WhereKey::Field(key.to_string()),
        }
    }

    fn to_key(&self) -> String {
        match self {
            WhereKey::Field(name) => name.clone(),
            WhereKey::Op(op) => op.token().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WhereValue {
    Value(Operand),
    Map(WhereOptions),
    List(Vec<WhereValue>),
}

impl WhereValue {
    pub fn json(value: Value) -> Self {
        WhereValue::Value(Operand::Json(value))
    }

    fn op(op: Operator, value: WhereValue) -> Self {
        let mut map = WhereOptions::new();
        map.insert(WhereKey::Op(op), value);
        WhereValue::Map(map)
    }

    pub fn to_json(&self) -> Value {
        match self {
            WhereValue::Value(operand) => operand.to_json(),
            WhereValue::Map(map) => map.to_json(),
            WhereValue::List(items) => Value::Array(items.iter().map(|v| v.to_json()).collect()),
        }
    }
}

/// Ordered predicate map; entries are combined with AND
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(into = "Value", from = "Value")]
pub struct WhereOptions {
    entries: Vec<(WhereKey, WhereValue)>,
}

impl WhereOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an entry, keeping the position of a replaced key
    pub fn insert(&mut self, key: WhereKey, value: WhereValue) {
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &WhereKey) -> Option<&WhereValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn field(&self, name: &str) -> Option<&WhereValue> {
        self.get(&WhereKey::Field(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &(WhereKey, WhereValue)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn extend(&mut self, other: WhereOptions) {
        for (key, value) in other.entries {
            self.insert(key, value);
        }
    }

    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        for (key, value) in &self.entries {
            map.insert(key.to_key(), value.to_json());
        }
        Value::Object(map)
    }
}

impl From<WhereOptions> for Value {
    fn from(options: WhereOptions) -> Self {
        options.to_json()
    }
}

// Serialized options carry timestamps as RFC 3339 strings
impl From<Value> for WhereOptions {
    fn from(value: Value) -> Self {
        match retype_timestamps(parse_filter(&value)) {
            WhereValue::Map(map) => map,
            _ => WhereOptions::new(),
        }
    }
}

fn retype_timestamps(value: WhereValue) -> WhereValue {
    match value {
        WhereValue::Value(Operand::Json(Value::String(text))) => match parse_value(&text) {
            timestamp @ Operand::Timestamp(_) => WhereValue::Value(timestamp),
            _ => WhereValue::json(Value::String(text)),
        },
        WhereValue::Map(map) => {
            let mut typed = WhereOptions::new();
            for (key, inner) in map.entries {
                typed.insert(key, retype_timestamps(inner));
            }
            WhereValue::Map(typed)
        }
        WhereValue::List(items) => WhereValue::List(items.into_iter().map(retype_timestamps).collect()),
        other => other,
    }
}

/// Translate operator tokens of a filter object recursively.
///
/// Non-object values are returned as leaves, arrays element-wise.
pub fn parse_filter(filter: &Value) -> WhereValue {
    match filter {
        Value::Object(object) => {
            let mut clause = WhereOptions::new();
            for (key, value) in object {
                clause.insert(WhereKey::parse(key), parse_filter(value));
            }
            WhereValue::Map(clause)
        }
        Value::Array(items) => WhereValue::List(items.iter().map(parse_filter).collect()),
        other => WhereValue::json(other.clone()),
    }
}

/// Translate inline operator syntax of a string filter value.
///
/// `%` anywhere means case-insensitive LIKE. A leading `>=`, `>`, `<=`, `<`
/// or `=` becomes a comparison against the typed remainder.
pub fn parse_filter_value(value: &str) -> WhereValue {
    if value.contains('%') {
        return WhereValue::op(Operator::ILike, WhereValue::json(Value::String(value.to_string())));
    }

    const PREFIXES: [(&str, Operator); 5] = [
        (">=", Operator::Gte),
        (">", Operator::Gt),
        ("<=", Operator::Lte),
        ("<", Operator::Lt),
        ("=", Operator::Eq),
    ];

    for (prefix, op) in PREFIXES {
        if let Some(rest) = value.strip_prefix(prefix) {
            return WhereValue::op(op, WhereValue::Value(parse_value(rest)));
        }
    }

    WhereValue::json(Value::String(value.to_string()))
}

/// Type a string operand: RFC 3339 timestamp, canonical number, or string
pub fn parse_value(value: &str) -> Operand {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Operand::Timestamp(ts);
    }

    if let Ok(int) = value.parse::<i64>() {
        if int.to_string() == value {
            return Operand::Json(Value::from(int));
        }
    }

    if let Ok(float) = value.parse::<f64>() {
        if float.is_finite() && float.to_string() == value {
            if let Some(number) = serde_json::Number::from_f64(float) {
                return Operand::Json(Value::Number(number));
            }
        }
    }

    Operand::Json(Value::String(value.to_string()))
}

/// `{ "$or": [null, ...values] }`, matching NULL or any of the values
pub fn or_null(value: Value) -> Value {
    let mut alternatives = vec![Value::Null];
    match value {
        Value::Array(items) => alternatives.extend(items),
        other => alternatives.push(other),
    }

    let mut map = Map::new();
    map.insert("$or".to_string(), Value::Array(alternatives));
    Value::Object(map)
}

fn is_range(value: &Value) -> bool {
    matches!(value, Value::Object(o) if o.len() == 2 && o.contains_key("start") && o.contains_key("end"))
}

/// Fold `<column>Range: {start, end}` keys into `<column>`, recursively.
///
/// Having both `<column>` and `<column>Range` in the same object is an error.
pub fn with_range_filters(filter: &Value) -> Result<Value> {
    let Value::Object(object) = filter else {
        return Ok(filter.clone());
    };

    let mut folded = Map::new();
    for (prop, value) in object {
        let column = prop.strip_suffix("Range").filter(|c| !c.is_empty());

        match column {
            Some(column) if is_range(value) => {
                if object.contains_key(column) {
                    return Err(QueryError::Filter(format!(
                        "Only one of filtering options \"{}\" or \"{}\" can be passed as filtering option!",
                        column, prop
                    )));
                }
                folded.insert(column.to_string(), value.clone());
            }
            _ => {
                folded.insert(prop.clone(), with_range_filters(value)?);
            }
        }
    }

    Ok(Value::Object(folded))
}

/// Build query options with a `where` clause from a caller filter.
///
/// Empty arrays skip their field and single-element arrays degrade to the
/// element. `{start, end}` becomes BETWEEN, other objects are parsed as
/// operator objects, arrays become IN, strings may carry inline operators.
/// Returns options without `where` when nothing constrains the query.
pub fn to_where_options(filter: &Value) -> Result<FindOptions> {
    let filter = with_range_filters(filter)?;
    let Value::Object(object) = filter else {
        return Ok(FindOptions::default());
    };

    let mut clause = WhereOptions::new();

    for (prop, data) in object {
        let data = match data {
            Value::Array(items) if items.is_empty() => continue,
            Value::Array(mut items) if items.len() == 1 => items.remove(0),
            other => other,
        };

        if prop.starts_with('$') {
            clause.insert(WhereKey::parse(&prop), parse_filter(&data));
            continue;
        }

        let predicate = match &data {
            Value::Object(range) if is_range(&data) => WhereValue::op(
                Operator::Between,
                WhereValue::List(vec![
                    range_bound(&range["start"]),
                    range_bound(&range["end"]),
                ]),
            ),
            Value::Object(_) => parse_filter(&data),
            Value::Array(items) => WhereValue::op(
                Operator::In,
                WhereValue::List(items.iter().cloned().map(WhereValue::json).collect()),
            ),
            Value::String(text) => parse_filter_value(text),
            other => WhereValue::json(other.clone()),
        };

        clause.insert(WhereKey::Field(prop), predicate);
    }

    if clause.is_empty() {
        return Ok(FindOptions::default());
    }

    Ok(FindOptions {
        where_: Some(clause),
        ..Default::default()
    })
}

fn range_bound(value: &Value) -> WhereValue {
    match value {
        Value::String(text) => WhereValue::Value(parse_value(text)),
        other => WhereValue::json(other.clone()),
    }
}
