//! Entities read back from the database and their JSON shape.

use crate::backend::QueryRow;
use crate::error::Result;
use crate::model::ModelDescriptor;
use crate::query::{FindOptions, IncludeOptions};
use crate::schema::Registry;
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

/// A stored row of a model, with children attached under association names.
///
/// When `returning` lists columns, serialization is limited to them.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    model: String,
    values: Map<String, Value>,
    returning: Option<Vec<String>>,
}

impl Entity {
    pub fn new(model: impl Into<String>, values: Map<String, Value>, returning: Option<Vec<String>>) -> Self {
        Self {
            model: model.into(),
            values,
            returning,
        }
    }

    pub fn from_row(model: impl Into<String>, row: QueryRow, returning: Option<Vec<String>>) -> Self {
        Self::new(model, row.columns, returning)
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }

    pub fn returning(&self) -> Option<&[String]> {
        self.returning.as_deref()
    }

    /// Attach `data` under `name`, keeping it visible through `returning`
    pub fn append_child(&mut self, name: &str, data: Value) -> &mut Self {
        if let Some(returning) = self.returning.as_mut() {
            if !returning.iter().any(|r| r == name) {
                returning.push(name.to_string());
            }
        }
        self.values.insert(name.to_string(), data);
        self
    }

    /// Drop the projection so every value serializes
    pub fn restore_serialization(&mut self) -> &mut Self {
        self.returning = None;
        self
    }

    pub fn coerce_numbers(&mut self, model: &ModelDescriptor) -> &mut Self {
        coerce_numbers(model, &mut self.values);
        self
    }

    pub fn to_json(&self) -> Value {
        let values = match &self.returning {
            Some(returning) => self
                .values
                .iter()
                .filter(|(key, _)| returning.iter().any(|r| r == *key))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
            None => self.values.clone(),
        };
        Value::Object(values)
    }

    pub fn into_json(self) -> Value {
        match self.returning {
            Some(_) => self.to_json(),
            None => Value::Object(self.values),
        }
    }
}

impl Serialize for Entity {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

/// Turn textual values of numeric columns into JSON numbers.
///
/// Views lose column types on some engines, so their numeric columns may
/// come back as strings.
pub fn coerce_numbers(model: &ModelDescriptor, values: &mut Map<String, Value>) {
    for attr in model.attributes.iter().filter(|a| a.sql_type.is_numeric()) {
        let Some(value) = values.get_mut(&attr.name) else {
            continue;
        };
        let Value::String(text) = value else {
            continue;
        };

        let text = text.trim();
        let number = text
            .parse::<i64>()
            .ok()
            .map(Value::from)
            .or_else(|| {
                text.parse::<f64>()
                    .ok()
                    .and_then(serde_json::Number::from_f64)
                    .map(Value::Number)
            });
        if let Some(number) = number {
            *value = number;
        }
    }
}

/// Fold flat joined rows into nested objects.
///
/// Joined columns are aliased by dotted path (`lines.product.name`). Rows
/// sharing a primary key collapse into one object; to-many associations
/// become arrays, to-one associations an object or `null`. Primary keys
/// selected only for grouping are left out of the objects.
pub fn stitch_rows(
    registry: &Registry,
    model: &ModelDescriptor,
    options: &FindOptions,
    rows: Vec<QueryRow>,
) -> Result<Vec<Value>> {
    let includes = options.include.as_deref().unwrap_or_default();
    if includes.is_empty() {
        return Ok(rows.into_iter().map(QueryRow::into_json).collect());
    }

    let rows: Vec<Map<String, Value>> = rows.into_iter().map(|r| r.columns).collect();
    let refs: Vec<&Map<String, Value>> = rows.iter().collect();
    let requested = options.attributes.as_deref();
    stitch_level(registry, model, includes, requested, "", &refs, false)
}

fn stitch_level(
    registry: &Registry,
    model: &ModelDescriptor,
    includes: &[IncludeOptions],
    requested: Option<&[String]>,
    prefix: &str,
    rows: &[&Map<String, Value>],
    joined: bool,
) -> Result<Vec<Value>> {
    let primary_keys = model.primary_keys();
    let mut groups: Vec<(Map<String, Value>, Vec<&Map<String, Value>>)> = Vec::new();

    for row in rows {
        let own = own_columns(row, prefix);

        if joined {
            let missing = if primary_keys.is_empty() {
                own.values().all(Value::is_null)
            } else {
                primary_keys.iter().any(|pk| own.get(*pk).is_none_or(Value::is_null))
            };
            if missing {
                continue;
            }
        }

        let same = |other: &Map<String, Value>| {
            if primary_keys.is_empty() {
                *other == own
            } else {
                primary_keys.iter().all(|pk| other.get(*pk) == own.get(*pk))
            }
        };

        match groups.iter_mut().find(|(existing, _)| same(existing)) {
            Some((_, members)) => members.push(*row),
            None => groups.push((own, vec![*row])),
        }
    }

    let mut objects = Vec::with_capacity(groups.len());
    for (mut object, members) in groups {
        if let Some(requested) = requested {
            object.retain(|column, _| {
                !primary_keys.contains(&column.as_str()) || requested.contains(column)
            });
        }
        for include in includes {
            let Some(association) = model.association(&include.alias) else {
                continue;
            };
            let target = registry.model(&include.model)?;
            let child_prefix = format!("{}{}.", prefix, include.alias);
            let nested = include.options.include.as_deref().unwrap_or_default();
            let mut children = stitch_level(
                registry,
                target,
                nested,
                include.options.attributes.as_deref(),
                &child_prefix,
                &members,
                true,
            )?;

            let value = if association.kind.is_many() {
                Value::Array(children)
            } else if children.is_empty() {
                Value::Null
            } else {
                children.swap_remove(0)
            };
            object.insert(include.alias.clone(), value);
        }
        objects.push(Value::Object(object));
    }

    Ok(objects)
}

fn own_columns(row: &Map<String, Value>, prefix: &str) -> Map<String, Value> {
    row.iter()
        .filter_map(|(key, value)| {
            let column = key.strip_prefix(prefix)?;
            (!column.contains('.')).then(|| (column.to_string(), value.clone()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Association, Attribute, ModelBuilder};
    use crate::schema::SqlType;
    use serde_json::json;

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry
            .register(
                ModelBuilder::table("Order")
                    .attribute(Attribute::new("id", SqlType::Integer).primary_key())
                    .attribute(Attribute::new("total", SqlType::Numeric))
                    .association(Association::has_many("lines", "OrderLine", "orderId"))
                    .build()
                    .unwrap(),
            )
            .unwrap();
        registry
            .register(
                ModelBuilder::table("OrderLine")
                    .attribute(Attribute::new("id", SqlType::Integer).primary_key())
                    .attribute(Attribute::new("orderId", SqlType::Integer))
                    .attribute(Attribute::new("qty", SqlType::Integer))
                    .association(Association::belongs_to("order", "Order", "orderId"))
                    .build()
                    .unwrap(),
            )
            .unwrap();
        registry
    }

    fn row(value: Value) -> QueryRow {
        match value {
            Value::Object(map) => QueryRow::from(map),
            _ => QueryRow::new(),
        }
    }

    #[test]
    fn test_append_child_extends_returning() {
        let mut values = Map::new();
        values.insert("id".to_string(), json!(1));
        values.insert("total".to_string(), json!(10));
        let mut entity = Entity::new("Order", values, Some(vec!["id".to_string()]));

        assert_eq!(entity.to_json(), json!({ "id": 1 }));

        entity.append_child("lines", json!([{ "id": 7 }]));
        assert_eq!(entity.to_json(), json!({ "id": 1, "lines": [{ "id": 7 }] }));
        assert_eq!(entity.returning(), Some(&["id".to_string(), "lines".to_string()][..]));

        entity.restore_serialization();
        assert_eq!(entity.to_json()["total"], json!(10));
    }

    #[test]
    fn test_coerce_numbers() {
        let registry = registry();
        let model = registry.model("Order").unwrap();
        let mut values = Map::new();
        values.insert("id".to_string(), json!("3"));
        values.insert("total".to_string(), json!("12.50"));

        coerce_numbers(model, &mut values);
        assert_eq!(values["id"], json!(3));
        assert_eq!(values["total"], json!(12.5));
    }

    #[test]
    fn test_stitch_to_many() {
        let registry = registry();
        let model = registry.model("Order").unwrap();
        let options = FindOptions {
            include: Some(vec![IncludeOptions::new("OrderLine", "lines")]),
            ..Default::default()
        };
        let rows = vec![
            row(json!({ "id": 1, "total": 5, "lines.id": 10, "lines.qty": 2 })),
            row(json!({ "id": 1, "total": 5, "lines.id": 11, "lines.qty": 3 })),
            row(json!({ "id": 2, "total": 7, "lines.id": null, "lines.qty": null })),
        ];

        let stitched = stitch_rows(&registry, model, &options, rows).unwrap();
        assert_eq!(
            stitched,
            vec![
                json!({ "id": 1, "total": 5, "lines": [{ "id": 10, "qty": 2 }, { "id": 11, "qty": 3 }] }),
                json!({ "id": 2, "total": 7, "lines": [] }),
            ]
        );
    }

    #[test]
    fn test_stitch_drops_unrequested_primary_keys() {
        let registry = registry();
        let model = registry.model("Order").unwrap();
        let options: FindOptions = serde_json::from_value(json!({
            "attributes": ["total"],
            "include": [{ "model": "OrderLine", "as": "lines", "attributes": ["qty"] }]
        }))
        .unwrap();
        let rows = vec![
            row(json!({ "id": 1, "total": 5, "lines.id": 10, "lines.qty": 2 })),
            row(json!({ "id": 1, "total": 5, "lines.id": 11, "lines.qty": 3 })),
            row(json!({ "id": 2, "total": 5, "lines.id": 12, "lines.qty": 4 })),
        ];

        let stitched = stitch_rows(&registry, model, &options, rows).unwrap();
        assert_eq!(
            stitched,
            vec![
                json!({ "total": 5, "lines": [{ "qty": 2 }, { "qty": 3 }] }),
                json!({ "total": 5, "lines": [{ "qty": 4 }] }),
            ]
        );
    }

    #[test]
    fn test_stitch_to_one() {
        let registry = registry();
        let model = registry.model("OrderLine").unwrap();
        let options = FindOptions {
            include: Some(vec![IncludeOptions::new("Order", "order")]),
            ..Default::default()
        };
        let rows = vec![
            row(json!({ "id": 10, "order.id": 1, "order.total": 5 })),
            row(json!({ "id": 11, "order.id": null, "order.total": null })),
        ];

        let stitched = stitch_rows(&registry, model, &options, rows).unwrap();
        assert_eq!(stitched[0], json!({ "id": 10, "order": { "id": 1, "total": 5 } }));
        assert_eq!(stitched[1], json!({ "id": 11, "order": null }));
    }

    #[test]
    fn test_rows_without_includes_pass_through() {
        let registry = registry();
        let model = registry.model("Order").unwrap();
        let rows = vec![row(json!({ "total": 5 })), row(json!({ "total": 5 }))];
        let stitched = stitch_rows(&registry, model, &FindOptions::default(), rows).unwrap();
        assert_eq!(stitched.len(), 2);
    }
}
