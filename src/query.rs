//! Query options and their automatic construction from field-request trees.
//!
//! A field tree mirrors the shape of the data a caller wants back:
//!
//! ```json
//! { "id": false, "total": ">=100", "lines": { "qty": false } }
//! ```
//!
//! Attribute keys select columns (and filter them when their value is not a
//! boolean marker), association keys add joins. [`auto_query`] turns such a
//! tree into [`FindOptions`] and merges caller overrides on top.

use crate::error::{QueryError, Result};
use crate::filter::{WhereOptions, to_where_options};
use crate::model::{AssociationKind, ModelDescriptor, SortOrder};
use crate::schema::Registry;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Options of a SELECT over a model
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Vec<String>>,
    #[serde(rename = "where", default, skip_serializing_if = "Option::is_none")]
    pub where_: Option<WhereOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include: Option<Vec<IncludeOptions>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<Vec<OrderItem>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distinct: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub col: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view_params: Option<Map<String, Value>>,
}

/// A joined association and the options applied to it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncludeOptions {
    pub model: String,
    #[serde(rename = "as")]
    pub alias: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
    #[serde(flatten)]
    pub options: FindOptions,
}

impl IncludeOptions {
    pub fn new(model: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            alias: alias.into(),
            required: None,
            options: FindOptions::default(),
        }
    }
}

/// `[field, direction]`; dotted fields address included associations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem(pub String, pub SortOrder);

/// Page request; a negative limit pages backwards from `count`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaginationInput {
    pub limit: i64,
    #[serde(default)]
    pub offset: Option<i64>,
    #[serde(default)]
    pub count: Option<i64>,
}

/// Field name to direction (`"asc"`/`"desc"`, case-insensitive)
pub type OrderByInput = Map<String, Value>;

/// Merge override objects into `target` in order.
///
/// Missing properties are copied and `null` overrides are skipped. Arrays
/// gain the elements they lack, objects are shallow-assigned, scalars are
/// replaced. An override whose shape does not match the existing array or
/// object fails with [`QueryError::Merge`].
pub fn merge_query(target: &mut Value, merge: &[Value]) -> Result<()> {
    if target.is_null() {
        *target = Value::Object(Map::new());
    }
    let Value::Object(options) = target else {
        return Err(QueryError::Merge("query".to_string()));
    };

    for item in merge {
        let Value::Object(item) = item else {
            continue;
        };

        for (prop, value) in item {
            let Some(existing) = options.get_mut(prop) else {
                options.insert(prop.clone(), value.clone());
                continue;
            };

            if value.is_null() {
                continue;
            }

            match existing {
                Value::Array(elements) => {
                    let Value::Array(additions) = value else {
                        return Err(QueryError::Merge(prop.clone()));
                    };
                    for element in additions {
                        if !elements.contains(element) {
                            elements.push(element.clone());
                        }
                    }
                }
                Value::Object(fields) => {
                    let Value::Object(assigned) = value else {
                        return Err(QueryError::Merge(prop.clone()));
                    };
                    for (key, field) in assigned {
                        fields.insert(key.clone(), field.clone());
                    }
                }
                scalar => *scalar = value.clone(),
            }
        }
    }

    Ok(())
}

/// Build query options for `model_name` from a field tree, then merge the
/// caller's overrides.
///
/// Fields named by the first override's `order` that are missing from the
/// tree are requested without a filter so ordering never drops a column.
#[tracing::instrument(level = "debug", skip(registry, fields, merge))]
pub fn auto_query(
    registry: &Registry,
    model_name: &str,
    fields: &Value,
    merge: &[Value],
) -> Result<FindOptions> {
    let model = registry.model(model_name)?;
    let mut fields = fields.clone();

    let order = merge
        .iter()
        .find_map(|item| item.get("order").filter(|order| !order.is_null()));
    if let (Some(Value::Array(order)), Value::Object(requested)) = (order, &mut fields) {
        for item in order {
            if let Some(field) = item.get(0).and_then(Value::as_str) {
                requested
                    .entry(field.to_string())
                    .or_insert(Value::Bool(false));
            }
        }
    }

    let options = build_query(registry, model, &fields)?;
    if merge.is_empty() {
        return Ok(options);
    }

    let mut json = serde_json::to_value(&options)?;
    merge_query(&mut json, merge)?;
    tracing::debug!(options = %json, "Merged query overrides");

    Ok(serde_json::from_value(json)?)
}

fn build_query(registry: &Registry, model: &ModelDescriptor, fields: &Value) -> Result<FindOptions> {
    match fields {
        Value::Array(list) => {
            let names: Vec<String> = list
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect();
            Ok(FindOptions {
                attributes: Some(filtered(model, &names)),
                ..Default::default()
            })
        }
        Value::Object(requested) => {
            let relations: Vec<&str> = model
                .associations
                .iter()
                .map(|a| a.alias.as_str())
                .filter(|alias| requested.contains_key(*alias))
                .collect();

            let mut attributes: Vec<String> = model
                .attribute_names()
                .filter(|name| requested.contains_key(*name))
                .map(String::from)
                .collect();
            for name in foreign_keys(model, &relations)
                .into_iter()
                .chain(primary_keys(model))
            {
                if !attributes.contains(&name) {
                    attributes.push(name);
                }
            }

            let mut filter = Map::new();
            for attr in &attributes {
                match requested.get(attr) {
                    None | Some(Value::Bool(_)) => {}
                    Some(value) => {
                        filter.insert(attr.clone(), value.clone());
                    }
                }
            }

            let mut options = to_where_options(&Value::Object(filter))?;
            options.attributes = Some(attributes);

            if !relations.is_empty() {
                let mut includes = Vec::with_capacity(relations.len());
                for alias in relations {
                    let Some(association) = model.association(alias) else {
                        continue;
                    };
                    let target = registry.model(&association.target)?;
                    let sub_options = match requested.get(alias) {
                        Some(tree @ (Value::Object(_) | Value::Array(_))) => {
                            build_query(registry, target, tree)?
                        }
                        _ => FindOptions::default(),
                    };

                    includes.push(IncludeOptions {
                        model: target.name.clone(),
                        alias: alias.to_string(),
                        required: None,
                        options: sub_options,
                    });
                }
                options.include = Some(includes);
            }

            Ok(options)
        }
        _ => Ok(FindOptions::default()),
    }
}

/// [`auto_query`] shaped for counting distinct root rows
pub fn auto_count_query(
    registry: &Registry,
    model_name: &str,
    fields: &Value,
    merge: &[Value],
) -> Result<FindOptions> {
    let mut options = auto_query(registry, model_name, fields, merge)?;
    let model = registry.model(model_name)?;

    options.attributes = None;
    options.distinct = Some(true);
    options.col = primary_keys(model).into_iter().next();

    Ok(options)
}

/// Translate a page request into `limit`/`offset`.
///
/// A zero limit means no paging. A negative limit takes the last `|limit|`
/// rows of `count` when no offset is given.
pub fn to_limit_options(page: Option<&PaginationInput>) -> FindOptions {
    let Some(page) = page else {
        return FindOptions::default();
    };
    if page.limit == 0 {
        return FindOptions::default();
    }

    let count = page.count.unwrap_or(0);
    let limit = page.limit.saturating_abs();
    let mut offset = page.offset.filter(|o| *o != 0).unwrap_or(0);

    if page.limit < 0 && offset == 0 {
        offset = count.saturating_sub(limit);
    }

    FindOptions {
        offset: Some(offset.max(0) as u64),
        limit: Some(limit as u64),
        ..Default::default()
    }
}

/// Translate a field-to-direction map into ordering options
pub fn to_order_options(order_by: Option<&OrderByInput>) -> FindOptions {
    let Some(order_by) = order_by.filter(|o| !o.is_empty()) else {
        return FindOptions::default();
    };

    let order = order_by
        .iter()
        .map(|(field, direction)| {
            let direction = match direction {
                Value::String(s) => SortOrder::parse(s),
                other => SortOrder::parse(&other.to_string()),
            };
            OrderItem(field.clone(), direction)
        })
        .collect();

    FindOptions {
        order: Some(order),
        ..Default::default()
    }
}

/// Apply include overrides, matched by `model` and optionally `as`.
///
/// Matching includes are shallow-assigned the override's other properties;
/// an override matching nothing is appended as a new include. Options
/// without includes are left alone.
pub fn override_join(options: &mut FindOptions, overrides: &[Value]) -> Result<()> {
    let Some(includes) = options.include.as_mut() else {
        return Ok(());
    };

    for item in overrides {
        let Value::Object(fields) = item else {
            return Err(QueryError::Query(format!("Invalid include override: {}", item)));
        };
        let model = fields
            .get("model")
            .and_then(Value::as_str)
            .ok_or_else(|| QueryError::Query("Include override must name a model".to_string()))?;
        let alias = fields.get("as").and_then(Value::as_str);

        let mut found = false;
        for include in includes.iter_mut() {
            if include.model != model || alias.is_some_and(|a| a != include.alias) {
                continue;
            }

            let mut merged = serde_json::to_value(&*include)?;
            if let Value::Object(target) = &mut merged {
                for (key, value) in fields {
                    if key != "model" {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
            *include = serde_json::from_value(merged)?;
            found = true;
        }

        if !found {
            includes.push(serde_json::from_value(item.clone())?);
        }
    }

    Ok(())
}

/// Include reached by following model names from the root options
pub fn get_include<'a>(options: &'a FindOptions, path: &[&str]) -> Option<&'a IncludeOptions> {
    let (current, rest) = path.split_first()?;
    let include = options
        .include
        .as_ref()?
        .iter()
        .find(|include| include.model == *current)?;

    if rest.is_empty() {
        Some(include)
    } else {
        get_include(&include.options, rest)
    }
}

pub fn primary_keys(model: &ModelDescriptor) -> Vec<String> {
    model.primary_keys().into_iter().map(String::from).collect()
}

/// Foreign key columns of the given belongs-to associations without a
/// custom source key
pub fn foreign_keys(model: &ModelDescriptor, relations: &[&str]) -> Vec<String> {
    relations
        .iter()
        .filter_map(|name| model.association(name))
        .filter(|a| a.kind == AssociationKind::BelongsTo && a.source_key.is_none())
        .map(|a| a.foreign_key.clone())
        .collect()
}

/// Columns of `model` referencing `parent`, paired with the referenced key
pub fn foreign_keys_map(parent: &ModelDescriptor, model: &ModelDescriptor) -> Option<Vec<(String, String)>> {
    let map: Vec<(String, String)> = model
        .attributes
        .iter()
        .filter_map(|attr| {
            attr.references
                .as_ref()
                .filter(|r| r.model == parent.name && !r.key.is_empty())
                .map(|r| (attr.name.clone(), r.key.clone()))
        })
        .collect();

    if map.is_empty() { None } else { Some(map) }
}

/// Attributes of `model` named in `fields`, in model order, falling back to
/// the primary keys when none match
pub fn filtered(model: &ModelDescriptor, fields: &[String]) -> Vec<String> {
    let matched: Vec<String> = model
        .attribute_names()
        .filter(|name| fields.iter().any(|f| f == name))
        .map(String::from)
        .collect();

    if matched.is_empty() {
        primary_keys(model)
    } else {
        matched
    }
}

/// Strip everything but model attributes from an input object (or array)
pub fn pure_data(model: &ModelDescriptor, input: &Value, attributes: Option<&[String]>) -> Value {
    match input {
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| pure_data(model, item, attributes))
                .collect(),
        ),
        Value::Object(object) => {
            let keep = |name: &str| match attributes {
                Some(list) => list.iter().any(|a| a == name),
                None => model.has_attribute(name),
            };
            Value::Object(
                object
                    .iter()
                    .filter(|(key, _)| keep(key))
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect(),
            )
        }
        other => other.clone(),
    }
}

/// Attribute projection of a field tree with primary keys added; `None`
/// when no fields were requested, meaning every column
pub fn pure_fields(model: &ModelDescriptor, fields: Option<&Value>) -> Option<Vec<String>> {
    let Value::Object(requested) = fields? else {
        return None;
    };

    let mut list: Vec<String> = requested
        .keys()
        .filter(|key| model.has_attribute(key))
        .cloned()
        .collect();
    for pk in primary_keys(model) {
        if !list.contains(&pk) {
            list.push(pk);
        }
    }

    Some(list)
}

/// Whether a field tree requests any association of `model`
pub fn need_nesting(model: &ModelDescriptor, fields: Option<&Value>) -> bool {
    let Some(Value::Object(requested)) = fields else {
        return false;
    };

    model
        .associations
        .iter()
        .any(|a| requested.contains_key(&a.alias))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{Operator, WhereKey, WhereValue};
    use crate::model::{Association, Attribute, ModelBuilder};
    use crate::schema::SqlType;
    use serde_json::json;

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry
            .register(
                ModelBuilder::table("Customer")
                    .attribute(Attribute::new("id", SqlType::Integer).primary_key())
                    .attribute(Attribute::new("name", SqlType::Text))
                    .attribute(Attribute::new("age", SqlType::Integer))
                    .association(Association::has_many("orders", "Order", "customerId"))
                    .build()
                    .unwrap(),
            )
            .unwrap();
        registry
            .register(
                ModelBuilder::table("Order")
                    .attribute(Attribute::new("id", SqlType::Integer).primary_key())
                    .attribute(Attribute::new("customerId", SqlType::Integer).references("Customer", "id"))
                    .attribute(Attribute::new("total", SqlType::Integer))
                    .attribute(Attribute::new("meta", SqlType::Json))
                    .association(Association::belongs_to("customer", "Customer", "customerId"))
                    .association(Association::has_many("lines", "OrderLine", "orderId"))
                    .build()
                    .unwrap(),
            )
            .unwrap();
        registry
            .register(
                ModelBuilder::table("OrderLine")
                    .attribute(Attribute::new("id", SqlType::Integer).primary_key())
                    .attribute(Attribute::new("orderId", SqlType::Integer).references("Order", "id"))
                    .attribute(Attribute::new("qty", SqlType::Integer))
                    .build()
                    .unwrap(),
            )
            .unwrap();
        registry
    }

    #[test]
    fn test_merge_appends_unique_array_elements() {
        let mut target = json!({ "attributes": ["a", "b"] });
        merge_query(&mut target, &[json!({ "attributes": ["b", "c"] })]).unwrap();
        assert_eq!(target, json!({ "attributes": ["a", "b", "c"] }));
    }

    #[test]
    fn test_merge_rules() {
        let mut target = json!({ "where": { "a": 1 }, "limit": 5 });
        merge_query(
            &mut target,
            &[
                json!({ "where": { "b": 2 }, "limit": null, "offset": 10 }),
                json!({ "limit": 20 }),
            ],
        )
        .unwrap();
        assert_eq!(target, json!({ "where": { "a": 1, "b": 2 }, "limit": 20, "offset": 10 }));
    }

    #[test]
    fn test_merge_shape_mismatch() {
        let mut target = json!({ "order": [["id", "ASC"]] });
        let err = merge_query(&mut target, &[json!({ "order": "id" })]).unwrap_err();
        assert_eq!(err.to_string(), "Merge error: Given order option is invalid!");

        let mut target = json!({ "where": { "a": 1 } });
        assert!(merge_query(&mut target, &[json!({ "where": [1] })]).is_err());
    }

    #[test]
    fn test_auto_query_projection_keeps_primary_key() {
        let registry = registry();
        let options = auto_query(&registry, "Customer", &json!({ "name": true }), &[]).unwrap();
        assert_eq!(options.attributes, Some(vec!["name".to_string(), "id".to_string()]));
        assert!(options.where_.is_none());
    }

    #[test]
    fn test_auto_query_array_fields() {
        let registry = registry();
        let options = auto_query(&registry, "Customer", &json!(["age", "nope"]), &[]).unwrap();
        assert_eq!(options.attributes, Some(vec!["age".to_string()]));

        let options = auto_query(&registry, "Customer", &json!(["nope"]), &[]).unwrap();
        assert_eq!(options.attributes, Some(vec!["id".to_string()]));
    }

    #[test]
    fn test_auto_query_filters_typed_values() {
        let registry = registry();
        let options = auto_query(&registry, "Customer", &json!({ "name": false, "age": ">=18" }), &[]).unwrap();

        let clause = options.where_.unwrap();
        assert!(clause.field("name").is_none());
        let Some(WhereValue::Map(age)) = clause.field("age") else {
            panic!("expected operator map");
        };
        assert_eq!(age.get(&WhereKey::Op(Operator::Gte)), Some(&WhereValue::json(json!(18))));
    }

    #[test]
    fn test_auto_query_includes_and_foreign_keys() {
        let registry = registry();
        let options = auto_query(
            &registry,
            "Order",
            &json!({ "total": false, "customer": { "name": "%an%" }, "lines": { "qty": false } }),
            &[],
        )
        .unwrap();

        assert_eq!(
            options.attributes,
            Some(vec!["total".to_string(), "customerId".to_string(), "id".to_string()])
        );

        let includes = options.include.unwrap();
        assert_eq!(includes.len(), 2);
        assert_eq!(includes[0].model, "Customer");
        assert_eq!(includes[0].alias, "customer");
        assert!(includes[0].options.where_.is_some());
        assert_eq!(includes[1].alias, "lines");
        assert_eq!(
            includes[1].options.attributes,
            Some(vec!["qty".to_string(), "id".to_string()])
        );
    }

    #[test]
    fn test_auto_query_order_forces_field() {
        let registry = registry();
        let options = auto_query(
            &registry,
            "Customer",
            &json!({ "name": true }),
            &[json!({ "order": [["age", "DESC"]] })],
        )
        .unwrap();

        assert_eq!(
            options.attributes,
            Some(vec!["name".to_string(), "age".to_string(), "id".to_string()])
        );
        assert!(options.where_.is_none());
        assert_eq!(options.order, Some(vec![OrderItem("age".to_string(), SortOrder::Desc)]));
    }

    #[test]
    fn test_auto_query_unknown_filter_key_passthrough() {
        let registry = registry();
        let options = auto_query(&registry, "Order", &json!({ "meta": { "colour": "red" } }), &[]).unwrap();
        let clause = options.where_.unwrap();
        assert_eq!(clause.to_json(), json!({ "meta": { "colour": "red" } }));
    }

    #[test]
    fn test_auto_count_query() {
        let registry = registry();
        let options = auto_count_query(&registry, "Order", &json!({ "total": ">5" }), &[]).unwrap();
        assert!(options.attributes.is_none());
        assert_eq!(options.distinct, Some(true));
        assert_eq!(options.col.as_deref(), Some("id"));
        assert!(options.where_.is_some());
    }

    #[test]
    fn test_to_limit_options() {
        assert_eq!(to_limit_options(None), FindOptions::default());

        let page = PaginationInput { limit: 10, offset: Some(20), count: None };
        let options = to_limit_options(Some(&page));
        assert_eq!((options.limit, options.offset), (Some(10), Some(20)));

        let page = PaginationInput { limit: -10, offset: None, count: Some(25) };
        let options = to_limit_options(Some(&page));
        assert_eq!((options.limit, options.offset), (Some(10), Some(15)));

        let page = PaginationInput { limit: -10, offset: None, count: Some(4) };
        assert_eq!(to_limit_options(Some(&page)).offset, Some(0));

        let page = PaginationInput { limit: i64::MIN, offset: None, count: Some(3) };
        let options = to_limit_options(Some(&page));
        assert_eq!((options.limit, options.offset), (Some(i64::MAX as u64), Some(0)));
    }

    #[test]
    fn test_to_order_options() {
        let order_by: OrderByInput = serde_json::from_value(json!({ "name": "desc", "id": "whatever" })).unwrap();
        let options = to_order_options(Some(&order_by));
        assert_eq!(
            options.order,
            Some(vec![
                OrderItem("name".to_string(), SortOrder::Desc),
                OrderItem("id".to_string(), SortOrder::Asc),
            ])
        );
        assert!(to_order_options(Some(&Map::new())).order.is_none());
    }

    #[test]
    fn test_override_join() {
        let mut options = FindOptions {
            include: Some(vec![IncludeOptions::new("Customer", "customer")]),
            ..Default::default()
        };
        override_join(
            &mut options,
            &[
                json!({ "model": "Customer", "required": true }),
                json!({ "model": "OrderLine", "as": "lines", "attributes": ["id"] }),
            ],
        )
        .unwrap();

        let includes = options.include.as_ref().unwrap();
        assert_eq!(includes[0].required, Some(true));
        assert_eq!(includes[1].alias, "lines");
        assert_eq!(includes[1].options.attributes, Some(vec!["id".to_string()]));

        assert!(get_include(&options, &["OrderLine"]).is_some());
        assert!(get_include(&options, &["Customer", "Order"]).is_none());
    }

    #[test]
    fn test_find_options_json_shape() {
        let options: FindOptions = serde_json::from_value(json!({
            "attributes": ["id"],
            "include": [{ "model": "OrderLine", "as": "lines", "required": false, "where": { "qty": 2 } }],
            "viewParams": { "min": 1 }
        }))
        .unwrap();

        let include = &options.include.as_ref().unwrap()[0];
        assert_eq!(include.required, Some(false));
        assert!(include.options.where_.is_some());
        assert!(options.view_params.is_some());

        let json = serde_json::to_value(&options).unwrap();
        assert_eq!(json["include"][0]["as"], json!("lines"));
        assert!(json.get("limit").is_none());
    }

    #[test]
    fn test_field_helpers() {
        let registry = registry();
        let order = registry.model("Order").unwrap();
        let customer = registry.model("Customer").unwrap();

        assert_eq!(
            pure_data(order, &json!({ "total": 1, "lines": [] }), None),
            json!({ "total": 1 })
        );
        assert_eq!(
            pure_fields(order, Some(&json!({ "total": true, "lines": {} }))),
            Some(vec!["total".to_string(), "id".to_string()])
        );
        assert_eq!(pure_fields(order, None), None);
        assert!(need_nesting(order, Some(&json!({ "lines": {} }))));
        assert!(!need_nesting(order, Some(&json!({ "total": 1 }))));
        assert_eq!(foreign_keys(order, &["customer", "lines"]), vec!["customerId".to_string()]);
        assert_eq!(
            foreign_keys_map(customer, order),
            Some(vec![("customerId".to_string(), "id".to_string())])
        );
        assert_eq!(foreign_keys_map(order, customer), None);
    }
}
