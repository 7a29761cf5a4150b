//! Recursive creation of an entity together with its associated children.

use crate::backend::DatabaseBackend;
use crate::builder::Returning;
use crate::entity::Entity;
use crate::error::{QueryError, Result};
use crate::interface::Transaction;
use crate::model::{Association, ModelDescriptor};
use crate::query::{filtered, foreign_keys_map, primary_keys};
use crate::schema::Registry;
use futures::future::{BoxFuture, FutureExt};
use serde_json::{Map, Value};

/// Insert `input` as a `model` row, then every nested association input,
/// all inside `tx`.
///
/// Children referencing the parent model get the parent's key copied in
/// unless the input sets it. With `fields`, the returned entity projects the
/// requested attributes plus primary keys; children are appended under
/// their association name. The transaction is never committed here.
pub fn create_entity_in<'a, 't, B>(
    tx: &'a mut Transaction<'t, B>,
    registry: &'a Registry,
    model: &'a ModelDescriptor,
    input: &'a Value,
    fields: Option<&'a Value>,
    parent: Option<&'a Entity>,
) -> BoxFuture<'a, Result<Entity>>
where
    B: DatabaseBackend + 'a,
    't: 'a,
{
    async move {
        let Value::Object(input) = input else {
            return Err(QueryError::Query(format!(
                "Input for {} must be an object, got {}",
                model.name, input
            )));
        };

        let mut values = Map::new();
        let mut relations: Vec<(&Association, &Value)> = Vec::new();
        for (key, value) in input {
            if let Some(association) = model.association(key) {
                relations.push((association, value));
            } else if model.has_attribute(key) {
                values.insert(key.clone(), value.clone());
            }
        }

        if let Some(parent) = parent {
            let parent_model = registry.model(parent.model())?;
            for (column, key) in foreign_keys_map(parent_model, model).unwrap_or_default() {
                if values.get(&column).is_none_or(Value::is_null) {
                    let value = parent.get(&key).cloned().unwrap_or(Value::Null);
                    values.insert(column, value);
                }
            }
        }

        let projection = match fields {
            Some(Value::Object(requested)) => {
                let mut names: Vec<String> = requested.keys().cloned().collect();
                names.extend(primary_keys(model));
                Some(filtered(model, &names))
            }
            _ => None,
        };
        let returning = match &projection {
            Some(columns) => Returning::columns(columns.iter().cloned()),
            None => Returning::All,
        };

        let row = tx
            .insert(model, &values, returning)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| QueryError::Query(format!("Insert into {} returned no row", model.table_name)))?;

        tracing::debug!(model = %model.name, "Created entity");
        let mut entity = Entity::from_row(model.name.clone(), row, projection);

        for (association, sub_input) in relations {
            let target = registry.model(&association.target)?;
            let sub_fields = match fields {
                Some(Value::Object(requested)) => requested.get(&association.alias),
                _ => None,
            };

            let child = match sub_input {
                Value::Array(items) => {
                    let mut children = Vec::with_capacity(items.len());
                    for item in items {
                        let child = create_entity_in(&mut *tx, registry, target, item, sub_fields, Some(&entity)).await?;
                        children.push(child.into_json());
                    }
                    Value::Array(children)
                }
                Value::Null => continue,
                single => create_entity_in(&mut *tx, registry, target, single, sub_fields, Some(&entity))
                    .await?
                    .into_json(),
            };

            entity.append_child(&association.alias, child);
        }

        Ok(entity)
    }
    .boxed()
}
