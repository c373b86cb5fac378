use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::engine::DocumentEngine;
use crate::error::{Error, Result};
use crate::schema::{PrimaryKey, Schema, SchemaRegistry};
use crate::types::FieldResolver;

/// Collection holding one counter document per auto-increment target.
pub const SEQUENCES_COLLECTION: &str = "__sequences";

/// Resolves model and field names to their storage shape.
///
/// Single primary keys live under `_id`; composite keys nest under
/// `_id.<column>` and are only rewritten in bulk. Models missing from
/// the registry pass names through untouched, so schema-less use keeps
/// working.
#[derive(Clone)]
pub struct FieldMapper {
  registry: Arc<SchemaRegistry>,
  engine: Arc<dyn DocumentEngine>,
}

impl FieldMapper {
  pub fn new(registry: Arc<SchemaRegistry>, engine: Arc<dyn DocumentEngine>) -> Self {
    Self { registry, engine }
  }

  pub fn registry(&self) -> &SchemaRegistry {
    &self.registry
  }

  /// Physical collection for a model name.
  pub fn model_to_collection(&self, model: &str) -> String {
    match self.registry.try_get(model) {
      Some(schema) => schema.collection_name(),
      None => crate::schema::pluralize(&crate::schema::snake_case(model)),
    }
  }

  /// Schema field name to storage column, including the `_id` rewrite.
  pub fn schema_to_column(&self, model: &str, field: &str) -> Result<String> {
    let Some(schema) = self.registry.try_get(model) else {
      return Ok(field.to_string());
    };
    Ok(column_for(&schema, field))
  }

  /// Storage column back to schema field name.
  pub fn column_to_schema(&self, model: &str, column: &str) -> Result<String> {
    let Some(schema) = self.registry.try_get(model) else {
      return Ok(column.to_string());
    };
    Ok(field_for(&schema, column))
  }

  /// Bulk rewrite of a schema-shaped document into storage shape.
  /// Composite key members collapse into a nested `_id` object in
  /// declaration order.
  pub fn map_schema_to_column_data(&self, model: &str, doc: &Value) -> Result<Value> {
    let obj = doc
      .as_object()
      .ok_or_else(|| Error::validation(format!("{model}: document data must be an object")))?;
    let Some(schema) = self.registry.try_get(model) else {
      return Ok(doc.clone());
    };

    let mut out = Map::new();
    match schema.primary_key() {
      PrimaryKey::Composite(members) => {
        let mut id = Map::new();
        for member in &members {
          if let Some(v) = obj.get(member) {
            let column = schema.get_field(member).map(|f| f.column_name().to_string());
            id.insert(column.unwrap_or_else(|| member.clone()), v.clone());
          }
        }
        if !id.is_empty() {
          out.insert("_id".to_string(), Value::Object(id));
        }
        for (key, value) in obj {
          if members.contains(key) {
            continue;
          }
          out.insert(column_for(&schema, key), value.clone());
        }
      }
      _ => {
        for (key, value) in obj {
          out.insert(column_for(&schema, key), value.clone());
        }
      }
    }
    Ok(Value::Object(out))
  }

  /// Inverse of [`Self::map_schema_to_column_data`]; nested composite
  /// `_id` objects expand back into their member fields.
  pub fn map_column_to_schema_data(&self, model: &str, doc: &Value) -> Result<Value> {
    let obj = doc
      .as_object()
      .ok_or_else(|| Error::validation(format!("{model}: document data must be an object")))?;
    let Some(schema) = self.registry.try_get(model) else {
      return Ok(doc.clone());
    };

    let mut out = Map::new();
    for (key, value) in obj {
      if key == "_id" {
        match (schema.primary_key(), value) {
          (PrimaryKey::Composite(_), Value::Object(members)) => {
            for (column, v) in members {
              out.insert(field_for(&schema, column), v.clone());
            }
          }
          (pk, v) => {
            out.insert(pk_field_name(&pk), v.clone());
          }
        }
      } else {
        out.insert(field_for(&schema, key), value.clone());
      }
    }
    Ok(Value::Object(out))
  }

  /// Allocate the next auto-increment value for a model's collection
  /// via a single atomic engine call; safe under concurrency.
  pub async fn generate_next_sequence(&self, model: &str) -> Result<i64> {
    let collection = self.model_to_collection(model);
    let doc = self
      .engine
      .find_one_and_update(
        SEQUENCES_COLLECTION,
        &json!({ "_id": collection }),
        &json!({ "inc": { "value": 1 } }),
        true,
      )
      .await
      .map_err(Error::engine)?
      .ok_or_else(|| Error::internal(format!("sequence allocation returned nothing for {collection}")))?;
    doc
      .get("value")
      .and_then(Value::as_i64)
      .ok_or_else(|| Error::internal(format!("sequence document for {collection} has no numeric value")))
  }
}

impl FieldResolver for FieldMapper {
  fn resolve_column(&self, model: &str, field: &str) -> Result<String> {
    self.schema_to_column(model, field)
  }
}

fn pk_field_name(pk: &PrimaryKey) -> String {
  match pk {
    PrimaryKey::Single(name) => name.clone(),
    // Composite `_id` values are never rewritten individually.
    PrimaryKey::Composite(_) => "_id".to_string(),
    PrimaryKey::Implicit => "id".to_string(),
  }
}

fn column_for(schema: &Schema, field: &str) -> String {
  match schema.primary_key() {
    PrimaryKey::Single(pk) if pk == field => return "_id".to_string(),
    PrimaryKey::Implicit if field == "id" => return "_id".to_string(),
    PrimaryKey::Composite(members) if members.iter().any(|m| m == field) => {
      let column = schema
        .get_field(field)
        .map(|f| f.column_name().to_string())
        .unwrap_or_else(|| field.to_string());
      return format!("_id.{column}");
    }
    _ => {}
  }
  schema
    .get_field(field)
    .map(|f| f.column_name().to_string())
    .unwrap_or_else(|| field.to_string())
}

fn field_for(schema: &Schema, column: &str) -> String {
  if column == "_id" {
    return pk_field_name(&schema.primary_key());
  }
  if let Some(member) = column.strip_prefix("_id.") {
    return schema
      .field_by_column(member)
      .map(|f| f.name.clone())
      .unwrap_or_else(|| member.to_string());
  }
  schema
    .field_by_column(column)
    .map(|f| f.name.clone())
    .unwrap_or_else(|| column.to_string())
}
