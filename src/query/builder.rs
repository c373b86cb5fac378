use serde_json::{Map, Value};

use crate::error::Result;
use crate::mapper::FieldMapper;
use crate::schema::PrimaryKey;
use crate::types::{Condition, SortSpec};

/// Compiles condition trees, orderings and selections into the
/// filter/sort/projection documents a command carries.
pub struct QueryBuilder<'a> {
  mapper: &'a FieldMapper,
}

impl<'a> QueryBuilder<'a> {
  pub fn new(mapper: &'a FieldMapper) -> Self {
    Self { mapper }
  }

  pub fn build_filter(&self, condition: &Condition) -> Result<Value> {
    condition.to_filter(self.mapper)
  }

  /// Ordered `{column: 1|-1}` document; key order follows declaration
  /// order.
  pub fn build_sort(&self, model: &str, specs: &[SortSpec]) -> Result<Value> {
    let mut sort = Map::new();
    for spec in specs {
      let column = self.mapper.schema_to_column(model, &spec.field)?;
      sort.insert(column, Value::from(spec.direction.as_i64()));
    }
    Ok(Value::Object(sort))
  }

  /// Projection columns for a find command. `_id` rides along only
  /// when the selection names the primary key or `_id` itself.
  pub fn build_projection(&self, model: &str, fields: &[String]) -> Result<Vec<String>> {
    let mut columns = Vec::with_capacity(fields.len());
    for field in fields {
      columns.push(self.mapper.schema_to_column(model, field)?);
    }
    Ok(columns)
  }

  /// Projection document for a pipeline `project` stage: `{col: 1}`
  /// entries with `_id` suppressed unless explicitly requested.
  pub fn build_projection_doc(&self, model: &str, fields: &[String]) -> Result<Value> {
    let mut doc = Map::new();
    let mut id_requested = false;
    for field in fields {
      let column = self.mapper.schema_to_column(model, field)?;
      if column == "_id" {
        id_requested = true;
      }
      doc.insert(column, Value::from(1));
    }
    if !id_requested {
      doc.insert("_id".to_string(), Value::from(0));
    }
    Ok(Value::Object(doc))
  }

  /// True when the selection names the model's primary key (under any
  /// of its spellings).
  pub fn selects_primary_key(&self, model: &str, fields: &[String]) -> bool {
    let Some(schema) = self.mapper.registry().try_get(model) else {
      return fields.iter().any(|f| f == "_id");
    };
    fields.iter().any(|f| {
      f == "_id"
        || match schema.primary_key() {
          PrimaryKey::Single(pk) => *f == pk,
          PrimaryKey::Implicit => f == "id",
          PrimaryKey::Composite(_) => false,
        }
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::engine::MemoryEngine;
  use crate::schema::{Field, FieldType, Schema, SchemaRegistry};
  use crate::types::SortDirection;
  use serde_json::json;
  use std::sync::Arc;

  fn mapper() -> FieldMapper {
    let registry = Arc::new(SchemaRegistry::new());
    registry
      .register(
        Schema::new("User")
          .field(Field::new("id", FieldType::Int).primary_key())
          .field(Field::new("name", FieldType::String))
          .field(Field::new("createdAt", FieldType::DateTime).column("created_at")),
      )
      .unwrap();
    FieldMapper::new(registry, Arc::new(MemoryEngine::new()))
  }

  #[test]
  fn filter_resolves_columns() {
    let mapper = mapper();
    let builder = QueryBuilder::new(&mapper);
    let cond = Condition::eq("User", "id", json!(1)).and(Condition::gt("User", "createdAt", json!("2024")));
    assert_eq!(
      builder.build_filter(&cond).unwrap(),
      json!({"and": [{"_id": 1}, {"created_at": {"gt": "2024"}}]})
    );
  }

  #[test]
  fn sort_preserves_order() {
    let mapper = mapper();
    let builder = QueryBuilder::new(&mapper);
    let sort = builder
      .build_sort(
        "User",
        &[
          SortSpec { field: "name".into(), direction: SortDirection::Asc },
          SortSpec { field: "id".into(), direction: SortDirection::Desc },
        ],
      )
      .unwrap();
    assert_eq!(sort, json!({"name": 1, "_id": -1}));
    let keys: Vec<&String> = sort.as_object().unwrap().keys().collect();
    assert_eq!(keys, ["name", "_id"]);
  }

  #[test]
  fn projection_suppresses_id_unless_requested() {
    let mapper = mapper();
    let builder = QueryBuilder::new(&mapper);

    let doc = builder.build_projection_doc("User", &["name".into()]).unwrap();
    assert_eq!(doc, json!({"name": 1, "_id": 0}));

    let doc = builder
      .build_projection_doc("User", &["name".into(), "id".into()])
      .unwrap();
    assert_eq!(doc, json!({"name": 1, "_id": 1}));
  }

  #[test]
  fn primary_key_detection() {
    let mapper = mapper();
    let builder = QueryBuilder::new(&mapper);
    assert!(builder.selects_primary_key("User", &["id".into()]));
    assert!(builder.selects_primary_key("User", &["_id".into()]));
    assert!(!builder.selects_primary_key("User", &["name".into()]));
  }
}
