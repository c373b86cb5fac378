use std::sync::Arc;

use crate::engine::{DocumentEngine, IndexSpec};
use crate::error::{Error, Result};
use crate::mapper::{FieldMapper, SEQUENCES_COLLECTION};
use crate::schema::PrimaryKey;

/// Ensure collections and indexes exist for every registered model.
///
/// Idempotent: existing collections and indexes are left alone, and
/// nothing is ever dropped.
pub async fn sync_schemas(mapper: &FieldMapper, engine: &Arc<dyn DocumentEngine>) -> Result<()> {
  for schema in mapper.registry().all() {
    let collection = schema.collection_name();

    if let Err(err) = engine.create_collection(&collection).await {
      if !is_already_exists(&err) {
        return Err(Error::engine(err));
      }
    }

    let existing = engine.list_indexes(&collection).await.map_err(Error::engine)?;
    let pk_fields: Vec<String> = match schema.primary_key() {
      PrimaryKey::Single(name) => vec![name],
      PrimaryKey::Composite(names) => names,
      PrimaryKey::Implicit => vec!["id".to_string()],
    };

    let mut wanted: Vec<IndexSpec> = Vec::new();
    for field in &schema.fields {
      if pk_fields.contains(&field.name) {
        continue;
      }
      let column = field.column_name().to_string();
      if field.unique {
        wanted.push(IndexSpec {
          name: index_name(&collection, &[column.clone()]),
          columns: vec![(column, 1)],
          unique: true,
        });
      } else if field.index {
        wanted.push(IndexSpec {
          name: index_name(&collection, &[column.clone()]),
          columns: vec![(column, 1)],
          unique: false,
        });
      }
    }
    for composite in &schema.composite_indexes {
      let mut columns = Vec::with_capacity(composite.fields.len());
      for field in &composite.fields {
        columns.push((mapper.schema_to_column(&schema.name, field)?, 1));
      }
      let names: Vec<String> = columns.iter().map(|(c, _)| c.clone()).collect();
      wanted.push(IndexSpec {
        name: index_name(&collection, &names),
        columns,
        unique: composite.unique,
      });
    }

    for index in wanted {
      if existing.iter().any(|name| name == &index.name) {
        continue;
      }
      if let Err(err) = engine.create_index(&collection, &index).await {
        if !is_already_exists(&err) {
          return Err(Error::engine(err));
        }
      }
      tracing::debug!(collection = %collection, index = %index.name, "index created");
    }
    tracing::info!(model = %schema.name, collection = %collection, "schema synced");
  }
  Ok(())
}

/// Collections visible to callers: engine bookkeeping and system
/// namespaces stay hidden.
pub async fn list_tables(engine: &Arc<dyn DocumentEngine>) -> Result<Vec<String>> {
  let collections = engine.list_collections().await.map_err(Error::engine)?;
  Ok(
    collections
      .into_iter()
      .filter(|name| !name.starts_with("system.") && name != SEQUENCES_COLLECTION)
      .collect(),
  )
}

fn index_name(collection: &str, columns: &[String]) -> String {
  format!("{}_{}_idx", collection, columns.join("_"))
}

fn is_already_exists(err: &anyhow::Error) -> bool {
  err.to_string().to_lowercase().contains("already exists")
}
