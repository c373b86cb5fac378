use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::engine::{DocumentEngine, FindOptions};
use crate::error::{Error, Result};
use crate::mapper::FieldMapper;
use crate::schema::PrimaryKey;
use crate::types::{stage, Condition, SortDirection, SortSpec};

use super::builder::QueryBuilder;
use super::include::{
  build_include_stages, decode_included, IncludeOptions, IncludeSpec, IncludeTree,
};

/// Execution context shared by every fluent query: the mapper, the
/// engine, and the session to route calls through when a transaction
/// is in scope.
#[derive(Clone)]
pub struct QueryCore {
  pub(crate) mapper: FieldMapper,
  pub(crate) engine: Arc<dyn DocumentEngine>,
  pub(crate) session: Option<Uuid>,
}

impl QueryCore {
  pub fn new(mapper: FieldMapper, engine: Arc<dyn DocumentEngine>, session: Option<Uuid>) -> Self {
    Self { mapper, engine, session }
  }
}

/// Entry point for fluent queries against one model.
#[derive(Clone)]
pub struct ModelQuery {
  core: QueryCore,
  model: String,
}

impl ModelQuery {
  pub fn new(core: QueryCore, model: impl Into<String>) -> Self {
    Self { core, model: model.into() }
  }

  pub fn select(&self) -> SelectQuery {
    SelectQuery {
      core: self.core.clone(),
      model: self.model.clone(),
      condition: None,
      order_by: Vec::new(),
      selected: Vec::new(),
      includes: Vec::new(),
      limit: None,
      offset: None,
    }
  }

  pub fn insert(&self, document: Value) -> InsertQuery {
    InsertQuery {
      core: self.core.clone(),
      model: self.model.clone(),
      documents: vec![document],
    }
  }

  pub fn insert_many(&self, documents: Vec<Value>) -> InsertQuery {
    InsertQuery {
      core: self.core.clone(),
      model: self.model.clone(),
      documents,
    }
  }

  pub fn update(&self) -> UpdateQuery {
    UpdateQuery {
      core: self.core.clone(),
      model: self.model.clone(),
      condition: None,
      set: Map::new(),
      increments: Map::new(),
    }
  }

  pub fn delete(&self) -> DeleteQuery {
    DeleteQuery {
      core: self.core.clone(),
      model: self.model.clone(),
      condition: None,
    }
  }

  /// Condition builder rooted at this model, for ergonomic call sites.
  pub fn field(&self, name: impl Into<String>) -> FieldRef {
    FieldRef { model: self.model.clone(), field: name.into() }
  }
}

/// Half-built leaf condition: a model/field pair awaiting its operator.
pub struct FieldRef {
  model: String,
  field: String,
}

impl FieldRef {
  pub fn eq(self, value: Value) -> Condition {
    Condition::eq(self.model, self.field, value)
  }
  pub fn ne(self, value: Value) -> Condition {
    Condition::ne(self.model, self.field, value)
  }
  pub fn gt(self, value: Value) -> Condition {
    Condition::gt(self.model, self.field, value)
  }
  pub fn gte(self, value: Value) -> Condition {
    Condition::gte(self.model, self.field, value)
  }
  pub fn lt(self, value: Value) -> Condition {
    Condition::lt(self.model, self.field, value)
  }
  pub fn lte(self, value: Value) -> Condition {
    Condition::lte(self.model, self.field, value)
  }
  pub fn is_in(self, values: Value) -> Condition {
    Condition::is_in(self.model, self.field, values)
  }
  pub fn like(self, pattern: impl Into<String>) -> Condition {
    Condition::like(self.model, self.field, pattern)
  }
  pub fn contains(self, text: impl Into<String>) -> Condition {
    Condition::contains(self.model, self.field, text)
  }
  pub fn between(self, lo: Value, hi: Value) -> Condition {
    Condition::between(self.model, self.field, lo, hi)
  }
  pub fn is_null(self) -> Condition {
    Condition::is_null(self.model, self.field)
  }
}

/// Fluent SELECT. Every mutator consumes the query and returns a new
/// value, so partially-built queries can be reused freely.
#[derive(Clone)]
pub struct SelectQuery {
  core: QueryCore,
  model: String,
  condition: Option<Condition>,
  order_by: Vec<SortSpec>,
  selected: Vec<String>,
  includes: Vec<IncludeSpec>,
  limit: Option<i64>,
  offset: Option<i64>,
}

impl SelectQuery {
  /// Add a condition, AND-ed onto any existing one.
  pub fn filter(mut self, condition: Condition) -> Self {
    self.condition = Some(match self.condition {
      Some(existing) => existing.and(condition),
      None => condition,
    });
    self
  }

  pub fn order_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
    self.order_by.push(SortSpec { field: field.into(), direction });
    self
  }

  pub fn select(mut self, fields: &[&str]) -> Self {
    self.selected = fields.iter().map(|f| f.to_string()).collect();
    self
  }

  pub fn include(self, path: impl Into<String>) -> Self {
    self.include_with(path, IncludeOptions::default())
  }

  pub fn include_with(mut self, path: impl Into<String>, options: IncludeOptions) -> Self {
    self.includes.push(IncludeSpec { path: path.into(), options });
    self
  }

  pub fn limit(mut self, n: i64) -> Self {
    self.limit = Some(n);
    self
  }

  pub fn offset(mut self, n: i64) -> Self {
    self.offset = Some(n);
    self
  }

  pub async fn find_many<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
    let docs = self.fetch().await?;
    docs
      .into_iter()
      .map(|d| {
        serde_json::from_value(d).map_err(|e| Error::validation(format!("result decode: {e}")))
      })
      .collect()
  }

  /// Run the query and return the documents untyped.
  pub async fn exec(&self) -> Result<Vec<Value>> {
    self.fetch().await
  }

  pub async fn find_first<T: DeserializeOwned>(&self) -> Result<T> {
    let docs = self.clone().limit(1).fetch().await?;
    let doc = docs.into_iter().next().ok_or(Error::NotFound)?;
    serde_json::from_value(doc).map_err(|e| Error::validation(format!("result decode: {e}")))
  }

  pub async fn count(&self) -> Result<i64> {
    self.scalar_aggregate(json!({ "sum": 1 }), "count")
      .await
      .map(|v| v.as_i64().unwrap_or(0))
  }

  pub async fn exists(&self) -> Result<bool> {
    Ok(self.count().await? > 0)
  }

  pub async fn avg(&self, field: &str) -> Result<Option<f64>> {
    let column = self.core.mapper.schema_to_column(&self.model, field)?;
    let value = self.scalar_aggregate(json!({ "avg": format!("${column}") }), "avg").await?;
    Ok(value.as_f64())
  }

  pub async fn sum(&self, field: &str) -> Result<Value> {
    let column = self.core.mapper.schema_to_column(&self.model, field)?;
    self.scalar_aggregate(json!({ "sum": format!("${column}") }), "sum").await
  }

  pub async fn min(&self, field: &str) -> Result<Value> {
    let column = self.core.mapper.schema_to_column(&self.model, field)?;
    self.scalar_aggregate(json!({ "min": format!("${column}") }), "min").await
  }

  pub async fn max(&self, field: &str) -> Result<Value> {
    let column = self.core.mapper.schema_to_column(&self.model, field)?;
    self.scalar_aggregate(json!({ "max": format!("${column}") }), "max").await
  }

  /// One-stage group with `_id: null` extracting a single scalar.
  async fn scalar_aggregate(&self, accumulator: Value, alias: &str) -> Result<Value> {
    let builder = QueryBuilder::new(&self.core.mapper);
    let mut pipeline = Vec::new();
    if let Some(condition) = &self.condition {
      pipeline.push(stage::match_stage(builder.build_filter(condition)?));
    }
    pipeline.push(stage::group(json!({ "_id": null, alias: accumulator })));

    let collection = self.core.mapper.model_to_collection(&self.model);
    let rows = self
      .core
      .engine
      .aggregate(self.core.session, &collection, &pipeline)
      .await
      .map_err(Error::engine)?;
    Ok(rows.first().and_then(|r| r.get(alias)).cloned().unwrap_or(match alias {
      "count" | "sum" => json!(0),
      _ => Value::Null,
    }))
  }

  /// Run the query and return schema-shaped documents.
  async fn fetch(&self) -> Result<Vec<Value>> {
    let builder = QueryBuilder::new(&self.core.mapper);
    let collection = self.core.mapper.model_to_collection(&self.model);
    let filter = self
      .condition
      .as_ref()
      .map(|c| builder.build_filter(c))
      .transpose()?
      .unwrap_or_else(|| json!({}));

    let tree = IncludeTree::build(&self.includes);
    if tree.is_empty() {
      let sort = if self.order_by.is_empty() {
        None
      } else {
        Some(builder.build_sort(&self.model, &self.order_by)?)
      };
      let projection = builder.build_projection(&self.model, &self.selected)?;
      let options = FindOptions { sort, skip: self.offset, limit: self.limit, projection };
      let docs = self
        .core
        .engine
        .find_many(self.core.session, &collection, &filter, &options)
        .await
        .map_err(Error::engine)?;
      return docs
        .into_iter()
        .map(|d| self.core.mapper.map_column_to_schema_data(&self.model, &d))
        .collect();
    }

    // Includes expand through lookup stages; the fixed order matches
    // the translator's: match, lookups, sort, skip, limit, project.
    let mut pipeline = Vec::new();
    if self.condition.is_some() {
      pipeline.push(stage::match_stage(filter));
    }
    pipeline.extend(build_include_stages(&self.core.mapper, &self.model, &tree)?);
    if !self.order_by.is_empty() {
      pipeline.push(stage::sort(builder.build_sort(&self.model, &self.order_by)?));
    }
    if let Some(offset) = self.offset {
      pipeline.push(stage::skip(offset));
    }
    if let Some(limit) = self.limit {
      pipeline.push(stage::limit(limit));
    }
    if !self.selected.is_empty() {
      let mut selected = self.selected.clone();
      // Included relations must survive the projection.
      for (name, _) in tree.iter() {
        selected.push(name.to_string());
      }
      pipeline.push(stage::project(builder.build_projection_doc(&self.model, &selected)?));
    }

    let docs = self
      .core
      .engine
      .aggregate(self.core.session, &collection, &pipeline)
      .await
      .map_err(Error::engine)?;
    docs
      .into_iter()
      .map(|d| decode_included(&self.core.mapper, &self.model, &tree, &d))
      .collect()
  }
}

/// Outcome of a write operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteResult {
  pub rows_affected: u64,
  pub last_insert_id: Option<i64>,
}

#[derive(Clone)]
pub struct InsertQuery {
  core: QueryCore,
  model: String,
  documents: Vec<Value>,
}

impl InsertQuery {
  pub fn values(mut self, document: Value) -> Self {
    self.documents.push(document);
    self
  }

  pub async fn exec(&self) -> Result<WriteResult> {
    if self.documents.is_empty() {
      return Err(Error::validation("insert requires at least one document"));
    }
    let collection = self.core.mapper.model_to_collection(&self.model);
    let schema = self.core.mapper.registry().try_get(&self.model);
    let auto_pk = schema.as_deref().and_then(|s| s.auto_increment_pk().map(|f| f.name.clone()));

    let mut mapped = Vec::with_capacity(self.documents.len());
    let mut last_insert_id = None;
    for document in &self.documents {
      if !document.is_object() {
        return Err(Error::validation(format!(
          "{}: insert data must be an object, got {document}",
          self.model
        )));
      }
      let mut stored = self.core.mapper.map_schema_to_column_data(&self.model, document)?;
      if auto_pk.is_some() && stored.get("_id").is_none() {
        let next = self.core.mapper.generate_next_sequence(&self.model).await?;
        stored["_id"] = json!(next);
        last_insert_id = Some(next);
      }
      mapped.push(stored);
    }

    let inserted = self
      .core
      .engine
      .insert_many(self.core.session, &collection, &mapped)
      .await
      .map_err(Error::engine)?;
    Ok(WriteResult { rows_affected: inserted, last_insert_id })
  }
}

#[derive(Clone)]
pub struct UpdateQuery {
  core: QueryCore,
  model: String,
  condition: Option<Condition>,
  set: Map<String, Value>,
  increments: Map<String, Value>,
}

impl UpdateQuery {
  pub fn filter(mut self, condition: Condition) -> Self {
    self.condition = Some(match self.condition {
      Some(existing) => existing.and(condition),
      None => condition,
    });
    self
  }

  pub fn set(mut self, field: impl Into<String>, value: Value) -> Self {
    self.set.insert(field.into(), value);
    self
  }

  pub fn set_all(mut self, document: Value) -> Self {
    if let Value::Object(fields) = document {
      self.set.extend(fields);
    }
    self
  }

  pub fn increment(mut self, field: impl Into<String>, by: i64) -> Self {
    self.increments.insert(field.into(), json!(by));
    self
  }

  pub fn decrement(self, field: impl Into<String>, by: i64) -> Self {
    self.increment(field, -by)
  }

  pub async fn exec(&self) -> Result<WriteResult> {
    if self.set.is_empty() && self.increments.is_empty() {
      return Err(Error::validation("update requires at least one assignment"));
    }
    let builder = QueryBuilder::new(&self.core.mapper);
    let collection = self.core.mapper.model_to_collection(&self.model);
    // No condition updates every document.
    let filter = self
      .condition
      .as_ref()
      .map(|c| builder.build_filter(c))
      .transpose()?
      .unwrap_or_else(|| json!({}));

    let mut update = Map::new();
    if !self.set.is_empty() {
      let mapped = self
        .core
        .mapper
        .map_schema_to_column_data(&self.model, &Value::Object(self.set.clone()))?;
      update.insert("set".to_string(), mapped);
    }
    if !self.increments.is_empty() {
      let mut mapped = Map::new();
      for (field, by) in &self.increments {
        mapped.insert(self.core.mapper.schema_to_column(&self.model, field)?, by.clone());
      }
      update.insert("inc".to_string(), Value::Object(mapped));
    }

    let modified = self
      .core
      .engine
      .update_many(self.core.session, &collection, &filter, &Value::Object(update))
      .await
      .map_err(Error::engine)?;
    Ok(WriteResult { rows_affected: modified, last_insert_id: None })
  }
}

#[derive(Clone)]
pub struct DeleteQuery {
  core: QueryCore,
  model: String,
  condition: Option<Condition>,
}

impl DeleteQuery {
  pub fn filter(mut self, condition: Condition) -> Self {
    self.condition = Some(match self.condition {
      Some(existing) => existing.and(condition),
      None => condition,
    });
    self
  }

  pub async fn exec(&self) -> Result<WriteResult> {
    let builder = QueryBuilder::new(&self.core.mapper);
    let collection = self.core.mapper.model_to_collection(&self.model);
    // No condition deletes every document.
    let filter = self
      .condition
      .as_ref()
      .map(|c| builder.build_filter(c))
      .transpose()?
      .unwrap_or_else(|| json!({}));

    let deleted = self
      .core
      .engine
      .delete_many(self.core.session, &collection, &filter)
      .await
      .map_err(Error::engine)?;
    Ok(WriteResult { rows_affected: deleted, last_insert_id: None })
  }
}

impl ModelQuery {
  /// SELECT narrowed to one primary-key value; includes and selection
  /// can still be layered on before the terminal call.
  pub fn unique(&self, key: Value) -> SelectQuery {
    let field = match self.core.mapper.registry().try_get(&self.model).map(|s| s.primary_key()) {
      Some(PrimaryKey::Single(name)) => name,
      _ => "id".to_string(),
    };
    self.select().filter(Condition::eq(self.model.clone(), field, key))
  }

  /// Find a single document by primary key.
  pub async fn find_unique<T: DeserializeOwned>(&self, key: Value) -> Result<T> {
    self.unique(key).find_first().await
  }
}
