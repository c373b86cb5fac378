use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Engine operation carried by a [`Command`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
  Find,
  Aggregate,
  Insert,
  Update,
  Delete,
}

/// Cursor options for `find` commands.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandOptions {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub limit: Option<i64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub skip: Option<i64>,
  /// Ordered sort document, `{column: 1|-1}` per key.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub sort: Option<Value>,
}

impl CommandOptions {
  pub fn is_empty(&self) -> bool {
    self.limit.is_none() && self.skip.is_none() && self.sort.is_none()
  }
}

/// The sole carrier between query compilation and the raw executor.
///
/// Serializes to the engine wire shape; JSON objects preserve insertion
/// order so sort documents and composite `_id` keys survive transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
  pub operation: Operation,
  pub collection: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub filter: Option<Value>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub update: Option<Value>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub pipeline: Option<Vec<Value>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub documents: Option<Vec<Value>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub options: Option<CommandOptions>,
  /// Projection columns for `find`.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub fields: Option<Vec<String>>,
  #[serde(rename = "lastInsertId", skip_serializing_if = "Option::is_none")]
  pub last_insert_id: Option<i64>,
}

impl Command {
  pub fn find(collection: impl Into<String>) -> Self {
    Self::bare(Operation::Find, collection)
  }

  pub fn aggregate(collection: impl Into<String>, pipeline: Vec<Value>) -> Self {
    let mut cmd = Self::bare(Operation::Aggregate, collection);
    cmd.pipeline = Some(pipeline);
    cmd
  }

  pub fn insert(collection: impl Into<String>, documents: Vec<Value>) -> Self {
    let mut cmd = Self::bare(Operation::Insert, collection);
    cmd.documents = Some(documents);
    cmd
  }

  pub fn update(collection: impl Into<String>, filter: Value, update: Value) -> Self {
    let mut cmd = Self::bare(Operation::Update, collection);
    cmd.filter = Some(filter);
    cmd.update = Some(update);
    cmd
  }

  pub fn delete(collection: impl Into<String>, filter: Value) -> Self {
    let mut cmd = Self::bare(Operation::Delete, collection);
    cmd.filter = Some(filter);
    cmd
  }

  fn bare(operation: Operation, collection: impl Into<String>) -> Self {
    Self {
      operation,
      collection: collection.into(),
      filter: None,
      update: None,
      pipeline: None,
      documents: None,
      options: None,
      fields: None,
      last_insert_id: None,
    }
  }

  pub fn with_filter(mut self, filter: Value) -> Self {
    self.filter = Some(filter);
    self
  }

  pub fn with_options(mut self, options: CommandOptions) -> Self {
    if !options.is_empty() {
      self.options = Some(options);
    }
    self
  }

  pub fn with_fields(mut self, fields: Vec<String>) -> Self {
    if !fields.is_empty() {
      self.fields = Some(fields);
    }
    self
  }

  /// Enforce the per-operation structural invariants.
  pub fn validate(&self) -> Result<()> {
    match self.operation {
      Operation::Find => {
        if self.update.is_some() || self.pipeline.is_some() {
          return Err(Error::validation("find command forbids update and pipeline"));
        }
      }
      Operation::Aggregate => {
        if self.pipeline.as_ref().map_or(true, |p| p.is_empty()) {
          return Err(Error::validation("aggregate command requires a pipeline"));
        }
      }
      Operation::Insert => {
        if self.documents.as_ref().map_or(true, |d| d.is_empty()) {
          return Err(Error::validation("insert command requires documents"));
        }
      }
      Operation::Update => {
        if self.update.is_none() {
          return Err(Error::validation("update command requires an update document"));
        }
      }
      // An absent filter on delete means "all documents".
      Operation::Delete => {}
    }
    Ok(())
  }

  pub fn to_json(&self) -> Result<String> {
    serde_json::to_string(self).map_err(|e| Error::internal(format!("command serialization: {e}")))
  }

  pub fn from_json(input: &str) -> Result<Self> {
    let cmd: Command = serde_json::from_str(input)
      .map_err(|e| Error::syntax(format!("unparseable command JSON: {e}")))?;
    cmd.validate()?;
    Ok(cmd)
  }
}

/// Pipeline stage constructors.
///
/// Stage and operator keys are bare words; field references in
/// expression position are `$`-prefixed, lookup variables `$$`-prefixed.
pub mod stage {
  use serde_json::{json, Value};

  pub fn match_stage(filter: Value) -> Value {
    json!({ "match": filter })
  }

  /// Plain equality lookup on local/foreign columns.
  pub fn lookup(from: &str, local_field: &str, foreign_field: &str, as_field: &str) -> Value {
    json!({
      "lookup": {
        "from": from,
        "localField": local_field,
        "foreignField": foreign_field,
        "as": as_field,
      }
    })
  }

  /// Pipeline-form lookup with bound variables, used when the joined
  /// side carries its own filter/order/slice stages.
  pub fn lookup_pipeline(from: &str, let_vars: Value, pipeline: Vec<Value>, as_field: &str) -> Value {
    json!({
      "lookup": {
        "from": from,
        "let": let_vars,
        "pipeline": pipeline,
        "as": as_field,
      }
    })
  }

  pub fn unwind(path: &str, preserve_null_and_empty: bool) -> Value {
    json!({
      "unwind": {
        "path": format!("${path}"),
        "preserveNullAndEmptyArrays": preserve_null_and_empty,
      }
    })
  }

  pub fn group(spec: Value) -> Value {
    json!({ "group": spec })
  }

  pub fn sort(spec: Value) -> Value {
    json!({ "sort": spec })
  }

  pub fn skip(n: i64) -> Value {
    json!({ "skip": n })
  }

  pub fn limit(n: i64) -> Value {
    json!({ "limit": n })
  }

  pub fn project(spec: Value) -> Value {
    json!({ "project": spec })
  }

  pub fn count(field: &str) -> Value {
    json!({ "count": field })
  }

  pub fn replace_root(new_root: &str) -> Value {
    json!({ "replaceRoot": { "newRoot": format!("${new_root}") } })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn find_forbids_pipeline() {
    let mut cmd = Command::find("users");
    assert!(cmd.validate().is_ok());
    cmd.pipeline = Some(vec![stage::limit(1)]);
    assert!(matches!(cmd.validate(), Err(Error::Validation(_))));
  }

  #[test]
  fn aggregate_requires_pipeline() {
    let cmd = Command::aggregate("users", vec![]);
    assert!(matches!(cmd.validate(), Err(Error::Validation(_))));
  }

  #[test]
  fn insert_requires_documents() {
    let cmd = Command::insert("users", vec![]);
    assert!(matches!(cmd.validate(), Err(Error::Validation(_))));
  }

  #[test]
  fn wire_shape_round_trip() {
    let cmd = Command::find("users")
      .with_filter(json!({"age": {"gt": 25}}))
      .with_options(CommandOptions {
        limit: Some(10),
        skip: Some(5),
        sort: Some(json!({"name": 1, "age": -1})),
      });

    let text = cmd.to_json().unwrap();
    let back = Command::from_json(&text).unwrap();
    assert_eq!(back.operation, Operation::Find);
    assert_eq!(back.collection, "users");
    assert_eq!(back.filter, Some(json!({"age": {"gt": 25}})));

    // Sort key order survives the round trip.
    let sort = back.options.unwrap().sort.unwrap();
    let keys: Vec<&String> = sort.as_object().unwrap().keys().collect();
    assert_eq!(keys, ["name", "age"]);
  }

  #[test]
  fn count_and_replace_root_stage_shapes() {
    assert_eq!(stage::count("n"), json!({"count": "n"}));
    assert_eq!(
      stage::replace_root("orders"),
      json!({"replaceRoot": {"newRoot": "$orders"}})
    );
  }

  #[test]
  fn last_insert_id_wire_name() {
    let mut cmd = Command::insert("users", vec![json!({"name": "a"})]);
    cmd.last_insert_id = Some(7);
    let text = cmd.to_json().unwrap();
    assert!(text.contains("\"lastInsertId\":7"));
  }
}
