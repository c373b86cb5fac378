use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Scalar type a schema field can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
  String,
  Int,
  Float,
  Bool,
  DateTime,
  Json,
}

/// One declared field of a model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Field {
  pub name: String,
  /// Explicit storage column; defaults to the field name.
  #[serde(default)]
  pub column: Option<String>,
  pub field_type: FieldType,
  #[serde(default)]
  pub nullable: bool,
  #[serde(default)]
  pub primary_key: bool,
  #[serde(default)]
  pub unique: bool,
  #[serde(default)]
  pub auto_increment: bool,
  #[serde(default)]
  pub index: bool,
  #[serde(default)]
  pub default: Option<serde_json::Value>,
}

impl Field {
  pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
    Self {
      name: name.into(),
      column: None,
      field_type,
      nullable: false,
      primary_key: false,
      unique: false,
      auto_increment: false,
      index: false,
      default: None,
    }
  }

  pub fn column(mut self, column: impl Into<String>) -> Self {
    self.column = Some(column.into());
    self
  }

  pub fn nullable(mut self) -> Self {
    self.nullable = true;
    self
  }

  pub fn primary_key(mut self) -> Self {
    self.primary_key = true;
    self
  }

  pub fn unique(mut self) -> Self {
    self.unique = true;
    self
  }

  pub fn auto_increment(mut self) -> Self {
    self.auto_increment = true;
    self
  }

  pub fn indexed(mut self) -> Self {
    self.index = true;
    self
  }

  pub fn default_value(mut self, value: serde_json::Value) -> Self {
    self.default = Some(value);
    self
  }

  /// Storage column this field maps to, before any `_id` rewriting.
  pub fn column_name(&self) -> &str {
    self.column.as_deref().unwrap_or(&self.name)
  }
}

/// Relation cardinality. ManyToMany is declared but its expansion is a
/// defined schema error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationKind {
  OneToOne,
  OneToMany,
  ManyToOne,
  ManyToMany,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relation {
  pub kind: RelationKind,
  /// Target model name.
  pub target: String,
  /// Field on the owning side of the join.
  pub foreign_key: String,
  /// Field the foreign key points at.
  pub references: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositeIndex {
  pub fields: Vec<String>,
  #[serde(default)]
  pub unique: bool,
}

/// How a model identifies its documents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrimaryKey {
  /// Exactly one declared primary-key field.
  Single(String),
  /// Composite key of two or more fields, stored nested under `_id`.
  Composite(Vec<String>),
  /// Nothing declared; an implicit `id` is assumed.
  Implicit,
}

/// A registered model: fields, relations and key declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
  pub name: String,
  /// Explicit collection name; defaults to pluralized snake_case.
  #[serde(default)]
  pub collection: Option<String>,
  pub fields: Vec<Field>,
  #[serde(default)]
  pub relations: HashMap<String, Relation>,
  #[serde(default)]
  pub composite_indexes: Vec<CompositeIndex>,
}

impl Schema {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      collection: None,
      fields: Vec::new(),
      relations: HashMap::new(),
      composite_indexes: Vec::new(),
    }
  }

  pub fn collection(mut self, name: impl Into<String>) -> Self {
    self.collection = Some(name.into());
    self
  }

  pub fn field(mut self, field: Field) -> Self {
    self.fields.push(field);
    self
  }

  pub fn relation(mut self, name: impl Into<String>, relation: Relation) -> Self {
    self.relations.insert(name.into(), relation);
    self
  }

  pub fn composite_index(mut self, fields: Vec<String>, unique: bool) -> Self {
    self.composite_indexes.push(CompositeIndex { fields, unique });
    self
  }

  pub fn get_field(&self, name: &str) -> Option<&Field> {
    self.fields.iter().find(|f| f.name == name)
  }

  pub fn field_by_column(&self, column: &str) -> Option<&Field> {
    self.fields.iter().find(|f| f.column_name() == column)
  }

  pub fn get_relation(&self, name: &str) -> Option<&Relation> {
    self.relations.get(name)
  }

  /// Physical collection name, with pluralized snake_case fallback.
  pub fn collection_name(&self) -> String {
    match &self.collection {
      Some(c) => c.clone(),
      None => pluralize(&snake_case(&self.name)),
    }
  }

  /// Key declaration per the model contract: one single-field key, a
  /// composite key of two or more fields, or an implicit `id`.
  pub fn primary_key(&self) -> PrimaryKey {
    let declared: Vec<&Field> = self.fields.iter().filter(|f| f.primary_key).collect();
    match declared.len() {
      0 => PrimaryKey::Implicit,
      1 => PrimaryKey::Single(declared[0].name.clone()),
      _ => PrimaryKey::Composite(declared.iter().map(|f| f.name.clone()).collect()),
    }
  }

  /// The single auto-increment primary key, when the model has one.
  pub fn auto_increment_pk(&self) -> Option<&Field> {
    match self.primary_key() {
      PrimaryKey::Single(name) => self.get_field(&name).filter(|f| f.auto_increment),
      _ => None,
    }
  }

  fn validate(&self) -> Result<()> {
    if self.name.is_empty() {
      return Err(Error::schema("model name must not be empty"));
    }
    if self.fields.is_empty() {
      return Err(Error::schema(format!("model {} declares no fields", self.name)));
    }
    for relation in self.relations.values() {
      // The foreign key lives on this model only for the to-one kinds.
      if matches!(relation.kind, RelationKind::ManyToOne | RelationKind::OneToOne)
        && self.get_field(&relation.foreign_key).is_none()
      {
        return Err(Error::schema(format!(
          "model {}: relation foreign key {} is not a declared field",
          self.name, relation.foreign_key
        )));
      }
    }
    Ok(())
  }
}

/// Shared, concurrently-read set of registered models.
#[derive(Default)]
pub struct SchemaRegistry {
  inner: RwLock<HashMap<String, Arc<Schema>>>,
}

impl SchemaRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(&self, schema: Schema) -> Result<()> {
    schema.validate()?;
    let mut guard = self.inner.write();
    guard.insert(schema.name.clone(), Arc::new(schema));
    Ok(())
  }

  pub fn get(&self, model: &str) -> Result<Arc<Schema>> {
    self
      .inner
      .read()
      .get(model)
      .cloned()
      .ok_or_else(|| Error::schema(format!("unknown model: {model}")))
  }

  pub fn try_get(&self, model: &str) -> Option<Arc<Schema>> {
    self.inner.read().get(model).cloned()
  }

  /// Find the model whose physical collection matches `collection`.
  pub fn by_collection(&self, collection: &str) -> Option<Arc<Schema>> {
    self
      .inner
      .read()
      .values()
      .find(|s| s.collection_name() == collection)
      .cloned()
  }

  pub fn all(&self) -> Vec<Arc<Schema>> {
    self.inner.read().values().cloned().collect()
  }

  pub fn is_empty(&self) -> bool {
    self.inner.read().is_empty()
  }
}

/// Convert a model name to snake_case.
pub fn snake_case(name: &str) -> String {
  let mut out = String::with_capacity(name.len() + 4);
  for (i, c) in name.chars().enumerate() {
    if c.is_uppercase() {
      if i > 0 {
        out.push('_');
      }
      out.extend(c.to_lowercase());
    } else {
      out.push(c);
    }
  }
  out
}

/// Naive English pluralization for collection-name fallbacks.
pub fn pluralize(name: &str) -> String {
  if name.ends_with('s')
    || name.ends_with('x')
    || name.ends_with('z')
    || name.ends_with("ch")
    || name.ends_with("sh")
  {
    format!("{name}es")
  } else if let Some(stem) = name.strip_suffix('y') {
    let penultimate = stem.chars().last();
    match penultimate {
      Some(c) if !"aeiou".contains(c) => format!("{stem}ies"),
      _ => format!("{name}s"),
    }
  } else {
    format!("{name}s")
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn snake_case_conversion() {
    assert_eq!(snake_case("UserProfile"), "user_profile");
    assert_eq!(snake_case("User"), "user");
    assert_eq!(snake_case("post"), "post");
  }

  #[test]
  fn pluralize_rules() {
    assert_eq!(pluralize("user"), "users");
    assert_eq!(pluralize("box"), "boxes");
    assert_eq!(pluralize("category"), "categories");
    assert_eq!(pluralize("day"), "days");
    assert_eq!(pluralize("match"), "matches");
  }

  #[test]
  fn collection_name_fallback() {
    let schema = Schema::new("UserProfile").field(Field::new("id", FieldType::Int).primary_key());
    assert_eq!(schema.collection_name(), "user_profiles");

    let schema = schema.collection("profiles");
    assert_eq!(schema.collection_name(), "profiles");
  }

  #[test]
  fn primary_key_classification() {
    let single = Schema::new("User")
      .field(Field::new("id", FieldType::Int).primary_key())
      .field(Field::new("name", FieldType::String));
    assert_eq!(single.primary_key(), PrimaryKey::Single("id".into()));

    let composite = Schema::new("Grade")
      .field(Field::new("student_id", FieldType::Int).primary_key())
      .field(Field::new("course_id", FieldType::Int).primary_key());
    assert_eq!(
      composite.primary_key(),
      PrimaryKey::Composite(vec!["student_id".into(), "course_id".into()])
    );

    let implicit = Schema::new("Log").field(Field::new("message", FieldType::String));
    assert_eq!(implicit.primary_key(), PrimaryKey::Implicit);
  }

  #[test]
  fn registry_lookup() {
    let registry = SchemaRegistry::new();
    registry
      .register(Schema::new("User").field(Field::new("id", FieldType::Int).primary_key()))
      .unwrap();

    assert!(registry.get("User").is_ok());
    assert!(matches!(registry.get("Ghost"), Err(Error::Schema(_))));
    assert!(registry.by_collection("users").is_some());
  }
}
