use serde_json::{json, Value};

use crate::error::{Error, Result};

/// Column-name resolution capability handed to a condition at emit
/// time, keeping condition values decoupled from any database handle.
pub trait FieldResolver {
  fn resolve_column(&self, model: &str, field: &str) -> Result<String>;
}

/// Resolver that passes field names through untouched.
pub struct IdentityResolver;

impl FieldResolver for IdentityResolver {
  fn resolve_column(&self, _model: &str, field: &str) -> Result<String> {
    Ok(field.to_string())
  }
}

/// Leaf comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
  Eq,
  Ne,
  Gt,
  Gte,
  Lt,
  Lte,
  In,
  Nin,
  Like,
  Contains,
  StartsWith,
  EndsWith,
  Between,
  IsNull,
  IsNotNull,
}

/// Polymorphic condition tree. Values are immutable once built; column
/// names resolve through a [`FieldResolver`] when the filter is emitted.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
  Leaf {
    model: String,
    field: String,
    op: CompareOp,
    value: Value,
  },
  And(Box<Condition>, Box<Condition>),
  Or(Box<Condition>, Box<Condition>),
  Not(Box<Condition>),
}

impl Condition {
  pub fn leaf(model: impl Into<String>, field: impl Into<String>, op: CompareOp, value: Value) -> Self {
    Self::Leaf {
      model: model.into(),
      field: field.into(),
      op,
      value,
    }
  }

  pub fn eq(model: impl Into<String>, field: impl Into<String>, value: Value) -> Self {
    Self::leaf(model, field, CompareOp::Eq, value)
  }

  pub fn ne(model: impl Into<String>, field: impl Into<String>, value: Value) -> Self {
    Self::leaf(model, field, CompareOp::Ne, value)
  }

  pub fn gt(model: impl Into<String>, field: impl Into<String>, value: Value) -> Self {
    Self::leaf(model, field, CompareOp::Gt, value)
  }

  pub fn gte(model: impl Into<String>, field: impl Into<String>, value: Value) -> Self {
    Self::leaf(model, field, CompareOp::Gte, value)
  }

  pub fn lt(model: impl Into<String>, field: impl Into<String>, value: Value) -> Self {
    Self::leaf(model, field, CompareOp::Lt, value)
  }

  pub fn lte(model: impl Into<String>, field: impl Into<String>, value: Value) -> Self {
    Self::leaf(model, field, CompareOp::Lte, value)
  }

  pub fn is_in(model: impl Into<String>, field: impl Into<String>, values: Value) -> Self {
    Self::leaf(model, field, CompareOp::In, values)
  }

  pub fn not_in(model: impl Into<String>, field: impl Into<String>, values: Value) -> Self {
    Self::leaf(model, field, CompareOp::Nin, values)
  }

  pub fn like(model: impl Into<String>, field: impl Into<String>, pattern: impl Into<String>) -> Self {
    Self::leaf(model, field, CompareOp::Like, Value::String(pattern.into()))
  }

  pub fn contains(model: impl Into<String>, field: impl Into<String>, text: impl Into<String>) -> Self {
    Self::leaf(model, field, CompareOp::Contains, Value::String(text.into()))
  }

  pub fn starts_with(model: impl Into<String>, field: impl Into<String>, text: impl Into<String>) -> Self {
    Self::leaf(model, field, CompareOp::StartsWith, Value::String(text.into()))
  }

  pub fn ends_with(model: impl Into<String>, field: impl Into<String>, text: impl Into<String>) -> Self {
    Self::leaf(model, field, CompareOp::EndsWith, Value::String(text.into()))
  }

  pub fn between(model: impl Into<String>, field: impl Into<String>, lo: Value, hi: Value) -> Self {
    Self::leaf(model, field, CompareOp::Between, json!([lo, hi]))
  }

  pub fn is_null(model: impl Into<String>, field: impl Into<String>) -> Self {
    Self::leaf(model, field, CompareOp::IsNull, Value::Null)
  }

  pub fn is_not_null(model: impl Into<String>, field: impl Into<String>) -> Self {
    Self::leaf(model, field, CompareOp::IsNotNull, Value::Null)
  }

  pub fn and(self, other: Condition) -> Self {
    Self::And(Box::new(self), Box::new(other))
  }

  pub fn or(self, other: Condition) -> Self {
    Self::Or(Box::new(self), Box::new(other))
  }

  #[allow(clippy::should_implement_trait)]
  pub fn not(self) -> Self {
    Self::Not(Box::new(self))
  }

  /// Emit the filter fragment for this tree, resolving column names
  /// through `resolver`.
  pub fn to_filter(&self, resolver: &dyn FieldResolver) -> Result<Value> {
    match self {
      Self::Leaf { model, field, op, value } => {
        let column = resolver.resolve_column(model, field)?;
        leaf_filter(&column, *op, value)
      }
      Self::And(lhs, rhs) => Ok(json!({
        "and": [lhs.to_filter(resolver)?, rhs.to_filter(resolver)?]
      })),
      Self::Or(lhs, rhs) => Ok(json!({
        "or": [lhs.to_filter(resolver)?, rhs.to_filter(resolver)?]
      })),
      // The engine has no top-level logical negation; nor over a
      // single branch is the equivalent form.
      Self::Not(inner) => Ok(json!({ "nor": [inner.to_filter(resolver)?] })),
    }
  }
}

fn leaf_filter(column: &str, op: CompareOp, value: &Value) -> Result<Value> {
  let fragment = match op {
    CompareOp::Eq => json!({ column: value }),
    CompareOp::Ne => json!({ column: { "ne": value } }),
    CompareOp::Gt => json!({ column: { "gt": value } }),
    CompareOp::Gte => json!({ column: { "gte": value } }),
    CompareOp::Lt => json!({ column: { "lt": value } }),
    CompareOp::Lte => json!({ column: { "lte": value } }),
    CompareOp::In => json!({ column: { "in": wrap_array(value) } }),
    CompareOp::Nin => json!({ column: { "nin": wrap_array(value) } }),
    CompareOp::Like => {
      let pattern = string_operand(column, value)?;
      json!({ column: { "regex": like_to_regex(pattern), "options": "i" } })
    }
    CompareOp::Contains => {
      let text = string_operand(column, value)?;
      json!({ column: { "regex": escape_regex(text) } })
    }
    CompareOp::StartsWith => {
      let text = string_operand(column, value)?;
      json!({ column: { "regex": format!("^{}", escape_regex(text)) } })
    }
    CompareOp::EndsWith => {
      let text = string_operand(column, value)?;
      json!({ column: { "regex": format!("{}$", escape_regex(text)) } })
    }
    CompareOp::Between => {
      let bounds = value
        .as_array()
        .filter(|a| a.len() == 2)
        .ok_or_else(|| Error::validation(format!("between on {column} requires [lo, hi]")))?;
      json!({ column: { "gte": bounds[0], "lte": bounds[1] } })
    }
    CompareOp::IsNull => json!({ column: Value::Null }),
    CompareOp::IsNotNull => json!({ column: { "ne": Value::Null } }),
  };
  Ok(fragment)
}

fn wrap_array(value: &Value) -> Value {
  match value {
    Value::Array(_) => value.clone(),
    other => json!([other]),
  }
}

fn string_operand<'a>(column: &str, value: &'a Value) -> Result<&'a str> {
  value
    .as_str()
    .ok_or_else(|| Error::validation(format!("pattern operator on {column} requires a string")))
}

/// Translate a SQL LIKE pattern to an anchored regex: every regex
/// metacharacter except the wildcards is escaped, then `%` becomes
/// `.*` and `_` becomes `.`. LIKE matching is case-insensitive.
pub fn like_to_regex(pattern: &str) -> String {
  let mut out = String::with_capacity(pattern.len() + 8);
  out.push('^');
  for c in pattern.chars() {
    match c {
      '%' => out.push_str(".*"),
      '_' => out.push('.'),
      c if is_regex_meta(c) => {
        out.push('\\');
        out.push(c);
      }
      c => out.push(c),
    }
  }
  out.push('$');
  out
}

/// Escape every regex metacharacter in a literal fragment.
pub fn escape_regex(text: &str) -> String {
  regex::escape(text)
}

fn is_regex_meta(c: char) -> bool {
  matches!(
    c,
    '.' | '^' | '$' | '*' | '+' | '?' | '(' | ')' | '[' | ']' | '{' | '}' | '|' | '\\'
  )
}

#[cfg(test)]
mod tests {
  use super::*;

  fn emit(cond: &Condition) -> Value {
    cond.to_filter(&IdentityResolver).unwrap()
  }

  #[test]
  fn eq_null_is_plain_null() {
    let cond = Condition::eq("User", "email", Value::Null);
    assert_eq!(emit(&cond), json!({"email": null}));
  }

  #[test]
  fn comparison_operators() {
    assert_eq!(
      emit(&Condition::gt("User", "age", json!(25))),
      json!({"age": {"gt": 25}})
    );
    assert_eq!(
      emit(&Condition::ne("User", "name", json!("bob"))),
      json!({"name": {"ne": "bob"}})
    );
  }

  #[test]
  fn in_wraps_scalars() {
    assert_eq!(
      emit(&Condition::is_in("User", "role", json!("admin"))),
      json!({"role": {"in": ["admin"]}})
    );
    assert_eq!(
      emit(&Condition::is_in("User", "role", json!(["a", "b"]))),
      json!({"role": {"in": ["a", "b"]}})
    );
  }

  #[test]
  fn like_pattern_translation() {
    assert_eq!(like_to_regex("a%"), "^a.*$");
    assert_eq!(like_to_regex("a_c"), "^a.c$");
    assert_eq!(like_to_regex("100%"), "^100.*$");
    assert_eq!(like_to_regex("a.b"), "^a\\.b$");
    // Any string of length >= 1.
    assert_eq!(like_to_regex("%_"), "^.*.$");
  }

  #[test]
  fn like_is_case_insensitive() {
    let cond = Condition::like("User", "name", "al%");
    assert_eq!(
      emit(&cond),
      json!({"name": {"regex": "^al.*$", "options": "i"}})
    );
  }

  #[test]
  fn contains_escapes_and_stays_case_sensitive() {
    let cond = Condition::contains("User", "name", "a.b");
    assert_eq!(emit(&cond), json!({"name": {"regex": "a\\.b"}}));

    let cond = Condition::starts_with("User", "name", "Al");
    assert_eq!(emit(&cond), json!({"name": {"regex": "^Al"}}));

    let cond = Condition::ends_with("User", "name", "ce");
    assert_eq!(emit(&cond), json!({"name": {"regex": "ce$"}}));
  }

  #[test]
  fn between_emits_range() {
    let cond = Condition::between("User", "age", json!(18), json!(30));
    assert_eq!(emit(&cond), json!({"age": {"gte": 18, "lte": 30}}));
  }

  #[test]
  fn null_checks() {
    assert_eq!(emit(&Condition::is_null("User", "email")), json!({"email": null}));
    assert_eq!(
      emit(&Condition::is_not_null("User", "email")),
      json!({"email": {"ne": null}})
    );
  }

  #[test]
  fn composite_nesting() {
    let cond = Condition::gt("User", "age", json!(18))
      .and(Condition::eq("User", "active", json!(true)));
    assert_eq!(
      emit(&cond),
      json!({"and": [{"age": {"gt": 18}}, {"active": true}]})
    );

    let cond = Condition::eq("User", "a", json!(1)).or(Condition::eq("User", "b", json!(2)));
    assert_eq!(emit(&cond), json!({"or": [{"a": 1}, {"b": 2}]}));
  }

  #[test]
  fn not_becomes_nor() {
    let cond = Condition::eq("User", "active", json!(true)).not();
    assert_eq!(emit(&cond), json!({"nor": [{"active": true}]}));
  }
}
