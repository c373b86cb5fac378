/// Parsed statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
  Select(SelectStatement),
  Insert(InsertStatement),
  Update(UpdateStatement),
  Delete(DeleteStatement),
}

/// A literal or placeholder operand.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
  Int(i64),
  Float(f64),
  Str(String),
  Bool(bool),
  Null,
  /// Positional `?`, substituted at translation time.
  Placeholder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlCompareOp {
  Eq,
  Ne,
  Lt,
  Lte,
  Gt,
  Gte,
}

/// Boolean expression tree for WHERE and HAVING.
///
/// Field operands are raw strings: qualified names stay joined
/// (`u.name`) and function calls stay textual (`COUNT(*)`).
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionExpr {
  Compare {
    left: String,
    op: SqlCompareOp,
    right: SqlValue,
  },
  Between {
    field: String,
    low: SqlValue,
    high: SqlValue,
    negated: bool,
  },
  Like {
    field: String,
    pattern: SqlValue,
    negated: bool,
  },
  InList {
    field: String,
    values: Vec<SqlValue>,
    negated: bool,
  },
  InSubquery {
    field: String,
    subquery: Box<SelectStatement>,
    negated: bool,
  },
  IsNull {
    field: String,
    negated: bool,
  },
  And(Box<ConditionExpr>, Box<ConditionExpr>),
  Or(Box<ConditionExpr>, Box<ConditionExpr>),
  Not(Box<ConditionExpr>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectField {
  /// Raw expression: `*`, a (qualified) column, or a function call.
  pub expr: String,
  pub alias: Option<String>,
}

impl SelectField {
  /// Function-call fields carry their call syntax verbatim.
  pub fn is_function(&self) -> bool {
    self.expr.contains('(')
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableRef {
  pub name: String,
  pub alias: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
  Inner,
  Left,
  Right,
}

/// JOIN restricted to a single equality on qualified columns.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinClause {
  pub kind: JoinKind,
  pub table: TableRef,
  pub left: String,
  pub right: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderByItem {
  pub field: String,
  pub descending: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectStatement {
  pub fields: Vec<SelectField>,
  pub distinct: bool,
  pub from: TableRef,
  pub joins: Vec<JoinClause>,
  pub where_clause: Option<ConditionExpr>,
  pub group_by: Vec<String>,
  pub having: Option<ConditionExpr>,
  pub order_by: Vec<OrderByItem>,
  pub limit: Option<i64>,
  pub offset: Option<i64>,
}

impl SelectStatement {
  /// True when the statement needs an aggregation pipeline rather
  /// than a plain find.
  pub fn needs_pipeline(&self) -> bool {
    !self.joins.is_empty()
      || !self.group_by.is_empty()
      || self.having.is_some()
      || self.distinct
      || self.fields.iter().any(SelectField::is_function)
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertStatement {
  pub table: String,
  pub columns: Vec<String>,
  pub rows: Vec<Vec<SqlValue>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateStatement {
  pub table: String,
  pub assignments: Vec<(String, SqlValue)>,
  pub where_clause: Option<ConditionExpr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteStatement {
  pub table: String,
  pub where_clause: Option<ConditionExpr>,
}
