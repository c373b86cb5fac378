mod ast;
mod parser;
mod token;

pub use ast::{
  ConditionExpr, DeleteStatement, InsertStatement, JoinClause, JoinKind, OrderByItem, SelectField,
  SelectStatement, SqlCompareOp, SqlValue, Statement, TableRef, UpdateStatement,
};
pub use parser::parse;
pub use token::{tokenize, Keyword, Spanned, Token};
