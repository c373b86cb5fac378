use crate::error::{Error, Result};

use super::ast::{
  ConditionExpr, DeleteStatement, InsertStatement, JoinClause, JoinKind, OrderByItem, SelectField,
  SelectStatement, SqlCompareOp, SqlValue, Statement, TableRef, UpdateStatement,
};
use super::token::{tokenize, Keyword, Spanned, Token};

/// Parse one SQL statement.
pub fn parse(input: &str) -> Result<Statement> {
  let tokens = tokenize(input)?;
  let mut parser = Parser { tokens, pos: 0 };
  let statement = parser.parse_statement()?;
  parser.consume_if(&Token::Semicolon);
  if let Some(extra) = parser.peek() {
    return Err(parser.error_at(extra.clone(), "unexpected trailing input"));
  }
  Ok(statement)
}

struct Parser {
  tokens: Vec<Spanned>,
  pos: usize,
}

impl Parser {
  fn parse_statement(&mut self) -> Result<Statement> {
    match self.peek().map(|s| s.token.clone()) {
      Some(Token::Keyword(Keyword::Select)) => Ok(Statement::Select(self.parse_select()?)),
      Some(Token::Keyword(Keyword::Insert)) => Ok(Statement::Insert(self.parse_insert()?)),
      Some(Token::Keyword(Keyword::Update)) => Ok(Statement::Update(self.parse_update()?)),
      Some(Token::Keyword(Keyword::Delete)) => Ok(Statement::Delete(self.parse_delete()?)),
      Some(other) => {
        let spanned = self.peek().cloned().unwrap();
        Err(self.error_at(spanned, &format!("expected a statement, found {other:?}")))
      }
      None => Err(Error::syntax("empty statement")),
    }
  }

  fn parse_select(&mut self) -> Result<SelectStatement> {
    self.expect_keyword(Keyword::Select)?;
    let distinct = self.consume_keyword(Keyword::Distinct);

    let mut fields = Vec::new();
    loop {
      fields.push(self.parse_select_field()?);
      if !self.consume_if(&Token::Comma) {
        break;
      }
    }

    self.expect_keyword(Keyword::From)?;
    let from = self.parse_table_ref()?;

    let mut joins = Vec::new();
    while let Some(kind) = self.parse_join_kind()? {
      let table = self.parse_table_ref()?;
      self.expect_keyword(Keyword::On)?;
      let left = self.parse_qualified_name()?;
      self.expect(&Token::Eq)?;
      let right = self.parse_qualified_name()?;
      joins.push(JoinClause { kind, table, left, right });
    }

    let where_clause = if self.consume_keyword(Keyword::Where) {
      Some(self.parse_or()?)
    } else {
      None
    };

    let mut group_by = Vec::new();
    if self.consume_keyword(Keyword::Group) {
      self.expect_keyword(Keyword::By)?;
      loop {
        group_by.push(self.parse_qualified_name()?);
        if !self.consume_if(&Token::Comma) {
          break;
        }
      }
    }

    let having = if self.consume_keyword(Keyword::Having) {
      Some(self.parse_or()?)
    } else {
      None
    };

    let mut order_by = Vec::new();
    if self.consume_keyword(Keyword::Order) {
      self.expect_keyword(Keyword::By)?;
      loop {
        let field = self.parse_field_expr()?;
        let descending = match self.peek_ident_upper().as_deref() {
          Some("DESC") => {
            self.advance();
            true
          }
          Some("ASC") => {
            self.advance();
            false
          }
          _ => false,
        };
        order_by.push(OrderByItem { field, descending });
        if !self.consume_if(&Token::Comma) {
          break;
        }
      }
    }

    let limit = if self.consume_keyword(Keyword::Limit) {
      Some(self.parse_integer()?)
    } else {
      None
    };
    let offset = if self.consume_keyword(Keyword::Offset) {
      Some(self.parse_integer()?)
    } else {
      None
    };

    Ok(SelectStatement {
      fields,
      distinct,
      from,
      joins,
      where_clause,
      group_by,
      having,
      order_by,
      limit,
      offset,
    })
  }

  fn parse_insert(&mut self) -> Result<InsertStatement> {
    self.expect_keyword(Keyword::Insert)?;
    self.expect_keyword(Keyword::Into)?;
    let table = self.parse_ident()?;

    self.expect(&Token::LParen)?;
    let mut columns = Vec::new();
    loop {
      columns.push(self.parse_ident()?);
      if !self.consume_if(&Token::Comma) {
        break;
      }
    }
    self.expect(&Token::RParen)?;

    self.expect_keyword(Keyword::Values)?;
    let mut rows = Vec::new();
    loop {
      self.expect(&Token::LParen)?;
      let mut row = Vec::new();
      loop {
        row.push(self.parse_value()?);
        if !self.consume_if(&Token::Comma) {
          break;
        }
      }
      self.expect(&Token::RParen)?;
      if row.len() != columns.len() {
        return Err(Error::syntax(format!(
          "insert row has {} values for {} columns",
          row.len(),
          columns.len()
        )));
      }
      rows.push(row);
      if !self.consume_if(&Token::Comma) {
        break;
      }
    }

    Ok(InsertStatement { table, columns, rows })
  }

  fn parse_update(&mut self) -> Result<UpdateStatement> {
    self.expect_keyword(Keyword::Update)?;
    let table = self.parse_ident()?;
    self.expect_keyword(Keyword::Set)?;

    let mut assignments = Vec::new();
    loop {
      let column = self.parse_qualified_name()?;
      self.expect(&Token::Eq)?;
      let value = self.parse_value()?;
      assignments.push((column, value));
      if !self.consume_if(&Token::Comma) {
        break;
      }
    }

    let where_clause = if self.consume_keyword(Keyword::Where) {
      Some(self.parse_or()?)
    } else {
      None
    };

    Ok(UpdateStatement { table, assignments, where_clause })
  }

  fn parse_delete(&mut self) -> Result<DeleteStatement> {
    self.expect_keyword(Keyword::Delete)?;
    self.expect_keyword(Keyword::From)?;
    let table = self.parse_ident()?;
    let where_clause = if self.consume_keyword(Keyword::Where) {
      Some(self.parse_or()?)
    } else {
      None
    };
    Ok(DeleteStatement { table, where_clause })
  }

  // Boolean expressions, loosest binding first: OR < AND < NOT.

  fn parse_or(&mut self) -> Result<ConditionExpr> {
    let mut left = self.parse_and()?;
    while self.consume_keyword(Keyword::Or) {
      let right = self.parse_and()?;
      left = ConditionExpr::Or(Box::new(left), Box::new(right));
    }
    Ok(left)
  }

  fn parse_and(&mut self) -> Result<ConditionExpr> {
    let mut left = self.parse_not()?;
    while self.consume_keyword(Keyword::And) {
      let right = self.parse_not()?;
      left = ConditionExpr::And(Box::new(left), Box::new(right));
    }
    Ok(left)
  }

  fn parse_not(&mut self) -> Result<ConditionExpr> {
    if self.consume_keyword(Keyword::Not) {
      let inner = self.parse_not()?;
      return Ok(ConditionExpr::Not(Box::new(inner)));
    }
    self.parse_predicate()
  }

  fn parse_predicate(&mut self) -> Result<ConditionExpr> {
    if self.consume_if(&Token::LParen) {
      let inner = self.parse_or()?;
      self.expect(&Token::RParen)?;
      return Ok(inner);
    }

    let field = self.parse_field_expr()?;

    if self.consume_keyword(Keyword::Is) {
      let negated = self.consume_keyword(Keyword::Not);
      self.expect_keyword(Keyword::Null)?;
      return Ok(ConditionExpr::IsNull { field, negated });
    }

    let negated = self.consume_keyword(Keyword::Not);

    if self.consume_keyword(Keyword::Like) {
      let pattern = self.parse_value()?;
      return Ok(ConditionExpr::Like { field, pattern, negated });
    }

    if self.consume_keyword(Keyword::Between) {
      let low = self.parse_value()?;
      self.expect_keyword(Keyword::And)?;
      let high = self.parse_value()?;
      return Ok(ConditionExpr::Between { field, low, high, negated });
    }

    if self.consume_keyword(Keyword::In) {
      self.expect(&Token::LParen)?;
      if matches!(self.peek().map(|s| &s.token), Some(Token::Keyword(Keyword::Select))) {
        let subquery = self.parse_select()?;
        self.expect(&Token::RParen)?;
        return Ok(ConditionExpr::InSubquery {
          field,
          subquery: Box::new(subquery),
          negated,
        });
      }
      let mut values = Vec::new();
      loop {
        values.push(self.parse_value()?);
        if !self.consume_if(&Token::Comma) {
          break;
        }
      }
      self.expect(&Token::RParen)?;
      return Ok(ConditionExpr::InList { field, values, negated });
    }

    if negated {
      let spanned = self.current_or_end();
      return Err(self.error_at(spanned, "expected LIKE, BETWEEN or IN after NOT"));
    }

    let op = self.parse_compare_op()?;
    let right = self.parse_value()?;
    Ok(ConditionExpr::Compare { left: field, op, right })
  }

  fn parse_compare_op(&mut self) -> Result<SqlCompareOp> {
    let spanned = self.current_or_end();
    let op = match self.peek().map(|s| &s.token) {
      Some(Token::Eq) => SqlCompareOp::Eq,
      Some(Token::Neq) => SqlCompareOp::Ne,
      Some(Token::Lt) => SqlCompareOp::Lt,
      Some(Token::Lte) => SqlCompareOp::Lte,
      Some(Token::Gt) => SqlCompareOp::Gt,
      Some(Token::Gte) => SqlCompareOp::Gte,
      _ => return Err(self.error_at(spanned, "expected a comparison operator")),
    };
    self.advance();
    Ok(op)
  }

  fn parse_value(&mut self) -> Result<SqlValue> {
    let spanned = self.current_or_end();
    let value = match self.peek().map(|s| s.token.clone()) {
      Some(Token::Number(text)) => {
        self.advance();
        parse_number(&text)?
      }
      Some(Token::Minus) => {
        self.advance();
        let spanned = self.current_or_end();
        match self.peek().map(|s| s.token.clone()) {
          Some(Token::Number(text)) => {
            self.advance();
            match parse_number(&text)? {
              SqlValue::Int(n) => SqlValue::Int(-n),
              SqlValue::Float(f) => SqlValue::Float(-f),
              other => other,
            }
          }
          _ => return Err(self.error_at(spanned, "expected a number after '-'")),
        }
      }
      Some(Token::Str(text)) => {
        self.advance();
        SqlValue::Str(text)
      }
      Some(Token::Keyword(Keyword::True)) => {
        self.advance();
        SqlValue::Bool(true)
      }
      Some(Token::Keyword(Keyword::False)) => {
        self.advance();
        SqlValue::Bool(false)
      }
      Some(Token::Keyword(Keyword::Null)) => {
        self.advance();
        SqlValue::Null
      }
      Some(Token::Placeholder) => {
        self.advance();
        SqlValue::Placeholder
      }
      _ => return Err(self.error_at(spanned, "expected a literal value")),
    };
    Ok(value)
  }

  fn parse_integer(&mut self) -> Result<i64> {
    let spanned = self.current_or_end();
    match self.parse_value()? {
      SqlValue::Int(n) => Ok(n),
      _ => Err(self.error_at(spanned, "expected an integer")),
    }
  }

  /// `*`, a (qualified) column, or a function call captured verbatim.
  fn parse_field_expr(&mut self) -> Result<String> {
    if self.consume_if(&Token::Star) {
      return Ok("*".to_string());
    }
    let name = self.parse_ident()?;
    if self.consume_if(&Token::LParen) {
      return self.capture_call(&name);
    }
    self.finish_qualified(name)
  }

  /// Reconstruct `name(args)` textually, balancing parentheses.
  fn capture_call(&mut self, name: &str) -> Result<String> {
    let mut text = format!("{name}(");
    let mut depth = 1usize;
    while depth > 0 {
      let spanned = self.current_or_end();
      let Some(token) = self.peek().map(|s| s.token.clone()) else {
        return Err(self.error_at(spanned, "unterminated function call"));
      };
      self.advance();
      match token {
        Token::LParen => {
          depth += 1;
          text.push('(');
        }
        Token::RParen => {
          depth -= 1;
          if depth > 0 {
            text.push(')');
          }
        }
        Token::Star => text.push('*'),
        Token::Dot => text.push('.'),
        Token::Comma => text.push_str(", "),
        Token::Ident(word) => text.push_str(&word),
        Token::Number(n) => text.push_str(&n),
        Token::Keyword(Keyword::Distinct) => text.push_str("DISTINCT "),
        other => {
          return Err(self.error_at(
            self.current_or_end(),
            &format!("unexpected token in function call: {other:?}"),
          ))
        }
      }
    }
    text.push(')');
    Ok(text)
  }

  fn parse_qualified_name(&mut self) -> Result<String> {
    let name = self.parse_ident()?;
    self.finish_qualified(name)
  }

  fn finish_qualified(&mut self, mut name: String) -> Result<String> {
    while self.consume_if(&Token::Dot) {
      name.push('.');
      if self.consume_if(&Token::Star) {
        name.push('*');
        break;
      }
      name.push_str(&self.parse_ident()?);
    }
    Ok(name)
  }

  fn parse_table_ref(&mut self) -> Result<TableRef> {
    let name = self.parse_ident()?;
    let alias = if self.consume_keyword(Keyword::As) {
      Some(self.parse_ident()?)
    } else if matches!(self.peek().map(|s| &s.token), Some(Token::Ident(_))) {
      Some(self.parse_ident()?)
    } else {
      None
    };
    Ok(TableRef { name, alias })
  }

  fn parse_join_kind(&mut self) -> Result<Option<JoinKind>> {
    let kind = match self.peek().map(|s| &s.token) {
      Some(Token::Keyword(Keyword::Join)) => {
        self.advance();
        JoinKind::Inner
      }
      Some(Token::Keyword(Keyword::Inner)) => {
        self.advance();
        self.expect_keyword(Keyword::Join)?;
        JoinKind::Inner
      }
      Some(Token::Keyword(Keyword::Left)) => {
        self.advance();
        self.consume_keyword(Keyword::Outer);
        self.expect_keyword(Keyword::Join)?;
        JoinKind::Left
      }
      Some(Token::Keyword(Keyword::Right)) => {
        self.advance();
        self.consume_keyword(Keyword::Outer);
        self.expect_keyword(Keyword::Join)?;
        JoinKind::Right
      }
      _ => return Ok(None),
    };
    Ok(Some(kind))
  }

  fn parse_select_field(&mut self) -> Result<SelectField> {
    let expr = self.parse_field_expr()?;
    let alias = if self.consume_keyword(Keyword::As) {
      Some(self.parse_ident()?)
    } else if matches!(self.peek().map(|s| &s.token), Some(Token::Ident(_)))
      && self.peek_ident_upper().as_deref() != Some("ASC")
      && self.peek_ident_upper().as_deref() != Some("DESC")
    {
      Some(self.parse_ident()?)
    } else {
      None
    };
    Ok(SelectField { expr, alias })
  }

  fn parse_ident(&mut self) -> Result<String> {
    let spanned = self.current_or_end();
    match self.peek().map(|s| s.token.clone()) {
      Some(Token::Ident(word)) => {
        self.advance();
        Ok(word)
      }
      _ => Err(self.error_at(spanned, "expected an identifier")),
    }
  }

  // Token-stream plumbing.

  fn peek(&self) -> Option<&Spanned> {
    self.tokens.get(self.pos)
  }

  fn peek_ident_upper(&self) -> Option<String> {
    match self.peek().map(|s| &s.token) {
      Some(Token::Ident(word)) => Some(word.to_ascii_uppercase()),
      _ => None,
    }
  }

  fn advance(&mut self) {
    self.pos += 1;
  }

  fn consume_if(&mut self, token: &Token) -> bool {
    if self.peek().map(|s| &s.token) == Some(token) {
      self.advance();
      true
    } else {
      false
    }
  }

  fn consume_keyword(&mut self, keyword: Keyword) -> bool {
    self.consume_if(&Token::Keyword(keyword))
  }

  fn expect(&mut self, token: &Token) -> Result<()> {
    if self.consume_if(token) {
      Ok(())
    } else {
      let spanned = self.current_or_end();
      Err(self.error_at(spanned, &format!("expected {token:?}")))
    }
  }

  fn expect_keyword(&mut self, keyword: Keyword) -> Result<()> {
    if self.consume_keyword(keyword) {
      Ok(())
    } else {
      let spanned = self.current_or_end();
      Err(self.error_at(spanned, &format!("expected {keyword:?}")))
    }
  }

  /// Position holder for errors at or past the end of input.
  fn current_or_end(&self) -> Spanned {
    self.peek().cloned().unwrap_or_else(|| {
      let (line, column) = self
        .tokens
        .last()
        .map(|s| (s.line, s.column + 1))
        .unwrap_or((1, 1));
      Spanned { token: Token::Semicolon, line, column }
    })
  }

  fn error_at(&self, spanned: Spanned, message: &str) -> Error {
    Error::syntax(format!(
      "{message} at line {}, column {}",
      spanned.line, spanned.column
    ))
  }
}

fn parse_number(text: &str) -> Result<SqlValue> {
  if text.contains('.') {
    text
      .parse::<f64>()
      .map(SqlValue::Float)
      .map_err(|_| Error::syntax(format!("invalid number: {text}")))
  } else {
    text
      .parse::<i64>()
      .map(SqlValue::Int)
      .map_err(|_| Error::syntax(format!("invalid number: {text}")))
  }
}
