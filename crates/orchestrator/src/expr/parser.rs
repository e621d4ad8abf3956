//! Recursive-descent parser and evaluator for the expression grammar:
//! ternary > logical-or > logical-and > equality > comparison > unary-not >
//! primary (path | literal | call | parenthesized).

use serde_json::Value;

use super::lexer::Token;

#[derive(Debug, Clone)]
pub enum PathSegment {
    Field(String),
    Index(usize),
    Wildcard,
}

#[derive(Debug, Clone, Copy)]
pub enum BinOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone)]
pub enum Expr {
    Path(Vec<PathSegment>),
    Literal(Value),
    Not(Box<Expr>),
    BinOp(BinOp, Box<Expr>, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

enum PathState {
    Single(Value),
    Multi(Vec<Value>),
}

impl PathState {
    fn finish(self) -> Value {
        match self {
            Self::Single(v) => v,
            Self::Multi(vs) => Value::Array(vs),
        }
    }

    fn field(self, name: &str) -> Self {
        match self {
            Self::Single(v) => Self::Single(get_field(&v, name)),
            Self::Multi(vs) => Self::Multi(vs.iter().map(|v| get_field(v, name)).collect()),
        }
    }

    fn index(self, idx: usize) -> Self {
        match self {
            Self::Single(v) => Self::Single(get_index(&v, idx)),
            Self::Multi(vs) => Self::Multi(vs.iter().map(|v| get_index(v, idx)).collect()),
        }
    }

    fn wildcard(self) -> Self {
        match self {
            Self::Single(v) => Self::Multi(v.as_array().cloned().unwrap_or_default()),
            Self::Multi(vs) => Self::Multi(
                vs.iter()
                    .flat_map(|v| v.as_array().cloned().unwrap_or_default())
                    .collect(),
            ),
        }
    }
}

fn get_field(v: &Value, name: &str) -> Value {
    v.get(name).cloned().unwrap_or(Value::Null)
}

fn get_index(v: &Value, idx: usize) -> Value {
    v.as_array().and_then(|a| a.get(idx)).cloned().unwrap_or(Value::Null)
}

impl Expr {
    pub fn eval(&self, context: &Value) -> Value {
        match self {
            Self::Path(segments) => {
                let mut state = PathState::Single(context.clone());
                for segment in segments {
                    state = match segment {
                        PathSegment::Field(name) => state.field(name),
                        PathSegment::Index(idx) => state.index(*idx),
                        PathSegment::Wildcard => state.wildcard(),
                    };
                }
                state.finish()
            }
            Self::Literal(v) => v.clone(),
            Self::Not(inner) => Value::Bool(!truthy(&inner.eval(context))),
            Self::BinOp(op, lhs, rhs) => eval_binop(*op, &lhs.eval(context), rhs, context),
            Self::Ternary(cond, then_branch, else_branch) => {
                if truthy(&cond.eval(context)) {
                    then_branch.eval(context)
                } else {
                    else_branch.eval(context)
                }
            }
            Self::Call(name, args) => eval_call(name, args, context),
        }
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn eval_binop(op: BinOp, lhs: &Value, rhs_expr: &Expr, context: &Value) -> Value {
    if matches!(op, BinOp::And) {
        return Value::Bool(truthy(lhs) && truthy(&rhs_expr.eval(context)));
    }
    if matches!(op, BinOp::Or) {
        return Value::Bool(truthy(lhs) || truthy(&rhs_expr.eval(context)));
    }
    let rhs = rhs_expr.eval(context);
    let result = match op {
        BinOp::Eq => values_equal(lhs, &rhs),
        BinOp::Ne => !values_equal(lhs, &rhs),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => match (lhs.as_f64(), rhs.as_f64()) {
            (Some(a), Some(b)) => compare_numbers(op, a, b),
            _ => false,
        },
        BinOp::And | BinOp::Or => false,
    };
    Value::Bool(result)
}

fn compare_numbers(op: BinOp, a: f64, b: f64) -> bool {
    match op {
        BinOp::Lt => a < b,
        BinOp::Le => a <= b,
        BinOp::Gt => a > b,
        BinOp::Ge => a >= b,
        BinOp::Eq | BinOp::Ne | BinOp::And | BinOp::Or => false,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    a == b
}

fn eval_call(name: &str, args: &[Expr], context: &Value) -> Value {
    match name {
        "hasStage" => {
            let Some(stage_name) = args.first().map(|e| e.eval(context)) else {
                return Value::Bool(false);
            };
            let stage_name = stage_name.as_str().unwrap_or_default();
            let present = context
                .get("stages")
                .and_then(|s| s.get(stage_name))
                .and_then(Value::as_array)
                .is_some_and(|a| !a.is_empty());
            Value::Bool(present)
        }
        "getStage" => {
            let stage_name = args
                .first()
                .map(|e| e.eval(context))
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            let index = args
                .get(1)
                .map(|e| e.eval(context))
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as usize;
            context
                .get("stages")
                .and_then(|s| s.get(&stage_name))
                .and_then(Value::as_array)
                .and_then(|a| a.get(index))
                .cloned()
                .unwrap_or(Value::Null)
        }
        "coalesce" => args
            .iter()
            .map(|e| e.eval(context))
            .find(|v| !v.is_null())
            .unwrap_or(Value::Null),
        "nvl" => {
            let value = args.first().map(|e| e.eval(context)).unwrap_or(Value::Null);
            if value.is_null() {
                args.get(1).map(|e| e.eval(context)).unwrap_or(Value::Null)
            } else {
                value
            }
        }
        _ => Value::Null,
    }
}

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    pub fn parse(mut self) -> Result<Expr, String> {
        let expr = self.parse_ternary()?;
        if self.pos != self.tokens.len() {
            return Err("trailing tokens after expression".to_string());
        }
        Ok(expr)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn expect(&mut self, expected: &Token) -> Result<(), String> {
        match self.advance() {
            Some(t) if &t == expected => Ok(()),
            other => Err(format!("expected {expected:?}, found {other:?}")),
        }
    }

    fn parse_ternary(&mut self) -> Result<Expr, String> {
        let cond = self.parse_or()?;
        if matches!(self.peek(), Some(Token::Question)) {
            self.advance();
            let then_branch = self.parse_ternary()?;
            self.expect(&Token::Colon)?;
            let else_branch = self.parse_ternary()?;
            Ok(Expr::Ternary(
                Box::new(cond),
                Box::new(then_branch),
                Box::new(else_branch),
            ))
        } else {
            Ok(cond)
        }
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_and()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.advance();
            let rhs = self.parse_and()?;
            lhs = Expr::BinOp(BinOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_equality()?;
        while matches!(self.peek(), Some(Token::And)) {
            self.advance();
            let rhs = self.parse_equality()?;
            lhs = Expr::BinOp(BinOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_equality(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_comparison()?;
        loop {
            let op = match self.peek() {
                Some(Token::Eq) => BinOp::Eq,
                Some(Token::Ne) => BinOp::Ne,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_comparison()?;
            lhs = Expr::BinOp(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_comparison(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => BinOp::Lt,
                Some(Token::Le) => BinOp::Le,
                Some(Token::Gt) => BinOp::Gt,
                Some(Token::Ge) => BinOp::Ge,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_unary()?;
            lhs = Expr::BinOp(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        if matches!(self.peek(), Some(Token::Not)) {
            self.advance();
            let inner = self.parse_unary()?;
            Ok(Expr::Not(Box::new(inner)))
        } else {
            self.parse_primary()
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.advance() {
            Some(Token::Dollar) => self.parse_path(),
            Some(Token::Number(n)) => Ok(Expr::Literal(
                serde_json::Number::from_f64(n)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
            )),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Token::LParen) => {
                let expr = self.parse_ternary()?;
                self.expect(&Token::RParen)?;
                Ok(expr)
            }
            Some(Token::Ident(name)) => {
                if matches!(self.peek(), Some(Token::LParen)) {
                    self.advance();
                    let mut args = Vec::new();
                    if !matches!(self.peek(), Some(Token::RParen)) {
                        loop {
                            args.push(self.parse_ternary()?);
                            if matches!(self.peek(), Some(Token::Comma)) {
                                self.advance();
                            } else {
                                break;
                            }
                        }
                    }
                    self.expect(&Token::RParen)?;
                    Ok(Expr::Call(name, args))
                } else {
                    Err(format!("unexpected bare identifier '{name}'"))
                }
            }
            other => Err(format!("unexpected token {other:?}")),
        }
    }

    fn parse_path(&mut self) -> Result<Expr, String> {
        let mut segments = Vec::new();
        while matches!(self.peek(), Some(Token::Dot)) {
            self.advance();
            match self.advance() {
                Some(Token::Ident(name)) => segments.push(PathSegment::Field(name)),
                other => return Err(format!("expected path segment, found {other:?}")),
            }
            while matches!(self.peek(), Some(Token::LBracket)) {
                self.advance();
                match self.advance() {
                    Some(Token::Number(n)) => segments.push(PathSegment::Index(n as usize)),
                    Some(Token::Star) => segments.push(PathSegment::Wildcard),
                    other => return Err(format!("expected index or '*', found {other:?}")),
                }
                self.expect(&Token::RBracket)?;
            }
        }
        if segments.is_empty() {
            return Err("empty path after '$'".to_string());
        }
        Ok(Expr::Path(segments))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::lexer::Lexer;
    use serde_json::json;

    fn parse(src: &str) -> Expr {
        let tokens = Lexer::new(src).tokenize().expect("tokenize");
        Parser::new(tokens).parse().expect("parse")
    }

    #[test]
    fn parses_and_evaluates_comparison() {
        let expr = parse("$.trigger.value == 3");
        let ctx = json!({"trigger": {"value": 3}});
        assert_eq!(expr.eval(&ctx), Value::Bool(true));
    }

    #[test]
    fn ternary_short_circuits_branch_evaluation_by_condition() {
        let expr = parse(r#"$.trigger.flag ? "yes" : "no""#);
        assert_eq!(
            expr.eval(&json!({"trigger": {"flag": true}})),
            json!("yes")
        );
        assert_eq!(
            expr.eval(&json!({"trigger": {"flag": false}})),
            json!("no")
        );
    }

    #[test]
    fn rejects_trailing_garbage() {
        let tokens = Lexer::new("$.a.b extra").tokenize().expect("tokenize");
        assert!(Parser::new(tokens).parse().is_err());
    }
}
