//! Setting functions: lazily evaluated expressions over other settings.
//!
//! A setting function is parsed once from its source text and evaluated
//! against a stack whenever the computed value is needed. The referenced
//! identifiers are recorded as the function's "used keys"; note that some
//! of them may be enum-option names rather than real setting keys, so
//! callers that care must filter against the stack's known keys.

use serde_json::Value;
use std::fmt;

/// Resolves setting keys to current values during evaluation.
pub trait SettingLookup {
    /// The evaluated value of a setting, or `None` if unknown.
    fn setting_value(&self, key: &str) -> Option<Value>;
}

/// Errors from parsing or evaluating a setting function.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FunctionError {
    #[error("expression parse error: {0}")]
    Parse(String),

    #[error("unknown setting '{0}' in expression")]
    UnknownKey(String),

    #[error("type error: {0}")]
    Type(String),
}

/// A parsed, lazily evaluated setting expression.
#[derive(Clone)]
pub struct SettingFunction {
    source: String,
    expr: Expr,
    used_keys: Vec<String>,
}

impl fmt::Debug for SettingFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SettingFunction")
            .field("source", &self.source)
            .finish()
    }
}

impl PartialEq for SettingFunction {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl SettingFunction {
    /// Parse an expression from its source text.
    pub fn parse(source: &str) -> Result<Self, FunctionError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_expression()?;
        if parser.pos != parser.tokens.len() {
            return Err(FunctionError::Parse(format!(
                "trailing input after expression in '{}'",
                source
            )));
        }

        let mut used_keys = Vec::new();
        collect_identifiers(&expr, &mut used_keys);

        Ok(Self {
            source: source.to_string(),
            expr,
            used_keys,
        })
    }

    /// The original expression text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Identifiers referenced by the expression, in first-use order.
    ///
    /// May include enum-option names that are not setting keys.
    pub fn used_keys(&self) -> &[String] {
        &self.used_keys
    }

    /// Evaluate the expression against the given lookup.
    pub fn evaluate(&self, lookup: &dyn SettingLookup) -> Result<Value, FunctionError> {
        eval(&self.expr, lookup).map(Operand::into_value)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Number(f64),
    Str(String),
    Ident(String),
    Neg(Box<Expr>),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Op(BinOp),
    Minus,
    Plus,
    Star,
    Slash,
    LParen,
    RParen,
}

fn tokenize(source: &str) -> Result<Vec<Token>, FunctionError> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '0'..='9' | '.' => {
                let mut text = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        text.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let number = text
                    .parse::<f64>()
                    .map_err(|_| FunctionError::Parse(format!("bad number '{}'", text)))?;
                tokens.push(Token::Number(number));
            }
            'a'..='z' | 'A'..='Z' | '_' => {
                let mut text = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_alphanumeric() || d == '_' {
                        text.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(text));
            }
            '\'' => {
                chars.next();
                let mut text = String::new();
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(d) => text.push(d),
                        None => {
                            return Err(FunctionError::Parse(
                                "unterminated string literal".to_string(),
                            ))
                        }
                    }
                }
                tokens.push(Token::Str(text));
            }
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '-' => {
                chars.next();
                tokens.push(Token::Minus);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '/' => {
                chars.next();
                tokens.push(Token::Slash);
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '=' | '!' | '<' | '>' => {
                chars.next();
                let op = match (c, chars.peek().copied()) {
                    ('=', Some('=')) => {
                        chars.next();
                        BinOp::Eq
                    }
                    ('!', Some('=')) => {
                        chars.next();
                        BinOp::Ne
                    }
                    ('<', Some('=')) => {
                        chars.next();
                        BinOp::Le
                    }
                    ('>', Some('=')) => {
                        chars.next();
                        BinOp::Ge
                    }
                    ('<', _) => BinOp::Lt,
                    ('>', _) => BinOp::Gt,
                    _ => {
                        return Err(FunctionError::Parse(format!(
                            "unexpected character '{}'",
                            c
                        )))
                    }
                };
                tokens.push(Token::Op(op));
            }
            other => {
                return Err(FunctionError::Parse(format!(
                    "unexpected character '{}'",
                    other
                )))
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    // expression := additive (cmp-op additive)?
    fn parse_expression(&mut self) -> Result<Expr, FunctionError> {
        let lhs = self.parse_additive()?;
        if let Some(Token::Op(op)) = self.peek().cloned() {
            self.next();
            let rhs = self.parse_additive()?;
            return Ok(Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            });
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> Result<Expr, FunctionError> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.next();
            let rhs = self.parse_multiplicative()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, FunctionError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                _ => break,
            };
            self.next();
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, FunctionError> {
        if matches!(self.peek(), Some(Token::Minus)) {
            self.next();
            let inner = self.parse_unary()?;
            return Ok(Expr::Neg(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, FunctionError> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Str(s)) => Ok(Expr::Str(s)),
            Some(Token::Ident(name)) => Ok(Expr::Ident(name)),
            Some(Token::LParen) => {
                let inner = self.parse_expression()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(FunctionError::Parse("expected ')'".to_string())),
                }
            }
            other => Err(FunctionError::Parse(format!(
                "unexpected token {:?}",
                other
            ))),
        }
    }
}

fn collect_identifiers(expr: &Expr, out: &mut Vec<String>) {
    match expr {
        Expr::Ident(name) => {
            if !out.iter().any(|existing| existing == name) {
                out.push(name.clone());
            }
        }
        Expr::Neg(inner) => collect_identifiers(inner, out),
        Expr::Binary { lhs, rhs, .. } => {
            collect_identifiers(lhs, out);
            collect_identifiers(rhs, out);
        }
        Expr::Number(_) | Expr::Str(_) => {}
    }
}

/// Intermediate evaluation operand.
#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Number(f64),
    Bool(bool),
    Str(String),
}

impl Operand {
    fn from_value(value: Value, key: &str) -> Result<Self, FunctionError> {
        match value {
            Value::Number(n) => n
                .as_f64()
                .map(Operand::Number)
                .ok_or_else(|| FunctionError::Type(format!("non-finite number for '{}'", key))),
            Value::Bool(b) => Ok(Operand::Bool(b)),
            Value::String(s) => Ok(Operand::Str(s)),
            other => Err(FunctionError::Type(format!(
                "setting '{}' has non-scalar value {}",
                key, other
            ))),
        }
    }

    fn into_value(self) -> Value {
        match self {
            Operand::Number(n) => {
                // Emit integral results as integers so stringification
                // matches what the engine expects ("2", not "2.0").
                if n.fract() == 0.0 && n.abs() < 9.0e15 {
                    Value::from(n as i64)
                } else {
                    serde_json::Number::from_f64(n)
                        .map(Value::Number)
                        .unwrap_or(Value::Null)
                }
            }
            Operand::Bool(b) => Value::Bool(b),
            Operand::Str(s) => Value::String(s),
        }
    }

    fn as_number(&self) -> Result<f64, FunctionError> {
        match self {
            Operand::Number(n) => Ok(*n),
            other => Err(FunctionError::Type(format!(
                "expected a number, got {:?}",
                other
            ))),
        }
    }
}

fn eval(expr: &Expr, lookup: &dyn SettingLookup) -> Result<Operand, FunctionError> {
    match expr {
        Expr::Number(n) => Ok(Operand::Number(*n)),
        Expr::Str(s) => Ok(Operand::Str(s.clone())),
        Expr::Ident(name) => {
            let value = lookup
                .setting_value(name)
                .ok_or_else(|| FunctionError::UnknownKey(name.clone()))?;
            Operand::from_value(value, name)
        }
        Expr::Neg(inner) => Ok(Operand::Number(-eval(inner, lookup)?.as_number()?)),
        Expr::Binary { op, lhs, rhs } => {
            let left = eval(lhs, lookup)?;
            let right = eval(rhs, lookup)?;
            match op {
                BinOp::Add => Ok(Operand::Number(left.as_number()? + right.as_number()?)),
                BinOp::Sub => Ok(Operand::Number(left.as_number()? - right.as_number()?)),
                BinOp::Mul => Ok(Operand::Number(left.as_number()? * right.as_number()?)),
                BinOp::Div => {
                    let divisor = right.as_number()?;
                    if divisor == 0.0 {
                        return Err(FunctionError::Type("division by zero".to_string()));
                    }
                    Ok(Operand::Number(left.as_number()? / divisor))
                }
                BinOp::Eq => Ok(Operand::Bool(left == right)),
                BinOp::Ne => Ok(Operand::Bool(left != right)),
                BinOp::Lt => Ok(Operand::Bool(left.as_number()? < right.as_number()?)),
                BinOp::Le => Ok(Operand::Bool(left.as_number()? <= right.as_number()?)),
                BinOp::Gt => Ok(Operand::Bool(left.as_number()? > right.as_number()?)),
                BinOp::Ge => Ok(Operand::Bool(left.as_number()? >= right.as_number()?)),
            }
        }
    }
}
