//! Detect-rule expression engine.
//!
//! Segments are classified by a small boolean expression evaluated against
//! the request's relay and remote addresses, for example:
//!
//! ```text
//! InNetwork(RelayIP, 10.1.0.0, 255.255.0.0) || RemoteIP == 10.200.0.1
//! ```
//!
//! The language covers integer and dotted-quad IPv4 literals (translated to
//! their integer encoding while parsing), the variables `RemoteIP` and
//! `RelayIP`, comparisons, `!`/`&&`/`||`, parentheses, and the helpers
//! `InRange(x, lo, hi)` and `InNetwork(x, net, mask)`. Rules are compiled
//! once at configuration load and evaluated per request.

use std::net::Ipv4Addr;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExprError {
    #[error("parse error at byte {offset}: {message}")]
    Parse { offset: usize, message: String },

    #[error("unknown identifier '{0}'")]
    UnknownIdentifier(String),

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("type mismatch: {0}")]
    TypeMismatch(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bool(bool),
}

impl Value {
    fn as_int(&self) -> Result<i64, ExprError> {
        match self {
            Value::Int(value) => Ok(*value),
            Value::Bool(_) => Err(ExprError::TypeMismatch(
                "expected integer, got boolean".to_string(),
            )),
        }
    }

    fn as_bool(&self) -> Result<bool, ExprError> {
        match self {
            Value::Bool(value) => Ok(*value),
            Value::Int(_) => Err(ExprError::TypeMismatch(
                "expected boolean, got integer".to_string(),
            )),
        }
    }
}

/// Request-side variables available to a rule.
#[derive(Debug, Clone, Copy, Default)]
pub struct Env {
    pub remote_ip: u32,
    pub relay_ip: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Var {
    RemoteIp,
    RelayIp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Int(i64),
    Var(Var),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Cmp(CmpOp, Box<Expr>, Box<Expr>),
    InRange(Box<Expr>, Box<Expr>, Box<Expr>),
    InNetwork(Box<Expr>, Box<Expr>, Box<Expr>),
}

impl Expr {
    pub fn parse(source: &str) -> Result<Self, ExprError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser { tokens, index: 0 };
        let expr = parser.parse_or()?;
        if parser.index != parser.tokens.len() {
            return Err(ExprError::Parse {
                offset: parser.tokens[parser.index].offset,
                message: "trailing input".to_string(),
            });
        }
        Ok(expr)
    }

    pub fn eval(&self, env: &Env) -> Result<Value, ExprError> {
        match self {
            Expr::Int(value) => Ok(Value::Int(*value)),
            Expr::Var(Var::RemoteIp) => Ok(Value::Int(i64::from(env.remote_ip))),
            Expr::Var(Var::RelayIp) => Ok(Value::Int(i64::from(env.relay_ip))),
            Expr::Not(inner) => Ok(Value::Bool(!inner.eval(env)?.as_bool()?)),
            Expr::And(lhs, rhs) => {
                if !lhs.eval(env)?.as_bool()? {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(rhs.eval(env)?.as_bool()?))
            }
            Expr::Or(lhs, rhs) => {
                if lhs.eval(env)?.as_bool()? {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(rhs.eval(env)?.as_bool()?))
            }
            Expr::Cmp(op, lhs, rhs) => {
                let left = lhs.eval(env)?.as_int()?;
                let right = rhs.eval(env)?.as_int()?;
                let result = match op {
                    CmpOp::Eq => left == right,
                    CmpOp::Ne => left != right,
                    CmpOp::Lt => left < right,
                    CmpOp::Le => left <= right,
                    CmpOp::Gt => left > right,
                    CmpOp::Ge => left >= right,
                };
                Ok(Value::Bool(result))
            }
            Expr::InRange(value, lo, hi) => {
                let value = value.eval(env)?.as_int()?;
                let lo = lo.eval(env)?.as_int()?;
                let hi = hi.eval(env)?.as_int()?;
                Ok(Value::Bool(value >= lo && value <= hi))
            }
            Expr::InNetwork(value, net, mask) => {
                let value = value.eval(env)?.as_int()?;
                let net = net.eval(env)?.as_int()?;
                let mask = mask.eval(env)?.as_int()?;
                Ok(Value::Bool(value & mask == net))
            }
        }
    }

    /// Evaluates the rule and requires a boolean result.
    pub fn matches(&self, env: &Env) -> Result<bool, ExprError> {
        self.eval(env)?.as_bool()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TokenKind {
    Int(i64),
    Ident(String),
    LParen,
    RParen,
    Comma,
    AndAnd,
    OrOr,
    Bang,
    Cmp(CmpOp),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Token {
    kind: TokenKind,
    offset: usize,
}

fn tokenize(source: &str) -> Result<Vec<Token>, ExprError> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut index = 0;

    while index < bytes.len() {
        let start = index;
        let byte = bytes[index];

        match byte {
            b' ' | b'\t' | b'\r' | b'\n' => {
                index += 1;
            }
            b'(' => {
                tokens.push(Token { kind: TokenKind::LParen, offset: start });
                index += 1;
            }
            b')' => {
                tokens.push(Token { kind: TokenKind::RParen, offset: start });
                index += 1;
            }
            b',' => {
                tokens.push(Token { kind: TokenKind::Comma, offset: start });
                index += 1;
            }
            b'&' => {
                if bytes.get(index + 1) != Some(&b'&') {
                    return Err(ExprError::Parse {
                        offset: start,
                        message: "expected '&&'".to_string(),
                    });
                }
                tokens.push(Token { kind: TokenKind::AndAnd, offset: start });
                index += 2;
            }
            b'|' => {
                if bytes.get(index + 1) != Some(&b'|') {
                    return Err(ExprError::Parse {
                        offset: start,
                        message: "expected '||'".to_string(),
                    });
                }
                tokens.push(Token { kind: TokenKind::OrOr, offset: start });
                index += 2;
            }
            b'!' => {
                if bytes.get(index + 1) == Some(&b'=') {
                    tokens.push(Token { kind: TokenKind::Cmp(CmpOp::Ne), offset: start });
                    index += 2;
                } else {
                    tokens.push(Token { kind: TokenKind::Bang, offset: start });
                    index += 1;
                }
            }
            b'=' => {
                if bytes.get(index + 1) != Some(&b'=') {
                    return Err(ExprError::Parse {
                        offset: start,
                        message: "expected '=='".to_string(),
                    });
                }
                tokens.push(Token { kind: TokenKind::Cmp(CmpOp::Eq), offset: start });
                index += 2;
            }
            b'<' => {
                if bytes.get(index + 1) == Some(&b'=') {
                    tokens.push(Token { kind: TokenKind::Cmp(CmpOp::Le), offset: start });
                    index += 2;
                } else {
                    tokens.push(Token { kind: TokenKind::Cmp(CmpOp::Lt), offset: start });
                    index += 1;
                }
            }
            b'>' => {
                if bytes.get(index + 1) == Some(&b'=') {
                    tokens.push(Token { kind: TokenKind::Cmp(CmpOp::Ge), offset: start });
                    index += 2;
                } else {
                    tokens.push(Token { kind: TokenKind::Cmp(CmpOp::Gt), offset: start });
                    index += 1;
                }
            }
            b'0'..=b'9' => {
                while index < bytes.len() && (bytes[index].is_ascii_digit() || bytes[index] == b'.')
                {
                    index += 1;
                }
                let literal = &source[start..index];
                let value = if literal.contains('.') {
                    // dotted-quad IPv4 literal becomes its integer encoding
                    let ip = Ipv4Addr::from_str(literal).map_err(|_| ExprError::Parse {
                        offset: start,
                        message: format!("invalid IPv4 literal '{}'", literal),
                    })?;
                    i64::from(u32::from(ip))
                } else {
                    literal.parse::<i64>().map_err(|_| ExprError::Parse {
                        offset: start,
                        message: format!("invalid integer '{}'", literal),
                    })?
                };
                tokens.push(Token { kind: TokenKind::Int(value), offset: start });
            }
            b'A'..=b'Z' | b'a'..=b'z' | b'_' => {
                while index < bytes.len()
                    && (bytes[index].is_ascii_alphanumeric() || bytes[index] == b'_')
                {
                    index += 1;
                }
                tokens.push(Token {
                    kind: TokenKind::Ident(source[start..index].to_string()),
                    offset: start,
                });
            }
            other => {
                return Err(ExprError::Parse {
                    offset: start,
                    message: format!("unexpected character '{}'", other as char),
                });
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    index: usize,
}

impl Parser {
    fn peek(&self) -> Option<&TokenKind> {
        self.tokens.get(self.index).map(|token| &token.kind)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.index).cloned();
        if token.is_some() {
            self.index += 1;
        }
        token
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<(), ExprError> {
        match self.bump() {
            Some(token) if token.kind == kind => Ok(()),
            Some(token) => Err(ExprError::Parse {
                offset: token.offset,
                message: format!("expected {}", what),
            }),
            None => Err(ExprError::Parse {
                offset: self.tokens.last().map(|t| t.offset).unwrap_or(0),
                message: format!("expected {}, got end of input", what),
            }),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        let mut expr = self.parse_and()?;
        while self.peek() == Some(&TokenKind::OrOr) {
            self.bump();
            let rhs = self.parse_and()?;
            expr = Expr::Or(Box::new(expr), Box::new(rhs));
        }
        Ok(expr)
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut expr = self.parse_not()?;
        while self.peek() == Some(&TokenKind::AndAnd) {
            self.bump();
            let rhs = self.parse_not()?;
            expr = Expr::And(Box::new(expr), Box::new(rhs));
        }
        Ok(expr)
    }

    fn parse_not(&mut self) -> Result<Expr, ExprError> {
        if self.peek() == Some(&TokenKind::Bang) {
            self.bump();
            let inner = self.parse_not()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_cmp()
    }

    fn parse_cmp(&mut self) -> Result<Expr, ExprError> {
        let lhs = self.parse_primary()?;
        if let Some(TokenKind::Cmp(op)) = self.peek().cloned() {
            self.bump();
            let rhs = self.parse_primary()?;
            return Ok(Expr::Cmp(op, Box::new(lhs), Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn parse_primary(&mut self) -> Result<Expr, ExprError> {
        let token = self.bump().ok_or_else(|| ExprError::Parse {
            offset: 0,
            message: "unexpected end of input".to_string(),
        })?;

        match token.kind {
            TokenKind::Int(value) => Ok(Expr::Int(value)),
            TokenKind::LParen => {
                let inner = self.parse_or()?;
                self.expect(TokenKind::RParen, "')'")?;
                Ok(inner)
            }
            TokenKind::Ident(name) => {
                if self.peek() == Some(&TokenKind::LParen) {
                    self.bump();
                    let args = self.parse_args()?;
                    return build_call(&name, args, token.offset);
                }
                match name.as_str() {
                    "RemoteIP" => Ok(Expr::Var(Var::RemoteIp)),
                    "RelayIP" => Ok(Expr::Var(Var::RelayIp)),
                    _ => Err(ExprError::UnknownIdentifier(name)),
                }
            }
            _ => Err(ExprError::Parse {
                offset: token.offset,
                message: "expected literal, identifier or '('".to_string(),
            }),
        }
    }

    fn parse_args(&mut self) -> Result<Vec<Expr>, ExprError> {
        let mut args = Vec::new();
        if self.peek() == Some(&TokenKind::RParen) {
            self.bump();
            return Ok(args);
        }
        loop {
            args.push(self.parse_or()?);
            match self.bump() {
                Some(token) if token.kind == TokenKind::Comma => continue,
                Some(token) if token.kind == TokenKind::RParen => break,
                Some(token) => {
                    return Err(ExprError::Parse {
                        offset: token.offset,
                        message: "expected ',' or ')'".to_string(),
                    });
                }
                None => {
                    return Err(ExprError::Parse {
                        offset: 0,
                        message: "unterminated argument list".to_string(),
                    });
                }
            }
        }
        Ok(args)
    }
}

fn build_call(name: &str, args: Vec<Expr>, offset: usize) -> Result<Expr, ExprError> {
    if !matches!(name, "InRange" | "InNetwork") {
        return Err(ExprError::UnknownFunction(name.to_string()));
    }

    let [first, second, third]: [Expr; 3] = match args.try_into() {
        Ok(args) => args,
        Err(args) => {
            return Err(ExprError::Parse {
                offset,
                message: format!("{} takes 3 arguments, got {}", name, args.len()),
            });
        }
    };

    let (first, second, third) = (Box::new(first), Box::new(second), Box::new(third));
    if name == "InRange" {
        Ok(Expr::InRange(first, second, third))
    } else {
        Ok(Expr::InNetwork(first, second, third))
    }
}
