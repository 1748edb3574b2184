//! PEP 508 environment markers: parsing and evaluation against target environments.
//!
//! Only the subset needed to decide whether a dependency edge applies on a
//! given target is supported: comparisons, `in`/`not in`, `and`/`or`, and
//! parentheses. Version-valued variables compare numerically.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid environment marker '{marker}': {reason}")]
pub struct MarkerError {
    pub marker: String,
    pub reason: String,
}

const VERSION_VARIABLES: &[&str] = &[
    "python_version",
    "python_full_version",
    "implementation_version",
];

/// A concrete interpreter/platform combination a resolve must work on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetEnvironment {
    pub python_version: String,
    pub sys_platform: String,
    #[serde(default)]
    pub platform_machine: Option<String>,
}

impl TargetEnvironment {
    pub fn new(python_version: &str, sys_platform: &str) -> Self {
        Self {
            python_version: python_version.to_owned(),
            sys_platform: sys_platform.to_owned(),
            platform_machine: None,
        }
    }

    /// Expand into the marker variable table, deriving platform-dependent variables.
    pub fn marker_environment(&self) -> MarkerEnvironment {
        let (platform_system, os_name) = match self.sys_platform.as_str() {
            "darwin" => ("Darwin", "posix"),
            "win32" | "cygwin" => ("Windows", "nt"),
            _ => ("Linux", "posix"),
        };
        let mut vars = BTreeMap::new();
        vars.insert("python_version".to_owned(), self.python_version.clone());
        vars.insert(
            "python_full_version".to_owned(),
            if self.python_version.matches('.').count() >= 2 {
                self.python_version.clone()
            } else {
                format!("{}.0", self.python_version)
            },
        );
        vars.insert("sys_platform".to_owned(), self.sys_platform.clone());
        vars.insert("platform_system".to_owned(), platform_system.to_owned());
        vars.insert("os_name".to_owned(), os_name.to_owned());
        vars.insert("implementation_name".to_owned(), "cpython".to_owned());
        vars.insert(
            "platform_python_implementation".to_owned(),
            "CPython".to_owned(),
        );
        vars.insert(
            "platform_machine".to_owned(),
            self.platform_machine
                .clone()
                .unwrap_or_else(|| "x86_64".to_owned()),
        );
        vars.insert("extra".to_owned(), String::new());
        MarkerEnvironment { vars }
    }
}

/// Default targets when the configuration declares none.
pub fn default_target_environments() -> Vec<TargetEnvironment> {
    vec![
        TargetEnvironment::new("3.11", "linux"),
        TargetEnvironment::new("3.11", "darwin"),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerEnvironment {
    vars: BTreeMap<String, String>,
}

impl MarkerEnvironment {
    fn get(&self, name: &str) -> &str {
        self.vars.get(name).map_or("", String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Lt,
    Le,
    Eq,
    Ne,
    Ge,
    Gt,
    Compatible,
    Arbitrary,
    In,
    NotIn,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Value {
    Variable(String),
    Literal(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Expr {
    Compare(Value, Op, Value),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

/// A parsed environment marker expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker {
    source: String,
    expr: Expr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    LParen,
    RParen,
    Ident(String),
    Str(String),
    Op(String),
}

impl Marker {
    pub fn parse(input: &str) -> Result<Self, MarkerError> {
        let err = |reason: &str| MarkerError {
            marker: input.to_owned(),
            reason: reason.to_owned(),
        };
        let tokens = tokenize(input).map_err(|r| err(&r))?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or().map_err(|r| err(&r))?;
        if parser.pos != parser.tokens.len() {
            return Err(err("trailing tokens"));
        }
        Ok(Self {
            source: input.trim().to_owned(),
            expr,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn evaluate(&self, env: &MarkerEnvironment) -> bool {
        eval(&self.expr, env)
    }

    /// True when the marker holds on at least one of the targets.
    pub fn applies_to_any(&self, targets: &[TargetEnvironment]) -> bool {
        targets
            .iter()
            .any(|t| self.evaluate(&t.marker_environment()))
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '\'' | '"' => {
                let start = i + 1;
                let end = chars[start..]
                    .iter()
                    .position(|&ch| ch == c)
                    .map(|p| start + p)
                    .ok_or_else(|| "unterminated string".to_owned())?;
                tokens.push(Token::Str(chars[start..end].iter().collect()));
                i = end + 1;
            }
            '<' | '>' | '=' | '!' | '~' => {
                let start = i;
                while i < chars.len() && matches!(chars[i], '<' | '>' | '=' | '!' | '~') {
                    i += 1;
                }
                tokens.push(Token::Op(chars[start..i].iter().collect()));
            }
            c if c.is_ascii_alphanumeric() || c == '_' || c == '.' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(format!("unexpected character '{other}'")),
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
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(k)) if k == keyword)
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_and()?;
        while self.peek_keyword("or") {
            self.pos += 1;
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_atom()?;
        while self.peek_keyword("and") {
            self.pos += 1;
            let rhs = self.parse_atom()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_atom(&mut self) -> Result<Expr, String> {
        if matches!(self.peek(), Some(Token::LParen)) {
            self.pos += 1;
            let inner = self.parse_or()?;
            return match self.next() {
                Some(Token::RParen) => Ok(inner),
                _ => Err("expected ')'".to_owned()),
            };
        }
        let lhs = self.parse_value()?;
        let op = self.parse_op()?;
        let rhs = self.parse_value()?;
        Ok(Expr::Compare(lhs, op, rhs))
    }

    fn parse_value(&mut self) -> Result<Value, String> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Value::Literal(s)),
            Some(Token::Ident(name)) if !matches!(name.as_str(), "and" | "or" | "in" | "not") => {
                Ok(Value::Variable(name))
            }
            Some(other) => Err(format!("expected a value, found {other:?}")),
            None => Err("unexpected end of marker".to_owned()),
        }
    }

    fn parse_op(&mut self) -> Result<Op, String> {
        match self.next() {
            Some(Token::Op(op)) => match op.as_str() {
                "<" => Ok(Op::Lt),
                "<=" => Ok(Op::Le),
                "==" => Ok(Op::Eq),
                "!=" => Ok(Op::Ne),
                ">=" => Ok(Op::Ge),
                ">" => Ok(Op::Gt),
                "~=" => Ok(Op::Compatible),
                "===" => Ok(Op::Arbitrary),
                other => Err(format!("unknown operator '{other}'")),
            },
            Some(Token::Ident(k)) if k == "in" => Ok(Op::In),
            Some(Token::Ident(k)) if k == "not" => match self.next() {
                Some(Token::Ident(k)) if k == "in" => Ok(Op::NotIn),
                _ => Err("expected 'in' after 'not'".to_owned()),
            },
            Some(other) => Err(format!("expected an operator, found {other:?}")),
            None => Err("unexpected end of marker".to_owned()),
        }
    }
}

fn eval(expr: &Expr, env: &MarkerEnvironment) -> bool {
    match expr {
        Expr::And(a, b) => eval(a, env) && eval(b, env),
        Expr::Or(a, b) => eval(a, env) || eval(b, env),
        Expr::Compare(lhs, op, rhs) => {
            let is_version = [lhs, rhs].iter().any(
                |v| matches!(v, Value::Variable(name) if VERSION_VARIABLES.contains(&name.as_str())),
            );
            let l = resolve_value(lhs, env);
            let r = resolve_value(rhs, env);
            compare(l, *op, r, is_version)
        }
    }
}

fn resolve_value<'a>(value: &'a Value, env: &'a MarkerEnvironment) -> &'a str {
    match value {
        Value::Variable(name) => env.get(name),
        Value::Literal(s) => s,
    }
}

fn compare(lhs: &str, op: Op, rhs: &str, is_version: bool) -> bool {
    match op {
        Op::In => rhs.contains(lhs),
        Op::NotIn => !rhs.contains(lhs),
        Op::Arbitrary => lhs == rhs,
        _ if is_version => {
            if let Some(prefix) = rhs.strip_suffix(".*") {
                let matches_prefix = version_matches_prefix(lhs, prefix);
                return match op {
                    Op::Eq => matches_prefix,
                    Op::Ne => !matches_prefix,
                    _ => ordering_holds(compare_versions(lhs, prefix), op),
                };
            }
            ordering_holds(compare_versions(lhs, rhs), op)
        }
        Op::Eq => lhs == rhs,
        Op::Ne => lhs != rhs,
        _ => ordering_holds(lhs.cmp(rhs), op),
    }
}

fn ordering_holds(ord: Ordering, op: Op) -> bool {
    match op {
        Op::Lt => ord == Ordering::Less,
        Op::Le => ord != Ordering::Greater,
        Op::Eq => ord == Ordering::Equal,
        Op::Ne => ord != Ordering::Equal,
        // `~=` is approximated by its lower bound.
        Op::Ge | Op::Compatible => ord != Ordering::Less,
        Op::Gt => ord == Ordering::Greater,
        Op::Arbitrary | Op::In | Op::NotIn => false,
    }
}

fn version_parts(v: &str) -> Vec<u64> {
    v.split('.')
        .map(|part| {
            let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
            digits.parse().unwrap_or(0)
        })
        .collect()
}

fn compare_versions(a: &str, b: &str) -> Ordering {
    let (pa, pb) = (version_parts(a), version_parts(b));
    let len = pa.len().max(pb.len());
    for i in 0..len {
        let x = pa.get(i).copied().unwrap_or(0);
        let y = pb.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            Ordering::Equal => {}
            other => return other,
        }
    }
    Ordering::Equal
}

fn version_matches_prefix(version: &str, prefix: &str) -> bool {
    let (pv, pp) = (version_parts(version), version_parts(prefix));
    pv.len() >= pp.len() && pv[..pp.len()] == pp[..]
}
