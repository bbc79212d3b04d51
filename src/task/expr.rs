//! Expression text: lexer, parser and evaluator.
//!
//! Three statement forms are recognised:
//! - `import <ns>` loads a registered namespace
//! - `<ident> = <expr>` assigns a local
//! - anything else is evaluated as an expression
//!
//! Expressions cover literals, lists, maps, names, attribute access, calls
//! with positional and keyword arguments, indexing, unary `-`/`not` and the
//! usual arithmetic, comparison and boolean operators.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, LazyLock};

use futures::FutureExt;
use futures::future::BoxFuture;
use regex::Regex;

use crate::error::TaskError;
use crate::payload::{Args, Payload};
use crate::registry::builtin::functions::compare;
use crate::registry::{ClassFactory, Instance, Member, Namespace, Registry};
use crate::task::Callable;

static ASSIGN_TARGET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z._][A-Za-z0-9._]*$").expect("assignment pattern is valid")
});

const IMPORT: &str = "import ";

/// Deepest nesting of brackets and prefix operators the parser accepts.
const MAX_NESTING: usize = 128;
/// Deepest expression tree the evaluator is handed.
const MAX_TREE_DEPTH: usize = 256;
/// Longest token stream accepted.
const MAX_TOKENS: usize = 4096;
/// Largest text or list a repetition may produce.
const MAX_REPEAT_LEN: usize = 1_000_000;

/// One parsed line of expression text.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Import(String),
    Assign(String, Expr),
    Eval(Expr),
}

/// Classify and parse a line of expression text.
pub fn parse_statement(text: &str) -> Result<Statement, TaskError> {
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix(IMPORT) {
        let name = rest.trim();
        if !ASSIGN_TARGET.is_match(name) {
            return Err(invalid(text, format!("bad import target '{name}'")));
        }
        return Ok(Statement::Import(name.to_string()));
    }
    if let Some(eq) = trimmed.find('=') {
        let next = trimmed[eq + 1..].chars().next();
        let lhs = trimmed[..eq].trim();
        if next != Some('=') && ASSIGN_TARGET.is_match(lhs) {
            let rhs = parse_expr(&trimmed[eq + 1..])?;
            return Ok(Statement::Assign(lhs.to_string(), rhs));
        }
    }
    Ok(Statement::Eval(parse_expr(trimmed)?))
}

/// Parse a bare expression.
pub fn parse_expr(text: &str) -> Result<Expr, TaskError> {
    let tokens = tokenize(text)?;
    if tokens.len() > MAX_TOKENS {
        return Err(invalid(
            text,
            format!("expression too long ({} tokens, limit {MAX_TOKENS})", tokens.len()),
        ));
    }
    let mut parser = Parser {
        text,
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.expression()?;
    if *parser.peek() != Token::End {
        return Err(invalid(text, format!("unexpected {}", parser.peek())));
    }
    if tree_depth(&expr) > MAX_TREE_DEPTH {
        return Err(invalid(text, format!("expression nested deeper than {MAX_TREE_DEPTH}")));
    }
    Ok(expr)
}

/// Depth of `expr`, walked with an explicit stack.
fn tree_depth(expr: &Expr) -> usize {
    let mut deepest = 0;
    let mut stack = vec![(expr, 1)];
    while let Some((node, depth)) = stack.pop() {
        deepest = deepest.max(depth);
        match node {
            Expr::Literal(_) | Expr::Name(_) => {}
            Expr::List(items) => stack.extend(items.iter().map(|e| (e, depth + 1))),
            Expr::Map(entries) => {
                for (k, v) in entries {
                    stack.push((k, depth + 1));
                    stack.push((v, depth + 1));
                }
            }
            Expr::Attr(base, _) | Expr::Unary(_, base) => stack.push((base, depth + 1)),
            Expr::Index(a, b) | Expr::Binary(_, a, b) => {
                stack.push((a, depth + 1));
                stack.push((b, depth + 1));
            }
            Expr::Call { func, args, kwargs } => {
                stack.push((func, depth + 1));
                stack.extend(args.iter().map(|e| (e, depth + 1)));
                stack.extend(kwargs.iter().map(|(_, e)| (e, depth + 1)));
            }
        }
    }
    deepest
}

fn invalid(text: &str, reason: impl Into<String>) -> TaskError {
    TaskError::InvalidExpression {
        text: text.to_string(),
        reason: reason.into(),
    }
}

/* ---------------------------------------------------------------------- */
/* Lexer                                                                  */
/* ---------------------------------------------------------------------- */

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    Punct(&'static str),
    End,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Int(i) => write!(f, "number {i}"),
            Token::Float(x) => write!(f, "number {x}"),
            Token::Str(s) => write!(f, "string {s:?}"),
            Token::Ident(s) => write!(f, "name '{s}'"),
            Token::Punct(p) => write!(f, "'{p}'"),
            Token::End => write!(f, "end of input"),
        }
    }
}

const PUNCT2: &[&str] = &["==", "!=", "<=", ">=", "//"];
const PUNCT1: &[&str] = &[
    "+", "-", "*", "/", "%", "<", ">", "(", ")", "[", "]", "{", "}", ",", ":", ".", "=",
];

fn tokenize(text: &str) -> Result<Vec<Token>, TaskError> {
    let chars: Vec<char> = text.chars().collect();
    let mut out = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c.is_ascii_digit() {
            let start = i;
            let mut is_float = false;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            if i + 1 < chars.len() && chars[i] == '.' && chars[i + 1].is_ascii_digit() {
                is_float = true;
                i += 1;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
            }
            if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                let mut j = i + 1;
                if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                    j += 1;
                }
                if j < chars.len() && chars[j].is_ascii_digit() {
                    is_float = true;
                    i = j;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
            }
            let literal: String = chars[start..i].iter().collect();
            let token = if is_float {
                literal
                    .parse::<f64>()
                    .map(Token::Float)
                    .map_err(|e| invalid(text, format!("bad number {literal}: {e}")))?
            } else {
                literal
                    .parse::<i64>()
                    .map(Token::Int)
                    .map_err(|e| invalid(text, format!("bad number {literal}: {e}")))?
            };
            out.push(token);
        } else if c == '"' || c == '\'' {
            let quote = c;
            let mut s = String::new();
            i += 1;
            loop {
                match chars.get(i) {
                    None => return Err(invalid(text, "unterminated string")),
                    Some(&ch) if ch == quote => {
                        i += 1;
                        break;
                    }
                    Some('\\') => {
                        let escaped = match chars.get(i + 1) {
                            Some('n') => '\n',
                            Some('t') => '\t',
                            Some('r') => '\r',
                            Some('0') => '\0',
                            Some(&other) => other,
                            None => return Err(invalid(text, "unterminated string")),
                        };
                        s.push(escaped);
                        i += 2;
                    }
                    Some(&ch) => {
                        s.push(ch);
                        i += 1;
                    }
                }
            }
            out.push(Token::Str(s));
        } else if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            out.push(Token::Ident(chars[start..i].iter().collect()));
        } else {
            let pair: String = chars[i..(i + 2).min(chars.len())].iter().collect();
            if let Some(p) = PUNCT2.iter().find(|p| **p == pair) {
                out.push(Token::Punct(*p));
                i += 2;
            } else if let Some(p) = PUNCT1.iter().find(|p| p.starts_with(c)) {
                out.push(Token::Punct(*p));
                i += 1;
            } else {
                return Err(invalid(text, format!("unexpected character '{c}'")));
            }
        }
    }
    out.push(Token::End);
    Ok(out)
}

/* ---------------------------------------------------------------------- */
/* Parser                                                                 */
/* ---------------------------------------------------------------------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinOp {
    fn from_punct(p: &str) -> Option<Self> {
        Some(match p {
            "+" => Self::Add,
            "-" => Self::Sub,
            "*" => Self::Mul,
            "/" => Self::Div,
            "//" => Self::FloorDiv,
            "%" => Self::Rem,
            "==" => Self::Eq,
            "!=" => Self::Ne,
            "<" => Self::Lt,
            "<=" => Self::Le,
            ">" => Self::Gt,
            ">=" => Self::Ge,
            _ => return None,
        })
    }

    fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::FloorDiv => "//",
            Self::Rem => "%",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::And => "and",
            Self::Or => "or",
        }
    }
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Payload),
    Name(String),
    List(Vec<Expr>),
    Map(Vec<(Expr, Expr)>),
    Attr(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call {
        func: Box<Expr>,
        args: Vec<Expr>,
        kwargs: Vec<(String, Expr)>,
    },
    Unary(UnaryOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

struct Parser<'t> {
    text: &'t str,
    tokens: Vec<Token>,
    pos: usize,
    /// Current recursion depth through `expression`, `unary` and `not_expr`.
    depth: usize,
}

impl Parser<'_> {
    fn peek(&self) -> &Token {
        self.tokens.get(self.pos).unwrap_or(&Token::End)
    }

    fn peek_at(&self, offset: usize) -> &Token {
        self.tokens.get(self.pos + offset).unwrap_or(&Token::End)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn is_punct(&self, p: &str) -> bool {
        matches!(self.peek(), Token::Punct(q) if *q == p)
    }

    fn is_keyword(&self, k: &str) -> bool {
        matches!(self.peek(), Token::Ident(s) if s == k)
    }

    fn eat_punct(&mut self, p: &str) -> bool {
        if self.is_punct(p) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, p: &str) -> Result<(), TaskError> {
        if self.eat_punct(p) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{p}', got {}", self.peek())))
        }
    }

    fn error(&self, reason: String) -> TaskError {
        invalid(self.text, reason)
    }

    fn descend(&mut self) -> Result<(), TaskError> {
        if self.depth >= MAX_NESTING {
            return Err(self.error(format!("nesting deeper than {MAX_NESTING}")));
        }
        self.depth += 1;
        Ok(())
    }

    fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T, TaskError>) -> Result<T, TaskError> {
        self.descend()?;
        let result = f(self);
        self.depth -= 1;
        result
    }

    fn expression(&mut self) -> Result<Expr, TaskError> {
        self.nested(Self::or_expr)
    }

    fn or_expr(&mut self) -> Result<Expr, TaskError> {
        let mut left = self.and_expr()?;
        while self.is_keyword("or") {
            self.advance();
            let right = self.and_expr()?;
            left = Expr::Binary(BinOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, TaskError> {
        let mut left = self.not_expr()?;
        while self.is_keyword("and") {
            self.advance();
            let right = self.not_expr()?;
            left = Expr::Binary(BinOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> Result<Expr, TaskError> {
        if self.is_keyword("not") {
            self.advance();
            let inner = self.nested(Self::not_expr)?;
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(inner)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, TaskError> {
        let mut left = self.additive()?;
        loop {
            let op = match self.peek() {
                Token::Punct(p) => match BinOp::from_punct(p) {
                    Some(
                        op @ (BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge),
                    ) => op,
                    _ => break,
                },
                _ => break,
            };
            self.advance();
            let right = self.additive()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn additive(&mut self) -> Result<Expr, TaskError> {
        let mut left = self.term()?;
        loop {
            let op = if self.is_punct("+") {
                BinOp::Add
            } else if self.is_punct("-") {
                BinOp::Sub
            } else {
                break;
            };
            self.advance();
            let right = self.term()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<Expr, TaskError> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Token::Punct("*") => BinOp::Mul,
                Token::Punct("/") => BinOp::Div,
                Token::Punct("//") => BinOp::FloorDiv,
                Token::Punct("%") => BinOp::Rem,
                _ => break,
            };
            self.advance();
            let right = self.unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, TaskError> {
        if self.eat_punct("-") {
            let inner = self.nested(Self::unary)?;
            return Ok(match inner {
                Expr::Literal(Payload::Int(i)) => Expr::Literal(Payload::Int(-i)),
                Expr::Literal(Payload::Float(f)) => Expr::Literal(Payload::Float(-f)),
                other => Expr::Unary(UnaryOp::Neg, Box::new(other)),
            });
        }
        if self.eat_punct("+") {
            return self.nested(Self::unary);
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, TaskError> {
        let mut expr = self.atom()?;
        loop {
            if self.eat_punct(".") {
                match self.advance() {
                    Token::Ident(name) => expr = Expr::Attr(Box::new(expr), name),
                    other => return Err(self.error(format!("expected attribute name, got {other}"))),
                }
            } else if self.eat_punct("[") {
                let index = self.expression()?;
                self.expect_punct("]")?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else if self.eat_punct("(") {
                let (args, kwargs) = self.call_args()?;
                expr = Expr::Call {
                    func: Box::new(expr),
                    args,
                    kwargs,
                };
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn call_args(&mut self) -> Result<(Vec<Expr>, Vec<(String, Expr)>), TaskError> {
        let mut args = Vec::new();
        let mut kwargs = Vec::new();
        while !self.is_punct(")") {
            let keyword = match (self.peek(), self.peek_at(1)) {
                (Token::Ident(name), Token::Punct("=")) => Some(name.clone()),
                _ => None,
            };
            if let Some(name) = keyword {
                self.pos += 2;
                kwargs.push((name, self.expression()?));
            } else {
                if !kwargs.is_empty() {
                    return Err(self.error("positional argument follows keyword argument".into()));
                }
                args.push(self.expression()?);
            }
            if !self.eat_punct(",") {
                break;
            }
        }
        self.expect_punct(")")?;
        Ok((args, kwargs))
    }

    fn atom(&mut self) -> Result<Expr, TaskError> {
        match self.advance() {
            Token::Int(i) => Ok(Expr::Literal(Payload::Int(i))),
            Token::Float(f) => Ok(Expr::Literal(Payload::Float(f))),
            Token::Str(s) => Ok(Expr::Literal(Payload::Text(s))),
            Token::Ident(name) => Ok(match name.as_str() {
                "True" | "true" => Expr::Literal(Payload::Bool(true)),
                "False" | "false" => Expr::Literal(Payload::Bool(false)),
                "None" | "null" => Expr::Literal(Payload::None),
                _ => Expr::Name(name),
            }),
            Token::Punct("(") => {
                let inner = self.expression()?;
                if self.is_punct(",") {
                    // Tuple syntax; treated as a list.
                    let mut items = vec![inner];
                    while self.eat_punct(",") && !self.is_punct(")") {
                        items.push(self.expression()?);
                    }
                    self.expect_punct(")")?;
                    return Ok(Expr::List(items));
                }
                self.expect_punct(")")?;
                Ok(inner)
            }
            Token::Punct("[") => {
                let mut items = Vec::new();
                while !self.is_punct("]") {
                    items.push(self.expression()?);
                    if !self.eat_punct(",") {
                        break;
                    }
                }
                self.expect_punct("]")?;
                Ok(Expr::List(items))
            }
            Token::Punct("{") => {
                let mut entries = Vec::new();
                while !self.is_punct("}") {
                    let key = self.expression()?;
                    self.expect_punct(":")?;
                    let value = self.expression()?;
                    entries.push((key, value));
                    if !self.eat_punct(",") {
                        break;
                    }
                }
                self.expect_punct("}")?;
                Ok(Expr::Map(entries))
            }
            other => Err(self.error(format!("unexpected {other}"))),
        }
    }
}

/* ---------------------------------------------------------------------- */
/* Evaluation                                                             */
/* ---------------------------------------------------------------------- */

/// A value during evaluation. Only `Data` may leave the evaluator.
#[derive(Clone)]
pub enum Value {
    Data(Payload),
    Callable(Callable),
    Namespace(Arc<Namespace>),
    Instance(Arc<dyn Instance>),
    Class(String, ClassFactory),
}

impl Value {
    fn describe(&self) -> String {
        match self {
            Self::Data(p) => p.type_name().to_string(),
            Self::Callable(c) => c.to_string(),
            Self::Namespace(ns) => format!("<namespace {}>", ns.name()),
            Self::Instance(i) => format!("<{} instance>", i.type_name()),
            Self::Class(name, _) => format!("<class {name}>"),
        }
    }

    /// The payload behind this value, or `UnserializableValue`.
    pub fn into_payload(self) -> Result<Payload, TaskError> {
        match self {
            Self::Data(p) => Ok(p),
            other => Err(TaskError::UnserializableValue {
                reason: format!("{} cannot leave the worker", other.describe()),
            }),
        }
    }
}

impl From<Member> for Value {
    fn from(member: Member) -> Self {
        match member {
            Member::Callable(c) => Self::Callable(c),
            Member::Value(p) => Self::Data(p),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data(p) => write!(f, "{p:?}"),
            other => write!(f, "{}", other.describe()),
        }
    }
}

/// Names visible to an expression: loaded namespaces, locals, then built-ins.
pub struct Scope<'a> {
    pub registry: &'a Registry,
    pub namespaces: &'a HashMap<String, Arc<Namespace>>,
    pub locals: &'a HashMap<String, Value>,
}

impl Scope<'_> {
    /// Evaluate `expr`; `text` is used for error messages.
    pub async fn eval(&self, text: &str, expr: &Expr) -> Result<Value, TaskError> {
        Evaluator { scope: self, text }.eval(expr).await
    }
}

struct Evaluator<'s, 'a> {
    scope: &'s Scope<'a>,
    text: &'s str,
}

impl Evaluator<'_, '_> {
    fn eval<'e>(&'e self, expr: &'e Expr) -> BoxFuture<'e, Result<Value, TaskError>> {
        async move {
            match expr {
                Expr::Literal(p) => Ok(Value::Data(p.clone())),
                Expr::Name(name) => self.lookup(name),
                Expr::List(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        out.push(self.data(item).await?);
                    }
                    Ok(Value::Data(Payload::List(out)))
                }
                Expr::Map(entries) => {
                    let mut out = BTreeMap::new();
                    for (k, v) in entries {
                        let key = match self.data(k).await? {
                            Payload::Text(s) => s,
                            other => other.to_string(),
                        };
                        out.insert(key, self.data(v).await?);
                    }
                    Ok(Value::Data(Payload::Map(out)))
                }
                Expr::Attr(base, name) => {
                    let base = self.eval(base).await?;
                    self.attribute(base, name)
                }
                Expr::Index(base, index) => {
                    let base = self.data(base).await?;
                    let index = self.data(index).await?;
                    self.index(&base, &index).map(Value::Data)
                }
                Expr::Call { func, args, kwargs } => {
                    let func = self.eval(func).await?;
                    let mut positional = Vec::with_capacity(args.len());
                    for arg in args {
                        positional.push(self.data(arg).await?);
                    }
                    let mut keywords = BTreeMap::new();
                    for (name, arg) in kwargs {
                        keywords.insert(name.clone(), self.data(arg).await?);
                    }
                    self.call(func, positional, keywords).await
                }
                Expr::Unary(UnaryOp::Not, inner) => {
                    Ok(Value::Data(Payload::Bool(!self.data(inner).await?.is_truthy())))
                }
                Expr::Unary(UnaryOp::Neg, inner) => match self.data(inner).await? {
                    Payload::Int(i) => i
                        .checked_neg()
                        .map(|v| Value::Data(Payload::Int(v)))
                        .ok_or_else(|| TaskError::fault("integer overflow")),
                    Payload::Float(f) => Ok(Value::Data(Payload::Float(-f))),
                    other => Err(self.error(format!("bad operand for -: {}", other.type_name()))),
                },
                Expr::Binary(BinOp::And, left, right) => {
                    let l = self.data(left).await?;
                    if !l.is_truthy() {
                        return Ok(Value::Data(l));
                    }
                    self.eval(right).await
                }
                Expr::Binary(BinOp::Or, left, right) => {
                    let l = self.data(left).await?;
                    if l.is_truthy() {
                        return Ok(Value::Data(l));
                    }
                    self.eval(right).await
                }
                Expr::Binary(op, left, right) => {
                    let l = self.data(left).await?;
                    let r = self.data(right).await?;
                    binary(*op, l, r)
                        .map(Value::Data)
                        .map_err(|e| match e {
                            BinaryError::Type(reason) => self.error(reason),
                            BinaryError::Fault(e) => e,
                        })
                }
            }
        }
        .boxed()
    }

    async fn data(&self, expr: &Expr) -> Result<Payload, TaskError> {
        match self.eval(expr).await? {
            Value::Data(p) => Ok(p),
            other => Err(self.error(format!("{} used as a value", other.describe()))),
        }
    }

    fn error(&self, reason: String) -> TaskError {
        invalid(self.text, reason)
    }

    fn lookup(&self, name: &str) -> Result<Value, TaskError> {
        let scope = self.scope;
        if let Some(value) = scope.locals.get(name) {
            return Ok(value.clone());
        }
        if let Some(ns) = scope.namespaces.get(name) {
            return Ok(Value::Namespace(Arc::clone(ns)));
        }
        if let Some(member) = scope.registry.builtin(name) {
            return Ok(member.into());
        }
        if let Some(factory) = scope.registry.builtin_class(name) {
            return Ok(Value::Class(name.to_string(), factory));
        }
        Err(self.error(format!("name '{name}' is not defined")))
    }

    fn attribute(&self, base: Value, name: &str) -> Result<Value, TaskError> {
        match base {
            Value::Namespace(ns) => {
                if let Some(member) = ns.member(name) {
                    Ok(member.into())
                } else if let Some(factory) = ns.class_factory(name) {
                    Ok(Value::Class(format!("{}.{name}", ns.name()), factory))
                } else {
                    Err(TaskError::MethodNotFound {
                        target: format!("{}.{name}", ns.name()),
                    })
                }
            }
            Value::Instance(instance) => instance
                .member(name)
                .map(Value::from)
                .ok_or_else(|| TaskError::MethodNotFound {
                    target: format!("{}.{name}", instance.type_name()),
                }),
            other => Err(self.error(format!("{} has no attribute '{name}'", other.describe()))),
        }
    }

    fn index(&self, base: &Payload, index: &Payload) -> Result<Payload, TaskError> {
        match (base, index) {
            (Payload::List(items), Payload::Int(i)) => {
                let at = normalize_index(*i, items.len())
                    .ok_or_else(|| TaskError::fault("list index out of range"))?;
                Ok(items[at].clone())
            }
            (Payload::Text(s), Payload::Int(i)) => {
                let count = s.chars().count();
                let at = normalize_index(*i, count)
                    .ok_or_else(|| TaskError::fault("string index out of range"))?;
                Ok(s.chars().nth(at).map(|c| Payload::Text(c.to_string())).unwrap_or_default())
            }
            (Payload::Map(map), Payload::Text(key)) => map
                .get(key)
                .cloned()
                .ok_or_else(|| TaskError::fault(format!("key {key:?} not found"))),
            _ => Err(self.error(format!(
                "{} cannot be indexed by {}",
                base.type_name(),
                index.type_name()
            ))),
        }
    }

    async fn call(
        &self,
        func: Value,
        positional: Vec<Payload>,
        keywords: BTreeMap<String, Payload>,
    ) -> Result<Value, TaskError> {
        match func {
            Value::Callable(callable) => {
                let args = match (positional.is_empty(), keywords.is_empty()) {
                    (_, true) => Args::Positional(positional),
                    (true, false) => Args::Keyword(keywords),
                    (false, false) => {
                        return Err(TaskError::arguments(
                            callable.name(),
                            "mixing positional and keyword arguments is not supported",
                        ));
                    }
                };
                callable.invoke(args).await.map(Value::Data)
            }
            Value::Class(name, factory) => {
                if !keywords.is_empty() {
                    return Err(TaskError::arguments(name, "classes take positional arguments"));
                }
                factory(&positional).map(Value::Instance)
            }
            other => Err(TaskError::NotCallable {
                target: other.describe(),
            }),
        }
    }
}

fn normalize_index(i: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let at = if i < 0 { i + len } else { i };
    (0..len).contains(&at).then_some(at as usize)
}

enum BinaryError {
    Type(String),
    Fault(TaskError),
}

/// Repetition count for a sequence of `len` items, refusing oversized results.
fn repeat_count(len: usize, n: i64) -> Result<usize, BinaryError> {
    let n = usize::try_from(n.max(0)).unwrap_or(usize::MAX);
    match len.checked_mul(n) {
        Some(total) if total <= MAX_REPEAT_LEN => Ok(n),
        _ => Err(BinaryError::Fault(TaskError::fault(format!(
            "repetition result exceeds {MAX_REPEAT_LEN} items"
        )))),
    }
}

fn binary(op: BinOp, l: Payload, r: Payload) -> Result<Payload, BinaryError> {
    use Payload::{Bool, Float, Int, List, Text};

    let mismatch = |l: &Payload, r: &Payload| {
        BinaryError::Type(format!(
            "unsupported operand types for {}: {} and {}",
            op.symbol(),
            l.type_name(),
            r.type_name()
        ))
    };
    let overflow = || BinaryError::Fault(TaskError::fault("integer overflow"));
    let zero = || BinaryError::Fault(TaskError::fault("division by zero"));

    match op {
        BinOp::Eq => return Ok(Bool(equals(&l, &r))),
        BinOp::Ne => return Ok(Bool(!equals(&l, &r))),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ord = compare(&l, &r).ok_or_else(|| mismatch(&l, &r))?;
            let result = match op {
                BinOp::Lt => ord == Ordering::Less,
                BinOp::Le => ord != Ordering::Greater,
                BinOp::Gt => ord == Ordering::Greater,
                _ => ord != Ordering::Less,
            };
            return Ok(Bool(result));
        }
        _ => {}
    }

    match (op, &l, &r) {
        (BinOp::Add, Text(a), Text(b)) => Ok(Text(format!("{a}{b}"))),
        (BinOp::Add, List(a), List(b)) => Ok(List(a.iter().chain(b).cloned().collect())),
        (BinOp::Mul, Text(s), Int(n)) | (BinOp::Mul, Int(n), Text(s)) => {
            let n = repeat_count(s.len(), *n)?;
            Ok(Text(s.repeat(n)))
        }
        (BinOp::Mul, List(items), Int(n)) | (BinOp::Mul, Int(n), List(items)) => {
            let n = repeat_count(items.len(), *n)?;
            Ok(List(items.iter().cloned().cycle().take(items.len() * n).collect()))
        }
        (_, Int(a), Int(b)) => {
            let (a, b) = (*a, *b);
            match op {
                BinOp::Add => a.checked_add(b).map(Int).ok_or_else(overflow),
                BinOp::Sub => a.checked_sub(b).map(Int).ok_or_else(overflow),
                BinOp::Mul => a.checked_mul(b).map(Int).ok_or_else(overflow),
                BinOp::Div if b == 0 => Err(zero()),
                BinOp::Div => Ok(Float(a as f64 / b as f64)),
                BinOp::FloorDiv | BinOp::Rem if b == 0 => Err(zero()),
                BinOp::FloorDiv => {
                    let q = a.checked_div(b).ok_or_else(overflow)?;
                    let floored = if (a % b != 0) && ((a < 0) != (b < 0)) { q - 1 } else { q };
                    Ok(Int(floored))
                }
                BinOp::Rem => {
                    let m = a.checked_rem(b).ok_or_else(overflow)?;
                    Ok(Int(if m != 0 && ((m < 0) != (b < 0)) { m + b } else { m }))
                }
                _ => Err(mismatch(&l, &r)),
            }
        }
        _ => {
            let (Some(a), Some(b)) = (numeric(&l), numeric(&r)) else {
                return Err(mismatch(&l, &r));
            };
            match op {
                BinOp::Add => Ok(Float(a + b)),
                BinOp::Sub => Ok(Float(a - b)),
                BinOp::Mul => Ok(Float(a * b)),
                BinOp::Div | BinOp::FloorDiv | BinOp::Rem if b == 0.0 => Err(zero()),
                BinOp::Div => Ok(Float(a / b)),
                BinOp::FloorDiv => Ok(Float((a / b).floor())),
                BinOp::Rem => Ok(Float(a - b * (a / b).floor())),
                _ => Err(mismatch(&l, &r)),
            }
        }
    }
}

fn numeric(p: &Payload) -> Option<f64> {
    match p {
        Payload::Int(_) | Payload::Float(_) | Payload::Bool(_) => p.as_f64(),
        _ => None,
    }
}

/// Equality with numeric promotion, so `1 == 1.0`.
fn equals(l: &Payload, r: &Payload) -> bool {
    match (numeric(l), numeric(r)) {
        (Some(a), Some(b)) => a == b,
        _ => l == r,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn eval_with(
        text: &str,
        namespaces: &HashMap<String, Arc<Namespace>>,
        locals: &HashMap<String, Value>,
    ) -> Result<Payload, TaskError> {
        let registry = Registry::new();
        let scope = Scope {
            registry: &registry,
            namespaces,
            locals,
        };
        let expr = parse_expr(text)?;
        scope.eval(text, &expr).await?.into_payload()
    }

    async fn eval(text: &str) -> Result<Payload, TaskError> {
        eval_with(text, &HashMap::new(), &HashMap::new()).await
    }

    #[test]
    fn statement_classification() {
        assert_eq!(
            parse_statement("import device").unwrap(),
            Statement::Import("device".to_string())
        );
        assert!(matches!(parse_statement("x = 1 + 2").unwrap(), Statement::Assign(name, _) if name == "x"));
        assert!(matches!(parse_statement("x == 1").unwrap(), Statement::Eval(_)));
        assert!(matches!(parse_statement("x <= 1").unwrap(), Statement::Eval(_)));
        assert!(matches!(parse_statement("f(a=1)").unwrap(), Statement::Eval(_)));
    }

    #[test]
    fn parse_errors_are_reported() {
        assert!(matches!(
            parse_expr("1 +"),
            Err(TaskError::InvalidExpression { .. })
        ));
        assert!(parse_expr("'open").is_err());
        assert!(parse_expr("a $ b").is_err());
        assert!(parse_expr("f(a=1, 2)").is_err());
    }

    #[test]
    fn deep_nesting_is_rejected() {
        let deep = format!("{}1{}", "(".repeat(10_000), ")".repeat(10_000));
        assert!(matches!(parse_expr(&deep), Err(TaskError::InvalidExpression { .. })));

        let parens = format!("{}1{}", "(".repeat(200), ")".repeat(200));
        assert!(matches!(
            parse_expr(&parens),
            Err(TaskError::InvalidExpression { reason, .. }) if reason.contains("nesting")
        ));
        let negations = format!("{}1", "-".repeat(500));
        assert!(parse_expr(&negations).is_err());
        let nots = format!("{}True", "not ".repeat(500));
        assert!(parse_expr(&nots).is_err());

        let chain = format!("{}1", "1 + ".repeat(1_000));
        assert!(matches!(
            parse_expr(&chain),
            Err(TaskError::InvalidExpression { reason, .. }) if reason.contains("deeper")
        ));

        let modest = format!("{}1{}", "(".repeat(50), ")".repeat(50));
        assert_eq!(parse_expr(&modest).unwrap(), Expr::Literal(Payload::Int(1)));
    }

    #[tokio::test]
    async fn oversized_repetition_is_a_fault() {
        assert!(matches!(
            eval("'abc' * 9223372036854775807").await,
            Err(TaskError::ExecutionFault(msg)) if msg.contains("repetition")
        ));
        assert!(matches!(
            eval("[1, 2] * 9223372036854775807").await,
            Err(TaskError::ExecutionFault(_))
        ));
        assert_eq!(eval("'ab' * 3").await.unwrap(), Payload::from("ababab"));
        assert_eq!(eval("'ab' * -1").await.unwrap(), Payload::from(""));
        assert_eq!(eval("2 * [0]").await.unwrap(), Payload::from(vec![0i64, 0]));
    }

    #[tokio::test]
    async fn arithmetic_and_precedence() {
        assert_eq!(eval("1 + 2 * 3").await.unwrap(), Payload::Int(7));
        assert_eq!(eval("(1 + 2) * 3").await.unwrap(), Payload::Int(9));
        assert_eq!(eval("7 / 2").await.unwrap(), Payload::Float(3.5));
        assert_eq!(eval("-7 // 2").await.unwrap(), Payload::Int(-4));
        assert_eq!(eval("-7 % 3").await.unwrap(), Payload::Int(2));
        assert_eq!(eval("'ab' * 2").await.unwrap(), Payload::from("abab"));
        assert!(matches!(
            eval("1 / 0").await,
            Err(TaskError::ExecutionFault(msg)) if msg.contains("division by zero")
        ));
    }

    #[tokio::test]
    async fn boolean_logic_short_circuits() {
        assert_eq!(eval("1 == 1.0 and 'x'").await.unwrap(), Payload::from("x"));
        assert_eq!(eval("0 or None").await.unwrap(), Payload::None);
        assert_eq!(eval("not []").await.unwrap(), Payload::Bool(true));
        // the right side would fail if evaluated
        assert_eq!(eval("False and undefined_name").await.unwrap(), Payload::Bool(false));
    }

    #[tokio::test]
    async fn builtins_and_classes() {
        assert_eq!(eval("len([1, 2, 3])").await.unwrap(), Payload::Int(3));
        assert_eq!(eval("max(range(5))").await.unwrap(), Payload::Int(4));
        assert_eq!(eval("text('abc').upper()").await.unwrap(), Payload::from("ABC"));
        assert_eq!(
            eval("{'a': [1, 2][-1], 'b': 'xyz'[0]}").await.unwrap(),
            Payload::Map(BTreeMap::from([
                ("a".to_string(), Payload::Int(2)),
                ("b".to_string(), Payload::from("x")),
            ]))
        );
    }

    #[tokio::test]
    async fn namespaces_and_locals() {
        let ns = Namespace::new("device")
            .function("scale", |args| {
                let v = args.get(0, "value").and_then(Payload::as_i64).unwrap_or(0);
                let k = args.get(1, "factor").and_then(Payload::as_i64).unwrap_or(1);
                Ok(Payload::Int(v * k))
            })
            .value("VERSION", "1.2");
        let namespaces = HashMap::from([("device".to_string(), Arc::new(ns))]);
        let locals = HashMap::from([("x".to_string(), Value::Data(Payload::Int(4)))]);

        assert_eq!(
            eval_with("device.scale(x, 3)", &namespaces, &locals).await.unwrap(),
            Payload::Int(12)
        );
        assert_eq!(
            eval_with("device.scale(value=2, factor=5)", &namespaces, &locals)
                .await
                .unwrap(),
            Payload::Int(10)
        );
        assert!(matches!(
            eval_with("device.VERSION()", &namespaces, &locals).await,
            Err(TaskError::NotCallable { .. })
        ));
        assert!(matches!(
            eval_with("device.reset()", &namespaces, &locals).await,
            Err(TaskError::MethodNotFound { target }) if target == "device.reset"
        ));
    }

    #[tokio::test]
    async fn non_data_cannot_leave() {
        assert!(matches!(
            eval("len").await,
            Err(TaskError::UnserializableValue { .. })
        ));
        assert!(matches!(
            eval("undefined_name").await,
            Err(TaskError::InvalidExpression { reason, .. }) if reason.contains("not defined")
        ));
    }
}
