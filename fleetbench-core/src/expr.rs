//! Property expressions.
//!
//! A property string may embed `${name}` / `${name:default}` variable references and
//! `#{ ... }` arithmetic. When the whole string is a single reference, the result keeps its type
//! (`"${threads}"` with `threads = 4` yields the integer 4); otherwise every piece is rendered and
//! concatenated.
//!
//! Inside `#{ ... }`:
//! - integers, floats, `'strings'`, `[lists]`, parentheses and unary minus
//! - `+ - * / %`; integer operands stay integer, anything else is computed as float
//! - `${var}` references and bare variable paths such as `repeat.counter`
//! - `.size` and `.get(i)` (or `[i]`) on lists

use fleetbench_value::Value;

use crate::env::VariableEnvironment;

const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExprError {
    #[error("undefined variable `{0}`")]
    UndefinedVariable(String),

    #[error("unterminated `{opener}{{` starting at offset {offset}")]
    Unterminated { opener: char, offset: usize },

    #[error("syntax error at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },

    #[error("division by zero")]
    DivisionByZero,

    #[error("integer overflow")]
    Overflow,

    #[error("cannot apply `{op}` to {left} and {right}")]
    TypeMismatch {
        op: &'static str,
        left: &'static str,
        right: &'static str,
    },

    #[error("index {index} out of bounds for a list of {len}")]
    IndexOutOfBounds { index: i64, len: usize },

    #[error("expression nested too deeply")]
    TooDeep,
}

pub type Result<T> = std::result::Result<T, ExprError>;

/// Resolves every expression inside `raw`; lists are resolved element-wise, other values are
/// returned as they are.
pub fn evaluate_value(raw: &Value, env: &VariableEnvironment) -> Result<Value> {
    match raw {
        Value::String(s) => evaluate(s, env),
        Value::List(items) => items
            .iter()
            .map(|v| evaluate_value(v, env))
            .collect::<Result<Vec<_>>>()
            .map(Value::List),
        other => Ok(other.clone()),
    }
}

pub fn evaluate(template: &str, env: &VariableEnvironment) -> Result<Value> {
    let pieces = split_template(template)?;

    if let [piece] = pieces.as_slice()
        && !matches!(piece, Piece::Literal(_))
    {
        return piece.evaluate(env);
    }
    if pieces.iter().all(|p| matches!(p, Piece::Literal(_))) {
        return Ok(Value::string(template));
    }

    let mut out = String::with_capacity(template.len());
    for piece in &pieces {
        match piece {
            Piece::Literal(text) => out.push_str(text),
            other => out.push_str(&other.evaluate(env)?.to_string()),
        }
    }
    Ok(Value::from(out))
}

pub fn contains_expression(s: &str) -> bool {
    s.contains("${") || s.contains("#{")
}

#[derive(Debug)]
enum Piece<'a> {
    Literal(&'a str),
    Variable { name: &'a str, default: Option<&'a str> },
    Expression { body: &'a str, offset: usize },
}

impl Piece<'_> {
    fn evaluate(&self, env: &VariableEnvironment) -> Result<Value> {
        match self {
            Self::Literal(text) => Ok(Value::string(text)),
            Self::Variable { name, default } => lookup(env, name, *default),
            Self::Expression { body, offset } => {
                let tokens = tokenize(body, *offset)?;
                let mut parser = Parser {
                    tokens,
                    pos: 0,
                    env,
                    depth: 0,
                    end: offset + body.len(),
                };
                let value = parser.expr()?;
                match parser.tokens.get(parser.pos) {
                    None => Ok(value),
                    Some((at, _)) => Err(syntax(*at, "unexpected trailing input")),
                }
            }
        }
    }
}

fn lookup(env: &VariableEnvironment, name: &str, default: Option<&str>) -> Result<Value> {
    match (env.get(name), default) {
        (Some(v), _) => Ok(v.clone()),
        (None, Some(d)) => Ok(Value::parse_literal(d)),
        (None, None) => Err(ExprError::UndefinedVariable(name.to_string())),
    }
}

fn split_template(template: &str) -> Result<Vec<Piece<'_>>> {
    let bytes = template.as_bytes();
    let mut pieces = Vec::new();
    let mut literal_start = 0;
    let mut i = 0;

    while i + 1 < bytes.len() {
        let opener = bytes[i];
        if !(opener == b'$' || opener == b'#') || bytes[i + 1] != b'{' {
            i += 1;
            continue;
        }

        let close = closing_brace(bytes, i + 2).ok_or(ExprError::Unterminated {
            opener: opener as char,
            offset: i,
        })?;
        if literal_start < i {
            pieces.push(Piece::Literal(&template[literal_start..i]));
        }

        let body = &template[i + 2..close];
        pieces.push(if opener == b'$' {
            let (name, default) = split_variable(body);
            Piece::Variable { name, default }
        } else {
            Piece::Expression {
                body,
                offset: i + 2,
            }
        });

        i = close + 1;
        literal_start = i;
    }

    if literal_start < template.len() {
        pieces.push(Piece::Literal(&template[literal_start..]));
    }
    Ok(pieces)
}

fn closing_brace(bytes: &[u8], from: usize) -> Option<usize> {
    let mut depth = 1usize;
    for (j, b) in bytes.iter().enumerate().skip(from) {
        match b {
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(j);
                }
            }
            _ => {}
        }
    }
    None
}

fn split_variable(body: &str) -> (&str, Option<&str>) {
    match body.split_once(':') {
        Some((name, default)) => (name.trim(), Some(default)),
        None => (body.trim(), None),
    }
}

fn syntax(offset: usize, message: impl Into<String>) -> ExprError {
    ExprError::Syntax {
        offset,
        message: message.into(),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Var { name: String, default: Option<String> },
    Ident(String),
    Punct(char),
}

fn tokenize(src: &str, base: usize) -> Result<Vec<(usize, Token)>> {
    let bytes = src.as_bytes();
    let len = bytes.len();
    let mut out = Vec::new();
    let mut i = 0;

    while i < len {
        let c = bytes[i];
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }

        let start = i;
        let token = match c {
            b'0'..=b'9' => {
                while i < len && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                let float = i + 1 < len && bytes[i] == b'.' && bytes[i + 1].is_ascii_digit();
                if float {
                    i += 1;
                    while i < len && bytes[i].is_ascii_digit() {
                        i += 1;
                    }
                    let text = &src[start..i];
                    Token::Float(
                        text.parse()
                            .map_err(|_| syntax(base + start, format!("invalid number `{text}`")))?,
                    )
                } else {
                    Token::Int(src[start..i].parse().map_err(|_| ExprError::Overflow)?)
                }
            }
            b'\'' | b'"' => {
                i += 1;
                let body_start = i;
                while i < len && bytes[i] != c {
                    i += 1;
                }
                if i >= len {
                    return Err(syntax(base + start, "unterminated string literal"));
                }
                let text = src[body_start..i].to_string();
                i += 1;
                Token::Str(text)
            }
            b'$' if bytes.get(i + 1) == Some(&b'{') => {
                let close = closing_brace(bytes, i + 2).ok_or(ExprError::Unterminated {
                    opener: '$',
                    offset: base + i,
                })?;
                let (name, default) = split_variable(&src[i + 2..close]);
                i = close + 1;
                Token::Var {
                    name: name.to_string(),
                    default: default.map(str::to_string),
                }
            }
            c if c.is_ascii_alphabetic() || c == b'_' => {
                while i < len && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                Token::Ident(src[start..i].to_string())
            }
            b'+' | b'-' | b'*' | b'/' | b'%' | b'(' | b')' | b'[' | b']' | b',' | b'.' => {
                i += 1;
                Token::Punct(c as char)
            }
            _ => {
                let ch = src[start..].chars().next().unwrap_or('?');
                return Err(syntax(base + start, format!("unexpected character `{ch}`")));
            }
        };
        out.push((base + start, token));
    }

    Ok(out)
}

struct Parser<'e> {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    env: &'e VariableEnvironment,
    depth: usize,
    end: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn peek_at(&self, ahead: usize) -> Option<&Token> {
        self.tokens.get(self.pos + ahead).map(|(_, t)| t)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map_or(self.end, |(at, _)| *at)
    }

    fn eat(&mut self, ch: char) -> bool {
        if self.peek() == Some(&Token::Punct(ch)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, ch: char) -> Result<()> {
        if self.eat(ch) {
            Ok(())
        } else {
            Err(syntax(self.offset(), format!("expected `{ch}`")))
        }
    }

    fn descend(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ExprError::TooDeep);
        }
        Ok(())
    }

    fn expr(&mut self) -> Result<Value> {
        let mut left = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Punct(c @ ('+' | '-'))) => *c,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.term()?;
            left = arithmetic(op, left, right)?;
        }
    }

    fn term(&mut self) -> Result<Value> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Punct(c @ ('*' | '/' | '%'))) => *c,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.unary()?;
            left = arithmetic(op, left, right)?;
        }
    }

    fn unary(&mut self) -> Result<Value> {
        if self.eat('-') {
            self.descend()?;
            let value = self.unary()?;
            self.depth -= 1;
            return match value {
                Value::I64(v) => v.checked_neg().map(Value::I64).ok_or(ExprError::Overflow),
                Value::F64(v) => Ok(Value::F64(-v)),
                other => Err(ExprError::TypeMismatch {
                    op: "-",
                    left: "nothing",
                    right: other.type_name(),
                }),
            };
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Value> {
        let mut value = self.primary()?;
        loop {
            if self.eat('[') {
                let index = self.expr()?;
                self.expect(']')?;
                value = element(&value, &index)?;
                continue;
            }

            if self.peek() != Some(&Token::Punct('.')) {
                return Ok(value);
            }
            match self.peek_at(1) {
                Some(Token::Ident(m)) if m == "size" => {
                    self.pos += 2;
                    value = size(&value)?;
                }
                Some(Token::Ident(m)) if m == "get" => {
                    self.pos += 2;
                    self.expect('(')?;
                    let index = self.expr()?;
                    self.expect(')')?;
                    value = element(&value, &index)?;
                }
                _ => return Err(syntax(self.offset(), "expected `.size` or `.get(i)`")),
            }
        }
    }

    fn primary(&mut self) -> Result<Value> {
        let offset = self.offset();
        let Some((_, token)) = self.tokens.get(self.pos).cloned() else {
            return Err(syntax(offset, "unexpected end of expression"));
        };
        self.pos += 1;

        match token {
            Token::Int(v) => Ok(Value::I64(v)),
            Token::Float(v) => Ok(Value::F64(v)),
            Token::Str(s) => Ok(Value::from(s)),
            Token::Var { name, default } => lookup(self.env, &name, default.as_deref()),
            Token::Ident(first) => match first.as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => {
                    let path = self.variable_path(first);
                    lookup(self.env, &path, None)
                }
            },
            Token::Punct('(') => {
                self.descend()?;
                let value = self.expr()?;
                self.expect(')')?;
                self.depth -= 1;
                Ok(value)
            }
            Token::Punct('[') => {
                self.descend()?;
                let mut items = Vec::new();
                if !self.eat(']') {
                    loop {
                        items.push(self.expr()?);
                        if self.eat(']') {
                            break;
                        }
                        self.expect(',')?;
                    }
                }
                self.depth -= 1;
                Ok(Value::List(items))
            }
            Token::Punct(c) => Err(syntax(offset, format!("unexpected `{c}`"))),
        }
    }

    /// Joins `a.b.c` into one variable name, stopping before `.size` and `.get`.
    fn variable_path(&mut self, first: String) -> String {
        let mut path = first;
        while self.peek() == Some(&Token::Punct('.')) {
            match self.peek_at(1) {
                Some(Token::Ident(seg)) if seg != "size" && seg != "get" => {
                    path.push('.');
                    path.push_str(seg);
                    self.pos += 2;
                }
                _ => break,
            }
        }
        path
    }
}

fn op_name(op: char) -> &'static str {
    match op {
        '+' => "+",
        '-' => "-",
        '*' => "*",
        '/' => "/",
        _ => "%",
    }
}

fn arithmetic(op: char, left: Value, right: Value) -> Result<Value> {
    match (&left, &right) {
        (Value::I64(a), Value::I64(b)) => integer_op(op, *a, *b),
        (l, r) if l.is_number() && r.is_number() => {
            let (a, b) = (l.as_f64().unwrap_or(0.0), r.as_f64().unwrap_or(0.0));
            float_op(op, a, b)
        }
        (Value::String(_), _) | (_, Value::String(_)) if op == '+' => {
            Ok(Value::from(format!("{left}{right}")))
        }
        (Value::List(a), Value::List(b)) if op == '+' => {
            Ok(Value::List(a.iter().chain(b.iter()).cloned().collect()))
        }
        _ => Err(ExprError::TypeMismatch {
            op: op_name(op),
            left: left.type_name(),
            right: right.type_name(),
        }),
    }
}

fn integer_op(op: char, a: i64, b: i64) -> Result<Value> {
    let out = match op {
        '+' => a.checked_add(b),
        '-' => a.checked_sub(b),
        '*' => a.checked_mul(b),
        '/' | '%' if b == 0 => return Err(ExprError::DivisionByZero),
        '/' => a.checked_div(b),
        _ => a.checked_rem(b),
    };
    out.map(Value::I64).ok_or(ExprError::Overflow)
}

fn float_op(op: char, a: f64, b: f64) -> Result<Value> {
    let out = match op {
        '+' => a + b,
        '-' => a - b,
        '*' => a * b,
        '/' | '%' if b == 0.0 => return Err(ExprError::DivisionByZero),
        '/' => a / b,
        _ => a % b,
    };
    Ok(Value::F64(out))
}

fn size(value: &Value) -> Result<Value> {
    match value {
        Value::List(items) => Ok(Value::from(items.len())),
        Value::String(s) => Ok(Value::from(s.chars().count())),
        other => Err(ExprError::TypeMismatch {
            op: ".size",
            left: other.type_name(),
            right: "nothing",
        }),
    }
}

fn element(value: &Value, index: &Value) -> Result<Value> {
    let Value::List(items) = value else {
        return Err(ExprError::TypeMismatch {
            op: ".get",
            left: value.type_name(),
            right: index.type_name(),
        });
    };
    let Some(i) = index.as_i64() else {
        return Err(ExprError::TypeMismatch {
            op: ".get",
            left: value.type_name(),
            right: index.type_name(),
        });
    };

    usize::try_from(i)
        .ok()
        .and_then(|idx| items.get(idx))
        .cloned()
        .ok_or(ExprError::IndexOutOfBounds {
            index: i,
            len: items.len(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> VariableEnvironment {
        [
            ("threads", Value::I64(4)),
            ("ratio", Value::F64(0.5)),
            ("name", Value::string("grid")),
            (
                "sizes",
                Value::List(vec![Value::I64(10), Value::I64(20), Value::I64(30)]),
            ),
            ("repeat.counter", Value::I64(2)),
        ]
        .into_iter()
        .collect()
    }

    fn eval(s: &str) -> Value {
        evaluate(s, &env()).unwrap_or_else(|e| panic!("`{s}` failed: {e}"))
    }

    fn eval_err(s: &str) -> ExprError {
        match evaluate(s, &env()) {
            Ok(v) => panic!("`{s}` should fail, got {v:?}"),
            Err(e) => e,
        }
    }

    #[test]
    fn whole_reference_keeps_type() {
        assert_eq!(eval("${threads}"), Value::I64(4));
        assert_eq!(eval("${ratio}"), Value::F64(0.5));
        assert_eq!(eval("#{ ${threads} * 2 }"), Value::I64(8));
    }

    #[test]
    fn mixed_text_is_interpolated() {
        assert_eq!(eval("t-${threads}-${name}"), Value::string("t-4-grid"));
        assert_eq!(eval("x#{ 1 + 1 }y"), Value::string("x2y"));
        assert_eq!(eval("plain text"), Value::string("plain text"));
    }

    #[test]
    fn defaults_apply_only_when_unbound() {
        assert_eq!(eval("${missing:7}"), Value::I64(7));
        assert_eq!(eval("${threads:7}"), Value::I64(4));
        assert_eq!(eval("${missing:abc}"), Value::string("abc"));
        assert_eq!(
            eval_err("${missing}"),
            ExprError::UndefinedVariable("missing".to_string())
        );
    }

    #[test]
    fn arithmetic_follows_precedence() {
        assert_eq!(eval("#{ 1 + 2 * 3 }"), Value::I64(7));
        assert_eq!(eval("#{ (1 + 2) * 3 }"), Value::I64(9));
        assert_eq!(eval("#{ 7 / 2 }"), Value::I64(3));
        assert_eq!(eval("#{ 7 % 4 }"), Value::I64(3));
        assert_eq!(eval("#{ -${threads} + 1 }"), Value::I64(-3));
        assert_eq!(eval("#{ 7.0 / 2 }"), Value::F64(3.5));
        assert_eq!(eval("#{ ${ratio} * ${threads} }"), Value::F64(2.0));
    }

    #[test]
    fn list_operations() {
        assert_eq!(eval("#{ ${sizes}.size }"), Value::I64(3));
        assert_eq!(eval("#{ ${sizes}.get(1) }"), Value::I64(20));
        assert_eq!(eval("#{ ${sizes}[repeat.counter] }"), Value::I64(30));
        assert_eq!(eval("#{ [1, 2].size + 1 }"), Value::I64(3));
        assert!(matches!(
            eval_err("#{ ${sizes}.get(3) }"),
            ExprError::IndexOutOfBounds { index: 3, len: 3 }
        ));
    }

    #[test]
    fn bare_paths_resolve_variables() {
        assert_eq!(eval("#{ repeat.counter * 10 }"), Value::I64(20));
    }

    #[test]
    fn errors_are_reported() {
        assert_eq!(eval_err("#{ 1 / 0 }"), ExprError::DivisionByZero);
        assert_eq!(eval_err("#{ 1.5 % 0 }"), ExprError::DivisionByZero);
        assert!(matches!(eval_err("#{ 1 + }"), ExprError::Syntax { .. }));
        assert!(matches!(eval_err("#{ 1 2 }"), ExprError::Syntax { .. }));
        assert!(matches!(eval_err("${threads"), ExprError::Unterminated { .. }));
        assert!(matches!(
            eval_err("#{ [1] * 2 }"),
            ExprError::TypeMismatch { op: "*", .. }
        ));
        assert_eq!(
            eval_err("#{ 9223372036854775807 + 1 }"),
            ExprError::Overflow
        );
    }

    #[test]
    fn deep_nesting_is_rejected() {
        let src = format!("#{{ {}1{} }}", "(".repeat(100), ")".repeat(100));
        assert_eq!(eval_err(&src), ExprError::TooDeep);
    }

    #[test]
    fn lists_resolve_element_wise() {
        let raw = Value::List(vec![Value::string("${threads}"), Value::I64(1)]);
        let out = evaluate_value(&raw, &env()).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(out, Value::List(vec![Value::I64(4), Value::I64(1)]));
    }
}
