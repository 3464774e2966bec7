//! `if: (expr) { ... } else if: (expr) { ... } else: { ... }` elision.
//!
//! Expressions are a closed integer/boolean language over permutation
//! defines: `|| or && and == != < > <= >= + - * / ! not`, parentheses,
//! integer literals and `true`/`false`. Evaluation never fails the build:
//! an unknown name or malformed expression makes the branch false.
use std::collections::HashMap;

use thiserror::Error;
use tracing::debug;

use crate::text;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvalError {
    #[error("unknown name '{0}'")]
    UnknownName(String),

    #[error("syntax error at '{0}'")]
    Syntax(String),

    #[error("division by zero")]
    DivideByZero,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Int(i64),
    Ident(String),
    Op(&'static str),
    Open,
    Close,
}

const OPERATORS: [&str; 14] = [
    "||", "&&", "==", "!=", "<=", ">=", "<", ">", "+", "-", "*", "/", "!", "%",
];

fn tokenize(expression: &str) -> Result<Vec<Token>, EvalError> {
    let bytes = expression.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;
    'scan: while pos < bytes.len() {
        let byte = bytes[pos];
        if byte.is_ascii_whitespace() {
            pos += 1;
            continue;
        }
        if byte == b'(' {
            tokens.push(Token::Open);
            pos += 1;
            continue;
        }
        if byte == b')' {
            tokens.push(Token::Close);
            pos += 1;
            continue;
        }
        if byte.is_ascii_digit() {
            let start = pos;
            while pos < bytes.len() && bytes[pos].is_ascii_digit() {
                pos += 1;
            }
            let value = expression[start..pos]
                .parse()
                .map_err(|_| EvalError::Syntax(expression[start..pos].to_string()))?;
            tokens.push(Token::Int(value));
            continue;
        }
        if text::is_ident_char(byte) {
            let start = pos;
            while pos < bytes.len() && text::is_ident_char(bytes[pos]) {
                pos += 1;
            }
            let word = &expression[start..pos];
            tokens.push(match word {
                "and" => Token::Op("&&"),
                "or" => Token::Op("||"),
                "not" => Token::Op("!"),
                _ => Token::Ident(word.to_string()),
            });
            continue;
        }
        for op in OPERATORS {
            if expression[pos..].starts_with(op) {
                tokens.push(Token::Op(op));
                pos += op.len();
                continue 'scan;
            }
        }
        return Err(EvalError::Syntax(expression[pos..].to_string()));
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    env: &'a HashMap<String, i64>,
}

impl Parser<'_> {
    fn peek_op(&self) -> Option<&'static str> {
        match self.tokens.get(self.pos) {
            Some(Token::Op(op)) => Some(*op),
            _ => None,
        }
    }

    fn eat_op(&mut self, candidates: &[&str]) -> Option<&'static str> {
        let op = self.peek_op()?;
        if candidates.contains(&op) {
            self.pos += 1;
            Some(op)
        } else {
            None
        }
    }

    fn or(&mut self) -> Result<i64, EvalError> {
        let mut value = self.and()?;
        while self.eat_op(&["||"]).is_some() {
            let rhs = self.and()?;
            value = i64::from(value != 0 || rhs != 0);
        }
        Ok(value)
    }

    fn and(&mut self) -> Result<i64, EvalError> {
        let mut value = self.equality()?;
        while self.eat_op(&["&&"]).is_some() {
            let rhs = self.equality()?;
            value = i64::from(value != 0 && rhs != 0);
        }
        Ok(value)
    }

    fn equality(&mut self) -> Result<i64, EvalError> {
        let mut value = self.relational()?;
        while let Some(op) = self.eat_op(&["==", "!="]) {
            let rhs = self.relational()?;
            value = i64::from(if op == "==" { value == rhs } else { value != rhs });
        }
        Ok(value)
    }

    fn relational(&mut self) -> Result<i64, EvalError> {
        let mut value = self.additive()?;
        while let Some(op) = self.eat_op(&["<", ">", "<=", ">="]) {
            let rhs = self.additive()?;
            value = i64::from(match op {
                "<" => value < rhs,
                ">" => value > rhs,
                "<=" => value <= rhs,
                _ => value >= rhs,
            });
        }
        Ok(value)
    }

    fn additive(&mut self) -> Result<i64, EvalError> {
        let mut value = self.multiplicative()?;
        while let Some(op) = self.eat_op(&["+", "-"]) {
            let rhs = self.multiplicative()?;
            value = if op == "+" {
                value.wrapping_add(rhs)
            } else {
                value.wrapping_sub(rhs)
            };
        }
        Ok(value)
    }

    fn multiplicative(&mut self) -> Result<i64, EvalError> {
        let mut value = self.unary()?;
        while let Some(op) = self.eat_op(&["*", "/", "%"]) {
            let rhs = self.unary()?;
            value = match op {
                "*" => value.wrapping_mul(rhs),
                _ if rhs == 0 => return Err(EvalError::DivideByZero),
                "/" => value.div_euclid(rhs),
                _ => value.rem_euclid(rhs),
            };
        }
        Ok(value)
    }

    fn unary(&mut self) -> Result<i64, EvalError> {
        if let Some(op) = self.eat_op(&["!", "-"]) {
            let value = self.unary()?;
            return Ok(if op == "!" {
                i64::from(value == 0)
            } else {
                value.wrapping_neg()
            });
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<i64, EvalError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| EvalError::Syntax("<end>".to_string()))?;
        self.pos += 1;
        match token {
            Token::Int(value) => Ok(value),
            Token::Ident(name) => match name.as_str() {
                "true" | "True" => Ok(1),
                "false" | "False" => Ok(0),
                _ => self
                    .env
                    .get(&name)
                    .copied()
                    .ok_or(EvalError::UnknownName(name)),
            },
            Token::Open => {
                let value = self.or()?;
                match self.tokens.get(self.pos) {
                    Some(Token::Close) => {
                        self.pos += 1;
                        Ok(value)
                    }
                    _ => Err(EvalError::Syntax("missing ')'".to_string())),
                }
            }
            Token::Close => Err(EvalError::Syntax(")".to_string())),
            Token::Op(op) => Err(EvalError::Syntax(op.to_string())),
        }
    }
}

pub fn evaluate(expression: &str, env: &HashMap<String, i64>) -> Result<i64, EvalError> {
    let tokens = tokenize(expression)?;
    if tokens.is_empty() {
        return Err(EvalError::Syntax("<empty>".to_string()));
    }
    let mut parser = Parser { tokens, pos: 0, env };
    let value = parser.or()?;
    match parser.tokens.get(parser.pos) {
        None => Ok(value),
        Some(token) => Err(EvalError::Syntax(format!("{token:?}"))),
    }
}

/// Truthiness of `expression`; any evaluation error counts as false.
pub fn is_truthy(expression: &str, env: &HashMap<String, i64>) -> bool {
    match evaluate(expression, env) {
        Ok(value) => value != 0,
        Err(err) => {
            debug!(expression, error = %err, "conditional treated as false");
            false
        }
    }
}

/// The expression inside a `permutation(<expr>)` manifest key.
pub fn conditional_key_expression(key: &str) -> Option<&str> {
    let trimmed = key.trim();
    let rest = trimmed.strip_prefix("permutation")?.trim_start();
    if !rest.starts_with('(') {
        return None;
    }
    let close = text::match_paren(rest, 0)?;
    Some(&rest[1..close])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marker {
    If,
    ElseIf,
    Else,
}

/// Next marker at or after `from`: `(kind, start, end_of_marker)`.
fn next_marker(source: &str, from: usize) -> Option<(Marker, usize, usize)> {
    let bytes = source.as_bytes();
    let mut cursor = from;
    loop {
        let if_pos = text::find_token_from(source, "if", cursor);
        let else_pos = text::find_token_from(source, "else", cursor);
        let (pos, is_else) = match (if_pos, else_pos) {
            (None, None) => return None,
            (Some(i), Some(e)) if e < i => (e, true),
            (Some(i), _) => (i, false),
            (None, Some(e)) => (e, true),
        };

        if !is_else {
            if bytes.get(pos + 2) == Some(&b':') {
                return Some((Marker::If, pos, pos + 3));
            }
            cursor = pos + 2;
            continue;
        }

        let after = pos + 4;
        if bytes.get(after) == Some(&b':') {
            return Some((Marker::Else, pos, after + 1));
        }
        let mut next = after;
        while next < bytes.len() && bytes[next].is_ascii_whitespace() {
            next += 1;
        }
        if next > after && source[next..].starts_with("if:") {
            return Some((Marker::ElseIf, pos, next + 3));
        }
        cursor = after;
    }
}

/// Resolves every conditional chain against `env`. The result never contains
/// an `if:`, `else if:` or `else:` marker; nested chains inside a selected
/// body are resolved too.
pub fn evaluate_conditional_blocks(source: &str, env: &HashMap<String, i64>) -> String {
    let mut output = String::with_capacity(source.len());
    let mut cursor = 0;
    let mut chain_accepted = false;

    while let Some((marker, start, marker_end)) = next_marker(source, cursor) {
        output.push_str(&source[cursor..start]);

        let (condition, body_search) = match marker {
            Marker::Else => (None, marker_end),
            Marker::If | Marker::ElseIf => {
                let Some(open) = text::find_byte_from(source, b'(', marker_end) else {
                    cursor = marker_end;
                    continue;
                };
                let Some(close) = text::match_paren(source, open) else {
                    cursor = marker_end;
                    continue;
                };
                (Some(&source[open + 1..close]), close + 1)
            }
        };

        let Some(body_open) = text::find_byte_from(source, b'{', body_search) else {
            cursor = marker_end;
            continue;
        };
        let Some(body_close) = text::match_brace(source, body_open) else {
            cursor = marker_end;
            continue;
        };

        if marker == Marker::If {
            chain_accepted = false;
        }

        if !chain_accepted {
            let selected = match condition {
                None => true,
                Some(expression) => is_truthy(&expression.replace('\n', " "), env),
            };
            if selected {
                chain_accepted = true;
                let body = &source[body_open + 1..body_close];
                output.push_str(&evaluate_conditional_blocks(body, env));
            }
        }
        cursor = body_close + 1;
    }

    output.push_str(&source[cursor..]);
    output
}
