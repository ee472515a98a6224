// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 表达式模块
//!
//! `<%= ... %>` 内部的表达式语言：字面量、变量路径、`+` 运算以及过滤器。
//! 表达式在编译阶段被解析为语法树，执行阶段由 [`Expr::eval`] 在变量环境上求值。

use std::{collections::BTreeSet, collections::HashMap, fmt};

use serde_json::{Number, Value};

use crate::{
    exception::{Fault, FaultKind},
    param::MAX_EXPR_DEPTH,
    util::escape_html,
};

/// 变量绑定环境：变量名到值的映射
pub type Environment = HashMap<String, Value>;

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Upper,
    Lower,
    Trim,
    Escape,
    Length,
    Json,
    Int,
    Default(Box<Expr>),
}

impl Filter {
    pub fn name(&self) -> &'static str {
        match self {
            Filter::Upper => "upper",
            Filter::Lower => "lower",
            Filter::Trim => "trim",
            Filter::Escape => "escape",
            Filter::Length => "length",
            Filter::Json => "json",
            Filter::Int => "int",
            Filter::Default(_) => "default",
        }
    }
}

/// 表达式语法树
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Literal),
    Variable(String),
    Attribute(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Add(Box<Expr>, Box<Expr>),
    Filter(Box<Expr>, Filter),
}

/// 表达式内部的语法错误，列号从 1 开始，相对于表达式文本
#[derive(Debug, Clone, PartialEq)]
pub struct SyntaxError {
    pub column: usize,
    pub message: String,
}

impl fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "column {}: {}", self.column, self.message)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    Float(f64),
    Dot,
    Comma,
    Pipe,
    Plus,
    LParen,
    RParen,
    LBracket,
    RBracket,
}

fn syntax_error<T>(column: usize, message: impl Into<String>) -> Result<T, SyntaxError> {
    Err(SyntaxError {
        column,
        message: message.into(),
    })
}

fn tokenize(source: &str) -> Result<Vec<(usize, Token)>, SyntaxError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let column = i + 1;
        match c {
            ' ' | '\t' | '\r' | '\n' => {
                i += 1;
                continue;
            }
            '.' => tokens.push((column, Token::Dot)),
            ',' => tokens.push((column, Token::Comma)),
            '|' => tokens.push((column, Token::Pipe)),
            '+' => tokens.push((column, Token::Plus)),
            '(' => tokens.push((column, Token::LParen)),
            ')' => tokens.push((column, Token::RParen)),
            '[' => tokens.push((column, Token::LBracket)),
            ']' => tokens.push((column, Token::RBracket)),
            '\'' | '"' => {
                let quote = c;
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return syntax_error(column, "unterminated string literal"),
                        Some(&ch) if ch == quote => break,
                        Some('\\') => {
                            let escaped = match chars.get(i + 1) {
                                Some('n') => '\n',
                                Some('t') => '\t',
                                Some('\\') => '\\',
                                Some('\'') => '\'',
                                Some('"') => '"',
                                Some(other) => {
                                    return syntax_error(
                                        i + 1,
                                        format!("unknown escape sequence \\{}", other),
                                    )
                                }
                                None => {
                                    return syntax_error(column, "unterminated string literal")
                                }
                            };
                            value.push(escaped);
                            i += 2;
                            continue;
                        }
                        Some(&ch) => value.push(ch),
                    }
                    i += 1;
                }
                tokens.push((column, Token::Str(value)));
            }
            '0'..='9' => {
                let start = i;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                let mut is_float = false;
                if i + 1 < chars.len() && chars[i] == '.' && chars[i + 1].is_ascii_digit() {
                    is_float = true;
                    i += 1;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
                let text: String = chars[start..i].iter().collect();
                let token = if is_float {
                    match text.parse::<f64>() {
                        Ok(v) => Token::Float(v),
                        Err(_) => return syntax_error(column, format!("invalid number {}", text)),
                    }
                } else {
                    match text.parse::<i64>() {
                        Ok(v) => Token::Int(v),
                        Err(_) => {
                            return syntax_error(column, format!("integer {} is too large", text))
                        }
                    }
                };
                tokens.push((column, token));
                continue;
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push((column, Token::Ident(chars[start..i].iter().collect())));
                continue;
            }
            other => return syntax_error(column, format!("unexpected character '{}'", other)),
        }
        i += 1;
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    end_column: usize,
    nesting: usize,
}

/// 语法树及其深度（叶子节点深度为 1）
type Node = (Expr, usize);

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn column(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|(c, _)| *c)
            .unwrap_or(self.end_column)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<(), SyntaxError> {
        let column = self.column();
        match self.next() {
            Some(ref t) if *t == expected => Ok(()),
            _ => syntax_error(column, format!("expected {}", what)),
        }
    }

    fn check_depth(column: usize, depth: usize) -> Result<usize, SyntaxError> {
        if depth > MAX_EXPR_DEPTH {
            syntax_error(column, "expression nested too deeply")
        } else {
            Ok(depth)
        }
    }

    /// 括号、下标与过滤器参数中的子表达式
    fn parse_nested(&mut self) -> Result<Node, SyntaxError> {
        if self.nesting >= MAX_EXPR_DEPTH {
            return syntax_error(self.column(), "expression nested too deeply");
        }
        self.nesting += 1;
        let node = self.parse_pipeline();
        self.nesting -= 1;
        node
    }

    fn parse_pipeline(&mut self) -> Result<Node, SyntaxError> {
        let (mut expr, mut depth) = self.parse_sum()?;
        while self.peek() == Some(&Token::Pipe) {
            self.pos += 1;
            let column = self.column();
            let name = match self.next() {
                Some(Token::Ident(name)) => name,
                _ => return syntax_error(column, "expected filter name after '|'"),
            };
            let mut args = Vec::new();
            let mut arg_depth = 0;
            if self.peek() == Some(&Token::LParen) {
                self.pos += 1;
                if self.peek() != Some(&Token::RParen) {
                    loop {
                        let (arg, d) = self.parse_nested()?;
                        args.push(arg);
                        arg_depth = arg_depth.max(d);
                        if self.peek() == Some(&Token::Comma) {
                            self.pos += 1;
                        } else {
                            break;
                        }
                    }
                }
                self.expect(Token::RParen, "')' to close filter arguments")?;
            }
            let filter = build_filter(&name, args, column)?;
            depth = Self::check_depth(column, depth.max(arg_depth) + 1)?;
            expr = Expr::Filter(Box::new(expr), filter);
        }
        Ok((expr, depth))
    }

    fn parse_sum(&mut self) -> Result<Node, SyntaxError> {
        let (mut expr, mut depth) = self.parse_postfix()?;
        while self.peek() == Some(&Token::Plus) {
            let column = self.column();
            self.pos += 1;
            let (rhs, rhs_depth) = self.parse_postfix()?;
            depth = Self::check_depth(column, depth.max(rhs_depth) + 1)?;
            expr = Expr::Add(Box::new(expr), Box::new(rhs));
        }
        Ok((expr, depth))
    }

    fn parse_postfix(&mut self) -> Result<Node, SyntaxError> {
        let (mut expr, mut depth) = self.parse_primary()?;
        loop {
            let column = self.column();
            match self.peek() {
                Some(Token::Dot) => {
                    self.pos += 1;
                    let name_column = self.column();
                    match self.next() {
                        Some(Token::Ident(name)) => {
                            depth = Self::check_depth(column, depth + 1)?;
                            expr = Expr::Attribute(Box::new(expr), name);
                        }
                        _ => return syntax_error(name_column, "expected attribute name after '.'"),
                    }
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    let (index, index_depth) = self.parse_nested()?;
                    self.expect(Token::RBracket, "']'")?;
                    depth = Self::check_depth(column, depth.max(index_depth) + 1)?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                _ => return Ok((expr, depth)),
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Node, SyntaxError> {
        let column = self.column();
        let expr = match self.next() {
            Some(Token::Str(s)) => Expr::Literal(Literal::Str(s)),
            Some(Token::Int(v)) => Expr::Literal(Literal::Int(v)),
            Some(Token::Float(v)) => Expr::Literal(Literal::Float(v)),
            Some(Token::Ident(name)) => match name.as_str() {
                "true" => Expr::Literal(Literal::Bool(true)),
                "false" => Expr::Literal(Literal::Bool(false)),
                "null" => Expr::Literal(Literal::Null),
                _ => Expr::Variable(name),
            },
            Some(Token::LParen) => {
                let node = self.parse_nested()?;
                self.expect(Token::RParen, "')'")?;
                return Ok(node);
            }
            Some(other) => return syntax_error(column, format!("unexpected token {:?}", other)),
            None => return syntax_error(column, "unexpected end of expression"),
        };
        Ok((expr, 1))
    }
}

fn build_filter(name: &str, mut args: Vec<Expr>, column: usize) -> Result<Filter, SyntaxError> {
    let filter = match name {
        "upper" => Filter::Upper,
        "lower" => Filter::Lower,
        "trim" => Filter::Trim,
        "escape" => Filter::Escape,
        "length" => Filter::Length,
        "json" => Filter::Json,
        "int" => Filter::Int,
        "default" => {
            if args.len() != 1 {
                return syntax_error(column, "filter 'default' takes exactly one argument");
            }
            return Ok(Filter::Default(Box::new(args.remove(0))));
        }
        _ => return syntax_error(column, format!("unknown filter '{}'", name)),
    };
    if !args.is_empty() {
        return syntax_error(column, format!("filter '{}' takes no arguments", name));
    }
    Ok(filter)
}

/// 解析一段表达式文本。语法树深度超过 [`MAX_EXPR_DEPTH`] 时返回语法错误。
pub fn parse(source: &str) -> Result<Expr, SyntaxError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        end_column: source.chars().count() + 1,
        nesting: 0,
    };
    let (expr, _) = parser.parse_pipeline()?;
    if parser.pos < parser.tokens.len() {
        return syntax_error(parser.column(), "unexpected trailing input");
    }
    Ok(expr)
}

/// 把值转换为输出文本：字符串原样输出，`null` 输出为空
pub fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn float_value(v: f64) -> Result<Value, Fault> {
    Number::from_f64(v)
        .map(Value::Number)
        .ok_or_else(|| Fault::new(FaultKind::InvalidValue, format!("{} is not a finite number", v)))
}

fn add(lhs: Value, rhs: Value) -> Result<Value, Fault> {
    match (&lhs, &rhs) {
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(x), Some(y)) => x
                .checked_add(y)
                .map(Value::from)
                .ok_or_else(|| Fault::new(FaultKind::InvalidValue, "integer overflow in '+'")),
            _ => float_value(a.as_f64().unwrap_or(f64::NAN) + b.as_f64().unwrap_or(f64::NAN)),
        },
        (Value::String(_), _) | (_, Value::String(_)) => {
            Ok(Value::String(stringify(&lhs) + &stringify(&rhs)))
        }
        _ => Err(Fault::new(
            FaultKind::TypeMismatch,
            format!(
                "unsupported operand types for '+': {} and {}",
                type_name(&lhs),
                type_name(&rhs)
            ),
        )),
    }
}

impl Expr {
    /// 在给定环境中求值
    pub fn eval(&self, env: &Environment) -> Result<Value, Fault> {
        match self {
            Expr::Literal(lit) => match lit {
                Literal::Null => Ok(Value::Null),
                Literal::Bool(b) => Ok(Value::Bool(*b)),
                Literal::Int(v) => Ok(Value::from(*v)),
                Literal::Float(v) => float_value(*v),
                Literal::Str(s) => Ok(Value::String(s.clone())),
            },
            Expr::Variable(name) => env.get(name).cloned().ok_or_else(|| {
                Fault::new(
                    FaultKind::UndefinedVariable,
                    format!("name '{}' is not defined", name),
                )
            }),
            Expr::Attribute(target, key) => match target.eval(env)? {
                Value::Object(mut map) => map.remove(key).ok_or_else(|| {
                    Fault::new(FaultKind::MissingKey, format!("no attribute '{}'", key))
                }),
                other => Err(Fault::new(
                    FaultKind::TypeMismatch,
                    format!("{} has no attribute '{}'", type_name(&other), key),
                )),
            },
            Expr::Index(target, index) => {
                let target = target.eval(env)?;
                let index = index.eval(env)?;
                match (target, index) {
                    (Value::Object(mut map), Value::String(key)) => {
                        map.remove(&key).ok_or_else(|| {
                            Fault::new(FaultKind::MissingKey, format!("key '{}' not found", key))
                        })
                    }
                    (Value::Array(mut items), Value::Number(n)) => {
                        let len = items.len();
                        match n.as_u64() {
                            Some(i) if (i as usize) < len => Ok(items.swap_remove(i as usize)),
                            _ => Err(Fault::new(
                                FaultKind::MissingKey,
                                format!("index {} out of range for array of length {}", n, len),
                            )),
                        }
                    }
                    (target, index) => Err(Fault::new(
                        FaultKind::TypeMismatch,
                        format!(
                            "{} cannot be indexed by {}",
                            type_name(&target),
                            type_name(&index)
                        ),
                    )),
                }
            }
            Expr::Add(lhs, rhs) => add(lhs.eval(env)?, rhs.eval(env)?),
            Expr::Filter(inner, Filter::Default(fallback)) => match inner.eval(env) {
                Ok(Value::Null) => fallback.eval(env),
                Ok(v) => Ok(v),
                Err(f) if matches!(f.kind, FaultKind::UndefinedVariable | FaultKind::MissingKey) => {
                    fallback.eval(env)
                }
                Err(f) => Err(f),
            },
            Expr::Filter(inner, filter) => apply_filter(filter, inner.eval(env)?),
        }
    }

    /// 收集表达式引用的根变量名
    pub fn collect_names(&self, names: &mut BTreeSet<String>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Variable(name) => {
                names.insert(name.clone());
            }
            Expr::Attribute(target, _) => target.collect_names(names),
            Expr::Index(target, index) => {
                target.collect_names(names);
                index.collect_names(names);
            }
            Expr::Add(lhs, rhs) => {
                lhs.collect_names(names);
                rhs.collect_names(names);
            }
            Expr::Filter(inner, filter) => {
                inner.collect_names(names);
                if let Filter::Default(fallback) = filter {
                    fallback.collect_names(names);
                }
            }
        }
    }
}

fn apply_filter(filter: &Filter, value: Value) -> Result<Value, Fault> {
    match filter {
        Filter::Upper => Ok(Value::String(stringify(&value).to_uppercase())),
        Filter::Lower => Ok(Value::String(stringify(&value).to_lowercase())),
        Filter::Trim => Ok(Value::String(stringify(&value).trim().to_string())),
        Filter::Escape => Ok(Value::String(escape_html(&stringify(&value)))),
        Filter::Json => Ok(Value::String(value.to_string())),
        Filter::Length => match &value {
            Value::String(s) => Ok(Value::from(s.chars().count() as u64)),
            Value::Array(items) => Ok(Value::from(items.len() as u64)),
            Value::Object(map) => Ok(Value::from(map.len() as u64)),
            other => Err(Fault::new(
                FaultKind::TypeMismatch,
                format!("{} has no length", type_name(other)),
            )),
        },
        Filter::Int => match &value {
            Value::Number(n) => match n.as_i64() {
                Some(v) => Ok(Value::from(v)),
                None => Ok(Value::from(n.as_f64().unwrap_or(0.0).trunc() as i64)),
            },
            Value::Bool(b) => Ok(Value::from(*b as i64)),
            Value::String(s) => s.trim().parse::<i64>().map(Value::from).map_err(|_| {
                Fault::new(
                    FaultKind::InvalidValue,
                    format!("invalid literal for int: {:?}", s),
                )
            }),
            other => Err(Fault::new(
                FaultKind::TypeMismatch,
                format!("{} cannot be converted to int", type_name(other)),
            )),
        },
        Filter::Default(_) => Ok(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn env(value: Value) -> Environment {
        match value {
            Value::Object(map) => map.into_iter().collect(),
            _ => panic!("environment must be an object"),
        }
    }

    fn eval_str(source: &str, env: &Environment) -> Result<String, Fault> {
        parse(source).unwrap().eval(env).map(|v| stringify(&v))
    }

    #[test]
    fn test_parse_variable_path() {
        let expr = parse("user.address[\"city\"]").unwrap();
        assert_eq!(
            expr,
            Expr::Index(
                Box::new(Expr::Attribute(
                    Box::new(Expr::Variable("user".to_string())),
                    "address".to_string()
                )),
                Box::new(Expr::Literal(Literal::Str("city".to_string())))
            )
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse("").is_err());
        assert!(parse("a +").is_err());
        assert!(parse("'unterminated").is_err());
        assert!(parse("a b").is_err());
        assert!(parse("a | shout").is_err());
        assert!(parse("a | default").is_err());
        assert!(parse("a | upper(1)").is_err());
        assert!(parse("a.").is_err());
        assert!(parse("a[0").is_err());
        assert!(parse("a $ b").is_err());
    }

    #[test]
    fn test_syntax_error_column() {
        let err = parse("name | nope").unwrap_err();
        assert_eq!(err.column, 8);
        assert!(err.message.contains("nope"));
    }

    #[test]
    fn test_eval_literals_and_add() {
        let e = Environment::new();
        assert_eq!(eval_str("1 + 2", &e).unwrap(), "3");
        assert_eq!(eval_str("1.5 + 1", &e).unwrap(), "2.5");
        assert_eq!(eval_str("'a' + 1", &e).unwrap(), "a1");
        assert_eq!(eval_str("\"x\\ny\"", &e).unwrap(), "x\ny");
        assert_eq!(eval_str("null", &e).unwrap(), "");
        assert_eq!(eval_str("true", &e).unwrap(), "true");
    }

    #[test]
    fn test_eval_paths() {
        let e = env(json!({
            "user": {"name": "Ada", "tags": ["x", "y"]},
        }));
        assert_eq!(eval_str("user.name", &e).unwrap(), "Ada");
        assert_eq!(eval_str("user.tags[1]", &e).unwrap(), "y");
        assert_eq!(eval_str("user['name'] | upper", &e).unwrap(), "ADA");
        assert_eq!(eval_str("user.tags | length", &e).unwrap(), "2");
        assert_eq!(eval_str("user.tags", &e).unwrap(), "[\"x\",\"y\"]");
    }

    #[test]
    fn test_eval_faults() {
        let e = env(json!({"user": {"name": "Ada"}, "n": "abc", "list": [1]}));
        assert_eq!(
            eval_str("missing", &e).unwrap_err().kind,
            FaultKind::UndefinedVariable
        );
        assert_eq!(
            eval_str("user.age", &e).unwrap_err().kind,
            FaultKind::MissingKey
        );
        assert_eq!(
            eval_str("list[3]", &e).unwrap_err().kind,
            FaultKind::MissingKey
        );
        assert_eq!(
            eval_str("n | int", &e).unwrap_err().kind,
            FaultKind::InvalidValue
        );
        assert_eq!(
            eval_str("user + 1", &e).unwrap_err().kind,
            FaultKind::TypeMismatch
        );
    }

    #[test]
    fn test_filters() {
        let e = env(json!({"s": "  <b>Hi</b>  ", "f": 3.9, "none": null}));
        assert_eq!(eval_str("s | trim", &e).unwrap(), "<b>Hi</b>");
        assert_eq!(
            eval_str("s | trim | escape", &e).unwrap(),
            "&lt;b&gt;Hi&lt;/b&gt;"
        );
        assert_eq!(eval_str("f | int", &e).unwrap(), "3");
        assert!(parse("'42' | int + 1").is_err());
        assert_eq!(eval_str("('41' | int) + 1", &e).unwrap(), "42");
        assert_eq!(eval_str("none | default('n/a')", &e).unwrap(), "n/a");
        assert_eq!(eval_str("nothing | default('n/a')", &e).unwrap(), "n/a");
        assert_eq!(eval_str("s | json", &e).unwrap(), "\"  <b>Hi</b>  \"");
    }

    #[test]
    fn test_nesting_limit() {
        let chain = vec!["a"; MAX_EXPR_DEPTH].join(" + ");
        assert!(parse(&chain).is_ok());
        let chain = vec!["a"; MAX_EXPR_DEPTH + 1].join(" + ");
        let err = parse(&chain).unwrap_err();
        assert!(err.message.contains("nested too deeply"));

        let deep = format!("{}1{}", "(".repeat(50_000), ")".repeat(50_000));
        assert!(parse(&deep).unwrap_err().message.contains("nested too deeply"));
        let deep = format!("a{}", "[0]".repeat(MAX_EXPR_DEPTH + 1));
        assert!(parse(&deep).is_err());
        let deep = format!("a{}", " | upper".repeat(MAX_EXPR_DEPTH + 1));
        assert!(parse(&deep).is_err());
    }

    #[test]
    fn test_collect_names() {
        let expr = parse("session.user + form['q'] | default(fallback)").unwrap();
        let mut names = BTreeSet::new();
        expr.collect_names(&mut names);
        let names: Vec<_> = names.into_iter().collect();
        assert_eq!(names, vec!["fallback", "form", "session"]);
    }
}
