// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 编译产物编解码模块
//!
//! 把 [`CompiledUnit`] 编码为带版本号、带类型标签、长度前缀的二进制记录，
//! 用于持久缓存（Tier 2）与预编译文件。表达式语法树被完整编码，
//! 解码后无需重新解析即可执行。
//!
//! 布局：`PSPC` | 版本(u8) | 来源名(str) | 指令数(u32) | 指令...
//! 其中 `str` 为 `u32` 长度前缀的 UTF-8 字节，整数均为大端序。

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
    exception::Exception,
    expr::{Expr, Filter, Literal},
    param::MAX_EXPR_DEPTH,
    template::{CompiledUnit, Instruction},
};

const MAGIC: &[u8; 4] = b"PSPC";
const VERSION: u8 = 1;

const INSTR_LITERAL: u8 = 0;
const INSTR_EXPRESSION: u8 = 1;

const EXPR_NULL: u8 = 0;
const EXPR_BOOL: u8 = 1;
const EXPR_INT: u8 = 2;
const EXPR_FLOAT: u8 = 3;
const EXPR_STR: u8 = 4;
const EXPR_VARIABLE: u8 = 5;
const EXPR_ATTRIBUTE: u8 = 6;
const EXPR_INDEX: u8 = 7;
const EXPR_ADD: u8 = 8;
const EXPR_FILTER: u8 = 9;

pub fn encode(unit: &CompiledUnit) -> Bytes {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_slice(MAGIC);
    buf.put_u8(VERSION);
    put_str(&mut buf, unit.origin());
    buf.put_u32(unit.instructions().len() as u32);
    for instruction in unit.instructions() {
        match instruction {
            Instruction::Literal(text) => {
                buf.put_u8(INSTR_LITERAL);
                put_str(&mut buf, text);
            }
            Instruction::Expression { line, source, expr } => {
                buf.put_u8(INSTR_EXPRESSION);
                buf.put_u32(*line);
                put_str(&mut buf, source);
                put_expr(&mut buf, expr);
            }
        }
    }
    buf.freeze()
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn put_expr(buf: &mut BytesMut, expr: &Expr) {
    match expr {
        Expr::Literal(Literal::Null) => buf.put_u8(EXPR_NULL),
        Expr::Literal(Literal::Bool(b)) => {
            buf.put_u8(EXPR_BOOL);
            buf.put_u8(*b as u8);
        }
        Expr::Literal(Literal::Int(v)) => {
            buf.put_u8(EXPR_INT);
            buf.put_i64(*v);
        }
        Expr::Literal(Literal::Float(v)) => {
            buf.put_u8(EXPR_FLOAT);
            buf.put_f64(*v);
        }
        Expr::Literal(Literal::Str(s)) => {
            buf.put_u8(EXPR_STR);
            put_str(buf, s);
        }
        Expr::Variable(name) => {
            buf.put_u8(EXPR_VARIABLE);
            put_str(buf, name);
        }
        Expr::Attribute(target, key) => {
            buf.put_u8(EXPR_ATTRIBUTE);
            put_expr(buf, target);
            put_str(buf, key);
        }
        Expr::Index(target, index) => {
            buf.put_u8(EXPR_INDEX);
            put_expr(buf, target);
            put_expr(buf, index);
        }
        Expr::Add(lhs, rhs) => {
            buf.put_u8(EXPR_ADD);
            put_expr(buf, lhs);
            put_expr(buf, rhs);
        }
        Expr::Filter(inner, filter) => {
            buf.put_u8(EXPR_FILTER);
            put_expr(buf, inner);
            put_filter(buf, filter);
        }
    }
}

fn put_filter(buf: &mut BytesMut, filter: &Filter) {
    let tag = match filter {
        Filter::Upper => 0,
        Filter::Lower => 1,
        Filter::Trim => 2,
        Filter::Escape => 3,
        Filter::Length => 4,
        Filter::Json => 5,
        Filter::Int => 6,
        Filter::Default(_) => 7,
    };
    buf.put_u8(tag);
    if let Filter::Default(fallback) = filter {
        put_expr(buf, fallback);
    }
}

pub fn decode(data: &[u8]) -> Result<CompiledUnit, Exception> {
    let mut buf = data;
    if buf.remaining() < MAGIC.len() + 1 || &buf[..MAGIC.len()] != MAGIC {
        return Err(corrupt("missing PSPC header"));
    }
    buf.advance(MAGIC.len());
    let version = buf.get_u8();
    if version != VERSION {
        return Err(corrupt(format!("unsupported version {}", version)));
    }
    let origin = get_str(&mut buf)?;
    let count = get_u32(&mut buf)?;
    let mut instructions = Vec::new();
    for _ in 0..count {
        let instruction = match get_u8(&mut buf)? {
            INSTR_LITERAL => Instruction::Literal(get_str(&mut buf)?),
            INSTR_EXPRESSION => {
                let line = get_u32(&mut buf)?;
                let source = get_str(&mut buf)?;
                let expr = get_expr(&mut buf, 0)?;
                Instruction::Expression { line, source, expr }
            }
            tag => return Err(corrupt(format!("unknown instruction tag {}", tag))),
        };
        instructions.push(instruction);
    }
    if buf.has_remaining() {
        return Err(corrupt(format!("{} trailing bytes", buf.remaining())));
    }
    Ok(CompiledUnit::new(origin, instructions))
}

fn corrupt(msg: impl Into<String>) -> Exception {
    Exception::CorruptArtifact(msg.into())
}

fn need(buf: &&[u8], n: usize) -> Result<(), Exception> {
    if buf.remaining() < n {
        Err(corrupt("unexpected end of data"))
    } else {
        Ok(())
    }
}

fn get_u8(buf: &mut &[u8]) -> Result<u8, Exception> {
    need(buf, 1)?;
    Ok(buf.get_u8())
}

fn get_u32(buf: &mut &[u8]) -> Result<u32, Exception> {
    need(buf, 4)?;
    Ok(buf.get_u32())
}

fn get_str(buf: &mut &[u8]) -> Result<String, Exception> {
    let len = get_u32(buf)? as usize;
    need(buf, len)?;
    let s = std::str::from_utf8(&buf[..len])
        .map_err(|_| corrupt("string is not valid UTF-8"))?
        .to_string();
    buf.advance(len);
    Ok(s)
}

fn get_expr(buf: &mut &[u8], depth: usize) -> Result<Expr, Exception> {
    if depth >= MAX_EXPR_DEPTH {
        return Err(corrupt("expression nesting too deep"));
    }
    let expr = match get_u8(buf)? {
        EXPR_NULL => Expr::Literal(Literal::Null),
        EXPR_BOOL => Expr::Literal(Literal::Bool(get_u8(buf)? != 0)),
        EXPR_INT => {
            need(buf, 8)?;
            Expr::Literal(Literal::Int(buf.get_i64()))
        }
        EXPR_FLOAT => {
            need(buf, 8)?;
            Expr::Literal(Literal::Float(buf.get_f64()))
        }
        EXPR_STR => Expr::Literal(Literal::Str(get_str(buf)?)),
        EXPR_VARIABLE => Expr::Variable(get_str(buf)?),
        EXPR_ATTRIBUTE => {
            let target = get_expr(buf, depth + 1)?;
            Expr::Attribute(Box::new(target), get_str(buf)?)
        }
        EXPR_INDEX => {
            let target = get_expr(buf, depth + 1)?;
            let index = get_expr(buf, depth + 1)?;
            Expr::Index(Box::new(target), Box::new(index))
        }
        EXPR_ADD => {
            let lhs = get_expr(buf, depth + 1)?;
            let rhs = get_expr(buf, depth + 1)?;
            Expr::Add(Box::new(lhs), Box::new(rhs))
        }
        EXPR_FILTER => {
            let inner = get_expr(buf, depth + 1)?;
            let filter = match get_u8(buf)? {
                0 => Filter::Upper,
                1 => Filter::Lower,
                2 => Filter::Trim,
                3 => Filter::Escape,
                4 => Filter::Length,
                5 => Filter::Json,
                6 => Filter::Int,
                7 => Filter::Default(Box::new(get_expr(buf, depth + 1)?)),
                tag => return Err(corrupt(format!("unknown filter tag {}", tag))),
            };
            Expr::Filter(Box::new(inner), filter)
        }
        tag => return Err(corrupt(format!("unknown expression tag {}", tag))),
    };
    Ok(expr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::compile_str;
    use proptest::prelude::*;

    #[test]
    fn test_round_trip_structure() {
        let unit = compile_str(
            "<p><%= user.name | upper %></p><%= items[0] + 1.5 %><%= x | default(\"-\") %><%= null %><%= true %>",
        )
        .unwrap();
        let decoded = decode(&encode(&unit)).unwrap();
        assert_eq!(decoded, unit);
    }

    #[test]
    fn test_deepest_compilable_expression_round_trips() {
        let chain = vec!["a"; MAX_EXPR_DEPTH].join(" + ");
        let unit = compile_str(&format!("x<%= {} %>", chain)).unwrap();
        assert_eq!(decode(&encode(&unit)).unwrap(), unit);

        let nested = format!("x<%= a{} %>", "[b | default(0)]".repeat(MAX_EXPR_DEPTH / 2 - 1));
        let unit = compile_str(&nested).unwrap();
        assert_eq!(decode(&encode(&unit)).unwrap(), unit);

        let chain = vec!["a"; MAX_EXPR_DEPTH + 1].join(" + ");
        assert!(matches!(
            compile_str(&format!("x<%= {} %>", chain)),
            Err(Exception::Syntax { .. })
        ));
    }

    #[test]
    fn test_header() {
        let bytes = encode(&compile_str("x").unwrap());
        assert_eq!(&bytes[..4], b"PSPC");
        assert_eq!(bytes[4], VERSION);
    }

    #[test]
    fn test_rejects_bad_magic() {
        assert!(matches!(
            decode(b"NOPE\x01"),
            Err(Exception::CorruptArtifact(_))
        ));
        assert!(matches!(decode(b""), Err(Exception::CorruptArtifact(_))));
    }

    #[test]
    fn test_rejects_truncated_data() {
        let bytes = encode(&compile_str("Hello <%= name | upper %>!").unwrap());
        for len in 5..bytes.len() {
            assert!(
                decode(&bytes[..len]).is_err(),
                "truncated at {} should fail",
                len
            );
        }
    }

    #[test]
    fn test_rejects_trailing_bytes() {
        let mut bytes = encode(&compile_str("x").unwrap()).to_vec();
        bytes.push(0);
        assert!(decode(&bytes).is_err());
    }

    #[test]
    fn test_rejects_unknown_version() {
        let mut bytes = encode(&compile_str("x").unwrap()).to_vec();
        bytes[4] = 99;
        assert!(decode(&bytes).is_err());
    }

    fn expression() -> impl Strategy<Value = String> {
        prop_oneof![
            "[a-z][a-z0-9_]{0,6}",
            "[a-z]{1,4}\\.[a-z]{1,4}",
            "[a-z]{1,4}\\[[0-9]{1,2}\\]",
            (0i64..100000).prop_map(|n| n.to_string()),
            "'[a-zA-Z ]{0,8}'",
            "[a-z]{1,4} \\+ [0-9]{1,3}",
            "[a-z]{1,4} \\| (upper|lower|trim|escape|length|json|int)",
            "[a-z]{1,4} \\| default\\('[a-z]{0,4}'\\)",
            Just("null".to_string()),
            Just("(a + 'b') | upper".to_string()),
        ]
    }

    proptest! {
        #[test]
        fn prop_round_trip(
            parts in proptest::collection::vec(("[a-zA-Z \n<>]{0,12}", expression()), 0..12)
        ) {
            let source: String = parts
                .iter()
                .map(|(literal, expr)| format!("{}<%= {} %>", literal.replace('<', "&lt;"), expr))
                .collect();
            let unit = compile_str(&source).unwrap();
            prop_assert_eq!(decode(&encode(&unit)).unwrap(), unit);
        }
    }
}
