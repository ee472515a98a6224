// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 模板编译模块
//!
//! 把页面源文本编译为 [`CompiledUnit`]：一个由"输出字面量"与"输出表达式求值结果"
//! 组成的指令序列。表达式在编译阶段即被解析，语法错误不会被推迟到执行阶段。

use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
};

use log::debug;

use crate::{
    exception::Exception,
    expr::{self, Expr},
    param::DELIMITER,
};

/// 页面来源：带修改时间的文件，或内存中的字符串
#[derive(Debug, Clone, PartialEq)]
pub enum SourceUnit {
    File { path: PathBuf, mtime: u64 },
    Inline(String),
}

impl SourceUnit {
    /// 读取文件的元数据构造文件来源。路径不存在或不是常规文件时返回 `NotAFile`。
    pub fn from_path(path: &Path) -> Result<Self, Exception> {
        if !path.is_file() {
            return Err(Exception::NotAFile(path.to_path_buf()));
        }
        Ok(SourceUnit::File {
            path: path.to_path_buf(),
            mtime: modified_nanos(path)?,
        })
    }

    /// 编译产物中记录的来源名
    pub fn origin(&self) -> String {
        match self {
            SourceUnit::File { path, .. } => path.display().to_string(),
            SourceUnit::Inline(_) => "<string>".to_string(),
        }
    }

    pub fn read(&self) -> Result<String, Exception> {
        match self {
            SourceUnit::File { path, .. } => {
                fs::read_to_string(path).map_err(|e| Exception::io(path, e))
            }
            SourceUnit::Inline(source) => Ok(source.clone()),
        }
    }
}

/// 文件的修改时间（Unix 纪元以来的纳秒数），作为缓存的新鲜度标记
pub fn modified_nanos(path: &Path) -> Result<u64, Exception> {
    let modified = fs::metadata(path)
        .and_then(|m| m.modified())
        .map_err(|e| Exception::io(path, e))?;
    Ok(modified
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0))
}

#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    /// 原样输出
    Literal(String),
    /// 输出表达式求值结果的字符串形式
    Expression {
        line: u32,
        source: String,
        expr: Expr,
    },
}

/// 编译后的页面
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledUnit {
    origin: String,
    instructions: Vec<Instruction>,
}

impl CompiledUnit {
    pub fn new(origin: String, instructions: Vec<Instruction>) -> Self {
        Self {
            origin,
            instructions,
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// 页面引用的全部根变量名
    pub fn names(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        for instruction in &self.instructions {
            if let Instruction::Expression { expr, .. } = instruction {
                expr.collect_names(&mut names);
            }
        }
        names
    }

    pub fn references(&self, name: &str) -> bool {
        self.names().contains(name)
    }

    /// 指令清单，每条指令一行，供调试模式展示
    pub fn listing(&self) -> Vec<String> {
        self.instructions
            .iter()
            .map(|instruction| match instruction {
                Instruction::Literal(text) => format!("write({:?})", text),
                Instruction::Expression { source, .. } => format!("write(str({}))", source),
            })
            .collect()
    }
}

/// 页面解析器。不同的模板语法通过实现该 trait 接入。
pub trait Parser {
    fn parse(&self, origin: &str, source: &str) -> Result<CompiledUnit, Exception>;
}

/// `<%= expr %>` 定界符语法
#[derive(Debug, Default, Clone, Copy)]
pub struct DelimiterParser;

impl Parser for DelimiterParser {
    fn parse(&self, origin: &str, source: &str) -> Result<CompiledUnit, Exception> {
        let mut instructions = Vec::new();
        let mut last = 0;
        for captures in DELIMITER.captures_iter(source) {
            let (whole, inner) = match (captures.get(0), captures.get(1)) {
                (Some(w), Some(i)) => (w, i),
                _ => continue,
            };
            let literal = &source[last..whole.start()];
            if !literal.is_empty() {
                instructions.push(Instruction::Literal(literal.to_string()));
            }
            let line = source[..whole.start()].matches('\n').count() + 1;
            let text = inner.as_str().trim();
            let expr = expr::parse(text).map_err(|e| Exception::Syntax {
                origin: origin.to_string(),
                line,
                column: e.column,
                message: e.message,
            })?;
            instructions.push(Instruction::Expression {
                line: line as u32,
                source: text.to_string(),
                expr,
            });
            last = whole.end();
        }
        let tail = &source[last..];
        if !tail.is_empty() {
            instructions.push(Instruction::Literal(tail.to_string()));
        }
        debug!("编译页面{}完成，共{}条指令", origin, instructions.len());
        Ok(CompiledUnit::new(origin.to_string(), instructions))
    }
}

/// 使用默认语法编译一个页面来源
pub fn compile(source: &SourceUnit) -> Result<CompiledUnit, Exception> {
    DelimiterParser.parse(&source.origin(), &source.read()?)
}

/// 编译字符串
pub fn compile_str(source: &str) -> Result<CompiledUnit, Exception> {
    DelimiterParser.parse("<string>", source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Literal;

    #[test]
    fn test_split_literals_and_expressions() {
        let unit = compile_str("Hello <%= name %>!").unwrap();
        assert_eq!(unit.instructions().len(), 3);
        assert_eq!(
            unit.instructions()[0],
            Instruction::Literal("Hello ".to_string())
        );
        match &unit.instructions()[1] {
            Instruction::Expression { line, source, expr } => {
                assert_eq!(*line, 1);
                assert_eq!(source, "name");
                assert_eq!(*expr, Expr::Variable("name".to_string()));
            }
            other => panic!("Expected expression, got {:?}", other),
        }
        assert_eq!(unit.instructions()[2], Instruction::Literal("!".to_string()));
    }

    #[test]
    fn test_empty_literals_skipped() {
        let unit = compile_str("<%= 1 %><%= 2 %>").unwrap();
        assert_eq!(unit.instructions().len(), 2);
        assert!(unit
            .instructions()
            .iter()
            .all(|i| matches!(i, Instruction::Expression { .. })));
    }

    #[test]
    fn test_multiline_expression_and_line_numbers() {
        let unit = compile_str("a\nb\n<%=\n  'x'\n%>c").unwrap();
        match &unit.instructions()[1] {
            Instruction::Expression { line, expr, .. } => {
                assert_eq!(*line, 3);
                assert_eq!(*expr, Expr::Literal(Literal::Str("x".to_string())));
            }
            other => panic!("Expected expression, got {:?}", other),
        }
    }

    #[test]
    fn test_plain_text() {
        let unit = compile_str("no expressions here").unwrap();
        assert_eq!(
            unit.instructions(),
            &[Instruction::Literal("no expressions here".to_string())]
        );
        assert!(compile_str("").unwrap().instructions().is_empty());
    }

    #[test]
    fn test_syntax_error_is_reported_at_compile_time() {
        let err = compile_str("line1\n<%= a + %>").unwrap_err();
        match err {
            Exception::Syntax { origin, line, .. } => {
                assert_eq!(origin, "<string>");
                assert_eq!(line, 2);
            }
            other => panic!("Expected Syntax error, got {:?}", other),
        }
    }

    #[test]
    fn test_names() {
        let unit = compile_str("<%= session.user %> <%= form['q'] %> <%= title %>").unwrap();
        assert!(unit.references("session"));
        assert!(unit.references("form"));
        assert!(!unit.references("req"));
        assert_eq!(unit.names().len(), 3);
    }

    #[test]
    fn test_listing() {
        let unit = compile_str("Hi <%= name %>").unwrap();
        assert_eq!(unit.listing(), vec!["write(\"Hi \")", "write(str(name))"]);
    }

    #[test]
    fn test_source_unit_missing_file() {
        let err = SourceUnit::from_path(Path::new("/definitely/not/here.psp")).unwrap_err();
        assert!(matches!(err, Exception::NotAFile(_)));
    }
}
