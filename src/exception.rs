// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # Exception 模块
//!
//! 该模块定义了页面模板在编译、缓存与执行的生命周期中可能抛出的各类异常情况。
//!
//! ## 设计意图
//! - **错误分类**：涵盖了源文件错误、模板语法错误、执行期错误以及持久缓存（Tier 2）错误。
//! - **执行期故障**：`Fault` 携带故障种类、描述与调用栈，可以被绑定到错误页的环境中。
//! - **用户友好**：通过实现 `std::fmt::Display`，确保错误信息可以被安全地记录到日志或展示给开发者。

use std::{error::Error, fmt, io, path::PathBuf};

use serde_json::{json, Value};

/// 页面执行期间发生的故障种类。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// 表达式引用了环境中不存在的变量。
    UndefinedVariable,
    /// 对象中不存在指定的键，或数组下标越界。
    MissingKey,
    /// 操作数类型不符合运算或过滤器的要求。
    TypeMismatch,
    /// 类型正确但取值非法（例如把 `"abc"` 转换为整数）。
    InvalidValue,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultKind::UndefinedVariable => write!(f, "UndefinedVariable"),
            FaultKind::MissingKey => write!(f, "MissingKey"),
            FaultKind::TypeMismatch => write!(f, "TypeMismatch"),
            FaultKind::InvalidValue => write!(f, "InvalidValue"),
        }
    }
}

/// 执行期故障：种类、描述与调用栈（由内向外的执行帧）。
#[derive(Debug, Clone, PartialEq)]
pub struct Fault {
    pub kind: FaultKind,
    pub value: String,
    pub traceback: Vec<String>,
}

impl Fault {
    pub fn new(kind: FaultKind, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
            traceback: Vec::new(),
        }
    }

    /// 追加一个执行帧
    pub fn with_frame(mut self, frame: String) -> Self {
        self.traceback.push(frame);
        self
    }

    /// 转换为可以绑定到错误页环境中的值
    pub fn to_value(&self) -> Value {
        json!({
            "kind": self.kind.to_string(),
            "value": self.value,
            "traceback": self.traceback,
        })
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.value)
    }
}

/// 模板引擎处理请求过程中发生的异常类型。
///
/// 该枚举通常作为 `Result` 的 `Err` 部分返回，用于指示处理失败的具体原因。
#[derive(Debug)]
pub enum Exception {
    /// 指定的页面路径不存在或不是常规文件。
    NotAFile(PathBuf),
    /// 读写文件时发生 I/O 错误。
    Io { path: PathBuf, source: io::Error },
    /// 模板中的表达式语法错误，在编译阶段即被报告。
    Syntax {
        origin: String,
        line: usize,
        column: usize,
        message: String,
    },
    /// 页面执行期间发生故障，且没有配置错误页。
    Execution(Fault),
    /// 持久缓存（Tier 2）打开、读取或写入失败。
    Store(String),
    /// 已编译产物（缓存值或预编译文件）无法被解码。
    CorruptArtifact(String),
    /// 会话对象保存失败。
    Session(String),
    /// 宿主服务器收到了无法解析的 HTTP 请求。
    BadRequest(String),
    /// 宿主服务器不支持的 HTTP 请求方法。
    UnsupportedMethod(String),
    /// 宿主服务器不支持的 HTTP 协议版本。
    UnsupportedHttpVersion(String),
    /// 请求路径越出了网站根目录。
    InvalidPath(String),
}

use Exception::*;

impl Exception {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Io {
            path: path.into(),
            source,
        }
    }
}

/// 为 `Exception` 实现 `Display` 特性，使其支持字符串格式化输出。
impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotAFile(path) => write!(f, "{} is not a file", path.display()),
            Io { path, source } => write!(f, "I/O error on {}: {}", path.display(), source),
            Syntax {
                origin,
                line,
                column,
                message,
            } => write!(
                f,
                "Syntax error in {} at line {}, column {}: {}",
                origin, line, column, message
            ),
            Execution(fault) => write!(f, "Page execution failed: {}", fault),
            Store(msg) => write!(f, "Page cache store error: {}", msg),
            CorruptArtifact(msg) => write!(f, "Corrupt compiled page: {}", msg),
            Session(msg) => write!(f, "Session error: {}", msg),
            BadRequest(msg) => write!(f, "Bad request: {}", msg),
            UnsupportedMethod(m) => write!(f, "Unsupported HTTP method: {}", m),
            UnsupportedHttpVersion(v) => write!(f, "Unsupported HTTP version: {}", v),
            InvalidPath(p) => write!(f, "Invalid request path: {}", p),
        }
    }
}

impl Error for Exception {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Io { source, .. } => Some(source),
            _ => None,
        }
    }
}
