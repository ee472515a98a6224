// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 页面引擎参数与常量模块
//!
//! 该模块定义了页面引擎与演示服务器共用的常量，包括：
//! - 模板定界符与缓存相关的默认值。
//! - 请求选项（options）与服务器配置（config）中使用的键名。
//! - 演示服务器使用的 HTTP 状态码及其原因短语。

use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashMap;

/// 服务器名称标识，用于 HTTP 响应头的 `Server` 字段
pub const SERVER_NAME: &str = "shaneyale-psp-server";

/// HTTP 协议规定的换行符（Carriage Return Line Feed）
pub const CRLF: &str = "\r\n";

/// 内存缓存（Tier 1）的默认容量
pub const DEFAULT_CACHE_SIZE: usize = 512;

/// 表达式语法树的最大深度，编译与解码共用同一个上限
pub const MAX_EXPR_DEPTH: usize = 256;

/// 预编译产物的文件名标记字符：`page.psp` 对应 `page.psc`
pub const PRECOMPILED_MARKER: char = 'c';

/// 请求选项：持久缓存（Tier 2）文件路径
pub const OPTION_DBM_CACHE: &str = "PSPDbmCache";

/// 请求选项：默认错误页
pub const OPTION_ERROR_PAGE: &str = "PSPErrorPage";

/// 服务器配置：调试模式开关
pub const CONFIG_DEBUG: &str = "PageDebug";

/// 页面的默认 Content-Type
pub const HTML_CONTENT_TYPE: &str = "text/html";

lazy_static! {
    /// `<%= expr %>` 定界符，`.` 可以匹配换行
    pub static ref DELIMITER: Regex = Regex::new(r"(?s)<%=(.*?)%>").unwrap();
}

lazy_static! {
    /// 演示服务器可能返回的 HTTP 状态码与其对应的标准原因短语。
    pub static ref STATUS_CODES: HashMap<u16, &'static str> = {
        let mut map = HashMap::new();
        map.insert(200, "OK");
        map.insert(301, "Moved Permanently");
        map.insert(302, "Found");
        map.insert(400, "Bad Request");
        map.insert(404, "Not Found");
        map.insert(405, "Method Not Allowed");
        map.insert(500, "Internal Server Error");
        map.insert(505, "HTTP Version Not Supported");
        map
    };
}

lazy_static! {
    /// 演示服务器直接发送的静态文件的 MIME 类型
    pub static ref MIME_TYPES: HashMap<&'static str, &'static str> = {
        let mut map = HashMap::new();
        map.insert("html", "text/html;charset=utf-8");
        map.insert("htm", "text/html;charset=utf-8");
        map.insert("css", "text/css;charset=utf-8");
        map.insert("js", "text/javascript;charset=utf-8");
        map.insert("json", "application/json");
        map.insert("txt", "text/plain;charset=utf-8");
        map.insert("png", "image/png");
        map.insert("jpg", "image/jpeg");
        map.insert("jpeg", "image/jpeg");
        map.insert("gif", "image/gif");
        map.insert("svg", "image/svg+xml");
        map.insert("ico", "image/x-icon");
        map
    };
}

/// 页面文件的扩展名
pub const PAGE_EXTENSION: &str = "psp";

/// 目录请求的默认页面
pub const PAGE_INDEX: &str = "index.psp";

/// 演示服务器支持的 HTTP 协议版本
#[derive(Debug, Clone, Copy)]
pub enum HttpVersion {
    /// HTTP/1.1 版本
    V1_1,
}

/// 演示服务器支持的 HTTP 请求方法
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HttpRequestMethod {
    /// 获取资源
    Get,
    /// 获取资源的元数据（不包含响应体）
    Head,
}

use std::fmt;

impl fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            HttpVersion::V1_1 => write!(f, "1.1"),
        }
    }
}

impl fmt::Display for HttpRequestMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            HttpRequestMethod::Get => write!(f, "GET"),
            HttpRequestMethod::Head => write!(f, "HEAD"),
        }
    }
}
