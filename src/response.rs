// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # HTTP 响应构建模块
//!
//! 页面引擎通过 `RequestContext::write` 把输出追加到响应体中，
//! 演示服务器最后调用 [`Response::as_bytes`] 生成完整的响应报文。

use crate::{param::*, util::HtmlBuilder};

use bytes::{Bytes, BytesMut};
use chrono::prelude::*;
use log::error;

#[derive(Debug, Clone)]
pub struct Response {
    version: HttpVersion,
    status_code: u16,
    information: String,
    content_type: Option<String>,
    date: DateTime<Utc>,
    server_name: String,
    allow: Option<Vec<HttpRequestMethod>>,
    content: BytesMut,
}

impl Response {
    pub fn new() -> Self {
        Self {
            version: HttpVersion::V1_1,
            status_code: 200,
            information: "OK".to_string(),
            content_type: None,
            date: Utc::now(),
            server_name: SERVER_NAME.to_string(),
            allow: None,
            content: BytesMut::new(),
        }
    }

    /// 根据状态码生成带有 HTML 说明页的响应
    pub fn from_status_code(code: u16, id: u128) -> Self {
        let mut response = Self::new();
        let html = HtmlBuilder::from_status_code(code, None).build();
        if code == 405 {
            response.allow = Some(vec![HttpRequestMethod::Get, HttpRequestMethod::Head]);
        }
        response.set_code(code);
        response.set_content_type("text/html;charset=utf-8");
        response.append(html.as_bytes());
        log::debug!("[ID{}]生成{}响应页面", id, code);
        response
    }

    pub fn set_code(&mut self, code: u16) -> &mut Self {
        self.status_code = code;
        self.information = match STATUS_CODES.get(&code) {
            Some(&info) => info.to_string(),
            None => {
                error!("非法的状态码：{}。这条错误说明代码编写出现了错误。", code);
                "Unknown".to_string()
            }
        };
        self
    }

    pub fn set_content_type(&mut self, content_type: &str) -> &mut Self {
        self.content_type = Some(content_type.to_string());
        self
    }

    /// 追加响应体
    pub fn append(&mut self, data: &[u8]) {
        self.content.extend_from_slice(data);
    }

    /// 生成响应报文。`headonly` 时保留 `Content-Length` 但省略响应体。
    pub fn as_bytes(&self, headonly: bool) -> Vec<u8> {
        let version: &str = match self.version {
            HttpVersion::V1_1 => "HTTP/1.1",
        };
        let status_code: &str = &self.status_code.to_string();
        let content_length: &str = &self.content.len().to_string();
        let date: &str = &format_date(&self.date);
        let information: &str = &self.information;
        let server: &str = &self.server_name;

        let header = [
            version,
            " ",
            status_code,
            " ",
            information,
            CRLF,
            match &self.content_type {
                Some(t) => ["Content-Type: ", t, CRLF].concat(),
                None => "".to_string(),
            }
            .as_str(),
            "Content-Length: ",
            content_length,
            CRLF,
            "Date: ",
            date,
            CRLF,
            "Server: ",
            server,
            CRLF,
            match &self.allow {
                Some(a) => {
                    let methods: Vec<String> = a.iter().map(|m| m.to_string()).collect();
                    let allow_str: &str = &methods.join(", ");
                    ["Allow: ", allow_str, CRLF].concat()
                }
                None => "".to_string(),
            }
            .as_str(),
            CRLF,
        ]
        .concat();
        let body: &[u8] = if headonly { b"" } else { &self.content };
        [header.as_bytes(), body].concat()
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

impl Response {
    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    pub fn information(&self) -> &str {
        &self.information
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn content(&self) -> Bytes {
        self.content.clone().freeze()
    }
}

fn format_date(date: &DateTime<Utc>) -> String {
    date.to_rfc2822()
}

/// 按扩展名查找 MIME 类型
pub fn get_mime(extension: &str) -> &'static str {
    match MIME_TYPES.get(extension) {
        Some(v) => v,
        None => "application/octet-stream",
    }
}
