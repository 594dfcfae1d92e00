// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 协议参数与常量模块
//!
//! 该模块定义了文件服务器遵循的 HTTP 协议相关常量和数据结构，包括：
//! - 使用到的 HTTP 状态码及其原因短语（Reason Phrase）。
//! - 固定的小型 MIME 类型映射表。
//! - HTTP 方法、版本的强类型枚举。
//! - CORS 预检响应使用的头部取值。

use lazy_static::lazy_static;
use std::collections::HashMap;

/// 服务器名称标识，用于 HTTP 响应头的 `Server` 字段
pub const SERVER_NAME: &str = "shaneyale-fileserver";

/// HTTP 协议规定的换行符（Carriage Return Line Feed）
pub const CRLF: &str = "\r\n";

/// 下载文件时使用的查询参数名
pub const FILE_QUERY_PARAM: &str = "file";

/// 兜底 MIME 类型
pub const DEFAULT_MIME: &str = "application/octet-stream";

pub const CONTENT_TYPE_TEXT: &str = "text/plain; charset=UTF-8";
pub const CONTENT_TYPE_JSON: &str = "application/json; charset=UTF-8";

pub const CORS_ALLOW_ORIGIN: &str = "*";
pub const CORS_ALLOW_METHODS: &str = "GET,POST,OPTIONS";
pub const CORS_ALLOW_HEADERS: &str = "X-Requested-With, Content-Type, Content-Length";

/// 上传过程中暂存文件的前缀。以 `.` 开头，保证其永远不会被 GET 请求读到。
pub const SPOOL_PREFIX: &str = ".upload-";

lazy_static! {
    /// HTTP 状态码与其对应的标准原因短语映射表。
    ///
    /// 参考标准：[RFC 9110: HTTP Semantics](https://www.rfc-editor.org/rfc/rfc9110.html)。
    pub static ref STATUS_CODES: HashMap<u16, &'static str> = {
        let mut map = HashMap::new();
        map.insert(200, "OK");
        map.insert(400, "Bad Request");
        map.insert(403, "Forbidden");
        map.insert(404, "Not Found");
        map.insert(405, "Method Not Allowed");
        map.insert(408, "Request Timeout");
        map.insert(500, "Internal Server Error");
        map
    };
}

lazy_static! {
    /// 文件后缀名到 MIME 类型的映射表。
    ///
    /// 只覆盖图片、纯文本与 PDF，其余后缀一律按二进制流处理。
    pub static ref MIME_TYPES: HashMap<&'static str, &'static str> = {
        let mut map = HashMap::new();
        map.insert("png", "image/png");
        map.insert("tif", "image/tiff");
        map.insert("tiff", "image/tiff");
        map.insert("jpg", "image/jpeg");
        map.insert("jpeg", "image/jpeg");
        map.insert("bmp", "image/bmp");
        map.insert("txt", "text/plain");
        map.insert("pdf", "application/pdf");
        map
    };
}

/// 支持的 HTTP 协议版本
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    /// HTTP/1.0 版本，默认不保持连接
    V1_0,
    /// HTTP/1.1 版本，默认保持连接
    V1_1,
}

/// HTTP 请求方法
///
/// 服务器只处理 GET、POST 与 OPTIONS，其余方法统一返回 405。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpRequestMethod {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Patch,
    Options,
    Trace,
    Connect,
    /// 语法合法但未登记的扩展方法
    Other,
}

impl HttpRequestMethod {
    /// 从请求行中的方法字段解析。
    ///
    /// 方法名必须由 token 字符组成，否则返回 `None`。
    pub fn parse(token: &str) -> Option<Self> {
        if token.is_empty() || !token.bytes().all(is_token_char) {
            return None;
        }
        let method = match token.to_uppercase().as_str() {
            "GET" => Self::Get,
            "HEAD" => Self::Head,
            "POST" => Self::Post,
            "PUT" => Self::Put,
            "DELETE" => Self::Delete,
            "PATCH" => Self::Patch,
            "OPTIONS" => Self::Options,
            "TRACE" => Self::Trace,
            "CONNECT" => Self::Connect,
            _ => Self::Other,
        };
        Some(method)
    }
}

fn is_token_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

/// 根据文件扩展名查询 MIME 类型
pub fn mime_for_extension(extension: Option<&str>) -> &'static str {
    extension
        .map(|e| e.to_ascii_lowercase())
        .and_then(|e| MIME_TYPES.get(e.as_str()).copied())
        .unwrap_or(DEFAULT_MIME)
}

use std::fmt;

impl fmt::Display for HttpVersion {
    /// 将枚举格式化为 HTTP 报文中的版本字符串
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            HttpVersion::V1_0 => write!(f, "HTTP/1.0"),
            HttpVersion::V1_1 => write!(f, "HTTP/1.1"),
        }
    }
}

impl fmt::Display for HttpRequestMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            HttpRequestMethod::Get => "GET",
            HttpRequestMethod::Head => "HEAD",
            HttpRequestMethod::Post => "POST",
            HttpRequestMethod::Put => "PUT",
            HttpRequestMethod::Delete => "DELETE",
            HttpRequestMethod::Patch => "PATCH",
            HttpRequestMethod::Options => "OPTIONS",
            HttpRequestMethod::Trace => "TRACE",
            HttpRequestMethod::Connect => "CONNECT",
            HttpRequestMethod::Other => "OTHER",
        };
        write!(f, "{}", name)
    }
}
