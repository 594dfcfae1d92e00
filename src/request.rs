// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # HTTP 请求处理模块
//!
//! 负责把从 TCP 流中读取到的请求头字节解析为强类型的 `Request` 结构体：
//! 1. 请求行（Request-Line）的解析（方法、路径、查询参数、版本）。
//! 2. 全部 HTTP 标头的提取（大小写不敏感查询）。
//! 3. 连接保持、分块传输、内容长度等与请求体分帧相关的判断。
//!
//! 请求体不在这里解析，它由 `body` 模块切分成片段后逐个交给处理器。

use std::collections::HashMap;

use crate::{exception::Exception, param::*, util::percent_decode};
use log::error;

/// 表示一个完整的 HTTP 请求头。
///
/// 接收完成后不可变，请求体以片段形式另行到达。
#[derive(Debug, Clone)]
pub struct Request {
    /// HTTP 请求方法
    method: HttpRequestMethod,
    /// 原始请求目标（包含查询字符串）
    target: String,
    /// 解码后的路径部分
    path: String,
    /// 查询参数：键 -> 按出现顺序排列的值列表
    query: HashMap<String, Vec<String>>,
    /// HTTP 协议版本
    version: HttpVersion,
    /// 按到达顺序保存的全部标头
    headers: Vec<(String, String)>,
}

impl Request {
    /// 从请求头字节（到空行为止）尝试构建 `Request` 实例。
    ///
    /// # 参数
    /// * `buffer` - 请求行与标头，不含请求体。
    /// * `id` - 连接 ID，用于在多线程环境下追踪日志。
    pub fn try_from(buffer: &[u8], id: u128) -> Result<Self, Exception> {
        // 1. 请求头必须是合法的 UTF-8
        let request_string = match std::str::from_utf8(buffer) {
            Ok(string) => string,
            Err(_) => {
                error!("[ID{}]无法解析HTTP请求", id);
                return Err(Exception::RequestIsNotUtf8);
            }
        };

        let mut request_lines = request_string
            .split(CRLF)
            .skip_while(|line| line.is_empty());

        // 2. 解析请求行 (e.g., "GET /?file=a.txt HTTP/1.1")
        let first_line = request_lines.next().unwrap_or("");
        let first_line_parts: Vec<&str> = first_line.split(' ').collect();
        if first_line_parts.len() != 3 {
            error!("[ID{}]HTTP请求行格式不正确：{}", id, first_line);
            return Err(Exception::MalformedRequest);
        }

        let method = match HttpRequestMethod::parse(first_line_parts[0]) {
            Some(m) => m,
            None => {
                error!("[ID{}]非法的HTTP请求方法：{}", id, first_line_parts[0]);
                return Err(Exception::MalformedRequest);
            }
        };

        let version_str = first_line_parts[2].to_uppercase();
        let version = match version_str.as_str() {
            "HTTP/1.1" => HttpVersion::V1_1,
            "HTTP/1.0" => HttpVersion::V1_0,
            _ => {
                error!("[ID{}]不支持的HTTP协议版本：{}", id, &version_str);
                return Err(Exception::UnsupportedHttpVersion);
            }
        };

        let target = first_line_parts[1].to_string();
        if target.is_empty() {
            error!("[ID{}]请求目标为空", id);
            return Err(Exception::MalformedRequest);
        }
        let (raw_path, raw_query) = match target.split_once('?') {
            Some((p, q)) => (p, q),
            None => (target.as_str(), ""),
        };
        let path = percent_decode(raw_path, false);
        let query = parse_query(raw_query);

        // 3. 逐行解析 Headers
        let mut headers = Vec::new();
        for line in request_lines {
            if line.is_empty() {
                break;
            }
            match line.split_once(':') {
                Some((name, value)) if !name.is_empty() && !name.ends_with(' ') => {
                    headers.push((name.to_string(), value.trim().to_string()));
                }
                _ => {
                    error!("[ID{}]HTTP标头格式不正确：{}", id, line);
                    return Err(Exception::MalformedRequest);
                }
            }
        }

        Ok(Self {
            method,
            target,
            path,
            query,
            version,
            headers,
        })
    }
}

/// 解析 `a=1&b=2&a=3` 形式的查询字符串
fn parse_query(raw: &str) -> HashMap<String, Vec<String>> {
    let mut query: HashMap<String, Vec<String>> = HashMap::new();
    for pair in raw.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = match pair.split_once('=') {
            Some((k, v)) => (k, v),
            None => (pair, ""),
        };
        query
            .entry(percent_decode(key, true))
            .or_default()
            .push(percent_decode(value, true));
    }
    query
}

// --- Getter 访问器实现 ---

impl Request {
    pub fn version(&self) -> HttpVersion {
        self.version
    }

    pub fn method(&self) -> HttpRequestMethod {
        self.method
    }

    /// 原始请求目标（含查询字符串）
    pub fn target(&self) -> &str {
        &self.target
    }

    /// 解码后的路径
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> &HashMap<String, Vec<String>> {
        &self.query
    }

    /// 查询参数的第一个值
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query
            .get(key)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// 大小写不敏感地查询标头，返回第一次出现的值
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn user_agent(&self) -> &str {
        self.header("User-Agent").unwrap_or("")
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("Content-Type")
    }

    /// 客户端是否要求保持连接。
    ///
    /// HTTP/1.1 默认保持，除非显式声明 `Connection: close`；
    /// HTTP/1.0 只有声明 `Connection: keep-alive` 时才保持。
    pub fn is_keep_alive(&self) -> bool {
        let tokens = self.connection_tokens();
        match self.version {
            HttpVersion::V1_1 => !tokens.iter().any(|t| t == "close"),
            HttpVersion::V1_0 => tokens.iter().any(|t| t == "keep-alive"),
        }
    }

    fn connection_tokens(&self) -> Vec<String> {
        self.headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case("Connection"))
            .flat_map(|(_, v)| v.split(','))
            .map(|t| t.trim().to_ascii_lowercase())
            .collect()
    }

    /// 请求体是否使用 `Transfer-Encoding: chunked`
    pub fn is_chunked(&self) -> bool {
        self.headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case("Transfer-Encoding"))
            .flat_map(|(_, v)| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case("chunked"))
    }

    /// 解析 `Content-Length`。
    ///
    /// 多个取值不一致或不是数字时返回错误。
    pub fn content_length(&self) -> Result<Option<u64>, Exception> {
        let mut length = None;
        for (_, value) in self
            .headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case("Content-Length"))
        {
            let parsed = value
                .trim()
                .parse::<u64>()
                .map_err(|_| Exception::MalformedRequest)?;
            match length {
                Some(prev) if prev != parsed => return Err(Exception::MalformedRequest),
                _ => length = Some(parsed),
            }
        }
        Ok(length)
    }
}
