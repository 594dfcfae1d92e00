// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # HTTP 响应构建
//!
//! 负责生成错误响应、CORS 预检响应、上传成功的 JSON 响应以及文件下载响应，
//! 并把它们写入连接。文件正文按 `chunk_size` 分块发送，内存占用与文件大小无关。

use crate::{exception::Exception, param::*};

use bytes::Bytes;
use chrono::prelude::*;
use log::{debug, error};
use serde_derive::Serialize;
use tokio::{
    fs::File as TokioFile,
    io::{self, AsyncReadExt, AsyncWrite, AsyncWriteExt},
};

/// 响应发送完毕后连接的去向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    KeepAlive,
    Close,
}

/// 响应正文
#[derive(Debug)]
pub enum Body {
    Empty,
    Full(Bytes),
    /// 以流的方式发送的文件，长度即 `Content-Length`
    File(TokioFile),
}

#[derive(Serialize)]
struct UploadReceipt<'a> {
    file: &'a str,
}

#[derive(Debug)]
pub struct Response {
    version: HttpVersion,
    status_code: u16,
    information: String,
    content_type: Option<String>,
    content_length: u64,
    date: DateTime<Utc>,
    server_name: String,
    headers: Vec<(String, String)>,
    body: Body,
    disposition: Disposition,
}

impl Response {
    pub fn new() -> Self {
        Self {
            version: HttpVersion::V1_1,
            status_code: 200,
            information: "OK".to_string(),
            content_type: None,
            content_length: 0,
            date: Utc::now(),
            server_name: SERVER_NAME.to_string(),
            headers: Vec::new(),
            body: Body::Empty,
            disposition: Disposition::Close,
        }
    }

    fn set_code(&mut self, code: u16) -> &mut Self {
        self.status_code = code;
        self.information = match STATUS_CODES.get(&code) {
            Some(&reason) => reason.to_string(),
            None => {
                error!("未登记的状态码：{}", code);
                "Unknown".to_string()
            }
        };
        self
    }

    fn set_text(&mut self, content_type: &str, text: String) -> &mut Self {
        let bytes = Bytes::from(text);
        self.content_type = Some(content_type.to_string());
        self.content_length = bytes.len() as u64;
        self.body = Body::Full(bytes);
        self
    }

    fn add_header(&mut self, name: &str, value: &str) -> &mut Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// 错误响应。正文为 `Failure: <status>\r\n`，发送后关闭连接。
    pub fn error(code: u16) -> Self {
        let mut response = Self::new();
        response.set_code(code);
        let text = format!("Failure: {} {}{}", code, response.information, CRLF);
        response.set_text(CONTENT_TYPE_TEXT, text);
        response
    }

    /// 带自定义正文的错误响应，发送后关闭连接。
    pub fn error_with_message(code: u16, message: &str) -> Self {
        let mut response = Self::new();
        response.set_code(code).set_text(CONTENT_TYPE_TEXT, message.to_string());
        response
    }

    pub fn from_exception(exception: Exception) -> Self {
        match exception.message() {
            Some(message) => Self::error_with_message(exception.status_code(), message),
            None => Self::error(exception.status_code()),
        }
    }

    /// CORS 预检响应，没有正文，发送后关闭连接。
    pub fn preflight() -> Self {
        let mut response = Self::new();
        response
            .set_code(200)
            .add_header("Access-Control-Allow-Origin", CORS_ALLOW_ORIGIN)
            .add_header("Access-Control-Allow-Methods", CORS_ALLOW_METHODS)
            .add_header("Access-Control-Allow-Headers", CORS_ALLOW_HEADERS);
        response
    }

    /// 上传成功响应：`{"file": "<storedName>"}`。
    pub fn upload_success(stored_name: &str) -> Self {
        Self::upload_receipt(serde_json::to_string(&UploadReceipt { file: stored_name }))
    }

    /// JSON 序列化失败时降级为 400 纯文本响应。
    fn upload_receipt(json: serde_json::Result<String>) -> Self {
        let mut response = Self::new();
        match json {
            Ok(json) => {
                response.set_code(200).set_text(CONTENT_TYPE_JSON, json);
            }
            Err(e) => {
                error!("序列化上传结果失败：{}", e);
                let exception = Exception::JsonEncode;
                response
                    .set_code(exception.status_code())
                    .set_text(CONTENT_TYPE_TEXT, exception.message().unwrap_or("").to_string());
            }
        }
        response.add_header("Access-Control-Allow-Origin", CORS_ALLOW_ORIGIN);
        response
    }

    /// 文件下载响应。正文在 [`Response::write_to`] 中分块发送。
    pub fn from_file(file: TokioFile, length: u64, mime: &str, keep_alive: bool) -> Self {
        let mut response = Self::new();
        response.set_code(200);
        response.content_type = Some(mime.to_string());
        response.content_length = length;
        response.body = Body::File(file);
        response.disposition = match keep_alive {
            true => Disposition::KeepAlive,
            false => Disposition::Close,
        };
        response
    }

    /// 状态行与全部响应头
    pub fn head_bytes(&self) -> Vec<u8> {
        let mut header = format!(
            "{} {} {}{}",
            self.version, self.status_code, self.information, CRLF
        );
        if let Some(t) = &self.content_type {
            header.push_str(&["Content-Type: ", t, CRLF].concat());
        }
        header.push_str(&["Content-Length: ", &self.content_length.to_string(), CRLF].concat());
        header.push_str(&["Date: ", &format_date(&self.date), CRLF].concat());
        header.push_str(&["Server: ", &self.server_name, CRLF].concat());
        for (name, value) in &self.headers {
            header.push_str(&[name.as_str(), ": ", value.as_str(), CRLF].concat());
        }
        let connection = match self.disposition {
            Disposition::KeepAlive => "keep-alive",
            Disposition::Close => "close",
        };
        header.push_str(&["Connection: ", connection, CRLF, CRLF].concat());
        header.into_bytes()
    }

    /// 把响应写入连接，返回连接的去向。
    ///
    /// 文件正文恰好发送 `Content-Length` 个字节；文件中途变短时返回错误，
    /// 调用方必须关闭连接。文件句柄在函数返回时释放。
    pub async fn write_to<W>(self, writer: &mut W, chunk_size: usize, id: u128) -> io::Result<Disposition>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(&self.head_bytes()).await?;
        match self.body {
            Body::Empty => {}
            Body::Full(bytes) => writer.write_all(&bytes).await?,
            Body::File(file) => {
                let length = self.content_length;
                debug!("[ID{}]开始流式传输，文件大小: {} bytes", id, length);
                let mut reader = file.take(length);
                let mut buffer = vec![0u8; chunk_size.max(1)];
                let mut total_sent = 0u64;
                loop {
                    match reader.read(&mut buffer).await? {
                        0 => break,
                        n => {
                            writer.write_all(&buffer[..n]).await?;
                            total_sent += n as u64;
                        }
                    }
                }
                if total_sent != length {
                    error!("[ID{}]文件在传输过程中变短：应发送{}字节，实际{}字节", id, length, total_sent);
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "file shrank during transfer",
                    ));
                }
                debug!("[ID{}]流式传输完成，共发送 {} 字节", id, total_sent);
            }
        }
        writer.flush().await?;
        Ok(self.disposition)
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

    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn disposition(&self) -> Disposition {
        self.disposition
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.body, Body::File(_))
    }

    /// 大小写不敏感地查询附加响应头
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// 内存中的正文；文件正文返回 `None`
    pub fn body_bytes(&self) -> Option<&[u8]> {
        match &self.body {
            Body::Full(bytes) => Some(&bytes[..]),
            Body::Empty => Some(&[]),
            Body::File(_) => None,
        }
    }
}

fn format_date(date: &DateTime<Utc>) -> String {
    date.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn as_text(response: &Response) -> String {
        let mut bytes = response.head_bytes();
        bytes.extend_from_slice(response.body_bytes().unwrap_or(b""));
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn test_format_date() {
        let formatted = format_date(&Utc::now());
        assert!(formatted.contains("+0000") || formatted.contains("GMT"));
    }

    #[test]
    fn test_error_response() {
        let response = Response::error(404);
        let text = as_text(&response);

        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains("Content-Type: text/plain; charset=UTF-8\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("\r\n\r\nFailure: 404 Not Found\r\n"));
        assert_eq!(response.content_length(), "Failure: 404 Not Found\r\n".len() as u64);
        assert_eq!(response.disposition(), Disposition::Close);
    }

    #[test]
    fn test_error_with_message() {
        let response = Response::from_exception(Exception::NotMultipart);
        assert_eq!(response.status_code(), 400);
        assert_eq!(response.body_bytes().unwrap(), b"Not a multipart request");
    }

    #[test]
    fn test_from_exception_without_message() {
        let response = Response::from_exception(Exception::MethodNotAllowed);
        assert_eq!(response.status_code(), 405);
        assert_eq!(response.body_bytes().unwrap(), b"Failure: 405 Method Not Allowed\r\n");
    }

    #[test]
    fn test_preflight_response() {
        let response = Response::preflight();
        let text = as_text(&response);

        assert_eq!(response.status_code(), 200);
        assert_eq!(response.header("access-control-allow-origin"), Some("*"));
        assert_eq!(response.header("Access-Control-Allow-Methods"), Some("GET,POST,OPTIONS"));
        assert_eq!(
            response.header("Access-Control-Allow-Headers"),
            Some("X-Requested-With, Content-Type, Content-Length")
        );
        assert!(text.contains("Content-Length: 0\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
        assert_eq!(response.disposition(), Disposition::Close);
    }

    #[test]
    fn test_upload_success_response() {
        let response = Response::upload_success("1700000000000_a \"b\".txt");

        assert_eq!(response.status_code(), 200);
        assert_eq!(response.content_type(), Some("application/json; charset=UTF-8"));
        assert_eq!(response.header("Access-Control-Allow-Origin"), Some("*"));
        let json: serde_json::Value = serde_json::from_slice(response.body_bytes().unwrap()).unwrap();
        assert_eq!(json["file"], "1700000000000_a \"b\".txt");
        assert_eq!(response.disposition(), Disposition::Close);
    }

    /// JSON 序列化失败时降级为 400 纯文本响应
    #[test]
    fn test_upload_receipt_json_failure() {
        let failure = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let response = Response::upload_receipt(Err(failure));

        assert_eq!(response.status_code(), 400);
        assert_eq!(response.content_type(), Some("text/plain; charset=UTF-8"));
        assert_eq!(response.body_bytes().unwrap(), b"Unexpected error occurred");
        assert_eq!(response.disposition(), Disposition::Close);
    }

    #[tokio::test]
    async fn test_write_file_response() {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(b"0123456789").unwrap();
        let file = TokioFile::open(temp.path()).await.unwrap();
        let response = Response::from_file(file, 10, "text/plain", true);

        let mut out = Vec::new();
        let disposition = response.write_to(&mut out, 3, 0).await.unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 10\r\n"));
        assert!(text.contains("Connection: keep-alive\r\n"));
        assert!(text.ends_with("\r\n\r\n0123456789"));
        assert_eq!(disposition, Disposition::KeepAlive);
    }

    /// 文件比声明的长度短时发送失败
    #[tokio::test]
    async fn test_write_file_shorter_than_declared() {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(b"short").unwrap();
        let file = TokioFile::open(temp.path()).await.unwrap();
        let response = Response::from_file(file, 100, "text/plain", true);

        let mut out = Vec::new();
        let result = response.write_to(&mut out, 64, 0).await;
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::UnexpectedEof);
    }
}
