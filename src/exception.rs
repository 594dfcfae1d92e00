// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # Exception 模块
//!
//! 定义服务器在处理下载、上传请求时可能出现的全部异常情况。
//!
//! ## 设计意图
//! - **错误分类**：覆盖请求头解析、Multipart 解码、文件系统访问三类错误。
//! - **语义映射**：每个变体都能通过 [`Exception::status_code`] 转换为 HTTP 状态码，
//!   并通过 [`Exception::message`] 给出返回给客户端的正文。
//! - **就地处理**：异常在检测点立即转换为响应，不会越过连接边界继续传播。

use std::fmt;

/// 服务器处理请求过程中发生的异常类型。
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Exception {
    /// 请求头无法解析为合法的 UTF-8 字符串。
    RequestIsNotUtf8,
    /// 请求行或请求头格式不正确。
    MalformedRequest,
    /// 请求头超过了配置允许的最大长度。
    HeaderTooLarge,
    /// 客户端使用了服务器不支持的 HTTP 协议版本。
    UnsupportedHttpVersion,
    /// GET 请求缺少 `file` 查询参数。
    MissingFileParam,
    /// POST 请求体不是 multipart/form-data。
    NotMultipart,
    /// 请求体的分块编码不合法，无法识别为 HTTP 内容片段。
    NotHttpContent,
    /// Multipart 报文的边界或分段头不合法。
    MultipartDecode,
    /// 解码器吐出了尚未完成的文件分段。
    IncompleteFilePart,
    /// 上传文件名为空或包含非法字符。
    InvalidFileName,
    /// 整个请求体解码完毕但其中没有文件分段。
    MissingFilePart,
    /// 同一连接上已有一个上传会话正在进行。
    UploadInProgress,
    /// 上传成功，但序列化 JSON 响应失败。
    JsonEncode,
    /// 请求的文件不存在、是目录或是隐藏文件。对应 `404 Not Found`。
    FileNotFound,
    /// 请求的路径存在但不是可读的普通文件。对应 `403 Forbidden`。
    Forbidden,
    /// 不支持的请求方法。对应 `405 Method Not Allowed`。
    MethodNotAllowed,
    /// 在合法请求的处理过程中发生了文件读写错误。
    Io,
    /// 连接在空闲超时时间内没有任何数据到达。
    Timeout,
}

use Exception::*;

impl Exception {
    /// 该异常对应的 HTTP 状态码
    pub fn status_code(&self) -> u16 {
        match self {
            FileNotFound => 404,
            Forbidden => 403,
            MethodNotAllowed => 405,
            Io => 500,
            Timeout => 408,
            _ => 400,
        }
    }

    /// 返回给客户端的正文。
    ///
    /// `None` 表示使用通用的 `Failure: <status>` 格式。
    pub fn message(&self) -> Option<&'static str> {
        match self {
            MissingFileParam => Some("file query param not found"),
            NotMultipart => Some("Not a multipart request"),
            NotHttpContent => Some("Not a http request"),
            MultipartDecode => Some("Failed to decode file data"),
            IncompleteFilePart => Some("Unknown error occurred"),
            InvalidFileName => Some("Invalid file name"),
            MissingFilePart => Some("No file part found"),
            UploadInProgress => Some("Upload already in progress"),
            JsonEncode | Io => Some("Unexpected error occurred"),
            _ => None,
        }
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestIsNotUtf8 => write!(f, "Request bytes can't be parsed in UTF-8"),
            MalformedRequest => write!(f, "Malformed request head"),
            HeaderTooLarge => write!(f, "Request head too large"),
            UnsupportedHttpVersion => write!(f, "Unsupported HTTP version"),
            MissingFileParam => write!(f, "Missing file query parameter"),
            NotMultipart => write!(f, "Request body is not multipart"),
            NotHttpContent => write!(f, "Body framing is not valid HTTP content"),
            MultipartDecode => write!(f, "Multipart body could not be decoded"),
            IncompleteFilePart => write!(f, "File part surfaced before it was complete"),
            InvalidFileName => write!(f, "Invalid upload file name"),
            MissingFilePart => write!(f, "Multipart body contained no file part"),
            UploadInProgress => write!(f, "An upload is already in progress"),
            JsonEncode => write!(f, "Couldn't encode JSON response"),
            FileNotFound => write!(f, "File not found (404)"),
            Forbidden => write!(f, "Forbidden (403)"),
            MethodNotAllowed => write!(f, "Method not allowed (405)"),
            Io => write!(f, "I/O error while handling request"),
            Timeout => write!(f, "Connection idle timeout"),
        }
    }
}
