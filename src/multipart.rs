// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # Multipart 增量解码器
//!
//! 以片段为单位接收 multipart/form-data 请求体，边接收边解析，
//! 把已经完整的分段放入就绪队列，供调用方用 [`MultipartDecoder::next`] 逐个取出。
//!
//! 解析过程分为以下几个阶段：
//! 1. `Preamble`：跳过第一个分隔符之前的前言。
//! 2. `AfterDelimiter`：分隔符之后是 `--`（结束）还是 CRLF（新分段）。
//! 3. `Headers`：读取分段头，识别 `Content-Disposition` 中的 `name` 与 `filename`。
//! 4. `Body`：把分段内容写入内存或暂存文件，直到遇到下一个分隔符。
//! 5. `Epilogue`：结束分隔符之后的内容全部丢弃。
//!
//! 文件分段超过内存阈值后会转存到根目录下的隐藏临时文件中；
//! 解码器被丢弃时，所有尚未交出的临时文件随之删除。

use std::{
    collections::VecDeque,
    fmt,
    io::{self, Write},
    path::{Path, PathBuf},
};

use bytes::{Buf, Bytes, BytesMut};
use lazy_static::lazy_static;
use log::{debug, error};
use regex::Regex;
use tempfile::NamedTempFile;

use crate::{exception::Exception, param::SPOOL_PREFIX, util::find_subslice};

/// 分段头允许的最大长度
const MAX_PART_HEADER: usize = 8192;
/// RFC 2046 规定边界最长 70 个字符
const MAX_BOUNDARY: usize = 70;

lazy_static! {
    static ref BOUNDARY_RE: Regex =
        Regex::new(r#"(?i)(?:^|;)\s*boundary\s*=\s*(?:"([^"]+)"|([^;\s]+))"#).unwrap();
    static ref DISPOSITION_PARAM_RE: Regex =
        Regex::new(r#"(?i);\s*([a-z0-9_*-]+)\s*=\s*(?:"((?:[^"\\]|\\.)*)"|([^;\s]*))"#).unwrap();
}

/// 从 `Content-Type` 中识别 multipart/form-data 及其边界。
///
/// 不是 multipart/form-data 时返回 `Exception::NotMultipart`；
/// 是 multipart 但边界缺失或非法时返回 `Exception::MultipartDecode`。
pub fn boundary_of(content_type: Option<&str>) -> Result<String, Exception> {
    let content_type = content_type.ok_or(Exception::NotMultipart)?;
    let mime = content_type.split(';').next().unwrap_or("").trim();
    if !mime.eq_ignore_ascii_case("multipart/form-data") {
        return Err(Exception::NotMultipart);
    }
    let params = &content_type[content_type.find(';').unwrap_or(content_type.len())..];
    let captures = BOUNDARY_RE.captures(params).ok_or(Exception::MultipartDecode)?;
    let boundary = captures
        .get(1)
        .or_else(|| captures.get(2))
        .map(|m| m.as_str())
        .unwrap_or("");
    if boundary.is_empty() || boundary.len() > MAX_BOUNDARY {
        return Err(Exception::MultipartDecode);
    }
    Ok(boundary.to_string())
}

/// 分段内容：小文件留在内存，大文件转存到临时文件
pub enum PartContent {
    Memory(Bytes),
    Disk(NamedTempFile),
}

impl fmt::Debug for PartContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartContent::Memory(bytes) => write!(f, "Memory({} bytes)", bytes.len()),
            PartContent::Disk(file) => write!(f, "Disk({})", file.path().display()),
        }
    }
}

/// 一个上传的文件分段
#[derive(Debug)]
pub struct FileUpload {
    name: String,
    filename: String,
    content_type: Option<String>,
    completed: bool,
    size: u64,
    content: PartContent,
}

impl FileUpload {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 客户端声明的原始文件名（未经处理）
    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_in_memory(&self) -> bool {
        matches!(self.content, PartContent::Memory(_))
    }

    pub fn into_content(self) -> PartContent {
        self.content
    }
}

/// 解码得到的一个分段。只有 `FilePart` 会被持久化，其余字段被忽略。
#[derive(Debug)]
pub enum DecodedItem {
    FilePart(FileUpload),
    OtherField { name: String, value: Bytes },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Preamble,
    AfterDelimiter,
    Headers,
    Body,
    Epilogue,
}

/// 正在接收中的分段
struct PartBuilder {
    name: String,
    filename: Option<String>,
    content_type: Option<String>,
    size: u64,
    sink: Sink,
}

enum Sink {
    Memory(BytesMut),
    Disk(NamedTempFile),
}

/// Multipart 增量解码器
pub struct MultipartDecoder {
    /// `--boundary`
    dash_boundary: Vec<u8>,
    /// `\r\n--boundary`
    delimiter: Vec<u8>,
    buffer: BytesMut,
    stage: Stage,
    /// 尚未丢弃或消费任何前言字节，只有此时才允许不带前导 CRLF 的分隔符
    at_body_start: bool,
    current: Option<PartBuilder>,
    ready: VecDeque<DecodedItem>,
    memory_threshold: usize,
    spool_dir: PathBuf,
    id: u128,
}

impl MultipartDecoder {
    /// 创建解码器。
    ///
    /// * `spool_dir` - 大文件分段的暂存目录，应与最终存放目录位于同一文件系统。
    /// * `memory_threshold` - 单个分段在内存中保留的最大字节数。
    pub fn new(boundary: &str, spool_dir: &Path, memory_threshold: usize, id: u128) -> Self {
        let dash_boundary = [b"--".as_slice(), boundary.as_bytes()].concat();
        let delimiter = [b"\r\n".as_slice(), dash_boundary.as_slice()].concat();
        Self {
            dash_boundary,
            delimiter,
            buffer: BytesMut::new(),
            stage: Stage::Preamble,
            at_body_start: true,
            current: None,
            ready: VecDeque::new(),
            memory_threshold,
            spool_dir: spool_dir.to_path_buf(),
            id,
        }
    }

    /// 喂入一个片段并尽可能向前解析。
    ///
    /// 格式错误时返回 `Exception::MultipartDecode`，此后解码器不应再被使用。
    pub fn offer(&mut self, data: &[u8]) -> Result<(), Exception> {
        self.buffer.extend_from_slice(data);
        while self.step()? {}
        Ok(())
    }

    /// 请求体已经全部到达。结束分隔符尚未出现时视为格式错误。
    pub fn finish(&mut self) -> Result<(), Exception> {
        if !self.is_finished() {
            error!("[ID{}]multipart报文在结束分隔符之前终止，当前阶段：{:?}", self.id, self.stage);
            self.current = None;
            return Err(Exception::MultipartDecode);
        }
        Ok(())
    }

    pub fn has_next(&self) -> bool {
        !self.ready.is_empty()
    }

    /// 取出下一个已经完整的分段
    pub fn next(&mut self) -> Option<DecodedItem> {
        self.ready.pop_front()
    }

    /// 是否已经读到结束分隔符
    pub fn is_finished(&self) -> bool {
        self.stage == Stage::Epilogue
    }

    /// 释放解码器持有的全部资源：缓冲区、未完成的分段以及未取走的分段。
    pub fn destroy(mut self) {
        self.release();
    }

    fn release(&mut self) {
        let pending = self.ready.len() + usize::from(self.current.is_some());
        if pending > 0 {
            debug!("[ID{}]释放{}个未处理的分段", self.id, pending);
        }
        self.current = None;
        self.ready.clear();
        self.buffer = BytesMut::new();
    }

    /// 执行一步解析。返回 `true` 表示取得了进展，可以继续。
    fn step(&mut self) -> Result<bool, Exception> {
        match self.stage {
            Stage::Preamble => self.skip_preamble(),
            Stage::AfterDelimiter => self.read_after_delimiter(),
            Stage::Headers => self.read_headers(),
            Stage::Body => self.read_body(),
            Stage::Epilogue => {
                self.buffer.clear();
                Ok(false)
            }
        }
    }

    fn skip_preamble(&mut self) -> Result<bool, Exception> {
        // 第一个分隔符可以位于报文开头，也可以跟在前言后的 CRLF 之后
        if self.at_body_start {
            if self.buffer.starts_with(&self.dash_boundary) {
                self.at_body_start = false;
                self.buffer.advance(self.dash_boundary.len());
                self.stage = Stage::AfterDelimiter;
                return Ok(true);
            }
            if self.buffer.len() < self.dash_boundary.len()
                && self.dash_boundary.starts_with(&self.buffer[..])
            {
                return Ok(false);
            }
            self.at_body_start = false;
        }
        match find_subslice(&self.buffer, &self.delimiter) {
            Some(pos) => {
                self.buffer.advance(pos + self.delimiter.len());
                self.stage = Stage::AfterDelimiter;
                Ok(true)
            }
            None => {
                // 保留可能是分隔符前缀的尾部
                let keep = self.delimiter.len() - 1;
                if self.buffer.len() > keep {
                    let discard = self.buffer.len() - keep;
                    self.buffer.advance(discard);
                }
                Ok(false)
            }
        }
    }

    fn read_after_delimiter(&mut self) -> Result<bool, Exception> {
        if self.buffer.len() < 2 {
            return Ok(false);
        }
        if self.buffer.starts_with(b"--") {
            debug!("[ID{}]读到multipart结束分隔符", self.id);
            self.buffer.advance(2);
            self.stage = Stage::Epilogue;
            return Ok(true);
        }
        // 分隔符之后允许出现线性空白，然后必须是 CRLF
        let padding = self
            .buffer
            .iter()
            .take_while(|b| **b == b' ' || **b == b'\t')
            .count();
        if self.buffer.len() < padding + 2 {
            if padding > MAX_PART_HEADER {
                return Err(Exception::MultipartDecode);
            }
            return Ok(false);
        }
        if &self.buffer[padding..padding + 2] != b"\r\n" {
            error!("[ID{}]multipart分隔符之后缺少CRLF", self.id);
            return Err(Exception::MultipartDecode);
        }
        self.buffer.advance(padding + 2);
        self.stage = Stage::Headers;
        Ok(true)
    }

    fn read_headers(&mut self) -> Result<bool, Exception> {
        // 没有任何分段头的情况
        let (header_len, consumed) = if self.buffer.starts_with(b"\r\n") {
            (0, 2)
        } else {
            match find_subslice(&self.buffer, b"\r\n\r\n") {
                Some(pos) => (pos, pos + 4),
                None if self.buffer.len() > MAX_PART_HEADER => {
                    error!("[ID{}]multipart分段头过长", self.id);
                    return Err(Exception::MultipartDecode);
                }
                None => return Ok(false),
            }
        };
        if header_len > MAX_PART_HEADER {
            return Err(Exception::MultipartDecode);
        }
        let part = self.parse_part_headers(&self.buffer[..header_len])?;
        self.buffer.advance(consumed);
        debug!(
            "[ID{}]开始接收分段：name={}, filename={:?}",
            self.id, part.name, part.filename
        );
        self.current = Some(part);
        self.stage = Stage::Body;
        Ok(true)
    }

    fn parse_part_headers(&self, raw: &[u8]) -> Result<PartBuilder, Exception> {
        let text = std::str::from_utf8(raw).map_err(|_| {
            error!("[ID{}]multipart分段头不是合法的UTF-8", self.id);
            Exception::MultipartDecode
        })?;
        let mut name = None;
        let mut filename = None;
        let mut content_type = None;
        for line in text.split("\r\n").filter(|l| !l.is_empty()) {
            let (key, value) = line.split_once(':').ok_or(Exception::MultipartDecode)?;
            let key = key.trim();
            let value = value.trim();
            if key.eq_ignore_ascii_case("Content-Disposition") {
                let kind = value.split(';').next().unwrap_or("").trim();
                if !kind.eq_ignore_ascii_case("form-data") {
                    error!("[ID{}]不支持的Content-Disposition：{}", self.id, value);
                    return Err(Exception::MultipartDecode);
                }
                for captures in DISPOSITION_PARAM_RE.captures_iter(value) {
                    let param = captures[1].to_ascii_lowercase();
                    let param_value = match captures.get(2) {
                        Some(quoted) => unescape_quoted(quoted.as_str()),
                        None => captures.get(3).map_or("", |m| m.as_str()).to_string(),
                    };
                    match param.as_str() {
                        "name" => name = Some(param_value),
                        "filename" => filename = Some(param_value),
                        _ => {}
                    }
                }
            } else if key.eq_ignore_ascii_case("Content-Type") {
                content_type = Some(value.to_string());
            }
        }
        let name = name.ok_or_else(|| {
            error!("[ID{}]multipart分段缺少name参数", self.id);
            Exception::MultipartDecode
        })?;
        Ok(PartBuilder {
            name,
            filename,
            content_type,
            size: 0,
            sink: Sink::Memory(BytesMut::new()),
        })
    }

    fn read_body(&mut self) -> Result<bool, Exception> {
        match find_subslice(&self.buffer, &self.delimiter) {
            Some(pos) => {
                let data = self.buffer.split_to(pos);
                self.buffer.advance(self.delimiter.len());
                self.write_current(&data)?;
                self.complete_current()?;
                self.stage = Stage::AfterDelimiter;
                Ok(true)
            }
            None => {
                // 尾部可能是分隔符的前缀，留到下一个片段再判断
                let keep = self.delimiter.len() - 1;
                if self.buffer.len() <= keep {
                    return Ok(false);
                }
                let data = self.buffer.split_to(self.buffer.len() - keep);
                self.write_current(&data)?;
                Ok(false)
            }
        }
    }

    fn write_current(&mut self, data: &[u8]) -> Result<(), Exception> {
        if data.is_empty() {
            return Ok(());
        }
        let id = self.id;
        let threshold = self.memory_threshold;
        let spool_dir = self.spool_dir.clone();
        let part = self.current.as_mut().ok_or(Exception::MultipartDecode)?;
        part.size += data.len() as u64;

        if let Sink::Memory(buffered) = &mut part.sink {
            if buffered.len() + data.len() <= threshold {
                buffered.extend_from_slice(data);
                return Ok(());
            }
            if part.filename.is_none() {
                error!("[ID{}]表单字段{}超过了{}字节的上限", id, part.name, threshold);
                return Err(Exception::MultipartDecode);
            }
            let mut spool = spool_file(&spool_dir).map_err(|e| {
                error!("[ID{}]无法在{}创建暂存文件：{}", id, spool_dir.display(), e);
                Exception::Io
            })?;
            debug!("[ID{}]分段{}超过内存阈值，转存到{}", id, part.name, spool.path().display());
            spool.write_all(&buffered[..]).map_err(|e| {
                error!("[ID{}]写入暂存文件失败：{}", id, e);
                Exception::Io
            })?;
            part.sink = Sink::Disk(spool);
        }
        if let Sink::Disk(spool) = &mut part.sink {
            spool.write_all(data).map_err(|e| {
                error!("[ID{}]写入暂存文件失败：{}", id, e);
                Exception::Io
            })?;
        }
        Ok(())
    }

    fn complete_current(&mut self) -> Result<(), Exception> {
        let part = self.current.take().ok_or(Exception::MultipartDecode)?;
        let item = match part.filename {
            Some(filename) => {
                let content = match part.sink {
                    Sink::Memory(buffered) => PartContent::Memory(buffered.freeze()),
                    Sink::Disk(mut spool) => {
                        spool.flush().map_err(|_| Exception::Io)?;
                        PartContent::Disk(spool)
                    }
                };
                DecodedItem::FilePart(FileUpload {
                    name: part.name,
                    filename,
                    content_type: part.content_type,
                    completed: true,
                    size: part.size,
                    content,
                })
            }
            None => {
                let value = match part.sink {
                    Sink::Memory(buffered) => buffered.freeze(),
                    Sink::Disk(_) => return Err(Exception::MultipartDecode),
                };
                DecodedItem::OtherField {
                    name: part.name,
                    value,
                }
            }
        };
        self.ready.push_back(item);
        Ok(())
    }
}

impl Drop for MultipartDecoder {
    fn drop(&mut self) {
        self.release();
    }
}

fn spool_file(dir: &Path) -> io::Result<NamedTempFile> {
    tempfile::Builder::new()
        .prefix(SPOOL_PREFIX)
        .tempfile_in(dir)
}

/// 引号内只有 `\"` 被视为转义，其余反斜杠原样保留（Windows 路径）
fn unescape_quoted(s: &str) -> String {
    s.replace("\\\"", "\"")
}
