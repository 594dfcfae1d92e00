// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 请求体分帧
//!
//! 把 `Transfer-Encoding: chunked` 或 `Content-Length` 形式的请求体切分为一串 [`Fragment`]。
//! 片段边界只取决于数据到达的节奏，与 multipart 的边界没有任何对齐关系。
//! 最后一个片段总会被送出（可能为空），并带有 `last` 标记。

use bytes::{Buf, Bytes, BytesMut};

use crate::{exception::Exception, request::Request, util::find_subslice};

/// 分块大小行（含扩展）允许的最大长度
const MAX_CHUNK_LINE: usize = 1024;
/// trailer 部分允许的最大长度
const MAX_TRAILER: usize = 8192;

/// 请求体的一个片段
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    data: Bytes,
    last: bool,
}

impl Fragment {
    pub fn new(data: Bytes, last: bool) -> Self {
        Self { data, last }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn is_last(&self) -> bool {
        self.last
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkedStage {
    Size,
    Data(u64),
    DataEnd,
    Trailer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Chunked(ChunkedStage),
    Length(u64),
    Done,
}

/// 增量式请求体解码器。
///
/// 调用方把从套接字读到的数据追加进缓冲区，然后反复调用 [`BodyDecoder::decode`]，
/// 直到它返回 `None`（需要更多数据）或送出最后一个片段。
#[derive(Debug)]
pub struct BodyDecoder {
    framing: Framing,
    trailer_bytes: usize,
}

impl BodyDecoder {
    /// 根据请求头决定分帧方式。分块传输优先于 `Content-Length`。
    pub fn for_request(request: &Request) -> Result<Self, Exception> {
        let framing = if request.is_chunked() {
            Framing::Chunked(ChunkedStage::Size)
        } else {
            Framing::Length(request.content_length()?.unwrap_or(0))
        };
        Ok(Self {
            framing,
            trailer_bytes: 0,
        })
    }

    pub fn chunked() -> Self {
        Self {
            framing: Framing::Chunked(ChunkedStage::Size),
            trailer_bytes: 0,
        }
    }

    pub fn with_length(length: u64) -> Self {
        Self {
            framing: Framing::Length(length),
            trailer_bytes: 0,
        }
    }

    /// 最后一个片段是否已经送出
    pub fn is_done(&self) -> bool {
        self.framing == Framing::Done
    }

    /// 从缓冲区中取出下一个片段。
    ///
    /// 返回 `Ok(None)` 表示需要更多数据；分块格式非法时返回 `Exception::NotHttpContent`。
    /// 属于下一个请求的数据会留在缓冲区中。
    pub fn decode(&mut self, buffer: &mut BytesMut) -> Result<Option<Fragment>, Exception> {
        loop {
            match self.framing {
                Framing::Done => return Ok(None),
                Framing::Length(0) => {
                    self.framing = Framing::Done;
                    return Ok(Some(Fragment::new(Bytes::new(), true)));
                }
                Framing::Length(remaining) => {
                    if buffer.is_empty() {
                        return Ok(None);
                    }
                    let n = remaining.min(buffer.len() as u64);
                    let data = buffer.split_to(n as usize).freeze();
                    let left = remaining - n;
                    let last = left == 0;
                    self.framing = if last { Framing::Done } else { Framing::Length(left) };
                    return Ok(Some(Fragment::new(data, last)));
                }
                Framing::Chunked(stage) => match self.decode_chunked(stage, buffer)? {
                    Step::Continue => continue,
                    Step::NeedMore => return Ok(None),
                    Step::Emit(fragment) => return Ok(Some(fragment)),
                },
            }
        }
    }

    fn decode_chunked(&mut self, stage: ChunkedStage, buffer: &mut BytesMut) -> Result<Step, Exception> {
        match stage {
            ChunkedStage::Size => {
                let end = match find_subslice(&buffer[..], b"\r\n") {
                    Some(end) => end,
                    None if buffer.len() > MAX_CHUNK_LINE => return Err(Exception::NotHttpContent),
                    None => return Ok(Step::NeedMore),
                };
                let size = parse_chunk_size(&buffer[..end])?;
                buffer.advance(end + 2);
                self.framing = if size == 0 {
                    Framing::Chunked(ChunkedStage::Trailer)
                } else {
                    Framing::Chunked(ChunkedStage::Data(size))
                };
                Ok(Step::Continue)
            }
            ChunkedStage::Data(remaining) => {
                if buffer.is_empty() {
                    return Ok(Step::NeedMore);
                }
                let n = remaining.min(buffer.len() as u64);
                let data = buffer.split_to(n as usize).freeze();
                let left = remaining - n;
                self.framing = if left == 0 {
                    Framing::Chunked(ChunkedStage::DataEnd)
                } else {
                    Framing::Chunked(ChunkedStage::Data(left))
                };
                Ok(Step::Emit(Fragment::new(data, false)))
            }
            ChunkedStage::DataEnd => {
                if buffer.len() < 2 {
                    return Ok(Step::NeedMore);
                }
                if &buffer[..2] != b"\r\n" {
                    return Err(Exception::NotHttpContent);
                }
                buffer.advance(2);
                self.framing = Framing::Chunked(ChunkedStage::Size);
                Ok(Step::Continue)
            }
            ChunkedStage::Trailer => {
                let end = match find_subslice(&buffer[..], b"\r\n") {
                    Some(end) => end,
                    None if self.trailer_bytes + buffer.len() > MAX_TRAILER => {
                        return Err(Exception::NotHttpContent)
                    }
                    None => return Ok(Step::NeedMore),
                };
                buffer.advance(end + 2);
                if end == 0 {
                    self.framing = Framing::Done;
                    return Ok(Step::Emit(Fragment::new(Bytes::new(), true)));
                }
                // trailer 标头直接丢弃
                self.trailer_bytes += end + 2;
                if self.trailer_bytes > MAX_TRAILER {
                    return Err(Exception::NotHttpContent);
                }
                Ok(Step::Continue)
            }
        }
    }
}

enum Step {
    Continue,
    NeedMore,
    Emit(Fragment),
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, Exception> {
    let line = std::str::from_utf8(line).map_err(|_| Exception::NotHttpContent)?;
    let size = line.split(';').next().unwrap_or("").trim();
    if size.is_empty() || size.len() > 15 {
        return Err(Exception::NotHttpContent);
    }
    u64::from_str_radix(size, 16).map_err(|_| Exception::NotHttpContent)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(decoder: &mut BodyDecoder, buffer: &mut BytesMut) -> Result<Vec<Fragment>, Exception> {
        let mut fragments = Vec::new();
        while let Some(f) = decoder.decode(buffer)? {
            fragments.push(f);
        }
        Ok(fragments)
    }

    fn concat(fragments: &[Fragment]) -> Vec<u8> {
        fragments.iter().flat_map(|f| f.data().to_vec()).collect()
    }

    #[test]
    fn test_chunked_body() {
        let mut decoder = BodyDecoder::chunked();
        let mut buffer = BytesMut::from(&b"5\r\nhello\r\n6;ext=1\r\n world\r\n0\r\n\r\nGET"[..]);

        let fragments = drain(&mut decoder, &mut buffer).unwrap();

        assert_eq!(concat(&fragments), b"hello world");
        assert!(fragments.last().unwrap().is_last());
        assert!(decoder.is_done());
        // 下一个请求的数据保持不动
        assert_eq!(&buffer[..], b"GET");
    }

    /// 数据逐字节到达时结果不变
    #[test]
    fn test_chunked_body_byte_by_byte() {
        let raw = b"3\r\nabc\r\nA\r\n0123456789\r\n0\r\nX-Trailer: 1\r\n\r\n";
        let mut decoder = BodyDecoder::chunked();
        let mut buffer = BytesMut::new();
        let mut fragments = Vec::new();
        for b in raw.iter() {
            buffer.extend_from_slice(&[*b]);
            fragments.extend(drain(&mut decoder, &mut buffer).unwrap());
        }

        assert_eq!(concat(&fragments), b"abc0123456789");
        assert_eq!(fragments.iter().filter(|f| f.is_last()).count(), 1);
        assert!(decoder.is_done());
    }

    #[test]
    fn test_chunked_invalid_size() {
        let mut decoder = BodyDecoder::chunked();
        let mut buffer = BytesMut::from(&b"zz\r\nhello\r\n"[..]);
        assert_eq!(drain(&mut decoder, &mut buffer).unwrap_err(), Exception::NotHttpContent);
    }

    #[test]
    fn test_chunked_missing_crlf_after_data() {
        let mut decoder = BodyDecoder::chunked();
        let mut buffer = BytesMut::from(&b"2\r\nabXX0\r\n\r\n"[..]);
        assert_eq!(drain(&mut decoder, &mut buffer).unwrap_err(), Exception::NotHttpContent);
    }

    #[test]
    fn test_length_body() {
        let mut decoder = BodyDecoder::with_length(5);
        let mut buffer = BytesMut::from(&b"hel"[..]);
        let first = drain(&mut decoder, &mut buffer).unwrap();
        assert_eq!(first.len(), 1);
        assert!(!first[0].is_last());

        buffer.extend_from_slice(b"loNEXT");
        let second = drain(&mut decoder, &mut buffer).unwrap();
        assert_eq!(second[0].data().as_ref(), b"lo");
        assert!(second[0].is_last());
        assert_eq!(&buffer[..], b"NEXT");
    }

    #[test]
    fn test_empty_body_yields_single_last_fragment() {
        let mut decoder = BodyDecoder::with_length(0);
        let mut buffer = BytesMut::new();
        let fragments = drain(&mut decoder, &mut buffer).unwrap();
        assert_eq!(fragments, vec![Fragment::new(Bytes::new(), true)]);
    }

    #[test]
    fn test_for_request_prefers_chunked() {
        let request = Request::try_from(
            b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\nContent-Length: 3\r\n\r\n",
            0,
        )
        .unwrap();
        let mut decoder = BodyDecoder::for_request(&request).unwrap();
        let mut buffer = BytesMut::from(&b"0\r\n\r\n"[..]);
        let fragments = drain(&mut decoder, &mut buffer).unwrap();
        assert_eq!(fragments.len(), 1);
        assert!(fragments[0].is_last());
    }
}
