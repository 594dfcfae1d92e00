// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 连接驱动
//!
//! 负责单个连接的生命周期：读取请求头、切分请求体、把请求交给 [`Handler`]，
//! 发送响应并根据响应决定保持连接还是关闭连接。
//!
//! 连接以泛型的 `AsyncRead + AsyncWrite` 表示，既可以是 `TcpStream`，
//! 也可以是测试中使用的内存管道。

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::{Buf, BytesMut};
use log::{debug, error, info, warn};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::timeout,
};

use crate::{
    body::{BodyDecoder, Fragment},
    config::Config,
    exception::Exception,
    handler::Handler,
    param::HttpRequestMethod,
    request::Request,
    response::{Disposition, Response},
    util::find_subslice,
};

/// 关闭连接前最多等待对端的时间
const LINGER_TIMEOUT: Duration = Duration::from_secs(2);
/// 关闭连接前最多丢弃的字节数
const LINGER_LIMIT: usize = 64 * 1024 * 1024;

/// 驱动一个连接直到关闭。
///
/// 连接上的所有错误都在这里转换为响应或直接关闭连接，不会向调用方传播。
pub async fn serve<S>(mut stream: S, id: u128, config: Arc<Config>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut handler = Handler::new(Arc::clone(&config), id);
    let mut buffer = BytesMut::with_capacity(8 * 1024);
    let idle = Duration::from_secs(config.idle_timeout_secs());

    loop {
        let head = match read_head(&mut stream, &mut buffer, config.max_header_size(), idle, id).await {
            Ok(Some(head)) => head,
            Ok(None) => break,
            Err(Exception::Timeout) => {
                debug!("[ID{}]连接空闲超时", id);
                break;
            }
            Err(Exception::Io) => break,
            Err(e) => {
                warn!("[ID{}]无法读取请求头：{}，返回400", id, e);
                let _ = Response::from_exception(e)
                    .write_to(&mut stream, config.chunk_size(), id)
                    .await;
                break;
            }
        };
        let start_time = Instant::now();

        let request = match Request::try_from(&head, id) {
            Ok(request) => request,
            Err(e) => {
                warn!("[ID{}]解析HTTP请求失败：{}，返回400", id, e);
                let _ = Response::from_exception(e)
                    .write_to(&mut stream, config.chunk_size(), id)
                    .await;
                break;
            }
        };
        debug!("[ID{}]成功解析HTTP请求：{} {}", id, request.method(), request.target());

        let response = match exchange(&mut stream, &mut buffer, &mut handler, &request, idle, id).await {
            Ok(response) => response,
            Err(e) => {
                debug!("[ID{}]读取请求体时连接中断：{}", id, e);
                handler.reset();
                break;
            }
        };
        debug!(
            "[ID{}]HTTP响应构建完成，服务端用时{}ms。",
            id,
            start_time.elapsed().as_millis()
        );

        info!(
            "[ID{}] {}, {}, {}, {}, {}, {}",
            id,
            request.version(),
            request.path(),
            request.method(),
            response.status_code(),
            response.information(),
            request.user_agent(),
        );

        match response.write_to(&mut stream, config.chunk_size(), id).await {
            Ok(Disposition::KeepAlive) => continue,
            Ok(Disposition::Close) => break,
            Err(e) => {
                error!("[ID{}]发送响应失败：{}", id, e);
                handler.reset();
                return;
            }
        }
    }

    handler.reset();
    linger(&mut stream, id).await;
    debug!("[ID{}]连接已关闭", id);
}

/// 读取请求体并得到该请求的响应。
///
/// 返回 `Err` 表示连接已经不可用，调用方直接关闭连接。
async fn exchange<S>(
    stream: &mut S,
    buffer: &mut BytesMut,
    handler: &mut Handler,
    request: &Request,
    idle: Duration,
    id: u128,
) -> Result<Response, Exception>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut decoder = match BodyDecoder::for_request(request) {
        Ok(decoder) => decoder,
        Err(e) => {
            warn!("[ID{}]无法确定请求体长度：{}", id, e);
            return Ok(Response::from_exception(e));
        }
    };

    if request.method() != HttpRequestMethod::Post {
        // 其余方法的请求体被读出并丢弃
        while !decoder.is_done() {
            match next_fragment(stream, buffer, &mut decoder, idle).await {
                Ok(_) => {}
                Err(Exception::NotHttpContent) => {
                    return Ok(handler.handle_body_error(Exception::NotHttpContent))
                }
                Err(e) => return Err(e),
            }
        }
        return Ok(handler
            .handle_request(request)
            .await
            .unwrap_or_else(|| Response::from_exception(Exception::Io)));
    }

    if let Some(response) = handler.handle_request(request).await {
        return Ok(response);
    }
    loop {
        let fragment = match next_fragment(stream, buffer, &mut decoder, idle).await {
            Ok(fragment) => fragment,
            Err(Exception::NotHttpContent) => {
                return Ok(handler.handle_body_error(Exception::NotHttpContent))
            }
            Err(e) => return Err(e),
        };
        let last = fragment.is_last();
        if let Some(response) = handler.handle_fragment(fragment).await {
            return Ok(response);
        }
        if last {
            error!("[ID{}]请求体已结束但上传没有产生结果", id);
            handler.reset();
            return Ok(Response::from_exception(Exception::Io));
        }
    }
}

/// 读取下一个请求体片段。请求体在结束之前被对端关闭视为非法的 HTTP 内容。
async fn next_fragment<S>(
    stream: &mut S,
    buffer: &mut BytesMut,
    decoder: &mut BodyDecoder,
    idle: Duration,
) -> Result<Fragment, Exception>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Some(fragment) = decoder.decode(buffer)? {
            return Ok(fragment);
        }
        if read_some(stream, buffer, idle).await? == 0 {
            return Err(Exception::NotHttpContent);
        }
    }
}

/// 读取一个完整的请求头（到空行为止）。
///
/// 对端在两个请求之间正常关闭时返回 `Ok(None)`。
async fn read_head<S>(
    stream: &mut S,
    buffer: &mut BytesMut,
    max_header_size: usize,
    idle: Duration,
    id: u128,
) -> Result<Option<BytesMut>, Exception>
where
    S: AsyncRead + Unpin,
{
    loop {
        // 请求之间多余的空行
        let blank = buffer.iter().take_while(|b| **b == b'\r' || **b == b'\n').count();
        buffer.advance(blank);

        if let Some(pos) = find_subslice(&buffer[..], b"\r\n\r\n") {
            if pos + 4 > max_header_size {
                return Err(Exception::HeaderTooLarge);
            }
            return Ok(Some(buffer.split_to(pos + 4)));
        }
        if buffer.len() > max_header_size {
            error!("[ID{}]请求头超过{}字节的上限", id, max_header_size);
            return Err(Exception::HeaderTooLarge);
        }
        if read_some(stream, buffer, idle).await? == 0 {
            if !buffer.is_empty() {
                debug!("[ID{}]请求头尚未接收完毕时连接被关闭", id);
            }
            return Ok(None);
        }
    }
}

async fn read_some<S>(stream: &mut S, buffer: &mut BytesMut, idle: Duration) -> Result<usize, Exception>
where
    S: AsyncRead + Unpin,
{
    match timeout(idle, stream.read_buf(buffer)).await {
        Ok(Ok(n)) => Ok(n),
        Ok(Err(e)) => {
            debug!("读取连接时遇到错误：{}", e);
            Err(Exception::Io)
        }
        Err(_) => Err(Exception::Timeout),
    }
}

/// 关闭写方向后读出并丢弃对端仍在发送的数据，避免未读数据导致连接被重置、响应丢失。
async fn linger<S>(stream: &mut S, id: u128)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Err(e) = stream.shutdown().await {
        debug!("[ID{}]关闭连接写方向失败：{}", id, e);
        return;
    }
    let drain = async {
        let mut scratch = vec![0u8; 8 * 1024];
        let mut discarded = 0usize;
        while discarded < LINGER_LIMIT {
            match stream.read(&mut scratch).await {
                Ok(0) | Err(_) => break,
                Ok(n) => discarded += n,
            }
        }
        discarded
    };
    match timeout(LINGER_TIMEOUT, drain).await {
        Ok(0) => {}
        Ok(n) => debug!("[ID{}]关闭前丢弃了{}字节未读数据", id, n),
        Err(_) => debug!("[ID{}]等待对端关闭超时", id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::duplex;

    async fn roundtrip(config: Config, input: &[u8]) -> String {
        let (mut client, server) = duplex(1 << 20);
        let task = tokio::spawn(serve(server, 0, Arc::new(config)));
        client.write_all(input).await.unwrap();
        client.shutdown().await.unwrap();
        let mut output = Vec::new();
        client.read_to_end(&mut output).await.unwrap();
        task.await.unwrap();
        String::from_utf8_lossy(&output).into_owned()
    }

    #[tokio::test]
    async fn test_header_too_large() {
        let dir = TempDir::new().unwrap();
        let config = Config::new().with_root(dir.path());
        let mut input = b"GET /?file=a HTTP/1.1\r\nX-Big: ".to_vec();
        input.extend(std::iter::repeat(b'a').take(config.max_header_size() + 1));
        input.extend_from_slice(b"\r\n\r\n");

        let output = roundtrip(config, &input).await;

        assert!(output.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert_eq!(output.matches("HTTP/1.1").count(), 1);
    }

    #[tokio::test]
    async fn test_malformed_request_line() {
        let dir = TempDir::new().unwrap();
        let output = roundtrip(Config::new().with_root(dir.path()), b"NONSENSE\r\n\r\n").await;
        assert!(output.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(output.contains("Connection: close\r\n"));
    }

    #[tokio::test]
    async fn test_unsupported_version() {
        let dir = TempDir::new().unwrap();
        let output = roundtrip(
            Config::new().with_root(dir.path()),
            b"GET /?file=a HTTP/2.0\r\n\r\n",
        )
        .await;
        assert!(output.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[tokio::test]
    async fn test_leading_blank_lines_and_pipelining() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"AAA").unwrap();
        let input = b"\r\n\r\nGET /?file=a.txt HTTP/1.1\r\n\r\nGET /?file=a.txt HTTP/1.1\r\nConnection: close\r\n\r\n";

        let output = roundtrip(Config::new().with_root(dir.path()), input).await;

        assert_eq!(output.matches("HTTP/1.1 200 OK\r\n").count(), 2);
        assert!(output.contains("Connection: keep-alive\r\n"));
        assert!(output.ends_with("Connection: close\r\n\r\nAAA"));
    }

    #[tokio::test]
    async fn test_get_body_is_discarded() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"AAA").unwrap();
        let input = b"GET /?file=a.txt HTTP/1.1\r\nContent-Length: 4\r\n\r\njunkGET /?file=a.txt HTTP/1.0\r\n\r\n";

        let output = roundtrip(Config::new().with_root(dir.path()), input).await;

        assert_eq!(output.matches("HTTP/1.1 200 OK\r\n").count(), 2);
        assert!(!output.contains("Bad Request"));
    }

    #[tokio::test]
    async fn test_chunked_get_body_is_discarded() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"AAA").unwrap();
        let input = b"GET /?file=a.txt HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\n\r\nGET /?file=a.txt HTTP/1.0\r\n\r\n";

        let output = roundtrip(Config::new().with_root(dir.path()), input).await;

        assert_eq!(output.matches("HTTP/1.1 200 OK\r\n").count(), 2);
        assert!(!output.contains("abc"));
    }

    #[tokio::test]
    async fn test_idle_timeout_closes_connection() {
        let dir = TempDir::new().unwrap();
        let config = Config::new().with_root(dir.path()).with_idle_timeout(1);
        let (mut client, server) = duplex(1024);
        client.write_all(b"GET /?file=a HTTP/1.1\r\n").await.unwrap();

        let task = tokio::spawn(serve(server, 0, Arc::new(config)));
        timeout(Duration::from_secs(10), task).await.unwrap().unwrap();

        let mut output = Vec::new();
        client.read_to_end(&mut output).await.unwrap();
        assert!(output.is_empty());
    }
}
