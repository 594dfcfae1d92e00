// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 请求分发
//!
//! 每个连接拥有一个 [`Handler`]。它按方法分发请求：
//! - `GET`：根据 `file` 查询参数下载文件；
//! - `POST`：以 multipart/form-data 上传文件；
//! - `OPTIONS`：CORS 预检；
//! - 其余方法一律返回 405。
//!
//! 上传的请求体以片段的形式逐个交给 [`Handler::handle_fragment`]，
//! 所有阻塞的文件系统操作都通过 [`offload`] 在阻塞线程池上执行。

use std::sync::Arc;

use log::{debug, error, info, warn};

use crate::{
    body::Fragment,
    config::Config,
    exception::Exception,
    multipart::boundary_of,
    param::{HttpRequestMethod, FILE_QUERY_PARAM},
    persister::UploadPersister,
    request::Request,
    resolver::resolve,
    response::Response,
    session::UploadSession,
    streamer::stream_file,
    util::offload,
};

/// 已经通过请求头校验、等待第一个请求体片段的上传
#[derive(Debug)]
struct PendingUpload {
    boundary: String,
    reading_chunks: bool,
}

pub struct Handler {
    id: u128,
    config: Arc<Config>,
    persister: UploadPersister,
    pending: Option<PendingUpload>,
    session: Option<UploadSession>,
}

impl Handler {
    pub fn new(config: Arc<Config>, id: u128) -> Self {
        let persister = UploadPersister::new(config.root_path());
        Self {
            id,
            config,
            persister,
            pending: None,
            session: None,
        }
    }

    /// 是否有上传正在进行
    pub fn is_uploading(&self) -> bool {
        self.pending.is_some() || self.session.is_some()
    }

    /// 处理请求头。
    ///
    /// 对于已接受的上传请求返回 `None`，此时响应要等请求体片段到达后才能确定。
    pub async fn handle_request(&mut self, request: &Request) -> Option<Response> {
        if self.is_uploading() {
            warn!("[ID{}]上一个上传尚未结束，拒绝新的请求", self.id);
            self.reset();
            return Some(Response::from_exception(Exception::UploadInProgress));
        }
        match request.method() {
            HttpRequestMethod::Get => Some(self.serve_file(request).await),
            HttpRequestMethod::Post => self.begin_upload(request),
            HttpRequestMethod::Options => {
                debug!("[ID{}]CORS预检请求", self.id);
                Some(Response::preflight())
            }
            method => {
                warn!("[ID{}]不支持的请求方法：{}，返回405", self.id, method);
                Some(Response::from_exception(Exception::MethodNotAllowed))
            }
        }
    }

    async fn serve_file(&self, request: &Request) -> Response {
        let name = match request.query_param(FILE_QUERY_PARAM) {
            Some(name) => name.to_string(),
            None => {
                warn!("[ID{}]请求缺少{}参数，返回400", self.id, FILE_QUERY_PARAM);
                return Response::from_exception(Exception::MissingFileParam);
            }
        };
        let root = self.config.root_path();
        let id = self.id;
        match offload(move || resolve(&root, &name, id)).await {
            Ok(resolution) => stream_file(resolution, request, id).await,
            Err(e) => Response::from_exception(e),
        }
    }

    fn begin_upload(&mut self, request: &Request) -> Option<Response> {
        match boundary_of(request.content_type()) {
            Ok(boundary) => {
                debug!("[ID{}]接受上传请求，boundary：{}", self.id, boundary);
                self.pending = Some(PendingUpload {
                    boundary,
                    reading_chunks: request.is_chunked(),
                });
                None
            }
            Err(e) => {
                warn!(
                    "[ID{}]拒绝上传请求，Content-Type：{:?}，原因：{}",
                    self.id,
                    request.content_type(),
                    e
                );
                Some(Response::from_exception(e))
            }
        }
    }

    /// 处理一个请求体片段。
    ///
    /// 返回 `Some` 时上传已经结束，调用方应当发送该响应并关闭连接。
    pub async fn handle_fragment(&mut self, fragment: Fragment) -> Option<Response> {
        let session = match self.session.take() {
            Some(session) => session,
            None => {
                let pending = self.pending.take()?;
                UploadSession::new(
                    &pending.boundary,
                    pending.reading_chunks,
                    self.persister.root(),
                    self.config.memory_threshold(),
                    self.id,
                )
            }
        };

        let persister = self.persister.clone();
        let outcome = offload(move || {
            let mut session = session;
            let outcome = session.offer(&fragment, &persister);
            (session, outcome)
        })
        .await;

        let outcome = match outcome {
            Ok((session, outcome)) => {
                if session.is_active() {
                    self.session = Some(session);
                }
                outcome?
            }
            Err(e) => {
                error!("[ID{}]处理上传片段的任务异常退出", self.id);
                return Some(Response::from_exception(e));
            }
        };

        Some(match outcome {
            Ok(stored) => {
                info!("[ID{}]上传完成：{}（{}字节）", self.id, stored.name(), stored.size());
                Response::upload_success(stored.name())
            }
            Err(e) => {
                warn!("[ID{}]上传失败：{}", self.id, e);
                Response::from_exception(e)
            }
        })
    }

    /// 请求体分帧出错：终止上传并返回 400。
    pub fn handle_body_error(&mut self, exception: Exception) -> Response {
        warn!("[ID{}]请求体不是合法的HTTP内容：{}", self.id, exception);
        self.reset();
        Response::from_exception(Exception::NotHttpContent)
    }

    /// 丢弃当前上传，释放解码器及其暂存文件。
    pub fn reset(&mut self) {
        self.pending = None;
        if self.session.take().is_some() {
            debug!("[ID{}]上传会话已销毁", self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::fs;
    use tempfile::TempDir;

    const BOUNDARY: &str = "handlerBoundary";

    fn handler(dir: &TempDir) -> Handler {
        let config = Config::new().with_root(dir.path()).with_memory_threshold(64);
        Handler::new(Arc::new(config), 0)
    }

    fn request(raw: &str) -> Request {
        Request::try_from(raw.as_bytes(), 0).unwrap()
    }

    fn post() -> Request {
        request(&format!(
            "POST /upload HTTP/1.1\r\nContent-Type: multipart/form-data; boundary={}\r\nTransfer-Encoding: chunked\r\n\r\n",
            BOUNDARY
        ))
    }

    fn file_body(filename: &str, content: &str) -> String {
        format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{f}\"\r\nContent-Type: text/plain\r\n\r\n{c}\r\n--{b}--\r\n",
            b = BOUNDARY,
            f = filename,
            c = content
        )
    }

    async fn upload(handler: &mut Handler, body: &str, fragment_size: usize) -> Response {
        assert!(handler.handle_request(&post()).await.is_none());
        for chunk in body.as_bytes().chunks(fragment_size) {
            let fragment = Fragment::new(Bytes::copy_from_slice(chunk), false);
            if let Some(response) = handler.handle_fragment(fragment).await {
                return response;
            }
        }
        handler
            .handle_fragment(Fragment::new(Bytes::new(), true))
            .await
            .unwrap()
    }

    fn stored_name(response: &Response) -> String {
        let json: serde_json::Value = serde_json::from_slice(response.body_bytes().unwrap()).unwrap();
        json["file"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_get_without_file_param() {
        let dir = TempDir::new().unwrap();
        let response = handler(&dir)
            .handle_request(&request("GET / HTTP/1.1\r\n\r\n"))
            .await
            .unwrap();
        assert_eq!(response.status_code(), 400);
        assert_eq!(response.body_bytes().unwrap(), b"file query param not found");
    }

    #[tokio::test]
    async fn test_get_existing_file() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("doc.pdf"), b"%PDF").unwrap();
        let response = handler(&dir)
            .handle_request(&request("GET /?file=doc.pdf HTTP/1.1\r\n\r\n"))
            .await
            .unwrap();
        assert_eq!(response.status_code(), 200);
        assert_eq!(response.content_type(), Some("application/pdf"));
        assert_eq!(response.content_length(), 4);
    }

    #[tokio::test]
    async fn test_unsupported_methods() {
        let dir = TempDir::new().unwrap();
        let mut handler = handler(&dir);
        for method in ["HEAD", "PUT", "DELETE", "PROPFIND"] {
            let raw = format!("{} /?file=a HTTP/1.1\r\n\r\n", method);
            let response = handler.handle_request(&request(&raw)).await.unwrap();
            assert_eq!(response.status_code(), 405, "method {}", method);
        }
    }

    #[tokio::test]
    async fn test_options_preflight() {
        let dir = TempDir::new().unwrap();
        let response = handler(&dir)
            .handle_request(&request("OPTIONS /anything HTTP/1.1\r\n\r\n"))
            .await
            .unwrap();
        assert_eq!(response.status_code(), 200);
        assert_eq!(response.header("Access-Control-Allow-Origin"), Some("*"));
    }

    #[tokio::test]
    async fn test_post_not_multipart() {
        let dir = TempDir::new().unwrap();
        let mut handler = handler(&dir);
        let response = handler
            .handle_request(&request(
                "POST / HTTP/1.1\r\nContent-Type: application/json\r\nContent-Length: 2\r\n\r\n",
            ))
            .await
            .unwrap();
        assert_eq!(response.status_code(), 400);
        assert_eq!(response.body_bytes().unwrap(), b"Not a multipart request");
        assert!(!handler.is_uploading());
    }

    #[tokio::test]
    async fn test_upload_in_small_fragments() {
        let dir = TempDir::new().unwrap();
        let mut handler = handler(&dir);
        let content = "0123456789".repeat(40);

        let response = upload(&mut handler, &file_body("report.txt", &content), 13).await;

        assert_eq!(response.status_code(), 200);
        let name = stored_name(&response);
        assert!(name.ends_with("_report.txt"));
        assert_eq!(fs::read_to_string(dir.path().join(&name)).unwrap(), content);
        assert!(!handler.is_uploading());
    }

    #[tokio::test]
    async fn test_empty_file_upload() {
        let dir = TempDir::new().unwrap();
        let mut handler = handler(&dir);

        let response = upload(&mut handler, &file_body("empty.bin", ""), 1024).await;

        assert_eq!(response.status_code(), 200);
        let name = stored_name(&response);
        assert_eq!(fs::metadata(dir.path().join(name)).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_same_filename_gets_distinct_names() {
        let dir = TempDir::new().unwrap();
        let mut handler = handler(&dir);

        let first = stored_name(&upload(&mut handler, &file_body("same.txt", "one"), 1024).await);
        let second = stored_name(&upload(&mut handler, &file_body("same.txt", "two"), 1024).await);

        assert_ne!(first, second);
        assert_eq!(fs::read_to_string(dir.path().join(first)).unwrap(), "one");
        assert_eq!(fs::read_to_string(dir.path().join(second)).unwrap(), "two");
    }

    /// 损坏的上传只产生一个 400，随后同一个 handler 仍能正常上传
    #[tokio::test]
    async fn test_malformed_upload_then_valid_upload() {
        let dir = TempDir::new().unwrap();
        let mut handler = handler(&dir);
        let broken = format!("--{}\r\nbroken header\r\n\r\nxx\r\n--{}--\r\n", BOUNDARY, BOUNDARY);

        let response = upload(&mut handler, &broken, 5).await;
        assert_eq!(response.status_code(), 400);
        assert_eq!(response.body_bytes().unwrap(), b"Failed to decode file data");
        assert!(!handler.is_uploading());

        let response = upload(&mut handler, &file_body("ok.txt", "fine"), 5).await;
        assert_eq!(response.status_code(), 200);
    }

    #[tokio::test]
    async fn test_upload_without_file_part() {
        let dir = TempDir::new().unwrap();
        let mut handler = handler(&dir);
        let body = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"comment\"\r\n\r\nhello\r\n--{b}--\r\n",
            b = BOUNDARY
        );

        let response = upload(&mut handler, &body, 1024).await;

        assert_eq!(response.status_code(), 400);
        assert_eq!(response.body_bytes().unwrap(), b"No file part found");
    }

    #[tokio::test]
    async fn test_request_during_upload_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut handler = handler(&dir);
        assert!(handler.handle_request(&post()).await.is_none());

        let response = handler
            .handle_request(&request("GET /?file=a HTTP/1.1\r\n\r\n"))
            .await
            .unwrap();

        assert_eq!(response.status_code(), 400);
        assert_eq!(response.body_bytes().unwrap(), b"Upload already in progress");
        assert!(!handler.is_uploading());
    }

    #[tokio::test]
    async fn test_body_error_tears_down_session() {
        let dir = TempDir::new().unwrap();
        let mut handler = handler(&dir);
        assert!(handler.handle_request(&post()).await.is_none());
        let partial = format!(
            "--{}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"big\"\r\n\r\n{}",
            BOUNDARY,
            "y".repeat(500)
        );
        assert!(handler
            .handle_fragment(Fragment::new(Bytes::from(partial), false))
            .await
            .is_none());
        assert!(handler.is_uploading());

        let response = handler.handle_body_error(Exception::NotHttpContent);

        assert_eq!(response.status_code(), 400);
        assert_eq!(response.body_bytes().unwrap(), b"Not a http request");
        assert!(!handler.is_uploading());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
