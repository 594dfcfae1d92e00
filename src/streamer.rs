// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 文件下载
//!
//! 把路径解析的结果转换为下载响应。

use std::path::Path;

use log::{debug, warn};
use tokio::fs::File as TokioFile;

use crate::{
    exception::Exception, param::mime_for_extension, request::Request, resolver::Resolution,
    response::Response,
};

/// 根据解析结果构建下载响应。
///
/// 文件长度取自打开后的句柄，而不是解析时的元数据；两次查询之间文件被删除时返回 404。
pub async fn stream_file(resolution: Resolution, request: &Request, id: u128) -> Response {
    let path = match resolution {
        Resolution::RegularFile { path, .. } => path,
        Resolution::NotFound => {
            warn!("[ID{}]请求的文件：{} 不存在，返回404", id, request.target());
            return Response::from_exception(Exception::FileNotFound);
        }
        Resolution::Forbidden => {
            warn!("[ID{}]请求的文件：{} 不可读，返回403", id, request.target());
            return Response::from_exception(Exception::Forbidden);
        }
    };

    let file = match TokioFile::open(&path).await {
        Ok(f) => f,
        Err(e) => {
            warn!("[ID{}]无法打开文件{}：{}", id, path.display(), e);
            return Response::from_exception(Exception::FileNotFound);
        }
    };
    let length = match file.metadata().await {
        Ok(m) => m.len(),
        Err(e) => {
            warn!("[ID{}]无法读取文件{}的元数据：{}", id, path.display(), e);
            return Response::from_exception(Exception::FileNotFound);
        }
    };

    let mime = mime_of(&path);
    debug!("[ID{}]下载文件{}，MIME类型：{}", id, path.display(), mime);
    Response::from_file(file, length, mime, request.is_keep_alive())
}

fn mime_of(path: &Path) -> &'static str {
    mime_for_extension(path.extension().and_then(|e| e.to_str()))
}
