// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 上传会话
//!
//! 一个连接上至多存在一个上传会话。会话持有 multipart 解码器，
//! 按到达顺序接收请求体片段，并在第一个完整的文件分段出现时把它交给持久化模块。
//! 会话结束（成功或失败）后解码器立即销毁，其暂存文件随之删除。

use std::path::Path;

use log::{debug, error, warn};

use crate::{
    body::Fragment,
    exception::Exception,
    multipart::{DecodedItem, MultipartDecoder},
    persister::{Clock, StoredFile, UploadPersister},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Decoding,
    Completed,
    Failed,
}

pub struct UploadSession {
    decoder: Option<MultipartDecoder>,
    /// 请求声明了分块传输
    reading_chunks: bool,
    state: SessionState,
    id: u128,
}

impl UploadSession {
    pub fn new(
        boundary: &str,
        reading_chunks: bool,
        spool_dir: &Path,
        memory_threshold: usize,
        id: u128,
    ) -> Self {
        debug!(
            "[ID{}]创建上传会话，boundary：{}，分块传输：{}",
            id, boundary, reading_chunks
        );
        Self {
            decoder: Some(MultipartDecoder::new(boundary, spool_dir, memory_threshold, id)),
            reading_chunks,
            state: SessionState::Decoding,
            id,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Decoding
    }

    /// 处理一个请求体片段。
    ///
    /// 返回 `None` 表示需要更多片段；返回 `Some` 时会话已经结束，
    /// 其中是第一个文件分段的持久化结果或导致失败的异常。
    pub fn offer<C: Clock>(
        &mut self,
        fragment: &Fragment,
        persister: &UploadPersister<C>,
    ) -> Option<Result<StoredFile, Exception>> {
        let decoder = self.decoder.as_mut()?;

        if let Err(e) = decoder.offer(fragment.data()) {
            warn!("[ID{}]解码multipart报文失败：{}", self.id, e);
            return Some(self.fail(e));
        }

        while decoder.has_next() {
            match decoder.next() {
                Some(DecodedItem::FilePart(upload)) => {
                    if !upload.is_completed() {
                        error!("[ID{}]文件分段{}尚未接收完毕", self.id, upload.name());
                        return Some(self.fail(Exception::IncompleteFilePart));
                    }
                    debug!(
                        "[ID{}]收到文件分段：{}，文件名：{}，大小：{}字节",
                        self.id,
                        upload.name(),
                        upload.filename(),
                        upload.size()
                    );
                    let stored = persister.persist(upload, self.id);
                    self.finish(SessionState::Completed);
                    return Some(stored);
                }
                Some(DecodedItem::OtherField { name, value }) => {
                    debug!("[ID{}]忽略普通字段{}（{}字节）", self.id, name, value.len());
                }
                None => break,
            }
        }

        if fragment.is_last() {
            if let Err(e) = decoder.finish() {
                return Some(self.fail(e));
            }
            warn!("[ID{}]请求体中没有文件分段", self.id);
            self.finish(SessionState::Completed);
            return Some(Err(Exception::MissingFilePart));
        }
        None
    }

    fn fail(&mut self, exception: Exception) -> Result<StoredFile, Exception> {
        self.finish(SessionState::Failed);
        Err(exception)
    }

    fn finish(&mut self, state: SessionState) {
        self.state = state;
        if let Some(decoder) = self.decoder.take() {
            decoder.destroy();
            debug!(
                "[ID{}]上传会话结束：{:?}，分块传输：{}",
                self.id, state, self.reading_chunks
            );
        }
    }
}

impl Drop for UploadSession {
    fn drop(&mut self) {
        if self.decoder.is_some() {
            debug!(
                "[ID{}]上传会话被提前终止，分块传输：{}",
                self.id, self.reading_chunks
            );
        }
    }
}
