// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 上传文件持久化
//!
//! 把解码完成的文件分段写入根目录，文件名格式为 `<毫秒时间戳>_<原始文件名>`。
//! 时间戳由进程内唯一的 [`Timestamper`] 生成，保证即使两个连接在同一毫秒上传同名文件也不会冲突。

use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
};

use chrono::Utc;
use lazy_static::lazy_static;
use log::{debug, error, warn};

use crate::{
    exception::Exception,
    multipart::{FileUpload, PartContent},
    util::format_file_size,
};

/// 命名冲突时最多重试的次数
const MAX_NAME_ATTEMPTS: usize = 16;

/// 毫秒级时钟
#[cfg_attr(test, mockall::automock)]
pub trait Clock {
    fn now_millis(&self) -> i64;
}

/// 系统时钟
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// 单调递增的时间戳生成器。
///
/// 时钟没有前进（或被回拨）时，在上一次的值上加一。
pub struct Timestamper<C: Clock> {
    clock: C,
    last: AtomicI64,
}

impl<C: Clock> Timestamper<C> {
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            last: AtomicI64::new(i64::MIN),
        }
    }

    pub fn next(&self) -> i64 {
        let now = self.clock.now_millis();
        let mut last = self.last.load(Ordering::Acquire);
        loop {
            let candidate = if now > last { now } else { last + 1 };
            match self
                .last
                .compare_exchange_weak(last, candidate, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return candidate,
                Err(actual) => last = actual,
            }
        }
    }
}

lazy_static! {
    static ref SYSTEM_TIMESTAMPER: Arc<Timestamper<SystemClock>> =
        Arc::new(Timestamper::new(SystemClock));
}

/// 已写入磁盘的上传文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    name: String,
    path: PathBuf,
    size: u64,
}

impl StoredFile {
    /// 生成的文件名，同时也是下载时使用的 `file` 参数
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

/// 只保留客户端文件名的最后一段，拒绝空名与特殊目录名。
///
/// 同时识别 `/` 与 `\` 两种分隔符，防止目录穿越。
pub fn sanitize_filename(original: &str) -> Result<&str, Exception> {
    let base = original
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or("")
        .trim();
    if base.is_empty() || base == "." || base == ".." || base.contains('\0') {
        return Err(Exception::InvalidFileName);
    }
    Ok(base)
}

/// 上传文件持久化器
pub struct UploadPersister<C: Clock = SystemClock> {
    root: PathBuf,
    timestamper: Arc<Timestamper<C>>,
}

impl<C: Clock> Clone for UploadPersister<C> {
    fn clone(&self) -> Self {
        Self {
            root: self.root.clone(),
            timestamper: Arc::clone(&self.timestamper),
        }
    }
}

impl UploadPersister<SystemClock> {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self::with_timestamper(root, Arc::clone(&SYSTEM_TIMESTAMPER))
    }
}

impl<C: Clock> UploadPersister<C> {
    pub fn with_timestamper<P: AsRef<Path>>(root: P, timestamper: Arc<Timestamper<C>>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            timestamper,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 把文件分段写入根目录。
    ///
    /// 任何 I/O 失败都不会在目标文件名下留下文件。
    pub fn persist(&self, upload: FileUpload, id: u128) -> Result<StoredFile, Exception> {
        let filename = sanitize_filename(upload.filename())
            .map_err(|e| {
                warn!("[ID{}]拒绝非法的上传文件名：{:?}", id, upload.filename());
                e
            })?
            .to_string();
        let size = upload.size();
        let mut content = upload.into_content();

        for _ in 0..MAX_NAME_ATTEMPTS {
            let name = format!("{}_{}", self.timestamper.next(), filename);
            let path = self.root.join(&name);
            match write_content(content, &path) {
                Ok(()) => {
                    debug!("[ID{}]上传文件已保存：{}（{}）", id, path.display(), format_file_size(size));
                    return Ok(StoredFile { name, path, size });
                }
                Err((returned, e)) if e.kind() == io::ErrorKind::AlreadyExists => {
                    warn!("[ID{}]文件{}已存在，重新生成文件名", id, name);
                    content = returned.ok_or(Exception::Io)?;
                }
                Err((_, e)) => {
                    error!("[ID{}]保存上传文件{}失败：{}", id, path.display(), e);
                    return Err(Exception::Io);
                }
            }
        }
        error!("[ID{}]连续{}次生成的文件名均已存在", id, MAX_NAME_ATTEMPTS);
        Err(Exception::Io)
    }
}

/// 把内容写入 `path`，目标已存在时不覆盖。
///
/// 因目标已存在而失败时原样交还内容，以便换一个文件名重试。
fn write_content(content: PartContent, path: &Path) -> Result<(), (Option<PartContent>, io::Error)> {
    match content {
        PartContent::Memory(bytes) => {
            let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(f) => f,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    return Err((Some(PartContent::Memory(bytes)), e))
                }
                Err(e) => return Err((None, e)),
            };
            if let Err(e) = file.write_all(&bytes).and_then(|_| file.sync_all()) {
                drop(file);
                let _ = fs::remove_file(path);
                return Err((None, e));
            }
            Ok(())
        }
        PartContent::Disk(spool) => match spool.persist_noclobber(path) {
            Ok(_) => Ok(()),
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                Err((Some(PartContent::Disk(e.file)), e.error))
            }
            // 暂存文件随 e.file 一起被删除
            Err(e) => Err((None, e.error)),
        },
    }
}
