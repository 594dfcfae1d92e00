// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 路径解析
//!
//! 把客户端提供的文件名映射为根目录下的绝对路径，并判定其类别。
//! 只读取元数据，不产生任何副作用。

use std::{
    ffi::OsStr,
    fs::{self, File},
    io,
    path::{Component, Path, PathBuf},
};

use log::{debug, warn};

/// 文件名的解析结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// 可读的普通文件
    RegularFile { path: PathBuf, size: u64 },
    /// 不存在、是目录、是隐藏文件或位于根目录之外
    NotFound,
    /// 存在但不是可读的普通文件
    Forbidden,
}

fn is_hidden(name: &OsStr) -> bool {
    name.to_string_lossy().starts_with('.')
}

/// 在 `root` 下解析文件名 `name`。
///
/// 含有 `..`、绝对路径、隐藏路径段的名字一律视为不存在；
/// 经过符号链接后落在根目录之外的路径同样视为不存在。
pub fn resolve(root: &Path, name: &str, id: u128) -> Resolution {
    if name.is_empty() || name.contains('\0') {
        return Resolution::NotFound;
    }
    let relative = Path::new(name);
    for component in relative.components() {
        match component {
            Component::Normal(part) if is_hidden(part) => {
                debug!("[ID{}]请求的路径{}包含隐藏路径段", id, name);
                return Resolution::NotFound;
            }
            Component::Normal(_) | Component::CurDir => {}
            _ => {
                warn!("[ID{}]拒绝越界的文件名：{}", id, name);
                return Resolution::NotFound;
            }
        }
    }

    let candidate = root.join(relative);
    let metadata = match fs::metadata(&candidate) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => return Resolution::Forbidden,
        Err(_) => return Resolution::NotFound,
    };
    if metadata.is_dir() {
        return Resolution::NotFound;
    }

    let (canonical_root, canonical) = match (root.canonicalize(), candidate.canonicalize()) {
        (Ok(r), Ok(c)) => (r, c),
        _ => return Resolution::NotFound,
    };
    if !canonical.starts_with(&canonical_root) {
        warn!("[ID{}]路径{}经符号链接解析后位于根目录之外", id, name);
        return Resolution::NotFound;
    }
    if canonical.file_name().map_or(true, is_hidden) {
        return Resolution::NotFound;
    }

    if !metadata.is_file() {
        return Resolution::Forbidden;
    }
    if let Err(e) = File::open(&canonical) {
        debug!("[ID{}]文件{}不可读：{}", id, canonical.display(), e);
        return Resolution::Forbidden;
    }

    Resolution::RegularFile {
        path: canonical,
        size: metadata.len(),
    }
}
