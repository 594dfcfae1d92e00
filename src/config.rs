// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

use num_cpus;
use serde_derive::Deserialize;
use serde_derive::Serialize;

use log::{error, warn};
use std::fs::File;
use std::io::prelude::*;
use std::path::{Path, PathBuf};

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    root: String,
    port: u16,
    local: bool,
    #[serde(default)]
    worker_threads: usize,
    #[serde(default = "default_blocking_threads")]
    blocking_threads: usize,
    #[serde(default = "default_chunk_size")]
    chunk_size: usize,
    #[serde(default = "default_max_header_size")]
    max_header_size: usize,
    #[serde(default = "default_idle_timeout_secs")]
    idle_timeout_secs: u64,
    #[serde(default = "default_memory_threshold")]
    memory_threshold: usize,
}

fn default_blocking_threads() -> usize {
    64
}

fn default_chunk_size() -> usize {
    262144 // 256KB
}

fn default_max_header_size() -> usize {
    16384 // 16KB
}

fn default_idle_timeout_secs() -> u64 {
    30
}

fn default_memory_threshold() -> usize {
    1048576 // 1MB，超过后上传内容落盘
}

impl Config {
    pub fn new() -> Self {
        Self {
            root: "./files".to_string(),
            port: 7878,
            local: true,
            worker_threads: 0,
            blocking_threads: default_blocking_threads(),
            chunk_size: default_chunk_size(),
            max_header_size: default_max_header_size(),
            idle_timeout_secs: default_idle_timeout_secs(),
            memory_threshold: default_memory_threshold(),
        }
    }

    /// 从 TOML 文件读取配置。文件缺失或格式错误时使用默认配置。
    pub fn from_toml(filename: &str) -> Self {
        let mut str_val = String::new();
        let read = File::open(filename).and_then(|mut file| file.read_to_string(&mut str_val));
        let mut raw_config = match read {
            Ok(_) => Self::from_toml_str(&str_val),
            Err(e) => {
                error!("无法读取配置文件{}：{}，使用默认配置", filename, e);
                Config::new()
            }
        };
        raw_config.normalize();
        raw_config
    }

    fn from_toml_str(s: &str) -> Self {
        match toml::from_str(s) {
            Ok(t) => t,
            Err(e) => {
                error!("无法成功从配置文件构建配置对象：{}，使用默认配置", e);
                Config::new()
            }
        }
    }

    fn normalize(&mut self) {
        if self.worker_threads == 0 {
            self.worker_threads = num_cpus::get();
        }
        if self.blocking_threads == 0 {
            warn!("blocking_threads被设置为0，该值将被改为{}。", default_blocking_threads());
            self.blocking_threads = default_blocking_threads();
        }
        if self.chunk_size == 0 {
            warn!("chunk_size被设置为0，该值将被改为{}。", default_chunk_size());
            self.chunk_size = default_chunk_size();
        }
    }

    pub fn with_root<P: AsRef<Path>>(mut self, root: P) -> Self {
        self.root = root.as_ref().to_string_lossy().to_string();
        self
    }

    pub fn with_memory_threshold(mut self, threshold: usize) -> Self {
        self.memory_threshold = threshold;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_idle_timeout(mut self, secs: u64) -> Self {
        self.idle_timeout_secs = secs.max(1);
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn root_path(&self) -> PathBuf {
        PathBuf::from(&self.root)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn local(&self) -> bool {
        self.local
    }

    pub fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    pub fn blocking_threads(&self) -> usize {
        self.blocking_threads
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn max_header_size(&self) -> usize {
        self.max_header_size
    }

    pub fn idle_timeout_secs(&self) -> u64 {
        self.idle_timeout_secs
    }

    pub fn memory_threshold(&self) -> usize {
        self.memory_threshold
    }
}
