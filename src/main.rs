// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 文件上传下载服务器
//!
//! 基于 Tokio 多线程运行时的 HTTP/1.1 文件服务器：
//! - `GET /?file=<name>` 从根目录下载文件
//! - `POST` multipart/form-data 上传文件，保存为 `<毫秒时间戳>_<原文件名>`
//! - `OPTIONS` CORS 预检
//!
//! 收到 Ctrl-C 后停止接受新连接并退出。

use std::{
    fs,
    net::{Ipv4Addr, SocketAddrV4},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use fileserver::{config::Config, connection};
use log::{debug, error, info};
use tokio::{net::TcpListener, runtime::Builder, signal};

fn main() {
    // 1. 初始化日志系统：通过外部 YAML 配置级别与输出目的地
    if let Err(e) = log4rs::init_file("config/log4rs.yaml", Default::default()) {
        eprintln!("无法初始化日志系统：{}", e);
    }

    // 2. 从 TOML 文件读取运行参数
    let config = Config::from_toml("config/development.toml");
    info!("配置文件已载入");
    info!("文件根目录: {}", config.root());
    if let Err(e) = fs::create_dir_all(config.root_path()) {
        error!("无法创建文件根目录{}：{}", config.root(), e);
        std::process::exit(1);
    }

    // 3. 工作线程负责网络事件，阻塞线程池负责磁盘 I/O
    let runtime = match Builder::new_multi_thread()
        .worker_threads(config.worker_threads())
        .max_blocking_threads(config.blocking_threads())
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("无法创建Tokio运行时：{}", e);
            std::process::exit(1);
        }
    };
    info!(
        "工作线程数：{}，阻塞线程池上限：{}",
        config.worker_threads(),
        config.blocking_threads()
    );

    runtime.block_on(run(Arc::new(config)));
}

async fn run(config: Arc<Config>) {
    let port = config.port();
    let address = match config.local() {
        true => Ipv4Addr::new(127, 0, 0, 1),
        false => Ipv4Addr::new(0, 0, 0, 0),
    };
    info!("服务端将在{}:{}上监听Socket连接", address, port);
    let listener = match TcpListener::bind(SocketAddrV4::new(address, port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("无法绑定端口：{}，错误：{}", port, e);
            return;
        }
    };
    info!("端口{}绑定完成", port);

    let active_connection = Arc::new(AtomicU32::new(0));
    let mut id: u128 = 0;

    loop {
        let (stream, addr) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("接受连接失败：{}", e);
                    continue;
                }
            },
            _ = signal::ctrl_c() => {
                info!("接收到停机信号，停止接受新连接");
                break;
            }
        };
        debug!("[ID{}]TCP连接已建立：{}", id, addr);

        let config = Arc::clone(&config);
        let active_connection = Arc::clone(&active_connection);
        tokio::spawn(async move {
            active_connection.fetch_add(1, Ordering::SeqCst);
            connection::serve(stream, id, config).await;
            active_connection.fetch_sub(1, Ordering::SeqCst);
        });
        id += 1;
    }

    info!(
        "服务器退出，仍有{}个活跃连接被终止",
        active_connection.load(Ordering::SeqCst)
    );
}
