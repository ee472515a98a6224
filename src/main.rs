// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # PSP 演示服务器
//!
//! 基于 Tokio 运行时的多线程 Web 服务器，用于承载页面引擎：
//! - 页面文件（`.psp`）经由两级编译缓存执行，其余文件按原样发送
//! - 页面执行是同步的，在阻塞线程池中运行，不占用异步工作线程
//! - 后台管理控制台（CLI 指令交互）
//!
//! `psp-server precompile <page>...` 只写出预编译文件后退出。

use psp_server::{host, precompile, Config, PageCache, Request, Response};

use log::{debug, error, info, warn};
use log4rs;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    runtime::Builder,
};

use std::{
    net::{Ipv4Addr, SocketAddrV4},
    path::Path,
    process::ExitCode,
    sync::{Arc, Mutex},
    time::Instant,
};

/// # 程序入口点
///
/// 初始化日志、加载配置，然后根据命令行参数预编译页面或启动服务器。
fn main() -> ExitCode {
    // 1. 初始化日志系统：通过外部 YAML 灵活配置级别与输出目的地
    if let Err(e) = log4rs::init_file("config/log4rs.yaml", Default::default()) {
        eprintln!("无法初始化日志系统：{}", e);
        return ExitCode::FAILURE;
    }

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.first().map(String::as_str) == Some("precompile") {
        return precompile_pages(&args[1..]);
    }

    // 2. 环境配置加载：从 TOML 文件读取运行参数
    let config = Config::from_toml("config/development.toml");
    info!("配置文件已载入");
    info!("www root: {}", config.www_root());

    // 3. 异步运行时定制：根据配置文件动态分配工作线程数
    let runtime = match Builder::new_multi_thread()
        .worker_threads(config.worker_threads())
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("无法创建异步运行时：{}", e);
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(serve_forever(config))
}

fn precompile_pages(pages: &[String]) -> ExitCode {
    let mut failed = false;
    for page in pages {
        match precompile(Path::new(page)) {
            Ok(path) => info!("已预编译{} -> {}", page, path.display()),
            Err(e) => {
                error!("预编译{}失败：{}", page, e);
                failed = true;
            }
        }
    }
    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

async fn serve_forever(config: Config) -> ExitCode {
    // 4. 共享资源初始化：两级缓存中的内存缓存由所有请求共享
    let caches = Arc::new(PageCache::new(config.cache_size()));
    let config = Arc::new(config);
    if let Some(path) = config.dbm_cache() {
        info!("持久缓存：{}", path);
    }

    // 5. 网络层初始化：支持全地址监听 (0.0.0.0) 或本地回环监听 (127.0.0.1)
    let port: u16 = config.port();
    let address = match config.local() {
        true => Ipv4Addr::new(127, 0, 0, 1),
        false => Ipv4Addr::new(0, 0, 0, 0),
    };
    info!("服务端将在{}:{}上监听Socket连接", address, port);
    let socket = SocketAddrV4::new(address, port);

    let listener = match TcpListener::bind(socket).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("无法绑定端口：{}，错误：{}", port, e);
            return ExitCode::FAILURE;
        }
    };
    info!("端口{}绑定完成", port);

    // 6. 服务器状态与生命周期管理
    let shutdown_flag = Arc::new(Mutex::new(false));
    let active_connection = Arc::new(Mutex::new(0u32));

    // 7. 启动交互式管理控制台任务
    tokio::spawn({
        let shutdown_flag = Arc::clone(&shutdown_flag);
        let active_connection = Arc::clone(&active_connection);
        let caches = Arc::clone(&caches);
        async move {
            let stdin = tokio::io::stdin();
            let mut reader = BufReader::new(stdin);
            let mut input = String::new();
            loop {
                input.clear();
                match reader.read_line(&mut input).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
                match input.trim() {
                    "stop" => {
                        *lock_or_recover(&shutdown_flag) = true;
                        println!("停机指令已激活，服务器将在处理完下一个请求后关闭...");
                        break;
                    }
                    "help" => {
                        println!("== PSP Server Help ==");
                        println!("stop   - 发出停机信号");
                        println!("status - 查看当前服务器运行状态");
                        println!("help   - 显示此帮助信息");
                        println!("=====================");
                    }
                    "status" => {
                        println!("== PSP Server 状态 ===");
                        println!("当前活跃连接数: {}", *lock_or_recover(&active_connection));
                        println!("文件页面缓存: {}", caches.files().len());
                        println!("字符串页面缓存: {}", caches.strings().len());
                        println!("=====================");
                    }
                    cmd => println!("无效的命令：{}", cmd),
                }
            }
        }
    });

    let mut id: u128 = 0;

    // 8. 主事件循环 (Accept Loop)
    loop {
        if *lock_or_recover(&shutdown_flag) {
            info!("主循环接收到停机指令，正在退出...");
            return ExitCode::SUCCESS;
        }

        let (mut stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("接受连接失败：{}", e);
                continue;
            }
        };
        debug!("[ID{}]TCP连接已建立：{}", id, addr);

        let active_connection = Arc::clone(&active_connection);
        let caches = Arc::clone(&caches);
        let config = Arc::clone(&config);

        tokio::spawn(async move {
            *lock_or_recover(&active_connection) += 1;
            handle_connection(&mut stream, id, caches, config).await;
            *lock_or_recover(&active_connection) -= 1;
        });
        id += 1;
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(lock) => lock,
        Err(poisoned) => {
            warn!("锁被污染，恢复并继续");
            poisoned.into_inner()
        }
    }
}

/// # 连接处理器
///
/// 负责单个 TCP 流的生命周期，包括读取解析请求、执行页面、以及发送响应。
async fn handle_connection(
    stream: &mut TcpStream,
    id: u128,
    caches: Arc<PageCache>,
    config: Arc<Config>,
) {
    let mut buffer = vec![0; 4096];

    if let Err(e) = stream.readable().await {
        error!("[ID{}]等待TCPStream可读时遇到错误: {}", id, e);
        return;
    }
    let n = match stream.try_read(&mut buffer) {
        Ok(0) => return,
        Ok(n) => n,
        Err(e) => {
            error!("[ID{}]读取TCPStream时遇到错误: {}", id, e);
            return;
        }
    };
    debug!("[ID{}]HTTP请求接收完毕", id);

    let start_time = Instant::now();

    // 1. 协议解析阶段
    let request = match Request::try_from(&buffer[..n], id) {
        Ok(req) => req,
        Err(e) => {
            warn!("[ID{}]解析HTTP请求失败: {}", id, e);
            let code = match e {
                psp_server::Exception::UnsupportedMethod(_) => 405,
                psp_server::Exception::UnsupportedHttpVersion(_) => 505,
                _ => 400,
            };
            let response = Response::from_status_code(code, id);
            let _ = stream.write_all(&response.as_bytes(false)).await;
            return;
        }
    };

    // 2. 页面执行阶段：同步的页面引擎在阻塞线程池中运行
    let headonly = host::headonly(&request);
    let response = {
        let request = request.clone();
        match tokio::task::spawn_blocking(move || host::serve(&request, &config, &caches, id)).await {
            Ok(response) => response,
            Err(e) => {
                error!("[ID{}]页面执行任务异常退出：{}", id, e);
                Response::from_status_code(500, id)
            }
        }
    };

    debug!(
        "[ID{}]HTTP响应构建完成，服务端用时{}ms。",
        id,
        start_time.elapsed().as_millis()
    );

    // 3. 结构化日志记录
    info!(
        "[ID{}] {}, {}, {}, {}, {}, {}, ",
        id,
        request.version(),
        request.path(),
        request.method(),
        response.status_code(),
        response.information(),
        request.user_agent(),
    );

    // 4. 数据发送阶段
    let response_bytes = response.as_bytes(headonly);
    debug!("[ID{}]发送响应，长度: {}", id, response_bytes.len());
    if let Err(e) = stream.write_all(&response_bytes).await {
        error!("[ID{}]发送响应失败: {}", id, e);
    }
    let _ = stream.flush().await;
}
