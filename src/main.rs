use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, Command};
use tokio::signal;
use tracing::{error, info, warn};

use evalflow_core::{init_logging, AppConfig, LogFormat, LogLevel, LoggingConfig};

mod app;
mod shutdown;

use app::{AppMode, Application};
use shutdown::ShutdownManager;

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("evalflow")
        .version(env!("CARGO_PKG_VERSION"))
        .about("ML 评测任务编排系统")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径，不指定时按默认路径查找"),
        )
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_name("MODE")
                .help("运行模式")
                .value_parser(["controller", "agent", "all"])
                .default_value("all"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别，覆盖配置文件")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式，覆盖配置文件")
                .value_parser(["json", "pretty", "compact"]),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").map(String::as_str);
    let mode_str = matches
        .get_one::<String>("mode")
        .map(String::as_str)
        .unwrap_or("all");

    let config = AppConfig::load(config_path).context("加载配置失败")?;

    let mut logging = LoggingConfig {
        level: config.observability.log_level,
        format: config.observability.log_format,
        ..LoggingConfig::default()
    };
    if let Some(level) = matches.get_one::<String>("log-level") {
        logging.level = level.parse::<LogLevel>()?;
    }
    if let Some(format) = matches.get_one::<String>("log-format") {
        logging.format = format.parse::<LogFormat>()?;
    }
    init_logging(&logging)?;

    info!("启动 EvalFlow，运行模式: {mode_str}");
    if let Some(path) = config_path {
        info!("配置文件: {path}");
    }

    let app_mode = AppMode::parse(mode_str, &config)?;
    let app = Arc::new(Application::new(config, app_mode));
    let shutdown_manager = ShutdownManager::new();

    let mut app_handle = {
        let shutdown_rx = shutdown_manager.subscribe().await;
        let app = Arc::clone(&app);
        tokio::spawn(async move {
            if let Err(e) = app.run(shutdown_rx).await {
                error!("应用运行失败: {e:#}");
            }
        })
    };

    tokio::select! {
        _ = wait_for_shutdown_signal() => {
            info!("收到关闭信号，开始优雅关闭...");
            shutdown_manager.shutdown().await;
            match tokio::time::timeout(Duration::from_secs(30), &mut app_handle).await {
                Ok(Ok(())) => info!("应用已优雅关闭"),
                Ok(Err(e)) => error!("应用关闭时发生错误: {e}"),
                Err(_) => warn!("应用关闭超时，强制退出"),
            }
        }
        result = &mut app_handle => {
            if let Err(e) = result {
                error!("应用任务异常结束: {e}");
            }
            shutdown_manager.shutdown().await;
        }
    }

    info!("EvalFlow 已退出");
    Ok(())
}

/// 等待 Ctrl+C 或 SIGTERM
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("安装Ctrl+C信号处理器失败: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("安装SIGTERM信号处理器失败: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("收到Ctrl+C信号"),
        _ = terminate => info!("收到SIGTERM信号"),
    }
}
