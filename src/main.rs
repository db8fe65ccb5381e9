use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Arg, Command};
use edge_scheduler::app::Application;
use edge_scheduler::shutdown::{wait_for_signal, ShutdownManager};
use edge_scheduler_core::config::AppConfig;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("edge-scheduler")
        .version(env!("CARGO_PKG_VERSION"))
        .about("边缘节点任务调度与日志收集")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径，未指定时查找默认位置"),
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
                .value_parser(["json", "pretty"]),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").map(String::as_str);
    let mut config = AppConfig::load(config_path).with_context(|| match config_path {
        Some(path) => format!("加载配置文件失败: {path}"),
        None => "加载默认配置失败".to_string(),
    })?;
    if let Some(level) = matches.get_one::<String>("log-level") {
        config.observability.log_level = level.clone();
    }
    if let Some(format) = matches.get_one::<String>("log-format") {
        config.observability.log_format = format.clone();
    }

    init_logging(&config.observability.log_level, &config.observability.log_format)?;
    info!("启动边缘调度服务");
    if let Some(path) = config_path {
        info!("配置文件: {path}");
    }

    if let Some(addr) = &config.observability.metrics_listen_addr {
        init_metrics(addr)?;
    }

    let shutdown_manager = ShutdownManager::default();
    let app = Arc::new(Application::new(config).await?);

    let app_handle = {
        let app = Arc::clone(&app);
        let shutdown_rx = shutdown_manager.subscribe();
        let grace_period = shutdown_manager.grace_period();
        tokio::spawn(async move {
            if let Err(e) = app.run(shutdown_rx, grace_period).await {
                error!("应用运行失败: {e:#}");
            }
        })
    };

    match wait_for_signal().await {
        Ok(name) => info!("收到 {name} 信号，开始优雅关闭"),
        Err(e) => warn!("安装信号处理器失败: {e}，立即关闭"),
    }
    shutdown_manager.trigger();

    // 在调度器等待时间之外再留出清理时间
    let deadline = shutdown_manager.grace_period() * 2;
    match tokio::time::timeout(deadline, app_handle).await {
        Ok(Ok(())) => info!("应用已优雅关闭"),
        Ok(Err(e)) => error!("应用关闭时发生错误: {e}"),
        Err(_) => warn!("应用关闭超时，强制退出"),
    }

    info!("边缘调度服务已退出");
    Ok(())
}

/// 初始化日志系统
fn init_logging(log_level: &str, log_format: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format {
        "json" => {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .context("初始化JSON日志格式失败")?;
        }
        "pretty" => {
            registry
                .with(tracing_subscriber::fmt::layer().pretty())
                .try_init()
                .context("初始化Pretty日志格式失败")?;
        }
        _ => {
            return Err(anyhow::anyhow!("不支持的日志格式: {log_format}"));
        }
    }

    Ok(())
}

/// 启动Prometheus指标导出端点
fn init_metrics(addr: &str) -> Result<()> {
    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("无效的指标监听地址: {addr}"))?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("启动Prometheus导出器失败")?;
    info!("指标导出端点: http://{addr}/metrics");
    Ok(())
}
