//! File Change Monitor CLI
//!
//! 监控目录或全部挂载卷，把文件变更发布到 HTTP 端点

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use file_change_monitor::config::{self, describe_targets, ConfigPaths, LoadedConfig, Overrides};
use file_change_monitor::{DaemonManager, LaunchdService, MonitorEngine, TargetSource};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "fcm")]
#[command(about = "File Change Monitor - 监控文件变更并发布到 HTTP 端点")]
#[command(version)]
struct Cli {
    /// 配置目录（包含 WatchDir.txt / UrlConfig.txt / settings.json）
    #[arg(long, global = true, env = "FCM_CONFIG_DIR")]
    config_dir: Option<PathBuf>,
    /// 监控所有已挂载的卷，忽略 WatchDir.txt
    #[arg(long, global = true)]
    all_drives: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 前台运行，Ctrl+C 退出
    Run,
    /// 后台 daemon（由 `fcm start` 或 launchd 启动）
    Daemon,
    /// 启动后台 daemon
    Start,
    /// 停止后台 daemon
    Stop,
    /// 查看 daemon 状态
    Status,
    /// 打印解析后的配置
    Config {
        /// 输出 JSON 格式
        #[arg(long)]
        json: bool,
    },
    /// 管理 launchd 服务 (macOS)
    Service {
        #[command(subcommand)]
        action: ServiceAction,
    },
}

#[derive(Subcommand)]
enum ServiceAction {
    /// 安装为 launchd 服务
    Install {
        /// 强制重新安装
        #[arg(long)]
        force: bool,
    },
    /// 卸载服务
    Uninstall,
    /// 查看服务状态
    Status,
}

impl Cli {
    fn paths(&self) -> ConfigPaths {
        ConfigPaths::new(self.config_dir.clone().unwrap_or_else(ConfigPaths::default_dir))
    }

    fn overrides(&self) -> Overrides {
        Overrides {
            monitor_all_drives: self.all_drives,
        }
    }

    /// 透传给后台 daemon 的全局参数
    fn daemon_args(&self) -> Vec<String> {
        let mut args = vec![
            "--config-dir".to_string(),
            self.paths().dir().display().to_string(),
        ];
        if self.all_drives {
            args.push("--all-drives".to_string());
        }
        args
    }
}

/// `fcm config` 输出
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConfigReport {
    config_dir: PathBuf,
    watch_list: PathBuf,
    url_list: PathBuf,
    publish_url: Option<String>,
    all_volumes: bool,
    targets: Vec<PathBuf>,
    settings: config::AppSettings,
}

impl ConfigReport {
    fn new(paths: &ConfigPaths, loaded: &LoadedConfig) -> Self {
        Self {
            config_dir: paths.dir().to_path_buf(),
            watch_list: paths.watch_list(),
            url_list: paths.url_list(),
            publish_url: loaded.config.publish_url.as_ref().map(|u| u.to_string()),
            all_volumes: matches!(loaded.config.targets, TargetSource::AllVolumes),
            targets: describe_targets(&loaded.config.targets),
            settings: loaded.settings.clone(),
        }
    }
}

/// 启动引擎直到收到退出信号，然后停止并释放
async fn run_engine(paths: &ConfigPaths, overrides: &Overrides) -> Result<()> {
    // 确保配置目录存在，控制文件 watcher 需要监控它
    if let Err(e) = std::fs::create_dir_all(paths.dir()) {
        warn!(error = %e, dir = %paths.dir().display(), "Failed to create config directory");
    }

    let loaded = config::load(paths, overrides);
    let mut engine = MonitorEngine::new(loaded.options, loaded.config);

    if let Err(e) = engine.start() {
        engine.dispose().await;
        return Err(e).context("Failed to start file monitor");
    }

    info!(watching = engine.watched_paths().len(), "File monitor running");
    shutdown_signal().await;
    info!("Shutdown signal received");

    engine.stop().context("Failed to stop file monitor")?;
    engine.dispose().await;
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            error!(error = %e, "Cannot install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[tokio::main]
async fn main() -> Result<()> {
    // 通过 RUST_LOG 环境变量控制日志级别，默认为 info
    // 例如: RUST_LOG=debug fcm run
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("file_change_monitor=info,fcm=info"));

    fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    let cli = Cli::parse();
    let paths = cli.paths();
    let overrides = cli.overrides();

    match &cli.command {
        Commands::Run => {
            run_engine(&paths, &overrides).await?;
        }
        Commands::Daemon => {
            let daemon = DaemonManager::new();
            let _lock = daemon.acquire()?;
            info!(pid = std::process::id(), "Monitor daemon started");
            run_engine(&paths, &overrides).await?;
            info!("Monitor daemon exiting");
        }
        Commands::Start => {
            let daemon = DaemonManager::new();
            if daemon.ensure_started(&cli.daemon_args())? {
                println!("✅ 监控 daemon 已启动");
                println!("   配置目录: {}", paths.dir().display());
            } else {
                println!("ℹ️  监控 daemon 已在运行");
            }
        }
        Commands::Stop => {
            let daemon = DaemonManager::new();
            if daemon.stop()? {
                println!("✅ 监控 daemon 已停止");
            } else {
                println!("ℹ️  监控 daemon 未运行");
            }
        }
        Commands::Status => {
            let daemon = DaemonManager::new();
            if daemon.is_running() {
                println!("🟢 监控 daemon 运行中");
                if let Some(pid) = daemon.read_pid()? {
                    println!("   PID: {}", pid);
                }
            } else {
                println!("🔴 监控 daemon 未运行");
                println!("   运行 'fcm start' 启动");
            }
        }
        Commands::Config { json } => {
            let loaded = config::load(&paths, &overrides);
            let report = ConfigReport::new(&paths, &loaded);
            if *json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("配置目录: {}", report.config_dir.display());
                println!("监控列表: {}", report.watch_list.display());
                println!("URL 文件: {}", report.url_list.display());
                println!(
                    "发布地址: {}",
                    report.publish_url.as_deref().unwrap_or("(未配置，发布已禁用)")
                );
                if report.all_volumes {
                    println!("监控范围: 全部已挂载卷");
                }
                println!("监控目标 ({}):", report.targets.len());
                for target in &report.targets {
                    println!("  {}", target.display());
                }
            }
        }
        Commands::Service { action } => {
            let service = LaunchdService::new(cli.config_dir.as_ref().map(|_| paths.dir().to_path_buf()))?;
            match action {
                ServiceAction::Install { force } => {
                    if *force {
                        let _ = service.uninstall();
                    }
                    service.install().context("安装失败")?;
                    println!("✅ 监控服务已安装并启动");
                    println!("   服务会在登录时自动运行");
                    println!("   查看状态: fcm service status");
                }
                ServiceAction::Uninstall => {
                    service.uninstall().context("卸载失败")?;
                    println!("✅ 监控服务已卸载");
                }
                ServiceAction::Status => {
                    let status = service.status().context("获取状态失败")?;
                    if !status.installed {
                        println!("⚪ 服务未安装");
                        println!("   运行 'fcm service install' 安装服务");
                    } else if status.running {
                        println!("🟢 服务运行中");
                        if let Some(pid) = status.pid {
                            println!("   PID: {}", pid);
                        }
                    } else {
                        println!("🔴 服务已安装但未运行");
                    }
                }
            }
        }
    }

    Ok(())
}
