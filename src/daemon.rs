//! Daemon 模块 - 管理后台监控进程
//!
//! 运行中的 daemon 对锁文件持有排他锁，其他进程通过尝试加锁判断它是否存活；
//! PID 文件只用于 `stop` 发送信号。

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, warn};

/// Daemon 管理器
#[derive(Debug, Clone)]
pub struct DaemonManager {
    /// 数据目录
    data_dir: PathBuf,
}

impl DaemonManager {
    /// 使用 `~/.file-change-monitor` 作为数据目录
    pub fn new() -> Self {
        let data_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".file-change-monitor");
        Self::with_data_dir(data_dir)
    }

    /// 使用指定数据目录（测试用）
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let _ = fs::create_dir_all(&data_dir);
        Self { data_dir }
    }

    /// PID 文件和锁文件所在目录
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// 运行中 daemon 的 PID
    pub fn pid_file_path(&self) -> PathBuf {
        self.data_dir.join("monitor.pid")
    }

    /// 单实例锁文件
    pub fn lock_file_path(&self) -> PathBuf {
        self.data_dir.join("monitor.lock")
    }

    fn open_lock_file(&self) -> Result<File> {
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.lock_file_path())
            .with_context(|| format!("Failed to open {}", self.lock_file_path().display()))
    }

    /// 是否有 daemon 持有锁
    pub fn is_running(&self) -> bool {
        if !self.lock_file_path().exists() {
            return false;
        }
        match self.open_lock_file() {
            Ok(file) => match file.try_lock_exclusive() {
                Ok(()) => {
                    let _ = file.unlock();
                    false
                }
                Err(_) => true,
            },
            Err(_) => false,
        }
    }

    /// 当前进程成为 daemon：加锁并写入 PID
    ///
    /// 已有 daemon 运行时返回错误。锁在返回的 guard drop 时释放。
    pub fn acquire(&self) -> Result<DaemonLock> {
        let file = self.open_lock_file()?;
        if file.try_lock_exclusive().is_err() {
            bail!(
                "Another monitor daemon is already running (pid file: {})",
                self.pid_file_path().display()
            );
        }

        let pid_file = self.pid_file_path();
        fs::write(&pid_file, std::process::id().to_string())
            .with_context(|| format!("Failed to write {}", pid_file.display()))?;

        Ok(DaemonLock {
            file,
            pid_file,
        })
    }

    /// 读取 PID 文件；不存在或内容无法解析时返回 None
    pub fn read_pid(&self) -> Result<Option<u32>> {
        let pid_file = self.pid_file_path();
        if !pid_file.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&pid_file)?;
        Ok(content.trim().parse().ok())
    }

    /// 删除 PID 文件（不存在时无操作）
    pub fn remove_pid(&self) -> Result<()> {
        let pid_file = self.pid_file_path();
        if pid_file.exists() {
            fs::remove_file(pid_file)?;
        }
        Ok(())
    }

    /// 启动后台 daemon（如果未运行）；返回是否新启动
    ///
    /// `extra_args` 原样传给 `fcm daemon`（例如 `--config-dir`）。
    pub fn ensure_started(&self, extra_args: &[String]) -> Result<bool> {
        if self.is_running() {
            return Ok(false);
        }

        let exe = std::env::current_exe().context("Failed to get current executable path")?;
        let child = Command::new(&exe)
            .args(extra_args)
            .arg("daemon")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to spawn {}", exe.display()))?;

        debug!(pid = child.id(), "Monitor daemon spawned");
        Ok(true)
    }

    /// 停止 daemon；返回是否找到了要停止的进程
    pub fn stop(&self) -> Result<bool> {
        let Some(pid) = self.read_pid()? else {
            return Ok(false);
        };

        if self.is_running() {
            let status = Command::new("kill")
                .args(["-TERM", &pid.to_string()])
                .status()
                .context("Failed to execute kill")?;
            if !status.success() {
                warn!(pid, "kill -TERM failed");
            }
        }

        // daemon 正常退出时自己会删除；这里兜底清理残留文件
        self.remove_pid()?;
        Ok(true)
    }
}

impl Default for DaemonManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 运行中的 daemon 持有的锁；drop 时删除 PID 文件并解锁
#[derive(Debug)]
pub struct DaemonLock {
    file: File,
    pid_file: PathBuf,
}

impl Drop for DaemonLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.pid_file);
        let _ = self.file.unlock();
    }
}
