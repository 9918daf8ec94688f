//! 监控后端 - 原生递归监控与轮询回退

use notify::{
    Config, ErrorKind, EventHandler, PollWatcher, RecommendedWatcher, RecursiveMode, Watcher,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// 后端选择策略
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchStrategy {
    /// 优先原生，失败时回退到轮询
    #[default]
    Auto,
    /// 只用原生（inotify / FSEvents / ReadDirectoryChangesW）
    Native,
    /// 只用轮询
    Polling,
}

/// 实际使用的后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Native,
    Polling,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Native => "native",
            BackendKind::Polling => "polling",
        }
    }
}

/// 一个已挂载的 notify 订阅；drop 时释放
pub enum WatchBackend {
    Native(RecommendedWatcher),
    Polling(PollWatcher),
}

impl WatchBackend {
    /// 按策略创建后端并开始监控 `path`
    ///
    /// `make_handler` 以最终使用的后端类型调用，Auto 回退时会被调用两次。
    pub fn attach<F, H>(
        strategy: WatchStrategy,
        poll_interval: Duration,
        path: &Path,
        recursive: bool,
        make_handler: F,
    ) -> notify::Result<Self>
    where
        F: Fn(BackendKind) -> H,
        H: EventHandler,
    {
        let mode = if recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };

        match strategy {
            WatchStrategy::Native => Self::native(make_handler(BackendKind::Native), path, mode),
            WatchStrategy::Polling => {
                Self::polling(make_handler(BackendKind::Polling), path, mode, poll_interval)
            }
            WatchStrategy::Auto => match Self::native(make_handler(BackendKind::Native), path, mode) {
                Ok(backend) => Ok(backend),
                Err(e) if is_missing_path(&e) => Err(e),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "Native watcher unavailable, falling back to polling"
                    );
                    Self::polling(make_handler(BackendKind::Polling), path, mode, poll_interval)
                }
            },
        }
    }

    fn native<H: EventHandler>(handler: H, path: &Path, mode: RecursiveMode) -> notify::Result<Self> {
        let mut watcher = RecommendedWatcher::new(handler, Config::default())?;
        watcher.watch(path, mode)?;
        Ok(Self::Native(watcher))
    }

    fn polling<H: EventHandler>(
        handler: H,
        path: &Path,
        mode: RecursiveMode,
        interval: Duration,
    ) -> notify::Result<Self> {
        let mut watcher =
            PollWatcher::new(handler, Config::default().with_poll_interval(interval))?;
        watcher.watch(path, mode)?;
        Ok(Self::Polling(watcher))
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            WatchBackend::Native(_) => BackendKind::Native,
            WatchBackend::Polling(_) => BackendKind::Polling,
        }
    }
}

impl std::fmt::Debug for WatchBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("WatchBackend").field(&self.kind().as_str()).finish()
    }
}

fn is_missing_path(e: &notify::Error) -> bool {
    match &e.kind {
        ErrorKind::PathNotFound => true,
        ErrorKind::Io(io) => io.kind() == std::io::ErrorKind::NotFound,
        _ => false,
    }
}
