//! 控制文件监控 - watch list 被修改时触发重新配置
//!
//! 不做防抖：连续写入会产生连续回调，回调方必须能承受快速重复调用。

use super::backend::{WatchBackend, WatchStrategy};
use crate::error::MonitorError;
use notify::event::{AccessKind, AccessMode, ModifyKind, RenameMode};
use notify::{Event, EventKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// 控制文件 watcher；drop 时停止监控
#[derive(Debug)]
pub struct ConfigWatcher {
    path: PathBuf,
    _backend: WatchBackend,
}

impl ConfigWatcher {
    /// 监控 `path`，每次写入后以文件最新内容调用 `on_change`
    ///
    /// 实际订阅的是父目录（非递归），这样编辑器"写临时文件再 rename"的保存方式也能被捕获。
    pub fn attach<F>(
        path: impl Into<PathBuf>,
        strategy: WatchStrategy,
        poll_interval: Duration,
        on_change: F,
    ) -> Result<Self, MonitorError>
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        let path = path.into();
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        std::fs::metadata(&parent).map_err(|e| MonitorError::WatchAttach {
            path: parent.clone(),
            source: notify::Error::io(e),
        })?;

        // FSEvents 上报的是规范化路径
        let aliases: Arc<[PathBuf]> = {
            let mut aliases = vec![path.clone()];
            if let (Ok(canonical_parent), Some(name)) = (parent.canonicalize(), path.file_name()) {
                let canonical = canonical_parent.join(name);
                if canonical != path {
                    aliases.push(canonical);
                }
            }
            aliases.into()
        };

        let on_change = Arc::new(on_change);
        let handler = {
            let path = path.clone();
            move |result: notify::Result<Event>| {
                let event = match result {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Control file watcher error");
                        return;
                    }
                };
                if !touches_control_file(&event, &aliases) {
                    return;
                }

                debug!(kind = ?event.kind, "Control file changed");
                match std::fs::read_to_string(&path) {
                    Ok(contents) => on_change(contents),
                    Err(e) => warn!(
                        path = %path.display(),
                        error = %e,
                        "Cannot read control file, keeping current watchers"
                    ),
                }
            }
        };

        let backend = WatchBackend::attach(strategy, poll_interval, &parent, false, |_| handler.clone())
            .map_err(|source| MonitorError::WatchAttach {
                path: parent.clone(),
                source,
            })?;

        info!(path = %path.display(), "Watching control file for changes");

        Ok(Self {
            path,
            _backend: backend,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// 事件是否是对控制文件的写入
fn touches_control_file(event: &Event, aliases: &[PathBuf]) -> bool {
    let is_write = matches!(
        event.kind,
        EventKind::Create(_)
            | EventKind::Access(AccessKind::Close(AccessMode::Write))
            | EventKind::Modify(
                ModifyKind::Any
                    | ModifyKind::Data(_)
                    | ModifyKind::Metadata(_)
                    | ModifyKind::Other
                    | ModifyKind::Name(RenameMode::To | RenameMode::Both)
            )
    );

    is_write && event.paths.iter().any(|p| aliases.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, RemoveKind};
    use std::sync::mpsc;

    fn ev(kind: EventKind, path: &str) -> Event {
        Event::new(kind).add_path(PathBuf::from(path))
    }

    #[test]
    fn test_touches_control_file() {
        let aliases = vec![PathBuf::from("/cfg/WatchDir.txt")];

        assert!(touches_control_file(
            &ev(EventKind::Modify(ModifyKind::Data(DataChange::Content)), "/cfg/WatchDir.txt"),
            &aliases
        ));
        assert!(touches_control_file(
            &ev(EventKind::Create(CreateKind::File), "/cfg/WatchDir.txt"),
            &aliases
        ));
        assert!(touches_control_file(
            &ev(EventKind::Modify(ModifyKind::Name(RenameMode::To)), "/cfg/WatchDir.txt"),
            &aliases
        ));

        // 其他文件
        assert!(!touches_control_file(
            &ev(EventKind::Modify(ModifyKind::Data(DataChange::Content)), "/cfg/UrlConfig.txt"),
            &aliases
        ));
        // 删除不触发
        assert!(!touches_control_file(
            &ev(EventKind::Remove(RemoveKind::File), "/cfg/WatchDir.txt"),
            &aliases
        ));
        // 只读访问不触发
        assert!(!touches_control_file(
            &ev(EventKind::Access(AccessKind::Open(AccessMode::Read)), "/cfg/WatchDir.txt"),
            &aliases
        ));
    }

    #[test]
    fn test_callback_receives_fresh_contents() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let file = dir.path().join("WatchDir.txt");
        std::fs::write(&file, "first").unwrap();

        let (tx, rx) = mpsc::channel();
        let _watcher = ConfigWatcher::attach(
            &file,
            WatchStrategy::Polling,
            Duration::from_millis(50),
            move |contents| {
                let _ = tx.send(contents);
            },
        )
        .unwrap();

        // 轮询以 mtime 判断变化，等待足够久保证时间戳不同
        std::thread::sleep(Duration::from_millis(1100));
        std::fs::write(&file, "/data/a;/data/b").unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        let mut last = None;
        while std::time::Instant::now() < deadline {
            if let Ok(contents) = rx.recv_timeout(Duration::from_millis(200)) {
                last = Some(contents);
                if last.as_deref() == Some("/data/a;/data/b") {
                    break;
                }
            }
        }
        assert_eq!(last.as_deref(), Some("/data/a;/data/b"));
    }

    #[test]
    fn test_attach_fails_for_missing_directory() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let file = dir.path().join("missing").join("WatchDir.txt");
        let result = ConfigWatcher::attach(&file, WatchStrategy::Auto, Duration::from_millis(50), |_| {});
        assert!(matches!(result, Err(MonitorError::WatchAttach { .. })));
    }
}
