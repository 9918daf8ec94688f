//! Watcher 注册表 - 持有所有活跃的 watch handle

use super::backend::{BackendKind, WatchBackend, WatchStrategy};
use crate::config::WatchTarget;
use crate::error::MonitorError;
use notify::Event;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, trace};

/// 送往 dispatcher 的消息
#[derive(Debug)]
pub enum Notification {
    /// 某个 handle 收到的原始事件
    Event {
        source: u64,
        /// 产生事件的后端，轮询后端的 rename 需要配对
        backend: BackendKind,
        event: Event,
        buffer: Arc<NotificationBuffer>,
    },
    /// handle 已释放
    Released(u64),
}

pub type NotificationSender = mpsc::UnboundedSender<Notification>;
pub type NotificationReceiver = mpsc::UnboundedReceiver<Notification>;

/// 单个 handle 的通知缓冲计数
///
/// 已发送但 dispatcher 尚未取走的通知数达到容量时，新通知被丢弃并记录一次溢出。
#[derive(Debug)]
pub struct NotificationBuffer {
    path: PathBuf,
    capacity: usize,
    pending: AtomicUsize,
    overflowed: AtomicBool,
}

impl NotificationBuffer {
    fn new(path: PathBuf, capacity: usize) -> Self {
        Self {
            path,
            capacity,
            pending: AtomicUsize::new(0),
            overflowed: AtomicBool::new(false),
        }
    }

    fn try_acquire(&self) -> bool {
        let previous = self.pending.fetch_add(1, Ordering::AcqRel);
        if previous >= self.capacity {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            self.report_overflow();
            return false;
        }
        true
    }

    /// dispatcher 取走一个通知后调用
    pub fn release(&self) {
        let previous = self.pending.fetch_sub(1, Ordering::AcqRel);
        if previous <= 1 {
            self.overflowed.store(false, Ordering::Release);
        }
    }

    /// 每次溢出只记录一次，直到缓冲区清空
    fn report_overflow(&self) {
        if !self.overflowed.swap(true, Ordering::AcqRel) {
            let err = MonitorError::NotificationOverflow {
                path: self.path.clone(),
            };
            error!(error = %err, "Watcher notification buffer overflow");
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

/// 一个 WatchTarget 对应的活跃订阅
#[derive(Debug)]
pub struct WatcherHandle {
    id: u64,
    target: WatchTarget,
    enabled: Arc<AtomicBool>,
    backend: WatchBackend,
}

impl WatcherHandle {
    pub fn target(&self) -> &WatchTarget {
        &self.target
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }
}

/// Watcher 注册表
///
/// 由 MonitorEngine 独占；新加入的 handle 默认不投递通知，需要 `set_enabled(true)`。
#[derive(Debug)]
pub struct WatcherRegistry {
    handles: Vec<WatcherHandle>,
    /// `close()` 后为 None，dispatcher 的通道随最后一个 sender 一起关闭
    tx: Option<NotificationSender>,
    strategy: WatchStrategy,
    poll_interval: Duration,
    next_id: u64,
}

impl WatcherRegistry {
    pub fn new(tx: NotificationSender, strategy: WatchStrategy, poll_interval: Duration) -> Self {
        Self {
            handles: Vec::new(),
            tx: Some(tx),
            strategy,
            poll_interval,
            next_id: 0,
        }
    }

    /// 订阅一个位置
    pub fn add_watch(&mut self, target: WatchTarget) -> Result<(), MonitorError> {
        let attach_error = |source: notify::Error| MonitorError::WatchAttach {
            path: target.path().to_path_buf(),
            source,
        };

        let tx = self
            .tx
            .clone()
            .ok_or(MonitorError::Disposed)?;

        // 轮询后端不会拒绝不存在的路径，这里统一检查
        std::fs::metadata(target.path())
            .map_err(|e| attach_error(notify::Error::io(e).add_path(target.path().to_path_buf())))?;

        self.next_id += 1;
        let id = self.next_id;
        let enabled = Arc::new(AtomicBool::new(false));
        let buffer = Arc::new(NotificationBuffer::new(
            target.path().to_path_buf(),
            target.buffer_size(),
        ));

        let make_handler = |backend: BackendKind| {
            let enabled = Arc::clone(&enabled);
            let buffer = Arc::clone(&buffer);
            let tx = tx.clone();
            let path = target.path().to_path_buf();
            move |result: notify::Result<Event>| {
                if !enabled.load(Ordering::Acquire) {
                    return;
                }
                match result {
                    Ok(event) => {
                        if event.need_rescan() {
                            buffer.report_overflow();
                        }
                        if !buffer.try_acquire() {
                            return;
                        }
                        let notification = Notification::Event {
                            source: id,
                            backend,
                            event,
                            buffer: Arc::clone(&buffer),
                        };
                        if tx.send(notification).is_err() {
                            buffer.release();
                            trace!(path = %path.display(), "Dispatcher closed, dropping notification");
                        }
                    }
                    Err(e) => error!(path = %path.display(), error = %e, "Watcher error"),
                }
            }
        };

        let backend = WatchBackend::attach(
            self.strategy,
            self.poll_interval,
            target.path(),
            target.recursive(),
            make_handler,
        )
        .map_err(attach_error)?;

        info!(
            path = %target.path().display(),
            recursive = target.recursive(),
            backend = backend.kind().as_str(),
            "Monitoring location"
        );

        self.handles.push(WatcherHandle {
            id,
            target,
            enabled,
            backend,
        });
        Ok(())
    }

    /// 停用并释放所有 handle，返回释放的数量；可重复调用
    pub fn remove_all(&mut self) -> usize {
        let released = self.handles.len();
        for handle in self.handles.drain(..) {
            handle.enabled.store(false, Ordering::Release);
            if let Some(tx) = &self.tx {
                let _ = tx.send(Notification::Released(handle.id));
            }
            // drop(handle) 释放底层订阅
        }
        released
    }

    /// 切换所有 handle 的投递状态，不释放订阅
    pub fn set_enabled(&self, enabled: bool) {
        for handle in &self.handles {
            handle.enabled.store(enabled, Ordering::Release);
        }
    }

    /// 释放所有 handle 并断开与 dispatcher 的通道
    pub fn close(&mut self) {
        self.remove_all();
        self.tx = None;
    }

    pub fn handles(&self) -> &[WatcherHandle] {
        &self.handles
    }

    pub fn targets(&self) -> impl Iterator<Item = &WatchTarget> {
        self.handles.iter().map(|h| &h.target)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}
