//! 文件系统监控子系统 - 监控后端、watch handle 注册表与控制文件 watcher

mod backend;
mod config_watcher;
mod registry;

pub use backend::{BackendKind, WatchBackend, WatchStrategy};
pub use config_watcher::ConfigWatcher;
pub use registry::{
    Notification, NotificationBuffer, NotificationReceiver, NotificationSender, WatcherHandle,
    WatcherRegistry,
};
