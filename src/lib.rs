//! File Change Monitor - 监控目录或全部挂载卷，把每个文件变更以 JSON 发布到 HTTP 端点

pub mod config;
pub mod daemon;
pub mod engine;
pub mod error;
pub mod event;
pub mod filter;
pub mod publisher;
pub mod service;
pub mod watcher;

pub use config::{AppSettings, ConfigPaths, EngineConfig, LoadedConfig, Overrides, TargetSource, WatchTarget};
pub use daemon::{DaemonLock, DaemonManager};
pub use engine::{EngineOptions, EngineState, MonitorEngine};
pub use error::{MonitorError, PublishError};
pub use event::{ChangeEvent, ChangeKind, Classifier};
pub use filter::{EventFilter, FileAttributes};
pub use publisher::{EventPublisher, PublishOutcome, PublishPayload};
pub use service::{LaunchdService, ServiceStatus};
pub use watcher::{WatchStrategy, WatcherRegistry};
