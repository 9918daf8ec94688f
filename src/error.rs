//! 错误类型定义

use std::path::PathBuf;

/// 引擎层错误
///
/// 只有 `WatchAttach` 会从 start / reconfigure 返回给宿主，
/// 其余错误在检测到它们的组件内部记录日志后结束。
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum MonitorError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to monitor location {}: {source}", path.display())]
    WatchAttach {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },

    #[error("notification buffer overflow for {}, some events were lost", path.display())]
    NotificationOverflow { path: PathBuf },

    #[error("cannot {op} while engine is {from}")]
    InvalidState { from: &'static str, op: &'static str },

    #[error("engine has been disposed")]
    Disposed,
}

/// 发布失败（只记录日志，不重试，不向上传播）
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("endpoint returned {0}")]
    Status(reqwest::StatusCode),
}
