//! 事件发布 - 把变更以 JSON POST 到配置的 HTTP 端点
//!
//! Payload 格式：
//! ```json
//! {
//!   "file": "/data/b.txt",
//!   "type": "R",
//!   "oldFile": "/data/a.txt"
//! }
//! ```
//!
//! 发布是尽力而为的：失败只记录日志，不重试，也不影响后续事件。

use crate::error::PublishError;
use crate::event::ChangeEvent;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode, Url};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, error, info};

/// 默认请求超时
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// 线路 payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishPayload {
    pub file: String,
    #[serde(rename = "type")]
    pub change_type: &'static str,
    /// 非 rename 事件序列化为 null
    pub old_file: Option<String>,
}

impl From<&ChangeEvent> for PublishPayload {
    fn from(event: &ChangeEvent) -> Self {
        Self {
            file: event.path().to_string_lossy().into_owned(),
            change_type: event.kind().code(),
            old_file: event.old_path().map(|p| p.to_string_lossy().into_owned()),
        }
    }
}

/// 单次发布的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// 端点返回 2xx
    Delivered(StatusCode),
    /// 未配置有效 URL，发布被跳过
    Disabled,
}

/// 事件发布器
///
/// 内部的 `reqwest::Client` 可以安全地被多个并发任务共享。
#[derive(Debug, Clone)]
pub struct EventPublisher {
    client: Client,
    url: Option<Url>,
}

impl EventPublisher {
    /// 创建发布器；`url` 为 None 时进入降级模式（发布为空操作）
    pub fn new(url: Option<Url>, timeout: Duration) -> Result<Self, PublishError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url })
    }

    /// 降级模式的发布器
    pub fn disabled() -> Self {
        Self {
            client: Client::new(),
            url: None,
        }
    }

    pub fn url(&self) -> Option<&Url> {
        self.url.as_ref()
    }

    pub fn is_enabled(&self) -> bool {
        self.url.is_some()
    }

    /// 发布一个事件
    pub async fn publish(&self, event: &ChangeEvent) -> Result<PublishOutcome, PublishError> {
        let Some(url) = &self.url else {
            debug!(file = %event.path().display(), "No valid publish url, skipping event");
            return Ok(PublishOutcome::Disabled);
        };

        let payload = PublishPayload::from(event);
        let json = serde_json::to_string_pretty(&payload)?;

        debug!(payload = %json, "Publishing event");

        let response = match self
            .client
            .post(url.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(json.clone())
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                error!(
                    file = %payload.file,
                    change = payload.change_type,
                    error = %e,
                    payload = %json,
                    "Publish event failed"
                );
                return Err(PublishError::Transport(e));
            }
        };

        let status = response.status();
        if status.is_success() {
            info!(status = status.as_u16(), file = %payload.file, "Published event");
            Ok(PublishOutcome::Delivered(status))
        } else {
            error!(
                status = status.as_u16(),
                file = %payload.file,
                payload = %json,
                "Publish event failed: endpoint returned non-success status"
            );
            Err(PublishError::Status(status))
        }
    }
}
