//! 配置类型

use crate::watcher::WatchStrategy;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// 每个 handle 默认可排队的通知数
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// 一个被监控的位置
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WatchTarget {
    path: PathBuf,
    recursive: bool,
    buffer_size: usize,
}

impl WatchTarget {
    /// 递归监控，默认缓冲区
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            recursive: true,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    pub fn with_recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn recursive(&self) -> bool {
        self.recursive
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}

/// 监控目标来源
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSource {
    /// watch list 中显式列出的路径
    Explicit(Vec<WatchTarget>),
    /// 所有已挂载的卷
    AllVolumes,
}

/// 引擎配置（启动时读取，每次重新配置时整体替换目标部分）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub targets: TargetSource,
    /// None 表示发布被禁用（降级模式）
    pub publish_url: Option<Url>,
}

impl EngineConfig {
    pub fn explicit(targets: Vec<WatchTarget>, publish_url: Option<Url>) -> Self {
        Self {
            targets: TargetSource::Explicit(targets),
            publish_url,
        }
    }

    pub fn all_volumes(publish_url: Option<Url>) -> Self {
        Self {
            targets: TargetSource::AllVolumes,
            publish_url,
        }
    }
}

/// settings.json
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppSettings {
    /// UrlConfig.txt 为空时使用的发布地址
    pub url: Option<String>,
    /// 监控所有已挂载的卷（忽略 WatchDir.txt 内容）
    pub monitor_all_drives: bool,
    pub recursive: bool,
    pub buffer_size: usize,
    pub strategy: WatchStrategy,
    pub poll_interval_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            url: None,
            monitor_all_drives: false,
            recursive: true,
            buffer_size: DEFAULT_BUFFER_SIZE,
            strategy: WatchStrategy::Auto,
            poll_interval_secs: 2,
            request_timeout_secs: 30,
        }
    }
}
