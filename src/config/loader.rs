//! 配置加载 - 从配置目录读取 watch list、发布地址和 settings.json
//!
//! 配置目录结构：
//! ```text
//! ~/.config/file-change-monitor/
//! ├── WatchDir.txt     # 分号分隔的监控路径（控制文件，运行中可编辑）
//! ├── UrlConfig.txt    # 每行一个候选 URL，取第一个非空行
//! └── settings.json    # 可选
//! ```

use super::types::{AppSettings, EngineConfig, TargetSource};
use super::volumes::mounted_volumes;
use crate::engine::EngineOptions;
use crate::error::MonitorError;
use reqwest::Url;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};

pub const WATCH_LIST_FILE: &str = "WatchDir.txt";
pub const URL_LIST_FILE: &str = "UrlConfig.txt";
pub const SETTINGS_FILE: &str = "settings.json";

/// 配置目录中各文件的位置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigPaths {
    dir: PathBuf,
}

impl ConfigPaths {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let dir = std::path::absolute(&dir).unwrap_or(dir);
        Self { dir }
    }

    /// 默认配置目录：`<config_dir>/file-change-monitor`
    pub fn default_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("file-change-monitor")
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn watch_list(&self) -> PathBuf {
        self.dir.join(WATCH_LIST_FILE)
    }

    pub fn url_list(&self) -> PathBuf {
        self.dir.join(URL_LIST_FILE)
    }

    pub fn settings(&self) -> PathBuf {
        self.dir.join(SETTINGS_FILE)
    }
}

impl Default for ConfigPaths {
    fn default() -> Self {
        Self::new(Self::default_dir())
    }
}

/// 解析 watch list：分号分隔，忽略空白项，相对路径基于 `base`
pub fn parse_watch_list(contents: &str, base: &Path) -> Vec<PathBuf> {
    contents
        .split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let path = Path::new(entry);
            if path.is_absolute() {
                path.to_path_buf()
            } else {
                base.join(path)
            }
        })
        .collect()
}

/// 取第一个非空行
pub fn first_url(contents: &str) -> Option<&str> {
    contents.lines().map(str::trim).find(|line| !line.is_empty())
}

/// 校验发布地址：必须是 http/https 绝对 URL
pub fn resolve_publish_url(candidate: &str) -> Result<Url, MonitorError> {
    let url = Url::parse(candidate.trim())
        .map_err(|e| MonitorError::InvalidConfig(format!("not a valid http url '{candidate}': {e}")))?;

    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(MonitorError::InvalidConfig(format!(
            "unsupported url scheme '{other}' in '{candidate}', expected http or https"
        ))),
    }
}

/// 读取 settings.json；文件不存在时返回默认值
pub fn load_settings(path: &Path) -> Result<AppSettings, MonitorError> {
    if !path.exists() {
        return Ok(AppSettings::default());
    }

    let content = fs::read_to_string(path).map_err(|e| {
        MonitorError::InvalidConfig(format!("cannot read {}: {e}", path.display()))
    })?;
    serde_json::from_str(&content)
        .map_err(|e| MonitorError::InvalidConfig(format!("invalid {}: {e}", path.display())))
}

/// 命令行覆盖项
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub monitor_all_drives: bool,
}

/// 加载完成的配置
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub settings: AppSettings,
    pub options: EngineOptions,
    pub config: EngineConfig,
}

/// 加载全部配置
///
/// 不会失败：错误的 URL 让发布进入降级模式，缺失的 watch list 视为空列表，
/// 两者都只记录日志。
pub fn load(paths: &ConfigPaths, overrides: &Overrides) -> LoadedConfig {
    let settings = load_settings(&paths.settings()).unwrap_or_else(|e| {
        error!(error = %e, "Failed to load settings, using defaults");
        AppSettings::default()
    });

    info!(path = %paths.url_list().display(), "Url file location");
    info!(path = %paths.watch_list().display(), "Watch dir file location");

    let options = EngineOptions::new(paths.watch_list())
        .with_strategy(settings.strategy)
        .with_poll_interval(Duration::from_secs(settings.poll_interval_secs.max(1)))
        .with_recursive(settings.recursive)
        .with_buffer_size(settings.buffer_size)
        .with_request_timeout(Duration::from_secs(settings.request_timeout_secs.max(1)));

    let publish_url = load_publish_url(paths, &settings);

    let targets = if overrides.monitor_all_drives || settings.monitor_all_drives {
        info!("Monitoring all mounted volumes");
        TargetSource::AllVolumes
    } else {
        let contents = fs::read_to_string(paths.watch_list()).unwrap_or_else(|e| {
            warn!(
                path = %paths.watch_list().display(),
                error = %e,
                "Cannot read watch list, starting with no watch targets"
            );
            String::new()
        });
        TargetSource::Explicit(options.targets_from_list(&contents))
    };

    LoadedConfig {
        settings,
        options,
        config: EngineConfig {
            targets,
            publish_url,
        },
    }
}

fn load_publish_url(paths: &ConfigPaths, settings: &AppSettings) -> Option<Url> {
    let from_file = fs::read_to_string(paths.url_list())
        .ok()
        .and_then(|contents| first_url(&contents).map(str::to_string));

    let Some(candidate) = from_file.or_else(|| settings.url.clone()) else {
        error!("No publish url configured, publishing disabled");
        return None;
    };

    info!(url = %candidate, "File monitor publish url");
    match resolve_publish_url(&candidate) {
        Ok(url) => Some(url),
        Err(e) => {
            error!(error = %e, "Publishing disabled");
            None
        }
    }
}

/// 列出当前配置会监控的路径（`fcm config` 使用）
pub fn describe_targets(source: &TargetSource) -> Vec<PathBuf> {
    match source {
        TargetSource::Explicit(targets) => targets.iter().map(|t| t.path().to_path_buf()).collect(),
        TargetSource::AllVolumes => mounted_volumes(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watcher::WatchStrategy;

    #[test]
    fn test_parse_watch_list() {
        let paths = parse_watch_list(" /data/a ; /data/b;;  ;\n", Path::new("/cfg"));
        assert_eq!(paths, vec![PathBuf::from("/data/a"), PathBuf::from("/data/b")]);
    }

    #[test]
    fn test_parse_watch_list_relative_entries() {
        let paths = parse_watch_list("inbox", Path::new("/cfg"));
        assert_eq!(paths, vec![PathBuf::from("/cfg/inbox")]);
    }

    #[test]
    fn test_parse_empty_watch_list() {
        assert!(parse_watch_list("", Path::new("/cfg")).is_empty());
        assert!(parse_watch_list(" ; ;", Path::new("/cfg")).is_empty());
    }

    #[test]
    fn test_first_url_skips_blank_lines() {
        assert_eq!(
            first_url("\n   \nhttp://a.example/x\nhttp://b.example/y\n"),
            Some("http://a.example/x")
        );
        assert_eq!(first_url("\n \n"), None);
    }

    #[test]
    fn test_resolve_publish_url() {
        assert!(resolve_publish_url("http://localhost:8080/events").is_ok());
        assert!(resolve_publish_url("https://example.com/hook").is_ok());
        assert!(matches!(
            resolve_publish_url("ftp://example.com/x"),
            Err(MonitorError::InvalidConfig(_))
        ));
        assert!(matches!(
            resolve_publish_url("/relative/path"),
            Err(MonitorError::InvalidConfig(_))
        ));
        assert!(resolve_publish_url("").is_err());
    }

    #[test]
    fn test_load_full_config_dir() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let watched = dir.path().join("watched");
        fs::create_dir(&watched).unwrap();

        fs::write(dir.path().join(WATCH_LIST_FILE), watched.to_string_lossy().as_bytes()).unwrap();
        fs::write(dir.path().join(URL_LIST_FILE), "\nhttp://localhost:9000/events\n").unwrap();
        fs::write(
            dir.path().join(SETTINGS_FILE),
            r#"{"strategy": "polling", "bufferSize": 16}"#,
        )
        .unwrap();

        let loaded = load(&ConfigPaths::new(dir.path()), &Overrides::default());

        assert_eq!(loaded.options.strategy(), WatchStrategy::Polling);
        assert_eq!(
            loaded.config.publish_url.as_ref().map(|u| u.as_str()),
            Some("http://localhost:9000/events")
        );
        match &loaded.config.targets {
            TargetSource::Explicit(targets) => {
                assert_eq!(targets.len(), 1);
                assert_eq!(targets[0].path(), watched.as_path());
                assert_eq!(targets[0].buffer_size(), 16);
            }
            other => panic!("unexpected source {other:?}"),
        }
    }

    #[test]
    fn test_load_falls_back_to_settings_url() {
        let dir = tempfile::tempdir().expect("create temp dir");
        fs::write(dir.path().join(URL_LIST_FILE), "\n\n").unwrap();
        fs::write(
            dir.path().join(SETTINGS_FILE),
            r#"{"url": "https://fallback.example/events"}"#,
        )
        .unwrap();

        let loaded = load(&ConfigPaths::new(dir.path()), &Overrides::default());
        assert_eq!(
            loaded.config.publish_url.map(|u| u.to_string()),
            Some("https://fallback.example/events".to_string())
        );
    }

    #[test]
    fn test_load_degrades_on_bad_url_and_missing_watch_list() {
        let dir = tempfile::tempdir().expect("create temp dir");
        fs::write(dir.path().join(URL_LIST_FILE), "not a url").unwrap();

        let loaded = load(&ConfigPaths::new(dir.path()), &Overrides::default());
        assert!(loaded.config.publish_url.is_none());
        assert_eq!(loaded.config.targets, TargetSource::Explicit(Vec::new()));
    }

    #[test]
    fn test_all_drives_override() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let loaded = load(
            &ConfigPaths::new(dir.path()),
            &Overrides { monitor_all_drives: true },
        );
        assert_eq!(loaded.config.targets, TargetSource::AllVolumes);
    }

    #[test]
    fn test_invalid_settings_file_is_reported() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join(SETTINGS_FILE);
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(load_settings(&path), Err(MonitorError::InvalidConfig(_))));
    }
}
