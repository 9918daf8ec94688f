//! 配置层 - 监控目标、发布地址与运行参数

pub mod loader;
pub mod types;
pub mod volumes;

pub use loader::{
    describe_targets, first_url, load, load_settings, parse_watch_list, resolve_publish_url,
    ConfigPaths, LoadedConfig, Overrides, SETTINGS_FILE, URL_LIST_FILE, WATCH_LIST_FILE,
};
pub use types::{AppSettings, EngineConfig, TargetSource, WatchTarget, DEFAULT_BUFFER_SIZE};
pub use volumes::mounted_volumes;
