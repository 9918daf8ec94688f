//! 系统服务集成

pub mod launchd;

pub use launchd::{LaunchdService, ServiceStatus};
