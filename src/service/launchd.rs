//! launchd service management for macOS

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::Command;

/// Service status information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
    pub installed: bool,
    pub running: bool,
    pub pid: Option<u32>,
}

/// launchd agent running `fcm daemon`
pub struct LaunchdService {
    plist_path: PathBuf,
    log_dir: PathBuf,
    binary: PathBuf,
    config_dir: Option<PathBuf>,
}

impl LaunchdService {
    pub const SERVICE_LABEL: &'static str = "com.fcm.monitor";
    const PLIST_NAME: &'static str = "com.fcm.monitor.plist";

    /// `config_dir` 会写入 ProgramArguments，传 None 使用默认目录
    pub fn new(config_dir: Option<PathBuf>) -> Result<Self> {
        let home = dirs::home_dir().context("Failed to get home directory")?;
        let binary = std::env::current_exe().context("Failed to get current executable path")?;
        Ok(Self {
            plist_path: home.join("Library/LaunchAgents").join(Self::PLIST_NAME),
            log_dir: home.join(".file-change-monitor/logs"),
            binary,
            config_dir,
        })
    }

    pub fn plist_path(&self) -> &Path {
        &self.plist_path
    }

    /// Generate plist content for launchd
    pub fn generate_plist(&self) -> String {
        let (stdout_log, stderr_log) = self.log_paths();

        let mut arguments = vec![self.binary.display().to_string()];
        if let Some(dir) = &self.config_dir {
            arguments.push("--config-dir".to_string());
            arguments.push(dir.display().to_string());
        }
        arguments.push("daemon".to_string());
        let arguments: String = arguments
            .iter()
            .map(|arg| format!("        <string>{}</string>\n", xml_escape(arg)))
            .collect();

        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>Label</key>
    <string>{label}</string>
    <key>ProgramArguments</key>
    <array>
{arguments}    </array>
    <key>RunAtLoad</key>
    <true/>
    <key>KeepAlive</key>
    <true/>
    <key>StandardOutPath</key>
    <string>{stdout}</string>
    <key>StandardErrorPath</key>
    <string>{stderr}</string>
</dict>
</plist>
"#,
            label = Self::SERVICE_LABEL,
            stdout = xml_escape(&stdout_log.display().to_string()),
            stderr = xml_escape(&stderr_log.display().to_string()),
        )
    }

    /// Install the launchd service
    pub fn install(&self) -> Result<()> {
        std::fs::create_dir_all(&self.log_dir).context("Failed to create log directory")?;

        if let Some(parent) = self.plist_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create LaunchAgents directory")?;
        }

        std::fs::write(&self.plist_path, self.generate_plist())
            .context("Failed to write plist file")?;

        // Load the service, cleanup on failure
        if let Err(e) = self.load() {
            let _ = std::fs::remove_file(&self.plist_path);
            return Err(e);
        }

        Ok(())
    }

    /// Uninstall the launchd service
    pub fn uninstall(&self) -> Result<()> {
        let _ = self.unload();

        // launchd operations are asynchronous
        std::thread::sleep(std::time::Duration::from_millis(500));

        if self.plist_path.exists() {
            std::fs::remove_file(&self.plist_path).context("Failed to remove plist file")?;
        }

        Ok(())
    }

    fn load(&self) -> Result<()> {
        let status = Command::new("launchctl")
            .args(["load", "-w"])
            .arg(&self.plist_path)
            .status()
            .context("Failed to execute launchctl load")?;

        if !status.success() {
            anyhow::bail!("launchctl load failed with status: {}", status);
        }
        Ok(())
    }

    fn unload(&self) -> Result<()> {
        let status = Command::new("launchctl")
            .args(["unload"])
            .arg(&self.plist_path)
            .status()
            .context("Failed to execute launchctl unload")?;

        if !status.success() {
            anyhow::bail!("launchctl unload failed with status: {}", status);
        }
        Ok(())
    }

    /// Get service status
    pub fn status(&self) -> Result<ServiceStatus> {
        if !self.plist_path.exists() {
            return Ok(ServiceStatus {
                installed: false,
                running: false,
                pid: None,
            });
        }

        let output = Command::new("launchctl")
            .args(["list", Self::SERVICE_LABEL])
            .output()
            .context("Failed to execute launchctl list")?;

        if !output.status.success() {
            return Ok(ServiceStatus {
                installed: true,
                running: false,
                pid: None,
            });
        }

        let pid = parse_launchctl_pid(&String::from_utf8_lossy(&output.stdout));
        Ok(ServiceStatus {
            installed: true,
            running: pid.is_some(),
            pid,
        })
    }

    pub fn log_paths(&self) -> (PathBuf, PathBuf) {
        (
            self.log_dir.join("monitor.stdout.log"),
            self.log_dir.join("monitor.stderr.log"),
        )
    }
}

/// Parse PID from `launchctl list <label>` output (format: `"PID" = 12345;`)
fn parse_launchctl_pid(output: &str) -> Option<u32> {
    output
        .lines()
        .find(|line| line.contains("\"PID\""))
        .and_then(|line| {
            line.split('=')
                .nth(1)
                .map(|s| s.trim().trim_end_matches(';').trim())
                .and_then(|s| s.parse::<u32>().ok())
        })
        .filter(|&pid| pid > 0)
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
