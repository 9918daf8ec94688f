//! 集成测试共用的 HTTP 捕获服务器

#![allow(dead_code)]

use reqwest::Url;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// 记录每个请求的 JSON body，并以可配置状态码应答
pub struct CaptureServer {
    url: Url,
    bodies: Arc<Mutex<Vec<Value>>>,
    status: Arc<AtomicU16>,
}

impl CaptureServer {
    pub async fn start(status: u16) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind capture server");
        let addr = listener.local_addr().expect("local addr");
        let bodies = Arc::new(Mutex::new(Vec::new()));
        let status = Arc::new(AtomicU16::new(status));

        {
            let bodies = Arc::clone(&bodies);
            let status = Arc::clone(&status);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let bodies = Arc::clone(&bodies);
                    let status = Arc::clone(&status);
                    tokio::spawn(async move {
                        let _ = handle(stream, bodies, status).await;
                    });
                }
            });
        }

        Self {
            url: Url::parse(&format!("http://{addr}/events")).expect("valid url"),
            bodies,
            status,
        }
    }

    pub fn url(&self) -> Url {
        self.url.clone()
    }

    pub fn set_status(&self, status: u16) {
        self.status.store(status, Ordering::SeqCst);
    }

    pub fn bodies(&self) -> Vec<Value> {
        self.bodies.lock().unwrap().clone()
    }

    /// 等到满足条件的 body 出现，超时返回 None
    pub async fn wait_for<F>(&self, timeout: Duration, pred: F) -> Option<Value>
    where
        F: Fn(&Value) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(found) = self.bodies().into_iter().find(|b| pred(b)) {
                return Some(found);
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

async fn handle(
    mut stream: TcpStream,
    bodies: Arc<Mutex<Vec<Value>>>,
    status: Arc<AtomicU16>,
) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let headers = String::from_utf8_lossy(&buf[..header_end]).to_ascii_lowercase();
    let content_length = headers
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);

    while buf.len() < header_end + content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let body = &buf[header_end..(header_end + content_length).min(buf.len())];
    if let Ok(value) = serde_json::from_slice::<Value>(body) {
        bodies.lock().unwrap().push(value);
    }

    let code = status.load(Ordering::SeqCst);
    let response = format!(
        "HTTP/1.1 {code} Test\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// 规范化的临时目录（macOS 上 /var 是 /private/var 的链接，FSEvents 上报规范路径）
pub fn canonical_tempdir() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().canonicalize().expect("canonicalize temp dir");
    (dir, path)
}

/// 轮询直到条件成立
pub async fn eventually<F>(timeout: Duration, mut pred: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    pred()
}

pub fn file_is(body: &Value, path: &Path) -> bool {
    body["file"].as_str() == Some(path.to_string_lossy().as_ref())
}
