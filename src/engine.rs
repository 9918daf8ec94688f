//! 监控引擎 - 组合 registry、控制文件 watcher、过滤与发布
//!
//! 状态机：
//! ```text
//! Stopped --start--> Running --stop--> Stopped
//! Running --reconfigure--> Running
//! Stopped | Running --dispose--> Disposed（终态）
//! ```
//!
//! 事件流：notify 回调 -> 无界通道 -> dispatcher 任务（分类）
//! -> 每个事件一个独立任务（过滤 + 发布）。

use crate::config::{
    mounted_volumes, parse_watch_list, EngineConfig, TargetSource, WatchTarget,
    DEFAULT_BUFFER_SIZE,
};
use crate::error::MonitorError;
use crate::event::{ChangeEvent, Classifier};
use crate::filter::EventFilter;
use crate::publisher::{EventPublisher, DEFAULT_REQUEST_TIMEOUT};
use crate::watcher::{
    ConfigWatcher, Notification, NotificationReceiver, WatchStrategy, WatcherRegistry,
};
use reqwest::Url;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, trace, warn};

/// 引擎运行参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    control_file: PathBuf,
    strategy: WatchStrategy,
    poll_interval: Duration,
    recursive: bool,
    buffer_size: usize,
    request_timeout: Duration,
    dispose_grace: Duration,
}

impl EngineOptions {
    /// 默认参数；`control_file` 转为绝对路径
    pub fn new(control_file: impl Into<PathBuf>) -> Self {
        let control_file = control_file.into();
        let control_file = std::path::absolute(&control_file).unwrap_or(control_file);
        Self {
            control_file,
            strategy: WatchStrategy::Auto,
            poll_interval: Duration::from_secs(2),
            recursive: true,
            buffer_size: DEFAULT_BUFFER_SIZE,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            dispose_grace: Duration::from_secs(10),
        }
    }

    /// 后端选择，默认 Auto
    pub fn with_strategy(mut self, strategy: WatchStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// 轮询后端的扫描间隔
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// 新目标是否包含子目录
    pub fn with_recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    /// 每个 handle 未处理通知的上限
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// 单次 HTTP 发布的超时
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// dispose 等待进行中发布任务的最长时间
    pub fn with_dispose_grace(mut self, grace: Duration) -> Self {
        self.dispose_grace = grace;
        self
    }

    /// watch list 控制文件的绝对路径
    pub fn control_file(&self) -> &Path {
        &self.control_file
    }

    /// 配置的后端选择（Auto 时实际后端见各 handle）
    pub fn strategy(&self) -> WatchStrategy {
        self.strategy
    }

    /// 轮询扫描间隔
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// 按当前参数为一个路径创建 WatchTarget
    pub fn target(&self, path: impl Into<PathBuf>) -> WatchTarget {
        WatchTarget::new(path)
            .with_recursive(self.recursive)
            .with_buffer_size(self.buffer_size)
    }

    /// 解析 watch list 内容，相对路径基于控制文件所在目录
    pub fn targets_from_list(&self, contents: &str) -> Vec<WatchTarget> {
        let base = self.control_file.parent().unwrap_or_else(|| Path::new("."));
        parse_watch_list(contents, base)
            .into_iter()
            .map(|path| self.target(path))
            .collect()
    }
}

/// 引擎状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Stopped,
    Running,
    Disposed,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Stopped => "stopped",
            EngineState::Running => "running",
            EngineState::Disposed => "disposed",
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Inner {
    state: EngineState,
    config: EngineConfig,
    registry: WatcherRegistry,
}

/// 引擎与控制文件回调共享的状态
struct Shared {
    options: EngineOptions,
    inner: Mutex<Inner>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn reconfigure(&self, contents: &str) -> Result<usize, MonitorError> {
        let mut inner = self.lock();
        if inner.state == EngineState::Disposed {
            return Err(MonitorError::Disposed);
        }

        info!("Disposing existing watchers");
        inner.registry.set_enabled(false);
        let released = inner.registry.remove_all();

        let targets = match &inner.config.targets {
            TargetSource::AllVolumes => self.volume_targets(),
            TargetSource::Explicit(_) => {
                let targets = self.options.targets_from_list(contents);
                inner.config.targets = TargetSource::Explicit(targets.clone());
                targets
            }
        };

        register_all(&mut inner.registry, &targets)?;

        if inner.state == EngineState::Running {
            inner.registry.set_enabled(true);
        }
        info!(
            released,
            watching = targets.len(),
            state = %inner.state,
            "Watchers rebuilt"
        );
        Ok(targets.len())
    }

    fn volume_targets(&self) -> Vec<WatchTarget> {
        mounted_volumes()
            .into_iter()
            .map(|root| self.options.target(root))
            .collect()
    }

    fn initial_targets(&self, source: &TargetSource) -> Vec<WatchTarget> {
        match source {
            TargetSource::Explicit(targets) => targets.clone(),
            TargetSource::AllVolumes => self.volume_targets(),
        }
    }
}

/// 全部注册成功，或者一个都不保留
fn register_all(registry: &mut WatcherRegistry, targets: &[WatchTarget]) -> Result<(), MonitorError> {
    for target in targets {
        if let Err(e) = registry.add_watch(target.clone()) {
            error!(error = %e, "Failed to monitor location, releasing partial watcher set");
            registry.remove_all();
            return Err(e);
        }
    }
    Ok(())
}

/// 单个事件的处理管道：过滤 -> 发布
struct Pipeline {
    filter: EventFilter,
    publisher: EventPublisher,
}

impl Pipeline {
    async fn process(self: Arc<Self>, event: ChangeEvent) {
        // 过滤需要读取文件属性，放到阻塞线程池
        let pipeline = Arc::clone(&self);
        let filtered = tokio::task::spawn_blocking(move || {
            let publish = pipeline.filter.should_publish(&event);
            (publish, event)
        })
        .await;

        let event = match filtered {
            Ok((true, event)) => event,
            Ok((false, event)) => {
                trace!(file = %event.path().display(), change = %event.kind(), "Event filtered");
                return;
            }
            Err(e) => {
                error!(error = %e, "Event filter task failed");
                return;
            }
        };

        info!(
            file = %event.path().display(),
            change = %event.kind(),
            old_file = ?event.old_path(),
            "File monitor event"
        );
        // 失败已在 publisher 内记录，这里不再传播
        let _ = self.publisher.publish(&event).await;
    }
}

fn spawn_all(in_flight: &mut JoinSet<()>, pipeline: &Arc<Pipeline>, changes: Vec<ChangeEvent>) {
    for change in changes {
        in_flight.spawn(Arc::clone(pipeline).process(change));
    }
}

async fn run_dispatcher(mut rx: NotificationReceiver, pipeline: Arc<Pipeline>) {
    let mut classifier = Classifier::new();
    let mut in_flight = JoinSet::new();

    loop {
        // 有待配对的 rename 半截时，到期后按 Created / Deleted 输出
        let deadline = classifier.next_deadline();
        let wake = tokio::time::Instant::from_std(deadline.unwrap_or_else(Instant::now));

        tokio::select! {
            notification = rx.recv() => {
                let Some(notification) = notification else { break };
                let changes = match notification {
                    Notification::Event { source, backend, event, buffer } => {
                        buffer.release();
                        classifier.classify(source, backend, &event, Instant::now())
                    }
                    Notification::Released(source) => classifier.forget(source),
                };
                spawn_all(&mut in_flight, &pipeline, changes);
            }
            _ = tokio::time::sleep_until(wake), if deadline.is_some() => {
                spawn_all(&mut in_flight, &pipeline, classifier.expire(Instant::now()));
            }
            Some(result) = in_flight.join_next(), if !in_flight.is_empty() => {
                log_task_result(result);
            }
        }
    }

    spawn_all(&mut in_flight, &pipeline, classifier.flush());

    debug!(in_flight = in_flight.len(), "Notification channel closed, draining publish tasks");
    while let Some(result) = in_flight.join_next().await {
        log_task_result(result);
    }
}

fn log_task_result(result: Result<(), JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            error!(error = %e, "Publish task panicked");
        }
    }
}

/// 文件变更监控引擎
///
/// 必须在 tokio runtime 中创建（构造时会 spawn dispatcher 任务）。
pub struct MonitorEngine {
    shared: Arc<Shared>,
    config_watcher: Option<ConfigWatcher>,
    dispatcher: Option<JoinHandle<()>>,
    publish_url: Option<Url>,
}

impl MonitorEngine {
    pub fn new(options: EngineOptions, config: EngineConfig) -> Self {
        let publisher = match EventPublisher::new(config.publish_url.clone(), options.request_timeout) {
            Ok(publisher) => publisher,
            Err(e) => {
                error!(error = %e, "Failed to create http client, publishing disabled");
                EventPublisher::disabled()
            }
        };
        if !publisher.is_enabled() {
            warn!("No valid publish url, file events will be logged but not published");
        }
        let publish_url = publisher.url().cloned();

        let pipeline = Arc::new(Pipeline {
            filter: EventFilter::new(options.control_file.clone()),
            publisher,
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = tokio::spawn(run_dispatcher(rx, pipeline));
        let registry = WatcherRegistry::new(tx, options.strategy, options.poll_interval);

        Self {
            shared: Arc::new(Shared {
                options,
                inner: Mutex::new(Inner {
                    state: EngineState::Stopped,
                    config,
                    registry,
                }),
            }),
            config_watcher: None,
            dispatcher: Some(dispatcher),
            publish_url,
        }
    }

    /// Stopped -> Running
    ///
    /// 首次启动时构建监控集合并挂载控制文件 watcher；
    /// stop 之后再次 start 只重新启用已有的 handle。
    pub fn start(&mut self) -> Result<(), MonitorError> {
        {
            let mut inner = self.shared.lock();
            match inner.state {
                EngineState::Disposed => return Err(MonitorError::Disposed),
                EngineState::Running => {
                    return Err(MonitorError::InvalidState {
                        from: EngineState::Running.as_str(),
                        op: "start",
                    })
                }
                EngineState::Stopped => {}
            }

            if inner.registry.is_empty() {
                let targets = self.shared.initial_targets(&inner.config.targets);
                register_all(&mut inner.registry, &targets)?;
            }
        }

        if self.config_watcher.is_none() {
            // 控制文件所在目录不可监控时照常运行，下一次 start 再尝试
            match self.attach_config_watcher() {
                Ok(watcher) => self.config_watcher = Some(watcher),
                Err(e) => error!(
                    error = %e,
                    control_file = %self.shared.options.control_file.display(),
                    "Control file cannot be watched, watch list changes will be ignored"
                ),
            }
        }

        let mut inner = self.shared.lock();
        inner.registry.set_enabled(true);
        inner.state = EngineState::Running;
        info!(watching = inner.registry.len(), "File monitor started");
        Ok(())
    }

    /// Running -> Stopped：停止投递，保留订阅
    pub fn stop(&mut self) -> Result<(), MonitorError> {
        let mut inner = self.shared.lock();
        match inner.state {
            EngineState::Disposed => Err(MonitorError::Disposed),
            EngineState::Stopped => Ok(()),
            EngineState::Running => {
                inner.registry.set_enabled(false);
                inner.state = EngineState::Stopped;
                info!("File monitor stopped");
                Ok(())
            }
        }
    }

    /// 以新的 watch list 内容重建监控集合
    ///
    /// 返回新的监控目标数。失败时集合为空，等待下一次控制文件修改。
    pub fn reconfigure(&self, contents: &str) -> Result<usize, MonitorError> {
        self.shared.reconfigure(contents)
    }

    /// 释放全部资源，终态
    ///
    /// 等待进行中的发布任务最多 `dispose_grace`，超时后中止剩余任务。
    pub async fn dispose(&mut self) {
        // 先于加锁释放：某些后端 drop 时会等待回调线程退出，而回调可能正在等这把锁
        drop(self.config_watcher.take());

        {
            let mut inner = self.shared.lock();
            if inner.state == EngineState::Disposed {
                return;
            }
            inner.registry.set_enabled(false);
            inner.registry.close();
            inner.state = EngineState::Disposed;
        }

        let Some(dispatcher) = self.dispatcher.take() else {
            return;
        };
        let abort = dispatcher.abort_handle();
        match tokio::time::timeout(self.shared.options.dispose_grace, dispatcher).await {
            Ok(Ok(())) => info!("File monitor disposed"),
            Ok(Err(e)) => error!(error = %e, "Dispatcher task failed"),
            Err(_) => {
                warn!("In-flight publishes did not finish in time, aborting");
                abort.abort();
            }
        }
    }

    /// 当前生命周期状态
    pub fn state(&self) -> EngineState {
        self.shared.lock().state
    }

    /// 当前正在监控的路径
    pub fn watched_paths(&self) -> Vec<PathBuf> {
        self.shared
            .lock()
            .registry
            .targets()
            .map(|t| t.path().to_path_buf())
            .collect()
    }

    /// 实际使用的发布地址；None 表示只记录日志
    pub fn publish_url(&self) -> Option<&Url> {
        self.publish_url.as_ref()
    }

    /// 构造时的运行参数
    pub fn options(&self) -> &EngineOptions {
        &self.shared.options
    }

    fn attach_config_watcher(&self) -> Result<ConfigWatcher, MonitorError> {
        let shared = Arc::clone(&self.shared);
        let options = &self.shared.options;
        ConfigWatcher::attach(
            options.control_file.clone(),
            options.strategy,
            options.poll_interval,
            move |contents| {
                if let Err(e) = shared.reconfigure(&contents) {
                    error!(error = %e, "Reconfiguration failed");
                }
            },
        )
    }
}

impl fmt::Debug for MonitorEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitorEngine")
            .field("state", &self.state())
            .field("control_file", &self.shared.options.control_file)
            .field("publish_url", &self.publish_url)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(dir: &Path) -> EngineOptions {
        EngineOptions::new(dir.join("WatchDir.txt"))
            .with_strategy(WatchStrategy::Polling)
            .with_poll_interval(Duration::from_millis(50))
            .with_dispose_grace(Duration::from_secs(2))
    }

    #[test]
    fn test_targets_from_list_uses_options() {
        let opts = EngineOptions::new("/cfg/WatchDir.txt")
            .with_recursive(false)
            .with_buffer_size(8);
        let targets = opts.targets_from_list("/a; b");
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].path(), Path::new("/a"));
        assert_eq!(targets[1].path(), Path::new("/cfg/b"));
        assert!(targets.iter().all(|t| !t.recursive() && t.buffer_size() == 8));
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let cfg = tempfile::tempdir().expect("create temp dir");
        let data = tempfile::tempdir().expect("create temp dir");
        let opts = options(cfg.path());
        let config = EngineConfig::explicit(vec![opts.target(data.path())], None);

        let mut engine = MonitorEngine::new(opts, config);
        assert_eq!(engine.state(), EngineState::Stopped);

        engine.start().unwrap();
        assert_eq!(engine.state(), EngineState::Running);
        assert_eq!(engine.watched_paths(), vec![data.path().to_path_buf()]);
        assert!(matches!(engine.start(), Err(MonitorError::InvalidState { .. })));

        engine.stop().unwrap();
        assert_eq!(engine.state(), EngineState::Stopped);
        // stop 不释放订阅
        assert_eq!(engine.watched_paths().len(), 1);

        engine.start().unwrap();
        assert_eq!(engine.state(), EngineState::Running);

        engine.dispose().await;
        assert_eq!(engine.state(), EngineState::Disposed);
        assert!(engine.watched_paths().is_empty());
        assert!(matches!(engine.start(), Err(MonitorError::Disposed)));
        assert!(matches!(engine.stop(), Err(MonitorError::Disposed)));
        assert!(matches!(engine.reconfigure("/x"), Err(MonitorError::Disposed)));

        // 重复 dispose 无副作用
        engine.dispose().await;
    }

    #[tokio::test]
    async fn test_start_fails_for_missing_target() {
        let cfg = tempfile::tempdir().expect("create temp dir");
        let data = tempfile::tempdir().expect("create temp dir");
        let opts = options(cfg.path());
        let config = EngineConfig::explicit(
            vec![opts.target(data.path()), opts.target(data.path().join("missing"))],
            None,
        );

        let mut engine = MonitorEngine::new(opts, config);
        let err = engine.start().unwrap_err();
        assert!(matches!(err, MonitorError::WatchAttach { .. }));
        assert_eq!(engine.state(), EngineState::Stopped);
        // 不保留部分集合
        assert!(engine.watched_paths().is_empty());
        engine.dispose().await;
    }

    #[tokio::test]
    async fn test_start_without_control_file_directory() {
        let cfg = tempfile::tempdir().expect("create temp dir");
        let data = tempfile::tempdir().expect("create temp dir");
        let opts = options(&cfg.path().join("not-yet-created"));
        let config = EngineConfig::explicit(vec![opts.target(data.path())], None);

        let mut engine = MonitorEngine::new(opts, config);
        engine.start().unwrap();
        assert_eq!(engine.state(), EngineState::Running);
        assert_eq!(engine.watched_paths(), vec![data.path().to_path_buf()]);
        assert!(engine.config_watcher.is_none());

        // 目录出现后，重新 start 挂上控制文件 watcher
        std::fs::create_dir(cfg.path().join("not-yet-created")).unwrap();
        engine.stop().unwrap();
        engine.start().unwrap();
        assert!(engine.config_watcher.is_some());

        engine.dispose().await;
    }

    #[tokio::test]
    async fn test_reconfigure_replaces_watch_set() {
        let cfg = tempfile::tempdir().expect("create temp dir");
        let a = tempfile::tempdir().expect("create temp dir");
        let b = tempfile::tempdir().expect("create temp dir");
        let c = tempfile::tempdir().expect("create temp dir");
        let opts = options(cfg.path());
        let config = EngineConfig::explicit(vec![opts.target(c.path())], None);

        let mut engine = MonitorEngine::new(opts, config);
        engine.start().unwrap();

        let list = format!("{};{}", a.path().display(), b.path().display());
        assert_eq!(engine.reconfigure(&list).unwrap(), 2);

        let mut watched = engine.watched_paths();
        watched.sort();
        let mut expected = vec![a.path().to_path_buf(), b.path().to_path_buf()];
        expected.sort();
        assert_eq!(watched, expected);
        assert_eq!(engine.state(), EngineState::Running);

        engine.dispose().await;
    }

    #[tokio::test]
    async fn test_reconfigure_with_bad_path_leaves_empty_set() {
        let cfg = tempfile::tempdir().expect("create temp dir");
        let a = tempfile::tempdir().expect("create temp dir");
        let opts = options(cfg.path());
        let config = EngineConfig::explicit(vec![opts.target(a.path())], None);

        let mut engine = MonitorEngine::new(opts, config);
        engine.start().unwrap();

        let list = format!("{};{}", a.path().display(), a.path().join("missing").display());
        assert!(matches!(
            engine.reconfigure(&list),
            Err(MonitorError::WatchAttach { .. })
        ));
        assert!(engine.watched_paths().is_empty());
        assert_eq!(engine.state(), EngineState::Running);

        // 下一次正确的配置恢复监控
        assert_eq!(engine.reconfigure(&a.path().display().to_string()).unwrap(), 1);
        engine.dispose().await;
    }

    #[tokio::test]
    async fn test_reconfigure_while_stopped_keeps_delivery_disabled() {
        let cfg = tempfile::tempdir().expect("create temp dir");
        let a = tempfile::tempdir().expect("create temp dir");
        let opts = options(cfg.path());
        let config = EngineConfig::explicit(Vec::new(), None);

        let mut engine = MonitorEngine::new(opts, config);
        engine.start().unwrap();
        engine.stop().unwrap();

        engine.reconfigure(&a.path().display().to_string()).unwrap();
        {
            let inner = engine.shared.lock();
            assert_eq!(inner.registry.len(), 1);
            assert!(!inner.registry.handles()[0].is_enabled());
        }

        engine.start().unwrap();
        {
            let inner = engine.shared.lock();
            assert!(inner.registry.handles()[0].is_enabled());
        }
        engine.dispose().await;
    }
}
