//! 变更事件模型 - 把 notify 原始事件归一化为 Created / Updated / Deleted / Renamed

use crate::watcher::BackendKind;
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// 变更类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
    Renamed,
}

impl ChangeKind {
    /// 线路协议中的单字母类型码
    pub fn code(&self) -> &'static str {
        match self {
            ChangeKind::Created => "C",
            ChangeKind::Updated => "U",
            ChangeKind::Deleted => "D",
            ChangeKind::Renamed => "R",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChangeKind::Created => "Created",
            ChangeKind::Updated => "Updated",
            ChangeKind::Deleted => "Deleted",
            ChangeKind::Renamed => "Renamed",
        };
        f.write_str(name)
    }
}

/// 归一化后的文件变更
///
/// 字段私有，只能通过每种类型各自的构造函数创建，
/// 因此 `old_path` 有值当且仅当类型为 `Renamed`。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    path: PathBuf,
    kind: ChangeKind,
    old_path: Option<PathBuf>,
}

impl ChangeEvent {
    pub fn created(path: impl Into<PathBuf>) -> Self {
        Self::plain(path.into(), ChangeKind::Created)
    }

    pub fn updated(path: impl Into<PathBuf>) -> Self {
        Self::plain(path.into(), ChangeKind::Updated)
    }

    pub fn deleted(path: impl Into<PathBuf>) -> Self {
        Self::plain(path.into(), ChangeKind::Deleted)
    }

    /// 重命名：`path` 为新路径
    pub fn renamed(old_path: impl Into<PathBuf>, new_path: impl Into<PathBuf>) -> Self {
        Self {
            path: new_path.into(),
            kind: ChangeKind::Renamed,
            old_path: Some(old_path.into()),
        }
    }

    fn plain(path: PathBuf, kind: ChangeKind) -> Self {
        Self {
            path,
            kind,
            old_path: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> ChangeKind {
        self.kind
    }

    pub fn old_path(&self) -> Option<&Path> {
        self.old_path.as_deref()
    }
}

/// inotify / Windows 的 rename 前半段等待另一半的时间；
/// FSEvents 的两个 `Name(Any)` 也在这个窗口内配对
pub const RENAME_PAIR_WINDOW: Duration = Duration::from_millis(200);

/// 轮询后端同一轮扫描中 Create 与 Remove 配对为 rename 的时间
pub const POLL_PAIR_WINDOW: Duration = Duration::from_secs(1);

/// 等待配对的 rename 前半段
#[derive(Debug)]
enum PendingRename {
    /// 收到 `From`，等待 `To` / `Both`
    From {
        from: PathBuf,
        tracker: Option<usize>,
        deadline: Instant,
    },
    /// `From` + `To` 已配对（inotify），等待随后的 `Both`
    Paired {
        from: PathBuf,
        to: PathBuf,
        tracker: Option<usize>,
        deadline: Instant,
    },
}

impl PendingRename {
    fn tracker(&self) -> Option<usize> {
        match self {
            PendingRename::From { tracker, .. } | PendingRename::Paired { tracker, .. } => *tracker,
        }
    }

    fn from(&self) -> &Path {
        match self {
            PendingRename::From { from, .. } | PendingRename::Paired { from, .. } => from,
        }
    }

    fn deadline(&self) -> Instant {
        match self {
            PendingRename::From { deadline, .. } | PendingRename::Paired { deadline, .. } => *deadline,
        }
    }

    /// 等不到另一半时的结果：只有 `From` 表示移出了监控范围
    fn into_change(self) -> ChangeEvent {
        match self {
            PendingRename::From { from, .. } => ChangeEvent::deleted(from),
            PendingRename::Paired { from, to, .. } => ChangeEvent::renamed(from, to),
        }
    }
}

/// 只知道一半的路径变化：FSEvents 的 `Name(Any)` 或轮询后端的 Create / Remove
#[derive(Debug)]
struct Half {
    path: PathBuf,
    /// true 表示路径新出现，false 表示路径消失
    appeared: bool,
    deadline: Instant,
}

impl Half {
    fn into_change(self) -> ChangeEvent {
        if self.appeared {
            ChangeEvent::created(self.path)
        } else {
            ChangeEvent::deleted(self.path)
        }
    }
}

/// 单个 handle 的待配对状态
#[derive(Debug, Default)]
struct SourceState {
    rename: Option<PendingRename>,
    halves: Vec<Half>,
}

impl SourceState {
    fn is_empty(&self) -> bool {
        self.rename.is_none() && self.halves.is_empty()
    }

    fn drain_into(self, out: &mut Vec<ChangeEvent>) {
        out.extend(self.rename.map(PendingRename::into_change));
        out.extend(self.halves.into_iter().map(Half::into_change));
    }
}

/// 两个路径能否是同一次轮询 rename 的两端：同目录改名，或同名移动
fn same_location(a: &Path, b: &Path) -> bool {
    a.parent() == b.parent() || a.file_name() == b.file_name()
}

fn any_location(_a: &Path, _b: &Path) -> bool {
    true
}

/// notify 事件分类器
///
/// 不同后端上报 rename 的方式不同：
/// - inotify: `From` + `To` + `Both`（带相同 tracker）；移出监控范围时只有 `From`
/// - Windows: `From` + `To`（无 tracker）
/// - FSEvents: 每个路径一个 `Name(Any)`
/// - 轮询: 一轮扫描中新路径的 Create 和旧路径的 Remove
///
/// 分类器按来源（watch handle）暂存只有一半的变化，在配对窗口内配对成功输出 `Renamed`。
/// 过期未配对的半截变化由 [`Classifier::expire`] 输出：
/// 消失的路径为 `Deleted`，新出现的路径为 `Created`。
#[derive(Debug, Default)]
pub struct Classifier {
    sources: HashMap<u64, SourceState>,
}

impl Classifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// 分类一个原始事件
    ///
    /// `source` 为产生该事件的 handle 标识，`now` 为收到事件的时间。
    pub fn classify(
        &mut self,
        source: u64,
        backend: BackendKind,
        event: &Event,
        now: Instant,
    ) -> Vec<ChangeEvent> {
        let mut out = self.expire(now);

        match event.kind {
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                self.flush_rename(source, &mut out);
                if let Some(from) = event.paths.first() {
                    self.state(source).rename = Some(PendingRename::From {
                        from: from.clone(),
                        tracker: event.attrs.tracker(),
                        deadline: now + RENAME_PAIR_WINDOW,
                    });
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                let Some(to) = event.paths.first() else {
                    return out;
                };
                match self.take_rename(source) {
                    Some(PendingRename::From { from, tracker, .. })
                        if tracker == event.attrs.tracker() =>
                    {
                        if tracker.is_some() {
                            // inotify 紧接着会发 Both，由 Both 输出
                            self.state(source).rename = Some(PendingRename::Paired {
                                from,
                                to: to.clone(),
                                tracker,
                                deadline: now + RENAME_PAIR_WINDOW,
                            });
                        } else {
                            out.push(ChangeEvent::renamed(from, to.clone()));
                        }
                    }
                    stale => {
                        out.extend(stale.map(PendingRename::into_change));
                        out.push(ChangeEvent::created(to.clone()));
                    }
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                if let Some(pending) = self.take_rename(source) {
                    let same = (pending.tracker().is_some()
                        && pending.tracker() == event.attrs.tracker())
                        || event.paths.first().map(PathBuf::as_path) == Some(pending.from());
                    if !same {
                        out.push(pending.into_change());
                    }
                }
                if let [from, to, ..] = event.paths.as_slice() {
                    out.push(ChangeEvent::renamed(from.clone(), to.clone()));
                }
            }
            EventKind::Modify(ModifyKind::Name(_)) => {
                self.flush_rename(source, &mut out);
                for path in &event.paths {
                    let half = Half {
                        path: path.clone(),
                        appeared: path.exists(),
                        deadline: now + RENAME_PAIR_WINDOW,
                    };
                    out.extend(self.pair_or_park(source, half, any_location));
                }
            }
            EventKind::Create(_) | EventKind::Remove(_) if backend == BackendKind::Polling => {
                let appeared = matches!(event.kind, EventKind::Create(_));
                for path in &event.paths {
                    let half = Half {
                        path: path.clone(),
                        appeared,
                        deadline: now + POLL_PAIR_WINDOW,
                    };
                    out.extend(self.pair_or_park(source, half, same_location));
                }
            }
            EventKind::Create(_) => {
                self.flush_rename(source, &mut out);
                out.extend(event.paths.iter().cloned().map(ChangeEvent::created));
            }
            EventKind::Remove(_) => {
                self.flush_rename(source, &mut out);
                out.extend(event.paths.iter().cloned().map(ChangeEvent::deleted));
            }
            EventKind::Modify(_) => {
                self.flush_rename(source, &mut out);
                out.extend(event.paths.iter().cloned().map(ChangeEvent::updated));
            }
            // Access / Any / Other 不发布
            _ => {}
        }

        self.sources.retain(|_, state| !state.is_empty());
        out
    }

    /// 输出所有在 `now` 之前过期的待配对变化
    pub fn expire(&mut self, now: Instant) -> Vec<ChangeEvent> {
        let mut out = Vec::new();
        for state in self.sources.values_mut() {
            if state.rename.as_ref().is_some_and(|r| r.deadline() <= now) {
                out.extend(state.rename.take().map(PendingRename::into_change));
            }
            let (expired, kept): (Vec<Half>, Vec<Half>) =
                state.halves.drain(..).partition(|h| h.deadline <= now);
            state.halves = kept;
            out.extend(expired.into_iter().map(Half::into_change));
        }
        self.sources.retain(|_, state| !state.is_empty());
        out
    }

    /// 最早的过期时间；没有待配对变化时为 None
    pub fn next_deadline(&self) -> Option<Instant> {
        self.sources
            .values()
            .flat_map(|state| {
                state
                    .rename
                    .iter()
                    .map(PendingRename::deadline)
                    .chain(state.halves.iter().map(|h| h.deadline))
            })
            .min()
    }

    /// 输出所有待配对变化（通道关闭时调用）
    pub fn flush(&mut self) -> Vec<ChangeEvent> {
        let mut out = Vec::new();
        for (_, state) in self.sources.drain() {
            state.drain_into(&mut out);
        }
        out
    }

    /// handle 被释放：输出它的待配对变化
    pub fn forget(&mut self, source: u64) -> Vec<ChangeEvent> {
        let mut out = Vec::new();
        if let Some(state) = self.sources.remove(&source) {
            state.drain_into(&mut out);
        }
        out
    }

    fn state(&mut self, source: u64) -> &mut SourceState {
        self.sources.entry(source).or_default()
    }

    fn take_rename(&mut self, source: u64) -> Option<PendingRename> {
        self.sources.get_mut(&source).and_then(|state| state.rename.take())
    }

    fn flush_rename(&mut self, source: u64, out: &mut Vec<ChangeEvent>) {
        out.extend(self.take_rename(source).map(PendingRename::into_change));
    }

    /// 与同一来源中相反方向的半截变化配对，找不到时暂存
    fn pair_or_park(
        &mut self,
        source: u64,
        half: Half,
        compatible: fn(&Path, &Path) -> bool,
    ) -> Option<ChangeEvent> {
        let state = self.state(source);
        let partner = state.halves.iter().position(|other| {
            other.appeared != half.appeared
                && other.path != half.path
                && compatible(&other.path, &half.path)
        });

        match partner {
            Some(index) => {
                let other = state.halves.remove(index);
                let (old, new) = if half.appeared {
                    (other.path, half.path)
                } else {
                    (half.path, other.path)
                };
                Some(ChangeEvent::renamed(old, new))
            }
            None => {
                state.halves.push(half);
                None
            }
        }
    }
}
