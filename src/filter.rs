//! 事件过滤 - 决定一个变更是否需要发布

use crate::event::{ChangeEvent, ChangeKind};
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// 过滤所需的文件属性
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileAttributes {
    pub is_dir: bool,
    pub is_temporary: bool,
}

/// 文件属性读取接口（测试时替换为内存实现）
pub trait AttributeProbe: Send + Sync {
    /// 读取属性；路径不存在或不可访问时返回 None
    fn probe(&self, path: &Path) -> Option<FileAttributes>;
}

/// 从文件系统读取属性
#[derive(Debug, Default, Clone, Copy)]
pub struct FsProbe;

impl AttributeProbe for FsProbe {
    fn probe(&self, path: &Path) -> Option<FileAttributes> {
        let meta = std::fs::metadata(path).ok()?;
        Some(FileAttributes {
            is_dir: meta.is_dir(),
            is_temporary: has_temporary_attribute(&meta) || is_scratch_name(path),
        })
    }
}

#[cfg(windows)]
fn has_temporary_attribute(meta: &Metadata) -> bool {
    use std::os::windows::fs::MetadataExt;
    const FILE_ATTRIBUTE_TEMPORARY: u32 = 0x100;
    meta.file_attributes() & FILE_ATTRIBUTE_TEMPORARY != 0
}

#[cfg(not(windows))]
fn has_temporary_attribute(_meta: &Metadata) -> bool {
    false
}

/// 编辑器中间文件的命名约定
const SCRATCH_EXTENSIONS: &[&str] = &["tmp", "swp", "swx", "swo"];

/// 是否是编辑器产生的临时文件名（vim swap、emacs autosave、Office lock 等）
pub fn is_scratch_name(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };

    if name.ends_with('~') || name.starts_with(".~lock.") || name.starts_with("~$") {
        return true;
    }
    if name.len() > 2 && name.starts_with('#') && name.ends_with('#') {
        return true;
    }

    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| SCRATCH_EXTENSIONS.iter().any(|s| ext.eq_ignore_ascii_case(s)))
}

/// 事件过滤器
pub struct EventFilter {
    /// 控制文件（watch list）路径，它的变更永远不发布
    control_file: PathBuf,
    probe: Arc<dyn AttributeProbe>,
}

impl EventFilter {
    pub fn new(control_file: impl Into<PathBuf>) -> Self {
        Self::with_probe(control_file, Arc::new(FsProbe))
    }

    pub fn with_probe(control_file: impl Into<PathBuf>, probe: Arc<dyn AttributeProbe>) -> Self {
        Self {
            control_file: control_file.into(),
            probe,
        }
    }

    pub fn control_file(&self) -> &Path {
        &self.control_file
    }

    pub fn should_publish(&self, event: &ChangeEvent) -> bool {
        if event.path() == self.control_file {
            return false;
        }

        match event.kind() {
            ChangeKind::Updated => match self.probe.probe(event.path()) {
                Some(attrs) => !attrs.is_dir && !attrs.is_temporary,
                None => false,
            },
            ChangeKind::Renamed => match self.probe.probe(event.path()) {
                Some(attrs) => !attrs.is_temporary,
                None => false,
            },
            ChangeKind::Created | ChangeKind::Deleted => true,
        }
    }
}

impl std::fmt::Debug for EventFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventFilter")
            .field("control_file", &self.control_file)
            .finish_non_exhaustive()
    }
}
