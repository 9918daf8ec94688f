//! 已挂载卷枚举（MonitorAllDrives 模式）

use std::path::PathBuf;
use sysinfo::Disks;

/// 列出所有已挂载卷的根目录
///
/// 嵌套在其他挂载点之下的挂载点会被去掉，递归监控父挂载点时它们已被覆盖。
pub fn mounted_volumes() -> Vec<PathBuf> {
    let disks = Disks::new_with_refreshed_list();
    let roots = disks
        .list()
        .iter()
        .map(|disk| disk.mount_point().to_path_buf())
        .collect();
    collapse_nested(roots)
}

/// 去重并移除被其他根目录包含的路径
pub(crate) fn collapse_nested(mut roots: Vec<PathBuf>) -> Vec<PathBuf> {
    roots.sort();
    roots.dedup();

    let mut kept: Vec<PathBuf> = Vec::new();
    for root in roots {
        if !kept.iter().any(|parent| root.starts_with(parent)) {
            kept.push(root);
        }
    }
    kept
}
