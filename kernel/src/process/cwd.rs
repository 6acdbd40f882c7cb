//! `chdir()`/`getcwd()`: per-task working directory, stored on
//! [`crate::sched::Task`] itself rather than in a side table, since this
//! kernel has one cwd slot per task and no thread group to share it
//! across.

use alloc::string::String;
use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult};
use crate::fs;
use crate::fs::NodeKind;

/// Resolves `path` against `base` (the task's current cwd) into an
/// absolute, lexically-normalized path: `.` components drop, `..`
/// components pop the preceding segment, and the result always starts
/// with `/`. Does not consult the filesystem - symlinks are resolved by
/// whoever eventually opens the path, not here.
pub fn resolve(base: &str, path: &str) -> String {
    let mut segments: Vec<&str> = if path.starts_with('/') { Vec::new() } else { base.split('/').filter(|s| !s.is_empty()).collect() };

    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }

    let mut out = String::from("/");
    out.push_str(&segments.join("/"));
    if out.len() > 1 && out.ends_with('/') {
        out.pop();
    }
    out
}

/// Changes the calling task's working directory to `path`, after
/// confirming it names a directory.
pub fn chdir(path: &str) -> KernelResult<()> {
    let current = crate::sched::current_task().ok_or(KernelError::NotInitialized { subsystem: "sched" })?;
    let target = resolve(&current.cwd(), path);
    let meta = fs::stat(&target)?;
    if meta.kind != NodeKind::Directory {
        return Err(KernelError::InvalidArgument { name: "path", value: "not a directory" });
    }
    current.set_cwd(target);
    Ok(())
}

/// Returns the calling task's current working directory.
pub fn getcwd() -> KernelResult<String> {
    let current = crate::sched::current_task().ok_or(KernelError::NotInitialized { subsystem: "sched" })?;
    Ok(current.cwd())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn an_absolute_path_ignores_the_base() {
        assert_eq!(resolve("/home/user", "/etc"), "/etc");
    }

    #[test_case]
    fn a_relative_path_appends_to_the_base() {
        assert_eq!(resolve("/home/user", "docs"), "/home/user/docs");
    }

    #[test_case]
    fn dot_components_are_dropped() {
        assert_eq!(resolve("/home/user", "./docs/./reports"), "/home/user/docs/reports");
    }

    #[test_case]
    fn dot_dot_pops_the_preceding_segment() {
        assert_eq!(resolve("/home/user", "../other"), "/home/other");
    }

    #[test_case]
    fn dot_dot_past_the_root_stays_at_the_root() {
        assert_eq!(resolve("/", "../../etc"), "/etc");
    }

    #[test_case]
    fn a_trailing_slash_is_stripped() {
        assert_eq!(resolve("/home/user", "docs/"), "/home/user/docs");
    }

    #[test_case]
    fn the_root_itself_resolves_without_a_trailing_slash() {
        assert_eq!(resolve("/", "."), "/");
    }
}
