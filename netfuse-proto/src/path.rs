//! Join a client-supplied relative path onto a server's backing directory.
//!
//! Grounded in `path_join`/`path_join_real` from the original server: join
//! first, without normalizing anything, then try to canonicalize the
//! result. Canonicalization failing (path does not exist yet, e.g. for a
//! `create`/`mkdir` target) is not an error here — callers that need a
//! path to already exist get that from the underlying syscall instead.

use std::path::{Path, PathBuf};

/// Joins `relative` onto `root`, producing the same single-separator result
/// `path_join` does regardless of whether either side already carries a
/// leading or trailing `/`.
///
/// Rejects a `relative` component that would escape `root` via `..`, since
/// the wire protocol has no notion of a "current directory" to escape from
/// and a client should never be able to name paths outside the served tree.
pub fn join(root: &Path, relative: &str) -> Option<PathBuf> {
    let relative = relative.trim_start_matches('/');
    if relative.split('/').any(|component| component == "..") {
        return None;
    }
    if relative.is_empty() {
        return Some(root.to_path_buf());
    }
    Some(root.join(relative))
}

/// Joins, then attempts to canonicalize. Falls back to the raw join when
/// canonicalization fails (most commonly because the target doesn't exist
/// yet), matching `path_join_real`'s intent without making non-existence a
/// hard error — `mknod`/`mkdir`/`create` all need to name a path that is
/// not there yet.
pub fn join_real(root: &Path, relative: &str) -> Option<PathBuf> {
    let joined = join(root, relative)?;
    Some(joined.canonicalize().unwrap_or(joined))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_with_exactly_one_separator() {
        assert_eq!(join(Path::new("/srv/data"), "foo/bar"), Some(PathBuf::from("/srv/data/foo/bar")));
        assert_eq!(join(Path::new("/srv/data/"), "/foo/bar"), Some(PathBuf::from("/srv/data/foo/bar")));
        assert_eq!(join(Path::new("/srv/data/"), "foo/bar"), Some(PathBuf::from("/srv/data/foo/bar")));
    }

    #[test]
    fn empty_relative_path_yields_root() {
        assert_eq!(join(Path::new("/srv/data"), ""), Some(PathBuf::from("/srv/data")));
        assert_eq!(join(Path::new("/srv/data"), "/"), Some(PathBuf::from("/srv/data")));
    }

    #[test]
    fn rejects_parent_directory_escape() {
        assert_eq!(join(Path::new("/srv/data"), "../etc/passwd"), None);
        assert_eq!(join(Path::new("/srv/data"), "foo/../../etc"), None);
    }

    #[test]
    fn join_real_falls_back_when_target_does_not_exist() {
        let root = std::env::temp_dir();
        let joined = join_real(&root, "definitely-does-not-exist-on-this-box");
        assert_eq!(joined, Some(root.join("definitely-does-not-exist-on-this-box")));
    }
}
