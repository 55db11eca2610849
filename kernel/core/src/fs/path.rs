//! Canonical absolute paths as seen by the VFS and the file-system drivers.
//!
//! A canonical path starts with `/`, has no empty, `.` or `..` components and no
//! trailing slash (except the root itself).

use cupid_api_types::{Errno, FsResult, MAX_NAME, MAX_PATH};
use heapless::String;

pub type PathBuf = String<MAX_PATH>;

/// Collapses repeated and trailing slashes. Relative paths and `.`/`..` components are
/// rejected: resolving those is the caller's job.
pub fn canonicalize(path: &str) -> FsResult<PathBuf> {
    if !path.starts_with('/') {
        return Err(Errno::InvalidArgument);
    }
    let mut out = PathBuf::new();
    for component in components(path) {
        if component == "." || component == ".." || component.len() > MAX_NAME {
            return Err(Errno::InvalidArgument);
        }
        out.push('/').map_err(|_| Errno::InvalidArgument)?;
        out.push_str(component).map_err(|_| Errno::InvalidArgument)?;
    }
    if out.is_empty() {
        out.push('/').map_err(|_| Errno::InvalidArgument)?;
    }
    Ok(out)
}

pub fn components(path: &str) -> impl DoubleEndedIterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}

/// Splits a canonical path into its parent and final component.
/// The root has no final component.
pub fn split_last(path: &str) -> Option<(&str, &str)> {
    let trimmed = path.trim_end_matches('/');
    let idx = trimmed.rfind('/')?;
    let name = &trimmed[idx + 1..];
    if name.is_empty() {
        return None;
    }
    let parent = if idx == 0 { "/" } else { &trimmed[..idx] };
    Some((parent, name))
}

/// Whether canonical `path` equals `prefix` or lies below it.
pub fn is_under(path: &str, prefix: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// The part of canonical `path` below mount point `prefix`, as a rooted path.
pub fn strip_mount<'a>(path: &'a str, prefix: &str) -> &'a str {
    if prefix == "/" {
        return path;
    }
    match &path[prefix.len()..] {
        "" => "/",
        rest => rest,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalize_collapses_slashes() {
        assert_eq!(canonicalize("//home///foo/").unwrap(), "/home/foo");
        assert_eq!(canonicalize("/").unwrap(), "/");
        assert_eq!(canonicalize("///").unwrap(), "/");
    }

    #[test]
    fn canonicalize_rejects_relative_and_dot_components() {
        assert_eq!(canonicalize("home"), Err(Errno::InvalidArgument));
        assert_eq!(canonicalize("/home/../etc"), Err(Errno::InvalidArgument));
        assert_eq!(canonicalize("/./x"), Err(Errno::InvalidArgument));
    }

    #[test]
    fn split_last_handles_root_children() {
        assert_eq!(split_last("/bin"), Some(("/", "bin")));
        assert_eq!(split_last("/home/foo/x"), Some(("/home/foo", "x")));
        assert_eq!(split_last("/"), None);
    }

    #[test]
    fn mount_prefix_matching_respects_component_boundaries() {
        assert!(is_under("/home", "/home"));
        assert!(is_under("/home/a", "/home"));
        assert!(!is_under("/homework", "/home"));
        assert!(is_under("/anything", "/"));
        assert_eq!(strip_mount("/home", "/home"), "/");
        assert_eq!(strip_mount("/home/a/b", "/home"), "/a/b");
        assert_eq!(strip_mount("/tmp/x", "/"), "/tmp/x");
    }
}
