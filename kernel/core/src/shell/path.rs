use crate::fs::path::{PathBuf, components};
use cupid_api_types::{Errno, FsResult, MAX_NAME};
use heapless::Vec;

const MAX_DEPTH: usize = 64;

/// Resolves `input` against `cwd` into a canonical absolute path: `.` is dropped,
/// `..` pops a component (never above the root), repeated and trailing slashes go.
pub fn resolve_path(input: &str, cwd: &str) -> FsResult<PathBuf> {
    let mut stack: Vec<&str, MAX_DEPTH> = Vec::new();
    let base = if input.starts_with('/') { "" } else { cwd };
    for component in components(base).chain(components(input)) {
        match component {
            "." => {}
            ".." => {
                stack.pop();
            }
            name if name.len() > MAX_NAME => return Err(Errno::InvalidArgument),
            name => stack.push(name).map_err(|_| Errno::InvalidArgument)?,
        }
    }

    let mut out = PathBuf::new();
    for component in &stack {
        out.push('/').map_err(|_| Errno::InvalidArgument)?;
        out.push_str(component).map_err(|_| Errno::InvalidArgument)?;
    }
    if out.is_empty() {
        out.push('/').map_err(|_| Errno::InvalidArgument)?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_join_the_cwd() {
        assert_eq!(resolve_path("a/../b/./c", "/x/y").unwrap(), "/x/y/b/c");
        assert_eq!(resolve_path("foo", "/").unwrap(), "/foo");
        assert_eq!(resolve_path("..", "/x/y").unwrap(), "/x");
        assert_eq!(resolve_path(".", "/x").unwrap(), "/x");
    }

    #[test]
    fn absolute_paths_ignore_the_cwd() {
        assert_eq!(resolve_path("/../../a", "/x/y").unwrap(), "/a");
        assert_eq!(resolve_path("/", "/x").unwrap(), "/");
        assert_eq!(resolve_path("//bin///hello.cc/", "/").unwrap(), "/bin/hello.cc");
    }

    #[test]
    fn never_climbs_above_root() {
        assert_eq!(resolve_path("../../..", "/a").unwrap(), "/");
    }

    #[test]
    fn oversized_paths_are_rejected() {
        let long_name = "n".repeat(MAX_NAME + 1);
        assert_eq!(resolve_path(&long_name, "/"), Err(Errno::InvalidArgument));
        let deep = "abcdefgh/".repeat(40);
        assert_eq!(resolve_path(&deep, "/"), Err(Errno::InvalidArgument));
    }
}
