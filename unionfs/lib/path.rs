//! Path handling for the union namespace.
//!
//! All names inside a mounted image form a single rooted namespace of
//! `/`-separated UTF-8 paths. The canonical form carries no leading slash, no
//! trailing slash and no `.`/`..` components; the root is the empty string.

use typed_path::{Utf8UnixComponent, Utf8UnixPath};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Canonicalises a path in the union namespace.
///
/// Leading slashes and `./` prefixes are dropped, `..` components consume the
/// preceding component, and trailing slashes (as produced by tar directory
/// records) are removed. The root resolves to `""`.
pub fn clean(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for component in Utf8UnixPath::new(path).components() {
        match component {
            Utf8UnixComponent::Normal(part) => parts.push(part),
            Utf8UnixComponent::ParentDir => {
                parts.pop();
            }
            Utf8UnixComponent::RootDir | Utf8UnixComponent::CurDir => {}
        }
    }
    parts.join("/")
}

/// Returns the parent of a cleaned path; the parent of a top-level name (and
/// of the root itself) is the root `""`.
pub fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[..idx],
        None => "",
    }
}

/// Returns the final component of a cleaned path (`""` for the root).
pub fn file_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

/// Joins a child name onto a cleaned directory path.
pub fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Returns whether `path` is an immediate child of `dir` (both cleaned).
pub fn is_direct_child(dir: &str, path: &str) -> bool {
    !path.is_empty() && parent(path) == dir
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean() {
        assert_eq!(clean("/etc/host"), "etc/host");
        assert_eq!(clean("etc/host"), "etc/host");
        assert_eq!(clean("./etc//host/"), "etc/host");
        assert_eq!(clean("app/"), "app");
        assert_eq!(clean("a/b/../c"), "a/c");
        assert_eq!(clean("a/./b"), "a/b");
        assert_eq!(clean("/"), "");
        assert_eq!(clean("."), "");
        assert_eq!(clean(""), "");
    }

    #[test]
    fn test_parent_and_file_name() {
        assert_eq!(parent("var/log/dmesg"), "var/log");
        assert_eq!(parent("var"), "");
        assert_eq!(parent(""), "");
        assert_eq!(file_name("var/log/dmesg"), "dmesg");
        assert_eq!(file_name("var"), "var");
        assert_eq!(file_name(""), "");
    }

    #[test]
    fn test_join() {
        assert_eq!(join("", "etc"), "etc");
        assert_eq!(join("etc", "host"), "etc/host");
    }

    #[test]
    fn test_is_direct_child() {
        assert!(is_direct_child("", "etc"));
        assert!(is_direct_child("etc", "etc/host"));
        assert!(!is_direct_child("", "etc/host"));
        assert!(!is_direct_child("etc", "etc/a/b"));
        assert!(!is_direct_child("", ""));
    }
}
