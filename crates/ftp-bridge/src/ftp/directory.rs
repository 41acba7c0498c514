//! Virtual directory — the per-session working path.
//!
//! Nothing here touches storage. Whether a path exists, or may be written,
//! is decided downstream by the policy; this type only keeps the protocol's
//! notion of "current directory" consistent.

const SEPARATOR: char = '/';
const ROOT: &str = "/";

/// Working-directory tracker for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualDirectory {
    current: String,
}

impl Default for VirtualDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualDirectory {
    pub fn new() -> Self {
        Self {
            current: ROOT.to_string(),
        }
    }

    pub fn current(&self) -> &str {
        &self.current
    }

    pub fn is_root(&self) -> bool {
        self.current == ROOT
    }

    pub fn reset(&mut self) {
        self.current = ROOT.to_string();
    }

    /// Change the working path. Absolute paths replace it, relative ones
    /// are resolved against it; an empty path resets to root.
    pub fn change_to(&mut self, path: &str) -> &str {
        self.current = self.resolve(path);
        &self.current
    }

    /// Walk one level up (never above root).
    pub fn parent(&mut self) -> &str {
        self.change_to("..")
    }

    /// Absolute, normalized form of `path` relative to the working path.
    pub fn resolve(&self, path: &str) -> String {
        let path = path.trim();
        if path.is_empty() {
            ROOT.to_string()
        } else if path.starts_with(SEPARATOR) {
            normalize_absolute(path)
        } else {
            normalize_absolute(&format!("{}{}{}", self.current, SEPARATOR, path))
        }
    }

    /// Placeholder for `name`. Every placeholder claims to be an existing
    /// directory so generic delete/mkdir bookkeeping always proceeds.
    pub fn entry(&self, name: &str) -> VirtualEntry {
        VirtualEntry {
            path: self.resolve(name),
        }
    }
}

/// Synthetic entry handed out by [`VirtualDirectory::entry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualEntry {
    path: String,
}

impl VirtualEntry {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn name(&self) -> &str {
        match self.path.rsplit(SEPARATOR).next() {
            Some(last) if !last.is_empty() => last,
            _ => ROOT,
        }
    }

    pub fn is_directory(&self) -> bool {
        true
    }

    pub fn is_file(&self) -> bool {
        false
    }

    pub fn exists(&self) -> bool {
        true
    }
}

/// Collapse `.`, empty segments and `..` into an absolute path rooted at `/`.
/// `..` at root is dropped.
pub fn normalize_absolute(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split(SEPARATOR) {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }
    if segments.is_empty() {
        ROOT.to_string()
    } else {
        let mut out = String::with_capacity(path.len());
        for s in segments {
            out.push(SEPARATOR);
            out.push_str(s);
        }
        out
    }
}

/// Relative counterpart of [`normalize_absolute`]: a `..` with nothing to
/// remove is kept, and an empty result is `.`.
pub fn normalize_relative(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split(SEPARATOR) {
        match segment {
            "" | "." => {}
            ".." => match segments.last() {
                Some(&last) if last != ".." => {
                    segments.pop();
                }
                _ => segments.push(".."),
            },
            s => segments.push(s),
        }
    }
    if segments.is_empty() {
        ".".to_string()
    } else {
        segments.join("/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(path: &str) -> VirtualDirectory {
        let mut dir = VirtualDirectory::new();
        dir.change_to(path);
        dir
    }

    #[test]
    fn test_defaults_to_root() {
        let dir = VirtualDirectory::new();
        assert_eq!(dir.current(), "/");
        assert!(dir.is_root());
    }

    #[test]
    fn test_dotdot_walks_up() {
        let mut dir = at("/a/b");
        assert_eq!(dir.change_to(".."), "/a");
        assert_eq!(dir.parent(), "/");
    }

    #[test]
    fn test_slash_resets() {
        let mut dir = at("/a/b");
        assert_eq!(dir.change_to("/"), "/");
    }

    #[test]
    fn test_never_above_root() {
        let mut dir = VirtualDirectory::new();
        for _ in 0..5 {
            dir.change_to("..");
            assert_eq!(dir.current(), "/");
        }
        assert_eq!(dir.change_to("../../x"), "/x");
    }

    #[test]
    fn test_relative_appends() {
        let mut dir = at("/inbox");
        assert_eq!(dir.change_to("2024/./q1//"), "/inbox/2024/q1");
        assert_eq!(dir.change_to("../q2"), "/inbox/2024/q2");
    }

    #[test]
    fn test_absolute_replaces() {
        let mut dir = at("/inbox/2024");
        assert_eq!(dir.change_to("/outbox/./x/../y"), "/outbox/y");
    }

    #[test]
    fn test_empty_resets() {
        let mut dir = at("/deep/path");
        assert_eq!(dir.change_to("  "), "/");
    }

    #[test]
    fn test_normalize_relative_keeps_leading_dotdot() {
        assert_eq!(normalize_relative("../a/./b"), "../a/b");
        assert_eq!(normalize_relative("a/../.."), "..");
        assert_eq!(normalize_relative("a/b/../../../../c"), "../../c");
        assert_eq!(normalize_relative("./"), ".");
    }

    #[test]
    fn test_placeholders_are_directories() {
        let dir = at("/drop");
        let entry = dir.entry("report.csv");
        assert_eq!(entry.path(), "/drop/report.csv");
        assert_eq!(entry.name(), "report.csv");
        assert!(entry.is_directory());
        assert!(!entry.is_file());
        assert!(entry.exists());
        assert_eq!(dir.entry("..").name(), "/");
    }
}
