use parking_lot::RwLock;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// File roots a context may read from.
///
/// Paths are compared after canonicalization, so a symlink that escapes a
/// granted root is refused.
#[derive(Debug, Default)]
pub struct SecurityPolicy {
    roots: RwLock<Vec<PathBuf>>,
}

impl SecurityPolicy {
    pub fn new(root: impl AsRef<Path>) -> Self {
        let policy = Self::default();
        policy.grant(root);
        policy
    }

    pub fn grant(&self, root: impl AsRef<Path>) {
        let root = root.as_ref();
        let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
        let mut roots = self.roots.write();
        if !roots.contains(&root) {
            roots.push(root);
        }
    }

    pub fn permits(&self, path: &Path) -> bool {
        let Ok(path) = path.canonicalize() else {
            return false;
        };
        self.roots.read().iter().any(|root| path.starts_with(root))
    }

    pub fn roots(&self) -> Vec<PathBuf> {
        self.roots.read().clone()
    }
}

/// Resources reachable only by users holding one of `roles`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SecurityConstraint {
    pub patterns: Vec<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl SecurityConstraint {
    pub fn new(patterns: &[&str], roles: &[&str]) -> Self {
        Self {
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
        }
    }

    pub fn covers(&self, path: &str) -> bool {
        self.patterns.iter().any(|p| pattern_matches(p, path))
    }

    pub fn allows(&self, roles: &[String]) -> bool {
        self.roles.iter().any(|required| roles.contains(required))
    }
}

/// Matches a context-relative path against a URL pattern: `/` matches
/// everything, `/x/*` matches `/x` and below, `*.ext` matches by extension,
/// anything else must be equal.
pub(crate) fn pattern_matches(pattern: &str, path: &str) -> bool {
    if pattern == "/" || pattern == "/*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix("/*") {
        return path == prefix
            || path
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('/'));
    }
    if let Some(ext) = pattern.strip_prefix("*.") {
        return extension(path) == Some(ext);
    }
    pattern == path
}

/// Extension of the last path segment.
pub(crate) fn extension(path: &str) -> Option<&str> {
    let segment = path.rsplit('/').next()?;
    let (stem, ext) = segment.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        None
    } else {
        Some(ext)
    }
}
