use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

/// Validates paths against the configured scope roots.
///
/// Both roots and candidate paths are canonicalized the same way
/// (backslashes to forward slashes, `~` expanded, `..` resolved lexically,
/// symlinks resolved for the existing prefix) before the containment
/// check, so no traversal escape survives normalization.
pub struct ScopeValidator {
    roots: Vec<PathBuf>,
}

impl ScopeValidator {
    pub fn new(allowed_roots: &[String]) -> Self {
        let roots = allowed_roots
            .iter()
            .map(|root| canonicalize_lenient(root))
            .collect();
        Self { roots }
    }

    pub fn allowed_roots(&self) -> Vec<String> {
        self.roots
            .iter()
            .map(|root| root.display().to_string())
            .collect()
    }

    /// Normalized projection of `path`, for error diagnostics. Available
    /// even when validation fails.
    pub fn normalized(&self, path: &str) -> Option<String> {
        if path.is_empty() {
            return None;
        }
        Some(canonicalize_lenient(path).display().to_string())
    }

    /// `Ok(normalized)` iff the canonicalized path lies under some
    /// canonicalized allowed root.
    pub fn validate(&self, path: &str) -> Result<PathBuf, String> {
        if path.is_empty() {
            return Err("Path outside allowed scope: empty path".to_string());
        }
        let normalized = canonicalize_lenient(path);
        if self.roots.iter().any(|root| normalized.starts_with(root)) {
            Ok(normalized)
        } else {
            Err(format!("Path outside allowed scope: {path}"))
        }
    }
}

/// Canonicalize without requiring the path to exist: expand `~`, make
/// absolute, resolve `.`/`..` lexically, then resolve symlinks through the
/// longest existing ancestor.
fn canonicalize_lenient(raw: &str) -> PathBuf {
    let forward = raw.replace('\\', "/");
    let expanded = expand_home(&forward);
    let absolute = if expanded.is_absolute() {
        expanded
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("/"))
            .join(expanded)
    };
    let lexical = normalize_lexically(&absolute);
    resolve_existing_prefix(&lexical)
}

fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"));
    }
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Canonicalize the deepest existing ancestor and re-append the remainder,
/// mirroring a `resolve(strict=False)`: symlinks in the existing part are
/// followed, the non-existing tail is kept lexically.
fn resolve_existing_prefix(path: &Path) -> PathBuf {
    if let Ok(resolved) = std::fs::canonicalize(path) {
        return resolved;
    }
    let mut ancestor = path.to_path_buf();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();
    while let Some(parent) = ancestor.parent() {
        if let Some(name) = ancestor.file_name() {
            tail.push(name.to_os_string());
        }
        ancestor = parent.to_path_buf();
        if let Ok(resolved) = std::fs::canonicalize(&ancestor) {
            let mut out = resolved;
            for part in tail.iter().rev() {
                out.push(part);
            }
            return out;
        }
    }
    path.to_path_buf()
}
