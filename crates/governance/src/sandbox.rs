//! Filesystem scope enforcement.
//!
//! Every path a session or a tool touches is resolved here against the
//! identity's approved root. Resolution walks the candidate one component at
//! a time, following symbolic links as they are met, so `..` segments are
//! applied to real directories rather than to the literal string. The
//! result is accepted only if it is the root itself or a descendant of it.

use std::io;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("path escapes the approved directory: {0}")]
    DirectoryTraversal(String),
    #[error("approved root {path} is unavailable: {reason}")]
    RootUnavailable { path: PathBuf, reason: String },
    #[error("failed to inspect {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

/// Stateless path resolver; safe to share and call concurrently.
#[derive(Clone, Copy, Debug, Default)]
pub struct PathSandbox;

impl PathSandbox {
    /// Resolves `candidate` (absolute, or relative to `approved_root`) to a
    /// canonical path inside `approved_root`.
    pub fn resolve(
        candidate: impl AsRef<Path>,
        approved_root: &Path,
    ) -> Result<PathBuf, SandboxError> {
        Self::resolve_from(candidate, approved_root, approved_root)
    }

    /// Like [`PathSandbox::resolve`], but relative candidates are interpreted
    /// against `base` (typically a session's working directory). `base`
    /// itself is never trusted: the final path is checked against the root.
    pub fn resolve_from(
        candidate: impl AsRef<Path>,
        base: &Path,
        approved_root: &Path,
    ) -> Result<PathBuf, SandboxError> {
        let candidate = candidate.as_ref();
        let display = candidate.display().to_string();
        if display.contains('\0') {
            return Err(SandboxError::DirectoryTraversal(display));
        }
        if has_encoded_traversal(&display) {
            return Err(SandboxError::DirectoryTraversal(display));
        }

        let root = canonical_root(approved_root)?;
        let mut current = if candidate.is_absolute() {
            PathBuf::new()
        } else {
            let base = if base.is_absolute() {
                base.to_path_buf()
            } else {
                root.join(base)
            };
            walk(&PathBuf::new(), &base, &display)?
        };
        current = walk(&current, candidate, &display)?;

        if current.starts_with(&root) {
            Ok(current)
        } else {
            Err(SandboxError::DirectoryTraversal(display))
        }
    }

    /// True when `path` resolves inside `approved_root`.
    pub fn contains(approved_root: &Path, path: &Path) -> bool {
        Self::resolve(path, approved_root).is_ok()
    }
}

fn walk(start: &Path, path: &Path, display: &str) -> Result<PathBuf, SandboxError> {
    let mut current = start.to_path_buf();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => current = PathBuf::from(prefix.as_os_str()),
            Component::RootDir => current.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                current.pop();
            }
            Component::Normal(name) => {
                current.push(name);
                current = follow(current, display)?;
            }
        }
    }
    Ok(current)
}

/// Replaces `path` with its real location when it exists on disk.
fn follow(path: PathBuf, display: &str) -> Result<PathBuf, SandboxError> {
    match std::fs::symlink_metadata(&path) {
        Ok(_) => match std::fs::canonicalize(&path) {
            Ok(real) => Ok(real),
            // A link whose target cannot be resolved cannot be proven safe.
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(SandboxError::DirectoryTraversal(display.to_string()))
            }
            Err(source) => Err(SandboxError::Io { path, source }),
        },
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(path),
        Err(source) => Err(SandboxError::Io { path, source }),
    }
}

fn canonical_root(root: &Path) -> Result<PathBuf, SandboxError> {
    if !root.is_absolute() {
        return Err(SandboxError::RootUnavailable {
            path: root.to_path_buf(),
            reason: "approved root must be absolute".to_string(),
        });
    }
    match std::fs::canonicalize(root) {
        Ok(real) => Ok(real),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(lexical_normalize(root)),
        Err(err) => Err(SandboxError::RootUnavailable {
            path: root.to_path_buf(),
            reason: err.to_string(),
        }),
    }
}

fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Detects percent-encoded dots, separators, escapes and NULs, including
/// double encodings such as `%252e`.
fn has_encoded_traversal(value: &str) -> bool {
    value.as_bytes().windows(3).any(|window| {
        window[0] == b'%'
            && match (hex_value(window[1]), hex_value(window[2])) {
                (Some(high), Some(low)) => matches!(high * 16 + low, b'.' | b'/' | b'\\' | b'%' | 0),
                _ => false,
            }
    })
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_sequences_are_detected() {
        assert!(has_encoded_traversal("%2e%2e/etc"));
        assert!(has_encoded_traversal("a/%2F"));
        assert!(has_encoded_traversal("%252e%252e"));
        assert!(!has_encoded_traversal("report-100%.txt"));
        assert!(!has_encoded_traversal("plain/name"));
    }

    #[test]
    fn lexical_normalize_drops_dot_segments() {
        assert_eq!(
            lexical_normalize(Path::new("/data/./projects/../projects")),
            PathBuf::from("/data/projects")
        );
    }
}
