//! Working-directory jail and sensitive path blocklist

use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Names that are never read, written or listed, wherever they appear
const BLOCKED_NAMES: &[&str] = &[
    ".ssh",
    ".aws",
    ".gnupg",
    ".env",
    ".netrc",
    ".pgpass",
    ".npmrc",
    ".pypirc",
    ".git-credentials",
    ".kube",
    ".docker",
    ".azure",
    "gcloud",
    ".bash_history",
    ".zsh_history",
    ".sh_history",
    ".history",
    "fish_history",
    ".python_history",
    ".node_repl_history",
    ".psql_history",
    ".mysql_history",
    "id_rsa",
    "id_dsa",
    "id_ecdsa",
    "id_ed25519",
];

const BLOCKED_PREFIXES: &[&str] = &[".env."];

const BLOCKED_SUFFIXES: &[&str] = &[".pem", ".key", ".p12", ".pfx", ".keystore"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GuardError {
    #[error("Access denied: {0} is outside the working directory")]
    OutsideWorkingDirectory(String),

    #[error("Access denied: {0} is a protected path")]
    Blocked(String),
}

/// Resolve `requested` against `cwd` and check it against the jail and the
/// blocklist. The check is lexical; the filesystem is never consulted.
pub fn resolve(cwd: &Path, requested: &str) -> Result<PathBuf, GuardError> {
    let cwd = normalize(cwd);
    let requested_path = Path::new(requested.trim());
    let joined = if requested_path.is_absolute() {
        normalize(requested_path)
    } else {
        normalize(&cwd.join(requested_path))
    };

    let relative = joined
        .strip_prefix(&cwd)
        .map_err(|_| GuardError::OutsideWorkingDirectory(requested.to_string()))?;
    if is_blocked(relative) {
        return Err(GuardError::Blocked(requested.to_string()));
    }
    Ok(joined)
}

/// Whether any segment of `relative` is a sensitive name
pub fn is_blocked(relative: &Path) -> bool {
    relative.components().any(|component| match component {
        Component::Normal(name) => is_blocked_name(&name.to_string_lossy()),
        _ => false,
    })
}

fn is_blocked_name(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    BLOCKED_NAMES.contains(&name.as_str())
        || BLOCKED_PREFIXES.iter().any(|p| name.starts_with(p))
        || BLOCKED_SUFFIXES.iter().any(|s| name.ends_with(s))
}

/// Collapse `.` and `..` without touching the filesystem
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}
