//! Workspace path safety.
//!
//! Every user-supplied path resolves against the working-directory root.
//! Paths that escape the root or touch the reserved `.babylon` state
//! directory are rejected before any I/O happens.

use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};

/// Reserved state directory at the workspace root.
pub const RESERVED_DIR: &str = ".babylon";

/// Resolve `raw` inside `root`, rejecting escapes and the reserved
/// directory. The resolution is lexical: `..` components are folded before
/// any prefix check, so traversal cannot sneak through non-existent paths.
pub fn resolve_in_root(root: &Path, raw: &str) -> Result<PathBuf, String> {
    if raw.is_empty() {
        return Err("path must not be empty".to_string());
    }

    let candidate = Path::new(raw);
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root.join(candidate)
    };

    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(format!("path '{raw}' escapes the working directory"));
                }
            }
            Component::CurDir => {}
            other => normalized.push(other),
        }
    }

    let relative = normalized
        .strip_prefix(root)
        .map_err(|_| format!("path '{raw}' escapes the working directory"))?;

    if relative.components().next() == Some(Component::Normal(OsStr::new(RESERVED_DIR))) {
        return Err(format!(
            "path '{raw}' is inside the reserved {RESERVED_DIR} directory"
        ));
    }

    Ok(normalized)
}

/// Workspace-relative display form of an absolute path.
pub fn relative_display(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .to_string()
}

/// Whether a workspace-relative path falls under any of the scope prefixes.
/// Trailing slashes are ignored; an empty prefix means the whole tree.
pub fn in_file_scope(relative: &str, scope: &[String]) -> bool {
    let relative = relative.trim_start_matches("./");
    scope.iter().any(|prefix| {
        let prefix = prefix.trim_end_matches('/');
        if prefix.is_empty() || prefix == "." {
            return true;
        }
        relative == prefix || relative.starts_with(&format!("{prefix}/"))
    })
}
