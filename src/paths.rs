//! Path guard: every filesystem path the engine touches is confined to one
//! of its declared roots (data, plugin, temp).
//!
//! `confine` resolves symlinks before comparing, so a link pointing outside
//! the root is rejected even when its textual path looks contained.

use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

/// Canonicalise `candidate` and verify it lies under `root`.
///
/// The candidate itself need not exist yet (job directories are confined
/// before creation); the deepest existing ancestor is canonicalised and the
/// remaining components are appended, with `..` rejected in the unresolved
/// tail.
pub fn confine(candidate: impl AsRef<Path>, root: &Path) -> Result<PathBuf> {
    let root = root
        .canonicalize()
        .map_err(|_| Error::RestrictedPath(root.to_path_buf()))?;

    let candidate = candidate.as_ref();
    let absolute = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root.join(candidate)
    };

    let resolved = resolve_lexical(&absolute)?;
    if resolved.starts_with(&root) {
        Ok(resolved)
    } else {
        Err(Error::RestrictedPath(absolute))
    }
}

/// Join `parts` onto `root` and confine the result.
pub fn join(root: &Path, parts: &[&str]) -> Result<PathBuf> {
    let mut p = root.to_path_buf();
    for part in parts {
        p.push(part);
    }
    confine(p, root)
}

/// Canonicalise the longest existing prefix, then append the non-existing
/// tail. `..` in the tail cannot be resolved against the filesystem, so it
/// is rejected outright.
fn resolve_lexical(path: &Path) -> Result<PathBuf> {
    let mut existing = path.to_path_buf();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();

    loop {
        match existing.canonicalize() {
            Ok(resolved) => {
                let mut out = resolved;
                for comp in tail.iter().rev() {
                    out.push(comp);
                }
                return Ok(out);
            }
            Err(_) => {
                let Some(name) = existing.file_name() else {
                    return Err(Error::RestrictedPath(path.to_path_buf()));
                };
                tail.push(name.to_os_string());
                if !existing.pop() {
                    return Err(Error::RestrictedPath(path.to_path_buf()));
                }
            }
        }
    }
}

/// True when `name` is a plain relative filename with no parent-directory
/// traversal. Used by the input-staging layer as defence in depth; `confine`
/// would also veto the resulting path.
pub fn is_plain_relative(name: &str) -> bool {
    let p = Path::new(name);
    !p.is_absolute()
        && p.components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}
