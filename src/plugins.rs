//! Plugin descriptor store access: validating plugin references and
//! resolving command tokens to bundled binaries.
//!
//! A plugin is a JSON descriptor file plus optional companion binaries in
//! OS-tagged subdirectories next to it. The store itself is read-only.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};
use crate::paths;

/// Subdirectory name probed for the host OS.
pub fn os_tag() -> &'static str {
    if cfg!(target_os = "macos") {
        "osx"
    } else if cfg!(windows) {
        "windows"
    } else {
        "linux"
    }
}

/// Confirm `plugin_ref` names an existing regular file under the plugin
/// root and return its confined absolute path.
pub fn validate(plugin_root: &Path, plugin_ref: &str) -> Result<PathBuf> {
    let path = paths::confine(plugin_root.join(plugin_ref), plugin_root)?;
    if !path.is_file() {
        return Err(Error::NotFound(format!("plugin descriptor {plugin_ref}")));
    }
    Ok(path)
}

/// Substitute the command's first token with the plugin-bundled binary when
/// one exists.
///
/// Probe order: `<pluginDir>/<osTag>/<token>`, then `<pluginDir>/<token>`.
/// The first existing executable wins; with no match the command is returned
/// unchanged and PATH lookup happens at spawn time. An empty `plugin_ref`
/// skips resolution entirely.
pub fn resolve_command(plugin_root: &Path, plugin_ref: &str, command: &str) -> Result<String> {
    let command = command.trim();
    if plugin_ref.is_empty() || command.is_empty() {
        return Ok(command.to_string());
    }

    let descriptor = validate(plugin_root, plugin_ref)?;
    let plugin_dir = descriptor
        .parent()
        .ok_or_else(|| Error::NotFound(format!("plugin directory of {plugin_ref}")))?;

    let mut tokens = command.split_whitespace();
    let binary = tokens.next().unwrap_or_default();
    let rest: Vec<&str> = tokens.collect();

    for candidate in [
        plugin_dir.join(os_tag()).join(binary),
        plugin_dir.join(binary),
    ] {
        if is_executable(&candidate) {
            debug!(binary = %binary, resolved = %candidate.display(), "resolved plugin executable");
            let mut out = candidate.display().to_string();
            for t in &rest {
                out.push(' ');
                out.push_str(t);
            }
            return Ok(out);
        }
    }
    Ok(command.to_string())
}

/// Relative paths of every `.json` descriptor under the plugin root,
/// sorted. Serves the `plugins` request operation.
pub fn discover(plugin_root: &Path) -> Result<Vec<String>> {
    let root = plugin_root
        .canonicalize()
        .map_err(|_| Error::NotFound(format!("plugin root {}", plugin_root.display())))?;
    let mut found = Vec::new();
    walk(&root, &root, &mut found)?;
    found.sort();
    Ok(found)
}

fn walk(root: &Path, dir: &Path, found: &mut Vec<String>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            walk(root, &path, found)?;
        } else if path.extension().map(|e| e == "json").unwrap_or(false) {
            if let Ok(rel) = path.strip_prefix(root) {
                found.push(rel.to_string_lossy().replace('\\', "/"));
            }
        }
    }
    Ok(())
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plugin_tree() -> (tempfile::TempDir, PathBuf) {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("mafft");
        std::fs::create_dir_all(dir.join(os_tag())).unwrap();
        std::fs::write(dir.join("plugin.json"), b"{\"program\":\"mafft\"}").unwrap();
        (tmp, dir)
    }

    #[cfg(unix)]
    fn make_executable(path: &Path) {
        use std::os::unix::fs::PermissionsExt;
        std::fs::write(path, b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn validate_requires_regular_file() {
        let (tmp, dir) = plugin_tree();
        assert!(validate(tmp.path(), "mafft/plugin.json").is_ok());
        // A directory is not a descriptor.
        assert!(validate(tmp.path(), "mafft").is_err());
        assert!(validate(tmp.path(), "missing/plugin.json").is_err());
        drop(dir);
    }

    #[test]
    fn validate_rejects_escape() {
        let (tmp, _dir) = plugin_tree();
        assert!(validate(tmp.path(), "../plugin.json").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn resolves_os_tagged_binary_first() {
        let (tmp, dir) = plugin_tree();
        make_executable(&dir.join(os_tag()).join("mafft"));
        make_executable(&dir.join("mafft"));
        let out = resolve_command(tmp.path(), "mafft/plugin.json", "mafft --auto in.fa").unwrap();
        assert!(
            out.starts_with(dir.join(os_tag()).join("mafft").to_str().unwrap()),
            "got {out}"
        );
        assert!(out.ends_with("--auto in.fa"));
    }

    #[cfg(unix)]
    #[test]
    fn falls_back_to_plugin_dir_binary() {
        let (tmp, dir) = plugin_tree();
        make_executable(&dir.join("mafft"));
        let out = resolve_command(tmp.path(), "mafft/plugin.json", "mafft in.fa").unwrap();
        assert!(out.starts_with(dir.join("mafft").to_str().unwrap()));
    }

    #[cfg(unix)]
    #[test]
    fn non_executable_file_is_skipped() {
        let (tmp, dir) = plugin_tree();
        std::fs::write(dir.join("mafft"), b"not runnable").unwrap();
        let out = resolve_command(tmp.path(), "mafft/plugin.json", "mafft in.fa").unwrap();
        assert_eq!(out, "mafft in.fa");
    }

    #[test]
    fn unresolved_command_passes_through() {
        let (tmp, _dir) = plugin_tree();
        let out = resolve_command(tmp.path(), "mafft/plugin.json", "mafft in.fa").unwrap();
        assert_eq!(out, "mafft in.fa");
    }

    #[test]
    fn empty_plugin_ref_skips_resolution() {
        let tmp = tempfile::tempdir().unwrap();
        let out = resolve_command(tmp.path(), "", "echo hi").unwrap();
        assert_eq!(out, "echo hi");
    }

    #[test]
    fn discover_lists_descriptors() {
        let (tmp, dir) = plugin_tree();
        std::fs::create_dir_all(tmp.path().join("muscle")).unwrap();
        std::fs::write(tmp.path().join("muscle/plugin.json"), b"{}").unwrap();
        std::fs::write(dir.join("notes.txt"), b"ignored").unwrap();
        let found = discover(tmp.path()).unwrap();
        assert_eq!(
            found,
            vec![
                "mafft/plugin.json".to_string(),
                "muscle/plugin.json".to_string()
            ]
        );
    }
}
