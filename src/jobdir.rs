//! Job directory factory: creates per-step directories under the data root,
//! materialises their initial descriptors, and stages request-supplied
//! input files.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use ulid::Ulid;

use crate::descriptor::{now_unix, Descriptor, Status, LOGFILE_FILE, STDOUT_FILE};
use crate::error::{Error, Result};
use crate::paths;

/// A freshly created step directory.
#[derive(Debug)]
pub struct StepDir {
    /// Absolute, confined path.
    pub path: PathBuf,
    /// Slash-separated id relative to the data root.
    pub id: String,
}

/// Create a directory for one pipeline step under `parent` (the data root
/// for first steps, the predecessor's directory for later ones) and write
/// its initial descriptor.
///
/// With `opaque_ids` enabled and `parent` being the data root itself, the
/// named directory is nested inside a random ULID-named wrapper so job ids
/// are not guessable. Name collisions resolve by appending `2`, `3`, …
pub fn create(data_root: &Path, parent: &Path, step_name: &str, opaque_ids: bool) -> Result<StepDir> {
    let data_root = data_root
        .canonicalize()
        .map_err(|_| Error::RestrictedPath(data_root.to_path_buf()))?;
    let parent = paths::confine(parent, &data_root)?;

    let name = sanitize_name(step_name);
    if name.is_empty() {
        return Err(Error::Malformed("step has no usable name".to_string()));
    }

    let dir = if opaque_ids && parent == data_root {
        let wrapper = parent.join(Ulid::new().to_string().to_lowercase());
        let dir = wrapper.join(&name);
        std::fs::create_dir_all(&dir)?;
        dir
    } else {
        let mut dir = parent.join(&name);
        let mut suffix = 2u32;
        while dir.exists() {
            dir = parent.join(format!("{name}{suffix}"));
            suffix += 1;
        }
        std::fs::create_dir_all(&dir)?;
        dir
    };

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o775))?;
    }

    let id = dir
        .strip_prefix(&data_root)
        .map_err(|_| Error::RestrictedPath(dir.clone()))?
        .to_string_lossy()
        .replace('\\', "/");

    let desc = Descriptor {
        id: id.clone(),
        name,
        created: Some(now_unix()),
        status: Some(Status::Init),
        stdout: STDOUT_FILE.to_string(),
        logfile: LOGFILE_FILE.to_string(),
        ..Descriptor::default()
    };
    desc.flush(&dir)?;

    debug!(id = %id, "created step directory");
    Ok(StepDir { path: dir, id })
}

/// Stage request-supplied input files into a job directory. Filenames that
/// reach upward are dropped silently; the path guard would veto them anyway.
pub fn stage_inputs(job_dir: &Path, files: &[(String, Vec<u8>)]) -> Result<Vec<String>> {
    let mut staged = Vec::new();
    for (name, contents) in files {
        if !paths::is_plain_relative(name) {
            warn!(name = %name, "dropping input filename with traversal components");
            continue;
        }
        let dest = paths::confine(job_dir.join(name), job_dir)?;
        if let Some(dir) = dest.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(&dest, contents)?;
        staged.push(name.clone());
    }
    Ok(staged)
}

/// Directory basename for a step: path separators are not allowed to leak
/// into the name a client chose.
fn sanitize_name(step_name: &str) -> String {
    step_name
        .trim()
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect::<String>()
        .trim_matches('.')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_named_directory_with_descriptor() {
        let tmp = tempfile::tempdir().unwrap();
        let step = create(tmp.path(), tmp.path(), "align", false).unwrap();
        assert_eq!(step.id, "align");
        let desc = Descriptor::load(&step.path).unwrap();
        assert_eq!(desc.name, "align");
        assert_eq!(desc.stdout, STDOUT_FILE);
        assert_eq!(desc.logfile, LOGFILE_FILE);
        // INIT persists as wire value 1.
        assert_eq!(desc.status(), Status::Queued);
    }

    #[test]
    fn collision_appends_counter() {
        let tmp = tempfile::tempdir().unwrap();
        let a = create(tmp.path(), tmp.path(), "job", false).unwrap();
        let b = create(tmp.path(), tmp.path(), "job", false).unwrap();
        let c = create(tmp.path(), tmp.path(), "job", false).unwrap();
        assert_eq!(a.id, "job");
        assert_eq!(b.id, "job2");
        assert_eq!(c.id, "job3");
    }

    #[test]
    fn opaque_ids_wrap_top_level_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let step = create(tmp.path(), tmp.path(), "align", true).unwrap();
        let parts: Vec<&str> = step.id.split('/').collect();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1], "align");
        assert!(parts[0].len() > 8, "wrapper should be opaque: {}", step.id);
    }

    #[test]
    fn nested_steps_are_not_wrapped() {
        let tmp = tempfile::tempdir().unwrap();
        let first = create(tmp.path(), tmp.path(), "a", true).unwrap();
        let second = create(tmp.path(), &first.path, "b", true).unwrap();
        assert_eq!(second.id, format!("{}/b", first.id));
    }

    #[test]
    fn parent_outside_root_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        assert!(create(tmp.path(), other.path(), "x", false).is_err());
    }

    #[test]
    fn staging_drops_traversal_names() {
        let tmp = tempfile::tempdir().unwrap();
        let files = vec![
            ("input.fa".to_string(), b"ACGT".to_vec()),
            ("../escape.txt".to_string(), b"nope".to_vec()),
        ];
        let staged = stage_inputs(tmp.path(), &files).unwrap();
        assert_eq!(staged, vec!["input.fa".to_string()]);
        assert!(tmp.path().join("input.fa").exists());
        assert!(!tmp.path().parent().unwrap().join("escape.txt").exists());
    }

    #[test]
    fn sanitize_strips_separators() {
        assert_eq!(sanitize_name("a/b"), "a_b");
        assert_eq!(sanitize_name(" job "), "job");
        assert_eq!(sanitize_name("..hidden.."), "hidden");
    }
}
