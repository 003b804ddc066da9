//! Process-wide server state.
//!
//! Everything the old global-variable style would have scattered — settings,
//! resolved roots, the mailer, the sweep throttle mark — lives in one
//! [`ServerContext`] value handed to constructors.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::notify::{LogMailer, Mailer};

pub struct ServerContext {
    pub config: Config,
    /// Canonical root of all job directories.
    pub data_root: PathBuf,
    /// Read-only plugin descriptor tree.
    pub plugin_root: PathBuf,
    /// Scratch space for uploads; emptied by every sweep.
    pub temp_root: PathBuf,
    pub mailer: Box<dyn Mailer>,
    /// `DDMMYY` of the last completed sweep; guards the once-per-day rule.
    pub sweep_mark: Mutex<String>,
}

impl ServerContext {
    /// Create data and temp roots if needed and canonicalise all three
    /// roots. The plugin root may be absent (plugin operations then report
    /// not-found).
    pub fn new(
        config: Config,
        data_root: PathBuf,
        plugin_root: PathBuf,
        temp_root: PathBuf,
        mailer: Box<dyn Mailer>,
    ) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&data_root)?;
        std::fs::create_dir_all(&temp_root)?;
        let data_root = data_root.canonicalize()?;
        let temp_root = temp_root.canonicalize()?;
        let plugin_root = plugin_root.canonicalize().unwrap_or(plugin_root);
        debug!(data = %data_root.display(), plugins = %plugin_root.display(), "server context ready");
        Ok(Arc::new(ServerContext {
            config,
            data_root,
            plugin_root,
            temp_root,
            mailer,
            sweep_mark: Mutex::new(String::new()),
        }))
    }

    /// Context with default settings and a logging mailer, rooted in the
    /// given directories. The temp root lands next to the data root so it
    /// never pollutes job listings or size accounting.
    pub fn for_roots(config: Config, data_root: &Path, plugin_root: &Path) -> Result<Arc<Self>> {
        let temp = data_root.with_extension("tmp");
        Self::new(
            config,
            data_root.to_path_buf(),
            plugin_root.to_path_buf(),
            temp,
            Box::new(LogMailer),
        )
    }

    /// Absolute, confined directory of a job id.
    pub fn job_dir(&self, job_id: &str) -> Result<PathBuf> {
        if job_id.is_empty() {
            return Err(Error::NotFound("empty job id".to_string()));
        }
        let dir = crate::paths::confine(self.data_root.join(job_id), &self.data_root)?;
        if !dir.is_dir() {
            return Err(Error::NotFound(format!("job {job_id}")));
        }
        Ok(dir)
    }

    /// Total size in bytes of everything under the data root.
    pub fn data_size(&self) -> u64 {
        dir_size(&self.data_root)
    }
}

/// Recursive byte size of a directory tree; unreadable entries count as 0.
pub fn dir_size(dir: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    let mut total = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            total += dir_size(&path);
        } else if let Ok(meta) = entry.metadata() {
            total += meta.len();
        }
    }
    total
}
