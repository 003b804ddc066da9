//! Server settings.
//!
//! Values live in a `[server_settings]` table of a TOML file. Every field
//! has a default so a missing file yields a usable local configuration.
//!
//! Resolution order for the data root:
//!   1. `--datadir` CLI flag
//!   2. `PLINE_DATA_DIR` environment variable
//!   3. `datadir` in the settings file
//!   4. `~/.local/share/pline/data` (platform data dir on Windows)

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::BaseDirs;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root directory for job data.
    pub datadir: Option<PathBuf>,
    /// Root directory of the plugin descriptor tree.
    pub plugindir: Option<PathBuf>,
    /// Listen port for the request dispatch layer.
    pub serverport: u16,
    /// Worker pool size; 0 = host CPU count.
    pub workerthreads: usize,
    /// Per-job CPU time limit in hours; 0 = unlimited.
    pub cpulimit: u64,
    /// Total data-root size quota in kilobytes; 0 = unlimited.
    pub datalimit: u64,
    /// Per-file size cap in bytes for job subprocesses; 0 = unlimited.
    pub filelimit: u64,
    /// Pending-queue capacity; 0 = unbounded.
    pub queuelimit: usize,
    /// Write server logs to a file instead of stderr.
    pub logfile: bool,
    pub debug: bool,
    /// Bind to localhost only.
    pub local: bool,
    /// SMTP credentials as `user:password`; empty = notifications disabled.
    pub gmail: String,
    pub openbrowser: bool,
    /// Public hostname used in notification links.
    pub hostname: String,
    /// Wrap each top-level job directory in a random opaque id.
    pub dataids: bool,
    /// Job expiry in whole days; 0 = never expire.
    pub dataexpire: u64,
    /// Extra text appended to expiry reminder emails.
    pub expiremsg: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            datadir: None,
            plugindir: None,
            serverport: 8000,
            workerthreads: 0,
            cpulimit: 0,
            datalimit: 0,
            filelimit: 0,
            queuelimit: 0,
            logfile: false,
            debug: false,
            local: true,
            gmail: String::new(),
            openbrowser: false,
            hostname: String::from("localhost"),
            dataids: false,
            dataexpire: 0,
            expiremsg: String::new(),
        }
    }
}

impl Config {
    /// Parse the `[server_settings]` table of a TOML settings file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read settings file {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("parse settings file {}", path.display()))
    }

    fn parse(raw: &str) -> Result<Self> {
        let table: toml::Table = raw.parse().context("settings are not valid TOML")?;
        match table.get("server_settings") {
            Some(section) => Ok(section.clone().try_into().context("bad server_settings")?),
            None => Ok(Config::default()),
        }
    }

    /// Effective worker pool size.
    pub fn workers(&self) -> usize {
        if self.workerthreads == 0 {
            num_cpus::get()
        } else {
            self.workerthreads
        }
    }

    /// Quota in bytes, `None` when unlimited.
    pub fn data_quota_bytes(&self) -> Option<u64> {
        (self.datalimit > 0).then(|| self.datalimit * 1024)
    }

    /// True when SMTP notifications are configured.
    pub fn notifications_enabled(&self) -> bool {
        !self.gmail.is_empty()
    }
}

/// Resolve the data root following the priority chain.
pub fn resolve_data_root(cli_dir: Option<&str>, config: &Config) -> PathBuf {
    if let Some(dir) = cli_dir {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("PLINE_DATA_DIR") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    if let Some(dir) = &config.datadir {
        return dir.clone();
    }
    if let Some(base_dirs) = BaseDirs::new() {
        #[cfg(windows)]
        let base = base_dirs.data_local_dir().to_path_buf();
        #[cfg(not(windows))]
        let base = base_dirs.home_dir().join(".local").join("share");
        return base.join("pline").join("data");
    }
    PathBuf::from("pline-data")
}
