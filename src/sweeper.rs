//! Cleanup sweeper: enforces data expiry and the disk quota.
//!
//! Runs at most once per calendar day, plus unconditionally whenever the
//! data root grows past the configured quota. Per-entry failures are
//! logged and never abort the pass.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;
use tracing::{debug, info, warn};

use crate::descriptor::{now_unix, Descriptor, DESCRIPTOR_FILE};
use crate::notify;
use crate::queue::QueueShared;
use crate::server::{dir_size, ServerContext};

const SECONDS_PER_DAY: i64 = 86_400;

/// What one pass did; used for logging and assertions.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub temp_cleared: usize,
    pub removed: Vec<String>,
    pub reminded: usize,
}

/// Run a sweep when one is due: the calendar day changed since the last
/// pass, or the data root exceeds its quota. Returns the report when a
/// sweep ran.
pub fn maybe_sweep(ctx: &Arc<ServerContext>, queue: &Arc<QueueShared>) -> Option<SweepReport> {
    let today = Local::now().format("%d%m%y").to_string();
    let oversized = ctx
        .config
        .data_quota_bytes()
        .map(|quota| ctx.data_size() > quota)
        .unwrap_or(false);
    {
        let mark = ctx.sweep_mark.lock();
        if *mark == today && !oversized {
            return None;
        }
    }
    let report = sweep(ctx, queue);
    *ctx.sweep_mark.lock() = today;
    Some(report)
}

/// One unconditional cleanup pass.
pub fn sweep(ctx: &Arc<ServerContext>, queue: &Arc<QueueShared>) -> SweepReport {
    let mut report = SweepReport {
        temp_cleared: clear_temp(&ctx.temp_root),
        ..SweepReport::default()
    };

    let quota = ctx.config.data_quota_bytes();
    let expire = ctx.config.dataexpire;
    let mut size = dir_size(&ctx.data_root);
    let oversized = quota.map(|q| size > q).unwrap_or(false);
    if expire == 0 && !oversized {
        return report;
    }

    for entry in list_oldest_first(&ctx.data_root) {
        let Some(swept) = SweepEntry::open(&ctx.data_root, &entry) else {
            continue;
        };
        if swept.desc.keeps_data() {
            debug!(id = %swept.id, "keepData set, skipping");
            continue;
        }

        let age = swept.age_days();
        let expired = expire > 0 && age > expire as i64;
        let still_oversized = quota.map(|q| size > q).unwrap_or(false);

        if expired || still_oversized {
            queue.terminate(&swept.id, false);
            match std::fs::remove_dir_all(&entry) {
                Ok(()) => {
                    info!(id = %swept.id, age, expired, "removed job directory");
                    report.removed.push(swept.id);
                    // Re-check after each deletion so eviction stops as
                    // soon as the quota is satisfied.
                    size = dir_size(&ctx.data_root);
                }
                Err(e) => warn!(id = %swept.id, error = %e, "could not remove job directory"),
            }
        } else if expire > 0
            && age == expire as i64 - 1
            && ctx.config.notifications_enabled()
            && !swept.desc.email.is_empty()
        {
            let (subject, body) = notify::expiry_message(
                &ctx.config.hostname,
                &swept.id,
                &ctx.config.expiremsg,
            );
            match ctx.mailer.send(&swept.desc.email, &subject, &body) {
                Ok(()) => report.reminded += 1,
                Err(e) => warn!(id = %swept.id, error = %e, "expiry reminder failed"),
            }
        }
    }
    info!(
        removed = report.removed.len(),
        reminded = report.reminded,
        "sweep finished"
    );
    report
}

/// Delete regular files directly under the temp root (upload leftovers).
fn clear_temp(temp_root: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(temp_root) else {
        return 0;
    };
    let mut cleared = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_file() {
            match std::fs::remove_file(&path) {
                Ok(()) => cleared += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "could not clear temp file"),
            }
        }
    }
    cleared
}

/// Immediate children of the data root, oldest modification first, so
/// quota eviction drops the oldest jobs.
fn list_oldest_first(data_root: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(data_root) else {
        return Vec::new();
    };
    let mut dirs: Vec<(std::time::SystemTime, PathBuf)> = entries
        .flatten()
        .filter(|e| e.path().is_dir())
        .map(|e| {
            let mtime = e
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
            (mtime, e.path())
        })
        .collect();
    dirs.sort();
    dirs.into_iter().map(|(_, p)| p).collect()
}

/// A sweepable data-root entry together with its descriptor. With opaque
/// ids enabled the descriptor lives one level down inside the wrapper
/// directory; the wrapper is still the unit of removal.
struct SweepEntry {
    id: String,
    desc_path: PathBuf,
    desc: Descriptor,
}

impl SweepEntry {
    fn open(data_root: &Path, entry: &Path) -> Option<SweepEntry> {
        let direct = entry.join(DESCRIPTOR_FILE);
        let desc_dir = if direct.is_file() {
            entry.to_path_buf()
        } else {
            wrapped_job_dir(entry)?
        };
        let desc = Descriptor::load(&desc_dir).ok()?;
        let id = desc_dir
            .strip_prefix(data_root)
            .ok()?
            .to_string_lossy()
            .replace('\\', "/");
        Some(SweepEntry {
            id,
            desc_path: desc_dir.join(DESCRIPTOR_FILE),
            desc,
        })
    }

    /// Whole days since the descriptor file was last written.
    fn age_days(&self) -> i64 {
        let mtime = std::fs::metadata(&self.desc_path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or_else(now_unix);
        (now_unix() - mtime) / SECONDS_PER_DAY
    }
}

/// Opaque-id wrappers hold a single job directory with the descriptor.
fn wrapped_job_dir(entry: &Path) -> Option<PathBuf> {
    let mut subdirs: Vec<PathBuf> = std::fs::read_dir(entry)
        .ok()?
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    if subdirs.len() != 1 {
        return None;
    }
    let inner = subdirs.remove(0);
    inner.join(DESCRIPTOR_FILE).is_file().then_some(inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::notify::RecordingMailer;
    use crate::queue::WorkQueue;
    use serde_json::Value;

    fn context_with(config: Config, mailer: RecordingMailer) -> (tempfile::TempDir, Arc<ServerContext>) {
        let tmp = tempfile::tempdir().unwrap();
        let data = tmp.path().join("data");
        let plugins = tmp.path().join("plugins");
        std::fs::create_dir_all(&plugins).unwrap();
        let ctx = ServerContext::new(
            config,
            data,
            plugins,
            tmp.path().join("tmp"),
            Box::new(mailer),
        )
        .unwrap();
        (tmp, ctx)
    }

    fn seed_job(ctx: &Arc<ServerContext>, name: &str, payload_bytes: usize) -> PathBuf {
        let dir = ctx.data_root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        let desc = Descriptor {
            id: name.to_string(),
            name: name.to_string(),
            created: Some(now_unix()),
            ..Descriptor::default()
        };
        desc.flush(&dir).unwrap();
        if payload_bytes > 0 {
            std::fs::write(dir.join("payload.bin"), vec![0u8; payload_bytes]).unwrap();
        }
        dir
    }

    #[test]
    fn clears_temp_files_only() {
        let (_tmp, ctx) = context_with(Config::default(), RecordingMailer::default());
        std::fs::write(ctx.temp_root.join("upload1"), b"x").unwrap();
        std::fs::write(ctx.temp_root.join("upload2"), b"y").unwrap();
        std::fs::create_dir(ctx.temp_root.join("subdir")).unwrap();

        let queue = WorkQueue::start(&ctx);
        let report = sweep(&ctx, &queue.handle());
        assert_eq!(report.temp_cleared, 2);
        assert!(ctx.temp_root.join("subdir").is_dir());
        queue.stop();
    }

    #[test]
    fn quota_evicts_oldest_but_keeps_keep_data() {
        let config = Config {
            datalimit: 1, // 1 kB quota
            ..Config::default()
        };
        let (_tmp, ctx) = context_with(config, RecordingMailer::default());

        let old = seed_job(&ctx, "old", 4096);
        std::thread::sleep(std::time::Duration::from_millis(20));
        let kept = seed_job(&ctx, "kept", 4096);
        let mut desc = Descriptor::load(&kept).unwrap();
        desc.keep_data = Some(Value::from(true));
        desc.flush(&kept).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        seed_job(&ctx, "new", 16);

        let queue = WorkQueue::start(&ctx);
        let report = sweep(&ctx, &queue.handle());
        queue.stop();

        assert!(!old.exists(), "oldest non-keepData entry should be evicted");
        assert!(kept.exists(), "keepData entry survives any quota pressure");
        assert!(report.removed.contains(&"old".to_string()));
    }

    #[test]
    fn entries_without_descriptor_are_skipped() {
        let config = Config {
            datalimit: 1,
            ..Config::default()
        };
        let (_tmp, ctx) = context_with(config, RecordingMailer::default());
        let stray = ctx.data_root.join("stray");
        std::fs::create_dir_all(&stray).unwrap();
        std::fs::write(stray.join("big.bin"), vec![0u8; 4096]).unwrap();

        let queue = WorkQueue::start(&ctx);
        sweep(&ctx, &queue.handle());
        queue.stop();
        assert!(stray.exists());
    }

    #[test]
    fn fresh_jobs_survive_expiry_config() {
        let config = Config {
            dataexpire: 7,
            ..Config::default()
        };
        let (_tmp, ctx) = context_with(config, RecordingMailer::default());
        let dir = seed_job(&ctx, "young", 64);

        let queue = WorkQueue::start(&ctx);
        let report = sweep(&ctx, &queue.handle());
        queue.stop();
        assert!(dir.exists());
        assert!(report.removed.is_empty());
    }

    #[test]
    fn reminder_sent_one_day_before_expiry() {
        // dataexpire = 1 makes a fresh job (age 0) fall into the
        // age == expire - 1 reminder window.
        let config = Config {
            dataexpire: 1,
            gmail: "user:secret".to_string(),
            hostname: "pline.example.org".to_string(),
            ..Config::default()
        };
        let mailer = RecordingMailer::default();
        let (_tmp, ctx) = context_with(config, mailer.clone());
        let dir = seed_job(&ctx, "expiring", 64);
        let mut desc = Descriptor::load(&dir).unwrap();
        desc.email = "user@example.org".to_string();
        desc.flush(&dir).unwrap();

        let queue = WorkQueue::start(&ctx);
        let report = sweep(&ctx, &queue.handle());
        queue.stop();

        assert_eq!(report.reminded, 1);
        let sent = mailer.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "user@example.org");
        assert!(sent[0].2.contains("24 hours"));
        assert!(dir.exists());
    }

    #[test]
    fn sweep_is_idempotent() {
        let config = Config {
            datalimit: 1,
            ..Config::default()
        };
        let (_tmp, ctx) = context_with(config, RecordingMailer::default());
        seed_job(&ctx, "only", 4096);

        let queue = WorkQueue::start(&ctx);
        let first = sweep(&ctx, &queue.handle());
        let second = sweep(&ctx, &queue.handle());
        queue.stop();

        assert_eq!(first.removed, vec!["only".to_string()]);
        assert!(second.removed.is_empty());
        assert_eq!(second.reminded, 0);
    }

    #[test]
    fn daily_throttle_skips_second_pass() {
        let (_tmp, ctx) = context_with(Config::default(), RecordingMailer::default());
        let queue = WorkQueue::start(&ctx);
        assert!(maybe_sweep(&ctx, &queue.handle()).is_some());
        assert!(maybe_sweep(&ctx, &queue.handle()).is_none());
        queue.stop();
    }

    #[test]
    fn opaque_wrapper_entries_resolve_their_descriptor() {
        let config = Config {
            datalimit: 1,
            ..Config::default()
        };
        let (_tmp, ctx) = context_with(config, RecordingMailer::default());
        let inner = ctx.data_root.join("01hwrapperid/align");
        std::fs::create_dir_all(&inner).unwrap();
        let desc = Descriptor {
            id: "01hwrapperid/align".to_string(),
            ..Descriptor::default()
        };
        desc.flush(&inner).unwrap();
        std::fs::write(inner.join("big.bin"), vec![0u8; 4096]).unwrap();

        let queue = WorkQueue::start(&ctx);
        let report = sweep(&ctx, &queue.handle());
        queue.stop();
        assert_eq!(report.removed, vec!["01hwrapperid/align".to_string()]);
        assert!(!ctx.data_root.join("01hwrapperid").exists());
    }
}
