//! A schedulable job: one pipeline step, which may itself be a shell-style
//! pipe of several programs.
//!
//! The job owns its subprocess handles, captures stdout/stderr into files
//! inside the job directory, applies POSIX resource limits to its children,
//! and drives the descriptor through the state machine:
//!
//! ```text
//! INIT ─enqueue─▶ QUEUED ─worker─▶ RUNNING ─exit 0─▶ SUCCESS ─▶ chain / notify
//!                                          └─exit ≠0─▶ FAIL (message)
//!                                          └─terminate─▶ TERMINATED / shutdown sentinel
//! ```
//!
//! All transitions are serialised by the job's exclusive lock; a terminate
//! racing natural completion is decided by whoever takes the lock first,
//! the loser observes the terminal state and backs off.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::descriptor::{now_unix, Descriptor, Status};
use crate::error::{Error, Result};
use crate::notify;
use crate::paths;
use crate::plugins;
use crate::queue::QueueShared;
use crate::server::ServerContext;

/// Poll interval for child completion and termination checks.
const WAIT_POLL: Duration = Duration::from_millis(150);

/// Open-descriptor cap installed into every child.
#[cfg(unix)]
const MAX_OPEN_FILES: u64 = 1000;

/// Fixed niceness offset for job subprocesses.
#[cfg(unix)]
const NICE_OFFSET: libc::c_int = 5;

pub struct Job {
    id: String,
    dir: PathBuf,
    ctx: Arc<ServerContext>,
    queue: Weak<QueueShared>,
    inner: Mutex<JobInner>,
}

#[derive(Default)]
struct JobInner {
    desc: Descriptor,
    children: Vec<Child>,
}

/// Work to perform once the job lock has been released.
enum FollowUp {
    None,
    Chain(String),
    Notify(String),
}

impl Job {
    /// Construct a job from a descriptor already on disk, validate and
    /// resolve its plugin executables, persist INIT, and enqueue it.
    pub fn launch(
        ctx: &Arc<ServerContext>,
        queue: &Arc<QueueShared>,
        job_id: &str,
    ) -> Result<Arc<Job>> {
        let job_id = job_id.trim_matches('/').to_string();
        let dir = ctx.job_dir(&job_id)?;
        let mut desc = Descriptor::load(&dir)?;

        let rows = desc.command_rows()?;
        let mut resolved = Vec::with_capacity(rows.len());
        for row in &rows {
            if !row.plugin.is_empty() {
                plugins::validate(&ctx.plugin_root, &row.plugin)?;
            }
            resolved.push(plugins::resolve_command(
                &ctx.plugin_root,
                &row.plugin,
                &row.program,
            )?);
        }
        desc.program = resolved.join("|");
        if cfg!(windows) {
            // Client parameters use forward slashes; keep relative
            // references working on the host separator.
            desc.parameters = desc.parameters.replace("../", "..\\");
        }
        if desc.id.is_empty() {
            desc.id = job_id.clone();
        }
        // A restarted job may have had empty captures pruned away.
        if desc.stdout.is_empty() {
            desc.stdout = crate::descriptor::STDOUT_FILE.to_string();
        }
        if desc.logfile.is_empty() {
            desc.logfile = crate::descriptor::LOGFILE_FILE.to_string();
        }
        desc.status = Some(Status::Init);
        desc.completed = None;
        desc.updated = Some(now_unix());
        desc.flush(&dir)?;

        let job = Arc::new(Job {
            id: job_id,
            dir,
            ctx: ctx.clone(),
            queue: Arc::downgrade(queue),
            inner: Mutex::new(JobInner {
                desc,
                children: Vec::new(),
            }),
        });
        queue.enqueue(job.clone())?;
        Ok(job)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Snapshot of the current descriptor.
    pub fn descriptor(&self) -> Descriptor {
        self.inner.lock().desc.clone()
    }

    /// Persist the QUEUED state. Called by the queue as part of admission.
    pub(crate) fn mark_queued(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.desc.status().is_terminal() {
            return Ok(());
        }
        inner.desc.status = Some(Status::Queued);
        inner.desc.updated = Some(now_unix());
        inner.desc.flush(&self.dir)
    }

    /// Run the step to completion. Worker-thread entry point; errors are
    /// folded into the descriptor state, never propagated.
    pub fn process(&self) {
        if let Err(e) = self.run() {
            warn!(id = %self.id, error = %e, "job processing error");
            let follow = {
                let mut inner = self.inner.lock();
                self.finalize(&mut inner, -1).unwrap_or(FollowUp::None)
            };
            self.follow_up(follow);
        }
    }

    fn run(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.desc.status().is_terminal() {
            return Ok(());
        }

        let rows = inner.desc.command_rows()?;
        let stdout_path = paths::confine(self.dir.join(&inner.desc.stdout), &self.dir)?;
        let log_path = paths::confine(self.dir.join(&inner.desc.logfile), &self.dir)?;
        let out_file = File::create(&stdout_path)?;
        let mut log_file = File::create(&log_path)?;

        match self.spawn_chain(&rows, &out_file, &log_file) {
            Ok(children) => {
                inner.children = children;
                inner.desc.status = Some(Status::Running);
                inner.desc.updated = Some(now_unix());
                inner.desc.flush(&self.dir)?;
                debug!(id = %self.id, processes = rows.len(), "job running");
            }
            Err(e) => {
                // Launch failure: record it in the error log and fail the
                // job without ever reaching RUNNING.
                let _ = writeln!(log_file, "Server error: {e}");
                warn!(id = %self.id, error = %e, "launch failure");
                let follow = self.finalize(&mut inner, -1)?;
                drop(inner);
                self.follow_up(follow);
                return Ok(());
            }
        }
        drop(inner);

        loop {
            let follow = {
                let mut inner = self.inner.lock();
                if inner.desc.status().is_terminal() {
                    // Terminated from outside; clean up whatever is left.
                    reap(&mut inner.children);
                    return Ok(());
                }
                let last = inner
                    .children
                    .last_mut()
                    .ok_or_else(|| Error::Malformed("job has no children".to_string()))?;
                match last.try_wait() {
                    Ok(Some(status)) => {
                        let rc = exit_code(&status);
                        reap(&mut inner.children);
                        Some(self.finalize(&mut inner, rc)?)
                    }
                    Ok(None) => None,
                    Err(e) => {
                        warn!(id = %self.id, error = %e, "wait failed");
                        reap(&mut inner.children);
                        Some(self.finalize(&mut inner, -1)?)
                    }
                }
            };
            if let Some(follow) = follow {
                self.follow_up(follow);
                return Ok(());
            }
            std::thread::sleep(WAIT_POLL);
        }
    }

    /// Launch the `|`-chained processes of this step. Child k's stdout
    /// feeds child k+1's stdin; the final stdout and every stderr go to the
    /// capture files. The parent's copy of each intermediate pipe end is
    /// consumed by the next spawn, so a dead downstream propagates EOF and
    /// SIGPIPE instead of stalling the chain.
    fn spawn_chain(
        &self,
        rows: &[crate::descriptor::CommandRow],
        out_file: &File,
        log_file: &File,
    ) -> Result<Vec<Child>> {
        let mut children: Vec<Child> = Vec::with_capacity(rows.len());
        let mut upstream: Option<std::process::ChildStdout> = None;

        for (i, row) in rows.iter().enumerate() {
            let last = i + 1 == rows.len();
            let mut argv = row.program.split_whitespace();
            let binary = argv
                .next()
                .ok_or_else(|| Error::Malformed("empty program".to_string()))?;

            let mut cmd = Command::new(binary);
            cmd.args(argv);
            cmd.args(row.parameters.split_whitespace());
            cmd.current_dir(&self.dir);
            cmd.stdin(match upstream.take() {
                Some(pipe) => Stdio::from(pipe),
                None => Stdio::null(),
            });
            cmd.stdout(if last {
                Stdio::from(out_file.try_clone()?)
            } else {
                Stdio::piped()
            });
            cmd.stderr(Stdio::from(log_file.try_clone()?));
            self.apply_limits(&mut cmd);

            let mut child = cmd.spawn().map_err(|e| {
                // A downstream spawn failure leaves earlier children
                // running; stop them before reporting.
                reap(&mut children);
                Error::Io(std::io::Error::new(
                    e.kind(),
                    format!("cannot start '{binary}': {e}"),
                ))
            })?;
            if !last {
                upstream = child.stdout.take();
            }
            children.push(child);
        }
        Ok(children)
    }

    /// Install per-child resource caps and scheduling niceness. Applied
    /// between fork and exec so the parent and its worker threads stay
    /// unlimited; children inherit everything, including the fresh process
    /// group used for termination.
    #[cfg(unix)]
    fn apply_limits(&self, cmd: &mut Command) {
        use std::os::unix::process::CommandExt;

        let cpu_secs = (self.ctx.config.cpulimit > 0).then(|| self.ctx.config.cpulimit * 3600);
        // RLIMIT_FSIZE is in bytes, matching the filelimit unit.
        let file_bytes = (self.ctx.config.filelimit > 0).then_some(self.ctx.config.filelimit);

        unsafe {
            cmd.pre_exec(move || {
                libc::setpgid(0, 0);
                if let Some(secs) = cpu_secs {
                    let lim = libc::rlimit {
                        rlim_cur: secs as libc::rlim_t,
                        rlim_max: secs as libc::rlim_t,
                    };
                    libc::setrlimit(libc::RLIMIT_CPU, &lim);
                }
                if let Some(bytes) = file_bytes {
                    let lim = libc::rlimit {
                        rlim_cur: bytes as libc::rlim_t,
                        rlim_max: bytes as libc::rlim_t,
                    };
                    libc::setrlimit(libc::RLIMIT_FSIZE, &lim);
                }
                let lim = libc::rlimit {
                    rlim_cur: MAX_OPEN_FILES as libc::rlim_t,
                    rlim_max: MAX_OPEN_FILES as libc::rlim_t,
                };
                libc::setrlimit(libc::RLIMIT_NOFILE, &lim);
                libc::nice(NICE_OFFSET);
                Ok(())
            });
        }
    }

    #[cfg(not(unix))]
    fn apply_limits(&self, _cmd: &mut Command) {}

    /// Terminate the job: signal the children's process groups and set the
    /// terminal status. A no-op on an already-terminal job, except that the
    /// shutdown sentinel may overwrite any status.
    pub fn terminate(&self, shutdown: bool) {
        let mut inner = self.inner.lock();
        if inner.desc.status().is_terminal() {
            if shutdown && inner.desc.status() != Status::ShutdownTerm {
                inner.desc.status = Some(Status::ShutdownTerm);
                let _ = inner.desc.flush(&self.dir);
            }
            return;
        }

        info!(id = %self.id, shutdown, "terminate");
        for child in &inner.children {
            signal_terminate(child);
        }
        let now = now_unix();
        inner.desc.completed = Some(now);
        inner.desc.updated = Some(now);
        inner.desc.status = Some(if shutdown {
            Status::ShutdownTerm
        } else {
            Status::Terminated
        });
        if let Err(e) = inner.desc.flush(&self.dir) {
            warn!(id = %self.id, error = %e, "could not persist terminated status");
        }
    }

    /// Record the terminal state for exit code `rc`. Idempotent. On
    /// success, prunes empty outputs and reports what has to happen next;
    /// the caller performs the follow-up after releasing the job lock so
    /// chaining never blocks a concurrent terminate.
    fn finalize(&self, inner: &mut JobInner, rc: i32) -> Result<FollowUp> {
        if inner.desc.status().is_terminal() {
            return Ok(FollowUp::None);
        }
        let now = now_unix();
        inner.desc.completed = Some(now);
        inner.desc.updated = Some(now);
        inner.desc.status = Some(Status::from_exit_code(rc));
        if rc == 0 {
            prune_outputs(&self.dir, &mut inner.desc);
        }
        inner.desc.flush(&self.dir)?;
        info!(id = %self.id, rc, "job finished");

        if rc == 0 {
            if !inner.desc.nextstep.is_empty() {
                return Ok(FollowUp::Chain(inner.desc.nextstep.clone()));
            }
            if !inner.desc.notify.is_empty() {
                return Ok(FollowUp::Notify(inner.desc.notify.clone()));
            }
        }
        Ok(FollowUp::None)
    }

    fn follow_up(&self, follow: FollowUp) {
        match follow {
            FollowUp::None => {}
            FollowUp::Chain(next_id) => self.chain_successor(&next_id),
            FollowUp::Notify(first_id) => self.send_completion_mail(&first_id),
        }
    }

    fn chain_successor(&self, next_id: &str) {
        let Some(queue) = self.queue.upgrade() else {
            warn!(id = %self.id, next = %next_id, "queue gone, cannot chain");
            return;
        };
        match Job::launch(&self.ctx, &queue, next_id) {
            Ok(_) => debug!(id = %self.id, next = %next_id, "chained next step"),
            Err(e) => warn!(id = %self.id, next = %next_id, error = %e, "chaining failed"),
        }
    }

    /// The `notify` field names the pipeline's first step; the destination
    /// address lives in that step's descriptor.
    fn send_completion_mail(&self, first_id: &str) {
        let first_dir = match self.ctx.job_dir(first_id) {
            Ok(d) => d,
            Err(e) => {
                warn!(id = %self.id, notify = %first_id, error = %e, "notify target missing");
                return;
            }
        };
        let first = match Descriptor::load(&first_dir) {
            Ok(d) => d,
            Err(e) => {
                warn!(id = %self.id, notify = %first_id, error = %e, "notify descriptor unreadable");
                return;
            }
        };
        if first.email.is_empty() {
            return;
        }
        let (subject, body) =
            notify::completion_message(&self.ctx.config.hostname, first_id, &first.name);
        if let Err(e) = self.ctx.mailer.send(&first.email, &subject, &body) {
            warn!(id = %self.id, error = %e, "completion mail failed");
        }
    }
}

/// Delete zero-sized capture files (clearing their fields) and drop
/// declared outfiles that were never produced.
fn prune_outputs(dir: &Path, desc: &mut Descriptor) {
    for field in [&mut desc.stdout, &mut desc.logfile] {
        if field.is_empty() {
            continue;
        }
        let path = dir.join(field.as_str());
        match std::fs::metadata(&path) {
            Ok(meta) if meta.len() == 0 => {
                let _ = std::fs::remove_file(&path);
                field.clear();
            }
            Err(_) => field.clear(),
            _ => {}
        }
    }
    if !desc.outfiles.is_empty() {
        let kept: Vec<&str> = desc
            .outfiles
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty() && dir.join(name).exists())
            .collect();
        desc.outfiles = kept.join(",");
    }
}

/// Reap all children: anything still running is killed, everything is
/// waited on so no zombies outlive the job.
fn reap(children: &mut Vec<Child>) {
    for child in children.iter_mut() {
        match child.try_wait() {
            Ok(Some(_)) => {}
            _ => {
                let _ = child.kill();
                let _ = child.wait();
            }
        }
    }
    children.clear();
}

/// Exit code with the POSIX signal convention: a child killed by signal N
/// reports −N.
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        match status.code() {
            Some(code) => code,
            None => -status.signal().unwrap_or(1),
        }
    }
    #[cfg(not(unix))]
    {
        status.code().unwrap_or(-1)
    }
}

/// Send SIGTERM to the child's process group (each child starts its own
/// via `setpgid` in `pre_exec`), falling back to the single process.
#[cfg(unix)]
fn signal_terminate(child: &Child) {
    let pid = child.id() as libc::pid_t;
    // SAFETY: kill(2) accepts any pid; a stale pid yields ESRCH.
    let ret = unsafe { libc::kill(-pid, libc::SIGTERM) };
    if ret != 0 {
        unsafe { libc::kill(pid, libc::SIGTERM) };
    }
}

#[cfg(not(unix))]
fn signal_terminate(_child: &Child) {
    // Windows has no process groups to signal; the reap pass kills the
    // direct children instead.
}
