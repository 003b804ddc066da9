//! Request-facing operations and their JSON envelopes.
//!
//! This is the fixed contract the request dispatch layer (HTTP or CLI)
//! calls into: it validates inputs, invokes the engine, and serialises
//! state. Nothing in here raises across that boundary — errors become
//! [`ErrorResponse`] values with an HTTP-style status hint.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::descriptor::Descriptor;
use crate::error::{Error, Result};
use crate::job::Job;
use crate::pipeline::{self, PipelineRequest, StagedFile};
use crate::plugins;
use crate::queue::{QueueShared, WorkQueue};
use crate::server::ServerContext;
use crate::sweeper::{self, SweepReport};

/// Serialize `value` as a single JSON line on stdout. The one place where
/// response output is written, keeping the stdout-is-JSON-only contract.
fn print_json_to_stdout(value: &impl Serialize) {
    println!(
        "{}",
        serde_json::to_string(value).expect("JSON serialization failed")
    );
}

/// Envelope for every successful response.
#[derive(Debug, Serialize)]
pub struct Response<T: Serialize> {
    pub ok: bool,
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(flatten)]
    pub data: T,
}

impl<T: Serialize> Response<T> {
    pub fn new(kind: &'static str, data: T) -> Self {
        Response {
            ok: true,
            kind,
            data,
        }
    }

    pub fn print(&self) {
        print_json_to_stdout(self);
    }
}

/// Envelope for error responses.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub ok: bool,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    /// HTTP-style status hint for the dispatch layer.
    pub http: u16,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>, http: u16) -> Self {
        ErrorResponse {
            ok: false,
            kind: "error",
            error: ErrorDetail {
                code: code.into(),
                message: message.into(),
                http,
            },
        }
    }

    pub fn from_error(e: &Error) -> Self {
        ErrorResponse {
            ok: false,
            kind: "error",
            error: ErrorDetail {
                code: e.code().to_string(),
                message: e.to_string(),
                http: e.http_hint(),
            },
        }
    }

    pub fn print(&self) {
        print_json_to_stdout(self);
    }
}

// ---------- Operation payloads ----------

#[derive(Debug, Serialize)]
pub struct CheckServerData {
    pub status: &'static str,
    pub version: &'static str,
    pub datalimit: u64,
    pub cpulimit: u64,
    pub dataexpire: u64,
    /// Total bytes currently under the data root.
    pub datasize: u64,
    /// Ids of queued or running jobs.
    pub jobs: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct PluginsData {
    pub plugins: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct StatusData {
    pub jobs: Vec<Value>,
}

#[derive(Debug, Serialize)]
pub struct RunData {
    /// First step's job id; absent for an empty pipeline.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TerminateData {
    pub id: String,
}

#[derive(Debug, Serialize)]
pub struct RmdirData {
    pub id: String,
}

#[derive(Debug, Serialize)]
pub struct SweepData {
    pub removed: Vec<String>,
    pub reminded: usize,
    pub temp_cleared: usize,
}

impl From<SweepReport> for SweepData {
    fn from(r: SweepReport) -> Self {
        SweepData {
            removed: r.removed,
            reminded: r.reminded,
            temp_cleared: r.temp_cleared,
        }
    }
}

/// The running engine: context plus work queue, exposing the adapter
/// operations.
pub struct Server {
    ctx: Arc<ServerContext>,
    queue: WorkQueue,
}

impl Server {
    pub fn start(ctx: Arc<ServerContext>) -> Server {
        let queue = WorkQueue::start(&ctx);
        Server { ctx, queue }
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    pub fn queue(&self) -> Arc<QueueShared> {
        self.queue.handle()
    }

    /// Terminate every tracked job with the shutdown sentinel and join the
    /// workers.
    pub fn stop(&self) {
        self.queue.stop();
    }

    /// Snapshot of server health and limits.
    pub fn checkserver(&self) -> CheckServerData {
        CheckServerData {
            status: "running",
            version: env!("CARGO_PKG_VERSION"),
            datalimit: self.ctx.config.datalimit,
            cpulimit: self.ctx.config.cpulimit,
            dataexpire: self.ctx.config.dataexpire,
            datasize: self.ctx.data_size(),
            jobs: self.queue.handle().tracked_ids(),
        }
    }

    /// Plugin descriptor paths discovered under the plugin root.
    pub fn plugins(&self) -> Result<PluginsData> {
        Ok(PluginsData {
            plugins: plugins::discover(&self.ctx.plugin_root)?,
        })
    }

    /// Descriptor + log tail for each id in a comma-separated list. A
    /// missing job yields an error entry instead of failing the whole
    /// query.
    pub fn status(&self, ids: &str) -> StatusData {
        let queue = self.queue.handle();
        let mut jobs = Vec::new();
        for id in ids.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            jobs.push(self.status_entry(&queue, id));
        }
        StatusData { jobs }
    }

    fn status_entry(&self, queue: &Arc<QueueShared>, id: &str) -> Value {
        let looked_up = self
            .ctx
            .job_dir(id)
            .and_then(|dir| Descriptor::load(&dir).map(|d| (dir, d)));
        match looked_up {
            Ok((dir, mut desc)) => {
                desc.attach_log_tail(&dir, queue.contains(id));
                let mut value = serde_json::to_value(&desc).unwrap_or_else(|_| Value::Null);
                if let Value::Object(map) = &mut value {
                    map.insert("id".to_string(), Value::from(id));
                    // Explicit even for descriptors with no stored status
                    // (a replaced corrupt descriptor is deemed failed).
                    map.insert("status".to_string(), desc.status().as_value());
                    if !desc.log.is_empty() {
                        map.insert("log".to_string(), Value::from(desc.log.clone()));
                    }
                }
                value
            }
            Err(e) => {
                let mut map = serde_json::Map::new();
                map.insert("id".to_string(), Value::from(id));
                map.insert("error".to_string(), Value::from(e.to_string()));
                Value::Object(map)
            }
        }
    }

    /// Create the step directories for a submitted pipeline and enqueue
    /// its first step.
    pub fn run(&self, raw_pipeline: &str, files: &[StagedFile]) -> Result<RunData> {
        let request = PipelineRequest::parse(raw_pipeline)?;
        let id = pipeline::submit(&self.ctx, &self.queue.handle(), &request, files)?;
        Ok(RunData { id })
    }

    /// Terminate a job and its queued successors.
    pub fn terminate(&self, id: &str) -> Result<TerminateData> {
        let id = id.trim_matches('/');
        self.ctx.job_dir(id)?;
        pipeline::terminate_chain(&self.ctx, &self.queue.handle(), id);
        Ok(TerminateData { id: id.to_string() })
    }

    /// Terminate, then recursively remove the job directory (and a now-empty
    /// opaque wrapper above it).
    pub fn rmdir(&self, id: &str) -> Result<RmdirData> {
        let id = id.trim_matches('/');
        let dir = self.ctx.job_dir(id)?;
        pipeline::terminate_chain(&self.ctx, &self.queue.handle(), id);
        std::fs::remove_dir_all(&dir)?;
        info!(id = %id, "removed job directory");

        // Opaque-id wrappers hold a single job; drop empty ones so the
        // data root does not accumulate husks.
        let mut parent = dir.parent().map(|p| p.to_path_buf());
        while let Some(p) = parent {
            if p == self.ctx.data_root {
                break;
            }
            let empty = std::fs::read_dir(&p).map(|mut d| d.next().is_none()).unwrap_or(false);
            if !empty {
                break;
            }
            if let Err(e) = std::fs::remove_dir(&p) {
                warn!(path = %p.display(), error = %e, "could not remove empty parent");
                break;
            }
            parent = p.parent().map(|q| q.to_path_buf());
        }
        Ok(RmdirData { id: id.to_string() })
    }

    /// Construct a fresh job from an existing descriptor.
    pub fn restart(&self, id: &str) -> Result<RunData> {
        let job = Job::launch(&self.ctx, &self.queue.handle(), id)?;
        Ok(RunData {
            id: Some(job.id().to_string()),
        })
    }

    /// Run the cleanup pass unconditionally.
    pub fn sweep(&self) -> SweepData {
        sweeper::sweep(&self.ctx, &self.queue.handle()).into()
    }

    /// Run the cleanup pass if the daily mark or the quota says one is due.
    pub fn maybe_sweep(&self) -> Option<SweepData> {
        sweeper::maybe_sweep(&self.ctx, &self.queue.handle()).map(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::descriptor::Status;
    use std::time::Duration;

    fn server() -> (tempfile::TempDir, Server) {
        let tmp = tempfile::tempdir().unwrap();
        let data = tmp.path().join("data");
        let plugins_dir = tmp.path().join("plugins");
        std::fs::create_dir_all(&plugins_dir).unwrap();
        let cfg = Config {
            workerthreads: 2,
            ..Config::default()
        };
        let ctx = ServerContext::for_roots(cfg, &data, &plugins_dir).unwrap();
        (tmp, Server::start(ctx))
    }

    fn wait_terminal(server: &Server, id: &str) -> Status {
        let dir = server.context().data_root.join(id);
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        loop {
            if let Ok(desc) = Descriptor::load(&dir) {
                if desc.status().is_terminal() {
                    return desc.status();
                }
            }
            assert!(std::time::Instant::now() < deadline, "job {id} did not finish");
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    #[test]
    fn checkserver_reports_limits_and_version() {
        let (_tmp, server) = server();
        let data = server.checkserver();
        assert_eq!(data.status, "running");
        assert_eq!(data.version, env!("CARGO_PKG_VERSION"));
        assert!(data.jobs.is_empty());
        server.stop();
    }

    #[test]
    fn plugins_lists_descriptors() {
        let (_tmp, server) = server();
        let dir = server.context().plugin_root.join("tool");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("plugin.json"), b"{}").unwrap();
        let data = server.plugins().unwrap();
        assert_eq!(data.plugins, vec!["tool/plugin.json".to_string()]);
        server.stop();
    }

    #[test]
    fn status_reports_missing_jobs_per_entry() {
        let (_tmp, server) = server();
        let data = server.status("ghost, ,");
        assert_eq!(data.jobs.len(), 1);
        assert_eq!(data.jobs[0]["id"], "ghost");
        assert!(data.jobs[0]["error"].as_str().unwrap().contains("not found"));
        server.stop();
    }

    #[test]
    fn run_rejects_malformed_pipeline() {
        let (_tmp, server) = server();
        let err = server.run("{broken", &[]).unwrap_err();
        assert_eq!(err.http_hint(), 501);
        server.stop();
    }

    #[test]
    fn terminate_unknown_job_is_not_found() {
        let (_tmp, server) = server();
        let err = server.terminate("ghost").unwrap_err();
        assert_eq!(err.http_hint(), 404);
        server.stop();
    }

    #[cfg(unix)]
    #[test]
    fn run_status_rmdir_round_trip() {
        let (_tmp, server) = server();
        let out = server
            .run(r#"{"steps":[{"name":"greet","program":"echo","parameters":"hello world"}]}"#, &[])
            .unwrap();
        let id = out.id.unwrap();
        assert_eq!(wait_terminal(&server, &id), Status::Success);

        let status = server.status(&id);
        assert_eq!(status.jobs.len(), 1);
        assert_eq!(status.jobs[0]["status"], 0);
        assert_eq!(status.jobs[0]["log"], "hello world");

        server.rmdir(&id).unwrap();
        assert!(!server.context().data_root.join(&id).exists());
        server.stop();
    }

    #[cfg(unix)]
    #[test]
    fn terminate_running_job_sets_terminated() {
        let (_tmp, server) = server();
        let out = server
            .run(r#"{"steps":[{"name":"slow","program":"sleep","parameters":"30"}]}"#, &[])
            .unwrap();
        let id = out.id.unwrap();

        // Wait until the worker has it running.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            let desc = Descriptor::load(&server.context().data_root.join(&id)).unwrap();
            if desc.status() == Status::Running {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "job never ran");
            std::thread::sleep(Duration::from_millis(25));
        }

        server.terminate(&id).unwrap();
        assert_eq!(wait_terminal(&server, &id), Status::Terminated);
        // A second terminate is a no-op.
        server.terminate(&id).unwrap();
        assert_eq!(
            Descriptor::load(&server.context().data_root.join(&id))
                .unwrap()
                .status(),
            Status::Terminated
        );
        server.stop();
    }

    #[cfg(unix)]
    #[test]
    fn restart_reruns_a_finished_job() {
        let (_tmp, server) = server();
        let out = server
            .run(r#"{"steps":[{"name":"again","program":"echo","parameters":"first"}]}"#, &[])
            .unwrap();
        let id = out.id.unwrap();
        assert_eq!(wait_terminal(&server, &id), Status::Success);

        server.restart(&id).unwrap();
        assert_eq!(wait_terminal(&server, &id), Status::Success);
        server.stop();
    }
}
