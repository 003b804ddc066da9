//! The job descriptor: one `job.json` per job directory, single source of
//! truth for that job's state.
//!
//! The descriptor is a tagged struct with the closed set of recognised
//! fields plus a flattened extras map for forward compatibility. Writers
//! replace the file atomically (unique temp sibling, then rename), so a
//! concurrent reader sees either the previous or the next complete JSON.

use std::path::{Path, PathBuf};

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use tracing::warn;

use crate::error::{Error, Result};

pub const DESCRIPTOR_FILE: &str = "job.json";

/// Default captured-output filenames, set at job-directory creation.
pub const STDOUT_FILE: &str = "output.log";
pub const LOGFILE_FILE: &str = "err.log";

/// Status string written when the server shuts down mid-job. The only value
/// allowed to overwrite an already-terminal status.
pub const SHUTDOWN_MESSAGE: &str = "Terminated by server shutdown";

/// Job state. INIT and QUEUED deliberately share wire value `1` (clients
/// treat them identically); the engine keeps them distinct internally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Init,
    Queued,
    Running,
    Success,
    Fail,
    Terminated,
    ShutdownTerm,
    /// Human message that replaced a non-zero exit code on finalisation.
    Message(String),
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Status::Init | Status::Queued | Status::Running)
    }

    /// Map a child exit code to the finalised status. Children killed by a
    /// signal report the negated signal number (POSIX convention), so a
    /// SIGTERM death lands on `Terminated`.
    pub fn from_exit_code(rc: i32) -> Status {
        match rc {
            0 => Status::Success,
            -15 => Status::Terminated,
            -11 => Status::Message("Segmentation fault".to_string()),
            127 => Status::Message("Executable not found".to_string()),
            n => Status::Message(format!("Error. Exit code: {n}")),
        }
    }

    /// Client-facing form: the wire integer, or the message for finalised
    /// failures.
    pub fn as_value(&self) -> Value {
        match self {
            Status::Init | Status::Queued => Value::from(1),
            Status::Running => Value::from(2),
            Status::Success => Value::from(0),
            Status::Fail => Value::from(-1),
            Status::Terminated => Value::from(-15),
            Status::ShutdownTerm => Value::from(SHUTDOWN_MESSAGE),
            Status::Message(m) => Value::from(m.clone()),
        }
    }
}

impl Serialize for Status {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.as_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Status {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let v = Value::deserialize(deserializer)?;
        match v {
            Value::Number(n) => {
                let code = n.as_i64().ok_or_else(|| D::Error::custom("bad status"))?;
                Ok(match code {
                    1 => Status::Queued,
                    2 => Status::Running,
                    0 => Status::Success,
                    -15 => Status::Terminated,
                    -16 => Status::ShutdownTerm,
                    _ => Status::Fail,
                })
            }
            Value::String(s) if s == SHUTDOWN_MESSAGE => Ok(Status::ShutdownTerm),
            Value::String(s) => Ok(Status::Message(s)),
            _ => Err(D::Error::custom("status must be a number or string")),
        }
    }
}

/// Persisted `job.json` contents. Absent string fields serialise away and
/// read back as the empty-string sentinel via [`Descriptor::get`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Descriptor {
    /// Relative path of the job directory under the data root.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    /// `|`-separated command strings; first token of each is the executable.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub program: String,
    /// Matching `|`-separated argument strings.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parameters: String,
    /// Matching `|`-separated plugin references.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub plugin: String,
    /// Comma-separated input filenames relative to the job directory.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub infiles: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub outfiles: String,
    /// Captured standard output filename.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stdout: String,
    /// Captured standard error filename.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub logfile: String,
    /// Human pipeline position label, `"k/N"`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub step: String,
    /// Job id of the successor step.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub nextstep: String,
    /// First step's job id; present on the last step to request an email.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub notify: String,
    /// Destination address, first step only.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub email: String,
    /// Truthy value exempts the job from expiry and quota eviction.
    #[serde(
        default,
        rename = "keepData",
        skip_serializing_if = "Option::is_none"
    )]
    pub keep_data: Option<Value>,
    /// Last captured log line; computed on read, never persisted.
    #[serde(skip)]
    pub log: String,
    /// Unrecognised keys round-trip untouched.
    #[serde(flatten)]
    pub extras: serde_json::Map<String, Value>,
}

impl Descriptor {
    /// Load the descriptor of `job_dir`. A missing file is an error; an
    /// unparseable file is renamed aside with a `.corrupted` suffix and an
    /// empty descriptor is returned (the job then reads as failed).
    pub fn load(job_dir: &Path) -> Result<Descriptor> {
        let path = job_dir.join(DESCRIPTOR_FILE);
        let raw = std::fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(format!("no descriptor in {}", job_dir.display()))
            } else {
                Error::Io(e)
            }
        })?;
        match serde_json::from_slice(&raw) {
            Ok(desc) => Ok(desc),
            Err(e) => {
                warn!(dir = %job_dir.display(), error = %e, "corrupt descriptor, renaming aside");
                let aside = job_dir.join(format!("{DESCRIPTOR_FILE}.corrupted"));
                std::fs::rename(&path, &aside)?;
                let empty = Descriptor::default();
                empty.flush(job_dir)?;
                Ok(empty)
            }
        }
    }

    /// Atomically replace `job.json`: write a uniquely-named temp sibling,
    /// set mode `0o664`, rename over the target.
    pub fn flush(&self, job_dir: &Path) -> Result<()> {
        let tmp = tempfile::NamedTempFile::new_in(job_dir)?;
        serde_json::to_writer_pretty(tmp.as_file(), self)?;
        tmp.as_file().sync_all()?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perm = std::fs::Permissions::from_mode(0o664);
            tmp.as_file().set_permissions(perm)?;
        }
        tmp.persist(job_dir.join(DESCRIPTOR_FILE))
            .map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    /// Stored value for `key`, or the empty-string sentinel when absent.
    /// Non-string values render through their JSON form.
    pub fn get(&self, key: &str) -> String {
        let opt_ts = |t: Option<i64>| t.map(|v| v.to_string()).unwrap_or_default();
        match key {
            "id" => self.id.clone(),
            "name" => self.name.clone(),
            "created" => opt_ts(self.created),
            "updated" => opt_ts(self.updated),
            "completed" => opt_ts(self.completed),
            "status" => self
                .status
                .as_ref()
                .map(|s| match s.as_value() {
                    Value::String(m) => m,
                    v => v.to_string(),
                })
                .unwrap_or_default(),
            "program" => self.program.clone(),
            "parameters" => self.parameters.clone(),
            "plugin" => self.plugin.clone(),
            "infiles" => self.infiles.clone(),
            "outfiles" => self.outfiles.clone(),
            "stdout" => self.stdout.clone(),
            "logfile" => self.logfile.clone(),
            "step" => self.step.clone(),
            "nextstep" => self.nextstep.clone(),
            "notify" => self.notify.clone(),
            "email" => self.email.clone(),
            "log" => self.log.clone(),
            other => self
                .extras
                .get(other)
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    v => v.to_string(),
                })
                .unwrap_or_default(),
        }
    }

    pub fn status(&self) -> Status {
        self.status.clone().unwrap_or(Status::Fail)
    }

    /// Truthy `keepData` exempts the directory from cleanup.
    pub fn keeps_data(&self) -> bool {
        match &self.keep_data {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
            Some(Value::String(s)) => !s.is_empty() && s != "0" && s != "false",
            Some(_) => true,
        }
    }

    /// Split the `|`-joined plugin/program/parameter columns into per-process
    /// rows. The plugin and program columns must agree in length; an absent
    /// parameters column pads with empty strings.
    pub fn command_rows(&self) -> Result<Vec<CommandRow>> {
        if self.program.is_empty() {
            return Err(Error::Malformed("job has no program".to_string()));
        }
        let programs: Vec<&str> = self.program.split('|').collect();
        let plugins: Vec<&str> = if self.plugin.is_empty() {
            vec![""; programs.len()]
        } else {
            self.plugin.split('|').collect()
        };
        let mut parameters: Vec<&str> = if self.parameters.is_empty() {
            vec![""; programs.len()]
        } else {
            self.parameters.split('|').collect()
        };
        if plugins.len() != programs.len() {
            return Err(Error::Malformed(format!(
                "plugin/program column mismatch: {} vs {}",
                plugins.len(),
                programs.len()
            )));
        }
        if parameters.len() != programs.len() {
            if parameters.iter().all(|p| p.trim().is_empty()) {
                parameters = vec![""; programs.len()];
            } else {
                return Err(Error::Malformed(format!(
                    "parameters/program column mismatch: {} vs {}",
                    parameters.len(),
                    programs.len()
                )));
            }
        }
        Ok(programs
            .iter()
            .zip(plugins.iter())
            .zip(parameters.iter())
            .map(|((prog, plug), par)| CommandRow {
                plugin: plug.trim().to_string(),
                program: prog.trim().to_string(),
                parameters: par.trim().to_string(),
            })
            .collect())
    }

    /// Populate `log` and `updated` from the last line of the captured error
    /// log, falling back to captured stdout when the error log is absent or
    /// empty. Absolute job-directory paths in the line are replaced with the
    /// literal `jobPath`. When the queue no longer tracks this id but the
    /// persisted status still reads active, the job is a leftover from a
    /// previous process lifetime: reconcile it to FAIL on disk.
    pub fn attach_log_tail(&mut self, job_dir: &Path, in_queue: bool) {
        let mut source: Option<PathBuf> = None;
        for name in [self.logfile.as_str(), self.stdout.as_str()] {
            if name.is_empty() {
                continue;
            }
            let p = job_dir.join(name);
            if std::fs::metadata(&p).map(|m| m.len() > 0).unwrap_or(false) {
                source = Some(p);
                break;
            }
        }

        if let Some(path) = source {
            if let Ok(text) = std::fs::read_to_string(&path) {
                if let Some(line) = text.lines().rev().find(|l| !l.trim().is_empty()) {
                    self.log = line.replace(&job_dir.display().to_string(), "jobPath");
                }
            }
            if let Ok(meta) = std::fs::metadata(&path) {
                if let Ok(mtime) = meta.modified() {
                    if let Ok(secs) = mtime.duration_since(std::time::UNIX_EPOCH) {
                        self.updated = Some(secs.as_secs() as i64);
                    }
                }
            }
        }

        if !in_queue && !self.status().is_terminal() {
            warn!(id = %self.id, "active status with no queue entry, marking failed");
            self.status = Some(Status::Fail);
            if let Err(e) = self.flush(job_dir) {
                warn!(id = %self.id, error = %e, "could not persist reconciled status");
            }
        }
    }
}

/// One process of a (possibly piped) step: resolved together, launched
/// together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRow {
    pub plugin: String,
    pub program: String,
    pub parameters: String,
}

/// Current time as Unix seconds.
pub fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}
