//! Pipeline submission: turn a client pipeline description into a chain of
//! step directories and enqueue the first step.
//!
//! Every step directory is created up-front, nested inside its
//! predecessor's directory (so step ids are slash-separated paths). Only
//! the first step is enqueued; successors start when their predecessor
//! exits 0.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use crate::descriptor::Descriptor;
use crate::error::{Error, Result};
use crate::job::Job;
use crate::jobdir;
use crate::queue::QueueShared;
use crate::server::ServerContext;

/// One step as submitted by the client.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StepRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub program: String,
    #[serde(default)]
    pub parameters: String,
    #[serde(default)]
    pub plugin: String,
    #[serde(default)]
    pub infiles: String,
    #[serde(default, rename = "keepData")]
    pub keep_data: Option<Value>,
}

/// A submitted pipeline: ordered steps plus an optional notification
/// address.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PipelineRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub steps: Vec<StepRequest>,
}

impl PipelineRequest {
    /// Accept either the `{email, steps}` object form or a bare array of
    /// steps.
    pub fn parse(raw: &str) -> Result<PipelineRequest> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| Error::Malformed(format!("pipeline: {e}")))?;
        let request = if value.is_array() {
            PipelineRequest {
                email: String::new(),
                steps: serde_json::from_value(value)
                    .map_err(|e| Error::Malformed(format!("pipeline steps: {e}")))?,
            }
        } else {
            serde_json::from_value(value)
                .map_err(|e| Error::Malformed(format!("pipeline: {e}")))?
        };
        Ok(request)
    }
}

/// An input file staged by the request layer for one step (0-based index).
#[derive(Debug, Clone)]
pub struct StagedFile {
    pub step: usize,
    pub name: String,
    pub data: Vec<u8>,
}

/// Create the step directories, link the chain, stage inputs, and enqueue
/// the first step. Returns the first step's job id, or `None` for an empty
/// pipeline (nothing is created).
pub fn submit(
    ctx: &Arc<ServerContext>,
    queue: &Arc<QueueShared>,
    request: &PipelineRequest,
    files: &[StagedFile],
) -> Result<Option<String>> {
    if request.steps.is_empty() {
        return Ok(None);
    }
    let total = request.steps.len();

    // Pass 1: materialise every directory and descriptor so each successor
    // exists on disk before any predecessor points at it.
    let mut created = Vec::with_capacity(total);
    for (k, step) in request.steps.iter().enumerate() {
        let parent = if k == 0 {
            ctx.data_root.clone()
        } else {
            let prev: &jobdir::StepDir = &created[k - 1];
            prev.path.clone()
        };
        let opaque = k == 0 && ctx.config.dataids;
        let dir = jobdir::create(&ctx.data_root, &parent, &step.name, opaque)?;

        let mut desc = Descriptor::load(&dir.path)?;
        desc.program = step.program.clone();
        desc.parameters = step.parameters.clone();
        desc.plugin = step.plugin.clone();
        desc.infiles = step.infiles.clone();
        desc.keep_data = step.keep_data.clone();
        if total > 1 {
            desc.step = format!("{}/{}", k + 1, total);
        }
        if k == 0 {
            desc.email = request.email.clone();
        }
        desc.flush(&dir.path)?;

        let staged: Vec<(String, Vec<u8>)> = files
            .iter()
            .filter(|f| f.step == k)
            .map(|f| (f.name.clone(), f.data.clone()))
            .collect();
        if !staged.is_empty() {
            jobdir::stage_inputs(&dir.path, &staged)?;
        }
        created.push(dir);
    }

    // Pass 2: chain links, plus the notify request on the last step.
    let first_id = created[0].id.clone();
    for k in 0..total {
        let mut desc = Descriptor::load(&created[k].path)?;
        let mut dirty = false;
        if k + 1 < total {
            desc.nextstep = created[k + 1].id.clone();
            dirty = true;
        } else if !request.email.is_empty() {
            desc.notify = first_id.clone();
            dirty = true;
        }
        if dirty {
            desc.flush(&created[k].path)?;
        }
    }

    info!(first = %first_id, steps = total, "pipeline submitted");
    Job::launch(ctx, queue, &first_id)?;
    Ok(Some(first_id))
}

/// Terminate a job and every queued successor reachable through its
/// `nextstep` chain.
pub fn terminate_chain(ctx: &Arc<ServerContext>, queue: &Arc<QueueShared>, job_id: &str) {
    let mut current = job_id.trim_matches('/').to_string();
    // Chains are short; the bound only guards against a corrupted cycle.
    for _ in 0..128 {
        queue.terminate(&current, false);
        let Ok(dir) = ctx.job_dir(&current) else {
            break;
        };
        let Ok(desc) = Descriptor::load(&dir) else {
            break;
        };
        if desc.nextstep.is_empty() {
            break;
        }
        current = desc.nextstep;
    }
}
