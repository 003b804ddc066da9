//! Notification collaborator interface.
//!
//! The engine only ever talks to [`Mailer`]; the real SMTP client lives
//! behind it in the deployment layer. [`LogMailer`] is the built-in
//! implementation used when no `gmail` credentials are configured: it
//! records the would-be mail in the server log and nothing else.

use anyhow::Result;
use tracing::info;

pub trait Mailer: Send + Sync {
    fn send(&self, to: &str, subject: &str, body: &str) -> Result<()>;
}

/// Logs notifications instead of delivering them.
#[derive(Debug, Default)]
pub struct LogMailer;

impl Mailer for LogMailer {
    fn send(&self, to: &str, subject: &str, body: &str) -> Result<()> {
        info!(to = %to, subject = %subject, body = %body, "notification (logging only)");
        Ok(())
    }
}

/// Completion mail for a finished pipeline.
pub fn completion_message(hostname: &str, job_id: &str, job_name: &str) -> (String, String) {
    (
        format!("Pline: job '{job_name}' has finished"),
        format!(
            "Your pipeline job {job_id} has finished.\n\
             Results are available at http://{hostname}/ under job id {job_id}.\n"
        ),
    )
}

/// 24-hour expiry warning for a job directory about to be cleaned up.
pub fn expiry_message(hostname: &str, job_id: &str, extra: &str) -> (String, String) {
    let mut body = format!(
        "The data of your job {job_id} will be deleted in 24 hours.\n\
         Download anything you still need from http://{hostname}/ before then.\n"
    );
    if !extra.is_empty() {
        body.push_str(extra);
        body.push('\n');
    }
    (format!("Pline: job {job_id} expires in 24 hours"), body)
}

/// Test double that remembers every message it was asked to send. Clones
/// share the same buffer so a test can keep one handle while the context
/// owns the other.
#[cfg(test)]
#[derive(Debug, Default, Clone)]
pub struct RecordingMailer {
    pub sent: std::sync::Arc<parking_lot::Mutex<Vec<(String, String, String)>>>,
}

#[cfg(test)]
impl Mailer for RecordingMailer {
    fn send(&self, to: &str, subject: &str, body: &str) -> Result<()> {
        self.sent
            .lock()
            .push((to.to_string(), subject.to_string(), body.to_string()));
        Ok(())
    }
}
