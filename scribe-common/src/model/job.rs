//! Backend job records driven by the task poller

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Job state as interpreted from a status response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Started,
    Success,
    Failure,
    Cancelled,
}

impl JobStatus {
    /// Interpret a backend status string
    ///
    /// Backends report task-queue style states in any case; anything that
    /// does not map onto the five states is `None`.
    pub fn interpret(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" | "queued" | "received" | "retry" => Some(JobStatus::Pending),
            "started" | "progress" | "running" => Some(JobStatus::Started),
            "success" | "succeeded" | "completed" => Some(JobStatus::Success),
            "failure" | "failed" | "error" => Some(JobStatus::Failure),
            "cancelled" | "canceled" | "revoked" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failure | JobStatus::Cancelled
        )
    }
}

/// Submission response: where to poll for the job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTicket {
    #[serde(alias = "jobId", alias = "task_id")]
    pub job_id: String,
    #[serde(alias = "pollURL", alias = "pollUrl", alias = "status_url")]
    pub poll_url: String,
}

/// Raw status response body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub status: String,
    #[serde(default)]
    pub progress: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Client-side view of one submitted job
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
    pub id: String,
    pub submitted_at: DateTime<Utc>,
    pub poll_url: String,
    pub status: JobStatus,
    pub progress: Option<Value>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl Job {
    pub fn submitted(ticket: JobTicket) -> Self {
        Self {
            id: ticket.job_id,
            submitted_at: Utc::now(),
            poll_url: ticket.poll_url,
            status: JobStatus::Pending,
            progress: None,
            result: None,
            error: None,
        }
    }

    /// Fold one status response into the job
    ///
    /// A job that already reached a terminal state is never changed again.
    pub fn observe(&mut self, status: JobStatus, response: JobStatusResponse) {
        if self.is_terminal() {
            return;
        }
        self.status = status;
        if response.progress.is_some() {
            self.progress = response.progress;
        }
        self.result = response.result;
        self.error = response.error;
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_interpret_statuses() {
        assert_eq!(JobStatus::interpret("PENDING"), Some(JobStatus::Pending));
        assert_eq!(JobStatus::interpret("started"), Some(JobStatus::Started));
        assert_eq!(JobStatus::interpret("SUCCESS"), Some(JobStatus::Success));
        assert_eq!(JobStatus::interpret("REVOKED"), Some(JobStatus::Cancelled));
        assert_eq!(JobStatus::interpret("exploded"), None);
    }

    #[test]
    fn test_ticket_accepts_camel_case() {
        let ticket: JobTicket =
            serde_json::from_value(json!({"jobId": "J1", "pollURL": "/jobs/J1"})).unwrap();
        assert_eq!(ticket.job_id, "J1");
        assert_eq!(ticket.poll_url, "/jobs/J1");
    }

    #[test]
    fn test_terminal_job_is_frozen() {
        let mut job = Job::submitted(JobTicket {
            job_id: "J1".into(),
            poll_url: "/jobs/J1".into(),
        });
        job.observe(
            JobStatus::Success,
            JobStatusResponse {
                status: "success".into(),
                progress: None,
                result: Some(json!({"summary": "ok"})),
                error: None,
            },
        );
        job.observe(
            JobStatus::Failure,
            JobStatusResponse {
                status: "failure".into(),
                progress: None,
                result: None,
                error: Some("late".into()),
            },
        );
        assert_eq!(job.status, JobStatus::Success);
        assert_eq!(job.result, Some(json!({"summary": "ok"})));
    }
}
