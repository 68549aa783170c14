//! Task poller
//!
//! Drives a submitted backend job to a terminal state by repeated status
//! queries. Each job is polled by exactly one loop; many loops may run
//! concurrently. Every loop watches a `CancellationToken` so abandoning the
//! caller stops polling immediately.
//!
//! State machine per job:
//! `pending/started → success | failure | cancelled`

mod backend;
mod policy;

pub use backend::{HttpJobBackend, JobBackend, JobRequest};
pub use policy::{FastFailPredicate, PollPolicy, PollVerdict};

use chrono::Utc;
use scribe_common::events::{ClientEvent, EventBus, JobOutcome};
use scribe_common::model::{Job, JobStatus};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::transport::TransportError;

/// Poller errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PollError {
    /// Submission or poll request failed and policy gave up
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Credential rejected beyond the fast-fail budget
    #[error("Authorization expired while polling (after {attempts} rejected polls)")]
    AuthExpired { attempts: u32 },

    #[error("Job {job_id} failed: {message}")]
    JobFailed { job_id: String, message: String },

    #[error("Job {job_id} was cancelled")]
    JobCancelled { job_id: String },

    #[error("Job {job_id} still running after {attempts} polls")]
    JobTimeout { job_id: String, attempts: u32 },

    /// Status string outside the five known states
    #[error("Job {job_id} reported unknown status '{status}'")]
    InvalidResponse { job_id: String, status: String },

    /// Caller abandoned the job
    #[error("Polling aborted")]
    Aborted,
}

impl PollError {
    fn outcome(&self) -> JobOutcome {
        match self {
            PollError::AuthExpired { .. } => JobOutcome::AuthExpired,
            PollError::JobFailed { .. } => JobOutcome::Failed,
            PollError::JobCancelled { .. } => JobOutcome::Cancelled,
            PollError::JobTimeout { .. } => JobOutcome::TimedOut,
            PollError::Aborted | PollError::Transport(TransportError::Cancelled) => {
                JobOutcome::Aborted
            }
            PollError::Transport(_) | PollError::InvalidResponse { .. } => JobOutcome::Error,
        }
    }
}

/// Submits jobs and polls them to completion
#[derive(Clone)]
pub struct TaskPoller {
    backend: Arc<dyn JobBackend>,
    policy: PollPolicy,
    events: EventBus,
}

impl TaskPoller {
    pub fn new(backend: Arc<dyn JobBackend>, policy: PollPolicy, events: EventBus) -> Self {
        Self {
            backend,
            policy,
            events,
        }
    }

    pub fn policy(&self) -> &PollPolicy {
        &self.policy
    }

    /// Submit a job and poll it to a terminal state
    ///
    /// Returns the result carried by the `success` status (`Value::Null` if
    /// the backend sent none).
    pub async fn run(
        &self,
        request: &JobRequest,
        cancel: &CancellationToken,
    ) -> Result<Value, PollError> {
        let mut job = self.submit(request, cancel).await?;
        self.wait(&mut job, cancel).await
    }

    /// Submit a job without waiting for it
    pub async fn submit(
        &self,
        request: &JobRequest,
        cancel: &CancellationToken,
    ) -> Result<Job, PollError> {
        let ticket = match self.backend.submit(request, cancel).await {
            Ok(ticket) => ticket,
            Err(TransportError::Cancelled) => return Err(PollError::Aborted),
            Err(e) => {
                warn!(path = %request.path, error = %e, "Job submission failed");
                return Err(e.into());
            }
        };
        info!(job_id = %ticket.job_id, poll_url = %ticket.poll_url, "Job submitted");
        Ok(Job::submitted(ticket))
    }

    /// Poll a submitted job until it reaches a terminal state
    pub async fn wait(&self, job: &mut Job, cancel: &CancellationToken) -> Result<Value, PollError> {
        let result = self.poll_loop(job, cancel).await;
        let outcome = match &result {
            Ok(_) => JobOutcome::Succeeded,
            Err(e) => e.outcome(),
        };
        match &result {
            Ok(_) => info!(job_id = %job.id, "Job succeeded"),
            Err(e) => warn!(job_id = %job.id, error = %e, "Job did not succeed"),
        }
        self.events.emit_lossy(ClientEvent::JobFinished {
            job_id: job.id.clone(),
            outcome,
            timestamp: Utc::now(),
        });
        result
    }

    /// Spawn `run` on its own task
    ///
    /// The returned handle cancels the loop when dropped, so a caller that
    /// loses interest never leaves polling behind.
    pub fn spawn(&self, request: JobRequest, cancel: &CancellationToken) -> JobHandle {
        let token = cancel.child_token();
        let poller = self.clone();
        let task_token = token.clone();
        let join = tokio::spawn(async move { poller.run(&request, &task_token).await });
        JobHandle {
            join,
            guard: token.drop_guard(),
        }
    }

    async fn poll_loop(&self, job: &mut Job, cancel: &CancellationToken) -> Result<Value, PollError> {
        let mut attempt: u32 = 0;
        let mut fast_fail_streak: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(PollError::Aborted);
            }
            if self.backend.session_expired() {
                return Err(PollError::AuthExpired {
                    attempts: fast_fail_streak,
                });
            }

            attempt += 1;
            let delay = match self.backend.status(&job.poll_url, cancel).await {
                Ok(response) => {
                    fast_fail_streak = 0;
                    let Some(status) = JobStatus::interpret(&response.status) else {
                        return Err(PollError::InvalidResponse {
                            job_id: job.id.clone(),
                            status: response.status,
                        });
                    };
                    debug!(job_id = %job.id, attempt, ?status, "Job status");
                    job.observe(status, response);
                    self.events.emit_lossy(ClientEvent::JobProgress {
                        job_id: job.id.clone(),
                        status,
                        progress: job.progress.clone(),
                        attempt,
                        timestamp: Utc::now(),
                    });

                    match status {
                        JobStatus::Success => return Ok(job.result.clone().unwrap_or(Value::Null)),
                        JobStatus::Failure => {
                            return Err(PollError::JobFailed {
                                job_id: job.id.clone(),
                                message: job
                                    .error
                                    .clone()
                                    .unwrap_or_else(|| "job failed".to_string()),
                            })
                        }
                        JobStatus::Cancelled => {
                            return Err(PollError::JobCancelled {
                                job_id: job.id.clone(),
                            })
                        }
                        JobStatus::Pending | JobStatus::Started => {
                            match self.policy.after_pending(attempt) {
                                PollVerdict::RetryAfter(delay) => delay,
                                _ => {
                                    return Err(PollError::JobTimeout {
                                        job_id: job.id.clone(),
                                        attempts: attempt,
                                    })
                                }
                            }
                        }
                    }
                }
                Err(TransportError::Cancelled) => return Err(PollError::Aborted),
                Err(error) => {
                    if (self.policy.fast_fail)(&error) {
                        fast_fail_streak += 1;
                    } else {
                        fast_fail_streak = 0;
                    }
                    match self.policy.after_error(&error, attempt, fast_fail_streak) {
                        PollVerdict::RetryAfter(delay) => {
                            warn!(job_id = %job.id, attempt, error = %error, "Poll request failed, retrying");
                            delay
                        }
                        PollVerdict::AuthExpired => {
                            return Err(PollError::AuthExpired {
                                attempts: fast_fail_streak,
                            })
                        }
                        PollVerdict::Surface => return Err(error.into()),
                        PollVerdict::Timeout => {
                            return Err(PollError::JobTimeout {
                                job_id: job.id.clone(),
                                attempts: attempt,
                            })
                        }
                    }
                }
            };

            sleep_or_abort(delay, cancel).await?;
        }
    }
}

async fn sleep_or_abort(delay: Duration, cancel: &CancellationToken) -> Result<(), PollError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PollError::Aborted),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Handle to a spawned polling loop; dropping it stops the loop
pub struct JobHandle {
    join: JoinHandle<Result<Value, PollError>>,
    guard: DropGuard,
}

impl JobHandle {
    /// Wait for the job outcome
    pub async fn result(self) -> Result<Value, PollError> {
        let JobHandle { join, guard } = self;
        let result = join.await.unwrap_or(Err(PollError::Aborted));
        drop(guard);
        result
    }
}
