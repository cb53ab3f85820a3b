//! # Job Queue and Registry
//!
//! Batch submissions are recorded here and handed to workers in FIFO order.
//! The registry and the pending queue share one mutex, so claiming a job and
//! moving it to `processing` is a single atomic step: two workers can never
//! pick up the same job.
//!
//! ## Job lifecycle:
//! ```text
//! queued ──claim──▶ processing ──complete──▶ finished | failed
//! ```
//! Status only moves forward. `result` is set exactly when a job finishes.
//!
//! The queue is built on `std::sync` primitives so workers can be plain OS
//! threads, independent of the async runtime.

use crate::error::{AppError, TranscriptionError};
use crate::transcription::{TranscribeOptions, TranscriptionResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Finished,
    Failed,
}

impl JobStatus {
    /// The only legal moves are one step forward.
    pub fn can_advance_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Finished)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Finished => "finished",
            JobStatus::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// An upload waiting for a worker. Immutable once submitted.
#[derive(Debug, Clone)]
pub struct TranscriptionRequest {
    pub audio: Vec<u8>,
    /// File extension, forwarded to the normalizer
    pub format_hint: Option<String>,
    pub filename: Option<String>,
    pub options: TranscribeOptions,
}

/// Public view of a job, serialized as-is by the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    #[serde(rename = "job_id")]
    pub id: Uuid,
    pub status: JobStatus,
    pub result: Option<TranscriptionResult>,
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A job handed to exactly one worker.
#[derive(Debug)]
pub struct ClaimedJob {
    pub id: Uuid,
    pub request: TranscriptionRequest,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub processing: usize,
    pub finished: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    NotFound(Uuid),
    Closed,
    InvalidTransition { id: Uuid, from: JobStatus, to: JobStatus },
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::NotFound(id) => write!(f, "Job {} not found", id),
            QueueError::Closed => write!(f, "Job queue is shut down"),
            QueueError::InvalidTransition { id, from, to } => {
                write!(f, "Job {} cannot move from {} to {}", id, from, to)
            }
        }
    }
}

impl std::error::Error for QueueError {}

impl From<QueueError> for AppError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::NotFound(_) => AppError::NotFound(err.to_string()),
            QueueError::Closed => AppError::ServiceUnavailable(err.to_string()),
            QueueError::InvalidTransition { .. } => AppError::Internal(err.to_string()),
        }
    }
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<Uuid, Job>,
    pending: VecDeque<ClaimedJob>,
    closed: bool,
}

#[derive(Default)]
pub struct JobQueue {
    inner: Mutex<Inner>,
    available: Condvar,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job and queue it. Constant time; never waits on a worker.
    pub fn submit(&self, request: TranscriptionRequest) -> Result<Uuid, QueueError> {
        let id = Uuid::new_v4();
        let mut inner = self.lock();
        if inner.closed {
            return Err(QueueError::Closed);
        }

        inner.jobs.insert(
            id,
            Job {
                id,
                status: JobStatus::Queued,
                result: None,
                error: None,
                filename: request.filename.clone(),
                submitted_at: Utc::now(),
                started_at: None,
                completed_at: None,
            },
        );
        inner.pending.push_back(ClaimedJob { id, request });
        drop(inner);

        self.available.notify_one();
        Ok(id)
    }

    pub fn get(&self, id: Uuid) -> Result<Job, QueueError> {
        self.lock().jobs.get(&id).cloned().ok_or(QueueError::NotFound(id))
    }

    /// Take the oldest queued job, waiting until one arrives.
    ///
    /// Returns `None` once the queue is closed; jobs still queued at that
    /// point stay `queued`.
    pub fn claim(&self) -> Option<ClaimedJob> {
        let guard = self.lock();
        let mut inner = self
            .available
            .wait_while(guard, |inner| inner.pending.is_empty() && !inner.closed)
            .unwrap_or_else(|e| e.into_inner());
        if inner.closed {
            return None;
        }
        Self::start_next(&mut inner)
    }

    /// Non-blocking variant of [`claim`](Self::claim).
    pub fn try_claim(&self) -> Option<ClaimedJob> {
        let mut inner = self.lock();
        if inner.closed {
            return None;
        }
        Self::start_next(&mut inner)
    }

    fn start_next(inner: &mut Inner) -> Option<ClaimedJob> {
        let claimed = inner.pending.pop_front()?;
        if let Some(job) = inner.jobs.get_mut(&claimed.id) {
            job.status = JobStatus::Processing;
            job.started_at = Some(Utc::now());
        }
        Some(claimed)
    }

    /// Record the outcome of a claimed job.
    pub fn complete(
        &self,
        id: Uuid,
        outcome: Result<TranscriptionResult, TranscriptionError>,
    ) -> Result<(), QueueError> {
        let mut inner = self.lock();
        let job = inner.jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;

        let next = if outcome.is_ok() {
            JobStatus::Finished
        } else {
            JobStatus::Failed
        };
        if !job.status.can_advance_to(next) {
            return Err(QueueError::InvalidTransition {
                id,
                from: job.status,
                to: next,
            });
        }

        job.status = next;
        job.completed_at = Some(Utc::now());
        match outcome {
            Ok(result) => job.result = Some(result),
            Err(err) => job.error = Some(err.to_string()),
        }
        Ok(())
    }

    /// Stop handing out jobs and wake every waiting worker.
    pub fn close(&self) {
        self.lock().closed = true;
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Drop finished and failed jobs completed more than `max_age` ago.
    pub fn purge_older_than(&self, max_age: Duration) -> usize {
        let Ok(max_age) = chrono::Duration::from_std(max_age) else {
            return 0;
        };
        let cutoff = Utc::now() - max_age;

        let mut inner = self.lock();
        let before = inner.jobs.len();
        inner.jobs.retain(|_, job| {
            !(job.status.is_terminal() && job.completed_at.is_some_and(|done| done <= cutoff))
        });
        before - inner.jobs.len()
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.lock();
        inner
            .jobs
            .values()
            .fold(QueueStats::default(), |mut stats, job| {
                match job.status {
                    JobStatus::Queued => stats.queued += 1,
                    JobStatus::Processing => stats.processing += 1,
                    JobStatus::Finished => stats.finished += 1,
                    JobStatus::Failed => stats.failed += 1,
                }
                stats
            })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn request(tag: u8) -> TranscriptionRequest {
        TranscriptionRequest {
            audio: vec![tag; 4],
            format_hint: Some("wav".to_string()),
            filename: Some(format!("clip-{}.wav", tag)),
            options: TranscribeOptions::default(),
        }
    }

    fn result() -> TranscriptionResult {
        TranscriptionResult {
            text: "hello".to_string(),
            language: "en".to_string(),
            language_probability: 0.98,
            processing_time_seconds: 0.1,
            segments: None,
        }
    }

    #[test]
    fn test_submit_and_get() {
        let queue = JobQueue::new();
        let id = queue.submit(request(1)).unwrap();

        let job = queue.get(id).unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.result.is_none());
        assert_eq!(job.filename.as_deref(), Some("clip-1.wav"));

        let missing = Uuid::new_v4();
        assert_eq!(queue.get(missing).unwrap_err(), QueueError::NotFound(missing));
    }

    #[test]
    fn test_claims_in_fifo_order() {
        let queue = JobQueue::new();
        let ids: Vec<Uuid> = (0..5).map(|i| queue.submit(request(i)).unwrap()).collect();

        let claimed: Vec<Uuid> = std::iter::from_fn(|| queue.try_claim()).map(|j| j.id).collect();
        assert_eq!(claimed, ids);
        assert!(ids
            .iter()
            .all(|id| queue.get(*id).unwrap().status == JobStatus::Processing));
    }

    #[test]
    fn test_status_never_regresses() {
        let queue = JobQueue::new();
        let id = queue.submit(request(1)).unwrap();

        // Cannot finish a job nobody claimed
        assert!(matches!(
            queue.complete(id, Ok(result())),
            Err(QueueError::InvalidTransition { from: JobStatus::Queued, .. })
        ));

        queue.try_claim().unwrap();
        queue.complete(id, Ok(result())).unwrap();
        let job = queue.get(id).unwrap();
        assert_eq!(job.status, JobStatus::Finished);
        assert_eq!(job.result.unwrap().text, "hello");

        // Terminal states are final
        assert!(queue
            .complete(id, Err(TranscriptionError::Inference("late".into())))
            .is_err());
        assert_eq!(queue.get(id).unwrap().status, JobStatus::Finished);
    }

    #[test]
    fn test_failed_job_has_no_result() {
        let queue = JobQueue::new();
        let id = queue.submit(request(1)).unwrap();
        queue.try_claim().unwrap();
        queue
            .complete(id, Err(TranscriptionError::Transcode("bad header".into())))
            .unwrap();

        let job = queue.get(id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.result.is_none());
        assert!(job.error.unwrap().contains("bad header"));
    }

    #[test]
    fn test_concurrent_claims_are_exclusive() {
        let queue = Arc::new(JobQueue::new());
        let submitted: HashSet<Uuid> = (0..200).map(|i| queue.submit(request(i as u8)).unwrap()).collect();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    let mut mine = Vec::new();
                    while let Some(job) = queue.try_claim() {
                        queue.complete(job.id, Ok(result())).unwrap();
                        mine.push(job.id);
                    }
                    mine
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "job {} claimed twice", id);
            }
        }
        assert_eq!(seen, submitted);
        assert_eq!(queue.stats().finished, 200);
    }

    #[test]
    fn test_close_wakes_blocked_claimer() {
        let queue = Arc::new(JobQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.claim().is_none())
        };

        std::thread::sleep(Duration::from_millis(50));
        queue.close();
        assert!(waiter.join().unwrap());
        assert_eq!(queue.submit(request(1)).unwrap_err(), QueueError::Closed);
    }

    #[test]
    fn test_blocked_claimer_receives_submission() {
        let queue = Arc::new(JobQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.claim().map(|job| job.id))
        };

        std::thread::sleep(Duration::from_millis(20));
        let id = queue.submit(request(7)).unwrap();
        assert_eq!(waiter.join().unwrap(), Some(id));
    }

    #[test]
    fn test_purge_only_touches_terminal_jobs() {
        let queue = JobQueue::new();
        let done = queue.submit(request(1)).unwrap();
        let waiting = queue.submit(request(2)).unwrap();
        queue.try_claim().unwrap();
        queue.complete(done, Ok(result())).unwrap();

        assert_eq!(queue.purge_older_than(Duration::from_secs(3600)), 0);
        assert_eq!(queue.purge_older_than(Duration::ZERO), 1);
        assert!(queue.get(done).is_err());
        assert_eq!(queue.get(waiting).unwrap().status, JobStatus::Queued);
    }

    #[test]
    fn test_job_serialization() {
        let queue = JobQueue::new();
        let id = queue.submit(request(1)).unwrap();
        let json = serde_json::to_value(queue.get(id).unwrap()).unwrap();

        assert_eq!(json["job_id"], id.to_string());
        assert_eq!(json["status"], "queued");
        assert!(json["result"].is_null());
    }
}
