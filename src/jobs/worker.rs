//! # Job Worker Pool
//!
//! A fixed set of OS threads draining the job queue. Each worker loops:
//! claim, normalize, transcribe, record the outcome. Any error marks the job
//! failed; nothing is retried.

use crate::audio::normalizer::AudioNormalizer;
use crate::error::TranscriptionError;
use crate::jobs::queue::{JobQueue, TranscriptionRequest};
use crate::transcription::{ModelManager, TranscriptionResult};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{error, info, warn};

pub struct WorkerPool {
    queue: Arc<JobQueue>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `count` workers sharing one queue, engine and normalizer.
    pub fn start(
        count: usize,
        queue: Arc<JobQueue>,
        manager: Arc<ModelManager>,
        normalizer: AudioNormalizer,
    ) -> std::io::Result<Self> {
        let mut workers = Vec::with_capacity(count);
        for worker_id in 0..count {
            let queue = Arc::clone(&queue);
            let manager = Arc::clone(&manager);
            let normalizer = normalizer.clone();
            let handle = std::thread::Builder::new()
                .name(format!("job-worker-{}", worker_id))
                .spawn(move || run_worker(worker_id, &queue, &manager, &normalizer))?;
            workers.push(handle);
        }

        info!(workers = count, "job worker pool started");
        Ok(Self { queue, workers })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Close the queue and wait for in-flight jobs to finish.
    pub fn shutdown(self) {
        self.queue.close();
        for handle in self.workers {
            if handle.join().is_err() {
                error!("job worker panicked during shutdown");
            }
        }
        info!("job worker pool stopped");
    }
}

fn run_worker(
    worker_id: usize,
    queue: &JobQueue,
    manager: &ModelManager,
    normalizer: &AudioNormalizer,
) {
    while let Some(job) = queue.claim() {
        info!(job_id = %job.id, worker_id, bytes = job.request.audio.len(), "processing job");

        // A panicking engine must not leave the job stuck in `processing`
        let outcome = catch_unwind(AssertUnwindSafe(|| process(&job.request, manager, normalizer)))
            .unwrap_or_else(|_| {
                Err(TranscriptionError::Inference("worker panicked during transcription".to_string()))
            });

        match &outcome {
            Ok(result) => info!(
                job_id = %job.id,
                worker_id,
                chars = result.text.len(),
                processing_secs = result.processing_time_seconds,
                "job finished"
            ),
            Err(err) => warn!(job_id = %job.id, worker_id, kind = err.kind(), "job failed: {}", err),
        }

        if let Err(err) = queue.complete(job.id, outcome) {
            error!(job_id = %job.id, "could not record job outcome: {}", err);
        }
    }
}

fn process(
    request: &TranscriptionRequest,
    manager: &ModelManager,
    normalizer: &AudioNormalizer,
) -> Result<TranscriptionResult, TranscriptionError> {
    let pcm = normalizer.normalize(&request.audio, request.format_hint.as_deref())?;
    manager.transcribe(&pcm, &request.options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::normalizer::encode_wav;
    use crate::jobs::queue::{Job, JobStatus};
    use crate::transcription::engine::testing::FakeEngine;
    use crate::transcription::TranscribeOptions;
    use std::sync::atomic::Ordering;
    use std::time::{Duration, Instant};
    use uuid::Uuid;

    fn normalizer() -> AudioNormalizer {
        let mut transcode = crate::config::AppConfig::default().transcode;
        transcode.ffmpeg_path = "/nonexistent/ffmpeg".to_string();
        AudioNormalizer::new(&transcode, 16000)
    }

    fn manager(engine: FakeEngine) -> Arc<ModelManager> {
        let manager = Arc::new(ModelManager::new("small", "cpu"));
        manager.install(Box::new(engine), "cpu");
        manager
    }

    fn wav_request(samples: &[i16]) -> TranscriptionRequest {
        TranscriptionRequest {
            audio: encode_wav(samples, 16000, 1),
            format_hint: Some("wav".to_string()),
            filename: Some("clip.wav".to_string()),
            options: TranscribeOptions::default(),
        }
    }

    fn wait_terminal(queue: &JobQueue, id: Uuid) -> Job {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let job = queue.get(id).unwrap();
            if job.status.is_terminal() {
                return job;
            }
            assert!(Instant::now() < deadline, "job {} never finished", id);
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_every_job_reaches_one_terminal_state() {
        let engine = FakeEngine::new();
        let calls = engine.calls.clone();
        let queue = Arc::new(JobQueue::new());
        let pool = WorkerPool::start(3, Arc::clone(&queue), manager(engine), normalizer()).unwrap();

        let tone: Vec<i16> = (0..4000).map(|i| ((i as f32 * 0.3).sin() * 9000.0) as i16).collect();
        let ids: Vec<Uuid> = (0..20)
            .map(|_| queue.submit(wav_request(&tone)).unwrap())
            .collect();

        for id in &ids {
            assert_eq!(wait_terminal(&queue, *id).status, JobStatus::Finished);
        }
        pool.shutdown();

        assert_eq!(calls.load(Ordering::SeqCst), 20);
        assert_eq!(queue.stats().finished, 20);
    }

    #[test]
    fn test_silent_clip_finishes_with_empty_text() {
        let queue = Arc::new(JobQueue::new());
        let pool = WorkerPool::start(1, Arc::clone(&queue), manager(FakeEngine::new()), normalizer()).unwrap();

        let id = queue.submit(wav_request(&vec![0i16; 5 * 16000])).unwrap();
        let job = wait_terminal(&queue, id);
        pool.shutdown();

        assert_eq!(job.status, JobStatus::Finished);
        let result = job.result.expect("finished job has a result");
        assert_eq!(result.text, "");
        assert!((0.0..=1.0).contains(&result.language_probability));
    }

    #[test]
    fn test_corrupt_upload_fails_without_result() {
        let queue = Arc::new(JobQueue::new());
        let pool = WorkerPool::start(1, Arc::clone(&queue), manager(FakeEngine::new()), normalizer()).unwrap();

        let id = queue
            .submit(TranscriptionRequest {
                audio: b"definitely not audio".to_vec(),
                format_hint: Some("wav".to_string()),
                filename: Some("broken.wav".to_string()),
                options: TranscribeOptions::default(),
            })
            .unwrap();
        let job = wait_terminal(&queue, id);
        pool.shutdown();

        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.result.is_none());
        assert!(job.error.is_some());
    }

    #[test]
    fn test_engine_failure_marks_job_failed() {
        let queue = Arc::new(JobQueue::new());
        let pool = WorkerPool::start(2, Arc::clone(&queue), manager(FakeEngine::failing()), normalizer()).unwrap();

        let id = queue.submit(wav_request(&[100i16; 8000])).unwrap();
        let job = wait_terminal(&queue, id);
        pool.shutdown();

        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("fake engine failure"));
    }

    #[test]
    fn test_pool_exits_when_queue_closed() {
        let queue = Arc::new(JobQueue::new());
        queue.close();
        let pool = WorkerPool::start(2, Arc::clone(&queue), manager(FakeEngine::new()), normalizer()).unwrap();
        assert_eq!(pool.size(), 2);
        pool.shutdown();
        assert!(queue.is_closed());
    }
}
