//! # Application State
//!
//! Shared handles every HTTP handler and WebSocket actor needs. Built once
//! in `main` and cloned into each actix worker via `web::Data`.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - The model manager and job queue are shared by handlers, the worker pool
//!   and streaming sessions. `Arc` gives each of them an owning handle.
//! - Cloning an `AppState` only bumps reference counts.
//!
//! ### Atomics instead of locks
//! - The active session count is a single integer touched on every connect
//!   and disconnect, so an `AtomicUsize` is enough.
//! - `fetch_update` makes "check the limit and increment" one atomic step.

use crate::audio::normalizer::AudioNormalizer;
use crate::config::AppConfig;
use crate::jobs::JobQueue;
use crate::transcription::{ModelManager, TranscribeOptions};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    /// Validated at startup, read-only afterwards
    pub config: Arc<AppConfig>,
    pub manager: Arc<ModelManager>,
    pub jobs: Arc<JobQueue>,
    pub normalizer: AudioNormalizer,
    active_sessions: Arc<AtomicUsize>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(config: AppConfig, manager: Arc<ModelManager>, jobs: Arc<JobQueue>) -> Self {
        let normalizer = AudioNormalizer::new(&config.transcode, config.audio.sample_rate);
        Self {
            config: Arc::new(config),
            manager,
            jobs,
            normalizer,
            active_sessions: Arc::new(AtomicUsize::new(0)),
            start_time: Instant::now(),
        }
    }

    /// Options used when a request gives no hints of its own.
    pub fn default_options(&self) -> TranscribeOptions {
        TranscribeOptions {
            language: self.config.models.language.clone(),
            task: self.config.models.task.parse().unwrap_or_default(),
        }
    }

    /// Reserve a streaming session slot. `false` when the limit is reached.
    pub fn try_acquire_session(&self) -> bool {
        let limit = self.config.performance.max_concurrent_sessions;
        self.active_sessions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |active| {
                (active < limit).then_some(active + 1)
            })
            .is_ok()
    }

    pub fn release_session(&self) {
        let _ = self
            .active_sessions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |active| active.checked_sub(1));
    }

    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::SeqCst)
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(max_sessions: usize) -> AppState {
        let mut config = AppConfig::default();
        config.performance.max_concurrent_sessions = max_sessions;
        AppState::new(
            config,
            Arc::new(ModelManager::new("small", "cpu")),
            Arc::new(JobQueue::new()),
        )
    }

    #[test]
    fn test_session_limit() {
        let state = state(2);
        assert!(state.try_acquire_session());
        assert!(state.try_acquire_session());
        assert!(!state.try_acquire_session());
        assert_eq!(state.active_sessions(), 2);

        state.release_session();
        assert!(state.try_acquire_session());
    }

    #[test]
    fn test_release_never_underflows() {
        let state = state(1);
        state.release_session();
        assert_eq!(state.active_sessions(), 0);
    }

    #[test]
    fn test_default_options_follow_config() {
        let mut config = AppConfig::default();
        config.models.language = Some("de".to_string());
        config.models.task = "translate".to_string();
        let state = AppState::new(
            config,
            Arc::new(ModelManager::new("small", "cpu")),
            Arc::new(JobQueue::new()),
        );

        let options = state.default_options();
        assert_eq!(options.language.as_deref(), Some("de"));
        assert_eq!(options.task, crate::transcription::Task::Translate);
    }
}
