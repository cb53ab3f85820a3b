//! # Model Manager
//!
//! Owns the single speech engine and is the only way to reach it. Loading
//! happens once, in the background; until it finishes (or if it fails) every
//! transcription request gets an inference error and health reports why.
//!
//! ## Concurrency:
//! The engine sits behind a `Mutex`, which is the execution gate: callers
//! from job workers and streaming sessions queue on the lock and the engine
//! only ever runs one request at a time. The async wrapper moves the
//! blocking call onto tokio's blocking pool so protocol handlers never wait
//! on inference.

use crate::audio::pcm::bytes_to_f32;
use crate::config::ModelsConfig;
use crate::device::{create_device_from_string, DeviceManager};
use crate::error::TranscriptionError;
use crate::transcription::engine::{SpeechEngine, TranscribeOptions, TranscriptionResult, SAMPLE_RATE};
use crate::transcription::model::{ModelSize, WhisperEngine};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineStatus {
    Loading,
    Ready,
    Failed(String),
}

/// Side-effect-free readiness snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineHealth {
    pub loaded: bool,
    pub status: &'static str,
    pub device: String,
    pub model_size: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct ModelManager {
    engine: Mutex<Option<Box<dyn SpeechEngine>>>,
    status: RwLock<EngineStatus>,
    model_size: String,
    device: RwLock<String>,
}

impl ModelManager {
    /// A manager with no engine yet; `device` is the configured preference
    /// until the engine reports where it actually landed.
    pub fn new(model_size: impl Into<String>, device: impl Into<String>) -> Self {
        Self {
            engine: Mutex::new(None),
            status: RwLock::new(EngineStatus::Loading),
            model_size: model_size.into(),
            device: RwLock::new(device.into()),
        }
    }

    /// Make `engine` the one all requests run on.
    pub fn install(&self, engine: Box<dyn SpeechEngine>, device: impl Into<String>) {
        info!(engine = %engine.name(), "speech engine ready");
        *self.lock_engine() = Some(engine);
        *self.device.write().unwrap_or_else(|e| e.into_inner()) = device.into();
        *self.status.write().unwrap_or_else(|e| e.into_inner()) = EngineStatus::Ready;
    }

    /// Record a load failure. The process keeps serving; health reports it.
    pub fn mark_failed(&self, reason: impl Into<String>) {
        let reason = reason.into();
        error!(%reason, "speech engine failed to load");
        *self.status.write().unwrap_or_else(|e| e.into_inner()) = EngineStatus::Failed(reason);
    }

    pub fn status(&self) -> EngineStatus {
        self.status.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_ready(&self) -> bool {
        self.status() == EngineStatus::Ready
    }

    pub fn health(&self) -> EngineHealth {
        let status = self.status();
        let (label, error) = match &status {
            EngineStatus::Loading => ("loading", None),
            EngineStatus::Ready => ("ready", None),
            EngineStatus::Failed(reason) => ("failed", Some(reason.clone())),
        };
        EngineHealth {
            loaded: status == EngineStatus::Ready,
            status: label,
            device: self.device.read().unwrap_or_else(|e| e.into_inner()).clone(),
            model_size: self.model_size.clone(),
            error,
        }
    }

    /// Transcribe 16-bit mono PCM. Blocks until the engine is free and done.
    ///
    /// ## Errors:
    /// `Inference` for odd-length or empty input, an engine that is not
    /// loaded, or an engine fault.
    pub fn transcribe(
        &self,
        pcm: &[u8],
        options: &TranscribeOptions,
    ) -> Result<TranscriptionResult, TranscriptionError> {
        let samples = bytes_to_f32(pcm).map_err(TranscriptionError::Inference)?;
        if samples.is_empty() {
            return Err(TranscriptionError::Inference("audio is empty".to_string()));
        }

        let mut guard = self.lock_engine();
        let engine = guard.as_mut().ok_or_else(|| self.not_ready())?;

        let started = Instant::now();
        let output = engine.transcribe(&samples, options)?;
        drop(guard);

        let result = TranscriptionResult::from_output(output, started.elapsed());
        debug!(
            audio_secs = samples.len() as f64 / SAMPLE_RATE as f64,
            processing_secs = result.processing_time_seconds,
            language = %result.language,
            "transcription finished"
        );
        Ok(result)
    }

    /// Non-blocking wrapper: runs [`transcribe`](Self::transcribe) on the
    /// blocking thread pool.
    pub async fn transcribe_async(
        self: &Arc<Self>,
        pcm: Vec<u8>,
        options: TranscribeOptions,
    ) -> Result<TranscriptionResult, TranscriptionError> {
        let manager = Arc::clone(self);
        tokio::task::spawn_blocking(move || manager.transcribe(&pcm, &options))
            .await
            .map_err(|e| TranscriptionError::Inference(format!("transcription task failed: {}", e)))?
    }

    /// Load the configured Whisper model in the background.
    pub fn spawn_load(self: &Arc<Self>, models: &ModelsConfig) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let size = models.whisper_model.clone();
        let device_pref = models.device.clone();

        tokio::spawn(async move {
            let size = match size.parse::<ModelSize>() {
                Ok(size) => size,
                Err(e) => {
                    manager.mark_failed(TranscriptionError::EngineLoad(e.to_string()).to_string());
                    return;
                }
            };

            let device = create_device_from_string(&device_pref);
            let label = DeviceManager::label(&device);
            match WhisperEngine::load(size, device).await {
                Ok(engine) => manager.install(Box::new(engine), label),
                Err(e) => {
                    manager.mark_failed(TranscriptionError::EngineLoad(e.to_string()).to_string())
                }
            }
        })
    }

    fn not_ready(&self) -> TranscriptionError {
        match self.status() {
            EngineStatus::Failed(reason) => {
                TranscriptionError::Inference(format!("model failed to load: {}", reason))
            }
            _ => TranscriptionError::Inference("model is not loaded yet".to_string()),
        }
    }

    fn lock_engine(&self) -> MutexGuard<'_, Option<Box<dyn SpeechEngine>>> {
        self.engine.lock().unwrap_or_else(|poisoned| {
            warn!("engine lock poisoned by a panicked request, continuing");
            poisoned.into_inner()
        })
    }
}
