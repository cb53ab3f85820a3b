//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: Serialization/deserialization between Rust structs and data formats
//! - **derive macros**: Automatically generate code for common traits
//! - **impl blocks**: Add methods to structs
//! - **Result<T, E>**: Error handling that forces you to handle potential failures
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platforms set these)
//! 2. Environment variables (`APP_SERVER__PORT`, `APP_AUDIO__SPEECH_THRESHOLD`, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! Sections are separated from keys with a double underscore so that keys
//! containing underscores (`max_utterance_ms`) survive the mapping.

use crate::device::DevicePreference;
use crate::transcription::model::ModelSize;
use crate::transcription::SAMPLE_RATE;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Upper bound on the job worker pool. Each worker can hold a decoded upload
/// in memory while it waits on the engine.
pub const MAX_WORKERS: usize = 16;

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Each component receives only its own section, which keeps the audio
/// pipeline testable without a full application config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub models: ModelsConfig,
    pub audio: AudioConfig,
    pub jobs: JobsConfig,
    pub transcode: TranscodeConfig,
    pub upload: UploadConfig,
    pub performance: PerformanceConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Speech model configuration.
///
/// ## Fields:
/// - `whisper_model`: tiny, base, small, medium, large, large-v2, large-v3
/// - `device`: auto, cpu, cuda, metal
/// - `language`: default language hint; `None` lets the model detect it
/// - `task`: `transcribe` or `translate` (to English)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    pub whisper_model: String,
    pub device: String,
    #[serde(default)]
    pub language: Option<String>,
    pub task: String,
}

/// Voice activity segmentation settings for streaming sessions.
///
/// ## Tuning guidelines:
/// - A higher `speech_threshold` ignores more background noise but can clip
///   quiet speakers
/// - `silence_hangover_frames` trades latency (results arrive later) for
///   fewer mid-sentence cuts
/// - `max_utterance_ms` bounds memory and engine latency for people who
///   never pause
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Must equal the engine rate, [`SAMPLE_RATE`]
    pub sample_rate: u32,
    pub frame_duration_ms: u32,
    /// RMS level (0.0 to 1.0) above which a frame counts as speech
    pub speech_threshold: f32,
    pub speech_onset_frames: usize,
    pub silence_hangover_frames: usize,
    pub min_utterance_ms: u32,
    pub max_utterance_ms: u32,
}

/// Batch job settings.
///
/// `retention_seconds = 0` keeps finished jobs until restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    pub worker_count: usize,
    pub retention_seconds: u64,
    pub sweep_interval_seconds: u64,
}

/// External transcoder (ffmpeg) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscodeConfig {
    pub ffmpeg_path: String,
    /// Upper bound for one batch conversion
    pub timeout_seconds: u64,
    /// ffmpeg demuxer used for streaming input unless the client overrides it
    pub stream_input_format: String,
    /// Capacity of the bounded channels between a session and its transcoder
    pub channel_capacity: usize,
}

/// Upload validation for the batch and synchronous endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    pub max_file_size_mb: u64,
    pub allowed_extensions: Vec<String>,
}

/// Performance tuning configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8000,
            },
            models: ModelsConfig {
                whisper_model: "small".to_string(),
                device: "auto".to_string(),
                language: None,
                task: "transcribe".to_string(),
            },
            audio: AudioConfig {
                sample_rate: SAMPLE_RATE,
                frame_duration_ms: 30,
                speech_threshold: 0.02,
                speech_onset_frames: 3,
                silence_hangover_frames: 17, // ~500ms at 30ms frames
                min_utterance_ms: 250,
                max_utterance_ms: 30_000,
            },
            jobs: JobsConfig {
                worker_count: 1,
                retention_seconds: 3600,
                sweep_interval_seconds: 60,
            },
            transcode: TranscodeConfig {
                ffmpeg_path: "ffmpeg".to_string(),
                timeout_seconds: 120,
                stream_input_format: "webm".to_string(),
                channel_capacity: 16,
            },
            upload: UploadConfig {
                max_file_size_mb: 50,
                allowed_extensions: ["mp3", "wav", "m4a", "flac", "ogg", "wma", "aac"]
                    .iter()
                    .map(|ext| ext.to_string())
                    .collect(),
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 10,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and the environment.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_MODELS__WHISPER_MODEL=base`: Override whisper model
    /// - `APP_JOBS__WORKER_COUNT=2`: Two batch workers
    /// - `HOST=0.0.0.0` / `PORT=3000`: Deployment platform overrides
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// Catching configuration errors at startup gives one clear message
    /// instead of a confusing failure on the first request.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        self.models
            .whisper_model
            .parse::<ModelSize>()
            .map_err(|e| anyhow::anyhow!("Invalid models.whisper_model: {}", e))?;
        self.models
            .device
            .parse::<DevicePreference>()
            .map_err(|e| anyhow::anyhow!("Invalid models.device: {}", e))?;
        if !matches!(self.models.task.as_str(), "transcribe" | "translate") {
            return Err(anyhow::anyhow!(
                "models.task must be 'transcribe' or 'translate', got '{}'",
                self.models.task
            ));
        }

        self.audio.validate()?;

        if self.jobs.worker_count == 0 || self.jobs.worker_count > MAX_WORKERS {
            return Err(anyhow::anyhow!(
                "jobs.worker_count must be between 1 and {}",
                MAX_WORKERS
            ));
        }
        if self.jobs.sweep_interval_seconds == 0 {
            return Err(anyhow::anyhow!("jobs.sweep_interval_seconds must be greater than 0"));
        }

        if self.transcode.ffmpeg_path.trim().is_empty() {
            return Err(anyhow::anyhow!("transcode.ffmpeg_path cannot be empty"));
        }
        if self.transcode.timeout_seconds == 0 {
            return Err(anyhow::anyhow!("transcode.timeout_seconds must be greater than 0"));
        }
        if self.transcode.channel_capacity == 0 {
            return Err(anyhow::anyhow!("transcode.channel_capacity must be greater than 0"));
        }

        if !(1..=1000).contains(&self.upload.max_file_size_mb) {
            return Err(anyhow::anyhow!("upload.max_file_size_mb must be between 1 and 1000"));
        }
        if self.upload.allowed_extensions.is_empty() {
            return Err(anyhow::anyhow!("upload.allowed_extensions cannot be empty"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        Ok(())
    }
}

impl AudioConfig {
    /// Samples in one frame.
    pub fn frame_samples(&self) -> usize {
        (self.sample_rate as usize * self.frame_duration_ms as usize) / 1000
    }

    /// Bytes in one frame of 16-bit mono PCM (960 at the defaults).
    pub fn frame_bytes(&self) -> usize {
        self.frame_samples() * 2
    }

    /// Byte length of `ms` milliseconds of 16-bit mono PCM.
    pub fn bytes_for_ms(&self, ms: u32) -> usize {
        (self.sample_rate as usize * ms as usize / 1000) * 2
    }

    fn validate(&self) -> Result<()> {
        if self.sample_rate != SAMPLE_RATE {
            return Err(anyhow::anyhow!(
                "audio.sample_rate must be {} (the engine's input rate), got {}",
                SAMPLE_RATE,
                self.sample_rate
            ));
        }
        if !matches!(self.frame_duration_ms, 10 | 20 | 30) {
            return Err(anyhow::anyhow!(
                "audio.frame_duration_ms must be 10, 20 or 30, got {}",
                self.frame_duration_ms
            ));
        }
        if !(self.speech_threshold > 0.0 && self.speech_threshold < 1.0) {
            return Err(anyhow::anyhow!("audio.speech_threshold must be in (0, 1)"));
        }
        if self.speech_onset_frames == 0 || self.silence_hangover_frames == 0 {
            return Err(anyhow::anyhow!(
                "audio.speech_onset_frames and audio.silence_hangover_frames must be at least 1"
            ));
        }
        if self.max_utterance_ms <= self.min_utterance_ms {
            return Err(anyhow::anyhow!(
                "audio.max_utterance_ms must be greater than audio.min_utterance_ms"
            ));
        }
        if self.max_utterance_ms < self.frame_duration_ms {
            return Err(anyhow::anyhow!("audio.max_utterance_ms must cover at least one frame"));
        }
        Ok(())
    }
}

impl UploadConfig {
    pub fn max_bytes(&self) -> usize {
        self.max_file_size_mb as usize * 1024 * 1024
    }

    /// Lower-cased extension of `filename` if it is on the allow list.
    pub fn allowed_extension(&self, filename: &str) -> Option<String> {
        let ext = std::path::Path::new(filename)
            .extension()?
            .to_str()?
            .to_lowercase();
        self.allowed_extensions
            .iter()
            .any(|allowed| allowed.trim_start_matches('.').eq_ignore_ascii_case(&ext))
            .then_some(ext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.jobs.retention_seconds, 3600);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.jobs.worker_count = MAX_WORKERS + 1;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.frame_duration_ms = 25;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.max_utterance_ms = config.audio.min_utterance_ms;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.models.whisper_model = "gigantic".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sample_rate_must_match_engine() {
        let mut config = AppConfig::default();
        config.audio.sample_rate = 8000;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("audio.sample_rate"), "{}", err);

        config.audio.sample_rate = 48_000;
        assert!(config.validate().is_err());

        config.audio.sample_rate = SAMPLE_RATE;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_frame_geometry() {
        let audio = AppConfig::default().audio;
        assert_eq!(audio.frame_samples(), 480);
        assert_eq!(audio.frame_bytes(), 960);
        assert_eq!(audio.bytes_for_ms(1000), 32_000);
    }

    #[test]
    fn test_allowed_extension() {
        let upload = AppConfig::default().upload;
        assert_eq!(upload.allowed_extension("talk.WAV"), Some("wav".to_string()));
        assert_eq!(upload.allowed_extension("notes.txt"), None);
        assert_eq!(upload.allowed_extension("no_extension"), None);
        assert_eq!(upload.max_bytes(), 50 * 1024 * 1024);
    }
}
