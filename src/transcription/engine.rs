//! # Speech Engine Contract
//!
//! The rest of the service sees the model only through [`SpeechEngine`]:
//! normalized samples and options in, language plus timed text segments
//! out. The Whisper implementation lives in `model.rs`; tests swap in a
//! deterministic fake.

use crate::error::TranscriptionError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Rate every engine consumes, in Hz.
pub const SAMPLE_RATE: u32 = 16_000;

/// What the model should produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Task {
    #[default]
    Transcribe,
    /// Translate to English
    Translate,
}

impl std::str::FromStr for Task {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "transcribe" => Ok(Task::Transcribe),
            "translate" => Ok(Task::Translate),
            _ => Err(format!("Unknown task: {}", s)),
        }
    }
}

/// Per-request hints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscribeOptions {
    /// ISO 639-1 code; `None` lets the engine detect the language
    pub language: Option<String>,
    pub task: Task,
}

impl TranscribeOptions {
    /// Apply client-supplied hints on top of these defaults.
    ///
    /// Blank values and `auto` leave the default in place. Unknown languages
    /// or tasks are a `Validation` error.
    pub fn with_hints(
        mut self,
        language: Option<&str>,
        task: Option<&str>,
    ) -> Result<Self, TranscriptionError> {
        if let Some(code) = language.map(str::trim).filter(|c| !c.is_empty()) {
            let code = code.to_lowercase();
            if code == "auto" {
                self.language = None;
            } else if crate::transcription::model::LANGUAGES.contains(&code.as_str()) {
                self.language = Some(code);
            } else {
                return Err(TranscriptionError::Validation(format!("Unsupported language: {}", code)));
            }
        }
        if let Some(task) = task.map(str::trim).filter(|t| !t.is_empty()) {
            self.task = task.parse().map_err(TranscriptionError::Validation)?;
        }
        Ok(self)
    }
}

/// A stretch of recognized text, in seconds from the start of the input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// Raw engine output before timing and text assembly.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineOutput {
    pub language: String,
    pub language_probability: f32,
    pub segments: Vec<Segment>,
}

/// A loaded speech model.
///
/// `transcribe` takes `&mut self`: decoders keep caches between steps, so
/// an engine is never shared without exclusive access. The model manager
/// provides that access.
pub trait SpeechEngine: Send {
    /// `samples` are mono floats in [-1.0, 1.0] at 16 kHz.
    fn transcribe(
        &mut self,
        samples: &[f32],
        options: &TranscribeOptions,
    ) -> Result<EngineOutput, TranscriptionError>;

    /// Human-readable model name for logs.
    fn name(&self) -> String;
}

/// Final result handed to clients and stored on finished jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionResult {
    pub text: String,
    pub language: String,
    pub language_probability: f32,
    pub processing_time_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segments: Option<Vec<Segment>>,
}

impl TranscriptionResult {
    /// Join segment texts and stamp the processing time (millisecond precision).
    pub fn from_output(output: EngineOutput, elapsed: Duration) -> Self {
        let text = output
            .segments
            .iter()
            .map(|segment| segment.text.trim())
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join(" ");

        Self {
            text,
            language: output.language,
            language_probability: output.language_probability.clamp(0.0, 1.0),
            processing_time_seconds: (elapsed.as_secs_f64() * 1000.0).round() / 1000.0,
            segments: Some(output.segments),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Deterministic engine for exercising the pipeline without model weights.

    use super::*;
    use crate::audio::pcm::calculate_rms;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Clone, Default)]
    pub struct FakeEngine {
        pub calls: Arc<AtomicUsize>,
        pub max_in_flight: Arc<AtomicUsize>,
        in_flight: Arc<AtomicUsize>,
        delay: Duration,
        fail: bool,
    }

    impl FakeEngine {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_delay(delay: Duration) -> Self {
            Self { delay, ..Self::default() }
        }

        pub fn failing() -> Self {
            Self { fail: true, ..Self::default() }
        }
    }

    impl SpeechEngine for FakeEngine {
        fn transcribe(
            &mut self,
            samples: &[f32],
            options: &TranscribeOptions,
        ) -> Result<EngineOutput, TranscriptionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.fail {
                return Err(TranscriptionError::Inference("fake engine failure".to_string()));
            }

            let quantized: Vec<i16> = samples.iter().map(|s| (s * 32767.0) as i16).collect();
            let segments = if calculate_rms(&quantized) < 0.01 {
                Vec::new()
            } else {
                vec![Segment {
                    start: 0.0,
                    end: samples.len() as f64 / SAMPLE_RATE as f64,
                    text: format!(" speech {} samples ", samples.len()),
                }]
            };

            Ok(EngineOutput {
                language: options.language.clone().unwrap_or_else(|| "en".to_string()),
                language_probability: if options.language.is_some() { 1.0 } else { 0.9 },
                segments,
            })
        }

        fn name(&self) -> String {
            "fake".to_string()
        }
    }
}
