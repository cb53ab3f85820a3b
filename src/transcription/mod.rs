//! # Transcription Module
//!
//! Speech-to-text through a single shared engine.
//!
//! ## Key Components:
//! - **engine**: the `SpeechEngine` contract and result types
//! - **model**: Whisper on candle, downloaded from HuggingFace
//! - **manager**: ownership of the engine, readiness, and the execution gate
//!
//! ## Whisper Model Sizes:
//! - **tiny** / **base**: fast, good for development
//! - **small**: default, balanced
//! - **medium**: better accuracy, handles technical vocabulary
//! - **large** / **large-v2** / **large-v3**: best accuracy, slowest

pub mod engine;
pub mod manager;
pub mod model;

pub use engine::{SpeechEngine, SAMPLE_RATE, Task, TranscribeOptions, TranscriptionResult};
pub use manager::ModelManager;
