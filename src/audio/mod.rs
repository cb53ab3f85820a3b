//! # Audio Processing Module
//!
//! Everything between client bytes and the speech engine.
//!
//! ## Key Components:
//! - **pcm**: byte/sample conversion, RMS, frame assembly
//! - **normalizer**: ffmpeg to 16 kHz mono 16-bit PCM, whole-file or streaming
//! - **vad**: frame-level voice activity segmentation into utterances
//! - **session**: the per-connection streaming pipeline
//!
//! ## Audio Format (after normalization):
//! - **Sample Rate**: 16kHz (16,000 Hz)
//! - **Bit Depth**: 16-bit PCM
//! - **Channels**: Mono (1 channel)
//! - **Encoding**: Little-endian signed integers

pub mod normalizer;
pub mod pcm;
pub mod session;
pub mod vad;
