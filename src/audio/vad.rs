//! Voice activity segmentation.
//!
//! Turns a stream of fixed-size PCM frames into utterances: runs of speech
//! bounded by a debounced onset and a debounced silence timeout. The
//! segmenter is a plain synchronous state machine; callers decide where the
//! frames come from and what happens to the utterances.

use crate::audio::pcm::{bytes_to_samples, calculate_rms};
use crate::config::AudioConfig;
use crate::error::TranscriptionError;
use tracing::debug;

/// Decides whether a single frame contains speech.
pub trait FrameClassifier: Send {
    fn is_speech(&mut self, samples: &[i16]) -> bool;
}

/// RMS energy threshold classifier.
#[derive(Debug, Clone, Copy)]
pub struct EnergyClassifier {
    threshold: f32,
}

impl EnergyClassifier {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }
}

impl FrameClassifier for EnergyClassifier {
    fn is_speech(&mut self, samples: &[i16]) -> bool {
        calculate_rms(samples) > self.threshold
    }
}

/// Segmenter limits, all in bytes or frames of 16-bit mono PCM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmenterConfig {
    pub frame_bytes: usize,
    pub speech_onset_frames: usize,
    pub silence_hangover_frames: usize,
    pub min_utterance_bytes: usize,
    pub max_utterance_bytes: usize,
}

impl From<&AudioConfig> for SegmenterConfig {
    fn from(audio: &AudioConfig) -> Self {
        Self {
            frame_bytes: audio.frame_bytes(),
            speech_onset_frames: audio.speech_onset_frames,
            silence_hangover_frames: audio.silence_hangover_frames,
            min_utterance_bytes: audio.bytes_for_ms(audio.min_utterance_ms),
            max_utterance_bytes: audio.bytes_for_ms(audio.max_utterance_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmenterState {
    Silence,
    Speech,
}

/// A complete run of speech, ready for transcription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utterance {
    pub pcm: Vec<u8>,
    /// Cut at the maximum length rather than at a pause
    pub forced: bool,
}

impl Utterance {
    pub fn len(&self) -> usize {
        self.pcm.len()
    }
}

/// Frame-by-frame speech/silence state machine.
///
/// ## State transitions:
/// - **Silence → Speech**: `speech_onset_frames` consecutive speech frames.
///   The onset frames become the start of the utterance.
/// - **Speech → Silence**: `silence_hangover_frames` consecutive silence
///   frames. The utterance is emitted without the trailing silence.
///   A shorter pause followed by speech stays inside the utterance.
/// - **Speech → Speech**: the utterance reached `max_utterance_bytes` and is
///   cut there; the rest starts the next utterance.
///
/// Utterances shorter than `min_utterance_bytes` are dropped as noise.
pub struct VoiceActivitySegmenter<C: FrameClassifier = EnergyClassifier> {
    config: SegmenterConfig,
    classifier: C,
    state: SegmenterState,
    /// Speech frames not yet confirmed as an onset
    onset: Vec<u8>,
    onset_frames: usize,
    utterance: Vec<u8>,
    /// Silence inside an utterance that may still be followed by speech
    gap: Vec<u8>,
    gap_frames: usize,
}

impl VoiceActivitySegmenter<EnergyClassifier> {
    pub fn from_audio_config(audio: &AudioConfig) -> Self {
        Self::new(
            SegmenterConfig::from(audio),
            EnergyClassifier::new(audio.speech_threshold),
        )
    }
}

impl<C: FrameClassifier> VoiceActivitySegmenter<C> {
    pub fn new(mut config: SegmenterConfig, classifier: C) -> Self {
        // A cut must land on a frame boundary and leave room for the onset
        // and a full pause, otherwise one frame could force two cuts.
        let frame = config.frame_bytes.max(2);
        let floor = (config.speech_onset_frames.max(config.silence_hangover_frames) + 1) * frame;
        config.frame_bytes = frame;
        config.max_utterance_bytes = (config.max_utterance_bytes.max(floor) / frame) * frame;

        Self {
            config,
            classifier,
            state: SegmenterState::Silence,
            onset: Vec::new(),
            onset_frames: 0,
            utterance: Vec::new(),
            gap: Vec::new(),
            gap_frames: 0,
        }
    }

    pub fn state(&self) -> SegmenterState {
        self.state
    }

    pub fn config(&self) -> &SegmenterConfig {
        &self.config
    }

    /// Feed one frame.
    ///
    /// ## Returns:
    /// - **Ok(Some(utterance))**: a pause or the length limit closed an utterance
    /// - **Ok(None)**: nothing to emit yet
    /// - **Err(FrameSize)**: the frame was dropped; state is untouched
    pub fn push_frame(&mut self, frame: &[u8]) -> Result<Option<Utterance>, TranscriptionError> {
        if frame.len() != self.config.frame_bytes {
            return Err(TranscriptionError::FrameSize {
                expected: self.config.frame_bytes,
                actual: frame.len(),
            });
        }

        let samples = bytes_to_samples(frame).map_err(TranscriptionError::Validation)?;
        let is_speech = self.classifier.is_speech(&samples);

        match (self.state, is_speech) {
            (SegmenterState::Silence, true) => {
                self.onset.extend_from_slice(frame);
                self.onset_frames += 1;
                if self.onset_frames >= self.config.speech_onset_frames {
                    debug!(frames = self.onset_frames, "speech onset");
                    self.state = SegmenterState::Speech;
                    self.utterance = std::mem::take(&mut self.onset);
                    self.onset_frames = 0;
                    return Ok(self.cut_if_full());
                }
                Ok(None)
            }
            (SegmenterState::Silence, false) => {
                self.onset.clear();
                self.onset_frames = 0;
                Ok(None)
            }
            (SegmenterState::Speech, true) => {
                if self.gap_frames > 0 {
                    self.utterance.append(&mut self.gap);
                    self.gap_frames = 0;
                }
                self.utterance.extend_from_slice(frame);
                Ok(self.cut_if_full())
            }
            (SegmenterState::Speech, false) => {
                self.gap.extend_from_slice(frame);
                self.gap_frames += 1;
                if self.gap_frames >= self.config.silence_hangover_frames {
                    self.gap.clear();
                    self.gap_frames = 0;
                    self.state = SegmenterState::Silence;
                    return Ok(self.take_utterance());
                }
                Ok(None)
            }
        }
    }

    /// Feed a buffer holding any number of whole frames.
    ///
    /// Frame-size errors cannot happen part way through: a buffer that is
    /// not a multiple of the frame size is rejected before any frame is fed.
    #[cfg(test)]
    pub fn push(&mut self, pcm: &[u8]) -> Result<Vec<Utterance>, TranscriptionError> {
        if pcm.len() % self.config.frame_bytes != 0 {
            return Err(TranscriptionError::FrameSize {
                expected: self.config.frame_bytes,
                actual: pcm.len() % self.config.frame_bytes,
            });
        }

        let mut out = Vec::new();
        for frame in pcm.chunks_exact(self.config.frame_bytes) {
            if let Some(utterance) = self.push_frame(frame)? {
                out.push(utterance);
            }
        }
        Ok(out)
    }

    /// End of stream: flush a partial utterance if it is long enough.
    ///
    /// Unconfirmed onset frames and trailing silence are discarded.
    pub fn finish(&mut self) -> Option<Utterance> {
        let flushed = match self.state {
            SegmenterState::Speech => self.take_utterance(),
            SegmenterState::Silence => None,
        };
        self.reset();
        flushed
    }

    pub fn reset(&mut self) {
        self.state = SegmenterState::Silence;
        self.onset.clear();
        self.onset_frames = 0;
        self.utterance.clear();
        self.gap.clear();
        self.gap_frames = 0;
    }

    fn cut_if_full(&mut self) -> Option<Utterance> {
        if self.utterance.len() < self.config.max_utterance_bytes {
            return None;
        }
        let rest = self.utterance.split_off(self.config.max_utterance_bytes);
        let pcm = std::mem::replace(&mut self.utterance, rest);
        debug!(bytes = pcm.len(), "utterance reached maximum length");
        Some(Utterance { pcm, forced: true })
    }

    fn take_utterance(&mut self) -> Option<Utterance> {
        let pcm = std::mem::take(&mut self.utterance);
        if pcm.len() < self.config.min_utterance_bytes {
            if !pcm.is_empty() {
                debug!(bytes = pcm.len(), "discarding utterance below minimum length");
            }
            return None;
        }
        Some(Utterance { pcm, forced: false })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::pcm::samples_to_bytes;

    const FRAME_SAMPLES: usize = 480;
    const FRAME_BYTES: usize = FRAME_SAMPLES * 2;

    fn config() -> SegmenterConfig {
        SegmenterConfig {
            frame_bytes: FRAME_BYTES,
            speech_onset_frames: 3,
            silence_hangover_frames: 5,
            min_utterance_bytes: 10 * FRAME_BYTES,
            max_utterance_bytes: 50 * FRAME_BYTES,
        }
    }

    fn segmenter() -> VoiceActivitySegmenter {
        VoiceActivitySegmenter::new(config(), EnergyClassifier::new(0.02))
    }

    fn speech_frame() -> Vec<u8> {
        let samples: Vec<i16> = (0..FRAME_SAMPLES)
            .map(|i| ((i as f32 * 0.2).sin() * 8000.0) as i16)
            .collect();
        samples_to_bytes(&samples)
    }

    fn silence_frame() -> Vec<u8> {
        vec![0u8; FRAME_BYTES]
    }

    fn feed(seg: &mut VoiceActivitySegmenter, frame: &[u8], count: usize) -> Vec<Utterance> {
        (0..count)
            .filter_map(|_| seg.push_frame(frame).unwrap())
            .collect()
    }

    #[test]
    fn test_silence_only_emits_nothing() {
        let mut seg = segmenter();
        assert!(feed(&mut seg, &silence_frame(), 500).is_empty());
        assert!(seg.finish().is_none());
    }

    #[test]
    fn test_constant_speech_is_one_utterance() {
        let mut seg = segmenter();
        assert!(feed(&mut seg, &speech_frame(), 40).is_empty());
        assert_eq!(seg.state(), SegmenterState::Speech);

        let utterance = seg.finish().expect("flushed on finish");
        assert_eq!(utterance.len(), 40 * FRAME_BYTES);
        assert!(!utterance.forced);
    }

    #[test]
    fn test_emits_at_silence_boundary() {
        let mut seg = segmenter();
        assert!(feed(&mut seg, &speech_frame(), 20).is_empty());
        // Four silence frames are still inside the hangover
        assert!(feed(&mut seg, &silence_frame(), 4).is_empty());

        let utterance = seg
            .push_frame(&silence_frame())
            .unwrap()
            .expect("emitted on the fifth silence frame");
        assert_eq!(utterance.len(), 20 * FRAME_BYTES);
        assert_eq!(seg.state(), SegmenterState::Silence);

        assert!(feed(&mut seg, &silence_frame(), 100).is_empty());
        assert!(seg.finish().is_none());
    }

    #[test]
    fn test_short_pause_stays_inside_utterance() {
        let mut seg = segmenter();
        feed(&mut seg, &speech_frame(), 10);
        feed(&mut seg, &silence_frame(), 3);
        feed(&mut seg, &speech_frame(), 10);
        let out = feed(&mut seg, &silence_frame(), 5);

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].len(), 23 * FRAME_BYTES);
    }

    #[test]
    fn test_blip_below_onset_is_ignored() {
        let mut seg = segmenter();
        for _ in 0..20 {
            feed(&mut seg, &speech_frame(), 2);
            feed(&mut seg, &silence_frame(), 1);
        }
        assert_eq!(seg.state(), SegmenterState::Silence);
        assert!(seg.finish().is_none());
    }

    #[test]
    fn test_utterance_below_minimum_is_discarded() {
        let mut seg = segmenter();
        feed(&mut seg, &speech_frame(), 6);
        assert!(feed(&mut seg, &silence_frame(), 5).is_empty());
        assert_eq!(seg.state(), SegmenterState::Silence);
    }

    #[test]
    fn test_long_run_is_split_at_maximum() {
        let mut seg = segmenter();
        let mut out = feed(&mut seg, &speech_frame(), 125);
        out.extend(seg.finish());

        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|u| u.len() <= 50 * FRAME_BYTES));
        assert!(out[0].forced && out[1].forced && !out[2].forced);
        let total: usize = out.iter().map(Utterance::len).sum();
        assert_eq!(total, 125 * FRAME_BYTES);
    }

    #[test]
    fn test_wrong_frame_size_leaves_state_alone() {
        let mut seg = segmenter();
        feed(&mut seg, &speech_frame(), 5);

        let err = seg.push_frame(&[0u8; 100]).unwrap_err();
        assert_eq!(
            err,
            TranscriptionError::FrameSize { expected: FRAME_BYTES, actual: 100 }
        );
        assert_eq!(seg.state(), SegmenterState::Speech);

        feed(&mut seg, &speech_frame(), 5);
        assert_eq!(seg.finish().unwrap().len(), 10 * FRAME_BYTES);
    }

    #[test]
    fn test_push_buffer_of_frames() {
        let mut seg = segmenter();
        let mut pcm = Vec::new();
        for _ in 0..20 {
            pcm.extend(speech_frame());
        }
        for _ in 0..5 {
            pcm.extend(silence_frame());
        }

        let out = seg.push(&pcm).unwrap();
        assert_eq!(out.len(), 1);
        assert!(seg.push(&pcm[..FRAME_BYTES + 1]).is_err());
    }

    #[test]
    fn test_from_audio_config() {
        let audio = crate::config::AppConfig::default().audio;
        let seg = VoiceActivitySegmenter::from_audio_config(&audio);
        assert_eq!(seg.config().frame_bytes, 960);
        assert_eq!(seg.config().max_utterance_bytes, 960_000);
    }
}
