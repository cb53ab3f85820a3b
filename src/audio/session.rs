//! # Streaming Session Controller
//!
//! One [`StreamingSession`] per live connection. It owns a private pipeline:
//!
//! ```text
//! feed() ─▶ [transcoder] ─▶ frame assembly ─▶ segmenter ─▶ utterances ─▶ model manager ─▶ events
//! ```
//!
//! ## Concurrency:
//! - A segmentation task runs the (optional) transcoder output through the
//!   voice activity segmenter.
//! - A transcription task takes utterances one at a time, so a session never
//!   has more than one request in the model manager and results come back in
//!   speaking order.
//! - Every audio hop is a bounded channel. When transcription falls behind,
//!   the pipeline fills up and `feed` waits, slowing the client down.
//! - Events are unbounded: the connection may be parked in `feed` and must
//!   never be what the transcription task waits on.
//!
//! ## Teardown:
//! [`finish`](StreamingSession::finish) is the graceful path: input closes,
//! the transcoder flushes, the segmenter emits its last utterance, and the
//! event stream ends with [`SessionEvent::Finished`].
//! [`abort`](StreamingSession::abort) (also run on drop) kills the
//! transcoder, abandons queued utterances and discards an in-flight result.

use crate::audio::normalizer::{AudioNormalizer, TranscoderHandle};
use crate::audio::pcm::FrameAssembler;
use crate::audio::vad::{EnergyClassifier, SegmenterConfig, Utterance, VoiceActivitySegmenter};
use crate::config::AppConfig;
use crate::error::TranscriptionError;
use crate::transcription::{ModelManager, TranscribeOptions, TranscriptionResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What the client sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionInput {
    /// Raw 16-bit mono PCM at the configured rate, whole frames per message
    Pcm,
    /// Container/codec bytes for ffmpeg, e.g. `webm` from a browser recorder
    Transcoded { format: String },
}

/// Everything a session reports back to its connection.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Transcript(TranscriptionResult),
    /// Recoverable; the session keeps running
    Error(String),
    /// The transcoder died; the session cannot continue
    Fatal(String),
    /// All input processed after `finish`
    Finished,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub input: SessionInput,
    pub segmenter: SegmenterConfig,
    pub speech_threshold: f32,
    pub options: TranscribeOptions,
    pub channel_capacity: usize,
}

impl SessionConfig {
    pub fn from_app_config(config: &AppConfig, input: SessionInput, options: TranscribeOptions) -> Self {
        Self {
            input,
            segmenter: SegmenterConfig::from(&config.audio),
            speech_threshold: config.audio.speech_threshold,
            options,
            channel_capacity: config.transcode.channel_capacity.max(1),
        }
    }
}

pub struct StreamingSession {
    id: Uuid,
    input: Option<mpsc::Sender<Vec<u8>>>,
    cancelled: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
    transcoder: Option<TranscoderHandle>,
}

impl StreamingSession {
    /// Build the pipeline and start its tasks. Must run inside a tokio runtime.
    ///
    /// Returns the session and the receiving end of its event stream.
    pub fn start(
        config: SessionConfig,
        manager: Arc<ModelManager>,
        normalizer: &AudioNormalizer,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>), TranscriptionError> {
        let id = Uuid::new_v4();
        let capacity = config.channel_capacity.max(1);
        let cancelled = Arc::new(AtomicBool::new(false));

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (utterance_tx, utterance_rx) = mpsc::channel::<Utterance>(capacity);
        let segmenter = VoiceActivitySegmenter::new(
            config.segmenter,
            EnergyClassifier::new(config.speech_threshold),
        );

        let (input, transcoder, segmentation) = match &config.input {
            SessionInput::Pcm => {
                let (input_tx, input_rx) = mpsc::channel(capacity);
                let task = tokio::spawn(segment_pcm(
                    id,
                    input_rx,
                    segmenter,
                    utterance_tx,
                    events_tx.clone(),
                ));
                (input_tx, None, task)
            }
            SessionInput::Transcoded { format } => {
                let stream = normalizer.spawn_stream(format)?;
                let task = tokio::spawn(segment_transcoded(
                    id,
                    stream.output,
                    segmenter,
                    utterance_tx,
                    events_tx.clone(),
                ));
                (stream.input, Some(stream.handle), task)
            }
        };

        let transcription = tokio::spawn(transcribe_utterances(
            id,
            utterance_rx,
            manager,
            config.options.clone(),
            events_tx,
            Arc::clone(&cancelled),
        ));

        let pid = transcoder.as_ref().and_then(TranscoderHandle::pid);
        info!(session_id = %id, input = ?config.input, transcoder_pid = ?pid, "streaming session started");
        Ok((
            Self {
                id,
                input: Some(input),
                cancelled,
                tasks: vec![segmentation, transcription],
                transcoder,
            },
            events_rx,
        ))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Process id of the session's transcoder, if it has one.
    pub fn transcoder_pid(&self) -> Option<u32> {
        self.transcoder.as_ref().and_then(TranscoderHandle::pid)
    }

    /// A handle for feeding audio; `None` after `finish` or `abort`.
    ///
    /// Sending waits while the pipeline is full.
    pub fn input(&self) -> Option<mpsc::Sender<Vec<u8>>> {
        self.input.clone()
    }

    /// Push one chunk of client audio into the pipeline.
    pub async fn feed(&self, chunk: Vec<u8>) -> Result<(), TranscriptionError> {
        let input = self.input.as_ref().ok_or_else(closed_input)?;
        input.send(chunk).await.map_err(|_| closed_input())
    }

    /// End of stream: drain everything already fed, then emit `Finished`.
    pub fn finish(&mut self) {
        if self.input.take().is_some() {
            debug!(session_id = %self.id, "session input closed");
        }
    }

    /// Tear the session down immediately.
    pub fn abort(&mut self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let was_running = !self.is_released();
        self.input = None;
        if let Some(transcoder) = &self.transcoder {
            transcoder.abort();
        }
        for task in &self.tasks {
            task.abort();
        }
        if was_running {
            info!(session_id = %self.id, "streaming session aborted");
        }
    }

    /// Every task has stopped and the transcoder (if any) is gone.
    pub fn is_released(&self) -> bool {
        self.tasks.iter().all(JoinHandle::is_finished)
            && self.transcoder.as_ref().map_or(true, TranscoderHandle::is_finished)
    }
}

impl Drop for StreamingSession {
    fn drop(&mut self) {
        self.abort();
    }
}

fn closed_input() -> TranscriptionError {
    TranscriptionError::Transcode("session input is closed".to_string())
}

/// Raw PCM: every message must be whole frames. A trailing partial frame is
/// dropped and reported; the rest of the message is still used.
async fn segment_pcm(
    id: Uuid,
    mut input: mpsc::Receiver<Vec<u8>>,
    mut segmenter: VoiceActivitySegmenter,
    utterances: mpsc::Sender<Utterance>,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    let frame_bytes = segmenter.config().frame_bytes;
    while let Some(chunk) = input.recv().await {
        for frame in chunk.chunks(frame_bytes) {
            match segmenter.push_frame(frame) {
                Ok(Some(utterance)) => {
                    if utterances.send(utterance).await.is_err() {
                        return;
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    debug!(session_id = %id, "dropping frame: {}", err);
                    if events.send(SessionEvent::Error(err.to_string())).is_err() {
                        return;
                    }
                }
            }
        }
    }

    if let Some(utterance) = segmenter.finish() {
        let _ = utterances.send(utterance).await;
    }
}

/// Transcoder output: arbitrary-sized PCM chunks, re-framed before
/// segmentation. A transcoder failure ends the session.
async fn segment_transcoded(
    id: Uuid,
    mut pcm: mpsc::Receiver<Result<Vec<u8>, TranscriptionError>>,
    mut segmenter: VoiceActivitySegmenter,
    utterances: mpsc::Sender<Utterance>,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    let mut assembler = FrameAssembler::new(segmenter.config().frame_bytes);
    while let Some(chunk) = pcm.recv().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                warn!(session_id = %id, "transcoder failed: {}", err);
                let _ = events.send(SessionEvent::Fatal(err.to_string()));
                return;
            }
        };

        for frame in assembler.push(&chunk) {
            // Assembled frames always have the configured size
            if let Ok(Some(utterance)) = segmenter.push_frame(&frame) {
                if utterances.send(utterance).await.is_err() {
                    return;
                }
            }
        }
    }

    if assembler.pending_len() > 0 {
        debug!(session_id = %id, bytes = assembler.pending_len(), "discarding partial trailing frame");
    }
    if let Some(utterance) = segmenter.finish() {
        let _ = utterances.send(utterance).await;
    }
}

async fn transcribe_utterances(
    id: Uuid,
    mut utterances: mpsc::Receiver<Utterance>,
    manager: Arc<ModelManager>,
    options: TranscribeOptions,
    events: mpsc::UnboundedSender<SessionEvent>,
    cancelled: Arc<AtomicBool>,
) {
    let mut sent = 0usize;
    while let Some(utterance) = utterances.recv().await {
        if cancelled.load(Ordering::SeqCst) {
            return;
        }

        let bytes = utterance.len();
        let result = manager.transcribe_async(utterance.pcm, options.clone()).await;
        if cancelled.load(Ordering::SeqCst) {
            debug!(session_id = %id, "discarding result of cancelled session");
            return;
        }

        let event = match result {
            Ok(result) if result.text.trim().is_empty() => {
                debug!(session_id = %id, bytes, "utterance produced no text");
                continue;
            }
            Ok(result) => {
                sent += 1;
                SessionEvent::Transcript(result)
            }
            Err(err) => {
                warn!(session_id = %id, bytes, "utterance transcription failed: {}", err);
                SessionEvent::Error("Transcription failed.".to_string())
            }
        };
        if events.send(event).is_err() {
            return;
        }
    }

    info!(session_id = %id, transcripts = sent, "streaming session finished");
    let _ = events.send(SessionEvent::Finished);
}
