//! # Audio Normalizer
//!
//! Converts whatever the client sent into 16-bit little-endian mono PCM at
//! the configured sample rate, using an external ffmpeg process.
//!
//! ## Two modes:
//! - **Batch** ([`AudioNormalizer::normalize`]): one upload in, one PCM
//!   buffer out. Blocking; runs on worker threads or the blocking pool.
//! - **Streaming** ([`AudioNormalizer::spawn_stream`]): a long-lived process
//!   fed through a bounded channel. Feeding waits when the channel and the
//!   pipe behind it are full, so a slow transcoder slows the client down
//!   instead of dropping audio.
//!
//! In both modes the child process is killed and reaped on every exit path.

use crate::audio::pcm::samples_to_bytes;
use crate::config::TranscodeConfig;
use crate::error::TranscriptionError;
use std::io::{Cursor, Read};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long a streaming transcoder may take to exit after its input closed.
const EXIT_GRACE: Duration = Duration::from_secs(5);
const READ_CHUNK: usize = 8192;
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Factory for batch conversions and streaming transcoders.
#[derive(Debug, Clone)]
pub struct AudioNormalizer {
    ffmpeg_path: String,
    timeout: Duration,
    sample_rate: u32,
    channel_capacity: usize,
}

impl AudioNormalizer {
    pub fn new(transcode: &TranscodeConfig, sample_rate: u32) -> Self {
        Self {
            ffmpeg_path: transcode.ffmpeg_path.clone(),
            timeout: Duration::from_secs(transcode.timeout_seconds),
            sample_rate,
            channel_capacity: transcode.channel_capacity.max(1),
        }
    }

    /// Convert a complete upload to PCM.
    ///
    /// ## Parameters:
    /// - **data**: the uploaded file
    /// - **format_hint**: file extension, passed to ffmpeg through the temp
    ///   file name so container probing has a head start
    ///
    /// ## Errors:
    /// `Transcode` when the input is empty, ffmpeg cannot be started, exits
    /// non-zero, runs past the timeout, or produces no audio.
    pub fn normalize(
        &self,
        data: &[u8],
        format_hint: Option<&str>,
    ) -> Result<Vec<u8>, TranscriptionError> {
        if data.is_empty() {
            return Err(TranscriptionError::Transcode("input is empty".to_string()));
        }

        if let Some(pcm) = self.wav_fast_path(data) {
            debug!(bytes = pcm.len(), "WAV already in target format, skipping ffmpeg");
            return Ok(pcm);
        }

        let input = TempInput::write(data, format_hint)?;
        let pcm = self.run_ffmpeg(&input.path)?;
        if pcm.is_empty() {
            return Err(TranscriptionError::Transcode(
                "ffmpeg produced no audio".to_string(),
            ));
        }
        Ok(pcm)
    }

    /// Decode in-process when the upload is already 16-bit PCM, mono, at the
    /// target rate.
    fn wav_fast_path(&self, data: &[u8]) -> Option<Vec<u8>> {
        if !data.starts_with(b"RIFF") {
            return None;
        }
        let (header, track) = wav::read(&mut Cursor::new(data)).ok()?;
        if header.audio_format != wav::WAV_FORMAT_PCM
            || header.channel_count != 1
            || header.sampling_rate != self.sample_rate
        {
            return None;
        }
        match track {
            wav::BitDepth::Sixteen(samples) if !samples.is_empty() => {
                Some(samples_to_bytes(&samples))
            }
            _ => None,
        }
    }

    fn run_ffmpeg(&self, input: &std::path::Path) -> Result<Vec<u8>, TranscriptionError> {
        let rate = self.sample_rate.to_string();
        let child = Command::new(&self.ffmpeg_path)
            .args(["-hide_banner", "-loglevel", "error", "-nostdin", "-i"])
            .arg(input)
            .args(["-f", "s16le", "-acodec", "pcm_s16le", "-ac", "1", "-ar", rate.as_str(), "pipe:1"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                TranscriptionError::Transcode(format!(
                    "failed to start {}: {}",
                    self.ffmpeg_path, e
                ))
            })?;
        let mut guard = ChildGuard(child);

        let mut stdout = guard.0.stdout.take().ok_or_else(|| {
            TranscriptionError::Transcode("ffmpeg stdout unavailable".to_string())
        })?;
        let mut stderr = guard.0.stderr.take().ok_or_else(|| {
            TranscriptionError::Transcode("ffmpeg stderr unavailable".to_string())
        })?;

        // Both pipes are drained concurrently so a chatty stderr cannot stall stdout
        let stdout_reader = std::thread::spawn(move || {
            let mut buf = Vec::new();
            stdout.read_to_end(&mut buf).map(|_| buf)
        });
        let stderr_reader = std::thread::spawn(move || {
            let mut text = String::new();
            let _ = stderr.read_to_string(&mut text);
            text
        });

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match guard.0.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() >= deadline => {
                    warn!(timeout_secs = self.timeout.as_secs(), "ffmpeg timed out, killing");
                    drop(guard);
                    return Err(TranscriptionError::Transcode(format!(
                        "ffmpeg timed out after {}s",
                        self.timeout.as_secs()
                    )));
                }
                Ok(None) => std::thread::sleep(POLL_INTERVAL),
                Err(e) => {
                    return Err(TranscriptionError::Transcode(format!(
                        "failed to wait for ffmpeg: {}",
                        e
                    )))
                }
            }
        };

        let pcm = stdout_reader
            .join()
            .map_err(|_| TranscriptionError::Transcode("stdout reader panicked".to_string()))?
            .map_err(|e| TranscriptionError::Transcode(format!("reading ffmpeg output: {}", e)))?;
        let stderr_text = stderr_reader.join().unwrap_or_default();

        if !status.success() {
            return Err(TranscriptionError::Transcode(format!(
                "ffmpeg exited with {}: {}",
                status,
                last_line(&stderr_text)
            )));
        }
        Ok(pcm)
    }

    /// Start a long-lived transcoder reading `input_format` from stdin.
    pub fn spawn_stream(&self, input_format: &str) -> Result<StreamingNormalizer, TranscriptionError> {
        let rate = self.sample_rate.to_string();
        let mut child = tokio::process::Command::new(&self.ffmpeg_path)
            .args(["-hide_banner", "-loglevel", "error", "-f", input_format, "-i", "pipe:0"])
            .args(["-f", "s16le", "-acodec", "pcm_s16le", "-ac", "1", "-ar", rate.as_str(), "pipe:1"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                TranscriptionError::Transcode(format!(
                    "failed to start {}: {}",
                    self.ffmpeg_path, e
                ))
            })?;

        let pid = child.id();
        info!(?pid, input_format, "streaming transcoder started");

        let stdin = child.stdin.take();
        let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(self.channel_capacity);
        let (output_tx, output_rx) = mpsc::channel(self.channel_capacity);

        let writer = tokio::spawn(async move {
            let Some(mut stdin) = stdin else { return };
            while let Some(chunk) = input_rx.recv().await {
                if let Err(e) = stdin.write_all(&chunk).await {
                    debug!("transcoder stdin closed: {}", e);
                    return;
                }
            }
            // Closing stdin is what tells ffmpeg to flush and exit
            let _ = stdin.shutdown().await;
        });

        let supervisor = tokio::spawn(supervise(child, output_tx));

        Ok(StreamingNormalizer {
            input: input_tx,
            output: output_rx,
            handle: TranscoderHandle {
                writer,
                supervisor,
                pid,
            },
        })
    }
}

/// A running streaming transcoder.
///
/// `input` takes container bytes; `output` yields PCM chunks of arbitrary
/// size and, if the process fails, one final `Err` before closing. Dropping
/// `input` is end-of-stream. Dropping `handle` kills the process.
pub struct StreamingNormalizer {
    pub input: mpsc::Sender<Vec<u8>>,
    pub output: mpsc::Receiver<Result<Vec<u8>, TranscriptionError>>,
    pub handle: TranscoderHandle,
}

/// Ownership of the transcoder's tasks; the child dies with them.
pub struct TranscoderHandle {
    writer: JoinHandle<()>,
    supervisor: JoinHandle<()>,
    pid: Option<u32>,
}

impl TranscoderHandle {
    pub fn abort(&self) {
        self.writer.abort();
        self.supervisor.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.writer.is_finished() && self.supervisor.is_finished()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl Drop for TranscoderHandle {
    fn drop(&mut self) {
        if !self.supervisor.is_finished() {
            debug!(pid = ?self.pid, "releasing streaming transcoder");
        }
        self.abort();
    }
}

async fn supervise(
    mut child: tokio::process::Child,
    output: mpsc::Sender<Result<Vec<u8>, TranscriptionError>>,
) {
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let stderr_task = async move {
        let mut text = String::new();
        if let Some(mut stderr) = stderr {
            let _ = stderr.read_to_string(&mut text).await;
        }
        text
    };

    let output_pump = output.clone();
    let stdout_task = async move {
        let Some(mut stdout) = stdout else {
            return true;
        };
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match stdout.read(&mut buf).await {
                Ok(0) => return true,
                Ok(n) => {
                    // A closed receiver means the session is gone
                    if output_pump.send(Ok(buf[..n].to_vec())).await.is_err() {
                        return false;
                    }
                }
                Err(e) => {
                    warn!("reading transcoder output failed: {}", e);
                    return true;
                }
            }
        }
    };

    let (stderr_text, receiver_alive) = tokio::join!(stderr_task, stdout_task);
    if !receiver_alive {
        let _ = child.kill().await;
        return;
    }

    let failure = match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
        Ok(Ok(status)) if status.success() => {
            debug!("streaming transcoder exited cleanly");
            None
        }
        Ok(Ok(status)) => Some(format!(
            "ffmpeg exited with {}: {}",
            status,
            last_line(&stderr_text)
        )),
        Ok(Err(e)) => Some(format!("failed to wait for ffmpeg: {}", e)),
        Err(_) => {
            let _ = child.kill().await;
            Some("ffmpeg did not exit after its output closed".to_string())
        }
    };

    if let Some(message) = failure {
        warn!("{}", message);
        let _ = output.send(Err(TranscriptionError::Transcode(message))).await;
    }
}

/// Kills and reaps a blocking child on drop.
struct ChildGuard(Child);

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if let Ok(None) = self.0.try_wait() {
            let _ = self.0.kill();
        }
        let _ = self.0.wait();
    }
}

/// Upload spooled to disk; containers like MP4 need a seekable input.
struct TempInput {
    path: PathBuf,
}

impl TempInput {
    fn write(data: &[u8], format_hint: Option<&str>) -> Result<Self, TranscriptionError> {
        let ext = format_hint
            .map(|hint| hint.trim_start_matches('.'))
            .filter(|hint| !hint.is_empty() && hint.chars().all(|c| c.is_ascii_alphanumeric()))
            .unwrap_or("bin");
        let path = std::env::temp_dir().join(format!("stt-upload-{}.{}", uuid::Uuid::new_v4(), ext));
        std::fs::write(&path, data).map_err(|e| {
            TranscriptionError::Transcode(format!("failed to spool upload: {}", e))
        })?;
        Ok(Self { path })
    }
}

impl Drop for TempInput {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn last_line(text: &str) -> &str {
    text.lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("no diagnostic output")
}

/// In-memory WAV file, used by tests across the crate.
#[cfg(test)]
pub(crate) fn encode_wav(samples: &[i16], sample_rate: u32, channels: u16) -> Vec<u8> {
    let header = wav::Header::new(wav::WAV_FORMAT_PCM, channels, sample_rate, 16);
    let mut cursor = Cursor::new(Vec::new());
    wav::write(header, &wav::BitDepth::Sixteen(samples.to_vec()), &mut cursor)
        .expect("writing to memory cannot fail");
    cursor.into_inner()
}
