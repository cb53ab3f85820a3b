//! # Whisper Engine
//!
//! [`SpeechEngine`] implementation backed by candle's Whisper port.
//!
//! ## Model Loading Process:
//! 1. Download `config.json`, `tokenizer.json` and `model.safetensors` from
//!    HuggingFace (cached locally by hf-hub)
//! 2. Build the mel filter bank for the model's number of mel bins
//! 3. Memory-map the weights onto the selected device
//!
//! ## Inference:
//! - Log-mel features over the whole input, decoded in 30 second windows
//! - Language detected once per request from the first window, unless the
//!   caller supplied one
//! - Greedy decoding without timestamps; each window becomes one segment
//! - Windows whose no-speech probability exceeds the threshold yield no text

use crate::error::TranscriptionError;
use crate::transcription::engine::{EngineOutput, Segment, SpeechEngine, Task, TranscribeOptions};
use anyhow::{anyhow, Result};
use candle_core::{Device, IndexOp, Tensor, D};
use candle_nn::VarBuilder;
use candle_transformers::models::whisper::{self as m, Config};
use tokenizers::Tokenizer;

/// Whisper language tokens in vocabulary order. `yue` only exists in large-v3.
pub const LANGUAGES: [&str; 100] = [
    "en", "zh", "de", "es", "ru", "ko", "fr", "ja", "pt", "tr", "pl", "ca", "nl", "ar", "sv",
    "it", "id", "hi", "fi", "vi", "he", "uk", "el", "ms", "cs", "ro", "da", "hu", "ta", "no",
    "th", "ur", "hr", "bg", "lt", "la", "mi", "ml", "cy", "sk", "te", "fa", "lv", "bn", "sr",
    "az", "sl", "kn", "et", "mk", "br", "eu", "is", "hy", "ne", "mn", "bs", "kk", "sq", "sw",
    "gl", "mr", "pa", "si", "km", "sn", "yo", "so", "af", "oc", "ka", "be", "tg", "sd", "gu",
    "am", "yi", "lo", "uz", "fo", "ht", "ps", "tk", "nn", "mt", "sa", "lb", "my", "bo", "tl",
    "mg", "as", "tt", "haw", "ln", "ha", "ba", "jw", "su", "yue",
];

/// Available Whisper model sizes.
///
/// ## Trade-offs:
/// - **Size vs Accuracy**: Larger models are more accurate but slower
/// - **Memory vs Speed**: large-v3 needs several GB of RAM on CPU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ModelSize {
    Tiny,
    Base,
    Small,
    Medium,
    Large,
    LargeV2,
    LargeV3,
}

impl ModelSize {
    /// HuggingFace model repository.
    pub fn repo_name(&self) -> &'static str {
        match self {
            ModelSize::Tiny => "openai/whisper-tiny",
            ModelSize::Base => "openai/whisper-base",
            ModelSize::Small => "openai/whisper-small",
            ModelSize::Medium => "openai/whisper-medium",
            ModelSize::Large => "openai/whisper-large",
            ModelSize::LargeV2 => "openai/whisper-large-v2",
            ModelSize::LargeV3 => "openai/whisper-large-v3",
        }
    }
}

impl std::str::FromStr for ModelSize {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "tiny" => Ok(ModelSize::Tiny),
            "base" => Ok(ModelSize::Base),
            "small" => Ok(ModelSize::Small),
            "medium" => Ok(ModelSize::Medium),
            "large" => Ok(ModelSize::Large),
            "large-v2" => Ok(ModelSize::LargeV2),
            "large-v3" => Ok(ModelSize::LargeV3),
            _ => Err(anyhow!("Unknown model size: {}", s)),
        }
    }
}

impl std::fmt::Display for ModelSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ModelSize::Tiny => "tiny",
            ModelSize::Base => "base",
            ModelSize::Small => "small",
            ModelSize::Medium => "medium",
            ModelSize::Large => "large",
            ModelSize::LargeV2 => "large-v2",
            ModelSize::LargeV3 => "large-v3",
        };
        write!(f, "{}", name)
    }
}

/// Special token ids resolved from the tokenizer at load time.
struct SpecialTokens {
    sot: u32,
    eot: u32,
    transcribe: u32,
    translate: u32,
    no_timestamps: u32,
    no_speech: Option<u32>,
}

/// A loaded Whisper model.
pub struct WhisperEngine {
    model: m::model::Whisper,
    config: Config,
    device: Device,
    size: ModelSize,
    tokenizer: Tokenizer,
    mel_filters: Vec<f32>,
    /// Additive logit mask: -inf for suppressed tokens, 0 elsewhere
    suppress_tokens: Tensor,
    tokens: SpecialTokens,
    /// (code, token id) for every language the vocabulary knows
    languages: Vec<(&'static str, u32)>,
}

impl WhisperEngine {
    /// Download (or reuse the cached copy of) a Whisper model and load it.
    ///
    /// ## Environment:
    /// - `HF_TOKEN`: optional HuggingFace token
    /// - `HF_HUB_CACHE` / `HF_HOME`: cache location
    pub async fn load(size: ModelSize, device: Device) -> Result<Self> {
        tracing::info!("Loading Whisper {} model...", size);
        let start_time = std::time::Instant::now();

        let api = {
            use hf_hub::api::tokio::ApiBuilder;

            let mut builder = ApiBuilder::new().with_progress(false);
            if let Ok(token) = std::env::var("HF_TOKEN") {
                builder = builder.with_token(Some(token));
            }
            if let Ok(cache_dir) = std::env::var("HF_HUB_CACHE") {
                builder = builder.with_cache_dir(cache_dir.into());
            } else if let Ok(hf_home) = std::env::var("HF_HOME") {
                builder = builder.with_cache_dir(std::path::PathBuf::from(hf_home).join("hub"));
            }
            builder
                .build()
                .map_err(|e| anyhow!("Failed to create HuggingFace client: {}", e))?
        };

        let repo = api.model(size.repo_name().to_string());
        let config_filename = repo
            .get("config.json")
            .await
            .map_err(|e| anyhow!("Failed to download config.json from {}: {}", size.repo_name(), e))?;
        let tokenizer_filename = repo
            .get("tokenizer.json")
            .await
            .map_err(|e| anyhow!("Failed to download tokenizer.json from {}: {}", size.repo_name(), e))?;
        let model_filename = repo
            .get("model.safetensors")
            .await
            .map_err(|e| anyhow!("Failed to download model weights from {}: {}", size.repo_name(), e))?;

        let config: Config = serde_json::from_reader(std::fs::File::open(config_filename)?)?;
        tracing::debug!(
            mel_bins = config.num_mel_bins,
            vocab = config.vocab_size,
            "model config loaded"
        );

        let tokenizer = Tokenizer::from_file(tokenizer_filename)
            .map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;

        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[model_filename], m::DTYPE, &device)? };
        let model = m::model::Whisper::load(&vb, config.clone())?;

        let engine = Self::assemble(model, config, tokenizer, device, size)?;
        tracing::info!(
            "Whisper {} model loaded in {:.2}s",
            size,
            start_time.elapsed().as_secs_f64()
        );
        Ok(engine)
    }

    fn assemble(
        model: m::model::Whisper,
        config: Config,
        tokenizer: Tokenizer,
        device: Device,
        size: ModelSize,
    ) -> Result<Self> {
        let tokens = SpecialTokens {
            sot: token_id(&tokenizer, m::SOT_TOKEN)?,
            eot: token_id(&tokenizer, m::EOT_TOKEN)?,
            transcribe: token_id(&tokenizer, m::TRANSCRIBE_TOKEN)?,
            translate: token_id(&tokenizer, m::TRANSLATE_TOKEN)?,
            no_timestamps: token_id(&tokenizer, m::NO_TIMESTAMPS_TOKEN)?,
            no_speech: m::NO_SPEECH_TOKENS
                .iter()
                .find_map(|token| token_id(&tokenizer, token).ok()),
        };

        let languages: Vec<(&'static str, u32)> = LANGUAGES
            .iter()
            .filter_map(|code| {
                tokenizer
                    .token_to_id(&format!("<|{}|>", code))
                    .map(|id| (*code, id))
            })
            .collect();
        if languages.is_empty() {
            return Err(anyhow!("Tokenizer has no language tokens"));
        }

        let mask: Vec<f32> = (0..config.vocab_size as u32)
            .map(|i| {
                if config.suppress_tokens.contains(&i) {
                    f32::NEG_INFINITY
                } else {
                    0.0
                }
            })
            .collect();
        let suppress_tokens = Tensor::new(mask.as_slice(), &device)?;

        let mel_filters = mel_filter_bank(config.num_mel_bins, m::N_FFT, m::SAMPLE_RATE as f64);

        Ok(Self {
            model,
            config,
            device,
            size,
            tokenizer,
            mel_filters,
            suppress_tokens,
            tokens,
            languages,
        })
    }

    fn language_token(&self, code: &str) -> Option<u32> {
        let code = code.to_lowercase();
        self.languages
            .iter()
            .find(|(known, _)| *known == code)
            .map(|(_, id)| *id)
    }

    /// Most likely language of a mel window, with its probability.
    fn detect_language(
        &mut self,
        mel: &Tensor,
    ) -> Result<(&'static str, f32, u32), TranscriptionError> {
        let audio_features = self.model.encoder.forward(mel, true)?;
        let sot = Tensor::new(&[[self.tokens.sot]], &self.device)?;
        let ys = self.model.decoder.forward(&sot, &audio_features, true)?;
        let logits = self.model.decoder.final_linear(&ys.i(..1)?)?.i(0)?.i(0)?;

        let ids: Vec<u32> = self.languages.iter().map(|(_, id)| *id).collect();
        let ids = Tensor::new(ids.as_slice(), &self.device)?;
        let probs = candle_nn::ops::softmax(&logits.index_select(&ids, 0)?, D::Minus1)?
            .to_vec1::<f32>()?;

        let (best, probability) = probs
            .iter()
            .copied()
            .enumerate()
            .fold((0, f32::MIN), |acc, (i, p)| if p > acc.1 { (i, p) } else { acc });
        let (code, token) = self.languages[best];
        tracing::debug!(language = code, probability, "detected language");
        Ok((code, probability, token))
    }

    /// Greedy-decode one window. `None` when the window holds no speech.
    fn decode_window(
        &mut self,
        mel: &Tensor,
        language_token: u32,
        task_token: u32,
    ) -> Result<Option<String>, TranscriptionError> {
        let audio_features = self.model.encoder.forward(mel, true)?;
        let sample_len = self.config.max_target_positions / 2;

        let mut tokens = vec![self.tokens.sot, language_token, task_token, self.tokens.no_timestamps];
        let prompt_len = tokens.len();

        for i in 0..sample_len {
            let tokens_t = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
            let ys = self.model.decoder.forward(&tokens_t, &audio_features, i == 0)?;

            if i == 0 {
                if let Some(no_speech) = self.tokens.no_speech {
                    let logits = self.model.decoder.final_linear(&ys.i(..1)?)?.i(0)?.i(0)?;
                    let no_speech_prob = candle_nn::ops::softmax(&logits, 0)?
                        .i(no_speech as usize)?
                        .to_scalar::<f32>()? as f64;
                    if no_speech_prob > m::NO_SPEECH_THRESHOLD {
                        tracing::debug!(no_speech_prob, "window classified as no speech");
                        return Ok(None);
                    }
                }
            }

            let (_, seq_len, _) = ys.dims3()?;
            let logits = self
                .model
                .decoder
                .final_linear(&ys.i((..1, seq_len - 1..))?)?
                .i(0)?
                .i(0)?
                .broadcast_add(&self.suppress_tokens)?;
            let next_token = logits.argmax(0)?.to_scalar::<u32>()?;

            if next_token == self.tokens.eot || tokens.len() >= self.config.max_target_positions {
                break;
            }
            tokens.push(next_token);
        }

        let text = self
            .tokenizer
            .decode(&tokens[prompt_len..], true)
            .map_err(|e| TranscriptionError::Inference(format!("Tokenizer decode error: {}", e)))?;
        Ok(Some(text.trim().to_string()))
    }
}

impl SpeechEngine for WhisperEngine {
    fn transcribe(
        &mut self,
        samples: &[f32],
        options: &TranscribeOptions,
    ) -> Result<EngineOutput, TranscriptionError> {
        if samples.is_empty() {
            return Err(TranscriptionError::Inference("audio is empty".to_string()));
        }

        let mel = m::audio::pcm_to_mel(&self.config, samples, &self.mel_filters);
        let n_mels = self.config.num_mel_bins;
        let mel_len = mel.len();
        let mel = Tensor::from_vec(mel, (1, n_mels, mel_len / n_mels), &self.device)?;

        // The feature extractor pads; only frames backed by real audio are decoded
        let total_frames = mel.dim(2)?;
        let content_frames = (samples.len() / m::HOP_LENGTH).clamp(1, total_frames);

        let (language, language_probability, language_token) = match &options.language {
            Some(code) => {
                let token = self.language_token(code).ok_or_else(|| {
                    TranscriptionError::Inference(format!("Unsupported language: {}", code))
                })?;
                let code = self
                    .languages
                    .iter()
                    .find(|(_, id)| *id == token)
                    .map(|(known, _)| *known)
                    .unwrap_or("en");
                (code, 1.0, token)
            }
            None => {
                let window = mel.narrow(2, 0, content_frames.min(m::N_FRAMES))?;
                self.detect_language(&window)?
            }
        };
        let task_token = match options.task {
            Task::Transcribe => self.tokens.transcribe,
            Task::Translate => self.tokens.translate,
        };

        let frame_seconds = m::HOP_LENGTH as f64 / m::SAMPLE_RATE as f64;
        let mut segments = Vec::new();
        let mut seek = 0;
        while seek < content_frames {
            let size = (content_frames - seek).min(m::N_FRAMES);
            let window = mel.narrow(2, seek, size)?;
            if let Some(text) = self.decode_window(&window, language_token, task_token)? {
                if !text.is_empty() {
                    segments.push(Segment {
                        start: seek as f64 * frame_seconds,
                        end: (seek + size) as f64 * frame_seconds,
                        text,
                    });
                }
            }
            seek += size;
        }

        Ok(EngineOutput {
            language: language.to_string(),
            language_probability,
            segments,
        })
    }

    fn name(&self) -> String {
        format!("whisper-{}", self.size)
    }
}

fn token_id(tokenizer: &Tokenizer, token: &str) -> Result<u32> {
    tokenizer
        .token_to_id(token)
        .ok_or_else(|| anyhow!("Token not in vocabulary: {}", token))
}

/// Slaney-scale triangular mel filters, laid out `[n_mels][n_fft / 2 + 1]`,
/// area-normalized the way Whisper's reference features are.
pub fn mel_filter_bank(n_mels: usize, n_fft: usize, sample_rate: f64) -> Vec<f32> {
    let n_freqs = n_fft / 2 + 1;
    let fft_freqs: Vec<f64> = (0..n_freqs)
        .map(|i| i as f64 * sample_rate / n_fft as f64)
        .collect();

    let min_mel = hz_to_mel(0.0);
    let max_mel = hz_to_mel(sample_rate / 2.0);
    let points: Vec<f64> = (0..n_mels + 2)
        .map(|i| mel_to_hz(min_mel + (max_mel - min_mel) * i as f64 / (n_mels + 1) as f64))
        .collect();

    let mut filters = vec![0f32; n_mels * n_freqs];
    for m in 0..n_mels {
        let (lower, center, upper) = (points[m], points[m + 1], points[m + 2]);
        let enorm = 2.0 / (upper - lower);
        for (k, &freq) in fft_freqs.iter().enumerate() {
            let rising = (freq - lower) / (center - lower);
            let falling = (upper - freq) / (upper - center);
            filters[m * n_freqs + k] = (rising.min(falling).max(0.0) * enorm) as f32;
        }
    }
    filters
}

const F_SP: f64 = 200.0 / 3.0;
const MIN_LOG_HZ: f64 = 1000.0;

fn log_step() -> f64 {
    6.4f64.ln() / 27.0
}

fn hz_to_mel(hz: f64) -> f64 {
    let min_log_mel = MIN_LOG_HZ / F_SP;
    if hz >= MIN_LOG_HZ {
        min_log_mel + (hz / MIN_LOG_HZ).ln() / log_step()
    } else {
        hz / F_SP
    }
}

fn mel_to_hz(mel: f64) -> f64 {
    let min_log_mel = MIN_LOG_HZ / F_SP;
    if mel >= min_log_mel {
        MIN_LOG_HZ * (log_step() * (mel - min_log_mel)).exp()
    } else {
        mel * F_SP
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcription::SAMPLE_RATE;

    #[test]
    fn test_engine_rate_matches_whisper() {
        assert_eq!(SAMPLE_RATE as usize, m::SAMPLE_RATE);
    }

    #[test]
    fn test_model_size_parsing() {
        assert_eq!("medium".parse::<ModelSize>().unwrap(), ModelSize::Medium);
        assert_eq!("LARGE-V3".parse::<ModelSize>().unwrap(), ModelSize::LargeV3);
        assert!("huge".parse::<ModelSize>().is_err());
        assert_eq!(ModelSize::LargeV2.to_string(), "large-v2");
        assert_eq!(ModelSize::Small.repo_name(), "openai/whisper-small");
    }

    #[test]
    fn test_mel_scale_round_trip() {
        for hz in [0.0, 440.0, 1000.0, 4000.0, 8000.0] {
            assert!((mel_to_hz(hz_to_mel(hz)) - hz).abs() < 1e-6);
        }
    }

    #[test]
    fn test_mel_filter_bank_shape() {
        let filters = mel_filter_bank(80, 400, 16000.0);
        assert_eq!(filters.len(), 80 * 201);
        assert!(filters.iter().all(|w| *w >= 0.0));
        // Every filter covers at least one FFT bin
        for m in 0..80 {
            let row = &filters[m * 201..(m + 1) * 201];
            assert!(row.iter().any(|w| *w > 0.0), "filter {} is empty", m);
        }
    }
}
