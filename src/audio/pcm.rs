//! # PCM Helpers
//!
//! Everything downstream of the normalizer speaks one format: signed 16-bit
//! little-endian, mono, 16 kHz. These helpers convert between raw bytes,
//! integer samples and the normalized floats the model consumes, and
//! re-chunk an arbitrary byte stream into fixed-size frames.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// Decode little-endian 16-bit PCM into samples.
///
/// ## Error Handling:
/// Returns an error for an odd byte count; a trailing half sample means the
/// producer and the consumer disagree about the format.
pub fn bytes_to_samples(data: &[u8]) -> Result<Vec<i16>, String> {
    if data.len() % 2 != 0 {
        return Err(format!(
            "PCM length must be even for 16-bit samples, got {} bytes",
            data.len()
        ));
    }

    let mut cursor = Cursor::new(data);
    let mut samples = Vec::with_capacity(data.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample);
    }
    Ok(samples)
}

/// Decode PCM bytes into floats in [-1.0, 1.0).
pub fn bytes_to_f32(data: &[u8]) -> Result<Vec<f32>, String> {
    Ok(bytes_to_samples(data)?
        .into_iter()
        .map(|sample| sample as f32 / 32768.0)
        .collect())
}

/// Encode samples as little-endian 16-bit PCM.
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        // Writing into a Vec cannot fail
        let _ = out.write_i16::<LittleEndian>(sample);
    }
    out
}

/// Root mean square of a block of samples, normalized to 0.0..=1.0.
pub fn calculate_rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f64 = samples
        .iter()
        .map(|&sample| {
            let normalized = sample as f64 / i16::MAX as f64;
            normalized * normalized
        })
        .sum();

    (sum_squares / samples.len() as f64).sqrt() as f32
}

/// Re-chunks an irregular byte stream into frames of exactly `frame_bytes`.
///
/// The transcoder's stdout arrives in whatever sizes the pipe delivers; the
/// segmenter only accepts whole frames. Bytes that do not fill a frame are
/// carried over to the next `push`.
#[derive(Debug)]
pub struct FrameAssembler {
    frame_bytes: usize,
    pending: Vec<u8>,
}

impl FrameAssembler {
    pub fn new(frame_bytes: usize) -> Self {
        Self {
            frame_bytes,
            pending: Vec::with_capacity(frame_bytes),
        }
    }

    /// Append bytes and return every frame that is now complete.
    pub fn push(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        self.pending.extend_from_slice(data);

        let complete = self.pending.len() / self.frame_bytes;
        if complete == 0 {
            return Vec::new();
        }

        let tail = self.pending.split_off(complete * self.frame_bytes);
        let frames = self
            .pending
            .chunks_exact(self.frame_bytes)
            .map(|frame| frame.to_vec())
            .collect();
        self.pending = tail;
        frames
    }

    /// Bytes waiting for the rest of their frame.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_conversion() {
        let bytes = samples_to_bytes(&[0, i16::MAX, i16::MIN, -1]);
        assert_eq!(bytes.len(), 8);
        assert_eq!(bytes_to_samples(&bytes).unwrap(), vec![0, i16::MAX, i16::MIN, -1]);

        let floats = bytes_to_f32(&bytes).unwrap();
        assert_eq!(floats[0], 0.0);
        assert_eq!(floats[2], -1.0);
        assert!(floats[1] < 1.0);
    }

    #[test]
    fn test_odd_length_rejected() {
        assert!(bytes_to_samples(&[1, 2, 3]).is_err());
        assert!(bytes_to_f32(&[0]).is_err());
    }

    #[test]
    fn test_rms() {
        assert_eq!(calculate_rms(&[]), 0.0);
        assert_eq!(calculate_rms(&[0; 480]), 0.0);
        let loud = calculate_rms(&[i16::MAX; 480]);
        assert!((loud - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_frame_assembler_carries_remainder() {
        let mut assembler = FrameAssembler::new(4);
        assert!(assembler.push(&[1, 2, 3]).is_empty());
        assert_eq!(assembler.pending_len(), 3);

        let frames = assembler.push(&[4, 5, 6, 7, 8, 9, 10]);
        assert_eq!(frames, vec![vec![1, 2, 3, 4], vec![5, 6, 7, 8]]);
        assert_eq!(assembler.pending_len(), 2);
    }
}
