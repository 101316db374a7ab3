//! # Audio Codec
//!
//! Deterministic, side-effect-free conversion between the audio
//! representations the relay moves between:
//!
//! - **μ-law ↔ linear16**: ITU-T G.711 companding. The carrier transmits
//!   8-bit logarithmic samples; the speech services want 16-bit linear PCM.
//!   The companding tables must match standard telephone equipment
//!   bit-for-bit; an approximate implementation is audible as static.
//! - **WAV container ↔ raw PCM**: synthesis collaborators return
//!   header-bearing audio; the carrier accepts only headerless samples.
//! - **Resampling**: linear interpolation between arbitrary rates.
//! - **Downmixing**: channel averaging to mono.
//!
//! ## Edge cases:
//! Zero-length sample input always produces zero-length output, never an
//! error. An odd byte count for 16-bit PCM is a `MisalignedSampleWidth`
//! error. Truncated or invalid container headers are `MalformedContainer`.

use crate::error::{RelayError, RelayResult};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use tracing::warn;

/// μ-law bias added before segment search, per the G.711 definition.
const MULAW_BIAS: i32 = 0x84;

/// Largest linear magnitude representable after biasing; inputs beyond this
/// clip to the top companding segment.
const MULAW_CLIP: i32 = 32635;

/// Compress one 16-bit linear sample to an 8-bit μ-law code.
///
/// Finds the exponent segment containing the biased magnitude, extracts the
/// four mantissa bits, combines with the sign, and inverts all bits (μ-law
/// codes are transmitted complemented).
pub fn encode_mulaw_sample(sample: i16) -> u8 {
    let sign: u8 = if sample < 0 { 0x80 } else { 0x00 };

    let mut magnitude = (sample as i32).abs();
    if magnitude > MULAW_CLIP {
        magnitude = MULAW_CLIP;
    }
    magnitude += MULAW_BIAS;

    // Locate the highest set bit among bits 7..14 of the biased magnitude.
    let mut exponent: u8 = 7;
    let mut mask = 0x4000;
    while exponent > 0 && (magnitude & mask) == 0 {
        mask >>= 1;
        exponent -= 1;
    }

    let mantissa = ((magnitude >> (exponent + 3)) & 0x0F) as u8;
    !(sign | (exponent << 4) | mantissa)
}

/// Expand one 8-bit μ-law code to a 16-bit linear sample.
///
/// Inverts the code, splits sign/exponent/mantissa bit fields, rebuilds the
/// biased 14-bit magnitude, removes the bias, and applies the sign.
pub fn decode_mulaw_sample(code: u8) -> i16 {
    let code = !code;
    let sign = code & 0x80;
    let exponent = (code >> 4) & 0x07;
    let mantissa = (code & 0x0F) as i32;

    let magnitude = (((mantissa << 3) + MULAW_BIAS) << exponent) - MULAW_BIAS;

    if sign != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// Expand a μ-law byte buffer to linear16 samples.
pub fn decode_mulaw(frame: &[u8]) -> Vec<i16> {
    frame.iter().map(|&code| decode_mulaw_sample(code)).collect()
}

/// Compress linear16 samples to a μ-law byte buffer.
pub fn encode_mulaw(samples: &[i16]) -> Vec<u8> {
    samples
        .iter()
        .map(|&sample| encode_mulaw_sample(sample))
        .collect()
}

/// Reinterpret a little-endian byte buffer as 16-bit samples.
///
/// ## Errors:
/// `MisalignedSampleWidth` if the byte count is odd; half a sample cannot
/// be dropped silently without shifting every following sample by one byte.
pub fn pcm_bytes_to_samples(data: &[u8]) -> RelayResult<Vec<i16>> {
    if data.len() % 2 != 0 {
        return Err(RelayError::MisalignedSampleWidth(data.len()));
    }

    let mut cursor = Cursor::new(data);
    let mut samples = Vec::with_capacity(data.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample);
    }
    Ok(samples)
}

/// Serialize 16-bit samples as little-endian bytes.
pub fn samples_to_pcm_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        // Writing to a Vec cannot fail
        let _ = bytes.write_i16::<LittleEndian>(sample);
    }
    bytes
}

/// Parse a RIFF/WAVE container, returning raw samples plus format metadata.
///
/// Walks the chunk list rather than assuming a 44-byte header, so files with
/// extended `fmt ` chunks or extra metadata chunks (LIST, fact) parse the
/// same as minimal ones.
///
/// ## Returns:
/// `(samples, sample_rate, channels)`, with samples interleaved when stereo.
///
/// ## Errors:
/// - `MalformedContainer`: truncated header, wrong magic, non-PCM format
///   code, unsupported bit depth, or missing fmt/data chunks
/// - `MisalignedSampleWidth`: data chunk with an odd byte count
pub fn extract_pcm(container: &[u8]) -> RelayResult<(Vec<i16>, u32, u16)> {
    if container.len() < 12 {
        return Err(RelayError::MalformedContainer(format!(
            "{} bytes is too short for a RIFF header",
            container.len()
        )));
    }
    if &container[0..4] != b"RIFF" || &container[8..12] != b"WAVE" {
        return Err(RelayError::MalformedContainer(
            "missing RIFF/WAVE magic".to_string(),
        ));
    }

    let mut sample_rate: Option<u32> = None;
    let mut channels: Option<u16> = None;
    let mut data: Option<&[u8]> = None;

    let mut offset = 12;
    while offset + 8 <= container.len() {
        let chunk_id = &container[offset..offset + 4];
        let chunk_size = u32::from_le_bytes([
            container[offset + 4],
            container[offset + 5],
            container[offset + 6],
            container[offset + 7],
        ]) as usize;
        let body_start = offset + 8;

        if body_start + chunk_size > container.len() {
            return Err(RelayError::MalformedContainer(format!(
                "chunk {:?} claims {} bytes past end of input",
                String::from_utf8_lossy(chunk_id),
                chunk_size
            )));
        }
        let body = &container[body_start..body_start + chunk_size];

        match chunk_id {
            b"fmt " => {
                if chunk_size < 16 {
                    return Err(RelayError::MalformedContainer(
                        "fmt chunk shorter than 16 bytes".to_string(),
                    ));
                }
                let mut cursor = Cursor::new(body);
                let audio_format = cursor.read_u16::<LittleEndian>().map_err(|e| {
                    RelayError::MalformedContainer(format!("unreadable fmt chunk: {}", e))
                })?;
                let num_channels = cursor.read_u16::<LittleEndian>().map_err(|e| {
                    RelayError::MalformedContainer(format!("unreadable fmt chunk: {}", e))
                })?;
                let rate = cursor.read_u32::<LittleEndian>().map_err(|e| {
                    RelayError::MalformedContainer(format!("unreadable fmt chunk: {}", e))
                })?;
                // Skip byte rate and block align
                let _ = cursor.read_u32::<LittleEndian>();
                let _ = cursor.read_u16::<LittleEndian>();
                let bits_per_sample = cursor.read_u16::<LittleEndian>().map_err(|e| {
                    RelayError::MalformedContainer(format!("unreadable fmt chunk: {}", e))
                })?;

                if audio_format != 1 {
                    return Err(RelayError::MalformedContainer(format!(
                        "unsupported audio format code {} (only uncompressed PCM)",
                        audio_format
                    )));
                }
                if bits_per_sample != 16 {
                    return Err(RelayError::MalformedContainer(format!(
                        "unsupported bit depth {} (only 16-bit PCM)",
                        bits_per_sample
                    )));
                }
                if num_channels == 0 {
                    return Err(RelayError::MalformedContainer(
                        "fmt chunk declares zero channels".to_string(),
                    ));
                }

                sample_rate = Some(rate);
                channels = Some(num_channels);
            }
            b"data" => {
                data = Some(body);
            }
            _ => {
                // LIST, fact, and any other metadata chunks are skipped
            }
        }

        // Chunks are word-aligned; odd sizes carry a pad byte
        offset = body_start + chunk_size + (chunk_size % 2);
    }

    let (sample_rate, channels) = match (sample_rate, channels) {
        (Some(rate), Some(ch)) => (rate, ch),
        _ => {
            return Err(RelayError::MalformedContainer(
                "missing fmt chunk".to_string(),
            ))
        }
    };
    let data = data.ok_or_else(|| {
        RelayError::MalformedContainer("missing data chunk".to_string())
    })?;

    let samples = pcm_bytes_to_samples(data)?;
    Ok((samples, sample_rate, channels))
}

/// Wrap raw linear16 samples in a minimal valid 44-byte WAV header.
pub fn wrap_pcm(samples: &[i16], sample_rate: u32, channels: u16) -> Vec<u8> {
    let data_len = (samples.len() * 2) as u32;
    let block_align = channels * 2;
    let byte_rate = sample_rate * block_align as u32;

    let mut out = Vec::with_capacity(44 + data_len as usize);
    out.extend_from_slice(b"RIFF");
    let _ = out.write_u32::<LittleEndian>(36 + data_len);
    out.extend_from_slice(b"WAVE");

    out.extend_from_slice(b"fmt ");
    let _ = out.write_u32::<LittleEndian>(16);
    let _ = out.write_u16::<LittleEndian>(1); // PCM format code
    let _ = out.write_u16::<LittleEndian>(channels);
    let _ = out.write_u32::<LittleEndian>(sample_rate);
    let _ = out.write_u32::<LittleEndian>(byte_rate);
    let _ = out.write_u16::<LittleEndian>(block_align);
    let _ = out.write_u16::<LittleEndian>(16); // bits per sample

    out.extend_from_slice(b"data");
    let _ = out.write_u32::<LittleEndian>(data_len);
    out.extend(samples_to_pcm_bytes(samples));
    out
}

/// Convert samples between rates by linear interpolation.
///
/// Falls back gracefully: an unsupported conversion logs a warning and
/// returns the input unchanged instead of aborting mid-utterance. Degraded
/// audio on one reply is recoverable; a dropped reply is not.
pub fn resample(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    match try_resample(samples, from_rate, to_rate) {
        Ok(resampled) => resampled,
        Err(err) => {
            warn!("Resample fallback, passing audio through unchanged: {}", err);
            samples.to_vec()
        }
    }
}

fn try_resample(samples: &[i16], from_rate: u32, to_rate: u32) -> RelayResult<Vec<i16>> {
    if from_rate == 0 || to_rate == 0 {
        return Err(RelayError::UnsupportedResample {
            from: from_rate,
            to: to_rate,
        });
    }
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let out_len = (samples.len() as u64 * to_rate as u64 / from_rate as u64) as usize;
    let step = from_rate as f64 / to_rate as f64;
    let last = samples.len() - 1;

    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let position = i as f64 * step;
        let index = (position as usize).min(last);
        let fraction = position - index as f64;

        let a = samples[index] as f64;
        let b = samples[(index + 1).min(last)] as f64;
        out.push((a + (b - a) * fraction).round() as i16);
    }
    Ok(out)
}

/// Average interleaved multi-channel samples down to mono.
pub fn downmix(samples: &[i16], channels: u16) -> Vec<i16> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks(channels as usize)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            (sum / frame.len() as i32) as i16
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mulaw_code_exactness() {
        // Every code re-encodes to itself after decoding. 0x7F is the one
        // exception: it decodes to negative zero, which encodes as positive
        // zero (0xFF), per the standard table.
        for code in 0u8..=255 {
            if code == 0x7F {
                continue;
            }
            assert_eq!(
                encode_mulaw_sample(decode_mulaw_sample(code)),
                code,
                "code 0x{:02X} did not survive decode/encode",
                code
            );
        }
    }

    #[test]
    fn test_mulaw_silence_and_negative_zero() {
        assert_eq!(encode_mulaw_sample(0), 0xFF);
        assert_eq!(decode_mulaw_sample(0xFF), 0);
        assert_eq!(decode_mulaw_sample(0x7F), 0);
    }

    #[test]
    fn test_mulaw_round_trip_within_quantization_bound() {
        // decode(encode(x)) must land within the companding segment's
        // quantization step of the (clipped) input for every value.
        let mut x = i16::MIN as i32;
        while x <= i16::MAX as i32 {
            let sample = x as i16;
            let code = encode_mulaw_sample(sample);
            let decoded = decode_mulaw_sample(code) as i32;

            let exponent = ((!code) >> 4) & 0x07;
            let step = 8i32 << exponent;

            let clipped = (x.abs().min(MULAW_CLIP)) * x.signum();
            assert!(
                (clipped - decoded).abs() <= step,
                "sample {} decoded to {} (step {})",
                x,
                decoded,
                step
            );
            x += 1;
        }
    }

    #[test]
    fn test_mulaw_sign_preserved() {
        assert!(decode_mulaw_sample(encode_mulaw_sample(1000)) > 0);
        assert!(decode_mulaw_sample(encode_mulaw_sample(-1000)) < 0);
    }

    #[test]
    fn test_zero_length_in_zero_length_out() {
        assert!(decode_mulaw(&[]).is_empty());
        assert!(encode_mulaw(&[]).is_empty());
        assert!(resample(&[], 8000, 16000).is_empty());
        assert!(downmix(&[], 2).is_empty());
        assert!(pcm_bytes_to_samples(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_odd_byte_count_is_misaligned() {
        let err = pcm_bytes_to_samples(&[0x00, 0x01, 0x02]).unwrap_err();
        assert!(matches!(err, RelayError::MisalignedSampleWidth(3)));
    }

    #[test]
    fn test_wav_round_trip() {
        let samples: Vec<i16> = (0..800).map(|i| (i * 37 % 4096) as i16 - 2048).collect();
        let container = wrap_pcm(&samples, 8000, 1);
        assert_eq!(container.len(), 44 + samples.len() * 2);

        let (extracted, rate, channels) = extract_pcm(&container).unwrap();
        assert_eq!(extracted, samples);
        assert_eq!(rate, 8000);
        assert_eq!(channels, 1);
    }

    #[test]
    fn test_wav_with_extra_chunk() {
        // A LIST metadata chunk between fmt and data must be skipped
        let samples: Vec<i16> = vec![100, -100, 200, -200];
        let minimal = wrap_pcm(&samples, 44100, 1);

        let mut container = minimal[..36].to_vec();
        container.extend_from_slice(b"LIST");
        container.extend_from_slice(&4u32.to_le_bytes());
        container.extend_from_slice(b"INFO");
        container.extend_from_slice(&minimal[36..]);
        // Fix up the RIFF size for the inserted chunk
        let riff_size = (container.len() - 8) as u32;
        container[4..8].copy_from_slice(&riff_size.to_le_bytes());

        let (extracted, rate, _) = extract_pcm(&container).unwrap();
        assert_eq!(extracted, samples);
        assert_eq!(rate, 44100);
    }

    #[test]
    fn test_truncated_container_is_malformed() {
        let samples: Vec<i16> = vec![1; 100];
        let container = wrap_pcm(&samples, 8000, 1);

        assert!(matches!(
            extract_pcm(&container[..10]),
            Err(RelayError::MalformedContainer(_))
        ));
        assert!(matches!(
            extract_pcm(&container[..60]),
            Err(RelayError::MalformedContainer(_))
        ));
    }

    #[test]
    fn test_non_pcm_container_is_malformed() {
        let mut container = wrap_pcm(&[0i16; 10], 8000, 1);
        container[20] = 3; // IEEE float format code
        assert!(matches!(
            extract_pcm(&container),
            Err(RelayError::MalformedContainer(_))
        ));
    }

    #[test]
    fn test_resample_doubles_and_halves() {
        let samples: Vec<i16> = (0..8000).map(|i| (i % 256) as i16).collect();

        let up = resample(&samples, 8000, 16000);
        assert_eq!(up.len(), 16000);

        let down = resample(&samples, 16000, 8000);
        assert_eq!(down.len(), 4000);
    }

    #[test]
    fn test_resample_same_rate_is_identity() {
        let samples: Vec<i16> = vec![5, -3, 900, -12000];
        assert_eq!(resample(&samples, 8000, 8000), samples);
    }

    #[test]
    fn test_resample_unsupported_returns_input_unchanged() {
        let samples: Vec<i16> = vec![1, 2, 3];
        assert_eq!(resample(&samples, 0, 8000), samples);
        assert_eq!(resample(&samples, 8000, 0), samples);
    }

    #[test]
    fn test_resample_preserves_constant_signal() {
        let samples = vec![1000i16; 800];
        let resampled = resample(&samples, 8000, 22050);
        assert!(resampled.iter().all(|&s| s == 1000));
    }

    #[test]
    fn test_downmix_stereo_averages() {
        let stereo = vec![100i16, 200, -100, -200, 0, 1000];
        assert_eq!(downmix(&stereo, 2), vec![150, -150, 500]);
    }

    #[test]
    fn test_downmix_mono_is_identity() {
        let mono = vec![1i16, 2, 3];
        assert_eq!(downmix(&mono, 1), mono);
    }

    #[test]
    fn test_pcm_byte_round_trip() {
        let samples: Vec<i16> = vec![i16::MIN, -1, 0, 1, i16::MAX];
        let bytes = samples_to_pcm_bytes(&samples);
        assert_eq!(pcm_bytes_to_samples(&bytes).unwrap(), samples);
    }
}
