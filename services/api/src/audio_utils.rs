use base64::Engine;
use std::io::Cursor;

/// Decodes one base64 audio fragment.
pub fn decode_base64(fragment: &str) -> Result<Vec<u8>, base64::DecodeError> {
    base64::engine::general_purpose::STANDARD.decode(fragment.trim())
}

pub fn encode_base64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Interprets little-endian bytes as i16 samples. A trailing odd byte is dropped.
pub fn pcm16_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect()
}

/// Wraps raw mono PCM16 in a WAV container.
pub fn pcm16_to_wav(bytes: &[u8], sample_rate: u32) -> anyhow::Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::with_capacity(bytes.len() + 44));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for sample in pcm16_samples(bytes) {
            writer.write_sample(sample)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

/// Root-mean-square energy of PCM16 audio, normalized to `0.0..=1.0`.
pub fn rms_energy(bytes: &[u8]) -> f32 {
    let samples = pcm16_samples(bytes);
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples
        .iter()
        .map(|&s| {
            let v = f64::from(s) / 32768.0;
            v * v
        })
        .sum();
    (sum / samples.len() as f64).sqrt() as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn pcm(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn test_decode_base64() {
        let encoded = encode_base64(&[0x00, 0x40, 0xff]);
        assert_eq!(decode_base64(&encoded).unwrap(), vec![0x00, 0x40, 0xff]);
        assert!(decode_base64("invalid_base64!").is_err());
        assert!(decode_base64("").unwrap().is_empty());
    }

    #[test]
    fn test_pcm16_samples_skips_trailing_byte() {
        assert_eq!(pcm16_samples(&[0x00, 0x40, 0x01]), vec![16384]);
        assert!(pcm16_samples(&[0x00]).is_empty());
    }

    #[test]
    fn test_wav_wrapping() {
        let raw = pcm(&[0, 1000, -1000, i16::MAX]);
        let wav = pcm16_to_wav(&raw, 16_000).unwrap();
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(wav.len(), 44 + raw.len());

        let reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
        assert_eq!(reader.spec().sample_rate, 16_000);
        let samples: Vec<i16> = reader.into_samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![0, 1000, -1000, i16::MAX]);
    }

    #[test]
    fn test_rms_energy() {
        assert_eq!(rms_energy(&[]), 0.0);
        assert_abs_diff_eq!(rms_energy(&pcm(&[0, 0, 0])), 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(rms_energy(&pcm(&[16384, -16384])), 0.5, epsilon = 1e-4);
    }
}
