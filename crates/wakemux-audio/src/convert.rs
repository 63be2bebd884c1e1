use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::trace;
use wakemux_core::{AudioChunk, AudioError, AudioFormat};

/// Convert one interleaved PCM chunk from `src` to `dst`.
///
/// Decodes to planar `f32`, remaps channels, resamples with rubato and encodes
/// at `dst.width`. The chunk must hold whole frames.
pub fn convert(chunk: &[u8], src: AudioFormat, dst: AudioFormat) -> Result<Vec<u8>, AudioError> {
    validate(&src)?;
    validate(&dst)?;

    let frame = src.bytes_per_frame();
    if chunk.len() % frame != 0 {
        return Err(AudioError::Format(format!(
            "chunk of {} bytes is not a whole number of {}-byte frames",
            chunk.len(),
            frame
        )));
    }

    if src == dst {
        return Ok(chunk.to_vec());
    }

    let planar = decode(chunk, src);
    let planar = remap_channels(planar, src.channels, dst.channels)?;
    let planar = resample(planar, src.rate, dst.rate)?;
    Ok(encode(&planar, dst.width))
}

/// Convert a captured float chunk into 16 kHz, 16-bit, mono PCM bytes.
pub fn pcm16_mono_16k(chunk: &AudioChunk) -> Result<Vec<u8>, AudioError> {
    if chunk.channels == 0 || chunk.sample_rate == 0 {
        return Err(AudioError::Format(format!(
            "capture chunk has {} channel(s) at {} Hz",
            chunk.channels, chunk.sample_rate
        )));
    }
    let dst = AudioFormat::DETECTION;
    let planar = deinterleave(&chunk.samples, chunk.channels);
    let planar = remap_channels(planar, chunk.channels, dst.channels)?;
    let planar = resample(planar, chunk.sample_rate, dst.rate)?;
    Ok(encode(&planar, dst.width))
}

fn validate(format: &AudioFormat) -> Result<(), AudioError> {
    if format.rate == 0 {
        return Err(AudioError::Format("sample rate must be non-zero".to_string()));
    }
    if format.channels == 0 {
        return Err(AudioError::Format("channel count must be non-zero".to_string()));
    }
    if !matches!(format.width, 1 | 2 | 4) {
        return Err(AudioError::Format(format!(
            "sample width {} is not supported",
            format.width
        )));
    }
    Ok(())
}

fn decode(chunk: &[u8], format: AudioFormat) -> Vec<Vec<f32>> {
    let width = format.width as usize;
    let samples: Vec<f32> = chunk
        .chunks_exact(width)
        .map(|bytes| match width {
            1 => (bytes[0] as f32 - 128.0) / 128.0,
            2 => i16::from_le_bytes([bytes[0], bytes[1]]) as f32 / 32768.0,
            _ => i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f32 / 2_147_483_648.0,
        })
        .collect();
    deinterleave(&samples, format.channels)
}

fn deinterleave(samples: &[f32], channels: u16) -> Vec<Vec<f32>> {
    let num_channels = channels as usize;
    let num_frames = samples.len() / num_channels;
    let mut planar = vec![Vec::with_capacity(num_frames); num_channels];

    for frame in samples.chunks_exact(num_channels) {
        for (ch, sample) in frame.iter().enumerate() {
            planar[ch].push(*sample);
        }
    }
    planar
}

fn remap_channels(
    planar: Vec<Vec<f32>>,
    src_channels: u16,
    dst_channels: u16,
) -> Result<Vec<Vec<f32>>, AudioError> {
    if src_channels == dst_channels {
        return Ok(planar);
    }
    let num_frames = planar.first().map_or(0, Vec::len);

    if dst_channels == 1 {
        let scale = 1.0 / planar.len() as f32;
        let mixed = (0..num_frames)
            .map(|i| planar.iter().map(|ch| ch[i]).sum::<f32>() * scale)
            .collect();
        return Ok(vec![mixed]);
    }
    if src_channels == 1 {
        return Ok(vec![planar[0].clone(); dst_channels as usize]);
    }
    Err(AudioError::Format(format!(
        "cannot map {src_channels} channel(s) onto {dst_channels}"
    )))
}

fn resample(planar: Vec<Vec<f32>>, src_rate: u32, dst_rate: u32) -> Result<Vec<Vec<f32>>, AudioError> {
    let num_frames = planar.first().map_or(0, Vec::len);
    if src_rate == dst_rate || num_frames == 0 {
        return Ok(planar);
    }

    let mut resampler = FastFixedIn::<f32>::new(
        dst_rate as f64 / src_rate as f64,
        1.0,
        PolynomialDegree::Cubic,
        num_frames,
        planar.len(),
    )
    .map_err(|e| AudioError::Resample(e.to_string()))?;

    let output = resampler
        .process(&planar, None)
        .map_err(|e| AudioError::Resample(e.to_string()))?;

    trace!(
        src_rate,
        dst_rate,
        in_frames = num_frames,
        out_frames = output.first().map_or(0, Vec::len),
        "resampled chunk"
    );
    Ok(output)
}

fn encode(planar: &[Vec<f32>], width: u16) -> Vec<u8> {
    let num_frames = planar.first().map_or(0, Vec::len);
    let mut out = Vec::with_capacity(num_frames * planar.len() * width as usize);

    for i in 0..num_frames {
        for ch in planar {
            let s = ch[i].clamp(-1.0, 1.0);
            match width {
                1 => out.push((s * 127.0 + 128.0).round() as u8),
                2 => out.extend_from_slice(&((s * 32767.0).round() as i16).to_le_bytes()),
                _ => out.extend_from_slice(&((s as f64 * 2_147_483_647.0).round() as i32).to_le_bytes()),
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm16(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    fn read_pcm16(bytes: &[u8]) -> Vec<i16> {
        bytes
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect()
    }

    #[test]
    fn test_convert_identity_is_copy() {
        let chunk = pcm16(&[1, -2, 300, -400]);
        let out = convert(&chunk, AudioFormat::DETECTION, AudioFormat::DETECTION).unwrap();
        assert_eq!(out, chunk);
    }

    #[test]
    fn test_convert_stereo_downmix_averages() {
        let src = AudioFormat {
            rate: 16_000,
            width: 2,
            channels: 2,
        };
        let chunk = pcm16(&[1000, 3000, -2000, -4000]);
        let out = read_pcm16(&convert(&chunk, src, AudioFormat::DETECTION).unwrap());
        assert_eq!(out.len(), 2);
        assert!((out[0] - 2000).abs() <= 1, "got {}", out[0]);
        assert!((out[1] + 3000).abs() <= 1, "got {}", out[1]);
    }

    #[test]
    fn test_convert_8bit_unsigned_to_16bit() {
        let src = AudioFormat {
            rate: 16_000,
            width: 1,
            channels: 1,
        };
        let out = read_pcm16(&convert(&[128, 255, 0], src, AudioFormat::DETECTION).unwrap());
        assert_eq!(out[0], 0);
        assert!(out[1] > 32000);
        assert!(out[2] < -32000);
    }

    #[test]
    fn test_convert_downsample_shrinks_frame_count() {
        let src = AudioFormat {
            rate: 48_000,
            width: 2,
            channels: 1,
        };
        let chunk = pcm16(&vec![1000i16; 4800]);
        let out = convert(&chunk, src, AudioFormat::DETECTION).unwrap();
        let frames = out.len() / 2;
        assert!(frames > 1400 && frames <= 1700, "got {frames} frames");
    }

    #[test]
    fn test_convert_rejects_partial_frame() {
        let src = AudioFormat {
            rate: 16_000,
            width: 2,
            channels: 2,
        };
        let result = convert(&[0, 0, 0], src, AudioFormat::DETECTION);
        assert!(matches!(result, Err(AudioError::Format(_))));
    }

    #[test]
    fn test_convert_rejects_unsupported_width() {
        let src = AudioFormat {
            rate: 16_000,
            width: 3,
            channels: 1,
        };
        let result = convert(&[0, 0, 0], src, AudioFormat::DETECTION);
        assert!(matches!(result, Err(AudioError::Format(_))));
    }

    #[test]
    fn test_convert_rejects_zero_rate() {
        let src = AudioFormat {
            rate: 0,
            width: 2,
            channels: 1,
        };
        assert!(convert(&[0, 0], src, AudioFormat::DETECTION).is_err());
    }

    #[test]
    fn test_convert_empty_chunk() {
        let src = AudioFormat {
            rate: 44_100,
            width: 2,
            channels: 2,
        };
        let out = convert(&[], src, AudioFormat::DETECTION).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_pcm16_mono_16k_from_float_capture() {
        let chunk = AudioChunk {
            samples: vec![0.5; 320],
            sample_rate: 16_000,
            channels: 2,
        };
        let out = read_pcm16(&pcm16_mono_16k(&chunk).unwrap());
        assert_eq!(out.len(), 160);
        assert!(out.iter().all(|s| (*s - 16384).abs() <= 1));
    }

    #[test]
    fn test_pcm16_mono_16k_rejects_zero_channels() {
        let chunk = AudioChunk {
            samples: vec![0.0; 4],
            sample_rate: 16_000,
            channels: 0,
        };
        assert!(pcm16_mono_16k(&chunk).is_err());
    }
}
