//! 16-bit PCM WAV encoding and mono WAV reading via [`hound`].

use std::{io::Cursor, path::Path};

use super::{downmix_mono, AudioError, Result};

/// A mono waveform together with its sample rate.
#[derive(Debug, Clone)]
pub struct MonoAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

fn pcm16_spec(sample_rate: u32) -> hound::WavSpec {
    hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    }
}

/// Convert f32 `[-1.0, 1.0]` samples to i16 PCM.
pub fn f32_to_pcm16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16)
        .collect()
}

/// Encode mono samples as an in-memory 16-bit PCM WAV file.
pub fn encode_pcm16(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    if sample_rate == 0 {
        return Err(AudioError::InvalidArg("sample_rate must be > 0".into()));
    }
    let mut buf = Cursor::new(Vec::<u8>::new());
    {
        let mut writer = hound::WavWriter::new(&mut buf, pcm16_spec(sample_rate))?;
        for s in f32_to_pcm16(samples) {
            writer.write_sample(s)?;
        }
        writer.finalize()?;
    }
    Ok(buf.into_inner())
}

/// Write mono samples to `path` as a 16-bit PCM WAV file.
pub fn write_pcm16(path: &Path, samples: &[f32], sample_rate: u32) -> Result<()> {
    if sample_rate == 0 {
        return Err(AudioError::InvalidArg("sample_rate must be > 0".into()));
    }
    let mut writer = hound::WavWriter::create(path, pcm16_spec(sample_rate))?;
    for s in f32_to_pcm16(samples) {
        writer.write_sample(s)?;
    }
    writer.finalize()?;
    Ok(())
}

/// Read any integer or float WAV file and mix it down to mono f32.
pub fn read_mono(path: &Path) -> Result<MonoAudio> {
    into_mono(hound::WavReader::open(path)?)
}

pub(crate) fn into_mono<R: std::io::Read>(mut reader: hound::WavReader<R>) -> Result<MonoAudio> {
    let spec = reader.spec();
    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<std::result::Result<_, _>>()?,
        hound::SampleFormat::Int => {
            let scale = 1.0 / (1u64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect::<std::result::Result<_, _>>()?
        }
    };
    Ok(MonoAudio {
        samples: downmix_mono(&interleaved, spec.channels as usize),
        sample_rate: spec.sample_rate,
    })
}
