//! Decode encoded audio bytes (WAV, FLAC, OGG/Vorbis, MP3) to mono f32.
//!
//! RIFF/WAVE payloads go through [`hound`] directly; anything else is probed
//! with symphonia.

use std::io::Cursor;

use symphonia::core::{
    audio::SampleBuffer,
    codecs::{DecoderOptions, CODEC_TYPE_NULL},
    errors::Error as SymphoniaError,
    formats::FormatOptions,
    io::MediaSourceStream,
    meta::MetadataOptions,
    probe::Hint,
};

use super::{
    downmix_mono,
    wav::{self, MonoAudio},
    AudioError, Result,
};

fn is_riff_wave(bytes: &[u8]) -> bool {
    bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WAVE"
}

fn decode_wav(bytes: &[u8]) -> Result<MonoAudio> {
    wav::into_mono(hound::WavReader::new(Cursor::new(bytes))?)
}

fn decode_probed(bytes: &[u8]) -> Result<MonoAudio> {
    let mss = MediaSourceStream::new(Box::new(Cursor::new(bytes.to_vec())), Default::default());
    let probed = symphonia::default::get_probe()
        .format(
            &Hint::new(),
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| AudioError::Decode(format!("unrecognised audio container: {e}")))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| AudioError::Decode("no decodable audio track".into()))?;
    let track_id = track.id;
    let mut sample_rate = track.codec_params.sample_rate.unwrap_or(0);
    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| AudioError::Decode(format!("unsupported codec: {e}")))?;

    let mut channels = 1usize;
    let mut interleaved: Vec<f32> = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(AudioError::Decode(e.to_string())),
        };
        if packet.track_id() != track_id {
            continue;
        }
        match decoder.decode(&packet) {
            Ok(buf) => {
                let spec = *buf.spec();
                channels = spec.channels.count().max(1);
                sample_rate = spec.rate;
                let mut samples = SampleBuffer::<f32>::new(buf.capacity() as u64, spec);
                samples.copy_interleaved_ref(buf);
                interleaved.extend_from_slice(samples.samples());
            }
            // Corrupt packets are skipped; the rest of the stream may be fine.
            Err(SymphoniaError::DecodeError(_)) => continue,
            Err(e) => return Err(AudioError::Decode(e.to_string())),
        }
    }

    if sample_rate == 0 {
        return Err(AudioError::Decode("stream has no sample rate".into()));
    }
    Ok(MonoAudio { samples: downmix_mono(&interleaved, channels), sample_rate })
}

/// Decode an in-memory audio file, averaging channels to mono.
pub fn decode_bytes(bytes: &[u8]) -> Result<MonoAudio> {
    if bytes.is_empty() {
        return Err(AudioError::Decode("empty audio payload".into()));
    }
    if is_riff_wave(bytes) {
        return decode_wav(bytes);
    }
    decode_probed(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::wav::encode_pcm16;

    #[test]
    fn decodes_pcm16_wav() {
        let samples: Vec<f32> = (0..480).map(|i| (i as f32 / 480.0) - 0.5).collect();
        let bytes = encode_pcm16(&samples, 48_000).unwrap();
        let audio = decode_bytes(&bytes).unwrap();
        assert_eq!(audio.sample_rate, 48_000);
        assert_eq!(audio.samples.len(), 480);
        approx::assert_abs_diff_eq!(audio.samples[0], -0.5, epsilon = 1e-3);
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(decode_bytes(b"definitely not audio at all").is_err());
        assert!(decode_bytes(&[]).is_err());
    }
}
