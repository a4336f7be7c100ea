//! Audio container and sample-rate conversion

use bytes::Bytes;

use crate::protocol::AudioFormat;
use crate::{Error, Result};

/// Sample rate of PCM exchanged with clients and recognizers
pub const SAMPLE_RATE: u32 = 16_000;

/// Converts synthesized audio to the format a session asked for
///
/// Conversion is CPU-bound; async callers run it on the blocking pool.
pub trait AudioConverter: Send + Sync {
    /// Convert synthesizer output (MP3) to `target`
    ///
    /// # Errors
    ///
    /// Returns error if the input cannot be decoded
    fn convert(&self, audio: &[u8], target: AudioFormat) -> Result<Bytes>;
}

/// Decodes MP3 into 16 kHz mono signed 16-bit little-endian PCM
#[derive(Debug, Default, Clone, Copy)]
pub struct Mp3ToPcm;

impl AudioConverter for Mp3ToPcm {
    fn convert(&self, audio: &[u8], target: AudioFormat) -> Result<Bytes> {
        match target {
            AudioFormat::Mp3 => Ok(Bytes::copy_from_slice(audio)),
            AudioFormat::Pcm => {
                let (samples, rate) = decode_mp3(audio)?;
                let samples = if rate == SAMPLE_RATE {
                    samples
                } else {
                    resample(&samples, rate, SAMPLE_RATE)?
                };
                Ok(Bytes::from(samples_to_pcm16(&samples)))
            }
        }
    }
}

/// Decode MP3 to mono f32 samples, returning the source sample rate
#[allow(clippy::cast_sign_loss)]
fn decode_mp3(mp3: &[u8]) -> Result<(Vec<f32>, u32)> {
    let mut decoder = minimp3::Decoder::new(mp3);
    let mut samples = Vec::new();
    let mut sample_rate = SAMPLE_RATE;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                sample_rate = frame.sample_rate as u32;
                let channels = frame.channels.max(1);
                samples.extend(frame.data.chunks(channels).map(downmix));
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Audio(format!("MP3 decode error: {e}"))),
        }
    }

    if samples.is_empty() {
        return Err(Error::Audio("MP3 stream contained no frames".to_string()));
    }

    Ok((samples, sample_rate))
}

#[allow(clippy::cast_precision_loss)]
fn downmix(frame: &[i16]) -> f32 {
    let sum: f32 = frame.iter().map(|&s| f32::from(s)).sum();
    sum / frame.len() as f32 / 32768.0
}

/// Resample mono audio with rubato, including the final partial chunk
#[allow(clippy::cast_possible_truncation)]
fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    use rubato::{FftFixedIn, Resampler};

    const CHUNK: usize = 1024;

    let mut resampler = FftFixedIn::<f64>::new(from_rate as usize, to_rate as usize, CHUNK, 2, 1)
        .map_err(|e| Error::Audio(format!("resampler init failed: {e}")))?;

    let input: Vec<f64> = samples.iter().map(|&s| f64::from(s)).collect();
    let mut output = Vec::with_capacity(input.len() * to_rate as usize / from_rate as usize + CHUNK);

    for chunk in input.chunks(CHUNK) {
        let block = if chunk.len() == CHUNK {
            resampler.process(&[chunk.to_vec()], None)
        } else {
            resampler.process_partial(Some(&[chunk.to_vec()][..]), None)
        }
        .map_err(|e| Error::Audio(format!("resample failed: {e}")))?;
        output.extend_from_slice(&block[0]);
    }

    Ok(output.iter().map(|&s| s as f32).collect())
}

/// f32 samples in [-1.0, 1.0] to little-endian i16 bytes
#[allow(clippy::cast_possible_truncation)]
fn samples_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let value = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

/// Wrap raw 16-bit little-endian mono PCM in a WAV container
///
/// # Errors
///
/// Returns error if the WAV writer fails
pub fn pcm16_to_wav(pcm: &[u8], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::with_capacity(pcm.len() + 44));
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;
        for pair in pcm.chunks_exact(2) {
            writer
                .write_sample(i16::from_le_bytes([pair[0], pair[1]]))
                .map_err(|e| Error::Audio(e.to_string()))?;
        }
        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

/// Decode a 16-bit WAV file into 16 kHz mono PCM bytes
///
/// Multi-channel input is downmixed and other sample rates are resampled.
///
/// # Errors
///
/// Returns error if the input is not a 16-bit integer WAV
pub fn wav_to_pcm16(wav: &[u8]) -> Result<Vec<u8>> {
    let mut reader = hound::WavReader::new(std::io::Cursor::new(wav))
        .map_err(|e| Error::Audio(format!("invalid WAV: {e}")))?;
    let spec = reader.spec();

    if spec.sample_format != hound::SampleFormat::Int || spec.bits_per_sample != 16 {
        return Err(Error::Audio(format!(
            "unsupported WAV encoding: {} bit {:?}",
            spec.bits_per_sample, spec.sample_format
        )));
    }

    let interleaved = reader
        .samples::<i16>()
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Audio(e.to_string()))?;

    let channels = usize::from(spec.channels.max(1));
    if channels == 1 && spec.sample_rate == SAMPLE_RATE {
        return Ok(interleaved.iter().flat_map(|s| s.to_le_bytes()).collect());
    }

    let mono: Vec<f32> = interleaved.chunks(channels).map(downmix).collect();
    let mono = if spec.sample_rate == SAMPLE_RATE {
        mono
    } else {
        resample(&mono, spec.sample_rate, SAMPLE_RATE)?
    };
    Ok(samples_to_pcm16(&mono))
}

/// Whether `audio` carries a RIFF/WAVE header
#[must_use]
pub fn is_wav(audio: &[u8]) -> bool {
    audio.len() >= 12 && &audio[..4] == b"RIFF" && &audio[8..12] == b"WAVE"
}
