//! # MP3 Encoder Module
//!
//! Streaming PCM→MP3 encoding for listener fan-out. Every listener owns its
//! own [`Mp3Encoder`] instance: encoder state (bit reservoir, frame
//! alignment) is never shared across connections, so a slow or dying client
//! cannot corrupt anyone else's stream.
//!
//! The float→i16 conversion at the encoder ingress is the single saturation
//! point of the whole pipeline: the mixer itself never hard-clips.

use bytes::Bytes;
use mp3lame_encoder::{Bitrate, Builder, DualPcm, FlushNoGap, Quality};

/// Errors raised by the MP3 encoding layer.
#[derive(Debug, thiserror::Error)]
pub enum Mp3Error {
    /// LAME could not be initialized with the requested parameters.
    /// When this happens at startup it is fatal: the engine refuses to start.
    #[error("encoder init failed: {0}")]
    Init(String),

    #[error("encode failed: {0}")]
    Encode(String),
}

/// Streaming MP3 encoder (CBR) over libmp3lame.
pub struct Mp3Encoder {
    encoder: mp3lame_encoder::Encoder,
    pcm_l: Vec<i16>,
    pcm_r: Vec<i16>,
}

// The LAME handle is owned exclusively by one listener task.
unsafe impl Send for Mp3Encoder {}

impl Mp3Encoder {
    /// Creates a CBR encoder at the given sample rate and bitrate.
    pub fn new(sample_rate: u32, bitrate_bps: u32) -> Result<Self, Mp3Error> {
        let mut builder = Builder::new().ok_or_else(|| Mp3Error::Init("lame_init failed".into()))?;
        builder
            .set_num_channels(2)
            .map_err(|e| Mp3Error::Init(format!("{e:?}")))?;
        builder
            .set_sample_rate(sample_rate)
            .map_err(|e| Mp3Error::Init(format!("{e:?}")))?;
        builder
            .set_brate(bitrate_for(bitrate_bps))
            .map_err(|e| Mp3Error::Init(format!("{e:?}")))?;
        builder
            .set_quality(Quality::Good)
            .map_err(|e| Mp3Error::Init(format!("{e:?}")))?;
        let encoder = builder.build().map_err(|e| Mp3Error::Init(format!("{e:?}")))?;

        Ok(Self {
            encoder,
            pcm_l: Vec::new(),
            pcm_r: Vec::new(),
        })
    }

    /// Encodes one block of float PCM, saturating to the i16 range.
    ///
    /// Returns the encoded bytes, possibly empty while LAME fills its
    /// internal frame buffer.
    pub fn encode(&mut self, left: &[f32], right: &[f32]) -> Result<Bytes, Mp3Error> {
        debug_assert_eq!(left.len(), right.len());

        self.pcm_l.clear();
        self.pcm_l.extend(left.iter().map(|&s| to_i16(s)));
        self.pcm_r.clear();
        self.pcm_r.extend(right.iter().map(|&s| to_i16(s)));

        let input = DualPcm {
            left: &self.pcm_l,
            right: &self.pcm_r,
        };

        let mut out = Vec::new();
        out.reserve(mp3lame_encoder::max_required_buffer_size(left.len()));
        let written = self
            .encoder
            .encode(input, out.spare_capacity_mut())
            .map_err(|e| Mp3Error::Encode(format!("{e:?}")))?;
        // SAFETY: `encode` initialized exactly `written` bytes of the spare
        // capacity, as documented by mp3lame-encoder.
        unsafe { out.set_len(written) };

        Ok(Bytes::from(out))
    }

    /// Flushes the encoder's internal buffers, yielding the final frames.
    pub fn flush(&mut self) -> Result<Bytes, Mp3Error> {
        let mut out = Vec::new();
        out.reserve(mp3lame_encoder::max_required_buffer_size(1152));
        let written = self
            .encoder
            .flush::<FlushNoGap>(out.spare_capacity_mut())
            .map_err(|e| Mp3Error::Encode(format!("{e:?}")))?;
        // SAFETY: same contract as `encode`.
        unsafe { out.set_len(written) };
        Ok(Bytes::from(out))
    }
}

#[inline]
fn to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

fn bitrate_for(bps: u32) -> Bitrate {
    match bps / 1000 {
        0..=8 => Bitrate::Kbps8,
        9..=16 => Bitrate::Kbps16,
        17..=24 => Bitrate::Kbps24,
        25..=32 => Bitrate::Kbps32,
        33..=40 => Bitrate::Kbps40,
        41..=48 => Bitrate::Kbps48,
        49..=64 => Bitrate::Kbps64,
        65..=80 => Bitrate::Kbps80,
        81..=96 => Bitrate::Kbps96,
        97..=112 => Bitrate::Kbps112,
        113..=128 => Bitrate::Kbps128,
        129..=160 => Bitrate::Kbps160,
        161..=192 => Bitrate::Kbps192,
        193..=224 => Bitrate::Kbps224,
        225..=256 => Bitrate::Kbps256,
        _ => Bitrate::Kbps320,
    }
}
