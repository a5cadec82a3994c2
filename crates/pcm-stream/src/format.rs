//! PCM sample formats carried by WAVE files.
//!
//! A [`SampleFormat`] describes how one sample is laid out in bytes. The engine moves raw
//! bytes end to end; only the cpal backend converts samples to `f32`.

use std::fmt;

/// WAVE `fmt ` tag for integer PCM.
pub const WAV_FMT_PCM: u16 = 0x0001;
/// WAVE `fmt ` tag for IEEE float.
pub const WAV_FMT_IEEE_FLOAT: u16 = 0x0003;
/// WAVE `fmt ` tag for WAVE_FORMAT_EXTENSIBLE (real tag lives in the sub-format GUID).
pub const WAV_FMT_EXTENSIBLE: u16 = 0xfffe;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SampleFormat {
    U8,
    S16Le,
    S16Be,
    /// 24-bit samples packed in 3 bytes.
    S24Packed3Le,
    S24Packed3Be,
    /// 24-bit samples in the low bits of a 4-byte container.
    S24Le,
    S24Be,
    S32Le,
    S32Be,
    F32Le,
    F32Be,
}

impl SampleFormat {
    /// Resolve the sample format for a WAVE stream.
    ///
    /// `container_bytes` is the per-sample container width (block align / channels).
    pub fn from_wav(tag: u16, bits: u16, container_bytes: u16, big_endian: bool) -> Option<Self> {
        use SampleFormat::*;
        let pick = |le, be| if big_endian { be } else { le };
        match (tag, bits) {
            (WAV_FMT_PCM, 8) => Some(U8),
            (WAV_FMT_PCM, 16) => Some(pick(S16Le, S16Be)),
            (WAV_FMT_PCM, 24) => match container_bytes {
                3 => Some(pick(S24Packed3Le, S24Packed3Be)),
                4 => Some(pick(S24Le, S24Be)),
                _ => None,
            },
            (WAV_FMT_PCM, 32) => Some(pick(S32Le, S32Be)),
            (WAV_FMT_IEEE_FLOAT, 32) => Some(pick(F32Le, F32Be)),
            _ => None,
        }
    }

    /// Bytes occupied by one sample of one channel.
    pub fn bytes_per_sample(self) -> usize {
        use SampleFormat::*;
        match self {
            U8 => 1,
            S16Le | S16Be => 2,
            S24Packed3Le | S24Packed3Be => 3,
            S24Le | S24Be | S32Le | S32Be | F32Le | F32Be => 4,
        }
    }

    /// Overwrite `buf` with silence. `buf` should hold whole samples.
    pub fn fill_silence(self, buf: &mut [u8]) {
        match self {
            SampleFormat::U8 => buf.fill(0x80),
            _ => buf.fill(0),
        }
    }

    /// Decode one sample (exactly `bytes_per_sample()` bytes) to `f32` in `[-1.0, 1.0]`.
    pub fn sample_to_f32(self, b: &[u8]) -> f32 {
        use SampleFormat::*;
        match self {
            U8 => (b[0] as f32 - 128.0) / 128.0,
            S16Le => i16::from_le_bytes([b[0], b[1]]) as f32 / 32_768.0,
            S16Be => i16::from_be_bytes([b[0], b[1]]) as f32 / 32_768.0,
            S24Packed3Le => sign_extend_24(u32::from_le_bytes([b[0], b[1], b[2], 0])),
            S24Packed3Be => sign_extend_24(u32::from_be_bytes([0, b[0], b[1], b[2]])),
            S24Le => sign_extend_24(u32::from_le_bytes([b[0], b[1], b[2], b[3]])),
            S24Be => sign_extend_24(u32::from_be_bytes([b[0], b[1], b[2], b[3]])),
            S32Le => i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f32 / 2_147_483_648.0,
            S32Be => i32::from_be_bytes([b[0], b[1], b[2], b[3]]) as f32 / 2_147_483_648.0,
            F32Le => f32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            F32Be => f32::from_be_bytes([b[0], b[1], b[2], b[3]]),
        }
    }

    /// Short driver-style name (`S16_LE`, `FLOAT_BE`, ...).
    pub fn name(self) -> &'static str {
        use SampleFormat::*;
        match self {
            U8 => "U8",
            S16Le => "S16_LE",
            S16Be => "S16_BE",
            S24Packed3Le => "S24_3LE",
            S24Packed3Be => "S24_3BE",
            S24Le => "S24_LE",
            S24Be => "S24_BE",
            S32Le => "S32_LE",
            S32Be => "S32_BE",
            F32Le => "FLOAT_LE",
            F32Be => "FLOAT_BE",
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}


fn sign_extend_24(raw: u32) -> f32 {
    let v = ((raw << 8) as i32) >> 8;
    v as f32 / 8_388_608.0
}
