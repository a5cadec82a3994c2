//! WAVE fixtures and helpers shared by unit tests.

use std::path::{Path, PathBuf};

use crate::format::{WAV_FMT_EXTENSIBLE, WAV_FMT_PCM};

pub struct WavSpec {
    pub format_tag: u16,
    pub channels: u16,
    pub sample_rate: u32,
    pub bits: u16,
    pub big_endian: bool,
    pub extensible: bool,
    /// Overrides the computed block align.
    pub block_align: Option<u16>,
    pub extra_chunks: Vec<([u8; 4], Vec<u8>)>,
}

impl WavSpec {
    pub fn pcm(sample_rate: u32, channels: u16, bits: u16) -> Self {
        Self {
            format_tag: WAV_FMT_PCM,
            channels,
            sample_rate,
            bits,
            big_endian: false,
            extensible: false,
            block_align: None,
            extra_chunks: Vec::new(),
        }
    }
}

/// Write a WAVE file with `data` as the data chunk and return its path.
pub fn write_wav(dir: &Path, name: &str, spec: &WavSpec, data: &[u8]) -> PathBuf {
    let be = spec.big_endian;
    let u16b = |v: u16| if be { v.to_be_bytes() } else { v.to_le_bytes() };
    let u32b = |v: u32| if be { v.to_be_bytes() } else { v.to_le_bytes() };

    let container = spec.bits.div_ceil(8);
    let block_align = spec.block_align.unwrap_or(container * spec.channels);

    let mut fmt = Vec::new();
    let tag = if spec.extensible { WAV_FMT_EXTENSIBLE } else { spec.format_tag };
    fmt.extend_from_slice(&u16b(tag));
    fmt.extend_from_slice(&u16b(spec.channels));
    fmt.extend_from_slice(&u32b(spec.sample_rate));
    fmt.extend_from_slice(&u32b(spec.sample_rate * block_align as u32));
    fmt.extend_from_slice(&u16b(block_align));
    fmt.extend_from_slice(&u16b(spec.bits));
    if spec.extensible {
        fmt.extend_from_slice(&u16b(22));
        fmt.extend_from_slice(&u16b(spec.bits));
        fmt.extend_from_slice(&u32b(0));
        fmt.extend_from_slice(&u16b(spec.format_tag));
        fmt.extend_from_slice(&[0u8; 14]);
    }

    let mut body = Vec::new();
    body.extend_from_slice(b"WAVE");
    for (id, payload) in &spec.extra_chunks {
        push_chunk(&mut body, id, payload, be);
    }
    push_chunk(&mut body, b"fmt ", &fmt, be);
    push_chunk(&mut body, b"data", data, be);

    let mut out = Vec::new();
    out.extend_from_slice(if be { b"RIFX" } else { b"RIFF" });
    out.extend_from_slice(&u32b(body.len() as u32));
    out.extend_from_slice(&body);

    let path = dir.join(name);
    std::fs::write(&path, out).unwrap();
    path
}

fn push_chunk(out: &mut Vec<u8>, id: &[u8; 4], payload: &[u8], be: bool) {
    out.extend_from_slice(id);
    let len = payload.len() as u32;
    out.extend_from_slice(&if be { len.to_be_bytes() } else { len.to_le_bytes() });
    out.extend_from_slice(payload);
    if payload.len() % 2 == 1 {
        out.push(0);
    }
}

/// Deterministic non-silent PCM bytes.
pub fn ramp(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}
