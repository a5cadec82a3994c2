//! WAVE sample source.
//!
//! Walks the RIFF/RIFX chunk list once at open time and then exposes the `data` chunk as a
//! sequential, frame-aligned byte stream for the reader task.

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, LittleEndian, ReadBytesExt};

use crate::error::OpenError;
use crate::format::{SampleFormat, WAV_FMT_EXTENSIBLE, WAV_FMT_IEEE_FLOAT, WAV_FMT_PCM};

const FMT_BODY_LEN: u64 = 16;
const FMT_EXTENSIBLE_LEN: u64 = 40;

/// Immutable description of an opened WAVE stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceInfo {
    /// Format tag after resolving WAVE_FORMAT_EXTENSIBLE.
    pub format_tag: u16,
    pub channels: u16,
    pub sample_rate: u32,
    pub bytes_per_sec: u32,
    pub block_align: u16,
    pub bits_per_sample: u16,
    /// Container width of one sample in bytes.
    pub bytes_per_sample: u16,
    pub big_endian: bool,
    pub sample_format: SampleFormat,
    /// Declared length of the `data` chunk in bytes.
    pub data_len: u64,
}

impl SourceInfo {
    /// Bytes per interleaved frame (one sample for every channel).
    pub fn bytes_per_frame(&self) -> usize {
        self.bytes_per_sample as usize * self.channels as usize
    }

    /// Whole seconds of audio in the data chunk.
    pub fn duration_secs(&self) -> u64 {
        if self.bytes_per_sec == 0 {
            return 0;
        }
        self.data_len / self.bytes_per_sec as u64
    }
}

impl fmt::Display for SourceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let layout = match self.channels {
            1 => "mono".to_string(),
            2 => "stereo".to_string(),
            n => format!("{n} channels"),
        };
        write!(
            f,
            "{} {} Hz {}, {} s",
            self.sample_format,
            self.sample_rate,
            layout,
            self.duration_secs()
        )
    }
}

/// Sequential reader over the `data` chunk of a WAVE file.
pub struct WavSource {
    path: PathBuf,
    reader: Option<BufReader<File>>,
    info: SourceInfo,
    consumed: u64,
}

impl WavSource {
    /// Open `path`, validate the container and position the stream at the first PCM byte.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, OpenError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => OpenError::NotFound(path.to_path_buf()),
            _ => OpenError::Io(e),
        })?;
        let mut reader = BufReader::new(file);
        let info = parse_header(&mut reader)?;
        tracing::debug!(path = %path.display(), info = %info, data_len = info.data_len, "wav opened");
        Ok(Self {
            path: path.to_path_buf(),
            reader: Some(reader),
            info,
            consumed: 0,
        })
    }

    pub fn info(&self) -> &SourceInfo {
        &self.info
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes of the declared data chunk not yet consumed.
    pub fn remaining(&self) -> u64 {
        self.info.data_len.saturating_sub(self.consumed)
    }

    /// Round `bytes` down to a whole number of frames.
    pub fn frame_floor(&self, bytes: usize) -> usize {
        let frame = self.info.bytes_per_frame();
        bytes - bytes % frame
    }

    /// Read up to `buf.len()` bytes (rounded down to whole frames) from the data chunk.
    ///
    /// Returns the number of valid bytes placed at the front of `buf`, always a multiple of
    /// the frame size. `0` means end of stream, a closed source, or an I/O error (logged).
    pub fn read_chunk(&mut self, buf: &mut [u8]) -> usize {
        let remaining = usize::try_from(self.remaining()).unwrap_or(usize::MAX);
        let want = self.frame_floor(buf.len().min(remaining));
        let Some(reader) = self.reader.as_mut() else {
            return 0;
        };
        if want == 0 {
            return 0;
        }

        let mut got = 0;
        while got < want {
            match reader.read(&mut buf[got..want]) {
                Ok(0) => {
                    tracing::debug!(path = %self.path.display(), "end of file");
                    break;
                }
                Ok(n) => got += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(path = %self.path.display(), "read error: {e}");
                    break;
                }
            }
        }

        // A truncated file may end mid-frame; the dangling bytes are dropped.
        self.consumed += got as u64;
        self.frame_floor(got)
    }

    /// Release the file handle. Safe to call more than once.
    pub fn close(&mut self) {
        if self.reader.take().is_some() {
            tracing::debug!(path = %self.path.display(), "wav closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.reader.is_none()
    }
}

impl Drop for WavSource {
    fn drop(&mut self) {
        self.close();
    }
}

/// Case-insensitive `.wav` extension check.
pub fn is_wav_path(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("wav"))
        .unwrap_or(false)
}

fn parse_header<R: Read + Seek>(r: &mut R) -> Result<SourceInfo, OpenError> {
    let mut magic = [0u8; 4];
    read_exact_or_malformed(r, &mut magic, "RIFF header")?;
    let big_endian = match &magic {
        b"RIFF" => false,
        b"RIFX" => true,
        _ => return Err(OpenError::BadMagic),
    };
    let riff_len = read_u32(r, big_endian).map_err(|e| malformed(e, "RIFF header"))?;
    let mut form = [0u8; 4];
    read_exact_or_malformed(r, &mut form, "RIFF header")?;
    if &form != b"WAVE" {
        return Err(OpenError::BadMagic);
    }
    tracing::trace!(riff_len = riff_len as u64 + 8, big_endian, "riff header");

    let declared = find_chunk(r, b"fmt ", big_endian)?;
    let fmt_len = u64::from(declared) + u64::from(declared % 2);
    if fmt_len < FMT_BODY_LEN {
        return Err(OpenError::MalformedChunk(format!(
            "unknown length of 'fmt ' chunk (read {fmt_len}, should be {FMT_BODY_LEN} at least)"
        )));
    }

    let bad_fmt = |e| malformed(e, "fmt chunk");
    let mut format_tag = read_u16(r, big_endian).map_err(bad_fmt)?;
    let channels = read_u16(r, big_endian).map_err(bad_fmt)?;
    let sample_rate = read_u32(r, big_endian).map_err(bad_fmt)?;
    let bytes_per_sec = read_u32(r, big_endian).map_err(bad_fmt)?;
    let block_align = read_u16(r, big_endian).map_err(bad_fmt)?;
    let bits_per_sample = read_u16(r, big_endian).map_err(bad_fmt)?;
    let mut consumed = FMT_BODY_LEN;

    if format_tag == WAV_FMT_EXTENSIBLE {
        if fmt_len < FMT_EXTENSIBLE_LEN {
            return Err(OpenError::MalformedChunk(format!(
                "extensible 'fmt ' chunk too short ({fmt_len} < {FMT_EXTENSIBLE_LEN})"
            )));
        }
        let _ext_size = read_u16(r, big_endian).map_err(bad_fmt)?;
        let _valid_bits = read_u16(r, big_endian).map_err(bad_fmt)?;
        let _channel_mask = read_u32(r, big_endian).map_err(bad_fmt)?;
        format_tag = read_u16(r, big_endian).map_err(bad_fmt)?;
        let mut guid_tail = [0u8; 14];
        read_exact_or_malformed(r, &mut guid_tail, "fmt chunk")?;
        consumed = FMT_EXTENSIBLE_LEN;
    }
    skip(r, fmt_len - consumed).map_err(bad_fmt)?;

    if format_tag != WAV_FMT_PCM && format_tag != WAV_FMT_IEEE_FLOAT {
        return Err(OpenError::UnsupportedEncoding {
            tag: format_tag,
            bits: bits_per_sample,
        });
    }
    if channels < 1 {
        return Err(OpenError::InvalidChannels(channels));
    }
    if sample_rate == 0 {
        return Err(OpenError::MalformedChunk("sample rate is zero".to_string()));
    }

    let bytes_per_sample = container_bytes(block_align, channels, bits_per_sample);
    let sample_format =
        SampleFormat::from_wav(format_tag, bits_per_sample, bytes_per_sample, big_endian).ok_or(
            OpenError::UnsupportedEncoding {
                tag: format_tag,
                bits: bits_per_sample,
            },
        )?;
    if usize::from(bytes_per_sample) != sample_format.bytes_per_sample() {
        return Err(OpenError::UnsupportedEncoding {
            tag: format_tag,
            bits: bits_per_sample,
        });
    }

    let data_len = find_chunk(r, b"data", big_endian)?;

    Ok(SourceInfo {
        format_tag,
        channels,
        sample_rate,
        bytes_per_sec,
        block_align,
        bits_per_sample,
        bytes_per_sample,
        big_endian,
        sample_format,
        data_len: data_len as u64,
    })
}

/// Per-sample container width, preferring block align when it is consistent.
fn container_bytes(block_align: u16, channels: u16, bits: u16) -> u16 {
    if block_align > 0 && block_align % channels == 0 {
        block_align / channels
    } else {
        bits.div_ceil(8)
    }
}

/// Skip chunks until `id`, returning its declared body length.
fn find_chunk<R: Read + Seek>(r: &mut R, id: &[u8; 4], big_endian: bool) -> Result<u32, OpenError> {
    let what = String::from_utf8_lossy(id).into_owned();
    loop {
        let mut chunk_id = [0u8; 4];
        match r.read_exact(&mut chunk_id) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                return Err(OpenError::MalformedChunk(format!("no '{what}' chunk")));
            }
            Err(e) => return Err(OpenError::Io(e)),
        }
        let len = read_u32(r, big_endian).map_err(|e| malformed(e, "chunk header"))?;
        if &chunk_id == id {
            return Ok(len);
        }
        tracing::trace!(chunk = %String::from_utf8_lossy(&chunk_id), len, "skipping chunk");
        skip(r, len as u64 + (len % 2) as u64).map_err(|e| malformed(e, "chunk body"))?;
    }
}

fn skip<R: Seek>(r: &mut R, bytes: impl Into<u64>) -> io::Result<()> {
    let bytes = bytes.into();
    if bytes > 0 {
        r.seek(SeekFrom::Current(bytes as i64))?;
    }
    Ok(())
}

fn read_u16<R: Read>(r: &mut R, big_endian: bool) -> io::Result<u16> {
    if big_endian {
        r.read_u16::<BigEndian>()
    } else {
        r.read_u16::<LittleEndian>()
    }
}

fn read_u32<R: Read>(r: &mut R, big_endian: bool) -> io::Result<u32> {
    if big_endian {
        r.read_u32::<BigEndian>()
    } else {
        r.read_u32::<LittleEndian>()
    }
}

fn read_exact_or_malformed<R: Read>(r: &mut R, buf: &mut [u8], what: &str) -> Result<(), OpenError> {
    r.read_exact(buf).map_err(|e| malformed(e, what))
}

fn malformed(e: io::Error, what: &str) -> OpenError {
    if e.kind() == ErrorKind::UnexpectedEof {
        OpenError::MalformedChunk(format!("truncated {what}"))
    } else {
        OpenError::Io(e)
    }
}
