use crate::{
    cipher::decrypt,
    read::{Endian, ReadResult, Reader},
};
mod error;
use error::{RiffError, RiffErrorKind};
use phf::{phf_map, Map};
use std::{
    collections::HashMap,
    fmt::{Display, Formatter, Result as FmtResult},
    io::Cursor,
};
use tracing::{debug, warn};

const RIFF_MAGIC: [u8; 4] = *b"RIFF";
const RIFX_MAGIC: [u8; 4] = *b"RIFX";
const WAVE_MARKERS: [[u8; 4]; 2] = [*b"WAVE", *b"XWMA"];
const WAVE_MARKER_OFFSET: u64 = 0x08;
const FIRST_CHUNK_OFFSET: u64 = 0x0C;
const CHUNK_HEADER_SIZE: u64 = 8;

const KNOWN_CHUNKS: [[u8; 4]; 8] = [
    *b"fmt ", *b"JUNK", *b"data", *b"akd ", *b"cue ", *b"LIST", *b"smpl", *b"vorb",
];

const MIN_FMT_SIZE: u32 = 0x10;
const XMA2_WAVEFORMAT: u16 = 0x0165;
const XMA2_WAVEFORMATEX: u16 = 0x0166;
const CHANNEL_LAYOUT_EXTRA_SIZE: u16 = 6;

const VORBIS_EXTRA_SIZE: u16 = 0x30;
const VORBIS_HEADER_OFFSET: u64 = 0x18;

/// Audio codec identified from the format code of a `fmt` chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Codec {
    /// Uncompressed PCM.
    Pcm,
    /// IMA ADPCM.
    Ima,
    /// Xbox WMA.
    Xwma,
    /// Xbox XMA2.
    Xma2,
    /// AAC.
    Aac,
    /// Nintendo DSP ADPCM.
    Dsp,
    /// Sony HEVAG.
    Hevag,
    /// Sony ATRAC9.
    Atrac9,
    /// Wwise's custom Vorbis.
    Vorbis,
    /// Opus as stored for Nintendo Switch.
    OpusNx,
    /// Opus.
    Opus,
    /// Wwise's custom Opus.
    OpusWw,
    /// Platinum 4-bit ADPCM.
    PtAdpcm,
}

static CODECS: Map<u16, Codec> = phf_map! {
    0x0001_u16 => Codec::Pcm,
    0x0002_u16 => Codec::Ima,
    0x0069_u16 => Codec::Ima,
    0x0161_u16 => Codec::Xwma,
    0x0162_u16 => Codec::Xwma,
    0x0165_u16 => Codec::Xma2,
    0x0166_u16 => Codec::Xma2,
    0xAAC0_u16 => Codec::Aac,
    0xFFF0_u16 => Codec::Dsp,
    0xFFFB_u16 => Codec::Hevag,
    0xFFFC_u16 => Codec::Atrac9,
    0xFFFE_u16 => Codec::Pcm,
    0xFFFF_u16 => Codec::Vorbis,
    0x3039_u16 => Codec::OpusNx,
    0x3040_u16 => Codec::Opus,
    0x3041_u16 => Codec::OpusWw,
    0x8311_u16 => Codec::PtAdpcm,
};

impl Codec {
    /// Looks up the codec of a `fmt` format code.
    #[must_use]
    pub fn from_format(format: u16) -> Option<Self> {
        CODECS.get(&format).copied()
    }

    /// Returns the short tag of the codec, such as `PCM`.
    #[must_use]
    pub fn tag(self) -> &'static str {
        match self {
            Self::Pcm => "PCM",
            Self::Ima => "IMA",
            Self::Xwma => "XWMA",
            Self::Xma2 => "XMA2",
            Self::Aac => "AAC",
            Self::Dsp => "DSP",
            Self::Hevag => "HEVAG",
            Self::Atrac9 => "ATRAC9",
            Self::Vorbis => "VORBIS",
            Self::OpusNx => "OPUSNX",
            Self::Opus => "OPUS",
            Self::OpusWw => "OPUSWW",
            Self::PtAdpcm => "PTADPCM",
        }
    }

    /// Returns the human-readable name of the codec.
    #[must_use]
    pub fn display_name(self) -> &'static str {
        match self {
            Self::PtAdpcm => "Platinum 4-bit ADPCM",
            Self::Vorbis => "Custom Vorbis",
            other => other.tag(),
        }
    }
}

impl Display for Codec {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.display_name())
    }
}

/// How the samples of multi-channel audio are laid out.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Layout {
    /// Channels alternate in blocks of [`AudioMetadata::interleave_block_size`] bytes.
    Interleave,
}

/// Positions read from the Vorbis header of a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VorbisOffsets {
    /// Offset of the setup packet, relative to the data chunk.
    pub setup: u32,
    /// Offset of the first audio packet, relative to the data chunk.
    pub audio: u32,
    /// Absolute position of the first audio packet in the stream: the data chunk offset plus
    /// [`VorbisOffsets::audio`].
    ///
    /// Older extraction tools subtract the audio offset from the data chunk offset instead.
    /// That yields a position before the data chunk, so the offset is added here. This is a
    /// best-effort value that has not been validated against every game.
    pub audio_start: u64,
}

/// Format and duration information of one audio stream.
///
/// Fields that could not be determined keep their default (zero or `None`).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AudioMetadata {
    /// Raw format code of the `fmt` chunk.
    pub format: u16,
    /// Number of channels.
    pub channels: u16,
    /// Sample rate, in hertz.
    pub sample_rate: u32,
    /// Average bitrate, in bytes per second.
    pub avg_bitrate: u32,
    /// Block alignment, in bytes.
    pub block_size: u16,
    /// Bits per sample.
    pub bits_per_sample: u16,
    /// Size of the extra format bytes.
    pub extra_size: u16,
    /// Channel layout (speaker mask), if declared.
    pub channel_layout: Option<u32>,
    /// Channel type, if the layout word carried one.
    pub channel_type: Option<u8>,
    /// Codec identified from the format code.
    pub codec: Option<Codec>,
    /// Sample layout, if known for the codec.
    pub layout: Option<Layout>,
    /// Size of one channel's block in interleaved layouts, in bytes.
    pub interleave_block_size: Option<u32>,
    /// Number of samples per channel.
    pub num_samples: Option<u64>,
    /// Duration, in seconds. 0 if unknown.
    pub duration: f64,
    /// Header positions for Vorbis streams.
    pub vorbis: Option<VorbisOffsets>,
}

#[derive(Clone, Copy, Debug)]
struct Chunk {
    offset: u64,
    size: u32,
}

impl AudioMetadata {
    /// Reads the metadata of a RIFF/RIFX audio stream.
    ///
    /// Never fails: problems are logged with `name` and produce default or partial metadata.
    /// Only Platinum ADPCM and Vorbis streams get a duration.
    #[must_use]
    pub fn parse(data: &[u8], name: &str) -> Self {
        match parse_metadata(data, name) {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!("no metadata for {name}: {e}");
                Self::default()
            }
        }
    }

    /// Like [`AudioMetadata::parse`], but decrypts `data` in place first if it does not start
    /// with a RIFF or RIFX signature.
    ///
    /// `file_offset` is the absolute position of `data` in the protected stream.
    #[must_use]
    pub fn parse_decrypting(data: &mut [u8], name: &str, seed: u32, file_offset: u64) -> Self {
        if !has_signature(data) {
            debug!("decrypting {name} with seed {seed}");
            decrypt(data, seed, file_offset);
        }

        Self::parse(data, name)
    }

    /// Returns the human-readable name of the codec, if identified.
    #[must_use]
    pub fn codec_name(&self) -> Option<&'static str> {
        self.codec.map(Codec::display_name)
    }
}

fn has_signature(data: &[u8]) -> bool {
    data.get(..4)
        .is_some_and(|magic| magic == RIFF_MAGIC || magic == RIFX_MAGIC)
}

fn parse_metadata(data: &[u8], name: &str) -> Result<AudioMetadata, RiffError> {
    use RiffErrorKind as Kind;

    if data.is_empty() {
        return Err(RiffError::new(Kind::Empty));
    }

    let mut reader = Reader::from_bytes(data, Endian::Little);

    let endian = match reader.take_const::<4>() {
        Ok(RIFF_MAGIC) => Ok(Endian::Little),
        Ok(RIFX_MAGIC) => Ok(Endian::Big),
        Ok(_) => Err(RiffError::new(Kind::Signature)),
        Err(e) => Err(RiffError::new_with_source(Kind::Signature, e)),
    }?;
    reader.set_endian(endian);

    let marker = reader
        .seek(WAVE_MARKER_OFFSET)
        .and_then(|()| reader.take_const::<4>())
        .map_err(RiffError::factory(Kind::WaveMarker))?;

    if !WAVE_MARKERS.contains(&marker) {
        return Err(RiffError::new(Kind::WaveMarker));
    }

    let chunks = read_chunks(&mut reader, name)?;

    let fmt = chunks
        .get(b"fmt ")
        .ok_or_else(|| RiffError::new(Kind::MissingFmt))?;

    if fmt.size < MIN_FMT_SIZE {
        return Err(RiffError::new(Kind::FmtSize { size: fmt.size }));
    }

    let mut metadata =
        read_fmt(&mut reader, *fmt).map_err(RiffError::factory(Kind::Fmt))?;

    if metadata.format == XMA2_WAVEFORMATEX {
        return Err(RiffError::new(Kind::Xma2WaveFormatEx));
    }

    let Some(codec) = Codec::from_format(metadata.format) else {
        warn!("unknown codec 0x{:04x} in {name}", metadata.format);
        return Ok(metadata);
    };
    metadata.codec = Some(codec);

    match codec {
        Codec::PtAdpcm => set_ptadpcm_duration(&mut metadata, &chunks)?,
        Codec::Vorbis => set_vorbis_duration(&mut metadata, &chunks, &mut reader, *fmt)?,
        _ => debug!("duration of {codec} streams is not computed ({name})"),
    }

    Ok(metadata)
}

fn read_chunks(
    reader: &mut Reader<Cursor<&[u8]>>,
    name: &str,
) -> Result<HashMap<[u8; 4], Chunk>, RiffError> {
    reader
        .seek(FIRST_CHUNK_OFFSET)
        .map_err(RiffError::factory(RiffErrorKind::Chunk))?;

    let mut chunks = HashMap::new();

    while reader.remaining() >= CHUNK_HEADER_SIZE {
        let tag: [u8; 4] = reader
            .take_const()
            .map_err(RiffError::factory(RiffErrorKind::Chunk))?;
        let declared = reader
            .u32()
            .map_err(RiffError::factory(RiffErrorKind::Chunk))?;

        if !KNOWN_CHUNKS.contains(&tag) {
            warn!(
                "unexpected chunk {} in {name}",
                String::from_utf8_lossy(&tag)
            );
        }

        // the remaining length fits in a u32 whenever it is the smaller one
        #[allow(clippy::cast_possible_truncation)]
        let size = u64::from(declared).min(reader.remaining()) as u32;

        let chunk = Chunk {
            offset: reader.position(),
            size,
        };
        reader
            .skip(u64::from(size))
            .map_err(RiffError::factory(RiffErrorKind::Chunk))?;

        if chunks.insert(tag, chunk).is_some() {
            debug!(
                "duplicate chunk {} in {name}, keeping the last one",
                String::from_utf8_lossy(&tag)
            );
        }
    }

    Ok(chunks)
}

fn read_fmt(reader: &mut Reader<Cursor<&[u8]>>, fmt: Chunk) -> ReadResult<AudioMetadata> {
    reader.seek(fmt.offset)?;

    let mut metadata = AudioMetadata {
        format: reader.u16()?,
        channels: reader.u16()?,
        sample_rate: reader.u32()?,
        avg_bitrate: reader.u32()?,
        block_size: reader.u16()?,
        bits_per_sample: reader.u16()?,
        ..AudioMetadata::default()
    };

    // XMA2 fmt chunks have no extra size field
    if fmt.size > MIN_FMT_SIZE
        && metadata.format != XMA2_WAVEFORMAT
        && metadata.format != XMA2_WAVEFORMATEX
    {
        metadata.extra_size = reader.u16()?;
    }

    if metadata.extra_size >= CHANNEL_LAYOUT_EXTRA_SIZE {
        let layout = reader.u32()?;

        if layout & 0xFF == u32::from(metadata.channels) {
            metadata.channel_type = Some(((layout >> 8) & 0x0F) as u8);
            metadata.channel_layout = Some(layout >> 12);
        } else {
            metadata.channel_layout = Some(layout);
        }
    }

    Ok(metadata)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
fn set_ptadpcm_duration(
    metadata: &mut AudioMetadata,
    chunks: &HashMap<[u8; 4], Chunk>,
) -> Result<(), RiffError> {
    let data = chunks
        .get(b"data")
        .ok_or_else(|| RiffError::new(RiffErrorKind::MissingData))?;

    let channels = u32::from(metadata.channels);
    if channels == 0 {
        return Err(RiffError::new(RiffErrorKind::ZeroChannels));
    }

    let interleave = u32::from(metadata.block_size) / channels;
    if interleave == 0 {
        return Err(RiffError::new(RiffErrorKind::ZeroInterleave));
    }
    if metadata.sample_rate == 0 {
        return Err(RiffError::new(RiffErrorKind::ZeroSampleRate));
    }

    // each interleave block holds a 5-byte header, then two samples per byte plus two in the header
    let frames = f64::from(data.size) / f64::from(channels * interleave);
    let samples_per_frame = 2 + (i64::from(interleave) - 5) * 2;
    let num_samples = (frames * samples_per_frame as f64) as u64;

    metadata.layout = Some(Layout::Interleave);
    metadata.interleave_block_size = Some(interleave);
    metadata.num_samples = Some(num_samples);
    metadata.duration = num_samples as f64 / f64::from(metadata.sample_rate);

    Ok(())
}

fn set_vorbis_duration(
    metadata: &mut AudioMetadata,
    chunks: &HashMap<[u8; 4], Chunk>,
    reader: &mut Reader<Cursor<&[u8]>>,
    fmt: Chunk,
) -> Result<(), RiffError> {
    use RiffErrorKind as Kind;

    if chunks.contains_key(b"vorb") {
        return Err(RiffError::new(Kind::VorbChunk));
    }
    if metadata.extra_size != VORBIS_EXTRA_SIZE {
        return Err(RiffError::new(Kind::VorbisExtraSize {
            size: metadata.extra_size,
        }));
    }
    if metadata.sample_rate == 0 {
        return Err(RiffError::new(Kind::ZeroSampleRate));
    }

    let data = chunks
        .get(b"data")
        .ok_or_else(|| RiffError::new(Kind::MissingData))?;

    let header = fmt.offset + VORBIS_HEADER_OFFSET;

    let num_samples = reader
        .seek(header)
        .and_then(|()| reader.u32())
        .map_err(RiffError::factory(Kind::VorbisHeader))?;
    let setup = reader
        .seek(header + 0x10)
        .and_then(|()| reader.u32())
        .map_err(RiffError::factory(Kind::VorbisHeader))?;
    let audio = reader.u32().map_err(RiffError::factory(Kind::VorbisHeader))?;

    metadata.num_samples = Some(u64::from(num_samples));
    metadata.duration = f64::from(num_samples) / f64::from(metadata.sample_rate);
    metadata.vorbis = Some(VorbisOffsets {
        setup,
        audio,
        audio_start: data.offset + u64::from(audio),
    });

    Ok(())
}
