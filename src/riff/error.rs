use crate::read::ReadError;
use std::{
    error::Error,
    fmt::{Display, Formatter, Result as FmtResult},
};

#[derive(Debug)]
pub(crate) struct RiffError {
    kind: RiffErrorKind,
    source: Option<ReadError>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RiffErrorKind {
    Empty,
    Signature,
    WaveMarker,
    Chunk,
    MissingFmt,
    FmtSize { size: u32 },
    Fmt,
    Xma2WaveFormatEx,
    MissingData,
    ZeroChannels,
    ZeroInterleave,
    ZeroSampleRate,
    VorbChunk,
    VorbisExtraSize { size: u16 },
    VorbisHeader,
}

impl RiffError {
    pub(crate) fn new(kind: RiffErrorKind) -> Self {
        Self { kind, source: None }
    }

    pub(crate) fn new_with_source(kind: RiffErrorKind, source: ReadError) -> Self {
        Self {
            kind,
            source: Some(source),
        }
    }

    pub(crate) fn factory(kind: RiffErrorKind) -> impl FnOnce(ReadError) -> Self {
        move |source| Self::new_with_source(kind, source)
    }

    #[cfg(test)]
    pub(crate) fn kind(&self) -> RiffErrorKind {
        self.kind
    }
}

impl Display for RiffError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        use RiffErrorKind::*;

        match self.kind {
            Empty => f.write_str("stream is empty"),
            Signature => f.write_str("no file signature (RIFF or RIFX) found"),
            WaveMarker => f.write_str("no WAVE marker found"),
            Chunk => f.write_str("failed to read chunk header"),
            MissingFmt => f.write_str("no fmt chunk found"),
            FmtSize { size } => f.write_str(&format!(
                "fmt chunk was too short ({size} bytes, expected at least 16)"
            )),
            Fmt => f.write_str("failed to read fmt chunk"),
            Xma2WaveFormatEx => f.write_str("XMA2WAVEFORMATEX fmt chunks are not supported"),
            MissingData => f.write_str("no data chunk found"),
            ZeroChannels => f.write_str("channel count was 0"),
            ZeroInterleave => f.write_str("interleave block size was 0"),
            ZeroSampleRate => f.write_str("sample rate was 0"),
            VorbChunk => f.write_str("vorb chunk found (older Vorbis variant is not supported)"),
            VorbisExtraSize { size } => f.write_str(&format!(
                "Vorbis extra format size was 0x{size:x} (expected 0x30)"
            )),
            VorbisHeader => f.write_str("failed to read Vorbis header"),
        }
    }
}

impl Error for RiffError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self.source {
            Some(e) => Some(e),
            None => None,
        }
    }
}
