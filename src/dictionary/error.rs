use super::DictionarySector;
use crate::read::ReadError;
use std::{
    error::Error,
    fmt::{Display, Formatter, Result as FmtResult},
    io::Error as IoError,
    str::Utf8Error,
};

/// Error produced while loading a dictionary or resolving one of its keys.
#[derive(Debug)]
pub struct DictionaryError {
    kind: DictionaryErrorKind,
    source: Option<DictionaryErrorSource>,
}

/// The reason a dictionary could not be loaded or a key could not be resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum DictionaryErrorKind {
    /// The dictionary file could not be opened.
    Open,
    /// The file signature was missing or was not `ESFM`.
    Magic,
    /// The format version could not be read.
    Version,
    /// The format version was not recognized.
    UnsupportedVersion {
        /// The version tag found in the file.
        tag: [u8; 2],
    },
    /// The format version belongs to an older revision that is no longer supported.
    SupersededVersion {
        /// The version tag found in the file.
        tag: [u8; 2],
    },
    /// The game name or game version could not be read.
    GameInfo,
    /// The sector table could not be read.
    SectorTable,
    /// A sector could not be read.
    Sector {
        /// The affected sector.
        sector: DictionarySector,
    },
    /// The language list could not be read.
    LanguageTable,
    /// The header of the key table could not be read.
    KeyTable,
    /// The declared key record size leaves no room for a key.
    KeyRecordSize {
        /// The declared record size, in bytes.
        size: u8,
    },
    /// A key record could not be read.
    Key {
        /// Index of the record in the key table.
        index: u32,
    },
    /// The music table could not be read.
    MusicTable,
    /// A string entry could not be read.
    StringOffset {
        /// Offset of the entry in the string sector.
        offset: u32,
    },
    /// A numeric string entry was wider than 8 bytes.
    StringWidth {
        /// Offset of the entry in the string sector.
        offset: u32,
        /// Declared width, in bytes.
        width: u8,
    },
    /// A word entry could not be read.
    WordOffset {
        /// Offset of the entry in the word sector.
        offset: u32,
    },
    /// A file entry could not be read.
    FileOffset {
        /// Offset of the entry in the file sector.
        offset: u32,
    },
    /// Text in the dictionary was not valid UTF-8.
    Utf8,
    /// A key referred to a language that is not in the language list.
    LanguageIndex {
        /// The referenced language index.
        index: u8,
    },
}

#[derive(Debug)]
enum DictionaryErrorSource {
    Read(ReadError),
    Io(IoError),
    Utf8(Utf8Error),
}

impl DictionaryError {
    pub(crate) fn new(kind: DictionaryErrorKind) -> Self {
        Self { kind, source: None }
    }

    pub(crate) fn new_with_source(kind: DictionaryErrorKind, source: ReadError) -> Self {
        Self {
            kind,
            source: Some(DictionaryErrorSource::Read(source)),
        }
    }

    pub(crate) fn factory(kind: DictionaryErrorKind) -> impl FnOnce(ReadError) -> Self {
        move |source| Self::new_with_source(kind, source)
    }

    pub(crate) fn from_io(source: IoError) -> Self {
        Self {
            kind: DictionaryErrorKind::Open,
            source: Some(DictionaryErrorSource::Io(source)),
        }
    }

    pub(crate) fn from_utf8(source: Utf8Error) -> Self {
        Self {
            kind: DictionaryErrorKind::Utf8,
            source: Some(DictionaryErrorSource::Utf8(source)),
        }
    }

    /// Returns the reason for the error.
    #[must_use]
    pub fn kind(&self) -> DictionaryErrorKind {
        self.kind
    }
}

impl Display for DictionaryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        use DictionaryErrorKind::*;

        match self.kind {
            Open => f.write_str("failed to open dictionary"),
            Magic => f.write_str("no file signature found"),
            Version => f.write_str("failed to read dictionary format version"),
            UnsupportedVersion { tag } => f.write_str(&format!(
                "dictionary format version was not recognized ({})",
                String::from_utf8_lossy(&tag)
            )),
            SupersededVersion { tag } => f.write_str(&format!(
                "dictionary format version {} is no longer supported",
                String::from_utf8_lossy(&tag)
            )),
            GameInfo => f.write_str("failed to read game information"),
            SectorTable => f.write_str("failed to read sector table"),
            Sector { sector } => f.write_str(&format!("failed to read {sector} sector")),
            LanguageTable => f.write_str("failed to read language list"),
            KeyTable => f.write_str("failed to read key table header"),
            KeyRecordSize { size } => {
                f.write_str(&format!("key record size was too small ({size} bytes)"))
            }
            Key { index } => f.write_str(&format!("failed to read key at index {index}")),
            MusicTable => f.write_str("failed to read music table"),
            StringOffset { offset } => {
                f.write_str(&format!("failed to read string at offset 0x{offset:06x}"))
            }
            StringWidth { offset, width } => f.write_str(&format!(
                "numeric string at offset 0x{offset:06x} was {width} bytes wide (max 8)"
            )),
            WordOffset { offset } => {
                f.write_str(&format!("failed to read word at offset 0x{offset:06x}"))
            }
            FileOffset { offset } => {
                f.write_str(&format!("failed to read file at offset 0x{offset:06x}"))
            }
            Utf8 => f.write_str("text was not valid UTF-8"),
            LanguageIndex { index } => {
                f.write_str(&format!("language index {index} was out of range"))
            }
        }
    }
}

impl Error for DictionaryError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self.source {
            Some(source) => match source {
                DictionaryErrorSource::Read(e) => Some(e),
                DictionaryErrorSource::Io(e) => Some(e),
                DictionaryErrorSource::Utf8(e) => Some(e),
            },
            None => None,
        }
    }
}
