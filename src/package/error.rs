use super::SectorKind;
use crate::read::ReadError;
use std::{
    error::Error,
    fmt::{Display, Formatter, Result as FmtResult},
    io::Error as IoError,
};

/// Error that prevents a whole package from being parsed.
#[derive(Debug)]
pub struct PackageError {
    kind: PackageErrorKind,
    source: Option<PackageErrorSource>,
}

/// The reason a package could not be parsed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum PackageErrorKind {
    /// The package file could not be opened.
    Open,
    /// The file signature was missing or was not `AKPK`.
    Magic,
    /// The byte order probe could not be read.
    Endianness,
    /// The byte order probe held neither `1` nor its byte-reversed form.
    UnknownEndianness {
        /// The probe value, read as little-endian.
        probe: u32,
    },
    /// The header size could not be read.
    HeaderSize,
    /// The header flag could not be read.
    Flag,
    /// The size of the language sector could not be read.
    LanguagesSize,
    /// The size of the bank sector could not be read.
    BanksSize,
    /// The size of the streamed sound sector could not be read.
    SoundsSize,
    /// The size of the external sound sector could not be read.
    ExternalsSize,
    /// The number of languages could not be read.
    LanguageCount,
    /// A language table entry or its name could not be read.
    Language {
        /// Index of the language in the table.
        index: u32,
    },
    /// The declared language sector ran past the end of the package.
    LanguageSector,
}

#[derive(Debug)]
enum PackageErrorSource {
    Read(ReadError),
    Io(IoError),
}

impl PackageError {
    pub(crate) fn new(kind: PackageErrorKind) -> Self {
        Self { kind, source: None }
    }

    pub(crate) fn new_with_source(kind: PackageErrorKind, source: ReadError) -> Self {
        Self {
            kind,
            source: Some(PackageErrorSource::Read(source)),
        }
    }

    pub(crate) fn factory(kind: PackageErrorKind) -> impl FnOnce(ReadError) -> Self {
        move |source| Self::new_with_source(kind, source)
    }

    pub(crate) fn from_io(source: IoError) -> Self {
        Self {
            kind: PackageErrorKind::Open,
            source: Some(PackageErrorSource::Io(source)),
        }
    }

    /// Returns the reason the package could not be parsed.
    #[must_use]
    pub fn kind(&self) -> PackageErrorKind {
        self.kind
    }
}

impl Display for PackageError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        use PackageErrorKind::*;

        match self.kind {
            Open => f.write_str("failed to open package"),
            Magic => f.write_str("no file signature found"),
            Endianness => f.write_str("failed to read byte order probe"),
            UnknownEndianness { probe } => f.write_str(&format!(
                "byte order of package was not recognized (probe 0x{probe:08x})"
            )),
            HeaderSize => f.write_str("failed to read size of package header"),
            Flag => f.write_str("failed to read package flag"),
            LanguagesSize => f.write_str("failed to read size of language sector"),
            BanksSize => f.write_str("failed to read size of bank sector"),
            SoundsSize => f.write_str("failed to read size of streamed sound sector"),
            ExternalsSize => f.write_str("failed to read size of external sound sector"),
            LanguageCount => f.write_str("failed to read number of languages"),
            Language { index } => {
                f.write_str(&format!("failed to read language at index {index}"))
            }
            LanguageSector => f.write_str("language sector extends past end of package"),
        }
    }
}

impl Error for PackageError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self.source {
            Some(source) => match source {
                PackageErrorSource::Read(e) => Some(e),
                PackageErrorSource::Io(e) => Some(e),
            },
            None => None,
        }
    }
}

/// Error confined to one sector (or one entry of a sector) of a package.
///
/// Other sectors of the same package are unaffected.
#[derive(Debug)]
pub struct SectorError {
    sector: SectorKind,
    index: Option<u32>,
    kind: SectorErrorKind,
    source: Option<ReadError>,
}

/// The reason a sector or sector entry was skipped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum SectorErrorKind {
    /// The start of the sector could not be reached.
    Seek,
    /// The number of entries could not be read.
    EntryCount,
    /// The sector size did not divide into entries of a known width.
    EntryWidth {
        /// Declared size of the sector, in bytes.
        size: u32,
        /// Declared number of entries.
        count: u32,
    },
    /// An entry could not be read.
    Entry,
    /// The bank version could not be read from the first bank.
    BankVersion,
    /// The payload of a bank could not be read.
    Payload,
    /// An entry pointed outside the package.
    EntryOutOfBounds {
        /// Absolute offset of the entry.
        offset: u64,
        /// Size of the entry.
        size: u64,
    },
    /// A stream indexed by a bank pointed outside the bank.
    SubEntryOutOfBounds {
        /// ID of the stream within the bank.
        id: u32,
    },
    /// The legacy codec discriminator of a streamed sound could not be read.
    CodecProbe,
}

impl SectorError {
    pub(crate) fn new(sector: SectorKind, index: Option<u32>, kind: SectorErrorKind) -> Self {
        Self {
            sector,
            index,
            kind,
            source: None,
        }
    }

    pub(crate) fn new_with_source(
        sector: SectorKind,
        index: Option<u32>,
        kind: SectorErrorKind,
        source: ReadError,
    ) -> Self {
        Self {
            sector,
            index,
            kind,
            source: Some(source),
        }
    }

    pub(crate) fn factory(
        sector: SectorKind,
        index: Option<u32>,
        kind: SectorErrorKind,
    ) -> impl FnOnce(ReadError) -> Self {
        move |source| Self::new_with_source(sector, index, kind, source)
    }

    /// Returns the sector the error occurred in.
    #[must_use]
    pub fn sector(&self) -> SectorKind {
        self.sector
    }

    /// Returns the zero-based index of the affected entry, if the error concerns a single entry.
    #[must_use]
    pub fn index(&self) -> Option<u32> {
        self.index
    }

    /// Returns the reason the sector or entry was skipped.
    #[must_use]
    pub fn kind(&self) -> SectorErrorKind {
        self.kind
    }
}

impl Display for SectorError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        use SectorErrorKind::*;

        match self.kind {
            Seek => f.write_str("failed to seek to start of sector"),
            EntryCount => f.write_str("failed to read number of entries"),
            EntryWidth { size, count } => f.write_str(&format!(
                "sector of {size} bytes does not hold {count} entries of a known width"
            )),
            Entry => f.write_str("failed to read entry"),
            BankVersion => f.write_str("failed to read bank version"),
            Payload => f.write_str("failed to read bank payload"),
            EntryOutOfBounds { offset, size } => f.write_str(&format!(
                "entry data ({size} bytes at 0x{offset:x}) extends past end of package"
            )),
            SubEntryOutOfBounds { id } => {
                f.write_str(&format!("bank stream {id} extends past end of bank"))
            }
            CodecProbe => f.write_str("failed to read legacy codec discriminator"),
        }?;

        match self.index {
            Some(index) => f.write_str(&format!(" - entry {index} in {}", self.sector)),
            None => f.write_str(&format!(" - {}", self.sector)),
        }
    }
}

impl Error for SectorError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self.source {
            Some(e) => Some(e),
            None => None,
        }
    }
}
