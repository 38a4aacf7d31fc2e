use crate::{
    bank::parse_bank_index,
    dictionary::{error::DictionaryError, Dictionary},
    read::{Endian, ReadResult, Reader},
};
pub(crate) mod error;
use error::{PackageError, PackageErrorKind, SectorError, SectorErrorKind};
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    fs::File,
    io::{BufReader, Read, Seek},
    path::Path,
    sync::Arc,
};
use tap::Pipe;
use tracing::{debug, info, warn};

const AKPK_MAGIC: [u8; 4] = *b"AKPK";
const ENDIAN_PROBE_OFFSET: u64 = 0x08;
const LITTLE_ENDIAN_PROBE: u32 = 1;
const BIG_ENDIAN_PROBE: u32 = 0x0100_0000;

// flag and the three mandatory sector sizes
const HEADER_BASE_SIZE: u64 = 0x10;

const STANDARD_ENTRY_WIDTH: u64 = 0x14;
const ALT_ENTRY_WIDTH: u64 = 0x18;

const UTF16_NAME_WINDOW: u64 = 0x20;
const UTF8_NAME_WINDOW: u64 = 0x10;

const MAX_BANK_VERSION: u32 = 0x1000;
// banks older than this store streamed sounds in platform-specific containers
const LEGACY_CODEC_BANK_VERSION: u32 = 62;
const LEGACY_CODEC_OFFSET: u64 = 0x14;

/// Kind of a package sector holding entries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SectorKind {
    /// Sound banks, each indexing zero or more embedded streams.
    Banks,
    /// Streamed sounds stored in the package.
    Sounds,
    /// Sounds that may also exist outside the package.
    Externals,
}

impl SectorKind {
    /// Returns the file extension of entries of this sector.
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::Banks => "bnk",
            Self::Sounds | Self::Externals => "wem",
        }
    }
}

impl Display for SectorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(match self {
            Self::Banks => "banks sector",
            Self::Sounds => "sounds sector",
            Self::Externals => "externals sector",
        })
    }
}

/// Fixed fields at the start of a package.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PackageHeader {
    /// Size of the header, in bytes, counted from the end of this field.
    pub header_size: u32,
    /// Header flag. Always 1 in known packages.
    pub flag: u32,
    /// Size of the language sector, in bytes.
    pub languages_size: u32,
    /// Size of the bank sector, in bytes.
    pub banks_size: u32,
    /// Size of the streamed sound sector, in bytes.
    pub sounds_size: u32,
    /// Size of the external sound sector, in bytes. Older packages have no such sector.
    pub externals_size: Option<u32>,
}

/// An entry of the language table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Language {
    /// ID referenced by sector entries.
    pub id: u32,
    /// Display name, such as `English(US)`.
    pub name: String,
}

/// Resolved location of one audio payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamDescriptor {
    /// Relative path the payload would be extracted to.
    pub name: String,
    /// Absolute position of the payload in the package.
    pub offset: u64,
    /// Length of the payload, in bytes.
    pub size: u64,
    /// Name of the package the payload belongs to.
    pub source: Arc<str>,
    /// Sector the payload was listed in.
    pub sector: SectorKind,
    /// Language ID of the entry. 0 means no language.
    pub language: u32,
}

impl StreamDescriptor {
    /// Returns the file stem of the descriptor, used as its content key.
    #[must_use]
    pub fn key(&self) -> &str {
        let file_name = self
            .name
            .rsplit_once('/')
            .map_or(self.name.as_str(), |(_, file_name)| file_name);

        file_name
            .rsplit_once('.')
            .map_or(file_name, |(stem, _)| stem)
    }

    /// Looks up the human-readable path of this stream.
    ///
    /// Returns `Ok(None)` if the dictionary has no entry for [`StreamDescriptor::key`].
    pub fn mapped_name(&self, dictionary: &Dictionary) -> Result<Option<String>, DictionaryError> {
        Ok(dictionary
            .get_key(self.key(), false)?
            .map(|found| found.path))
    }
}

/// Options controlling how package entries become descriptors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PackageOptions {
    /// Also emit a descriptor for every bank itself, next to its streams.
    pub emit_banks: bool,
    /// Prefix the names of language-specific entries with the language folder.
    pub language_folders: bool,
    /// Bank version assumed when it cannot be read or is implausible.
    pub default_bank_version: u32,
}

impl Default for PackageOptions {
    fn default() -> Self {
        Self {
            emit_banks: false,
            language_folders: true,
            default_bank_version: LEGACY_CODEC_BANK_VERSION,
        }
    }
}

/// A parsed Wwise package (`AKPK`).
///
/// Parsing never stops at a malformed sector: failures that only affect one sector or entry
/// are collected in [`Package::sector_errors`], and all streams that could be resolved are kept.
#[derive(Debug)]
pub struct Package {
    name: Arc<str>,
    endian: Endian,
    header: PackageHeader,
    languages: Vec<Language>,
    bank_version: u32,
    streams: Vec<StreamDescriptor>,
    sector_errors: Vec<SectorError>,
}

impl Package {
    /// Opens and parses a package file. The package is named after the file name.
    pub fn open(path: impl AsRef<Path>, options: &PackageOptions) -> Result<Self, PackageError> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .map_or_else(|| path.to_string_lossy(), |name| name.to_string_lossy());

        let file = File::open(path).map_err(PackageError::from_io)?;
        let mut reader = Reader::new(BufReader::new(file), Endian::Little)
            .map_err(PackageError::factory(PackageErrorKind::Open))?;

        Self::parse(&mut reader, &name, options)
    }

    /// Parses a package held in memory.
    pub fn from_bytes(
        data: &[u8],
        name: &str,
        options: &PackageOptions,
    ) -> Result<Self, PackageError> {
        Self::parse(&mut Reader::from_bytes(data, Endian::Little), name, options)
    }

    /// Parses a package from a reader over the whole package.
    pub fn parse<R: Read + Seek>(
        reader: &mut Reader<R>,
        name: &str,
        options: &PackageOptions,
    ) -> Result<Self, PackageError> {
        let endian = read_endianness(reader)?;
        reader.set_endian(endian);
        debug!("package {name} is {endian:?} endian");

        let header = read_header(reader)?;
        debug!("package {name} header: {header:?}");

        let languages_start = reader.position();
        let languages = read_languages(reader, languages_start, header.languages_size)?;

        let mut scan = SectorScan::new(name, &languages, options);

        let banks_start = languages_start + u64::from(header.languages_size);
        let sounds_start = banks_start + u64::from(header.banks_size);
        let externals_start = sounds_start + u64::from(header.sounds_size);

        scan.run(reader, SectorKind::Banks, banks_start, header.banks_size);

        let bank_version = scan.bank_version.unwrap_or_else(|| {
            if header.externals_size.is_none() {
                warn!(
                    "could not detect bank version of {name}, assuming {}",
                    options.default_bank_version
                );
            }
            options.default_bank_version
        });
        scan.bank_version = Some(bank_version);

        scan.run(reader, SectorKind::Sounds, sounds_start, header.sounds_size);

        if let Some(size) = header.externals_size {
            scan.run(reader, SectorKind::Externals, externals_start, size);
        }

        info!(
            "loaded package {name}: {} languages, bank version {bank_version}, {} streams, {} sector errors",
            languages.len(),
            scan.streams.len(),
            scan.errors.len()
        );

        Ok(Self {
            name: scan.source,
            endian,
            header,
            languages,
            bank_version,
            streams: scan.streams,
            sector_errors: scan.errors,
        })
    }

    /// Returns the name the package was parsed under.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the detected byte order of the package.
    #[must_use]
    pub fn endian(&self) -> Endian {
        self.endian
    }

    /// Returns the package header.
    #[must_use]
    pub fn header(&self) -> &PackageHeader {
        &self.header
    }

    /// Returns the language table, in file order.
    #[must_use]
    pub fn languages(&self) -> &[Language] {
        &self.languages
    }

    /// Returns the bank version, detected from the first bank or assumed.
    #[must_use]
    pub fn bank_version(&self) -> u32 {
        self.bank_version
    }

    /// Returns every resolved stream, in file order.
    #[must_use]
    pub fn streams(&self) -> &[StreamDescriptor] {
        &self.streams
    }

    /// Returns the failures confined to single sectors or entries.
    #[must_use]
    pub fn sector_errors(&self) -> &[SectorError] {
        &self.sector_errors
    }
}

fn read_endianness<R: Read + Seek>(reader: &mut Reader<R>) -> Result<Endian, PackageError> {
    use PackageErrorKind as Kind;

    reader.seek(0).map_err(PackageError::factory(Kind::Magic))?;

    match reader.take_const() {
        Ok(data) if data == AKPK_MAGIC => Ok(()),
        Err(e) => Err(PackageError::new_with_source(Kind::Magic, e)),
        _ => Err(PackageError::new(Kind::Magic)),
    }?;

    // the probe is the header flag, which is always 1
    let probe = reader
        .seek(ENDIAN_PROBE_OFFSET)
        .and_then(|()| reader.u32_with(Endian::Little))
        .map_err(PackageError::factory(Kind::Endianness))?;

    match probe {
        LITTLE_ENDIAN_PROBE => Ok(Endian::Little),
        BIG_ENDIAN_PROBE => Ok(Endian::Big),
        probe => Err(PackageError::new(Kind::UnknownEndianness { probe })),
    }
}

fn read_header<R: Read + Seek>(reader: &mut Reader<R>) -> Result<PackageHeader, PackageError> {
    use PackageErrorKind as Kind;

    reader
        .seek(AKPK_MAGIC.len() as u64)
        .map_err(PackageError::factory(Kind::HeaderSize))?;

    let header_size = reader.u32().map_err(PackageError::factory(Kind::HeaderSize))?;
    let flag = reader.u32().map_err(PackageError::factory(Kind::Flag))?;
    let languages_size = reader
        .u32()
        .map_err(PackageError::factory(Kind::LanguagesSize))?;
    let banks_size = reader.u32().map_err(PackageError::factory(Kind::BanksSize))?;
    let sounds_size = reader.u32().map_err(PackageError::factory(Kind::SoundsSize))?;

    // the externals size is only present if the header has room left for it
    let mandatory =
        u64::from(languages_size) + u64::from(banks_size) + u64::from(sounds_size) + HEADER_BASE_SIZE;

    let externals_size = if mandatory < u64::from(header_size) {
        reader
            .u32()
            .map_err(PackageError::factory(Kind::ExternalsSize))?
            .pipe(Some)
    } else {
        None
    };

    Ok(PackageHeader {
        header_size,
        flag,
        languages_size,
        banks_size,
        sounds_size,
        externals_size,
    })
}

fn read_languages<R: Read + Seek>(
    reader: &mut Reader<R>,
    start: u64,
    size: u32,
) -> Result<Vec<Language>, PackageError> {
    let end = start + u64::from(size);
    if end > reader.len() {
        return Err(PackageError::new(PackageErrorKind::LanguageSector));
    }

    if size == 0 {
        return Ok(Vec::new());
    }

    let count = reader
        .u32()
        .map_err(PackageError::factory(PackageErrorKind::LanguageCount))?;

    let mut languages = Vec::with_capacity(count.min(64) as usize);

    for index in 0..count {
        let kind = PackageErrorKind::Language { index };

        let name_offset = reader.u32().map_err(PackageError::factory(kind))?;
        let id = reader.u32().map_err(PackageError::factory(kind))?;

        let resume = reader.position();
        let name = read_language_name(reader, start + u64::from(name_offset))
            .map_err(PackageError::factory(kind))?;
        reader.seek(resume).map_err(PackageError::factory(kind))?;

        debug!("language {id}: {name}");
        languages.push(Language { id, name });
    }

    reader
        .seek(end)
        .map_err(PackageError::factory(PackageErrorKind::LanguageSector))?;

    Ok(languages)
}

// names are either UTF-16LE in a 0x20-byte window or UTF-8 in a 0x10-byte window,
// told apart by a zero in the first two bytes
fn read_language_name<R: Read + Seek>(reader: &mut Reader<R>, offset: u64) -> ReadResult<String> {
    reader.seek(offset)?;
    let probe: [u8; 2] = reader.take_const()?;
    reader.seek(offset)?;

    if probe.contains(&0) {
        let window = reader.remaining().min(UTF16_NAME_WINDOW) & !1;
        let data = reader.take(window as usize)?;

        let units: Vec<u16> = data
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .take_while(|&unit| unit != 0)
            .collect();

        Ok(String::from_utf16_lossy(&units))
    } else {
        let window = reader.remaining().min(UTF8_NAME_WINDOW);
        let data = reader.take(window as usize)?;

        let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
        Ok(String::from_utf8_lossy(&data[..end]).into_owned())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EntryLayout {
    Standard,
    Alt,
}

#[derive(Clone, Copy, Debug)]
enum EntryId {
    Single(u32),
    Pair(u32, u32),
}

#[derive(Clone, Copy, Debug)]
struct RawEntry {
    id: EntryId,
    block_size: u32,
    size: u64,
    offset: u32,
    language: u32,
}

impl RawEntry {
    fn read<R: Read + Seek>(
        reader: &mut Reader<R>,
        sector: SectorKind,
        layout: EntryLayout,
    ) -> ReadResult<Self> {
        let alt_external = layout == EntryLayout::Alt && sector == SectorKind::Externals;

        let id = if alt_external {
            // the two halves of an external ID are stored in byte order
            let (first, second) = (reader.u32()?, reader.u32()?);
            match reader.endian() {
                Endian::Little => EntryId::Pair(second, first),
                Endian::Big => EntryId::Pair(first, second),
            }
        } else {
            EntryId::Single(reader.u32()?)
        };

        let block_size = reader.u32()?;

        let size = if layout == EntryLayout::Alt && !alt_external {
            reader.u64()?
        } else {
            u64::from(reader.u32()?)
        };

        let offset = reader.u32()?;
        let language = reader.u32()?;

        Ok(Self {
            id,
            block_size,
            size,
            offset,
            language,
        })
    }

    fn absolute_offset(&self) -> u64 {
        match self.block_size {
            0 => u64::from(self.offset),
            block_size => u64::from(self.offset) * u64::from(block_size),
        }
    }
}

// per-package state threaded through the sector scans
struct SectorScan<'opts> {
    options: &'opts PackageOptions,
    source: Arc<str>,
    language_prefix: String,
    bank_version: Option<u32>,
    bank_version_probed: bool,
    streams: Vec<StreamDescriptor>,
    errors: Vec<SectorError>,
}

impl<'opts> SectorScan<'opts> {
    fn new(name: &str, languages: &[Language], options: &'opts PackageOptions) -> Self {
        // every language folder is joined into one prefix
        let language_prefix = languages
            .iter()
            .map(|language| format!("{}/", language.name))
            .collect();

        Self {
            options,
            source: Arc::from(name),
            language_prefix,
            bank_version: None,
            bank_version_probed: false,
            streams: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn run<R: Read + Seek>(
        &mut self,
        reader: &mut Reader<R>,
        sector: SectorKind,
        start: u64,
        size: u32,
    ) {
        if size == 0 {
            return;
        }

        let before = self.streams.len();

        match self.scan(reader, sector, start, size) {
            Ok(()) => debug!(
                "{} streams from {sector} of {}",
                self.streams.len() - before,
                self.source
            ),
            Err(e) => self.record(e),
        }
    }

    fn record(&mut self, error: SectorError) {
        warn!("skipping in package {}: {error}", self.source);
        self.errors.push(error);
    }

    fn scan<R: Read + Seek>(
        &mut self,
        reader: &mut Reader<R>,
        sector: SectorKind,
        start: u64,
        size: u32,
    ) -> Result<(), SectorError> {
        reader
            .seek(start)
            .map_err(SectorError::factory(sector, None, SectorErrorKind::Seek))?;

        let count = reader
            .u32()
            .map_err(SectorError::factory(sector, None, SectorErrorKind::EntryCount))?;

        if count == 0 {
            return Ok(());
        }

        let table_size = u64::from(size).checked_sub(4);
        let layout = match table_size {
            Some(table_size) if table_size == ALT_ENTRY_WIDTH * u64::from(count) => {
                EntryLayout::Alt
            }
            Some(table_size) if table_size == STANDARD_ENTRY_WIDTH * u64::from(count) => {
                EntryLayout::Standard
            }
            _ => {
                return Err(SectorError::new(
                    sector,
                    None,
                    SectorErrorKind::EntryWidth { size, count },
                ))
            }
        };

        debug!("{sector}: {count} entries, {layout:?} layout");

        for index in 0..count {
            let entry = RawEntry::read(reader, sector, layout).map_err(SectorError::factory(
                sector,
                Some(index),
                SectorErrorKind::Entry,
            ))?;

            let resume = reader.position();

            if let Err(e) = self.resolve(reader, sector, index, &entry) {
                self.record(e);
            }

            reader.seek(resume).map_err(SectorError::factory(
                sector,
                Some(index),
                SectorErrorKind::Seek,
            ))?;
        }

        Ok(())
    }

    fn resolve<R: Read + Seek>(
        &mut self,
        reader: &mut Reader<R>,
        sector: SectorKind,
        index: u32,
        entry: &RawEntry,
    ) -> Result<(), SectorError> {
        let offset = entry.absolute_offset();

        if sector == SectorKind::Banks && !self.bank_version_probed {
            self.bank_version_probed = true;
            self.bank_version = probe_bank_version(reader, offset, self.options)
                .map_err(SectorError::factory(
                    sector,
                    Some(index),
                    SectorErrorKind::BankVersion,
                ))?
                .pipe(Some);
        }

        let in_bounds = offset
            .checked_add(entry.size)
            .is_some_and(|end| end <= reader.len());

        if !in_bounds {
            return Err(SectorError::new(
                sector,
                Some(index),
                SectorErrorKind::EntryOutOfBounds {
                    offset,
                    size: entry.size,
                },
            ));
        }

        let extension = match sector {
            SectorKind::Sounds
                if self
                    .bank_version
                    .is_some_and(|version| version < LEGACY_CODEC_BANK_VERSION) =>
            {
                probe_legacy_codec(reader, offset).map_err(SectorError::factory(
                    sector,
                    Some(index),
                    SectorErrorKind::CodecProbe,
                ))?
            }
            _ => sector.extension(),
        };

        let prefix = if entry.language != 0 && self.options.language_folders {
            self.language_prefix.clone()
        } else {
            String::new()
        };

        let name = match entry.id {
            EntryId::Pair(first, second) => {
                format!("externals/{prefix}{first:08x}{second:08x}.{extension}")
            }
            EntryId::Single(id) => format!("{prefix}{id}.{extension}"),
        };

        if sector != SectorKind::Banks {
            self.push(name, offset, entry.size, sector, entry.language);
            return Ok(());
        }

        if self.options.emit_banks {
            self.push(name.clone(), offset, entry.size, sector, entry.language);
        }

        let payload = reader
            .seek(offset)
            .and_then(|()| reader.take(entry.size as usize))
            .map_err(SectorError::factory(
                sector,
                Some(index),
                SectorErrorKind::Payload,
            ))?;

        let bank_id = match entry.id {
            EntryId::Single(id) => id,
            EntryId::Pair(_, second) => second,
        };

        for sub in parse_bank_index(&payload, &name, reader.endian()) {
            if sub.offset + u64::from(sub.size) > entry.size {
                self.record(SectorError::new(
                    sector,
                    Some(index),
                    SectorErrorKind::SubEntryOutOfBounds { id: sub.id },
                ));
                continue;
            }

            self.push(
                format!("{prefix}{bank_id}/{}.wem", sub.id),
                offset + sub.offset,
                u64::from(sub.size),
                sector,
                entry.language,
            );
        }

        Ok(())
    }

    fn push(&mut self, name: String, offset: u64, size: u64, sector: SectorKind, language: u32) {
        self.streams.push(StreamDescriptor {
            name,
            offset,
            size,
            source: Arc::clone(&self.source),
            sector,
            language,
        });
    }
}

fn probe_bank_version<R: Read + Seek>(
    reader: &mut Reader<R>,
    offset: u64,
    options: &PackageOptions,
) -> ReadResult<u32> {
    // BKHD tag and size precede the version; bank chunks share the package byte order
    let version = reader
        .seek(offset)
        .and_then(|()| reader.skip(8))
        .and_then(|()| reader.u32())?;

    if version > MAX_BANK_VERSION {
        warn!(
            "implausible bank version {version}, assuming {}",
            options.default_bank_version
        );
        return Ok(options.default_bank_version);
    }

    debug!("bank version {version}");
    Ok(version)
}

fn probe_legacy_codec<R: Read + Seek>(
    reader: &mut Reader<R>,
    offset: u64,
) -> ReadResult<&'static str> {
    reader.seek(offset + LEGACY_CODEC_OFFSET)?;

    Ok(match reader.u16()? {
        0x0401 | 0x0166 => "xma",
        0xFFFF => "ogg",
        _ => "wav",
    })
}

#[cfg(test)]
mod test {
    use super::{
        error::{PackageErrorKind, SectorErrorKind},
        Package, PackageOptions, SectorKind,
    };
    use crate::{
        bank::test::{build_bank, build_bank_in},
        dictionary::{test::voice_dictionary, Dictionary},
        read::Endian,
    };

    struct TestEntry {
        id: u32,
        id2: u32,
        block_size: u32,
        language: u32,
        payload: Vec<u8>,
        // points the entry at this offset instead of at its payload
        offset_override: Option<u32>,
        size_override: Option<u64>,
    }

    impl TestEntry {
        fn new(id: u32, payload: Vec<u8>) -> Self {
            Self {
                id,
                id2: 0,
                block_size: 0,
                language: 0,
                payload,
                offset_override: None,
                size_override: None,
            }
        }

        fn language(mut self, language: u32) -> Self {
            self.language = language;
            self
        }
    }

    #[derive(Default)]
    struct TestPackage {
        big_endian: bool,
        alt: bool,
        languages: Vec<(u32, Vec<u8>)>,
        banks: Vec<TestEntry>,
        sounds: Vec<TestEntry>,
        externals: Option<Vec<TestEntry>>,
        // overrides the declared entry count of the sounds sector
        sounds_count: Option<u32>,
    }

    fn utf8_name(name: &str) -> Vec<u8> {
        let mut buf = name.as_bytes().to_vec();
        buf.push(0);
        buf
    }

    fn utf16_name(name: &str) -> Vec<u8> {
        name.encode_utf16()
            .chain([0])
            .flat_map(u16::to_le_bytes)
            .collect()
    }

    impl TestPackage {
        fn put_u32(&self, buf: &mut Vec<u8>, value: u32) {
            if self.big_endian {
                buf.extend(value.to_be_bytes());
            } else {
                buf.extend(value.to_le_bytes());
            }
        }

        fn put_u64(&self, buf: &mut Vec<u8>, value: u64) {
            if self.big_endian {
                buf.extend(value.to_be_bytes());
            } else {
                buf.extend(value.to_le_bytes());
            }
        }

        fn language_sector(&self) -> Vec<u8> {
            let mut buf = Vec::new();
            self.put_u32(&mut buf, self.languages.len() as u32);

            let mut name_offset = 4 + 8 * self.languages.len();
            for (id, name) in &self.languages {
                self.put_u32(&mut buf, name_offset as u32);
                self.put_u32(&mut buf, *id);
                name_offset += name.len();
            }
            for (_, name) in &self.languages {
                buf.extend_from_slice(name);
            }
            while buf.len() % 4 != 0 {
                buf.push(0);
            }
            buf
        }

        fn entry_width(&self) -> usize {
            if self.alt {
                0x18
            } else {
                0x14
            }
        }

        fn sector_size(&self, entries: &[TestEntry]) -> u32 {
            if entries.is_empty() {
                0
            } else {
                (4 + entries.len() * self.entry_width()) as u32
            }
        }

        fn build(&self) -> Vec<u8> {
            let languages = self.language_sector();
            let no_entries = Vec::new();
            let externals = self.externals.as_ref().unwrap_or(&no_entries);

            let sizes = [
                languages.len() as u32,
                self.sector_size(&self.banks),
                self.sector_size(&self.sounds),
                self.sector_size(externals),
            ];
            let has_externals = self.externals.is_some();

            let header_size = 0x10 + sizes[..3].iter().sum::<u32>()
                + if has_externals { 4 + sizes[3] } else { 0 };

            // payloads follow the header
            let mut payload_pos = 8 + header_size as usize;
            let mut payload_area = Vec::new();
            let mut offsets = Vec::new();
            for entry in self.banks.iter().chain(&self.sounds).chain(externals) {
                if entry.block_size != 0 {
                    let block = entry.block_size as usize;
                    while payload_pos % block != 0 {
                        payload_area.push(0);
                        payload_pos += 1;
                    }
                    offsets.push((payload_pos / block) as u32);
                } else {
                    offsets.push(payload_pos as u32);
                }
                payload_area.extend_from_slice(&entry.payload);
                payload_pos += entry.payload.len();
            }

            let mut buf = b"AKPK".to_vec();
            self.put_u32(&mut buf, header_size);
            self.put_u32(&mut buf, 1);
            for size in &sizes[..3] {
                self.put_u32(&mut buf, *size);
            }
            if has_externals {
                self.put_u32(&mut buf, sizes[3]);
            }
            buf.extend(languages);

            let mut offsets = offsets.into_iter();
            for (kind, entries) in [
                (SectorKind::Banks, &self.banks),
                (SectorKind::Sounds, &self.sounds),
                (SectorKind::Externals, externals),
            ] {
                if entries.is_empty() {
                    continue;
                }
                let count = match kind {
                    SectorKind::Sounds => self.sounds_count.unwrap_or(entries.len() as u32),
                    _ => entries.len() as u32,
                };
                self.put_u32(&mut buf, count);

                for entry in entries {
                    let offset = offsets.next().unwrap();
                    if self.alt && kind == SectorKind::Externals {
                        // the low half comes first in little-endian packages
                        if self.big_endian {
                            self.put_u32(&mut buf, entry.id);
                            self.put_u32(&mut buf, entry.id2);
                        } else {
                            self.put_u32(&mut buf, entry.id2);
                            self.put_u32(&mut buf, entry.id);
                        }
                    } else {
                        self.put_u32(&mut buf, entry.id);
                    }
                    self.put_u32(&mut buf, entry.block_size);

                    let size = entry.size_override.unwrap_or(entry.payload.len() as u64);
                    if self.alt && kind != SectorKind::Externals {
                        self.put_u64(&mut buf, size);
                    } else {
                        self.put_u32(&mut buf, size as u32);
                    }

                    self.put_u32(&mut buf, entry.offset_override.unwrap_or(offset));
                    self.put_u32(&mut buf, entry.language);
                }
            }

            assert_eq!(buf.len(), 8 + header_size as usize);
            buf.extend(payload_area);
            buf
        }
    }

    fn parse(data: &[u8]) -> Package {
        Package::from_bytes(data, "test.pck", &PackageOptions::default()).unwrap()
    }

    fn names(package: &Package) -> Vec<&str> {
        package.streams().iter().map(|s| s.name.as_str()).collect()
    }

    fn assert_in_bounds(package: &Package, data: &[u8]) {
        for stream in package.streams() {
            assert!(stream.offset + stream.size <= data.len() as u64, "{stream:?}");
        }
    }

    #[test]
    fn read_magic_and_endianness() {
        let opts = PackageOptions::default();

        assert!(Package::from_bytes(b"", "a", &opts)
            .is_err_and(|e| e.kind() == PackageErrorKind::Magic));
        assert!(Package::from_bytes(b"AKPJ\x00\x00\x00\x00\x01\x00\x00\x00", "a", &opts)
            .is_err_and(|e| e.kind() == PackageErrorKind::Magic));
        assert!(Package::from_bytes(b"AKPK\x00\x00\x00\x00\x01\x00", "a", &opts)
            .is_err_and(|e| e.kind() == PackageErrorKind::Endianness));
        assert!(Package::from_bytes(b"AKPK\x00\x00\x00\x00\x02\x00\x00\x00", "a", &opts)
            .is_err_and(|e| e.kind() == PackageErrorKind::UnknownEndianness { probe: 2 }));
        assert!(Package::from_bytes(b"AKPK\x00\x00\x00\x00\x01\x00\x00\x00", "a", &opts)
            .is_err_and(|e| e.kind() == PackageErrorKind::LanguagesSize));
    }

    #[test]
    fn read_banks_and_sounds() {
        let bank = build_bank(134, &[(7, 0, 4), (9, 4, 2)], b"abcdef");
        let data = TestPackage {
            languages: vec![(1, utf8_name("English(US)"))],
            banks: vec![TestEntry::new(100, bank)],
            sounds: vec![TestEntry::new(200, vec![0xAB; 16]).language(1)],
            ..TestPackage::default()
        }
        .build();

        let package = parse(&data);

        assert_eq!(package.endian(), Endian::Little);
        assert_eq!(package.header().externals_size, None);
        assert_eq!(package.languages().len(), 1);
        assert_eq!(package.languages()[0].name, "English(US)");
        assert_eq!(package.bank_version(), 134);
        assert!(package.sector_errors().is_empty());
        assert_eq!(
            names(&package),
            ["100/7.wem", "100/9.wem", "English(US)/200.wem"]
        );
        assert_in_bounds(&package, &data);

        let streams = package.streams();
        assert_eq!(&data[streams[0].offset as usize..][..4], b"abcd");
        assert_eq!(&data[streams[1].offset as usize..][..2], b"ef");
        assert_eq!(streams[2].size, 16);
        assert_eq!(streams[2].sector, SectorKind::Sounds);
        assert_eq!(&*streams[2].source, "test.pck");
        assert_eq!(streams[1].key(), "9");
        assert_eq!(streams[2].key(), "200");
    }

    #[test]
    fn scale_offsets_by_block_size() {
        let mut sound = TestEntry::new(5, b"RIFF".to_vec());
        sound.block_size = 16;

        let data = TestPackage {
            sounds: vec![sound],
            ..TestPackage::default()
        }
        .build();

        let package = parse(&data);
        let stream = &package.streams()[0];

        assert_eq!(stream.offset % 16, 0);
        assert_eq!(&data[stream.offset as usize..][..4], b"RIFF");
    }

    #[test]
    fn malformed_sector_keeps_other_sectors() {
        let bank = build_bank(134, &[(7, 0, 4)], b"abcd");
        let data = TestPackage {
            banks: vec![TestEntry::new(100, bank)],
            sounds: vec![TestEntry::new(200, vec![0; 8])],
            sounds_count: Some(5),
            ..TestPackage::default()
        }
        .build();

        let package = parse(&data);

        assert_eq!(names(&package), ["100/7.wem"]);
        assert_eq!(package.sector_errors().len(), 1);

        let error = &package.sector_errors()[0];
        assert_eq!(error.sector(), SectorKind::Sounds);
        assert_eq!(error.index(), None);
        assert_eq!(error.kind(), SectorErrorKind::EntryWidth { size: 24, count: 5 });
    }

    #[test]
    fn truncated_count_keeps_other_sectors() {
        let bank = build_bank(134, &[(7, 0, 4)], b"abcd");
        let bank_size = bank.len() as u32;

        // the bank hides in the unused tail of the language sector, so the package can end
        // in the middle of the sounds count
        let languages_size = 4 + bank_size;
        let mut data = b"AKPK".to_vec();
        for value in [0x10 + languages_size + 0x18 + 0x18, 1, languages_size, 0x18, 0x18, 0] {
            data.extend(value.to_le_bytes());
        }
        data.extend_from_slice(&bank);
        for value in [1, 100, 0, bank_size, 0x1C, 0] {
            data.extend(value.to_le_bytes());
        }
        data.extend([1_u8, 0]);

        let package = parse(&data);

        assert_eq!(package.bank_version(), 134);
        assert_eq!(names(&package), ["100/7.wem"]);
        assert_eq!(&data[package.streams()[0].offset as usize..][..4], b"abcd");

        assert_eq!(package.sector_errors().len(), 1);
        let error = &package.sector_errors()[0];
        assert_eq!(error.sector(), SectorKind::Sounds);
        assert_eq!(error.index(), None);
        assert_eq!(error.kind(), SectorErrorKind::EntryCount);
    }

    #[test]
    fn truncated_entry_table() {
        // the first sound points at the magic, so no payload area is needed
        let mut first = TestEntry::new(300, Vec::new());
        first.offset_override = Some(0);
        first.size_override = Some(4);

        let mut data = TestPackage {
            sounds: vec![first, TestEntry::new(301, Vec::new())],
            ..TestPackage::default()
        }
        .build();
        data.truncate(data.len() - 6);

        let package = parse(&data);

        assert_eq!(names(&package), ["300.wem"]);
        assert_eq!(package.sector_errors()[0].index(), Some(1));
        assert_eq!(package.sector_errors()[0].kind(), SectorErrorKind::Entry);
    }

    #[test]
    fn skip_entries_out_of_bounds() {
        let mut broken = TestEntry::new(201, vec![0; 4]);
        broken.size_override = Some(1 << 20);

        let data = TestPackage {
            sounds: vec![TestEntry::new(200, vec![0; 4]), broken, TestEntry::new(202, vec![0; 4])],
            ..TestPackage::default()
        }
        .build();

        let package = parse(&data);

        assert_eq!(names(&package), ["200.wem", "202.wem"]);
        assert_in_bounds(&package, &data);

        let error = &package.sector_errors()[0];
        assert_eq!(error.index(), Some(1));
        assert!(matches!(
            error.kind(),
            SectorErrorKind::EntryOutOfBounds { size: 1_048_576, .. }
        ));
    }

    #[test]
    fn read_big_endian() {
        let data = TestPackage {
            big_endian: true,
            languages: vec![(3, utf8_name("French"))],
            sounds: vec![TestEntry::new(0x0102_0304, vec![1, 2, 3]).language(3)],
            ..TestPackage::default()
        }
        .build();

        let package = parse(&data);

        assert_eq!(package.endian(), Endian::Big);
        assert_eq!(package.languages()[0].id, 3);
        assert_eq!(names(&package), ["French/16909060.wem"]);
        assert_eq!(package.streams()[0].size, 3);
    }

    #[test]
    fn read_language_names() {
        let data = TestPackage {
            languages: vec![
                (1, utf16_name("Chinese")),
                (2, utf8_name("Japanese")),
                (3, utf16_name("English(US)")),
            ],
            sounds: vec![TestEntry::new(1, vec![0; 4]).language(2)],
            ..TestPackage::default()
        }
        .build();

        let package = parse(&data);
        let languages: Vec<_> = package.languages().iter().map(|l| l.name.as_str()).collect();

        assert_eq!(languages, ["Chinese", "Japanese", "English(US)"]);
        // every language folder is part of the prefix
        assert_eq!(names(&package), ["Chinese/Japanese/English(US)/1.wem"]);
    }

    #[test]
    fn language_folders_option() {
        let data = TestPackage {
            languages: vec![(1, utf8_name("English(US)"))],
            banks: vec![TestEntry::new(100, build_bank(134, &[(7, 0, 2)], b"ab")).language(1)],
            ..TestPackage::default()
        }
        .build();

        let options = PackageOptions {
            emit_banks: true,
            language_folders: false,
            ..PackageOptions::default()
        };
        let package = Package::from_bytes(&data, "test.pck", &options).unwrap();

        assert_eq!(names(&package), ["100.bnk", "100/7.wem"]);
        assert_eq!(package.streams()[0].sector, SectorKind::Banks);
        assert_eq!(package.streams()[0].key(), "100");
    }

    #[test]
    fn read_alt_layout() {
        let mut external = TestEntry::new(0xAABB_CCDD, vec![0; 2]);
        external.id2 = 0x1122_3344;

        let data = TestPackage {
            alt: true,
            sounds: vec![TestEntry::new(200, vec![0; 8])],
            externals: Some(vec![external]),
            ..TestPackage::default()
        }
        .build();

        let package = parse(&data);

        assert!(package.header().externals_size.is_some());
        assert!(package.sector_errors().is_empty());
        assert_eq!(names(&package), ["200.wem", "externals/aabbccdd11223344.wem"]);
        assert_eq!(package.streams()[0].size, 8);
        assert_eq!(package.streams()[1].sector, SectorKind::Externals);
    }

    #[test]
    fn read_big_endian_alt_externals() {
        let mut external = TestEntry::new(0xAABB_CCDD, vec![0; 2]);
        external.id2 = 0x1122_3344;

        let data = TestPackage {
            big_endian: true,
            alt: true,
            externals: Some(vec![external]),
            ..TestPackage::default()
        }
        .build();

        let package = parse(&data);

        assert_eq!(package.endian(), Endian::Big);
        assert!(package.sector_errors().is_empty());
        assert_eq!(names(&package), ["externals/aabbccdd11223344.wem"]);
        assert_eq!(package.streams()[0].size, 2);
    }

    #[test]
    fn read_big_endian_banks() {
        let mut sound = vec![0; 0x18];
        sound[0x14..0x16].copy_from_slice(&0xFFFF_u16.to_be_bytes());

        let data = TestPackage {
            big_endian: true,
            banks: vec![TestEntry::new(
                100,
                build_bank_in(Endian::Big, 48, &[(7, 0, 4)], b"abcd"),
            )],
            sounds: vec![TestEntry::new(200, sound)],
            ..TestPackage::default()
        }
        .build();

        let package = parse(&data);

        assert_eq!(package.bank_version(), 48);
        assert_eq!(names(&package), ["100/7.wem", "200.ogg"]);
        assert_eq!(&data[package.streams()[0].offset as usize..][..4], b"abcd");
        assert!(package.sector_errors().is_empty());
    }

    #[test]
    fn legacy_codec_extensions() {
        fn sound(id: u32, codec: u16) -> TestEntry {
            let mut payload = vec![0; 0x18];
            payload[0x14..0x16].copy_from_slice(&codec.to_le_bytes());
            TestEntry::new(id, payload)
        }

        let data = TestPackage {
            banks: vec![TestEntry::new(100, build_bank(48, &[], b""))],
            sounds: vec![sound(1, 0xFFFF), sound(2, 0x0166), sound(3, 0x0401), sound(4, 0x0001)],
            ..TestPackage::default()
        }
        .build();

        let package = parse(&data);

        assert_eq!(package.bank_version(), 48);
        assert_eq!(names(&package), ["1.ogg", "2.xma", "3.xma", "4.wav"]);
    }

    #[test]
    fn bank_version_fallback() {
        let data = TestPackage {
            sounds: vec![TestEntry::new(1, vec![0; 0x18])],
            ..TestPackage::default()
        }
        .build();

        let package = parse(&data);
        assert_eq!(package.bank_version(), 62);
        assert_eq!(names(&package), ["1.wem"]);

        // an implausible version is replaced, not trusted
        let data = TestPackage {
            banks: vec![TestEntry::new(100, build_bank(0x3000_0000, &[], b""))],
            sounds: vec![TestEntry::new(1, vec![0; 0x18])],
            ..TestPackage::default()
        }
        .build();

        let options = PackageOptions {
            default_bank_version: 70,
            ..PackageOptions::default()
        };
        let package = Package::from_bytes(&data, "test.pck", &options).unwrap();
        assert_eq!(package.bank_version(), 70);
    }

    #[test]
    fn map_stream_names() {
        let dictionary = Dictionary::from_bytes(&voice_dictionary()).unwrap();
        let data = TestPackage {
            sounds: vec![TestEntry::new(1234, vec![0; 4]), TestEntry::new(99, vec![0; 4])],
            ..TestPackage::default()
        }
        .build();

        let package = parse(&data);
        let streams = package.streams();

        assert_eq!(streams[0].mapped_name(&dictionary).unwrap().as_deref(), Some("voice"));
        assert_eq!(streams[1].mapped_name(&dictionary).unwrap(), None);
    }

    #[test]
    fn open_from_file() {
        let data = TestPackage {
            sounds: vec![TestEntry::new(1, vec![0; 4])],
            ..TestPackage::default()
        }
        .build();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Minimum.pck");
        std::fs::write(&path, data).unwrap();

        let package = Package::open(&path, &PackageOptions::default()).unwrap();
        assert_eq!(package.name(), "Minimum.pck");
        assert_eq!(&*package.streams()[0].source, "Minimum.pck");

        assert!(Package::open(dir.path().join("missing.pck"), &PackageOptions::default())
            .is_err_and(|e| e.kind() == PackageErrorKind::Open));
    }
}
