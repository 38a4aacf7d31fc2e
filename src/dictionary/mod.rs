use crate::read::{Endian, Reader};
pub(crate) mod error;
use bilge::prelude::*;
use error::{DictionaryError, DictionaryErrorKind};
use std::{
    collections::HashMap,
    fmt::{Display, Formatter, Result as FmtResult},
    fs::File,
    io::{BufReader, Cursor, Read, Seek},
    path::Path,
    str::from_utf8,
};
use tap::Pipe;
use tracing::{debug, info, warn};

const ESFM_MAGIC: [u8; 4] = *b"ESFM";
const CURRENT_VERSION: [u8; 2] = *b"40";
const SUPERSEDED_VERSIONS: [[u8; 2]; 2] = [*b"21", *b"30"];

const PATH_SEPARATOR: char = '\\';
const WORD_SEPARATOR: char = '_';

// a string length byte above this marks a big-endian number of (length - 128) bytes
const NUMERIC_STRING_FLAG: u8 = 128;
const KEY_REFERENCE_SIZE: u8 = 4;

/// The six sectors of a dictionary file, in file order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DictionarySector {
    /// Language names.
    Languages,
    /// Text fragments, some stored as numbers.
    Strings,
    /// Lists of strings joined by underscores.
    Words,
    /// Lists of words joined by path separators.
    Files,
    /// Content keys and their file references.
    Keys,
    /// Direct key-to-path entries for music banks.
    Music,
}

impl DictionarySector {
    const ALL: [Self; 6] = [
        Self::Languages,
        Self::Strings,
        Self::Words,
        Self::Files,
        Self::Keys,
        Self::Music,
    ];
}

impl Display for DictionarySector {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(match self {
            Self::Languages => "languages",
            Self::Strings => "strings",
            Self::Words => "words",
            Self::Files => "files",
            Self::Keys => "keys",
            Self::Music => "music",
        })
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct SectorRange {
    offset: u32,
    size: u32,
}

// upper byte: language index, lower 24 bits: offset into the file sector
#[bitsize(32)]
#[derive(FromBits)]
struct KeyReference {
    file_offset: u24,
    language: u8,
}

/// A resolved dictionary entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyMatch<'dict> {
    /// Human-readable path of the file, using `\` as separator.
    pub path: String,
    /// Name of the file's language, if it was requested and the entry has one.
    pub language: Option<&'dict str>,
}

/// Mapping from opaque content keys to human-readable file paths.
///
/// File paths are not stored flat: each path is a list of words, and each word a list of
/// strings. These three sectors are kept as raw bytes and only interpreted when a key is looked
/// up. A loaded dictionary is immutable and can be shared between threads.
#[derive(Debug)]
pub struct Dictionary {
    game: String,
    version: String,
    languages: Box<[String]>,
    strings: Box<[u8]>,
    words: Box<[u8]>,
    files: Box<[u8]>,
    keys: HashMap<Box<str>, u32>,
    music_root: String,
    music: HashMap<u32, Box<str>>,
}

impl Dictionary {
    /// Loads a dictionary from a file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DictionaryError> {
        let file = File::open(path.as_ref()).map_err(DictionaryError::from_io)?;
        let mut reader = Reader::new(BufReader::new(file), Endian::Little)
            .map_err(DictionaryError::factory(DictionaryErrorKind::Open))?;
        Self::parse(&mut reader)
    }

    /// Loads a dictionary from an in-memory buffer.
    pub fn from_bytes(data: &[u8]) -> Result<Self, DictionaryError> {
        Self::parse(&mut Reader::from_bytes(data, Endian::Little))
    }

    /// Loads a dictionary from a reader positioned anywhere in the source.
    pub fn parse<R: Read + Seek>(reader: &mut Reader<R>) -> Result<Self, DictionaryError> {
        use DictionaryErrorKind as Kind;

        reader.set_endian(Endian::Little);
        reader.seek(0).map_err(DictionaryError::factory(Kind::Magic))?;

        match reader.take_const() {
            Ok(data) if data == ESFM_MAGIC => Ok(()),
            Err(e) => Err(DictionaryError::new_with_source(Kind::Magic, e)),
            _ => Err(DictionaryError::new(Kind::Magic)),
        }?;

        // two reserved bytes precede the version tag
        reader
            .skip(2)
            .map_err(DictionaryError::factory(Kind::Version))?;

        let tag: [u8; 2] = reader
            .take_const()
            .map_err(DictionaryError::factory(Kind::Version))?;

        if tag != CURRENT_VERSION {
            return Err(DictionaryError::new(if SUPERSEDED_VERSIONS.contains(&tag) {
                Kind::SupersededVersion { tag }
            } else {
                Kind::UnsupportedVersion { tag }
            }));
        }

        let game = read_short_string(reader, Kind::GameInfo)?;
        let version = read_short_string(reader, Kind::GameInfo)?;

        let mut ranges = [SectorRange::default(); 6];
        for range in &mut ranges {
            range.offset = reader
                .le_u24()
                .map_err(DictionaryError::factory(Kind::SectorTable))?;
            range.size = reader
                .le_u24()
                .map_err(DictionaryError::factory(Kind::SectorTable))?;
        }

        let mut blobs: [Box<[u8]>; 6] = Default::default();
        for ((blob, sector), range) in blobs.iter_mut().zip(DictionarySector::ALL).zip(ranges) {
            debug!(
                "dictionary sector {sector}: {} bytes at 0x{:06x}",
                range.size, range.offset
            );
            *blob = read_sector(reader, sector, range)?;
        }

        let [languages, strings, words, files, keys, music] = blobs;

        let languages = parse_languages(&languages)?;
        let keys = parse_keys(&keys)?;
        let (music_root, music) = parse_music(&music)?;

        info!(
            "loaded dictionary for {game} {version}: {} languages, {} keys, {} music keys",
            languages.len(),
            keys.len(),
            music.len()
        );

        Ok(Self {
            game,
            version,
            languages,
            strings,
            words,
            files,
            keys,
            music_root,
            music,
        })
    }

    /// Returns the name of the game the dictionary was built for.
    #[must_use]
    pub fn game(&self) -> &str {
        &self.game
    }

    /// Returns the game version the dictionary was built for.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Returns the language names, indexed by the language index stored in keys.
    #[must_use]
    pub fn languages(&self) -> &[String] {
        &self.languages
    }

    /// Returns the number of content keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Returns `true` if the dictionary holds no content keys and no music keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty() && self.music.is_empty()
    }

    /// Returns the number of music keys.
    #[must_use]
    pub fn music_len(&self) -> usize {
        self.music.len()
    }

    /// Looks up the path of a key.
    ///
    /// Music entries take precedence and never carry a language. For content keys, the language
    /// name is included only if `want_language` is set. Returns `Ok(None)` if the key is unknown;
    /// errors mean the dictionary itself is malformed.
    pub fn get_key(
        &self,
        key: &str,
        want_language: bool,
    ) -> Result<Option<KeyMatch<'_>>, DictionaryError> {
        if let Some(name) = key.parse::<u32>().ok().and_then(|id| self.music.get(&id)) {
            let path = if self.music_root.is_empty() {
                name.to_string()
            } else {
                format!("{}{PATH_SEPARATOR}{name}", self.music_root)
            };

            return Ok(Some(KeyMatch {
                path,
                language: None,
            }));
        }

        let Some(&raw) = self.keys.get(key) else {
            return Ok(None);
        };

        let reference = KeyReference::from(raw);
        let path = self.resolve_file(reference.file_offset().value())?;

        let language = if want_language {
            let index = reference.language();
            self.languages
                .get(usize::from(index))
                .ok_or_else(|| {
                    DictionaryError::new(DictionaryErrorKind::LanguageIndex { index })
                })?
                .as_str()
                .pipe(Some)
        } else {
            None
        };

        Ok(Some(KeyMatch { path, language }))
    }

    fn resolve_file(&self, offset: u32) -> Result<String, DictionaryError> {
        let kind = DictionaryErrorKind::FileOffset { offset };
        let mut reader = blob_reader(&self.files, offset, kind)?;

        let num_words = reader.u8().map_err(DictionaryError::factory(kind))?;
        let mut path = String::new();

        for index in 0..num_words {
            let word_offset = reader.le_u24().map_err(DictionaryError::factory(kind))?;

            if index != 0 {
                path.push(PATH_SEPARATOR);
            }
            self.resolve_word(word_offset, &mut path)?;
        }

        Ok(path)
    }

    fn resolve_word(&self, offset: u32, out: &mut String) -> Result<(), DictionaryError> {
        let kind = DictionaryErrorKind::WordOffset { offset };
        let mut reader = blob_reader(&self.words, offset, kind)?;

        let num_strings = reader.u8().map_err(DictionaryError::factory(kind))?;

        for index in 0..num_strings {
            let string_offset = reader.le_u24().map_err(DictionaryError::factory(kind))?;

            if index != 0 {
                out.push(WORD_SEPARATOR);
            }
            self.resolve_string(string_offset, out)?;
        }

        Ok(())
    }

    fn resolve_string(&self, offset: u32, out: &mut String) -> Result<(), DictionaryError> {
        let kind = DictionaryErrorKind::StringOffset { offset };
        let mut reader = blob_reader(&self.strings, offset, kind)?;

        let len = reader.u8().map_err(DictionaryError::factory(kind))?;

        if len > NUMERIC_STRING_FLAG {
            let width = len - NUMERIC_STRING_FLAG;
            if width > 8 {
                return Err(DictionaryError::new(DictionaryErrorKind::StringWidth {
                    offset,
                    width,
                }));
            }

            let value = reader
                .take(usize::from(width))
                .map_err(DictionaryError::factory(kind))?
                .into_iter()
                .fold(0_u64, |acc, byte| (acc << 8) | u64::from(byte));

            out.push_str(&value.to_string());
        } else {
            let text = reader
                .take(usize::from(len))
                .map_err(DictionaryError::factory(kind))?;
            out.push_str(from_utf8(&text).map_err(DictionaryError::from_utf8)?);
        }

        Ok(())
    }
}

fn blob_reader(
    blob: &[u8],
    offset: u32,
    kind: DictionaryErrorKind,
) -> Result<Reader<Cursor<&[u8]>>, DictionaryError> {
    let mut reader = Reader::from_bytes(blob, Endian::Little);
    reader
        .seek(u64::from(offset))
        .map_err(DictionaryError::factory(kind))?;
    Ok(reader)
}

fn read_short_string<R: Read + Seek>(
    reader: &mut Reader<R>,
    kind: DictionaryErrorKind,
) -> Result<String, DictionaryError> {
    let len = reader.u8().map_err(DictionaryError::factory(kind))?;
    let data = reader
        .take(usize::from(len))
        .map_err(DictionaryError::factory(kind))?;

    from_utf8(&data)
        .map(ToOwned::to_owned)
        .map_err(DictionaryError::from_utf8)
}

fn read_sector<R: Read + Seek>(
    reader: &mut Reader<R>,
    sector: DictionarySector,
    range: SectorRange,
) -> Result<Box<[u8]>, DictionaryError> {
    if range.size == 0 {
        return Ok(Box::default());
    }

    let kind = DictionaryErrorKind::Sector { sector };
    reader
        .seek(u64::from(range.offset))
        .map_err(DictionaryError::factory(kind))?;

    reader
        .take(range.size as usize)
        .map(Vec::into_boxed_slice)
        .map_err(DictionaryError::factory(kind))
}

fn parse_languages(data: &[u8]) -> Result<Box<[String]>, DictionaryError> {
    if data.is_empty() {
        return Ok(Box::default());
    }

    let mut reader = Reader::from_bytes(data, Endian::Little);
    let count = reader
        .u8()
        .map_err(DictionaryError::factory(DictionaryErrorKind::LanguageTable))?;

    (0..count)
        .map(|_| read_short_string(&mut reader, DictionaryErrorKind::LanguageTable))
        .collect()
}

fn parse_keys(data: &[u8]) -> Result<HashMap<Box<str>, u32>, DictionaryError> {
    use DictionaryErrorKind as Kind;

    if data.is_empty() {
        return Ok(HashMap::new());
    }

    let mut reader = Reader::from_bytes(data, Endian::Little);

    let count = reader
        .le_u24()
        .map_err(DictionaryError::factory(Kind::KeyTable))?;
    let record_size = reader
        .u8()
        .map_err(DictionaryError::factory(Kind::KeyTable))?;

    if record_size <= KEY_REFERENCE_SIZE {
        return Err(DictionaryError::new(Kind::KeyRecordSize { size: record_size }));
    }
    let key_width = usize::from(record_size - KEY_REFERENCE_SIZE);

    // the declared count is untrusted; no more records fit than the sector holds
    let fitting = reader.remaining() / u64::from(record_size);
    let mut keys = HashMap::with_capacity(u64::from(count).min(fitting) as usize);

    for index in 0..count {
        let key = reader
            .take(key_width)
            .map_err(DictionaryError::factory(Kind::Key { index }))?;
        let reference = reader
            .u32()
            .map_err(DictionaryError::factory(Kind::Key { index }))?;

        // keys are NUL-padded to the record width
        let end = key.iter().position(|&b| b == 0).unwrap_or(key.len());
        let key = from_utf8(&key[..end]).map_err(DictionaryError::from_utf8)?;

        if keys.insert(Box::from(key), reference).is_some() {
            warn!("duplicate dictionary key {key} at index {index}, keeping the last one");
        }
    }

    Ok(keys)
}

fn parse_music(data: &[u8]) -> Result<(String, HashMap<u32, Box<str>>), DictionaryError> {
    use DictionaryErrorKind as Kind;

    if data.is_empty() {
        return Ok((String::new(), HashMap::new()));
    }

    let mut reader = Reader::from_bytes(data, Endian::Little);

    let root = read_short_string(&mut reader, Kind::MusicTable)?;
    let count = reader
        .u16()
        .map_err(DictionaryError::factory(Kind::MusicTable))?;

    let mut music = HashMap::with_capacity(usize::from(count));

    for _ in 0..count {
        let key = reader
            .u32()
            .map_err(DictionaryError::factory(Kind::MusicTable))?;
        let name = read_short_string(&mut reader, Kind::MusicTable)?;

        if music.insert(key, name.into_boxed_str()).is_some() {
            warn!("duplicate music key {key}, keeping the last one");
        }
    }

    Ok((root, music))
}
