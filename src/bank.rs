use crate::read::{Endian, ReadError, Reader};
use std::{
    error::Error,
    fmt::{Display, Formatter, Result as FmtResult},
};
use tracing::{debug, warn};

const BKHD_MAGIC: [u8; 4] = *b"BKHD";
const DIDX_MAGIC: [u8; 4] = *b"DIDX";
const DATA_MAGIC: [u8; 4] = *b"DATA";
const DIDX_ENTRY_SIZE: u32 = 12;

/// One audio stream indexed by a sound bank.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BankEntry {
    /// ID of the stream.
    pub id: u32,
    /// Position of the stream, in bytes from the start of the bank.
    pub offset: u64,
    /// Length of the stream, in bytes.
    pub size: u32,
}

/// Reads the data index of a sound bank.
///
/// Chunk fields are read in `endian`, the byte order of the package holding the bank.
/// Returned offsets are relative to the start of `data`. Banks without an index
/// (metadata-only banks) produce an empty list. Malformed banks also produce an empty list,
/// with a warning naming the bank.
#[must_use]
pub fn parse_bank_index(data: &[u8], name: &str, endian: Endian) -> Vec<BankEntry> {
    match try_parse_bank_index(data, endian) {
        Ok(entries) => {
            debug!("bank {name} indexes {} streams", entries.len());
            entries
        }
        Err(e) => {
            warn!("skipping bank {name}: {e}");
            Vec::new()
        }
    }
}

fn try_parse_bank_index(data: &[u8], endian: Endian) -> Result<Vec<BankEntry>, BankError> {
    let mut reader = Reader::from_bytes(data, endian);

    match reader.take_const() {
        Ok(magic) if magic == BKHD_MAGIC => Ok(()),
        Err(e) => Err(BankError::new_with_source(BankErrorKind::HeaderMagic, e)),
        _ => Err(BankError::new(BankErrorKind::HeaderMagic)),
    }?;

    let header_size = reader
        .u32()
        .map_err(BankError::factory(BankErrorKind::HeaderSize))?;

    reader
        .skip(u64::from(header_size))
        .map_err(BankError::factory(BankErrorKind::HeaderSize))?;

    if reader.is_at_end() {
        return Ok(Vec::new());
    }

    match reader.take_const() {
        Ok(magic) if magic == DIDX_MAGIC => Ok(()),
        Err(e) => Err(BankError::new_with_source(BankErrorKind::IndexMagic, e)),
        _ => Err(BankError::new(BankErrorKind::IndexMagic)),
    }?;

    let index_size = reader
        .u32()
        .map_err(BankError::factory(BankErrorKind::IndexSize))?;

    let num_entries = index_size / DIDX_ENTRY_SIZE;
    let mut entries = Vec::with_capacity(num_entries.min(4096) as usize);

    for index in 0..num_entries {
        let id = reader
            .u32()
            .map_err(BankError::factory(BankErrorKind::Entry { index }))?;
        let offset = reader
            .u32()
            .map_err(BankError::factory(BankErrorKind::Entry { index }))?;
        let size = reader
            .u32()
            .map_err(BankError::factory(BankErrorKind::Entry { index }))?;

        entries.push(BankEntry {
            id,
            offset: u64::from(offset),
            size,
        });
    }

    match reader.take_const() {
        Ok(magic) if magic == DATA_MAGIC => Ok(()),
        Err(e) => Err(BankError::new_with_source(BankErrorKind::DataMagic, e)),
        _ => Err(BankError::new(BankErrorKind::DataMagic)),
    }?;

    // the declared data size is not needed: entries carry their own sizes
    let _data_size = reader
        .u32()
        .map_err(BankError::factory(BankErrorKind::DataSize))?;

    let data_start = reader.position();
    for entry in &mut entries {
        entry.offset += data_start;
    }

    Ok(entries)
}

#[derive(Debug)]
struct BankError {
    kind: BankErrorKind,
    source: Option<ReadError>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BankErrorKind {
    HeaderMagic,
    HeaderSize,
    IndexMagic,
    IndexSize,
    Entry { index: u32 },
    DataMagic,
    DataSize,
}

impl BankError {
    fn new(kind: BankErrorKind) -> Self {
        Self { kind, source: None }
    }

    fn new_with_source(kind: BankErrorKind, source: ReadError) -> Self {
        Self {
            kind,
            source: Some(source),
        }
    }

    fn factory(kind: BankErrorKind) -> impl FnOnce(ReadError) -> Self {
        move |source| Self::new_with_source(kind, source)
    }

    #[cfg(test)]
    fn kind(&self) -> BankErrorKind {
        self.kind
    }
}

impl Display for BankError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        use BankErrorKind::*;

        match self.kind {
            HeaderMagic => f.write_str("no bank header signature (BKHD) found"),
            HeaderSize => f.write_str("failed to read bank header"),
            IndexMagic => f.write_str("no data index signature (DIDX) found"),
            IndexSize => f.write_str("failed to read size of data index"),
            Entry { index } => {
                f.write_str(&format!("failed to read data index entry at index {index}"))
            }
            DataMagic => f.write_str("no data signature (DATA) found after data index"),
            DataSize => f.write_str("failed to read size of data section"),
        }
    }
}

impl Error for BankError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self.source {
            Some(e) => Some(e),
            None => None,
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::{parse_bank_index, try_parse_bank_index, BankEntry, BankErrorKind::*};
    use crate::read::Endian;

    /// Builds a bank with a header holding only `version`, an index of `entries` and `payload`
    /// as its data.
    pub(crate) fn build_bank_in(
        endian: Endian,
        version: u32,
        entries: &[(u32, u32, u32)],
        payload: &[u8],
    ) -> Vec<u8> {
        let word = |value: u32| match endian {
            Endian::Little => value.to_le_bytes(),
            Endian::Big => value.to_be_bytes(),
        };

        let mut buf = Vec::new();
        buf.extend_from_slice(b"BKHD");
        buf.extend_from_slice(&word(4));
        buf.extend_from_slice(&word(version));
        buf.extend_from_slice(b"DIDX");
        buf.extend_from_slice(&word(entries.len() as u32 * 12));
        for &(id, offset, size) in entries {
            buf.extend_from_slice(&word(id));
            buf.extend_from_slice(&word(offset));
            buf.extend_from_slice(&word(size));
        }
        buf.extend_from_slice(b"DATA");
        buf.extend_from_slice(&word(payload.len() as u32));
        buf.extend_from_slice(payload);
        buf
    }

    /// Little-endian shorthand for [`build_bank_in`].
    pub(crate) fn build_bank(version: u32, entries: &[(u32, u32, u32)], payload: &[u8]) -> Vec<u8> {
        build_bank_in(Endian::Little, version, entries, payload)
    }

    #[test]
    fn read_index() {
        let bank = build_bank(134, &[(7, 0, 4), (9, 4, 2), (11, 6, 0)], b"abcdef");
        let entries = parse_bank_index(&bank, "test", Endian::Little);

        // 12 (BKHD) + 8 (DIDX header) + 36 (entries) + 8 (DATA header)
        let data_start = 64;
        assert_eq!(
            entries,
            vec![
                BankEntry { id: 7, offset: data_start, size: 4 },
                BankEntry { id: 9, offset: data_start + 4, size: 2 },
                BankEntry { id: 11, offset: data_start + 6, size: 0 },
            ]
        );
        assert_eq!(&bank[entries[1].offset as usize..][..2], b"ef");
    }

    #[test]
    fn read_big_endian_index() {
        let bank = build_bank_in(Endian::Big, 48, &[(0x0102_0304, 2, 3)], b"xyzabc");
        let entries = parse_bank_index(&bank, "console", Endian::Big);

        assert_eq!(
            entries,
            vec![BankEntry { id: 0x0102_0304, offset: 40 + 2, size: 3 }]
        );
        assert_eq!(&bank[entries[0].offset as usize..][..3], b"zab");

        // the same bytes read in the wrong order declare an absurd header size
        assert!(parse_bank_index(&bank, "console", Endian::Little).is_empty());
    }

    #[test]
    fn metadata_only_bank() {
        let bank = b"BKHD\x04\x00\x00\x00\x8C\x00\x00\x00";
        assert!(try_parse_bank_index(bank, Endian::Little).unwrap().is_empty());
    }

    #[test]
    fn read_signatures() {
        assert!(try_parse_bank_index(b"", Endian::Little).is_err_and(|e| e.kind() == HeaderMagic));
        assert!(try_parse_bank_index(b"RIFF\x00\x00\x00\x00", Endian::Little).is_err_and(|e| e.kind() == HeaderMagic));
        assert!(try_parse_bank_index(b"BKHD\x08\x00\x00\x00", Endian::Little).is_err_and(|e| e.kind() == HeaderSize));

        let hirc_first = b"BKHD\x00\x00\x00\x00HIRC\x00\x00\x00\x00";
        assert!(try_parse_bank_index(hirc_first, Endian::Little).is_err_and(|e| e.kind() == IndexMagic));
        assert!(parse_bank_index(hirc_first, "hirc", Endian::Little).is_empty());

        let no_data = b"BKHD\x00\x00\x00\x00DIDX\x00\x00\x00\x00";
        assert!(try_parse_bank_index(no_data, Endian::Little).is_err_and(|e| e.kind() == DataMagic));

        let truncated = b"BKHD\x00\x00\x00\x00DIDX\x0C\x00\x00\x00\x01\x00\x00\x00";
        assert!(try_parse_bank_index(truncated, Endian::Little).is_err_and(|e| e.kind() == Entry { index: 0 }));
    }
}
