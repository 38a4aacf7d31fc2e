use crate::{
    package::StreamDescriptor,
    read::{Endian, Reader},
};
use memmap2::Mmap;
use std::{
    collections::HashMap,
    error::Error,
    fmt::{Display, Formatter, Result as FmtResult},
    fs::File,
    io::{Cursor, Error as IoError},
    path::Path,
};
use tracing::debug;

/// Read-only memory maps of package files, keyed by name.
///
/// A name is mapped at most once until it is unloaded. Reads copy out of the mapping and never
/// modify it.
#[derive(Debug, Default)]
pub struct Allocator {
    maps: HashMap<String, Mmap>,
}

impl Allocator {
    /// Creates an allocator with no mapped files.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps the file at `path` under `name`.
    pub fn load(&mut self, name: &str, path: impl AsRef<Path>) -> Result<(), AllocError> {
        if self.maps.contains_key(name) {
            return Err(AllocError::new(name, AllocErrorKind::AlreadyMapped));
        }

        let path = path.as_ref();
        let file = File::open(path).map_err(AllocError::factory(name, AllocErrorKind::Open))?;

        // SAFETY: the map is read-only; packages must not be modified while they are loaded
        let map = unsafe { Mmap::map(&file) }
            .map_err(AllocError::factory(name, AllocErrorKind::Map))?;

        debug!("mapped {} ({} bytes) as {name}", path.display(), map.len());

        let previous = self.maps.insert(name.to_owned(), map);
        debug_assert!(previous.is_none());
        Ok(())
    }

    /// Maps the file at `path` under its file name, and returns that name.
    pub fn load_path(&mut self, path: impl AsRef<Path>) -> Result<String, AllocError> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .map_or_else(|| path.to_string_lossy(), |name| name.to_string_lossy())
            .into_owned();

        self.load(&name, path)?;
        Ok(name)
    }

    /// Returns `true` if `name` is currently mapped.
    #[must_use]
    pub fn is_loaded(&self, name: &str) -> bool {
        self.maps.contains_key(name)
    }

    /// Returns the number of mapped files.
    #[must_use]
    pub fn len(&self) -> usize {
        self.maps.len()
    }

    /// Returns `true` if no files are mapped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    /// Returns the whole mapping of `name` without copying.
    pub fn bytes(&self, name: &str) -> Result<&[u8], AllocError> {
        self.maps
            .get(name)
            .map(|map| &map[..])
            .ok_or_else(|| AllocError::new(name, AllocErrorKind::UnknownSource))
    }

    /// Returns a little-endian reader over the mapping of `name`.
    pub fn reader(&self, name: &str) -> Result<Reader<Cursor<&[u8]>>, AllocError> {
        Ok(Reader::from_bytes(self.bytes(name)?, Endian::Little))
    }

    /// Copies `size` bytes starting at `offset` out of the mapping of `name`.
    pub fn read_at(&self, name: &str, offset: u64, size: u64) -> Result<Vec<u8>, AllocError> {
        let data = self.bytes(name)?;
        let len = data.len() as u64;

        let range = offset
            .checked_add(size)
            .filter(|&end| end <= len)
            .and_then(|end| Some(usize::try_from(offset).ok()?..usize::try_from(end).ok()?))
            .ok_or_else(|| {
                AllocError::new(name, AllocErrorKind::OutOfRange { offset, size, len })
            })?;

        Ok(data[range].to_vec())
    }

    /// Copies the payload of a stream out of the mapping of its package.
    pub fn read_stream(&self, stream: &StreamDescriptor) -> Result<Vec<u8>, AllocError> {
        self.read_at(&stream.source, stream.offset, stream.size)
    }

    /// Unmaps `name`. Unloading a name that is not mapped does nothing.
    pub fn unload(&mut self, name: &str) {
        if self.maps.remove(name).is_some() {
            debug!("unmapped {name}");
        }
    }

    /// Unmaps every file.
    pub fn unload_all(&mut self) {
        debug!("unmapping {} files", self.maps.len());
        self.maps.clear();
    }
}

/// Error produced when loading or reading a mapped file.
#[derive(Debug)]
pub struct AllocError {
    name: String,
    kind: AllocErrorKind,
    source: Option<IoError>,
}

/// The reason an allocator operation failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum AllocErrorKind {
    /// The file could not be opened.
    Open,
    /// The file could not be memory-mapped.
    Map,
    /// The name is already mapped.
    AlreadyMapped,
    /// The name was never mapped, or was unloaded.
    UnknownSource,
    /// The requested range extends past the end of the mapping.
    OutOfRange {
        /// Start of the requested range.
        offset: u64,
        /// Length of the requested range.
        size: u64,
        /// Length of the mapping.
        len: u64,
    },
}

impl AllocError {
    fn new(name: &str, kind: AllocErrorKind) -> Self {
        Self {
            name: name.to_owned(),
            kind,
            source: None,
        }
    }

    fn factory(name: &str, kind: AllocErrorKind) -> impl FnOnce(IoError) -> Self + '_ {
        move |source| Self {
            name: name.to_owned(),
            kind,
            source: Some(source),
        }
    }

    /// Returns the name the operation was called with.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the reason the operation failed.
    #[must_use]
    pub fn kind(&self) -> AllocErrorKind {
        self.kind
    }
}

impl Display for AllocError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        use AllocErrorKind::*;

        match self.kind {
            Open => f.write_str("failed to open file"),
            Map => f.write_str("failed to map file into memory"),
            AlreadyMapped => f.write_str("name is already mapped"),
            UnknownSource => f.write_str("name is not mapped"),
            OutOfRange { offset, size, len } => f.write_str(&format!(
                "range of {size} bytes at 0x{offset:x} extends past end of mapping ({len} bytes)"
            )),
        }?;

        f.write_str(&format!(" - {}", self.name))
    }
}

impl Error for AllocError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self.source {
            Some(e) => Some(e),
            None => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::{AllocErrorKind::*, Allocator};
    use crate::package::{Package, PackageOptions};
    use std::fs;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, data: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn load_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "a.pck", b"0123456789");

        let mut allocator = Allocator::new();
        assert!(allocator.load("a", &path).is_ok());

        assert!(allocator.is_loaded("a"));
        assert_eq!(allocator.len(), 1);
        assert_eq!(allocator.read_at("a", 2, 3).unwrap(), b"234");
        assert_eq!(allocator.read_at("a", 10, 0).unwrap(), b"");
        assert_eq!(allocator.bytes("a").unwrap().len(), 10);
        assert_eq!(allocator.reader("a").unwrap().len(), 10);
    }

    #[test]
    fn usage_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "a.pck", b"0123456789");

        let mut allocator = Allocator::new();
        assert!(allocator.load("a", &path).is_ok());

        assert!(allocator
            .load("a", &path)
            .is_err_and(|e| e.kind() == AlreadyMapped && e.name() == "a"));
        assert!(allocator
            .load("b", dir.path().join("missing.pck"))
            .is_err_and(|e| e.kind() == Open));
        assert!(allocator.read_at("b", 0, 1).is_err_and(|e| e.kind() == UnknownSource));
        assert!(allocator.read_at("a", 8, 3).is_err_and(|e| e.kind()
            == OutOfRange {
                offset: 8,
                size: 3,
                len: 10
            }));
        assert!(allocator
            .read_at("a", u64::MAX, 2)
            .is_err_and(|e| matches!(e.kind(), OutOfRange { .. })));
    }

    #[test]
    fn unload_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let first = write(&dir, "first.pck", b"1");
        let second = write(&dir, "second.pck", b"2");

        let mut allocator = Allocator::new();
        assert_eq!(allocator.load_path(&first).unwrap(), "first.pck");
        assert_eq!(allocator.load_path(&second).unwrap(), "second.pck");

        allocator.unload("first.pck");
        allocator.unload("first.pck");
        assert!(!allocator.is_loaded("first.pck"));
        assert!(allocator.read_at("first.pck", 0, 1).is_err_and(|e| e.kind() == UnknownSource));

        // a name can be mapped again once unloaded
        assert!(allocator.load("first.pck", &first).is_ok());

        allocator.unload_all();
        assert!(allocator.is_empty());
    }

    #[test]
    fn read_streams_of_mapped_package() {
        // one streamed sound of 4 bytes right after the header, no languages
        let mut data = b"AKPK".to_vec();
        for value in [0x2C_u32, 1, 4, 0, 0x18, 0, 1, 200, 0, 4, 0x34, 0] {
            data.extend(value.to_le_bytes());
        }
        data.extend(b"wem!");

        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "Minimum.pck", &data);

        let mut allocator = Allocator::new();
        let name = allocator.load_path(&path).unwrap();

        let package = Package::parse(
            &mut allocator.reader(&name).unwrap(),
            &name,
            &PackageOptions::default(),
        )
        .unwrap();

        let stream = &package.streams()[0];
        assert_eq!(stream.name, "200.wem");
        assert_eq!(allocator.read_stream(stream).unwrap(), b"wem!");
    }
}
