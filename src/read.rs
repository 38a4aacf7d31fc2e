use std::{
    error::Error,
    fmt::{Display, Formatter, Result as FmtResult},
    io::{Cursor, Error as IoError, ErrorKind, Read, Seek, SeekFrom},
    num::NonZeroUsize,
};

/// Byte order used when decoding multi-byte integers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Endian {
    /// Least significant byte first.
    Little,
    /// Most significant byte first.
    Big,
}

/// Sequential reader over a seekable byte source.
///
/// Every read advances the position by exactly the number of bytes requested.
/// Reads that would run past the end of the source fail without consuming anything.
#[derive(Debug)]
pub struct Reader<R: Read + Seek> {
    inner: R,
    position: u64,
    len: u64,
    endian: Endian,
}

macro_rules! int_readers {
    ($($ty:ident, $with:ident;)+) => {
        $(
            #[doc = concat!("Reads a `", stringify!($ty), "` in the reader's byte order.")]
            pub fn $ty(&mut self) -> ReadResult<$ty> {
                self.$with(self.endian)
            }

            #[doc = concat!("Reads a `", stringify!($ty), "` in the given byte order.")]
            pub fn $with(&mut self, endian: Endian) -> ReadResult<$ty> {
                let buf = self.take_const()?;
                Ok(match endian {
                    Endian::Little => $ty::from_le_bytes(buf),
                    Endian::Big => $ty::from_be_bytes(buf),
                })
            }
        )+
    };
}

impl<'data> Reader<Cursor<&'data [u8]>> {
    /// Creates a reader over an in-memory buffer.
    #[must_use]
    pub fn from_bytes(data: &'data [u8], endian: Endian) -> Self {
        Self {
            inner: Cursor::new(data),
            position: 0,
            len: data.len() as u64,
            endian,
        }
    }
}

impl<R: Read + Seek> Reader<R> {
    /// Creates a reader over `source`, starting at its current position.
    ///
    /// The total length of the source is measured once, up front.
    pub fn new(mut source: R, endian: Endian) -> ReadResult<Self> {
        let position = source
            .stream_position()
            .map_err(|e| ReadError::from_io(0, e))?;

        let len = source
            .seek(SeekFrom::End(0))
            .map_err(|e| ReadError::from_io(position, e))?;

        let _ = source
            .seek(SeekFrom::Start(position))
            .map_err(|e| ReadError::from_io(position, e))?;

        Ok(Self {
            inner: source,
            position,
            len,
            endian,
        })
    }

    fn check_available(&self, needed: usize) -> ReadResult<()> {
        let remaining = self.remaining();

        if needed as u64 <= remaining {
            Ok(())
        } else {
            // remaining < needed, so it fits in a usize and the difference is non-zero
            let missing = needed - remaining as usize;
            Err(self.to_error(ReadErrorKind::Incomplete(Needed::Size(
                NonZeroUsize::new(missing).expect("missing is guaranteed to be non-zero"),
            ))))
        }
    }

    fn read_to_slice(&mut self, buf: &mut [u8]) -> ReadResult<()> {
        self.check_available(buf.len())?;

        match self.inner.read_exact(buf) {
            Ok(()) => {
                self.position += buf.len() as u64;
                Ok(())
            }
            Err(e) => match e.kind() {
                ErrorKind::UnexpectedEof => {
                    Err(self.to_error(ReadErrorKind::Incomplete(Needed::Unknown)))
                }
                _ => Err(self.to_error_with_source(ReadErrorKind::Failure, e)),
            },
        }
    }

    /// Returns the current position, in bytes from the start of the source.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Returns the total length of the source, in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns `true` if the source holds no bytes at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the number of bytes between the current position and the end of the source.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.len.saturating_sub(self.position)
    }

    /// Returns `true` if no bytes are left to read.
    #[must_use]
    pub fn is_at_end(&self) -> bool {
        self.remaining() == 0
    }

    /// Returns the default byte order of the reader.
    #[must_use]
    pub fn endian(&self) -> Endian {
        self.endian
    }

    /// Changes the default byte order of the reader.
    pub fn set_endian(&mut self, endian: Endian) {
        self.endian = endian;
    }

    /// Moves to an absolute position. Seeking past the end is an error.
    pub fn seek(&mut self, position: u64) -> ReadResult<()> {
        if position > self.len {
            let missing = usize::try_from(position - self.len).unwrap_or(usize::MAX);
            return Err(self.to_error(ReadErrorKind::Incomplete(Needed::Size(
                NonZeroUsize::new(missing).expect("position is guaranteed to be past the end"),
            ))));
        }

        match self.inner.seek(SeekFrom::Start(position)) {
            Ok(_) => {
                self.position = position;
                Ok(())
            }
            Err(e) => Err(self.to_error_with_source(ReadErrorKind::Failure, e)),
        }
    }

    /// Reads a fixed number of bytes into an array.
    pub fn take_const<const LEN: usize>(&mut self) -> ReadResult<[u8; LEN]> {
        let mut buf = [0; LEN];
        self.read_to_slice(&mut buf)?;
        Ok(buf)
    }

    /// Reads `len` bytes.
    pub fn take(&mut self, len: usize) -> ReadResult<Vec<u8>> {
        self.check_available(len)?;
        let mut buf = vec![0; len];
        self.read_to_slice(&mut buf)?;
        Ok(buf)
    }

    /// Skips `amount` bytes.
    pub fn skip(&mut self, amount: u64) -> ReadResult<()> {
        self.seek(self.position.saturating_add(amount))
    }

    /// Reads a `u8`.
    pub fn u8(&mut self) -> ReadResult<u8> {
        let [byte] = self.take_const()?;
        Ok(byte)
    }

    /// Reads an `i8`.
    pub fn i8(&mut self) -> ReadResult<i8> {
        let [byte] = self.take_const()?;
        Ok(i8::from_ne_bytes([byte]))
    }

    int_readers! {
        u16, u16_with;
        i16, i16_with;
        u32, u32_with;
        i32, i32_with;
        u64, u64_with;
        i64, i64_with;
    }

    /// Reads a little-endian 24-bit unsigned integer.
    pub fn le_u24(&mut self) -> ReadResult<u32> {
        let [a, b, c] = self.take_const()?;
        Ok(u32::from_le_bytes([a, b, c, 0]))
    }
}

pub(crate) type ReadResult<T> = Result<T, ReadError>;

/// Error produced when reading from a [`Reader`] fails.
#[derive(Debug)]
pub struct ReadError {
    position: u64,
    kind: ReadErrorKind,
    source: Option<IoError>,
}

/// The reason a read failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadErrorKind {
    /// The underlying source returned an I/O error.
    Failure,
    /// Not enough bytes were left in the source.
    Incomplete(Needed),
}

/// The number of bytes that were missing from an incomplete read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Needed {
    /// This many more bytes would have been needed.
    Size(NonZeroUsize),
    /// The source ended early by an unknown amount.
    Unknown,
}

impl<R: Read + Seek> Reader<R> {
    fn to_error(&self, kind: ReadErrorKind) -> ReadError {
        ReadError {
            position: self.position,
            kind,
            source: None,
        }
    }

    fn to_error_with_source(&self, kind: ReadErrorKind, source: IoError) -> ReadError {
        ReadError {
            position: self.position,
            kind,
            source: Some(source),
        }
    }
}

impl ReadError {
    fn from_io(position: u64, source: IoError) -> Self {
        Self {
            position,
            kind: ReadErrorKind::Failure,
            source: Some(source),
        }
    }

    /// Returns the reason the read failed.
    #[must_use]
    pub fn kind(&self) -> ReadErrorKind {
        self.kind
    }

    /// Returns the reader position at the time of the failure.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.position
    }
}

impl Display for ReadError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match &self.kind {
            ReadErrorKind::Failure => f.write_str("failed to read data due to I/O error"),
            ReadErrorKind::Incomplete(needed) => match needed {
                Needed::Size(size) => {
                    f.write_str(&format!("incomplete data: needed {size} more bytes to read"))
                }
                Needed::Unknown => f.write_str("incomplete data"),
            },
        }?;

        f.write_str(&format!(" - byte position {}", self.position))
    }
}

impl Error for ReadError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self.source {
            Some(e) => Some(e),
            None => None,
        }
    }
}
