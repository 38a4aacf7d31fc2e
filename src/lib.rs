//! # wwisex
//!
//! `wwisex` is a library for extracting audio from Wwise sound packages (`.pck`).
//!
//! It resolves every audio stream of a package (including the streams embedded in sound banks),
//! reads format and duration information from RIFF audio headers, maps stream IDs to readable
//! paths with a name dictionary, and decrypts protected payloads. Transcoding is left to external
//! tools.

#![warn(clippy::pedantic, future_incompatible)]
#![deny(
    let_underscore_drop,
    macro_use_extern_crate,
    meta_variable_misuse,
    missing_abi,
    missing_debug_implementations,
    missing_docs,
    non_ascii_idents,
    nonstandard_style,
    noop_method_call,
    rust_2018_idioms,
    trivial_casts,
    trivial_numeric_casts,
    unreachable_pub,
    unsafe_op_in_unsafe_fn,
    unused,
    unused_crate_dependencies,
    unused_import_braces,
    unused_lifetimes,
    unused_macro_rules,
    unused_qualifications,
    unused_results
)]

mod allocator;
mod bank;
mod cipher;
mod dictionary;
mod package;
mod read;
mod riff;

pub use allocator::{AllocError, AllocErrorKind, Allocator};
pub use bank::{parse_bank_index, BankEntry};
pub use cipher::{decrypt, key, StreamCipher};
pub use dictionary::{
    error::{DictionaryError, DictionaryErrorKind},
    Dictionary, DictionarySector, KeyMatch,
};
pub use package::{
    error::{PackageError, PackageErrorKind, SectorError, SectorErrorKind},
    Language, Package, PackageHeader, PackageOptions, SectorKind, StreamDescriptor,
};
pub use read::{Endian, Needed, ReadError, ReadErrorKind, Reader};
pub use riff::{AudioMetadata, Codec, Layout, VorbisOffsets};
