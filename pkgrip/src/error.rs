//! Error types for PKG operations.

use std::io;
use thiserror::Error;

/// Result alias used throughout pkgrip.
pub type Result<T> = std::result::Result<T, Error>;

/// All errors the library can produce.
///
/// A SHA-1 mismatch over the whole archive is deliberately *not* an error:
/// extraction runs to completion and [`crate::Reader::is_valid`] reports the
/// outcome, since integrity failure does not invalidate what was already
/// written.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid PKG magic (expected 0x7F504B47)")]
    InvalidMagic,

    #[error("invalid PKG extended-header magic (expected 0x7F657874)")]
    InvalidExtendedMagic,

    #[error("unsupported PKG layout: {0}")]
    UnsupportedLayout(&'static str),

    #[error("unexpected end of input")]
    Truncated,

    #[error("cipher setup failed (invalid key length)")]
    CryptoInit,

    #[error("unknown key type {0}")]
    UnknownKeyType(u8),

    #[error("unsupported content type {0:#x}")]
    UnsupportedContentType(u32),

    #[error("invalid zRIF license: {0}")]
    BadLicense(&'static str),

    #[error("zRIF content ID '{rif}' does not match pkg '{pkg}'")]
    LicenseMismatch { rif: String, pkg: String },

    #[error("unknown entry type {0:#x} in package")]
    UnknownEntry(u8),

    #[error("entry name is not valid UTF-8")]
    BadEntryName,
}

impl Error {
    /// Copy of this error for latching: the first failure is stored and
    /// replayed on every later call. `io::Error` is not `Clone`, so it is
    /// rebuilt from its kind and message.
    pub(crate) fn duplicate(&self) -> Error {
        match self {
            Error::Io(e) => Error::Io(io::Error::new(e.kind(), e.to_string())),
            Error::InvalidMagic => Error::InvalidMagic,
            Error::InvalidExtendedMagic => Error::InvalidExtendedMagic,
            Error::UnsupportedLayout(what) => Error::UnsupportedLayout(what),
            Error::Truncated => Error::Truncated,
            Error::CryptoInit => Error::CryptoInit,
            Error::UnknownKeyType(t) => Error::UnknownKeyType(*t),
            Error::UnsupportedContentType(t) => Error::UnsupportedContentType(*t),
            Error::BadLicense(what) => Error::BadLicense(what),
            Error::LicenseMismatch { rif, pkg } => Error::LicenseMismatch {
                rif: rif.clone(),
                pkg: pkg.clone(),
            },
            Error::UnknownEntry(t) => Error::UnknownEntry(*t),
            Error::BadEntryName => Error::BadEntryName,
        }
    }
}
