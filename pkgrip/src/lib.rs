//! PlayStation PKG decryption and extraction.
//!
//! This crate unpacks PKG archives for PSP, PSOne, PSVita (application,
//! DLC, patch) and PSM content from a forward-only byte stream: it parses
//! the layered headers, derives the per-section AES-CTR keys, decrypts the
//! interleaved index and file bodies in a single pass, verifies the
//! whole-file SHA-1, and routes decrypted entries to a sink (directory
//! tree or ZIP archive). The zRIF license codec the extractor consumes is
//! included.
//!
//! ```ignore
//! let mut pkg = pkgrip::Reader::open("content.pkg", Some(zrif))?;
//! pkg.unpack_to_dir(std::path::Path::new("out"))?;
//! assert!(pkg.is_valid());
//! ```

pub mod crypto;
pub mod error;
pub mod license;
pub mod reader;
pub mod sfo;
pub mod sink;
pub mod structs;

mod unpack;

// Re-export main types for convenience
pub use error::{Error, Result};
pub use reader::Reader;
pub use sink::{DirSink, PkgSink, ZipSink};
pub use structs::{ContentType, FileEntry, FileHeader, PackageType};
