//! Output sinks for extracted packages.
//!
//! The extraction loop only ever talks to [`PkgSink`]; the two shipped
//! implementations write a directory tree and a ZIP archive. Bodies are
//! already-decrypted but otherwise random-looking data, so the ZIP sink
//! stores them uncompressed.

use std::fs::{self, File};
use std::io::{self, Read, Seek, Write};
use std::path::PathBuf;

use zip::result::ZipError;
use zip::write::FileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

use crate::error::{Error, Result};

/// Where decrypted entries go. `create_file` consumes `body` to completion.
///
/// Implementations are not required to be thread-safe; the extraction loop
/// is single-threaded and owns the sink for its duration.
pub trait PkgSink {
    fn create_dir(&mut self, path: &str) -> Result<()>;
    fn create_file(&mut self, path: &str, body: &mut dyn Read) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Directory tree
// ---------------------------------------------------------------------------

/// Writes entries under a base directory, creating files anew (truncating).
pub struct DirSink {
    base: PathBuf,
}

impl DirSink {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        DirSink { base: base.into() }
    }
}

impl PkgSink for DirSink {
    fn create_dir(&mut self, path: &str) -> Result<()> {
        fs::create_dir_all(self.base.join(path))?;
        Ok(())
    }

    fn create_file(&mut self, path: &str, body: &mut dyn Read) -> Result<()> {
        let mut file = File::create(self.base.join(path))?;
        io::copy(body, &mut file)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ZIP archive
// ---------------------------------------------------------------------------

/// Writes entries into a ZIP archive under a base path.
///
/// Directory entries end in `/`; file entries use the store method.
/// Timestamps default to the DOS epoch so output is reproducible;
/// [`Self::set_last_modified`] overrides that.
pub struct ZipSink<W: Write + Seek> {
    zip: ZipWriter<W>,
    base: String,
    modified: DateTime,
}

impl<W: Write + Seek> ZipSink<W> {
    pub fn new(inner: W, base: &str) -> Self {
        ZipSink {
            zip: ZipWriter::new(inner),
            base: base.trim_matches('/').to_string(),
            modified: DateTime::default(),
        }
    }

    /// Override the modification time stamped on every entry.
    pub fn set_last_modified(&mut self, modified: DateTime) {
        self.modified = modified;
    }

    /// Write the central directory and return the underlying writer.
    pub fn finish(mut self) -> Result<W> {
        self.zip.finish().map_err(zip_err)
    }

    fn join(&self, path: &str) -> String {
        if self.base.is_empty() {
            path.to_string()
        } else {
            format!("{}/{}", self.base, path)
        }
    }

    fn options(&self) -> FileOptions {
        FileOptions::default()
            .compression_method(CompressionMethod::Stored)
            .last_modified_time(self.modified)
            .unix_permissions(0o755)
    }
}

impl<W: Write + Seek> PkgSink for ZipSink<W> {
    fn create_dir(&mut self, path: &str) -> Result<()> {
        self.zip
            .add_directory(self.join(path), self.options())
            .map_err(zip_err)?;
        Ok(())
    }

    fn create_file(&mut self, path: &str, body: &mut dyn Read) -> Result<()> {
        self.zip
            .start_file(self.join(path), self.options())
            .map_err(zip_err)?;
        io::copy(body, &mut self.zip)?;
        Ok(())
    }
}

fn zip_err(err: ZipError) -> Error {
    match err {
        ZipError::Io(e) => Error::Io(e),
        other => Error::Io(io::Error::other(other)),
    }
}
