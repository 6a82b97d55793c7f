//! The extraction loop and on-disk / ZIP layout.
//!
//! Output paths depend on the package category:
//!
//! | Category   | Directory tree                     | ZIP base path          |
//! |------------|------------------------------------|------------------------|
//! | Vita app   | `app/<TitleID>`                    | same                   |
//! | Vita DLC   | `cont/<TitleID>/<ContentName>`     | same                   |
//! | Vita patch | `patch/<TitleID>`                  | same                   |
//! | PSP        | `pspemu/ISO`                       | `pspemu/<TitleID>`     |
//! | others     | the output directory itself        | archive root           |
//!
//! Vita packages additionally re-emit `sce_sys/package/{head,tail,work}.bin`
//! after the last entry.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use log::debug;

use crate::error::{Error, Result};
use crate::reader::Reader;
use crate::sfo;
use crate::sink::{DirSink, PkgSink, ZipSink};
use crate::structs::{FileEntry, PackageType};

/// Copies everything read through it into a side buffer.
struct TeeReader<'a, R> {
    inner: &'a mut R,
    copy: &'a mut Vec<u8>,
}

impl<R: Read> Read for TeeReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.copy.extend_from_slice(&buf[..n]);
        Ok(n)
    }
}

impl<R: Read> Reader<R> {
    /// Drive the package to completion through `sink`.
    pub fn unpack_with(&mut self, sink: &mut dyn PkgSink) -> Result<()> {
        while let Some(entry) = self.next_entry()? {
            if entry.is_directory() {
                sink.create_dir(&entry.name)?;
            } else if entry.is_file() {
                if entry.name.ends_with("PARAM.SFO") && self.sfo_entries().is_empty() {
                    self.extract_sfo(sink, &entry)?;
                } else {
                    sink.create_file(&entry.name, self)?;
                }
            } else {
                return Err(Error::UnknownEntry(entry.file_type()));
            }
        }

        if matches!(
            self.package_type(),
            PackageType::VitaApp | PackageType::VitaDlc | PackageType::VitaPatch
        ) {
            sink.create_dir("sce_sys/package")?;
            sink.create_file("sce_sys/package/head.bin", &mut self.head())?;
            sink.create_file("sce_sys/package/tail.bin", &mut self.tail())?;
            sink.create_file(
                "sce_sys/package/work.bin",
                &mut self.rif().unwrap_or_default(),
            )?;
        }

        Ok(())
    }

    /// Write PARAM.SFO to the sink while teeing it into memory, then parse
    /// it so later path decisions (ZIP naming) can see the entries.
    fn extract_sfo(&mut self, sink: &mut dyn PkgSink, entry: &FileEntry) -> Result<()> {
        let mut captured = Vec::with_capacity(entry.size as usize);
        let mut tee = TeeReader {
            inner: self,
            copy: &mut captured,
        };
        sink.create_file(&entry.name, &mut tee)?;
        self.set_sfo_entries(sfo::parse(&captured)?);
        Ok(())
    }

    /// Extract into a directory tree under `out_dir`, with the category
    /// path prefix applied.
    pub fn unpack_to_dir(&mut self, out_dir: &Path) -> Result<()> {
        let title_id = self.title_id().to_string();
        let base = match self.package_type() {
            PackageType::VitaApp => out_dir.join("app").join(&title_id),
            PackageType::VitaDlc => out_dir
                .join("cont")
                .join(&title_id)
                .join(self.header().content_name()),
            PackageType::VitaPatch => out_dir.join("patch").join(&title_id),
            PackageType::Psp => out_dir.join("pspemu").join("ISO"),
            _ => out_dir.to_path_buf(),
        };

        fs::create_dir_all(&base)?;
        debug!("extracting to {}", base.display());

        let mut sink = DirSink::new(base);
        self.unpack_with(&mut sink)
    }

    /// Extract into a ZIP archive in `out_dir` and return its final path.
    ///
    /// When no SFO was available up front, the archive is written under a
    /// provisional name and renamed once the title discovered inside the
    /// stream is known.
    pub fn unpack_to_zip(&mut self, out_dir: &Path) -> Result<PathBuf> {
        let title = self.title().to_string();
        let title_id = self.title_id().to_string();
        let region = self.region();

        let (base, file_name) = match self.package_type() {
            PackageType::VitaApp => (
                format!("app/{title_id}"),
                format!("{title} [{title_id}] [{region}].zip"),
            ),
            PackageType::VitaDlc => {
                let content_name = self.header().content_name().to_string();
                (
                    format!("cont/{title_id}/{content_name}"),
                    format!("{title} [{title_id}] [{region}] [{content_name}].zip"),
                )
            }
            PackageType::VitaPatch => {
                let app_ver = self
                    .sfo_entries()
                    .get("APP_VER")
                    .map(String::as_str)
                    .unwrap_or("")
                    .trim_start_matches('0')
                    .to_string();
                (
                    format!("patch/{title_id}"),
                    format!("{title} [{title_id}] [{region}] [PATCH] [v{app_ver}].zip"),
                )
            }
            PackageType::Psp => (
                format!("pspemu/{title_id}"),
                if title.is_empty() {
                    format!("{title_id}.zip")
                } else {
                    format!("{title} [{title_id}] [{region}].zip")
                },
            ),
            _ => (
                String::new(),
                if title.is_empty() {
                    format!("{title_id}.zip")
                } else {
                    format!("{title} [{title_id}] [{region}].zip")
                },
            ),
        };

        fs::create_dir_all(out_dir)?;
        let path = out_dir.join(&file_name);
        let file = File::create(&path)?;
        let mut sink = ZipSink::new(file, &base);

        match self.unpack_with(&mut sink) {
            Ok(()) => {
                sink.finish()?;
            }
            Err(err) => {
                // Close the archive so the partial file is well-formed,
                // but the extraction error is the one that matters.
                let _ = sink.finish();
                return Err(err);
            }
        }

        // The SFO may only have been discovered inside the stream.
        if title.is_empty() {
            let discovered = self.title();
            if !discovered.is_empty() {
                let renamed = out_dir.join(format!("{discovered} [{title_id}] [{region}].zip"));
                fs::rename(&path, &renamed)?;
                debug!("renamed archive to {}", renamed.display());
                return Ok(renamed);
            }
        }

        Ok(path)
    }
}
