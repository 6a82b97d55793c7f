//! Streaming PKG reader.
//!
//! Consumes an entire package from a forward-only byte stream in a single
//! pass: headers and metadata in plaintext, then the encrypted item index,
//! the filename table, every file body in entry order, and finally the tail
//! carrying the whole-file SHA-1.
//!
//! All reads funnel through one `fill` path that feeds the running SHA-1
//! and the head/tail capture buffers, so the hash can never miss a byte of
//! `[0, total_size − 0x20)` and the tail handoff is a state transition
//! rather than a reader swap. The first error latches into the reader and
//! is replayed by every later call without touching the input.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use aes::cipher::StreamCipher;
use log::debug;
use sha1::{Digest, Sha1};

use crate::crypto::{self, Aes128Ctr};
use crate::error::{Error, Result};
use crate::license;
use crate::sfo;
use crate::structs::{
    ContentType, ExtendedHeader, FileEntry, FileHeader, ItemRecord, Metadata, PackageType,
    ENTRY_KEY_PSP, EXT_HEADER_SIZE, FILE_HEADER_SIZE, INFO_CONTENT_TYPE, INFO_DRM_TYPE,
    INFO_FILE_INDEX, INFO_PACKAGE_FLAGS, INFO_SFO, ITEM_RECORD_SIZE, PKG_MAGIC, PS3_AES_KEY,
    PSP_AES_KEY, VITA_AES_KEY_2, VITA_AES_KEY_3, VITA_AES_KEY_4,
};

const SKIP_BUF_SIZE: usize = 8192;

/// Upper bound on the head and tail capture buffers. A package declaring
/// more than this before or after the data region is malformed.
const MAX_CAPTURE_SIZE: u64 = 0x400_0000;

/// What the single `fill` path does with the bytes it pulls, besides
/// hashing them.
enum Capture {
    None,
    Head,
    Tail,
}

/// Pipeline position: bodies are handed out in entry order, then the tail
/// is drained and the digest read, after which the reader only reports
/// end-of-stream.
enum Stage {
    Bodies,
    Finalized,
}

/// Bounded view over the current entry's body: a fresh CTR stream at the
/// entry's block offset, applied to at most `remaining` raw bytes.
struct BodyState {
    cipher: Aes128Ctr,
    remaining: u64,
}

/// Streaming PKG reader over any forward-only byte source.
///
/// ```ignore
/// let file = std::fs::File::open("game.pkg")?;
/// let mut pkg = Reader::new(std::io::BufReader::new(file), None)?;
/// while let Some(entry) = pkg.next_entry()? {
///     println!("{entry}");
///     // `pkg` implements `Read` over the current entry's body.
/// }
/// assert!(pkg.is_valid());
/// ```
pub struct Reader<R: Read> {
    inner: R,
    pos: u64,
    hasher: Sha1,
    hashing: bool,
    capture: Capture,
    head_buf: Vec<u8>,
    tail_buf: Vec<u8>,

    header: FileHeader,
    ext: ExtendedHeader,
    meta: Metadata,
    pkg_type: PackageType,
    sfo_entries: BTreeMap<String, String>,
    rif: Option<Vec<u8>>,

    primary_key: [u8; 16],

    entries: Vec<FileEntry>,
    idx: usize,
    current: Option<BodyState>,
    pad: u64,
    stage: Stage,
    latched: Option<Error>,

    file_hash: Option<[u8; 20]>,
    calculated_hash: Option<[u8; 20]>,
}

impl Reader<BufReader<File>> {
    /// Open a PKG file from disk, optionally with a zRIF license string.
    pub fn open<P: AsRef<Path>>(path: P, zrif: Option<&str>) -> Result<Self> {
        let file = File::open(path)?;
        Reader::new(BufReader::new(file), zrif)
    }
}

impl<R: Read> Reader<R> {
    /// Wrap a forward-only byte stream and parse everything up to and
    /// including the encrypted file index. After this returns, entries are
    /// consumed with [`Self::next_entry`] and [`Read`].
    pub fn new(inner: R, zrif: Option<&str>) -> Result<Self> {
        let mut reader = Reader {
            inner,
            pos: 0,
            hasher: Sha1::new(),
            hashing: true,
            capture: Capture::Head,
            head_buf: Vec::new(),
            tail_buf: Vec::new(),
            header: FileHeader {
                magic: PKG_MAGIC,
                revision: 0,
                platform: 0,
                info_offset: 0,
                info_count: 0,
                header_size: 0,
                item_count: 0,
                total_size: 0,
                data_offset: 0,
                data_size: 0,
                content_id: [0; 36],
                digest: [0; 16],
                data_iv: [0; 16],
                header_cmac: [0; 16],
                npdrm_signature: [0; 40],
                header_sha1: [0; 8],
            },
            ext: ExtendedHeader {
                magic: [0; 4],
                unknown1: 0,
                header_size: 0,
                data_size: 0,
                data_offset: 0,
                data_type: 0,
                pkg_data_size: 0,
                data_type2: 0,
                unknown2: 0,
            },
            meta: Metadata::default(),
            pkg_type: PackageType::Psp,
            sfo_entries: BTreeMap::new(),
            rif: None,
            primary_key: [0; 16],
            entries: Vec::new(),
            idx: 0,
            current: None,
            pad: 0,
            stage: Stage::Bodies,
            latched: None,
            file_hash: None,
            calculated_hash: None,
        };
        reader.init(zrif)?;
        Ok(reader)
    }

    fn init(&mut self, zrif: Option<&str>) -> Result<()> {
        let mut buf = [0u8; FILE_HEADER_SIZE];
        self.read_exact_into(&mut buf)?;
        self.header = FileHeader::parse(&buf)?;

        let mut buf = [0u8; EXT_HEADER_SIZE];
        self.read_exact_into(&mut buf)?;
        self.ext = ExtendedHeader::parse(&buf)?;

        if self.header.data_offset > MAX_CAPTURE_SIZE {
            return Err(Error::UnsupportedLayout("header region too large"));
        }

        self.read_metadata()?;

        if self.meta.sfo_offset > 0 && self.meta.sfo_size > 0 {
            let sfo_end = u64::from(self.meta.sfo_offset) + u64::from(self.meta.sfo_size);
            if sfo_end > self.header.data_offset {
                return Err(Error::UnsupportedLayout("SFO overlaps the data region"));
            }
            self.skip_to(u64::from(self.meta.sfo_offset))?;
            let blob = self.read_buf(self.meta.sfo_size as usize)?;
            self.sfo_entries = sfo::parse(&blob)?;
        }

        // Everything before the encrypted region is now in the head buffer.
        self.skip_to(self.header.data_offset)?;
        self.capture = Capture::None;

        self.setup_decryption()?;
        self.check_license(zrif)?;
        self.read_file_index()?;

        debug!(
            "opened {} package \"{}\": {} entries, key type {}",
            self.pkg_type,
            self.header.content_id_str(),
            self.entries.len(),
            self.ext.key_type(),
        );

        Ok(())
    }

    // -- accessors -----------------------------------------------------------

    /// The parsed file header.
    pub const fn header(&self) -> &FileHeader {
        &self.header
    }

    /// The parsed extended header.
    pub const fn extended_header(&self) -> &ExtendedHeader {
        &self.ext
    }

    /// Values collected from the metadata record stream.
    pub const fn metadata(&self) -> &Metadata {
        &self.meta
    }

    /// The package category, after SFO-based patch promotion.
    pub const fn package_type(&self) -> PackageType {
        self.pkg_type
    }

    /// Entries collected from PARAM.SFO, either the one referenced by the
    /// metadata or one discovered inside the body stream.
    pub const fn sfo_entries(&self) -> &BTreeMap<String, String> {
        &self.sfo_entries
    }

    /// The package title from the SFO (`TITLE`, falling back to `STITLE`),
    /// or an empty string when no SFO has been seen yet.
    pub fn title(&self) -> &str {
        self.sfo_entries
            .get("TITLE")
            .or_else(|| self.sfo_entries.get("STITLE"))
            .map(String::as_str)
            .unwrap_or("")
    }

    /// Title-ID from the content ID.
    pub fn title_id(&self) -> &str {
        self.header.title_id()
    }

    /// Region code inferred from the content ID letters.
    pub fn region(&self) -> &'static str {
        let cid = &self.header.content_id;
        if self.ext.key_type() == 1 {
            // PSP codes, 3rd letter of the title ID.
            match cid[9] {
                b'U' => "USA",
                b'E' => "EUR",
                b'J' => "JPN",
                b'A' | b'H' => "ASIA",
                _ => "UNK",
            }
        } else {
            // Vita codes, 4th letter of the title ID.
            match cid[10] {
                b'A' | b'E' => "USA",
                b'B' | b'F' => "EUR",
                b'C' | b'G' => "JPN",
                b'D' | b'H' => "ASIA",
                _ => "UNK",
            }
        }
    }

    /// The decoded rif, when a license was supplied.
    pub fn rif(&self) -> Option<&[u8]> {
        self.rif.as_deref()
    }

    /// Bytes preceding the encrypted region (the Vita `head.bin` payload).
    pub fn head(&self) -> &[u8] {
        &self.head_buf
    }

    /// Bytes between the data region and the digest footer (`tail.bin`).
    /// Empty until the last entry has been consumed.
    pub fn tail(&self) -> &[u8] {
        &self.tail_buf
    }

    /// The SHA-1 stored in the package footer. `None` until the tail has
    /// been consumed.
    pub fn file_hash(&self) -> Option<&[u8]> {
        self.file_hash.as_ref().map(|h| h.as_slice())
    }

    /// The SHA-1 computed over the stream. `None` until the tail has been
    /// consumed.
    pub fn calculated_hash(&self) -> Option<&[u8]> {
        self.calculated_hash.as_ref().map(|h| h.as_slice())
    }

    /// Whether the computed digest matches the stored one. Compared in
    /// constant time; false while the tail has not been reached.
    pub fn is_valid(&self) -> bool {
        match (&self.calculated_hash, &self.file_hash) {
            (Some(calculated), Some(stored)) => crypto::ct_eq(calculated, stored),
            _ => false,
        }
    }

    pub(crate) fn set_sfo_entries(&mut self, entries: BTreeMap<String, String>) {
        self.sfo_entries = entries;
    }

    // -- the single byte path ------------------------------------------------

    fn fill(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        let chunk = &buf[..n];
        if self.hashing {
            self.hasher.update(chunk);
        }
        match self.capture {
            Capture::Head => self.head_buf.extend_from_slice(chunk),
            Capture::Tail => self.tail_buf.extend_from_slice(chunk),
            Capture::None => {}
        }
        self.pos += n as u64;
        Ok(n)
    }

    fn read_exact_into(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut off = 0;
        while off < buf.len() {
            let n = self.fill(&mut buf[off..]).map_err(Error::Io)?;
            if n == 0 {
                return Err(Error::Truncated);
            }
            off += n;
        }
        Ok(())
    }

    fn read_buf(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_exact_into(&mut buf)?;
        Ok(buf)
    }

    /// Discard `count` bytes from the stream (still hashed and captured).
    fn skip(&mut self, mut count: u64) -> Result<()> {
        let mut scratch = [0u8; SKIP_BUF_SIZE];
        while count > 0 {
            let want = count.min(SKIP_BUF_SIZE as u64) as usize;
            let n = self.fill(&mut scratch[..want]).map_err(Error::Io)?;
            if n == 0 {
                return Err(Error::Truncated);
            }
            count -= n as u64;
        }
        Ok(())
    }

    /// Advance to an absolute offset by discarding. The input is
    /// forward-only, so an offset behind the current position is fatal.
    fn skip_to(&mut self, offset: u64) -> Result<()> {
        if offset < self.pos {
            return Err(Error::UnsupportedLayout("offset behind the stream position"));
        }
        self.skip(offset - self.pos)
    }

    // -- metadata and key setup ----------------------------------------------

    fn read_metadata(&mut self) -> Result<()> {
        self.skip_to(u64::from(self.header.info_offset))?;

        for _ in 0..self.header.info_count {
            let mut head = [0u8; 8];
            self.read_exact_into(&mut head)?;
            let id = u32::from_be_bytes([head[0], head[1], head[2], head[3]]);
            let size = i32::from_be_bytes([head[4], head[5], head[6], head[7]]);
            if size < 0 {
                return Err(Error::UnsupportedLayout("negative metadata record size"));
            }

            let payload = self.read_buf(size as usize)?;
            let mut values = payload
                .chunks_exact(4)
                .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]));
            let mut next = |field| {
                values
                    .next()
                    .ok_or(Error::UnsupportedLayout(field))
            };

            match id {
                INFO_DRM_TYPE => self.meta.drm_type = next("short DRM-type record")?,
                INFO_CONTENT_TYPE => self.meta.content_type = next("short content-type record")?,
                INFO_PACKAGE_FLAGS => self.meta.package_flags = next("short package-flags record")?,
                INFO_FILE_INDEX => {
                    self.meta.index_table_offset = next("short file-index record")?;
                    self.meta.index_table_size = next("short file-index record")?;
                }
                INFO_SFO => {
                    self.meta.sfo_offset = next("short SFO record")?;
                    self.meta.sfo_size = next("short SFO record")?;
                }
                _ => {} // unknown records are skipped by length
            }
        }

        Ok(())
    }

    fn setup_decryption(&mut self) -> Result<()> {
        let content_type = ContentType::try_from(self.meta.content_type)
            .map_err(Error::UnsupportedContentType)?;
        let mut pkg_type = PackageType::from(content_type);

        if pkg_type == PackageType::VitaApp
            && self.sfo_entries.get("CATEGORY").map(String::as_str) == Some("gp")
        {
            pkg_type = PackageType::VitaPatch;
        }
        self.pkg_type = pkg_type;

        self.primary_key = match self.ext.key_type() {
            1 => PSP_AES_KEY,
            2 => crypto::ecb_encrypt_block(&VITA_AES_KEY_2, &self.header.data_iv)?,
            3 => crypto::ecb_encrypt_block(&VITA_AES_KEY_3, &self.header.data_iv)?,
            4 => crypto::ecb_encrypt_block(&VITA_AES_KEY_4, &self.header.data_iv)?,
            other => return Err(Error::UnknownKeyType(other)),
        };

        Ok(())
    }

    fn check_license(&mut self, zrif: Option<&str>) -> Result<()> {
        let Some(zrif) = zrif else { return Ok(()) };
        if matches!(self.pkg_type, PackageType::Psp | PackageType::PsOne) {
            return Ok(());
        }

        let rif = license::decode(zrif, license::expected_rif_len(self.pkg_type))?;

        let offset = if self.pkg_type == PackageType::Psm {
            0x50
        } else {
            0x10
        };
        let rif_cid = rif
            .get(offset..offset + 36)
            .ok_or(Error::BadLicense("license too short for a content ID"))?;

        if rif_cid != &self.header.content_id[..] {
            return Err(Error::LicenseMismatch {
                rif: String::from_utf8_lossy(rif_cid).into_owned(),
                pkg: self.header.content_id_str().to_string(),
            });
        }

        self.rif = Some(rif);
        Ok(())
    }

    // -- encrypted index -----------------------------------------------------

    /// Key an entry's name and body are encrypted under. PSP and PSOne
    /// packages mix PSP-keyed and PS3-keyed entries; everything else uses
    /// the primary key throughout.
    fn entry_key(&self, record: &ItemRecord) -> [u8; 16] {
        match (self.pkg_type, record.key_type()) {
            (PackageType::Psp | PackageType::PsOne, ENTRY_KEY_PSP) => self.primary_key,
            (PackageType::Psp | PackageType::PsOne, _) => PS3_AES_KEY,
            _ => self.primary_key,
        }
    }

    fn read_file_index(&mut self) -> Result<()> {
        let count = self.header.item_count as usize;
        let records_size = count * ITEM_RECORD_SIZE;
        if records_size as u64 > self.header.data_size {
            return Err(Error::UnsupportedLayout("item table exceeds data region"));
        }

        // The item records are the first bytes of the encrypted region,
        // always under the primary key at counter zero.
        let mut records_buf = self.read_buf(records_size)?;
        crypto::xor_ctr(&self.primary_key, &self.header.data_iv, 0, &mut records_buf)?;

        let mut records = Vec::with_capacity(count);
        for chunk in records_buf.chunks_exact(ITEM_RECORD_SIZE) {
            let mut raw = [0u8; ITEM_RECORD_SIZE];
            raw.copy_from_slice(chunk);
            let record = ItemRecord::parse(&raw)?;
            if record.filename_offset % 16 != 0 || record.data_offset % 16 != 0 {
                return Err(Error::UnsupportedLayout("entry offsets not 16-byte aligned"));
            }
            records.push(record);
        }

        // The filename table sits between the records and the first body.
        let first = &records[0];
        if u64::from(first.filename_offset) < records_size as u64 {
            return Err(Error::UnsupportedLayout("name table overlaps item records"));
        }
        let table_size = first
            .data_offset
            .checked_sub(u64::from(first.filename_offset))
            .ok_or(Error::UnsupportedLayout("name table has negative size"))?;
        if (records_size as u64)
            .checked_add(table_size)
            .is_none_or(|end| end > self.header.data_size)
        {
            return Err(Error::UnsupportedLayout("name table exceeds data region"));
        }

        // Read the whole table raw; names may be encrypted under different
        // keys, so it cannot go through one stream cipher.
        let mut table = self.read_buf(table_size as usize)?;

        let mut entries = Vec::with_capacity(count);
        for record in &records {
            let table_off = (u64::from(record.filename_offset) - records_size as u64) as usize;
            let name_len = record.filename_size as usize;
            let slice = table
                .get_mut(table_off..table_off + name_len)
                .ok_or(Error::UnsupportedLayout("entry name outside the name table"))?;

            let key = self.entry_key(record);
            crypto::xor_ctr(
                &key,
                &self.header.data_iv,
                u64::from(record.filename_offset) / 16,
                slice,
            )?;

            let trimmed = match slice.iter().position(|&b| b == 0) {
                Some(end) => &slice[..end],
                None => &slice[..],
            };
            let name = String::from_utf8(trimmed.to_vec()).map_err(|_| Error::BadEntryName)?;

            entries.push(FileEntry {
                name,
                offset: record.data_offset,
                size: record.data_size,
                flags: record.flags,
                key,
            });
        }

        self.entries = entries;
        Ok(())
    }

    // -- entry iteration -----------------------------------------------------

    /// Advance to the next entry, or `None` once the tail has been drained
    /// and the digest read. Unread body bytes and inter-entry padding are
    /// discarded first.
    pub fn next_entry(&mut self) -> Result<Option<FileEntry>> {
        if let Some(err) = &self.latched {
            return Err(err.duplicate());
        }
        match self.advance() {
            Ok(entry) => Ok(entry),
            Err(err) => {
                self.latched = Some(err.duplicate());
                Err(err)
            }
        }
    }

    fn advance(&mut self) -> Result<Option<FileEntry>> {
        if matches!(self.stage, Stage::Finalized) {
            return Ok(None);
        }

        self.skip_unread()?;

        if self.idx >= self.entries.len() {
            self.read_tail()?;
            self.stage = Stage::Finalized;
            return Ok(None);
        }

        let entry = self.entries[self.idx].clone();
        self.idx += 1;

        let body = if entry.is_directory() { 0 } else { entry.size };
        let next_offset = if self.idx < self.entries.len() {
            self.entries[self.idx].offset
        } else {
            self.header.data_size
        };
        let consumed = entry
            .offset
            .checked_add(entry.size)
            .ok_or(Error::UnsupportedLayout("item record overflows"))?;
        self.pad = next_offset
            .checked_sub(consumed)
            .ok_or(Error::UnsupportedLayout("item records out of order"))?;

        let cipher = crypto::ctr_at_block(&entry.key, &self.header.data_iv, entry.offset / 16)?;
        self.current = Some(BodyState {
            cipher,
            remaining: body,
        });

        Ok(Some(entry))
    }

    /// Discard whatever is left of the current body plus the padding up to
    /// the next entry. The stream ending inside either region means the
    /// package was cut short.
    fn skip_unread(&mut self) -> Result<()> {
        let unread = self.current.as_ref().map_or(0, |body| body.remaining);
        let total = unread + self.pad;
        self.current = None;
        self.pad = 0;
        self.skip(total)
    }

    fn read_tail(&mut self) -> Result<()> {
        let tail_offset = self
            .header
            .data_offset
            .checked_add(self.header.data_size)
            .ok_or(Error::UnsupportedLayout("data region overflows"))?;
        let tail_size = self
            .header
            .total_size
            .checked_sub(tail_offset)
            .ok_or(Error::UnsupportedLayout("data region exceeds total size"))?;
        let hashed = tail_size
            .checked_sub(0x20)
            .ok_or(Error::UnsupportedLayout("tail too small for the digest"))?;
        if hashed > MAX_CAPTURE_SIZE {
            return Err(Error::UnsupportedLayout("tail region too large"));
        }

        self.capture = Capture::Tail;
        self.skip(hashed)?;
        self.capture = Capture::None;

        self.calculated_hash = Some(self.hasher.clone().finalize().into());
        self.hashing = false;

        // The digest footer itself is not part of the hashed bytes.
        let mut footer = [0u8; 0x20];
        self.read_exact_into(&mut footer)?;
        let mut stored = [0u8; 20];
        stored.copy_from_slice(&footer[..20]);
        self.file_hash = Some(stored);

        debug!(
            "tail consumed: {} bytes, digest {}",
            hashed,
            if self.is_valid() { "ok" } else { "MISMATCH" },
        );

        Ok(())
    }

    fn read_body(&mut self, state: &mut BodyState, buf: &mut [u8]) -> Result<usize> {
        if state.remaining == 0 {
            return Ok(0);
        }
        let want = (buf.len() as u64).min(state.remaining) as usize;
        let n = self.fill(&mut buf[..want]).map_err(Error::Io)?;
        if n == 0 {
            return Err(Error::Truncated);
        }
        state.cipher.apply_keystream(&mut buf[..n]);
        state.remaining -= n as u64;
        Ok(n)
    }
}

/// Reads the current entry's decrypted body; end-of-stream once the
/// declared size has been delivered. With no current entry, reads return 0.
impl<R: Read> Read for Reader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if let Some(err) = &self.latched {
            return Err(io::Error::other(err.duplicate()));
        }
        let Some(mut state) = self.current.take() else {
            return Ok(0);
        };
        match self.read_body(&mut state, buf) {
            Ok(n) => {
                self.current = Some(state);
                Ok(n)
            }
            Err(err) => {
                self.latched = Some(err.duplicate());
                Err(io::Error::other(err))
            }
        }
    }
}
