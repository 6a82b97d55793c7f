//! PKG file format structures.
//!
//! A PSP/Vita-era `.pkg` file has the following high-level layout:
//!
//! | Region              | Offset              | Notes                                |
//! |---------------------|---------------------|--------------------------------------|
//! | File header         | `0x00`–`0xBF`       | Plaintext, big-endian                |
//! | Extended header     | `0xC0`–`0xFF`       | Plaintext, big-endian                |
//! | Metadata records    | `info_offset`       | `{type, size, payload}` stream       |
//! | PARAM.SFO           | metadata `SFO` rec  | Little-endian key/value table        |
//! | Item records        | `data_offset`       | Encrypted, 32 bytes each             |
//! | Filename table      | (follows records)   | Encrypted, per-entry keys            |
//! | File bodies         | per item record     | Encrypted, per-entry keys            |
//! | Tail + SHA-1        | end of data region  | Last 0x20 bytes carry the digest     |

use std::fmt;
use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt};

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// PKG magic: `\x7FPKG`.
pub const PKG_MAGIC: [u8; 4] = [0x7F, 0x50, 0x4B, 0x47];

/// Extended-header magic: `\x7Fext`.
pub const EXT_MAGIC: [u8; 4] = [0x7F, 0x65, 0x78, 0x74];

/// Size (in bytes) of the base PKG file header.
pub const FILE_HEADER_SIZE: usize = 0xC0;

/// Size (in bytes) of the extended header that follows the base header.
pub const EXT_HEADER_SIZE: usize = 0x40;

/// Size of one item record in the encrypted index.
pub const ITEM_RECORD_SIZE: usize = 0x20;

/// Entry key-type byte marking PSP-keyed entries inside PSP/PSOne packages.
pub const ENTRY_KEY_PSP: u8 = 0x90;

/// Well-known PSP AES-128 key. Used directly as the CTR key when the
/// extended header declares key type 1.
pub const PSP_AES_KEY: [u8; 16] = [
    0x07, 0xF2, 0xC6, 0x82, 0x90, 0xB5, 0x0D, 0x2C, 0x33, 0x81, 0x8D, 0x70, 0x9B, 0x60, 0xE6, 0x2B,
];

/// Well-known PS3 AES-128 key. Entries of PSP/PSOne packages whose key-type
/// byte is not [`ENTRY_KEY_PSP`] are decrypted under this key.
pub const PS3_AES_KEY: [u8; 16] = [
    0x2E, 0x7B, 0x71, 0xD7, 0xC9, 0xC9, 0xA1, 0x4E, 0xA3, 0x22, 0x1F, 0x18, 0x88, 0x28, 0xB8, 0xF8,
];

/// Vita base key for extended-header key type 2. The CTR key is derived by
/// AES-ECB-encrypting the header's data IV under this key.
pub const VITA_AES_KEY_2: [u8; 16] = [
    0xE3, 0x1A, 0x70, 0xC9, 0xCE, 0x1D, 0xD7, 0x2B, 0xF3, 0xC0, 0x62, 0x29, 0x63, 0xF2, 0xEC, 0xCB,
];

/// Vita base key for extended-header key type 3.
pub const VITA_AES_KEY_3: [u8; 16] = [
    0x42, 0x3A, 0xCA, 0x3A, 0x2B, 0xD5, 0x64, 0x9F, 0x96, 0x86, 0xAB, 0xAD, 0x6F, 0xD8, 0x80, 0x1F,
];

/// Vita base key for extended-header key type 4.
pub const VITA_AES_KEY_4: [u8; 16] = [
    0xAF, 0x07, 0xFD, 0x59, 0x65, 0x25, 0x27, 0xBA, 0xF1, 0x33, 0x89, 0x66, 0x8B, 0x17, 0xD9, 0xEA,
];

// Metadata record identifiers. Unknown types are skipped by length.
pub const INFO_DRM_TYPE: u32 = 0x1;
pub const INFO_CONTENT_TYPE: u32 = 0x2;
pub const INFO_PACKAGE_FLAGS: u32 = 0x3;
pub const INFO_FILE_INDEX: u32 = 0xD;
pub const INFO_SFO: u32 = 0xE;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Known content-type values from the metadata records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ContentType {
    Ps1 = 0x6,
    Psp = 0x7,
    PspGo = 0xE,
    Minis = 0xF,
    NeoGeo = 0x10,
    VitaApp = 0x15,
    VitaDlc = 0x16,
    Psm = 0x18,
    PsmUnity = 0x1C,
}

impl TryFrom<u32> for ContentType {
    type Error = u32;
    fn try_from(v: u32) -> std::result::Result<Self, u32> {
        match v {
            0x6 => Ok(Self::Ps1),
            0x7 => Ok(Self::Psp),
            0xE => Ok(Self::PspGo),
            0xF => Ok(Self::Minis),
            0x10 => Ok(Self::NeoGeo),
            0x15 => Ok(Self::VitaApp),
            0x16 => Ok(Self::VitaDlc),
            0x18 => Ok(Self::Psm),
            0x1C => Ok(Self::PsmUnity),
            other => Err(other),
        }
    }
}

/// Broad package category driving key selection and output layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PackageType {
    PsOne,
    Psp,
    VitaApp,
    VitaDlc,
    VitaPatch,
    Psm,
}

impl From<ContentType> for PackageType {
    fn from(ct: ContentType) -> Self {
        match ct {
            ContentType::Ps1 => PackageType::PsOne,
            ContentType::Psp | ContentType::PspGo | ContentType::Minis | ContentType::NeoGeo => {
                PackageType::Psp
            }
            ContentType::VitaApp => PackageType::VitaApp,
            ContentType::VitaDlc => PackageType::VitaDlc,
            ContentType::Psm | ContentType::PsmUnity => PackageType::Psm,
        }
    }
}

impl fmt::Display for PackageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PackageType::PsOne => "PSOne",
            PackageType::Psp => "PSP",
            PackageType::VitaApp => "Vita app",
            PackageType::VitaDlc => "Vita DLC",
            PackageType::VitaPatch => "Vita patch",
            PackageType::Psm => "PSM",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Header structs
// ---------------------------------------------------------------------------

/// Main PKG header (`0x00`–`0xBF`, all big-endian).
///
/// ```text
/// 0x00  [u8;4]   magic (\x7FPKG)
/// 0x04  u16      revision
/// 0x06  u16      platform
/// 0x08  u32      info_offset
/// 0x0C  u32      info_count
/// 0x10  u32      header_size
/// 0x14  u32      item_count
/// 0x18  u64      total_size
/// 0x20  u64      data_offset
/// 0x28  u64      data_size
/// 0x30  [u8;36]  content_id  (padded ASCII)
/// 0x54  [u8;12]  (padding)
/// 0x60  [u8;16]  digest
/// 0x70  [u8;16]  data_iv     (AES-CTR initial counter)
/// 0x80  [u8;16]  header_cmac
/// 0x90  [u8;40]  npdrm_signature
/// 0xB8  [u8;8]   truncated SHA-1 (unused)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub magic: [u8; 4],
    pub revision: u16,
    pub platform: u16,
    pub info_offset: u32,
    pub info_count: u32,
    pub header_size: u32,
    pub item_count: u32,
    pub total_size: u64,
    pub data_offset: u64,
    pub data_size: u64,
    pub content_id: [u8; 36],
    pub digest: [u8; 16],
    pub data_iv: [u8; 16],
    pub header_cmac: [u8; 16],
    pub npdrm_signature: [u8; 40],
    pub header_sha1: [u8; 8],
}

impl FileHeader {
    /// Parse the header from its fixed 0xC0-byte buffer.
    pub fn parse(buf: &[u8; FILE_HEADER_SIZE]) -> Result<Self> {
        let mut c = Cursor::new(&buf[..]);
        let mut magic = [0u8; 4];
        read_bytes(&mut c, &mut magic)?;

        let revision = c.read_u16::<BigEndian>()?;
        let platform = c.read_u16::<BigEndian>()?;
        let info_offset = c.read_u32::<BigEndian>()?;
        let info_count = c.read_u32::<BigEndian>()?;
        let header_size = c.read_u32::<BigEndian>()?;
        let item_count = c.read_u32::<BigEndian>()?;
        let total_size = c.read_u64::<BigEndian>()?;
        let data_offset = c.read_u64::<BigEndian>()?;
        let data_size = c.read_u64::<BigEndian>()?;

        let mut content_id = [0u8; 36];
        read_bytes(&mut c, &mut content_id)?;
        let mut padding = [0u8; 12];
        read_bytes(&mut c, &mut padding)?;
        let mut digest = [0u8; 16];
        read_bytes(&mut c, &mut digest)?;
        let mut data_iv = [0u8; 16];
        read_bytes(&mut c, &mut data_iv)?;
        let mut header_cmac = [0u8; 16];
        read_bytes(&mut c, &mut header_cmac)?;
        let mut npdrm_signature = [0u8; 40];
        read_bytes(&mut c, &mut npdrm_signature)?;
        let mut header_sha1 = [0u8; 8];
        read_bytes(&mut c, &mut header_sha1)?;

        let header = FileHeader {
            magic,
            revision,
            platform,
            info_offset,
            info_count,
            header_size,
            item_count,
            total_size,
            data_offset,
            data_size,
            content_id,
            digest,
            data_iv,
            header_cmac,
            npdrm_signature,
            header_sha1,
        };

        if header.magic != PKG_MAGIC {
            return Err(Error::InvalidMagic);
        }
        // The declared header size must admit the extended header too.
        if (header.header_size as usize) <= FILE_HEADER_SIZE {
            return Err(Error::UnsupportedLayout("no room for an extended header"));
        }
        if header.item_count == 0 {
            return Err(Error::UnsupportedLayout("package has no item entries"));
        }

        Ok(header)
    }

    /// Content-ID as a `&str`, replacing invalid UTF-8.
    pub fn content_id_str(&self) -> &str {
        core::str::from_utf8(&self.content_id).unwrap_or("<invalid UTF-8>")
    }

    /// Title-ID: bytes 7..16 of the content ID (e.g. `PCSE00001`).
    pub fn title_id(&self) -> &str {
        core::str::from_utf8(&self.content_id[7..16]).unwrap_or("<invalid UTF-8>")
    }

    /// Content name: bytes 20.. of the content ID.
    pub fn content_name(&self) -> &str {
        core::str::from_utf8(&self.content_id[20..]).unwrap_or("<invalid UTF-8>")
    }
}

impl fmt::Display for FileHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FileHeader(content_id=\"{}\", items={}, total_size={}, data_offset={:#x}, data_size={})",
            self.content_id_str(),
            self.item_count,
            self.total_size,
            self.data_offset,
            self.data_size,
        )
    }
}

// ---------------------------------------------------------------------------

/// Extended header (`0xC0`–`0xFF`, big-endian).
///
/// Only the magic and `data_type2` (whose low three bits select the base
/// AES key) matter for extraction; the rest is carried as parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedHeader {
    pub magic: [u8; 4],
    pub unknown1: u32,
    pub header_size: u32,
    pub data_size: u32,
    pub data_offset: u32,
    pub data_type: u32,
    pub pkg_data_size: u64,
    pub data_type2: u32,
    pub unknown2: u32,
}

impl ExtendedHeader {
    /// Parse the extended header from its fixed 0x40-byte buffer.
    pub fn parse(buf: &[u8; EXT_HEADER_SIZE]) -> Result<Self> {
        let mut c = Cursor::new(&buf[..]);
        let mut magic = [0u8; 4];
        read_bytes(&mut c, &mut magic)?;

        let unknown1 = c.read_u32::<BigEndian>()?;
        let header_size = c.read_u32::<BigEndian>()?;
        let data_size = c.read_u32::<BigEndian>()?;
        let data_offset = c.read_u32::<BigEndian>()?;
        let data_type = c.read_u32::<BigEndian>()?;
        let pkg_data_size = c.read_u64::<BigEndian>()?;
        let _padding = c.read_u32::<BigEndian>()?;
        let data_type2 = c.read_u32::<BigEndian>()?;
        let unknown2 = c.read_u32::<BigEndian>()?;
        // 0x2C..0x40 is padding.

        let header = ExtendedHeader {
            magic,
            unknown1,
            header_size,
            data_size,
            data_offset,
            data_type,
            pkg_data_size,
            data_type2,
            unknown2,
        };

        if header.magic != EXT_MAGIC {
            return Err(Error::InvalidExtendedMagic);
        }

        Ok(header)
    }

    /// Base-key selector: the low three bits of `data_type2`.
    #[inline]
    pub const fn key_type(&self) -> u8 {
        (self.data_type2 & 0x7) as u8
    }
}

// ---------------------------------------------------------------------------

/// Values collected from the metadata record stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Metadata {
    pub drm_type: u32,
    pub content_type: u32,
    pub package_flags: u32,
    pub index_table_offset: u32,
    pub index_table_size: u32,
    pub sfo_offset: u32,
    pub sfo_size: u32,
}

// ---------------------------------------------------------------------------
// Item records and resolved entries
// ---------------------------------------------------------------------------

/// A single record in the encrypted item index (32 bytes, big-endian).
///
/// ```text
/// 0x00  u32  filename_offset  (into the decrypted name table)
/// 0x04  u32  filename_size
/// 0x08  u64  data_offset      (into the decrypted data region)
/// 0x10  u64  data_size
/// 0x18  u32  flags            (key type byte at >>24, file type at &0xFF)
/// 0x1C  u32  reserved
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemRecord {
    pub filename_offset: u32,
    pub filename_size: u32,
    pub data_offset: u64,
    pub data_size: u64,
    pub flags: u32,
    pub reserved: u32,
}

impl ItemRecord {
    /// Parse one record from its fixed 32-byte buffer.
    pub fn parse(buf: &[u8; ITEM_RECORD_SIZE]) -> Result<Self> {
        let mut c = Cursor::new(&buf[..]);
        Ok(ItemRecord {
            filename_offset: c.read_u32::<BigEndian>()?,
            filename_size: c.read_u32::<BigEndian>()?,
            data_offset: c.read_u64::<BigEndian>()?,
            data_size: c.read_u64::<BigEndian>()?,
            flags: c.read_u32::<BigEndian>()?,
            reserved: c.read_u32::<BigEndian>()?,
        })
    }

    /// The entry key-type byte (bits 24..32 of `flags`).
    #[inline]
    pub const fn key_type(&self) -> u8 {
        (self.flags >> 24) as u8
    }
}

/// A resolved index entry with its decrypted name and assigned cipher key.
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// Decrypted file or directory name, relative to the package root.
    pub name: String,
    /// Body offset inside the encrypted data region.
    pub offset: u64,
    /// Body size in bytes (directories carry zero body bytes).
    pub size: u64,
    /// Raw flags word from the item record.
    pub flags: u32,
    /// AES-128 key this entry's name and body are encrypted under.
    pub(crate) key: [u8; 16],
}

impl FileEntry {
    /// The file-type byte (low byte of `flags`).
    #[inline]
    pub const fn file_type(&self) -> u8 {
        (self.flags & 0xFF) as u8
    }

    /// The entry key-type byte (bits 24..32 of `flags`).
    #[inline]
    pub const fn key_type(&self) -> u8 {
        (self.flags >> 24) as u8
    }

    /// Whether this entry is a regular file of any known kind.
    pub const fn is_file(&self) -> bool {
        matches!(
            self.file_type(),
            0 | 1 | 2 | 3 | 5 | 6 | 14 | 15 | 16 | 17 | 19 | 20 | 21 | 22 | 24
        )
    }

    /// Whether this entry is a directory (plain or PFS).
    pub const fn is_directory(&self) -> bool {
        matches!(self.file_type(), 4 | 18)
    }
}

impl fmt::Display for FileEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_directory() { "dir" } else { "file" };
        write!(
            f,
            "FileEntry(\"{}\", {}, offset={:#x}, size={})",
            self.name, kind, self.offset, self.size,
        )
    }
}

// ---------------------------------------------------------------------------

fn read_bytes(c: &mut Cursor<&[u8]>, out: &mut [u8]) -> Result<()> {
    use std::io::Read;
    c.read_exact(out).map_err(|_| Error::Truncated)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> [u8; FILE_HEADER_SIZE] {
        use byteorder::WriteBytesExt;
        let mut buf = Vec::with_capacity(FILE_HEADER_SIZE);
        buf.extend_from_slice(&PKG_MAGIC);
        buf.write_u16::<BigEndian>(1).unwrap(); // revision
        buf.write_u16::<BigEndian>(2).unwrap(); // platform
        buf.write_u32::<BigEndian>(0x100).unwrap(); // info_offset
        buf.write_u32::<BigEndian>(3).unwrap(); // info_count
        buf.write_u32::<BigEndian>(0x100).unwrap(); // header_size
        buf.write_u32::<BigEndian>(2).unwrap(); // item_count
        buf.write_u64::<BigEndian>(0x1000).unwrap(); // total_size
        buf.write_u64::<BigEndian>(0x400).unwrap(); // data_offset
        buf.write_u64::<BigEndian>(0x800).unwrap(); // data_size
        buf.extend_from_slice(b"UP0000-PCSE00001_00-HELLOWORLD000001");
        buf.resize(FILE_HEADER_SIZE, 0);
        buf.try_into().unwrap()
    }

    #[test]
    fn parses_header_and_content_id_slices() {
        let header = FileHeader::parse(&sample_header()).unwrap();
        assert_eq!(header.item_count, 2);
        assert_eq!(header.title_id(), "PCSE00001");
        assert_eq!(header.content_name(), "HELLOWORLD000001");
        assert_eq!(
            header.content_id_str(),
            "UP0000-PCSE00001_00-HELLOWORLD000001"
        );
    }

    #[test]
    fn rejects_bad_magic() {
        let mut buf = sample_header();
        buf[0] = 0x00;
        assert!(matches!(FileHeader::parse(&buf), Err(Error::InvalidMagic)));
    }

    #[test]
    fn rejects_header_without_extended_room() {
        let mut buf = sample_header();
        buf[0x10..0x14].copy_from_slice(&(FILE_HEADER_SIZE as u32).to_be_bytes());
        assert!(matches!(
            FileHeader::parse(&buf),
            Err(Error::UnsupportedLayout(_))
        ));
    }

    #[test]
    fn maps_content_types_to_package_types() {
        assert_eq!(
            PackageType::from(ContentType::try_from(0x7u32).unwrap()),
            PackageType::Psp
        );
        assert_eq!(
            PackageType::from(ContentType::try_from(0x15u32).unwrap()),
            PackageType::VitaApp
        );
        // Both PSM content types land on the same package type.
        assert_eq!(
            PackageType::from(ContentType::try_from(0x18u32).unwrap()),
            PackageType::Psm
        );
        assert_eq!(
            PackageType::from(ContentType::try_from(0x1Cu32).unwrap()),
            PackageType::Psm
        );
        assert!(ContentType::try_from(0x99u32).is_err());
    }
}
