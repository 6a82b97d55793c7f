//! PARAM.SFO parsing.
//!
//! SFO is the little-endian key/value metadata table embedded in PKGs.
//! Extraction needs only a handful of entries (`CATEGORY`, `TITLE`,
//! `TITLE_ID`, `APP_VER`), so every value is stringified into one map.
//!
//! ```text
//! 0x00  [u8;4]  magic (\0PSF)
//! 0x04  u32     version
//! 0x08  u32     key-table offset
//! 0x0C  u32     data-table offset
//! 0x10  u32     index entry count
//! 0x14  ...     index entries (16 bytes each), then key table, then data table
//! ```

use std::collections::BTreeMap;
use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::error::{Error, Result};

/// SFO magic: `\0PSF`.
pub const SFO_MAGIC: [u8; 4] = [0x00, 0x50, 0x53, 0x46];

// Param formats. Anything else is skipped.
const FORMAT_UTF8_SPECIAL: u16 = 0x0004; // raw bytes, not NUL-terminated
const FORMAT_UTF8: u16 = 0x0204; // NUL-terminated string
const FORMAT_INTEGER: u16 = 0x0404; // little-endian u32

struct IndexEntry {
    key_offset: u16,
    param_format: u16,
    param_length: u32,
    data_offset: u32,
}

/// Parse an SFO blob into a key → stringified-value map.
pub fn parse(data: &[u8]) -> Result<BTreeMap<String, String>> {
    if data.len() < 0x14 {
        return Err(Error::Truncated);
    }
    if data[..4] != SFO_MAGIC {
        return Err(Error::UnsupportedLayout("invalid SFO magic"));
    }

    let mut c = Cursor::new(&data[4..0x14]);
    let _version = c.read_u32::<LittleEndian>()?;
    let key_table = c.read_u32::<LittleEndian>()? as usize;
    let data_table = c.read_u32::<LittleEndian>()? as usize;
    let count = c.read_u32::<LittleEndian>()? as usize;

    let index_end = 0x14 + count * 16;
    if index_end > data.len() || key_table > data_table || data_table > data.len() {
        return Err(Error::UnsupportedLayout("SFO tables out of range"));
    }

    let mut index = Vec::with_capacity(count);
    let mut c = Cursor::new(&data[0x14..index_end]);
    for _ in 0..count {
        let key_offset = c.read_u16::<LittleEndian>()?;
        let param_format = c.read_u16::<LittleEndian>()?;
        let param_length = c.read_u32::<LittleEndian>()?;
        let _param_max_length = c.read_u32::<LittleEndian>()?;
        let data_offset = c.read_u32::<LittleEndian>()?;
        index.push(IndexEntry {
            key_offset,
            param_format,
            param_length,
            data_offset,
        });
    }

    let keys = &data[key_table..data_table];
    let values = &data[data_table..];

    let mut entries = BTreeMap::new();
    for entry in &index {
        let key_start = entry.key_offset as usize;
        let key_bytes = keys
            .get(key_start..)
            .and_then(|tail| tail.split(|&b| b == 0).next())
            .ok_or(Error::UnsupportedLayout("SFO key offset out of range"))?;
        let key = String::from_utf8_lossy(key_bytes).into_owned();

        let start = entry.data_offset as usize;
        let len = entry.param_length as usize;
        let raw = values
            .get(start..start + len)
            .ok_or(Error::UnsupportedLayout("SFO value out of range"))?;

        let value = match entry.param_format {
            FORMAT_UTF8_SPECIAL => String::from_utf8_lossy(raw).into_owned(),
            FORMAT_UTF8 => {
                // Declared length includes the terminating NUL.
                let text = raw.strip_suffix(&[0]).unwrap_or(raw);
                String::from_utf8_lossy(text).into_owned()
            }
            FORMAT_INTEGER => {
                if raw.len() < 4 {
                    return Err(Error::UnsupportedLayout("short SFO integer value"));
                }
                u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]).to_string()
            }
            _ => continue,
        };

        entries.insert(key, value);
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;

    /// Build an SFO blob with one entry per param format.
    fn sample_sfo() -> Vec<u8> {
        let keys: &[&[u8]] = &[b"CATEGORY\0", b"PARENTAL_LEVEL\0", b"TITLE\0"];
        let key_offsets = [0u16, 9, 24];

        // Values, padded to each entry's max length.
        let mut values = Vec::new();
        values.extend_from_slice(b"gd\0\0"); // utf8, len 3, max 4
        values.write_u32::<LittleEndian>(5).unwrap(); // integer
        values.extend_from_slice(b"Demo"); // utf8 special, len 4

        let entries = [
            (key_offsets[0], FORMAT_UTF8, 3u32, 4u32, 0u32),
            (key_offsets[1], FORMAT_INTEGER, 4, 4, 4),
            (key_offsets[2], FORMAT_UTF8_SPECIAL, 4, 4, 8),
        ];

        let key_table = 0x14 + entries.len() * 16;
        let keys_len: usize = keys.iter().map(|k| k.len()).sum();
        let data_table = key_table + keys_len;

        let mut buf = Vec::new();
        buf.extend_from_slice(&SFO_MAGIC);
        buf.write_u32::<LittleEndian>(0x0101).unwrap();
        buf.write_u32::<LittleEndian>(key_table as u32).unwrap();
        buf.write_u32::<LittleEndian>(data_table as u32).unwrap();
        buf.write_u32::<LittleEndian>(entries.len() as u32).unwrap();
        for (key_off, format, len, max, data_off) in entries {
            buf.write_u16::<LittleEndian>(key_off).unwrap();
            buf.write_u16::<LittleEndian>(format).unwrap();
            buf.write_u32::<LittleEndian>(len).unwrap();
            buf.write_u32::<LittleEndian>(max).unwrap();
            buf.write_u32::<LittleEndian>(data_off).unwrap();
        }
        for key in keys {
            buf.extend_from_slice(key);
        }
        buf.extend_from_slice(&values);
        buf
    }

    #[test]
    fn parses_all_param_formats() {
        let map = parse(&sample_sfo()).unwrap();
        assert_eq!(map["CATEGORY"], "gd");
        assert_eq!(map["PARENTAL_LEVEL"], "5");
        assert_eq!(map["TITLE"], "Demo");
    }

    #[test]
    fn empty_index_parses_to_empty_map() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&SFO_MAGIC);
        buf.extend_from_slice(&[0u8; 4]); // version
        buf.extend_from_slice(&0x14u32.to_le_bytes()); // key table
        buf.extend_from_slice(&0x14u32.to_le_bytes()); // data table
        buf.extend_from_slice(&[0u8; 4]); // count
        assert!(parse(&buf).unwrap().is_empty());
    }

    #[test]
    fn rejects_bad_magic() {
        let mut buf = sample_sfo();
        buf[1] = b'X';
        assert!(matches!(parse(&buf), Err(Error::UnsupportedLayout(_))));
    }

    #[test]
    fn rejects_out_of_range_value() {
        let mut buf = sample_sfo();
        // Point the last entry's data offset past the end of the blob.
        let entry = 0x14 + 2 * 16;
        buf[entry + 12..entry + 16].copy_from_slice(&0xFFFFu32.to_le_bytes());
        assert!(matches!(parse(&buf), Err(Error::UnsupportedLayout(_))));
    }
}
