//! zRIF license codec.
//!
//! A zRIF is a raw *rif* license blob, deflated with a fixed preset
//! dictionary, wrapped in a zlib container and Base64. The dictionary is
//! shared by the whole zRIF ecosystem, so it is embedded here as the same
//! compressed constant every other implementation carries and must expand
//! to identical bytes.
//!
//! On encode the two-byte zlib header is normalized to the canonical
//! values other zRIF tools emit: `CM = 8`, `CINFO = 2` (1 KiB window),
//! `FLEVEL = 3`, `FDICT = 1`, with FCHECK recomputed so
//! `(CMF << 8 | FLG) % 31 == 0`.

use std::io::Read;
use std::sync::OnceLock;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::read::ZlibDecoder;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::error::{Error, Result};
use crate::structs::PackageType;

/// The preset dictionary, itself stored as a Base64-wrapped zlib blob.
const RIF_DICT_BLOB: &str = "eNpjYBgFo2AU0AsYAIElGt8MRJiDCAsw3xhEmIAIU4N4AwNdRxcXZ3+/EJCAkW6Ac7C7ARwYgviuQAaIdoPSzlDaBUo7QmknIM3ACIZM78+u7kx3VWYEAGJ9HV0=";

fn rif_dict() -> &'static [u8] {
    static DICT: OnceLock<Vec<u8>> = OnceLock::new();
    DICT.get_or_init(|| {
        let raw = BASE64
            .decode(RIF_DICT_BLOB)
            .expect("embedded dictionary blob is valid Base64");
        let mut dict = Vec::new();
        ZlibDecoder::new(raw.as_slice())
            .read_to_end(&mut dict)
            .expect("embedded dictionary blob is valid zlib");
        dict
    })
}

/// Size of the decoded rif for a given package category; 0 means the size
/// is not checked.
pub fn expected_rif_len(pkg_type: PackageType) -> usize {
    match pkg_type {
        PackageType::Psm => 1024,
        PackageType::VitaApp | PackageType::VitaDlc | PackageType::VitaPatch => 512,
        _ => 0,
    }
}

/// Decode a zRIF string into the raw rif bytes.
///
/// When `expected_len` is non-zero the decoded length must match exactly.
/// Whitespace in the input is ignored, as zRIF strings are often wrapped.
pub fn decode(zrif: &str, expected_len: usize) -> Result<Vec<u8>> {
    let compact: String = zrif.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let data = BASE64
        .decode(compact.as_bytes())
        .map_err(|_| Error::BadLicense("invalid Base64"))?;

    let rif = inflate_with_dict(&data, rif_dict())?;

    if expected_len > 0 && rif.len() != expected_len {
        return Err(Error::BadLicense("decoded license has the wrong length"));
    }

    Ok(rif)
}

/// Encode raw rif bytes into a zRIF string.
pub fn encode(rif: &[u8]) -> Result<String> {
    let mut deflater = Compress::new(Compression::best(), true);
    deflater
        .set_dictionary(rif_dict())
        .map_err(|_| Error::BadLicense("preset dictionary rejected"))?;

    let mut out = Vec::with_capacity(rif.len() / 2 + 64);
    loop {
        let consumed = deflater.total_in() as usize;
        match deflater.compress_vec(&rif[consumed..], &mut out, FlushCompress::Finish) {
            Ok(Status::StreamEnd) => break,
            Ok(_) => out.reserve(256),
            Err(_) => return Err(Error::BadLicense("deflate failed")),
        }
    }

    // Normalize the header the way the rest of the zRIF ecosystem writes it.
    out[0] = 8; // CM = deflate
    out[0] |= 2 << 4; // CINFO = 2 (1 KiB window)
    out[1] = 3 << 6; // FLEVEL = max compression
    out[1] |= 1 << 5; // FDICT = present
    out[1] += (31 - (u16::from_be_bytes([out[0], out[1]]) % 31)) as u8; // FCHECK

    Ok(BASE64.encode(&out))
}

/// Inflate a zlib stream that declares a preset dictionary.
fn inflate_with_dict(data: &[u8], dict: &[u8]) -> Result<Vec<u8>> {
    let mut inflater = Decompress::new(true);
    let mut out = Vec::with_capacity(1024);
    loop {
        let consumed = inflater.total_in() as usize;
        let produced = inflater.total_out();
        match inflater.decompress_vec(&data[consumed..], &mut out, FlushDecompress::Finish) {
            Ok(Status::StreamEnd) => return Ok(out),
            Ok(_) => {
                if out.len() == out.capacity() {
                    // Output buffer full, not done yet.
                    out.reserve(1024);
                } else if inflater.total_in() as usize >= data.len() {
                    return Err(Error::BadLicense("truncated zlib stream"));
                } else if inflater.total_in() as usize == consumed
                    && inflater.total_out() == produced
                {
                    return Err(Error::BadLicense("corrupt zlib stream"));
                }
            }
            Err(e) if e.needs_dictionary().is_some() => {
                inflater
                    .set_dictionary(dict)
                    .map_err(|_| Error::BadLicense("preset dictionary rejected"))?;
            }
            Err(_) => return Err(Error::BadLicense("corrupt zlib stream")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_rif(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(7)).collect()
    }

    #[test]
    fn dictionary_expands() {
        let dict = rif_dict();
        assert!(!dict.is_empty());
    }

    #[test]
    fn round_trips_and_checks_length() {
        let rif = sample_rif(512);
        let zrif = encode(&rif).unwrap();
        assert_eq!(decode(&zrif, 512).unwrap(), rif);
        assert_eq!(decode(&zrif, 0).unwrap(), rif);
        assert!(matches!(
            decode(&zrif, 1024),
            Err(Error::BadLicense(_))
        ));
    }

    #[test]
    fn emitted_header_is_normalized() {
        let zrif = encode(&sample_rif(512)).unwrap();
        let raw = BASE64.decode(zrif.as_bytes()).unwrap();
        // CM = 8, CINFO = 2 → CMF = 0x28; FLEVEL = 3, FDICT = 1 → FLG = 0xEE
        // once FCHECK makes the pair divisible by 31.
        assert_eq!(raw[0], 0x28);
        assert_eq!(raw[1], 0xEE);
        assert_eq!(u16::from_be_bytes([raw[0], raw[1]]) % 31, 0);
        assert_ne!(raw[1] & 0x20, 0); // FDICT set
        assert!(zrif.starts_with("KO4"));
    }

    #[test]
    fn reencoding_a_decoded_license_round_trips() {
        let rif = sample_rif(1024);
        let zrif = encode(&rif).unwrap();
        let decoded = decode(&zrif, 0).unwrap();
        let reencoded = encode(&decoded).unwrap();
        // Dictionary-based deflate output is not canonical, so only the
        // decoded bytes are required to match.
        assert_eq!(decode(&reencoded, 0).unwrap(), rif);
    }

    #[test]
    fn whitespace_in_input_is_tolerated() {
        let rif = sample_rif(512);
        let zrif = encode(&rif).unwrap();
        let wrapped: String = zrif
            .chars()
            .enumerate()
            .flat_map(|(i, c)| {
                if i > 0 && i % 40 == 0 {
                    vec!['\n', c]
                } else {
                    vec![c]
                }
            })
            .collect();
        assert_eq!(decode(&wrapped, 512).unwrap(), rif);
    }

    #[test]
    fn garbage_input_is_rejected() {
        assert!(matches!(decode("not base64 !!!", 0), Err(Error::BadLicense(_))));
        // Valid Base64, but not a zlib stream.
        assert!(matches!(decode("AAAAAAAA", 0), Err(Error::BadLicense(_))));
    }

    #[test]
    fn rif_sizes_per_package_type() {
        assert_eq!(expected_rif_len(PackageType::VitaApp), 512);
        assert_eq!(expected_rif_len(PackageType::VitaDlc), 512);
        assert_eq!(expected_rif_len(PackageType::VitaPatch), 512);
        assert_eq!(expected_rif_len(PackageType::Psm), 1024);
        assert_eq!(expected_rif_len(PackageType::Psp), 0);
        assert_eq!(expected_rif_len(PackageType::PsOne), 0);
    }
}
