//! Cryptographic operations for PKG decryption.
//!
//! Everything in the data region is AES-128-CTR with a big-endian 128-bit
//! counter. The effective IV for a stream starting at block `n` is the
//! header IV plus `n`, added as one 128-bit big-endian integer with carry.
//! Retargeting a stream to another block is done by constructing a fresh
//! cipher at the adjusted IV over the same underlying byte source.

use aes::cipher::{BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use aes::{Aes128, Block};
use ctr::Ctr128BE;

use crate::error::{Error, Result};

/// AES-128 in CTR mode with a big-endian 128-bit counter.
pub type Aes128Ctr = Ctr128BE<Aes128>;

/// Add a block index into a 128-bit big-endian IV, propagating the carry
/// from byte 15 downward.
#[inline]
pub fn add_counter(iv: &[u8; 16], block: u64) -> [u8; 16] {
    u128::from_be_bytes(*iv)
        .wrapping_add(u128::from(block))
        .to_be_bytes()
}

/// CTR keystream positioned at block `block` of the stream defined by
/// `(key, iv)`. Fails with a cipher-setup error if the key length is not 16.
pub fn ctr_at_block(key: &[u8], iv: &[u8; 16], block: u64) -> Result<Aes128Ctr> {
    let iv = add_counter(iv, block);
    Aes128Ctr::new_from_slices(key, &iv).map_err(|_| Error::CryptoInit)
}

/// XOR `data` with the keystream of `(key, iv)` starting at block `block`.
/// CTR is an involution, so this both encrypts and decrypts.
pub fn xor_ctr(key: &[u8], iv: &[u8; 16], block: u64, data: &mut [u8]) -> Result<()> {
    let mut cipher = ctr_at_block(key, iv, block)?;
    cipher.apply_keystream(data);
    Ok(())
}

/// Encrypt a single 16-byte block with AES-128-ECB. Used to derive the
/// per-package CTR key by encrypting the header IV under a base key.
pub fn ecb_encrypt_block(key: &[u8], block: &[u8; 16]) -> Result<[u8; 16]> {
    let cipher = Aes128::new_from_slice(key).map_err(|_| Error::CryptoInit)?;
    let mut out = Block::clone_from_slice(block);
    cipher.encrypt_block(&mut out);
    Ok(out.into())
}

/// Constant-time byte-slice comparison for digest checks.
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut acc = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_add_without_carry() {
        let iv = [0u8; 16];
        let mut want = [0u8; 16];
        want[15] = 5;
        assert_eq!(add_counter(&iv, 5), want);
    }

    #[test]
    fn counter_add_carries_across_bytes() {
        let mut iv = [0u8; 16];
        iv[15] = 0xFF;
        let mut want = [0u8; 16];
        want[14] = 0x01;
        want[15] = 0x00;
        assert_eq!(add_counter(&iv, 1), want);

        // Carry rippling through several bytes.
        let mut iv = [0u8; 16];
        iv[12] = 0x01;
        iv[13] = 0xFF;
        iv[14] = 0xFF;
        iv[15] = 0xFF;
        let mut want = [0u8; 16];
        want[12] = 0x02;
        assert_eq!(add_counter(&iv, 1), want);
    }

    #[test]
    fn counter_add_wraps_at_128_bits() {
        let iv = [0xFF; 16];
        assert_eq!(add_counter(&iv, 1), [0u8; 16]);
    }

    #[test]
    fn counter_add_full_u64() {
        let iv = [0u8; 16];
        let got = add_counter(&iv, u64::MAX);
        let mut want = [0u8; 16];
        want[8..].copy_from_slice(&u64::MAX.to_be_bytes());
        assert_eq!(got, want);
    }

    #[test]
    fn ecb_known_answer() {
        // FIPS-197 appendix C.1 vector.
        let key: [u8; 16] = [
            0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D,
            0x0E, 0x0F,
        ];
        let plain: [u8; 16] = [
            0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xAA, 0xBB, 0xCC, 0xDD,
            0xEE, 0xFF,
        ];
        let want: [u8; 16] = [
            0x69, 0xC4, 0xE0, 0xD8, 0x6A, 0x7B, 0x04, 0x30, 0xD8, 0xCD, 0xB7, 0x80, 0x70, 0xB4,
            0xC5, 0x5A,
        ];
        assert_eq!(ecb_encrypt_block(&key, &plain).unwrap(), want);
    }

    #[test]
    fn ecb_rejects_bad_key_length() {
        assert!(matches!(
            ecb_encrypt_block(&[0u8; 8], &[0u8; 16]),
            Err(Error::CryptoInit)
        ));
    }

    #[test]
    fn reseek_matches_continuous_stream() {
        let key = [0x42u8; 16];
        let iv: [u8; 16] = [
            0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99,
            0xFF, 0xFE,
        ];

        let plain: Vec<u8> = (0..256u32).map(|i| (i * 7 + 3) as u8).collect();
        let mut continuous = plain.clone();
        xor_ctr(&key, &iv, 0, &mut continuous).unwrap();

        // Decrypting each 16-byte block with a stream re-seeked to that block
        // yields the same plaintext as one continuously counted stream.
        let mut chunked = continuous.clone();
        for (i, chunk) in chunked.chunks_mut(16).enumerate() {
            xor_ctr(&key, &iv, i as u64, chunk).unwrap();
        }
        assert_eq!(chunked, plain);
    }

    #[test]
    fn ct_eq_compares() {
        assert!(ct_eq(b"01234567890123456789", b"01234567890123456789"));
        assert!(!ct_eq(b"01234567890123456789", b"0123456789012345678X"));
        assert!(!ct_eq(b"short", b"longer"));
    }
}
