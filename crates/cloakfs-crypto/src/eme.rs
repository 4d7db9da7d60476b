//! EME (ECB-Mix-ECB) wide-block encryption over AES-256.
//!
//! EME is deterministic and length-preserving: the same input under the same
//! tweak always produces the same output. That is exactly what filename
//! encryption needs — a directory lookup must be able to recompute the
//! ciphertext name without a secondary index. Confidentiality still holds
//! across directories because each directory contributes its own 16-byte
//! tweak.
//!
//! The mode enciphers 1..=128 AES blocks (16..=2048 bytes) as one wide
//! block: an ECB pass, a mixing layer keyed by the tweak, and a second ECB
//! pass. Multiplication by two is in GF(2^128).

use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes256;

use cloakfs_core::{CloakfsError, CloakfsResult};

use crate::keys::MasterKey;

const BLOCK: usize = 16;
const MAX_BLOCKS: usize = 128;

#[derive(Clone, Copy, PartialEq)]
enum Direction {
    Encrypt,
    Decrypt,
}

/// A deterministic wide-block cipher keyed by the master key.
pub struct EmeCipher {
    aes: Aes256,
}

impl EmeCipher {
    pub fn new(key: &MasterKey) -> Self {
        Self {
            aes: Aes256::new(key.as_bytes().into()),
        }
    }

    /// Encipher `data` (a positive multiple of 16 bytes, at most 2048) under
    /// the 16-byte tweak.
    pub fn encrypt(&self, tweak: &[u8; BLOCK], data: &[u8]) -> CloakfsResult<Vec<u8>> {
        self.transform(tweak, data, Direction::Encrypt)
    }

    /// Inverse of [`EmeCipher::encrypt`].
    pub fn decrypt(&self, tweak: &[u8; BLOCK], data: &[u8]) -> CloakfsResult<Vec<u8>> {
        self.transform(tweak, data, Direction::Decrypt)
    }

    fn transform(
        &self,
        tweak: &[u8; BLOCK],
        data: &[u8],
        direction: Direction,
    ) -> CloakfsResult<Vec<u8>> {
        if data.is_empty() || data.len() % BLOCK != 0 {
            return Err(CloakfsError::Crypto(format!(
                "EME input length {} is not a positive multiple of {}",
                data.len(),
                BLOCK
            )));
        }
        let m = data.len() / BLOCK;
        if m > MAX_BLOCKS {
            return Err(CloakfsError::Crypto(format!(
                "EME input of {m} blocks exceeds the {MAX_BLOCKS}-block limit"
            )));
        }

        let l_table = self.tabulate_l(m);
        let mut c = vec![0u8; data.len()];

        // First ECB pass: PPj = E(Pj xor Lj)
        for j in 0..m {
            let mut block = [0u8; BLOCK];
            xor_into(&mut block, &data[j * BLOCK..(j + 1) * BLOCK], &l_table[j]);
            self.cipher_block(&mut block, direction);
            c[j * BLOCK..(j + 1) * BLOCK].copy_from_slice(&block);
        }

        // Mixing layer, keyed by the tweak.
        let mut mp = [0u8; BLOCK];
        xor_into(&mut mp, &c[0..BLOCK], tweak);
        for j in 1..m {
            xor_assign(&mut mp, &c[j * BLOCK..(j + 1) * BLOCK]);
        }

        let mut mc = mp;
        self.cipher_block(&mut mc, direction);

        let mut mask = [0u8; BLOCK];
        xor_into(&mut mask, &mp, &mc);

        let mut ccc1 = [0u8; BLOCK];
        xor_into(&mut ccc1, &mc, tweak);
        for j in 1..m {
            mask = mult_by_two(&mask);
            let mut cccj = [0u8; BLOCK];
            xor_into(&mut cccj, &c[j * BLOCK..(j + 1) * BLOCK], &mask);
            c[j * BLOCK..(j + 1) * BLOCK].copy_from_slice(&cccj);
            xor_assign(&mut ccc1, &cccj);
        }
        c[0..BLOCK].copy_from_slice(&ccc1);

        // Second ECB pass: Cj = E(CCCj) xor Lj
        for j in 0..m {
            let mut block = [0u8; BLOCK];
            block.copy_from_slice(&c[j * BLOCK..(j + 1) * BLOCK]);
            self.cipher_block(&mut block, direction);
            xor_assign(&mut block, &l_table[j]);
            c[j * BLOCK..(j + 1) * BLOCK].copy_from_slice(&block);
        }

        Ok(c)
    }

    fn cipher_block(&self, block: &mut [u8; BLOCK], direction: Direction) {
        let ga = GenericArray::from_mut_slice(block);
        match direction {
            Direction::Encrypt => self.aes.encrypt_block(ga),
            Direction::Decrypt => self.aes.decrypt_block(ga),
        }
    }

    /// L-table: Lj = 2^(j+1) * E(0). Always uses the encrypt direction, also
    /// when deciphering.
    fn tabulate_l(&self, m: usize) -> Vec<[u8; BLOCK]> {
        let mut li = [0u8; BLOCK];
        self.aes.encrypt_block(GenericArray::from_mut_slice(&mut li));
        let mut table = Vec::with_capacity(m);
        for _ in 0..m {
            li = mult_by_two(&li);
            table.push(li);
        }
        table
    }
}

/// Multiplication by two in GF(2^128).
fn mult_by_two(input: &[u8; BLOCK]) -> [u8; BLOCK] {
    let mut out = [0u8; BLOCK];
    out[0] = input[0].wrapping_mul(2);
    if input[BLOCK - 1] >= 128 {
        out[0] ^= 135;
    }
    for j in 1..BLOCK {
        out[j] = input[j].wrapping_mul(2);
        if input[j - 1] >= 128 {
            out[j] = out[j].wrapping_add(1);
        }
    }
    out
}

fn xor_into(out: &mut [u8; BLOCK], a: &[u8], b: &[u8]) {
    for i in 0..BLOCK {
        out[i] = a[i] ^ b[i];
    }
}

fn xor_assign(out: &mut [u8; BLOCK], other: &[u8]) {
    for i in 0..BLOCK {
        out[i] ^= other[i];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> EmeCipher {
        EmeCipher::new(&MasterKey::from_bytes([0x33; 32]))
    }

    #[test]
    fn roundtrip_all_widths() {
        let eme = cipher();
        let tweak = [0x01u8; 16];
        for blocks in [1usize, 2, 3, 11, 128] {
            let data: Vec<u8> = (0..blocks * 16).map(|i| (i % 251) as u8).collect();
            let ct = eme.encrypt(&tweak, &data).unwrap();
            assert_eq!(ct.len(), data.len(), "EME must preserve length");
            assert_ne!(ct, data);
            let pt = eme.decrypt(&tweak, &ct).unwrap();
            assert_eq!(pt, data);
        }
    }

    #[test]
    fn deterministic_under_same_tweak() {
        let eme = cipher();
        let tweak = [0xAB; 16];
        let data = b"sixteen byte blk";
        assert_eq!(
            eme.encrypt(&tweak, data).unwrap(),
            eme.encrypt(&tweak, data).unwrap()
        );
    }

    #[test]
    fn tweak_changes_ciphertext() {
        let eme = cipher();
        let data = [0x5Au8; 32];
        let ct1 = eme.encrypt(&[0x00; 16], &data).unwrap();
        let ct2 = eme.encrypt(&[0x01; 16], &data).unwrap();
        assert_ne!(ct1, ct2);
        // Deciphering under the wrong tweak must not give the plaintext back.
        assert_ne!(eme.decrypt(&[0x01; 16], &ct1).unwrap(), data.to_vec());
    }

    #[test]
    fn key_changes_ciphertext() {
        let data = [0u8; 16];
        let tweak = [0u8; 16];
        let ct1 = EmeCipher::new(&MasterKey::from_bytes([1; 32]))
            .encrypt(&tweak, &data)
            .unwrap();
        let ct2 = EmeCipher::new(&MasterKey::from_bytes([2; 32]))
            .encrypt(&tweak, &data)
            .unwrap();
        assert_ne!(ct1, ct2);
    }

    #[test]
    fn single_block_diffusion() {
        // Flipping one input bit must change the whole output, not just the
        // containing AES block.
        let eme = cipher();
        let tweak = [0x77; 16];
        let mut data = [0x10u8; 48];
        let ct1 = eme.encrypt(&tweak, &data).unwrap();
        data[40] ^= 0x80;
        let ct2 = eme.encrypt(&tweak, &data).unwrap();
        assert_ne!(ct1[0..16], ct2[0..16]);
        assert_ne!(ct1[16..32], ct2[16..32]);
        assert_ne!(ct1[32..48], ct2[32..48]);
    }

    #[test]
    fn rejects_bad_lengths() {
        let eme = cipher();
        let tweak = [0u8; 16];
        assert!(eme.encrypt(&tweak, &[]).is_err());
        assert!(eme.encrypt(&tweak, &[0u8; 15]).is_err());
        assert!(eme.encrypt(&tweak, &[0u8; 17]).is_err());
        assert!(eme.encrypt(&tweak, &vec![0u8; 129 * 16]).is_err());
        assert!(eme.encrypt(&tweak, &vec![0u8; 128 * 16]).is_ok());
    }
}
