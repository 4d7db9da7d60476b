//! The AEAD core: AES-256-GCM plus the EME cipher, keyed once at mount.
//!
//! Two interchangeable GCM geometries are supported, selected by the on-disk
//! format: the classic 96-bit nonce and the 128-bit nonce used by newer
//! filesystems (`GCMIV128` feature flag). Everything else is identical, so
//! the choice is an enum, not a trait object.

use aes_gcm::{
    aead::{generic_array::GenericArray, Aead, KeyInit, Payload},
    aes::{
        cipher::consts::{U12, U16},
        Aes256,
    },
    AesGcm,
};
use rand::{rngs::OsRng, RngCore};

use cloakfs_core::{CloakfsError, CloakfsResult};

use crate::eme::EmeCipher;
use crate::keys::MasterKey;

enum GcmBackend {
    /// 96-bit nonces.
    Iv96(AesGcm<Aes256, U12>),
    /// 128-bit nonces (`GCMIV128`).
    Iv128(AesGcm<Aes256, U16>),
}

/// Stateless after construction; all methods are safe for concurrent use.
pub struct CryptoCore {
    aead: GcmBackend,
    eme: EmeCipher,
    iv_len: usize,
}

impl CryptoCore {
    /// Build the crypto context for one mount. `iv_len` must be 12 or 16.
    pub fn new(key: &MasterKey, iv_len: usize) -> CloakfsResult<Self> {
        let aead = match iv_len {
            12 => GcmBackend::Iv96(AesGcm::new(key.as_bytes().into())),
            16 => GcmBackend::Iv128(AesGcm::new(key.as_bytes().into())),
            other => {
                return Err(CloakfsError::Crypto(format!(
                    "unsupported GCM nonce length {other}, must be 12 or 16"
                )))
            }
        };
        Ok(Self {
            aead,
            eme: EmeCipher::new(key),
            iv_len,
        })
    }

    pub fn iv_len(&self) -> usize {
        self.iv_len
    }

    /// The EME cipher for filename encryption. Same key material, different
    /// mode object.
    pub fn eme(&self) -> &EmeCipher {
        &self.eme
    }

    /// Draw `n` cryptographically strong random bytes.
    pub fn rand_bytes(&self, n: usize) -> Vec<u8> {
        rand_bytes(n)
    }

    /// Encrypt and authenticate. Returns `ciphertext || tag`.
    pub fn seal(&self, plaintext: &[u8], nonce: &[u8], aad: &[u8]) -> CloakfsResult<Vec<u8>> {
        if nonce.len() != self.iv_len {
            return Err(CloakfsError::Crypto(format!(
                "nonce length {} does not match configured {}",
                nonce.len(),
                self.iv_len
            )));
        }
        let payload = Payload {
            msg: plaintext,
            aad,
        };
        let result = match &self.aead {
            GcmBackend::Iv96(cipher) => {
                cipher.encrypt(GenericArray::from_slice(nonce), payload)
            }
            GcmBackend::Iv128(cipher) => {
                cipher.encrypt(GenericArray::from_slice(nonce), payload)
            }
        };
        result.map_err(|_| CloakfsError::Crypto("GCM seal failed".into()))
    }

    /// Authenticate and decrypt `ciphertext || tag`. Tag mismatch is
    /// [`CloakfsError::Auth`].
    pub fn open(&self, ciphertext: &[u8], nonce: &[u8], aad: &[u8]) -> CloakfsResult<Vec<u8>> {
        if nonce.len() != self.iv_len {
            return Err(CloakfsError::Crypto(format!(
                "nonce length {} does not match configured {}",
                nonce.len(),
                self.iv_len
            )));
        }
        let payload = Payload {
            msg: ciphertext,
            aad,
        };
        let result = match &self.aead {
            GcmBackend::Iv96(cipher) => {
                cipher.decrypt(GenericArray::from_slice(nonce), payload)
            }
            GcmBackend::Iv128(cipher) => {
                cipher.decrypt(GenericArray::from_slice(nonce), payload)
            }
        };
        result.map_err(|_| CloakfsError::Auth)
    }
}

/// Cryptographically strong random bytes from the OS. Entropy failure is
/// catastrophic and panics; there is nothing sensible to do without it.
pub fn rand_bytes(n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    OsRng.fill_bytes(&mut buf);
    buf
}
