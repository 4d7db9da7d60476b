//! Filename encryption: PKCS#7 padding, EME under the parent directory's IV,
//! URL-safe base64 without padding.
//!
//! Determinism matters here: the same plaintext name under the same
//! directory IV must always map to the same ciphertext name, or directory
//! lookups would need a secondary index. Two directories never share an IV,
//! so equal names in different directories still get unrelated ciphertexts.

use std::path::Path;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;

use cloakfs_core::{CloakfsError, CloakfsResult};

use crate::aead::CryptoCore;
use crate::diriv::{read_dir_iv, DirIvCache, DIRIV_LEN};
use std::sync::Arc;

const PAD_BLOCK: usize = 16;

/// PKCS#7-pad to a multiple of 16 bytes. A zero-length name cannot be
/// padded; that is a caller bug surfaced as an error, not a panic.
fn pad16(orig: &[u8]) -> Result<Vec<u8>, &'static str> {
    if orig.is_empty() {
        return Err("cannot pad an empty name");
    }
    let pad_len = PAD_BLOCK - orig.len() % PAD_BLOCK;
    let mut padded = Vec::with_capacity(orig.len() + pad_len);
    padded.extend_from_slice(orig);
    padded.resize(orig.len() + pad_len, pad_len as u8);
    Ok(padded)
}

/// Remove PKCS#7 padding. Rejects unaligned input, pad bytes outside
/// `[1, 16]`, inconsistent padding, and padding that covers the whole input.
fn unpad16(padded: &[u8]) -> Result<&[u8], &'static str> {
    if padded.is_empty() || padded.len() % PAD_BLOCK != 0 {
        return Err("length is not a positive multiple of 16");
    }
    let pad_len = *padded.last().unwrap() as usize;
    if pad_len == 0 || pad_len > PAD_BLOCK {
        return Err("padding byte out of range");
    }
    if pad_len == padded.len() {
        return Err("padding covers the entire name");
    }
    let (rest, pad) = padded.split_at(padded.len() - pad_len);
    if pad.iter().any(|&b| b as usize != pad_len) {
        return Err("inconsistent padding bytes");
    }
    Ok(rest)
}

/// Converts between plaintext and ciphertext path components.
///
/// With `plaintext_names` every operation is the identity and directory IVs
/// are neither read nor written.
pub struct NameTransform {
    core: Arc<CryptoCore>,
    plaintext_names: bool,
    cache: DirIvCache,
}

impl NameTransform {
    pub fn new(core: Arc<CryptoCore>, plaintext_names: bool) -> Self {
        Self {
            core,
            plaintext_names,
            cache: DirIvCache::new(),
        }
    }

    pub fn plaintext_names(&self) -> bool {
        self.plaintext_names
    }

    /// Drop the cached directory IV. Must be called by every operation that
    /// can change directory identity: rename, rmdir, mkdir.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Encrypt one path component under the given directory IV.
    pub fn encrypt_name(&self, plain: &str, iv: &[u8; DIRIV_LEN]) -> CloakfsResult<String> {
        if self.plaintext_names {
            return Ok(plain.to_string());
        }
        if plain.contains('/') {
            return Err(CloakfsError::InvalidName {
                name: plain.to_string(),
                reason: "path separator in component",
            });
        }
        let padded = pad16(plain.as_bytes()).map_err(|reason| CloakfsError::InvalidName {
            name: plain.to_string(),
            reason,
        })?;
        let ct = self.core.eme().encrypt(iv, &padded)?;
        Ok(URL_SAFE_NO_PAD.encode(ct))
    }

    /// Decrypt one ciphertext path component. All malformed inputs come back
    /// as [`CloakfsError::InvalidName`] so callers can hide the entry.
    pub fn decrypt_name(&self, cipher: &str, iv: &[u8; DIRIV_LEN]) -> CloakfsResult<String> {
        if self.plaintext_names {
            return Ok(cipher.to_string());
        }
        let invalid = |reason| CloakfsError::InvalidName {
            name: cipher.to_string(),
            reason,
        };
        let ct = URL_SAFE_NO_PAD
            .decode(cipher)
            .map_err(|_| invalid("not valid base64"))?;
        if ct.is_empty() || ct.len() % PAD_BLOCK != 0 {
            return Err(invalid("decoded length is not a positive multiple of 16"));
        }
        let padded = self.core.eme().decrypt(iv, &ct)?;
        let plain = unpad16(&padded).map_err(invalid)?;
        String::from_utf8(plain.to_vec()).map_err(|_| invalid("decrypted name is not UTF-8"))
    }

    /// Encrypt a relative plaintext path (components separated by `/`) by
    /// walking the directory IV chain from `root`. The empty path is the
    /// root and maps to itself.
    ///
    /// The single-slot cache short-circuits the common case of repeated
    /// operations against the same parent directory.
    pub fn encrypt_path(&self, plain_path: &str, root: &Path) -> CloakfsResult<String> {
        if self.plaintext_names || plain_path.is_empty() {
            return Ok(plain_path.to_string());
        }

        let (parent, base) = split_parent(plain_path);
        if let Some((iv, cipher_parent)) = self.cache.lookup(parent) {
            let cipher_base = self.encrypt_name(base, &iv)?;
            return Ok(join_path(&cipher_parent, &cipher_base));
        }

        // Cache miss: walk from the root, reading each directory's IV.
        let mut wd = root.to_path_buf();
        let mut cipher_names = Vec::new();
        let mut last_iv = None;
        for plain_name in plain_path.split('/') {
            let iv = read_dir_iv(&wd)?;
            let cipher_name = self.encrypt_name(plain_name, &iv)?;
            wd.push(&cipher_name);
            cipher_names.push(cipher_name);
            last_iv = Some(iv);
        }
        let cipher_path = cipher_names.join("/");
        if let Some(iv) = last_iv {
            // The IV read last belongs to the parent of the final component.
            self.cache
                .store(parent, &iv, split_parent(&cipher_path).0);
        }
        Ok(cipher_path)
    }

    /// Inverse of [`NameTransform::encrypt_path`]. Not cached; decryption
    /// walks are rare (resolving a ciphertext path back for diagnostics).
    pub fn decrypt_path(&self, cipher_path: &str, root: &Path) -> CloakfsResult<String> {
        if self.plaintext_names || cipher_path.is_empty() {
            return Ok(cipher_path.to_string());
        }
        let mut wd = root.to_path_buf();
        let mut plain_names = Vec::new();
        for cipher_name in cipher_path.split('/') {
            let iv = read_dir_iv(&wd)?;
            plain_names.push(self.decrypt_name(cipher_name, &iv)?);
            wd.push(cipher_name);
        }
        Ok(plain_names.join("/"))
    }
}

/// Split a relative path into (parent, basename); the parent of a top-level
/// name is the empty string.
fn split_parent(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(idx) => (&path[..idx], &path[idx + 1..]),
        None => ("", path),
    }
}

fn join_path(parent: &str, base: &str) -> String {
    if parent.is_empty() {
        base.to_string()
    } else {
        format!("{parent}/{base}")
    }
}
