//! Content encryption: plaintext byte ranges to authenticated ciphertext
//! blocks and back.
//!
//! Ciphertext file layout:
//! ```text
//! [header: version (2 bytes BE) || file-id (16 bytes)]   -- 18 bytes, iff non-empty
//! [block 0: nonce || ciphertext (<= 4096) || tag (16)]
//! [block 1: ...]
//! ```
//!
//! Block `i` covers plaintext offsets `[i*4096, (i+1)*4096)`. Only the
//! trailing block may be short. Every block draws a fresh random nonce on
//! every write and binds `AAD = block number (8 bytes LE) || file-id`, so a
//! block cannot be moved to another position or another file without the
//! next read failing authentication.

use std::sync::Arc;

use tracing::warn;

use cloakfs_core::{CloakfsError, CloakfsResult};

use crate::aead::{rand_bytes, CryptoCore};
use crate::TAG_LEN;

/// Plaintext block size in bytes.
pub const PLAIN_BS: u64 = 4096;

/// Length of the per-file header: version plus file-id.
pub const HEADER_LEN: usize = 18;

/// On-disk header version this build reads and writes.
pub const HEADER_VERSION: u16 = 2;

/// Length of the per-file id embedded in the header and every block's AAD.
pub const FILE_ID_LEN: usize = 16;

/// The header at the start of every non-empty ciphertext file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileHeader {
    pub id: [u8; FILE_ID_LEN],
}

impl FileHeader {
    /// A header with a fresh random file-id.
    pub fn random() -> Self {
        let mut id = [0u8; FILE_ID_LEN];
        id.copy_from_slice(&rand_bytes(FILE_ID_LEN));
        Self { id }
    }

    pub fn pack(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[..2].copy_from_slice(&HEADER_VERSION.to_be_bytes());
        buf[2..].copy_from_slice(&self.id);
        buf
    }

    pub fn parse(buf: &[u8]) -> CloakfsResult<Self> {
        if buf.len() != HEADER_LEN {
            warn!(len = buf.len(), "file header has wrong length");
            return Err(CloakfsError::Auth);
        }
        let version = u16::from_be_bytes([buf[0], buf[1]]);
        if version != HEADER_VERSION {
            warn!(version, "file header has unknown version");
            return Err(CloakfsError::Auth);
        }
        let mut id = [0u8; FILE_ID_LEN];
        id.copy_from_slice(&buf[2..]);
        Ok(Self { id })
    }
}

/// Per-mount content encoder. Cheap to share; stateless per call.
pub struct ContentEnc {
    core: Arc<CryptoCore>,
    nonce_len: usize,
}

impl ContentEnc {
    pub fn new(core: Arc<CryptoCore>) -> Self {
        let nonce_len = core.iv_len();
        Self { core, nonce_len }
    }

    pub fn plain_bs(&self) -> u64 {
        PLAIN_BS
    }

    /// Size of one full ciphertext block: nonce, payload, tag.
    pub fn cipher_bs(&self) -> u64 {
        (self.nonce_len + TAG_LEN) as u64 + PLAIN_BS
    }

    pub fn nonce_len(&self) -> usize {
        self.nonce_len
    }

    /// Per-block overhead in bytes.
    fn block_overhead(&self) -> u64 {
        (self.nonce_len + TAG_LEN) as u64
    }

    /// Encrypt one plaintext block. `plain` must be non-empty and at most
    /// one block; `file_id` is the per-file id, or empty for the wrapped
    /// master key in the config file.
    pub fn encrypt_block(
        &self,
        plain: &[u8],
        block_no: u64,
        file_id: &[u8],
    ) -> CloakfsResult<Vec<u8>> {
        if plain.is_empty() || plain.len() as u64 > PLAIN_BS {
            return Err(CloakfsError::Crypto(format!(
                "plaintext block of {} bytes is outside (0, {}]",
                plain.len(),
                PLAIN_BS
            )));
        }
        let nonce = self.core.rand_bytes(self.nonce_len);
        let aad = build_aad(block_no, file_id);
        let sealed = self.core.seal(plain, &nonce, &aad)?;

        let mut block = Vec::with_capacity(self.nonce_len + sealed.len());
        block.extend_from_slice(&nonce);
        block.extend_from_slice(&sealed);
        Ok(block)
    }

    /// Decrypt one ciphertext block (`nonce || ct || tag`). Short input and
    /// tag mismatch are both [`CloakfsError::Auth`].
    pub fn decrypt_block(
        &self,
        block: &[u8],
        block_no: u64,
        file_id: &[u8],
    ) -> CloakfsResult<Vec<u8>> {
        if block.len() <= self.nonce_len + TAG_LEN {
            warn!(
                len = block.len(),
                block_no, "ciphertext block too short to authenticate"
            );
            return Err(CloakfsError::Auth);
        }
        let (nonce, sealed) = block.split_at(self.nonce_len);
        let aad = build_aad(block_no, file_id);
        self.core.open(sealed, nonce, &aad)
    }

    // ── Range math ────────────────────────────────────────────────────────

    /// Block number containing plaintext offset `off`.
    pub fn block_no_at(&self, off: u64) -> u64 {
        off / PLAIN_BS
    }

    /// Inclusive block range covering `len` bytes from `off`. `len` must be
    /// non-zero.
    pub fn block_span(&self, off: u64, len: u64) -> (u64, u64) {
        debug_assert!(len > 0);
        (off / PLAIN_BS, (off + len - 1) / PLAIN_BS)
    }

    /// Ciphertext file offset of block `block_no`, header included.
    pub fn block_cipher_off(&self, block_no: u64) -> u64 {
        HEADER_LEN as u64 + block_no * self.cipher_bs()
    }

    /// Plaintext offset where block `block_no` begins.
    pub fn block_plain_off(&self, block_no: u64) -> u64 {
        block_no * PLAIN_BS
    }

    /// Ciphertext file size for a given plaintext size. Zero stays zero; the
    /// header only exists for non-empty files.
    pub fn plain_size_to_cipher_size(&self, size: u64) -> u64 {
        if size == 0 {
            return 0;
        }
        let blocks = size.div_ceil(PLAIN_BS);
        HEADER_LEN as u64 + blocks * self.block_overhead() + size
    }

    /// Plaintext size for a given ciphertext file size. Impossible sizes
    /// (nothing but a header, or a trailing fragment smaller than the block
    /// overhead) are reported as the largest consistent plaintext, with a
    /// warning.
    pub fn cipher_size_to_plain_size(&self, size: u64) -> u64 {
        if size == 0 {
            return 0;
        }
        if size <= HEADER_LEN as u64 {
            warn!(size, "ciphertext file smaller than its header");
            return 0;
        }
        let body = size - HEADER_LEN as u64;
        let blocks = body.div_ceil(self.cipher_bs());
        let overhead = blocks * self.block_overhead();
        if body <= overhead {
            warn!(size, "ciphertext file size is not consistent with any plaintext size");
            return 0;
        }
        body - overhead
    }
}

/// AAD: block number (8 bytes little-endian) followed by the file-id.
fn build_aad(block_no: u64, file_id: &[u8]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(8 + file_id.len());
    aad.extend_from_slice(&block_no.to_le_bytes());
    aad.extend_from_slice(file_id);
    aad
}
