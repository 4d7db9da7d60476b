//! Per-directory IVs: the `gocryptfs.diriv` sentinel file and its cache.
//!
//! Every ciphertext directory carries a 16-byte random IV in a 0444 sentinel
//! file, written once at directory creation and never rotated. The IV tweaks
//! filename encryption, so equal plaintext names in different directories
//! produce unrelated ciphertext names.

use std::fs;
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::RwLock;

use tracing::{debug, warn};

use cloakfs_core::{CloakfsError, CloakfsResult};

use crate::aead::rand_bytes;

/// Name of the sentinel file. Reserved: never exposed in the plaintext view.
pub const DIRIV_FILENAME: &str = "gocryptfs.diriv";

/// Length of a directory IV, identical to the AES block size.
pub const DIRIV_LEN: usize = 16;

/// Read the directory IV from `dir` (an absolute ciphertext path).
///
/// If the directory itself has vanished this returns the plain not-found
/// error silently: it is a normal race with a concurrent removal. If the
/// directory exists but the sentinel is missing or has the wrong size, the
/// directory is corrupt and a warning is logged.
pub fn read_dir_iv(dir: &Path) -> CloakfsResult<[u8; DIRIV_LEN]> {
    let ivfile = dir.join(DIRIV_FILENAME);
    debug!(path = %ivfile.display(), "reading directory IV");
    match fs::read(&ivfile) {
        Ok(buf) if buf.len() == DIRIV_LEN => {
            let mut iv = [0u8; DIRIV_LEN];
            iv.copy_from_slice(&buf);
            Ok(iv)
        }
        Ok(buf) => {
            warn!(
                path = %ivfile.display(),
                len = buf.len(),
                "directory IV has invalid length"
            );
            Err(CloakfsError::CorruptDirIv { dir: dir.to_path_buf() })
        }
        Err(read_err) => {
            match fs::metadata(dir) {
                Err(stat_err) if stat_err.kind() == io::ErrorKind::NotFound => {
                    // Deleted or moved under our feet; not an error worth noise.
                    debug!(path = %dir.display(), "directory vanished while reading its IV");
                    Err(CloakfsError::Io(read_err))
                }
                _ => {
                    warn!(
                        path = %dir.display(),
                        error = %read_err,
                        "directory exists but its IV sentinel is unreadable"
                    );
                    Err(CloakfsError::CorruptDirIv { dir: dir.to_path_buf() })
                }
            }
        }
    }
}

/// Create a fresh directory IV inside `dir`. Called right after the
/// ciphertext directory is created; on failure the caller removes the
/// half-created directory again.
pub fn write_dir_iv(dir: &Path) -> CloakfsResult<()> {
    let iv = rand_bytes(DIRIV_LEN);
    let ivfile = dir.join(DIRIV_FILENAME);
    // 0444: the IV is not secret but must not be rewritten.
    let mut opts = fs::OpenOptions::new();
    opts.write(true).create_new(true).mode(0o444);
    let mut file = opts.open(&ivfile)?;
    io::Write::write_all(&mut file, &iv)?;
    Ok(())
}

struct CacheEntry {
    plain_dir: String,
    iv: [u8; DIRIV_LEN],
    cipher_dir: String,
}

/// A single-slot cache mapping one plaintext parent directory to its IV and
/// ciphertext path.
///
/// One slot is enough: filesystem calls arrive in bursts against the same
/// directory. Readers take the shared lock; `store` and `clear` take the
/// exclusive lock. Every operation that can change directory identity must
/// clear it — a missed invalidation can route a lookup into the wrong
/// ciphertext directory.
pub(crate) struct DirIvCache {
    slot: RwLock<Option<CacheEntry>>,
}

impl DirIvCache {
    pub(crate) fn new() -> Self {
        Self {
            slot: RwLock::new(None),
        }
    }

    pub(crate) fn lookup(&self, plain_dir: &str) -> Option<([u8; DIRIV_LEN], String)> {
        let slot = self.slot.read().unwrap();
        match slot.as_ref() {
            Some(entry) if entry.plain_dir == plain_dir => {
                Some((entry.iv, entry.cipher_dir.clone()))
            }
            _ => None,
        }
    }

    pub(crate) fn store(&self, plain_dir: &str, iv: &[u8; DIRIV_LEN], cipher_dir: &str) {
        let mut slot = self.slot.write().unwrap();
        *slot = Some(CacheEntry {
            plain_dir: plain_dir.to_string(),
            iv: *iv,
            cipher_dir: cipher_dir.to_string(),
        });
    }

    pub(crate) fn clear(&self) {
        let mut slot = self.slot.write().unwrap();
        *slot = None;
    }
}
