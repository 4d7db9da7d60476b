//! Master key handling.

use rand::{rngs::OsRng, RngCore};
use zeroize::Zeroize;

use cloakfs_core::{CloakfsError, CloakfsResult};

/// Size of the master key in bytes (AES-256).
pub const KEY_LEN: usize = 32;

/// The 32-byte secret every content and name encryption operation is keyed
/// from. Derived once at mount (from the config file or supplied explicitly)
/// and held for the lifetime of the mount.
///
/// Zeroized on drop so the key does not linger in freed memory.
#[derive(Clone)]
pub struct MasterKey {
    bytes: [u8; KEY_LEN],
}

impl MasterKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }

    /// Generate a fresh random master key from OS entropy.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// The all-zero key. Only useful for testing a mount without a config file.
    pub fn zero() -> Self {
        Self {
            bytes: [0u8; KEY_LEN],
        }
    }

    /// Parse a key from hex. Dashes are accepted as group separators, so the
    /// output of [`MasterKey::to_hex`] round-trips.
    pub fn from_hex(s: &str) -> CloakfsResult<Self> {
        let compact: String = s.chars().filter(|&c| c != '-').collect();
        if compact.len() != KEY_LEN * 2 {
            return Err(CloakfsError::Crypto(format!(
                "master key must be {} hex digits, got {}",
                KEY_LEN * 2,
                compact.len()
            )));
        }
        let mut bytes = [0u8; KEY_LEN];
        for (i, chunk) in compact.as_bytes().chunks(2).enumerate() {
            let hi = hex_digit(chunk[0])?;
            let lo = hex_digit(chunk[1])?;
            bytes[i] = hi << 4 | lo;
        }
        Ok(Self { bytes })
    }

    /// Format as hex in groups of four bytes, the way `init` prints it for
    /// emergency recovery.
    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(KEY_LEN * 2 + 7);
        for (i, group) in self.bytes.chunks(4).enumerate() {
            if i > 0 {
                out.push('-');
            }
            for byte in group {
                out.push_str(&format!("{:02x}", byte));
            }
        }
        out
    }
}

fn hex_digit(c: u8) -> CloakfsResult<u8> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(CloakfsError::Crypto(format!(
            "invalid hex digit {:?} in master key",
            c as char
        ))),
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}
