use std::path::PathBuf;

use thiserror::Error;

pub type CloakfsResult<T> = Result<T, CloakfsError>;

#[derive(Debug, Error)]
pub enum CloakfsError {
    /// AEAD tag mismatch, or ciphertext too short to contain nonce and tag.
    /// Deterministic: never retried.
    #[error("ciphertext failed authentication")]
    Auth,

    /// An encrypted filename that does not decode, decrypt or unpad.
    /// Such entries are hidden from directory listings, not deleted.
    #[error("invalid encrypted name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },

    /// The directory exists but its IV sentinel is missing or malformed.
    #[error("directory IV in {dir:?} is missing or malformed")]
    CorruptDirIv { dir: PathBuf },

    /// Key unwrap failed. Deliberately does not say whether the config
    /// was corrupt or the passphrase wrong.
    #[error("password incorrect or config file corrupt")]
    WrongPassword,

    #[error("config error: {0}")]
    CorruptConfig(String),

    #[error("unsupported on-disk format version {found} (this build supports {supported})")]
    UnsupportedVersion { found: u64, supported: u64 },

    /// Bad parameters or internal failure in a cryptographic primitive.
    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CloakfsError {
    /// The errno the kernel adapter reports for this error.
    pub fn errno(&self) -> i32 {
        match self {
            CloakfsError::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            // Cryptographic and format failures all surface as EIO; the
            // distinction only matters in the logs.
            CloakfsError::Auth
            | CloakfsError::InvalidName { .. }
            | CloakfsError::CorruptDirIv { .. }
            | CloakfsError::CorruptConfig(_)
            | CloakfsError::UnsupportedVersion { .. }
            | CloakfsError::Crypto(_) => libc::EIO,
            CloakfsError::WrongPassword => libc::EACCES,
        }
    }

    /// True for the benign "no such file or directory" case.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CloakfsError::Io(err) if err.kind() == std::io::ErrorKind::NotFound)
    }
}
