//! cloakfs-crypto: the cryptographic data path of cloakfs.
//!
//! On-disk picture:
//! ```text
//! CIPHERDIR/
//!   gocryptfs.conf          master key wrapped under a passphrase (scrypt + AES-GCM)
//!   gocryptfs.diriv         16-byte IV, one per directory (filename encryption tweak)
//!   <encrypted names>       base64url(EME(dirIV, pkcs7-pad16(plain name)))
//!     └─ file content:      [18-byte header][nonce||ct||tag][nonce||ct||tag]...
//! ```
//!
//! Key usage:
//! ```text
//! Master Key (256-bit, random; wrapped via scrypt-derived KEK in the config)
//!   ├── AES-256-GCM: file content blocks and the wrapped key itself
//!   └── EME (AES-256): filenames, tweaked by the parent directory IV
//! ```

pub mod aead;
pub mod config;
pub mod content;
pub mod diriv;
pub mod eme;
pub mod keys;
pub mod names;

pub use aead::CryptoCore;
pub use config::{ConfigFile, FeatureFlag, CONF_FILENAME};
pub use content::{ContentEnc, FileHeader};
pub use diriv::{read_dir_iv, write_dir_iv, DIRIV_FILENAME, DIRIV_LEN};
pub use eme::EmeCipher;
pub use keys::{MasterKey, KEY_LEN};
pub use names::NameTransform;

/// AES-GCM authentication tag length in bytes.
pub const TAG_LEN: usize = 16;
