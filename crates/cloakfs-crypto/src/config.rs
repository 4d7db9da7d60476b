//! The on-disk key store: `gocryptfs.conf`.
//!
//! A JSON document holding the master key wrapped under a passphrase-derived
//! key, the scrypt parameters used for that derivation, and the feature
//! flags describing the on-disk format. Unlocking: scrypt(passphrase, salt)
//! gives a key-encryption key; the master key is sealed under it as one
//! AES-GCM block (16-byte nonce, AAD of block number zero, no file-id).

use std::fs::{self, File};
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64_STD;
use base64::Engine as _;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zeroize::Zeroize;

use cloakfs_core::{CloakfsError, CloakfsResult};

use crate::aead::{rand_bytes, CryptoCore};
use crate::content::ContentEnc;
use crate::keys::{MasterKey, KEY_LEN};

/// Name of the config file inside the cipher directory. Reserved: hidden
/// from the plaintext view.
pub const CONF_FILENAME: &str = "gocryptfs.conf";

/// On-disk format version this build reads and writes.
const CONF_VERSION: u16 = 2;

/// Default scrypt cost: N = 2^16.
pub const SCRYPT_DEFAULT_LOGN: u8 = 16;

const SCRYPT_SALT_LEN: usize = 32;

/// The key wrap always uses the 128-bit GCM nonce geometry, independent of
/// what the content encryption is configured to.
const KEY_WRAP_IV_LEN: usize = 16;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Optional on-disk behaviors, named by a closed vocabulary of tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureFlag {
    /// Filenames are stored unencrypted.
    PlaintextNames,
    /// Each directory carries an IV sentinel file.
    DirIV,
    /// Filenames are encrypted with EME.
    EMENames,
    /// Content blocks use 128-bit GCM nonces.
    GCMIV128,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ScryptObject {
    #[serde(rename = "Salt")]
    salt: String,
    #[serde(rename = "N")]
    n: u64,
    #[serde(rename = "R")]
    r: u32,
    #[serde(rename = "P")]
    p: u32,
    #[serde(rename = "KeyLen")]
    key_len: u32,
}

impl ScryptObject {
    fn new(logn: u8) -> CloakfsResult<Self> {
        validate_logn(logn)?;
        Ok(Self {
            salt: BASE64_STD.encode(rand_bytes(SCRYPT_SALT_LEN)),
            n: 1u64 << logn,
            r: 8,
            p: 1,
            key_len: KEY_LEN as u32,
        })
    }

    /// Derive the key-encryption key from a passphrase.
    fn derive_kek(&self, passphrase: &SecretString) -> CloakfsResult<MasterKey> {
        if self.key_len as usize != KEY_LEN {
            return Err(CloakfsError::CorruptConfig(format!(
                "scrypt KeyLen {} is not {}",
                self.key_len, KEY_LEN
            )));
        }
        let logn = self.logn()?;
        let salt = BASE64_STD
            .decode(&self.salt)
            .map_err(|e| CloakfsError::CorruptConfig(format!("scrypt salt: {e}")))?;
        let params = scrypt::Params::new(logn, self.r, self.p, KEY_LEN)
            .map_err(|e| CloakfsError::CorruptConfig(format!("scrypt parameters: {e}")))?;

        let mut kek = [0u8; KEY_LEN];
        scrypt::scrypt(
            passphrase.expose_secret().as_bytes(),
            &salt,
            &params,
            &mut kek,
        )
        .map_err(|e| CloakfsError::Crypto(format!("scrypt: {e}")))?;
        let key = MasterKey::from_bytes(kek);
        kek.zeroize();
        Ok(key)
    }

    fn logn(&self) -> CloakfsResult<u8> {
        if !self.n.is_power_of_two() {
            return Err(CloakfsError::CorruptConfig(format!(
                "scrypt N {} is not a power of two",
                self.n
            )));
        }
        let logn = self.n.trailing_zeros() as u8;
        validate_logn(logn)?;
        Ok(logn)
    }
}

fn validate_logn(logn: u8) -> CloakfsResult<()> {
    // Below 10 the KDF is uselessly cheap, above 28 it will not fit in RAM.
    if !(10..=28).contains(&logn) {
        return Err(CloakfsError::CorruptConfig(format!(
            "scrypt logN {logn} outside the supported range [10, 28]"
        )));
    }
    Ok(())
}

/// The parsed config document.
#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(rename = "Creator")]
    creator: String,
    #[serde(rename = "EncryptedKey")]
    encrypted_key: String,
    #[serde(rename = "ScryptObject")]
    scrypt_object: ScryptObject,
    #[serde(rename = "Version")]
    version: u16,
    #[serde(rename = "FeatureFlags")]
    feature_flags: Vec<FeatureFlag>,
}

impl ConfigFile {
    /// Create a brand-new filesystem config at `path`: generate a random
    /// master key, wrap it under the passphrase, and persist. Refuses to
    /// overwrite an existing file.
    pub fn create(
        path: &Path,
        passphrase: &SecretString,
        plaintext_names: bool,
        logn: u8,
    ) -> CloakfsResult<(MasterKey, ConfigFile)> {
        if path.exists() {
            return Err(CloakfsError::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} already exists", path.display()),
            )));
        }
        let feature_flags = if plaintext_names {
            vec![FeatureFlag::PlaintextNames]
        } else {
            vec![
                FeatureFlag::DirIV,
                FeatureFlag::EMENames,
                FeatureFlag::GCMIV128,
            ]
        };
        let master_key = MasterKey::generate();
        let mut config = ConfigFile {
            creator: format!("cloakfs {}", env!("CARGO_PKG_VERSION")),
            encrypted_key: String::new(),
            scrypt_object: ScryptObject::new(logn)?,
            version: CONF_VERSION,
            feature_flags,
        };
        config.encrypt_key(&master_key, passphrase, logn)?;
        config.write(path)?;
        info!(path = %path.display(), "created config");
        Ok((master_key, config))
    }

    /// Load and unlock. An AEAD failure on the wrapped key means the
    /// passphrase is wrong (or the key material corrupt; the message does
    /// not distinguish, to avoid an oracle).
    pub fn load(path: &Path, passphrase: &SecretString) -> CloakfsResult<(MasterKey, ConfigFile)> {
        let config = ConfigFile::load_locked(path)?;
        let master_key = config.unlock(passphrase)?;
        Ok((master_key, config))
    }

    /// Parse and validate the document without touching the passphrase.
    /// Lets the front-end report a missing or unsupported config before
    /// prompting.
    pub fn load_locked(path: &Path) -> CloakfsResult<ConfigFile> {
        let raw = fs::read(path)?;
        let config: ConfigFile = serde_json::from_slice(&raw)
            .map_err(|e| CloakfsError::CorruptConfig(format!("{}: {e}", path.display())))?;
        if config.version != CONF_VERSION {
            return Err(CloakfsError::UnsupportedVersion {
                found: config.version as u64,
                supported: CONF_VERSION as u64,
            });
        }
        config.validate_flags()?;
        Ok(config)
    }

    fn unlock(&self, passphrase: &SecretString) -> CloakfsResult<MasterKey> {
        let kek = self.scrypt_object.derive_kek(passphrase)?;
        let blob = match BASE64_STD.decode(&self.encrypted_key) {
            Ok(blob) => blob,
            Err(e) => {
                debug!(error = %e, "EncryptedKey is not valid base64");
                return Err(CloakfsError::WrongPassword);
            }
        };
        let enc = key_wrap_encoder(&kek)?;
        let mut plain = match enc.decrypt_block(&blob, 0, &[]) {
            Ok(plain) => plain,
            Err(CloakfsError::Auth) => return Err(CloakfsError::WrongPassword),
            Err(other) => return Err(other),
        };
        if plain.len() != KEY_LEN {
            plain.zeroize();
            debug!(len = plain.len(), "unwrapped master key has wrong size");
            return Err(CloakfsError::WrongPassword);
        }
        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(&plain);
        plain.zeroize();
        Ok(MasterKey::from_bytes(bytes))
    }

    /// Re-wrap the master key under a new passphrase with a fresh salt.
    /// The caller persists the result via [`ConfigFile::write`].
    pub fn encrypt_key(
        &mut self,
        master_key: &MasterKey,
        passphrase: &SecretString,
        logn: u8,
    ) -> CloakfsResult<()> {
        self.scrypt_object = ScryptObject::new(logn)?;
        let kek = self.scrypt_object.derive_kek(passphrase)?;
        let enc = key_wrap_encoder(&kek)?;
        let blob = enc.encrypt_block(master_key.as_bytes(), 0, &[])?;
        self.encrypted_key = BASE64_STD.encode(blob);
        Ok(())
    }

    /// Atomic replace: write to a temp file in the same directory, fsync,
    /// rename over the target.
    pub fn write(&self, path: &Path) -> CloakfsResult<()> {
        let parent = path.parent().ok_or_else(|| {
            CloakfsError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "config path has no parent directory",
            ))
        })?;
        let tmp_path = build_tmp_path(parent);
        let mut tmp = File::create(&tmp_path)?;
        let result = (|| -> CloakfsResult<()> {
            let mut doc = serde_json::to_vec_pretty(self)
                .map_err(|e| CloakfsError::CorruptConfig(format!("serializing: {e}")))?;
            doc.push(b'\n');
            tmp.write_all(&doc)?;
            tmp.sync_all()?;
            Ok(())
        })();
        if let Err(err) = result {
            let _ = fs::remove_file(&tmp_path);
            return Err(err);
        }
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    pub fn is_flag_set(&self, flag: FeatureFlag) -> bool {
        self.feature_flags.contains(&flag)
    }

    pub fn creator(&self) -> &str {
        &self.creator
    }

    /// Flag combinations that make no sense are rejected at load time, not
    /// discovered later in the data path.
    fn validate_flags(&self) -> CloakfsResult<()> {
        let plaintext = self.is_flag_set(FeatureFlag::PlaintextNames);
        let diriv = self.is_flag_set(FeatureFlag::DirIV);
        let eme = self.is_flag_set(FeatureFlag::EMENames);
        if plaintext && (diriv || eme) {
            return Err(CloakfsError::CorruptConfig(
                "PlaintextNames excludes DirIV and EMENames".into(),
            ));
        }
        if eme && !diriv {
            return Err(CloakfsError::CorruptConfig(
                "EMENames requires DirIV".into(),
            ));
        }
        Ok(())
    }
}

/// Content encoder used only for wrapping the master key.
fn key_wrap_encoder(kek: &MasterKey) -> CloakfsResult<ContentEnc> {
    Ok(ContentEnc::new(Arc::new(CryptoCore::new(
        kek,
        KEY_WRAP_IV_LEN,
    )?)))
}

fn build_tmp_path(parent: &Path) -> PathBuf {
    let counter = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    parent.join(format!(
        ".{CONF_FILENAME}.tmp-{}-{counter}",
        std::process::id()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Fast KDF for tests; production default is SCRYPT_DEFAULT_LOGN.
    const TEST_LOGN: u8 = 10;

    fn pw(s: &str) -> SecretString {
        SecretString::from(s.to_string())
    }

    #[test]
    fn create_load_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(CONF_FILENAME);

        let (created_key, config) =
            ConfigFile::create(&path, &pw("hunter2"), false, TEST_LOGN).unwrap();
        assert!(config.is_flag_set(FeatureFlag::DirIV));
        assert!(config.is_flag_set(FeatureFlag::EMENames));
        assert!(config.is_flag_set(FeatureFlag::GCMIV128));
        assert!(!config.is_flag_set(FeatureFlag::PlaintextNames));

        let (loaded_key, _) = ConfigFile::load(&path, &pw("hunter2")).unwrap();
        assert_eq!(created_key.as_bytes(), loaded_key.as_bytes());
    }

    #[test]
    fn wrong_password_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(CONF_FILENAME);
        ConfigFile::create(&path, &pw("hunter2"), false, TEST_LOGN).unwrap();

        let err = ConfigFile::load(&path, &pw("hunter3")).unwrap_err();
        assert!(matches!(err, CloakfsError::WrongPassword));
    }

    #[test]
    fn refuses_to_overwrite() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(CONF_FILENAME);
        ConfigFile::create(&path, &pw("a"), false, TEST_LOGN).unwrap();
        assert!(ConfigFile::create(&path, &pw("a"), false, TEST_LOGN).is_err());
    }

    #[test]
    fn plaintext_names_drops_naming_flags() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(CONF_FILENAME);
        let (_, config) = ConfigFile::create(&path, &pw("a"), true, TEST_LOGN).unwrap();
        assert!(config.is_flag_set(FeatureFlag::PlaintextNames));
        assert!(!config.is_flag_set(FeatureFlag::DirIV));
        assert!(!config.is_flag_set(FeatureFlag::EMENames));
    }

    #[test]
    fn password_change() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(CONF_FILENAME);
        let (key, mut config) = ConfigFile::create(&path, &pw("old"), false, TEST_LOGN).unwrap();

        config.encrypt_key(&key, &pw("new"), TEST_LOGN).unwrap();
        config.write(&path).unwrap();

        assert!(matches!(
            ConfigFile::load(&path, &pw("old")).unwrap_err(),
            CloakfsError::WrongPassword
        ));
        let (reloaded, _) = ConfigFile::load(&path, &pw("new")).unwrap();
        assert_eq!(reloaded.as_bytes(), key.as_bytes());
    }

    #[test]
    fn version_mismatch_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(CONF_FILENAME);
        ConfigFile::create(&path, &pw("a"), false, TEST_LOGN).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        let patched = raw.replace("\"Version\": 2", "\"Version\": 3");
        fs::write(&path, patched).unwrap();

        assert!(matches!(
            ConfigFile::load(&path, &pw("a")).unwrap_err(),
            CloakfsError::UnsupportedVersion { found: 3, .. }
        ));
    }

    #[test]
    fn unknown_feature_flag_is_corrupt() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(CONF_FILENAME);
        ConfigFile::create(&path, &pw("a"), false, TEST_LOGN).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        let patched = raw.replace("\"GCMIV128\"", "\"FlagFromTheFuture\"");
        fs::write(&path, patched).unwrap();

        assert!(matches!(
            ConfigFile::load(&path, &pw("a")).unwrap_err(),
            CloakfsError::CorruptConfig(_)
        ));
    }

    #[test]
    fn inconsistent_flags_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(CONF_FILENAME);
        ConfigFile::create(&path, &pw("a"), false, TEST_LOGN).unwrap();

        // EMENames without DirIV.
        let raw = fs::read_to_string(&path).unwrap();
        let patched = raw.replace("\"DirIV\",", "");
        fs::write(&path, patched).unwrap();

        assert!(matches!(
            ConfigFile::load(&path, &pw("a")).unwrap_err(),
            CloakfsError::CorruptConfig(_)
        ));
    }

    #[test]
    fn garbage_document_is_corrupt() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(CONF_FILENAME);
        fs::write(&path, b"{ not json").unwrap();
        assert!(matches!(
            ConfigFile::load(&path, &pw("a")).unwrap_err(),
            CloakfsError::CorruptConfig(_)
        ));
    }

    #[test]
    fn missing_file_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let err = ConfigFile::load(&tmp.path().join(CONF_FILENAME), &pw("a")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn scryptn_out_of_range_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(CONF_FILENAME);
        assert!(ConfigFile::create(&path, &pw("a"), false, 9).is_err());
        assert!(ConfigFile::create(&path, &pw("a"), false, 29).is_err());
    }

    #[test]
    fn document_shape_on_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(CONF_FILENAME);
        ConfigFile::create(&path, &pw("a"), false, TEST_LOGN).unwrap();

        let doc: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(doc["Version"], 2);
        assert!(doc["Creator"].as_str().unwrap().starts_with("cloakfs"));
        assert_eq!(doc["ScryptObject"]["N"], 1024);
        assert_eq!(doc["ScryptObject"]["R"], 8);
        assert_eq!(doc["ScryptObject"]["P"], 1);
        assert_eq!(doc["ScryptObject"]["KeyLen"], 32);
        // nonce (16) + key (32) + tag (16) = 64 bytes wrapped.
        let blob = BASE64_STD
            .decode(doc["EncryptedKey"].as_str().unwrap())
            .unwrap();
        assert_eq!(blob.len(), 64);
    }
}
