//! The frontend proper: plaintext-view operations over the cipher directory.

use std::ffi::CString;
use std::fs::{self, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use tracing::{debug, warn};

use cloakfs_core::{CloakfsError, CloakfsResult};
use cloakfs_crypto::{
    read_dir_iv, write_dir_iv, ConfigFile, ContentEnc, CryptoCore, FeatureFlag, MasterKey,
    NameTransform, CONF_FILENAME, DIRIV_FILENAME,
};

use crate::file::{CryptFile, FileTable};

static RMDIR_COUNTER: AtomicU64 = AtomicU64::new(0);

/// On-disk behavior switches the frontend needs, extracted from the config.
#[derive(Debug, Clone, Copy)]
pub struct MountConfig {
    pub plaintext_names: bool,
    pub gcm_iv128: bool,
}

impl MountConfig {
    pub fn from_config(config: &ConfigFile) -> Self {
        Self {
            plaintext_names: config.is_flag_set(FeatureFlag::PlaintextNames),
            gcm_iv128: config.is_flag_set(FeatureFlag::GCMIV128),
        }
    }
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            plaintext_names: false,
            gcm_iv128: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Dir,
    Symlink,
    Other,
}

/// Stat result with the size already translated to the plaintext view.
#[derive(Debug, Clone)]
pub struct Attr {
    pub kind: FileKind,
    pub size: u64,
    pub blocks: u64,
    pub perm: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub kind: FileKind,
}

/// The mounted filesystem: one per cipher directory.
pub struct CryptFs {
    root: PathBuf,
    names: NameTransform,
    content: ContentEnc,
    files: FileTable,
}

impl CryptFs {
    pub fn new(
        cipherdir: impl Into<PathBuf>,
        master_key: &MasterKey,
        config: MountConfig,
    ) -> CloakfsResult<Self> {
        let root = cipherdir.into();
        if !root.is_dir() {
            return Err(CloakfsError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("cipher directory {} is not a directory", root.display()),
            )));
        }
        let iv_len = if config.gcm_iv128 { 16 } else { 12 };
        let core = Arc::new(CryptoCore::new(master_key, iv_len)?);
        let names = NameTransform::new(core.clone(), config.plaintext_names);
        let content = ContentEnc::new(core);
        Ok(Self {
            root,
            names,
            content,
            files: FileTable::new(),
        })
    }

    pub fn content(&self) -> &ContentEnc {
        &self.content
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The absolute ciphertext path for a relative plaintext path
    /// (`""` is the root). Public because tooling and tests need to locate
    /// the backing file.
    pub fn cipher_path(&self, plain_path: &str) -> CloakfsResult<PathBuf> {
        self.check_addressable(plain_path)?;
        let rel = self.names.encrypt_path(plain_path, &self.root)?;
        if rel.is_empty() {
            Ok(self.root.clone())
        } else {
            Ok(self.root.join(rel))
        }
    }

    /// Reserved names must stay invisible: the config at the root, and the
    /// directory IV sentinels when names are not encrypted (with encrypted
    /// names a plaintext component can never collide with them).
    fn check_addressable(&self, plain_path: &str) -> CloakfsResult<()> {
        if plain_path.is_empty() {
            return Ok(());
        }
        for component in plain_path.split('/') {
            if component.is_empty() || component == "." || component == ".." {
                return Err(CloakfsError::Io(io::Error::from_raw_os_error(
                    libc::EINVAL,
                )));
            }
        }
        if self.names.plaintext_names() {
            let first = plain_path.split('/').next().unwrap_or("");
            if first == CONF_FILENAME {
                return Err(CloakfsError::Io(io::Error::from_raw_os_error(
                    libc::EACCES,
                )));
            }
            if plain_path.split('/').any(|c| c == DIRIV_FILENAME) {
                return Err(CloakfsError::Io(io::Error::from_raw_os_error(
                    libc::EACCES,
                )));
            }
        }
        Ok(())
    }

    // ── Metadata ─────────────────────────────────────────────────────────

    pub fn getattr(&self, plain_path: &str) -> CloakfsResult<Attr> {
        let cpath = self.cipher_path(plain_path)?;
        let md = fs::symlink_metadata(&cpath)?;
        Ok(self.attr_from_metadata(&md))
    }

    fn attr_from_metadata(&self, md: &fs::Metadata) -> Attr {
        let kind = if md.is_dir() {
            FileKind::Dir
        } else if md.is_file() {
            FileKind::File
        } else if md.file_type().is_symlink() {
            FileKind::Symlink
        } else {
            FileKind::Other
        };
        let size = match kind {
            FileKind::File => self.content.cipher_size_to_plain_size(md.len()),
            _ => md.len(),
        };
        Attr {
            kind,
            size,
            blocks: size.div_ceil(512),
            perm: md.permissions().mode() & 0o7777,
            nlink: md.nlink() as u32,
            uid: md.uid(),
            gid: md.gid(),
            rdev: md.rdev() as u32,
            atime: md.accessed().unwrap_or(SystemTime::UNIX_EPOCH),
            mtime: md.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            ctime: SystemTime::UNIX_EPOCH + std::time::Duration::new(
                md.ctime().max(0) as u64,
                md.ctime_nsec().max(0) as u32,
            ),
        }
    }

    pub fn chmod(&self, plain_path: &str, mode: u32) -> CloakfsResult<()> {
        let cpath = self.cipher_path(plain_path)?;
        fs::set_permissions(&cpath, fs::Permissions::from_mode(mode))?;
        Ok(())
    }

    pub fn chown(&self, plain_path: &str, uid: Option<u32>, gid: Option<u32>) -> CloakfsResult<()> {
        let cpath = self.cipher_path(plain_path)?;
        let cstr = path_cstring(&cpath)?;
        let rc = unsafe {
            libc::chown(
                cstr.as_ptr(),
                uid.unwrap_or(u32::MAX),
                gid.unwrap_or(u32::MAX),
            )
        };
        if rc != 0 {
            return Err(CloakfsError::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Set access and modification times; `None` leaves a time untouched.
    pub fn utimens(
        &self,
        plain_path: &str,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> CloakfsResult<()> {
        let cpath = self.cipher_path(plain_path)?;
        let cstr = path_cstring(&cpath)?;
        let times = [to_timespec(atime), to_timespec(mtime)];
        let rc = unsafe { libc::utimensat(libc::AT_FDCWD, cstr.as_ptr(), times.as_ptr(), 0) };
        if rc != 0 {
            return Err(CloakfsError::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    // ── File I/O ─────────────────────────────────────────────────────────

    /// Create a new file and return its handle. Fails if it already exists.
    pub fn create(&self, plain_path: &str, mode: u32) -> CloakfsResult<Arc<CryptFile>> {
        let cpath = self.cipher_path(plain_path)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(mode)
            .open(&cpath)?;
        self.files.register(file, true)
    }

    /// Open an existing file. Handles on the same inode share state, so
    /// concurrent writers cannot tear a block.
    pub fn open(&self, plain_path: &str, write: bool) -> CloakfsResult<Arc<CryptFile>> {
        let cpath = self.cipher_path(plain_path)?;
        let file = OpenOptions::new().read(true).write(write).open(&cpath)?;
        self.files.register(file, write)
    }

    pub fn read(&self, file: &CryptFile, offset: u64, len: usize) -> CloakfsResult<Vec<u8>> {
        file.read(&self.content, offset, len)
    }

    pub fn write(&self, file: &CryptFile, offset: u64, data: &[u8]) -> CloakfsResult<usize> {
        file.write(&self.content, offset, data)
    }

    pub fn truncate(&self, file: &CryptFile, size: u64) -> CloakfsResult<()> {
        file.truncate(&self.content, size)
    }

    /// Truncate by path, for `setattr` without an open handle.
    pub fn truncate_path(&self, plain_path: &str, size: u64) -> CloakfsResult<()> {
        let file = self.open(plain_path, true)?;
        file.truncate(&self.content, size)
    }

    pub fn unlink(&self, plain_path: &str) -> CloakfsResult<()> {
        let cpath = self.cipher_path(plain_path)?;
        fs::remove_file(&cpath)?;
        Ok(())
    }

    // ── Directories ──────────────────────────────────────────────────────

    /// Create a directory and give it a fresh IV. If the IV cannot be
    /// written, the half-created directory is removed again.
    pub fn mkdir(&self, plain_path: &str, mode: u32) -> CloakfsResult<()> {
        let cpath = self.cipher_path(plain_path)?;
        fs::DirBuilder::new().mode(mode).create(&cpath)?;
        if !self.names.plaintext_names() {
            if let Err(err) = write_dir_iv(&cpath) {
                warn!(path = %cpath.display(), error = %err, "rolling back directory creation");
                let _ = fs::remove_dir(&cpath);
                return Err(err);
            }
        }
        self.names.clear_cache();
        Ok(())
    }

    /// Remove an empty directory. The IV sentinel does not count as content,
    /// but it must survive a failed removal, so it is moved aside first and
    /// restored if the rmdir fails.
    pub fn rmdir(&self, plain_path: &str) -> CloakfsResult<()> {
        if plain_path.is_empty() {
            return Err(CloakfsError::Io(io::Error::from_raw_os_error(libc::EBUSY)));
        }
        let cpath = self.cipher_path(plain_path)?;
        if self.names.plaintext_names() {
            fs::remove_dir(&cpath)?;
            self.names.clear_cache();
            return Ok(());
        }

        for entry in fs::read_dir(&cpath)? {
            let entry = entry?;
            if entry.file_name() != DIRIV_FILENAME {
                return Err(CloakfsError::Io(io::Error::from_raw_os_error(
                    libc::ENOTEMPTY,
                )));
            }
        }

        let parent = cpath
            .parent()
            .ok_or_else(|| CloakfsError::Io(io::Error::from_raw_os_error(libc::EINVAL)))?;
        let tmp = parent.join(format!(
            ".{DIRIV_FILENAME}.rmdir-{}-{}",
            std::process::id(),
            RMDIR_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let sentinel = cpath.join(DIRIV_FILENAME);
        match fs::rename(&sentinel, &tmp) {
            Ok(()) => {}
            // Already missing: the directory is corrupt but empty, remove it.
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => {
                fs::remove_dir(&cpath)?;
                self.names.clear_cache();
                return Ok(());
            }
            Err(e) => return Err(CloakfsError::Io(e)),
        }
        match fs::remove_dir(&cpath) {
            Ok(()) => {
                let _ = fs::remove_file(&tmp);
                self.names.clear_cache();
                Ok(())
            }
            Err(err) => {
                if let Err(restore) = fs::rename(&tmp, &sentinel) {
                    warn!(
                        dir = %cpath.display(),
                        error = %restore,
                        "could not restore directory IV after failed rmdir"
                    );
                }
                Err(CloakfsError::Io(err))
            }
        }
    }

    /// List a directory in the plaintext view. The config and IV sentinel
    /// files are skipped; entries whose names do not decrypt are hidden with
    /// a warning (they may belong to another filesystem or be corrupt).
    pub fn readdir(&self, plain_path: &str) -> CloakfsResult<Vec<DirEntry>> {
        let cdir = self.cipher_path(plain_path)?;
        let at_root = plain_path.is_empty();
        let iv = if self.names.plaintext_names() {
            None
        } else {
            Some(read_dir_iv(&cdir)?)
        };

        let mut entries = Vec::new();
        for entry in fs::read_dir(&cdir)? {
            let entry = entry?;
            let cipher_name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(raw) => {
                    warn!(name = ?raw, "skipping non-UTF-8 name in cipher directory");
                    continue;
                }
            };
            if cipher_name == DIRIV_FILENAME || (at_root && cipher_name == CONF_FILENAME) {
                continue;
            }
            let name = match &iv {
                None => cipher_name,
                Some(iv) => match self.names.decrypt_name(&cipher_name, iv) {
                    Ok(name) => name,
                    Err(err) => {
                        warn!(name = %cipher_name, error = %err, "hiding undecryptable entry");
                        continue;
                    }
                },
            };
            let kind = match entry.file_type() {
                Ok(ft) if ft.is_dir() => FileKind::Dir,
                Ok(ft) if ft.is_file() => FileKind::File,
                Ok(ft) if ft.is_symlink() => FileKind::Symlink,
                _ => FileKind::Other,
            };
            entries.push(DirEntry { name, kind });
        }
        Ok(entries)
    }

    /// Rename a file or directory. The IV cache is cleared on both sides of
    /// the operation: entries resolved mid-rename must not survive, or a
    /// later lookup could land in the wrong ciphertext directory.
    pub fn rename(&self, old_path: &str, new_path: &str) -> CloakfsResult<()> {
        if old_path.is_empty() || new_path.is_empty() {
            return Err(CloakfsError::Io(io::Error::from_raw_os_error(libc::EBUSY)));
        }
        self.names.clear_cache();
        let old_cpath = self.cipher_path(old_path)?;
        let new_cpath = self.cipher_path(new_path)?;
        debug!(from = %old_cpath.display(), to = %new_cpath.display(), "rename");
        let result = fs::rename(&old_cpath, &new_cpath);
        self.names.clear_cache();
        result?;
        Ok(())
    }

    pub fn fsync(&self, file: &CryptFile, datasync: bool) -> CloakfsResult<()> {
        file.fsync(datasync)
    }

    /// Filesystem statistics of the backing store, sizes left untranslated.
    pub fn statfs(&self) -> CloakfsResult<libc::statvfs> {
        let cstr = path_cstring(&self.root)?;
        let mut st: libc::statvfs = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::statvfs(cstr.as_ptr(), &mut st) };
        if rc != 0 {
            return Err(CloakfsError::Io(io::Error::last_os_error()));
        }
        Ok(st)
    }
}

fn path_cstring(path: &Path) -> CloakfsResult<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| CloakfsError::Io(io::Error::from_raw_os_error(libc::EINVAL)))
}

fn to_timespec(time: Option<SystemTime>) -> libc::timespec {
    match time {
        None => libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_OMIT,
        },
        Some(t) => {
            let dur = t
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default();
            libc::timespec {
                tv_sec: dur.as_secs() as libc::time_t,
                tv_nsec: dur.subsec_nanos() as _,
            }
        }
    }
}
