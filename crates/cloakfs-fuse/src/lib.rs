//! FUSE adapter: exposes a [`cloakfs_fs::CryptFs`] as a kernel mount.
//!
//! Pure message plumbing — every operation converts the kernel's view
//! (paths, offsets, modes) into a frontend call and maps errors to errnos.
//! The cryptography lives below the frontend; nothing here touches keys.

#[cfg(feature = "fuse")]
mod inner {
    use std::collections::HashMap;
    use std::ffi::OsStr;
    use std::num::NonZeroU32;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, SystemTime};

    use bytes::Bytes;
    use fuse3::path::prelude::*;
    use fuse3::{Errno, FileType, MountOptions, Timestamp};
    use futures_util::stream;
    use tokio::sync::Mutex;
    use tracing::{debug, info, warn};

    use cloakfs_core::CloakfsError;
    use cloakfs_fs::{Attr, CryptFile, CryptFs, FileKind};

    /// TTL for kernel dentry/attr cache entries. Short, because the backing
    /// directory can change underneath a live mount.
    const ATTR_TTL: Duration = Duration::from_secs(1);

    fn errno(err: CloakfsError) -> Errno {
        Errno::from(err.errno())
    }

    fn kind_to_file_type(kind: FileKind) -> FileType {
        match kind {
            FileKind::File => FileType::RegularFile,
            FileKind::Dir => FileType::Directory,
            FileKind::Symlink => FileType::Symlink,
            FileKind::Other => FileType::NamedPipe,
        }
    }

    fn attr_to_fuse(attr: &Attr) -> FileAttr {
        FileAttr {
            size: attr.size,
            blocks: attr.blocks,
            atime: attr.atime.into(),
            mtime: attr.mtime.into(),
            ctime: attr.ctime.into(),
            #[cfg(target_os = "macos")]
            crtime: attr.ctime.into(),
            kind: kind_to_file_type(attr.kind),
            perm: (attr.perm & 0o7777) as u16,
            nlink: attr.nlink,
            uid: attr.uid,
            gid: attr.gid,
            rdev: attr.rdev,
            blksize: 4096,
            #[cfg(target_os = "macos")]
            flags: 0,
        }
    }

    fn ts_to_system(ts: Timestamp) -> Option<SystemTime> {
        if ts.sec < 0 {
            return None;
        }
        Some(SystemTime::UNIX_EPOCH + Duration::new(ts.sec as u64, ts.nsec))
    }

    /// Kernel path (`/a/b`) to the frontend's relative form (`a/b`).
    fn rel(path: &OsStr) -> fuse3::Result<String> {
        let s = path.to_str().ok_or_else(|| Errno::from(libc::EINVAL))?;
        Ok(s.trim_matches('/').to_string())
    }

    fn rel_join(parent: &OsStr, name: &OsStr) -> fuse3::Result<String> {
        let parent = rel(parent)?;
        let name = name.to_str().ok_or_else(|| Errno::from(libc::EINVAL))?;
        if parent.is_empty() {
            Ok(name.to_string())
        } else {
            Ok(format!("{parent}/{name}"))
        }
    }

    /// The FUSE driver: a handle table in front of the frontend.
    pub struct CloakFuseFs {
        fs: Arc<CryptFs>,
        handles: Mutex<HashMap<u64, Arc<CryptFile>>>,
        next_fh: AtomicU64,
    }

    impl CloakFuseFs {
        pub fn new(fs: Arc<CryptFs>) -> Self {
            Self {
                fs,
                handles: Mutex::new(HashMap::new()),
                next_fh: AtomicU64::new(1),
            }
        }

        async fn stash(&self, file: Arc<CryptFile>) -> u64 {
            let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
            self.handles.lock().await.insert(fh, file);
            fh
        }

        async fn handle(&self, fh: u64) -> fuse3::Result<Arc<CryptFile>> {
            self.handles
                .lock()
                .await
                .get(&fh)
                .cloned()
                .ok_or_else(|| Errno::from(libc::EBADF))
        }

        fn getattr_reply(&self, path: &str) -> fuse3::Result<ReplyAttr> {
            let attr = self.fs.getattr(path).map_err(errno)?;
            Ok(ReplyAttr {
                ttl: ATTR_TTL,
                attr: attr_to_fuse(&attr),
            })
        }

        fn entry_reply(&self, path: &str) -> fuse3::Result<ReplyEntry> {
            let attr = self.fs.getattr(path).map_err(errno)?;
            Ok(ReplyEntry {
                ttl: ATTR_TTL,
                attr: attr_to_fuse(&attr),
            })
        }
    }

    impl PathFilesystem for CloakFuseFs {
        async fn init(&self, _req: Request) -> fuse3::Result<ReplyInit> {
            // Mode bits coming from the kernel are applied verbatim.
            unsafe { libc::umask(0) };
            debug!("cloakfs mounted");
            Ok(ReplyInit {
                max_write: NonZeroU32::new(128 * 1024).unwrap(),
            })
        }

        async fn destroy(&self, _req: Request) {
            info!("cloakfs unmounted");
        }

        async fn getattr(
            &self,
            _req: Request,
            path: Option<&OsStr>,
            _fh: Option<u64>,
            _flags: u32,
        ) -> fuse3::Result<ReplyAttr> {
            let path = path.ok_or_else(|| Errno::from(libc::ENOENT))?;
            self.getattr_reply(&rel(path)?)
        }

        async fn lookup(
            &self,
            _req: Request,
            parent: &OsStr,
            name: &OsStr,
        ) -> fuse3::Result<ReplyEntry> {
            self.entry_reply(&rel_join(parent, name)?)
        }

        async fn setattr(
            &self,
            _req: Request,
            path: Option<&OsStr>,
            fh: Option<u64>,
            set_attr: SetAttr,
        ) -> fuse3::Result<ReplyAttr> {
            let path = path.ok_or_else(|| Errno::from(libc::ENOENT))?;
            let path = rel(path)?;

            if let Some(size) = set_attr.size {
                match fh {
                    Some(fh) => {
                        let file = self.handle(fh).await?;
                        self.fs.truncate(&file, size).map_err(errno)?;
                    }
                    None => self.fs.truncate_path(&path, size).map_err(errno)?,
                }
            }
            if let Some(mode) = set_attr.mode {
                self.fs.chmod(&path, mode).map_err(errno)?;
            }
            if set_attr.uid.is_some() || set_attr.gid.is_some() {
                self.fs
                    .chown(&path, set_attr.uid, set_attr.gid)
                    .map_err(errno)?;
            }
            if set_attr.atime.is_some() || set_attr.mtime.is_some() {
                let atime = set_attr.atime.and_then(ts_to_system);
                let mtime = set_attr.mtime.and_then(ts_to_system);
                self.fs.utimens(&path, atime, mtime).map_err(errno)?;
            }
            self.getattr_reply(&path)
        }

        async fn mkdir(
            &self,
            _req: Request,
            parent: &OsStr,
            name: &OsStr,
            mode: u32,
            _umask: u32,
        ) -> fuse3::Result<ReplyEntry> {
            let path = rel_join(parent, name)?;
            self.fs.mkdir(&path, mode).map_err(errno)?;
            self.entry_reply(&path)
        }

        async fn rmdir(&self, _req: Request, parent: &OsStr, name: &OsStr) -> fuse3::Result<()> {
            self.fs.rmdir(&rel_join(parent, name)?).map_err(errno)
        }

        async fn unlink(&self, _req: Request, parent: &OsStr, name: &OsStr) -> fuse3::Result<()> {
            self.fs.unlink(&rel_join(parent, name)?).map_err(errno)
        }

        async fn rename(
            &self,
            _req: Request,
            origin_parent: &OsStr,
            origin_name: &OsStr,
            parent: &OsStr,
            name: &OsStr,
        ) -> fuse3::Result<()> {
            let old = rel_join(origin_parent, origin_name)?;
            let new = rel_join(parent, name)?;
            self.fs.rename(&old, &new).map_err(errno)
        }

        async fn create(
            &self,
            _req: Request,
            parent: &OsStr,
            name: &OsStr,
            mode: u32,
            flags: u32,
        ) -> fuse3::Result<ReplyCreated> {
            let path = rel_join(parent, name)?;
            let file = self.fs.create(&path, mode & 0o7777).map_err(errno)?;
            let fh = self.stash(file).await;
            let attr = self.fs.getattr(&path).map_err(errno)?;
            Ok(ReplyCreated {
                ttl: ATTR_TTL,
                attr: attr_to_fuse(&attr),
                generation: 0,
                fh,
                flags,
            })
        }

        async fn open(&self, _req: Request, path: &OsStr, flags: u32) -> fuse3::Result<ReplyOpen> {
            let path = rel(path)?;
            let write = (flags as i32 & libc::O_ACCMODE) != libc::O_RDONLY;
            let file = self.fs.open(&path, write).map_err(errno)?;
            if flags as i32 & libc::O_TRUNC != 0 {
                self.fs.truncate(&file, 0).map_err(errno)?;
            }
            let fh = self.stash(file).await;
            Ok(ReplyOpen { fh, flags: 0 })
        }

        async fn read(
            &self,
            _req: Request,
            _path: Option<&OsStr>,
            fh: u64,
            offset: u64,
            size: u32,
        ) -> fuse3::Result<ReplyData> {
            let file = self.handle(fh).await?;
            let data = self.fs.read(&file, offset, size as usize).map_err(|err| {
                warn!(error = %err, offset, "read failed");
                errno(err)
            })?;
            Ok(ReplyData {
                data: Bytes::from(data),
            })
        }

        async fn write(
            &self,
            _req: Request,
            _path: Option<&OsStr>,
            fh: u64,
            offset: u64,
            data: &[u8],
            _write_flags: u32,
            _flags: u32,
        ) -> fuse3::Result<ReplyWrite> {
            let file = self.handle(fh).await?;
            let written = self.fs.write(&file, offset, data).map_err(|err| {
                warn!(error = %err, offset, "write failed");
                errno(err)
            })?;
            Ok(ReplyWrite {
                written: written as u32,
            })
        }

        async fn release(
            &self,
            _req: Request,
            _path: Option<&OsStr>,
            fh: u64,
            _flags: u32,
            _lock_owner: u64,
            _flush: bool,
        ) -> fuse3::Result<()> {
            self.handles.lock().await.remove(&fh);
            Ok(())
        }

        async fn flush(
            &self,
            _req: Request,
            _path: Option<&OsStr>,
            _fh: u64,
            _lock_owner: u64,
        ) -> fuse3::Result<()> {
            Ok(())
        }

        async fn fsync(
            &self,
            _req: Request,
            _path: Option<&OsStr>,
            fh: u64,
            datasync: bool,
        ) -> fuse3::Result<()> {
            let file = self.handle(fh).await?;
            self.fs.fsync(&file, datasync).map_err(errno)
        }

        async fn opendir(
            &self,
            _req: Request,
            _path: &OsStr,
            _flags: u32,
        ) -> fuse3::Result<ReplyOpen> {
            Ok(ReplyOpen { fh: 0, flags: 0 })
        }

        type DirEntryStream<'a>
            = stream::Iter<std::vec::IntoIter<fuse3::Result<DirectoryEntry>>>
        where
            Self: 'a;

        type DirEntryPlusStream<'a>
            = stream::Iter<std::vec::IntoIter<fuse3::Result<DirectoryEntryPlus>>>
        where
            Self: 'a;

        async fn readdir<'a>(
            &'a self,
            _req: Request,
            path: &'a OsStr,
            _fh: u64,
            offset: i64,
        ) -> fuse3::Result<ReplyDirectory<Self::DirEntryStream<'a>>> {
            let dir = rel(path)?;
            let listing = self.fs.readdir(&dir).map_err(errno)?;

            let mut entries: Vec<fuse3::Result<DirectoryEntry>> = Vec::new();
            if offset == 0 {
                entries.push(Ok(DirectoryEntry {
                    kind: FileType::Directory,
                    name: ".".into(),
                    offset: 1,
                }));
            }
            if offset <= 1 {
                entries.push(Ok(DirectoryEntry {
                    kind: FileType::Directory,
                    name: "..".into(),
                    offset: 2,
                }));
            }
            let mut next_offset = 3i64;
            for entry in listing {
                if next_offset > offset {
                    entries.push(Ok(DirectoryEntry {
                        kind: kind_to_file_type(entry.kind),
                        name: entry.name.into(),
                        offset: next_offset,
                    }));
                }
                next_offset += 1;
            }
            Ok(ReplyDirectory {
                entries: stream::iter(entries),
            })
        }

        async fn readdirplus<'a>(
            &'a self,
            _req: Request,
            path: &'a OsStr,
            _fh: u64,
            offset: u64,
            _lock_owner: u64,
        ) -> fuse3::Result<ReplyDirectoryPlus<Self::DirEntryPlusStream<'a>>> {
            let dir = rel(path)?;
            let listing = self.fs.readdir(&dir).map_err(errno)?;
            let dir_attr = self.fs.getattr(&dir).map_err(errno)?;
            let offset = offset as i64;

            let mut entries: Vec<fuse3::Result<DirectoryEntryPlus>> = Vec::new();
            if offset == 0 {
                entries.push(Ok(DirectoryEntryPlus {
                    kind: FileType::Directory,
                    name: ".".into(),
                    offset: 1,
                    attr: attr_to_fuse(&dir_attr),
                    entry_ttl: ATTR_TTL,
                    attr_ttl: ATTR_TTL,
                }));
            }
            if offset <= 1 {
                entries.push(Ok(DirectoryEntryPlus {
                    kind: FileType::Directory,
                    name: "..".into(),
                    offset: 2,
                    attr: attr_to_fuse(&dir_attr),
                    entry_ttl: ATTR_TTL,
                    attr_ttl: ATTR_TTL,
                }));
            }
            let mut next_offset = 3i64;
            for entry in listing {
                if next_offset > offset {
                    let child = if dir.is_empty() {
                        entry.name.clone()
                    } else {
                        format!("{dir}/{}", entry.name)
                    };
                    let attr = match self.fs.getattr(&child) {
                        Ok(attr) => attr,
                        Err(err) if err.is_not_found() => {
                            // Raced with a concurrent unlink; skip.
                            next_offset += 1;
                            continue;
                        }
                        Err(err) => return Err(errno(err)),
                    };
                    entries.push(Ok(DirectoryEntryPlus {
                        kind: kind_to_file_type(entry.kind),
                        name: entry.name.into(),
                        offset: next_offset,
                        attr: attr_to_fuse(&attr),
                        entry_ttl: ATTR_TTL,
                        attr_ttl: ATTR_TTL,
                    }));
                }
                next_offset += 1;
            }
            Ok(ReplyDirectoryPlus {
                entries: stream::iter(entries),
            })
        }

        async fn statfs(&self, _req: Request, _path: &OsStr) -> fuse3::Result<ReplyStatFs> {
            let st = self.fs.statfs().map_err(errno)?;
            Ok(ReplyStatFs {
                blocks: st.f_blocks,
                bfree: st.f_bfree,
                bavail: st.f_bavail,
                files: st.f_files,
                ffree: st.f_ffree,
                bsize: st.f_bsize as u32,
                namelen: 255,
                frsize: st.f_frsize as u32,
            })
        }
    }

    /// Mount configuration for one filesystem instance.
    pub struct FuseMountConfig {
        pub fs: Arc<CryptFs>,
        pub mountpoint: std::path::PathBuf,
        pub allow_other: bool,
        pub read_only: bool,
    }

    /// Mount and block until the filesystem is unmounted (`fusermount3 -u`
    /// or a signal handled by the caller).
    pub async fn mount(cfg: FuseMountConfig) -> std::io::Result<()> {
        let driver = CloakFuseFs::new(cfg.fs);

        let mut opts = MountOptions::default();
        opts.fs_name("cloakfs");
        opts.read_only(cfg.read_only);
        opts.force_readdir_plus(true);
        if cfg.allow_other {
            opts.allow_other(true);
        }

        info!(mountpoint = %cfg.mountpoint.display(), "mounting cloakfs (unprivileged via fusermount3)");

        let handle = Session::new(opts)
            .mount_with_unprivileged(driver, &cfg.mountpoint)
            .await?;

        handle.await
    }
}

#[cfg(feature = "fuse")]
pub use inner::{mount, CloakFuseFs, FuseMountConfig};
