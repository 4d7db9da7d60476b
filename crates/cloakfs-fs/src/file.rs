//! Open files: per-inode state, block I/O, read-modify-write.
//!
//! All content I/O for one inode funnels through a single [`CryptFile`],
//! deduplicated by `(device, inode)` in the [`FileTable`]. The mutex inside
//! serializes read-modify-write cycles across handles, so a write that spans
//! a block boundary can never interleave with another writer and tear a
//! ciphertext block.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::os::unix::fs::{FileExt, MetadataExt};
use std::sync::{Arc, Mutex, Weak};

use tracing::warn;

use cloakfs_core::{CloakfsError, CloakfsResult};
use cloakfs_crypto::content::{ContentEnc, FileHeader, HEADER_LEN, PLAIN_BS};

struct FileInner {
    file: File,
    writable: bool,
    /// Parsed header, cached after the first access. `None` also after
    /// truncation to zero: the next write draws a fresh file-id.
    header: Option<FileHeader>,
}

/// One open file. Handles pointing at the same inode share one instance.
pub struct CryptFile {
    inner: Mutex<FileInner>,
}

impl CryptFile {
    fn new(file: File, writable: bool) -> Self {
        Self {
            inner: Mutex::new(FileInner {
                file,
                writable,
                header: None,
            }),
        }
    }

    /// Plaintext size derived from the current ciphertext size.
    pub fn plain_size(&self, enc: &ContentEnc) -> CloakfsResult<u64> {
        let inner = self.inner.lock().unwrap();
        let cipher_len = inner.file.metadata()?.len();
        Ok(enc.cipher_size_to_plain_size(cipher_len))
    }

    /// Read up to `len` plaintext bytes at `offset`. Reads past the end
    /// return the available prefix; reads entirely past the end are empty.
    pub fn read(&self, enc: &ContentEnc, offset: u64, len: usize) -> CloakfsResult<Vec<u8>> {
        let mut inner = self.inner.lock().unwrap();
        let cipher_len = inner.file.metadata()?.len();
        let plain_len = enc.cipher_size_to_plain_size(cipher_len);
        if len == 0 || offset >= plain_len {
            return Ok(Vec::new());
        }
        let len = len.min((plain_len - offset) as usize);
        let header = load_header(&mut inner)?;

        let (first, last) = enc.block_span(offset, len as u64);
        let mut assembled = Vec::with_capacity(((last - first + 1) * PLAIN_BS) as usize);
        let mut cipher_block = vec![0u8; enc.cipher_bs() as usize];
        for block_no in first..=last {
            let n = read_block_at(&inner.file, &mut cipher_block, enc.block_cipher_off(block_no))?;
            if n == 0 {
                // The file shrank between the size probe and this read.
                break;
            }
            let plain = enc.decrypt_block(&cipher_block[..n], block_no, &header.id)?;
            assembled.extend_from_slice(&plain);
        }

        let skip = (offset - enc.block_plain_off(first)) as usize;
        if skip >= assembled.len() {
            return Ok(Vec::new());
        }
        let end = (skip + len).min(assembled.len());
        Ok(assembled[skip..end].to_vec())
    }

    /// Write `data` at plaintext `offset`. Writes past the current end first
    /// materialize the gap as encrypted all-zero blocks, so every byte of
    /// the file stays covered by an authentication tag.
    pub fn write(&self, enc: &ContentEnc, offset: u64, data: &[u8]) -> CloakfsResult<usize> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.writable {
            return Err(CloakfsError::Io(io::Error::from_raw_os_error(libc::EBADF)));
        }
        if data.is_empty() {
            return Ok(0);
        }
        let cipher_len = inner.file.metadata()?.len();
        let plain_len = enc.cipher_size_to_plain_size(cipher_len);
        let header = ensure_header(&mut inner, cipher_len)?;

        if offset > plain_len {
            extend_with_zeros(enc, &mut inner, &header, plain_len, offset)?;
        }
        write_span(enc, &mut inner, &header, offset, data)?;
        Ok(data.len())
    }

    /// Set the plaintext size to `size`: shrink by re-encrypting the
    /// trailing partial block, grow by appending encrypted zero blocks.
    pub fn truncate(&self, enc: &ContentEnc, size: u64) -> CloakfsResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.writable {
            return Err(CloakfsError::Io(io::Error::from_raw_os_error(libc::EBADF)));
        }
        let cipher_len = inner.file.metadata()?.len();
        let plain_len = enc.cipher_size_to_plain_size(cipher_len);

        if size == 0 {
            inner.file.set_len(0)?;
            inner.header = None;
            return Ok(());
        }
        if size == plain_len {
            return Ok(());
        }
        if size > plain_len {
            let header = ensure_header(&mut inner, cipher_len)?;
            return extend_with_zeros(enc, &mut inner, &header, plain_len, size);
        }

        // Shrink. If the new end falls inside a block, that block is
        // re-encrypted at its shorter length with a fresh nonce.
        let header = load_header(&mut inner)?;
        let last_block = size / PLAIN_BS;
        let remainder = size % PLAIN_BS;
        if remainder > 0 {
            let block = read_and_decrypt_block(enc, &inner, last_block, &header)?;
            if block.len() < remainder as usize {
                warn!(
                    block_no = last_block,
                    have = block.len(),
                    want = remainder,
                    "trailing block shorter than the size math predicts"
                );
                return Err(CloakfsError::Auth);
            }
            let truncated = &block[..remainder as usize];
            let cipher_block = enc.encrypt_block(truncated, last_block, &header.id)?;
            inner
                .file
                .write_all_at(&cipher_block, enc.block_cipher_off(last_block))?;
        }
        inner.file.set_len(enc.plain_size_to_cipher_size(size))?;
        Ok(())
    }

    pub fn fsync(&self, datasync: bool) -> CloakfsResult<()> {
        let inner = self.inner.lock().unwrap();
        if datasync {
            inner.file.sync_data()?;
        } else {
            inner.file.sync_all()?;
        }
        Ok(())
    }

    /// File metadata of the backing ciphertext file.
    pub fn metadata(&self) -> CloakfsResult<std::fs::Metadata> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.file.metadata()?)
    }
}

/// Write one plaintext span, block by block. Partial first/last blocks are
/// read-modify-write: decrypt, splice, re-encrypt under a fresh nonce.
/// The caller guarantees `offset` is within the current file size.
fn write_span(
    enc: &ContentEnc,
    inner: &mut FileInner,
    header: &FileHeader,
    offset: u64,
    data: &[u8],
) -> CloakfsResult<()> {
    let mut done = 0usize;
    while done < data.len() {
        let pos = offset + done as u64;
        let block_no = pos / PLAIN_BS;
        let intra = (pos % PLAIN_BS) as usize;
        let count = (PLAIN_BS as usize - intra).min(data.len() - done);
        let chunk = &data[done..done + count];

        let plain_block = if intra == 0 && count == PLAIN_BS as usize {
            chunk.to_vec()
        } else {
            let mut existing = read_and_decrypt_block(enc, inner, block_no, header)?;
            if existing.len() < intra + count {
                existing.resize(intra + count, 0);
            }
            existing[intra..intra + count].copy_from_slice(chunk);
            existing
        };

        let cipher_block = enc.encrypt_block(&plain_block, block_no, &header.id)?;
        inner
            .file
            .write_all_at(&cipher_block, enc.block_cipher_off(block_no))?;
        done += count;
    }
    Ok(())
}

/// Materialize the plaintext range `[from, to)` as zeros, one block at a
/// time. This is the hole policy: holes are written eagerly as encrypted
/// zero blocks, never synthesized on read.
fn extend_with_zeros(
    enc: &ContentEnc,
    inner: &mut FileInner,
    header: &FileHeader,
    from: u64,
    to: u64,
) -> CloakfsResult<()> {
    let zeros = vec![0u8; PLAIN_BS as usize];
    let mut pos = from;
    while pos < to {
        let intra = pos % PLAIN_BS;
        let count = (PLAIN_BS - intra).min(to - pos);
        write_span(enc, inner, header, pos, &zeros[..count as usize])?;
        pos += count;
    }
    Ok(())
}

/// Read and decrypt one block. A block past the current end of file comes
/// back empty.
fn read_and_decrypt_block(
    enc: &ContentEnc,
    inner: &FileInner,
    block_no: u64,
    header: &FileHeader,
) -> CloakfsResult<Vec<u8>> {
    let mut buf = vec![0u8; enc.cipher_bs() as usize];
    let n = read_block_at(&inner.file, &mut buf, enc.block_cipher_off(block_no))?;
    if n == 0 {
        return Ok(Vec::new());
    }
    enc.decrypt_block(&buf[..n], block_no, &header.id)
}

/// Positioned read that keeps going on short reads until the buffer is full
/// or the file ends. Returns the number of bytes read.
fn read_block_at(file: &File, buf: &mut [u8], offset: u64) -> CloakfsResult<usize> {
    let mut filled = 0usize;
    while filled < buf.len() {
        match file.read_at(&mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(CloakfsError::Io(e)),
        }
    }
    Ok(filled)
}

/// Read and cache the header of a non-empty file.
fn load_header(inner: &mut FileInner) -> CloakfsResult<FileHeader> {
    if let Some(header) = &inner.header {
        return Ok(header.clone());
    }
    let mut buf = [0u8; HEADER_LEN];
    let n = read_block_at(&inner.file, &mut buf, 0)?;
    if n != HEADER_LEN {
        warn!(got = n, "ciphertext file too short for its header");
        return Err(CloakfsError::Auth);
    }
    let header = FileHeader::parse(&buf)?;
    inner.header = Some(header.clone());
    Ok(header)
}

/// Header of the file, creating one with a fresh random file-id if the file
/// is still empty.
fn ensure_header(inner: &mut FileInner, cipher_len: u64) -> CloakfsResult<FileHeader> {
    if cipher_len == 0 {
        let header = FileHeader::random();
        inner.file.write_all_at(&header.pack(), 0)?;
        inner.header = Some(header.clone());
        return Ok(header);
    }
    load_header(inner)
}

// ── Open-file table ──────────────────────────────────────────────────────

/// Deduplicates open files by `(device, inode)` so that all handles on one
/// inode share one lock and one header cache.
pub(crate) struct FileTable {
    map: Mutex<HashMap<(u64, u64), Weak<CryptFile>>>,
}

impl FileTable {
    pub(crate) fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }

    /// Register a freshly opened `File`. If the inode is already open the
    /// existing entry is reused (upgrading it to writable if this open is).
    pub(crate) fn register(&self, file: File, writable: bool) -> CloakfsResult<Arc<CryptFile>> {
        let md = file.metadata()?;
        let key = (md.dev(), md.ino());

        let mut map = self.map.lock().unwrap();
        map.retain(|_, weak| weak.strong_count() > 0);

        if let Some(existing) = map.get(&key).and_then(Weak::upgrade) {
            if writable {
                let mut inner = existing.inner.lock().unwrap();
                if !inner.writable {
                    // Swap in the writable descriptor; same inode, so the
                    // cached header stays valid.
                    inner.file = file;
                    inner.writable = true;
                }
            }
            return Ok(existing);
        }

        let entry = Arc::new(CryptFile::new(file, writable));
        map.insert(key, Arc::downgrade(&entry));
        Ok(entry)
    }
}
