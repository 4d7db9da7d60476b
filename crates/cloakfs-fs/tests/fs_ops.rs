//! End-to-end tests of the frontend over a real temp cipher directory.

use std::fs;
use std::sync::Arc;

use tempfile::TempDir;

use cloakfs_core::CloakfsError;
use cloakfs_crypto::content::HEADER_LEN;
use cloakfs_crypto::{write_dir_iv, MasterKey, DIRIV_FILENAME};
use cloakfs_fs::{CryptFs, FileKind, MountConfig};

const PLAIN_BS: u64 = 4096;

fn mount(plaintext_names: bool) -> (TempDir, CryptFs) {
    let tmp = TempDir::new().unwrap();
    if !plaintext_names {
        write_dir_iv(tmp.path()).unwrap();
    }
    let fs = CryptFs::new(
        tmp.path(),
        &MasterKey::from_bytes([0x21; 32]),
        MountConfig {
            plaintext_names,
            gcm_iv128: true,
        },
    )
    .unwrap();
    (tmp, fs)
}

fn write_file(fs: &CryptFs, path: &str, data: &[u8]) {
    let f = fs.create(path, 0o644).unwrap();
    assert_eq!(fs.write(&f, 0, data).unwrap(), data.len());
}

fn read_all(fs: &CryptFs, path: &str) -> Vec<u8> {
    let f = fs.open(path, false).unwrap();
    let size = f.plain_size(fs.content()).unwrap();
    fs.read(&f, 0, size as usize).unwrap()
}

fn splice(base: &[u8], offset: usize, patch: &[u8]) -> Vec<u8> {
    let mut out = base.to_vec();
    if out.len() < offset + patch.len() {
        out.resize(offset + patch.len(), 0);
    }
    out[offset..offset + patch.len()].copy_from_slice(patch);
    out
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i.wrapping_mul(31) >> 2) as u8).collect()
}

// ── Content round-trips ──────────────────────────────────────────────────

#[test]
fn content_roundtrip_various_sizes() {
    let (_tmp, fs) = mount(false);
    for (i, len) in [0usize, 1, 5, 4095, 4096, 4097, 8192, 10000, 70000]
        .iter()
        .enumerate()
    {
        let path = format!("file-{i}");
        let data = patterned(*len);
        write_file(&fs, &path, &data);
        assert_eq!(read_all(&fs, &path), data, "len={len}");
        assert_eq!(fs.getattr(&path).unwrap().size, *len as u64);
    }
}

#[test]
fn single_block_write_cipher_size() {
    let (_tmp, fs) = mount(false);
    write_file(&fs, "hello", b"hello");

    let f = fs.open("hello", false).unwrap();
    assert_eq!(fs.read(&f, 0, 5).unwrap(), b"hello");

    // header + nonce + 5 bytes + tag
    let cpath = fs.cipher_path("hello").unwrap();
    let cipher_len = fs::metadata(&cpath).unwrap().len();
    assert_eq!(cipher_len, (HEADER_LEN + 16 + 5 + 16) as u64);
}

#[test]
fn empty_file_has_empty_ciphertext() {
    let (_tmp, fs) = mount(false);
    fs.create("empty", 0o644).unwrap();
    let cpath = fs.cipher_path("empty").unwrap();
    assert_eq!(fs::metadata(&cpath).unwrap().len(), 0);
    assert_eq!(fs.getattr("empty").unwrap().size, 0);
}

#[test]
fn partial_overwrite_across_block_boundary() {
    let (_tmp, fs) = mount(false);
    let base = vec![0u8; 8192];
    write_file(&fs, "f", &base);

    let patch = *b"0123456789";
    let f = fs.open("f", true).unwrap();
    assert_eq!(fs.write(&f, 4090, &patch).unwrap(), 10);

    let expect = splice(&base, 4090, &patch);
    assert_eq!(read_all(&fs, "f"), expect);

    // Still exactly two ciphertext blocks.
    let cpath = fs.cipher_path("f").unwrap();
    let cipher_bs = fs.content().cipher_bs();
    assert_eq!(
        fs::metadata(&cpath).unwrap().len(),
        HEADER_LEN as u64 + 2 * cipher_bs
    );
}

#[test]
fn partial_overwrites_at_many_offsets() {
    let (_tmp, fs) = mount(false);
    let base = patterned(3 * PLAIN_BS as usize + 100);
    let patch = patterned(513);
    for (i, offset) in [0usize, 1, 4095, 4096, 5000, 8191, 12000].iter().enumerate() {
        let path = format!("f{i}");
        write_file(&fs, &path, &base);
        let f = fs.open(&path, true).unwrap();
        fs.write(&f, *offset as u64, &patch).unwrap();
        assert_eq!(
            read_all(&fs, &path),
            splice(&base, *offset, &patch),
            "offset={offset}"
        );
    }
}

#[test]
fn write_far_past_eof_materializes_zeros() {
    let (_tmp, fs) = mount(false);
    write_file(&fs, "sparse", b"head");
    let f = fs.open("sparse", true).unwrap();
    let offset = 3 * PLAIN_BS + 17;
    fs.write(&f, offset, b"tail").unwrap();

    let data = read_all(&fs, "sparse");
    assert_eq!(data.len(), offset as usize + 4);
    assert_eq!(&data[..4], b"head");
    assert!(data[4..offset as usize].iter().all(|&b| b == 0));
    assert_eq!(&data[offset as usize..], b"tail");

    // Eager hole policy: the ciphertext has no holes, every block is
    // materialized and authenticated.
    let cpath = fs.cipher_path("sparse").unwrap();
    assert_eq!(
        fs::metadata(&cpath).unwrap().len(),
        fs.content().plain_size_to_cipher_size(offset + 4)
    );
}

// ── Truncate ─────────────────────────────────────────────────────────────

#[test]
fn truncate_shrink_grow_zero() {
    let (_tmp, fs) = mount(false);
    let data = patterned(10000);
    write_file(&fs, "t", &data);
    let f = fs.open("t", true).unwrap();

    // Shrink to a mid-block size.
    fs.truncate(&f, 5000).unwrap();
    assert_eq!(read_all(&fs, "t"), &data[..5000]);
    assert_eq!(fs.getattr("t").unwrap().size, 5000);

    // Reads beyond the end are empty.
    assert!(fs.read(&f, 5000, 100).unwrap().is_empty());

    // Shrink to a block boundary.
    fs.truncate(&f, 4096).unwrap();
    assert_eq!(read_all(&fs, "t"), &data[..4096]);

    // Grow: the tail reads back as zeros, authenticated.
    fs.truncate(&f, 9000).unwrap();
    let grown = read_all(&fs, "t");
    assert_eq!(grown.len(), 9000);
    assert_eq!(&grown[..4096], &data[..4096]);
    assert!(grown[4096..].iter().all(|&b| b == 0));

    // To zero: ciphertext file is empty again.
    fs.truncate(&f, 0).unwrap();
    assert_eq!(fs.getattr("t").unwrap().size, 0);
    let cpath = fs.cipher_path("t").unwrap();
    assert_eq!(fs::metadata(&cpath).unwrap().len(), 0);
}

#[test]
fn grow_materializes_authenticated_zeros() {
    // Hole policy: truncate-grow writes real encrypted zero blocks. The
    // ciphertext size accounts for every block, and flipping a bit in a
    // "hole" block is detected like any other corruption.
    let (_tmp, fs) = mount(false);
    write_file(&fs, "g", b"x");
    let f = fs.open("g", true).unwrap();
    fs.truncate(&f, 2 * PLAIN_BS).unwrap();
    drop(f);

    let cpath = fs.cipher_path("g").unwrap();
    assert_eq!(
        fs::metadata(&cpath).unwrap().len(),
        fs.content().plain_size_to_cipher_size(2 * PLAIN_BS)
    );

    let mut raw = fs::read(&cpath).unwrap();
    let second_block_start = HEADER_LEN as u64 + fs.content().cipher_bs();
    raw[second_block_start as usize + 20] ^= 0x01;
    fs::write(&cpath, &raw).unwrap();

    let f = fs.open("g", false).unwrap();
    assert!(matches!(
        fs.read(&f, PLAIN_BS, 100),
        Err(CloakfsError::Auth)
    ));
}

// ── Authenticity ─────────────────────────────────────────────────────────

#[test]
fn tampered_block_fails_others_survive() {
    let (_tmp, fs) = mount(false);
    write_file(&fs, "a", &patterned(8192));

    // Flip the last byte of block 0.
    let cpath = fs.cipher_path("a").unwrap();
    let mut raw = fs::read(&cpath).unwrap();
    let block0_end = HEADER_LEN as u64 + fs.content().cipher_bs();
    raw[block0_end as usize - 1] ^= 0x01;
    fs::write(&cpath, &raw).unwrap();

    let f = fs.open("a", false).unwrap();
    assert!(matches!(fs.read(&f, 0, 4096), Err(CloakfsError::Auth)));
    // The untouched second block still reads fine.
    assert_eq!(fs.read(&f, 4096, 4096).unwrap(), patterned(8192)[4096..].to_vec());
}

#[test]
fn blocks_do_not_swap_within_a_file() {
    let (_tmp, fs) = mount(false);
    write_file(&fs, "swap", &patterned(8192));

    let cpath = fs.cipher_path("swap").unwrap();
    let raw = fs::read(&cpath).unwrap();
    let cipher_bs = fs.content().cipher_bs() as usize;
    let mut swapped = raw.clone();
    swapped[HEADER_LEN..HEADER_LEN + cipher_bs]
        .copy_from_slice(&raw[HEADER_LEN + cipher_bs..HEADER_LEN + 2 * cipher_bs]);
    swapped[HEADER_LEN + cipher_bs..HEADER_LEN + 2 * cipher_bs]
        .copy_from_slice(&raw[HEADER_LEN..HEADER_LEN + cipher_bs]);
    fs::write(&cpath, &swapped).unwrap();

    let f = fs.open("swap", false).unwrap();
    assert!(matches!(fs.read(&f, 0, 4096), Err(CloakfsError::Auth)));
}

#[test]
fn blocks_do_not_move_between_files() {
    let (_tmp, fs) = mount(false);
    write_file(&fs, "one", &patterned(4096));
    write_file(&fs, "two", &patterned(4096));

    // Graft file one's block 0 onto file two. Same position, same size —
    // only the file-id in the AAD differs.
    let raw_one = fs::read(fs.cipher_path("one").unwrap()).unwrap();
    let mut raw_two = fs::read(fs.cipher_path("two").unwrap()).unwrap();
    raw_two[HEADER_LEN..].copy_from_slice(&raw_one[HEADER_LEN..]);
    fs::write(fs.cipher_path("two").unwrap(), &raw_two).unwrap();

    let f = fs.open("two", false).unwrap();
    assert!(matches!(fs.read(&f, 0, 4096), Err(CloakfsError::Auth)));
}

// ── Names and directories ────────────────────────────────────────────────

#[test]
fn same_name_different_dirs_different_ciphertext() {
    let (tmp, fs) = mount(false);
    fs.mkdir("a", 0o755).unwrap();
    fs.mkdir("b", 0o755).unwrap();
    write_file(&fs, "a/x", b"1");
    write_file(&fs, "b/x", b"2");

    let ca = fs.cipher_path("a/x").unwrap();
    let cb = fs.cipher_path("b/x").unwrap();
    assert_ne!(ca.file_name(), cb.file_name());

    // Nothing in the cipher tree carries the plaintext name.
    for entry in walkdir(tmp.path()) {
        assert_ne!(entry, "x");
        assert_ne!(entry, "a");
        assert_ne!(entry, "b");
    }
}

fn walkdir(root: &std::path::Path) -> Vec<String> {
    let mut names = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir).unwrap() {
            let entry = entry.unwrap();
            names.push(entry.file_name().to_string_lossy().into_owned());
            if entry.file_type().unwrap().is_dir() {
                stack.push(entry.path());
            }
        }
    }
    names
}

#[test]
fn readdir_translates_and_hides() {
    let (tmp, fs) = mount(false);
    fs.mkdir("docs", 0o755).unwrap();
    write_file(&fs, "hello.txt", b"hi");

    // Drop an undecryptable file straight into the cipher directory.
    fs::write(tmp.path().join("#corrupt-name#"), b"junk").unwrap();

    let mut names: Vec<String> = fs
        .readdir("")
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    names.sort();
    assert_eq!(names, ["docs", "hello.txt"]);

    let entries = fs.readdir("").unwrap();
    let docs = entries.iter().find(|e| e.name == "docs").unwrap();
    assert_eq!(docs.kind, FileKind::Dir);
}

#[test]
fn mkdir_creates_sentinel_rmdir_removes() {
    let (_tmp, fs) = mount(false);
    fs.mkdir("d", 0o755).unwrap();
    let cdir = fs.cipher_path("d").unwrap();
    assert!(cdir.join(DIRIV_FILENAME).is_file());

    // A directory with real content refuses to go.
    write_file(&fs, "d/f", b"x");
    assert!(fs.rmdir("d").is_err());

    fs.unlink("d/f").unwrap();
    fs.rmdir("d").unwrap();
    assert!(!cdir.exists());
    assert!(fs.getattr("d").unwrap_err().is_not_found());
}

#[test]
fn rename_file_and_directory() {
    let (_tmp, fs) = mount(false);
    fs.mkdir("d", 0o755).unwrap();
    write_file(&fs, "d/f", b"payload");

    // Populate the IV cache.
    fs.getattr("d/f").unwrap();

    fs.rename("d", "e").unwrap();
    assert_eq!(read_all(&fs, "e/f"), b"payload");
    assert!(fs.getattr("d/f").unwrap_err().is_not_found());
    assert!(fs.getattr("d").unwrap_err().is_not_found());

    fs.rename("e/f", "e/g").unwrap();
    assert_eq!(read_all(&fs, "e/g"), b"payload");
    assert!(fs.getattr("e/f").unwrap_err().is_not_found());
}

#[test]
fn nested_directories_roundtrip() {
    let (_tmp, fs) = mount(false);
    fs.mkdir("a", 0o755).unwrap();
    fs.mkdir("a/b", 0o755).unwrap();
    fs.mkdir("a/b/c", 0o755).unwrap();
    write_file(&fs, "a/b/c/deep.txt", b"deep");
    assert_eq!(read_all(&fs, "a/b/c/deep.txt"), b"deep");

    let mut names: Vec<_> = fs.readdir("a/b").unwrap().into_iter().map(|e| e.name).collect();
    names.sort();
    assert_eq!(names, ["c"]);
}

#[test]
fn concurrent_writers_do_not_tear_blocks() {
    use std::thread;

    let (_tmp, fs) = mount(false);
    let fs = Arc::new(fs);
    write_file(&fs, "shared", &vec![0u8; 2 * PLAIN_BS as usize]);

    let mut threads = Vec::new();
    for t in 0..4u8 {
        let fs = Arc::clone(&fs);
        threads.push(thread::spawn(move || {
            let f = fs.open("shared", true).unwrap();
            for i in 0..20u64 {
                // Every write straddles the block boundary.
                let payload = [t.wrapping_add(i as u8); 64];
                fs.write(&f, PLAIN_BS - 32, &payload).unwrap();
            }
        }));
    }
    for t in threads {
        t.join().unwrap();
    }

    // Interleaving is unspecified, but both blocks must still authenticate.
    let data = read_all(&fs, "shared");
    assert_eq!(data.len(), 2 * PLAIN_BS as usize);
}

// ── Plaintext names mode ─────────────────────────────────────────────────

#[test]
fn plaintext_names_mode() {
    let (tmp, fs) = mount(true);
    fs.mkdir("dir", 0o755).unwrap();
    write_file(&fs, "dir/file.txt", b"visible");

    // Names are stored as-is and no sentinel files appear.
    assert!(tmp.path().join("dir/file.txt").is_file());
    assert!(!tmp.path().join(DIRIV_FILENAME).exists());
    assert!(!tmp.path().join("dir").join(DIRIV_FILENAME).exists());

    // Content is still encrypted.
    let raw = fs::read(tmp.path().join("dir/file.txt")).unwrap();
    assert_ne!(raw, b"visible");
    assert_eq!(read_all(&fs, "dir/file.txt"), b"visible");

    // The config file cannot be addressed through the plaintext view.
    assert!(fs.getattr("gocryptfs.conf").is_err());
    assert!(fs.open("gocryptfs.conf", false).is_err());
}

// ── Attributes ───────────────────────────────────────────────────────────

#[test]
fn chmod_and_times() {
    use std::time::{Duration, SystemTime};

    let (_tmp, fs) = mount(false);
    write_file(&fs, "f", b"x");

    fs.chmod("f", 0o600).unwrap();
    assert_eq!(fs.getattr("f").unwrap().perm, 0o600);

    let then = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
    fs.utimens("f", None, Some(then)).unwrap();
    assert_eq!(fs.getattr("f").unwrap().mtime, then);
}

#[test]
fn path_traversal_is_rejected() {
    let (_tmp, fs) = mount(false);
    assert!(fs.getattr("..").is_err());
    assert!(fs.getattr("a/../b").is_err());
    assert!(fs.getattr("a//b").is_err());
}
