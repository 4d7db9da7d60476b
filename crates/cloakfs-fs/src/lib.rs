//! cloakfs-fs: the filesystem frontend.
//!
//! Translates plaintext-view operations into operations on the backing
//! cipher directory: paths go through the name transform, file content goes
//! through the content encoder. This crate performs real I/O; the kernel
//! adapter on top of it is only message plumbing.

mod file;
mod fs;

pub use file::CryptFile;
pub use fs::{Attr, CryptFs, DirEntry, FileKind, MountConfig};
