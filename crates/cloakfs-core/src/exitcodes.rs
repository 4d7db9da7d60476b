//! Process exit codes used by the command-line front-end.

/// Normal unmount.
pub const OK: i32 = 0;
/// Bad command line.
pub const USAGE: i32 = 1;
/// Mounting the filesystem failed.
pub const MOUNT: i32 = 3;
/// The cipher directory is unusable (missing, not a directory, not empty on init).
pub const CIPHERDIR: i32 = 6;
/// Creating the filesystem failed.
pub const INIT: i32 = 7;
/// Loading the config file failed.
pub const LOADCONF: i32 = 8;
/// Reading the passphrase failed.
pub const PASSWORD: i32 = 9;
/// The mountpoint is invalid.
pub const MOUNTPOINT: i32 = 10;
