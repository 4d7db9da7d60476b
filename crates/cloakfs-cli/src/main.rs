//! cloakfs: encrypted overlay filesystem CLI
//!
//! Commands:
//!   init CIPHERDIR               - create a new encrypted filesystem
//!   passwd CIPHERDIR             - change the passphrase
//!   mount CIPHERDIR MOUNTPOINT   - mount the plaintext view (feature: fuse)

use std::path::{Path, PathBuf};
use std::process::exit;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use secrecy::SecretString;
use tracing::{debug, error, info};

use cloakfs_core::exitcodes;
use cloakfs_crypto::config::SCRYPT_DEFAULT_LOGN;
use cloakfs_crypto::{write_dir_iv, ConfigFile, MasterKey, CONF_FILENAME};

#[derive(Parser, Debug)]
#[command(
    name = "cloakfs",
    version,
    about = "Encrypted overlay filesystem",
    long_about = "cloakfs: store files encrypted in CIPHERDIR, work with them through MOUNTPOINT"
)]
struct Cli {
    /// Quiet: only warnings and errors
    #[arg(short = 'q', long, global = true)]
    quiet: bool,

    /// Debug output
    #[arg(short = 'd', long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct KeySource {
    /// Read the passphrase from the first line printed by PROGRAM instead
    /// of prompting
    #[arg(long, value_name = "PROGRAM")]
    extpass: Option<String>,

    /// Override the config file location (default: CIPHERDIR/gocryptfs.conf)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a new encrypted filesystem in an empty CIPHERDIR
    Init {
        cipherdir: PathBuf,

        /// Store filenames unencrypted
        #[arg(long)]
        plaintextnames: bool,

        /// scrypt cost parameter log2(N)
        #[arg(long, default_value_t = SCRYPT_DEFAULT_LOGN, value_name = "LOG_N")]
        scryptn: u8,

        #[command(flatten)]
        key: KeySource,
    },

    /// Change the passphrase protecting the master key
    Passwd {
        cipherdir: PathBuf,

        /// scrypt cost parameter log2(N) for the new wrapping
        #[arg(long, default_value_t = SCRYPT_DEFAULT_LOGN, value_name = "LOG_N")]
        scryptn: u8,

        #[command(flatten)]
        key: KeySource,
    },

    /// Mount CIPHERDIR's plaintext view at MOUNTPOINT
    Mount {
        cipherdir: PathBuf,
        mountpoint: PathBuf,

        /// Use an explicit hex master key instead of the config file
        #[arg(long, value_name = "HEX")]
        masterkey: Option<String>,

        /// Use an all-zero master key (testing only)
        #[arg(long)]
        zerokey: bool,

        /// Allow other users to access the mount
        #[arg(long)]
        allow_other: bool,

        /// Mount read-only
        #[arg(long)]
        read_only: bool,

        #[command(flatten)]
        key: KeySource,
    },
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.quiet, cli.debug);

    let code = match cli.command {
        Commands::Init {
            cipherdir,
            plaintextnames,
            scryptn,
            key,
        } => cmd_init(&cipherdir, plaintextnames, scryptn, &key),
        Commands::Passwd {
            cipherdir,
            scryptn,
            key,
        } => cmd_passwd(&cipherdir, scryptn, &key),
        Commands::Mount {
            cipherdir,
            mountpoint,
            masterkey,
            zerokey,
            allow_other,
            read_only,
            key,
        } => cmd_mount(MountArgs {
            cipherdir,
            mountpoint,
            masterkey,
            zerokey,
            allow_other,
            read_only,
            key,
        }),
    };
    exit(code);
}

fn init_logging(quiet: bool, debug: bool) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let default = if debug {
        "debug"
    } else if quiet {
        "warn"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();
}

fn config_path(cipherdir: &Path, key: &KeySource) -> PathBuf {
    key.config
        .clone()
        .unwrap_or_else(|| cipherdir.join(CONF_FILENAME))
}

// ── init ─────────────────────────────────────────────────────────────────

fn cmd_init(cipherdir: &Path, plaintextnames: bool, scryptn: u8, key: &KeySource) -> i32 {
    match check_empty_dir(cipherdir) {
        Ok(()) => {}
        Err(err) => {
            error!("invalid cipher directory: {err:#}");
            return exitcodes::CIPHERDIR;
        }
    }
    let passphrase = match read_passphrase(key.extpass.as_deref(), true) {
        Ok(pw) => pw,
        Err(err) => {
            error!("reading passphrase: {err:#}");
            return exitcodes::PASSWORD;
        }
    };
    let conf = config_path(cipherdir, key);
    let result =
        ConfigFile::create(&conf, &passphrase, plaintextnames, scryptn).and_then(|(master, _)| {
            if !plaintextnames {
                write_dir_iv(cipherdir)?;
            }
            Ok(master)
        });
    match result {
        Ok(master_key) => {
            info!(cipherdir = %cipherdir.display(), "filesystem created");
            println!("The filesystem has been created successfully.");
            println!("Your master key (keep a copy somewhere safe, it can");
            println!("recover the filesystem if the config file is lost):");
            println!("\n    {}\n", master_key.to_hex());
            exitcodes::OK
        }
        Err(err) => {
            error!("init failed: {err}");
            exitcodes::INIT
        }
    }
}

fn check_empty_dir(dir: &Path) -> Result<()> {
    let mut entries =
        std::fs::read_dir(dir).with_context(|| format!("cannot open {}", dir.display()))?;
    if entries.next().is_some() {
        anyhow::bail!("{} is not empty", dir.display());
    }
    Ok(())
}

// ── passwd ───────────────────────────────────────────────────────────────

fn cmd_passwd(cipherdir: &Path, scryptn: u8, key: &KeySource) -> i32 {
    let conf = config_path(cipherdir, key);
    if let Err(err) = ConfigFile::load_locked(&conf) {
        error!("cannot load {}: {err}", conf.display());
        return exitcodes::LOADCONF;
    }
    let old = match read_passphrase(key.extpass.as_deref(), false) {
        Ok(pw) => pw,
        Err(err) => {
            error!("reading passphrase: {err:#}");
            return exitcodes::PASSWORD;
        }
    };
    let (master_key, mut config) = match ConfigFile::load(&conf, &old) {
        Ok(loaded) => loaded,
        Err(err) => {
            error!("{err}");
            return exitcodes::LOADCONF;
        }
    };
    println!("Passphrase verified. Enter the new passphrase.");
    let new = match read_passphrase(None, true) {
        Ok(pw) => pw,
        Err(err) => {
            error!("reading new passphrase: {err:#}");
            return exitcodes::PASSWORD;
        }
    };
    let result = config
        .encrypt_key(&master_key, &new, scryptn)
        .and_then(|()| config.write(&conf));
    match result {
        Ok(()) => {
            info!("passphrase changed");
            println!("Passphrase changed.");
            exitcodes::OK
        }
        Err(err) => {
            error!("rewrapping the master key failed: {err}");
            exitcodes::INIT
        }
    }
}

// ── mount ────────────────────────────────────────────────────────────────

struct MountArgs {
    cipherdir: PathBuf,
    mountpoint: PathBuf,
    masterkey: Option<String>,
    zerokey: bool,
    allow_other: bool,
    read_only: bool,
    key: KeySource,
}

fn cmd_mount(args: MountArgs) -> i32 {
    if !args.cipherdir.is_dir() {
        error!("cipher directory {} does not exist", args.cipherdir.display());
        return exitcodes::CIPHERDIR;
    }
    if !args.mountpoint.is_dir() {
        error!("mountpoint {} is not a directory", args.mountpoint.display());
        return exitcodes::MOUNTPOINT;
    }
    if same_file(&args.cipherdir, &args.mountpoint) {
        error!("mountpoint and cipher directory must differ");
        return exitcodes::MOUNTPOINT;
    }

    let conf = config_path(&args.cipherdir, &args.key);
    let (master_key, mount_config) = match resolve_key(&args, &conf) {
        Ok(resolved) => resolved,
        Err(code) => return code,
    };

    run_mount(args, master_key, mount_config)
}

/// Pick the key source: explicit key, zero key, or the config file plus a
/// passphrase.
fn resolve_key(
    args: &MountArgs,
    conf: &Path,
) -> Result<(MasterKey, cloakfs_fs::MountConfig), i32> {
    if args.zerokey {
        info!("using all-zero master key, do not store anything valuable");
        return Ok((MasterKey::zero(), cloakfs_fs::MountConfig::default()));
    }
    if let Some(hex) = &args.masterkey {
        info!("using explicit master key from the command line");
        let key = MasterKey::from_hex(hex).map_err(|err| {
            error!("{err}");
            exitcodes::USAGE
        })?;
        return Ok((key, cloakfs_fs::MountConfig::default()));
    }

    // Report a missing or unsupported config before prompting.
    let locked = ConfigFile::load_locked(conf).map_err(|err| {
        if err.is_not_found() {
            error!(
                "{} not found: is {} a cloakfs filesystem?",
                conf.display(),
                args.cipherdir.display()
            );
            exitcodes::CIPHERDIR
        } else {
            error!("cannot load {}: {err}", conf.display());
            exitcodes::LOADCONF
        }
    })?;
    debug!(creator = locked.creator(), "config loaded");

    let passphrase = read_passphrase(args.key.extpass.as_deref(), false).map_err(|err| {
        error!("reading passphrase: {err:#}");
        exitcodes::PASSWORD
    })?;
    let (master_key, config) = ConfigFile::load(conf, &passphrase).map_err(|err| {
        error!("{err}");
        exitcodes::LOADCONF
    })?;
    let mount_config = cloakfs_fs::MountConfig::from_config(&config);
    Ok((master_key, mount_config))
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(ca), Ok(cb)) => ca == cb,
        _ => false,
    }
}

#[cfg(feature = "fuse")]
fn run_mount(args: MountArgs, master_key: MasterKey, config: cloakfs_fs::MountConfig) -> i32 {
    use std::sync::Arc;

    let fs = match cloakfs_fs::CryptFs::new(&args.cipherdir, &master_key, config) {
        Ok(fs) => Arc::new(fs),
        Err(err) => {
            error!("initializing the filesystem failed: {err}");
            return exitcodes::MOUNT;
        }
    };
    drop(master_key); // zeroized; the frontend holds its derived state

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(err) => {
            error!("starting the runtime failed: {err}");
            return exitcodes::MOUNT;
        }
    };
    let result = runtime.block_on(async {
        let mount = cloakfs_fuse::mount(cloakfs_fuse::FuseMountConfig {
            fs,
            mountpoint: args.mountpoint.clone(),
            allow_other: args.allow_other,
            read_only: args.read_only,
        });
        tokio::select! {
            res = mount => res,
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, unmounting");
                Ok(())
            }
        }
    });
    match result {
        Ok(()) => exitcodes::OK,
        Err(err) => {
            error!("mount failed: {err}");
            exitcodes::MOUNT
        }
    }
}

#[cfg(not(feature = "fuse"))]
fn run_mount(_args: MountArgs, _master_key: MasterKey, _config: cloakfs_fs::MountConfig) -> i32 {
    error!("this build has no FUSE support: rebuild with --features fuse");
    exitcodes::MOUNT
}

// ── passphrase entry ─────────────────────────────────────────────────────

/// Read the passphrase, either from an external program's stdout or by
/// prompting on the terminal. `confirm` asks twice and compares (used when
/// setting a new passphrase).
fn read_passphrase(extpass: Option<&str>, confirm: bool) -> Result<SecretString> {
    if let Some(program) = extpass {
        let mut parts = program.split_whitespace();
        let bin = parts.next().context("empty -extpass program")?;
        let output = std::process::Command::new(bin)
            .args(parts)
            .output()
            .with_context(|| format!("running {program:?}"))?;
        if !output.status.success() {
            anyhow::bail!("{program:?} exited with {}", output.status);
        }
        let first_line = output
            .stdout
            .split(|&b| b == b'\n')
            .next()
            .unwrap_or_default();
        let pw = String::from_utf8(first_line.to_vec()).context("passphrase is not UTF-8")?;
        if pw.is_empty() {
            anyhow::bail!("{program:?} printed an empty passphrase");
        }
        return Ok(SecretString::from(pw));
    }

    let pw = rpassword::prompt_password("Passphrase: ").context("failed to read passphrase")?;
    if pw.is_empty() {
        anyhow::bail!("empty passphrase");
    }
    if confirm {
        let again =
            rpassword::prompt_password("Repeat: ").context("failed to read confirmation")?;
        if pw != again {
            anyhow::bail!("passphrases do not match");
        }
    }
    Ok(SecretString::from(pw))
}
