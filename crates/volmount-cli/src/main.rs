//! volmount command-line interface for mounting configured volumes and
//! managing encrypted containers by hand.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::{debug, warn};
use rpassword::prompt_password;
use schemars::schema_for;
use serde_json::to_string_pretty;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use volmount_core::{
    config::DEFAULT_CONFIG_PATH,
    crypto::{CryptoProvider, EhdMountInfo, EhdMountRequest, LowerDevice, UnloadOutcome},
    keyfile::{cipher_digest_security, decrypt_key_file, SecurityLevel},
    logging,
    mtab::{Cmtab, CmtabEntry, CmtabField, Smtab, SmtabField},
    privilege::UserIdentity,
    MountService, Volume, VolmountConfig, VolmountError, VolmountResult,
};
use volmount_dmcrypt::SystemDmCryptProvider;
use zeroize::{Zeroize, Zeroizing};

/// Top-level command-line options shared by every subcommand.
#[derive(Parser, Debug)]
#[command(
    name = "volmount",
    version,
    about = "Mount per-user volumes and manage dm-crypt containers."
)]
struct Cli {
    /// Path to the volmount configuration file.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Trace every step and print helper output.
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Mount the configured volumes of a user.
    Mount {
        /// Owner of the volumes; defaults to the invoking user.
        #[arg(short, long)]
        user: Option<String>,

        /// Restrict to these mountpoints.
        mountpoints: Vec<PathBuf>,

        #[command(flatten)]
        password: PasswordArgs,
    },

    /// Unmount the configured volumes of a user, last one first.
    #[command(alias = "unmount")]
    Umount {
        /// Owner of the volumes; defaults to the invoking user.
        #[arg(short, long)]
        user: Option<String>,

        /// Restrict to these mountpoints.
        mountpoints: Vec<PathBuf>,
    },

    /// Attach a container and open its dm-crypt mapping.
    CryptLoad {
        /// Container file or block device.
        container: PathBuf,

        /// Record the mapping in the cmtab under this mountpoint.
        #[arg(long)]
        mountpoint: Option<PathBuf>,

        /// Cipher for plain mappings (e.g. aes-cbc-essiv:sha256).
        #[arg(long)]
        fs_cipher: Option<String>,

        /// Hash for plain mappings.
        #[arg(long)]
        fs_hash: Option<String>,

        /// Truncate the key to this many bytes.
        #[arg(long)]
        key_size: Option<usize>,

        /// Open the mapping read-only.
        #[arg(long)]
        readonly: bool,

        #[command(flatten)]
        key: KeyFileArgs,

        #[command(flatten)]
        password: PasswordArgs,
    },

    /// Close a dm-crypt mapping and release its loop device.
    CryptUnload {
        /// Container, mountpoint, loop device or crypto device.
        target: String,

        /// Which cmtab column `target` names.
        #[arg(long, value_enum, default_value = "container")]
        by: LookupField,

        /// Leave the loop device attached.
        #[arg(long)]
        keep_loop: bool,
    },

    /// Print the most recent association record matching a value.
    Lookup {
        #[arg(value_enum)]
        table: Table,

        #[arg(long, value_enum, default_value = "mountpoint")]
        field: LookupField,

        value: String,
    },

    /// Decrypt a key file and print the key as hex.
    DecryptKey {
        path: PathBuf,

        /// Digest used to derive key and IV (e.g. md5, sha256).
        #[arg(long, default_value = "md5")]
        digest: String,

        /// Cipher the file was encrypted with (e.g. aes-256-cbc).
        #[arg(long, default_value = "aes-256-cbc")]
        cipher: String,

        #[command(flatten)]
        password: PasswordArgs,
    },

    /// Rate a cipher or digest specification.
    CheckCipher { spec: String },

    /// Validate a configuration file or emit the config schema.
    Validate {
        /// Path to the configuration file to validate.
        #[arg(short = 'f', long, default_value = DEFAULT_CONFIG_PATH)]
        file: PathBuf,

        /// Output the JSON schema instead of validating a file.
        #[arg(long)]
        schema: bool,
    },
}

#[derive(clap::Args, Debug)]
struct PasswordArgs {
    /// Read the password from the first line of stdin.
    #[arg(long, conflicts_with = "no_password")]
    password_stdin: bool,

    /// Do not ask for a password.
    #[arg(long)]
    no_password: bool,
}

#[derive(clap::Args, Debug)]
struct KeyFileArgs {
    /// Encrypted key file; the password decrypts it.
    #[arg(long)]
    key_file: Option<PathBuf>,

    #[arg(long, default_value = "md5", requires = "key_file")]
    key_digest: String,

    #[arg(long, default_value = "aes-256-cbc", requires = "key_file")]
    key_cipher: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Table {
    Cmtab,
    Smtab,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LookupField {
    Mountpoint,
    Container,
    LoopDevice,
    CryptoDevice,
    Device,
}

impl LookupField {
    fn cmtab(self) -> Result<CmtabField> {
        Ok(match self {
            LookupField::Mountpoint => CmtabField::Mountpoint,
            LookupField::Container => CmtabField::Container,
            LookupField::LoopDevice => CmtabField::LoopDevice,
            LookupField::CryptoDevice => CmtabField::CryptoDevice,
            LookupField::Device => bail!("the cmtab has no `device` column"),
        })
    }

    fn smtab(self) -> Result<SmtabField> {
        Ok(match self {
            LookupField::Mountpoint => SmtabField::Mountpoint,
            LookupField::Device | LookupField::Container => SmtabField::Device,
            other => bail!("the smtab has no {other:?} column"),
        })
    }
}

/// Entry point: parse arguments and surface errors with an exit code.
fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Mount {
            user,
            mountpoints,
            password,
        } => {
            let config = load_cli_config(&cli.config, cli.debug)?;
            let user = resolve_user(user)?;
            let mut volumes = select_volumes(&config, &user, &mountpoints);
            if volumes.is_empty() {
                println!("No volumes configured for {}.", user.name);
                return Ok(());
            }
            let token = read_password(&password, "Password: ")?;

            let crypto = crypto_provider(&config);
            let service = MountService::new(Arc::new(config), crypto.as_ref());
            if !service.mount_all(&mut volumes, token.as_deref().map(|t| t.as_bytes())) {
                bail!("one or more volumes failed to mount");
            }
            println!("Mounted {} volume(s) for {}.", volumes.len(), user.name);
        }
        Commands::Umount { user, mountpoints } => {
            let config = load_cli_config(&cli.config, cli.debug)?;
            let user = resolve_user(user)?;
            let mut volumes = select_volumes(&config, &user, &mountpoints);
            if volumes.is_empty() {
                println!("No volumes configured for {}.", user.name);
                return Ok(());
            }

            let crypto = crypto_provider(&config);
            let service = MountService::new(Arc::new(config), crypto.as_ref());
            if !service.unmount_all(&mut volumes) {
                bail!("one or more volumes failed to unmount");
            }
            println!("Unmounted {} volume(s) for {}.", volumes.len(), user.name);
        }
        Commands::CryptLoad {
            container,
            mountpoint,
            fs_cipher,
            fs_hash,
            key_size,
            readonly,
            key,
            password,
        } => {
            let config = load_cli_config(&cli.config, cli.debug)?;
            let provider = SystemDmCryptProvider::from_config(&config)?;
            let secret = container_key(&key, &password)?;

            let mut request = EhdMountRequest::new(&container, secret);
            request.mountpoint = mountpoint.clone();
            request.fs_cipher = fs_cipher;
            request.fs_hash = fs_hash;
            request.trunc_keysize = key_size;
            request.readonly = readonly;
            for spec in [&request.fs_cipher, &request.fs_hash].into_iter().flatten() {
                if cipher_digest_security(spec) == SecurityLevel::Blacklisted {
                    warn!("{spec} is blacklisted");
                }
            }

            let info = provider
                .load(&request)
                .with_context(|| format!("failed to load {}", container.display()))?;
            if let Some(mountpoint) = &mountpoint {
                let cmtab = service_cmtab(&config);
                if let Err(err) = cmtab.add(&info.to_cmtab(mountpoint)) {
                    provider.unload(&info, LowerDevice::Release)?;
                    return Err(err).context("failed to record the mapping in the cmtab");
                }
            }
            println!("{}", info.crypto_device.display());
        }
        Commands::CryptUnload {
            target,
            by,
            keep_loop,
        } => {
            let config = load_cli_config(&cli.config, cli.debug)?;
            let provider = SystemDmCryptProvider::from_config(&config)?;
            let cmtab = service_cmtab(&config);
            let field = by.cmtab()?;

            let recorded = cmtab.get(field, &target)?;
            let info = match (&recorded, field) {
                (Some(entry), _) => EhdMountInfo::from_cmtab(entry),
                (None, CmtabField::Container) => {
                    debug!("{target} is not in the cmtab; deriving the mapping name");
                    EhdMountInfo::from_cmtab(&CmtabEntry {
                        mountpoint: String::new(),
                        container: target.clone(),
                        loop_device: None,
                        crypto_device: None,
                    })
                }
                (None, _) => bail!("no cmtab record for {target}"),
            };

            let lower = if keep_loop {
                LowerDevice::Keep
            } else {
                LowerDevice::Release
            };
            let outcome = provider
                .unload(&info, lower)
                .with_context(|| format!("failed to unload {}", info.crypto_name))?;
            if recorded.is_some() {
                cmtab.remove(field, &target)?;
            }
            match outcome {
                UnloadOutcome::Removed => println!("Closed {}.", info.crypto_device.display()),
                UnloadOutcome::NothingToDo => {
                    println!("{} was not active.", info.crypto_device.display())
                }
            }
        }
        Commands::Lookup {
            table,
            field,
            value,
        } => {
            let config = load_cli_config(&cli.config, cli.debug)?;
            match table {
                Table::Cmtab => {
                    let Some(entry) = service_cmtab(&config).get(field.cmtab()?, &value)? else {
                        bail!("no cmtab record for {value}");
                    };
                    println!(
                        "{}\t{}\t{}\t{}",
                        entry.mountpoint,
                        entry.container,
                        entry.loop_device.as_deref().unwrap_or("-"),
                        entry.crypto_device.as_deref().unwrap_or("-")
                    );
                }
                Table::Smtab => {
                    let smtab = Smtab::new(config.paths.smtab.clone());
                    let Some(entry) = smtab.get(field.smtab()?, &value)? else {
                        bail!("no smtab record for {value}");
                    };
                    println!(
                        "{} {} {} {}",
                        entry.device, entry.mountpoint, entry.fstype, entry.options
                    );
                }
            }
        }
        Commands::DecryptKey {
            path,
            digest,
            cipher,
            password,
        } => {
            logging::init(logging::level_for(cli.debug));
            let Some(passphrase) = read_password(&password, "Key file password: ")? else {
                bail!("a password is required to decrypt {}", path.display());
            };
            let key = decrypt_key_file(&path, &digest, &cipher, passphrase.as_bytes())?;
            let mut encoded = hex::encode(key.as_slice());
            println!("{encoded}");
            encoded.zeroize();
        }
        Commands::CheckCipher { spec } => {
            println!("{spec}: {}", cipher_digest_security(&spec).as_str());
        }
        Commands::Validate { file, schema } => {
            if schema {
                let schema = schema_for!(VolmountConfig);
                println!("{}", to_string_pretty(&schema)?);
                return Ok(());
            }

            let cfg = VolmountConfig::load(&file)
                .with_context(|| format!("failed to load {}", file.display()))?;
            let issues = cfg.validate();
            if issues.is_empty() {
                println!(
                    "Configuration valid ({} volumes, {} command templates).",
                    cfg.volumes.len(),
                    cfg.commands.values().filter(|t| !t.is_empty()).count()
                );
            } else {
                eprintln!("Configuration validation failed:");
                for issue in issues {
                    eprintln!("  - {issue}");
                }
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

/// Load the config and install the logger at the level it asks for.
fn load_cli_config(path: &Path, debug: bool) -> Result<VolmountConfig> {
    let config = VolmountConfig::load(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;
    logging::init(logging::level_for(debug || config.policy.debug));
    debug!("loaded {} ({:?})", config.path.display(), config.format);
    Ok(config)
}

fn resolve_user(name: Option<String>) -> Result<UserIdentity> {
    let user = match name {
        Some(name) => UserIdentity::lookup(&name),
        None => UserIdentity::current(),
    };
    user.context("failed to resolve the target user")
}

/// Volumes owned by `user` (or by `*`), filtered to `mountpoints` when given.
fn select_volumes(config: &VolmountConfig, user: &UserIdentity, mountpoints: &[PathBuf]) -> Vec<Volume> {
    config
        .volumes
        .iter()
        .filter(|volume| volume.user == user.name || volume.user == "*")
        .cloned()
        .map(|mut volume| {
            volume.user = user.name.clone();
            volume.expand(user);
            volume
        })
        .filter(|volume| mountpoints.is_empty() || mountpoints.contains(&volume.mountpoint))
        .collect()
}

fn read_password(args: &PasswordArgs, prompt: &str) -> Result<Option<Zeroizing<String>>> {
    if args.no_password {
        return Ok(None);
    }
    if args.password_stdin {
        let mut line = Zeroizing::new(String::new());
        io::stdin()
            .lock()
            .read_line(&mut line)
            .context("failed to read the password from stdin")?;
        let trimmed = line.trim_end_matches(['\r', '\n']).len();
        line.truncate(trimmed);
        return Ok(Some(line));
    }
    Ok(Some(Zeroizing::new(prompt_password(prompt)?)))
}

/// Key for a container: the decrypted key file, or the password itself.
fn container_key(key: &KeyFileArgs, password: &PasswordArgs) -> Result<Zeroizing<Vec<u8>>> {
    let Some(passphrase) = read_password(password, "Password: ")? else {
        bail!("a password is required to open a container");
    };
    match &key.key_file {
        Some(path) => Ok(decrypt_key_file(
            path,
            &key.key_digest,
            &key.key_cipher,
            passphrase.as_bytes(),
        )?),
        None => Ok(Zeroizing::new(passphrase.as_bytes().to_vec())),
    }
}

fn service_cmtab(config: &VolmountConfig) -> Cmtab {
    Cmtab::new(config.paths.cmtab.clone())
}

/// Stands in for dm-crypt on hosts without `cryptsetup`/`losetup`, so
/// non-crypt volumes still mount.
struct Unavailable(String);

impl CryptoProvider for Unavailable {
    fn load(&self, _request: &EhdMountRequest) -> VolmountResult<EhdMountInfo> {
        Err(VolmountError::Provider(self.0.clone()))
    }

    fn unload(&self, _info: &EhdMountInfo, _lower: LowerDevice) -> VolmountResult<UnloadOutcome> {
        Err(VolmountError::Provider(self.0.clone()))
    }
}

fn crypto_provider(config: &VolmountConfig) -> Box<dyn CryptoProvider> {
    match SystemDmCryptProvider::from_config(config) {
        Ok(provider) => Box::new(provider),
        Err(err) => {
            debug!("dm-crypt backend unavailable: {err}");
            Box::new(Unavailable(format!("dm-crypt backend unavailable: {err}")))
        }
    }
}
