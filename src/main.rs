//! Store a filesystem in a flat key-value store, and poke at it from the command line.
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use thiserror::Error;
use tracing::{debug, error};

mod app_config;
mod trc;

use kvfs::backend::{DirBackend, KvBackend, MemoryBackend};
use kvfs::fs::KvFs;
use kvfs::node::FileKind;

use crate::app_config::Config;
use crate::trc::Trc;

/// Bytes read or written per request when streaming whole files.
const CHUNK: usize = 1 << 20;

fn parse_mode(s: &str) -> Result<u32, String> {
    u32::from_str_radix(s.trim_start_matches("0o"), 8).map_err(|e| format!("invalid octal mode: {e}"))
}

#[derive(Parser)]
#[command(version, about = "A POSIX-style filesystem stored in a key-value backend.")]
struct Args {
    #[arg(
        short,
        long,
        value_parser,
        help = "Optional path to a kvfs config TOML."
    )]
    config_path: Option<PathBuf>,

    #[arg(
        long,
        help = "Use a throwaway in-memory backend instead of the configured one."
    )]
    memory: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a directory.
    Mkdir {
        path: String,
        #[arg(short, long, default_value = "755", value_parser = parse_mode)]
        mode: u32,
    },

    /// Copy a local file into the filesystem, replacing any existing file.
    Put { path: String, local: PathBuf },

    /// Print a file to stdout.
    Cat { path: String },

    /// List a directory.
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },

    /// Show the attributes of an object.
    Stat { path: String },

    /// Rename a file or directory.
    Mv { old: String, new: String },

    /// Remove a file.
    Rm { path: String },

    /// Remove an empty directory.
    Rmdir { path: String },

    /// Set the size of a file.
    Truncate { path: String, size: u64 },
}

#[derive(Debug, Error)]
enum CommandError {
    #[error(transparent)]
    Fs(#[from] kvfs::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn put(fs: &KvFs, path: &str, local: &Path) -> Result<(), CommandError> {
    let data = std::fs::read(local)?;
    match fs.getattr(path) {
        Ok(_) => fs.truncate(path, 0)?,
        Err(kvfs::Error::FileDoesNotExist { .. }) => {
            fs.create(path, 0o644)?;
        }
        Err(e) => return Err(e.into()),
    }
    let mut offset = 0u64;
    for chunk in data.chunks(CHUNK) {
        fs.write(path, offset, chunk)?;
        offset += chunk.len() as u64;
    }
    Ok(())
}

fn cat(fs: &KvFs, path: &str) -> Result<(), CommandError> {
    let mut stdout = std::io::stdout().lock();
    let mut offset = 0u64;
    loop {
        let chunk = fs.read(path, offset, CHUNK)?;
        if chunk.is_empty() {
            break;
        }
        stdout.write_all(&chunk)?;
        offset += chunk.len() as u64;
    }
    stdout.flush()?;
    Ok(())
}

fn run(fs: &KvFs, command: Command) -> Result<(), CommandError> {
    match command {
        Command::Mkdir { path, mode } => {
            fs.mkdir(&path, mode)?;
        }
        Command::Put { path, local } => put(fs, &path, &local)?,
        Command::Cat { path } => cat(fs, &path)?,
        Command::Ls { path } => {
            for (name, kind) in fs.readdir(&path)? {
                let marker = match kind {
                    FileKind::Directory => "/",
                    FileKind::Regular => "",
                };
                println!("{name}{marker}");
            }
        }
        Command::Stat { path } => {
            let attributes = fs.getattr(&path)?;
            println!("  path: {path}");
            println!("  kind: {:?}", attributes.kind);
            println!("  mode: {:o}", attributes.mode);
            println!("  size: {}", attributes.size);
            println!(" links: {}", attributes.link_count);
            println!(" owner: {}:{}", attributes.owner, attributes.group);
            println!(" mtime: {:?}", attributes.mtime);
            println!(" ctime: {:?}", attributes.ctime);
        }
        Command::Mv { old, new } => fs.rename(&old, &new)?,
        Command::Rm { path } => fs.unlink(&path)?,
        Command::Rmdir { path } => fs.rmdir(&path)?,
        Command::Truncate { path, size } => fs.truncate(&path, size)?,
    }
    Ok(())
}

/// Main entry point for the application.
fn main() {
    let args = Args::parse();

    // Errors use eprintln since tracing isn't initialized yet.
    let config = Config::load_or_default(args.config_path.as_deref()).unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {e}");
        std::process::exit(1);
    });

    Trc::default().init().unwrap_or_else(|e| {
        eprintln!(
            "Failed to initialize logging. Without logging, we can't provide any useful error \
             messages, so we have to exit: {e}"
        );
        std::process::exit(1);
    });

    let backend: Arc<dyn KvBackend> = if args.memory {
        Arc::new(MemoryBackend::new())
    } else {
        match DirBackend::open(config.backend.path.clone()) {
            Ok(backend) => Arc::new(backend),
            Err(e) => {
                error!(path = %config.backend.path.display(), "Failed to open backend: {e}");
                std::process::exit(1);
            }
        }
    };

    debug!(config = ?config, "Mounting with configuration...");
    let fs = match KvFs::mount(backend, config.mount_options()) {
        Ok(fs) => fs,
        Err(e) => {
            error!("Failed to mount: {e}");
            std::process::exit(1);
        }
    };

    let outcome = run(&fs, args.command);
    drop(fs);
    if let Err(e) = outcome {
        error!("{e}");
        std::process::exit(1);
    }
}
