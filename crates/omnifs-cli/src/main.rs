//! omnifs command-line tool.
//!
//! Every path argument is either a URI (`ftp://amy@host/pub/x`,
//! `davs://host/docs/`, `archive:///...#file%3A...`) or a local path.
//!
//! ## Usage
//!
//! ```bash
//! omnifs ls ftp://anonymous@ftp.example.org/pub
//! omnifs cp --progress ./report.pdf davs://amy@dav.example.org/docs/report.pdf --password hunter2
//! omnifs mv --atomic ftp://host/a.txt ftp://host/b.txt
//! omnifs archive backup.tar.zst ./notes ./photos
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt};

use omnifs_kernel::OmnifsConfig;
use omnifs_kernel::vfs::backends::archive::{ArchiveFormat, create_archive};
use omnifs_kernel::vfs::{
    ByteString, ContentReader, CopyOptions, FileMetadata, FileType, Registry, Uri, VfsPath,
};

/// One filesystem API over local disks, archives, FTP and WebDAV.
#[derive(Parser, Debug)]
#[command(name = "omnifs", version)]
struct Args {
    /// Password for the network roots named on the command line
    #[arg(long, global = true)]
    password: Option<String>,

    /// Config file (default: $OMNIFS_CONFIG or ~/.config/omnifs/config.ron)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List a directory
    Ls {
        path: String,
        /// Show type, size and modification time
        #[arg(short, long)]
        long: bool,
    },
    /// Show metadata
    Stat {
        path: String,
        /// Describe a symbolic link itself rather than its target
        #[arg(long)]
        no_follow: bool,
    },
    /// Write file contents to stdout
    Cat { paths: Vec<String> },
    /// Copy a file, or a tree with --recursive
    Cp {
        source: String,
        target: String,
        #[arg(long)]
        replace: bool,
        #[arg(short, long)]
        recursive: bool,
        /// Copy permission bits where both sides have them
        #[arg(long)]
        preserve: bool,
        /// Report bytes copied on stderr
        #[arg(long)]
        progress: bool,
    },
    /// Move or rename
    Mv {
        source: String,
        target: String,
        #[arg(long)]
        replace: bool,
        /// Fail unless the move is a single atomic rename
        #[arg(long)]
        atomic: bool,
        #[arg(long)]
        progress: bool,
    },
    /// Delete a file or an empty directory
    Rm {
        path: String,
        #[arg(short, long)]
        recursive: bool,
    },
    /// Create a directory
    Mkdir {
        path: String,
        #[arg(short, long)]
        parents: bool,
    },
    /// Create a link at LINK pointing to TARGET
    Ln {
        target: String,
        link: String,
        #[arg(short, long)]
        symbolic: bool,
    },
    /// Pack files and directories into a tar, tar.zst or tar.xz archive
    Archive {
        output: String,
        #[arg(required = true)]
        sources: Vec<String>,
        /// Format; guessed from the output name when omitted
        #[arg(long)]
        format: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("omnifs: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<OmnifsConfig> {
    let config = match path {
        Some(path) => OmnifsConfig::load_from(path)?,
        None => OmnifsConfig::load()?,
    };
    Ok(config)
}

async fn run(args: Args) -> Result<()> {
    let registry = Registry::with_default_providers(load_config(args.config.as_ref())?);
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupted, cancelling");
                cancel.cancel();
            }
        });
    }

    let cli = Cli {
        registry: registry.clone(),
        password: args.password,
        cancel,
    };
    let result = cli.dispatch(args.command).await;
    if let Err(e) = registry.close_all().await {
        tracing::warn!(error = %e, "failed to close file systems");
    }
    result
}

struct Cli {
    registry: Arc<Registry>,
    password: Option<String>,
    cancel: CancellationToken,
}

impl Cli {
    /// Resolve an argument, registering the password for its root first
    /// so network backends see it when they are constructed.
    fn path(&self, input: &str) -> Result<VfsPath> {
        if let Some(password) = &self.password {
            if let Ok(uri) = Uri::parse(input) {
                if uri.scheme().is_some() {
                    let root = VfsPath::from_uri(&uri).root_uri().clone();
                    self.registry.credentials().set_password(&root, password.clone());
                }
            }
        }
        self.registry
            .parse(input)
            .with_context(|| format!("cannot resolve {input}"))
    }

    fn copy_options(&self, replace: bool, progress: bool) -> CopyOptions {
        let mut options = self.registry.copy_options();
        options.replace_existing = replace;
        if progress {
            let interval = options.progress_interval;
            options = options.with_progress(
                interval,
                Arc::new(|copied| eprintln!("{copied} bytes")),
            );
        }
        options
    }

    async fn dispatch(&self, command: Command) -> Result<()> {
        match command {
            Command::Ls { path, long } => self.ls(&path, long).await,
            Command::Stat { path, no_follow } => {
                let path = self.path(&path)?;
                let meta = self.registry.metadata(&path, !no_follow).await?;
                print_stat(&path, &meta);
                Ok(())
            }
            Command::Cat { paths } => self.cat(&paths).await,
            Command::Cp {
                source,
                target,
                replace,
                recursive,
                preserve,
                progress,
            } => {
                let (source, target) = (self.path(&source)?, self.path(&target)?);
                let mut options = self.copy_options(replace, progress);
                options.copy_attributes = preserve;
                if recursive {
                    self.registry
                        .copy_recursively(&source, &target, &options, &self.cancel)
                        .await?;
                } else {
                    self.registry
                        .copy(&source, &target, &options, &self.cancel)
                        .await?;
                }
                Ok(())
            }
            Command::Mv {
                source,
                target,
                replace,
                atomic,
                progress,
            } => {
                let (source, target) = (self.path(&source)?, self.path(&target)?);
                let mut options = self.copy_options(replace, progress);
                options.atomic_move = atomic;
                self.registry
                    .move_file(&source, &target, &options, &self.cancel)
                    .await?;
                Ok(())
            }
            Command::Rm { path, recursive } => {
                let path = self.path(&path)?;
                if recursive {
                    self.registry.delete_recursively(&path, &self.cancel).await?;
                } else {
                    self.registry.delete(&path).await?;
                }
                Ok(())
            }
            Command::Mkdir { path, parents } => {
                let path = self.path(&path)?;
                if parents {
                    self.registry.create_directories(&path).await?;
                } else {
                    self.registry.create_directory(&path).await?;
                }
                Ok(())
            }
            Command::Ln {
                target,
                link,
                symbolic,
            } => {
                let link = self.path(&link)?;
                if symbolic {
                    self.registry
                        .create_symlink(&link, &ByteString::from(target.as_str()))
                        .await?;
                } else {
                    let existing = self.path(&target)?;
                    self.registry.create_link(&link, &existing).await?;
                }
                Ok(())
            }
            Command::Archive {
                output,
                sources,
                format,
            } => {
                let output = self.path(&output)?;
                let format = match format {
                    Some(name) => ArchiveFormat::from_str(&name)
                        .map_err(|_| anyhow::anyhow!("unknown archive format {name:?}"))?,
                    None => output
                        .file_name()
                        .and_then(|name| ArchiveFormat::from_name(name.as_bytes()))
                        .context("cannot guess the archive format; pass --format")?,
                };
                let sources = sources
                    .iter()
                    .map(|s| self.path(s))
                    .collect::<Result<Vec<_>>>()?;
                create_archive(&self.registry, &sources, &output, format, &self.cancel).await?;
                Ok(())
            }
        }
    }

    async fn ls(&self, input: &str, long: bool) -> Result<()> {
        let dir = self.path(input)?;
        let mut entries = self.registry.list(&dir).await?;
        entries.sort_by(|a, b| a.name.as_bytes().cmp(b.name.as_bytes()));
        for entry in entries {
            if !long {
                println!("{}", entry.name);
                continue;
            }
            let meta = match entry.metadata {
                Some(meta) => meta,
                None => {
                    self.registry
                        .metadata(&dir.resolve_name(entry.name.as_bytes()), false)
                        .await?
                }
            };
            println!(
                "{} {:>12} {} {}",
                type_char(meta.file_type),
                meta.size,
                format_time(meta.last_modified),
                entry.name
            );
        }
        Ok(())
    }

    async fn cat(&self, inputs: &[String]) -> Result<()> {
        if inputs.is_empty() {
            bail!("nothing to cat");
        }
        let mut stdout = tokio::io::stdout();
        let mut buf = vec![0u8; 64 * 1024];
        for input in inputs {
            let path = self.path(input)?;
            let mut reader = self.registry.open_reader(&path).await?;
            loop {
                let n = reader.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                stdout.write_all(&buf[..n]).await?;
            }
            reader.close().await?;
        }
        stdout.flush().await?;
        Ok(())
    }
}

fn type_char(file_type: FileType) -> char {
    match file_type {
        FileType::Directory => 'd',
        FileType::Symlink => 'l',
        FileType::Regular => '-',
        FileType::Other => '?',
    }
}

fn format_time(time: std::time::SystemTime) -> String {
    chrono::DateTime::<chrono::Local>::from(time)
        .format("%Y-%m-%d %H:%M")
        .to_string()
}

fn print_stat(path: &VfsPath, meta: &FileMetadata) {
    println!("path:     {}", path.to_uri());
    println!("type:     {:?}", meta.file_type);
    println!("size:     {}", meta.size);
    println!("modified: {}", format_time(meta.last_modified));
    if let Some(created) = meta.creation {
        println!("created:  {}", format_time(created));
    }
    if let Some(mode) = meta.mode {
        println!("mode:     {mode:o}");
    }
    if let Some(owner) = &meta.owner {
        println!("owner:    {}", owner.id);
    }
    if let Some(mime) = &meta.mime_type {
        println!("mime:     {mime}");
    }
    if meta.encrypted {
        println!("encrypted");
    }
}
