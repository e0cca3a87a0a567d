use clap::{Args, Parser, Subcommand};
use patchup::patch::{create_patch, PatchApplier, ZstdPatch};
use patchup::{archive, PatchTool, UpdateSession, UpdaterConfig};
use std::path::PathBuf;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "patchup", about = "Differential self-updater", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask the host whether a newer build is published
    Check {
        #[command(flatten)]
        updater: UpdaterArgs,
    },
    /// Check, then fetch the newer build into the local cache
    Download {
        #[command(flatten)]
        updater: UpdaterArgs,
    },
    /// Check, download, install the newer build and relaunch it
    Apply {
        #[command(flatten)]
        updater: UpdaterArgs,
    },
    /// Restore the previous build if an earlier install was interrupted
    Recover {
        #[command(flatten)]
        updater: UpdaterArgs,
    },
    /// Print the content hash of an archive
    Hash {
        /// Path to the uncompressed archive
        file: PathBuf,
    },
    /// Create a patch turning one archive into another
    MakePatch {
        /// Path to the old archive
        #[arg(long)]
        old: PathBuf,
        /// Path to the new archive
        #[arg(long)]
        new: PathBuf,
        /// Output path for the patch file
        #[arg(long, short)]
        output: PathBuf,
    },
    /// Apply a patch created by make-patch
    ApplyPatch {
        /// Path to the old archive
        #[arg(long)]
        old: PathBuf,
        /// Path to the patch file
        #[arg(long, short)]
        patch: PathBuf,
        /// Output path for the rebuilt archive
        #[arg(long, short)]
        output: PathBuf,
    },
}

#[derive(Args)]
struct UpdaterArgs {
    /// JSON config file; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,
    /// Local version.json of the running build
    #[arg(long)]
    manifest: Option<PathBuf>,
    /// Cache directory for archives and patches
    #[arg(long)]
    cache_root: Option<PathBuf>,
    /// Path of the installed build to replace
    #[arg(long)]
    install_path: Option<PathBuf>,
    /// External bspatch-compatible binary
    #[arg(long, conflicts_with = "zstd_patches")]
    bspatch: Option<PathBuf>,
    /// Apply patches in-process instead of through bspatch
    #[arg(long)]
    zstd_patches: bool,
}

impl UpdaterArgs {
    fn into_config(self) -> anyhow::Result<UpdaterConfig> {
        let mut config = match &self.config {
            Some(path) => UpdaterConfig::from_file(path)?,
            None => UpdaterConfig::default(),
        };
        if self.manifest.is_some() {
            config.manifest_path = self.manifest;
        }
        if self.cache_root.is_some() {
            config.cache_root = self.cache_root;
        }
        if self.install_path.is_some() {
            config.install_path = self.install_path;
        }
        if let Some(path) = self.bspatch {
            config.patch_tool = PatchTool::Bspatch { path: Some(path) };
        }
        if self.zstd_patches {
            config.patch_tool = PatchTool::Zstd;
        }
        Ok(config)
    }
}

async fn checked_session(updater: UpdaterArgs) -> anyhow::Result<Option<UpdateSession>> {
    let session = UpdateSession::from_config(&updater.into_config()?)?;
    let local = session.local_version().await?;
    println!("Checking for updates...");
    println!("  Installed: {} ({})", local.version, local.hash);
    println!("  Channel: {}", local.channel);

    let info = session.check_for_update().await?;
    if !info.error.is_empty() {
        anyhow::bail!("{}", info.error);
    }
    if !info.update_available {
        println!("\nAlready up to date.");
        return Ok(None);
    }
    println!("\nUpdate available: {} ({})", info.version, info.hash);
    Ok(Some(session))
}

async fn download(session: &UpdateSession) -> anyhow::Result<()> {
    let start = Instant::now();
    session.download_update().await?;
    let elapsed = start.elapsed();

    let patches = session
        .status()
        .history()
        .iter()
        .rev()
        .find_map(|e| e.details.used_patch_path);
    println!("\nUpdate downloaded successfully!");
    println!(
        "  Delivered via: {}",
        if patches == Some(true) { "patches" } else { "full download" }
    );
    println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("patchup=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Check { updater } => {
            checked_session(updater).await?;
        }
        Commands::Download { updater } => {
            if let Some(session) = checked_session(updater).await? {
                download(&session).await?;
            }
        }
        Commands::Apply { updater } => {
            if let Some(session) = checked_session(updater).await? {
                download(&session).await?;
                println!("\nInstalling update...");
                session.apply_update().await?;
            }
        }
        Commands::Recover { updater } => {
            let session = UpdateSession::from_config(&updater.into_config()?)?;
            if session.recover_interrupted_install().await? {
                println!("Previous build restored from backup.");
            } else {
                println!("Nothing to recover.");
            }
        }
        Commands::Hash { file } => {
            let hash = tokio::task::spawn_blocking(move || archive::content_hash_file(&file)).await??;
            println!("{hash}");
        }
        Commands::MakePatch { old, new, output } => {
            println!("Creating patch...");
            println!("  Old: {}", old.display());
            println!("  New: {}", new.display());
            println!("  Output: {}", output.display());

            let start = Instant::now();
            let out = output.clone();
            let size = tokio::task::spawn_blocking(move || create_patch(&old, &new, &out)).await??;
            let elapsed = start.elapsed();

            println!("\nPatch created successfully!");
            println!("  Patch size: {size} bytes");
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
        }
        Commands::ApplyPatch { old, patch, output } => {
            println!("Applying patch...");
            println!("  Old: {}", old.display());
            println!("  Patch: {}", patch.display());
            println!("  Output: {}", output.display());

            let start = Instant::now();
            ZstdPatch.apply(&old, &patch, &output).await?;
            let elapsed = start.elapsed();

            println!("\nPatch applied successfully!");
            println!("  Hash: {}", archive::content_hash_file(&output)?);
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
        }
    }

    Ok(())
}
