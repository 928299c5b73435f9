use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tenantdoc::storage::{InMemoryBackend, LocalObjectStorage};
use tenantdoc::{Engine, EngineConfig};

#[derive(Parser)]
#[command(name = "tenantdoc")]
#[command(about = "Maintenance tooling for the tenantdoc engine")]
struct Cli {
    /// Engine configuration (JSON). Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Runs one GC pass over a snapshot and writes the snapshot back.
    Gc {
        #[arg(long)]
        snapshot: PathBuf,
        #[arg(long)]
        objects: PathBuf,
    },
    /// Prints the checkpoint of the last GC run recorded in a snapshot.
    Checkpoint {
        #[arg(long)]
        snapshot: PathBuf,
    },
    /// Prints the effective configuration.
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref()).await?;

    match cli.command {
        Command::Gc { snapshot, objects } => run_gc(config, &snapshot, objects).await,
        Command::Checkpoint { snapshot } => print_checkpoint(config, &snapshot).await,
        Command::Config => {
            println!("{}", config.to_json_pretty()?);
            Ok(())
        }
    }
}

async fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load(path)
            .await
            .with_context(|| format!("failed to load config {}", path.display())),
        None => Ok(EngineConfig::default()),
    }
}

async fn open_engine(
    config: EngineConfig,
    snapshot: &Path,
    objects: Option<PathBuf>,
) -> Result<(Engine, InMemoryBackend)> {
    let backend = InMemoryBackend::load_snapshot(snapshot)
        .await
        .with_context(|| format!("failed to open snapshot {}", snapshot.display()))?;
    let mut builder = Engine::builder()
        .config(config)
        .backend(Arc::new(backend.clone()));
    if let Some(root) = objects {
        builder = builder.objects(Arc::new(LocalObjectStorage::new(root)));
    }
    Ok((builder.build()?, backend))
}

async fn run_gc(config: EngineConfig, snapshot: &Path, objects: PathBuf) -> Result<()> {
    let (engine, backend) = open_engine(config, snapshot, Some(objects)).await?;
    let outcome = engine.run_gc().await;
    // keep whatever the completed steps reclaimed, even on abort
    backend
        .save_snapshot(snapshot)
        .await
        .with_context(|| format!("failed to write snapshot {}", snapshot.display()))?;

    let checkpoint = outcome.context("gc run aborted")?;
    println!("{}", serde_json::to_string_pretty(&checkpoint)?);
    Ok(())
}

async fn print_checkpoint(config: EngineConfig, snapshot: &Path) -> Result<()> {
    let (engine, _) = open_engine(config, snapshot, None).await?;
    match engine.gc_checkpoint().await? {
        Some(checkpoint) => println!("{}", serde_json::to_string_pretty(&checkpoint)?),
        None => println!("no gc run recorded"),
    }
    Ok(())
}
