//! oima CLI
//!
//! Inventories a container registry and reports which image tags have a
//! detached signature in the companion object storage.
//!
//! # Usage
//!
//! ```bash
//! # Show the effective configuration
//! oima conf
//!
//! # Print the repository/image/tag tree
//! oima image list
//!
//! # Print counters
//! oima registry stats
//!
//! # Remove the signature of one tag
//! oima signature delete team/app:1.0
//! ```

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

use oima_core::{
    Config, DockerRegistry, S3SignatureChecker, SecretBackend, SecretStore, create_store, store,
};

mod output;

#[derive(Parser)]
#[command(name = "oima")]
#[command(about = "OCI image inventory with signature status")]
#[command(version)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the effective configuration
    Conf,

    /// Inspect images
    Image {
        #[command(subcommand)]
        command: ImageCommands,
    },

    /// Inspect the registry
    Registry {
        #[command(subcommand)]
        command: RegistryCommands,
    },

    /// Manage signatures
    Signature {
        #[command(subcommand)]
        command: SignatureCommands,
    },
}

#[derive(Subcommand)]
enum ImageCommands {
    /// List every repository, image and tag
    List,
}

#[derive(Subcommand)]
enum RegistryCommands {
    /// Count repositories, images, tags and signatures
    Stats,
}

#[derive(Subcommand)]
enum SignatureCommands {
    /// Delete the signature of one tag
    Delete {
        /// Image reference (e.g., team/app:1.0)
        reference: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load_from_path(path),
        None => Config::load(),
    }
    .context("failed to load configuration")?;

    init_logging(cli.debug, &config.log_level);
    info!("Loaded configuration from {:?}", config.config_path);

    let store = create_store(config.secret_backend == SecretBackend::Keyring);
    config
        .take_secrets(store.as_ref())
        .await
        .context("failed to move secrets into the secret store")?;

    match cli.command {
        Commands::Conf => show_config(&config, store.as_ref()).await,
        Commands::Image {
            command: ImageCommands::List,
        } => list_images(&config, store).await,
        Commands::Registry {
            command: RegistryCommands::Stats,
        } => show_stats(&config, store).await,
        Commands::Signature {
            command: SignatureCommands::Delete { reference },
        } => delete_signature(&config, store, &reference).await,
    }
}

/// `RUST_LOG` wins, then `--debug`, then the configured level.
fn init_logging(debug: bool, level: &str) {
    let default = if debug { "debug" } else { level };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn show_config(config: &Config, store: &dyn SecretStore) -> Result<()> {
    render_config(&mut std::io::stdout().lock(), config, store).await
}

async fn render_config(
    out: &mut impl std::io::Write,
    config: &Config,
    store: &dyn SecretStore,
) -> Result<()> {
    let password_set = store
        .contains(store::PASSWORD)
        .await
        .context("failed to query the secret store")?;
    output::print_config(out, config, password_set)?;
    Ok(())
}

/// Initialize the registry and fetch the full tree, annotating signatures
/// when object storage is configured.
async fn fetch_registry(
    config: &Config,
    store: Arc<dyn SecretStore>,
) -> Result<(DockerRegistry, bool)> {
    let mut registry = DockerRegistry::new(&config.registry, Arc::clone(&store))?;

    registry
        .init()
        .await
        .with_context(|| format!("failed to initialize registry {}", config.registry.uri))?;
    registry
        .fetch_all()
        .await
        .context("failed to fetch the registry catalog")?;

    let annotated = if config.s3.enabled {
        let checker = S3SignatureChecker::new(&config.s3, store.as_ref())
            .await
            .context("failed to set up signature storage")?;
        registry
            .annotate_signatures(&checker)
            .await
            .context("failed to look up signatures")?;
        true
    } else {
        false
    };

    Ok((registry, annotated))
}

async fn list_images(config: &Config, store: Arc<dyn SecretStore>) -> Result<()> {
    let (registry, annotated) = fetch_registry(config, store).await?;
    output::print_tree(&mut std::io::stdout().lock(), registry.catalog(), annotated)?;
    Ok(())
}

async fn show_stats(config: &Config, store: Arc<dyn SecretStore>) -> Result<()> {
    let (registry, _) = fetch_registry(config, store).await?;
    output::print_stats(&mut std::io::stdout().lock(), &registry.stats())?;
    Ok(())
}

async fn delete_signature(
    config: &Config,
    store: Arc<dyn SecretStore>,
    reference: &str,
) -> Result<()> {
    let (image, tag) = parse_reference(reference)?;
    if !config.s3.enabled {
        bail!("signature storage is disabled; enable [s3] in the configuration");
    }

    let checker = S3SignatureChecker::new(&config.s3, store.as_ref())
        .await
        .context("failed to set up signature storage")?;

    let mut registry = DockerRegistry::new(&config.registry, store)?;
    registry
        .init()
        .await
        .with_context(|| format!("failed to initialize registry {}", config.registry.uri))?;
    registry
        .fetch_all()
        .await
        .context("failed to fetch the registry catalog")?;

    registry
        .delete_signature(image, tag, &checker)
        .await
        .with_context(|| format!("failed to delete signature of {}", reference))?;

    println!("Deleted signature of {}:{}", image, tag);
    Ok(())
}

/// Split `IMAGE:TAG`. The tag follows the last `:` so registry ports in the
/// image part are kept.
fn parse_reference(reference: &str) -> Result<(&str, &str)> {
    match reference.rsplit_once(':') {
        Some((image, tag)) if !image.is_empty() && !tag.is_empty() && !tag.contains('/') => {
            Ok((image, tag))
        }
        _ => bail!("invalid image reference '{}', expected IMAGE:TAG", reference),
    }
}
