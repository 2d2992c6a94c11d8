mod cli;

use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use qbrouter_config::{ClientConfig, Config, ConfigLoader, ConfigLoaderOptions};
use qbrouter_core::migration::GIB;
use qbrouter_core::sync::RsyncMirror;
use qbrouter_core::{CachedClient, MigrationEngine, QbittorrentClient, SyncEngine, TorrentClient};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::{Cli, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_loaded = match dotenvy::dotenv() {
        Ok(_) => true,
        Err(dotenvy::Error::Io(_)) => false,
        Err(err) => return Err(err).context("failed to parse .env"),
    };

    let cli = Cli::parse();
    init_tracing(cli.run.debug());
    if env_loaded {
        info!("loaded environment from .env");
    }

    let loader = ConfigLoader::with_options(ConfigLoaderOptions {
        config_path: cli.run.config.clone(),
        overrides: cli.run.overrides(),
    });
    let load = loader.load().context("failed to load configuration")?;
    for warning in load.warnings.iter() {
        if let Some(hint) = &warning.hint {
            warn!(message = %warning.message, hint = %hint, "configuration warning");
        } else {
            warn!(message = %warning.message, "configuration warning");
        }
    }
    let config = load.config;
    info!(
        config_path = ?config.metadata.config_path,
        source = %config.paths.source.display(),
        destination = %config.paths.destination.display(),
        source_url = %config.source.url,
        destination_url = %config.destination.url,
        dry_run = config.dry_run,
        "configuration loaded"
    );

    match cli.command {
        Some(Command::Check) => check(&config).await,
        None => run(config).await,
    }
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()))
        .with(fmt::layer())
        .init();
}

async fn connect(label: &str, client: &ClientConfig) -> anyhow::Result<Arc<dyn TorrentClient>> {
    let api = QbittorrentClient::authenticate(
        label,
        client.url.as_str(),
        &client.username,
        &client.password,
    )
    .await
    .with_context(|| format!("failed to log in to the {label} client at {}", client.url))?;
    info!(client = label, url = %client.url, "logged in");
    Ok(Arc::new(CachedClient::new(api)))
}

async fn run(config: Config) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    let source = connect("source", &config.source).await?;
    let destination = connect("destination", &config.destination).await?;

    let mut mirror = RsyncMirror::new(&config.sync.rsync_path);
    if let Some(flags) = &config.sync.rsync_flags {
        mirror = mirror.with_flags(flags.iter().cloned());
    }
    let sync = SyncEngine::new(config.sync_config(), Arc::new(mirror));
    let migration = MigrationEngine::new(source, destination, config.migration_config());

    // A sync engine that cannot start takes the migration loop down with it.
    let sync_task = async {
        let result = sync.run(cancel.clone()).await;
        if result.is_err() {
            cancel.cancel();
        }
        result
    };
    let (sync_result, ()) = tokio::join!(sync_task, migration.run(cancel.clone()));
    sync_result.context("sync engine failed")?;

    info!("qbrouter stopped");
    Ok(())
}

async fn check(config: &Config) -> anyhow::Result<()> {
    if !config.paths.source.is_dir() {
        bail!(
            "source path {} is not a directory",
            config.paths.source.display()
        );
    }
    if !config.paths.destination.is_dir() {
        warn!(
            path = %config.paths.destination.display(),
            "destination path does not exist yet; the first sync will create it"
        );
    }

    for (label, client_config) in [
        ("source", &config.source),
        ("destination", &config.destination),
    ] {
        let client = connect(label, client_config).await?;
        let save_path = client
            .default_save_path()
            .await
            .with_context(|| format!("failed to read the {label} default save path"))?;
        let free = client
            .free_space()
            .await
            .with_context(|| format!("failed to read {label} free space"))?;
        info!(
            client = label,
            save_path = %save_path.display(),
            free_gib = free as f64 / GIB as f64,
            "client reachable"
        );
    }

    info!("configuration OK");
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    info!("shutdown requested; finishing in-flight work");
    cancel.cancel();
}
