use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use tracing::info;

use fieldbox_core::combine::CombinerRegistry;
use fieldbox_core::config::Config;
use fieldbox_core::coordinator::{CoordinatorSettings, UploadCoordinator};
use fieldbox_core::logging::init_logging;
use fieldbox_core::oracle::FixedBatchOracle;
use fieldbox_core::store::{DiskProbe, OutboxStore};
use fieldbox_core::transport::{HttpTransport, Transport};

use crate::cli::{Cli, Command};

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_deref())?;
    init_logging(&config.logging).context("failed to initialize logging")?;

    match cli.command {
        Command::Enqueue { stream, data, file } => enqueue(&config, &stream, data, file),
        Command::Stats { json } => stats(&config, json),
        Command::Sync => sync(&config).await,
        Command::Run => run_coordinator(&config).await,
        Command::Cleanup { aggressive } => cleanup(&config, aggressive),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => {
            let default = Path::new("fieldbox.toml");
            if default.exists() {
                Config::load(default).context("failed to load ./fieldbox.toml")
            } else {
                Ok(Config::default())
            }
        }
    }
}

fn open_store(config: &Config) -> anyhow::Result<Arc<OutboxStore>> {
    let db_path = &config.storage.db_path;
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }
    let mut store =
        OutboxStore::open(db_path, config.streams.enabled.clone(), config.limits())
            .with_context(|| format!("failed to open queue at {}", db_path.display()))?;

    let probe_path = db_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    store.set_storage_probe(Box::new(DiskProbe::new(probe_path)));
    Ok(Arc::new(store))
}

fn build_coordinator(
    config: &Config,
    store: Arc<OutboxStore>,
) -> anyhow::Result<Arc<UploadCoordinator>> {
    let transport =
        HttpTransport::new(Duration::from_secs(config.upload.request_timeout_secs))
            .context("failed to build HTTP client")?;
    let settings = CoordinatorSettings {
        upload_interval: config.upload_interval(),
        breaker: config.breaker_config(),
        ..CoordinatorSettings::default()
    };
    Ok(Arc::new(UploadCoordinator::new(
        store,
        Arc::new(transport) as Arc<dyn Transport>,
        Arc::new(config.clone()),
        Arc::new(FixedBatchOracle::default()),
        CombinerRegistry::json_lines(config.streams.enabled.clone()),
        settings,
    )))
}

fn enqueue(
    config: &Config,
    stream: &str,
    data: Option<String>,
    file: Option<PathBuf>,
) -> anyhow::Result<()> {
    let payload = match (data, file) {
        (Some(data), None) => data.into_bytes(),
        (None, Some(path)) => std::fs::read(&path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        (None, None) => {
            let mut buf = Vec::new();
            std::io::stdin()
                .read_to_end(&mut buf)
                .context("failed to read payload from stdin")?;
            buf
        }
        (Some(_), Some(_)) => bail!("pass either --data or --file, not both"),
    };

    let store = open_store(config)?;
    let id = store.enqueue(stream, &payload)?;
    println!("enqueued record {id} ({} bytes) on {stream}", payload.len());
    Ok(())
}

fn stats(config: &Config, json: bool) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let stats = store.stats()?;
    let streams = store.stream_counts()?;

    if json {
        let per_stream: serde_json::Map<String, serde_json::Value> = streams
            .into_iter()
            .map(|(name, count)| (name, serde_json::Value::from(count)))
            .collect();
        let out = serde_json::json!({
            "queue": stats,
            "streams": per_stream,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!("pending:     {}", stats.pending);
        println!("failed:      {}", stats.failed);
        println!("total live:  {}", stats.total);
        println!("total bytes: {}", stats.total_bytes);
        for (name, count) in streams {
            println!("  {name}: {count} queued");
        }
    }
    Ok(())
}

async fn sync(config: &Config) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let coordinator = build_coordinator(config, store)?;
    if coordinator.trigger_manual_upload().await {
        println!("sync complete");
        Ok(())
    } else {
        bail!("sync did not complete; see logs for details")
    }
}

async fn run_coordinator(config: &Config) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let coordinator = build_coordinator(config, store)?;
    coordinator.start();
    info!("coordinator running; press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    coordinator.shutdown().await;
    Ok(())
}

fn cleanup(config: &Config, aggressive: bool) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let removed = if aggressive {
        store.cleanup_aggressive()?
    } else {
        store.cleanup_aged()?
    };
    println!("removed {removed} records");
    Ok(())
}
