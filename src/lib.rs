//! Watch a directory for new recordings and upload each one once its writer
//! has finished with it.
//!
//! The pipeline is detect → stabilize → upload → re-arm: the
//! [`watcher`] admits one new file at a time, the [`probe`] waits for the
//! recorder to release it, the [`upload`] orchestrator streams it to the
//! video host, and the [`coordinator`] ties the steps together.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod output;
pub mod probe;
pub mod upload;
pub mod watcher;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use config::AppConfig;
use coordinator::{RetryPolicy, WatchCoordinator};
use probe::{FileStabilityProbe, ProbeSettings};
use upload::UploadOrchestrator;
use upload::auth::FileCredentialProvider;
use upload::client::HttpVideoHost;
use watcher::session::{FileFilter, WatchSession};

/// Initialize tracing for the binary. Logs go to stderr.
pub fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

pub fn build_probe(config: &AppConfig) -> FileStabilityProbe {
    FileStabilityProbe::new(ProbeSettings {
        interval: config.probe_interval(),
        max_attempts: config.probe_max_attempts,
    })
}

/// Orchestrator talking to the configured API with the configured credentials file.
pub fn build_orchestrator(config: &AppConfig) -> Result<UploadOrchestrator> {
    let http = HttpVideoHost::http_client(config.request_timeout())
        .context("Failed to create HTTP client")?;
    let credentials = FileCredentialProvider::new(&config.credentials_path, http.clone());
    let host = HttpVideoHost::new(http, &config.api_base_url);

    Ok(UploadOrchestrator::new(
        Arc::new(credentials),
        Arc::new(host),
        config.metadata_policy(),
        config.chunk_size,
    ))
}

pub fn retry_policy(config: &AppConfig) -> RetryPolicy {
    RetryPolicy {
        max_retries: config.max_retries,
        backoff: config.retry_backoff(),
    }
}

/// Arm the watch on `config.watch_directory` and process new files until
/// `cancel` fires. In-flight probing or uploading is abandoned on cancel.
pub async fn run_service(config: &AppConfig, cancel: CancellationToken) -> Result<()> {
    config.validate().context("invalid configuration")?;

    let directory = &config.watch_directory;
    anyhow::ensure!(
        directory.is_dir(),
        "watch directory {} does not exist",
        directory.display()
    );

    let session = Arc::new(WatchSession::new(
        directory.clone(),
        FileFilter::new(&config.extensions),
    ));
    let (handle, events) = watcher::start_watcher(Arc::clone(&session))
        .with_context(|| format!("failed to watch {}", directory.display()))?;

    let coordinator = WatchCoordinator::new(
        session,
        build_probe(config),
        build_orchestrator(config)?,
        retry_policy(config),
    );

    info!(
        directory = %directory.display(),
        visibility = %config.visibility,
        max_retries = config.max_retries,
        "service started"
    );
    coordinator.run(events, cancel).await;

    drop(handle);
    info!("service stopped");
    Ok(())
}
