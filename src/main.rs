mod cli;

use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use autoupload::config::AppConfig;
use autoupload::output::{ProbeReport, UploadReport, print_probe, print_progress, print_upload};
use autoupload::upload::progress::UploadProgressEvent;
use autoupload::{build_orchestrator, build_probe, init_tracing, run_service};
use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let mut config = AppConfig::load(&cli.config);
    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_shutdown(cancel.clone()));

    match cli.command {
        Commands::Run { dir } => {
            if let Some(dir) = dir {
                config.watch_directory = dir;
            }
            run_service(&config, cancel).await?;
        }
        Commands::Probe { file, json } => {
            config.validate().context("invalid configuration")?;
            let ready = build_probe(&config)
                .wait_until_stable(&file, &cancel)
                .await?;
            print_probe(
                &ProbeReport {
                    path: file.display().to_string(),
                    attempts: ready.attempts,
                    waited_secs: ready.waited.as_secs_f64(),
                },
                json,
            );
        }
        Commands::Upload { file, json } => {
            config.validate().context("invalid configuration")?;
            upload_one(&config, &file, json, cancel).await?;
        }
    }

    Ok(())
}

async fn upload_one(
    config: &AppConfig,
    file: &Path,
    json: bool,
    cancel: CancellationToken,
) -> Result<()> {
    build_probe(config).wait_until_stable(file, &cancel).await?;

    let orchestrator = build_orchestrator(config)?;
    let detected_at = Local::now();
    let metadata = orchestrator.metadata_for(file, detected_at);
    let started = Instant::now();

    let mut report = UploadReport {
        path: file.display().to_string(),
        title: metadata.title,
        visibility: metadata.visibility.to_string(),
        bytes_sent: 0,
        video_id: None,
        error: None,
        elapsed_secs: 0.0,
    };

    let mut stream = orchestrator.upload(file, detected_at, cancel);
    while let Some(event) = stream.next().await {
        match event {
            UploadProgressEvent::Uploading {
                bytes_sent,
                total_bytes,
            } => {
                report.bytes_sent = bytes_sent;
                if !json {
                    print_progress(bytes_sent, total_bytes);
                }
            }
            UploadProgressEvent::Completed { video_id } => report.video_id = Some(video_id),
            UploadProgressEvent::Failed { error } => report.error = Some(error.to_string()),
        }
    }
    report.elapsed_secs = started.elapsed().as_secs_f64();
    print_upload(&report, json);

    match report.error {
        Some(error) => anyhow::bail!("upload failed: {error}"),
        None => Ok(()),
    }
}

/// Cancel `cancel` on Ctrl-C or, on Unix, SIGTERM from the service manager.
async fn cancel_on_shutdown(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown requested");
    cancel.cancel();
}
