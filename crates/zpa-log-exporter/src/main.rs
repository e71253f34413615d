// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::net::{Ipv4Addr, SocketAddr};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use zpa_metrics::{
    config::{Config, ExportMode, DEFAULT_LOG_LEVEL},
    http::MetricsServer,
    ingest::{Backoff, Ingestor},
    source::JournalSource,
    state::MetricState,
    textfile::TextfileWriter,
};

#[tokio::main]
pub async fn main() -> ExitCode {
    let config = Config::from_env();
    let log_level = config
        .as_ref()
        .map_or(DEFAULT_LOG_LEVEL, |config| config.log_level.as_str());
    if let Err(e) = init_logging(log_level) {
        eprintln!("Invalid exporter configuration: {e:#}");
        return ExitCode::FAILURE;
    }

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid exporter configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn env_filter(log_level: &str) -> anyhow::Result<EnvFilter> {
    let directives = format!("hyper=off,{}", log_level.to_lowercase());
    EnvFilter::try_new(directives)
        .with_context(|| format!("could not parse EXPORTER_LOG_LEVEL '{log_level}'"))
}

fn init_logging(log_level: &str) -> anyhow::Result<()> {
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(env_filter(log_level)?)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    debug!("Logging subsystem enabled");
    Ok(())
}

async fn run(config: Config) -> anyhow::Result<()> {
    let state = Arc::new(MetricState::new());
    let cancel_token = CancellationToken::new();

    // Bind before following the journal so a taken port fails fast.
    let mut sink = match config.mode {
        ExportMode::Http { port, http } => {
            let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
            let server =
                MetricsServer::bind(addr, Arc::clone(&state), http, cancel_token.clone())
                    .await
                    .with_context(|| format!("Failed to bind metrics server on {addr}"))?;
            tokio::spawn(async move { server.serve().await.context("Metrics server failed") })
        }
        ExportMode::Textfile(textfile) => {
            let writer = TextfileWriter::new(textfile, Arc::clone(&state), cancel_token.clone());
            tokio::spawn(async move {
                writer.run().await;
                Ok::<_, anyhow::Error>(())
            })
        }
    };

    info!(
        "Following journal for '{}' with {}",
        config.syslog_identifier, config.journalctl_path
    );
    let ingestor = Ingestor::new(
        JournalSource::with_program(config.journalctl_path, config.syslog_identifier),
        Arc::clone(&state),
        Backoff::new(config.backoff_initial, config.backoff_max),
        cancel_token.clone(),
    );
    let ingest = tokio::spawn(ingestor.run());

    let stopped_early = tokio::select! {
        signal = shutdown_signal() => {
            match signal {
                Ok(()) => info!("Shutdown signal received, stopping exporter"),
                Err(e) => error!("Failed to listen for shutdown signals: {e:#}"),
            }
            None
        }
        finished = &mut sink => Some(finished),
    };
    cancel_token.cancel();
    let sink_result = match stopped_early {
        Some(finished) => {
            warn!("Export sink stopped unexpectedly, shutting down");
            finished
        }
        None => sink.await,
    };

    let streams = ingest.await.context("Ingestion task failed")?;
    debug!("Ingestion stopped after {streams} log streams");
    sink_result.context("Export task failed")??;
    info!("Exporter stopped");
    Ok(())
}

async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res.context("Failed to listen for SIGINT")?,
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for ctrl-c")?;
    }
    Ok(())
}
