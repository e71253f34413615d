// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! File-based export for the node_exporter textfile collector.
//!
//! The rendered snapshot is written to a hidden temporary file next to the target and renamed
//! over it, so the collector never reads a partially written file.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::errors::TextfileError;
use crate::render;
use crate::state::MetricState;

pub const DEFAULT_BASENAME: &str = "zpa_exporter.prom";
pub const DEFAULT_WRITE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq)]
pub struct TextfileConfig {
    pub directory: PathBuf,
    pub basename: String,
    pub interval: Duration,
}

impl TextfileConfig {
    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.directory.join(&self.basename)
    }

    #[must_use]
    pub fn temp_path(&self) -> PathBuf {
        self.directory.join(format!(".{}.tmp", self.basename))
    }
}

pub struct TextfileWriter {
    config: TextfileConfig,
    state: Arc<MetricState>,
    cancel_token: CancellationToken,
}

impl TextfileWriter {
    #[must_use]
    pub fn new(
        config: TextfileConfig,
        state: Arc<MetricState>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            config,
            state,
            cancel_token,
        }
    }

    /// Publishes on every interval tick until cancelled. Nothing is written before the first
    /// status line has been parsed; after that a file is written every tick even without news.
    pub async fn run(self) {
        info!(
            "Exporter textfile writer enabled; writing metrics to {} every {:?}",
            self.config.path().display(),
            self.config.interval
        );

        tokio::select! {
            () = self.cancel_token.cancelled() => {
                debug!("Textfile writer cancelled before first parse");
                return;
            }
            () = self.state.wait_ready() => {}
        }

        let mut ticker = interval(self.config.interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.write_once().await {
                Ok(()) => {
                    self.state.set_export_error(false);
                    debug!("Wrote metrics textfile {}", self.config.path().display());
                }
                Err(e) => {
                    self.state.set_export_error(true);
                    error!("Failed to write metrics textfile: {e}");
                }
            }
        }
        debug!("Textfile writer stopped");
    }

    /// Renders the current snapshot and atomically replaces the published file.
    pub async fn write_once(&self) -> Result<(), TextfileError> {
        let body = render::render(&self.state.snapshot())?;
        publish(&self.config.directory, &self.config.temp_path(), &self.config.path(), &body).await
    }
}

async fn publish(
    directory: &Path,
    temp_path: &Path,
    final_path: &Path,
    body: &str,
) -> Result<(), TextfileError> {
    tokio::fs::create_dir_all(directory)
        .await
        .map_err(|source| TextfileError::CreateDir {
            path: directory.to_path_buf(),
            source,
        })?;

    let write_err = |source: std::io::Error| TextfileError::Write {
        path: temp_path.to_path_buf(),
        source,
    };
    let mut file = tokio::fs::File::create(temp_path).await.map_err(write_err)?;
    file.write_all(body.as_bytes()).await.map_err(write_err)?;
    file.sync_all().await.map_err(write_err)?;
    drop(file);

    tokio::fs::rename(temp_path, final_path)
        .await
        .map_err(|source| TextfileError::Rename {
            from: temp_path.to_path_buf(),
            to: final_path.to_path_buf(),
            source,
        })
}
