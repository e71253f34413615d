// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for the exporter.
//!
//! Only [`ConfigError`] and HTTP bind failures are fatal to the process. Everything else is
//! absorbed by the task that produced it and retried.

use std::path::PathBuf;

/// Invalid or missing configuration, detected before any task starts.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("Unknown EXPORTER_MODE '{0}'. Use 'http' (default) or 'textfile'.")]
    UnknownMode(String),
    #[error("TEXTFILE_DIR must be set when EXPORTER_MODE=textfile")]
    MissingTextfileDir,
    #[error("invalid value '{value}' for {name}: {reason}")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Failure of the upstream log stream. Always transient.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{0} was spawned without a stdout pipe")]
    MissingStdout(String),
    #[error("error reading log stream: {0}")]
    Read(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("failed to build metric family: {0}")]
    Prometheus(#[from] prometheus::Error),
    #[error("encoded metrics are not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// A single failed textfile publish. Retried on the next tick.
#[derive(Debug, thiserror::Error)]
pub enum TextfileError {
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error("failed to create directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to rename {} to {}: {source}", from.display(), to.display())]
    Rename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
