// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::ConfigError;
use crate::http::{HttpSinkConfig, FIRST_PARSE_WAIT};
use crate::ingest::{DEFAULT_BACKOFF_INITIAL, DEFAULT_BACKOFF_MAX};
use crate::source::DEFAULT_JOURNALCTL;
use crate::textfile::{TextfileConfig, DEFAULT_BASENAME, DEFAULT_WRITE_INTERVAL};

pub const DEFAULT_SYSLOG_IDENTIFIER: &str = "zpa-connector-child";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Where the rendered metrics go.
#[derive(Debug, Clone, PartialEq)]
pub enum ExportMode {
    Http { port: u16, http: HttpSinkConfig },
    Textfile(TextfileConfig),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub syslog_identifier: String,
    pub journalctl_path: String,
    pub mode: ExportMode,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub log_level: String,
}

impl Config {
    /// Reads the exporter settings from the process environment.
    pub fn from_env() -> Result<Config, ConfigError> {
        let syslog_identifier = env::var("ZPA_SYSLOG_IDENTIFIER")
            .unwrap_or_else(|_| DEFAULT_SYSLOG_IDENTIFIER.to_string());
        let journalctl_path =
            env::var("JOURNALCTL_PATH").unwrap_or_else(|_| DEFAULT_JOURNALCTL.to_string());
        let log_level =
            env::var("EXPORTER_LOG_LEVEL").unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string());

        let backoff_initial = Duration::from_millis(parse_var(
            "STREAM_BACKOFF_INITIAL_MS",
            duration_millis(DEFAULT_BACKOFF_INITIAL),
        )?);
        let backoff_max = Duration::from_millis(parse_var(
            "STREAM_BACKOFF_MAX_MS",
            duration_millis(DEFAULT_BACKOFF_MAX),
        )?);

        let mode = match env::var("EXPORTER_MODE")
            .map(|mode| mode.trim().to_lowercase())
            .as_deref()
        {
            Err(_) | Ok("" | "http") => ExportMode::Http {
                port: parse_var("EXPORTER_PORT", DEFAULT_PORT)?,
                http: HttpSinkConfig {
                    wait_for_first_parse: parse_bool_var("HTTP_WAIT_FOR_FIRST_PARSE", true)?,
                    first_parse_wait: FIRST_PARSE_WAIT,
                },
            },
            Ok("textfile") => ExportMode::Textfile(textfile_config()?),
            Ok(_) => {
                return Err(ConfigError::UnknownMode(
                    env::var("EXPORTER_MODE").unwrap_or_default(),
                ))
            }
        };

        Ok(Config {
            syslog_identifier,
            journalctl_path,
            mode,
            backoff_initial,
            backoff_max,
            log_level,
        })
    }
}

fn textfile_config() -> Result<TextfileConfig, ConfigError> {
    let directory = env::var("TEXTFILE_DIR")
        .ok()
        .filter(|dir| !dir.trim().is_empty())
        .ok_or(ConfigError::MissingTextfileDir)?;
    let basename =
        env::var("TEXTFILE_BASENAME").unwrap_or_else(|_| DEFAULT_BASENAME.to_string());
    if basename.is_empty() || basename.contains('/') {
        return Err(ConfigError::InvalidValue {
            name: "TEXTFILE_BASENAME",
            value: basename,
            reason: "must be a plain file name".to_string(),
        });
    }

    let interval = match env::var("TEXTFILE_WRITE_INTERVAL") {
        Err(_) => DEFAULT_WRITE_INTERVAL,
        Ok(raw) => {
            let invalid = |reason: &str| ConfigError::InvalidValue {
                name: "TEXTFILE_WRITE_INTERVAL",
                value: raw.clone(),
                reason: reason.to_string(),
            };
            let secs: f64 = raw
                .trim()
                .parse()
                .map_err(|e: std::num::ParseFloatError| invalid(&e.to_string()))?;
            if !secs.is_finite() || secs <= 0.0 {
                return Err(invalid("must be a positive number of seconds"));
            }
            Duration::try_from_secs_f64(secs).map_err(|e| invalid(&e.to_string()))?
        }
    };

    Ok(TextfileConfig {
        directory: PathBuf::from(directory),
        basename,
        interval,
    })
}

fn parse_var<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Err(_) => Ok(default),
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue {
                name,
                value: raw.clone(),
                reason: e.to_string(),
            }),
    }
}

fn parse_bool_var(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match env::var(name) {
        Err(_) => Ok(default),
        Ok(raw) => match raw.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                name,
                value: raw,
                reason: "expected true or false".to_string(),
            }),
        },
    }
}

#[allow(clippy::cast_possible_truncation)]
fn duration_millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}
