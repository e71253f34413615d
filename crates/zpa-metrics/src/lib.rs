// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Mtunnel metrics for the ZPA App Connector.
//!
//! The crate follows the connector's journal, parses `Mtunnels(...)` status lines, folds them
//! into a single shared [`state::MetricState`] and publishes that state in the Prometheus text
//! format, either over HTTP ([`http`]) or as a node_exporter textfile ([`textfile`]).

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod config;
pub mod errors;
pub mod http;
pub mod ingest;
pub mod parser;
pub mod render;
pub mod source;
pub mod state;
pub mod textfile;
