// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Prometheus text exposition of a [`MetricSnapshot`].
//!
//! Each render builds a throwaway [`Registry`] from the snapshot, so nothing here touches the
//! shared state and concurrent renders are independent.

use std::collections::BTreeMap;

use prometheus::core::Collector;
use prometheus::{Encoder, Gauge, GaugeVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::errors::RenderError;
use crate::state::MetricSnapshot;

pub const CURRENT_ACTIVE: &str = "zpa_mtunnel_current_active";
pub const PEAK_ACTIVE: &str = "zpa_mtunnel_peak_active";
pub const TYPE: &str = "zpa_mtunnel_type";
pub const TOTAL: &str = "zpa_mtunnel_total_count";
pub const TO_BROKER: &str = "zpa_mtunnel_to_broker_count";
pub const TO_PRIVATE_BROKER: &str = "zpa_mtunnel_to_private_broker_count";
pub const UNBOUND_ERRORED: &str = "zpa_mtunnel_unbound_errored_count";
pub const TOTAL_ALLOC: &str = "zpa_mtunnel_total_alloc_count";
pub const TOTAL_FREE: &str = "zpa_mtunnel_total_free_count";
pub const REAPED: &str = "zpa_mtunnel_reaped_count";
pub const LAST_SCRAPE_ERROR: &str = "zpa_exporter_last_scrape_error";

/// Content type of the rendered body.
#[must_use]
pub fn content_type() -> String {
    TextEncoder::new().format_type().to_string()
}

/// Renders the snapshot in the Prometheus text format.
pub fn render(snapshot: &MetricSnapshot) -> Result<String, RenderError> {
    let registry = Registry::new();

    register_grouped(
        &registry,
        CURRENT_ACTIVE,
        "Current active mtunnels per group",
        "group",
        &snapshot.current_active,
    )?;
    register_grouped(
        &registry,
        TOTAL,
        "Total mtunnels per group (as reported by ZPA)",
        "group",
        &snapshot.total,
    )?;
    register_grouped(
        &registry,
        TO_BROKER,
        "Mtunnels to broker per group",
        "group",
        &snapshot.to_broker,
    )?;
    register_grouped(
        &registry,
        TO_PRIVATE_BROKER,
        "Mtunnels to private broker per group",
        "group",
        &snapshot.to_private_broker,
    )?;

    let types = GaugeVec::new(Opts::new(TYPE, "Mtunnel counts by protocol type"), &["protocol"])?;
    for (protocol, value) in &snapshot.type_counts {
        types.with_label_values(&[protocol.as_str()]).set(*value);
    }
    register(&registry, types)?;

    register_scalar(
        &registry,
        PEAK_ACTIVE,
        "Peak active mtunnels (all groups)",
        Some(snapshot.peak_active),
    )?;
    register_scalar(
        &registry,
        UNBOUND_ERRORED,
        "Unbound/errored mtunnels (total)",
        snapshot.unbound_errored,
    )?;
    register_scalar(
        &registry,
        TOTAL_ALLOC,
        "Total mtunnel allocations",
        snapshot.total_alloc,
    )?;
    register_scalar(
        &registry,
        TOTAL_FREE,
        "Total mtunnel frees",
        snapshot.total_free,
    )?;
    register_scalar(
        &registry,
        REAPED,
        "Reaped mtunnels (as reported by ZPA)",
        snapshot.reaped,
    )?;

    let scrape_error = Gauge::with_opts(Opts::new(
        LAST_SCRAPE_ERROR,
        "1 if the last metrics render or write had an error, 0 otherwise",
    ))?;
    scrape_error.set(if snapshot.last_export_error { 1.0 } else { 0.0 });
    register(&registry, scrape_error)?;

    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

fn register<C: Collector + 'static>(registry: &Registry, collector: C) -> Result<(), RenderError> {
    registry.register(Box::new(collector))?;
    Ok(())
}

fn register_grouped(
    registry: &Registry,
    name: &str,
    help: &str,
    label: &str,
    values: &BTreeMap<String, u64>,
) -> Result<(), RenderError> {
    let vec = IntGaugeVec::new(Opts::new(name, help), &[label])?;
    for (key, value) in values {
        vec.with_label_values(&[key.as_str()]).set(gauge_value(*value));
    }
    register(registry, vec)
}

fn register_scalar(
    registry: &Registry,
    name: &str,
    help: &str,
    value: Option<u64>,
) -> Result<(), RenderError> {
    // Scalars the connector has not reported yet are left out rather than shown as zero.
    let Some(value) = value else {
        return Ok(());
    };
    let gauge = IntGauge::with_opts(Opts::new(name, help))?;
    gauge.set(gauge_value(value));
    register(registry, gauge)
}

// Integer gauges are signed; counts beyond their range saturate instead of wrapping negative.
fn gauge_value(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
