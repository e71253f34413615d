// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shared mtunnel metric state.
//!
//! A single [`MetricState`] lives for the whole process. The ingestion loop is its only writer;
//! the export sinks read it through [`MetricState::snapshot`], which copies everything out under
//! the same lock the writer takes. A reader therefore sees either all or none of the readings
//! from one log line, and renders without holding the lock.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use tokio::sync::watch;

use crate::parser::LogEvent;

/// Point-in-time copy of every exported reading.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricSnapshot {
    pub current_active: BTreeMap<String, u64>,
    pub peak_active: u64,
    pub type_counts: BTreeMap<String, f64>,
    pub total: BTreeMap<String, u64>,
    pub to_broker: BTreeMap<String, u64>,
    pub to_private_broker: BTreeMap<String, u64>,
    pub unbound_errored: Option<u64>,
    pub total_alloc: Option<u64>,
    pub total_free: Option<u64>,
    pub reaped: Option<u64>,
    pub last_event_at: Option<SystemTime>,
    pub events_parsed: u64,
    pub last_export_error: bool,
}

#[derive(Debug)]
pub struct MetricState {
    inner: Mutex<MetricSnapshot>,
    ready: watch::Sender<bool>,
}

impl Default for MetricState {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricState {
    #[must_use]
    pub fn new() -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            inner: Mutex::new(MetricSnapshot::default()),
            ready,
        }
    }

    // Every update leaves the aggregate consistent, so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, MetricSnapshot> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Sets the active count for `group` and raises the peak if needed.
    pub fn record_snapshot(&self, group: &str, active: u64) {
        let mut inner = self.lock();
        set_active(&mut inner, group, active);
    }

    /// Overwrites the per-protocol readings. Values are current readings, not increments.
    pub fn record_protocol_counts<'a, I>(&self, counts: I)
    where
        I: IntoIterator<Item = (&'a str, f64)>,
    {
        let mut inner = self.lock();
        for (protocol, value) in counts {
            inner.type_counts.insert(protocol.to_string(), value);
        }
    }

    /// Folds every reading of one parsed line into the state in a single critical section.
    pub fn apply(&self, event: &LogEvent, observed_at: SystemTime) {
        {
            let mut inner = self.lock();
            for (group, active) in &event.active {
                set_active(&mut inner, group, *active);
            }
            if let Some(peak) = event.reported_peak_active {
                inner.peak_active = inner.peak_active.max(peak);
            }
            for (protocol, value) in &event.protocol_counts {
                inner.type_counts.insert(protocol.clone(), *value);
            }
            merge(&mut inner.total, &event.total);
            merge(&mut inner.to_broker, &event.to_broker);
            merge(&mut inner.to_private_broker, &event.to_private_broker);
            overwrite(&mut inner.unbound_errored, event.unbound_errored);
            overwrite(&mut inner.total_alloc, event.total_alloc);
            overwrite(&mut inner.total_free, event.total_free);
            overwrite(&mut inner.reaped, event.reaped);
            inner.last_event_at = Some(observed_at);
            inner.events_parsed += 1;
        }
        self.ready.send_replace(true);
    }

    pub fn set_export_error(&self, failed: bool) {
        self.lock().last_export_error = failed;
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricSnapshot {
        self.lock().clone()
    }

    /// True once at least one status line has been applied.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Waits until the first status line has been applied.
    pub async fn wait_ready(&self) {
        let mut rx = self.ready.subscribe();
        // The sender lives in `self`, so the channel cannot close while we borrow it.
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Like [`Self::wait_ready`] with an upper bound. Returns whether the state became ready.
    pub async fn wait_ready_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait_ready()).await.is_ok()
    }
}

fn set_active(inner: &mut MetricSnapshot, group: &str, active: u64) {
    inner.current_active.insert(group.to_string(), active);
    inner.peak_active = inner.peak_active.max(active);
}

fn merge(target: &mut BTreeMap<String, u64>, readings: &[(String, u64)]) {
    for (key, value) in readings {
        target.insert(key.clone(), *value);
    }
}

fn overwrite(target: &mut Option<u64>, reading: Option<u64>) {
    if reading.is_some() {
        *target = reading;
    }
}
