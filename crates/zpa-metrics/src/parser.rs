// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Parser for the connector's `Mtunnels(...)` status lines.
//!
//! The connector periodically logs one line of the form
//!
//! ```text
//! Mtunnels(all|health-report-based|no-health-report-based), current active 1360|1360|0, total 1330691|1330596|95, ...
//! ```
//!
//! The parenthesized list names the groups; every `|`-separated value in a grouped section lines
//! up with the group at the same position. Parsing is tolerant: unknown sections are ignored and a
//! value that does not convert is dropped on its own without discarding the rest of the line.

use std::sync::LazyLock;
use std::time::SystemTime;

use regex::Regex;

/// Literal token that marks an mtunnel status line.
pub const MTUNNELS_MARKER: &str = "Mtunnels(";

/// Scope used when a line carries no group list.
pub const DEFAULT_GROUP: &str = "all";

/// Structured content of one recognized status line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogEvent {
    /// Stamped by the caller; the parser always leaves it empty.
    pub timestamp: Option<SystemTime>,
    pub active: Vec<(String, u64)>,
    pub total: Vec<(String, u64)>,
    pub to_broker: Vec<(String, u64)>,
    pub to_private_broker: Vec<(String, u64)>,
    pub protocol_counts: Vec<(String, f64)>,
    pub unbound_errored: Option<u64>,
    /// The connector's own "peak active" reading.
    pub reported_peak_active: Option<u64>,
    pub total_alloc: Option<u64>,
    pub total_free: Option<u64>,
    pub reaped: Option<u64>,
}

impl LogEvent {
    /// Returns a copy stamped with the given observation time.
    #[must_use]
    pub fn observed_at(mut self, at: SystemTime) -> Self {
        self.timestamp = Some(at);
        self
    }
}

#[allow(clippy::expect_used)]
fn compile(pattern: &str) -> Regex {
    Regex::new(pattern).expect("failed creating regex")
}

static HEADER_REGEX: LazyLock<Regex> = LazyLock::new(|| compile(r"Mtunnels\(([^)]*)\)(.*)$"));

static PEAK_REGEX: LazyLock<Regex> = LazyLock::new(|| compile(r"^peak active\s+(\S+)"));

static TYPES_REGEX: LazyLock<Regex> = LazyLock::new(|| compile(r"^types\(([^)]*)\)\s+(\S+)"));

/// `protocol=<name> <value>` pairs, also written `protocol=<name>=<value>`, anywhere in the line.
static PROTOCOL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    compile(r"\bprotocol=([A-Za-z0-9_.\-]+)\s*[ =:]\s*([^\s,|]+)")
});

/// Parses one log line. Returns `None` for anything that is not an mtunnel status line.
#[must_use]
pub fn parse(line: &str) -> Option<LogEvent> {
    let line = line.trim();
    if !line.contains(MTUNNELS_MARKER) {
        return None;
    }
    let captures = HEADER_REGEX.captures(line)?;
    let groups = parse_groups(captures.get(1).map_or("", |m| m.as_str()));
    let rest = captures.get(2).map_or("", |m| m.as_str());

    let mut event = LogEvent::default();
    for section in rest.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        apply_section(&mut event, &groups, section);
    }
    for captures in PROTOCOL_REGEX.captures_iter(rest) {
        let name = captures.get(1).map_or("", |m| m.as_str());
        if let Some(value) = captures.get(2).and_then(|m| parse_value(m.as_str())) {
            event.protocol_counts.push((name.to_string(), value));
        }
    }
    Some(event)
}

fn parse_groups(list: &str) -> Vec<String> {
    let groups: Vec<String> = list
        .split('|')
        .map(str::trim)
        .filter(|g| !g.is_empty())
        .map(str::to_string)
        .collect();
    if groups.is_empty() {
        vec![DEFAULT_GROUP.to_string()]
    } else {
        groups
    }
}

fn apply_section(event: &mut LogEvent, groups: &[String], section: &str) {
    // Longer prefixes first: "total mtunnel alloc" also starts with "total".
    if let Some(values) = section.strip_prefix("current active") {
        event.active = zip_counts(groups, values);
    } else if let Some(value) = section.strip_prefix("total mtunnel alloc") {
        event.total_alloc = leading_token(value).and_then(parse_count);
    } else if let Some(value) = section.strip_prefix("total mtunnel free") {
        event.total_free = leading_token(value).and_then(parse_count);
    } else if let Some(values) = section.strip_prefix("total") {
        event.total = zip_counts(groups, values);
    } else if let Some(values) = section.strip_prefix("to private broker") {
        event.to_private_broker = zip_counts(groups, values);
    } else if let Some(values) = section.strip_prefix("to broker") {
        event.to_broker = zip_counts(groups, values);
    } else if let Some(value) = section.strip_prefix("unbound/errored") {
        event.unbound_errored = leading_token(value).and_then(parse_count);
    } else if let Some(value) = section.strip_prefix("reaped") {
        event.reaped = leading_token(value).and_then(parse_count);
    } else if let Some(captures) = PEAK_REGEX.captures(section) {
        event.reported_peak_active = captures.get(1).and_then(|m| parse_count(m.as_str()));
    } else if let Some(captures) = TYPES_REGEX.captures(section) {
        let names = captures.get(1).map_or("", |m| m.as_str());
        let values = captures.get(2).map_or("", |m| m.as_str());
        event
            .protocol_counts
            .extend(zip_values(names.split('|').map(str::trim), values));
    }
}

/// First whitespace-separated token; anything after it (such as inline pairs) is not a value.
fn leading_token(values: &str) -> Option<&str> {
    values.split_whitespace().next()
}

/// Pairs `a|b|c` values with the group list by position. Values that fail to convert are
/// skipped without shifting the ones after them.
fn zip_counts(groups: &[String], values: &str) -> Vec<(String, u64)> {
    let Some(values) = leading_token(values) else {
        return Vec::new();
    };
    groups
        .iter()
        .zip(values.split('|'))
        .filter_map(|(group, raw)| parse_count(raw.trim()).map(|v| (group.clone(), v)))
        .collect()
}

fn zip_values<'a>(
    names: impl Iterator<Item = &'a str> + 'a,
    values: &str,
) -> impl Iterator<Item = (String, f64)> + 'a {
    let values: Vec<Option<f64>> = values.split('|').map(|v| parse_value(v.trim())).collect();
    names
        .zip(values)
        .filter(|(name, _)| !name.is_empty())
        .filter_map(|(name, value)| value.map(|v| (name.to_string(), v)))
}

/// Parses a float reading, accepting plain integers and scientific notation.
fn parse_value(raw: &str) -> Option<f64> {
    raw.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Parses a non-negative integer, also accepting integral floats such as `1.5e+06`.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn parse_count(raw: &str) -> Option<u64> {
    if let Ok(v) = raw.parse::<u64>() {
        return Some(v);
    }
    let v = parse_value(raw)?;
    if v >= 0.0 && v.fract() == 0.0 && v <= u64::MAX as f64 {
        Some(v as u64)
    } else {
        None
    }
}
