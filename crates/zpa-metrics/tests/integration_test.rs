// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg(unix)]

use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

use tokio::time::{sleep, timeout, Duration};
use tokio_util::sync::CancellationToken;
use zpa_metrics::{
    http::{HttpSinkConfig, MetricsServer},
    ingest::{Backoff, Ingestor},
    source::JournalSource,
    state::MetricState,
    textfile::{TextfileConfig, TextfileWriter, DEFAULT_BASENAME},
};

const STATUS_LINE: &str = "Mtunnels(all|health-report-based), current active 1234|1000, \
    peak active 2345 at cloud time 1700000000000000 us, types(tcp|udp|icmp) 1.234567e+06|0|1, \
    reaped 7";

/// Writes a stand-in for `journalctl` that prints `body` and then keeps following.
fn fake_journalctl(dir: &tempfile::TempDir, body: &str) -> String {
    let path = dir.path().join("journalctl");
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(file, "#!/bin/sh").unwrap();
    writeln!(file, "{body}").unwrap();
    drop(file);
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.to_string_lossy().into_owned()
}

fn ingestor(
    program: String,
    state: &Arc<MetricState>,
    cancel: &CancellationToken,
) -> Ingestor<JournalSource> {
    Ingestor::new(
        JournalSource::with_program(program, "zpa-connector-child"),
        Arc::clone(state),
        Backoff::new(Duration::from_millis(20), Duration::from_millis(100)),
        cancel.clone(),
    )
}

async fn scrape(addr: SocketAddr) -> (u16, String) {
    let response = reqwest::get(format!("http://{addr}/metrics")).await.unwrap();
    let status = response.status().as_u16();
    (status, response.text().await.unwrap())
}

#[tokio::test]
async fn journal_lines_are_served_over_http() {
    let dir = tempfile::tempdir().unwrap();
    let program = fake_journalctl(
        &dir,
        &format!("echo 'connector started'\necho '{STATUS_LINE}'\nexec sleep 30"),
    );
    let state = Arc::new(MetricState::new());
    let cancel = CancellationToken::new();

    let server = MetricsServer::bind(
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
        Arc::clone(&state),
        HttpSinkConfig::default(),
        cancel.clone(),
    )
    .await
    .unwrap();
    let addr = server.local_addr().unwrap();
    let server_task = tokio::spawn(server.serve());
    let ingest_task = tokio::spawn(ingestor(program, &state, &cancel).run());

    let body = timeout(Duration::from_secs(5), async {
        loop {
            let (status, body) = scrape(addr).await;
            if status == 200 {
                break body;
            }
            assert_eq!(status, 503);
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("metrics never became available");

    let lines: Vec<&str> = body.lines().collect();
    assert!(lines.contains(&"zpa_mtunnel_current_active{group=\"all\"} 1234"));
    assert!(lines.contains(&"zpa_mtunnel_current_active{group=\"health-report-based\"} 1000"));
    assert!(lines.contains(&"zpa_mtunnel_peak_active 2345"));
    assert!(lines.contains(&"zpa_mtunnel_type{protocol=\"udp\"} 0"));
    assert!(lines.contains(&"zpa_mtunnel_type{protocol=\"icmp\"} 1"));
    assert!(lines.contains(&"zpa_mtunnel_reaped_count 7"));
    assert!(lines.contains(&"zpa_exporter_last_scrape_error 0"));

    cancel.cancel();
    let streams = timeout(Duration::from_secs(5), ingest_task)
        .await
        .expect("ingestion should stop on cancellation")
        .unwrap();
    assert_eq!(streams, 1);
    server_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn restarted_journal_keeps_state_and_feeds_textfile() {
    let dir = tempfile::tempdir().unwrap();
    // Each run reports a new value and exits, forcing the loop to reconnect.
    let counter = dir.path().join("runs");
    let program = fake_journalctl(
        &dir,
        &format!(
            "echo x >> '{}'\nruns=$(wc -l < '{}' | tr -d ' ')\necho \"Mtunnels(all), current active $runs\"",
            counter.display(),
            counter.display()
        ),
    );
    let out_dir = dir.path().join("textfile_collector");
    let textfile = TextfileConfig {
        directory: out_dir.clone(),
        basename: DEFAULT_BASENAME.to_string(),
        interval: Duration::from_millis(10),
    };
    let path = textfile.path();
    let state = Arc::new(MetricState::new());
    let cancel = CancellationToken::new();

    let writer_task =
        tokio::spawn(TextfileWriter::new(textfile, Arc::clone(&state), cancel.clone()).run());
    let ingest_task = tokio::spawn(ingestor(program, &state, &cancel).run());

    timeout(Duration::from_secs(5), async {
        loop {
            let body = std::fs::read_to_string(&path).unwrap_or_default();
            let current = body
                .lines()
                .find_map(|l| l.strip_prefix("zpa_mtunnel_current_active{group=\"all\"} "))
                .and_then(|v| v.parse::<u64>().ok());
            if current.is_some_and(|v| v >= 3) {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("textfile never reflected a restarted stream");

    cancel.cancel();
    let streams = ingest_task.await.unwrap();
    writer_task.await.unwrap();

    let snapshot = state.snapshot();
    assert!(streams >= 3);
    assert_eq!(snapshot.peak_active, snapshot.current_active["all"]);
    assert!(!snapshot.last_export_error);
    assert!(!out_dir.join(format!(".{DEFAULT_BASENAME}.tmp")).exists());
}
