// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pull-based export: serves the current metric snapshot on `GET /metrics`.

use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::render;
use crate::state::MetricState;

pub const METRICS_ENDPOINT_PATH: &str = "/metrics";

/// How long a scrape waits for the first status line before answering 503.
pub const FIRST_PARSE_WAIT: Duration = Duration::from_secs(1);

type Body = Full<Bytes>;

/// Options for the `/metrics` handler.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HttpSinkConfig {
    /// Answer 503 until the first status line has been parsed.
    pub wait_for_first_parse: bool,
    pub first_parse_wait: Duration,
}

impl Default for HttpSinkConfig {
    fn default() -> Self {
        Self {
            wait_for_first_parse: true,
            first_parse_wait: FIRST_PARSE_WAIT,
        }
    }
}

pub struct MetricsServer {
    listener: TcpListener,
    state: Arc<MetricState>,
    config: HttpSinkConfig,
    cancel_token: CancellationToken,
}

impl MetricsServer {
    /// Binds the listener. A failure here means the exporter cannot do its job.
    pub async fn bind(
        addr: SocketAddr,
        state: Arc<MetricState>,
        config: HttpSinkConfig,
        cancel_token: CancellationToken,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            state,
            config,
            cancel_token,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until cancelled, then waits for in-flight requests to finish. Accept
    /// failures after a successful bind are logged and retried, never returned.
    pub async fn serve(self) -> io::Result<()> {
        let Self {
            listener,
            state,
            config,
            cancel_token,
        } = self;
        info!(
            "Exporter HTTP server listening on :{}{}",
            listener.local_addr()?.port(),
            METRICS_ENDPOINT_PATH
        );

        let service = service_fn(move |req| {
            let state = Arc::clone(&state);
            async move { Ok::<_, Infallible>(handle(req, state, config).await) }
        });
        let server = hyper::server::conn::http1::Builder::new();
        let mut joinset = tokio::task::JoinSet::new();

        let mut consecutive_errors = 0u32;
        loop {
            let conn = tokio::select! {
                () = cancel_token.cancelled() => break,
                con_res = listener.accept() => match con_res {
                    Err(e) if is_transient_accept_error(&e) => continue,
                    Err(e) => {
                        // Descriptor exhaustion and similar; keep serving once it clears.
                        consecutive_errors = consecutive_errors.saturating_add(1);
                        let delay = accept_backoff(consecutive_errors);
                        error!(
                            "Failed to accept connection (attempt {}): {}. Retrying in {:?}",
                            consecutive_errors, e, delay
                        );
                        tokio::select! {
                            () = cancel_token.cancelled() => break,
                            () = tokio::time::sleep(delay) => continue,
                        }
                    }
                    Ok((conn, _)) => {
                        consecutive_errors = 0;
                        conn
                    }
                },
                finished = async {
                    match joinset.join_next().await {
                        Some(finished) => finished,
                        None => std::future::pending().await,
                    }
                } => match finished {
                    Err(e) if e.is_panic() => {
                        error!("Connection handler panicked: {:?}", e);
                        continue;
                    },
                    Ok(()) | Err(_) => continue,
                },
            };
            let conn = hyper_util::rt::TokioIo::new(conn);
            let server = server.clone();
            let service = service.clone();
            let cancel_token = cancel_token.clone();
            joinset.spawn(async move {
                let conn = server.serve_connection(conn, service);
                tokio::pin!(conn);
                let res = tokio::select! {
                    res = conn.as_mut() => res,
                    () = cancel_token.cancelled() => {
                        // Finish the in-flight response, then close instead of keeping alive.
                        conn.as_mut().graceful_shutdown();
                        conn.await
                    }
                };
                if let Err(e) = res {
                    debug!("Connection error: {e}");
                }
            });
        }

        drop(listener);
        debug!(
            "HTTP server stopped accepting, draining {} connections",
            joinset.len()
        );
        while joinset.join_next().await.is_some() {}
        Ok(())
    }
}

fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
    )
}

/// 10ms, 20ms, 40ms, ... capped at 640ms.
fn accept_backoff(consecutive_errors: u32) -> Duration {
    Duration::from_millis(10u64 * (1 << consecutive_errors.min(6)))
}

async fn handle(
    req: Request<Incoming>,
    state: Arc<MetricState>,
    config: HttpSinkConfig,
) -> Response<Body> {
    if req.uri().path() != METRICS_ENDPOINT_PATH {
        return text_response(StatusCode::NOT_FOUND, "Not found\n");
    }
    if req.method() != Method::GET && req.method() != Method::HEAD {
        return text_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed\n");
    }
    if config.wait_for_first_parse && !state.wait_ready_timeout(config.first_parse_wait).await {
        return text_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "Mtunnel metrics not yet available\n",
        );
    }

    // The lock is only held for the copy; rendering works on the snapshot.
    match render::render(&state.snapshot()) {
        Ok(body) => {
            state.set_export_error(false);
            let mut response = Response::new(Full::new(Bytes::from(body)));
            if let Ok(value) = HeaderValue::from_str(&render::content_type()) {
                response.headers_mut().insert(CONTENT_TYPE, value);
            }
            response
        }
        Err(e) => {
            state.set_export_error(true);
            error!("Failed to generate metrics: {e}");
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal error\n")
        }
    }
}

fn text_response(status: StatusCode, message: &'static str) -> Response<Body> {
    let mut response = Response::new(Full::new(Bytes::from_static(message.as_bytes())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
