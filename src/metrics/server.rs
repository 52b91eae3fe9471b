//! HTTP surface: `/metrics`, `/healthz` and `/readyz`

use crate::k8s::{Readiness, WorkloadDirectory};
use crate::metrics::PrometheusExporter;
use crate::{MossError, Result};
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

pub struct MetricsServer {
    listener: TcpListener,
    exporter: Arc<PrometheusExporter>,
    directory: WorkloadDirectory,
}

impl MetricsServer {
    pub async fn bind(
        addr: SocketAddr,
        exporter: Arc<PrometheusExporter>,
        directory: WorkloadDirectory,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            MossError::MetricsError(format!("Failed to bind metrics endpoint {}: {}", addr, e))
        })?;

        Ok(Self {
            listener,
            exporter,
            directory,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until cancelled, then let open connections finish their
    /// current request
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        info!("Metrics endpoint listening on http://{}", self.local_addr()?);

        let connections = TaskTracker::new();

        loop {
            let (stream, peer) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Failed to accept metrics connection: {}", e);
                        continue;
                    }
                },
            };

            let exporter = self.exporter.clone();
            let directory = self.directory.clone();
            let cancel = cancel.clone();

            connections.spawn(async move {
                let service = service_fn(move |req| {
                    let exporter = exporter.clone();
                    let directory = directory.clone();
                    async move { route(req, &exporter, &directory).await }
                });

                let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
                tokio::pin!(conn);

                let result = tokio::select! {
                    result = conn.as_mut() => result,
                    _ = cancel.cancelled() => {
                        conn.as_mut().graceful_shutdown();
                        conn.as_mut().await
                    }
                };

                if let Err(e) = result {
                    debug!("Metrics connection from {} ended: {}", peer, e);
                }
            });
        }

        connections.close();
        connections.wait().await;
        info!("Metrics endpoint stopped");
        Ok(())
    }
}

fn text_response(
    status: StatusCode,
    content_type: &'static str,
    body: impl Into<Bytes>,
) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

pub async fn route<B>(
    req: Request<B>,
    exporter: &PrometheusExporter,
    directory: &WorkloadDirectory,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    const PLAIN: &str = "text/plain; charset=utf-8";

    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => match exporter.format_current_metrics().await {
            Ok(body) => text_response(StatusCode::OK, prometheus::TEXT_FORMAT, body),
            Err(e) => {
                error!("Failed to render metrics: {}", e);
                text_response(StatusCode::INTERNAL_SERVER_ERROR, PLAIN, e.to_string())
            }
        },
        (&Method::GET, "/healthz") => text_response(StatusCode::OK, PLAIN, "ok"),
        (&Method::GET, "/readyz") => {
            let readiness = directory.readiness();
            let status = if readiness == Readiness::Ready {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            text_response(status, PLAIN, readiness.as_str())
        }
        (_, "/metrics" | "/healthz" | "/readyz") => {
            text_response(StatusCode::METHOD_NOT_ALLOWED, PLAIN, "method not allowed")
        }
        _ => text_response(StatusCode::NOT_FOUND, PLAIN, "not found"),
    };

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::GraphAggregator;
    use crate::config::default_cluster_cidrs;
    use crate::correlator::CorrelatorStats;
    use crate::k8s::types::{ResourceKind, WorkloadEvent};
    use crate::k8s::DirectoryWriter;
    use http_body_util::BodyExt;
    use std::time::Duration;

    fn setup() -> (PrometheusExporter, WorkloadDirectory, DirectoryWriter) {
        let (directory, writer) = WorkloadDirectory::new(default_cluster_cidrs());
        let exporter = PrometheusExporter::new(
            directory.clone(),
            GraphAggregator::new(Duration::from_secs(30)),
            Arc::new(CorrelatorStats::default()),
            Duration::from_secs(2),
        );
        (exporter, directory, writer)
    }

    async fn get(
        path: &str,
        exporter: &PrometheusExporter,
        directory: &WorkloadDirectory,
    ) -> (StatusCode, String) {
        let req = Request::builder().uri(path).body(()).unwrap();
        let response = route(req, exporter, directory).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_readyz_tracks_directory() {
        let (exporter, directory, mut writer) = setup();

        let (status, body) = get("/readyz", &exporter, &directory).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, "unstarted");

        for kind in ResourceKind::ALL {
            writer.apply(WorkloadEvent::RelistStarted(kind));
            writer.apply(WorkloadEvent::RelistCompleted(kind));
        }

        let (status, body) = get("/readyz", &exporter, &directory).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ready");
    }

    #[tokio::test]
    async fn test_metrics_and_health() {
        let (exporter, directory, _writer) = setup();

        let (status, body) = get("/metrics", &exporter, &directory).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("moss_links"));

        let (status, _) = get("/healthz", &exporter, &directory).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = get("/nope", &exporter, &directory).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_serves_over_tcp_until_cancelled() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (exporter, directory, _writer) = setup();
        let addr = "127.0.0.1:0".parse().unwrap();
        let server = MetricsServer::bind(addr, Arc::new(exporter), directory)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(server.run(cancel.clone()));

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /healthz HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
