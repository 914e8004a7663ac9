//! HTTP probe transport.
//!
//! Resolves an environment name to an address through a template
//! (`{name}:8080` by default), then issues plain HTTP/1.1 GETs: 2xx on the
//! health path is healthy, and the metrics path returns `CanaryMetrics`
//! as JSON.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use tracing::debug;

use conductor_core::config::ProbeConfig;
use conductor_core::{CanaryMetrics, HealthProbe, SubstrateError, SubstrateResult};

/// Timeout for metrics requests, which carry no per-call timeout of their own.
const METRICS_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct HttpProbe {
    address_template: String,
    metrics_path: String,
}

impl HttpProbe {
    pub fn new(config: &ProbeConfig) -> Self {
        Self {
            address_template: config.address_template.clone(),
            metrics_path: config.metrics_path.clone(),
        }
    }

    /// `host:port` of an environment.
    pub fn address_of(&self, environment: &str) -> String {
        self.address_template.replace("{name}", environment)
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self, environment: &str, path: &str, timeout: Duration) -> SubstrateResult<bool> {
        let address = self.address_of(environment);
        let (status, _) = http_get(&address, path, timeout).await?;
        if !status.is_success() {
            debug!(%status, %address, %path, "health probe non-2xx");
        }
        Ok(status.is_success())
    }

    async fn sample_metrics(&self, environment: &str) -> SubstrateResult<CanaryMetrics> {
        let address = self.address_of(environment);
        let (status, body) = http_get(&address, &self.metrics_path, METRICS_TIMEOUT).await?;
        if !status.is_success() {
            return Err(SubstrateError::Rejected {
                operation: "sample_metrics",
                message: format!("{address}{} returned {status}", self.metrics_path),
            });
        }
        serde_json::from_slice(&body).map_err(|e| SubstrateError::Rejected {
            operation: "sample_metrics",
            message: format!("malformed metrics from {address}: {e}"),
        })
    }
}

/// One GET over a fresh connection, bounded by `timeout`.
async fn http_get(
    address: &str,
    path: &str,
    timeout: Duration,
) -> SubstrateResult<(http::StatusCode, Bytes)> {
    let uri = format!("http://{address}{path}");

    let result = tokio::time::timeout(timeout, async {
        let stream = tokio::net::TcpStream::connect(address)
            .await
            .map_err(|e| unavailable(&uri, "connect", e))?;

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| unavailable(&uri, "handshake", e))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header("host", address)
            .header("user-agent", "conductor-health/0.1")
            .body(Empty::<Bytes>::new())
            .map_err(|e| unavailable(&uri, "request", e))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| unavailable(&uri, "send", e))?;
        let status = resp.status();
        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| unavailable(&uri, "body", e))?
            .to_bytes();
        Ok::<_, SubstrateError>((status, body))
    })
    .await;

    match result {
        Ok(out) => out,
        Err(_) => {
            debug!(%uri, "probe request timed out");
            Err(SubstrateError::Timeout {
                operation: "http_probe",
                target: uri,
                timeout,
            })
        }
    }
}

fn unavailable(uri: &str, stage: &str, e: impl std::fmt::Display) -> SubstrateError {
    debug!(error = %e, %uri, stage, "probe request failed");
    SubstrateError::Unavailable(format!("{uri}: {stage} failed: {e}"))
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    /// Serve one canned response per connection.
    async fn serve(response: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    let mut read = 0;
                    while let Ok(n) = socket.read(&mut buf[read..]).await {
                        if n == 0 {
                            break;
                        }
                        read += n;
                        if buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        addr
    }

    fn probe_for(addr: &str) -> HttpProbe {
        HttpProbe::new(&ProbeConfig {
            address_template: addr.to_string(),
            metrics_path: "/metrics/canary".to_string(),
        })
    }

    #[test]
    fn address_template_substitutes_name() {
        let probe = HttpProbe::new(&ProbeConfig::default());
        assert_eq!(probe.address_of("api-prod-green"), "api-prod-green:8080");
    }

    #[tokio::test]
    async fn ok_response_is_healthy() {
        let addr = serve("HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok").await;
        let healthy = probe_for(&addr)
            .probe("ignored", "/healthz", Duration::from_secs(2))
            .await
            .unwrap();
        assert!(healthy);
    }

    #[tokio::test]
    async fn server_error_is_unhealthy() {
        let addr =
            serve("HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n").await;
        let healthy = probe_for(&addr)
            .probe("ignored", "/healthz", Duration::from_secs(2))
            .await
            .unwrap();
        assert!(!healthy);
    }

    #[tokio::test]
    async fn closed_port_is_a_transport_error() {
        let result = probe_for("127.0.0.1:1")
            .probe("ignored", "/healthz", Duration::from_millis(200))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn metrics_are_parsed_from_json() {
        let addr = serve(concat!(
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 95\r\nconnection: close\r\n\r\n",
            r#"{"error_rate":0.5,"average_response_time_ms":120.0,"request_count":900,"sample_duration":"30s"}"#
        ))
        .await;
        let metrics = probe_for(&addr).sample_metrics("ignored").await.unwrap();
        assert_eq!(metrics.request_count, 900);
        assert_eq!(metrics.sample_duration, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn malformed_metrics_are_rejected() {
        let addr = serve("HTTP/1.1 200 OK\r\ncontent-length: 4\r\nconnection: close\r\n\r\nnope").await;
        let err = probe_for(&addr).sample_metrics("ignored").await.unwrap_err();
        assert!(matches!(err, SubstrateError::Rejected { .. }));
    }
}
