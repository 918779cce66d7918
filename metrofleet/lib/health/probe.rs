use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Issues a single liveness request.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Requests `url`, giving up after `timeout`.
    ///
    /// Returns `Ok` for a 2xx response and a description of the failure otherwise.
    async fn probe(&self, url: &str, timeout: Duration) -> Result<(), String>;
}

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A [`HealthProbe`] that issues plain HTTP GET requests.
#[derive(Debug, Clone, Default)]
pub struct HttpProbe {
    client: Client,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl HttpProbe {
    /// Creates a probe using its own HTTP client.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a probe reusing an existing HTTP client.
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self, url: &str, timeout: Duration) -> Result<(), String> {
        match tokio::time::timeout(timeout, self.client.get(url).send()).await {
            Err(_) => Err(format!("timed out after {}ms", timeout.as_millis())),
            Ok(Err(e)) if e.is_connect() => Err(format!("connection failed: {e}")),
            Ok(Err(e)) => Err(format!("request failed: {e}")),
            Ok(Ok(response)) if response.status().is_success() => Ok(()),
            Ok(Ok(response)) => Err(format!("HTTP {}", response.status())),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test(tokio::test)]
    async fn test_http_probe_status_handling() -> anyhow::Result<()> {
        let mut server = mockito::Server::new_async().await;
        let ok = server
            .mock("GET", "/status")
            .with_status(200)
            .with_body("packager-status:running")
            .create_async()
            .await;
        let unavailable = server
            .mock("GET", "/healthz")
            .with_status(503)
            .create_async()
            .await;

        let probe = HttpProbe::new();
        let timeout = Duration::from_secs(5);

        assert_eq!(
            probe
                .probe(&format!("{}/status", server.url()), timeout)
                .await,
            Ok(())
        );

        let err = probe
            .probe(&format!("{}/healthz", server.url()), timeout)
            .await
            .unwrap_err();
        assert!(err.contains("503"), "unexpected error: {err}");

        ok.assert_async().await;
        unavailable.assert_async().await;

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_http_check_gives_up_on_stalled_endpoint() -> anyhow::Result<()> {
        // Accepts connections and never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let started = std::time::Instant::now();
        let err = HttpProbe::new()
            .probe(&format!("http://{addr}/status"), Duration::from_millis(200))
            .await
            .unwrap_err();

        assert_eq!(err, "timed out after 200ms");
        assert!(started.elapsed() < Duration::from_secs(5));

        server.abort();
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_http_probe_connection_failure() {
        // Port 9 (discard) is not expected to accept HTTP connections.
        let err = HttpProbe::new()
            .probe("http://127.0.0.1:9/status", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(!err.is_empty());
    }
}
