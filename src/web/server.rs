//! HTTP server that fronts a trivial application with the throttle layer.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::layer::ThrottleLayer;
use crate::error::Result;
use crate::throttle::Throttler;

/// HTTP server for the throttling service.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The shared throttler
    throttler: Arc<Throttler>,
    /// Proxies whose `X-Forwarded-For` is honored
    trusted_proxies: Vec<IpAddr>,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, throttler: Arc<Throttler>) -> Self {
        Self {
            addr,
            throttler,
            trusted_proxies: Vec::new(),
        }
    }

    pub fn with_trusted_proxies(mut self, proxies: Vec<IpAddr>) -> Self {
        self.trusted_proxies = proxies;
        self
    }

    /// The application: every path answers `200 OK` unless throttled.
    pub fn router(&self) -> Router {
        Router::new()
            .fallback(ok)
            .layer(
                ThrottleLayer::new(self.throttler.clone())
                    .with_trusted_proxies(self.trusted_proxies.iter().copied()),
            )
    }

    /// Start the server.
    ///
    /// This method will block until the server is shut down.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Start the server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let router = self.router();
        let listener = TcpListener::bind(self.addr).await?;

        info!(
            addr = %self.addr,
            rules = self.throttler.rules().len(),
            "Starting HTTP server"
        );

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            e.into()
        })
    }
}

async fn ok() -> &'static str {
    "OK\n"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::throttle::{Discriminator, RuleSet};
    use axum::body::Body;
    use axum::extract::ConnectInfo;
    use http::{Request, StatusCode};
    use std::time::Duration;
    use tower::ServiceExt;

    fn throttler() -> Arc<Throttler> {
        let rules = RuleSet::builder()
            .throttle("by ip", 1_u64, 3600_u64, Discriminator::by_ip())
            .unwrap()
            .build();
        Arc::new(Throttler::in_memory(rules))
    }

    fn request_from(addr: &str) -> Request<Body> {
        let addr: SocketAddr = addr.parse().unwrap();
        let mut request = Request::builder().uri("/anything").body(Body::empty()).unwrap();
        request.extensions_mut().insert(ConnectInfo(addr));
        request
    }

    #[test]
    fn test_server_creation() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let _server = HttpServer::new(addr, throttler());
    }

    #[tokio::test]
    async fn test_router_throttles() {
        let server = HttpServer::new("127.0.0.1:8080".parse().unwrap(), throttler());
        let router = server.router();

        let response = router.clone().oneshot(request_from("10.0.0.1:5000")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router.clone().oneshot(request_from("10.0.0.1:5001")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key(http::header::RETRY_AFTER));
    }

    #[tokio::test]
    async fn test_router_honors_trusted_proxies() {
        let server = HttpServer::new("127.0.0.1:8080".parse().unwrap(), throttler())
            .with_trusted_proxies(vec!["10.0.0.1".parse().unwrap()]);
        let router = server.router();

        for client in ["1.2.3.4", "5.6.7.8"] {
            let mut request = request_from("10.0.0.1:5000");
            request
                .headers_mut()
                .insert("x-forwarded-for", client.parse().unwrap());
            let response = router.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn test_serve_with_shutdown() {
        let server = HttpServer::new("127.0.0.1:0".parse().unwrap(), throttler());
        let handle = tokio::spawn(server.serve_with_shutdown(async {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }));

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
