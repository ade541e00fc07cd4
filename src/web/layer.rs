//! Throttle tower layer.
//!
//! Wraps a service so every request is counted against the registered
//! rules before it reaches the service. Throttled requests are answered
//! directly and never reach the inner service.

use std::net::IpAddr;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use futures::future::BoxFuture;
use http::{Request, Response};
use tower::{Layer, Service};
use tracing::{debug_span, info, warn, Instrument};

use super::response::{blocked_response, unavailable_response};
use crate::throttle::{RequestDescriptor, Throttler};

/// Tower layer that throttles requests with a shared [`Throttler`].
#[derive(Clone)]
pub struct ThrottleLayer {
    throttler: Arc<Throttler>,
    trusted_proxies: Arc<[IpAddr]>,
}

impl ThrottleLayer {
    pub fn new(throttler: Arc<Throttler>) -> Self {
        Self {
            throttler,
            trusted_proxies: Arc::from(Vec::new()),
        }
    }

    /// Take the client address from `X-Forwarded-For` when the peer is one
    /// of these proxies.
    pub fn with_trusted_proxies(mut self, proxies: impl IntoIterator<Item = IpAddr>) -> Self {
        self.trusted_proxies = proxies.into_iter().collect();
        self
    }
}

impl<S> Layer<S> for ThrottleLayer {
    type Service = ThrottleService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ThrottleService {
            inner,
            throttler: self.throttler.clone(),
            trusted_proxies: self.trusted_proxies.clone(),
        }
    }
}

/// Tower service that checks each request before passing it on.
///
/// Allowed requests reach the inner service with the [`Decision`] in their
/// extensions. Denied requests get `429 Too Many Requests`.
///
/// [`Decision`]: crate::throttle::Decision
#[derive(Clone)]
pub struct ThrottleService<S> {
    inner: S,
    throttler: Arc<Throttler>,
    trusted_proxies: Arc<[IpAddr]>,
}

impl<S, B> Service<Request<B>> for ThrottleService<S>
where
    S: Service<Request<B>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
    S::Error: Send + 'static,
    B: Send + 'static,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<B>) -> Self::Future {
        // Keep the service that was driven to readiness.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let throttler = self.throttler.clone();

        let descriptor = RequestDescriptor::from_http_behind(&request, &self.trusted_proxies);
        let span = debug_span!(
            "throttle",
            method = %descriptor.method(),
            path = %descriptor.path(),
            ip = ?descriptor.ip()
        );

        Box::pin(
            async move {
                let decision = match throttler.check(&descriptor).await {
                    Ok(decision) => decision,
                    Err(err) => {
                        warn!(error = %err, "Throttle evaluation failed; answering 503");
                        return Ok(unavailable_response());
                    }
                };

                if let Some(verdict) = decision.denied() {
                    info!(
                        rule = %verdict.rule,
                        discriminator = %verdict.discriminator,
                        retry_after = verdict.retry_after,
                        "Request throttled"
                    );
                    return Ok(blocked_response(verdict.retry_after));
                }

                request.extensions_mut().insert(decision);
                inner.call(request).await
            }
            .instrument(span),
        )
    }
}
