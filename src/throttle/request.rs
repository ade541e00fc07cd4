//! Read-only view of an inbound request.

use std::net::{IpAddr, SocketAddr};

use axum::extract::ConnectInfo;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method};

/// Header appended to by each proxy a request passes through.
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// The parts of a request that discriminators and resolvers may inspect.
///
/// Built once per request by the middleware and handed by reference to every
/// rule, so all rules see the same snapshot.
#[derive(Debug, Clone, Default)]
pub struct RequestDescriptor {
    ip: Option<IpAddr>,
    method: Method,
    path: String,
    headers: HeaderMap,
}

impl RequestDescriptor {
    /// Create an empty descriptor (no address, `GET /`, no headers).
    pub fn new() -> Self {
        Self {
            path: "/".to_string(),
            ..Self::default()
        }
    }

    /// Snapshot an HTTP request.
    ///
    /// The source address comes from axum's `ConnectInfo` extension when the
    /// server was started with connect info.
    pub fn from_http<B>(request: &http::Request<B>) -> Self {
        Self::from_http_behind(request, &[])
    }

    /// Snapshot an HTTP request received through trusted proxies.
    ///
    /// When the peer is one of `trusted_proxies`, the client address is the
    /// right-most `X-Forwarded-For` entry that is not itself a trusted proxy.
    /// Forwarded addresses from untrusted peers are ignored.
    pub fn from_http_behind<B>(request: &http::Request<B>, trusted_proxies: &[IpAddr]) -> Self {
        let peer = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        let ip = peer.map(|peer| client_ip(peer, request.headers(), trusted_proxies));

        Self {
            ip,
            method: request.method().clone(),
            path: request.uri().path().to_string(),
            headers: request.headers().clone(),
        }
    }

    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Add a header. Invalid names or values are ignored.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name),
            HeaderValue::try_from(value),
        ) {
            self.headers.append(name, value);
        }
        self
    }

    /// Source address of the request, if known.
    pub fn ip(&self) -> Option<IpAddr> {
        self.ip
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Case-insensitive header lookup. Non-UTF-8 values read as absent.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }
}

fn client_ip(peer: IpAddr, headers: &HeaderMap, trusted_proxies: &[IpAddr]) -> IpAddr {
    if !trusted_proxies.contains(&peer) {
        return peer;
    }

    let hops: Vec<&str> = headers
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .collect();

    let mut client = peer;
    for hop in hops.iter().rev() {
        // A malformed hop cannot be trusted further; stop at the last good one.
        let Ok(ip) = hop.parse::<IpAddr>() else {
            break;
        };
        client = ip;
        if !trusted_proxies.contains(&ip) {
            break;
        }
    }
    client
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_defaults() {
        let descriptor = RequestDescriptor::new();

        assert_eq!(descriptor.ip(), None);
        assert_eq!(descriptor.method(), Method::GET);
        assert_eq!(descriptor.path(), "/");
        assert!(descriptor.headers().is_empty());
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let descriptor = RequestDescriptor::new().with_header("X-APIKey", "private-secret");

        assert_eq!(descriptor.header("x-apikey"), Some("private-secret"));
        assert_eq!(descriptor.header("X-APIKEY"), Some("private-secret"));
        assert_eq!(descriptor.header("authorization"), None);
    }

    #[test]
    fn test_invalid_header_is_ignored() {
        let descriptor = RequestDescriptor::new().with_header("bad header", "value");
        assert!(descriptor.headers().is_empty());
    }

    #[test]
    fn test_from_http_reads_connect_info() {
        let addr: SocketAddr = "1.2.3.4:5555".parse().unwrap();
        let mut request = http::Request::builder()
            .method(Method::POST)
            .uri("/login?next=/")
            .header("x-apikey", "abc")
            .body(())
            .unwrap();
        request.extensions_mut().insert(ConnectInfo(addr));

        let descriptor = RequestDescriptor::from_http(&request);

        assert_eq!(descriptor.ip(), Some(addr.ip()));
        assert_eq!(descriptor.method(), Method::POST);
        assert_eq!(descriptor.path(), "/login");
        assert_eq!(descriptor.header("X-APIKey"), Some("abc"));
    }

    fn proxied(peer: &str, forwarded: &[&str]) -> http::Request<()> {
        let mut builder = http::Request::builder().uri("/");
        for value in forwarded {
            builder = builder.header(X_FORWARDED_FOR, *value);
        }
        let mut request = builder.body(()).unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(format!("{}:443", peer).parse::<SocketAddr>().unwrap()));
        request
    }

    fn ip(addr: &str) -> IpAddr {
        addr.parse().unwrap()
    }

    #[test]
    fn test_forwarded_for_ignored_by_default() {
        let request = proxied("10.0.0.1", &["1.2.3.4"]);
        assert_eq!(RequestDescriptor::from_http(&request).ip(), Some(ip("10.0.0.1")));
    }

    #[test]
    fn test_forwarded_for_from_trusted_proxy() {
        let trusted = [ip("10.0.0.1"), ip("10.0.0.2")];

        let request = proxied("10.0.0.1", &["1.2.3.4"]);
        let descriptor = RequestDescriptor::from_http_behind(&request, &trusted);
        assert_eq!(descriptor.ip(), Some(ip("1.2.3.4")));

        // A spoofed left-most entry is skipped in favour of the last untrusted hop
        let request = proxied("10.0.0.1", &["6.6.6.6, 1.2.3.4", "10.0.0.2"]);
        let descriptor = RequestDescriptor::from_http_behind(&request, &trusted);
        assert_eq!(descriptor.ip(), Some(ip("1.2.3.4")));
    }

    #[test]
    fn test_forwarded_for_from_untrusted_peer_is_ignored() {
        let trusted = [ip("10.0.0.1")];
        let request = proxied("5.6.7.8", &["1.2.3.4"]);
        let descriptor = RequestDescriptor::from_http_behind(&request, &trusted);
        assert_eq!(descriptor.ip(), Some(ip("5.6.7.8")));
    }

    #[test]
    fn test_trusted_proxy_without_forwarded_for() {
        let trusted = [ip("10.0.0.1")];
        let request = proxied("10.0.0.1", &[]);
        let descriptor = RequestDescriptor::from_http_behind(&request, &trusted);
        assert_eq!(descriptor.ip(), Some(ip("10.0.0.1")));

        let request = proxied("10.0.0.1", &["garbage"]);
        let descriptor = RequestDescriptor::from_http_behind(&request, &trusted);
        assert_eq!(descriptor.ip(), Some(ip("10.0.0.1")));
    }

    #[test]
    fn test_from_http_without_connect_info() {
        let request = http::Request::builder().uri("/").body(()).unwrap();
        let descriptor = RequestDescriptor::from_http(&request);
        assert_eq!(descriptor.ip(), None);
    }
}
