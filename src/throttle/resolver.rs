//! Discriminator, limit and period resolution.

use std::fmt;
use std::sync::Arc;

use super::request::RequestDescriptor;
use crate::error::BoxError;

type ResolveFn<T> = dyn Fn(&RequestDescriptor) -> Result<T, BoxError> + Send + Sync;

/// A value that is either fixed or computed from the request.
///
/// Dynamic resolvers run once per evaluation with the same descriptor used to
/// discriminate, so per-request values (e.g. an API-key tier) are honored.
pub enum Resolver<T> {
    /// The same value for every request
    Fixed(T),
    /// Computed from the request on every evaluation
    Dynamic(Arc<ResolveFn<T>>),
}

impl<T: Clone> Resolver<T> {
    /// Build a resolver from an infallible function of the request.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&RequestDescriptor) -> T + Send + Sync + 'static,
    {
        Resolver::Dynamic(Arc::new(move |request: &RequestDescriptor| {
            Ok::<T, BoxError>(f(request))
        }))
    }

    /// Build a resolver from a fallible function of the request.
    pub fn try_from_fn<F>(f: F) -> Self
    where
        F: Fn(&RequestDescriptor) -> Result<T, BoxError> + Send + Sync + 'static,
    {
        Resolver::Dynamic(Arc::new(f))
    }

    pub fn resolve(&self, request: &RequestDescriptor) -> Result<T, BoxError> {
        match self {
            Resolver::Fixed(value) => Ok(value.clone()),
            Resolver::Dynamic(f) => f(request),
        }
    }

    /// The fixed value, if this resolver does not depend on the request.
    pub fn fixed(&self) -> Option<&T> {
        match self {
            Resolver::Fixed(value) => Some(value),
            Resolver::Dynamic(_) => None,
        }
    }
}

impl<T: Clone> Clone for Resolver<T> {
    fn clone(&self) -> Self {
        match self {
            Resolver::Fixed(value) => Resolver::Fixed(value.clone()),
            Resolver::Dynamic(f) => Resolver::Dynamic(Arc::clone(f)),
        }
    }
}

impl From<u64> for Resolver<u64> {
    fn from(value: u64) -> Self {
        Resolver::Fixed(value)
    }
}

impl<T: fmt::Debug> fmt::Debug for Resolver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolver::Fixed(value) => f.debug_tuple("Fixed").field(value).finish(),
            Resolver::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

/// Derives the counter partition for a request.
///
/// Resolving to `None` means the rule does not apply to the request.
#[derive(Clone)]
pub struct Discriminator(Arc<ResolveFn<Option<String>>>);

impl Discriminator {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&RequestDescriptor) -> Option<String> + Send + Sync + 'static,
    {
        Self(Arc::new(move |request: &RequestDescriptor| {
            Ok::<Option<String>, BoxError>(f(request))
        }))
    }

    pub fn try_new<F>(f: F) -> Self
    where
        F: Fn(&RequestDescriptor) -> Result<Option<String>, BoxError> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Discriminate by source address. Requests without one are not throttled.
    pub fn by_ip() -> Self {
        Self::new(|request| request.ip().map(|ip| ip.to_string()))
    }

    /// Discriminate by the value of a header. Requests without it are not throttled.
    pub fn by_header(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(move |request| request.header(&name).map(str::to_string))
    }

    pub fn resolve(&self, request: &RequestDescriptor) -> Result<Option<String>, BoxError> {
        (self.0)(request)
    }
}

impl fmt::Debug for Discriminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Discriminator(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn ip(addr: &str) -> IpAddr {
        addr.parse().unwrap()
    }

    #[test]
    fn test_fixed_resolver() {
        let resolver: Resolver<u64> = 5_u64.into();
        let request = RequestDescriptor::new();

        assert_eq!(resolver.resolve(&request).unwrap(), 5);
        assert_eq!(resolver.fixed(), Some(&5));
    }

    #[test]
    fn test_dynamic_resolver_reads_request() {
        let resolver: Resolver<u64> = Resolver::from_fn(|request: &RequestDescriptor| {
            if request.header("x-apikey") == Some("private-secret") {
                2
            } else {
                1
            }
        });

        let anonymous = RequestDescriptor::new();
        let keyed = RequestDescriptor::new().with_header("X-APIKey", "private-secret");

        assert_eq!(resolver.resolve(&anonymous).unwrap(), 1);
        assert_eq!(resolver.resolve(&keyed).unwrap(), 2);
        assert!(resolver.fixed().is_none());
    }

    #[test]
    fn test_fallible_resolver_propagates_error() {
        let resolver: Resolver<u64> = Resolver::try_from_fn(|_| Err("tier lookup failed".into()));

        let err = resolver.resolve(&RequestDescriptor::new()).unwrap_err();
        assert_eq!(err.to_string(), "tier lookup failed");
    }

    #[test]
    fn test_discriminator_by_ip() {
        let discriminator = Discriminator::by_ip();

        let request = RequestDescriptor::new().with_ip(ip("1.2.3.4"));
        assert_eq!(discriminator.resolve(&request).unwrap().as_deref(), Some("1.2.3.4"));

        let request = RequestDescriptor::new();
        assert_eq!(discriminator.resolve(&request).unwrap(), None);
    }

    #[test]
    fn test_discriminator_by_header() {
        let discriminator = Discriminator::by_header("X-APIKey");

        let request = RequestDescriptor::new().with_header("x-apikey", "k1");
        assert_eq!(discriminator.resolve(&request).unwrap().as_deref(), Some("k1"));

        assert_eq!(discriminator.resolve(&RequestDescriptor::new()).unwrap(), None);
    }
}
