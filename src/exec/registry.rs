//! Process-wide endpoint registry
//!
//! Exactly one [`Endpoint`] exists per (kind, hostname) pair. Repeated lookups
//! hand back the same object, so its session and login cache are reused by
//! every component and pool thread that addresses the host.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use super::local::LocalEndpoint;
use super::remote::{ConnectTiming, RemoteEndpoint};
use super::ssh::SshTransport;
use super::{Endpoint, EndpointKind};

/// Factory invoked the first time a (kind, hostname) pair is looked up
pub type EndpointFactory = Arc<dyn Fn(EndpointKind, &str) -> Arc<dyn Endpoint> + Send + Sync>;

/// Shared, internally synchronized endpoint cache
///
/// # Example
///
/// ```
/// use cda::exec::{Endpoint, EndpointKind, EndpointRegistry, LocalEndpoint};
/// use std::sync::Arc;
///
/// let registry = EndpointRegistry::new(Arc::new(|_: EndpointKind, _: &str| {
///     Arc::new(LocalEndpoint::new()) as Arc<dyn Endpoint>
/// }));
/// let a = registry.local();
/// let b = registry.local();
/// assert!(Arc::ptr_eq(&a, &b));
/// ```
pub struct EndpointRegistry {
    factory: EndpointFactory,
    endpoints: RwLock<HashMap<(EndpointKind, String), Arc<dyn Endpoint>>>,
}

impl EndpointRegistry {
    pub fn new(factory: EndpointFactory) -> Self {
        Self {
            factory,
            endpoints: RwLock::new(HashMap::new()),
        }
    }

    /// Registry backed by [`LocalEndpoint`] and SSH remote endpoints
    pub fn with_ssh(timing: ConnectTiming) -> Self {
        Self::new(Arc::new(move |kind: EndpointKind, host: &str| match kind {
            EndpointKind::Local => Arc::new(LocalEndpoint::new()) as Arc<dyn Endpoint>,
            EndpointKind::Remote => Arc::new(RemoteEndpoint::new(
                host,
                SshTransport::default(),
                timing,
            )) as Arc<dyn Endpoint>,
        }))
    }

    pub fn get(&self, kind: EndpointKind, hostname: &str) -> Arc<dyn Endpoint> {
        let key = (kind, hostname.to_string());
        if let Some(endpoint) = self
            .endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return Arc::clone(endpoint);
        }

        let mut endpoints = self.endpoints.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            endpoints
                .entry(key)
                .or_insert_with(|| (self.factory)(kind, hostname)),
        )
    }

    pub fn local(&self) -> Arc<dyn Endpoint> {
        self.get(EndpointKind::Local, "localhost")
    }

    pub fn remote(&self, hostname: &str) -> Arc<dyn Endpoint> {
        self.get(EndpointKind::Remote, hostname)
    }

    /// Local endpoint for "localhost", remote otherwise
    pub fn for_host(&self, hostname: &str) -> Arc<dyn Endpoint> {
        if hostname == "localhost" {
            self.local()
        } else {
            self.remote(hostname)
        }
    }

    pub fn len(&self) -> usize {
        self.endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockEndpoint;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_registry(created: Arc<AtomicUsize>) -> EndpointRegistry {
        EndpointRegistry::new(Arc::new(move |kind: EndpointKind, host: &str| {
            created.fetch_add(1, Ordering::SeqCst);
            Arc::new(MockEndpoint::new(host, kind)) as Arc<dyn Endpoint>
        }))
    }

    #[test]
    fn test_same_host_same_object() {
        let created = Arc::new(AtomicUsize::new(0));
        let registry = counting_registry(Arc::clone(&created));

        for host in ["h1", "h2", "10.0.0.7", "localhost"] {
            let a = registry.remote(host);
            let b = registry.remote(host);
            assert!(Arc::ptr_eq(&a, &b), "{host}");
        }
        assert_eq!(created.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_kind_is_part_of_identity() {
        let registry = counting_registry(Arc::new(AtomicUsize::new(0)));
        let local = registry.for_host("localhost");
        let remote = registry.remote("localhost");
        assert!(!Arc::ptr_eq(&local, &remote));
        assert_eq!(local.kind(), EndpointKind::Local);
        assert_eq!(remote.kind(), EndpointKind::Remote);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_concurrent_lookups_create_once() {
        let created = Arc::new(AtomicUsize::new(0));
        let registry = Arc::new(counting_registry(Arc::clone(&created)));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.remote("shared"))
            })
            .collect();
        let endpoints: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert!(endpoints.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }
}
