//! Container construction, dispatched by image scheme
//!
//! A route's `image` is `scheme://identifier`; the scheme picks the protocol
//! sub-factory that knows how to build a container for it. The registry is
//! populated at startup from the available sub-factories.

use crate::config::RouteConfig;
use crate::container::Container;
use crate::error::GateError;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Constructs (but never starts) a container for a route.
pub trait ContainerFactory: Send + Sync {
    fn create(&self, route: &RouteConfig) -> Result<Arc<dyn Container>, GateError>;
}

/// A sub-factory handling one or more image schemes.
///
/// `create` receives the route with the scheme stripped from `image`. It may
/// do scheme-specific preparation, but must leave starting the container to
/// the nursery.
pub trait ProtocolContainerFactory: Send + Sync {
    /// Scheme names (without the `://` suffix) this factory serves.
    fn schemes(&self) -> Vec<String>;

    fn create(&self, scheme: &str, route: &RouteConfig)
        -> Result<Arc<dyn Container>, GateError>;
}

/// The default [`ContainerFactory`]: a table of protocol sub-factories keyed
/// by scheme.
#[derive(Default)]
pub struct SchemeRegistry {
    factories: HashMap<String, Arc<dyn ProtocolContainerFactory>>,
}

impl SchemeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from the given sub-factories. A factory claiming a
    /// scheme that was already registered replaces the earlier entry.
    pub fn with_factories(factories: Vec<Arc<dyn ProtocolContainerFactory>>) -> Self {
        let mut registry = Self::new();
        for factory in factories {
            registry.register(factory);
        }
        registry
    }

    /// Register a sub-factory for every scheme it declares.
    pub fn register(&mut self, factory: Arc<dyn ProtocolContainerFactory>) {
        for scheme in factory.schemes() {
            debug!(scheme = %scheme, "registered container factory");
            self.factories.insert(scheme, Arc::clone(&factory));
        }
    }

    /// Schemes with a registered sub-factory.
    pub fn schemes(&self) -> Vec<String> {
        let mut schemes: Vec<String> = self.factories.keys().cloned().collect();
        schemes.sort();
        schemes
    }
}

impl ContainerFactory for SchemeRegistry {
    fn create(&self, route: &RouteConfig) -> Result<Arc<dyn Container>, GateError> {
        let (scheme, image) = match route.image.split_once("://") {
            Some((scheme, image)) if !scheme.is_empty() => (scheme, image),
            _ => return Err(GateError::MissingScheme(route.image.clone())),
        };

        let factory = self
            .factories
            .get(scheme)
            .ok_or_else(|| GateError::UnknownScheme(scheme.to_string()))?;

        let stripped = RouteConfig {
            image: image.to_string(),
            ..route.clone()
        };
        factory.create(scheme, &stripped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{ProxyRequest, ProxyResponse};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct NullContainer;

    #[async_trait]
    impl Container for NullContainer {
        fn host_port(&self) -> u16 {
            0
        }
        async fn start(&self) -> Result<(), GateError> {
            Ok(())
        }
        async fn handle(&self, _req: ProxyRequest) -> Result<ProxyResponse, GateError> {
            Err(GateError::Transport("null container".into()))
        }
        async fn shutdown(&self) {}
        async fn kill(&self) {}
    }

    /// Records the route each create call received.
    struct RecordingFactory {
        schemes: Vec<String>,
        seen: Mutex<Vec<(String, RouteConfig)>>,
    }

    impl RecordingFactory {
        fn new(schemes: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                schemes: schemes.iter().map(|s| s.to_string()).collect(),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    impl ProtocolContainerFactory for RecordingFactory {
        fn schemes(&self) -> Vec<String> {
            self.schemes.clone()
        }

        fn create(
            &self,
            scheme: &str,
            route: &RouteConfig,
        ) -> Result<Arc<dyn Container>, GateError> {
            self.seen.lock().push((scheme.to_string(), route.clone()));
            Ok(Arc::new(NullContainer))
        }
    }

    fn route(image: &str) -> RouteConfig {
        RouteConfig {
            domain: "test.example.com".to_string(),
            image: image.to_string(),
            keep_warm_seconds: 300,
            port: 8080,
            route_type: Default::default(),
        }
    }

    #[test]
    fn dispatches_by_scheme_with_image_stripped() {
        let docker = RecordingFactory::new(&["docker"]);
        let registry = SchemeRegistry::with_factories(vec![docker.clone()]);

        registry
            .create(&route("docker://nginx:alpine"))
            .expect("creates");

        let seen = docker.seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "docker");
        assert_eq!(seen[0].1.image, "nginx:alpine");
        assert_eq!(seen[0].1.domain, "test.example.com");
    }

    #[test]
    fn factory_may_serve_several_schemes() {
        let multi = RecordingFactory::new(&["docker", "podman"]);
        let registry = SchemeRegistry::with_factories(vec![multi.clone()]);
        assert_eq!(registry.schemes(), vec!["docker", "podman"]);

        registry.create(&route("podman://img")).expect("creates");
        assert_eq!(multi.seen.lock()[0].0, "podman");
    }

    #[test]
    fn missing_scheme_is_a_configuration_error() {
        let registry = SchemeRegistry::with_factories(vec![RecordingFactory::new(&["docker"])]);

        let err = registry.create(&route("no-scheme-here")).unwrap_err();
        assert!(matches!(err, GateError::MissingScheme(_)));
        assert!(err.is_configuration());

        // "://x" has an empty scheme, which the original rejected as well.
        let err = registry.create(&route("://x")).unwrap_err();
        assert!(matches!(err, GateError::MissingScheme(_)));
    }

    #[test]
    fn unknown_scheme_is_a_configuration_error() {
        let registry = SchemeRegistry::with_factories(vec![RecordingFactory::new(&["docker"])]);
        let err = registry.create(&route("nonexistent://x")).unwrap_err();
        match err {
            GateError::UnknownScheme(scheme) => assert_eq!(scheme, "nonexistent"),
            other => panic!("expected UnknownScheme, got {other}"),
        }
    }
}
