//! Request routing: mapping an inbound identity to a route definition

use crate::config::{Config, RouteConfig};
use std::collections::HashMap;

/// Maps a request's routing identity (the HTTP Host, or a TCP/UDP route's
/// identity label) to its route definition. A miss is a normal negative
/// result, not an error.
pub trait RequestRouter: Send + Sync {
    fn route(&self, host: &str) -> Option<RouteConfig>;
}

/// Router over the routes loaded at startup. Exact-match only; no wildcard
/// or prefix matching.
pub struct ConfigRouter {
    routes: HashMap<String, RouteConfig>,
}

impl ConfigRouter {
    pub fn new(config: &Config) -> Self {
        Self {
            routes: config
                .routes
                .iter()
                .map(|route| (route.domain.clone(), route.clone()))
                .collect(),
        }
    }
}

impl RequestRouter for ConfigRouter {
    fn route(&self, host: &str) -> Option<RouteConfig> {
        self.routes.get(host).cloned()
    }
}
