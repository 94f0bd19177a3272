//! Service registry: logical service name to node
//!
//! The static registry is seeded from the `services:` config section. A node
//! that fails is skipped for its service's `failure_cooldown`; when every
//! node of a service is cooling down the lookup fails instead of guessing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::RngExt;
use tracing::{debug, warn};

use crate::config::{LoadBalancing, ServiceConfig};

/// Registry lookup failures.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Service has no registered nodes.
    #[error("no nodes registered for service '{0}'")]
    UnknownService(String),

    /// Every node is cooling down after a failure.
    #[error("no healthy node for service '{0}'")]
    NoHealthyNode(String),
}

/// A reachable instance of a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceNode {
    /// `host:port`
    pub address: String,
    /// URL scheme
    pub protocol: String,
}

/// Resolves logical services to nodes.
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// Pick a node for `service`.
    ///
    /// Nodes that failed recently are skipped until their cooldown ends. When
    /// every node is cooling down the call fails rather than retrying a dead one.
    async fn next(&self, service: &str) -> Result<ServiceNode, RegistryError>;

    /// Record that `address` failed while serving `service`.
    ///
    /// Called from the request path, so implementations must not block.
    fn report_failure(&self, service: &str, address: &str);
}

struct NodeState {
    node: ServiceNode,
    unhealthy_until: Mutex<Option<Instant>>,
}

impl NodeState {
    fn is_healthy(&self, now: Instant) -> bool {
        self.unhealthy_until.lock().is_none_or(|until| now >= until)
    }
}

struct ServicePool {
    strategy: LoadBalancing,
    nodes: Vec<NodeState>,
    cursor: AtomicUsize,
    cooldown: Duration,
}

/// Registry over a fixed set of nodes, seeded from the `services` config
/// section. Health is tracked per node in memory and is lost on restart.
#[derive(Default)]
pub struct StaticServiceRegistry {
    services: HashMap<String, ServicePool>,
}

impl StaticServiceRegistry {
    /// Build from config.
    pub fn from_config(services: &HashMap<String, ServiceConfig>) -> Self {
        let services = services
            .iter()
            .map(|(name, config)| {
                let nodes = config
                    .nodes
                    .iter()
                    .map(|n| NodeState {
                        node: ServiceNode {
                            address: n.address.clone(),
                            protocol: n.protocol.clone(),
                        },
                        unhealthy_until: Mutex::new(None),
                    })
                    .collect();
                (
                    name.clone(),
                    ServicePool {
                        strategy: config.strategy,
                        nodes,
                        cursor: AtomicUsize::new(0),
                        cooldown: config.failure_cooldown,
                    },
                )
            })
            .collect();
        Self { services }
    }

    /// Registered service names.
    pub fn service_names(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }
}

#[async_trait]
impl ServiceRegistry for StaticServiceRegistry {
    async fn next(&self, service: &str) -> Result<ServiceNode, RegistryError> {
        let pool = self
            .services
            .get(service)
            .filter(|p| !p.nodes.is_empty())
            .ok_or_else(|| RegistryError::UnknownService(service.to_string()))?;

        let now = Instant::now();
        let len = pool.nodes.len();
        let chosen = match pool.strategy {
            LoadBalancing::RoundRobin => {
                let start = pool.cursor.fetch_add(1, Ordering::Relaxed);
                (0..len)
                    .map(|offset| &pool.nodes[(start + offset) % len])
                    .find(|n| n.is_healthy(now))
            }
            LoadBalancing::Random => {
                let healthy: Vec<&NodeState> =
                    pool.nodes.iter().filter(|n| n.is_healthy(now)).collect();
                if healthy.is_empty() {
                    None
                } else {
                    Some(healthy[rand::rng().random_range(0..healthy.len())])
                }
            }
        };

        chosen
            .map(|n| n.node.clone())
            .ok_or_else(|| RegistryError::NoHealthyNode(service.to_string()))
    }

    fn report_failure(&self, service: &str, address: &str) {
        let Some(pool) = self.services.get(service) else {
            return;
        };
        if let Some(state) = pool.nodes.iter().find(|n| n.node.address == address) {
            *state.unhealthy_until.lock() = Some(Instant::now() + pool.cooldown);
            if pool.nodes.len() > 1 {
                debug!(service = %service, address = %address, "Node marked unhealthy");
            } else {
                warn!(service = %service, address = %address, "Only node of service marked unhealthy");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceNodeConfig;
    use pretty_assertions::assert_eq;

    fn registry(strategy: LoadBalancing, addresses: &[&str], cooldown: Duration) -> StaticServiceRegistry {
        let mut services = HashMap::new();
        services.insert(
            "web".to_string(),
            ServiceConfig {
                strategy,
                nodes: addresses
                    .iter()
                    .map(|a| ServiceNodeConfig {
                        address: (*a).to_string(),
                        protocol: "http".to_string(),
                    })
                    .collect(),
                failure_cooldown: cooldown,
            },
        );
        StaticServiceRegistry::from_config(&services)
    }

    #[tokio::test]
    async fn test_round_robin_cycles() {
        let r = registry(LoadBalancing::RoundRobin, &["a:1", "b:1", "c:1"], Duration::from_secs(10));
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(r.next("web").await.unwrap().address);
        }
        assert_eq!(seen, vec!["a:1", "b:1", "c:1", "a:1"]);
    }

    #[tokio::test]
    async fn test_failed_node_is_skipped() {
        let r = registry(LoadBalancing::RoundRobin, &["a:1", "b:1"], Duration::from_secs(10));
        r.report_failure("web", "a:1");
        for _ in 0..4 {
            assert_eq!(r.next("web").await.unwrap().address, "b:1");
        }
    }

    #[tokio::test]
    async fn test_all_unhealthy_is_error() {
        let r = registry(LoadBalancing::Random, &["a:1"], Duration::from_secs(10));
        assert_eq!(r.next("web").await.unwrap().address, "a:1");
        r.report_failure("web", "a:1");
        assert!(matches!(r.next("web").await, Err(RegistryError::NoHealthyNode(_))));
    }

    #[tokio::test]
    async fn test_random_picks_only_healthy_nodes() {
        let r = registry(LoadBalancing::Random, &["a:1", "b:1", "c:1"], Duration::from_secs(10));
        r.report_failure("web", "b:1");
        let mut seen = std::collections::HashSet::new();
        for _ in 0..64 {
            seen.insert(r.next("web").await.unwrap().address);
        }
        assert!(!seen.contains("b:1"));
        assert!(seen.iter().all(|a| a == "a:1" || a == "c:1"));
    }

    #[tokio::test]
    async fn test_node_recovers_after_cooldown() {
        let r = registry(LoadBalancing::RoundRobin, &["a:1"], Duration::from_millis(10));
        r.report_failure("web", "a:1");
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(r.next("web").await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_service() {
        let r = registry(LoadBalancing::RoundRobin, &["a:1"], Duration::from_secs(1));
        assert!(matches!(r.next("graph").await, Err(RegistryError::UnknownService(_))));
    }
}
