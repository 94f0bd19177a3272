//! Policy routing
//!
//! A [`PolicySelector`] picks the policy for a request, the [`Router`] finds
//! the matching route inside that policy and [`rewrite`] turns the outcome
//! into the upstream URL.

pub mod registry;
pub mod rewrite;
pub mod router;
pub mod selector;

pub use registry::{RegistryError, ServiceNode, ServiceRegistry, StaticServiceRegistry};
pub use rewrite::{Rewritten, RouteTarget, RoutingInfo, has_dot_segments, rewrite};
pub use router::Router;
pub use selector::{PolicySelector, SelectorError};

/// Routing failures
#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    /// The selected policy is not configured.
    #[error("unknown policy '{0}'")]
    UnknownPolicy(String),

    /// Nothing matched and the policy has no root route.
    #[error("no route for {method} {path} in policy '{policy}'")]
    NoRoute {
        /// Policy searched
        policy: String,
        /// Request method
        method: String,
        /// Request path
        path: String,
    },

    /// A route could not be compiled.
    #[error("invalid route '{endpoint}': {reason}")]
    InvalidRoute {
        /// Route endpoint
        endpoint: String,
        /// What is wrong with it.
        reason: String,
    },

    /// Policy selection failed.
    #[error(transparent)]
    Selector(#[from] SelectorError),

    /// No node available for a service.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}
