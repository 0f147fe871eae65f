use common::HubId;
use thiserror::Error;

/// Errors that can occur while planning a route.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RouteError {
    /// Source and target are the same hub.
    #[error("Source and target are the same hub: {0}")]
    SameHub(HubId),

    /// The hub does not exist.
    #[error("Hub not found: {0}")]
    HubNotFound(HubId),

    /// The hub exists but is not accepting traffic.
    #[error("Hub is inactive: {0}")]
    HubInactive(HubId),

    /// No unvisited active hub is within range of the current hub.
    #[error("No hub within {max_leg_km} km of {from}")]
    NoCandidate { from: HubId, max_leg_km: f64 },

    /// The relay did not reach the target within the hop ceiling.
    #[error("Route exceeds {max_hops} hops")]
    HopLimit { max_hops: usize },
}

/// Result type for route planning.
pub type Result<T> = std::result::Result<T, RouteError>;
