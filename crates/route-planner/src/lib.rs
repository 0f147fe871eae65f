//! Hub-to-hub route planning.
//!
//! [`RoutePlanner`] finds a multi-leg route between two active hubs such
//! that no leg is longer than [`PlannerConfig::max_leg_km`]. Distances are
//! great-circle ([`geo::haversine_km`]); travel time is a flat ratio of
//! distance.

mod error;
pub mod geo;
mod hub;
mod planner;

pub use error::{Result, RouteError};
pub use hub::{Hub, HubDirectory, InMemoryHubDirectory};
pub use planner::{PlannerConfig, Route, RouteLeg, RoutePlanner};
