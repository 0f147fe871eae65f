//! Greedy relay planner.
//!
//! If the target is within one leg, the route is direct. Otherwise the
//! planner hops to an unvisited active hub within range, preferring one that
//! gets strictly closer to the target and, among those, the closest. If none
//! gets closer, it takes the in-range hub closest to the target anyway. The
//! visited set and a hop ceiling keep it from cycling.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use common::HubId;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::error::{Result, RouteError};
use crate::{Hub, HubDirectory};

/// Planner limits.
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    /// Longest allowed single leg.
    pub max_leg_km: f64,
    /// Most legs a route may have.
    pub max_hops: usize,
    /// Travel minutes per kilometre. A flat ratio, not a speed model.
    pub minutes_per_km: f64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_leg_km: 200.0,
            max_hops: 20,
            minutes_per_km: 1.0,
        }
    }
}

/// One hub-to-hub leg.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteLeg {
    pub from: HubId,
    pub to: HubId,
    pub distance_km: f64,
    pub duration_minutes: u32,
}

/// A planned route.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Route {
    pub source: HubId,
    pub target: HubId,
    pub legs: Vec<RouteLeg>,
    pub total_distance_km: f64,
    pub total_minutes: u32,
}

impl Route {
    /// Every hub on the route, in order.
    pub fn hubs(&self) -> Vec<HubId> {
        let mut hubs = vec![self.source];
        hubs.extend(self.legs.iter().map(|leg| leg.to));
        hubs
    }
}

/// The candidate closest to `target`, optionally only among those closer than `below`.
fn closest_to<'a>(target: &Hub, candidates: &[&'a Hub], below: Option<f64>) -> Option<&'a Hub> {
    candidates
        .iter()
        .copied()
        .map(|hub| (hub.distance_to(target), hub))
        .filter(|(d, _)| below.is_none_or(|limit| *d < limit))
        .min_by(|(a, _), (b, _)| a.total_cmp(b))
        .map(|(_, hub)| hub)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Plans routes over a [`HubDirectory`], caching per (source, target).
pub struct RoutePlanner<D> {
    directory: D,
    config: PlannerConfig,
    cache: Arc<RwLock<HashMap<(HubId, HubId), Route>>>,
}

impl<D: HubDirectory> RoutePlanner<D> {
    /// Creates a planner.
    pub fn new(directory: D, config: PlannerConfig) -> Self {
        Self {
            directory,
            config,
            cache: Arc::default(),
        }
    }

    /// The planner's limits.
    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// Drops every cached route. Call after the hub graph changes.
    pub async fn invalidate_cache(&self) {
        self.cache.write().await.clear();
    }

    /// Plans a route from `source` to `target`.
    #[tracing::instrument(skip(self))]
    pub async fn plan(&self, source: HubId, target: HubId) -> Result<Route> {
        if source == target {
            return Err(RouteError::SameHub(source));
        }
        let from = self.active_hub(source).await?;
        let to = self.active_hub(target).await?;

        if let Some(route) = self.cache.read().await.get(&(source, target)) {
            metrics::counter!("route_cache_hits_total").increment(1);
            return Ok(route.clone());
        }

        let route = if from.distance_to(&to) <= self.config.max_leg_km {
            self.build_route(source, target, vec![(from, to)])
        } else {
            let candidates = self.directory.active_hubs().await;
            let hops = self.relay(&from, &to, &candidates)?;
            self.build_route(source, target, hops)
        };

        tracing::debug!(
            legs = route.legs.len(),
            total_km = route.total_distance_km,
            "Route planned"
        );
        self.cache
            .write()
            .await
            .insert((source, target), route.clone());
        Ok(route)
    }

    async fn active_hub(&self, id: HubId) -> Result<Hub> {
        let hub = self
            .directory
            .get(id)
            .await
            .ok_or(RouteError::HubNotFound(id))?;
        if !hub.active {
            return Err(RouteError::HubInactive(id));
        }
        Ok(hub)
    }

    fn relay(&self, from: &Hub, to: &Hub, hubs: &[Hub]) -> Result<Vec<(Hub, Hub)>> {
        let max = self.config.max_leg_km;
        let mut visited: HashSet<HubId> = HashSet::from([from.id]);
        let mut current = from.clone();
        let mut hops = Vec::new();

        loop {
            if hops.len() >= self.config.max_hops {
                return Err(RouteError::HopLimit {
                    max_hops: self.config.max_hops,
                });
            }

            let remaining = current.distance_to(to);
            if remaining <= max {
                hops.push((current, to.clone()));
                return Ok(hops);
            }

            let in_range: Vec<&Hub> = hubs
                .iter()
                .filter(|hub| {
                    hub.id != current.id
                        && hub.id != to.id
                        && !visited.contains(&hub.id)
                        && current.distance_to(hub) <= max
                })
                .collect();
            let next = closest_to(to, &in_range, Some(remaining))
                .or_else(|| closest_to(to, &in_range, None))
                .ok_or(RouteError::NoCandidate {
                    from: current.id,
                    max_leg_km: max,
                })?;

            visited.insert(next.id);
            let next = next.clone();
            hops.push((current, next.clone()));
            current = next;
        }
    }

    fn build_route(&self, source: HubId, target: HubId, hops: Vec<(Hub, Hub)>) -> Route {
        let legs: Vec<RouteLeg> = hops
            .into_iter()
            .map(|(a, b)| {
                let distance_km = round2(a.distance_to(&b));
                RouteLeg {
                    from: a.id,
                    to: b.id,
                    distance_km,
                    duration_minutes: (distance_km * self.config.minutes_per_km).ceil() as u32,
                }
            })
            .collect();
        Route {
            source,
            target,
            total_distance_km: round2(legs.iter().map(|l| l.distance_km).sum()),
            total_minutes: legs.iter().map(|l| l.duration_minutes).sum(),
            legs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryHubDirectory;
    use crate::geo::haversine_km;

    async fn planner(hubs: &[Hub]) -> RoutePlanner<InMemoryHubDirectory> {
        let directory = InMemoryHubDirectory::new();
        for hub in hubs {
            directory.insert(hub.clone()).await;
        }
        RoutePlanner::new(directory, PlannerConfig::default())
    }

    #[tokio::test]
    async fn close_hubs_get_a_single_leg() {
        let a = Hub::new("A", 0.0, 0.0);
        let b = Hub::new("B", 0.5, 0.0);
        let planner = planner(&[a.clone(), b.clone()]).await;

        let route = planner.plan(a.id, b.id).await.unwrap();

        assert_eq!(route.legs.len(), 1);
        assert!(route.total_distance_km < 200.0);
        assert!((route.total_distance_km - 55.6).abs() < 0.1);
    }

    #[tokio::test]
    async fn distant_hubs_relay_through_midpoint() {
        let a = Hub::new("A", 0.0, 0.0);
        let mid = Hub::new("Mid", 1.0, 0.0);
        let c = Hub::new("C", 2.0, 0.0);
        let planner = planner(&[a.clone(), mid.clone(), c.clone()]).await;

        let route = planner.plan(a.id, c.id).await.unwrap();

        assert_eq!(route.legs.len(), 2);
        assert_eq!(route.legs[0].to, mid.id);
        assert_eq!(route.legs[1].from, mid.id);
        assert_eq!(route.hubs(), vec![a.id, mid.id, c.id]);
        let expected = haversine_km(0.0, 0.0, 1.0, 0.0) + haversine_km(1.0, 0.0, 2.0, 0.0);
        assert!((route.total_distance_km - expected).abs() <= 0.01);
        for leg in &route.legs {
            assert!(leg.distance_km <= 200.0);
        }
    }

    #[tokio::test]
    async fn prefers_candidate_closest_to_target() {
        let a = Hub::new("A", 0.0, 0.0);
        let detour = Hub::new("Detour", 0.5, 1.0);
        let near = Hub::new("Near", 1.5, 0.0);
        let c = Hub::new("C", 3.0, 0.0);
        let planner = planner(&[a.clone(), detour, near.clone(), c.clone()]).await;

        let route = planner.plan(a.id, c.id).await.unwrap();

        assert_eq!(route.hubs(), vec![a.id, near.id, c.id]);
    }

    #[tokio::test]
    async fn rejects_same_missing_and_inactive_hubs() {
        let a = Hub::new("A", 0.0, 0.0);
        let mut inactive = Hub::new("Closed", 0.1, 0.0);
        inactive.active = false;
        let planner = planner(&[a.clone(), inactive.clone()]).await;
        let missing = HubId::new();

        assert_eq!(planner.plan(a.id, a.id).await, Err(RouteError::SameHub(a.id)));
        assert_eq!(
            planner.plan(a.id, missing).await,
            Err(RouteError::HubNotFound(missing))
        );
        assert_eq!(
            planner.plan(inactive.id, a.id).await,
            Err(RouteError::HubInactive(inactive.id))
        );
    }

    #[tokio::test]
    async fn unreachable_target_has_no_candidate() {
        let a = Hub::new("A", 0.0, 0.0);
        let c = Hub::new("C", 10.0, 0.0);
        let planner = planner(&[a.clone(), c.clone()]).await;

        assert!(matches!(
            planner.plan(a.id, c.id).await,
            Err(RouteError::NoCandidate { from, .. }) if from == a.id
        ));
    }

    #[tokio::test]
    async fn hop_ceiling_is_enforced() {
        let hubs: Vec<Hub> = (0..=6)
            .map(|i| Hub::new(format!("H{i}"), i as f64, 0.0))
            .collect();
        let directory = InMemoryHubDirectory::new();
        for hub in &hubs {
            directory.insert(hub.clone()).await;
        }
        let planner = RoutePlanner::new(
            directory,
            PlannerConfig {
                max_leg_km: 150.0,
                max_hops: 3,
                ..Default::default()
            },
        );

        assert_eq!(
            planner.plan(hubs[0].id, hubs[6].id).await,
            Err(RouteError::HopLimit { max_hops: 3 })
        );
    }

    #[tokio::test]
    async fn cached_route_survives_hub_changes_until_invalidated() {
        let a = Hub::new("A", 0.0, 0.0);
        let mid = Hub::new("Mid", 1.0, 0.0);
        let c = Hub::new("C", 2.0, 0.0);
        let directory = InMemoryHubDirectory::new();
        for hub in [&a, &mid, &c] {
            directory.insert(hub.clone()).await;
        }
        let planner = RoutePlanner::new(directory.clone(), PlannerConfig::default());

        let first = planner.plan(a.id, c.id).await.unwrap();
        directory.deactivate(mid.id).await;
        assert_eq!(planner.plan(a.id, c.id).await.unwrap(), first);

        planner.invalidate_cache().await;
        assert!(planner.plan(a.id, c.id).await.is_err());
    }

    #[tokio::test]
    async fn travel_time_follows_distance_ratio() {
        let a = Hub::new("A", 0.0, 0.0);
        let b = Hub::new("B", 1.0, 0.0);
        let planner = planner(&[a.clone(), b.clone()]).await;

        let route = planner.plan(a.id, b.id).await.unwrap();
        assert_eq!(route.total_minutes, 112);
    }
}
