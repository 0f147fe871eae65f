use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::HubId;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::geo::haversine_km;

/// A logistics hub with its location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hub {
    pub id: HubId,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub active: bool,
}

impl Hub {
    /// Creates an active hub.
    pub fn new(name: impl Into<String>, latitude: f64, longitude: f64) -> Self {
        Self {
            id: HubId::new(),
            name: name.into(),
            latitude,
            longitude,
            active: true,
        }
    }

    /// Great-circle distance to another hub.
    pub fn distance_to(&self, other: &Hub) -> f64 {
        haversine_km(self.latitude, self.longitude, other.latitude, other.longitude)
    }
}

/// Source of hub data for the planner.
#[async_trait]
pub trait HubDirectory: Send + Sync {
    /// Looks up a hub, active or not.
    async fn get(&self, id: HubId) -> Option<Hub>;

    /// Every active hub.
    async fn active_hubs(&self) -> Vec<Hub>;
}

/// In-memory hub directory.
#[derive(Clone, Default)]
pub struct InMemoryHubDirectory {
    hubs: Arc<RwLock<HashMap<HubId, Hub>>>,
}

impl InMemoryHubDirectory {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a hub.
    pub async fn insert(&self, hub: Hub) {
        self.hubs.write().await.insert(hub.id, hub);
    }

    /// Marks a hub inactive. Returns false if unknown.
    pub async fn deactivate(&self, id: HubId) -> bool {
        match self.hubs.write().await.get_mut(&id) {
            Some(hub) => {
                hub.active = false;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl HubDirectory for InMemoryHubDirectory {
    async fn get(&self, id: HubId) -> Option<Hub> {
        self.hubs.read().await.get(&id).cloned()
    }

    async fn active_hubs(&self) -> Vec<Hub> {
        self.hubs
            .read()
            .await
            .values()
            .filter(|hub| hub.active)
            .cloned()
            .collect()
    }
}
