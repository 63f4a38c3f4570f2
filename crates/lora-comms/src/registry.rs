//! Registry of nodes heard on the mesh
//!
//! Every accepted packet refreshes its originator's `last_heard`; identity,
//! position and telemetry content fill in the rest of the profile. Readers
//! get cloned snapshots taken under a single read lock, so a snapshot never
//! mixes fields from before and after a concurrent update.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use crate::content::{
    DeviceMetrics, EnvironmentMetrics, NodeRole, Position, Telemetry, TelemetryMetrics, UserInfo,
};
use crate::packet::MeshPacket;

/// What the registry knows about one node
#[derive(Debug, Clone, PartialEq)]
pub struct NodeProfile {
    /// Node number
    pub node_id: u32,
    /// Identity from the latest node-info announcement
    pub user: Option<UserInfo>,
    /// Latest position report
    pub position: Option<Position>,
    /// Latest device metrics
    pub device_metrics: Option<DeviceMetrics>,
    /// Latest environment metrics
    pub environment_metrics: Option<EnvironmentMetrics>,
    /// When a packet from this node was last accepted
    pub last_heard: DateTime<Utc>,
    /// SNR of the last packet
    pub snr: f32,
    /// RSSI of the last packet
    pub rssi: i32,
    /// Remaining hop limit of the last packet
    pub hop_limit: u8,
    /// Heard within the offline timeout; computed when the snapshot is taken
    pub is_online: bool,
}

impl NodeProfile {
    fn new(node_id: u32, last_heard: DateTime<Utc>) -> Self {
        Self {
            node_id,
            user: None,
            position: None,
            device_metrics: None,
            environment_metrics: None,
            last_heard,
            snr: 0.0,
            rssi: 0,
            hop_limit: 0,
            is_online: true,
        }
    }

    /// Canonical textual id, e.g. `!0000002a`
    pub fn node_id_string(&self) -> String {
        format!("!{:08x}", self.node_id)
    }

    /// Short name, if announced
    pub fn short_name(&self) -> Option<&str> {
        self.user.as_ref().map(|u| u.short_name.as_str())
    }

    /// Long name, if announced
    pub fn long_name(&self) -> Option<&str> {
        self.user.as_ref().map(|u| u.long_name.as_str())
    }

    /// Advertised role, defaulting to client
    pub fn role(&self) -> NodeRole {
        self.user.as_ref().map(|u| u.role).unwrap_or_default()
    }
}

/// Thread-safe node registry
#[derive(Debug, Clone)]
pub struct NodeRegistry {
    nodes: Arc<RwLock<HashMap<u32, NodeProfile>>>,
    offline_timeout: Duration,
}

impl NodeRegistry {
    /// Create a registry that reports nodes offline after `offline_timeout`
    pub fn new(offline_timeout: Duration) -> Self {
        Self {
            nodes: Arc::new(RwLock::new(HashMap::new())),
            offline_timeout,
        }
    }

    /// Refresh the originator of an accepted packet, creating it on first
    /// sighting. Returns `true` if the node was new.
    pub fn observe(&self, packet: &MeshPacket) -> bool {
        let heard = packet.rx_time.unwrap_or_else(Utc::now);
        let mut nodes = self.nodes.write();
        let created = !nodes.contains_key(&packet.from);
        let profile = nodes
            .entry(packet.from)
            .or_insert_with(|| NodeProfile::new(packet.from, heard));
        if heard > profile.last_heard {
            profile.last_heard = heard;
        }
        profile.snr = packet.rx_snr;
        profile.rssi = packet.rx_rssi;
        profile.hop_limit = packet.hop_limit;

        if created {
            debug!(node = packet.from, "New node");
        } else {
            trace!(node = packet.from, "Node heard");
        }
        created
    }

    /// Record a node-info announcement
    pub fn update_user(&self, node_id: u32, user: UserInfo) -> NodeProfile {
        self.update(node_id, |p| p.user = Some(user))
    }

    /// Record a position report
    pub fn update_position(&self, node_id: u32, position: Position) -> NodeProfile {
        self.update(node_id, |p| p.position = Some(position))
    }

    /// Record a telemetry report
    pub fn update_telemetry(&self, node_id: u32, telemetry: &Telemetry) -> NodeProfile {
        self.update(node_id, |p| match telemetry.metrics {
            TelemetryMetrics::Device(m) => p.device_metrics = Some(m),
            TelemetryMetrics::Environment(m) => p.environment_metrics = Some(m),
            TelemetryMetrics::Other => {}
        })
    }

    fn update(&self, node_id: u32, apply: impl FnOnce(&mut NodeProfile)) -> NodeProfile {
        let now = Utc::now();
        let mut nodes = self.nodes.write();
        let profile = nodes
            .entry(node_id)
            .or_insert_with(|| NodeProfile::new(node_id, now));
        apply(profile);
        let mut snapshot = profile.clone();
        snapshot.is_online = self.is_online(&snapshot, now);
        snapshot
    }

    fn is_online(&self, profile: &NodeProfile, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(profile.last_heard)
            .to_std()
            .map(|age| age <= self.offline_timeout)
            // last_heard in the future (clock skew) counts as fresh
            .unwrap_or(true)
    }

    /// Look up one node
    pub fn get(&self, node_id: u32) -> Option<NodeProfile> {
        let now = Utc::now();
        self.nodes.read().get(&node_id).map(|p| {
            let mut p = p.clone();
            p.is_online = self.is_online(&p, now);
            p
        })
    }

    /// Consistent copy of every known node, ordered by node number
    pub fn snapshot(&self) -> Vec<NodeProfile> {
        self.snapshot_at(Utc::now())
    }

    /// Snapshot with online status evaluated at `now`
    pub fn snapshot_at(&self, now: DateTime<Utc>) -> Vec<NodeProfile> {
        let mut nodes: Vec<NodeProfile> = self
            .nodes
            .read()
            .values()
            .map(|p| {
                let mut p = p.clone();
                p.is_online = self.is_online(&p, now);
                p
            })
            .collect();
        nodes.sort_by_key(|p| p.node_id);
        nodes
    }

    /// Forget nodes not heard within `age`; returns how many were removed
    pub fn prune_older_than(&self, age: Duration) -> usize {
        let now = Utc::now();
        let mut nodes = self.nodes.write();
        let before = nodes.len();
        nodes.retain(|_, p| {
            now.signed_duration_since(p.last_heard)
                .to_std()
                .map(|a| a <= age)
                .unwrap_or(true)
        });
        before - nodes.len()
    }

    /// Number of known nodes
    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    /// Check if no nodes are known
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every node
    pub fn clear(&self) {
        self.nodes.write().clear();
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(2 * 60 * 60))
    }
}
