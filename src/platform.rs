// Collaborator seams injected into the engine at construction.
// Numan Thabit 2025

use crate::announce::ChannelIdentity;
use crate::types::{LeaderData, Millis};

/// The node's copy of network-wide data distributed by the leader.
pub trait NetworkData {
    fn version(&self) -> u8;
    fn stable_version(&self) -> u8;
    /// Raw TLV blob handed back to requesters.
    fn payload(&self, stable_only: bool) -> Vec<u8>;
    fn active_timestamp(&self) -> Option<u64>;
    fn pending_timestamp(&self) -> Option<u64>;
    /// Stores freshly fetched data together with its leader data.
    fn apply(&mut self, leader: &LeaderData, payload: &[u8]);
    /// Makes a staged pending dataset active. Returns the channel identity
    /// the promoted dataset designates, or `None` when there is nothing to
    /// promote; afterwards `pending_timestamp` reads back empty.
    fn promote_pending(&mut self) -> Option<ChannelIdentity> {
        None
    }
}

/// Radio/forwarding controls the engine asserts.
pub trait RadioControl {
    fn set_rx_on_when_idle(&mut self, on: bool);
    /// Whether duty-cycled (CSL) listening is active.
    fn csl_active(&self) -> bool {
        false
    }
    /// One listening-window period when duty-cycling, else zero.
    fn csl_period(&self) -> Millis {
        0
    }
    fn channel_identity(&self) -> ChannelIdentity;
    fn set_channel_identity(&mut self, identity: ChannelIdentity);
    fn noise_floor_dbm(&self) -> i8 {
        -100
    }
}

/// Router-capable operations, injected only for full devices. End devices
/// use [`EndDeviceOps`], which declines everything.
pub trait RouterOps {
    fn router_eligible(&self) -> bool {
        false
    }
    /// All attach options exhausted; a router-capable device may found a new
    /// partition as its leader. Returns whether it did.
    fn try_become_leader(&mut self) -> bool {
        false
    }
    /// Whether this device answers Parent Requests.
    fn parent_response_allowed(&self) -> bool {
        false
    }
    /// Full-device parent-search verdict: a neighbor beats the current
    /// parent by the required link-quality margin.
    fn has_better_neighbor(&self) -> bool {
        false
    }
}

/// Strategy for devices that never route.
#[derive(Debug, Default, Clone, Copy)]
pub struct EndDeviceOps;

impl RouterOps for EndDeviceOps {}

/// Fixed in-memory network data, for tests and minimal deployments.
#[derive(Debug, Clone, Default)]
pub struct StaticNetworkData {
    pub leader: LeaderData,
    pub blob: Vec<u8>,
    pub stable_blob: Vec<u8>,
    pub active_timestamp: Option<u64>,
    pub pending_timestamp: Option<u64>,
    /// Channel identity a staged pending dataset designates.
    pub pending_channel: Option<ChannelIdentity>,
}

impl NetworkData for StaticNetworkData {
    fn version(&self) -> u8 {
        self.leader.data_version
    }

    fn stable_version(&self) -> u8 {
        self.leader.stable_data_version
    }

    fn payload(&self, stable_only: bool) -> Vec<u8> {
        if stable_only {
            self.stable_blob.clone()
        } else {
            self.blob.clone()
        }
    }

    fn active_timestamp(&self) -> Option<u64> {
        self.active_timestamp
    }

    fn pending_timestamp(&self) -> Option<u64> {
        self.pending_timestamp
    }

    fn apply(&mut self, leader: &LeaderData, payload: &[u8]) {
        self.leader = *leader;
        self.blob = payload.to_vec();
    }

    fn promote_pending(&mut self) -> Option<ChannelIdentity> {
        let identity = self.pending_channel?;
        let timestamp = self.pending_timestamp.take()?;
        self.active_timestamp = Some(timestamp);
        self.pending_channel = None;
        Some(identity)
    }
}

/// Radio stub recording what the engine asserted.
#[derive(Debug, Clone)]
pub struct NullRadio {
    pub rx_on_when_idle: bool,
    pub identity: ChannelIdentity,
    pub csl: bool,
    pub csl_period_ms: Millis,
}

impl Default for NullRadio {
    fn default() -> Self {
        Self {
            rx_on_when_idle: true,
            identity: ChannelIdentity {
                channel: 15,
                pan_id: 0xFACE,
            },
            csl: false,
            csl_period_ms: 0,
        }
    }
}

impl RadioControl for NullRadio {
    fn set_rx_on_when_idle(&mut self, on: bool) {
        self.rx_on_when_idle = on;
    }

    fn csl_active(&self) -> bool {
        self.csl
    }

    fn csl_period(&self) -> Millis {
        self.csl_period_ms
    }

    fn channel_identity(&self) -> ChannelIdentity {
        self.identity
    }

    fn set_channel_identity(&mut self, identity: ChannelIdentity) {
        self.identity = identity;
    }
}
