// Leader-data and dataset freshness tracking.
// Numan Thabit 2025

use rand::Rng;
use tracing::info;

use crate::types::{serial_gt_u8, LeaderData, Millis, Role};

/// Delay before a Data Request triggered by a multicast message, randomized
/// to spread responses from many children.
pub const MULTICAST_DATA_REQUEST_DELAY_MAX: Millis = 1_000;

/// Fixed short delay for a unicast-triggered Data Request.
pub const UNICAST_DATA_REQUEST_DELAY: Millis = 10;

/// Outcome of processing an inbound Leader Data TLV.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderDataOutcome {
    /// Nothing newer than what we hold.
    Unchanged,
    /// Leader data adopted; fetch network data when flagged.
    Adopted { retrieve_network_data: bool },
    /// An attached router saw a different partition; the attach engine
    /// resolves the conflict, the update is not accepted here.
    PartitionConflict,
}

/// Compares inbound leader data against the local copy.
///
/// `local_network_data_version` is the version of the network data actually
/// held, which can lag `local.data_version` while a fetch is outstanding.
pub fn evaluate_leader_data(
    role: Role,
    local: &LeaderData,
    local_network_data_version: u8,
    incoming: &LeaderData,
) -> LeaderDataOutcome {
    let partition_changed = incoming.partition_id != local.partition_id
        || incoming.weighting != local.weighting
        || incoming.leader_router_id != local.leader_router_id;

    if partition_changed {
        if role.is_router_or_leader() {
            return LeaderDataOutcome::PartitionConflict;
        }
        info!(
            partition = incoming.partition_id,
            leader = incoming.leader_router_id,
            "leader data changed"
        );
        return LeaderDataOutcome::Adopted {
            retrieve_network_data: true,
        };
    }

    if serial_gt_u8(incoming.data_version, local_network_data_version) {
        return LeaderDataOutcome::Adopted {
            retrieve_network_data: true,
        };
    }

    LeaderDataOutcome::Unchanged
}

/// Whether a dataset must be fetched: the message advertises a strictly newer
/// timestamp but does not carry the dataset payload itself.
pub fn dataset_needs_fetch(
    local_timestamp: Option<u64>,
    advertised_timestamp: Option<u64>,
    payload_present: bool,
) -> bool {
    if payload_present {
        return false;
    }
    match (advertised_timestamp, local_timestamp) {
        (Some(theirs), Some(ours)) => theirs > ours,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

/// Delay before sending the resulting Data Request.
pub fn data_request_delay(multicast: bool) -> Millis {
    if multicast {
        rand::thread_rng().gen_range(1..=MULTICAST_DATA_REQUEST_DELAY_MAX)
    } else {
        UNICAST_DATA_REQUEST_DELAY
    }
}
