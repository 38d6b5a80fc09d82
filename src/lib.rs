// Numimesh node participation public library surface.
// Numan Thabit 2025 November weekend fun

pub mod config;

pub mod types;

pub mod wire;

pub mod crypto;

pub mod secure;

pub mod neighbor;

pub mod platform;

pub mod settings;

pub mod sync;

pub mod retx;

pub mod delayed;

pub mod search;

pub mod restore;

pub mod detach;

pub mod announce;

pub mod attach;

pub mod metrics;

#[cfg(feature = "mesh-api")]
pub mod runtime;

pub use config::{
    AttachConfig, Config, ConfigError, ParentSearchConfig, SupervisionConfig,
};

pub use types::{
    compare_partitions, link_margin_from_rss, serial_gt_u8, serial_gt_u32, AttachMode,
    AttachState, Challenge, DeviceMode, ExtAddress, LeaderData, LinkQuality, Millis,
    PartitionRank, Rloc16, Role, Timer, INVALID_RLOC16, MAX_ROUTER_ID,
};

pub use wire::{
    Command, Connectivity, CslClockAccuracy, MleMessage, MleWriter, SecurityHeader, Tlv,
    TlvCursor, TlvType, WireError, SECURITY_HEADER_LEN, SUITE_154, SUITE_NONE,
};

pub use crypto::{
    aead::{self, AeadError, MleKey, Nonce, KEY_LEN, NONCE_LEN, TAG_LEN},
    keys::{KeyManager, KEY_SWITCH_GUARD},
};

pub use secure::{
    EpochAdoption, MessageClass, RxMeta, SecureError, SecurityError,
};

pub use neighbor::{
    LinkSecurity, Neighbor, NeighborState, Parent, ParentCandidate, RssAverager,
};

pub use platform::{
    EndDeviceOps, NetworkData, NullRadio, RadioControl, RouterOps, StaticNetworkData,
};

pub use settings::{
    FileStore, MemoryStore, NetworkInfo, ParentInfo, SettingsError, SettingsStore,
    FRAME_COUNTER_AHEAD,
};

pub use sync::{dataset_needs_fetch, evaluate_leader_data, LeaderDataOutcome};

pub use retx::{RetxAction, RetxTracker, MAX_CHILD_UPDATE_ATTEMPTS, MAX_DATA_REQUEST_ATTEMPTS};

pub use delayed::{DelayedKind, DelayedSender, Schedule};

pub use search::{ParentSearch, SearchAction};

pub use restore::{RestoreAction, RestoreKind, RoleRestorer};

pub use detach::{DetachAction, Detacher};

pub use announce::{AnnounceAction, AnnounceRecovery, ChannelIdentity};

pub use attach::{
    base_backoff_delay, ext_from_iid, is_better_parent, link_local_from_ext, Datagram, Engine,
    EngineError, ParentRank, LINK_LOCAL_ALL_NODES, LINK_LOCAL_ALL_ROUTERS, PROTOCOL_VERSION,
};

pub use metrics::{Metrics, MetricsError};

#[cfg(feature = "mesh-api")]
pub use runtime::{spawn_node, NodeConfig, NodeEvent, NodeHandle, NodeHandleError};
