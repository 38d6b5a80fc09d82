// Core identifiers, roles, and small value types shared across the engine.
// Numan Thabit 2025

use std::fmt;

use rand::RngCore;
use subtle::ConstantTimeEq;

/// Monotonic engine time in milliseconds.
///
/// The engine never reads a clock itself; every entry point takes `now` and
/// every timer is a stored [`Millis`] fire time compared against it.
pub type Millis = u64;

/// Extended (EUI-64 style) address, globally unique per device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ExtAddress(pub [u8; 8]);

impl ExtAddress {
    /// Generates a random extended address with the local/unicast bits set.
    pub fn random() -> Self {
        let mut bytes = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut bytes);
        bytes[0] = (bytes[0] | 0x02) & 0xFE;
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl fmt::Display for ExtAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if i != 0 {
                write!(f, ":")?;
            }
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Short address encoding a device's position in the mesh topology.
///
/// Layout: upper 6 bits router id, lower 10 bits child id. A router's own
/// address has a zero child id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rloc16(pub u16);

pub const INVALID_RLOC16: Rloc16 = Rloc16(0xFFFE);
pub const MAX_ROUTER_ID: u8 = 62;

impl Rloc16 {
    const ROUTER_ID_OFFSET: u32 = 10;
    const CHILD_ID_MASK: u16 = (1 << Self::ROUTER_ID_OFFSET) - 1;

    pub const fn from_parts(router_id: u8, child_id: u16) -> Self {
        Self(((router_id as u16) << Self::ROUTER_ID_OFFSET) | (child_id & Self::CHILD_ID_MASK))
    }

    pub const fn router_id(self) -> u8 {
        (self.0 >> Self::ROUTER_ID_OFFSET) as u8
    }

    pub const fn child_id(self) -> u16 {
        self.0 & Self::CHILD_ID_MASK
    }

    /// A router address carries no child id bits.
    pub const fn is_router(self) -> bool {
        self.child_id() == 0
    }

    pub fn is_valid(self) -> bool {
        self.0 != INVALID_RLOC16.0 && self.router_id() <= MAX_ROUTER_ID
    }
}

impl fmt::Display for Rloc16 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Device role in the mesh. Exactly one at a time; transitions go through
/// `Engine::set_role` so duration counters and dependents stay consistent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Disabled,
    Detached,
    Child,
    Router,
    Leader,
}

impl Role {
    pub fn is_attached(self) -> bool {
        matches!(self, Role::Child | Role::Router | Role::Leader)
    }

    pub fn is_router_or_leader(self) -> bool {
        matches!(self, Role::Router | Role::Leader)
    }

    pub const fn as_u8(self) -> u8 {
        match self {
            Role::Disabled => 0,
            Role::Detached => 1,
            Role::Child => 2,
            Role::Router => 3,
            Role::Leader => 4,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Role::Disabled),
            1 => Some(Role::Detached),
            2 => Some(Role::Child),
            3 => Some(Role::Router),
            4 => Some(Role::Leader),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Disabled => "disabled",
            Role::Detached => "detached",
            Role::Child => "child",
            Role::Router => "router",
            Role::Leader => "leader",
        };
        f.write_str(name)
    }
}

/// Phase of the attach timer loop. Independent of [`Role`]: an attached
/// device may run an attach cycle looking for a better partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachState {
    Idle,
    Start,
    ParentRequest,
    Announce,
    ChildIdRequest,
}

/// Governs which candidate parents an attach cycle will accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachMode {
    /// Accept any partition other than the one we just left.
    AnyPartition,
    /// Only reattach within the current partition.
    SamePartition,
    /// Only accept a partition that compares strictly better.
    BetterPartition,
    /// Router stepping down to a router-eligible end device.
    DowngradeToReed,
    /// Stay attached, look for a better parent in the same partition.
    BetterParent,
    /// Directed attach to a single previously located candidate.
    SelectedParent,
}

impl fmt::Display for AttachMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AttachMode::AnyPartition => "any-partition",
            AttachMode::SamePartition => "same-partition",
            AttachMode::BetterPartition => "better-partition",
            AttachMode::DowngradeToReed => "downgrade-to-reed",
            AttachMode::BetterParent => "better-parent",
            AttachMode::SelectedParent => "selected-parent",
        };
        f.write_str(name)
    }
}

/// Device mode bits exchanged in the Mode TLV.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceMode(pub u8);

impl DeviceMode {
    pub const RX_ON_WHEN_IDLE: u8 = 0x08;
    pub const FULL_THREAD_DEVICE: u8 = 0x02;
    pub const FULL_NETWORK_DATA: u8 = 0x01;

    pub const fn new(rx_on_when_idle: bool, full_device: bool, full_network_data: bool) -> Self {
        let mut bits = 0;
        if rx_on_when_idle {
            bits |= Self::RX_ON_WHEN_IDLE;
        }
        if full_device {
            bits |= Self::FULL_THREAD_DEVICE;
        }
        if full_network_data {
            bits |= Self::FULL_NETWORK_DATA;
        }
        Self(bits)
    }

    pub const fn rx_on_when_idle(self) -> bool {
        self.0 & Self::RX_ON_WHEN_IDLE != 0
    }

    /// Router-eligible (full) device.
    pub const fn is_full_device(self) -> bool {
        self.0 & Self::FULL_THREAD_DEVICE != 0
    }

    pub const fn full_network_data(self) -> bool {
        self.0 & Self::FULL_NETWORK_DATA != 0
    }

    /// Sleepy end device: polls its parent instead of listening.
    pub const fn is_sleepy(self) -> bool {
        !self.rx_on_when_idle()
    }

    /// Minimal end device: not router-eligible.
    pub const fn is_minimal(self) -> bool {
        !self.is_full_device()
    }
}

/// Leader Data as carried on the wire and held locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LeaderData {
    pub partition_id: u32,
    pub weighting: u8,
    pub data_version: u8,
    pub stable_data_version: u8,
    pub leader_router_id: u8,
}

/// Result of ranking one partition against another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionRank {
    Worse,
    Same,
    Better,
}

/// Ranks `candidate` against `current`.
///
/// Priority order: singleton flag (a connected partition beats a singleton),
/// leader weighting, partition id, then data version as the final tiebreak.
pub fn compare_partitions(
    candidate_singleton: bool,
    candidate: &LeaderData,
    current_singleton: bool,
    current: &LeaderData,
) -> PartitionRank {
    if candidate_singleton != current_singleton {
        return if current_singleton {
            PartitionRank::Better
        } else {
            PartitionRank::Worse
        };
    }
    if candidate.weighting != current.weighting {
        return if candidate.weighting > current.weighting {
            PartitionRank::Better
        } else {
            PartitionRank::Worse
        };
    }
    if candidate.partition_id != current.partition_id {
        return if candidate.partition_id > current.partition_id {
            PartitionRank::Better
        } else {
            PartitionRank::Worse
        };
    }
    if candidate.data_version != current.data_version {
        return if serial_gt_u8(candidate.data_version, current.data_version) {
            PartitionRank::Better
        } else {
            PartitionRank::Worse
        };
    }
    PartitionRank::Same
}

/// Serial-number comparison (RFC 1982 style) for wrapping u8 versions.
pub const fn serial_gt_u8(a: u8, b: u8) -> bool {
    a != b && a.wrapping_sub(b) < 0x80
}

/// Serial-number comparison for wrapping u32 sequence numbers.
pub const fn serial_gt_u32(a: u32, b: u32) -> bool {
    a != b && a.wrapping_sub(b) < 0x8000_0000
}

/// Fixed-length random challenge echoed back as a Response TLV.
#[derive(Debug, Clone, Copy, Default)]
pub struct Challenge(pub [u8; 8]);

pub const CHALLENGE_LEN: usize = 8;

impl Challenge {
    pub fn random() -> Self {
        let mut bytes = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Constant-time equality; challenge echo is a security check.
    pub fn matches(&self, response: &[u8]) -> bool {
        if response.len() != CHALLENGE_LEN {
            return false;
        }
        self.0.ct_eq(response).into()
    }
}

/// Two-way link quality bucket derived from measured link margin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LinkQuality {
    Zero = 0,
    One = 1,
    Two = 2,
    Three = 3,
}

impl LinkQuality {
    /// Buckets a link margin (dB) into quality 0..3.
    pub fn from_link_margin(margin: u8) -> Self {
        if margin > 20 {
            LinkQuality::Three
        } else if margin > 10 {
            LinkQuality::Two
        } else if margin > 2 {
            LinkQuality::One
        } else {
            LinkQuality::Zero
        }
    }

    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => LinkQuality::Zero,
            1 => LinkQuality::One,
            2 => LinkQuality::Two,
            _ => LinkQuality::Three,
        }
    }
}

/// Computes link margin (dB) from a received signal strength and noise floor.
pub fn link_margin_from_rss(rss: i8, noise_floor: i8) -> u8 {
    rss.saturating_sub(noise_floor).max(0) as u8
}

/// Simple one-shot timer: a stored fire time compared against `now`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Timer {
    fire_at: Option<Millis>,
}

impl Timer {
    pub fn start(&mut self, now: Millis, delay: Millis) {
        self.fire_at = Some(now.saturating_add(delay));
    }

    pub fn start_at(&mut self, fire_at: Millis) {
        self.fire_at = Some(fire_at);
    }

    pub fn stop(&mut self) {
        self.fire_at = None;
    }

    pub fn is_running(&self) -> bool {
        self.fire_at.is_some()
    }

    pub fn fire_time(&self) -> Option<Millis> {
        self.fire_at
    }

    /// Returns true and disarms when the fire time has been reached.
    pub fn take_fired(&mut self, now: Millis) -> bool {
        match self.fire_at {
            Some(at) if now >= at => {
                self.fire_at = None;
                true
            }
            _ => false,
        }
    }
}

/// Folds an optional fire time into a running minimum.
pub fn earliest(a: Option<Millis>, b: Option<Millis>) -> Option<Millis> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (x, None) => x,
        (None, y) => y,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rloc16_parts_round_trip() {
        let rloc = Rloc16::from_parts(17, 0x155);
        assert_eq!(rloc.router_id(), 17);
        assert_eq!(rloc.child_id(), 0x155);
        assert!(!rloc.is_router());
        assert!(Rloc16::from_parts(17, 0).is_router());
    }

    #[test]
    fn invalid_rloc16_rejected() {
        assert!(!INVALID_RLOC16.is_valid());
        assert!(!Rloc16::from_parts(63, 0).is_valid());
        assert!(Rloc16::from_parts(62, 1).is_valid());
    }

    #[test]
    fn serial_comparison_handles_wraparound() {
        assert!(serial_gt_u8(1, 0));
        assert!(serial_gt_u8(0, 255));
        assert!(!serial_gt_u8(255, 0));
        assert!(!serial_gt_u8(5, 5));
        assert!(serial_gt_u32(0, u32::MAX));
        assert!(!serial_gt_u32(u32::MAX, 0));
    }

    #[test]
    fn partition_comparison_priority_order() {
        let low = LeaderData {
            partition_id: 1,
            weighting: 64,
            data_version: 10,
            stable_data_version: 10,
            leader_router_id: 1,
        };
        let mut high = low;
        high.weighting = 72;

        assert_eq!(
            compare_partitions(false, &high, false, &low),
            PartitionRank::Better
        );
        // Singleton loses regardless of weighting.
        assert_eq!(
            compare_partitions(true, &high, false, &low),
            PartitionRank::Worse
        );
        assert_eq!(
            compare_partitions(false, &low, false, &low),
            PartitionRank::Same
        );

        let mut newer = low;
        newer.partition_id = 2;
        assert_eq!(
            compare_partitions(false, &newer, false, &low),
            PartitionRank::Better
        );
    }

    #[test]
    fn link_quality_buckets() {
        assert_eq!(LinkQuality::from_link_margin(0), LinkQuality::Zero);
        assert_eq!(LinkQuality::from_link_margin(3), LinkQuality::One);
        assert_eq!(LinkQuality::from_link_margin(11), LinkQuality::Two);
        assert_eq!(LinkQuality::from_link_margin(21), LinkQuality::Three);
    }

    #[test]
    fn challenge_matches_constant_time() {
        let challenge = Challenge([1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(challenge.matches(&[1, 2, 3, 4, 5, 6, 7, 8]));
        assert!(!challenge.matches(&[1, 2, 3, 4, 5, 6, 7, 9]));
        assert!(!challenge.matches(&[1, 2, 3]));
    }

    #[test]
    fn timer_fires_once() {
        let mut timer = Timer::default();
        timer.start(100, 50);
        assert!(!timer.take_fired(149));
        assert!(timer.take_fired(150));
        assert!(!timer.take_fired(200));
    }
}
