// Neighbor, parent, and parent-candidate records.
// Numan Thabit 2025

use crate::types::{
    DeviceMode, ExtAddress, LeaderData, LinkQuality, Millis, Rloc16, INVALID_RLOC16,
};
use crate::wire::{Connectivity, CslClockAccuracy};

/// Lifecycle state of a neighbor record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeighborState {
    Invalid,
    /// Restored from persisted settings, link not yet re-established.
    Restoring,
    /// We sent a Parent Request and may accept a Parent Response.
    ParentRequest,
    /// Parent Response accepted, Child ID handshake in progress.
    ParentResponse,
    Valid,
}

/// Replay-protection state for one neighbor link.
///
/// `mle_frame_counter` holds the lowest acceptable counter for the next
/// message (last seen + 1), not the last seen value itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkSecurity {
    pub key_epoch: u32,
    pub mle_frame_counter: u32,
    pub link_frame_counter: u32,
}

/// Exponentially-weighted RSS average kept in 1/8 dBm units.
#[derive(Debug, Clone, Copy, Default)]
pub struct RssAverager {
    average_eighths: Option<i16>,
}

impl RssAverager {
    pub fn add(&mut self, rss: i8) {
        let sample = (rss as i16) * 8;
        self.average_eighths = Some(match self.average_eighths {
            None => sample,
            Some(avg) => avg - (avg >> 3) + (sample >> 3),
        });
    }

    pub fn average(&self) -> Option<i8> {
        self.average_eighths.map(|avg| (avg / 8) as i8)
    }

    pub fn reset(&mut self) {
        self.average_eighths = None;
    }
}

/// A device we exchange authenticated messages with.
#[derive(Debug, Clone)]
pub struct Neighbor {
    pub ext_addr: ExtAddress,
    pub rloc16: Rloc16,
    pub state: NeighborState,
    pub link: LinkSecurity,
    pub device_mode: DeviceMode,
    pub version: u16,
    pub last_heard: Millis,
    pub rss: RssAverager,
}

impl Neighbor {
    pub fn new(ext_addr: ExtAddress) -> Self {
        Self {
            ext_addr,
            rloc16: INVALID_RLOC16,
            state: NeighborState::Invalid,
            link: LinkSecurity::default(),
            device_mode: DeviceMode(0),
            version: 0,
            last_heard: 0,
            rss: RssAverager::default(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.state == NeighborState::Valid
    }

    pub fn note_heard(&mut self, now: Millis, rss: i8) {
        self.last_heard = now;
        self.rss.add(rss);
    }
}

/// The attached parent.
#[derive(Debug, Clone)]
pub struct Parent {
    pub neighbor: Neighbor,
    pub leader_data: LeaderData,
    pub link_margin: u8,
}

impl Parent {
    pub fn new(neighbor: Neighbor) -> Self {
        Self {
            neighbor,
            leader_data: LeaderData::default(),
            link_margin: 0,
        }
    }

    pub fn two_way_link_quality(&self, advertised_margin: u8) -> LinkQuality {
        LinkQuality::from_link_margin(self.link_margin.min(advertised_margin))
    }
}

/// Transient superset of [`Parent`] held only during an attach attempt.
/// Promoted to the parent on Child ID completion, cleared otherwise.
#[derive(Debug, Clone)]
pub struct ParentCandidate {
    pub parent: Parent,
    /// Challenge issued by the candidate, echoed in our Child ID Request.
    pub rx_challenge: crate::types::Challenge,
    pub connectivity: Connectivity,
    pub is_router: bool,
    /// Two-way quality at the time the Parent Response was accepted.
    pub link_quality: LinkQuality,
    pub csl_accuracy: Option<CslClockAccuracy>,
    pub leader_data: LeaderData,
}

impl ParentCandidate {
    /// Combined clock-accuracy metric; smaller is better for a sleepy child.
    pub fn clock_accuracy_metric(&self) -> u32 {
        match self.csl_accuracy {
            Some(acc) => (acc.accuracy_ppm as u32) * 64 + acc.uncertainty as u32,
            None => u32::MAX,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rss_averager_converges() {
        let mut avg = RssAverager::default();
        assert_eq!(avg.average(), None);
        avg.add(-60);
        assert_eq!(avg.average(), Some(-60));
        for _ in 0..64 {
            avg.add(-40);
        }
        let settled = avg.average().unwrap();
        assert!(settled > -45 && settled <= -40, "settled at {settled}");
    }

    #[test]
    fn clock_accuracy_metric_orders_candidates() {
        let mut base = ParentCandidate {
            parent: Parent::new(Neighbor::new(ExtAddress([0; 8]))),
            rx_challenge: crate::types::Challenge::default(),
            connectivity: Connectivity::default(),
            is_router: true,
            link_quality: LinkQuality::Three,
            csl_accuracy: Some(CslClockAccuracy {
                accuracy_ppm: 10,
                uncertainty: 5,
            }),
            leader_data: LeaderData::default(),
        };
        let tight = base.clock_accuracy_metric();
        base.csl_accuracy = Some(CslClockAccuracy {
            accuracy_ppm: 20,
            uncertainty: 0,
        });
        assert!(base.clock_accuracy_metric() > tight);
        base.csl_accuracy = None;
        assert_eq!(base.clock_accuracy_metric(), u32::MAX);
    }
}
