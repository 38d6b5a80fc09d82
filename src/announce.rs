// Channel/PAN-id recovery driven by Announce messages.
// Numan Thabit 2025

use tracing::info;

use crate::types::{Millis, Timer};

/// Settling delay before the previous channel is informed of the move.
const INFORM_PREVIOUS_DELAY: Millis = 2_000;

/// Radio identity the engine switches between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelIdentity {
    pub channel: u8,
    pub pan_id: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AnnounceState {
    Idle,
    /// Switched to the advertised channel, attach attempt in progress.
    Attaching { previous: ChannelIdentity },
    /// Attach succeeded; waiting out the settling delay.
    Settling { previous: ChannelIdentity },
}

/// Action requested of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceAction {
    None,
    /// Adopt the advertised identity and run a full attach there.
    SwitchAndAttach(ChannelIdentity),
    /// Attach on the new channel failed; restore the previous identity.
    Revert(ChannelIdentity),
    /// Send an Announce on the previous channel for devices still there.
    InformPrevious(ChannelIdentity),
}

/// Handles an Announce advertising a newer active dataset timestamp.
#[derive(Debug)]
pub struct AnnounceRecovery {
    inner: AnnounceState,
    timer: Timer,
}

impl Default for AnnounceRecovery {
    fn default() -> Self {
        Self::new()
    }
}

impl AnnounceRecovery {
    pub fn new() -> Self {
        Self {
            inner: AnnounceState::Idle,
            timer: Timer::default(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner != AnnounceState::Idle
    }

    pub fn next_fire_time(&self) -> Option<Millis> {
        self.timer.fire_time()
    }

    /// Inbound Announce. Switches only for a strictly newer timestamp and
    /// only when no recovery is already running.
    pub fn on_announce(
        &mut self,
        advertised: ChannelIdentity,
        advertised_timestamp: u64,
        local_timestamp: Option<u64>,
        current: ChannelIdentity,
    ) -> AnnounceAction {
        if self.is_active() {
            return AnnounceAction::None;
        }
        let newer = match local_timestamp {
            Some(local) => advertised_timestamp > local,
            None => true,
        };
        if !newer || advertised == current {
            return AnnounceAction::None;
        }

        info!(
            channel = advertised.channel,
            pan_id = advertised.pan_id,
            "announce with newer timestamp, switching channel"
        );
        self.inner = AnnounceState::Attaching { previous: current };
        AnnounceAction::SwitchAndAttach(advertised)
    }

    /// Result of the attach attempt on the advertised channel.
    pub fn on_attach_result(&mut self, success: bool, now: Millis) -> AnnounceAction {
        match self.inner {
            AnnounceState::Attaching { previous } => {
                if success {
                    self.inner = AnnounceState::Settling { previous };
                    self.timer.start(now, INFORM_PREVIOUS_DELAY);
                    AnnounceAction::None
                } else {
                    info!("attach on announced channel failed, reverting");
                    self.inner = AnnounceState::Idle;
                    AnnounceAction::Revert(previous)
                }
            }
            _ => AnnounceAction::None,
        }
    }

    pub fn handle_timer(&mut self, now: Millis) -> AnnounceAction {
        if !self.timer.take_fired(now) {
            return AnnounceAction::None;
        }
        match self.inner {
            AnnounceState::Settling { previous } => {
                self.inner = AnnounceState::Idle;
                AnnounceAction::InformPrevious(previous)
            }
            _ => AnnounceAction::None,
        }
    }

    pub fn reset(&mut self) {
        self.inner = AnnounceState::Idle;
        self.timer.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOME: ChannelIdentity = ChannelIdentity {
        channel: 15,
        pan_id: 0xFACE,
    };
    const AWAY: ChannelIdentity = ChannelIdentity {
        channel: 20,
        pan_id: 0xBEEF,
    };

    #[test]
    fn newer_timestamp_switches_and_success_informs_previous() {
        let mut recovery = AnnounceRecovery::new();
        assert_eq!(
            recovery.on_announce(AWAY, 200, Some(100), HOME),
            AnnounceAction::SwitchAndAttach(AWAY)
        );
        assert_eq!(recovery.on_attach_result(true, 1_000), AnnounceAction::None);

        let fire = recovery.next_fire_time().unwrap();
        assert_eq!(fire, 1_000 + INFORM_PREVIOUS_DELAY);
        assert_eq!(
            recovery.handle_timer(fire),
            AnnounceAction::InformPrevious(HOME)
        );
        assert!(!recovery.is_active());
    }

    #[test]
    fn failed_attach_reverts() {
        let mut recovery = AnnounceRecovery::new();
        assert_eq!(
            recovery.on_announce(AWAY, 200, Some(100), HOME),
            AnnounceAction::SwitchAndAttach(AWAY)
        );
        assert_eq!(
            recovery.on_attach_result(false, 0),
            AnnounceAction::Revert(HOME)
        );
        assert!(!recovery.is_active());
    }

    #[test]
    fn stale_or_equal_timestamp_ignored() {
        let mut recovery = AnnounceRecovery::new();
        assert_eq!(
            recovery.on_announce(AWAY, 100, Some(100), HOME),
            AnnounceAction::None
        );
        assert_eq!(
            recovery.on_announce(AWAY, 50, Some(100), HOME),
            AnnounceAction::None
        );
    }

    #[test]
    fn concurrent_announce_ignored_while_active() {
        let mut recovery = AnnounceRecovery::new();
        assert_eq!(
            recovery.on_announce(AWAY, 200, Some(100), HOME),
            AnnounceAction::SwitchAndAttach(AWAY)
        );
        let other = ChannelIdentity {
            channel: 25,
            pan_id: 0x1234,
        };
        assert_eq!(
            recovery.on_announce(other, 300, Some(100), AWAY),
            AnnounceAction::None
        );
    }
}
