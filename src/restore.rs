// Re-establishing a persisted role after restart.
// Numan Thabit 2025

use tracing::{debug, info};

use crate::types::{Millis, Timer};

/// Retries for the child path (directed Child Update to the stored parent).
const CHILD_UPDATE_ATTEMPTS: u8 = 2;
const CHILD_UPDATE_INTERVAL: Millis = 1_500;

/// Retries for the router/leader path (multicast Link Request).
const LINK_REQUEST_ATTEMPTS: u8 = 5;
const LINK_REQUEST_INTERVAL: Millis = 5_000;

/// Which kind of link re-establishment is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreKind {
    Child,
    RouterOrLeader,
}

/// Action requested of the engine by a restore timer firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreAction {
    None,
    /// Send a Child Update Request to the persisted parent.
    SendChildUpdate,
    /// Send a multicast Link Request.
    SendLinkRequest,
    /// Retries exhausted; fall back to a full attach.
    GiveUp,
}

/// Bounded retry loop that tries to resume the persisted role before a full
/// attach cycle is attempted.
#[derive(Debug, Default)]
pub struct RoleRestorer {
    kind: Option<RestoreKind>,
    attempts: u8,
    timer: Timer,
}

impl RoleRestorer {
    pub fn start(&mut self, kind: RestoreKind, now: Millis) {
        info!(?kind, "restoring previous role");
        self.kind = Some(kind);
        self.attempts = 0;
        // First transmission happens on the immediate firing.
        self.timer.start(now, 0);
    }

    pub fn stop(&mut self) {
        self.kind = None;
        self.attempts = 0;
        self.timer.stop();
    }

    pub fn is_active(&self) -> bool {
        self.kind.is_some()
    }

    pub fn next_fire_time(&self) -> Option<Millis> {
        self.timer.fire_time()
    }

    /// The link came back (a response arrived); restore is complete.
    pub fn on_link_established(&mut self) {
        self.stop();
    }

    pub fn handle_timer(&mut self, now: Millis) -> RestoreAction {
        if !self.timer.take_fired(now) {
            return RestoreAction::None;
        }
        let Some(kind) = self.kind else {
            return RestoreAction::None;
        };

        let (max, interval, action) = match kind {
            RestoreKind::Child => (
                CHILD_UPDATE_ATTEMPTS,
                CHILD_UPDATE_INTERVAL,
                RestoreAction::SendChildUpdate,
            ),
            RestoreKind::RouterOrLeader => (
                LINK_REQUEST_ATTEMPTS,
                LINK_REQUEST_INTERVAL,
                RestoreAction::SendLinkRequest,
            ),
        };

        if self.attempts >= max {
            info!(?kind, "role restore failed, falling back to full attach");
            self.stop();
            return RestoreAction::GiveUp;
        }

        self.attempts += 1;
        debug!(?kind, attempt = self.attempts, "role restore retry");
        self.timer.start(now, interval);
        action
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_restore_bounded_then_gives_up() {
        let mut restorer = RoleRestorer::default();
        restorer.start(RestoreKind::Child, 0);

        let mut sends = 0;
        loop {
            let fire = restorer.next_fire_time().unwrap();
            match restorer.handle_timer(fire) {
                RestoreAction::SendChildUpdate => sends += 1,
                RestoreAction::GiveUp => break,
                other => panic!("unexpected action {other:?}"),
            }
        }
        assert_eq!(sends, CHILD_UPDATE_ATTEMPTS);
        assert!(!restorer.is_active());
    }

    #[test]
    fn router_restore_uses_link_requests() {
        let mut restorer = RoleRestorer::default();
        restorer.start(RestoreKind::RouterOrLeader, 0);
        let fire = restorer.next_fire_time().unwrap();
        assert_eq!(restorer.handle_timer(fire), RestoreAction::SendLinkRequest);
        assert_eq!(
            restorer.next_fire_time().unwrap(),
            fire + LINK_REQUEST_INTERVAL
        );
    }

    #[test]
    fn response_stops_retrying() {
        let mut restorer = RoleRestorer::default();
        restorer.start(RestoreKind::Child, 0);
        let fire = restorer.next_fire_time().unwrap();
        assert_eq!(restorer.handle_timer(fire), RestoreAction::SendChildUpdate);

        restorer.on_link_established();
        assert!(!restorer.is_active());
        assert_eq!(restorer.next_fire_time(), None);
    }
}
