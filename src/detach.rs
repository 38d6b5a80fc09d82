// Graceful detach: notify the peer, bounded wait, then stop.
// Numan Thabit 2025

use tracing::{debug, info};

use crate::types::{Millis, Timer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DetachState {
    Idle,
    /// Notice sent, waiting for peer acknowledgment.
    Waiting,
    /// Stop decided; executes on the next (immediate) firing so the caller's
    /// stack unwinds before engine teardown.
    StopPending,
}

/// Action requested of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachAction {
    None,
    /// Send the zero-timeout Child Update (child) or address release (router).
    SendNotice,
    /// Tear the engine down now.
    Stop,
}

#[derive(Debug)]
pub struct Detacher {
    state: DetachState,
    timer: Timer,
    wait: Millis,
}

impl Detacher {
    pub fn new(wait: Millis) -> Self {
        Self {
            state: DetachState::Idle,
            timer: Timer::default(),
            wait,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state != DetachState::Idle
    }

    pub fn next_fire_time(&self) -> Option<Millis> {
        self.timer.fire_time()
    }

    /// Begins a graceful detach. When the device is already detached there is
    /// no peer to notify and the stop is scheduled immediately.
    pub fn begin(&mut self, now: Millis, already_detached: bool) -> DetachAction {
        if self.is_active() {
            return DetachAction::None;
        }
        if already_detached {
            debug!("already detached, scheduling immediate stop");
            self.state = DetachState::StopPending;
            self.timer.start(now, 0);
            return DetachAction::None;
        }
        info!("graceful detach started");
        self.state = DetachState::Waiting;
        self.timer.start(now, self.wait);
        DetachAction::SendNotice
    }

    /// Peer acknowledged the detach notice.
    pub fn on_peer_ack(&mut self, now: Millis) {
        if self.state == DetachState::Waiting {
            self.state = DetachState::StopPending;
            self.timer.start(now, 0);
        }
    }

    pub fn handle_timer(&mut self, now: Millis) -> DetachAction {
        if !self.timer.take_fired(now) {
            return DetachAction::None;
        }
        match self.state {
            DetachState::Idle => DetachAction::None,
            DetachState::Waiting | DetachState::StopPending => {
                if self.state == DetachState::Waiting {
                    info!("detach wait timed out, forcing stop");
                }
                self.state = DetachState::Idle;
                DetachAction::Stop
            }
        }
    }

    pub fn reset(&mut self) {
        self.state = DetachState::Idle;
        self.timer.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attached_device_notifies_then_waits() {
        let mut detacher = Detacher::new(4_000);
        assert_eq!(detacher.begin(100, false), DetachAction::SendNotice);
        assert!(detacher.is_active());
        assert_eq!(detacher.next_fire_time(), Some(4_100));

        detacher.on_peer_ack(200);
        assert_eq!(detacher.handle_timer(200), DetachAction::Stop);
        assert!(!detacher.is_active());
    }

    #[test]
    fn unanswered_notice_stops_on_timeout() {
        let mut detacher = Detacher::new(4_000);
        assert_eq!(detacher.begin(0, false), DetachAction::SendNotice);
        assert_eq!(detacher.handle_timer(3_999), DetachAction::None);
        assert_eq!(detacher.handle_timer(4_000), DetachAction::Stop);
    }

    #[test]
    fn already_detached_stops_asynchronously() {
        let mut detacher = Detacher::new(4_000);
        // No notice goes out, but the stop still runs from the timer so the
        // caller returns before teardown.
        assert_eq!(detacher.begin(50, true), DetachAction::None);
        assert_eq!(detacher.handle_timer(50), DetachAction::Stop);
    }

    #[test]
    fn second_begin_is_ignored() {
        let mut detacher = Detacher::new(4_000);
        assert_eq!(detacher.begin(0, false), DetachAction::SendNotice);
        assert_eq!(detacher.begin(1, false), DetachAction::None);
    }
}
