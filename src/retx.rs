// Retransmission tracking: keep-alive child updates and data-request retries.
// Numan Thabit 2025

use rand::Rng;
use tracing::{debug, warn};

use crate::types::{earliest, Millis, Timer};

/// Base delay between retransmissions of an unanswered request.
pub const RETX_DELAY: Millis = 1_500;

/// Maximum random jitter added per retransmission.
pub const RETX_JITTER: Millis = 100;

/// Retransmission limits before the link is declared dead.
pub const MAX_CHILD_UPDATE_ATTEMPTS: u8 = 4;
pub const MAX_DATA_REQUEST_ATTEMPTS: u8 = 4;

/// State of one retry machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    Idle,
    /// A request is in flight; the timer bounds the wait for its response.
    WaitingForResponse,
    /// Armed for the next periodic keep-alive transmission.
    SendingKeepAlive,
}

/// One self-contained retry machine.
#[derive(Debug, Clone, Copy)]
pub struct RetryInfo {
    pub state: RetryState,
    pub attempts: u8,
    timer: Timer,
}

impl RetryInfo {
    fn new() -> Self {
        Self {
            state: RetryState::Idle,
            attempts: 0,
            timer: Timer::default(),
        }
    }

    fn reset(&mut self) {
        self.state = RetryState::Idle;
        self.attempts = 0;
        self.timer.stop();
    }

    pub fn fire_time(&self) -> Option<Millis> {
        self.timer.fire_time()
    }
}

/// Action the engine must take after a timer firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetxAction {
    SendChildUpdate,
    SendDataRequest,
    /// Retransmission budget exhausted; the parent link is gone.
    Detach,
}

/// Two independent retry machines (child-update and data-request) driven by
/// one shared timer.
#[derive(Debug)]
pub struct RetxTracker {
    pub child_update: RetryInfo,
    pub data_request: RetryInfo,
}

impl Default for RetxTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RetxTracker {
    pub fn new() -> Self {
        Self {
            child_update: RetryInfo::new(),
            data_request: RetryInfo::new(),
        }
    }

    pub fn stop(&mut self) {
        self.child_update.reset();
        self.data_request.reset();
    }

    pub fn next_fire_time(&self) -> Option<Millis> {
        earliest(self.child_update.fire_time(), self.data_request.fire_time())
    }

    /// Arms the keep-alive machine so that, including the full retry budget
    /// with jitter, the exchange completes before `supervision_timeout`.
    pub fn start_keep_alive(&mut self, now: Millis, supervision_timeout: Millis) {
        let budget = (RETX_DELAY + RETX_JITTER) * MAX_CHILD_UPDATE_ATTEMPTS as Millis;
        let delay = supervision_timeout.saturating_sub(budget);
        self.child_update.state = RetryState::SendingKeepAlive;
        self.child_update.attempts = 0;
        self.child_update.timer.start(now, delay);
    }

    /// Records a Child Update transmission. `extra_delay` accounts for one
    /// duty-cycled listening window when that mode is active.
    pub fn on_child_update_tx(&mut self, now: Millis, extra_delay: Millis) {
        self.child_update.state = RetryState::WaitingForResponse;
        self.child_update.attempts = self.child_update.attempts.saturating_add(1);
        let jitter = rand::thread_rng().gen_range(0..=RETX_JITTER);
        self.child_update
            .timer
            .start(now, RETX_DELAY + extra_delay + jitter);
    }

    /// A matching Child Update Response arrived.
    pub fn on_child_update_response(&mut self) {
        self.child_update.reset();
    }

    pub fn on_data_request_tx(&mut self, now: Millis) {
        self.data_request.state = RetryState::WaitingForResponse;
        self.data_request.attempts = self.data_request.attempts.saturating_add(1);
        let jitter = rand::thread_rng().gen_range(0..=RETX_JITTER);
        self.data_request.timer.start(now, RETX_DELAY + jitter);
    }

    pub fn on_data_response(&mut self) {
        self.data_request.reset();
    }

    pub fn child_update_in_flight(&self) -> bool {
        self.child_update.state == RetryState::WaitingForResponse
    }

    /// Drives both machines. Returns the actions the engine must perform.
    pub fn handle_timer(&mut self, now: Millis) -> Vec<RetxAction> {
        let mut actions = Vec::new();

        if self.child_update.timer.take_fired(now) {
            match self.child_update.state {
                RetryState::Idle => {}
                RetryState::SendingKeepAlive => {
                    actions.push(RetxAction::SendChildUpdate);
                }
                RetryState::WaitingForResponse => {
                    if self.child_update.attempts >= MAX_CHILD_UPDATE_ATTEMPTS {
                        warn!(
                            attempts = self.child_update.attempts,
                            "child update retries exhausted"
                        );
                        self.child_update.reset();
                        actions.push(RetxAction::Detach);
                    } else {
                        debug!(
                            attempts = self.child_update.attempts,
                            "retrying child update"
                        );
                        actions.push(RetxAction::SendChildUpdate);
                    }
                }
            }
        }

        if self.data_request.timer.take_fired(now) {
            match self.data_request.state {
                RetryState::Idle | RetryState::SendingKeepAlive => {}
                RetryState::WaitingForResponse => {
                    if self.child_update_in_flight() {
                        // Data is expected bundled in the child-update
                        // response; defer rather than compete with it.
                        self.data_request.timer.start(now, RETX_DELAY);
                    } else if self.data_request.attempts >= MAX_DATA_REQUEST_ATTEMPTS {
                        warn!(
                            attempts = self.data_request.attempts,
                            "data request retries exhausted"
                        );
                        self.data_request.reset();
                        actions.push(RetxAction::Detach);
                    } else {
                        actions.push(RetxAction::SendDataRequest);
                    }
                }
            }
        }

        actions
    }
}
