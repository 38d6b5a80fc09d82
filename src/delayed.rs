// Delayed-send scheduler keyed by (message kind, destination).
// Numan Thabit 2025

use std::net::Ipv6Addr;

use tracing::trace;

use crate::types::{Challenge, Millis};

/// Message kinds that can be scheduled for later transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DelayedKind {
    DataRequest,
    ParentResponse,
    ChildUpdateRequest,
    LinkRequest,
    Announce,
}

impl DelayedKind {
    /// Kinds that supersede an existing schedule for the same destination
    /// instead of treating it as a duplicate.
    fn replaces(self) -> bool {
        matches!(self, DelayedKind::ParentResponse)
    }
}

/// One pending send.
#[derive(Debug, Clone)]
pub struct Schedule {
    pub kind: DelayedKind,
    pub dest: Ipv6Addr,
    pub fire_at: Millis,
    /// Challenge to echo, for kinds that answer a request.
    pub challenge: Option<Challenge>,
}

/// Ordered collection of pending sends drained by a single timer.
#[derive(Debug, Default)]
pub struct DelayedSender {
    entries: Vec<Schedule>,
}

impl DelayedSender {
    /// Adds a schedule. A duplicate (same kind and destination) is a no-op
    /// unless the kind replaces, in which case the old entry is cancelled.
    /// Returns whether an entry was added.
    pub fn schedule(
        &mut self,
        kind: DelayedKind,
        dest: Ipv6Addr,
        fire_at: Millis,
        challenge: Option<Challenge>,
    ) -> bool {
        if self.contains(kind, dest) {
            if !kind.replaces() {
                trace!(?kind, %dest, "delayed send already scheduled");
                return false;
            }
            self.cancel(kind, dest);
        }
        self.entries.push(Schedule {
            kind,
            dest,
            fire_at,
            challenge,
        });
        true
    }

    pub fn contains(&self, kind: DelayedKind, dest: Ipv6Addr) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.kind == kind && entry.dest == dest)
    }

    pub fn cancel(&mut self, kind: DelayedKind, dest: Ipv6Addr) {
        self.entries
            .retain(|entry| !(entry.kind == kind && entry.dest == dest));
    }

    pub fn cancel_kind(&mut self, kind: DelayedKind) {
        self.entries.retain(|entry| entry.kind != kind);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Earliest pending fire time, if any.
    pub fn next_fire_time(&self) -> Option<Millis> {
        self.entries.iter().map(|entry| entry.fire_at).min()
    }

    /// Removes and returns every entry due at `now`, in fire-time order.
    /// All due entries drain in one batch before the timer re-arms.
    pub fn take_due(&mut self, now: Millis) -> Vec<Schedule> {
        let mut due: Vec<Schedule> = Vec::new();
        let mut remaining = Vec::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            if entry.fire_at <= now {
                due.push(entry);
            } else {
                remaining.push(entry);
            }
        }
        self.entries = remaining;
        due.sort_by_key(|entry| entry.fire_at);
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dest(n: u16) -> Ipv6Addr {
        Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, n)
    }

    #[test]
    fn duplicate_schedule_is_a_noop() {
        let mut sender = DelayedSender::default();
        assert!(sender.schedule(DelayedKind::DataRequest, dest(1), 100, None));
        assert!(!sender.schedule(DelayedKind::DataRequest, dest(1), 50, None));

        // Original fire time preserved; only one entry fires.
        assert_eq!(sender.next_fire_time(), Some(100));
        assert!(sender.take_due(99).is_empty());
        let due = sender.take_due(100);
        assert_eq!(due.len(), 1);
        assert!(sender.take_due(1_000).is_empty());
    }

    #[test]
    fn same_kind_different_destination_coexist() {
        let mut sender = DelayedSender::default();
        assert!(sender.schedule(DelayedKind::DataRequest, dest(1), 100, None));
        assert!(sender.schedule(DelayedKind::DataRequest, dest(2), 200, None));
        assert_eq!(sender.take_due(200).len(), 2);
    }

    #[test]
    fn parent_response_replaces_existing_schedule() {
        let mut sender = DelayedSender::default();
        let first = Challenge([1; 8]);
        let second = Challenge([2; 8]);
        assert!(sender.schedule(DelayedKind::ParentResponse, dest(1), 100, Some(first)));
        assert!(sender.schedule(DelayedKind::ParentResponse, dest(1), 300, Some(second)));

        assert!(sender.take_due(100).is_empty());
        let due = sender.take_due(300);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].challenge.unwrap().0, [2; 8]);
    }

    #[test]
    fn batch_drain_in_fire_order() {
        let mut sender = DelayedSender::default();
        sender.schedule(DelayedKind::ChildUpdateRequest, dest(1), 300, None);
        sender.schedule(DelayedKind::DataRequest, dest(2), 100, None);
        sender.schedule(DelayedKind::LinkRequest, dest(3), 200, None);
        sender.schedule(DelayedKind::Announce, dest(4), 900, None);

        let due = sender.take_due(300);
        let kinds: Vec<DelayedKind> = due.iter().map(|entry| entry.kind).collect();
        assert_eq!(
            kinds,
            vec![
                DelayedKind::DataRequest,
                DelayedKind::LinkRequest,
                DelayedKind::ChildUpdateRequest
            ]
        );
        assert_eq!(sender.next_fire_time(), Some(900));
    }
}
