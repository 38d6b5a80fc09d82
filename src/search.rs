// Periodic search for a better parent while attached.
// Numan Thabit 2025

use tracing::{debug, info};

use crate::config::ParentSearchConfig;
use crate::types::{Millis, Timer};

/// Decision from a search timer firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchAction {
    None,
    /// Link degraded past the threshold; run a better-parent attach cycle.
    StartSearch,
}

/// Checks parent link health on an interval and backs off after triggering.
#[derive(Debug)]
pub struct ParentSearch {
    cfg: ParentSearchConfig,
    timer: Timer,
    in_backoff: bool,
    /// A parent switch may cut the backoff short, once per backoff window.
    backoff_cancel_used: bool,
}

impl ParentSearch {
    pub fn new(cfg: ParentSearchConfig) -> Self {
        Self {
            cfg,
            timer: Timer::default(),
            in_backoff: false,
            backoff_cancel_used: false,
        }
    }

    pub fn start(&mut self, now: Millis) {
        if !self.cfg.enabled {
            return;
        }
        self.in_backoff = false;
        self.backoff_cancel_used = false;
        self.timer.start(now, self.cfg.check_interval_ms);
    }

    pub fn stop(&mut self) {
        self.timer.stop();
        self.in_backoff = false;
        self.backoff_cancel_used = false;
    }

    pub fn next_fire_time(&self) -> Option<Millis> {
        self.timer.fire_time()
    }

    pub fn rss_threshold(&self) -> i8 {
        self.cfg.rss_threshold_dbm
    }

    /// `link_degraded` is the caller's verdict on the current parent link,
    /// evaluated only when the check interval elapses.
    pub fn handle_timer(&mut self, now: Millis, link_degraded: bool) -> SearchAction {
        if !self.timer.take_fired(now) {
            return SearchAction::None;
        }

        if self.in_backoff {
            // Backoff window over, resume normal checking.
            self.in_backoff = false;
            self.backoff_cancel_used = false;
            self.timer.start(now, self.cfg.check_interval_ms);
            return SearchAction::None;
        }

        if link_degraded {
            info!("parent link degraded, searching for a better parent");
            self.in_backoff = true;
            self.timer.start(now, self.cfg.backoff_interval_ms);
            return SearchAction::StartSearch;
        }

        self.timer.start(now, self.cfg.check_interval_ms);
        SearchAction::None
    }

    /// The device attached to a genuinely different parent; an in-progress
    /// backoff may be cancelled once per window.
    pub fn on_parent_switched(&mut self, now: Millis) {
        if self.in_backoff && !self.backoff_cancel_used {
            debug!("parent switched, cancelling search backoff");
            self.backoff_cancel_used = true;
            self.in_backoff = false;
            self.timer.start(now, self.cfg.check_interval_ms);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn search() -> ParentSearch {
        ParentSearch::new(ParentSearchConfig::default())
    }

    #[test]
    fn healthy_link_keeps_checking() {
        let mut s = search();
        s.start(0);
        let fire = s.next_fire_time().unwrap();
        assert_eq!(s.handle_timer(fire, false), SearchAction::None);
        assert_eq!(
            s.next_fire_time().unwrap(),
            fire + ParentSearchConfig::default().check_interval_ms
        );
    }

    #[test]
    fn degraded_link_triggers_then_backs_off() {
        let mut s = search();
        s.start(0);
        let fire = s.next_fire_time().unwrap();
        assert_eq!(s.handle_timer(fire, true), SearchAction::StartSearch);

        let backoff_fire = s.next_fire_time().unwrap();
        assert_eq!(
            backoff_fire,
            fire + ParentSearchConfig::default().backoff_interval_ms
        );
        // Still degraded at backoff expiry: no immediate re-trigger, a
        // normal check window runs first.
        assert_eq!(s.handle_timer(backoff_fire, true), SearchAction::None);
        let next = s.next_fire_time().unwrap();
        assert_eq!(s.handle_timer(next, true), SearchAction::StartSearch);
    }

    #[test]
    fn parent_switch_cancels_backoff_once() {
        let mut s = search();
        s.start(0);
        let fire = s.next_fire_time().unwrap();
        assert_eq!(s.handle_timer(fire, true), SearchAction::StartSearch);

        s.on_parent_switched(fire + 10);
        let next = s.next_fire_time().unwrap();
        assert_eq!(
            next,
            fire + 10 + ParentSearchConfig::default().check_interval_ms
        );

        // Trigger again; a second switch inside the same window is ignored.
        assert_eq!(s.handle_timer(next, true), SearchAction::StartSearch);
        let backoff_fire = s.next_fire_time().unwrap();
        s.on_parent_switched(next + 10);
        assert_eq!(s.next_fire_time().unwrap(), backoff_fire);
    }

    #[test]
    fn disabled_search_never_arms() {
        let mut s = ParentSearch::new(ParentSearchConfig {
            enabled: false,
            ..ParentSearchConfig::default()
        });
        s.start(0);
        assert_eq!(s.next_fire_time(), None);
    }
}
