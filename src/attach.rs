// Role and attach state machine: parent discovery, parent comparison,
// the child id handshake, and everything that keeps a child attached.
// Numan Thabit 2025

use std::collections::VecDeque;
use std::net::Ipv6Addr;

use bytes::Bytes;
use rand::Rng;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::announce::{AnnounceAction, AnnounceRecovery, ChannelIdentity};
use crate::config::{Config, ConfigError};
use crate::crypto::aead::KEY_LEN;
use crate::crypto::keys::KeyManager;
use crate::delayed::{DelayedKind, DelayedSender, Schedule};
use crate::detach::{DetachAction, Detacher};
use crate::metrics::{Metrics, MetricsError};
use crate::neighbor::{LinkSecurity, Neighbor, NeighborState, Parent, ParentCandidate};
use crate::platform::{NetworkData, RadioControl, RouterOps};
use crate::restore::{RestoreAction, RestoreKind, RoleRestorer};
use crate::retx::{RetxAction, RetxTracker};
use crate::search::{ParentSearch, SearchAction};
use crate::secure::{self, EpochAdoption, MessageClass, RxMeta, SecureError};
use crate::settings::{
    NetworkInfo, ParentInfo, SettingsError, SettingsStore, FRAME_COUNTER_AHEAD,
};
use crate::sync::{self, LeaderDataOutcome};
use crate::types::{
    compare_partitions, earliest, link_margin_from_rss, serial_gt_u8, AttachMode, AttachState,
    Challenge, DeviceMode, ExtAddress, LeaderData, LinkQuality, Millis, PartitionRank, Rloc16,
    Role, Timer, INVALID_RLOC16,
};
use crate::wire::{
    scan_mask, status, Command, Connectivity, MleMessage, MleWriter, TlvType, WireError,
};

/// Protocol version advertised in Version TLVs.
pub const PROTOCOL_VERSION: u16 = 4;

/// All link-local nodes.
pub const LINK_LOCAL_ALL_NODES: Ipv6Addr = Ipv6Addr::new(0xFF02, 0, 0, 0, 0, 0, 0, 1);

/// All link-local routers; Parent Requests go here.
pub const LINK_LOCAL_ALL_ROUTERS: Ipv6Addr = Ipv6Addr::new(0xFF02, 0, 0, 0, 0, 0, 0, 2);

/// Upper bound on the random delay before answering a Parent Request.
const PARENT_RESPONSE_DELAY_MAX: Millis = 500;

/// Delay before a link re-establishment exchange after a suspect epoch jump.
const REESTABLISH_DELAY: Millis = 10;

/// Link-local address derived from an extended address (U/L bit flipped).
pub fn link_local_from_ext(ext: &ExtAddress) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets[0] = 0xFE;
    octets[1] = 0x80;
    octets[8..16].copy_from_slice(ext.as_bytes());
    octets[8] ^= 0x02;
    Ipv6Addr::from(octets)
}

/// Extended address recovered from an interface identifier.
pub fn ext_from_iid(addr: &Ipv6Addr) -> ExtAddress {
    let octets = addr.octets();
    let mut ext = [0u8; 8];
    ext.copy_from_slice(&octets[8..16]);
    ext[0] ^= 0x02;
    ExtAddress(ext)
}

/// An outbound UDP datagram ready for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub dest: Ipv6Addr,
    pub payload: Bytes,
    /// Radio channel to transmit on when it differs from the current one.
    /// Only Announces leaving for the previous channel set this.
    pub tx_channel: Option<u8>,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine is disabled")]
    Disabled,

    #[error("operation already in progress")]
    Busy,

    #[error("hop limit {0}, expected 255")]
    HopLimit(u8),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Metrics(#[from] MetricsError),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error("wire: {0}")]
    Wire(#[from] WireError),

    #[error(transparent)]
    Secure(#[from] SecureError),
}

/// Flat summary of a would-be parent used by the comparator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParentRank {
    pub link_quality: LinkQuality,
    pub is_router: bool,
    pub parent_priority: i8,
    pub link_quality_3: u8,
    pub version: u16,
    pub sed_buffer_size: u16,
    pub sed_datagram_count: u8,
    pub link_quality_2: u8,
    pub link_quality_1: u8,
    /// Combined clock accuracy; smaller is better. Only consulted for
    /// duty-cycled children.
    pub clock_accuracy: u32,
    pub link_margin: u8,
}

impl ParentRank {
    fn of(candidate: &ParentCandidate) -> Self {
        Self {
            link_quality: candidate.link_quality,
            is_router: candidate.is_router,
            parent_priority: candidate.connectivity.parent_priority,
            link_quality_3: candidate.connectivity.link_quality_3,
            version: candidate.parent.neighbor.version,
            sed_buffer_size: candidate.connectivity.sed_buffer_size,
            sed_datagram_count: candidate.connectivity.sed_datagram_count,
            link_quality_2: candidate.connectivity.link_quality_2,
            link_quality_1: candidate.connectivity.link_quality_1,
            clock_accuracy: candidate.clock_accuracy_metric(),
            link_margin: candidate.parent.link_margin,
        }
    }
}

/// Strict lexicographic parent comparison. Returns whether `candidate`
/// should replace `current`. Every criterion short-circuits on inequality,
/// so the verdict is deterministic for any fixed pair of inputs.
pub fn is_better_parent(candidate: &ParentRank, current: &ParentRank, duty_cycled: bool) -> bool {
    if candidate.link_quality != current.link_quality {
        return candidate.link_quality > current.link_quality;
    }
    if candidate.is_router != current.is_router {
        return candidate.is_router;
    }
    if candidate.parent_priority != current.parent_priority {
        return candidate.parent_priority > current.parent_priority;
    }
    if candidate.link_quality_3 != current.link_quality_3 {
        return candidate.link_quality_3 > current.link_quality_3;
    }
    if candidate.version != current.version {
        return candidate.version > current.version;
    }
    if candidate.sed_buffer_size != current.sed_buffer_size {
        return candidate.sed_buffer_size > current.sed_buffer_size;
    }
    if candidate.sed_datagram_count != current.sed_datagram_count {
        return candidate.sed_datagram_count > current.sed_datagram_count;
    }
    if candidate.link_quality_2 != current.link_quality_2 {
        return candidate.link_quality_2 > current.link_quality_2;
    }
    if candidate.link_quality_1 != current.link_quality_1 {
        return candidate.link_quality_1 > current.link_quality_1;
    }
    if duty_cycled && candidate.clock_accuracy != current.clock_accuracy {
        return candidate.clock_accuracy < current.clock_accuracy;
    }
    candidate.link_margin > current.link_margin
}

/// Jitter-free backoff base: doubling per failed cycle, capped.
pub fn base_backoff_delay(attempts: u8, min: Millis, max: Millis) -> Millis {
    if attempts <= 1 {
        return min.min(max);
    }
    let shift = u32::from(attempts - 1).min(62);
    match min.checked_shl(shift) {
        Some(delay) => delay.min(max),
        None => max,
    }
}

/// The node-side participation engine.
///
/// Owns the attach state machine and every auxiliary machine that keeps a
/// device attached: retransmission tracking, delayed sends, periodic parent
/// search, role restoration after reboot, graceful detach, and announce
/// driven channel recovery. All messages leave through an internal outbox
/// drained with [`Engine::poll_transmit`]; all time comes in through `now`
/// arguments, so the engine itself never consults a clock.
pub struct Engine<S, N, R, O> {
    cfg: Config,
    keys: KeyManager,
    master_key: [u8; KEY_LEN],
    metrics: Metrics,

    settings: S,
    netdata: N,
    radio: R,
    ops: O,

    ext_addr: ExtAddress,
    device_mode: DeviceMode,

    role: Role,
    role_since: Millis,
    role_time: [Millis; 5],
    rloc16: Rloc16,
    leader_data: LeaderData,
    /// Router id sequence last heard from the partition, serial-compared
    /// when gating reattach responses.
    router_id_sequence: u8,
    parent: Option<Parent>,
    candidate: Option<ParentCandidate>,

    attach_state: AttachState,
    attach_mode: AttachMode,
    attach_timer: Timer,
    attach_attempts: u8,
    parent_requests_sent: u8,
    announce_step_done: bool,
    pending_retry: bool,
    attach_started_at: Option<Millis>,
    announce_driven: bool,

    tx_challenge: Challenge,
    cu_challenge: Option<Challenge>,

    retx: RetxTracker,
    delayed: DelayedSender,
    search: ParentSearch,
    restorer: RoleRestorer,
    detacher: Detacher,
    announce: AnnounceRecovery,

    outbox: VecDeque<Datagram>,
}

impl<S, N, R, O> Engine<S, N, R, O>
where
    S: SettingsStore,
    N: NetworkData,
    R: RadioControl,
    O: RouterOps,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: Config,
        master_key: [u8; KEY_LEN],
        key_epoch: u32,
        ext_addr: ExtAddress,
        device_mode: DeviceMode,
        settings: S,
        netdata: N,
        radio: R,
        ops: O,
    ) -> Result<Self, EngineError> {
        cfg.validate()?;
        let metrics = Metrics::new()?;
        let search = ParentSearch::new(cfg.search.clone());
        let detacher = Detacher::new(cfg.supervision.detach_wait_ms);
        Ok(Self {
            cfg,
            keys: KeyManager::new(master_key, key_epoch),
            master_key,
            metrics,
            settings,
            netdata,
            radio,
            ops,
            ext_addr,
            device_mode,
            role: Role::Disabled,
            role_since: 0,
            role_time: [0; 5],
            rloc16: INVALID_RLOC16,
            leader_data: LeaderData::default(),
            router_id_sequence: 0,
            parent: None,
            candidate: None,
            attach_state: AttachState::Idle,
            attach_mode: AttachMode::AnyPartition,
            attach_timer: Timer::default(),
            attach_attempts: 0,
            parent_requests_sent: 0,
            announce_step_done: false,
            pending_retry: false,
            attach_started_at: None,
            announce_driven: false,
            tx_challenge: Challenge::random(),
            cu_challenge: None,
            retx: RetxTracker::new(),
            delayed: DelayedSender::default(),
            search,
            restorer: RoleRestorer::default(),
            detacher,
            announce: AnnounceRecovery::new(),
            outbox: VecDeque::new(),
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn rloc16(&self) -> Rloc16 {
        self.rloc16
    }

    pub fn ext_addr(&self) -> ExtAddress {
        self.ext_addr
    }

    pub fn attach_state(&self) -> AttachState {
        self.attach_state
    }

    pub fn leader_data(&self) -> &LeaderData {
        &self.leader_data
    }

    pub fn parent(&self) -> Option<&Parent> {
        self.parent.as_ref()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Next outbound datagram, if any.
    pub fn poll_transmit(&mut self) -> Option<Datagram> {
        self.outbox.pop_front()
    }

    /// Earliest instant at which [`Engine::handle_timers`] has work to do.
    pub fn next_fire_time(&self) -> Option<Millis> {
        let mut next = self.attach_timer.fire_time();
        next = earliest(next, self.retx.next_fire_time());
        next = earliest(next, self.delayed.next_fire_time());
        next = earliest(next, self.search.next_fire_time());
        next = earliest(next, self.restorer.next_fire_time());
        next = earliest(next, self.detacher.next_fire_time());
        earliest(next, self.announce.next_fire_time())
    }

    /// Brings the engine up: restores a persisted role when the stored
    /// state allows it, otherwise starts attaching from scratch.
    pub fn start(&mut self, now: Millis) -> Result<(), EngineError> {
        if self.role != Role::Disabled {
            return Err(EngineError::Busy);
        }
        // Read before the role change: changing roles persists fresh state.
        let stored = self.settings.network_info();
        self.set_role(Role::Detached, now)?;

        if let Some(info) = stored {
            if info.is_restorable() && info.ext_addr() == self.ext_addr {
                return self.restore_from(info, now);
            }
        }
        self.begin_attach(AttachMode::AnyPartition, now)
    }

    /// Tears everything down and returns to the disabled role.
    pub fn stop(&mut self, now: Millis) -> Result<(), EngineError> {
        self.attach_timer.stop();
        self.attach_state = AttachState::Idle;
        self.attach_started_at = None;
        self.candidate = None;
        self.retx.stop();
        self.delayed.clear();
        self.search.stop();
        self.restorer.stop();
        self.detacher.reset();
        self.announce.reset();
        self.outbox.clear();
        self.set_role(Role::Disabled, now)
    }

    /// Starts an attach attempt in the given mode.
    pub fn attach(&mut self, mode: AttachMode, now: Millis) -> Result<(), EngineError> {
        if self.role == Role::Disabled {
            return Err(EngineError::Disabled);
        }
        if self.detacher.is_active() || self.attach_state != AttachState::Idle {
            return Err(EngineError::Busy);
        }
        // Backoff growth is preserved across chained attempts while
        // detached; a fresh attempt from an attached role starts over.
        if self.role != Role::Detached {
            self.attach_attempts = 0;
        }
        self.begin_attach(mode, now)
    }

    /// Gracefully detaches: notifies the parent, waits for the ack or a
    /// bounded delay, then stops.
    pub fn detach(&mut self, now: Millis) -> Result<(), EngineError> {
        if self.role == Role::Disabled {
            return Err(EngineError::Disabled);
        }
        let already_detached = !self.role.is_attached();
        match self.detacher.begin(now, already_detached) {
            DetachAction::SendNotice => self.send_child_update_request(now, Some(0)),
            _ => Ok(()),
        }
    }

    /// Runs every machine whose timer is due at `now`.
    pub fn handle_timers(&mut self, now: Millis) -> Result<(), EngineError> {
        for due in self.delayed.take_due(now) {
            self.send_delayed(due, now)?;
        }

        for action in self.retx.handle_timer(now) {
            match action {
                RetxAction::SendChildUpdate => {
                    self.metrics.child_update_retries.inc();
                    self.send_child_update_request(now, None)?;
                }
                RetxAction::SendDataRequest => {
                    self.metrics.data_request_retries.inc();
                    if let Some(dest) = self.parent_dest() {
                        self.send_data_request(dest, now)?;
                    }
                }
                RetxAction::Detach => {
                    warn!("parent stopped responding, detaching");
                    self.metrics.forced_detach.inc();
                    self.become_detached(now)?;
                }
            }
        }

        if self.attach_timer.take_fired(now) {
            self.handle_attach_timer(now)?;
        }

        let degraded = self.parent_link_degraded();
        if let SearchAction::StartSearch = self.search.handle_timer(now, degraded) {
            if self.role == Role::Child
                && self.attach_state == AttachState::Idle
                && !self.detacher.is_active()
            {
                info!("parent link degraded, searching for a better parent");
                self.attach(AttachMode::BetterParent, now)?;
            }
        }

        match self.restorer.handle_timer(now) {
            RestoreAction::SendChildUpdate => self.send_child_update_request(now, None)?,
            RestoreAction::SendLinkRequest => self.send_link_request(LINK_LOCAL_ALL_ROUTERS)?,
            RestoreAction::GiveUp => {
                info!("role restore timed out, starting a fresh attach");
                self.parent = None;
                self.become_detached(now)?;
            }
            RestoreAction::None => {}
        }

        if let DetachAction::Stop = self.detacher.handle_timer(now) {
            self.stop(now)?;
        }

        match self.announce.handle_timer(now) {
            AnnounceAction::InformPrevious(previous) => {
                // Stragglers on the old channel need to hear where the
                // network went, so the TLVs carry the new identity.
                let current = self.radio.channel_identity();
                self.send_announce(current, Some(previous.channel))?;
            }
            AnnounceAction::Revert(previous) => self.radio.set_channel_identity(previous),
            _ => {}
        }

        Ok(())
    }

    /// Processes an inbound UDP datagram.
    pub fn handle_datagram(
        &mut self,
        src: Ipv6Addr,
        dst: Ipv6Addr,
        hop_limit: u8,
        rss: i8,
        datagram: &[u8],
        now: Millis,
    ) -> Result<(), EngineError> {
        if self.role == Role::Disabled {
            return Err(EngineError::Disabled);
        }
        if hop_limit != 255 {
            self.metrics.rx_dropped.with_label_values(&["hop_limit"]).inc();
            return Err(EngineError::HopLimit(hop_limit));
        }

        let sender_ext = ext_from_iid(&src);
        let local = link_local_from_ext(&self.ext_addr);
        let rx_dst = if dst.is_multicast() { dst } else { local };

        let (plaintext, meta) =
            match secure::decrypt(&mut self.keys, &sender_ext, &src, &rx_dst, datagram) {
                Ok(out) => out,
                Err(err) => {
                    let reason = match &err {
                        SecureError::Parse(_) => "parse",
                        SecureError::Security(_) => {
                            self.metrics.aead_failures.inc();
                            "security"
                        }
                    };
                    self.metrics.rx_dropped.with_label_values(&[reason]).inc();
                    // Multicast traffic routinely includes frames keyed for
                    // someone else; keep those quiet.
                    if dst.is_multicast() {
                        debug!(%src, %err, "dropped multicast datagram");
                    } else {
                        warn!(%src, %err, "dropped datagram");
                    }
                    return Err(err.into());
                }
            };

        let current_epoch = self.keys.current_epoch();
        if let Some(link) = self.link_slot(&sender_ext) {
            if let Err(err) = secure::accept_frame(link, current_epoch, &meta) {
                self.metrics.replay_drops.inc();
                debug!(%src, %err, "rejected frame");
                return Err(SecureError::Security(err).into());
            }
        }

        let message = MleMessage::parse(&plaintext)?;
        let command = message.command;
        let sender_is_parent = self
            .parent
            .as_ref()
            .map(|p| p.neighbor.ext_addr == sender_ext && p.neighbor.is_valid())
            .unwrap_or(false);

        let class = match command {
            Command::ChildIdResponse => MessageClass::Authoritative,
            Command::Advertisement
            | Command::DataResponse
            | Command::ChildUpdateRequest
            | Command::ChildUpdateResponse
                if sender_is_parent =>
            {
                MessageClass::Peer
            }
            _ => MessageClass::Unknown,
        };

        match command {
            Command::ParentRequest => self.on_parent_request(&message, src, now)?,
            Command::ParentResponse => {
                self.on_parent_response(&message, sender_ext, rss, &meta, now)?
            }
            Command::ChildIdRequest => {}
            Command::ChildIdResponse => {
                self.on_child_id_response(&message, sender_ext, rss, now)?
            }
            Command::ChildUpdateRequest => {
                self.on_child_update_request(&message, src, sender_is_parent, now)?
            }
            Command::ChildUpdateResponse => {
                self.on_child_update_response(&message, sender_is_parent, now)?
            }
            Command::DataRequest => self.on_data_request(&message, src)?,
            Command::DataResponse => self.on_data_response(&message, sender_is_parent, now)?,
            Command::Advertisement => {
                self.on_advertisement(&message, sender_ext, dst, rss, now)?
            }
            Command::Announce => self.on_announce(&message, now)?,
            Command::LinkRequest => self.on_link_request(&message, src)?,
            Command::LinkAccept | Command::LinkAcceptAndRequest => {
                self.on_link_accept(now)?
            }
        }

        if meta.secured {
            match secure::apply_epoch_policy(
                &mut self.keys,
                class,
                sender_is_parent,
                meta.key_epoch,
                now,
            ) {
                EpochAdoption::Adopted => {
                    self.metrics.epoch_adoptions.inc();
                    // A reboot must come back on the new epoch, not the one
                    // stored at the last role change.
                    self.persist_network_info()?;
                }
                EpochAdoption::Reestablish => {
                    self.metrics.epoch_reestablish.inc();
                    if let Some(dest) = self.parent_dest() {
                        self.delayed.schedule(
                            DelayedKind::ChildUpdateRequest,
                            dest,
                            now + REESTABLISH_DELAY,
                            None,
                        );
                    }
                }
                EpochAdoption::None => {}
            }
        }

        Ok(())
    }

    fn restore_from(&mut self, info: NetworkInfo, now: Millis) -> Result<(), EngineError> {
        // The persisted counters were written with a safety margin, so
        // resuming from them can never reuse a (key, nonce) pair.
        self.keys = KeyManager::new(self.master_key, info.key_epoch);
        self.keys.set_frame_counter(info.mle_frame_counter);
        self.rloc16 = info.rloc16();
        self.leader_data.partition_id = info.previous_partition_id;

        let role = info.role().unwrap_or(Role::Child);
        if role.is_router_or_leader() && self.ops.router_eligible() {
            info!(role = %role, "restoring router role from persisted state");
            self.restorer.start(RestoreKind::RouterOrLeader, now);
            return Ok(());
        }

        match self.settings.parent_info() {
            Some(stored) => {
                info!("restoring child role from persisted state");
                let mut neighbor = Neighbor::new(ExtAddress(stored.ext_addr));
                neighbor.state = NeighborState::Restoring;
                neighbor.version = stored.version;
                self.parent = Some(Parent::new(neighbor));
                self.restorer.start(RestoreKind::Child, now);
                Ok(())
            }
            None => self.begin_attach(AttachMode::AnyPartition, now),
        }
    }

    fn begin_attach(&mut self, mode: AttachMode, now: Millis) -> Result<(), EngineError> {
        self.attach_mode = mode;
        self.attach_state = AttachState::Start;
        self.parent_requests_sent = 0;
        self.announce_step_done = false;
        self.pending_retry = self.netdata.pending_timestamp().is_some();
        self.tx_challenge = Challenge::random();
        if self.attach_started_at.is_none() {
            self.attach_started_at = Some(now);
        }
        // Attaching needs the receiver open even on sleepy devices.
        self.radio.set_rx_on_when_idle(true);
        let delay = self.attach_start_delay();
        debug!(mode = %mode, delay_ms = delay, "attach scheduled");
        self.attach_timer.start(now, delay);
        Ok(())
    }

    fn attach_start_delay(&self) -> Millis {
        let attach = &self.cfg.attach;
        let mut rng = rand::thread_rng();
        if self.attach_attempts == 0 {
            return rng.gen_range(1..=attach.start_jitter_ms.max(1));
        }
        let mut base = base_backoff_delay(
            self.attach_attempts,
            attach.backoff_min_ms,
            attach.backoff_max_ms,
        );
        if base >= attach.backoff_max_ms {
            base = base.saturating_sub(rng.gen_range(0..=attach.backoff_jitter_ms));
        }
        base + rng.gen_range(0..=attach.backoff_jitter_ms)
    }

    fn handle_attach_timer(&mut self, now: Millis) -> Result<(), EngineError> {
        if self.attach_state == AttachState::ParentRequest && self.candidate.is_some() {
            return self.send_child_id_request(now);
        }

        match self.attach_state {
            AttachState::Idle => Ok(()),
            AttachState::Start => {
                self.attach_state = AttachState::ParentRequest;
                self.parent_requests_sent = 0;
                self.metrics.attach_attempts.inc();
                self.send_next_parent_request(now)
            }
            AttachState::ParentRequest => self.send_next_parent_request(now),
            AttachState::Announce => {
                // The orphan announce produced nothing.
                self.attach_cycle_failed(now)
            }
            AttachState::ChildIdRequest => {
                debug!("child id request timed out");
                self.candidate = None;
                self.attach_cycle_failed(now)
            }
        }
    }

    fn cycle_fanout(&self) -> (u8, u8) {
        let attach = &self.cfg.attach;
        if self.attach_attempts == 0 {
            (attach.first_cycle_requests, attach.first_cycle_router_only)
        } else {
            (attach.next_cycle_requests, attach.next_cycle_router_only)
        }
    }

    fn send_next_parent_request(&mut self, now: Millis) -> Result<(), EngineError> {
        let (total, router_only) = match self.attach_mode {
            // A directed retry sends exactly one unicast request.
            AttachMode::SelectedParent => (1, 1),
            _ => self.cycle_fanout(),
        };

        if self.parent_requests_sent >= total {
            return self.end_parent_request_phase(now);
        }

        let routers_only = self.parent_requests_sent < router_only;
        self.parent_requests_sent += 1;

        let dest = match self.attach_mode {
            AttachMode::SelectedParent => self
                .candidate
                .as_ref()
                .map(|c| link_local_from_ext(&c.parent.neighbor.ext_addr))
                .or_else(|| self.parent_dest())
                .unwrap_or(LINK_LOCAL_ALL_ROUTERS),
            _ => LINK_LOCAL_ALL_ROUTERS,
        };

        let mut mask = scan_mask::ROUTERS;
        if !routers_only {
            mask |= scan_mask::REEDS;
        }

        let mut writer = MleWriter::new(Command::ParentRequest);
        writer.put_u8(TlvType::Mode, self.device_mode.0)?;
        writer.put_challenge(&self.tx_challenge)?;
        writer.put_u8(TlvType::ScanMask, mask)?;
        writer.put_u16(TlvType::Version, PROTOCOL_VERSION)?;
        let body = writer.finish();
        self.send_secured(dest, &body)?;

        debug!(
            request = self.parent_requests_sent,
            routers_only, "sent parent request"
        );
        let timeout = if routers_only {
            self.cfg.attach.parent_request_router_timeout_ms
        } else {
            self.cfg.attach.parent_request_reed_timeout_ms
        };
        self.attach_timer.start(now, timeout);
        Ok(())
    }

    fn end_parent_request_phase(&mut self, now: Millis) -> Result<(), EngineError> {
        // One orphan announce round per cycle: advertise our own dataset
        // timestamp so a network that moved channels can call us over.
        if !self.announce_step_done
            && !self.announce_driven
            && self.netdata.active_timestamp().is_some()
        {
            self.announce_step_done = true;
            self.attach_state = AttachState::Announce;
            self.send_announce(self.radio.channel_identity(), None)?;
            self.attach_timer
                .start(now, self.cfg.attach.parent_request_reed_timeout_ms);
            return Ok(());
        }
        self.attach_cycle_failed(now)
    }

    fn attach_cycle_failed(&mut self, now: Millis) -> Result<(), EngineError> {
        self.attach_state = AttachState::Idle;
        self.attach_timer.stop();

        if self.announce_driven {
            self.announce_driven = false;
            if let AnnounceAction::Revert(previous) = self.announce.on_attach_result(false, now) {
                self.radio.set_channel_identity(previous);
            }
        }

        if self.pending_retry {
            self.pending_retry = false;
            if let Some(identity) = self.netdata.promote_pending() {
                debug!(
                    channel = identity.channel,
                    "retrying attach cycle with the pending dataset"
                );
                self.radio.set_channel_identity(identity);
                return self.begin_attach(self.attach_mode, now);
            }
        }

        let improvement_only = matches!(
            self.attach_mode,
            AttachMode::BetterParent
                | AttachMode::BetterPartition
                | AttachMode::SelectedParent
                | AttachMode::DowngradeToReed
        );
        if improvement_only && self.role.is_attached() {
            debug!(mode = %self.attach_mode, "no better option found, staying put");
            self.attach_started_at = None;
            return Ok(());
        }

        if self.ops.try_become_leader() {
            info!("no partition found, becoming leader of a new one");
            self.attach_started_at = None;
            return self.set_role(Role::Leader, now);
        }

        self.become_detached(now)
    }

    /// Drops to the detached role and schedules the next attach cycle with
    /// grown backoff.
    fn become_detached(&mut self, now: Millis) -> Result<(), EngineError> {
        self.attach_attempts = self.attach_attempts.saturating_add(1);
        self.parent = None;
        self.candidate = None;
        self.rloc16 = INVALID_RLOC16;
        self.retx.stop();
        self.search.stop();
        self.restorer.stop();
        self.set_role(Role::Detached, now)?;
        self.begin_attach(AttachMode::AnyPartition, now)
    }

    fn send_child_id_request(&mut self, now: Millis) -> Result<(), EngineError> {
        let (dest, rx_challenge) = match &self.candidate {
            Some(candidate) => (
                link_local_from_ext(&candidate.parent.neighbor.ext_addr),
                candidate.rx_challenge,
            ),
            None => return Ok(()),
        };

        let timeout_secs = (self.cfg.supervision.child_timeout_ms / 1000) as u32;
        let counter = self.keys.frame_counter();

        let mut writer = MleWriter::new(Command::ChildIdRequest);
        writer.put_response(&rx_challenge)?;
        writer.put_u32(TlvType::LinkFrameCounter, counter)?;
        writer.put_u32(TlvType::MleFrameCounter, counter)?;
        writer.put_u8(TlvType::Mode, self.device_mode.0)?;
        writer.put_u32(TlvType::Timeout, timeout_secs)?;
        writer.put_u16(TlvType::Version, PROTOCOL_VERSION)?;
        writer.push(
            TlvType::TlvRequest,
            &[TlvType::Address16 as u8, TlvType::NetworkData as u8],
        )?;
        if self.device_mode.is_minimal() {
            let mut iid = *self.ext_addr.as_bytes();
            iid[0] ^= 0x02;
            writer.push(TlvType::AddressRegistration, &iid)?;
        }
        if let Some(ts) = self.netdata.active_timestamp() {
            writer.put_u64(TlvType::ActiveTimestamp, ts)?;
        }
        if let Some(ts) = self.netdata.pending_timestamp() {
            writer.put_u64(TlvType::PendingTimestamp, ts)?;
        }
        let body = writer.finish();
        self.send_secured(dest, &body)?;

        debug!(%dest, "sent child id request");
        self.attach_state = AttachState::ChildIdRequest;
        self.attach_timer.start(now, self.cfg.attach.child_id_timeout_ms);
        Ok(())
    }

    fn on_parent_response(
        &mut self,
        message: &MleMessage<'_>,
        sender_ext: ExtAddress,
        rss: i8,
        meta: &RxMeta,
        now: Millis,
    ) -> Result<(), EngineError> {
        if self.attach_state != AttachState::ParentRequest {
            return Ok(());
        }
        self.metrics.parent_responses.inc();

        let response = message.response()?;
        if !self.tx_challenge.matches(response) {
            self.metrics.parent_responses_rejected.inc();
            debug!("parent response challenge mismatch");
            return Ok(());
        }

        let source = message.source_address()?;
        let leader_data = message.leader_data()?;
        let their_challenge = message.challenge()?;
        let connectivity = message.connectivity()?;
        let version = message.u16_tlv(TlvType::Version)?;
        let advertised_margin = message.u8_tlv(TlvType::LinkMargin)?;
        let csl_accuracy = message.csl_clock_accuracy()?;
        let link_counter = match message.find(TlvType::LinkFrameCounter)? {
            Some(_) => message.u32_tlv(TlvType::LinkFrameCounter)?,
            None => 0,
        };

        if self.ops.router_eligible() && !self.partition_acceptable(&leader_data, &connectivity) {
            self.metrics.parent_responses_rejected.inc();
            debug!(
                partition = leader_data.partition_id,
                "parent response rejected by partition gate"
            );
            return Ok(());
        }

        let our_margin = link_margin_from_rss(rss, self.radio.noise_floor_dbm());
        let two_way_margin = our_margin.min(advertised_margin);
        let link_quality = LinkQuality::from_link_margin(two_way_margin);

        let mut neighbor = Neighbor::new(sender_ext);
        neighbor.rloc16 = source;
        neighbor.state = NeighborState::ParentResponse;
        neighbor.version = version;
        neighbor.link = LinkSecurity {
            key_epoch: meta.key_epoch,
            mle_frame_counter: meta.frame_counter.wrapping_add(1),
            link_frame_counter: link_counter,
        };
        neighbor.note_heard(now, rss);

        let mut parent = Parent::new(neighbor);
        parent.leader_data = leader_data;
        parent.link_margin = two_way_margin;

        let incoming = ParentCandidate {
            parent,
            rx_challenge: their_challenge,
            connectivity,
            is_router: source.is_router(),
            link_quality,
            csl_accuracy,
            leader_data,
        };

        let duty_cycled = self.radio.csl_active();
        let replaces = match &self.candidate {
            Some(existing) => {
                is_better_parent(&ParentRank::of(&incoming), &ParentRank::of(existing), duty_cycled)
            }
            None => match (self.attach_mode, self.current_parent_rank()) {
                (AttachMode::BetterParent, Some(current)) => {
                    is_better_parent(&ParentRank::of(&incoming), &current, duty_cycled)
                }
                _ => true,
            },
        };
        if replaces {
            debug!(rloc16 = %source, "parent candidate updated");
            self.candidate = Some(incoming);
        }
        Ok(())
    }

    fn partition_acceptable(&self, leader_data: &LeaderData, connectivity: &Connectivity) -> bool {
        if !self.role.is_attached() {
            return true;
        }
        let same_partition = leader_data.partition_id == self.leader_data.partition_id;
        match self.attach_mode {
            AttachMode::AnyPartition => {
                !same_partition
                    || serial_gt_u8(connectivity.id_sequence, self.router_id_sequence)
            }
            AttachMode::SamePartition | AttachMode::DowngradeToReed => {
                same_partition
                    && serial_gt_u8(connectivity.id_sequence, self.router_id_sequence)
            }
            AttachMode::BetterPartition => {
                compare_partitions(
                    connectivity.active_routers <= 1,
                    leader_data,
                    false,
                    &self.leader_data,
                ) == PartitionRank::Better
            }
            AttachMode::BetterParent | AttachMode::SelectedParent => same_partition,
        }
    }

    fn current_parent_rank(&self) -> Option<ParentRank> {
        let parent = self.parent.as_ref()?;
        Some(ParentRank {
            link_quality: LinkQuality::from_link_margin(parent.link_margin),
            is_router: parent.neighbor.rloc16.is_router(),
            parent_priority: 0,
            link_quality_3: 0,
            version: parent.neighbor.version,
            sed_buffer_size: 0,
            sed_datagram_count: 0,
            link_quality_2: 0,
            link_quality_1: 0,
            clock_accuracy: u32::MAX,
            link_margin: parent.link_margin,
        })
    }

    fn on_child_id_response(
        &mut self,
        message: &MleMessage<'_>,
        sender_ext: ExtAddress,
        rss: i8,
        now: Millis,
    ) -> Result<(), EngineError> {
        if self.attach_state != AttachState::ChildIdRequest {
            return Ok(());
        }
        let matches_candidate = self
            .candidate
            .as_ref()
            .map(|c| c.parent.neighbor.ext_addr == sender_ext)
            .unwrap_or(false);
        if !matches_candidate {
            return Ok(());
        }

        let source = message.source_address()?;
        let assigned = message.address16()?;
        let leader_data = message.leader_data()?;

        // The short address we were handed must live under the responding
        // router, otherwise someone forwarded or replayed the response.
        if !assigned.is_valid() || assigned.router_id() != source.router_id() {
            warn!(
                assigned = %assigned,
                source = %source,
                "child id response address under a different router, rejecting"
            );
            self.metrics.rx_dropped.with_label_values(&["router_id"]).inc();
            self.candidate = None;
            return self.attach_cycle_failed(now);
        }

        let mut candidate = match self.candidate.take() {
            Some(candidate) => candidate,
            None => return Ok(()),
        };
        candidate.parent.neighbor.state = NeighborState::Valid;
        candidate.parent.neighbor.rloc16 = source;
        candidate.parent.neighbor.note_heard(now, rss);
        candidate.parent.leader_data = leader_data;

        if let Some(tlv) = message.find(TlvType::NetworkData)? {
            self.netdata.apply(&leader_data, tlv.value);
        }

        let previous_parent = self
            .parent
            .as_ref()
            .map(|p| p.neighbor.ext_addr)
            .filter(|prev| *prev != candidate.parent.neighbor.ext_addr);
        if let Some(previous) = previous_parent {
            // Zero-length nudge so the old parent times our entry out
            // promptly instead of waiting for supervision.
            self.metrics.parent_changes.inc();
            self.search.on_parent_switched(now);
            self.outbox.push_back(Datagram {
                dest: link_local_from_ext(&previous),
                payload: Bytes::new(),
                tx_channel: None,
            });
        }

        self.rloc16 = assigned;
        self.leader_data = leader_data;
        self.router_id_sequence = candidate.connectivity.id_sequence;
        self.parent = Some(candidate.parent);
        self.attach_state = AttachState::Idle;
        self.attach_timer.stop();
        self.attach_attempts = 0;

        info!(rloc16 = %assigned, parent = %source, "attached as child");
        self.metrics.attach_success.inc();
        if let Some(started) = self.attach_started_at.take() {
            self.metrics
                .attach_duration_ms
                .observe(now.saturating_sub(started) as f64);
        }

        self.set_role(Role::Child, now)?;
        self.save_parent_info()?;
        self.radio
            .set_rx_on_when_idle(self.device_mode.rx_on_when_idle());
        if self.device_mode.rx_on_when_idle() {
            self.retx
                .start_keep_alive(now, self.cfg.supervision.child_timeout_ms);
        }
        self.search.start(now);

        if self.announce_driven {
            self.announce_driven = false;
            self.announce.on_attach_result(true, now);
        }
        Ok(())
    }

    fn on_child_update_request(
        &mut self,
        message: &MleMessage<'_>,
        src: Ipv6Addr,
        sender_is_parent: bool,
        now: Millis,
    ) -> Result<(), EngineError> {
        if self.role != Role::Child || !sender_is_parent {
            return Ok(());
        }
        if let Some(tlv) = message.find(TlvType::Status)? {
            if tlv.value.first() == Some(&status::ERROR) {
                info!("parent no longer knows us, detaching");
                return self.become_detached(now);
            }
        }
        if let Some(parent) = &mut self.parent {
            parent.neighbor.last_heard = now;
        }
        if message.find(TlvType::LeaderData)?.is_some() {
            let incoming = message.leader_data()?;
            self.apply_leader_data(&incoming, false, now);
        }

        let mut writer = MleWriter::new(Command::ChildUpdateResponse);
        writer.put_u16(TlvType::SourceAddress, self.rloc16.0)?;
        writer.put_u8(TlvType::Mode, self.device_mode.0)?;
        writer.put_u32(
            TlvType::Timeout,
            (self.cfg.supervision.child_timeout_ms / 1000) as u32,
        )?;
        if let Some(tlv) = message.find(TlvType::Challenge)? {
            writer.push(TlvType::Response, tlv.value)?;
        }
        let body = writer.finish();
        self.send_secured(src, &body)
    }

    fn on_child_update_response(
        &mut self,
        message: &MleMessage<'_>,
        sender_is_parent: bool,
        now: Millis,
    ) -> Result<(), EngineError> {
        let restoring = self
            .parent
            .as_ref()
            .map(|p| p.neighbor.state == NeighborState::Restoring)
            .unwrap_or(false);
        if !sender_is_parent && !restoring {
            return Ok(());
        }

        if let Some(tlv) = message.find(TlvType::Status)? {
            if tlv.value.first() == Some(&status::ERROR) {
                info!("parent rejected child update, detaching");
                return self.become_detached(now);
            }
        }
        // A response echoing a different mode is for somebody else's entry.
        if let Some(tlv) = message.find(TlvType::Mode)? {
            if tlv.value.first() != Some(&self.device_mode.0) {
                debug!("child update response mode mismatch");
                return Ok(());
            }
        }
        if let Some(expected) = self.cu_challenge {
            match message.find(TlvType::Response)? {
                Some(tlv) if expected.matches(tlv.value) => {}
                _ => {
                    debug!("child update response challenge mismatch");
                    return Ok(());
                }
            }
            self.cu_challenge = None;
        }

        self.retx.on_child_update_response();
        if self.detacher.is_active() {
            self.detacher.on_peer_ack(now);
            return Ok(());
        }

        if restoring {
            info!("restored child role");
            self.restorer.on_link_established();
            if let Some(parent) = &mut self.parent {
                parent.neighbor.state = NeighborState::Valid;
                parent.neighbor.last_heard = now;
            }
            self.set_role(Role::Child, now)?;
            self.radio
                .set_rx_on_when_idle(self.device_mode.rx_on_when_idle());
            if self.device_mode.rx_on_when_idle() {
                self.retx
                    .start_keep_alive(now, self.cfg.supervision.child_timeout_ms);
            }
            self.search.start(now);
        } else if let Some(parent) = &mut self.parent {
            parent.neighbor.last_heard = now;
            self.retx
                .start_keep_alive(now, self.cfg.supervision.child_timeout_ms);
        }
        Ok(())
    }

    fn on_data_request(
        &mut self,
        message: &MleMessage<'_>,
        src: Ipv6Addr,
    ) -> Result<(), EngineError> {
        if !self.ops.parent_response_allowed() || !self.role.is_attached() {
            return Ok(());
        }
        let stable_only = message.find(TlvType::TlvRequest)?.is_none();
        self.send_data_response(src, stable_only)
    }

    fn on_data_response(
        &mut self,
        message: &MleMessage<'_>,
        sender_is_parent: bool,
        now: Millis,
    ) -> Result<(), EngineError> {
        if !sender_is_parent {
            return Ok(());
        }
        self.retx.on_data_response();

        let leader_data = message.leader_data()?;
        if let Some(tlv) = message.find(TlvType::NetworkData)? {
            self.netdata.apply(&leader_data, tlv.value);
            self.leader_data = leader_data;
        } else {
            self.apply_leader_data(&leader_data, false, now);
        }

        let advertised = match message.find(TlvType::ActiveTimestamp)? {
            Some(_) => Some(message.u64_tlv(TlvType::ActiveTimestamp)?),
            None => None,
        };
        let payload_present = message.find(TlvType::ActiveDataset)?.is_some();
        if sync::dataset_needs_fetch(self.netdata.active_timestamp(), advertised, payload_present) {
            if let Some(dest) = self.parent_dest() {
                self.delayed.schedule(
                    DelayedKind::DataRequest,
                    dest,
                    now + sync::data_request_delay(false),
                    None,
                );
            }
        }
        Ok(())
    }

    fn on_advertisement(
        &mut self,
        message: &MleMessage<'_>,
        sender_ext: ExtAddress,
        dst: Ipv6Addr,
        rss: i8,
        now: Millis,
    ) -> Result<(), EngineError> {
        let leader_data = message.leader_data()?;
        let from_parent = self
            .parent
            .as_mut()
            .filter(|p| p.neighbor.ext_addr == sender_ext)
            .map(|p| {
                p.neighbor.note_heard(now, rss);
            })
            .is_some();
        if !from_parent {
            return Ok(());
        }
        self.apply_leader_data(&leader_data, dst.is_multicast(), now);
        Ok(())
    }

    fn apply_leader_data(&mut self, incoming: &LeaderData, multicast: bool, now: Millis) {
        match sync::evaluate_leader_data(
            self.role,
            &self.leader_data,
            self.netdata.version(),
            incoming,
        ) {
            LeaderDataOutcome::Unchanged => {}
            LeaderDataOutcome::Adopted {
                retrieve_network_data,
            } => {
                self.leader_data = *incoming;
                if retrieve_network_data {
                    if let Some(dest) = self.parent_dest() {
                        self.delayed.schedule(
                            DelayedKind::DataRequest,
                            dest,
                            now + sync::data_request_delay(multicast),
                            None,
                        );
                    }
                }
            }
            LeaderDataOutcome::PartitionConflict => {
                // Routers resolve partition conflicts by competing for the
                // better partition.
                if self.attach_state == AttachState::Idle && !self.detacher.is_active() {
                    let _ = self.attach(AttachMode::BetterPartition, now);
                }
            }
        }
    }

    fn on_parent_request(
        &mut self,
        message: &MleMessage<'_>,
        src: Ipv6Addr,
        now: Millis,
    ) -> Result<(), EngineError> {
        if !self.ops.parent_response_allowed() || !self.role.is_attached() {
            return Ok(());
        }
        let mask = message.u8_tlv(TlvType::ScanMask)?;
        let as_router = self.role.is_router_or_leader();
        if (as_router && mask & scan_mask::ROUTERS == 0)
            || (!as_router && mask & scan_mask::REEDS == 0)
        {
            return Ok(());
        }
        let challenge = message.challenge()?;
        let delay = rand::thread_rng().gen_range(1..=PARENT_RESPONSE_DELAY_MAX);
        self.delayed.schedule(
            DelayedKind::ParentResponse,
            src,
            now + delay,
            Some(challenge),
        );
        Ok(())
    }

    fn on_announce(&mut self, message: &MleMessage<'_>, now: Millis) -> Result<(), EngineError> {
        let channel = message.u8_tlv(TlvType::Channel)?;
        let pan_id = message.u16_tlv(TlvType::PanId)?;
        let timestamp = message.u64_tlv(TlvType::ActiveTimestamp)?;
        let advertised = ChannelIdentity { channel, pan_id };

        // An Announce behind our own dataset means the sender missed a
        // channel move; answer with ours so it can catch up.
        if let Some(local) = self.netdata.active_timestamp() {
            if timestamp < local {
                return self.send_announce(self.radio.channel_identity(), None);
            }
        }

        let action = self.announce.on_announce(
            advertised,
            timestamp,
            self.netdata.active_timestamp(),
            self.radio.channel_identity(),
        );
        if let AnnounceAction::SwitchAndAttach(identity) = action {
            self.metrics.announce_switches.inc();
            self.radio.set_channel_identity(identity);
            self.announce_driven = true;
            self.attach_state = AttachState::Idle;
            self.attach_timer.stop();
            self.begin_attach(AttachMode::AnyPartition, now)?;
        }
        Ok(())
    }

    fn on_link_request(
        &mut self,
        message: &MleMessage<'_>,
        src: Ipv6Addr,
    ) -> Result<(), EngineError> {
        if !self.ops.router_eligible() || !self.role.is_attached() {
            return Ok(());
        }
        let challenge = message.challenge()?;
        let mut writer = MleWriter::new(Command::LinkAccept);
        writer.put_u16(TlvType::SourceAddress, self.rloc16.0)?;
        writer.put_response(&challenge)?;
        writer.put_u16(TlvType::Version, PROTOCOL_VERSION)?;
        let body = writer.finish();
        self.send_secured(src, &body)
    }

    fn on_link_accept(&mut self, now: Millis) -> Result<(), EngineError> {
        if !self.restorer.is_active() {
            return Ok(());
        }
        info!("restored router link");
        self.restorer.on_link_established();
        let role = self
            .settings
            .network_info()
            .and_then(|info| info.role())
            .unwrap_or(Role::Router);
        self.set_role(role, now)
    }

    fn send_delayed(&mut self, due: Schedule, now: Millis) -> Result<(), EngineError> {
        let label = match due.kind {
            DelayedKind::DataRequest => "data_request",
            DelayedKind::ParentResponse => "parent_response",
            DelayedKind::ChildUpdateRequest => "child_update",
            DelayedKind::LinkRequest => "link_request",
            DelayedKind::Announce => "announce",
        };
        self.metrics.delayed_sends.with_label_values(&[label]).inc();

        match due.kind {
            DelayedKind::DataRequest => self.send_data_request(due.dest, now),
            DelayedKind::ParentResponse => match due.challenge {
                Some(challenge) => self.send_parent_response(due.dest, &challenge),
                None => Ok(()),
            },
            DelayedKind::ChildUpdateRequest => self.send_child_update_request(now, None),
            DelayedKind::LinkRequest => self.send_link_request(due.dest),
            DelayedKind::Announce => self.send_announce(self.radio.channel_identity(), None),
        }
    }

    fn send_data_request(&mut self, dest: Ipv6Addr, now: Millis) -> Result<(), EngineError> {
        let mut writer = MleWriter::new(Command::DataRequest);
        writer.push(TlvType::TlvRequest, &[TlvType::NetworkData as u8])?;
        if let Some(ts) = self.netdata.active_timestamp() {
            writer.put_u64(TlvType::ActiveTimestamp, ts)?;
        }
        if let Some(ts) = self.netdata.pending_timestamp() {
            writer.put_u64(TlvType::PendingTimestamp, ts)?;
        }
        let body = writer.finish();
        self.send_secured(dest, &body)?;
        self.retx.on_data_request_tx(now);
        Ok(())
    }

    fn send_data_response(&mut self, dest: Ipv6Addr, stable_only: bool) -> Result<(), EngineError> {
        let payload = self.netdata.payload(stable_only);
        let mut writer = MleWriter::new(Command::DataResponse);
        writer.put_u16(TlvType::SourceAddress, self.rloc16.0)?;
        writer.put_leader_data(&self.leader_data)?;
        writer.push(TlvType::NetworkData, &payload)?;
        if let Some(ts) = self.netdata.active_timestamp() {
            writer.put_u64(TlvType::ActiveTimestamp, ts)?;
        }
        let body = writer.finish();
        self.send_secured(dest, &body)
    }

    fn send_parent_response(
        &mut self,
        dest: Ipv6Addr,
        their_challenge: &Challenge,
    ) -> Result<(), EngineError> {
        let challenge = Challenge::random();
        let connectivity = Connectivity {
            active_routers: 1,
            id_sequence: self.leader_data.leader_router_id,
            ..Connectivity::default()
        };
        let mut writer = MleWriter::new(Command::ParentResponse);
        writer.put_u16(TlvType::SourceAddress, self.rloc16.0)?;
        writer.put_leader_data(&self.leader_data)?;
        writer.put_u32(TlvType::LinkFrameCounter, self.keys.frame_counter())?;
        writer.put_u8(TlvType::LinkMargin, 0)?;
        writer.put_connectivity(&connectivity)?;
        writer.put_response(their_challenge)?;
        writer.put_challenge(&challenge)?;
        writer.put_u16(TlvType::Version, PROTOCOL_VERSION)?;
        let body = writer.finish();
        self.send_secured(dest, &body)
    }

    fn send_child_update_request(
        &mut self,
        now: Millis,
        timeout_override: Option<u32>,
    ) -> Result<(), EngineError> {
        let dest = match self.parent_dest() {
            Some(dest) => dest,
            None => return Ok(()),
        };
        let challenge = Challenge::random();
        self.cu_challenge = Some(challenge);

        let timeout_secs =
            timeout_override.unwrap_or((self.cfg.supervision.child_timeout_ms / 1000) as u32);
        let mut writer = MleWriter::new(Command::ChildUpdateRequest);
        writer.put_u8(TlvType::Mode, self.device_mode.0)?;
        writer.put_challenge(&challenge)?;
        writer.put_u32(TlvType::Timeout, timeout_secs)?;
        let body = writer.finish();
        self.send_secured(dest, &body)?;
        // A duty-cycled parent only listens once per window; give the
        // response that long before retrying.
        let extra_delay = if self.radio.csl_active() {
            self.radio.csl_period()
        } else {
            0
        };
        self.retx.on_child_update_tx(now, extra_delay);
        Ok(())
    }

    fn send_link_request(&mut self, dest: Ipv6Addr) -> Result<(), EngineError> {
        let challenge = Challenge::random();
        let mut writer = MleWriter::new(Command::LinkRequest);
        writer.put_challenge(&challenge)?;
        writer.put_u16(TlvType::Version, PROTOCOL_VERSION)?;
        if self.rloc16.is_valid() {
            writer.put_u16(TlvType::SourceAddress, self.rloc16.0)?;
        }
        let body = writer.finish();
        self.send_secured(dest, &body)
    }

    fn send_announce(
        &mut self,
        advertised: ChannelIdentity,
        tx_channel: Option<u8>,
    ) -> Result<(), EngineError> {
        let timestamp = self.netdata.active_timestamp().unwrap_or(0);
        let mut writer = MleWriter::new(Command::Announce);
        writer.put_u8(TlvType::Channel, advertised.channel)?;
        writer.put_u16(TlvType::PanId, advertised.pan_id)?;
        writer.put_u64(TlvType::ActiveTimestamp, timestamp)?;
        let body = writer.finish();
        let payload = secure::encode_unsecured(&body);
        self.outbox.push_back(Datagram {
            dest: LINK_LOCAL_ALL_NODES,
            payload: payload.into(),
            tx_channel,
        });
        Ok(())
    }

    fn send_secured(&mut self, dest: Ipv6Addr, body: &[u8]) -> Result<(), EngineError> {
        let src = link_local_from_ext(&self.ext_addr);
        let payload = secure::encrypt(&mut self.keys, &self.ext_addr, &src, &dest, body)?;
        self.outbox.push_back(Datagram {
            dest,
            payload: payload.into(),
            tx_channel: None,
        });
        Ok(())
    }

    fn parent_dest(&self) -> Option<Ipv6Addr> {
        self.parent
            .as_ref()
            .map(|p| link_local_from_ext(&p.neighbor.ext_addr))
    }

    fn parent_link_degraded(&self) -> bool {
        if self.ops.has_better_neighbor() {
            return true;
        }
        match &self.parent {
            Some(parent) => match parent.neighbor.rss.average() {
                Some(avg) => avg < self.search.rss_threshold(),
                None => false,
            },
            None => false,
        }
    }

    fn link_slot(&mut self, ext: &ExtAddress) -> Option<&mut LinkSecurity> {
        if let Some(parent) = &mut self.parent {
            if parent.neighbor.ext_addr == *ext {
                return Some(&mut parent.neighbor.link);
            }
        }
        if let Some(candidate) = &mut self.candidate {
            if candidate.parent.neighbor.ext_addr == *ext {
                return Some(&mut candidate.parent.neighbor.link);
            }
        }
        None
    }

    /// Accumulated time spent in `role` so far.
    pub fn role_time(&self, role: Role, now: Millis) -> Millis {
        let mut total = self.role_time[role.as_u8() as usize];
        if role == self.role {
            total = total.saturating_add(now.saturating_sub(self.role_since));
        }
        total
    }

    fn set_role(&mut self, role: Role, now: Millis) -> Result<(), EngineError> {
        if role == self.role {
            return Ok(());
        }
        info!(from = %self.role, to = %role, "role changed");
        let slot = self.role.as_u8() as usize;
        self.role_time[slot] =
            self.role_time[slot].saturating_add(now.saturating_sub(self.role_since));
        self.role_since = now;
        self.role = role;
        self.metrics
            .role_changes
            .with_label_values(&[role_label(role)])
            .inc();
        self.metrics.role_current.set(role.as_u8() as i64);
        self.persist_network_info()
    }

    fn persist_network_info(&mut self) -> Result<(), EngineError> {
        if self.role == Role::Disabled {
            return Ok(());
        }
        let counter = self
            .keys
            .frame_counter()
            .saturating_add(FRAME_COUNTER_AHEAD);
        let info = NetworkInfo {
            role: self.role.as_u8(),
            device_mode: self.device_mode.0,
            rloc16: self.rloc16.0,
            key_epoch: self.keys.current_epoch(),
            mle_frame_counter: counter,
            link_frame_counter: counter,
            previous_partition_id: self.leader_data.partition_id,
            ext_addr: *self.ext_addr.as_bytes(),
        };
        self.settings.save_network_info(&info)?;
        Ok(())
    }

    fn save_parent_info(&mut self) -> Result<(), EngineError> {
        if let Some(parent) = &self.parent {
            let info = ParentInfo {
                ext_addr: *parent.neighbor.ext_addr.as_bytes(),
                version: parent.neighbor.version,
            };
            self.settings.save_parent_info(&info)?;
        }
        Ok(())
    }
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::Disabled => "disabled",
        Role::Detached => "detached",
        Role::Child => "child",
        Role::Router => "router",
        Role::Leader => "leader",
    }
}
