#![cfg(feature = "mesh-api")]

//! Tokio-based runtime scaffolding for driving an [`Engine`] actor.
//!
//! `spawn_node` launches a task that owns the engine and a UDP socket,
//! feeds inbound datagrams and timer deadlines into the engine, drains its
//! outbox onto the socket, and surfaces role changes through an
//! asynchronous channel.
// Numan Thabit 2025

use std::{
    net::{SocketAddr, SocketAddrV6},
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::{
    net::UdpSocket,
    sync::mpsc::{self, error::TrySendError, Receiver, Sender},
    task::JoinHandle,
    time,
};
use tracing::{debug, warn};

use crate::{
    attach::{Engine, EngineError},
    platform::{NetworkData, RadioControl, RouterOps},
    settings::SettingsStore,
    types::{AttachMode, Millis, Role},
};

/// UDP port the mesh link exchange uses.
pub const MLE_PORT: u16 = 19788;

const RX_BUFFER_LEN: usize = 1280;

/// Configuration parameters controlling how the node actor is driven.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Fallback poll interval when no engine timer is armed.
    pub tick: Duration,
    /// Capacity of the command channel between the handle and the actor.
    pub command_buffer: usize,
    /// Capacity of the event channel surfaced to the caller.
    pub event_buffer: usize,
    /// Grace period allowed for the actor to stop during [`NodeHandle::shutdown`].
    pub shutdown_grace: Duration,
}

impl NodeConfig {
    fn normalize(&mut self) {
        if self.command_buffer == 0 {
            self.command_buffer = 1;
        }
        if self.event_buffer == 0 {
            self.event_buffer = 1;
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(50),
            command_buffer: 64,
            event_buffer: 256,
            shutdown_grace: Duration::from_secs(1),
        }
    }
}

/// Events emitted by a running node task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// The engine moved to a new role.
    RoleChanged(Role),
    /// The actor stopped.
    Stopped,
}

enum NodeCommand {
    Attach(AttachMode),
    Detach,
    Shutdown,
}

/// Handle used to interact with a spawned node actor.
#[derive(Debug)]
pub struct NodeHandle {
    commands: Sender<NodeCommand>,
    join: JoinHandle<()>,
    config: Arc<NodeConfig>,
}

impl NodeHandle {
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Requests an attach attempt in the given mode.
    pub fn attach(&self, mode: AttachMode) -> Result<(), NodeHandleError> {
        self.commands
            .try_send(NodeCommand::Attach(mode))
            .map_err(map_send_err)
    }

    /// Requests a graceful detach.
    pub fn detach(&self) -> Result<(), NodeHandleError> {
        self.commands
            .try_send(NodeCommand::Detach)
            .map_err(map_send_err)
    }

    /// Signals the actor to terminate and waits for the join handle.
    pub async fn shutdown(self) -> Result<(), NodeHandleError> {
        let NodeHandle {
            commands,
            join,
            config,
        } = self;

        commands
            .send(NodeCommand::Shutdown)
            .await
            .map_err(|_| NodeHandleError::ChannelClosed)?;

        if config.shutdown_grace.is_zero() {
            join.await.map_err(NodeHandleError::Join)?;
            return Ok(());
        }
        match time::timeout(config.shutdown_grace, join).await {
            Ok(result) => result.map_err(NodeHandleError::Join),
            Err(_) => Err(NodeHandleError::ShutdownTimeout),
        }
    }
}

fn map_send_err(err: TrySendError<NodeCommand>) -> NodeHandleError {
    match err {
        TrySendError::Closed(_) => NodeHandleError::ChannelClosed,
        TrySendError::Full(_) => NodeHandleError::CommandQueueFull,
    }
}

/// Errors returned by [`NodeHandle`].
#[derive(Debug)]
pub enum NodeHandleError {
    /// The actor has already exited and the command channel is closed.
    ChannelClosed,
    /// The command queue is full.
    CommandQueueFull,
    /// Joining the underlying task failed.
    Join(tokio::task::JoinError),
    /// The actor did not stop within the configured grace window.
    ShutdownTimeout,
}

impl std::fmt::Display for NodeHandleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ChannelClosed => f.write_str("node runtime channel closed"),
            Self::CommandQueueFull => f.write_str("node runtime command channel is full"),
            Self::Join(err) => write!(f, "node runtime join error: {err}"),
            Self::ShutdownTimeout => f.write_str("node runtime shutdown timed out"),
        }
    }
}

impl std::error::Error for NodeHandleError {}

/// Spawns a Tokio task that continuously drives the provided engine.
///
/// The engine is started inside the task; outbound datagrams leave through
/// `socket` on the MLE port, and inbound datagrams are fed back in. Socket
/// metadata that requires ancillary data (hop limit, destination address)
/// is not available through [`UdpSocket`], so inbound traffic is assumed
/// link-local and unicast here.
pub fn spawn_node<S, N, R, O>(
    engine: Engine<S, N, R, O>,
    socket: UdpSocket,
    mut config: NodeConfig,
) -> (NodeHandle, Receiver<NodeEvent>)
where
    S: SettingsStore + Send + 'static,
    N: NetworkData + Send + 'static,
    R: RadioControl + Send + 'static,
    O: RouterOps + Send + 'static,
{
    config.normalize();
    let config = Arc::new(config);
    let (command_tx, command_rx) = mpsc::channel(config.command_buffer);
    let (event_tx, event_rx) = mpsc::channel(config.event_buffer);

    let join = tokio::spawn(run_node(
        engine,
        socket,
        Arc::clone(&config),
        command_rx,
        event_tx,
    ));
    let handle = NodeHandle {
        commands: command_tx,
        join,
        config,
    };
    (handle, event_rx)
}

async fn run_node<S, N, R, O>(
    mut engine: Engine<S, N, R, O>,
    socket: UdpSocket,
    config: Arc<NodeConfig>,
    mut commands: Receiver<NodeCommand>,
    events: Sender<NodeEvent>,
) where
    S: SettingsStore + Send + 'static,
    N: NetworkData + Send + 'static,
    R: RadioControl + Send + 'static,
    O: RouterOps + Send + 'static,
{
    let epoch = Instant::now();
    let now_ms = |at: Instant| -> Millis { at.duration_since(epoch).as_millis() as Millis };

    let local = crate::attach::link_local_from_ext(&engine.ext_addr());
    let mut last_role = engine.role();
    if let Err(err) = engine.start(now_ms(Instant::now())) {
        warn!(%err, "engine failed to start");
        let _ = events.send(NodeEvent::Stopped).await;
        return;
    }

    let mut buf = [0u8; RX_BUFFER_LEN];
    loop {
        let now = now_ms(Instant::now());
        let sleep_for = match engine.next_fire_time() {
            Some(at) => Duration::from_millis(at.saturating_sub(now)),
            None => config.tick,
        };

        let stop = tokio::select! {
            biased;
            maybe_cmd = commands.recv() => {
                let now = now_ms(Instant::now());
                match maybe_cmd {
                    Some(NodeCommand::Attach(mode)) => {
                        if let Err(err) = engine.attach(mode, now) {
                            debug!(%err, "attach request rejected");
                        }
                        false
                    }
                    Some(NodeCommand::Detach) => {
                        if let Err(err) = engine.detach(now) {
                            debug!(%err, "detach request rejected");
                        }
                        false
                    }
                    Some(NodeCommand::Shutdown) | None => true,
                }
            }
            received = socket.recv_from(&mut buf) => {
                let now = now_ms(Instant::now());
                match received {
                    Ok((len, SocketAddr::V6(from))) => {
                        let outcome = engine.handle_datagram(
                            *from.ip(),
                            local,
                            255,
                            -50,
                            &buf[..len],
                            now,
                        );
                        if let Err(err) = outcome {
                            debug!(src = %from.ip(), %err, "datagram dropped");
                        }
                        false
                    }
                    Ok((_, SocketAddr::V4(from))) => {
                        debug!(src = %from.ip(), "ignoring non-IPv6 datagram");
                        false
                    }
                    Err(err) => {
                        warn!(%err, "socket receive failed");
                        false
                    }
                }
            }
            _ = time::sleep(sleep_for) => {
                let now = now_ms(Instant::now());
                if let Err(err) = engine.handle_timers(now) {
                    handle_engine_error(&err);
                }
                false
            }
        };

        while let Some(datagram) = engine.poll_transmit() {
            let dest = SocketAddrV6::new(datagram.dest, MLE_PORT, 0, 0);
            if let Err(err) = socket.send_to(&datagram.payload, dest).await {
                debug!(dest = %datagram.dest, %err, "send failed");
            }
        }

        let role = engine.role();
        if role != last_role {
            last_role = role;
            if events.send(NodeEvent::RoleChanged(role)).await.is_err() {
                debug!("event channel closed, stopping node actor");
                break;
            }
        }

        if stop || role == Role::Disabled && engine.next_fire_time().is_none() {
            break;
        }
    }

    let now = now_ms(Instant::now());
    if engine.role() != Role::Disabled {
        if let Err(err) = engine.stop(now) {
            warn!(%err, "engine stop failed");
        }
    }
    let _ = events.send(NodeEvent::Stopped).await;
}

fn handle_engine_error(err: &EngineError) {
    match err {
        EngineError::Disabled | EngineError::Busy => debug!(%err, "engine timer work skipped"),
        other => warn!(%other, "engine timer work failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::platform::{EndDeviceOps, NullRadio, StaticNetworkData};
    use crate::settings::MemoryStore;
    use crate::types::{DeviceMode, ExtAddress};

    fn test_engine() -> Engine<MemoryStore, StaticNetworkData, NullRadio, EndDeviceOps> {
        Engine::new(
            Config::default(),
            [0x22; 16],
            1,
            ExtAddress::random(),
            DeviceMode::new(true, false, true),
            MemoryStore::new(),
            StaticNetworkData::default(),
            NullRadio::default(),
            EndDeviceOps,
        )
        .unwrap()
    }

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    #[tokio::test]
    async fn emits_role_change_and_shuts_down() {
        init_tracing();
        let socket = UdpSocket::bind("[::1]:0").await.unwrap();
        let engine = test_engine();
        let (handle, mut events) = spawn_node(engine, socket, NodeConfig::default());

        // Starting the engine moves it from Disabled to Detached.
        let event = time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, NodeEvent::RoleChanged(Role::Detached));

        handle.shutdown().await.unwrap();
        let mut stopped = false;
        while let Some(event) = events.recv().await {
            if event == NodeEvent::Stopped {
                stopped = true;
                break;
            }
        }
        assert!(stopped);
    }

    #[tokio::test]
    async fn rejects_commands_after_shutdown() {
        init_tracing();
        let socket = UdpSocket::bind("[::1]:0").await.unwrap();
        let engine = test_engine();
        let (handle, mut events) = spawn_node(engine, socket, NodeConfig::default());

        let _ = events.recv().await;
        let detach = handle.detach();
        assert!(detach.is_ok());
        handle.shutdown().await.unwrap();
    }
}
