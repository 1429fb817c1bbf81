//! The policy engine side of the agent.
//!
//! [`Server`] owns the control socket and serves one policy engine connection
//! at a time. A single loop consumes decoded messages, dataplane restart and
//! shutdown requests, and tunnel changes, so all state changes happen in one
//! place. The only other writer is [`EndpointHandle`], which shares the same
//! lock.

mod connection;
mod dispatch;
mod endpoints;
mod handlers;
mod interfaces;
mod reconcile;
mod state;

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::{UnixListener, UnixStream};
use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub use endpoints::EndpointHandle;
pub use state::SyncState;

use crate::baseline::Baseline;
use crate::config::NodeConfig;
use crate::dataplane::{Dataplane, SwIfIndex};
use crate::metrics::ServerMetrics;
use crate::policy::PolicyStore;
use crate::{Error, Result};
use connection::{Connection, Decoded};
use state::{AgentState, lock};

const CONTROL_BUFFER: usize = 8;
const TUNNEL_BUFFER: usize = 64;

enum Control {
    DataplaneRestarted,
    Shutdown,
}

/// Tunnel interface changes reported by the routing side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TunnelChange {
    Added(SwIfIndex),
    Removed(SwIfIndex),
}

enum Event {
    Message(Decoded),
    PeerClosed,
    DataplaneRestarted,
    Tunnel(TunnelChange),
    Shutdown,
}

enum Transition {
    Continue,
    Reconnect,
    DataplaneRestart,
    Stop,
}

/// Signals for a running [`Server`]. Requests are picked up on the next loop
/// iteration.
#[derive(Clone)]
pub struct ServerHandle {
    control: mpsc::Sender<Control>,
    tunnels: mpsc::Sender<TunnelChange>,
    endpoints: EndpointHandle,
}

impl ServerHandle {
    /// The dataplane lost its configuration. Both generations are dropped and
    /// the policy engine is forced to resync.
    pub async fn dataplane_restarted(&self) -> Result<()> {
        self.control
            .send(Control::DataplaneRestarted)
            .await
            .map_err(|_| Error::ChannelError)
    }

    pub async fn stop(&self) -> Result<()> {
        self.control
            .send(Control::Shutdown)
            .await
            .map_err(|_| Error::ChannelError)
    }

    pub async fn tunnel_added(&self, sw_if_index: SwIfIndex) -> Result<()> {
        self.tunnels
            .send(TunnelChange::Added(sw_if_index))
            .await
            .map_err(|_| Error::ChannelError)
    }

    pub async fn tunnel_removed(&self, sw_if_index: SwIfIndex) -> Result<()> {
        self.tunnels
            .send(TunnelChange::Removed(sw_if_index))
            .await
            .map_err(|_| Error::ChannelError)
    }

    pub fn endpoints(&self) -> &EndpointHandle {
        &self.endpoints
    }
}

pub struct Server {
    state: Arc<Mutex<AgentState>>,
    dp: Arc<dyn Dataplane>,
    control: mpsc::Receiver<Control>,
    tunnels: mpsc::Receiver<TunnelChange>,
    ready: watch::Sender<bool>,
    socket_path: PathBuf,
    shutdown_timeout: Duration,
}

impl Server {
    /// Maps uplinks to taps and installs the baseline policies. `ready` turns
    /// `true` once a resync has been applied and `false` again when the
    /// dataplane restarts.
    pub fn new(
        dp: Arc<dyn Dataplane>,
        config: NodeConfig,
        ready: watch::Sender<bool>,
        metrics: ServerMetrics,
    ) -> Result<(Self, ServerHandle)> {
        let uplink_taps = interfaces::map_uplinks_to_taps(
            dp.as_ref(),
            &config.uplink_tag_prefix,
            &config.tap_tag_prefix,
        )?;
        let baseline = Baseline::install(dp.as_ref(), &config)?;
        let socket_path = config.socket_path.clone();
        let shutdown_timeout = config.shutdown_timeout;
        let state = Arc::new(Mutex::new(AgentState {
            sync: SyncState::Disconnected,
            store: PolicyStore::new(),
            endpoints: Default::default(),
            baseline,
            tunnels: Default::default(),
            uplink_taps,
            config,
            metrics,
        }));

        let (control_tx, control) = mpsc::channel(CONTROL_BUFFER);
        let (tunnels_tx, tunnels) = mpsc::channel(TUNNEL_BUFFER);
        let handle = ServerHandle {
            control: control_tx,
            tunnels: tunnels_tx,
            endpoints: EndpointHandle::new(state.clone(), dp.clone()),
        };
        let server = Self {
            state,
            dp,
            control,
            tunnels,
            ready,
            socket_path,
            shutdown_timeout,
        };
        Ok((server, handle))
    }

    pub async fn serve(mut self, cancel: CancellationToken) -> Result<()> {
        let listener = bind(&self.socket_path)?;
        info!(path = %self.socket_path.display(), "waiting for policy engine");
        loop {
            let stream = select! {
                _ = cancel.cancelled() => return Ok(()),
                Some(control) = self.control.recv() => {
                    match control {
                        Control::Shutdown => return Ok(()),
                        Control::DataplaneRestarted => self.restart_dataplane()?,
                    }
                    continue;
                }
                Some(change) = self.tunnels.recv() => {
                    self.tunnel_changed(change);
                    continue;
                }
                accepted = listener.accept() => accepted?.0,
            };
            match self.run_connection(stream, &cancel).await {
                Transition::Stop => return Ok(()),
                Transition::DataplaneRestart => self.restart_dataplane()?,
                Transition::Continue | Transition::Reconnect => {}
            }
        }
    }

    async fn run_connection(&mut self, stream: UnixStream, cancel: &CancellationToken) -> Transition {
        {
            let mut state = lock(&self.state);
            state.metrics.connections.inc();
            state.sync = SyncState::Connected;
            state.store.reset_pending();
        }
        info!("policy engine connected");

        let mut conn = Connection::spawn(stream);
        let transition = loop {
            let event = select! {
                _ = cancel.cancelled() => Event::Shutdown,
                decoded = conn.next() => match decoded {
                    Some(decoded) => Event::Message(decoded),
                    None => Event::PeerClosed,
                },
                Some(control) = self.control.recv() => match control {
                    Control::DataplaneRestarted => Event::DataplaneRestarted,
                    Control::Shutdown => Event::Shutdown,
                },
                Some(change) = self.tunnels.recv() => Event::Tunnel(change),
            };
            match self.transition(event) {
                Transition::Continue => {}
                transition => break transition,
            }
        };

        conn.close(self.shutdown_timeout).await;
        lock(&self.state).sync = SyncState::Disconnected;
        info!("policy engine disconnected");
        transition
    }

    fn transition(&self, event: Event) -> Transition {
        match event {
            Event::Message(Ok(message)) => {
                let mut state = lock(&self.state);
                match state.dispatch(self.dp.as_ref(), message) {
                    Ok(()) => {
                        if state.in_sync() {
                            self.ready.send_replace(true);
                        }
                        Transition::Continue
                    }
                    Err(e) => {
                        error!("closing policy engine connection: {e}");
                        Transition::Reconnect
                    }
                }
            }
            Event::Message(Err(e)) => {
                error!("cannot read policy engine message: {e}");
                Transition::Reconnect
            }
            Event::PeerClosed => Transition::Reconnect,
            Event::DataplaneRestarted => Transition::DataplaneRestart,
            Event::Tunnel(change) => self.tunnel_changed(change),
            Event::Shutdown => Transition::Stop,
        }
    }

    fn tunnel_changed(&self, change: TunnelChange) -> Transition {
        let mut state = lock(&self.state);
        match state.handle_tunnel_change(self.dp.as_ref(), change) {
            Ok(()) => Transition::Continue,
            Err(e) => {
                error!(?change, "cannot apply tunnel change: {e}");
                Transition::Reconnect
            }
        }
    }

    /// Forgets everything the dataplane lost and installs the baseline again.
    /// The policy engine resyncs on its next connection.
    fn restart_dataplane(&self) -> Result<()> {
        warn!("dataplane restarted, dropping policy state");
        self.ready.send_replace(false);
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        state.store.clear();
        state.endpoints.clear();
        state.baseline = Baseline::install(self.dp.as_ref(), &state.config)?;
        Ok(())
    }
}

fn bind(path: &Path) -> Result<UnixListener> {
    if let Err(e) = fs::remove_file(path)
        && e.kind() != ErrorKind::NotFound
    {
        return Err(e.into());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(UnixListener::bind(path)?)
}
