//! Connection session manager: host/client role resolution, socket
//! establishment with device-adaptive timeouts and backoff retries, stream
//! handoff to the message channel, teardown.
//!
//! Establishment runs on spawned worker tasks so the status surface never
//! blocks; teardown aborts the workers so a blocked accept/connect/read
//! unblocks promptly instead of leaking.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use log::{debug, error, info, warn};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use linkchat_core::{encode_line, AdmissionController, DeviceTimingProfile, LinkKind};

use crate::channel;
use crate::events::{GroupInfo, PeerInfo};
use crate::netselect;
use crate::ui::{Direction, UiSink};

/// Session lifecycle. Terminal state is `Idle`: the manager is fully
/// reusable after teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    RoleResolving,
    HostBinding,
    ClientConnecting,
    StreamsEstablishing,
    Active,
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Client,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("connection suppressed by admission controller")]
    AdmissionDenied,
    #[error("no active session")]
    NotConnected,
    #[error("no group-owner address to connect to")]
    NoOwnerAddress,
    #[error("connection failed after {attempts} attempts")]
    ConnectionExhausted { attempts: u32 },
    #[error("failed to bind listener: {0}")]
    Bind(#[source] std::io::Error),
    #[error("stream setup failed: {0}")]
    StreamSetup(#[source] std::io::Error),
    #[error("send failed: {0}")]
    SendFailed(#[source] std::io::Error),
}

#[derive(Default)]
struct SessionCell {
    state: Option<SessionState>,
    role: Option<Role>,
    /// Target peer; set by `request_connection` or derived from the remote
    /// address once a stream exists.
    peer_id: Option<String>,
    local_addr: Option<IpAddr>,
    establish_task: Option<JoinHandle<()>>,
    receive_task: Option<JoinHandle<()>>,
}

pub struct SessionManager {
    port: u16,
    subnet_prefix: String,
    profile: DeviceTimingProfile,
    admission: Arc<AdmissionController>,
    ui: Arc<dyn UiSink>,
    cell: Mutex<SessionCell>,
    /// Write half of the active stream; taken out by teardown.
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    state_tx: watch::Sender<SessionState>,
}

impl SessionManager {
    pub fn new(
        port: u16,
        subnet_prefix: String,
        profile: DeviceTimingProfile,
        admission: Arc<AdmissionController>,
        ui: Arc<dyn UiSink>,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        Arc::new(Self {
            port,
            subnet_prefix,
            profile,
            admission,
            ui,
            cell: Mutex::new(SessionCell::default()),
            writer: tokio::sync::Mutex::new(None),
            state_tx,
        })
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// Subscribe to state transitions (UI surface, tests).
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn role(&self) -> Option<Role> {
        self.lock_cell().role
    }

    pub(crate) fn ui(&self) -> &Arc<dyn UiSink> {
        &self.ui
    }

    /// Admission pre-check when the user picks a peer from the list. Records
    /// the peer as the current target when approved; the caller then asks
    /// the discovery layer to form the group.
    pub fn request_connection(&self, peer: &PeerInfo) -> bool {
        let allow = self.admission.should_connect(&peer.peer_id, LinkKind::AdHoc);
        if allow {
            info!("connection to {} approved", peer.peer_id);
            self.lock_cell().peer_id = Some(peer.peer_id.clone());
        } else {
            info!("connection to {} suppressed (cooldown)", peer.peer_id);
            self.ui
                .status(&format!("connection blocked: recent encounter with {}", peer.display_name));
        }
        allow
    }

    /// React to a group-formation event from the discovery layer. A new
    /// event supersedes any in-flight session.
    pub async fn on_group_formed(self: Arc<Self>, info: GroupInfo) {
        debug!(
            "group event: formed={} owner={} addr={:?}",
            info.group_formed, info.is_group_owner, info.owner_address
        );
        if !info.group_formed {
            self.teardown("group dissolved").await;
            return;
        }
        self.teardown("superseded by new group event").await;

        self.set_state(SessionState::RoleResolving);
        let (role, state) = if info.is_group_owner {
            (Role::Host, SessionState::HostBinding)
        } else {
            (Role::Client, SessionState::ClientConnecting)
        };
        info!("resolved role: {role:?}");
        self.ui.status(match role {
            Role::Host => "host",
            Role::Client => "client",
        });
        // Publish the target state and store the worker handle before the
        // worker runs; the worker publishes follow-up states and a concurrent
        // teardown must be able to abort it.
        self.set_state(state);
        {
            let mut cell = self.lock_cell();
            cell.role = Some(role);
            let handle = match role {
                Role::Host => tokio::spawn(self.clone().run_host(info)),
                Role::Client => tokio::spawn(self.clone().run_client(info)),
            };
            cell.establish_task = Some(handle);
        }
    }

    async fn run_host(self: Arc<Self>, info: GroupInfo) {
        if let Err(e) = self.clone().host_session(info).await {
            error!("host session failed: {e}");
            self.ui.status(&format!("host error: {e}"));
            self.spawn_teardown("session setup failed");
        }
    }

    async fn run_client(self: Arc<Self>, info: GroupInfo) {
        if let Err(e) = self.clone().client_session(info).await {
            let reason = match e {
                // Already surfaced as a status message; expected, not an error.
                SessionError::AdmissionDenied => "admission denied",
                ref other => {
                    error!("client session failed: {other}");
                    "session setup failed"
                }
            };
            self.spawn_teardown(reason);
        }
    }

    /// Host path: bind on the selected interface (fallback: unbound), accept
    /// exactly one inbound connection, configure it, establish streams.
    async fn host_session(self: Arc<Self>, info: GroupInfo) -> Result<(), SessionError> {
        let bind_ip = netselect::select_bind_address(&self.subnet_prefix, info.owner_address);
        self.lock_cell().local_addr = bind_ip;

        let unbound = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.port);
        let preferred = SocketAddr::new(bind_ip.unwrap_or(unbound.ip()), self.port);
        let listener = match netselect::bind_listener(preferred) {
            Ok(l) => l,
            Err(e) if bind_ip.is_some() => {
                warn!("bind to {preferred} failed ({e}), falling back to unbound listener");
                netselect::bind_listener(unbound).map_err(SessionError::Bind)?
            }
            Err(e) => return Err(SessionError::Bind(e)),
        };
        let local = listener.local_addr().map_err(SessionError::Bind)?;
        info!("host listening on {local}");
        self.ui.status(&format!("listening on {local}"));

        let (stream, remote) = listener.accept().await.map_err(SessionError::StreamSetup)?;
        netselect::configure_stream(&stream).map_err(SessionError::StreamSetup)?;
        info!("peer connected from {remote}");
        self.ui.status(&format!("peer connected: {remote}"));

        let peer_id = self
            .lock_cell()
            .peer_id
            .clone()
            .unwrap_or_else(|| remote.ip().to_string());
        self.establish_streams(stream, peer_id).await
    }

    /// Client path: admission check first (denied means no socket and no
    /// retry), then connect with device-adaptive timeout and saturating
    /// exponential backoff.
    async fn client_session(self: Arc<Self>, info: GroupInfo) -> Result<(), SessionError> {
        let owner = info.owner_address.ok_or(SessionError::NoOwnerAddress)?;
        let peer_id = self
            .lock_cell()
            .peer_id
            .clone()
            .unwrap_or_else(|| owner.to_string());

        if !self.admission.should_connect(&peer_id, LinkKind::AdHoc) {
            info!("admission denied for {peer_id}, aborting connect");
            self.ui
                .status(&format!("connection suppressed: recent encounter with {peer_id}"));
            return Err(SessionError::AdmissionDenied);
        }

        let local = netselect::select_bind_address(&self.subnet_prefix, None);
        self.lock_cell().local_addr = local;
        let target = SocketAddr::new(owner, self.port);

        let settle = self.profile.pre_connect_delay();
        if !settle.is_zero() {
            tokio::time::sleep(settle).await;
        }

        let mut attempt: u32 = 0;
        loop {
            debug!(
                "connecting to {target} (attempt {}/{}, timeout {}ms)",
                attempt + 1,
                self.profile.max_retries + 1,
                self.profile.socket_timeout_ms
            );
            match self.try_connect(target, local).await {
                Ok(stream) => {
                    info!("connected to {target}");
                    self.ui.status(&format!("connected to {target}"));
                    return self.establish_streams(stream, peer_id).await;
                }
                Err(e) => {
                    warn!("connect attempt {} to {target} failed: {e}", attempt + 1);
                    if attempt < self.profile.max_retries {
                        let delay = self.profile.retry_delay(attempt);
                        self.ui.status(&format!(
                            "connection failed, retrying in {}ms",
                            delay.as_millis()
                        ));
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    } else {
                        let attempts = attempt + 1;
                        self.ui
                            .status(&format!("connection failed after {attempts} attempts"));
                        return Err(SessionError::ConnectionExhausted { attempts });
                    }
                }
            }
        }
    }

    async fn try_connect(
        &self,
        target: SocketAddr,
        local: Option<IpAddr>,
    ) -> std::io::Result<TcpStream> {
        let socket = if target.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        if let Some(ip) = local {
            // Best effort: fall back to default routing when the bind fails.
            if let Err(e) = socket.bind(SocketAddr::new(ip, 0)) {
                warn!("could not bind client socket to {ip}: {e}");
            }
        }
        let stream = tokio::time::timeout(self.profile.socket_timeout(), socket.connect(target))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"))??;
        netselect::configure_stream(&stream)?;
        Ok(stream)
    }

    /// Common tail of both paths: split the stream, record the encounter,
    /// start the receive loop, go Active.
    async fn establish_streams(
        self: Arc<Self>,
        stream: TcpStream,
        peer_id: String,
    ) -> Result<(), SessionError> {
        self.set_state(SessionState::StreamsEstablishing);
        self.lock_cell().peer_id = Some(peer_id.clone());

        let (read_half, write_half) = stream.into_split();
        *self.writer.lock().await = Some(write_half);

        // Let the link settle before the encounter is recorded.
        let delay = self.profile.init_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.admission.record_encounter(&peer_id, LinkKind::AdHoc);

        let handle = tokio::spawn(channel::receive_loop(read_half, self.clone()));
        self.lock_cell().receive_task = Some(handle);

        self.set_state(SessionState::Active);
        info!("session active with {peer_id}");
        self.ui.status(&format!("chat ready with {peer_id}"));
        Ok(())
    }

    /// Send one message to the peer. Requires an active session; an I/O
    /// failure tears the session down.
    pub async fn send(&self, text: &str) -> Result<(), SessionError> {
        if self.state() != SessionState::Active {
            warn!("cannot send, no active session");
            self.ui.status("not connected");
            return Err(SessionError::NotConnected);
        }
        let result = {
            let mut guard = self.writer.lock().await;
            match guard.as_mut() {
                None => return Err(SessionError::NotConnected),
                Some(writer) => {
                    let frame = encode_line(text);
                    // Flush both layers so nothing sits in an intermediate buffer.
                    match writer.write_all(&frame).await {
                        Ok(()) => writer.flush().await,
                        Err(e) => Err(e),
                    }
                }
            }
        };
        match result {
            Ok(()) => {
                debug!("sent {} byte(s)", text.len() + 1);
                self.ui.message(Direction::Sent, text, SystemTime::now());
                Ok(())
            }
            Err(e) => {
                error!("send failed: {e}");
                self.teardown("send failed").await;
                Err(SessionError::SendFailed(e))
            }
        }
    }

    /// Tear the session down: abort establishment/receive workers (which
    /// unblocks a pending accept/connect/read and drops the sockets), close
    /// the write half, release the peer's admission bookkeeping, return to
    /// Idle. Safe to call repeatedly.
    pub async fn teardown(&self, reason: &str) {
        let (establish, receive, peer) = {
            let mut cell = self.lock_cell();
            if cell.state.is_none() {
                return;
            }
            cell.state = Some(SessionState::Closing);
            cell.role = None;
            cell.local_addr = None;
            (cell.establish_task.take(), cell.receive_task.take(), cell.peer_id.take())
        };
        self.state_tx.send_replace(SessionState::Closing);
        debug!("tearing down session: {reason}");

        if let Some(task) = establish {
            task.abort();
        }
        if let Some(task) = receive {
            task.abort();
        }
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!("writer shutdown: {e}");
            }
        }
        if let Some(peer) = peer {
            self.admission.release_connection(&peer);
        }

        self.lock_cell().state = None;
        self.state_tx.send_replace(SessionState::Idle);
        info!("session torn down: {reason}");
        self.ui.status(&format!("session closed: {reason}"));
    }

    /// Teardown from inside a worker task: the worker would abort itself
    /// mid-cleanup, so the teardown runs on its own task instead.
    pub(crate) fn spawn_teardown(self: Arc<Self>, reason: &str) {
        let reason = reason.to_string();
        tokio::spawn(async move {
            self.teardown(&reason).await;
        });
    }

    fn set_state(&self, state: SessionState) {
        self.lock_cell().state = Some(state);
        self.state_tx.send_replace(state);
    }

    fn lock_cell(&self) -> MutexGuard<'_, SessionCell> {
        match self.cell.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
