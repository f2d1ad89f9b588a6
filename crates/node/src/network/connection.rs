//! Established peer connections and their task set.
//!
//! After the handshake a connection runs up to six tasks under one
//! [`LifecycleContext`]:
//!
//! ```text
//!   control reader ─┐                     ┌─ control writer ─┐
//!   traffic reader ─┼─ ready ─► barrier ──┼─ traffic writer ─┼─ ready ─► keepalive
//!   datagram loop  ─┘                     └──────────────────┘
//! ```
//!
//! The first task to fail cancels the context with its reason; a supervisor
//! then closes the QUIC connection, joins every task, unregisters the
//! connection and logs the reason once.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use protocol::config::ConnectionConfig;
use protocol::crypto::{NodeId, NodeIdentity, PeerIdentity};
use protocol::error::{ProtocolError, Result};
use protocol::framing::{FrameCodec, DEFAULT_FRAME_SIZE, MAX_FRAMES_PER_MESSAGE};
use protocol::hello::{quic_payload_size, HelloParams};
use protocol::packet::{Packet, PacketType};
use protocol::version::{ProtocolVersion, LOCAL_VERSION, SUPPORTED_VERSIONS};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::datagram::{self, DatagramHandlers};
use super::handshake::{HandshakeController, PeerInfo};
use super::keepalive::{self, KeepaliveSettings, KeepaliveTable};
use super::stream::{PacketReader, PacketWriter};
use crate::lifecycle::{CloseReason, ConnectionState, LifecycleContext};
use crate::queue::OutboundQueue;
use crate::registry::{ConnectionId, ConnectionManager};
use crate::transport::Role;

/// Application payloads buffered ahead of [`ConnectionHandle::recv`].
pub const INBOUND_CAPACITY: usize = 256;

/// Default link MTU used for the announced QUIC payload size.
pub const DEFAULT_LINK_MTU: u16 = 1500;

/// QUIC close code for an orderly local close.
const CLOSE_CODE_NORMAL: u32 = 0;
/// QUIC close code for any error close.
const CLOSE_CODE_ERROR: u32 = 1;

/// Per-connection settings shared by every connection of a node.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub local_version: ProtocolVersion,
    pub supported_versions: Vec<ProtocolVersion>,
    /// Features offered to peers.
    pub config: ConnectionConfig,
    /// Frame size on the control and traffic streams.
    pub frame_size: usize,
    pub link_mtu: u16,
    /// Whether the unreliable datagram channel is used when the peer supports it.
    pub enable_datagrams: bool,
    pub keepalive: KeepaliveSettings,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            local_version: LOCAL_VERSION,
            supported_versions: SUPPORTED_VERSIONS.to_vec(),
            config: ConnectionConfig::new(),
            frame_size: DEFAULT_FRAME_SIZE,
            link_mtu: DEFAULT_LINK_MTU,
            enable_datagrams: true,
            keepalive: KeepaliveSettings::default(),
        }
    }
}

struct Shared {
    id: ConnectionId,
    role: Role,
    quic: quinn::Connection,
    ctx: LifecycleContext,
    peer: PeerInfo,
    local_address: SocketAddr,
    traffic_out: Arc<OutboundQueue<Packet>>,
    inbound: Mutex<mpsc::Receiver<Vec<u8>>>,
    keepalive_interval: watch::Receiver<Duration>,
    datagrams: bool,
}

/// Application handle to an established connection.
///
/// Cheap to clone; every clone refers to the same connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<Shared>,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    /// Whether this side dialed.
    pub fn role(&self) -> Role {
        self.shared.role
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.ctx.state()
    }

    /// Queue `payload` for reliable delivery on the traffic stream.
    pub fn send(&self, payload: &[u8]) -> Result<()> {
        if self.shared.ctx.is_cancelled() {
            return Err(self.closed_error());
        }
        self.shared
            .traffic_out
            .push_back(Packet::datagram(payload.to_vec()))
    }

    /// Next payload received on the traffic stream.
    ///
    /// Payloads already received are still returned after the connection
    /// closes; after that this fails with `ConnectionClosed`.
    pub async fn recv(&self) -> Result<Vec<u8>> {
        let mut inbound = self.shared.inbound.lock().await;
        match inbound.recv().await {
            Some(payload) => Ok(payload),
            None => Err(self.closed_error()),
        }
    }

    /// Send `payload` as one unreliable datagram tagged `tag`.
    pub fn send_unreliable(&self, tag: u8, payload: &[u8]) -> Result<()> {
        if !self.shared.datagrams {
            return Err(ProtocolError::UnsupportedTransport(
                "datagrams are not enabled on this connection".into(),
            ));
        }
        if self.shared.ctx.is_cancelled() {
            return Err(self.closed_error());
        }
        datagram::send_datagram(&self.shared.quic, tag, payload)
    }

    /// Whether the unreliable datagram channel is in use.
    pub fn datagrams_enabled(&self) -> bool {
        self.shared.datagrams
    }

    /// Features enabled on both sides.
    pub fn negotiated_config(&self) -> &ConnectionConfig {
        &self.shared.peer.negotiated_config
    }

    pub fn peer_identity(&self) -> &PeerIdentity {
        &self.shared.peer.identity
    }

    pub fn peer_node_id(&self) -> &NodeId {
        self.shared.peer.identity.node_id()
    }

    pub fn peer_version(&self) -> ProtocolVersion {
        self.shared.peer.version
    }

    pub fn peer_supported_versions(&self) -> &[ProtocolVersion] {
        &self.shared.peer.supported_versions
    }

    pub fn peer_mtu(&self) -> u16 {
        self.shared.peer.mtu
    }

    pub fn peer_ack_per_packet(&self) -> bool {
        self.shared.peer.ack_per_packet
    }

    pub fn peer_max_packets_per_second(&self) -> u32 {
        self.shared.peer.max_packets_per_second
    }

    /// Where the peer sees this node.
    pub fn observed_address(&self) -> Option<SocketAddr> {
        self.shared.peer.observed_address
    }

    /// Current keepalive interval; shorter than the default while backing off.
    pub fn keepalive_interval(&self) -> Duration {
        *self.shared.keepalive_interval.borrow()
    }

    pub fn local_address(&self) -> SocketAddr {
        self.shared.local_address
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.shared.quic.remote_address()
    }

    /// Request an orderly close. Returns immediately.
    pub fn close(&self) {
        self.shared.ctx.cancel(CloseReason::LocalClose);
    }

    /// Whether teardown has started.
    pub fn is_closed(&self) -> bool {
        self.shared.ctx.is_cancelled()
    }

    /// Wait for teardown to finish and return why the connection ended.
    pub async fn closed(&self) -> CloseReason {
        self.shared.ctx.wait_for_state(ConnectionState::Closed).await;
        self.shared.ctx.reason().unwrap_or(CloseReason::LocalClose)
    }

    fn closed_error(&self) -> ProtocolError {
        let reason = self.shared.ctx.reason().unwrap_or(CloseReason::LocalClose);
        ProtocolError::ConnectionClosed(reason.to_string())
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.shared.id)
            .field("role", &self.shared.role)
            .field("remote", &self.shared.quic.remote_address())
            .field("state", &self.shared.ctx.state())
            .finish()
    }
}

/// Everything needed to run an accepted or dialed QUIC connection.
pub(crate) struct ConnectionEnv {
    pub identity: Arc<NodeIdentity>,
    pub settings: Arc<ConnectionSettings>,
    pub registry: Arc<ConnectionManager>,
    pub handlers: Arc<DatagramHandlers>,
    pub shutdown: CancellationToken,
    pub local_address: SocketAddr,
}

/// Run the handshake on `quic` and start the connection.
///
/// On a handshake failure the QUIC connection is closed and nothing is
/// registered.
pub(crate) async fn establish(
    quic: quinn::Connection,
    role: Role,
    env: ConnectionEnv,
) -> Result<ConnectionHandle> {
    let ctx = LifecycleContext::child_of(&env.shutdown);
    ctx.set_state(ConnectionState::Handshaking);

    let settings = &env.settings;
    let remote = quic.remote_address();
    let params = HelloParams {
        local_version: settings.local_version,
        supported_versions: settings.supported_versions.clone(),
        config: settings.config.clone(),
        observed_peer: remote,
        max_transmission_unit: quic_payload_size(settings.link_mtu, remote.is_ipv6()),
        ack_per_packet: false,
        max_packets_per_second: 0,
    };

    let mut controller = HandshakeController::new(Arc::clone(&env.identity), role, params);
    let streams = async {
        let codec = FrameCodec::new(settings.frame_size, MAX_FRAMES_PER_MESSAGE)?;
        let (control, peer) = controller.run(&quic).await?;
        let traffic = controller.open_traffic(&quic, &peer.identity).await?;
        Ok::<_, ProtocolError>((codec, control, traffic, peer))
    }
    .await;

    let (codec, control, traffic, peer) = match streams {
        Ok(streams) => streams,
        Err(err) => {
            quic.close(CLOSE_CODE_ERROR.into(), err.to_string().as_bytes());
            ctx.fail(&err);
            ctx.set_state(ConnectionState::Closed);
            return Err(err);
        }
    };

    let (control_reader, control_writer) = control.into_split(codec.clone());
    let (traffic_reader, traffic_writer) = traffic.into_split(codec);
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
    let (interval_tx, interval_rx) = watch::channel(settings.keepalive.interval);
    let datagrams = settings.enable_datagrams && quic.max_datagram_size().is_some();

    let handle = ConnectionHandle {
        shared: Arc::new(Shared {
            id: ConnectionId::new(),
            role,
            quic,
            ctx,
            peer,
            local_address: env.local_address,
            traffic_out: Arc::new(OutboundQueue::new()),
            inbound: Mutex::new(inbound_rx),
            keepalive_interval: interval_rx,
            datagrams,
        }),
    };

    let shared = &handle.shared;
    info!(
        conn_id = %shared.id,
        %role,
        local = %shared.local_address,
        remote = %remote,
        peer = %shared.peer.identity.fingerprint(),
        version = %shared.peer.version,
        config = %shared.peer.negotiated_config,
        datagrams,
        "Connection established"
    );

    env.registry.add(handle.clone());
    shared.ctx.set_state(ConnectionState::Active);

    let io = ConnectionIo {
        control_reader,
        control_writer,
        traffic_reader,
        traffic_writer,
        inbound_tx,
        interval_tx,
    };
    let (started_tx, started_rx) = oneshot::channel();
    tokio::spawn(supervise(handle.clone(), io, env, started_tx));
    // The supervisor drops the sender without signaling only if a task died
    // during startup; teardown is already under way in that case.
    let _ = started_rx.await;

    Ok(handle)
}

struct ConnectionIo {
    control_reader: PacketReader,
    control_writer: PacketWriter,
    traffic_reader: PacketReader,
    traffic_writer: PacketWriter,
    inbound_tx: mpsc::Sender<Vec<u8>>,
    interval_tx: watch::Sender<Duration>,
}

/// Spawn `task` so that its error, or a panic, cancels `ctx`.
fn spawn_task<F>(
    ctx: &LifecycleContext,
    conn_id: ConnectionId,
    name: &'static str,
    task: F,
) -> JoinHandle<()>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    let ctx = ctx.clone();
    let inner = tokio::spawn(task);
    tokio::spawn(async move {
        match inner.await {
            Ok(Ok(())) => debug!(conn_id = %conn_id, task = name, "Task finished"),
            Ok(Err(err)) => {
                debug!(conn_id = %conn_id, task = name, error = %err, "Task failed");
                ctx.fail(&err);
            }
            Err(err) => {
                warn!(conn_id = %conn_id, task = name, error = %err, "Task aborted");
                ctx.cancel(CloseReason::Transport(format!("{} task aborted: {}", name, err)));
            }
        }
    })
}

/// Start the writers once both readers are ready, then the keepalive task
/// once both writers are ready.
///
/// Returns the tasks spawned here and whether every stage started before
/// `ctx` was cancelled.
async fn start_in_stages<W, K>(
    ctx: &LifecycleContext,
    readers_ready: [oneshot::Receiver<()>; 2],
    start_writers: W,
    start_keepalive: K,
) -> (Vec<JoinHandle<()>>, bool)
where
    W: FnOnce() -> (Vec<JoinHandle<()>>, [oneshot::Receiver<()>; 2]),
    K: FnOnce() -> JoinHandle<()>,
{
    let mut tasks = Vec::new();
    if !barrier(ctx, readers_ready).await {
        return (tasks, false);
    }

    let (writers, writers_ready) = start_writers();
    tasks.extend(writers);
    if !barrier(ctx, writers_ready).await {
        return (tasks, false);
    }

    tasks.push(start_keepalive());
    (tasks, true)
}

async fn supervise(
    handle: ConnectionHandle,
    io: ConnectionIo,
    env: ConnectionEnv,
    started: oneshot::Sender<()>,
) {
    let shared = Arc::clone(&handle.shared);
    let ctx = shared.ctx.clone();
    let id = shared.id;
    let control_out = Arc::new(OutboundQueue::new());
    let table = Arc::new(KeepaliveTable::new());
    let mut tasks = Vec::with_capacity(6);

    let (control_ready, control_ready_rx) = oneshot::channel();
    tasks.push(spawn_task(
        &ctx,
        id,
        "control-reader",
        control_reader(
            io.control_reader,
            ctx.clone(),
            id,
            Arc::clone(&table),
            Arc::clone(&control_out),
            control_ready,
        ),
    ));
    let (traffic_ready, traffic_ready_rx) = oneshot::channel();
    tasks.push(spawn_task(
        &ctx,
        id,
        "traffic-reader",
        traffic_reader(io.traffic_reader, ctx.clone(), id, io.inbound_tx, traffic_ready),
    ));
    if shared.datagrams {
        tasks.push(spawn_task(
            &ctx,
            id,
            "datagram-loop",
            datagram::receive_loop(
                shared.quic.clone(),
                id,
                Arc::clone(&env.handlers),
                ctx.clone(),
            ),
        ));
    }

    let control_writer = io.control_writer;
    let traffic_writer = io.traffic_writer;
    let interval_tx = io.interval_tx;
    let (staged, all_started) = start_in_stages(
        &ctx,
        [control_ready_rx, traffic_ready_rx],
        || {
            let (control_ready, control_ready_rx) = oneshot::channel();
            let (traffic_ready, traffic_ready_rx) = oneshot::channel();
            let writers = vec![
                spawn_task(
                    &ctx,
                    id,
                    "control-writer",
                    writer(control_writer, Arc::clone(&control_out), ctx.clone(), control_ready),
                ),
                spawn_task(
                    &ctx,
                    id,
                    "traffic-writer",
                    writer(
                        traffic_writer,
                        Arc::clone(&shared.traffic_out),
                        ctx.clone(),
                        traffic_ready,
                    ),
                ),
            ];
            (writers, [control_ready_rx, traffic_ready_rx])
        },
        || {
            let keepalive = keepalive::run(
                ctx.clone(),
                env.settings.keepalive,
                Arc::clone(&table),
                Arc::clone(&control_out),
                interval_tx,
            );
            spawn_task(&ctx, id, "keepalive", async move {
                keepalive.await;
                Ok(())
            })
        },
    )
    .await;
    tasks.extend(staged);

    if all_started {
        debug!(conn_id = %id, tasks = tasks.len(), "Connection tasks started");
        let _ = started.send(());
    } else {
        drop(started);
    }

    ctx.cancelled().await;
    ctx.set_state(ConnectionState::Closing);
    let reason = ctx.reason().unwrap_or(CloseReason::LocalClose);

    control_out.close();
    shared.traffic_out.close();
    match &reason {
        CloseReason::LocalClose => shared.quic.close(CLOSE_CODE_NORMAL.into(), b"closed"),
        other => shared
            .quic
            .close(CLOSE_CODE_ERROR.into(), other.to_string().as_bytes()),
    }

    for task in tasks {
        if let Err(err) = task.await {
            warn!(conn_id = %id, error = %err, "Connection task did not finish cleanly");
        }
    }
    env.registry.remove(&id);

    if reason.is_error() {
        warn!(conn_id = %id, remote = %shared.quic.remote_address(), %reason, "Connection closed");
    } else {
        info!(conn_id = %id, remote = %shared.quic.remote_address(), %reason, "Connection closed");
    }
    ctx.set_state(ConnectionState::Closed);
}

/// Wait for every ready signal. False if the connection ended first.
async fn barrier<const N: usize>(
    ctx: &LifecycleContext,
    signals: [oneshot::Receiver<()>; N],
) -> bool {
    for signal in signals {
        tokio::select! {
            _ = ctx.cancelled() => return false,
            ready = signal => if ready.is_err() { return false },
        }
    }
    !ctx.is_cancelled()
}

async fn control_reader(
    mut reader: PacketReader,
    ctx: LifecycleContext,
    conn_id: ConnectionId,
    table: Arc<KeepaliveTable>,
    control_out: Arc<OutboundQueue<Packet>>,
    ready: oneshot::Sender<()>,
) -> Result<()> {
    let _ = ready.send(());
    loop {
        let packet = tokio::select! {
            _ = ctx.cancelled() => return Ok(()),
            packet = reader.read() => packet?,
        };
        match packet.kind {
            PacketType::Keepalive | PacketType::KeepaliveReply => {
                keepalive::handle_packet(&packet, &table, &control_out)?;
            }
            kind => warn!(
                conn_id = %conn_id,
                packet = %kind,
                len = packet.body.len(),
                "Control packet not handled, ignored"
            ),
        }
    }
}

async fn traffic_reader(
    mut reader: PacketReader,
    ctx: LifecycleContext,
    conn_id: ConnectionId,
    inbound: mpsc::Sender<Vec<u8>>,
    ready: oneshot::Sender<()>,
) -> Result<()> {
    let _ = ready.send(());
    loop {
        let packet = tokio::select! {
            _ = ctx.cancelled() => return Ok(()),
            packet = reader.read() => packet?,
        };
        match packet.kind {
            PacketType::Datagram => {
                debug!(conn_id = %conn_id, len = packet.body.len(), "Traffic datagram received");
                tokio::select! {
                    _ = ctx.cancelled() => return Ok(()),
                    sent = inbound.send(packet.body) => {
                        if sent.is_err() {
                            return Ok(());
                        }
                    }
                }
            }
            kind => warn!(
                conn_id = %conn_id,
                packet = %kind,
                len = packet.body.len(),
                "Traffic packet not handled, ignored"
            ),
        }
    }
}

async fn writer(
    mut writer: PacketWriter,
    queue: Arc<OutboundQueue<Packet>>,
    ctx: LifecycleContext,
    ready: oneshot::Sender<()>,
) -> Result<()> {
    let _ = ready.send(());
    let cancel = ctx.child_token();
    while let Some(packet) = queue.pop(&cancel).await {
        tokio::select! {
            _ = cancel.cancelled() => break,
            written = writer.write(&packet) => written?,
        }
    }
    writer.finish();
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    fn ready_pair() -> (oneshot::Sender<()>, oneshot::Receiver<()>) {
        oneshot::channel()
    }

    #[tokio::test]
    async fn test_writers_and_keepalive_wait_for_both_readers() {
        let ctx = LifecycleContext::new();
        let control_out = Arc::new(OutboundQueue::<Packet>::new());
        let traffic_out = Arc::new(OutboundQueue::<Packet>::new());
        traffic_out
            .push_back(Packet::datagram(b"queued early".to_vec()))
            .unwrap();
        let (control_ready, control_ready_rx) = ready_pair();
        let (traffic_ready, traffic_ready_rx) = ready_pair();

        let startup = {
            let ctx = ctx.clone();
            let control_out = Arc::clone(&control_out);
            let traffic_out = Arc::clone(&traffic_out);
            tokio::spawn(async move {
                start_in_stages(
                    &ctx,
                    [control_ready_rx, traffic_ready_rx],
                    || {
                        let (drain_ready, drain_ready_rx) = ready_pair();
                        let (idle_ready, idle_ready_rx) = ready_pair();
                        let cancel = ctx.child_token();
                        let drain = tokio::spawn(async move {
                            let _ = drain_ready.send(());
                            while traffic_out.pop(&cancel).await.is_some() {}
                        });
                        let idle = tokio::spawn(async move {
                            let _ = idle_ready.send(());
                        });
                        (vec![drain, idle], [drain_ready_rx, idle_ready_rx])
                    },
                    || {
                        let settings = KeepaliveSettings {
                            interval: Duration::from_millis(20),
                            min_interval: Duration::from_millis(1),
                            max_missed: 100,
                        };
                        tokio::spawn(keepalive::run(
                            ctx.clone(),
                            settings,
                            Arc::new(KeepaliveTable::new()),
                            control_out,
                            watch::channel(settings.interval).0,
                        ))
                    },
                )
                .await
            })
        };

        // Several keepalive intervals pass with no reader ready.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(traffic_out.len(), 1);
        assert!(control_out.is_empty());
        assert!(!startup.is_finished());

        control_ready.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(traffic_out.len(), 1);
        assert!(control_out.is_empty());

        traffic_ready.send(()).unwrap();
        let (tasks, started) = startup.await.unwrap();
        assert!(started);
        assert_eq!(tasks.len(), 3);

        let challenge = tokio::time::timeout(
            Duration::from_secs(2),
            control_out.pop(&CancellationToken::new()),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(challenge.kind, PacketType::Keepalive);
        assert!(traffic_out.is_empty());

        ctx.cancel(CloseReason::LocalClose);
        for task in tasks {
            task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_keepalive_waits_for_both_writers() {
        let ctx = LifecycleContext::new();
        let keepalive_started = Arc::new(AtomicBool::new(false));
        let (control_ready, control_ready_rx) = ready_pair();
        let (traffic_ready, traffic_ready_rx) = ready_pair();
        control_ready.send(()).unwrap();
        traffic_ready.send(()).unwrap();
        let (writer_a, writer_a_rx) = ready_pair();
        let (writer_b, writer_b_rx) = ready_pair();

        let startup = {
            let ctx = ctx.clone();
            let keepalive_started = Arc::clone(&keepalive_started);
            tokio::spawn(async move {
                start_in_stages(
                    &ctx,
                    [control_ready_rx, traffic_ready_rx],
                    || (Vec::new(), [writer_a_rx, writer_b_rx]),
                    || {
                        keepalive_started.store(true, Ordering::SeqCst);
                        tokio::spawn(async {})
                    },
                )
                .await
            })
        };

        writer_a.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!keepalive_started.load(Ordering::SeqCst));

        writer_b.send(()).unwrap();
        let (tasks, started) = startup.await.unwrap();
        assert!(started);
        assert_eq!(tasks.len(), 1);
        assert!(keepalive_started.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancel_during_startup_exits_cleanly() {
        let ctx = LifecycleContext::new();
        let writers_started = AtomicBool::new(false);
        let (_control_ready, control_ready_rx) = ready_pair();
        let (_traffic_ready, traffic_ready_rx) = ready_pair();

        let canceller = {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                ctx.cancel(CloseReason::LocalClose);
            })
        };

        let (tasks, started) = tokio::time::timeout(
            Duration::from_secs(2),
            start_in_stages(
                &ctx,
                [control_ready_rx, traffic_ready_rx],
                || {
                    writers_started.store(true, Ordering::SeqCst);
                    (Vec::new(), [ready_pair().1, ready_pair().1])
                },
                || tokio::spawn(async {}),
            ),
        )
        .await
        .unwrap();
        canceller.await.unwrap();

        assert!(!started);
        assert!(tasks.is_empty());
        assert!(!writers_started.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_dropped_ready_signal_stops_startup() {
        let ctx = LifecycleContext::new();
        let (control_ready, control_ready_rx) = ready_pair();
        let (traffic_ready, traffic_ready_rx) = ready_pair();
        control_ready.send(()).unwrap();
        // A reader that dies before signaling drops its sender.
        drop(traffic_ready);

        let (tasks, started) = start_in_stages(
            &ctx,
            [control_ready_rx, traffic_ready_rx],
            || (Vec::new(), [ready_pair().1, ready_pair().1]),
            || tokio::spawn(async {}),
        )
        .await;
        assert!(!started);
        assert!(tasks.is_empty());
    }

    #[tokio::test]
    async fn test_failed_task_cancels_with_its_reason() {
        let ctx = LifecycleContext::new();
        let task = spawn_task(&ctx, ConnectionId::new(), "traffic-reader", async {
            Err::<(), _>(ProtocolError::ChecksumMismatch {
                frame_no: 0,
                expected: 1,
                actual: 2,
            })
        });

        task.await.unwrap();
        assert!(matches!(
            ctx.reason(),
            Some(CloseReason::ProtocolViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_panicking_task_cancels_connection() {
        let ctx = LifecycleContext::new();
        let task = spawn_task(&ctx, ConnectionId::new(), "keepalive", async {
            if std::hint::black_box(true) {
                panic!("keepalive state corrupted");
            }
            Ok::<(), ProtocolError>(())
        });

        task.await.unwrap();
        match ctx.reason() {
            Some(CloseReason::Transport(msg)) => assert!(msg.contains("keepalive task aborted")),
            other => panic!("unexpected reason: {:?}", other),
        }
    }
}
