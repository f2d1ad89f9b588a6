//! The node: listener, dialer and owner of the connection registry.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use protocol::crypto::{NodeId, NodeIdentity, SECRET_KEY_LENGTH};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::address::PeerUri;
use crate::error::{SetupError, SetupResult};
use crate::network::connection::{establish, ConnectionEnv};
use crate::network::stream::connection_error;
use crate::network::tls::{quic_client_config, quic_server_config};
use crate::network::{ConnectionHandle, ConnectionSettings, DatagramHandler, DatagramHandlers};
use crate::registry::ConnectionManager;
use crate::transport::Role;

/// Accepted connections buffered ahead of [`Node::accept`].
pub const ACCEPT_BACKLOG: usize = 64;

/// QUIC close code sent by every endpoint on shutdown.
const SHUTDOWN_CODE: u32 = 0;

/// State shared with the accept loop.
#[derive(Clone)]
struct NodeContext {
    identity: Arc<NodeIdentity>,
    settings: Arc<ConnectionSettings>,
    registry: Arc<ConnectionManager>,
    handlers: Arc<DatagramHandlers>,
    shutdown: CancellationToken,
}

impl NodeContext {
    fn env(&self, quic: &quinn::Connection, endpoint_addr: SocketAddr) -> ConnectionEnv {
        let local_ip = quic.local_ip().unwrap_or_else(|| endpoint_addr.ip());
        ConnectionEnv {
            identity: Arc::clone(&self.identity),
            settings: Arc::clone(&self.settings),
            registry: Arc::clone(&self.registry),
            handlers: Arc::clone(&self.handlers),
            shutdown: self.shutdown.clone(),
            local_address: SocketAddr::new(local_ip, endpoint_addr.port()),
        }
    }
}

struct Listener {
    endpoint: quinn::Endpoint,
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

/// A PeerLink node.
///
/// One node has at most one listener and any number of outbound
/// connections. Every established connection is tracked in the node's
/// [`ConnectionManager`] until it closes.
pub struct Node {
    ctx: NodeContext,
    listener: Mutex<Option<Listener>>,
    dialers: Mutex<Vec<quinn::Endpoint>>,
    accepted_tx: mpsc::Sender<ConnectionHandle>,
    accepted_rx: AsyncMutex<mpsc::Receiver<ConnectionHandle>>,
}

impl Node {
    pub fn new(identity: NodeIdentity, settings: ConnectionSettings) -> Self {
        let (accepted_tx, accepted_rx) = mpsc::channel(ACCEPT_BACKLOG);
        Self {
            ctx: NodeContext {
                identity: Arc::new(identity),
                settings: Arc::new(settings),
                registry: Arc::new(ConnectionManager::new()),
                handlers: Arc::new(DatagramHandlers::new()),
                shutdown: CancellationToken::new(),
            },
            listener: Mutex::new(None),
            dialers: Mutex::new(Vec::new()),
            accepted_tx,
            accepted_rx: AsyncMutex::new(accepted_rx),
        }
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.ctx.identity
    }

    pub fn node_id(&self) -> &NodeId {
        self.ctx.identity.node_id()
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.ctx.settings
    }

    pub fn registry(&self) -> &Arc<ConnectionManager> {
        &self.ctx.registry
    }

    /// Every live connection.
    pub fn connections(&self) -> Vec<ConnectionHandle> {
        self.ctx.registry.snapshot()
    }

    /// Bound listener address, if listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock_listener().as_ref().map(|l| l.local_addr)
    }

    pub fn is_shut_down(&self) -> bool {
        self.ctx.shutdown.is_cancelled()
    }

    /// Route datagrams tagged `tag` on every connection to `handler`.
    pub fn register_datagram_handler(&self, tag: u8, handler: DatagramHandler) {
        self.ctx.handlers.register(tag, handler);
    }

    pub fn unregister_datagram_handler(&self, tag: u8) -> bool {
        self.ctx.handlers.unregister(tag)
    }

    fn lock_listener(&self) -> std::sync::MutexGuard<'_, Option<Listener>> {
        self.listener.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_dialers(&self) -> std::sync::MutexGuard<'_, Vec<quinn::Endpoint>> {
        self.dialers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start accepting connections on `addr`.
    ///
    /// Returns the bound address, which differs from `addr` when port 0 was
    /// requested.
    pub fn listen(
        &self,
        addr: SocketAddr,
        tls: Arc<rustls::ServerConfig>,
    ) -> SetupResult<SocketAddr> {
        if self.is_shut_down() {
            return Err(SetupError::ShutDown);
        }

        let mut listener = self.lock_listener();
        if let Some(existing) = listener.as_ref() {
            return Err(SetupError::AlreadyListening(existing.local_addr));
        }

        let config = quic_server_config(tls, self.ctx.settings.enable_datagrams)?;
        let endpoint = quinn::Endpoint::server(config, addr)?;
        let local_addr = endpoint.local_addr()?;

        let task = tokio::spawn(accept_loop(
            endpoint.clone(),
            local_addr,
            self.ctx.clone(),
            self.accepted_tx.clone(),
        ));
        *listener = Some(Listener {
            endpoint,
            local_addr,
            task,
        });

        info!(local = %local_addr, "Listening for peers");
        Ok(local_addr)
    }

    /// Next connection accepted by the listener, or `None` once the node is
    /// shut down.
    pub async fn accept(&self) -> Option<ConnectionHandle> {
        let mut accepted = self.accepted_rx.lock().await;
        tokio::select! {
            _ = self.ctx.shutdown.cancelled() => None,
            handle = accepted.recv() => handle,
        }
    }

    /// Dial `uri` and run the initiator handshake.
    pub async fn connect(
        &self,
        uri: &str,
        tls: Arc<rustls::ClientConfig>,
    ) -> SetupResult<ConnectionHandle> {
        if self.is_shut_down() {
            return Err(SetupError::ShutDown);
        }

        let peer = PeerUri::parse(uri)?;
        let remote = peer.resolve().await?;
        debug!(uri = %peer, kind = %peer.kind(), remote = %remote, "Dialing peer");

        let endpoint = self.dial_endpoint(remote)?;
        let endpoint_addr = endpoint.local_addr()?;
        let config = quic_client_config(tls, self.ctx.settings.enable_datagrams)?;

        let connecting = endpoint
            .connect_with(config, remote, peer.server_name())
            .map_err(|err| match err {
                quinn::ConnectError::InvalidServerName(name) => {
                    SetupError::InvalidUri(format!("invalid server name '{}'", name))
                }
                quinn::ConnectError::EndpointStopping => SetupError::ShutDown,
                other => SetupError::Protocol(protocol::ProtocolError::Quic(other.to_string())),
            })?;

        let quic = tokio::select! {
            _ = self.ctx.shutdown.cancelled() => return Err(SetupError::ShutDown),
            connected = connecting => connected.map_err(connection_error)?,
        };

        let env = self.ctx.env(&quic, endpoint_addr);
        Ok(establish(quic, Role::Initiator, env).await?)
    }

    /// Endpoint to dial `remote` from: the listener when its address family
    /// matches, otherwise a client endpoint on an ephemeral port.
    fn dial_endpoint(&self, remote: SocketAddr) -> SetupResult<quinn::Endpoint> {
        if let Some(listener) = self.lock_listener().as_ref() {
            if listener.local_addr.is_ipv6() == remote.is_ipv6() {
                return Ok(listener.endpoint.clone());
            }
        }

        let mut dialers = self.lock_dialers();
        for endpoint in dialers.iter() {
            if let Ok(addr) = endpoint.local_addr() {
                if addr.is_ipv6() == remote.is_ipv6() {
                    return Ok(endpoint.clone());
                }
            }
        }

        let bind = if remote.is_ipv6() {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        };
        let endpoint = quinn::Endpoint::client(bind)?;
        debug!(local = ?endpoint.local_addr().ok(), "Created dialing endpoint");
        dialers.push(endpoint.clone());
        Ok(endpoint)
    }

    /// Stop accepting, close every connection and release the sockets.
    pub async fn shutdown(&self) {
        if self.ctx.shutdown.is_cancelled() {
            return;
        }
        info!(connections = self.ctx.registry.len(), "Shutting down node");
        self.ctx.shutdown.cancel();

        self.ctx.registry.close_all().await;

        let listener = self.lock_listener().take();
        let dialers: Vec<quinn::Endpoint> = self.lock_dialers().drain(..).collect();

        if let Some(listener) = listener {
            listener.endpoint.close(SHUTDOWN_CODE.into(), b"shutdown");
            if let Err(err) = listener.task.await {
                warn!(error = %err, "Accept loop ended abnormally");
            }
            listener.endpoint.wait_idle().await;
        }
        for endpoint in dialers {
            endpoint.close(SHUTDOWN_CODE.into(), b"shutdown");
            endpoint.wait_idle().await;
        }

        info!("Node shut down");
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("node_id", &self.ctx.identity.fingerprint())
            .field("local_addr", &self.local_addr())
            .field("connections", &self.ctx.registry.len())
            .finish()
    }
}

/// Accept incoming QUIC connections until the endpoint closes or the node
/// shuts down. Each handshake runs on its own task.
async fn accept_loop(
    endpoint: quinn::Endpoint,
    local_addr: SocketAddr,
    ctx: NodeContext,
    accepted: mpsc::Sender<ConnectionHandle>,
) {
    loop {
        let incoming = tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            incoming = endpoint.accept() => match incoming {
                Some(incoming) => incoming,
                None => break,
            },
        };

        let ctx = ctx.clone();
        let accepted = accepted.clone();
        tokio::spawn(async move {
            let remote = incoming.remote_address();
            let quic = match incoming.await {
                Ok(quic) => quic,
                Err(err) => {
                    warn!(remote = %remote, error = %err, "Incoming QUIC handshake failed");
                    return;
                }
            };

            let env = ctx.env(&quic, local_addr);
            match establish(quic, Role::Acceptor, env).await {
                Ok(handle) => {
                    if let Err(err) = accepted.try_send(handle) {
                        debug!(
                            remote = %remote,
                            error = %err,
                            "Accept backlog unavailable, connection stays in the registry"
                        );
                    }
                }
                Err(err) => warn!(remote = %remote, error = %err, "Rejected incoming peer"),
            }
        });
    }
    debug!(local = %local_addr, "Accept loop stopped");
}

/// Load the node identity from `path`, or generate and save a new one.
pub fn load_or_generate_identity(path: &Path) -> Result<NodeIdentity> {
    if path.exists() {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read identity file: {}", path.display()))?;
        let key: [u8; SECRET_KEY_LENGTH] = bytes.as_slice().try_into().map_err(|_| {
            anyhow::anyhow!(
                "Invalid identity file: expected {} bytes, got {}",
                SECRET_KEY_LENGTH,
                bytes.len()
            )
        })?;
        return Ok(NodeIdentity::from_secret_key_bytes(&key));
    }

    let identity = NodeIdentity::generate();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    std::fs::write(path, identity.secret_key_bytes())
        .with_context(|| format!("Failed to write identity file: {}", path.display()))?;

    info!("Generated new node identity and saved to {:?}", path);
    Ok(identity)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::network::tls::SelfSignedCert;

    #[test]
    fn test_identity_is_persisted() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("keys").join("identity.key");

        let first = load_or_generate_identity(&path).unwrap();
        assert_eq!(std::fs::read(&path).unwrap().len(), SECRET_KEY_LENGTH);

        let second = load_or_generate_identity(&path).unwrap();
        assert_eq!(first.node_id(), second.node_id());
    }

    #[test]
    fn test_truncated_identity_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("identity.key");
        std::fs::write(&path, [0u8; 7]).unwrap();

        let err = load_or_generate_identity(&path).unwrap_err();
        assert!(err.to_string().contains("expected 32 bytes, got 7"));
    }

    #[tokio::test]
    async fn test_listen_twice_fails() {
        let node = Node::new(NodeIdentity::generate(), ConnectionSettings::default());
        let server = SelfSignedCert::generate("localhost").unwrap().server_config().unwrap();

        let addr = node
            .listen("127.0.0.1:0".parse().unwrap(), Arc::clone(&server))
            .unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(node.local_addr(), Some(addr));

        let again = node.listen("127.0.0.1:0".parse().unwrap(), server);
        assert!(matches!(again, Err(SetupError::AlreadyListening(a)) if a == addr));

        node.shutdown().await;
        assert!(node.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_uri_without_dialing() {
        let node = Node::new(NodeIdentity::generate(), ConnectionSettings::default());
        let client = crate::network::tls::insecure_client_config().unwrap();

        let err = node
            .connect("udp://127.0.0.1:4433", Arc::clone(&client))
            .await
            .unwrap_err();
        assert!(matches!(err, SetupError::UnsupportedScheme(_)));

        let err = node.connect("quic://127.0.0.1", client).await.unwrap_err();
        assert!(matches!(err, SetupError::InvalidUri(_)));
        assert!(node.connections().is_empty());
        assert!(node.lock_dialers().is_empty());
    }

    #[tokio::test]
    async fn test_shut_down_node_refuses_work() {
        let node = Node::new(NodeIdentity::generate(), ConnectionSettings::default());
        node.shutdown().await;
        assert!(node.is_shut_down());
        assert!(node.accept().await.is_none());

        let server = SelfSignedCert::generate("localhost").unwrap().server_config().unwrap();
        assert!(matches!(
            node.listen("127.0.0.1:0".parse().unwrap(), server),
            Err(SetupError::ShutDown)
        ));
    }
}
