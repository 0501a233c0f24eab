//! UDP stream server: one session and one worker per client address.
//!
//! A client's first [`ClientMessage::Query`] opens its stream. Later queries
//! update the session's view. A [`ClientMessage::Disconnect`] or silence
//! longer than the client timeout shuts the session down, and the worker's
//! exit callback removes the client.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use octstream_config::Config;
use octstream_core::{
    ClientId, ClientQuery, ClientStreamSession, Distributor, Jurisdiction, ReseedPolicy,
    SessionHandle, SharedTree, StreamConfig, StreamMetrics, StreamProfile, StreamWorker,
    Transport, WorkerHandle,
};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::protocol::{ClientMessage, decode_message};
use crate::transport::UdpTransport;

const RECV_BUFFER_LEN: usize = 2048;
const MIN_REAP_PERIOD: Duration = Duration::from_millis(10);

/// Configuration for [`StreamServer`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Silence after which a client is dropped.
    pub client_timeout: Duration,
    pub stream: StreamConfig,
    pub profile: StreamProfile,
    pub jurisdiction: Option<Jurisdiction>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for ServerConfig {
    fn from(config: &Config) -> Self {
        let streaming = &config.streaming;
        let reseed = if streaming.reseed_only_when_empty {
            ReseedPolicy::WhenEmpty
        } else {
            ReseedPolicy::Always
        };
        Self {
            bind_addr: config.network.socket_addr(),
            client_timeout: Duration::from_secs(config.network.client_timeout_secs),
            stream: StreamConfig {
                mtu: config.network.mtu,
                intervals_per_second: streaming.intervals_per_second,
                server_max_packets_per_second: streaming.server_max_packets_per_second,
                min_sleep: Duration::from_micros(streaming.min_sleep_micros),
                reseed,
                debug_sending: streaming.debug_sending,
            },
            profile: StreamProfile::default(),
            jurisdiction: None,
        }
    }
}

/// Errors that stop the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

struct ClientEntry {
    id: ClientId,
    session: SessionHandle,
    worker: Option<WorkerHandle>,
    last_seen: Instant,
}

type ClientMap = HashMap<SocketAddr, ClientEntry>;

fn lock(clients: &Mutex<ClientMap>) -> MutexGuard<'_, ClientMap> {
    clients.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns the socket and the per-client workers streaming from one tree.
pub struct StreamServer {
    config: ServerConfig,
    socket: Arc<UdpSocket>,
    transport: Arc<UdpTransport>,
    tree: SharedTree,
    metrics: Arc<dyn StreamMetrics>,
    clients: Arc<Mutex<ClientMap>>,
    next_id: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl StreamServer {
    /// Bind the UDP socket. Streaming starts with [`run`](Self::run).
    pub async fn bind(
        config: ServerConfig,
        tree: SharedTree,
        metrics: Arc<dyn StreamMetrics>,
    ) -> Result<Self, ServerError> {
        let addr = config.bind_addr;
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let socket = Arc::new(socket);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Self {
            transport: Arc::new(UdpTransport::new(Arc::clone(&socket))),
            socket,
            config,
            tree,
            metrics,
            clients: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.socket.local_addr()?)
    }

    /// The transport, for queueing one-off packets to clients.
    pub fn transport(&self) -> &Arc<UdpTransport> {
        &self.transport
    }

    pub fn client_count(&self) -> usize {
        lock(&self.clients).len()
    }

    /// Signal the server to stop. [`run`](Self::run) returns once every
    /// worker has exited.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Receive client datagrams until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        info!("stream server listening on {}", self.local_addr()?);
        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut reap = tokio::time::interval((self.config.client_timeout / 2).max(MIN_REAP_PERIOD));
        let mut buf = vec![0u8; RECV_BUFFER_LEN];

        let outcome = loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((n, from)) => self.handle_datagram(&buf[..n], from),
                        // ICMP port unreachable from a departed client.
                        Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                            debug!("ignoring connection reset: {}", e);
                        }
                        Err(e) => break Err(ServerError::Io(e)),
                    }
                }
                _ = reap.tick() => self.reap_idle(),
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("stream server shutting down");
                        break Ok(());
                    }
                }
            }
        };

        self.stop_all().await;
        outcome
    }

    fn handle_datagram(&self, bytes: &[u8], from: SocketAddr) {
        match decode_message(bytes) {
            Ok(ClientMessage::Query(query)) => self.handle_query(query, from),
            Ok(ClientMessage::Disconnect) => {
                if let Some(entry) = lock(&self.clients).get(&from) {
                    info!("client {} disconnected", entry.id);
                    entry.session.shutdown();
                }
            }
            Err(e) => debug!("ignoring datagram from {}: {}", from, e),
        }
    }

    fn handle_query(&self, query: ClientQuery, from: SocketAddr) {
        let mut clients = lock(&self.clients);
        if let Some(entry) = clients.get_mut(&from) {
            entry.last_seen = Instant::now();
            if !entry.session.is_shutting_down() {
                entry.session.update_query(query);
            }
            return;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (session, handle) = ClientStreamSession::new(id, from, query, self.config.stream.mtu);
        let worker = self.spawn_worker(session);
        info!("client {} connected from {}", id, from);
        clients.insert(
            from,
            ClientEntry {
                id,
                session: handle,
                worker: Some(worker),
                last_seen: Instant::now(),
            },
        );
    }

    fn spawn_worker(&self, session: ClientStreamSession) -> WorkerHandle {
        let transport: Arc<dyn Transport> = self.transport.clone();
        let mut distributor = Distributor::new(
            Arc::clone(&self.tree),
            transport,
            Arc::clone(&self.metrics),
            self.config.profile,
            self.config.stream.clone(),
        );
        if let Some(jurisdiction) = &self.config.jurisdiction {
            distributor = distributor.with_jurisdiction(jurisdiction.clone());
        }

        let clients = Arc::clone(&self.clients);
        let transport = Arc::clone(&self.transport);
        StreamWorker::new(session, distributor)
            .on_exit(move |client| {
                lock(&clients).retain(|_, entry| entry.id != client);
                transport.clear_special(client);
                info!("client {} removed", client);
            })
            .spawn()
    }

    fn reap_idle(&self) {
        let timeout = self.config.client_timeout;
        for entry in lock(&self.clients).values() {
            if entry.last_seen.elapsed() > timeout && !entry.session.is_shutting_down() {
                info!("client {} timed out", entry.id);
                entry.session.shutdown();
            }
        }
    }

    async fn stop_all(&self) {
        let workers: Vec<WorkerHandle> = lock(&self.clients)
            .values_mut()
            .filter_map(|entry| {
                entry.session.shutdown();
                entry.worker.take()
            })
            .collect();
        if !workers.is_empty() {
            warn!("stopping {} active streams", workers.len());
        }
        for worker in workers {
            worker.join().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::RwLock;

    use octstream_core::{
        DataKind, EncodeOutcome, EncodeParams, NodeRef, NoopMetrics, PacketAssembler,
        StreamTree, parse_packet,
    };

    use crate::protocol::encode_message;

    const WAIT: Duration = Duration::from_secs(5);
    const ROOT_DATA: &[u8] = b"root-data";

    /// A tree that is nothing but a root.
    struct FlatTree;

    impl StreamTree for FlatTree {
        fn is_initial_load_complete(&self) -> bool {
            true
        }

        fn root(&self) -> NodeRef {
            NodeRef(1)
        }

        fn root_last_changed(&self) -> u64 {
            1
        }

        fn contains(&self, node: NodeRef) -> bool {
            node == NodeRef(1)
        }

        fn encode(
            &self,
            node: NodeRef,
            assembler: &mut PacketAssembler,
            _params: &mut EncodeParams<'_>,
        ) -> EncodeOutcome {
            if assembler.try_append(ROOT_DATA) {
                EncodeOutcome::finished(ROOT_DATA.len())
            } else {
                EncodeOutcome::didnt_fit(vec![octstream_core::PendingNode::new(node, 1.0)])
            }
        }
    }

    async fn start(client_timeout: Duration) -> (Arc<StreamServer>, tokio::task::JoinHandle<Result<(), ServerError>>) {
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            client_timeout,
            ..Default::default()
        };
        let tree: SharedTree = Arc::new(RwLock::new(FlatTree));
        let server = Arc::new(StreamServer::bind(config, tree, Arc::new(NoopMetrics)).await.unwrap());
        let runner = Arc::clone(&server);
        let task = tokio::spawn(async move { runner.run().await });
        (server, task)
    }

    async fn connect(server: &StreamServer) -> UdpSocket {
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(server.local_addr().unwrap()).await.unwrap();
        client
    }

    async fn send(client: &UdpSocket, msg: &ClientMessage) {
        client.send(&encode_message(msg).unwrap()).await.unwrap();
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(WAIT, async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition never held");
    }

    #[test]
    fn test_server_config_from_config() {
        let mut config = Config::default();
        config.network.port = 4000;
        config.network.mtu = 1200;
        config.streaming.reseed_only_when_empty = true;

        let server = ServerConfig::from(&config);
        assert_eq!(server.bind_addr.port(), 4000);
        assert_eq!(server.stream.mtu, 1200);
        assert_eq!(server.stream.reseed, ReseedPolicy::WhenEmpty);
        assert_eq!(server.stream.intervals_per_second, 60);
        assert_eq!(server.client_timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_query_starts_stream_and_disconnect_ends_it() {
        let (server, task) = start(Duration::from_secs(30)).await;
        let client = connect(&server).await;
        send(&client, &ClientMessage::Query(ClientQuery::default())).await;

        let mut buf = [0u8; RECV_BUFFER_LEN];
        let n = tokio::time::timeout(WAIT, client.recv(&mut buf))
            .await
            .expect("no stream packet")
            .unwrap();
        let (header, payload) = parse_packet(&buf[..n]).unwrap();
        assert_eq!(header.packet_type, DataKind::Voxels.packet_type());
        assert_eq!(header.sequence, 0);
        assert_eq!(payload, ROOT_DATA);
        assert_eq!(server.client_count(), 1);

        send(&client, &ClientMessage::Disconnect).await;
        eventually(|| server.client_count() == 0).await;

        server.shutdown();
        tokio::time::timeout(WAIT, task).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_silent_client_times_out() {
        let (server, task) = start(Duration::from_millis(50)).await;
        let client = connect(&server).await;
        send(&client, &ClientMessage::Query(ClientQuery::default())).await;

        eventually(|| server.client_count() == 1).await;
        eventually(|| server.client_count() == 0).await;

        server.shutdown();
        tokio::time::timeout(WAIT, task).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_garbage_datagram_is_ignored() {
        let (server, task) = start(Duration::from_secs(30)).await;
        let client = connect(&server).await;
        client.send(&[9, 9, 9]).await.unwrap();
        send(&client, &ClientMessage::Query(ClientQuery::default())).await;

        eventually(|| server.client_count() == 1).await;

        server.shutdown();
        tokio::time::timeout(WAIT, task).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_stops_every_worker() {
        let (server, task) = start(Duration::from_secs(30)).await;
        let first = connect(&server).await;
        let second = connect(&server).await;
        send(&first, &ClientMessage::Query(ClientQuery::default())).await;
        send(&second, &ClientMessage::Query(ClientQuery::default())).await;
        eventually(|| server.client_count() == 2).await;

        server.shutdown();
        tokio::time::timeout(WAIT, task).await.unwrap().unwrap().unwrap();
        assert_eq!(server.client_count(), 0);
    }

    #[tokio::test]
    async fn test_bind_conflict_reports_address() {
        let (server, task) = start(Duration::from_secs(30)).await;
        let addr = server.local_addr().unwrap();
        let config = ServerConfig {
            bind_addr: addr,
            ..Default::default()
        };
        let tree: SharedTree = Arc::new(RwLock::new(FlatTree));
        let result = StreamServer::bind(config, tree, Arc::new(NoopMetrics)).await;
        assert!(matches!(result, Err(ServerError::Bind { addr: a, .. }) if a == addr));

        server.shutdown();
        tokio::time::timeout(WAIT, task).await.unwrap().unwrap().unwrap();
    }
}
