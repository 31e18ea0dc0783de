//! The `Node` value: owns the identity store, session registry, routing
//! table, and live wire connections, and wires components A–E together
//! behind the plaintext API `spec.md` §6 describes. A single explicit
//! value threaded through every task, per §9's "no process-wide state"
//! redesign — there is no global registry or singleton anywhere here.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use x25519_dalek::PublicKey;

use veilnet_crypto::x3dh;
use veilnet_crypto::{node_id_of, IdentityStore, NodeId, PrekeyBundle, Session, SessionRegistry};
use veilnet_overlay::{iterative_find_node, spawn_health_task, FindNodeRpc, LivenessCheck, OverlayError, PeerRecord, RoutingTable, K};
use veilnet_wire::{ConnectionHandle, Method};

use crate::error::NodeError;
use crate::persistence::Paths;
use crate::wire::{Hello, Message, PeerAddr as WireAddr, RatchetMsgBody, Welcome, X3dhInitBody};

/// How long an RPC (PING, FIND_NODE) waits for its reply before
/// `OverlayError::Timeout`/`NodeError::Wire(WireError::Closed)`.
const RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// Which side of a connection dialed it, so the dispatcher knows how to
/// resolve the handshake and what to log on failure.
enum Role {
    /// We dialed `addr`; the pending `WELCOME` is keyed by it.
    Outbound { addr: String },
    /// A peer dialed us.
    Inbound,
}

struct PendingPong(oneshot::Sender<()>);
struct PendingNodes(oneshot::Sender<Vec<PeerRecord>>);

pub struct Node {
    identity: IdentityStore,
    sessions: SessionRegistry,
    table: Arc<RoutingTable>,
    paths: Paths,
    cancel: CancellationToken,
    connections: RwLock<HashMap<NodeId, ConnectionHandle>>,
    pending_welcome: Mutex<HashMap<String, oneshot::Sender<Welcome>>>,
    pending_pong: Mutex<HashMap<NodeId, PendingPong>>,
    pending_nodes: Mutex<HashMap<NodeId, PendingNodes>>,
    inbound_plaintext_tx: mpsc::Sender<(NodeId, Vec<u8>)>,
    inbound_plaintext_rx: Mutex<mpsc::Receiver<(NodeId, Vec<u8>)>>,
    /// This node's externally dialable `host:port`, advertised in HELLOs
    /// once known (set via `set_advertised_addr`). `None` until then,
    /// which is fine for a pure dialer that never accepts inbound peers.
    advertised: Mutex<Option<(String, u16)>>,
    /// A handle back to `Arc<Self>`, needed because `LivenessCheck`/
    /// `FindNodeRpc` only hand us `&self` but dialing an unconnected peer
    /// requires spawning a 'static task that outlives the call.
    self_weak: Weak<Node>,
}

impl Node {
    pub fn new(identity: IdentityStore, paths: Paths, cancel: CancellationToken) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(256);
        let local_id = identity.node_id();
        Arc::new_cyclic(|weak| Self {
            identity,
            sessions: SessionRegistry::new(),
            table: Arc::new(RoutingTable::new(local_id)),
            paths,
            cancel,
            connections: RwLock::new(HashMap::new()),
            pending_welcome: Mutex::new(HashMap::new()),
            pending_pong: Mutex::new(HashMap::new()),
            pending_nodes: Mutex::new(HashMap::new()),
            inbound_plaintext_tx: tx,
            inbound_plaintext_rx: Mutex::new(rx),
            advertised: Mutex::new(None),
            self_weak: weak.clone(),
        })
    }

    /// Record this node's own dialable address, advertised in every HELLO
    /// from now on so peers that only learn about it via WELCOME/NODES
    /// can dial it back. Call once, right after binding the listener.
    pub async fn set_advertised_addr(&self, host: String, port: u16) {
        *self.advertised.lock().await = Some((host, port));
    }

    pub fn node_id(&self) -> NodeId {
        self.identity.node_id()
    }

    pub async fn bundle(&self) -> PrekeyBundle {
        self.identity.bundle().await
    }

    pub fn identity_store(&self) -> &IdentityStore {
        &self.identity
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.table
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    /// Block on the next decrypted plaintext delivered by any session
    /// (`spec.md` §6 `recv` — "lazy stream").
    pub async fn recv(&self) -> Option<(NodeId, Vec<u8>)> {
        self.inbound_plaintext_rx.lock().await.recv().await
    }

    /// Accept connections on `listen_addr` until `cancel` fires. Each
    /// accepted connection gets its own read/write task pair (via
    /// `veilnet_wire::spawn`) and a dispatcher task decoding and routing
    /// `Message`s, mirroring `freeq_server::iroh::start`'s accept-loop
    /// shape.
    pub async fn listen(self: &Arc<Self>, listen_addr: &str) -> Result<(), NodeError> {
        let listener = TcpListener::bind(listen_addr).await?;
        tracing::info!(node_id = %veilnet_crypto::short_id(&self.node_id()), %listen_addr, "listening");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => { tracing::warn!(error = %e, "accept failed"); continue; }
                    };
                    let node = self.clone();
                    tokio::spawn(async move {
                        tracing::debug!(%peer_addr, "inbound connection");
                        node.handle_stream(stream, Role::Inbound).await;
                    });
                }
            }
        }
        Ok(())
    }

    /// Dial `host:port`, complete the HELLO/WELCOME handshake, and
    /// return the peer's `NodeId`.
    pub async fn connect(self: &Arc<Self>, host: &str, port: u16) -> Result<NodeId, NodeError> {
        let dial_key = format!("{host}:{port}");
        let stream = TcpStream::connect((host, port)).await?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending_welcome.lock().await.insert(dial_key.clone(), reply_tx);

        let node = self.clone();
        let role = Role::Outbound { addr: dial_key.clone() };
        tokio::spawn(async move { node.handle_stream(stream, role).await });

        let welcome = tokio::time::timeout(RPC_TIMEOUT, reply_rx)
            .await
            .map_err(|_| NodeError::Protocol(format!("handshake with {dial_key} timed out")))?
            .map_err(|_| NodeError::Protocol(format!("connection to {dial_key} closed before WELCOME")))?;

        Ok(welcome.hello.addr.node_id)
    }

    async fn handle_stream(self: Arc<Self>, stream: TcpStream, role: Role) {
        let (handle, mut inbound) = veilnet_wire::spawn(stream, Method::Raw, self.cancel.clone());

        if let Role::Outbound { .. } = &role {
            let hello = self.hello_message().await;
            if handle.enqueue(hello.encode()).is_err() {
                tracing::warn!("failed to send HELLO on outbound connection");
                return;
            }
        }

        let mut peer_id: Option<NodeId> = None;
        let dial_key = match &role {
            Role::Outbound { addr } => Some(addr.clone()),
            Role::Inbound => None,
        };

        while let Some(raw) = inbound.recv().await {
            let msg = match Message::decode(&raw) {
                Ok(msg) => msg,
                Err(e) => {
                    tracing::warn!(error = %e, "dropping connection: malformed message");
                    break;
                }
            };
            if let Err(e) = self.handle_message(msg, &handle, &mut peer_id, dial_key.as_deref()).await {
                tracing::debug!(error = %e, "error handling message");
            }
        }

        if let Some(peer) = peer_id {
            self.connections.write().await.remove(&peer);
        }
    }

    async fn hello_message(&self) -> Message {
        let (host, port) = self.advertised.lock().await.clone().unwrap_or_default();
        Message::Hello(Hello {
            addr: WireAddr { node_id: self.node_id(), host, port },
            ik_pub: self.identity.identity_public_bytes().await,
        })
    }

    async fn handle_message(
        &self,
        msg: Message,
        handle: &ConnectionHandle,
        peer_id: &mut Option<NodeId>,
        dial_key: Option<&str>,
    ) -> Result<(), NodeError> {
        match msg {
            Message::Hello(hello) => {
                *peer_id = Some(hello.addr.node_id);
                self.observe_peer(&hello.addr, handle.clone()).await;
                let welcome = Welcome {
                    hello: match self.hello_message().await {
                        Message::Hello(h) => h,
                        _ => unreachable!(),
                    },
                    peers: self.known_peers().await,
                };
                handle.enqueue(Message::Welcome(welcome).encode())?;
            }
            Message::Welcome(welcome) => {
                *peer_id = Some(welcome.hello.addr.node_id);
                self.observe_peer(&welcome.hello.addr, handle.clone()).await;
                for p in &welcome.peers {
                    self.table.observe(PeerRecord::new(p.node_id, p.host.clone(), p.port), self).await;
                }
                if let Some(key) = dial_key {
                    if let Some(tx) = self.pending_welcome.lock().await.remove(key) {
                        let _ = tx.send(welcome);
                    }
                }
            }
            Message::Ping => {
                handle.enqueue(Message::Pong.encode())?;
            }
            Message::Pong => {
                if let Some(peer) = peer_id {
                    if let Some(PendingPong(tx)) = self.pending_pong.lock().await.remove(peer) {
                        let _ = tx.send(());
                    }
                }
            }
            Message::FindNode { target } => {
                let peers = self.table.find_closest(&target, K).await;
                let wire_peers = peers.iter().map(to_wire_addr).collect();
                handle.enqueue(Message::Nodes(wire_peers).encode())?;
            }
            Message::Nodes(peers) => {
                let records: Vec<PeerRecord> = peers.iter().map(|p| PeerRecord::new(p.node_id, p.host.clone(), p.port)).collect();
                for r in &records {
                    self.table.observe(r.clone(), self).await;
                }
                if let Some(peer) = peer_id {
                    if let Some(PendingNodes(tx)) = self.pending_nodes.lock().await.remove(peer) {
                        let _ = tx.send(records);
                    }
                }
            }
            Message::X3dhInit(body) => self.handle_x3dh_init(body).await?,
            Message::RatchetMsg(body) => {
                let peer = peer_id.ok_or_else(|| NodeError::Protocol("RATCHET_MSG on a connection with no known peer identity".into()))?;
                self.handle_ratchet_msg(peer, body).await?;
            }
        }
        Ok(())
    }

    async fn observe_peer(&self, addr: &WireAddr, handle: ConnectionHandle) {
        self.connections.write().await.insert(addr.node_id, handle);
        self.table.observe(PeerRecord::new(addr.node_id, addr.host.clone(), addr.port), self).await;
    }

    async fn known_peers(&self) -> Vec<WireAddr> {
        self.table.find_closest(&self.node_id(), K).await.iter().map(to_wire_addr).collect()
    }

    async fn handle_x3dh_init(&self, body: X3dhInitBody) -> Result<(), NodeError> {
        let initial = body.initial_message();
        let resp = x3dh::respond(&self.identity, &initial).await?;
        let mut session = Session::init_responder(resp.shared_secret, resp.our_ratchet_secret, resp.associated_data);
        let plaintext = session.decrypt(&body.ratchet.clone().into())?;

        let peer = node_id_of(&PublicKey::from(body.ik_pub));
        self.sessions.insert(peer, session).await;
        self.persist_session(&peer).await;

        if self.inbound_plaintext_tx.send((peer, plaintext)).await.is_err() {
            tracing::warn!("inbound plaintext channel closed, dropping message");
        }
        Ok(())
    }

    async fn handle_ratchet_msg(&self, peer: NodeId, body: RatchetMsgBody) -> Result<(), NodeError> {
        let sealed = body.into();
        let result = self.sessions.with_session(&peer, |s| s.decrypt(&sealed)).await;
        match result {
            Some(Ok(plaintext)) => {
                self.persist_session(&peer).await;
                if self.inbound_plaintext_tx.send((peer, plaintext)).await.is_err() {
                    tracing::warn!("inbound plaintext channel closed, dropping message");
                }
                Ok(())
            }
            Some(Err(e)) => {
                tracing::debug!(error = %e, peer = %veilnet_crypto::short_id(&peer), "ratchet decrypt failed");
                Err(NodeError::Ratchet(e))
            }
            None => Err(NodeError::NoSession(veilnet_crypto::short_id(&peer))),
        }
    }

    async fn persist_session(&self, peer: &NodeId) {
        let bytes = self.sessions.with_session(peer, |s| s.to_bytes()).await;
        if let Some(bytes) = bytes {
            if let Err(e) = crate::persistence::write_session_bytes(&self.paths, peer, &bytes) {
                tracing::warn!(error = %e, "failed to persist session");
            }
        }
    }

    /// Begin a new session against a peer's published prekey bundle
    /// (`spec.md` §6 `begin_session`). The peer must already have an open
    /// connection (established via `connect`/an inbound HELLO).
    pub async fn begin_session(&self, bundle: &PrekeyBundle, first_message: &[u8]) -> Result<NodeId, NodeError> {
        let init = x3dh::initiate(&self.identity, bundle).await?;
        let peer = node_id_of(&PublicKey::from(bundle.ik_pub));

        let mut session = Session::init_initiator(init.shared_secret, init.their_ratchet_key, init.associated_data);
        let sealed = session.encrypt(first_message)?;
        self.sessions.insert(peer, session).await;
        self.persist_session(&peer).await;

        let body = X3dhInitBody {
            ik_pub: init.initial_message.ik_pub,
            ek_pub: init.initial_message.ek_pub,
            opk_id: init.initial_message.opk_id,
            ratchet: RatchetMsgBody::from(&sealed),
        };
        self.connection(&peer).await?.enqueue(Message::X3dhInit(body).encode())?;
        Ok(peer)
    }

    /// Send a plaintext over an already-established session
    /// (`spec.md` §6 `send`).
    pub async fn send(&self, peer: &NodeId, plaintext: &[u8]) -> Result<(), NodeError> {
        let sealed = self
            .sessions
            .with_session(peer, |s| s.encrypt(plaintext))
            .await
            .ok_or_else(|| NodeError::NoSession(veilnet_crypto::short_id(peer)))??;
        self.persist_session(peer).await;
        self.connection(peer).await?.enqueue(Message::RatchetMsg(RatchetMsgBody::from(&sealed)).encode())?;
        Ok(())
    }

    /// Tear down a session and its connection (`spec.md` §6 `close`).
    pub async fn close(&self, peer: &NodeId) {
        if let Some(conn) = self.connections.write().await.remove(peer) {
            conn.close();
        }
        self.sessions.remove(peer).await;
    }

    async fn connection(&self, peer: &NodeId) -> Result<ConnectionHandle, NodeError> {
        self.connections.read().await.get(peer).cloned().ok_or_else(|| NodeError::NoSession(veilnet_crypto::short_id(peer)))
    }

    /// Like `connection`, but dials `peer.host:peer.port` when there is no
    /// live connection yet — the case for a peer only known from a
    /// WELCOME/NODES peer list. Needed so the overlay's health sweeps and
    /// iterative FIND_NODE can actually reach peers beyond direct dials.
    async fn connection_or_dial(&self, peer: &PeerRecord) -> Result<ConnectionHandle, NodeError> {
        if let Ok(conn) = self.connection(&peer.node_id).await {
            return Ok(conn);
        }
        if peer.host.is_empty() {
            return Err(NodeError::NoSession(veilnet_crypto::short_id(&peer.node_id)));
        }
        let strong = self.self_weak.upgrade().ok_or_else(|| NodeError::Protocol("node shutting down".into()))?;
        strong.connect(&peer.host, peer.port).await?;
        self.connection(&peer.node_id).await
    }

    /// Iterative peer discovery (`spec.md` §6 `lookup`).
    pub async fn lookup(self: &Arc<Self>, target: NodeId) -> Vec<PeerRecord> {
        iterative_find_node(&self.table, target, self.as_ref(), K).await
    }

    /// Spawn the periodic background jobs: prekey pool replenishment and
    /// routing-table health sweeps (`spec.md` §5 ambient addition).
    pub fn spawn_background_tasks(self: &Arc<Self>) {
        let replenish_node = self.clone();
        let replenish_cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = replenish_cancel.cancelled() => break,
                    _ = ticker.tick() => replenish_node.identity_store().replenish().await,
                }
            }
        });

        spawn_health_task(self.table.clone(), self.clone(), Duration::from_secs(30), self.cancel.clone());
    }
}

fn to_wire_addr(p: &PeerRecord) -> WireAddr {
    WireAddr { node_id: p.node_id, host: p.host.clone(), port: p.port }
}

impl LivenessCheck for Node {
    async fn ping(&self, peer: &PeerRecord) -> bool {
        let Ok(conn) = self.connection_or_dial(peer).await else { return false };
        let (tx, rx) = oneshot::channel();
        self.pending_pong.lock().await.insert(peer.node_id, PendingPong(tx));
        if conn.enqueue(Message::Ping.encode()).is_err() {
            self.pending_pong.lock().await.remove(&peer.node_id);
            return false;
        }
        tokio::time::timeout(RPC_TIMEOUT, rx).await.is_ok_and(|r| r.is_ok())
    }
}

impl FindNodeRpc for Node {
    async fn find_node(&self, peer: &PeerRecord, target: NodeId) -> Result<Vec<PeerRecord>, OverlayError> {
        let conn = self.connection_or_dial(peer).await.map_err(|_| OverlayError::NoPeers)?;
        let (tx, rx) = oneshot::channel();
        self.pending_nodes.lock().await.insert(peer.node_id, PendingNodes(tx));
        conn.enqueue(Message::FindNode { target }.encode()).map_err(|e| OverlayError::Protocol(e.to_string()))?;
        tokio::time::timeout(RPC_TIMEOUT, rx).await.map_err(|_| OverlayError::Timeout)?.map_err(|_| OverlayError::Timeout)
    }
}
