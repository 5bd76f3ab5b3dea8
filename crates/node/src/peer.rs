//! Outbound peer session: handshake, message dispatch, and the fan-out
//! subscription used by multi-peer queries.

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use log::{debug, info, trace, warn};
use spvd_consensus::constants::{
    BIP37_VERSION, MAX_INV_PER_MSG, MAX_MONEY, NET_ADDRESS_TIME_VERSION, PROTOCOL_VERSION,
};
use spvd_consensus::{ChainParams, Hash256, Network};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Duration};

use crate::addrbook::AddressBook;
use crate::ban::DynamicBanScore;
use crate::config::Tunables;
use crate::sync::SyncEvent;
use crate::timesource::MedianTimeSource;
use crate::wire::{
    self, InventoryVector, Message, NetAddress, WireError, ENVELOPE_SIZE, MSG_BLOCK, MSG_TX,
};

const LOG_TARGET: &str = "peer";

const DIAL_TIMEOUT_SECS: u64 = 5;
const HANDSHAKE_TIMEOUT_SECS: u64 = 8;
const OUTBOX_CAPACITY: usize = 512;

pub type PeerId = i32;

static NEXT_PEER_ID: AtomicI32 = AtomicI32::new(1);

fn next_peer_id() -> PeerId {
    NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug)]
pub enum PeerError {
    Io(std::io::Error),
    Wire(WireError),
    DialTimeout,
    HandshakeTimeout,
    Disconnected,
}

impl fmt::Display for PeerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerError::Io(err) => write!(f, "{err}"),
            PeerError::Wire(err) => write!(f, "{err}"),
            PeerError::DialTimeout => write!(f, "dial timed out"),
            PeerError::HandshakeTimeout => write!(f, "handshake timed out"),
            PeerError::Disconnected => write!(f, "peer disconnected"),
        }
    }
}

impl std::error::Error for PeerError {}

impl From<std::io::Error> for PeerError {
    fn from(err: std::io::Error) -> Self {
        PeerError::Io(err)
    }
}

impl From<WireError> for PeerError {
    fn from(err: WireError) -> Self {
        PeerError::Wire(err)
    }
}

/// Aggregate traffic counters shared by all peers.
#[derive(Debug, Default)]
pub struct NetTotals {
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
}

impl NetTotals {
    pub fn add_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> (u64, u64) {
        (
            self.bytes_received.load(Ordering::Relaxed),
            self.bytes_sent.load(Ordering::Relaxed),
        )
    }
}

/// An inbound message paired with the peer that delivered it.
#[derive(Clone)]
pub struct SpMsg {
    pub peer: PeerHandle,
    pub message: Arc<Message>,
}

struct Subscription {
    id: u64,
    sender: mpsc::Sender<SpMsg>,
}

/// Shared dependencies handed to every peer session.
#[derive(Clone)]
pub struct PeerContext {
    pub params: Arc<ChainParams>,
    pub tunables: Arc<Tunables>,
    pub time_source: Arc<MedianTimeSource>,
    pub addr_book: Arc<AddressBook>,
    pub net_totals: Arc<NetTotals>,
    pub sync_tx: mpsc::Sender<SyncEvent>,
    pub new_peers_tx: mpsc::Sender<PeerHandle>,
    pub done_peers_tx: mpsc::Sender<PeerHandle>,
    pub ban_peers_tx: mpsc::Sender<PeerHandle>,
    /// Best-chain height reported in our version message.
    pub newest_block: Arc<dyn Fn() -> i32 + Send + Sync>,
}

pub type PeerHandle = Arc<Peer>;

pub struct Peer {
    id: PeerId,
    addr: SocketAddr,
    persistent: bool,
    connected_at: Instant,
    outbox: mpsc::Sender<Message>,
    disconnect_tx: watch::Sender<bool>,

    services: AtomicU64,
    protocol_version: AtomicU32,
    user_agent: Mutex<String>,
    last_block: AtomicI32,
    last_announced_block: Mutex<Option<Hash256>>,
    fee_filter: AtomicI64,

    ban_score: Mutex<DynamicBanScore>,
    known_addresses: Mutex<HashSet<SocketAddr>>,
    subscribers: Mutex<Vec<Subscription>>,
    next_subscription: AtomicU64,

    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (peer {})", self.addr, self.id)
    }
}

impl Peer {
    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn persistent(&self) -> bool {
        self.persistent
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    pub fn services(&self) -> u64 {
        self.services.load(Ordering::Relaxed)
    }

    pub fn protocol_version(&self) -> u32 {
        self.protocol_version.load(Ordering::Relaxed)
    }

    pub fn user_agent(&self) -> String {
        self.user_agent.lock().map(|ua| ua.clone()).unwrap_or_default()
    }

    pub fn last_block(&self) -> i32 {
        self.last_block.load(Ordering::Relaxed)
    }

    pub fn update_last_block_height(&self, height: i32) {
        self.last_block.fetch_max(height, Ordering::Relaxed);
    }

    pub fn last_announced_block(&self) -> Option<Hash256> {
        self.last_announced_block.lock().ok().and_then(|hash| *hash)
    }

    pub fn clear_last_announced_block(&self) {
        if let Ok(mut hash) = self.last_announced_block.lock() {
            *hash = None;
        }
    }

    pub fn fee_filter(&self) -> i64 {
        self.fee_filter.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn connected(&self) -> bool {
        !*self.disconnect_tx.borrow()
    }

    /// Requests teardown; the reader and writer tasks observe the signal at
    /// their next suspension point.
    pub fn disconnect(&self) {
        let _ = self.disconnect_tx.send(true);
    }

    /// Queues an outbound message. Returns false when the peer is gone or
    /// the outbox is full.
    pub fn queue_message(&self, message: Message) -> bool {
        self.outbox.try_send(message).is_ok()
    }

    /// Registers a fan-out consumer; inbound messages are posted with a
    /// non-blocking send and dropped for consumers that fall behind.
    pub fn subscribe(&self, sender: mpsc::Sender<SpMsg>) -> u64 {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(Subscription { id, sender });
        }
        id
    }

    pub fn unsubscribe(&self, id: u64) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.retain(|subscription| subscription.id != id);
        }
    }

    fn publish(self: &Arc<Self>, message: &Arc<Message>) {
        let Ok(subscribers) = self.subscribers.lock() else {
            return;
        };
        for subscription in subscribers.iter() {
            let _ = subscription.sender.try_send(SpMsg {
                peer: Arc::clone(self),
                message: Arc::clone(message),
            });
        }
    }

    /// Raises the ban score, warning above half the threshold and asking the
    /// supervisor for a ban (plus disconnecting) above it.
    pub fn add_ban_score(
        self: &Arc<Self>,
        ctx: &PeerContext,
        persistent: u32,
        transient: u32,
        reason: &str,
    ) {
        let threshold = ctx.tunables.ban_threshold;
        let warn_threshold = threshold / 2;
        let now = Instant::now();
        let score = match self.ban_score.lock() {
            Ok(mut ban_score) => {
                if persistent == 0 && transient == 0 {
                    let score = ban_score.int(now);
                    if score > warn_threshold {
                        warn!(
                            target: LOG_TARGET,
                            "misbehaving peer {self}: {reason} -- ban score is {score}"
                        );
                    }
                    return;
                }
                ban_score.increase(persistent, transient, now)
            }
            Err(_) => return,
        };
        if score > warn_threshold {
            warn!(
                target: LOG_TARGET,
                "misbehaving peer {self}: {reason} -- ban score increased to {score}"
            );
            if score > threshold {
                warn!(target: LOG_TARGET, "banning and disconnecting peer {self}");
                let _ = ctx.ban_peers_tx.try_send(Arc::clone(self));
                self.disconnect();
            }
        }
    }

    fn add_known_addresses(&self, addresses: &[NetAddress]) {
        if let Ok(mut known) = self.known_addresses.lock() {
            for address in addresses {
                known.insert(address.addr);
            }
        }
    }
}

/// Dials `addr`, performs the version handshake, and spawns the session
/// tasks. The returned handle is already registered with the sync engine and
/// announced to the supervisor.
pub async fn connect_outbound(
    addr: SocketAddr,
    persistent: bool,
    ctx: PeerContext,
) -> Result<PeerHandle, PeerError> {
    ctx.addr_book.attempt(addr);
    let stream = timeout(
        Duration::from_secs(DIAL_TIMEOUT_SECS),
        TcpStream::connect(addr),
    )
    .await
    .map_err(|_| PeerError::DialTimeout)??;
    stream.set_nodelay(true).ok();
    let (mut read_half, mut write_half) = stream.into_split();

    let magic = ctx.params.message_start;
    let version = build_version(&ctx);
    write_message(&mut write_half, magic, &version, &ctx.net_totals).await?;

    let handshake = timeout(
        Duration::from_secs(HANDSHAKE_TIMEOUT_SECS),
        exchange_version(&mut read_half, &mut write_half, magic, &ctx),
    )
    .await
    .map_err(|_| PeerError::HandshakeTimeout)??;

    let (outbox_tx, outbox_rx) = mpsc::channel(OUTBOX_CAPACITY);
    let (disconnect_tx, disconnect_rx) = watch::channel(false);
    let peer: PeerHandle = Arc::new(Peer {
        id: next_peer_id(),
        addr,
        persistent,
        connected_at: Instant::now(),
        outbox: outbox_tx,
        disconnect_tx,
        services: AtomicU64::new(handshake.services),
        protocol_version: AtomicU32::new(handshake.version.min(PROTOCOL_VERSION)),
        user_agent: Mutex::new(handshake.user_agent),
        last_block: AtomicI32::new(handshake.start_height),
        last_announced_block: Mutex::new(None),
        fee_filter: AtomicI64::new(0),
        ban_score: Mutex::new(DynamicBanScore::new()),
        known_addresses: Mutex::new(HashSet::new()),
        subscribers: Mutex::new(Vec::new()),
        next_subscription: AtomicU64::new(0),
        bytes_received: AtomicU64::new(0),
        bytes_sent: AtomicU64::new(0),
    });

    info!(
        target: LOG_TARGET,
        "connected to {peer} agent {:?} height {}",
        peer.user_agent(),
        handshake.start_height
    );

    // Sample the remote clock and mark the address good before anyone else
    // hears about the peer.
    ctx.time_source.add_time_sample(addr, handshake.timestamp);
    if ctx.params.network != Network::Simnet {
        ctx.addr_book.good(addr, handshake.services);
        if ctx.addr_book.need_more_addresses()
            && peer.protocol_version() >= NET_ADDRESS_TIME_VERSION
        {
            peer.queue_message(Message::GetAddr);
        }
    }

    let _ = ctx.sync_tx.send(SyncEvent::NewPeer(Arc::clone(&peer))).await;
    ctx.new_peers_tx
        .send(Arc::clone(&peer))
        .await
        .map_err(|_| PeerError::Disconnected)?;

    tokio::spawn(write_loop(
        write_half,
        magic,
        outbox_rx,
        disconnect_rx.clone(),
        Arc::clone(&peer),
        ctx.clone(),
    ));
    tokio::spawn(read_loop(read_half, magic, disconnect_rx, Arc::clone(&peer), ctx));

    Ok(peer)
}

struct HandshakeInfo {
    version: u32,
    services: u64,
    timestamp: i64,
    user_agent: String,
    start_height: i32,
}

fn build_version(ctx: &PeerContext) -> Message {
    Message::Version(wire::VersionMessage {
        version: PROTOCOL_VERSION,
        services: ctx.tunables.services,
        timestamp: unix_now(),
        nonce: rand::random(),
        user_agent: format!(
            "/{}:{}/",
            ctx.tunables.user_agent_name, ctx.tunables.user_agent_version
        ),
        start_height: (ctx.newest_block)(),
        relay: false,
    })
}

async fn exchange_version(
    read_half: &mut OwnedReadHalf,
    write_half: &mut OwnedWriteHalf,
    magic: [u8; 4],
    ctx: &PeerContext,
) -> Result<HandshakeInfo, PeerError> {
    let mut remote: Option<HandshakeInfo> = None;
    let mut got_verack = false;
    while remote.is_none() || !got_verack {
        let (message, _) = read_message(read_half, magic, &ctx.net_totals).await?;
        match message {
            Message::Version(version) => {
                remote = Some(HandshakeInfo {
                    version: version.version,
                    services: version.services,
                    timestamp: version.timestamp,
                    user_agent: version.user_agent,
                    start_height: version.start_height,
                });
                write_message(write_half, magic, &Message::Verack, &ctx.net_totals).await?;
            }
            Message::Verack => got_verack = true,
            Message::Ping(nonce) => {
                write_message(write_half, magic, &Message::Pong(nonce), &ctx.net_totals).await?;
            }
            other => {
                trace!(
                    target: LOG_TARGET,
                    "ignoring {} during handshake",
                    other.command()
                );
            }
        }
    }
    Ok(remote.expect("loop exits with version"))
}

async fn write_message(
    write_half: &mut OwnedWriteHalf,
    magic: [u8; 4],
    message: &Message,
    net_totals: &NetTotals,
) -> Result<usize, PeerError> {
    let payload = message.encode_payload();
    let frame = wire::build_frame(magic, message.command(), &payload)?;
    write_half.write_all(&frame).await?;
    net_totals.add_sent(frame.len() as u64);
    Ok(frame.len())
}

async fn read_message(
    read_half: &mut OwnedReadHalf,
    magic: [u8; 4],
    net_totals: &NetTotals,
) -> Result<(Message, usize), PeerError> {
    let mut header = [0u8; ENVELOPE_SIZE];
    read_half.read_exact(&mut header).await?;
    let (command, length, checksum) = wire::parse_envelope(magic, &header)?;
    let mut payload = vec![0u8; length];
    read_half.read_exact(&mut payload).await?;
    wire::verify_checksum(&payload, &checksum)?;
    let bytes = ENVELOPE_SIZE + length;
    net_totals.add_received(bytes as u64);
    Ok((Message::decode(&command, &payload)?, bytes))
}

async fn write_loop(
    mut write_half: OwnedWriteHalf,
    magic: [u8; 4],
    mut outbox: mpsc::Receiver<Message>,
    mut disconnect: watch::Receiver<bool>,
    peer: PeerHandle,
    ctx: PeerContext,
) {
    loop {
        tokio::select! {
            changed = disconnect.changed() => {
                if changed.is_err() || *disconnect.borrow() {
                    break;
                }
            }
            message = outbox.recv() => {
                let Some(message) = message else { break };
                match write_message(&mut write_half, magic, &message, &ctx.net_totals).await {
                    Ok(bytes) => {
                        peer.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
                    }
                    Err(err) => {
                        debug!(target: LOG_TARGET, "write to {peer} failed: {err}");
                        peer.disconnect();
                        break;
                    }
                }
            }
        }
    }
}

async fn read_loop(
    mut read_half: OwnedReadHalf,
    magic: [u8; 4],
    mut disconnect: watch::Receiver<bool>,
    peer: PeerHandle,
    ctx: PeerContext,
) {
    loop {
        tokio::select! {
            changed = disconnect.changed() => {
                if changed.is_err() || *disconnect.borrow() {
                    break;
                }
            }
            message = read_message(&mut read_half, magic, &ctx.net_totals) => {
                match message {
                    Ok((message, bytes)) => {
                        peer.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
                        let message = Arc::new(message);
                        peer.publish(&message);
                        if !handle_message(&peer, &ctx, &message).await {
                            break;
                        }
                    }
                    Err(err) => {
                        debug!(target: LOG_TARGET, "read from {peer} failed: {err}");
                        break;
                    }
                }
            }
        }
    }

    peer.disconnect();
    ctx.addr_book.connected(peer.addr());
    let _ = ctx.sync_tx.send(SyncEvent::DonePeer(peer.id())).await;
    let _ = ctx.done_peers_tx.send(Arc::clone(&peer)).await;
    debug!(target: LOG_TARGET, "session for {peer} ended");
}

/// Dispatches one inbound message. Returns false to end the session.
async fn handle_message(peer: &PeerHandle, ctx: &PeerContext, message: &Arc<Message>) -> bool {
    match message.as_ref() {
        Message::Ping(nonce) => {
            peer.queue_message(Message::Pong(*nonce));
        }
        Message::Inv(invs) => return handle_inv(peer, ctx, invs).await,
        Message::Headers(headers) => {
            trace!(
                target: LOG_TARGET,
                "got headers with {} items from {peer}",
                headers.len()
            );
            let _ = ctx
                .sync_tx
                .send(SyncEvent::Headers {
                    peer: Arc::clone(peer),
                    headers: headers.clone(),
                })
                .await;
        }
        Message::CFHeaders(msg) => {
            trace!(
                target: LOG_TARGET,
                "got cfheaders with {} items from {peer}",
                msg.filter_hashes.len()
            );
            let _ = ctx
                .sync_tx
                .send(SyncEvent::CFHeaders {
                    peer: Arc::clone(peer),
                    msg: msg.clone(),
                })
                .await;
        }
        Message::Addr(entries) => return handle_addr(peer, ctx, entries),
        Message::GetData(invs) => handle_getdata(peer, ctx, invs),
        Message::FeeFilter(min_fee) => {
            if *min_fee < 0 || *min_fee > MAX_MONEY {
                debug!(
                    target: LOG_TARGET,
                    "peer {peer} sent an invalid feefilter {min_fee} -- disconnecting"
                );
                peer.disconnect();
                return false;
            }
            peer.fee_filter.store(*min_fee, Ordering::Relaxed);
        }
        Message::Reject(reject) => {
            debug!(
                target: LOG_TARGET,
                "peer {peer} rejected {}: {} ({:#x})",
                reject.message,
                reject.reason,
                reject.code
            );
        }
        // Blocks, filters, and pongs are observed through subscriptions.
        _ => {}
    }
    true
}

async fn handle_inv(peer: &PeerHandle, ctx: &PeerContext, invs: &[InventoryVector]) -> bool {
    let mut blocks = Vec::new();
    for inv in invs {
        match inv.inv_type {
            MSG_TX => {
                trace!(target: LOG_TARGET, "ignoring tx inv from {peer} -- SPV mode");
                if peer.protocol_version() >= BIP37_VERSION {
                    info!(
                        target: LOG_TARGET,
                        "peer {peer} is announcing transactions -- disconnecting"
                    );
                    peer.disconnect();
                    return false;
                }
            }
            MSG_BLOCK => blocks.push(*inv),
            _ => {}
        }
    }
    if let Some(last) = blocks.last() {
        if let Ok(mut announced) = peer.last_announced_block.lock() {
            *announced = Some(last.hash);
        }
    }
    if !blocks.is_empty() {
        let _ = ctx
            .sync_tx
            .send(SyncEvent::Inv {
                peer: Arc::clone(peer),
                inv: blocks,
            })
            .await;
    }
    true
}

fn handle_addr(peer: &PeerHandle, ctx: &PeerContext, entries: &[NetAddress]) -> bool {
    // The simulation network must not learn discovered peers.
    if ctx.params.network == Network::Simnet {
        return true;
    }
    if peer.protocol_version() < NET_ADDRESS_TIME_VERSION {
        return true;
    }
    if entries.is_empty() {
        warn!(
            target: LOG_TARGET,
            "addr message from {peer} does not contain any addresses"
        );
        peer.disconnect();
        return false;
    }
    peer.add_known_addresses(entries);
    ctx.addr_book.add_addresses(entries);
    true
}

fn handle_getdata(peer: &PeerHandle, ctx: &PeerContext, invs: &[InventoryVector]) {
    // Large inventory requests decay off within minutes; sustained bursts
    // cross the ban threshold.
    let transient = (invs.len() as u64 * 99 / MAX_INV_PER_MSG as u64) as u32;
    peer.add_ban_score(ctx, 0, transient, "getdata");

    // An SPV node keeps no blocks and, for now, no transactions to serve.
    // TODO: serve wallet transactions queued by publish_transaction once the
    // wallet relay integration lands.
    if !invs.is_empty() {
        peer.queue_message(Message::NotFound(invs.to_vec()));
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0)
}

/// A point-in-time view of one peer, returned by supervisor queries.
#[derive(Clone, Debug)]
pub struct PeerInfo {
    pub id: PeerId,
    pub addr: SocketAddr,
    pub persistent: bool,
    pub services: u64,
    pub protocol_version: u32,
    pub user_agent: String,
    pub last_block: i32,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

impl PeerInfo {
    pub fn from_peer(peer: &Peer) -> Self {
        Self {
            id: peer.id(),
            addr: peer.addr(),
            persistent: peer.persistent(),
            services: peer.services(),
            protocol_version: peer.protocol_version(),
            user_agent: peer.user_agent(),
            last_block: peer.last_block(),
            bytes_received: peer.bytes_received(),
            bytes_sent: peer.bytes_sent(),
        }
    }
}
