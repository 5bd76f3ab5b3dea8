//! The chain service: construction, lifecycle, and the consumer-facing API.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use spvd_chainstate::{BlockStamp, ChainStateError, HeaderStore};
use spvd_consensus::Hash256;
use spvd_primitives::block::{Block, BlockHeader};
use spvd_primitives::hash::{sha256d, sha256d_pair};
use spvd_storage::KeyValueStore;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::addrbook::AddressBook;
use crate::config::{resolve_peer_addr, Config, ConfigError, Tunables};
use crate::peer::{NetTotals, PeerContext, PeerHandle, PeerId, PeerInfo};
use crate::query::{query_peers, QueryOptions};
use crate::supervisor::{self, HeightsUpdate, PeerQuery, Supervisor, SupervisorError};
use crate::sync::{BlockManager, SyncStatus};
use crate::timesource::MedianTimeSource;
use crate::wire::{InventoryVector, Message, MSG_BLOCK};

const LOG_TARGET: &str = "chainsvc";

/// How stale the tip may be while the service still considers itself
/// current.
const CURRENT_TIP_AGE_SECS: i64 = 24 * 60 * 60;
/// Initial delay before the first transaction rebroadcast pass.
const REBROADCAST_INITIAL_SECS: u64 = 5 * 60;

const MISBEHAVIOR_SCORE: u32 = 100;

#[derive(Debug)]
pub enum ServiceError {
    Config(ConfigError),
    Chain(ChainStateError),
    Supervisor(SupervisorError),
    NotRunning,
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceError::Config(err) => write!(f, "{err}"),
            ServiceError::Chain(err) => write!(f, "{err}"),
            ServiceError::Supervisor(err) => write!(f, "{err}"),
            ServiceError::NotRunning => write!(f, "chain service is not running"),
        }
    }
}

impl std::error::Error for ServiceError {}

impl From<ConfigError> for ServiceError {
    fn from(err: ConfigError) -> Self {
        ServiceError::Config(err)
    }
}

impl From<ChainStateError> for ServiceError {
    fn from(err: ChainStateError) -> Self {
        ServiceError::Chain(err)
    }
}

impl From<SupervisorError> for ServiceError {
    fn from(err: SupervisorError) -> Self {
        ServiceError::Supervisor(err)
    }
}

struct PendingTasks<S> {
    supervisor: Supervisor,
    block_manager: BlockManager<S>,
    persistent_targets: Vec<SocketAddr>,
    connect_only: bool,
}

/// SPV chain service: maintains the verified header chain and the two
/// committed-filter header chains by querying outbound peers, and answers
/// header, filter, and block lookups for consumers.
pub struct ChainService<S: KeyValueStore + 'static> {
    store: Arc<HeaderStore<S>>,
    tunables: Arc<Tunables>,
    ctx: PeerContext,
    query_tx: mpsc::Sender<PeerQuery>,
    heights_tx: mpsc::Sender<HeightsUpdate>,
    status_rx: watch::Receiver<SyncStatus>,
    quit_tx: watch::Sender<bool>,
    started: AtomicBool,
    stopped: AtomicBool,
    pending: Mutex<Option<PendingTasks<S>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: KeyValueStore + 'static> ChainService<S> {
    /// Builds a chain service over `backend` for the configured network.
    /// Fails when a configured peer address cannot be resolved or the store
    /// cannot be initialized. Call `start` to begin syncing.
    pub fn new(backend: S, config: Config) -> Result<Self, ServiceError> {
        let Config {
            data_dir,
            chain_params,
            connect_peers,
            add_peers,
            mut tunables,
        } = config;

        if tunables.target_outbound > tunables.max_peers {
            tunables.target_outbound = tunables.max_peers;
        }
        let params = Arc::new(chain_params);
        let tunables = Arc::new(tunables);

        let store = Arc::new(HeaderStore::new(backend));
        store.ensure_genesis(&params)?;

        let default_port = params.default_port;
        let resolve_all = |addrs: &[String]| -> Result<Vec<SocketAddr>, ConfigError> {
            addrs
                .iter()
                .map(|addr| resolve_peer_addr(addr, default_port))
                .collect()
        };
        let connect_addrs = resolve_all(&connect_peers)?;
        let add_addrs = resolve_all(&add_peers)?;
        let connect_only = !connect_addrs.is_empty();
        let persistent_targets = if connect_only {
            connect_addrs
        } else {
            add_addrs
        };

        std::fs::create_dir_all(&data_dir).ok();
        let addr_book = Arc::new(AddressBook::open(data_dir.join("peers.json")));
        let time_source = Arc::new(MedianTimeSource::new());
        let net_totals = Arc::new(NetTotals::default());

        let (new_peers_tx, new_peers_rx) = mpsc::channel(tunables.max_peers.max(1));
        let (done_peers_tx, done_peers_rx) = mpsc::channel(tunables.max_peers.max(1));
        let (ban_peers_tx, ban_peers_rx) = mpsc::channel(tunables.max_peers.max(1));
        let (heights_tx, heights_rx) = mpsc::channel(64);
        let (query_tx, query_rx) = mpsc::channel(64);
        let (sync_tx, sync_rx) = mpsc::channel(256);
        let (quit_tx, quit_rx) = watch::channel(false);

        let newest_block: Arc<dyn Fn() -> i32 + Send + Sync> = {
            let store = Arc::clone(&store);
            Arc::new(move || {
                store
                    .best_snapshot()
                    .map(|stamp| stamp.height as i32)
                    .unwrap_or(0)
            })
        };
        let ctx = PeerContext {
            params: Arc::clone(&params),
            tunables: Arc::clone(&tunables),
            time_source,
            addr_book,
            net_totals,
            sync_tx,
            new_peers_tx,
            done_peers_tx,
            ban_peers_tx,
            newest_block,
        };

        let (block_manager, status_rx) = BlockManager::new(
            Arc::clone(&store),
            ctx.clone(),
            sync_rx,
            heights_tx.clone(),
            quit_rx.clone(),
        )?;
        let supervisor = Supervisor::new(
            ctx.clone(),
            new_peers_rx,
            done_peers_rx,
            ban_peers_rx,
            heights_rx,
            query_rx,
            quit_rx,
        );

        Ok(Self {
            store,
            tunables,
            ctx,
            query_tx,
            heights_tx,
            status_rx,
            quit_tx,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            pending: Mutex::new(Some(PendingTasks {
                supervisor,
                block_manager,
                persistent_targets,
                connect_only,
            })),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Begins connecting to peers and syncing the chain. Idempotent.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(pending) = self.pending.lock().ok().and_then(|mut slot| slot.take()) else {
            return;
        };
        info!(target: LOG_TARGET, "starting chain service");

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(pending.supervisor.run()));
        tasks.push(tokio::spawn(pending.block_manager.run()));
        tasks.push(tokio::spawn(supervisor::dial_loop(
            self.ctx.clone(),
            self.query_tx.clone(),
            pending.persistent_targets,
            pending.connect_only,
            self.quit_tx.subscribe(),
        )));
        tasks.push(tokio::spawn(rebroadcast_loop(self.quit_tx.subscribe())));
        if let Ok(mut slot) = self.tasks.lock() {
            *slot = tasks;
        }
    }

    /// Shuts down all tasks, disconnecting every peer, and persists the
    /// address book. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(target: LOG_TARGET, "stopping chain service");
        let _ = self.quit_tx.send(true);
        let tasks = self
            .tasks
            .lock()
            .map(|mut slot| std::mem::take(&mut *slot))
            .unwrap_or_default();
        for task in tasks {
            let _ = task.await;
        }
        self.ctx.addr_book.save();
    }

    // Header-store lookups.

    pub fn best_snapshot(&self) -> Result<BlockStamp, ChainStateError> {
        self.store.best_snapshot()
    }

    pub fn get_block_by_height(
        &self,
        height: u32,
    ) -> Result<Option<(BlockHeader, u32)>, ChainStateError> {
        self.store.get_block_by_height(height)
    }

    pub fn get_block_by_hash(
        &self,
        hash: &Hash256,
    ) -> Result<Option<(BlockHeader, u32)>, ChainStateError> {
        self.store.get_block_by_hash(hash)
    }

    pub fn latest_block(&self) -> Result<(BlockHeader, u32), ChainStateError> {
        self.store.latest_block()
    }

    pub fn get_basic_header(&self, hash: &Hash256) -> Result<Option<Hash256>, ChainStateError> {
        self.store.get_basic_header(hash)
    }

    pub fn get_ext_header(&self, hash: &Hash256) -> Result<Option<Hash256>, ChainStateError> {
        self.store.get_ext_header(hash)
    }

    pub fn get_basic_filter(&self, hash: &Hash256) -> Result<Option<Vec<u8>>, ChainStateError> {
        self.store.get_basic_filter(hash)
    }

    pub fn get_ext_filter(&self, hash: &Hash256) -> Result<Option<Vec<u8>>, ChainStateError> {
        self.store.get_ext_filter(hash)
    }

    pub fn latest_block_locator(&self) -> Result<Vec<Hash256>, ChainStateError> {
        self.store.latest_block_locator()
    }

    /// Whether the service believes its view of the network is current: the
    /// tip has reached the heights peers advertised when sync began, its
    /// timestamp is recent, and both filter-header chains are caught up.
    pub fn is_current(&self) -> bool {
        let status: SyncStatus = *self.status_rx.borrow();
        if !status.caught_up {
            return false;
        }
        if (status.header_height as i64) < status.highest_peer_at_start as i64 {
            return false;
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_secs() as i64)
            .unwrap_or(0);
        if (status.header_time as i64) < now - CURRENT_TIP_AGE_SECS {
            return false;
        }
        status.basic_height == status.header_height && status.ext_height == status.header_height
    }

    // Peer-set queries, answered by the supervisor.

    pub async fn connected_count(&self) -> usize {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .query_tx
            .send(PeerQuery::ConnectedCount(reply_tx))
            .await
            .is_err()
        {
            return 0;
        }
        reply_rx.await.unwrap_or(0)
    }

    pub async fn outbound_group_count(&self, key: String) -> usize {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .query_tx
            .send(PeerQuery::OutboundGroupCount { key, reply: reply_tx })
            .await
            .is_err()
        {
            return 0;
        }
        reply_rx.await.unwrap_or(0)
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.peer_handles()
            .await
            .iter()
            .map(|peer| PeerInfo::from_peer(peer))
            .collect()
    }

    pub async fn added_node_info(&self) -> Vec<PeerInfo> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .query_tx
            .send(PeerQuery::AddedNodeInfo(reply_tx))
            .await
            .is_err()
        {
            return Vec::new();
        }
        reply_rx.await.unwrap_or_default()
    }

    pub async fn connect_node(&self, addr: &str, permanent: bool) -> Result<(), ServiceError> {
        let addr = resolve_peer_addr(addr, self.ctx.params.default_port)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.query_tx
            .send(PeerQuery::Connect {
                addr,
                permanent,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ServiceError::NotRunning)?;
        reply_rx.await.map_err(|_| ServiceError::NotRunning)??;
        Ok(())
    }

    pub async fn disconnect_node_by_addr(&self, addr: SocketAddr) -> Result<(), ServiceError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.query_tx
            .send(PeerQuery::DisconnectByAddr { addr, reply: reply_tx })
            .await
            .map_err(|_| ServiceError::NotRunning)?;
        reply_rx.await.map_err(|_| ServiceError::NotRunning)??;
        Ok(())
    }

    pub async fn disconnect_node_by_id(&self, id: PeerId) -> Result<(), ServiceError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.query_tx
            .send(PeerQuery::DisconnectById { id, reply: reply_tx })
            .await
            .map_err(|_| ServiceError::NotRunning)?;
        reply_rx.await.map_err(|_| ServiceError::NotRunning)??;
        Ok(())
    }

    pub async fn remove_node_by_addr(&self, addr: SocketAddr) -> Result<(), ServiceError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.query_tx
            .send(PeerQuery::RemoveByAddr { addr, reply: reply_tx })
            .await
            .map_err(|_| ServiceError::NotRunning)?;
        reply_rx.await.map_err(|_| ServiceError::NotRunning)??;
        Ok(())
    }

    pub async fn remove_node_by_id(&self, id: PeerId) -> Result<(), ServiceError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.query_tx
            .send(PeerQuery::RemoveById { id, reply: reply_tx })
            .await
            .map_err(|_| ServiceError::NotRunning)?;
        reply_rx.await.map_err(|_| ServiceError::NotRunning)??;
        Ok(())
    }

    /// Runs a closure over every connected peer.
    pub async fn for_all_peers(&self, mut closure: impl FnMut(&PeerHandle)) {
        for peer in self.peer_handles().await {
            closure(&peer);
        }
    }

    /// Propagates a newly accepted block to peers that announced it.
    pub async fn update_peer_heights(
        &self,
        hash: Hash256,
        height: i32,
        origin: Option<PeerId>,
    ) {
        let _ = self
            .heights_tx
            .send(HeightsUpdate {
                hash,
                height,
                origin,
            })
            .await;
    }

    /// Bans a connected peer's host and disconnects it.
    pub fn ban_peer(&self, peer: &PeerHandle) {
        let _ = self.ctx.ban_peers_tx.try_send(Arc::clone(peer));
        peer.disconnect();
    }

    pub fn net_totals(&self) -> (u64, u64) {
        self.ctx.net_totals.snapshot()
    }

    /// Hands a raw transaction to every connected peer, fire-and-forget.
    ///
    /// TODO: integrate with the wallet's unmined-transaction store so
    /// rejected and double-spent transactions are tracked and rebroadcast.
    pub async fn publish_transaction(&self, raw_tx: Vec<u8>) {
        let message = Message::Tx(raw_tx);
        for peer in self.peer_handles().await {
            peer.queue_message(message.clone());
        }
    }

    /// Fetches a committed filter for a block already in the header store,
    /// from the store when cached, otherwise from the network. The returned
    /// filter always links into the stored filter-header chain.
    pub async fn get_cf_filter(&self, block_hash: Hash256, extended: bool) -> Option<Vec<u8>> {
        if let Ok(Some(filter)) = self.store.filter(&block_hash, extended) {
            return Some(filter);
        }
        let (header, _) = self.store.get_block_by_hash(&block_hash).ok().flatten()?;
        if header.hash() != block_hash {
            return None;
        }
        let cur_header = self.store.filter_header(&block_hash, extended).ok().flatten()?;
        let prev_header = self
            .store
            .filter_header(&header.prev_block, extended)
            .ok()
            .flatten()?;

        let found: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));
        let check_found = Arc::clone(&found);
        let ctx = self.ctx.clone();
        query_peers(
            self.peer_handles().await,
            |peer| peer.connected(),
            Message::GetCFilter {
                block_hash,
                extended,
            },
            move |peer, message, quit| {
                let Message::CFilter(reply) = message else {
                    return;
                };
                if reply.extended != extended || reply.block_hash != block_hash {
                    return;
                }
                let filter_hash = sha256d(&reply.filter);
                if sha256d_pair(&filter_hash, &prev_header) != cur_header {
                    debug!(
                        target: LOG_TARGET,
                        "filter from {peer} does not link into the header chain"
                    );
                    peer.add_ban_score(&ctx, MISBEHAVIOR_SCORE, 0, "bad cfilter");
                    return;
                }
                if let Ok(mut slot) = check_found.lock() {
                    *slot = Some(reply.filter.clone());
                }
                quit.close();
            },
            QueryOptions {
                timeout: self.tunables.query_timeout,
            },
        )
        .await;

        let filter = found.lock().ok().and_then(|mut slot| slot.take())?;
        if let Err(err) = self.store.put_filter(&block_hash, &filter, extended) {
            warn!(target: LOG_TARGET, "persisting fetched filter failed: {err}");
        }
        Some(filter)
    }

    /// Fetches a full block from the network, one peer at a time, validating
    /// it against the stored header. The block is returned without being
    /// persisted; the store holds headers only.
    pub async fn get_block_from_network(&self, block_hash: Hash256) -> Option<Block> {
        let (header, _) = self.store.get_block_by_hash(&block_hash).ok().flatten()?;
        if header.hash() != block_hash {
            return None;
        }

        let found: Arc<Mutex<Option<Block>>> = Arc::new(Mutex::new(None));
        let check_found = Arc::clone(&found);
        let ctx = self.ctx.clone();
        query_peers(
            self.peer_handles().await,
            |peer| peer.connected(),
            Message::GetData(vec![InventoryVector {
                inv_type: MSG_BLOCK,
                hash: block_hash,
            }]),
            move |peer, message, quit| {
                let Message::Block(block) = message else {
                    return;
                };
                if block.header.hash() != block_hash {
                    return;
                }
                if block.compute_merkle_root() != header.merkle_root {
                    debug!(
                        target: LOG_TARGET,
                        "block from {peer} has a bad merkle root"
                    );
                    peer.add_ban_score(&ctx, MISBEHAVIOR_SCORE, 0, "bad block merkle root");
                    return;
                }
                if let Ok(mut slot) = check_found.lock() {
                    *slot = Some(block.clone());
                }
                quit.close();
            },
            QueryOptions {
                timeout: self.tunables.query_timeout,
            },
        )
        .await;

        let block = found.lock().ok().and_then(|mut slot| slot.take());
        if block.is_some() {
            debug!(target: LOG_TARGET, "got block from network");
        }
        block
    }

    async fn peer_handles(&self) -> Vec<PeerHandle> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .query_tx
            .send(PeerQuery::Peers(reply_tx))
            .await
            .is_err()
        {
            return Vec::new();
        }
        reply_rx.await.unwrap_or_default()
    }
}

/// Periodic rebroadcast of published transactions that have not yet made it
/// into a block.
///
/// TODO: wire up the pending-inventory bookkeeping once wallet relay exists;
/// until then the timer only structures the shutdown path.
async fn rebroadcast_loop(mut shutdown: watch::Receiver<bool>) {
    let mut timer = tokio::time::interval(Duration::from_secs(REBROADCAST_INITIAL_SECS));
    timer.tick().await;
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = timer.tick() => {}
        }
    }
}
