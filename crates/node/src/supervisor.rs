//! Peer supervisor: single owner of the peer set, ban list, and outbound
//! group counters. All mutations flow through its channels.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use log::{debug, info, trace, warn};
use spvd_consensus::Hash256;
use tokio::sync::{mpsc, oneshot, watch};

use crate::addrbook::group_key;
use crate::peer::{self, PeerContext, PeerHandle, PeerId, PeerInfo};
use crate::wire::NetAddress;

const LOG_TARGET: &str = "supervisor";

#[derive(Debug)]
pub enum SupervisorError {
    PeerNotFound,
    AlreadyConnected,
    ShuttingDown,
}

impl fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SupervisorError::PeerNotFound => write!(f, "peer not found"),
            SupervisorError::AlreadyConnected => write!(f, "peer already connected"),
            SupervisorError::ShuttingDown => write!(f, "server is shutting down"),
        }
    }
}

impl std::error::Error for SupervisorError {}

/// Propagates an accepted block to peers that announced it, keeping their
/// height estimates current for sync-peer selection.
#[derive(Clone, Copy, Debug)]
pub struct HeightsUpdate {
    pub hash: Hash256,
    pub height: i32,
    pub origin: Option<PeerId>,
}

pub enum PeerQuery {
    ConnectedCount(oneshot::Sender<usize>),
    OutboundGroupCount {
        key: String,
        reply: oneshot::Sender<usize>,
    },
    OutboundGroups(oneshot::Sender<HashMap<String, usize>>),
    AddedNodeInfo(oneshot::Sender<Vec<PeerInfo>>),
    Peers(oneshot::Sender<Vec<PeerHandle>>),
    DisconnectByAddr {
        addr: SocketAddr,
        reply: oneshot::Sender<Result<(), SupervisorError>>,
    },
    DisconnectById {
        id: PeerId,
        reply: oneshot::Sender<Result<(), SupervisorError>>,
    },
    RemoveByAddr {
        addr: SocketAddr,
        reply: oneshot::Sender<Result<(), SupervisorError>>,
    },
    RemoveById {
        id: PeerId,
        reply: oneshot::Sender<Result<(), SupervisorError>>,
    },
    Connect {
        addr: SocketAddr,
        permanent: bool,
        reply: oneshot::Sender<Result<(), SupervisorError>>,
    },
}

/// Supervisor-owned peer bookkeeping; nothing outside the run loop touches
/// it.
#[derive(Default)]
struct PeerState {
    outbound: HashMap<PeerId, PeerHandle>,
    persistent: HashMap<PeerId, PeerHandle>,
    banned: HashMap<IpAddr, Instant>,
    outbound_groups: HashMap<String, usize>,
}

impl PeerState {
    fn count(&self) -> usize {
        self.outbound.len() + self.persistent.len()
    }

    fn for_all_peers(&self, mut closure: impl FnMut(&PeerHandle)) {
        for peer in self.outbound.values() {
            closure(peer);
        }
        for peer in self.persistent.values() {
            closure(peer);
        }
    }

    fn all_peers(&self) -> Vec<PeerHandle> {
        let mut peers = Vec::with_capacity(self.count());
        self.for_all_peers(|peer| peers.push(Arc::clone(peer)));
        peers
    }

    fn find_by_addr(&self, addr: SocketAddr) -> Option<&PeerHandle> {
        self.outbound
            .values()
            .chain(self.persistent.values())
            .find(|peer| peer.addr() == addr)
    }

    fn bump_group(&mut self, key: String) {
        *self.outbound_groups.entry(key).or_insert(0) += 1;
    }

    fn drop_group(&mut self, key: &str) {
        if let Some(count) = self.outbound_groups.get_mut(key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.outbound_groups.remove(key);
            }
        }
    }
}

pub struct Supervisor {
    ctx: PeerContext,
    new_peers_rx: mpsc::Receiver<PeerHandle>,
    done_peers_rx: mpsc::Receiver<PeerHandle>,
    ban_peers_rx: mpsc::Receiver<PeerHandle>,
    heights_rx: mpsc::Receiver<HeightsUpdate>,
    query_rx: mpsc::Receiver<PeerQuery>,
    shutdown: watch::Receiver<bool>,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: PeerContext,
        new_peers_rx: mpsc::Receiver<PeerHandle>,
        done_peers_rx: mpsc::Receiver<PeerHandle>,
        ban_peers_rx: mpsc::Receiver<PeerHandle>,
        heights_rx: mpsc::Receiver<HeightsUpdate>,
        query_rx: mpsc::Receiver<PeerQuery>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            ctx,
            new_peers_rx,
            done_peers_rx,
            ban_peers_rx,
            heights_rx,
            query_rx,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let mut state = PeerState::default();
        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                Some(peer) = self.new_peers_rx.recv() => {
                    self.handle_add_peer(&mut state, peer);
                }
                Some(peer) = self.done_peers_rx.recv() => {
                    self.handle_done_peer(&mut state, &peer);
                }
                Some(peer) = self.ban_peers_rx.recv() => {
                    self.handle_ban_peer(&mut state, &peer);
                }
                Some(update) = self.heights_rx.recv() => {
                    handle_update_peer_heights(&state, update);
                }
                Some(query) = self.query_rx.recv() => {
                    self.handle_query(&mut state, query);
                }
            }
        }

        // Disconnect everything, then drain the input channels so no sender
        // is left waiting.
        state.for_all_peers(|peer| {
            trace!(target: LOG_TARGET, "shutdown peer {peer}");
            peer.disconnect();
        });
        while self.new_peers_rx.try_recv().is_ok() {}
        while self.done_peers_rx.try_recv().is_ok() {}
        while self.ban_peers_rx.try_recv().is_ok() {}
        while self.heights_rx.try_recv().is_ok() {}
        while self.query_rx.try_recv().is_ok() {}
        trace!(target: LOG_TARGET, "peer handler done");
    }

    fn handle_add_peer(&self, state: &mut PeerState, peer: PeerHandle) {
        if *self.shutdown.borrow() {
            info!(target: LOG_TARGET, "new peer {peer} ignored - server is shutting down");
            peer.disconnect();
            return;
        }

        let host = peer.addr().ip();
        if let Some(ban_end) = state.banned.get(&host).copied() {
            if Instant::now() < ban_end {
                debug!(
                    target: LOG_TARGET,
                    "peer {host} is banned for another {:?} - disconnecting",
                    ban_end.saturating_duration_since(Instant::now())
                );
                peer.disconnect();
                return;
            }
            info!(target: LOG_TARGET, "peer {host} is no longer banned");
            state.banned.remove(&host);
        }

        if state.count() >= self.ctx.tunables.max_peers {
            info!(
                target: LOG_TARGET,
                "max peers reached [{}] - disconnecting peer {peer}",
                self.ctx.tunables.max_peers
            );
            peer.disconnect();
            return;
        }

        debug!(target: LOG_TARGET, "new peer {peer}");
        state.bump_group(group_key(host));
        if peer.persistent() {
            state.persistent.insert(peer.id(), peer);
        } else {
            state.outbound.insert(peer.id(), peer);
        }
    }

    fn handle_done_peer(&self, state: &mut PeerState, peer: &PeerHandle) {
        let list = if peer.persistent() {
            &mut state.persistent
        } else {
            &mut state.outbound
        };
        if list.remove(&peer.id()).is_some() {
            state.drop_group(&group_key(peer.addr().ip()));
            debug!(target: LOG_TARGET, "removed peer {peer}");
        }
    }

    fn handle_ban_peer(&self, state: &mut PeerState, peer: &PeerHandle) {
        let host = peer.addr().ip();
        info!(
            target: LOG_TARGET,
            "banned peer {host} for {:?}",
            self.ctx.tunables.ban_duration
        );
        state
            .banned
            .insert(host, Instant::now() + self.ctx.tunables.ban_duration);
    }

    fn handle_query(&self, state: &mut PeerState, query: PeerQuery) {
        match query {
            PeerQuery::ConnectedCount(reply) => {
                let _ = reply.send(state.count());
            }
            PeerQuery::OutboundGroupCount { key, reply } => {
                let _ = reply.send(state.outbound_groups.get(&key).copied().unwrap_or(0));
            }
            PeerQuery::OutboundGroups(reply) => {
                let _ = reply.send(state.outbound_groups.clone());
            }
            PeerQuery::AddedNodeInfo(reply) => {
                let info = state
                    .persistent
                    .values()
                    .map(|peer| PeerInfo::from_peer(peer))
                    .collect();
                let _ = reply.send(info);
            }
            PeerQuery::Peers(reply) => {
                let _ = reply.send(state.all_peers());
            }
            PeerQuery::DisconnectByAddr { addr, reply } => {
                let _ = reply.send(disconnect_peer(state, |peer| peer.addr() == addr));
            }
            PeerQuery::DisconnectById { id, reply } => {
                let _ = reply.send(disconnect_peer(state, |peer| peer.id() == id));
            }
            PeerQuery::RemoveByAddr { addr, reply } => {
                let _ = reply.send(remove_persistent(state, |peer| peer.addr() == addr));
            }
            PeerQuery::RemoveById { id, reply } => {
                let _ = reply.send(remove_persistent(state, |peer| peer.id() == id));
            }
            PeerQuery::Connect {
                addr,
                permanent,
                reply,
            } => {
                if *self.shutdown.borrow() {
                    let _ = reply.send(Err(SupervisorError::ShuttingDown));
                    return;
                }
                if state.find_by_addr(addr).is_some() {
                    let _ = reply.send(Err(SupervisorError::AlreadyConnected));
                    return;
                }
                let ctx = self.ctx.clone();
                tokio::spawn(async move {
                    match peer::connect_outbound(addr, permanent, ctx).await {
                        Ok(_) => {
                            let _ = reply.send(Ok(()));
                        }
                        Err(err) => {
                            warn!(target: LOG_TARGET, "connect to {addr} failed: {err}");
                            let _ = reply.send(Err(SupervisorError::PeerNotFound));
                        }
                    }
                });
            }
        }
    }
}

fn handle_update_peer_heights(state: &PeerState, update: HeightsUpdate) {
    state.for_all_peers(|peer| {
        if Some(peer.id()) == update.origin {
            return;
        }
        let Some(announced) = peer.last_announced_block() else {
            return;
        };
        if announced == update.hash {
            peer.update_last_block_height(update.height);
            peer.clear_last_announced_block();
        }
    });
}

fn disconnect_peer(
    state: &mut PeerState,
    compare: impl Fn(&PeerHandle) -> bool,
) -> Result<(), SupervisorError> {
    let found = state
        .outbound
        .values()
        .chain(state.persistent.values())
        .find(|peer| compare(peer))
        .cloned();
    match found {
        Some(peer) => {
            peer.disconnect();
            Ok(())
        }
        None => Err(SupervisorError::PeerNotFound),
    }
}

fn remove_persistent(
    state: &mut PeerState,
    compare: impl Fn(&PeerHandle) -> bool,
) -> Result<(), SupervisorError> {
    let id = state
        .persistent
        .values()
        .find(|peer| compare(peer))
        .map(|peer| peer.id());
    match id {
        Some(id) => {
            if let Some(peer) = state.persistent.remove(&id) {
                state.drop_group(&group_key(peer.addr().ip()));
                peer.disconnect();
            }
            Ok(())
        }
        None => Err(SupervisorError::PeerNotFound),
    }
}

/// Keeps the outbound slots filled: persistent targets are redialed with
/// backoff, and on discovery-enabled networks the address book supplies
/// candidates from unoccupied outbound groups.
pub async fn dial_loop(
    ctx: PeerContext,
    query_tx: mpsc::Sender<PeerQuery>,
    persistent_targets: Vec<SocketAddr>,
    connect_only: bool,
    mut shutdown: watch::Receiver<bool>,
) {
    let retry_interval = ctx.tunables.connection_retry_interval;
    let mut attempts: HashMap<SocketAddr, u32> = HashMap::new();
    let mut next_try: HashMap<SocketAddr, Instant> = HashMap::new();
    let in_flight: DialSet = Arc::new(Mutex::new(HashSet::new()));

    if !ctx.tunables.disable_dns_seed && !connect_only && !ctx.params.dns_seeds.is_empty() {
        seed_from_dns(&ctx).await;
    }

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
            _ = tokio::time::sleep(retry_interval) => {}
        }
        if *shutdown.borrow() {
            return;
        }

        let Some(connected) = query_peers_list(&query_tx).await else {
            return;
        };
        let connected_addrs: Vec<SocketAddr> =
            connected.iter().map(|peer| peer.addr()).collect();

        // Redial persistent targets that are due.
        for target in &persistent_targets {
            if connected_addrs.contains(target) {
                attempts.remove(target);
                continue;
            }
            let due = next_try
                .get(target)
                .map(|at| Instant::now() >= *at)
                .unwrap_or(true);
            if !due {
                continue;
            }
            if !mark_in_flight(&in_flight, *target) {
                continue;
            }
            let tries = attempts.entry(*target).or_insert(0);
            *tries = tries.saturating_add(1);
            next_try.insert(
                *target,
                Instant::now() + retry_interval * (*tries).min(12),
            );
            let ctx = ctx.clone();
            let target = *target;
            let in_flight = Arc::clone(&in_flight);
            tokio::spawn(async move {
                if let Err(err) = peer::connect_outbound(target, true, ctx).await {
                    debug!(target: LOG_TARGET, "dial {target} failed: {err}");
                }
                clear_in_flight(&in_flight, target);
            });
        }

        if connect_only {
            continue;
        }

        // Top up discovered outbound peers, diversifying across groups.
        if connected.len() < ctx.tunables.target_outbound {
            let Some(groups) = query_outbound_groups(&query_tx).await else {
                return;
            };
            if let Some(addr) = ctx
                .addr_book
                .get_address(ctx.tunables.required_services, &groups)
            {
                if !connected_addrs.contains(&addr) && mark_in_flight(&in_flight, addr) {
                    let ctx = ctx.clone();
                    let in_flight = Arc::clone(&in_flight);
                    tokio::spawn(async move {
                        if let Err(err) = peer::connect_outbound(addr, false, ctx).await {
                            debug!(target: LOG_TARGET, "dial {addr} failed: {err}");
                        }
                        clear_in_flight(&in_flight, addr);
                    });
                }
            }
        }
    }
}

/// Addresses with a dial in progress, so one slow handshake cannot produce
/// duplicate connections.
type DialSet = Arc<Mutex<HashSet<SocketAddr>>>;

fn mark_in_flight(in_flight: &DialSet, addr: SocketAddr) -> bool {
    in_flight
        .lock()
        .map(|mut set| set.insert(addr))
        .unwrap_or(false)
}

fn clear_in_flight(in_flight: &DialSet, addr: SocketAddr) {
    if let Ok(mut set) = in_flight.lock() {
        set.remove(&addr);
    }
}

async fn query_peers_list(query_tx: &mpsc::Sender<PeerQuery>) -> Option<Vec<PeerHandle>> {
    let (reply_tx, reply_rx) = oneshot::channel();
    query_tx.send(PeerQuery::Peers(reply_tx)).await.ok()?;
    reply_rx.await.ok()
}

async fn query_outbound_groups(
    query_tx: &mpsc::Sender<PeerQuery>,
) -> Option<HashMap<String, usize>> {
    let (reply_tx, reply_rx) = oneshot::channel();
    query_tx
        .send(PeerQuery::OutboundGroups(reply_tx))
        .await
        .ok()?;
    reply_rx.await.ok()
}

/// Resolves the configured DNS seeds into the address book. All seeded
/// entries are assumed to carry the required services, matching the
/// optimism of the seeds themselves.
async fn seed_from_dns(ctx: &PeerContext) {
    let port = ctx.params.default_port;
    for seed in &ctx.params.dns_seeds {
        match tokio::net::lookup_host((*seed, port)).await {
            Ok(addrs) => {
                let entries: Vec<NetAddress> = addrs
                    .map(|addr| NetAddress {
                        timestamp: 0,
                        services: ctx.tunables.required_services,
                        addr,
                    })
                    .collect();
                let added = ctx.addr_book.add_addresses(&entries);
                debug!(target: LOG_TARGET, "dns seed {seed} supplied {added} addresses");
            }
            Err(err) => {
                debug!(target: LOG_TARGET, "dns seed {seed} failed: {err}");
            }
        }
    }
}
