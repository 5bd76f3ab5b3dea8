//! Header-synchronization engine: drives block-header download across
//! peers, arbitrates forks by cumulative work and checkpoints, and keeps the
//! two committed-filter header chains in lockstep with the block chain.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info, trace, warn};
use primitive_types::U256;
use spvd_chainstate::{BlockStamp, ChainStateError, HeaderStore};
use spvd_consensus::constants::{
    MAX_HEADERS_PER_MSG, MAX_TIME_OFFSET_SECS, MEDIAN_TIME_SPAN, NODE_CF,
};
use spvd_consensus::{hash256_to_hex, Hash256};
use spvd_pow::{block_proof, hash_meets_target, next_work_required, u256_to_compact, HeaderInfo};
use spvd_primitives::block::BlockHeader;
use spvd_primitives::hash::sha256d_pair;
use spvd_storage::KeyValueStore;
use tokio::sync::{mpsc, watch};

use crate::peer::{PeerContext, PeerHandle, PeerId};
use crate::supervisor::HeightsUpdate;
use crate::wire::{CFHeadersMessage, InventoryVector, Message};

const LOG_TARGET: &str = "sync";

/// Ban-score values for the misbehavior classes the engine can observe.
const SCORE_CHECKPOINT_MISMATCH: u32 = 100;
const SCORE_INVALID_HEADER: u32 = 50;
const SCORE_BAD_CFHEADERS: u32 = 100;
const SCORE_UNSOLICITED: u32 = 20;
const SCORE_DISCONNECTED_BATCH: u32 = 10;

/// The placeholder written for the genesis filter headers until a peer
/// reports the real anchor.
const GENESIS_FILTER_PLACEHOLDER: Hash256 = [0u8; 32];

pub enum SyncEvent {
    NewPeer(PeerHandle),
    DonePeer(PeerId),
    Headers {
        peer: PeerHandle,
        headers: Vec<BlockHeader>,
    },
    Inv {
        peer: PeerHandle,
        inv: Vec<InventoryVector>,
    },
    CFHeaders {
        peer: PeerHandle,
        msg: CFHeadersMessage,
    },
}

/// Published snapshot consumed by `ChainService::is_current`.
#[derive(Clone, Copy, Debug)]
pub struct SyncStatus {
    pub header_height: u32,
    pub header_time: u32,
    pub basic_height: u32,
    pub ext_height: u32,
    pub highest_peer_at_start: i32,
    pub caught_up: bool,
}

/// A header accepted onto a side branch, kept in memory until its branch
/// either wins or is abandoned.
#[derive(Clone)]
struct BranchHeader {
    header: BlockHeader,
    height: u32,
    fork_height: u32,
    /// Cumulative work of the branch above the fork point.
    work: U256,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct CfhRequest {
    extended: bool,
    stop_hash: Hash256,
}

struct CfhReply {
    peer_id: PeerId,
    prev_filter_header: Hash256,
    filter_hashes: Vec<Hash256>,
}

/// An in-flight cfheaders range with the evidence gathered so far.
struct CfhWindow {
    extended: bool,
    stop_hash: Hash256,
    start_height: u32,
    block_hashes: Vec<Hash256>,
    asked: usize,
    replies: Vec<CfhReply>,
    deadline: Instant,
}

pub struct BlockManager<S> {
    store: Arc<HeaderStore<S>>,
    ctx: PeerContext,
    events_rx: mpsc::Receiver<SyncEvent>,
    heights_tx: mpsc::Sender<HeightsUpdate>,
    status_tx: watch::Sender<SyncStatus>,
    shutdown: watch::Receiver<bool>,

    peers: HashMap<PeerId, PeerHandle>,
    sync_peer: Option<PeerId>,
    header_tip: BlockStamp,
    header_tip_time: u32,
    highest_peer_at_start: i32,
    caught_up: bool,

    /// Rolling window of best-chain headers for retarget validation.
    window: VecDeque<HeaderInfo>,
    /// Side-branch headers by hash.
    branch: HashMap<Hash256, BranchHeader>,

    /// Filter-chain cursors: basic at 0, extended at 1.
    filter_heights: [u32; 2],
    /// Outstanding cfheaders windows, at most one per chain.
    cfh_windows: Vec<CfhWindow>,
    /// Per-peer FIFO of issued cfheaders requests.
    cfh_pending: HashMap<PeerId, VecDeque<CfhRequest>>,
}

impl<S: KeyValueStore> BlockManager<S> {
    pub fn new(
        store: Arc<HeaderStore<S>>,
        ctx: PeerContext,
        events_rx: mpsc::Receiver<SyncEvent>,
        heights_tx: mpsc::Sender<HeightsUpdate>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(Self, watch::Receiver<SyncStatus>), ChainStateError> {
        let header_tip = store.best_snapshot()?;
        let (tip_header, _) = store.latest_block()?;
        let filter_heights = [
            filter_chain_height(&store, &header_tip, false)?,
            filter_chain_height(&store, &header_tip, true)?,
        ];
        let window = bootstrap_window(&store, &header_tip)?;
        let status = SyncStatus {
            header_height: header_tip.height,
            header_time: tip_header.time,
            basic_height: filter_heights[0],
            ext_height: filter_heights[1],
            highest_peer_at_start: 0,
            caught_up: false,
        };
        let (status_tx, status_rx) = watch::channel(status);
        Ok((
            Self {
                store,
                ctx,
                events_rx,
                heights_tx,
                status_tx,
                shutdown,
                peers: HashMap::new(),
                sync_peer: None,
                header_tip,
                header_tip_time: tip_header.time,
                highest_peer_at_start: 0,
                caught_up: false,
                window,
                branch: HashMap::new(),
                filter_heights,
                cfh_windows: Vec::new(),
                cfh_pending: HashMap::new(),
            },
            status_rx,
        ))
    }

    pub async fn run(mut self) {
        loop {
            let deadline = self
                .cfh_windows
                .iter()
                .map(|window| window.deadline)
                .min();
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                event = self.events_rx.recv() => {
                    let Some(event) = event else { break };
                    self.handle_event(event);
                }
                _ = sleep_until_instant(deadline), if deadline.is_some() => {
                    self.process_deadlines();
                }
            }
        }
        trace!(target: LOG_TARGET, "block manager done");
    }

    fn handle_event(&mut self, event: SyncEvent) {
        match event {
            SyncEvent::NewPeer(peer) => self.handle_new_peer(peer),
            SyncEvent::DonePeer(id) => self.handle_done_peer(id),
            SyncEvent::Headers { peer, headers } => self.handle_headers(&peer, headers),
            SyncEvent::Inv { peer, inv } => self.handle_inv(&peer, &inv),
            SyncEvent::CFHeaders { peer, msg } => self.handle_cfheaders(&peer, msg),
        }
    }

    fn handle_new_peer(&mut self, peer: PeerHandle) {
        debug!(target: LOG_TARGET, "new sync candidate {peer}");
        self.peers.insert(peer.id(), peer);
        self.select_sync_peer();
    }

    fn handle_done_peer(&mut self, id: PeerId) {
        self.peers.remove(&id);
        self.cfh_pending.remove(&id);
        if self.sync_peer == Some(id) {
            self.sync_peer = None;
            self.select_sync_peer();
        }
    }

    /// Re-evaluates sync-peer candidacy: committed-filter-capable peers at
    /// or above our tip, preferring the greatest advertised height, then the
    /// earliest connection.
    fn select_sync_peer(&mut self) {
        let required = self.ctx.tunables.required_services;
        let tip_height = self.header_tip.height as i32;
        let best = self
            .peers
            .values()
            .filter(|peer| peer.services() & required == required)
            .filter(|peer| peer.last_block() >= tip_height)
            .min_by_key(|peer| (std::cmp::Reverse(peer.last_block()), peer.connected_at()))
            .map(|peer| Arc::clone(peer));

        let Some(peer) = best else {
            if self.sync_peer.is_none() {
                debug!(target: LOG_TARGET, "no sync peer available");
            }
            return;
        };
        if self.sync_peer == Some(peer.id()) {
            return;
        }
        info!(target: LOG_TARGET, "syncing to block height {} from {peer}", peer.last_block());
        self.sync_peer = Some(peer.id());
        self.highest_peer_at_start = self
            .peers
            .values()
            .map(|candidate| candidate.last_block())
            .max()
            .unwrap_or(0)
            .max(self.highest_peer_at_start);
        self.caught_up = false;
        self.publish_status();
        self.request_headers(&peer);
    }

    fn request_headers(&self, peer: &PeerHandle) {
        match self.store.latest_block_locator() {
            Ok(locator) => {
                peer.queue_message(Message::GetHeaders {
                    locator,
                    stop: [0u8; 32],
                });
            }
            Err(err) => warn!(target: LOG_TARGET, "building locator failed: {err}"),
        }
    }

    fn handle_inv(&mut self, peer: &PeerHandle, inv: &[InventoryVector]) {
        let Some(last) = inv.last() else { return };
        let known = self
            .store
            .get_block_by_hash(&last.hash)
            .map(|entry| entry.is_some())
            .unwrap_or(false)
            || self.branch.contains_key(&last.hash);
        if !known {
            // Ask the announcer itself; it necessarily has the block.
            self.request_headers(peer);
        }
    }

    fn handle_headers(&mut self, peer: &PeerHandle, headers: Vec<BlockHeader>) {
        if !self.peers.contains_key(&peer.id()) {
            peer.add_ban_score(&self.ctx, 0, SCORE_DISCONNECTED_BATCH, "headers from stranger");
            return;
        }
        if headers.is_empty() {
            if self.sync_peer == Some(peer.id()) {
                self.finish_header_sync();
            }
            return;
        }
        for pair in headers.windows(2) {
            if pair[1].prev_block != pair[0].hash() {
                peer.add_ban_score(&self.ctx, SCORE_INVALID_HEADER, 0, "non-contiguous headers");
                return;
            }
        }

        let first_prev = headers[0].prev_block;
        let full_batch = headers.len() >= MAX_HEADERS_PER_MSG;
        let result = if first_prev == self.header_tip.hash {
            self.extend_main_chain(peer, &headers)
        } else {
            self.extend_side_branch(peer, &headers)
        };

        match result {
            Ok(true) => {
                if full_batch {
                    self.request_headers(peer);
                } else if self.sync_peer == Some(peer.id()) {
                    self.finish_header_sync();
                }
            }
            Ok(false) => {}
            Err(err) => {
                warn!(target: LOG_TARGET, "header batch from {peer} failed: {err}");
            }
        }
    }

    /// Appends a batch that connects to the current tip. Returns Ok(true)
    /// when the batch was committed.
    fn extend_main_chain(
        &mut self,
        peer: &PeerHandle,
        headers: &[BlockHeader],
    ) -> Result<bool, ChainStateError> {
        let mut entries = Vec::with_capacity(headers.len());
        let mut window = self.window.clone();
        let mut height = self.header_tip.height;
        for header in headers {
            height += 1;
            if !self.validate_header(peer, header, height, Some(&window)) {
                return Ok(false);
            }
            push_window(&mut window, header, height, self.retarget_interval());
            entries.push((*header, height));
        }

        let tip = self.store.put_block_headers(&entries)?;
        self.window = window;
        self.header_tip = tip;
        self.header_tip_time = headers.last().map(|header| header.time).unwrap_or(0);
        trace!(
            target: LOG_TARGET,
            "advanced to {} at height {}",
            hash256_to_hex(&tip.hash),
            tip.height
        );
        let _ = self.heights_tx.try_send(HeightsUpdate {
            hash: tip.hash,
            height: tip.height as i32,
            origin: Some(peer.id()),
        });
        self.publish_status();
        self.request_filter_headers(false);
        self.request_filter_headers(true);
        Ok(true)
    }

    /// Accepts headers onto a side branch and reorganizes once the branch
    /// carries more work than the main chain above the fork point.
    fn extend_side_branch(
        &mut self,
        peer: &PeerHandle,
        headers: &[BlockHeader],
    ) -> Result<bool, ChainStateError> {
        let first_prev = headers[0].prev_block;
        let (fork_height, mut work, mut height) =
            if let Some(parent) = self.branch.get(&first_prev) {
                (parent.fork_height, parent.work, parent.height)
            } else if let Some((_, main_height)) = self.store.get_block_by_hash(&first_prev)? {
                if main_height == self.header_tip.height {
                    // Connects to the tip by another name; shouldn't happen.
                    return Ok(false);
                }
                (main_height, U256::zero(), main_height)
            } else {
                peer.add_ban_score(&self.ctx, 0, SCORE_UNSOLICITED, "orphan header batch");
                self.request_headers(peer);
                return Ok(false);
            };

        for header in headers {
            height += 1;
            if !self.validate_header(peer, header, height, None) {
                return Ok(false);
            }
            work = work.saturating_add(block_proof(header.bits).unwrap_or_default());
            self.branch.insert(
                header.hash(),
                BranchHeader {
                    header: *header,
                    height,
                    fork_height,
                    work,
                },
            );
        }

        let main_work = self.main_chain_work_above(fork_height)?;
        if work <= main_work {
            debug!(
                target: LOG_TARGET,
                "side branch at height {height} not yet heavier than main chain"
            );
            return Ok(true);
        }

        // The branch wins: unwind to the fork and re-apply.
        let branch_tip = headers.last().expect("checked nonempty").hash();
        let chain = self.collect_branch(branch_tip, fork_height);
        if chain.first().map(|(_, height)| *height) != Some(fork_height + 1) {
            warn!(target: LOG_TARGET, "side branch is missing ancestors; dropping it");
            return Ok(false);
        }
        info!(
            target: LOG_TARGET,
            "reorganizing to {} at height {height}, fork at {fork_height}",
            hash256_to_hex(&branch_tip)
        );
        self.store.rollback_to_height(fork_height)?;
        let tip = self.store.put_block_headers(&chain)?;
        for (header, _) in &chain {
            self.branch.remove(&header.hash());
        }
        self.header_tip = tip;
        self.header_tip_time = chain.last().map(|(header, _)| header.time).unwrap_or(0);
        self.window = bootstrap_window(&self.store, &tip)?;

        // Filter data above the fork went away with the rollback.
        for chain_idx in 0..2 {
            self.filter_heights[chain_idx] = self.filter_heights[chain_idx].min(fork_height);
        }
        self.cfh_windows.clear();
        self.cfh_pending.clear();

        let _ = self.heights_tx.try_send(HeightsUpdate {
            hash: tip.hash,
            height: tip.height as i32,
            origin: Some(peer.id()),
        });
        self.publish_status();
        self.request_filter_headers(false);
        self.request_filter_headers(true);
        Ok(true)
    }

    /// Walks branch headers from `tip_hash` down to the fork, returning them
    /// in ascending order.
    fn collect_branch(&self, tip_hash: Hash256, fork_height: u32) -> Vec<(BlockHeader, u32)> {
        let mut chain = Vec::new();
        let mut cursor = tip_hash;
        while let Some(entry) = self.branch.get(&cursor) {
            chain.push((entry.header, entry.height));
            if entry.height == fork_height + 1 {
                break;
            }
            cursor = entry.header.prev_block;
        }
        chain.reverse();
        chain
    }

    fn main_chain_work_above(&self, fork_height: u32) -> Result<U256, ChainStateError> {
        let mut work = U256::zero();
        for height in (fork_height + 1)..=self.header_tip.height {
            if let Some((header, _)) = self.store.get_block_by_height(height)? {
                work = work.saturating_add(block_proof(header.bits).unwrap_or_default());
            }
        }
        Ok(work)
    }

    /// Stateless checks on one header: proof of work against its own bits,
    /// the retarget schedule (main chain only), the timestamp bound, and the
    /// embedded checkpoints.
    fn validate_header(
        &self,
        peer: &PeerHandle,
        header: &BlockHeader,
        height: u32,
        window: Option<&VecDeque<HeaderInfo>>,
    ) -> bool {
        let hash = header.hash();
        match hash_meets_target(&hash, header.bits) {
            Ok(true) => {}
            _ => {
                peer.add_ban_score(&self.ctx, SCORE_INVALID_HEADER, 0, "header fails its own target");
                return false;
            }
        }

        if let Some(window) = window {
            let headers: Vec<HeaderInfo> = window.iter().copied().collect();
            match next_work_required(&headers, Some(header.time as i64), &self.ctx.params) {
                Ok(expected) if expected != header.bits => {
                    let pow_limit_bits = u256_to_compact(U256::from_little_endian(
                        &self.ctx.params.pow_limit,
                    ));
                    let min_difficulty_ok = self.ctx.params.pow_allow_min_difficulty
                        && header.bits == pow_limit_bits;
                    if !min_difficulty_ok {
                        peer.add_ban_score(&self.ctx, SCORE_INVALID_HEADER, 0, "unexpected difficulty bits");
                        return false;
                    }
                }
                _ => {}
            }
            if let Some(median) = median_time_past(window) {
                if (header.time as i64) <= median {
                    peer.add_ban_score(&self.ctx, SCORE_INVALID_HEADER, 0, "timestamp below median time past");
                    return false;
                }
            }
        }

        let adjusted = self.ctx.time_source.adjusted_time();
        if (header.time as i64) > adjusted + MAX_TIME_OFFSET_SECS {
            peer.add_ban_score(&self.ctx, SCORE_INVALID_HEADER, 0, "timestamp too far in the future");
            return false;
        }

        if let Some(checkpoint) = self.ctx.params.checkpoint_at(height) {
            if checkpoint.hash != hash {
                warn!(
                    target: LOG_TARGET,
                    "peer {peer} contradicts checkpoint at height {height} -- disconnecting"
                );
                peer.add_ban_score(&self.ctx, SCORE_CHECKPOINT_MISMATCH, 0, "checkpoint mismatch");
                peer.disconnect();
                return false;
            }
        }
        true
    }

    fn retarget_interval(&self) -> usize {
        self.ctx.params.retarget_interval() as usize
    }

    fn finish_header_sync(&mut self) {
        if !self.caught_up {
            self.caught_up = true;
            info!(
                target: LOG_TARGET,
                "caught up to block height {}",
                self.header_tip.height
            );
        }
        self.publish_status();
        self.request_filter_headers(false);
        self.request_filter_headers(true);
    }

    /// Issues the next `getcfheaders` window for one chain to every
    /// filter-serving peer, recording the expected block hashes in order.
    fn request_filter_headers(&mut self, extended: bool) {
        let idx = usize::from(extended);
        if self
            .cfh_windows
            .iter()
            .any(|window| window.extended == extended)
        {
            return;
        }
        let from = self.filter_heights[idx];
        if from >= self.header_tip.height {
            return;
        }
        let stop_height = (from + MAX_HEADERS_PER_MSG as u32).min(self.header_tip.height);

        let mut block_hashes = Vec::with_capacity((stop_height - from) as usize);
        for height in (from + 1)..=stop_height {
            match self.store.hash_at_height(height) {
                Ok(Some(hash)) => block_hashes.push(hash),
                _ => {
                    warn!(target: LOG_TARGET, "missing best-chain hash at height {height}");
                    return;
                }
            }
        }
        let stop_hash = *block_hashes.last().expect("nonempty range");
        let locator = match self.store.block_locator_from(from) {
            Ok(locator) => locator,
            Err(err) => {
                warn!(target: LOG_TARGET, "cfheaders locator failed: {err}");
                return;
            }
        };

        let mut asked = 0;
        for peer in self.peers.values() {
            if peer.services() & NODE_CF != NODE_CF {
                continue;
            }
            if peer.queue_message(Message::GetCFHeaders {
                locator: locator.clone(),
                stop: stop_hash,
                extended,
            }) {
                self.cfh_pending
                    .entry(peer.id())
                    .or_default()
                    .push_back(CfhRequest {
                        extended,
                        stop_hash,
                    });
                asked += 1;
            }
        }
        if asked == 0 {
            return;
        }
        trace!(
            target: LOG_TARGET,
            "requested {} cfheaders {}..={} from {asked} peers",
            if extended { "ext" } else { "basic" },
            from + 1,
            stop_height
        );
        self.cfh_windows.push(CfhWindow {
            extended,
            stop_hash,
            start_height: from + 1,
            block_hashes,
            asked,
            replies: Vec::new(),
            deadline: Instant::now() + self.ctx.tunables.query_timeout,
        });
    }

    fn handle_cfheaders(&mut self, peer: &PeerHandle, msg: CFHeadersMessage) {
        // The reply must match the front of this peer's FIFO request queue.
        let request = CfhRequest {
            extended: msg.extended,
            stop_hash: msg.stop_hash,
        };
        let queue = self.cfh_pending.entry(peer.id()).or_default();
        match queue.front() {
            Some(front) if *front == request => {
                queue.pop_front();
            }
            Some(_) if queue.contains(&request) => {
                // Skipped ahead; everything before it timed out server-side.
                while let Some(front) = queue.pop_front() {
                    if front == request {
                        break;
                    }
                }
            }
            _ => {
                peer.add_ban_score(&self.ctx, 0, SCORE_UNSOLICITED, "unsolicited cfheaders");
                return;
            }
        }

        let Some(window_idx) = self
            .cfh_windows
            .iter()
            .position(|window| window.extended == msg.extended && window.stop_hash == msg.stop_hash)
        else {
            // A late reply for an already-resolved window.
            return;
        };
        let window = &mut self.cfh_windows[window_idx];
        if msg.filter_hashes.len() != window.block_hashes.len() {
            peer.add_ban_score(&self.ctx, SCORE_BAD_CFHEADERS, 0, "cfheaders length mismatch");
            return;
        }
        window.replies.push(CfhReply {
            peer_id: peer.id(),
            prev_filter_header: msg.prev_filter_header,
            filter_hashes: msg.filter_hashes,
        });
        if window.replies.len() >= window.asked {
            let window = self.cfh_windows.swap_remove(window_idx);
            self.resolve_cfh_window(window);
        } else if window.replies.len() == 1 {
            // First evidence arrived; give the others a short window to
            // disagree before we commit.
            window.deadline = Instant::now() + self.ctx.tunables.wait_for_more_cf_headers;
        }
    }

    fn process_deadlines(&mut self) {
        let now = Instant::now();
        let mut due = Vec::new();
        let mut idx = 0;
        while idx < self.cfh_windows.len() {
            if self.cfh_windows[idx].deadline <= now {
                due.push(self.cfh_windows.swap_remove(idx));
            } else {
                idx += 1;
            }
        }
        for window in due {
            if window.replies.is_empty() {
                // Nobody answered; try again from scratch.
                debug!(
                    target: LOG_TARGET,
                    "cfheaders window at {} timed out with no replies",
                    window.start_height
                );
                self.request_filter_headers(window.extended);
            } else {
                self.resolve_cfh_window(window);
            }
        }
    }

    /// Majority resolution of one cfheaders window: identical reply vectors
    /// form voting groups; the largest group whose previous filter header
    /// matches our store wins, and peers outside it are banned.
    fn resolve_cfh_window(&mut self, window: CfhWindow) {
        let idx = usize::from(window.extended);
        let prev_block_hash = if window.start_height == 1 {
            match self.store.hash_at_height(0) {
                Ok(Some(hash)) => hash,
                _ => return,
            }
        } else {
            match self.store.hash_at_height(window.start_height - 1) {
                Ok(Some(hash)) => hash,
                _ => return,
            }
        };
        let mut stored_prev = match self.store.filter_header(&prev_block_hash, window.extended) {
            Ok(Some(header)) => header,
            _ => {
                warn!(target: LOG_TARGET, "missing previous filter header; dropping window");
                return;
            }
        };

        // Vote by identical (prev, hashes) content.
        let mut groups: Vec<(usize, Vec<PeerId>)> = Vec::new();
        for (reply_idx, reply) in window.replies.iter().enumerate() {
            let mut placed = false;
            for (canonical, members) in groups.iter_mut() {
                let other = &window.replies[*canonical];
                if other.prev_filter_header == reply.prev_filter_header
                    && other.filter_hashes == reply.filter_hashes
                {
                    members.push(reply.peer_id);
                    placed = true;
                    break;
                }
            }
            if !placed {
                groups.push((reply_idx, vec![reply.peer_id]));
            }
        }
        groups.sort_by_key(|(_, members)| std::cmp::Reverse(members.len()));

        if groups.len() > 1 {
            info!(
                target: LOG_TARGET,
                "peers disagree on cfheaders at height {}; keeping the majority",
                window.start_height
            );
        }

        let winner = groups.iter().position(|(canonical, _)| {
            let reply = &window.replies[*canonical];
            if stored_prev == GENESIS_FILTER_PLACEHOLDER && window.start_height == 1 {
                true
            } else {
                reply.prev_filter_header == stored_prev
            }
        });
        let Some(winner_idx) = winner else {
            // Every group contradicts our stored chain.
            for reply in &window.replies {
                if let Some(peer) = self.peers.get(&reply.peer_id).cloned() {
                    peer.add_ban_score(&self.ctx, SCORE_BAD_CFHEADERS, 0, "previous filter header mismatch");
                }
            }
            return;
        };

        // Everyone outside the winning group misreported the chain.
        for (group_idx, (_, members)) in groups.iter().enumerate() {
            if group_idx == winner_idx {
                continue;
            }
            for peer_id in members {
                if let Some(peer) = self.peers.get(peer_id).cloned() {
                    warn!(target: LOG_TARGET, "peer {peer} in cfheaders minority -- banning");
                    peer.add_ban_score(&self.ctx, SCORE_BAD_CFHEADERS, 0, "cfheaders minority");
                }
            }
        }

        let reply = &window.replies[groups[winner_idx].0];
        if stored_prev == GENESIS_FILTER_PLACEHOLDER && window.start_height == 1 {
            // Adopt the network's genesis anchor the first time we hear it.
            if self
                .store
                .put_filter_header(&prev_block_hash, &reply.prev_filter_header, window.extended)
                .is_err()
            {
                return;
            }
            stored_prev = reply.prev_filter_header;
        }

        let mut prev = stored_prev;
        for (block_hash, filter_hash) in window.block_hashes.iter().zip(&reply.filter_hashes) {
            let header = sha256d_pair(filter_hash, &prev);
            if let Err(err) = self.store.put_filter_header(block_hash, &header, window.extended) {
                warn!(target: LOG_TARGET, "storing filter header failed: {err}");
                return;
            }
            prev = header;
        }
        self.filter_heights[idx] =
            window.start_height + window.block_hashes.len() as u32 - 1;
        trace!(
            target: LOG_TARGET,
            "{} filter headers now at height {}",
            if window.extended { "ext" } else { "basic" },
            self.filter_heights[idx]
        );
        self.publish_status();
        self.request_filter_headers(window.extended);
    }

    fn publish_status(&self) {
        let _ = self.status_tx.send(SyncStatus {
            header_height: self.header_tip.height,
            header_time: self.header_tip_time,
            basic_height: self.filter_heights[0],
            ext_height: self.filter_heights[1],
            highest_peer_at_start: self.highest_peer_at_start,
            caught_up: self.caught_up,
        });
    }
}

async fn sleep_until_instant(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}

/// Highest height whose filter header is already stored; filter headers are
/// written contiguously, so the first hit walking down from the tip is it.
fn filter_chain_height<S: KeyValueStore>(
    store: &HeaderStore<S>,
    tip: &BlockStamp,
    extended: bool,
) -> Result<u32, ChainStateError> {
    for height in (0..=tip.height).rev() {
        let Some(hash) = store.hash_at_height(height)? else {
            continue;
        };
        if store.filter_header(&hash, extended)?.is_some() {
            return Ok(height);
        }
    }
    Ok(0)
}

fn bootstrap_window<S: KeyValueStore>(
    store: &HeaderStore<S>,
    tip: &BlockStamp,
) -> Result<VecDeque<HeaderInfo>, ChainStateError> {
    let mut window = VecDeque::new();
    let span = MEDIAN_TIME_SPAN.max(2048);
    let from = tip.height.saturating_sub(span as u32 - 1);
    for height in from..=tip.height {
        if let Some((header, _)) = store.get_block_by_height(height)? {
            window.push_back(HeaderInfo {
                height,
                time: header.time,
                bits: header.bits,
            });
        }
    }
    Ok(window)
}

fn push_window(
    window: &mut VecDeque<HeaderInfo>,
    header: &BlockHeader,
    height: u32,
    interval: usize,
) {
    window.push_back(HeaderInfo {
        height,
        time: header.time,
        bits: header.bits,
    });
    let cap = interval.max(MEDIAN_TIME_SPAN) + 32;
    while window.len() > cap {
        window.pop_front();
    }
}

fn median_time_past(window: &VecDeque<HeaderInfo>) -> Option<i64> {
    if window.is_empty() {
        return None;
    }
    let mut times: Vec<i64> = window
        .iter()
        .rev()
        .take(MEDIAN_TIME_SPAN)
        .map(|info| info.time as i64)
        .collect();
    times.sort_unstable();
    Some(times[times.len() / 2])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn median_time_past_uses_last_eleven() {
        let mut window = VecDeque::new();
        for i in 0..20u32 {
            window.push_back(HeaderInfo {
                height: i,
                time: i * 10,
                bits: 0x207f_ffff,
            });
        }
        // Last eleven times are 90..=190 stepped by ten; the median is 140.
        assert_eq!(median_time_past(&window), Some(140));
    }

    #[test]
    fn window_is_bounded() {
        let mut window = VecDeque::new();
        let header = BlockHeader {
            version: 1,
            prev_block: [0; 32],
            merkle_root: [0; 32],
            time: 0,
            bits: 0x207f_ffff,
            nonce: 0,
        };
        for height in 0..5000u32 {
            push_window(&mut window, &header, height, 2016);
        }
        assert!(window.len() <= 2016 + 32);
        assert_eq!(window.back().unwrap().height, 4999);
    }
}
