//! End-to-end exercises of the chain service against in-process peers
//! speaking the wire protocol over real sockets.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use spvd_consensus::constants::{NODE_CF, NODE_NETWORK, PROTOCOL_VERSION};
use spvd_consensus::{chain_params, ChainParams, Hash256, Network};
use spvd_node::wire::{
    self, CFHeadersMessage, InventoryVector, Message, VersionMessage, ENVELOPE_SIZE, MSG_BLOCK,
};
use spvd_node::{ChainService, Config};
use spvd_primitives::block::{Block, BlockHeader};
use spvd_primitives::encoding::Encoder;
use spvd_primitives::hash::{sha256d, sha256d_pair};
use spvd_storage::memory::MemoryStore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as u32)
        .unwrap_or(0)
}

fn coinbase_tx(tag: u32, salt: u8) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_i32_le(1);
    encoder.write_varint(1);
    encoder.write_hash(&[0u8; 32]);
    encoder.write_u32_le(u32::MAX);
    let mut script = tag.to_le_bytes().to_vec();
    script.push(salt);
    encoder.write_var_bytes(&script);
    encoder.write_u32_le(u32::MAX);
    encoder.write_varint(1);
    encoder.write_i64_le(50 * 100_000_000);
    encoder.write_var_bytes(&[0x51]);
    encoder.write_u32_le(0);
    encoder.into_inner()
}

/// A miner-side view of one chain the mock node can serve.
struct MockChain {
    params: ChainParams,
    blocks: Vec<Block>,
    /// Filter contents per height, basic at .0 and extended at .1.
    filters: Vec<(Vec<u8>, Vec<u8>)>,
    genesis_basic_anchor: Hash256,
    genesis_ext_anchor: Hash256,
}

impl MockChain {
    fn generate(params: ChainParams, length: u32) -> Self {
        let genesis = BlockHeader {
            version: params.genesis_version,
            prev_block: [0u8; 32],
            merkle_root: params.genesis_merkle_root,
            time: params.genesis_time,
            bits: params.genesis_bits,
            nonce: params.genesis_nonce,
        };
        let mut chain = Self {
            params,
            blocks: vec![Block {
                header: genesis,
                transactions: Vec::new(),
            }],
            filters: vec![(Vec::new(), Vec::new())],
            genesis_basic_anchor: [0xaa; 32],
            genesis_ext_anchor: [0xbb; 32],
        };
        chain.mine(length, 0);
        chain
    }

    /// A competing chain sharing this one's blocks up to `fork_height`.
    fn fork(&self, fork_height: u32, length: u32, salt: u8) -> Self {
        let mut chain = Self {
            params: self.params.clone(),
            blocks: self.blocks[..=fork_height as usize].to_vec(),
            filters: self.filters[..=fork_height as usize].to_vec(),
            genesis_basic_anchor: self.genesis_basic_anchor,
            genesis_ext_anchor: self.genesis_ext_anchor,
        };
        chain.mine(length, salt);
        chain
    }

    fn mine(&mut self, count: u32, salt: u8) {
        let base_time = unix_now() - 600;
        for _ in 0..count {
            let height = self.blocks.len() as u32;
            let prev = self.tip_hash();
            let tx = coinbase_tx(height, salt);
            let mut header = BlockHeader {
                version: 1,
                prev_block: prev,
                merkle_root: sha256d(&tx),
                time: base_time + height,
                bits: 0x207f_ffff,
                nonce: 0,
            };
            // The simulation-network target is trivial; a couple of nonce
            // bumps satisfy it.
            while !spvd_pow::hash_meets_target(&header.hash(), header.bits).unwrap_or(false) {
                header.nonce += 1;
            }
            self.blocks.push(Block {
                header,
                transactions: vec![tx],
            });
            self.filters.push((
                format!("basic-{salt}-{height}").into_bytes(),
                format!("ext-{salt}-{height}").into_bytes(),
            ));
        }
    }

    fn tip_height(&self) -> u32 {
        (self.blocks.len() - 1) as u32
    }

    fn tip_hash(&self) -> Hash256 {
        self.blocks.last().unwrap().header.hash()
    }

    fn height_of(&self, hash: &Hash256) -> Option<u32> {
        self.blocks
            .iter()
            .position(|block| block.header.hash() == *hash)
            .map(|idx| idx as u32)
    }

    fn filter(&self, height: u32, extended: bool) -> &[u8] {
        let entry = &self.filters[height as usize];
        if extended {
            &entry.1
        } else {
            &entry.0
        }
    }

    /// Filter headers recomputed the way the client will: each filter hash
    /// chained onto the previous header, anchored at genesis.
    fn cfheaders_for(&self, start: u32, stop: u32, extended: bool) -> CFHeadersMessage {
        let anchor = if extended {
            self.genesis_ext_anchor
        } else {
            self.genesis_basic_anchor
        };
        let mut prev = anchor;
        for height in 1..start {
            let filter_hash = sha256d(self.filter(height, extended));
            prev = sha256d_pair(&filter_hash, &prev);
        }
        let prev_filter_header = prev;
        let filter_hashes = (start..=stop)
            .map(|height| sha256d(self.filter(height, extended)))
            .collect();
        CFHeadersMessage {
            extended,
            stop_hash: self.blocks[stop as usize].header.hash(),
            prev_filter_header,
            filter_hashes,
        }
    }
}

async fn read_frame(stream: &mut TcpStream, magic: [u8; 4]) -> Option<Message> {
    let mut header = [0u8; ENVELOPE_SIZE];
    stream.read_exact(&mut header).await.ok()?;
    let (command, length, checksum) = wire::parse_envelope(magic, &header).ok()?;
    let mut payload = vec![0u8; length];
    stream.read_exact(&mut payload).await.ok()?;
    wire::verify_checksum(&payload, &checksum).ok()?;
    Message::decode(&command, &payload).ok()
}

async fn write_frame(stream: &mut TcpStream, magic: [u8; 4], message: &Message) {
    let payload = message.encode_payload();
    let frame = wire::build_frame(magic, message.command(), &payload).expect("frame");
    stream.write_all(&frame).await.expect("write frame");
}

/// Serves the wire protocol for one inbound connection. `phase_rx` selects
/// which chain is live; a phase change announces the new tip with an inv.
async fn serve_peer(
    mut stream: TcpStream,
    chains: Vec<Arc<MockChain>>,
    mut phase_rx: watch::Receiver<usize>,
) {
    let magic = chains[0].params.message_start;

    // Handshake: their version, our version, their verack, our verack.
    match read_frame(&mut stream, magic).await {
        Some(Message::Version(_)) => {}
        other => panic!("expected version, got {other:?}"),
    }
    let start_height = chains[*phase_rx.borrow()].tip_height() as i32;
    write_frame(
        &mut stream,
        magic,
        &Message::Version(VersionMessage {
            version: PROTOCOL_VERSION,
            services: NODE_NETWORK | NODE_CF,
            timestamp: unix_now() as i64,
            nonce: 1,
            user_agent: "/mockd:0.1.0/".to_string(),
            start_height,
            relay: false,
        }),
    )
    .await;
    match read_frame(&mut stream, magic).await {
        Some(Message::Verack) => {}
        other => panic!("expected verack, got {other:?}"),
    }
    write_frame(&mut stream, magic, &Message::Verack).await;

    loop {
        let chain = Arc::clone(&chains[*phase_rx.borrow()]);
        tokio::select! {
            changed = phase_rx.changed() => {
                if changed.is_err() {
                    return;
                }
                let chain = &chains[*phase_rx.borrow()];
                write_frame(
                    &mut stream,
                    magic,
                    &Message::Inv(vec![InventoryVector {
                        inv_type: MSG_BLOCK,
                        hash: chain.tip_hash(),
                    }]),
                )
                .await;
            }
            message = read_frame(&mut stream, magic) => {
                let Some(message) = message else { return };
                handle_request(&mut stream, magic, &chain, message).await;
            }
        }
    }
}

async fn handle_request(
    stream: &mut TcpStream,
    magic: [u8; 4],
    chain: &MockChain,
    message: Message,
) {
    match message {
        Message::Ping(nonce) => {
            write_frame(stream, magic, &Message::Pong(nonce)).await;
        }
        Message::GetHeaders { locator, .. } => {
            let start = locator
                .iter()
                .find_map(|hash| chain.height_of(hash))
                .unwrap_or(0);
            let headers = chain.blocks[(start + 1) as usize..]
                .iter()
                .map(|block| block.header)
                .collect();
            write_frame(stream, magic, &Message::Headers(headers)).await;
        }
        Message::GetCFHeaders {
            locator,
            stop,
            extended,
        } => {
            let start = locator
                .iter()
                .find_map(|hash| chain.height_of(hash))
                .unwrap_or(0);
            let Some(stop_height) = chain.height_of(&stop) else {
                return;
            };
            let reply = chain.cfheaders_for(start + 1, stop_height, extended);
            write_frame(stream, magic, &Message::CFHeaders(reply)).await;
        }
        Message::GetCFilter {
            block_hash,
            extended,
        } => {
            let Some(height) = chain.height_of(&block_hash) else {
                return;
            };
            write_frame(
                stream,
                magic,
                &Message::CFilter(wire::CFilterMessage {
                    extended,
                    block_hash,
                    filter: chain.filter(height, extended).to_vec(),
                }),
            )
            .await;
        }
        Message::GetData(invs) => {
            for inv in invs {
                if inv.inv_type != MSG_BLOCK {
                    continue;
                }
                let Some(height) = chain.height_of(&inv.hash) else {
                    continue;
                };
                write_frame(
                    stream,
                    magic,
                    &Message::Block(chain.blocks[height as usize].clone()),
                )
                .await;
            }
        }
        _ => {}
    }
}

struct Harness {
    service: ChainService<MemoryStore>,
    phase_tx: watch::Sender<usize>,
    _dir: tempfile::TempDir,
}

async fn start_harness(chains: Vec<Arc<MockChain>>) -> Harness {
    let params = chains[0].params.clone();
    let (phase_tx, phase_rx) = watch::channel(0usize);

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let peer_addr = listener.local_addr().expect("local addr");
    {
        let chains = chains.clone();
        let phase_rx = phase_rx.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(serve_peer(stream, chains.clone(), phase_rx.clone()));
            }
        });
    }

    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = Config::new(dir.path(), params);
    config.connect_peers = vec![peer_addr.to_string()];
    config.tunables.connection_retry_interval = Duration::from_millis(100);
    config.tunables.max_peers = 3;
    config.tunables.query_timeout = Duration::from_secs(2);
    config.tunables.wait_for_more_cf_headers = Duration::from_millis(200);

    let service = ChainService::new(MemoryStore::new(), config).expect("service");
    service.start();
    Harness {
        service,
        phase_tx,
        _dir: dir,
    }
}

async fn wait_for_tip(service: &ChainService<MemoryStore>, expected: Hash256) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    loop {
        let tip = service.best_snapshot().expect("tip");
        if tip.hash == expected && service.is_current() {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for sync; tip {tip:?}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Checks the basic filter-header chain links from the genesis anchor up to
/// the chain tip.
fn assert_filter_chain_links(service: &ChainService<MemoryStore>, chain: &MockChain) {
    let mut prev = service
        .get_basic_header(&chain.params.hash_genesis_block)
        .expect("get")
        .expect("genesis anchor adopted");
    assert_eq!(prev, chain.genesis_basic_anchor);
    for height in 1..=chain.tip_height() {
        let hash = chain.blocks[height as usize].header.hash();
        let stored = service
            .get_basic_header(&hash)
            .expect("get")
            .expect("filter header present");
        let filter_hash = sha256d(chain.filter(height, false));
        assert_eq!(stored, sha256d_pair(&filter_hash, &prev));
        prev = stored;

        assert!(service.get_ext_header(&hash).expect("get").is_some());
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn syncs_headers_filters_and_blocks_from_one_peer() {
    let params = chain_params(Network::Simnet);
    let chain = Arc::new(MockChain::generate(params, 5));
    let harness = start_harness(vec![Arc::clone(&chain)]).await;
    let service = &harness.service;

    wait_for_tip(service, chain.tip_hash()).await;
    let tip = service.best_snapshot().expect("tip");
    assert_eq!(tip.height, 5);
    assert_filter_chain_links(service, &chain);

    // On-demand filter fetch round-trips the network and then caches.
    let target = chain.blocks[3].header.hash();
    assert_eq!(
        service.get_basic_filter(&target).expect("get"),
        None,
        "filter must not be cached before the fetch"
    );
    let fetched = service
        .get_cf_filter(target, false)
        .await
        .expect("filter from network");
    assert_eq!(fetched, chain.filter(3, false));
    assert_eq!(
        service.get_basic_filter(&target).expect("get"),
        Some(fetched.clone()),
        "fetched filter is persisted"
    );
    let cached = service
        .get_cf_filter(target, false)
        .await
        .expect("filter from store");
    assert_eq!(cached, fetched);

    // Full block fetch validates against the stored header.
    let block_hash = chain.blocks[2].header.hash();
    let block = service
        .get_block_from_network(block_hash)
        .await
        .expect("block from network");
    assert_eq!(block.header.hash(), block_hash);
    assert_eq!(block.compute_merkle_root(), block.header.merkle_root);

    assert_eq!(service.connected_count().await, 1);

    service.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn reorganizes_to_a_heavier_branch() {
    let params = chain_params(Network::Simnet);
    let chain_a = Arc::new(MockChain::generate(params, 3));
    // A competing branch forking after height 1 with more cumulative work.
    let chain_b = Arc::new(chain_a.fork(1, 5, 0xb0));

    let harness = start_harness(vec![Arc::clone(&chain_a), Arc::clone(&chain_b)]).await;
    let service = &harness.service;

    wait_for_tip(service, chain_a.tip_hash()).await;
    assert_eq!(service.best_snapshot().expect("tip").height, 3);

    // The peer switches to the heavier branch and announces its tip.
    harness.phase_tx.send(1).expect("phase");
    wait_for_tip(service, chain_b.tip_hash()).await;

    let tip = service.best_snapshot().expect("tip");
    assert_eq!(tip.height, 6);
    assert_eq!(tip.hash, chain_b.tip_hash());

    // The abandoned branch is gone from the store, the shared prefix stays.
    let stale = chain_a.blocks[3].header.hash();
    assert!(service.get_block_by_hash(&stale).expect("get").is_none());
    let shared = chain_a.blocks[1].header.hash();
    let (_, shared_height) = service
        .get_block_by_hash(&shared)
        .expect("get")
        .expect("shared block survives");
    assert_eq!(shared_height, 1);

    // Filter headers were rebuilt above the fork and still link.
    assert_filter_chain_links(service, &chain_b);

    service.stop().await;
}
