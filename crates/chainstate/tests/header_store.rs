use spvd_chainstate::{BlockStamp, HeaderStore};
use spvd_consensus::{chain_params, Network};
use spvd_primitives::block::BlockHeader;
use spvd_storage::memory::MemoryStore;

fn new_store() -> (HeaderStore<MemoryStore>, BlockStamp) {
    let params = chain_params(Network::Simnet);
    let store = HeaderStore::new(MemoryStore::new());
    let genesis = store.ensure_genesis(&params).expect("genesis");
    (store, genesis)
}

fn build_chain(from: &BlockStamp, count: u32) -> Vec<(BlockHeader, u32)> {
    let mut chain = Vec::with_capacity(count as usize);
    let mut prev = from.hash;
    for i in 0..count {
        let header = BlockHeader {
            version: 1,
            prev_block: prev,
            merkle_root: [i as u8; 32],
            time: 1_401_292_357 + i,
            bits: 0x207f_ffff,
            nonce: i,
        };
        prev = header.hash();
        chain.push((header, from.height + 1 + i));
    }
    chain
}

#[test]
fn genesis_is_seeded_once() {
    let params = chain_params(Network::Simnet);
    let (store, genesis) = new_store();
    assert_eq!(genesis.height, 0);
    assert_eq!(genesis.hash, params.hash_genesis_block);

    // Second call must not reset the tip.
    let chain = build_chain(&genesis, 3);
    store.put_block_headers(&chain).expect("append");
    let again = store.ensure_genesis(&params).expect("genesis again");
    assert_eq!(again.height, 3);
}

#[test]
fn block_roundtrip_by_hash_and_height() {
    let (store, genesis) = new_store();
    let chain = build_chain(&genesis, 5);
    let tip = store.put_block_headers(&chain).expect("append");
    assert_eq!(tip.height, 5);

    for (header, height) in &chain {
        let by_hash = store
            .get_block_by_hash(&header.hash())
            .expect("get")
            .expect("present");
        assert_eq!(by_hash, (*header, *height));

        let by_height = store
            .get_block_by_height(*height)
            .expect("get")
            .expect("present");
        assert_eq!(by_height, (*header, *height));
    }

    let (latest, height) = store.latest_block().expect("latest");
    assert_eq!(height, 5);
    assert_eq!(latest.hash(), tip.hash);
}

#[test]
fn reapplying_a_batch_leaves_the_tip_unchanged() {
    let (store, genesis) = new_store();
    let chain = build_chain(&genesis, 4);
    let first = store.put_block_headers(&chain).expect("append");
    let second = store.put_block_headers(&chain).expect("reapply");
    assert_eq!(first, second);
    assert_eq!(store.best_snapshot().expect("tip"), first);
}

#[test]
fn rollback_to_height_clears_everything_above() {
    let (store, genesis) = new_store();
    let chain = build_chain(&genesis, 10);
    store.put_block_headers(&chain).expect("append");
    for (header, _) in &chain {
        let hash = header.hash();
        store.put_basic_header(&hash, &[0x01; 32]).expect("fh");
        store.put_ext_header(&hash, &[0x02; 32]).expect("fh");
        store.put_basic_filter(&hash, &[0xaa, 0xbb]).expect("filter");
    }

    let tip = store.rollback_to_height(6).expect("rollback");
    assert_eq!(tip.height, 6);
    assert_eq!(tip.hash, chain[5].0.hash());
    assert_eq!(store.best_snapshot().expect("tip"), tip);
    assert_eq!(store.max_height().expect("max"), 6);

    for (header, height) in &chain {
        let hash = header.hash();
        if *height <= 6 {
            assert!(store.get_block_by_hash(&hash).expect("get").is_some());
            assert!(store.get_basic_header(&hash).expect("get").is_some());
        } else {
            assert!(store.get_block_by_hash(&hash).expect("get").is_none());
            assert!(store.get_block_by_height(*height).expect("get").is_none());
            assert!(store.get_basic_header(&hash).expect("get").is_none());
            assert!(store.get_ext_header(&hash).expect("get").is_none());
            assert!(store.get_basic_filter(&hash).expect("get").is_none());
        }
    }
}

#[test]
fn rollback_stops_at_genesis() {
    let (store, _) = new_store();
    assert!(store.rollback_last_block().is_err());
}

#[test]
fn filter_bytes_roundtrip() {
    let (store, genesis) = new_store();
    let chain = build_chain(&genesis, 1);
    store.put_block_headers(&chain).expect("append");
    let hash = chain[0].0.hash();

    let filter = vec![0x11, 0x22, 0x33, 0x44];
    store.put_basic_filter(&hash, &filter).expect("put");
    assert_eq!(
        store.get_basic_filter(&hash).expect("get"),
        Some(filter.clone())
    );
    assert_eq!(store.get_ext_filter(&hash).expect("get"), None);

    store.put_ext_filter(&hash, &filter).expect("put");
    assert_eq!(store.get_ext_filter(&hash).expect("get"), Some(filter));
}

#[test]
fn locator_is_dense_near_tip_then_sparse() {
    let (store, genesis) = new_store();
    let chain = build_chain(&genesis, 100);
    store.put_block_headers(&chain).expect("append");

    let locator = store.latest_block_locator().expect("locator");
    // First ten entries descend one by one from the tip.
    for (i, hash) in locator.iter().take(10).enumerate() {
        assert_eq!(*hash, chain[99 - i].0.hash());
    }
    // Ends at genesis and is much shorter than the chain.
    assert_eq!(*locator.last().expect("nonempty"), genesis.hash);
    assert!(locator.len() < 30);
}
