//! Download coordination and peer attribution over a live engine.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use emberd_chainstate::blockindex::{status, BlockIndex};
use emberd_chainstate::chain::ChainView;
use emberd_chainstate::engine::{ConsensusEngine, EngineOptions};
use emberd_chainstate::genesis::genesis_block;
use emberd_chainstate::interfaces::{ManualClock, NullMempool, NullNotifier, NullUi};
use emberd_consensus::money::COIN;
use emberd_consensus::{chain_params, ChainParams, Hash256, Network};
use emberd_primitives::block::{Block, BlockHeader};
use emberd_primitives::merkle::block_merkle_root;
use emberd_primitives::transaction::{Transaction, TxIn, TxOut};
use emberd_primitives::OutPoint;
use emberd_pow::validation::check_pow;
use emberd_script::num::serialized_height;
use emberd_script::verify::AcceptAllVerifier;
use emberd_storage::memory::MemoryStore;
use emberd_sync::download::DownloadCoordinator;
use emberd_sync::headers::HeaderProcessor;
use emberd_sync::net::{NetMessage, NodeId, PeerNet};
use primitive_types::U256;

#[derive(Default)]
struct RecordingNet {
    messages: Mutex<Vec<(NodeId, NetMessage)>>,
    misbehavior: Mutex<Vec<(NodeId, u32, String)>>,
    disconnects: Mutex<Vec<NodeId>>,
}

impl PeerNet for RecordingNet {
    fn push_message(&self, peer: NodeId, message: NetMessage) {
        self.messages.lock().unwrap().push((peer, message));
    }

    fn for_each_peer(&self, _f: &mut dyn FnMut(NodeId)) {}

    fn disconnect(&self, peer: NodeId) {
        self.disconnects.lock().unwrap().push(peer);
    }

    fn misbehaving(&self, peer: NodeId, score: u32, reason: &str) {
        self.misbehavior
            .lock()
            .unwrap()
            .push((peer, score, reason.to_string()));
    }
}

fn mine_block(
    params: &ChainParams,
    prev_hash: Hash256,
    height: i32,
    time: u32,
    tag: u8,
    extra_txs: Vec<Transaction>,
) -> Block {
    let mut script_sig = serialized_height(height);
    script_sig.push(tag);
    let coinbase = Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig,
            sequence: TxIn::SEQUENCE_FINAL,
        }],
        vout: vec![TxOut {
            value: 50 * COIN,
            script_pubkey: vec![0x51, tag],
        }],
        lock_time: 0,
    };
    let mut transactions = vec![coinbase];
    transactions.extend(extra_txs);
    let (merkle_root, _) = block_merkle_root(&transactions);
    let mut header = BlockHeader {
        version: 0x2000_0000,
        prev_block: prev_hash,
        merkle_root,
        time,
        bits: 0x207f_ffff,
        nonce: 0,
    };
    while check_pow(&header.hash(), header.bits, &params.consensus).is_err() {
        header.nonce += 1;
    }
    Block {
        header,
        transactions,
    }
}

struct EngineBox {
    engine: ConsensusEngine<MemoryStore>,
    dir: PathBuf,
}

impl Drop for EngineBox {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

fn regtest_engine(now: i64, tag: &str) -> EngineBox {
    let params = chain_params(Network::Regtest);
    let dir = std::env::temp_dir().join(format!("emberd-sync-{tag}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    let engine = ConsensusEngine::new(
        params,
        Arc::new(MemoryStore::new()),
        EngineOptions::new(&dir),
        Arc::new(AcceptAllVerifier),
        Box::new(NullMempool),
        Box::new(NullUi),
        Box::new(ManualClock::new(now)),
        Box::new(NullNotifier),
    );
    EngineBox { engine, dir }
}

#[test]
fn invalid_branch_charges_the_delivering_peer() {
    let params = chain_params(Network::Regtest);
    let genesis = genesis_block(&params);
    let genesis_time = genesis.header.time;
    let mut boxed = regtest_engine(genesis_time as i64 + 2, "dos");
    boxed.engine.init_block_index().expect("init");

    let mut coordinator = DownloadCoordinator::new();
    coordinator.init_peer(9);
    let net = RecordingNet::default();
    let processor = HeaderProcessor::new();

    // Honest chain A1..A3 from peer 3.
    coordinator.init_peer(3);
    let mut prev = genesis.block_hash();
    for height in 1..=3 {
        let block = mine_block(
            &params,
            prev,
            height,
            genesis_time + height as u32,
            b'A',
            Vec::new(),
        );
        prev = block.block_hash();
        processor
            .process_block(&mut boxed.engine, &mut coordinator, &net, 3, &block, true)
            .expect("honest block");
    }

    // Peer 9 delivers branch B whose third block spends a missing output.
    let bad_spend = Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::new([0xfe; 32], 0),
            script_sig: vec![0x51],
            sequence: TxIn::SEQUENCE_FINAL,
        }],
        vout: vec![TxOut {
            value: 1,
            script_pubkey: vec![0x51],
        }],
        lock_time: 0,
    };
    let mut branch = Vec::new();
    let mut prev = genesis.block_hash();
    for height in 1..=4 {
        let extra = if height == 3 {
            vec![bad_spend.clone()]
        } else {
            Vec::new()
        };
        let block = mine_block(
            &params,
            prev,
            height,
            genesis_time + height as u32,
            b'B',
            extra,
        );
        prev = block.block_hash();
        branch.push(block);
    }
    for block in &branch {
        processor
            .process_block(&mut boxed.engine, &mut coordinator, &net, 9, block, true)
            .expect("stored branch block");
    }

    let misbehavior = net.misbehavior.lock().unwrap();
    assert!(
        misbehavior
            .iter()
            .any(|(peer, score, _)| *peer == 9 && *score == 100),
        "peer 9 should be charged for the invalid block: {misbehavior:?}"
    );
}

#[test]
fn unconnected_header_batch_requests_ancestors() {
    let params = chain_params(Network::Regtest);
    let genesis = genesis_block(&params);
    let genesis_time = genesis.header.time;
    let mut boxed = regtest_engine(genesis_time as i64 + 2, "getheaders");
    boxed.engine.init_block_index().expect("init");

    let mut coordinator = DownloadCoordinator::new();
    coordinator.init_peer(5);
    let net = RecordingNet::default();
    let processor = HeaderProcessor::new();

    // A header whose parent we have never seen.
    let orphan = BlockHeader {
        version: 0x2000_0000,
        prev_block: [0x77; 32],
        merkle_root: [1u8; 32],
        time: genesis_time + 50,
        bits: 0x207f_ffff,
        nonce: 0,
    };
    processor
        .process_headers(&mut boxed.engine, &mut coordinator, &net, 5, &[orphan])
        .expect("batch deferred, not failed");

    let messages = net.messages.lock().unwrap();
    assert!(matches!(
        messages.as_slice(),
        [(5, NetMessage::GetHeaders { .. })]
    ));
    let misbehavior = net.misbehavior.lock().unwrap();
    assert!(misbehavior.is_empty());
}

fn header_chain(index: &mut BlockIndex, count: i32, with_data: i32) -> Vec<u32> {
    let mut ids = Vec::new();
    let mut prev = None;
    for height in 0..count {
        let mut hash = [0u8; 32];
        hash[..4].copy_from_slice(&(height as u32 + 1).to_le_bytes());
        let header = BlockHeader {
            version: 0x2000_0000,
            prev_block: prev.map(|id| index.entry(id).hash).unwrap_or([0u8; 32]),
            merkle_root: [0u8; 32],
            time: 1_000 + height as u32 * 600,
            bits: 0x207f_ffff,
            nonce: 0,
        };
        let id = index.add_header(hash, &header, prev, U256::from(2u64));
        if height < with_data {
            let entry = index.entry_mut(id);
            entry.status |= status::HAVE_DATA;
            entry.n_tx = 1;
            entry.chain_tx = height as u64 + 1;
        }
        ids.push(id);
        prev = Some(id);
    }
    ids
}

#[test]
fn next_blocks_walk_forward_from_last_common() {
    let mut index = BlockIndex::new();
    // Heights 0..=4 downloaded and active; 5..=10 known by header only.
    let ids = header_chain(&mut index, 11, 5);
    let mut chain = ChainView::new();
    chain.set_tip(&index, Some(ids[4]));

    let mut coordinator = DownloadCoordinator::new();
    coordinator.init_peer(1);
    coordinator.update_block_availability(&index, 1, &index.entry(ids[10]).hash);

    let (blocks, staller) = coordinator.find_next_blocks_to_download(&index, &chain, 1, 3);
    assert_eq!(blocks, vec![ids[5], ids[6], ids[7]]);
    assert!(staller.is_none());
    assert_eq!(
        coordinator.peer(1).unwrap().last_common_block,
        Some(ids[4])
    );

    // Blocks already in flight elsewhere are skipped.
    coordinator.init_peer(2);
    coordinator.update_block_availability(&index, 2, &index.entry(ids[10]).hash);
    coordinator.mark_block_in_flight(1, index.entry(ids[5]).hash, Some(ids[5]), 0, 600);
    let (blocks, _) = coordinator.find_next_blocks_to_download(&index, &chain, 2, 3);
    assert_eq!(blocks, vec![ids[6], ids[7], ids[8]]);
}

#[test]
fn peer_without_more_work_yields_nothing() {
    let mut index = BlockIndex::new();
    let ids = header_chain(&mut index, 6, 6);
    let mut chain = ChainView::new();
    chain.set_tip(&index, Some(ids[5]));

    let mut coordinator = DownloadCoordinator::new();
    coordinator.init_peer(4);
    // The peer's best known block is below our tip.
    coordinator.update_block_availability(&index, 4, &index.entry(ids[3]).hash);
    let (blocks, staller) = coordinator.find_next_blocks_to_download(&index, &chain, 4, 8);
    assert!(blocks.is_empty());
    assert!(staller.is_none());
}

#[test]
fn exhausted_window_reports_stallers() {
    let mut index = BlockIndex::new();
    // Long header chain; only genesis has data.
    let window = emberd_consensus::constants::BLOCK_DOWNLOAD_WINDOW;
    let ids = header_chain(&mut index, window + 10, 1);
    let mut chain = ChainView::new();
    chain.set_tip(&index, Some(ids[0]));

    let mut coordinator = DownloadCoordinator::new();
    coordinator.init_peer(1);
    coordinator.init_peer(2);
    let best = *ids.last().unwrap();
    coordinator.update_block_availability(&index, 1, &index.entry(best).hash);
    coordinator.update_block_availability(&index, 2, &index.entry(best).hash);

    // Peer 1 claims the entire window.
    for id in &ids[1..=window as usize] {
        coordinator.mark_block_in_flight(1, index.entry(*id).hash, Some(*id), 0, 600);
    }

    // Peer 2 cannot fetch anything inside the window; peer 1 is stalling it.
    let (blocks, staller) = coordinator.find_next_blocks_to_download(&index, &chain, 2, 4);
    assert!(blocks.is_empty());
    let staller = staller.expect("window exhausted");
    let expected: HashSet<NodeId> = [1].into_iter().collect();
    assert_eq!(staller, expected);

    coordinator.note_stalling(&staller, 1_000);
    assert_eq!(coordinator.check_timeouts(1_003, 0), vec![1]);
}
