//  Copyright 2024, The Tari Project
//
//  Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
//  following conditions are met:
//
//  1. Redistributions of source code must retain the above copyright notice, this list of conditions and the following
//  disclaimer.
//
//  2. Redistributions in binary form must reproduce the above copyright notice, this list of conditions and the
//  following disclaimer in the documentation and/or other materials provided with the distribution.
//
//  3. Neither the name of the copyright holder nor the names of its contributors may be used to endorse or promote
//  products derived from this software without specific prior written permission.
//
//  THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES,
//  INCLUDING, BUT NOT LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE
//  DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
//  SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR
//  SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY,
//  WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE
//  USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

mod helpers;

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use helpers::{init_logging, send_from, spawn_network, SimulatedPeer};
use tari_blocksync::{
    config::{BlockSyncConfig, SelfRemediationConfig},
    interfaces::InboundMessage,
    proto::BlockSyncMessage,
    reactor::{BlockSyncReactor, BlockSyncStatus, ReactorServices},
    test_helpers::{
        MemoryBlockStore,
        MockConsensus,
        MockExecutor,
        MockFatalHook,
        MockOutbound,
        MockPeerManager,
        TestChain,
    },
    BlockSyncError,
    NodeId,
};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
    time,
};

const CHAIN_HEIGHT: u64 = 20;

struct TestNode {
    reactor: BlockSyncReactor,
    messages_tx: mpsc::Sender<InboundMessage>,
    store: MemoryBlockStore,
    executor: MockExecutor,
    consensus: MockConsensus,
    outbound: MockOutbound,
    fatal: MockFatalHook,
    network: JoinHandle<()>,
}

fn setup_node(
    config: BlockSyncConfig,
    chain: &TestChain,
    peers: Vec<SimulatedPeer>,
    restarts: Arc<AtomicUsize>,
) -> TestNode {
    let store = MemoryBlockStore::new();
    let executor = MockExecutor::new();
    let consensus = MockConsensus::new();
    let fatal = MockFatalHook::new();
    let (outbound, sent_rx) = MockOutbound::forwarding();
    let services = ReactorServices {
        store: Arc::new(store.clone()),
        executor: Arc::new(executor.clone()),
        consensus: Arc::new(consensus.clone()),
        outbound: Arc::new(outbound.clone()),
        peer_manager: Arc::new(MockPeerManager::new()),
        restart_hook: Some(Arc::new(move || {
            restarts.fetch_add(1, Ordering::SeqCst);
        })),
        fatal_hook: Some(fatal.hook()),
    };
    let (messages_tx, messages_rx) = mpsc::channel(1000);
    let (_peer_updates_tx, peer_updates_rx) = mpsc::channel(10);
    let reactor = BlockSyncReactor::new(config, chain.genesis_state(), services, messages_rx, peer_updates_rx).unwrap();
    let network = spawn_network(peers, outbound.clone(), sent_rx, messages_tx.clone());
    TestNode {
        reactor,
        messages_tx,
        store,
        executor,
        consensus,
        outbound,
        fatal,
        network,
    }
}

async fn announce(node: &TestNode, peer: &SimulatedPeer) {
    send_from(&node.messages_tx, &peer.node_id, peer.status()).await;
}

async fn wait_for_completion(status: &mut broadcast::Receiver<BlockSyncStatus>) -> BlockSyncStatus {
    time::timeout(Duration::from_secs(120), status.recv())
        .await
        .expect("block sync did not complete")
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn it_syncs_from_peers_and_switches_to_consensus() {
    init_logging();
    let chain = Arc::new(TestChain::new(2, CHAIN_HEIGHT));
    let peers = vec![
        SimulatedPeer::new("alice", chain.clone()),
        SimulatedPeer::new("bob", chain.clone()),
    ];
    let node = setup_node(
        BlockSyncConfig::default(),
        &chain,
        peers.clone(),
        Arc::new(AtomicUsize::new(0)),
    );
    let mut status = node.reactor.subscribe_status();
    node.reactor.start().unwrap();
    assert!(node.reactor.is_block_syncing());
    for peer in &peers {
        announce(&node, peer).await;
    }

    let completed = wait_for_completion(&mut status).await;
    // The last block can only be verified with a commit from consensus
    assert_eq!(completed, BlockSyncStatus {
        complete: true,
        height: CHAIN_HEIGHT - 1
    });
    assert!(!node.reactor.is_block_syncing());
    assert_eq!(node.reactor.total_synced_time(), Duration::ZERO);
    assert_eq!(node.store.get(CHAIN_HEIGHT - 1), Some(chain.block(CHAIN_HEIGHT - 1)));
    assert!(node.store.get(CHAIN_HEIGHT).is_none());

    let switches = node.consensus.switches();
    assert_eq!(switches.len(), 1);
    assert_eq!(switches[0].0, chain.state_at(CHAIN_HEIGHT - 1));
    assert!(switches[0].1);
    assert!(node.outbound.evictions().is_empty());
    assert!(!node.reactor.pool().is_running());

    // A stopped pool cannot be started again
    assert!(matches!(
        node.reactor.switch_to_block_sync(chain.state_at(CHAIN_HEIGHT - 1)),
        Err(BlockSyncError::Pool(_))
    ));

    node.reactor.stop();
    node.reactor.wait().await;
    node.network.abort();
}

#[tokio::test(start_paused = true)]
async fn a_peer_serving_forged_blocks_is_evicted() {
    init_logging();
    let chain = Arc::new(TestChain::new(1, CHAIN_HEIGHT));
    let forged = Arc::new(TestChain::new(1, CHAIN_HEIGHT));
    let mallory = SimulatedPeer::new("mallory", forged);
    let honest = vec![
        SimulatedPeer::new("alice", chain.clone()),
        SimulatedPeer::new("bob", chain.clone()),
    ];
    let mut peers = honest.clone();
    peers.push(mallory.clone());
    let node = setup_node(BlockSyncConfig::default(), &chain, peers, Arc::new(AtomicUsize::new(0)));
    let mut status = node.reactor.subscribe_status();
    node.reactor.start().unwrap();

    // Mallory is the only peer while the first requests go out
    announce(&node, &mallory).await;
    time::sleep(Duration::from_millis(250)).await;
    for peer in &honest {
        announce(&node, peer).await;
    }

    let completed = wait_for_completion(&mut status).await;
    assert_eq!(completed.height, CHAIN_HEIGHT - 1);
    let evictions = node.outbound.evictions();
    assert!(!evictions.is_empty());
    assert!(evictions.iter().all(|(peer, _)| *peer == mallory.node_id));
    assert!(evictions[0].1.starts_with("blocksync: "));
    assert_eq!(node.consensus.switches()[0].0, chain.state_at(CHAIN_HEIGHT - 1));
    for height in 1..CHAIN_HEIGHT {
        assert_eq!(node.store.get(height), Some(chain.block(height)));
    }

    node.reactor.stop();
    node.reactor.wait().await;
    node.network.abort();
}

#[tokio::test(start_paused = true)]
async fn a_node_that_falls_behind_requests_a_restart() {
    init_logging();
    let chain = Arc::new(TestChain::new(1, CHAIN_HEIGHT));
    let peers = vec![
        SimulatedPeer::new("alice", chain.clone()),
        SimulatedPeer::new("bob", chain.clone()),
    ];
    let config = BlockSyncConfig {
        self_remediation: SelfRemediationConfig {
            blocks_behind_threshold: 100,
            blocks_behind_check_interval: Duration::from_secs(5),
            restart_cooldown: Duration::from_secs(30),
        },
        ..Default::default()
    };
    let restarts = Arc::new(AtomicUsize::new(0));
    let node = setup_node(config, &chain, peers.clone(), restarts.clone());
    let mut status = node.reactor.subscribe_status();
    let started = time::Instant::now();
    node.reactor.start().unwrap();
    for peer in &peers {
        announce(&node, peer).await;
    }
    wait_for_completion(&mut status).await;
    assert!(started.elapsed() < Duration::from_secs(10));

    // The network moves on without us
    send_from(&node.messages_tx, &NodeId::from("carol"), BlockSyncMessage::StatusResponse {
        base: 1,
        height: 500,
    })
    .await;
    time::sleep_until(started + Duration::from_secs(20)).await;
    assert_eq!(node.reactor.max_peer_block_height(), 500);
    assert_eq!(restarts.load(Ordering::SeqCst), 0);

    time::sleep_until(started + Duration::from_secs(45)).await;
    assert_eq!(restarts.load(Ordering::SeqCst), 1);
    assert!(node.reactor.is_block_syncing());

    time::sleep(Duration::from_secs(60)).await;
    assert_eq!(restarts.load(Ordering::SeqCst), 1);

    node.reactor.stop();
    node.reactor.wait().await;
    node.network.abort();
}

#[tokio::test(start_paused = true)]
async fn a_block_that_cannot_be_applied_halts_the_node() {
    init_logging();
    let chain = Arc::new(TestChain::new(1, CHAIN_HEIGHT));
    let peers = vec![
        SimulatedPeer::new("alice", chain.clone()),
        SimulatedPeer::new("bob", chain.clone()),
    ];
    let node = setup_node(
        BlockSyncConfig::default(),
        &chain,
        peers.clone(),
        Arc::new(AtomicUsize::new(0)),
    );
    node.executor.fail_apply(3);
    let mut status = node.reactor.subscribe_status();
    node.reactor.start().unwrap();
    for peer in &peers {
        announce(&node, peer).await;
    }

    time::sleep(Duration::from_secs(30)).await;
    let reasons = node.fatal.reasons();
    assert_eq!(reasons.len(), 1);
    assert!(reasons[0].starts_with("failed to process committed block (3:"));

    // Nothing is applied on top of the failed block and consensus never takes over
    assert_eq!(node.executor.applied(), vec![1, 2]);
    assert!(node.store.get(3).is_some());
    assert!(node.store.get(4).is_none());
    assert!(!node.reactor.pool().is_running());
    assert!(node.consensus.switches().is_empty());
    assert!(status.try_recv().is_err());

    // Every task has exited without an explicit stop
    time::timeout(Duration::from_secs(5), node.reactor.wait())
        .await
        .expect("reactor tasks are still running");
    node.network.abort();
}
