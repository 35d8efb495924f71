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

#![allow(dead_code)]

use std::sync::Arc;

use tari_blocksync::{
    config::BlockSyncConfig,
    interfaces::InboundMessage,
    pool::{BlockPool, BlockRequest, PeerFault},
    proto::BlockSyncMessage,
    test_helpers::{MockOutbound, MockPeerManager, SentMessage, TestChain},
    Block,
    BlockHeader,
    BlockId,
    Height,
    NodeId,
};
use tokio::{sync::mpsc, task::JoinHandle};

pub fn init_logging() {
    let _ = env_logger::try_init();
}

/// A block that carries nothing but its height. Good enough for the pool, which does not look inside blocks.
pub fn bare_block(height: Height) -> Block {
    let transactions: Vec<Vec<u8>> = Vec::new();
    Block {
        header: BlockHeader {
            chain_id: "pool-test".to_string(),
            height,
            timestamp: 0,
            last_block_id: BlockId::default(),
            last_commit_hash: Default::default(),
            data_hash: Block::data_hash(&transactions),
            validators_hash: Default::default(),
            app_hash: Default::default(),
        },
        transactions,
        last_commit: None,
    }
}

pub struct PoolHarness {
    pub pool: BlockPool,
    pub requests_rx: mpsc::Receiver<BlockRequest>,
    pub faults_rx: mpsc::Receiver<PeerFault>,
    pub peer_manager: MockPeerManager,
}

pub fn create_pool(config: BlockSyncConfig, start_height: Height) -> PoolHarness {
    let (requests_tx, requests_rx) = mpsc::channel(config.max_total_requesters);
    let (faults_tx, faults_rx) = mpsc::channel(config.max_peer_err_buffer);
    let peer_manager = MockPeerManager::new();
    let pool = BlockPool::new(
        config,
        start_height,
        Arc::new(peer_manager.clone()),
        requests_tx,
        faults_tx,
    );
    PoolHarness {
        pool,
        requests_rx,
        faults_rx,
        peer_manager,
    }
}

/// A remote node that serves the blocks of `chain`
#[derive(Clone)]
pub struct SimulatedPeer {
    pub node_id: NodeId,
    pub chain: Arc<TestChain>,
}

impl SimulatedPeer {
    pub fn new(node_id: &str, chain: Arc<TestChain>) -> Self {
        Self {
            node_id: NodeId::from(node_id),
            chain,
        }
    }

    pub fn status(&self) -> BlockSyncMessage {
        BlockSyncMessage::StatusResponse {
            base: 1,
            height: self.chain.height(),
        }
    }

    fn respond(&self, height: Height) -> BlockSyncMessage {
        if height == 0 || height > self.chain.height() {
            return BlockSyncMessage::NoBlockResponse { height };
        }
        BlockSyncMessage::BlockResponse {
            block: Box::new(self.chain.block(height)),
            ext_commit: Some(self.chain.ext_commit(height)),
        }
    }
}

pub async fn send_from(messages_tx: &mpsc::Sender<InboundMessage>, peer: &NodeId, msg: BlockSyncMessage) {
    messages_tx
        .send(InboundMessage::new(peer.clone(), msg.to_encoded_bytes().unwrap()))
        .await
        .unwrap();
}

/// Plays the remote side of every message the reactor sends. Evicted peers go silent.
pub fn spawn_network(
    peers: Vec<SimulatedPeer>,
    outbound: MockOutbound,
    mut sent_rx: mpsc::UnboundedReceiver<SentMessage>,
    messages_tx: mpsc::Sender<InboundMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(SentMessage { peer, message }) = sent_rx.recv().await {
            let recipients = peers
                .iter()
                .filter(|p| peer.as_ref().map(|id| *id == p.node_id).unwrap_or(true))
                .filter(|p| !outbound.is_evicted(&p.node_id));
            for sim in recipients {
                let reply = match &message {
                    BlockSyncMessage::BlockRequest { height } => sim.respond(*height),
                    BlockSyncMessage::StatusRequest => sim.status(),
                    _ => continue,
                };
                if messages_tx
                    .send(InboundMessage::new(sim.node_id.clone(), reply.to_encoded_bytes().unwrap()))
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }
    })
}
