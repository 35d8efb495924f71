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

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    blocks::{Block, BlockId, Height, NodeId, PartSet},
    chain_state::ChainState,
    commit::{Commit, ExtendedCommit},
    error::{BlockValidationError, ChainStorageError, ExecutorError, TransportError},
    interfaces::{
        BlockExecutor,
        BlockStore,
        ConsensusHandle,
        FatalHook,
        OutboundMessaging,
        PeerConnectionState,
        PeerManager,
    },
    proto::BlockSyncMessage,
    test_helpers::TestChain,
};

fn acquire<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct PeerManagerMockState {
    scores: HashMap<NodeId, i64>,
    states: HashMap<NodeId, PeerConnectionState>,
    block_syncs: HashMap<NodeId, usize>,
}

/// Every peer is `Ready` with a score of 1 unless set otherwise.
#[derive(Debug, Clone, Default)]
pub struct MockPeerManager {
    state: Arc<Mutex<PeerManagerMockState>>,
}

impl MockPeerManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_score(&self, peer: &NodeId, score: i64) {
        acquire(&self.state).scores.insert(peer.clone(), score);
    }

    pub fn set_state(&self, peer: &NodeId, state: PeerConnectionState) {
        acquire(&self.state).states.insert(peer.clone(), state);
    }

    /// Number of blocks `peer` delivered successfully
    pub fn block_syncs(&self, peer: &NodeId) -> usize {
        acquire(&self.state).block_syncs.get(peer).copied().unwrap_or(0)
    }
}

impl PeerManager for MockPeerManager {
    fn score(&self, peer: &NodeId) -> i64 {
        acquire(&self.state).scores.get(peer).copied().unwrap_or(1)
    }

    fn connection_state(&self, peer: &NodeId) -> PeerConnectionState {
        acquire(&self.state)
            .states
            .get(peer)
            .copied()
            .unwrap_or(PeerConnectionState::Ready)
    }

    fn record_block_sync(&self, peer: &NodeId) {
        *acquire(&self.state).block_syncs.entry(peer.clone()).or_default() += 1;
    }
}

/// A message sent to one peer, or to every peer if `peer` is `None`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub peer: Option<NodeId>,
    pub message: BlockSyncMessage,
}

#[derive(Debug, Default)]
struct OutboundMockState {
    sent: Vec<SentMessage>,
    evictions: Vec<(NodeId, String)>,
    forward_tx: Option<mpsc::UnboundedSender<SentMessage>>,
}

/// Records outbound traffic. Messages can also be forwarded to a receiver so that tests can play the remote peers.
#[derive(Debug, Clone, Default)]
pub struct MockOutbound {
    state: Arc<Mutex<OutboundMockState>>,
}

impl MockOutbound {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn forwarding() -> (Self, mpsc::UnboundedReceiver<SentMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mock = Self::new();
        acquire(&mock.state).forward_tx = Some(tx);
        (mock, rx)
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        acquire(&self.state).sent.clone()
    }

    pub fn take_sent(&self) -> Vec<SentMessage> {
        acquire(&self.state).sent.drain(..).collect()
    }

    pub fn sent_to(&self, peer: &NodeId) -> Vec<BlockSyncMessage> {
        acquire(&self.state)
            .sent
            .iter()
            .filter(|m| m.peer.as_ref() == Some(peer))
            .map(|m| m.message.clone())
            .collect()
    }

    pub fn evictions(&self) -> Vec<(NodeId, String)> {
        acquire(&self.state).evictions.clone()
    }

    pub fn is_evicted(&self, peer: &NodeId) -> bool {
        acquire(&self.state).evictions.iter().any(|(p, _)| p == peer)
    }

    fn record(&self, msg: SentMessage) {
        let mut state = acquire(&self.state);
        if let Some(tx) = state.forward_tx.as_ref() {
            let _result = tx.send(msg.clone());
        }
        state.sent.push(msg);
    }
}

#[async_trait]
impl OutboundMessaging for MockOutbound {
    async fn send(&self, peer: &NodeId, message: BlockSyncMessage) -> Result<(), TransportError> {
        self.record(SentMessage {
            peer: Some(peer.clone()),
            message,
        });
        Ok(())
    }

    async fn broadcast(&self, message: BlockSyncMessage) -> Result<(), TransportError> {
        self.record(SentMessage { peer: None, message });
        Ok(())
    }

    async fn evict(&self, peer: &NodeId, reason: String) {
        acquire(&self.state).evictions.push((peer.clone(), reason));
    }
}

#[derive(Debug, Clone)]
struct StoredBlock {
    block: Block,
    seen_commit: Commit,
    ext_commit: Option<ExtendedCommit>,
}

/// In-memory block store
#[derive(Debug, Clone, Default)]
pub struct MemoryBlockStore {
    blocks: Arc<Mutex<BTreeMap<Height, StoredBlock>>>,
    failing_saves: Arc<Mutex<HashSet<Height>>>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store holding the blocks of `chain` up to and including `height`
    pub fn with_chain(chain: &TestChain, height: Height) -> Self {
        let store = Self::new();
        for h in 1..=height {
            store.insert(chain.block(h), chain.commit(h), Some(chain.ext_commit(h)));
        }
        store
    }

    pub fn insert(&self, block: Block, seen_commit: Commit, ext_commit: Option<ExtendedCommit>) {
        acquire(&self.blocks).insert(block.height(), StoredBlock {
            block,
            seen_commit,
            ext_commit,
        });
    }

    pub fn get(&self, height: Height) -> Option<Block> {
        acquire(&self.blocks).get(&height).map(|b| b.block.clone())
    }

    pub fn seen_commit(&self, height: Height) -> Option<Commit> {
        acquire(&self.blocks).get(&height).map(|b| b.seen_commit.clone())
    }

    /// Makes saving the block at `height` fail
    pub fn fail_save(&self, height: Height) {
        acquire(&self.failing_saves).insert(height);
    }
}

#[async_trait]
impl BlockStore for MemoryBlockStore {
    fn height(&self) -> Height {
        acquire(&self.blocks).keys().next_back().copied().unwrap_or(0)
    }

    fn base(&self) -> Height {
        acquire(&self.blocks).keys().next().copied().unwrap_or(0)
    }

    async fn load_block(&self, height: Height) -> Result<Option<Block>, ChainStorageError> {
        Ok(self.get(height))
    }

    async fn load_ext_commit(&self, height: Height) -> Result<Option<ExtendedCommit>, ChainStorageError> {
        Ok(acquire(&self.blocks).get(&height).and_then(|b| b.ext_commit.clone()))
    }

    async fn save_block(&self, block: &Block, _parts: &PartSet, seen_commit: &Commit) -> Result<(), ChainStorageError> {
        if acquire(&self.failing_saves).contains(&block.height()) {
            return Err(ChainStorageError::AccessError("disk full".to_string()));
        }
        let expected = self.height() + 1;
        if self.height() > 0 && block.height() != expected {
            return Err(ChainStorageError::InsertError {
                height: block.height(),
                reason: format!("expected block at height {}", expected),
            });
        }
        self.insert(block.clone(), seen_commit.clone(), None);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ExecutorMockState {
    invalid_heights: HashSet<Height>,
    failing_heights: HashSet<Height>,
    applied: Vec<Height>,
}

/// Validates blocks with [ChainState::validate_block] and applies them with [ChainState::next_state]. Selected
/// heights can be made to fail validation or application.
#[derive(Debug, Clone, Default)]
pub struct MockExecutor {
    state: Arc<Mutex<ExecutorMockState>>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// The first validation of a block at `height` fails
    pub fn reject_once(&self, height: Height) {
        acquire(&self.state).invalid_heights.insert(height);
    }

    /// Applying a block at `height` fails
    pub fn fail_apply(&self, height: Height) {
        acquire(&self.state).failing_heights.insert(height);
    }

    pub fn applied(&self) -> Vec<Height> {
        acquire(&self.state).applied.clone()
    }
}

#[async_trait]
impl BlockExecutor for MockExecutor {
    async fn validate_block(&self, state: &ChainState, block: &Block) -> Result<(), ExecutorError> {
        if acquire(&self.state).invalid_heights.remove(&block.height()) {
            return Err(BlockValidationError::AppHashMismatch.into());
        }
        state.validate_block(block)?;
        Ok(())
    }

    async fn apply_block(
        &self,
        state: ChainState,
        block_id: BlockId,
        block: &Block,
    ) -> Result<ChainState, ExecutorError> {
        let mut mock_state = acquire(&self.state);
        if mock_state.failing_heights.contains(&block.height()) {
            return Err(ExecutorError::ApplyFailed {
                height: block.height(),
                reason: "mock failure".to_string(),
            });
        }
        mock_state.applied.push(block.height());
        Ok(state.next_state(block_id, block))
    }
}

/// Records hand-offs to consensus.
#[derive(Debug, Clone, Default)]
pub struct MockConsensus {
    switches: Arc<Mutex<Vec<(ChainState, bool)>>>,
}

impl MockConsensus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn switches(&self) -> Vec<(ChainState, bool)> {
        acquire(&self.switches).clone()
    }
}

#[async_trait]
impl ConsensusHandle for MockConsensus {
    async fn switch_to_consensus(&self, state: ChainState, blocks_synced: bool) {
        acquire(&self.switches).push((state, blocks_synced));
    }
}

/// Records fatal failures instead of aborting the process
#[derive(Debug, Clone, Default)]
pub struct MockFatalHook {
    reasons: Arc<Mutex<Vec<String>>>,
}

impl MockFatalHook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hook(&self) -> FatalHook {
        let reasons = self.reasons.clone();
        Arc::new(move |reason: &str| acquire(&reasons).push(reason.to_string()))
    }

    pub fn reasons(&self) -> Vec<String> {
        acquire(&self.reasons).clone()
    }
}
