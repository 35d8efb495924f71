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

//! The collaborators block sync is wired to: peer management and transport, block storage, block execution and
//! consensus.

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    blocks::{Block, BlockId, Height, NodeId, PartSet},
    chain_state::ChainState,
    commit::{Commit, ExtendedCommit},
    error::{ChainStorageError, ExecutorError, TransportError},
    proto::BlockSyncMessage,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    Dialing,
    /// Connected and ready to receive requests
    Ready,
    Disconnected,
}

/// Read access to the transport's view of its peers.
pub trait PeerManager: Send + Sync {
    /// Higher is better. Peers with a score of zero or less are considered bad.
    fn score(&self, peer: &NodeId) -> i64;

    fn connection_state(&self, peer: &NodeId) -> PeerConnectionState;

    /// Called every time a peer successfully delivered a requested block.
    fn record_block_sync(&self, _peer: &NodeId) {}
}

#[async_trait]
pub trait OutboundMessaging: Send + Sync {
    async fn send(&self, peer: &NodeId, msg: BlockSyncMessage) -> Result<(), TransportError>;

    async fn broadcast(&self, msg: BlockSyncMessage) -> Result<(), TransportError>;

    /// Disconnects and penalises a peer.
    async fn evict(&self, peer: &NodeId, reason: String);
}

#[async_trait]
pub trait BlockStore: Send + Sync {
    /// The height of the highest stored block, or 0 if the store is empty
    fn height(&self) -> Height;

    /// The height of the lowest stored block, or 0 if the store is empty
    fn base(&self) -> Height;

    async fn load_block(&self, height: Height) -> Result<Option<Block>, ChainStorageError>;

    async fn load_ext_commit(&self, _height: Height) -> Result<Option<ExtendedCommit>, ChainStorageError> {
        Ok(None)
    }

    /// Persists a block together with the commit that proves it, taken from the next block.
    async fn save_block(&self, block: &Block, parts: &PartSet, seen_commit: &Commit) -> Result<(), ChainStorageError>;
}

#[async_trait]
pub trait BlockExecutor: Send + Sync {
    /// Full validation of a block against the current chain state.
    async fn validate_block(&self, state: &ChainState, block: &Block) -> Result<(), ExecutorError>;

    /// Executes a validated block and returns the resulting state.
    async fn apply_block(&self, state: ChainState, block_id: BlockId, block: &Block)
        -> Result<ChainState, ExecutorError>;
}

#[async_trait]
pub trait ConsensusHandle: Send + Sync {
    /// Hands over to consensus. `blocks_synced` is false when the node was already at the tip, in which case
    /// consensus may need to replay its WAL.
    async fn switch_to_consensus(&self, state: ChainState, blocks_synced: bool);
}

/// Invoked when the node should restart itself. Must be idempotent and must not block.
pub type RestartHook = Arc<dyn Fn() + Send + Sync>;

/// Invoked with the reason when a committed block could not be saved or applied. Local state can no longer be trusted
/// and the node must not keep running.
pub type FatalHook = Arc<dyn Fn(&str) + Send + Sync>;

/// A raw message received on the block sync channel.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub source: NodeId,
    pub bytes: Vec<u8>,
}

impl InboundMessage {
    pub fn new(source: NodeId, bytes: Vec<u8>) -> Self {
        Self { source, bytes }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Up,
    Down,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerUpdate {
    pub node_id: NodeId,
    pub status: PeerStatus,
}
