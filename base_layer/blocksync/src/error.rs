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

use crate::blocks::{Height, NodeId};

#[derive(Debug, thiserror::Error)]
pub enum BlockSyncError {
    #[error("Service state error: {0}")]
    ServiceState(#[from] ServiceStateError),
    #[error("Block pool error: {0}")]
    Pool(#[from] PoolError),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Commit verification failed: {0}")]
    CommitVerification(#[from] CommitVerificationError),
    #[error("Block validation failed: {0}")]
    BlockValidation(#[from] BlockValidationError),
    #[error("Chain storage error: {0}")]
    ChainStorage(#[from] ChainStorageError),
    #[error("Block executor error: {0}")]
    Executor(#[from] ExecutorError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigurationError),
    #[error("State ({state_height}) and store ({store_height}) height mismatch")]
    StateStoreHeightMismatch { state_height: Height, store_height: Height },
    #[error("Block sync is already running")]
    AlreadySyncing,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceStateError {
    #[error("Service already started")]
    AlreadyStarted,
    #[error("Service already stopped")]
    AlreadyStopped,
    #[error("Service is not running")]
    NotRunning,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("Peer {peer} sent us a block we didn't expect (height {height}, pool height {pool_height})")]
    UnexpectedBlock {
        peer: NodeId,
        height: Height,
        pool_height: Height,
    },
    #[error("Block height {block_height} does not match extended commit height {commit_height}")]
    HeightMismatch {
        block_height: Height,
        commit_height: Height,
    },
    #[error("Requested block #{height} from {requested}, but got it from {peer}")]
    ConflictingBlock {
        height: Height,
        requested: String,
        peer: NodeId,
    },
    #[error("Block #{height} from {peer} ignored: peer is not part of the pool")]
    UnknownPeer { peer: NodeId, height: Height },
    #[error("Expected a block at height {0} to pop")]
    NothingToPop(Height),
    #[error("Service state error: {0}")]
    ServiceState(#[from] ServiceStateError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommitVerificationError {
    #[error("Invalid commit: wrong set size: {expected} vs {actual}")]
    InvalidCommitSignatures { expected: usize, actual: usize },
    #[error("Invalid commit: wrong height: {expected} vs {actual}")]
    InvalidHeight { expected: Height, actual: Height },
    #[error("Invalid commit: wrong block ID: want {expected}, got {actual}")]
    BlockIdMismatch { expected: String, actual: String },
    #[error("Wrong validator address in commit signature #{index}")]
    ValidatorAddressMismatch { index: usize },
    #[error("Commit signature #{index} has no signature")]
    MissingSignature { index: usize },
    #[error("Wrong signature (#{index})")]
    InvalidSignature { index: usize },
    #[error("Invalid commit: insufficient voting power: got {got}, needed more than {needed}")]
    NotEnoughVotingPower { got: i64, needed: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlockValidationError {
    #[error("Block height must be greater than zero")]
    ZeroHeight,
    #[error("Wrong block chain id. Expected {expected}, got {actual}")]
    WrongChainId { expected: String, actual: String },
    #[error("Wrong block height. Expected {expected}, got {actual}")]
    WrongHeight { expected: Height, actual: Height },
    #[error("Wrong block header last block id")]
    LastBlockIdMismatch,
    #[error("Wrong block header data hash")]
    DataHashMismatch,
    #[error("Wrong block header last commit hash")]
    LastCommitHashMismatch,
    #[error("Wrong block header validators hash")]
    ValidatorsHashMismatch,
    #[error("Wrong block header app hash")]
    AppHashMismatch,
    #[error("Block at height {height} is missing its last commit")]
    MissingLastCommit { height: Height },
    #[error("Last commit height {actual} does not follow block height (expected {expected})")]
    LastCommitHeightMismatch { expected: Height, actual: Height },
    #[error("Invalid last commit: {0}")]
    InvalidLastCommit(#[from] CommitVerificationError),
    #[error("Failed to encode block: {0}")]
    Encoding(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Message of {size} bytes exceeds the maximum message size of {max} bytes")]
    MessageTooLarge { size: usize, max: usize },
    #[error("Failed to decode message: {0}")]
    DecodeFailed(String),
    #[error("Failed to encode message: {0}")]
    EncodeFailed(String),
    #[error("Peer sent an invalid block: {0}")]
    InvalidBlock(#[from] BlockValidationError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainStorageError {
    #[error("Could not access the block store: {0}")]
    AccessError(String),
    #[error("Block at height {height} cannot be stored: {reason}")]
    InsertError { height: Height, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutorError {
    #[error("Invalid block: {0}")]
    InvalidBlock(#[from] BlockValidationError),
    #[error("Failed to apply block at height {height}: {reason}")]
    ApplyFailed { height: Height, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Peer {0} is not connected")]
    PeerNotConnected(NodeId),
    #[error("Outbound channel closed")]
    ChannelClosed,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("Could not load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("Invalid value for {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

impl ConfigurationError {
    pub fn invalid<T: Into<String>>(field: &'static str, message: T) -> Self {
        Self::Invalid {
            field,
            message: message.into(),
        }
    }
}
