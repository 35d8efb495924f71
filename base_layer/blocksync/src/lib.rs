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

//! # Block synchronisation
//!
//! A node that has fallen behind the canonical chain catches up by downloading historical blocks from several,
//! only partially trusted peers, verifying each block with the commit carried by its successor and applying them
//! strictly in height order. Once the local tip is within one block of the best height advertised by its peers,
//! control is handed back to consensus.
//!
//! The moving parts are:
//! * [BlockPool](pool::BlockPool) - keeps track of peers and their advertised ranges and runs one request task per
//!   height in a bounded window ahead of the local tip.
//! * [BlockSyncReactor](reactor::BlockSyncReactor) - translates wire messages into pool calls, serves blocks to other
//!   peers and runs the driver loop that verifies, stores and applies fetched blocks.
//!
//! Storage, block execution, consensus and the transport are consumed through the traits in [interfaces].

pub mod blocks;
pub mod chain_state;
pub mod commit;
pub mod config;
pub mod error;
pub mod hashing;
pub mod interfaces;
pub mod lifecycle;
#[cfg(feature = "metrics")]
mod metrics;
pub mod pool;
pub mod proto;
pub mod reactor;
pub mod test_helpers;
pub mod validators;

pub use blocks::{Block, BlockHash, BlockHeader, BlockId, Height, NodeId, PartSet, PartSetHeader};
pub use chain_state::ChainState;
pub use commit::{BlockIdFlag, Commit, CommitSig, ExtendedCommit, ExtendedCommitSig};
pub use config::{BlockSyncConfig, SelfRemediationConfig};
pub use error::BlockSyncError;
pub use pool::{BlockPool, BlockRequest, PeerFault, PoolStatus, RetryReason};
pub use reactor::{BlockSyncReactor, BlockSyncStatus};
pub use validators::{Validator, ValidatorSet};
