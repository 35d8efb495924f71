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

use borsh::{BorshDeserialize, BorshSerialize};
use tari_crypto::ristretto::RistrettoSchnorr;

use crate::{
    blocks::{BlockId, FixedHash, Height},
    hashing::BlockSyncHasher,
    validators::ValidatorAddress,
};

/// What a validator voted for in a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum BlockIdFlag {
    /// No vote was received from the validator
    Absent,
    /// Voted for the committed block
    Commit,
    /// Voted for nil
    Nil,
}

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct CommitSig {
    pub block_id_flag: BlockIdFlag,
    pub validator_address: ValidatorAddress,
    pub timestamp: u64,
    pub signature: Option<RistrettoSchnorr>,
}

impl CommitSig {
    pub fn absent() -> Self {
        Self {
            block_id_flag: BlockIdFlag::Absent,
            validator_address: ValidatorAddress::default(),
            timestamp: 0,
            signature: None,
        }
    }

    pub fn is_commit(&self) -> bool {
        self.block_id_flag == BlockIdFlag::Commit
    }
}

/// +2/3 precommits for a block, carried in the `last_commit` of the next block.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Commit {
    pub height: Height,
    pub round: u32,
    pub block_id: BlockId,
    pub signatures: Vec<CommitSig>,
}

impl Commit {
    pub fn hash(&self) -> FixedHash {
        BlockSyncHasher::new_with_label("commit").chain(self).finalize().into()
    }

    /// The message validator `index` signed for this commit.
    pub fn vote_sign_bytes(&self, chain_id: &str, index: usize) -> Option<FixedHash> {
        let sig = self.signatures.get(index)?;
        let block_id = match sig.block_id_flag {
            BlockIdFlag::Commit => self.block_id,
            BlockIdFlag::Absent | BlockIdFlag::Nil => BlockId::default(),
        };
        Some(vote_sign_bytes(chain_id, self.height, self.round, &block_id, sig.timestamp))
    }
}

pub fn vote_sign_bytes(chain_id: &str, height: Height, round: u32, block_id: &BlockId, timestamp: u64) -> FixedHash {
    BlockSyncHasher::new_with_label("precommit")
        .chain(&chain_id)
        .chain(&height)
        .chain(&round)
        .chain(block_id)
        .chain(&timestamp)
        .finalize()
        .into()
}

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ExtendedCommitSig {
    pub commit_sig: CommitSig,
    pub extension: Vec<u8>,
    pub extension_signature: Option<RistrettoSchnorr>,
}

/// A commit that also carries the vote extensions consensus needs to resume at this height.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ExtendedCommit {
    pub height: Height,
    pub round: u32,
    pub block_id: BlockId,
    pub extended_signatures: Vec<ExtendedCommitSig>,
}

impl ExtendedCommit {
    pub fn to_commit(&self) -> Commit {
        Commit {
            height: self.height,
            round: self.round,
            block_id: self.block_id,
            signatures: self
                .extended_signatures
                .iter()
                .map(|s| s.commit_sig.clone())
                .collect(),
        }
    }
}

impl From<Commit> for ExtendedCommit {
    fn from(commit: Commit) -> Self {
        Self {
            height: commit.height,
            round: commit.round,
            block_id: commit.block_id,
            extended_signatures: commit
                .signatures
                .into_iter()
                .map(|commit_sig| ExtendedCommitSig {
                    commit_sig,
                    extension: Vec::new(),
                    extension_signature: None,
                })
                .collect(),
        }
    }
}
