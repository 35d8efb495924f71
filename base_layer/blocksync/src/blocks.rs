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

use std::fmt::{Display, Formatter};

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use tari_utilities::hex::to_hex;

use crate::{
    commit::Commit,
    error::BlockValidationError,
    hashing::{merkle_root, BlockSyncHasher},
};

pub type Height = u64;
pub type FixedHash = [u8; 32];
pub type BlockHash = FixedHash;

/// Blocks are gossiped and stored in parts of this size
pub const BLOCK_PART_SIZE_BYTES: usize = 65536;
pub const MAX_BLOCK_SIZE_BYTES: usize = 100 * 1024 * 1024;

/// The transport's identifier for a peer.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize, BorshSerialize, BorshDeserialize,
)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new<T: Into<String>>(id: T) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, BorshSerialize, BorshDeserialize)]
pub struct PartSetHeader {
    pub total: u32,
    pub hash: FixedHash,
}

/// The canonical identifier of a block: its header hash plus the structure of its part set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, BorshSerialize, BorshDeserialize)]
pub struct BlockId {
    pub hash: BlockHash,
    pub part_set_header: PartSetHeader,
}

impl BlockId {
    pub fn is_zero(&self) -> bool {
        *self == BlockId::default()
    }
}

impl Display for BlockId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            to_hex(&self.hash),
            self.part_set_header.total,
            to_hex(&self.part_set_header.hash)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Part {
    pub index: u32,
    pub bytes: Vec<u8>,
}

/// A block split into fixed size parts, committed to by the Merkle root of the parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartSet {
    header: PartSetHeader,
    parts: Vec<Part>,
}

impl PartSet {
    pub fn from_data(data: &[u8], part_size: usize) -> Self {
        let parts = data
            .chunks(part_size.max(1))
            .enumerate()
            .map(|(index, chunk)| Part {
                index: index as u32,
                bytes: chunk.to_vec(),
            })
            .collect::<Vec<_>>();
        let hash = merkle_root(&parts.iter().map(|p| p.bytes.as_slice()).collect::<Vec<_>>());
        Self {
            header: PartSetHeader {
                total: parts.len() as u32,
                hash,
            },
            parts,
        }
    }

    pub fn header(&self) -> PartSetHeader {
        self.header
    }

    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    pub fn byte_size(&self) -> usize {
        self.parts.iter().map(|p| p.bytes.len()).sum()
    }

    pub fn to_data(&self) -> Vec<u8> {
        self.parts.iter().flat_map(|p| p.bytes.iter().copied()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct BlockHeader {
    pub chain_id: String,
    pub height: Height,
    /// Unix timestamp in seconds
    pub timestamp: u64,
    pub last_block_id: BlockId,
    pub last_commit_hash: FixedHash,
    pub data_hash: FixedHash,
    pub validators_hash: FixedHash,
    pub app_hash: FixedHash,
}

impl BlockHeader {
    pub fn hash(&self) -> BlockHash {
        BlockSyncHasher::new_with_label("block_header")
            .chain(self)
            .finalize()
            .into()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Vec<u8>>,
    /// The commit for the previous block. Absent for the first block of a chain.
    pub last_commit: Option<Commit>,
}

impl Block {
    pub fn height(&self) -> Height {
        self.header.height
    }

    pub fn hash(&self) -> BlockHash {
        self.header.hash()
    }

    pub fn data_hash(transactions: &[Vec<u8>]) -> FixedHash {
        merkle_root(transactions)
    }

    pub fn make_part_set(&self, part_size: usize) -> Result<PartSet, BlockValidationError> {
        let data = borsh::to_vec(self).map_err(|e| BlockValidationError::Encoding(e.to_string()))?;
        Ok(PartSet::from_data(&data, part_size))
    }

    /// Builds the identifier peers use to refer to this block.
    pub fn block_id(&self, part_size: usize) -> Result<(BlockId, PartSet), BlockValidationError> {
        let parts = self.make_part_set(part_size)?;
        let id = BlockId {
            hash: self.hash(),
            part_set_header: parts.header(),
        };
        Ok((id, parts))
    }

    /// Checks that the block is internally consistent. Does not check it against chain state.
    pub fn validate_basic(&self) -> Result<(), BlockValidationError> {
        if self.header.height == 0 {
            return Err(BlockValidationError::ZeroHeight);
        }
        if self.header.data_hash != Self::data_hash(&self.transactions) {
            return Err(BlockValidationError::DataHashMismatch);
        }
        match &self.last_commit {
            Some(commit) => {
                let expected = self.header.height - 1;
                if commit.height != expected {
                    return Err(BlockValidationError::LastCommitHeightMismatch {
                        expected,
                        actual: commit.height,
                    });
                }
                if self.header.last_commit_hash != commit.hash() {
                    return Err(BlockValidationError::LastCommitHashMismatch);
                }
                if self.header.last_block_id != commit.block_id {
                    return Err(BlockValidationError::LastBlockIdMismatch);
                }
            },
            None => {
                // Only the first block of a chain may omit the last commit
                if !self.header.last_block_id.is_zero() {
                    return Err(BlockValidationError::MissingLastCommit {
                        height: self.header.height,
                    });
                }
            },
        }
        Ok(())
    }
}

impl Display for Block {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Block #{} ({}, {} tx(s))",
            self.header.height,
            to_hex(&self.hash()),
            self.transactions.len()
        )
    }
}
