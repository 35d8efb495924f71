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

use crate::{
    blocks::{Block, BlockId, FixedHash, Height},
    error::BlockValidationError,
    validators::ValidatorSet,
};

/// The committed chain state that blocks are validated against and applied to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainState {
    pub chain_id: String,
    pub initial_height: Height,
    /// Zero before the first block is applied
    pub last_block_height: Height,
    pub last_block_id: BlockId,
    pub last_block_time: u64,
    pub validators: ValidatorSet,
    pub app_hash: FixedHash,
}

impl ChainState {
    pub fn new_genesis(chain_id: String, initial_height: Height, validators: ValidatorSet) -> Self {
        Self {
            chain_id,
            initial_height,
            last_block_height: 0,
            last_block_id: BlockId::default(),
            last_block_time: 0,
            validators,
            app_hash: FixedHash::default(),
        }
    }

    /// The height of the next block to apply.
    pub fn next_height(&self) -> Height {
        if self.last_block_height == 0 {
            self.initial_height
        } else {
            self.last_block_height + 1
        }
    }

    /// Checks that `block` can be applied on top of this state: it must be internally consistent, follow the last
    /// block and, unless it is the first block of the chain, carry a valid commit for the last block.
    pub fn validate_block(&self, block: &Block) -> Result<(), BlockValidationError> {
        block.validate_basic()?;

        let header = &block.header;
        if header.chain_id != self.chain_id {
            return Err(BlockValidationError::WrongChainId {
                expected: self.chain_id.clone(),
                actual: header.chain_id.clone(),
            });
        }
        let expected_height = self.next_height();
        if header.height != expected_height {
            return Err(BlockValidationError::WrongHeight {
                expected: expected_height,
                actual: header.height,
            });
        }
        if header.last_block_id != self.last_block_id {
            return Err(BlockValidationError::LastBlockIdMismatch);
        }
        if header.validators_hash != self.validators.hash() {
            return Err(BlockValidationError::ValidatorsHashMismatch);
        }
        if header.app_hash != self.app_hash {
            return Err(BlockValidationError::AppHashMismatch);
        }

        if header.height == self.initial_height {
            return Ok(());
        }
        let last_commit = block
            .last_commit
            .as_ref()
            .ok_or(BlockValidationError::MissingLastCommit { height: header.height })?;
        self.validators.verify_commit_light(
            &self.chain_id,
            &self.last_block_id,
            self.last_block_height,
            last_commit,
        )?;
        Ok(())
    }

    /// The state after `block` has been applied. The app hash is carried over unchanged.
    pub fn next_state(&self, block_id: BlockId, block: &Block) -> ChainState {
        ChainState {
            chain_id: self.chain_id.clone(),
            initial_height: self.initial_height,
            last_block_height: block.height(),
            last_block_id: block_id,
            last_block_time: block.header.timestamp,
            validators: self.validators.clone(),
            app_hash: self.app_hash,
        }
    }
}
