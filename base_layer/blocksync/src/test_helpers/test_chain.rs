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

use rand::rngs::OsRng;
use tari_crypto::{
    keys::PublicKey,
    ristretto::{RistrettoPublicKey, RistrettoSchnorr, RistrettoSecretKey},
};

use crate::{
    blocks::{Block, BlockHeader, BlockId, FixedHash, Height, BLOCK_PART_SIZE_BYTES},
    chain_state::ChainState,
    commit::{vote_sign_bytes, BlockIdFlag, Commit, CommitSig, ExtendedCommit},
    validators::{Validator, ValidatorSet},
};

pub const TEST_CHAIN_ID: &str = "blocksync-test";
const GENESIS_TIMESTAMP: u64 = 1_700_000_000;
const VOTING_POWER: i64 = 10;

/// A fully signed chain of blocks starting at height 1. Every validator has a voting power of 10 and signs every
/// commit, including the commit for the last block.
pub struct TestChain {
    chain_id: String,
    validator_set: ValidatorSet,
    blocks: Vec<Block>,
    block_ids: Vec<BlockId>,
    commits: Vec<Commit>,
}

impl TestChain {
    pub fn new(num_validators: usize, num_blocks: Height) -> Self {
        let keys = (0..num_validators)
            .map(|_| RistrettoPublicKey::random_keypair(&mut OsRng))
            .collect::<Vec<_>>();
        let validator_set = ValidatorSet::new(
            keys.iter()
                .map(|(_, pk)| Validator::new(pk.clone(), VOTING_POWER))
                .collect(),
        );
        let chain_id = TEST_CHAIN_ID.to_string();

        let mut blocks = Vec::new();
        let mut block_ids = Vec::new();
        let mut commits = Vec::new();
        let mut last_commit: Option<Commit> = None;
        let mut last_block_id = BlockId::default();
        for height in 1..=num_blocks {
            let transactions = vec![
                format!("tx-{}-a", height).into_bytes(),
                format!("tx-{}-b", height).into_bytes(),
            ];
            let header = BlockHeader {
                chain_id: chain_id.clone(),
                height,
                timestamp: GENESIS_TIMESTAMP + height,
                last_block_id,
                last_commit_hash: last_commit.as_ref().map(Commit::hash).unwrap_or_default(),
                data_hash: Block::data_hash(&transactions),
                validators_hash: validator_set.hash(),
                app_hash: FixedHash::default(),
            };
            let block = Block {
                header,
                transactions,
                last_commit: last_commit.take(),
            };
            let (block_id, _) = block.block_id(BLOCK_PART_SIZE_BYTES).unwrap();
            let commit = sign_commit(&chain_id, &keys, &validator_set, height, block_id);

            last_commit = Some(commit.clone());
            last_block_id = block_id;
            blocks.push(block);
            block_ids.push(block_id);
            commits.push(commit);
        }

        Self {
            chain_id,
            validator_set,
            blocks,
            block_ids,
            commits,
        }
    }

    pub fn chain_id(&self) -> &str {
        &self.chain_id
    }

    pub fn validator_set(&self) -> ValidatorSet {
        self.validator_set.clone()
    }

    pub fn height(&self) -> Height {
        self.blocks.len() as Height
    }

    pub fn block(&self, height: Height) -> Block {
        self.blocks[index(height)].clone()
    }

    pub fn block_id(&self, height: Height) -> BlockId {
        self.block_ids[index(height)]
    }

    /// The commit for the block at `height`
    pub fn commit(&self, height: Height) -> Commit {
        self.commits[index(height)].clone()
    }

    pub fn ext_commit(&self, height: Height) -> ExtendedCommit {
        self.commit(height).into()
    }

    pub fn genesis_state(&self) -> ChainState {
        ChainState::new_genesis(self.chain_id.clone(), 1, self.validator_set())
    }

    /// The chain state after the blocks up to and including `height` have been applied
    pub fn state_at(&self, height: Height) -> ChainState {
        (1..=height).fold(self.genesis_state(), |state, h| {
            state.next_state(self.block_id(h), &self.blocks[index(h)])
        })
    }
}

fn index(height: Height) -> usize {
    assert!(height > 0, "test chain starts at height 1");
    (height - 1) as usize
}

fn sign_commit(
    chain_id: &str,
    keys: &[(RistrettoSecretKey, RistrettoPublicKey)],
    validator_set: &ValidatorSet,
    height: Height,
    block_id: BlockId,
) -> Commit {
    let timestamp = GENESIS_TIMESTAMP + height;
    let msg = vote_sign_bytes(chain_id, height, 0, &block_id, timestamp);
    let signatures = keys
        .iter()
        .zip(validator_set.validators())
        .map(|((secret, _), validator)| CommitSig {
            block_id_flag: BlockIdFlag::Commit,
            validator_address: validator.address,
            timestamp,
            signature: Some(RistrettoSchnorr::sign(secret, msg, &mut OsRng).unwrap()),
        })
        .collect();
    Commit {
        height,
        round: 0,
        block_id,
        signatures,
    }
}
