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
use tari_crypto::ristretto::RistrettoPublicKey;
use tari_utilities::ByteArray;

use crate::{
    blocks::{BlockId, FixedHash, Height},
    commit::Commit,
    error::CommitVerificationError,
    hashing::BlockSyncHasher,
};

pub type ValidatorAddress = FixedHash;

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Validator {
    pub address: ValidatorAddress,
    pub public_key: RistrettoPublicKey,
    pub voting_power: i64,
}

impl Validator {
    pub fn new(public_key: RistrettoPublicKey, voting_power: i64) -> Self {
        Self {
            address: address_from_public_key(&public_key),
            public_key,
            voting_power,
        }
    }
}

pub fn address_from_public_key(public_key: &RistrettoPublicKey) -> ValidatorAddress {
    BlockSyncHasher::new_with_label("validator_address")
        .chain(&public_key.as_bytes())
        .finalize()
        .into()
}

/// The validator set in the order used to index commit signatures.
#[derive(Debug, Clone, PartialEq, Eq, Default, BorshSerialize, BorshDeserialize)]
pub struct ValidatorSet {
    validators: Vec<Validator>,
}

impl ValidatorSet {
    pub fn new(validators: Vec<Validator>) -> Self {
        Self { validators }
    }

    pub fn validators(&self) -> &[Validator] {
        &self.validators
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn total_voting_power(&self) -> i64 {
        self.validators.iter().map(|v| v.voting_power).sum()
    }

    pub fn hash(&self) -> FixedHash {
        BlockSyncHasher::new_with_label("validator_set")
            .chain(self)
            .finalize()
            .into()
    }

    /// Checks that `commit` holds signatures from more than two thirds of the voting power for `block_id` at
    /// `height`. Only `Commit` votes are checked; absent and nil votes are ignored. Returns as soon as enough power
    /// has been tallied.
    pub fn verify_commit_light(
        &self,
        chain_id: &str,
        block_id: &BlockId,
        height: Height,
        commit: &Commit,
    ) -> Result<(), CommitVerificationError> {
        if self.len() != commit.signatures.len() {
            return Err(CommitVerificationError::InvalidCommitSignatures {
                expected: self.len(),
                actual: commit.signatures.len(),
            });
        }
        if height != commit.height {
            return Err(CommitVerificationError::InvalidHeight {
                expected: height,
                actual: commit.height,
            });
        }
        if *block_id != commit.block_id {
            return Err(CommitVerificationError::BlockIdMismatch {
                expected: block_id.to_string(),
                actual: commit.block_id.to_string(),
            });
        }

        let needed = self.total_voting_power() * 2 / 3;
        let mut tallied = 0i64;
        for (index, (sig, validator)) in commit.signatures.iter().zip(&self.validators).enumerate() {
            if !sig.is_commit() {
                continue;
            }
            if sig.validator_address != validator.address {
                return Err(CommitVerificationError::ValidatorAddressMismatch { index });
            }
            let signature = sig
                .signature
                .as_ref()
                .ok_or(CommitVerificationError::MissingSignature { index })?;
            let msg = commit
                .vote_sign_bytes(chain_id, index)
                .ok_or(CommitVerificationError::MissingSignature { index })?;
            if !signature.verify(&validator.public_key, msg) {
                return Err(CommitVerificationError::InvalidSignature { index });
            }
            tallied += validator.voting_power;
            if tallied > needed {
                return Ok(());
            }
        }

        Err(CommitVerificationError::NotEnoughVotingPower { got: tallied, needed })
    }
}
