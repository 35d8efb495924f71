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

//! Wire messages exchanged on the block sync channel.

use std::fmt::{Display, Formatter};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::{
    blocks::{Block, Height, MAX_BLOCK_SIZE_BYTES},
    commit::ExtendedCommit,
    error::ProtocolError,
};

pub const BLOCK_SYNC_CHANNEL: u8 = 0x40;

/// Room for the message tag and the length prefix of the block field
const BLOCK_RESPONSE_OVERHEAD: usize = 4 + 1;

pub const MAX_MSG_SIZE: usize = MAX_BLOCK_SIZE_BYTES + BLOCK_RESPONSE_OVERHEAD;

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum BlockSyncMessage {
    BlockRequest {
        height: Height,
    },
    NoBlockResponse {
        height: Height,
    },
    BlockResponse {
        block: Box<Block>,
        ext_commit: Option<ExtendedCommit>,
    },
    StatusRequest,
    StatusResponse {
        base: Height,
        height: Height,
    },
}

impl BlockSyncMessage {
    pub fn to_encoded_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        let bytes = borsh::to_vec(self).map_err(|e| ProtocolError::EncodeFailed(e.to_string()))?;
        if bytes.len() > MAX_MSG_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: bytes.len(),
                max: MAX_MSG_SIZE,
            });
        }
        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() > MAX_MSG_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: bytes.len(),
                max: MAX_MSG_SIZE,
            });
        }
        borsh::from_slice(bytes).map_err(|e| ProtocolError::DecodeFailed(e.to_string()))
    }

    pub fn as_type_str(&self) -> &'static str {
        match self {
            BlockSyncMessage::BlockRequest { .. } => "BlockRequest",
            BlockSyncMessage::NoBlockResponse { .. } => "NoBlockResponse",
            BlockSyncMessage::BlockResponse { .. } => "BlockResponse",
            BlockSyncMessage::StatusRequest => "StatusRequest",
            BlockSyncMessage::StatusResponse { .. } => "StatusResponse",
        }
    }
}

impl Display for BlockSyncMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockSyncMessage::BlockRequest { height } => write!(f, "BlockRequest(#{})", height),
            BlockSyncMessage::NoBlockResponse { height } => write!(f, "NoBlockResponse(#{})", height),
            BlockSyncMessage::BlockResponse { block, .. } => write!(f, "BlockResponse({})", block),
            BlockSyncMessage::StatusRequest => write!(f, "StatusRequest"),
            BlockSyncMessage::StatusResponse { base, height } => {
                write!(f, "StatusResponse(base: {}, height: {})", base, height)
            },
        }
    }
}
