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

use blake2::Blake2b;
use digest::consts::U32;
use tari_crypto::hash_domain;
use tari_hashing::DomainSeparatedBorshHasher;

use crate::blocks::FixedHash;

hash_domain!(BlockSyncHashDomain, "com.tari.blocksync", 1);

/// Domain-separated Blake2b-256 over the Borsh encoding of its inputs. `finalize().into()` yields a [FixedHash].
pub type BlockSyncHasher = DomainSeparatedBorshHasher<BlockSyncHashDomain, Blake2b<U32>>;

/// Binary Merkle root in the style of RFC 6962, with distinct prefixes for leaves and inner nodes.
pub fn merkle_root<T: AsRef<[u8]>>(items: &[T]) -> FixedHash {
    match items.len() {
        0 => BlockSyncHasher::new_with_label("merkle.empty").finalize().into(),
        1 => BlockSyncHasher::new_with_label("merkle.leaf")
            .chain(&items[0].as_ref())
            .finalize()
            .into(),
        n => {
            let split = split_point(n);
            let left = merkle_root(&items[..split]);
            let right = merkle_root(&items[split..]);
            BlockSyncHasher::new_with_label("merkle.inner")
                .chain(&left)
                .chain(&right)
                .finalize()
                .into()
        },
    }
}

/// Largest power of two strictly less than `n`
fn split_point(n: usize) -> usize {
    let mut split = 1;
    while split * 2 < n {
        split *= 2;
    }
    split
}
