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

use once_cell::sync::Lazy;
use prometheus::{
    register_gauge,
    register_int_counter,
    register_int_counter_vec,
    register_int_gauge,
    Gauge,
    IntCounter,
    IntCounterVec,
    IntGauge,
};

pub fn pool_height() -> &'static IntGauge {
    static METER: Lazy<IntGauge> = Lazy::new(|| {
        register_int_gauge!("blocksync_pool_height", "The lowest height that has not been applied yet").unwrap()
    });

    &METER
}

pub fn max_peer_height() -> &'static IntGauge {
    static METER: Lazy<IntGauge> = Lazy::new(|| {
        register_int_gauge!(
            "blocksync_max_peer_height",
            "The highest height advertised by a block sync peer"
        )
        .unwrap()
    });

    &METER
}

pub fn num_peers() -> &'static IntGauge {
    static METER: Lazy<IntGauge> =
        Lazy::new(|| register_int_gauge!("blocksync_peers", "Number of block sync peers").unwrap());

    &METER
}

pub fn pending_requests() -> &'static IntGauge {
    static METER: Lazy<IntGauge> = Lazy::new(|| {
        register_int_gauge!(
            "blocksync_pending_requests",
            "Number of block requests waiting for a peer or a response"
        )
        .unwrap()
    });

    &METER
}

pub fn blocks_synced() -> &'static IntCounter {
    static METER: Lazy<IntCounter> = Lazy::new(|| {
        register_int_counter!("blocksync_blocks_synced", "Number of blocks applied by block sync").unwrap()
    });

    &METER
}

pub fn peer_faults(reason: &str) -> IntCounter {
    static METER: Lazy<IntCounterVec> = Lazy::new(|| {
        register_int_counter_vec!(
            "blocksync_peer_faults",
            "Number of peers evicted by block sync",
            &["reason"]
        )
        .unwrap()
    });

    METER.with_label_values(&[reason])
}

pub fn sync_rate() -> &'static Gauge {
    static METER: Lazy<Gauge> = Lazy::new(|| {
        register_gauge!("blocksync_sync_rate", "Smoothed block sync rate in blocks per second").unwrap()
    });

    &METER
}
