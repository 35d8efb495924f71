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

use std::sync::{atomic::Ordering, Arc};

use log::*;
use tari_shutdown::ShutdownSignal;
use tokio::time::{self, Instant, MissedTickBehavior};

use super::ReactorShared;

const LOG_TARGET: &str = "c::bs::watchdog";

/// Watches the node after it has switched to consensus and requests a restart if it falls too far behind its peers.
pub(super) async fn run(shared: Arc<ReactorShared>, mut shutdown_signal: ShutdownSignal) {
    let config = &shared.config.self_remediation;
    if !config.is_enabled() {
        debug!(target: LOG_TARGET, "Self-remediation is disabled");
        return;
    }
    let interval = config.blocks_behind_check_interval;
    let mut ticker = time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => break,
            _ = ticker.tick() => {
                if should_restart(&shared) {
                    break;
                }
            },
        }
    }
}

fn should_restart(shared: &ReactorShared) -> bool {
    let config = &shared.config.self_remediation;
    let max_peer_height = shared.pool.max_peer_height();
    let local_height = shared.services.store.height();
    let blocks_behind = max_peer_height.saturating_sub(local_height);
    if max_peer_height == 0 || blocks_behind < config.blocks_behind_threshold {
        trace!(
            target: LOG_TARGET,
            "Local height {} is {} block(s) behind the best peer", local_height, blocks_behind
        );
        return false;
    }
    if shared.is_block_syncing() {
        return false;
    }
    let since_restart = shared.last_restart_time().elapsed();
    if since_restart < config.restart_cooldown {
        debug!(
            target: LOG_TARGET,
            "{} block(s) behind but the last restart was {:.2?} ago, waiting for the cooldown",
            blocks_behind,
            since_restart
        );
        return false;
    }

    warn!(
        target: LOG_TARGET,
        "Local height {} is {} block(s) behind max peer height {}. Requesting a restart.",
        local_height,
        blocks_behind,
        max_peer_height
    );
    shared.block_sync.store(true, Ordering::SeqCst);
    match shared.services.restart_hook.as_ref() {
        Some(hook) => hook(),
        None => warn!(target: LOG_TARGET, "No restart hook is set, the node must be restarted manually"),
    }
    true
}
