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

use std::{future, sync::Arc};

use log::*;
use tari_shutdown::ShutdownSignal;
use tari_utilities::hex::to_hex;
use tokio::time::{self, Instant, MissedTickBehavior};

use super::ReactorShared;
#[cfg(feature = "metrics")]
use crate::metrics;
use crate::{
    blocks::{Block, BlockId, Height, BLOCK_PART_SIZE_BYTES},
    chain_state::ChainState,
    commit::{Commit, ExtendedCommit},
    error::{BlockSyncError, BlockValidationError},
};

const LOG_TARGET: &str = "c::bs::driver";

/// Number of applied blocks between sync rate log lines
const RATE_LOG_INTERVAL: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum DriverOutcome {
    /// The node has caught up with its peers and should switch to consensus
    CaughtUp,
    /// A fetched block failed verification. The offending peers have been evicted and the heights are being
    /// fetched again.
    Aborted,
    /// A committed block could not be saved or applied. Nothing may be applied on top of the local state.
    Halted,
    Cancelled,
}

enum StepOutcome {
    Applied,
    /// The next two blocks have not been received yet
    Waiting,
    Aborted,
    Halted,
}

/// Verifies, stores and applies fetched blocks in height order.
///
/// A block can only be verified with the commit carried by the block after it, so the driver always waits for
/// two consecutive blocks.
pub(super) struct Driver {
    shared: Arc<ReactorShared>,
    state: ChainState,
    state_synced: bool,
    blocks_synced: u64,
    last_hundred: Instant,
    last_rate: f64,
    last_apply: Instant,
    /// The max peer height seen at the previous switch check
    previous_max_peer_height: Height,
}

impl Driver {
    pub fn new(shared: Arc<ReactorShared>, state: ChainState, state_synced: bool) -> Self {
        let now = Instant::now();
        Self {
            shared,
            state,
            state_synced,
            blocks_synced: 0,
            last_hundred: now,
            last_rate: 0.0,
            last_apply: now,
            previous_max_peer_height: 0,
        }
    }

    pub fn blocks_synced(&self) -> u64 {
        self.blocks_synced
    }

    /// Whether consensus starts from a state that block sync or state sync produced
    pub fn had_to_sync(&self) -> bool {
        self.blocks_synced > 0 || self.state_synced
    }

    pub fn into_state(self) -> ChainState {
        self.state
    }

    pub async fn run(&mut self, mut shutdown_signal: ShutdownSignal) -> DriverOutcome {
        let config = &self.shared.config;
        let mut try_sync_ticker = time::interval(config.try_sync_interval);
        try_sync_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let switch_interval = config.switch_to_consensus_interval;
        let mut switch_ticker = time::interval_at(Instant::now() + switch_interval, switch_interval);
        let mut did_process = false;

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown_signal => return DriverOutcome::Cancelled,

                _ = switch_ticker.tick() => {
                    if self.is_ready_to_switch() {
                        return DriverOutcome::CaughtUp;
                    }
                    continue;
                },

                _ = try_sync_ticker.tick(), if !did_process => {},

                // Try again straight away after a block was applied
                _ = future::ready(()), if did_process => {},
            }

            did_process = match self.try_apply_next().await {
                StepOutcome::Applied => true,
                StepOutcome::Waiting => false,
                StepOutcome::Aborted => return DriverOutcome::Aborted,
                StepOutcome::Halted => return DriverOutcome::Halted,
            };
        }
    }

    fn is_ready_to_switch(&mut self) -> bool {
        let pool = &self.shared.pool;
        let status = pool.get_status();
        let max_peer_height = pool.max_peer_height();
        debug!(
            target: LOG_TARGET,
            "Switch check: height {}, {} pending, {} requester(s), max peer height {}",
            status.height,
            status.num_pending,
            status.num_requesters,
            max_peer_height
        );

        // A peer reporting a new max height since the last check means we are not done yet. The previous max is
        // taken on every check rather than by the watchdog, so the first switch needs two checks with a stable max.
        let previous_max_peer_height = std::mem::replace(&mut self.previous_max_peer_height, max_peer_height);
        if pool.is_caught_up() && max_peer_height <= previous_max_peer_height {
            info!(
                target: LOG_TARGET,
                "Caught up at height {} (max peer height: {})", status.height, max_peer_height
            );
            return true;
        }

        let since_last_advance = pool.last_advance().elapsed();
        let sync_timeout = self.shared.config.sync_timeout;
        if since_last_advance > sync_timeout {
            error!(
                target: LOG_TARGET,
                "No block sync progress for {:.2?} at height {} (max peer height: {})",
                since_last_advance,
                status.height,
                max_peer_height
            );
        } else {
            info!(
                target: LOG_TARGET,
                "Not caught up yet: height {}, max peer height {}, timeout in {:.2?}",
                status.height,
                max_peer_height,
                sync_timeout - since_last_advance
            );
        }
        false
    }

    async fn try_apply_next(&mut self) -> StepOutcome {
        let peeked = self.shared.pool.peek_two_blocks();
        let (Some(first), Some(second)) = (peeked.first, peeked.second) else {
            return StepOutcome::Waiting;
        };

        let (first_id, first_parts) = match first.block_id(BLOCK_PART_SIZE_BYTES) {
            Ok(id) => id,
            Err(err) => {
                error!(
                    target: LOG_TARGET,
                    "Failed to make part set for block #{}: {}",
                    first.height(),
                    err
                );
                return StepOutcome::Aborted;
            },
        };

        let seen_commit = match self
            .verify(&first, &first_id, &second, peeked.first_ext_commit.as_ref())
            .await
        {
            Ok(commit) => commit,
            Err(err) => {
                warn!(
                    target: LOG_TARGET,
                    "Block #{} ({}) failed verification: {}",
                    first.height(),
                    first_id,
                    err
                );
                self.redo_and_evict(first.height(), second.height(), &err).await;
                return StepOutcome::Aborted;
            },
        };

        if let Err(err) = self.shared.pool.pop_request() {
            error!(target: LOG_TARGET, "Failed to advance the block pool: {}", err);
            return StepOutcome::Aborted;
        }

        if let Err(err) = self
            .shared
            .services
            .store
            .save_block(&first, &first_parts, &seen_commit)
            .await
        {
            self.shared
                .halt(&format!("failed to save committed block #{}: {}", first.height(), err));
            return StepOutcome::Halted;
        }
        trace!(
            target: LOG_TARGET,
            "Fetching block #{} took {:.2?}",
            first.height(),
            self.last_apply.elapsed()
        );

        let started = Instant::now();
        self.state = match self
            .shared
            .services
            .executor
            .apply_block(self.state.clone(), first_id, &first)
            .await
        {
            Ok(state) => state,
            Err(err) => {
                self.shared.halt(&format!(
                    "failed to process committed block ({}:{}): {}",
                    first.height(),
                    to_hex(&first.hash()),
                    err
                ));
                return StepOutcome::Halted;
            },
        };
        self.last_apply = Instant::now();
        debug!(
            target: LOG_TARGET,
            "Applied block #{} in {:.2?}",
            first.height(),
            started.elapsed()
        );

        self.blocks_synced += 1;
        #[cfg(feature = "metrics")]
        metrics::blocks_synced().inc();
        if self.blocks_synced % RATE_LOG_INTERVAL == 0 {
            let elapsed = self.last_hundred.elapsed().as_secs_f64();
            if elapsed > 0.0 {
                self.last_rate = 0.9 * self.last_rate + 0.1 * (RATE_LOG_INTERVAL as f64 / elapsed);
            }
            info!(
                target: LOG_TARGET,
                "Block sync rate: height {}, max peer height {}, {:.2} blocks/s",
                self.shared.pool.height(),
                self.shared.pool.max_peer_height(),
                self.last_rate
            );
            self.last_hundred = Instant::now();
        }
        StepOutcome::Applied
    }

    /// Verifies `first` with the commit in `second` and validates it against the current state. Returns the commit
    /// that proves `first`.
    async fn verify(
        &self,
        first: &Block,
        first_id: &BlockId,
        second: &Block,
        ext_commit: Option<&ExtendedCommit>,
    ) -> Result<Commit, BlockSyncError> {
        let commit = second
            .last_commit
            .clone()
            .ok_or(BlockValidationError::MissingLastCommit {
                height: second.height(),
            })?;
        let validators = &self.state.validators;
        validators.verify_commit_light(&self.state.chain_id, first_id, first.height(), &commit)?;
        if let Some(ext_commit) = ext_commit {
            validators.verify_commit_light(&self.state.chain_id, first_id, first.height(), &ext_commit.to_commit())?;
        }
        self.shared.services.executor.validate_block(&self.state, first).await?;
        Ok(commit)
    }

    /// Refetches both heights and evicts the peers that sent them.
    async fn redo_and_evict(&self, first_height: Height, second_height: Height, err: &BlockSyncError) {
        let reason = format!("blocksync: {}", err);
        let outbound = &self.shared.services.outbound;

        let first_peer = self.shared.pool.redo_request(first_height);
        if let Some(peer) = first_peer.as_ref() {
            outbound.evict(peer, reason.clone()).await;
        }
        if let Some(peer) = self.shared.pool.redo_request(second_height) {
            if first_peer.as_ref() != Some(&peer) {
                outbound.evict(&peer, reason).await;
            }
        }
    }
}
