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

//! The block pool keeps track of block sync peers and fetches the blocks in a bounded window ahead of the local
//! tip.
//!
//! Peers self-report their block ranges. Starting from the pool height (the lowest height that has not been applied
//! yet), one [Requester] per height is started, up to `max_total_requesters` ahead. Every requester picks a random
//! suitable peer, sends a [BlockRequest] on the requests channel and waits for the block to be added with
//! [BlockPool::add_block]. Peers that misbehave are reported on the faults channel as a [PeerFault].

mod peer;
mod rate_monitor;
mod requester;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
        RwLock,
        RwLockReadGuard,
        RwLockWriteGuard,
        Weak,
    },
    time::Duration,
};

use log::*;
pub use peer::PeerRecord;
use rand::{rngs::StdRng, Rng, SeedableRng};
pub use rate_monitor::RateMonitor;
use requester::{RedoOutcome, RequesterTask};
pub use requester::{RedoOp, Requester, RetryReason, SetBlockOutcome};
use tari_shutdown::{Shutdown, ShutdownSignal};
use tokio::{
    sync::mpsc,
    time::{self, Instant},
};

#[cfg(feature = "metrics")]
use crate::metrics;
use crate::{
    blocks::{Block, Height, NodeId},
    commit::ExtendedCommit,
    config::BlockSyncConfig,
    error::{PoolError, ServiceStateError},
    interfaces::{PeerConnectionState, PeerManager},
    lifecycle::{Lifecycle, ServiceState, TaskTracker},
};

const LOG_TARGET: &str = "c::bs::pool";

/// Number of applied blocks between sync rate updates
const SYNC_RATE_BLOCK_INTERVAL: u64 = 100;

/// A request for the block at `height` that should be sent to `peer_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRequest {
    pub height: Height,
    pub peer_id: NodeId,
}

/// A peer that should be evicted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerFault {
    pub peer_id: NodeId,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub height: Height,
    /// Requests waiting for a peer or a response
    pub num_pending: usize,
    pub num_requesters: usize,
}

#[derive(Debug, Clone, Default)]
pub struct PeekedBlocks {
    pub first: Option<Arc<Block>>,
    pub second: Option<Arc<Block>>,
    pub first_ext_commit: Option<ExtendedCommit>,
}

struct PoolState {
    /// The lowest height in `requesters`
    height: Height,
    start_height: Height,
    requesters: HashMap<Height, Arc<Requester>>,
    peers: HashMap<NodeId, PeerRecord>,
    max_peer_height: Height,
    last_advance: Instant,
    last_hundred_block_timestamp: Instant,
    /// Blocks per second
    last_sync_rate: f64,
}

struct PoolShared {
    config: BlockSyncConfig,
    state: RwLock<PoolState>,
    num_pending: Arc<AtomicI64>,
    lifecycle: Lifecycle,
    shutdown: Mutex<Shutdown>,
    shutdown_signal: ShutdownSignal,
    tasks: TaskTracker,
    requests_tx: mpsc::Sender<BlockRequest>,
    faults_tx: mpsc::Sender<PeerFault>,
    peer_manager: Arc<dyn PeerManager>,
    rng: Mutex<StdRng>,
}

/// Cheaply cloneable handle to a block pool.
#[derive(Clone)]
pub struct BlockPool {
    shared: Arc<PoolShared>,
}

impl BlockPool {
    pub fn new(
        config: BlockSyncConfig,
        start_height: Height,
        peer_manager: Arc<dyn PeerManager>,
        requests_tx: mpsc::Sender<BlockRequest>,
        faults_tx: mpsc::Sender<PeerFault>,
    ) -> Self {
        let now = Instant::now();
        let shutdown = Shutdown::new();
        let shutdown_signal = shutdown.to_signal();
        Self {
            shared: Arc::new(PoolShared {
                config,
                state: RwLock::new(PoolState {
                    height: start_height,
                    start_height,
                    requesters: HashMap::new(),
                    peers: HashMap::new(),
                    max_peer_height: 0,
                    last_advance: now,
                    last_hundred_block_timestamp: now,
                    last_sync_rate: 0.0,
                }),
                num_pending: Arc::new(AtomicI64::new(0)),
                lifecycle: Lifecycle::new(),
                shutdown: Mutex::new(shutdown),
                shutdown_signal,
                tasks: TaskTracker::new(),
                requests_tx,
                faults_tx,
                peer_manager,
                rng: Mutex::new(StdRng::from_entropy()),
            }),
        }
    }

    /// Starts the scheduler. Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<(), PoolError> {
        {
            let mut state = self.shared.write_state();
            let now = Instant::now();
            state.last_advance = now;
            state.last_hundred_block_timestamp = now;
        }
        self.shared.lifecycle.start(|| {
            let routine = make_requesters_routine(
                Arc::downgrade(&self.shared),
                self.shared.shutdown_signal.clone(),
                self.shared.config.request_interval,
            );
            self.shared.tasks.spawn(routine);
            Ok::<_, PoolError>(())
        })?;
        info!(target: LOG_TARGET, "Block pool started at height {}", self.height());
        Ok(())
    }

    /// Cancels every requester, peer timer and the scheduler. Does not wait for them to exit, see
    /// [BlockPool::wait].
    pub fn stop(&self) {
        if !self.shared.lifecycle.stop() {
            return;
        }
        self.shared.lock_shutdown().trigger();
        let state = self.shared.read_state();
        for requester in state.requesters.values() {
            requester.stop();
        }
        debug!(
            target: LOG_TARGET,
            "Block pool stopped at height {} with {} requester(s)",
            state.height,
            state.requesters.len()
        );
    }

    /// Waits for all pool tasks to exit after the pool has been stopped.
    pub async fn wait(&self) {
        self.shared.tasks.wait().await;
    }

    pub fn is_running(&self) -> bool {
        self.shared.lifecycle.is_running()
    }

    pub fn config(&self) -> &BlockSyncConfig {
        &self.shared.config
    }

    /// Moves the starting point of a pool that has not been started yet.
    pub fn reset_start_height(&self, height: Height) -> Result<(), PoolError> {
        if self.shared.lifecycle.state() != ServiceState::NotStarted {
            return Err(ServiceStateError::AlreadyStarted.into());
        }
        let mut state = self.shared.write_state();
        state.height = height;
        state.start_height = height;
        Ok(())
    }

    /// Sets the block range a peer claims to have, adding the peer if it is new.
    pub fn set_peer_range(&self, peer_id: NodeId, base: Height, height: Height) {
        let forced = &self.shared.config.forced_sync_peers;
        if !forced.is_empty() && !forced.contains(&peer_id) {
            trace!(target: LOG_TARGET, "Ignoring peer {} that is not a forced sync peer", peer_id);
            return;
        }

        let mut state = self.shared.write_state();
        match state.peers.get_mut(&peer_id) {
            Some(peer) => peer.set_range(base, height),
            None => {
                info!(
                    target: LOG_TARGET,
                    "Adding peer {} to block sync pool (base: {}, height: {})", peer_id, base, height
                );
                state
                    .peers
                    .insert(peer_id.clone(), PeerRecord::new(peer_id, base, height));
            },
        }
        state.max_peer_height = max_peer_height(&state.peers);
        self.shared.record_metrics(&state);
    }

    /// Removes a peer and retries every request assigned to it. Does nothing if the peer is unknown.
    pub fn remove_peer(&self, peer_id: &NodeId) {
        let mut state = self.shared.write_state();
        self.shared.remove_peer_locked(&mut state, peer_id, true);
    }

    /// Hands a block received from `peer_id` to the requester for its height.
    ///
    /// Blocks that are not expected are rejected, and the sender is faulted if the block is too far from the pool
    /// height. The first block for a height wins: a repeat delivery by the same peer is ignored while a block from
    /// another peer is rejected and that peer is faulted. Blocks delivered after the pool has stopped are ignored.
    pub fn add_block(
        &self,
        peer_id: NodeId,
        block: Block,
        ext_commit: Option<ExtendedCommit>,
        block_size: usize,
    ) -> Result<(), PoolError> {
        if !self.is_running() {
            debug!(
                target: LOG_TARGET,
                "Ignoring block #{} from {}: pool is not running",
                block.height(),
                peer_id
            );
            return Ok(());
        }
        if let Some(commit) = ext_commit.as_ref() {
            if commit.height != block.height() {
                return Err(PoolError::HeightMismatch {
                    block_height: block.height(),
                    commit_height: commit.height,
                });
            }
        }

        let height = block.height();
        let mut state = self.shared.write_state();
        let Some(requester) = state.requesters.get(&height).cloned() else {
            let diff = state.height.abs_diff(height);
            if diff > self.shared.config.max_diff_between_current_and_received_block_height {
                self.shared.send_fault(
                    peer_id.clone(),
                    "peer sent us a block we didn't expect with a height too far ahead/behind",
                );
            }
            return Err(PoolError::UnexpectedBlock {
                peer: peer_id,
                height,
                pool_height: state.height,
            });
        };

        // Blocks still in flight from a removed peer must not fill a height that has been handed to another peer
        if !state.peers.contains_key(&peer_id) && !requester.has_block() {
            debug!(
                target: LOG_TARGET,
                "Ignoring block #{} from {}: peer is not part of the pool", height, peer_id
            );
            return Err(PoolError::UnknownPeer { peer: peer_id, height });
        }

        let assigned_peer = requester.peer_id();
        match requester.set_block(Arc::new(block), ext_commit, &peer_id) {
            SetBlockOutcome::Accepted => {
                self.shared.num_pending.fetch_sub(1, Ordering::SeqCst);
                if let Some(peer) = state.peers.get_mut(&peer_id) {
                    peer.decr_pending(block_size, || self.shared.arm_peer_timeout(peer_id.clone()));
                }
                // Another peer answered first, the assigned peer's request is void
                if let Some(assigned) = assigned_peer.filter(|p| *p != peer_id) {
                    if let Some(peer) = state.peers.get_mut(&assigned) {
                        peer.cancel_pending();
                    }
                }
                self.shared.peer_manager.record_block_sync(&peer_id);
                trace!(target: LOG_TARGET, "Accepted block #{} from {}", height, peer_id);
                Ok(())
            },
            SetBlockOutcome::Duplicate => {
                debug!(target: LOG_TARGET, "Peer {} sent block #{} twice", peer_id, height);
                Ok(())
            },
            SetBlockOutcome::Conflict => {
                self.shared
                    .send_fault(peer_id.clone(), "requester is different or block already exists");
                Err(PoolError::ConflictingBlock {
                    height,
                    requested: requester
                        .peer_id()
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "<none>".to_string()),
                    peer: peer_id,
                })
            },
        }
    }

    /// Evicts the peer responsible for the block at `height` and refetches every block that peer was assigned.
    /// Returns the evicted peer.
    pub fn redo_request(&self, height: Height) -> Option<NodeId> {
        let mut state = self.shared.write_state();
        // A requester without a peer or block has already been reset
        let peer_id = state.requesters.get(&height)?.responsible_peer()?;
        self.shared.remove_peer_locked(&mut state, &peer_id, false);
        for requester in state.requesters.values() {
            if requester.height() == height || requester.responsible_peer().as_ref() == Some(&peer_id) {
                self.shared.redo_requester(requester, RedoOp {
                    peer_id: peer_id.clone(),
                    reason: RetryReason::BadBlock,
                });
            }
        }
        Some(peer_id)
    }

    /// The blocks at the pool height and the height after it, as far as they have been received.
    pub fn peek_two_blocks(&self) -> PeekedBlocks {
        let state = self.shared.read_state();
        let mut peeked = PeekedBlocks::default();
        if let Some(requester) = state.requesters.get(&state.height) {
            peeked.first = requester.block();
            peeked.first_ext_commit = requester.ext_commit();
        }
        if let Some(requester) = state.requesters.get(&(state.height + 1)) {
            peeked.second = requester.block();
        }
        peeked
    }

    /// Discards the requester at the pool height and advances the pool by one. The block at the pool height must
    /// have been received and verified.
    pub fn pop_request(&self) -> Result<(), PoolError> {
        let mut state = self.shared.write_state();
        let height = state.height;
        match state.requesters.get(&height) {
            Some(requester) if requester.has_block() => {},
            _ => return Err(PoolError::NothingToPop(height)),
        }
        if let Some(requester) = state.requesters.remove(&height) {
            requester.stop();
        }
        state.height += 1;
        let now = Instant::now();
        state.last_advance = now;

        if (state.height - state.start_height) % SYNC_RATE_BLOCK_INTERVAL == 0 {
            let elapsed = now.duration_since(state.last_hundred_block_timestamp).as_secs_f64();
            if elapsed > 0.0 {
                let new_rate = SYNC_RATE_BLOCK_INTERVAL as f64 / elapsed;
                state.last_sync_rate = if state.last_sync_rate == 0.0 {
                    new_rate
                } else {
                    0.9 * state.last_sync_rate + 0.1 * new_rate
                };
            }
            state.last_hundred_block_timestamp = now;
            info!(
                target: LOG_TARGET,
                "Block sync rate: {:.2} blocks/s (height: {}, max peer height: {})",
                state.last_sync_rate,
                state.height,
                state.max_peer_height
            );
        }
        self.shared.record_metrics(&state);
        Ok(())
    }

    /// True if at least two peers are known and the pool is within one block of the best advertised height. The
    /// last block can only be verified with the commit in the block after it, so it is left to consensus.
    pub fn is_caught_up(&self) -> bool {
        let state = self.shared.read_state();
        if state.peers.len() < 2 {
            return false;
        }
        state.height >= state.max_peer_height.saturating_sub(1)
    }

    pub fn get_status(&self) -> PoolStatus {
        self.shared.status()
    }

    pub fn height(&self) -> Height {
        self.shared.read_state().height
    }

    pub fn start_height(&self) -> Height {
        self.shared.read_state().start_height
    }

    pub fn max_peer_height(&self) -> Height {
        self.shared.read_state().max_peer_height
    }

    /// When the pool height last advanced, or when the pool was started
    pub fn last_advance(&self) -> Instant {
        self.shared.read_state().last_advance
    }

    pub fn num_peers(&self) -> usize {
        self.shared.read_state().peers.len()
    }

    pub fn has_peer(&self, peer_id: &NodeId) -> bool {
        self.shared.read_state().peers.contains_key(peer_id)
    }

    /// Number of blocks between the start height and the best advertised height, inclusive
    pub fn target_sync_blocks(&self) -> u64 {
        let state = self.shared.read_state();
        state
            .max_peer_height
            .saturating_add(1)
            .saturating_sub(state.start_height)
    }

    /// Smoothed sync rate in blocks per second, updated every 100 blocks
    pub fn last_sync_rate(&self) -> f64 {
        self.shared.read_state().last_sync_rate
    }
}

impl PoolShared {
    fn read_state(&self) -> RwLockReadGuard<'_, PoolState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, PoolState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_shutdown(&self) -> MutexGuard<'_, Shutdown> {
        self.shutdown.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn num_pending(&self) -> usize {
        usize::try_from(self.num_pending.load(Ordering::SeqCst)).unwrap_or(0)
    }

    fn status(&self) -> PoolStatus {
        let state = self.read_state();
        PoolStatus {
            height: state.height,
            num_pending: self.num_pending(),
            num_requesters: state.requesters.len(),
        }
    }

    /// Starts a requester for the next height, unless that height is beyond every peer. Returns true if a
    /// requester was started.
    fn make_next_requester(self: &Arc<Self>) -> bool {
        let mut state = self.write_state();
        let next_height = state.height + state.requesters.len() as u64;
        if next_height > state.max_peer_height {
            return false;
        }
        let requester = Arc::new(Requester::new(next_height, self.num_pending.clone()));
        state.requesters.insert(next_height, requester.clone());
        self.num_pending.fetch_add(1, Ordering::SeqCst);
        self.spawn_requester(requester);
        true
    }

    fn spawn_requester(self: &Arc<Self>, requester: Arc<Requester>) {
        if !self.lifecycle.is_running() {
            return;
        }
        let channels = requester.attach_task();
        let task = RequesterTask::new(
            requester,
            Arc::downgrade(self),
            channels,
            self.shutdown_signal.clone(),
            self.config.request_interval,
            self.config.peer_timeout,
        );
        self.tasks.spawn(task.run());
    }

    fn redo_requester(self: &Arc<Self>, requester: &Arc<Requester>, op: RedoOp) {
        if requester.redo(op) == RedoOutcome::Restart {
            self.spawn_requester(requester.clone());
        }
    }

    /// Picks a random peer that can serve `height` and assigns a request to it.
    ///
    /// Peers are considered in order of descending score. Timed out peers are removed as they are encountered and
    /// the scan ends at the first peer with a score of zero or less.
    fn pick_incr_available_peer(self: &Arc<Self>, height: Height) -> Option<NodeId> {
        let mut state = self.write_state();

        let mut sorted_peers = state
            .peers
            .keys()
            .map(|id| (id.clone(), self.peer_manager.score(id)))
            .collect::<Vec<_>>();
        sorted_peers.sort_by(|(_, a), (_, b)| b.cmp(a));

        let mut candidates = Vec::new();
        for (peer_id, score) in sorted_peers {
            let Some(peer) = state.peers.get(&peer_id) else {
                continue;
            };
            if peer.did_timeout() {
                self.remove_peer_locked(&mut state, &peer_id, true);
                continue;
            }
            if peer.num_pending() >= self.config.max_pending_requests_per_peer {
                continue;
            }
            if !peer.has_height(height) {
                continue;
            }
            if self.peer_manager.connection_state(&peer_id) == PeerConnectionState::Ready {
                candidates.push(peer_id.clone());
            }
            if score <= 0 {
                break;
            }
        }

        if candidates.is_empty() {
            return None;
        }
        let index = self
            .rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gen_range(0..candidates.len());
        let peer_id = candidates.swap_remove(index);
        let peer = state.peers.get_mut(&peer_id)?;
        peer.incr_pending(self.config.min_recv_rate, || self.arm_peer_timeout(peer_id.clone()));
        trace!(target: LOG_TARGET, "Assigned block #{} to peer {}", height, peer_id);
        Some(peer_id)
    }

    /// Frees the slot of a request that timed out so that it does not count against the peer's cap
    fn release_peer_request(&self, peer_id: &NodeId) {
        let mut state = self.write_state();
        if let Some(peer) = state.peers.get_mut(peer_id) {
            peer.cancel_pending();
        }
    }

    /// Starts a deadline timer for a peer. The timer is cancelled when the returned `Shutdown` is triggered or dropped.
    fn arm_peer_timeout(self: &Arc<Self>, peer_id: NodeId) -> Shutdown {
        let cancel = Shutdown::new();
        let cancel_signal = cancel.to_signal();
        let pool_signal = self.shutdown_signal.clone();
        let pool = Arc::downgrade(self);
        let timeout = self.config.peer_timeout;
        self.tasks.spawn(async move {
            tokio::select! {
                _ = cancel_signal.clone() => {},
                _ = pool_signal => {},
                _ = time::sleep(timeout) => {
                    if let Some(pool) = pool.upgrade() {
                        pool.on_peer_timeout(&peer_id, &cancel_signal);
                    }
                },
            }
        });
        cancel
    }

    fn on_peer_timeout(&self, peer_id: &NodeId, cancel_signal: &ShutdownSignal) {
        let mut state = self.write_state();
        // The timer may have been re-armed or the peer removed while this one was firing
        if cancel_signal.is_triggered() {
            return;
        }
        if let Some(peer) = state.peers.get_mut(peer_id) {
            warn!(
                target: LOG_TARGET,
                "Peer {} did not send us anything within {:.2?}", peer_id, self.config.peer_timeout
            );
            peer.mark_timed_out();
            self.send_fault(peer_id.clone(), "peer did not send us anything");
        }
    }

    /// Faults peers with outstanding requests that are sending too slowly and removes every timed out peer.
    fn remove_timed_out_peers(self: &Arc<Self>) {
        let mut state = self.write_state();
        let peer_ids = state.peers.keys().cloned().collect::<Vec<_>>();
        for peer_id in peer_ids {
            let Some(peer) = state.peers.get_mut(&peer_id) else {
                continue;
            };
            if !peer.did_timeout() && peer.num_pending() > 0 {
                if let Some(rate) = peer.is_too_slow(self.config.min_recv_rate) {
                    warn!(
                        target: LOG_TARGET,
                        "Peer {} is not sending us data fast enough ({} KB/s, min: {} KB/s)",
                        peer_id,
                        rate / 1024,
                        self.config.min_recv_rate / 1024
                    );
                    peer.mark_timed_out();
                    self.send_fault(peer_id.clone(), "peer is not sending us data fast enough");
                }
            }
            if peer.did_timeout() {
                self.remove_peer_locked(&mut state, &peer_id, true);
            }
        }
    }

    fn remove_peer_locked(self: &Arc<Self>, state: &mut PoolState, peer_id: &NodeId, redo: bool) {
        if redo {
            for requester in state.requesters.values() {
                if requester.peer_id().as_ref() == Some(peer_id) {
                    self.redo_requester(requester, RedoOp {
                        peer_id: peer_id.clone(),
                        reason: RetryReason::PeerRemoved,
                    });
                }
            }
        }

        // Dropping the record cancels its timer
        if let Some(peer) = state.peers.remove(peer_id) {
            info!(target: LOG_TARGET, "Removed peer {} from block sync pool", peer_id);
            if peer.height() == state.max_peer_height {
                state.max_peer_height = max_peer_height(&state.peers);
            }
            self.record_metrics(state);
        }
    }

    fn send_fault(&self, peer_id: NodeId, reason: &'static str) {
        if !self.lifecycle.is_running() {
            return;
        }
        #[cfg(feature = "metrics")]
        metrics::peer_faults(reason).inc();
        let fault = PeerFault {
            peer_id,
            reason: reason.to_string(),
        };
        if let Err(err) = self.faults_tx.try_send(fault) {
            warn!(target: LOG_TARGET, "Unable to report peer fault: {}", err);
        }
    }

    #[allow(unused_variables)]
    fn record_metrics(&self, state: &PoolState) {
        #[cfg(feature = "metrics")]
        {
            metrics::pool_height().set(state.height as i64);
            metrics::max_peer_height().set(state.max_peer_height.min(i64::MAX as u64) as i64);
            metrics::num_peers().set(state.peers.len() as i64);
            metrics::pending_requests().set(self.num_pending() as i64);
            metrics::sync_rate().set(state.last_sync_rate);
        }
    }
}

/// The highest advertised height, or 0 if there are no peers
fn max_peer_height(peers: &HashMap<NodeId, PeerRecord>) -> Height {
    peers.values().map(|p| p.height()).max().unwrap_or(0)
}

/// Starts requesters while under the pending and requester caps. When no requester can be started, sleeps and
/// then evicts peers that timed out or are too slow.
async fn make_requesters_routine(pool: Weak<PoolShared>, shutdown_signal: ShutdownSignal, request_interval: Duration) {
    loop {
        if shutdown_signal.is_triggered() {
            break;
        }
        let made_requester = match pool.upgrade() {
            Some(shared) => {
                let status = shared.status();
                if status.num_pending >= shared.config.max_pending_requests ||
                    status.num_requesters >= shared.config.max_total_requesters
                {
                    false
                } else {
                    shared.make_next_requester()
                }
            },
            None => break,
        };

        if made_requester {
            tokio::task::yield_now().await;
            continue;
        }

        tokio::select! {
            _ = shutdown_signal.clone() => break,
            _ = time::sleep(request_interval) => {},
        }
        match pool.upgrade() {
            Some(shared) => shared.remove_timed_out_peers(),
            None => break,
        }
    }
    debug!(target: LOG_TARGET, "Block pool scheduler exited");
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_helpers::{MockPeerManager, TestChain};

    struct TestPool {
        pool: BlockPool,
        requests_rx: mpsc::Receiver<BlockRequest>,
        faults_rx: mpsc::Receiver<PeerFault>,
        peer_manager: MockPeerManager,
    }

    fn setup_with_config(config: BlockSyncConfig, start_height: Height) -> TestPool {
        let (requests_tx, requests_rx) = mpsc::channel(100);
        let (faults_tx, faults_rx) = mpsc::channel(100);
        let peer_manager = MockPeerManager::new();
        let pool = BlockPool::new(
            config,
            start_height,
            Arc::new(peer_manager.clone()),
            requests_tx,
            faults_tx,
        );
        TestPool {
            pool,
            requests_rx,
            faults_rx,
            peer_manager,
        }
    }

    fn setup(start_height: Height) -> TestPool {
        setup_with_config(BlockSyncConfig::default(), start_height)
    }

    async fn recv_requests(rx: &mut mpsc::Receiver<BlockRequest>, n: usize) -> Vec<BlockRequest> {
        let mut requests = Vec::with_capacity(n);
        for _ in 0..n {
            requests.push(rx.recv().await.unwrap());
        }
        requests.sort_by_key(|r| r.height);
        requests
    }

    /// Lets spawned tasks run until they are all idle
    async fn settle() {
        time::sleep(Duration::from_millis(1)).await;
    }

    fn requester_heights(pool: &BlockPool) -> Vec<Height> {
        let state = pool.shared.read_state();
        let mut heights = state.requesters.keys().copied().collect::<Vec<_>>();
        heights.sort_unstable();
        heights
    }

    fn requester_peer(pool: &BlockPool, height: Height) -> Option<NodeId> {
        pool.shared.read_state().requesters.get(&height).and_then(|r| r.peer_id())
    }

    fn peer_num_pending(pool: &BlockPool, peer_id: &NodeId) -> Option<usize> {
        pool.shared.read_state().peers.get(peer_id).map(|p| p.num_pending())
    }

    #[test]
    fn max_peer_height_follows_peers() {
        let TestPool { pool, .. } = setup(1);
        let a = NodeId::from("a");
        pool.set_peer_range(a.clone(), 1, 10);
        assert_eq!(pool.max_peer_height(), 10);
        pool.remove_peer(&a);
        assert_eq!(pool.max_peer_height(), 0);
        assert_eq!(pool.num_peers(), 0);
        // Removing an unknown peer is a no-op
        pool.remove_peer(&a);
    }

    #[test]
    fn sentinel_height_is_trusted_until_lowered() {
        let TestPool { pool, .. } = setup(1);
        let b = NodeId::from("b");
        pool.set_peer_range(b.clone(), 1, u64::MAX);
        assert_eq!(pool.max_peer_height(), u64::MAX);
        assert!(!pool.is_caught_up());
        pool.set_peer_range(b, 1, 7);
        assert_eq!(pool.max_peer_height(), 7);
    }

    #[test]
    fn set_then_remove_restores_max_peer_height() {
        let TestPool { pool, .. } = setup(1);
        pool.set_peer_range(NodeId::from("a"), 1, 20);
        pool.set_peer_range(NodeId::from("b"), 1, 15);

        let c = NodeId::from("c");
        pool.set_peer_range(c.clone(), 1, 18);
        pool.remove_peer(&c);
        assert_eq!(pool.max_peer_height(), 20);

        pool.set_peer_range(c.clone(), 1, 30);
        assert_eq!(pool.max_peer_height(), 30);
        pool.remove_peer(&c);
        assert_eq!(pool.max_peer_height(), 20);
    }

    #[test]
    fn caught_up_needs_two_peers() {
        let TestPool { pool, .. } = setup(10);
        pool.set_peer_range(NodeId::from("a"), 1, 10);
        assert_eq!(pool.height(), 10);
        assert!(!pool.is_caught_up());
        pool.set_peer_range(NodeId::from("b"), 1, 11);
        assert!(pool.is_caught_up());
        pool.set_peer_range(NodeId::from("b"), 1, 12);
        assert!(!pool.is_caught_up());
    }

    #[test]
    fn forced_sync_peers_filter_ranges() {
        let config = BlockSyncConfig {
            forced_sync_peers: vec![NodeId::from("a")],
            ..Default::default()
        };
        let TestPool { pool, .. } = setup_with_config(config, 1);
        pool.set_peer_range(NodeId::from("a"), 1, 10);
        pool.set_peer_range(NodeId::from("b"), 1, 100);
        assert_eq!(pool.num_peers(), 1);
        assert_eq!(pool.max_peer_height(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn requesters_cover_a_contiguous_window() {
        let TestPool {
            pool, mut requests_rx, ..
        } = setup(7);
        for i in 0..3 {
            pool.set_peer_range(NodeId::new(format!("peer-{}", i)), 1, 1000);
        }
        pool.start().unwrap();
        let requests = recv_requests(&mut requests_rx, 50).await;
        settle().await;

        assert_eq!(requester_heights(&pool), (7..57).collect::<Vec<_>>());
        assert_eq!(requests.iter().map(|r| r.height).collect::<Vec<_>>(), (7..57).collect::<Vec<_>>());
        let status = pool.get_status();
        assert_eq!(status.height, 7);
        assert_eq!(status.num_requesters, 50);
        assert_eq!(status.num_pending, 50);
        pool.stop();
        pool.wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn window_is_bounded_by_max_peer_height() {
        let TestPool {
            pool, mut requests_rx, ..
        } = setup(1);
        pool.set_peer_range(NodeId::from("a"), 1, 5);
        pool.start().unwrap();
        recv_requests(&mut requests_rx, 5).await;
        time::sleep(Duration::from_millis(500)).await;
        assert_eq!(requester_heights(&pool), vec![1, 2, 3, 4, 5]);
        assert!(requests_rx.try_recv().is_err());
        pool.stop();
        pool.wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn add_block_is_idempotent_per_peer() {
        let chain = TestChain::new(1, 2);
        let TestPool {
            pool,
            mut requests_rx,
            mut faults_rx,
            peer_manager,
        } = setup(1);
        let a = NodeId::from("a");
        pool.set_peer_range(a.clone(), 1, 2);
        pool.start().unwrap();
        recv_requests(&mut requests_rx, 2).await;
        assert_eq!(pool.get_status().num_pending, 2);
        assert_eq!(peer_num_pending(&pool, &a), Some(2));

        pool.add_block(a.clone(), chain.block(1), None, 100).unwrap();
        assert_eq!(pool.get_status().num_pending, 1);
        assert_eq!(peer_num_pending(&pool, &a), Some(1));
        assert_eq!(peer_manager.block_syncs(&a), 1);

        pool.add_block(a.clone(), chain.block(1), None, 100).unwrap();
        assert_eq!(pool.get_status().num_pending, 1);
        assert_eq!(peer_num_pending(&pool, &a), Some(1));
        assert!(faults_rx.try_recv().is_err());

        // A different peer delivering the same height is faulted
        let b = NodeId::from("b");
        let err = pool.add_block(b.clone(), chain.block(1), None, 100).unwrap_err();
        assert!(matches!(err, PoolError::ConflictingBlock { height: 1, .. }));
        let fault = faults_rx.try_recv().unwrap();
        assert_eq!(fault.peer_id, b);
        assert_eq!(pool.get_status().num_pending, 1);

        pool.stop();
        pool.wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unexpected_blocks_are_rejected() {
        let chain = TestChain::new(1, 2);
        let TestPool {
            pool,
            mut requests_rx,
            mut faults_rx,
            ..
        } = setup(1);
        let a = NodeId::from("a");
        pool.set_peer_range(a.clone(), 1, 2);
        pool.start().unwrap();
        recv_requests(&mut requests_rx, 2).await;

        let mut block = chain.block(1);
        block.header.height = 50;
        let err = pool.add_block(a.clone(), block.clone(), None, 100).unwrap_err();
        assert!(matches!(err, PoolError::UnexpectedBlock { height: 50, .. }));
        assert!(faults_rx.try_recv().is_err());

        block.header.height = 200;
        pool.add_block(a.clone(), block, None, 100).unwrap_err();
        assert_eq!(faults_rx.try_recv().unwrap().peer_id, a);

        // Peers that are not in the pool cannot fill a height
        let c = NodeId::from("c");
        let err = pool.add_block(c.clone(), chain.block(1), None, 100).unwrap_err();
        assert_eq!(err, PoolError::UnknownPeer { peer: c, height: 1 });
        assert!(faults_rx.try_recv().is_err());
        assert!(pool.peek_two_blocks().first.is_none());

        let ext_commit = chain.ext_commit(2);
        let err = pool.add_block(a, chain.block(1), Some(ext_commit), 100).unwrap_err();
        assert_eq!(err, PoolError::HeightMismatch {
            block_height: 1,
            commit_height: 2
        });

        pool.stop();
        pool.wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn pop_request_advances_by_one() {
        let chain = TestChain::new(1, 3);
        let TestPool {
            pool, mut requests_rx, ..
        } = setup(1);
        let a = NodeId::from("a");
        pool.set_peer_range(a.clone(), 1, 3);
        pool.start().unwrap();
        recv_requests(&mut requests_rx, 3).await;

        assert_eq!(pool.pop_request(), Err(PoolError::NothingToPop(1)));
        pool.add_block(a.clone(), chain.block(2), None, 100).unwrap();
        let peeked = pool.peek_two_blocks();
        assert!(peeked.first.is_none());
        assert!(peeked.second.is_some());

        pool.add_block(a.clone(), chain.block(1), Some(chain.ext_commit(1)), 100)
            .unwrap();
        let peeked = pool.peek_two_blocks();
        assert_eq!(peeked.first.unwrap().height(), 1);
        assert_eq!(peeked.second.unwrap().height(), 2);
        assert_eq!(peeked.first_ext_commit.unwrap().height, 1);

        let last_advance = pool.last_advance();
        time::advance(Duration::from_millis(10)).await;
        pool.pop_request().unwrap();
        assert_eq!(pool.height(), 2);
        assert!(pool.last_advance() > last_advance);
        assert_eq!(requester_heights(&pool), vec![2, 3]);

        pool.pop_request().unwrap();
        assert_eq!(pool.height(), 3);
        assert_eq!(pool.pop_request(), Err(PoolError::NothingToPop(3)));

        pool.stop();
        pool.wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn redo_request_refetches_everything_from_the_peer() {
        let chain = TestChain::new(1, 4);
        let TestPool {
            pool, mut requests_rx, ..
        } = setup(1);
        let a = NodeId::from("a");
        pool.set_peer_range(a.clone(), 1, 4);
        pool.start().unwrap();
        let requests = recv_requests(&mut requests_rx, 4).await;
        assert!(requests.iter().all(|r| r.peer_id == a));

        pool.add_block(a.clone(), chain.block(1), None, 100).unwrap();
        settle().await;
        assert_eq!(pool.get_status().num_pending, 3);

        assert_eq!(pool.redo_request(1), Some(a.clone()));
        settle().await;

        assert!(!pool.has_peer(&a));
        assert_eq!(pool.max_peer_height(), 0);
        assert!(pool.peek_two_blocks().first.is_none());
        for height in 1..=4 {
            assert_eq!(requester_peer(&pool, height), None, "height {}", height);
        }
        // The discarded block is wanted again
        assert_eq!(pool.get_status().num_pending, 4);

        // A new peer picks up all four heights
        let b = NodeId::from("b");
        pool.set_peer_range(b.clone(), 1, 4);
        let requests = recv_requests(&mut requests_rx, 4).await;
        assert!(requests.iter().all(|r| r.peer_id == b));
        assert_eq!(requests.iter().map(|r| r.height).collect::<Vec<_>>(), vec![1, 2, 3, 4]);

        pool.stop();
        pool.wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn redo_request_for_unknown_height() {
        let TestPool { pool, .. } = setup(1);
        assert_eq!(pool.redo_request(5), None);
    }

    #[tokio::test(start_paused = true)]
    async fn selection_skips_unready_and_stops_at_bad_scores() {
        let TestPool {
            pool, peer_manager, ..
        } = setup(1);
        let good = NodeId::from("good");
        let dialing = NodeId::from("dialing");
        let bad = NodeId::from("bad");
        let after_bad = NodeId::from("after-bad");
        peer_manager.set_score(&good, 10);
        peer_manager.set_score(&dialing, 20);
        peer_manager.set_state(&dialing, PeerConnectionState::Dialing);
        peer_manager.set_score(&bad, 0);
        peer_manager.set_score(&after_bad, -1);
        for peer in [&good, &dialing, &bad, &after_bad] {
            pool.set_peer_range(peer.clone(), 1, 100);
        }

        for _ in 0..20 {
            let picked = pool.shared.pick_incr_available_peer(1).unwrap();
            assert!(picked == good || picked == bad, "picked {}", picked);
        }
        assert_eq!(peer_num_pending(&pool, &dialing), Some(0));
        assert_eq!(peer_num_pending(&pool, &after_bad), Some(0));

        // Peers outside of the height range are never picked
        assert!(pool.shared.pick_incr_available_peer(101).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn selection_respects_the_per_peer_cap() {
        let config = BlockSyncConfig {
            max_pending_requests_per_peer: 2,
            ..Default::default()
        };
        let TestPool { pool, .. } = setup_with_config(config, 1);
        let a = NodeId::from("a");
        pool.set_peer_range(a.clone(), 1, 100);
        assert_eq!(pool.shared.pick_incr_available_peer(1), Some(a.clone()));
        assert_eq!(pool.shared.pick_incr_available_peer(2), Some(a.clone()));
        assert_eq!(pool.shared.pick_incr_available_peer(3), None);
        assert_eq!(peer_num_pending(&pool, &a), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_requests_free_the_peer_slot() {
        let chain = TestChain::new(1, 2);
        let TestPool {
            pool,
            mut requests_rx,
            mut faults_rx,
            ..
        } = setup(1);
        let a = NodeId::from("a");
        pool.set_peer_range(a.clone(), 1, 2);
        pool.start().unwrap();
        recv_requests(&mut requests_rx, 2).await;
        assert_eq!(peer_num_pending(&pool, &a), Some(2));

        // Receiving block 2 pushes the peer deadline out, block 1 is never answered
        time::sleep(Duration::from_secs(1)).await;
        pool.add_block(a.clone(), chain.block(2), None, 100).unwrap();
        assert_eq!(peer_num_pending(&pool, &a), Some(1));

        let retry = requests_rx.recv().await.unwrap();
        assert_eq!(retry.height, 1);
        assert_eq!(retry.peer_id, a);
        settle().await;
        // The timed out request was released before the retry was assigned
        assert_eq!(peer_num_pending(&pool, &a), Some(1));
        assert!(faults_rx.try_recv().is_err());
        pool.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn a_block_from_another_peer_releases_the_assigned_peer() {
        let chain = TestChain::new(1, 1);
        let TestPool {
            pool,
            mut requests_rx,
            mut faults_rx,
            ..
        } = setup(1);
        let a = NodeId::from("a");
        let b = NodeId::from("b");
        pool.set_peer_range(a.clone(), 1, 1);
        pool.start().unwrap();
        assert_eq!(requests_rx.recv().await.unwrap().peer_id, a);
        assert_eq!(peer_num_pending(&pool, &a), Some(1));

        pool.set_peer_range(b.clone(), 1, 1);
        pool.add_block(b.clone(), chain.block(1), None, 100).unwrap();
        assert_eq!(peer_num_pending(&pool, &a), Some(0));
        assert_eq!(peer_num_pending(&pool, &b), Some(0));
        assert!(faults_rx.try_recv().is_err());
        pool.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn late_blocks_after_stop_are_ignored() {
        let chain = TestChain::new(1, 2);
        let TestPool {
            pool, mut requests_rx, ..
        } = setup(1);
        pool.set_peer_range(NodeId::from("a"), 1, 2);
        pool.start().unwrap();
        recv_requests(&mut requests_rx, 2).await;
        pool.stop();
        pool.add_block(NodeId::from("a"), chain.block(1), None, 100).unwrap();
        assert!(pool.peek_two_blocks().first.is_none());
        pool.wait().await;
        assert!(pool.start().is_err());
    }

    #[test]
    fn start_height_can_only_be_reset_before_start() {
        let TestPool { pool, .. } = setup(1);
        pool.reset_start_height(42).unwrap();
        assert_eq!(pool.height(), 42);
        assert_eq!(pool.start_height(), 42);
        pool.set_peer_range(NodeId::from("a"), 1, 141);
        assert_eq!(pool.target_sync_blocks(), 100);
    }
}
