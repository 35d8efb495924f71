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

use std::{
    fmt::{Display, Formatter},
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
        Weak,
    },
    time::Duration,
};

use log::*;
use tari_shutdown::{Shutdown, ShutdownSignal};
use tokio::{
    sync::mpsc,
    time::{self, Instant},
};

use super::{BlockRequest, PoolShared};
use crate::{
    blocks::{Block, Height, NodeId},
    commit::ExtendedCommit,
};

const LOG_TARGET: &str = "c::bs::requester";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    /// The assigned peer went away. A block that was already received is kept.
    PeerRemoved,
    /// The received block failed verification and must be fetched again.
    BadBlock,
}

impl Display for RetryReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryReason::PeerRemoved => write!(f, "PeerRemoved"),
            RetryReason::BadBlock => write!(f, "BadBlock"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedoOp {
    pub peer_id: NodeId,
    pub reason: RetryReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetBlockOutcome {
    Accepted,
    /// The same peer delivered the block again
    Duplicate,
    /// A different peer delivered a block after one was accepted
    Conflict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum RedoOutcome {
    /// Queued for the running task. Dropped if a retry is already queued.
    Signalled,
    /// The task had finished and the requester was reset. The caller must start a new task.
    Restart,
    /// The task had finished and the requester kept its block
    Ignored,
}

/// Channels to a running requester task. Dropping this cancels the task.
pub(super) struct RequesterHandle {
    got_block_tx: mpsc::Sender<()>,
    redo_tx: mpsc::Sender<RedoOp>,
    shutdown: Shutdown,
}

impl Drop for RequesterHandle {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

#[derive(Default)]
struct RequesterState {
    peer_id: Option<NodeId>,
    block: Option<Arc<Block>>,
    ext_commit: Option<ExtendedCommit>,
    block_sender: Option<NodeId>,
    task: Option<RequesterHandle>,
}

/// Fetches the block at one height. A background task picks a peer, requests the block and waits for it, retrying
/// with another peer on timeout or when asked to.
pub struct Requester {
    height: Height,
    num_pending: Arc<AtomicI64>,
    state: Mutex<RequesterState>,
}

impl Requester {
    pub(super) fn new(height: Height, num_pending: Arc<AtomicI64>) -> Self {
        Self {
            height,
            num_pending,
            state: Mutex::new(RequesterState::default()),
        }
    }

    pub fn height(&self) -> Height {
        self.height
    }

    pub fn peer_id(&self) -> Option<NodeId> {
        self.lock_state().peer_id.clone()
    }

    pub fn block(&self) -> Option<Arc<Block>> {
        self.lock_state().block.clone()
    }

    pub fn ext_commit(&self) -> Option<ExtendedCommit> {
        self.lock_state().ext_commit.clone()
    }

    pub fn has_block(&self) -> bool {
        self.lock_state().block.is_some()
    }

    pub fn is_task_running(&self) -> bool {
        self.lock_state().task.is_some()
    }

    /// The peer that should be blamed if the block turns out to be bad
    pub(super) fn responsible_peer(&self) -> Option<NodeId> {
        let state = self.lock_state();
        state.block_sender.clone().or_else(|| state.peer_id.clone())
    }

    pub(super) fn set_block(&self, block: Arc<Block>, ext_commit: Option<ExtendedCommit>, peer: &NodeId) -> SetBlockOutcome {
        let mut state = self.lock_state();
        if state.block.is_none() {
            state.block = Some(block);
            if ext_commit.is_some() {
                state.ext_commit = ext_commit;
            }
            state.block_sender = Some(peer.clone());
            if let Some(task) = state.task.as_ref() {
                let _result = task.got_block_tx.try_send(());
            }
            return SetBlockOutcome::Accepted;
        }

        if state.peer_id.as_ref() == Some(peer) || state.block_sender.as_ref() == Some(peer) {
            SetBlockOutcome::Duplicate
        } else {
            SetBlockOutcome::Conflict
        }
    }

    /// Asks the requester to pick another peer. If a retry is already queued, this one is dropped.
    pub(super) fn redo(&self, op: RedoOp) -> RedoOutcome {
        let mut state = self.lock_state();
        if let Some(task) = state.task.as_ref() {
            let _result = task.redo_tx.try_send(op);
            return RedoOutcome::Signalled;
        }
        if self.reset_locked(&mut state, op.reason == RetryReason::BadBlock) {
            RedoOutcome::Restart
        } else {
            RedoOutcome::Ignored
        }
    }

    /// Cancels the background task, if any
    pub(super) fn stop(&self) {
        self.lock_state().task = None;
    }

    fn set_peer(&self, peer: NodeId) {
        self.lock_state().peer_id = Some(peer);
    }

    /// Clears the peer assignment. A fetched block is only discarded if `force` is set, otherwise the reset is
    /// refused.
    fn reset(&self, force: bool) -> bool {
        let mut state = self.lock_state();
        self.reset_locked(&mut state, force)
    }

    fn reset_locked(&self, state: &mut RequesterState, force: bool) -> bool {
        if state.block.is_some() && !force {
            return false;
        }
        if state.block.is_some() {
            // The block is wanted again
            self.num_pending.fetch_add(1, Ordering::SeqCst);
        }
        state.peer_id = None;
        state.block = None;
        state.ext_commit = None;
        state.block_sender = None;
        true
    }

    /// Attaches a new task to this requester and returns the task's receivers and cancel signal.
    pub(super) fn attach_task(&self) -> TaskChannels {
        let (got_block_tx, got_block_rx) = mpsc::channel(1);
        let (redo_tx, redo_rx) = mpsc::channel(1);
        let shutdown = Shutdown::new();
        let signal = shutdown.to_signal();
        self.lock_state().task = Some(RequesterHandle {
            got_block_tx,
            redo_tx,
            shutdown,
        });
        TaskChannels {
            got_block_rx,
            redo_rx,
            signal,
        }
    }

    /// Detaches the task once the block has been received. A retry queued in the meantime is handed back to the task
    /// instead, since nothing would receive it after detaching.
    fn try_finish(&self, redo_rx: &mut mpsc::Receiver<RedoOp>) -> Result<(), RedoOp> {
        let mut state = self.lock_state();
        if let Ok(op) = redo_rx.try_recv() {
            return Err(op);
        }
        state.task = None;
        Ok(())
    }

    fn lock_state(&self) -> MutexGuard<'_, RequesterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub(super) struct TaskChannels {
    got_block_rx: mpsc::Receiver<()>,
    redo_rx: mpsc::Receiver<RedoOp>,
    signal: ShutdownSignal,
}

enum WaitOutcome {
    Retry,
    Done,
    Cancelled,
}

pub(super) struct RequesterTask {
    requester: Arc<Requester>,
    pool: Weak<PoolShared>,
    channels: TaskChannels,
    pool_signal: ShutdownSignal,
    request_interval: Duration,
    peer_timeout: Duration,
}

impl RequesterTask {
    pub fn new(
        requester: Arc<Requester>,
        pool: Weak<PoolShared>,
        channels: TaskChannels,
        pool_signal: ShutdownSignal,
        request_interval: Duration,
        peer_timeout: Duration,
    ) -> Self {
        Self {
            requester,
            pool,
            channels,
            pool_signal,
            request_interval,
            peer_timeout,
        }
    }

    pub async fn run(mut self) {
        let height = self.requester.height();
        loop {
            let Some(peer) = self.select_peer().await else {
                trace!(target: LOG_TARGET, "Requester for height {} cancelled", height);
                return;
            };
            self.requester.set_peer(peer.clone());
            if !self.send_request(peer.clone()).await {
                return;
            }

            match self.wait_for_block().await {
                WaitOutcome::Retry => {
                    debug!(target: LOG_TARGET, "Retrying block {} (previous peer: {})", height, peer);
                },
                WaitOutcome::Done | WaitOutcome::Cancelled => return,
            }
        }
    }

    fn is_cancelled(&self) -> bool {
        self.channels.signal.is_triggered() || self.pool_signal.is_triggered()
    }

    async fn select_peer(&mut self) -> Option<NodeId> {
        loop {
            if self.is_cancelled() {
                return None;
            }
            let pool = self.pool.upgrade()?;
            if let Some(peer) = pool.pick_incr_available_peer(self.requester.height()) {
                return Some(peer);
            }
            drop(pool);

            tokio::select! {
                _ = self.channels.signal.clone() => return None,
                _ = self.pool_signal.clone() => return None,
                _ = time::sleep(self.request_interval) => {},
            }
        }
    }

    async fn send_request(&mut self, peer_id: NodeId) -> bool {
        let requests_tx = match self.pool.upgrade() {
            Some(pool) => pool.requests_tx.clone(),
            None => return false,
        };
        let request = BlockRequest {
            height: self.requester.height(),
            peer_id,
        };
        tokio::select! {
            _ = self.channels.signal.clone() => false,
            _ = self.pool_signal.clone() => false,
            result = requests_tx.send(request) => result.is_ok(),
        }
    }

    async fn wait_for_block(&mut self) -> WaitOutcome {
        let timeout = time::sleep(self.peer_timeout);
        tokio::pin!(timeout);
        loop {
            tokio::select! {
                _ = self.channels.signal.clone() => return WaitOutcome::Cancelled,
                _ = self.pool_signal.clone() => return WaitOutcome::Cancelled,

                Some(op) = self.channels.redo_rx.recv() => {
                    if self.requester.reset(op.reason == RetryReason::BadBlock) {
                        return WaitOutcome::Retry;
                    }
                },

                _ = &mut timeout => {
                    timeout.as_mut().reset(Instant::now() + self.peer_timeout);
                    let peer_id = self.requester.peer_id();
                    if self.requester.reset(false) {
                        if let (Some(peer_id), Some(pool)) = (peer_id, self.pool.upgrade()) {
                            pool.release_peer_request(&peer_id);
                        }
                        return WaitOutcome::Retry;
                    }
                },

                Some(_) = self.channels.got_block_rx.recv() => {
                    if !self.requester.has_block() {
                        // Stale notification for a block that has since been discarded
                        continue;
                    }
                    match self.requester.try_finish(&mut self.channels.redo_rx) {
                        Ok(()) => return WaitOutcome::Done,
                        Err(op) => {
                            if self.requester.reset(op.reason == RetryReason::BadBlock) {
                                return WaitOutcome::Retry;
                            }
                        },
                    }
                },
            }
        }
    }
}
