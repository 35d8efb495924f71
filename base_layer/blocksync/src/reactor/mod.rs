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

//! The block sync reactor connects the [BlockPool] to the network and to the rest of the node.
//!
//! It decodes inbound messages on the block sync channel, serves blocks and status to other peers, forwards the
//! pool's block requests and peer faults to the transport, and runs the driver loop that verifies and applies
//! fetched blocks until the node has caught up and control is handed to consensus.

mod driver;
mod watchdog;

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
    },
    time::Duration,
};

use log::*;
use tari_shutdown::{Shutdown, ShutdownSignal};
use tokio::{
    sync::{broadcast, mpsc},
    time::{self, Instant},
};

use self::driver::{Driver, DriverOutcome};
use crate::{
    blocks::{Height, NodeId},
    chain_state::ChainState,
    config::BlockSyncConfig,
    error::{BlockSyncError, ProtocolError, ServiceStateError},
    interfaces::{
        BlockExecutor,
        BlockStore,
        ConsensusHandle,
        FatalHook,
        InboundMessage,
        OutboundMessaging,
        PeerManager,
        PeerStatus,
        PeerUpdate,
        RestartHook,
    },
    pool::{BlockPool, BlockRequest, PeerFault},
    proto::BlockSyncMessage,
    lifecycle::{Lifecycle, TaskTracker},
};

const LOG_TARGET: &str = "c::bs::reactor";

const STATUS_CHANNEL_CAPACITY: usize = 16;

/// Published when block sync starts after state sync and when it completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSyncStatus {
    pub complete: bool,
    pub height: Height,
}

/// The node components block sync is wired to.
#[derive(Clone)]
pub struct ReactorServices {
    pub store: Arc<dyn BlockStore>,
    pub executor: Arc<dyn BlockExecutor>,
    pub consensus: Arc<dyn ConsensusHandle>,
    pub outbound: Arc<dyn OutboundMessaging>,
    pub peer_manager: Arc<dyn PeerManager>,
    /// Called by the self-remediation watchdog. Restarts are not requested if this is not set.
    pub restart_hook: Option<RestartHook>,
    /// Called when a committed block cannot be saved or applied. The process is aborted if this is not set. If the
    /// hook returns, the reactor stops and the node must be shut down by the caller.
    pub fatal_hook: Option<FatalHook>,
}

struct SyncChannels {
    requests_rx: mpsc::Receiver<BlockRequest>,
    faults_rx: mpsc::Receiver<PeerFault>,
}

struct InboundStreams {
    messages: mpsc::Receiver<InboundMessage>,
    peer_updates: mpsc::Receiver<PeerUpdate>,
}

struct ReactorShared {
    config: BlockSyncConfig,
    services: ReactorServices,
    initial_state: ChainState,
    pool: BlockPool,
    /// Set while blocks are being synced and once a restart has been requested
    block_sync: AtomicBool,
    lifecycle: Lifecycle,
    shutdown: Mutex<Shutdown>,
    shutdown_signal: ShutdownSignal,
    tasks: TaskTracker,
    sync_channels: Mutex<Option<SyncChannels>>,
    inbound: Mutex<Option<InboundStreams>>,
    status_tx: broadcast::Sender<BlockSyncStatus>,
    sync_start_time: Mutex<Option<Instant>>,
    last_restart_time: Mutex<Instant>,
}

/// Cheaply cloneable handle to the block sync reactor.
#[derive(Clone)]
pub struct BlockSyncReactor {
    shared: Arc<ReactorShared>,
}

impl BlockSyncReactor {
    /// Creates a reactor that syncs on top of `state`. `messages` carries raw messages received on the block sync
    /// channel and `peer_updates` the transport's peer up/down events.
    pub fn new(
        config: BlockSyncConfig,
        state: ChainState,
        services: ReactorServices,
        messages: mpsc::Receiver<InboundMessage>,
        peer_updates: mpsc::Receiver<PeerUpdate>,
    ) -> Result<Self, BlockSyncError> {
        config.validate()?;
        let (requests_tx, requests_rx) = mpsc::channel(config.max_total_requesters);
        let (faults_tx, faults_rx) = mpsc::channel(config.max_peer_err_buffer);
        let pool = BlockPool::new(
            config.clone(),
            state.next_height(),
            services.peer_manager.clone(),
            requests_tx,
            faults_tx,
        );
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        let shutdown = Shutdown::new();
        let shutdown_signal = shutdown.to_signal();

        Ok(Self {
            shared: Arc::new(ReactorShared {
                config,
                services,
                initial_state: state,
                pool,
                block_sync: AtomicBool::new(false),
                lifecycle: Lifecycle::new(),
                shutdown: Mutex::new(shutdown),
                shutdown_signal,
                tasks: TaskTracker::new(),
                sync_channels: Mutex::new(Some(SyncChannels { requests_rx, faults_rx })),
                inbound: Mutex::new(Some(InboundStreams { messages, peer_updates })),
                status_tx,
                sync_start_time: Mutex::new(None),
                last_restart_time: Mutex::new(Instant::now()),
            }),
        })
    }

    /// Starts serving peers and, if enabled, block sync. Fails without side effects if the chain state does not
    /// match the block store, in which case the reactor may be started again.
    pub fn start(&self) -> Result<(), BlockSyncError> {
        self.shared.lifecycle.start(|| self.shared.on_start())
    }

    /// Cancels every task. Use [BlockSyncReactor::wait] to wait for them to exit.
    pub fn stop(&self) {
        self.shared.stop();
    }

    pub async fn wait(&self) {
        self.shared.tasks.wait().await;
        self.shared.pool.wait().await;
    }

    /// Starts block sync from a state restored by state sync. The hand-off to consensus will report that blocks
    /// were synced even if none had to be applied.
    pub fn switch_to_block_sync(&self, state: ChainState) -> Result<(), BlockSyncError> {
        if !self.shared.lifecycle.is_running() {
            return Err(ServiceStateError::NotRunning.into());
        }
        if self.shared.pool.is_running() || self.is_block_syncing() {
            return Err(BlockSyncError::AlreadySyncing);
        }
        let height = state.last_block_height;
        self.shared.pool.reset_start_height(height + 1)?;
        self.shared.start_block_sync(state, true)?;
        info!(target: LOG_TARGET, "Switched to block sync at height {}", height + 1);
        let _result = self.shared.status_tx.send(BlockSyncStatus {
            complete: false,
            height,
        });
        Ok(())
    }

    pub fn is_block_syncing(&self) -> bool {
        self.shared.is_block_syncing()
    }

    pub fn max_peer_block_height(&self) -> Height {
        self.shared.pool.max_peer_height()
    }

    /// Time since block sync started, or zero if the node is not block syncing
    pub fn total_synced_time(&self) -> Duration {
        if !self.is_block_syncing() {
            return Duration::ZERO;
        }
        self.shared
            .lock_sync_start_time()
            .map(|start| start.elapsed())
            .unwrap_or_default()
    }

    /// Estimated time until the node has caught up, based on the smoothed sync rate. Zero if the node is not block
    /// syncing or no rate has been measured yet.
    pub fn remaining_sync_time(&self) -> Duration {
        if !self.is_block_syncing() {
            return Duration::ZERO;
        }
        let pool = &self.shared.pool;
        let target = pool.target_sync_blocks();
        let start_height = pool.start_height();
        let next_height = self.shared.services.store.height() + 1;
        let rate = pool.last_sync_rate();
        if next_height < start_height || rate < 0.001 {
            return Duration::ZERO;
        }
        let synced = next_height - start_height;
        let remaining = target.saturating_sub(synced) as f64 / rate;
        Duration::try_from_secs_f64(remaining).unwrap_or(Duration::MAX)
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<BlockSyncStatus> {
        self.shared.status_tx.subscribe()
    }

    pub fn pool(&self) -> &BlockPool {
        &self.shared.pool
    }

    pub fn config(&self) -> &BlockSyncConfig {
        &self.shared.config
    }
}

impl ReactorShared {
    fn stop(&self) {
        if !self.lifecycle.stop() {
            return;
        }
        self.shutdown.lock().unwrap_or_else(PoisonError::into_inner).trigger();
        self.pool.stop();
        info!(target: LOG_TARGET, "Block sync reactor stopped");
    }

    /// Local state has diverged from the chain. Aborts the process unless a fatal hook is set, in which case the
    /// reactor is stopped once the hook returns.
    fn halt(&self, reason: &str) {
        error!(target: LOG_TARGET, "Block sync halted: {}", reason);
        match self.services.fatal_hook.as_ref() {
            Some(hook) => hook(reason),
            None => std::process::abort(),
        }
        self.stop();
    }

    fn is_block_syncing(&self) -> bool {
        self.block_sync.load(Ordering::SeqCst)
    }

    fn lock_sync_start_time(&self) -> MutexGuard<'_, Option<Instant>> {
        self.sync_start_time.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn last_restart_time(&self) -> Instant {
        *self.last_restart_time.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_start(self: &Arc<Self>) -> Result<(), BlockSyncError> {
        let state_height = self.initial_state.last_block_height;
        let store_height = self.services.store.height();
        if state_height != store_height {
            return Err(BlockSyncError::StateStoreHeightMismatch {
                state_height,
                store_height,
            });
        }

        if self.config.enabled {
            let start_height = if store_height == 0 {
                self.initial_state.initial_height
            } else {
                store_height + 1
            };
            self.pool.reset_start_height(start_height)?;
            self.start_block_sync(self.initial_state.clone(), false)?;
            info!(target: LOG_TARGET, "Block sync started at height {}", start_height);
        } else {
            info!(target: LOG_TARGET, "Block sync is disabled, serving peers only");
        }

        *self.last_restart_time.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
        let inbound = self
            .inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(ServiceStateError::AlreadyStarted)?;
        self.tasks.spawn(process_inbound_messages(
            self.clone(),
            inbound.messages,
            self.shutdown_signal.clone(),
        ));
        self.tasks.spawn(process_peer_updates(
            self.clone(),
            inbound.peer_updates,
            self.shutdown_signal.clone(),
        ));
        Ok(())
    }

    /// Starts the pool, the request forwarder and the driver
    fn start_block_sync(self: &Arc<Self>, state: ChainState, state_synced: bool) -> Result<(), BlockSyncError> {
        let channels = self
            .sync_channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(BlockSyncError::AlreadySyncing)?;
        self.block_sync.store(true, Ordering::SeqCst);
        if let Err(err) = self.pool.start() {
            self.block_sync.store(false, Ordering::SeqCst);
            *self.sync_channels.lock().unwrap_or_else(PoisonError::into_inner) = Some(channels);
            return Err(err.into());
        }
        *self.lock_sync_start_time() = Some(Instant::now());

        self.tasks.spawn(process_requests(
            self.clone(),
            channels,
            self.shutdown_signal.clone(),
        ));
        self.tasks.spawn(run_block_sync(
            self.clone(),
            state,
            state_synced,
            self.shutdown_signal.clone(),
        ));
        Ok(())
    }

    async fn handle_inbound(&self, msg: InboundMessage) {
        if let Err(err) = self.handle_message(&msg.source, &msg.bytes).await {
            warn!(
                target: LOG_TARGET,
                "Failed to handle block sync message from {}: {}", msg.source, err
            );
            self.services
                .outbound
                .evict(&msg.source, format!("blocksync: {}", err))
                .await;
        }
    }

    async fn handle_message(&self, peer: &NodeId, bytes: &[u8]) -> Result<(), BlockSyncError> {
        let msg = BlockSyncMessage::from_bytes(bytes)?;
        trace!(target: LOG_TARGET, "Received {} from {}", msg, peer);

        match msg {
            BlockSyncMessage::BlockRequest { height } => self.respond_to_peer(peer, height).await?,
            BlockSyncMessage::BlockResponse { block, ext_commit } => {
                block.validate_basic().map_err(ProtocolError::InvalidBlock)?;
                if let Err(err) = self.pool.add_block(peer.clone(), *block, ext_commit, bytes.len()) {
                    debug!(target: LOG_TARGET, "Failed to add block from {}: {}", peer, err);
                }
            },
            BlockSyncMessage::StatusRequest => {
                let response = BlockSyncMessage::StatusResponse {
                    base: self.services.store.base(),
                    height: self.services.store.height(),
                };
                self.services.outbound.send(peer, response).await?;
            },
            BlockSyncMessage::StatusResponse { base, height } => {
                self.pool.set_peer_range(peer.clone(), base, height);
            },
            BlockSyncMessage::NoBlockResponse { height } => {
                debug!(target: LOG_TARGET, "Peer {} does not have block #{}", peer, height);
            },
        }
        Ok(())
    }

    async fn respond_to_peer(&self, peer: &NodeId, height: Height) -> Result<(), BlockSyncError> {
        let store = &self.services.store;
        let response = match store.load_block(height).await? {
            Some(block) => BlockSyncMessage::BlockResponse {
                block: Box::new(block),
                ext_commit: store.load_ext_commit(height).await?,
            },
            None => {
                debug!(
                    target: LOG_TARGET,
                    "Peer {} asked for block #{} that we don't have", peer, height
                );
                BlockSyncMessage::NoBlockResponse { height }
            },
        };
        self.services.outbound.send(peer, response).await?;
        Ok(())
    }

    async fn handle_peer_update(&self, update: PeerUpdate) {
        debug!(
            target: LOG_TARGET,
            "Peer {} is {:?}", update.node_id, update.status
        );
        match update.status {
            PeerStatus::Up => {
                let status = BlockSyncMessage::StatusResponse {
                    base: self.services.store.base(),
                    height: self.services.store.height(),
                };
                if let Err(err) = self.services.outbound.send(&update.node_id, status).await {
                    warn!(
                        target: LOG_TARGET,
                        "Unable to send status to {}: {}", update.node_id, err
                    );
                }
            },
            PeerStatus::Down => self.pool.remove_peer(&update.node_id),
        }
    }

    async fn switch_to_consensus(self: &Arc<Self>, driver: Driver, shutdown_signal: ShutdownSignal) {
        self.pool.stop();
        self.pool.wait().await;
        self.block_sync.store(false, Ordering::SeqCst);
        *self.lock_sync_start_time() = None;

        let had_to_sync = driver.had_to_sync();
        let blocks_synced = driver.blocks_synced();
        let state = driver.into_state();
        let height = state.last_block_height;
        info!(
            target: LOG_TARGET,
            "Switching to consensus at height {} (blocks synced: {}, max peer height: {})",
            height,
            blocks_synced,
            self.pool.max_peer_height()
        );
        self.services.consensus.switch_to_consensus(state, had_to_sync).await;
        let _result = self.status_tx.send(BlockSyncStatus { complete: true, height });

        self.tasks.spawn(watchdog::run(self.clone(), shutdown_signal));
    }
}

async fn process_inbound_messages(
    shared: Arc<ReactorShared>,
    mut messages: mpsc::Receiver<InboundMessage>,
    mut shutdown_signal: ShutdownSignal,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown_signal => break,
            msg = messages.recv() => match msg {
                Some(msg) => shared.handle_inbound(msg).await,
                None => {
                    debug!(target: LOG_TARGET, "Inbound message stream closed");
                    break;
                },
            },
        }
    }
}

async fn process_peer_updates(
    shared: Arc<ReactorShared>,
    mut peer_updates: mpsc::Receiver<PeerUpdate>,
    mut shutdown_signal: ShutdownSignal,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown_signal => break,
            update = peer_updates.recv() => match update {
                Some(update) => shared.handle_peer_update(update).await,
                None => {
                    debug!(target: LOG_TARGET, "Peer update stream closed");
                    break;
                },
            },
        }
    }
}

/// Sends the pool's block requests, evicts faulty peers and periodically asks every peer for its status.
async fn process_requests(shared: Arc<ReactorShared>, channels: SyncChannels, mut shutdown_signal: ShutdownSignal) {
    let SyncChannels {
        mut requests_rx,
        mut faults_rx,
    } = channels;
    let interval = shared.config.status_update_interval;
    let mut status_ticker = time::interval_at(Instant::now() + interval, interval);
    let outbound = shared.services.outbound.clone();

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => break,
            Some(request) = requests_rx.recv() => {
                let msg = BlockSyncMessage::BlockRequest { height: request.height };
                if let Err(err) = outbound.send(&request.peer_id, msg).await {
                    warn!(
                        target: LOG_TARGET,
                        "Unable to request block #{} from {}: {}", request.height, request.peer_id, err
                    );
                }
            },
            Some(fault) = faults_rx.recv() => {
                warn!(target: LOG_TARGET, "Evicting peer {}: {}", fault.peer_id, fault.reason);
                outbound
                    .evict(&fault.peer_id, format!("blocksync.request: {}", fault.reason))
                    .await;
            },
            _ = status_ticker.tick() => {
                if let Err(err) = outbound.broadcast(BlockSyncMessage::StatusRequest).await {
                    warn!(target: LOG_TARGET, "Unable to broadcast status request: {}", err);
                }
            },
        }
    }
}

/// Runs the driver until the node has caught up, restarting it after a verification failure.
async fn run_block_sync(
    shared: Arc<ReactorShared>,
    state: ChainState,
    state_synced: bool,
    shutdown_signal: ShutdownSignal,
) {
    let mut driver = Driver::new(shared.clone(), state, state_synced);
    loop {
        match driver.run(shutdown_signal.clone()).await {
            DriverOutcome::CaughtUp => break,
            DriverOutcome::Aborted => {
                warn!(
                    target: LOG_TARGET,
                    "Block sync run aborted at height {}, restarting", shared.pool.height()
                );
            },
            DriverOutcome::Halted => {
                error!(target: LOG_TARGET, "Block sync halted at height {}", shared.pool.height());
                return;
            },
            DriverOutcome::Cancelled => {
                debug!(target: LOG_TARGET, "Block sync cancelled");
                return;
            },
        }
    }
    shared.switch_to_consensus(driver, shutdown_signal).await;
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_helpers::{
        MemoryBlockStore,
        MockConsensus,
        MockExecutor,
        MockOutbound,
        MockPeerManager,
        SentMessage,
        TestChain,
    };

    struct TestReactor {
        reactor: BlockSyncReactor,
        messages_tx: mpsc::Sender<InboundMessage>,
        peer_updates_tx: mpsc::Sender<PeerUpdate>,
        outbound: MockOutbound,
    }

    fn setup(config: BlockSyncConfig, chain: &TestChain, store_height: Height) -> TestReactor {
        let store = MemoryBlockStore::with_chain(chain, store_height);
        let outbound = MockOutbound::new();
        let services = ReactorServices {
            store: Arc::new(store),
            executor: Arc::new(MockExecutor::new()),
            consensus: Arc::new(MockConsensus::new()),
            outbound: Arc::new(outbound.clone()),
            peer_manager: Arc::new(MockPeerManager::new()),
            restart_hook: None,
            fatal_hook: None,
        };
        let (messages_tx, messages_rx) = mpsc::channel(10);
        let (peer_updates_tx, peer_updates_rx) = mpsc::channel(10);
        let reactor = BlockSyncReactor::new(
            config,
            chain.state_at(store_height),
            services,
            messages_rx,
            peer_updates_rx,
        )
        .unwrap();
        TestReactor {
            reactor,
            messages_tx,
            peer_updates_tx,
            outbound,
        }
    }

    fn serve_only() -> BlockSyncConfig {
        BlockSyncConfig {
            enabled: false,
            ..Default::default()
        }
    }

    async fn send(messages_tx: &mpsc::Sender<InboundMessage>, peer: &NodeId, msg: BlockSyncMessage) {
        messages_tx
            .send(InboundMessage::new(peer.clone(), msg.to_encoded_bytes().unwrap()))
            .await
            .unwrap();
        time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn it_serves_blocks_and_status() {
        let chain = TestChain::new(1, 5);
        let TestReactor {
            reactor,
            messages_tx,
            outbound,
            ..
        } = setup(serve_only(), &chain, 5);
        reactor.start().unwrap();
        let peer = NodeId::from("peer");

        send(&messages_tx, &peer, BlockSyncMessage::BlockRequest { height: 3 }).await;
        send(&messages_tx, &peer, BlockSyncMessage::BlockRequest { height: 9 }).await;
        send(&messages_tx, &peer, BlockSyncMessage::StatusRequest).await;

        let sent = outbound.sent_to(&peer);
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0], BlockSyncMessage::BlockResponse {
            block: Box::new(chain.block(3)),
            ext_commit: Some(chain.ext_commit(3)),
        });
        assert_eq!(sent[1], BlockSyncMessage::NoBlockResponse { height: 9 });
        assert_eq!(sent[2], BlockSyncMessage::StatusResponse { base: 1, height: 5 });
        assert!(outbound.evictions().is_empty());
        assert!(!reactor.is_block_syncing());

        reactor.stop();
        reactor.wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn it_tracks_peers() {
        let chain = TestChain::new(1, 2);
        let TestReactor {
            reactor,
            messages_tx,
            peer_updates_tx,
            outbound,
        } = setup(serve_only(), &chain, 2);
        reactor.start().unwrap();
        let peer = NodeId::from("peer");

        peer_updates_tx
            .send(PeerUpdate {
                node_id: peer.clone(),
                status: PeerStatus::Up,
            })
            .await
            .unwrap();
        time::sleep(Duration::from_millis(1)).await;
        assert_eq!(outbound.sent(), vec![SentMessage {
            peer: Some(peer.clone()),
            message: BlockSyncMessage::StatusResponse { base: 1, height: 2 },
        }]);

        send(&messages_tx, &peer, BlockSyncMessage::StatusResponse { base: 1, height: 40 }).await;
        assert_eq!(reactor.max_peer_block_height(), 40);

        peer_updates_tx
            .send(PeerUpdate {
                node_id: peer.clone(),
                status: PeerStatus::Down,
            })
            .await
            .unwrap();
        time::sleep(Duration::from_millis(1)).await;
        assert_eq!(reactor.max_peer_block_height(), 0);

        reactor.stop();
        reactor.wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn bad_messages_evict_the_sender() {
        let chain = TestChain::new(1, 3);
        let TestReactor {
            reactor,
            messages_tx,
            outbound,
            ..
        } = setup(serve_only(), &chain, 1);
        reactor.start().unwrap();
        let peer = NodeId::from("peer");

        messages_tx
            .send(InboundMessage::new(peer.clone(), vec![0xff, 0x01]))
            .await
            .unwrap();
        time::sleep(Duration::from_millis(1)).await;
        let evictions = outbound.evictions();
        assert_eq!(evictions.len(), 1);
        assert_eq!(evictions[0].0, peer);
        assert!(evictions[0].1.starts_with("blocksync: "));

        let mut block = chain.block(3);
        block.transactions.push(b"not committed to".to_vec());
        let other = NodeId::from("other");
        send(&messages_tx, &other, BlockSyncMessage::BlockResponse {
            block: Box::new(block),
            ext_commit: None,
        })
        .await;
        assert!(outbound.is_evicted(&other));

        reactor.stop();
        reactor.wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn start_checks_the_store_height() {
        let chain = TestChain::new(1, 3);
        let store = MemoryBlockStore::with_chain(&chain, 3);
        let services = ReactorServices {
            store: Arc::new(store),
            executor: Arc::new(MockExecutor::new()),
            consensus: Arc::new(MockConsensus::new()),
            outbound: Arc::new(MockOutbound::new()),
            peer_manager: Arc::new(MockPeerManager::new()),
            restart_hook: None,
            fatal_hook: None,
        };
        let (_messages_tx, messages_rx) = mpsc::channel(1);
        let (_peer_updates_tx, peer_updates_rx) = mpsc::channel(1);
        let reactor = BlockSyncReactor::new(
            BlockSyncConfig::default(),
            chain.state_at(2),
            services,
            messages_rx,
            peer_updates_rx,
        )
        .unwrap();

        let err = reactor.start().unwrap_err();
        assert!(matches!(err, BlockSyncError::StateStoreHeightMismatch {
            state_height: 2,
            store_height: 3
        }));
        assert!(!reactor.is_block_syncing());
        assert!(!reactor.pool().is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn switch_to_block_sync_starts_the_pool() {
        let chain = TestChain::new(1, 10);
        let TestReactor {
            reactor, outbound, ..
        } = setup(serve_only(), &chain, 0);
        assert!(matches!(
            reactor.switch_to_block_sync(chain.state_at(4)),
            Err(BlockSyncError::ServiceState(ServiceStateError::NotRunning))
        ));
        reactor.start().unwrap();
        let mut status = reactor.subscribe_status();

        reactor.switch_to_block_sync(chain.state_at(4)).unwrap();
        assert_eq!(status.recv().await.unwrap(), BlockSyncStatus {
            complete: false,
            height: 4
        });
        assert!(reactor.is_block_syncing());
        assert!(reactor.pool().is_running());
        assert_eq!(reactor.pool().height(), 5);
        assert!(matches!(
            reactor.switch_to_block_sync(chain.state_at(4)),
            Err(BlockSyncError::AlreadySyncing)
        ));

        // The first status request goes out after one status interval
        time::sleep(reactor.config().status_update_interval + Duration::from_millis(1)).await;
        assert!(outbound
            .sent()
            .iter()
            .any(|m| m.peer.is_none() && m.message == BlockSyncMessage::StatusRequest));

        reactor.stop();
        reactor.wait().await;
        assert!(!reactor.pool().is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn sync_time_is_zero_when_not_syncing() {
        let chain = TestChain::new(1, 1);
        let TestReactor { reactor, .. } = setup(serve_only(), &chain, 0);
        reactor.start().unwrap();
        assert_eq!(reactor.total_synced_time(), Duration::ZERO);
        assert_eq!(reactor.remaining_sync_time(), Duration::ZERO);
        reactor.stop();
        reactor.wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn total_synced_time_counts_from_the_start() {
        let chain = TestChain::new(1, 1);
        let TestReactor { reactor, .. } = setup(BlockSyncConfig::default(), &chain, 0);
        reactor.start().unwrap();
        assert!(reactor.is_block_syncing());
        time::advance(Duration::from_secs(5)).await;
        assert!(reactor.total_synced_time() >= Duration::from_secs(5));
        // No rate has been measured yet
        assert_eq!(reactor.remaining_sync_time(), Duration::ZERO);
        reactor.stop();
        reactor.wait().await;
    }
}
