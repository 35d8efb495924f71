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

use std::time::Duration;

use log::*;
use tari_shutdown::Shutdown;

use super::rate_monitor::RateMonitor;
use crate::blocks::{Height, NodeId};

const LOG_TARGET: &str = "c::bs::peer";

const RECV_MONITOR_SAMPLE_PERIOD: Duration = Duration::from_secs(1);
const RECV_MONITOR_WINDOW: Duration = Duration::from_secs(40);

/// Pool bookkeeping for one block sync peer.
#[derive(Debug)]
pub struct PeerRecord {
    id: NodeId,
    base: Height,
    height: Height,
    num_pending: usize,
    did_timeout: bool,
    recv_monitor: RateMonitor,
    /// Cancels the running deadline timer when replaced, cleared or dropped
    timeout: Option<Shutdown>,
}

impl PeerRecord {
    pub fn new(id: NodeId, base: Height, height: Height) -> Self {
        Self {
            id,
            base,
            height,
            num_pending: 0,
            did_timeout: false,
            recv_monitor: RateMonitor::new(RECV_MONITOR_SAMPLE_PERIOD, RECV_MONITOR_WINDOW),
            timeout: None,
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn base(&self) -> Height {
        self.base
    }

    pub fn height(&self) -> Height {
        self.height
    }

    pub fn set_range(&mut self, base: Height, height: Height) {
        self.base = base;
        self.height = height;
    }

    pub fn has_height(&self, height: Height) -> bool {
        self.base <= height && height <= self.height
    }

    pub fn num_pending(&self) -> usize {
        self.num_pending
    }

    pub fn did_timeout(&self) -> bool {
        self.did_timeout
    }

    pub fn has_timer(&self) -> bool {
        self.timeout.is_some()
    }

    pub(super) fn mark_timed_out(&mut self) {
        self.did_timeout = true;
    }

    /// Assigns one more request to this peer. The receive monitor is restarted when the first request is assigned
    /// and the deadline timer (created by `arm_timeout`) if none is running.
    pub(super) fn incr_pending<F>(&mut self, min_recv_rate: u64, arm_timeout: F)
    where F: FnOnce() -> Shutdown {
        if self.num_pending == 0 {
            self.reset_monitor(min_recv_rate);
        }
        if self.timeout.is_none() {
            self.set_timeout(Some(arm_timeout()));
        }
        self.num_pending += 1;
    }

    /// Releases a request this peer will no longer be asked to answer. Nothing is recorded as received and the
    /// deadline keeps running, so a silent peer still times out.
    pub(super) fn cancel_pending(&mut self) {
        self.num_pending = self.num_pending.saturating_sub(1);
    }

    /// Resolves one request with a block of `recv_size` bytes. The deadline is extended while requests remain and
    /// disarmed once none do.
    pub(super) fn decr_pending<F>(&mut self, recv_size: usize, arm_timeout: F)
    where F: FnOnce() -> Shutdown {
        if self.num_pending == 0 {
            debug!(
                target: LOG_TARGET,
                "Peer {} delivered a block without an outstanding request", self.id
            );
        }
        self.num_pending = self.num_pending.saturating_sub(1);
        if self.num_pending == 0 {
            self.set_timeout(None);
        } else {
            self.recv_monitor.update(recv_size);
            self.set_timeout(Some(arm_timeout()));
        }
    }

    fn set_timeout(&mut self, timeout: Option<Shutdown>) {
        if let Some(mut previous) = std::mem::replace(&mut self.timeout, timeout) {
            previous.trigger();
        }
    }

    /// True if the peer has been receiving data, but slower than `min_recv_rate` bytes per second. A rate of zero
    /// means nothing has been measured yet.
    pub(super) fn is_too_slow(&mut self, min_recv_rate: u64) -> Option<u64> {
        let rate = self.recv_monitor.current_transfer_rate();
        if rate != 0 && rate < min_recv_rate {
            Some(rate)
        } else {
            None
        }
    }

    fn reset_monitor(&mut self, min_recv_rate: u64) {
        self.recv_monitor = RateMonitor::new(RECV_MONITOR_SAMPLE_PERIOD, RECV_MONITOR_WINDOW);
        // Start high so that a new peer is not considered slow before it had a chance to send anything
        self.recv_monitor.set_rema(min_recv_rate as f64 * std::f64::consts::E);
    }
}

impl Drop for PeerRecord {
    fn drop(&mut self) {
        self.set_timeout(None);
    }
}

#[cfg(test)]
mod test {
    use tari_shutdown::ShutdownSignal;

    use super::*;

    fn armer(signals: &mut Vec<ShutdownSignal>) -> impl FnOnce() -> Shutdown + '_ {
        move || {
            let shutdown = Shutdown::new();
            signals.push(shutdown.to_signal());
            shutdown
        }
    }

    #[tokio::test]
    async fn timer_is_armed_while_requests_are_outstanding() {
        let mut signals = Vec::new();
        let mut peer = PeerRecord::new(NodeId::from("a"), 1, 10);
        peer.incr_pending(7680, armer(&mut signals));
        peer.incr_pending(7680, armer(&mut signals));
        assert_eq!(peer.num_pending(), 2);
        // Only the first request arms a timer
        assert_eq!(signals.len(), 1);
        assert!(peer.has_timer());

        peer.decr_pending(1000, armer(&mut signals));
        assert_eq!(peer.num_pending(), 1);
        assert_eq!(signals.len(), 2);
        // Re-arming cancels the previous timer
        assert!(signals[0].is_triggered());
        assert!(!signals[1].is_triggered());

        peer.decr_pending(1000, armer(&mut signals));
        assert_eq!(peer.num_pending(), 0);
        assert!(!peer.has_timer());
        assert!(signals[1].is_triggered());

        // Never goes below zero
        peer.decr_pending(1000, armer(&mut signals));
        assert_eq!(peer.num_pending(), 0);
    }

    #[test]
    fn has_height() {
        let peer = PeerRecord::new(NodeId::from("a"), 5, 10);
        assert!(!peer.has_height(4));
        assert!(peer.has_height(5));
        assert!(peer.has_height(10));
        assert!(!peer.has_height(11));
    }

    #[tokio::test(start_paused = true)]
    async fn new_peers_are_not_slow() {
        let mut signals = Vec::new();
        let mut peer = PeerRecord::new(NodeId::from("a"), 1, 10);
        peer.incr_pending(7680, armer(&mut signals));
        assert!(peer.is_too_slow(7680).is_none());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(peer.is_too_slow(7680).is_none());
    }
}
