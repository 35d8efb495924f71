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

use config::{Config, ConfigError};
use serde::{Deserialize, Serialize};

use crate::{blocks::NodeId, error::ConfigurationError};

/// Configuration for block sync. The defaults are the protocol parameters every node on a network is expected to
/// use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BlockSyncConfig {
    /// Start block sync when the reactor starts. When false, block sync only runs after a switch from state sync.
    pub enabled: bool,
    /// How long requesters and the scheduler sleep before retrying when no work can be done
    #[serde(with = "serializers::milliseconds")]
    pub request_interval: Duration,
    /// Maximum number of heights being fetched at once
    pub max_total_requesters: usize,
    /// Maximum number of requests that are waiting for a peer or a response
    pub max_pending_requests: usize,
    pub max_pending_requests_per_peer: usize,
    /// A peer with outstanding requests that sends us less than this many bytes per second is evicted
    pub min_recv_rate: u64,
    /// Unexpected blocks further than this from the pool height are treated as peer misbehaviour
    pub max_diff_between_current_and_received_block_height: u64,
    /// How long a peer with outstanding requests may go without sending us a block
    #[serde(with = "serializers::milliseconds")]
    pub peer_timeout: Duration,
    #[serde(with = "serializers::seconds")]
    pub status_update_interval: Duration,
    #[serde(with = "serializers::milliseconds")]
    pub try_sync_interval: Duration,
    #[serde(with = "serializers::milliseconds")]
    pub switch_to_consensus_interval: Duration,
    /// Log an error if the pool has not advanced for this long
    #[serde(with = "serializers::seconds")]
    pub sync_timeout: Duration,
    /// Capacity of the peer fault channel. Should be larger than the number of peers.
    pub max_peer_err_buffer: usize,
    /// If not empty, only these peers are used for block sync
    pub forced_sync_peers: Vec<NodeId>,
    pub self_remediation: SelfRemediationConfig,
}

impl Default for BlockSyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            request_interval: Duration::from_millis(100),
            max_total_requesters: 50,
            max_pending_requests: 50,
            max_pending_requests_per_peer: 20,
            min_recv_rate: 7680,
            max_diff_between_current_and_received_block_height: 100,
            peer_timeout: Duration::from_secs(2),
            status_update_interval: Duration::from_secs(10),
            try_sync_interval: Duration::from_millis(10),
            switch_to_consensus_interval: Duration::from_secs(1),
            sync_timeout: Duration::from_secs(180),
            max_peer_err_buffer: 1000,
            forced_sync_peers: Vec::new(),
            self_remediation: SelfRemediationConfig::default(),
        }
    }
}

impl BlockSyncConfig {
    pub const CONFIG_KEY: &'static str = "blocksync";

    /// Loads the `blocksync` section, using defaults for any missing keys.
    pub fn load_from(config: &Config) -> Result<Self, ConfigurationError> {
        let config = match config.get::<Self>(Self::CONFIG_KEY) {
            Ok(c) => c,
            Err(ConfigError::NotFound(_)) => Self::default(),
            Err(err) => return Err(err.into()),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_total_requesters == 0 {
            return Err(ConfigurationError::invalid("max_total_requesters", "must be greater than 0"));
        }
        if self.max_pending_requests == 0 {
            return Err(ConfigurationError::invalid("max_pending_requests", "must be greater than 0"));
        }
        if self.max_pending_requests_per_peer == 0 {
            return Err(ConfigurationError::invalid(
                "max_pending_requests_per_peer",
                "must be greater than 0",
            ));
        }
        if self.max_pending_requests_per_peer > self.max_pending_requests {
            return Err(ConfigurationError::invalid(
                "max_pending_requests_per_peer",
                format!(
                    "must not exceed max_pending_requests ({})",
                    self.max_pending_requests
                ),
            ));
        }
        if self.max_peer_err_buffer == 0 {
            return Err(ConfigurationError::invalid("max_peer_err_buffer", "must be greater than 0"));
        }
        let intervals = [
            ("request_interval", self.request_interval),
            ("peer_timeout", self.peer_timeout),
            ("status_update_interval", self.status_update_interval),
            ("try_sync_interval", self.try_sync_interval),
            ("switch_to_consensus_interval", self.switch_to_consensus_interval),
        ];
        if let Some(&(field, _)) = intervals.iter().find(|(_, d)| d.is_zero()) {
            return Err(ConfigurationError::invalid(field, "must be greater than 0"));
        }
        Ok(())
    }
}

/// Restarts a node that keeps falling behind its peers after it has switched to consensus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SelfRemediationConfig {
    /// Number of blocks behind the best peer before a restart is requested. 0 disables the check.
    pub blocks_behind_threshold: u64,
    #[serde(with = "serializers::seconds")]
    pub blocks_behind_check_interval: Duration,
    /// Minimum time between the reactor starting and a restart being requested
    #[serde(with = "serializers::seconds")]
    pub restart_cooldown: Duration,
}

impl SelfRemediationConfig {
    pub fn is_enabled(&self) -> bool {
        self.blocks_behind_threshold > 0 && !self.blocks_behind_check_interval.is_zero()
    }
}

impl Default for SelfRemediationConfig {
    fn default() -> Self {
        Self {
            blocks_behind_threshold: 0,
            blocks_behind_check_interval: Duration::from_secs(60),
            restart_cooldown: Duration::from_secs(600),
        }
    }
}

pub mod serializers {
    pub mod seconds {
        //! (De)serialises a `Duration` as an integer number of seconds.
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
        where D: Deserializer<'de> {
            Ok(Duration::from_secs(u64::deserialize(deserializer)?))
        }

        pub fn serialize<S>(duration: &Duration, s: S) -> Result<S::Ok, S::Error>
        where S: Serializer {
            s.serialize_u64(duration.as_secs())
        }
    }

    pub mod milliseconds {
        //! (De)serialises a `Duration` as an integer number of milliseconds.
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
        where D: Deserializer<'de> {
            Ok(Duration::from_millis(u64::deserialize(deserializer)?))
        }

        pub fn serialize<S>(duration: &Duration, s: S) -> Result<S::Ok, S::Error>
        where S: Serializer {
            let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
            s.serialize_u64(millis)
        }
    }
}
