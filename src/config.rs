//! Raft runtime configuration.

use rand::{thread_rng, Rng};

/// Extra noise added on top of the configured leader election timeout so that
/// the members of a group do not start elections in lock-step.
const LEADER_ELECTION_TIMEOUT_NOISE_MILLIS: u64 = 100;

/// The ratio of `commit_count_to_take_snapshot` kept in the log after a snapshot
/// is taken, so that slightly-lagging followers can catch up from log entries
/// instead of receiving a full snapshot.
const KEPT_LOG_ENTRY_RATIO_AFTER_SNAPSHOT: u64 = 10;

/// The runtime configuration for a Raft node.
///
/// For the election timeout & heartbeat period configuration, it is recommended
/// that §5.6 of the Raft paper is considered in order to set appropriate values:
/// `broadcastTime ≪ electionTimeout ≪ MTBF`.
#[derive(Clone, Debug)]
pub struct Config {
    /// The base duration a node waits before starting a new pre-vote round, in
    /// milliseconds. A random 0–100 ms noise is added on each use.
    pub leader_election_timeout_millis: u64,
    /// The period of the heartbeat tick, in milliseconds.
    ///
    /// On the leader, each tick broadcasts append entries requests; on other
    /// nodes, each tick checks whether the leader is still alive.
    pub leader_heartbeat_period_millis: u64,
    /// How long a node keeps trusting the current leader after the last
    /// heartbeat from it, in milliseconds. Must be larger than the heartbeat
    /// period. Also bounds how long a leader keeps its role without hearing
    /// append entries responses from a majority.
    pub leader_heartbeat_timeout_millis: u64,
    /// The ceiling of the per-follower append entries request backoff, in
    /// milliseconds. While the backoff is armed for a follower, no new request
    /// is sent to it.
    pub leader_backoff_duration_millis: u64,
    /// The maximum number of log entries sent in a single append entries
    /// request.
    pub append_entries_request_batch_size: u64,
    /// The maximum number of uncommitted log entries a leader keeps before it
    /// starts refusing new operations with `CannotReplicate`. The same value
    /// bounds how many linearizable queries may be batched into one round.
    pub max_uncommitted_log_entry_count: u64,
    /// The number of commits after which the local state machine is
    /// snapshotted and the log compacted.
    pub commit_count_to_take_snapshot: u64,
    /// The period of the node report published to the runtime, in seconds.
    pub raft_node_report_publish_period_secs: u64,
}

impl Config {
    /// Start the builder process for a new `Config` instance. Call `validate` when done.
    pub fn build() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Generate a new leader election timeout with random noise applied.
    pub fn rand_election_timeout_millis(&self) -> u64 {
        self.leader_election_timeout_millis
            + thread_rng().gen_range(0..=LEADER_ELECTION_TIMEOUT_NOISE_MILLIS)
    }

    /// The number of log entries kept in the log after a snapshot is taken.
    pub(crate) fn kept_log_entry_count_after_snapshot(&self) -> u64 {
        (self.commit_count_to_take_snapshot / KEPT_LOG_ENTRY_RATIO_AFTER_SNAPSHOT).max(1)
    }

    /// The total number of log slots a node keeps in memory.
    pub(crate) fn log_capacity(&self) -> u64 {
        self.commit_count_to_take_snapshot
            + self.max_uncommitted_log_entry_count
            + self.kept_log_entry_count_after_snapshot()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::build().validate().expect("default config must be valid")
    }
}

/// A configuration builder to ensure that the runtime config is valid.
#[derive(Clone, Debug)]
pub struct ConfigBuilder {
    leader_election_timeout_millis: u64,
    leader_heartbeat_period_millis: u64,
    leader_heartbeat_timeout_millis: u64,
    leader_backoff_duration_millis: u64,
    append_entries_request_batch_size: u64,
    max_uncommitted_log_entry_count: u64,
    commit_count_to_take_snapshot: u64,
    raft_node_report_publish_period_secs: u64,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self {
            leader_election_timeout_millis: 1000,
            leader_heartbeat_period_millis: 500,
            leader_heartbeat_timeout_millis: 5000,
            leader_backoff_duration_millis: 100,
            append_entries_request_batch_size: 100,
            max_uncommitted_log_entry_count: 1000,
            commit_count_to_take_snapshot: 10000,
            raft_node_report_publish_period_secs: 10,
        }
    }
}

impl ConfigBuilder {
    /// Set the desired value for `leader_election_timeout_millis`.
    pub fn leader_election_timeout_millis(mut self, val: u64) -> Self {
        self.leader_election_timeout_millis = val;
        self
    }

    /// Set the desired value for `leader_heartbeat_period_millis`.
    pub fn leader_heartbeat_period_millis(mut self, val: u64) -> Self {
        self.leader_heartbeat_period_millis = val;
        self
    }

    /// Set the desired value for `leader_heartbeat_timeout_millis`.
    pub fn leader_heartbeat_timeout_millis(mut self, val: u64) -> Self {
        self.leader_heartbeat_timeout_millis = val;
        self
    }

    /// Set the desired value for `leader_backoff_duration_millis`.
    pub fn leader_backoff_duration_millis(mut self, val: u64) -> Self {
        self.leader_backoff_duration_millis = val;
        self
    }

    /// Set the desired value for `append_entries_request_batch_size`.
    pub fn append_entries_request_batch_size(mut self, val: u64) -> Self {
        self.append_entries_request_batch_size = val;
        self
    }

    /// Set the desired value for `max_uncommitted_log_entry_count`.
    pub fn max_uncommitted_log_entry_count(mut self, val: u64) -> Self {
        self.max_uncommitted_log_entry_count = val;
        self
    }

    /// Set the desired value for `commit_count_to_take_snapshot`.
    pub fn commit_count_to_take_snapshot(mut self, val: u64) -> Self {
        self.commit_count_to_take_snapshot = val;
        self
    }

    /// Set the desired value for `raft_node_report_publish_period_secs`.
    pub fn raft_node_report_publish_period_secs(mut self, val: u64) -> Self {
        self.raft_node_report_publish_period_secs = val;
        self
    }

    /// Validate the state of this builder and produce a new `Config` instance if valid.
    pub fn validate(self) -> Result<Config, ConfigError> {
        if self.leader_election_timeout_millis == 0 {
            return Err(ConfigError::InvalidValue {
                field: "leader_election_timeout_millis",
                reason: "must be greater than zero".into(),
            });
        }
        if self.leader_heartbeat_period_millis == 0 {
            return Err(ConfigError::InvalidValue {
                field: "leader_heartbeat_period_millis",
                reason: "must be greater than zero".into(),
            });
        }
        if self.leader_heartbeat_timeout_millis < self.leader_heartbeat_period_millis {
            return Err(ConfigError::InvalidValue {
                field: "leader_heartbeat_timeout_millis",
                reason: "must not be smaller than the heartbeat period".into(),
            });
        }
        if self.append_entries_request_batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "append_entries_request_batch_size",
                reason: "must be greater than zero".into(),
            });
        }
        if self.max_uncommitted_log_entry_count == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_uncommitted_log_entry_count",
                reason: "must be greater than zero".into(),
            });
        }
        if self.commit_count_to_take_snapshot == 0 {
            return Err(ConfigError::InvalidValue {
                field: "commit_count_to_take_snapshot",
                reason: "must be greater than zero".into(),
            });
        }

        Ok(Config {
            leader_election_timeout_millis: self.leader_election_timeout_millis,
            leader_heartbeat_period_millis: self.leader_heartbeat_period_millis,
            leader_heartbeat_timeout_millis: self.leader_heartbeat_timeout_millis,
            leader_backoff_duration_millis: self.leader_backoff_duration_millis,
            append_entries_request_batch_size: self.append_entries_request_batch_size,
            max_uncommitted_log_entry_count: self.max_uncommitted_log_entry_count,
            commit_count_to_take_snapshot: self.commit_count_to_take_snapshot,
            raft_node_report_publish_period_secs: self.raft_node_report_publish_period_secs,
        })
    }
}

/// A configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A field was set to a value which fails validation.
    #[error("invalid value for `{field}`: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: String,
    },
}
