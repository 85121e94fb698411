use std::convert::TryFrom;
use tokio::time::Duration;

/// Tuning knobs for consensus and the replicated log. Unset fields fall back to defaults.
#[derive(Clone, Debug, Default)]
pub struct RaftOptions {
    pub leader_heartbeat_duration: Option<Duration>,
    pub follower_min_timeout: Option<Duration>,
    pub follower_max_timeout: Option<Duration>,
    pub leader_append_entries_timeout: Option<Duration>,
    /// How long `append` waits for its entry to be committed and applied.
    pub commit_timeout: Option<Duration>,
    /// Applied entries between two snapshots.
    pub snapshot_threshold: Option<u64>,
    pub max_entries_per_append: Option<usize>,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct RaftOptionsValidated {
    pub leader_heartbeat_duration: Duration,
    pub follower_min_timeout: Duration,
    pub follower_max_timeout: Duration,
    pub leader_append_entries_timeout: Duration,
    pub commit_timeout: Duration,
    pub snapshot_threshold: u64,
    pub max_entries_per_append: usize,
}

impl RaftOptionsValidated {
    fn validate(&self) -> Result<(), &'static str> {
        if self.leader_heartbeat_duration >= self.follower_min_timeout {
            return Err("Follower minimum timeout must be greater than leader's heartbeat");
        }
        if self.follower_min_timeout >= self.follower_max_timeout {
            return Err("Follower minimum timeout must be less than maximum timeout");
        }
        if self.leader_append_entries_timeout >= self.follower_min_timeout {
            return Err("Leader's AppendEntries RPC timeout must be less than the follower's heartbeat timeout");
        }
        if self.commit_timeout == Duration::from_millis(0) {
            return Err("Commit timeout must be non-zero");
        }
        if self.snapshot_threshold == 0 {
            return Err("Snapshot threshold must be non-zero");
        }
        if self.max_entries_per_append == 0 {
            return Err("Max entries per AppendEntries must be non-zero");
        }

        Ok(())
    }
}

impl TryFrom<RaftOptions> for RaftOptionsValidated {
    type Error = &'static str;

    fn try_from(options: RaftOptions) -> Result<Self, Self::Error> {
        let values = RaftOptionsValidated {
            leader_heartbeat_duration: options.leader_heartbeat_duration.unwrap_or(Duration::from_millis(100)),
            follower_min_timeout: options.follower_min_timeout.unwrap_or(Duration::from_millis(500)),
            follower_max_timeout: options.follower_max_timeout.unwrap_or(Duration::from_millis(1500)),
            leader_append_entries_timeout: options
                .leader_append_entries_timeout
                .unwrap_or(Duration::from_millis(300)),
            commit_timeout: options.commit_timeout.unwrap_or(Duration::from_secs(10)),
            snapshot_threshold: options.snapshot_threshold.unwrap_or(8192),
            max_entries_per_append: options.max_entries_per_append.unwrap_or(64),
        };

        values.validate()?;
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let validated = RaftOptionsValidated::try_from(RaftOptions::default()).unwrap();
        assert_eq!(validated.leader_heartbeat_duration, Duration::from_millis(100));
        assert_eq!(validated.follower_min_timeout, Duration::from_millis(500));
        assert_eq!(validated.follower_max_timeout, Duration::from_millis(1500));
        assert_eq!(validated.leader_append_entries_timeout, Duration::from_millis(300));
        assert_eq!(validated.commit_timeout, Duration::from_secs(10));
        assert_eq!(validated.snapshot_threshold, 8192);
        assert_eq!(validated.max_entries_per_append, 64);
    }

    #[test]
    fn heartbeat_must_be_below_follower_timeout() {
        let options = RaftOptions {
            leader_heartbeat_duration: Some(Duration::from_millis(600)),
            ..RaftOptions::default()
        };
        assert!(RaftOptionsValidated::try_from(options).is_err());
    }

    #[test]
    fn follower_timeout_range_must_not_be_empty() {
        let options = RaftOptions {
            follower_min_timeout: Some(Duration::from_millis(800)),
            follower_max_timeout: Some(Duration::from_millis(800)),
            ..RaftOptions::default()
        };
        assert!(RaftOptionsValidated::try_from(options).is_err());
    }

    #[test]
    fn zero_snapshot_threshold_is_rejected() {
        let options = RaftOptions {
            snapshot_threshold: Some(0),
            ..RaftOptions::default()
        };
        assert!(RaftOptionsValidated::try_from(options).is_err());
    }
}
