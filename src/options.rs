//! Tunable configuration (component C12), grounded in the teacher's
//! `clustering::raft::RaftConfig` / `networking::membership::RaftConfig`
//! pattern: a plain struct with a `Default` impl giving the published
//! defaults, validated at construction.

use crate::error::{RaftError, Result};
use crate::types::Millis;

/// Tunables recognized by the engine (§6).
#[derive(Debug, Clone)]
pub struct Options {
    pub election_timeout: Millis,
    pub heartbeat_timeout: Millis,
    pub snapshot_threshold: u64,
    pub snapshot_trailing: u64,
    pub max_append_entries: usize,
    pub promotion_max_rounds: u32,
    pub pre_vote: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            election_timeout: 1000,
            heartbeat_timeout: 100,
            snapshot_threshold: 1024,
            snapshot_trailing: 128,
            max_append_entries: 512,
            promotion_max_rounds: 10,
            pre_vote: true,
        }
    }
}

impl Options {
    pub fn validate(&self) -> Result<()> {
        if self.election_timeout == 0 {
            return Err(RaftError::InvalidParameter("election_timeout must be non-zero".into()));
        }
        if self.heartbeat_timeout == 0 || self.heartbeat_timeout >= self.election_timeout {
            return Err(RaftError::InvalidParameter(
                "heartbeat_timeout must be non-zero and smaller than election_timeout".into(),
            ));
        }
        if self.max_append_entries == 0 {
            return Err(RaftError::InvalidParameter("max_append_entries must be non-zero".into()));
        }
        if self.promotion_max_rounds == 0 {
            return Err(RaftError::InvalidParameter("promotion_max_rounds must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Options::default().validate().unwrap();
    }

    #[test]
    fn heartbeat_must_be_shorter_than_election_timeout() {
        let mut options = Options::default();
        options.heartbeat_timeout = options.election_timeout;
        assert!(options.validate().is_err());
    }
}
