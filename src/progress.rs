//! Per-peer replication progress (component C3): how far each follower is
//! known to have replicated, and whether the leader is probing, streaming,
//! or shipping a snapshot to it.
//!
//! The probe/pipeline/snapshot state machine and its transitions are the
//! same shape as the `Progress`/`ProgressState` design used by mainstream
//! Raft implementations (probe/replicate/snapshot): a newly elected leader
//! starts every peer in `Probe`, promotes to `Pipeline` on the first
//! successful ack, and falls back to `Probe` on rejection or unreachability.

use std::collections::HashMap;

use crate::types::{LogIndex, Millis, ServerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationState {
    /// At most one AppendEntries in flight per heartbeat; used to probe for
    /// the point where the follower's log matches ours.
    Probe,
    /// Entries are streamed eagerly, `next_index` advances optimistically.
    Pipeline,
    /// An InstallSnapshot is in flight; no AppendEntries are sent.
    Snapshot,
}

#[derive(Debug, Clone)]
pub struct Progress {
    pub state: ReplicationState,
    pub next_index: LogIndex,
    pub match_index: LogIndex,
    /// Index of the snapshot currently (or most recently) being installed.
    pub snapshot_index: LogIndex,
    pub last_send: Millis,
    pub recent_recv: bool,
}

impl Progress {
    fn new(next_index: LogIndex) -> Self {
        Self {
            state: ReplicationState::Probe,
            next_index,
            match_index: 0,
            snapshot_index: 0,
            last_send: 0,
            recent_recv: false,
        }
    }

    pub fn become_probe(&mut self) {
        self.state = ReplicationState::Probe;
    }

    pub fn become_pipeline(&mut self) {
        self.state = ReplicationState::Pipeline;
    }

    pub fn become_snapshot(&mut self, snapshot_index: LogIndex) {
        self.state = ReplicationState::Snapshot;
        self.snapshot_index = snapshot_index;
    }

    /// Apply a successful AppendEntries ack: advance match/next and, if the
    /// peer was still being probed, promote it to pipelining.
    pub fn record_success(&mut self, match_index: LogIndex) {
        if match_index > self.match_index {
            self.match_index = match_index;
        }
        self.next_index = self.match_index + 1;
        if self.state == ReplicationState::Probe {
            self.become_pipeline();
        }
        self.recent_recv = true;
    }

    /// Apply a rejected AppendEntries: fall back to `Probe` and move
    /// `next_index` per the leader's rejection hint, never below 1.
    pub fn record_rejection(&mut self, follower_last_log_index: LogIndex) {
        self.become_probe();
        let hint = follower_last_log_index + 1;
        self.next_index = self.next_index.min(hint).max(1);
        self.recent_recv = true;
    }

    pub fn record_snapshot_complete(&mut self) {
        self.become_probe();
        self.next_index = self.snapshot_index + 1;
        self.match_index = self.match_index.max(self.snapshot_index);
        self.recent_recv = true;
    }
}

/// One [`Progress`] per configuration member, keyed by server id.
#[derive(Debug, Default)]
pub struct ProgressTable {
    peers: HashMap<ServerId, Progress>,
}

impl ProgressTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset every peer's progress, as happens on becoming leader.
    pub fn reset_for_leader<'a>(&mut self, peers: impl Iterator<Item = ServerId>, leader_last_index: LogIndex) {
        self.peers.clear();
        for id in peers {
            self.peers.insert(id, Progress::new(leader_last_index + 1));
        }
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }

    pub fn get(&self, id: ServerId) -> Option<&Progress> {
        self.peers.get(&id)
    }

    pub fn get_mut(&mut self, id: ServerId) -> Option<&mut Progress> {
        self.peers.get_mut(&id)
    }

    pub fn ensure(&mut self, id: ServerId, leader_last_index: LogIndex) -> &mut Progress {
        self.peers.entry(id).or_insert_with(|| Progress::new(leader_last_index + 1))
    }

    pub fn remove(&mut self, id: ServerId) {
        self.peers.remove(&id);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ServerId, &Progress)> {
        self.peers.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&ServerId, &mut Progress)> {
        self.peers.iter_mut()
    }

    pub fn match_indices(&self) -> HashMap<ServerId, LogIndex> {
        self.peers.iter().map(|(id, p)| (*id, p.match_index)).collect()
    }
}
