//! Tick driver (component C7) and the commit-to-apply loop (§4.5
//! "Applying"). The tick is the single source of time-driven action; this
//! module also hosts `step`, the message-received entry point, and the
//! `on_*_complete` dispatch for I/O completions, since all three are, per
//! §5, the only places mutation may occur.

use bytes::Bytes;

use crate::config::Role as ConfigRole;
use crate::error::Result;
use crate::io::{Fsm, Io, Token};
use crate::log::EntryKind;
use crate::raft::{Raft, Role};
use crate::rpc::Message;
use crate::types::{LogIndex, Millis};

/// One completed asynchronous `Io` request, handed back to [`Raft::complete`]
/// by the driver. Mirrors the teacher's `IoCompletion { id, op_type, ... }`
/// shape (`io/async_io.rs`), tagged by operation instead of a shared status
/// code since each op's result carries different data.
pub enum Completion {
    Append { token: Token, ok: bool },
    Send { token: Token, ok: bool },
    SnapshotPut { token: Token, ok: bool },
    SnapshotGet { token: Token, data: Option<Bytes> },
}

/// Upper bound on entries applied to the FSM per tick, so a large backlog
/// after a snapshot install or a burst of commits cannot stall the event
/// loop (§4.5: "a bounded batch per tick is allowed").
const MAX_APPLY_PER_TICK: usize = 1024;

impl<I: Io, F: Fsm> Raft<I, F> {
    /// Advance time-driven state (§4.7). Called by the embedder at the fixed
    /// cadence it chose when starting the engine.
    pub fn tick(&mut self, now: Millis) -> Result<()> {
        if self.closing {
            return Ok(());
        }
        self.check_election_timeout(now)?;
        if self.is_leader() {
            self.check_heartbeats(now)?;
            self.check_promotion_rounds(now)?;
            self.check_transfer_deadline(now)?;
        }
        self.check_snapshot_threshold(now)?;
        Ok(())
    }

    /// Route one received message to its handler, after which the handler
    /// itself applies the term rule (§4.6) before doing anything else. The
    /// driver is the one place that knows which connection (and therefore
    /// which peer) a message arrived on, so it passes `from` explicitly
    /// rather than the engine inferring it from message contents.
    pub fn step(&mut self, from: crate::types::ServerId, message: Message, now: Millis) -> Result<()> {
        if self.closing {
            return Ok(());
        }
        match message {
            Message::RequestVote(m) => self.handle_request_vote(from, m, now),
            Message::RequestVoteResult(m) => self.handle_request_vote_result(from, m, now),
            Message::AppendEntries(m) => self.handle_append_entries(from, m, now),
            Message::AppendEntriesResult(m) => self.handle_append_entries_result(from, m, now),
            Message::InstallSnapshot(m) => self.handle_install_snapshot(from, m, now),
            Message::InstallSnapshotResult(m) => self.handle_install_snapshot_result(from, m, now),
            Message::TimeoutNow(m) => self.handle_timeout_now(m, now),
        }
    }

    fn handle_install_snapshot_result(&mut self, from: crate::types::ServerId, msg: crate::rpc::InstallSnapshotResult, now: Millis) -> Result<()> {
        if msg.term > self.current_term {
            return self.observe_term(msg.term, now);
        }
        if !self.is_leader() {
            return Ok(());
        }
        let snapshot_last_index = self.log.snapshot().map(|s| s.last_index);
        if let Role::Leader(leader) = &mut self.role {
            if let Some(p) = leader.progress.get_mut(from) {
                if msg.success {
                    if let Some(last_index) = snapshot_last_index {
                        p.snapshot_index = last_index;
                        p.record_snapshot_complete();
                    }
                } else {
                    p.become_probe();
                }
            }
        }
        Ok(())
    }

    /// Apply committed-but-not-yet-applied entries to the FSM in order,
    /// up to a bounded batch, then fire any client requests that are now
    /// satisfied (§4.5 "Applying", §4.8).
    pub(crate) fn apply_committed(&mut self) -> Result<()> {
        let target = self.commit_index;
        let mut applied = 0;
        while self.last_applied < target && applied < MAX_APPLY_PER_TICK {
            let index = self.last_applied + 1;
            let entry = match self.log.get(index) {
                Some(e) => e.clone(),
                None => break,
            };
            match entry.kind {
                EntryKind::Command => {
                    let result = self.fsm.apply(index, &entry.payload)?;
                    self.record_apply_result(index, result);
                }
                EntryKind::Barrier => {}
                EntryKind::ConfigChange => {
                    self.promote_committed_config(index, &entry.payload)?;
                }
            }
            self.last_applied = index;
            applied += 1;
        }
        self.complete_client_requests();
        Ok(())
    }

    fn record_apply_result(&mut self, index: LogIndex, result: F::Output) {
        if let Role::Leader(leader) = &mut self.role {
            if let Some(req) = leader.apply_queue.iter_mut().find(|r| index >= r.start_index && index <= r.end_index) {
                req.results.push(result);
            }
        }
    }

    fn promote_committed_config(&mut self, index: LogIndex, payload: &[u8]) -> Result<()> {
        let configuration = crate::config::Configuration::decode(payload)?;
        let removes_self = !configuration.contains(self.id) || configuration.get(self.id).map(|s| s.role != ConfigRole::Voter).unwrap_or(true);
        self.committed_config = configuration;
        self.committed_config_index = index;
        if self.is_leader() {
            if let Role::Leader(leader) = &mut self.role {
                leader.progress.clear();
                leader.progress.reset_for_leader(
                    self.committed_config.voters().filter(|s| s.id != self.id).map(|s| s.id),
                    self.log.last_index(),
                );
            }
            if removes_self {
                let now = self.io.time();
                self.become_follower(now, None);
            }
        }
        Ok(())
    }

    /// Deliver one I/O completion. The engine figures out which outstanding
    /// request it belongs to (a plain append, the leader's own snapshot
    /// persist, or a follower's snapshot install all share `snapshot_put`)
    /// by checking its own bookkeeping; an unrecognized token is ignored.
    pub fn complete(&mut self, completion: Completion) -> Result<()> {
        match completion {
            Completion::Append { token, ok } => self.on_append_complete(token, ok),
            Completion::Send { token, ok } => {
                self.on_send_complete(token, ok);
                Ok(())
            }
            Completion::SnapshotPut { token, ok } => {
                self.on_snapshot_put_complete(token, ok);
                self.on_install_complete(token, ok)
            }
            Completion::SnapshotGet { token, data } => self.on_snapshot_get_complete(token, data),
        }
    }
}
