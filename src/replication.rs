//! Replication module (component C5): entry send selection, AppendEntries
//! production and handling, commit advancement.
//!
//! Grounded in the teacher's `ReplicationManager` (`networking/membership/
//! raft/replication.rs`) for the `replicate_logs`/`handle_append_entries`
//! split and its `tracing::trace!`/`tracing::debug!` call sites, generalized
//! from "just log the heartbeat" placeholders into real per-peer sends that
//! consult the progress table (component C3).

use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::io::{Fsm, Io};
use crate::progress::ReplicationState;
use crate::raft::Raft;
use crate::rpc::{AppendEntries, AppendEntriesResult, Envelope, Message};
use crate::types::{LogIndex, Millis, ServerId, Term};

impl<I: Io, F: Fsm> Raft<I, F> {
    /// Send an AppendEntries (or, if the peer has fallen behind the log's
    /// retained window, hand off to the snapshot coordinator) to one peer,
    /// unconditionally — used right after becoming leader and by the tick's
    /// heartbeat-deadline check.
    pub(crate) fn replicate_to(&mut self, peer: ServerId, now: Millis) -> Result<()> {
        let (state, next_index) = {
            let leader = match self.leader_state() {
                Some(l) => l,
                None => return Ok(()),
            };
            match leader.progress.get(peer) {
                Some(p) => (p.state, p.next_index),
                None => return Ok(()),
            }
        };

        if state == ReplicationState::Snapshot {
            return Ok(());
        }

        let prev_log_index = next_index.saturating_sub(1);
        let snapshot_boundary = self.log.snapshot().map(|s| s.last_index).unwrap_or(0);
        let prev_log_term = if prev_log_index == 0 {
            0
        } else if prev_log_index == snapshot_boundary {
            self.log.snapshot().map(|s| s.last_term).unwrap_or(0)
        } else {
            match self.log.term_of(prev_log_index) {
                Some(term) => term,
                None => {
                    // Compacted away: this peer needs a snapshot instead.
                    self.begin_snapshot_send(peer, now)?;
                    return Ok(());
                }
            }
        };

        let max_entries = if state == ReplicationState::Pipeline {
            self.options.max_append_entries
        } else {
            1
        };
        let last_index = self.log.last_index();
        let to = (next_index + max_entries as LogIndex - 1).min(last_index);
        let entries = self.log.range(next_index, to);

        let mut acquired = Vec::with_capacity(entries.len());
        for entry in &entries {
            let index = next_index + acquired.len() as LogIndex;
            self.log.acquire(index);
            acquired.push((entry.term, index));
        }

        let message = Message::AppendEntries(AppendEntries {
            term: self.current_term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.commit_index,
        });
        let token = self.io.send(Envelope { to: peer, message })?;
        if !acquired.is_empty() {
            self.inflight_sends.insert(token, acquired);
        }

        if let Some(leader) = self.leader_state_mut_opt() {
            if let Some(p) = leader.progress.get_mut(peer) {
                p.last_send = now;
            }
        }
        trace!(id = self.id.get(), peer = peer.get(), next_index, "sent AppendEntries");
        Ok(())
    }

    pub(crate) fn send_heartbeats_now(&mut self, now: Millis) -> Result<()> {
        let peers: Vec<ServerId> = match self.leader_state() {
            Some(leader) => leader.progress.iter().map(|(id, _)| *id).collect(),
            None => return Ok(()),
        };
        for peer in peers {
            self.replicate_to(peer, now)?;
        }
        Ok(())
    }

    /// Send a heartbeat/replication batch to every peer whose
    /// `last_send + heartbeat_timeout` has elapsed (§4.5, driven by §4.7).
    pub(crate) fn check_heartbeats(&mut self, now: Millis) -> Result<()> {
        let heartbeat_timeout = self.options.heartbeat_timeout;
        let due: Vec<ServerId> = match self.leader_state() {
            Some(leader) => leader
                .progress
                .iter()
                .filter(|(_, p)| p.last_send + heartbeat_timeout <= now)
                .map(|(id, _)| *id)
                .collect(),
            None => return Ok(()),
        };
        for peer in due {
            self.replicate_to(peer, now)?;
        }
        Ok(())
    }

    pub(crate) fn on_send_complete(&mut self, token: crate::io::Token, ok: bool) {
        if let Some(entries) = self.inflight_sends.remove(&token) {
            for (term, index) in entries {
                self.log.release(term, index);
            }
            if !ok {
                debug!(id = self.id.get(), "AppendEntries send failed, will retry via heartbeat");
            }
        }
    }

    /// Handle an incoming AppendEntries as a follower (§4.5).
    pub(crate) fn handle_append_entries(&mut self, from: ServerId, msg: AppendEntries, now: Millis) -> Result<()> {
        self.observe_term(msg.term, now)?;

        if msg.term < self.current_term {
            let reject = Message::AppendEntriesResult(AppendEntriesResult {
                term: self.current_term,
                success: false,
                last_log_index: self.log.last_index(),
                conflict_term: None,
                conflict_index: None,
            });
            let _ = self.io.send(Envelope { to: from, message: reject })?;
            return Ok(());
        }

        self.become_follower(now, Some(from));

        let prev_ok = if msg.prev_log_index == 0 {
            true
        } else {
            self.log.term_of(msg.prev_log_index) == Some(msg.prev_log_term)
        };

        if !prev_ok {
            let (conflict_term, conflict_index) = self.backtrack_hint(msg.prev_log_index);
            debug!(id = self.id.get(), leader = from.get(), prev_log_index = msg.prev_log_index, "rejecting AppendEntries, log mismatch");
            let reject = Message::AppendEntriesResult(AppendEntriesResult {
                term: self.current_term,
                success: false,
                last_log_index: self.log.last_index(),
                conflict_term,
                conflict_index,
            });
            let _ = self.io.send(Envelope { to: from, message: reject })?;
            return Ok(());
        }

        let mut index = msg.prev_log_index;
        let mut new_entries: Vec<(Term, LogIndex)> = Vec::new();
        for entry in msg.entries {
            index += 1;
            match self.log.term_of(index) {
                Some(existing_term) if existing_term == entry.term => {}
                Some(_) => {
                    self.log.truncate_from(index)?;
                    let appended = self.log.append(entry)?;
                    new_entries.push((self.log.term_of(appended).unwrap(), appended));
                }
                None => {
                    let appended = self.log.append(entry)?;
                    new_entries.push((self.log.term_of(appended).unwrap(), appended));
                }
            }
        }
        let last_new_index = index;

        if msg.leader_commit > self.commit_index {
            self.commit_index = msg.leader_commit.min(last_new_index).min(self.last_stored.max(self.commit_index));
        }

        self.persist_range(new_entries)?;
        self.apply_committed()?;

        let result = Message::AppendEntriesResult(AppendEntriesResult {
            term: self.current_term,
            success: true,
            last_log_index: last_new_index,
            conflict_term: None,
            conflict_index: None,
        });
        let _ = self.io.send(Envelope { to: from, message: result })?;
        Ok(())
    }

    /// Fast-backtracking hint (§10 supplement): the term at `prev_log_index`
    /// and the first index of that term, so the leader can skip past an
    /// entire mismatched term in one round trip.
    fn backtrack_hint(&self, prev_log_index: LogIndex) -> (Option<Term>, Option<LogIndex>) {
        match self.log.term_of(prev_log_index) {
            Some(term) => {
                let mut first = prev_log_index;
                while first > self.log.first_index() && self.log.term_of(first - 1) == Some(term) {
                    first -= 1;
                }
                (Some(term), Some(first))
            }
            None => (None, Some(self.log.last_index() + 1)),
        }
    }

    pub(crate) fn persist_range(&mut self, entries: Vec<(Term, LogIndex)>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let up_to = entries.iter().map(|(_, i)| *i).max().unwrap();
        let mut acquired = Vec::with_capacity(entries.len());
        for (_, index) in &entries {
            if let Some(entry) = self.log.acquire(*index) {
                acquired.push(entry);
            }
        }
        let token = self.io.append(acquired)?;
        self.inflight_appends.insert(token, crate::raft::AppendInFlight { up_to, entries });
        Ok(())
    }

    pub(crate) fn on_append_complete(&mut self, token: crate::io::Token, ok: bool) -> Result<()> {
        if let Some(inflight) = self.inflight_appends.remove(&token) {
            for (term, index) in &inflight.entries {
                self.log.release(*term, *index);
            }
            if ok {
                if inflight.up_to > self.last_stored {
                    self.last_stored = inflight.up_to;
                }
                self.apply_committed()?;
            } else {
                warn!(id = self.id.get(), "log append failed, stepping down");
                self.set_errmsg("durable append failed");
                if self.is_leader() {
                    let now = self.io.time();
                    self.become_follower(now, None);
                }
            }
        }
        Ok(())
    }

    pub(crate) fn handle_append_entries_result(&mut self, from: ServerId, msg: AppendEntriesResult, now: Millis) -> Result<()> {
        if msg.term > self.current_term {
            return self.observe_term(msg.term, now);
        }
        if msg.term < self.current_term || !self.is_leader() {
            return Ok(());
        }

        let hint = match (msg.conflict_term, msg.conflict_index) {
            (Some(conflict_term), Some(conflict_index)) => match self.log.term_of(conflict_index.saturating_sub(1)) {
                Some(term) if term == conflict_term => conflict_index,
                _ => self.backtrack_to_term_start(conflict_term).unwrap_or(conflict_index),
            },
            _ => msg.last_log_index,
        };

        if let Some(leader) = self.leader_state_mut_opt() {
            if let Some(p) = leader.progress.get_mut(from) {
                if msg.success {
                    p.record_success(msg.last_log_index);
                } else {
                    p.record_rejection(hint.saturating_sub(1));
                }
            }
        }

        self.advance_commit()?;
        self.advance_promotion_round(from, now)?;
        Ok(())
    }

    fn backtrack_to_term_start(&self, term: Term) -> Option<LogIndex> {
        let mut index = self.log.last_index();
        while index >= self.log.first_index() {
            match self.log.term_of(index) {
                Some(t) if t == term => {
                    let mut first = index;
                    while first > self.log.first_index() && self.log.term_of(first - 1) == Some(term) {
                        first -= 1;
                    }
                    return Some(first);
                }
                Some(t) if t < term => return None,
                _ => {}
            }
            if index == 0 {
                break;
            }
            index -= 1;
        }
        None
    }

    /// Recompute `commit_index` as the highest index a majority of voters
    /// (including self) have durably matched in the current term (§4.1,
    /// §4.5 "commit-only-own-term").
    pub(crate) fn advance_commit(&mut self) -> Result<()> {
        let current_term = self.current_term;
        let last_index = self.log.last_index();
        let mut match_indices = match self.leader_state() {
            Some(leader) => leader.progress.match_indices(),
            None => return Ok(()),
        };
        match_indices.insert(self.id, last_index);

        let mut n = self.commit_index;
        let mut candidate = last_index;
        while candidate > self.commit_index {
            if self.log.term_of(candidate) == Some(current_term) && self.committed_config.has_quorum_at(candidate, &match_indices) {
                n = candidate;
                break;
            }
            candidate -= 1;
        }
        if n > self.commit_index {
            self.commit_index = n;
            self.apply_committed()?;
        }
        Ok(())
    }

    fn leader_state(&self) -> Option<&crate::raft::LeaderState<F::Output>> {
        match &self.role {
            crate::raft::Role::Leader(leader) => Some(leader),
            _ => None,
        }
    }

    fn leader_state_mut_opt(&mut self) -> Option<&mut crate::raft::LeaderState<F::Output>> {
        match &mut self.role {
            crate::raft::Role::Leader(leader) => Some(leader),
            _ => None,
        }
    }
}
