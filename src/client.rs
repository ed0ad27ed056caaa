//! Client request queue (component C8): `apply`/`barrier`/membership-change
//! requests, completed in commit order as entries land (§4.8).
//!
//! Completions are delivered through owned `FnOnce` callbacks rather than a
//! channel or future, matching the single-threaded, non-`Send` executor
//! model of §5: the caller already holds `&mut Raft` when it enqueues a
//! request, so there is no circular-ownership problem to route around the
//! way there is at the `Io` boundary (see `io.rs`).

use bytes::Bytes;

use crate::config::{Configuration, Role as ConfigRole};
use crate::error::{RaftError, Result};
use crate::io::{Fsm, Io};
use crate::log::{Entry, EntryKind};
use crate::raft::{LeaderState, Raft, Role};
use crate::types::{LogIndex, Millis, ServerId, Term};

pub struct ApplyRequest<O> {
    pub start_index: LogIndex,
    pub end_index: LogIndex,
    pub results: Vec<O>,
    pub callback: Box<dyn FnOnce(Result<Vec<O>>)>,
}

pub struct BarrierRequest {
    pub index: LogIndex,
    pub callback: Box<dyn FnOnce(Result<()>)>,
}

pub struct PendingChange {
    pub index: LogIndex,
    pub removes_leader: bool,
    pub callback: Box<dyn FnOnce(Result<()>)>,
}

/// A promotion of a non-voter is not applied directly: the leader first
/// waits, for up to `promotion_max_rounds` heartbeat rounds, for the
/// promotee's `match_index` to reach a moving target before appending the
/// `ConfigChange` entry (§4.8).
pub struct PromotionState {
    pub target: ServerId,
    pub round: u32,
    pub round_start: Millis,
    pub round_target_index: LogIndex,
    pub new_config: Configuration,
    pub callback: Box<dyn FnOnce(Result<()>)>,
}

pub struct TransferState {
    pub target: ServerId,
    pub started: Millis,
    pub callback: Box<dyn FnOnce(Result<()>)>,
}

impl<I: Io, F: Fsm> Raft<I, F> {
    fn leader_state_mut(&mut self) -> Result<&mut LeaderState<F::Output>> {
        match &mut self.role {
            Role::Leader(leader) => Ok(leader),
            _ => Err(RaftError::NotLeader),
        }
    }

    /// Append one `Entry` to the local log and submit it for durable
    /// storage, tracking the write so its completion can advance
    /// `last_stored` and release the log's extra reference (§4.2/§4.5).
    pub(crate) fn append_and_persist(&mut self, term: Term, kind: EntryKind, payload: Bytes) -> Result<LogIndex> {
        if self.closing {
            return Err(RaftError::Shutdown);
        }
        let index = self.log.append(Entry::new(term, kind, payload))?;
        let entry = self.log.acquire(index).expect("entry just appended");
        let token = self.io.append(vec![entry])?;
        self.inflight_appends.insert(
            token,
            crate::raft::AppendInFlight {
                up_to: index,
                entries: vec![(term, index)],
            },
        );
        Ok(index)
    }

    /// Enqueue one or more `Command` entries. Only valid on the leader; the
    /// callback fires once every entry has been applied, carrying the FSM's
    /// results in order (§4.8).
    pub fn apply(&mut self, payloads: Vec<Bytes>, callback: Box<dyn FnOnce(Result<Vec<F::Output>>)>) -> Result<()> {
        if !self.is_leader() {
            callback(Err(RaftError::NotLeader));
            return Ok(());
        }
        if payloads.is_empty() {
            callback(Ok(Vec::new()));
            return Ok(());
        }
        let term = self.current_term;
        let mut start_index = 0;
        let mut end_index = 0;
        for (i, payload) in payloads.into_iter().enumerate() {
            let index = self.append_and_persist(term, EntryKind::Command, payload)?;
            if i == 0 {
                start_index = index;
            }
            end_index = index;
        }
        let leader = self.leader_state_mut()?;
        leader.apply_queue.push(ApplyRequest {
            start_index,
            end_index,
            results: Vec::new(),
            callback,
        });
        Ok(())
    }

    /// Enqueue a `Barrier` entry: the callback fires once it commits and is
    /// applied, guaranteeing every prior `apply` has also been applied.
    pub fn barrier(&mut self, callback: Box<dyn FnOnce(Result<()>)>) -> Result<()> {
        if !self.is_leader() {
            callback(Err(RaftError::NotLeader));
            return Ok(());
        }
        let term = self.current_term;
        let index = self.append_and_persist(term, EntryKind::Barrier, Bytes::new())?;
        let leader = self.leader_state_mut()?;
        leader.barrier_queue.push(BarrierRequest { index, callback });
        Ok(())
    }

    fn enqueue_config_change(
        &mut self,
        new_config: Configuration,
        removes_leader: bool,
        callback: Box<dyn FnOnce(Result<()>)>,
    ) -> Result<()> {
        if !self.is_leader() {
            callback(Err(RaftError::NotLeader));
            return Ok(());
        }
        {
            let leader = self.leader_state_mut()?;
            if leader.pending_change.is_some() || leader.promotion.is_some() {
                callback(Err(RaftError::CantChange));
                return Ok(());
            }
            if leader.transfer.is_some() {
                callback(Err(RaftError::NotLeader));
                return Ok(());
            }
        }
        let term = self.current_term;
        let payload = new_config.encode();
        let index = self.append_and_persist(term, EntryKind::ConfigChange, payload)?;
        let leader = self.leader_state_mut()?;
        leader.pending_change = Some(PendingChange {
            index,
            removes_leader,
            callback,
        });
        Ok(())
    }

    /// Add a new, initially non-voting server to the committed configuration.
    ///
    /// `role` must be `Standby` or `Idle`: a brand-new member can never be
    /// added directly as a `Voter`, since that would let it count toward
    /// quorum before it has replicated anything. Bringing a member to
    /// `Voter` always goes through `promote`'s sync round instead.
    pub fn add(
        &mut self,
        id: u64,
        address: impl Into<String>,
        role: ConfigRole,
        callback: Box<dyn FnOnce(Result<()>)>,
    ) -> Result<()> {
        if role == ConfigRole::Voter {
            callback(Err(RaftError::InvalidParameter(
                "cannot add a new server directly as a voter; add as Standby and promote".into(),
            )));
            return Ok(());
        }
        let mut new_config = self.committed_config.clone();
        if let Err(e) = new_config.add(id, address, role) {
            callback(Err(e));
            return Ok(());
        }
        self.enqueue_config_change(new_config, false, callback)
    }

    /// Remove a server from the configuration. Rejects removing the last
    /// remaining voter.
    pub fn remove(&mut self, id: ServerId, callback: Box<dyn FnOnce(Result<()>)>) -> Result<()> {
        let mut new_config = self.committed_config.clone();
        let removed = match new_config.remove(id) {
            Ok(server) => server,
            Err(e) => {
                callback(Err(e));
                return Ok(());
            }
        };
        if removed.role == ConfigRole::Voter && new_config.voter_count() == 0 {
            callback(Err(RaftError::InvalidParameter("cannot remove the only voter".into())));
            return Ok(());
        }
        let removes_leader = id == self.id;
        self.enqueue_config_change(new_config, removes_leader, callback)
    }

    /// Demote a voter to `Standby` without a sync round: a voter being
    /// demoted is by definition already caught up.
    pub fn demote(&mut self, id: ServerId, callback: Box<dyn FnOnce(Result<()>)>) -> Result<()> {
        let mut new_config = self.committed_config.clone();
        let server = match new_config.get_mut(id) {
            Some(s) => s,
            None => {
                callback(Err(RaftError::NotFound(format!("server {id}"))));
                return Ok(());
            }
        };
        server.role = ConfigRole::Standby;
        self.enqueue_config_change(new_config, false, callback)
    }

    /// Promote a non-voter to `Voter`, first running a bounded sync round
    /// (§4.8, §9) to make sure it is caught up before it can count toward
    /// quorum.
    pub fn promote(&mut self, id: ServerId, callback: Box<dyn FnOnce(Result<()>)>) -> Result<()> {
        if !self.is_leader() {
            callback(Err(RaftError::NotLeader));
            return Ok(());
        }
        let mut new_config = self.committed_config.clone();
        let server = match new_config.get_mut(id) {
            Some(s) => s,
            None => {
                callback(Err(RaftError::NotFound(format!("server {id}"))));
                return Ok(());
            }
        };
        server.role = ConfigRole::Voter;
        let target_index = self.log.last_index();
        let now = self.io.time();
        let leader = self.leader_state_mut()?;
        if leader.pending_change.is_some() || leader.promotion.is_some() {
            callback(Err(RaftError::CantChange));
            return Ok(());
        }
        leader.progress.ensure(id, target_index);
        leader.promotion = Some(PromotionState {
            target: id,
            round: 0,
            round_start: now,
            round_target_index: target_index,
            new_config,
            callback,
        });
        Ok(())
    }

    /// Begin transferring leadership to `target` (§4.4). Rejects new client
    /// requests until the transfer resolves.
    pub fn transfer_leadership(&mut self, target: ServerId, callback: Box<dyn FnOnce(Result<()>)>) -> Result<()> {
        if !self.committed_config.get(target).map(|s| s.role == ConfigRole::Voter).unwrap_or(false) {
            callback(Err(RaftError::InvalidParameter("transfer target is not a voter".into())));
            return Ok(());
        }
        let last_index = self.log.last_index();
        let now = self.io.time();
        let leader = self.leader_state_mut()?;
        let caught_up = leader.progress.get(target).map(|p| p.match_index == last_index).unwrap_or(false);
        if !caught_up {
            callback(Err(RaftError::Busy("transfer target is not caught up".into())));
            return Ok(());
        }
        if leader.transfer.is_some() {
            callback(Err(RaftError::CantChange));
            return Ok(());
        }
        leader.transfer = Some(TransferState {
            target,
            started: now,
            callback,
        });
        self.send_timeout_now(target)
    }

    /// Drive commit-order completion of apply/barrier/config-change/promotion
    /// requests after `commit_index` (and `last_applied`) advances (§4.5).
    pub(crate) fn complete_client_requests(&mut self) {
        let commit_index = self.commit_index;
        self.fire_ready_apply_requests();
        self.fire_ready_barrier_requests();
        if let Role::Leader(leader) = &mut self.role {
            if let Some(change) = &leader.pending_change {
                if change.index <= commit_index {
                    let change = leader.pending_change.take().unwrap();
                    (change.callback)(Ok(()));
                }
            }
        }
    }

    fn fire_ready_apply_requests(&mut self) {
        let last_applied = self.last_applied;
        loop {
            let ready = match &mut self.role {
                Role::Leader(leader) => {
                    let pos = leader.apply_queue.iter().position(|r| r.end_index <= last_applied);
                    pos.map(|pos| leader.apply_queue.remove(pos))
                }
                _ => None,
            };
            match ready {
                Some(req) => (req.callback)(Ok(req.results)),
                None => break,
            }
        }
    }

    fn fire_ready_barrier_requests(&mut self) {
        let last_applied = self.last_applied;
        loop {
            let ready = match &mut self.role {
                Role::Leader(leader) => {
                    let pos = leader.barrier_queue.iter().position(|r| r.index <= last_applied);
                    pos.map(|pos| leader.barrier_queue.remove(pos))
                }
                _ => None,
            };
            match ready {
                Some(req) => (req.callback)(Ok(())),
                None => break,
            }
        }
    }

    /// Re-check a pending promotion sync round each tick: finalize it once
    /// the promotee's `match_index` reaches the round's target, bump the
    /// round (moving the target forward) once `election_timeout` has
    /// elapsed without that happening, or fail with `Busy` once
    /// `promotion_max_rounds` is exhausted (§4.8, §9).
    pub(crate) fn check_promotion_rounds(&mut self, now: Millis) -> Result<()> {
        let snapshot = match &self.role {
            Role::Leader(leader) => match &leader.promotion {
                Some(p) => Some((p.target, p.round, p.round_start, p.round_target_index)),
                None => None,
            },
            _ => None,
        };
        let (target, round, round_start, round_target_index) = match snapshot {
            Some(s) => s,
            None => return Ok(()),
        };

        let match_index = match &self.role {
            Role::Leader(leader) => leader.progress.get(target).map(|p| p.match_index).unwrap_or(0),
            _ => 0,
        };
        if match_index >= round_target_index {
            return self.finalize_promotion();
        }

        if now.saturating_sub(round_start) < self.options.election_timeout {
            return Ok(());
        }
        if round + 1 >= self.options.promotion_max_rounds {
            if let Role::Leader(leader) = &mut self.role {
                if let Some(p) = leader.promotion.take() {
                    (p.callback)(Err(RaftError::Busy("promotion sync rounds exhausted".into())));
                }
            }
            return Ok(());
        }
        let last_index = self.log.last_index();
        if let Role::Leader(leader) = &mut self.role {
            if let Some(p) = &mut leader.promotion {
                p.round += 1;
                p.round_start = now;
                p.round_target_index = last_index;
            }
        }
        Ok(())
    }

    /// Check immediately after an AppendEntries ack, so a promotion does not
    /// have to wait for the next tick to notice the promotee caught up.
    pub(crate) fn advance_promotion_round(&mut self, from: ServerId, _now: Millis) -> Result<()> {
        let should_finalize = match &self.role {
            Role::Leader(leader) => match &leader.promotion {
                Some(p) if p.target == from => leader
                    .progress
                    .get(from)
                    .map(|pr| pr.match_index >= p.round_target_index)
                    .unwrap_or(false),
                _ => false,
            },
            _ => false,
        };
        if should_finalize {
            self.finalize_promotion()?;
        }
        Ok(())
    }

    fn finalize_promotion(&mut self) -> Result<()> {
        let (new_config, callback) = match &mut self.role {
            Role::Leader(leader) => match leader.promotion.take() {
                Some(p) => (p.new_config, p.callback),
                None => return Ok(()),
            },
            _ => return Ok(()),
        };
        {
            let leader = self.leader_state_mut()?;
            if leader.pending_change.is_some() {
                callback(Err(RaftError::CantChange));
                return Ok(());
            }
        }
        let term = self.current_term;
        let payload = new_config.encode();
        let index = self.append_and_persist(term, EntryKind::ConfigChange, payload)?;
        let leader = self.leader_state_mut()?;
        leader.pending_change = Some(PendingChange {
            index,
            removes_leader: false,
            callback,
        });
        Ok(())
    }

    /// Fail a pending leadership transfer once `election_timeout` has
    /// elapsed without the leader observing the transferee's higher term
    /// (§4.4).
    pub(crate) fn check_transfer_deadline(&mut self, now: Millis) -> Result<()> {
        let timed_out = match &self.role {
            Role::Leader(leader) => leader
                .transfer
                .as_ref()
                .map(|t| now.saturating_sub(t.started) >= self.options.election_timeout)
                .unwrap_or(false),
            _ => false,
        };
        if !timed_out {
            return Ok(());
        }
        if let Role::Leader(leader) = &mut self.role {
            if let Some(transfer) = leader.transfer.take() {
                (transfer.callback)(Err(RaftError::Busy("leadership transfer timed out".into())));
            }
        }
        Ok(())
    }
}
