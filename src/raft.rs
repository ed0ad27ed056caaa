//! The top-level engine type and its role state machine.
//!
//! Grounded in the teacher's `RaftNode`/`RaftMembership` (`clustering/raft.rs`,
//! `networking/membership/raft/mod.rs`): one struct owning persistent state,
//! volatile state, and a role-specific substate, with per-role operations
//! split into sibling modules (`election`, `replication`, `snapshot`,
//! `client`, `tick`) as `impl<I: Io, F: Fsm> Raft<I, F>` blocks. Unlike the
//! teacher, there is no `Arc<RwLock<..>>` anywhere: per §5 the engine is
//! single-threaded and re-entrancy is forbidden by construction, so every
//! field is owned directly and mutated through `&mut self`.

use std::collections::HashMap;

use tracing::info;

use crate::client::{ApplyRequest, BarrierRequest, PendingChange, PromotionState, TransferState};
use crate::config::Configuration;
use crate::error::{RaftError, Result};
use crate::io::{Io, Token};
use crate::log::Log;
use crate::options::Options;
use crate::progress::ProgressTable;
use crate::types::{LogIndex, Millis, ServerId, Term};

/// Which of the three Raft roles this server currently occupies, together
/// with that role's substate (§3 "Leader/Candidate/Follower substate").
pub enum Role<O> {
    Follower(FollowerState),
    Candidate(CandidateState),
    Leader(LeaderState<O>),
}

impl<O> Role<O> {
    pub fn name(&self) -> &'static str {
        match self {
            Role::Follower(_) => "follower",
            Role::Candidate(_) => "candidate",
            Role::Leader(_) => "leader",
        }
    }

    pub fn is_leader(&self) -> bool {
        matches!(self, Role::Leader(_))
    }
}

pub struct FollowerState {
    pub leader_id: Option<ServerId>,
    pub election_deadline: Millis,
}

/// A candidate first runs a non-disruptive pre-vote round (if
/// `Options::pre_vote` is set) before incrementing its own term; only a
/// pre-vote win triggers the real election.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidatePhase {
    PreVote,
    Election,
}

pub struct CandidateState {
    pub phase: CandidatePhase,
    pub votes: HashMap<ServerId, bool>,
    pub election_deadline: Millis,
    /// Set when this candidacy was triggered by a received `TimeoutNow`
    /// (§4.4 leadership transfer): such a candidate ignores
    /// `disrupt_leader` refusals on the receiving end, but here it only
    /// needs to remember to set `disrupt_leader = true` on its own requests.
    pub disrupt_leader: bool,
}

pub struct LeaderState<O> {
    pub progress: ProgressTable,
    pub apply_queue: Vec<ApplyRequest<O>>,
    pub barrier_queue: Vec<BarrierRequest>,
    pub pending_change: Option<PendingChange>,
    pub promotion: Option<PromotionState>,
    pub transfer: Option<TransferState>,
    pub last_heartbeat_check: Millis,
}

impl<O> LeaderState<O> {
    pub fn new(progress: ProgressTable) -> Self {
        Self {
            progress,
            apply_queue: Vec::new(),
            barrier_queue: Vec::new(),
            pending_change: None,
            promotion: None,
            transfer: None,
            last_heartbeat_check: 0,
        }
    }
}

/// Tracks an append submitted to [`Io::append`] so the completion handler can
/// release the log's extra reference on each entry and advance `last_stored`.
pub struct AppendInFlight {
    pub up_to: LogIndex,
    pub entries: Vec<(Term, LogIndex)>,
}

/// The consensus engine. Generic over the durable/transport capability and
/// the user state machine it drives.
pub struct Raft<I: Io, F: Fsm> {
    pub(crate) id: ServerId,
    pub(crate) address: String,
    pub(crate) options: Options,
    pub(crate) io: I,
    pub(crate) fsm: F,

    pub(crate) current_term: Term,
    pub(crate) voted_for: Option<ServerId>,
    pub(crate) log: Log,

    pub(crate) commit_index: LogIndex,
    pub(crate) last_applied: LogIndex,
    pub(crate) last_stored: LogIndex,

    pub(crate) committed_config: Configuration,
    pub(crate) committed_config_index: LogIndex,

    pub(crate) role: Role<F::Output>,
    pub(crate) closing: bool,
    pub(crate) close_callback: Option<Box<dyn FnOnce()>>,
    pub(crate) errmsg: Option<String>,

    pub(crate) inflight_appends: HashMap<Token, AppendInFlight>,
    pub(crate) inflight_sends: HashMap<Token, Vec<(Term, LogIndex)>>,
    pub(crate) inflight_snapshot_put: Option<Token>,
    pub(crate) pending_snapshot_meta: Option<crate::log::SnapshotMeta>,
    pub(crate) pending_snapshot_data: Option<bytes::Bytes>,
    pub(crate) inflight_snapshot_get: Option<(Token, ServerId)>,
    pub(crate) inflight_install: Option<Token>,
}

pub use crate::io::Fsm;

impl<I: Io, F: Fsm> Raft<I, F> {
    /// Construct an inert engine. No I/O happens until [`Raft::start`].
    pub fn new(id: ServerId, address: impl Into<String>, options: Options, io: I, fsm: F) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            id,
            address: address.into(),
            options,
            io,
            fsm,
            current_term: 0,
            voted_for: None,
            log: Log::new(),
            commit_index: 0,
            last_applied: 0,
            last_stored: 0,
            committed_config: Configuration::init(),
            committed_config_index: 0,
            role: Role::Follower(FollowerState {
                leader_id: None,
                election_deadline: 0,
            }),
            closing: false,
            close_callback: None,
            errmsg: None,
            inflight_appends: HashMap::new(),
            inflight_sends: HashMap::new(),
            inflight_snapshot_put: None,
            pending_snapshot_meta: None,
            pending_snapshot_data: None,
            inflight_snapshot_get: None,
            inflight_install: None,
        })
    }

    pub fn id(&self) -> ServerId {
        self.id
    }

    pub fn current_term(&self) -> Term {
        self.current_term
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    /// Read-only access to the state machine, e.g. to serve a linearizable
    /// read after a `barrier` confirms everything prior has applied.
    pub fn fsm(&self) -> &F {
        &self.fsm
    }

    pub fn is_leader(&self) -> bool {
        self.role.is_leader()
    }

    pub fn leader_id(&self) -> Option<ServerId> {
        match &self.role {
            Role::Follower(f) => f.leader_id,
            Role::Candidate(_) => None,
            Role::Leader(_) => Some(self.id),
        }
    }

    pub fn errmsg(&self) -> Option<&str> {
        self.errmsg.as_deref()
    }

    pub(crate) fn set_errmsg(&mut self, msg: impl Into<String>) {
        self.errmsg = Some(msg.into());
    }

    /// Bring up persistent state and timers; becomes Follower, or Leader
    /// outright if this server is the cluster's sole voter (§3 Lifecycle).
    pub fn start(&mut self) -> Result<()> {
        self.io.init()?;
        let loaded = self.io.load()?;
        self.current_term = loaded.current_term;
        self.voted_for = loaded.voted_for;
        self.log = Log::restore(loaded.start_index, loaded.entries, loaded.snapshot.clone());
        // Everything `load` handed back already landed durably.
        self.last_stored = self.log.last_index();
        if let Some(snapshot) = loaded.snapshot {
            self.committed_config = snapshot.configuration.clone();
            self.committed_config_index = snapshot.configuration_index;
            self.last_applied = snapshot.last_index;
            self.commit_index = snapshot.last_index;
            self.fsm.restore(loaded.snapshot_data.as_deref().unwrap_or(&[]))?;
        } else if let Some(entry) = self.log.get(self.log.first_index()) {
            // Every server in a cluster is seeded with the same bootstrap
            // `ConfigChange` at index 1 (§4.1); it is active from the start,
            // not subject to the normal commit-then-apply path.
            if entry.kind == crate::log::EntryKind::ConfigChange {
                let index = self.log.first_index();
                self.committed_config = crate::config::Configuration::decode(&entry.payload)?;
                self.committed_config_index = index;
                self.commit_index = self.commit_index.max(index);
                self.last_applied = self.last_applied.max(index);
            }
        }
        let now = self.io.time();
        self.reset_election_timer(now);

        info!(id = self.id.get(), term = self.current_term, "engine started");

        if self.committed_config.voter_count() == 1 && self.committed_config.contains(self.id) {
            self.become_candidate(now, false);
            self.campaign(now)?;
        }
        Ok(())
    }

    /// Quiesce per §5 Cancellation: refuse new requests, fail whatever is
    /// already queued, and fire `cb` once `Io::close` completes.
    pub fn close(&mut self, cb: Box<dyn FnOnce()>) -> Result<()> {
        self.closing = true;
        if let Role::Leader(leader) = &mut self.role {
            for req in leader.apply_queue.drain(..) {
                (req.callback)(Err(RaftError::Shutdown));
            }
            for req in leader.barrier_queue.drain(..) {
                (req.callback)(Err(RaftError::Shutdown));
            }
            if let Some(change) = leader.pending_change.take() {
                (change.callback)(Err(RaftError::Shutdown));
            }
            if let Some(transfer) = leader.transfer.take() {
                (transfer.callback)(Err(RaftError::Shutdown));
            }
        }
        self.close_callback = Some(cb);
        self.io.close()?;
        if let Some(cb) = self.close_callback.take() {
            cb();
        }
        Ok(())
    }

    /// Apply the term rule common to every RPC kind (§4.6): step down and
    /// persist if the message carries a newer term than ours.
    pub(crate) fn observe_term(&mut self, msg_term: Term, now: Millis) -> Result<()> {
        if msg_term > self.current_term {
            self.current_term = msg_term;
            self.voted_for = None;
            self.io.set_term(self.current_term, None)?;
            self.become_follower(now, None);
        }
        Ok(())
    }

    pub(crate) fn become_follower(&mut self, now: Millis, leader_id: Option<ServerId>) {
        let was_leader = self.role.is_leader();
        if let Role::Leader(leader) = &mut self.role {
            for req in leader.apply_queue.drain(..) {
                (req.callback)(Err(RaftError::LeadershipLost));
            }
            for req in leader.barrier_queue.drain(..) {
                (req.callback)(Err(RaftError::LeadershipLost));
            }
            if let Some(change) = leader.pending_change.take() {
                (change.callback)(Err(RaftError::LeadershipLost));
            }
            if let Some(transfer) = leader.transfer.take() {
                // Stepping down while a transfer is pending is, per §4.4,
                // exactly how a successful transfer is observed: the
                // transferee became leader and this server saw its term.
                (transfer.callback)(Ok(()));
            }
        }
        self.role = Role::Follower(FollowerState {
            leader_id,
            election_deadline: 0,
        });
        self.reset_election_timer(now);
        if was_leader {
            info!(id = self.id.get(), term = self.current_term, "stepped down to follower");
        }
    }

    pub(crate) fn become_candidate(&mut self, now: Millis, disrupt_leader: bool) {
        let phase = if self.options.pre_vote && !disrupt_leader {
            CandidatePhase::PreVote
        } else {
            CandidatePhase::Election
        };
        self.role = Role::Candidate(CandidateState {
            phase,
            votes: HashMap::new(),
            election_deadline: 0,
            disrupt_leader,
        });
        self.reset_election_timer(now);
    }

    pub(crate) fn become_leader(&mut self, now: Millis) -> Result<()> {
        let mut progress = ProgressTable::new();
        let last_index = self.log.last_index();
        progress.reset_for_leader(
            self.committed_config.voters().filter(|s| s.id != self.id).map(|s| s.id),
            last_index,
        );
        self.role = Role::Leader(LeaderState::new(progress));
        if let Role::Leader(leader) = &mut self.role {
            leader.last_heartbeat_check = now;
        }
        info!(id = self.id.get(), term = self.current_term, "became leader");
        self.send_heartbeats_now(now)
    }

    pub(crate) fn reset_election_timer(&mut self, now: Millis) {
        let low = self.options.election_timeout;
        let high = 2 * self.options.election_timeout;
        let timeout = self.io.random(low, high);
        let deadline = now + timeout;
        match &mut self.role {
            Role::Follower(f) => f.election_deadline = deadline,
            Role::Candidate(c) => c.election_deadline = deadline,
            Role::Leader(_) => {}
        }
    }
}
