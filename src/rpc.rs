//! Wire messages (component C6's data shapes) and the server-side dispatch
//! entry point that applies the term rule (§4.6) before delegating to the
//! election, replication, or snapshot modules.

use serde::{Deserialize, Serialize};

use crate::log::Entry;
use crate::types::{LogIndex, ServerId, Term};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVote {
    pub term: Term,
    pub candidate_id: ServerId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
    /// When false, a follower that has recently heard from a reachable
    /// leader refuses the vote even if the candidate's log qualifies.
    pub disrupt_leader: bool,
    /// True for a pre-vote probe: the receiver evaluates it exactly like a
    /// real vote request but never adopts `term` or records `voted_for`,
    /// since a pre-vote round never actually happened as far as persistent
    /// state is concerned.
    pub pre_vote: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResult {
    pub term: Term,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntries {
    pub term: Term,
    pub leader_id: ServerId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<Entry>,
    pub leader_commit: LogIndex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResult {
    pub term: Term,
    pub success: bool,
    /// The follower's own last log index, used by the leader as the
    /// rejection hint for `next_index` (§4.3).
    pub last_log_index: LogIndex,
    /// Fast-backtracking hints (§10 supplement): the term at the
    /// conflicting index and the first index of that term, letting the
    /// leader skip straight past an entire mismatched term in one round
    /// trip instead of decrementing by one.
    pub conflict_term: Option<Term>,
    pub conflict_index: Option<LogIndex>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshot {
    pub term: Term,
    pub leader_id: ServerId,
    pub last_index: LogIndex,
    pub last_term: Term,
    /// Binary-encoded `Configuration` as of the snapshot.
    pub configuration: Vec<u8>,
    pub configuration_index: LogIndex,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotResult {
    pub term: Term,
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutNow {
    pub term: Term,
    pub leader_id: ServerId,
}

/// The sum type over every RPC kind the engine sends or receives, tagged by
/// variant for dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    RequestVote(RequestVote),
    RequestVoteResult(RequestVoteResult),
    AppendEntries(AppendEntries),
    AppendEntriesResult(AppendEntriesResult),
    InstallSnapshot(InstallSnapshot),
    InstallSnapshotResult(InstallSnapshotResult),
    TimeoutNow(TimeoutNow),
}

impl Message {
    pub fn term(&self) -> Term {
        match self {
            Message::RequestVote(m) => m.term,
            Message::RequestVoteResult(m) => m.term,
            Message::AppendEntries(m) => m.term,
            Message::AppendEntriesResult(m) => m.term,
            Message::InstallSnapshot(m) => m.term,
            Message::InstallSnapshotResult(m) => m.term,
            Message::TimeoutNow(m) => m.term,
        }
    }
}

/// An outbound message paired with its destination, as produced by the
/// engine for the I/O capability to deliver.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub to: ServerId,
    pub message: Message,
}
