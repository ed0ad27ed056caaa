//! A single-threaded Raft consensus engine.
//!
//! The engine owns no thread, socket, or file of its own: it is driven by an
//! embedder that calls [`Raft::tick`] on a timer, [`Raft::step`] when a
//! message arrives, and [`Raft::complete`] when an [`Io`] request finishes,
//! and that implements [`Io`] and [`Fsm`] for its own storage/transport/state
//! machine. Those three entry points are mutually exclusive by construction
//! (the embedder never calls back into the engine from inside one of them),
//! which is what lets every field below be owned directly instead of behind
//! a lock.

pub mod client;
pub mod config;
pub mod election;
pub mod error;
pub mod io;
pub mod log;
pub mod options;
pub mod progress;
pub mod raft;
pub mod replication;
pub mod rpc;
pub mod snapshot;
pub mod tick;
pub mod types;

pub use config::{Configuration, Role as ConfigRole, Server};
pub use error::{RaftError, Result};
pub use io::{Fsm, Io, LoadResult, Token};
pub use log::{Entry, EntryKind, Log, SnapshotMeta};
pub use options::Options;
pub use progress::{Progress, ProgressTable, ReplicationState};
pub use raft::{CandidatePhase, Raft, Role};
pub use rpc::{
    AppendEntries, AppendEntriesResult, Envelope, InstallSnapshot, InstallSnapshotResult, Message,
    RequestVote, RequestVoteResult, TimeoutNow,
};
pub use tick::Completion;
pub use types::{LogIndex, Millis, ServerId, Term};
