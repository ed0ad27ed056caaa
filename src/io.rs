//! The capabilities the engine is embedded against (component C6): durable
//! storage, message transport, and the state machine entries are applied to.
//!
//! The specification describes these as synchronous calls that take a
//! completion callback. A callback closure that captures `&mut Raft` while
//! the engine itself holds the `Io` implementation is circular ownership
//! Rust cannot express safely; the teacher's own I/O layer already solves the
//! same problem with a completion-port pattern instead of callbacks
//! (`IoRequest`/`IoCompletion`, `submit()`/`poll()` in `io/async_io.rs` and
//! `io/unix_io_uring.rs`). This follows that shape: an async method returns a
//! [`Token`] synchronously, and the driver running the engine later hands the
//! result back through the matching `on_*_complete` method on [`crate::Raft`].

use bytes::Bytes;

use crate::config::Configuration;
use crate::log::{Entry, SnapshotMeta};
use crate::rpc::Envelope;
use crate::types::{LogIndex, Millis, ServerId, Term};

/// Identifies one outstanding asynchronous request. Assigned by the
/// implementation at submission time and echoed back on completion.
pub type Token = u64;

/// What `Io::load` hands back when the engine starts.
#[derive(Debug, Clone, Default)]
pub struct LoadResult {
    pub current_term: Term,
    pub voted_for: Option<ServerId>,
    pub snapshot: Option<SnapshotMeta>,
    /// The snapshot's own data, for `Fsm::restore`. `None` iff `snapshot` is.
    pub snapshot_data: Option<Bytes>,
    /// Index of `entries[0]`, i.e. one past the snapshot boundary.
    pub start_index: LogIndex,
    pub entries: Vec<Entry>,
}

/// Durable storage and transport the engine is embedded against.
///
/// Methods that return a [`Token`] are asynchronous: the call only submits
/// the request, and the caller of [`crate::Raft::tick`]/[`crate::Raft::step`]
/// is responsible for eventually delivering the result through the matching
/// `on_*_complete` method. Methods without a `Token` are synchronous and may
/// not block the calling thread for any meaningful time.
pub trait Io {
    /// Allocate whatever local resources the implementation needs before
    /// first use (file handles, connection pools, ...).
    fn init(&mut self) -> crate::error::Result<()>;

    /// Release everything `init` acquired. Called once, during shutdown.
    fn close(&mut self) -> crate::error::Result<()>;

    /// Load persisted term, vote, snapshot and log entries at startup.
    fn load(&mut self) -> crate::error::Result<LoadResult>;

    /// Write the initial configuration and entry for a brand-new cluster.
    /// Only valid when persistent state is pristine (§4.1).
    fn bootstrap(&mut self, configuration: &Configuration) -> crate::error::Result<()>;

    /// Recover a server that is rejoining a cluster it already knows about,
    /// without going through the normal add-server handshake.
    fn recover(&mut self, configuration: &Configuration) -> crate::error::Result<()>;

    /// Persist a new current term and, if given, the vote cast in it.
    /// Must complete before any message claiming that term is sent.
    fn set_term(&mut self, term: Term, voted_for: Option<ServerId>) -> crate::error::Result<()>;

    /// Durably truncate the log at and after `index`, before the
    /// corresponding in-memory truncation is observable to peers.
    fn truncate(&mut self, index: LogIndex) -> crate::error::Result<()>;

    /// Current wall-clock time, in the same units as every `Millis` the
    /// engine is given (e.g. tick deadlines). Never blocks.
    fn time(&self) -> Millis;

    /// A source of randomness for jittering election timeouts. Not used for
    /// anything that must be reproducible across implementations.
    fn random(&mut self, low: Millis, high: Millis) -> Millis;

    /// Submit entries for durable append, returning a token for the eventual
    /// `on_append_complete`. `entries` have already been acquired from the
    /// log; the implementation owns exactly one logical reference on each
    /// and must release it (via the log, from inside the completion
    /// handler) once the write lands.
    fn append(&mut self, entries: Vec<Entry>) -> crate::error::Result<Token>;

    /// Submit an envelope for delivery to its destination.
    fn send(&mut self, envelope: Envelope) -> crate::error::Result<Token>;

    /// Submit a chunk of snapshot data for durable storage.
    fn snapshot_put(&mut self, meta: SnapshotMeta, chunk: Bytes) -> crate::error::Result<Token>;

    /// Request the snapshot data backing `meta` for transmission to a
    /// lagging follower.
    fn snapshot_get(&mut self, meta: SnapshotMeta) -> crate::error::Result<Token>;
}

/// The replicated state machine committed entries are applied to.
///
/// `Output` models the specification's "pointer-sized opaque result": each
/// implementation picks whatever type its own commands actually produce.
pub trait Fsm {
    type Output;

    /// Apply one committed `Command` entry. Never called for `Barrier` or
    /// `ConfigChange` entries, which the engine itself consumes.
    fn apply(&mut self, index: LogIndex, payload: &[u8]) -> crate::error::Result<Self::Output>;

    /// Produce a snapshot of current state, as a sequence of chunks handed
    /// to `Io::snapshot_put` in order.
    fn snapshot(&mut self) -> crate::error::Result<Vec<Bytes>>;

    /// Replace current state with one reconstructed from a previously taken
    /// snapshot's chunks, concatenated in receipt order.
    fn restore(&mut self, payload: &[u8]) -> crate::error::Result<()>;
}
