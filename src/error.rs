use thiserror::Error;

/// Errors surfaced by the consensus engine to its embedder.
///
/// One variant per error kind named in the specification; message text is
/// deliberately terse since callers are expected to match on the variant,
/// not parse the message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RaftError {
    #[error("out of memory: {0}")]
    NoMem(String),

    #[error("bad server id: {0}")]
    BadId(String),

    #[error("duplicate server id: {0}")]
    DuplicateId(u64),

    #[error("duplicate server address: {0}")]
    DuplicateAddress(String),

    #[error("unknown role")]
    BadRole,

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("not leader")]
    NotLeader,

    #[error("leadership lost before entry committed")]
    LeadershipLost,

    #[error("engine is shutting down")]
    Shutdown,

    #[error("cannot bootstrap: persistent state is not pristine")]
    CantBootstrap,

    #[error("cannot change configuration: a change is already pending")]
    CantChange,

    #[error("persistent state is corrupt: {0}")]
    Corrupt(String),

    #[error("operation canceled")]
    Canceled,

    #[error("name too long: {0}")]
    NameTooLong(String),

    #[error("value too big")]
    TooBig,

    #[error("no connection to server {0}")]
    NoConnection(u64),

    #[error("busy: {0}")]
    Busy(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("no space left")]
    NoSpace,

    #[error("too many {0}")]
    TooMany(String),
}

pub type Result<T> = std::result::Result<T, RaftError>;
