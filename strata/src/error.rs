use std::io;

/// Errors surfaced by outlets, inlets and resolvers.
///
/// Samples dropped because a buffer overflowed are not errors: they are counted instead
/// (see [`Inlet::dropped_samples`](crate::Inlet::dropped_samples)).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A blocking operation didn't complete in time.
    #[error("operation timed out")]
    Timeout,

    /// No stream matched.
    #[error("no matching stream found")]
    NotFound,

    /// The stream connection was lost, and won't be recovered.
    #[error("the stream connection was lost")]
    ConnectionLost,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Protocol(#[from] strata_proto::Error),

    #[error(transparent)]
    Io(io::Error),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        if strata_network::io_err_is_timeout(e.kind()) {
            Self::Timeout
        } else {
            Self::Io(e)
        }
    }
}

pub type Result<T, E = Error> = core::result::Result<T, E>;
