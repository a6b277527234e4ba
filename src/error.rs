use thiserror::Error;

/// Errors surfaced by socket operations or stored as the sticky error of an
/// RPC. Per-packet failures are never reported through this type; they are
/// absorbed by the dispatcher and counted in [`crate::Metrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HomaError {
    /// The peer stayed silent past the timeout horizon.
    #[error("RPC timed out")]
    TimedOut,

    /// The RPC was aborted locally.
    #[error("RPC cancelled")]
    Cancelled,

    /// The owning socket has been shut down.
    #[error("socket shut down")]
    Shutdown,

    /// The peer answered RPC_UNKNOWN for an outstanding request.
    #[error("peer has no record of this RPC")]
    Unknown,

    /// The driver reported the network as unavailable.
    #[error("network is down")]
    NetDown,

    /// No route to the destination host.
    #[error("host unreachable")]
    HostUnreachable,

    /// The operation would block and non-blocking mode was requested.
    #[error("operation would block")]
    Again,

    /// A user-supplied argument failed validation.
    #[error("invalid argument")]
    InvalidArgument,

    /// No RPC with the given id exists on this socket.
    #[error("no such RPC")]
    NotFound,

    /// The requested port is already bound.
    #[error("port already in use")]
    PortInUse,

    /// The socket has no registered buffer region, or the region is full.
    #[error("no buffer space available")]
    NoBufferSpace,
}

pub type Result<T> = std::result::Result<T, HomaError>;
