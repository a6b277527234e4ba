//! Type aliases used in this library.

/// [`u64`]: RPC identifier.
/// The low bit encodes the local role: even means this end initiated the RPC
/// (client), odd means this end is the responder (server). The id carried in
/// a packet header is the sender's id, so XOR-ing the low bit localizes it.
pub type RpcId = u64;

/// [`u16`]: Transport port number.
pub type Port = u16;

/// [`u32`]: Network namespace identifier.
pub type HnetId = u32;

/// [`u32`]: Index of a bpage within a socket's registered buffer region.
pub type BpageIdx = u32;

/// [`u8`]: Packet priority level, `0..HOMA_MAX_PRIORITIES`.
pub type Priority = u8;
