//! Homa: a message-oriented, connectionless transport for datacenter RPC.
//!
//! Unlike a byte stream, every exchange is a request/response pair bound to
//! an RPC id, message boundaries are preserved, short messages ride high
//! priorities, and receivers meter inbound bandwidth with grants. This
//! crate is the transport core — the state machines between a packet
//! driver below and a socket API above:
//!
//! - [`Homa`] owns the instance-wide state and the periodic timer,
//! - [`HomaSocket`] is the user endpoint (bind, send, receive),
//! - [`Driver`] is the seam to the OS packet path,
//! - [`HomaConfig`] carries the tuning knobs.
//!
//! ```ignore
//! let homa = Homa::new(HomaConfig::default(), Box::new(driver));
//! let hnet = homa.hnet();
//! let sock = homa.socket(&hnet);
//! sock.bind(99)?;
//! sock.set_buf_region(64 << 16)?;
//!
//! let id = sock.send_request(server_addr, b"ping", 0x1234)?;
//! let msg = sock.receive(RecvFlags::RESPONSE, None)?;
//! assert_eq!(msg.completion_cookie, 0x1234);
//! sock.release_bpages(&msg.bpages);
//! ```

mod config;
mod dispatch;
mod driver;
mod error;
mod grant;
mod homa;
mod msgin;
mod msgout;
mod pacer;
mod peer;
mod pool;
mod rpc;
mod sock;
mod timer;
pub mod type_alias;
mod util;
mod wire;

pub use self::config::{HomaConfig, FLAG_DONT_THROTTLE};
pub use self::driver::{Driver, MockDriver, MOCK_MTU};
pub use self::error::{HomaError, Result};
pub use self::homa::{Hnet, Homa, Metrics};
pub use self::pool::{HOMA_BPAGE_SIZE, HOMA_MAX_BPAGES, HOMA_MAX_MESSAGE_LENGTH};
pub use self::sock::{HomaSocket, RecvFlags, RecvMsg};
pub use self::wire::HOMA_MAX_PRIORITIES;

#[cfg(test)]
mod tests;
