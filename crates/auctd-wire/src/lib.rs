//! Wire protocol for auctd sessions.
//!
//! Messages are line-oriented: a verb line, then `Header: value` pairs,
//! terminated by one blank line. The codec frames them over any byte
//! stream via `tokio_util::codec`.

pub mod codec;
pub mod error;
pub mod message;

pub use codec::LineCodec;
pub use error::{WireError, WireResult};
pub use message::{Message, Status, TimeStamp, Verb};
