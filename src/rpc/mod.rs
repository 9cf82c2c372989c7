//! MessagePack-RPC: wire codec and per-client session state.

pub mod codec;
pub mod session;

pub use codec::{Message, MessageDecoder, ProtocolError};
pub use session::{OutboundKind, QueueOutcome, RpcSession};
