//! Wire protocol layer: JSON-RPC 2.0 envelopes and the line framer used by
//! the stream proxy and the plugin host.

pub mod framer;
pub mod jsonrpc;

pub use framer::{Frame, LineFramer, DEFAULT_MAX_LINE_LEN};
pub use jsonrpc::{FrameError, JsonRpcEnvelope};
