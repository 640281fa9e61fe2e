//! Wire layer for the termlink terminal-mirror SDK.
//!
//! This crate owns everything between the socket and the listeners:
//!
//! - `protocol`: JSON frame classification (responses vs events) and the
//!   typed event payload set
//! - `orderer`: per-account sequence-number restoration with gap detection
//! - `transport`: the shared WebSocket channel with request/response
//!   correlation, reconnect loop and listener dispatch
//! - `listener`: the synchronization capability set implemented by the
//!   SDK-side components
//!
//! The transport is shared by every account connection on a host; it holds
//! only weak references to listeners, so dropping a connection is enough to
//! detach it from the event stream.

pub mod listener;
pub mod orderer;
pub mod protocol;
pub mod transport;

pub use listener::{ReconnectListener, SyncListener};
pub use orderer::{GapInfo, PacketOrderer};
pub use protocol::{
    classify, response_error, stamp_request, EventPacket, EventPayload, FrameError, InboundFrame,
};
pub use transport::{TransportConfig, TransportError, WsTransport};
