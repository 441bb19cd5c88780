//! Localhost WebSocket transport between the broker and the browser
//! extension.
//!
//! The broker listens; the extension dials in and upgrades at
//! `/extension`. Both directions speak JSON-RPC 2.0, one UTF-8 JSON
//! object per frame. Outbound requests are correlated by an 8-character
//! random id; the peer answers under the same id.

mod error;
mod server;
mod types;

pub use error::TransportError;
pub use server::{
    PING_INTERVAL, RawConnectionHook, SECOND_PEER_CLOSE_GRACE, TransportEvent, TransportHandle,
    start_transport,
};
pub use types::{
    FrameKind, Handshake, PeerErrorPayload, RpcNotification, RpcRequest, RpcResponse, TabRecord,
    new_request_id,
};
