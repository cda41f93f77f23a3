//! Wire protocol for the atelier collaboration server.
//!
//! Everything on the socket is a length-prefixed binary frame
//! (`[version][type][len:u24 BE][payload]`) whose payload is one message
//! from the tagged unions in [`message`], serialized with the structural
//! encoding in [`wire`]. This crate is pure: no IO, no async.

pub mod frame;
pub mod message;
pub mod wire;

pub use frame::{Frame, FrameDecoder, FrameError, MAX_PAYLOAD_LEN, PROTOCOL_VERSION};
pub use message::{
    ChatEntry, ClientMessage, ErrorCode, PeerInfo, PresenceStatus, ServerMessage,
};
pub use wire::WireError;
