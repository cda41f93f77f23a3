//! atelier-server: multi-tenant collaboration server for a local-first
//! code editor.
//!
//! Clients speak the binary framed protocol from `atelier-proto` over a
//! WebSocket at `/ws/{project_id}`. Each active project is a room task
//! owning the CRDT document, presence, chat, and per-peer sync state;
//! the store persists snapshots and change batches under `STORAGE_PATH`.

pub mod config;
pub mod connection;
pub mod document;
pub mod error;
pub mod presence;
pub mod room;
pub mod server;
pub mod session;
pub mod store;
pub mod voice;

/// Milliseconds since the Unix epoch: the wall clock carried in wire
/// timestamps and persistence expiries.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
