//! Presence and cursor state for one room.
//!
//! The table is plain data owned by the room task; all timing decisions
//! take explicit `Instant`s so the sweep is testable. Cursors are
//! authoritative at the sender and replaced wholesale per (peer, file);
//! the server never validates positions against the document, because a
//! race-free check is impossible while edits are in flight.

use std::collections::HashMap;
use std::time::Instant;

use atelier_proto::{PeerInfo, PresenceStatus};

use crate::config::limits::{PRESENCE_AWAY_AFTER, PRESENCE_IDLE_AFTER};

/// Last reported cursor for one (peer, file).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorRecord {
    pub file_path: String,
    pub line: u32,
    pub column: u32,
    pub selection_end: Option<(u32, u32)>,
}

#[derive(Debug)]
struct PeerPresence {
    display_name: String,
    color: String,
    joined_at: i64,
    last_active: i64,
    last_frame: Instant,
    status: PresenceStatus,
    active_file: Option<String>,
}

/// One demotion produced by a staleness sweep.
#[derive(Debug, PartialEq, Eq)]
pub struct Demotion {
    pub peer_id: String,
    pub status: PresenceStatus,
}

#[derive(Debug, Default)]
pub struct PresenceTable {
    peers: HashMap<String, PeerPresence>,
    /// Keyed by (peer_id, file_path); replaced, never merged.
    cursors: HashMap<(String, String), CursorRecord>,
}

impl PresenceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub fn insert(&mut self, peer_id: &str, display_name: &str, color: &str, now_ms: i64) -> PeerInfo {
        self.peers.insert(
            peer_id.to_string(),
            PeerPresence {
                display_name: display_name.to_string(),
                color: color.to_string(),
                joined_at: now_ms,
                last_active: now_ms,
                last_frame: Instant::now(),
                status: PresenceStatus::Active,
                active_file: None,
            },
        );
        PeerInfo {
            peer_id: peer_id.to_string(),
            display_name: display_name.to_string(),
            color: color.to_string(),
            joined_at: now_ms,
            last_active: now_ms,
            status: PresenceStatus::Active,
            active_file: None,
        }
    }

    /// Remove the peer and every cursor it owned.
    pub fn remove(&mut self, peer_id: &str) -> bool {
        self.cursors.retain(|(owner, _), _| owner != peer_id);
        self.peers.remove(peer_id).is_some()
    }

    /// Record inbound activity. Timestamps only; activity never promotes
    /// a status on its own, clients drive upward transitions.
    pub fn touch(&mut self, peer_id: &str, now_ms: i64) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.last_active = now_ms;
            peer.last_frame = Instant::now();
        }
    }

    pub fn set_status(
        &mut self,
        peer_id: &str,
        status: PresenceStatus,
        active_file: Option<String>,
    ) -> Option<PeerInfo> {
        {
            let peer = self.peers.get_mut(peer_id)?;
            peer.status = status;
            peer.active_file = active_file;
        }
        self.snapshot(peer_id)
    }

    pub fn set_active_file(&mut self, peer_id: &str, file: Option<String>) -> Option<PeerInfo> {
        self.peers.get_mut(peer_id)?.active_file = file;
        self.snapshot(peer_id)
    }

    pub fn active_file(&self, peer_id: &str) -> Option<&str> {
        self.peers.get(peer_id)?.active_file.as_deref()
    }

    pub fn set_cursor(&mut self, peer_id: &str, cursor: CursorRecord) {
        self.cursors
            .insert((peer_id.to_string(), cursor.file_path.clone()), cursor);
    }

    pub fn clear_cursor(&mut self, peer_id: &str, file_path: &str) {
        self.cursors
            .remove(&(peer_id.to_string(), file_path.to_string()));
    }

    /// Demote peers that have gone quiet: Active -> Idle after 60 s,
    /// Active/Idle -> Away after 5 min. Never touches Away or Offline,
    /// and never promotes.
    pub fn sweep(&mut self, now: Instant) -> Vec<Demotion> {
        let mut demotions = Vec::new();
        for (peer_id, peer) in &mut self.peers {
            let quiet = now.saturating_duration_since(peer.last_frame);
            let next = match peer.status {
                PresenceStatus::Active if quiet >= PRESENCE_AWAY_AFTER => PresenceStatus::Away,
                PresenceStatus::Active if quiet >= PRESENCE_IDLE_AFTER => PresenceStatus::Idle,
                PresenceStatus::Idle if quiet >= PRESENCE_AWAY_AFTER => PresenceStatus::Away,
                _ => continue,
            };
            peer.status = next;
            demotions.push(Demotion {
                peer_id: peer_id.clone(),
                status: next,
            });
        }
        demotions
    }

    pub fn snapshot(&self, peer_id: &str) -> Option<PeerInfo> {
        let peer = self.peers.get(peer_id)?;
        Some(PeerInfo {
            peer_id: peer_id.to_string(),
            display_name: peer.display_name.clone(),
            color: peer.color.clone(),
            joined_at: peer.joined_at,
            last_active: peer.last_active,
            status: peer.status,
            active_file: peer.active_file.clone(),
        })
    }

    /// Everyone except `excluding`, for `ProjectJoined`.
    pub fn snapshot_all(&self, excluding: &str) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self
            .peers
            .keys()
            .filter(|id| id.as_str() != excluding)
            .filter_map(|id| self.snapshot(id))
            .collect();
        peers.sort_by(|a, b| a.joined_at.cmp(&b.joined_at));
        peers
    }

    pub fn peer_ids(&self) -> Vec<String> {
        self.peers.keys().cloned().collect()
    }
}
