//! Client/server message taxonomy.
//!
//! Both directions are tagged unions with stable u32 tags and fixed field
//! order. Any divergence a peer can produce (unknown tag, bad bool byte,
//! non-UTF-8 string, trailing bytes) decodes to a [`WireError`] which the
//! connection surfaces as `InvalidMessage`.

use serde::{Deserialize, Serialize};

use crate::wire::{WireError, WireReader, WireWriter};

/// Peer presence state, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresenceStatus {
    Active,
    Idle,
    Away,
    Offline,
}

impl PresenceStatus {
    pub fn as_u8(self) -> u8 {
        match self {
            PresenceStatus::Active => 0,
            PresenceStatus::Idle => 1,
            PresenceStatus::Away => 2,
            PresenceStatus::Offline => 3,
        }
    }

    pub fn from_u8(v: u8) -> Result<Self, WireError> {
        match v {
            0 => Ok(PresenceStatus::Active),
            1 => Ok(PresenceStatus::Idle),
            2 => Ok(PresenceStatus::Away),
            3 => Ok(PresenceStatus::Offline),
            other => Err(WireError::UnknownStatus(other)),
        }
    }
}

/// Client-visible failure codes carried in `Error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    Unknown,
    InvalidMessage,
    Unauthorized,
    ProjectNotFound,
    FileNotFound,
    RateLimited,
    ServerError,
    VersionMismatch,
    ProjectFull,
    AlreadyJoined,
    NotJoined,
}

impl ErrorCode {
    pub fn as_u16(self) -> u16 {
        match self {
            ErrorCode::Unknown => 0,
            ErrorCode::InvalidMessage => 1,
            ErrorCode::Unauthorized => 2,
            ErrorCode::ProjectNotFound => 3,
            ErrorCode::FileNotFound => 4,
            ErrorCode::RateLimited => 5,
            ErrorCode::ServerError => 6,
            ErrorCode::VersionMismatch => 7,
            ErrorCode::ProjectFull => 8,
            ErrorCode::AlreadyJoined => 9,
            ErrorCode::NotJoined => 10,
        }
    }

    /// Codes a newer server might add decode as `Unknown` rather than
    /// failing the whole frame.
    pub fn from_u16(v: u16) -> Self {
        match v {
            1 => ErrorCode::InvalidMessage,
            2 => ErrorCode::Unauthorized,
            3 => ErrorCode::ProjectNotFound,
            4 => ErrorCode::FileNotFound,
            5 => ErrorCode::RateLimited,
            6 => ErrorCode::ServerError,
            7 => ErrorCode::VersionMismatch,
            8 => ErrorCode::ProjectFull,
            9 => ErrorCode::AlreadyJoined,
            10 => ErrorCode::NotJoined,
            _ => ErrorCode::Unknown,
        }
    }
}

/// Snapshot of one peer as seen by the room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub peer_id: String,
    pub display_name: String,
    pub color: String,
    pub joined_at: i64,
    pub last_active: i64,
    pub status: PresenceStatus,
    pub active_file: Option<String>,
}

impl PeerInfo {
    fn write(&self, w: &mut WireWriter) {
        w.write_str(&self.peer_id);
        w.write_str(&self.display_name);
        w.write_str(&self.color);
        w.write_i64(self.joined_at);
        w.write_i64(self.last_active);
        w.write_u8(self.status.as_u8());
        w.write_opt_str(self.active_file.as_deref());
    }

    fn read(r: &mut WireReader) -> Result<Self, WireError> {
        Ok(Self {
            peer_id: r.read_str()?,
            display_name: r.read_str()?,
            color: r.read_str()?,
            joined_at: r.read_i64()?,
            last_active: r.read_i64()?,
            status: PresenceStatus::from_u8(r.read_u8()?)?,
            active_file: r.read_opt_str()?,
        })
    }
}

/// One retained chat line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEntry {
    pub peer_id: String,
    pub display_name: String,
    pub content: String,
    pub server_timestamp: i64,
}

impl ChatEntry {
    fn write(&self, w: &mut WireWriter) {
        w.write_str(&self.peer_id);
        w.write_str(&self.display_name);
        w.write_str(&self.content);
        w.write_i64(self.server_timestamp);
    }

    fn read(r: &mut WireReader) -> Result<Self, WireError> {
        Ok(Self {
            peer_id: r.read_str()?,
            display_name: r.read_str()?,
            content: r.read_str()?,
            server_timestamp: r.read_i64()?,
        })
    }
}

fn write_sel(w: &mut WireWriter, sel: &(u32, u32)) {
    w.write_u32(sel.0);
    w.write_u32(sel.1);
}

fn read_sel(r: &mut WireReader) -> Result<(u32, u32), WireError> {
    Ok((r.read_u32()?, r.read_u32()?))
}

/// Messages a client sends to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Hello {
        protocol_version: u8,
        client_id: Option<String>,
        client_name: String,
        session_token: Option<String>,
    },
    Goodbye {
        reason: Option<String>,
    },
    JoinProject {
        project_id: String,
        request_state: bool,
    },
    LeaveProject {
        project_id: String,
    },
    SyncMessage {
        project_id: String,
        sync_data: Vec<u8>,
    },
    SyncRequest {
        project_id: String,
    },
    OpenFile {
        project_id: String,
        file_path: String,
    },
    CloseFile {
        project_id: String,
        file_path: String,
    },
    CursorUpdate {
        project_id: String,
        file_path: String,
        line: u32,
        column: u32,
        selection_end: Option<(u32, u32)>,
    },
    PresenceUpdate {
        project_id: String,
        status: PresenceStatus,
        active_file: Option<String>,
    },
    ChatMessage {
        project_id: String,
        content: String,
    },
    VoiceJoin {
        project_id: String,
    },
    VoiceLeave {
        project_id: String,
    },
    Ping {
        timestamp: u64,
    },
}

impl ClientMessage {
    pub fn tag(&self) -> u32 {
        match self {
            ClientMessage::Hello { .. } => 0,
            ClientMessage::Goodbye { .. } => 1,
            ClientMessage::JoinProject { .. } => 2,
            ClientMessage::LeaveProject { .. } => 3,
            ClientMessage::SyncMessage { .. } => 4,
            ClientMessage::SyncRequest { .. } => 5,
            ClientMessage::OpenFile { .. } => 6,
            ClientMessage::CloseFile { .. } => 7,
            ClientMessage::CursorUpdate { .. } => 8,
            ClientMessage::PresenceUpdate { .. } => 9,
            ClientMessage::ChatMessage { .. } => 10,
            ClientMessage::VoiceJoin { .. } => 11,
            ClientMessage::VoiceLeave { .. } => 12,
            ClientMessage::Ping { .. } => 13,
        }
    }

    /// Project the message is scoped to, when it has one.
    pub fn project_id(&self) -> Option<&str> {
        match self {
            ClientMessage::JoinProject { project_id, .. }
            | ClientMessage::LeaveProject { project_id }
            | ClientMessage::SyncMessage { project_id, .. }
            | ClientMessage::SyncRequest { project_id }
            | ClientMessage::OpenFile { project_id, .. }
            | ClientMessage::CloseFile { project_id, .. }
            | ClientMessage::CursorUpdate { project_id, .. }
            | ClientMessage::PresenceUpdate { project_id, .. }
            | ClientMessage::ChatMessage { project_id, .. }
            | ClientMessage::VoiceJoin { project_id }
            | ClientMessage::VoiceLeave { project_id } => Some(project_id),
            ClientMessage::Hello { .. }
            | ClientMessage::Goodbye { .. }
            | ClientMessage::Ping { .. } => None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.write_u32(self.tag());
        match self {
            ClientMessage::Hello {
                protocol_version,
                client_id,
                client_name,
                session_token,
            } => {
                w.write_u8(*protocol_version);
                w.write_opt_str(client_id.as_deref());
                w.write_str(client_name);
                w.write_opt_str(session_token.as_deref());
            }
            ClientMessage::Goodbye { reason } => w.write_opt_str(reason.as_deref()),
            ClientMessage::JoinProject {
                project_id,
                request_state,
            } => {
                w.write_str(project_id);
                w.write_bool(*request_state);
            }
            ClientMessage::LeaveProject { project_id }
            | ClientMessage::SyncRequest { project_id }
            | ClientMessage::VoiceJoin { project_id }
            | ClientMessage::VoiceLeave { project_id } => w.write_str(project_id),
            ClientMessage::SyncMessage {
                project_id,
                sync_data,
            } => {
                w.write_str(project_id);
                w.write_bytes(sync_data);
            }
            ClientMessage::OpenFile {
                project_id,
                file_path,
            }
            | ClientMessage::CloseFile {
                project_id,
                file_path,
            } => {
                w.write_str(project_id);
                w.write_str(file_path);
            }
            ClientMessage::CursorUpdate {
                project_id,
                file_path,
                line,
                column,
                selection_end,
            } => {
                w.write_str(project_id);
                w.write_str(file_path);
                w.write_u32(*line);
                w.write_u32(*column);
                w.write_opt(selection_end.as_ref(), write_sel);
            }
            ClientMessage::PresenceUpdate {
                project_id,
                status,
                active_file,
            } => {
                w.write_str(project_id);
                w.write_u8(status.as_u8());
                w.write_opt_str(active_file.as_deref());
            }
            ClientMessage::ChatMessage {
                project_id,
                content,
            } => {
                w.write_str(project_id);
                w.write_str(content);
            }
            ClientMessage::Ping { timestamp } => w.write_u64(*timestamp),
        }
        w.into_bytes()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let mut r = WireReader::new(buf);
        let tag = r.read_u32()?;
        let msg = match tag {
            0 => ClientMessage::Hello {
                protocol_version: r.read_u8()?,
                client_id: r.read_opt_str()?,
                client_name: r.read_str()?,
                session_token: r.read_opt_str()?,
            },
            1 => ClientMessage::Goodbye {
                reason: r.read_opt_str()?,
            },
            2 => ClientMessage::JoinProject {
                project_id: r.read_str()?,
                request_state: r.read_bool()?,
            },
            3 => ClientMessage::LeaveProject {
                project_id: r.read_str()?,
            },
            4 => ClientMessage::SyncMessage {
                project_id: r.read_str()?,
                sync_data: r.read_bytes()?,
            },
            5 => ClientMessage::SyncRequest {
                project_id: r.read_str()?,
            },
            6 => ClientMessage::OpenFile {
                project_id: r.read_str()?,
                file_path: r.read_str()?,
            },
            7 => ClientMessage::CloseFile {
                project_id: r.read_str()?,
                file_path: r.read_str()?,
            },
            8 => ClientMessage::CursorUpdate {
                project_id: r.read_str()?,
                file_path: r.read_str()?,
                line: r.read_u32()?,
                column: r.read_u32()?,
                selection_end: r.read_opt(read_sel)?,
            },
            9 => ClientMessage::PresenceUpdate {
                project_id: r.read_str()?,
                status: PresenceStatus::from_u8(r.read_u8()?)?,
                active_file: r.read_opt_str()?,
            },
            10 => ClientMessage::ChatMessage {
                project_id: r.read_str()?,
                content: r.read_str()?,
            },
            11 => ClientMessage::VoiceJoin {
                project_id: r.read_str()?,
            },
            12 => ClientMessage::VoiceLeave {
                project_id: r.read_str()?,
            },
            13 => ClientMessage::Ping {
                timestamp: r.read_u64()?,
            },
            other => return Err(WireError::UnknownTag(other)),
        };
        r.finish()?;
        Ok(msg)
    }
}

/// Messages the server sends to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    Welcome {
        protocol_version: u8,
        peer_id: String,
        color: String,
        session_token: String,
        server_time: i64,
    },
    Error {
        code: ErrorCode,
        message: String,
        project_id: Option<String>,
    },
    Goodbye {
        reason: Option<String>,
    },
    ProjectJoined {
        project_id: String,
        peers: Vec<PeerInfo>,
        document_state: Option<Vec<u8>>,
    },
    PeerJoined {
        project_id: String,
        peer: PeerInfo,
    },
    ProjectLeft {
        project_id: String,
    },
    PeerLeft {
        project_id: String,
        peer_id: String,
        reason: Option<String>,
    },
    SyncMessage {
        project_id: String,
        sync_data: Vec<u8>,
        from_peer: Option<String>,
    },
    SyncComplete {
        project_id: String,
    },
    FileContent {
        project_id: String,
        file_path: String,
        content: String,
        language: String,
        version: u64,
    },
    FileNotFound {
        project_id: String,
        file_path: String,
    },
    CursorBroadcast {
        project_id: String,
        peer_id: String,
        peer_name: String,
        peer_color: String,
        file_path: String,
        line: u32,
        column: u32,
        selection_end: Option<(u32, u32)>,
    },
    PresenceBroadcast {
        project_id: String,
        peer_id: String,
        peer_name: String,
        status: PresenceStatus,
        active_file: Option<String>,
        last_active: i64,
    },
    ChatBroadcast {
        project_id: String,
        peer_id: String,
        peer_name: String,
        content: String,
        timestamp: i64,
    },
    ChatHistory {
        project_id: String,
        messages: Vec<ChatEntry>,
    },
    VoiceToken {
        project_id: String,
        token: String,
        room_name: String,
        server_url: String,
    },
    Pong {
        timestamp: u64,
        server_time: i64,
    },
    Stats {
        active_projects: u32,
        active_peers: u32,
        uptime_seconds: u64,
    },
}

impl ServerMessage {
    pub fn tag(&self) -> u32 {
        match self {
            ServerMessage::Welcome { .. } => 0,
            ServerMessage::Error { .. } => 1,
            ServerMessage::Goodbye { .. } => 2,
            ServerMessage::ProjectJoined { .. } => 3,
            ServerMessage::PeerJoined { .. } => 4,
            ServerMessage::ProjectLeft { .. } => 5,
            ServerMessage::PeerLeft { .. } => 6,
            ServerMessage::SyncMessage { .. } => 7,
            ServerMessage::SyncComplete { .. } => 8,
            ServerMessage::FileContent { .. } => 9,
            ServerMessage::FileNotFound { .. } => 10,
            ServerMessage::CursorBroadcast { .. } => 11,
            ServerMessage::PresenceBroadcast { .. } => 12,
            ServerMessage::ChatBroadcast { .. } => 13,
            ServerMessage::ChatHistory { .. } => 14,
            ServerMessage::VoiceToken { .. } => 15,
            ServerMessage::Pong { .. } => 16,
            ServerMessage::Stats { .. } => 17,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.write_u32(self.tag());
        match self {
            ServerMessage::Welcome {
                protocol_version,
                peer_id,
                color,
                session_token,
                server_time,
            } => {
                w.write_u8(*protocol_version);
                w.write_str(peer_id);
                w.write_str(color);
                w.write_str(session_token);
                w.write_i64(*server_time);
            }
            ServerMessage::Error {
                code,
                message,
                project_id,
            } => {
                w.write_u16(code.as_u16());
                w.write_str(message);
                w.write_opt_str(project_id.as_deref());
            }
            ServerMessage::Goodbye { reason } => w.write_opt_str(reason.as_deref()),
            ServerMessage::ProjectJoined {
                project_id,
                peers,
                document_state,
            } => {
                w.write_str(project_id);
                w.write_seq(peers, |w, p| p.write(w));
                w.write_opt(document_state.as_ref(), |w, b| w.write_bytes(b));
            }
            ServerMessage::PeerJoined { project_id, peer } => {
                w.write_str(project_id);
                peer.write(&mut w);
            }
            ServerMessage::ProjectLeft { project_id }
            | ServerMessage::SyncComplete { project_id } => w.write_str(project_id),
            ServerMessage::PeerLeft {
                project_id,
                peer_id,
                reason,
            } => {
                w.write_str(project_id);
                w.write_str(peer_id);
                w.write_opt_str(reason.as_deref());
            }
            ServerMessage::SyncMessage {
                project_id,
                sync_data,
                from_peer,
            } => {
                w.write_str(project_id);
                w.write_bytes(sync_data);
                w.write_opt_str(from_peer.as_deref());
            }
            ServerMessage::FileContent {
                project_id,
                file_path,
                content,
                language,
                version,
            } => {
                w.write_str(project_id);
                w.write_str(file_path);
                w.write_str(content);
                w.write_str(language);
                w.write_u64(*version);
            }
            ServerMessage::FileNotFound {
                project_id,
                file_path,
            } => {
                w.write_str(project_id);
                w.write_str(file_path);
            }
            ServerMessage::CursorBroadcast {
                project_id,
                peer_id,
                peer_name,
                peer_color,
                file_path,
                line,
                column,
                selection_end,
            } => {
                w.write_str(project_id);
                w.write_str(peer_id);
                w.write_str(peer_name);
                w.write_str(peer_color);
                w.write_str(file_path);
                w.write_u32(*line);
                w.write_u32(*column);
                w.write_opt(selection_end.as_ref(), write_sel);
            }
            ServerMessage::PresenceBroadcast {
                project_id,
                peer_id,
                peer_name,
                status,
                active_file,
                last_active,
            } => {
                w.write_str(project_id);
                w.write_str(peer_id);
                w.write_str(peer_name);
                w.write_u8(status.as_u8());
                w.write_opt_str(active_file.as_deref());
                w.write_i64(*last_active);
            }
            ServerMessage::ChatBroadcast {
                project_id,
                peer_id,
                peer_name,
                content,
                timestamp,
            } => {
                w.write_str(project_id);
                w.write_str(peer_id);
                w.write_str(peer_name);
                w.write_str(content);
                w.write_i64(*timestamp);
            }
            ServerMessage::ChatHistory {
                project_id,
                messages,
            } => {
                w.write_str(project_id);
                w.write_seq(messages, |w, m| m.write(w));
            }
            ServerMessage::VoiceToken {
                project_id,
                token,
                room_name,
                server_url,
            } => {
                w.write_str(project_id);
                w.write_str(token);
                w.write_str(room_name);
                w.write_str(server_url);
            }
            ServerMessage::Pong {
                timestamp,
                server_time,
            } => {
                w.write_u64(*timestamp);
                w.write_i64(*server_time);
            }
            ServerMessage::Stats {
                active_projects,
                active_peers,
                uptime_seconds,
            } => {
                w.write_u32(*active_projects);
                w.write_u32(*active_peers);
                w.write_u64(*uptime_seconds);
            }
        }
        w.into_bytes()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let mut r = WireReader::new(buf);
        let tag = r.read_u32()?;
        let msg = match tag {
            0 => ServerMessage::Welcome {
                protocol_version: r.read_u8()?,
                peer_id: r.read_str()?,
                color: r.read_str()?,
                session_token: r.read_str()?,
                server_time: r.read_i64()?,
            },
            1 => ServerMessage::Error {
                code: ErrorCode::from_u16(r.read_u16()?),
                message: r.read_str()?,
                project_id: r.read_opt_str()?,
            },
            2 => ServerMessage::Goodbye {
                reason: r.read_opt_str()?,
            },
            3 => ServerMessage::ProjectJoined {
                project_id: r.read_str()?,
                peers: r.read_seq(PeerInfo::read)?,
                document_state: r.read_opt(WireReader::read_bytes)?,
            },
            4 => ServerMessage::PeerJoined {
                project_id: r.read_str()?,
                peer: PeerInfo::read(&mut r)?,
            },
            5 => ServerMessage::ProjectLeft {
                project_id: r.read_str()?,
            },
            6 => ServerMessage::PeerLeft {
                project_id: r.read_str()?,
                peer_id: r.read_str()?,
                reason: r.read_opt_str()?,
            },
            7 => ServerMessage::SyncMessage {
                project_id: r.read_str()?,
                sync_data: r.read_bytes()?,
                from_peer: r.read_opt_str()?,
            },
            8 => ServerMessage::SyncComplete {
                project_id: r.read_str()?,
            },
            9 => ServerMessage::FileContent {
                project_id: r.read_str()?,
                file_path: r.read_str()?,
                content: r.read_str()?,
                language: r.read_str()?,
                version: r.read_u64()?,
            },
            10 => ServerMessage::FileNotFound {
                project_id: r.read_str()?,
                file_path: r.read_str()?,
            },
            11 => ServerMessage::CursorBroadcast {
                project_id: r.read_str()?,
                peer_id: r.read_str()?,
                peer_name: r.read_str()?,
                peer_color: r.read_str()?,
                file_path: r.read_str()?,
                line: r.read_u32()?,
                column: r.read_u32()?,
                selection_end: r.read_opt(read_sel)?,
            },
            12 => ServerMessage::PresenceBroadcast {
                project_id: r.read_str()?,
                peer_id: r.read_str()?,
                peer_name: r.read_str()?,
                status: PresenceStatus::from_u8(r.read_u8()?)?,
                active_file: r.read_opt_str()?,
                last_active: r.read_i64()?,
            },
            13 => ServerMessage::ChatBroadcast {
                project_id: r.read_str()?,
                peer_id: r.read_str()?,
                peer_name: r.read_str()?,
                content: r.read_str()?,
                timestamp: r.read_i64()?,
            },
            14 => ServerMessage::ChatHistory {
                project_id: r.read_str()?,
                messages: r.read_seq(ChatEntry::read)?,
            },
            15 => ServerMessage::VoiceToken {
                project_id: r.read_str()?,
                token: r.read_str()?,
                room_name: r.read_str()?,
                server_url: r.read_str()?,
            },
            16 => ServerMessage::Pong {
                timestamp: r.read_u64()?,
                server_time: r.read_i64()?,
            },
            17 => ServerMessage::Stats {
                active_projects: r.read_u32()?,
                active_peers: r.read_u32()?,
                uptime_seconds: r.read_u64()?,
            },
            other => return Err(WireError::UnknownTag(other)),
        };
        r.finish()?;
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;

    fn sample_peer() -> PeerInfo {
        PeerInfo {
            peer_id: "p-1".into(),
            display_name: "alice".into(),
            color: "#e06c75".into(),
            joined_at: 1_700_000_000,
            last_active: 1_700_000_060,
            status: PresenceStatus::Active,
            active_file: Some("src/main.rs".into()),
        }
    }

    fn client_samples() -> Vec<ClientMessage> {
        vec![
            ClientMessage::Hello {
                protocol_version: 1,
                client_id: None,
                client_name: "ed".into(),
                session_token: Some("tok".into()),
            },
            ClientMessage::Goodbye { reason: None },
            ClientMessage::JoinProject {
                project_id: "proj".into(),
                request_state: true,
            },
            ClientMessage::LeaveProject {
                project_id: "proj".into(),
            },
            ClientMessage::SyncMessage {
                project_id: "proj".into(),
                sync_data: vec![1, 2, 3],
            },
            ClientMessage::SyncRequest {
                project_id: "proj".into(),
            },
            ClientMessage::OpenFile {
                project_id: "proj".into(),
                file_path: "src/lib.rs".into(),
            },
            ClientMessage::CloseFile {
                project_id: "proj".into(),
                file_path: "src/lib.rs".into(),
            },
            ClientMessage::CursorUpdate {
                project_id: "proj".into(),
                file_path: "src/lib.rs".into(),
                line: 10,
                column: 4,
                selection_end: Some((12, 1)),
            },
            ClientMessage::PresenceUpdate {
                project_id: "proj".into(),
                status: PresenceStatus::Away,
                active_file: None,
            },
            ClientMessage::ChatMessage {
                project_id: "proj".into(),
                content: "hi".into(),
            },
            ClientMessage::VoiceJoin {
                project_id: "proj".into(),
            },
            ClientMessage::VoiceLeave {
                project_id: "proj".into(),
            },
            ClientMessage::Ping { timestamp: 123 },
        ]
    }

    fn server_samples() -> Vec<ServerMessage> {
        vec![
            ServerMessage::Welcome {
                protocol_version: 1,
                peer_id: "p-1".into(),
                color: "#61afef".into(),
                session_token: "tok".into(),
                server_time: 1_700_000_000_000,
            },
            ServerMessage::Error {
                code: ErrorCode::NotJoined,
                message: "join a project first".into(),
                project_id: None,
            },
            ServerMessage::Goodbye {
                reason: Some("bye".into()),
            },
            ServerMessage::ProjectJoined {
                project_id: "proj".into(),
                peers: vec![sample_peer()],
                document_state: Some(vec![9, 9, 9]),
            },
            ServerMessage::PeerJoined {
                project_id: "proj".into(),
                peer: sample_peer(),
            },
            ServerMessage::ProjectLeft {
                project_id: "proj".into(),
            },
            ServerMessage::PeerLeft {
                project_id: "proj".into(),
                peer_id: "p-1".into(),
                reason: None,
            },
            ServerMessage::SyncMessage {
                project_id: "proj".into(),
                sync_data: vec![4, 5],
                from_peer: Some("p-2".into()),
            },
            ServerMessage::SyncComplete {
                project_id: "proj".into(),
            },
            ServerMessage::FileContent {
                project_id: "proj".into(),
                file_path: "main.rs".into(),
                content: "fn main() {}".into(),
                language: "rust".into(),
                version: 3,
            },
            ServerMessage::FileNotFound {
                project_id: "proj".into(),
                file_path: "nope.rs".into(),
            },
            ServerMessage::CursorBroadcast {
                project_id: "proj".into(),
                peer_id: "p-2".into(),
                peer_name: "bob".into(),
                peer_color: "#98c379".into(),
                file_path: "main.rs".into(),
                line: 10,
                column: 4,
                selection_end: None,
            },
            ServerMessage::PresenceBroadcast {
                project_id: "proj".into(),
                peer_id: "p-2".into(),
                peer_name: "bob".into(),
                status: PresenceStatus::Idle,
                active_file: Some("main.rs".into()),
                last_active: 1_700_000_000,
            },
            ServerMessage::ChatBroadcast {
                project_id: "proj".into(),
                peer_id: "p-2".into(),
                peer_name: "bob".into(),
                content: "hello".into(),
                timestamp: 1_700_000_000_100,
            },
            ServerMessage::ChatHistory {
                project_id: "proj".into(),
                messages: vec![ChatEntry {
                    peer_id: "p-2".into(),
                    display_name: "bob".into(),
                    content: "hello".into(),
                    server_timestamp: 1_700_000_000_100,
                }],
            },
            ServerMessage::VoiceToken {
                project_id: "proj".into(),
                token: "jwt".into(),
                room_name: "atelier-proj".into(),
                server_url: "wss://livekit.example".into(),
            },
            ServerMessage::Pong {
                timestamp: 123,
                server_time: 456,
            },
            ServerMessage::Stats {
                active_projects: 2,
                active_peers: 5,
                uptime_seconds: 3600,
            },
        ]
    }

    #[test]
    fn client_roundtrip_every_variant() {
        for msg in client_samples() {
            let decoded = ClientMessage::decode(&msg.encode()).expect("decode");
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn server_roundtrip_every_variant() {
        for msg in server_samples() {
            let decoded = ServerMessage::decode(&msg.encode()).expect("decode");
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn tags_are_stable() {
        let client_tags: Vec<u32> = client_samples().iter().map(ClientMessage::tag).collect();
        assert_eq!(client_tags, (0..14).collect::<Vec<u32>>());
        let server_tags: Vec<u32> = server_samples().iter().map(ServerMessage::tag).collect();
        assert_eq!(server_tags, (0..18).collect::<Vec<u32>>());
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut w = WireWriter::new();
        w.write_u32(99);
        assert_eq!(
            ClientMessage::decode(&w.into_bytes()),
            Err(WireError::UnknownTag(99))
        );
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = ClientMessage::Ping { timestamp: 1 }.encode();
        bytes.push(0);
        assert_eq!(
            ClientMessage::decode(&bytes),
            Err(WireError::TrailingBytes(1))
        );
    }

    #[test]
    fn unknown_error_code_degrades_to_unknown() {
        assert_eq!(ErrorCode::from_u16(999), ErrorCode::Unknown);
        for code in 0..=10u16 {
            assert_eq!(ErrorCode::from_u16(code).as_u16(), code);
        }
    }

    #[test]
    fn status_rejects_out_of_range() {
        assert_eq!(PresenceStatus::from_u8(4), Err(WireError::UnknownStatus(4)));
    }

    #[test]
    fn message_travels_inside_frame() {
        let msg = ClientMessage::SyncMessage {
            project_id: "proj".into(),
            sync_data: vec![7; 32],
        };
        let frame_bytes = Frame::encode(msg.tag() as u8, &msg.encode()).unwrap();
        let frame = Frame::decode(&frame_bytes).unwrap();
        assert_eq!(frame.msg_type as u32, msg.tag());
        assert_eq!(ClientMessage::decode(&frame.payload).unwrap(), msg);
    }
}
