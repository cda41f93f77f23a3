//! One connection per client socket.
//!
//! The socket is split into a read half driven here and a write half
//! owned by a spawned write loop draining the outbound queue. The read
//! side walks the handshake state machine (`NEW -> WAITING_JOIN ->
//! JOINED -> CLOSED`): `Hello` within 10 s, then `JoinProject` binds the
//! connection to the room named in the upgrade path, then room-scoped
//! traffic until `Goodbye`, an error, or silence past the idle window.
//!
//! Errors follow the taxonomy: protocol corruption and backlog overflow
//! close the stream; client-state and room errors answer the one
//! operation and keep it open.

use std::sync::atomic::{AtomicUsize, Ordering};

use axum::extract::ws::{Message, WebSocket};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use log::{debug, info, warn};
use tokio::time::timeout;
use uuid::Uuid;

use atelier_proto::{
    ClientMessage, ErrorCode, Frame, FrameDecoder, PROTOCOL_VERSION, ServerMessage,
};

use crate::config::limits;
use crate::error::ServerError;
use crate::now_ms;
use crate::presence::CursorRecord;
use crate::room::{JoinArgs, Outbound, OutboundReceiver, RoomHandle};
use crate::server::AppState;
use crate::store::validate_project_id;

/// Stable palette; a peer's color is keyed by its connection index.
const PEER_COLORS: &[&str] = &[
    "#e06c75", "#61afef", "#98c379", "#c678dd", "#d19a66", "#56b6c2", "#e5c07b", "#abb2bf",
];

/// Monotonic connection counter, for colors and log prefixes.
static PEER_COUNTER: AtomicUsize = AtomicUsize::new(0);

struct Identity {
    peer_id: String,
    display_name: String,
    color: String,
}

/// Drive one upgraded socket to completion.
pub async fn serve_socket(socket: WebSocket, project_path: String, state: AppState) {
    let log_id = PEER_COUNTER.fetch_add(1, Ordering::Relaxed);
    let (ws_tx, ws_rx) = socket.split();
    let (outbound, outbound_rx) = Outbound::channel();

    let write_task = tokio::spawn(write_loop(ws_tx, outbound_rx, log_id));

    let mut conn = Connection {
        log_id,
        project_path,
        state,
        outbound,
        decoder: FrameDecoder::new(),
        identity: None,
        room: None,
    };
    conn.run(ws_rx).await;

    let identity = conn.identity.take();
    let room = conn.room.take();
    // Drop our queue handle so the write loop drains and exits once the
    // room releases its own clone.
    drop(conn);
    if let (Some(identity), Some(room)) = (identity, room) {
        room.leave(&identity.peer_id, Some("disconnected".to_string()))
            .await;
    }
    let _ = write_task.await;
    debug!("[conn:{log_id}] torn down");
}

/// Write half: outbound frames, close requests, and the ping heartbeat.
async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut rx: OutboundReceiver,
    log_id: usize,
) {
    let mut ping = tokio::time::interval(limits::PING_INTERVAL);
    ping.tick().await; // immediate first tick is not a heartbeat
    let mut close_gone = false;
    loop {
        tokio::select! {
            frame = rx.frames.recv() => match frame {
                Some(bytes) => {
                    let len = bytes.len();
                    if ws_tx.send(Message::Binary(bytes.into())).await.is_err() {
                        break;
                    }
                    rx.mark_sent(len);
                }
                None => {
                    // A close request buffered just before the senders
                    // dropped still owes the client its Error frame.
                    if let Ok(reason) = rx.close.try_recv() {
                        send_error_and_close(&mut ws_tx, reason, log_id).await;
                    }
                    break;
                }
            },
            reason = rx.close.recv(), if !close_gone => match reason {
                Some(reason) => {
                    send_error_and_close(&mut ws_tx, reason, log_id).await;
                    break;
                }
                None => close_gone = true,
            },
            _ = ping.tick() => {
                if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }
    let _ = ws_tx.close().await;
}

async fn send_error_and_close(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    (code, message): (ErrorCode, String),
    log_id: usize,
) {
    warn!("[conn:{log_id}] closing: {message}");
    let msg = ServerMessage::Error {
        code,
        message,
        project_id: None,
    };
    if let Ok(frame) = Frame::encode(msg.tag() as u8, &msg.encode()) {
        let _ = ws_tx.send(Message::Binary(frame.into())).await;
    }
    let _ = ws_tx.send(Message::Close(None)).await;
}

struct Connection {
    log_id: usize,
    /// Project named in the upgrade path; `JoinProject` must match it.
    project_path: String,
    state: AppState,
    outbound: Outbound,
    decoder: FrameDecoder,
    identity: Option<Identity>,
    room: Option<RoomHandle>,
}

impl Connection {
    async fn run(&mut self, mut ws_rx: SplitStream<WebSocket>) {
        // NEW: nothing but Hello, and soon.
        let hello = match timeout(limits::HANDSHAKE_TIMEOUT, self.next_message(&mut ws_rx)).await
        {
            Err(_) => {
                self.close_with(ServerError::HandshakeTimeout);
                return;
            }
            Ok(Ok(Some(msg))) => msg,
            Ok(Ok(None)) => return,
            Ok(Err(e)) => {
                self.close_with(e);
                return;
            }
        };
        if let Err(e) = self.handle_hello(hello) {
            self.close_with(e);
            return;
        }

        // WAITING_JOIN / JOINED until the peer goes away.
        loop {
            let msg = match timeout(limits::IDLE_TIMEOUT, self.next_message(&mut ws_rx)).await {
                Err(_) => {
                    self.close_with(ServerError::StaleConnection);
                    return;
                }
                Ok(Ok(Some(msg))) => msg,
                Ok(Ok(None)) => return,
                Ok(Err(e)) => {
                    self.close_with(e);
                    return;
                }
            };
            match self.dispatch(msg).await {
                Ok(done) => {
                    if done {
                        return;
                    }
                }
                Err(e) if e.is_fatal() => {
                    self.close_with(e);
                    return;
                }
                Err(e) => {
                    debug!("[conn:{}] request failed: {e}", self.log_id);
                    let _ = self.outbound.push(&ServerMessage::Error {
                        code: e.code(),
                        message: e.to_string(),
                        project_id: self.room.as_ref().map(|r| r.project_id().to_string()),
                    });
                }
            }
        }
    }

    /// Next protocol message off the socket. `Ok(None)` means the peer is
    /// gone; errors are protocol-fatal.
    async fn next_message(
        &mut self,
        ws_rx: &mut SplitStream<WebSocket>,
    ) -> Result<Option<ClientMessage>, ServerError> {
        loop {
            if let Some(frame) = self.decoder.next_frame()? {
                let msg = ClientMessage::decode(&frame.payload)?;
                if msg.tag() as u8 != frame.msg_type {
                    return Err(ServerError::FrameTagMismatch {
                        frame: frame.msg_type,
                        payload: msg.tag(),
                    });
                }
                return Ok(Some(msg));
            }
            match ws_rx.next().await {
                Some(Ok(Message::Binary(bytes))) => self.decoder.feed(&bytes),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Text(_))) => {
                    warn!("[conn:{}] text message on a binary stream", self.log_id);
                }
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Err(e)) => {
                    debug!("[conn:{}] socket error: {e}", self.log_id);
                    return Ok(None);
                }
            }
        }
    }

    fn handle_hello(&mut self, msg: ClientMessage) -> Result<(), ServerError> {
        let ClientMessage::Hello {
            protocol_version,
            client_id: _,
            client_name,
            session_token,
        } = msg
        else {
            return Err(ServerError::Wire(atelier_proto::WireError::UnknownTag(
                msg.tag(),
            )));
        };
        if protocol_version != PROTOCOL_VERSION {
            return Err(ServerError::ProtocolVersion(protocol_version));
        }

        // A valid session token restores the prior identity and is echoed
        // back unchanged; otherwise a fresh identity is minted.
        let restored = session_token
            .as_deref()
            .and_then(|t| self.state.sessions.verify(t).map(|id| (id, t.to_string())));
        let (peer_id, color, token) = match restored {
            Some(((peer_id, color), token)) => {
                debug!("[conn:{}] session resumed as {peer_id}", self.log_id);
                (peer_id, color, token)
            }
            None => {
                let peer_id = Uuid::new_v4().to_string();
                let color = PEER_COLORS[self.log_id % PEER_COLORS.len()].to_string();
                let token = self.state.sessions.issue(&peer_id, &color);
                (peer_id, color, token)
            }
        };

        info!(
            "[conn:{}] hello from '{client_name}' as {peer_id}",
            self.log_id
        );
        let _ = self.outbound.push(&ServerMessage::Welcome {
            protocol_version: PROTOCOL_VERSION,
            peer_id: peer_id.clone(),
            color: color.clone(),
            session_token: token,
            server_time: now_ms(),
        });
        let _ = self.outbound.push(&self.state.stats_message());

        self.identity = Some(Identity {
            peer_id,
            display_name: client_name,
            color,
        });
        Ok(())
    }

    /// Returns `Ok(true)` when the connection should wind down cleanly.
    async fn dispatch(&mut self, msg: ClientMessage) -> Result<bool, ServerError> {
        match msg {
            ClientMessage::Hello { .. } => Err(ServerError::DuplicateHello),
            ClientMessage::Goodbye { reason } => {
                info!(
                    "[conn:{}] goodbye{}",
                    self.log_id,
                    reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default()
                );
                let _ = self.outbound.push(&ServerMessage::Goodbye { reason: None });
                Ok(true)
            }
            ClientMessage::JoinProject {
                project_id,
                request_state,
            } => {
                self.handle_join(project_id, request_state).await?;
                Ok(false)
            }
            // Everything below requires JOINED.
            other => {
                let Some(room) = self.room.clone() else {
                    return Err(ServerError::NotJoined);
                };
                let peer_id = self
                    .identity
                    .as_ref()
                    .map(|i| i.peer_id.clone())
                    .ok_or(ServerError::NotJoined)?;
                if let Some(project) = other.project_id()
                    && project != room.project_id()
                {
                    return Err(ServerError::ProjectMismatch {
                        expected: room.project_id().to_string(),
                        got: project.to_string(),
                    });
                }

                match other {
                    ClientMessage::LeaveProject { .. } => {
                        room.leave(&peer_id, Some("left project".to_string())).await;
                        let _ = self.outbound.push(&ServerMessage::ProjectLeft {
                            project_id: room.project_id().to_string(),
                        });
                        self.room = None;
                        Ok(false)
                    }
                    ClientMessage::SyncMessage { sync_data, .. } => {
                        room.sync(&peer_id, sync_data).await?;
                        Ok(false)
                    }
                    ClientMessage::SyncRequest { .. } => {
                        room.sync_request(&peer_id).await?;
                        Ok(false)
                    }
                    ClientMessage::OpenFile { file_path, .. } => {
                        room.open_file(&peer_id, file_path).await?;
                        Ok(false)
                    }
                    ClientMessage::CloseFile { file_path, .. } => {
                        room.close_file(&peer_id, file_path).await?;
                        Ok(false)
                    }
                    ClientMessage::CursorUpdate {
                        file_path,
                        line,
                        column,
                        selection_end,
                        ..
                    } => {
                        room.cursor(
                            &peer_id,
                            CursorRecord {
                                file_path,
                                line,
                                column,
                                selection_end,
                            },
                        )
                        .await?;
                        Ok(false)
                    }
                    ClientMessage::PresenceUpdate {
                        status,
                        active_file,
                        ..
                    } => {
                        room.presence(&peer_id, status, active_file).await?;
                        Ok(false)
                    }
                    ClientMessage::ChatMessage { content, .. } => {
                        room.chat(&peer_id, content).await?;
                        Ok(false)
                    }
                    ClientMessage::VoiceJoin { .. } => {
                        room.voice_join(&peer_id).await?;
                        Ok(false)
                    }
                    ClientMessage::VoiceLeave { .. } => {
                        room.voice_leave(&peer_id).await?;
                        Ok(false)
                    }
                    ClientMessage::Ping { timestamp } => {
                        let _ = self.outbound.push(&ServerMessage::Pong {
                            timestamp,
                            server_time: now_ms(),
                        });
                        Ok(false)
                    }
                    ClientMessage::Hello { .. }
                    | ClientMessage::Goodbye { .. }
                    | ClientMessage::JoinProject { .. } => unreachable!("handled above"),
                }
            }
        }
    }

    async fn handle_join(
        &mut self,
        project_id: String,
        request_state: bool,
    ) -> Result<(), ServerError> {
        if let Some(room) = &self.room {
            return Err(ServerError::AlreadyJoined(room.project_id().to_string()));
        }
        let identity = self.identity.as_ref().ok_or(ServerError::NotJoined)?;
        if project_id != self.project_path {
            return Err(ServerError::ProjectMismatch {
                expected: self.project_path.clone(),
                got: project_id,
            });
        }
        if !validate_project_id(&project_id) {
            return Err(ServerError::InvalidProjectId(project_id));
        }

        // A room evicted between lookup and join answers RoomClosed once;
        // reopening from the store is then authoritative.
        let mut attempts = 0;
        loop {
            let room = self.state.rooms.get_or_open(&project_id).await?;
            let result = room
                .join(JoinArgs {
                    peer_id: identity.peer_id.clone(),
                    display_name: identity.display_name.clone(),
                    color: identity.color.clone(),
                    want_state: request_state,
                    outbound: self.outbound.clone(),
                })
                .await;
            match result {
                Ok(()) => {
                    self.room = Some(room);
                    return Ok(());
                }
                Err(ServerError::RoomClosed) if attempts == 0 => {
                    attempts += 1;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Report a fatal error through the write loop and stop reading.
    fn close_with(&mut self, err: ServerError) {
        warn!("[conn:{}] fatal: {err}", self.log_id);
        self.outbound.request_close(err.code(), &err.to_string());
    }
}
