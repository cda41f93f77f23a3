//! Per-project room: the only mutator of a document.
//!
//! A room is a task fed by a bounded command mailbox. Connections submit
//! commands and get results over oneshot channels; everything addressed to
//! a client (replies and fan-out alike) flows through that client's
//! bounded outbound queue, so a connection observes messages in exactly
//! the order the room enqueued them. A subscriber whose queue overflows
//! is disconnected with `RateLimited`; the publisher is never blocked.
//!
//! The room also owns the persistence discipline: a sync payload is
//! imported, durably appended to the change log, and only then fanned
//! out. No-ops are neither persisted nor broadcast.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use atelier_proto::{ChatEntry, ErrorCode, Frame, PresenceStatus, ServerMessage};
use log::{debug, error, info, warn};
use tokio::sync::{RwLock, mpsc, oneshot};
use tokio::time::sleep_until;

use crate::config::{Config, far_future, limits};
use crate::document::{PeerSyncState, ProjectDocument};
use crate::error::ServerError;
use crate::now_ms;
use crate::presence::{CursorRecord, PresenceTable};
use crate::server::ServerCounters;
use crate::store::{ProjectMeta, Store};
use crate::voice::CredentialIssuer;

/// Shared map of open rooms, owned by the server registry.
pub type RoomMap = Arc<RwLock<HashMap<String, RoomHandle>>>;

/// Sending half of one connection's outbound queue. The room pushes
/// pre-framed bytes; the connection's write loop drains them.
#[derive(Clone)]
pub struct Outbound {
    frames: mpsc::Sender<Vec<u8>>,
    close: mpsc::Sender<(ErrorCode, String)>,
    bytes: Arc<AtomicUsize>,
}

/// Receiving half, held by the connection's write loop.
pub struct OutboundReceiver {
    pub frames: mpsc::Receiver<Vec<u8>>,
    pub close: mpsc::Receiver<(ErrorCode, String)>,
    bytes: Arc<AtomicUsize>,
}

impl Outbound {
    pub fn channel() -> (Outbound, OutboundReceiver) {
        let (frames_tx, frames_rx) = mpsc::channel(limits::OUTBOUND_QUEUE_MSGS);
        let (close_tx, close_rx) = mpsc::channel(1);
        let bytes = Arc::new(AtomicUsize::new(0));
        (
            Outbound {
                frames: frames_tx,
                close: close_tx,
                bytes: Arc::clone(&bytes),
            },
            OutboundReceiver {
                frames: frames_rx,
                close: close_rx,
                bytes,
            },
        )
    }

    /// Enqueue one message. `Err(RateLimited)` means the subscriber blew
    /// its high-water mark and must be disconnected.
    pub fn push(&self, msg: &ServerMessage) -> Result<(), ServerError> {
        let frame = Frame::encode(msg.tag() as u8, &msg.encode())?;
        let len = frame.len();
        if self.bytes.load(Ordering::Relaxed) + len > limits::OUTBOUND_QUEUE_BYTES {
            return Err(ServerError::RateLimited);
        }
        match self.frames.try_send(frame) {
            Ok(()) => {
                self.bytes.fetch_add(len, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(ServerError::RateLimited),
            // Receiver already tearing down; its Leave is on the way.
            Err(mpsc::error::TrySendError::Closed(_)) => Ok(()),
        }
    }

    /// Ask the write loop to report `code` and close the stream.
    pub fn request_close(&self, code: ErrorCode, message: &str) {
        let _ = self.close.try_send((code, message.to_string()));
    }
}

impl OutboundReceiver {
    /// The write loop calls this after a frame leaves the socket.
    pub fn mark_sent(&self, frame_len: usize) {
        self.bytes.fetch_sub(frame_len, Ordering::Relaxed);
    }
}

/// Everything a room needs to seat a joining peer.
pub struct JoinArgs {
    pub peer_id: String,
    pub display_name: String,
    pub color: String,
    pub want_state: bool,
    pub outbound: Outbound,
}

type Reply = oneshot::Sender<Result<(), ServerError>>;

pub enum RoomCommand {
    Join {
        args: JoinArgs,
        reply: Reply,
    },
    Leave {
        peer_id: String,
        reason: Option<String>,
    },
    Sync {
        peer_id: String,
        payload: Vec<u8>,
        reply: Reply,
    },
    SyncRequest {
        peer_id: String,
        reply: Reply,
    },
    OpenFile {
        peer_id: String,
        file_path: String,
        reply: Reply,
    },
    CloseFile {
        peer_id: String,
        file_path: String,
        reply: Reply,
    },
    Cursor {
        peer_id: String,
        cursor: CursorRecord,
        reply: Reply,
    },
    Presence {
        peer_id: String,
        status: PresenceStatus,
        active_file: Option<String>,
        reply: Reply,
    },
    Chat {
        peer_id: String,
        content: String,
        reply: Reply,
    },
    VoiceJoin {
        peer_id: String,
        reply: Reply,
    },
    VoiceLeave {
        peer_id: String,
        reply: Reply,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

impl RoomCommand {
    /// Answer a drained command during shutdown.
    fn fail(self, err: ServerError) {
        match self {
            RoomCommand::Join { reply, .. }
            | RoomCommand::Sync { reply, .. }
            | RoomCommand::SyncRequest { reply, .. }
            | RoomCommand::OpenFile { reply, .. }
            | RoomCommand::CloseFile { reply, .. }
            | RoomCommand::Cursor { reply, .. }
            | RoomCommand::Presence { reply, .. }
            | RoomCommand::Chat { reply, .. }
            | RoomCommand::VoiceJoin { reply, .. }
            | RoomCommand::VoiceLeave { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            RoomCommand::Leave { .. } => {}
            RoomCommand::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }
}

/// Cheap handle for submitting commands to a room task.
#[derive(Clone, Debug)]
pub struct RoomHandle {
    project_id: String,
    tx: mpsc::Sender<RoomCommand>,
}

impl RoomHandle {
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn send(&self, cmd: RoomCommand) -> Result<(), ServerError> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| ServerError::RoomClosed)
    }

    async fn request(
        &self,
        make: impl FnOnce(Reply) -> RoomCommand,
    ) -> Result<(), ServerError> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx)).await?;
        rx.await.map_err(|_| ServerError::RoomClosed)?
    }

    pub async fn join(&self, args: JoinArgs) -> Result<(), ServerError> {
        self.request(|reply| RoomCommand::Join { args, reply }).await
    }

    pub async fn leave(&self, peer_id: &str, reason: Option<String>) {
        let _ = self
            .send(RoomCommand::Leave {
                peer_id: peer_id.to_string(),
                reason,
            })
            .await;
    }

    pub async fn sync(&self, peer_id: &str, payload: Vec<u8>) -> Result<(), ServerError> {
        let peer_id = peer_id.to_string();
        self.request(|reply| RoomCommand::Sync {
            peer_id,
            payload,
            reply,
        })
        .await
    }

    pub async fn sync_request(&self, peer_id: &str) -> Result<(), ServerError> {
        let peer_id = peer_id.to_string();
        self.request(|reply| RoomCommand::SyncRequest { peer_id, reply })
            .await
    }

    pub async fn open_file(&self, peer_id: &str, file_path: String) -> Result<(), ServerError> {
        let peer_id = peer_id.to_string();
        self.request(|reply| RoomCommand::OpenFile {
            peer_id,
            file_path,
            reply,
        })
        .await
    }

    pub async fn close_file(&self, peer_id: &str, file_path: String) -> Result<(), ServerError> {
        let peer_id = peer_id.to_string();
        self.request(|reply| RoomCommand::CloseFile {
            peer_id,
            file_path,
            reply,
        })
        .await
    }

    pub async fn cursor(&self, peer_id: &str, cursor: CursorRecord) -> Result<(), ServerError> {
        let peer_id = peer_id.to_string();
        self.request(|reply| RoomCommand::Cursor {
            peer_id,
            cursor,
            reply,
        })
        .await
    }

    pub async fn presence(
        &self,
        peer_id: &str,
        status: PresenceStatus,
        active_file: Option<String>,
    ) -> Result<(), ServerError> {
        let peer_id = peer_id.to_string();
        self.request(|reply| RoomCommand::Presence {
            peer_id,
            status,
            active_file,
            reply,
        })
        .await
    }

    pub async fn chat(&self, peer_id: &str, content: String) -> Result<(), ServerError> {
        let peer_id = peer_id.to_string();
        self.request(|reply| RoomCommand::Chat {
            peer_id,
            content,
            reply,
        })
        .await
    }

    pub async fn voice_join(&self, peer_id: &str) -> Result<(), ServerError> {
        let peer_id = peer_id.to_string();
        self.request(|reply| RoomCommand::VoiceJoin { peer_id, reply })
            .await
    }

    pub async fn voice_leave(&self, peer_id: &str) -> Result<(), ServerError> {
        let peer_id = peer_id.to_string();
        self.request(|reply| RoomCommand::VoiceLeave { peer_id, reply })
            .await
    }

    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.send(RoomCommand::Shutdown { reply: tx }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

struct PeerSeat {
    display_name: String,
    color: String,
    outbound: Outbound,
    sync_state: PeerSyncState,
}

pub struct Room {
    project_id: String,
    config: Arc<Config>,
    store: Arc<Store>,
    voice: Arc<CredentialIssuer>,
    counters: Arc<ServerCounters>,
    rooms: RoomMap,
    handle: RoomHandle,
    rx: mpsc::Receiver<RoomCommand>,
    document: ProjectDocument,
    presence: PresenceTable,
    seats: HashMap<String, PeerSeat>,
    chat: VecDeque<ChatEntry>,
    /// Sequence the next appended change batch takes.
    next_seq: u64,
    /// Batches appended since the last successful compaction.
    batches_since_compact: usize,
    /// Appended changes not yet consolidated into a snapshot.
    dirty: bool,
    /// Set while the peer set is empty; eviction fires at the deadline.
    idle_deadline: Option<tokio::time::Instant>,
}

impl Room {
    /// Load the project from the store and spawn its command loop. Called
    /// by the registry under its write guard, so each project gets at
    /// most one live room.
    pub async fn open(
        project_id: &str,
        config: Arc<Config>,
        store: Arc<Store>,
        voice: Arc<CredentialIssuer>,
        counters: Arc<ServerCounters>,
        rooms: RoomMap,
    ) -> Result<RoomHandle, ServerError> {
        let loaded = store.load_or_init(project_id).await?;
        let chat = store.load_chat(project_id).await.unwrap_or_else(|e| {
            warn!("[room:{project_id}] chat ring failed to load: {e}");
            Vec::new()
        });
        if store.load_meta(project_id).await.ok().flatten().is_none() {
            let meta = ProjectMeta {
                project_id: project_id.to_string(),
                name: project_id.to_string(),
                created_at: now_ms(),
            };
            if let Err(e) = store.put_meta(&meta).await {
                warn!("[room:{project_id}] failed to persist project meta: {e}");
            }
        }

        let (tx, rx) = mpsc::channel(limits::ROOM_MAILBOX);
        let handle = RoomHandle {
            project_id: project_id.to_string(),
            tx,
        };
        let room = Room {
            project_id: project_id.to_string(),
            config,
            store,
            voice,
            counters,
            rooms,
            handle: handle.clone(),
            rx,
            document: loaded.document,
            presence: PresenceTable::new(),
            seats: HashMap::new(),
            chat: chat.into(),
            next_seq: loaded.next_seq,
            batches_since_compact: loaded.pending_batches,
            dirty: loaded.pending_batches > 0,
            // Opens with no peers; a prompt Join cancels the countdown.
            idle_deadline: Some(tokio::time::Instant::now() + limits::ROOM_IDLE_GRACE),
        };
        room.counters.room_opened();
        info!("[room:{project_id}] open (next_seq {})", room.next_seq);
        tokio::spawn(room.run());
        Ok(handle)
    }

    async fn run(mut self) {
        let mut flush = tokio::time::interval(limits::FLUSH_INTERVAL);
        let mut sweep = tokio::time::interval(limits::PRESENCE_SWEEP_INTERVAL);
        let mut shutdown_reply = None;

        loop {
            let idle_at = self.idle_deadline.unwrap_or_else(far_future);
            tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => {
                        if let Some(reply) = self.handle(cmd).await {
                            shutdown_reply = Some(reply);
                            break;
                        }
                    }
                    None => break,
                },
                _ = flush.tick() => self.flush().await,
                _ = sweep.tick() => self.sweep_presence().await,
                _ = sleep_until(idle_at), if self.idle_deadline.is_some() => {
                    info!("[room:{}] idle grace elapsed, evicting", self.project_id);
                    break;
                }
            }
        }

        self.close().await;
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
    }

    /// Returns the reply sender when the command was `Shutdown`.
    async fn handle(&mut self, cmd: RoomCommand) -> Option<oneshot::Sender<()>> {
        match cmd {
            RoomCommand::Join { args, reply } => {
                let _ = reply.send(self.handle_join(args).await);
            }
            RoomCommand::Leave { peer_id, reason } => {
                self.handle_leave(&peer_id, reason).await;
            }
            RoomCommand::Sync {
                peer_id,
                payload,
                reply,
            } => {
                let _ = reply.send(self.handle_sync(&peer_id, payload).await);
            }
            RoomCommand::SyncRequest { peer_id, reply } => {
                let _ = reply.send(self.handle_sync_request(&peer_id).await);
            }
            RoomCommand::OpenFile {
                peer_id,
                file_path,
                reply,
            } => {
                let _ = reply.send(self.handle_open_file(&peer_id, file_path).await);
            }
            RoomCommand::CloseFile {
                peer_id,
                file_path,
                reply,
            } => {
                let _ = reply.send(self.handle_close_file(&peer_id, &file_path).await);
            }
            RoomCommand::Cursor {
                peer_id,
                cursor,
                reply,
            } => {
                let _ = reply.send(self.handle_cursor(&peer_id, cursor).await);
            }
            RoomCommand::Presence {
                peer_id,
                status,
                active_file,
                reply,
            } => {
                let _ = reply.send(self.handle_presence(&peer_id, status, active_file).await);
            }
            RoomCommand::Chat {
                peer_id,
                content,
                reply,
            } => {
                let _ = reply.send(self.handle_chat(&peer_id, content).await);
            }
            RoomCommand::VoiceJoin { peer_id, reply } => {
                let _ = reply.send(self.handle_voice_join(&peer_id));
            }
            RoomCommand::VoiceLeave { peer_id, reply } => {
                let _ = reply.send(self.handle_voice_leave(&peer_id));
            }
            RoomCommand::Shutdown { reply } => return Some(reply),
        }
        None
    }

    async fn handle_join(&mut self, args: JoinArgs) -> Result<(), ServerError> {
        if self.seats.contains_key(&args.peer_id) {
            return Err(ServerError::AlreadyJoined(self.project_id.clone()));
        }
        if self.seats.len() >= self.config.max_peers_per_room {
            return Err(ServerError::ProjectFull(self.project_id.clone()));
        }

        let mut sync_state = match self
            .store
            .get_sync_state(&self.project_id, &args.peer_id)
            .await
        {
            Ok(Some(bytes)) => PeerSyncState::decode(&bytes).unwrap_or_default(),
            Ok(None) => PeerSyncState::new(),
            Err(e) => {
                warn!(
                    "[room:{}] sync checkpoint for {} unreadable: {e}",
                    self.project_id, args.peer_id
                );
                PeerSyncState::new()
            }
        };

        let document_state = if args.want_state {
            let snapshot = self.document.save()?;
            // The snapshot carries everything; sync starts from here.
            self.document.mark_synced(&mut sync_state);
            Some(snapshot)
        } else {
            None
        };

        let peer_info =
            self.presence
                .insert(&args.peer_id, &args.display_name, &args.color, now_ms());
        let joined = ServerMessage::ProjectJoined {
            project_id: self.project_id.clone(),
            peers: self.presence.snapshot_all(&args.peer_id),
            document_state,
        };
        let _ = args.outbound.push(&joined);
        if !self.chat.is_empty() {
            let _ = args.outbound.push(&ServerMessage::ChatHistory {
                project_id: self.project_id.clone(),
                messages: self.chat.iter().cloned().collect(),
            });
        }

        self.seats.insert(
            args.peer_id.clone(),
            PeerSeat {
                display_name: args.display_name,
                color: args.color,
                outbound: args.outbound,
                sync_state,
            },
        );
        self.counters.peer_joined();
        self.idle_deadline = None;

        info!(
            "[room:{}] {} joined ({} peer(s))",
            self.project_id,
            peer_info.peer_id,
            self.seats.len()
        );
        let peer_id_for_broadcast = peer_info.peer_id.clone();
        self.broadcast(
            Some(&peer_id_for_broadcast),
            ServerMessage::PeerJoined {
                project_id: self.project_id.clone(),
                peer: peer_info,
            },
        )
        .await;
        Ok(())
    }

    async fn handle_leave(&mut self, peer_id: &str, reason: Option<String>) {
        let Some(seat) = self.seats.remove(peer_id) else {
            return;
        };
        self.checkpoint_sync_state(peer_id, &seat.sync_state).await;
        self.presence.remove(peer_id);
        self.counters.peer_left();

        info!(
            "[room:{}] {peer_id} left ({} peer(s) remaining)",
            self.project_id,
            self.seats.len()
        );
        self.broadcast(
            None,
            ServerMessage::PeerLeft {
                project_id: self.project_id.clone(),
                peer_id: peer_id.to_string(),
                reason,
            },
        )
        .await;
        self.arm_idle_if_empty();
    }

    async fn handle_sync(&mut self, peer_id: &str, payload: Vec<u8>) -> Result<(), ServerError> {
        if !self.seats.contains_key(peer_id) {
            return Err(ServerError::NotJoined);
        }
        self.presence.touch(peer_id, now_ms());

        if self.document.size_estimate() + payload.len() > self.config.max_doc_size {
            return Err(ServerError::DocumentTooLarge);
        }

        let applied = self.document.apply_remote(&payload)?;
        if !applied {
            debug!("[room:{}] duplicate sync from {peer_id}", self.project_id);
            return Ok(());
        }

        // Durability before visibility: the batch lands on disk before any
        // peer sees its effects. On failure the document reloads from the
        // store, which equals the pre-mutation state.
        let seq = self.next_seq;
        if let Err(e) = self.store.append_changes(&self.project_id, seq, &payload).await {
            error!(
                "[room:{}] change append failed, rolling back: {e}",
                self.project_id
            );
            match self.store.load_or_init(&self.project_id).await {
                Ok(loaded) => {
                    self.document = loaded.document;
                    self.next_seq = loaded.next_seq;
                    self.batches_since_compact = loaded.pending_batches;
                }
                Err(reload) => {
                    error!(
                        "[room:{}] rollback reload also failed: {reload}",
                        self.project_id
                    );
                }
            }
            return Err(e.into());
        }
        self.next_seq += 1;
        self.batches_since_compact += 1;
        self.dirty = true;

        let mut overflowed = Vec::new();
        for (id, seat) in self.seats.iter_mut() {
            if id == peer_id {
                continue;
            }
            match self.document.generate_for(&mut seat.sync_state) {
                Ok(Some(sync_data)) => {
                    let msg = ServerMessage::SyncMessage {
                        project_id: self.project_id.clone(),
                        sync_data,
                        from_peer: Some(peer_id.to_string()),
                    };
                    if seat.outbound.push(&msg).is_err() {
                        overflowed.push(id.clone());
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(
                    "[room:{}] sync generation for {id} failed: {e}",
                    self.project_id
                ),
            }
        }
        self.drop_rate_limited(overflowed).await;

        if self.batches_since_compact >= limits::FLUSH_BATCH_THRESHOLD {
            self.flush().await;
        }
        Ok(())
    }

    async fn handle_sync_request(&mut self, peer_id: &str) -> Result<(), ServerError> {
        self.presence.touch(peer_id, now_ms());
        let Some(seat) = self.seats.get_mut(peer_id) else {
            return Err(ServerError::NotJoined);
        };
        let msg = match self.document.generate_for(&mut seat.sync_state)? {
            Some(sync_data) => ServerMessage::SyncMessage {
                project_id: self.project_id.clone(),
                sync_data,
                from_peer: None,
            },
            None => ServerMessage::SyncComplete {
                project_id: self.project_id.clone(),
            },
        };
        if seat.outbound.push(&msg).is_err() {
            self.drop_rate_limited(vec![peer_id.to_string()]).await;
        }
        Ok(())
    }

    async fn handle_open_file(
        &mut self,
        peer_id: &str,
        file_path: String,
    ) -> Result<(), ServerError> {
        self.presence.touch(peer_id, now_ms());
        let Some(seat) = self.seats.get(peer_id) else {
            return Err(ServerError::NotJoined);
        };
        let msg = match self.document.file_content(&file_path) {
            Some(file) => ServerMessage::FileContent {
                project_id: self.project_id.clone(),
                file_path: file_path.clone(),
                content: file.content,
                language: file.language,
                version: file.version,
            },
            None => ServerMessage::FileNotFound {
                project_id: self.project_id.clone(),
                file_path: file_path.clone(),
            },
        };
        if seat.outbound.push(&msg).is_err() {
            self.drop_rate_limited(vec![peer_id.to_string()]).await;
            return Ok(());
        }

        if let Some(info) = self
            .presence
            .set_active_file(peer_id, Some(file_path))
        {
            self.broadcast_presence(info).await;
        }
        Ok(())
    }

    async fn handle_close_file(
        &mut self,
        peer_id: &str,
        file_path: &str,
    ) -> Result<(), ServerError> {
        if !self.seats.contains_key(peer_id) {
            return Err(ServerError::NotJoined);
        }
        self.presence.touch(peer_id, now_ms());
        self.presence.clear_cursor(peer_id, file_path);
        if self.presence.active_file(peer_id) == Some(file_path) {
            if let Some(info) = self.presence.set_active_file(peer_id, None) {
                self.broadcast_presence(info).await;
            }
        }
        Ok(())
    }

    async fn handle_cursor(
        &mut self,
        peer_id: &str,
        cursor: CursorRecord,
    ) -> Result<(), ServerError> {
        if cursor.line == 0 || cursor.column == 0 {
            return Err(ServerError::InvalidCursor);
        }
        let Some(seat) = self.seats.get(peer_id) else {
            return Err(ServerError::NotJoined);
        };
        self.presence.touch(peer_id, now_ms());

        let msg = ServerMessage::CursorBroadcast {
            project_id: self.project_id.clone(),
            peer_id: peer_id.to_string(),
            peer_name: seat.display_name.clone(),
            peer_color: seat.color.clone(),
            file_path: cursor.file_path.clone(),
            line: cursor.line,
            column: cursor.column,
            selection_end: cursor.selection_end,
        };
        self.presence.set_cursor(peer_id, cursor);
        self.broadcast(Some(peer_id), msg).await;
        Ok(())
    }

    async fn handle_presence(
        &mut self,
        peer_id: &str,
        status: PresenceStatus,
        active_file: Option<String>,
    ) -> Result<(), ServerError> {
        if status == PresenceStatus::Offline {
            // Offline is the disconnect transition; clients cannot claim it.
            return Err(ServerError::OfflineStatusReserved);
        }
        if !self.seats.contains_key(peer_id) {
            return Err(ServerError::NotJoined);
        }
        self.presence.touch(peer_id, now_ms());
        if let Some(info) = self.presence.set_status(peer_id, status, active_file) {
            self.broadcast_presence(info).await;
        }
        Ok(())
    }

    async fn handle_chat(&mut self, peer_id: &str, content: String) -> Result<(), ServerError> {
        if content.len() > limits::CHAT_MAX_BYTES {
            return Err(ServerError::ChatTooLong(content.len()));
        }
        let Some(seat) = self.seats.get(peer_id) else {
            return Err(ServerError::NotJoined);
        };
        self.presence.touch(peer_id, now_ms());

        let entry = ChatEntry {
            peer_id: peer_id.to_string(),
            display_name: seat.display_name.clone(),
            content,
            server_timestamp: now_ms(),
        };
        self.chat.push_back(entry.clone());
        while self.chat.len() > limits::CHAT_RING_LEN {
            self.chat.pop_front();
        }

        // Everyone sees chat, the sender included: the broadcast carries
        // the authoritative server timestamp.
        self.broadcast(
            None,
            ServerMessage::ChatBroadcast {
                project_id: self.project_id.clone(),
                peer_id: entry.peer_id,
                peer_name: entry.display_name,
                content: entry.content,
                timestamp: entry.server_timestamp,
            },
        )
        .await;
        Ok(())
    }

    fn handle_voice_join(&mut self, peer_id: &str) -> Result<(), ServerError> {
        let Some(seat) = self.seats.get(peer_id) else {
            return Err(ServerError::NotJoined);
        };
        self.presence.touch(peer_id, now_ms());
        let grant = self
            .voice
            .issue_token(&self.project_id, peer_id, &seat.display_name)
            .map_err(ServerError::Voice)?;
        let _ = seat.outbound.push(&ServerMessage::VoiceToken {
            project_id: self.project_id.clone(),
            token: grant.token,
            room_name: grant.room_name,
            server_url: grant.server_url,
        });
        Ok(())
    }

    fn handle_voice_leave(&mut self, peer_id: &str) -> Result<(), ServerError> {
        if !self.seats.contains_key(peer_id) {
            return Err(ServerError::NotJoined);
        }
        self.presence.touch(peer_id, now_ms());
        self.voice.revoke(&self.project_id, peer_id);
        Ok(())
    }

    /// Fan one message out to every seat except `except`. Subscribers that
    /// overflow are disconnected afterwards; their `PeerLeft` may in turn
    /// overflow others, so the drop loop iterates to a fixed point.
    async fn broadcast(&mut self, except: Option<&str>, msg: ServerMessage) {
        let mut overflowed = Vec::new();
        for (id, seat) in &self.seats {
            if Some(id.as_str()) == except {
                continue;
            }
            if seat.outbound.push(&msg).is_err() {
                overflowed.push(id.clone());
            }
        }
        self.drop_rate_limited(overflowed).await;
    }

    async fn broadcast_presence(&mut self, info: atelier_proto::PeerInfo) {
        let msg = ServerMessage::PresenceBroadcast {
            project_id: self.project_id.clone(),
            peer_id: info.peer_id.clone(),
            peer_name: info.display_name,
            status: info.status,
            active_file: info.active_file,
            last_active: info.last_active,
        };
        self.broadcast(Some(&info.peer_id), msg).await;
    }

    /// Disconnect overflowed subscribers, never the publisher.
    async fn drop_rate_limited(&mut self, mut overflowed: Vec<String>) {
        while let Some(peer_id) = overflowed.pop() {
            let Some(seat) = self.seats.remove(&peer_id) else {
                continue;
            };
            warn!(
                "[room:{}] disconnecting {peer_id}: outbound backlog exceeded",
                self.project_id
            );
            seat.outbound
                .request_close(ErrorCode::RateLimited, "outbound backlog exceeded");
            self.checkpoint_sync_state(&peer_id, &seat.sync_state).await;
            self.presence.remove(&peer_id);
            self.counters.peer_left();

            let msg = ServerMessage::PeerLeft {
                project_id: self.project_id.clone(),
                peer_id: peer_id.clone(),
                reason: Some("rate limited".to_string()),
            };
            for (id, other) in &self.seats {
                if other.outbound.push(&msg).is_err() && !overflowed.contains(id) {
                    overflowed.push(id.clone());
                }
            }
        }
        self.arm_idle_if_empty();
    }

    fn arm_idle_if_empty(&mut self) {
        if self.seats.is_empty() && self.idle_deadline.is_none() {
            self.idle_deadline =
                Some(tokio::time::Instant::now() + limits::ROOM_IDLE_GRACE);
            debug!("[room:{}] empty, idle countdown armed", self.project_id);
        }
    }

    async fn sweep_presence(&mut self) {
        for demotion in self.presence.sweep(Instant::now()) {
            if let Some(info) = self.presence.snapshot(&demotion.peer_id) {
                // The demoted peer hears about its own demotion too.
                let msg = ServerMessage::PresenceBroadcast {
                    project_id: self.project_id.clone(),
                    peer_id: info.peer_id.clone(),
                    peer_name: info.display_name,
                    status: info.status,
                    active_file: info.active_file,
                    last_active: info.last_active,
                };
                self.broadcast(None, msg).await;
            }
        }
    }

    async fn checkpoint_sync_state(&self, peer_id: &str, state: &PeerSyncState) {
        let expires_at = now_ms() + limits::SESSION_TTL.as_millis() as i64;
        if let Err(e) = self
            .store
            .put_sync_state(&self.project_id, peer_id, &state.encode(), expires_at)
            .await
        {
            warn!(
                "[room:{}] sync checkpoint for {peer_id} failed: {e}",
                self.project_id
            );
        }
    }

    /// Consolidate appended changes into a snapshot. Failures are logged
    /// and retried on the next interval; the in-memory document stays
    /// authoritative either way.
    async fn flush(&mut self) {
        if !self.dirty {
            return;
        }
        let snapshot = match self.document.save() {
            Ok(s) => s,
            Err(e) => {
                warn!("[room:{}] snapshot export failed: {e}", self.project_id);
                return;
            }
        };
        match self
            .store
            .compact(&self.project_id, &snapshot, self.next_seq)
            .await
        {
            Ok(()) => {
                self.dirty = false;
                self.batches_since_compact = 0;
                if let Err(e) = self
                    .store
                    .put_chat(&self.project_id, &self.chat.iter().cloned().collect::<Vec<_>>())
                    .await
                {
                    warn!("[room:{}] chat persist failed: {e}", self.project_id);
                }
            }
            Err(e) => warn!("[room:{}] compaction failed, will retry: {e}", self.project_id),
        }
    }

    /// Final teardown: drain queued commands with `ServerError`, checkpoint
    /// every seated peer, flush, and unregister.
    async fn close(&mut self) {
        self.rx.close();
        while let Some(cmd) = self.rx.recv().await {
            cmd.fail(ServerError::RoomClosed);
        }

        let seats = std::mem::take(&mut self.seats);
        for (peer_id, seat) in &seats {
            self.checkpoint_sync_state(peer_id, &seat.sync_state).await;
            let _ = seat.outbound.push(&ServerMessage::Goodbye {
                reason: Some("server shutting down".to_string()),
            });
            self.counters.peer_left();
        }

        self.flush().await;

        {
            let mut rooms = self.rooms.write().await;
            let ours = rooms
                .get(&self.project_id)
                .is_some_and(|h| h.tx.same_channel(&self.handle.tx));
            if ours {
                rooms.remove(&self.project_id);
            }
        }
        self.counters.room_closed();
        info!("[room:{}] closed", self.project_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atelier_proto::ClientMessage;
    use loro::{ExportMode, LoroDoc, LoroMap, LoroText};

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            port: 0,
            storage_path: "/unused".into(),
            max_peers_per_room: 4,
            max_rooms: 100,
            max_doc_size: 10 * 1024 * 1024,
            livekit: None,
        })
    }

    struct Harness {
        _dir: tempfile::TempDir,
        handle: RoomHandle,
        rooms: RoomMap,
        store: Arc<Store>,
        counters: Arc<ServerCounters>,
    }

    async fn open_room(project: &str) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).await.unwrap());
        let rooms: RoomMap = Arc::new(RwLock::new(HashMap::new()));
        let counters = Arc::new(ServerCounters::new());
        let handle = Room::open(
            project,
            test_config(),
            Arc::clone(&store),
            Arc::new(CredentialIssuer::from_config(None)),
            Arc::clone(&counters),
            Arc::clone(&rooms),
        )
        .await
        .unwrap();
        rooms
            .write()
            .await
            .insert(project.to_string(), handle.clone());
        Harness {
            _dir: dir,
            handle,
            rooms,
            store,
            counters,
        }
    }

    async fn join(handle: &RoomHandle, peer: &str, want_state: bool) -> OutboundReceiver {
        let (outbound, rx) = Outbound::channel();
        handle
            .join(JoinArgs {
                peer_id: peer.to_string(),
                display_name: peer.to_string(),
                color: "#aabbcc".to_string(),
                want_state,
                outbound,
            })
            .await
            .unwrap();
        rx
    }

    async fn next_msg(rx: &mut OutboundReceiver) -> ServerMessage {
        let bytes = tokio::time::timeout(std::time::Duration::from_secs(5), rx.frames.recv())
            .await
            .expect("timed out waiting for message")
            .expect("queue closed");
        let frame = Frame::decode(&bytes).expect("frame");
        ServerMessage::decode(&frame.payload).expect("message")
    }

    fn edit_payload(path: &str, text: &str) -> Vec<u8> {
        let doc = LoroDoc::new();
        let files = doc.get_map("files");
        let file = files.insert_container(path, LoroMap::new()).unwrap();
        let content = file.insert_container("content", LoroText::new()).unwrap();
        content.insert(0, text).unwrap();
        file.insert("language", "rust").unwrap();
        doc.commit();
        doc.export(ExportMode::all_updates()).unwrap()
    }

    #[tokio::test]
    async fn join_returns_state_and_announces_peer() {
        let h = open_room("p").await;
        let mut a = join(&h.handle, "peer-a", false).await;
        match next_msg(&mut a).await {
            ServerMessage::ProjectJoined {
                peers,
                document_state,
                ..
            } => {
                assert!(peers.is_empty());
                assert!(document_state.is_none());
            }
            other => panic!("expected ProjectJoined, got {other:?}"),
        }

        let mut b = join(&h.handle, "peer-b", true).await;
        match next_msg(&mut b).await {
            ServerMessage::ProjectJoined {
                peers,
                document_state,
                ..
            } => {
                assert_eq!(peers.len(), 1);
                assert_eq!(peers[0].peer_id, "peer-a");
                assert!(document_state.is_some());
            }
            other => panic!("expected ProjectJoined, got {other:?}"),
        }
        match next_msg(&mut a).await {
            ServerMessage::PeerJoined { peer, .. } => assert_eq!(peer.peer_id, "peer-b"),
            other => panic!("expected PeerJoined, got {other:?}"),
        }
        assert_eq!(h.counters.active_peers(), 2);
    }

    #[tokio::test]
    async fn duplicate_join_and_capacity_are_rejected() {
        let h = open_room("p").await;
        let _a = join(&h.handle, "peer-a", false).await;

        let (outbound, _rx) = Outbound::channel();
        let err = h
            .handle
            .join(JoinArgs {
                peer_id: "peer-a".to_string(),
                display_name: "dup".to_string(),
                color: "#fff".to_string(),
                want_state: false,
                outbound,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::AlreadyJoined(_)));

        let mut held = Vec::new();
        for i in 1..4 {
            held.push(join(&h.handle, &format!("peer-{i}"), false).await);
        }
        let (outbound, _rx) = Outbound::channel();
        let err = h
            .handle
            .join(JoinArgs {
                peer_id: "peer-x".to_string(),
                display_name: "x".to_string(),
                color: "#fff".to_string(),
                want_state: false,
                outbound,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::ProjectFull(_)));
    }

    #[tokio::test]
    async fn sync_fans_out_to_others_only_and_persists() {
        let h = open_room("p").await;
        let mut a = join(&h.handle, "peer-a", false).await;
        let mut b = join(&h.handle, "peer-b", false).await;
        let _ = next_msg(&mut a).await; // ProjectJoined
        let _ = next_msg(&mut a).await; // PeerJoined(b)
        let _ = next_msg(&mut b).await; // ProjectJoined

        h.handle
            .sync("peer-a", edit_payload("main.rs", "fn main() {}"))
            .await
            .unwrap();

        match next_msg(&mut b).await {
            ServerMessage::SyncMessage {
                sync_data,
                from_peer,
                ..
            } => {
                assert_eq!(from_peer.as_deref(), Some("peer-a"));
                let check = ProjectDocument::new();
                check.apply_remote(&sync_data).unwrap();
                assert_eq!(
                    check.file_content("main.rs").unwrap().content,
                    "fn main() {}"
                );
            }
            other => panic!("expected SyncMessage, got {other:?}"),
        }
        // The sender gets nothing back for its own upload.
        assert!(a.frames.try_recv().is_err());

        // Durable before broadcast: the batch is on disk.
        let loaded = h.store.load_or_init("p").await.unwrap();
        assert_eq!(
            loaded.document.file_content("main.rs").unwrap().content,
            "fn main() {}"
        );
    }

    #[tokio::test]
    async fn duplicate_sync_is_not_persisted() {
        let h = open_room("p").await;
        let _a = join(&h.handle, "peer-a", false).await;
        let payload = edit_payload("main.rs", "x");

        h.handle.sync("peer-a", payload.clone()).await.unwrap();
        h.handle.sync("peer-a", payload).await.unwrap();

        let loaded = h.store.load_or_init("p").await.unwrap();
        assert_eq!(loaded.next_seq, 1, "no-op must not append a batch");
    }

    #[tokio::test]
    async fn sync_request_backfills_then_completes() {
        let h = open_room("p").await;
        let _a = join(&h.handle, "peer-a", false).await;
        h.handle
            .sync("peer-a", edit_payload("main.rs", "fn main() {}"))
            .await
            .unwrap();

        let mut b = join(&h.handle, "peer-b", false).await;
        let _ = next_msg(&mut b).await; // ProjectJoined

        h.handle.sync_request("peer-b").await.unwrap();
        match next_msg(&mut b).await {
            ServerMessage::SyncMessage { from_peer, .. } => assert_eq!(from_peer, None),
            other => panic!("expected SyncMessage, got {other:?}"),
        }

        h.handle.sync_request("peer-b").await.unwrap();
        match next_msg(&mut b).await {
            ServerMessage::SyncComplete { project_id } => assert_eq!(project_id, "p"),
            other => panic!("expected SyncComplete, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cursor_fan_out_excludes_sender() {
        let h = open_room("p").await;
        let mut p1 = join(&h.handle, "peer-1", false).await;
        let mut p2 = join(&h.handle, "peer-2", false).await;
        let mut p3 = join(&h.handle, "peer-3", false).await;
        // Drain join traffic.
        for _ in 0..3 {
            let _ = next_msg(&mut p1).await;
        }
        for _ in 0..2 {
            let _ = next_msg(&mut p2).await;
        }
        let _ = next_msg(&mut p3).await;

        h.handle
            .cursor(
                "peer-2",
                CursorRecord {
                    file_path: "main.rs".into(),
                    line: 10,
                    column: 4,
                    selection_end: None,
                },
            )
            .await
            .unwrap();

        for rx in [&mut p1, &mut p3] {
            match next_msg(rx).await {
                ServerMessage::CursorBroadcast {
                    peer_id,
                    line,
                    column,
                    ..
                } => {
                    assert_eq!(peer_id, "peer-2");
                    assert_eq!((line, column), (10, 4));
                }
                other => panic!("expected CursorBroadcast, got {other:?}"),
            }
        }
        assert!(p2.frames.try_recv().is_err());
    }

    #[tokio::test]
    async fn invalid_cursor_rejected() {
        let h = open_room("p").await;
        let _a = join(&h.handle, "peer-a", false).await;
        let err = h
            .handle
            .cursor(
                "peer-a",
                CursorRecord {
                    file_path: "main.rs".into(),
                    line: 0,
                    column: 4,
                    selection_end: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::InvalidCursor));
    }

    #[tokio::test]
    async fn chat_ring_caps_and_rejects_oversize() {
        let h = open_room("p").await;
        let mut a = join(&h.handle, "peer-a", false).await;
        let _ = next_msg(&mut a).await;

        let err = h
            .handle
            .chat("peer-a", "x".repeat(limits::CHAT_MAX_BYTES + 1))
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::ChatTooLong(_)));

        h.handle.chat("peer-a", "hello".to_string()).await.unwrap();
        match next_msg(&mut a).await {
            ServerMessage::ChatBroadcast { content, peer_id, .. } => {
                assert_eq!(content, "hello");
                assert_eq!(peer_id, "peer-a");
            }
            other => panic!("expected ChatBroadcast, got {other:?}"),
        }

        // A late joiner receives the ring after ProjectJoined.
        let mut b = join(&h.handle, "peer-b", false).await;
        let _ = next_msg(&mut b).await;
        match next_msg(&mut b).await {
            ServerMessage::ChatHistory { messages, .. } => {
                assert_eq!(messages.len(), 1);
                assert_eq!(messages[0].content, "hello");
            }
            other => panic!("expected ChatHistory, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn voice_without_config_is_refused() {
        let h = open_room("p").await;
        let _a = join(&h.handle, "peer-a", false).await;
        let err = h.handle.voice_join("peer-a").await.unwrap_err();
        assert!(matches!(err, ServerError::Voice(_)));
    }

    #[tokio::test]
    async fn stalled_subscriber_is_dropped_others_continue() {
        let h = open_room("p").await;
        let mut a = join(&h.handle, "peer-a", false).await;
        let mut stalled = join(&h.handle, "peer-s", false).await;
        let _ = next_msg(&mut a).await;
        let _ = next_msg(&mut a).await;
        let _ = next_msg(&mut stalled).await;

        // peer-s never drains its queue; peer-a keeps chatting well past
        // the queue depth, draining its own copy as it goes.
        for i in 0..(limits::OUTBOUND_QUEUE_MSGS + 8) {
            h.handle.chat("peer-a", format!("msg {i}")).await.unwrap();
            while a.frames.try_recv().is_ok() {}
        }

        let (code, _) = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            stalled.close.recv(),
        )
        .await
        .expect("timed out")
        .expect("close channel");
        assert_eq!(code, ErrorCode::RateLimited);

        // Only the stalled subscriber was dropped; the room still works
        // for the healthy peer.
        assert_eq!(h.counters.active_peers(), 1);
        h.handle.chat("peer-a", "after".to_string()).await.unwrap();
        loop {
            if let ServerMessage::ChatBroadcast { content, .. } = next_msg(&mut a).await {
                if content == "after" {
                    break;
                }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn empty_room_evicts_and_compacts() {
        let h = open_room("p").await;
        let _rx = join(&h.handle, "peer-a", false).await;
        h.handle
            .sync("peer-a", edit_payload("main.rs", "fn main() {}"))
            .await
            .unwrap();
        h.handle.leave("peer-a", None).await;

        tokio::time::sleep(limits::ROOM_IDLE_GRACE + limits::FLUSH_INTERVAL).await;
        // Teardown does real disk IO under the paused clock.
        for _ in 0..100 {
            if h.handle.is_closed() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        assert!(h.handle.is_closed());
        assert!(h.rooms.read().await.is_empty());
        assert_eq!(h.counters.active_rooms(), 0);

        // Compacted on disk: no pending batches, content preserved.
        let loaded = h.store.load_or_init("p").await.unwrap();
        assert_eq!(loaded.pending_batches, 0);
        assert_eq!(
            loaded.document.file_content("main.rs").unwrap().content,
            "fn main() {}"
        );
    }

    #[tokio::test]
    async fn shutdown_drains_and_checkpoints() {
        let h = open_room("p").await;
        let _a = join(&h.handle, "peer-a", false).await;
        h.handle
            .sync("peer-a", edit_payload("main.rs", "x"))
            .await
            .unwrap();

        h.handle.shutdown().await;
        assert!(h.handle.is_closed());
        // The seated peer's sync state was checkpointed.
        assert!(
            h.store
                .get_sync_state("p", "peer-a")
                .await
                .unwrap()
                .is_some()
        );
        let err = h.handle.sync_request("peer-a").await.unwrap_err();
        assert!(matches!(err, ServerError::RoomClosed));
    }

    #[test]
    fn room_scoped_client_messages_expose_project() {
        let msg = ClientMessage::SyncRequest {
            project_id: "p".into(),
        };
        assert_eq!(msg.project_id(), Some("p"));
        assert_eq!(ClientMessage::Ping { timestamp: 0 }.project_id(), None);
    }
}
