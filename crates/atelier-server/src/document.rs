//! CRDT document wrapper.
//!
//! One `ProjectDocument` per room, holding the project's collaborative
//! state in a `LoroDoc`: root map `files` (path -> {content, language,
//! created_at, modified_at}), root map `folders` (path -> {name,
//! children}), root map `metadata`. The server never originates CRDT
//! operations; it stores and merges what clients send, and answers reads
//! from the resolved value tree.
//!
//! Per-peer sync state is a loro `VersionVector`: what the server has
//! confirmed that peer holds. `generate_for` exports exactly the updates
//! past that vector and advances it; equal vectors mean the peer is
//! synchronized.

use loro::{ExportMode, LoroDoc, LoroValue, VersionVector};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("crdt import failed: {0}")]
    Import(String),
    #[error("crdt export failed: {0}")]
    Export(String),
    #[error("sync state failed to decode: {0}")]
    SyncState(String),
}

/// Opaque summary of what one peer is known to have.
#[derive(Debug, Clone, Default)]
pub struct PeerSyncState {
    vv: VersionVector,
}

impl PeerSyncState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn encode(&self) -> Vec<u8> {
        self.vv.encode()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DocumentError> {
        let vv = VersionVector::decode(bytes).map_err(|e| DocumentError::SyncState(e.to_string()))?;
        Ok(Self { vv })
    }
}

/// A file resolved out of the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub content: String,
    pub language: String,
    pub version: u64,
}

pub struct ProjectDocument {
    doc: LoroDoc,
}

impl Default for ProjectDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl ProjectDocument {
    pub fn new() -> Self {
        Self { doc: LoroDoc::new() }
    }

    /// Restore from a snapshot; empty bytes yield a fresh document.
    pub fn load(bytes: &[u8]) -> Result<Self, DocumentError> {
        let doc = LoroDoc::new();
        if !bytes.is_empty() {
            doc.import(bytes)
                .map_err(|e| DocumentError::Import(e.to_string()))?;
        }
        Ok(Self { doc })
    }

    /// Compacted snapshot of the full document.
    pub fn save(&self) -> Result<Vec<u8>, DocumentError> {
        self.doc
            .export(ExportMode::Snapshot)
            .map_err(|e| DocumentError::Export(e.to_string()))
    }

    /// Integrate a remote sync payload. Returns whether the payload
    /// carried anything new; duplicates and stale re-sends are no-ops.
    /// A payload referencing changes this replica has not seen imports
    /// what it can; the gap is requested by the sender's next exchange.
    pub fn apply_remote(&self, payload: &[u8]) -> Result<bool, DocumentError> {
        let before = self.doc.oplog_vv();
        self.doc
            .import(payload)
            .map_err(|e| DocumentError::Import(e.to_string()))?;
        Ok(self.doc.oplog_vv() != before)
    }

    /// Next payload needed to bring `state`'s peer up to date, or `None`
    /// when the peer already has everything. Advances the state to the
    /// current version on emit.
    pub fn generate_for(&self, state: &mut PeerSyncState) -> Result<Option<Vec<u8>>, DocumentError> {
        let current = self.doc.oplog_vv();
        if state.vv == current {
            return Ok(None);
        }
        let payload = self
            .doc
            .export(ExportMode::updates(&state.vv))
            .map_err(|e| DocumentError::Export(e.to_string()))?;
        state.vv = current;
        if payload.is_empty() {
            return Ok(None);
        }
        Ok(Some(payload))
    }

    /// Mark the peer as holding the current version, e.g. after it was
    /// handed a full snapshot on join.
    pub fn mark_synced(&self, state: &mut PeerSyncState) {
        state.vv = self.doc.oplog_vv();
    }

    /// Approximate on-disk size, used for the document size cap.
    pub fn size_estimate(&self) -> usize {
        self.save().map(|s| s.len()).unwrap_or(0)
    }

    /// Resolve one file out of the value tree, if present.
    pub fn file_content(&self, path: &str) -> Option<FileRecord> {
        let root = self.doc.get_deep_value();
        let LoroValue::Map(root) = root else {
            return None;
        };
        let LoroValue::Map(files) = root.get("files")? else {
            return None;
        };
        let LoroValue::Map(file) = files.get(path)? else {
            return None;
        };

        let content = match file.get("content") {
            Some(LoroValue::String(s)) => s.to_string(),
            _ => String::new(),
        };
        let language = match file.get("language") {
            Some(LoroValue::String(s)) if !s.is_empty() => s.to_string(),
            _ => language_for_path(path).to_string(),
        };
        let version = match file.get("modified_at") {
            Some(LoroValue::I64(n)) => u64::try_from(*n).unwrap_or(0),
            _ => 0,
        };
        Some(FileRecord {
            content,
            language,
            version,
        })
    }
}

/// Fallback syntax identifier when a file entry carries no language.
fn language_for_path(path: &str) -> &'static str {
    match path.rsplit('.').next().unwrap_or("") {
        "rs" => "rust",
        "js" | "mjs" | "cjs" => "javascript",
        "ts" | "tsx" => "typescript",
        "jsx" => "javascriptreact",
        "py" => "python",
        "go" => "go",
        "c" | "h" => "c",
        "cpp" | "cc" | "hpp" => "cpp",
        "java" => "java",
        "rb" => "ruby",
        "sh" => "shell",
        "md" => "markdown",
        "json" => "json",
        "yaml" | "yml" => "yaml",
        "toml" => "toml",
        "html" => "html",
        "css" => "css",
        "sql" => "sql",
        _ => "plaintext",
    }
}
