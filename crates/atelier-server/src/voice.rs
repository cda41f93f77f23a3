//! Voice credential collaborator.
//!
//! The server never touches media; it only mints short-lived LiveKit
//! access tokens on `VoiceJoin`. Token shape follows the LiveKit access
//! token contract: HS256 JWT, `iss` = API key, `sub` = participant
//! identity, a `video` grant naming the media room.

use chrono::Utc;
use jsonwebtoken::{EncodingKey, Header, encode};
use log::{info, warn};
use serde::Serialize;

use crate::config::LiveKitConfig;

/// Voice tokens outlive any realistic session; media-side expiry is the
/// revocation mechanism.
const VOICE_TOKEN_TTL_SECS: i64 = 6 * 60 * 60;

/// Credentials handed back to the requesting peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceGrant {
    pub token: String,
    pub room_name: String,
    pub server_url: String,
}

#[derive(Serialize)]
struct VideoGrant<'a> {
    room: &'a str,
    #[serde(rename = "roomJoin")]
    room_join: bool,
}

#[derive(Serialize)]
struct VoiceClaims<'a> {
    iss: &'a str,
    sub: &'a str,
    name: &'a str,
    nbf: i64,
    exp: i64,
    video: VideoGrant<'a>,
}

/// The issuer is swappable by construction: everything upstream depends
/// only on `issue_token` and `revoke`.
pub enum CredentialIssuer {
    LiveKit(LiveKitConfig),
    /// No LiveKit configuration present; every request is refused.
    Disabled,
}

impl CredentialIssuer {
    pub fn from_config(config: Option<LiveKitConfig>) -> Self {
        match config {
            Some(cfg) => CredentialIssuer::LiveKit(cfg),
            None => CredentialIssuer::Disabled,
        }
    }

    pub fn issue_token(
        &self,
        project_id: &str,
        peer_id: &str,
        display_name: &str,
    ) -> Result<VoiceGrant, String> {
        let CredentialIssuer::LiveKit(cfg) = self else {
            return Err("voice is not configured on this server".to_string());
        };

        let room_name = format!("atelier-{project_id}");
        let now = Utc::now().timestamp();
        let claims = VoiceClaims {
            iss: &cfg.api_key,
            sub: peer_id,
            name: display_name,
            nbf: now,
            exp: now + VOICE_TOKEN_TTL_SECS,
            video: VideoGrant {
                room: &room_name,
                room_join: true,
            },
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(cfg.api_secret.as_bytes()),
        )
        .map_err(|e| format!("token signing failed: {e}"))?;

        info!("[voice] issued token for {peer_id} in {room_name}");
        Ok(VoiceGrant {
            token,
            room_name,
            server_url: cfg.url.clone(),
        })
    }

    /// Tokens are short-lived; there is nothing to tear down server-side.
    pub fn revoke(&self, project_id: &str, peer_id: &str) {
        match self {
            CredentialIssuer::LiveKit(_) => {
                info!("[voice] {peer_id} left voice in atelier-{project_id}");
            }
            CredentialIssuer::Disabled => {
                warn!("[voice] revoke for {peer_id} with voice disabled");
            }
        }
    }
}
