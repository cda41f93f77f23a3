//! Session tokens binding a peer identity across reconnects.
//!
//! Tokens are HS256 JWTs signed with a secret generated at process start.
//! They are opaque to clients; the server only cares that a re-presented
//! token restores the same `(peer_id, color)` pair within the 24 h TTL.
//! A restart rotates the secret, after which old tokens simply fail
//! verification and the client gets a fresh identity.

use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use crate::config::limits::SESSION_TTL;

#[derive(Debug, Serialize, Deserialize)]
struct SessionClaims {
    /// Subject: the peer id being bound.
    sub: String,
    /// Assigned palette color, restored together with the id.
    color: String,
    iat: usize,
    exp: usize,
}

pub struct SessionKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl SessionKeys {
    /// Fresh random secret; outstanding tokens from a previous process
    /// become invalid and are treated as absent.
    pub fn generate() -> Self {
        let secret: [u8; 32] = rand::random();
        Self {
            encoding: EncodingKey::from_secret(&secret),
            decoding: DecodingKey::from_secret(&secret),
        }
    }

    pub fn issue(&self, peer_id: &str, color: &str) -> String {
        let now = Utc::now().timestamp() as usize;
        let claims = SessionClaims {
            sub: peer_id.to_string(),
            color: color.to_string(),
            iat: now,
            exp: now + SESSION_TTL.as_secs() as usize,
        };
        encode(&Header::default(), &claims, &self.encoding).expect("failed to encode JWT")
    }

    /// `(peer_id, color)` when the token is genuine and unexpired.
    pub fn verify(&self, token: &str) -> Option<(String, String)> {
        let validation = Validation::new(Algorithm::HS256);
        let data = decode::<SessionClaims>(token, &self.decoding, &validation).ok()?;
        Some((data.claims.sub, data.claims.color))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_and_verify_restores_identity() {
        let keys = SessionKeys::generate();
        let token = keys.issue("peer-1", "#e06c75");
        assert_eq!(
            keys.verify(&token),
            Some(("peer-1".to_string(), "#e06c75".to_string()))
        );
    }

    #[test]
    fn foreign_secret_is_rejected() {
        let keys = SessionKeys::generate();
        let other = SessionKeys::generate();
        let token = keys.issue("peer-1", "#aaa");
        assert_eq!(other.verify(&token), None);
    }

    #[test]
    fn expired_token_is_rejected() {
        let keys = SessionKeys::generate();
        let past = Utc::now().timestamp() as usize - 7200;
        let claims = SessionClaims {
            sub: "peer-1".into(),
            color: "#aaa".into(),
            iat: past,
            exp: past + 60,
        };
        let token = encode(&Header::default(), &claims, &keys.encoding).unwrap();
        assert_eq!(keys.verify(&token), None);
    }

    #[test]
    fn garbage_token_is_rejected() {
        let keys = SessionKeys::generate();
        assert_eq!(keys.verify("not.a.jwt"), None);
        assert_eq!(keys.verify(""), None);
    }
}
