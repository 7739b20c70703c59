//! Blossom authorization events (kind 24242)

use async_trait::async_trait;
use base64::Engine;
use nostr::prelude::*;

use crate::BlossomError;

/// Event kind used for Blossom authorization
pub const AUTH_KIND: u16 = 24242;

/// Lifetime of an authorization event, in seconds
pub const AUTH_TTL_SECS: u64 = 300;

/// Operation an authorization event grants, carried in its `t` tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthAction {
    Upload,
    Get,
    Delete,
}

impl AuthAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthAction::Upload => "upload",
            AuthAction::Get => "get",
            AuthAction::Delete => "delete",
        }
    }

    fn content(&self) -> &'static str {
        match self {
            AuthAction::Upload => "Upload blob",
            AuthAction::Get => "Get blob",
            AuthAction::Delete => "Delete blob",
        }
    }
}

/// Signs authorization events on behalf of the client.
///
/// Implemented for [`nostr::Keys`]. Remote signers (browser extensions,
/// bunkers) implement this to keep the secret key out of the process.
#[async_trait]
pub trait AuthSigner: Send + Sync {
    async fn sign(&self, builder: EventBuilder) -> Result<Event, BlossomError>;
}

#[async_trait]
impl AuthSigner for Keys {
    async fn sign(&self, builder: EventBuilder) -> Result<Event, BlossomError> {
        builder
            .to_event(self)
            .map_err(|e| BlossomError::Signing(e.to_string()))
    }
}

/// Unsigned authorization event for `action` on the blob `hash`
pub(crate) fn auth_event(action: AuthAction, hash: &str) -> EventBuilder {
    let expiration = Timestamp::now().as_u64() + AUTH_TTL_SECS;
    let tags = vec![
        Tag::custom(TagKind::custom("t"), vec![action.as_str().to_string()]),
        Tag::custom(TagKind::custom("x"), vec![hash.to_string()]),
        Tag::custom(TagKind::custom("expiration"), vec![expiration.to_string()]),
    ];
    EventBuilder::new(Kind::Custom(AUTH_KIND), action.content(), tags)
}

/// `Authorization` header value for a signed event
pub(crate) fn auth_header(event: &Event) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(event.as_json());
    format!("Nostr {}", encoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_signed_header_round_trips() {
        let keys = Keys::generate();
        let hash = "ab".repeat(32);
        let event = AuthSigner::sign(&keys, auth_event(AuthAction::Upload, &hash))
            .await
            .unwrap();
        assert!(event.verify().is_ok());

        let header = auth_header(&event);
        let encoded = header.strip_prefix("Nostr ").unwrap();
        let json = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .unwrap();
        let decoded = Event::from_json(json).unwrap();
        assert_eq!(decoded, event);

        let json = decoded.as_json();
        assert!(json.contains(r#""kind":24242"#));
        assert!(json.contains(&keys.public_key().to_hex()));
        assert!(json.contains(r#"["t","upload"]"#));
        assert!(json.contains(&format!(r#"["x","{}"]"#, hash)));
        assert!(json.contains(r#"["expiration","#));
    }
}
