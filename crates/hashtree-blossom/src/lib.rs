//! Blossom protocol client for hashtree
//!
//! Stores blobs on a list of remote Blossom servers. Every request carries a
//! short-lived kind 24242 nostr event signed by an [`AuthSigner`], binding the
//! caller's key to the operation and the blob hash.
//!
//! Servers are tried in order. A server that times out, refuses the
//! connection, answers with an error status, or serves bytes that do not
//! match the requested hash is skipped and the next one is tried.
//!
//! # Example
//!
//! ```rust,no_run
//! use hashtree_blossom::{BlossomClient, BlossomStore};
//! use hashtree_core::Store;
//! use nostr::Keys;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = BlossomClient::new(Keys::generate())
//!         .with_servers(vec!["https://blossom.example.com".to_string()]);
//!     let store = BlossomStore::new(client);
//!
//!     let hash = store.put(b"hello world".to_vec()).await?;
//!     assert_eq!(store.get(&hash).await?, Some(b"hello world".to_vec()));
//!     Ok(())
//! }
//! ```

mod auth;
mod client;
mod store;

pub use auth::{AuthAction, AuthSigner, AUTH_KIND, AUTH_TTL_SECS};
pub use client::{BlossomClient, DEFAULT_TIMEOUT};
pub use store::BlossomStore;

use hashtree_core::StoreError;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BlossomError {
    #[error("No servers configured")]
    NoServers,

    #[error("Invalid blob hash: {0}")]
    InvalidHash(String),

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("Authorization denied: {0}")]
    AuthorizationDenied(String),

    #[error("All servers unreachable: {0}")]
    AllServersUnreachable(String),
}

impl From<BlossomError> for StoreError {
    fn from(e: BlossomError) -> Self {
        match e {
            BlossomError::Signing(msg) => {
                StoreError::AuthorizationDenied(format!("signing failed: {}", msg))
            }
            BlossomError::AuthorizationDenied(msg) => StoreError::AuthorizationDenied(msg),
            BlossomError::AllServersUnreachable(msg) => StoreError::AllServersUnreachable(msg),
            BlossomError::NoServers => {
                StoreError::AllServersUnreachable("no servers configured".to_string())
            }
            BlossomError::InvalidHash(msg) => StoreError::Other(msg),
        }
    }
}

/// Compute SHA256 hash of data, returning hex string
pub fn compute_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
