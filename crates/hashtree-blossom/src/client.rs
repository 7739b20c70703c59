//! HTTP client for Blossom servers with ordered failover

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Response, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::auth::{auth_event, auth_header, AuthAction, AuthSigner};
use crate::{compute_sha256, BlossomError};

/// Per-server request timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Why a single server did not serve a request
#[derive(Debug)]
enum Failure {
    /// The server rejected the signed event
    Denied(String),
    /// The server answered 404
    Missing,
    /// Timeout, connection error, bad status or corrupt data
    Failed(String),
}

impl Failure {
    fn from_status(server: &str, status: StatusCode) -> Self {
        match status {
            StatusCode::NOT_FOUND => Failure::Missing,
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Failure::Denied(format!("{} returned {}", server, status))
            }
            _ => Failure::Failed(format!("{} returned {}", server, status)),
        }
    }

    fn from_request(server: &str, e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Failure::Failed(format!("{} timed out", server))
        } else {
            Failure::Failed(format!("{}: {}", server, e))
        }
    }
}

/// Failures collected while walking the server list
#[derive(Debug, Default)]
struct Attempts {
    denied: Option<String>,
    missing: bool,
    errors: Vec<String>,
}

impl Attempts {
    fn record(&mut self, failure: Failure) {
        match failure {
            Failure::Denied(msg) => {
                warn!("blossom auth rejected: {}", msg);
                self.denied.get_or_insert(msg);
            }
            Failure::Missing => self.missing = true,
            Failure::Failed(msg) => {
                debug!("blossom server failed: {}", msg);
                self.errors.push(msg);
            }
        }
    }

    /// True when the blob is absent rather than unreachable
    fn is_missing(&self) -> bool {
        self.missing && self.denied.is_none()
    }

    fn into_error(self) -> BlossomError {
        match self.denied {
            Some(msg) => BlossomError::AuthorizationDenied(msg),
            None if self.errors.is_empty() => {
                BlossomError::AllServersUnreachable("no server holds the blob".to_string())
            }
            None => BlossomError::AllServersUnreachable(self.errors.join("; ")),
        }
    }
}

fn check_hash(hash: &str) -> Result<(), BlossomError> {
    if hash.len() == 64 && hash.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
        Ok(())
    } else {
        Err(BlossomError::InvalidHash(hash.to_string()))
    }
}

fn blob_url(server: &str, hash: &str) -> String {
    format!("{}/{}", server.trim_end_matches('/'), hash)
}

/// Blossom protocol client
#[derive(Clone)]
pub struct BlossomClient {
    signer: Arc<dyn AuthSigner>,
    /// Servers for reading (download)
    read_servers: Vec<String>,
    /// Servers for writing (upload)
    write_servers: Vec<String>,
    http: reqwest::Client,
    timeout: Duration,
}

impl BlossomClient {
    /// Create a client with no servers configured
    pub fn new<S: AuthSigner + 'static>(signer: S) -> Self {
        Self::with_signer(Arc::new(signer))
    }

    pub fn with_signer(signer: Arc<dyn AuthSigner>) -> Self {
        Self {
            signer,
            read_servers: vec![],
            write_servers: vec![],
            http: reqwest::Client::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Set the Blossom servers to use (for both read and write)
    pub fn with_servers(mut self, servers: Vec<String>) -> Self {
        self.read_servers = servers.clone();
        self.write_servers = servers;
        self
    }

    /// Set read-only servers (for downloads)
    pub fn with_read_servers(mut self, servers: Vec<String>) -> Self {
        self.read_servers = servers;
        self
    }

    /// Set write servers (for uploads)
    pub fn with_write_servers(mut self, servers: Vec<String>) -> Self {
        self.write_servers = servers;
        self
    }

    /// Bound each request to a single server before moving to the next
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn read_servers(&self) -> &[String] {
        &self.read_servers
    }

    pub fn write_servers(&self) -> &[String] {
        &self.write_servers
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn authorize(&self, action: AuthAction, hash: &str) -> Result<String, BlossomError> {
        let event = self.signer.sign(auth_event(action, hash)).await?;
        Ok(auth_header(&event))
    }

    /// Upload data, returning its hash and whether a server newly stored it
    pub async fn upload(&self, data: &[u8]) -> Result<(String, bool), BlossomError> {
        let hash = compute_sha256(data);
        let created = self.upload_hashed(&hash, data).await?;
        Ok((hash, created))
    }

    /// Upload data whose hash the caller already knows.
    ///
    /// Stops at the first server that accepts the blob. A 409 answer means
    /// the server already holds it and counts as success.
    pub async fn upload_hashed(&self, hash: &str, data: &[u8]) -> Result<bool, BlossomError> {
        check_hash(hash)?;
        if self.write_servers.is_empty() {
            return Err(BlossomError::NoServers);
        }
        let auth = self.authorize(AuthAction::Upload, hash).await?;

        let mut attempts = Attempts::default();
        for server in &self.write_servers {
            match self.upload_to_server(server, data, hash, &auth).await {
                Ok(created) => {
                    if created {
                        debug!("uploaded {} to {}", &hash[..12], server);
                    } else {
                        debug!("blob {} already on {}", &hash[..12], server);
                    }
                    return Ok(created);
                }
                Err(failure) => attempts.record(failure),
            }
        }
        Err(attempts.into_error())
    }

    async fn upload_to_server(
        &self,
        server: &str,
        data: &[u8],
        hash: &str,
        auth: &str,
    ) -> Result<bool, Failure> {
        let url = format!("{}/upload", server.trim_end_matches('/'));
        let resp = self
            .http
            .put(&url)
            .timeout(self.timeout)
            .header(AUTHORIZATION, auth)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header("X-SHA-256", hash)
            .body(data.to_vec())
            .send()
            .await
            .map_err(|e| Failure::from_request(server, e))?;

        match resp.status() {
            status if status.is_success() => Ok(true),
            StatusCode::CONFLICT => Ok(false),
            status => Err(Failure::from_status(server, status)),
        }
    }

    /// Download a blob, verifying its hash.
    ///
    /// Returns `Ok(None)` when some server reported the blob missing and no
    /// server rejected our credentials.
    pub async fn download(&self, hash: &str) -> Result<Option<Vec<u8>>, BlossomError> {
        check_hash(hash)?;
        if self.read_servers.is_empty() {
            return Err(BlossomError::NoServers);
        }
        let auth = self.authorize(AuthAction::Get, hash).await?;

        let mut attempts = Attempts::default();
        for server in &self.read_servers {
            match self.download_from_server(server, hash, &auth).await {
                Ok(data) => {
                    debug!("downloaded {} ({} bytes) from {}", &hash[..12], data.len(), server);
                    return Ok(Some(data));
                }
                Err(failure) => attempts.record(failure),
            }
        }
        if attempts.is_missing() {
            Ok(None)
        } else {
            Err(attempts.into_error())
        }
    }

    async fn download_from_server(
        &self,
        server: &str,
        hash: &str,
        auth: &str,
    ) -> Result<Vec<u8>, Failure> {
        let resp = self.send_get(server, hash, auth).await?;
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| Failure::from_request(server, e))?;

        let computed = compute_sha256(&bytes);
        if computed != hash {
            warn!(
                "hash mismatch downloading {} from {}: got {} ({} bytes)",
                hash,
                server,
                &computed[..12],
                bytes.len()
            );
            return Err(Failure::Failed(format!("{} served corrupt data", server)));
        }
        Ok(bytes.to_vec())
    }

    async fn send_get(&self, server: &str, hash: &str, auth: &str) -> Result<Response, Failure> {
        let resp = self
            .http
            .get(blob_url(server, hash))
            .timeout(self.timeout)
            .header(AUTHORIZATION, auth)
            .send()
            .await
            .map_err(|e| Failure::from_request(server, e))?;
        if resp.status().is_success() {
            Ok(resp)
        } else {
            Err(Failure::from_status(server, resp.status()))
        }
    }

    /// Check whether any read server holds the blob
    pub async fn exists(&self, hash: &str) -> Result<bool, BlossomError> {
        check_hash(hash)?;
        if self.read_servers.is_empty() {
            return Err(BlossomError::NoServers);
        }
        let auth = self.authorize(AuthAction::Get, hash).await?;

        let mut attempts = Attempts::default();
        for server in &self.read_servers {
            let result = self
                .http
                .head(blob_url(server, hash))
                .timeout(self.timeout)
                .header(AUTHORIZATION, &auth)
                .send()
                .await;
            match result {
                Ok(resp) if resp.status().is_success() => return Ok(true),
                Ok(resp) => attempts.record(Failure::from_status(server, resp.status())),
                Err(e) => attempts.record(Failure::from_request(server, e)),
            }
        }
        if attempts.is_missing() {
            Ok(false)
        } else {
            Err(attempts.into_error())
        }
    }

    /// Delete a blob from every write server.
    ///
    /// Returns true if at least one server removed it.
    pub async fn delete(&self, hash: &str) -> Result<bool, BlossomError> {
        check_hash(hash)?;
        if self.write_servers.is_empty() {
            return Err(BlossomError::NoServers);
        }
        let auth = self.authorize(AuthAction::Delete, hash).await?;

        let mut deleted = false;
        let mut attempts = Attempts::default();
        for server in &self.write_servers {
            let result = self
                .http
                .delete(blob_url(server, hash))
                .timeout(self.timeout)
                .header(AUTHORIZATION, &auth)
                .send()
                .await;
            match result {
                Ok(resp) if resp.status().is_success() => deleted = true,
                Ok(resp) => attempts.record(Failure::from_status(server, resp.status())),
                Err(e) => attempts.record(Failure::from_request(server, e)),
            }
        }
        if deleted || attempts.is_missing() {
            Ok(deleted)
        } else {
            Err(attempts.into_error())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::Keys;

    #[test]
    fn test_classification() {
        let mut attempts = Attempts::default();
        attempts.record(Failure::Failed("a timed out".into()));
        attempts.record(Failure::Missing);
        assert!(attempts.is_missing());

        attempts.record(Failure::Denied("b returned 401".into()));
        assert!(!attempts.is_missing());
        assert!(matches!(
            attempts.into_error(),
            BlossomError::AuthorizationDenied(msg) if msg.contains("401")
        ));

        let mut attempts = Attempts::default();
        attempts.record(Failure::from_status("c", StatusCode::INTERNAL_SERVER_ERROR));
        attempts.record(Failure::from_status("d", StatusCode::BAD_GATEWAY));
        assert!(!attempts.is_missing());
        match attempts.into_error() {
            BlossomError::AllServersUnreachable(msg) => {
                assert!(msg.contains("c returned") && msg.contains("d returned"))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rejects_malformed_hash() {
        let client = BlossomClient::new(Keys::generate())
            .with_servers(vec!["http://127.0.0.1:1".to_string()]);
        assert!(matches!(
            client.download("not-a-hash").await,
            Err(BlossomError::InvalidHash(_))
        ));
        assert!(matches!(
            client.exists(&"AB".repeat(32)).await,
            Err(BlossomError::InvalidHash(_))
        ));
    }

    #[tokio::test]
    async fn test_no_servers() {
        let client = BlossomClient::new(Keys::generate());
        assert!(matches!(client.upload(b"x").await, Err(BlossomError::NoServers)));
        assert!(matches!(
            client.download(&compute_sha256(b"x")).await,
            Err(BlossomError::NoServers)
        ));
    }

    #[test]
    fn test_blob_url() {
        assert_eq!(blob_url("https://a.example/", "ff"), "https://a.example/ff");
        assert_eq!(blob_url("https://a.example", "ff"), "https://a.example/ff");
    }
}
