use async_trait::async_trait;
use hashtree_core::{to_hex, Hash, Store, StoreError};

use crate::BlossomClient;

/// Remote store backed by Blossom servers.
///
/// Usually the remote half of a [`hashtree_core::FallbackStore`]: errors
/// carry the remote taxonomy (`AuthorizationDenied`,
/// `AllServersUnreachable`) and a blob no server holds reads as `None`.
#[derive(Clone)]
pub struct BlossomStore {
    client: BlossomClient,
}

impl BlossomStore {
    pub fn new(client: BlossomClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &BlossomClient {
        &self.client
    }
}

#[async_trait]
impl Store for BlossomStore {
    async fn put_hashed(&self, hash: Hash, data: Vec<u8>) -> Result<bool, StoreError> {
        Ok(self.client.upload_hashed(&to_hex(&hash), &data).await?)
    }

    async fn get(&self, hash: &Hash) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.client.download(&to_hex(hash)).await?)
    }

    async fn has(&self, hash: &Hash) -> Result<bool, StoreError> {
        Ok(self.client.exists(&to_hex(hash)).await?)
    }

    async fn delete(&self, hash: &Hash) -> Result<bool, StoreError> {
        Ok(self.client.delete(&to_hex(hash)).await?)
    }
}
