//! In-memory artifact store for tests and dry runs.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;

use crate::storage::{ArtifactStore, Metadata, Result, StorageError, encode_key};

/// A stored object.
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub body: Bytes,
    pub content_type: String,
    pub metadata: Metadata,
}

/// Keeps uploaded objects in a map. Clones share the same map.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    base_url: String,
    objects: Arc<Mutex<HashMap<String, StoredObject>>>,
    reject_with: Option<String>,
}

impl MemoryStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            objects: Arc::new(Mutex::new(HashMap::new())),
            reject_with: None,
        }
    }

    /// A store whose every upload fails with `message`.
    pub fn rejecting(message: impl Into<String>) -> Self {
        Self {
            reject_with: Some(message.into()),
            ..Self::new("memory://rejected")
        }
    }

    pub fn get(&self, key: &str) -> Option<StoredObject> {
        self.objects
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(key)
            .cloned()
    }

    /// Stored keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self
            .objects
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.objects.lock().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ArtifactStore for MemoryStore {
    async fn put(
        &self,
        local_path: &Path,
        key: &str,
        content_type: &str,
        metadata: &Metadata,
    ) -> Result<String> {
        if let Some(message) = &self.reject_with {
            return Err(StorageError::Rejected {
                status: 403,
                message: message.clone(),
            });
        }

        let body = Bytes::from(tokio::fs::read(local_path).await?);
        self.objects
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(
                key.to_string(),
                StoredObject {
                    body,
                    content_type: content_type.to_string(),
                    metadata: metadata.clone(),
                },
            );
        Ok(format!("{}/{}", self.base_url, encode_key(key)))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
