use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use super::ObjectStore;
use crate::error::{PipelineError, Result};

/// A stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub body: Vec<u8>,
    pub content_type: String,
}

/// In-memory object store for tests.
#[derive(Debug)]
pub struct MemoryObjectStore {
    bucket: String,
    endpoint: String,
    objects: RwLock<HashMap<String, StoredObject>>,
}

impl MemoryObjectStore {
    #[must_use]
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            endpoint: "http://memory.local".to_string(),
            objects: RwLock::new(HashMap::new()),
        }
    }

    /// Stored object under `key`, if any.
    #[must_use]
    pub fn object(&self, key: &str) -> Option<StoredObject> {
        self.objects
            .read()
            .ok()
            .and_then(|objects| objects.get(key).cloned())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<()> {
        self.objects
            .write()
            .map_err(|_| PipelineError::SourceUpload("object store lock poisoned".to_string()))?
            .insert(
                key.to_string(),
                StoredObject {
                    body,
                    content_type: content_type.to_string(),
                },
            );
        Ok(())
    }
}
