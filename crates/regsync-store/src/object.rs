//! Object-store backed JSON documents
//!
//! Checkpoints, locks, manifests and the alias table are small JSON
//! documents under a common root in the object store:
//!
//! ```text
//! <root>/checkpoints/<job>/<partition>.json
//! <root>/locks/<job-class>.json
//! <root>/manifests/<partition>/<brand>/<category>.json
//! <root>/aliases/brands.json
//! ```
//!
//! Conditional writes map to `PutMode::Create` and `PutMode::Update`. Backends
//! without conditional-put support (e.g. the local filesystem) fall back to a
//! read-then-write, which keeps locks advisory rather than enforced.

use std::sync::Arc;

use async_trait::async_trait;
use futures::TryStreamExt;
use object_store::path::Path;
use object_store::{ObjectStore, PutMode, PutPayload, UpdateVersion};
use tracing::debug;

use crate::{JsonStore, Result, Versioned};

pub struct ObjectJsonStore {
    store: Arc<dyn ObjectStore>,
    root: String,
}

impl ObjectJsonStore {
    pub fn new(store: Arc<dyn ObjectStore>, root: impl Into<String>) -> Self {
        let root = root.into().trim_matches('/').to_string();
        Self { store, root }
    }

    fn path(&self, key: &str) -> Path {
        if self.root.is_empty() {
            Path::from(key)
        } else {
            Path::from(format!("{}/{}", self.root, key))
        }
    }

    fn key_of(&self, location: &Path) -> String {
        let full = location.as_ref();
        if self.root.is_empty() {
            full.to_string()
        } else {
            full.strip_prefix(&format!("{}/", self.root))
                .unwrap_or(full)
                .to_string()
        }
    }

    fn payload(value: &serde_json::Value) -> Result<PutPayload> {
        Ok(PutPayload::from(serde_json::to_vec(value)?))
    }
}

#[async_trait]
impl JsonStore for ObjectJsonStore {
    async fn get_json(&self, key: &str) -> Result<Option<Versioned<serde_json::Value>>> {
        match self.store.get(&self.path(key)).await {
            Ok(result) => {
                let version = result.meta.e_tag.clone();
                let bytes = result.bytes().await?;
                let value = serde_json::from_slice(&bytes)?;
                Ok(Some(Versioned { value, version }))
            }
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put_json(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        self.store.put(&self.path(key), Self::payload(value)?).await?;
        Ok(())
    }

    async fn put_json_if_absent(&self, key: &str, value: &serde_json::Value) -> Result<bool> {
        let path = self.path(key);
        match self
            .store
            .put_opts(&path, Self::payload(value)?, PutMode::Create.into())
            .await
        {
            Ok(_) => Ok(true),
            Err(object_store::Error::AlreadyExists { .. }) => Ok(false),
            Err(object_store::Error::NotImplemented) => {
                debug!(key = %key, "conditional create unsupported, falling back to read-then-write");
                if self.get_json(key).await?.is_some() {
                    return Ok(false);
                }
                self.put_json(key, value).await?;
                Ok(true)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn put_json_if_version(
        &self,
        key: &str,
        value: &serde_json::Value,
        version: Option<&str>,
    ) -> Result<bool> {
        let Some(expected) = version else {
            // Nothing to compare against; only succeed if the key is still
            // unversioned.
            let current = self.get_json(key).await?;
            if current.as_ref().and_then(|v| v.version.as_ref()).is_some() {
                return Ok(false);
            }
            self.put_json(key, value).await?;
            return Ok(true);
        };

        let path = self.path(key);
        let mode = PutMode::Update(UpdateVersion {
            e_tag: Some(expected.to_string()),
            version: None,
        });
        match self
            .store
            .put_opts(&path, Self::payload(value)?, mode.into())
            .await
        {
            Ok(_) => Ok(true),
            Err(object_store::Error::Precondition { .. }) => Ok(false),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(object_store::Error::NotImplemented) => {
                debug!(key = %key, "conditional update unsupported, falling back to read-then-write");
                let current = self.get_json(key).await?.and_then(|v| v.version);
                if current.as_deref() != Some(expected) {
                    return Ok(false);
                }
                self.put_json(key, value).await?;
                Ok(true)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match self.store.delete(&self.path(key)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix_path = self.path(prefix.trim_end_matches('/'));
        let metas: Vec<object_store::ObjectMeta> =
            self.store.list(Some(&prefix_path)).try_collect().await?;
        let mut keys: Vec<String> = metas.iter().map(|m| self.key_of(&m.location)).collect();
        keys.sort();
        Ok(keys)
    }
}
