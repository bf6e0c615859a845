//! File-backed provider.
//!
//! Each object is a JSON document under `<root>/<kind>/<id>.json`. It has no
//! external side effects, which makes the engine usable end to end on a
//! single machine.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::ProviderError;
use crate::model::{Address, AttrMap, ResourceSchema};

use super::{derive_outputs, Created, Provider, ProviderResult};

/// Provider name used in declarations.
pub const LOCAL_PROVIDER: &str = "local";

/// Stored object document.
#[derive(Debug, Serialize, Deserialize)]
struct ObjectDocument {
    address: Address,
    attributes: AttrMap,
    outputs: AttrMap,
}

/// Provider storing objects as JSON files.
#[derive(Debug, Clone)]
pub struct LocalProvider {
    root: PathBuf,
}

impl LocalProvider {
    /// Creates a provider rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, kind: &str, id: &str) -> PathBuf {
        self.root.join(kind).join(format!("{id}.json"))
    }

    async fn write_document(&self, path: &Path, document: &ObjectDocument) -> ProviderResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(io_error)?;
        }
        let content = serde_json::to_vec_pretty(document)
            .map_err(|e| ProviderError::InvalidResponse { message: e.to_string() })?;
        let temp = path.with_extension("tmp");
        fs::write(&temp, content).await.map_err(io_error)?;
        fs::rename(&temp, path).await.map_err(io_error)
    }

    async fn read_document(&self, path: &Path, id: &str) -> ProviderResult<ObjectDocument> {
        let content = match fs::read(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(ProviderError::NotFound { id: id.to_string() });
            }
            Err(e) => return Err(io_error(e)),
        };
        serde_json::from_slice(&content).map_err(|e| ProviderError::InvalidResponse {
            message: format!("{}: {e}", path.display()),
        })
    }
}

fn io_error(e: std::io::Error) -> ProviderError {
    ProviderError::unavailable(e.to_string())
}

#[async_trait]
impl Provider for LocalProvider {
    fn name(&self) -> &str {
        LOCAL_PROVIDER
    }

    async fn create(
        &self,
        address: &Address,
        schema: &ResourceSchema,
        attributes: &AttrMap,
    ) -> ProviderResult<Created> {
        let id = Uuid::new_v4().simple().to_string();
        let outputs = derive_outputs(LOCAL_PROVIDER, schema, &id, attributes);

        let document = ObjectDocument {
            address: address.clone(),
            attributes: attributes.clone(),
            outputs: outputs.clone(),
        };
        self.write_document(&self.object_path(&address.kind, &id), &document)
            .await?;

        info!(%address, %id, "local object created");
        Ok(Created { id, outputs })
    }

    async fn read(&self, address: &Address, id: &str) -> ProviderResult<AttrMap> {
        let document = self
            .read_document(&self.object_path(&address.kind, id), id)
            .await?;
        Ok(document.attributes)
    }

    async fn update(
        &self,
        address: &Address,
        schema: &ResourceSchema,
        id: &str,
        attributes: &AttrMap,
    ) -> ProviderResult<AttrMap> {
        let path = self.object_path(&address.kind, id);
        let mut document = self.read_document(&path, id).await?;

        document.attributes = attributes.clone();
        document.outputs = derive_outputs(LOCAL_PROVIDER, schema, id, attributes);
        self.write_document(&path, &document).await?;

        debug!(%address, %id, "local object updated");
        Ok(document.outputs)
    }

    async fn delete(&self, address: &Address, id: &str) -> ProviderResult<()> {
        match fs::remove_file(self.object_path(&address.kind, id)).await {
            Ok(()) => {
                info!(%address, %id, "local object deleted");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(ProviderError::NotFound { id: id.to_string() })
            }
            Err(e) => Err(io_error(e)),
        }
    }
}
