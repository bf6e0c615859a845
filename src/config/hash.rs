//! Declaration hashing for change detection.
//!
//! This module provides deterministic hashing of declarations and resolved
//! attribute maps. State records carry an attribute hash so refresh can
//! detect drift cheaply, and run history records the declaration hash.

use sha2::{Digest, Sha256};

use crate::model::AttrMap;

use super::spec::{DeclarationFile, ResourceDecl};

/// Hasher for computing declaration hashes.
#[derive(Debug, Default)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes a hash of the entire declaration.
    ///
    /// Resources are hashed in address order, so reordering the file does
    /// not change the hash.
    #[must_use]
    pub fn hash_declaration(&self, declaration: &DeclarationFile) -> String {
        let mut hasher = Sha256::new();

        hasher.update(declaration.project.name.as_bytes());
        hasher.update(declaration.project.environment.as_bytes());

        for (kind, config) in &declaration.kinds {
            hasher.update(kind.as_bytes());
            hasher.update(canonical_bytes(config));
        }

        let mut resources: Vec<&ResourceDecl> = declaration.resources.iter().collect();
        resources.sort_by_key(|r| r.address());
        for resource in resources {
            hasher.update(self.hash_resource(resource).as_bytes());
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a hash for a single resource declaration.
    #[must_use]
    pub fn hash_resource(&self, resource: &ResourceDecl) -> String {
        let mut hasher = Sha256::new();

        hasher.update(resource.address().as_bytes());
        hasher.update(canonical_bytes(&resource.attributes));

        let mut deps: Vec<&String> = resource.depends_on.iter().collect();
        deps.sort();
        for dep in deps {
            hasher.update(dep.as_bytes());
        }

        hasher.update([
            u8::from(resource.lifecycle.create_before_destroy),
            u8::from(resource.lifecycle.prevent_destroy),
        ]);

        hex::encode(hasher.finalize())
    }

    /// Computes a hash of resolved attributes as stored in state.
    #[must_use]
    pub fn hash_attributes(&self, attributes: &AttrMap) -> String {
        let mut hasher = Sha256::new();
        hasher.update(canonical_bytes(attributes));
        hex::encode(hasher.finalize())
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }

    /// Compares two hashes to determine if they are equal.
    #[must_use]
    pub fn hashes_match(hash1: &str, hash2: &str) -> bool {
        if hash1.len() != hash2.len() {
            return false;
        }

        hash1
            .bytes()
            .zip(hash2.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

/// JSON encoding of a value. Maps in this crate are `BTreeMap`s, so the
/// encoding is stable across runs.
fn canonical_bytes<T: serde::Serialize + ?Sized>(value: &T) -> Vec<u8> {
    serde_json::to_vec(value).unwrap_or_default()
}
