//! In-process provider.
//!
//! Objects live in a map owned by the provider. Failures can be injected per
//! address, and every call is logged, which makes it the provider of choice
//! for dry runs and for exercising the executor in tests.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

use crate::error::ProviderError;
use crate::model::{Address, AttrMap, ResourceSchema};

use super::{derive_outputs, Created, Provider, ProviderResult};

/// How an injected failure behaves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureMode {
    /// Every call for the address is rejected with this message.
    Reject(String),
    /// The next `n` calls fail with a transient error, then calls succeed.
    Transient(u32),
}

/// Kind of provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// `create`
    Create,
    /// `read`
    Read,
    /// `update`
    Update,
    /// `delete`
    Delete,
}

/// A logged provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCall {
    /// Operation.
    pub kind: CallKind,
    /// Target address.
    pub address: Address,
    /// Object id, once known.
    pub id: Option<String>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    address: Address,
    attributes: AttrMap,
    outputs: AttrMap,
}

/// In-process provider with failure injection and a call log.
#[derive(Debug)]
pub struct MemoryProvider {
    name: String,
    schemas: Vec<ResourceSchema>,
    objects: Mutex<BTreeMap<String, StoredObject>>,
    failures: Mutex<HashMap<Address, FailureMode>>,
    calls: Mutex<Vec<ProviderCall>>,
    next_id: AtomicU64,
    latency: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MemoryProvider {
    /// Creates an empty provider registered under `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schemas: Vec::new(),
            objects: Mutex::new(BTreeMap::new()),
            failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            latency: None,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Adds a built-in schema.
    #[must_use]
    pub fn with_schema(mut self, schema: ResourceSchema) -> Self {
        self.schemas.push(schema);
        self
    }

    /// Delays every mutating call.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Injects a failure for calls targeting `address`.
    pub fn fail_on(&self, address: Address, mode: FailureMode) {
        lock(&self.failures).insert(address, mode);
    }

    /// Returns the call log.
    #[must_use]
    pub fn calls(&self) -> Vec<ProviderCall> {
        lock(&self.calls).clone()
    }

    /// Returns the logged calls of one kind, in order.
    #[must_use]
    pub fn calls_of(&self, kind: CallKind) -> Vec<Address> {
        lock(&self.calls)
            .iter()
            .filter(|c| c.kind == kind)
            .map(|c| c.address.clone())
            .collect()
    }

    /// Returns the highest number of concurrent mutating calls observed.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Returns the live object ids for an address.
    #[must_use]
    pub fn objects_for(&self, address: &Address) -> Vec<String> {
        lock(&self.objects)
            .iter()
            .filter(|(_, o)| &o.address == address)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Changes an attribute out of band, simulating drift.
    pub fn set_remote_attribute(&self, id: &str, key: &str, value: serde_json::Value) {
        if let Some(object) = lock(&self.objects).get_mut(id) {
            object.attributes.insert(key.to_string(), value);
        }
    }

    /// Deletes an object out of band, simulating external removal.
    pub fn forget(&self, id: &str) {
        lock(&self.objects).remove(id);
    }

    fn record(&self, kind: CallKind, address: &Address, id: Option<&str>) {
        lock(&self.calls).push(ProviderCall {
            kind,
            address: address.clone(),
            id: id.map(ToString::to_string),
        });
    }

    fn injected_failure(&self, address: &Address) -> ProviderResult<()> {
        let mut failures = lock(&self.failures);
        match failures.get_mut(address) {
            Some(FailureMode::Reject(message)) => Err(ProviderError::rejected(message.clone())),
            Some(FailureMode::Transient(remaining)) if *remaining > 0 => {
                *remaining -= 1;
                Err(ProviderError::unavailable(format!("injected transient failure for {address}")))
            }
            _ => Ok(()),
        }
    }

    async fn begin(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        InFlight(&self.in_flight)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl Provider for MemoryProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn schemas(&self) -> Vec<ResourceSchema> {
        self.schemas.clone()
    }

    async fn create(
        &self,
        address: &Address,
        schema: &ResourceSchema,
        attributes: &AttrMap,
    ) -> ProviderResult<Created> {
        let _in_flight = self.begin().await;
        self.record(CallKind::Create, address, None);
        self.injected_failure(address)?;

        let id = format!(
            "{}-{}",
            address.kind,
            self.next_id.fetch_add(1, Ordering::SeqCst)
        );
        let outputs = derive_outputs(&self.name, schema, &id, attributes);

        lock(&self.objects).insert(
            id.clone(),
            StoredObject {
                address: address.clone(),
                attributes: attributes.clone(),
                outputs: outputs.clone(),
            },
        );
        debug!(%address, %id, "memory object created");

        Ok(Created { id, outputs })
    }

    async fn read(&self, address: &Address, id: &str) -> ProviderResult<AttrMap> {
        self.record(CallKind::Read, address, Some(id));
        self.injected_failure(address)?;

        lock(&self.objects)
            .get(id)
            .map(|o| o.attributes.clone())
            .ok_or_else(|| ProviderError::NotFound { id: id.to_string() })
    }

    async fn update(
        &self,
        address: &Address,
        schema: &ResourceSchema,
        id: &str,
        attributes: &AttrMap,
    ) -> ProviderResult<AttrMap> {
        let _in_flight = self.begin().await;
        self.record(CallKind::Update, address, Some(id));
        self.injected_failure(address)?;

        let mut objects = lock(&self.objects);
        let object = objects
            .get_mut(id)
            .ok_or_else(|| ProviderError::NotFound { id: id.to_string() })?;
        object.attributes = attributes.clone();
        object.outputs = derive_outputs(&self.name, schema, id, attributes);
        Ok(object.outputs.clone())
    }

    async fn delete(&self, address: &Address, id: &str) -> ProviderResult<()> {
        let _in_flight = self.begin().await;
        self.record(CallKind::Delete, address, Some(id));
        self.injected_failure(address)?;

        lock(&self.objects)
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| ProviderError::NotFound { id: id.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> ResourceSchema {
        ResourceSchema::new("queue").output("arn")
    }

    #[tokio::test]
    async fn test_crud_cycle() {
        let provider = MemoryProvider::new("memory");
        let address = Address::new("queue", "a");
        let attrs = AttrMap::from([(String::from("name"), json!("a"))]);

        let created = provider.create(&address, &schema(), &attrs).await.expect("create");
        assert_eq!(created.outputs["arn"], json!(format!("memory://queue/{}/arn", created.id)));
        assert_eq!(provider.read(&address, &created.id).await.expect("read"), attrs);

        let updated = AttrMap::from([(String::from("name"), json!("b"))]);
        provider
            .update(&address, &schema(), &created.id, &updated)
            .await
            .expect("update");
        assert_eq!(provider.read(&address, &created.id).await.expect("read"), updated);

        provider.delete(&address, &created.id).await.expect("delete");
        assert!(matches!(
            provider.read(&address, &created.id).await,
            Err(ProviderError::NotFound { .. })
        ));
        assert_eq!(provider.calls().len(), 6);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let provider = MemoryProvider::new("memory");
        let address = Address::new("queue", "a");

        provider.fail_on(address.clone(), FailureMode::Transient(1));
        let first = provider.create(&address, &schema(), &AttrMap::new()).await;
        assert!(matches!(first, Err(ref e) if e.is_retryable()));
        assert!(provider.create(&address, &schema(), &AttrMap::new()).await.is_ok());

        provider.fail_on(address.clone(), FailureMode::Reject(String::from("quota exceeded")));
        let err = provider
            .create(&address, &schema(), &AttrMap::new())
            .await
            .expect_err("rejected");
        assert_eq!(err.to_string(), "quota exceeded");
    }
}
