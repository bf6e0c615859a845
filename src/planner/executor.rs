//! Apply executor for execution plans.
//!
//! A bounded pool of tokio workers claims ready steps from a shared
//! coordinator. The coordination lock is held only to claim a step or record
//! its outcome; provider calls and state writes happen outside it, under a
//! per-address async lock. A failed step blocks its transitive dependents
//! while independent branches keep going.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::ApplySettings;
use crate::error::{ConvergeError, ProviderError, Result};
use crate::model::{Address, AttrMap, Reference, Resource, ResourceSchema};
use crate::provider::{Provider, ProviderRegistry, ProviderResult};
use crate::state::{DeposedObject, StateRecord, StateStore};

use super::diff::{Change, ReplaceOrder};
use super::plan::{ExecutionPlan, PlanStep, StepOp};

/// Cooperative cancellation flag shared with the caller.
///
/// Once cancelled, in-flight steps finish and no new step starts.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Creates a token that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns true once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Final outcome of a step or a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResourceOutcome {
    /// Every step succeeded.
    Applied,
    /// A provider call or state write failed.
    Failed {
        /// Root-cause error, verbatim.
        reason: String,
    },
    /// Not attempted because a dependency failed.
    Skipped {
        /// Address of the failed resource blocking this one.
        blocking: Address,
    },
    /// Never started because the run was cancelled.
    Cancelled,
}

impl ResourceOutcome {
    const fn severity(&self) -> u8 {
        match self {
            Self::Applied => 0,
            Self::Cancelled => 1,
            Self::Skipped { .. } => 2,
            Self::Failed { .. } => 3,
        }
    }

    /// Returns true for [`ResourceOutcome::Applied`].
    #[must_use]
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// Report for one executed step.
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    /// Step index in the plan.
    pub index: usize,
    /// Resource address.
    pub address: Address,
    /// Operation.
    pub op: StepOp,
    /// Outcome.
    pub outcome: ResourceOutcome,
    /// Provider call attempts, retries included.
    pub attempts: u32,
    /// Wall time spent on the step.
    pub duration_ms: u64,
}

/// A deposed object whose cleanup did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingDeposed {
    /// Resource the object belonged to.
    pub address: Address,
    /// Provider id of the deposed object.
    pub id: String,
    /// Outcome of the cleanup step.
    pub outcome: ResourceOutcome,
}

/// Result of applying a plan.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ApplyResult {
    /// Outcome per resource, from its create, update or delete steps.
    pub outcomes: BTreeMap<Address, ResourceOutcome>,
    /// Deposed objects left in place; the next run destroys them.
    pub pending_deposed: Vec<PendingDeposed>,
    /// Per-step reports, in plan order.
    pub steps: Vec<StepReport>,
}

impl ApplyResult {
    fn from_steps(steps: Vec<StepReport>) -> Self {
        let mut primary: BTreeMap<Address, ResourceOutcome> = BTreeMap::new();
        let mut cleanup: BTreeMap<Address, ResourceOutcome> = BTreeMap::new();
        let mut pending_deposed = Vec::new();

        for step in &steps {
            let outcomes = if let StepOp::DeleteDeposed { id } = &step.op {
                if !step.outcome.is_applied() {
                    pending_deposed.push(PendingDeposed {
                        address: step.address.clone(),
                        id: id.clone(),
                        outcome: step.outcome.clone(),
                    });
                }
                &mut cleanup
            } else {
                &mut primary
            };
            let worse = outcomes
                .get(&step.address)
                .is_none_or(|current| step.outcome.severity() > current.severity());
            if worse {
                outcomes.insert(step.address.clone(), step.outcome.clone());
            }
        }

        // Resources with only deposed cleanup are reported by that cleanup.
        for (address, outcome) in cleanup {
            primary.entry(address).or_insert(outcome);
        }
        pending_deposed.retain(|p| primary.get(&p.address).is_some_and(ResourceOutcome::is_applied));

        Self {
            outcomes: primary,
            pending_deposed,
            steps,
        }
    }

    /// Returns the applied addresses.
    #[must_use]
    pub fn applied(&self) -> Vec<&Address> {
        self.outcomes
            .iter()
            .filter(|(_, o)| o.is_applied())
            .map(|(a, _)| a)
            .collect()
    }

    /// Returns failed addresses with their reasons.
    #[must_use]
    pub fn failed(&self) -> Vec<(&Address, &str)> {
        self.outcomes
            .iter()
            .filter_map(|(a, o)| match o {
                ResourceOutcome::Failed { reason } => Some((a, reason.as_str())),
                _ => None,
            })
            .collect()
    }

    /// Returns skipped addresses with the failed address blocking each.
    #[must_use]
    pub fn skipped(&self) -> Vec<(&Address, &Address)> {
        self.outcomes
            .iter()
            .filter_map(|(a, o)| match o {
                ResourceOutcome::Skipped { blocking } => Some((a, blocking)),
                _ => None,
            })
            .collect()
    }

    /// Returns the cancelled addresses.
    #[must_use]
    pub fn cancelled(&self) -> Vec<&Address> {
        self.outcomes
            .iter()
            .filter(|(_, o)| **o == ResourceOutcome::Cancelled)
            .map(|(a, _)| a)
            .collect()
    }

    /// Returns true if every resource was applied and no deposed object
    /// was left behind.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcomes.values().all(ResourceOutcome::is_applied) && self.pending_deposed.is_empty()
    }

    /// Returns the outcome for an address.
    #[must_use]
    pub fn outcome(&self, address: &Address) -> Option<&ResourceOutcome> {
        self.outcomes.get(address)
    }
}

impl fmt::Display for ApplyResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} applied, {} failed, {} skipped",
            self.applied().len(),
            self.failed().len(),
            self.skipped().len()
        )?;
        let cancelled = self.cancelled().len();
        if cancelled > 0 {
            write!(f, ", {cancelled} cancelled")?;
        }
        if !self.pending_deposed.is_empty() {
            write!(f, ", {} deposed pending", self.pending_deposed.len())?;
        }
        Ok(())
    }
}

/// Executes plans against providers and persists state per step.
pub struct ApplyExecutor {
    registry: Arc<ProviderRegistry>,
    store: Arc<dyn StateStore>,
    parallelism: usize,
    max_retries: u32,
    retry_delay: Duration,
    cancel: CancelToken,
}

impl fmt::Debug for ApplyExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplyExecutor")
            .field("backend", &self.store.backend_type())
            .field("parallelism", &self.parallelism)
            .field("max_retries", &self.max_retries)
            .field("retry_delay", &self.retry_delay)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
enum StepState {
    Pending,
    Running,
    Done(ResourceOutcome),
}

#[derive(Debug)]
struct RunState {
    states: Vec<StepState>,
    attempts: Vec<u32>,
    durations: Vec<Duration>,
}

enum Claim {
    Step(usize),
    Wait,
    Done,
}

impl RunState {
    /// Settles blocked steps, then claims the first ready one.
    fn claim(&mut self, steps: &[PlanStep], cancelled: bool) -> Claim {
        self.settle_blocked(steps, cancelled);

        let mut pending = false;
        for step in steps {
            if !matches!(self.states[step.index], StepState::Pending) {
                continue;
            }
            pending = true;
            let ready = step.depends_on.iter().all(|&d| {
                matches!(self.states[d], StepState::Done(ResourceOutcome::Applied))
            });
            if ready {
                self.states[step.index] = StepState::Running;
                return Claim::Step(step.index);
            }
        }

        if pending { Claim::Wait } else { Claim::Done }
    }

    /// Marks pending steps that can no longer run. Dependencies always have
    /// lower indices, so one forward pass propagates transitively.
    fn settle_blocked(&mut self, steps: &[PlanStep], cancelled: bool) {
        for step in steps {
            if !matches!(self.states[step.index], StepState::Pending) {
                continue;
            }
            let blocked = step.depends_on.iter().find_map(|&d| match &self.states[d] {
                StepState::Done(ResourceOutcome::Failed { .. }) => Some(ResourceOutcome::Skipped {
                    blocking: steps[d].address.clone(),
                }),
                StepState::Done(outcome @ ResourceOutcome::Skipped { .. }) => Some(outcome.clone()),
                StepState::Done(ResourceOutcome::Cancelled) => Some(ResourceOutcome::Cancelled),
                _ => None,
            });

            if let Some(outcome) = blocked {
                self.states[step.index] = StepState::Done(outcome);
            } else if cancelled {
                self.states[step.index] = StepState::Done(ResourceOutcome::Cancelled);
            }
        }
    }
}

/// State shared by the workers of one run.
struct Run {
    plan: ExecutionPlan,
    registry: Arc<ProviderRegistry>,
    store: Arc<dyn StateStore>,
    records: Mutex<BTreeMap<Address, StateRecord>>,
    address_locks: BTreeMap<Address, tokio::sync::Mutex<()>>,
    coordinator: Mutex<RunState>,
    progress: Notify,
    cancel: CancelToken,
    max_retries: u32,
    retry_delay: Duration,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ApplyExecutor {
    /// Creates an executor with default settings.
    #[must_use]
    pub fn new(registry: Arc<ProviderRegistry>, store: Arc<dyn StateStore>) -> Self {
        let defaults = ApplySettings::default();
        Self {
            registry,
            store,
            parallelism: defaults.parallelism,
            max_retries: defaults.max_retries,
            retry_delay: Duration::from_millis(defaults.retry_delay_ms),
            cancel: CancelToken::new(),
        }
    }

    /// Applies parallelism and retry settings.
    #[must_use]
    pub fn with_settings(mut self, settings: &ApplySettings) -> Self {
        self.parallelism = settings.parallelism.max(1);
        self.max_retries = settings.max_retries;
        self.retry_delay = Duration::from_millis(settings.retry_delay_ms);
        self
    }

    /// Sets the worker count.
    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Uses an external cancellation token.
    #[must_use]
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Returns the cancellation token.
    #[must_use]
    pub const fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Applies a plan.
    ///
    /// Provider failures are contained in the result; an error is returned
    /// only if a worker task dies.
    ///
    /// # Errors
    ///
    /// Returns [`ConvergeError::Internal`] if a worker panics.
    pub async fn apply(&self, plan: &ExecutionPlan) -> Result<ApplyResult> {
        let step_count = plan.steps.len();
        info!(steps = step_count, parallelism = self.parallelism, "applying plan");

        let mut records = BTreeMap::new();
        for change in &plan.changes.changes {
            if let Some(prior) = &change.prior {
                records.entry(change.address.clone()).or_insert_with(|| prior.clone());
            }
        }
        let address_locks = plan
            .steps
            .iter()
            .map(|s| (s.address.clone(), tokio::sync::Mutex::new(())))
            .collect();

        let run = Arc::new(Run {
            plan: plan.clone(),
            registry: Arc::clone(&self.registry),
            store: Arc::clone(&self.store),
            records: Mutex::new(records),
            address_locks,
            coordinator: Mutex::new(RunState {
                states: vec![StepState::Pending; step_count],
                attempts: vec![0; step_count],
                durations: vec![Duration::ZERO; step_count],
            }),
            progress: Notify::new(),
            cancel: self.cancel.clone(),
            max_retries: self.max_retries,
            retry_delay: self.retry_delay,
        });

        let mut workers = JoinSet::new();
        for worker in 0..self.parallelism.min(step_count) {
            workers.spawn(Arc::clone(&run).work(worker));
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "apply worker failed");
                run.cancel.cancel();
                workers.abort_all();
                return Err(ConvergeError::internal(format!("apply worker failed: {e}")));
            }
        }

        let state = lock(&run.coordinator);
        let reports = plan
            .steps
            .iter()
            .map(|step| StepReport {
                index: step.index,
                address: step.address.clone(),
                op: step.op.clone(),
                outcome: match &state.states[step.index] {
                    StepState::Done(outcome) => outcome.clone(),
                    StepState::Pending | StepState::Running => ResourceOutcome::Cancelled,
                },
                attempts: state.attempts[step.index],
                duration_ms: u64::try_from(state.durations[step.index].as_millis()).unwrap_or(u64::MAX),
            })
            .collect();

        let result = ApplyResult::from_steps(reports);
        info!(%result, "apply finished");
        Ok(result)
    }
}

impl Run {
    async fn work(self: Arc<Self>, worker: usize) {
        loop {
            // Registered before checking so a completion in between is not missed.
            let progressed = self.progress.notified();

            let claim = lock(&self.coordinator).claim(&self.plan.steps, self.cancel.is_cancelled());
            match claim {
                Claim::Step(index) => {
                    debug!(worker, step = index, "claimed step");
                    let started = Instant::now();
                    let (outcome, attempts) = self.execute(index).await;
                    {
                        let mut state = lock(&self.coordinator);
                        state.states[index] = StepState::Done(outcome);
                        state.attempts[index] = attempts;
                        state.durations[index] = started.elapsed();
                    }
                    self.progress.notify_waiters();
                }
                Claim::Wait => progressed.await,
                Claim::Done => {
                    self.progress.notify_waiters();
                    return;
                }
            }
        }
    }

    async fn execute(&self, index: usize) -> (ResourceOutcome, u32) {
        let step = &self.plan.steps[index];
        let change = &self.plan.changes.changes[step.change];
        let _guard = match self.address_locks.get(&step.address) {
            Some(l) => Some(l.lock().await),
            None => None,
        };

        info!(address = %step.address, op = %step.op, "step started");
        let (result, attempts) = match &step.op {
            StepOp::NoOp => (self.publish_prior(&step.address), 0),
            StepOp::Create => self.create(change).await,
            StepOp::Update => self.update(change).await,
            StepOp::Delete => self.delete(&step.address).await,
            StepOp::DeleteDeposed { id } => self.delete_deposed(&step.address, id).await,
        };

        match result {
            Ok(()) => {
                info!(address = %step.address, op = %step.op, attempts, "step applied");
                (ResourceOutcome::Applied, attempts)
            }
            Err(reason) => {
                error!(address = %step.address, op = %step.op, %reason, "step failed");
                (ResourceOutcome::Failed { reason }, attempts)
            }
        }
    }

    fn publish_prior(&self, address: &Address) -> std::result::Result<(), String> {
        if lock(&self.records).contains_key(address) {
            Ok(())
        } else {
            Err(format!("no recorded state for {address}"))
        }
    }

    async fn create(&self, change: &Change) -> (std::result::Result<(), String>, u32) {
        let address = &change.address;
        let Some(resource) = &change.resource else {
            return (Err(format!("{address} is not declared")), 0);
        };
        let (provider, schema) = match self.kind(resource) {
            Ok(found) => found,
            Err(e) => return (Err(e.to_string()), 0),
        };
        let attributes = match self.resolve(resource) {
            Ok(attributes) => attributes,
            Err(e) => return (Err(e), 0),
        };

        let (created, attempts) = self
            .with_retry(address, || provider.create(address, &schema, &attributes))
            .await;
        let created = match created {
            Ok(created) => created,
            Err(e) => return (Err(e.to_string()), attempts),
        };

        let mut record = StateRecord::new(
            address.clone(),
            provider.name(),
            &created.id,
            attributes,
            created.outputs,
            resource.dependencies(),
        );
        let prior = lock(&self.records).get(address).cloned();
        if change.replace_order == Some(ReplaceOrder::CreateBeforeDestroy)
            && let Some(prior) = prior
        {
            record.deposed.clone_from(&prior.deposed);
            record.deposed.push(DeposedObject {
                id: prior.id,
                attributes: prior.attributes,
            });
        }

        debug!(%address, id = %created.id, "object created");
        (self.persist(record).await, attempts)
    }

    async fn update(&self, change: &Change) -> (std::result::Result<(), String>, u32) {
        let address = &change.address;
        let Some(resource) = &change.resource else {
            return (Err(format!("{address} is not declared")), 0);
        };
        let Some(mut record) = lock(&self.records).get(address).cloned() else {
            return (Err(format!("no recorded state for {address}")), 0);
        };
        let (provider, schema) = match self.kind(resource) {
            Ok(found) => found,
            Err(e) => return (Err(e.to_string()), 0),
        };
        let attributes = match self.resolve(resource) {
            Ok(attributes) => attributes,
            Err(e) => return (Err(e), 0),
        };

        let id = record.id.clone();
        let (outputs, attempts) = self
            .with_retry(address, || provider.update(address, &schema, &id, &attributes))
            .await;
        match outputs {
            Ok(outputs) => {
                record.set_attributes(attributes);
                record.outputs = outputs;
                record.dependencies = resource.dependencies();
                (self.persist(record).await, attempts)
            }
            Err(e) => (Err(e.to_string()), attempts),
        }
    }

    async fn delete(&self, address: &Address) -> (std::result::Result<(), String>, u32) {
        let Some(record) = lock(&self.records).get(address).cloned() else {
            debug!(%address, "nothing recorded, delete is a no-op");
            return (Ok(()), 0);
        };
        let (deleted, attempts) = self.delete_object(&record, &record.id).await;
        if let Err(e) = deleted {
            return (Err(e), attempts);
        }

        if let Err(e) = self.store.remove(address).await {
            return (
                Err(format!("object {} deleted but state write failed: {e}", record.id)),
                attempts,
            );
        }
        lock(&self.records).remove(address);
        (Ok(()), attempts)
    }

    async fn delete_deposed(&self, address: &Address, id: &str) -> (std::result::Result<(), String>, u32) {
        let Some(record) = lock(&self.records).get(address).cloned() else {
            return (Err(format!("no recorded state for {address}")), 0);
        };
        let (deleted, attempts) = self.delete_object(&record, id).await;
        if let Err(e) = deleted {
            return (Err(e), attempts);
        }

        let mut record = record;
        record.deposed.retain(|d| d.id != id);
        (self.persist(record).await, attempts)
    }

    /// Deletes one object. A missing object counts as deleted.
    async fn delete_object(&self, record: &StateRecord, id: &str) -> (std::result::Result<(), String>, u32) {
        let address = &record.address;
        let provider = match self.registry.provider(&address.kind) {
            Ok(provider) => provider,
            Err(e) => match self.registry.provider_named(&record.provider) {
                Some(provider) => provider,
                None => return (Err(e.to_string()), 0),
            },
        };

        let (deleted, attempts) = self.with_retry(address, || provider.delete(address, id)).await;
        match deleted {
            Ok(()) => (Ok(()), attempts),
            Err(ProviderError::NotFound { .. }) => {
                warn!(%address, %id, "object already gone");
                (Ok(()), attempts)
            }
            Err(e) => (Err(e.to_string()), attempts),
        }
    }

    /// Saves a record and publishes its outputs to dependents.
    async fn persist(&self, record: StateRecord) -> std::result::Result<(), String> {
        if let Err(e) = self.store.save(&record.address, &record).await {
            return Err(format!("object {} applied but state write failed: {e}", record.id));
        }
        lock(&self.records).insert(record.address.clone(), record);
        Ok(())
    }

    fn kind(
        &self,
        resource: &Resource,
    ) -> std::result::Result<(Arc<dyn Provider>, ResourceSchema), ProviderError> {
        let provider = self.registry.provider(&resource.address.kind)?;
        let schema = self
            .registry
            .schema(&resource.address.kind)
            .cloned()
            .ok_or_else(|| ProviderError::Unsupported {
                kind: resource.address.kind.clone(),
            })?;
        Ok((provider, schema))
    }

    /// Resolves references against outputs published so far. Nulls are dropped.
    fn resolve(&self, resource: &Resource) -> std::result::Result<AttrMap, String> {
        let records = lock(&self.records);
        let lookup = |r: &Reference| records.get(&r.target).and_then(|rec| rec.output(&r.output));

        let mut attributes = AttrMap::new();
        for (name, value) in &resource.attributes {
            let Some(resolved) = value.resolve(&lookup) else {
                return Err(format!(
                    "attribute '{name}' of {} references an output that is not available",
                    resource.address
                ));
            };
            if !resolved.is_null() {
                attributes.insert(name.clone(), resolved);
            }
        }
        Ok(attributes)
    }

    /// Runs a provider call, retrying transient failures with linear back-off.
    async fn with_retry<T, F, Fut>(&self, address: &Address, mut call: F) -> (ProviderResult<T>, u32)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ProviderResult<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match call().await {
                Err(e) if e.is_retryable() && attempt <= self.max_retries => {
                    let mut delay = self.retry_delay.saturating_mul(attempt);
                    if let ProviderError::RateLimited { retry_after_ms } = &e {
                        delay = delay.max(Duration::from_millis(*retry_after_ms));
                    }
                    warn!(%address, attempt, delay = ?delay, error = %e, "retrying provider call");
                    tokio::time::sleep(delay).await;
                }
                result => return (result, attempt),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceDecl;
    use crate::graph::DependencyGraph;
    use crate::model::{AttributeSchema, AttributeType};
    use crate::planner::{DiffEngine, Scheduler};
    use crate::provider::{CallKind, FailureMode, MemoryProvider};
    use crate::state::{MemoryStateStore, StateSnapshot};

    fn schema() -> ResourceSchema {
        ResourceSchema::new("queue")
            .attribute("name", AttributeSchema::optional(AttributeType::String).force_new())
            .attribute("source", AttributeSchema::optional(AttributeType::Any))
            .output("arn")
    }

    struct Harness {
        provider: Arc<MemoryProvider>,
        store: Arc<MemoryStateStore>,
        executor: ApplyExecutor,
    }

    fn harness(provider: MemoryProvider) -> Harness {
        let provider = Arc::new(provider.with_schema(schema()));
        let registry = ProviderRegistry::new().with_provider(provider.clone());
        let store = Arc::new(MemoryStateStore::new());
        let executor = ApplyExecutor::new(Arc::new(registry), store.clone())
            .with_settings(&ApplySettings {
                parallelism: 4,
                refresh: false,
                max_retries: 2,
                retry_delay_ms: 1,
            });
        Harness { provider, store, executor }
    }

    fn resources(yaml: &[&str]) -> Vec<Resource> {
        yaml.iter()
            .map(|y| {
                let decl: ResourceDecl = serde_yaml::from_str(y).expect("valid yaml");
                Resource::parse(&decl, &schema(), "memory").expect("valid resource")
            })
            .collect()
    }

    fn plan(resources: Vec<Resource>, state: &StateSnapshot) -> ExecutionPlan {
        let graph = DependencyGraph::build(resources, [schema()]).expect("graph");
        let changes = DiffEngine::new().diff(&graph, state).expect("diff");
        Scheduler::new().schedule(changes, &graph).expect("schedule")
    }

    fn chain() -> Vec<Resource> {
        resources(&[
            "kind: queue\nname: a\nattributes:\n  name: a\n",
            "kind: queue\nname: b\nattributes:\n  source: \"${queue.a.arn}\"\n",
        ])
    }

    #[tokio::test]
    async fn test_apply_creates_in_order_and_persists() {
        let h = harness(MemoryProvider::new("memory"));
        let plan = plan(chain(), &StateSnapshot::new());

        let result = h.executor.apply(&plan).await.expect("apply");
        assert!(result.is_success());
        assert_eq!(
            h.provider.calls_of(CallKind::Create),
            vec![Address::new("queue", "a"), Address::new("queue", "b")]
        );

        let state = h.store.load().await.expect("load");
        let a = &state[&Address::new("queue", "a")];
        let b = &state[&Address::new("queue", "b")];
        assert_eq!(b.attributes["source"], a.outputs["arn"]);
        assert_eq!(b.dependencies, vec![Address::new("queue", "a")]);
    }

    #[tokio::test]
    async fn test_failure_skips_dependents() {
        let h = harness(MemoryProvider::new("memory"));
        h.provider
            .fail_on(Address::new("queue", "a"), FailureMode::Reject(String::from("quota exceeded")));
        let plan = plan(chain(), &StateSnapshot::new());

        let result = h.executor.apply(&plan).await.expect("apply");
        assert_eq!(result.failed(), vec![(&Address::new("queue", "a"), "quota exceeded")]);
        assert_eq!(
            result.outcome(&Address::new("queue", "b")),
            Some(&ResourceOutcome::Skipped {
                blocking: Address::new("queue", "a")
            })
        );
        assert!(h.provider.calls_of(CallKind::Create).len() == 1);
        assert!(h.store.load().await.expect("load").is_empty());
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let h = harness(MemoryProvider::new("memory"));
        h.provider.fail_on(Address::new("queue", "a"), FailureMode::Transient(2));
        let plan = plan(chain(), &StateSnapshot::new());

        let result = h.executor.apply(&plan).await.expect("apply");
        assert!(result.is_success());
        let report = result
            .steps
            .iter()
            .find(|s| s.address == Address::new("queue", "a"))
            .expect("report");
        assert_eq!(report.attempts, 3);
    }

    #[tokio::test]
    async fn test_parallelism_is_bounded() {
        let h = harness(MemoryProvider::new("memory").with_latency(Duration::from_millis(20)));
        let executor = h.executor.with_parallelism(2);
        let many: Vec<String> = (0..6)
            .map(|i| format!("kind: queue\nname: q{i}\n"))
            .collect();
        let yaml: Vec<&str> = many.iter().map(String::as_str).collect();
        let plan = plan(resources(&yaml), &StateSnapshot::new());

        let result = executor.apply(&plan).await.expect("apply");
        assert!(result.is_success());
        assert_eq!(result.applied().len(), 6);
        assert_eq!(h.provider.max_in_flight(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_run_starts_nothing() {
        let h = harness(MemoryProvider::new("memory"));
        h.executor.cancel_token().cancel();
        let plan = plan(chain(), &StateSnapshot::new());

        let result = h.executor.apply(&plan).await.expect("apply");
        assert_eq!(result.cancelled().len(), 2);
        assert!(h.provider.calls().is_empty());
    }

    #[tokio::test]
    async fn test_create_before_destroy_deposes_then_deletes() {
        let h = harness(MemoryProvider::new("memory"));
        let first = plan(chain(), &StateSnapshot::new());
        h.executor.apply(&first).await.expect("apply");
        let old_id = h.store.load().await.expect("load")[&Address::new("queue", "a")].id.clone();

        let renamed = resources(&[
            "kind: queue\nname: a\nattributes:\n  name: renamed\n",
            "kind: queue\nname: b\nattributes:\n  source: \"${queue.a.arn}\"\n",
        ]);
        let state = h.store.load().await.expect("load");
        let second = plan(renamed, &state);
        let result = h.executor.apply(&second).await.expect("apply");
        assert!(result.is_success());

        let state = h.store.load().await.expect("load");
        let a = &state[&Address::new("queue", "a")];
        assert_ne!(a.id, old_id);
        assert!(a.deposed.is_empty());
        assert_eq!(h.provider.objects_for(&Address::new("queue", "a")), vec![a.id.clone()]);
        assert_eq!(state[&Address::new("queue", "b")].attributes["source"], a.outputs["arn"]);
    }

    #[tokio::test]
    async fn test_blocked_deposed_cleanup_keeps_replacement_applied() {
        let h = harness(MemoryProvider::new("memory"));
        let first = plan(chain(), &StateSnapshot::new());
        h.executor.apply(&first).await.expect("apply");
        let old_id = h.store.load().await.expect("load")[&Address::new("queue", "a")].id.clone();

        h.provider
            .fail_on(Address::new("queue", "b"), FailureMode::Reject(String::from("denied")));
        let renamed = resources(&[
            "kind: queue\nname: a\nattributes:\n  name: renamed\n",
            "kind: queue\nname: b\nattributes:\n  source: \"${queue.a.arn}\"\n",
        ]);
        let state = h.store.load().await.expect("load");
        let result = h.executor.apply(&plan(renamed, &state)).await.expect("apply");

        assert_eq!(result.outcome(&Address::new("queue", "a")), Some(&ResourceOutcome::Applied));
        assert_eq!(result.failed(), vec![(&Address::new("queue", "b"), "denied")]);
        assert!(result.skipped().is_empty());
        assert_eq!(
            result.pending_deposed,
            vec![PendingDeposed {
                address: Address::new("queue", "a"),
                id: old_id.clone(),
                outcome: ResourceOutcome::Skipped {
                    blocking: Address::new("queue", "b")
                },
            }]
        );
        assert!(!result.is_success());
        assert_eq!(result.to_string(), "1 applied, 1 failed, 0 skipped, 1 deposed pending");

        let state = h.store.load().await.expect("load");
        let a = &state[&Address::new("queue", "a")];
        assert_ne!(a.id, old_id);
        assert_eq!(a.deposed.len(), 1);
        assert_eq!(a.deposed[0].id, old_id);
    }

    #[tokio::test]
    async fn test_delete_of_missing_object_succeeds() {
        let h = harness(MemoryProvider::new("memory"));
        let first = plan(chain(), &StateSnapshot::new());
        h.executor.apply(&first).await.expect("apply");

        let state = h.store.load().await.expect("load");
        h.provider.forget(&state[&Address::new("queue", "b")].id);

        let only_a = resources(&["kind: queue\nname: a\nattributes:\n  name: a\n"]);
        let second = plan(only_a, &state);
        let result = h.executor.apply(&second).await.expect("apply");
        assert!(result.is_success());
        assert!(!h.store.load().await.expect("load").contains_key(&Address::new("queue", "b")));
    }
}
