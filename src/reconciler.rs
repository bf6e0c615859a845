//! Reconciler driving a full run.
//!
//! A run loads the declaration's resources, builds the dependency graph,
//! refreshes recorded state through the providers, diffs, schedules and
//! applies, all while holding the state lock. The outcome is appended to the
//! run history.

use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{ConfigHasher, ConfigValidator, DeclarationFile, StateBackend};
use crate::error::{ConvergeError, PlanError, ProviderError, Result};
use crate::graph::DependencyGraph;
use crate::model::Address;
use crate::planner::{ApplyExecutor, ApplyResult, CancelToken, DiffEngine, ExecutionPlan, Scheduler};
use crate::provider::{LocalProvider, MemoryProvider, Provider, ProviderRegistry};
use crate::state::{
    generate_holder_id, LocalStateStore, MemoryStateStore, RunHistoryEntry, RunOperation,
    StateSnapshot, StateStore, STATE_DIR,
};

/// Directory under the state directory holding local provider objects.
pub const OBJECTS_DIR: &str = "objects";

/// Drives plan, apply, destroy and drift runs for one declaration.
pub struct Reconciler {
    declaration: DeclarationFile,
    registry: Arc<ProviderRegistry>,
    store: Arc<dyn StateStore>,
    hasher: ConfigHasher,
    diff_engine: DiffEngine,
    scheduler: Scheduler,
    cancel: CancelToken,
    holder: String,
}

/// Result of an apply or destroy run.
#[derive(Debug, serde::Serialize)]
pub struct ReconciliationResult {
    /// Whether every resource was applied.
    pub success: bool,
    /// Declaration hash the run was based on.
    pub config_hash: String,
    /// Change counts of the executed plan.
    pub summary: String,
    /// Per-resource outcomes.
    pub result: ApplyResult,
}

/// What a refresh found.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct RefreshReport {
    /// Records whose remote attributes changed.
    pub drifted: Vec<Address>,
    /// Records whose object no longer exists.
    pub missing: Vec<Address>,
}

/// Report of drift detection.
#[derive(Debug, serde::Serialize)]
pub struct DriftReport {
    /// Resources changed out of band.
    pub drifted: Vec<Address>,
    /// Resources deleted out of band.
    pub missing: Vec<Address>,
    /// Resources an apply would change.
    pub pending: Vec<Address>,
    /// Number of declared resources.
    pub total_resources: usize,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("project", &self.declaration.project.name)
            .field("backend", &self.store.backend_type())
            .field("holder", &self.holder)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Creates a reconciler over an explicit registry and state store.
    ///
    /// # Errors
    ///
    /// Returns an error if the declaration fails validation.
    pub fn new(
        declaration: DeclarationFile,
        registry: ProviderRegistry,
        store: Arc<dyn StateStore>,
    ) -> Result<Self> {
        let validation = ConfigValidator::new().validate(&declaration)?;
        for warning in &validation.warnings {
            warn!("{warning}");
        }

        Ok(Self {
            declaration,
            registry: Arc::new(registry),
            store,
            hasher: ConfigHasher::new(),
            diff_engine: DiffEngine::new(),
            scheduler: Scheduler::new(),
            cancel: CancelToken::new(),
            holder: generate_holder_id(),
        })
    }

    /// Creates a reconciler with the built-in providers and the state backend
    /// named by the declaration. Relative state paths resolve against
    /// `base_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the declaration is invalid or names an unknown
    /// provider.
    pub fn from_declaration(declaration: DeclarationFile, base_dir: &Path) -> Result<Self> {
        let state_dir = declaration
            .state
            .path
            .as_ref()
            .map_or_else(|| base_dir.join(STATE_DIR), |p| base_dir.join(p));

        let providers: [Arc<dyn Provider>; 2] = [
            Arc::new(LocalProvider::new(state_dir.join(OBJECTS_DIR))),
            Arc::new(MemoryProvider::new("memory")),
        ];
        let registry = ProviderRegistry::from_declaration(&declaration, providers)?;

        let store: Arc<dyn StateStore> = match declaration.state.backend {
            StateBackend::Local => Arc::new(LocalStateStore::with_base_dir(&state_dir)),
            StateBackend::Memory => Arc::new(MemoryStateStore::new()),
        };
        debug!(backend = store.backend_type(), dir = %state_dir.display(), "state backend selected");

        Self::new(declaration, registry, store)
    }

    /// Uses an external cancellation token for applies.
    #[must_use]
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Overrides the declared parallelism.
    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.declaration.settings.parallelism = parallelism.max(1);
        self
    }

    /// Returns the declaration.
    #[must_use]
    pub const fn declaration(&self) -> &DeclarationFile {
        &self.declaration
    }

    /// Returns the state store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Returns the declaration hash.
    #[must_use]
    pub fn config_hash(&self) -> String {
        self.hasher.hash_declaration(&self.declaration)
    }

    /// Parses every resource and builds the dependency graph.
    ///
    /// # Errors
    ///
    /// Returns a schema or graph error.
    pub fn graph(&self) -> Result<DependencyGraph> {
        let resources = self.registry.parse_resources(&self.declaration)?;
        let schemas: Vec<_> = self
            .registry
            .kinds()
            .filter_map(|kind| self.registry.schema(kind).cloned())
            .collect();
        Ok(DependencyGraph::build(resources, schemas)?)
    }

    /// Computes the plan an apply would execute, without changing anything.
    ///
    /// # Errors
    ///
    /// Returns an error if the graph cannot be built, state cannot be read,
    /// or the changes cannot be scheduled.
    pub async fn plan(&self) -> Result<ExecutionPlan> {
        let graph = self.graph()?;
        let mut state = self.store.load().await?;
        if self.declaration.settings.refresh {
            self.refresh(&mut state, false).await?;
        }
        self.plan_with(&graph, &state)
    }

    /// Computes the plan a destroy would execute.
    ///
    /// # Errors
    ///
    /// Returns an error if a target is unknown, a resource is protected, or
    /// a targeted resource still has declared dependents.
    pub async fn plan_destroy(&self, targets: &[Address]) -> Result<ExecutionPlan> {
        let graph = self.graph()?;
        let state = self.store.load().await?;
        self.plan_destroy_with(&graph, &state, targets)
    }

    fn plan_with(&self, graph: &DependencyGraph, state: &StateSnapshot) -> Result<ExecutionPlan> {
        let changes = self.diff_engine.diff(graph, state)?;
        let plan = self.scheduler.schedule(changes, graph)?;
        Ok(plan.with_config_hash(self.config_hash()))
    }

    fn plan_destroy_with(
        &self,
        graph: &DependencyGraph,
        state: &StateSnapshot,
        targets: &[Address],
    ) -> Result<ExecutionPlan> {
        let changes = self.diff_engine.diff_destroy(graph, state, targets)?;
        let plan = self.scheduler.schedule(changes, graph)?;
        Ok(plan.with_config_hash(self.config_hash()))
    }

    /// Converges infrastructure to the declaration.
    ///
    /// # Errors
    ///
    /// Returns an error if the run cannot start: invalid graph, state lock
    /// held elsewhere, or an unschedulable plan. Provider failures are
    /// reported per resource in the result.
    pub async fn apply(&self) -> Result<ReconciliationResult> {
        self.run_apply(None).await
    }

    /// Applies `approved`, a plan previously returned by [`Self::plan`].
    ///
    /// The plan is recomputed under the state lock and the run aborts if it
    /// no longer matches.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::Stale`] if state or the declaration changed
    /// since `approved` was computed, otherwise as [`Self::apply`].
    pub async fn apply_approved(&self, approved: &ExecutionPlan) -> Result<ReconciliationResult> {
        self.run_apply(Some(approved)).await
    }

    async fn run_apply(&self, approved: Option<&ExecutionPlan>) -> Result<ReconciliationResult> {
        info!(
            project = %self.declaration.project.name,
            environment = %self.declaration.project.environment,
            "starting apply"
        );
        let graph = self.graph()?;

        self.locked(RunOperation::Apply, async {
            let mut state = self.store.load().await?;
            if self.declaration.settings.refresh {
                self.refresh(&mut state, true).await?;
            }
            let plan = self.plan_with(&graph, &state)?;
            check_approved(approved, &plan)?;
            self.execute(&plan).await
        })
        .await
    }

    /// Destroys recorded resources, all of them or only `targets`.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown targets, protected resources, targets
    /// with declared dependents, or a held state lock.
    pub async fn destroy(&self, targets: &[Address]) -> Result<ReconciliationResult> {
        self.run_destroy(targets, None).await
    }

    /// Destroys with `approved`, a plan previously returned by
    /// [`Self::plan_destroy`] for the same targets.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::Stale`] if state changed since `approved` was
    /// computed, otherwise as [`Self::destroy`].
    pub async fn destroy_approved(
        &self,
        targets: &[Address],
        approved: &ExecutionPlan,
    ) -> Result<ReconciliationResult> {
        self.run_destroy(targets, Some(approved)).await
    }

    async fn run_destroy(
        &self,
        targets: &[Address],
        approved: Option<&ExecutionPlan>,
    ) -> Result<ReconciliationResult> {
        info!(project = %self.declaration.project.name, targets = targets.len(), "starting destroy");
        let graph = self.graph()?;

        self.locked(RunOperation::Destroy, async {
            let state = self.store.load().await?;
            let plan = self.plan_destroy_with(&graph, &state, targets)?;
            check_approved(approved, &plan)?;
            self.execute(&plan).await
        })
        .await
    }

    /// Reports out-of-band changes and pending declared changes.
    ///
    /// # Errors
    ///
    /// Returns an error if state or providers cannot be read.
    pub async fn check_drift(&self) -> Result<DriftReport> {
        let graph = self.graph()?;
        let mut state = self.store.load().await?;
        let refresh = self.refresh(&mut state, false).await?;
        let changes = self.diff_engine.diff(&graph, &state)?;

        let pending = changes
            .changes
            .iter()
            .filter(|c| c.is_change())
            .map(|c| c.address.clone())
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();

        Ok(DriftReport {
            drifted: refresh.drifted,
            missing: refresh.missing,
            pending,
            total_resources: graph.len(),
        })
    }

    /// Re-reads every record through its provider.
    ///
    /// Missing objects are dropped so the diff re-creates them; changed
    /// attributes replace the recorded ones. With `persist` the store is
    /// updated as well.
    ///
    /// # Errors
    ///
    /// Returns an error if a provider read fails for another reason than a
    /// missing object, or the store cannot be written.
    pub async fn refresh(&self, state: &mut StateSnapshot, persist: bool) -> Result<RefreshReport> {
        let mut report = RefreshReport::default();
        let addresses: Vec<Address> = state.keys().cloned().collect();

        for address in addresses {
            let Some(record) = state.get_mut(&address) else {
                continue;
            };
            let provider = match self.registry.provider(&address.kind) {
                Ok(provider) => provider,
                Err(e) => match self.registry.provider_named(&record.provider) {
                    Some(provider) => provider,
                    None => {
                        warn!(%address, error = %e, "cannot refresh, no provider");
                        continue;
                    }
                },
            };

            match provider.read(&address, &record.id).await {
                Ok(attributes) if attributes == record.attributes => {}
                Ok(attributes) => {
                    info!(%address, id = %record.id, "drift detected");
                    record.set_attributes(attributes);
                    if persist {
                        self.store.save(&address, record).await?;
                    }
                    report.drifted.push(address);
                }
                Err(ProviderError::NotFound { .. }) => {
                    info!(%address, id = %record.id, "object is gone, will be re-created");
                    state.remove(&address);
                    if persist {
                        self.store.remove(&address).await?;
                    }
                    report.missing.push(address);
                }
                Err(e) => return Err(e.into()),
            }
        }

        debug!(drifted = report.drifted.len(), missing = report.missing.len(), "refresh complete");
        Ok(report)
    }

    /// Removes the record for `address` from state, under the state lock.
    /// The remote object is left untouched.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is held elsewhere or `address` is not
    /// recorded.
    pub async fn forget(&self, address: &Address) -> Result<()> {
        let lock = self.store.acquire_lock(&self.holder, "state rm").await?;

        let outcome = async {
            if !self.store.load().await?.contains_key(address) {
                return Err(ConvergeError::internal(format!("{address} is not recorded in state")));
            }
            self.store.remove(address).await
        }
        .await;

        if let Err(e) = self.store.release_lock(&lock.lock_id).await {
            warn!(error = %e, "failed to release state lock");
        }
        if outcome.is_ok() {
            warn!(%address, "record removed, the object itself was not destroyed");
        }
        outcome
    }

    async fn execute(&self, plan: &ExecutionPlan) -> Result<ReconciliationResult> {
        if plan.is_empty() {
            info!("no changes required, infrastructure is converged");
        }

        let executor = ApplyExecutor::new(Arc::clone(&self.registry), Arc::clone(&self.store))
            .with_settings(&self.declaration.settings)
            .with_cancel_token(self.cancel.clone());
        let result = executor.apply(plan).await?;

        Ok(ReconciliationResult {
            success: result.is_success(),
            config_hash: plan.config_hash.clone(),
            summary: plan.changes.summary(),
            result,
        })
    }

    /// Runs `run` under the state lock and records it in the history.
    async fn locked<F>(&self, operation: RunOperation, run: F) -> Result<ReconciliationResult>
    where
        F: std::future::Future<Output = Result<ReconciliationResult>>,
    {
        let lock = self
            .store
            .acquire_lock(&self.holder, &operation.to_string())
            .await?;
        debug!(lock_id = %lock.lock_id, "state lock acquired");

        let outcome = run.await;

        let mut entry = RunHistoryEntry::new(operation, &self.config_hash());
        match &outcome {
            Ok(run) => {
                entry.applied = run.result.applied().iter().map(ToString::to_string).collect();
                entry.failed = run.result.failed().iter().map(|(a, _)| a.to_string()).collect();
                entry.skipped = run.result.skipped().iter().map(|(a, _)| a.to_string()).collect();
                entry.success = run.success;
                if !run.success {
                    entry.error = Some(run.result.to_string());
                }
            }
            Err(e) => {
                entry.success = false;
                entry.error = Some(e.to_string());
            }
        }
        if let Err(e) = self.store.append_history(entry).await {
            warn!(error = %e, "failed to record run history");
        }

        if let Err(e) = self.store.release_lock(&lock.lock_id).await {
            warn!(error = %e, "failed to release state lock");
        }
        outcome
    }
}

/// Fails when the plan computed under the lock differs from the approved one.
fn check_approved(approved: Option<&ExecutionPlan>, current: &ExecutionPlan) -> Result<()> {
    match approved {
        Some(approved) if !approved.matches(current) => {
            warn!("plan changed since it was approved");
            Err(PlanError::Stale.into())
        }
        _ => Ok(()),
    }
}

impl DriftReport {
    /// Returns true if anything changed out of band.
    #[must_use]
    pub fn has_drift(&self) -> bool {
        !self.drifted.is_empty() || !self.missing.is_empty()
    }

    /// Returns true if nothing drifted and nothing is pending.
    #[must_use]
    pub fn is_converged(&self) -> bool {
        !self.has_drift() && self.pending.is_empty()
    }
}

impl std::fmt::Display for DriftReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_converged() {
            return write!(f, "No drift detected - state is converged");
        }
        for address in &self.drifted {
            writeln!(f, "  ~ {address} (changed outside converge)")?;
        }
        for address in &self.missing {
            writeln!(f, "  - {address} (deleted outside converge)")?;
        }
        for address in &self.pending {
            writeln!(f, "  * {address} (pending change)")?;
        }
        write!(
            f,
            "{} drifted, {} missing, {} pending of {} resources",
            self.drifted.len(),
            self.missing.len(),
            self.pending.len(),
            self.total_resources
        )
    }
}

impl std::fmt::Display for ReconciliationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = if self.success { "complete" } else { "failed" };
        writeln!(f, "Apply {status}: {}", self.result)?;
        for (address, reason) in self.result.failed() {
            writeln!(f, "  ✗ {address}: {reason}")?;
        }
        for (address, blocking) in self.result.skipped() {
            writeln!(f, "  - {address}: skipped, blocked by {blocking}")?;
        }
        for pending in &self.result.pending_deposed {
            writeln!(f, "  ! {}: deposed object {} left in place", pending.address, pending.id)?;
        }
        write!(f, "Plan was: {}", self.summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;
    use crate::error::StateError;
    use crate::planner::{ResourceOutcome, StepOp};
    use crate::provider::{CallKind, FailureMode};

    const DECLARATION: &str = r#"
project:
  name: shop
state:
  backend: memory
settings:
  retry_delay_ms: 1
kinds:
  bucket:
    provider: memory
    attributes:
      name: { type: string, required: true, immutable: true }
      versioning: { type: bool }
    outputs: [arn]
  policy:
    provider: memory
    attributes:
      bucket: { type: string, required: true }
resources:
  - kind: bucket
    name: assets
    attributes:
      name: shop-assets
      versioning: true
  - kind: policy
    name: read
    attributes:
      bucket: "${bucket.assets.arn}"
"#;

    fn setup(yaml: &str) -> (Reconciler, Arc<MemoryProvider>, Arc<MemoryStateStore>) {
        let declaration = ConfigParser::new().parse_yaml(yaml, None).expect("valid declaration");
        let provider = Arc::new(MemoryProvider::new("memory"));
        let store = Arc::new(MemoryStateStore::new());
        let registry =
            ProviderRegistry::from_declaration(&declaration, [provider.clone() as Arc<dyn Provider>])
                .expect("registry");
        let reconciler = Reconciler::new(declaration, registry, store.clone()).expect("reconciler");
        (reconciler, provider, store)
    }

    #[tokio::test]
    async fn test_apply_then_reapply_is_noop() {
        let (reconciler, provider, store) = setup(DECLARATION);

        let first = reconciler.apply().await.expect("apply");
        assert!(first.success);
        assert_eq!(first.summary, "2 to add, 0 to change, 0 to destroy");
        assert_eq!(provider.calls_of(CallKind::Create).len(), 2);

        let plan = reconciler.plan().await.expect("plan");
        assert!(plan.is_empty());
        assert!(plan.steps.iter().all(|s| s.op == StepOp::NoOp));

        let second = reconciler.apply().await.expect("apply");
        assert!(second.success);
        assert_eq!(provider.calls_of(CallKind::Create).len(), 2);

        let history = store.load_history().await.expect("history");
        assert_eq!(history.len(), 2);
        assert!(!store.is_locked().await.expect("lock state"));
    }

    #[tokio::test]
    async fn test_refresh_recreates_deleted_object() {
        let (reconciler, provider, store) = setup(DECLARATION);
        reconciler.apply().await.expect("apply");

        let assets = Address::new("bucket", "assets");
        let old_id = store.load().await.expect("load")[&assets].id.clone();
        provider.forget(&old_id);

        let drift = reconciler.check_drift().await.expect("drift");
        assert_eq!(drift.missing, vec![assets.clone()]);
        assert!(!drift.is_converged());

        let result = reconciler.apply().await.expect("apply");
        assert!(result.success);
        let state = store.load().await.expect("load");
        assert_ne!(state[&assets].id, old_id);
        assert_eq!(
            state[&Address::new("policy", "read")].attributes["bucket"],
            state[&assets].outputs["arn"]
        );
    }

    #[tokio::test]
    async fn test_drift_is_corrected() {
        let (reconciler, provider, store) = setup(DECLARATION);
        reconciler.apply().await.expect("apply");

        let assets = Address::new("bucket", "assets");
        let id = store.load().await.expect("load")[&assets].id.clone();
        provider.set_remote_attribute(&id, "versioning", serde_json::json!(false));

        let drift = reconciler.check_drift().await.expect("drift");
        assert_eq!(drift.drifted, vec![assets.clone()]);
        assert!(drift.pending.contains(&assets));

        let result = reconciler.apply().await.expect("apply");
        assert!(result.success);
        assert_eq!(provider.calls_of(CallKind::Update)[0], assets);
        let state = store.load().await.expect("load");
        assert_eq!(state[&assets].attributes["versioning"], serde_json::json!(true));
        assert!(reconciler.check_drift().await.expect("drift").is_converged());
    }

    #[tokio::test]
    async fn test_failed_apply_is_recorded() {
        let (reconciler, provider, store) = setup(DECLARATION);
        provider.fail_on(
            Address::new("bucket", "assets"),
            FailureMode::Reject(String::from("bucket name already taken")),
        );

        let result = reconciler.apply().await.expect("apply");
        assert!(!result.success);
        assert_eq!(
            result.result.outcome(&Address::new("policy", "read")),
            Some(&ResourceOutcome::Skipped {
                blocking: Address::new("bucket", "assets")
            })
        );

        let history = store.load_history().await.expect("history");
        assert_eq!(history.len(), 1);
        assert!(!history[0].success);
        assert_eq!(history[0].failed, vec![String::from("bucket.assets")]);
    }

    #[tokio::test]
    async fn test_destroy_all_and_targeted() {
        let (reconciler, provider, store) = setup(DECLARATION);
        reconciler.apply().await.expect("apply");

        let err = reconciler
            .destroy(&[Address::new("bucket", "assets")])
            .await
            .expect_err("policy still depends on the bucket");
        assert!(err.to_string().contains("Cannot schedule destroy of bucket.assets"));
        assert!(!store.is_locked().await.expect("lock state"));

        let result = reconciler.destroy(&[]).await.expect("destroy");
        assert!(result.success);
        assert_eq!(
            provider.calls_of(CallKind::Delete),
            vec![Address::new("policy", "read"), Address::new("bucket", "assets")]
        );
        assert!(store.load().await.expect("load").is_empty());
    }

    #[tokio::test]
    async fn test_stale_approved_plan_is_rejected() {
        let (reconciler, provider, store) = setup(DECLARATION);
        reconciler.apply().await.expect("apply");

        let approved = reconciler.plan().await.expect("plan");
        assert!(approved.is_empty());

        let assets = Address::new("bucket", "assets");
        let id = store.load().await.expect("load")[&assets].id.clone();
        provider.set_remote_attribute(&id, "versioning", serde_json::json!(false));

        let err = reconciler.apply_approved(&approved).await.expect_err("stale");
        assert!(matches!(err, ConvergeError::Plan(PlanError::Stale)));
        assert!(provider.calls_of(CallKind::Update).is_empty());
        assert!(!store.is_locked().await.expect("lock state"));

        let approved = reconciler.plan().await.expect("plan");
        let result = reconciler.apply_approved(&approved).await.expect("apply");
        assert!(result.success);
        assert_eq!(provider.calls_of(CallKind::Update)[0], assets);
    }

    #[tokio::test]
    async fn test_stale_approved_destroy_is_rejected() {
        let (reconciler, provider, store) = setup(DECLARATION);
        reconciler.apply().await.expect("apply");

        let approved = reconciler.plan_destroy(&[]).await.expect("plan");
        let policy = Address::new("policy", "read");
        store.remove(&policy).await.expect("remove");

        let err = reconciler.destroy_approved(&[], &approved).await.expect_err("stale");
        assert!(matches!(err, ConvergeError::Plan(PlanError::Stale)));
        assert!(provider.calls_of(CallKind::Delete).is_empty());
        assert!(!store.is_locked().await.expect("lock state"));
    }

    #[tokio::test]
    async fn test_forget_takes_the_lock() {
        let (reconciler, provider, store) = setup(DECLARATION);
        reconciler.apply().await.expect("apply");
        let policy = Address::new("policy", "read");

        let lock = store.acquire_lock("someone-else", "apply").await.expect("lock");
        let err = reconciler.forget(&policy).await.expect_err("locked");
        assert!(matches!(err, ConvergeError::State(StateError::LockedByOther { .. })));
        assert!(store.load().await.expect("load").contains_key(&policy));
        store.release_lock(&lock.lock_id).await.expect("release");

        reconciler.forget(&policy).await.expect("forget");
        assert!(!store.load().await.expect("load").contains_key(&policy));
        assert!(provider.calls_of(CallKind::Delete).is_empty());
        assert!(!store.is_locked().await.expect("lock state"));

        let err = reconciler.forget(&policy).await.expect_err("not recorded");
        assert!(err.to_string().contains("policy.read"));
        assert!(!store.is_locked().await.expect("lock state"));
    }

    #[tokio::test]
    async fn test_lock_held_elsewhere_blocks_apply() {
        let (reconciler, _provider, store) = setup(DECLARATION);
        store.acquire_lock("someone-else", "apply").await.expect("lock");

        let err = reconciler.apply().await.expect_err("locked");
        assert!(err.to_string().contains("someone-else"));
    }
}
