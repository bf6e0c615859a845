//! Execution plan types and scheduling.
//!
//! The scheduler expands every change into one or two steps and wires step
//! dependencies so that producers are applied before consumers, consumers
//! are destroyed before producers, and replacements happen in the order the
//! diff engine chose. Steps are grouped into waves of mutually independent
//! work.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use tracing::debug;

use crate::error::PlanError;
use crate::graph::DependencyGraph;
use crate::model::Address;

use super::diff::{Action, ChangeSet, ReplaceOrder};

/// Provider operation performed by a step.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StepOp {
    /// Destroy a deposed object.
    DeleteDeposed {
        /// Object id.
        id: String,
    },
    /// Destroy the current object.
    Delete,
    /// Create a new object.
    Create,
    /// Update the current object.
    Update,
    /// Publish recorded outputs, no provider call.
    NoOp,
}

/// A single step of an execution plan.
#[derive(Debug, Clone, Serialize)]
pub struct PlanStep {
    /// Position in the plan.
    pub index: usize,
    /// Resource address.
    pub address: Address,
    /// Operation.
    pub op: StepOp,
    /// Index into the change set.
    pub change: usize,
    /// Steps that must complete first.
    pub depends_on: Vec<usize>,
    /// Longest dependency chain before this step.
    pub wave: usize,
}

/// A complete execution plan.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionPlan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Declaration hash this plan is based on.
    pub config_hash: String,
    /// Changes the plan was scheduled from.
    pub changes: ChangeSet,
    /// Steps in a valid sequential order.
    pub steps: Vec<PlanStep>,
}

/// Orders a change set into an execution plan.
#[derive(Debug, Default)]
pub struct Scheduler;

/// Step indices per address, before ordering.
#[derive(Default)]
struct StepIndex {
    apply: BTreeMap<Address, usize>,
    destroy: BTreeMap<Address, usize>,
    deposed: BTreeMap<Address, Vec<usize>>,
}

struct Draft {
    address: Address,
    op: StepOp,
    change: usize,
    after: BTreeSet<usize>,
}

impl Scheduler {
    /// Creates a new scheduler.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Schedules `changes` against the dependency graph.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::Unschedulable`] when a destroyed resource still has
    /// a declared dependent that is kept, or when step edges form a cycle.
    pub fn schedule(
        &self,
        changes: ChangeSet,
        graph: &DependencyGraph,
    ) -> Result<ExecutionPlan, PlanError> {
        let mut drafts = Vec::new();
        let mut index = StepIndex::default();

        for (i, change) in changes.changes.iter().enumerate() {
            let mut push = |op: StepOp| {
                drafts.push(Draft {
                    address: change.address.clone(),
                    op,
                    change: i,
                    after: BTreeSet::new(),
                });
                drafts.len() - 1
            };
            let address = change.address.clone();

            if let Some(deposed) = &change.deposed {
                let step = push(StepOp::DeleteDeposed {
                    id: deposed.id.clone(),
                });
                index.deposed.entry(address).or_default().push(step);
                continue;
            }

            match (change.action, change.replace_order) {
                (Action::Create, _) | (Action::Replace, None) => {
                    index.apply.insert(address, push(StepOp::Create));
                }
                (Action::Update, _) => {
                    index.apply.insert(address, push(StepOp::Update));
                }
                (Action::NoOp, _) => {
                    index.apply.insert(address, push(StepOp::NoOp));
                }
                (Action::Destroy, _) => {
                    index.destroy.insert(address, push(StepOp::Delete));
                }
                (Action::Replace, Some(ReplaceOrder::DestroyBeforeCreate)) => {
                    let destroy = push(StepOp::Delete);
                    let create = push(StepOp::Create);
                    drafts[create].after.insert(destroy);
                    index.destroy.insert(address.clone(), destroy);
                    index.apply.insert(address, create);
                }
                (Action::Replace, Some(ReplaceOrder::CreateBeforeDestroy)) => {
                    let create = push(StepOp::Create);
                    let id = change.prior.as_ref().map(|p| p.id.clone()).unwrap_or_default();
                    let destroy = push(StepOp::DeleteDeposed { id });
                    drafts[destroy].after.insert(create);
                    index.apply.insert(address.clone(), create);
                    index.deposed.entry(address).or_default().push(destroy);
                }
            }
        }

        Self::wire_apply_order(&mut drafts, &index, graph);
        Self::wire_destroy_order(&mut drafts, &index, &changes, graph)?;
        Self::wire_deposed_order(&mut drafts, &index, &changes, graph);

        let steps = Self::order(drafts)?;
        debug!(steps = steps.len(), "execution plan scheduled");

        Ok(ExecutionPlan {
            created_at: Utc::now(),
            config_hash: String::new(),
            changes,
            steps,
        })
    }

    /// Producers are applied before consumers.
    fn wire_apply_order(drafts: &mut [Draft], index: &StepIndex, graph: &DependencyGraph) {
        for (address, &step) in &index.apply {
            for producer in graph.dependencies(address) {
                if let Some(&before) = index.apply.get(&producer) {
                    drafts[step].after.insert(before);
                }
            }
        }
    }

    /// Consumers are destroyed, or stop using the producer, before it goes.
    fn wire_destroy_order(
        drafts: &mut [Draft],
        index: &StepIndex,
        changes: &ChangeSet,
        graph: &DependencyGraph,
    ) -> Result<(), PlanError> {
        for (address, &step) in &index.destroy {
            let plain = changes.changes[drafts[step].change].action == Action::Destroy;

            let consumers = former_consumers(address, changes, graph);
            if plain {
                let declared = graph.dependents(address);
                for consumer in &consumers {
                    // Undeclared consumers have no apply step that could detach them.
                    let bound = declared.contains(consumer) || !graph.contains(consumer);
                    let kept = !index.destroy.contains_key(consumer)
                        && changes.get(consumer).is_some_and(|c| c.prior.is_some());
                    if bound && kept {
                        return Err(PlanError::Unschedulable {
                            address: address.clone(),
                            reason: format!("{consumer} depends on it and is not being destroyed"),
                        });
                    }
                }
            }

            for consumer in consumers {
                if let Some(&before) = index.destroy.get(&consumer) {
                    drafts[step].after.insert(before);
                } else if let Some(&before) = index.apply.get(&consumer) {
                    drafts[step].after.insert(before);
                }
                for &before in index.deposed.get(&consumer).into_iter().flatten() {
                    drafts[step].after.insert(before);
                }
            }

            for &before in index.deposed.get(address).into_iter().flatten() {
                drafts[step].after.insert(before);
            }
        }
        Ok(())
    }

    /// Deposed objects go only once their replacement and every dependent
    /// have been applied.
    fn wire_deposed_order(
        drafts: &mut [Draft],
        index: &StepIndex,
        changes: &ChangeSet,
        graph: &DependencyGraph,
    ) {
        for (address, steps) in &index.deposed {
            let consumers = former_consumers(address, changes, graph);
            for &step in steps {
                if let Some(&before) = index.apply.get(address) {
                    drafts[step].after.insert(before);
                }
                for consumer in &consumers {
                    if let Some(&before) = index.apply.get(consumer) {
                        drafts[step].after.insert(before);
                    }
                    if let Some(&before) = index.destroy.get(consumer) {
                        drafts[step].after.insert(before);
                    }
                }
            }
        }
    }

    /// Orders drafts level by level, breaking ties by address and operation.
    fn order(drafts: Vec<Draft>) -> Result<Vec<PlanStep>, PlanError> {
        let n = drafts.len();
        let mut remaining: Vec<usize> = drafts.iter().map(|d| d.after.len()).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, draft) in drafts.iter().enumerate() {
            for &before in &draft.after {
                dependents[before].push(i);
            }
        }

        let key = |i: usize| (&drafts[i].address, &drafts[i].op, i);
        let mut level: Vec<usize> = (0..n).filter(|&i| remaining[i] == 0).collect();
        let mut position = vec![usize::MAX; n];
        let mut waves = vec![0; n];
        let mut sequence = Vec::with_capacity(n);
        let mut wave = 0;

        while !level.is_empty() {
            level.sort_by(|a, b| key(*a).cmp(&key(*b)));
            let mut next = Vec::new();
            for &i in &level {
                position[i] = sequence.len();
                waves[i] = wave;
                sequence.push(i);
                for &d in &dependents[i] {
                    remaining[d] -= 1;
                    if remaining[d] == 0 {
                        next.push(d);
                    }
                }
            }
            level = next;
            wave += 1;
        }

        if sequence.len() != n {
            let stuck = (0..n)
                .filter(|&i| position[i] == usize::MAX)
                .min_by(|a, b| key(*a).cmp(&key(*b)))
                .map_or_else(|| Address::new("plan", "unknown"), |i| drafts[i].address.clone());
            return Err(PlanError::Unschedulable {
                address: stuck,
                reason: String::from("step dependencies form a cycle"),
            });
        }

        let mut slots: Vec<Option<Draft>> = drafts.into_iter().map(Some).collect();
        let steps = sequence
            .iter()
            .enumerate()
            .filter_map(|(new_index, &old)| {
                let draft = slots[old].take()?;
                let mut depends_on: Vec<usize> = draft.after.iter().map(|&b| position[b]).collect();
                depends_on.sort_unstable();
                Some(PlanStep {
                    index: new_index,
                    address: draft.address,
                    op: draft.op,
                    change: draft.change,
                    depends_on,
                    wave: waves[old],
                })
            })
            .collect();
        Ok(steps)
    }
}

/// Resources that depend, or depended when last applied, on `address`.
fn former_consumers(address: &Address, changes: &ChangeSet, graph: &DependencyGraph) -> BTreeSet<Address> {
    let mut consumers: BTreeSet<Address> = graph.dependents(address).into_iter().collect();
    for change in &changes.changes {
        if change
            .prior
            .as_ref()
            .is_some_and(|p| p.dependencies.contains(address))
        {
            consumers.insert(change.address.clone());
        }
    }
    consumers.remove(address);
    consumers
}

impl ExecutionPlan {
    /// Sets the declaration hash.
    #[must_use]
    pub fn with_config_hash(mut self, hash: impl Into<String>) -> Self {
        self.config_hash = hash.into();
        self
    }

    /// Returns true if the plan changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.iter().all(|s| s.op == StepOp::NoOp)
    }

    /// Returns the number of steps.
    #[must_use]
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Returns step indices grouped by wave.
    #[must_use]
    pub fn waves(&self) -> Vec<Vec<usize>> {
        let mut waves: Vec<Vec<usize>> = Vec::new();
        for step in &self.steps {
            if waves.len() <= step.wave {
                waves.resize_with(step.wave + 1, Vec::new);
            }
            waves[step.wave].push(step.index);
        }
        waves
    }

    /// Returns steps not in `done` whose dependencies are all in `done`.
    #[must_use]
    pub fn ready_steps(&self, done: &HashSet<usize>) -> Vec<usize> {
        self.steps
            .iter()
            .filter(|s| !done.contains(&s.index) && s.depends_on.iter().all(|d| done.contains(d)))
            .map(|s| s.index)
            .collect()
    }

    /// Returns true if `other` would perform the same work: same declaration,
    /// same steps in the same order, and the same changes against the same
    /// recorded objects.
    #[must_use]
    pub fn matches(&self, other: &Self) -> bool {
        let steps = |plan: &Self| -> Vec<(Address, StepOp, Vec<usize>)> {
            plan.steps
                .iter()
                .map(|s| (s.address.clone(), s.op.clone(), s.depends_on.clone()))
                .collect()
        };
        let prior_ids = |plan: &Self| -> Vec<Option<String>> {
            plan.changes
                .changes
                .iter()
                .map(|c| c.prior.as_ref().map(|p| p.id.clone()))
                .collect()
        };

        self.config_hash == other.config_hash
            && steps(self) == steps(other)
            && prior_ids(self) == prior_ids(other)
            && serde_json::to_value(&self.changes).ok() == serde_json::to_value(&other.changes).ok()
    }

    /// Returns the first step for an address with the given operation.
    #[must_use]
    pub fn find(&self, address: &Address, op: &StepOp) -> Option<&PlanStep> {
        self.steps
            .iter()
            .find(|s| &s.address == address && &s.op == op)
    }
}

impl fmt::Display for StepOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
            Self::DeleteDeposed { id } => write!(f, "delete deposed {id}"),
            Self::NoOp => write!(f, "no-op"),
        }
    }
}

impl fmt::Display for PlanStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[wave {}] {} {}", self.wave, self.op, self.address)?;
        if !self.depends_on.is_empty() {
            let deps: Vec<String> = self.depends_on.iter().map(ToString::to_string).collect();
            write!(f, " (after {})", deps.join(", "))?;
        }
        Ok(())
    }
}

impl fmt::Display for ExecutionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "No changes. Infrastructure matches the declaration.");
        }

        writeln!(f, "Execution plan ({} steps):", self.steps.len())?;
        for step in self.steps.iter().filter(|s| s.op != StepOp::NoOp) {
            writeln!(f, "  {}. {step}", step.index)?;
        }
        write!(f, "Plan: {}", self.changes.summary())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceDecl;
    use crate::model::{AttrMap, AttributeSchema, AttributeType, Resource, ResourceSchema};
    use crate::planner::DiffEngine;
    use crate::state::{StateRecord, StateSnapshot};
    use serde_json::json;

    fn schema(kind: &str) -> ResourceSchema {
        ResourceSchema::new(kind)
            .attribute("name", AttributeSchema::optional(AttributeType::String).force_new())
            .attribute("source", AttributeSchema::optional(AttributeType::Any))
            .output("arn")
    }

    fn resource(yaml: &str) -> Resource {
        let decl: ResourceDecl = serde_yaml::from_str(yaml).expect("valid yaml");
        Resource::parse(&decl, &schema(&decl.kind), "memory").expect("valid resource")
    }

    fn graph(resources: Vec<Resource>) -> DependencyGraph {
        DependencyGraph::build(resources, [schema("queue"), schema("policy")]).expect("graph")
    }

    fn record(kind: &str, name: &str, attrs: AttrMap, deps: Vec<Address>) -> StateRecord {
        StateRecord::new(
            Address::new(kind, name),
            "memory",
            &format!("{name}-1"),
            attrs,
            AttrMap::from([(String::from("arn"), json!(format!("arn:{name}")))]),
            deps,
        )
    }

    fn plan(g: &DependencyGraph, state: &StateSnapshot) -> Result<ExecutionPlan, PlanError> {
        let changes = DiffEngine::new().diff(g, state)?;
        Scheduler::new().schedule(changes, g)
    }

    fn pos(plan: &ExecutionPlan, address: &str, op: &StepOp) -> usize {
        let address: Address = address.parse().expect("address");
        plan.find(&address, op).expect("step present").index
    }

    #[test]
    fn test_creates_follow_dependencies() {
        let g = graph(vec![
            resource("kind: policy\nname: p\nattributes:\n  source: \"${queue.b.arn}\"\n"),
            resource("kind: queue\nname: b\nattributes:\n  source: \"${queue.a.arn}\"\n"),
            resource("kind: queue\nname: a\n"),
            resource("kind: queue\nname: c\n"),
        ]);
        let plan = plan(&g, &StateSnapshot::new()).expect("plan");

        let a = pos(&plan, "queue.a", &StepOp::Create);
        let b = pos(&plan, "queue.b", &StepOp::Create);
        let p = pos(&plan, "policy.p", &StepOp::Create);
        assert!(a < b && b < p);
        assert_eq!(plan.steps[b].depends_on, vec![a]);

        let waves = plan.waves();
        assert_eq!(waves.len(), 3);
        assert_eq!(waves[0].len(), 2);
        assert_eq!(plan.ready_steps(&HashSet::new()).len(), 2);
    }

    #[test]
    fn test_destroy_all_in_reverse_order() {
        let g = graph(vec![
            resource("kind: queue\nname: a\n"),
            resource("kind: queue\nname: b\nattributes:\n  source: \"${queue.a.arn}\"\n"),
        ]);
        let state: StateSnapshot = [
            record("queue", "a", AttrMap::new(), vec![]),
            record(
                "queue",
                "b",
                AttrMap::from([(String::from("source"), json!("arn:a"))]),
                vec![Address::new("queue", "a")],
            ),
        ]
        .into_iter()
        .map(|r| (r.address.clone(), r))
        .collect();

        let changes = DiffEngine::new().diff_destroy(&g, &state, &[]).expect("diff");
        let plan = Scheduler::new().schedule(changes, &g).expect("plan");

        assert!(pos(&plan, "queue.b", &StepOp::Delete) < pos(&plan, "queue.a", &StepOp::Delete));
    }

    #[test]
    fn test_targeted_destroy_with_kept_dependent_is_unschedulable() {
        let g = graph(vec![
            resource("kind: queue\nname: a\n"),
            resource("kind: queue\nname: b\nattributes:\n  source: \"${queue.a.arn}\"\n"),
        ]);
        let state: StateSnapshot = [
            record("queue", "a", AttrMap::new(), vec![]),
            record("queue", "b", AttrMap::new(), vec![Address::new("queue", "a")]),
        ]
        .into_iter()
        .map(|r| (r.address.clone(), r))
        .collect();

        let changes = DiffEngine::new()
            .diff_destroy(&g, &state, &[Address::new("queue", "a")])
            .expect("diff");
        let err = Scheduler::new().schedule(changes, &g).expect_err("unschedulable");
        assert!(matches!(err, PlanError::Unschedulable { ref address, .. } if *address == Address::new("queue", "a")));
    }

    #[test]
    fn test_targeted_destroy_with_recorded_consumer_is_unschedulable() {
        let g = graph(vec![resource("kind: queue\nname: a\n")]);
        let state: StateSnapshot = [
            record("queue", "a", AttrMap::new(), vec![]),
            record(
                "policy",
                "b",
                AttrMap::from([(String::from("source"), json!("arn:a"))]),
                vec![Address::new("queue", "a")],
            ),
        ]
        .into_iter()
        .map(|r| (r.address.clone(), r))
        .collect();

        let changes = DiffEngine::new()
            .diff_destroy(&g, &state, &[Address::new("queue", "a")])
            .expect("diff");
        let err = Scheduler::new().schedule(changes, &g).expect_err("unschedulable");
        let PlanError::Unschedulable { address, reason } = err else {
            panic!("expected unschedulable, got {err}");
        };
        assert_eq!(address, Address::new("queue", "a"));
        assert!(reason.contains("policy.b"));
    }

    #[test]
    fn test_create_before_destroy_ordering() {
        let g = graph(vec![
            resource("kind: queue\nname: a\nattributes:\n  name: new\n"),
            resource("kind: policy\nname: p\nattributes:\n  source: \"${queue.a.arn}\"\n"),
        ]);
        let state: StateSnapshot = [
            record("queue", "a", AttrMap::from([(String::from("name"), json!("old"))]), vec![]),
            record(
                "policy",
                "p",
                AttrMap::from([(String::from("source"), json!("arn:a"))]),
                vec![Address::new("queue", "a")],
            ),
        ]
        .into_iter()
        .map(|r| (r.address.clone(), r))
        .collect();

        let plan = plan(&g, &state).expect("plan");
        let create = pos(&plan, "queue.a", &StepOp::Create);
        let update = pos(&plan, "policy.p", &StepOp::Update);
        let deposed = pos(&plan, "queue.a", &StepOp::DeleteDeposed { id: String::from("a-1") });

        assert!(create < update && update < deposed);
        assert!(plan.steps[deposed].depends_on.contains(&update));
        assert!(plan.to_string().contains("1 to add, 1 to change, 1 to destroy"));
    }

    #[test]
    fn test_destroy_before_create_ordering() {
        let g = graph(vec![resource("kind: queue\nname: a\nattributes:\n  name: new\n")]);
        let state: StateSnapshot = [record(
            "queue",
            "a",
            AttrMap::from([(String::from("name"), json!("old"))]),
            vec![],
        )]
        .into_iter()
        .map(|r| (r.address.clone(), r))
        .collect();

        let plan = plan(&g, &state).expect("plan");
        let destroy = pos(&plan, "queue.a", &StepOp::Delete);
        let create = pos(&plan, "queue.a", &StepOp::Create);
        assert!(destroy < create);
        assert_eq!(plan.steps[create].depends_on, vec![destroy]);
    }

    #[test]
    fn test_orphan_producer_waits_for_former_consumer() {
        let g = graph(vec![resource("kind: policy\nname: p\nattributes:\n  source: literal\n")]);
        let state: StateSnapshot = [
            record("queue", "a", AttrMap::new(), vec![]),
            record(
                "policy",
                "p",
                AttrMap::from([(String::from("source"), json!("arn:a"))]),
                vec![Address::new("queue", "a")],
            ),
        ]
        .into_iter()
        .map(|r| (r.address.clone(), r))
        .collect();

        let plan = plan(&g, &state).expect("plan");
        let update = pos(&plan, "policy.p", &StepOp::Update);
        let destroy = pos(&plan, "queue.a", &StepOp::Delete);
        assert!(plan.steps[destroy].depends_on.contains(&update));
    }
}
