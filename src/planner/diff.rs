//! Diff engine for comparing desired vs last-applied state.
//!
//! This module walks the dependency graph in topological order and decides,
//! per resource, whether it must be created, updated in place, replaced,
//! destroyed, or left alone. Reference values are resolved against state
//! only when the producer will not change during the apply.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

use crate::error::PlanError;
use crate::graph::DependencyGraph;
use crate::model::{Address, AttrMap, PlannedValue, Reference, Resource, ResourceSchema, ID_OUTPUT};
use crate::state::{DeposedObject, StateRecord, StateSnapshot};

/// Engine for computing change sets.
#[derive(Debug, Default)]
pub struct DiffEngine;

/// What happens to a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Create a new object.
    Create,
    /// Update mutable attributes in place.
    Update,
    /// Destroy the object and create a new one.
    Replace,
    /// Destroy the object.
    Destroy,
    /// Nothing to do.
    NoOp,
}

/// Order of the two halves of a replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplaceOrder {
    /// New object first; the old one is deposed and destroyed afterwards.
    CreateBeforeDestroy,
    /// Old object destroyed first.
    DestroyBeforeCreate,
}

/// A single changed attribute.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldChange {
    /// Attribute name.
    pub field: String,
    /// Last-applied value.
    pub before: Option<serde_json::Value>,
    /// Planned value.
    pub after: Option<PlannedValue>,
    /// Whether this change alone forces replacement.
    pub forces_replacement: bool,
}

/// A change set entry.
#[derive(Debug, Clone, Serialize)]
pub struct Change {
    /// Resource address.
    pub address: Address,
    /// Decided action.
    pub action: Action,
    /// Last-applied attributes.
    pub before: AttrMap,
    /// Planned attributes.
    pub after: BTreeMap<String, PlannedValue>,
    /// Attributes that differ.
    pub field_changes: Vec<FieldChange>,
    /// Set for replacements.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replace_order: Option<ReplaceOrder>,
    /// Set when the change destroys a deposed object.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deposed: Option<DeposedObject>,
    /// Declared resource, absent for orphans.
    #[serde(skip)]
    pub resource: Option<Resource>,
    /// Last-applied record, absent for creates.
    #[serde(skip)]
    pub prior: Option<StateRecord>,
}

/// All changes for one run, in graph order followed by destroys.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChangeSet {
    /// Entries.
    pub changes: Vec<Change>,
}

impl DiffEngine {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes the change set that converges `state` to the declared graph.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::DestroyPrevented`] when a resource protected by
    /// `prevent_destroy` would be replaced.
    pub fn diff(&self, graph: &DependencyGraph, state: &StateSnapshot) -> Result<ChangeSet, PlanError> {
        let mut changes = Vec::new();
        let mut actions: BTreeMap<Address, Action> = BTreeMap::new();

        for address in graph.topological_order() {
            let Some(resource) = graph.resource(&address) else {
                continue;
            };
            let prior = state.get(&address);
            let lookup = |r: &Reference| resolve_from_state(r, &actions, state);
            let after: BTreeMap<String, PlannedValue> = resource
                .attributes
                .iter()
                .map(|(k, v)| (k.clone(), v.plan(&lookup)))
                .collect();

            let change = match prior {
                None => Change {
                    address: address.clone(),
                    action: Action::Create,
                    before: AttrMap::new(),
                    field_changes: creation_fields(&after),
                    after,
                    replace_order: None,
                    deposed: None,
                    resource: Some(resource.clone()),
                    prior: None,
                },
                Some(record) => {
                    let schema = graph.schema(&address.kind);
                    let field_changes = compare(&record.attributes, &after, schema);
                    let action = if field_changes.is_empty() {
                        Action::NoOp
                    } else if field_changes.iter().any(|f| f.forces_replacement) {
                        Action::Replace
                    } else {
                        Action::Update
                    };

                    let replace_order = (action == Action::Replace).then(|| {
                        if resource.lifecycle.create_before_destroy || graph.has_dependents(&address) {
                            ReplaceOrder::CreateBeforeDestroy
                        } else {
                            ReplaceOrder::DestroyBeforeCreate
                        }
                    });

                    if action == Action::Replace && resource.lifecycle.prevent_destroy {
                        return Err(PlanError::DestroyPrevented { address });
                    }

                    Change {
                        address: address.clone(),
                        action,
                        before: record.attributes.clone(),
                        after,
                        field_changes,
                        replace_order,
                        deposed: None,
                        resource: Some(resource.clone()),
                        prior: Some(record.clone()),
                    }
                }
            };

            debug!(%address, action = %change.action, "diffed resource");
            actions.insert(address, change.action);
            changes.push(change);
        }

        for (address, record) in state {
            if !graph.contains(address) {
                debug!(%address, "orphaned record will be destroyed");
                changes.push(Change::destroy(record));
            }
        }

        changes.extend(deposed_changes(state.values()));

        Ok(ChangeSet { changes })
    }

    /// Computes a teardown change set.
    ///
    /// With no targets every recorded resource is destroyed. Otherwise only
    /// the targeted addresses are, and every other record is kept as a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::UnknownTarget`] for a target missing from state
    /// and [`PlanError::DestroyPrevented`] for a protected resource.
    pub fn diff_destroy(
        &self,
        graph: &DependencyGraph,
        state: &StateSnapshot,
        targets: &[Address],
    ) -> Result<ChangeSet, PlanError> {
        if let Some(missing) = targets.iter().find(|t| !state.contains_key(*t)) {
            return Err(PlanError::UnknownTarget {
                address: missing.clone(),
            });
        }

        let mut changes = Vec::new();
        for (address, record) in state {
            let destroyed = targets.is_empty() || targets.contains(address);
            if !destroyed {
                changes.push(Change::keep(record, graph.resource(address)));
                continue;
            }
            if graph
                .resource(address)
                .is_some_and(|r| r.lifecycle.prevent_destroy)
            {
                return Err(PlanError::DestroyPrevented {
                    address: address.clone(),
                });
            }
            changes.push(Change::destroy(record));
        }

        let destroyed: Vec<&StateRecord> = state
            .values()
            .filter(|r| targets.is_empty() || targets.contains(&r.address))
            .collect();
        changes.extend(deposed_changes(destroyed));

        Ok(ChangeSet { changes })
    }
}

/// Resolves a reference against state when the producer keeps its outputs.
fn resolve_from_state(
    reference: &Reference,
    actions: &BTreeMap<Address, Action>,
    state: &StateSnapshot,
) -> Option<serde_json::Value> {
    let record = state.get(&reference.target)?;
    match actions.get(&reference.target)? {
        Action::NoOp => record.output(&reference.output),
        Action::Update if reference.output == ID_OUTPUT => record.output(ID_OUTPUT),
        _ => None,
    }
}

/// Every declared value of a new resource, as additions.
fn creation_fields(after: &BTreeMap<String, PlannedValue>) -> Vec<FieldChange> {
    after
        .iter()
        .filter(|(_, v)| **v != PlannedValue::Known(serde_json::Value::Null))
        .map(|(field, value)| FieldChange {
            field: field.clone(),
            before: None,
            after: Some(value.clone()),
            forces_replacement: false,
        })
        .collect()
}

/// Compares recorded attributes with planned ones. Nulls count as absent.
fn compare(
    before: &AttrMap,
    after: &BTreeMap<String, PlannedValue>,
    schema: Option<&ResourceSchema>,
) -> Vec<FieldChange> {
    let mut fields: Vec<&String> = before.keys().chain(after.keys()).collect();
    fields.sort();
    fields.dedup();

    fields
        .into_iter()
        .filter_map(|field| {
            let old = before.get(field).filter(|v| !v.is_null());
            let new = after
                .get(field)
                .filter(|v| **v != PlannedValue::Known(serde_json::Value::Null));

            let changed = match new {
                None => old.is_some(),
                Some(PlannedValue::Unknown) => true,
                Some(PlannedValue::Known(value)) => old != Some(value),
            };

            changed.then(|| FieldChange {
                field: field.clone(),
                before: old.cloned(),
                after: new.cloned(),
                forces_replacement: schema.is_some_and(|s| s.is_immutable(field)),
            })
        })
        .collect()
}

/// Destroy entries for deposed objects left by interrupted replacements.
fn deposed_changes<'a>(records: impl IntoIterator<Item = &'a StateRecord>) -> Vec<Change> {
    records
        .into_iter()
        .flat_map(|record| {
            record.deposed.iter().map(move |deposed| Change {
                address: record.address.clone(),
                action: Action::Destroy,
                before: deposed.attributes.clone(),
                after: BTreeMap::new(),
                field_changes: Vec::new(),
                replace_order: None,
                deposed: Some(deposed.clone()),
                resource: None,
                prior: Some(record.clone()),
            })
        })
        .collect()
}

impl Change {
    fn destroy(record: &StateRecord) -> Self {
        Self {
            address: record.address.clone(),
            action: Action::Destroy,
            before: record.attributes.clone(),
            after: BTreeMap::new(),
            field_changes: Vec::new(),
            replace_order: None,
            deposed: None,
            resource: None,
            prior: Some(record.clone()),
        }
    }

    fn keep(record: &StateRecord, resource: Option<&Resource>) -> Self {
        Self {
            address: record.address.clone(),
            action: Action::NoOp,
            before: record.attributes.clone(),
            after: record
                .attributes
                .iter()
                .map(|(k, v)| (k.clone(), PlannedValue::Known(v.clone())))
                .collect(),
            field_changes: Vec::new(),
            replace_order: None,
            deposed: None,
            resource: resource.cloned(),
            prior: Some(record.clone()),
        }
    }

    /// Returns true if the change does anything.
    #[must_use]
    pub fn is_change(&self) -> bool {
        self.action != Action::NoOp
    }
}

impl ChangeSet {
    /// Returns true if no entry changes anything.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.iter().all(|c| !c.is_change())
    }

    /// Returns the number of entries with the given action.
    #[must_use]
    pub fn count(&self, action: Action) -> usize {
        self.changes.iter().filter(|c| c.action == action).count()
    }

    /// Returns the primary (non-deposed) entry for an address.
    #[must_use]
    pub fn get(&self, address: &Address) -> Option<&Change> {
        self.changes
            .iter()
            .find(|c| &c.address == address && c.deposed.is_none())
    }

    /// Returns one-line counts, e.g. `2 to add, 1 to change, 0 to destroy`.
    #[must_use]
    pub fn summary(&self) -> String {
        let replace = self.count(Action::Replace);
        format!(
            "{} to add, {} to change, {} to destroy",
            self.count(Action::Create) + replace,
            self.count(Action::Update),
            self.count(Action::Destroy) + replace
        )
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Destroy => "destroy",
            Self::NoOp => "no-op",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for ReplaceOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreateBeforeDestroy => write!(f, "create before destroy"),
            Self::DestroyBeforeCreate => write!(f, "destroy before create"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceDecl;
    use crate::model::{AttributeSchema, AttributeType};
    use serde_json::json;

    fn queue_schema() -> ResourceSchema {
        ResourceSchema::new("queue")
            .attribute("name", AttributeSchema::required(AttributeType::String).force_new())
            .attribute("timeout", AttributeSchema::optional(AttributeType::Number))
            .output("arn")
    }

    fn sub_schema() -> ResourceSchema {
        ResourceSchema::new("subscription")
            .attribute("endpoint", AttributeSchema::required(AttributeType::String))
            .attribute("queue_id", AttributeSchema::optional(AttributeType::String))
    }

    fn parse(yaml: &str) -> Resource {
        let decl: ResourceDecl = serde_yaml::from_str(yaml).expect("valid yaml");
        let schema = if decl.kind == "queue" { queue_schema() } else { sub_schema() };
        Resource::parse(&decl, &schema, "memory").expect("valid resource")
    }

    fn graph(resources: Vec<Resource>) -> DependencyGraph {
        DependencyGraph::build(resources, [queue_schema(), sub_schema()]).expect("valid graph")
    }

    fn queue(name: &str, timeout: i64) -> Resource {
        parse(&format!(
            "kind: queue\nname: q\nattributes:\n  name: {name}\n  timeout: {timeout}\n"
        ))
    }

    fn subscription() -> Resource {
        parse("kind: subscription\nname: s\nattributes:\n  endpoint: \"${queue.q.arn}\"\n  queue_id: \"${queue.q.id}\"\n")
    }

    fn queue_record(name: &str, timeout: i64) -> StateRecord {
        StateRecord::new(
            Address::new("queue", "q"),
            "memory",
            "q-1",
            AttrMap::from([
                (String::from("name"), json!(name)),
                (String::from("timeout"), json!(timeout)),
            ]),
            AttrMap::from([(String::from("arn"), json!("arn:q-1"))]),
            vec![],
        )
    }

    fn sub_record() -> StateRecord {
        StateRecord::new(
            Address::new("subscription", "s"),
            "memory",
            "s-1",
            AttrMap::from([
                (String::from("endpoint"), json!("arn:q-1")),
                (String::from("queue_id"), json!("q-1")),
            ]),
            AttrMap::new(),
            vec![Address::new("queue", "q")],
        )
    }

    fn snapshot(records: Vec<StateRecord>) -> StateSnapshot {
        records.into_iter().map(|r| (r.address.clone(), r)).collect()
    }

    #[test]
    fn test_empty_state_creates_everything() {
        let g = graph(vec![queue("a", 30), subscription()]);
        let changes = DiffEngine::new().diff(&g, &StateSnapshot::new()).expect("diff");

        assert_eq!(changes.count(Action::Create), 2);
        let sub = changes.get(&Address::new("subscription", "s")).expect("entry");
        assert_eq!(sub.after["endpoint"], PlannedValue::Unknown);
    }

    #[test]
    fn test_unchanged_is_noop_and_resolves_from_state() {
        let g = graph(vec![queue("a", 30), subscription()]);
        let state = snapshot(vec![queue_record("a", 30), sub_record()]);
        let changes = DiffEngine::new().diff(&g, &state).expect("diff");

        assert!(changes.is_empty());
        assert_eq!(changes.count(Action::NoOp), 2);
    }

    #[test]
    fn test_mutable_change_is_update_and_id_stays_known() {
        let g = graph(vec![queue("a", 60), subscription()]);
        let state = snapshot(vec![queue_record("a", 30), sub_record()]);
        let changes = DiffEngine::new().diff(&g, &state).expect("diff");

        let q = changes.get(&Address::new("queue", "q")).expect("entry");
        assert_eq!(q.action, Action::Update);
        assert_eq!(q.field_changes.len(), 1);

        let s = changes.get(&Address::new("subscription", "s")).expect("entry");
        assert_eq!(s.after["queue_id"], PlannedValue::Known(json!("q-1")));
        assert_eq!(s.after["endpoint"], PlannedValue::Unknown);
        assert_eq!(s.action, Action::Update);
    }

    #[test]
    fn test_immutable_change_escalates_to_replace() {
        let g = graph(vec![queue("b", 60)]);
        let state = snapshot(vec![queue_record("a", 30)]);
        let changes = DiffEngine::new().diff(&g, &state).expect("diff");

        let q = changes.get(&Address::new("queue", "q")).expect("entry");
        assert_eq!(q.action, Action::Replace);
        assert_eq!(q.field_changes.len(), 2);
        assert_eq!(q.replace_order, Some(ReplaceOrder::DestroyBeforeCreate));
    }

    #[test]
    fn test_replace_with_dependents_is_create_before_destroy() {
        let g = graph(vec![queue("b", 30), subscription()]);
        let state = snapshot(vec![queue_record("a", 30), sub_record()]);
        let changes = DiffEngine::new().diff(&g, &state).expect("diff");

        let q = changes.get(&Address::new("queue", "q")).expect("entry");
        assert_eq!(q.replace_order, Some(ReplaceOrder::CreateBeforeDestroy));
        let s = changes.get(&Address::new("subscription", "s")).expect("entry");
        assert_eq!(s.action, Action::Update);
    }

    #[test]
    fn test_removed_attribute_counts_as_change() {
        let g = graph(vec![parse("kind: queue\nname: q\nattributes:\n  name: a\n")]);
        let state = snapshot(vec![queue_record("a", 30)]);
        let changes = DiffEngine::new().diff(&g, &state).expect("diff");

        let q = changes.get(&Address::new("queue", "q")).expect("entry");
        assert_eq!(q.action, Action::Update);
        assert_eq!(q.field_changes[0].field, "timeout");
        assert_eq!(q.field_changes[0].after, None);
    }

    #[test]
    fn test_orphans_and_deposed_are_destroyed() {
        let g = graph(vec![queue("a", 30)]);
        let mut queue = queue_record("a", 30);
        queue.deposed.push(DeposedObject {
            id: String::from("q-0"),
            attributes: AttrMap::new(),
        });
        let state = snapshot(vec![queue, sub_record()]);
        let changes = DiffEngine::new().diff(&g, &state).expect("diff");

        assert_eq!(changes.count(Action::Destroy), 2);
        assert!(changes
            .changes
            .iter()
            .any(|c| c.deposed.as_ref().is_some_and(|d| d.id == "q-0")));
        assert_eq!(changes.summary(), "0 to add, 0 to change, 2 to destroy");
    }

    #[test]
    fn test_prevent_destroy_blocks_replace() {
        let g = graph(vec![parse(
            "kind: queue\nname: q\nattributes:\n  name: b\n  timeout: 30\nlifecycle:\n  prevent_destroy: true\n",
        )]);
        let state = snapshot(vec![queue_record("a", 30)]);
        let err = DiffEngine::new().diff(&g, &state).expect_err("prevented");
        assert_eq!(
            err,
            PlanError::DestroyPrevented {
                address: Address::new("queue", "q")
            }
        );
    }

    #[test]
    fn test_targeted_destroy() {
        let g = graph(vec![queue("a", 30), subscription()]);
        let state = snapshot(vec![queue_record("a", 30), sub_record()]);
        let engine = DiffEngine::new();

        let changes = engine
            .diff_destroy(&g, &state, &[Address::new("subscription", "s")])
            .expect("diff");
        assert_eq!(changes.count(Action::Destroy), 1);
        assert_eq!(changes.count(Action::NoOp), 1);

        let err = engine
            .diff_destroy(&g, &state, &[Address::new("queue", "missing")])
            .expect_err("unknown");
        assert!(matches!(err, PlanError::UnknownTarget { .. }));
    }
}
