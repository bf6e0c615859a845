//! Dependency graph of declared resources.
//!
//! Edges are flattened once at build time from every reference in a
//! resource's attribute tree plus its explicit `depends_on` entries. The graph
//! is guaranteed acyclic and every edge target exists.

mod cycle;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use tracing::debug;

use crate::error::GraphError;
use crate::model::{Address, Resource, ResourceSchema};

/// Why one resource depends on another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    /// An attribute references an output.
    Reference,
    /// Declared with `depends_on`.
    Explicit,
}

/// A flattened dependency edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    /// Dependent resource.
    pub from: Address,
    /// Resource depended upon.
    pub to: Address,
    /// Referenced output, for reference edges.
    pub output: Option<String>,
    /// Edge origin.
    pub kind: EdgeKind,
}

/// Acyclic dependency graph of declared resources.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Edges point from producer to consumer.
    graph: DiGraph<Address, EdgeKind>,
    nodes: BTreeMap<Address, NodeIndex>,
    resources: BTreeMap<Address, Resource>,
    schemas: BTreeMap<String, ResourceSchema>,
    edges: Vec<Edge>,
}

impl DependencyGraph {
    /// Builds the graph.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::DanglingReference`] when a reference or
    /// `depends_on` entry names an undeclared address,
    /// [`GraphError::UnknownOutput`] when the target kind does not export the
    /// referenced output, and [`GraphError::Cycle`] when edges form a cycle.
    pub fn build(
        resources: Vec<Resource>,
        schemas: impl IntoIterator<Item = ResourceSchema>,
    ) -> Result<Self, GraphError> {
        let schemas: BTreeMap<String, ResourceSchema> =
            schemas.into_iter().map(|s| (s.kind.clone(), s)).collect();

        let mut by_address = BTreeMap::new();
        for resource in resources {
            let address = resource.address.clone();
            if by_address.insert(address.clone(), resource).is_some() {
                return Err(GraphError::DuplicateAddress { address });
            }
        }

        let edges = Self::flatten_edges(&by_address, &schemas)?;

        let mut graph = DiGraph::new();
        let mut nodes = BTreeMap::new();
        for address in by_address.keys() {
            nodes.insert(address.clone(), graph.add_node(address.clone()));
        }
        for edge in &edges {
            let producer = nodes[&edge.to];
            let consumer = nodes[&edge.from];
            match graph.find_edge(producer, consumer) {
                Some(existing) if edge.kind == EdgeKind::Reference => graph[existing] = edge.kind,
                Some(_) => {}
                None => {
                    graph.add_edge(producer, consumer, edge.kind);
                }
            }
        }

        let dependency_graph = Self {
            graph,
            nodes,
            resources: by_address,
            schemas,
            edges,
        };

        if let Some(path) = dependency_graph.find_cycle() {
            return Err(GraphError::Cycle { path });
        }

        debug!(
            resources = dependency_graph.len(),
            edges = dependency_graph.edges.len(),
            "dependency graph built"
        );
        Ok(dependency_graph)
    }

    fn flatten_edges(
        resources: &BTreeMap<Address, Resource>,
        schemas: &BTreeMap<String, ResourceSchema>,
    ) -> Result<Vec<Edge>, GraphError> {
        let mut edges = Vec::new();

        for (address, resource) in resources {
            for reference in resource.references() {
                let Some(target) = resources.get(&reference.target) else {
                    return Err(GraphError::DanglingReference {
                        from: address.clone(),
                        target: reference.target.clone(),
                    });
                };
                let exported = schemas
                    .get(&target.address.kind)
                    .map_or(reference.output == crate::model::ID_OUTPUT, |s| {
                        s.exports(&reference.output)
                    });
                if !exported {
                    return Err(GraphError::UnknownOutput {
                        from: address.clone(),
                        target: reference.target.clone(),
                        output: reference.output.clone(),
                    });
                }
                edges.push(Edge {
                    from: address.clone(),
                    to: reference.target.clone(),
                    output: Some(reference.output.clone()),
                    kind: EdgeKind::Reference,
                });
            }

            for dep in &resource.depends_on {
                if !resources.contains_key(dep) {
                    return Err(GraphError::DanglingReference {
                        from: address.clone(),
                        target: dep.clone(),
                    });
                }
                edges.push(Edge {
                    from: address.clone(),
                    to: dep.clone(),
                    output: None,
                    kind: EdgeKind::Explicit,
                });
            }
        }

        Ok(edges)
    }

    /// Returns the number of resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Returns true if the graph has no resources.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Returns true if `address` is declared.
    #[must_use]
    pub fn contains(&self, address: &Address) -> bool {
        self.resources.contains_key(address)
    }

    /// Returns a declared resource.
    #[must_use]
    pub fn resource(&self, address: &Address) -> Option<&Resource> {
        self.resources.get(address)
    }

    /// Returns every declared resource in address order.
    pub fn resources(&self) -> impl Iterator<Item = &Resource> {
        self.resources.values()
    }

    /// Returns the schema of a kind.
    #[must_use]
    pub fn schema(&self, kind: &str) -> Option<&ResourceSchema> {
        self.schemas.get(kind)
    }

    /// Returns the flattened edge list.
    #[must_use]
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Returns the addresses `address` depends on directly.
    #[must_use]
    pub fn dependencies(&self, address: &Address) -> Vec<Address> {
        self.neighbours(address, Direction::Incoming)
    }

    /// Returns the addresses depending directly on `address`.
    #[must_use]
    pub fn dependents(&self, address: &Address) -> Vec<Address> {
        self.neighbours(address, Direction::Outgoing)
    }

    /// Returns true if any declared resource depends on `address`.
    #[must_use]
    pub fn has_dependents(&self, address: &Address) -> bool {
        self.nodes.get(address).is_some_and(|&idx| {
            self.graph
                .neighbors_directed(idx, Direction::Outgoing)
                .next()
                .is_some()
        })
    }

    /// Returns every address depending on `address`, directly or not.
    #[must_use]
    pub fn transitive_dependents(&self, address: &Address) -> BTreeSet<Address> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<Address> = self.dependents(address).into();
        while let Some(next) = queue.pop_front() {
            if seen.insert(next.clone()) {
                queue.extend(self.dependents(&next));
            }
        }
        seen
    }

    fn neighbours(&self, address: &Address, direction: Direction) -> Vec<Address> {
        let Some(&idx) = self.nodes.get(address) else {
            return Vec::new();
        };
        let mut out: Vec<Address> = self
            .graph
            .neighbors_directed(idx, direction)
            .map(|n| self.graph[n].clone())
            .collect();
        out.sort();
        out
    }

    /// Returns addresses with producers before consumers.
    ///
    /// Ties are broken by address so the order is deterministic.
    #[must_use]
    pub fn topological_order(&self) -> Vec<Address> {
        let mut in_degree: BTreeMap<&Address, usize> = self
            .nodes
            .iter()
            .map(|(a, &idx)| {
                (
                    a,
                    self.graph.neighbors_directed(idx, Direction::Incoming).count(),
                )
            })
            .collect();

        let mut ready: BTreeSet<&Address> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(a, _)| *a)
            .collect();

        let mut order = Vec::with_capacity(self.len());
        while let Some(address) = ready.pop_first() {
            order.push(address.clone());
            for dependent in self.graph.neighbors_directed(self.nodes[address], Direction::Outgoing) {
                let dependent = &self.graph[dependent];
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(dependent);
                    }
                }
            }
        }
        order
    }

    /// Renders the graph in Graphviz DOT format.
    #[must_use]
    pub fn to_dot(&self) -> String {
        format!("{}", petgraph::dot::Dot::new(&self.graph))
    }
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reference => write!(f, "ref"),
            Self::Explicit => write!(f, "depends_on"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceDecl;
    use crate::model::{AttributeSchema, AttributeType};

    fn schemas() -> Vec<ResourceSchema> {
        ["queue", "topic", "policy", "function"]
            .into_iter()
            .map(|kind| {
                ResourceSchema::new(kind)
                    .attribute("target", AttributeSchema::optional(AttributeType::Any))
                    .output("arn")
            })
            .collect()
    }

    fn resource(kind: &str, name: &str, target: Option<&str>) -> Resource {
        let mut yaml = format!("kind: {kind}\nname: {name}\n");
        if let Some(target) = target {
            yaml.push_str(&format!("attributes:\n  target: \"{target}\"\n"));
        }
        let decl: ResourceDecl = serde_yaml::from_str(&yaml).expect("valid yaml");
        let schema = schemas()
            .into_iter()
            .find(|s| s.kind == kind)
            .expect("schema");
        Resource::parse(&decl, &schema, "memory").expect("valid resource")
    }

    #[test]
    fn test_topological_order_producers_first() {
        let graph = DependencyGraph::build(
            vec![
                resource("policy", "p", Some("${queue.q.arn}")),
                resource("queue", "q", Some("${topic.t.arn}")),
                resource("topic", "t", None),
                resource("function", "f", None),
            ],
            schemas(),
        )
        .expect("acyclic");

        let order: Vec<String> = graph
            .topological_order()
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(order, vec!["function.f", "topic.t", "queue.q", "policy.p"]);
        assert_eq!(graph.dependents(&Address::new("topic", "t")), vec![Address::new("queue", "q")]);
        assert_eq!(graph.transitive_dependents(&Address::new("topic", "t")).len(), 2);
        assert!(!graph.has_dependents(&Address::new("policy", "p")));
    }

    #[test]
    fn test_dangling_reference() {
        let err = DependencyGraph::build(vec![resource("queue", "q", Some("${topic.t.arn}"))], schemas())
            .expect_err("dangling");
        assert_eq!(
            err,
            GraphError::DanglingReference {
                from: Address::new("queue", "q"),
                target: Address::new("topic", "t"),
            }
        );
    }

    #[test]
    fn test_unknown_output() {
        let err = DependencyGraph::build(
            vec![
                resource("queue", "q", Some("${topic.t.url}")),
                resource("topic", "t", None),
            ],
            schemas(),
        )
        .expect_err("unknown output");
        assert!(matches!(err, GraphError::UnknownOutput { ref output, .. } if output == "url"));
    }

    #[test]
    fn test_id_output_always_exported() {
        let graph = DependencyGraph::build(
            vec![
                resource("queue", "q", Some("${topic.t.id}")),
                resource("topic", "t", None),
            ],
            schemas(),
        );
        assert!(graph.is_ok());
    }

    #[test]
    fn test_duplicate_address() {
        let err = DependencyGraph::build(
            vec![resource("topic", "t", None), resource("topic", "t", None)],
            schemas(),
        )
        .expect_err("duplicate");
        assert!(matches!(err, GraphError::DuplicateAddress { .. }));
    }

    #[test]
    fn test_dot_output_mentions_edges() {
        let graph = DependencyGraph::build(
            vec![
                resource("queue", "q", Some("${topic.t.arn}")),
                resource("topic", "t", None),
            ],
            schemas(),
        )
        .expect("acyclic");
        let dot = graph.to_dot();
        assert!(dot.starts_with("digraph"));
        assert!(dot.contains("ref"));
    }
}
