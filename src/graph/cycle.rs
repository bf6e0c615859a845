//! Cycle detection by depth-first search with recursion-stack colouring.

use petgraph::graph::NodeIndex;
use petgraph::Direction;

use crate::model::Address;

use super::DependencyGraph;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Colour {
    /// Not visited yet.
    White,
    /// On the current recursion stack.
    Grey,
    /// Fully explored.
    Black,
}

impl DependencyGraph {
    /// Returns the first cycle found, following dependencies, as a path whose
    /// last address repeats the first. Starts are tried in address order.
    pub(super) fn find_cycle(&self) -> Option<Vec<Address>> {
        let mut colour = vec![Colour::White; self.graph.node_count()];
        let mut stack = Vec::new();

        for &start in self.nodes.values() {
            if colour[start.index()] == Colour::White
                && let Some(cycle) = self.visit(start, &mut colour, &mut stack)
            {
                return Some(cycle.into_iter().map(|n| self.graph[n].clone()).collect());
            }
        }
        None
    }

    fn visit(
        &self,
        node: NodeIndex,
        colour: &mut [Colour],
        stack: &mut Vec<NodeIndex>,
    ) -> Option<Vec<NodeIndex>> {
        colour[node.index()] = Colour::Grey;
        stack.push(node);

        let mut dependencies: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(node, Direction::Incoming)
            .collect();
        dependencies.sort_by(|a, b| self.graph[*a].cmp(&self.graph[*b]));

        for dep in dependencies {
            match colour[dep.index()] {
                Colour::Grey => {
                    let start = stack.iter().position(|n| *n == dep).unwrap_or(0);
                    let mut cycle = stack[start..].to_vec();
                    cycle.push(dep);
                    return Some(cycle);
                }
                Colour::White => {
                    if let Some(cycle) = self.visit(dep, colour, stack) {
                        return Some(cycle);
                    }
                }
                Colour::Black => {}
            }
        }

        stack.pop();
        colour[node.index()] = Colour::Black;
        None
    }
}

#[cfg(test)]
mod tests {
    use crate::config::ResourceDecl;
    use crate::error::GraphError;
    use crate::graph::DependencyGraph;
    use crate::model::{Address, AttributeSchema, AttributeType, Resource, ResourceSchema};

    fn schema(kind: &str) -> ResourceSchema {
        ResourceSchema::new(kind)
            .attribute("source", AttributeSchema::optional(AttributeType::Any))
            .output("arn")
    }

    fn resource(yaml: &str) -> Resource {
        let decl: ResourceDecl = serde_yaml::from_str(yaml).expect("valid yaml");
        Resource::parse(&decl, &schema(&decl.kind), "memory").expect("valid resource")
    }

    #[test]
    fn test_two_node_cycle() {
        let a = resource("kind: queue\nname: a\nattributes:\n  source: \"${queue.b.arn}\"\n");
        let b = resource("kind: queue\nname: b\nattributes:\n  source: \"${queue.a.arn}\"\n");

        let err = DependencyGraph::build(vec![a, b], [schema("queue")]).expect_err("cycle");
        let GraphError::Cycle { path } = err else {
            panic!("expected a cycle, got {err:?}");
        };
        assert_eq!(
            path,
            vec![Address::new("queue", "a"), Address::new("queue", "b"), Address::new("queue", "a")]
        );
    }

    #[test]
    fn test_self_reference_is_cycle() {
        let a = resource("kind: queue\nname: a\nattributes:\n  source: \"${queue.a.arn}\"\n");

        let err = DependencyGraph::build(vec![a], [schema("queue")]).expect_err("cycle");
        assert_eq!(err.to_string(), "Dependency cycle detected: queue.a -> queue.a");
    }

    #[test]
    fn test_cycle_through_nested_and_explicit_edges() {
        let a = resource(
            "kind: queue\nname: a\nattributes:\n  source:\n    statements:\n      - \"${queue.b.arn}\"\n",
        );
        let b = resource("kind: queue\nname: b\ndepends_on: [queue.c]\n");
        let c = resource("kind: queue\nname: c\nattributes:\n  source: \"${queue.a.id}\"\n");

        let err = DependencyGraph::build(vec![a, b, c], [schema("queue")]).expect_err("cycle");
        assert!(matches!(err, GraphError::Cycle { ref path } if path.len() == 4));
    }

    #[test]
    fn test_diamond_is_not_cycle() {
        let top = resource("kind: queue\nname: top\n");
        let left = resource("kind: queue\nname: left\nattributes:\n  source: \"${queue.top.arn}\"\n");
        let right = resource("kind: queue\nname: right\nattributes:\n  source: \"${queue.top.arn}\"\n");
        let bottom = resource(
            "kind: queue\nname: bottom\nattributes:\n  source: [\"${queue.left.arn}\", \"${queue.right.arn}\"]\n",
        );

        assert!(DependencyGraph::build(vec![top, left, right, bottom], [schema("queue")]).is_ok());
    }
}
