//! Directed graph used to order model dependencies.
//!
//! Vertices keep their insertion order so every traversal is deterministic.
//! Traversals use an explicit frame stack instead of recursion, visiting
//! vertices in exactly the order a recursive depth-first walk would.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::ops::ControlFlow;

/// Directed graph with adjacency lists
#[derive(Debug, Clone)]
pub struct Graph<T: Eq + Hash + Clone> {
    order: Vec<T>,
    edges: HashMap<T, Vec<T>>,
}

struct Frame<T> {
    vertex: T,
    next: usize,
}

impl<T: Eq + Hash + Clone> Graph<T> {
    pub fn new() -> Self {
        Self {
            order: Vec::new(),
            edges: HashMap::new(),
        }
    }

    /// Insert vertices with empty edge lists. Re-inserting a vertex clears its edges.
    pub fn add_vertex(&mut self, vertices: impl IntoIterator<Item = T>) -> &mut Self {
        for vertex in vertices {
            if !self.edges.contains_key(&vertex) {
                self.order.push(vertex.clone());
            }
            self.edges.insert(vertex, Vec::new());
        }
        self
    }

    /// Remove vertices along with every edge pointing at them
    pub fn del_vertex(&mut self, vertices: impl IntoIterator<Item = T>) -> &mut Self {
        for vertex in vertices {
            if self.edges.remove(&vertex).is_some() {
                self.order.retain(|v| v != &vertex);
                for targets in self.edges.values_mut() {
                    targets.retain(|t| t != &vertex);
                }
            }
        }
        self
    }

    /// Append directed edges `from -> to`. Duplicates are not filtered.
    pub fn add_edge(&mut self, from: T, to: impl IntoIterator<Item = T>) -> &mut Self {
        if !self.edges.contains_key(&from) {
            self.add_vertex([from.clone()]);
        }
        if let Some(targets) = self.edges.get_mut(&from) {
            targets.extend(to);
        }
        self
    }

    pub fn del_edge(&mut self, from: &T, to: impl IntoIterator<Item = T>) -> &mut Self {
        if let Some(targets) = self.edges.get_mut(from) {
            for target in to {
                targets.retain(|t| t != &target);
            }
        }
        self
    }

    pub fn has_vertex(&self, vertex: &T) -> bool {
        self.edges.contains_key(vertex)
    }

    pub fn has_edge(&self, vertex: &T, edge: &T) -> bool {
        self.edges
            .get(vertex)
            .is_some_and(|targets| targets.contains(edge))
    }

    /// Outgoing edges of a vertex, empty for unknown vertices
    pub fn edges(&self, vertex: &T) -> &[T] {
        self.edges.get(vertex).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn vertices(&self) -> impl Iterator<Item = &T> {
        self.order.iter()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Depth-first walk from `start`.
    ///
    /// A vertex is marked visited before its callback runs. Returning
    /// `ControlFlow::Break(())` from the callback stops descent below that
    /// vertex only; siblings are still walked.
    pub fn walk<F>(&self, start: &T, visit: &mut F, visited: &mut HashSet<T>)
    where
        F: FnMut(&T) -> ControlFlow<()>,
    {
        let mut stack: Vec<Frame<T>> = Vec::new();

        if !self.enter(start, visit, visited) {
            return;
        }
        stack.push(Frame {
            vertex: start.clone(),
            next: 0,
        });

        while let Some(frame) = stack.last_mut() {
            let targets = self.edges(&frame.vertex);
            if frame.next >= targets.len() {
                stack.pop();
                continue;
            }

            let target = targets[frame.next].clone();
            frame.next += 1;

            if self.enter(&target, visit, visited) {
                stack.push(Frame {
                    vertex: target,
                    next: 0,
                });
            }
        }
    }

    // Marks a vertex visited and reports whether the walk should descend into it
    fn enter<F>(&self, vertex: &T, visit: &mut F, visited: &mut HashSet<T>) -> bool
    where
        F: FnMut(&T) -> ControlFlow<()>,
    {
        if !visited.insert(vertex.clone()) {
            return false;
        }
        visit(vertex).is_continue()
    }

    /// Walk from every vertex in insertion order with a single shared visited set
    pub fn for_each<F>(&self, mut visit: F)
    where
        F: FnMut(&T) -> ControlFlow<()>,
    {
        let mut visited = HashSet::new();
        for vertex in &self.order {
            self.walk(vertex, &mut visit, &mut visited);
        }
    }

    /// Vertices reachable from `vertex`, in visitation order
    pub fn path(&self, vertex: &T) -> Vec<T> {
        let mut found = Vec::new();
        let mut visited = HashSet::new();
        self.walk(
            vertex,
            &mut |v: &T| {
                found.push(v.clone());
                ControlFlow::Continue(())
            },
            &mut visited,
        );
        found
    }

    /// Whether any cycle exists. Stops at the first back edge.
    pub fn is_cycled(&self) -> bool {
        let mut visited: HashSet<T> = HashSet::new();
        let mut on_stack: HashSet<T> = HashSet::new();

        for root in &self.order {
            if visited.contains(root) {
                continue;
            }

            visited.insert(root.clone());
            on_stack.insert(root.clone());
            let mut stack = vec![Frame {
                vertex: root.clone(),
                next: 0,
            }];

            while let Some(frame) = stack.last_mut() {
                let targets = self.edges(&frame.vertex);
                if frame.next >= targets.len() {
                    on_stack.remove(&frame.vertex);
                    stack.pop();
                    continue;
                }

                let target = &targets[frame.next];
                frame.next += 1;

                if on_stack.contains(target) {
                    return true;
                }
                if visited.insert(target.clone()) {
                    on_stack.insert(target.clone());
                    stack.push(Frame {
                        vertex: target.clone(),
                        next: 0,
                    });
                }
            }
        }

        false
    }

    /// Every vertex after the vertices it points at (depth-first post-order).
    ///
    /// Cycles are tolerated: the edge closing a cycle is ignored.
    pub fn dependency_order(&self) -> Vec<T> {
        let mut visited: HashSet<T> = HashSet::new();
        let mut ordered = Vec::with_capacity(self.order.len());

        for root in &self.order {
            if !visited.insert(root.clone()) {
                continue;
            }
            let mut stack = vec![Frame {
                vertex: root.clone(),
                next: 0,
            }];

            while let Some(frame) = stack.last_mut() {
                let targets = self.edges(&frame.vertex);
                if frame.next >= targets.len() {
                    ordered.push(frame.vertex.clone());
                    stack.pop();
                    continue;
                }

                let target = targets[frame.next].clone();
                frame.next += 1;

                if visited.insert(target.clone()) {
                    stack.push(Frame {
                        vertex: target,
                        next: 0,
                    });
                }
            }
        }

        ordered
    }
}

impl<T: Eq + Hash + Clone> Default for Graph<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(names: &[&'static str]) -> Graph<&'static str> {
        let mut graph = Graph::new();
        for pair in names.windows(2) {
            graph.add_edge(pair[0], [pair[1]]);
        }
        graph
    }

    #[test]
    fn test_cycle_detection() {
        let mut graph = chain(&["A", "B", "C"]);
        assert!(!graph.is_cycled());

        graph.add_edge("C", ["A"]);
        assert!(graph.is_cycled());
    }

    #[test]
    fn test_self_loop_is_cycle() {
        let mut graph = Graph::new();
        graph.add_edge("A", ["A"]);
        assert!(graph.is_cycled());
    }

    #[test]
    fn test_add_vertex_resets_edges() {
        let mut graph = chain(&["A", "B"]);
        assert!(graph.has_edge(&"A", &"B"));

        graph.add_vertex(["A"]);
        assert!(graph.has_vertex(&"A"));
        assert!(!graph.has_edge(&"A", &"B"));
        assert_eq!(graph.vertices().copied().collect::<Vec<_>>(), vec!["A"]);
    }

    #[test]
    fn test_add_edge_keeps_duplicates() {
        let mut graph = Graph::new();
        graph.add_edge("A", ["B", "B"]);
        assert_eq!(graph.edges(&"A"), &["B", "B"]);
        // targets are not registered as vertices
        assert!(!graph.has_vertex(&"B"));
    }

    #[test]
    fn test_del_vertex_and_edge() {
        let mut graph = chain(&["A", "B", "C"]);
        graph.add_edge("A", ["C"]);

        graph.del_edge(&"A", ["C"]);
        assert!(!graph.has_edge(&"A", &"C"));

        graph.del_vertex(["B"]);
        assert!(!graph.has_vertex(&"B"));
        assert!(!graph.has_edge(&"A", &"B"));
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn test_path_in_visit_order() {
        let mut graph = Graph::new();
        graph.add_edge("A", ["B", "C"]);
        graph.add_edge("B", ["D"]);
        graph.add_edge("C", ["D"]);

        assert_eq!(graph.path(&"A"), vec!["A", "B", "D", "C"]);
        assert_eq!(graph.path(&"Z"), vec!["Z"]);
    }

    #[test]
    fn test_walk_stop_prunes_branch_only() {
        let mut graph = Graph::new();
        graph.add_edge("A", ["B", "C"]);
        graph.add_edge("B", ["D"]);

        let mut seen = Vec::new();
        let mut visited = HashSet::new();
        graph.walk(
            &"A",
            &mut |v: &&str| {
                seen.push(*v);
                if *v == "B" {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            },
            &mut visited,
        );

        assert_eq!(seen, vec!["A", "B", "C"]);
    }

    #[test]
    fn test_for_each_visits_once() {
        let mut graph = Graph::new();
        graph.add_vertex(["A", "B", "C"]);
        graph.add_edge("A", ["B"]);
        graph.add_edge("C", ["B"]);

        let mut seen = Vec::new();
        graph.for_each(|v| {
            seen.push(*v);
            ControlFlow::Continue(())
        });

        assert_eq!(seen, vec!["A", "B", "C"]);
    }

    #[test]
    fn test_dependency_order() {
        let mut graph = Graph::new();
        graph.add_vertex(["View", "Line", "Order"]);
        graph.add_edge("Line", ["Order"]);
        graph.add_edge("View", ["Line"]);

        assert_eq!(graph.dependency_order(), vec!["Order", "Line", "View"]);
    }

    #[test]
    fn test_dependency_order_tolerates_cycles() {
        let mut graph = chain(&["A", "B", "A"]);
        graph.add_vertex(["C"]);

        let order = graph.dependency_order();
        assert_eq!(order, vec!["B", "A", "C"]);
    }
}
