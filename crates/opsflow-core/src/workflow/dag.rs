//! Graph validation, cycle detection and topological ordering.
//!
//! Nodes are dispatched in the order produced by [`topological_sort`]: Kahn's
//! algorithm with FIFO tie-breaking, seeded in declaration order, so the same
//! definition always runs its nodes in the same sequence. [`detect_cycles`] is
//! the pre-flight guard; the sort re-checks independently.

use std::collections::{HashMap, HashSet, VecDeque};

use opsflow_types::workflow::{WorkflowDefinition, WorkflowEdge, WorkflowNode};

use super::error::WorkflowError;

// ---------------------------------------------------------------------------
// Structural validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a definition.
///
/// Checks:
/// - All node IDs are unique
/// - Every edge references existing nodes
/// - The graph is acyclic
pub fn validate_structure(def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    let mut seen = HashSet::new();
    for node in &def.nodes {
        if !seen.insert(node.id.as_str()) {
            return Err(WorkflowError::Validation(format!(
                "duplicate node ID: '{}'",
                node.id
            )));
        }
    }

    for edge in &def.edges {
        for endpoint in [&edge.source, &edge.target] {
            if !seen.contains(endpoint.as_str()) {
                return Err(WorkflowError::UnknownNode(format!(
                    "edge '{}' references unknown node '{}'",
                    edge.id, endpoint
                )));
            }
        }
    }

    if detect_cycles(&def.nodes, &def.edges) {
        return Err(WorkflowError::CycleDetected(format!(
            "workflow '{}' contains a cycle",
            def.id
        )));
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Cycle detection
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Three-colour depth-first search. Returns `true` if any cycle exists.
///
/// Edges that reference unknown nodes are ignored here; structural
/// validation reports them separately.
pub fn detect_cycles(nodes: &[WorkflowNode], edges: &[WorkflowEdge]) -> bool {
    let index: HashMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.id.as_str(), i))
        .collect();

    let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for edge in edges {
        if let (Some(&from), Some(&to)) =
            (index.get(edge.source.as_str()), index.get(edge.target.as_str()))
        {
            adjacency[from].push(to);
        }
    }

    let mut color = vec![Color::White; nodes.len()];

    for start in 0..nodes.len() {
        if color[start] != Color::White {
            continue;
        }

        // Explicit stack of (node, next child position) keeps deep chains off
        // the call stack.
        let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
        color[start] = Color::Gray;

        while let Some(frame) = stack.last_mut() {
            let (node, child_pos) = *frame;
            if let Some(&next) = adjacency[node].get(child_pos) {
                frame.1 += 1;
                match color[next] {
                    Color::Gray => return true,
                    Color::White => {
                        color[next] = Color::Gray;
                        stack.push((next, 0));
                    }
                    Color::Black => {}
                }
            } else {
                color[node] = Color::Black;
                stack.pop();
            }
        }
    }

    false
}

// ---------------------------------------------------------------------------
// Topological order
// ---------------------------------------------------------------------------

/// Kahn's algorithm over the edge list.
///
/// Nodes with equal in-degree leave the queue in FIFO order, starting from
/// declaration order. Fails with [`WorkflowError::CycleDetected`] when not
/// every node could be ordered.
pub fn topological_sort(
    nodes: &[WorkflowNode],
    edges: &[WorkflowEdge],
) -> Result<Vec<String>, WorkflowError> {
    let index: HashMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.id.as_str(), i))
        .collect();

    let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    let mut in_degree = vec![0usize; nodes.len()];

    for edge in edges {
        let from = *index.get(edge.source.as_str()).ok_or_else(|| {
            WorkflowError::UnknownNode(format!(
                "edge '{}' references unknown node '{}'",
                edge.id, edge.source
            ))
        })?;
        let to = *index.get(edge.target.as_str()).ok_or_else(|| {
            WorkflowError::UnknownNode(format!(
                "edge '{}' references unknown node '{}'",
                edge.id, edge.target
            ))
        })?;
        adjacency[from].push(to);
        in_degree[to] += 1;
    }

    let mut queue: VecDeque<usize> = (0..nodes.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut sorted = Vec::with_capacity(nodes.len());

    while let Some(current) = queue.pop_front() {
        sorted.push(nodes[current].id.clone());
        for &next in &adjacency[current] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push_back(next);
            }
        }
    }

    if sorted.len() != nodes.len() {
        let stuck: Vec<&str> = (0..nodes.len())
            .filter(|&i| in_degree[i] > 0)
            .map(|i| nodes[i].id.as_str())
            .collect();
        return Err(WorkflowError::CycleDetected(format!(
            "cycle among nodes: {}",
            stuck.join(", ")
        )));
    }

    Ok(sorted)
}

// ---------------------------------------------------------------------------
// Neighbourhood helpers
// ---------------------------------------------------------------------------

/// Sources of all edges pointing at `node_id`, in edge declaration order.
pub fn predecessors<'a>(node_id: &str, edges: &'a [WorkflowEdge]) -> Vec<&'a str> {
    edges
        .iter()
        .filter(|e| e.target == node_id)
        .map(|e| e.source.as_str())
        .collect()
}

/// Breadth-first set of nodes reachable from `root`, including `root`.
pub fn reachable_from<'a>(root: &'a str, edges: &'a [WorkflowEdge]) -> HashSet<&'a str> {
    let mut visited: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::new();
    visited.insert(root);
    queue.push_back(root);

    while let Some(current) = queue.pop_front() {
        for edge in edges.iter().filter(|e| e.source == current) {
            if visited.insert(edge.target.as_str()) {
                queue.push_back(edge.target.as_str());
            }
        }
    }

    visited
}

/// Nodes to mark skipped when the branch rooted at `root` is not taken.
///
/// The root is always pruned. Every other node reachable from it is pruned
/// only when all of its predecessors are pruned (or were already skipped), so
/// join nodes fed by a live path stay pending. Returned in `order`.
pub fn prune_branch(
    root: &str,
    order: &[String],
    edges: &[WorkflowEdge],
    already_skipped: &HashSet<String>,
) -> Vec<String> {
    let reachable = reachable_from(root, edges);
    let mut pruned: HashSet<&str> = HashSet::new();
    let mut result = Vec::new();

    for node_id in order {
        if !reachable.contains(node_id.as_str()) {
            continue;
        }
        let dead = node_id == root
            || predecessors(node_id, edges)
                .iter()
                .all(|p| pruned.contains(p) || already_skipped.contains(*p));
        if dead {
            pruned.insert(node_id.as_str());
            result.push(node_id.clone());
        }
    }

    result
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use opsflow_types::workflow::NodeKind;

    fn nodes(ids: &[&str]) -> Vec<WorkflowNode> {
        ids.iter().map(|id| WorkflowNode::new(*id, NodeKind::Input)).collect()
    }

    fn edges(pairs: &[(&str, &str)]) -> Vec<WorkflowEdge> {
        pairs
            .iter()
            .enumerate()
            .map(|(i, (s, t))| WorkflowEdge::new(format!("e{i}"), *s, *t))
            .collect()
    }

    fn definition(ids: &[&str], pairs: &[(&str, &str)]) -> WorkflowDefinition {
        WorkflowDefinition {
            id: "wf".to_string(),
            name: "wf".to_string(),
            version: "1".to_string(),
            nodes: nodes(ids),
            edges: edges(pairs),
            settings: None,
        }
    }

    fn position(order: &[String], id: &str) -> usize {
        order.iter().position(|n| n == id).unwrap()
    }

    // -----------------------------------------------------------------------
    // Cycle detection
    // -----------------------------------------------------------------------

    #[test]
    fn detect_cycles_acyclic() {
        let n = nodes(&["a", "b", "c", "d"]);
        let e = edges(&[("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")]);
        assert!(!detect_cycles(&n, &e));
    }

    #[test]
    fn detect_cycles_two_node_cycle() {
        let n = nodes(&["a", "b"]);
        let e = edges(&[("a", "b"), ("b", "a")]);
        assert!(detect_cycles(&n, &e));
    }

    #[test]
    fn detect_cycles_self_loop() {
        let n = nodes(&["a"]);
        let e = edges(&[("a", "a")]);
        assert!(detect_cycles(&n, &e));
    }

    #[test]
    fn detect_cycles_cycle_behind_acyclic_prefix() {
        let n = nodes(&["start", "a", "b", "c"]);
        let e = edges(&[("start", "a"), ("a", "b"), ("b", "c"), ("c", "a")]);
        assert!(detect_cycles(&n, &e));
    }

    #[test]
    fn detect_cycles_does_not_mutate_input() {
        let n = nodes(&["a", "b"]);
        let e = edges(&[("a", "b")]);
        let before = e.clone();
        detect_cycles(&n, &e);
        assert_eq!(e, before);
    }

    // -----------------------------------------------------------------------
    // Topological sort
    // -----------------------------------------------------------------------

    #[test]
    fn topological_sort_orders_every_edge() {
        let n = nodes(&["f", "e", "d", "c", "b", "a"]);
        let e = edges(&[
            ("a", "b"),
            ("a", "c"),
            ("b", "d"),
            ("c", "e"),
            ("d", "f"),
            ("e", "f"),
        ]);
        let order = topological_sort(&n, &e).unwrap();
        assert_eq!(order.len(), 6);
        for edge in &e {
            assert!(
                position(&order, &edge.source) < position(&order, &edge.target),
                "{} must precede {}",
                edge.source,
                edge.target
            );
        }
    }

    #[test]
    fn topological_sort_fifo_tie_breaking() {
        // Independent nodes keep declaration order
        let n = nodes(&["c", "a", "b"]);
        let order = topological_sort(&n, &[]).unwrap();
        assert_eq!(order, vec!["c", "a", "b"]);

        // Children released in edge order
        let n = nodes(&["root", "x", "y"]);
        let e = edges(&[("root", "y"), ("root", "x")]);
        let order = topological_sort(&n, &e).unwrap();
        assert_eq!(order, vec!["root", "y", "x"]);
    }

    #[test]
    fn topological_sort_cycle_error_mentions_cycle() {
        let n = nodes(&["a", "b", "c"]);
        let e = edges(&[("a", "b"), ("b", "c"), ("c", "b")]);
        let err = topological_sort(&n, &e).unwrap_err();
        assert!(matches!(err, WorkflowError::CycleDetected(_)));
        assert!(err.to_string().contains("cycle"), "got: {err}");
    }

    #[test]
    fn topological_sort_unknown_node() {
        let n = nodes(&["a"]);
        let e = edges(&[("a", "ghost")]);
        let err = topological_sort(&n, &e).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    // -----------------------------------------------------------------------
    // Structural validation
    // -----------------------------------------------------------------------

    #[test]
    fn validate_structure_ok() {
        let def = definition(&["a", "b"], &[("a", "b")]);
        assert!(validate_structure(&def).is_ok());
    }

    #[test]
    fn validate_structure_duplicate_ids() {
        let def = definition(&["a", "a"], &[]);
        let err = validate_structure(&def).unwrap_err();
        assert!(err.to_string().contains("duplicate node ID"));
    }

    #[test]
    fn validate_structure_unknown_edge_target() {
        let def = definition(&["a"], &[("a", "missing")]);
        let err = validate_structure(&def).unwrap_err();
        assert!(matches!(err, WorkflowError::UnknownNode(_)));
    }

    #[test]
    fn validate_structure_cycle() {
        let def = definition(&["a", "b"], &[("a", "b"), ("b", "a")]);
        let err = validate_structure(&def).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn validate_structure_accepts_empty_definition() {
        let def = definition(&[], &[]);
        assert!(validate_structure(&def).is_ok());
        assert!(topological_sort(&def.nodes, &def.edges).unwrap().is_empty());
    }

    // -----------------------------------------------------------------------
    // Branch pruning
    // -----------------------------------------------------------------------

    #[test]
    fn reachable_from_includes_root() {
        let e = edges(&[("a", "b"), ("b", "c"), ("x", "y")]);
        let reach = reachable_from("a", &e);
        assert_eq!(reach.len(), 3);
        assert!(!reach.contains("x"));
    }

    #[test]
    fn prune_branch_keeps_join_nodes() {
        //        cond
        //       /    \
        //      A      B
        //      |      |
        //      A2     B2
        //       \    /
        //        join
        let ids = ["cond", "A", "B", "A2", "B2", "join"];
        let n = nodes(&ids);
        let e = edges(&[
            ("cond", "A"),
            ("cond", "B"),
            ("A", "A2"),
            ("B", "B2"),
            ("A2", "join"),
            ("B2", "join"),
        ]);
        let order = topological_sort(&n, &e).unwrap();
        let pruned = prune_branch("B", &order, &e, &HashSet::new());
        assert_eq!(pruned, vec!["B", "B2"]);
    }

    #[test]
    fn prune_branch_whole_tail_when_exclusive() {
        let n = nodes(&["cond", "A", "B", "B2", "B3"]);
        let e = edges(&[("cond", "A"), ("cond", "B"), ("B", "B2"), ("B2", "B3")]);
        let order = topological_sort(&n, &e).unwrap();
        let pruned = prune_branch("B", &order, &e, &HashSet::new());
        assert_eq!(pruned, vec!["B", "B2", "B3"]);
    }
}
