//! Wait-for graph cycle detection.
//!
//! Nodes are agents; an edge A -> B means A is waiting for a resource
//! currently held by B. Any cycle is a deadlock.

use std::collections::{BTreeMap, BTreeSet, HashMap};

/// A detected deadlock: the agent cycle and the resources involved.
#[derive(Debug, Clone)]
pub struct DeadlockDetection {
    /// Agents forming the cycle, in wait-for order.
    pub cycle: Vec<String>,
    /// Resources whose contention produced the cycle.
    pub resources: Vec<String>,
}

#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Find the first cycle in the wait-for graph via depth-first search.
///
/// `BTreeMap`/`BTreeSet` keep traversal order deterministic, so repeated
/// calls on the same graph return the same cycle.
pub(crate) fn find_cycle(edges: &BTreeMap<String, BTreeSet<String>>) -> Option<Vec<String>> {
    let mut colors: HashMap<&str, Color> = HashMap::new();
    for (from, targets) in edges {
        colors.entry(from.as_str()).or_insert(Color::White);
        for to in targets {
            colors.entry(to.as_str()).or_insert(Color::White);
        }
    }

    for start in edges.keys() {
        if colors[start.as_str()] != Color::White {
            continue;
        }
        let mut path: Vec<&str> = Vec::new();
        if let Some(cycle) = dfs(start.as_str(), edges, &mut colors, &mut path) {
            return Some(cycle);
        }
    }

    None
}

fn dfs<'a>(
    node: &'a str,
    edges: &'a BTreeMap<String, BTreeSet<String>>,
    colors: &mut HashMap<&'a str, Color>,
    path: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    colors.insert(node, Color::Gray);
    path.push(node);

    if let Some(targets) = edges.get(node) {
        for target in targets {
            match colors.get(target.as_str()).copied().unwrap_or(Color::White) {
                Color::Gray => {
                    // Back edge: the cycle runs from the first occurrence of
                    // `target` on the current path to `node`.
                    let start = path
                        .iter()
                        .position(|n| *n == target.as_str())
                        .unwrap_or(0);
                    return Some(path[start..].iter().map(|s| (*s).to_owned()).collect());
                }
                Color::White => {
                    if let Some(cycle) = dfs(target.as_str(), edges, colors, path) {
                        return Some(cycle);
                    }
                }
                Color::Black => {}
            }
        }
    }

    path.pop();
    colors.insert(node, Color::Black);
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(&str, &str)]) -> BTreeMap<String, BTreeSet<String>> {
        let mut g: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (from, to) in edges {
            g.entry((*from).to_owned())
                .or_default()
                .insert((*to).to_owned());
        }
        g
    }

    #[test]
    fn empty_graph_has_no_cycle() {
        assert!(find_cycle(&BTreeMap::new()).is_none());
    }

    #[test]
    fn chain_has_no_cycle() {
        let g = graph(&[("a", "b"), ("b", "c")]);
        assert!(find_cycle(&g).is_none());
    }

    #[test]
    fn two_agent_cycle_is_found() {
        let g = graph(&[("agent-1", "agent-2"), ("agent-2", "agent-1")]);
        let cycle = find_cycle(&g).expect("cycle expected");
        assert_eq!(cycle.len(), 2);
        assert!(cycle.contains(&"agent-1".to_owned()));
        assert!(cycle.contains(&"agent-2".to_owned()));
    }

    #[test]
    fn three_agent_cycle_is_found() {
        let g = graph(&[("a", "b"), ("b", "c"), ("c", "a")]);
        let cycle = find_cycle(&g).expect("cycle expected");
        assert_eq!(cycle.len(), 3);
    }

    #[test]
    fn cycle_excludes_tail_nodes() {
        // d -> a -> b -> a : the cycle is [a, b], not [d, a, b].
        let g = graph(&[("d", "a"), ("a", "b"), ("b", "a")]);
        let cycle = find_cycle(&g).expect("cycle expected");
        assert_eq!(cycle.len(), 2);
        assert!(!cycle.contains(&"d".to_owned()));
    }

    #[test]
    fn diamond_without_back_edge_has_no_cycle() {
        let g = graph(&[("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")]);
        assert!(find_cycle(&g).is_none());
    }
}
