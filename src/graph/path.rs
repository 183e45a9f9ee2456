//! Breadth-first shortest path over the adjacency map.
//!
//! Frontier records live in an arena and point at their parent by index, so
//! the path is rebuilt by walking indices back to the root.

use std::collections::{BTreeMap, HashSet, VecDeque};

use super::GraphEdge;

struct Frontier<'a> {
    node: i64,
    /// Edge taken to reach `node`; `None` for the root.
    edge: Option<&'a GraphEdge>,
    parent: Option<usize>,
}

/// Fewest-hop path from `source` to `destination`, in travel order.
///
/// Empty when the two are equal or not connected. Among equal-length paths
/// the one reached first in adjacency insertion order wins.
pub(crate) fn shortest_path(
    adjacency: &BTreeMap<i64, Vec<GraphEdge>>,
    source: i64,
    destination: i64,
) -> Vec<GraphEdge> {
    if source == destination {
        return Vec::new();
    }

    let mut arena = vec![Frontier {
        node: source,
        edge: None,
        parent: None,
    }];
    let mut visited = HashSet::from([source]);
    let mut queue = VecDeque::from([0usize]);

    while let Some(index) = queue.pop_front() {
        let node = arena[index].node;
        let Some(edges) = adjacency.get(&node) else {
            continue;
        };

        for edge in edges {
            if !visited.insert(edge.destination_id) {
                continue;
            }

            arena.push(Frontier {
                node: edge.destination_id,
                edge: Some(edge),
                parent: Some(index),
            });
            let child = arena.len() - 1;

            if edge.destination_id == destination {
                return walk_back(&arena, child);
            }
            queue.push_back(child);
        }
    }

    Vec::new()
}

fn walk_back(arena: &[Frontier<'_>], mut index: usize) -> Vec<GraphEdge> {
    let mut path = Vec::new();
    while let (Some(edge), Some(parent)) = (arena[index].edge, arena[index].parent) {
        path.push(edge.clone());
        index = parent;
    }
    path.reverse();
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(source: i64, destination: i64, profile: &str) -> GraphEdge {
        GraphEdge {
            source_id: source,
            destination_id: destination,
            source_agent_id: format!("agent-{}", source),
            destination_agent_id: format!("agent-{}", destination),
            c2_profile_name: profile.to_string(),
        }
    }

    fn graph(links: &[(i64, i64, &str)]) -> BTreeMap<i64, Vec<GraphEdge>> {
        let mut adjacency: BTreeMap<i64, Vec<GraphEdge>> = BTreeMap::new();
        for &(a, b, profile) in links {
            adjacency.entry(a).or_default().push(edge(a, b, profile));
            adjacency.entry(b).or_default().push(edge(b, a, profile));
        }
        adjacency
    }

    fn hops(path: &[GraphEdge]) -> Vec<(i64, i64)> {
        path.iter().map(|e| (e.source_id, e.destination_id)).collect()
    }

    #[test]
    fn test_self_path_is_empty() {
        let adjacency = graph(&[(1, 2, "smb")]);
        assert!(shortest_path(&adjacency, 1, 1).is_empty());
        assert!(shortest_path(&adjacency, 9, 9).is_empty());
    }

    #[test]
    fn test_disconnected_is_empty() {
        let adjacency = graph(&[(1, 2, "smb"), (3, 4, "tcp")]);
        assert!(shortest_path(&adjacency, 1, 4).is_empty());
        assert!(shortest_path(&adjacency, 1, 99).is_empty());
    }

    #[test]
    fn test_chain_in_travel_order() {
        let adjacency = graph(&[(1, 2, "smb"), (2, 3, "tcp"), (3, 4, "webshell")]);

        let path = shortest_path(&adjacency, 1, 4);
        assert_eq!(hops(&path), vec![(1, 2), (2, 3), (3, 4)]);
        assert_eq!(path[1].c2_profile_name, "tcp");

        let back = shortest_path(&adjacency, 4, 1);
        assert_eq!(hops(&back), vec![(4, 3), (3, 2), (2, 1)]);
    }

    #[test]
    fn test_direct_link_beats_longer_route() {
        let adjacency = graph(&[(1, 2, "smb"), (2, 3, "smb"), (3, 4, "smb"), (1, 4, "tcp")]);

        let path = shortest_path(&adjacency, 1, 4);
        assert_eq!(hops(&path), vec![(1, 4)]);
        assert_eq!(path[0].c2_profile_name, "tcp");
    }

    #[test]
    fn test_tie_break_follows_insertion_order() {
        // Two 2-hop routes from 1 to 4: via 2 (added first) and via 3.
        let adjacency = graph(&[(1, 2, "smb"), (1, 3, "smb"), (2, 4, "smb"), (3, 4, "smb")]);
        assert_eq!(hops(&shortest_path(&adjacency, 1, 4)), vec![(1, 2), (2, 4)]);
    }

    #[test]
    fn test_cycles_terminate() {
        let adjacency = graph(&[(1, 2, "smb"), (2, 3, "smb"), (3, 1, "smb"), (3, 5, "tcp")]);
        assert_eq!(hops(&shortest_path(&adjacency, 2, 5)), vec![(2, 3), (3, 5)]);
    }
}
