//! Wait-for graph over transactions, used by the deadlock detector.

use std::collections::{HashMap, HashSet};

pub struct WaitForGraph {
    // waiter -> the transactions it waits for
    edges: HashMap<u64, HashSet<u64>>,
}

impl WaitForGraph {
    pub fn from_edges(pairs: &[(u64, u64)]) -> Self {
        let mut edges: HashMap<u64, HashSet<u64>> = HashMap::new();
        for &(from, to) in pairs {
            edges.entry(from).or_default().insert(to);
        }
        Self { edges }
    }

    /// Returns the transactions on some cycle, or `None` when the graph
    /// is acyclic. DFS with a recursion stack; the cycle is recovered
    /// from the path when a stacked node is revisited.
    pub fn find_cycle(&self) -> Option<Vec<u64>> {
        let mut visited = HashSet::new();
        let mut stack = Vec::new();
        let mut on_stack = HashSet::new();

        let mut roots: Vec<u64> = self.edges.keys().copied().collect();
        roots.sort_unstable();
        for root in roots {
            if visited.contains(&root) {
                continue;
            }
            if let Some(cycle) = self.dfs(root, &mut visited, &mut stack, &mut on_stack) {
                return Some(cycle);
            }
        }
        None
    }

    fn dfs(
        &self,
        node: u64,
        visited: &mut HashSet<u64>,
        stack: &mut Vec<u64>,
        on_stack: &mut HashSet<u64>,
    ) -> Option<Vec<u64>> {
        visited.insert(node);
        stack.push(node);
        on_stack.insert(node);

        if let Some(nexts) = self.edges.get(&node) {
            let mut nexts: Vec<u64> = nexts.iter().copied().collect();
            nexts.sort_unstable();
            for next in nexts {
                if on_stack.contains(&next) {
                    let start = stack.iter().position(|&n| n == next).unwrap();
                    return Some(stack[start..].to_vec());
                }
                if !visited.contains(&next) {
                    if let Some(cycle) = self.dfs(next, visited, stack, on_stack) {
                        return Some(cycle);
                    }
                }
            }
        }

        stack.pop();
        on_stack.remove(&node);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_cycle() {
        let g = WaitForGraph::from_edges(&[(1, 2), (2, 3), (1, 3)]);
        assert!(g.find_cycle().is_none());
    }

    #[test]
    fn test_two_cycle() {
        let g = WaitForGraph::from_edges(&[(1, 2), (2, 1)]);
        let mut cycle = g.find_cycle().unwrap();
        cycle.sort_unstable();
        assert_eq!(cycle, vec![1, 2]);
    }

    #[test]
    fn test_longer_cycle_with_tail() {
        let g = WaitForGraph::from_edges(&[(9, 1), (1, 2), (2, 3), (3, 1)]);
        let mut cycle = g.find_cycle().unwrap();
        cycle.sort_unstable();
        assert_eq!(cycle, vec![1, 2, 3]);
    }

    #[test]
    fn test_self_wait_is_a_cycle() {
        // Should not happen in practice, but the detector must not spin
        // forever if it does.
        let g = WaitForGraph::from_edges(&[(4, 4)]);
        assert_eq!(g.find_cycle().unwrap(), vec![4]);
    }

    #[test]
    fn test_empty_graph() {
        let g = WaitForGraph::from_edges(&[]);
        assert!(g.find_cycle().is_none());
    }
}
