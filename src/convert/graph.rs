use std::cmp::Reverse;
use std::collections::BinaryHeap;

use super::model::ChangesetId;
use crate::{FHashMap, FHashSet};

/// A changeset dependency graph. An edge `pred -> succ` means `succ`
/// contains an item that depends on an item of `pred`, so `pred` must be
/// committed first.
#[derive(Default)]
pub(super) struct Graph {
    succs: FHashMap<ChangesetId, FHashSet<ChangesetId>>,
    preds: FHashMap<ChangesetId, FHashSet<ChangesetId>>,
}

impl Graph {
    pub(super) fn new() -> Self {
        Self::default()
    }

    pub(super) fn add_node(&mut self, node: ChangesetId) {
        self.succs.entry(node).or_default();
        self.preds.entry(node).or_default();
    }

    pub(super) fn add_edge(&mut self, pred: ChangesetId, succ: ChangesetId) {
        debug_assert_ne!(pred, succ, "self dependency is an internal dependency");
        self.add_node(pred);
        self.add_node(succ);
        self.succs.get_mut(&pred).unwrap().insert(succ);
        self.preds.get_mut(&succ).unwrap().insert(pred);
    }

    /// Kahn's algorithm with a caller-supplied tie-break: among ready nodes,
    /// the one with the smallest priority key is emitted first.
    ///
    /// On a stall (remaining nodes but none ready) returns `Err` with one
    /// induced cycle, listed so that each node depends on the one before it
    /// and the first depends on the last.
    pub(super) fn sort<K: Ord>(
        &self,
        priority: impl Fn(ChangesetId) -> K,
    ) -> Result<Vec<ChangesetId>, Vec<ChangesetId>> {
        let mut in_degree: FHashMap<ChangesetId, usize> = self
            .preds
            .iter()
            .map(|(&node, preds)| (node, preds.len()))
            .collect();

        let mut ready: BinaryHeap<Reverse<(K, ChangesetId)>> = in_degree
            .iter()
            .filter(|&(_, &degree)| degree == 0)
            .map(|(&node, _)| Reverse((priority(node), node)))
            .collect();

        let mut order = Vec::with_capacity(in_degree.len());
        while let Some(Reverse((_, node))) = ready.pop() {
            order.push(node);
            for &succ in self.succs[&node].iter() {
                let degree = in_degree.get_mut(&succ).unwrap();
                *degree -= 1;
                if *degree == 0 {
                    ready.push(Reverse((priority(succ), succ)));
                }
            }
        }

        if order.len() == self.succs.len() {
            Ok(order)
        } else {
            let remaining: FHashSet<ChangesetId> = in_degree
                .iter()
                .filter(|&(_, &degree)| degree > 0)
                .map(|(&node, _)| node)
                .collect();
            Err(self.extract_cycle(&remaining))
        }
    }

    /// Walks predecessor edges inside the stalled set from an arbitrary
    /// stalled node; every stalled node has an unprocessed predecessor, so
    /// the walk must revisit a node, and the revisited stretch is a cycle.
    fn extract_cycle(&self, remaining: &FHashSet<ChangesetId>) -> Vec<ChangesetId> {
        let start = remaining.iter().min().copied().unwrap();

        let mut path = Vec::new();
        let mut on_path: FHashMap<ChangesetId, usize> = FHashMap::default();
        let mut node = start;
        loop {
            if let Some(&first_visit) = on_path.get(&node) {
                let mut cycle = path.split_off(first_visit);
                // `path` was built following dependencies backwards.
                cycle.reverse();
                return cycle;
            }
            on_path.insert(node, path.len());
            path.push(node);

            node = self.preds[&node]
                .iter()
                .filter(|pred| remaining.contains(pred))
                .min()
                .copied()
                .expect("stalled node with no stalled predecessor");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Graph;
    use crate::convert::model::ChangesetId;

    fn id(n: u32) -> ChangesetId {
        ChangesetId(n)
    }

    #[test]
    fn sorts_respecting_dependencies() {
        let mut graph = Graph::new();
        graph.add_edge(id(0), id(1));
        graph.add_edge(id(1), id(2));
        graph.add_edge(id(0), id(2));
        graph.add_node(id(3));

        let order = graph.sort(|node| node).unwrap();
        assert_eq!(order.len(), 4);
        let pos = |n: u32| order.iter().position(|&x| x == id(n)).unwrap();
        assert!(pos(0) < pos(1));
        assert!(pos(1) < pos(2));
    }

    #[test]
    fn tie_break_is_deterministic() {
        let mut graph = Graph::new();
        for n in 0..5 {
            graph.add_node(id(n));
        }
        // No edges: priority alone decides, here reversed ids.
        let order = graph.sort(|node| std::cmp::Reverse(node)).unwrap();
        assert_eq!(order, vec![id(4), id(3), id(2), id(1), id(0)]);
    }

    #[test]
    fn extracts_a_cycle() {
        let mut graph = Graph::new();
        graph.add_edge(id(0), id(1));
        graph.add_edge(id(1), id(2));
        graph.add_edge(id(2), id(1));
        graph.add_edge(id(2), id(3));

        let cycle = graph.sort(|node| node).unwrap_err();
        assert_eq!(cycle.len(), 2);
        assert!(cycle.contains(&id(1)));
        assert!(cycle.contains(&id(2)));
    }

    #[test]
    fn extracts_an_induced_cycle_not_the_whole_stall() {
        let mut graph = Graph::new();
        // 1 <-> 2 is the cycle; 3 and 4 are stalled behind it.
        graph.add_edge(id(1), id(2));
        graph.add_edge(id(2), id(1));
        graph.add_edge(id(2), id(3));
        graph.add_edge(id(3), id(4));

        let cycle = graph.sort(|node| node).unwrap_err();
        assert_eq!(cycle.len(), 2);
        assert!(cycle.contains(&id(1)));
        assert!(cycle.contains(&id(2)));
    }
}
