use std::collections::{HashMap, HashSet};

use super::block::{BlockGraph, BlockId};

/// Dominance and loop facts for a block graph, valid until the next edit.
#[derive(Debug, Clone, Default)]
pub struct Structure {
    rpo: Vec<BlockId>,
    rpo_number: HashMap<BlockId, usize>,
    idom: HashMap<BlockId, BlockId>,
    /// (target block, in slot) of every DFS back edge.
    back_edges: HashSet<(BlockId, usize)>,
    loop_headers: HashSet<BlockId>,
}

impl Structure {
    pub(crate) fn compute(graph: &BlockGraph) -> Self {
        let Some(entry) = graph.entry() else {
            return Self::default();
        };
        let (rpo, back_edges) = depth_first(graph, entry);
        let rpo_number: HashMap<BlockId, usize> =
            rpo.iter().enumerate().map(|(i, &b)| (b, i)).collect();
        let idom = compute_dominators(graph, entry, &rpo, &rpo_number);
        let loop_headers = back_edges.iter().map(|&(b, _)| b).collect();
        Self {
            rpo,
            rpo_number,
            idom,
            back_edges,
            loop_headers,
        }
    }

    /// Reachable blocks in reverse post-order from the entry.
    pub fn rpo(&self) -> &[BlockId] {
        &self.rpo
    }

    pub fn is_reachable(&self, b: BlockId) -> bool {
        self.rpo_number.contains_key(&b)
    }

    /// Immediate dominator; `None` for the entry and for unreachable blocks.
    pub fn idom(&self, b: BlockId) -> Option<BlockId> {
        self.idom.get(&b).copied().filter(|&d| d != b)
    }

    /// Check if `a` dominates `b`.
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        if !self.is_reachable(b) {
            return false;
        }
        let mut cur = b;
        loop {
            if cur == a {
                return true;
            }
            match self.idom.get(&cur) {
                Some(&parent) if parent != cur => cur = parent,
                _ => return false,
            }
        }
    }

    /// True if in edge `in_slot` of `b` closes a cycle in the DFS tree.
    pub fn is_back_edge(&self, b: BlockId, in_slot: usize) -> bool {
        self.back_edges.contains(&(b, in_slot))
    }

    pub fn is_loop_header(&self, b: BlockId) -> bool {
        self.loop_headers.contains(&b)
    }
}

/// Iterative DFS from `entry`: reverse post-order plus the edges that reach
/// a block still on the stack.
fn depth_first(graph: &BlockGraph, entry: BlockId) -> (Vec<BlockId>, HashSet<(BlockId, usize)>) {
    let mut visited: HashSet<BlockId> = HashSet::new();
    let mut on_stack: HashSet<BlockId> = HashSet::new();
    let mut postorder = Vec::new();
    let mut back_edges = HashSet::new();
    let mut stack: Vec<(BlockId, usize)> = vec![(entry, 0)];
    visited.insert(entry);
    on_stack.insert(entry);

    while let Some(top) = stack.last_mut() {
        let (b, slot) = *top;
        let outs = graph[b].outs();
        if slot < outs.len() {
            top.1 += 1;
            let edge = outs[slot];
            if on_stack.contains(&edge.point) {
                back_edges.insert((edge.point, edge.rev));
            } else if visited.insert(edge.point) {
                on_stack.insert(edge.point);
                stack.push((edge.point, 0));
            }
        } else {
            stack.pop();
            on_stack.remove(&b);
            postorder.push(b);
        }
    }

    postorder.reverse();
    (postorder, back_edges)
}

// Cooper-Harvey-Kennedy over the reachable blocks.
fn compute_dominators(
    graph: &BlockGraph,
    entry: BlockId,
    rpo: &[BlockId],
    rpo_number: &HashMap<BlockId, usize>,
) -> HashMap<BlockId, BlockId> {
    let mut idom: HashMap<BlockId, BlockId> = HashMap::new();
    idom.insert(entry, entry);

    let intersect = |mut a: BlockId, mut b: BlockId, idom: &HashMap<BlockId, BlockId>| -> BlockId {
        while a != b {
            while rpo_number[&a] > rpo_number[&b] {
                a = idom[&a];
            }
            while rpo_number[&b] > rpo_number[&a] {
                b = idom[&b];
            }
        }
        a
    };

    let mut changed = true;
    while changed {
        changed = false;
        for &b in rpo {
            if b == entry {
                continue;
            }
            let mut new_idom: Option<BlockId> = None;
            for e in graph[b].ins() {
                let p = e.point;
                if !idom.contains_key(&p) {
                    continue;
                }
                new_idom = Some(match new_idom {
                    None => p,
                    Some(current) => intersect(p, current, &idom),
                });
            }
            if let Some(new) = new_idom {
                if idom.get(&b) != Some(&new) {
                    idom.insert(b, new);
                    changed = true;
                }
            }
        }
    }

    idom
}
