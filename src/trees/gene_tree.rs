//! Unrooted gene tree stored as a flat arena of half-edges.
//!
//! Every branch is a pair of directed half-edges (`back` links the pair);
//! the three half-edges of an internal node form a `next` cycle, leaves
//! have no `next`. The CLV of a half-edge `u` covers the subtree seen when
//! looking into `u`'s node from the branch `(u, back(u))`; a virtual root
//! over that branch has `u` and `back(u)` as children.

use crate::errors::TreeError;
use crate::rng;
use anyhow::Result;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

pub type HalfEdgeId = usize;

#[derive(Clone, Debug)]
pub struct HalfEdge {
    back: HalfEdgeId,
    next: Option<HalfEdgeId>,
    label: Option<String>,
    length: f64,
}

#[derive(Clone, Debug)]
pub struct GeneTree {
    half_edges: Vec<HalfEdge>,
}

/// Plain rooted topology used to build trees (parsed newick, random trees).
#[derive(Clone, Debug)]
pub struct TopoNode {
    pub label: Option<String>,
    pub length: f64,
    pub children: Vec<TopoNode>,
}

impl TopoNode {
    pub fn leaf(label: &str) -> Self {
        TopoNode { label: Some(label.to_string()), length: 1.0, children: vec![] }
    }

    pub fn join(children: Vec<TopoNode>) -> Self {
        TopoNode { label: None, length: 1.0, children }
    }
}

/// Snapshot of the half-edges touched by an SPR move.
#[derive(Clone, Debug)]
pub struct GeneRollback {
    saved: Vec<(HalfEdgeId, HalfEdge)>,
}

const UNSET: HalfEdgeId = usize::MAX;

impl GeneTree {
    pub fn from_topology(root: &TopoNode) -> Result<Self> {
        let mut tree = GeneTree { half_edges: Vec::new() };
        let mut children: Vec<&TopoNode> = root.children.iter().collect();
        // Unary chains at the top carry no information.
        while children.len() == 1 {
            children = children[0].children.iter().collect();
        }
        match children.len() {
            0 | 1 => return Err(TreeError::TooSmall.into()),
            2 => {
                let e1 = tree.build(children[0])?;
                let e2 = tree.build(children[1])?;
                let length = children[0].length + children[1].length;
                tree.join(e1, e2, length);
            }
            3 => {
                let hub = tree.add_node_cycle();
                for (slot, child) in children.iter().enumerate() {
                    let down = tree.build(child)?;
                    let up = hub[slot];
                    tree.join(up, down, child.length);
                }
            }
            n => {
                return Err(TreeError::NotBinary(format!("gene tree root of degree {}", n)).into())
            }
        }
        if tree.leaves().count() < 2 {
            return Err(TreeError::TooSmall.into());
        }
        Ok(tree)
    }

    /// Random binary topology over the given leaf labels, drawn from the
    /// global generator.
    pub fn random(labels: &[String]) -> Result<Self> {
        if labels.len() < 3 {
            return Err(TreeError::TooSmall.into());
        }
        let mut parts: Vec<TopoNode> = labels.iter().map(|l| TopoNode::leaf(l)).collect();
        while parts.len() > 3 {
            let i = rng::gen_range(parts.len());
            let a = parts.swap_remove(i);
            let j = rng::gen_range(parts.len());
            let b = parts.swap_remove(j);
            parts.push(TopoNode::join(vec![a, b]));
        }
        Self::from_topology(&TopoNode::join(parts))
    }

    fn add_half_edge(&mut self, label: Option<String>) -> HalfEdgeId {
        self.half_edges.push(HalfEdge { back: UNSET, next: None, label, length: 1.0 });
        self.half_edges.len() - 1
    }

    fn add_node_cycle(&mut self) -> [HalfEdgeId; 3] {
        let a = self.add_half_edge(None);
        let b = self.add_half_edge(None);
        let c = self.add_half_edge(None);
        self.half_edges[a].next = Some(b);
        self.half_edges[b].next = Some(c);
        self.half_edges[c].next = Some(a);
        [a, b, c]
    }

    fn build(&mut self, node: &TopoNode) -> Result<HalfEdgeId> {
        let mut node = node;
        while node.children.len() == 1 {
            node = &node.children[0];
        }
        match node.children.len() {
            0 => {
                let label = node
                    .label
                    .clone()
                    .ok_or(TreeError::UnlabelledLeaf(self.half_edges.len()))?;
                Ok(self.add_half_edge(Some(label)))
            }
            2 => {
                let [up, towards_left, towards_right] = self.add_node_cycle();
                let left = self.build(&node.children[0])?;
                let right = self.build(&node.children[1])?;
                self.join(towards_left, left, node.children[0].length);
                self.join(towards_right, right, node.children[1].length);
                Ok(up)
            }
            n => Err(TreeError::NotBinary(format!("gene node of degree {}", n + 1)).into()),
        }
    }

    fn join(&mut self, a: HalfEdgeId, b: HalfEdgeId, length: f64) {
        self.half_edges[a].back = b;
        self.half_edges[b].back = a;
        self.half_edges[a].length = length;
        self.half_edges[b].length = length;
    }

    pub fn half_edge_count(&self) -> usize {
        self.half_edges.len()
    }

    pub fn max_half_edge(&self) -> HalfEdgeId {
        self.half_edges.len() - 1
    }

    pub fn back(&self, u: HalfEdgeId) -> HalfEdgeId {
        self.half_edges[u].back
    }

    pub fn next(&self, u: HalfEdgeId) -> Option<HalfEdgeId> {
        self.half_edges[u].next
    }

    pub fn is_leaf(&self, u: HalfEdgeId) -> bool {
        self.half_edges[u].next.is_none()
    }

    pub fn label(&self, u: HalfEdgeId) -> Option<&str> {
        self.half_edges[u].label.as_deref()
    }

    pub fn length(&self, u: HalfEdgeId) -> f64 {
        self.half_edges[u].length
    }

    pub fn set_length(&mut self, u: HalfEdgeId, length: f64) {
        let b = self.half_edges[u].back;
        self.half_edges[u].length = length;
        self.half_edges[b].length = length;
    }

    /// Children of `u` in the rooted view induced by the branch `(u, back(u))`.
    pub fn children(&self, u: HalfEdgeId) -> Option<(HalfEdgeId, HalfEdgeId)> {
        let n1 = self.half_edges[u].next?;
        let n2 = self.half_edges[n1].next?;
        Some((self.half_edges[n1].back, self.half_edges[n2].back))
    }

    /// Half-edges whose subtree directly contains `u`'s subtree.
    pub fn parents(&self, u: HalfEdgeId) -> Vec<HalfEdgeId> {
        let b = self.half_edges[u].back;
        match self.half_edges[b].next {
            None => vec![],
            Some(n1) => {
                let n2 = self.half_edges[n1].next.expect("internal node has a 3-cycle");
                vec![n1, n2]
            }
        }
    }

    pub fn leaves(&self) -> impl Iterator<Item = HalfEdgeId> + '_ {
        (0..self.half_edges.len()).filter(move |&u| self.is_leaf(u))
    }

    pub fn leaf_labels(&self) -> Vec<String> {
        self.leaves().filter_map(|u| self.half_edges[u].label.clone()).collect()
    }

    /// One canonical half-edge per branch.
    pub fn branches(&self) -> impl Iterator<Item = HalfEdgeId> + '_ {
        (0..self.half_edges.len()).filter(move |&u| u < self.half_edges[u].back)
    }

    pub fn canonical(&self, u: HalfEdgeId) -> HalfEdgeId {
        u.min(self.half_edges[u].back)
    }

    /// Internal half-edges, the valid prune handles for SPR.
    pub fn prune_candidates(&self) -> Vec<HalfEdgeId> {
        (0..self.half_edges.len()).filter(|&u| !self.is_leaf(u)).collect()
    }

    /// The branches adjacent to the branch `(u, back(u))`.
    pub fn neighbour_branches(&self, u: HalfEdgeId) -> Vec<HalfEdgeId> {
        let mut out = vec![self.canonical(u)];
        for side in [u, self.half_edges[u].back] {
            if let Some(n1) = self.half_edges[side].next {
                let n2 = self.half_edges[n1].next.expect("internal node has a 3-cycle");
                out.push(self.canonical(n1));
                out.push(self.canonical(n2));
            }
        }
        out.sort_unstable();
        out.dedup();
        out
    }

    /// A move regrafting next to itself yields an isomorphic tree.
    pub fn spr_yields_same_tree(&self, p: HalfEdgeId, r: HalfEdgeId) -> bool {
        let pn = self.half_edges[p].next.expect("prune handle must be internal");
        let pnn = self.half_edges[pn].next.expect("internal node has a 3-cycle");
        r == p
            || r == pn
            || r == pnn
            || r == self.half_edges[p].back
            || r == self.half_edges[pn].back
            || r == self.half_edges[pnn].back
    }

    /// Detach `p`'s node (keeping the subtree at `back(p)` attached to it),
    /// heal the hole, and splice the node into the branch `(r, back(r))`.
    pub fn apply_spr(&mut self, p: HalfEdgeId, r: HalfEdgeId) -> GeneRollback {
        let pn = self.half_edges[p].next.expect("prune handle must be internal");
        let pnn = self.half_edges[pn].next.expect("internal node has a 3-cycle");
        let b1 = self.half_edges[pn].back;
        let b2 = self.half_edges[pnn].back;
        let rb = self.half_edges[r].back;
        debug_assert!(!self.spr_yields_same_tree(p, r));

        let rollback = GeneRollback {
            saved: [pn, pnn, b1, b2, r, rb]
                .iter()
                .map(|&i| (i, self.half_edges[i].clone()))
                .collect(),
        };

        let healed = self.half_edges[b1].length + self.half_edges[b2].length;
        let split = self.half_edges[r].length / 2.0;
        self.join(b1, b2, healed);
        self.join(pn, r, split);
        self.join(pnn, rb, split);
        rollback
    }

    pub fn rollback(&mut self, rollback: GeneRollback) {
        for (i, half_edge) in rollback.saved {
            self.half_edges[i] = half_edge;
        }
    }

    fn leaf_hash(&self, u: HalfEdgeId) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.half_edges[u].label.hash(&mut hasher);
        hasher.finish()
    }

    fn hash_rec(&self, u: HalfEdgeId, depth: u64) -> u64 {
        match self.children(u) {
            None => self.leaf_hash(u),
            Some((left, right)) => {
                let h1 = self.hash_rec(left, depth + 1);
                let h2 = self.hash_rec(right, depth + 1);
                let mut hasher = DefaultHasher::new();
                (h1.min(h2).wrapping_mul(depth.max(1))).wrapping_add(h1.max(h2)).hash(&mut hasher);
                hasher.finish()
            }
        }
    }

    fn min_hash_leaf(&self) -> HalfEdgeId {
        self.leaves()
            .min_by_key(|&u| self.leaf_hash(u))
            .expect("gene tree has leaves")
    }

    /// Orientation-independent structural hash.
    pub fn unrooted_hash(&self) -> u64 {
        let anchor = self.min_hash_leaf();
        (self.hash_rec(anchor, 1).wrapping_add(self.hash_rec(self.half_edges[anchor].back, 1)))
            % 100000
    }

    /// Smallest half-edge of `u`'s node cycle; identifies the node.
    fn node_anchor(&self, u: HalfEdgeId) -> HalfEdgeId {
        match self.half_edges[u].next {
            None => u,
            Some(n1) => {
                let n2 = self.half_edges[n1].next.expect("internal node has a 3-cycle");
                u.min(n1).min(n2)
            }
        }
    }

    /// Topological distances (in edges) between every ordered pair of
    /// leaves.
    pub fn leaf_distances(&self) -> Vec<(String, String, usize)> {
        let mut adjacency: std::collections::HashMap<HalfEdgeId, Vec<HalfEdgeId>> =
            Default::default();
        for u in self.branches() {
            let a = self.node_anchor(u);
            let b = self.node_anchor(self.half_edges[u].back);
            adjacency.entry(a).or_default().push(b);
            adjacency.entry(b).or_default().push(a);
        }
        let mut distances = Vec::new();
        for start in self.leaves() {
            let mut seen: std::collections::HashMap<HalfEdgeId, usize> = Default::default();
            seen.insert(start, 0);
            let mut frontier = vec![start];
            while let Some(node) = frontier.pop() {
                let depth = seen[&node];
                for &next in adjacency.get(&node).map(|v| v.as_slice()).unwrap_or(&[]) {
                    if !seen.contains_key(&next) {
                        seen.insert(next, depth + 1);
                        frontier.push(next);
                    }
                }
            }
            let from = self.half_edges[start].label.clone().unwrap_or_default();
            for other in self.leaves() {
                if other == start {
                    continue;
                }
                if let Some(&depth) = seen.get(&other) {
                    let to = self.half_edges[other].label.clone().unwrap_or_default();
                    distances.push((from.clone(), to, depth));
                }
            }
        }
        distances
    }

    fn write_newick_rec(&self, u: HalfEdgeId, out: &mut String) {
        match self.children(u) {
            None => out.push_str(self.half_edges[u].label.as_deref().unwrap_or("")),
            Some((left, right)) => {
                out.push('(');
                self.write_newick_rec(left, out);
                out.push(',');
                self.write_newick_rec(right, out);
                out.push(')');
            }
        }
        out.push_str(&format!(":{}", self.half_edges[u].length));
    }

    /// Newick serialisation rooted on the branch `(u, back(u))`.
    pub fn to_newick(&self, root: HalfEdgeId) -> String {
        let mut out = String::from("(");
        self.write_newick_rec(root, &mut out);
        out.push(',');
        self.write_newick_rec(self.half_edges[root].back, &mut out);
        out.push_str(");");
        out
    }
}
