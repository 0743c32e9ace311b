//! Rooted species tree stored as a flat arena.
//!
//! Node indices are dense, assigned in post-order at construction, and
//! remain stable across topological moves; the reconciliation CLVs address
//! species by these indices. Moves return a snapshot-based rollback that
//! restores the touched records bit-for-bit.

use crate::errors::TreeError;
use anyhow::Result;
use identity_hash::IntSet;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};

pub type SpeciesNodeId = usize;

#[derive(Clone, Debug, PartialEq)]
pub struct SpeciesNode {
    pub parent: Option<SpeciesNodeId>,
    pub children: Option<(SpeciesNodeId, SpeciesNodeId)>,
    pub label: String,
    pub length: f64,
}

#[derive(Clone, Debug)]
pub struct SpeciesTree {
    nodes: Vec<SpeciesNode>,
    root: SpeciesNodeId,
}

/// Snapshot of the records touched by a move.
#[derive(Clone, Debug)]
pub struct SpeciesRollback {
    saved: Vec<(SpeciesNodeId, SpeciesNode)>,
    root: SpeciesNodeId,
}

impl SpeciesTree {
    /// Build the arena from a rooted topology; indices are assigned in
    /// post-order and unlabelled internal nodes become `species_<n>`.
    pub fn from_topology(topo: &crate::trees::gene_tree::TopoNode) -> Result<Self> {
        fn build(
            topo: &crate::trees::gene_tree::TopoNode,
            nodes: &mut Vec<SpeciesNode>,
        ) -> Result<SpeciesNodeId> {
            let mut topo = topo;
            while topo.children.len() == 1 {
                topo = &topo.children[0];
            }
            let children = match topo.children.len() {
                0 => None,
                2 => {
                    let f = build(&topo.children[0], nodes)?;
                    let g = build(&topo.children[1], nodes)?;
                    Some((f, g))
                }
                n => {
                    return Err(TreeError::NotBinary(format!(
                        "{} children",
                        n
                    ))
                    .into())
                }
            };
            let id = nodes.len();
            nodes.push(SpeciesNode {
                parent: None,
                children,
                label: topo.label.clone().unwrap_or_default(),
                length: topo.length,
            });
            if let Some((f, g)) = children {
                nodes[f].parent = Some(id);
                nodes[g].parent = Some(id);
            }
            Ok(id)
        }

        let mut nodes = Vec::new();
        let root = build(topo, &mut nodes)?;
        for (i, node) in nodes.iter_mut().enumerate() {
            if node.children.is_some() && node.label.is_empty() {
                node.label = format!("species_{}", i);
            }
        }
        SpeciesTree::from_parts(nodes, root)
    }

    pub fn from_parts(nodes: Vec<SpeciesNode>, root: SpeciesNodeId) -> Result<Self> {
        let tree = SpeciesTree { nodes, root };
        for (i, node) in tree.nodes.iter().enumerate() {
            if node.children.is_none() && node.label.is_empty() {
                return Err(TreeError::UnlabelledLeaf(i).into());
            }
        }
        Ok(tree)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn root(&self) -> SpeciesNodeId {
        self.root
    }

    pub fn node(&self, e: SpeciesNodeId) -> &SpeciesNode {
        &self.nodes[e]
    }

    pub fn is_leaf(&self, e: SpeciesNodeId) -> bool {
        self.nodes[e].children.is_none()
    }

    pub fn children(&self, e: SpeciesNodeId) -> Option<(SpeciesNodeId, SpeciesNodeId)> {
        self.nodes[e].children
    }

    pub fn parent(&self, e: SpeciesNodeId) -> Option<SpeciesNodeId> {
        self.nodes[e].parent
    }

    pub fn label(&self, e: SpeciesNodeId) -> &str {
        &self.nodes[e].label
    }

    pub fn leaf_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.children.is_none()).count()
    }

    pub fn leaves(&self) -> impl Iterator<Item = SpeciesNodeId> + '_ {
        (0..self.nodes.len()).filter(move |&e| self.is_leaf(e))
    }

    pub fn leaf_labels(&self) -> HashSet<String> {
        self.leaves().map(|e| self.nodes[e].label.clone()).collect()
    }

    pub fn leaf_id(&self, label: &str) -> Option<SpeciesNodeId> {
        self.leaves().find(|&e| self.nodes[e].label == label)
    }

    pub fn node_id(&self, label: &str) -> Option<SpeciesNodeId> {
        (0..self.nodes.len()).find(|&e| self.nodes[e].label == label)
    }

    pub fn post_order(&self) -> Vec<SpeciesNodeId> {
        let mut order = Vec::with_capacity(self.nodes.len());
        self.fill_post_order(self.root, &mut order);
        order
    }

    fn fill_post_order(&self, e: SpeciesNodeId, order: &mut Vec<SpeciesNodeId>) {
        if let Some((f, g)) = self.nodes[e].children {
            self.fill_post_order(f, order);
            self.fill_post_order(g, order);
        }
        order.push(e);
    }

    /// The node and all its ancestors up to the root.
    pub fn ancestors(&self, e: SpeciesNodeId) -> IntSet<SpeciesNodeId> {
        let mut set = IntSet::default();
        let mut cursor = Some(e);
        while let Some(n) = cursor {
            set.insert(n);
            cursor = self.nodes[n].parent;
        }
        set
    }

    pub fn subtree(&self, e: SpeciesNodeId) -> IntSet<SpeciesNodeId> {
        let mut set = IntSet::default();
        let mut stack = vec![e];
        while let Some(n) = stack.pop() {
            set.insert(n);
            if let Some((f, g)) = self.nodes[n].children {
                stack.push(f);
                stack.push(g);
            }
        }
        set
    }

    fn hash_rec(&self, e: SpeciesNodeId, depth: u64) -> u64 {
        match self.nodes[e].children {
            None => {
                let mut hasher = DefaultHasher::new();
                self.nodes[e].label.hash(&mut hasher);
                hasher.finish()
            }
            Some((f, g)) => {
                let h1 = self.hash_rec(f, depth + 1);
                let h2 = self.hash_rec(g, depth + 1);
                let mut hasher = DefaultHasher::new();
                (h1.min(h2).wrapping_mul(depth.max(1))).wrapping_add(h1.max(h2)).hash(&mut hasher);
                hasher.finish()
            }
        }
    }

    pub fn hash(&self) -> u64 {
        self.hash_rec(self.root, 1) % 100000
    }

    fn snapshot(&self, ids: &[SpeciesNodeId]) -> SpeciesRollback {
        SpeciesRollback {
            saved: ids.iter().map(|&i| (i, self.nodes[i].clone())).collect(),
            root: self.root,
        }
    }

    pub fn rollback(&mut self, rollback: SpeciesRollback) {
        for (i, node) in rollback.saved {
            self.nodes[i] = node;
        }
        self.root = rollback.root;
    }

    fn replace_child(&mut self, parent: SpeciesNodeId, old: SpeciesNodeId, new: SpeciesNodeId) {
        let (f, g) = self.nodes[parent].children.expect("internal node expected");
        self.nodes[parent].children = if f == old {
            Some((new, g))
        } else {
            debug_assert_eq!(g, old);
            Some((f, new))
        };
    }

    /// Subtrees that may be pruned: anything below the root's children.
    pub fn possible_prunes(&self) -> Vec<SpeciesNodeId> {
        (0..self.nodes.len())
            .filter(|&e| {
                self.nodes[e].parent.is_some()
                    && self.nodes[e].parent != Some(self.root)
            })
            .collect()
    }

    /// Regraft edges (identified by their lower node) within `radius` steps
    /// of the prune attachment point.
    pub fn possible_regrafts(&self, prune: SpeciesNodeId, radius: usize) -> Vec<SpeciesNodeId> {
        let forbidden = self.subtree(prune);
        let parent = self.nodes[prune].parent.expect("prune must have a parent");
        let sibling = self.sibling(prune);
        let mut seen = IntSet::default();
        seen.insert(parent);
        seen.insert(prune);
        let mut frontier = vec![sibling];
        if let Some(grandparent) = self.nodes[parent].parent {
            frontier.push(grandparent);
        }
        let mut regrafts = Vec::new();
        for _ in 0..radius {
            let mut next = Vec::new();
            for e in frontier {
                if !seen.insert(e) {
                    continue;
                }
                if !forbidden.contains(&e) && self.nodes[e].parent.is_some() && e != sibling {
                    regrafts.push(e);
                }
                if let Some((f, g)) = self.nodes[e].children {
                    next.push(f);
                    next.push(g);
                }
                if let Some(p) = self.nodes[e].parent {
                    next.push(p);
                }
            }
            frontier = next;
        }
        regrafts.retain(|e| !forbidden.contains(e));
        regrafts
    }

    pub fn sibling(&self, e: SpeciesNodeId) -> SpeciesNodeId {
        let parent = self.nodes[e].parent.expect("root has no sibling");
        let (f, g) = self.nodes[parent].children.expect("parent is internal");
        if f == e {
            g
        } else {
            f
        }
    }

    /// Prune `prune` (with its parent) and reinsert the parent on the edge
    /// above `regraft`. Returns the rollback and the set of species nodes
    /// whose subtree changed.
    pub fn apply_spr(
        &mut self,
        prune: SpeciesNodeId,
        regraft: SpeciesNodeId,
    ) -> (SpeciesRollback, IntSet<SpeciesNodeId>) {
        let parent = self.nodes[prune].parent.expect("prune must have a parent");
        let grandparent = self.nodes[parent].parent.expect("prune parent must not be the root");
        let sibling = self.sibling(prune);
        let dest_parent = self.nodes[regraft].parent.expect("cannot regraft above the root");

        let rollback =
            self.snapshot(&[prune, parent, grandparent, sibling, regraft, dest_parent]);

        // Detach: the sibling takes the parent's place.
        self.replace_child(grandparent, parent, sibling);
        self.nodes[sibling].parent = Some(grandparent);

        // Reinsert the parent above the regraft point.
        self.replace_child(dest_parent, regraft, parent);
        self.nodes[parent].parent = Some(dest_parent);
        self.nodes[parent].children = Some((prune, regraft));
        self.nodes[regraft].parent = Some(parent);

        let mut affected = self.ancestors(sibling);
        for e in self.ancestors(parent) {
            affected.insert(e);
        }
        (rollback, affected)
    }

    /// The up-to-four root neighbourhoods reachable in one re-rooting step:
    /// direction 0/1 roots into the left child's children, 2/3 into the
    /// right child's.
    pub fn can_change_root(&self, direction: usize) -> bool {
        let (a, b) = self.nodes[self.root].children.expect("root is internal");
        let x = if direction < 2 { a } else { b };
        self.nodes[x].children.is_some()
    }

    pub fn change_root(&mut self, direction: usize) -> SpeciesRollback {
        let (a, b) = self.nodes[self.root].children.expect("root is internal");
        let (x, other) = if direction < 2 { (a, b) } else { (b, a) };
        let (x0, x1) = self.nodes[x].children.expect("cannot root below a leaf");
        let (xk, xo) = if direction % 2 == 0 { (x0, x1) } else { (x1, x0) };

        let rollback = self.snapshot(&[self.root, x, xk, xo, other]);

        self.nodes[self.root].children =
            if direction < 2 { Some((xk, x)) } else { Some((x, xk)) };
        self.nodes[xk].parent = Some(self.root);
        self.nodes[x].children = if direction % 2 == 0 {
            Some((other, xo))
        } else {
            Some((xo, other))
        };
        self.nodes[other].parent = Some(x);
        rollback
    }

    /// Nodes whose subtree changed in the last `change_root`: the old and
    /// new root children and the root itself.
    pub fn root_change_affected(&self) -> IntSet<SpeciesNodeId> {
        let mut affected = IntSet::default();
        let (a, b) = self.nodes[self.root].children.expect("root is internal");
        affected.insert(self.root);
        affected.insert(a);
        affected.insert(b);
        for e in [a, b] {
            if let Some((f, g)) = self.nodes[e].children {
                affected.insert(f);
                affected.insert(g);
            }
        }
        affected
    }

    fn write_newick_rec(&self, e: SpeciesNodeId, out: &mut String) {
        if let Some((f, g)) = self.nodes[e].children {
            out.push('(');
            self.write_newick_rec(f, out);
            out.push(',');
            self.write_newick_rec(g, out);
            out.push(')');
        }
        out.push_str(&self.nodes[e].label);
        if self.nodes[e].parent.is_some() {
            out.push_str(&format!(":{}", self.nodes[e].length));
        }
    }

    pub fn to_newick(&self) -> String {
        let mut out = String::new();
        self.write_newick_rec(self.root, &mut out);
        out.push(';');
        out
    }
}
