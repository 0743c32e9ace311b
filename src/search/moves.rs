//! Gene-tree SPR move description.

use crate::trees::{GeneTree, HalfEdgeId};

#[derive(Clone, Debug)]
pub struct SprMove {
    pub prune: HalfEdgeId,
    pub regraft: HalfEdgeId,
    /// Half-edges traversed between the prune and the regraft point.
    pub path: Vec<HalfEdgeId>,
}

impl SprMove {
    pub fn new(prune: HalfEdgeId, regraft: HalfEdgeId, path: Vec<HalfEdgeId>) -> Self {
        SprMove { prune, regraft, path }
    }

    /// Half-edges whose CLV can change under this move, taken on the
    /// pre-move tree (before ancestor closure). The same set is
    /// invalidated again when the move is rolled back.
    pub fn touched_half_edges(&self, gene: &GeneTree) -> Vec<HalfEdgeId> {
        let p = self.prune;
        let pn = gene.next(p).expect("prune handle is internal");
        let pnn = gene.next(pn).expect("internal node has a 3-cycle");
        let mut touched = vec![
            p,
            pn,
            pnn,
            gene.back(p),
            gene.back(pn),
            gene.back(pnn),
            self.regraft,
            gene.back(self.regraft),
        ];
        touched.extend(self.path.iter().copied());
        touched.sort_unstable();
        touched.dedup();
        touched
    }
}

impl std::fmt::Display for SprMove {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SPR({} -> {}, radius {})", self.prune, self.regraft, self.path.len())
    }
}
