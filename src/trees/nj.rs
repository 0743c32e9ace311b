//! Neighbour-joining starting species trees.

use crate::errors::TreeError;
use crate::trees::gene_tree::TopoNode;
use crate::trees::species_tree::SpeciesTree;
use anyhow::Result;
use itertools::Itertools;
use ordered_float::NotNan;

/// Classic NJ over a full distance matrix; the final join becomes the root.
pub fn nj_tree(matrix: &[Vec<f64>], labels: &[String]) -> Result<SpeciesTree> {
    if labels.len() < 2 {
        return Err(TreeError::TooSmall.into());
    }
    let mut parts: Vec<Option<TopoNode>> = labels.iter().map(|l| Some(TopoNode::leaf(l))).collect();
    let mut distances: Vec<Vec<f64>> = matrix.to_vec();
    let mut active: Vec<usize> = (0..labels.len()).collect();

    while active.len() > 2 {
        let sum_d = |i: usize| -> f64 { active.iter().map(|&k| distances[i][k]).sum() };

        let q = |&(&i, &j): &(&usize, &usize)| -> NotNan<f64> {
            NotNan::new((active.len() - 2) as f64 * distances[i][j] - sum_d(i) - sum_d(j)).unwrap()
        };

        let (&i, &j) = active
            .iter()
            .cartesian_product(active.iter())
            .filter(|&(&i, &j)| i != j)
            .min_by_key(q)
            .unwrap();
        let (i, j) = (i.min(j), i.max(j));

        let di = distances[i][j] / 2. + (sum_d(i) - sum_d(j)) / (2. * (active.len() as f64 - 2.));
        let dj = distances[i][j] - di;

        active.remove(active.iter().position(|&x| x == j).unwrap());

        for k in active.clone() {
            if k != i {
                let dk = (distances[i][k] + distances[j][k] - distances[i][j]) / 2.;
                distances[i][k] = dk;
                distances[k][i] = dk;
            }
        }
        let mut a = parts[i].take().unwrap();
        let mut b = parts[j].take().unwrap();
        a.length = di.max(0.0);
        b.length = dj.max(0.0);
        parts[i] = Some(TopoNode::join(vec![a, b]));
    }

    let &[i, j] = &active[..] else { unreachable!() };
    let d = distances[i][j] / 2.;
    let mut a = parts[i].take().unwrap();
    let mut b = parts[j].take().unwrap();
    a.length = d.max(0.0);
    b.length = d.max(0.0);
    SpeciesTree::from_topology(&TopoNode::join(vec![a, b]))
}
