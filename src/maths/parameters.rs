//! Flat parameter vectors for the rate optimisers.

use std::fmt;
use std::ops::{Index, IndexMut};

/// A point in rate space, together with the log-likelihood it scored.
#[derive(Clone, Debug)]
pub struct Parameters {
    values: Vec<f64>,
    score: f64,
}

impl Parameters {
    pub fn new(dimensions: usize) -> Self {
        Parameters { values: vec![0.0; dimensions], score: f64::NEG_INFINITY }
    }

    pub fn of(values: &[f64]) -> Self {
        Parameters { values: values.to_vec(), score: f64::NEG_INFINITY }
    }

    pub fn dimensions(&self) -> usize {
        self.values.len()
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn score(&self) -> f64 {
        self.score
    }

    pub fn set_score(&mut self, score: f64) {
        self.score = score;
    }

    /// Clamp every coordinate to the feasible (non-negative) orthant.
    pub fn constrain(&mut self) {
        for v in self.values.iter_mut() {
            *v = v.max(1e-10);
        }
    }

    pub fn scaled_towards(&self, other: &Parameters, factor: f64) -> Parameters {
        let values = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| a + factor * (b - a))
            .collect();
        Parameters { values, score: f64::NEG_INFINITY }
    }

    pub fn centroid(points: &[Parameters]) -> Parameters {
        let n = points.len() as f64;
        let dim = points[0].dimensions();
        let mut values = vec![0.0; dim];
        for p in points {
            for (acc, v) in values.iter_mut().zip(p.values.iter()) {
                *acc += v / n;
            }
        }
        Parameters { values, score: f64::NEG_INFINITY }
    }

    pub fn distance_to(&self, other: &Parameters) -> f64 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f64>()
            .sqrt()
    }
}

impl Index<usize> for Parameters {
    type Output = f64;
    fn index(&self, i: usize) -> &f64 {
        &self.values[i]
    }
}

impl IndexMut<usize> for Parameters {
    fn index_mut(&mut self, i: usize) -> &mut f64 {
        &mut self.values[i]
    }
}

impl fmt::Display for Parameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, v) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{:.6}", v)?;
        }
        write!(f, ") score={:.6}", self.score)
    }
}
