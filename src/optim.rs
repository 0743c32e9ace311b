//! Derivative-free optimisation of the DTL(+I) rates.
//!
//! Three interchangeable searches over the same objective (the cross-rank
//! sum of per-family reconciliation log-likelihoods): a coarse-to-fine grid
//! scan, a Nelder-Mead simplex, and a coordinate-descent probe. On
//! well-behaved inputs they settle on the same fixed point.

use crate::maths::Parameters;
use anyhow::Result;
use log::*;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecOpt {
    Grid,
    Simplex,
    Gradient,
}

impl RecOpt {
    pub fn name(&self) -> &'static str {
        match self {
            RecOpt::Grid => "grid",
            RecOpt::Simplex => "simplex",
            RecOpt::Gradient => "gradient",
        }
    }
}

pub type Objective<'a> = dyn FnMut(&Parameters) -> Result<f64> + 'a;

const RELATIVE_TOLERANCE: f64 = 1e-3;
const RATE_FLOOR: f64 = 1e-10;

fn evaluate(objective: &mut Objective, point: &mut Parameters) -> Result<f64> {
    point.constrain();
    let score = objective(point)?;
    point.set_score(score);
    Ok(score)
}

/// Coarse scan of a shrinking window around the running best cell.
fn grid_search(objective: &mut Objective, start: &Parameters) -> Result<Parameters> {
    let dims = start.dimensions();
    let steps: usize = match dims {
        0..=2 => 10,
        3 => 6,
        _ => 5,
    };
    let mut lows = vec![0.0; dims];
    let mut highs = vec![10.0f64; dims];
    let mut best = start.clone();
    let mut best_ll = evaluate(objective, &mut best)?;

    for _ in 0..40 {
        let previous_ll = best_ll;
        let cells: usize = steps.pow(dims as u32);
        for cell in 0..cells {
            let mut point = Parameters::new(dims);
            let mut remainder = cell;
            for d in 0..dims {
                let i = remainder % steps;
                remainder /= steps;
                point[d] = lows[d] + (highs[d] - lows[d]) * i as f64 / steps as f64;
            }
            let ll = evaluate(objective, &mut point)?;
            if ll > best_ll {
                best_ll = ll;
                best = point;
            }
        }
        let mut width = 0.0f64;
        for d in 0..dims {
            let offset = 2.0 * (highs[d] - lows[d]) / steps as f64;
            lows[d] = (best[d] - offset).max(0.0);
            highs[d] = best[d] + offset;
            width = width.max(highs[d] - lows[d]);
        }
        if (best_ll - previous_ll).abs() < RELATIVE_TOLERANCE && width < 1e-3 {
            break;
        }
    }
    best.set_score(best_ll);
    Ok(best)
}

/// Nelder-Mead downhill simplex (maximising).
fn simplex_search(objective: &mut Objective, start: &Parameters) -> Result<Parameters> {
    let dims = start.dimensions();
    let mut simplex: Vec<Parameters> = Vec::with_capacity(dims + 1);
    let mut base = start.clone();
    evaluate(objective, &mut base)?;
    simplex.push(base);
    for d in 0..dims {
        let mut vertex = start.clone();
        vertex[d] = (vertex[d] + 0.5).max(0.1);
        evaluate(objective, &mut vertex)?;
        simplex.push(vertex);
    }

    for _ in 0..600 {
        simplex.sort_by(|a, b| b.score().partial_cmp(&a.score()).unwrap());
        let spread = simplex[0].score() - simplex[dims].score();
        let diameter = simplex[0].distance_to(&simplex[dims]);
        if spread.abs() < 1e-7 || diameter < 1e-7 {
            break;
        }
        let centroid = Parameters::centroid(&simplex[..dims]);
        let worst = simplex[dims].clone();

        let mut reflected = centroid.scaled_towards(&worst, -1.0);
        let reflected_ll = evaluate(objective, &mut reflected)?;
        if reflected_ll > simplex[0].score() {
            let mut expanded = centroid.scaled_towards(&worst, -2.0);
            let expanded_ll = evaluate(objective, &mut expanded)?;
            simplex[dims] = if expanded_ll > reflected_ll { expanded } else { reflected };
            continue;
        }
        if reflected_ll > simplex[dims - 1].score() {
            simplex[dims] = reflected;
            continue;
        }
        let mut contracted = centroid.scaled_towards(&worst, 0.5);
        let contracted_ll = evaluate(objective, &mut contracted)?;
        if contracted_ll > simplex[dims].score() {
            simplex[dims] = contracted;
            continue;
        }
        // Shrink towards the best vertex.
        let best = simplex[0].clone();
        for vertex in simplex.iter_mut().skip(1) {
            *vertex = best.scaled_towards(vertex, 0.5);
            evaluate(objective, vertex)?;
        }
    }
    simplex.sort_by(|a, b| b.score().partial_cmp(&a.score()).unwrap());
    Ok(simplex.swap_remove(0))
}

/// Coordinate descent with a numerical slope probe and a doubling/halving
/// line search.
fn gradient_search(objective: &mut Objective, start: &Parameters) -> Result<Parameters> {
    let dims = start.dimensions();
    let mut best = start.clone();
    let mut best_ll = evaluate(objective, &mut best)?;

    for _ in 0..100 {
        let round_start_ll = best_ll;
        for d in 0..dims {
            let h = 1e-6 * best[d].abs().max(1.0);
            let mut probe = best.clone();
            probe[d] = best[d] + h;
            let up = evaluate(objective, &mut probe)?;
            probe[d] = (best[d] - h).max(RATE_FLOOR);
            let down = evaluate(objective, &mut probe)?;
            let direction = if up >= down { 1.0 } else { -1.0 };
            let mut step = 0.1 * best[d].abs().max(0.1);
            let mut moved = false;
            loop {
                let mut candidate = best.clone();
                candidate[d] = (best[d] + direction * step).max(RATE_FLOOR);
                let ll = evaluate(objective, &mut candidate)?;
                if ll > best_ll {
                    best_ll = ll;
                    best = candidate;
                    moved = true;
                    step *= 2.0;
                } else if moved {
                    break;
                } else {
                    step /= 2.0;
                    if step <= 1e-9 {
                        break;
                    }
                }
            }
        }
        if (best_ll - round_start_ll).abs() < 1e-6 {
            break;
        }
    }
    best.set_score(best_ll);
    Ok(best)
}

/// Optimise one global rate vector (shared by every species branch).
pub fn optimize_parameters_global(
    objective: &mut Objective,
    start: &Parameters,
    method: RecOpt,
) -> Result<Parameters> {
    let best = match method {
        RecOpt::Grid => grid_search(objective, start)?,
        RecOpt::Simplex => simplex_search(objective, start)?,
        RecOpt::Gradient => gradient_search(objective, start)?,
    };
    debug!("optimized rates ({}): {}", method.name(), best);
    Ok(best)
}

/// Per-species refinement: each species branch is an independent
/// low-dimensional problem seeded from the global optimum (or from the
/// per-species event frequencies of a preceding best reconciliation).
pub fn optimize_parameters_per_species(
    objective: &mut Objective,
    global: &Parameters,
    species_count: usize,
    free_parameters: usize,
    seeds: Option<&[Vec<f64>]>,
) -> Result<Parameters> {
    let mut full = Parameters::new(species_count * free_parameters);
    for e in 0..species_count {
        for j in 0..free_parameters {
            full[e * free_parameters + j] = match seeds {
                Some(seeds) => seeds[e][j],
                None => global[j],
            };
        }
    }
    let mut full_ll = evaluate(objective, &mut full)?;

    for e in 0..species_count {
        let offset = e * free_parameters;
        let mut local_objective = |local: &Parameters| -> Result<f64> {
            let mut candidate = full.clone();
            for j in 0..free_parameters {
                candidate[offset + j] = local[j];
            }
            objective(&candidate)
        };
        let start = Parameters::of(
            &(0..free_parameters).map(|j| full[offset + j]).collect::<Vec<_>>(),
        );
        let refined = simplex_search(&mut local_objective, &start)?;
        if refined.score() > full_ll {
            full_ll = refined.score();
            for j in 0..free_parameters {
                full[offset + j] = refined[j];
            }
        }
    }
    full.set_score(full_ll);
    Ok(full)
}
