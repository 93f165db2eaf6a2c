//! Default psychometric fitter.
//!
//! Model: `p(x) = g1 + (1 - g1 - g2) * (erf((x - bias) / slope) + 1) / 2`,
//! fit by maximising the binomial log-likelihood over a grid that is refined
//! around the best point each round.

use statrs::function::erf::erf;

use crate::stage::{PsychometricFit, PsychometricParams};

const EPS: f64 = 1e-9;

/// Search bounds as `(low, high)` for bias, slope, gamma1, gamma2.
const BOUNDS: [(f64, f64); 4] = [(0.0, 100.0), (1.0, 60.0), (0.0, 0.5), (0.0, 0.5)];

pub fn erf_psycho_2gammas(params: &PsychometricParams, x: f64) -> f64 {
    let core = (erf((x - params.bias) / params.slope) + 1.0) / 2.0;
    params.gamma1 + (1.0 - params.gamma1 - params.gamma2) * core
}

#[derive(Debug, Clone, Copy)]
pub struct GridFit {
    pub rounds: usize,
    /// Grid points per parameter per round.
    pub points: usize,
}

impl Default for GridFit {
    fn default() -> Self {
        Self { rounds: 8, points: 7 }
    }
}

fn log_likelihood(params: &PsychometricParams, data: &[(f64, f64, f64)]) -> f64 {
    if params.gamma1 + params.gamma2 >= 1.0 {
        return f64::NEG_INFINITY;
    }
    data.iter()
        .map(|(x, n, p)| {
            let q = erf_psycho_2gammas(params, *x).clamp(EPS, 1.0 - EPS);
            let k = p * n;
            k * q.ln() + (n - k) * (1.0 - q).ln()
        })
        .sum()
}

fn axis(lo: f64, hi: f64, points: usize) -> Vec<f64> {
    if points < 2 || hi <= lo {
        return vec![(lo + hi) / 2.0];
    }
    let step = (hi - lo) / (points - 1) as f64;
    (0..points).map(|i| lo + step * i as f64).collect()
}

impl PsychometricFit for GridFit {
    fn fit(&self, stims: &[f64], counts: &[u32], prob_right: &[f64]) -> Option<PsychometricParams> {
        let data: Vec<(f64, f64, f64)> = stims
            .iter()
            .zip(counts)
            .zip(prob_right)
            .filter(|((_, n), p)| **n > 0 && p.is_finite())
            .map(|((x, n), p)| (*x, *n as f64, *p))
            .collect();
        if data.is_empty() {
            return None;
        }

        let mut span = BOUNDS;
        let mut best: Option<(f64, [f64; 4])> = None;
        for _ in 0..self.rounds.max(1) {
            let axes: Vec<Vec<f64>> = span.iter().map(|(lo, hi)| axis(*lo, *hi, self.points)).collect();
            for &bias in &axes[0] {
                for &slope in &axes[1] {
                    for &gamma1 in &axes[2] {
                        for &gamma2 in &axes[3] {
                            let p = PsychometricParams {
                                bias,
                                slope,
                                gamma1,
                                gamma2,
                            };
                            let ll = log_likelihood(&p, &data);
                            if best.map_or(true, |(b, _)| ll > b) {
                                best = Some((ll, [bias, slope, gamma1, gamma2]));
                            }
                        }
                    }
                }
            }
            let (_, at) = best?;
            for (i, (lo, hi)) in span.iter_mut().enumerate() {
                let step = (*hi - *lo) / (self.points.max(2) - 1) as f64;
                *lo = (at[i] - step).max(BOUNDS[i].0);
                *hi = (at[i] + step).min(BOUNDS[i].1);
            }
        }
        let (ll, [bias, slope, gamma1, gamma2]) = best?;
        ll.is_finite().then_some(PsychometricParams {
            bias,
            slope,
            gamma1,
            gamma2,
        })
    }
}
