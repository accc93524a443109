use anyhow::Result;
use candle_core::Tensor;

use crate::scheduler::{SchedulerParams, TimestepSpacing};

const TRAIN_TIMESTEPS: usize = 1000;

/// Resolution-independent shift SD3.5 was trained with.
pub const DEFAULT_SHIFT: f64 = 3.0;

/// Moves noise levels towards 1 so more of the schedule is spent early.
pub fn time_snr_shift(shift: f64, sigma: f64) -> f64 {
    shift * sigma / (1.0 + (shift - 1.0) * sigma)
}

/// `steps` decreasing noise levels in (0, 1], followed by a final 0.
pub fn flow_sigmas(steps: usize, spacing: TimestepSpacing, shift: f64) -> Vec<f64> {
    let train = TRAIN_TIMESTEPS as f64;
    let steps = steps.max(1);
    let mut sigmas: Vec<f64> = match spacing {
        TimestepSpacing::Linspace => (0..steps)
            .map(|i| {
                if steps == 1 {
                    1.0
                } else {
                    1.0 - (1.0 - 1.0 / train) * i as f64 / (steps - 1) as f64
                }
            })
            .collect(),
        TimestepSpacing::Leading => {
            let stride = (TRAIN_TIMESTEPS / steps).max(1);
            (0..steps)
                .rev()
                .map(|i| ((i * stride + 1) as f64 / train).min(1.0))
                .collect()
        }
        TimestepSpacing::Trailing => {
            let stride = train / steps as f64;
            (0..steps)
                .map(|i| ((train - i as f64 * stride).round() / train).max(1.0 / train))
                .collect()
        }
    };
    for sigma in sigmas.iter_mut() {
        *sigma = time_snr_shift(shift, *sigma);
    }
    sigmas.push(0.0);
    sigmas
}

/// log(alpha / sigma) on the straight path x = (1 - s) x0 + s noise.
fn lambda(sigma: f64) -> f64 {
    (1.0 - sigma).max(1e-8).ln() - sigma.max(1e-8).ln()
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Solver {
    Euler,
    EulerAncestral,
    Multistep { order: usize },
}

/// Integrates a velocity-predicting model from noise towards data.
///
/// The model predicts `v = noise - x0`, so `x0 = x - sigma * v`.
pub struct FlowSampler {
    solver: Solver,
    sigmas: Vec<f64>,
    denoised: Vec<Tensor>,
    lambdas: Vec<f64>,
}

impl FlowSampler {
    pub fn new(params: SchedulerParams, steps: usize, shift: f64) -> Self {
        let (solver, spacing) = match params {
            SchedulerParams::Ddim { spacing } => (Solver::Euler, spacing),
            SchedulerParams::EulerAncestral { spacing } => (Solver::EulerAncestral, spacing),
            SchedulerParams::UniPc { solver_order } => (
                Solver::Multistep {
                    order: solver_order.clamp(1, 3),
                },
                TimestepSpacing::Linspace,
            ),
        };
        Self {
            solver,
            sigmas: flow_sigmas(steps, spacing, shift),
            denoised: Vec::new(),
            lambdas: Vec::new(),
        }
    }

    /// Noise levels visited, ending in 0.
    pub fn sigmas(&self) -> &[f64] {
        &self.sigmas
    }

    /// Number of model evaluations.
    pub fn steps(&self) -> usize {
        self.sigmas.len() - 1
    }

    /// Advances `x` from `sigmas[index]` to `sigmas[index + 1]`.
    pub fn step(&mut self, index: usize, x: &Tensor, velocity: &Tensor) -> Result<Tensor> {
        let sigma = self.sigmas[index];
        let next = self.sigmas[index + 1];
        match self.solver {
            Solver::Euler => Ok((x + (velocity * (next - sigma))?)?),
            Solver::EulerAncestral => {
                let denoised = (x - (velocity * sigma)?)?;
                if next == 0.0 {
                    return Ok(denoised);
                }
                let sigma_down = next * next / sigma;
                let alpha_next = 1.0 - next;
                let alpha_down = 1.0 - sigma_down;
                let renoise = (next * next - sigma_down * sigma_down * alpha_next * alpha_next
                    / (alpha_down * alpha_down))
                    .max(0.0)
                    .sqrt();
                let ratio = sigma_down / sigma;
                let x = ((x * ratio)? + (denoised * (1.0 - ratio))?)?;
                let noise = x.randn_like(0.0, 1.0)?;
                Ok(((x * (alpha_next / alpha_down))? + (noise * renoise)?)?)
            }
            Solver::Multistep { order } => {
                let denoised = (x - (velocity * sigma)?)?;
                self.denoised.push(denoised.clone());
                self.lambdas.push(lambda(sigma));
                if self.denoised.len() > order {
                    self.denoised.remove(0);
                    self.lambdas.remove(0);
                }
                if next == 0.0 {
                    return Ok(denoised);
                }
                // Lower order near the end keeps few-step runs stable.
                let remaining = self.steps() - index;
                let order = order.min(self.denoised.len()).min(remaining);
                self.multistep(order, sigma, next, x)
            }
        }
    }

    fn multistep(&self, order: usize, sigma: f64, next: f64, x: &Tensor) -> Result<Tensor> {
        let n = self.denoised.len();
        let m0 = &self.denoised[n - 1];
        let alpha_t = 1.0 - next;
        let h = lambda(next) - self.lambdas[n - 1];
        let exp_neg_h = (-h).exp();
        let base = ((x * (next / sigma))? - (m0 * (alpha_t * (exp_neg_h - 1.0)))?)?;
        match order {
            2 => {
                let m1 = &self.denoised[n - 2];
                let r0 = (self.lambdas[n - 1] - self.lambdas[n - 2]) / h;
                let d1 = ((m0 - m1)? * (1.0 / r0))?;
                Ok((base - (d1 * (0.5 * alpha_t * (exp_neg_h - 1.0)))?)?)
            }
            3 => {
                let (m1, m2) = (&self.denoised[n - 2], &self.denoised[n - 3]);
                let h0 = self.lambdas[n - 1] - self.lambdas[n - 2];
                let h1 = self.lambdas[n - 2] - self.lambdas[n - 3];
                let (r0, r1) = (h0 / h, h1 / h);
                let d1_0 = ((m0 - m1)? * (1.0 / r0))?;
                let d1_1 = ((m1 - m2)? * (1.0 / r1))?;
                let d1 = (&d1_0 + ((&d1_0 - &d1_1)? * (r0 / (r0 + r1)))?)?;
                let d2 = ((&d1_0 - &d1_1)? * (1.0 / (r0 + r1)))?;
                let phi_1 = (exp_neg_h - 1.0) / h + 1.0;
                let phi_2 = (exp_neg_h - 1.0 + h) / (h * h) - 0.5;
                Ok(((base + (d1 * (alpha_t * phi_1))?)? - (d2 * (alpha_t * phi_2))?)?)
            }
            _ => Ok(base),
        }
    }
}
