//! Noise schedule construction.
//!
//! Everything downstream of the beta sequence is a closed-form derivation;
//! the arrays computed here are immutable once built and are read by every
//! training and sampling step.

use burn::tensor::backend::Backend;
use burn::tensor::{Data, Shape, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{DiffusionError, Result};

/// This represents how beta ranges from its minimum value to the maximum
/// during training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BetaSchedule {
    /// Linear interpolation.
    Linear,
    /// Linear interpolation of the square root of beta.
    ScaledLinear,
    /// Glide cosine schedule
    SquaredcosCapV2,
}

/// Whether the denoiser predicts the added noise (`eps`) or the clean
/// signal (`x0`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Parameterization {
    Eps,
    X0,
}

impl core::str::FromStr for Parameterization {
    type Err = DiffusionError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "eps" => Ok(Self::Eps),
            "x0" => Ok(Self::X0),
            other => Err(DiffusionError::config(format!(
                "unsupported parameterization '{other}', expected 'eps' or 'x0'"
            ))),
        }
    }
}

/// Elementwise distance used by the denoising loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LossKind {
    L1,
    L2,
}

impl core::str::FromStr for LossKind {
    type Err = DiffusionError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "l1" => Ok(Self::L1),
            "l2" => Ok(Self::L2),
            other => Err(DiffusionError::config(format!(
                "unknown loss type '{other}', expected 'l1' or 'l2'"
            ))),
        }
    }
}

/// Hyperparameters of the forward-noising schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Number of diffusion timesteps T.
    pub timesteps: usize,
    /// How beta evolves over the schedule.
    pub beta_schedule: BetaSchedule,
    /// The value of beta at the beginning of training.
    pub linear_start: f64,
    /// The value of beta at the end of training.
    pub linear_end: f64,
    /// Offset `s` of the cosine schedule.
    pub cosine_s: f64,
    /// Caller-supplied betas overriding `beta_schedule`; length must be T.
    pub given_betas: Option<Vec<f64>>,
    /// Interpolation weight for the posterior variance:
    /// `sigma^2 = (1 - v) * beta_tilde + v * beta`.
    pub v_posterior: f64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            timesteps: 1000,
            beta_schedule: BetaSchedule::Linear,
            linear_start: 1e-4,
            linear_end: 2e-2,
            cosine_s: 8e-3,
            given_betas: None,
            v_posterior: 0.,
        }
    }
}

/// `num_steps` values evenly spaced over `[start, end]`, both endpoints
/// included.
fn linspace(start: f64, end: f64, num_steps: usize) -> Vec<f64> {
    if num_steps == 1 {
        return vec![start];
    }
    let step_size = (end - start) / (num_steps - 1) as f64;
    (0..num_steps).map(|i| start + i as f64 * step_size).collect()
}

/// Create a beta schedule that discretizes the given alpha_t_bar function,
/// which defines the cumulative product of `(1-beta)` over time from
/// `t = [0,1]`.
fn betas_for_alpha_bar(num_steps: usize, cosine_s: f64, max_beta: f64) -> Vec<f64> {
    let alpha_bar = |t: f64| {
        f64::cos((t + cosine_s) / (1. + cosine_s) * core::f64::consts::FRAC_PI_2).powi(2)
    };
    (0..num_steps)
        .map(|i| {
            let t1 = i as f64 / num_steps as f64;
            let t2 = (i + 1) as f64 / num_steps as f64;
            (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(max_beta)
        })
        .collect()
}

/// Computes the per-timestep beta sequence for a schedule kind.
pub fn make_beta_schedule(
    schedule: BetaSchedule,
    timesteps: usize,
    linear_start: f64,
    linear_end: f64,
    cosine_s: f64,
) -> Vec<f64> {
    match schedule {
        BetaSchedule::Linear => linspace(linear_start, linear_end, timesteps),
        BetaSchedule::ScaledLinear => {
            linspace(linear_start.sqrt(), linear_end.sqrt(), timesteps)
                .into_iter()
                .map(|b| b * b)
                .collect()
        }
        BetaSchedule::SquaredcosCapV2 => betas_for_alpha_bar(timesteps, cosine_s, 0.999),
    }
}

/// Precomputed per-timestep coefficient buffers of the diffusion process.
///
/// All buffers have length exactly T and live on the model device. The
/// struct is read-only after construction.
#[derive(Debug, Clone)]
pub struct NoiseSchedule<B: Backend> {
    num_timesteps: usize,
    pub(crate) betas: Tensor<B, 1>,
    pub(crate) alphas_cumprod: Tensor<B, 1>,
    pub(crate) alphas_cumprod_prev: Tensor<B, 1>,
    pub(crate) sqrt_alphas_cumprod: Tensor<B, 1>,
    pub(crate) sqrt_one_minus_alphas_cumprod: Tensor<B, 1>,
    pub(crate) log_one_minus_alphas_cumprod: Tensor<B, 1>,
    pub(crate) sqrt_recip_alphas_cumprod: Tensor<B, 1>,
    pub(crate) sqrt_recipm1_alphas_cumprod: Tensor<B, 1>,
    pub(crate) posterior_variance: Tensor<B, 1>,
    pub(crate) posterior_log_variance_clipped: Tensor<B, 1>,
    pub(crate) posterior_mean_coef1: Tensor<B, 1>,
    pub(crate) posterior_mean_coef2: Tensor<B, 1>,
    pub(crate) lvlb_weights: Tensor<B, 1>,
}

impl<B: Backend> NoiseSchedule<B> {
    pub fn new(
        config: &ScheduleConfig,
        parameterization: Parameterization,
        device: &B::Device,
    ) -> Result<Self> {
        let betas = match &config.given_betas {
            Some(betas) => {
                if betas.len() != config.timesteps {
                    return Err(DiffusionError::config(format!(
                        "given_betas has length {} but the schedule has {} timesteps",
                        betas.len(),
                        config.timesteps
                    )));
                }
                betas.clone()
            }
            None => make_beta_schedule(
                config.beta_schedule,
                config.timesteps,
                config.linear_start,
                config.linear_end,
                config.cosine_s,
            ),
        };
        let num_timesteps = betas.len();
        if num_timesteps < 2 {
            return Err(DiffusionError::config(
                "a schedule needs at least two timesteps",
            ));
        }

        let alphas: Vec<f64> = betas.iter().map(|beta| 1. - beta).collect();
        let mut alphas_cumprod = Vec::with_capacity(num_timesteps);
        let mut cumprod = 1.0f64;
        for alpha in &alphas {
            cumprod *= alpha;
            alphas_cumprod.push(cumprod);
        }
        let alphas_cumprod_prev: Vec<f64> = core::iter::once(1.0)
            .chain(alphas_cumprod.iter().copied().take(num_timesteps - 1))
            .collect();

        let sqrt_alphas_cumprod: Vec<f64> = alphas_cumprod.iter().map(|a| a.sqrt()).collect();
        let sqrt_one_minus_alphas_cumprod: Vec<f64> =
            alphas_cumprod.iter().map(|a| (1. - a).sqrt()).collect();
        let log_one_minus_alphas_cumprod: Vec<f64> =
            alphas_cumprod.iter().map(|a| (1. - a).ln()).collect();
        let sqrt_recip_alphas_cumprod: Vec<f64> =
            alphas_cumprod.iter().map(|a| (1. / a).sqrt()).collect();
        let sqrt_recipm1_alphas_cumprod: Vec<f64> =
            alphas_cumprod.iter().map(|a| (1. / a - 1.).sqrt()).collect();

        // q(x_{t-1} | x_t, x_0), interpolated towards beta_t by v_posterior.
        let v = config.v_posterior;
        let posterior_variance: Vec<f64> = (0..num_timesteps)
            .map(|t| {
                (1. - v) * betas[t] * (1. - alphas_cumprod_prev[t]) / (1. - alphas_cumprod[t])
                    + v * betas[t]
            })
            .collect();
        // The posterior variance is 0 at the start of the chain, clip before
        // taking the log.
        let posterior_log_variance_clipped: Vec<f64> = posterior_variance
            .iter()
            .map(|var| var.max(1e-20).ln())
            .collect();
        let posterior_mean_coef1: Vec<f64> = (0..num_timesteps)
            .map(|t| betas[t] * alphas_cumprod_prev[t].sqrt() / (1. - alphas_cumprod[t]))
            .collect();
        let posterior_mean_coef2: Vec<f64> = (0..num_timesteps)
            .map(|t| (1. - alphas_cumprod_prev[t]) * alphas[t].sqrt() / (1. - alphas_cumprod[t]))
            .collect();

        let mut lvlb_weights: Vec<f64> = match parameterization {
            Parameterization::Eps => (0..num_timesteps)
                .map(|t| {
                    betas[t] * betas[t]
                        / (2. * posterior_variance[t] * alphas[t] * (1. - alphas_cumprod[t]))
                })
                .collect(),
            Parameterization::X0 => alphas_cumprod
                .iter()
                .map(|a| 0.5 * a.sqrt() / (2. - a))
                .collect(),
        };
        // The true weight at t=0 is degenerate, reuse the t=1 value.
        lvlb_weights[0] = lvlb_weights[1];
        if lvlb_weights.iter().any(|w| w.is_nan()) {
            return Err(DiffusionError::config(
                "variational lower bound weights contain NaN",
            ));
        }

        Ok(Self {
            num_timesteps,
            betas: to_schedule_tensor(&betas, device),
            alphas_cumprod: to_schedule_tensor(&alphas_cumprod, device),
            alphas_cumprod_prev: to_schedule_tensor(&alphas_cumprod_prev, device),
            sqrt_alphas_cumprod: to_schedule_tensor(&sqrt_alphas_cumprod, device),
            sqrt_one_minus_alphas_cumprod: to_schedule_tensor(
                &sqrt_one_minus_alphas_cumprod,
                device,
            ),
            log_one_minus_alphas_cumprod: to_schedule_tensor(&log_one_minus_alphas_cumprod, device),
            sqrt_recip_alphas_cumprod: to_schedule_tensor(&sqrt_recip_alphas_cumprod, device),
            sqrt_recipm1_alphas_cumprod: to_schedule_tensor(&sqrt_recipm1_alphas_cumprod, device),
            posterior_variance: to_schedule_tensor(&posterior_variance, device),
            posterior_log_variance_clipped: to_schedule_tensor(
                &posterior_log_variance_clipped,
                device,
            ),
            posterior_mean_coef1: to_schedule_tensor(&posterior_mean_coef1, device),
            posterior_mean_coef2: to_schedule_tensor(&posterior_mean_coef2, device),
            lvlb_weights: to_schedule_tensor(&lvlb_weights, device),
        })
    }

    pub fn num_timesteps(&self) -> usize {
        self.num_timesteps
    }

    pub fn betas(&self) -> &Tensor<B, 1> {
        &self.betas
    }

    pub fn alphas_cumprod(&self) -> &Tensor<B, 1> {
        &self.alphas_cumprod
    }

    pub fn posterior_variance(&self) -> &Tensor<B, 1> {
        &self.posterior_variance
    }

    pub fn lvlb_weights(&self) -> &Tensor<B, 1> {
        &self.lvlb_weights
    }
}

fn to_schedule_tensor<B: Backend>(values: &[f64], device: &B::Device) -> Tensor<B, 1> {
    let values: Vec<f32> = values.iter().map(|v| *v as f32).collect();
    let len = values.len();
    Tensor::from_data(
        Data::new(values, Shape::new([len])).convert::<B::FloatElem>(),
        device,
    )
}
