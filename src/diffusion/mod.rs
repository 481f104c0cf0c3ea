//! The DDPM forward and reverse process mathematics.
//!
//! `GaussianDiffusion` owns the precomputed schedule buffers and exposes the
//! closed-form operations of the chain. It is stateless with respect to any
//! particular denoiser network; networks are passed in where needed.

pub mod losses;
pub mod sampling;

use burn::tensor::backend::Backend;
use burn::tensor::{Distribution, Int, Tensor};
use serde::{Deserialize, Serialize};

use crate::conditioning::distributions::kl_to_standard_normal;
use crate::error::Result;
use crate::schedulers::{LossKind, NoiseSchedule, Parameterization, ScheduleConfig};
use crate::utils::{extract_into_tensor, mean_per_sample, noise_like};

use core::f64::consts::LN_2;

/// Construction-time configuration of the diffusion process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffusionConfig {
    pub schedule: ScheduleConfig,
    pub parameterization: Parameterization,
    pub loss_kind: LossKind,
    /// Weight of the simple denoising loss.
    pub l_simple_weight: f64,
    /// Weight of the variational-lower-bound term.
    pub original_elbo_weight: f64,
    /// Enables the learned per-timestep log-variance weighting.
    pub learn_logvar: bool,
    /// Initial value of the per-timestep log-variance buffer.
    pub logvar_init: f64,
    /// Clip the predicted clean signal to [-1, 1] during sampling.
    pub clip_denoised: bool,
    /// Whether an external EMA shadow of the denoiser weights is kept.
    pub use_ema: bool,
    /// Interval between captured intermediates in the reverse chain.
    pub log_every_t: usize,
}

impl Default for DiffusionConfig {
    fn default() -> Self {
        Self {
            schedule: ScheduleConfig::default(),
            parameterization: Parameterization::Eps,
            loss_kind: LossKind::L2,
            l_simple_weight: 1.,
            original_elbo_weight: 0.,
            learn_logvar: false,
            logvar_init: 0.,
            clip_denoised: true,
            use_ema: true,
            log_every_t: 100,
        }
    }
}

/// The diffusion process core: schedule buffers plus the loss configuration.
#[derive(Debug, Clone)]
pub struct GaussianDiffusion<B: Backend> {
    schedule: NoiseSchedule<B>,
    parameterization: Parameterization,
    loss_kind: LossKind,
    l_simple_weight: f64,
    original_elbo_weight: f64,
    learn_logvar: bool,
    logvar: Tensor<B, 1>,
    clip_denoised: bool,
    use_ema: bool,
    log_every_t: usize,
}

impl<B: Backend> GaussianDiffusion<B> {
    pub fn new(config: &DiffusionConfig, device: &B::Device) -> Result<Self> {
        let schedule = NoiseSchedule::new(&config.schedule, config.parameterization, device)?;
        tracing::info!(
            parameterization = ?config.parameterization,
            timesteps = schedule.num_timesteps(),
            "running diffusion core"
        );

        let logvar = Tensor::full(
            [schedule.num_timesteps()],
            config.logvar_init as f32,
            device,
        );
        Ok(Self {
            schedule,
            parameterization: config.parameterization,
            loss_kind: config.loss_kind,
            l_simple_weight: config.l_simple_weight,
            original_elbo_weight: config.original_elbo_weight,
            learn_logvar: config.learn_logvar,
            logvar,
            clip_denoised: config.clip_denoised,
            use_ema: config.use_ema,
            log_every_t: config.log_every_t,
        })
    }

    pub fn num_timesteps(&self) -> usize {
        self.schedule.num_timesteps()
    }

    pub fn schedule(&self) -> &NoiseSchedule<B> {
        &self.schedule
    }

    pub fn parameterization(&self) -> Parameterization {
        self.parameterization
    }

    pub fn clip_denoised(&self) -> bool {
        self.clip_denoised
    }

    pub fn ema_enabled(&self) -> bool {
        self.use_ema
    }

    /// The learned (or fixed) per-timestep log-variance buffer, length T.
    pub fn logvar(&self) -> &Tensor<B, 1> {
        &self.logvar
    }

    /// Uniform random training timesteps, one per batch element.
    pub fn sample_timesteps(&self, batch_size: usize, device: &B::Device) -> Tensor<B, 1, Int> {
        Tensor::<B, 1>::random(
            [batch_size],
            Distribution::Uniform(0., self.num_timesteps() as f64),
            device,
        )
        .int()
    }

    /// Mean, variance and log-variance of the forward marginal
    /// q(x_t | x_0).
    pub fn q_mean_variance<const D: usize>(
        &self,
        x_start: Tensor<B, D>,
        t: &Tensor<B, 1, Int>,
    ) -> (Tensor<B, D>, Tensor<B, D>, Tensor<B, D>) {
        let mean = extract_into_tensor(&self.schedule.sqrt_alphas_cumprod, t) * x_start;
        let sqrt_one_minus = extract_into_tensor::<B, D>(
            &self.schedule.sqrt_one_minus_alphas_cumprod,
            t,
        );
        let variance = sqrt_one_minus.clone() * sqrt_one_minus;
        let log_variance = extract_into_tensor(&self.schedule.log_one_minus_alphas_cumprod, t);
        (mean, variance, log_variance)
    }

    /// Forward-noises `x_start` to timestep `t`:
    /// `sqrt(acp_t) * x_0 + sqrt(1 - acp_t) * noise`.
    pub fn q_sample<const D: usize>(
        &self,
        x_start: Tensor<B, D>,
        t: &Tensor<B, 1, Int>,
        noise: Option<Tensor<B, D>>,
    ) -> Tensor<B, D> {
        let noise = noise.unwrap_or_else(|| noise_like(x_start.shape(), &x_start.device()));
        extract_into_tensor(&self.schedule.sqrt_alphas_cumprod, t) * x_start
            + extract_into_tensor(&self.schedule.sqrt_one_minus_alphas_cumprod, t) * noise
    }

    /// Inverts the forward equation, recovering x_0 from x_t and the noise.
    pub fn predict_start_from_noise<const D: usize>(
        &self,
        x_t: Tensor<B, D>,
        t: &Tensor<B, 1, Int>,
        noise: Tensor<B, D>,
    ) -> Tensor<B, D> {
        extract_into_tensor(&self.schedule.sqrt_recip_alphas_cumprod, t) * x_t
            - extract_into_tensor(&self.schedule.sqrt_recipm1_alphas_cumprod, t) * noise
    }

    /// Recovers the noise from x_t and a predicted x_0.
    pub fn predict_eps_from_start<const D: usize>(
        &self,
        x_t: Tensor<B, D>,
        t: &Tensor<B, 1, Int>,
        x_start: Tensor<B, D>,
    ) -> Tensor<B, D> {
        (extract_into_tensor(&self.schedule.sqrt_recip_alphas_cumprod, t) * x_t - x_start)
            / extract_into_tensor(&self.schedule.sqrt_recipm1_alphas_cumprod, t)
    }

    /// Mean, variance and clipped log-variance of the true reverse posterior
    /// q(x_{t-1} | x_t, x_0).
    pub fn q_posterior<const D: usize>(
        &self,
        x_start: Tensor<B, D>,
        x_t: Tensor<B, D>,
        t: &Tensor<B, 1, Int>,
    ) -> (Tensor<B, D>, Tensor<B, D>, Tensor<B, D>) {
        let mean = extract_into_tensor(&self.schedule.posterior_mean_coef1, t) * x_start
            + extract_into_tensor(&self.schedule.posterior_mean_coef2, t) * x_t;
        let variance = extract_into_tensor(&self.schedule.posterior_variance, t);
        let log_variance_clipped =
            extract_into_tensor(&self.schedule.posterior_log_variance_clipped, t);
        (mean, variance, log_variance_clipped)
    }

    /// The training target for a given start sample and drawn noise.
    pub fn target_for<const D: usize>(
        &self,
        x_start: &Tensor<B, D>,
        noise: &Tensor<B, D>,
    ) -> Tensor<B, D> {
        match self.parameterization {
            Parameterization::Eps => noise.clone(),
            Parameterization::X0 => x_start.clone(),
        }
    }

    /// Prior KL term of the variational lower bound in bits-per-dim, one
    /// value per batch element. Depends only on the forward marginal at the
    /// last timestep, never on the network.
    pub fn prior_bpd<const D: usize>(&self, x_start: Tensor<B, D>) -> Tensor<B, 1> {
        let batch_size = x_start.dims()[0];
        let t = Tensor::full(
            [batch_size],
            (self.num_timesteps() - 1) as i32,
            &x_start.device(),
        );
        let (qt_mean, _, qt_log_variance) = self.q_mean_variance(x_start, &t);
        mean_per_sample(kl_to_standard_normal(qt_mean, qt_log_variance)).div_scalar(LN_2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Shape;

    type TestBackend = burn_ndarray::NdArray<f32>;

    fn diffusion(config: &DiffusionConfig) -> GaussianDiffusion<TestBackend> {
        GaussianDiffusion::new(config, &Default::default()).unwrap()
    }

    #[test]
    fn test_q_sample_round_trip() {
        let device = Default::default();
        let d = diffusion(&DiffusionConfig::default());

        let x_start = Tensor::<TestBackend, 4>::random(
            [4, 2, 8, 8],
            Distribution::Normal(0.0, 1.0),
            &device,
        );
        let noise = Tensor::<TestBackend, 4>::random(
            [4, 2, 8, 8],
            Distribution::Normal(0.0, 1.0),
            &device,
        );
        let t = Tensor::<TestBackend, 1, Int>::from_ints([0, 250, 500, 999], &device);

        let x_noisy = d.q_sample(x_start.clone(), &t, Some(noise.clone()));
        let recovered = d.predict_start_from_noise(x_noisy, &t, noise);

        recovered.to_data().assert_approx_eq(&x_start.to_data(), 2);
    }

    #[test]
    fn test_predict_eps_round_trip() {
        let device = Default::default();
        let d = diffusion(&DiffusionConfig::default());

        let x_start = Tensor::<TestBackend, 2>::random(
            [3, 16],
            Distribution::Normal(0.0, 1.0),
            &device,
        );
        let noise =
            Tensor::<TestBackend, 2>::random([3, 16], Distribution::Normal(0.0, 1.0), &device);
        let t = Tensor::<TestBackend, 1, Int>::from_ints([10, 400, 900], &device);

        let x_noisy = d.q_sample(x_start.clone(), &t, Some(noise.clone()));
        let recovered = d.predict_eps_from_start(x_noisy, &t, x_start);

        recovered.to_data().assert_approx_eq(&noise.to_data(), 2);
    }

    #[test]
    fn test_q_posterior_exact_at_chain_start() {
        let device = Default::default();
        let d = diffusion(&DiffusionConfig::default());

        let x_start =
            Tensor::<TestBackend, 2>::random([2, 8], Distribution::Normal(0.0, 1.0), &device);
        let x_t =
            Tensor::<TestBackend, 2>::random([2, 8], Distribution::Normal(0.0, 1.0), &device);
        let t = Tensor::<TestBackend, 1, Int>::from_ints([0, 0], &device);

        // coef1[0] = 1 and coef2[0] = 0: the posterior mean collapses to x_0
        // and its variance vanishes.
        let (mean, variance, _) = d.q_posterior(x_start.clone(), x_t, &t);
        mean.to_data().assert_approx_eq(&x_start.to_data(), 3);
        assert!(variance.to_data().value.iter().all(|v| v.abs() < 1e-10));
    }

    #[test]
    fn test_q_mean_variance_matches_schedule() {
        let device = Default::default();
        let d = diffusion(&DiffusionConfig::default());

        let x_start = Tensor::<TestBackend, 2>::ones([1, 4], &device);
        let t = Tensor::<TestBackend, 1, Int>::from_ints([0], &device);
        let (mean, variance, _) = d.q_mean_variance(x_start, &t);

        let acp0 = d.schedule().alphas_cumprod().to_data().value[0];
        let mean0 = mean.to_data().value[0];
        let var0 = variance.to_data().value[0];
        assert!((mean0 - acp0.sqrt()).abs() < 1e-6);
        assert!((var0 - (1. - acp0)).abs() < 1e-6);
    }

    #[test]
    fn test_sample_timesteps_in_range() {
        let device = Default::default();
        let d = diffusion(&DiffusionConfig {
            schedule: ScheduleConfig {
                timesteps: 20,
                ..Default::default()
            },
            ..Default::default()
        });
        let t = d.sample_timesteps(64, &device);
        assert_eq!(t.shape(), Shape::from([64]));
        for v in t.to_data().value {
            assert!((0..20).contains(&(v as i64)));
        }
    }

    #[test]
    fn test_prior_bpd_small_for_standard_normal_start() {
        let device = Default::default();
        let d = diffusion(&DiffusionConfig::default());
        let x_start = Tensor::<TestBackend, 2>::zeros([2, 32], &device);
        // At t = T-1 the marginal is close to the standard normal, so the
        // prior KL of a zero start is nearly 0 bits.
        let bpd = d.prior_bpd(x_start);
        assert!(bpd.to_data().value.iter().all(|v| v.abs() < 0.1));
    }
}
