//! The reverse-chain sampler.
//!
//! Transitions run from t = T-1 down to 0; each step is a blocking batched
//! tensor computation, sequential across timesteps and vectorized across the
//! batch. The per-step callback exists for progress reporting and
//! inspection, not cancellation.

use burn::tensor::backend::Backend;
use burn::tensor::{Int, Shape, Tensor};

use super::GaussianDiffusion;
use crate::conditioning::{Conditioning, DenoiseRoute, Denoiser};
use crate::error::{DiffusionError, Result};
use crate::schedulers::Parameterization;
use crate::utils::{noise_like, nonzero_timestep_mask};

/// Fixed binary mask blending sampled content with a forward-noised
/// reference, for inpainting-style generation.
#[derive(Debug, Clone)]
pub struct InpaintMask<B: Backend, const D: usize> {
    /// 1 keeps the reference, 0 keeps the sampled content.
    pub mask: Tensor<B, D>,
    /// The clean reference image the masked region is taken from.
    pub x_start: Tensor<B, D>,
}

/// Optional knobs of a reverse-chain run.
#[derive(Debug, Clone)]
pub struct SampleOptions<B: Backend, const D: usize> {
    /// Supplied initial state; drawn from a standard Gaussian when absent.
    pub x_t: Option<Tensor<B, D>>,
    /// Cap on the number of reverse steps (counted from t = cap-1 down).
    pub steps: Option<usize>,
    /// Masked-inpainting blend applied after every step.
    pub inpaint: Option<InpaintMask<B, D>>,
    /// Scales the noise added at each non-terminal step.
    pub temperature: f64,
    /// Override of the model-level intermediate-capture interval.
    pub log_every_t: Option<usize>,
    /// Timestep-to-conditioning-index map for a shortened conditioning
    /// schedule; entries index into the schedule's timesteps.
    pub cond_ids: Option<Tensor<B, 1, Int>>,
}

impl<B: Backend, const D: usize> Default for SampleOptions<B, D> {
    fn default() -> Self {
        Self {
            x_t: None,
            steps: None,
            inpaint: None,
            temperature: 1.,
            log_every_t: None,
            cond_ids: None,
        }
    }
}

/// Result of a full reverse chain: the terminal sample plus captured
/// snapshots.
#[derive(Debug, Clone)]
pub struct DenoiseChain<B: Backend, const D: usize> {
    pub sample: Tensor<B, D>,
    pub intermediates: Vec<Tensor<B, D>>,
}

/// What `p_sample_loop` snapshots into the intermediates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Capture {
    Samples,
    PredictedStart,
}

/// Per-step observer, called with the timestep and the state after the step.
pub type StepCallback<'a, B, const D: usize> = &'a mut dyn FnMut(usize, &Tensor<B, D>);

impl<B: Backend> GaussianDiffusion<B> {
    /// Mean and clipped log-variance of the model's reverse transition
    /// p(x_{t-1} | x_t), plus the reconstructed x_0 the posterior was
    /// evaluated at.
    pub fn p_mean_variance<const D: usize, M: Denoiser<B, D>>(
        &self,
        denoiser: &M,
        x: Tensor<B, D>,
        t: &Tensor<B, 1, Int>,
        cond: &Conditioning<B>,
        route: &DenoiseRoute,
        clip_denoised: bool,
    ) -> (Tensor<B, D>, Tensor<B, D>, Tensor<B, D>) {
        let model_out = denoiser.forward(x.clone(), t.clone(), cond, route);
        let x_recon = match self.parameterization() {
            Parameterization::Eps => self.predict_start_from_noise(x.clone(), t, model_out),
            Parameterization::X0 => model_out,
        };
        let x_recon = if clip_denoised {
            x_recon.clamp(-1.0, 1.0)
        } else {
            x_recon
        };
        let (mean, _, log_variance) = self.q_posterior(x_recon.clone(), x, t);
        (mean, log_variance, x_recon)
    }

    /// One reverse transition x_t -> x_{t-1}. No noise is added for batch
    /// elements at the terminal timestep t = 0. Returns the new state and
    /// the reconstructed x_0.
    pub fn p_sample<const D: usize, M: Denoiser<B, D>>(
        &self,
        denoiser: &M,
        x: Tensor<B, D>,
        t: &Tensor<B, 1, Int>,
        cond: &Conditioning<B>,
        route: &DenoiseRoute,
        clip_denoised: bool,
        temperature: f64,
    ) -> (Tensor<B, D>, Tensor<B, D>) {
        let (mean, log_variance, x_recon) =
            self.p_mean_variance(denoiser, x.clone(), t, cond, route, clip_denoised);
        let noise = noise_like(x.shape(), &x.device()).mul_scalar(temperature);
        let nonzero_mask = nonzero_timestep_mask::<B, D>(t);
        let sample = mean + nonzero_mask * log_variance.mul_scalar(0.5).exp() * noise;
        (sample, x_recon)
    }

    /// Runs the full reverse chain, capturing a snapshot of the running
    /// sample every `log_every_t` steps.
    pub fn p_sample_loop<const D: usize, M: Denoiser<B, D>>(
        &self,
        denoiser: &M,
        cond: &Conditioning<B>,
        route: &DenoiseRoute,
        shape: Shape<D>,
        device: &B::Device,
        options: SampleOptions<B, D>,
        callback: Option<StepCallback<'_, B, D>>,
    ) -> Result<DenoiseChain<B, D>> {
        self.denoise_chain(
            denoiser,
            cond,
            route,
            shape,
            device,
            options,
            callback,
            Capture::Samples,
        )
    }

    /// Like [`Self::p_sample_loop`] but the intermediates hold the predicted
    /// x_0 at each captured step, for progress inspection.
    pub fn progressive_denoising<const D: usize, M: Denoiser<B, D>>(
        &self,
        denoiser: &M,
        cond: &Conditioning<B>,
        route: &DenoiseRoute,
        shape: Shape<D>,
        device: &B::Device,
        options: SampleOptions<B, D>,
        callback: Option<StepCallback<'_, B, D>>,
    ) -> Result<DenoiseChain<B, D>> {
        self.denoise_chain(
            denoiser,
            cond,
            route,
            shape,
            device,
            options,
            callback,
            Capture::PredictedStart,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn denoise_chain<const D: usize, M: Denoiser<B, D>>(
        &self,
        denoiser: &M,
        cond: &Conditioning<B>,
        route: &DenoiseRoute,
        shape: Shape<D>,
        device: &B::Device,
        options: SampleOptions<B, D>,
        mut callback: Option<StepCallback<'_, B, D>>,
        capture: Capture,
    ) -> Result<DenoiseChain<B, D>> {
        let total_steps = options
            .steps
            .unwrap_or(self.num_timesteps())
            .min(self.num_timesteps());
        let log_every_t = options.log_every_t.unwrap_or(self.log_every_t).max(1);
        let batch_size = shape.dims[0];

        let mut img = options
            .x_t
            .unwrap_or_else(|| noise_like(shape.clone(), device));
        let mut intermediates = match capture {
            Capture::Samples => vec![img.clone()],
            Capture::PredictedStart => Vec::new(),
        };
        let mut cond = cond.clone();

        for i in (0..total_steps).rev() {
            let ts = Tensor::full([batch_size], i as i32, device);

            // Under a shortened conditioning schedule the conditioning is
            // re-noised to the mapped conditioning timestep at every step,
            // compounding over the chain.
            if let Some(cond_ids) = &options.cond_ids {
                let Conditioning::Embedding(c) = cond else {
                    return Err(DiffusionError::unsupported(
                        "a shortened conditioning schedule requires embedding conditioning",
                    ));
                };
                let tc = cond_ids.clone().select(0, ts.clone());
                cond = Conditioning::Embedding(self.q_sample(c, &tc, None));
            }

            let (sample, x_recon) = self.p_sample(
                denoiser,
                img,
                &ts,
                &cond,
                route,
                self.clip_denoised(),
                options.temperature,
            );
            img = sample;

            if let Some(inpaint) = &options.inpaint {
                let reference = self.q_sample(inpaint.x_start.clone(), &ts, None);
                img = reference * inpaint.mask.clone()
                    + img * inpaint.mask.clone().ones_like().sub(inpaint.mask.clone());
            }

            if i % log_every_t == 0 || i == total_steps - 1 {
                tracing::debug!(timestep = i, "denoising");
                intermediates.push(match capture {
                    Capture::Samples => img.clone(),
                    Capture::PredictedStart => x_recon,
                });
            }
            if let Some(callback) = callback.as_deref_mut() {
                callback(i, &img);
            }
        }

        Ok(DenoiseChain {
            sample: img,
            intermediates,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditioning::CondRoute;
    use crate::diffusion::DiffusionConfig;
    use crate::schedulers::ScheduleConfig;
    use burn::tensor::Distribution;

    type TestBackend = burn_ndarray::NdArray<f32>;

    /// Denoiser stub predicting zero noise everywhere.
    struct ZeroDenoiser;

    impl<const D: usize> Denoiser<TestBackend, D> for ZeroDenoiser {
        fn forward(
            &self,
            latent: Tensor<TestBackend, D>,
            _t: Tensor<TestBackend, 1, Int>,
            _cond: &Conditioning<TestBackend>,
            _route: &DenoiseRoute,
        ) -> Tensor<TestBackend, D> {
            latent.zeros_like()
        }
    }

    fn diffusion(timesteps: usize) -> GaussianDiffusion<TestBackend> {
        GaussianDiffusion::new(
            &DiffusionConfig {
                schedule: ScheduleConfig {
                    timesteps,
                    ..Default::default()
                },
                ..Default::default()
            },
            &Default::default(),
        )
        .unwrap()
    }

    fn embedding_cond(device: &<TestBackend as Backend>::Device) -> Conditioning<TestBackend> {
        Conditioning::Embedding(Tensor::zeros([4, 2, 8], device))
    }

    #[test]
    fn test_p_sample_terminal_step_adds_no_noise() {
        let device = Default::default();
        let d = diffusion(100);
        let cond = embedding_cond(&device);
        let route = DenoiseRoute::image(Some(CondRoute::Text));

        let x = Tensor::<TestBackend, 4>::random(
            [4, 2, 4, 4],
            Distribution::Normal(0.0, 1.0),
            &device,
        );
        let t = Tensor::<TestBackend, 1, Int>::from_ints([0, 0, 0, 0], &device);

        // With the t = 0 mask the injected noise is multiplied away, so two
        // draws must agree exactly.
        let (first, _) = d.p_sample(&ZeroDenoiser, x.clone(), &t, &cond, &route, true, 1.0);
        let (second, _) = d.p_sample(&ZeroDenoiser, x, &t, &cond, &route, true, 1.0);
        first.to_data().assert_approx_eq(&second.to_data(), 5);
    }

    #[test]
    fn test_q_sample_then_p_sample_keeps_shape_and_stays_finite() {
        <TestBackend as Backend>::seed(42);
        let device = Default::default();
        let d = diffusion(1000);
        let cond = embedding_cond(&device);
        let route = DenoiseRoute::image(Some(CondRoute::Text));

        let x_start = Tensor::<TestBackend, 4>::random(
            [4, 2, 8, 8],
            Distribution::Normal(0.0, 1.0),
            &device,
        );
        let t = Tensor::<TestBackend, 1, Int>::from_ints([500, 500, 500, 500], &device);

        let x_noisy = d.q_sample(x_start.clone(), &t, None);
        let (stepped, _) = d.p_sample(&ZeroDenoiser, x_noisy, &t, &cond, &route, true, 1.0);

        assert_eq!(stepped.shape(), x_start.shape());
        assert!(stepped.to_data().value.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_p_sample_loop_runs_and_captures_intermediates() {
        let device = Default::default();
        let d = diffusion(20);
        let cond = embedding_cond(&device);
        let route = DenoiseRoute::image(Some(CondRoute::Text));

        let mut seen_steps = Vec::new();
        let mut callback = |i: usize, _img: &Tensor<TestBackend, 4>| seen_steps.push(i);
        let chain = d
            .p_sample_loop(
                &ZeroDenoiser,
                &cond,
                &route,
                Shape::new([4, 2, 4, 4]),
                &device,
                SampleOptions {
                    log_every_t: Some(5),
                    ..Default::default()
                },
                Some(&mut callback),
            )
            .unwrap();

        assert_eq!(chain.sample.shape(), Shape::from([4, 2, 4, 4]));
        assert!(chain.sample.to_data().value.iter().all(|v| v.is_finite()));
        // Initial state + t in {19, 15, 10, 5, 0}.
        assert_eq!(chain.intermediates.len(), 6);
        assert_eq!(seen_steps, (0..20).rev().collect::<Vec<_>>());
    }

    #[test]
    fn test_progressive_denoising_captures_predicted_start() {
        let device = Default::default();
        let d = diffusion(10);
        let cond = embedding_cond(&device);
        let route = DenoiseRoute::image(Some(CondRoute::Text));

        let chain = d
            .progressive_denoising(
                &ZeroDenoiser,
                &cond,
                &route,
                Shape::new([1, 1, 4, 4]),
                &device,
                SampleOptions {
                    log_every_t: Some(4),
                    ..Default::default()
                },
                None,
            )
            .unwrap();

        // Clipped predicted x_0 snapshots at t in {9, 8, 4, 0}.
        assert_eq!(chain.intermediates.len(), 4);
        for snapshot in &chain.intermediates {
            assert!(snapshot.to_data().value.iter().all(|v| (-1.0..=1.0).contains(v)));
        }
    }

    #[test]
    fn test_inpainting_keeps_reference_inside_mask() {
        let device = Default::default();
        let d = diffusion(10);
        let cond = embedding_cond(&device);
        let route = DenoiseRoute::image(Some(CondRoute::Text));

        let reference = Tensor::<TestBackend, 4>::full([1, 1, 2, 2], 0.5, &device);
        // Keep the reference everywhere: the final sample must equal the
        // reference forward-noised to t = 0, which is nearly clean.
        let mask = Tensor::<TestBackend, 4>::ones([1, 1, 2, 2], &device);
        let chain = d
            .p_sample_loop(
                &ZeroDenoiser,
                &cond,
                &route,
                Shape::new([1, 1, 2, 2]),
                &device,
                SampleOptions {
                    inpaint: Some(InpaintMask {
                        mask,
                        x_start: reference,
                    }),
                    ..Default::default()
                },
                None,
            )
            .unwrap();

        for v in chain.sample.to_data().value {
            assert!((v - 0.5).abs() < 0.1);
        }
    }

    /// Records the batch mean of every conditioning embedding it sees.
    struct CondMeanRecorder {
        means: std::cell::RefCell<Vec<f32>>,
    }

    impl Denoiser<TestBackend, 4> for CondMeanRecorder {
        fn forward(
            &self,
            latent: Tensor<TestBackend, 4>,
            _t: Tensor<TestBackend, 1, Int>,
            cond: &Conditioning<TestBackend>,
            _route: &DenoiseRoute,
        ) -> Tensor<TestBackend, 4> {
            if let Conditioning::Embedding(c) = cond {
                self.means.borrow_mut().push(c.clone().mean().into_scalar());
            }
            latent.zeros_like()
        }
    }

    #[test]
    fn test_shortened_schedule_compounds_conditioning_noise() {
        let device = Default::default();
        let d = diffusion(20);
        let recorder = CondMeanRecorder {
            means: std::cell::RefCell::new(Vec::new()),
        };
        let cond = Conditioning::Embedding(Tensor::ones([1, 8, 32], &device));
        let route = DenoiseRoute::image(Some(CondRoute::Text));
        // Constant conditioning timestep, so each step scales the previous
        // embedding by the same sqrt(acp) and adds fresh noise.
        let cond_ids = Tensor::<TestBackend, 1, Int>::full([20], 10, &device);

        d.p_sample_loop(
            &recorder,
            &cond,
            &route,
            Shape::new([1, 1, 4, 4]),
            &device,
            SampleOptions {
                cond_ids: Some(cond_ids),
                ..Default::default()
            },
            None,
        )
        .unwrap();

        // The re-noising compounds over the chain: a single application
        // leaves the mean near sqrt(acp[10]) of the all-ones embedding, but
        // twenty stacked applications decay it geometrically.
        let means = recorder.means.borrow();
        assert_eq!(means.len(), 20);
        assert!(means[0] > 0.9, "first step mean {}", means[0]);
        assert!(
            means[19] < 0.75 && means[19] < means[0],
            "last step mean {}",
            means[19]
        );
    }

    #[test]
    fn test_shortened_schedule_rejects_sequence_conditioning() {
        let device = Default::default();
        let d = diffusion(10);
        let cond = Conditioning::Sequences(vec![Tensor::<TestBackend, 2>::zeros([2, 4], &device)]);
        let route = DenoiseRoute::image(Some(CondRoute::Text));
        let cond_ids = Tensor::<TestBackend, 1, Int>::from_ints(
            [0, 1, 2, 3, 4, 5, 6, 7, 8, 9],
            &device,
        );

        let result = d.p_sample_loop(
            &ZeroDenoiser,
            &cond,
            &route,
            Shape::new([1, 1, 2, 2]),
            &device,
            SampleOptions {
                cond_ids: Some(cond_ids),
                ..Default::default()
            },
            None,
        );
        assert!(matches!(result, Err(DiffusionError::UnsupportedInput(_))));
    }
}
