//! Latent-diffusion pipelines.
//!
//! `LatentDiffusion` composes the diffusion core with the external
//! collaborators (denoiser, first-stage autoencoder, conditioning encoder)
//! and a conditioning strategy chosen at construction. Each variant is a
//! strategy value rather than a subclass; a pipeline only exposes the
//! operations its strategy supports.

pub mod params;

use burn::tensor::backend::Backend;
use burn::tensor::{Data, Int, Shape, Tensor};
use num_traits::ToPrimitive;
use serde::{Deserialize, Serialize};

use crate::conditioning::{
    CondRoute, CondStage, CondStageInput, Conditioning, DenoiseRoute, Denoiser, EncodeMode,
    EncoderPosterior, FirstStage, Modality,
};
use crate::diffusion::losses::LossBreakdown;
use crate::diffusion::sampling::{DenoiseChain, SampleOptions, StepCallback};
use crate::diffusion::{DiffusionConfig, GaussianDiffusion};
use crate::error::{DiffusionError, Result};
use crate::utils::noise_like;

/// Which conditioning paths the denoiser backbone exposes.
///
/// A pipeline validates every denoise route against its strategy before
/// calling the network, so a single-path backbone is never asked to pick an
/// attention path and a dual-path backbone is never called without one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditioningStrategy {
    /// Single cross-attention path over text embeddings.
    TextOnly,
    /// Two attention paths (text and vision); every call selects one, or a
    /// probabilistic blend of the two.
    DualCrossAttn,
    /// Separate image and text denoising branches, each with a selectable
    /// conditioning path.
    MultiModal,
}

impl ConditioningStrategy {
    pub fn validate_route(&self, route: &DenoiseRoute) -> Result<()> {
        if let Some(CondRoute::Blend(ratio)) = route.cond {
            // The Blend payload is constructible directly, so the range
            // check from the constructor is repeated here.
            CondRoute::blend(ratio)?;
        }
        let ok = match self {
            Self::TextOnly => route.latent == Modality::Image && route.cond.is_none(),
            Self::DualCrossAttn => route.latent == Modality::Image && route.cond.is_some(),
            Self::MultiModal => route.cond.is_some(),
        };
        if ok {
            Ok(())
        } else {
            Err(DiffusionError::unsupported(format!(
                "route {route:?} is not valid for the {self:?} strategy"
            )))
        }
    }
}

/// Latent-space normalization factor.
///
/// Either fixed at construction or calibrated exactly once from the first
/// encoded batch, then frozen. Calibration is a construction-phase step and
/// must not race with training steps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScaleFactor {
    Fixed(f64),
    /// Adaptive factor awaiting its one-time calibration.
    Uninitialized,
    /// Adaptive factor, set from the first batch and frozen.
    Calibrated(f64),
}

impl ScaleFactor {
    pub fn value(&self) -> Result<f64> {
        match self {
            Self::Fixed(f) | Self::Calibrated(f) => Ok(*f),
            Self::Uninitialized => Err(DiffusionError::config(
                "adaptive scale factor used before calibration",
            )),
        }
    }

    /// One-time transition `Uninitialized -> Calibrated` with `1 / std` of
    /// the first batch's encoded latents. A second calibration would rescale
    /// the latent space a second time, so it fails loudly.
    pub fn calibrate(&mut self, latent_std: f64) -> Result<f64> {
        match self {
            Self::Uninitialized => {
                if !latent_std.is_finite() || latent_std <= 0. {
                    return Err(DiffusionError::config(format!(
                        "latent standard deviation {latent_std} cannot calibrate a scale factor"
                    )));
                }
                let factor = 1. / latent_std;
                *self = Self::Calibrated(factor);
                Ok(factor)
            }
            Self::Calibrated(_) => Err(DiffusionError::config(
                "adaptive scale factor is already calibrated",
            )),
            Self::Fixed(_) => Err(DiffusionError::config(
                "fixed scale factor cannot be calibrated",
            )),
        }
    }
}

/// Serializable form of the scale-factor choice.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ScaleFactorConfig {
    Fixed(f64),
    AdaptiveFromFirstBatch,
}

impl Default for ScaleFactorConfig {
    fn default() -> Self {
        Self::Fixed(1.)
    }
}

impl From<ScaleFactorConfig> for ScaleFactor {
    fn from(config: ScaleFactorConfig) -> Self {
        match config {
            ScaleFactorConfig::Fixed(f) => Self::Fixed(f),
            ScaleFactorConfig::AdaptiveFromFirstBatch => Self::Uninitialized,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatentDiffusionConfig {
    pub diffusion: DiffusionConfig,
    pub strategy: ConditioningStrategy,
    pub scale_factor: ScaleFactorConfig,
    /// Number of distinct conditioning encodings over the chain; 1 means
    /// the clean conditioning is used at every timestep.
    pub num_timesteps_cond: usize,
}

impl Default for LatentDiffusionConfig {
    fn default() -> Self {
        Self {
            diffusion: DiffusionConfig::default(),
            strategy: ConditioningStrategy::TextOnly,
            scale_factor: ScaleFactorConfig::default(),
            num_timesteps_cond: 1,
        }
    }
}

/// Timestep-to-conditioning-index map for a shortened conditioning schedule:
/// the first `num_timesteps_cond` entries subsample `[0, T-1]` uniformly,
/// the remainder saturate at `T-1`.
pub fn make_cond_schedule(num_timesteps: usize, num_timesteps_cond: usize) -> Result<Vec<i32>> {
    if num_timesteps_cond == 0 || num_timesteps_cond > num_timesteps {
        return Err(DiffusionError::config(format!(
            "num_timesteps_cond {num_timesteps_cond} must be in [1, {num_timesteps}]"
        )));
    }
    let mut ids = vec![(num_timesteps - 1) as i32; num_timesteps];
    if num_timesteps_cond == 1 {
        ids[0] = 0;
        return Ok(ids);
    }
    let step = (num_timesteps - 1) as f64 / (num_timesteps_cond - 1) as f64;
    for (i, id) in ids.iter_mut().take(num_timesteps_cond).enumerate() {
        *id = (i as f64 * step).round() as i32;
    }
    Ok(ids)
}

/// A latent diffusion model: the diffusion core plus its collaborators.
///
/// `Dn` is the denoiser backbone, `Fs` the first-stage autoencoder, `Cs` the
/// text/vision conditioning encoder. Trait bounds sit on the operations that
/// need them, so a pipeline without a first stage simply never calls the
/// latent encode/decode surface.
#[derive(Debug)]
pub struct LatentDiffusion<B: Backend, Dn, Fs, Cs> {
    core: GaussianDiffusion<B>,
    denoiser: Dn,
    first_stage: Fs,
    cond_stage: Cs,
    strategy: ConditioningStrategy,
    scale_factor: ScaleFactor,
    cond_ids: Option<Tensor<B, 1, Int>>,
}

impl<B: Backend, Dn, Fs, Cs> LatentDiffusion<B, Dn, Fs, Cs> {
    pub fn new(
        config: &LatentDiffusionConfig,
        denoiser: Dn,
        first_stage: Fs,
        cond_stage: Cs,
        device: &B::Device,
    ) -> Result<Self> {
        let core = GaussianDiffusion::new(&config.diffusion, device)?;
        let ids = make_cond_schedule(core.num_timesteps(), config.num_timesteps_cond)?;
        let cond_ids = (config.num_timesteps_cond > 1).then(|| {
            let len = ids.len();
            Tensor::from_data(Data::new(ids, Shape::new([len])).convert(), device)
        });
        tracing::info!(
            strategy = ?config.strategy,
            num_timesteps_cond = config.num_timesteps_cond,
            "assembled latent diffusion pipeline"
        );
        Ok(Self {
            core,
            denoiser,
            first_stage,
            cond_stage,
            strategy: config.strategy,
            scale_factor: config.scale_factor.into(),
            cond_ids,
        })
    }

    pub fn core(&self) -> &GaussianDiffusion<B> {
        &self.core
    }

    pub fn strategy(&self) -> ConditioningStrategy {
        self.strategy
    }

    pub fn scale_factor(&self) -> ScaleFactor {
        self.scale_factor
    }

    pub fn cond_ids(&self) -> Option<&Tensor<B, 1, Int>> {
        self.cond_ids.as_ref()
    }

    /// Runs the denoiser once after validating the route against the
    /// pipeline's strategy.
    pub fn apply_model<const D: usize>(
        &self,
        latent: Tensor<B, D>,
        t: &Tensor<B, 1, Int>,
        cond: &Conditioning<B>,
        route: &DenoiseRoute,
    ) -> Result<Tensor<B, D>>
    where
        Dn: Denoiser<B, D>,
    {
        self.strategy.validate_route(route)?;
        Ok(self.denoiser.forward(latent, t.clone(), cond, route))
    }

    /// Training loss at the given per-sample timesteps.
    pub fn p_losses<const D: usize>(
        &self,
        x_start: Tensor<B, D>,
        cond: &Conditioning<B>,
        route: &DenoiseRoute,
        t: &Tensor<B, 1, Int>,
        noise: Option<Tensor<B, D>>,
    ) -> Result<LossBreakdown<B>>
    where
        Dn: Denoiser<B, D>,
    {
        let noise = noise.unwrap_or_else(|| noise_like(x_start.shape(), &x_start.device()));
        let x_noisy = self.core.q_sample(x_start.clone(), t, Some(noise.clone()));
        let model_output = self.apply_model(x_noisy, t, cond, route)?;
        let target = self.core.target_for(&x_start, &noise);
        Ok(self.core.assemble_losses(model_output, target, t))
    }

    /// Training entry: draws uniform timesteps and delegates to
    /// [`Self::p_losses`].
    pub fn forward<const D: usize>(
        &self,
        x_start: Tensor<B, D>,
        cond: &Conditioning<B>,
        route: &DenoiseRoute,
    ) -> Result<LossBreakdown<B>>
    where
        Dn: Denoiser<B, D>,
    {
        let t = self
            .core
            .sample_timesteps(x_start.dims()[0], &x_start.device());
        self.p_losses(x_start, cond, route, &t, None)
    }

    /// Full reverse chain from Gaussian noise (or a supplied start).
    /// Conditioning wider than the sampled batch is truncated to it.
    pub fn sample<const D: usize>(
        &self,
        cond: &Conditioning<B>,
        route: &DenoiseRoute,
        shape: Shape<D>,
        device: &B::Device,
        mut options: SampleOptions<B, D>,
        callback: Option<StepCallback<'_, B, D>>,
    ) -> Result<DenoiseChain<B, D>>
    where
        Dn: Denoiser<B, D>,
    {
        self.strategy.validate_route(route)?;
        let cond = cond.truncate(shape.dims[0]);
        if options.cond_ids.is_none() {
            options.cond_ids = self.cond_ids.clone();
        }
        self.core
            .p_sample_loop(&self.denoiser, &cond, route, shape, device, options, callback)
    }

    /// Like [`Self::sample`] but the captured intermediates are predicted
    /// clean latents.
    pub fn progressive<const D: usize>(
        &self,
        cond: &Conditioning<B>,
        route: &DenoiseRoute,
        shape: Shape<D>,
        device: &B::Device,
        mut options: SampleOptions<B, D>,
        callback: Option<StepCallback<'_, B, D>>,
    ) -> Result<DenoiseChain<B, D>>
    where
        Dn: Denoiser<B, D>,
    {
        self.strategy.validate_route(route)?;
        let cond = cond.truncate(shape.dims[0]);
        if options.cond_ids.is_none() {
            options.cond_ids = self.cond_ids.clone();
        }
        self.core.progressive_denoising(
            &self.denoiser,
            &cond,
            route,
            shape,
            device,
            options,
            callback,
        )
    }

    /// Encodes images to the normalized latent space, sampling the encoder
    /// posterior.
    pub fn encode_first_stage(&self, images: Tensor<B, 4>) -> Result<Tensor<B, 4>>
    where
        Fs: FirstStage<B>,
    {
        let z = self.first_stage.encode(images).sample();
        Ok(z.mul_scalar(self.scale_factor.value()?))
    }

    /// Decodes normalized latents back to images.
    pub fn decode_first_stage(&self, latents: Tensor<B, 4>) -> Result<Tensor<B, 4>>
    where
        Fs: FirstStage<B>,
    {
        let z = latents.div_scalar(self.scale_factor.value()?);
        Ok(self.first_stage.decode(z))
    }

    /// One-time adaptive scale-factor calibration from the first training
    /// batch. Construction-phase only.
    pub fn calibrate_scale_factor(&mut self, images: Tensor<B, 4>) -> Result<f64>
    where
        Fs: FirstStage<B>,
    {
        let z = self.first_stage.encode(images).sample();
        let std = z
            .flatten::<1>(0, 3)
            .var(0)
            .sqrt()
            .into_scalar()
            .to_f64()
            .unwrap_or(f64::NAN);
        let factor = self.scale_factor.calibrate(std)?;
        tracing::info!(scale_factor = factor, "calibrated latent scale factor");
        Ok(factor)
    }

    /// Encodes raw conditioning input, collapsing a distributional encoder
    /// to its mode.
    pub fn get_learned_conditioning(
        &self,
        input: &CondStageInput<B>,
        mode: EncodeMode,
    ) -> Conditioning<B>
    where
        Cs: CondStage<B>,
    {
        match self.cond_stage.encode(input, mode) {
            EncoderPosterior::Deterministic(c) => Conditioning::Embedding(c),
            EncoderPosterior::Gaussian(dist) => Conditioning::Embedding(dist.mode()),
        }
    }
}
