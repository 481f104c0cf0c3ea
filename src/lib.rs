//! # Latent diffusion core
//!
//! A Rust implementation of the denoising diffusion probabilistic model
//! mathematics behind Stable-Diffusion-style generative models, using
//! [Burn](https://github.com/tracel-ai/burn): noise-schedule construction,
//! the forward and reverse Markov chains, training-loss assembly and
//! multi-modal conditioning dispatch. The denoiser backbone, autoencoder and
//! text/vision encoders are external collaborators plugged in through the
//! traits in [`conditioning`].

pub mod conditioning;
pub mod diffusion;
pub mod error;
pub mod pipelines;
pub mod schedulers;
pub mod utils;

pub use conditioning::{
    CondRoute, CondStage, CondStageInput, Conditioning, DenoiseRoute, Denoiser, DiagonalGaussian,
    EncodeMode, EncoderPosterior, FirstStage, Modality,
};
pub use diffusion::losses::LossBreakdown;
pub use diffusion::sampling::{DenoiseChain, InpaintMask, SampleOptions};
pub use diffusion::{DiffusionConfig, GaussianDiffusion};
pub use error::{DiffusionError, Result};
pub use pipelines::{
    ConditioningStrategy, LatentDiffusion, LatentDiffusionConfig, ScaleFactor, ScaleFactorConfig,
};
pub use schedulers::{
    BetaSchedule, LossKind, NoiseSchedule, Parameterization, ScheduleConfig,
};
