//! Conditioning inputs and the collaborator seams of the diffusion core.
//!
//! The denoiser network, the first-stage autoencoder and the text/vision
//! encoder are external models; this module defines the traits they plug
//! into and the conditioning values exchanged across those seams.

pub mod distributions;

use std::collections::HashMap;

use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{DiffusionError, Result};

pub use distributions::DiagonalGaussian;

/// The latent type the denoiser operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Modality {
    Image,
    Text,
}

/// Which conditioning path the denoiser should attend to.
///
/// `Blend` carries a ratio in (0, 1) that the network interprets as a
/// probabilistic per-sample choice between the two attention paths; the
/// exact semantics belong to the denoiser, this core only validates the
/// range and passes the value through.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum CondRoute {
    Text,
    Vision,
    Blend(f64),
}

impl CondRoute {
    pub fn blend(ratio: f64) -> Result<Self> {
        if ratio > 0. && ratio < 1. {
            Ok(Self::Blend(ratio))
        } else {
            Err(DiffusionError::unsupported(format!(
                "blend ratio {ratio} is outside the open interval (0, 1)"
            )))
        }
    }
}

/// Fixed part of the `apply_model` signature contract: which latent type is
/// being denoised and, for multi-path denoisers, which conditioning path to
/// use.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DenoiseRoute {
    pub latent: Modality,
    pub cond: Option<CondRoute>,
}

impl DenoiseRoute {
    pub fn image(cond: Option<CondRoute>) -> Self {
        Self {
            latent: Modality::Image,
            cond,
        }
    }

    pub fn text(cond: Option<CondRoute>) -> Self {
        Self {
            latent: Modality::Text,
            cond,
        }
    }
}

/// Conditioning handed to the denoiser for one forward pass. Owned
/// transiently, never persisted.
#[derive(Debug, Clone)]
pub enum Conditioning<B: Backend> {
    /// A flat embedding batch, `[batch, seq, dim]`.
    Embedding(Tensor<B, 3>),
    /// Named embeddings for denoisers with several conditioning inputs.
    Named(HashMap<String, Tensor<B, 3>>),
    /// Per-sample token or embedding sequences of varying length.
    Sequences(Vec<Tensor<B, 2>>),
}

impl<B: Backend> Conditioning<B> {
    /// Restricts the conditioning to the first `batch_size` samples.
    pub fn truncate(&self, batch_size: usize) -> Self {
        match self {
            Self::Embedding(c) => {
                let b = c.dims()[0].min(batch_size);
                Self::Embedding(c.clone().slice([0..b]))
            }
            Self::Named(map) => Self::Named(
                map.iter()
                    .map(|(k, c)| {
                        let b = c.dims()[0].min(batch_size);
                        (k.clone(), c.clone().slice([0..b]))
                    })
                    .collect(),
            ),
            Self::Sequences(seqs) => {
                Self::Sequences(seqs.iter().take(batch_size).cloned().collect())
            }
        }
    }
}

/// Output of an encoder: either a point estimate or a diagonal Gaussian
/// posterior over the latent.
#[derive(Debug, Clone)]
pub enum EncoderPosterior<B: Backend, const D: usize> {
    Deterministic(Tensor<B, D>),
    Gaussian(DiagonalGaussian<B, D>),
}

impl<B: Backend, const D: usize> EncoderPosterior<B, D> {
    /// Draws a sample; used on training paths.
    pub fn sample(&self) -> Tensor<B, D> {
        match self {
            Self::Deterministic(z) => z.clone(),
            Self::Gaussian(dist) => dist.sample(),
        }
    }

    /// Collapses to the mode; used for deterministic conditioning.
    pub fn mode(&self) -> Tensor<B, D> {
        match self {
            Self::Deterministic(z) => z.clone(),
            Self::Gaussian(dist) => dist.mode(),
        }
    }
}

/// The denoiser network backbone. Returns a tensor of the same shape as the
/// noisy latent: predicted noise or predicted clean signal depending on the
/// configured parameterization.
pub trait Denoiser<B: Backend, const D: usize> {
    fn forward(
        &self,
        latent: Tensor<B, D>,
        t: Tensor<B, 1, Int>,
        cond: &Conditioning<B>,
        route: &DenoiseRoute,
    ) -> Tensor<B, D>;
}

/// First-stage autoencoder mapping raw images to latents and back.
pub trait FirstStage<B: Backend> {
    fn encode(&self, images: Tensor<B, 4>) -> EncoderPosterior<B, 4>;
    fn decode(&self, latents: Tensor<B, 4>) -> Tensor<B, 4>;
}

/// Encoder mode, passed explicitly per call instead of being swapped on the
/// collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncodeMode {
    Text,
    Vision,
}

/// Raw conditioning input for the conditioning-stage encoder.
#[derive(Debug, Clone)]
pub enum CondStageInput<B: Backend> {
    /// One prompt per batch element.
    Text(Vec<String>),
    /// One HWC image per batch element, channel range [0, 1].
    Images(Vec<Tensor<B, 3>>),
}

/// Text/vision conditioning encoder collaborator.
pub trait CondStage<B: Backend> {
    fn encode(&self, input: &CondStageInput<B>, mode: EncodeMode) -> EncoderPosterior<B, 3>;
}

/// Turns a `[-1, 1]` NCHW image batch into the per-sample HWC sequence in
/// `[0, 1]` that vision encoders consume.
pub fn vision_batch_to_hwc<B: Backend>(batch: Tensor<B, 4>) -> Vec<Tensor<B, 3>> {
    let [batch_size, _, _, _] = batch.dims();
    let batch = batch.add_scalar(1.0).div_scalar(2.0);
    (0..batch_size)
        .map(|i| {
            batch
                .clone()
                .slice([i..i + 1])
                .squeeze::<3>(0)
                // CHW -> HWC
                .swap_dims(0, 1)
                .swap_dims(1, 2)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::{Data, Shape};

    type TestBackend = burn_ndarray::NdArray<f32>;

    #[test]
    fn test_blend_ratio_validation() {
        assert!(CondRoute::blend(0.5).is_ok());
        for ratio in [0.0, 1.0, -0.3, 2.0] {
            assert!(matches!(
                CondRoute::blend(ratio),
                Err(DiffusionError::UnsupportedInput(_))
            ));
        }
    }

    #[test]
    fn test_vision_batch_to_hwc() {
        let device = Default::default();
        // [1, 2, 1, 2]: channel 0 = [-1, 0], channel 1 = [1, -1].
        let batch = Tensor::<TestBackend, 4>::from_floats(
            [[[[-1.0, 0.0]], [[1.0, -1.0]]]],
            &device,
        );
        let samples = vision_batch_to_hwc(batch);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].shape(), Shape::from([1, 2, 2]));
        samples[0]
            .to_data()
            .assert_approx_eq(&Data::from([[[0.0, 1.0], [0.5, 0.0]]]), 4);
    }

    #[test]
    fn test_conditioning_truncate() {
        let device = Default::default();
        let c = Conditioning::Embedding(Tensor::<TestBackend, 3>::zeros([4, 2, 8], &device));
        match c.truncate(2) {
            Conditioning::Embedding(t) => assert_eq!(t.dims(), [2, 2, 8]),
            _ => unreachable!(),
        }

        let seqs = Conditioning::Sequences(vec![
            Tensor::<TestBackend, 2>::zeros([3, 8], &device),
            Tensor::<TestBackend, 2>::zeros([5, 8], &device),
            Tensor::<TestBackend, 2>::zeros([2, 8], &device),
        ]);
        match seqs.truncate(2) {
            Conditioning::Sequences(s) => assert_eq!(s.len(), 2),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_encoder_posterior_mode_vs_sample() {
        let device = Default::default();
        let z = Tensor::<TestBackend, 3>::from_floats([[[1.0, 2.0]]], &device);
        let posterior = EncoderPosterior::Deterministic(z.clone());
        posterior
            .mode()
            .to_data()
            .assert_approx_eq(&z.to_data(), 5);
        posterior
            .sample()
            .to_data()
            .assert_approx_eq(&z.to_data(), 5);
    }
}
