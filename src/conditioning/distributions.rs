//! Diagonal Gaussian posterior produced by distributional encoders.

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use crate::utils::noise_like;

/// Factorized Gaussian over a latent tensor, parameterized by mean and
/// log-variance. The log-variance is clamped to [-30, 20] at construction to
/// keep `exp` finite.
#[derive(Debug, Clone)]
pub struct DiagonalGaussian<B: Backend, const D: usize> {
    mean: Tensor<B, D>,
    logvar: Tensor<B, D>,
}

impl<B: Backend, const D: usize> DiagonalGaussian<B, D> {
    pub fn new(mean: Tensor<B, D>, logvar: Tensor<B, D>) -> Self {
        Self {
            mean,
            logvar: logvar.clamp(-30.0, 20.0),
        }
    }

    /// Splits a moments tensor into mean and log-variance halves along `dim`.
    pub fn from_moments(moments: Tensor<B, D>, dim: usize) -> Self {
        let mut chunks = moments.chunk(2, dim);
        let logvar = chunks.pop().expect("moments tensor splits in two");
        let mean = chunks.pop().expect("moments tensor splits in two");
        Self::new(mean, logvar)
    }

    /// Draws one reparameterized sample.
    pub fn sample(&self) -> Tensor<B, D> {
        let std = self.logvar.clone().mul_scalar(0.5).exp();
        let noise = noise_like(self.mean.shape(), &self.mean.device());
        self.mean.clone() + std * noise
    }

    /// The distribution mode, i.e. the mean.
    pub fn mode(&self) -> Tensor<B, D> {
        self.mean.clone()
    }

    /// Per-sample KL divergence to the standard normal.
    pub fn kl(&self) -> Tensor<B, 1> {
        let var = self.logvar.clone().exp();
        let term = self.mean.clone() * self.mean.clone() + var - self.logvar.clone() - 1.0;
        let batch_size = term.dims()[0];
        term.reshape([batch_size as i32, -1])
            .sum_dim(1)
            .squeeze::<1>(1)
            .mul_scalar(0.5)
    }
}

/// Elementwise KL divergence between `N(mean, exp(logvar))` and the standard
/// normal, in nats.
pub(crate) fn kl_to_standard_normal<B: Backend, const D: usize>(
    mean: Tensor<B, D>,
    logvar: Tensor<B, D>,
) -> Tensor<B, D> {
    (mean.clone() * mean + logvar.clone().exp() - logvar - 1.0).mul_scalar(0.5)
}
