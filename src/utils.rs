use burn::tensor::backend::Backend;
use burn::tensor::{Distribution, Int, Shape, Tensor};

/// Gathers one scalar coefficient per batch element from a length-T schedule
/// buffer and reshapes the result so it broadcasts against a rank-D sample:
/// batch dimension preserved, every other dimension singleton.
pub(crate) fn extract_into_tensor<B: Backend, const D: usize>(
    coeffs: &Tensor<B, 1>,
    t: &Tensor<B, 1, Int>,
) -> Tensor<B, D> {
    let batch_size = t.dims()[0];
    let mut dims = [1usize; D];
    dims[0] = batch_size;
    coeffs.clone().select(0, t.clone()).reshape(Shape::new(dims))
}

/// Unit Gaussian noise of the given shape.
pub(crate) fn noise_like<B: Backend, const D: usize>(
    shape: Shape<D>,
    device: &B::Device,
) -> Tensor<B, D> {
    Tensor::random(shape, Distribution::Normal(0.0, 1.0), device)
}

/// Per-batch-element mean over all non-batch dimensions. For image latents
/// this reduces the three spatial dimensions, for text latents only the
/// sequence dimension.
pub(crate) fn mean_per_sample<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, 1> {
    let batch_size = x.dims()[0];
    x.reshape([batch_size as i32, -1]).mean_dim(1).squeeze(1)
}

/// Broadcastable `1.0` mask for every batch element with `t > 0`, `0.0` at
/// the terminal step where the reverse chain must not add noise.
pub(crate) fn nonzero_timestep_mask<B: Backend, const D: usize>(
    t: &Tensor<B, 1, Int>,
) -> Tensor<B, D> {
    let batch_size = t.dims()[0];
    let mut dims = [1usize; D];
    dims[0] = batch_size;
    t.clone().greater_elem(0).float().reshape(Shape::new(dims))
}
