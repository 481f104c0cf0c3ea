//! Training-loss assembly.
//!
//! Combines the simple denoising loss with the timestep-reweighted
//! variational-lower-bound term, optionally under a learned heteroscedastic
//! log-variance.

use std::collections::BTreeMap;

use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor};
use num_traits::ToPrimitive;

use super::GaussianDiffusion;
use crate::schedulers::LossKind;
use crate::utils::mean_per_sample;

/// The assembled scalar loss plus named sub-losses for observability. The
/// total keeps its graph for the external optimizer; the named values are
/// detached scalars.
#[derive(Debug, Clone)]
pub struct LossBreakdown<B: Backend> {
    pub total: Tensor<B, 1>,
    pub named: BTreeMap<String, f64>,
}

fn scalar<B: Backend>(t: &Tensor<B, 1>) -> f64 {
    t.clone().into_scalar().to_f64().unwrap_or(f64::NAN)
}

impl<B: Backend> GaussianDiffusion<B> {
    /// Elementwise distance between prediction and target.
    pub(crate) fn elementwise_loss<const D: usize>(
        &self,
        prediction: Tensor<B, D>,
        target: Tensor<B, D>,
    ) -> Tensor<B, D> {
        match self.loss_kind {
            LossKind::L1 => (target - prediction).abs(),
            LossKind::L2 => {
                let diff = target - prediction;
                diff.clone() * diff
            }
        }
    }

    /// Builds the training loss from the network output and its target at
    /// the given per-sample timesteps.
    ///
    /// `loss = l_simple_weight * loss_simple (+ logvar correction)
    ///        + original_elbo_weight * loss_vlb`
    pub fn assemble_losses<const D: usize>(
        &self,
        model_output: Tensor<B, D>,
        target: Tensor<B, D>,
        t: &Tensor<B, 1, Int>,
    ) -> LossBreakdown<B> {
        let mut named = BTreeMap::new();

        let per_sample = mean_per_sample(self.elementwise_loss(model_output, target));
        let loss_simple = per_sample.clone().mean();
        named.insert("loss_simple".to_string(), scalar(&loss_simple));

        let weighted_simple = if self.learn_logvar {
            let logvar_t = self.logvar.clone().select(0, t.clone());
            let gamma = per_sample.clone() / logvar_t.clone().exp() + logvar_t;
            let loss_gamma = gamma.mean();
            named.insert("loss_gamma".to_string(), scalar(&loss_gamma));
            named.insert("logvar".to_string(), scalar(&self.logvar.clone().mean()));
            loss_gamma
        } else {
            loss_simple
        }
        .mul_scalar(self.l_simple_weight);

        let lvlb_t = self.schedule.lvlb_weights().clone().select(0, t.clone());
        let loss_vlb = (lvlb_t * per_sample).mean();
        named.insert("loss_vlb".to_string(), scalar(&loss_vlb));

        let total = weighted_simple + loss_vlb.mul_scalar(self.original_elbo_weight);
        named.insert("loss".to_string(), scalar(&total));

        LossBreakdown { total, named }
    }
}
