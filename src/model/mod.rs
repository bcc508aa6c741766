pub mod histonet;
pub mod layers;

use crate::data::SlideTensors;
use crate::distributions::{NegativeBinomial, Normal};
use burn::prelude::*;
use burn::tensor::activation::sigmoid;
use burn::tensor::TensorData;

pub use histonet::{Decoded, Histonet};

/// Floor added to every per-segment rate.
pub const RATE_FLOOR: f64 = 1e-10;
/// Floor on the decoded image scale.
pub const SCALE_FLOOR: f64 = 1e-6;

/// Hyperparameters of the [`Histonet`] model.
#[derive(Config, Debug)]
pub struct ModelConfig {
    pub latent_size: usize,
    pub num_genes: usize,
    pub image_height: usize,
    pub image_width: usize,
    /// Feature width of the last decoder layer.
    #[config(default = 64)]
    pub nf: usize,
}

/// Loss and the intermediate tensors used for diagnostics.
#[derive(Debug)]
pub struct ElboTerms<B: Backend> {
    pub loss: Tensor<B, 1>,
    pub dkl: Tensor<B, 1>,
    /// [1, G, N] log-density of each observed count.
    pub expression_ll: Tensor<B, 3>,
    /// [1, 3, H, W] log-density of each observed pixel.
    pub image_ll: Tensor<B, 4>,
    /// [1, G, N] Negative-Binomial mean.
    pub expression_mean: Tensor<B, 3>,
    pub observed_counts: Tensor<B, 3>,
}

impl<B: Backend> ElboTerms<B> {
    /// Named diagnostics, reduced on the device.
    pub fn diagnostics(&self) -> Vec<(&'static str, TensorData)> {
        let rmse = self
            .expression_mean
            .clone()
            .sub(self.observed_counts.clone())
            .square()
            .mean()
            .sqrt();
        vec![
            ("loss", self.loss.clone().into_data()),
            ("p(lab|z)", self.expression_ll.clone().exp().mean().into_data()),
            ("rmse", rmse.into_data()),
            ("p(img|z)", sigmoid(self.image_ll.clone()).mean().into_data()),
            ("dqp", self.dkl.clone().into_data()),
        ]
    }
}

/// Negative ELBO of the observed slide given decoded parameters.
///
/// `decoded` must already be cropped to the observed image shape. Per-pixel
/// rates are summed into per-segment rates through the label membership
/// matrix, with the background column dropped.
pub fn elbo_terms<B: Backend>(
    decoded: Decoded<B>,
    observed: &SlideTensors<B>,
    dkl: Tensor<B, 1>,
    kl_weight: f64,
) -> ElboTerms<B> {
    let Decoded {
        image_mean,
        image_scale,
        log_rate,
        logit,
    } = decoded;

    let image_ll = Normal::new(image_mean, image_scale.clamp_min(SCALE_FLOOR))
        .log_prob(observed.image.clone());

    let [batch, genes, height, width] = log_rate.dims();
    let segments = observed.counts.dims()[2];
    let rates = log_rate
        .exp()
        .reshape([batch, genes, height * width])
        .matmul(observed.membership.clone())
        .slice_dim(2, 1..segments + 1)
        .add_scalar(RATE_FLOOR);
    let logits = logit.reshape([batch, genes, 1]).repeat(&[1, 1, segments]);

    let expression = NegativeBinomial::new(rates, logits);
    let expression_ll = expression.log_prob(observed.counts.clone());
    let expression_mean = expression.mean();

    let loss = expression_ll
        .clone()
        .sum()
        .add(image_ll.clone().sum())
        .neg()
        .add(dkl.clone().mul_scalar(kl_weight));

    ElboTerms {
        loss,
        dkl,
        expression_ll,
        image_ll,
        expression_mean,
        observed_counts: observed.counts.clone(),
    }
}

/// Crop `tensor` around its center. `None` keeps an axis whole.
///
/// The crop offset on each axis is `(size - target) / 2`; the target must
/// not exceed the tensor size.
pub fn center_crop<B: Backend, const D: usize>(
    tensor: Tensor<B, D>,
    target: [Option<usize>; D],
) -> Tensor<B, D> {
    let dims = tensor.dims();
    target
        .iter()
        .enumerate()
        .fold(tensor, |tensor, (axis, size)| match size {
            Some(size) => {
                let start = dims[axis].saturating_sub(*size) / 2;
                let end = (start + size).min(dims[axis]);
                tensor.slice_dim(axis, start..end)
            }
            None => tensor,
        })
}
