use crate::distributions::{standard_normal_log_prob, Normal};
use crate::model::layers::{HeadActivation, OutputHead};
use crate::model::{center_crop, ModelConfig};
use burn::module::Param;
use burn::nn::conv::{ConvTranspose2d, ConvTranspose2dConfig};
use burn::prelude::*;
use burn::tensor::activation::{leaky_relu, softplus};

/// Image and expression parameters decoded from a latent code.
#[derive(Clone, Debug)]
pub struct Decoded<B: Backend> {
    /// [1, 3, H, W] in (0, 1).
    pub image_mean: Tensor<B, 4>,
    /// [1, 3, H, W], positive.
    pub image_scale: Tensor<B, 4>,
    /// [1, G, H, W] per-pixel log expression rate.
    pub log_rate: Tensor<B, 4>,
    /// [1, G, 1, 1] Negative-Binomial logit per gene.
    pub logit: Tensor<B, 4>,
}

impl<B: Backend> Decoded<B> {
    /// Center-crop the spatial outputs to `[height, width]`.
    pub fn center_crop(self, [height, width]: [usize; 2]) -> Self {
        let target = [None, None, Some(height), Some(width)];
        Self {
            image_mean: center_crop(self.image_mean, target),
            image_scale: center_crop(self.image_scale, target),
            log_rate: center_crop(self.log_rate, target),
            logit: self.logit,
        }
    }
}

/// Variational model over a spatial latent code decoding into a histology
/// image and per-pixel gene expression rates.
#[derive(Module, Debug)]
pub struct Histonet<B: Backend> {
    z_mu: Param<Tensor<B, 4>>,
    z_sd: Param<Tensor<B, 4>>,
    decoder: Vec<ConvTranspose2d<B>>,
    img_mu: OutputHead<B>,
    img_sd: OutputHead<B>,
    lrate: OutputHead<B>,
    logit_mu: Param<Tensor<B, 4>>,
    logit_sd: Param<Tensor<B, 4>>,
    #[module(ignore)]
    image_shape: [usize; 2],
}

impl ModelConfig {
    /// Spatial size of the latent grid: one cell per 16x16 image block.
    pub fn latent_shape(&self) -> [usize; 4] {
        [
            1,
            self.latent_size,
            self.image_height.div_ceil(16),
            self.image_width.div_ceil(16),
        ]
    }

    /// Initialize the model on the given device.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Histonet<B> {
        let nf = self.nf;
        let latent_shape = self.latent_shape();
        let gene_shape = [1, self.num_genes, 1, 1];

        let decoder = vec![
            dec_conv(self.latent_size, 16 * nf, 1, 0, device),
            dec_conv(16 * nf, 8 * nf, 2, 1, device),
            dec_conv(8 * nf, 4 * nf, 2, 1, device),
            dec_conv(4 * nf, 2 * nf, 2, 1, device),
            dec_conv(2 * nf, nf, 2, 1, device),
        ];

        Histonet {
            z_mu: Param::from_tensor(Tensor::zeros(latent_shape, device)),
            z_sd: Param::from_tensor(Tensor::zeros(latent_shape, device)),
            decoder,
            img_mu: OutputHead::new(nf, 3, HeadActivation::Sigmoid, device),
            img_sd: OutputHead::new(nf, 3, HeadActivation::Softplus, device),
            lrate: OutputHead::new(nf, self.num_genes, HeadActivation::Identity, device),
            logit_mu: Param::from_tensor(Tensor::zeros(gene_shape, device)),
            logit_sd: Param::from_tensor(Tensor::zeros(gene_shape, device)),
            image_shape: [self.image_height, self.image_width],
        }
    }
}

impl<B: Backend> Histonet<B> {
    pub fn image_shape(&self) -> [usize; 2] {
        self.image_shape
    }

    pub fn latent_shape(&self) -> [usize; 4] {
        self.z_mu.val().dims()
    }

    /// Approximate posterior over the latent code.
    pub fn posterior(&self) -> Normal<B, 4> {
        Normal::new(self.z_mu.val(), softplus(self.z_sd.val(), 1.0))
    }

    /// Approximate posterior over the per-gene logit.
    pub fn logit_posterior(&self) -> Normal<B, 4> {
        Normal::new(self.logit_mu.val(), softplus(self.logit_sd.val(), 1.0))
    }

    /// Decode a latent code; the spatial outputs are not cropped.
    pub fn decode(&self, z: Tensor<B, 4>) -> Decoded<B> {
        let last = self.decoder.len() - 1;
        let mut state = z;
        for (idx, layer) in self.decoder.iter().enumerate() {
            state = layer.forward(state);
            if idx != last {
                state = leaky_relu(state, 0.2);
            }
        }

        Decoded {
            image_mean: self.img_mu.forward(state.clone()),
            image_scale: self.img_sd.forward(state.clone()),
            log_rate: self.lrate.forward(state),
            logit: self.logit_posterior().rsample(),
        }
    }

    /// Sample a latent code from the posterior and decode it, cropped to the
    /// observed image shape. Returns `(z, decoded)`.
    pub fn forward(&self) -> (Tensor<B, 4>, Decoded<B>) {
        let z = self.posterior().rsample();
        let decoded = self.decode(z.clone()).center_crop(self.image_shape);
        (z, decoded)
    }

    /// Single-sample estimate of the KL divergence of both posteriors from
    /// their standard-normal priors, evaluated at the drawn `z` and `logit`.
    pub fn kl_divergence(&self, z: Tensor<B, 4>, logit: Tensor<B, 4>) -> Tensor<B, 1> {
        let z_term = self
            .posterior()
            .log_prob(z.clone())
            .sub(standard_normal_log_prob(z))
            .sum();
        let logit_term = self
            .logit_posterior()
            .log_prob(logit.clone())
            .sub(standard_normal_log_prob(logit))
            .sum();
        z_term.add(logit_term)
    }
}

fn dec_conv<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    stride: usize,
    padding: usize,
    device: &B::Device,
) -> ConvTranspose2d<B> {
    ConvTranspose2dConfig::new([in_channels, out_channels], [4, 4])
        .with_stride([stride, stride])
        .with_padding([padding, padding])
        .with_bias(true)
        .init(device)
}
