use burn::module::Ignored;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::PaddingConfig2d;
use burn::prelude::*;
use burn::tensor::activation::{leaky_relu, sigmoid, softplus};

/// Output nonlinearity applied by an [`OutputHead`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeadActivation {
    Identity,
    Sigmoid,
    Softplus,
}

/// Two 3x3 convolutions mapping decoder features to one output quantity.
#[derive(Module, Debug)]
pub struct OutputHead<B: Backend> {
    hidden: Conv2d<B>,
    output: Conv2d<B>,
    activation: Ignored<HeadActivation>,
}

impl<B: Backend> OutputHead<B> {
    pub fn new(
        channels: usize,
        out_channels: usize,
        activation: HeadActivation,
        device: &B::Device,
    ) -> Self {
        Self {
            hidden: conv3x3(channels, channels, device),
            output: conv3x3(channels, out_channels, device),
            activation: Ignored(activation),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = leaky_relu(self.hidden.forward(x), 0.2);
        let x = self.output.forward(x);
        match *self.activation {
            HeadActivation::Identity => x,
            HeadActivation::Sigmoid => sigmoid(x),
            HeadActivation::Softplus => softplus(x, 1.0),
        }
    }
}

fn conv3x3<B: Backend>(in_channels: usize, out_channels: usize, device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out_channels], [3, 3])
        .with_stride([1, 1])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .with_bias(true)
        .init(device)
}
