//! PatchGAN discriminator.

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

use super::{Activation, ConvBlock};

/// Discriminator configuration
#[derive(Debug, Clone)]
pub struct DiscriminatorConfig {
    pub input_nc: usize,
    pub ndf: usize,
    /// Number of stride-2 stages
    pub n_layers: usize,
}

impl Default for DiscriminatorConfig {
    fn default() -> Self {
        Self {
            input_nc: 3,
            ndf: 64,
            n_layers: 3,
        }
    }
}

/// Fully convolutional critic producing one raw score per receptive field.
///
/// Inputs need sides of at least `2^(n_layers + 2)` pixels so the two
/// trailing 4x4 stride-1 stages keep a positive extent.
pub struct NLayerDiscriminator {
    layers: Vec<ConvBlock>,
}

impl NLayerDiscriminator {
    pub fn new(config: &DiscriminatorConfig, vb: VarBuilder) -> Result<Self> {
        let mut layers = Vec::with_capacity(config.n_layers + 2);
        layers.push(ConvBlock::new(
            config.input_nc,
            config.ndf,
            4,
            2,
            1,
            false,
            Activation::LeakyRelu,
            vb.pp("layer_0"),
        )?);

        let mut prev = config.ndf;
        for n in 1..=config.n_layers {
            let next = config.ndf * (1usize << n).min(8);
            let stride = if n == config.n_layers { 1 } else { 2 };
            layers.push(ConvBlock::new(
                prev,
                next,
                4,
                stride,
                1,
                true,
                Activation::LeakyRelu,
                vb.pp(format!("layer_{n}")),
            )?);
            prev = next;
        }

        layers.push(ConvBlock::new(
            prev,
            1,
            4,
            1,
            1,
            false,
            Activation::Identity,
            vb.pp("score"),
        )?);
        Ok(Self { layers })
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let mut h = x.clone();
        for layer in &self.layers {
            h = layer.forward_t(&h, train)?;
        }
        Ok(h)
    }
}
