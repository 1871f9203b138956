//! Convolutional networks used by the pipeline models.
//!
//! All networks are plain candle modules built from a [`VarBuilder`]:
//! trainable ones from a `VarMap`, frozen ones from detached tensors.

pub mod attribute;
pub mod discriminator;
pub mod generator;
pub mod perceptual;
pub mod vunet;

pub use attribute::{AttributeEncoderNet, AttributeNetConfig, AttributeOutput};
pub use discriminator::{DiscriminatorConfig, NLayerDiscriminator};
pub use generator::{UnetConfig, UnetGenerator};
pub use perceptual::{FeatureExtractor, PerceptualConfig};
pub use vunet::{VariationalUnet, VariationalUnetConfig, VunetOutput};

use candle_core::{Module, Result, Tensor};
use candle_nn::{
    batch_norm, conv2d, conv_transpose2d, BatchNorm, Conv2d, Conv2dConfig, ConvTranspose2d,
    ConvTranspose2dConfig, ModuleT, VarBuilder,
};

/// Nonlinearity applied after a convolution block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Relu,
    /// Slope 0.2
    LeakyRelu,
    Tanh,
    Identity,
}

impl Activation {
    pub fn apply(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Activation::Relu => x.relu(),
            Activation::LeakyRelu => candle_nn::ops::leaky_relu(x, 0.2),
            Activation::Tanh => x.tanh(),
            Activation::Identity => Ok(x.clone()),
        }
    }
}

/// Convolution, optional batch norm, activation
pub struct ConvBlock {
    conv: Conv2d,
    bn: Option<BatchNorm>,
    act: Activation,
}

impl ConvBlock {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
        norm: bool,
        act: Activation,
        vb: VarBuilder,
    ) -> Result<Self> {
        let config = Conv2dConfig {
            padding,
            stride,
            ..Default::default()
        };
        let conv = conv2d(in_channels, out_channels, kernel, config, vb.pp("conv"))?;
        let bn = if norm {
            Some(batch_norm(out_channels, 1e-5, vb.pp("bn"))?)
        } else {
            None
        };
        Ok(Self { conv, bn, act })
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let x = self.conv.forward(x)?;
        let x = match &self.bn {
            Some(bn) => bn.forward_t(&x, train)?,
            None => x,
        };
        self.act.apply(&x)
    }
}

/// Stride-2 transposed convolution doubling the spatial size
pub struct UpBlock {
    deconv: ConvTranspose2d,
    bn: Option<BatchNorm>,
    act: Activation,
}

impl UpBlock {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        norm: bool,
        act: Activation,
        vb: VarBuilder,
    ) -> Result<Self> {
        let config = ConvTranspose2dConfig {
            padding: 1,
            stride: 2,
            ..Default::default()
        };
        let deconv = conv_transpose2d(in_channels, out_channels, 4, config, vb.pp("deconv"))?;
        let bn = if norm {
            Some(batch_norm(out_channels, 1e-5, vb.pp("bn"))?)
        } else {
            None
        };
        Ok(Self { deconv, bn, act })
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let x = self.deconv.forward(x)?;
        let x = match &self.bn {
            Some(bn) => bn.forward_t(&x, train)?,
            None => x,
        };
        self.act.apply(&x)
    }
}
