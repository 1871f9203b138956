//! Frozen convolutional feature extractor for perceptual losses.
//!
//! The extractor is never trained: its weights are either loaded from a
//! safetensors file or drawn once from a seeded generator, and are held as
//! plain tensors so no gradient is ever accumulated for them. Gradients do
//! flow through it to the images being compared.

use std::collections::HashMap;

use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, VarBuilder};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::losses::{gram_matrix, l1_loss};

/// Feature extractor configuration
#[derive(Debug, Clone)]
pub struct PerceptualConfig {
    /// Output channels of each block; blocks after the first halve the resolution
    pub channels: Vec<usize>,
    /// Weight of each block's term in the content and style losses
    pub layer_weights: Vec<f64>,
    /// Seed of the random initialization
    pub seed: u64,
}

impl Default for PerceptualConfig {
    fn default() -> Self {
        Self {
            channels: vec![16, 32, 64, 64],
            layer_weights: vec![1.0 / 8.0, 1.0 / 4.0, 1.0 / 2.0, 1.0],
            seed: 0,
        }
    }
}

struct FeatureBlock {
    conv1: Conv2d,
    conv2: Conv2d,
}

pub struct FeatureExtractor {
    blocks: Vec<FeatureBlock>,
    config: PerceptualConfig,
}

impl FeatureExtractor {
    /// Build from named tensors (`block_{i}.conv{1,2}.{weight,bias}`)
    pub fn from_tensors(tensors: HashMap<String, Tensor>, config: PerceptualConfig, device: &Device) -> Result<Self> {
        let tensors = tensors.into_iter().map(|(k, v)| (k, v.detach())).collect();
        let vb = VarBuilder::from_tensors(tensors, DType::F32, device);
        let conv_cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };

        let mut blocks = Vec::with_capacity(config.channels.len());
        let mut in_c = 3;
        for (i, &c) in config.channels.iter().enumerate() {
            let vb = vb.pp(format!("block_{i}"));
            blocks.push(FeatureBlock {
                conv1: conv2d(in_c, c, 3, conv_cfg, vb.pp("conv1"))?,
                conv2: conv2d(c, c, 3, conv_cfg, vb.pp("conv2"))?,
            });
            in_c = c;
        }
        Ok(Self { blocks, config })
    }

    /// Draw uniform He-style weights from a generator seeded with `config.seed`
    pub fn seeded(config: PerceptualConfig, device: &Device) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut tensors = HashMap::new();
        let mut in_c = 3;
        for (i, &c) in config.channels.iter().enumerate() {
            for (name, fan_in_c) in [("conv1", in_c), ("conv2", c)] {
                let fan_in = fan_in_c * 9;
                let bound = (6.0 / fan_in as f32).sqrt();
                let weights: Vec<f32> = (0..c * fan_in).map(|_| rng.gen_range(-bound..bound)).collect();
                tensors.insert(
                    format!("block_{i}.{name}.weight"),
                    Tensor::from_vec(weights, (c, fan_in_c, 3, 3), device)?,
                );
                tensors.insert(
                    format!("block_{i}.{name}.bias"),
                    Tensor::zeros(c, DType::F32, device)?,
                );
            }
            in_c = c;
        }
        Self::from_tensors(tensors, config, device)
    }

    /// Per-block feature maps of `x` (B, 3, H, W) in ImageNet normalization
    pub fn features(&self, x: &Tensor) -> Result<Vec<Tensor>> {
        let mut feats = Vec::with_capacity(self.blocks.len());
        let mut h = x.clone();
        for (i, block) in self.blocks.iter().enumerate() {
            if i > 0 {
                h = h.avg_pool2d(2)?;
            }
            h = block.conv1.forward(&h)?.relu()?;
            h = block.conv2.forward(&h)?.relu()?;
            feats.push(h.clone());
        }
        Ok(feats)
    }

    /// Weighted L1 distance between features; the target side is detached
    pub fn content_loss(&self, x: &Tensor, target: &Tensor) -> Result<Tensor> {
        let fx = self.features(x)?;
        let fy = self.features(&target.detach())?;
        self.weighted_sum(&fx, &fy, |a, b| l1_loss(a, &b.detach()))
    }

    /// Weighted MSE between Gram matrices of the features
    pub fn style_loss(&self, x: &Tensor, target: &Tensor) -> Result<Tensor> {
        let fx = self.features(x)?;
        let fy = self.features(&target.detach())?;
        self.weighted_sum(&fx, &fy, |a, b| {
            candle_nn::loss::mse(&gram_matrix(a)?, &gram_matrix(b)?.detach())
        })
    }

    fn weighted_sum<F>(&self, fx: &[Tensor], fy: &[Tensor], term: F) -> Result<Tensor>
    where
        F: Fn(&Tensor, &Tensor) -> Result<Tensor>,
    {
        let mut total: Option<Tensor> = None;
        for ((a, b), w) in fx.iter().zip(fy).zip(&self.config.layer_weights) {
            let t = (term(a, b)? * *w)?;
            total = Some(match total {
                Some(acc) => (acc + t)?,
                None => t,
            });
        }
        total.ok_or_else(|| candle_core::Error::Msg("feature extractor has no blocks".into()))
    }

    pub fn config(&self) -> &PerceptualConfig {
        &self.config
    }
}
