//! Attribute encoder network: CNN trunk, global average pooling, linear heads.

use candle_core::{Module, Result, Tensor};
use candle_nn::{linear, Linear, VarBuilder};

use atelier_core::AttributeConfig;

use super::{Activation, ConvBlock};

/// Attribute encoder configuration
#[derive(Debug, Clone)]
pub struct AttributeNetConfig {
    pub input_nc: usize,
    /// Landmark heatmap channels concatenated to the image, 0 when unused
    pub lm_nc: usize,
    pub nf: usize,
    pub n_layers: usize,
    pub n_attr: usize,
    /// Category classes of the joint head, 0 when unused
    pub n_cat: usize,
}

impl From<&AttributeConfig> for AttributeNetConfig {
    fn from(cfg: &AttributeConfig) -> Self {
        Self {
            input_nc: cfg.input_nc,
            lm_nc: if cfg.input_lm { cfg.lm_input_nc } else { 0 },
            nf: cfg.nf,
            n_layers: cfg.n_layers,
            n_attr: cfg.n_attr,
            n_cat: if cfg.joint_cat { cfg.n_cat } else { 0 },
        }
    }
}

impl AttributeNetConfig {
    /// Width of the pooled feature vector
    pub fn feat_dim(&self) -> usize {
        (0..self.n_layers).fold(self.nf, |c, _| (c * 2).min(512))
    }
}

/// Pooled features and raw head outputs
#[derive(Debug, Clone)]
pub struct AttributeOutput {
    /// (B, feat_dim)
    pub features: Tensor,
    /// (B, n_attr)
    pub attr_logits: Tensor,
    /// (B, n_cat)
    pub cat_logits: Option<Tensor>,
}

pub struct AttributeEncoderNet {
    trunk: Vec<ConvBlock>,
    attr_head: Linear,
    cat_head: Option<Linear>,
    config: AttributeNetConfig,
}

impl AttributeEncoderNet {
    pub fn new(config: AttributeNetConfig, vb: VarBuilder) -> Result<Self> {
        let mut trunk = Vec::with_capacity(config.n_layers + 1);
        trunk.push(ConvBlock::new(
            config.input_nc + config.lm_nc,
            config.nf,
            3,
            1,
            1,
            true,
            Activation::Relu,
            vb.pp("stem"),
        )?);
        let mut c = config.nf;
        for i in 0..config.n_layers {
            let next = (c * 2).min(512);
            trunk.push(ConvBlock::new(
                c,
                next,
                3,
                2,
                1,
                true,
                Activation::Relu,
                vb.pp(format!("stage_{i}")),
            )?);
            c = next;
        }

        let attr_head = linear(c, config.n_attr, vb.pp("attr_head"))?;
        let cat_head = if config.n_cat > 0 {
            Some(linear(c, config.n_cat, vb.pp("cat_head"))?)
        } else {
            None
        };

        Ok(Self {
            trunk,
            attr_head,
            cat_head,
            config,
        })
    }

    /// `img` (B, input_nc, H, W), `lm` (B, lm_nc, H, W) when the net takes landmarks
    pub fn forward_t(&self, img: &Tensor, lm: Option<&Tensor>, train: bool) -> Result<AttributeOutput> {
        let x = match (self.config.lm_nc, lm) {
            (0, _) => img.clone(),
            (_, Some(lm)) => Tensor::cat(&[img, lm], 1)?,
            (_, None) => {
                return Err(candle_core::Error::Msg(
                    "attribute encoder expects a landmark heatmap".into(),
                ))
            }
        };

        let mut h = x;
        for block in &self.trunk {
            h = block.forward_t(&h, train)?;
        }
        let features = h.mean((2, 3))?;
        let attr_logits = self.attr_head.forward(&features)?;
        let cat_logits = match &self.cat_head {
            Some(head) => Some(head.forward(&features)?),
            None => None,
        };

        Ok(AttributeOutput {
            features,
            attr_logits,
            cat_logits,
        })
    }

    pub fn config(&self) -> &AttributeNetConfig {
        &self.config
    }
}
