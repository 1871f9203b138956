//! Variational U-Net for pose transfer.
//!
//! Two multi-scale encoders run side by side: the appearance encoder sees
//! the reference appearance together with the reference pose and yields the
//! posterior means `q`, the pose encoder sees the target pose and yields the
//! prior means `p` plus the skip features of the decoder. Latents live on the
//! bottom `n_latent_scales` scales and have unit variance, so the KL term
//! reduces to half the squared distance between the means.

use candle_core::{Module, Result, Tensor};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, VarBuilder};

/// Network configuration
#[derive(Debug, Clone)]
pub struct VariationalUnetConfig {
    pub appearance_nc: usize,
    pub pose_nc: usize,
    pub output_nc: usize,
    pub nf: usize,
    pub max_nf: usize,
    pub n_scales: usize,
    pub n_latent_scales: usize,
    pub n_residual_blocks: usize,
}

impl VariationalUnetConfig {
    pub fn from_options(cfg: &atelier_core::VunetConfig, appearance_nc: usize, pose_nc: usize, output_nc: usize) -> Self {
        Self {
            appearance_nc,
            pose_nc,
            output_nc,
            nf: cfg.nf,
            max_nf: cfg.max_nf,
            n_scales: cfg.n_scales,
            n_latent_scales: cfg.n_latent_scales,
            n_residual_blocks: cfg.n_residual_blocks,
        }
    }

    fn channels(&self, scale: usize) -> usize {
        (self.nf << scale).min(self.max_nf)
    }

    fn first_latent_scale(&self) -> usize {
        self.n_scales - self.n_latent_scales.min(self.n_scales)
    }
}

/// Decoder output and the latent means of both encoders, ordered from the
/// shallowest latent scale to the deepest
#[derive(Debug, Clone)]
pub struct VunetOutput {
    pub output: Tensor,
    pub ps: Vec<Tensor>,
    pub qs: Vec<Tensor>,
}

fn conv(in_c: usize, out_c: usize, kernel: usize, stride: usize, vb: VarBuilder) -> Result<Conv2d> {
    let config = Conv2dConfig {
        padding: kernel / 2,
        stride,
        ..Default::default()
    };
    conv2d(in_c, out_c, kernel, config, vb)
}

struct ResBlock {
    conv1: Conv2d,
    conv2: Conv2d,
}

impl ResBlock {
    fn new(c: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            conv1: conv(c, c, 3, 1, vb.pp("conv1"))?,
            conv2: conv(c, c, 3, 1, vb.pp("conv2"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.conv1.forward(&x.elu(1.0)?)?;
        let h = self.conv2.forward(&h.elu(1.0)?)?;
        x + h
    }
}

/// Residual stages with stride-2 transitions, returning one feature map per scale
struct ScaleEncoder {
    stem: Conv2d,
    stages: Vec<Vec<ResBlock>>,
    downs: Vec<Conv2d>,
}

impl ScaleEncoder {
    fn new(in_c: usize, cfg: &VariationalUnetConfig, vb: VarBuilder) -> Result<Self> {
        let stem = conv(in_c, cfg.channels(0), 3, 1, vb.pp("stem"))?;
        let mut stages = Vec::with_capacity(cfg.n_scales);
        let mut downs = Vec::with_capacity(cfg.n_scales.saturating_sub(1));
        for s in 0..cfg.n_scales {
            let blocks = (0..cfg.n_residual_blocks)
                .map(|r| ResBlock::new(cfg.channels(s), vb.pp(format!("scale_{s}.res_{r}"))))
                .collect::<Result<Vec<_>>>()?;
            stages.push(blocks);
            if s + 1 < cfg.n_scales {
                downs.push(conv(cfg.channels(s), cfg.channels(s + 1), 3, 2, vb.pp(format!("scale_{s}.down")))?);
            }
        }
        Ok(Self { stem, stages, downs })
    }

    fn forward(&self, x: &Tensor) -> Result<Vec<Tensor>> {
        let mut h = self.stem.forward(x)?;
        let mut out = Vec::with_capacity(self.stages.len());
        for (s, blocks) in self.stages.iter().enumerate() {
            for block in blocks {
                h = block.forward(&h)?;
            }
            out.push(h.clone());
            if let Some(down) = self.downs.get(s) {
                h = down.forward(&h)?;
            }
        }
        Ok(out)
    }
}

struct DecoderScale {
    up: Option<Conv2d>,
    merge: Option<Conv2d>,
    inject: Option<Conv2d>,
    blocks: Vec<ResBlock>,
}

pub struct VariationalUnet {
    appearance_encoder: ScaleEncoder,
    pose_encoder: ScaleEncoder,
    q_heads: Vec<Conv2d>,
    p_heads: Vec<Conv2d>,
    decoder: Vec<DecoderScale>,
    head: Conv2d,
    config: VariationalUnetConfig,
}

impl VariationalUnet {
    pub fn new(config: VariationalUnetConfig, vb: VarBuilder) -> Result<Self> {
        if config.n_scales == 0 || config.n_latent_scales == 0 || config.n_latent_scales > config.n_scales {
            return Err(candle_core::Error::Msg(format!(
                "invalid latent layout: {} latent scales of {}",
                config.n_latent_scales, config.n_scales
            )));
        }
        let appearance_encoder = ScaleEncoder::new(
            config.appearance_nc + config.pose_nc,
            &config,
            vb.pp("enc_appearance"),
        )?;
        let pose_encoder = ScaleEncoder::new(config.pose_nc, &config, vb.pp("enc_pose"))?;

        let first_latent = config.first_latent_scale();
        let mut q_heads = Vec::new();
        let mut p_heads = Vec::new();
        for s in first_latent..config.n_scales {
            let c = config.channels(s);
            q_heads.push(conv(c, c, 1, 1, vb.pp(format!("q_{s}")))?);
            p_heads.push(conv(c, c, 1, 1, vb.pp(format!("p_{s}")))?);
        }

        let mut decoder = Vec::with_capacity(config.n_scales);
        for s in 0..config.n_scales {
            let c = config.channels(s);
            let vb = vb.pp(format!("dec_{s}"));
            let (up, merge) = if s + 1 < config.n_scales {
                (
                    Some(conv(config.channels(s + 1), c, 3, 1, vb.pp("up"))?),
                    Some(conv(2 * c, c, 1, 1, vb.pp("merge"))?),
                )
            } else {
                (None, None)
            };
            let inject = if s >= first_latent {
                Some(conv(2 * c, c, 1, 1, vb.pp("inject"))?)
            } else {
                None
            };
            let blocks = (0..config.n_residual_blocks)
                .map(|r| ResBlock::new(c, vb.pp(format!("res_{r}"))))
                .collect::<Result<Vec<_>>>()?;
            decoder.push(DecoderScale {
                up,
                merge,
                inject,
                blocks,
            });
        }
        let head = conv(config.channels(0), config.output_nc, 3, 1, vb.pp("head"))?;

        Ok(Self {
            appearance_encoder,
            pose_encoder,
            q_heads,
            p_heads,
            decoder,
            head,
            config,
        })
    }

    /// Decode `pose_tar` with the appearance of (`appearance`, `pose_ref`).
    ///
    /// With `sample` set the latents are drawn around the posterior means
    /// (training); otherwise the means are used directly (transfer).
    pub fn forward(
        &self,
        appearance: &Tensor,
        pose_ref: &Tensor,
        pose_tar: &Tensor,
        sample: bool,
    ) -> Result<VunetOutput> {
        let first_latent = self.config.first_latent_scale();

        let app_feats = self
            .appearance_encoder
            .forward(&Tensor::cat(&[appearance, pose_ref], 1)?)?;
        let pose_feats = self.pose_encoder.forward(pose_tar)?;

        let mut qs = Vec::with_capacity(self.q_heads.len());
        let mut ps = Vec::with_capacity(self.p_heads.len());
        for (k, (q_head, p_head)) in self.q_heads.iter().zip(&self.p_heads).enumerate() {
            let s = first_latent + k;
            qs.push(q_head.forward(&app_feats[s])?);
            ps.push(p_head.forward(&pose_feats[s])?);
        }

        let mut h = pose_feats[self.config.n_scales - 1].clone();
        for s in (0..self.config.n_scales).rev() {
            let scale = &self.decoder[s];
            if let (Some(up), Some(merge)) = (&scale.up, &scale.merge) {
                let (_, _, hh, ww) = h.dims4()?;
                h = up.forward(&h.upsample_nearest2d(hh * 2, ww * 2)?)?;
                h = merge.forward(&Tensor::cat(&[&h, &pose_feats[s]], 1)?)?;
            }
            if let Some(inject) = &scale.inject {
                let q = &qs[s - first_latent];
                let z = if sample {
                    (q + q.randn_like(0.0, 1.0)?)?
                } else {
                    q.clone()
                };
                h = inject.forward(&Tensor::cat(&[&h, &z], 1)?)?;
            }
            for block in &scale.blocks {
                h = block.forward(&h)?;
            }
        }
        let output = self.head.forward(&h.elu(1.0)?)?;

        Ok(VunetOutput { output, ps, qs })
    }

    pub fn config(&self) -> &VariationalUnetConfig {
        &self.config
    }
}
