//! Capabilities shared by the pipeline models.

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info};

use atelier_core::{AppearanceType, Error, GanKind, PoseItem, PoseType, Result, RunConfig};
use atelier_data::BatchTensorSet;

use crate::checkpoint::CheckpointStore;
use crate::composer::scalar;
use crate::losses::GanLoss;
use crate::networks::{DiscriminatorConfig, FeatureExtractor, NLayerDiscriminator, PerceptualConfig};
use crate::optim::{Adam, AdamParams};
use crate::penalty::{gradient_penalty, DEFAULT_STEP};
use crate::pool::ImagePool;

/// A trainable model of the pipeline.
///
/// A training step is `set_input` then `optimize_step`; `forward` may be
/// called in between. `test` runs the generator without updating any
/// parameter and adds evaluation metrics to the reported errors.
pub trait PipelineModel {
    fn name(&self) -> &'static str;

    fn set_input(&mut self, batch: &BatchTensorSet) -> Result<()>;

    fn forward(&mut self) -> Result<()>;

    fn optimize_step(&mut self) -> Result<()>;

    fn test(&mut self) -> Result<()>;

    /// Scalar losses (and metrics after `test`) of the last step, in a stable order
    fn current_errors(&self) -> Vec<(String, f32)>;

    fn save_checkpoint(&mut self, label: &str) -> Result<()>;

    fn load_checkpoint(&mut self, label: &str) -> Result<()>;

    /// Advance the learning-rate schedule by one epoch; returns the new generator rate
    fn update_learning_rate(&mut self, metric: Option<f64>) -> Result<f64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPhase {
    Idle,
    InputBound,
    ForwardDone,
    DiscriminatorUpdated,
    GeneratorUpdated,
}

impl StepPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepPhase::Idle => "idle",
            StepPhase::InputBound => "input_bound",
            StepPhase::ForwardDone => "forward_done",
            StepPhase::DiscriminatorUpdated => "discriminator_updated",
            StepPhase::GeneratorUpdated => "generator_updated",
        }
    }
}

/// Enforces the order of the stages of one training step
#[derive(Debug, Clone)]
pub struct StepTracker {
    phase: StepPhase,
}

impl Default for StepTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StepTracker {
    pub fn new() -> Self {
        Self { phase: StepPhase::Idle }
    }

    pub fn phase(&self) -> StepPhase {
        self.phase
    }

    fn transition(&mut self, allowed: &[StepPhase], to: StepPhase) -> Result<()> {
        if !allowed.contains(&self.phase) {
            return Err(Error::InvalidTransition {
                from: self.phase.as_str(),
                to: to.as_str(),
            });
        }
        self.phase = to;
        Ok(())
    }

    /// A new batch may replace one that was bound but not yet used
    pub fn bind_input(&mut self) -> Result<()> {
        self.transition(&[StepPhase::Idle, StepPhase::InputBound], StepPhase::InputBound)
    }

    pub fn forward_done(&mut self) -> Result<()> {
        self.transition(&[StepPhase::InputBound], StepPhase::ForwardDone)
    }

    /// Also used as a pass-through when the adversarial loss is disabled
    pub fn discriminator_updated(&mut self) -> Result<()> {
        self.transition(&[StepPhase::ForwardDone], StepPhase::DiscriminatorUpdated)
    }

    pub fn generator_updated(&mut self) -> Result<()> {
        self.transition(&[StepPhase::DiscriminatorUpdated], StepPhase::GeneratorUpdated)
    }

    pub fn finish(&mut self) -> Result<()> {
        self.transition(&[StepPhase::GeneratorUpdated], StepPhase::Idle)
    }

    /// Evaluation needs a bound input and leaves the tracker idle
    pub fn begin_test(&mut self) -> Result<()> {
        if !matches!(self.phase, StepPhase::InputBound | StepPhase::ForwardDone) {
            return Err(Error::InvalidTransition {
                from: self.phase.as_str(),
                to: "test",
            });
        }
        Ok(())
    }

    pub fn reset(&mut self) {
        self.phase = StepPhase::Idle;
    }
}

/// Concatenate the configured pose items of side `k` (1 or 2) of a pair batch
pub fn pose_tensor(batch: &BatchTensorSet, pose: &PoseType, k: usize) -> Result<Tensor> {
    let parts = pose
        .items()
        .iter()
        .map(|item| {
            let field = match item {
                PoseItem::Joint => format!("joint_{k}"),
                PoseItem::Seg => format!("seg_mask_{k}"),
                PoseItem::Stickman => format!("stickman_{k}"),
            };
            batch.get(&field).cloned()
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Tensor::cat(&parts, 1)?)
}

/// Image of side `k`, with its limb crops appended when configured
pub fn appearance_tensor(batch: &BatchTensorSet, appearance: &AppearanceType, k: usize) -> Result<Tensor> {
    let img = batch.get(&format!("img_{k}"))?;
    if appearance.with_limbs {
        let limb = batch.get(&format!("limb_{k}"))?;
        Ok(Tensor::cat(&[img, limb], 1)?)
    } else {
        Ok(img.clone())
    }
}

/// Weights file of the perceptual feature network, looked up in the checkpoint root
pub const PERCEPTUAL_WEIGHTS: &str = "perceptual.safetensors";

/// Perceptual feature network: pretrained weights when present, seeded otherwise
pub fn perceptual_extractor(cfg: &RunConfig, device: &Device) -> Result<FeatureExtractor> {
    let path = cfg.checkpoint_dir.join(PERCEPTUAL_WEIGHTS);
    let config = PerceptualConfig {
        seed: cfg.seed,
        ..PerceptualConfig::default()
    };
    if path.is_file() {
        let tensors = candle_core::safetensors::load(&path, device)?;
        info!(path = %path.display(), "loaded perceptual weights");
        Ok(FeatureExtractor::from_tensors(tensors, config, device)?)
    } else {
        debug!("perceptual weights not found, using seeded features");
        Ok(FeatureExtractor::seeded(config, device)?)
    }
}

pub const NET_D: &str = "netD";
pub const OPTIM_D: &str = "optim_D";

#[derive(Debug, Clone)]
pub struct AdversarySetup {
    pub kind: GanKind,
    pub input_nc: usize,
    pub ndf: usize,
    pub n_layers: usize,
    /// History buffer capacity; 0 feeds fresh fakes only
    pub pool_size: usize,
    /// Weight of the gradient penalty, used with `wgan` only
    pub gp_weight: f64,
    pub seed: u64,
}

/// Scalars of one discriminator update
#[derive(Debug, Clone, Copy)]
pub struct DiscriminatorUpdate {
    pub loss_d: f32,
    pub loss_gp: Option<f32>,
}

/// Discriminator with its own parameters, optimizer and fake history
pub struct Adversary {
    varmap: VarMap,
    net: NLayerDiscriminator,
    optim: Adam,
    gan: GanLoss,
    pool: ImagePool,
    gp_weight: f64,
    rng: StdRng,
}

impl Adversary {
    pub fn new(setup: &AdversarySetup, params: AdamParams, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let net = NLayerDiscriminator::new(
            &DiscriminatorConfig {
                input_nc: setup.input_nc,
                ndf: setup.ndf,
                n_layers: setup.n_layers,
            },
            vb,
        )?;
        let optim = Adam::new(&varmap, params)?;
        Ok(Self {
            varmap,
            net,
            optim,
            gan: GanLoss::new(setup.kind),
            pool: ImagePool::new(setup.pool_size, setup.seed),
            gp_weight: setup.gp_weight,
            rng: StdRng::seed_from_u64(setup.seed.wrapping_add(1)),
        })
    }

    pub fn kind(&self) -> GanKind {
        self.gan.kind()
    }

    pub fn optimizer_mut(&mut self) -> &mut Adam {
        &mut self.optim
    }

    /// Update the discriminator on detached inputs; the loss is scaled by `scale` before back-propagation
    pub fn update(&mut self, real: &Tensor, fake: &Tensor, scale: f64) -> Result<DiscriminatorUpdate> {
        let fake = self.pool.query(&fake.detach())?;
        let real = real.detach();
        let pred_fake = self.net.forward_t(&fake, true)?;
        let pred_real = self.net.forward_t(&real, true)?;
        let loss_d = self.gan.discriminator_loss(&pred_fake, &pred_real)?;

        let (total, loss_gp) = if self.gan.kind() == GanKind::Wgan && self.gp_weight > 0.0 {
            let net = &self.net;
            let gp = gradient_penalty(
                |x: &Tensor| net.forward_t(x, true),
                &real,
                &fake,
                self.gp_weight,
                DEFAULT_STEP,
                &mut self.rng,
            )?;
            let value = scalar(&gp)?;
            ((&loss_d + gp)?, Some(value))
        } else {
            (loss_d.clone(), None)
        };
        self.optim.backward_step(&(total * scale)?)?;
        Ok(DiscriminatorUpdate {
            loss_d: scalar(&loss_d)?,
            loss_gp,
        })
    }

    /// Adversarial loss of the generator for a fake discriminator input
    pub fn generator_loss(&self, fake: &Tensor) -> Result<Tensor> {
        let pred = self.net.forward_t(fake, true)?;
        Ok(self.gan.loss(&pred, true)?)
    }

    pub fn save(&self, store: &CheckpointStore, label: &str) -> Result<()> {
        store.save_varmap(NET_D, label, &self.varmap)?;
        store.save_tensors(OPTIM_D, label, &self.optim.state_tensors()?)?;
        Ok(())
    }

    pub fn load(&mut self, store: &CheckpointStore, label: &str, device: &Device) -> Result<()> {
        store.load_varmap(NET_D, label, &mut self.varmap)?;
        let state = store.load_tensors(OPTIM_D, label, device)?;
        self.optim.load_state(&state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optim::named_vars;
    use atelier_data::Collate;

    #[test]
    fn test_tracker_follows_step_order() -> Result<()> {
        let mut t = StepTracker::new();
        t.bind_input()?;
        t.bind_input()?;
        t.forward_done()?;
        t.discriminator_updated()?;
        t.generator_updated()?;
        t.finish()?;
        assert_eq!(t.phase(), StepPhase::Idle);
        Ok(())
    }

    #[test]
    fn test_tracker_rejects_skipped_stage() {
        let mut t = StepTracker::new();
        let err = t.forward_done().unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                from: "idle",
                to: "forward_done"
            }
        ));

        t.bind_input().unwrap();
        t.forward_done().unwrap();
        assert!(t.bind_input().is_err());
        assert!(t.generator_updated().is_err());
        t.reset();
        assert_eq!(t.phase(), StepPhase::Idle);
        assert!(t.begin_test().is_err());
    }

    struct Pair {
        fields: Vec<(&'static str, Tensor)>,
    }

    impl Collate for Pair {
        fn sample_id(&self) -> &str {
            "a_b"
        }

        fn into_fields(self) -> Vec<(&'static str, Tensor)> {
            self.fields
        }
    }

    #[test]
    fn test_pose_and_appearance_channels() -> Result<()> {
        let device = Device::Cpu;
        let map = |c: usize| Tensor::zeros((c, 8, 8), DType::F32, &device);
        let sample = Pair {
            fields: vec![
                ("img_1", map(3)?),
                ("limb_1", map(24)?),
                ("joint_1", map(18)?),
                ("seg_mask_1", map(7)?),
                ("stickman_1", map(3)?),
            ],
        };
        let batch = BatchTensorSet::collate(vec![sample])?;
        let pose: PoseType = "joint+seg".parse()?;
        assert_eq!(pose_tensor(&batch, &pose, 1)?.dims(), &[1, 25, 8, 8]);
        let stick: PoseType = "stickman".parse()?;
        assert_eq!(pose_tensor(&batch, &stick, 1)?.dims(), &[1, 3, 8, 8]);
        assert!(pose_tensor(&batch, &stick, 2).is_err());

        let app = appearance_tensor(&batch, &AppearanceType { with_limbs: true }, 1)?;
        assert_eq!(app.dims(), &[1, 27, 8, 8]);
        Ok(())
    }

    #[test]
    fn test_adversary_update_changes_parameters() -> Result<()> {
        let device = Device::Cpu;
        let setup = AdversarySetup {
            kind: GanKind::Wgan,
            input_nc: 3,
            ndf: 4,
            n_layers: 1,
            pool_size: 0,
            gp_weight: 10.0,
            seed: 0,
        };
        let mut adv = Adversary::new(&setup, AdamParams::default(), &device)?;
        let snapshot = |adv: &Adversary| -> Result<Vec<Vec<f32>>> {
            named_vars(&adv.varmap)?
                .iter()
                .map(|(_, v)| -> Result<Vec<f32>> { Ok(v.flatten_all()?.to_vec1::<f32>()?) })
                .collect()
        };
        let before = snapshot(&adv)?;
        let real = Tensor::randn(0f32, 1f32, (2, 3, 8, 8), &device)?;
        let fake = Tensor::randn(0f32, 1f32, (2, 3, 8, 8), &device)?;
        let update = adv.update(&real, &fake, 1.0)?;
        assert!(update.loss_gp.is_some());
        assert!(update.loss_d.is_finite());
        let after = snapshot(&adv)?;
        assert_ne!(before, after);
        Ok(())
    }
}
