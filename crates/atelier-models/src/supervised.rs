//! Supervised pose transfer: reference image + target pose -> target image.

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use tracing::{debug, info};

use atelier_core::{Error, LossWeights, PatchPadding, PoseTransferConfig, Result, RunConfig};
use atelier_data::{std_to_imagenet, BatchTensorSet};

use crate::checkpoint::CheckpointStore;
use crate::composer::{scalar, LossComposer};
use crate::losses::l1_loss;
use crate::metrics::{psnr, ssim};
use crate::model::{perceptual_extractor, pose_tensor, Adversary, AdversarySetup, PipelineModel, StepTracker};
use crate::networks::{FeatureExtractor, UnetConfig, UnetGenerator};
use crate::optim::{Adam, AdamParams};
use crate::patches::PatchStyleLoss;
use crate::scheduler::LrScheduler;

pub const NET_T: &str = "netT";
pub const OPTIM: &str = "optim";

struct PairInput {
    img_ref: Tensor,
    img_tar: Tensor,
    pose_tar: Tensor,
    /// (B, J, 2) target joint coordinates
    joint_c_tar: Tensor,
}

pub struct SupervisedPoseModel {
    cfg: PoseTransferConfig,
    weights: LossWeights,
    check_grad: bool,
    device: Device,
    varmap: VarMap,
    net_t: UnetGenerator,
    optim: Adam,
    adversary: Option<Adversary>,
    perceptual: FeatureExtractor,
    patch_style: PatchStyleLoss,
    scheduler: LrScheduler,
    base_lr: f64,
    base_lr_d: f64,
    store: CheckpointStore,
    tracker: StepTracker,
    input: Option<PairInput>,
    output: Option<Tensor>,
    errors: Vec<(String, f32)>,
}

impl SupervisedPoseModel {
    pub fn new(cfg: &RunConfig, device: &Device) -> Result<Self> {
        let pose = &cfg.pose;
        let pose_nc = pose.pose_type.channels(pose.joint_nc, cfg.data.seg_nc);

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let net_t = UnetGenerator::new(
            UnetConfig {
                input_nc: 3 + pose_nc,
                output_nc: 3,
                ngf: pose.nf,
                n_downsample: pose.n_downsample,
                cond_nc: 0,
                ..UnetConfig::default()
            },
            vb,
        )?;
        let optim = Adam::new(&varmap, AdamParams::from_train(&cfg.train, cfg.train.lr))?;

        let adversary = if cfg.loss.gan > 0.0 {
            let setup = AdversarySetup {
                kind: pose.which_gan,
                input_nc: if pose.d_cond { 3 + pose_nc } else { 3 },
                ndf: pose.ndf,
                n_layers: pose.n_layers_d,
                pool_size: cfg.train.pool_size,
                gp_weight: cfg.loss.gp,
                seed: cfg.seed,
            };
            Some(Adversary::new(&setup, AdamParams::from_train(&cfg.train, cfg.train.lr_d), device)?)
        } else {
            None
        };

        info!(pose = %pose.pose_type, pose_nc, d_cond = pose.d_cond, "built supervised pose transfer model");
        Ok(Self {
            cfg: pose.clone(),
            weights: cfg.loss.clone(),
            check_grad: cfg.train.check_grad,
            device: device.clone(),
            varmap,
            net_t,
            optim,
            adversary,
            perceptual: perceptual_extractor(cfg, device)?,
            patch_style: PatchStyleLoss::new(pose.patch_size, pose.patch_indices.clone(), PatchPadding::Reflect),
            scheduler: LrScheduler::new(&cfg.train),
            base_lr: cfg.train.lr,
            base_lr_d: cfg.train.lr_d,
            store: CheckpointStore::for_run(cfg),
            tracker: StepTracker::new(),
            input: None,
            output: None,
            errors: Vec::new(),
        })
    }

    fn input(&self) -> Result<&PairInput> {
        self.input
            .as_ref()
            .ok_or_else(|| Error::Schema("no input bound".into()))
    }

    /// Transferred image of the last forward pass
    pub fn generated(&self) -> Option<&Tensor> {
        self.output.as_ref()
    }

    fn run(&mut self, train: bool) -> Result<()> {
        let input = self.input()?;
        let x = Tensor::cat(&[&input.img_ref, &input.pose_tar], 1)?;
        let img_out = self.net_t.forward_t(&x, None, train)?;
        self.output = Some(img_out);
        Ok(())
    }

    fn critic_input(&self, img: &Tensor, input: &PairInput) -> Result<Tensor> {
        if self.cfg.d_cond {
            Ok(Tensor::cat(&[img, &input.pose_tar], 1)?)
        } else {
            Ok(img.clone())
        }
    }

    fn generator_terms(&self, img_out: &Tensor) -> Result<LossComposer> {
        let input = self.input()?;
        let w = &self.weights;
        let mut composer = LossComposer::new();
        composer.add("l1", w.l1, || Ok::<_, Error>(l1_loss(img_out, &input.img_tar)?))?;
        composer.add("content", w.content, || -> Result<Tensor> {
            Ok(self
                .perceptual
                .content_loss(&std_to_imagenet(img_out)?, &std_to_imagenet(&input.img_tar)?)?)
        })?;
        composer.add("patch_style", w.patch_style, || -> Result<Tensor> {
            Ok(self.patch_style.loss(
                &self.perceptual,
                &std_to_imagenet(img_out)?,
                &input.joint_c_tar,
                &std_to_imagenet(&input.img_tar)?,
                &input.joint_c_tar,
            )?)
        })?;
        if let Some(adversary) = &self.adversary {
            composer.add("gan", w.gan, || adversary.generator_loss(&self.critic_input(img_out, input)?))?;
        }
        Ok(composer)
    }

    fn record(&mut self, composer: &LossComposer, total: &Tensor) -> Result<()> {
        self.errors.extend(
            composer
                .raw_values()?
                .into_iter()
                .map(|(name, v)| (format!("loss_{name}"), v)),
        );
        self.errors.push(("loss_total".into(), scalar(total)?));
        Ok(())
    }

    fn try_optimize_step(&mut self) -> Result<()> {
        if self.output.is_none() {
            self.forward()?;
        }
        self.errors.clear();
        let img_out = self
            .output
            .clone()
            .ok_or_else(|| Error::Schema("forward has not run".into()))?;

        if self.adversary.is_some() {
            let input = self.input()?;
            let real = self.critic_input(&input.img_tar, input)?;
            let fake = self.critic_input(&img_out, input)?;
            if let Some(adversary) = self.adversary.as_mut() {
                let update = adversary.update(&real, &fake, self.weights.gan)?;
                self.errors.push(("loss_D".into(), update.loss_d));
                if let Some(gp) = update.loss_gp {
                    self.errors.push(("loss_gp".into(), gp));
                }
            }
        }
        self.tracker.discriminator_updated()?;

        let composer = self.generator_terms(&img_out)?;
        let total = composer
            .total()?
            .ok_or_else(|| Error::Config("pose transfer has no active generator loss".into()))?;
        if self.check_grad {
            let leaf = Var::from_tensor(&img_out.detach())?;
            let norms = self.generator_terms(leaf.as_tensor())?.gradient_norms(&leaf)?;
            self.errors
                .extend(norms.into_iter().map(|(name, v)| (format!("grad_{name}"), v)));
        }
        self.optim.backward_step(&total)?;
        self.record(&composer, &total)?;
        self.tracker.generator_updated()?;

        debug!(errors = ?self.errors, "pose transfer step");
        self.output = None;
        self.tracker.finish()
    }

    fn try_test(&mut self) -> Result<()> {
        self.tracker.begin_test()?;
        self.errors.clear();
        self.run(false)?;
        let img_out = self
            .output
            .as_ref()
            .map(Tensor::detach)
            .ok_or_else(|| Error::Schema("forward has not run".into()))?;
        let composer = self.generator_terms(&img_out)?;
        let total = composer.total()?.unwrap_or(Tensor::new(0f32, &self.device)?);
        self.record(&composer, &total)?;
        let img_tar = &self.input()?.img_tar;
        let metrics = [("psnr", psnr(&img_out, img_tar)?), ("ssim", ssim(&img_out, img_tar)?)];
        self.errors
            .extend(metrics.into_iter().map(|(name, v)| (name.to_string(), v)));
        Ok(())
    }
}

impl PipelineModel for SupervisedPoseModel {
    fn name(&self) -> &'static str {
        "supervised_pose_transfer"
    }

    fn set_input(&mut self, batch: &BatchTensorSet) -> Result<()> {
        self.tracker.bind_input()?;
        let batch = batch.to_device(&self.device)?;
        self.input = Some(PairInput {
            img_ref: batch.get("img_1")?.clone(),
            img_tar: batch.get("img_2")?.clone(),
            pose_tar: pose_tensor(&batch, &self.cfg.pose_type, 2)?,
            joint_c_tar: batch.get("joint_c_2")?.clone(),
        });
        self.output = None;
        Ok(())
    }

    fn forward(&mut self) -> Result<()> {
        self.tracker.forward_done()?;
        self.run(true)
    }

    fn optimize_step(&mut self) -> Result<()> {
        let outcome = self.try_optimize_step();
        if outcome.is_err() {
            self.output = None;
            self.tracker.reset();
        }
        outcome
    }

    fn test(&mut self) -> Result<()> {
        let outcome = self.try_test();
        self.tracker.reset();
        outcome
    }

    fn current_errors(&self) -> Vec<(String, f32)> {
        self.errors.clone()
    }

    fn save_checkpoint(&mut self, label: &str) -> Result<()> {
        self.store.save_varmap(NET_T, label, &self.varmap)?;
        self.store.save_tensors(OPTIM, label, &self.optim.state_tensors()?)?;
        if let Some(adversary) = &self.adversary {
            adversary.save(&self.store, label)?;
        }
        info!(label, dir = %self.store.dir().display(), "saved pose transfer model");
        Ok(())
    }

    fn load_checkpoint(&mut self, label: &str) -> Result<()> {
        self.store.load_varmap(NET_T, label, &mut self.varmap)?;
        let state = self.store.load_tensors(OPTIM, label, &self.device)?;
        self.optim.load_state(&state)?;
        if let Some(adversary) = self.adversary.as_mut() {
            adversary.load(&self.store, label, &self.device)?;
        }
        Ok(())
    }

    fn update_learning_rate(&mut self, metric: Option<f64>) -> Result<f64> {
        let factor = self.scheduler.step(metric);
        let lr = self.base_lr * factor;
        self.optim.set_learning_rate(lr);
        if let Some(adversary) = self.adversary.as_mut() {
            adversary.optimizer_mut().set_learning_rate(self.base_lr_d * factor);
        }
        Ok(lr)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use atelier_data::Collate;

    pub struct PairFields(pub Vec<(&'static str, Tensor)>);

    impl Collate for PairFields {
        fn sample_id(&self) -> &str {
            "a_b"
        }

        fn into_fields(self) -> Vec<(&'static str, Tensor)> {
            self.0
        }
    }

    /// One 32x32 pair with all pose fields; joint 1 of the reference is
    /// marked missing when `missing_joint` is set
    pub fn pair_fields(device: &Device, seg_nc: usize, missing_joint: bool) -> Result<PairFields> {
        let mut fields = Vec::new();
        for (k, names) in [
            (1, ["img_1", "joint_1", "stickman_1", "seg_1", "seg_mask_1", "joint_c_1", "limb_1"]),
            (2, ["img_2", "joint_2", "stickman_2", "seg_2", "seg_mask_2", "joint_c_2", "limb_2"]),
        ] {
            let labels = Tensor::rand(0f32, seg_nc as f32 - 0.51, (1, 32, 32), device)?.round()?;
            let mask = Tensor::cat(
                &(0..seg_nc)
                    .map(|c| labels.eq(c as f32)?.to_dtype(DType::F32))
                    .collect::<candle_core::Result<Vec<_>>>()?,
                0,
            )?;
            let mut coords: Vec<f32> = (0..18).flat_map(|j| [4.0 + j as f32, 6.0 + k as f32 * 3.0]).collect();
            if missing_joint && k == 1 {
                coords[2] = -1.0;
                coords[3] = -1.0;
            }
            fields.extend([
                (names[0], Tensor::rand(-1f32, 1f32, (3, 32, 32), device)?),
                (names[1], Tensor::rand(0f32, 1f32, (18, 32, 32), device)?),
                (names[2], Tensor::rand(0f32, 1f32, (3, 32, 32), device)?),
                (names[3], labels),
                (names[4], mask),
                (names[5], Tensor::from_vec(coords, (18, 2), device)?),
                (names[6], Tensor::rand(-1f32, 1f32, (24, 32, 32), device)?),
            ]);
        }
        Ok(PairFields(fields))
    }

    /// Two pairs, the second with a missing reference joint
    pub fn pair_batch(device: &Device, seg_nc: usize) -> Result<BatchTensorSet> {
        BatchTensorSet::collate(vec![
            pair_fields(device, seg_nc, false)?,
            pair_fields(device, seg_nc, true)?,
        ])
    }
}
