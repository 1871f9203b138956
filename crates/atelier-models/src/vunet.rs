//! Variational U-Net pose transfer.
//!
//! The network output is split into an image head (tanh), an optional joint
//! heatmap head (sigmoid) and optional segmentation logits, in that order.
//! With `loss_in_lab` the reconstruction, perceptual and adversarial terms
//! compare Lab luminance, and the color term compares Lab chroma.

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use tracing::{debug, info};

use atelier_core::{Error, LossWeights, Result, RunConfig, VunetConfig};
use atelier_data::{std_to_imagenet, BatchTensorSet};

use crate::checkpoint::CheckpointStore;
use crate::composer::{scalar, LossComposer};
use crate::losses::{bce_loss, color_loss, cross_entropy_map, kl_loss, l1_loss, lab_luminance, rgb_to_lab};
use crate::metrics::{psnr, ssim};
use crate::model::{appearance_tensor, perceptual_extractor, pose_tensor, Adversary, AdversarySetup, PipelineModel, StepTracker};
use crate::networks::{FeatureExtractor, VariationalUnet, VariationalUnetConfig};
use crate::optim::{Adam, AdamParams};
use crate::patches::PatchStyleLoss;
use crate::scheduler::LrScheduler;

pub const NET_T: &str = "netT";
pub const OPTIM: &str = "optim";

/// Segmentation channels masked in for the style loss (upper and lower garment)
const STYLE_MASK_CHANNELS: std::ops::Range<usize> = 3..5;

/// Which side of the pair is encoded and which one is decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VunetMode {
    /// Sampled latents; reference -> target when supervised, reference -> reference otherwise
    Train,
    /// Posterior means, reference -> target
    Transfer,
    /// Posterior means, reference -> reference
    ReconstructRef,
}

impl VunetMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            VunetMode::Train => "train",
            VunetMode::Transfer => "transfer",
            VunetMode::ReconstructRef => "reconstruct_ref",
        }
    }

    /// (reference side, target side)
    fn sides(&self, supervised: bool) -> (usize, usize) {
        match self {
            VunetMode::ReconstructRef => (1, 1),
            VunetMode::Train if !supervised => (1, 1),
            _ => (1, 2),
        }
    }
}

/// Tensors of one forward pass, selected from the bound pair batch by mode
#[derive(Clone)]
struct Frame {
    appearance: Tensor,
    pose_ref: Tensor,
    pose_tar: Tensor,
    img_tar: Tensor,
    joint_c_tar: Tensor,
    joint_tar: Option<Tensor>,
    seg_tar: Option<Tensor>,
    style_mask: Option<Tensor>,
}

struct Generated {
    frame: Frame,
    img_out: Tensor,
    joint_out: Option<Tensor>,
    seg_out: Option<Tensor>,
    ps: Vec<Tensor>,
    qs: Vec<Tensor>,
}

impl Generated {
    fn detach(&self) -> Self {
        let detach_all = |ts: &[Tensor]| -> Vec<Tensor> { ts.iter().map(Tensor::detach).collect() };
        Generated {
            frame: self.frame.clone(),
            img_out: self.img_out.detach(),
            joint_out: self.joint_out.as_ref().map(Tensor::detach),
            seg_out: self.seg_out.as_ref().map(Tensor::detach),
            ps: detach_all(&self.ps),
            qs: detach_all(&self.qs),
        }
    }
}

pub struct VunetModel {
    cfg: VunetConfig,
    weights: LossWeights,
    check_grad: bool,
    d_cond: bool,
    seg_nc: usize,
    joint_nc: usize,
    device: Device,
    varmap: VarMap,
    net_t: VariationalUnet,
    optim: Adam,
    adversary: Option<Adversary>,
    perceptual: FeatureExtractor,
    patch_style: PatchStyleLoss,
    scheduler: LrScheduler,
    base_lr: f64,
    base_lr_d: f64,
    store: CheckpointStore,
    tracker: StepTracker,
    batch: Option<BatchTensorSet>,
    output: Option<Generated>,
    errors: Vec<(String, f32)>,
}

impl VunetModel {
    pub fn new(cfg: &RunConfig, device: &Device) -> Result<Self> {
        let vunet = &cfg.vunet;
        let pose = &cfg.pose;
        let seg_nc = cfg.data.seg_nc;
        let pose_nc = vunet.pose_type.channels(pose.joint_nc, seg_nc);
        let app_nc = vunet.appearance_type.channels();
        let out_nc = vunet.output_type.channels(seg_nc, pose.joint_nc);

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let net_t = VariationalUnet::new(VariationalUnetConfig::from_options(vunet, app_nc, pose_nc, out_nc), vb)?;
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

        info!(
            pose = %vunet.pose_type,
            appearance = ?vunet.appearance_type,
            output = ?vunet.output_type,
            supervised = vunet.supervised,
            "built variational u-net model"
        );
        Ok(Self {
            cfg: vunet.clone(),
            weights: cfg.loss.clone(),
            check_grad: cfg.train.check_grad,
            d_cond: pose.d_cond,
            seg_nc,
            joint_nc: pose.joint_nc,
            device: device.clone(),
            varmap,
            net_t,
            optim,
            adversary,
            perceptual: perceptual_extractor(cfg, device)?,
            patch_style: PatchStyleLoss::new(pose.patch_size, pose.patch_indices.clone(), vunet.patch_padding),
            scheduler: LrScheduler::new(&cfg.train),
            base_lr: cfg.train.lr,
            base_lr_d: cfg.train.lr_d,
            store: CheckpointStore::for_run(cfg),
            tracker: StepTracker::new(),
            batch: None,
            output: None,
            errors: Vec::new(),
        })
    }

    /// Transferred image of the last forward pass
    pub fn generated(&self) -> Option<&Tensor> {
        self.output.as_ref().map(|o| &o.img_out)
    }

    /// Predicted segmentation as a one-hot mask `(B, seg_nc, H, W)`
    pub fn predicted_seg_mask(&self) -> Result<Option<Tensor>> {
        let Some(logits) = self.output.as_ref().and_then(|o| o.seg_out.as_ref()) else {
            return Ok(None);
        };
        let labels = logits.argmax_keepdim(1)?.to_dtype(DType::F32)?;
        let channels = (0..self.seg_nc)
            .map(|c| labels.eq(c as f32)?.to_dtype(DType::F32))
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Some(Tensor::cat(&channels, 1)?))
    }

    fn frame(&self, mode: VunetMode) -> Result<Frame> {
        let batch = self
            .batch
            .as_ref()
            .ok_or_else(|| Error::Schema("no input bound".into()))?;
        let (r, t) = mode.sides(self.cfg.supervised);
        let style_mask = if self.cfg.masked_style && self.weights.style > 0.0 {
            let seg_mask = batch.get(&format!("seg_mask_{t}"))?;
            Some(seg_mask.narrow(1, STYLE_MASK_CHANNELS.start, STYLE_MASK_CHANNELS.len())?.sum_keepdim(1)?)
        } else {
            None
        };
        Ok(Frame {
            appearance: appearance_tensor(batch, &self.cfg.appearance_type, r)?,
            pose_ref: pose_tensor(batch, &self.cfg.pose_type, r)?,
            pose_tar: pose_tensor(batch, &self.cfg.pose_type, t)?,
            img_tar: batch.get(&format!("img_{t}"))?.clone(),
            joint_c_tar: batch.get(&format!("joint_c_{t}"))?.clone(),
            joint_tar: if self.cfg.output_type.joint {
                Some(batch.get(&format!("joint_{t}"))?.clone())
            } else {
                None
            },
            seg_tar: if self.cfg.output_type.seg {
                Some(batch.get(&format!("seg_{t}"))?.clone())
            } else {
                None
            },
            style_mask,
        })
    }

    fn run(&mut self, mode: VunetMode) -> Result<()> {
        let frame = self.frame(mode)?;
        let out = self
            .net_t
            .forward(&frame.appearance, &frame.pose_ref, &frame.pose_tar, mode == VunetMode::Train)?;

        let img_out = out.output.narrow(1, 0, 3)?.tanh()?;
        let mut offset = 3;
        let joint_out = if self.cfg.output_type.joint {
            let joint = candle_nn::ops::sigmoid(&out.output.narrow(1, offset, self.joint_nc)?)?;
            offset += self.joint_nc;
            Some(joint)
        } else {
            None
        };
        let seg_out = if self.cfg.output_type.seg {
            Some(out.output.narrow(1, offset, self.seg_nc)?)
        } else {
            None
        };

        self.output = Some(Generated {
            frame,
            img_out,
            joint_out,
            seg_out,
            ps: out.ps,
            qs: out.qs,
        });
        Ok(())
    }

    /// Image compared by the reconstruction terms: RGB, or Lab luminance
    fn compared(&self, img: &Tensor) -> Result<Tensor> {
        if self.cfg.loss_in_lab {
            Ok(lab_luminance(&rgb_to_lab(img)?)?)
        } else {
            Ok(img.clone())
        }
    }

    fn critic_input(&self, img: &Tensor, frame: &Frame) -> Result<Tensor> {
        let img = self.compared(img)?;
        if self.d_cond {
            Ok(Tensor::cat(&[&img, &frame.pose_tar], 1)?)
        } else {
            Ok(img)
        }
    }

    /// Loss terms in reporting order. `img_out` may be a leaf standing in
    /// for `gen.img_out`; `image_only` drops the terms not computed from it.
    fn generator_terms(&self, gen: &Generated, img_out: &Tensor, image_only: bool) -> Result<LossComposer> {
        let frame = &gen.frame;
        let w = &self.weights;
        let out = self.compared(img_out)?;
        let tar = self.compared(&frame.img_tar)?;
        let mut composer = LossComposer::new();

        if !image_only {
            composer.add("kl", w.kl, || Ok::<_, Error>(kl_loss(&gen.ps, &gen.qs)?))?;
        }
        composer.add("l1", w.l1, || Ok::<_, Error>(l1_loss(&out, &tar)?))?;
        composer.add("content", w.content, || -> Result<Tensor> {
            Ok(self.perceptual.content_loss(&std_to_imagenet(&out)?, &std_to_imagenet(&tar)?)?)
        })?;
        composer.add("style", w.style, || -> Result<Tensor> {
            let (x, y) = match &frame.style_mask {
                Some(mask) => (out.broadcast_mul(mask)?, tar.broadcast_mul(mask)?),
                None => (out.clone(), tar.clone()),
            };
            Ok(self.perceptual.style_loss(&std_to_imagenet(&x)?, &std_to_imagenet(&y)?)?)
        })?;
        composer.add("patch_style", w.patch_style, || -> Result<Tensor> {
            Ok(self.patch_style.loss(
                &self.perceptual,
                &std_to_imagenet(&out)?,
                &frame.joint_c_tar,
                &std_to_imagenet(&tar)?,
                &frame.joint_c_tar,
            )?)
        })?;
        if let Some(adversary) = &self.adversary {
            composer.add("gan", w.gan, || adversary.generator_loss(&self.critic_input(img_out, frame)?))?;
        }
        if !image_only {
            if let (Some(logits), Some(labels)) = (&gen.seg_out, &frame.seg_tar) {
                composer.add("seg", w.seg, || Ok::<_, Error>(cross_entropy_map(logits, labels)?))?;
            }
            if let (Some(prob), Some(target)) = (&gen.joint_out, &frame.joint_tar) {
                composer.add("joint", w.joint, || Ok::<_, Error>(bce_loss(prob, target)?))?;
            }
        }
        if self.cfg.loss_in_lab {
            composer.add("color", w.color, || Ok::<_, Error>(color_loss(img_out, &frame.img_tar)?))?;
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
        let gen = self
            .output
            .take()
            .ok_or_else(|| Error::Schema("forward has not run".into()))?;

        if self.adversary.is_some() {
            let real = self.critic_input(&gen.frame.img_tar, &gen.frame)?;
            let fake = self.critic_input(&gen.img_out, &gen.frame)?;
            if let Some(adversary) = self.adversary.as_mut() {
                let update = adversary.update(&real, &fake, self.weights.gan)?;
                self.errors.push(("loss_D".into(), update.loss_d));
                if let Some(gp) = update.loss_gp {
                    self.errors.push(("loss_gp".into(), gp));
                }
            }
        }
        self.tracker.discriminator_updated()?;

        let composer = self.generator_terms(&gen, &gen.img_out, false)?;
        let total = composer
            .total()?
            .ok_or_else(|| Error::Config("variational u-net has no active loss".into()))?;
        if self.check_grad {
            let leaf = Var::from_tensor(&gen.img_out.detach())?;
            let norms = self
                .generator_terms(&gen, leaf.as_tensor(), true)?
                .gradient_norms(&leaf)?;
            self.errors
                .extend(norms.into_iter().map(|(name, v)| (format!("grad_{name}"), v)));
        }
        self.optim.backward_step(&total)?;
        self.record(&composer, &total)?;
        self.tracker.generator_updated()?;

        debug!(errors = ?self.errors, "variational u-net step");
        self.tracker.finish()
    }

    fn try_test(&mut self, mode: VunetMode) -> Result<()> {
        self.tracker.begin_test()?;
        self.errors.clear();
        debug!(mode = mode.as_str(), "evaluating variational u-net");
        self.run(mode)?;
        let gen = self
            .output
            .as_ref()
            .map(Generated::detach)
            .ok_or_else(|| Error::Schema("forward has not run".into()))?;
        let composer = self.generator_terms(&gen, &gen.img_out, false)?;
        let total = composer.total()?.unwrap_or(Tensor::new(0f32, &self.device)?);
        self.record(&composer, &total)?;
        let metrics = [
            ("psnr", psnr(&gen.img_out, &gen.frame.img_tar)?),
            ("ssim", ssim(&gen.img_out, &gen.frame.img_tar)?),
        ];
        self.errors
            .extend(metrics.into_iter().map(|(name, v)| (name.to_string(), v)));
        Ok(())
    }

    /// Evaluate the bound batch in the given mode
    pub fn test_mode(&mut self, mode: VunetMode) -> Result<()> {
        let outcome = self.try_test(mode);
        self.tracker.reset();
        outcome
    }
}

impl PipelineModel for VunetModel {
    fn name(&self) -> &'static str {
        "vunet_pose_transfer"
    }

    fn set_input(&mut self, batch: &BatchTensorSet) -> Result<()> {
        self.tracker.bind_input()?;
        self.batch = Some(batch.to_device(&self.device)?);
        self.output = None;
        Ok(())
    }

    fn forward(&mut self) -> Result<()> {
        self.tracker.forward_done()?;
        self.run(VunetMode::Train)
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
        self.test_mode(VunetMode::Transfer)
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
        info!(label, dir = %self.store.dir().display(), "saved variational u-net model");
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
mod tests {
    use super::*;
    use crate::supervised::fixtures::pair_batch;
    use atelier_core::{PoseTransferConfig, PoseType};
    use std::collections::HashMap;
    use std::path::Path;

    fn tiny_config(dir: &Path) -> RunConfig {
        let mut cfg = RunConfig::default();
        cfg.id = "vunet".into();
        cfg.checkpoint_dir = dir.to_path_buf();
        cfg.vunet = VunetConfig {
            nf: 4,
            max_nf: 8,
            n_scales: 3,
            n_latent_scales: 2,
            n_residual_blocks: 1,
            ..VunetConfig::default()
        };
        cfg.pose = PoseTransferConfig {
            ndf: 4,
            n_layers_d: 2,
            patch_size: 8,
            patch_indices: (0..4).collect(),
            ..PoseTransferConfig::default()
        };
        cfg.loss = LossWeights {
            kl: 1e-3,
            l1: 1.0,
            content: 1.0,
            style: 1.0,
            patch_style: 1.0,
            gan: 0.0,
            ..LossWeights::default()
        };
        cfg.train.pool_size = 2;
        cfg
    }

    fn error_map(model: &VunetModel) -> HashMap<String, f32> {
        model.current_errors().into_iter().collect()
    }

    #[test]
    fn test_modes_pick_pair_sides() {
        assert_eq!(VunetMode::Train.sides(true), (1, 2));
        assert_eq!(VunetMode::Train.sides(false), (1, 1));
        assert_eq!(VunetMode::Transfer.sides(false), (1, 2));
        assert_eq!(VunetMode::ReconstructRef.sides(true), (1, 1));
    }

    #[test]
    fn test_train_step_with_all_heads() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let device = Device::Cpu;
        let mut cfg = tiny_config(dir.path());
        cfg.vunet.pose_type = "joint+seg+stickman".parse::<PoseType>()?;
        cfg.vunet.appearance_type = "image+limb".parse()?;
        cfg.vunet.output_type = "image+seg+joint".parse()?;
        cfg.vunet.masked_style = true;
        cfg.loss.seg = 1.0;
        cfg.loss.joint = 1.0;
        cfg.loss.gan = 1.0;
        let mut model = VunetModel::new(&cfg, &device)?;
        model.set_input(&pair_batch(&device, 7)?)?;
        model.forward()?;
        assert_eq!(model.predicted_seg_mask()?.map(|m| m.dims().to_vec()), Some(vec![2, 7, 32, 32]));
        model.optimize_step()?;

        let names: Vec<String> = model.current_errors().into_iter().map(|(n, _)| n).collect();
        assert_eq!(
            names,
            vec![
                "loss_D",
                "loss_kl",
                "loss_l1",
                "loss_content",
                "loss_style",
                "loss_patch_style",
                "loss_gan",
                "loss_seg",
                "loss_joint",
                "loss_total"
            ]
        );
        assert!(error_map(&model)["loss_kl"] >= 0.0);
        Ok(())
    }

    #[test]
    fn test_lab_losses_and_gradient_report() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let device = Device::Cpu;
        let mut cfg = tiny_config(dir.path());
        cfg.vunet.loss_in_lab = true;
        cfg.loss.color = 1.0;
        cfg.train.check_grad = true;
        let mut model = VunetModel::new(&cfg, &device)?;
        model.set_input(&pair_batch(&device, 7)?)?;
        model.optimize_step()?;

        let errors = error_map(&model);
        assert!(errors["loss_color"] >= 0.0);
        assert!(errors["grad_l1"] > 0.0);
        assert!(errors.contains_key("grad_color"));
        assert!(!errors.contains_key("grad_kl"));
        Ok(())
    }

    #[test]
    fn test_reconstruction_mode_targets_reference() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let device = Device::Cpu;
        let mut model = VunetModel::new(&tiny_config(dir.path()), &device)?;
        let batch = pair_batch(&device, 7)?;
        model.set_input(&batch)?;
        model.test_mode(VunetMode::ReconstructRef)?;
        let recon = error_map(&model);

        let out = model.generated().unwrap().clone();
        let expected = l1_loss(&out, batch.get("img_1")?)?.to_scalar::<f32>()?;
        assert!((recon["loss_l1"] - expected).abs() < 1e-5);
        assert!(recon.contains_key("psnr"));

        // test leaves the tracker idle, so a new input must be bound
        assert!(model.test().is_err());
        model.set_input(&batch)?;
        model.test()?;
        let out = model.generated().unwrap().clone();
        let expected = l1_loss(&out, batch.get("img_2")?)?.to_scalar::<f32>()?;
        assert!((error_map(&model)["loss_l1"] - expected).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_checkpoint_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let device = Device::Cpu;
        let cfg = tiny_config(dir.path());
        let batch = pair_batch(&device, 7)?;
        let mut model = VunetModel::new(&cfg, &device)?;
        model.set_input(&batch)?;
        model.optimize_step()?;
        model.save_checkpoint("1")?;

        let mut restored = VunetModel::new(&cfg, &device)?;
        restored.load_checkpoint("latest")?;
        for m in [&mut model, &mut restored] {
            m.set_input(&batch)?;
            m.test()?;
        }
        let (a, b) = (error_map(&model), error_map(&restored));
        assert_eq!(a["loss_l1"], b["loss_l1"]);
        assert_eq!(restored.optim.step_count(), 1);
        Ok(())
    }
}
