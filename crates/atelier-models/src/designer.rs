//! Designer GAN: garment image from a shape code and an attribute code.

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use tracing::{debug, info};

use atelier_core::{
    DesignerConfig, Error, GanKind, InputMaskMode, LossWeights, Result, RunConfig, ShapeEncode, LANDMARK_CHANNELS,
};
use atelier_data::{std_to_imagenet, BatchTensorSet};

use crate::attribute::FrozenAttributeEncoder;
use crate::checkpoint::CheckpointStore;
use crate::composer::{scalar, LossComposer};
use crate::losses::{bce_loss, l1_loss};
use crate::masking::post_mask;
use crate::metrics::{psnr, ssim};
use crate::model::{perceptual_extractor, Adversary, AdversarySetup, PipelineModel, StepTracker};
use crate::networks::{FeatureExtractor, UnetConfig, UnetGenerator};
use crate::optim::{Adam, AdamParams};
use crate::scheduler::LrScheduler;

pub const NET_G: &str = "netG";
pub const OPTIM: &str = "optim";

/// Channels of the shape code for the configured encoding
pub fn shape_channels(shape_encode: ShapeEncode, mask_mode: InputMaskMode, seg_nc: usize) -> usize {
    let seg = match mask_mode {
        InputMaskMode::OneHot => seg_nc,
        InputMaskMode::Binary | InputMaskMode::None => 1,
    };
    match shape_encode {
        ShapeEncode::Landmark => LANDMARK_CHANNELS,
        ShapeEncode::Segmentation => seg,
        ShapeEncode::LandmarkAndSegmentation => LANDMARK_CHANNELS + seg,
    }
}

struct DesignerInput {
    img_real: Tensor,
    shape_code: Tensor,
    /// Landmark heatmap, kept for an attribute encoder that reads landmarks
    lm_map: Tensor,
    seg_map: Tensor,
    attr_label: Tensor,
    /// Attribute code of the real image, detached
    attr_code: Option<Tensor>,
}

struct DesignerOutput {
    img_fake: Tensor,
}

pub struct DesignerModel {
    cfg: DesignerConfig,
    weights: LossWeights,
    check_grad: bool,
    device: Device,
    varmap: VarMap,
    net_g: UnetGenerator,
    optim: Adam,
    adversary: Option<Adversary>,
    encoder: Option<FrozenAttributeEncoder>,
    perceptual: Option<FeatureExtractor>,
    scheduler: LrScheduler,
    base_lr: f64,
    store: CheckpointStore,
    tracker: StepTracker,
    input: Option<DesignerInput>,
    output: Option<DesignerOutput>,
    errors: Vec<(String, f32)>,
}

impl DesignerModel {
    /// Build the model, loading the frozen attribute encoder named by `which_model_ae` when needed
    pub fn new(cfg: &RunConfig, device: &Device) -> Result<Self> {
        let needs_encoder = !cfg.designer.no_attr_condition || cfg.loss.attr > 0.0;
        let encoder = if needs_encoder {
            Some(FrozenAttributeEncoder::load(
                &cfg.checkpoint_dir,
                &cfg.designer.which_model_ae,
                &cfg.designer.ae_epoch,
                device,
            )?)
        } else {
            None
        };
        Self::with_encoder(cfg, encoder, device)
    }

    pub fn with_encoder(cfg: &RunConfig, encoder: Option<FrozenAttributeEncoder>, device: &Device) -> Result<Self> {
        let designer = &cfg.designer;
        let shape_nc = shape_channels(designer.shape_encode, cfg.data.input_mask_mode, cfg.data.seg_nc);
        let cond_nc = if designer.no_attr_condition {
            0
        } else {
            encoder
                .as_ref()
                .ok_or_else(|| Error::Config("attribute conditioning needs an attribute encoder".into()))?
                .condition_dim(designer.attr_condition_type)
        };
        if cfg.loss.attr > 0.0 && encoder.is_none() {
            return Err(Error::Config("attribute loss needs an attribute encoder".into()));
        }

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let net_g = UnetGenerator::new(
            UnetConfig {
                input_nc: shape_nc,
                output_nc: 3,
                ngf: designer.ngf,
                n_downsample: designer.n_downsample,
                cond_nc,
                ..UnetConfig::default()
            },
            vb,
        )?;
        let optim = Adam::new(&varmap, AdamParams::from_train(&cfg.train, cfg.train.lr))?;

        let adversary = if cfg.loss.gan > 0.0 {
            let setup = AdversarySetup {
                kind: designer.which_gan,
                input_nc: 3 + shape_nc,
                ndf: designer.ndf,
                n_layers: designer.n_layers_d,
                pool_size: if designer.which_gan == GanKind::Wgan { 0 } else { cfg.train.pool_size },
                gp_weight: cfg.loss.gp,
                seed: cfg.seed,
            };
            Some(Adversary::new(&setup, AdamParams::from_train(&cfg.train, cfg.train.lr), device)?)
        } else {
            None
        };
        let perceptual = if cfg.loss.vgg > 0.0 {
            Some(perceptual_extractor(cfg, device)?)
        } else {
            None
        };

        info!(
            shape_nc,
            cond_nc,
            gan = %designer.which_gan,
            "built designer model"
        );
        Ok(Self {
            cfg: designer.clone(),
            weights: cfg.loss.clone(),
            check_grad: cfg.train.check_grad,
            device: device.clone(),
            varmap,
            net_g,
            optim,
            adversary,
            encoder,
            perceptual,
            scheduler: LrScheduler::new(&cfg.train),
            base_lr: cfg.train.lr,
            store: CheckpointStore::for_run(cfg),
            tracker: StepTracker::new(),
            input: None,
            output: None,
            errors: Vec::new(),
        })
    }

    fn input(&self) -> Result<&DesignerInput> {
        self.input
            .as_ref()
            .ok_or_else(|| Error::Schema("no input bound".into()))
    }

    /// Generated image of the last forward pass
    pub fn generated(&self) -> Option<&Tensor> {
        self.output.as_ref().map(|o| &o.img_fake)
    }

    fn encoder_landmarks<'a>(&self, input: &'a DesignerInput) -> Option<&'a Tensor> {
        match &self.encoder {
            Some(enc) if enc.uses_landmarks() => Some(&input.lm_map),
            _ => None,
        }
    }

    fn run(&mut self, train: bool) -> Result<()> {
        let input = self.input()?;
        let raw = self.net_g.forward_t(&input.shape_code, input.attr_code.as_ref(), train)?;
        let img_fake = post_mask(&raw, &input.seg_map, &input.img_real, self.cfg.post_mask_mode)?;
        self.output = Some(DesignerOutput { img_fake });
        Ok(())
    }

    /// Discriminator input: image joined with the shape code
    fn critic_input(img: &Tensor, input: &DesignerInput) -> Result<Tensor> {
        Ok(Tensor::cat(&[img, &input.shape_code], 1)?)
    }

    /// Generator loss terms evaluated on `img_fake`
    fn generator_terms(&self, img_fake: &Tensor) -> Result<LossComposer> {
        let input = self.input()?;
        let w = &self.weights;
        let mut composer = LossComposer::new();
        if let Some(adversary) = &self.adversary {
            composer.add("gan", w.gan, || adversary.generator_loss(&Self::critic_input(img_fake, input)?))?;
        }
        composer.add("l1", w.l1, || Ok::<_, Error>(l1_loss(img_fake, &input.img_real)?))?;
        composer.add("attr", w.attr, || match &self.encoder {
            Some(enc) => {
                let prob = enc.probabilities(img_fake, self.encoder_landmarks(input))?;
                Ok(bce_loss(&prob, &input.attr_label)?)
            }
            None => Err(Error::Config("attribute loss needs an attribute encoder".into())),
        })?;
        composer.add("vgg", w.vgg, || match &self.perceptual {
            Some(net) => Ok(net.content_loss(&std_to_imagenet(img_fake)?, &std_to_imagenet(&input.img_real)?)?),
            None => Err(Error::Config("perceptual loss needs a feature network".into())),
        })?;
        Ok(composer)
    }

    fn record(&mut self, composer: &LossComposer, total: &Tensor) -> Result<()> {
        let mut errors: Vec<(String, f32)> = composer
            .raw_values()?
            .into_iter()
            .map(|(name, v)| (format!("loss_{name}"), v))
            .collect();
        errors.push(("loss_total".into(), scalar(total)?));
        self.errors.extend(errors);
        Ok(())
    }

    fn try_optimize_step(&mut self) -> Result<()> {
        if self.output.is_none() {
            self.forward()?;
        }
        self.errors.clear();
        let img_fake = match &self.output {
            Some(out) => out.img_fake.clone(),
            None => return Err(Error::Schema("forward has not run".into())),
        };

        if let Some(adversary) = self.adversary.as_mut() {
            let input = self
                .input
                .as_ref()
                .ok_or_else(|| Error::Schema("no input bound".into()))?;
            let real = Self::critic_input(&input.img_real, input)?;
            let fake = Self::critic_input(&img_fake, input)?;
            let update = adversary.update(&real, &fake, 1.0)?;
            self.errors.push(("loss_D".into(), update.loss_d));
            if let Some(gp) = update.loss_gp {
                self.errors.push(("loss_gp".into(), gp));
            }
        }
        self.tracker.discriminator_updated()?;

        let composer = self.generator_terms(&img_fake)?;
        let total = composer
            .total()?
            .ok_or_else(|| Error::Config("designer has no active generator loss".into()))?;
        if self.check_grad {
            self.record_gradient_norms(&img_fake)?;
        }
        self.optim.backward_step(&total)?;
        self.record(&composer, &total)?;
        self.tracker.generator_updated()?;

        debug!(errors = ?self.errors, "designer step");
        self.output = None;
        self.tracker.finish()
    }

    /// Rebuild the generator terms on a leaf copy of the fake image and
    /// record the gradient norm of each
    fn record_gradient_norms(&mut self, img_fake: &Tensor) -> Result<()> {
        let leaf = Var::from_tensor(&img_fake.detach())?;
        let composer = self.generator_terms(leaf.as_tensor())?;
        let norms = composer.gradient_norms(&leaf)?;
        self.errors
            .extend(norms.into_iter().map(|(name, v)| (format!("grad_{name}"), v)));
        Ok(())
    }

    fn try_test(&mut self) -> Result<()> {
        self.tracker.begin_test()?;
        self.errors.clear();
        self.run(false)?;
        let img_fake = match &self.output {
            Some(out) => out.img_fake.detach(),
            None => return Err(Error::Schema("forward has not run".into())),
        };
        let composer = self.generator_terms(&img_fake)?;
        let total = composer.total()?.unwrap_or(Tensor::new(0f32, &self.device)?);
        self.record(&composer, &total)?;
        let img_real = &self.input()?.img_real;
        let metrics = [("psnr", psnr(&img_fake, img_real)?), ("ssim", ssim(&img_fake, img_real)?)];
        self.errors
            .extend(metrics.into_iter().map(|(name, v)| (name.to_string(), v)));
        Ok(())
    }
}

impl PipelineModel for DesignerModel {
    fn name(&self) -> &'static str {
        "designer"
    }

    fn set_input(&mut self, batch: &BatchTensorSet) -> Result<()> {
        self.tracker.bind_input()?;
        let batch = batch.to_device(&self.device)?;
        let img_real = batch.get("img")?.clone();
        let lm_map = batch.get("lm_map")?.clone();
        let seg_mask = batch.get("seg_mask")?;
        let shape_code = match self.cfg.shape_encode {
            ShapeEncode::Landmark => lm_map.clone(),
            ShapeEncode::Segmentation => seg_mask.clone(),
            ShapeEncode::LandmarkAndSegmentation => Tensor::cat(&[&lm_map, seg_mask], 1)?,
        };

        let attr_code = match (&self.encoder, self.cfg.no_attr_condition) {
            (Some(enc), false) => {
                let lm = if enc.uses_landmarks() { Some(&lm_map) } else { None };
                Some(enc.condition(&img_real, lm, self.cfg.attr_condition_type)?.detach())
            }
            _ => None,
        };

        self.input = Some(DesignerInput {
            img_real,
            shape_code,
            lm_map,
            seg_map: batch.get("seg_map")?.clone(),
            attr_label: batch.get("attr_label")?.to_dtype(DType::F32)?,
            attr_code,
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
        self.store.save_varmap(NET_G, label, &self.varmap)?;
        self.store.save_tensors(OPTIM, label, &self.optim.state_tensors()?)?;
        if let Some(adversary) = &self.adversary {
            adversary.save(&self.store, label)?;
        }
        info!(label, dir = %self.store.dir().display(), "saved designer");
        Ok(())
    }

    fn load_checkpoint(&mut self, label: &str) -> Result<()> {
        self.store.load_varmap(NET_G, label, &mut self.varmap)?;
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
            adversary.optimizer_mut().set_learning_rate(lr);
        }
        Ok(lr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::AttributeModel;
    use atelier_core::{AttrConditionType, AttributeConfig, PostMaskMode};
    use atelier_data::Collate;
    use std::collections::HashMap;
    use std::path::Path;

    fn tiny_config(dir: &Path) -> RunConfig {
        let mut cfg = RunConfig::default();
        cfg.id = "designer".into();
        cfg.checkpoint_dir = dir.to_path_buf();
        cfg.attribute = AttributeConfig {
            n_attr: 5,
            nf: 4,
            n_layers: 2,
            ..AttributeConfig::default()
        };
        cfg.designer = DesignerConfig {
            ngf: 4,
            ndf: 4,
            n_layers_d: 2,
            n_downsample: 3,
            ..DesignerConfig::default()
        };
        cfg.loss = LossWeights {
            gan: 1.0,
            l1: 1.0,
            attr: 1.0,
            vgg: 1.0,
            ..LossWeights::default()
        };
        cfg.train.pool_size = 4;
        cfg
    }

    fn encoder(cfg: &RunConfig) -> Result<FrozenAttributeEncoder> {
        AttributeModel::new(cfg, &Device::Cpu)?.frozen()
    }

    struct Sample(Vec<(&'static str, Tensor)>);

    impl Collate for Sample {
        fn sample_id(&self) -> &str {
            "s"
        }

        fn into_fields(self) -> Vec<(&'static str, Tensor)> {
            self.0
        }
    }

    fn batch(device: &Device) -> Result<BatchTensorSet> {
        let map = |c: usize| Tensor::rand(0f32, 1f32, (c, 32, 32), device);
        let samples = (0..2)
            .map(|_| -> Result<Sample> {
                // left half head (label 2), right half upper body (label 3)
                let seg = Tensor::cat(
                    &[
                        Tensor::full(2f32, (1, 32, 16), device)?,
                        Tensor::full(3f32, (1, 32, 16), device)?,
                    ],
                    2,
                )?;
                Ok(Sample(vec![
                    ("img", Tensor::rand(-1f32, 1f32, (3, 32, 32), device)?),
                    ("lm_map", map(18)?),
                    ("edge_map", map(1)?),
                    ("color_map", map(3)?),
                    ("seg_map", seg),
                    ("seg_mask", map(1)?),
                    ("attr_label", Tensor::new(&[1f32, 0., 0., 1., 0.], device)?),
                ]))
            })
            .collect::<Result<Vec<_>>>()?;
        BatchTensorSet::collate(samples)
    }

    fn names(errors: &[(String, f32)]) -> Vec<&str> {
        errors.iter().map(|(n, _)| n.as_str()).collect()
    }

    #[test]
    fn test_step_reports_every_active_term() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let device = Device::Cpu;
        let cfg = tiny_config(dir.path());
        let mut model = DesignerModel::with_encoder(&cfg, Some(encoder(&cfg)?), &device)?;
        model.set_input(&batch(&device)?)?;
        model.optimize_step()?;
        assert_eq!(
            names(&model.current_errors()),
            vec!["loss_D", "loss_gan", "loss_l1", "loss_attr", "loss_vgg", "loss_total"]
        );
        assert!(model.current_errors().iter().all(|(_, v)| v.is_finite()));
        Ok(())
    }

    #[test]
    fn test_wgan_reports_penalty_and_gradient_norms() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let device = Device::Cpu;
        let mut cfg = tiny_config(dir.path());
        cfg.designer.which_gan = GanKind::Wgan;
        cfg.designer.attr_condition_type = AttrConditionType::Probability;
        cfg.loss.vgg = 0.0;
        cfg.train.check_grad = true;
        let mut model = DesignerModel::with_encoder(&cfg, Some(encoder(&cfg)?), &device)?;
        model.set_input(&batch(&device)?)?;
        model.optimize_step()?;

        let errors: HashMap<String, f32> = model.current_errors().into_iter().collect();
        assert!(errors.contains_key("loss_gp"));
        assert!(!errors.contains_key("loss_vgg"));
        assert!(errors["grad_l1"] > 0.0);
        assert!(errors.contains_key("grad_gan") && errors.contains_key("grad_attr"));
        Ok(())
    }

    #[test]
    fn test_fuse_face_keeps_real_head() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let device = Device::Cpu;
        let mut cfg = tiny_config(dir.path());
        cfg.designer.post_mask_mode = PostMaskMode::FuseFace;
        let mut model = DesignerModel::with_encoder(&cfg, Some(encoder(&cfg)?), &device)?;
        let batch = batch(&device)?;
        model.set_input(&batch)?;
        model.forward()?;

        let fake = model.generated().unwrap();
        let real = batch.get("img")?;
        let head = (fake.narrow(3, 0, 16)? - real.narrow(3, 0, 16)?)?.abs()?.max_all()?;
        assert_eq!(head.to_scalar::<f32>()?, 0.0);
        let body = (fake.narrow(3, 16, 16)? - real.narrow(3, 16, 16)?)?.abs()?.max_all()?;
        assert!(body.to_scalar::<f32>()? > 0.0);
        model.optimize_step()?;
        Ok(())
    }

    #[test]
    fn test_unconditioned_model_without_adversary() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let device = Device::Cpu;
        let mut cfg = tiny_config(dir.path());
        cfg.designer.no_attr_condition = true;
        cfg.loss = LossWeights {
            gan: 0.0,
            attr: 0.0,
            vgg: 0.0,
            ..cfg.loss.clone()
        };
        let mut model = DesignerModel::with_encoder(&cfg, None, &device)?;
        model.set_input(&batch(&device)?)?;
        model.optimize_step()?;
        assert_eq!(names(&model.current_errors()), vec!["loss_l1", "loss_total"]);

        model.set_input(&batch(&device)?)?;
        model.test()?;
        let errors: HashMap<String, f32> = model.current_errors().into_iter().collect();
        assert!(errors.contains_key("psnr") && errors.contains_key("ssim"));
        Ok(())
    }

    #[test]
    fn test_attribute_conditioning_requires_encoder() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = tiny_config(dir.path());
        assert!(matches!(
            DesignerModel::with_encoder(&cfg, None, &Device::Cpu),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_checkpoint_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let device = Device::Cpu;
        let cfg = tiny_config(dir.path());
        // both models must see the same attribute codes
        let ae = AttributeModel::new(&cfg, &device)?;
        let mut model = DesignerModel::with_encoder(&cfg, Some(ae.frozen()?), &device)?;
        let batch = batch(&device)?;
        model.set_input(&batch)?;
        model.optimize_step()?;
        model.save_checkpoint("1")?;
        for component in [NET_G, OPTIM, "netD", "optim_D"] {
            assert!(model.store.path(component, "1").is_file());
        }

        let mut restored = DesignerModel::with_encoder(&cfg, Some(ae.frozen()?), &device)?;
        restored.load_checkpoint("latest")?;
        assert_eq!(restored.optim.step_count(), 1);

        model.set_input(&batch)?;
        model.test()?;
        restored.set_input(&batch)?;
        restored.test()?;
        assert_eq!(
            model.current_errors().iter().find(|(n, _)| n == "loss_l1"),
            restored.current_errors().iter().find(|(n, _)| n == "loss_l1")
        );
        Ok(())
    }
}
