//! Attribute encoder training and its frozen inference wrapper.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor, D};
use candle_nn::{VarBuilder, VarMap};
use tracing::info;

use atelier_core::{AttrConditionType, AttributeConfig, AttributeLoss, Error, ImageNormalize, Result, RunConfig};
use atelier_data::{std_to_imagenet, BatchTensorSet};

use crate::checkpoint::{attribute_encoder_id, CheckpointStore};
use crate::composer::{scalar, LossComposer};
use crate::losses::weighted_bce_with_logits;
use crate::model::{PipelineModel, StepTracker};
use crate::networks::{AttributeEncoderNet, AttributeNetConfig, AttributeOutput};
use crate::optim::{named_vars, Adam, AdamParams};
use crate::scheduler::LrScheduler;

pub const NET_AE: &str = "AE";
pub const OPTIM: &str = "optim";

struct AttributeInput {
    img: Tensor,
    lm: Option<Tensor>,
    attr_label: Tensor,
    cat_label: Option<Tensor>,
}

/// Multi-label attribute classifier with an optional category head
pub struct AttributeModel {
    cfg: AttributeConfig,
    device: Device,
    varmap: VarMap,
    net: AttributeEncoderNet,
    optim: Adam,
    scheduler: LrScheduler,
    base_lr: f64,
    store: CheckpointStore,
    tracker: StepTracker,
    /// Per-attribute positive rate, required by the weighted loss
    pos_rate: Option<Tensor>,
    input: Option<AttributeInput>,
    output: Option<AttributeOutput>,
    errors: Vec<(String, f32)>,
}

impl AttributeModel {
    pub fn new(cfg: &RunConfig, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let net = AttributeEncoderNet::new(AttributeNetConfig::from(&cfg.attribute), vb)?;
        let optim = Adam::new(&varmap, AdamParams::from_train(&cfg.train, cfg.train.lr))?;
        Ok(Self {
            cfg: cfg.attribute.clone(),
            device: device.clone(),
            varmap,
            net,
            optim,
            scheduler: LrScheduler::new(&cfg.train),
            base_lr: cfg.train.lr,
            store: CheckpointStore::new(cfg.checkpoint_dir.join(attribute_encoder_id(&cfg.id))),
            tracker: StepTracker::new(),
            pos_rate: None,
            input: None,
            output: None,
            errors: Vec::new(),
        })
    }

    /// Positive sample rate of every attribute, e.g. from `DatasetIndex::positive_rates`
    pub fn with_positive_rates(mut self, rates: &[f32]) -> Result<Self> {
        if rates.len() != self.cfg.n_attr {
            return Err(Error::AttributeCountMismatch {
                expected: self.cfg.n_attr,
                actual: rates.len(),
            });
        }
        self.pos_rate = Some(Tensor::from_slice(rates, rates.len(), &self.device)?);
        Ok(self)
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Inference copy of the current parameters
    pub fn frozen(&self) -> Result<FrozenAttributeEncoder> {
        let tensors = named_vars(&self.varmap)?
            .into_iter()
            .map(|(name, var)| -> Result<(String, Tensor)> { Ok((name, var.as_tensor().copy()?)) })
            .collect::<Result<HashMap<_, _>>>()?;
        FrozenAttributeEncoder::from_tensors(tensors, &self.cfg, &self.device)
    }

    fn input(&self) -> Result<&AttributeInput> {
        self.input
            .as_ref()
            .ok_or_else(|| Error::Schema("no input bound".into()))
    }

    fn run(&mut self, train: bool) -> Result<()> {
        let input = self.input()?;
        let output = self.net.forward_t(&input.img, input.lm.as_ref(), train)?;
        self.output = Some(output);
        Ok(())
    }

    fn losses(&self) -> Result<LossComposer> {
        let input = self.input()?;
        let output = self
            .output
            .as_ref()
            .ok_or_else(|| Error::Schema("forward has not run".into()))?;
        let mut composer = LossComposer::new();
        composer.add("attr", 1.0, || match self.cfg.loss_type {
            AttributeLoss::Bce => {
                candle_nn::loss::binary_cross_entropy_with_logit(&output.attr_logits, &input.attr_label)
            }
            AttributeLoss::WeightedBce => match &self.pos_rate {
                Some(rate) => weighted_bce_with_logits(&output.attr_logits, &input.attr_label, rate),
                None => Err(candle_core::Error::Msg(
                    "weighted attribute loss needs positive rates".into(),
                )),
            },
        })?;
        let cat_weight = if self.cfg.joint_cat { self.cfg.cat_loss_weight } else { 0.0 };
        composer.add("cat", cat_weight, || match (&output.cat_logits, &input.cat_label) {
            (Some(logits), Some(labels)) => candle_nn::loss::cross_entropy(logits, labels),
            _ => Err(candle_core::Error::Msg("category head or labels missing".into())),
        })?;
        Ok(composer)
    }

    fn record(&mut self, composer: &LossComposer, total: &Tensor) -> Result<()> {
        self.errors = composer
            .raw_values()?
            .into_iter()
            .map(|(name, v)| (format!("loss_{name}"), v))
            .collect();
        self.errors.push(("loss_total".into(), scalar(total)?));
        Ok(())
    }

    fn try_optimize_step(&mut self) -> Result<()> {
        if self.output.is_none() {
            self.forward()?;
        }
        // no adversary
        self.tracker.discriminator_updated()?;
        let composer = self.losses()?;
        let total = composer
            .total()?
            .ok_or_else(|| Error::Config("attribute model has no active loss".into()))?;
        self.optim.backward_step(&total)?;
        self.record(&composer, &total)?;
        self.tracker.generator_updated()?;
        self.output = None;
        self.tracker.finish()
    }

    fn try_test(&mut self) -> Result<()> {
        self.tracker.begin_test()?;
        self.run(false)?;
        let composer = self.losses()?;
        let total = composer.total()?.unwrap_or(Tensor::new(0f32, &self.device)?);
        self.record(&composer, &total)?;

        let input = self.input()?;
        let (acc_attr, acc_cat) = match &self.output {
            Some(output) => (
                binary_accuracy(&output.attr_logits, &input.attr_label)?,
                match (&output.cat_logits, &input.cat_label) {
                    (Some(logits), Some(labels)) => Some(top1_accuracy(logits, labels)?),
                    _ => None,
                },
            ),
            None => return Err(Error::Schema("forward has not run".into())),
        };
        self.errors.push(("acc_attr".into(), acc_attr));
        if let Some(acc) = acc_cat {
            self.errors.push(("acc_cat".into(), acc));
        }
        Ok(())
    }
}

/// Fraction of attributes whose thresholded prediction matches the label
fn binary_accuracy(logits: &Tensor, labels: &Tensor) -> Result<f32> {
    let pred = logits.gt(0.0)?.to_dtype(DType::F32)?;
    let truth = labels.gt(0.5)?.to_dtype(DType::F32)?;
    Ok(scalar(&pred.eq(&truth)?.to_dtype(DType::F32)?.mean_all()?)?)
}

fn top1_accuracy(logits: &Tensor, labels: &Tensor) -> Result<f32> {
    let pred = logits.argmax(D::Minus1)?;
    let hits = pred.eq(&labels.to_dtype(pred.dtype())?)?.to_dtype(DType::F32)?;
    Ok(scalar(&hits.mean_all()?)?)
}

impl PipelineModel for AttributeModel {
    fn name(&self) -> &'static str {
        "attribute_encoder"
    }

    fn set_input(&mut self, batch: &BatchTensorSet) -> Result<()> {
        self.tracker.bind_input()?;
        let batch = batch.to_device(&self.device)?;
        let lm = if self.cfg.input_lm {
            Some(batch.get("lm_map")?.clone())
        } else {
            None
        };
        let cat_label = if self.cfg.joint_cat {
            Some(batch.get("cat_label")?.clone())
        } else {
            None
        };
        self.input = Some(AttributeInput {
            img: batch.get("img")?.clone(),
            lm,
            attr_label: batch.get("attr_label")?.to_dtype(DType::F32)?,
            cat_label,
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
        self.output = None;
        self.tracker.reset();
        outcome
    }

    fn current_errors(&self) -> Vec<(String, f32)> {
        self.errors.clone()
    }

    fn save_checkpoint(&mut self, label: &str) -> Result<()> {
        self.store.save_varmap(NET_AE, label, &self.varmap)?;
        self.store.save_tensors(OPTIM, label, &self.optim.state_tensors()?)?;
        info!(label, dir = %self.store.dir().display(), "saved attribute encoder");
        Ok(())
    }

    fn load_checkpoint(&mut self, label: &str) -> Result<()> {
        self.store.load_varmap(NET_AE, label, &mut self.varmap)?;
        let state = self.store.load_tensors(OPTIM, label, &self.device)?;
        self.optim.load_state(&state)
    }

    fn update_learning_rate(&mut self, metric: Option<f64>) -> Result<f64> {
        let lr = self.base_lr * self.scheduler.step(metric);
        self.optim.set_learning_rate(lr);
        Ok(lr)
    }
}

/// Inference-only attribute encoder.
///
/// Parameters are plain tensors, so gradients pass through the encoder to
/// its input without ever being accumulated for the encoder itself.
pub struct FrozenAttributeEncoder {
    net: AttributeEncoderNet,
    imagenet_input: bool,
}

impl FrozenAttributeEncoder {
    pub fn from_tensors(tensors: HashMap<String, Tensor>, cfg: &AttributeConfig, device: &Device) -> Result<Self> {
        let tensors = tensors.into_iter().map(|(k, v)| (k, v.detach())).collect();
        let vb = VarBuilder::from_tensors(tensors, DType::F32, device);
        let net = AttributeEncoderNet::new(AttributeNetConfig::from(cfg), vb)
            .map_err(|e| Error::Checkpoint(format!("attribute encoder weights: {e}")))?;
        Ok(Self {
            net,
            imagenet_input: cfg.image_normalize == ImageNormalize::ImageNet,
        })
    }

    /// Load run `id` (`AE_` prefix optional) from `<checkpoint_dir>/<id>/`, using
    /// the options saved with it
    pub fn load(checkpoint_dir: &Path, id: &str, label: &str, device: &Device) -> Result<Self> {
        let store = CheckpointStore::new(checkpoint_dir.join(attribute_encoder_id(id)));
        let options = store.load_options()?;
        let tensors = store.load_tensors(NET_AE, label, device)?;
        info!(id, label, "loaded frozen attribute encoder");
        Self::from_tensors(tensors, &options.attribute, device)
    }

    pub fn uses_landmarks(&self) -> bool {
        self.net.config().lm_nc > 0
    }

    /// `img` is standard-normalized; it is remapped when the encoder expects ImageNet statistics
    fn run(&self, img: &Tensor, lm: Option<&Tensor>) -> Result<AttributeOutput> {
        let img = if self.imagenet_input {
            std_to_imagenet(img)?
        } else {
            img.clone()
        };
        Ok(self.net.forward_t(&img, lm, false)?)
    }

    /// Attribute probabilities (B, n_attr)
    pub fn probabilities(&self, img: &Tensor, lm: Option<&Tensor>) -> Result<Tensor> {
        let out = self.run(img, lm)?;
        Ok(candle_nn::ops::sigmoid(&out.attr_logits)?)
    }

    /// Pooled features (B, feat_dim)
    pub fn features(&self, img: &Tensor, lm: Option<&Tensor>) -> Result<Tensor> {
        Ok(self.run(img, lm)?.features)
    }

    pub fn condition(&self, img: &Tensor, lm: Option<&Tensor>, kind: AttrConditionType) -> Result<Tensor> {
        match kind {
            AttrConditionType::Feature => self.features(img, lm),
            AttrConditionType::Probability => self.probabilities(img, lm),
        }
    }

    pub fn condition_dim(&self, kind: AttrConditionType) -> usize {
        match kind {
            AttrConditionType::Feature => self.net.config().feat_dim(),
            AttrConditionType::Probability => self.net.config().n_attr,
        }
    }
}
