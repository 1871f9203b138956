//! Run configuration.
//!
//! A [`RunConfig`] is loaded once (file + `ATELIER_` environment overrides),
//! validated, and then handed to each component by reference. Nothing in the
//! pipeline mutates it after construction.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::modes::{
    AppearanceType, AttrConditionType, AttributeLoss, GanKind, ImageNormalize, InputMaskMode,
    LrPolicy, OutputType, PatchPadding, PoseItem, PoseType, PostMaskMode, ResizeOrCrop,
    SampleErrorPolicy, ShapeEncode,
};

/// Complete configuration of a training or evaluation run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Run identifier, used as the checkpoint sub-directory
    pub id: String,
    /// Root directory holding one sub-directory per run
    pub checkpoint_dir: PathBuf,
    /// Whether the run trains (false: evaluation only)
    pub is_train: bool,
    /// Seed for crops, flips, image pool and parameter init
    pub seed: u64,
    pub data: DataConfig,
    pub train: TrainConfig,
    pub loss: LossWeights,
    pub attribute: AttributeConfig,
    pub designer: DesignerConfig,
    pub pose: PoseTransferConfig,
    pub vunet: VunetConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            id: "default".to_string(),
            checkpoint_dir: PathBuf::from("checkpoints"),
            is_train: true,
            seed: 0,
            data: DataConfig::default(),
            train: TrainConfig::default(),
            loss: LossWeights::default(),
            attribute: AttributeConfig::default(),
            designer: DesignerConfig::default(),
            pose: PoseTransferConfig::default(),
            vunet: VunetConfig::default(),
        }
    }
}

impl RunConfig {
    /// Load configuration from file, with `ATELIER_` environment overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(Error::MissingFile(path.to_path_buf()));
        }
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix("ATELIER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let cfg: RunConfig = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Directory holding this run's checkpoints
    pub fn run_dir(&self) -> PathBuf {
        self.checkpoint_dir.join(&self.id)
    }

    /// Cross-field consistency checks
    pub fn validate(&self) -> Result<()> {
        let data = &self.data;
        if data.fine_size == 0 {
            return Err(Error::Config("fine_size must be positive".into()));
        }
        if data.resize_or_crop == ResizeOrCrop::ResizeAndCrop && data.load_size < data.fine_size {
            return Err(Error::Config(format!(
                "load_size ({}) must be >= fine_size ({}) for resize_and_crop",
                data.load_size, data.fine_size
            )));
        }
        if data.color_gaussian_ksz % 2 == 0 {
            return Err(Error::Config(format!(
                "color_gaussian_ksz must be odd, got {}",
                data.color_gaussian_ksz
            )));
        }
        if !data.color_gaussian_sigma.is_finite() {
            return Err(Error::Config(format!(
                "color_gaussian_sigma must be finite, got {}",
                data.color_gaussian_sigma
            )));
        }
        let downs = 1usize << self.designer.n_downsample;
        if data.fine_size % downs != 0 {
            return Err(Error::Config(format!(
                "fine_size ({}) must be divisible by 2^n_downsample ({})",
                data.fine_size, downs
            )));
        }
        let vunet_downs = 1usize << self.vunet.n_scales;
        if data.fine_size % vunet_downs != 0 {
            return Err(Error::Config(format!(
                "fine_size ({}) must be divisible by 2^n_scales ({})",
                data.fine_size, vunet_downs
            )));
        }
        if self.vunet.n_latent_scales == 0 || self.vunet.n_latent_scales > self.vunet.n_scales {
            return Err(Error::Config(format!(
                "n_latent_scales ({}) must be in 1..={}",
                self.vunet.n_latent_scales, self.vunet.n_scales
            )));
        }
        for (name, w) in self.loss.entries() {
            if !(w >= 0.0) {
                return Err(Error::Config(format!(
                    "loss weight {name} must be nonnegative, got {w}"
                )));
            }
        }
        if self.train.batch_size == 0 {
            return Err(Error::Config("batch_size must be positive".into()));
        }
        if let Some(&bad) = self
            .pose
            .patch_indices
            .iter()
            .find(|&&i| i >= crate::types::JOINT_COUNT)
        {
            return Err(Error::Config(format!("patch index {bad} out of range")));
        }
        Ok(())
    }
}

/// Dataset files and per-sample transform settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub data_root: PathBuf,
    /// Sample index (id -> image path / cloth type)
    pub fn_sample: PathBuf,
    /// Attribute label table (id -> label vector)
    pub fn_label: PathBuf,
    /// Attribute vocabulary
    pub fn_entry: PathBuf,
    /// Split table (split name -> id list)
    pub fn_split: PathBuf,
    /// Landmark label table (id -> [[x, y, v], ...])
    pub fn_landmark: PathBuf,
    pub fn_seg_path: PathBuf,
    pub fn_edge_path: PathBuf,
    /// Category label table, required when jointly training categories
    pub fn_cat: Option<PathBuf>,
    /// Pose joint table (id -> [[x, y], ...]) for pose transfer
    pub fn_pose: Option<PathBuf>,
    /// Pair table (split name -> [[id_1, id_2], ...]) for pose transfer
    pub fn_pair: Option<PathBuf>,
    /// Bounding box table used by the alignment preprocessing
    pub fn_bbox: Option<PathBuf>,

    pub resize_or_crop: ResizeOrCrop,
    pub load_size: usize,
    pub fine_size: usize,
    pub image_normalize: ImageNormalize,
    pub max_dataset_size: Option<usize>,

    /// Edge pixels below this value are zeroed
    pub edge_threshold: u8,
    pub color_gaussian_ksz: usize,
    pub color_gaussian_sigma: f32,
    pub input_mask_mode: InputMaskMode,
    /// Number of segmentation labels
    pub seg_nc: usize,
    /// Landmark heatmap spread
    pub lm_delta: f32,
    /// Joint heatmap spread
    pub joint_delta: f32,
    /// Side of the square limb crops before resizing to `fine_size`
    pub limb_patch_size: usize,
    pub with_limbs: bool,
    pub n_attr: usize,
    pub sample_error_policy: SampleErrorPolicy,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("datasets/DeepFashion/Fashion_design"),
            fn_sample: PathBuf::from("Label/ca_samples.json"),
            fn_label: PathBuf::from("Label/ca_attr_label.json"),
            fn_entry: PathBuf::from("Label/attr_entry.json"),
            fn_split: PathBuf::from("Split/ca_gan_split_trainval.json"),
            fn_landmark: PathBuf::from("Label/ca_landmark_label_256.json"),
            fn_seg_path: PathBuf::from("Label/ca_seg_paths.json"),
            fn_edge_path: PathBuf::from("Label/ca_edge_paths.json"),
            fn_cat: None,
            fn_pose: None,
            fn_pair: None,
            fn_bbox: None,
            resize_or_crop: ResizeOrCrop::Resize,
            load_size: 256,
            fine_size: 224,
            image_normalize: ImageNormalize::Standard,
            max_dataset_size: None,
            edge_threshold: 0,
            color_gaussian_ksz: 15,
            color_gaussian_sigma: 10.0,
            input_mask_mode: InputMaskMode::Binary,
            seg_nc: 7,
            lm_delta: 15.0,
            joint_delta: 6.0,
            limb_patch_size: 32,
            with_limbs: false,
            n_attr: 1000,
            sample_error_policy: SampleErrorPolicy::FailFast,
        }
    }
}

impl DataConfig {
    /// Resolve a dataset-relative path
    pub fn resolve(&self, rel: &Path) -> PathBuf {
        if rel.is_absolute() {
            rel.to_path_buf()
        } else {
            self.data_root.join(rel)
        }
    }
}

/// Optimisation, schedule and loader settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub batch_size: usize,
    pub num_workers: usize,
    /// Capacity of the prefetch queue, in batches
    pub prefetch: usize,
    pub lr: f64,
    /// Discriminator learning rate (pose transfer variants)
    pub lr_d: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub weight_decay: f64,
    pub lr_policy: LrPolicy,
    /// First epoch label of this run
    pub epoch_count: usize,
    /// Epochs at the initial learning rate
    pub niter: usize,
    /// Epochs of linear decay to zero (lambda policy)
    pub niter_decay: usize,
    /// Step policy: multiply by `lr_gamma` every `lr_decay` epochs
    pub lr_decay: usize,
    pub lr_gamma: f64,
    pub display_freq: usize,
    pub save_epoch_freq: usize,
    pub test_epoch_freq: usize,
    pub continue_train: bool,
    /// Checkpoint label to resume from / evaluate
    pub which_epoch: String,
    /// Capacity of the fake-image history buffer
    pub pool_size: usize,
    /// Record per-term gradient norms
    pub check_grad: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            batch_size: 8,
            num_workers: 4,
            prefetch: 4,
            lr: 2e-4,
            lr_d: 2e-4,
            beta1: 0.5,
            beta2: 0.999,
            weight_decay: 0.0,
            lr_policy: LrPolicy::Step,
            epoch_count: 1,
            niter: 30,
            niter_decay: 0,
            lr_decay: 10,
            lr_gamma: 0.1,
            display_freq: 10,
            save_epoch_freq: 5,
            test_epoch_freq: 5,
            continue_train: false,
            which_epoch: "latest".to_string(),
            pool_size: 50,
            check_grad: false,
        }
    }
}

/// Loss term weights; a zero weight disables the term entirely
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossWeights {
    pub gan: f64,
    pub l1: f64,
    pub attr: f64,
    pub vgg: f64,
    pub gp: f64,
    pub content: f64,
    pub style: f64,
    pub patch_style: f64,
    pub kl: f64,
    pub seg: f64,
    pub joint: f64,
    pub color: f64,
}

impl Default for LossWeights {
    fn default() -> Self {
        Self {
            gan: 1.0,
            l1: 1.0,
            attr: 1.0,
            vgg: 0.0,
            gp: 10.0,
            content: 1.0,
            style: 0.0,
            patch_style: 0.0,
            kl: 1e-6,
            seg: 0.0,
            joint: 0.0,
            color: 0.0,
        }
    }
}

impl LossWeights {
    pub fn entries(&self) -> [(&'static str, f64); 12] {
        [
            ("gan", self.gan),
            ("l1", self.l1),
            ("attr", self.attr),
            ("vgg", self.vgg),
            ("gp", self.gp),
            ("content", self.content),
            ("style", self.style),
            ("patch_style", self.patch_style),
            ("kl", self.kl),
            ("seg", self.seg),
            ("joint", self.joint),
            ("color", self.color),
        ]
    }
}

/// Attribute encoder settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AttributeConfig {
    pub n_attr: usize,
    pub input_nc: usize,
    /// Base width of the convolutional trunk
    pub nf: usize,
    pub n_layers: usize,
    /// Feed the landmark heatmap alongside the image
    pub input_lm: bool,
    pub lm_input_nc: usize,
    pub loss_type: AttributeLoss,
    /// Jointly train a category classifier
    pub joint_cat: bool,
    pub n_cat: usize,
    pub cat_loss_weight: f64,
    /// Normalization the encoder was trained with
    pub image_normalize: ImageNormalize,
}

impl Default for AttributeConfig {
    fn default() -> Self {
        Self {
            n_attr: 1000,
            input_nc: 3,
            nf: 32,
            n_layers: 4,
            input_lm: false,
            lm_input_nc: crate::types::LANDMARK_CHANNELS,
            loss_type: AttributeLoss::Bce,
            joint_cat: false,
            n_cat: 50,
            cat_loss_weight: 1e-2,
            image_normalize: ImageNormalize::ImageNet,
        }
    }
}

/// Designer GAN settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DesignerConfig {
    pub shape_encode: ShapeEncode,
    pub no_attr_condition: bool,
    pub attr_condition_type: AttrConditionType,
    pub post_mask_mode: PostMaskMode,
    pub which_gan: GanKind,
    /// Id of the pretrained attribute encoder run (`AE_` prefix optional)
    pub which_model_ae: String,
    pub ae_epoch: String,
    pub ngf: usize,
    pub ndf: usize,
    pub n_layers_d: usize,
    pub n_downsample: usize,
}

impl Default for DesignerConfig {
    fn default() -> Self {
        Self {
            shape_encode: ShapeEncode::Landmark,
            no_attr_condition: false,
            attr_condition_type: AttrConditionType::Feature,
            post_mask_mode: PostMaskMode::None,
            which_gan: GanKind::Lsgan,
            which_model_ae: "AE_default".to_string(),
            ae_epoch: "latest".to_string(),
            ngf: 64,
            ndf: 64,
            n_layers_d: 3,
            n_downsample: 4,
        }
    }
}

/// Supervised pose transfer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoseTransferConfig {
    pub pose_type: PoseType,
    /// Condition the discriminator on the target pose
    pub d_cond: bool,
    pub which_gan: GanKind,
    pub nf: usize,
    pub ndf: usize,
    pub n_layers_d: usize,
    pub n_downsample: usize,
    pub patch_size: usize,
    /// Joints used for patch style loss (face joints 14-17 excluded by default)
    pub patch_indices: Vec<usize>,
    pub joint_nc: usize,
}

impl Default for PoseTransferConfig {
    fn default() -> Self {
        Self {
            pose_type: PoseType::from_items(vec![PoseItem::Joint]),
            d_cond: true,
            which_gan: GanKind::Lsgan,
            nf: 64,
            ndf: 64,
            n_layers_d: 3,
            n_downsample: 4,
            patch_size: 32,
            patch_indices: (0..14).collect(),
            joint_nc: crate::types::JOINT_COUNT,
        }
    }
}

/// Variational U-Net settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VunetConfig {
    pub pose_type: PoseType,
    pub appearance_type: AppearanceType,
    pub output_type: OutputType,
    pub nf: usize,
    pub max_nf: usize,
    /// Number of down/up-sampling stages
    pub n_scales: usize,
    /// Number of bottom scales carrying a latent variable
    pub n_latent_scales: usize,
    pub n_residual_blocks: usize,
    /// Train on reference -> target pairs (false: reconstruct the reference)
    pub supervised: bool,
    pub masked_style: bool,
    pub loss_in_lab: bool,
    pub patch_padding: PatchPadding,
}

impl Default for VunetConfig {
    fn default() -> Self {
        Self {
            pose_type: PoseType::from_items(vec![PoseItem::Stickman]),
            appearance_type: AppearanceType { with_limbs: false },
            output_type: OutputType {
                seg: false,
                joint: false,
            },
            nf: 32,
            max_nf: 128,
            n_scales: 5,
            n_latent_scales: 2,
            n_residual_blocks: 2,
            supervised: true,
            masked_style: false,
            loss_in_lab: false,
            patch_padding: PatchPadding::Zero,
        }
    }
}
