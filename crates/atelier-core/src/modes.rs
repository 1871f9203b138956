//! Mode selectors recognised by the run configuration.
//!
//! Every selector parses from the string spelling used in option files and
//! rejects anything else with [`Error::UnknownMode`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

macro_rules! string_mode {
    (
        $(#[$meta:meta])*
        $name:ident, $option:literal {
            $( $(#[$vmeta:meta])* $variant:ident => $text:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $( $name::$variant => $text ),+
                }
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Error> {
                match s {
                    $( $text => Ok($name::$variant), )+
                    other => Err(Error::UnknownMode {
                        option: $option,
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl TryFrom<String> for $name {
            type Error = Error;

            fn try_from(s: String) -> Result<Self, Error> {
                s.parse()
            }
        }

        impl From<$name> for String {
            fn from(m: $name) -> String {
                m.as_str().to_string()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

string_mode! {
    /// Geometric preprocessing applied to every spatial map
    ResizeOrCrop, "resize_or_crop" {
        Resize => "resize",
        ResizeAndCrop => "resize_and_crop",
    }
}

string_mode! {
    /// Per-channel image normalization convention
    ImageNormalize, "image_normalize" {
        /// mean 0.5 / std 0.5, values in [-1, 1]
        Standard => "std",
        /// ImageNet mean/std statistics
        ImageNet => "imagenet",
    }
}

string_mode! {
    /// Source of the designer's shape code
    ShapeEncode, "shape_encode" {
        Landmark => "lm",
        Segmentation => "seg",
        LandmarkAndSegmentation => "lm+seg",
    }
}

string_mode! {
    /// Compositing of generated pixels with the reference image
    PostMaskMode, "post_mask_mode" {
        None => "none",
        FuseFace => "fuse_face",
        FuseFaceAndBackground => "fuse_face+bg",
    }
}

string_mode! {
    /// Adversarial objective
    GanKind, "which_gan" {
        Dcgan => "dcgan",
        Lsgan => "lsgan",
        Wgan => "wgan",
    }
}

string_mode! {
    /// How the segmentation map is turned into the conditioning mask
    InputMaskMode, "input_mask_mode" {
        /// Single garment-region channel selected by cloth type
        Binary => "binary",
        /// One channel per segmentation label
        OneHot => "one_hot",
        /// Single all-zero channel
        None => "none",
    }
}

string_mode! {
    /// Learning-rate schedule policy
    LrPolicy, "lr_policy" {
        Step => "step",
        Lambda => "lambda",
        Plateau => "plateau",
    }
}

string_mode! {
    /// Attribute classification loss
    AttributeLoss, "loss_type" {
        Bce => "bce",
        WeightedBce => "wbce",
    }
}

string_mode! {
    /// Representation of the attribute encoder output used as generator condition
    AttrConditionType, "attr_condition_type" {
        Feature => "feat",
        Probability => "prob",
    }
}

string_mode! {
    /// Policy applied when a single sample cannot be read
    SampleErrorPolicy, "sample_error_policy" {
        FailFast => "fail_fast",
        SkipAndLog => "skip_and_log",
    }
}

string_mode! {
    /// Padding used when a joint patch crosses the image border
    PatchPadding, "patch_padding" {
        Reflect => "reflect",
        Zero => "zero",
    }
}

impl Default for SampleErrorPolicy {
    fn default() -> Self {
        SampleErrorPolicy::FailFast
    }
}

/// One component of a `+`-joined pose representation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PoseItem {
    /// 18 joint heatmap channels
    Joint,
    /// Segmentation mask channels
    Seg,
    /// 3-channel stickman rendering
    Stickman,
}

/// Pose representation, e.g. `joint+seg`. Items are kept in sorted order so
/// that channel layout is independent of spelling order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PoseType(Vec<PoseItem>);

impl PoseType {
    pub fn from_items(mut items: Vec<PoseItem>) -> Self {
        items.sort();
        items.dedup();
        PoseType(items)
    }

    pub fn items(&self) -> &[PoseItem] {
        &self.0
    }

    pub fn contains(&self, item: PoseItem) -> bool {
        self.0.contains(&item)
    }

    /// Number of conditioning channels for this representation
    pub fn channels(&self, joint_nc: usize, seg_nc: usize) -> usize {
        self.0
            .iter()
            .map(|item| match item {
                PoseItem::Joint => joint_nc,
                PoseItem::Seg => seg_nc,
                PoseItem::Stickman => 3,
            })
            .sum()
    }
}

impl FromStr for PoseType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let mut items = Vec::new();
        for part in s.split('+') {
            let item = match part {
                "joint" => PoseItem::Joint,
                "seg" => PoseItem::Seg,
                "stickman" => PoseItem::Stickman,
                _ => {
                    return Err(Error::UnknownMode {
                        option: "pose_type",
                        value: s.to_string(),
                    })
                }
            };
            if !items.contains(&item) {
                items.push(item);
            }
        }
        items.sort();
        Ok(PoseType(items))
    }
}

impl fmt::Display for PoseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<&str> = self
            .0
            .iter()
            .map(|item| match item {
                PoseItem::Joint => "joint",
                PoseItem::Seg => "seg",
                PoseItem::Stickman => "stickman",
            })
            .collect();
        f.write_str(&parts.join("+"))
    }
}

impl TryFrom<String> for PoseType {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Error> {
        s.parse()
    }
}

impl From<PoseType> for String {
    fn from(p: PoseType) -> String {
        p.to_string()
    }
}

/// Appearance input of the variational U-Net
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AppearanceType {
    pub with_limbs: bool,
}

impl AppearanceType {
    /// 3 image channels, plus 8 limbs x RGB when limb crops are used
    pub fn channels(&self) -> usize {
        if self.with_limbs {
            3 + 24
        } else {
            3
        }
    }
}

impl FromStr for AppearanceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "image" => Ok(AppearanceType { with_limbs: false }),
            "image+limb" => Ok(AppearanceType { with_limbs: true }),
            other => Err(Error::UnknownMode {
                option: "appearance_type",
                value: other.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for AppearanceType {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Error> {
        s.parse()
    }
}

impl From<AppearanceType> for String {
    fn from(a: AppearanceType) -> String {
        if a.with_limbs {
            "image+limb".to_string()
        } else {
            "image".to_string()
        }
    }
}

/// Output heads of the variational U-Net; the image head is mandatory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OutputType {
    pub seg: bool,
    pub joint: bool,
}

impl OutputType {
    pub fn channels(&self, seg_nc: usize, joint_nc: usize) -> usize {
        3 + if self.seg { seg_nc } else { 0 } + if self.joint { joint_nc } else { 0 }
    }
}

impl FromStr for OutputType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let mut image = false;
        let mut out = OutputType {
            seg: false,
            joint: false,
        };
        for part in s.split('+') {
            match part {
                "image" => image = true,
                "seg" => out.seg = true,
                "joint" => out.joint = true,
                _ => {
                    return Err(Error::UnknownMode {
                        option: "output_type",
                        value: s.to_string(),
                    })
                }
            }
        }
        if !image {
            return Err(Error::UnknownMode {
                option: "output_type",
                value: s.to_string(),
            });
        }
        Ok(out)
    }
}

impl TryFrom<String> for OutputType {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Error> {
        s.parse()
    }
}

impl From<OutputType> for String {
    fn from(o: OutputType) -> String {
        let mut parts = vec!["image"];
        if o.joint {
            parts.push("joint");
        }
        if o.seg {
            parts.push("seg");
        }
        parts.join("+")
    }
}
