//! # Atelier Data
//!
//! Dataset indexing and per-sample tensor assembly for the Atelier pipeline:
//!
//! - **index**: joins the JSON label tables of one split
//! - **heatmap**: landmark and joint Gaussian heatmaps
//! - **image_ops** / **normalize**: HWC array transforms and normalization
//! - **assembly** / **pose**: multi-modal samples and pose pairs
//! - **batch** / **loader**: collation and the prefetching worker pool
//! - **preproc**: offline bounding-box alignment

pub mod assembly;
pub mod batch;
pub mod heatmap;
pub mod image_ops;
pub mod index;
pub mod loader;
pub mod normalize;
pub mod pose;
pub mod preproc;

pub use assembly::{AttributeSample, ChannelLayout, SampleAssembler, SampleTensors};
pub use batch::{BatchTensorSet, Collate};
pub use heatmap::{joint_heatmap, landmark_heatmap};
pub use image_ops::{CropPolicy, Geometry};
pub use index::{DatasetIndex, PoseIndex};
pub use loader::{AttributeSource, DataLoader, LoaderConfig, SampleSource};
pub use normalize::{std_to_imagenet, Normalization};
pub use pose::{PairAssembler, PairSample};
