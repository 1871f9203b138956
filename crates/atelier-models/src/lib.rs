//! # Atelier-Models
//!
//! Networks, losses and training orchestration for the Atelier pipeline.
//!
//! ## Components
//!
//! - **networks**: U-Net generator, PatchGAN discriminator, attribute
//!   encoder, variational U-Net and the frozen perceptual feature network
//! - **losses** / **patches** / **penalty** / **composer**: loss terms and
//!   their weighted composition
//! - **pool**, **metrics**, **masking**: image pool, PSNR/SSIM, post masks
//! - **optim**, **scheduler**, **checkpoint**: Adam state, learning-rate
//!   policies and safetensors checkpoints
//! - **attribute**, **designer**, **supervised**, **vunet**: the
//!   [`PipelineModel`] variants
//! - **trainer**: the async epoch loop

pub mod attribute;
pub mod checkpoint;
pub mod composer;
pub mod designer;
pub mod losses;
pub mod masking;
pub mod metrics;
pub mod model;
pub mod networks;
pub mod optim;
pub mod patches;
pub mod penalty;
pub mod pool;
pub mod scheduler;
pub mod supervised;
pub mod trainer;
pub mod vunet;

pub use attribute::{AttributeModel, FrozenAttributeEncoder};
pub use checkpoint::CheckpointStore;
pub use composer::{LossComposer, LossTerm};
pub use designer::DesignerModel;
pub use model::{PipelineModel, StepPhase, StepTracker};
pub use optim::{Adam, AdamParams};
pub use pool::ImagePool;
pub use scheduler::LrScheduler;
pub use supervised::SupervisedPoseModel;
pub use trainer::{evaluate, train, EpochSummary, ErrorMeter};
pub use vunet::{VunetMode, VunetModel};
