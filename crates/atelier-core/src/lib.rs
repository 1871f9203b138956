//! # Atelier-Core
//!
//! Shared types, mode selectors, run configuration and the error type for the
//! Atelier conditional fashion-image generation pipeline.
//!
//! Three model families build on these definitions:
//!
//! 1. **Designer GAN**: shape code + attribute code -> garment image
//! 2. **Supervised pose transfer**: reference image + target pose -> image
//! 3. **Variational U-Net pose transfer**: appearance latent + pose decoder
//!
//! plus the attribute encoder they condition on.

pub mod options;
pub mod error;
pub mod modes;
pub mod types;

pub use options::*;
pub use error::{Error, Result};
pub use modes::*;
pub use types::*;
