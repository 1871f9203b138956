//! Compositing of generated images with the reference by segmentation label.

use candle_core::{DType, Result, Tensor};

use atelier_core::PostMaskMode;

/// Keep generated pixels where the mask is set and reference pixels elsewhere.
///
/// `seg_map` (B, 1, H, W) holds labels as floats. `fuse_face` keeps the
/// generated background and body (`seg == 0 | seg > 2`), `fuse_face+bg`
/// keeps only the body (`seg > 2`).
pub fn post_mask(img: &Tensor, seg_map: &Tensor, reference: &Tensor, mode: PostMaskMode) -> Result<Tensor> {
    let mask = match mode {
        PostMaskMode::None => return Ok(img.clone()),
        PostMaskMode::FuseFace => {
            let background = seg_map.eq(0.0)?.to_dtype(DType::F32)?;
            let body = seg_map.gt(2.0)?.to_dtype(DType::F32)?;
            background.maximum(&body)?
        }
        PostMaskMode::FuseFaceAndBackground => seg_map.gt(2.0)?.to_dtype(DType::F32)?,
    };
    let mask = mask.to_dtype(img.dtype())?;
    let keep = img.broadcast_mul(&mask)?;
    let fill = reference.broadcast_mul(&mask.affine(-1.0, 1.0)?)?;
    keep + fill
}
