//! Gaussian heatmaps for garment landmarks and body joints.
//!
//! Both generators return CHW arrays. A channel is either a Gaussian bump
//! `exp(-d² / δ²)` centred on its point or exactly zero.

use ndarray::{Array3, ArrayViewMut2, Axis};

use atelier_core::{ClothType, Error, JointCoords, LandmarkPoint, Result, LANDMARK_CHANNELS};

/// Default landmark spread in pixels
pub const DEFAULT_LANDMARK_DELTA: f32 = 15.0;

fn draw_gaussian(mut channel: ArrayViewMut2<f32>, cx: f32, cy: f32, delta: f32) {
    let inv = 1.0 / (delta * delta);
    for ((y, x), v) in channel.indexed_iter_mut() {
        let dx = x as f32 - cx;
        let dy = y as f32 - cy;
        *v = (-(dx * dx + dy * dy) * inv).exp();
    }
}

/// Render the 18-channel landmark heatmap of one sample
///
/// Landmarks are placed in the channel block of their cloth type
/// (`[0,6)` upper, `[6,10)` lower, `[10,18)` full). Invisible landmarks
/// leave their channel at zero, as do all channels of the other blocks.
pub fn landmark_heatmap(
    width: usize,
    height: usize,
    landmarks: &[LandmarkPoint],
    cloth_type: i64,
    delta: f32,
) -> Result<Array3<f32>> {
    let cloth = ClothType::from_code(cloth_type)?;
    if landmarks.len() != cloth.landmark_count() {
        return Err(Error::LandmarkCountMismatch {
            cloth_type,
            expected: cloth.landmark_count(),
            actual: landmarks.len(),
        });
    }

    let mut map = Array3::<f32>::zeros((LANDMARK_CHANNELS, height, width));
    for (offset, lm) in cloth.channel_range().zip(landmarks) {
        if !lm.is_visible() {
            continue;
        }
        draw_gaussian(map.index_axis_mut(Axis(0), offset), lm.x, lm.y, delta);
    }
    Ok(map)
}

/// Render one channel per joint; missing joints (negative coordinates) stay zero
pub fn joint_heatmap(width: usize, height: usize, joints: &JointCoords, delta: f32) -> Array3<f32> {
    let mut map = Array3::<f32>::zeros((joints.len(), height, width));
    for i in 0..joints.len() {
        if let Some([x, y]) = joints.get(i) {
            draw_gaussian(map.index_axis_mut(Axis(0), i), x, y, delta);
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn upper_landmarks() -> Vec<LandmarkPoint> {
        vec![
            LandmarkPoint::new(10.0, 10.0, 0),
            LandmarkPoint::new(20.0, 10.0, 0),
            LandmarkPoint::new(10.0, 30.0, 1),
            LandmarkPoint::new(20.0, 30.0, 2),
            LandmarkPoint::new(5.0, 40.0, 0),
            LandmarkPoint::new(25.0, 40.0, 0),
        ]
    }

    #[test]
    fn test_upper_body_channels() {
        let map = landmark_heatmap(32, 48, &upper_landmarks(), 1, DEFAULT_LANDMARK_DELTA).unwrap();
        assert_eq!(map.dim(), (18, 48, 32));

        // peak value 1 at the landmark position
        assert_abs_diff_eq!(map[[0, 10, 10]], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(map[[2, 30, 10]], 1.0, epsilon = 1e-6);
        // invisible landmark
        assert!(map.index_axis(Axis(0), 3).iter().all(|&v| v == 0.0));
        // lower and full blocks untouched
        for c in 6..18 {
            assert!(map.index_axis(Axis(0), c).iter().all(|&v| v == 0.0));
        }
    }

    #[test]
    fn test_gaussian_falloff() {
        let map = landmark_heatmap(64, 64, &upper_landmarks(), 1, 15.0).unwrap();
        let expected = (-(15.0f32 * 15.0) / 225.0).exp();
        assert_abs_diff_eq!(map[[0, 10, 25]], expected, epsilon = 1e-6);
    }

    #[test]
    fn test_full_body_uses_last_block() {
        let lms: Vec<_> = (0..8).map(|i| LandmarkPoint::new(i as f32, 0.0, 0)).collect();
        let map = landmark_heatmap(16, 16, &lms, 3, 4.0).unwrap();
        for c in 0..10 {
            assert!(map.index_axis(Axis(0), c).iter().all(|&v| v == 0.0));
        }
        for c in 10..18 {
            assert!(map.index_axis(Axis(0), c).iter().any(|&v| v > 0.0));
        }
    }

    #[test]
    fn test_schema_errors() {
        let err = landmark_heatmap(8, 8, &upper_landmarks()[..4], 1, 15.0).unwrap_err();
        assert!(matches!(
            err,
            Error::LandmarkCountMismatch {
                cloth_type: 1,
                expected: 6,
                actual: 4
            }
        ));
        let err = landmark_heatmap(8, 8, &upper_landmarks(), 5, 15.0).unwrap_err();
        assert!(matches!(err, Error::UnknownClothType(5)));
    }

    #[test]
    fn test_missing_joint_channel_is_zero() {
        let joints = JointCoords(vec![[4.0, 4.0], [-1.0, -1.0], [2.0, -1.0]]);
        let map = joint_heatmap(8, 8, &joints, 6.0);
        assert_abs_diff_eq!(map[[0, 4, 4]], 1.0, epsilon = 1e-6);
        assert!(map.index_axis(Axis(0), 1).iter().all(|&v| v == 0.0));
        assert!(map.index_axis(Axis(0), 2).iter().all(|&v| v == 0.0));
    }
}
