//! Stable square cropping and landmark alignment.
//!
//! The crop region is derived once, from the first frame with a detection, and reused unchanged
//! for the rest of the sequence. Recomputing it per frame would break the temporal continuity
//! the coefficient warm start relies on, so the region is immutable after construction and an
//! out-of-bounds crop is a hard error rather than a silent clip.

use crate::error::{Error, Result};
use crate::image::Image;
use crate::source::Landmarks;

/// Fixed zero-padding margin, in pixels, applied to every frame before cropping.
pub const BORDER: u32 = 500;

/// Landmark indices used to derive the crop (Multi-PIE 68-point scheme).
const JAW_LEFT: usize = 0;
const JAW_RIGHT: usize = 16;
const NOSE_BRIDGE: usize = 29;

/// The square crop window of a sequence, in padded-frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRegion {
    center: [i64; 2],
    half_extent: i64,
    border: i64,
}

impl CropRegion {
    /// Derives the crop from the first detected frame's landmarks: the half-extent is the face
    /// span between the outer jaw points, the center sits on the nose bridge (offset into the
    /// padded frame by the border).
    pub fn from_landmarks(landmarks: &Landmarks) -> Result<Self> {
        let left = landmarks.get(JAW_LEFT);
        let right = landmarks.get(JAW_RIGHT);
        let span = ((right[0] - left[0]).powi(2) + (right[1] - left[1]).powi(2)).sqrt();
        if !span.is_finite() || span < 1.0 {
            return Err(Error::Data(format!("degenerate landmark span {span}")));
        }
        let half_extent = span as i64;
        let nose = landmarks.get(NOSE_BRIDGE);
        Ok(Self {
            center: [
                nose[0].round() as i64 + BORDER as i64,
                nose[1].round() as i64 + BORDER as i64,
            ],
            half_extent,
            border: BORDER as i64,
        })
    }

    pub fn center(&self) -> [i64; 2] {
        self.center
    }

    pub fn half_extent(&self) -> i64 {
        self.half_extent
    }

    pub fn border(&self) -> i64 {
        self.border
    }

    /// Crop-window origin in padded-frame coordinates.
    fn origin(&self) -> [i64; 2] {
        [
            self.center[0] - self.half_extent,
            self.center[1] - self.half_extent,
        ]
    }

    /// Pads `frame` symmetrically with zeros, extracts the crop square and box-filter resizes it
    /// to `tar_size` x `tar_size`.
    ///
    /// Fails with [`Error::CropOutOfBounds`] if the window does not fit the padded frame.
    pub fn align(&self, frame: &Image, tar_size: u32) -> Result<Image> {
        let [x0, y0] = self.origin();
        let x1 = self.center[0] + self.half_extent;
        let y1 = self.center[1] + self.half_extent;
        let padded_w = frame.width() as i64 + 2 * self.border;
        let padded_h = frame.height() as i64 + 2 * self.border;
        if x0 < 0 || y0 < 0 || x1 > padded_w || y1 > padded_h {
            return Err(Error::CropOutOfBounds {
                x0,
                x1,
                y0,
                y1,
                width: frame.width(),
                height: frame.height(),
            });
        }

        let side = 2 * self.half_extent;
        let mut out = Image::new(tar_size, tar_size);
        for dy in 0..tar_size as i64 {
            // Source rows covered by this output row (at least one).
            let sy0 = y0 + dy * side / tar_size as i64;
            let sy1 = (y0 + (dy + 1) * side / tar_size as i64).max(sy0 + 1).min(y1);
            for dx in 0..tar_size as i64 {
                let sx0 = x0 + dx * side / tar_size as i64;
                let sx1 = (x0 + (dx + 1) * side / tar_size as i64).max(sx0 + 1).min(x1);

                let mut sum = [0.0f32; 3];
                for sy in sy0..sy1 {
                    for sx in sx0..sx1 {
                        // Padded coordinates; everything outside the original frame stays black.
                        let fx = sx - self.border;
                        let fy = sy - self.border;
                        if fx >= 0 && fy >= 0 && fx < frame.width() as i64 && fy < frame.height() as i64
                        {
                            let rgba = frame.get(fx as u32, fy as u32);
                            for c in 0..3 {
                                sum[c] += rgba[c] as f32;
                            }
                        }
                    }
                }
                let count = ((sy1 - sy0) * (sx1 - sx0)) as f32;
                out.set(
                    dx as u32,
                    dy as u32,
                    [
                        (sum[0] / count).round() as u8,
                        (sum[1] / count).round() as u8,
                        (sum[2] / count).round() as u8,
                        255,
                    ],
                );
            }
        }
        Ok(out)
    }

    /// Maps a raw frame-space point into crop-local target-resolution coordinates.
    pub fn to_crop_space(&self, p: [f32; 2], tar_size: u32) -> [f32; 2] {
        let [x0, y0] = self.origin();
        let scale = tar_size as f32 / (2.0 * self.half_extent as f32);
        [
            (p[0] - (x0 - self.border) as f32) * scale,
            (p[1] - (y0 - self.border) as f32) * scale,
        ]
    }

    /// Inverse of [`CropRegion::to_crop_space`].
    pub fn to_frame_space(&self, p: [f32; 2], tar_size: u32) -> [f32; 2] {
        let [x0, y0] = self.origin();
        let scale = 2.0 * self.half_extent as f32 / tar_size as f32;
        [
            p[0] * scale + (x0 - self.border) as f32,
            p[1] * scale + (y0 - self.border) as f32,
        ]
    }

    /// Maps a whole landmark set into crop-local coordinates.
    pub fn align_landmarks(&self, landmarks: &Landmarks, tar_size: u32) -> Landmarks {
        let mut out = landmarks.clone();
        out.map_positions(|p| self.to_crop_space(p, tar_size));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::NUM_LANDMARKS;
    use approx::assert_relative_eq;

    fn landmarks(jaw_left: [f32; 2], jaw_right: [f32; 2], nose: [f32; 2]) -> Landmarks {
        let mut lms = Landmarks::new(NUM_LANDMARKS);
        lms.positions_mut()[JAW_LEFT] = jaw_left;
        lms.positions_mut()[JAW_RIGHT] = jaw_right;
        lms.positions_mut()[NOSE_BRIDGE] = nose;
        lms
    }

    #[test]
    fn derived_from_landmark_span_and_nose() {
        let lms = landmarks([100.0, 200.0], [220.0, 200.0], [160.0, 230.0]);
        let crop = CropRegion::from_landmarks(&lms).unwrap();
        assert_eq!(crop.half_extent(), 120);
        assert_eq!(crop.center(), [160 + BORDER as i64, 230 + BORDER as i64]);
        assert_eq!(crop.border(), BORDER as i64);
    }

    #[test]
    fn degenerate_span_is_rejected() {
        let lms = landmarks([50.0, 50.0], [50.0, 50.0], [50.0, 50.0]);
        assert!(CropRegion::from_landmarks(&lms).is_err());
    }

    #[test]
    fn transform_roundtrip() {
        let lms = landmarks([100.0, 200.0], [220.0, 200.0], [160.0, 230.0]);
        let crop = CropRegion::from_landmarks(&lms).unwrap();
        for p in [[0.0, 0.0], [160.0, 230.0], [533.0, 41.5]] {
            let there = crop.to_crop_space(p, 512);
            let back = crop.to_frame_space(there, 512);
            assert_relative_eq!(back[0], p[0], epsilon = 1e-3);
            assert_relative_eq!(back[1], p[1], epsilon = 1e-3);
        }
    }

    #[test]
    fn align_resizes_and_pads() {
        // A white 10x10 frame; the 24px crop window around the frame center reaches well into
        // the zero padding.
        let mut frame = Image::new(10, 10);
        for y in 0..10 {
            for x in 0..10 {
                frame.set(x, y, [255, 255, 255, 255]);
            }
        }
        let lms = landmarks([(-1.0), 5.0], [11.0, 5.0], [5.0, 5.0]);
        let crop = CropRegion::from_landmarks(&lms).unwrap();
        assert_eq!(crop.half_extent(), 12);

        let aligned = crop.align(&frame, 6).unwrap();
        assert_eq!(aligned.width(), 6);
        assert_eq!(aligned.height(), 6);
        // Center is pure frame content, the outermost pixels are pure padding, and the ring in
        // between averages both.
        assert_eq!(aligned.get(3, 3), [255, 255, 255, 255]);
        assert_eq!(aligned.get(0, 0), [0, 0, 0, 255]);
        let mixed = aligned.get(1, 1);
        assert!(mixed[0] > 0 && mixed[0] < 255, "mixed: {mixed:?}");
    }

    #[test]
    fn out_of_bounds_crop_fails_loudly() {
        let lms = landmarks([-700.0, 0.0], [-100.0, 0.0], [-400.0, 0.0]);
        let crop = CropRegion::from_landmarks(&lms).unwrap();
        let frame = Image::new(64, 64);
        match crop.align(&frame, 32) {
            Err(Error::CropOutOfBounds { x0, .. }) => assert!(x0 < 0),
            other => panic!("expected CropOutOfBounds, got {other:?}"),
        }
    }
}
