//! The per-frame optimization driver: the two-stage analysis-by-synthesis fit.
//!
//! A [`Tracker`] owns the coefficient vector for one sequence and fits it to every frame in
//! turn. Each frame runs a cheap rigid stage (landmark error only, no rendering) to settle pose,
//! then a joint non-rigid stage that refines all blocks against the rendered photometric signal.
//! The converged coefficients of frame *t-1* warm-start frame *t*, so frames after the first
//! need far fewer iterations.

use ndarray::{Array1, Array2, Array3};

use std::ops::Range;

use crate::coeff::{Block, CoefficientVector};
use crate::crop::CropRegion;
use crate::error::{Error, Result};
use crate::image::Image;
use crate::loss;
use crate::model::{FaceModel, OutputGrads, RenderMode};
use crate::optim::{Adam, AdamOptions};
use crate::source::Landmarks;
use crate::timer::Timer;

/// Numeric knobs of the per-frame fit. The defaults match the reference tracker.
#[derive(Debug, Clone)]
pub struct FitConfig {
    /// Side length of the square fitting resolution.
    pub tar_size: u32,
    /// Rigid-stage iterations on the first fitted frame (no warm start yet).
    pub first_rigid_iters: u32,
    /// Non-rigid-stage iterations on the first fitted frame.
    pub first_nonrigid_iters: u32,
    /// Rigid-stage iterations on warm-started frames.
    pub rigid_iters: u32,
    /// Non-rigid-stage iterations on warm-started frames.
    pub nonrigid_iters: u32,
    pub rigid_lr: f32,
    pub nonrigid_lr: f32,
    pub lm_weight: f32,
    pub rgb_weight: f32,
    pub id_reg_weight: f32,
    pub exp_reg_weight: f32,
    pub tex_reg_weight: f32,
    pub reflect_weight: f32,
    /// Clamp negative expression coefficients to zero after every step. `None` follows the
    /// model variant's policy.
    pub expression_clamp: Option<bool>,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            tar_size: 512,
            first_rigid_iters: 500,
            first_nonrigid_iters: 300,
            rigid_iters: 50,
            nonrigid_iters: 30,
            rigid_lr: 1e-2,
            nonrigid_lr: 1e-2,
            lm_weight: 3e3,
            rgb_weight: 1.6,
            id_reg_weight: 1e-3,
            exp_reg_weight: 1.5e-4,
            tex_reg_weight: 3e-4,
            reflect_weight: 1.0,
            expression_clamp: None,
        }
    }
}

/// Everything a converged frame produces, handed to the exporter and dropped.
pub struct FitResult {
    /// The aligned (cropped and resized) input frame.
    pub aligned: Image,
    /// `(tar, tar, 4)` textured render.
    pub textured: Array3<f32>,
    /// `(tar, tar, 4)` geometry-only render.
    pub geometry: Array3<f32>,
    /// `(n, 3)` camera-space mesh vertices.
    pub vertices: Array2<f32>,
    /// `(n, 3)` per-vertex albedo.
    pub vertex_colors: Array2<f32>,
    /// Snapshot of the coefficients after this frame's fit.
    pub coeffs: CoefficientVector,
    /// Landmark loss per rigid iteration.
    pub rigid_losses: Vec<f32>,
    /// Weighted total loss per non-rigid iteration.
    pub nonrigid_losses: Vec<f32>,
}

/// The optimization driver for one sequence.
pub struct Tracker<M: FaceModel> {
    model: M,
    cfg: FitConfig,
    coeffs: CoefficientVector,
    lm_weights: Array1<f32>,
    rigid: Adam,
    nonrigid: Adam,
    crop: Option<CropRegion>,
    clamp_expressions: bool,
    frames_fitted: u64,
    t_rigid: Timer,
    t_nonrigid: Timer,
    t_export: Timer,
}

impl<M: FaceModel> Tracker<M> {
    /// Creates a fresh driver. The model must render at the configured fitting resolution.
    pub fn new(model: M, cfg: FitConfig) -> Self {
        assert_eq!(
            model.image_size(),
            cfg.tar_size,
            "model renders at {} but the fit runs at {}",
            model.image_size(),
            cfg.tar_size,
        );
        let layout = model.layout();
        let clamp_expressions = cfg
            .expression_clamp
            .unwrap_or_else(|| model.variant().clamps_negative_expressions());
        let rigid = Adam::new(
            layout,
            &[Block::Rotation, Block::Translation, Block::Identity, Block::Expression],
            AdamOptions::with_lr(cfg.rigid_lr),
        );
        let nonrigid = Adam::new(
            layout,
            &[
                Block::Identity,
                Block::Expression,
                Block::Gamma,
                Block::Texture,
                Block::Rotation,
                Block::Translation,
            ],
            AdamOptions::with_lr(cfg.nonrigid_lr),
        );
        Self {
            lm_weights: loss::landmark_weights(model.num_landmarks()),
            coeffs: CoefficientVector::zeros(layout),
            model,
            cfg,
            rigid,
            nonrigid,
            crop: None,
            clamp_expressions,
            frames_fitted: 0,
            t_rigid: Timer::new("rigid"),
            t_nonrigid: Timer::new("nonrigid"),
            t_export: Timer::new("export"),
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// The sequence's crop region, once the first frame established it.
    pub fn crop_region(&self) -> Option<&CropRegion> {
        self.crop.as_ref()
    }

    /// The current coefficient state (the warm start for the next frame).
    pub fn coefficients(&self) -> &CoefficientVector {
        &self.coeffs
    }

    pub fn frames_fitted(&self) -> u64 {
        self.frames_fitted
    }

    /// Returns profiling timers for the fit phases.
    pub fn timers(&self) -> impl Iterator<Item = &Timer> + '_ {
        [&self.t_rigid, &self.t_nonrigid, &self.t_export].into_iter()
    }

    /// Fits the coefficients to one frame and returns the per-frame outputs.
    ///
    /// The first call establishes the sequence's [`CropRegion`]; later calls reuse it
    /// unchanged. On error before the first optimizer step (bad crop), the coefficient state is
    /// left untouched so a later frame could still warm-start cleanly.
    pub fn fit(&mut self, frame: &Image, landmarks: &Landmarks) -> Result<FitResult> {
        let first = self.crop.is_none();
        let crop = match self.crop {
            Some(crop) => crop,
            None => CropRegion::from_landmarks(landmarks)?,
        };
        let tar = self.cfg.tar_size;
        let aligned = crop.align(frame, tar)?;
        let target = crop.align_landmarks(landmarks, tar);
        let target_px = aligned.to_f32_rgb();

        let (rigid_iters, nonrigid_iters) = if first {
            (self.cfg.first_rigid_iters, self.cfg.first_nonrigid_iters)
        } else {
            (self.cfg.rigid_iters, self.cfg.nonrigid_iters)
        };

        let rigid_losses = self.rigid_stage(&target, rigid_iters)?;
        let nonrigid_losses = self.nonrigid_stage(&target, &target_px, nonrigid_iters)?;

        // Two no-grad passes for the preview composites and exports.
        let _guard = self.t_export.start();
        let textured = self.model.evaluate(&self.coeffs, RenderMode::Textured);
        let geometry = self.model.evaluate(&self.coeffs, RenderMode::Geometry);
        drop(_guard);

        if first {
            log::info!(
                "crop established: center {:?}, half extent {}",
                crop.center(),
                crop.half_extent(),
            );
            self.crop = Some(crop);
        }
        self.frames_fitted += 1;
        log::debug!(
            "frame {}: rigid {:?} -> {:?}, nonrigid -> {:?}",
            self.frames_fitted,
            rigid_losses.first(),
            rigid_losses.last(),
            nonrigid_losses.last(),
        );

        Ok(FitResult {
            aligned,
            textured: textured.rendered.expect("textured pass renders"),
            geometry: geometry.rendered.expect("geometry pass renders"),
            vertices: textured.vertices,
            vertex_colors: textured.vertex_colors.expect("textured pass has albedo"),
            coeffs: self.coeffs.clone(),
            rigid_losses,
            nonrigid_losses,
        })
    }

    /// Landmark-only pose fit. No rendering happens, which keeps the many first-frame
    /// iterations cheap.
    fn rigid_stage(&mut self, target: &Landmarks, iters: u32) -> Result<Vec<f32>> {
        let _guard = self.t_rigid.start();
        let layout = self.coeffs.layout();
        let mut losses = Vec::with_capacity(iters as usize);
        for iteration in 0..iters {
            let eval = self.model.evaluate(&self.coeffs, RenderMode::Landmarks);
            let (lm_loss, mut d_lm) =
                loss::landmark_loss(&eval.landmarks, target, &self.lm_weights, self.cfg.tar_size);
            let (id_loss, id_grad) = loss::l2(self.coeffs.block(Block::Identity));
            let (exp_loss, exp_grad) = loss::l2(self.coeffs.block(Block::Expression));
            let total = self.cfg.lm_weight * lm_loss
                + self.cfg.id_reg_weight * id_loss
                + self.cfg.exp_reg_weight * exp_loss;
            if !total.is_finite() {
                return Err(Error::Divergence {
                    stage: "rigid",
                    iteration,
                });
            }

            for g in &mut d_lm {
                g[0] *= self.cfg.lm_weight;
                g[1] *= self.cfg.lm_weight;
            }
            let mut grad = self.model.backward(&OutputGrads {
                landmarks: d_lm,
                ..Default::default()
            });
            add_scaled(&mut grad, layout.range(Block::Identity), &id_grad, self.cfg.id_reg_weight);
            add_scaled(&mut grad, layout.range(Block::Expression), &exp_grad, self.cfg.exp_reg_weight);

            self.rigid.step(&mut self.coeffs, &grad);
            if self.clamp_expressions {
                self.coeffs.clamp_non_negative(Block::Expression);
            }
            losses.push(lm_loss);
        }
        Ok(losses)
    }

    /// Joint fit against the full differentiable rendering.
    fn nonrigid_stage(
        &mut self,
        target: &Landmarks,
        target_px: &Array3<f32>,
        iters: u32,
    ) -> Result<Vec<f32>> {
        let _guard = self.t_nonrigid.start();
        let layout = self.coeffs.layout();
        let mut losses = Vec::with_capacity(iters as usize);
        for iteration in 0..iters {
            let eval = self.model.evaluate(&self.coeffs, RenderMode::Textured);
            let rendered = eval.rendered.as_ref().expect("textured pass renders");
            let albedo = eval.vertex_colors.as_ref().expect("textured pass has albedo");

            let (lm_loss, mut d_lm) =
                loss::landmark_loss(&eval.landmarks, target, &self.lm_weights, self.cfg.tar_size);
            let (photo, mut d_photo) = loss::photo_loss(rendered, target_px);
            let (reflect, mut d_reflect) = loss::reflectance_loss(albedo, self.model.skin_mask());
            let (id_loss, id_grad) = loss::l2(self.coeffs.block(Block::Identity));
            let (exp_loss, exp_grad) = loss::l2(self.coeffs.block(Block::Expression));
            let (tex_loss, tex_grad) = loss::l2(self.coeffs.block(Block::Texture));

            let total = self.cfg.lm_weight * lm_loss
                + self.cfg.rgb_weight * photo
                + self.cfg.reflect_weight * reflect
                + self.cfg.id_reg_weight * id_loss
                + self.cfg.exp_reg_weight * exp_loss
                + self.cfg.tex_reg_weight * tex_loss;
            if !total.is_finite() {
                return Err(Error::Divergence {
                    stage: "nonrigid",
                    iteration,
                });
            }

            for g in &mut d_lm {
                g[0] *= self.cfg.lm_weight;
                g[1] *= self.cfg.lm_weight;
            }
            d_photo.mapv_inplace(|g| g * self.cfg.rgb_weight);
            d_reflect.mapv_inplace(|g| g * self.cfg.reflect_weight);

            let mut grad = self.model.backward(&OutputGrads {
                landmarks: d_lm,
                rendered: Some(d_photo),
                vertex_colors: Some(d_reflect),
            });
            add_scaled(&mut grad, layout.range(Block::Identity), &id_grad, self.cfg.id_reg_weight);
            add_scaled(&mut grad, layout.range(Block::Expression), &exp_grad, self.cfg.exp_reg_weight);
            add_scaled(&mut grad, layout.range(Block::Texture), &tex_grad, self.cfg.tex_reg_weight);

            self.nonrigid.step(&mut self.coeffs, &grad);
            if self.clamp_expressions {
                self.coeffs.clamp_non_negative(Block::Expression);
            }
            losses.push(total);
        }
        Ok(losses)
    }
}

fn add_scaled(grad: &mut Array1<f32>, range: Range<usize>, block_grad: &Array1<f32>, weight: f32) {
    for (g, b) in grad
        .slice_mut(ndarray::s![range])
        .iter_mut()
        .zip(block_grad.iter())
    {
        *g += weight * b;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::linear::{LinearModel, LinearModelData};
    use crate::model::ModelVariant;
    use crate::source::NUM_LANDMARKS;

    const TAR: u32 = 64;

    fn tracker(clamp: Option<bool>) -> Tracker<LinearModel> {
        let model =
            LinearModel::new(LinearModelData::synthetic(ModelVariant::Full), TAR).unwrap();
        let cfg = FitConfig {
            tar_size: TAR,
            first_rigid_iters: 10,
            first_nonrigid_iters: 2,
            rigid_iters: 4,
            nonrigid_iters: 1,
            expression_clamp: clamp,
            ..FitConfig::default()
        };
        Tracker::new(model, cfg)
    }

    fn test_frame() -> (Image, Landmarks) {
        let frame = Image::new(320, 240);
        // A plausible face-sized landmark layout: span 80px around a nose point at the frame
        // center.
        let mut lms = Landmarks::new(NUM_LANDMARKS);
        for (i, p) in lms.positions_mut().iter_mut().enumerate() {
            let a = i as f32 / NUM_LANDMARKS as f32 * std::f32::consts::TAU;
            *p = [160.0 + 40.0 * a.cos(), 120.0 + 40.0 * a.sin()];
        }
        lms.positions_mut()[0] = [120.0, 120.0];
        lms.positions_mut()[16] = [200.0, 120.0];
        lms.positions_mut()[29] = [160.0, 120.0];
        (frame, lms)
    }

    #[test]
    fn crop_region_is_established_once_and_reused() {
        let mut tracker = tracker(None);
        let (frame, lms) = test_frame();
        assert!(tracker.crop_region().is_none());
        tracker.fit(&frame, &lms).unwrap();
        let crop = *tracker.crop_region().unwrap();

        // Different landmarks on the next frame must not move the crop.
        let mut moved = lms.clone();
        moved.map_positions(|p| [p[0] + 7.0, p[1] - 3.0]);
        tracker.fit(&frame, &moved).unwrap();
        assert_eq!(*tracker.crop_region().unwrap(), crop);
    }

    #[test]
    fn expression_clamp_holds_after_every_frame() {
        let mut tracker = tracker(Some(true));
        let (frame, lms) = test_frame();
        for _ in 0..2 {
            tracker.fit(&frame, &lms).unwrap();
            assert!(
                tracker
                    .coefficients()
                    .block(Block::Expression)
                    .iter()
                    .all(|&v| v >= 0.0),
                "negative expression coefficient survived the clamp"
            );
        }
    }

    #[test]
    fn fit_result_snapshots_the_warm_start() {
        let mut tracker = tracker(None);
        let (frame, lms) = test_frame();
        let fit = tracker.fit(&frame, &lms).unwrap();
        // The snapshot in the result is exactly the state the next frame starts from.
        assert_eq!(&fit.coeffs, tracker.coefficients());
        assert_eq!(fit.rigid_losses.len(), 10);
        assert_eq!(fit.nonrigid_losses.len(), 2);
    }

    #[test]
    fn bad_first_crop_leaves_state_untouched() {
        let mut tracker = tracker(None);
        let before = tracker.coefficients().clone();
        let (frame, mut lms) = test_frame();
        // Push the crop window far outside the padded frame.
        lms.map_positions(|p| [p[0] - 5000.0, p[1]]);
        assert!(tracker.fit(&frame, &lms).is_err());
        assert!(tracker.crop_region().is_none());
        assert_eq!(&before, tracker.coefficients());
    }
}
