//! The face model contract.
//!
//! The 3D morphable model (mesh topology, blendshape bases, differentiable renderer) is an
//! external collaborator. This module pins down the interface the tracker optimizes against:
//! a deterministic, differentiable function from a [`CoefficientVector`] to projected landmarks,
//! an optional rendered image, and per-vertex colors — plus the reverse-mode seam that turns
//! gradients with respect to those outputs into gradients with respect to the coefficients.

pub mod linear;

use ndarray::{Array1, Array2, Array3, ArrayView1};
use serde::{Deserialize, Serialize};

use crate::coeff::{BlockLayout, CoefficientVector};
use crate::source::Landmarks;

/// The closed set of supported model variants.
///
/// A variant fixes the coefficient block sizes and the expression-clamp policy as data; no other
/// code branches on the variant directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelVariant {
    /// The full model: large identity/expression/texture bases, non-negative expression weights.
    Full,
    /// A reduced model with smaller bases and signed expression weights.
    Simplified,
}

impl ModelVariant {
    /// The coefficient block sizes this variant uses.
    pub fn layout(&self) -> BlockLayout {
        match self {
            ModelVariant::Full => BlockLayout {
                identity: 150,
                expression: 171,
                texture: 251,
                rotation: 3,
                gamma: 27,
                translation: 3,
            },
            ModelVariant::Simplified => BlockLayout {
                identity: 50,
                expression: 52,
                texture: 50,
                rotation: 3,
                gamma: 27,
                translation: 3,
            },
        }
    }

    /// Whether negative expression coefficients are physically meaningless for this variant's
    /// blendshape basis and must be clamped to zero after every optimizer step.
    pub fn clamps_negative_expressions(&self) -> bool {
        match self {
            ModelVariant::Full => true,
            ModelVariant::Simplified => false,
        }
    }
}

/// How much of the model to evaluate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    /// Projected landmarks and vertices only. No rendering; used by the rigid stage.
    Landmarks,
    /// Rasterize the mesh with a uniform albedo (geometry-only preview).
    Geometry,
    /// Rasterize the mesh with the estimated per-vertex texture.
    Textured,
}

impl RenderMode {
    pub fn renders(&self) -> bool {
        !matches!(self, RenderMode::Landmarks)
    }

    pub fn textured(&self) -> bool {
        matches!(self, RenderMode::Textured)
    }
}

/// The outputs of one forward evaluation.
pub struct Evaluation {
    /// Projected 2D landmarks, in target-resolution pixel coordinates.
    pub landmarks: Landmarks,
    /// `(size, size, 4)` RGBA render, channels in 0..=255, alpha > 0 where the mesh covers the
    /// pixel. `None` in [`RenderMode::Landmarks`].
    pub rendered: Option<Array3<f32>>,
    /// `(num_vertices, 3)` per-vertex albedo in 0..=255 (before illumination). `None` unless the
    /// evaluation was textured.
    pub vertex_colors: Option<Array2<f32>>,
    /// `(num_vertices, 3)` camera-space vertex positions.
    pub vertices: Array2<f32>,
}

/// Gradients of a scalar loss with respect to the outputs of the most recent evaluation.
///
/// Fields that did not contribute to the loss stay `None`/empty and cost nothing.
#[derive(Default)]
pub struct OutputGrads {
    /// d loss / d projected-landmark positions. Empty when the landmark term was not used.
    pub landmarks: Vec<[f32; 2]>,
    /// `(size, size, 3)` d loss / d rendered RGB.
    pub rendered: Option<Array3<f32>>,
    /// `(num_vertices, 3)` d loss / d per-vertex albedo.
    pub vertex_colors: Option<Array2<f32>>,
}

/// A differentiable parametric face model.
///
/// `evaluate` must be deterministic given the coefficients. `backward` implements the
/// vector-Jacobian product for the *most recent* `evaluate` call; the tracker always pairs the
/// two, which lets implementations cache whatever forward state they need.
pub trait FaceModel {
    fn variant(&self) -> ModelVariant;

    /// The coefficient block sizes. Fixed for the lifetime of the model.
    fn layout(&self) -> BlockLayout {
        self.variant().layout()
    }

    /// Side length of the square render target, in pixels.
    fn image_size(&self) -> u32;

    fn num_landmarks(&self) -> usize;

    /// Per-vertex skin-prior weights in 0..=1, used by the reflectance loss.
    fn skin_mask(&self) -> ArrayView1<'_, f32>;

    /// Fixed mesh topology.
    fn triangles(&self) -> &[[u32; 3]];

    /// Runs the model forward.
    fn evaluate(&mut self, coeffs: &CoefficientVector, mode: RenderMode) -> Evaluation;

    /// Backpropagates `grads` through the most recent [`FaceModel::evaluate`] call, returning
    /// the packed gradient with respect to the coefficient vector.
    ///
    /// # Panics
    ///
    /// Implementations may panic if no evaluation happened yet.
    fn backward(&mut self, grads: &OutputGrads) -> Array1<f32>;
}
