//! Analysis-by-synthesis 3D face tracking for video.
//!
//! facefit fits a parametric 3D face model (shape, expression, texture, pose, illumination) to
//! a video stream, frame by frame. For each frame a low-dimensional coefficient vector is
//! optimized so that the model, projected into the camera, matches the observed 2D landmarks
//! and pixel colors:
//!
//! 1. A square crop around the face is derived from the first frame's landmarks and reused for
//!    the whole sequence ([`crop`]).
//! 2. A cheap rigid stage fits pose and coarse shape against the landmarks alone, then a joint
//!    non-rigid stage refines every coefficient block against the rendered photometric error
//!    ([`track`]).
//! 3. Each frame's converged coefficients warm-start the next frame.
//!
//! The morphable model itself is pluggable via the [`model::FaceModel`] trait;
//! [`model::linear`] ships a CPU reference implementation. Frames and landmarks come from a
//! [`source::FrameSource`], per-frame outputs (composite previews, meshes, coefficients) go
//! through [`export`], and [`batch`] drives whole directories of sequences.

use log::LevelFilter;

pub mod batch;
pub mod coeff;
pub mod crop;
pub mod error;
pub mod export;
pub mod image;
pub mod loss;
pub mod model;
pub mod optim;
pub mod source;
pub mod timer;
pub mod track;

pub use error::{Error, Result};

/// macro-use only, not part of public API.
#[doc(hidden)]
pub fn init_logger(calling_crate: &'static str) {
    let log_level = if cfg!(debug_assertions) {
        LevelFilter::Trace
    } else {
        LevelFilter::Debug
    };
    env_logger::Builder::new()
        .filter(Some(calling_crate), log_level)
        .filter(Some(env!("CARGO_PKG_NAME")), log_level)
        .parse_default_env()
        .try_init()
        .ok();
}

/// Initializes logging to *stderr*.
///
/// If `cfg!(debug_assertions)` is enabled, the calling crate and facefit will log at *trace*
/// level. Otherwise, they will log at *debug* level.
///
/// If a global logger is already registered, this macro will do nothing.
#[macro_export]
macro_rules! init_logger {
    () => {
        $crate::init_logger(env!("CARGO_CRATE_NAME"))
    };
}
