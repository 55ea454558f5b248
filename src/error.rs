//! Crate-wide error type.

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("data decode error: {0}")]
    Decode(#[from] bincode::Error),

    #[error("malformed data: {0}")]
    Data(String),

    /// The square crop derived from the first frame's landmarks does not fit inside the padded
    /// frame. Recovering by clipping would desynchronize the coefficient warm start, so this is
    /// fatal for the sequence.
    #[error(
        "crop region {x0}..{x1} x {y0}..{y1} exceeds the padded {width}x{height} frame bounds"
    )]
    CropOutOfBounds {
        x0: i64,
        x1: i64,
        y0: i64,
        y1: i64,
        width: u32,
        height: u32,
    },

    /// The sequence ended (or reported "no face") before a single frame with landmarks arrived,
    /// so no crop region could be established.
    #[error("no face was detected on the first frame of the sequence")]
    FirstFrameUndetected,

    /// The total loss became non-finite during optimization.
    #[error("optimization diverged: non-finite loss in {stage} stage at iteration {iteration}")]
    Divergence { stage: &'static str, iteration: u32 },
}

pub type Result<T> = std::result::Result<T, Error>;
