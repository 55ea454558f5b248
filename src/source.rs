//! Frame sources: sequential providers of video frames and detected 2D landmarks.
//!
//! Video decoding and the landmark detector itself are external collaborators; this module
//! defines the contract they have to satisfy ([`FrameSource`]) and ships a file-based
//! implementation ([`SequenceDir`]) that replays the output of an offline detector pass.

use std::{
    fs::File,
    io::{BufReader, BufWriter},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::image::Image;

/// Number of points in the facial landmark scheme (Multi-PIE 68-point markup).
pub const NUM_LANDMARKS: usize = 68;

/// An ordered set of 2D facial landmarks.
///
/// Depending on where a value comes from, positions are either in raw frame coordinates (straight
/// from the detector) or in crop-local target-resolution coordinates (after alignment). The two
/// spaces are related by the affine map of [`CropRegion`](crate::crop::CropRegion).
#[derive(Debug, Clone, PartialEq)]
pub struct Landmarks {
    positions: Box<[[f32; 2]]>,
}

impl Landmarks {
    /// Creates a new [`Landmarks`] collection containing `len` preallocated landmarks.
    ///
    /// All landmarks start at `(0.0, 0.0)`.
    pub fn new(len: usize) -> Self {
        Self {
            positions: vec![[0.0, 0.0]; len].into_boxed_slice(),
        }
    }

    pub fn from_positions(positions: Vec<[f32; 2]>) -> Self {
        Self {
            positions: positions.into_boxed_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    #[inline]
    pub fn get(&self, index: usize) -> [f32; 2] {
        self.positions[index]
    }

    pub fn positions(&self) -> &[[f32; 2]] {
        &self.positions
    }

    pub fn positions_mut(&mut self) -> &mut [[f32; 2]] {
        &mut self.positions
    }

    pub fn iter(&self) -> impl Iterator<Item = [f32; 2]> + Clone + '_ {
        self.positions.iter().copied()
    }

    pub fn map_positions(&mut self, mut f: impl FnMut([f32; 2]) -> [f32; 2]) {
        for pos in self.positions_mut() {
            *pos = f(*pos);
        }
    }
}

/// What a [`FrameSource`] yields for one step of the stream.
#[derive(Debug)]
pub enum FrameEvent {
    /// A frame with a detected face.
    Frame {
        image: Image,
        /// Landmarks in raw frame coordinates.
        landmarks: Landmarks,
        index: u64,
    },
    /// A frame on which no face was detected. More frames follow; the tracker skips it without
    /// touching its state.
    Skipped { index: u64 },
    /// The stream is exhausted. Normal termination, not an error.
    End,
}

/// A sequential provider of frames and landmarks.
pub trait FrameSource {
    /// Yields the next event of the stream.
    fn next_frame(&mut self) -> Result<FrameEvent>;

    /// Frame rate of the underlying stream.
    fn fps(&self) -> f32;

    /// Total number of frames, if known up front.
    fn frame_count(&self) -> Option<u64>;
}

/// Per-sequence metadata: frame rate plus the detector output for every frame.
///
/// `landmarks[i]` is `None` for frames on which the detector found no face. Stored as a bincode
/// file next to the frame images.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceMeta {
    pub fps: f32,
    pub landmarks: Vec<Option<Vec<[f32; 2]>>>,
}

impl SequenceMeta {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = BufReader::new(File::open(path.as_ref())?);
        let meta: SequenceMeta = bincode::deserialize_from(file)?;
        for (i, lms) in meta.landmarks.iter().enumerate() {
            if let Some(lms) = lms {
                if lms.len() != NUM_LANDMARKS {
                    return Err(Error::Data(format!(
                        "frame {i} has {} landmarks, expected {NUM_LANDMARKS}",
                        lms.len()
                    )));
                }
            }
        }
        Ok(meta)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = BufWriter::new(File::create(path.as_ref())?);
        bincode::serialize_into(file, self)?;
        Ok(())
    }
}

/// File name of the metadata sidecar inside a sequence directory.
pub const META_FILE: &str = "landmarks.bin";

/// A [`FrameSource`] reading a directory of numbered frame images plus a [`SequenceMeta`]
/// sidecar.
///
/// Frames are named `000000.png`, `000001.png`, ... (`jpg` also accepted), indexed from zero.
pub struct SequenceDir {
    dir: PathBuf,
    meta: SequenceMeta,
    next: u64,
}

impl SequenceDir {
    /// Opens a sequence directory, reading its metadata sidecar.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let meta = SequenceMeta::load(dir.join(META_FILE))?;
        log::info!(
            "{}: {} frames @ {} FPS",
            dir.display(),
            meta.landmarks.len(),
            meta.fps,
        );
        Ok(Self { dir, meta, next: 0 })
    }

    fn frame_path(&self, index: u64) -> Result<PathBuf> {
        for ext in ["png", "jpg", "jpeg"] {
            let path = self.dir.join(format!("{index:06}.{ext}"));
            if path.exists() {
                return Ok(path);
            }
        }
        Err(Error::Data(format!(
            "missing frame image {index:06} in '{}'",
            self.dir.display()
        )))
    }
}

impl FrameSource for SequenceDir {
    fn next_frame(&mut self) -> Result<FrameEvent> {
        let index = self.next;
        if index as usize >= self.meta.landmarks.len() {
            return Ok(FrameEvent::End);
        }
        self.next += 1;

        match &self.meta.landmarks[index as usize] {
            None => Ok(FrameEvent::Skipped { index }),
            Some(lms) => {
                let image = Image::load(self.frame_path(index)?)?;
                Ok(FrameEvent::Frame {
                    image,
                    landmarks: Landmarks::from_positions(lms.clone()),
                    index,
                })
            }
        }
    }

    fn fps(&self) -> f32 {
        self.meta.fps
    }

    fn frame_count(&self) -> Option<u64> {
        Some(self.meta.landmarks.len() as u64)
    }
}
