//! Driving whole sequences, and batches of sequences, through the tracker.
//!
//! One sequence is processed start to finish with a fresh [`Tracker`]; within a sequence any
//! error is fatal (the warm start would be meaningless afterwards). Across a batch, a failing
//! sequence is recorded and the batch moves on.

use std::path::{Path, PathBuf};

use itertools::Itertools;

use crate::error::{Error, Result};
use crate::export::{ExportOptions, Exporter};
use crate::model::FaceModel;
use crate::source::{FrameEvent, FrameSource, SequenceDir};
use crate::track::{FitConfig, Tracker};

/// What a completed sequence reports back.
#[derive(Debug)]
pub struct FitSummary {
    pub sequence: PathBuf,
    pub frames_fitted: u64,
    /// Frames skipped because no face was detected.
    pub frames_skipped: u64,
    /// Total loss of the last fitted frame's final iteration.
    pub final_loss: Option<f32>,
}

/// Outcome of a batch run: per-sequence summaries and failures, in input order.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub summaries: Vec<FitSummary>,
    pub failures: Vec<(PathBuf, Error)>,
}

impl BatchReport {
    pub fn all_succeeded(&self) -> bool {
        self.failures.is_empty()
    }

    /// Logs the outcome, listing every failed sequence path.
    pub fn log(&self) {
        log::info!(
            "batch finished: {} sequences fitted, {} failed",
            self.summaries.len(),
            self.failures.len(),
        );
        if !self.failures.is_empty() {
            log::warn!(
                "failed sequences: {}",
                self.failures
                    .iter()
                    .map(|(path, err)| format!("{} ({err})", path.display()))
                    .join(", "),
            );
        }
    }
}

/// Runs one sequence to completion.
///
/// Skipped frames preserve the tracker's state; stream end finalizes the exporter. If the
/// stream ends or skips before the first detection, no crop region can be established and the
/// sequence fails with [`Error::FirstFrameUndetected`].
pub fn run_sequence<M: FaceModel, S: FrameSource>(
    tracker: &mut Tracker<M>,
    source: &mut S,
    exporter: &mut Exporter,
    sequence: &Path,
) -> Result<FitSummary> {
    let total = source.frame_count();
    let mut frames_skipped = 0;
    let mut final_loss = None;

    loop {
        match source.next_frame()? {
            FrameEvent::Frame {
                image,
                landmarks,
                index,
            } => {
                let fit = tracker.fit(&image, &landmarks)?;
                final_loss = fit
                    .nonrigid_losses
                    .last()
                    .or(fit.rigid_losses.last())
                    .copied();
                exporter.export(&fit, tracker.model().triangles())?;
                log::debug!(
                    "{} / {} frames, loss {:?}",
                    index + 1,
                    total.map_or_else(|| "?".into(), |n| n.to_string()),
                    final_loss,
                );
            }
            FrameEvent::Skipped { index } => {
                if tracker.frames_fitted() == 0 {
                    return Err(Error::FirstFrameUndetected);
                }
                log::debug!("frame {index}: no face detected, keeping previous coefficients");
                frames_skipped += 1;
            }
            FrameEvent::End => {
                if tracker.frames_fitted() == 0 {
                    return Err(Error::FirstFrameUndetected);
                }
                exporter.finish()?;
                break;
            }
        }
    }

    for timer in tracker.timers() {
        log::info!("{}: {timer}", sequence.display());
    }
    Ok(FitSummary {
        sequence: sequence.to_path_buf(),
        frames_fitted: tracker.frames_fitted(),
        frames_skipped,
        final_loss,
    })
}

/// Processes many sequence directories one at a time, each with a fresh tracker, continuing
/// past failures.
pub fn run_batch<M, F>(
    sequences: &[PathBuf],
    mut make_model: F,
    cfg: &FitConfig,
    opts: ExportOptions,
    out_root: &Path,
) -> BatchReport
where
    M: FaceModel,
    F: FnMut() -> M,
{
    let mut report = BatchReport::default();
    for path in sequences {
        log::info!("processing sequence {}", path.display());
        let result: Result<FitSummary> = (|| {
            let mut source = SequenceDir::open(path)?;
            let out = out_root.join(path.file_name().unwrap_or(path.as_os_str()));
            let mut exporter = Exporter::new(out, opts)?;
            let mut tracker = Tracker::new(make_model(), cfg.clone());
            run_sequence(&mut tracker, &mut source, &mut exporter, path)
        })();
        match result {
            Ok(summary) => report.summaries.push(summary),
            Err(err) => {
                log::error!("sequence {} failed: {err}", path.display());
                report.failures.push((path.clone(), err));
            }
        }
    }
    report
}
