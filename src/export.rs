//! Per-frame output artifacts: composite previews, meshes, and coefficient dumps.
//!
//! Everything lands under one output directory with a subfolder per artifact kind (`img/`,
//! `ply/`, `coeffs/`). The composite preview stream additionally goes through the [`VideoSink`]
//! seam; encoding an actual video file from it is an external concern, the shipped sink is the
//! numbered PNG sequence itself.

use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use ndarray::{Array2, Array3};
use serde::Serialize;

use crate::coeff::{Block, CoefficientVector};
use crate::error::Result;
use crate::image::Image;
use crate::track::FitResult;

/// Consumer of the per-frame composite preview stream.
pub trait VideoSink {
    fn write_frame(&mut self, frame: &Image) -> Result<()>;

    /// Called once after the last frame.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A [`VideoSink`] writing numbered PNG files (`000001.png`, ...) into a directory.
pub struct PngSequence {
    dir: PathBuf,
    next: u64,
}

impl PngSequence {
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, next: 1 })
    }
}

impl VideoSink for PngSequence {
    fn write_frame(&mut self, frame: &Image) -> Result<()> {
        frame.save(self.dir.join(format!("{:06}.png", self.next)))?;
        self.next += 1;
        Ok(())
    }
}

/// Export toggles. Both kinds of per-frame artifact are on by default.
#[derive(Debug, Clone, Copy)]
pub struct ExportOptions {
    pub meshes: bool,
    pub coeffs: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            meshes: true,
            coeffs: true,
        }
    }
}

/// The per-frame coefficient dump: every named block plus the raw packed vector.
#[derive(Serialize)]
struct CoeffRecord {
    identity: Vec<f32>,
    expression: Vec<f32>,
    texture: Vec<f32>,
    rotation: Vec<f32>,
    gamma: Vec<f32>,
    translation: Vec<f32>,
    packed: Vec<f32>,
}

impl CoeffRecord {
    fn new(coeffs: &CoefficientVector) -> Self {
        let block = |b: Block| coeffs.block(b).to_vec();
        Self {
            identity: block(Block::Identity),
            expression: block(Block::Expression),
            texture: block(Block::Texture),
            rotation: block(Block::Rotation),
            gamma: block(Block::Gamma),
            translation: block(Block::Translation),
            packed: coeffs.packed().to_vec(),
        }
    }
}

/// Writes one sequence's outputs under a root directory.
pub struct Exporter {
    root: PathBuf,
    opts: ExportOptions,
    sink: Box<dyn VideoSink>,
    frames: u64,
}

impl Exporter {
    /// Creates the output directory tree with the default PNG-sequence sink.
    pub fn new<P: AsRef<Path>>(root: P, opts: ExportOptions) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        let sink = Box::new(PngSequence::new(root.join("img"))?);
        Self::with_sink(root, opts, sink)
    }

    /// Like [`Exporter::new`], but sends the composite stream to a custom sink (e.g. a video
    /// encoder).
    pub fn with_sink(root: PathBuf, opts: ExportOptions, sink: Box<dyn VideoSink>) -> Result<Self> {
        fs::create_dir_all(&root)?;
        if opts.meshes {
            fs::create_dir_all(root.join("ply"))?;
        }
        if opts.coeffs {
            fs::create_dir_all(root.join("coeffs"))?;
        }
        Ok(Self {
            root,
            opts,
            sink,
            frames: 0,
        })
    }

    pub fn frames_written(&self) -> u64 {
        self.frames
    }

    /// Writes all artifacts for one fitted frame.
    pub fn export(&mut self, fit: &FitResult, triangles: &[[u32; 3]]) -> Result<()> {
        self.frames += 1;
        let composite = composite(&fit.aligned, &fit.textured, &fit.geometry);
        self.sink.write_frame(&composite)?;

        if self.opts.meshes {
            let path = self.root.join("ply").join(format!("{:06}.ply", self.frames));
            write_ply(&path, &fit.vertices, &fit.vertex_colors, triangles)?;
        }
        if self.opts.coeffs {
            let path = self
                .root
                .join("coeffs")
                .join(format!("{:06}.bin", self.frames));
            let file = BufWriter::new(File::create(path)?);
            bincode::serialize_into(file, &CoeffRecord::new(&fit.coeffs))?;
        }
        Ok(())
    }

    /// Flushes the composite sink. Call once after the last frame.
    pub fn finish(&mut self) -> Result<()> {
        self.sink.finish()
    }
}

/// Assembles the 3-wide preview strip `[aligned | textured | geometry]`.
///
/// The renders are matted over the aligned frame wherever their alpha mask is positive, exactly
/// like the live preview of the reference tracker.
pub fn composite(aligned: &Image, textured: &Array3<f32>, geometry: &Array3<f32>) -> Image {
    let tar = aligned.width();
    assert_eq!(aligned.height(), tar);
    assert_eq!(textured.dim(), (tar as usize, tar as usize, 4));
    assert_eq!(geometry.dim(), (tar as usize, tar as usize, 4));

    let mut out = Image::new(tar * 3, tar);
    for y in 0..tar {
        for x in 0..tar {
            let bg = aligned.get(x, y);
            out.set(x, y, bg);
            for (panel, render) in [(1, textured), (2, geometry)] {
                let px = if render[[y as usize, x as usize, 3]] > 0.0 {
                    let c = |ch: usize| render[[y as usize, x as usize, ch]].clamp(0.0, 255.0) as u8;
                    [c(0), c(1), c(2), 255]
                } else {
                    bg
                };
                out.set(panel * tar + x, y, px);
            }
        }
    }
    out
}

/// Writes an ASCII PLY mesh with per-vertex colors and fixed topology.
fn write_ply(
    path: &Path,
    vertices: &Array2<f32>,
    colors: &Array2<f32>,
    triangles: &[[u32; 3]],
) -> Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    writeln!(w, "ply")?;
    writeln!(w, "format ascii 1.0")?;
    writeln!(w, "element vertex {}", vertices.nrows())?;
    writeln!(w, "property float x")?;
    writeln!(w, "property float y")?;
    writeln!(w, "property float z")?;
    writeln!(w, "property uchar red")?;
    writeln!(w, "property uchar green")?;
    writeln!(w, "property uchar blue")?;
    writeln!(w, "element face {}", triangles.len())?;
    writeln!(w, "property list uchar int vertex_indices")?;
    writeln!(w, "end_header")?;
    for (v, c) in vertices.rows().into_iter().zip(colors.rows()) {
        writeln!(
            w,
            "{} {} {} {} {} {}",
            v[0],
            v[1],
            v[2],
            c[0].clamp(0.0, 255.0) as u8,
            c[1].clamp(0.0, 255.0) as u8,
            c[2].clamp(0.0, 255.0) as u8,
        )?;
    }
    for t in triangles {
        writeln!(w, "3 {} {} {}", t[0], t[1], t[2])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coeff::BlockLayout;

    #[test]
    fn composite_mattes_renders_over_the_frame() {
        let tar = 2u32;
        let mut aligned = Image::new(tar, tar);
        aligned.set(0, 0, [9, 9, 9, 255]);

        let mut textured = Array3::zeros((2, 2, 4));
        // Covered pixel with an out-of-range color that must clamp.
        textured[[0, 0, 0]] = 300.0;
        textured[[0, 0, 3]] = 255.0;
        let geometry = Array3::zeros((2, 2, 4));

        let out = composite(&aligned, &textured, &geometry);
        assert_eq!(out.width(), 6);
        assert_eq!(out.height(), 2);
        // Panel 0: the aligned frame itself.
        assert_eq!(out.get(0, 0), [9, 9, 9, 255]);
        // Panel 1: covered pixel shows the (clamped) render.
        assert_eq!(out.get(2, 0), [255, 0, 0, 255]);
        // Panel 2: uncovered pixel falls back to the aligned frame.
        assert_eq!(out.get(4, 0), [9, 9, 9, 255]);
    }

    #[test]
    fn ply_contains_header_vertices_and_faces() {
        let dir = std::env::temp_dir().join(format!("facefit-ply-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("mesh.ply");

        let vertices = Array2::from_shape_vec((3, 3), vec![0.0; 9]).unwrap();
        let colors = Array2::from_elem((3, 3), 128.0);
        write_ply(&path, &vertices, &colors, &[[0, 1, 2]]).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("ply\nformat ascii 1.0\n"));
        assert!(text.contains("element vertex 3"));
        assert!(text.contains("element face 1"));
        assert!(text.trim_end().ends_with("3 0 1 2"));
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn coeff_record_covers_every_block() {
        let layout = BlockLayout {
            identity: 2,
            expression: 3,
            texture: 1,
            rotation: 3,
            gamma: 2,
            translation: 3,
        };
        let coeffs = CoefficientVector::zeros(layout);
        let record = CoeffRecord::new(&coeffs);
        assert_eq!(record.identity.len(), 2);
        assert_eq!(record.expression.len(), 3);
        assert_eq!(record.gamma.len(), 2);
        assert_eq!(record.packed.len(), layout.len());
    }
}
