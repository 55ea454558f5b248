//! Reference CPU face model: linear blendshapes, pinhole projection, and a barycentric
//! rasterizer with analytic gradients.
//!
//! Geometry is `mean + id_basis·id + exp_basis·exp`, rotated by Euler angles and translated in
//! front of a fixed pinhole camera. Per-vertex albedo is `mean_albedo + tex_basis·tex`, shaded by
//! a 9-band spherical-harmonics basis per color channel (the gamma block). The rasterizer keeps
//! per-pixel barycentric records so color gradients flow back through the exact interpolation
//! used forward; pixel coverage and vertex normals are treated as constants in `backward`, the
//! usual differentiable-rasterization simplification.

use nalgebra::{Matrix3, Vector3};
use ndarray::{Array1, Array2, Array3, ArrayView1};

use std::{
    fs::File,
    io::{BufReader, BufWriter},
    path::Path,
};

use itertools::izip;
use serde::{Deserialize, Serialize};

use crate::coeff::{Block, CoefficientVector};
use crate::error::{Error, Result};
use crate::model::{Evaluation, FaceModel, ModelVariant, OutputGrads, RenderMode};
use crate::source::{Landmarks, NUM_LANDMARKS};

/// Near plane; triangles crossing it are dropped instead of clipped.
const NEAR: f32 = 0.05;

/// Albedo used by the geometry-only preview.
const GEOMETRY_GREY: f32 = 180.0;

/// On-disk form of a linear face model.
///
/// Basis matrices are row-major with one row per vertex coordinate (`vertex * 3 + channel`) and
/// one column per coefficient.
#[derive(Clone, Serialize, Deserialize)]
pub struct LinearModelData {
    pub variant: ModelVariant,
    /// `3 * num_vertices` mean vertex positions.
    pub mean_shape: Vec<f32>,
    /// `(3 * num_vertices) x identity` basis.
    pub id_basis: Vec<f32>,
    /// `(3 * num_vertices) x expression` basis.
    pub exp_basis: Vec<f32>,
    /// `3 * num_vertices` mean albedo, 0..=255.
    pub mean_albedo: Vec<f32>,
    /// `(3 * num_vertices) x texture` basis.
    pub tex_basis: Vec<f32>,
    /// Vertex index of each tracked landmark.
    pub landmark_ids: Vec<u32>,
    /// Per-vertex skin-prior weight in 0..=1.
    pub skin_mask: Vec<f32>,
    pub triangles: Vec<[u32; 3]>,
    /// Pinhole focal length, in pixels at the render resolution.
    pub focal: f32,
    /// Distance from the camera to the model-space origin.
    pub camera_distance: f32,
}

impl LinearModelData {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = BufReader::new(File::open(path.as_ref())?);
        let data: LinearModelData = bincode::deserialize_from(file)?;
        data.validate()?;
        Ok(data)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = BufWriter::new(File::create(path.as_ref())?);
        bincode::serialize_into(file, self)?;
        Ok(())
    }

    pub fn num_vertices(&self) -> usize {
        self.mean_shape.len() / 3
    }

    fn validate(&self) -> Result<()> {
        let layout = self.variant.layout();
        let n3 = self.mean_shape.len();
        if n3 == 0 || n3 % 3 != 0 {
            return Err(Error::Data(format!("mean shape length {n3} is not a vertex multiple")));
        }
        let checks = [
            ("identity basis", self.id_basis.len(), n3 * layout.identity),
            ("expression basis", self.exp_basis.len(), n3 * layout.expression),
            ("texture basis", self.tex_basis.len(), n3 * layout.texture),
            ("mean albedo", self.mean_albedo.len(), n3),
            ("skin mask", self.skin_mask.len(), n3 / 3),
        ];
        for (what, got, want) in checks {
            if got != want {
                return Err(Error::Data(format!("{what} has {got} entries, expected {want}")));
            }
        }
        let n = (n3 / 3) as u32;
        if self.landmark_ids.iter().any(|&id| id >= n) {
            return Err(Error::Data("landmark vertex id out of range".into()));
        }
        if self.triangles.iter().flatten().any(|&id| id >= n) {
            return Err(Error::Data("triangle vertex id out of range".into()));
        }
        Ok(())
    }

    /// Builds a small deterministic model: a dome-shaped mesh with sinusoidal bases and a
    /// skin-colored mean albedo.
    ///
    /// Useful for tests and for trying the tracker without real model data.
    pub fn synthetic(variant: ModelVariant) -> Self {
        const GRID: usize = 12;
        const HALF_WIDTH: f32 = 0.35;
        let layout = variant.layout();
        let n = GRID * GRID;

        let mut mean_shape = Vec::with_capacity(n * 3);
        let mut skin_mask = Vec::with_capacity(n);
        for gy in 0..GRID {
            for gx in 0..GRID {
                let x = (gx as f32 / (GRID - 1) as f32 - 0.5) * 2.0 * HALF_WIDTH;
                let y = (gy as f32 / (GRID - 1) as f32 - 0.5) * 2.0 * HALF_WIDTH;
                // Bulge towards the camera.
                let z = -HALF_WIDTH * (1.0 - (x * x + y * y) / (2.0 * HALF_WIDTH * HALF_WIDTH));
                mean_shape.extend([x, y, z]);
                let border = gx == 0 || gy == 0 || gx == GRID - 1 || gy == GRID - 1;
                skin_mask.push(if border { 0.0 } else { 1.0 });
            }
        }

        let sine_basis = |cols: usize, amplitude: f32, phase: f32| -> Vec<f32> {
            let mut basis = Vec::with_capacity(n * 3 * cols);
            for row in 0..n * 3 {
                for col in 0..cols {
                    let arg = phase + row as f32 * 0.37 + col as f32 * 0.11;
                    basis.push(amplitude * arg.sin());
                }
            }
            basis
        };

        let mut mean_albedo = Vec::with_capacity(n * 3);
        for _ in 0..n {
            mean_albedo.extend([198.0, 160.0, 142.0]);
        }

        let mut triangles = Vec::new();
        for gy in 0..GRID - 1 {
            for gx in 0..GRID - 1 {
                let a = (gy * GRID + gx) as u32;
                let b = a + 1;
                let c = a + GRID as u32;
                let d = c + 1;
                triangles.push([a, b, c]);
                triangles.push([b, d, c]);
            }
        }

        let landmark_ids = (0..NUM_LANDMARKS)
            .map(|i| (i * (n - 1) / (NUM_LANDMARKS - 1)) as u32)
            .collect();

        Self {
            variant,
            mean_shape,
            id_basis: sine_basis(layout.identity, 0.003, 0.3),
            exp_basis: sine_basis(layout.expression, 0.005, 1.7),
            mean_albedo,
            tex_basis: sine_basis(layout.texture, 2.0, 0.9),
            landmark_ids,
            skin_mask,
            triangles,
            focal: 1315.0,
            camera_distance: 10.0,
        }
    }
}

/// One rasterized pixel, remembered for the backward pass.
struct PixelRecord {
    x: u32,
    y: u32,
    tri: u32,
    bary: [f32; 3],
}

/// Forward state cached between `evaluate` and `backward`.
struct Forward {
    mode: RenderMode,
    verts_model: Array2<f32>,
    verts_cam: Array2<f32>,
    rot: [f32; 3],
    albedo: Array2<f32>,
    shading: Array2<f32>,
    sh_basis: Array2<f32>,
    pixels: Vec<PixelRecord>,
}

/// A [`LinearModelData`] instance prepared for evaluation at a fixed render resolution.
pub struct LinearModel {
    variant: ModelVariant,
    image_size: u32,
    mean_shape: Array1<f32>,
    id_basis: Array2<f32>,
    exp_basis: Array2<f32>,
    mean_albedo: Array1<f32>,
    tex_basis: Array2<f32>,
    landmark_ids: Vec<u32>,
    skin_mask: Array1<f32>,
    triangles: Vec<[u32; 3]>,
    focal: f32,
    camera_distance: f32,
    cache: Option<Forward>,
}

impl LinearModel {
    pub fn new(data: LinearModelData, image_size: u32) -> Result<Self> {
        data.validate()?;
        let layout = data.variant.layout();
        let n3 = data.mean_shape.len();
        let to_matrix = |v: Vec<f32>, cols: usize| {
            Array2::from_shape_vec((n3, cols), v).expect("validated basis dimensions")
        };
        Ok(Self {
            variant: data.variant,
            image_size,
            mean_shape: Array1::from_vec(data.mean_shape),
            id_basis: to_matrix(data.id_basis, layout.identity),
            exp_basis: to_matrix(data.exp_basis, layout.expression),
            mean_albedo: Array1::from_vec(data.mean_albedo),
            tex_basis: to_matrix(data.tex_basis, layout.texture),
            landmark_ids: data.landmark_ids,
            skin_mask: Array1::from_vec(data.skin_mask),
            triangles: data.triangles,
            focal: data.focal,
            camera_distance: data.camera_distance,
            cache: None,
        })
    }

    pub fn num_vertices(&self) -> usize {
        self.mean_shape.len() / 3
    }

    fn project(&self, p: Vector3<f32>) -> [f32; 2] {
        let c = self.image_size as f32 / 2.0;
        let z = p.z.max(NEAR);
        [
            c + self.focal * p.x / z,
            // Y points up in camera space but down in the image.
            c - self.focal * p.y / z,
        ]
    }

    fn rasterize(
        &self,
        verts_cam: &Array2<f32>,
        colors: &Array2<f32>,
    ) -> (Array3<f32>, Vec<PixelRecord>) {
        let size = self.image_size as usize;
        let mut rendered = Array3::zeros((size, size, 4));
        let mut zbuf = vec![f32::INFINITY; size * size];
        let mut winner: Vec<Option<(u32, [f32; 3])>> = vec![None; size * size];

        for (t, tri) in self.triangles.iter().enumerate() {
            let [a, b, c] = tri.map(|i| i as usize);
            let pz = [verts_cam[[a, 2]], verts_cam[[b, 2]], verts_cam[[c, 2]]];
            if pz.iter().any(|&z| z < NEAR) {
                continue;
            }
            let corners = [a, b, c].map(|i| {
                self.project(Vector3::new(
                    verts_cam[[i, 0]],
                    verts_cam[[i, 1]],
                    verts_cam[[i, 2]],
                ))
            });
            let [p0, p1, p2] = corners;
            let denom = (p1[0] - p0[0]) * (p2[1] - p0[1]) - (p2[0] - p0[0]) * (p1[1] - p0[1]);
            if denom.abs() < 1e-12 {
                continue;
            }

            let min_x = p0[0].min(p1[0]).min(p2[0]).floor().max(0.0) as usize;
            let max_x = (p0[0].max(p1[0]).max(p2[0]).ceil() as usize).min(size.saturating_sub(1));
            let min_y = p0[1].min(p1[1]).min(p2[1]).floor().max(0.0) as usize;
            let max_y = (p0[1].max(p1[1]).max(p2[1]).ceil() as usize).min(size.saturating_sub(1));
            if min_x > max_x || min_y > max_y {
                continue;
            }

            for py in min_y..=max_y {
                for px in min_x..=max_x {
                    let x = px as f32 + 0.5;
                    let y = py as f32 + 0.5;
                    let w0 = ((p1[0] - x) * (p2[1] - y) - (p2[0] - x) * (p1[1] - y)) / denom;
                    let w1 = ((p2[0] - x) * (p0[1] - y) - (p0[0] - x) * (p2[1] - y)) / denom;
                    let w2 = 1.0 - w0 - w1;
                    if w0 < 0.0 || w1 < 0.0 || w2 < 0.0 {
                        continue;
                    }
                    let z = w0 * pz[0] + w1 * pz[1] + w2 * pz[2];
                    let slot = py * size + px;
                    if z >= zbuf[slot] {
                        continue;
                    }
                    zbuf[slot] = z;
                    winner[slot] = Some((t as u32, [w0, w1, w2]));
                    for ch in 0..3 {
                        rendered[[py, px, ch]] = w0 * colors[[a, ch]]
                            + w1 * colors[[b, ch]]
                            + w2 * colors[[c, ch]];
                    }
                    rendered[[py, px, 3]] = 255.0;
                }
            }
        }

        let mut pixels = Vec::new();
        for (slot, win) in winner.into_iter().enumerate() {
            if let Some((tri, bary)) = win {
                pixels.push(PixelRecord {
                    x: (slot % size) as u32,
                    y: (slot / size) as u32,
                    tri,
                    bary,
                });
            }
        }
        (rendered, pixels)
    }
}

impl FaceModel for LinearModel {
    fn variant(&self) -> ModelVariant {
        self.variant
    }

    fn image_size(&self) -> u32 {
        self.image_size
    }

    fn num_landmarks(&self) -> usize {
        self.landmark_ids.len()
    }

    fn skin_mask(&self) -> ArrayView1<'_, f32> {
        self.skin_mask.view()
    }

    fn triangles(&self) -> &[[u32; 3]] {
        &self.triangles
    }

    fn evaluate(&mut self, coeffs: &CoefficientVector, mode: RenderMode) -> Evaluation {
        assert_eq!(coeffs.layout(), self.variant.layout(), "coefficient layout mismatch");
        let n = self.num_vertices();

        let shape = &self.mean_shape
            + &self.id_basis.dot(&coeffs.block(Block::Identity))
            + &self.exp_basis.dot(&coeffs.block(Block::Expression));
        let verts_model =
            Array2::from_shape_vec((n, 3), shape.to_vec()).expect("shape vector is n*3");

        let rot_block = coeffs.block(Block::Rotation);
        let rot = [rot_block[0], rot_block[1], rot_block[2]];
        let rot_mat = rotation_matrix(rot);
        let trans_block = coeffs.block(Block::Translation);
        let offset = Vector3::new(
            trans_block[0],
            trans_block[1],
            trans_block[2] + self.camera_distance,
        );

        let mut verts_cam = Array2::zeros((n, 3));
        for i in 0..n {
            let vm = Vector3::new(verts_model[[i, 0]], verts_model[[i, 1]], verts_model[[i, 2]]);
            let vc = rot_mat * vm + offset;
            verts_cam[[i, 0]] = vc.x;
            verts_cam[[i, 1]] = vc.y;
            verts_cam[[i, 2]] = vc.z;
        }

        let mut landmarks = Landmarks::new(self.landmark_ids.len());
        for (out, &lid) in landmarks.positions_mut().iter_mut().zip(&self.landmark_ids) {
            let i = lid as usize;
            *out = self.project(Vector3::new(
                verts_cam[[i, 0]],
                verts_cam[[i, 1]],
                verts_cam[[i, 2]],
            ));
        }

        let (rendered, vertex_colors, albedo, shading, sh_basis, pixels) = if mode.renders() {
            let albedo = if mode.textured() {
                let flat = &self.mean_albedo + &self.tex_basis.dot(&coeffs.block(Block::Texture));
                Array2::from_shape_vec((n, 3), flat.to_vec()).expect("albedo vector is n*3")
            } else {
                Array2::from_elem((n, 3), GEOMETRY_GREY)
            };

            let normals = vertex_normals(&verts_cam, &self.triangles);
            let sh_basis = sh_basis_matrix(&normals);
            let gamma = coeffs.block(Block::Gamma);
            let mut shading = Array2::zeros((n, 3));
            for (mut row, sh) in izip!(shading.rows_mut(), sh_basis.rows()) {
                for ch in 0..3 {
                    let mut s = 1.0;
                    for k in 0..9 {
                        s += gamma[ch * 9 + k] * sh[k];
                    }
                    row[ch] = s;
                }
            }

            let colors = &albedo * &shading;
            let (rendered, pixels) = self.rasterize(&verts_cam, &colors);
            let vertex_colors = mode.textured().then(|| albedo.clone());
            (Some(rendered), vertex_colors, albedo, shading, sh_basis, pixels)
        } else {
            (
                None,
                None,
                Array2::zeros((0, 3)),
                Array2::zeros((0, 3)),
                Array2::zeros((0, 9)),
                Vec::new(),
            )
        };

        self.cache = Some(Forward {
            mode,
            verts_model,
            verts_cam: verts_cam.clone(),
            rot,
            albedo,
            shading,
            sh_basis,
            pixels,
        });

        Evaluation {
            landmarks,
            rendered,
            vertex_colors,
            vertices: verts_cam,
        }
    }

    fn backward(&mut self, grads: &OutputGrads) -> Array1<f32> {
        let fwd = self.cache.take().expect("backward called before evaluate");
        let layout = self.variant.layout();
        let n = self.num_vertices();
        let mut d_coeffs = Array1::zeros(layout.len());

        let mut d_cam: Array2<f32> = Array2::zeros((n, 3));

        // Landmark path: back through the pinhole projection.
        if !grads.landmarks.is_empty() {
            assert_eq!(grads.landmarks.len(), self.landmark_ids.len());
            for (&lid, g) in self.landmark_ids.iter().zip(&grads.landmarks) {
                let i = lid as usize;
                let x = fwd.verts_cam[[i, 0]];
                let y = fwd.verts_cam[[i, 1]];
                let z = fwd.verts_cam[[i, 2]].max(NEAR);
                let f_over_z = self.focal / z;
                d_cam[[i, 0]] += g[0] * f_over_z;
                d_cam[[i, 1]] -= g[1] * f_over_z;
                d_cam[[i, 2]] += (-g[0] * x + g[1] * y) * f_over_z / z;
            }
        }

        // Rendered-color path: pixel colors are barycentric blends of shaded vertex colors.
        // Coverage is held fixed.
        let mut d_albedo: Array2<f32> = Array2::zeros((n, 3));
        let mut d_shading: Array2<f32> = Array2::zeros((n, 3));
        if let Some(d_rendered) = &grads.rendered {
            assert!(fwd.mode.renders(), "rendered gradient without a render pass");
            for rec in &fwd.pixels {
                let tri = self.triangles[rec.tri as usize];
                for ch in 0..3 {
                    let g = d_rendered[[rec.y as usize, rec.x as usize, ch]];
                    if g == 0.0 {
                        continue;
                    }
                    for (corner, &w) in tri.iter().zip(&rec.bary) {
                        let v = *corner as usize;
                        d_albedo[[v, ch]] += w * g * fwd.shading[[v, ch]];
                        d_shading[[v, ch]] += w * g * fwd.albedo[[v, ch]];
                    }
                }
            }
        }

        // Direct albedo gradients (reflectance term).
        if let Some(dvc) = &grads.vertex_colors {
            assert!(fwd.mode.textured(), "albedo gradient without a textured pass");
            d_albedo += dvc;
        }

        // Shading -> gamma. Normals are treated as constants.
        if fwd.mode.renders() {
            let gamma_range = layout.range(Block::Gamma);
            for i in 0..n {
                for ch in 0..3 {
                    let g = d_shading[[i, ch]];
                    if g == 0.0 {
                        continue;
                    }
                    for k in 0..9 {
                        d_coeffs[gamma_range.start + ch * 9 + k] += g * fwd.sh_basis[[i, k]];
                    }
                }
            }
        }

        // Albedo -> texture coefficients.
        if fwd.mode.textured() {
            let flat = d_albedo
                .into_shape(n * 3)
                .expect("albedo gradient is contiguous");
            let d_tex = self.tex_basis.t().dot(&flat);
            let tex_range = layout.range(Block::Texture);
            for (slot, g) in d_coeffs.slice_mut(ndarray::s![tex_range]).iter_mut().zip(d_tex.iter())
            {
                *slot += g;
            }
        }

        // Geometry path: camera-space gradients -> translation, rotation, shape bases.
        let rot_mat = rotation_matrix(fwd.rot);
        let rot_derivs = rotation_derivatives(fwd.rot);
        let trans_range = layout.range(Block::Translation);
        let rot_range = layout.range(Block::Rotation);
        let mut d_model_flat = Array1::zeros(n * 3);
        for i in 0..n {
            let g = Vector3::new(d_cam[[i, 0]], d_cam[[i, 1]], d_cam[[i, 2]]);
            if g == Vector3::zeros() {
                continue;
            }
            for c in 0..3 {
                d_coeffs[trans_range.start + c] += g[c];
            }
            let vm = Vector3::new(
                fwd.verts_model[[i, 0]],
                fwd.verts_model[[i, 1]],
                fwd.verts_model[[i, 2]],
            );
            for (j, d_rot) in rot_derivs.iter().enumerate() {
                d_coeffs[rot_range.start + j] += g.dot(&(d_rot * vm));
            }
            let d_model = rot_mat.transpose() * g;
            for c in 0..3 {
                d_model_flat[i * 3 + c] = d_model[c];
            }
        }
        let d_id = self.id_basis.t().dot(&d_model_flat);
        let d_exp = self.exp_basis.t().dot(&d_model_flat);
        let id_range = layout.range(Block::Identity);
        for (slot, g) in d_coeffs.slice_mut(ndarray::s![id_range]).iter_mut().zip(d_id.iter()) {
            *slot += g;
        }
        let exp_range = layout.range(Block::Expression);
        for (slot, g) in d_coeffs.slice_mut(ndarray::s![exp_range]).iter_mut().zip(d_exp.iter()) {
            *slot += g;
        }

        d_coeffs
    }
}

/// `R = Rz(roll) * Ry(yaw) * Rx(pitch)` for `rot = [pitch, yaw, roll]`.
fn rotation_matrix(rot: [f32; 3]) -> Matrix3<f32> {
    let [a, b, c] = rot;
    rz(c) * ry(b) * rx(a)
}

/// Partial derivatives of [`rotation_matrix`] with respect to each angle.
fn rotation_derivatives(rot: [f32; 3]) -> [Matrix3<f32>; 3] {
    let [a, b, c] = rot;
    [
        rz(c) * ry(b) * drx(a),
        rz(c) * dry(b) * rx(a),
        drz(c) * ry(b) * rx(a),
    ]
}

fn rx(a: f32) -> Matrix3<f32> {
    let (s, c) = a.sin_cos();
    Matrix3::new(1.0, 0.0, 0.0, 0.0, c, -s, 0.0, s, c)
}

fn drx(a: f32) -> Matrix3<f32> {
    let (s, c) = a.sin_cos();
    Matrix3::new(0.0, 0.0, 0.0, 0.0, -s, -c, 0.0, c, -s)
}

fn ry(b: f32) -> Matrix3<f32> {
    let (s, c) = b.sin_cos();
    Matrix3::new(c, 0.0, s, 0.0, 1.0, 0.0, -s, 0.0, c)
}

fn dry(b: f32) -> Matrix3<f32> {
    let (s, c) = b.sin_cos();
    Matrix3::new(-s, 0.0, c, 0.0, 0.0, 0.0, -c, 0.0, -s)
}

fn rz(c: f32) -> Matrix3<f32> {
    let (s, co) = c.sin_cos();
    Matrix3::new(co, -s, 0.0, s, co, 0.0, 0.0, 0.0, 1.0)
}

fn drz(c: f32) -> Matrix3<f32> {
    let (s, co) = c.sin_cos();
    Matrix3::new(-s, -co, 0.0, co, -s, 0.0, 0.0, 0.0, 0.0)
}

/// Area-weighted vertex normals, unit length.
fn vertex_normals(verts: &Array2<f32>, triangles: &[[u32; 3]]) -> Vec<Vector3<f32>> {
    let mut normals = vec![Vector3::zeros(); verts.nrows()];
    for tri in triangles {
        let [a, b, c] = tri.map(|i| i as usize);
        let p = |i: usize| Vector3::new(verts[[i, 0]], verts[[i, 1]], verts[[i, 2]]);
        let face = (p(b) - p(a)).cross(&(p(c) - p(a)));
        normals[a] += face;
        normals[b] += face;
        normals[c] += face;
    }
    for normal in &mut normals {
        let len = normal.norm();
        *normal = if len > 1e-8 {
            *normal / len
        } else {
            // Degenerate fan; point at the camera.
            Vector3::new(0.0, 0.0, -1.0)
        };
    }
    normals
}

/// First 9 real spherical-harmonics basis functions per vertex normal.
fn sh_basis_matrix(normals: &[Vector3<f32>]) -> Array2<f32> {
    let mut basis = Array2::zeros((normals.len(), 9));
    for (mut row, n) in basis.rows_mut().into_iter().zip(normals) {
        let (x, y, z) = (n.x, n.y, n.z);
        row[0] = 0.282095;
        row[1] = 0.488603 * y;
        row[2] = 0.488603 * z;
        row[3] = 0.488603 * x;
        row[4] = 1.092548 * x * y;
        row[5] = 1.092548 * y * z;
        row[6] = 0.315392 * (3.0 * z * z - 1.0);
        row[7] = 1.092548 * x * z;
        row[8] = 0.546274 * (x * x - y * y);
    }
    basis
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const SIZE: u32 = 128;

    fn model() -> LinearModel {
        LinearModel::new(LinearModelData::synthetic(ModelVariant::Simplified), SIZE).unwrap()
    }

    fn coeffs(model: &LinearModel) -> CoefficientVector {
        let mut coeffs = CoefficientVector::zeros(model.layout());
        // Away from zero so rotation derivatives are exercised off the identity.
        {
            let mut rot = coeffs.block_mut(Block::Rotation);
            rot[0] = 0.05;
            rot[1] = -0.1;
            rot[2] = 0.02;
        }
        coeffs.block_mut(Block::Identity)[0] = 0.4;
        coeffs.block_mut(Block::Expression)[1] = 0.3;
        coeffs.block_mut(Block::Texture)[0] = 0.5;
        coeffs.block_mut(Block::Gamma)[2] = 0.1;
        coeffs
    }

    #[test]
    fn evaluate_shapes() {
        let mut model = model();
        let coeffs = coeffs(&model);
        let eval = model.evaluate(&coeffs, RenderMode::Textured);
        assert_eq!(eval.landmarks.len(), NUM_LANDMARKS);
        let rendered = eval.rendered.unwrap();
        assert_eq!(rendered.dim(), (SIZE as usize, SIZE as usize, 4));
        assert_eq!(eval.vertex_colors.unwrap().dim(), (model.num_vertices(), 3));
        // The dome fits inside the render target, so something must be covered.
        assert!(rendered.slice(ndarray::s![.., .., 3]).iter().any(|&a| a > 0.0));
    }

    #[test]
    fn geometry_mode_has_no_texture_outputs() {
        let mut model = model();
        let eval = model.evaluate(&coeffs(&model), RenderMode::Geometry);
        assert!(eval.rendered.is_some());
        assert!(eval.vertex_colors.is_none());
    }

    /// Scalar test loss over the projected landmarks: `sum(u^2 + v^2) / 2`.
    fn landmark_test_loss(model: &mut LinearModel, coeffs: &CoefficientVector) -> (f32, Vec<[f32; 2]>) {
        let eval = model.evaluate(coeffs, RenderMode::Landmarks);
        let mut loss = 0.0;
        let mut grads = Vec::new();
        for p in eval.landmarks.iter() {
            loss += 0.5 * (p[0] * p[0] + p[1] * p[1]);
            grads.push(p);
        }
        (loss, grads)
    }

    #[test]
    fn landmark_gradients_match_finite_differences() {
        let mut model = model();
        let base = coeffs(&model);
        let (_, d_lms) = landmark_test_loss(&mut model, &base);
        let grad = model.backward(&OutputGrads {
            landmarks: d_lms,
            ..Default::default()
        });

        let layout = base.layout();
        let mut probes = vec![
            layout.range(Block::Identity).start,
            layout.range(Block::Expression).start + 1,
            layout.range(Block::Translation).start,
            layout.range(Block::Translation).start + 2,
        ];
        probes.extend(layout.range(Block::Rotation));

        let h = 1e-2;
        for idx in probes {
            let mut plus = base.clone();
            plus.packed_mut()[idx] += h;
            let mut minus = base.clone();
            minus.packed_mut()[idx] -= h;
            let (lp, _) = landmark_test_loss(&mut model, &plus);
            let (lm, _) = landmark_test_loss(&mut model, &minus);
            let numeric = (lp - lm) / (2.0 * h);
            assert_relative_eq!(grad[idx], numeric, max_relative = 5e-2, epsilon = 1.0);
        }
    }

    #[test]
    fn color_gradients_match_finite_differences() {
        let mut model = model();
        let base = coeffs(&model);

        // Sum of all rendered RGB values; texture and gamma do not move geometry, so pixel
        // coverage stays fixed and the finite difference is exact up to float noise.
        let render_sum = |model: &mut LinearModel, coeffs: &CoefficientVector| -> f32 {
            let eval = model.evaluate(coeffs, RenderMode::Textured);
            let rendered = eval.rendered.unwrap();
            rendered.slice(ndarray::s![.., .., ..3]).sum()
        };

        let total = render_sum(&mut model, &base);
        assert!(total > 0.0);
        let size = SIZE as usize;
        let grad = model.backward(&OutputGrads {
            rendered: Some(Array3::ones((size, size, 3))),
            ..Default::default()
        });

        let layout = base.layout();
        let probes = [
            layout.range(Block::Texture).start,
            layout.range(Block::Gamma).start,
            layout.range(Block::Gamma).start + 13,
        ];
        // Both paths are linear in the probed coefficients, so a large step only reduces
        // floating-point cancellation noise.
        let h = 0.1;
        for idx in probes {
            let mut plus = base.clone();
            plus.packed_mut()[idx] += h;
            let mut minus = base.clone();
            minus.packed_mut()[idx] -= h;
            let numeric = (render_sum(&mut model, &plus) - render_sum(&mut model, &minus)) / (2.0 * h);
            assert_relative_eq!(grad[idx], numeric, max_relative = 5e-2, epsilon = 5.0);
        }
    }

    #[test]
    fn data_roundtrip_and_validation() {
        let data = LinearModelData::synthetic(ModelVariant::Full);
        let dir = std::env::temp_dir().join(format!("facefit-model-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("model.bin");
        data.save(&path).unwrap();
        let loaded = LinearModelData::load(&path).unwrap();
        assert_eq!(loaded.num_vertices(), data.num_vertices());
        assert_eq!(loaded.variant, ModelVariant::Full);

        let mut bad = LinearModelData::synthetic(ModelVariant::Full);
        bad.skin_mask.pop();
        assert!(bad.validate().is_err());
        std::fs::remove_dir_all(dir).unwrap();
    }
}
