//! Loss terms scoring a model evaluation against observations.
//!
//! Each term is a pure function returning the scalar loss together with its analytic gradient
//! with respect to the term's direct input. The optimization driver scales the gradients by the
//! configured term weights and routes them through [`FaceModel::backward`] where needed.
//!
//! [`FaceModel::backward`]: crate::model::FaceModel::backward

use ndarray::{Array1, Array2, Array3, ArrayView1};

use crate::source::Landmarks;

/// Weight applied to eye and mouth contour points by [`landmark_weights`].
const CONTOUR_WEIGHT: f32 = 10.0;

/// First landmark index of the eye contours in the 68-point scheme; everything from here through
/// the mouth contour gets [`CONTOUR_WEIGHT`].
const EYES_START: usize = 36;

/// Per-landmark weights for [`landmark_loss`].
///
/// Eye and mouth contour points get extra weight; the table is normalized to mean 1 so the
/// overall loss scale does not depend on the weighting.
pub fn landmark_weights(len: usize) -> Array1<f32> {
    let mut weights = Array1::ones(len);
    for i in EYES_START..len {
        weights[i] = CONTOUR_WEIGHT;
    }
    let sum = weights.sum();
    weights * (len as f32 / sum)
}

/// Weighted sum-of-squared-distances between predicted and observed landmarks, in
/// target-resolution pixel space, normalized by landmark count and squared image size.
///
/// Returns the loss and its gradient with respect to the predicted positions.
pub fn landmark_loss(
    pred: &Landmarks,
    target: &Landmarks,
    weights: &Array1<f32>,
    img_size: u32,
) -> (f32, Vec<[f32; 2]>) {
    assert_eq!(pred.len(), target.len());
    assert_eq!(pred.len(), weights.len());

    let scale = 1.0 / (pred.len() as f32 * (img_size * img_size) as f32);
    let mut loss = 0.0;
    let mut grad = Vec::with_capacity(pred.len());
    for (i, (p, t)) in pred.iter().zip(target.iter()).enumerate() {
        let dx = p[0] - t[0];
        let dy = p[1] - t[1];
        let w = weights[i] * scale;
        loss += w * (dx * dx + dy * dy);
        grad.push([2.0 * w * dx, 2.0 * w * dy]);
    }
    (loss, grad)
}

/// Masked photometric error: mean squared RGB difference between the rendering and the aligned
/// frame over pixels the mesh covers (rendered alpha > 0), colors normalized to 0..=1.
///
/// `rendered` is `(h, w, 4)` RGBA, `frame` is `(h, w, 3)` RGB, both in 0..=255. Returns the loss
/// and its gradient with respect to the rendered RGB channels. The mask is treated as constant.
pub fn photo_loss(rendered: &Array3<f32>, frame: &Array3<f32>) -> (f32, Array3<f32>) {
    let (h, w, _) = frame.dim();
    assert_eq!(rendered.dim(), (h, w, 4));

    let mut covered = 0usize;
    for y in 0..h {
        for x in 0..w {
            if rendered[[y, x, 3]] > 0.0 {
                covered += 1;
            }
        }
    }
    let mut grad = Array3::zeros((h, w, 3));
    if covered == 0 {
        return (0.0, grad);
    }

    let norm = 1.0 / (covered as f32 * 3.0);
    let mut loss = 0.0;
    for y in 0..h {
        for x in 0..w {
            if rendered[[y, x, 3]] <= 0.0 {
                continue;
            }
            for c in 0..3 {
                let diff = (rendered[[y, x, c]] - frame[[y, x, c]]) / 255.0;
                loss += diff * diff * norm;
                grad[[y, x, c]] = 2.0 * diff * norm / 255.0;
            }
        }
    }
    (loss, grad)
}

/// Penalizes per-vertex albedo deviating from the mean color of the skin region, pushing the
/// texture estimate towards skin-colored values.
///
/// `albedo` is `(n, 3)` in 0..=255, `skin` holds per-vertex prior weights in 0..=1. The masked
/// mean is treated as constant in the gradient. Returns the loss and its gradient with respect
/// to the albedo.
pub fn reflectance_loss(albedo: &Array2<f32>, skin: ArrayView1<'_, f32>) -> (f32, Array2<f32>) {
    let n = albedo.nrows();
    assert_eq!(skin.len(), n);

    let mut grad = Array2::zeros((n, 3));
    let wsum = skin.sum();
    if wsum <= 0.0 {
        return (0.0, grad);
    }

    let mut mean = [0.0f32; 3];
    for (row, &s) in albedo.rows().into_iter().zip(skin.iter()) {
        for c in 0..3 {
            mean[c] += s * row[c];
        }
    }
    for m in &mut mean {
        *m /= wsum;
    }

    let norm = 1.0 / (wsum * 3.0);
    let mut loss = 0.0;
    for i in 0..n {
        let s = skin[i];
        if s == 0.0 {
            continue;
        }
        for c in 0..3 {
            let diff = (albedo[[i, c]] - mean[c]) / 255.0;
            loss += s * diff * diff * norm;
            grad[[i, c]] = 2.0 * s * diff * norm / 255.0;
        }
    }
    (loss, grad)
}

/// Squared L2 norm of a coefficient block, pulling the estimate towards the model mean.
///
/// Returns the loss and its gradient with respect to the block.
pub fn l2(block: ArrayView1<'_, f32>) -> (f32, Array1<f32>) {
    let loss = block.iter().map(|v| v * v).sum();
    let grad = block.mapv(|v| 2.0 * v);
    (loss, grad)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn landmark_weights_mean_one() {
        let w = landmark_weights(68);
        assert_relative_eq!(w.sum(), 68.0, epsilon = 1e-4);
        assert!(w[40] > w[0]);
        assert!(w[60] > w[10]);
    }

    #[test]
    fn landmark_loss_zero_at_target() {
        let lms = Landmarks::from_positions(vec![[3.0, 4.0], [5.0, 6.0]]);
        let weights = landmark_weights(2);
        let (loss, grad) = landmark_loss(&lms, &lms, &weights, 64);
        assert_eq!(loss, 0.0);
        assert!(grad.iter().all(|g| *g == [0.0, 0.0]));
    }

    #[test]
    fn landmark_loss_gradient_direction() {
        let pred = Landmarks::from_positions(vec![[11.0, 20.0]]);
        let target = Landmarks::from_positions(vec![[10.0, 20.0]]);
        let weights = landmark_weights(1);
        let (loss, grad) = landmark_loss(&pred, &target, &weights, 10);
        // One landmark, weight 1, off by 1px on x: loss = 1 / 100.
        assert_relative_eq!(loss, 0.01, epsilon = 1e-6);
        assert!(grad[0][0] > 0.0);
        assert_eq!(grad[0][1], 0.0);
    }

    #[test]
    fn photo_loss_masked() {
        let mut rendered = Array3::zeros((1, 2, 4));
        let mut frame = Array3::zeros((1, 2, 3));
        // Pixel 0: covered, differs by 255 on red. Pixel 1: uncovered, differs wildly.
        rendered[[0, 0, 3]] = 255.0;
        rendered[[0, 0, 0]] = 255.0;
        frame[[0, 1, 0]] = 255.0;
        let (loss, grad) = photo_loss(&rendered, &frame);
        assert_relative_eq!(loss, 1.0 / 3.0, epsilon = 1e-6);
        assert!(grad[[0, 0, 0]] > 0.0);
        // No gradient outside the mask.
        assert_eq!(grad[[0, 1, 0]], 0.0);
    }

    #[test]
    fn photo_loss_empty_mask() {
        let rendered = Array3::zeros((2, 2, 4));
        let frame = Array3::from_elem((2, 2, 3), 100.0);
        let (loss, grad) = photo_loss(&rendered, &frame);
        assert_eq!(loss, 0.0);
        assert!(grad.iter().all(|&g| g == 0.0));
    }

    #[test]
    fn reflectance_loss_uniform_skin_is_zero() {
        let albedo = Array2::from_elem((4, 3), 180.0);
        let skin = Array1::ones(4);
        let (loss, grad) = reflectance_loss(&albedo, skin.view());
        assert_eq!(loss, 0.0);
        assert!(grad.iter().all(|&g| g == 0.0));
    }

    #[test]
    fn reflectance_loss_ignores_unmasked_vertices() {
        let mut albedo = Array2::from_elem((3, 3), 100.0);
        albedo[[2, 0]] = 250.0; // non-skin vertex, must not contribute
        let skin = Array1::from_vec(vec![1.0, 1.0, 0.0]);
        let (loss, grad) = reflectance_loss(&albedo, skin.view());
        assert_eq!(loss, 0.0);
        assert_eq!(grad[[2, 0]], 0.0);
    }

    #[test]
    fn l2_gradient() {
        let x = Array1::from_vec(vec![1.0, -2.0, 0.0]);
        let (loss, grad) = l2(x.view());
        assert_relative_eq!(loss, 5.0, epsilon = 1e-6);
        assert_eq!(grad.to_vec(), vec![2.0, -4.0, 0.0]);
    }
}
