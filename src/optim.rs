//! First-order adaptive-moment gradient descent over coefficient blocks.

use std::ops::Range;

use ndarray::Array1;

use crate::coeff::{Block, BlockLayout, CoefficientVector};

/// Tunables for [`Adam`].
#[derive(Debug, Clone, Copy)]
pub struct AdamOptions {
    pub lr: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
}

impl AdamOptions {
    /// Default moment decay rates with the given learning rate.
    pub fn with_lr(lr: f32) -> Self {
        Self { lr, ..Self::default() }
    }
}

impl Default for AdamOptions {
    fn default() -> Self {
        Self {
            lr: 1e-2,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }
}

/// Adam over a subset of coefficient blocks.
///
/// The optimizer keeps first and second moment estimates for the full packed vector but only
/// ever reads and writes the entries of the blocks it was constructed with; everything else is
/// left untouched, so several optimizers with overlapping block sets can share one
/// [`CoefficientVector`]. Post-step constraints (like the expression clamp) are the caller's
/// job.
pub struct Adam {
    opts: AdamOptions,
    ranges: Vec<Range<usize>>,
    m: Array1<f32>,
    v: Array1<f32>,
    steps: u64,
}

impl Adam {
    /// Creates an optimizer over `blocks` of a vector with the given `layout`.
    pub fn new(layout: BlockLayout, blocks: &[Block], opts: AdamOptions) -> Self {
        Self {
            opts,
            ranges: blocks.iter().map(|&b| layout.range(b)).collect(),
            m: Array1::zeros(layout.len()),
            v: Array1::zeros(layout.len()),
            steps: 0,
        }
    }

    /// Applies one gradient step to the entries of the optimizer's blocks.
    pub fn step(&mut self, coeffs: &mut CoefficientVector, grad: &Array1<f32>) {
        assert_eq!(grad.len(), coeffs.len(), "gradient length mismatch");
        assert_eq!(self.m.len(), coeffs.len(), "optimizer layout mismatch");

        self.steps += 1;
        let t = self.steps as i32;
        let bias1 = 1.0 - self.opts.beta1.powi(t);
        let bias2 = 1.0 - self.opts.beta2.powi(t);

        let mut packed = coeffs.packed_mut();
        for range in &self.ranges {
            for i in range.clone() {
                let g = grad[i];
                self.m[i] = self.opts.beta1 * self.m[i] + (1.0 - self.opts.beta1) * g;
                self.v[i] = self.opts.beta2 * self.v[i] + (1.0 - self.opts.beta2) * g * g;
                let m_hat = self.m[i] / bias1;
                let v_hat = self.v[i] / bias2;
                packed[i] -= self.opts.lr * m_hat / (v_hat.sqrt() + self.opts.eps);
            }
        }
    }

    /// Number of steps taken so far.
    pub fn steps(&self) -> u64 {
        self.steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> BlockLayout {
        BlockLayout {
            identity: 2,
            expression: 2,
            texture: 1,
            rotation: 3,
            gamma: 1,
            translation: 3,
        }
    }

    #[test]
    fn minimizes_a_quadratic() {
        // f(x) = sum((x - 3)^2) over the identity block.
        let layout = layout();
        let mut coeffs = CoefficientVector::zeros(layout);
        let mut adam = Adam::new(layout, &[Block::Identity], AdamOptions::with_lr(0.1));

        for _ in 0..500 {
            let mut grad = Array1::zeros(layout.len());
            for (g, x) in grad
                .slice_mut(ndarray::s![layout.range(Block::Identity)])
                .iter_mut()
                .zip(coeffs.block(Block::Identity).iter())
            {
                *g = 2.0 * (x - 3.0);
            }
            adam.step(&mut coeffs, &grad);
        }

        for x in coeffs.block(Block::Identity).iter() {
            assert!((x - 3.0).abs() < 1e-2, "did not converge: {x}");
        }
    }

    #[test]
    fn only_touches_its_blocks() {
        let layout = layout();
        let mut coeffs = CoefficientVector::zeros(layout);
        let mut adam = Adam::new(layout, &[Block::Rotation], AdamOptions::default());

        // A gradient that is non-zero everywhere.
        let grad = Array1::ones(layout.len());
        adam.step(&mut coeffs, &grad);

        assert!(coeffs.block(Block::Rotation).iter().all(|&v| v != 0.0));
        for block in [Block::Identity, Block::Expression, Block::Texture, Block::Gamma, Block::Translation] {
            assert!(
                coeffs.block(block).iter().all(|&v| v == 0.0),
                "{block:?} was modified"
            );
        }
        assert_eq!(adam.steps(), 1);
    }
}
