//! The packed coefficient vector driving the face model.
//!
//! All parameters a fit estimates live in one flat `f32` vector, partitioned into named blocks.
//! Block sizes are fixed by the model variant and never change across frames; the vector itself
//! persists across frames of a sequence to warm-start each new fit.

use std::ops::Range;

use ndarray::{Array1, ArrayView1, ArrayViewMut1};

/// A named partition of the coefficient vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Block {
    Identity,
    Expression,
    Texture,
    Rotation,
    Gamma,
    Translation,
}

impl Block {
    /// All blocks, in packing order.
    pub const ALL: [Block; 6] = [
        Block::Identity,
        Block::Expression,
        Block::Texture,
        Block::Rotation,
        Block::Gamma,
        Block::Translation,
    ];
}

/// Per-block sizes of a packed coefficient vector.
///
/// The packing order is fixed: identity, expression, texture, rotation, gamma, translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    pub identity: usize,
    pub expression: usize,
    pub texture: usize,
    pub rotation: usize,
    pub gamma: usize,
    pub translation: usize,
}

impl BlockLayout {
    /// Returns the number of entries in `block`.
    pub fn size(&self, block: Block) -> usize {
        match block {
            Block::Identity => self.identity,
            Block::Expression => self.expression,
            Block::Texture => self.texture,
            Block::Rotation => self.rotation,
            Block::Gamma => self.gamma,
            Block::Translation => self.translation,
        }
    }

    /// Returns the index range `block` occupies in the packed vector.
    pub fn range(&self, block: Block) -> Range<usize> {
        let mut start = 0;
        for b in Block::ALL {
            if b == block {
                return start..start + self.size(b);
            }
            start += self.size(b);
        }
        unreachable!()
    }

    /// Total length of the packed vector.
    pub fn len(&self) -> usize {
        Block::ALL.iter().map(|&b| self.size(b)).sum()
    }
}

/// The optimization state: one packed parameter vector with named block views.
///
/// Owned exclusively by the optimization driver. Mutated only by optimizer steps and by the
/// explicit non-negativity clamp on the expression block.
#[derive(Debug, Clone, PartialEq)]
pub struct CoefficientVector {
    data: Array1<f32>,
    layout: BlockLayout,
}

impl CoefficientVector {
    /// Creates an all-zero coefficient vector for `layout`.
    pub fn zeros(layout: BlockLayout) -> Self {
        Self {
            data: Array1::zeros(layout.len()),
            layout,
        }
    }

    #[inline]
    pub fn layout(&self) -> BlockLayout {
        self.layout
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// The raw packed vector.
    pub fn packed(&self) -> ArrayView1<'_, f32> {
        self.data.view()
    }

    pub fn packed_mut(&mut self) -> ArrayViewMut1<'_, f32> {
        self.data.view_mut()
    }

    /// Returns a view of one block.
    pub fn block(&self, block: Block) -> ArrayView1<'_, f32> {
        self.data.slice(ndarray::s![self.layout.range(block)])
    }

    /// Returns a mutable view of one block.
    pub fn block_mut(&mut self, block: Block) -> ArrayViewMut1<'_, f32> {
        let range = self.layout.range(block);
        self.data.slice_mut(ndarray::s![range])
    }

    /// Clamps every negative entry of `block` to zero, in place.
    pub fn clamp_non_negative(&mut self, block: Block) {
        for v in self.block_mut(block).iter_mut() {
            if *v < 0.0 {
                *v = 0.0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> BlockLayout {
        BlockLayout {
            identity: 4,
            expression: 3,
            texture: 2,
            rotation: 3,
            gamma: 2,
            translation: 3,
        }
    }

    #[test]
    fn ranges_are_contiguous() {
        let layout = layout();
        assert_eq!(layout.len(), 17);
        assert_eq!(layout.range(Block::Identity), 0..4);
        assert_eq!(layout.range(Block::Expression), 4..7);
        assert_eq!(layout.range(Block::Translation), 14..17);

        let mut end = 0;
        for block in Block::ALL {
            let range = layout.range(block);
            assert_eq!(range.start, end);
            end = range.end;
        }
        assert_eq!(end, layout.len());
    }

    #[test]
    fn block_views_alias_packed_storage() {
        let mut coeffs = CoefficientVector::zeros(layout());
        coeffs.block_mut(Block::Expression)[1] = 7.0;
        assert_eq!(coeffs.packed()[5], 7.0);
    }

    #[test]
    fn clamp_only_touches_negative_entries() {
        let mut coeffs = CoefficientVector::zeros(layout());
        {
            let mut exp = coeffs.block_mut(Block::Expression);
            exp[0] = -1.5;
            exp[1] = 0.5;
            exp[2] = -0.0001;
        }
        coeffs.block_mut(Block::Identity)[0] = -2.0;

        coeffs.clamp_non_negative(Block::Expression);

        assert_eq!(coeffs.block(Block::Expression).to_vec(), vec![0.0, 0.5, 0.0]);
        // Other blocks are unaffected.
        assert_eq!(coeffs.block(Block::Identity)[0], -2.0);
    }
}
