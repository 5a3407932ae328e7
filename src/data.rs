//! Block field payloads and the prolongation/restriction operators that
//! move them across levels. The control plane treats payloads as opaque;
//! everything it does to them goes through a [`TransferOperator`].

use std::array;

use crate::error::ForestError;
use crate::geometry::{Grid, Split};

/// Field data carried by a leaf block: a fixed number of cells per axis and
/// one scalar value per cell per channel. Channel slices are contiguous.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockData<const N: usize> {
    size: [usize; N],
    channels: usize,
    values: Vec<f64>,
}

impl<const N: usize> BlockData<N> {
    /// Allocates a zero-filled payload. Extents must be even so that a
    /// block can always be split into octants cell-by-cell.
    pub fn new(size: [usize; N], channels: usize) -> Result<Self, ForestError> {
        for extent in size {
            if extent == 0 || extent % 2 != 0 {
                return Err(ForestError::OddExtent(extent));
            }
        }

        Ok(Self::zeros(size, channels))
    }

    /// Allocates a zero-filled array of any shape. Scratch buffers built by
    /// transfer operators (octants in particular) may have odd extents.
    pub fn zeros(size: [usize; N], channels: usize) -> Self {
        let cells = Grid::new(size).len();

        Self {
            size,
            channels,
            values: vec![0.0; cells * channels],
        }
    }

    pub fn size(&self) -> [usize; N] {
        self.size
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn cell_space(&self) -> Grid<N> {
        Grid::new(self.size)
    }

    pub fn channel(&self, channel: usize) -> &[f64] {
        let cells = self.cell_space().len();
        &self.values[channel * cells..(channel + 1) * cells]
    }

    pub fn channel_mut(&mut self, channel: usize) -> &mut [f64] {
        let cells = self.cell_space().len();
        &mut self.values[channel * cells..(channel + 1) * cells]
    }

    pub fn value(&self, channel: usize, cell: [usize; N]) -> f64 {
        self.channel(channel)[self.cell_space().offset(cell)]
    }

    pub fn set_value(&mut self, channel: usize, cell: [usize; N], value: f64) {
        let index = self.cell_space().offset(cell);
        self.channel_mut(channel)[index] = value;
    }

    /// Origin cell of the octant covered by a child.
    pub fn octant_origin(&self, split: Split<N>) -> [usize; N] {
        array::from_fn(|axis| {
            if split.is_set(axis) {
                self.size[axis] / 2
            } else {
                0
            }
        })
    }

    /// Writes a half-extent payload into the octant covered by `split`.
    /// Used when a parent reassembles itself from coarsening children.
    pub(crate) fn store_octant(&mut self, split: Split<N>, octant: &BlockData<N>) {
        assert_eq!(octant.size, self.size.map(|s| s / 2));
        assert_eq!(octant.channels, self.channels);

        let origin = self.octant_origin(split);

        for channel in 0..self.channels {
            for cell in octant.cell_space().iter() {
                let value = octant.value(channel, cell);
                self.set_value(
                    channel,
                    array::from_fn(|axis| origin[axis] + cell[axis]),
                    value,
                );
            }
        }
    }
}

/// Moves field data between a parent and its children. `prolong` expands
/// one octant of a parent payload onto a full child block; `restrict`
/// shrinks a child payload to the octant-sized array its parent stores.
pub trait TransferOperator<const N: usize>: Send + Sync {
    fn prolong(&self, parent: &BlockData<N>, split: Split<N>) -> BlockData<N>;

    fn restrict(&self, child: &BlockData<N>) -> BlockData<N>;
}

/// Sampling transfer: prolongation copies each parent cell into the `2^N`
/// child cells covering it, restriction samples the lower-corner child
/// cell. Exact inverses of each other, which makes refine-then-coarsen a
/// round trip.
#[derive(Debug, Clone, Copy, Default)]
pub struct Injection;

impl<const N: usize> TransferOperator<N> for Injection {
    fn prolong(&self, parent: &BlockData<N>, split: Split<N>) -> BlockData<N> {
        let mut child = BlockData::zeros(parent.size(), parent.channels());
        let origin = parent.octant_origin(split);

        for channel in 0..parent.channels() {
            for cell in child.cell_space().iter() {
                let source: [_; N] = array::from_fn(|axis| origin[axis] + cell[axis] / 2);
                child.set_value(channel, cell, parent.value(channel, source));
            }
        }

        child
    }

    fn restrict(&self, child: &BlockData<N>) -> BlockData<N> {
        let mut result = BlockData::zeros(child.size().map(|s| s / 2), child.channels());

        for channel in 0..child.channels() {
            for cell in result.cell_space().iter() {
                let source = cell.map(|c| 2 * c);
                result.set_value(channel, cell, child.value(channel, source));
            }
        }

        result
    }
}

/// Conservative transfer: piecewise-constant prolongation and `2^N`-cell
/// mean restriction.
#[derive(Debug, Clone, Copy, Default)]
pub struct CellAverage;

impl<const N: usize> TransferOperator<N> for CellAverage {
    fn prolong(&self, parent: &BlockData<N>, split: Split<N>) -> BlockData<N> {
        Injection.prolong(parent, split)
    }

    fn restrict(&self, child: &BlockData<N>) -> BlockData<N> {
        let mut result = BlockData::zeros(child.size().map(|s| s / 2), child.channels());

        let weight = 1.0 / Split::<N>::COUNT as f64;

        for channel in 0..child.channels() {
            for cell in result.cell_space().iter() {
                let mut sum = 0.0;

                for corner in Split::<N>::enumerate() {
                    let source: [_; N] =
                        array::from_fn(|axis| 2 * cell[axis] + corner.is_set(axis) as usize);
                    sum += child.value(channel, source);
                }

                result.set_value(channel, cell, sum * weight);
            }
        }

        result
    }
}
