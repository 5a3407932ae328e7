//! One node of the forest: a leaf carrying field data, or an interior
//! block carrying only structure. All inter-block relations are held as
//! [`Index`] keys, never as references; the containing forest maps keys to
//! storage.

use datasize::DataSize;

use crate::data::BlockData;
use crate::forest::sync::SyncCounter;
use crate::geometry::{neighbor_regions, ForestGeometry, Index, Region, Split};

mod adapt;

/// Phase tags of the adapt state machine. Message handlers are only legal
/// while the forest holds the matching phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdaptPhase {
    #[default]
    Idle,
    Begin,
    Called,
    Next,
    End,
}

/// Level of the neighbor across each region of a block. The central slot
/// stores the block's own level.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FaceLevels<const N: usize> {
    levels: Vec<i32>,
}

impl<const N: usize> FaceLevels<N> {
    pub fn new(fill: i32) -> Self {
        Self {
            levels: vec![fill; Region::<N>::COUNT],
        }
    }

    pub fn from_slice(levels: &[i32]) -> Self {
        assert_eq!(levels.len(), Region::<N>::COUNT);

        Self {
            levels: levels.to_vec(),
        }
    }

    pub fn get(&self, region: Region<N>) -> i32 {
        self.levels[region.to_linear()]
    }

    pub fn set(&mut self, region: Region<N>, level: i32) {
        self.levels[region.to_linear()] = level;
    }

    pub fn as_slice(&self) -> &[i32] {
        &self.levels
    }
}

/// Levels keyed by a child selector and a region of that child. Used both
/// for the per-child face levels a block tracks on behalf of children it
/// may create or absorb, and for the idempotency filter over received
/// announcements.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ChildFaceLevels<const N: usize> {
    levels: Vec<i32>,
}

impl<const N: usize> ChildFaceLevels<N> {
    pub fn new(fill: i32) -> Self {
        Self {
            levels: vec![fill; Split::<N>::COUNT * Region::<N>::COUNT],
        }
    }

    pub fn get(&self, split: Split<N>, region: Region<N>) -> i32 {
        self.levels[split.to_linear() * Region::<N>::COUNT + region.to_linear()]
    }

    pub fn set(&mut self, split: Split<N>, region: Region<N>, level: i32) {
        self.levels[split.to_linear() * Region::<N>::COUNT + region.to_linear()] = level;
    }

    pub fn fill(&mut self, level: i32) {
        self.levels.fill(level);
    }

    /// The `3^N` levels recorded for one child.
    pub fn slice(&self, split: Split<N>) -> &[i32] {
        let width = Region::<N>::COUNT;
        &self.levels[split.to_linear() * width..(split.to_linear() + 1) * width]
    }
}

/// One forest node.
#[derive(Debug, Clone)]
pub struct Block<const N: usize> {
    index: Index<N>,
    /// Refinement level; equals `index.level()`, tracked for clarity.
    level: i32,
    /// Desired level for the current adapt iteration.
    level_next: i32,
    is_leaf: bool,
    /// Set by a parent absorbing this block; honored at the end of the
    /// adapt phase.
    delete: bool,
    /// Adapt cycles survived since creation or since last absorbing a
    /// coarsened child.
    age: u32,
    /// Iteration counter within the initial-growth loop.
    adapt_step: u32,
    phase: AdaptPhase,

    /// Indices of this block's children; empty exactly on leaves.
    children: Vec<Index<N>>,

    face_level_curr: FaceLevels<N>,
    face_level_next: FaceLevels<N>,
    /// Last level heard per sending child and face; filters stale
    /// retransmissions.
    face_level_last: ChildFaceLevels<N>,
    child_face_level_curr: ChildFaceLevels<N>,
    child_face_level_next: ChildFaceLevels<N>,

    /// Expects one acknowledgement per sibling before `children` clears.
    sync_coarsen: SyncCounter,

    /// Field payload; present exactly on leaves.
    data: Option<BlockData<N>>,
}

impl<const N: usize> Block<N> {
    /// Creates a root block. Every root starts at level zero, so all face
    /// levels start at zero as well.
    pub fn root(index: Index<N>, data: BlockData<N>, geometry: &ForestGeometry<N>) -> Self {
        assert!(index.is_root());

        Self::fresh(index, data, FaceLevels::new(0), 0, geometry)
    }

    /// Creates a child block during refinement. `face_levels` is the
    /// parent's slice of per-child face levels for this child.
    pub(crate) fn child(
        index: Index<N>,
        data: BlockData<N>,
        face_levels: &[i32],
        adapt_step: u32,
        geometry: &ForestGeometry<N>,
    ) -> Self {
        Self::fresh(
            index,
            data,
            FaceLevels::from_slice(face_levels),
            adapt_step,
            geometry,
        )
    }

    fn fresh(
        index: Index<N>,
        data: BlockData<N>,
        face_levels: FaceLevels<N>,
        adapt_step: u32,
        geometry: &ForestGeometry<N>,
    ) -> Self {
        let level = index.level();

        let mut result = Self {
            index,
            level,
            level_next: level,
            is_leaf: true,
            delete: false,
            age: 0,
            adapt_step,
            phase: AdaptPhase::Idle,

            children: Vec::new(),

            face_level_next: face_levels.clone(),
            face_level_curr: face_levels,
            face_level_last: ChildFaceLevels::new(0),
            child_face_level_curr: ChildFaceLevels::new(0),
            child_face_level_next: ChildFaceLevels::new(0),

            sync_coarsen: SyncCounter::new(Split::<N>::COUNT as u32),

            data: Some(data),
        };

        result.initialize_child_face_levels(geometry);

        result
    }

    /// Seeds the per-child face levels: across a face whose neighbor is a
    /// sibling-to-be the level is one finer than this block; across a face
    /// that exits the block the child inherits the corresponding parent
    /// face level. The central slot is the child's own level.
    fn initialize_child_face_levels(&mut self, geometry: &ForestGeometry<N>) {
        for split in Split::<N>::enumerate() {
            let index_child = self.index.child(split);

            for face in neighbor_regions::<N>(0) {
                let parent_face = face.parent_region(split);

                let level = match index_child.neighbor(face, geometry) {
                    Some(neighbor) if neighbor.parent() == self.index => self.level + 1,
                    _ => self.face_level_curr.get(parent_face),
                };

                self.child_face_level_curr.set(split, face, level);
            }

            self.child_face_level_curr
                .set(split, Region::CENTRAL, self.level + 1);
        }

        self.child_face_level_next = self.child_face_level_curr.clone();
    }

    pub fn index(&self) -> Index<N> {
        self.index
    }

    pub fn level(&self) -> i32 {
        self.level
    }

    pub fn level_next(&self) -> i32 {
        self.level_next
    }

    pub fn is_leaf(&self) -> bool {
        self.is_leaf
    }

    pub fn age(&self) -> u32 {
        self.age
    }

    pub fn adapt_step(&self) -> u32 {
        self.adapt_step
    }

    pub fn children(&self) -> &[Index<N>] {
        &self.children
    }

    pub fn data(&self) -> Option<&BlockData<N>> {
        self.data.as_ref()
    }

    /// Mutable access to the payload, for the solver that owns the fields
    /// between adapt phases.
    pub fn data_mut(&mut self) -> Option<&mut BlockData<N>> {
        self.data.as_mut()
    }

    /// Current level of the neighbor across the given region.
    pub fn face_level(&self, region: Region<N>) -> i32 {
        self.face_level_curr.get(region)
    }

    /// Current level across the given region of the given child.
    pub fn child_face_level(&self, split: Split<N>, region: Region<N>) -> i32 {
        self.child_face_level_curr.get(split, region)
    }

    pub(crate) fn marked_for_delete(&self) -> bool {
        self.delete
    }

    pub(crate) fn mark_for_delete(&mut self) {
        self.delete = true;
    }

    pub(crate) fn set_phase(&mut self, phase: AdaptPhase) {
        self.phase = phase;
    }

    pub(crate) fn bump_age(&mut self) {
        self.age += 1;
    }
}

impl<const N: usize> DataSize for Block<N> {
    const IS_DYNAMIC: bool = true;
    const STATIC_HEAP_SIZE: usize = 0;

    fn estimate_heap_size(&self) -> usize {
        use std::mem::size_of;

        self.children.capacity() * size_of::<Index<N>>()
            + (self.face_level_curr.levels.capacity()
                + self.face_level_next.levels.capacity()
                + self.face_level_last.levels.capacity()
                + self.child_face_level_curr.levels.capacity()
                + self.child_face_level_next.levels.capacity())
                * size_of::<i32>()
            + self
                .data
                .as_ref()
                .map(|data| data.channels() * data.cell_space().len() * size_of::<f64>())
                .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Side;

    fn leaf() -> Block<2> {
        let geometry = ForestGeometry::unit();
        let data = BlockData::new([4, 4], 1).unwrap();
        Block::root(Index::root([0, 0]), data, &geometry)
    }

    #[test]
    fn root_block_shape() {
        let block = leaf();

        assert!(block.is_leaf());
        assert_eq!(block.level(), 0);
        assert_eq!(block.level_next(), 0);
        assert!(block.children().is_empty());
        assert!(block.data().is_some());
    }

    #[test]
    fn child_face_levels_seeded() {
        let block = leaf();

        let lower = Split::pack([false, false]);
        let toward_sibling = Region::new([Side::Right, Side::Middle]);
        let toward_boundary = Region::new([Side::Left, Side::Middle]);

        // A face pointing at a sibling-to-be is one level finer than the
        // block; a face exiting the block inherits the parent face level.
        assert_eq!(block.child_face_level(lower, toward_sibling), 1);
        assert_eq!(block.child_face_level(lower, toward_boundary), 0);
        assert_eq!(block.child_face_level(lower, Region::CENTRAL), 1);
    }
}
