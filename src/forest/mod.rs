//! The block container and the scheduler that drives the adapt phase.
//!
//! Blocks are owned by a map keyed by [`Index`] and communicate only
//! through envelopes on a FIFO queue. The two synchronization styles of
//! the phase reduce to scheduler structure: a neighbor barrier is a full
//! sweep over live blocks before the next sweep starts, and a quiescence
//! barrier is pumping the queue until it is empty. Handlers never block;
//! everything they send is deferred onto the queue.

use std::collections::BTreeMap;
use std::fmt::Write;

use datasize::DataSize;

use crate::block::{AdaptPhase, Block};
use crate::config::AmrConfig;
use crate::criteria::RefineCriterion;
use crate::data::{BlockData, TransferOperator};
use crate::error::ForestError;
use crate::geometry::{neighbor_regions, ForestGeometry, Index, Region};

pub mod message;
pub mod sync;

use message::{AdaptMessage, Envelope, Outbox};

/// What one call to [`Forest::adapt`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AdaptStats {
    /// Adapt iterations executed. One except during initial growth.
    pub steps: u32,
    /// Leaves that split into children.
    pub refined: usize,
    /// Leaves that surrendered their payload to their parent.
    pub coarsened: usize,
}

/// A forest of block actors.
#[derive(Debug, Clone)]
pub struct Forest<const N: usize> {
    geometry: ForestGeometry<N>,
    config: AmrConfig,
    blocks: BTreeMap<Index<N>, Block<N>>,
    /// In-flight envelopes; empty outside of the adapt phase.
    queue: Outbox<N>,
    /// Blocks created by refinement mid-phase. They join `blocks` at the
    /// end of the phase so no new block sees the phase's messages.
    staged: Vec<Block<N>>,
    cycle: u32,
}

impl<const N: usize> Forest<N> {
    pub fn new(geometry: ForestGeometry<N>, config: AmrConfig) -> Self {
        Self {
            geometry,
            config,
            blocks: BTreeMap::new(),
            queue: Outbox::new(),
            staged: Vec::new(),
            cycle: 0,
        }
    }

    /// Builds a forest with every root block carrying a clone of the given
    /// payload.
    pub fn uniform(
        geometry: ForestGeometry<N>,
        config: AmrConfig,
        data: &BlockData<N>,
    ) -> Result<Self, ForestError> {
        let mut forest = Self::new(geometry, config);
        let roots: Vec<_> = forest.geometry.root_indices().collect();

        for index in roots {
            forest.insert_root(index, data.clone())?;
        }

        Ok(forest)
    }

    /// Inserts a root block into the forest.
    pub fn insert_root(&mut self, index: Index<N>, data: BlockData<N>) -> Result<(), ForestError> {
        let inside = index.is_root()
            && index
                .tree()
                .iter()
                .zip(self.geometry.roots())
                .all(|(&coord, extent)| coord < extent);

        if !inside {
            return Err(ForestError::NotARoot(format!("{index:?}")));
        }

        if self.blocks.contains_key(&index) {
            return Err(ForestError::DuplicateBlock(format!("{index:?}")));
        }

        self.blocks
            .insert(index, Block::root(index, data, &self.geometry));

        Ok(())
    }

    pub fn geometry(&self) -> &ForestGeometry<N> {
        &self.geometry
    }

    pub fn config(&self) -> &AmrConfig {
        &self.config
    }

    pub fn cycle(&self) -> u32 {
        self.cycle
    }

    /// Advances the cycle counter. Cycle bookkeeping beyond adaptation is
    /// the surrounding simulation's concern.
    pub fn advance_cycle(&mut self) {
        self.cycle += 1;
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn num_leaves(&self) -> usize {
        self.blocks.values().filter(|block| block.is_leaf()).count()
    }

    pub fn block(&self, index: &Index<N>) -> Option<&Block<N>> {
        self.blocks.get(index)
    }

    pub fn block_mut(&mut self, index: &Index<N>) -> Option<&mut Block<N>> {
        self.blocks.get_mut(index)
    }

    pub fn blocks(&self) -> impl Iterator<Item = &Block<N>> {
        self.blocks.values()
    }

    pub fn leaves(&self) -> impl Iterator<Item = &Block<N>> {
        self.blocks.values().filter(|block| block.is_leaf())
    }

    /// Deepest level currently present.
    pub fn max_level(&self) -> i32 {
        self.blocks
            .values()
            .map(|block| block.level())
            .max()
            .unwrap_or(0)
    }

    /// Runs the adapt phase for the current cycle, if the configured
    /// interval calls for one. Criteria seed desired levels, the level
    /// exchange settles them, and the transfer operator moves payloads
    /// through any refinements and coarsenings.
    pub fn adapt(
        &mut self,
        criteria: &[Box<dyn RefineCriterion<N>>],
        transfer: &dyn TransferOperator<N>,
    ) -> AdaptStats {
        let mut stats = AdaptStats::default();

        if !self.config.do_adapt(self.cycle) {
            return stats;
        }

        let first_cycle = self.config.is_first_cycle(self.cycle);

        for block in self.blocks.values_mut() {
            block.bump_age();
        }

        loop {
            stats.steps += 1;

            self.adapt_begin(criteria, first_cycle);
            self.adapt_called();
            self.pump();
            self.adapt_next(transfer, &mut stats);
            self.pump();

            log::trace!(
                "adapt step {} settled with {} blocks",
                stats.steps,
                self.blocks.len() + self.staged.len()
            );

            if !self.adapt_end(first_cycle) {
                break;
            }
        }

        for block in self.blocks.values_mut() {
            block.set_phase(AdaptPhase::Idle);
        }

        stats
    }

    /// Seeds every block's desired level from the criteria. A full sweep
    /// before any announcement plays the role of the neighbor barrier.
    fn adapt_begin(&mut self, criteria: &[Box<dyn RefineCriterion<N>>], first_cycle: bool) {
        let level_maximum = self.config.mesh_max_level;

        #[cfg(feature = "parallel")]
        let desired: Vec<(Index<N>, i32)> = {
            use rayon::prelude::*;

            self.blocks
                .par_iter()
                .map(|(index, block)| {
                    (
                        *index,
                        block.compute_desired_level(criteria, level_maximum, first_cycle),
                    )
                })
                .collect()
        };

        #[cfg(not(feature = "parallel"))]
        let desired: Vec<(Index<N>, i32)> = self
            .blocks
            .iter()
            .map(|(index, block)| {
                (
                    *index,
                    block.compute_desired_level(criteria, level_maximum, first_cycle),
                )
            })
            .collect();

        for (index, level_next) in desired {
            let block = self.blocks.get_mut(&index).expect("block still present");
            block.set_phase(AdaptPhase::Begin);
            block.set_level_next(level_next);
        }
    }

    /// Every leaf announces its desired level to its neighbors.
    fn adapt_called(&mut self) {
        let Self {
            blocks,
            queue,
            geometry,
            ..
        } = self;

        for block in blocks.values_mut() {
            block.set_phase(AdaptPhase::Called);
            block.send_level(geometry, queue);
        }
    }

    /// Delivers envelopes until none are in flight. Handlers may enqueue
    /// further envelopes; the exchange is finite because desired levels
    /// only rise and are bounded.
    fn pump(&mut self) {
        while self.dispatch_next() {}
    }

    /// Delivers the frontmost envelope, if any.
    fn dispatch_next(&mut self) -> bool {
        let Self {
            blocks,
            queue,
            geometry,
            ..
        } = self;

        let Some(Envelope { to, message }) = queue.pop_front() else {
            return false;
        };

        let Some(block) = blocks.get_mut(&to) else {
            log::error!("envelope addressed to unknown block {:?}: {:?}", to, message);
            panic!("adapt envelope addressed to a block that does not exist");
        };

        match message {
            AdaptMessage::Level {
                sender,
                child,
                face,
                level,
                level_new,
            } => block.recv_level(sender, child, face, level, level_new, geometry, queue),
            AdaptMessage::Child {
                child,
                data,
                face_levels,
            } => block.recv_child(child, data, &face_levels, queue),
            AdaptMessage::Delete => block.mark_for_delete(),
        }

        true
    }

    /// Commits the settled levels and performs the refinements and
    /// coarsenings they call for.
    fn adapt_next(&mut self, transfer: &dyn TransferOperator<N>, stats: &mut AdaptStats) {
        let indices: Vec<_> = self.blocks.keys().copied().collect();

        let Self {
            blocks,
            queue,
            geometry,
            staged,
            ..
        } = self;

        for index in indices {
            let block = blocks.get_mut(&index).expect("block still present");

            block.set_phase(AdaptPhase::Next);
            block.update_levels();

            if !block.is_leaf() {
                continue;
            }

            if block.level() < block.level_next() {
                staged.extend(block.refine(transfer, geometry));
                stats.refined += 1;
            } else if block.level() > block.level_next() {
                block.coarsen(transfer, queue);
                stats.coarsened += 1;
            }
        }
    }

    /// Destroys absorbed blocks, admits the blocks refinement created, and
    /// decides whether the initial-growth loop runs again.
    fn adapt_end(&mut self, first_cycle: bool) -> bool {
        // The root's "done inserting": children created mid-phase join the
        // container only after the phase's messages have drained.
        for block in self.staged.drain(..) {
            let previous = self.blocks.insert(block.index(), block);
            debug_assert!(previous.is_none());
        }

        self.blocks.retain(|_, block| !block.marked_for_delete());

        let level_maximum = self.config.mesh_max_level;
        let mut again = false;

        for block in self.blocks.values_mut() {
            block.set_phase(AdaptPhase::End);
            again = block.end_adapt(first_cycle, level_maximum);
        }

        again
    }

    /// Whether every pair of adjacent leaves differs by at most one level.
    pub fn is_balanced(&self) -> bool {
        let mut levels = Vec::new();

        for block in self.leaves() {
            for face in neighbor_regions::<N>(0) {
                levels.clear();
                self.adjacent_leaf_levels(block.index(), face, &mut levels);

                if levels
                    .iter()
                    .any(|&level| (level - block.level()).abs() > 1)
                {
                    return false;
                }
            }
        }

        true
    }

    /// Collects the levels of every leaf adjacent to `index` across the
    /// given face, whether the neighbor is coarser, equal, or finer.
    fn adjacent_leaf_levels(&self, index: Index<N>, face: Region<N>, out: &mut Vec<i32>) {
        let Some(neighbor) = index.neighbor(face, &self.geometry) else {
            return;
        };

        let mut probe = neighbor;

        loop {
            if let Some(block) = self.blocks.get(&probe) {
                if block.is_leaf() {
                    out.push(block.level());
                } else {
                    self.collect_leaves_toward(probe, face.reverse(), out);
                }
                return;
            }

            if probe.is_root() {
                return;
            }

            probe = probe.parent();
        }
    }

    /// Collects leaf levels among the descendants of `index` that touch
    /// the `toward` side.
    fn collect_leaves_toward(&self, index: Index<N>, toward: Region<N>, out: &mut Vec<i32>) {
        for split in toward.adjacent_splits() {
            let child = index.child(split);

            if let Some(block) = self.blocks.get(&child) {
                if block.is_leaf() {
                    out.push(block.level());
                } else {
                    self.collect_leaves_toward(child, toward, out);
                }
            }
        }
    }

    /// Writes a textual summary of the forest to a sink. This is primarily
    /// used to debug structure that is awkward to inspect otherwise.
    pub fn write_debug(&self, mut result: impl Write) {
        writeln!(result, "// **********************").unwrap();
        writeln!(result, "// Blocks ***************").unwrap();
        writeln!(result, "// **********************").unwrap();
        writeln!(result).unwrap();

        for block in self.blocks.values() {
            writeln!(result, "Block {:?}", block.index()).unwrap();
            writeln!(
                result,
                "    Level {} -> {}",
                block.level(),
                block.level_next()
            )
            .unwrap();
            writeln!(result, "    Leaf {}", block.is_leaf()).unwrap();
            writeln!(result, "    Children {:?}", block.children()).unwrap();

            for face in neighbor_regions::<N>(0) {
                writeln!(result, "    Face {} level {}", face, block.face_level(face)).unwrap();
            }
        }
    }
}

impl<const N: usize> DataSize for Forest<N> {
    const IS_DYNAMIC: bool = true;
    const STATIC_HEAP_SIZE: usize = 0;

    fn estimate_heap_size(&self) -> usize {
        use std::mem::size_of;

        self.blocks
            .values()
            .map(|block| size_of::<Block<N>>() + block.estimate_heap_size())
            .sum::<usize>()
            + self.staged.capacity() * size_of::<Block<N>>()
            + self.queue.capacity() * size_of::<Envelope<N>>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::criteria::AlwaysRefine;
    use crate::data::Injection;
    use crate::geometry::{Side, Split};

    fn two_leaf_forest() -> Forest<1> {
        let config = AmrConfig {
            mesh_max_level: 3,
            ..Default::default()
        };
        let data = BlockData::new([4], 1).unwrap();
        let mut forest = Forest::uniform(ForestGeometry::unit(), config, &data).unwrap();

        // Grow one level so the root has two leaf children.
        let criteria: Vec<Box<dyn RefineCriterion<1>>> = vec![Box::new(AlwaysRefine)];
        let config_level_one = forest.adapt_phase_for_tests(&criteria);
        assert_eq!(config_level_one, 2);

        forest
    }

    impl<const N: usize> Forest<N> {
        /// Runs a single non-initial adapt iteration regardless of the
        /// cycle gating, returning the number of leaves afterward.
        fn adapt_phase_for_tests(&mut self, criteria: &[Box<dyn RefineCriterion<N>>]) -> usize {
            self.adapt_begin(criteria, false);
            self.adapt_called();
            self.pump();
            self.adapt_next(&Injection, &mut AdaptStats::default());
            self.pump();
            self.adapt_end(false);

            for block in self.blocks.values_mut() {
                block.set_phase(AdaptPhase::Idle);
            }

            self.num_leaves()
        }
    }

    #[test]
    fn duplicate_announcement_is_idempotent() {
        let mut forest = two_leaf_forest();

        let root = Index::root([0]);
        let left = root.child(Split::pack([false]));
        let right = root.child(Split::pack([true]));

        for block in forest.blocks.values_mut() {
            block.set_phase(AdaptPhase::Called);
            block.set_level_next(block.level());
        }

        let announce = Envelope {
            to: right,
            message: AdaptMessage::Level {
                sender: left,
                child: Split::empty(),
                face: Region::new([Side::Right]),
                level: 1,
                level_new: 3,
            },
        };

        // The first delivery tightens the receiver and fans out its
        // re-announcement.
        forest.queue.push_back(announce.clone());
        forest.dispatch_next();
        assert!(!forest.queue.is_empty());
        forest.pump();

        let once = forest.clone();

        // Equal redelivery re-applies but changes nothing and triggers no
        // second fan-out.
        forest.queue.push_back(announce);
        forest.dispatch_next();
        assert!(forest.queue.is_empty());

        let target = forest.block(&right).unwrap();
        let reference = once.block(&right).unwrap();

        assert_eq!(target.level_next(), reference.level_next());
        assert_eq!(target.level_next(), 2);
        assert_eq!(
            target.face_level(Region::new([Side::Left])),
            reference.face_level(Region::new([Side::Left]))
        );
    }

    #[test]
    fn stale_announcement_is_dropped() {
        let mut forest = two_leaf_forest();

        let root = Index::root([0]);
        let left = root.child(Split::pack([false]));
        let right = root.child(Split::pack([true]));

        for block in forest.blocks.values_mut() {
            block.set_phase(AdaptPhase::Called);
            block.set_level_next(block.level());
        }

        let face = Region::new([Side::Right]);

        forest.queue.push_back(Envelope {
            to: right,
            message: AdaptMessage::Level {
                sender: left,
                child: Split::empty(),
                face,
                level: 1,
                level_new: 3,
            },
        });
        forest.pump();

        let settled = forest.block(&right).unwrap().level_next();
        assert_eq!(settled, 2);

        // A reordered announcement carrying an older, smaller level is
        // filtered before it can touch any state.
        forest.queue.push_back(Envelope {
            to: right,
            message: AdaptMessage::Level {
                sender: left,
                child: Split::empty(),
                face,
                level: 1,
                level_new: 2,
            },
        });
        forest.pump();

        assert_eq!(forest.block(&right).unwrap().level_next(), settled);
    }

    #[test]
    fn rejects_bad_roots() {
        let config = AmrConfig::default();
        let data = BlockData::new([4, 4], 1).unwrap();
        let mut forest = Forest::<2>::new(ForestGeometry::unit(), config);

        forest.insert_root(Index::root([0, 0]), data.clone()).unwrap();

        assert!(matches!(
            forest.insert_root(Index::root([0, 0]), data.clone()),
            Err(ForestError::DuplicateBlock(_))
        ));
        assert!(matches!(
            forest.insert_root(Index::root([1, 0]), data),
            Err(ForestError::NotARoot(_))
        ));
    }
}
