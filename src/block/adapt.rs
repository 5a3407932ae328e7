//! Per-block half of the adapt phase: computing desired levels, announcing
//! them across faces, tightening on received announcements, and moving
//! field data when the block finally refines or coarsens.
//!
//! The exchange converges because a block's desired level only ever rises
//! in response to a message (checked below) and is bounded by the
//! configured maximum, and because announcements that would lower what a
//! face has already reported are dropped before they take effect.

use crate::criteria::{apply_criteria, AdaptOutcome, RefineCriterion};
use crate::data::{BlockData, TransferOperator};
use crate::forest::message::{AdaptMessage, Envelope, Outbox};
use crate::geometry::{neighbor_regions, ForestGeometry, Index, Region, Split};

use super::{AdaptPhase, Block};

impl<const N: usize> Block<N> {
    /// Applies the refinement criteria to this block's payload and returns
    /// the level it would like to hold, clamped to `[0, level_maximum]`.
    /// Interior blocks hold their level; on the first cycle leaves may
    /// grow the hierarchy but never shrink it.
    pub(crate) fn compute_desired_level(
        &self,
        criteria: &[Box<dyn RefineCriterion<N>>],
        level_maximum: i32,
        first_cycle: bool,
    ) -> i32 {
        if !self.is_leaf {
            return self.level;
        }

        let data = self.data.as_ref().expect("leaf block carries field data");
        let adapt = apply_criteria(criteria, data);

        if adapt == AdaptOutcome::Coarsen && self.level > 0 && !first_cycle {
            self.level - 1
        } else if adapt == AdaptOutcome::Refine && self.level < level_maximum {
            self.level + 1
        } else {
            self.level
        }
    }

    pub(crate) fn set_level_next(&mut self, level_next: i32) {
        self.level_next = level_next;
    }

    /// Announces `(level, level_next)` across every face. The send mode
    /// depends on the level of the neighbor across each face.
    pub(crate) fn send_level(&self, geometry: &ForestGeometry<N>, outbox: &mut Outbox<N>) {
        if !self.is_leaf {
            return;
        }

        let level = self.level;

        for face in neighbor_regions::<N>(0) {
            let Some(neighbor) = self.index.neighbor(face, geometry) else {
                // Physical boundary of the forest.
                continue;
            };

            let level_face = self.face_level_curr.get(face);

            if level_face == level {
                // SEND-SAME: the unique neighboring block in the same
                // level.
                outbox.push_back(Envelope {
                    to: neighbor,
                    message: AdaptMessage::Level {
                        sender: self.index,
                        child: Split::empty(),
                        face,
                        level,
                        level_new: self.level_next,
                    },
                });
            } else if level_face == level - 1 {
                // SEND-COARSE: the unique neighboring block in the
                // next-coarser level. Every sibling sharing this face
                // would target the same uncle, so only the sibling whose
                // face survives the parent-face map sends.
                let child = self.index.child_in_parent();

                if face.parent_region(child) == face {
                    outbox.push_back(Envelope {
                        to: neighbor.parent(),
                        message: AdaptMessage::Level {
                            sender: self.index,
                            child,
                            face,
                            level,
                            level_new: self.level_next,
                        },
                    });
                }
            } else if level_face == level + 1 {
                // SEND-FINE: all nibling blocks in the next-finer level
                // along the face.
                for child in face.reverse().adjacent_splits() {
                    outbox.push_back(Envelope {
                        to: neighbor.child(child),
                        message: AdaptMessage::Level {
                            sender: self.index,
                            child,
                            face,
                            level,
                            level_new: self.level_next,
                        },
                    });
                }
            } else {
                log::warn!(
                    "{:?} face {} level {} and face level {} differ by more than 1",
                    self.index,
                    face,
                    level,
                    level_face
                );
            }
        }
    }

    /// Handler for a neighbor's level announcement.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn recv_level(
        &mut self,
        sender: Index<N>,
        child: Split<N>,
        face: Region<N>,
        level_face_curr: i32,
        level_face_new: i32,
        geometry: &ForestGeometry<N>,
        outbox: &mut Outbox<N>,
    ) {
        debug_assert_eq!(self.phase, AdaptPhase::Called);

        if sender.level() != level_face_curr {
            log::warn!(
                "{:?} level mismatch between sender {:?} and announced level {}",
                self.index,
                sender,
                level_face_curr
            );
        }

        // Monotone idempotency filter: an announcement below what this
        // face last reported is stale and is dropped. Equal announcements
        // re-apply harmlessly.
        if self.face_level_last.get(child, face) > level_face_new {
            return;
        }
        self.face_level_last.set(child, face, level_face_new);

        if !self.is_leaf {
            // An interior block has nothing to negotiate. An earlier
            // design forwarded such announcements to children but never
            // exercised that path; abort loudly so the envelope can be
            // diagnosed if it ever appears.
            log::error!(
                "{:?} received a level announcement while interior: \
                 sender {:?} child {} face {} levels {} -> {}",
                self.index,
                sender,
                child.to_linear(),
                face,
                level_face_curr,
                level_face_new
            );
            panic!("level announcement received by an interior block");
        }

        let level = self.level;
        let mut level_next = self.level_next;
        let of = face.reverse();

        match level_face_curr - level {
            0 => self.recv_same(of, level_face_new),
            1 => self.recv_fine(of, child, level_face_new, geometry),
            -1 => self.recv_coarse(of, child, level_face_new),
            _ => log::warn!(
                "{:?} level {} and announced level {} differ by more than 1",
                self.index,
                level,
                level_face_curr
            ),
        }

        // A block may only coarsen if every sibling coarsens with it and
        // no sibling has children. A sibling that stays finer, or any
        // nephew at all, cancels the coarsening.
        let is_coarsening = level_next < level;

        let is_sibling = self.index.level() > 0
            && sender.level() > 0
            && sender.parent() == self.index.parent();

        let is_nephew = self.index.level() > 0
            && sender.level() > 1
            && sender.parent().parent() == self.index.parent();

        let is_finer_neighbor = level_face_new > level_next;

        if is_coarsening && ((is_sibling && is_finer_neighbor) || is_nephew) {
            level_next = level;
        }

        // Tighten to within one level of the neighbor's desired level.
        level_next = level_next.max(level_face_new - 1);

        if level_next != self.level_next {
            assert!(
                level_next > self.level_next,
                "{:?} desired level regressed from {} to {}",
                self.index,
                self.level_next,
                level_next
            );

            self.level_next = level_next;
            self.send_level(geometry, outbox);
        }
    }

    /// RECV-SAME: the unique face level is updated, along with the levels
    /// of every child face that crosses into the announcing neighbor.
    fn recv_same(&mut self, of: Region<N>, level_face_new: i32) {
        self.face_level_next.set(of, level_face_new);

        for jc in of.adjacent_splits() {
            for jf in of.aligned_faces(jc) {
                self.child_face_level_next.set(jc, jf, level_face_new);
            }
        }
    }

    /// RECV-FINE: an announcement from one of possibly several finer
    /// neighbors along the face. Only the child faces looking at that
    /// particular sender are updated.
    fn recv_fine(
        &mut self,
        of: Region<N>,
        child: Split<N>,
        level_face_new: i32,
        geometry: &ForestGeometry<N>,
    ) {
        self.face_level_next.set(of, level_face_new);

        let Some(neighbor) = self.index.neighbor(of, geometry) else {
            return;
        };
        let index_sender = neighbor.child(child);

        for jc in of.adjacent_splits() {
            let index_child = self.index.child(jc);

            for jf in of.aligned_faces(jc) {
                if index_child.neighbor(jf, geometry) == Some(index_sender) {
                    self.child_face_level_next.set(jc, jf, level_face_new);
                }
            }
        }
    }

    /// RECV-COARSE: a coarse neighbor's announcement lands on every face
    /// of this block that exits through the shared parent face, and on the
    /// child faces beneath those.
    fn recv_coarse(&mut self, of: Region<N>, child: Split<N>, level_face_new: i32) {
        for jf in of.aligned_faces(child) {
            self.face_level_next.set(jf, level_face_new);

            for jc in jf.adjacent_splits() {
                for kf in jf.aligned_faces(jc) {
                    self.child_face_level_next.set(jc, kf, level_face_new);
                }
            }
        }
    }

    /// Commits the negotiation results.
    pub(crate) fn update_levels(&mut self) {
        self.face_level_curr.clone_from(&self.face_level_next);
        self.child_face_level_curr
            .clone_from(&self.child_face_level_next);
    }

    /// Splits this leaf into `2^N` children, handing each a prolonged
    /// octant of the payload and its slice of the per-child face levels.
    /// Returns the created blocks; the caller owns their storage.
    pub(crate) fn refine(
        &mut self,
        transfer: &dyn TransferOperator<N>,
        geometry: &ForestGeometry<N>,
    ) -> Vec<Block<N>> {
        debug_assert!(self.is_leaf && self.level < self.level_next);

        let data = self.data.take().expect("leaf block carries field data");
        let mut created = Vec::with_capacity(Split::<N>::COUNT);

        for split in Split::<N>::enumerate() {
            let index_child = self.index.child(split);

            if self.children.contains(&index_child) {
                continue;
            }

            let payload = transfer.prolong(&data, split);

            created.push(Block::child(
                index_child,
                payload,
                self.child_face_level_curr.slice(split),
                self.adapt_step,
                geometry,
            ));
            self.children.push(index_child);
        }

        self.is_leaf = false;
        created
    }

    /// Surrenders this leaf's payload to its parent: the payload is
    /// restricted to octant shape and sent together with the face levels
    /// the parent will take over.
    pub(crate) fn coarsen(&self, transfer: &dyn TransferOperator<N>, outbox: &mut Outbox<N>) {
        debug_assert!(self.level_next < self.level);

        if self.level == 0 || !self.is_leaf {
            return;
        }

        let data = self.data.as_ref().expect("leaf block carries field data");

        outbox.push_back(Envelope {
            to: self.index.parent(),
            message: AdaptMessage::Child {
                child: self.index.child_in_parent(),
                data: transfer.restrict(data),
                face_levels: self.face_level_curr.as_slice().to_vec(),
            },
        });
    }

    /// Handler on the parent for one coarsening child's payload. The
    /// parent becomes a leaf on the first arrival and keeps assembling its
    /// payload as the remaining siblings report; the child list clears
    /// once all of them have.
    pub(crate) fn recv_child(
        &mut self,
        child: Split<N>,
        octant: BlockData<N>,
        face_levels: &[i32],
        outbox: &mut Outbox<N>,
    ) {
        debug_assert_eq!(self.phase, AdaptPhase::Next);
        debug_assert_eq!(face_levels.len(), Region::<N>::COUNT);

        let size = octant.size().map(|s| 2 * s);
        let data = self
            .data
            .get_or_insert_with(|| BlockData::zeros(size, octant.channels()));
        data.store_octant(child, &octant);

        // The child's view of its surroundings becomes this block's view
        // of that child, and feeds the parent faces the child's faces exit
        // through.
        for face in neighbor_regions::<N>(0) {
            self.child_face_level_curr
                .set(child, face, face_levels[face.to_linear()]);
        }

        for face in neighbor_regions::<N>(0) {
            let parent_face = face.parent_region(child);

            if !parent_face.is_central() {
                self.face_level_curr
                    .set(parent_face, face_levels[face.to_linear()]);
            }
        }

        self.is_leaf = true;

        outbox.push_back(Envelope {
            to: self.index.child(child),
            message: AdaptMessage::Delete,
        });

        if self.sync_coarsen.tick() {
            self.children.clear();
        }

        self.age = 0;
    }

    /// Per-block epilogue of the adapt phase: clears the idempotency
    /// filter, re-arms the sibling counter, and votes on whether the
    /// initial-growth loop runs another iteration.
    pub(crate) fn end_adapt(&mut self, first_cycle: bool, level_maximum: i32) -> bool {
        self.face_level_last.fill(0);
        self.sync_coarsen.reset();

        first_cycle && {
            let step = self.adapt_step;
            self.adapt_step += 1;
            (step as i32) < level_maximum
        }
    }
}
