//! Message envelopes exchanged between blocks during the adapt phase.
//! Delivery between a given sender and receiver is first-in first-out;
//! across senders no order is assumed, and the receiving handlers are
//! written to absorb reordering.

use std::collections::VecDeque;

use crate::data::BlockData;
use crate::geometry::{Index, Region, Split};

/// A message addressed to one block.
#[derive(Debug, Clone)]
pub struct Envelope<const N: usize> {
    pub to: Index<N>,
    pub message: AdaptMessage<N>,
}

/// The adapt-phase message classes.
#[derive(Debug, Clone)]
pub enum AdaptMessage<const N: usize> {
    /// A neighbor announces its current and desired level across a face.
    /// `child` identifies the sender's position within its parent when the
    /// sender is finer than the receiver, or the receiver's own position
    /// when the sender is coarser; between equals it is empty.
    Level {
        sender: Index<N>,
        child: Split<N>,
        face: Region<N>,
        level: i32,
        level_new: i32,
    },
    /// A coarsening child surrenders its restricted payload and its face
    /// levels to its parent.
    Child {
        child: Split<N>,
        data: BlockData<N>,
        face_levels: Vec<i32>,
    },
    /// The parent has absorbed this block; destroy it at the end of the
    /// phase.
    Delete,
}

/// Queue of in-flight envelopes. The adapt phase is quiescent exactly when
/// this is empty.
pub(crate) type Outbox<const N: usize> = VecDeque<Envelope<N>>;
