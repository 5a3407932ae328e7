use thiserror::Error;

/// Errors surfaced by the public forest API. Protocol-level invariant
/// breaches do not appear here; those abort, because a broken invariant
/// voids the termination guarantee of the level exchange.
#[derive(Error, Debug)]
pub enum ForestError {
    #[error("a block already exists at {0}")]
    DuplicateBlock(String),
    #[error("index {0} does not name a root tree of this forest")]
    NotARoot(String),
    #[error("block payload extent {0} is odd; refinement requires even extents")]
    OddExtent(usize),
}
