//! Refinement criteria: the per-leaf verdicts that seed each adapt phase.

use crate::data::BlockData;

/// Verdict of a refinement criterion on a leaf's payload. The ordering
/// matters: when several criteria are applied, the strongest verdict wins,
/// and refinement outranks coarsening.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AdaptOutcome {
    Unknown,
    Same,
    Coarsen,
    Refine,
}

/// A per-leaf refinement criterion. Implementations see only the field
/// payload; structural decisions (level bounds, first-cycle rules, 2:1
/// balance) are layered on by the control plane.
pub trait RefineCriterion<const N: usize>: Send + Sync {
    fn apply(&self, data: &BlockData<N>) -> AdaptOutcome;
}

/// Folds a criterion list into the verdict for one leaf: the maximum over
/// all criteria, `Unknown` when the list is empty.
pub fn apply_criteria<const N: usize>(
    criteria: &[Box<dyn RefineCriterion<N>>],
    data: &BlockData<N>,
) -> AdaptOutcome {
    criteria
        .iter()
        .map(|criterion| criterion.apply(data))
        .max()
        .unwrap_or(AdaptOutcome::Unknown)
}

/// Refines every leaf it is applied to. Useful for growing a uniformly
/// refined initial hierarchy.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysRefine;

impl<const N: usize> RefineCriterion<N> for AlwaysRefine {
    fn apply(&self, _data: &BlockData<N>) -> AdaptOutcome {
        AdaptOutcome::Refine
    }
}

/// Two-threshold criterion on the max-norm of one payload channel: refine
/// where the magnitude reaches `upper`, coarsen where it stays below
/// `lower`.
#[derive(Debug, Clone, Copy)]
pub struct Threshold {
    pub channel: usize,
    pub lower: f64,
    pub upper: f64,
}

impl Threshold {
    pub fn new(channel: usize, lower: f64, upper: f64) -> Self {
        assert!(lower <= upper);

        Self {
            channel,
            lower,
            upper,
        }
    }
}

impl<const N: usize> RefineCriterion<N> for Threshold {
    fn apply(&self, data: &BlockData<N>) -> AdaptOutcome {
        let norm = data
            .channel(self.channel)
            .iter()
            .fold(0.0f64, |acc, v| acc.max(v.abs()));

        if norm >= self.upper {
            AdaptOutcome::Refine
        } else if norm <= self.lower {
            AdaptOutcome::Coarsen
        } else {
            AdaptOutcome::Same
        }
    }
}
