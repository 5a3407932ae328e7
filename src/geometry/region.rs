use std::array::from_fn;
use std::fmt::{Display, Write};

use serde::{Deserialize, Serialize};

use super::{Grid, Split};

/// Denotes where a neighbor falls relative to a block on a certain axis.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Side {
    Left = 0,
    #[default]
    Middle = 1,
    Right = 2,
}

impl Side {
    pub fn reverse(self) -> Self {
        match self {
            Self::Left => Self::Right,
            Self::Right => Self::Left,
            Self::Middle => Self::Middle,
        }
    }

    pub fn from_value(val: u8) -> Self {
        assert!(val < 3);
        // Safety. We have specified the memory representation of the
        // enum and checked the value, so this should be safe.
        unsafe { std::mem::transmute(val) }
    }

    /// Signed offset along the axis: -1, 0, or +1.
    pub fn delta(self) -> i64 {
        self as i64 - 1
    }
}

/// One of the `3^N` directions from a block to a neighbor: a face when a
/// single axis is off-middle, an edge when two are, a corner when all are.
/// The all-middle direction is the block itself and never names a neighbor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region<const N: usize> {
    #[serde(with = "crate::array")]
    sides: [Side; N],
}

impl<const N: usize> Region<N> {
    /// Number of different regions in a given number of dimensions.
    pub const COUNT: usize = 3usize.pow(N as u32);
    /// The default "central" region.
    pub const CENTRAL: Self = Self::new([Side::Middle; N]);

    /// Builds a new region from the given sides.
    pub const fn new(sides: [Side; N]) -> Self {
        Self { sides }
    }

    pub const fn sides(&self) -> [Side; N] {
        self.sides
    }

    pub const fn side(&self, axis: usize) -> Side {
        self.sides[axis]
    }

    pub fn set_side(&mut self, axis: usize, side: Side) {
        self.sides[axis] = side
    }

    pub fn is_central(&self) -> bool {
        *self == Self::CENTRAL
    }

    /// Reverses every side in the region, yielding the mirror direction.
    pub fn reverse(&self) -> Self {
        let mut result = [Side::Left; N];

        for axis in 0..N {
            result[axis] = self.sides[axis].reverse();
        }

        Self::new(result)
    }

    /// Returns number of axes that are not `Side::Middle`.
    pub fn adjacency(&self) -> usize {
        self.sides
            .into_iter()
            .filter(|&s| s != Side::Middle)
            .count()
    }

    /// Dimensionality of the shared facet: `N - 1` for a face, `N - 2`
    /// for an edge, zero for a corner.
    pub fn face_rank(&self) -> usize {
        N - self.adjacency()
    }

    /// Iterates over all child selectors adjacent to this region.
    pub fn adjacent_splits(self) -> impl Iterator<Item = Split<N>> {
        let origin: [_; N] = from_fn(|axis| match self.side(axis) {
            Side::Left | Side::Middle => 0,
            Side::Right => 1,
        });

        let size: [_; N] = from_fn(|axis| match self.side(axis) {
            Side::Middle => 2,
            _ => 1,
        });

        Grid::new(size)
            .iter()
            .map(move |cell| Split::pack(from_fn(|axis| origin[axis] + cell[axis] != 0)))
    }

    /// Checks whether a given child selector is adjacent to the region.
    pub fn is_split_adjacent(&self, split: Split<N>) -> bool {
        for axis in 0..N {
            match (self.side(axis), split.is_set(axis)) {
                (Side::Left, true) => return false,
                (Side::Right, false) => return false,
                _ => {}
            }
        }

        true
    }

    /// Maps a face of the child at `split` onto the face of the parent it
    /// exits through. Components that point from the child toward a sibling
    /// are interior to the parent and collapse to `Middle`; a face lying
    /// entirely within the parent collapses to [`Region::CENTRAL`].
    pub fn parent_region(&self, split: Split<N>) -> Self {
        let mut result = self.sides;

        for axis in 0..N {
            let interior = match self.sides[axis] {
                Side::Right => !split.is_set(axis),
                Side::Left => split.is_set(axis),
                Side::Middle => false,
            };

            if interior {
                result[axis] = Side::Middle;
            }
        }

        Self::new(result)
    }

    /// Iterates the non-central faces of the child at `split` that exit the
    /// parent through the same parent face as `self` does.
    pub fn aligned_faces(self, split: Split<N>) -> impl Iterator<Item = Region<N>> {
        let target = self.parent_region(split);

        regions::<N>().filter(move |jf| !jf.is_central() && jf.parent_region(split) == target)
    }

    /// Converts the region into an integer value.
    pub fn to_linear(&self) -> usize {
        let grid = Grid::new([3; N]);
        grid.offset(from_fn(|axis| self.side(axis) as usize))
    }

    /// Converts an integer value into a region.
    pub fn from_linear(val: usize) -> Self {
        let cell = Grid::<N>::new([3; N]).cell(val);
        Self::new(from_fn(|axis| Side::from_value(cell[axis] as u8)))
    }
}

impl<const N: usize> Display for Region<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for axis in 0..N {
            match self.side(axis) {
                Side::Left => f.write_char('-'),
                Side::Middle => f.write_char('='),
                Side::Right => f.write_char('+'),
            }?;
        }
        Ok(())
    }
}

pub struct RegionIter<const N: usize> {
    inner: super::GridIter<N>,
}

impl<const N: usize> Iterator for RegionIter<N> {
    type Item = Region<N>;

    fn next(&mut self) -> Option<Self::Item> {
        let cell = self.inner.next()?;
        Some(Region::new(cell.map(|side| Side::from_value(side as u8))))
    }
}

/// Iterates over all regions in an N-dimensional space.
pub fn regions<const N: usize>() -> RegionIter<N> {
    RegionIter {
        inner: Grid::new([3; N]).iter(),
    }
}

/// Iterates the neighbor directions of a block: every non-central region
/// whose facet rank is at least `min_face_rank`.
pub fn neighbor_regions<const N: usize>(min_face_rank: usize) -> impl Iterator<Item = Region<N>> {
    regions::<N>().filter(move |region| {
        !region.is_central() && region.face_rank() >= min_face_rank
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_iteration() {
        let comparison = [
            [Side::Left, Side::Left],
            [Side::Middle, Side::Left],
            [Side::Right, Side::Left],
            [Side::Left, Side::Middle],
            [Side::Middle, Side::Middle],
            [Side::Right, Side::Middle],
            [Side::Left, Side::Right],
            [Side::Middle, Side::Right],
            [Side::Right, Side::Right],
        ];

        for (region, compare) in regions().zip(comparison.into_iter()) {
            assert_eq!(region, Region::new(compare));
        }
    }

    #[test]
    fn neighbor_counts() {
        assert_eq!(neighbor_regions::<2>(0).count(), 8);
        assert_eq!(neighbor_regions::<3>(0).count(), 26);

        // Excluding corners in two dimensions leaves the four faces.
        assert_eq!(neighbor_regions::<2>(1).count(), 4);
        // Faces only in three dimensions.
        assert_eq!(neighbor_regions::<3>(2).count(), 6);
    }

    #[test]
    fn adjacency() {
        let region = Region::new([Side::Left, Side::Right]);
        assert_eq!(region.adjacency(), 2);
        assert_eq!(region.face_rank(), 0);

        let mut splits = region.adjacent_splits();
        assert_eq!(splits.next(), Some(Split::pack([false, true])));
        assert_eq!(splits.next(), None);

        let face = Region::new([Side::Right, Side::Middle]);
        let adjacent: Vec<_> = face.adjacent_splits().collect();
        assert_eq!(
            adjacent,
            vec![Split::pack([true, false]), Split::pack([true, true])]
        );
    }

    #[test]
    fn parent_regions() {
        // The +x face of the lower-left child points at its sibling.
        let face = Region::new([Side::Right, Side::Middle]);
        let lower = Split::pack([false, false]);
        assert!(face.parent_region(lower).is_central());

        // The same face of the lower-right child exits through the
        // parent's +x face.
        let right = Split::pack([true, false]);
        assert_eq!(face.parent_region(right), face);

        // A corner with one component interior collapses to a face.
        let corner = Region::new([Side::Right, Side::Left]);
        let upper_right = Split::pack([true, true]);
        assert_eq!(
            corner.parent_region(upper_right),
            Region::new([Side::Right, Side::Middle])
        );
    }

    #[test]
    fn aligned_face_sets() {
        // Faces of the lower-left child that exit through the parent's -x
        // face: the child's own -x face, and its -x/+y corner, which points
        // past the sibling but still crosses only the -x boundary. The
        // -x/-y corner exits through the parent's corner instead.
        let of = Region::new([Side::Left, Side::Middle]);
        let child = Split::pack([false, false]);

        let faces: Vec<_> = of.aligned_faces(child).collect();

        assert!(faces.contains(&Region::new([Side::Left, Side::Middle])));
        assert!(faces.contains(&Region::new([Side::Left, Side::Right])));
        assert_eq!(faces.len(), 2);
    }

    #[test]
    fn serde_round_trip() {
        let region = Region::new([Side::Left, Side::Right, Side::Middle]);
        let text = ron::to_string(&region).unwrap();
        let back: Region<3> = ron::from_str(&text).unwrap();

        assert_eq!(region, back);
    }
}
