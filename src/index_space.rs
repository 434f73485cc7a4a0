use core::ops::Range;




/**
 * Identifier for a Cartesian axis of the hex block. `I` is the fastest
 * varying (x, xi), `K` the slowest (z, zeta).
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Axis {
    I,
    J,
    K,
}




/**
 * Represents a box-shaped region in a discrete 3D index space. Indexes are
 * `(i, j, k)` triples and memory order is column-major: `i` increases
 * fastest, matching the node and element numbering of a rank's block.
 */
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexSpace {
    di: Range<i64>,
    dj: Range<i64>,
    dk: Range<i64>,
}




// ============================================================================
impl IndexSpace {


    pub fn new(di: Range<i64>, dj: Range<i64>, dk: Range<i64>) -> Self {

        assert!(
            di.start <= di.end && dj.start <= dj.end && dk.start <= dk.end,
            "index space has negative volume");

        Self { di, dj, dk }
    }


    /**
     * A cube of side `n` anchored at the origin.
     */
    pub fn cube(n: usize) -> Self {
        let n = n as i64;
        Self::new(0..n, 0..n, 0..n)
    }


    /**
     * Return the number of indexes on each axis.
     */
    pub fn dim(&self) -> (usize, usize, usize) {
        ((self.di.end - self.di.start) as usize,
         (self.dj.end - self.dj.start) as usize,
         (self.dk.end - self.dk.start) as usize)
    }


    /**
     * Return the number of elements in this index space.
     */
    pub fn len(&self) -> usize {
        let (l, m, n) = self.dim();
        l * m * n
    }


    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }


    /**
     * Determine whether this index space contains the given index.
     */
    pub fn contains(&self, index: (i64, i64, i64)) -> bool {
        self.di.contains(&index.0) && self.dj.contains(&index.1) && self.dk.contains(&index.2)
    }


    /**
     * Restrict this space to a single layer on the given axis: the lowest
     * layer if `upper` is false, otherwise the highest.
     */
    pub fn layer(&self, axis: Axis, upper: bool) -> Self {
        let pick = |r: &Range<i64>| if upper { r.end - 1 .. r.end } else { r.start .. r.start + 1 };
        match axis {
            Axis::I => Self::new(pick(&self.di), self.dj.clone(), self.dk.clone()),
            Axis::J => Self::new(self.di.clone(), pick(&self.dj), self.dk.clone()),
            Axis::K => Self::new(self.di.clone(), self.dj.clone(), pick(&self.dk)),
        }
    }


    /**
     * Return the linear offset for the given index, in an i-fastest memory
     * buffer aligned with the start of this index space.
     */
    pub fn linear_offset(&self, index: (i64, i64, i64)) -> usize {
        let (l, m, _) = self.dim();
        let i = (index.0 - self.di.start) as usize;
        let j = (index.1 - self.dj.start) as usize;
        let k = (index.2 - self.dk.start) as usize;
        (k * m + j) * l + i
    }


    /**
     * Return an iterator which traverses the index space in memory order
     * (the first index increases fastest).
     */
    pub fn iter(&self) -> impl Iterator<Item = (i64, i64, i64)> + '_ {
        self.dk.clone().flat_map(move |k| {
            self.dj.clone().flat_map(move |j| self.di.clone().map(move |i| (i, j, k)))
        })
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::{Axis, IndexSpace};

    #[test]
    fn iteration_follows_memory_order() {
        let space = IndexSpace::new(0..3, 0..2, 0..2);
        let offsets: Vec<_> = space.iter().map(|index| space.linear_offset(index)).collect();
        assert_eq!(offsets, (0..12).collect::<Vec<_>>());
    }

    #[test]
    fn zero_extent_is_empty() {
        assert!(IndexSpace::cube(0).is_empty());
        assert_eq!(IndexSpace::cube(3).len(), 27);
    }

    #[test]
    fn layers_are_single_planes() {
        let cube = IndexSpace::cube(4);
        let top = cube.layer(Axis::K, true);
        assert_eq!(top.len(), 16);
        assert!(top.iter().all(|(_, _, k)| k == 3));
        let edge = cube.layer(Axis::I, false).layer(Axis::J, true);
        assert_eq!(edge.dim(), (1, 1, 4));
    }

    #[test]
    fn offset_is_relative_to_start() {
        let space = IndexSpace::new(2..4, 5..7, 1..3);
        assert_eq!(space.linear_offset((2, 5, 1)), 0);
        assert_eq!(space.linear_offset((3, 6, 2)), 7);
        assert!(space.contains((3, 6, 2)));
        assert!(!space.contains((4, 6, 2)));
    }
}
