//! Geometry of the block decomposition: the cubic rank grid, this rank's
//! place in it, and the true and padded sizes of its local block.

use crate::error::Error;
use crate::index_space::IndexSpace;

/// Alignment width in reals: 128 bytes of `f64`.
pub const ALIGN_REALS: usize = 128 / std::mem::size_of::<f64>();

/// Round `n` up to the next multiple of [`ALIGN_REALS`].
///
pub fn cache_align(n: usize) -> usize {
    (n + ALIGN_REALS - 1) & !(ALIGN_REALS - 1)
}

/// Whether each of the six block faces is a rank boundary (true: needs
/// exchange with a neighbor rank) or a physical domain boundary (false).
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FaceExchange {
    pub col_min: bool,
    pub col_max: bool,
    pub row_min: bool,
    pub row_max: bool,
    pub plane_min: bool,
    pub plane_max: bool,
}

impl FaceExchange {
    /// Exchange flags on the given axis (0 = col, 1 = row, 2 = plane) and
    /// side (-1 = min, 1 = max).
    pub fn get(&self, axis: usize, side: i64) -> bool {
        match (axis, side < 0) {
            (0, true) => self.col_min,
            (0, false) => self.col_max,
            (1, true) => self.row_min,
            (1, false) => self.row_max,
            (2, true) => self.plane_min,
            _ => self.plane_max,
        }
    }

    pub fn num_faces(&self) -> usize {
        [self.col_min, self.col_max, self.row_min, self.row_max, self.plane_min, self.plane_max]
            .iter()
            .filter(|&&b| b)
            .count()
    }
}

/// A rank's place in the cubic rank grid and the extents of its block.
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Decomposition {
    pub rank: usize,
    pub num_ranks: usize,
    /// Ranks per axis of the rank grid.
    pub tp: usize,
    pub col: usize,
    pub row: usize,
    pub plane: usize,
    /// Elements per axis of the local block.
    pub nx: usize,
    pub num_elem: usize,
    pub num_node: usize,
    pub padded_num_elem: usize,
    pub padded_num_node: usize,
    pub max_edge_size: usize,
    pub max_plane_size: usize,
    pub exchange: FaceExchange,
}

impl Decomposition {
    /// Place `rank` in a cubic grid of `num_ranks` ranks, each owning an
    /// `nx`³ element block.
    ///
    pub fn new(rank: usize, num_ranks: usize, nx: usize) -> Result<Self, Error> {
        let tp = integer_cbrt(num_ranks).ok_or(Error::RankCountNotCube(num_ranks))?;

        if rank >= num_ranks {
            return Err(Error::RankOutOfRange { rank, num_ranks });
        }
        let block = IndexSpace::cube(nx);

        if block.is_empty() {
            return Err(Error::EmptyBlock);
        }
        let col = rank % tp;
        let row = (rank / tp) % tp;
        let plane = rank / (tp * tp);
        let edge_nodes = nx + 1;
        let num_elem = block.len();
        let num_node = IndexSpace::cube(edge_nodes).len();
        let max_edge_size = cache_align(edge_nodes);
        let max_plane_size = cache_align(max_edge_size * max_edge_size);

        let exchange = FaceExchange {
            col_min: col != 0,
            col_max: col != tp - 1,
            row_min: row != 0,
            row_max: row != tp - 1,
            plane_min: plane != 0,
            plane_max: plane != tp - 1,
        };

        Ok(Self {
            rank,
            num_ranks,
            tp,
            col,
            row,
            plane,
            nx,
            num_elem,
            num_node,
            padded_num_elem: cache_align(num_elem),
            padded_num_node: cache_align(num_node),
            max_edge_size,
            max_plane_size,
            exchange,
        })
    }

    pub fn edge_elems(&self) -> usize {
        self.nx
    }

    pub fn edge_nodes(&self) -> usize {
        self.nx + 1
    }

    /// The element index space of the local block.
    pub fn elements(&self) -> IndexSpace {
        IndexSpace::cube(self.nx)
    }

    /// The node index space of the local block.
    pub fn nodes(&self) -> IndexSpace {
        IndexSpace::cube(self.edge_nodes())
    }

    /// Number of ghost element slots: one layer of `nx`² per rank-boundary
    /// face.
    pub fn num_ghost_elem(&self) -> usize {
        self.exchange.num_faces() * self.nx * self.nx
    }

    /// Rank that sits at the given offset in the rank grid, if any.
    pub fn neighbor_rank(&self, offset: (i64, i64, i64)) -> Option<usize> {
        let tp = self.tp as i64;
        let c = self.col as i64 + offset.0;
        let r = self.row as i64 + offset.1;
        let p = self.plane as i64 + offset.2;

        if (0..tp).contains(&c) && (0..tp).contains(&r) && (0..tp).contains(&p) {
            Some(((p * tp + r) * tp + c) as usize)
        } else {
            None
        }
    }
}

fn integer_cbrt(n: usize) -> Option<usize> {
    let tp = (n as f64).cbrt().round() as usize;
    (tp.pow(3) == n && tp > 0).then(|| tp)
}
