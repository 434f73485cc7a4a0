//! Local mesh construction: node arrays, element connectivity, face
//! neighbors and boundary conditions for one rank's block.
//!
//! Face neighbors that cross into another rank are not resolved here. They
//! point at ghost element slots appended after the local elements, which the
//! limiter exchange fills each cycle.

use log::debug;
use rayon::prelude::*;

use crate::decomposition::Decomposition;
use crate::error::Error;
use crate::index_space::Axis;
use crate::meshing::MeshInput;

/// Face neighbor value for a face on the physical domain boundary.
pub const NO_NEIGHBOR: usize = usize::MAX;

/// The six faces of a hex element, in the order of the neighbor arrays.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Face {
    XiM,
    XiP,
    EtaM,
    EtaP,
    ZetaM,
    ZetaP,
}

impl Face {
    pub const ALL: [Face; 6] = [Face::XiM, Face::XiP, Face::EtaM, Face::EtaP, Face::ZetaM, Face::ZetaP];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn axis(self) -> Axis {
        match self {
            Face::XiM | Face::XiP => Axis::I,
            Face::EtaM | Face::EtaP => Axis::J,
            Face::ZetaM | Face::ZetaP => Axis::K,
        }
    }

    /// -1 for the low face on the axis, +1 for the high face.
    pub fn side(self) -> i64 {
        match self {
            Face::XiM | Face::EtaM | Face::ZetaM => -1,
            Face::XiP | Face::EtaP | Face::ZetaP => 1,
        }
    }

    fn shift(self) -> u32 {
        3 * self as u32
    }
}

/// Per-element boundary condition bits, three per face: symmetry plane,
/// free surface, and rank boundary (comm).
///
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BoundaryFlags(pub u32);

impl BoundaryFlags {
    pub const XI_M_SYMM: u32 = 0x00001;
    pub const XI_M_FREE: u32 = 0x00002;
    pub const XI_M_COMM: u32 = 0x00004;
    pub const XI_P_SYMM: u32 = 0x00008;
    pub const XI_P_FREE: u32 = 0x00010;
    pub const XI_P_COMM: u32 = 0x00020;
    pub const ETA_M_SYMM: u32 = 0x00040;
    pub const ETA_M_FREE: u32 = 0x00080;
    pub const ETA_M_COMM: u32 = 0x00100;
    pub const ETA_P_SYMM: u32 = 0x00200;
    pub const ETA_P_FREE: u32 = 0x00400;
    pub const ETA_P_COMM: u32 = 0x00800;
    pub const ZETA_M_SYMM: u32 = 0x01000;
    pub const ZETA_M_FREE: u32 = 0x02000;
    pub const ZETA_M_COMM: u32 = 0x04000;
    pub const ZETA_P_SYMM: u32 = 0x08000;
    pub const ZETA_P_FREE: u32 = 0x10000;
    pub const ZETA_P_COMM: u32 = 0x20000;

    pub fn symm(face: Face) -> u32 {
        1 << face.shift()
    }

    pub fn free(face: Face) -> u32 {
        2 << face.shift()
    }

    pub fn comm(face: Face) -> u32 {
        4 << face.shift()
    }

    pub fn contains(&self, bits: u32) -> bool {
        self.0 & bits == bits
    }

    /// Whether the face lies on the physical domain boundary.
    pub fn is_physical(&self, face: Face) -> bool {
        self.0 & (Self::symm(face) | Self::free(face)) != 0
    }

    pub fn is_comm(&self, face: Face) -> bool {
        self.0 & Self::comm(face) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

/// Node and element arrays of a rank's block, sized to the padded counts.
///
#[derive(Clone, Debug)]
pub struct Mesh {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub z: Vec<f64>,
    pub nodelist: Vec<[usize; 8]>,
    /// Face neighbor arrays, one per [`Face`].
    pub neighbors: [Vec<usize>; 6],
    pub elem_bc: Vec<BoundaryFlags>,
    /// Nodes on the x, y, z symmetry planes.
    pub symm: [Vec<usize>; 3],
    /// CSR start offsets into `node_elem_corner_list`, length `num_node + 1`.
    pub node_elem_start: Vec<usize>,
    /// Entries are `element * 8 + corner`.
    pub node_elem_corner_list: Vec<usize>,
}

impl Mesh {
    pub fn neighbor(&self, elem: usize, face: Face) -> usize {
        self.neighbors[face.index()][elem]
    }

    /// The (element, corner) pairs referencing a node.
    pub fn node_corners(&self, node: usize) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.node_elem_corner_list[self.node_elem_start[node]..self.node_elem_start[node + 1]]
            .iter()
            .map(|c| (c / 8, c % 8))
    }
}

/// Builds the local mesh of one rank from pre-generated inputs.
///
pub struct MeshBuilder<'a> {
    decomp: &'a Decomposition,
}

impl<'a> MeshBuilder<'a> {
    pub fn new(decomp: &'a Decomposition) -> Self {
        Self { decomp }
    }

    pub fn build(&self, input: MeshInput) -> Result<Mesh, Error> {
        let d = self.decomp;
        check_len("x", d.num_node, input.x.len())?;
        check_len("y", d.num_node, input.y.len())?;
        check_len("z", d.num_node, input.z.len())?;
        check_len("nodelist", d.num_elem, input.nodelist.len())?;

        if let Some(n) = input.nodelist.iter().flatten().find(|&&n| n >= d.num_node) {
            return Err(Error::NodeOutOfRange { node: *n, num_node: d.num_node });
        }

        let MeshInput { mut x, mut y, mut z, mut nodelist } = input;
        x.resize(d.padded_num_node, 0.0);
        y.resize(d.padded_num_node, 0.0);
        z.resize(d.padded_num_node, 0.0);
        nodelist.resize(d.padded_num_elem, [0; 8]);

        let (neighbors, elem_bc) = self.face_connectivity();
        let symm = self.symmetry_nodes();
        let (node_elem_start, node_elem_corner_list) = reverse_adjacency(&nodelist[..d.num_elem], d.num_node);

        debug!(
            "rank {} built mesh: {} elements, {} nodes, {} ghost slots",
            d.rank,
            d.num_elem,
            d.num_node,
            d.num_ghost_elem()
        );

        Ok(Mesh {
            x,
            y,
            z,
            nodelist,
            neighbors,
            elem_bc,
            symm,
            node_elem_start,
            node_elem_corner_list,
        })
    }

    /// First ghost slot of each rank-boundary face, in the order plane-min,
    /// plane-max, row-min, row-max, col-min, col-max.
    ///
    pub fn ghost_starts(&self) -> [Option<usize>; 6] {
        let d = self.decomp;
        let mut next = d.num_elem;
        let mut starts = [None; 6];

        for face in [Face::ZetaM, Face::ZetaP, Face::EtaM, Face::EtaP, Face::XiM, Face::XiP] {
            if d.exchange.get(axis_number(face.axis()), face.side()) {
                starts[face.index()] = Some(next);
                next += d.nx * d.nx;
            }
        }
        starts
    }

    fn face_connectivity(&self) -> ([Vec<usize>; 6], Vec<BoundaryFlags>) {
        let d = self.decomp;
        let n = d.nx as i64;
        let ghosts = self.ghost_starts();
        let elements = d.elements();

        let (per_elem, mut elem_bc): (Vec<[usize; 6]>, Vec<BoundaryFlags>) = (0..d.num_elem)
            .into_par_iter()
            .map(|e| {
                let (i, j, k) = (e as i64 % n, (e as i64 / n) % n, e as i64 / (n * n));
                let mut neighbor = [NO_NEIGHBOR; 6];
                let mut bc = BoundaryFlags::default();

                for face in Face::ALL {
                    let (ti, tj, tk) = match face.axis() {
                        Axis::I => (i + face.side(), j, k),
                        Axis::J => (i, j + face.side(), k),
                        Axis::K => (i, j, k + face.side()),
                    };
                    if elements.contains((ti, tj, tk)) {
                        neighbor[face.index()] = elements.linear_offset((ti, tj, tk));
                    } else if let Some(start) = ghosts[face.index()] {
                        let offset = match face.axis() {
                            Axis::I => k * n + j,
                            Axis::J => k * n + i,
                            Axis::K => j * n + i,
                        };
                        neighbor[face.index()] = start + offset as usize;
                        bc.0 |= BoundaryFlags::comm(face);
                    } else if face.side() < 0 {
                        bc.0 |= BoundaryFlags::symm(face);
                    } else {
                        bc.0 |= BoundaryFlags::free(face);
                    }
                }
                (neighbor, bc)
            })
            .unzip();

        elem_bc.resize(d.padded_num_elem, BoundaryFlags::default());

        let mut neighbors: [Vec<usize>; 6] = Default::default();
        for (f, list) in neighbors.iter_mut().enumerate() {
            *list = per_elem.iter().map(|nb| nb[f]).collect();
            list.resize(d.padded_num_elem, NO_NEIGHBOR);
        }
        (neighbors, elem_bc)
    }

    fn symmetry_nodes(&self) -> [Vec<usize>; 3] {
        let d = self.decomp;
        let nodes = d.nodes();
        let mut symm: [Vec<usize>; 3] = Default::default();

        for (axis, (list, at_origin)) in symm
            .iter_mut()
            .zip([d.col == 0, d.row == 0, d.plane == 0])
            .enumerate()
        {
            if at_origin {
                let plane = nodes.layer(axis_from_number(axis), false);
                *list = plane.iter().map(|index| nodes.linear_offset(index)).collect();
            }
        }
        symm
    }
}

/// Build the node-to-corner CSR map from element connectivity.
///
pub fn reverse_adjacency(nodelist: &[[usize; 8]], num_node: usize) -> (Vec<usize>, Vec<usize>) {
    let mut count = vec![0; num_node];

    for corners in nodelist {
        for &n in corners {
            count[n] += 1;
        }
    }

    let mut start = Vec::with_capacity(num_node + 1);
    start.push(0);
    for c in &count {
        start.push(start.last().copied().unwrap_or(0) + c);
    }

    let mut cursor = start.clone();
    let mut corner_list = vec![0; start[num_node]];

    for (e, corners) in nodelist.iter().enumerate() {
        for (c, &n) in corners.iter().enumerate() {
            corner_list[cursor[n]] = e * 8 + c;
            cursor[n] += 1;
        }
    }
    (start, corner_list)
}

pub(crate) fn axis_number(axis: Axis) -> usize {
    match axis {
        Axis::I => 0,
        Axis::J => 1,
        Axis::K => 2,
    }
}

pub(crate) fn axis_from_number(axis: usize) -> Axis {
    match axis {
        0 => Axis::I,
        1 => Axis::J,
        _ => Axis::K,
    }
}

fn check_len(what: &'static str, expected: usize, found: usize) -> Result<(), Error> {
    if expected == found {
        Ok(())
    } else {
        Err(Error::InputSize { what, expected, found })
    }
}
