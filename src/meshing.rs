use rayon::prelude::*;

use crate::decomposition::Decomposition;

/// Extent of the global cube along each axis.
const DOMAIN_EXTENT: f64 = 1.125;

/// The arrays a rank needs to build its mesh: node coordinates and the
/// element-to-node connectivity, all in local numbering.
///
#[derive(Clone, Debug, Default)]
pub struct MeshInput {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub z: Vec<f64>,
    pub nodelist: Vec<[usize; 8]>,
}

/// Generates a rank's portion of the global block decomposition. This is
/// the host-side collaborator that normally runs before the mesh builder;
/// the builder itself only consumes its output.
///
pub struct BlockGenerator<'a> {
    decomp: &'a Decomposition,
}

impl<'a> BlockGenerator<'a> {
    pub fn new(decomp: &'a Decomposition) -> Self {
        Self { decomp }
    }

    /// Node coordinates span `[0, 1.125]` on each axis of the global cube,
    /// so neighboring ranks agree bit-for-bit on the shared nodes.
    ///
    pub fn generate(&self) -> MeshInput {
        let d = self.decomp;
        let nx = d.nx;
        let mesh_edge_elems = (d.tp * nx) as f64;
        let coord = |block: usize, n: i64| DOMAIN_EXTENT * (block * nx + n as usize) as f64 / mesh_edge_elems;

        let nodes: Vec<_> = d.nodes().iter().collect();
        let x = nodes.par_iter().map(|&(i, _, _)| coord(d.col, i)).collect();
        let y = nodes.par_iter().map(|&(_, j, _)| coord(d.row, j)).collect();
        let z = nodes.par_iter().map(|&(_, _, k)| coord(d.plane, k)).collect();

        let en = d.edge_nodes();
        let nodelist = d
            .elements()
            .iter()
            .map(|(i, j, k)| {
                let n = (k as usize * en + j as usize) * en + i as usize;
                [
                    n,
                    n + 1,
                    n + en + 1,
                    n + en,
                    n + en * en,
                    n + en * en + 1,
                    n + en * en + en + 1,
                    n + en * en + en,
                ]
            })
            .collect();

        MeshInput { x, y, z, nodelist }
    }
}

// ============================================================================
#[cfg(test)]
mod test {

    use super::BlockGenerator;
    use crate::decomposition::Decomposition;

    #[test]
    fn generated_sizes_match_the_block() {
        let d = Decomposition::new(0, 1, 3).unwrap();
        let input = BlockGenerator::new(&d).generate();
        assert_eq!(input.x.len(), 64);
        assert_eq!(input.nodelist.len(), 27);
        assert_eq!(input.nodelist[0], [0, 1, 5, 4, 16, 17, 21, 20]);
        assert_eq!(*input.x.last().unwrap(), 1.125);
    }

    #[test]
    fn neighboring_ranks_share_face_coordinates() {
        let a = Decomposition::new(0, 8, 2).unwrap();
        let b = Decomposition::new(1, 8, 2).unwrap();
        let ga = BlockGenerator::new(&a).generate();
        let gb = BlockGenerator::new(&b).generate();

        // The max-x face of rank 0 is the min-x face of rank 1.
        assert_eq!(ga.x[2], gb.x[0]);
        assert_eq!(ga.x[2], 0.5625);
    }
}
