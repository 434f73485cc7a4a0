//! The per-rank aggregate. A `Domain` owns the mesh, the node and element
//! field arrays, the region bookkeeping, the exchange plans and the stream
//! pool, all sized once at setup and never resized. Physics kernels operate
//! on it; this module only builds it and schedules work over its regions.

use std::sync::Arc;

use log::{debug, info};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::comm::{CommBufferPlanner, CommPlan, Phase};
use crate::config::{Parameters, SetupConfig};
use crate::decomposition::Decomposition;
use crate::error::Error;
use crate::mesh::{Mesh, MeshBuilder};
use crate::meshing::{BlockGenerator, MeshInput};
use crate::message::Communicator;
use crate::region::{lpt_assignment, BalanceMode, RegionPartitioner, RegionSets};
use crate::resident::{DeviceFlag, DeviceScalar, HostScalar};
use crate::status::PhysicsFlags;
use crate::stream::{Event, ScopedJob, StreamPool};

/// Initial value of the time step constraints before each reduction.
const CONSTRAINT_INIT: f64 = 1.0e20;

/// Blast energy of the reference 45³ problem, scaled with problem volume.
const EBASE: f64 = 3.948746e+7;




/**
 * Where a field lives on the mesh.
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Centering {
    Node,
    Element,
}




/**
 * Names a scalar field of the domain. Exchange and kernels select fields
 * through this enum rather than through references into the domain.
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldId {
    X,
    Y,
    Z,
    Xd,
    Yd,
    Zd,
    Xdd,
    Ydd,
    Zdd,
    Fx,
    Fy,
    Fz,
    NodalMass,
    E,
    P,
    Q,
    Ql,
    Qq,
    V,
    Volo,
    Delv,
    Vdov,
    Arealg,
    Ss,
    ElemMass,
    DelvXi,
    DelvEta,
    DelvZeta,
    Vnew,
    DelxXi,
    DelxEta,
    DelxZeta,
    Dxx,
    Dyy,
    Dzz,
}




// ============================================================================
impl FieldId {

    pub const ALL: [FieldId; 35] = {
        use FieldId::*;
        [
            X, Y, Z, Xd, Yd, Zd, Xdd, Ydd, Zdd, Fx, Fy, Fz, NodalMass, E, P, Q, Ql, Qq, V, Volo, Delv, Vdov,
            Arealg, Ss, ElemMass, DelvXi, DelvEta, DelvZeta, Vnew, DelxXi, DelxEta, DelxZeta, Dxx, Dyy, Dzz,
        ]
    };

    pub fn centering(self) -> Centering {
        use FieldId::*;

        match self {
            X | Y | Z | Xd | Yd | Zd | Xdd | Ydd | Zdd | Fx | Fy | Fz | NodalMass => Centering::Node,
            _ => Centering::Element,
        }
    }

    pub fn name(self) -> &'static str {
        use FieldId::*;

        match self {
            X => "x",
            Y => "y",
            Z => "z",
            Xd => "xd",
            Yd => "yd",
            Zd => "zd",
            Xdd => "xdd",
            Ydd => "ydd",
            Zdd => "zdd",
            Fx => "fx",
            Fy => "fy",
            Fz => "fz",
            NodalMass => "nodal_mass",
            E => "e",
            P => "p",
            Q => "q",
            Ql => "ql",
            Qq => "qq",
            V => "v",
            Volo => "volo",
            Delv => "delv",
            Vdov => "vdov",
            Arealg => "arealg",
            Ss => "ss",
            ElemMass => "elem_mass",
            DelvXi => "delv_xi",
            DelvEta => "delv_eta",
            DelvZeta => "delv_zeta",
            Vnew => "vnew",
            DelxXi => "delx_xi",
            DelxEta => "delx_eta",
            DelxZeta => "delx_zeta",
            Dxx => "dxx",
            Dyy => "dyy",
            Dzz => "dzz",
        }
    }
}




/**
 * Element-centered scalar fields, each of the padded element length. The
 * limiter gradients are longer: ghost element slots are numbered from the
 * local element count upward, and these arrays hold all of them.
 */
#[derive(Clone, Debug)]
pub struct ElemFields {
    pub e: Vec<f64>,
    pub p: Vec<f64>,
    pub q: Vec<f64>,
    pub ql: Vec<f64>,
    pub qq: Vec<f64>,
    /// Relative volume, starts at 1.
    pub v: Vec<f64>,
    /// Reference volume.
    pub volo: Vec<f64>,
    pub delv: Vec<f64>,
    pub vdov: Vec<f64>,
    /// Characteristic length.
    pub arealg: Vec<f64>,
    /// Sound speed.
    pub ss: Vec<f64>,
    pub elem_mass: Vec<f64>,
    pub delv_xi: Vec<f64>,
    pub delv_eta: Vec<f64>,
    pub delv_zeta: Vec<f64>,
    /// New relative volume, a kernel temporary.
    pub vnew: Vec<f64>,
    /// Coordinate gradients, kernel temporaries.
    pub delx_xi: Vec<f64>,
    pub delx_eta: Vec<f64>,
    pub delx_zeta: Vec<f64>,
    /// Principal strains, kernel temporaries.
    pub dxx: Vec<f64>,
    pub dyy: Vec<f64>,
    pub dzz: Vec<f64>,
}

impl ElemFields {
    fn new(decomp: &Decomposition) -> Self {
        let n = decomp.padded_num_elem;
        let with_ghosts = n + decomp.num_ghost_elem();

        Self {
            e: vec![0.0; n],
            p: vec![0.0; n],
            q: vec![0.0; n],
            ql: vec![0.0; n],
            qq: vec![0.0; n],
            v: vec![1.0; n],
            volo: vec![0.0; n],
            delv: vec![0.0; n],
            vdov: vec![0.0; n],
            arealg: vec![0.0; n],
            ss: vec![0.0; n],
            elem_mass: vec![0.0; n],
            delv_xi: vec![0.0; with_ghosts],
            delv_eta: vec![0.0; with_ghosts],
            delv_zeta: vec![0.0; with_ghosts],
            vnew: vec![0.0; n],
            delx_xi: vec![0.0; n],
            delx_eta: vec![0.0; n],
            delx_zeta: vec![0.0; n],
            dxx: vec![0.0; n],
            dyy: vec![0.0; n],
            dzz: vec![0.0; n],
        }
    }

    /// Every element field at once, for splitting into per-region views.
    fn columns_mut(&mut self) -> Vec<(FieldId, &mut [f64])> {
        use FieldId::*;

        vec![
            (E, &mut self.e[..]),
            (P, &mut self.p[..]),
            (Q, &mut self.q[..]),
            (Ql, &mut self.ql[..]),
            (Qq, &mut self.qq[..]),
            (V, &mut self.v[..]),
            (Volo, &mut self.volo[..]),
            (Delv, &mut self.delv[..]),
            (Vdov, &mut self.vdov[..]),
            (Arealg, &mut self.arealg[..]),
            (Ss, &mut self.ss[..]),
            (ElemMass, &mut self.elem_mass[..]),
            (DelvXi, &mut self.delv_xi[..]),
            (DelvEta, &mut self.delv_eta[..]),
            (DelvZeta, &mut self.delv_zeta[..]),
            (Vnew, &mut self.vnew[..]),
            (DelxXi, &mut self.delx_xi[..]),
            (DelxEta, &mut self.delx_eta[..]),
            (DelxZeta, &mut self.delx_zeta[..]),
            (Dxx, &mut self.dxx[..]),
            (Dyy, &mut self.dyy[..]),
            (Dzz, &mut self.dzz[..]),
        ]
    }
}




/**
 * Node-centered fields other than the coordinates, which live in the mesh.
 */
#[derive(Clone, Debug)]
pub struct NodeFields {
    pub xd: Vec<f64>,
    pub yd: Vec<f64>,
    pub zd: Vec<f64>,
    pub xdd: Vec<f64>,
    pub ydd: Vec<f64>,
    pub zdd: Vec<f64>,
    pub fx: Vec<f64>,
    pub fy: Vec<f64>,
    pub fz: Vec<f64>,
    pub nodal_mass: Vec<f64>,
}

impl NodeFields {
    fn new(decomp: &Decomposition) -> Self {
        let n = decomp.padded_num_node;

        Self {
            xd: vec![0.0; n],
            yd: vec![0.0; n],
            zd: vec![0.0; n],
            xdd: vec![0.0; n],
            ydd: vec![0.0; n],
            zdd: vec![0.0; n],
            fx: vec![0.0; n],
            fy: vec![0.0; n],
            fz: vec![0.0; n],
            nodal_mass: vec![0.0; n],
        }
    }
}




/**
 * The time step limits one region reports to the reduction.
 */
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RegionConstraint {
    pub dtcourant: f64,
    pub dthydro: f64,
}




/**
 * Device-side physics violation flags, cloned into kernels that detect bad
 * element state.
 */
#[derive(Clone, Debug, Default)]
pub struct DeviceFlags {
    pub bad_volume: DeviceFlag,
    pub bad_q: DeviceFlag,
}




/**
 * What a region kernel sees of the domain. Element field values are
 * addressed by position `k` in `elements`; only this region's elements are
 * reachable, so kernels on different regions can write concurrently.
 */
pub struct RegionView<'a> {
    pub region: usize,
    pub cost: u32,
    pub elements: &'a [usize],
    pub params: &'a Parameters,
    pub mesh: &'a Mesh,
    pub node: &'a NodeFields,
    pub flags: &'a DeviceFlags,
    columns: Vec<(FieldId, Vec<&'a mut f64>)>,
}




// ============================================================================
impl<'a> RegionView<'a> {

    /// Panics if `id` is not element-centered.
    fn column(&self, id: FieldId) -> usize {
        assert_eq!(id.centering(), Centering::Element, "{} is not an element field", id.name());
        self.columns.iter().position(|(f, _)| *f == id).unwrap_or(0)
    }

    /**
     * Value of element field `id` at the region's `k`-th element.
     */
    pub fn get(&self, id: FieldId, k: usize) -> f64 {
        *self.columns[self.column(id)].1[k]
    }

    /**
     * Set element field `id` at the region's `k`-th element.
     */
    pub fn set(&mut self, id: FieldId, k: usize, value: f64) {
        let c = self.column(id);
        *self.columns[c].1[k] = value;
    }
}




/**
 * Everything one rank owns.
 */
pub struct Domain {
    pub decomp: Decomposition,
    pub params: Parameters,
    pub mesh: Mesh,
    pub elem: ElemFields,
    pub node: NodeFields,
    pub regions: RegionSets,
    /// Current simulation time, host side.
    pub time: f64,
    /// Current time increment, host side.
    pub deltatime: f64,
    /// Local element at the corner of the global octant. The blast energy
    /// is deposited there on the rank at the origin.
    pub octant_corner: usize,
    region_lists: Vec<Arc<[usize]>>,
    stream_of: Vec<usize>,
    pub(crate) comm_plan: Arc<CommPlan>,
    pub(crate) send_buffers: [Vec<f64>; 3],
    streams: StreamPool,
    dtcourant: DeviceScalar,
    dthydro: DeviceScalar,
    flags: DeviceFlags,
    host_dtcourant: HostScalar<f64>,
    host_dthydro: HostScalar<f64>,
    host_bad_volume: HostScalar<Option<usize>>,
    host_bad_q: HostScalar<Option<usize>>,
    constraints_done: Option<Event>,
}




/**
 * Check an integer setup argument against the decomposition.
 */
fn expect_arg(what: &'static str, expected: usize, found: usize) -> Result<(), Error> {
    if expected == found {
        Ok(())
    } else {
        Err(Error::InputSize { what, expected, found })
    }
}




/**
 * Build the local mesh from pre-generated coordinates and connectivity. The
 * integer arguments are the sizes the caller computed for this rank; they
 * must agree with the decomposition.
 */
pub fn build_mesh(
    decomp: &Decomposition,
    nx: usize,
    edge_nodes: usize,
    edge_elems: usize,
    dom_nodes: usize,
    padded_dom_elems: usize,
    input: MeshInput,
) -> Result<Mesh, Error> {
    expect_arg("nx", decomp.nx, nx)?;
    expect_arg("edge_nodes", decomp.edge_nodes(), edge_nodes)?;
    expect_arg("edge_elems", decomp.edge_elems(), edge_elems)?;
    expect_arg("dom_nodes", decomp.num_node, dom_nodes)?;
    expect_arg("padded_dom_elems", decomp.padded_num_elem, padded_dom_elems)?;
    MeshBuilder::new(decomp).build(input)
}




/**
 * Size and tag the buffers of the three exchange phases.
 */
pub fn setup_comm_buffers(decomp: &Decomposition, edge_nodes: usize) -> Result<CommPlan, Error> {
    expect_arg("edge_nodes", decomp.edge_nodes(), edge_nodes)?;
    Ok(CommBufferPlanner::new(decomp).plan(edge_nodes))
}




/**
 * Partition the local elements into regions. Each rank draws from its own
 * seed, derived from the configured one, so material patches differ between
 * ranks but not between runs.
 */
pub fn create_region_index_sets(decomp: &Decomposition, seed: u64, region_count: usize, balance: u32) -> RegionSets {
    RegionPartitioner::new(decomp.num_elem, seed ^ decomp.rank as u64).partition(region_count, BalanceMode::from(balance))
}




// ============================================================================
impl Domain {

    /**
     * Set up a rank from pre-generated mesh input: mesh build, region
     * partition, comm buffer plan, then the stream pool.
     */
    pub fn setup(config: &SetupConfig, rank: usize, input: MeshInput) -> Result<Self, Error> {
        let decomp = Decomposition::new(rank, config.num_ranks, config.nx)?;

        let mesh = build_mesh(
            &decomp,
            decomp.nx,
            decomp.edge_nodes(),
            decomp.edge_elems(),
            decomp.num_node,
            decomp.padded_num_elem,
            input,
        )?;
        let regions = create_region_index_sets(&decomp, config.seed, config.num_regions, config.balance);
        let comm_plan = setup_comm_buffers(&decomp, decomp.edge_nodes())?;

        let num_streams = config.max_streams.min(regions.num_regions());
        let streams = StreamPool::new(num_streams)?;
        let stream_of = lpt_assignment(&regions.sorted, &regions.work(), num_streams);
        let region_lists = (0..regions.num_regions()).map(|r| Arc::from(regions.region(r))).collect();

        let send_buffers = [
            vec![0.0; comm_plan.sbn.buffer_size],
            vec![0.0; comm_plan.sync_pos_vel.buffer_size],
            vec![0.0; comm_plan.monoq.buffer_size],
        ];

        let mut domain = Self {
            elem: ElemFields::new(&decomp),
            node: NodeFields::new(&decomp),
            decomp,
            params: config.parameters.clone(),
            mesh,
            regions,
            time: 0.0,
            deltatime: 0.0,
            octant_corner: 0,
            region_lists,
            stream_of,
            comm_plan: Arc::new(comm_plan),
            send_buffers,
            streams,
            dtcourant: DeviceScalar::new(CONSTRAINT_INIT),
            dthydro: DeviceScalar::new(CONSTRAINT_INIT),
            flags: DeviceFlags::default(),
            host_dtcourant: HostScalar::new(CONSTRAINT_INIT),
            host_dthydro: HostScalar::new(CONSTRAINT_INIT),
            host_bad_volume: HostScalar::new(None),
            host_bad_q: HostScalar::new(None),
            constraints_done: None,
        };
        domain.initialize_mass();
        domain.initialize_energy();

        info!(
            "rank {}/{}: {} elements, {} nodes, {} regions on {} streams",
            rank,
            domain.decomp.num_ranks,
            domain.decomp.num_elem,
            domain.decomp.num_node,
            domain.regions.num_regions(),
            num_streams
        );
        Ok(domain)
    }

    /**
     * Set up a rank with mesh input from the default block generator.
     */
    pub fn new(config: &SetupConfig, rank: usize) -> Result<Self, Error> {
        let decomp = Decomposition::new(rank, config.num_ranks, config.nx)?;
        let input = BlockGenerator::new(&decomp).generate();
        Self::setup(config, rank, input)
    }

    /**
     * Reference volumes and element masses from the initial coordinates, and
     * nodal masses as an eighth of each adjacent element's mass. Nodes on a
     * rank boundary only hold the local share until the first boundary sum.
     */
    fn initialize_mass(&mut self) {
        let num_elem = self.decomp.num_elem;
        let (x, y, z) = (&self.mesh.x, &self.mesh.y, &self.mesh.z);

        let volumes: Vec<f64> = self.mesh.nodelist[..num_elem]
            .par_iter()
            .map(|corners| hex_volume(corners, x, y, z))
            .collect();

        self.elem.volo[..num_elem].copy_from_slice(&volumes);
        self.elem.elem_mass[..num_elem].copy_from_slice(&volumes);

        for n in 0..self.decomp.num_node {
            self.node.nodal_mass[n] = self.mesh.node_corners(n).map(|(e, _)| volumes[e] / 8.0).sum();
        }
        debug!("rank {} total local volume {:.6e}", self.decomp.rank, volumes.iter().sum::<f64>());
    }

    /**
     * Deposit the blast energy, scaled to the global problem size, in the
     * octant corner element of the rank at the origin. Every rank starts
     * from the analytic CFL step of that energy in a corner element.
     */
    fn initialize_energy(&mut self) {
        let d = &self.decomp;
        let scale = (d.nx * d.tp) as f64 / 45.0;
        let einit = EBASE * scale * scale * scale;

        if d.col + d.row + d.plane == 0 {
            self.elem.e[self.octant_corner] = einit;
        }
        self.deltatime = 0.5 * self.elem.volo[self.octant_corner].cbrt() / (2.0 * einit).sqrt();
        self.time = 0.0;
    }

    pub fn comm_plan(&self) -> &CommPlan {
        &self.comm_plan
    }

    pub fn num_streams(&self) -> usize {
        self.streams.num_streams()
    }

    /// Stream region `r` runs on.
    pub fn stream_of(&self, r: usize) -> usize {
        self.stream_of[r]
    }

    pub fn device_flags(&self) -> DeviceFlags {
        self.flags.clone()
    }

    pub fn field(&self, id: FieldId) -> &[f64] {
        use FieldId::*;

        match id {
            X => &self.mesh.x,
            Y => &self.mesh.y,
            Z => &self.mesh.z,
            Xd => &self.node.xd,
            Yd => &self.node.yd,
            Zd => &self.node.zd,
            Xdd => &self.node.xdd,
            Ydd => &self.node.ydd,
            Zdd => &self.node.zdd,
            Fx => &self.node.fx,
            Fy => &self.node.fy,
            Fz => &self.node.fz,
            NodalMass => &self.node.nodal_mass,
            E => &self.elem.e,
            P => &self.elem.p,
            Q => &self.elem.q,
            Ql => &self.elem.ql,
            Qq => &self.elem.qq,
            V => &self.elem.v,
            Volo => &self.elem.volo,
            Delv => &self.elem.delv,
            Vdov => &self.elem.vdov,
            Arealg => &self.elem.arealg,
            Ss => &self.elem.ss,
            ElemMass => &self.elem.elem_mass,
            DelvXi => &self.elem.delv_xi,
            DelvEta => &self.elem.delv_eta,
            DelvZeta => &self.elem.delv_zeta,
            Vnew => &self.elem.vnew,
            DelxXi => &self.elem.delx_xi,
            DelxEta => &self.elem.delx_eta,
            DelxZeta => &self.elem.delx_zeta,
            Dxx => &self.elem.dxx,
            Dyy => &self.elem.dyy,
            Dzz => &self.elem.dzz,
        }
    }

    pub fn field_mut(&mut self, id: FieldId) -> &mut [f64] {
        use FieldId::*;

        match id {
            X => &mut self.mesh.x,
            Y => &mut self.mesh.y,
            Z => &mut self.mesh.z,
            Xd => &mut self.node.xd,
            Yd => &mut self.node.yd,
            Zd => &mut self.node.zd,
            Xdd => &mut self.node.xdd,
            Ydd => &mut self.node.ydd,
            Zdd => &mut self.node.zdd,
            Fx => &mut self.node.fx,
            Fy => &mut self.node.fy,
            Fz => &mut self.node.fz,
            NodalMass => &mut self.node.nodal_mass,
            E => &mut self.elem.e,
            P => &mut self.elem.p,
            Q => &mut self.elem.q,
            Ql => &mut self.elem.ql,
            Qq => &mut self.elem.qq,
            V => &mut self.elem.v,
            Volo => &mut self.elem.volo,
            Delv => &mut self.elem.delv,
            Vdov => &mut self.elem.vdov,
            Arealg => &mut self.elem.arealg,
            Ss => &mut self.elem.ss,
            ElemMass => &mut self.elem.elem_mass,
            DelvXi => &mut self.elem.delv_xi,
            DelvEta => &mut self.elem.delv_eta,
            DelvZeta => &mut self.elem.delv_zeta,
            Vnew => &mut self.elem.vnew,
            DelxXi => &mut self.elem.delx_xi,
            DelxEta => &mut self.elem.delx_eta,
            DelxZeta => &mut self.elem.delx_zeta,
            Dxx => &mut self.elem.dxx,
            Dyy => &mut self.elem.dyy,
            Dzz => &mut self.elem.dzz,
        }
    }

    /**
     * Run `kernel` once per region, in scheduling order, each on the stream
     * the region was assigned at setup. The kernel receives the region index
     * and its element list. The returned event completes once every region
     * has run. Kernels that need the field arrays go through `run_regions`.
     */
    pub fn dispatch_regions<F>(&self, kernel: F) -> Event
    where
        F: Fn(usize, &[usize]) + Send + Sync + 'static,
    {
        let kernel = Arc::new(kernel);

        for &r in &self.regions.sorted {
            let kernel = Arc::clone(&kernel);
            let elements = Arc::clone(&self.region_lists[r]);
            self.streams.submit(self.stream_of[r], move || (*kernel)(r, &elements[..]));
        }
        self.join_region_streams()
    }

    /**
     * Run `kernel` once per region on the region's stream, with a view of
     * the domain arrays: element fields for the region's own elements,
     * writable, and everything else read-only. Regions own disjoint element
     * sets, so the views never alias. Returns once every region has run.
     */
    pub fn run_regions<F>(&mut self, kernel: F) -> Result<(), Error>
    where
        F: Fn(&mut RegionView<'_>) + Sync,
    {
        let num_elem = self.decomp.num_elem;
        let Self {
            ref params,
            ref mesh,
            ref mut elem,
            ref node,
            ref regions,
            ref stream_of,
            ref streams,
            ref flags,
            ..
        } = *self;

        let columns = elem.columns_mut();
        let mut views: Vec<Option<RegionView<'_>>> = (0..regions.num_regions())
            .map(|r| {
                Some(RegionView {
                    region: r,
                    cost: regions.cost[r],
                    elements: regions.region(r),
                    params,
                    mesh,
                    node,
                    flags,
                    columns: columns
                        .iter()
                        .map(|(id, _)| (*id, Vec::with_capacity(regions.elem_count[r])))
                        .collect(),
                })
            })
            .collect();

        for (c, (_, values)) in columns.into_iter().enumerate() {
            for (e, value) in values[..num_elem].iter_mut().enumerate() {
                if let Some(view) = &mut views[regions.region_of[e]] {
                    view.columns[c].1.push(value);
                }
            }
        }

        let kernel = &kernel;
        let jobs: Vec<(usize, ScopedJob<'_>)> = regions
            .sorted
            .iter()
            .filter_map(|&r| views[r].take().map(|view| (r, view)))
            .map(|(r, mut view)| {
                let job: ScopedJob<'_> = Box::new(move || kernel(&mut view));
                (stream_of[r], job)
            })
            .collect();

        streams.run_scoped(jobs)
    }

    /**
     * Like `reduce_time_constraints`, with kernels that read the domain
     * arrays through a region view. Returns once the reduction is done;
     * `read_time_constraints` then does not block.
     */
    pub fn reduce_time_constraints_scoped<F>(&mut self, kernel: F) -> Result<(), Error>
    where
        F: Fn(&RegionView<'_>) -> RegionConstraint + Sync,
    {
        if let Some(previous) = self.constraints_done.take() {
            previous.try_wait()?;
        }
        self.dtcourant.reset(CONSTRAINT_INIT);
        self.dthydro.reset(CONSTRAINT_INIT);

        let dtcourant = self.dtcourant.clone();
        let dthydro = self.dthydro.clone();

        self.run_regions(|view| {
            let c = kernel(view);
            dtcourant.fetch_min(c.dtcourant);
            dthydro.fetch_min(c.dthydro);
        })?;
        self.constraints_done = Some(Event::completed());
        Ok(())
    }

    /**
     * Reset the time step constraints, then min-reduce the value `kernel`
     * computes for each region into them. The host may read the result
     * once the returned event (also kept on the domain) completes.
     */
    pub fn reduce_time_constraints<F>(&mut self, kernel: F) -> Event
    where
        F: Fn(usize, &[usize]) -> RegionConstraint + Send + Sync + 'static,
    {
        if let Some(previous) = self.constraints_done.take() {
            previous.wait();
        }
        self.dtcourant.reset(CONSTRAINT_INIT);
        self.dthydro.reset(CONSTRAINT_INIT);

        let kernel = Arc::new(kernel);

        for &r in &self.regions.sorted {
            let kernel = Arc::clone(&kernel);
            let elements = Arc::clone(&self.region_lists[r]);
            let dtcourant = self.dtcourant.clone();
            let dthydro = self.dthydro.clone();

            self.streams.submit(self.stream_of[r], move || {
                let c = (*kernel)(r, &elements[..]);
                dtcourant.fetch_min(c.dtcourant);
                dthydro.fetch_min(c.dthydro);
            });
        }
        let done = self.join_region_streams();
        self.constraints_done = Some(done.clone());
        done
    }

    /**
     * Copy the reduced `(dtcourant, dthydro)` to the host after waiting on
     * the reduction event. Without a prior reduction the initial values are
     * returned.
     */
    pub fn read_time_constraints(&mut self) -> (f64, f64) {
        let done = self.constraints_done.clone().unwrap_or_else(Event::completed);
        self.host_dtcourant.copy_to_host(&self.dtcourant, &done);
        self.host_dthydro.copy_to_host(&self.dthydro, &done);
        (self.host_dtcourant.get(), self.host_dthydro.get())
    }

    /**
     * Local constraints min-reduced over all ranks.
     */
    pub fn reduce_global_time_constraints<C: Communicator>(&mut self, comm: &C) -> Result<(f64, f64), Error> {
        let (dtcourant, dthydro) = self.read_time_constraints();
        Ok((comm.all_reduce_min(dtcourant)?, comm.all_reduce_min(dthydro)?))
    }

    /**
     * Copy the physics violation flags to the host once `after` completes.
     */
    pub fn physics_flags(&mut self, after: &Event) -> PhysicsFlags {
        self.host_bad_volume.copy_to_host(&self.flags.bad_volume, after);
        self.host_bad_q.copy_to_host(&self.flags.bad_q, after);

        PhysicsFlags {
            bad_volume: self.host_bad_volume.get(),
            bad_q: self.host_bad_q.get(),
        }
    }

    pub fn clear_physics_flags(&self) {
        self.flags.bad_volume.clear();
        self.flags.bad_q.clear();
    }

    /// Block until every stream is idle.
    pub fn synchronize(&self) {
        self.streams.synchronize()
    }

    fn join_region_streams(&self) -> Event {
        let mut used = self.stream_of.clone();
        used.sort_unstable();
        used.dedup();
        self.streams.join(&used)
    }
}

pub(crate) fn phase_slot(phase: Phase) -> usize {
    match phase {
        Phase::Sbn => 0,
        Phase::SyncPosVel => 1,
        Phase::MonoQ => 2,
    }
}

/// Volume of a hex as six tetrahedra around the 0-6 diagonal.
///
fn hex_volume(corners: &[usize; 8], x: &[f64], y: &[f64], z: &[f64]) -> f64 {
    const TETS: [[usize; 3]; 6] = [[1, 2, 6], [2, 3, 6], [3, 7, 6], [7, 4, 6], [4, 5, 6], [5, 1, 6]];

    let p = |c: usize| [x[corners[c]], y[corners[c]], z[corners[c]]];
    let o = p(0);
    let d = |c: usize| {
        let q = p(c);
        [q[0] - o[0], q[1] - o[1], q[2] - o[2]]
    };

    TETS.iter()
        .map(|&[a, b, c]| {
            let (a, b, c) = (d(a), d(b), d(c));
            a[0] * (b[1] * c[2] - b[2] * c[1]) + a[1] * (b[2] * c[0] - b[0] * c[2]) + a[2] * (b[0] * c[1] - b[1] * c[0])
        })
        .sum::<f64>()
        / 6.0
}




// ============================================================================
#[cfg(test)]
mod test {

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::{
        build_mesh, create_region_index_sets, hex_volume, setup_comm_buffers, Centering, Domain, ElemFields, FieldId,
        RegionConstraint, EBASE,
    };
    use crate::config::SetupConfig;
    use crate::decomposition::Decomposition;
    use crate::meshing::BlockGenerator;
    use crate::status::ExitCondition;

    fn config(nx: usize, num_regions: usize, balance: u32) -> SetupConfig {
        SetupConfig {
            nx,
            num_regions,
            balance,
            max_streams: 4,
            ..SetupConfig::default()
        }
    }

    #[test]
    fn unit_cube_volume_is_one() {
        let x = [0.0, 1.0, 1.0, 0.0, 0.0, 1.0, 1.0, 0.0];
        let y = [0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 1.0, 1.0];
        let z = [0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0];
        let v = hex_volume(&[0, 1, 2, 3, 4, 5, 6, 7], &x, &y, &z);
        assert!((v - 1.0).abs() < 1e-14);
    }

    #[test]
    fn setup_arguments_must_match_the_decomposition() {
        let d = Decomposition::new(0, 1, 3).unwrap();
        let input = BlockGenerator::new(&d).generate();
        assert!(build_mesh(&d, 3, 4, 3, 64, 32, input.clone()).is_ok());
        assert!(build_mesh(&d, 3, 5, 3, 64, 32, input.clone()).is_err());
        assert!(build_mesh(&d, 3, 4, 3, 64, 27, input).is_err());
        assert!(setup_comm_buffers(&d, 4).is_ok());
        assert!(setup_comm_buffers(&d, 3).is_err());
    }

    #[test]
    fn ranks_draw_different_material_patches() {
        let a = Decomposition::new(0, 8, 10).unwrap();
        let b = Decomposition::new(1, 8, 10).unwrap();
        let sa = create_region_index_sets(&a, 5, 4, 1);
        let sb = create_region_index_sets(&b, 5, 4, 1);
        assert_eq!(sa.elem_count, sb.elem_count);
        assert_ne!(sa.region_of, sb.region_of);
    }

    #[test]
    fn arrays_are_sized_from_the_decomposition() {
        let domain = Domain::new(&config(4, 3, 0), 0).unwrap();
        assert_eq!(domain.field(FieldId::X).len(), domain.decomp.padded_num_node);
        assert_eq!(domain.field(FieldId::Fx).len(), domain.decomp.padded_num_node);
        assert_eq!(domain.field(FieldId::P).len(), domain.decomp.padded_num_elem);
        assert_eq!(domain.field(FieldId::DelvXi).len(), domain.decomp.padded_num_elem);
        assert!(domain.elem.v.iter().all(|&v| v == 1.0));
        assert_eq!(domain.num_streams(), 3);
    }

    #[test]
    fn masses_add_up_to_the_domain_volume() {
        let domain = Domain::new(&config(4, 1, 0), 0).unwrap();
        let volume = 1.125f64.powi(3);
        let elem: f64 = domain.elem.elem_mass.iter().sum();
        let node: f64 = domain.node.nodal_mass.iter().sum();
        assert!((elem - volume).abs() < 1e-12);
        assert!((node - volume).abs() < 1e-12);
        assert!((domain.elem.volo[0] - (1.125f64 / 4.0).powi(3)).abs() < 1e-14);
    }

    #[test]
    fn field_mut_writes_through_to_the_named_array() {
        let mut domain = Domain::new(&config(2, 1, 0), 0).unwrap();
        domain.field_mut(FieldId::Ss)[3] = 7.0;
        domain.field_mut(FieldId::Zdd)[5] = -2.0;
        assert_eq!(domain.elem.ss[3], 7.0);
        assert_eq!(domain.node.zdd[5], -2.0);
        assert_eq!(FieldId::DelvZeta.name(), "delv_zeta");
    }

    #[test]
    fn regions_run_once_on_their_assigned_stream() {
        let domain = Domain::new(&config(6, 5, 1), 0).unwrap();
        let seen = Arc::new(Mutex::new(vec![0usize; domain.decomp.num_elem]));
        let calls = Arc::new(AtomicUsize::new(0));

        let (s, c) = (Arc::clone(&seen), Arc::clone(&calls));
        domain
            .dispatch_regions(move |_, elements| {
                c.fetch_add(1, Ordering::SeqCst);
                let mut seen = s.lock().unwrap();
                for &e in elements {
                    seen[e] += 1;
                }
            })
            .wait();

        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert!(seen.lock().unwrap().iter().all(|&n| n == 1));
        assert!((0..5).all(|r| domain.stream_of(r) < domain.num_streams()));
    }

    #[test]
    fn time_constraints_are_the_minimum_over_regions() {
        let mut domain = Domain::new(&config(4, 4, 1), 0).unwrap();
        assert_eq!(domain.read_time_constraints(), (1.0e20, 1.0e20));

        domain.reduce_time_constraints(|r, elements| RegionConstraint {
            dtcourant: 1.0 + r as f64,
            dthydro: 100.0 / elements.len().max(1) as f64,
        });
        let largest = *domain.regions.elem_count.iter().max().unwrap();
        let (dtcourant, dthydro) = domain.read_time_constraints();
        assert_eq!(dtcourant, 1.0);
        assert_eq!(dthydro, 100.0 / largest as f64);
    }

    #[test]
    fn physics_flags_map_to_exit_conditions() {
        let mut domain = Domain::new(&config(3, 2, 0), 0).unwrap();
        let flags = domain.device_flags();

        let done = domain.dispatch_regions(move |_, elements| {
            if let Some(&e) = elements.first() {
                flags.bad_q.raise(e);
            }
        });
        let host = domain.physics_flags(&done);
        assert_eq!(host.bad_q, Some(0));
        assert_eq!(host.exit_condition(), Some(ExitCondition::QStopError));

        domain.clear_physics_flags();
        let done = domain.dispatch_regions(|_, _| {});
        assert_eq!(domain.physics_flags(&done).exit_condition(), None);
    }

    #[test]
    fn every_element_field_splits_into_region_views() {
        let d = Decomposition::new(0, 1, 2).unwrap();
        let mut elem = ElemFields::new(&d);
        let ids: Vec<_> = elem.columns_mut().into_iter().map(|(id, _)| id).collect();
        let element_ids: Vec<_> = FieldId::ALL.iter().copied().filter(|id| id.centering() == Centering::Element).collect();
        assert_eq!(ids, element_ids);
    }

    #[test]
    fn region_kernels_write_their_own_elements() {
        let mut domain = Domain::new(&config(4, 4, 1), 0).unwrap();

        domain
            .run_regions(|view| {
                for k in 0..view.elements.len() {
                    let e = view.elements[k];
                    let volo = view.get(FieldId::Volo, k);
                    view.set(FieldId::P, k, view.region as f64 + e as f64 * 1e-3);
                    view.set(FieldId::Vnew, k, 2.0 * volo);
                }
            })
            .unwrap();

        for e in 0..domain.decomp.num_elem {
            assert_eq!(domain.elem.p[e], domain.regions.region_of[e] as f64 + e as f64 * 1e-3);
            assert_eq!(domain.elem.vnew[e], 2.0 * domain.elem.volo[e]);
        }
    }

    #[test]
    fn scoped_reduction_reads_the_element_fields() {
        let mut domain = Domain::new(&config(4, 3, 1), 0).unwrap();
        domain.elem.volo[17] = 1.0e-3;

        domain
            .reduce_time_constraints_scoped(|view| RegionConstraint {
                dtcourant: (0..view.elements.len()).map(|k| view.get(FieldId::Volo, k)).fold(f64::INFINITY, f64::min),
                dthydro: view.cost as f64 * view.params.dvovmax,
            })
            .unwrap();

        assert_eq!(domain.read_time_constraints(), (1.0e-3, 0.1));
    }

    #[test]
    fn a_panicking_region_kernel_is_reported() {
        let mut domain = Domain::new(&config(3, 2, 0), 0).unwrap();
        let result = domain.run_regions(|view| {
            if view.region == 1 {
                panic!("bad region");
            }
        });
        assert!(result.is_err());
    }

    #[test]
    fn blast_energy_sits_in_the_origin_corner() {
        let domain = Domain::new(&config(4, 1, 0), 0).unwrap();
        let einit = EBASE * (4.0f64 / 45.0).powi(3);

        assert_eq!(domain.octant_corner, 0);
        assert!((domain.elem.e[0] - einit).abs() < 1e-6);
        assert!(domain.elem.e[1..].iter().all(|&e| e == 0.0));
        assert_eq!(domain.time, 0.0);
        assert!(domain.deltatime > 0.0);

        let config = SetupConfig { num_ranks: 8, ..config(2, 1, 0) };
        let away = Domain::new(&config, 5).unwrap();
        assert!(away.elem.e.iter().all(|&e| e == 0.0));
        assert_eq!(away.deltatime, Domain::new(&config, 0).unwrap().deltatime);
    }

    #[test]
    fn zero_streams_is_a_setup_error() {
        let mut c = config(2, 1, 0);
        c.max_streams = 0;
        assert!(Domain::new(&c, 0).is_err());
    }
}
