//! Communication buffer planning for the three cross-rank exchange phases.
//!
//! Each rank talks to at most 26 neighbors: six across faces, twelve across
//! edges and eight across corners. A plan records, for every neighbor that
//! exists, the buffer capacity the phase needs, the padded stride of that
//! buffer in a flat per-phase allocation, and the local indices packed on
//! send and unpacked on receive.

use log::debug;

use crate::decomposition::{Decomposition, ALIGN_REALS};
use crate::error::Error;
use crate::index_space::Axis;
use crate::mesh::{Face, MeshBuilder};

/// Tag namespace of the nodal boundary accumulation (sum) phase.
pub const MSG_COMM_SBN: u32 = 1024;

/// Tag namespace of the position / velocity synchronization phase.
pub const MSG_SYNC_POS_VEL: u32 = 2048;

/// Tag namespace of the monotonic limiter boundary phase.
pub const MSG_MONOQ: u32 = 3072;

/// Most scalar fields packed into one message. This is a protocol bound.
pub const MAX_FIELDS_PER_MESSAGE: usize = 6;

/// Tag slots reserved per direction within a phase namespace.
const TAGS_PER_DIRECTION: u32 = 8;

/// Most fields one exchange can move to one neighbor.
pub const MAX_FIELDS_PER_EXCHANGE: usize = MAX_FIELDS_PER_MESSAGE * TAGS_PER_DIRECTION as usize;

/// The three exchange phases.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    Sbn,
    SyncPosVel,
    MonoQ,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::Sbn, Phase::SyncPosVel, Phase::MonoQ];

    pub fn tag_base(self) -> u32 {
        match self {
            Phase::Sbn => MSG_COMM_SBN,
            Phase::SyncPosVel => MSG_SYNC_POS_VEL,
            Phase::MonoQ => MSG_MONOQ,
        }
    }
}

/// What a neighbor shares with this rank.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NeighborClass {
    Face,
    Edge,
    Corner,
}

/// One of the 26 offsets to a neighboring block in the rank grid.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Direction {
    pub offset: (i64, i64, i64),
}

impl Direction {
    pub fn new(offset: (i64, i64, i64)) -> Self {
        assert!(offset != (0, 0, 0), "the zero offset is not a direction");
        Self { offset }
    }

    /// All 26 directions, in index order.
    pub fn all() -> impl Iterator<Item = Direction> {
        (-1..=1).flat_map(|c| (-1..=1).flat_map(move |b| (-1..=1).map(move |a| (a, b, c))))
            .filter(|&o| o != (0, 0, 0))
            .map(Direction::new)
    }

    /// Position in `0..26`.
    pub fn index(&self) -> usize {
        let (a, b, c) = self.offset;
        let full = ((c + 1) * 9 + (b + 1) * 3 + (a + 1)) as usize;
        if full > 13 { full - 1 } else { full }
    }

    pub fn opposite(&self) -> Self {
        let (a, b, c) = self.offset;
        Self::new((-a, -b, -c))
    }

    pub fn class(&self) -> NeighborClass {
        let (a, b, c) = self.offset;
        match (a != 0) as u32 + (b != 0) as u32 + (c != 0) as u32 {
            1 => NeighborClass::Face,
            2 => NeighborClass::Edge,
            _ => NeighborClass::Corner,
        }
    }

    /// The block face this direction crosses, if it is a face direction.
    pub fn face(&self) -> Option<Face> {
        match self.offset {
            (-1, 0, 0) => Some(Face::XiM),
            (1, 0, 0) => Some(Face::XiP),
            (0, -1, 0) => Some(Face::EtaM),
            (0, 1, 0) => Some(Face::EtaP),
            (0, 0, -1) => Some(Face::ZetaM),
            (0, 0, 1) => Some(Face::ZetaP),
            _ => None,
        }
    }

    fn components(&self) -> [(Axis, i64); 3] {
        [(Axis::I, self.offset.0), (Axis::J, self.offset.1), (Axis::K, self.offset.2)]
    }

    fn all_nonzero_are(&self, sign: i64) -> bool {
        self.components().iter().all(|&(_, s)| s == 0 || s == sign)
    }
}

/// One neighbor's slot in a phase plan.
///
#[derive(Clone, Debug)]
pub struct Channel {
    pub direction: Direction,
    pub rank: usize,
    /// Values per field this neighbor can need.
    pub capacity: usize,
    /// Padded values per field in the flat phase buffer.
    pub stride: usize,
    /// Offset of this channel in the flat phase buffer.
    pub offset: usize,
    pub send: bool,
    pub recv: bool,
    /// Local indices packed when sending to this neighbor.
    pub send_index: Vec<usize>,
    /// Local indices written when receiving from this neighbor.
    pub recv_index: Vec<usize>,
}

/// Buffer sizes, tags and channels for one exchange phase.
///
#[derive(Clone, Debug)]
pub struct PhasePlan {
    pub phase: Phase,
    pub face_capacity: usize,
    pub edge_capacity: usize,
    pub corner_capacity: usize,
    pub channels: Vec<Channel>,
    /// Values in the flat per-phase buffer, for a full message of fields.
    pub buffer_size: usize,
}

impl PhasePlan {
    pub fn capacity(&self, class: NeighborClass) -> usize {
        match class {
            NeighborClass::Face => self.face_capacity,
            NeighborClass::Edge => self.edge_capacity,
            NeighborClass::Corner => self.corner_capacity,
        }
    }

    /// Tag of message `message` sent by a rank toward `direction`. A
    /// direction has eight tag slots, so at most eight messages.
    pub fn tag(&self, direction: Direction, message: usize) -> Result<u32, Error> {
        if message >= TAGS_PER_DIRECTION as usize {
            return Err(Error::TooManyFields {
                fields: (message + 1) * MAX_FIELDS_PER_MESSAGE,
                max: MAX_FIELDS_PER_EXCHANGE,
            });
        }
        Ok(self.phase.tag_base() + direction.index() as u32 * TAGS_PER_DIRECTION + message as u32)
    }

    pub fn channel(&self, direction: Direction) -> Option<&Channel> {
        self.channels.iter().find(|c| c.direction == direction)
    }
}

/// Number of messages needed to move `num_fields` fields.
///
pub fn messages_needed(num_fields: usize) -> usize {
    (num_fields + MAX_FIELDS_PER_MESSAGE - 1) / MAX_FIELDS_PER_MESSAGE
}

/// The plans of all three phases.
///
#[derive(Clone, Debug)]
pub struct CommPlan {
    pub edge_nodes: usize,
    pub sbn: PhasePlan,
    pub sync_pos_vel: PhasePlan,
    pub monoq: PhasePlan,
}

impl CommPlan {
    pub fn phase(&self, phase: Phase) -> &PhasePlan {
        match phase {
            Phase::Sbn => &self.sbn,
            Phase::SyncPosVel => &self.sync_pos_vel,
            Phase::MonoQ => &self.monoq,
        }
    }
}

/// Sizes and tags the exchange buffers of a rank.
///
pub struct CommBufferPlanner<'a> {
    decomp: &'a Decomposition,
}

impl<'a> CommBufferPlanner<'a> {
    pub fn new(decomp: &'a Decomposition) -> Self {
        Self { decomp }
    }

    pub fn plan(&self, edge_nodes: usize) -> CommPlan {
        let plan = CommPlan {
            edge_nodes,
            sbn: self.phase_plan(Phase::Sbn, edge_nodes),
            sync_pos_vel: self.phase_plan(Phase::SyncPosVel, edge_nodes),
            monoq: self.phase_plan(Phase::MonoQ, edge_nodes),
        };
        debug!(
            "rank {} comm buffers: sbn {} / pos-vel {} / monoq {} values over {} neighbors",
            self.decomp.rank,
            plan.sbn.buffer_size,
            plan.sync_pos_vel.buffer_size,
            plan.monoq.buffer_size,
            plan.sbn.channels.len()
        );
        plan
    }

    fn phase_plan(&self, phase: Phase, edge_nodes: usize) -> PhasePlan {
        let d = self.decomp;
        let max_edge_size = crate::decomposition::cache_align(edge_nodes);
        let max_plane_size = crate::decomposition::cache_align(max_edge_size * max_edge_size);
        let mut channels = Vec::new();
        let mut offset = 0;

        for direction in Direction::all() {
            let rank = match d.neighbor_rank(direction.offset) {
                Some(rank) => rank,
                None => continue,
            };
            let (send, recv) = match phase {
                Phase::Sbn => (true, true),
                Phase::MonoQ if direction.class() != NeighborClass::Face => continue,
                Phase::MonoQ => (true, true),
                Phase::SyncPosVel => (direction.all_nonzero_are(1), direction.all_nonzero_are(-1)),
            };
            if !send && !recv {
                continue;
            }
            let (capacity, stride) = match direction.class() {
                NeighborClass::Face => (edge_nodes * edge_nodes, max_plane_size),
                NeighborClass::Edge => (edge_nodes, max_edge_size),
                NeighborClass::Corner => (1, ALIGN_REALS),
            };
            let (send_index, recv_index) = match phase {
                Phase::MonoQ => (self.element_layer(direction), self.ghost_slots(direction)),
                _ => {
                    let shared = self.shared_nodes(direction);
                    (shared.clone(), shared)
                }
            };
            channels.push(Channel {
                direction,
                rank,
                capacity,
                stride,
                offset,
                send,
                recv,
                send_index,
                recv_index,
            });
            offset += stride * MAX_FIELDS_PER_MESSAGE;
        }

        PhasePlan {
            phase,
            face_capacity: edge_nodes * edge_nodes,
            edge_capacity: edge_nodes,
            corner_capacity: 1,
            channels,
            buffer_size: offset,
        }
    }

    /// Local nodes on the block face, edge or corner pointed to by
    /// `direction`, in memory order.
    fn shared_nodes(&self, direction: Direction) -> Vec<usize> {
        let nodes = self.decomp.nodes();
        let mut space = nodes.clone();

        for (axis, s) in direction.components() {
            if s != 0 {
                space = space.layer(axis, s > 0);
            }
        }
        space.iter().map(|index| nodes.linear_offset(index)).collect()
    }

    /// Local elements adjacent to the face crossed by `direction`.
    fn element_layer(&self, direction: Direction) -> Vec<usize> {
        let elements = self.decomp.elements();
        let face = match direction.face() {
            Some(face) => face,
            None => return Vec::new(),
        };
        let layer = elements.layer(face.axis(), face.side() > 0);
        layer.iter().map(|index| elements.linear_offset(index)).collect()
    }

    /// Ghost element slots filled from the neighbor across `direction`.
    fn ghost_slots(&self, direction: Direction) -> Vec<usize> {
        let n = self.decomp.nx;
        direction
            .face()
            .and_then(|face| MeshBuilder::new(self.decomp).ghost_starts()[face.index()])
            .map(|start| (start..start + n * n).collect())
            .unwrap_or_default()
    }
}
