//! Shockmesh is the decomposition and data-layout layer under an explicit
//! Lagrangian shock hydrodynamics code on a hexahedral mesh. A cubic domain
//! is split into equal blocks, one per rank. Each rank builds its local mesh
//! with face connectivity and boundary conditions, partitions its elements
//! into cost-weighted material regions, plans the buffers of its three
//! boundary exchange phases, and schedules region-local work over a fixed
//! pool of execution streams. The physics kernels and the time step driver
//! live outside this crate; they operate on the [`domain::Domain`] it builds.

pub mod comm;
pub mod config;
pub mod decomposition;
pub mod domain;
pub mod error;
pub mod exchange;
pub mod index_space;
pub mod mesh;
pub mod meshing;
pub mod message;
pub mod region;
pub mod resident;
pub mod status;
pub mod stream;

pub use domain::Domain;
pub use error::Error;
