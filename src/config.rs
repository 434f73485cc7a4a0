use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::error::Error;




/**
 * Global simulation parameters, read-only once a domain is set up. `cycle`
 * is the cycle count a run starts from; the current time and time step
 * live on the domain.
 */
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Parameters {
    pub dtfixed: f64,
    pub deltatimemultlb: f64,
    pub deltatimemultub: f64,
    pub stoptime: f64,
    pub dtmax: f64,
    pub cycle: u64,

    pub u_cut: f64,
    pub hgcoef: f64,
    pub qstop: f64,
    pub monoq_max_slope: f64,
    pub monoq_limiter_mult: f64,
    pub e_cut: f64,
    pub p_cut: f64,
    pub ss4o3: f64,
    pub q_cut: f64,
    pub v_cut: f64,
    pub qlc_monoq: f64,
    pub qqc_monoq: f64,
    pub qqc: f64,
    pub eosvmax: f64,
    pub eosvmin: f64,
    pub pmin: f64,
    pub emin: f64,
    pub dvovmax: f64,
    pub refdens: f64,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            dtfixed: -1.0e-6,
            deltatimemultlb: 1.1,
            deltatimemultub: 1.2,
            stoptime: 1.0e-2,
            dtmax: 1.0e-2,
            cycle: 0,
            u_cut: 1.0e-7,
            hgcoef: 3.0,
            qstop: 1.0e+12,
            monoq_max_slope: 1.0,
            monoq_limiter_mult: 2.0,
            e_cut: 1.0e-7,
            p_cut: 1.0e-7,
            ss4o3: 4.0 / 3.0,
            q_cut: 1.0e-7,
            v_cut: 1.0e-10,
            qlc_monoq: 0.5,
            qqc_monoq: 2.0 / 3.0,
            qqc: 2.0,
            eosvmax: 1.0e+9,
            eosvmin: 1.0e-9,
            pmin: 0.0,
            emin: -1.0e+15,
            dvovmax: 0.1,
            refdens: 1.0,
        }
    }
}




/**
 * Per-rank setup knobs: block size, decomposition, region partition and
 * stream pool size.
 */
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SetupConfig {
    /// Elements per axis in each rank's block.
    pub nx: usize,
    pub num_ranks: usize,
    pub num_regions: usize,
    /// Zero for uniform regions, anything else for cost-imbalanced ones.
    pub balance: u32,
    pub seed: u64,
    pub max_streams: usize,
    pub parameters: Parameters,
}

impl Default for SetupConfig {
    fn default() -> Self {
        Self {
            nx: 30,
            num_ranks: 1,
            num_regions: 11,
            balance: 1,
            seed: 0,
            max_streams: 32,
            parameters: Parameters::default(),
        }
    }
}




// ============================================================================
impl SetupConfig {

    /**
     * Read a config from a CBOR stream. Missing keys take their defaults.
     */
    pub fn from_reader<R: Read>(reader: R) -> Result<Self, Error> {
        ciborium::de::from_reader(reader).map_err(|e| Error::Config(e.to_string()))
    }

    /**
     * Write this config as CBOR.
     */
    pub fn to_writer<W: Write>(&self, writer: W) -> Result<(), Error> {
        ciborium::ser::into_writer(self, writer).map_err(|e| Error::Config(e.to_string()))
    }
}
