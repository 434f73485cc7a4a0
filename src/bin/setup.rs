use std::fs::File;
use std::thread;

use clap::Parser;
use log::{error, info, warn, LevelFilter};
use shockmesh::comm::Phase;
use shockmesh::config::SetupConfig;
use shockmesh::domain::FieldId;
use shockmesh::message::{ChannelWorld, Communicator};
use shockmesh::{Domain, Error};
use simple_logger::SimpleLogger;

/// Set up every rank of a decomposition in-process and report the layout.
#[derive(Debug, Parser)]
#[clap(version)]
struct Opts {
    /// CBOR setup file, read instead of the size flags
    #[clap(short = 'c', long)]
    config: Option<String>,

    /// Write the effective setup to this CBOR file and exit
    #[clap(long)]
    write_config: Option<String>,

    #[clap(short = 's', long, default_value = "30")]
    nx: usize,

    #[clap(short = 'p', long, default_value = "1")]
    num_ranks: usize,

    #[clap(short = 'r', long, default_value = "11")]
    num_regions: usize,

    #[clap(short = 'b', long, default_value = "1")]
    balance: u32,

    #[clap(long, default_value = "0")]
    seed: u64,

    #[clap(long, default_value = "32")]
    max_streams: usize,

    #[clap(short = 'v', long)]
    verbose: bool,
}

impl Opts {
    fn setup_config(&self) -> Result<SetupConfig, Error> {
        match &self.config {
            Some(path) => {
                let file = File::open(path).map_err(|e| Error::Config(format!("{}: {}", path, e)))?;
                SetupConfig::from_reader(file)
            }
            None => Ok(SetupConfig {
                nx: self.nx,
                num_ranks: self.num_ranks,
                num_regions: self.num_regions,
                balance: self.balance,
                seed: self.seed,
                max_streams: self.max_streams,
                ..SetupConfig::default()
            }),
        }
    }
}

fn run_rank<C: Communicator>(config: &SetupConfig, comm: &C) -> Result<(), Error> {
    let mut domain = Domain::new(config, comm.rank())?;

    domain.regions.validate().unwrap_or_else(|e| warn!("rank {}: {}", comm.rank(), e));
    domain.exchange(comm, Phase::Sbn, &[FieldId::NodalMass])?;

    let plan = domain.comm_plan();
    info!(
        "rank {} ({}, {}, {}): region counts {:?}, neighbors {}, buffers {}/{}/{} reals",
        comm.rank(),
        domain.decomp.col,
        domain.decomp.row,
        domain.decomp.plane,
        domain.regions.elem_count,
        plan.sbn.channels.len(),
        plan.sbn.buffer_size,
        plan.sync_pos_vel.buffer_size,
        plan.monoq.buffer_size
    );

    let local_mass: f64 = domain.node.nodal_mass.iter().sum();
    let min_mass = comm.all_reduce_min(local_mass)?;

    if comm.rank() == 0 {
        info!("smallest local nodal mass total over ranks: {:.6e}", min_mass);
    }
    Ok(())
}

fn run(opts: &Opts) -> Result<(), Error> {
    let config = opts.setup_config()?;

    if let Some(path) = &opts.write_config {
        let file = File::create(path).map_err(|e| Error::Config(format!("{}: {}", path, e)))?;
        config.to_writer(file)?;
        info!("wrote {}", path);
        return Ok(());
    }

    let procs: Vec<_> = ChannelWorld::new(config.num_ranks)
        .into_iter()
        .map(|comm| {
            let config = config.clone();
            thread::spawn(move || run_rank(&config, &comm))
        })
        .collect();

    for process in procs {
        process.join().map_err(|_| Error::Config("a rank panicked".to_string()))??;
    }
    Ok(())
}

fn main() {
    let opts = Opts::parse();
    let level = if opts.verbose { LevelFilter::Debug } else { LevelFilter::Info };

    SimpleLogger::new().with_level(level).init().unwrap();

    if let Err(e) = run(&opts) {
        error!("{}", e);
        std::process::exit(1);
    }
}
