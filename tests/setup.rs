use std::thread;

use shockmesh::comm::Phase;
use shockmesh::config::SetupConfig;
use shockmesh::domain::{FieldId, RegionConstraint};
use shockmesh::mesh::{BoundaryFlags, Face, NO_NEIGHBOR};
use shockmesh::message::{ChannelWorld, ChannelCommunicator, Communicator};
use shockmesh::Domain;

fn config(nx: usize, num_ranks: usize, num_regions: usize, balance: u32) -> SetupConfig {
    SetupConfig {
        nx,
        num_ranks,
        num_regions,
        balance,
        max_streams: 2,
        ..SetupConfig::default()
    }
}

/// Run `f` on every rank of an in-process world and collect the results in
/// rank order.
fn run_world<T, F>(config: &SetupConfig, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(&mut Domain, &ChannelCommunicator) -> T + Sync,
{
    thread::scope(|scope| {
        let handles: Vec<_> = ChannelWorld::new(config.num_ranks)
            .into_iter()
            .map(|comm| {
                let f = &f;
                scope.spawn(move || {
                    let mut domain = Domain::new(config, comm.rank()).unwrap();
                    f(&mut domain, &comm)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

/// How many ranks share local node `(i, j, k)` of a block.
fn sharing_ranks(domain: &Domain, (i, j, k): (usize, usize, usize)) -> usize {
    let d = &domain.decomp;
    let x = &d.exchange;
    let on = |idx: usize, min: bool, max: bool| 1 + ((idx == 0 && min) || (idx == d.nx && max)) as usize;
    on(i, x.col_min, x.col_max) * on(j, x.row_min, x.row_max) * on(k, x.plane_min, x.plane_max)
}

fn node_index(domain: &Domain, n: usize) -> (usize, usize, usize) {
    let en = domain.decomp.edge_nodes();
    (n % en, (n / en) % en, n / (en * en))
}

#[test]
fn single_rank_cube_has_boundary_flags_only_on_the_surface() {
    let domain = Domain::new(&config(4, 1, 1, 0), 0).unwrap();

    assert_eq!(domain.decomp.num_elem, 64);
    assert_eq!(domain.decomp.num_node, 125);
    assert_eq!(domain.regions.region(0).len(), 64);
    assert_eq!(domain.regions.elem_count, vec![64]);

    for e in 0..64 {
        let (i, j, k) = (e % 4, (e / 4) % 4, e / 16);
        let bc = domain.mesh.elem_bc[e];
        let interior = (1..3).contains(&i) && (1..3).contains(&j) && (1..3).contains(&k);

        assert_eq!(bc.is_empty(), interior);
        assert_eq!(bc.contains(BoundaryFlags::XI_M_SYMM), i == 0);
        assert_eq!(bc.contains(BoundaryFlags::XI_P_FREE), i == 3);
        assert_eq!(bc.contains(BoundaryFlags::ETA_M_SYMM), j == 0);
        assert_eq!(bc.contains(BoundaryFlags::ETA_P_FREE), j == 3);
        assert_eq!(bc.contains(BoundaryFlags::ZETA_M_SYMM), k == 0);
        assert_eq!(bc.contains(BoundaryFlags::ZETA_P_FREE), k == 3);

        for face in Face::ALL {
            let nb = domain.mesh.neighbor(e, face);
            assert_eq!(nb == NO_NEIGHBOR, bc.is_physical(face));
            assert!(nb == NO_NEIGHBOR || nb < 64);
        }
    }
    assert_eq!(domain.decomp.padded_num_elem % 16, 0);
    assert_eq!(domain.decomp.padded_num_node % 16, 0);
}

#[test]
fn boundary_sum_counts_the_ranks_sharing_each_node() {
    let config = config(2, 8, 1, 0);

    let ok = run_world(&config, |domain, comm| {
        let num_node = domain.decomp.num_node;
        domain.node.fx[..num_node].iter_mut().for_each(|f| *f = 1.0);
        domain.exchange(comm, Phase::Sbn, &[FieldId::Fx]).unwrap();

        (0..num_node).all(|n| domain.node.fx[n] == sharing_ranks(domain, node_index(domain, n)) as f64)
    });
    assert!(ok.iter().all(|&ok| ok));
}

#[test]
fn summed_nodal_mass_matches_a_single_rank_mesh() {
    let h3 = (1.125f64 / 4.0).powi(3);

    let centers = run_world(&config(2, 8, 1, 0), |domain, comm| {
        domain.exchange(comm, Phase::Sbn, &[FieldId::NodalMass]).unwrap();
        let global_center = (2 - 2 * domain.decomp.col, 2 - 2 * domain.decomp.row, 2 - 2 * domain.decomp.plane);
        let en = domain.decomp.edge_nodes();
        let (i, j, k) = global_center;
        domain.node.nodal_mass[(k * en + j) * en + i]
    });
    for mass in centers {
        assert!((mass - h3).abs() < 1e-14);
    }
}

#[test]
fn position_sync_takes_the_lowest_sharing_rank() {
    let ok = run_world(&config(2, 8, 1, 0), |domain, comm| {
        let rank = comm.rank() as f64;
        domain.node.xd.iter_mut().for_each(|v| *v = rank);
        domain.exchange(comm, Phase::SyncPosVel, &[FieldId::X, FieldId::Xd]).unwrap();

        let d = domain.decomp.clone();
        (0..d.num_node).all(|n| {
            let (i, j, k) = node_index(domain, n);
            let col = d.col - (i == 0 && d.exchange.col_min) as usize;
            let row = d.row - (j == 0 && d.exchange.row_min) as usize;
            let plane = d.plane - (k == 0 && d.exchange.plane_min) as usize;
            domain.node.xd[n] == ((plane * d.tp + row) * d.tp + col) as f64
        })
    });
    assert!(ok.iter().all(|&ok| ok));
}

#[test]
fn limiter_exchange_fills_the_ghost_elements() {
    let ok = run_world(&config(3, 8, 1, 0), |domain, comm| {
        let rank = comm.rank();
        let n = domain.decomp.nx;
        for e in 0..domain.decomp.num_elem {
            domain.elem.delv_xi[e] = (rank * 1000 + e) as f64;
        }
        domain.exchange(comm, Phase::MonoQ, &[FieldId::DelvXi]).unwrap();

        let across = match domain.decomp.neighbor_rank((1, 0, 0)) {
            Some(r) => r,
            None => return true,
        };
        (0..domain.decomp.num_elem).filter(|e| e % n == n - 1).all(|e| {
            let ghost = domain.mesh.neighbor(e, Face::XiP);
            ghost >= domain.decomp.num_elem && domain.elem.delv_xi[ghost] == (across * 1000 + e - (n - 1)) as f64
        })
    });
    assert!(ok.iter().all(|&ok| ok));
}

#[test]
fn time_constraints_reduce_over_regions_and_ranks() {
    let results = run_world(&config(3, 8, 4, 1), |domain, comm| {
        let rank = comm.rank() as f64;
        domain.reduce_time_constraints(move |r, _| RegionConstraint {
            dtcourant: 1.0 + rank + r as f64,
            dthydro: 10.0 - rank,
        });
        domain.reduce_global_time_constraints(comm).unwrap()
    });
    assert!(results.iter().all(|&c| c == (1.0, 3.0)));
}

#[test]
fn imbalanced_setup_favors_the_cheapest_region() {
    let domain = Domain::new(&config(10, 1, 3, 1), 0).unwrap();
    let sets = &domain.regions;

    assert_eq!(sets.cost, vec![1, 2, 3]);
    assert_eq!(sets.sorted, vec![2, 1, 0]);
    assert_eq!(sets.elem_count.iter().sum::<usize>(), 1000);
    assert!(sets.elem_count[0] > sets.elem_count[1] && sets.elem_count[1] > sets.elem_count[2]);
    assert!(sets.elem_count[0] * 2 > 1000);
    assert!(sets.validate().is_ok());
}

#[test]
fn more_regions_than_elements_is_reported_not_fatal() {
    let domain = Domain::new(&config(1, 1, 4, 1), 0).unwrap();
    assert_eq!(domain.regions.elem_count, vec![1, 0, 0, 0]);
    assert!(domain.regions.validate().is_err());
}
