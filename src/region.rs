//! Multi-material region partitioning. Every element belongs to exactly one
//! region, and each region carries a cost multiplier standing in for the
//! extra floating point work its material model would do per element. In
//! imbalanced mode, cheap regions are large and expensive regions are small,
//! which is the load imbalance the scheduler has to absorb.

use core::cmp::Reverse;

use log::{debug, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::error::Error;




/**
 * How element counts and costs are distributed over regions.
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BalanceMode {
    Uniform,
    Imbalanced,
}

impl From<u32> for BalanceMode {
    fn from(balance: u32) -> Self {
        if balance == 0 {
            BalanceMode::Uniform
        } else {
            BalanceMode::Imbalanced
        }
    }
}




/**
 * Region bookkeeping for one rank: which region each element is in, and the
 * region-major permutation of element indices with CSR offsets marking the
 * region boundaries.
 */
#[derive(Clone, Debug)]
pub struct RegionSets {
    /// Region index of each local element.
    pub region_of: Vec<usize>,
    pub elem_count: Vec<usize>,
    /// Length `num_regions + 1`; region `r` is `elem_list[csr[r]..csr[r + 1]]`.
    pub csr: Vec<usize>,
    pub elem_list: Vec<usize>,
    /// Cost multiplier per region.
    pub cost: Vec<u32>,
    /// Region indices in scheduling order (most expensive first).
    pub sorted: Vec<usize>,
    requested: usize,
}




// ============================================================================
impl RegionSets {

    pub fn num_regions(&self) -> usize {
        self.elem_count.len()
    }

    /**
     * The element indices of region `r`.
     */
    pub fn region(&self, r: usize) -> &[usize] {
        &self.elem_list[self.csr[r]..self.csr[r + 1]]
    }

    /**
     * Estimated work of each region: element count times cost.
     */
    pub fn work(&self) -> Vec<u64> {
        self.elem_count
            .iter()
            .zip(&self.cost)
            .map(|(&n, &c)| n as u64 * c as u64)
            .collect()
    }

    /**
     * Report a degenerate partition (more regions than elements, or zero
     * regions requested). The partition itself is still usable.
     */
    pub fn validate(&self) -> Result<(), Error> {
        let elements = self.region_of.len();

        if self.requested == 0 || self.requested > elements {
            Err(Error::RegionCountExceedsElements { regions: self.requested, elements })
        } else {
            Ok(())
        }
    }
}




/**
 * Assigns the local elements of a rank to regions. The seed makes the
 * imbalanced assignment reproducible.
 */
pub struct RegionPartitioner {
    num_elem: usize,
    seed: u64,
}




// ============================================================================
impl RegionPartitioner {

    pub fn new(num_elem: usize, seed: u64) -> Self {
        Self { num_elem, seed }
    }

    pub fn partition(&self, region_count: usize, balance: BalanceMode) -> RegionSets {
        let n = self.num_elem;
        let nr = region_count.max(1);

        if region_count == 0 || region_count > n {
            warn!("{} regions requested for {} elements; trailing regions will be empty", region_count, n);
        }

        let (counts, cost) = match balance {
            BalanceMode::Uniform => (uniform_counts(n, nr), vec![1; nr]),
            BalanceMode::Imbalanced => (imbalanced_counts(n, nr), (1..=nr as u32).collect()),
        };

        let region_of = match balance {
            BalanceMode::Uniform => counts
                .iter()
                .enumerate()
                .flat_map(|(r, &c)| std::iter::repeat(r).take(c))
                .collect(),
            BalanceMode::Imbalanced => self.scatter(&counts),
        };

        let (elem_count, csr, elem_list) = region_major(&region_of, nr);
        let sorted = sort_regions(&cost);

        debug!("region element counts {:?}, costs {:?}", elem_count, cost);

        RegionSets {
            region_of,
            elem_count,
            csr,
            elem_list,
            cost,
            sorted,
            requested: region_count,
        }
    }

    /**
     * Lay out the region labels as runs of clustered sizes, then shuffle the
     * runs, so each material forms patches of a few elements up to a few
     * thousand.
     */
    fn scatter(&self, counts: &[usize]) -> Vec<usize> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let labels: Vec<usize> = counts
            .iter()
            .enumerate()
            .flat_map(|(r, &c)| std::iter::repeat(r).take(c))
            .collect();

        let mut runs = Vec::new();
        let mut start = 0;

        while start < labels.len() {
            let end = (start + run_length(&mut rng)).min(labels.len());
            runs.push(&labels[start..end]);
            start = end;
        }
        runs.shuffle(&mut rng);
        runs.concat()
    }
}




/**
 * Draw a material run length. Most runs are short; a small tail is very
 * long.
 */
fn run_length<R: Rng>(rng: &mut R) -> usize {
    match rng.gen_range(0..1000) {
        0..=772 => rng.gen_range(1..16),
        773..=936 => rng.gen_range(16..32),
        937..=969 => rng.gen_range(32..64),
        970..=973 => rng.gen_range(64..128),
        974..=977 => rng.gen_range(128..256),
        978..=980 => rng.gen_range(256..512),
        _ => rng.gen_range(512..2049),
    }
}

fn uniform_counts(n: usize, nr: usize) -> Vec<usize> {
    (0..nr).map(|r| n / nr + (r < n % nr) as usize).collect()
}

/**
 * Region 0 takes a strict majority, `n / 2 + 1`, or as many as leaves one
 * element for every other region. The rest is split over the remaining
 * regions with weights `2^-r` after reserving one each, apportioned by
 * largest remainder. When there are fewer elements than regions, the
 * leading regions get one each.
 */
fn imbalanced_counts(n: usize, nr: usize) -> Vec<usize> {
    if n <= nr || nr == 1 {
        return uniform_counts(n, nr);
    }
    let first = (n / 2 + 1).min(n - (nr - 1));
    let others = nr - 1;
    let extra = n - first - others;

    let weights: Vec<f64> = (0..others).map(|r| 0.5f64.powi(r as i32)).collect();
    let total: f64 = weights.iter().sum();
    let shares: Vec<f64> = weights.iter().map(|w| extra as f64 * w / total).collect();

    let mut counts: Vec<usize> = shares.iter().map(|s| 1 + s.floor() as usize).collect();
    let assigned: usize = counts.iter().sum();

    let mut by_remainder: Vec<usize> = (0..others).collect();
    by_remainder.sort_by(|&a, &b| {
        let fa = shares[a] - shares[a].floor();
        let fb = shares[b] - shares[b].floor();
        fb.total_cmp(&fa).then(a.cmp(&b))
    });
    for &r in by_remainder.iter().cycle().take(n - first - assigned) {
        counts[r] += 1;
    }
    counts.sort_unstable_by(|a, b| b.cmp(a));
    counts.insert(0, first);
    counts
}

/**
 * Stable counting sort of element indices by region.
 */
fn region_major(region_of: &[usize], nr: usize) -> (Vec<usize>, Vec<usize>, Vec<usize>) {
    let mut count = vec![0; nr];

    for &r in region_of {
        count[r] += 1;
    }

    let mut csr = Vec::with_capacity(nr + 1);
    csr.push(0);
    for c in &count {
        csr.push(csr[csr.len() - 1] + c);
    }

    let mut cursor = csr.clone();
    let mut elem_list = vec![0; region_of.len()];

    for (e, &r) in region_of.iter().enumerate() {
        elem_list[cursor[r]] = e;
        cursor[r] += 1;
    }
    (count, csr, elem_list)
}




/**
 * Return region indices ordered by descending cost, ties in ascending index
 * order. Dispatching in this order is the longest-processing-time-first
 * heuristic.
 */
pub fn sort_regions(costs: &[u32]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..costs.len()).collect();
    order.sort_by_key(|&r| Reverse(costs[r]));
    order
}




/**
 * Place regions, in the given order, on the stream with the least work
 * so far (lowest stream index on ties). Returns the stream of each region.
 */
pub fn lpt_assignment(order: &[usize], work: &[u64], num_streams: usize) -> Vec<usize> {
    let mut load = vec![0u64; num_streams.max(1)];
    let mut stream_of = vec![0; work.len()];

    for &r in order {
        let (s, _) = load
            .iter()
            .enumerate()
            .min_by_key(|&(s, &l)| (l, s))
            .unwrap_or((0, &0));
        stream_of[r] = s;
        load[s] += work[r];
    }
    stream_of
}
