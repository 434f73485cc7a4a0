use std::error;
use std::fmt;




/**
 * Error to represent an invalid domain setup, a malformed input array, or a
 * failed message exchange. None of these are retried; the caller decides
 * whether the run can go on.
 */
#[derive(Debug)]
pub enum Error {
    RankCountNotCube(usize),
    RankOutOfRange { rank: usize, num_ranks: usize },
    EmptyBlock,
    InputSize { what: &'static str, expected: usize, found: usize },
    RegionCountExceedsElements { regions: usize, elements: usize },
    NoStreams,
    NoSuchStream(usize),
    StreamFailed { stream: usize },
    FieldNotExchanged(&'static str),
    TooManyFields { fields: usize, max: usize },
    NodeOutOfRange { node: usize, num_node: usize },
    NoSuchNeighbor { direction: usize },
    Codec(String),
    Disconnected { rank: usize, tag: u32 },
    Config(String),
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        use Error::*;

        match self {
            RankCountNotCube(n) => write!(fmt, "rank count {} is not a perfect cube", n),
            RankOutOfRange { rank, num_ranks } => write!(fmt, "rank {} out of range for {} ranks", rank, num_ranks),
            EmptyBlock => write!(fmt, "per-rank block must have at least one element per axis"),
            InputSize { what, expected, found } => write!(fmt, "{} has length {}, expected {}", what, found, expected),
            RegionCountExceedsElements { regions, elements } => write!(fmt, "{} regions requested for {} elements", regions, elements),
            NoStreams => write!(fmt, "stream pool needs at least one stream"),
            NoSuchStream(s) => write!(fmt, "no stream {} in the pool", s),
            StreamFailed { stream } => write!(fmt, "a job on stream {} panicked", stream),
            FieldNotExchanged(name) => write!(fmt, "field {} is not exchanged in this phase", name),
            TooManyFields { fields, max } => write!(fmt, "{} fields in one exchange, at most {} fit", fields, max),
            NodeOutOfRange { node, num_node } => write!(fmt, "nodelist references node {} of {}", node, num_node),
            NoSuchNeighbor { direction } => write!(fmt, "no neighbor rank in direction {}", direction),
            Codec(msg) => write!(fmt, "message codec: {}", msg),
            Disconnected { rank, tag } => write!(fmt, "peer {} disconnected while waiting for tag {}", rank, tag),
            Config(msg) => write!(fmt, "config: {}", msg),
        }
    }
}

impl error::Error for Error {}
