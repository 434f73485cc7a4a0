//! A minimal tagged message-passing API, encapsulated by the `Communicator`
//! trait. Implementors only write `send` and `recv` for a transport; the
//! trait supplies the global min-reduction used for the time step
//! constraints. An in-process transport over channels is included, which is
//! what the tests and single-process runs use.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crossbeam_channel::{Receiver, Sender};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Tags of the collective operations, outside the exchange namespaces.
const MSG_REDUCE: u32 = 4096;
const MSG_BROADCAST: u32 = 4097;

/// Interface for a group of ranks exchanging tagged byte messages.
///
pub trait Communicator {
    /// Must be implemented to return the rank of this process.
    fn rank(&self) -> usize;

    /// Must be implemented to return the number of ranks.
    fn size(&self) -> usize;

    /// Must be implemented to send a message to a peer. This method must
    /// not block until a matching receive is posted.
    fn send(&self, rank: usize, tag: u32, message: Vec<u8>) -> Result<(), Error>;

    /// Must be implemented to receive the next message from `rank` with the
    /// given tag. Messages with other tags that arrive first are held until
    /// asked for. This method may block.
    fn recv(&self, rank: usize, tag: u32) -> Result<Vec<u8>, Error>;

    /// Binomial tree min-reduction to rank 0, followed by a binomial tree
    /// broadcast of the result.
    ///
    fn all_reduce_min(&self, value: f64) -> Result<f64, Error> {
        let r = self.rank();
        let p = self.size();
        let levels = ceil_log2(p);
        let mut value = value;

        for level in 0..levels {
            let one = 1 << level;
            let two = one << 1;

            if r % two == 0 {
                if r + one < p {
                    value = value.min(decode::<f64>(&self.recv(r + one, MSG_REDUCE)?)?);
                }
            } else {
                self.send(r - one, MSG_REDUCE, encode(&value)?)?;
                break;
            }
        }

        for level in (0..levels).rev() {
            let one = 1 << level;
            let two = one << 1;

            if r % two == one {
                value = decode(&self.recv(r - one, MSG_BROADCAST)?)?;
            } else if r % two == 0 && r + one < p {
                self.send(r + one, MSG_BROADCAST, encode(&value)?)?;
            }
        }
        Ok(value)
    }
}

/// Compute the log-base-two of the next power of two: 8 -> 3, 9 -> 4.
///
pub fn ceil_log2(x: usize) -> usize {
    let mut n = 0;
    while 1 << n < x {
        n += 1
    }
    n
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, Error> {
    rmp_serde::encode::to_vec(value).map_err(|e| Error::Codec(e.to_string()))
}

pub fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, Error> {
    rmp_serde::decode::from_slice(bytes).map_err(|e| Error::Codec(e.to_string()))
}

struct Envelope {
    source: usize,
    tag: u32,
    data: Vec<u8>,
}

/// One rank's endpoint in a [`ChannelWorld`]. Arriving messages that are
/// not the one being waited for are buffered by `(source, tag)` until a
/// matching `recv`.
///
pub struct ChannelCommunicator {
    rank: usize,
    peers: Vec<Sender<Envelope>>,
    inbound: Receiver<Envelope>,
    buffer: Mutex<HashMap<(usize, u32), VecDeque<Vec<u8>>>>,
}

impl Communicator for ChannelCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.peers.len()
    }

    fn send(&self, rank: usize, tag: u32, data: Vec<u8>) -> Result<(), Error> {
        let peer = self.peers.get(rank).ok_or(Error::Disconnected { rank, tag })?;
        peer.send(Envelope { source: self.rank, tag, data })
            .map_err(|_| Error::Disconnected { rank, tag })
    }

    fn recv(&self, rank: usize, tag: u32) -> Result<Vec<u8>, Error> {
        let mut buffer = self.buffer.lock().map_err(|_| Error::Disconnected { rank, tag })?;

        if let Some(data) = buffer.get_mut(&(rank, tag)).and_then(|q| q.pop_front()) {
            return Ok(data);
        }
        loop {
            let env = self.inbound.recv().map_err(|_| Error::Disconnected { rank, tag })?;

            if env.source == rank && env.tag == tag {
                return Ok(env.data);
            }
            debug!(
                "rank {} holding message from {} with tag {} while waiting for {} / {}",
                self.rank, env.source, env.tag, rank, tag
            );
            buffer.entry((env.source, env.tag)).or_default().push_back(env.data);
        }
    }
}

/// Builds a group of in-process communicators, one per rank, connected by
/// unbounded channels.
///
pub struct ChannelWorld;

impl ChannelWorld {
    pub fn new(size: usize) -> Vec<ChannelCommunicator> {
        let (sinks, sources): (Vec<_>, Vec<_>) = (0..size).map(|_| crossbeam_channel::unbounded()).unzip();

        sources
            .into_iter()
            .enumerate()
            .map(|(rank, inbound)| ChannelCommunicator {
                rank,
                peers: sinks.clone(),
                inbound,
                buffer: Mutex::new(HashMap::new()),
            })
            .collect()
    }
}

// ============================================================================
#[cfg(test)]
mod test {

    use super::{ceil_log2, ChannelWorld, Communicator};

    #[test]
    fn ceil_log2_works() {
        assert_eq!(ceil_log2(1), 0);
        assert_eq!(ceil_log2(8), 3);
        assert_eq!(ceil_log2(9), 4);
    }

    #[test]
    fn out_of_order_tags_are_held() {
        let world = ChannelWorld::new(2);
        world[0].send(1, 7, vec![7]).unwrap();
        world[0].send(1, 3, vec![3]).unwrap();
        assert_eq!(world[1].recv(0, 3).unwrap(), vec![3]);
        assert_eq!(world[1].recv(0, 7).unwrap(), vec![7]);
    }

    #[test]
    fn all_reduce_min_agrees_on_every_rank() {
        for size in [1, 2, 5, 8] {
            let results: Vec<f64> = std::thread::scope(|scope| {
                let handles: Vec<_> = ChannelWorld::new(size)
                    .into_iter()
                    .map(|comm| scope.spawn(move || comm.all_reduce_min(10.0 - comm.rank() as f64).unwrap()))
                    .collect();
                handles.into_iter().map(|h| h.join().unwrap()).collect()
            });
            assert!(results.iter().all(|&v| v == 11.0 - size as f64));
        }
    }
}
