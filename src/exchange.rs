//! Packing, sending and unpacking of boundary fields between ranks.
//!
//! Each phase moves a fixed family of fields. Values for one neighbor are
//! staged in that neighbor's slots of the phase's flat send buffer, at most
//! six fields per message, then copied into a [`Message`] and encoded with
//! MessagePack. On receipt the boundary sum adds into local values, the
//! position/velocity sync overwrites them, and the limiter exchange fills
//! ghost element slots.

use std::sync::Arc;

use log::trace;
use serde::{Deserialize, Serialize};

use crate::comm::{messages_needed, Channel, Direction, Phase, PhasePlan, MAX_FIELDS_PER_EXCHANGE, MAX_FIELDS_PER_MESSAGE};
use crate::domain::{phase_slot, Domain, FieldId};
use crate::error::Error;
use crate::message::{decode, encode, Communicator};

/// One tagged message of an exchange phase. `values` holds the fields in
/// order, each as a run of one value per packed index.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub tag: u32,
    pub source: usize,
    pub fields: Vec<FieldId>,
    pub values: Vec<f64>,
}

/// Whether a phase moves a field.
///
pub fn exchanges(phase: Phase, field: FieldId) -> bool {
    use FieldId::*;

    match phase {
        Phase::Sbn => matches!(field, Fx | Fy | Fz | NodalMass),
        Phase::SyncPosVel => matches!(field, X | Y | Z | Xd | Yd | Zd | Xdd | Ydd | Zdd),
        Phase::MonoQ => matches!(field, DelvXi | DelvEta | DelvZeta),
    }
}

fn check_fields(phase: Phase, fields: &[FieldId]) -> Result<(), Error> {
    if fields.len() > MAX_FIELDS_PER_EXCHANGE {
        return Err(Error::TooManyFields { fields: fields.len(), max: MAX_FIELDS_PER_EXCHANGE });
    }
    match fields.iter().find(|&&f| !exchanges(phase, f)) {
        Some(f) => Err(Error::FieldNotExchanged(f.name())),
        None => Ok(()),
    }
}

impl Domain {
    /// Pack the given fields for the neighbor in `direction`, one message
    /// per six fields.
    ///
    pub fn pack(&mut self, phase: Phase, direction: Direction, fields: &[FieldId]) -> Result<Vec<Message>, Error> {
        check_fields(phase, fields)?;
        let plan = Arc::clone(&self.comm_plan);
        let plan = plan.phase(phase);
        let channel = plan
            .channel(direction)
            .filter(|c| c.send)
            .ok_or(Error::NoSuchNeighbor { direction: direction.index() })?;
        self.pack_channel(plan, channel, fields)
    }

    /// Run one exchange phase: send to every neighbor the phase sends to,
    /// then receive from every neighbor it receives from. All sends are
    /// posted before the first receive, so values leave before any are
    /// modified.
    ///
    pub fn exchange<C: Communicator>(&mut self, comm: &C, phase: Phase, fields: &[FieldId]) -> Result<(), Error> {
        check_fields(phase, fields)?;
        let plan = Arc::clone(&self.comm_plan);
        let plan = plan.phase(phase);

        for channel in plan.channels.iter().filter(|c| c.send) {
            for message in self.pack_channel(plan, channel, fields)? {
                comm.send(channel.rank, message.tag, encode(&message)?)?;
            }
        }

        // more negative directions last, so the lowest sharing rank wins
        for channel in plan.channels.iter().rev().filter(|c| c.recv) {
            for m in 0..messages_needed(fields.len()) {
                let tag = plan.tag(channel.direction.opposite(), m)?;
                let message: Message = decode(&comm.recv(channel.rank, tag)?)?;
                self.unpack(phase, channel, &message)?;
            }
        }
        trace!("rank {} finished {:?} exchange of {} fields", self.decomp.rank, phase, fields.len());
        Ok(())
    }

    fn pack_channel(&mut self, plan: &PhasePlan, channel: &Channel, fields: &[FieldId]) -> Result<Vec<Message>, Error> {
        let slot = phase_slot(plan.phase);
        let mut buffer = std::mem::take(&mut self.send_buffers[slot]);
        let n = channel.send_index.len();
        let mut messages = Vec::with_capacity(messages_needed(fields.len()));

        for (m, chunk) in fields.chunks(MAX_FIELDS_PER_MESSAGE).enumerate() {
            let tag = match plan.tag(channel.direction, m) {
                Ok(tag) => tag,
                Err(e) => {
                    self.send_buffers[slot] = buffer;
                    return Err(e);
                }
            };
            let mut values = Vec::with_capacity(chunk.len() * n);

            for (f, &id) in chunk.iter().enumerate() {
                let source = self.field(id);
                let staged = &mut buffer[channel.offset + f * channel.stride..][..n];

                for (dst, &i) in staged.iter_mut().zip(&channel.send_index) {
                    *dst = source[i];
                }
                values.extend_from_slice(staged);
            }
            messages.push(Message {
                tag,
                source: self.decomp.rank,
                fields: chunk.to_vec(),
                values,
            });
        }
        self.send_buffers[slot] = buffer;
        Ok(messages)
    }

    fn unpack(&mut self, phase: Phase, channel: &Channel, message: &Message) -> Result<(), Error> {
        check_fields(phase, &message.fields)?;
        let n = channel.recv_index.len();

        if message.values.len() != message.fields.len() * n {
            return Err(Error::InputSize {
                what: "message values",
                expected: message.fields.len() * n,
                found: message.values.len(),
            });
        }

        for (&id, values) in message.fields.iter().zip(message.values.chunks(n.max(1))) {
            let target = self.field_mut(id);

            for (&i, &v) in channel.recv_index.iter().zip(values) {
                match phase {
                    Phase::Sbn => target[i] += v,
                    Phase::SyncPosVel | Phase::MonoQ => target[i] = v,
                }
            }
        }
        Ok(())
    }
}
