//! Asynchronous two-channel transport over a `Fabric`.
//!
//! Every outgoing buffer lives in an owned in-flight table until the fabric reports the send
//! complete; `poll_completed_sends` is the only place buffers are released, so it must run
//! every scheduling cycle. Each channel keeps exactly `slots` receives posted: a completed
//! slot is decoded and re-posted in the same pass.

use std::sync::Arc;

use slab::Slab;
use tracing::debug;

use crate::config::ConfigError;
use crate::constants::FRAME_HEADER_BYTES;
use crate::curve::{Curve, SerializeFlags};
use crate::domain::DomainSpace;
use crate::error::SchedError;
use crate::fabric::{Channel, Delivery, Fabric, Rank};
use crate::metrics;
use crate::protocol::{self, Message};

/// A decoded frame plus its header fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<T> {
    pub message_id: u64,
    pub source: Rank,
    pub body: T,
}

struct InFlight<R> {
    request: R,
    channel: Channel,
    /// Held only to keep the buffer alive until completion.
    _buffer: Arc<[u8]>,
}

pub struct Transport<F: Fabric> {
    fabric: F,
    space: DomainSpace,
    next_message_id: u64,
    max_status_bytes: usize,
    max_curve_bytes: usize,
    in_flight: Slab<InFlight<F::SendRequest>>,
    /// Posted receive slots per channel; `None` marks a slot that was cancelled.
    slots: [Vec<Option<F::RecvRequest>>; 2],
}

impl<F: Fabric> Transport<F> {
    pub fn new(
        mut fabric: F,
        space: DomainSpace,
        recv_slots: usize,
        max_curve_bytes: usize,
    ) -> Result<Self, ConfigError> {
        if recv_slots == 0 {
            return Err(ConfigError::ZeroReceiveSlots);
        }
        if max_curve_bytes <= FRAME_HEADER_BYTES {
            return Err(ConfigError::CurveMessageTooSmall(max_curve_bytes));
        }
        let slots: [Vec<Option<F::RecvRequest>>; 2] =
            Channel::ALL.map(|ch| (0..recv_slots).map(|_| Some(fabric.irecv(ch))).collect());
        Ok(Self {
            fabric,
            space,
            next_message_id: 0,
            max_status_bytes: protocol::max_status_frame_bytes(&space),
            max_curve_bytes,
            in_flight: Slab::new(),
            slots,
        })
    }

    pub fn rank(&self) -> Rank {
        self.fabric.rank()
    }

    pub fn size(&self) -> usize {
        self.fabric.size()
    }

    pub fn space(&self) -> &DomainSpace {
        &self.space
    }

    /// Sends not yet observed complete.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn in_flight_on(&self, channel: Channel) -> usize {
        self.in_flight
            .iter()
            .filter(|(_, op)| op.channel == channel)
            .count()
    }

    fn frame(&mut self) -> Vec<u8> {
        let mut buf = Vec::new();
        protocol::write_header(&mut buf, self.next_message_id, self.fabric.rank());
        self.next_message_id += 1;
        buf
    }

    fn post(&mut self, dst: Rank, channel: Channel, buf: Vec<u8>) -> Result<(), SchedError> {
        let max = match channel {
            Channel::Status => self.max_status_bytes,
            Channel::Curves => self.max_curve_bytes,
        };
        if buf.len() > max {
            return Err(SchedError::PayloadTooLarge {
                channel,
                len: buf.len(),
                max,
            });
        }
        let buffer: Arc<[u8]> = Arc::from(buf);
        let request = self.fabric.isend(dst, channel, Arc::clone(&buffer));
        self.in_flight.insert(InFlight {
            request,
            channel,
            _buffer: buffer,
        });
        metrics::update_in_flight(self.in_flight.len());
        Ok(())
    }

    pub fn send_message(&mut self, dst: Rank, msg: &Message) -> Result<(), SchedError> {
        let mut buf = self.frame();
        protocol::write_message(&mut buf, &self.space, msg);
        self.post(dst, Channel::Status, buf)?;
        metrics::inc_status_sent();
        Ok(())
    }

    /// Send `curves` to `dst`, split into as many frames as the size limit requires.
    /// Returns the number of frames sent.
    pub fn send_curves(
        &mut self,
        dst: Rank,
        curves: &[Curve],
        flags: SerializeFlags,
    ) -> Result<usize, SchedError> {
        let mut rest = curves;
        let mut frames = 0;
        while !rest.is_empty() {
            let mut buf = self.frame();
            let taken = protocol::write_curve_batch(&mut buf, rest, flags, self.max_curve_bytes);
            self.post(dst, Channel::Curves, buf)?;
            rest = &rest[taken..];
            frames += 1;
        }
        metrics::add_curves_sent(curves.len());
        Ok(frames)
    }

    /// Ship curves that migrate away from this rank. What stays behind is each curve's
    /// accumulated path as a fragment; curves that never stepped here leave nothing.
    pub fn migrate(&mut self, dst: Rank, curves: Vec<Curve>) -> Result<Vec<Curve>, SchedError> {
        if curves.is_empty() {
            return Ok(Vec::new());
        }
        self.send_curves(dst, &curves, SerializeFlags::MIGRATE)?;
        debug!(dst, n = curves.len(), "migrated curves");
        Ok(curves.into_iter().filter(|c| !c.path.is_empty()).collect())
    }

    /// Release every send the fabric reports complete. Returns how many were released.
    pub fn poll_completed_sends(&mut self) -> usize {
        let done: Vec<usize> = {
            let fabric = &mut self.fabric;
            self.in_flight
                .iter()
                .filter(|(_, op)| fabric.test_send(&op.request))
                .map(|(k, _)| k)
                .collect()
        };
        for k in &done {
            self.in_flight.remove(*k);
        }
        done.len()
    }

    /// Drain every completed receive on `channel`, re-posting each slot as it completes.
    /// Loops until a full pass over the slots finds nothing.
    fn drain(&mut self, channel: Channel) -> Vec<Delivery> {
        let ch = channel.index();
        let mut out = Vec::new();
        loop {
            let mut completed = 0;
            for i in 0..self.slots[ch].len() {
                let Some(request) = self.slots[ch][i].as_mut() else {
                    continue;
                };
                if let Some(delivery) = self.fabric.test_recv(request) {
                    self.slots[ch][i] = Some(self.fabric.irecv(channel));
                    out.push(delivery);
                    completed += 1;
                }
            }
            if completed == 0 {
                break;
            }
        }
        if !out.is_empty() {
            metrics::add_receives(out.len());
        }
        out
    }

    fn open<T>(
        delivery: &Delivery,
        decode: impl FnOnce(&[u8]) -> Result<T, protocol::DecodeError>,
    ) -> Result<Envelope<T>, SchedError> {
        let err = |error| SchedError::Decode {
            source_rank: delivery.source,
            error,
        };
        let (message_id, source, body) = protocol::read_header(&delivery.payload).map_err(err)?;
        Ok(Envelope {
            message_id,
            source,
            body: decode(body).map_err(err)?,
        })
    }

    pub fn receive_messages(&mut self) -> Result<Vec<Envelope<Message>>, SchedError> {
        let space = self.space;
        let mut envs = self
            .drain(Channel::Status)
            .iter()
            .map(|d| Self::open(d, |body| protocol::read_message(body, &space)))
            .collect::<Result<Vec<_>, _>>()?;
        // Slots complete in slot order, not ticket order; restore per-sender order.
        envs.sort_by_key(|e| (e.source, e.message_id));
        Ok(envs)
    }

    pub fn receive_curves(&mut self) -> Result<Vec<Envelope<Vec<Curve>>>, SchedError> {
        let mut envs = self
            .drain(Channel::Curves)
            .iter()
            .map(|d| Self::open(d, protocol::read_curve_batch))
            .collect::<Result<Vec<_>, _>>()?;
        envs.sort_by_key(|e| (e.source, e.message_id));
        Ok(envs)
    }

    pub fn barrier(&mut self, members: &[Rank]) {
        self.fabric.barrier(members);
    }

    pub fn all_reduce_sum(&mut self, values: &mut [i64]) {
        self.fabric.all_reduce_sum(values);
    }

    /// Cancel every posted receive and every send still outstanding, returning the fabric.
    pub fn shutdown(mut self) -> F {
        self.poll_completed_sends();
        let pending = self.in_flight.len();
        for op in self.in_flight.drain() {
            self.fabric.cancel_send(op.request);
        }
        for ch in 0..self.slots.len() {
            for slot in std::mem::take(&mut self.slots[ch]).into_iter().flatten() {
                self.fabric.cancel_recv(slot);
            }
        }
        if pending > 0 {
            debug!(rank = self.fabric.rank(), pending, "cancelled outstanding sends");
        }
        self.fabric
    }
}
