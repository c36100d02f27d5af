//! In-process fabric: every rank is a thread, every (rank, channel) mailbox is a
//! multi-producer disruptor ring polled by its owner.
//!
//! A send completes when the receiver matches the frame to one of its posted receive
//! slots. A full mailbox never blocks the sender; the frame waits in a sender-side backlog
//! that is flushed on every later fabric call, preserving per-pair order.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier, Mutex, MutexGuard, PoisonError};

use disruptor::{
    BusySpin, EventPoller, MultiProducer, MultiProducerBarrier, Polling, Producer,
    RingBufferFull, SingleConsumerBarrier, build_multi_producer,
};

use crate::config::MIN_MAILBOX_CAPACITY;
use crate::fabric::{Channel, Delivery, Fabric, Rank};
use crate::metrics;

/// Ring slot. Pre-allocated by the factory; filled by the sending rank.
pub struct Frame {
    source: Rank,
    payload: Option<Arc<[u8]>>,
    delivered: Option<Arc<AtomicBool>>,
}

impl Frame {
    fn factory() -> Self {
        Self {
            source: 0,
            payload: None,
            delivered: None,
        }
    }
}

type Outbox = MultiProducer<Frame, SingleConsumerBarrier>;
type Inbox = EventPoller<Frame, MultiProducerBarrier>;

struct Outgoing {
    dst: Rank,
    channel: Channel,
    payload: Arc<[u8]>,
    delivered: Arc<AtomicBool>,
}

struct Arrival {
    source: Rank,
    payload: Arc<[u8]>,
    delivered: Arc<AtomicBool>,
}

pub struct LocalSend {
    delivered: Arc<AtomicBool>,
}

pub struct LocalRecv {
    channel: Channel,
    ticket: u64,
    done: bool,
}

/// Rendezvous state shared by all ranks of one cluster.
struct Shared {
    groups: Mutex<HashMap<Vec<Rank>, Arc<Barrier>>>,
    world: Barrier,
    rows: Mutex<Vec<Vec<i64>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct LocalFabric {
    rank: Rank,
    size: usize,
    outboxes: Vec<[Outbox; 2]>,
    inboxes: [Inbox; 2],
    backlog: VecDeque<Outgoing>,
    unmatched: [VecDeque<Arrival>; 2],
    posted: [VecDeque<u64>; 2],
    matched: [HashMap<u64, Delivery>; 2],
    next_ticket: u64,
    shared: Arc<Shared>,
}

fn mailbox(capacity: usize) -> (Inbox, Outbox) {
    let builder = build_multi_producer(capacity, Frame::factory, BusySpin);
    let (poller, builder) = builder.event_poller();
    (poller, builder.build())
}

/// Build one connected fabric endpoint per rank. `mailbox_capacity` is raised to
/// `MIN_MAILBOX_CAPACITY` and rounded up to a power of two.
pub fn local_cluster(size: usize, mailbox_capacity: usize) -> Vec<LocalFabric> {
    let capacity = mailbox_capacity
        .max(MIN_MAILBOX_CAPACITY)
        .next_power_of_two();
    let mut inboxes = Vec::with_capacity(size);
    let mut producers: Vec<[Outbox; 2]> = Vec::with_capacity(size);
    for _ in 0..size {
        let (status_in, status_out) = mailbox(capacity);
        let (curves_in, curves_out) = mailbox(capacity);
        inboxes.push([status_in, curves_in]);
        producers.push([status_out, curves_out]);
    }
    let shared = Arc::new(Shared {
        groups: Mutex::new(HashMap::new()),
        world: Barrier::new(size),
        rows: Mutex::new(vec![Vec::new(); size]),
    });

    inboxes
        .into_iter()
        .enumerate()
        .map(|(rank, inboxes)| LocalFabric {
            rank,
            size,
            outboxes: producers
                .iter()
                .map(|[s, c]| [s.clone(), c.clone()])
                .collect(),
            inboxes,
            backlog: VecDeque::new(),
            unmatched: [VecDeque::new(), VecDeque::new()],
            posted: [VecDeque::new(), VecDeque::new()],
            matched: [HashMap::new(), HashMap::new()],
            next_ticket: 0,
            shared: Arc::clone(&shared),
        })
        .collect()
}

impl LocalFabric {
    fn try_publish(&mut self, out: &Outgoing) -> bool {
        let source = self.rank;
        let mut payload = Some(Arc::clone(&out.payload));
        let mut delivered = Some(Arc::clone(&out.delivered));
        let producer = &mut self.outboxes[out.dst][out.channel.index()];
        match producer.try_publish(|slot| {
            slot.source = source;
            slot.payload = payload.take();
            slot.delivered = delivered.take();
        }) {
            Ok(_) => true,
            Err(RingBufferFull) => {
                metrics::inc_mailbox_full();
                false
            }
        }
    }

    /// Retry queued frames. A full mailbox only holds back frames for that same
    /// (destination, channel) pair, so one stalled reader cannot block other traffic.
    fn flush_backlog(&mut self) {
        let mut blocked: Vec<(Rank, Channel)> = Vec::new();
        let mut kept = VecDeque::new();
        while let Some(out) = self.backlog.pop_front() {
            let pair = (out.dst, out.channel);
            if blocked.contains(&pair) || !self.try_publish(&out) {
                if !blocked.contains(&pair) {
                    blocked.push(pair);
                }
                kept.push_back(out);
            }
        }
        self.backlog = kept;
    }

    fn has_backlog_for(&self, dst: Rank, channel: Channel) -> bool {
        self.backlog
            .iter()
            .any(|out| out.dst == dst && out.channel == channel)
    }

    /// Pull everything from the channel's ring and match it against posted slots.
    fn progress(&mut self, channel: Channel) {
        self.flush_backlog();
        let ch = channel.index();
        let unmatched = &mut self.unmatched[ch];
        match self.inboxes[ch].poll() {
            Ok(mut guard) => {
                for frame in &mut guard {
                    if let (Some(payload), Some(delivered)) = (&frame.payload, &frame.delivered) {
                        unmatched.push_back(Arrival {
                            source: frame.source,
                            payload: Arc::clone(payload),
                            delivered: Arc::clone(delivered),
                        });
                    }
                }
            }
            Err(Polling::NoEvents) | Err(Polling::Shutdown) => {}
        }
        while !self.posted[ch].is_empty() && !self.unmatched[ch].is_empty() {
            let (Some(ticket), Some(arrival)) =
                (self.posted[ch].pop_front(), self.unmatched[ch].pop_front())
            else {
                break;
            };
            arrival.delivered.store(true, Ordering::Release);
            self.matched[ch].insert(
                ticket,
                Delivery {
                    source: arrival.source,
                    payload: arrival.payload,
                },
            );
        }
    }
}

impl Fabric for LocalFabric {
    type SendRequest = LocalSend;
    type RecvRequest = LocalRecv;

    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn isend(&mut self, dst: Rank, channel: Channel, payload: Arc<[u8]>) -> LocalSend {
        let delivered = Arc::new(AtomicBool::new(false));
        let out = Outgoing {
            dst,
            channel,
            payload,
            delivered: Arc::clone(&delivered),
        };
        self.flush_backlog();
        if self.has_backlog_for(dst, channel) || !self.try_publish(&out) {
            self.backlog.push_back(out);
        }
        LocalSend { delivered }
    }

    fn test_send(&mut self, request: &LocalSend) -> bool {
        self.flush_backlog();
        request.delivered.load(Ordering::Acquire)
    }

    fn cancel_send(&mut self, request: LocalSend) {
        // Frames already in a ring stay there; the receiver holds its own reference.
        self.backlog
            .retain(|out| !Arc::ptr_eq(&out.delivered, &request.delivered));
    }

    fn irecv(&mut self, channel: Channel) -> LocalRecv {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.posted[channel.index()].push_back(ticket);
        LocalRecv {
            channel,
            ticket,
            done: false,
        }
    }

    fn test_recv(&mut self, request: &mut LocalRecv) -> Option<Delivery> {
        if request.done {
            return None;
        }
        self.progress(request.channel);
        let delivery = self.matched[request.channel.index()].remove(&request.ticket)?;
        request.done = true;
        Some(delivery)
    }

    fn cancel_recv(&mut self, request: LocalRecv) {
        let ch = request.channel.index();
        self.posted[ch].retain(|t| *t != request.ticket);
        if let Some(d) = self.matched[ch].remove(&request.ticket) {
            // Already matched but never observed: keep it for the next posted slot.
            self.unmatched[ch].push_front(Arrival {
                source: d.source,
                payload: d.payload,
                delivered: Arc::new(AtomicBool::new(true)),
            });
        }
    }

    fn barrier(&mut self, members: &[Rank]) {
        if members.len() <= 1 {
            return;
        }
        let mut key = members.to_vec();
        key.sort_unstable();
        let barrier = {
            let mut groups = lock(&self.shared.groups);
            Arc::clone(
                groups
                    .entry(key)
                    .or_insert_with(|| Arc::new(Barrier::new(members.len()))),
            )
        };
        self.flush_backlog();
        barrier.wait();
    }

    fn all_reduce_sum(&mut self, values: &mut [i64]) {
        {
            let mut rows = lock(&self.shared.rows);
            let row = &mut rows[self.rank];
            row.clear();
            row.extend_from_slice(values);
        }
        self.flush_backlog();
        self.shared.world.wait();
        {
            let rows = lock(&self.shared.rows);
            values.iter_mut().for_each(|v| *v = 0);
            for row in rows.iter() {
                for (v, x) in values.iter_mut().zip(row) {
                    *v += *x;
                }
            }
        }
        // Nobody may overwrite a row before every rank has summed this round.
        self.shared.world.wait();
    }
}
