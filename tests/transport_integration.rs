//! Transport over the in-process fabric with real threads on both ends.

mod common;

use std::thread;

use curveflow::curve::{Curve, SerializeFlags};
use curveflow::local_fabric::local_cluster;
use curveflow::protocol::Message;
use curveflow::transport::Transport;
use curveflow::{DomainSpace, synthetic};

use common::domain;

const SPACE: DomainSpace = DomainSpace::new(4, 1);

#[test]
fn per_sender_order_survives_concurrent_senders() {
    const PER_SENDER: u32 = 500;
    let mut fabrics = local_cluster(4, 64);
    let receiver = fabrics.remove(0);

    let senders: Vec<_> = fabrics
        .into_iter()
        .map(|f| {
            thread::spawn(move || {
                let mut t = Transport::new(f, SPACE, 8, 1 << 16).unwrap();
                for i in 0..PER_SENDER {
                    let msg = Message::SendCurves {
                        dst: 0,
                        domain: domain(1),
                        count: i,
                    };
                    t.send_message(0, &msg).unwrap();
                }
                while t.in_flight() > 0 {
                    t.poll_completed_sends();
                    thread::yield_now();
                }
            })
        })
        .collect();

    let mut t = Transport::new(receiver, SPACE, 8, 1 << 16).unwrap();
    let mut next = [0u32; 4];
    let mut got = 0;
    while got < 3 * PER_SENDER {
        for env in t.receive_messages().unwrap() {
            let Message::SendCurves { count, .. } = env.body else {
                panic!("unexpected {:?}", env.body);
            };
            assert_eq!(count, next[env.source], "sender {} out of order", env.source);
            next[env.source] += 1;
            got += 1;
        }
        thread::yield_now();
    }
    for s in senders {
        s.join().unwrap();
    }
    assert_eq!(next, [0, PER_SENDER, PER_SENDER, PER_SENDER]);
}

#[test]
fn curve_batches_arrive_whole_and_in_order() {
    let mut fabrics = local_cluster(2, 8);
    let receiver = fabrics.pop().unwrap();
    let sender = fabrics.pop().unwrap();
    let seeds = synthetic::seeds_in_domain(domain(2), 300, 0, 100);
    let expected: Vec<u64> = seeds.iter().map(|c| c.id).collect();

    let handle = thread::spawn(move || {
        // Small frames force each chunk across several batches.
        let mut t = Transport::new(sender, SPACE, 4, 2048).unwrap();
        for chunk in seeds.chunks(37) {
            t.send_curves(1, chunk, SerializeFlags::MIGRATE).unwrap();
        }
        while t.in_flight() > 0 {
            t.poll_completed_sends();
            thread::yield_now();
        }
    });

    let mut t = Transport::new(receiver, SPACE, 4, 2048).unwrap();
    let mut ids = Vec::new();
    while ids.len() < expected.len() {
        let batch: Vec<Curve> = t
            .receive_curves()
            .unwrap()
            .into_iter()
            .flat_map(|e| e.body)
            .collect();
        assert!(batch.iter().all(|c| c.sequence_cnt == 1 && c.path.is_empty()));
        ids.extend(batch.iter().map(|c| c.id));
        thread::yield_now();
    }
    handle.join().unwrap();
    assert_eq!(ids, expected);
}

#[test]
fn collectives_line_up_across_ranks() {
    let handles: Vec<_> = local_cluster(3, 8)
        .into_iter()
        .map(|f| {
            thread::spawn(move || {
                let mut t = Transport::new(f, SPACE, 2, 4096).unwrap();
                let members: Vec<usize> = (0..3).collect();
                t.barrier(&members);
                let mut v = vec![t.rank() as i64, 1];
                t.all_reduce_sum(&mut v);
                v
            })
        })
        .collect();
    for h in handles {
        assert_eq!(h.join().unwrap(), vec![3, 3]);
    }
}
