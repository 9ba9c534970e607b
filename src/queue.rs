//! Link nodes: bandwidth- and latency-constrained queues, and NATs.

use crate::packet::{forward_packet, Packet, Sink};
use crate::sim::Core;
use crate::Simulation;
use std::cell::Cell;
use std::cmp;
use std::net::IpAddr;
use std::rc::Rc;
use std::time::{Duration, SystemTime};
use tracing::trace;

/// Serialization time for `bytes` at `rate` bytes per second, rounded up
/// to whole nanoseconds. Unlimited rate serializes instantly.
pub(crate) fn transmit_time(bytes: usize, rate: Option<u64>) -> Duration {
    match rate {
        Some(0) | None => Duration::ZERO,
        Some(rate) => {
            let nanos = (bytes as u128 * 1_000_000_000).div_ceil(rate as u128);
            Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
        }
    }
}

/// A forwarding node constrained by bandwidth, propagation delay and queue
/// capacity.
///
/// The queue keeps a single next-available-time cursor instead of an
/// explicit packet list: a packet arriving at `t` starts serializing at
/// `max(t, cursor)`, occupies the link for `wire_size / bandwidth`, and is
/// forwarded `propagation` later. The backlog implied by the cursor stands
/// in for queue occupancy when applying the drop policy. Acknowledgment and
/// error packets are always admitted.
pub struct Queue {
    core: Rc<Core>,
    bandwidth: Option<u64>,
    propagation: Duration,
    max_bytes: Option<usize>,
    label: String,
    next_free: Cell<SystemTime>,
}

impl Queue {
    /// Create a queue node. `bandwidth` is in bytes per second (`None`
    /// means unlimited), `max_bytes` bounds the backlog (`None` means
    /// unbounded).
    pub fn new(
        sim: &Simulation,
        bandwidth: Option<u64>,
        propagation: Duration,
        max_bytes: Option<usize>,
        label: impl Into<String>,
    ) -> Rc<Self> {
        Rc::new(Self {
            core: sim.core.clone(),
            bandwidth,
            propagation,
            max_bytes,
            label: label.into(),
            next_free: Cell::new(sim.core.now()),
        })
    }

    /// Bytes currently committed to the link, derived from how far the
    /// cursor sits in the future.
    fn backlog(&self, now: SystemTime) -> usize {
        let (Some(rate), Ok(ahead)) = (self.bandwidth, self.next_free.get().duration_since(now))
        else {
            return 0;
        };
        (ahead.as_nanos() * rate as u128 / 1_000_000_000) as usize
    }
}

impl Sink for Queue {
    fn incoming_packet(&self, mut packet: Packet) {
        let now = self.core.now();
        let size = packet.wire_size();

        if packet.ok_to_drop() {
            if let Some(max) = self.max_bytes {
                if self.backlog(now) + size > max {
                    trace!(
                        queue = %self.label,
                        size,
                        reason = "queue full",
                        "dropping packet",
                    );
                    if let Some(dropped) = packet.drop_handler.take() {
                        dropped(packet);
                    }
                    return;
                }
            }
        }

        let start = cmp::max(now, self.next_free.get());
        let done = start + transmit_time(size, self.bandwidth);
        self.next_free.set(done);
        self.core
            .schedule(done + self.propagation, Box::new(move || forward_packet(packet)));
    }

    fn label(&self) -> String {
        match self.bandwidth {
            Some(rate) => format!("{}\n{} kB/s", self.label, rate / 1000),
            None => self.label.clone(),
        }
    }

    fn transmit_rate(&self) -> Option<u64> {
        self.bandwidth
    }
}

/// A network address translator: rewrites the source address of every
/// packet passing through to its external address.
pub struct Nat {
    external: IpAddr,
}

impl Nat {
    pub fn new(external: IpAddr) -> Rc<Self> {
        Rc::new(Self { external })
    }
}

impl Sink for Nat {
    fn incoming_packet(&self, mut packet: Packet) {
        packet.from.set_ip(self.external);
        forward_packet(packet);
    }

    fn label(&self) -> String {
        format!("NAT\n{}", self.external)
    }

    fn attributes(&self) -> String {
        "shape=diamond".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{PacketKind, Route};
    use crate::{DefaultConfig, Simulation};
    use bytes::Bytes;
    use std::cell::RefCell;
    use std::time::UNIX_EPOCH;

    struct Capture {
        core: Rc<Core>,
        arrivals: RefCell<Vec<(SystemTime, Packet)>>,
    }

    impl Capture {
        fn new(sim: &Simulation) -> Rc<Self> {
            Rc::new(Self {
                core: sim.core.clone(),
                arrivals: RefCell::new(Vec::new()),
            })
        }
    }

    impl Sink for Capture {
        fn incoming_packet(&self, packet: Packet) {
            self.arrivals.borrow_mut().push((self.core.now(), packet));
        }

        fn label(&self) -> String {
            "capture".to_string()
        }
    }

    fn payload(bytes: usize, sink: Rc<dyn Sink>) -> Packet {
        let mut packet = Packet::new(PacketKind::Payload);
        packet.payload = Bytes::from(vec![0u8; bytes]);
        packet.hops = Route::single(sink);
        packet
    }

    #[test]
    fn transmit_time_rounds_up() {
        assert_eq!(transmit_time(100, Some(1000)), Duration::from_millis(100));
        assert_eq!(transmit_time(1, Some(3)), Duration::from_nanos(333_333_334));
        assert_eq!(transmit_time(1_000_000, None), Duration::ZERO);
    }

    #[test]
    fn serialization_and_propagation_delay() {
        let sim = Simulation::new(DefaultConfig::default());
        let capture = Capture::new(&sim);
        let queue = Queue::new(
            &sim,
            Some(1000),
            Duration::from_millis(10),
            None,
            "link",
        );

        // 80 payload bytes + 20 overhead = 100 bytes at 1000 B/s: 100 ms
        // of serialization, then 10 ms of propagation.
        queue.incoming_packet(payload(80, capture.clone()));
        sim.run();

        let arrivals = capture.arrivals.borrow();
        assert_eq!(arrivals.len(), 1);
        assert_eq!(arrivals[0].0, UNIX_EPOCH + Duration::from_millis(110));
    }

    #[test]
    fn back_to_back_packets_serialize_in_turn() {
        let sim = Simulation::new(DefaultConfig::default());
        let capture = Capture::new(&sim);
        let queue = Queue::new(&sim, Some(1000), Duration::ZERO, None, "link");

        queue.incoming_packet(payload(80, capture.clone()));
        queue.incoming_packet(payload(80, capture.clone()));
        sim.run();

        let arrivals = capture.arrivals.borrow();
        assert_eq!(arrivals.len(), 2);
        assert_eq!(arrivals[0].0, UNIX_EPOCH + Duration::from_millis(100));
        assert_eq!(arrivals[1].0, UNIX_EPOCH + Duration::from_millis(200));
    }

    #[test]
    fn overflow_drops_and_fires_drop_handler() {
        let sim = Simulation::new(DefaultConfig::default());
        let capture = Capture::new(&sim);
        let queue = Queue::new(&sim, Some(1000), Duration::ZERO, Some(150), "link");

        let dropped = Rc::new(RefCell::new(Vec::new()));
        queue.incoming_packet(payload(80, capture.clone()));

        let mut second = payload(80, capture.clone());
        second.seq = 7;
        let observed = dropped.clone();
        second.drop_handler = Some(Box::new(move |p| observed.borrow_mut().push(p.seq)));
        // 100 bytes of backlog plus another 100 exceeds the 150-byte cap.
        queue.incoming_packet(second);

        sim.run();
        assert_eq!(capture.arrivals.borrow().len(), 1);
        assert_eq!(*dropped.borrow(), vec![7]);
    }

    #[test]
    fn acks_and_errors_are_never_dropped() {
        let sim = Simulation::new(DefaultConfig::default());
        let capture = Capture::new(&sim);
        let queue = Queue::new(&sim, Some(1000), Duration::ZERO, Some(50), "link");

        queue.incoming_packet(payload(80, capture.clone()));
        for kind in [PacketKind::Ack, PacketKind::SynAck, PacketKind::Error] {
            let mut packet = Packet::new(kind);
            packet.hops = Route::single(capture.clone());
            queue.incoming_packet(packet);
        }
        sim.run();
        assert_eq!(capture.arrivals.borrow().len(), 4);
    }

    #[test]
    fn nat_rewrites_source_address() {
        let sim = Simulation::new(DefaultConfig::default());
        let capture = Capture::new(&sim);
        let nat = Nat::new("8.8.8.8".parse().unwrap());

        let mut packet = payload(10, capture.clone());
        packet.from = "192.168.0.2:1000".parse().unwrap();
        packet.hops.push_front(nat);
        crate::packet::forward_packet(packet);

        sim.run();
        let arrivals = capture.arrivals.borrow();
        assert_eq!(arrivals.len(), 1);
        assert_eq!(arrivals[0].1.from, "8.8.8.8:1000".parse().unwrap());
    }
}
