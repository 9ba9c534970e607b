//! Datagram sockets.
//!
//! Sends are paced by a next-allowed-send cursor derived from the egress
//! route's bottleneck bandwidth, and datagrams above the path MTU are
//! fragmented into MTU-sized pieces. Receives draw from a byte-capped
//! ingress queue; overflow is silently lossy, as datagrams are.

use crate::host::{Host, HostInner};
use crate::packet::{forward_packet, Packet, PacketKind, Sink, SinkForwarder};
use crate::queue::transmit_time;
use crate::sim::{Core, Timer};
use crate::{Error, Family};
use bytes::{BufMut, Bytes, BytesMut};
use std::cell::RefCell;
use std::cmp;
use std::collections::VecDeque;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::rc::{Rc, Weak};
use std::time::SystemTime;
use tracing::trace;

/// Default cap on buffered incoming datagram bytes.
const DEFAULT_RECEIVE_QUEUE: usize = 64 * 1024;

type RecvHandler = Box<dyn FnOnce(Result<(usize, SocketAddr), Error>, BytesMut)>;
type ReadyHandler = Box<dyn FnOnce(Result<(), Error>)>;

enum PendingRecv {
    Buffer { buf: BytesMut, handler: RecvHandler },
    Ready { handler: ReadyHandler },
}

pub(crate) struct UdpState {
    open: bool,
    is_v4: bool,
    non_blocking: bool,
    bound: Option<SocketAddr>,
    forwarder: Option<Rc<SinkForwarder>>,

    incoming: VecDeque<Packet>,
    queued_bytes: usize,
    max_receive_queue: usize,
    send_buffer_size: usize,
    reuse_address: bool,

    // The earliest time the next datagram may depart, advanced by the
    // serialization time of everything sent so far.
    next_send: SystemTime,

    recv: Option<PendingRecv>,
    send_ready: Option<ReadyHandler>,
    send_timer: Timer,
}

pub(crate) struct UdpInner {
    pub(crate) host: Rc<HostInner>,
    me: RefCell<Weak<UdpInner>>,
    state: RefCell<UdpState>,
}

fn unspecified(v4: bool) -> SocketAddr {
    if v4 {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    }
}

/// Pop one datagram off the queue into `write`, truncating to `space`.
fn take_datagram<F: FnMut(&[u8])>(
    st: &mut UdpState,
    space: usize,
    mut write: F,
) -> Result<(usize, SocketAddr), Error> {
    if !st.open {
        return Err(Error::BadDescriptor);
    }
    let Some(packet) = st.incoming.pop_front() else {
        return Err(Error::WouldBlock);
    };
    st.queued_bytes -= packet.payload.len();
    let n = cmp::min(space, packet.payload.len());
    write(&packet.payload[..n]);
    // Datagram semantics: bytes beyond the buffer are discarded.
    Ok((n, packet.from))
}

impl UdpInner {
    fn close(&self) {
        let core = &self.host.core;
        let (recv, send_ready) = {
            let mut st = self.state.borrow_mut();
            if let Some(ep) = st.bound.take() {
                core.unbind_udp(ep, self as *const UdpInner as *const ());
            }
            st.open = false;
            if let Some(forwarder) = st.forwarder.take() {
                forwarder.clear();
            }
            st.incoming.clear();
            st.queued_bytes = 0;
            st.send_timer.cancel();
            (st.recv.take(), st.send_ready.take())
        };
        abort_pending(core, recv, send_ready);
    }
}

fn abort_pending(core: &Rc<Core>, recv: Option<PendingRecv>, send_ready: Option<ReadyHandler>) {
    match recv {
        Some(PendingRecv::Buffer { buf, handler }) => {
            core.post(move || handler(Err(Error::OperationAborted), buf));
        }
        Some(PendingRecv::Ready { handler }) => {
            core.post(move || handler(Err(Error::OperationAborted)));
        }
        None => {}
    }
    if let Some(handler) = send_ready {
        core.post(move || handler(Err(Error::OperationAborted)));
    }
}

impl Sink for UdpInner {
    fn incoming_packet(&self, mut packet: Packet) {
        let pending = {
            let mut st = self.state.borrow_mut();
            if !st.open {
                trace!(reason = "socket closed", "dropping datagram");
                return;
            }
            if packet.kind != PacketKind::Payload {
                trace!(kind = ?packet.kind, "udp socket ignoring non-payload packet");
                return;
            }
            let len = packet.payload.len();
            if st.queued_bytes + len > st.max_receive_queue {
                // Datagram sockets are lossy on overflow.
                trace!(
                    len,
                    queued = st.queued_bytes,
                    reason = "receive queue full",
                    "dropping datagram",
                );
                drop(st);
                if let Some(dropped) = packet.drop_handler.take() {
                    dropped(packet);
                }
                return;
            }
            st.incoming.push_back(packet);
            st.queued_bytes += len;
            st.recv.take()
        };

        // Wake a suspended receive: consume inline, post the completion.
        match pending {
            None => {}
            Some(PendingRecv::Buffer { mut buf, handler }) => {
                let space = buf.capacity() - buf.len();
                let result = {
                    let mut st = self.state.borrow_mut();
                    take_datagram(&mut st, space, |chunk| buf.put_slice(chunk))
                };
                let core = &self.host.core;
                match result {
                    Err(Error::WouldBlock) => {
                        self.state.borrow_mut().recv = Some(PendingRecv::Buffer { buf, handler });
                    }
                    Err(err) => core.post(move || handler(Err(err), buf)),
                    Ok(ok) => core.post(move || handler(Ok(ok), buf)),
                }
            }
            Some(PendingRecv::Ready { handler }) => {
                self.host.core.post(move || handler(Ok(())));
            }
        }
    }

    fn label(&self) -> String {
        self.state
            .borrow()
            .bound
            .map(|ep| ep.ip().to_string())
            .unwrap_or_default()
    }
}

impl Drop for UdpInner {
    fn drop(&mut self) {
        self.close();
    }
}

/// A datagram socket with asynchronous, completion-handler operations.
///
/// Handles are cheap to clone and refer to the same socket, which closes
/// when the last handle is dropped.
#[derive(Clone)]
pub struct UdpSocket {
    inner: Rc<UdpInner>,
}

impl UdpSocket {
    pub fn new(host: &Host) -> Self {
        let inner = Rc::new(UdpInner {
            host: host.inner.clone(),
            me: RefCell::new(Weak::new()),
            state: RefCell::new(UdpState {
                open: false,
                is_v4: true,
                non_blocking: false,
                bound: None,
                forwarder: None,
                incoming: VecDeque::new(),
                queued_bytes: 0,
                max_receive_queue: DEFAULT_RECEIVE_QUEUE,
                send_buffer_size: 0,
                reuse_address: false,
                next_send: host.inner.core.now(),
                recv: None,
                send_ready: None,
                send_timer: Timer::with_core(host.inner.core.clone()),
            }),
        });
        *inner.me.borrow_mut() = Rc::downgrade(&inner);
        Self { inner }
    }

    /// Open the socket for the given address family. An open socket is
    /// closed and reset first.
    pub fn open(&self, family: Family) -> Result<(), Error> {
        self.inner.close();
        let mut st = self.inner.state.borrow_mut();
        st.open = true;
        st.is_v4 = family.is_v4();
        st.forwarder = Some(SinkForwarder::new(self.inner.me.borrow().clone()));
        st.next_send = self.inner.host.core.now();
        Ok(())
    }

    /// Bind to a local endpoint. The unspecified address selects one of
    /// the host's addresses; port zero draws an ephemeral port.
    pub fn bind(&self, ep: SocketAddr) -> Result<(), Error> {
        {
            let st = self.inner.state.borrow();
            if !st.open {
                return Err(Error::BadDescriptor);
            }
            if ep.is_ipv4() != st.is_v4 {
                return Err(Error::AddressFamilyNotSupported);
            }
        }
        let resolved = self.inner.host.resolve_bind_addr(ep)?;
        let bound = self
            .inner
            .host
            .core
            .bind_udp(resolved, self.inner.me.borrow().clone())?;
        self.inner.state.borrow_mut().bound = Some(bound);
        Ok(())
    }

    pub fn close(&self) {
        self.inner.close();
    }

    /// Abort pending receive and send-readiness operations with
    /// [`Error::OperationAborted`].
    pub fn cancel(&self) {
        let core = self.inner.host.core.clone();
        let (recv, send_ready) = {
            let mut st = self.inner.state.borrow_mut();
            st.send_timer.cancel();
            (st.recv.take(), st.send_ready.take())
        };
        abort_pending(&core, recv, send_ready);
    }

    pub fn is_open(&self) -> bool {
        self.inner.state.borrow().open
    }

    pub fn local_endpoint(&self) -> Result<SocketAddr, Error> {
        let st = self.inner.state.borrow();
        if !st.open {
            return Err(Error::BadDescriptor);
        }
        Ok(st.bound.unwrap_or_else(|| unspecified(st.is_v4)))
    }

    /// Send one datagram to `dst`. Datagrams above the path MTU are split
    /// into MTU-sized fragments, each carrying full overhead. Departures
    /// are paced by the egress route's bottleneck bandwidth; a send whose
    /// slot lies in the future departs via timer. Returns the payload size.
    pub fn send_to(&self, data: Bytes, dst: SocketAddr) -> Result<usize, Error> {
        // A fresh send supersedes a pending send-readiness wait.
        let previous = self.inner.state.borrow_mut().send_ready.take();
        if let Some(previous) = previous {
            self.inner
                .host
                .core
                .post(move || previous(Err(Error::OperationAborted)));
        }
        self.send_to_impl(data, dst)
    }

    /// Asynchronous [`UdpSocket::send_to`]; the completion carries the
    /// result immediately, as datagram sends do not suspend.
    pub fn async_send_to<F>(&self, data: Bytes, dst: SocketAddr, handler: F)
    where
        F: FnOnce(Result<usize, Error>) + 'static,
    {
        let result = self.send_to(data, dst);
        self.inner.host.core.post(move || handler(result));
    }

    fn send_to_impl(&self, data: Bytes, dst: SocketAddr) -> Result<usize, Error> {
        let core = self.inner.host.core.clone();
        {
            let st = self.inner.state.borrow();
            if !st.open {
                return Err(Error::BadDescriptor);
            }
            if dst.is_ipv4() != st.is_v4 {
                return Err(Error::AddressFamilyNotSupported);
            }
        }
        if self.inner.state.borrow().bound.is_none() {
            let v4 = self.inner.state.borrow().is_v4;
            self.bind(unspecified(v4))?;
        }
        let src = self.inner.state.borrow().bound.unwrap();

        // Compose the full path. A destination nobody is bound to swallows
        // the datagram, but the sender still pays for the transmission.
        let route = core.find_udp(dst).map(|dest| {
            let sim = self.inner.host.simulation();
            let mut route = self.inner.host.outgoing_route(src.ip());
            let net = core
                .config
                .borrow_mut()
                .channel_route(&sim, src.ip(), dst.ip());
            route.append(&net);
            route.append(&dest.host.incoming_route(dst.ip()));
            if let Some(forwarder) = dest.forwarder_sink() {
                route.push_back(forwarder);
            }
            route
        });
        if route.is_none() {
            trace!(%dst, reason = "no socket bound", "datagram will be lost");
        }

        let mtu = self.inner.host.path_mtu(src.ip(), dst.ip());
        let rate = self.inner.host.outgoing_route(src.ip()).transmit_rate();

        let mut fragments = Vec::new();
        if data.is_empty() {
            fragments.push(Bytes::new());
        } else {
            let mut offset = 0;
            while offset < data.len() {
                let n = cmp::min(mtu, data.len() - offset);
                fragments.push(data.slice(offset..offset + n));
                offset += n;
            }
        }

        let mut departures = Vec::new();
        {
            let mut st = self.inner.state.borrow_mut();
            let now = core.now();
            if st.next_send < now {
                st.next_send = now;
            }
            for payload in fragments {
                let wire = payload.len() + 20;
                let depart = st.next_send;
                st.next_send += transmit_time(wire, rate);
                let Some(route) = &route else { continue };
                let mut packet = Packet::new(PacketKind::Payload);
                packet.payload = payload;
                packet.from = src;
                packet.hops = route.clone();
                departures.push((depart, packet));
            }
        }

        let now = core.now();
        for (depart, packet) in departures {
            if depart <= now {
                forward_packet(packet);
            } else {
                core.schedule(depart, Box::new(move || forward_packet(packet)));
            }
        }
        Ok(data.len())
    }

    /// Synchronous non-blocking receive of one datagram. Returns the byte
    /// count and the sender's endpoint.
    pub fn receive_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), Error> {
        let core = self.inner.host.core.clone();
        let previous = self.inner.state.borrow_mut().recv.take();
        if let Some(previous) = previous {
            abort_pending(&core, Some(previous), None);
        }
        let mut st = self.inner.state.borrow_mut();
        let mut offset = 0;
        take_datagram(&mut st, buf.len(), |chunk| {
            buf[offset..offset + chunk.len()].copy_from_slice(chunk);
            offset += chunk.len();
        })
    }

    /// Receive one datagram into `buf`'s spare capacity. The completion
    /// carries the byte count, the sender, and the buffer.
    pub fn async_receive_from<F>(&self, mut buf: BytesMut, handler: F)
    where
        F: FnOnce(Result<(usize, SocketAddr), Error>, BytesMut) + 'static,
    {
        let core = self.inner.host.core.clone();
        let previous = self.inner.state.borrow_mut().recv.take();
        if let Some(previous) = previous {
            abort_pending(&core, Some(previous), None);
        }
        let space = buf.capacity() - buf.len();
        debug_assert!(space > 0, "receive buffer must have spare capacity");
        let result = {
            let mut st = self.inner.state.borrow_mut();
            take_datagram(&mut st, space, |chunk| buf.put_slice(chunk))
        };
        match result {
            Err(Error::WouldBlock) => {
                self.inner.state.borrow_mut().recv = Some(PendingRecv::Buffer {
                    buf,
                    handler: Box::new(handler),
                });
            }
            Err(err) => core.post(move || handler(Err(err), buf)),
            Ok(ok) => core.post(move || handler(Ok(ok), buf)),
        }
    }

    /// Complete as soon as a datagram can be received, without consuming
    /// it.
    pub fn async_receive_ready<F>(&self, handler: F)
    where
        F: FnOnce(Result<(), Error>) + 'static,
    {
        let core = self.inner.host.core.clone();
        let previous = self.inner.state.borrow_mut().recv.take();
        if let Some(previous) = previous {
            abort_pending(&core, Some(previous), None);
        }
        let mut st = self.inner.state.borrow_mut();
        if !st.open {
            drop(st);
            core.post(move || handler(Err(Error::BadDescriptor)));
        } else if !st.incoming.is_empty() {
            drop(st);
            core.post(move || handler(Ok(())));
        } else {
            st.recv = Some(PendingRecv::Ready {
                handler: Box::new(handler),
            });
        }
    }

    /// Complete as soon as the pacing cursor allows another send.
    pub fn async_send_ready<F>(&self, handler: F)
    where
        F: FnOnce(Result<(), Error>) + 'static,
    {
        let core = self.inner.host.core.clone();
        let previous = self.inner.state.borrow_mut().send_ready.take();
        if let Some(previous) = previous {
            core.post(move || previous(Err(Error::OperationAborted)));
        }
        let mut st = self.inner.state.borrow_mut();
        if !st.open {
            drop(st);
            core.post(move || handler(Err(Error::BadDescriptor)));
            return;
        }
        let now = core.now();
        if st.next_send <= now {
            drop(st);
            core.post(move || handler(Ok(())));
            return;
        }
        st.send_ready = Some(Box::new(handler));
        st.send_timer.expires_at(st.next_send);
        let me = self.inner.me.borrow().clone();
        st.send_timer.async_wait(move |result| {
            if result.is_err() {
                return;
            }
            let Some(inner) = me.upgrade() else { return };
            let handler = inner.state.borrow_mut().send_ready.take();
            if let Some(handler) = handler {
                handler(Ok(()));
            }
        });
    }

    pub fn set_non_blocking(&self, on: bool) {
        self.inner.state.borrow_mut().non_blocking = on;
    }

    pub fn non_blocking(&self) -> bool {
        self.inner.state.borrow().non_blocking
    }

    /// Cap, in bytes, on buffered incoming datagrams.
    pub fn set_receive_buffer_size(&self, bytes: usize) {
        self.inner.state.borrow_mut().max_receive_queue = bytes;
    }

    pub fn receive_buffer_size(&self) -> usize {
        self.inner.state.borrow().max_receive_queue
    }

    /// Advisory; stored but not applied.
    pub fn set_send_buffer_size(&self, bytes: usize) {
        self.inner.state.borrow_mut().send_buffer_size = bytes;
    }

    pub fn send_buffer_size(&self) -> usize {
        self.inner.state.borrow().send_buffer_size
    }

    /// Advisory; stored but not applied.
    pub fn set_reuse_address(&self, on: bool) {
        self.inner.state.borrow_mut().reuse_address = on;
    }

    pub fn reuse_address(&self) -> bool {
        self.inner.state.borrow().reuse_address
    }
}

impl UdpInner {
    pub(crate) fn forwarder_sink(&self) -> Option<Rc<dyn Sink>> {
        self.state
            .borrow()
            .forwarder
            .clone()
            .map(|f| f as Rc<dyn Sink>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DefaultConfig, Simulation};

    fn pair() -> (Simulation, UdpSocket, UdpSocket, SocketAddr) {
        let sim = Simulation::new(DefaultConfig::default());
        let a = Host::new(&sim, ["10.0.0.1".parse().unwrap()]);
        let b = Host::new(&sim, ["10.0.0.2".parse().unwrap()]);

        let sender = UdpSocket::new(&a);
        sender.open(Family::V4).unwrap();

        let receiver = UdpSocket::new(&b);
        receiver.open(Family::V4).unwrap();
        receiver.bind("10.0.0.2:9000".parse().unwrap()).unwrap();
        let dst = receiver.local_endpoint().unwrap();

        (sim, sender, receiver, dst)
    }

    #[test]
    fn datagram_round_trip() {
        let (sim, sender, receiver, dst) = pair();

        let got = Rc::new(RefCell::new(None));
        let observed = got.clone();
        receiver.async_receive_from(BytesMut::with_capacity(64), move |r, buf| {
            let (n, from) = r.expect("receive");
            *observed.borrow_mut() = Some((buf[..n].to_vec(), from));
        });

        sender
            .send_to(Bytes::from_static(b"ping"), dst)
            .expect("send");
        sim.run();

        let got = got.borrow();
        let (bytes, from) = got.as_ref().expect("datagram delivered");
        assert_eq!(bytes, b"ping");
        assert_eq!(*from, sender.local_endpoint().unwrap());
    }

    #[test]
    fn datagram_truncates_to_buffer() {
        let (sim, sender, receiver, dst) = pair();

        sender
            .send_to(Bytes::from_static(b"0123456789"), dst)
            .unwrap();
        sim.run();

        let mut buf = [0u8; 4];
        let (n, _) = receiver.receive_from(&mut buf).unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf, b"0123");
        // The rest of the datagram is gone.
        assert_eq!(receiver.receive_from(&mut buf), Err(Error::WouldBlock));
    }

    #[test]
    fn oversized_datagram_fragments() {
        let (sim, sender, receiver, dst) = pair();

        // Path MTU is 1475: 3000 bytes arrive as 1475 + 1475 + 50.
        let payload = vec![7u8; 3000];
        sender.send_to(Bytes::from(payload), dst).unwrap();
        sim.run();

        let mut sizes = Vec::new();
        let mut buf = [0u8; 2048];
        while let Ok((n, _)) = receiver.receive_from(&mut buf) {
            sizes.push(n);
        }
        assert_eq!(sizes, vec![1475, 1475, 50]);
    }

    #[test]
    fn receive_queue_overflow_is_lossy() {
        let (sim, sender, receiver, dst) = pair();
        receiver.set_receive_buffer_size(1000);

        for _ in 0..3 {
            sender.send_to(Bytes::from(vec![1u8; 600]), dst).unwrap();
        }
        sim.run();

        // Only one 600-byte datagram fits under the 1000-byte cap.
        let mut buf = [0u8; 1024];
        assert!(receiver.receive_from(&mut buf).is_ok());
        assert_eq!(receiver.receive_from(&mut buf), Err(Error::WouldBlock));
    }

    #[test]
    fn send_to_unbound_destination_is_lost() {
        let (sim, sender, _receiver, _dst) = pair();
        let n = sender
            .send_to(Bytes::from_static(b"void"), "10.0.0.9:1".parse().unwrap())
            .expect("send succeeds");
        assert_eq!(n, 4);
        sim.run();
    }

    #[test]
    fn send_pacing_advances_cursor() {
        let (sim, sender, _receiver, dst) = pair();

        // Egress modem runs at 1 MB/s; two 1000-byte datagrams occupy the
        // cursor for roughly two milliseconds.
        sender.send_to(Bytes::from(vec![0u8; 1000]), dst).unwrap();
        sender.send_to(Bytes::from(vec![0u8; 1000]), dst).unwrap();

        let ready_at = Rc::new(RefCell::new(None));
        let observed = ready_at.clone();
        let sim2 = sim.clone();
        sender.async_send_ready(move |r| {
            r.expect("send ready");
            *observed.borrow_mut() = Some(sim2.now());
        });
        sim.run();

        let at = ready_at.borrow().expect("readiness fired");
        assert!(at > std::time::UNIX_EPOCH);
    }

    #[test]
    fn receive_ready_does_not_consume() {
        let (sim, sender, receiver, dst) = pair();

        let ready = Rc::new(std::cell::Cell::new(false));
        let observed = ready.clone();
        receiver.async_receive_ready(move |r| {
            r.expect("ready");
            observed.set(true);
        });

        sender.send_to(Bytes::from_static(b"x"), dst).unwrap();
        sim.run();

        assert!(ready.get());
        let mut buf = [0u8; 8];
        let (n, _) = receiver.receive_from(&mut buf).unwrap();
        assert_eq!(n, 1);
    }
}
