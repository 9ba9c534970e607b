//! TCP-like stream transport: channels, stream sockets and acceptors.
//!
//! Connections are modeled with a three-way handshake, MSS-sized
//! segmentation, per-segment acknowledgments, a congestion window with
//! additive increase and halve-on-drop, and a reorder buffer that restores
//! sequence order before bytes reach the application. Reads and writes are
//! linked to the transport through backpressure: a write suspends when the
//! window is full and resumes on acknowledgment, a read suspends on an
//! empty queue and resumes on arrival.

use crate::host::{Host, HostInner};
use crate::packet::{forward_packet, Packet, PacketKind, Route, Sink, SinkForwarder};
use crate::sim::{Core, TcpBinding, Timer, REFUSE_LATENCY};
use crate::{Error, Family};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::cell::RefCell;
use std::cmp;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::rc::{Rc, Weak};
use tracing::trace;

/// Default segment size, replaced by the path MTU at connect time.
const DEFAULT_MSS: usize = 1475;

fn unspecified(v4: bool) -> SocketAddr {
    if v4 {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    }
}

/// Shared state of one TCP connection.
///
/// Both endpoints hold the channel. `hops[i]` is the path a packet takes to
/// reach endpoint `i`; index 0 is the side that sent the initial SYN.
/// `hops[1]` initially ends at the acceptor and is patched onto the
/// accepted socket when the connection is handed off.
pub struct Channel {
    pub(crate) hops: [Route; 2],
    pub(crate) ep: [SocketAddr; 2],
}

impl Channel {
    /// The two endpoints of the channel; index 0 initiated the connection.
    pub fn endpoints(&self) -> [SocketAddr; 2] {
        self.ep
    }

    /// The index of the peer of the endpoint bound to `me`.
    pub(crate) fn remote_idx(&self, me: SocketAddr) -> usize {
        if self.ep[0] == me {
            1
        } else if self.ep[1] == me {
            0
        } else {
            debug_assert!(false, "socket is not an endpoint of this channel");
            0
        }
    }
}

type ReadHandler = Box<dyn FnOnce(Result<usize, Error>, BytesMut)>;
type ReadyHandler = Box<dyn FnOnce(Result<(), Error>)>;
type WriteHandler = Box<dyn FnOnce(Result<usize, Error>)>;
type ConnectHandler = Box<dyn FnOnce(Result<(), Error>)>;
type AcceptHandler = Box<dyn FnOnce(Result<SocketAddr, Error>)>;

enum PendingRead {
    /// `async_read_some`: fill the buffer, hand it back with the count.
    Buffer { buf: BytesMut, handler: ReadHandler },
    /// `async_read_ready`: complete as soon as data (or an error) is
    /// available, without consuming anything.
    Ready { handler: ReadyHandler },
}

struct PendingWrite {
    data: Bytes,
    handler: WriteHandler,
}

pub(crate) struct TcpState {
    open: bool,
    is_v4: bool,
    non_blocking: bool,
    bound: Option<SocketAddr>,
    forwarder: Option<Rc<SinkForwarder>>,
    channel: Option<Rc<RefCell<Channel>>>,

    mss: usize,
    cwnd: usize,
    bytes_in_flight: usize,
    next_outgoing_seq: u64,
    next_incoming_seq: u64,
    // Sequence of the segment that last halved the window; halving is
    // applied at most once per window's worth of packets.
    last_drop_seq: u64,

    // Out-of-order arrivals, held until the gap before them fills.
    reorder: BTreeMap<u64, Packet>,
    // Size of each unacknowledged segment, by sequence number.
    outstanding: HashMap<u64, usize>,
    // Dropped segments awaiting retransmission.
    retransmit: VecDeque<Packet>,
    // In-order payload and error packets awaiting consumption.
    incoming: VecDeque<Packet>,
    queued_bytes: usize,

    max_receive_queue: usize,
    send_buffer_size: usize,
    reuse_address: bool,

    recv: Option<PendingRead>,
    send: Option<PendingWrite>,
    connect: Option<ConnectHandler>,
    connect_timer: Timer,
}

impl TcpState {
    fn new(connect_timer: Timer) -> Self {
        Self {
            open: false,
            is_v4: true,
            non_blocking: false,
            bound: None,
            forwarder: None,
            channel: None,
            mss: DEFAULT_MSS,
            cwnd: 2 * DEFAULT_MSS,
            bytes_in_flight: 0,
            next_outgoing_seq: 0,
            next_incoming_seq: 0,
            last_drop_seq: 0,
            reorder: BTreeMap::new(),
            outstanding: HashMap::new(),
            retransmit: VecDeque::new(),
            incoming: VecDeque::new(),
            queued_bytes: 0,
            max_receive_queue: 64 * 1024,
            send_buffer_size: 0,
            reuse_address: false,
            recv: None,
            send: None,
            connect: None,
            connect_timer,
        }
    }
}

pub(crate) struct TcpInner {
    pub(crate) host: Rc<HostInner>,
    me: RefCell<Weak<TcpInner>>,
    state: RefCell<TcpState>,
}

fn available_in(st: &TcpState) -> Result<usize, Error> {
    if !st.open {
        return Err(Error::BadDescriptor);
    }
    if st.channel.is_none() {
        return Err(Error::NotConnected);
    }
    let mut total = 0;
    for packet in &st.incoming {
        match packet.kind {
            PacketKind::Error => {
                if total > 0 {
                    return Ok(total);
                }
                // The buffer is drained; surface the error.
                return Err(packet.err.unwrap_or(Error::Eof));
            }
            _ => total += packet.payload.len(),
        }
    }
    Ok(total)
}

/// Copy queued bytes out through `write`, up to `space` bytes, consuming
/// packets as they empty. An error packet at the head is surfaced only once
/// all bytes before it have been delivered.
fn read_into<F: FnMut(&[u8])>(
    st: &mut TcpState,
    mut space: usize,
    mut write: F,
) -> Result<usize, Error> {
    if !st.open {
        return Err(Error::BadDescriptor);
    }
    if st.channel.is_none() {
        return Err(Error::NotConnected);
    }
    if st.incoming.is_empty() {
        return Err(Error::WouldBlock);
    }

    let mut total = 0;
    while space > 0 {
        let Some(front) = st.incoming.front_mut() else { break };
        match front.kind {
            PacketKind::Error => {
                if total > 0 {
                    break;
                }
                let err = front.err.unwrap_or(Error::Eof);
                st.incoming.pop_front();
                st.channel = None;
                return Err(err);
            }
            PacketKind::Payload => {
                let n = cmp::min(space, front.payload.len());
                write(&front.payload[..n]);
                front.payload.advance(n);
                let emptied = front.payload.is_empty();
                st.queued_bytes -= n;
                total += n;
                space -= n;
                if emptied {
                    st.incoming.pop_front();
                }
            }
            _ => {
                debug_assert!(false, "unexpected packet kind in incoming queue");
                st.incoming.pop_front();
            }
        }
    }
    Ok(total)
}

/// A drop callback bound to the socket and channel the segment was sent
/// on. Drops surfacing after the socket closed or reconnected are ignored.
fn drop_handler(
    socket: Weak<TcpInner>,
    channel: Weak<RefCell<Channel>>,
) -> Box<dyn FnOnce(Packet)> {
    Box::new(move |packet| {
        let Some(inner) = socket.upgrade() else { return };
        let Some(channel) = channel.upgrade() else { return };
        packet_dropped(&inner, &channel, packet);
    })
}

fn packet_dropped(inner: &TcpInner, channel: &Rc<RefCell<Channel>>, mut packet: Packet) {
    let mut st = inner.state.borrow_mut();
    let Some(current) = st.channel.clone() else { return };
    if !Rc::ptr_eq(&current, channel) {
        trace!(seq = packet.seq, "ignoring drop from a previous connection");
        return;
    }
    let Some(me) = st.bound else { return };

    let remote = current.borrow().remote_idx(me);
    packet.hops = current.borrow().hops[remote].clone();
    packet.drop_handler = Some(drop_handler(
        inner.me.borrow().clone(),
        Rc::downgrade(&current),
    ));

    let seq = packet.seq;
    let size = packet.payload.len();
    // The segment left the network; it is re-charged when retransmitted.
    if st.outstanding.remove(&seq).is_some() {
        st.bytes_in_flight = st.bytes_in_flight.saturating_sub(size);
    }
    st.retransmit.push_back(packet);
    trace!(seq, size, "segment dropped, queued for retransmission");

    // Halve the window at most once per round trip: a burst of drops from
    // the same window must not collapse it repeatedly.
    let window_packets = (st.cwnd / cmp::max(st.mss, 1)) as u64;
    if st.last_drop_seq > 0 && seq < st.last_drop_seq + window_packets {
        return;
    }
    st.cwnd = cmp::max(st.cwnd / 2, st.mss);
    st.last_drop_seq = seq;
}

/// Segment and send as much of `data` as the congestion window allows.
/// Returns `WouldBlock` if nothing fit; otherwise the number of bytes sent.
fn write_some_impl(inner: &TcpInner, data: &Bytes) -> Result<usize, Error> {
    let mut packets = Vec::new();
    let sent = {
        let mut st = inner.state.borrow_mut();
        if !st.open {
            return Err(Error::BadDescriptor);
        }
        let Some(channel) = st.channel.clone() else {
            return Err(Error::NotConnected);
        };
        let Some(me) = st.bound else {
            return Err(Error::NotConnected);
        };
        let remote = channel.borrow().remote_idx(me);
        let hops = channel.borrow().hops[remote].clone();
        if hops.is_empty() {
            return Err(Error::NotConnected);
        }
        if st.bytes_in_flight + st.mss > st.cwnd {
            // The window is full; wait for the receiver to acknowledge.
            return Err(Error::WouldBlock);
        }

        let mut sent = 0;
        while sent < data.len() {
            let n = cmp::min(st.mss, data.len() - sent);
            let mut packet = Packet::new(PacketKind::Payload);
            packet.payload = data.slice(sent..sent + n);
            packet.from = me;
            packet.overhead = 40;
            packet.hops = hops.clone();
            packet.seq = st.next_outgoing_seq;
            packet.drop_handler = Some(drop_handler(
                inner.me.borrow().clone(),
                Rc::downgrade(&channel),
            ));
            st.next_outgoing_seq += 1;
            st.bytes_in_flight += n;
            st.outstanding.insert(packet.seq, n);
            packets.push(packet);
            sent += n;
            if st.bytes_in_flight + st.mss > st.cwnd {
                break;
            }
        }
        sent
    };
    for packet in packets {
        forward_packet(packet);
    }
    Ok(sent)
}

fn wakeup_writer(inner: &TcpInner) {
    let pending = inner.state.borrow_mut().send.take();
    let Some(PendingWrite { data, handler }) = pending else { return };
    match write_some_impl(inner, &data) {
        Err(Error::WouldBlock) => {
            inner.state.borrow_mut().send = Some(PendingWrite { data, handler });
        }
        Err(err) => inner.host.core.post(move || handler(Err(err))),
        Ok(n) => inner.host.core.post(move || handler(Ok(n))),
    }
}

fn abort_read(core: &Rc<Core>, pending: PendingRead) {
    match pending {
        PendingRead::Buffer { buf, handler } => {
            core.post(move || handler(Err(Error::OperationAborted), buf));
        }
        PendingRead::Ready { handler } => {
            core.post(move || handler(Err(Error::OperationAborted)));
        }
    }
}

/// (Re-)open the socket with a fresh forwarder. Any previous incarnation
/// is closed first.
fn reopen(inner: &TcpInner, family: Family) {
    inner.close();
    let mut st = inner.state.borrow_mut();
    st.open = true;
    st.is_v4 = family.is_v4();
    st.forwarder = Some(SinkForwarder::new(inner.me.borrow().clone()));
}

/// Attach an accepted connection: open the socket, bind it to the
/// acceptor's endpoint, store the channel and redirect the channel's final
/// hop from the acceptor to this socket.
fn attach_accepted(inner: &TcpInner, bind_ep: SocketAddr, channel: &Rc<RefCell<Channel>>) {
    reopen(inner, Family::of(&bind_ep));
    let forwarder = {
        let mut st = inner.state.borrow_mut();
        st.bound = Some(bind_ep);
        st.channel = Some(channel.clone());
        let remote_ip = channel.borrow().ep[0].ip();
        st.mss = inner.host.path_mtu(bind_ep.ip(), remote_ip);
        st.cwnd = 2 * st.mss;
        st.forwarder.clone().unwrap()
    };
    channel.borrow_mut().hops[1].replace_last(forwarder);
}

impl TcpInner {
    fn close(&self) {
        let core = &self.host.core;
        let mut aborted: Vec<Box<dyn FnOnce()>> = Vec::new();
        let mut eof = None;
        {
            let mut st = self.state.borrow_mut();
            if let Some(channel) = st.channel.take() {
                if let Some(me) = st.bound {
                    let remote = channel.borrow().remote_idx(me);
                    let hops = channel.borrow().hops[remote].clone();
                    // A pending connect means the channel still points at
                    // the acceptor; nobody is there to receive an EOF.
                    if !hops.is_empty() && st.connect.is_none() {
                        let mut packet = Packet::new(PacketKind::Error);
                        packet.err = Some(Error::Eof);
                        packet.from = me;
                        packet.overhead = 40;
                        packet.hops = hops;
                        packet.seq = st.next_outgoing_seq;
                        st.next_outgoing_seq += 1;
                        eof = Some(packet);
                    }
                }
            }
            if let Some(ep) = st.bound.take() {
                core.unbind_tcp(ep, self as *const TcpInner as *const ());
            }
            st.open = false;
            if let Some(forwarder) = st.forwarder.take() {
                forwarder.clear();
            }
            st.next_incoming_seq = 0;
            st.next_outgoing_seq = 0;
            st.last_drop_seq = 0;
            st.bytes_in_flight = 0;
            st.cwnd = 2 * st.mss;
            st.outstanding.clear();
            st.retransmit.clear();
            st.reorder.clear();
            st.incoming.clear();
            st.queued_bytes = 0;
            if let Some(pending) = st.recv.take() {
                aborted.push(match pending {
                    PendingRead::Buffer { buf, handler } => Box::new(move || {
                        handler(Err(Error::OperationAborted), buf)
                    })
                        as Box<dyn FnOnce()>,
                    PendingRead::Ready { handler } => {
                        Box::new(move || handler(Err(Error::OperationAborted)))
                    }
                });
            }
            if let Some(PendingWrite { handler, .. }) = st.send.take() {
                aborted.push(Box::new(move || handler(Err(Error::OperationAborted))));
            }
            if let Some(handler) = st.connect.take() {
                aborted.push(Box::new(move || handler(Err(Error::OperationAborted))));
            }
        }
        for f in aborted {
            core.post(f);
        }
        if let Some(packet) = eof {
            forward_packet(packet);
        }
    }

    fn handle_ack(&self, packet: Packet) {
        let (resend, wake) = {
            let mut st = self.state.borrow_mut();
            let was_blocked = st.bytes_in_flight + st.mss > st.cwnd;
            let Some(size) = st.outstanding.remove(&packet.seq) else {
                trace!(seq = packet.seq, "acknowledgment for unknown segment");
                return;
            };
            st.bytes_in_flight = st.bytes_in_flight.saturating_sub(size);

            // Retransmit dropped segments that now fit in the window.
            let mut resend = Vec::new();
            loop {
                let fits = match st.retransmit.front() {
                    Some(front) => st.bytes_in_flight + front.payload.len() <= st.cwnd,
                    None => false,
                };
                if !fits {
                    break;
                }
                let pkt = st.retransmit.pop_front().unwrap();
                st.bytes_in_flight += pkt.payload.len();
                st.outstanding.insert(pkt.seq, pkt.payload.len());
                resend.push(pkt);
            }

            // Additive increase: one MSS per round trip's worth of
            // acknowledged bytes.
            if st.cwnd > 0 {
                st.cwnd += st.mss * size / st.cwnd;
            }

            let unblocked = st.bytes_in_flight + st.mss <= st.cwnd;
            (resend, was_blocked && unblocked)
        };
        for pkt in resend {
            forward_packet(pkt);
        }
        if wake {
            wakeup_writer(self);
        }
    }

    fn complete_connect(&self) {
        let handler = self.state.borrow_mut().connect.take();
        match handler {
            Some(handler) => self.host.core.post(move || handler(Ok(()))),
            None => trace!("unexpected SYN+ACK"),
        }
    }

    /// A SYN reached a socket that is not listening: answer with an
    /// explicit refusal so the initiator fails fast instead of timing out.
    fn refuse_syn(&self, packet: Packet) {
        let Some(channel) = packet.channel else { return };
        trace!("stream socket refusing incoming SYN");
        let mut refusal = Packet::new(PacketKind::Error);
        refusal.err = Some(Error::ConnectionRefused);
        refusal.overhead = 40;
        refusal.hops = channel.borrow().hops[0].clone();
        forward_packet(refusal);
    }

    fn handle_data(&self, packet: Packet) {
        // A refusal racing the handshake completes the pending connect
        // instead of being queued as stream data.
        if packet.kind == PacketKind::Error {
            let handler = {
                let mut st = self.state.borrow_mut();
                if st.connect.is_some() {
                    st.channel = None;
                    st.connect.take()
                } else {
                    None
                }
            };
            if let Some(handler) = handler {
                let err = packet.err.unwrap_or(Error::ConnectionRefused);
                self.host.core.post(move || handler(Err(err)));
                return;
            }
        }

        let (ack, pending) = {
            let mut st = self.state.borrow_mut();
            let Some(channel) = st.channel.clone() else {
                trace!(seq = packet.seq, "data for a torn-down channel");
                return;
            };
            let me = st.bound.unwrap_or_else(|| unspecified(st.is_v4));
            let remote = channel.borrow().remote_idx(me);

            // Every payload or error is acknowledged immediately with the
            // same sequence number, whether or not it is in order.
            let mut ack = Packet::new(PacketKind::Ack);
            ack.seq = packet.seq;
            ack.from = me;
            ack.hops = channel.borrow().hops[remote].clone();

            if packet.seq != st.next_incoming_seq {
                if packet.seq < st.next_incoming_seq {
                    trace!(
                        seq = packet.seq,
                        expected = st.next_incoming_seq,
                        "discarding duplicate segment",
                    );
                } else {
                    st.reorder.insert(packet.seq, packet);
                }
                drop(st);
                forward_packet(ack);
                return;
            }

            st.next_incoming_seq += 1;
            st.queued_bytes += packet.payload.len();
            st.incoming.push_back(packet);

            // Drain any contiguous run that was waiting on this segment.
            loop {
                let next = st.next_incoming_seq;
                match st.reorder.remove(&next) {
                    Some(pkt) => {
                        st.queued_bytes += pkt.payload.len();
                        st.incoming.push_back(pkt);
                        st.next_incoming_seq += 1;
                    }
                    None => break,
                }
            }

            (ack, st.recv.take())
        };
        forward_packet(ack);
        self.finish_read(pending);
    }

    /// Resume a suspended read now that data (or an error) arrived. The
    /// read itself happens inline; only the completion goes through the
    /// dispatch queue.
    fn finish_read(&self, pending: Option<PendingRead>) {
        let core = &self.host.core;
        match pending {
            None => {}
            Some(PendingRead::Buffer { mut buf, handler }) => {
                let space = buf.capacity() - buf.len();
                let result = {
                    let mut st = self.state.borrow_mut();
                    read_into(&mut st, space, |chunk| buf.put_slice(chunk))
                };
                match result {
                    Err(Error::WouldBlock) => {
                        self.state.borrow_mut().recv =
                            Some(PendingRead::Buffer { buf, handler });
                    }
                    Err(err) => core.post(move || handler(Err(err), buf)),
                    Ok(n) => core.post(move || handler(Ok(n), buf)),
                }
            }
            Some(PendingRead::Ready { handler }) => {
                let available = available_in(&self.state.borrow());
                match available {
                    Ok(0) => {
                        self.state.borrow_mut().recv = Some(PendingRead::Ready { handler });
                    }
                    Ok(_) => core.post(move || handler(Ok(()))),
                    Err(err) => core.post(move || handler(Err(err))),
                }
            }
        }
    }
}

impl Sink for TcpInner {
    fn incoming_packet(&self, packet: Packet) {
        match packet.kind {
            PacketKind::Ack => self.handle_ack(packet),
            PacketKind::Syn => self.refuse_syn(packet),
            PacketKind::SynAck => self.complete_connect(),
            PacketKind::Error | PacketKind::Payload => self.handle_data(packet),
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

impl Drop for TcpInner {
    fn drop(&mut self) {
        self.close();
    }
}

/// Connect a bound socket to a listening endpoint: allocate the channel,
/// build both routes and send the SYN. Fails with `ConnectionRefused` if
/// nothing is listening at `target`.
fn internal_connect(
    core: &Rc<Core>,
    initiator: &TcpInner,
    target: SocketAddr,
) -> Result<Rc<RefCell<Channel>>, Error> {
    let binding = core.tcp_binds.borrow().get(&target).cloned();
    let acceptor = match binding {
        Some(TcpBinding::Listener(weak)) => weak.upgrade().ok_or(Error::ConnectionRefused)?,
        _ => return Err(Error::ConnectionRefused),
    };
    if !acceptor.is_listening() {
        return Err(Error::ConnectionRefused);
    }

    let local = initiator.state.borrow().bound.ok_or(Error::NotConnected)?;
    let init_forwarder = initiator
        .state
        .borrow()
        .forwarder
        .clone()
        .ok_or(Error::BadDescriptor)?;
    let acc_forwarder = acceptor.forwarder_sink().ok_or(Error::ConnectionRefused)?;
    let sim = initiator.host.simulation();

    let mut to_acceptor = initiator.host.outgoing_route(local.ip());
    let net = core
        .config
        .borrow_mut()
        .channel_route(&sim, local.ip(), target.ip());
    to_acceptor.append(&net);
    to_acceptor.append(&acceptor.host.incoming_route(target.ip()));
    to_acceptor.push_back(acc_forwarder);

    let mut to_initiator = acceptor.host.outgoing_route(target.ip());
    let net = core
        .config
        .borrow_mut()
        .channel_route(&sim, target.ip(), local.ip());
    to_initiator.append(&net);
    to_initiator.append(&initiator.host.incoming_route(local.ip()));
    to_initiator.push_back(init_forwarder);

    let channel = Rc::new(RefCell::new(Channel {
        hops: [to_initiator, to_acceptor],
        ep: [local, target],
    }));

    let mut syn = Packet::new(PacketKind::Syn);
    syn.from = local;
    syn.overhead = 40;
    syn.hops = channel.borrow().hops[1].clone();
    syn.channel = Some(channel.clone());
    forward_packet(syn);

    Ok(channel)
}

/// A stream socket with asynchronous, completion-handler operations.
///
/// Handles are cheap to clone and refer to the same socket. The socket
/// closes when the last handle is dropped, sending an in-band EOF to a
/// connected peer.
#[derive(Clone)]
pub struct TcpSocket {
    pub(crate) inner: Rc<TcpInner>,
}

impl TcpSocket {
    pub fn new(host: &Host) -> Self {
        let inner = Rc::new(TcpInner {
            host: host.inner.clone(),
            me: RefCell::new(Weak::new()),
            state: RefCell::new(TcpState::new(Timer::with_core(host.inner.core.clone()))),
        });
        *inner.me.borrow_mut() = Rc::downgrade(&inner);
        Self { inner }
    }

    /// Open the socket for the given address family. An open socket is
    /// closed and reset first.
    pub fn open(&self, family: Family) -> Result<(), Error> {
        reopen(&self.inner, family);
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
            .bind_tcp(resolved, TcpBinding::Stream(self.inner.me.borrow().clone()))?;
        self.inner.state.borrow_mut().bound = Some(bound);
        Ok(())
    }

    /// Close the socket: send an in-band EOF to a connected peer, release
    /// the local endpoint and abort all pending operations.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Abort pending read, write and connect operations with
    /// [`Error::OperationAborted`].
    pub fn cancel(&self) {
        let core = self.inner.host.core.clone();
        let (recv, send, connect) = {
            let mut st = self.inner.state.borrow_mut();
            (st.recv.take(), st.send.take(), st.connect.take())
        };
        if let Some(pending) = recv {
            abort_read(&core, pending);
        }
        if let Some(PendingWrite { handler, .. }) = send {
            core.post(move || handler(Err(Error::OperationAborted)));
        }
        if let Some(handler) = connect {
            core.post(move || handler(Err(Error::OperationAborted)));
        }
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

    pub fn remote_endpoint(&self) -> Result<SocketAddr, Error> {
        let st = self.inner.state.borrow();
        if !st.open {
            return Err(Error::BadDescriptor);
        }
        let channel = st.channel.as_ref().ok_or(Error::NotConnected)?;
        let me = st.bound.unwrap_or_else(|| unspecified(st.is_v4));
        let channel = channel.borrow();
        Ok(channel.ep[channel.remote_idx(me)])
    }

    /// Bytes that can be read without suspending: the run of payload bytes
    /// before the first queued error. If an error leads the queue, it is
    /// returned instead.
    pub fn available(&self) -> Result<usize, Error> {
        available_in(&self.inner.state.borrow())
    }

    /// Establish a connection to `target`. An unbound socket is bound to
    /// one of its host's addresses first. Connecting to an endpoint with
    /// no listener completes with [`Error::ConnectionRefused`] after an
    /// approximate round trip.
    pub fn async_connect<F>(&self, target: SocketAddr, handler: F)
    where
        F: FnOnce(Result<(), Error>) + 'static,
    {
        let core = self.inner.host.core.clone();
        if !self.inner.state.borrow().open {
            let _ = self.open(Family::of(&target));
        }
        let previous = self.inner.state.borrow_mut().connect.take();
        if let Some(previous) = previous {
            core.post(move || previous(Err(Error::OperationAborted)));
        }

        if self.inner.state.borrow().bound.is_none() {
            let ep = unspecified(target.is_ipv4());
            if let Err(err) = self.bind(ep) {
                core.post(move || handler(Err(err)));
                return;
            }
        }
        let local = self.inner.state.borrow().bound.unwrap();
        if local.is_ipv4() != target.is_ipv4() {
            core.post(move || handler(Err(Error::AddressFamilyNotSupported)));
            return;
        }

        match internal_connect(&core, &self.inner, target) {
            Ok(channel) => {
                let mut st = self.inner.state.borrow_mut();
                st.mss = self.inner.host.path_mtu(local.ip(), target.ip());
                st.cwnd = 2 * st.mss;
                st.channel = Some(channel);
                st.connect = Some(Box::new(handler));
                // The connect completes when the SYN+ACK arrives.
            }
            Err(err) => {
                let st = self.inner.state.borrow();
                st.connect_timer.expires_after(REFUSE_LATENCY);
                st.connect_timer.async_wait(move |_| handler(Err(err)));
            }
        }
    }

    /// Read into `buf`'s spare capacity. Completes with the byte count as
    /// soon as any data is available; suspends on an empty queue. The
    /// buffer travels through the completion handler.
    pub fn async_read_some<F>(&self, mut buf: BytesMut, handler: F)
    where
        F: FnOnce(Result<usize, Error>, BytesMut) + 'static,
    {
        let core = self.inner.host.core.clone();
        let previous = self.inner.state.borrow_mut().recv.take();
        if let Some(previous) = previous {
            abort_read(&core, previous);
        }
        let space = buf.capacity() - buf.len();
        debug_assert!(space > 0, "read buffer must have spare capacity");
        let result = {
            let mut st = self.inner.state.borrow_mut();
            read_into(&mut st, space, |chunk| buf.put_slice(chunk))
        };
        match result {
            Err(Error::WouldBlock) => {
                self.inner.state.borrow_mut().recv = Some(PendingRead::Buffer {
                    buf,
                    handler: Box::new(handler),
                });
            }
            Err(err) => core.post(move || handler(Err(err), buf)),
            Ok(n) => core.post(move || handler(Ok(n), buf)),
        }
    }

    /// Complete as soon as data can be read, without consuming any.
    pub fn async_read_ready<F>(&self, handler: F)
    where
        F: FnOnce(Result<(), Error>) + 'static,
    {
        let core = self.inner.host.core.clone();
        let previous = self.inner.state.borrow_mut().recv.take();
        if let Some(previous) = previous {
            abort_read(&core, previous);
        }
        let available = {
            let st = self.inner.state.borrow();
            available_in(&st)
        };
        match available {
            Ok(0) => {
                self.inner.state.borrow_mut().recv = Some(PendingRead::Ready {
                    handler: Box::new(handler),
                });
            }
            Ok(_) => core.post(move || handler(Ok(()))),
            Err(err) => core.post(move || handler(Err(err))),
        }
    }

    /// Synchronous non-blocking read.
    pub fn read_some(&self, buf: &mut [u8]) -> Result<usize, Error> {
        let mut st = self.inner.state.borrow_mut();
        debug_assert!(st.non_blocking, "blocking operations are not supported");
        let mut offset = 0;
        read_into(&mut st, buf.len(), |chunk| {
            buf[offset..offset + chunk.len()].copy_from_slice(chunk);
            offset += chunk.len();
        })
    }

    /// Write as much of `data` as the congestion window allows. Completes
    /// with the number of bytes accepted; suspends if the window is full.
    pub fn async_write_some<F>(&self, data: Bytes, handler: F)
    where
        F: FnOnce(Result<usize, Error>) + 'static,
    {
        let core = self.inner.host.core.clone();
        let previous = self.inner.state.borrow_mut().send.take();
        if let Some(PendingWrite { handler: previous, .. }) = previous {
            core.post(move || previous(Err(Error::OperationAborted)));
        }
        match write_some_impl(&self.inner, &data) {
            Err(Error::WouldBlock) => {
                self.inner.state.borrow_mut().send = Some(PendingWrite {
                    data,
                    handler: Box::new(handler),
                });
            }
            Err(err) => core.post(move || handler(Err(err))),
            Ok(n) => core.post(move || handler(Ok(n))),
        }
    }

    /// Synchronous non-blocking write.
    pub fn write_some(&self, data: &Bytes) -> Result<usize, Error> {
        debug_assert!(
            self.inner.state.borrow().non_blocking,
            "blocking operations are not supported"
        );
        write_some_impl(&self.inner, data)
    }

    pub fn set_non_blocking(&self, on: bool) {
        self.inner.state.borrow_mut().non_blocking = on;
    }

    pub fn non_blocking(&self) -> bool {
        self.inner.state.borrow().non_blocking
    }

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

struct PendingAccept {
    peer: TcpSocket,
    handler: AcceptHandler,
}

pub(crate) struct AcceptorState {
    open: bool,
    is_v4: bool,
    bound: Option<SocketAddr>,
    forwarder: Option<Rc<SinkForwarder>>,
    // `None` means not listening: connection attempts are refused.
    backlog: Option<usize>,
    // Established channels waiting for an accept call.
    pending: VecDeque<Rc<RefCell<Channel>>>,
    accept: Option<PendingAccept>,
}

pub(crate) struct AcceptorInner {
    pub(crate) host: Rc<HostInner>,
    me: RefCell<Weak<AcceptorInner>>,
    state: RefCell<AcceptorState>,
}

impl AcceptorInner {
    pub(crate) fn is_listening(&self) -> bool {
        let st = self.state.borrow();
        st.open && st.backlog.is_some()
    }

    pub(crate) fn forwarder_sink(&self) -> Option<Rc<dyn Sink>> {
        self.state
            .borrow()
            .forwarder
            .clone()
            .map(|f| f as Rc<dyn Sink>)
    }

    /// Hand the next established channel to a waiting accept call, if both
    /// are present. The hand-off is posted, never run inline.
    fn check_accept_queue(&self) {
        let core = self.host.core.clone();
        let mut st = self.state.borrow_mut();
        let Some(my_ep) = st.bound else { return };
        if st.accept.is_none() || st.pending.is_empty() {
            return;
        }
        let PendingAccept { peer, handler } = st.accept.take().unwrap();
        let channel = st.pending.pop_front().unwrap();
        drop(st);
        core.post(move || {
            let remote = channel.borrow().ep[0];
            attach_accepted(&peer.inner, my_ep, &channel);
            handler(Ok(remote));
        });
    }

    fn close(&self) {
        let core = &self.host.core;
        let aborted = {
            let mut st = self.state.borrow_mut();
            if let Some(ep) = st.bound.take() {
                core.unbind_tcp(ep, self as *const AcceptorInner as *const ());
            }
            st.open = false;
            st.backlog = None;
            st.pending.clear();
            if let Some(forwarder) = st.forwarder.take() {
                forwarder.clear();
            }
            st.accept.take()
        };
        if let Some(PendingAccept { handler, .. }) = aborted {
            core.post(move || handler(Err(Error::OperationAborted)));
        }
    }
}

impl Sink for AcceptorInner {
    fn incoming_packet(&self, packet: Packet) {
        if packet.kind != PacketKind::Syn {
            trace!(kind = ?packet.kind, "acceptor ignoring non-SYN packet");
            return;
        }
        let Some(channel) = packet.channel else { return };
        let (accepted, reply_hops, my_ep) = {
            let mut st = self.state.borrow_mut();
            let reply_hops = channel.borrow().hops[0].clone();
            let my_ep = st.bound.unwrap_or_else(|| unspecified(st.is_v4));
            let room = st
                .backlog
                .map_or(false, |limit| st.pending.len() < limit);
            let accepted = st.open && room;
            if accepted {
                st.pending.push_back(channel.clone());
            }
            (accepted, reply_hops, my_ep)
        };

        if !accepted {
            trace!(listener = %my_ep, reason = "not listening or backlog full", "refusing connection");
            let mut refusal = Packet::new(PacketKind::Error);
            refusal.err = Some(Error::ConnectionRefused);
            refusal.overhead = 40;
            refusal.from = my_ep;
            refusal.hops = reply_hops;
            forward_packet(refusal);
            return;
        }

        // Complete the handshake immediately; the initiator treats the
        // SYN+ACK as connection established.
        let mut syn_ack = Packet::new(PacketKind::SynAck);
        syn_ack.overhead = 40;
        syn_ack.from = my_ep;
        syn_ack.hops = reply_hops;
        forward_packet(syn_ack);

        self.check_accept_queue();
    }

    fn label(&self) -> String {
        self.state
            .borrow()
            .bound
            .map(|ep| format!("listen {ep}"))
            .unwrap_or_default()
    }
}

impl Drop for AcceptorInner {
    fn drop(&mut self) {
        self.close();
    }
}

/// A listening socket that accepts incoming TCP connections into a
/// caller-supplied [`TcpSocket`].
#[derive(Clone)]
pub struct TcpAcceptor {
    inner: Rc<AcceptorInner>,
}

impl TcpAcceptor {
    pub fn new(host: &Host) -> Self {
        let inner = Rc::new(AcceptorInner {
            host: host.inner.clone(),
            me: RefCell::new(Weak::new()),
            state: RefCell::new(AcceptorState {
                open: false,
                is_v4: true,
                bound: None,
                forwarder: None,
                backlog: None,
                pending: VecDeque::new(),
                accept: None,
            }),
        });
        *inner.me.borrow_mut() = Rc::downgrade(&inner);
        Self { inner }
    }

    pub fn open(&self, family: Family) -> Result<(), Error> {
        self.inner.close();
        let mut st = self.inner.state.borrow_mut();
        st.open = true;
        st.is_v4 = family.is_v4();
        st.forwarder = Some(SinkForwarder::new(self.inner.me.borrow().clone()));
        Ok(())
    }

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
        let bound = self.inner.host.core.bind_tcp(
            resolved,
            TcpBinding::Listener(self.inner.me.borrow().clone()),
        )?;
        self.inner.state.borrow_mut().bound = Some(bound);
        Ok(())
    }

    /// Start listening with the given backlog. Incoming connections beyond
    /// the backlog are refused.
    pub fn listen(&self, backlog: usize) -> Result<(), Error> {
        let mut st = self.inner.state.borrow_mut();
        if !st.open {
            return Err(Error::BadDescriptor);
        }
        st.backlog = Some(backlog);
        Ok(())
    }

    /// Accept the next incoming connection into `peer`. The completion
    /// carries the remote endpoint. If a connection is already queued, the
    /// completion is posted immediately.
    pub fn async_accept<F>(&self, peer: &TcpSocket, handler: F)
    where
        F: FnOnce(Result<SocketAddr, Error>) + 'static,
    {
        let core = self.inner.host.core.clone();
        {
            let mut st = self.inner.state.borrow_mut();
            if !st.open {
                drop(st);
                core.post(move || handler(Err(Error::BadDescriptor)));
                return;
            }
            if let Some(PendingAccept { handler: previous, .. }) = st.accept.take() {
                core.post(move || previous(Err(Error::OperationAborted)));
            }
            st.accept = Some(PendingAccept {
                peer: peer.clone(),
                handler: Box::new(handler),
            });
        }
        self.inner.check_accept_queue();
    }

    pub fn close(&self) {
        self.inner.close();
    }

    /// Abort a pending accept with [`Error::OperationAborted`].
    pub fn cancel(&self) {
        let pending = self.inner.state.borrow_mut().accept.take();
        if let Some(PendingAccept { handler, .. }) = pending {
            self.inner
                .host
                .core
                .post(move || handler(Err(Error::OperationAborted)));
        }
    }

    pub fn local_endpoint(&self) -> Result<SocketAddr, Error> {
        let st = self.inner.state.borrow();
        if !st.open {
            return Err(Error::BadDescriptor);
        }
        Ok(st.bound.unwrap_or_else(|| unspecified(st.is_v4)))
    }

    pub fn is_open(&self) -> bool {
        self.inner.state.borrow().open
    }
}
