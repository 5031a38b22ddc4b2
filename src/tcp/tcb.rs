use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::config::Config;

use super::{Dual, Flags, Quad};

/*
                    RFC 9293 - S3.3.2 - Fig 5 (trimmed to what this core
                    implements: no CLOSE-WAIT/CLOSING dwell, since
                    half-closed connections beyond the linear FIN sequence
                    are out of scope; a peer FIN collapses straight to
                    LAST-ACK on our side)

        LISTEN --rcv SYN--> SYN_RECV --rcv ACK--> ESTABLISHED
          |                                           |  |
          | (active open)                     snd FIN |  | rcv FIN
          v                                            v  v
        SYN_SENT --rcv SYN,ACK--> ESTABLISHED   FIN_WAIT_1  LAST_ACK
                                                     |            |
                                          rcv ACK of FIN   rcv ACK of FIN
                                                     v            v
                                               FIN_WAIT_2      CLOSED
                                                     |
                                               rcv FIN
                                                     v
                                               TIME_WAIT --2MSL--> CLOSED
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Listen,
    SynSent,
    SynRecv,
    Established,
    FinWait1,
    FinWait2,
    TimeWait,
    LastAck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Active,
    Passive,
}

/*
                RFC 9293 - S3.3.1 - Fig 3

           1         2          3          4
      ----------|----------|----------|----------
             SND.UNA    SND.NXT    SND.UNA
                                  +SND.WND
*/
#[derive(Debug, Clone, Copy)]
pub struct SendSpace {
    pub iss: u32,
    pub una: u32,
    pub nxt: u32,
    pub wnd: u16,
}

/*
                RFC 9293 - S3.3.1 - Fig 4

                       1          2          3
                   ----------|----------|----------
                          RCV.NXT    RCV.NXT
                                    +RCV.WND
*/
#[derive(Debug, Clone, Copy)]
pub struct RecvSpace {
    pub irs: u32,
    pub nxt: u32,
    pub wnd: u16,
}

/// Parsed segment fields. Borrowed from the caller's packet buffer — the
/// core copies out of `payload` whenever it needs to retain bytes (into the
/// receive ring or the OFO buffer) rather than aliasing it.
#[derive(Debug, Clone, Copy)]
pub struct Cb<'a> {
    pub saddr: Ipv4Addr,
    pub daddr: Ipv4Addr,
    pub sport: u16,
    pub dport: u16,
    pub flags: Flags,
    pub seq: u32,
    pub seq_end: u32,
    pub ack: u32,
    pub rwnd: u16,
    pub payload: &'a [u8],
}

impl<'a> Cb<'a> {
    pub fn quad(&self) -> Quad {
        Quad {
            src: Dual {
                ipv4: self.saddr,
                port: self.sport,
            },
            dst: Dual {
                ipv4: self.daddr,
                port: self.dport,
            },
        }
    }

    pub fn pl_len(&self) -> usize {
        self.payload.len()
    }
}

/// An out-of-order, not-yet-deliverable segment. Kept in `seq` order,
/// strictly above `rcv_nxt`, pairwise non-overlapping. Only the payload
/// bytes are retained: a FIN arriving out of order and buffered here loses
/// its control bit, so a peer that closes before the reassembly gap fills
/// won't be noticed until it retransmits the FIN on its own.
#[derive(Debug, Clone)]
struct OfoEntry {
    seq: u32,
    seq_end: u32,
    payload: Vec<u8>,
}

/// An outbound segment still awaiting acknowledgement. Data segments don't
/// carry their own copy of the payload: it's recovered from `outgoing` by
/// offset from `snd_una`, which also means a retransmit always carries the
/// current `ack`/`wnd`, not the one in effect when it was first sent.
#[derive(Debug, Clone)]
struct SendEntry {
    seq: u32,
    seq_end: u32,
    flags: Flags,
}

impl SendEntry {
    fn data_len(&self) -> usize {
        let total = self.seq_end.wrapping_sub(self.seq) as usize;
        let control_byte = self.flags.contains(Flags::SYN) || self.flags.contains(Flags::FIN);
        total - if control_byte { 1 } else { 0 }
    }
}

/// A control packet the caller must hand to the packet emitter.
#[derive(Debug, Clone)]
pub struct Emission {
    pub flags: Flags,
    pub seq: u32,
    pub ack: u32,
    pub wnd: u16,
    pub payload: Vec<u8>,
}

/// An opaque blockable signal. Waking is edge-triggered: a woken waiter
/// re-checks its own predicate and either proceeds or re-blocks, so spurious
/// wakeups are harmless by construction.
#[derive(Debug, Clone)]
pub struct WaitCell {
    sleepers: Arc<AtomicUsize>,
    cvar: Arc<Condvar>,
}

impl WaitCell {
    pub fn new() -> Self {
        WaitCell {
            sleepers: Arc::new(AtomicUsize::new(0)),
            cvar: Arc::new(Condvar::new()),
        }
    }

    pub fn is_sleeping(&self) -> bool {
        self.sleepers.load(Ordering::Acquire) > 0
    }

    pub fn wake(&self) {
        self.cvar.notify_all();
    }

    pub fn wait<'m, T>(&self, guard: MutexGuard<'m, T>) -> MutexGuard<'m, T> {
        self.sleepers.fetch_add(1, Ordering::AcqRel);
        let guard = self.cvar.wait(guard).expect("manager mutex poisoned");
        self.sleepers.fetch_sub(1, Ordering::AcqRel);
        guard
    }

    pub fn wait_while<'m, T, P>(&self, guard: MutexGuard<'m, T>, pred: P) -> MutexGuard<'m, T>
    where
        P: FnMut(&mut T) -> bool,
    {
        self.sleepers.fetch_add(1, Ordering::AcqRel);
        let guard = self
            .cvar
            .wait_while(guard, pred)
            .expect("manager mutex poisoned");
        self.sleepers.fetch_sub(1, Ordering::AcqRel);
        guard
    }
}

impl Default for WaitCell {
    fn default() -> Self {
        Self::new()
    }
}

/// What the manager must do in response to a processed segment, beyond the
/// emissions and wakeups already returned alongside it.
#[derive(Debug)]
pub enum Action {
    Noop,
    /// A SYN in LISTEN produced this half-open child; hash it and append it
    /// to the parent's listen queue.
    NewChild(Tcb),
    /// SYN_RECV's completing ACK arrived: move from the listen queue to the
    /// parent's accept queue and mark ESTABLISHED (already done on `self`).
    Promote,
    /// Reached CLOSED: unhash from the 4-tuple table, and the bind table
    /// too if this connection has no parent.
    Close,
}

/// Accept wakeups aren't modeled here: `wait_accept` lives on the *parent*
/// listener, never on the child `Tcb` a `Wake` is returned alongside, so
/// `Action::Promote` itself is the signal the manager uses to wake the
/// listener's accept queue (see `segment_loop`).
#[derive(Debug, Default, Clone, Copy)]
pub struct Wake {
    pub recv: bool,
    pub send: bool,
    pub connect: bool,
}

impl Wake {
    fn merge(&mut self, other: Wake) {
        self.recv |= other.recv;
        self.send |= other.send;
        self.connect |= other.connect;
    }
}

#[derive(Debug)]
pub struct Tcb {
    pub quad: Quad,
    pub local_port: u16,
    pub kind: Kind,
    pub state: State,
    /// Handle to the listener this connection was spawned from, if any.
    pub parent: Option<u16>,

    pub snd: SendSpace,
    pub rcv: RecvSpace,
    pub mss: u16,

    send_buf: VecDeque<SendEntry>,
    rcv_ofo_buf: VecDeque<OfoEntry>,

    /// Bytes delivered to the application, in order.
    pub incoming: VecDeque<u8>,
    /// Bytes queued by the application, from `snd_una` onward (sent-unacked
    /// bytes followed by not-yet-sent bytes).
    pub outgoing: VecDeque<u8>,

    pub wait_connect: WaitCell,
    pub wait_send: WaitCell,
    pub wait_recv: WaitCell,

    write_closed: bool,
    read_closed: bool,

    retransmit_deadline: Option<Instant>,
    time_wait_deadline: Option<Instant>,

    config: Config,
}

impl Tcb {
    pub fn new_listen(local_port: u16, config: Config) -> Self {
        Tcb {
            quad: Quad {
                src: Dual {
                    ipv4: Ipv4Addr::UNSPECIFIED,
                    port: 0,
                },
                dst: Dual {
                    ipv4: Ipv4Addr::UNSPECIFIED,
                    port: local_port,
                },
            },
            local_port,
            kind: Kind::Passive,
            state: State::Listen,
            parent: None,
            snd: SendSpace {
                iss: 0,
                una: 0,
                nxt: 0,
                wnd: 0,
            },
            rcv: RecvSpace {
                irs: 0,
                nxt: 0,
                wnd: config.rcv_wnd,
            },
            mss: config.default_mss,
            send_buf: VecDeque::new(),
            rcv_ofo_buf: VecDeque::new(),
            incoming: VecDeque::new(),
            outgoing: VecDeque::new(),
            wait_connect: WaitCell::new(),
            wait_send: WaitCell::new(),
            wait_recv: WaitCell::new(),
            write_closed: false,
            read_closed: false,
            retransmit_deadline: None,
            time_wait_deadline: None,
            config,
        }
    }

    /// Builds the connection and the initial SYN together, the same way
    /// `on_segment_listen` hands back a child alongside its SYN|ACK — so the
    /// manager can put the SYN on the wire immediately instead of waiting
    /// for `on_tick` to find the retransmit deadline expired.
    pub fn new_active(quad: Quad, iss: u32, config: Config) -> (Self, Emission) {
        let mut tcb = Tcb {
            quad,
            local_port: quad.dst.port,
            kind: Kind::Active,
            state: State::SynSent,
            parent: None,
            snd: SendSpace {
                iss,
                una: iss,
                nxt: iss,
                wnd: 0,
            },
            rcv: RecvSpace {
                irs: 0,
                nxt: 0,
                wnd: config.rcv_wnd,
            },
            mss: config.default_mss,
            send_buf: VecDeque::new(),
            rcv_ofo_buf: VecDeque::new(),
            incoming: VecDeque::with_capacity(config.rcv_wnd as usize),
            outgoing: VecDeque::new(),
            wait_connect: WaitCell::new(),
            wait_send: WaitCell::new(),
            wait_recv: WaitCell::new(),
            write_closed: false,
            read_closed: false,
            retransmit_deadline: None,
            time_wait_deadline: None,
            config,
        };

        let entry = SendEntry {
            seq: iss,
            seq_end: iss.wrapping_add(1),
            flags: Flags::SYN,
        };
        let emission = tcb.emission_for(&entry);
        tcb.snd.nxt = entry.seq_end;
        tcb.retransmit_deadline = Some(Instant::now() + config.rto);
        tcb.send_buf.push_back(entry);

        (tcb, emission)
    }

    fn new_child(cb: &Cb, parent_port: u16, parent_snd_una: u32, iss: u32, config: Config) -> Self {
        Tcb {
            quad: cb.quad(),
            local_port: parent_port,
            kind: Kind::Passive,
            state: State::SynRecv,
            parent: Some(parent_port),
            snd: SendSpace {
                iss,
                una: parent_snd_una,
                nxt: iss,
                wnd: cb.rwnd,
            },
            rcv: RecvSpace {
                irs: cb.seq,
                nxt: cb.seq_end,
                wnd: config.rcv_wnd,
            },
            mss: config.default_mss,
            send_buf: VecDeque::new(),
            rcv_ofo_buf: VecDeque::new(),
            incoming: VecDeque::with_capacity(config.rcv_wnd as usize),
            outgoing: VecDeque::new(),
            wait_connect: WaitCell::new(),
            wait_send: WaitCell::new(),
            wait_recv: WaitCell::new(),
            write_closed: false,
            read_closed: false,
            retransmit_deadline: None,
            time_wait_deadline: None,
            config,
        }
    }

    pub fn is_outgoing_full(&self) -> bool {
        self.outgoing.len() >= self.config.rcv_wnd as usize
    }

    pub fn outgoing_remaining(&self) -> usize {
        (self.config.rcv_wnd as usize).saturating_sub(self.outgoing.len())
    }

    pub fn is_read_closed(&self) -> bool {
        self.read_closed
    }

    pub fn is_write_closed(&self) -> bool {
        self.write_closed
    }

    fn is_fin_acked(&self) -> bool {
        self.write_closed
            && self.snd.una == self.snd.nxt
            && !self.send_buf.iter().any(|e| e.flags.contains(Flags::FIN))
    }

    /// §4.1 validity test against the receive window.
    fn is_valid(&self, cb: &Cb) -> bool {
        let rcv_end = self.rcv.nxt.wrapping_add(std::cmp::max(self.rcv.wnd as u32, 1));
        seq_lt(cb.seq, rcv_end) && seq_le(self.rcv.nxt, cb.seq_end)
    }

    /// §4.2 peer window update. Returns whether `wait_send` should wake
    /// because the window just opened from zero.
    fn update_window(&mut self, cb: &Cb) -> bool {
        if !seq_le(self.snd.una, cb.ack) || !seq_le(cb.ack, self.snd.nxt) {
            return false;
        }
        let was_zero = self.snd.wnd == 0;
        self.snd.wnd = cb.rwnd;
        was_zero && self.snd.wnd > 0
    }

    /// §4.3 cumulative-ACK pop. Idempotent under duplicate ACKs: a duplicate
    /// finds no qualifying entry and exits immediately.
    fn pop_acked(&mut self, ack: u32) {
        while let Some(front) = self.send_buf.front() {
            if !seq_le(front.seq_end, ack) {
                break;
            }
            let entry = self.send_buf.pop_front().unwrap();
            self.outgoing.drain(..entry.data_len());
            self.snd.una = entry.seq_end;
        }

        self.retransmit_deadline = if self.send_buf.is_empty() {
            None
        } else {
            Some(Instant::now() + self.config.rto)
        };
    }

    fn ack_emission(&self) -> Emission {
        Emission {
            flags: Flags::ACK,
            seq: self.snd.nxt,
            ack: self.rcv.nxt,
            wnd: self.rcv.wnd,
            payload: Vec::new(),
        }
    }

    fn enter_time_wait(&mut self) {
        self.state = State::TimeWait;
        self.read_closed = true;
        self.arm_time_wait();
    }

    /// Queues our own FIN|ACK and moves to LAST_ACK, the response to a
    /// peer FIN while we're still ESTABLISHED.
    fn queue_own_fin(&mut self, emissions: &mut Vec<Emission>, wake: &mut Wake) {
        self.state = State::LastAck;
        self.write_closed = true;
        self.read_closed = true;
        let entry = SendEntry {
            seq: self.snd.nxt,
            seq_end: self.snd.nxt.wrapping_add(1),
            flags: Flags::FIN | Flags::ACK,
        };
        emissions.push(Emission {
            flags: entry.flags,
            seq: entry.seq,
            ack: self.rcv.nxt,
            wnd: self.rcv.wnd,
            payload: Vec::new(),
        });
        self.snd.nxt = entry.seq_end;
        if self.retransmit_deadline.is_none() {
            self.retransmit_deadline = Some(Instant::now() + self.config.rto);
        }
        self.send_buf.push_back(entry);
        self.arm_time_wait();
        wake.recv = true;
    }

    /// Reaction to a peer FIN landing in order: LAST_ACK from ESTABLISHED,
    /// or straight to TIME_WAIT from FIN_WAIT_2.
    fn handle_peer_fin(&mut self, emissions: &mut Vec<Emission>, wake: &mut Wake) {
        match self.state {
            State::Established => self.queue_own_fin(emissions, wake),
            State::FinWait2 => {
                self.enter_time_wait();
                emissions.push(self.ack_emission());
            }
            _ => {}
        }
    }

    fn arm_time_wait(&mut self) {
        self.time_wait_deadline = Some(Instant::now() + self.config.time_wait);
    }

    fn close_and_unhash(&mut self) {
        self.state = State::Closed;
    }

    /// §4.4 out-of-order insertion: sorted ascending, strictly above
    /// `rcv_nxt`, pairwise non-overlapping. A duplicate or overlapping
    /// newcomer is dropped, preferring whatever arrived first.
    fn insert_ofo(&mut self, cb: &Cb) {
        if self.rcv_ofo_buf.len() >= self.config.max_ofo_segments {
            warn!(quad = ?self.quad, "ofo buffer full, dropping segment");
            return;
        }

        let idx = self
            .rcv_ofo_buf
            .iter()
            .position(|e| seq_lt(cb.seq, e.seq))
            .unwrap_or(self.rcv_ofo_buf.len());

        let overlaps_prev =
            idx > 0 && seq_lt(cb.seq, self.rcv_ofo_buf[idx - 1].seq_end);
        let overlaps_next =
            idx < self.rcv_ofo_buf.len() && seq_lt(self.rcv_ofo_buf[idx].seq, cb.seq_end);

        if overlaps_prev || overlaps_next {
            trace!(quad = ?self.quad, seq = cb.seq, "dropping duplicate/overlapping ofo segment");
            return;
        }

        self.rcv_ofo_buf.insert(
            idx,
            OfoEntry {
                seq: cb.seq,
                seq_end: cb.seq_end,
                payload: cb.payload.to_vec(),
            },
        );
    }

    /// §4.4 PSH|ACK data path (steps 2-8).
    fn accept_data(&mut self, cb: &Cb, emissions: &mut Vec<Emission>, wake: &mut Wake) {
        let mut seq_end = self.rcv.nxt;

        if cb.seq == seq_end {
            self.incoming.extend(cb.payload.iter().copied());
            seq_end = cb.seq_end;

            while let Some(front) = self.rcv_ofo_buf.front() {
                if seq_lt(seq_end, front.seq) {
                    break;
                }
                let entry = self.rcv_ofo_buf.pop_front().unwrap();
                if seq_le(entry.seq_end, seq_end) {
                    // fully covered by bytes already placed above, discard
                    continue;
                }
                let overlap = seq_end.wrapping_sub(entry.seq) as usize;
                self.incoming.extend(entry.payload[overlap..].iter().copied());
                seq_end = entry.seq_end;
            }

            self.rcv.nxt = seq_end;
        } else if seq_lt(seq_end, cb.seq) {
            self.insert_ofo(cb);
        } else {
            trace!(quad = ?self.quad, seq = cb.seq, rcv_nxt = seq_end, "stale data segment dropped");
        }

        if self.wait_recv.is_sleeping() {
            wake.recv = true;
        }
        emissions.push(self.ack_emission());
        if self.wait_send.is_sleeping() {
            wake.send = true;
        }
    }

    /// Dispatch on `(cb.flags, self.state)` for every state except LISTEN
    /// and SYN_SENT, which have their own entry points below.
    fn dispatch(&mut self, cb: &Cb, emissions: &mut Vec<Emission>) -> (Action, Wake) {
        let mut wake = Wake::default();

        if cb.flags == Flags::ACK {
            match self.state {
                State::SynRecv => {
                    self.state = State::Established;
                    return (Action::Promote, wake);
                }
                State::Established => {
                    wake.send = true;
                }
                State::FinWait1 => {
                    self.state = State::FinWait2;
                }
                State::LastAck => {
                    self.close_and_unhash();
                    return (Action::Close, wake);
                }
                _ => {}
            }
            return (Action::Noop, wake);
        }

        if cb.flags == (Flags::PSH | Flags::ACK) {
            if self.state == State::SynRecv {
                self.state = State::Established;
            }
            self.accept_data(cb, emissions, &mut wake);
            return (Action::Noop, wake);
        }

        if cb.flags == (Flags::FIN | Flags::ACK) {
            if self.state == State::FinWait1 {
                self.enter_time_wait();
                emissions.push(self.ack_emission());
            } else if self.state == State::FinWait2 {
                // REDESIGN FLAG: the source only handled FIN|ACK in
                // FIN_WAIT_1; FIN_WAIT_2 gets the same treatment here.
                self.enter_time_wait();
                emissions.push(self.ack_emission());
            }
            return (Action::Noop, wake);
        }

        if cb.flags == Flags::FIN {
            self.handle_peer_fin(emissions, &mut wake);
            return (Action::Noop, wake);
        }

        // A peer that writes its last chunk and closes in the same packet
        // (common: curl/HTTP clients) sends PSH|FIN|ACK. Deliver the payload
        // (and the FIN's own sequence number, already folded into
        // `cb.seq_end` by the parser) through the same path as plain data,
        // then act on the FIN only once it has actually landed in order.
        if cb.flags == (Flags::PSH | Flags::FIN | Flags::ACK) {
            if self.state == State::SynRecv {
                self.state = State::Established;
            }
            self.accept_data(cb, emissions, &mut wake);
            if seq_le(cb.seq_end, self.rcv.nxt) {
                self.handle_peer_fin(emissions, &mut wake);
            }
            return (Action::Noop, wake);
        }

        debug!(quad = ?self.quad, flags = %cb.flags, state = ?self.state, "unhandled flag combination, dropping");
        (Action::Noop, wake)
    }

    fn on_segment_syn_sent(&mut self, cb: &Cb) -> (Action, Wake, Vec<Emission>) {
        let mut wake = Wake::default();
        let mut emissions = Vec::new();

        if cb.flags == (Flags::SYN | Flags::ACK) {
            if !(seq_lt(self.snd.una, cb.ack) && seq_le(cb.ack, self.snd.nxt)) {
                return (Action::Noop, wake, emissions);
            }

            self.rcv.irs = cb.seq;
            self.rcv.nxt = cb.seq_end;
            self.snd.una = cb.ack;
            self.snd.wnd = cb.rwnd;
            self.send_buf.clear();
            self.retransmit_deadline = None;
            self.state = State::Established;
            wake.connect = true;
            emissions.push(self.ack_emission());
            return (Action::Noop, wake, emissions);
        }

        (Action::Noop, wake, emissions)
    }

    /// `next_iss` is supplied by the caller (the manager owns the ISS
    /// clock/RNG) so the child's initial sequence number stays a pure
    /// function argument rather than a hidden source of entropy here.
    fn on_segment_listen(&self, cb: &Cb, next_iss: u32) -> (Action, Wake, Vec<Emission>) {
        let wake = Wake::default();

        if cb.flags.contains(Flags::ACK) {
            // Any ACK arriving in LISTEN is bad; reset it per RFC 9293 §3.10.7.2.
            return (
                Action::Noop,
                wake,
                vec![Emission {
                    flags: Flags::RST,
                    seq: cb.ack,
                    ack: 0,
                    wnd: 0,
                    payload: Vec::new(),
                }],
            );
        }

        if cb.flags == Flags::SYN {
            let mut child = Tcb::new_child(cb, self.local_port, self.snd.una, next_iss, self.config);

            let syn_ack = SendEntry {
                seq: child.snd.nxt,
                seq_end: child.snd.nxt.wrapping_add(1),
                flags: Flags::SYN | Flags::ACK,
            };
            let emission = Emission {
                flags: syn_ack.flags,
                seq: syn_ack.seq,
                ack: child.rcv.nxt,
                wnd: child.rcv.wnd,
                payload: Vec::new(),
            };
            child.snd.nxt = syn_ack.seq_end;
            child.retransmit_deadline = Some(Instant::now() + child.config.rto);
            child.send_buf.push_back(syn_ack);

            return (Action::NewChild(child), wake, vec![emission]);
        }

        (Action::Noop, wake, Vec::new())
    }

    /// The single entry point: `process_segment` from the spec.
    pub fn on_segment(&mut self, cb: &Cb, next_iss: u32) -> (Action, Wake, Vec<Emission>) {
        match self.state {
            State::Listen => return self.on_segment_listen(cb, next_iss),
            State::SynSent => return self.on_segment_syn_sent(cb),
            State::Closed => return (Action::Noop, Wake::default(), Vec::new()),
            _ => {}
        }

        // FIN/FIN|ACK consume a sequence number too, so a stale or
        // out-of-window retransmission must be window-checked the same way
        // data is, or it could force a close based on a delayed duplicate.
        let is_seq_bearing = cb.flags == (Flags::PSH | Flags::ACK)
            || cb.flags == (Flags::PSH | Flags::FIN | Flags::ACK)
            || cb.flags == Flags::FIN
            || cb.flags == (Flags::FIN | Flags::ACK);
        if is_seq_bearing && !self.is_valid(cb) {
            warn!(quad = ?self.quad, seq = cb.seq, seq_end = cb.seq_end, rcv_nxt = self.rcv.nxt, "segment outside receive window, dropping");
            return (Action::Noop, Wake::default(), vec![self.ack_emission()]);
        }

        // Pre-dispatch bookkeeping: advance rcv_nxt over SYN/FIN/ACK control
        // bytes, but only in order.
        // REDESIGN FLAG: the source advanced unconditionally, letting a
        // stale SYN/FIN retransmission rewind rcv_nxt.
        if !cb.flags.contains(Flags::PSH) && cb.seq == self.rcv.nxt {
            self.rcv.nxt = cb.seq_end;
        }

        let mut wake = Wake::default();
        // REDESIGN FLAG: gate the whole ACK-driven block on the ACK bit
        // actually being set, not the source's `flags | ACK` truism.
        if cb.flags.contains(Flags::ACK) {
            if self.update_window(cb) {
                wake.send = true;
            }
            self.pop_acked(cb.ack);
        }

        let mut emissions = Vec::new();
        let (action, dispatch_wake) = self.dispatch(cb, &mut emissions);
        wake.merge(dispatch_wake);

        (action, wake, emissions)
    }

    /// Application-initiated close: queue a FIN after anything already
    /// queued, and move to FIN_WAIT_1.
    pub fn close(&mut self) -> Vec<Emission> {
        let mut emissions = Vec::new();

        if self.state != State::Established {
            return emissions;
        }

        self.write_closed = true;
        self.state = State::FinWait1;
        self.segment_outgoing(&mut emissions);

        emissions
    }

    fn emission_for(&self, entry: &SendEntry) -> Emission {
        let offset = entry.seq.wrapping_sub(self.snd.una) as usize;
        let payload: Vec<u8> = self
            .outgoing
            .iter()
            .skip(offset)
            .take(entry.data_len())
            .copied()
            .collect();
        Emission {
            flags: entry.flags,
            seq: entry.seq,
            ack: self.rcv.nxt,
            wnd: self.rcv.wnd,
            payload,
        }
    }

    fn segment_outgoing(&mut self, emissions: &mut Vec<Emission>) {
        if self.write_closed && self.send_buf.iter().any(|e| e.flags.contains(Flags::FIN)) {
            return;
        }

        loop {
            if self.send_buf.len() >= self.config.send_buf_capacity {
                break;
            }

            let sent = self.snd.nxt.wrapping_sub(self.snd.una) as usize;
            let usable = (self.snd.wnd as usize).saturating_sub(sent);
            let available = self.outgoing.len().saturating_sub(sent);
            if usable == 0 || available == 0 {
                break;
            }

            let chunk = usable.min(available).min(self.mss as usize);
            let entry = SendEntry {
                seq: self.snd.nxt,
                seq_end: self.snd.nxt.wrapping_add(chunk as u32),
                flags: Flags::PSH | Flags::ACK,
            };
            let emission = self.emission_for(&entry);
            self.snd.nxt = entry.seq_end;
            if self.retransmit_deadline.is_none() {
                self.retransmit_deadline = Some(Instant::now() + self.config.rto);
            }
            self.send_buf.push_back(entry);
            emissions.push(emission);
        }

        // Every outgoing byte has been handed a SendEntry: the application
        // won't write any more (write_closed), so this is the moment, not
        // necessarily the moment close() was called, to queue the FIN. A
        // close() that can't flush everything in one window gets its FIN
        // appended here on whichever later on_tick call finally drains it.
        let sent = self.snd.nxt.wrapping_sub(self.snd.una) as usize;
        if self.write_closed && sent == self.outgoing.len() {
            let entry = SendEntry {
                seq: self.snd.nxt,
                seq_end: self.snd.nxt.wrapping_add(1),
                flags: Flags::FIN | Flags::ACK,
            };
            emissions.push(Emission {
                flags: entry.flags,
                seq: entry.seq,
                ack: self.rcv.nxt,
                wnd: self.rcv.wnd,
                payload: Vec::new(),
            });
            self.snd.nxt = entry.seq_end;
            if self.retransmit_deadline.is_none() {
                self.retransmit_deadline = Some(Instant::now() + self.config.rto);
            }
            self.send_buf.push_back(entry);
        }
    }

    /// Periodic tick: retransmit the oldest unacked segment past its
    /// deadline, segment any freshly-written application bytes, and expire
    /// TIME_WAIT. Returns the emissions produced and whether the connection
    /// should now be dropped from the manager's tables.
    pub fn on_tick(&mut self) -> (Vec<Emission>, bool) {
        let mut emissions = Vec::new();

        if let Some(deadline) = self.retransmit_deadline {
            if Instant::now() >= deadline {
                if let Some(entry) = self.send_buf.front().cloned() {
                    debug!(quad = ?self.quad, seq = entry.seq, "retransmitting");
                    emissions.push(self.emission_for(&entry));
                    self.retransmit_deadline = Some(Instant::now() + self.config.rto);
                } else {
                    self.retransmit_deadline = None;
                }
            }
        }

        let sent = self.snd.nxt.wrapping_sub(self.snd.una) as usize;
        if !self.write_closed || self.outgoing.len() > sent {
            self.segment_outgoing(&mut emissions);
        }

        if self.state == State::FinWait1 && self.is_fin_acked() {
            self.state = State::FinWait2;
        }

        let mut drop_conn = false;
        if let Some(deadline) = self.time_wait_deadline {
            if Instant::now() >= deadline {
                debug!(quad = ?self.quad, state = ?self.state, "time-wait expired");
                self.state = State::Closed;
                drop_conn = true;
            }
        }

        (emissions, drop_conn)
    }
}

/// `a < b` modulo 2^32, per RFC 1323: `(int32)(a - b) < 0`.
pub fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

pub fn seq_le(a: u32, b: u32) -> bool {
    a == b || seq_lt(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config::default()
    }

    fn quad() -> Quad {
        Quad {
            src: Dual {
                ipv4: "10.0.0.2".parse().unwrap(),
                port: 5000,
            },
            dst: Dual {
                ipv4: "10.0.0.1".parse().unwrap(),
                port: 80,
            },
        }
    }

    fn cb<'a>(flags: Flags, seq: u32, ack: u32, payload: &'a [u8]) -> Cb<'a> {
        let q = quad();
        let control_byte =
            if flags.contains(Flags::SYN) || flags.contains(Flags::FIN) { 1 } else { 0 };
        Cb {
            saddr: q.src.ipv4,
            daddr: q.dst.ipv4,
            sport: q.src.port,
            dport: q.dst.port,
            flags,
            seq,
            seq_end: seq + (payload.len() + control_byte) as u32,
            ack,
            rwnd: 4096,
            payload,
        }
    }

    #[test]
    fn passive_open() {
        let mut listener = Tcb::new_listen(80, config());
        let syn = cb(Flags::SYN, 1000, 0, &[]);

        let (action, _wake, emissions) = listener.on_segment(&syn, 5000);
        assert_eq!(listener.state, State::Listen, "parent stays in LISTEN");
        assert_eq!(emissions.len(), 1);
        assert_eq!(emissions[0].flags, Flags::SYN | Flags::ACK);

        let mut child = match action {
            Action::NewChild(child) => child,
            other => panic!("expected NewChild, got {other:?}"),
        };
        assert_eq!(child.state, State::SynRecv);
        assert_eq!(child.rcv.nxt, 1001);
        assert_eq!(child.snd.nxt, child.snd.iss.wrapping_add(1));

        let ack = cb(Flags::ACK, 1001, child.snd.iss.wrapping_add(1), &[]);
        let (action, _wake, _) = child.on_segment(&ack, 0);
        assert!(matches!(action, Action::Promote));
        assert_eq!(child.state, State::Established);
    }

    #[test]
    fn in_order_data() {
        let mut c = Tcb::new_child(&cb(Flags::SYN, 1999, 0, &[]), 80, 0, 5000, config());
        c.state = State::Established;
        c.snd.una = c.snd.nxt;

        let data = cb(Flags::PSH | Flags::ACK, 2000, c.snd.nxt, b"ABCD");
        let (_action, _wake, emissions) = c.on_segment(&data, 0);

        assert_eq!(c.incoming.iter().copied().collect::<Vec<u8>>(), b"ABCD");
        assert_eq!(c.rcv.nxt, 2004);
        assert_eq!(emissions.len(), 1);
        assert_eq!(emissions[0].ack, 2004);
    }

    #[test]
    fn ofo_then_fill() {
        let mut c = Tcb::new_child(&cb(Flags::SYN, 1999, 0, &[]), 80, 0, 5000, config());
        c.state = State::Established;
        c.snd.una = c.snd.nxt;

        let future = cb(Flags::PSH | Flags::ACK, 2004, c.snd.nxt, b"EF");
        let (_action, _wake, emissions) = c.on_segment(&future, 0);
        assert_eq!(c.rcv.nxt, 2000);
        assert_eq!(emissions[0].ack, 2000);

        let fill = cb(Flags::PSH | Flags::ACK, 2000, c.snd.nxt, b"ABCD");
        let (_action, _wake, emissions) = c.on_segment(&fill, 0);
        assert_eq!(c.incoming.iter().copied().collect::<Vec<u8>>(), b"ABCDEF");
        assert_eq!(c.rcv.nxt, 2006);
        assert_eq!(emissions[0].ack, 2006);
    }

    #[test]
    fn cumulative_ack_pop() {
        let mut c = Tcb::new_child(&cb(Flags::SYN, 49, 0, &[]), 80, 50, 5000, config());
        c.state = State::Established;

        c.snd.una = 50;
        c.snd.nxt = 300;
        c.outgoing.extend(std::iter::repeat(0u8).take(250));
        c.send_buf.clear();
        c.send_buf.push_back(SendEntry {
            seq: 50,
            seq_end: 100,
            flags: Flags::ACK,
        });
        c.send_buf.push_back(SendEntry {
            seq: 100,
            seq_end: 200,
            flags: Flags::ACK,
        });
        c.send_buf.push_back(SendEntry {
            seq: 200,
            seq_end: 300,
            flags: Flags::ACK,
        });

        let ack = cb(Flags::ACK, 1, 250, &[]);
        c.on_segment(&ack, 0);

        assert_eq!(c.snd.una, 200);
        assert_eq!(c.send_buf.len(), 1);
        assert_eq!(c.send_buf.front().unwrap().seq_end, 300);
    }

    #[test]
    fn duplicate_ack_is_idempotent() {
        let mut c = Tcb::new_child(&cb(Flags::SYN, 49, 0, &[]), 80, 50, 5000, config());
        c.state = State::Established;
        c.snd.una = 50;
        c.snd.nxt = 100;
        c.outgoing.extend(std::iter::repeat(0u8).take(50));
        c.send_buf.push_back(SendEntry {
            seq: 50,
            seq_end: 100,
            flags: Flags::ACK,
        });

        let ack = cb(Flags::ACK, 1, 100, &[]);
        c.on_segment(&ack, 0);
        assert_eq!(c.snd.una, 100);
        assert!(c.send_buf.is_empty());

        c.on_segment(&ack, 0);
        assert_eq!(c.snd.una, 100);
        assert!(c.send_buf.is_empty());
    }

    #[test]
    fn zero_window_wakes_sender() {
        let mut c = Tcb::new_child(&cb(Flags::SYN, 49, 0, &[]), 80, 50, 5000, config());
        c.state = State::Established;
        c.snd.una = 50;
        c.snd.nxt = 50;
        c.snd.wnd = 0;

        // Mark a sleeper so is_sleeping() reports true; normally done by a
        // blocked TcpStream::write holding the guard across wait().
        c.wait_send.sleepers.fetch_add(1, Ordering::AcqRel);

        let mut ack = cb(Flags::ACK, 1, 50, &[]);
        ack.rwnd = 4096;
        let (_action, wake, _emissions) = c.on_segment(&ack, 0);

        assert_eq!(c.snd.wnd, 4096);
        assert!(wake.send);
    }

    #[test]
    fn active_close_ladder() {
        let mut c = Tcb::new_child(&cb(Flags::SYN, 1999, 0, &[]), 80, 0, 5000, config());
        c.state = State::Established;
        c.snd.una = c.snd.nxt;

        let mut fin_ack = cb(Flags::FIN | Flags::ACK, c.rcv.nxt, c.snd.nxt, &[]);
        fin_ack.seq_end = fin_ack.seq + 1;
        c.state = State::FinWait1;

        let (_action, _wake, emissions) = c.on_segment(&fin_ack, 0);
        assert_eq!(c.state, State::TimeWait);
        assert!(c.time_wait_deadline.is_some());
        assert_eq!(emissions.len(), 1);

        c.time_wait_deadline = Some(Instant::now() - Duration::from_millis(1));
        let (_emissions, drop_conn) = c.on_tick();
        assert!(drop_conn);
        assert_eq!(c.state, State::Closed);
    }

    #[test]
    fn seq_comparison_wraps() {
        assert!(seq_lt(u32::MAX, 0));
        assert!(!seq_lt(0, u32::MAX));
        assert!(seq_le(u32::MAX, 0));
        assert!(seq_le(u32::MAX, u32::MAX));
    }
}
