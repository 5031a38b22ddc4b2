use etherparse::{Ipv4Header, Ipv4HeaderSlice, TcpHeader, TcpHeaderSlice};

use super::tcb::{Cb, Emission};
use super::{Flags, Quad};

const TCP_PROTOCOL: u8 = 6;
const DEFAULT_TTL: u8 = 64;

fn parse_flags(tcph: &TcpHeaderSlice) -> Flags {
    let mut flags = Flags::NONE;
    if tcph.syn() {
        flags = flags | Flags::SYN;
    }
    if tcph.ack() {
        flags = flags | Flags::ACK;
    }
    if tcph.fin() {
        flags = flags | Flags::FIN;
    }
    if tcph.psh() {
        flags = flags | Flags::PSH;
    }
    if tcph.rst() {
        flags = flags | Flags::RST;
    }
    flags
}

/// Builds a `Cb` from a demultiplexed IPv4/TCP header pair and the segment's
/// data. `data` must outlive the returned `Cb`.
pub fn parse_segment<'a>(
    ip4h: &Ipv4HeaderSlice,
    tcph: &TcpHeaderSlice,
    data: &'a [u8],
) -> Cb<'a> {
    let flags = parse_flags(tcph);
    let control_bytes =
        if flags.contains(Flags::SYN) || flags.contains(Flags::FIN) { 1 } else { 0 };

    Cb {
        saddr: ip4h.source_addr(),
        daddr: ip4h.destination_addr(),
        sport: tcph.source_port(),
        dport: tcph.destination_port(),
        flags,
        seq: tcph.sequence_number(),
        seq_end: tcph
            .sequence_number()
            .wrapping_add(data.len() as u32)
            .wrapping_add(control_bytes),
        ack: tcph.acknowledgment_number(),
        rwnd: tcph.window_size(),
        payload: data,
    }
}

/// Serializes an `Emission` into a routable IPv4/TCP packet. `quad` is the
/// connection's quad as seen on the *incoming* side (src = peer, dst =
/// local); the wire packet goes the other way, so addressing is built from
/// `quad.reversed()`.
pub fn write_segment(quad: Quad, emission: &Emission) -> Vec<u8> {
    let wire = quad.reversed();

    let mut tcph = TcpHeader::new(wire.src.port, wire.dst.port, emission.seq, emission.wnd);
    tcph.syn = emission.flags.contains(Flags::SYN);
    tcph.ack = emission.flags.contains(Flags::ACK);
    tcph.fin = emission.flags.contains(Flags::FIN);
    tcph.psh = emission.flags.contains(Flags::PSH);
    tcph.rst = emission.flags.contains(Flags::RST);
    tcph.acknowledgment_number = emission.ack;

    let ip4h = Ipv4Header::new(
        tcph.header_len() + emission.payload.len() as u16,
        DEFAULT_TTL,
        TCP_PROTOCOL,
        wire.src.ipv4.octets(),
        wire.dst.ipv4.octets(),
    );

    tcph.checksum = tcph
        .calc_checksum_ipv4(&ip4h, &emission.payload)
        .expect("payload too large for a TCP checksum");

    let mut out = Vec::with_capacity(ip4h.header_len() + tcph.header_len() as usize + emission.payload.len());
    ip4h.write(&mut out).expect("writing to a Vec cannot fail");
    tcph.write(&mut out).expect("writing to a Vec cannot fail");
    out.extend_from_slice(&emission.payload);
    out
}

/// RFC 9293 §3.10.7.1 (CLOSED state): no `Tcb` exists for this 4-tuple at
/// all, so there is no `Conn` to dispatch into. A bare RST (or nothing, if
/// the incoming segment itself carried RST) is the entire response.
pub fn reset_for_unmatched(ip4h: &Ipv4HeaderSlice, tcph: &TcpHeaderSlice, data: &[u8]) -> Option<Vec<u8>> {
    if tcph.rst() {
        return None;
    }

    let quad = Quad {
        src: super::Dual {
            ipv4: ip4h.source_addr(),
            port: tcph.source_port(),
        },
        dst: super::Dual {
            ipv4: ip4h.destination_addr(),
            port: tcph.destination_port(),
        },
    };

    let emission = if tcph.ack() {
        Emission {
            flags: Flags::RST,
            seq: tcph.acknowledgment_number(),
            ack: 0,
            wnd: 0,
            payload: Vec::new(),
        }
    } else {
        let control_bytes = if tcph.syn() || tcph.fin() { 1 } else { 0 };
        Emission {
            flags: Flags::RST | Flags::ACK,
            seq: 0,
            ack: tcph
                .sequence_number()
                .wrapping_add(data.len() as u32)
                .wrapping_add(control_bytes),
            wnd: 0,
            payload: Vec::new(),
        }
    };

    Some(write_segment(quad, &emission))
}
