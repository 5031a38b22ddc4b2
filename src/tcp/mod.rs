use std::net::Ipv4Addr;

pub(crate) mod ioutil;
mod listen;
mod stream;
pub(crate) mod tcb;

pub use ioutil::*;
pub use listen::*;
pub use stream::*;
pub use tcb::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dual {
    pub ipv4: Ipv4Addr,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Quad {
    pub src: Dual,
    pub dst: Dual,
}

impl Quad {
    pub fn reversed(self) -> Quad {
        Quad {
            src: self.dst,
            dst: self.src,
        }
    }
}

/// RFC 793 flag bits. Only SYN/ACK/PSH/FIN/RST are given meaning by this
/// core (URG and the reserved bits are parsed and ignored).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flags(u8);

impl Flags {
    pub const FIN: Flags = Flags(0b0000_0001);
    pub const SYN: Flags = Flags(0b0000_0010);
    pub const RST: Flags = Flags(0b0000_0100);
    pub const PSH: Flags = Flags(0b0000_1000);
    pub const ACK: Flags = Flags(0b0001_0000);
    pub const NONE: Flags = Flags(0b0000_0000);

    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl std::fmt::Display for Flags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts = Vec::new();
        if self.contains(Flags::SYN) {
            parts.push("SYN");
        }
        if self.contains(Flags::ACK) {
            parts.push("ACK");
        }
        if self.contains(Flags::FIN) {
            parts.push("FIN");
        }
        if self.contains(Flags::PSH) {
            parts.push("PSH");
        }
        if self.contains(Flags::RST) {
            parts.push("RST");
        }
        if parts.is_empty() {
            parts.push("NONE");
        }
        write!(f, "{}", parts.join("|"))
    }
}
