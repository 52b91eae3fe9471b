//! Connection records shared between the capture source and userspace
//!
//! The capture side fills these structures in place, so they must be:
//! - `#[repr(C)]` for stable memory layout
//! - `no_std` compatible
//! - plain integers only (no enums, no pointers)

#![cfg_attr(not(feature = "userspace"), no_std)]

use core::fmt;
use core::net::Ipv4Addr;

/// Connection role constants as written by the capture source
pub mod role {
    pub const UNKNOWN: u32 = 0;
    pub const CLIENT: u32 = 1;
    pub const SERVER: u32 = 2;
}

/// IPv4 address exactly as captured.
///
/// The capture source reads the address bytes from the socket in network
/// order into a native `u32`, so on little-endian hosts the first octet ends
/// up in the least significant byte: 10.0.0.5 is stored as `0x0500000A`.
/// Every conversion in this type follows that layout; never reinterpret the
/// raw value with `u32::from_be`.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(
    feature = "userspace",
    derive(serde::Serialize, serde::Deserialize),
    serde(transparent)
)]
pub struct Ip(pub u32);

impl Ip {
    pub const UNSPECIFIED: Ip = Ip(0);

    /// Build from dotted-quad octets, first octet first
    pub const fn from_octets(octets: [u8; 4]) -> Self {
        Ip(u32::from_le_bytes(octets))
    }

    /// Octets in textual order
    pub const fn octets(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    pub const fn is_unspecified(self) -> bool {
        self.0 == 0
    }

    pub const fn to_ipv4(self) -> Ipv4Addr {
        let [a, b, c, d] = self.octets();
        Ipv4Addr::new(a, b, c, d)
    }
}

impl From<Ipv4Addr> for Ip {
    fn from(addr: Ipv4Addr) -> Self {
        Ip::from_octets(addr.octets())
    }
}

impl From<Ip> for Ipv4Addr {
    fn from(ip: Ip) -> Self {
        ip.to_ipv4()
    }
}

impl fmt::Display for Ip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.octets();
        write!(f, "{}.{}.{}.{}", a, b, c, d)
    }
}

impl core::str::FromStr for Ip {
    type Err = core::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<Ipv4Addr>().map(Ip::from)
    }
}

/// One network flow: (source IP, destination IP, source port, destination port)
///
/// Layout (12 bytes, 4-byte aligned). IPs use the [`Ip`] byte order, ports
/// are in host byte order.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
#[cfg_attr(
    feature = "userspace",
    derive(PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)
)]
pub struct ConnectionTuple {
    pub src_ip: u32,
    pub dst_ip: u32,
    pub src_port: u16,
    pub dst_port: u16,
}

impl ConnectionTuple {
    pub fn src(&self) -> Ip {
        Ip(self.src_ip)
    }

    pub fn dst(&self) -> Ip {
        Ip(self.dst_ip)
    }

    /// True when the capture source handed over an unfilled slot
    pub fn is_zero(&self) -> bool {
        self.src_ip == 0 && self.dst_ip == 0 && self.src_port == 0 && self.dst_port == 0
    }
}

/// One observed connection instance on the host
///
/// Layout (24 bytes, 4-byte aligned):
/// - id: per-host connection counter assigned by the capture source
/// - pid: owning process
/// - tuple: the flow
/// - role: one of the [`role`] constants
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
#[cfg_attr(
    feature = "userspace",
    derive(PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)
)]
pub struct ConnectionIdentifier {
    pub id: u32,
    pub pid: u32,
    pub tuple: ConnectionTuple,
    pub role: u32,
}

/// Lifetime byte counters of a connection at the time of the last refresh
///
/// Layout (24 bytes, 8-byte aligned). `is_active` is non-zero while the
/// socket is open.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
#[cfg_attr(
    feature = "userspace",
    derive(PartialEq, Eq, serde::Serialize, serde::Deserialize)
)]
pub struct ConnectionThroughputStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub is_active: u64,
}

impl ConnectionThroughputStats {
    pub fn active(&self) -> bool {
        self.is_active != 0
    }
}

const _: () = {
    assert!(
        core::mem::size_of::<ConnectionTuple>() == 12,
        "ConnectionTuple must be exactly 12 bytes"
    );
    assert!(
        core::mem::size_of::<ConnectionIdentifier>() == 24,
        "ConnectionIdentifier must be exactly 24 bytes"
    );
    assert!(
        core::mem::size_of::<ConnectionThroughputStats>() == 24,
        "ConnectionThroughputStats must be exactly 24 bytes"
    );
    assert!(
        core::mem::align_of::<ConnectionThroughputStats>() == 8,
        "ConnectionThroughputStats must be 8-byte aligned"
    );
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ip_display_first_octet_in_lsb() {
        let ip = Ip(0x0500_000A);
        assert_eq!(ip.to_string(), "10.0.0.5");
    }

    #[test]
    fn test_ip_parse_matches_capture_layout() {
        let ip: Ip = "10.244.1.7".parse().unwrap();
        assert_eq!(ip.0, u32::from_le_bytes([10, 244, 1, 7]));
        assert_eq!(ip.to_ipv4(), Ipv4Addr::new(10, 244, 1, 7));
    }

    #[test]
    fn test_zero_tuple() {
        assert!(ConnectionTuple::default().is_zero());

        let tuple = ConnectionTuple {
            src_ip: 1,
            ..Default::default()
        };
        assert!(!tuple.is_zero());
    }

    #[test]
    fn test_identifier_json_shape() {
        let id = ConnectionIdentifier {
            id: 7,
            pid: 42,
            tuple: ConnectionTuple {
                src_ip: Ip::from_octets([10, 0, 0, 1]).0,
                dst_ip: Ip::from_octets([10, 0, 0, 2]).0,
                src_port: 40000,
                dst_port: 80,
            },
            role: role::CLIENT,
        };

        let json = serde_json::to_value(id).unwrap();
        assert_eq!(json["tuple"]["dst_port"], 80);
        assert_eq!(json["role"], 1);
    }
}
