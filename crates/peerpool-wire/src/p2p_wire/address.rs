//! Peer addresses, as used by the pool for queueing, dedup and blacklisting.

use std::fmt;
use std::fmt::Display;
use std::fmt::Formatter;
use std::net::IpAddr;
use std::net::SocketAddr;

use bitcoin::p2p::address::AddrV2;
use bitcoin::p2p::address::AddrV2Message;
use bitcoin::p2p::address::Address;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// Where a peer can be reached. The pool blacklists by `ip` alone.
pub struct PeerAddress {
    pub ip: IpAddr,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddrParseError {
    InvalidIpv6,
    InvalidIpv4,
    InvalidPort,
    Inconclusive,
}

impl Display for AddrParseError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            AddrParseError::InvalidIpv6 => write!(f, "Invalid ipv6"),
            AddrParseError::InvalidIpv4 => write!(f, "Invalid ipv4"),
            AddrParseError::InvalidPort => write!(f, "Invalid port"),
            AddrParseError::Inconclusive => write!(f, "Inconclusive"),
        }
    }
}

impl std::error::Error for AddrParseError {}

impl PeerAddress {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        PeerAddress { ip, port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Parses `ip`, `ip:port`, `[ipv6]` or `[ipv6]:port`. When no port is given, `default_port`
    /// is used.
    pub fn parse(address: &str, default_port: u16) -> Result<Self, AddrParseError> {
        let address = address.trim();

        if address.starts_with('[') {
            if !address.contains(']') {
                return Err(AddrParseError::InvalidIpv6);
            }

            let mut split = address.split(']');
            let hostname = split.next().ok_or(AddrParseError::InvalidIpv6)?;
            let port = split
                .next()
                .filter(|x| !x.is_empty())
                .map(|port| {
                    port.strip_prefix(':')
                        .ok_or(AddrParseError::InvalidPort)?
                        .parse()
                        .map_err(|_e| AddrParseError::InvalidPort)
                })
                .transpose()?
                .unwrap_or(default_port);

            let ip: std::net::Ipv6Addr = hostname
                .trim_start_matches('[')
                .parse()
                .map_err(|_e| AddrParseError::InvalidIpv6)?;

            return Ok(PeerAddress::new(IpAddr::V6(ip), port));
        }

        // A bare ipv6 has more than one colon, and can't carry a port without brackets
        if address.matches(':').count() > 1 {
            let ip: std::net::Ipv6Addr =
                address.parse().map_err(|_e| AddrParseError::InvalidIpv6)?;
            return Ok(PeerAddress::new(IpAddr::V6(ip), default_port));
        }

        let mut split = address.split(':');
        let ip: std::net::Ipv4Addr = split
            .next()
            .ok_or(AddrParseError::InvalidIpv4)?
            .parse()
            .map_err(|_e| AddrParseError::InvalidIpv4)?;

        let port = split
            .next()
            .map(|port| port.parse().map_err(|_e| AddrParseError::InvalidPort))
            .transpose()?
            .unwrap_or(default_port);

        if split.next().is_some() {
            return Err(AddrParseError::Inconclusive);
        }

        Ok(PeerAddress::new(IpAddr::V4(ip), port))
    }

    /// Converts an entry of an `addr` message. Onion and other non-ip networks can't be reached
    /// by us, so they yield `None`.
    pub fn from_addr(address: &Address) -> Option<Self> {
        address.socket_addr().ok().map(PeerAddress::from)
    }

    /// Same as [`PeerAddress::from_addr`], for `addrv2` entries
    pub fn from_addr_v2(address: &AddrV2Message) -> Option<Self> {
        match address.addr {
            AddrV2::Ipv4(ip) => Some(PeerAddress::new(IpAddr::V4(ip), address.port)),
            AddrV2::Ipv6(ip) => Some(PeerAddress::new(IpAddr::V6(ip), address.port)),
            _ => None,
        }
    }
}

impl From<SocketAddr> for PeerAddress {
    fn from(addr: SocketAddr) -> Self {
        PeerAddress::new(addr.ip(), addr.port())
    }
}

impl Display for PeerAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}
