use std::net::{IpAddr, Ipv4Addr, UdpSocket};

use log::debug;

/// Network distance classes, probed in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tier {
    /// Loopback or an address of this host.
    Local,
    SameSubnet,
    /// RFC 1918 (and IPv6 unique local) ranges.
    Private,
    Any,
}

impl Tier {
    pub const ORDER: [Tier; 4] = [Tier::Local, Tier::SameSubnet, Tier::Private, Tier::Any];
}

/// An IPv4 network this host sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalNetwork {
    pub addr: Ipv4Addr,
    pub prefix: u8,
}

impl LocalNetwork {
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Self {
        Self {
            addr,
            prefix: prefix.min(32),
        }
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let mask = match self.prefix {
            0 => 0,
            p => u32::MAX << (32 - p),
        };
        u32::from(self.addr) & mask == u32::from(ip) & mask
    }
}

/// Classifies addresses into [`Tier`]s relative to this host.
#[derive(Debug, Clone, Default)]
pub struct Locality {
    local_addrs: Vec<IpAddr>,
    networks: Vec<LocalNetwork>,
}

impl Locality {
    pub fn new(local_addrs: Vec<IpAddr>, networks: Vec<LocalNetwork>) -> Self {
        Self {
            local_addrs,
            networks,
        }
    }

    /// Finds the primary IPv4 address by routing a connected UDP socket
    /// (no packet is sent) and assumes a /24 around it.
    pub fn detect() -> Self {
        let primary = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .and_then(|s| s.connect((Ipv4Addr::new(192, 0, 2, 1), 9)).map(|_| s))
            .and_then(|s| s.local_addr());

        match primary.map(|a| a.ip()) {
            Ok(IpAddr::V4(ip)) if !ip.is_unspecified() => {
                debug!("primary address {ip}");
                Self::new(vec![IpAddr::V4(ip)], vec![LocalNetwork::new(ip, 24)])
            }
            _ => {
                debug!("no primary IPv4 address; only loopback counts as local");
                Self::default()
            }
        }
    }

    pub fn classify(&self, ip: IpAddr) -> Tier {
        if ip.is_loopback() || self.local_addrs.contains(&ip) {
            return Tier::Local;
        }
        match ip {
            IpAddr::V4(v4) if self.networks.iter().any(|n| n.contains(v4)) => Tier::SameSubnet,
            IpAddr::V4(v4) if v4.is_private() => Tier::Private,
            IpAddr::V6(v6) if (v6.segments()[0] & 0xfe00) == 0xfc00 => Tier::Private,
            _ => Tier::Any,
        }
    }
}
