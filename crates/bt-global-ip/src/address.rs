use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Address family tracked independently by the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub const ALL: [Family; 2] = [Family::V4, Family::V6];

    pub fn as_str(&self) -> &'static str {
        match self {
            Family::V4 => "IPv4",
            Family::V6 => "IPv6",
        }
    }

    /// Destination used to let the OS pick a source address. Nothing is ever sent here:
    /// the probe only `connect()`s a UDP socket.
    pub(crate) fn probe_destination(&self) -> SocketAddr {
        match self {
            Family::V4 => SocketAddr::new(IpAddr::V4(Ipv4Addr::new(91, 121, 74, 28)), 6969),
            Family::V6 => SocketAddr::new(
                IpAddr::V6("2001:1890:1112:1::20".parse().unwrap()),
                6969,
            ),
        }
    }

    pub(crate) fn any_addr(&self) -> IpAddr {
        match self {
            Family::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Family::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }

    pub(crate) fn ip_query_url(&self) -> &'static str {
        match self {
            Family::V4 => "https://ip4.transmissionbt.com/",
            Family::V6 => "https://ip6.transmissionbt.com/",
        }
    }

    pub fn of(addr: IpAddr) -> Family {
        match addr {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }
}

/// Conservative "is this routable on the public Internet" check. `std`'s own
/// `is_global` is still unstable, so this hand-rolls the RFC ranges that matter for
/// the families we deal with here: loopback, link-local, private/ULA, multicast,
/// unspecified, and documentation ranges are all rejected.
pub fn is_global_unicast(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            !v4.is_private()
                && !v4.is_loopback()
                && !v4.is_link_local()
                && !v4.is_broadcast()
                && !v4.is_documentation()
                && !v4.is_unspecified()
                && !v4.is_multicast()
        }
        IpAddr::V6(v6) => {
            !v6.is_loopback()
                && !v6.is_unspecified()
                && !v6.is_multicast()
                && !is_unique_local(&v6)
                && !is_unicast_link_local(&v6)
        }
    }
}

fn is_unique_local(addr: &Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xfe00) == 0xfc00
}

fn is_unicast_link_local(addr: &Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xffc0) == 0xfe80
}
