use std::net::{SocketAddrV4, SocketAddrV6};

use buffers::ByteBufOwned;
use bt_core::compact_ip::CompactListInBufferOwned;

/// One compact PEX entry: an address plus its `added.f` flag byte.
#[derive(Debug, Clone, Copy)]
pub struct PexPeer {
    pub addr_v4: Option<SocketAddrV4>,
    pub addr_v6: Option<SocketAddrV6>,
    pub flags: u8,
}

/// Encode a list of IPv4 peers into the compact `added`/`added.f` byte strings used by
/// the PEX extension message.
pub fn encode_v4(peers: &[(SocketAddrV4, u8)]) -> (ByteBufOwned, ByteBufOwned) {
    let added = CompactListInBufferOwned::new_from_iter(peers.iter().map(|(a, _)| *a));
    let flags: Vec<u8> = peers.iter().map(|(_, f)| *f).collect();
    (to_bytes(added), ByteBufOwned::from(flags))
}

/// Encode a list of IPv6 peers the same way, for the `added6`/`added6.f` fields.
pub fn encode_v6(peers: &[(SocketAddrV6, u8)]) -> (ByteBufOwned, ByteBufOwned) {
    let added = CompactListInBufferOwned::new_from_iter(peers.iter().map(|(a, _)| *a));
    let flags: Vec<u8> = peers.iter().map(|(_, f)| *f).collect();
    (to_bytes(added), ByteBufOwned::from(flags))
}

fn to_bytes<T>(list: CompactListInBufferOwned<T>) -> ByteBufOwned
where
    T: bt_core::compact_ip::CompactSerialize + bt_core::compact_ip::CompactSerializeFixedLen,
{
    // CompactListInBuffer already stores its payload as a ByteBufOwned internally;
    // round-trip through its Serialize impl would require a serde format, so instead
    // we iterate and re-encode directly into a flat buffer.
    let mut buf = Vec::new();
    if let Ok(iter) = list.iter() {
        for item in iter {
            buf.extend_from_slice(item.as_slice().as_slice());
        }
    }
    ByteBufOwned::from(buf)
}

pub fn decode_v4(added: &[u8], added_f: &[u8]) -> Vec<PexPeer> {
    added
        .chunks_exact(6)
        .enumerate()
        .filter_map(|(i, chunk)| {
            let addr = <SocketAddrV4 as bt_core::compact_ip::CompactSerialize>::from_slice(chunk)?;
            Some(PexPeer {
                addr_v4: Some(addr),
                addr_v6: None,
                flags: added_f.get(i).copied().unwrap_or(0),
            })
        })
        .collect()
}

pub fn decode_v6(added6: &[u8], added6_f: &[u8]) -> Vec<PexPeer> {
    added6
        .chunks_exact(18)
        .enumerate()
        .filter_map(|(i, chunk)| {
            let addr = <SocketAddrV6 as bt_core::compact_ip::CompactSerialize>::from_slice(chunk)?;
            Some(PexPeer {
                addr_v4: None,
                addr_v6: Some(addr),
                flags: added6_f.get(i).copied().unwrap_or(0),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::{ADDED_F_CONNECTABLE, ADDED_F_SEED};

    #[test]
    fn roundtrip_v4() {
        let peers = vec![
            ("1.2.3.4:6881".parse::<SocketAddrV4>().unwrap(), ADDED_F_SEED),
            (
                "5.6.7.8:51413".parse::<SocketAddrV4>().unwrap(),
                ADDED_F_CONNECTABLE,
            ),
        ];
        let (added, added_f) = encode_v4(&peers);
        assert_eq!(added.as_ref().len(), 12);
        let decoded = decode_v4(added.as_ref(), added_f.as_ref());
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].addr_v4, Some(peers[0].0));
        assert_eq!(decoded[0].flags, ADDED_F_SEED);
        assert_eq!(decoded[1].addr_v4, Some(peers[1].0));
    }

    #[test]
    fn roundtrip_v6() {
        let peers = vec![(
            "[2001:db8::1]:6881".parse::<SocketAddrV6>().unwrap(),
            ADDED_F_SEED,
        )];
        let (added6, added6_f) = encode_v6(&peers);
        assert_eq!(added6.as_ref().len(), 18);
        let decoded = decode_v6(added6.as_ref(), added6_f.as_ref());
        assert_eq!(decoded[0].addr_v6, Some(peers[0].0));
        assert_eq!(decoded[0].flags, ADDED_F_SEED);
    }
}
