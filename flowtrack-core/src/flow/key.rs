//! Flow identity and keyed, direction-symmetric hashing.

use std::net::IpAddr;

use super::Direction;

/// Transport-level identity of a flow as seen on one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    /// IP protocol number (TCP=6, UDP=17, ICMP=1, ...)
    pub protocol: u8,
    pub vlan_id: u16,
}

impl FlowKey {
    pub const fn new(src: IpAddr, dst: IpAddr, src_port: u16, dst_port: u16, protocol: u8) -> Self {
        Self {
            src,
            dst,
            src_port,
            dst_port,
            protocol,
            vlan_id: 0,
        }
    }

    pub const fn with_vlan(mut self, vlan_id: u16) -> Self {
        self.vlan_id = vlan_id;
        self
    }

    /// Key of the reply direction.
    pub const fn reverse(&self) -> Self {
        Self {
            src: self.dst,
            dst: self.src,
            src_port: self.dst_port,
            dst_port: self.src_port,
            protocol: self.protocol,
            vlan_id: self.vlan_id,
        }
    }

    /// Matches `packet` against this flow's key in either direction.
    ///
    /// `self` is the key the flow was created with, so a match on the
    /// original orientation means the packet travels to the server.
    #[inline]
    pub fn direction_of(&self, packet: &FlowKey) -> Option<Direction> {
        if self.protocol != packet.protocol || self.vlan_id != packet.vlan_id {
            return None;
        }
        if self.src == packet.src
            && self.dst == packet.dst
            && self.src_port == packet.src_port
            && self.dst_port == packet.dst_port
        {
            Some(Direction::ToServer)
        } else if self.src == packet.dst
            && self.dst == packet.src
            && self.src_port == packet.dst_port
            && self.dst_port == packet.src_port
        {
            Some(Direction::ToClient)
        } else {
            None
        }
    }

    /// Byte encoding shared by both directions of the flow: endpoints are
    /// ordered so `k` and `k.reverse()` encode identically.
    fn canonical_bytes(&self) -> [u8; 41] {
        let a = endpoint(self.src, self.src_port);
        let b = endpoint(self.dst, self.dst_port);
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };

        let mut buf = [0u8; 41];
        buf[0] = lo.0;
        buf[1..17].copy_from_slice(&lo.1);
        buf[17..19].copy_from_slice(&lo.2.to_be_bytes());
        buf[19] = hi.0;
        buf[20..36].copy_from_slice(&hi.1);
        buf[36..38].copy_from_slice(&hi.2.to_be_bytes());
        buf[38] = self.protocol;
        buf[39..41].copy_from_slice(&self.vlan_id.to_be_bytes());
        buf
    }
}

/// (family, address, port) with v4 addresses widened to their mapped form.
fn endpoint(addr: IpAddr, port: u16) -> (u8, [u8; 16], u16) {
    match addr {
        IpAddr::V4(v4) => (4, v4.to_ipv6_mapped().octets(), port),
        IpAddr::V6(v6) => (6, v6.octets(), port),
    }
}

/// Keyed hash over the canonical flow identity.
///
/// The key is derived from the configured seed so bucket placement cannot be
/// predicted by someone who does not know it.
#[derive(Clone)]
pub struct FlowHasher {
    key: [u8; 32],
}

impl FlowHasher {
    pub fn new(seed: u64) -> Self {
        Self {
            key: blake3::derive_key("flowtrack 2024 flow table bucket hash", &seed.to_le_bytes()),
        }
    }

    #[inline]
    pub fn hash(&self, key: &FlowKey) -> u64 {
        let digest = blake3::keyed_hash(&self.key, &key.canonical_bytes());
        let mut word = [0u8; 8];
        word.copy_from_slice(&digest.as_bytes()[..8]);
        u64::from_le_bytes(word)
    }
}

impl std::fmt::Debug for FlowHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowHasher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn tcp(src: [u8; 4], sp: u16, dst: [u8; 4], dp: u16) -> FlowKey {
        FlowKey::new(
            IpAddr::V4(Ipv4Addr::from(src)),
            IpAddr::V4(Ipv4Addr::from(dst)),
            sp,
            dp,
            6,
        )
    }

    #[test]
    fn direction_of_both_orientations() {
        let key = tcp([10, 0, 0, 1], 40000, [10, 0, 0, 2], 80);
        assert_eq!(key.direction_of(&key), Some(Direction::ToServer));
        assert_eq!(key.direction_of(&key.reverse()), Some(Direction::ToClient));
    }

    #[test]
    fn different_protocol_or_vlan_never_matches() {
        let key = tcp([10, 0, 0, 1], 40000, [10, 0, 0, 2], 80);
        let mut udp = key;
        udp.protocol = 17;
        assert_eq!(key.direction_of(&udp), None);
        assert_eq!(key.direction_of(&key.with_vlan(7)), None);
    }

    #[test]
    fn half_swapped_tuple_does_not_match() {
        let key = tcp([10, 0, 0, 1], 40000, [10, 0, 0, 2], 80);
        let odd = tcp([10, 0, 0, 2], 40000, [10, 0, 0, 1], 80);
        assert_eq!(key.direction_of(&odd), None);
    }

    #[test]
    fn seed_changes_hash() {
        let key = tcp([192, 168, 1, 1], 1234, [8, 8, 8, 8], 53);
        assert_ne!(FlowHasher::new(1).hash(&key), FlowHasher::new(2).hash(&key));
    }

    #[test]
    fn v4_and_mapped_v6_hash_differently() {
        let v4 = tcp([192, 168, 1, 1], 1234, [8, 8, 8, 8], 53);
        let mapped = FlowKey::new(
            IpAddr::V6(Ipv4Addr::new(192, 168, 1, 1).to_ipv6_mapped()),
            IpAddr::V6(Ipv4Addr::new(8, 8, 8, 8).to_ipv6_mapped()),
            1234,
            53,
            6,
        );
        let hasher = FlowHasher::new(9);
        assert_ne!(hasher.hash(&v4), hasher.hash(&mapped));
    }

    proptest! {
        #[test]
        fn hash_is_direction_symmetric(
            src in any::<[u8; 16]>(),
            dst in any::<[u8; 16]>(),
            sp in any::<u16>(),
            dp in any::<u16>(),
            proto in any::<u8>(),
            vlan in any::<u16>(),
            seed in any::<u64>(),
        ) {
            let key = FlowKey::new(
                IpAddr::V6(Ipv6Addr::from(src)),
                IpAddr::V6(Ipv6Addr::from(dst)),
                sp,
                dp,
                proto,
            )
            .with_vlan(vlan);
            let hasher = FlowHasher::new(seed);
            prop_assert_eq!(hasher.hash(&key), hasher.hash(&key.reverse()));
            prop_assert!(key.direction_of(&key.reverse()).is_some());
        }
    }
}
