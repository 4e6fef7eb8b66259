//! Connection allowlist
//!
//! Two collections behind a reader-writer lock: open networks, where any
//! remote inside the network is accepted, and peer-gated networks, where
//! acceptance also requires the peer identity to match. Connections arrive
//! before identity is known, so admission is a two-phase check:
//! [`Allowlist::allowed`] gates the handshake, and
//! [`Allowlist::allowed_peer_and_addr`] confirms gated entries once the
//! identity is established.
//!
//! A linear scan over the networks is adequate for the intended scale
//! (fewer than a thousand entries); measure before reaching for anything
//! fancier.

use peermit_errors::{AllowlistError, Error};
use peermit_types::{Multiaddr, PeerId};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// An IP network in CIDR form.
///
/// The address is normalized to its network address at construction, so two
/// nets describing the same network compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpNet {
    addr: IpAddr,
    prefix: u8,
}

fn v4_mask(prefix: u8) -> u32 {
    match prefix {
        0 => 0,
        1..=31 => u32::MAX << (32 - prefix),
        _ => u32::MAX,
    }
}

fn v6_mask(prefix: u8) -> u128 {
    match prefix {
        0 => 0,
        1..=127 => u128::MAX << (128 - prefix),
        _ => u128::MAX,
    }
}

impl IpNet {
    /// A network from an address and prefix length. The prefix is clamped
    /// to the address family's width.
    #[must_use]
    pub fn new(addr: IpAddr, prefix: u8) -> Self {
        match addr {
            IpAddr::V4(ip) => {
                let prefix = prefix.min(32);
                let masked = u32::from(ip) & v4_mask(prefix);
                Self {
                    addr: IpAddr::V4(masked.into()),
                    prefix,
                }
            }
            IpAddr::V6(ip) => {
                let prefix = prefix.min(128);
                let masked = u128::from(ip) & v6_mask(prefix);
                Self {
                    addr: IpAddr::V6(masked.into()),
                    prefix,
                }
            }
        }
    }

    /// The host network containing exactly `addr` (/32 or /128).
    #[must_use]
    pub fn host(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Self::new(addr, 32),
            IpAddr::V6(_) => Self::new(addr, 128),
        }
    }

    /// Whether `ip` falls inside this network. Mixed address families never
    /// match.
    #[must_use]
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                u32::from(ip) & v4_mask(self.prefix) == u32::from(net)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                u128::from(ip) & v6_mask(self.prefix) == u128::from(net)
            }
            _ => false,
        }
    }
}

fn to_ip_net(addr: &Multiaddr) -> Result<(IpNet, Option<PeerId>), Error> {
    let Some(ip) = addr.ip() else {
        return Err(AllowlistError::MissingIp {
            addr: addr.to_string(),
        }
        .into());
    };
    let peer = addr.peer().cloned();
    let net = match addr.cidr() {
        Some(bits) => {
            let max = if ip.is_ipv4() { 32 } else { 128 };
            if bits > max {
                return Err(AllowlistError::InvalidMultiaddr {
                    addr: addr.to_string(),
                    reason: "cidr prefix longer than the address".to_string(),
                }
                .into());
            }
            IpNet::new(ip, bits)
        }
        None => IpNet::host(ip),
    };
    Ok((net, peer))
}

#[derive(Default)]
struct AllowlistState {
    open_networks: Vec<IpNet>,
    peer_networks: HashMap<PeerId, Vec<IpNet>>,
}

/// Concurrent-readable set of trusted networks.
#[derive(Default)]
pub struct Allowlist {
    state: RwLock<AllowlistState>,
}

impl Allowlist {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, AllowlistState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, AllowlistState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a multiaddr to the allowlist.
    ///
    /// The multiaddr must carry an IP; a CIDR component widens the entry to
    /// a network, a `/p2p` component gates it on that peer. For example
    /// `/ip4/1.2.3.4`, `/ip4/1.2.3.0/ipcidr/24`, and `/ip4/1.2.3.4/p2p/QmFoo`
    /// are all valid; `/p2p/QmFoo` alone is not.
    ///
    /// # Errors
    ///
    /// Returns [`AllowlistError::MissingIp`] or
    /// [`AllowlistError::InvalidMultiaddr`] for unusable entries.
    pub fn add(&self, addr: &Multiaddr) -> Result<(), Error> {
        let (net, peer) = to_ip_net(addr)?;
        let mut state = self.write();
        match peer {
            Some(peer) => state.peer_networks.entry(peer).or_default().push(net),
            None => state.open_networks.push(net),
        }
        Ok(())
    }

    /// Remove every entry matching the multiaddr's network (and peer, if
    /// present).
    ///
    /// # Errors
    ///
    /// Same parse errors as [`add`](Self::add).
    pub fn remove(&self, addr: &Multiaddr) -> Result<(), Error> {
        let (net, peer) = to_ip_net(addr)?;
        let mut state = self.write();
        match peer {
            Some(peer) => {
                if let Some(nets) = state.peer_networks.get_mut(&peer) {
                    swap_remove_matching(nets, net);
                    if nets.is_empty() {
                        state.peer_networks.remove(&peer);
                    }
                }
            }
            None => swap_remove_matching(&mut state.open_networks, net),
        }
        Ok(())
    }

    /// Whether a remote at `addr` may be admitted at all. Used before the
    /// identity is known, so peer-gated networks count as a potential match.
    #[must_use]
    pub fn allowed(&self, addr: &Multiaddr) -> bool {
        let Some(ip) = addr.ip() else { return false };
        let state = self.read();
        state.open_networks.iter().any(|net| net.contains(ip))
            || state
                .peer_networks
                .values()
                .flatten()
                .any(|net| net.contains(ip))
    }

    /// Whether the identified `peer` at `addr` is admitted: inside an open
    /// network, or inside one of that specific peer's gated networks.
    #[must_use]
    pub fn allowed_peer_and_addr(&self, peer: &PeerId, addr: &Multiaddr) -> bool {
        let Some(ip) = addr.ip() else { return false };
        let state = self.read();
        if state.open_networks.iter().any(|net| net.contains(ip)) {
            return true;
        }
        state
            .peer_networks
            .get(peer)
            .is_some_and(|nets| nets.iter().any(|net| net.contains(ip)))
    }
}

fn swap_remove_matching(nets: &mut Vec<IpNet>, target: IpNet) {
    let mut i = nets.len();
    while i > 0 {
        i -= 1;
        if nets[i] == target {
            nets.swap_remove(i);
        }
    }
}
