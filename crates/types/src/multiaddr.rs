//! Layered network address tokens
//!
//! A [`Multiaddr`] is a slash-delimited stack of typed components, e.g.
//! `/ip4/1.2.3.4/tcp/1234/p2p/QmFoo`. The resource manager only interprets
//! the IP, CIDR mask, and peer-identity components; everything else is
//! carried opaquely.

use crate::PeerId;
use peermit_errors::{AllowlistError, Error};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Protocols whose component carries a value in the following segment but
/// which the resource manager does not interpret.
const OPAQUE_WITH_VALUE: &[&str] = &[
    "tcp", "udp", "sctp", "dns", "dns4", "dns6", "dnsaddr", "sni", "unix",
];

/// One typed component of a multiaddress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Component {
    Ip4(Ipv4Addr),
    Ip6(Ipv6Addr),
    /// CIDR prefix length qualifying the preceding IP component.
    IpCidr(u8),
    /// Peer identity, from a `/p2p/<id>` component.
    P2p(PeerId),
    /// Any other protocol, with its value if the protocol carries one.
    Other(String, Option<String>),
}

/// A parsed multiaddress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Multiaddr {
    text: String,
    components: Vec<Component>,
}

impl Multiaddr {
    /// Parse a multiaddress from its canonical slash syntax.
    ///
    /// # Errors
    ///
    /// Returns [`AllowlistError::InvalidMultiaddr`] when the syntax is
    /// malformed or an interpreted component has an invalid value.
    pub fn parse(addr: &str) -> Result<Self, Error> {
        addr.parse()
    }

    #[must_use]
    pub fn components(&self) -> &[Component] {
        &self.components
    }

    /// The first IP component, if any.
    #[must_use]
    pub fn ip(&self) -> Option<IpAddr> {
        self.components.iter().find_map(|c| match c {
            Component::Ip4(ip) => Some(IpAddr::V4(*ip)),
            Component::Ip6(ip) => Some(IpAddr::V6(*ip)),
            _ => None,
        })
    }

    /// The first CIDR prefix length, if any.
    #[must_use]
    pub fn cidr(&self) -> Option<u8> {
        self.components.iter().find_map(|c| match c {
            Component::IpCidr(bits) => Some(*bits),
            _ => None,
        })
    }

    /// The first peer identity component, if any.
    #[must_use]
    pub fn peer(&self) -> Option<&PeerId> {
        self.components.iter().find_map(|c| match c {
            Component::P2p(peer) => Some(peer),
            _ => None,
        })
    }
}

impl fmt::Display for Multiaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

fn invalid(addr: &str, reason: impl Into<String>) -> Error {
    AllowlistError::InvalidMultiaddr {
        addr: addr.to_string(),
        reason: reason.into(),
    }
    .into()
}

impl FromStr for Multiaddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        if !s.starts_with('/') {
            return Err(invalid(s, "multiaddr must begin with '/'"));
        }

        let mut components = Vec::new();
        let mut parts = s.split('/').skip(1);

        while let Some(proto) = parts.next() {
            if proto.is_empty() {
                return Err(invalid(s, "empty protocol segment"));
            }

            let mut value = |what: &str| {
                parts
                    .next()
                    .filter(|v| !v.is_empty())
                    .ok_or_else(|| invalid(s, format!("missing {what} value")))
            };

            match proto {
                "ip4" => {
                    let v = value("ip4")?;
                    let ip = v.parse().map_err(|_| invalid(s, "invalid ip4 address"))?;
                    components.push(Component::Ip4(ip));
                }
                "ip6" => {
                    let v = value("ip6")?;
                    let ip = v.parse().map_err(|_| invalid(s, "invalid ip6 address"))?;
                    components.push(Component::Ip6(ip));
                }
                "ipcidr" => {
                    let v = value("ipcidr")?;
                    let bits = v
                        .parse()
                        .map_err(|_| invalid(s, "invalid cidr prefix length"))?;
                    components.push(Component::IpCidr(bits));
                }
                "p2p" | "ipfs" => {
                    let v = value("p2p")?;
                    components.push(Component::P2p(PeerId::new(v)));
                }
                other if OPAQUE_WITH_VALUE.contains(&other) => {
                    let v = value(other)?;
                    components.push(Component::Other(other.to_string(), Some(v.to_string())));
                }
                other => {
                    components.push(Component::Other(other.to_string(), None));
                }
            }
        }

        if components.is_empty() {
            return Err(invalid(s, "no components"));
        }

        Ok(Self {
            text: s.to_string(),
            components,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ip_and_transport() {
        let ma = Multiaddr::parse("/ip4/1.2.3.4/tcp/1234").unwrap();
        assert_eq!(ma.ip(), Some(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4))));
        assert_eq!(ma.cidr(), None);
        assert_eq!(ma.peer(), None);
        assert_eq!(ma.to_string(), "/ip4/1.2.3.4/tcp/1234");
    }

    #[test]
    fn parses_cidr_and_peer() {
        let ma = Multiaddr::parse("/ip4/1.2.3.0/ipcidr/24/p2p/QmFoo").unwrap();
        assert_eq!(ma.cidr(), Some(24));
        assert_eq!(ma.peer(), Some(&PeerId::from("QmFoo")));
    }

    #[test]
    fn parses_ip6() {
        let ma = Multiaddr::parse("/ip6/::1/udp/4001/quic-v1").unwrap();
        assert_eq!(ma.ip(), Some(IpAddr::V6(Ipv6Addr::LOCALHOST)));
        assert_eq!(
            ma.components().last(),
            Some(&Component::Other("quic-v1".to_string(), None))
        );
    }

    #[test]
    fn rejects_malformed() {
        assert!(Multiaddr::parse("ip4/1.2.3.4").is_err());
        assert!(Multiaddr::parse("/ip4").is_err());
        assert!(Multiaddr::parse("/ip4/not-an-ip").is_err());
        assert!(Multiaddr::parse("/ip4/1.2.3.4/ipcidr/abc").is_err());
        assert!(Multiaddr::parse("/").is_err());
    }
}
