//! Validated ROA Payloads.
//!
//! A [`Vrp`] is the atomic record this whole system moves around: an IP
//! prefix, the AS number allowed to originate it, and the longest prefix
//! length that origination may use, subject to the invariants enforced
//! in [`Vrp::new`].

use std::cmp::Ordering;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};


//------------ Prefix ---------------------------------------------------------

/// An IP prefix with its network length.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Prefix {
    V4(Ipv4Addr, u8),
    V6(Ipv6Addr, u8),
}

impl Prefix {
    /// The width of the address family this prefix belongs to.
    pub fn family_width(self) -> u8 {
        match self {
            Prefix::V4(..) => 32,
            Prefix::V6(..) => 128,
        }
    }

    pub fn network_length(self) -> u8 {
        match self {
            Prefix::V4(_, len) | Prefix::V6(_, len) => len,
        }
    }

    pub fn is_v4(self) -> bool {
        matches!(self, Prefix::V4(..))
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Prefix::V4(addr, len) => write!(f, "{}/{}", addr, len),
            Prefix::V6(addr, len) => write!(f, "{}/{}", addr, len),
        }
    }
}

impl FromStr for Prefix {
    type Err = PrefixParseError;

    /// Parses a prefix in `addr/len` notation.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, len) = s.split_once('/').ok_or(PrefixParseError)?;
        let len = u8::from_str(len).map_err(|_| PrefixParseError)?;
        if let Ok(addr) = Ipv4Addr::from_str(addr) {
            return Ok(Prefix::V4(addr, len));
        }
        if let Ok(addr) = Ipv6Addr::from_str(addr) {
            return Ok(Prefix::V6(addr, len));
        }
        Err(PrefixParseError)
    }
}

/// Ordering matches the triple (family, address, length) so that a
/// `BTreeSet<Vrp>` walks v4 before v6 and groups by prefix within a family,
/// which is what the client session FSM wants when it groups PDUs by
/// family.
impl Ord for Prefix {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Prefix::V4(a, al), Prefix::V4(b, bl)) => {
                a.octets().cmp(&b.octets()).then(al.cmp(bl))
            }
            (Prefix::V6(a, al), Prefix::V6(b, bl)) => {
                a.octets().cmp(&b.octets()).then(al.cmp(bl))
            }
            (Prefix::V4(..), Prefix::V6(..)) => Ordering::Less,
            (Prefix::V6(..), Prefix::V4(..)) => Ordering::Greater,
        }
    }
}

impl PartialOrd for Prefix {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}


//------------ PrefixParseError -----------------------------------------------

#[derive(Clone, Copy, Debug, thiserror::Error)]
#[error("invalid prefix")]
pub struct PrefixParseError;


//------------ Vrp -------------------------------------------------------------

/// A Validated ROA Payload.
///
/// Identity for deduplication is the triple `(prefix, asn, max_length)` —
/// `Eq`, `Ord` and `Hash` are all derived over exactly those three fields,
/// which is also the order `BTreeSet<Vrp>` uses to walk a [`VrpSet`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Vrp {
    pub prefix: Prefix,
    pub asn: u32,
    pub max_length: u8,
}

impl Vrp {
    /// Builds a `Vrp`, enforcing that the prefix length fits its family
    /// and that `max_length` is no shorter than the prefix length.
    ///
    /// Returns `None` if the network length is zero, or if
    /// `network_length <= max_length <= family_width` does not hold.
    pub fn new(prefix: Prefix, asn: u32, max_length: u8) -> Option<Self> {
        let len = prefix.network_length();
        if len == 0 {
            return None;
        }
        if len > max_length || max_length > prefix.family_width() {
            return None;
        }
        Some(Vrp { prefix, asn, max_length })
    }

    pub fn is_v4(&self) -> bool {
        self.prefix.is_v4()
    }
}

impl fmt::Display for Vrp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} => AS{} max {}", self.prefix, self.asn, self.max_length)
    }
}


//------------ Upstream JSON wire format --------------------------------------

/// The document served by the upstream VRP cache.
#[derive(Debug, Deserialize, Serialize)]
pub struct VrpDocument {
    pub metadata: VrpMetadata,
    pub roas: Vec<RawRoa>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct VrpMetadata {
    pub buildtime: String,
    #[serde(default)]
    pub counts: usize,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A single entry as it appears on the wire, before validation.
///
/// `asn` and `prefix` accept either the string or bare forms the wire
/// format allows: `"AS12345"`/`12345`, `"10.0.0.0/24"`.
#[derive(Debug, Deserialize, Serialize)]
pub struct RawRoa {
    pub prefix: String,
    pub asn: AsnValue,
    #[serde(rename = "maxLength")]
    pub max_length: u8,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum AsnValue {
    Number(u32),
    Text(String),
}

impl AsnValue {
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            AsnValue::Number(n) => Some(*n),
            AsnValue::Text(s) => {
                s.strip_prefix("AS").unwrap_or(s).parse().ok()
            }
        }
    }
}

impl RawRoa {
    /// Validates and converts a raw wire entry into a [`Vrp`].
    ///
    /// Returns `None` for any entry that fails the invariant check; the
    /// caller is expected to count and skip these as entry-level decode
    /// errors rather than rejecting the whole document.
    pub fn into_vrp(self) -> Option<Vrp> {
        let prefix = Prefix::from_str(&self.prefix).ok()?;
        let asn = self.asn.as_u32()?;
        Vrp::new(prefix, asn, self.max_length)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_network_length_above_max_length() {
        let prefix = Prefix::V4(Ipv4Addr::new(10, 0, 0, 0), 24);
        assert!(Vrp::new(prefix, 1, 23).is_none());
    }

    #[test]
    fn rejects_max_length_above_family_width() {
        let prefix = Prefix::V4(Ipv4Addr::new(10, 0, 0, 0), 24);
        assert!(Vrp::new(prefix, 1, 33).is_none());
    }

    #[test]
    fn rejects_zero_network_length() {
        let prefix = Prefix::V4(Ipv4Addr::new(0, 0, 0, 0), 0);
        assert!(Vrp::new(prefix, 1, 24).is_none());
    }

    #[test]
    fn accepts_valid_vrp() {
        let prefix = Prefix::V4(Ipv4Addr::new(10, 0, 0, 0), 24);
        assert!(Vrp::new(prefix, 1, 24).is_some());
    }

    #[test]
    fn asn_accepts_prefixed_and_plain() {
        assert_eq!(AsnValue::Text("AS64496".into()).as_u32(), Some(64496));
        assert_eq!(AsnValue::Number(64496).as_u32(), Some(64496));
    }

    #[test]
    fn prefix_ordering_groups_v4_before_v6() {
        let v4 = Prefix::V4(Ipv4Addr::new(10, 0, 0, 0), 24);
        let v6 = Prefix::V6(Ipv6Addr::from_str("2001:db8::").unwrap(), 32);
        assert!(v4 < v6);
    }
}
