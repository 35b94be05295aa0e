//! Local exceptions per RFC 8416, aka SLURM.

use std::fs;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;

use crate::vrp::{Prefix, Vrp};


//------------ LocalExceptions --------------------------------------------------

/// A parsed SLURM document: what to drop from the upstream VRP set, and
/// what to add to it, applied filter-then-assert.
#[derive(Clone, Debug, Default)]
pub struct LocalExceptions {
    filters: Vec<PrefixFilter>,
    assertions: Vec<Vrp>,
}

impl LocalExceptions {
    pub fn empty() -> Self {
        LocalExceptions::default()
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, LoadError> {
        let data = fs::read_to_string(path)?;
        Self::from_json_str(&data).map_err(LoadError::Parse)
    }

    pub fn from_json_str(data: &str) -> Result<Self, ParseError> {
        let doc: SlurmDocument = serde_json::from_str(data)?;
        Self::from_document(doc)
    }

    fn from_document(doc: SlurmDocument) -> Result<Self, ParseError> {
        if doc.slurm_version != 1 {
            return Err(ParseError::BadVersion(doc.slurm_version));
        }
        let filters = doc.validation_output_filters.prefix_filters
            .into_iter()
            .map(PrefixFilter::from_raw)
            .collect::<Result<Vec<_>, _>>()?;
        let assertions = doc.locally_added_assertions.prefix_assertions
            .into_iter()
            .map(RawAssertion::into_vrp)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(LocalExceptions { filters, assertions })
    }

    /// Whether `vrp` survives the `validationOutputFilters` (`true` means
    /// keep it).
    pub fn keep(&self, vrp: &Vrp) -> bool {
        !self.filters.iter().any(|filter| filter.matches(vrp))
    }

    pub fn assertions(&self) -> &[Vrp] {
        &self.assertions
    }
}


//------------ PrefixFilter ------------------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq)]
struct PrefixFilter {
    prefix: Option<Prefix>,
    asn: Option<u32>,
}

impl PrefixFilter {
    fn from_raw(raw: RawFilter) -> Result<Self, ParseError> {
        let prefix = raw.prefix.as_deref().map(Prefix::from_str).transpose()
            .map_err(|_| ParseError::BadPrefix)?;
        Ok(PrefixFilter { prefix, asn: raw.asn })
    }

    /// A filter matches a VRP when every field it specifies matches —
    /// a prefix filter entry covers the VRP's prefix (same or a less
    /// specific supernet of the same family) and/or the ASN is equal.
    fn matches(&self, vrp: &Vrp) -> bool {
        let prefix_matches = match self.prefix {
            Some(filter_prefix) => covers(filter_prefix, vrp.prefix),
            None => true,
        };
        let asn_matches = match self.asn {
            Some(asn) => asn == vrp.asn,
            None => true,
        };
        // a filter with neither field set matches nothing in practice,
        // but RFC 8416 doesn't forbid it, so this falls through and
        // would reject everything — left to the operator to avoid.
        (self.prefix.is_some() || self.asn.is_some()) && prefix_matches && asn_matches
    }
}

/// True if `outer` is `inner` or a less specific supernet of the same
/// address family covering it.
fn covers(outer: Prefix, inner: Prefix) -> bool {
    match (outer, inner) {
        (Prefix::V4(oa, ol), Prefix::V4(ia, il)) => {
            ol <= il && mask_v4(oa, ol) == mask_v4(ia, ol)
        }
        (Prefix::V6(oa, ol), Prefix::V6(ia, il)) => {
            ol <= il && mask_v6(oa, ol) == mask_v6(ia, ol)
        }
        _ => false,
    }
}

fn mask_v4(addr: Ipv4Addr, len: u8) -> u32 {
    let bits = u32::from(addr);
    if len == 0 { 0 } else { bits & (u32::MAX << (32 - len)) }
}

fn mask_v6(addr: Ipv6Addr, len: u8) -> u128 {
    let bits = u128::from(addr);
    if len == 0 { 0 } else { bits & (u128::MAX << (128 - len)) }
}


//------------ Wire format -------------------------------------------------------

#[derive(Deserialize)]
struct SlurmDocument {
    #[serde(rename = "slurmVersion")]
    slurm_version: u8,
    #[serde(rename = "validationOutputFilters")]
    validation_output_filters: ValidationOutputFilters,
    #[serde(rename = "locallyAddedAssertions")]
    locally_added_assertions: LocallyAddedAssertions,
}

#[derive(Deserialize, Default)]
struct ValidationOutputFilters {
    #[serde(rename = "prefixFilters", default)]
    prefix_filters: Vec<RawFilter>,
    // bgpsecFilters ignored: out of scope, this system doesn't handle
    // router keys.
}

#[derive(Deserialize, Default)]
struct LocallyAddedAssertions {
    #[serde(rename = "prefixAssertions", default)]
    prefix_assertions: Vec<RawAssertion>,
}

#[derive(Deserialize)]
struct RawFilter {
    prefix: Option<String>,
    asn: Option<u32>,
}

#[derive(Deserialize)]
struct RawAssertion {
    prefix: String,
    asn: u32,
    #[serde(rename = "maxPrefixLength")]
    max_prefix_length: Option<u8>,
}

impl RawAssertion {
    fn into_vrp(self) -> Result<Vrp, ParseError> {
        let prefix = Prefix::from_str(&self.prefix).map_err(|_| ParseError::BadPrefix)?;
        let max_length = self.max_prefix_length.unwrap_or_else(|| prefix.network_length());
        Vrp::new(prefix, self.asn, max_length).ok_or(ParseError::InvalidAssertion)
    }
}


//------------ Errors -------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("unsupported slurmVersion {0}")]
    BadVersion(u8),
    #[error("invalid prefix")]
    BadPrefix,
    #[error("assertion violates prefix/max-length invariant")]
    InvalidAssertion,
    #[error("malformed SLURM JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    Parse(ParseError),
}


#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY: &str = r#"{
        "slurmVersion": 1,
        "validationOutputFilters": { "prefixFilters": [], "bgpsecFilters": [] },
        "locallyAddedAssertions": { "prefixAssertions": [], "bgpsecAssertions": [] }
    }"#;

    const FULL: &str = r#"{
        "slurmVersion": 1,
        "validationOutputFilters": {
            "prefixFilters": [
                { "prefix": "192.0.2.0/24", "comment": "drop by prefix" },
                { "asn": 64496, "comment": "drop by asn" },
                { "prefix": "198.51.100.0/24", "asn": 64497, "comment": "drop by both" }
            ],
            "bgpsecFilters": []
        },
        "locallyAddedAssertions": {
            "prefixAssertions": [
                { "asn": 64496, "prefix": "198.51.100.0/24", "maxPrefixLength": 24 },
                { "asn": 64496, "prefix": "2001:DB8::/32", "maxPrefixLength": 48 }
            ],
            "bgpsecAssertions": []
        }
    }"#;

    #[test]
    fn parses_empty_document() {
        let exceptions = LocalExceptions::from_json_str(EMPTY).unwrap();
        assert!(exceptions.assertions().is_empty());
        assert!(exceptions.keep(
            &Vrp::new(Prefix::from_str("10.0.0.0/24").unwrap(), 1, 24).unwrap()
        ));
    }

    #[test]
    fn parses_full_document() {
        let exceptions = LocalExceptions::from_json_str(FULL).unwrap();
        assert_eq!(exceptions.assertions().len(), 2);
        assert!(exceptions.assertions().contains(
            &Vrp::new(Prefix::from_str("198.51.100.0/24").unwrap(), 64496, 24).unwrap()
        ));
    }

    #[test]
    fn filter_by_prefix_drops_covered_vrps() {
        let exceptions = LocalExceptions::from_json_str(FULL).unwrap();
        let vrp = Vrp::new(Prefix::from_str("192.0.2.128/25").unwrap(), 1, 25).unwrap();
        assert!(!exceptions.keep(&vrp));
    }

    #[test]
    fn filter_by_asn_drops_any_matching_prefix() {
        let exceptions = LocalExceptions::from_json_str(FULL).unwrap();
        let vrp = Vrp::new(Prefix::from_str("203.0.113.0/24").unwrap(), 64496, 24).unwrap();
        assert!(!exceptions.keep(&vrp));
    }

    #[test]
    fn filter_requiring_both_needs_both_to_match() {
        let exceptions = LocalExceptions::from_json_str(FULL).unwrap();
        let wrong_asn = Vrp::new(
            Prefix::from_str("198.51.100.0/24").unwrap(), 1, 24,
        ).unwrap();
        assert!(exceptions.keep(&wrong_asn));
    }

    #[test]
    fn unrelated_vrp_is_kept() {
        let exceptions = LocalExceptions::from_json_str(FULL).unwrap();
        let vrp = Vrp::new(Prefix::from_str("10.0.0.0/8").unwrap(), 1, 8).unwrap();
        assert!(exceptions.keep(&vrp));
    }
}
