//! Trusted network ranges.
//!
//! Peers inside a configured range are exempt from identity resolution: the
//! request is allowed through with no identity headers and the directory is
//! never consulted. The range set is parsed once at startup and immutable
//! afterwards; a malformed entry is a fatal configuration error, not a
//! runtime one.

use std::net::IpAddr;

use ipnet::IpNet;

use crate::error::GateError;

/// An immutable set of trusted network prefixes.
#[derive(Debug, Clone, Default)]
pub struct TrustedRanges {
    ranges: Vec<IpNet>,
}

impl TrustedRanges {
    /// Parse a comma-separated list of CIDR prefixes.
    ///
    /// Empty input (or input that is only whitespace) yields an empty set,
    /// meaning no peer is ever bypassed. Any entry that fails to parse aborts
    /// startup with [`GateError::InvalidTrustedRange`].
    pub fn parse(list: &str) -> Result<Self, GateError> {
        let mut ranges = Vec::new();
        for entry in list.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let net = entry
                .parse::<IpNet>()
                .map_err(|source| GateError::InvalidTrustedRange {
                    range: entry.to_string(),
                    source,
                })?;
            ranges.push(net);
        }
        Ok(Self { ranges })
    }

    /// Whether `ip` falls within any configured prefix.
    ///
    /// Pure membership test; any match short-circuits, order is irrelevant.
    pub fn contains(&self, ip: IpAddr) -> bool {
        self.ranges.iter().any(|net| net.contains(&ip))
    }

    /// Number of configured prefixes.
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// True when no prefixes are configured.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}
