//! IP allowlist rules for role records
//!
//! An allowlist entry is either an exact address literal or a CIDR prefix.
//! Entries are parsed once, when a role is written; evaluation only ever sees
//! well-formed [`IpRule`] values.

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use super::ValidationError;

/// A single parsed `allowedIPs` entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum IpRule {
    /// Matches one address exactly
    Exact(IpAddr),
    /// Matches every address inside the prefix
    Cidr(IpNetwork),
}

impl IpRule {
    /// Parse an allowlist entry, rejecting anything that is not a plain
    /// IPv4/IPv6 literal or `address/prefix` pair.
    ///
    /// IPv6 zone ids (`fe80::1%eth0`) are rejected explicitly.
    pub fn parse(entry: &str) -> Result<Self, ValidationError> {
        let trimmed = entry.trim();
        let malformed = |reason: &str| ValidationError::MalformedIpEntry {
            entry: entry.to_string(),
            reason: reason.to_string(),
        };

        if trimmed.is_empty() {
            return Err(malformed("empty entry"));
        }
        if trimmed.contains('%') {
            return Err(malformed("zone ids are not supported"));
        }

        match trimmed.split_once('/') {
            None => trimmed
                .parse::<IpAddr>()
                .map(IpRule::Exact)
                .map_err(|_| malformed("not an IP address")),
            Some((address, prefix)) => {
                let address = address
                    .parse::<IpAddr>()
                    .map_err(|_| malformed("not an IP address"))?;
                let prefix = prefix
                    .parse::<u8>()
                    .map_err(|_| malformed("prefix length is not a number"))?;
                IpNetwork::new(address, prefix)
                    .map(IpRule::Cidr)
                    .map_err(|_| malformed("prefix length out of range for address family"))
            }
        }
    }

    /// Whether `caller` is covered by this rule
    ///
    /// Addresses of different families never match each other, so an
    /// IPv4-mapped IPv6 caller does not match an IPv4 rule.
    pub fn matches(&self, caller: &IpAddr) -> bool {
        match self {
            IpRule::Exact(address) => address == caller,
            IpRule::Cidr(network) => match (network, caller) {
                (IpNetwork::V4(net), IpAddr::V4(ip)) => net.contains(*ip),
                (IpNetwork::V6(net), IpAddr::V6(ip)) => net.contains(*ip),
                _ => false,
            },
        }
    }
}

impl FromStr for IpRule {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        IpRule::parse(s)
    }
}

impl TryFrom<String> for IpRule {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        IpRule::parse(&value)
    }
}

impl From<IpRule> for String {
    fn from(rule: IpRule) -> Self {
        rule.to_string()
    }
}

impl fmt::Display for IpRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpRule::Exact(address) => write!(f, "{}", address),
            IpRule::Cidr(network) => write!(f, "{}/{}", network.ip(), network.prefix()),
        }
    }
}
