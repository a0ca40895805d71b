//! Port-range grammar.
//!
//! An expression is a comma-separated list of tokens, each either a single
//! port (`8080`) or an inclusive range (`9000-9010`). Whitespace around
//! tokens is ignored and empty tokens (for example a trailing comma) are
//! skipped, so `""` is the empty set.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Transport protocol a range applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortProtocol {
    /// Stream listeners
    Tcp,
    /// Datagram listeners
    Udp,
}

impl PortProtocol {
    /// Lowercase protocol tag
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for PortProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced while parsing or validating port ranges.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortRangeError {
    /// A token is neither `N` nor `N-M`.
    #[error("invalid {protocol} port range token '{token}'")]
    Malformed {
        /// Protocol of the expression being parsed
        protocol: PortProtocol,
        /// Offending token
        token: String,
    },

    /// A port is outside `1..=65535`.
    #[error("{protocol} port {port} out of range (1-65535)")]
    OutOfRange {
        /// Protocol of the expression being parsed
        protocol: PortProtocol,
        /// Offending value as written
        port: u64,
    },

    /// `start > end`.
    #[error("{protocol} port range {start}-{end} is reversed")]
    Reversed {
        /// Protocol of the expression being parsed
        protocol: PortProtocol,
        /// Range start
        start: u16,
        /// Range end
        end: u16,
    },

    /// The same `(protocol, port)` pair appears more than once.
    #[error("duplicate {protocol} port {port}")]
    Duplicate {
        /// Protocol of the duplicated port
        protocol: PortProtocol,
        /// Duplicated port
        port: u16,
    },
}

/// Inclusive port range for one protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    /// First port (inclusive)
    pub start: u16,
    /// Last port (inclusive)
    pub end: u16,
    /// Protocol
    pub protocol: PortProtocol,
}

impl PortRange {
    /// Number of concrete ports in the range
    #[must_use]
    pub fn len(&self) -> usize {
        usize::from(self.end - self.start) + 1
    }

    /// Ranges are never empty once parsed; provided for clippy symmetry.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Iterate over every port in the range
    pub fn ports(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Parse one expression for a single protocol.
pub fn parse_ranges(expr: &str, protocol: PortProtocol) -> Result<Vec<PortRange>, PortRangeError> {
    let mut ranges = Vec::new();
    for token in expr.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let (start, end) = match token.split_once('-') {
            Some((a, b)) => (parse_port(a.trim(), token, protocol)?, parse_port(b.trim(), token, protocol)?),
            None => {
                let p = parse_port(token, token, protocol)?;
                (p, p)
            }
        };
        if start > end {
            return Err(PortRangeError::Reversed { protocol, start, end });
        }
        ranges.push(PortRange { start, end, protocol });
    }
    Ok(ranges)
}

fn parse_port(raw: &str, token: &str, protocol: PortProtocol) -> Result<u16, PortRangeError> {
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(PortRangeError::Malformed {
            protocol,
            token: token.to_string(),
        });
    }
    // Digits only, so the only parse failure left is overflow.
    let value: u64 = raw.parse().unwrap_or(u64::MAX);
    if value == 0 || value > u64::from(u16::MAX) {
        return Err(PortRangeError::OutOfRange { protocol, port: value });
    }
    #[allow(clippy::cast_possible_truncation)]
    Ok(value as u16)
}

/// A full TCP + UDP port configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRangeSet {
    /// TCP ranges
    pub tcp: Vec<PortRange>,
    /// UDP ranges
    pub udp: Vec<PortRange>,
}

impl PortRangeSet {
    /// Parse both expressions. Does not check for duplicates; see [`Self::validate`].
    pub fn parse(tcp_expr: &str, udp_expr: &str) -> Result<Self, PortRangeError> {
        Ok(Self {
            tcp: parse_ranges(tcp_expr, PortProtocol::Tcp)?,
            udp: parse_ranges(udp_expr, PortProtocol::Udp)?,
        })
    }

    /// Parse and validate in one step.
    pub fn parse_validated(tcp_expr: &str, udp_expr: &str) -> Result<Self, PortRangeError> {
        let set = Self::parse(tcp_expr, udp_expr)?;
        set.validate()?;
        Ok(set)
    }

    /// Reject duplicate `(protocol, port)` pairs across the configuration.
    pub fn validate(&self) -> Result<(), PortRangeError> {
        let mut seen = BTreeSet::new();
        for range in self.tcp.iter().chain(&self.udp) {
            for port in range.ports() {
                if !seen.insert((range.protocol, port)) {
                    return Err(PortRangeError::Duplicate {
                        protocol: range.protocol,
                        port,
                    });
                }
            }
        }
        Ok(())
    }

    /// Every concrete `(protocol, port)` pair, TCP first.
    #[must_use]
    pub fn expand(&self) -> Vec<(PortProtocol, u16)> {
        self.tcp
            .iter()
            .chain(&self.udp)
            .flat_map(|r| r.ports().map(move |p| (r.protocol, p)))
            .collect()
    }

    /// Total number of concrete ports
    #[must_use]
    pub fn port_count(&self) -> usize {
        self.tcp.iter().chain(&self.udp).map(PortRange::len).sum()
    }

    /// `true` when neither protocol has any range
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tcp.is_empty() && self.udp.is_empty()
    }

    /// Render the TCP ranges back into an expression
    #[must_use]
    pub fn tcp_expr(&self) -> String {
        join(&self.tcp)
    }

    /// Render the UDP ranges back into an expression
    #[must_use]
    pub fn udp_expr(&self) -> String {
        join(&self.udp)
    }
}

fn join(ranges: &[PortRange]) -> String {
    ranges.iter().map(ToString::to_string).collect::<Vec<_>>().join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_ports_and_ranges() {
        let ranges = parse_ranges("80, 443,9000-9002", PortProtocol::Tcp).unwrap();
        assert_eq!(ranges.len(), 3);
        assert_eq!(ranges[2].start, 9000);
        assert_eq!(ranges[2].end, 9002);
        assert_eq!(ranges[2].len(), 3);
    }

    #[test]
    fn empty_expression_is_empty_set() {
        assert!(parse_ranges("", PortProtocol::Udp).unwrap().is_empty());
        assert!(parse_ranges(" , ", PortProtocol::Udp).unwrap().is_empty());
    }

    #[test]
    fn rejects_reversed_range() {
        let err = parse_ranges("9002-9000", PortProtocol::Tcp).unwrap_err();
        assert!(matches!(err, PortRangeError::Reversed { start: 9002, end: 9000, .. }));
    }

    #[test]
    fn rejects_out_of_range_ports() {
        assert!(matches!(
            parse_ranges("0", PortProtocol::Tcp),
            Err(PortRangeError::OutOfRange { port: 0, .. })
        ));
        assert!(matches!(
            parse_ranges("65536", PortProtocol::Tcp),
            Err(PortRangeError::OutOfRange { port: 65536, .. })
        ));
        assert!(matches!(
            parse_ranges("1-99999999999999999999999", PortProtocol::Tcp),
            Err(PortRangeError::OutOfRange { .. })
        ));
    }

    #[test]
    fn rejects_malformed_tokens() {
        for bad in ["abc", "80-", "-80", "80-90-100", "8o", "+80", "80 90"] {
            assert!(
                matches!(parse_ranges(bad, PortProtocol::Tcp), Err(PortRangeError::Malformed { .. })),
                "{bad} should be malformed"
            );
        }
    }

    #[test]
    fn duplicates_within_protocol_are_rejected() {
        let set = PortRangeSet::parse("9000-9005,9003", "").unwrap();
        assert_eq!(
            set.validate(),
            Err(PortRangeError::Duplicate {
                protocol: PortProtocol::Tcp,
                port: 9003
            })
        );
    }

    #[test]
    fn same_port_on_both_protocols_is_allowed() {
        let set = PortRangeSet::parse_validated("53", "53").unwrap();
        assert_eq!(set.expand(), vec![(PortProtocol::Tcp, 53), (PortProtocol::Udp, 53)]);
    }

    #[test]
    fn expansion_matches_textual_ranges() {
        let set = PortRangeSet::parse_validated("9000-9002,9100", "5000-5001").unwrap();
        assert_eq!(set.port_count(), 6);
        let expanded = set.expand();
        assert_eq!(expanded.len(), 6);
        assert!(expanded.contains(&(PortProtocol::Tcp, 9001)));
        assert!(expanded.contains(&(PortProtocol::Udp, 5001)));
        assert!(!expanded.contains(&(PortProtocol::Udp, 9001)));
    }

    #[test]
    fn renders_back_to_expression() {
        let set = PortRangeSet::parse("80, 9000-9002", "53").unwrap();
        assert_eq!(set.tcp_expr(), "80,9000-9002");
        assert_eq!(set.udp_expr(), "53");
    }
}
