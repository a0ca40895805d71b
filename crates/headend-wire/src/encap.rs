//! Tunnel encapsulation for mirrored packets.
//!
//! Each format prepends a fixed-size header to the observed payload; the
//! payload itself is never modified, so stripping [`Encapsulation::header_len`]
//! bytes recovers it exactly.

use std::fmt;
use std::str::FromStr;

/// VXLAN header length
pub const VXLAN_HEADER_LEN: usize = 8;
/// GRE header length (no optional fields)
pub const GRE_HEADER_LEN: usize = 4;
/// ERSPAN Type II header length
pub const ERSPAN_HEADER_LEN: usize = 8;

/// VNI used when none is configured
pub const DEFAULT_VNI: u32 = 1;

/// "Instance valid" flag in the first VXLAN byte
const VXLAN_FLAG_I: u8 = 0x08;
/// IPv4 ether-type carried in the GRE protocol field
const ETHERTYPE_IPV4: u16 = 0x0800;
/// ERSPAN Type II version number
const ERSPAN_VERSION_II: u16 = 1;

/// ERSPAN header parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ErspanParams {
    /// 12-bit VLAN id
    pub vlan: u16,
    /// 10-bit session id
    pub session_id: u16,
}

/// Encapsulation selected by the configured protocol tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encapsulation {
    /// VXLAN with a 24-bit virtual network id
    Vxlan {
        /// Virtual network id (low 24 bits used)
        vni: u32,
    },
    /// Plain GRE carrying IPv4
    Gre,
    /// ERSPAN Type II
    Erspan(ErspanParams),
    /// Unrecognized tag: payload forwarded unmodified
    Raw,
}

impl Encapsulation {
    /// Size of the header this encapsulation prepends
    #[must_use]
    pub fn header_len(&self) -> usize {
        match self {
            Self::Vxlan { .. } => VXLAN_HEADER_LEN,
            Self::Gre => GRE_HEADER_LEN,
            Self::Erspan(_) => ERSPAN_HEADER_LEN,
            Self::Raw => 0,
        }
    }

    /// Short tag, matching the configuration values
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Vxlan { .. } => "vxlan",
            Self::Gre => "gre",
            Self::Erspan(_) => "erspan",
            Self::Raw => "raw",
        }
    }

    /// Encapsulate `payload`. `unix_secs` feeds the rolling ERSPAN index and
    /// is ignored by the other formats.
    #[must_use]
    pub fn encapsulate(&self, payload: &[u8], unix_secs: u64) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.header_len() + payload.len());
        match *self {
            Self::Vxlan { vni } => {
                out.extend_from_slice(&[VXLAN_FLAG_I, 0, 0, 0]);
                out.extend_from_slice(&((vni & 0x00FF_FFFF) << 8).to_be_bytes());
            }
            Self::Gre => {
                out.extend_from_slice(&0u16.to_be_bytes());
                out.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
            }
            Self::Erspan(params) => {
                let ver_vlan = (ERSPAN_VERSION_II << 12) | (params.vlan & 0x0FFF);
                let session = params.session_id & 0x03FF;
                #[allow(clippy::cast_possible_truncation)]
                let index = (unix_secs & 0x000F_FFFF) as u32;
                out.extend_from_slice(&ver_vlan.to_be_bytes());
                out.extend_from_slice(&session.to_be_bytes());
                out.extend_from_slice(&index.to_be_bytes());
            }
            Self::Raw => {}
        }
        out.extend_from_slice(payload);
        out
    }

    /// Strip this encapsulation's header. Returns `None` when `frame` is
    /// shorter than the header.
    #[must_use]
    pub fn decapsulate<'a>(&self, frame: &'a [u8]) -> Option<&'a [u8]> {
        frame.get(self.header_len()..)
    }
}

impl FromStr for Encapsulation {
    type Err = std::convert::Infallible;

    /// Unknown tags map to [`Encapsulation::Raw`]; parameters take defaults.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "vxlan" => Self::Vxlan { vni: DEFAULT_VNI },
            "gre" => Self::Gre,
            "erspan" => Self::Erspan(ErspanParams::default()),
            _ => Self::Raw,
        })
    }
}

impl fmt::Display for Encapsulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: &[u8] = b"GET / HTTP/1.1\r\nHost: api.internal\r\n\r\n";

    #[test]
    fn vxlan_header_layout() {
        let frame = Encapsulation::Vxlan { vni: 0x0012_3456 }.encapsulate(PAYLOAD, 0);
        assert_eq!(frame.len(), VXLAN_HEADER_LEN + PAYLOAD.len());
        assert_eq!(&frame[..8], &[0x08, 0, 0, 0, 0x12, 0x34, 0x56, 0x00]);
    }

    #[test]
    fn vxlan_default_vni() {
        let enc: Encapsulation = "VXLAN".parse().unwrap();
        let frame = enc.encapsulate(b"x", 0);
        assert_eq!(&frame[4..8], &[0, 0, 1, 0]);
    }

    #[test]
    fn gre_header_layout() {
        let frame = Encapsulation::Gre.encapsulate(PAYLOAD, 0);
        assert_eq!(&frame[..4], &[0x00, 0x00, 0x08, 0x00]);
    }

    #[test]
    fn erspan_header_layout() {
        let enc = Encapsulation::Erspan(ErspanParams { vlan: 0x0AB, session_id: 0x3FF });
        let frame = enc.encapsulate(PAYLOAD, 0x0012_3456_789A);
        assert_eq!(&frame[..2], &[0x10, 0xAB]);
        assert_eq!(&frame[2..4], &[0x03, 0xFF]);
        // 20-bit index: low bits of the timestamp only
        assert_eq!(&frame[4..8], &[0x00, 0x06, 0x78, 0x9A]);
    }

    #[test]
    fn decapsulation_recovers_payload() {
        for enc in [
            Encapsulation::Vxlan { vni: 7 },
            Encapsulation::Gre,
            Encapsulation::Erspan(ErspanParams::default()),
            Encapsulation::Raw,
        ] {
            let frame = enc.encapsulate(PAYLOAD, 1_700_000_000);
            assert_eq!(enc.decapsulate(&frame), Some(PAYLOAD), "{enc}");
        }
    }

    #[test]
    fn unknown_tag_passes_through() {
        let enc: Encapsulation = "sflow".parse().unwrap();
        assert_eq!(enc, Encapsulation::Raw);
        assert_eq!(enc.encapsulate(PAYLOAD, 0), PAYLOAD);
    }
}
