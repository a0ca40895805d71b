//! Wire-level primitives shared by the headend data plane.
//!
//! Everything here is synchronous and allocation-light so it can be unit
//! tested without a runtime:
//!
//! - [`ports`]: the `N` / `N-M` port-range grammar
//! - [`encap`]: VXLAN, GRE and ERSPAN Type II headers for mirrored packets
//! - [`preamble`]: the token/target header carried at the start of a raw
//!   TCP stream or UDP datagram

pub mod encap;
pub mod ports;
pub mod preamble;

pub use encap::{Encapsulation, ErspanParams};
pub use ports::{PortProtocol, PortRange, PortRangeError, PortRangeSet};
pub use preamble::{Preamble, PreambleError, MAX_PREAMBLE_LEN};
