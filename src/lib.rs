//! Port forwarding client library for NAT traversal.
//!
//! Opens inbound TCP ports on a consumer gateway by speaking the two
//! standard gateway-control protocols: UPnP IGD (SSDP discovery plus SOAP
//! control requests against WANIPConnection/WANPPPConnection) and NAT-PMP
//! (RFC 6886). Backends share one client surface; the selector probes them
//! in a fixed order and the first to respond wins.

pub mod client;
pub mod error;
pub mod gateway;
pub mod httpu;
pub mod natpmp;
pub mod ssdp;
pub mod upnp;

pub use client::{Client, Options};
pub use error::{Error, Result};
