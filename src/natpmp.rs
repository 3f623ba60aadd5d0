//! NAT-PMP (RFC 6886) client.
//!
//! The gateway is driven over a connected UDP socket on port 5351. Packet
//! encoding and decoding are pure over byte buffers; the request driver
//! retransmits with exponentially growing deadlines and drops stale replies
//! by opcode.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use log::debug;
use tokio::net::UdpSocket;
use tokio::time::{sleep_until, timeout_at, Instant};

use crate::error::{Error, Result};
use crate::gateway;

pub const METHOD_NAME: &str = "NAT-PMP";

const NATPMP_PORT: u16 = 5351;
/// Local port for outgoing requests (0 = any free port).
#[allow(dead_code)]
const OUTGOING_PORT: u16 = 0;

// ============================================================================
// Wire format
// ============================================================================

const VERSION: u8 = 0;

const OP_EXTERNAL_ADDRESS: u8 = 0;
#[allow(dead_code)]
const OP_MAP_UDP: u8 = 1;
const OP_MAP_TCP: u8 = 2;
/// ORed into the request opcode to mark a response.
const OP_RESPONSE_OFFSET: u8 = 128;

const RES_SUCCESS: u16 = 0;
const RES_UNSUPPORTED_VERSION: u16 = 1;
const RES_NOT_AUTHORIZED: u16 = 2;
const RES_NETWORK_FAILURE: u16 = 3;
const RES_OUT_OF_RESOURCES: u16 = 4;
const RES_UNSUPPORTED_OPCODE: u16 = 5;

/// Maximum UDP payload worth reading, from RFC 6887.
const MAX_PACKET_LEN: usize = 1100;
const HDR_LEN: usize = 4;
const EXTERNAL_ADDRESS_RESP_LEN: usize = HDR_LEN + 8;
const MAPPING_REQ_LEN: usize = HDR_LEN + 8;
const MAPPING_RESP_LEN: usize = HDR_LEN + 12;

/// Lease requested when the caller passes a duration of 0.
const DEFAULT_MAPPING_DURATION: u32 = 7200;
const INITIAL_TIMEOUT: Duration = Duration::from_millis(250);
/// The RFC says 9 retries, but that takes far too long.
const MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Request {
    ExternalAddress,
    Mapping {
        internal_port: u16,
        external_port: u16,
        lifetime_seconds: u32,
    },
}

impl Request {
    fn opcode(&self) -> u8 {
        match self {
            Request::ExternalAddress => OP_EXTERNAL_ADDRESS,
            Request::Mapping { .. } => OP_MAP_TCP,
        }
    }

    fn encode(&self) -> Vec<u8> {
        match *self {
            //   0                   1
            //  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5
            // +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
            // | Vers = 0      | OP = 0        |
            // +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
            Request::ExternalAddress => vec![VERSION, OP_EXTERNAL_ADDRESS],
            //   0                   1                   2                   3
            //  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
            // +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
            // | Vers = 0      | OP = x        | Reserved                      |
            // +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
            // | Internal Port                 | Suggested External Port       |
            // +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
            // | Requested Port Mapping Lifetime in Seconds                    |
            // +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
            Request::Mapping {
                internal_port,
                external_port,
                lifetime_seconds,
            } => {
                let mut raw = vec![0u8; MAPPING_REQ_LEN];
                raw[0] = VERSION;
                raw[1] = OP_MAP_TCP;
                // raw[2..4] is reserved and must be zero.
                raw[4..6].copy_from_slice(&internal_port.to_be_bytes());
                raw[6..8].copy_from_slice(&external_port.to_be_bytes());
                raw[8..12].copy_from_slice(&lifetime_seconds.to_be_bytes());
                raw
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Response {
    ExternalAddress {
        epoch_seconds: u32,
        external_ip: Ipv4Addr,
    },
    Mapping {
        epoch_seconds: u32,
        internal_port: u16,
        mapped_port: u16,
        lifetime_seconds: u32,
    },
}

/// Checks the common header against the request's opcode and returns the
/// result code.
fn decode_header(raw: &[u8], request_op: u8) -> Result<u16> {
    if raw.len() < HDR_LEN {
        return Err(Error::Protocol(format!(
            "packet too short to contain header: {}",
            raw.len()
        )));
    }
    if raw[0] != VERSION {
        return Err(Error::Protocol(format!(
            "unsupported version in response: {}",
            raw[0]
        )));
    }
    if raw[1] != request_op | OP_RESPONSE_OFFSET {
        return Err(Error::Protocol(format!(
            "response opcode does not match request: {}",
            raw[1]
        )));
    }
    Ok(u16::from_be_bytes([raw[2], raw[3]]))
}

fn result_code_error(code: u16) -> Error {
    match code {
        RES_UNSUPPORTED_VERSION => Error::Refused("unsupported NAT-PMP version"),
        RES_NOT_AUTHORIZED => Error::Refused("not authorized/refused"),
        RES_NETWORK_FAILURE => Error::Refused("network failure"),
        RES_OUT_OF_RESOURCES => Error::Refused("out of resources"),
        RES_UNSUPPORTED_OPCODE => Error::Refused("unsupported opcode"),
        _ => Error::Protocol(format!("unknown result code: {code}")),
    }
}

//  0                   1                   2                   3
//  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// | Vers = 0      | OP = 128 + 0  | Result Code (net byte order)  |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// | Seconds Since Start of Epoch (in network byte order)          |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// | External IPv4 Address (a.b.c.d)                               |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
fn decode_external_address_resp(raw: &[u8]) -> Result<Response> {
    let code = decode_header(raw, OP_EXTERNAL_ADDRESS)?;
    if code != RES_SUCCESS {
        return Err(result_code_error(code));
    }
    if raw.len() != EXTERNAL_ADDRESS_RESP_LEN {
        return Err(Error::Protocol(format!(
            "invalid packet length: {}",
            raw.len()
        )));
    }
    Ok(Response::ExternalAddress {
        epoch_seconds: u32::from_be_bytes(raw[4..8].try_into().unwrap()),
        external_ip: Ipv4Addr::new(raw[8], raw[9], raw[10], raw[11]),
    })
}

//  0                   1                   2                   3
//  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// | Vers = 0      | OP = 128 + x  | Result Code                   |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// | Seconds Since Start of Epoch                                  |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// | Internal Port                 | Mapped External Port          |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// | Port Mapping Lifetime in Seconds                              |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
fn decode_mapping_resp(request_internal_port: u16, raw: &[u8]) -> Result<Response> {
    let code = decode_header(raw, OP_MAP_TCP)?;
    if code != RES_SUCCESS {
        return Err(result_code_error(code));
    }
    if raw.len() != MAPPING_RESP_LEN {
        return Err(Error::Protocol(format!(
            "invalid packet length: {}",
            raw.len()
        )));
    }
    let internal_port = u16::from_be_bytes([raw[8], raw[9]]);
    if internal_port != request_internal_port {
        // A reply left over from an earlier request for another port.
        return Err(Error::Protocol(format!(
            "mapping response for a different internal port: {internal_port}"
        )));
    }
    Ok(Response::Mapping {
        epoch_seconds: u32::from_be_bytes(raw[4..8].try_into().unwrap()),
        internal_port,
        mapped_port: u16::from_be_bytes([raw[10], raw[11]]),
        lifetime_seconds: u32::from_be_bytes(raw[12..16].try_into().unwrap()),
    })
}

// ============================================================================
// Request driver
// ============================================================================

/// Sends the request and waits for a matching response, retransmitting with
/// deadlines of 250 ms, 500 ms and 1000 ms.
async fn issue_request(socket: &UdpSocket, request: &Request) -> Result<Response> {
    let raw_request = request.encode();
    let mut buf = [0u8; MAX_PACKET_LEN];
    let mut deadline = Instant::now();
    for attempt in 0..MAX_RETRIES {
        // The full previous interval passes before the next transmission so
        // the gateway is not spammed.
        sleep_until(deadline).await;
        deadline = Instant::now() + INITIAL_TIMEOUT * (1 << attempt);

        if let Err(err) = socket.send(&raw_request).await {
            if matches!(
                err.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::TimedOut
            ) {
                continue;
            }
            return Err(err.into());
        }

        loop {
            let n = match timeout_at(deadline, socket.recv(&mut buf)).await {
                Err(_) => break, // deadline fired, next attempt
                Ok(Ok(n)) => n,
                Ok(Err(err)) => return Err(err.into()),
            };
            let raw = &buf[..n];
            // Version/opcode must at least be present.
            if n < HDR_LEN {
                continue;
            }
            // Replies to some other opcode are stale; keep reading.
            if raw[1] != request.opcode() | OP_RESPONSE_OFFSET {
                continue;
            }
            match request {
                Request::ExternalAddress => return decode_external_address_resp(raw),
                Request::Mapping { internal_port, .. } => {
                    // Stale replies can also carry the right opcode with the
                    // wrong port, so mapping decode failures only skip the
                    // datagram.
                    match decode_mapping_resp(*internal_port, raw) {
                        Ok(response) => return Ok(response),
                        Err(err) => {
                            debug!("NAT-PMP: discarding mapping response: {err}");
                            continue;
                        }
                    }
                }
            }
        }
    }
    Err(Error::Timeout)
}

// ============================================================================
// Client
// ============================================================================

/// A NAT-PMP client bound to the default gateway.
#[derive(Debug)]
pub struct Client {
    socket: UdpSocket,
    internal_ip: Ipv4Addr,
    external_ip: Option<Ipv4Addr>,
    allow_delete: bool,
}

impl Client {
    /// Resolves the default gateway and probes it by fetching the external
    /// address.
    pub async fn probe(allow_delete: bool) -> Result<Client> {
        let gateway = gateway::resolve_default_gateway()?;
        debug!("NAT-PMP: gateway is {gateway}");
        Self::connect(SocketAddrV4::new(gateway, NATPMP_PORT), allow_delete).await
    }

    pub(crate) async fn connect(gateway: SocketAddrV4, allow_delete: bool) -> Result<Client> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.connect(gateway).await?;
        let internal_ip = match socket.local_addr()? {
            SocketAddr::V4(addr) => *addr.ip(),
            SocketAddr::V6(_) => {
                return Err(Error::Protocol("local socket address is not IPv4".into()))
            }
        };
        debug!("NAT-PMP: local IP is {internal_ip}");

        let mut client = Client {
            socket,
            internal_ip,
            external_ip: None,
            allow_delete,
        };
        // Fetching the external address doubles as the "does the router
        // actually speak this?" check.
        client.external_ip_address().await?;
        Ok(client)
    }

    /// Adds a TCP mapping from `0.0.0.0:external_port` to the client's
    /// address at `internal_port`. A duration of 0 requests a 7200 second
    /// lease.
    pub async fn add_port_mapping(
        &mut self,
        _description: &str,
        internal_port: u16,
        external_port: u16,
        duration: u32,
    ) -> Result<()> {
        let lifetime_seconds = if duration == 0 {
            DEFAULT_MAPPING_DURATION
        } else {
            duration
        };
        debug!(
            "NAT-PMP: AddPortMapping: {}:{} <-> 0.0.0.0:{} ({} sec)",
            self.internal_ip, internal_port, external_port, lifetime_seconds
        );

        let request = Request::Mapping {
            internal_port,
            external_port,
            lifetime_seconds,
        };
        let response = issue_request(&self.socket, &request).await?;
        let Response::Mapping { mapped_port, .. } = response else {
            return Err(Error::Protocol(
                "invalid response received to AddPortMapping".into(),
            ));
        };
        if mapped_port == external_port {
            return Ok(());
        }

        // There was a conflict and the router picked another port. Deleting
        // the unwanted mapping would be the polite thing to do, but a large
        // install base of router firmware mishandles deletions, so the
        // mapping is left in place.
        debug!("NAT-PMP: router mapped a different external port than requested: {mapped_port}");
        Err(Error::PortConflict)
    }

    /// Removes the TCP mapping for `internal_port`.
    ///
    /// Disabled unless explicitly allowed: old versions of common router
    /// firmware do not handle the removal request correctly and will tear
    /// down unrelated mappings.
    pub async fn delete_port_mapping(
        &mut self,
        internal_port: u16,
        _external_port: u16,
    ) -> Result<()> {
        if !self.allow_delete {
            return Err(Error::Unsupported);
        }
        let request = Request::Mapping {
            internal_port,
            external_port: 0,
            lifetime_seconds: 0,
        };
        issue_request(&self.socket, &request).await?;
        Ok(())
    }

    /// Queries the router's external IP address.
    pub async fn external_ip_address(&mut self) -> Result<Ipv4Addr> {
        // Cached during startup since the query doubles as the probe.
        if let Some(ip) = self.external_ip {
            debug!("NAT-PMP: using cached external address: {ip}");
            return Ok(ip);
        }

        debug!("NAT-PMP: querying external address");
        let response = issue_request(&self.socket, &Request::ExternalAddress).await?;
        let Response::ExternalAddress { external_ip, .. } = response else {
            return Err(Error::Protocol(
                "invalid response received to GetExternalIPAddress".into(),
            ));
        };
        self.external_ip = Some(external_ip);
        Ok(external_ip)
    }

    /// NAT-PMP has no way to enumerate mappings.
    pub async fn list_port_mappings(&mut self) -> Result<Vec<String>> {
        Err(Error::Unsupported)
    }

    /// Releases the UDP socket.
    pub fn close(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn external_address_resp(result_code: u16, ip: [u8; 4]) -> Vec<u8> {
        let mut raw = vec![0u8; EXTERNAL_ADDRESS_RESP_LEN];
        raw[1] = OP_EXTERNAL_ADDRESS | OP_RESPONSE_OFFSET;
        raw[2..4].copy_from_slice(&result_code.to_be_bytes());
        raw[8..12].copy_from_slice(&ip);
        raw
    }

    fn mapping_resp(internal_port: u16, mapped_port: u16, lifetime: u32) -> Vec<u8> {
        let mut raw = vec![0u8; MAPPING_RESP_LEN];
        raw[1] = OP_MAP_TCP | OP_RESPONSE_OFFSET;
        raw[8..10].copy_from_slice(&internal_port.to_be_bytes());
        raw[10..12].copy_from_slice(&mapped_port.to_be_bytes());
        raw[12..16].copy_from_slice(&lifetime.to_be_bytes());
        raw
    }

    #[test]
    fn external_address_request_is_two_bytes() {
        assert_eq!(Request::ExternalAddress.encode(), vec![0, 0]);
    }

    #[test]
    fn mapping_request_layout() {
        let raw = Request::Mapping {
            internal_port: 9001,
            external_port: 9002,
            lifetime_seconds: 7200,
        }
        .encode();
        assert_eq!(
            raw,
            vec![0, 2, 0, 0, 0x23, 0x29, 0x23, 0x2a, 0, 0, 0x1c, 0x20]
        );
    }

    #[test]
    fn deletion_form_is_accepted() {
        let raw = Request::Mapping {
            internal_port: 0,
            external_port: 0,
            lifetime_seconds: 0,
        }
        .encode();
        assert_eq!(raw.len(), MAPPING_REQ_LEN);
        assert_eq!(&raw[4..], &[0u8; 8]);
    }

    #[test]
    fn mapping_response_round_trip() {
        let raw = mapping_resp(9001, 9001, 7200);
        let response = decode_mapping_resp(9001, &raw).unwrap();
        assert_eq!(
            response,
            Response::Mapping {
                epoch_seconds: 0,
                internal_port: 9001,
                mapped_port: 9001,
                lifetime_seconds: 7200,
            }
        );
    }

    #[test]
    fn short_buffer_fails_header_decode() {
        for len in 0..HDR_LEN {
            assert!(decode_header(&vec![0u8; len], OP_EXTERNAL_ADDRESS).is_err());
        }
    }

    #[test]
    fn mismatched_opcode_is_rejected() {
        let raw = external_address_resp(RES_SUCCESS, [192, 0, 2, 1]);
        assert!(decode_header(&raw, OP_MAP_TCP).is_err());
        assert!(decode_header(&raw, OP_EXTERNAL_ADDRESS).is_ok());
    }

    #[test]
    fn result_codes_map_to_messages() {
        let raw = external_address_resp(RES_NOT_AUTHORIZED, [0, 0, 0, 0]);
        match decode_external_address_resp(&raw) {
            Err(Error::Refused(msg)) => assert_eq!(msg, "not authorized/refused"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn mapping_response_for_other_port_is_rejected() {
        let raw = mapping_resp(9005, 9005, 7200);
        assert!(decode_mapping_resp(9001, &raw).is_err());
    }

    #[test]
    fn external_address_response_decodes_ip() {
        let raw = external_address_resp(RES_SUCCESS, [203, 0, 113, 5]);
        let response = decode_external_address_resp(&raw).unwrap();
        assert_eq!(
            response,
            Response::ExternalAddress {
                epoch_seconds: 0,
                external_ip: Ipv4Addr::new(203, 0, 113, 5),
            }
        );
    }

    /// Spawns a fake gateway that answers each request with the reply chosen
    /// by `reply_for`.
    async fn spawn_gateway(
        reply_for: fn(&[u8]) -> Vec<Vec<u8>>,
    ) -> SocketAddrV4 {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = match socket.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => unreachable!(),
        };
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            loop {
                let Ok((n, peer)) = socket.recv_from(&mut buf).await else {
                    return;
                };
                for reply in reply_for(&buf[..n]) {
                    let _ = socket.send_to(&reply, peer).await;
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn probe_caches_external_address() {
        let gateway = spawn_gateway(|req| match req[1] {
            OP_EXTERNAL_ADDRESS => vec![external_address_resp(RES_SUCCESS, [203, 0, 113, 5])],
            _ => vec![],
        })
        .await;

        let mut client = Client::connect(gateway, false).await.unwrap();
        let ip = client.external_ip_address().await.unwrap();
        assert_eq!(ip, Ipv4Addr::new(203, 0, 113, 5));
    }

    #[tokio::test]
    async fn mapping_conflict_is_reported_without_deletion() {
        let gateway = spawn_gateway(|req| match req[1] {
            OP_EXTERNAL_ADDRESS => vec![external_address_resp(RES_SUCCESS, [203, 0, 113, 5])],
            OP_MAP_TCP => {
                let internal = u16::from_be_bytes([req[4], req[5]]);
                let lifetime = u32::from_be_bytes([req[8], req[9], req[10], req[11]]);
                // Deletion requests have a zero lifetime; they must never
                // arrive in this scenario.
                assert_ne!(lifetime, 0, "unexpected deletion request");
                vec![mapping_resp(internal, 9002, lifetime)]
            }
            _ => vec![],
        })
        .await;

        let mut client = Client::connect(gateway, false).await.unwrap();
        let err = client
            .add_port_mapping("test", 9001, 9001, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PortConflict));
    }

    #[tokio::test]
    async fn stale_reply_is_skipped_by_opcode() {
        let gateway = spawn_gateway(|req| match req[1] {
            OP_EXTERNAL_ADDRESS => vec![external_address_resp(RES_SUCCESS, [203, 0, 113, 5])],
            OP_MAP_TCP => {
                let internal = u16::from_be_bytes([req[4], req[5]]);
                // A buffered external-address reply lands first; the real
                // mapping response follows.
                vec![
                    external_address_resp(RES_SUCCESS, [203, 0, 113, 5]),
                    mapping_resp(internal, internal, 7200),
                ]
            }
            _ => vec![],
        })
        .await;

        let mut client = Client::connect(gateway, false).await.unwrap();
        client.add_port_mapping("test", 9001, 9001, 0).await.unwrap();
    }

    #[tokio::test]
    async fn delete_is_unsupported_by_default() {
        let gateway = spawn_gateway(|req| match req[1] {
            OP_EXTERNAL_ADDRESS => vec![external_address_resp(RES_SUCCESS, [203, 0, 113, 5])],
            _ => vec![],
        })
        .await;

        let mut client = Client::connect(gateway, false).await.unwrap();
        let err = client.delete_port_mapping(9001, 9001).await.unwrap_err();
        assert!(matches!(err, Error::Unsupported));
    }

    #[tokio::test(start_paused = true)]
    async fn silence_exhausts_retries_with_timeout() {
        // Bound but never served: every datagram is dropped.
        let sink = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = match sink.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => unreachable!(),
        };

        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await.unwrap();
        socket.connect(addr).await.unwrap();

        let started = Instant::now();
        let err = issue_request(&socket, &Request::ExternalAddress)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));
        // 250 + 500 + 1000 ms of deadlines.
        assert!(started.elapsed() >= Duration::from_millis(1750));
    }
}
