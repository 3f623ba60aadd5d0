//! HTTP-over-(multicast-)UDP client, used only for SSDP discovery.
//!
//! One HTTP request is serialized into a datagram and multicast; any number
//! of HTTP responses may arrive before the deadline, from any host, so parse
//! failures are silently dropped.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::{lookup_host, UdpSocket};
use tokio::time::{sleep_until, timeout_at, Instant};

use crate::error::{Error, Result};

const MAX_RESPONSE_SIZE: usize = u16::MAX as usize;

/// A request to be serialized into a single datagram.
#[derive(Debug)]
pub struct Request {
    pub method: String,
    /// The request target; SSDP uses the literal `*`.
    pub target: String,
    /// The `Host:` header, also the UDP destination.
    pub host: String,
    pub headers: Vec<(String, String)>,
}

impl Request {
    fn encode(&self) -> Vec<u8> {
        let mut out = format!("{} {} HTTP/1.1\r\n", self.method, self.target);
        out.push_str(&format!("Host: {}\r\n", self.host));
        for (name, value) in &self.headers {
            out.push_str(&format!("{name}: {value}\r\n"));
        }
        out.push_str("\r\n");
        out.into_bytes()
    }
}

/// A parsed response datagram. SSDP responses carry no body.
#[derive(Debug)]
pub struct Response {
    pub status: u16,
    headers: Vec<(String, String)>,
}

impl Response {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

fn parse_response(raw: &[u8]) -> Option<Response> {
    let text = std::str::from_utf8(raw).ok()?;
    let mut lines = text.split("\r\n");

    let status_line = lines.next()?;
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    let status = parts.next()?.parse().ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line.split_once(':')?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    Some(Response { status, headers })
}

/// A HTTP(M)U client. Not safe for concurrent use; the exclusive borrow on
/// [`Client::request`] enforces that.
#[derive(Debug)]
pub struct Client {
    local_port: u16,
}

impl Client {
    /// Creates a client that binds to `0.0.0.0:local_port` for outgoing
    /// requests (0 = any).
    pub fn new(local_port: u16) -> Client {
        Client { local_port }
    }

    /// Issues the request and returns every response collected before the
    /// deadline. Each of the `max_retries` attempts waits `per_try_timeout`;
    /// an attempt that gathered at least one response ends the call.
    pub async fn request(
        &mut self,
        request: &Request,
        per_try_timeout: Duration,
        max_retries: u32,
    ) -> Result<Vec<Response>> {
        let target = lookup_host(&request.host)
            .await?
            .find(SocketAddr::is_ipv4)
            .ok_or_else(|| Error::Protocol(format!("cannot resolve {}", request.host)))?;

        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, self.local_port)).await?;
        socket.set_broadcast(true)?;
        if self.local_port == 0 {
            // Remember the ephemeral port so it is preserved across calls.
            if let SocketAddr::V4(addr) = socket.local_addr()? {
                self.local_port = addr.port();
            }
        }

        let raw_request = request.encode();
        let mut responses = Vec::new();
        let mut buf = vec![0u8; MAX_RESPONSE_SIZE];
        let mut deadline = Instant::now();
        for _ in 0..max_retries {
            // The full timeout interval passes between transmissions to
            // avoid spamming the network.
            sleep_until(deadline).await;
            deadline = Instant::now() + per_try_timeout;

            if let Err(err) = socket.send_to(&raw_request, target).await {
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::TimedOut
                ) {
                    continue;
                }
                return Err(err.into());
            }

            loop {
                let n = match timeout_at(deadline, socket.recv_from(&mut buf)).await {
                    Err(_) => break,
                    Ok(Ok((n, _peer))) => n,
                    Ok(Err(err)) => return Err(err.into()),
                };
                // Anyone can send UDP, so datagrams that are not valid HTTP
                // responses are ignored.
                if let Some(response) = parse_response(&buf[..n]) {
                    responses.push(response);
                }
            }

            // At least one response means everyone who cared has answered.
            if !responses.is_empty() {
                return Ok(responses);
            }
        }
        Err(Error::Timeout)
    }
}
