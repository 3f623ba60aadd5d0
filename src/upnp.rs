//! UPnP IGD client.
//!
//! Control requests are SOAP over HTTP. The people who made this abomination
//! of a protocol get it wrong in every deployed implementation, so the
//! envelope is concatenated by hand rather than produced by a serializer:
//! routers reject well-formed XML that is not byte-for-byte what they expect.

use std::net::Ipv4Addr;

use log::debug;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use xmltree::Element;

use crate::error::{Error, Result};
use crate::ssdp::{self, ControlPoint, USER_AGENT};

pub const METHOD_NAME: &str = "UPnP";

/// The UPnP lease ceiling: one week, in seconds.
const MAX_MAPPING_DURATION: u32 = 604_800;

/// A UPnP client bound to a discovered WAN connection service.
#[derive(Debug)]
pub struct Client {
    control: ControlPoint,
    internal_ip: Ipv4Addr,
}

impl Client {
    /// Discovers a gateway and returns a ready to use client.
    pub async fn probe() -> Result<Client> {
        let (control, internal_ip) = ssdp::discover().await?;
        Ok(Client {
            control,
            internal_ip,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_control_point(control: ControlPoint, internal_ip: Ipv4Addr) -> Client {
        Client {
            control,
            internal_ip,
        }
    }

    #[cfg(test)]
    pub(crate) async fn probe_at(host: &str) -> Result<Client> {
        let (control, internal_ip) = ssdp::discover_at(host).await?;
        Ok(Client {
            control,
            internal_ip,
        })
    }

    /// POSTs one SOAP action to the control URL and returns the response
    /// `Body` element.
    async fn issue_soap_request(&self, action: &str, args_xml: &str) -> Result<Element> {
        let urn = self.control.urn.to_string();
        let envelope = format!(
            "<?xml version=\"1.0\"?>\n\
             <s:Envelope xmlns:s=\"http://schemas.xmlsoap.org/soap/envelope/\" \
             s:encodingStyle=\"http://schemas.xmlsoap.org/soap/encoding/\">\
             <s:Body><u:{action} xmlns:u=\"{urn}\">{args_xml}</u:{action}></s:Body></s:Envelope>"
        );
        let soap_action = format!("\"{urn}#{action}\"");

        debug!("UPnP: soap: issuing {action}");

        let host = self
            .control
            .url
            .host_str()
            .ok_or_else(|| Error::Protocol("control URL has no host".into()))?;
        let port = self.control.url.port_or_known_default().unwrap_or(80);
        let mut path = self.control.url.path().to_string();
        if path.is_empty() {
            path.push('/');
        }

        // miniupnpd (used by a lot of routers) passes chunked bodies straight
        // to its XML parser, so the body must be identity-encoded with an
        // explicit Content-Length. Connections are never reused either;
        // plenty of devices mishandle keep-alive.
        let request = format!(
            "POST {path} HTTP/1.1\r\n\
             Host: {host}:{port}\r\n\
             Content-Type: text/xml; charset=\"utf-8\"\r\n\
             User-Agent: {USER_AGENT}\r\n\
             SOAPAction: {soap_action}\r\n\
             Content-Length: {length}\r\n\
             Connection: close\r\n\
             \r\n\
             {envelope}",
            length = envelope.len(),
        );

        let mut stream = TcpStream::connect((host, port)).await?;
        stream.write_all(request.as_bytes()).await?;
        let (status, raw) = ssdp::read_http_response(stream).await?;

        let parsed = Element::parse(raw.as_slice())
            .map_err(|err| Error::Protocol(format!("soap: {err}")))?;
        let body = parsed
            .get_child("Body")
            .ok_or_else(|| Error::Protocol("soap: response has no body".into()))?;
        if let Some(fault) = body.get_child("Fault") {
            return Err(soap_fault_error(fault));
        }
        if status != 200 {
            // Checked after the Fault branch because a SOAP Fault gives more
            // useful diagnostics than "500 Internal Server Error".
            return Err(Error::Protocol(format!(
                "soap: request failed with status: {status}"
            )));
        }
        Ok(body.clone())
    }

    /// Adds a TCP mapping from `0.0.0.0:external_port` to the captured
    /// internal address at `internal_port`. Durations range from 0 to one
    /// week; 0 leaves the lease choice to the router.
    pub async fn add_port_mapping(
        &mut self,
        description: &str,
        internal_port: u16,
        external_port: u16,
        duration: u32,
    ) -> Result<()> {
        if duration > MAX_MAPPING_DURATION {
            return Err(Error::Range);
        }

        debug!(
            "UPnP: AddPortMapping: '{}' {}:{} <-> 0.0.0.0:{} ({} sec)",
            description, self.internal_ip, internal_port, external_port, duration
        );

        let args = format!(
            "<NewRemoteHost></NewRemoteHost>\
             <NewExternalPort>{external_port}</NewExternalPort>\
             <NewProtocol>TCP</NewProtocol>\
             <NewInternalPort>{internal_port}</NewInternalPort>\
             <NewInternalClient>{}</NewInternalClient>\
             <NewEnabled>1</NewEnabled>\
             <NewPortMappingDescription>{}</NewPortMappingDescription>\
             <NewLeaseDuration>{duration}</NewLeaseDuration>",
            self.internal_ip,
            xml_escape(description),
        );

        // HTTP 200 means it worked; the response carries nothing worth
        // parsing.
        self.issue_soap_request("AddPortMapping", &args).await?;
        Ok(())
    }

    /// Removes the TCP mapping on `external_port`.
    pub async fn delete_port_mapping(
        &mut self,
        internal_port: u16,
        external_port: u16,
    ) -> Result<()> {
        debug!(
            "UPnP: DeletePortMapping: {}:{} <-> 0.0.0.0:{}",
            self.internal_ip, internal_port, external_port
        );

        let args = format!(
            "<NewRemoteHost></NewRemoteHost>\
             <NewExternalPort>{external_port}</NewExternalPort>\
             <NewProtocol>TCP</NewProtocol>"
        );
        self.issue_soap_request("DeletePortMapping", &args).await?;
        Ok(())
    }

    /// Queries the router's external IP address.
    pub async fn external_ip_address(&mut self) -> Result<Ipv4Addr> {
        let body = self.issue_soap_request("GetExternalIPAddress", "").await?;
        body.get_child("GetExternalIPAddressResponse")
            .and_then(|response| response.get_child("NewExternalIPAddress"))
            .and_then(|child| child.get_text())
            .and_then(|text| text.trim().parse().ok())
            .ok_or_else(|| Error::Protocol("igd: GetExternalIPAddress() failed".into()))
    }

    /// Queries the router for the list of port forwarding entries.
    ///
    /// GetListOfPortMappings proper needs IGD2, so this walks
    /// GetGenericPortMappingEntry indices until the router faults (usually
    /// SpecifiedArrayIndexInvalid). If the table changes mid-walk the result
    /// is whatever the router handed out; there is no way to notice without
    /// event subscriptions.
    pub async fn list_port_mappings(&mut self) -> Result<Vec<String>> {
        let mut entries = Vec::new();
        for index in 0..u32::from(u16::MAX) {
            let args = format!("<NewPortMappingIndex>{index}</NewPortMappingIndex>");
            let body = match self
                .issue_soap_request("GetGenericPortMappingEntry", &args)
                .await
            {
                Ok(body) => body,
                Err(err) => {
                    debug!("UPnP: GetGenericPortMappingEntry returned: {err}");
                    break;
                }
            };
            let Some(response) = body.get_child("GetGenericPortMappingEntryResponse") else {
                continue;
            };
            let entry = format_mapping_entry(response);
            debug!("UPnP: {entry}");
            entries.push(entry);
        }
        Ok(entries)
    }

    /// No persistent sockets are held; every SOAP call opens a fresh
    /// connection.
    pub fn close(self) {}
}

fn soap_fault_error(fault: &Element) -> Error {
    if let Some(upnp_error) = fault
        .get_child("detail")
        .and_then(|detail| detail.get_child("UPnPError"))
    {
        let text = |name: &str| {
            upnp_error
                .get_child(name)
                .and_then(|child| child.get_text())
                .map(|t| t.trim().to_string())
                .unwrap_or_default()
        };
        return Error::Soap(format!(
            "upnp error: {} - {}",
            text("errorCode"),
            text("errorDescription")
        ));
    }
    let text = |name: &str| {
        fault
            .get_child(name)
            .and_then(|child| child.get_text())
            .map(|t| t.trim().to_string())
            .unwrap_or_default()
    };
    Error::Soap(format!(
        "fault: {} - {}",
        text("faultcode"),
        text("faultstring")
    ))
}

fn format_mapping_entry(response: &Element) -> String {
    let text = |name: &str| {
        response
            .get_child(name)
            .and_then(|child| child.get_text())
            .map(|t| t.trim().to_string())
            .unwrap_or_default()
    };
    let mut remote_host = text("NewRemoteHost");
    if remote_host.is_empty() {
        remote_host = "0.0.0.0".to_string();
    }
    format!(
        "'{}' {}:{} <-> {}:{} {} ({} sec)",
        text("NewPortMappingDescription"),
        text("NewInternalClient"),
        text("NewInternalPort"),
        remote_host,
        text("NewExternalPort"),
        text("NewProtocol"),
        text("NewLeaseDuration")
    )
}

fn xml_escape(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '&' => escaped.push_str("&amp;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
    use tokio::net::{TcpListener, UdpSocket};
    use url::Url;

    use super::*;
    use crate::ssdp::Urn;

    const SOAP_OK_EXTERNAL_IP: &str = r#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/">
<s:Body>
<u:GetExternalIPAddressResponse xmlns:u="urn:schemas-upnp-org:service:WANIPConnection:1">
<NewExternalIPAddress>203.0.113.5</NewExternalIPAddress>
</u:GetExternalIPAddressResponse>
</s:Body>
</s:Envelope>"#;

    const SOAP_OK_EMPTY: &str = r#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/">
<s:Body>
<u:AddPortMappingResponse xmlns:u="urn:schemas-upnp-org:service:WANIPConnection:1"></u:AddPortMappingResponse>
</s:Body>
</s:Envelope>"#;

    const SOAP_FAULT_INDEX: &str = r#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/">
<s:Body>
<s:Fault>
<faultcode>s:Client</faultcode>
<faultstring>UPnPError</faultstring>
<detail>
<UPnPError xmlns="urn:schemas-upnp-org:control-1-0">
<errorCode>713</errorCode>
<errorDescription>SpecifiedArrayIndexInvalid</errorDescription>
</UPnPError>
</detail>
</s:Fault>
</s:Body>
</s:Envelope>"#;

    fn mapping_entry_response(index: usize) -> String {
        format!(
            r#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/">
<s:Body>
<u:GetGenericPortMappingEntryResponse xmlns:u="urn:schemas-upnp-org:service:WANIPConnection:1">
<NewRemoteHost></NewRemoteHost>
<NewExternalPort>{}</NewExternalPort>
<NewProtocol>TCP</NewProtocol>
<NewInternalPort>{}</NewInternalPort>
<NewInternalClient>192.168.1.2</NewInternalClient>
<NewEnabled>1</NewEnabled>
<NewPortMappingDescription>entry {}</NewPortMappingDescription>
<NewLeaseDuration>0</NewLeaseDuration>
</u:GetGenericPortMappingEntryResponse>
</s:Body>
</s:Envelope>"#,
            9000 + index,
            9000 + index,
            index
        )
    }

    /// Serves canned HTTP responses; `respond` maps (request count, request
    /// text) to (status line, body).
    async fn spawn_http_server(
        respond: impl Fn(usize, &str) -> (String, String) + Send + Sync + 'static,
    ) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let count = counter.fetch_add(1, Ordering::SeqCst);
                let mut reader = BufReader::new(stream);
                let mut request = String::new();
                let mut content_length = 0usize;
                loop {
                    let mut line = String::new();
                    if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                        break;
                    }
                    if let Some(value) = line
                        .to_ascii_lowercase()
                        .strip_prefix("content-length:")
                        .map(str::trim)
                    {
                        content_length = value.parse().unwrap_or(0);
                    }
                    let done = line == "\r\n";
                    request.push_str(&line);
                    if done {
                        break;
                    }
                }
                if content_length > 0 {
                    let mut body = vec![0u8; content_length];
                    let _ = reader.read_exact(&mut body).await;
                    request.push_str(&String::from_utf8_lossy(&body));
                }
                let (status_line, body) = respond(count, &request);
                let response = format!(
                    "{status_line}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let mut stream = reader.into_inner();
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });
        addr
    }

    fn test_client(addr: SocketAddr) -> Client {
        let control = ControlPoint {
            url: Url::parse(&format!("http://{addr}/ctl")).unwrap(),
            urn: Urn {
                domain: "schemas-upnp-org".into(),
                kind: "service".into(),
                kind_type: "WANIPConnection".into(),
                version: 1,
            },
        };
        Client::with_control_point(control, Ipv4Addr::new(192, 168, 1, 2))
    }

    #[tokio::test]
    async fn lease_ceiling_is_enforced() {
        // 604801 is rejected before any I/O happens; nothing listens on the
        // control URL.
        let mut client = test_client("127.0.0.1:1".parse().unwrap());
        let err = client
            .add_port_mapping("x", 9001, 9001, MAX_MAPPING_DURATION + 1)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Range));
    }

    #[tokio::test]
    async fn add_port_mapping_succeeds_on_200_without_fault() {
        let addr = spawn_http_server(|_, request| {
            assert!(request.contains("SOAPAction: \"urn:schemas-upnp-org:service:WANIPConnection:1#AddPortMapping\""));
            assert!(request.contains("<NewProtocol>TCP</NewProtocol>"));
            assert!(request.contains("<NewInternalClient>192.168.1.2</NewInternalClient>"));
            assert!(request.contains("<NewLeaseDuration>0</NewLeaseDuration>"));
            assert!(!request.contains("Transfer-Encoding"));
            ("HTTP/1.1 200 OK".to_string(), SOAP_OK_EMPTY.to_string())
        })
        .await;

        let mut client = test_client(addr);
        client.add_port_mapping("desc", 9001, 9001, 0).await.unwrap();
    }

    #[tokio::test]
    async fn lease_ceiling_itself_is_accepted() {
        let addr = spawn_http_server(|_, request| {
            assert!(request.contains("<NewLeaseDuration>604800</NewLeaseDuration>"));
            ("HTTP/1.1 200 OK".to_string(), SOAP_OK_EMPTY.to_string())
        })
        .await;

        let mut client = test_client(addr);
        client
            .add_port_mapping("desc", 9001, 9001, MAX_MAPPING_DURATION)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn external_ip_is_parsed_from_response() {
        let addr = spawn_http_server(|_, _| {
            ("HTTP/1.1 200 OK".to_string(), SOAP_OK_EXTERNAL_IP.to_string())
        })
        .await;

        let mut client = test_client(addr);
        let ip = client.external_ip_address().await.unwrap();
        assert_eq!(ip, Ipv4Addr::new(203, 0, 113, 5));
    }

    #[tokio::test]
    async fn fault_wins_over_http_status() {
        let addr = spawn_http_server(|_, _| {
            (
                "HTTP/1.1 500 Internal Server Error".to_string(),
                SOAP_FAULT_INDEX.to_string(),
            )
        })
        .await;

        let mut client = test_client(addr);
        let err = client.external_ip_address().await.unwrap_err();
        match err {
            Error::Soap(message) => {
                assert!(message.contains("713"));
                assert!(message.contains("SpecifiedArrayIndexInvalid"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn list_walk_stops_at_the_first_fault() {
        let addr = spawn_http_server(|count, _| {
            if count < 3 {
                ("HTTP/1.1 200 OK".to_string(), mapping_entry_response(count))
            } else {
                (
                    "HTTP/1.1 500 Internal Server Error".to_string(),
                    SOAP_FAULT_INDEX.to_string(),
                )
            }
        })
        .await;

        let mut client = test_client(addr);
        let entries = client.list_port_mappings().await.unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(
            entries[0],
            "'entry 0' 192.168.1.2:9000 <-> 0.0.0.0:9000 TCP (0 sec)"
        );
    }

    #[tokio::test]
    async fn discovery_resolves_control_point_and_fetches_ip() {
        // A mock SSDP responder pointing at a mock HTTP server that serves
        // the device description and then answers the SOAP call.
        let http_addr = spawn_http_server(|_, request| {
            if request.starts_with("GET /desc.xml") {
                (
                    "HTTP/1.1 200 OK".to_string(),
                    crate::ssdp::IGD_DESCRIPTION.to_string(),
                )
            } else {
                assert!(request.starts_with("POST /ctl"));
                ("HTTP/1.1 200 OK".to_string(), SOAP_OK_EXTERNAL_IP.to_string())
            }
        })
        .await;

        let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let responder_addr = responder.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            let (_, peer) = responder.recv_from(&mut buf).await.unwrap();
            let reply = format!(
                "HTTP/1.1 200 OK\r\nST: upnp:rootdevice\r\nLocation: http://{http_addr}/desc.xml\r\n\r\n"
            );
            let _ = responder.send_to(reply.as_bytes(), peer).await;
        });

        let mut client = Client::probe_at(&responder_addr.to_string()).await.unwrap();
        let ip = client.external_ip_address().await.unwrap();
        assert_eq!(ip, Ipv4Addr::new(203, 0, 113, 5));
    }
}
