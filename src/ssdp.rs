//! SSDP discovery and UPnP device-description handling.
//!
//! Discovery is a three step process: find candidate root devices with an
//! M-SEARCH over multicast UDP, pull down each device description document,
//! and walk the device tree for a WAN connection service. The service
//! description step of the UPnP dance is skipped; the handful of actions
//! used here are so basic that only the shadiest of implementations get
//! them wrong (and those get the rest wrong too).

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use log::debug;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use url::Url;
use xmltree::{Element, XMLNode};

use crate::error::{Error, Result};
use crate::httpu;

const MSEARCH_METHOD: &str = "M-SEARCH";
const MSEARCH_TARGET: &str = "*";
const MSEARCH_HOST: &str = "239.255.255.250:1900";
const MSEARCH_MAN: &str = "\"ssdp:discover\"";
const MSEARCH_MX: &str = "2";
const MSEARCH_ST_ROOT: &str = "upnp:rootdevice";

// Standardized, but optional.
pub(crate) const USER_AGENT: &str = "";

const INTERNET_GATEWAY_DEVICE: &str = "InternetGatewayDevice";
const WAN_DEVICE: &str = "WANDevice";
const WAN_CONNECTION_DEVICE: &str = "WANConnectionDevice";
const WAN_IP_CONNECTION: &str = "WANIPConnection";
const WAN_PPP_CONNECTION: &str = "WANPPPConnection";

const MAX_RETRIES: u32 = 3;
/// Must stay consistent with the advertised MX value.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);
const OUTGOING_PORT: u16 = 0;

/// Caps how much of a description or SOAP body gets read.
const MAX_HTTP_RESPONSE_SIZE: u64 = 64 * 1024;

// ============================================================================
// URNs
// ============================================================================

/// A UPnP URN of the form `urn:<domain>:<kind>:<kind-type>:<version>`.
///
/// Comparisons ignore the domain and version; vendors stuff all sorts of
/// nonsense into those while the kind-type stays recognizable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Urn {
    pub domain: String,
    pub kind: String,
    pub kind_type: String,
    pub version: u32,
}

impl FromStr for Urn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Urn> {
        let split: Vec<&str> = s.split(':').collect();
        if split.len() != 5 {
            return Err(Error::Protocol(format!(
                "urn: malformed, {} elements",
                split.len()
            )));
        }
        if split[0] != "urn" {
            return Err(Error::Protocol("urn: invalid prefix".into()));
        }
        let version = split[4]
            .parse()
            .map_err(|err| Error::Protocol(format!("urn: malformed version: {err}")))?;
        Ok(Urn {
            domain: split[1].to_string(),
            kind: split[2].to_string(),
            kind_type: split[3].to_string(),
            version,
        })
    }
}

impl fmt::Display for Urn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "urn:{}:{}:{}:{}",
            self.domain, self.kind, self.kind_type, self.version
        )
    }
}

// ============================================================================
// Device description documents
// ============================================================================

/// The decoded `<root>` of a device description document.
#[derive(Debug)]
pub struct DeviceDescription {
    pub spec_version: (u32, u32),
    pub url_base: Option<String>,
    pub device: Device,
}

#[derive(Debug, Default)]
pub struct Device {
    pub device_type: String,
    pub friendly_name: String,
    pub manufacturer: String,
    pub model_name: String,
    pub udn: String,
    pub devices: Vec<Device>,
    pub services: Vec<Service>,
}

#[derive(Debug, Default)]
pub struct Service {
    pub service_type: String,
    pub service_id: String,
    pub scpd_url: String,
    pub control_url: String,
    pub event_sub_url: String,
}

impl Device {
    fn is_kind(&self, kind_type: &str) -> bool {
        match self.device_type.parse::<Urn>() {
            Ok(urn) => urn.kind == "device" && urn.kind_type == kind_type,
            Err(_) => false,
        }
    }

    fn find_child(&self, kind_type: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.is_kind(kind_type))
    }

    fn find_service(&self, kind_type: &str) -> Option<&Service> {
        self.services.iter().find(|s| s.is_kind(kind_type))
    }
}

impl Service {
    fn is_kind(&self, kind_type: &str) -> bool {
        match self.service_type.parse::<Urn>() {
            Ok(urn) => urn.kind == "service" && urn.kind_type == kind_type,
            Err(_) => false,
        }
    }
}

fn child_text(element: &Element, name: &str) -> String {
    element
        .get_child(name)
        .and_then(|child| child.get_text())
        .map(|text| text.trim().to_string())
        .unwrap_or_default()
}

pub fn parse_device_description(xml: &str) -> Result<DeviceDescription> {
    let root = Element::parse(xml.as_bytes())
        .map_err(|err| Error::Protocol(format!("device description: {err}")))?;
    let spec_version = root
        .get_child("specVersion")
        .map(|v| {
            (
                child_text(v, "major").parse().unwrap_or(0),
                child_text(v, "minor").parse().unwrap_or(0),
            )
        })
        .unwrap_or((0, 0));
    let url_base = root
        .get_child("URLBase")
        .and_then(|child| child.get_text())
        .map(|text| text.trim().to_string())
        .filter(|base| !base.is_empty());
    let device = root
        .get_child("device")
        .map(parse_device)
        .ok_or_else(|| Error::Protocol("device description: missing root device".into()))?;
    Ok(DeviceDescription {
        spec_version,
        url_base,
        device,
    })
}

fn parse_device(element: &Element) -> Device {
    let mut device = Device {
        device_type: child_text(element, "deviceType"),
        friendly_name: child_text(element, "friendlyName"),
        manufacturer: child_text(element, "manufacturer"),
        model_name: child_text(element, "modelName"),
        udn: child_text(element, "UDN"),
        ..Device::default()
    };
    if let Some(list) = element.get_child("deviceList") {
        for node in &list.children {
            if let XMLNode::Element(child) = node {
                if child.name == "device" {
                    device.devices.push(parse_device(child));
                }
            }
        }
    }
    if let Some(list) = element.get_child("serviceList") {
        for node in &list.children {
            if let XMLNode::Element(child) = node {
                if child.name == "service" {
                    device.services.push(Service {
                        service_type: child_text(child, "serviceType"),
                        service_id: child_text(child, "serviceId"),
                        scpd_url: child_text(child, "SCPDURL"),
                        control_url: child_text(child, "controlURL"),
                        event_sub_url: child_text(child, "eventSubURL"),
                    });
                }
            }
        }
    }
    device
}

// ============================================================================
// Discovery
// ============================================================================

/// The resolved target of SOAP control requests.
#[derive(Debug, Clone)]
pub struct ControlPoint {
    pub url: Url,
    pub urn: Urn,
}

/// Locates a WAN connection service and returns its control point together
/// with the local IPv4 address that reached the device.
pub async fn discover() -> Result<(ControlPoint, Ipv4Addr)> {
    discover_at(MSEARCH_HOST).await
}

pub(crate) async fn discover_at(host: &str) -> Result<(ControlPoint, Ipv4Addr)> {
    debug!("UPnP: probing for root devices via M-SEARCH");
    let locations = discover_root_devices(host).await?;
    debug!("UPnP: received {} potential root devices", locations.len());

    for location in &locations {
        debug!("UPnP: downloading device description from {location}");
        let (xml, local_ip) = match fetch_device_description(location).await {
            Ok(fetched) => fetched,
            Err(err) => {
                debug!("UPnP: download failed: {err}");
                continue;
            }
        };
        let description = match parse_device_description(&xml) {
            Ok(description) => description,
            Err(err) => {
                debug!("UPnP: {err}");
                continue;
            }
        };
        match select_control_point(&description, location) {
            Ok(control) => {
                debug!("UPnP: found a {} at {}", control.urn.kind_type, control.url);
                debug!("UPnP: local IP is {local_ip}");
                return Ok((control, local_ip));
            }
            Err(err) => {
                debug!("UPnP: {err}");
            }
        }
    }
    Err(Error::Protocol("failed to find a compatible service".into()))
}

async fn discover_root_devices(host: &str) -> Result<Vec<Url>> {
    let request = httpu::Request {
        method: MSEARCH_METHOD.to_string(),
        target: MSEARCH_TARGET.to_string(),
        host: host.to_string(),
        headers: vec![
            ("MAN".to_string(), MSEARCH_MAN.to_string()),
            ("MX".to_string(), MSEARCH_MX.to_string()),
            ("ST".to_string(), MSEARCH_ST_ROOT.to_string()),
            ("User-Agent".to_string(), USER_AGENT.to_string()),
        ],
    };

    let mut client = httpu::Client::new(OUTGOING_PORT);
    let responses = client.request(&request, REQUEST_TIMEOUT, MAX_RETRIES).await?;

    let mut locations = Vec::with_capacity(responses.len());
    for response in &responses {
        if response.status != 200 {
            continue;
        }
        if response.header("ST") != Some(MSEARCH_ST_ROOT) {
            continue;
        }
        let Some(location) = response.header("Location") else {
            continue;
        };
        let Ok(url) = Url::parse(location) else {
            continue;
        };
        locations.push(url);
    }
    if locations.is_empty() {
        return Err(Error::Protocol(
            "ssdp: failed to discover any root devices".into(),
        ));
    }
    Ok(locations)
}

/// Fetches the description document over a plain TCP connection, capturing
/// the locally bound IPv4 address. That address is the interface that can
/// actually talk to the gateway, which sidesteps guessing between
/// interfaces; it is used verbatim as `NewInternalClient` later.
async fn fetch_device_description(location: &Url) -> Result<(String, Ipv4Addr)> {
    let host = location
        .host_str()
        .ok_or_else(|| Error::Protocol("description URL has no host".into()))?;
    let port = location.port_or_known_default().unwrap_or(80);

    let mut stream = TcpStream::connect((host, port)).await?;
    let local_ip = match stream.local_addr()? {
        SocketAddr::V4(addr) => *addr.ip(),
        SocketAddr::V6(_) => {
            return Err(Error::Protocol("local socket address is not IPv4".into()))
        }
    };

    let mut path = location.path().to_string();
    if let Some(query) = location.query() {
        path.push('?');
        path.push_str(query);
    }
    let request = format!(
        "GET {path} HTTP/1.1\r\nHost: {host}:{port}\r\nUser-Agent: {USER_AGENT}\r\nConnection: close\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await?;

    let (status, body) = read_http_response(stream).await?;
    if status != 200 {
        return Err(Error::Protocol(format!(
            "description fetch failed with status: {status}"
        )));
    }
    let xml = String::from_utf8(body)
        .map_err(|err| Error::Protocol(format!("device description: {err}")))?;
    Ok((xml, local_ip))
}

/// Reads status line, headers and body of a `Connection: close` response.
pub(crate) async fn read_http_response(stream: TcpStream) -> Result<(u16, Vec<u8>)> {
    let mut reader = BufReader::new(stream);

    let mut status_line = String::new();
    reader.read_line(&mut status_line).await?;
    let status = parse_status_line(&status_line)?;

    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 || line == "\r\n" {
            break;
        }
    }

    let mut body = Vec::new();
    reader
        .take(MAX_HTTP_RESPONSE_SIZE)
        .read_to_end(&mut body)
        .await?;
    Ok((status, body))
}

pub(crate) fn parse_status_line(status_line: &str) -> Result<u16> {
    let mut parts = status_line.split_whitespace();
    let version = parts
        .next()
        .ok_or_else(|| Error::Protocol(format!("invalid status line: {}", status_line.trim())))?;
    if !version.starts_with("HTTP/") {
        return Err(Error::Protocol(format!(
            "invalid status line: {}",
            status_line.trim()
        )));
    }
    parts
        .next()
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| Error::Protocol(format!("invalid status line: {}", status_line.trim())))
}

// ============================================================================
// Service selection
// ============================================================================

/// Walks the device tree for the required
/// InternetGatewayDevice/WANDevice/WANConnectionDevice path and picks the
/// WANIPConnection service, falling back to WANPPPConnection. Lots of
/// routers export both; really old DSL modems only export the latter.
fn select_control_point(description: &DeviceDescription, location: &Url) -> Result<ControlPoint> {
    let root = &description.device;
    debug!("UPnP: device: {} - {}", root.manufacturer, root.model_name);
    if !root.is_kind(INTERNET_GATEWAY_DEVICE) {
        return Err(Error::Protocol(format!(
            "root device is not a {INTERNET_GATEWAY_DEVICE}"
        )));
    }
    let wan = root
        .find_child(WAN_DEVICE)
        .ok_or_else(|| Error::Protocol(format!("device does not have a {WAN_DEVICE}")))?;
    let wan_connection = wan.find_child(WAN_CONNECTION_DEVICE).ok_or_else(|| {
        Error::Protocol(format!("device does not have a {WAN_CONNECTION_DEVICE}"))
    })?;

    // UPnP 1.0 resolves relative control URLs against an optional URLBase,
    // defaulting to where the description came from. 1.1 and later do the
    // sensible thing and use absolute URLs everywhere.
    let url_base = if description.spec_version == (1, 0) {
        Some(match &description.url_base {
            Some(base) => Url::parse(base)
                .map_err(|err| Error::Protocol(format!("malformed URLBase: {err}")))?,
            None => {
                let mut base = location.clone();
                base.set_path("/");
                base.set_query(None);
                base.set_fragment(None);
                base
            }
        })
    } else {
        None
    };

    for kind in [WAN_IP_CONNECTION, WAN_PPP_CONNECTION] {
        let Some(service) = wan_connection.find_service(kind) else {
            continue;
        };
        let url = match &url_base {
            Some(base) => {
                let mut url = base.clone();
                url.set_path(&join_paths(base.path(), &service.control_url));
                url
            }
            None => Url::parse(&service.control_url)
                .map_err(|err| Error::Protocol(format!("malformed controlURL: {err}")))?,
        };
        let urn = service.service_type.parse::<Urn>()?;
        return Ok(ControlPoint { url, urn });
    }
    Err(Error::Protocol(
        "device has no compatible upstream services".into(),
    ))
}

/// Joins URL paths the way filesystem paths join; queries and fragments are
/// not preserved.
fn join_paths(base: &str, relative: &str) -> String {
    let base = base.trim_end_matches('/');
    let relative = relative.trim_start_matches('/');
    if relative.is_empty() {
        if base.is_empty() {
            "/".to_string()
        } else {
            base.to_string()
        }
    } else {
        format!("{base}/{relative}")
    }
}

/// A minimal but complete IGD description, shared by the UPnP tests.
#[cfg(test)]
pub(crate) const IGD_DESCRIPTION: &str = r#"<?xml version="1.0"?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
  <specVersion><major>1</major><minor>0</minor></specVersion>
  <device>
    <deviceType>urn:schemas-upnp-org:device:InternetGatewayDevice:1</deviceType>
    <friendlyName>Test Router</friendlyName>
    <manufacturer>ACME</manufacturer>
    <modelName>RT-1</modelName>
    <UDN>uuid:0000</UDN>
    <deviceList>
      <device>
        <deviceType>urn:schemas-upnp-org:device:WANDevice:1</deviceType>
        <friendlyName>WANDevice</friendlyName>
        <deviceList>
          <device>
            <deviceType>urn:schemas-upnp-org:device:WANConnectionDevice:1</deviceType>
            <friendlyName>WANConnectionDevice</friendlyName>
            <serviceList>
              <service>
                <serviceType>urn:schemas-upnp-org:service:WANIPConnection:1</serviceType>
                <serviceId>urn:upnp-org:serviceId:WANIPConn1</serviceId>
                <SCPDURL>/ipconnSCPD.xml</SCPDURL>
                <controlURL>/ctl</controlURL>
                <eventSubURL>/evt</eventSubURL>
              </service>
            </serviceList>
          </device>
        </deviceList>
      </device>
    </deviceList>
  </device>
</root>"#;
