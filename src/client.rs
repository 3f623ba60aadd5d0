//! The backend-polymorphic client surface and backend selection.

use std::net::Ipv4Addr;

use log::debug;

use crate::error::{Error, Result};
use crate::natpmp;
use crate::upnp;

/// Backend probe order. UPnP goes first: it is the least reliable protocol
/// but by far the most widely deployed one.
const BACKENDS: &[&str] = &[upnp::METHOD_NAME, natpmp::METHOD_NAME];

/// Knobs that alter backend behavior.
#[derive(Debug, Clone, Copy, Default)]
pub struct Options {
    /// Let NAT-PMP issue real deletion requests. Broken on a lot of deployed
    /// firmware, hence opt-in.
    pub natpmp_allow_delete: bool,
}

/// A live port forwarding client, backed by whichever mechanism probed
/// successfully.
#[derive(Debug)]
pub enum Client {
    Upnp(upnp::Client),
    NatPmp(natpmp::Client),
}

impl Client {
    /// Discovers and initializes a suitable port forwarding mechanism.
    ///
    /// An empty `protocol` tries each backend in registration order and
    /// keeps the first that probes successfully; a non-empty one selects
    /// that backend alone.
    pub async fn new(protocol: &str, options: Options) -> Result<Client> {
        if !protocol.is_empty() {
            if !BACKENDS.contains(&protocol) {
                return Err(Error::UnknownBackend(protocol.to_string()));
            }
            return Self::probe(protocol, options).await;
        }

        for name in BACKENDS {
            debug!("attempting backend: {name}");
            match Self::probe(name, options).await {
                Ok(client) => {
                    debug!("using backend: {name}");
                    return Ok(client);
                }
                Err(err) => debug!("failed to initialize: {name} - {err}"),
            }
        }
        Err(Error::NoBackend)
    }

    async fn probe(name: &str, options: Options) -> Result<Client> {
        match name {
            n if n == upnp::METHOD_NAME => Ok(Client::Upnp(upnp::Client::probe().await?)),
            n if n == natpmp::METHOD_NAME => Ok(Client::NatPmp(
                natpmp::Client::probe(options.natpmp_allow_delete).await?,
            )),
            _ => Err(Error::UnknownBackend(name.to_string())),
        }
    }

    /// The name of the mechanism backing this client.
    pub fn backend_name(&self) -> &'static str {
        match self {
            Client::Upnp(_) => upnp::METHOD_NAME,
            Client::NatPmp(_) => natpmp::METHOD_NAME,
        }
    }

    /// Adds a TCP port forwarding entry between the client's address at
    /// `internal_port` and `0.0.0.0:external_port`. A duration of 0 lets the
    /// backend pick an appropriate lease.
    pub async fn add_port_mapping(
        &mut self,
        description: &str,
        internal_port: u16,
        external_port: u16,
        duration: u32,
    ) -> Result<()> {
        match self {
            Client::Upnp(client) => {
                client
                    .add_port_mapping(description, internal_port, external_port, duration)
                    .await
            }
            Client::NatPmp(client) => {
                client
                    .add_port_mapping(description, internal_port, external_port, duration)
                    .await
            }
        }
    }

    /// Removes an existing TCP port forwarding entry.
    pub async fn delete_port_mapping(
        &mut self,
        internal_port: u16,
        external_port: u16,
    ) -> Result<()> {
        match self {
            Client::Upnp(client) => client.delete_port_mapping(internal_port, external_port).await,
            Client::NatPmp(client) => {
                client.delete_port_mapping(internal_port, external_port).await
            }
        }
    }

    /// Queries the router for its external public IP address.
    pub async fn external_ip_address(&mut self) -> Result<Ipv4Addr> {
        match self {
            Client::Upnp(client) => client.external_ip_address().await,
            Client::NatPmp(client) => client.external_ip_address().await,
        }
    }

    /// Queries the router for the list of port forwarding entries, rendered
    /// as human-readable strings.
    pub async fn list_port_mappings(&mut self) -> Result<Vec<String>> {
        match self {
            Client::Upnp(client) => client.list_port_mappings().await,
            Client::NatPmp(client) => client.list_port_mappings().await,
        }
    }

    /// Releases any state held by the backend.
    pub fn close(self) {
        match self {
            Client::Upnp(client) => client.close(),
            Client::NatPmp(client) => client.close(),
        }
    }
}
