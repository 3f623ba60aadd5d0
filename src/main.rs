//! fw-helper is a tool for opening firewalls with the various NAT traversal
//! mechanisms. It is designed as a drop-in replacement for tor-fw-helper:
//! a parent process invokes it periodically to (re)install short-lived TCP
//! port mappings and parses the line-oriented status report on stdout.

use std::io::Write;
use std::process::ExitCode;
use std::str::FromStr;

use clap::Parser;
use log::debug;

use fw_helper::client::{Client, Options};

const MAPPING_DESCRIPTION: &str = "Tor relay";
const MAPPING_DURATION: u32 = 0;
const VERSION_STRING: &str = env!("CARGO_PKG_VERSION");

/// One external:internal forwarding pair.
#[derive(Debug, Clone, Copy)]
struct PortPair {
    external: u16,
    internal: u16,
}

impl FromStr for PortPair {
    type Err = String;

    fn from_str(value: &str) -> Result<PortPair, String> {
        let Some((external, internal)) = value.split_once(':') else {
            return Err(format!("failed to parse '{value}'"));
        };
        // The internal port is required; the external one defaults to it.
        let internal: u16 = internal
            .parse()
            .map_err(|err| format!("invalid internal port in '{value}': {err}"))?;
        let external: u16 = if external.is_empty() {
            internal
        } else {
            external
                .parse()
                .map_err(|err| format!("invalid external port in '{value}': {err}"))?
        };
        Ok(PortPair { external, internal })
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "fw-helper",
    about = "Opens inbound TCP ports on the local gateway via UPnP or NAT-PMP",
    disable_version_flag = true
)]
struct Args {
    /// Reserved for parent-process integration testing; not implemented.
    #[arg(short = 'T', long = "test-commandline")]
    test_commandline: bool,

    /// Log verbose progress to stderr.
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Query and report the external IP address.
    #[arg(short = 'g', long = "fetch-public-ip")]
    fetch_public_ip: bool,

    /// Forward a TCP port ([<external port>]:<internal port>).
    #[arg(short = 'p', long = "forward-port", value_name = "PORTS")]
    forward_port: Vec<PortPair>,

    /// Remove a TCP port forward ([<external port>]:<internal port>).
    #[arg(short = 'd', long = "unforward-port", value_name = "PORTS")]
    unforward_port: Vec<PortPair>,

    /// List the router's current port forwarding entries.
    #[arg(short = 'l', long = "list-ports")]
    list_ports: bool,

    /// Force a backend (UPnP or NAT-PMP) instead of probing for one.
    #[arg(long = "protocol", value_name = "PROTOCOL")]
    protocol: Option<String>,

    /// Issue real NAT-PMP deletion requests; broken on some routers.
    #[arg(long = "natpmp-allow-delete", hide = true)]
    natpmp_allow_delete: bool,
}

fn init_logging(verbose: bool) {
    let level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Off
    };
    env_logger::Builder::new()
        .format(|buf, record| writeln!(buf, "V: {}", record.args()))
        .filter_level(level)
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();
            return ExitCode::from(1);
        }
    };

    init_logging(args.verbose);

    if args.verbose {
        // Dump how we were invoked.
        debug!("fw-helper version {VERSION_STRING}");
        debug!("we were called with the following arguments:");
        debug!(
            "verbose = {}, fetch_public_ip = {}, list_ports = {}, protocol = '{}'",
            args.verbose,
            args.fetch_public_ip,
            args.list_ports,
            args.protocol.as_deref().unwrap_or("")
        );
        if !args.forward_port.is_empty() {
            debug!("TCP forwarding:");
            for pair in &args.forward_port {
                debug!("external: {}, internal: {}", pair.external, pair.internal);
            }
        }
        if !args.unforward_port.is_empty() {
            debug!("remove TCP forwarding:");
            for pair in &args.unforward_port {
                debug!("external: {}, internal: {}", pair.external, pair.internal);
            }
        }
    }

    if args.test_commandline {
        eprintln!("E: --test-commandline not implemented yet");
        return ExitCode::from(1);
    }
    if args.forward_port.is_empty()
        && args.unforward_port.is_empty()
        && !args.fetch_public_ip
        && !args.list_ports
    {
        eprintln!(
            "E: We require a port to be forwarded/unforwarded, fetch_public_ip request, \
             or list_ports!"
        );
        return ExitCode::from(1);
    }

    // Discover/initialize a compatible NAT traversal method.
    let options = Options {
        natpmp_allow_delete: args.natpmp_allow_delete,
    };
    let mut client = match Client::new(args.protocol.as_deref().unwrap_or(""), options).await {
        Ok(client) => client,
        Err(err) => {
            eprintln!("E: {err}");
            return ExitCode::from(1);
        }
    };

    // Forward ports; the result is delivered over stdout in a predefined
    // format the parent parses. Per-mapping failures do not abort the run.
    let mut stdout = std::io::stdout();
    for pair in &args.forward_port {
        match client
            .add_port_mapping(
                MAPPING_DESCRIPTION,
                pair.internal,
                pair.external,
                MAPPING_DURATION,
            )
            .await
        {
            Ok(()) => {
                debug!("AddPortMapping() succeeded");
                let _ = writeln!(
                    stdout,
                    "tor-fw-helper tcp-forward {} {} SUCCESS",
                    pair.external, pair.internal
                );
            }
            Err(err) => {
                debug!("AddPortMapping() failed: {err}");
                let _ = writeln!(
                    stdout,
                    "tor-fw-helper tcp-forward {} {} FAIL",
                    pair.external, pair.internal
                );
            }
        }
        let _ = stdout.flush();
    }

    for pair in &args.unforward_port {
        match client.delete_port_mapping(pair.internal, pair.external).await {
            Ok(()) => {
                debug!("DeletePortMapping() succeeded");
                let _ = writeln!(
                    stdout,
                    "tor-fw-helper tcp-unforward {} {} SUCCESS",
                    pair.external, pair.internal
                );
            }
            Err(err) => {
                debug!("DeletePortMapping() failed: {err}");
                let _ = writeln!(
                    stdout,
                    "tor-fw-helper tcp-unforward {} {} FAIL",
                    pair.external, pair.internal
                );
            }
        }
        let _ = stdout.flush();
    }

    if args.fetch_public_ip {
        match client.external_ip_address().await {
            Ok(ip) => eprintln!("go-fw-helper: ExternalIPAddress = {ip}"),
            Err(err) => {
                eprintln!("E: Failed to query the external IP address: {err}");
                client.close();
                return ExitCode::from(1);
            }
        }
    }

    if args.list_ports {
        match client.list_port_mappings().await {
            Ok(entries) => {
                eprintln!("go-fw-helper: Current port forwarding mappings:");
                if entries.is_empty() {
                    eprintln!("go-fw-helper:  No entries found.");
                } else {
                    for entry in &entries {
                        eprintln!("go-fw-helper:  {entry}");
                    }
                }
            }
            Err(err) => {
                eprintln!("E: Failed to query the list of mappings: {err}");
                client.close();
                return ExitCode::from(1);
            }
        }
    }

    client.close();
    ExitCode::SUCCESS
}
