//! Default-gateway resolution.
//!
//! NAT-PMP speaks to whatever the kernel considers the next hop for
//! `0.0.0.0`, so each platform gets its own routing-table query: a netlink
//! route dump on Linux, a `NET_RT_DUMP` sysctl on the BSDs and macOS, and
//! `GetBestRoute` on Windows. The parsers are pure over the dumped bytes;
//! only the socket and sysctl calls touch the OS.

use std::net::Ipv4Addr;

use crate::error::Result;
#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    windows
)))]
use crate::error::Error;

/// Returns the IPv4 address of the default gateway.
pub fn resolve_default_gateway() -> Result<Ipv4Addr> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        linux::default_gateway()
    }

    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd"
    ))]
    {
        bsd::default_gateway()
    }

    #[cfg(windows)]
    {
        windows::default_gateway()
    }

    #[cfg(not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        windows
    )))]
    {
        Err(Error::Protocol(format!(
            "default gateway resolution is not implemented on {}",
            std::env::consts::OS
        )))
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
mod linux {
    use std::io;
    use std::net::Ipv4Addr;

    use crate::error::{Error, Result};

    const NLMSG_HDR_LEN: usize = 16;
    const RTMSG_LEN: usize = 12;

    /// One row of the kernel routing table. Only the attributes that matter
    /// for default-route selection are retained.
    #[derive(Debug, Default)]
    struct RouteEntry {
        dst: Option<(Ipv4Addr, u8)>,
        src: Option<(Ipv4Addr, u8)>,
        gateway: Option<Ipv4Addr>,
    }

    pub fn default_gateway() -> Result<Ipv4Addr> {
        // The default route is the RTM_NEWROUTE entry without a destination
        // (ie: 0.0.0.0) and with a gateway set. First such row wins.
        let routes = dump_route_table()?;
        routes
            .into_iter()
            .find(|route| route.dst.is_none() && route.gateway.is_some())
            .and_then(|route| route.gateway)
            .ok_or_else(|| Error::Protocol("failed to find default gateway".into()))
    }

    fn dump_route_table() -> Result<Vec<RouteEntry>> {
        // SAFETY: plain socket syscalls; the fd is closed on every path.
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                libc::NETLINK_ROUTE,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let result = request_and_collect(fd);
        // SAFETY: fd is a valid socket owned by this function.
        unsafe { libc::close(fd) };
        result
    }

    fn request_and_collect(fd: libc::c_int) -> Result<Vec<RouteEntry>> {
        // nlmsghdr followed by a rtmsg asking for an AF_INET route dump.
        let mut request = [0u8; NLMSG_HDR_LEN + RTMSG_LEN];
        let request_len = request.len() as u32;
        request[0..4].copy_from_slice(&request_len.to_ne_bytes());
        request[4..6].copy_from_slice(&libc::RTM_GETROUTE.to_ne_bytes());
        request[6..8]
            .copy_from_slice(&((libc::NLM_F_REQUEST | libc::NLM_F_DUMP) as u16).to_ne_bytes());
        request[8..12].copy_from_slice(&1u32.to_ne_bytes()); // sequence number
        request[16] = libc::AF_INET as u8;

        // SAFETY: request points at an initialized buffer of the given length.
        let sent = unsafe { libc::send(fd, request.as_ptr().cast(), request.len(), 0) };
        if sent != request.len() as isize {
            return Err(io::Error::last_os_error().into());
        }

        let mut routes = Vec::new();
        let mut buf = vec![0u8; 8192];
        loop {
            // SAFETY: buf is valid for writes of buf.len() bytes.
            let n = unsafe { libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), 0) };
            if n < 0 {
                return Err(io::Error::last_os_error().into());
            }
            if n == 0 {
                break;
            }
            if scan_netlink_messages(&buf[..n as usize], &mut routes)? {
                break;
            }
        }
        Ok(routes)
    }

    /// Walks one read's worth of netlink messages, appending decoded routes.
    /// Returns true once the NLMSG_DONE marker ends the dump.
    fn scan_netlink_messages(mut data: &[u8], routes: &mut Vec<RouteEntry>) -> Result<bool> {
        while !data.is_empty() {
            if data.len() < NLMSG_HDR_LEN {
                return Err(Error::Protocol("truncated netlink message".into()));
            }
            let msg_len = u32::from_ne_bytes(data[0..4].try_into().unwrap()) as usize;
            let msg_type = u16::from_ne_bytes(data[4..6].try_into().unwrap());
            if msg_len < NLMSG_HDR_LEN || msg_len > data.len() {
                return Err(Error::Protocol("truncated netlink message".into()));
            }
            if msg_type == libc::NLMSG_DONE as u16 {
                return Ok(true);
            }
            if msg_type == libc::NLMSG_ERROR as u16 {
                return Err(Error::Protocol("netlink error reply to route dump".into()));
            }
            if msg_type == libc::RTM_NEWROUTE {
                if let Some(route) = parse_route_message(&data[NLMSG_HDR_LEN..msg_len])? {
                    routes.push(route);
                }
            }
            // Anything else in the dump is of no interest here.
            let aligned = (msg_len + 3) & !3;
            if aligned >= data.len() {
                break;
            }
            data = &data[aligned..];
        }
        Ok(false)
    }

    /// Decodes one RTM_NEWROUTE payload. Rows for other address families
    /// yield `None`.
    fn parse_route_message(data: &[u8]) -> Result<Option<RouteEntry>> {
        if data.len() < RTMSG_LEN {
            return Err(Error::Protocol("truncated route message".into()));
        }
        // Fixed rtmsg header: family, dst_len, src_len, tos, table, protocol,
        // scope, type, flags. Only the prefix lengths feed into the entry.
        let family = data[0];
        let dst_len = data[1];
        let src_len = data[2];
        if libc::c_int::from(family) != libc::AF_INET {
            return Ok(None);
        }

        let mut route = RouteEntry::default();
        let mut attrs = &data[RTMSG_LEN..];
        while attrs.len() >= 4 {
            let rta_len = u16::from_ne_bytes(attrs[0..2].try_into().unwrap()) as usize;
            let rta_type = u16::from_ne_bytes(attrs[2..4].try_into().unwrap());
            if rta_len < 4 || rta_len > attrs.len() {
                return Err(Error::Protocol("malformed route attribute".into()));
            }
            let value = &attrs[4..rta_len];
            match rta_type {
                t if t == libc::RTA_DST => {
                    route.dst = ipv4_attr(value).map(|ip| (ip, dst_len));
                }
                t if t == libc::RTA_SRC => {
                    route.src = ipv4_attr(value).map(|ip| (ip, src_len));
                }
                t if t == libc::RTA_GATEWAY => {
                    route.gateway = ipv4_attr(value);
                }
                // Interface index, priority and friends.
                _ => {}
            }
            let aligned = (rta_len + 3) & !3;
            if aligned >= attrs.len() {
                break;
            }
            attrs = &attrs[aligned..];
        }
        Ok(Some(route))
    }

    fn ipv4_attr(value: &[u8]) -> Option<Ipv4Addr> {
        (value.len() >= 4).then(|| Ipv4Addr::new(value[0], value[1], value[2], value[3]))
    }

}

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
mod bsd {
    use std::io;
    use std::net::Ipv4Addr;
    use std::ptr;

    use crate::error::{Error, Result};

    // Fixed route-message header sizes, from the generated system headers.
    // OpenBSD carries the header length inside the message instead.
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    const RTM_BODY_OFF: usize = 0x5c;
    #[cfg(target_os = "freebsd")]
    const RTM_BODY_OFF: usize = 0x98;
    #[cfg(target_os = "netbsd")]
    const RTM_BODY_OFF: usize = 0x78;

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    const SOCKADDR_ALIGN: usize = 4;
    #[cfg(not(any(target_os = "macos", target_os = "ios")))]
    const SOCKADDR_ALIGN: usize = 8;

    // Positions in the per-message sockaddr vector.
    const RTAX_DST: u32 = 0;
    const RTAX_GATEWAY: u32 = 1;

    pub fn default_gateway() -> Result<Ipv4Addr> {
        let table = fetch_route_table()?;
        find_default_gateway(&table)
            .ok_or_else(|| Error::Protocol("failed to find default gateway".into()))
    }

    fn fetch_route_table() -> Result<Vec<u8>> {
        let mut mib: [libc::c_int; 6] = [
            libc::CTL_NET,
            libc::AF_ROUTE,
            0,
            libc::AF_INET,
            libc::NET_RT_DUMP,
            0,
        ];
        let mut len: libc::size_t = 0;
        // SAFETY: standard two-call sysctl pattern; the second call writes at
        // most `len` bytes into a buffer of that size.
        unsafe {
            if libc::sysctl(
                mib.as_mut_ptr(),
                6,
                ptr::null_mut(),
                &mut len,
                ptr::null_mut(),
                0,
            ) != 0
            {
                return Err(io::Error::last_os_error().into());
            }
            let mut buf = vec![0u8; len];
            if libc::sysctl(
                mib.as_mut_ptr(),
                6,
                buf.as_mut_ptr().cast(),
                &mut len,
                ptr::null_mut(),
                0,
            ) != 0
            {
                return Err(io::Error::last_os_error().into());
            }
            buf.truncate(len);
            Ok(buf)
        }
    }

    fn find_default_gateway(table: &[u8]) -> Option<Ipv4Addr> {
        let mut data = table;
        while data.len() >= 4 {
            let msg_len = u16::from_ne_bytes([data[0], data[1]]) as usize;
            if msg_len < 4 || msg_len > data.len() {
                break;
            }
            if let Some(gateway) = parse_route_message(&data[..msg_len]) {
                return Some(gateway);
            }
            data = &data[msg_len..];
        }
        None
    }

    /// Returns the gateway if this message describes the default route.
    fn parse_route_message(msg: &[u8]) -> Option<Ipv4Addr> {
        let body_off = rtm_body_off(msg)?;
        if msg.len() < body_off || msg.len() < 16 {
            return None;
        }
        let addrs_mask = u32::from_ne_bytes(msg[12..16].try_into().unwrap());

        // The sockaddr vector is packed in RTAX bit order; destination and
        // gateway are the first two slots.
        let mut cursor = &msg[body_off..];
        let mut dst = None;
        let mut gateway = None;
        for index in 0..8u32 {
            if addrs_mask & (1 << index) == 0 {
                continue;
            }
            if cursor.is_empty() {
                break;
            }
            let sa_len = cursor[0] as usize;
            let advance = if sa_len == 0 {
                SOCKADDR_ALIGN
            } else {
                (sa_len + SOCKADDR_ALIGN - 1) & !(SOCKADDR_ALIGN - 1)
            };
            if sa_len >= 8 && cursor.len() >= 8 && libc::c_int::from(cursor[1]) == libc::AF_INET {
                let ip = Ipv4Addr::new(cursor[4], cursor[5], cursor[6], cursor[7]);
                match index {
                    RTAX_DST => dst = Some(ip),
                    RTAX_GATEWAY => gateway = Some(ip),
                    _ => {}
                }
            }
            if advance >= cursor.len() {
                cursor = &[];
            } else {
                cursor = &cursor[advance..];
            }
        }

        match (dst, gateway) {
            (Some(dst), Some(gateway)) if dst == Ipv4Addr::UNSPECIFIED => Some(gateway),
            _ => None,
        }
    }

    #[cfg(target_os = "openbsd")]
    fn rtm_body_off(msg: &[u8]) -> Option<usize> {
        (msg.len() >= 6).then(|| u16::from_ne_bytes([msg[4], msg[5]]) as usize)
    }

    #[cfg(not(target_os = "openbsd"))]
    fn rtm_body_off(msg: &[u8]) -> Option<usize> {
        (msg.len() >= RTM_BODY_OFF).then_some(RTM_BODY_OFF)
    }
}

#[cfg(windows)]
mod windows {
    use std::io;
    use std::net::Ipv4Addr;

    use windows_sys::Win32::NetworkManagement::IpHelper::{GetBestRoute, MIB_IPFORWARDROW};

    use crate::error::Result;

    pub fn default_gateway() -> Result<Ipv4Addr> {
        // The best route to 0.0.0.0 is the default route; its next hop is
        // the gateway.
        // SAFETY: GetBestRoute fills the row on success; zeroed is a valid
        // initial state for the plain-old-data row struct.
        let mut row: MIB_IPFORWARDROW = unsafe { std::mem::zeroed() };
        let ret = unsafe { GetBestRoute(0, 0, &mut row) };
        if ret != 0 {
            return Err(io::Error::from_raw_os_error(ret as i32).into());
        }
        // dwForwardNextHop is in network byte order.
        Ok(Ipv4Addr::from(row.dwForwardNextHop.to_ne_bytes()))
    }
}
