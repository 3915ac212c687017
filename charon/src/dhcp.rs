//! Minimal DHCP client for pod interfaces.
//!
//! One four-packet DISCOVER/OFFER/REQUEST/ACK exchange, run inside the
//! target namespace on a pinned blocking thread. The exchange respects the
//! surrounding time budget with short read deadlines and fails *softly*: any
//! timeout or malformed reply yields `None` and the caller proceeds without
//! DHCP configuration. Only classless static routes (option 121) are
//! honored; the legacy option 33 is ignored. Leases are not renewed.

use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use dhcproto::v4::{DhcpOption, Flags, HType, Message, MessageType, Opcode, OptionCode};
use dhcproto::{Decodable, Decoder, Encodable};
use ipnet::{IpNet, Ipv4Net};
use tracing::{debug, warn};

use crate::config::{Route, RouteScope};
use crate::netns;

const SERVER_PORT: u16 = 67;
const CLIENT_PORT: u16 = 68;

/// deadline for the OFFER after broadcasting DISCOVER
const OFFER_TIMEOUT: Duration = Duration::from_secs(1);
/// deadline for the ACK after the REQUEST
const ACK_TIMEOUT: Duration = Duration::from_millis(500);

/// what a successful exchange yields
#[derive(Debug, Clone, PartialEq)]
pub struct DhcpLease {
    pub address: Ipv4Net,
    pub routes: Vec<Route>,
}

/// Run the exchange on `ifname` inside the namespace at `netns_path` (the
/// current namespace when `None`). Soft failure: `Ok(None)` when no usable
/// lease was obtained.
pub async fn exchange(
    netns_path: Option<&Path>,
    ifname: &str,
    mac: Vec<u8>,
) -> Result<Option<DhcpLease>> {
    let ifname = ifname.to_string();
    match netns_path {
        Some(path) => {
            netns::within_netns(path, move || Ok(run_exchange(&ifname, &mac))).await
        }
        None => tokio::task::spawn_blocking(move || run_exchange(&ifname, &mac))
            .await
            .context("dhcp task panicked"),
    }
}

/// the blocking exchange; the calling thread is already in the right
/// namespace
fn run_exchange(ifname: &str, mac: &[u8]) -> Option<DhcpLease> {
    match try_exchange(ifname, mac) {
        Ok(lease) => lease,
        Err(err) => {
            warn!("dhcp exchange on {} failed: {}", ifname, err);
            None
        }
    }
}

fn try_exchange(ifname: &str, mac: &[u8]) -> Result<Option<DhcpLease>> {
    let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, CLIENT_PORT))
        .context("failed to bind dhcp client socket")?;
    socket.set_broadcast(true).context("failed to enable broadcast")?;
    nix::sys::socket::setsockopt(
        &socket,
        nix::sys::socket::sockopt::BindToDevice,
        &std::ffi::OsString::from(ifname),
    )
    .with_context(|| format!("failed to bind dhcp socket to {}", ifname))?;

    let xid: u32 = rand::random();
    let broadcast = SocketAddrV4::new(Ipv4Addr::BROADCAST, SERVER_PORT);

    // DISCOVER
    let discover = build_message(xid, mac, MessageType::Discover, None, None)?;
    socket
        .send_to(&discover.to_vec().context("failed to encode DISCOVER")?, broadcast)
        .context("failed to send DISCOVER")?;

    // OFFER
    let Some(offer) = wait_for_reply(&socket, xid, MessageType::Offer, OFFER_TIMEOUT)? else {
        debug!("no dhcp OFFER on {} within {:?}", ifname, OFFER_TIMEOUT);
        return Ok(None);
    };
    let offered = offer.yiaddr();
    let server = match offer.opts().get(OptionCode::ServerIdentifier) {
        Some(DhcpOption::ServerIdentifier(addr)) => *addr,
        _ => {
            debug!("dhcp OFFER on {} without server identifier", ifname);
            return Ok(None);
        }
    };

    // REQUEST, targeted at the offering server
    let request = build_message(xid, mac, MessageType::Request, Some(offered), Some(server))?;
    socket
        .send_to(&request.to_vec().context("failed to encode REQUEST")?, broadcast)
        .context("failed to send REQUEST")?;

    // ACK
    let Some(ack) = wait_for_reply(&socket, xid, MessageType::Ack, ACK_TIMEOUT)? else {
        debug!("no dhcp ACK on {} within {:?}", ifname, ACK_TIMEOUT);
        return Ok(None);
    };

    Ok(parse_lease(&ack))
}

fn build_message(
    xid: u32,
    mac: &[u8],
    message_type: MessageType,
    requested: Option<Ipv4Addr>,
    server: Option<Ipv4Addr>,
) -> Result<Message> {
    let mut message = Message::default();
    message
        .set_opcode(Opcode::BootRequest)
        .set_htype(HType::Eth)
        .set_xid(xid)
        .set_flags(Flags::default().set_broadcast())
        .set_chaddr(mac);
    message
        .opts_mut()
        .insert(DhcpOption::MessageType(message_type));
    message
        .opts_mut()
        .insert(DhcpOption::ParameterRequestList(vec![
            OptionCode::SubnetMask,
            OptionCode::Router,
            OptionCode::ClasslessStaticRoute,
        ]));
    if let Some(addr) = requested {
        message
            .opts_mut()
            .insert(DhcpOption::RequestedIpAddress(addr));
    }
    if let Some(addr) = server {
        message
            .opts_mut()
            .insert(DhcpOption::ServerIdentifier(addr));
    }
    Ok(message)
}

/// read replies until one matches the transaction id and message type or the
/// deadline passes; foreign packets are skipped
fn wait_for_reply(
    socket: &UdpSocket,
    xid: u32,
    expected: MessageType,
    timeout: Duration,
) -> Result<Option<Message>> {
    let deadline = Instant::now() + timeout;
    let mut buf = [0u8; 1500];

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(None);
        }
        socket
            .set_read_timeout(Some(remaining))
            .context("failed to set read timeout")?;

        let len = match socket.recv(&mut buf) {
            Ok(len) => len,
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                return Ok(None);
            }
            Err(err) => return Err(err).context("dhcp recv failed"),
        };

        let Ok(message) = Message::decode(&mut Decoder::new(&buf[..len])) else {
            continue;
        };
        if message.xid() != xid {
            continue;
        }
        match message.opts().get(OptionCode::MessageType) {
            Some(DhcpOption::MessageType(found)) if *found == expected => {
                return Ok(Some(message));
            }
            _ => continue,
        }
    }
}

/// extract the address and routes from an ACK
fn parse_lease(ack: &Message) -> Option<DhcpLease> {
    let address = ack.yiaddr();
    if address.is_unspecified() {
        return None;
    }

    let prefix = match ack.opts().get(OptionCode::SubnetMask) {
        Some(DhcpOption::SubnetMask(mask)) => ipnet::ipv4_mask_to_prefix(*mask).ok()?,
        _ => 32,
    };
    let address = Ipv4Net::new(address, prefix).ok()?;

    // classless static routes take precedence over the router option
    // (RFC 3442); option 33 is never consulted
    let mut routes = Vec::new();
    if let Some(DhcpOption::ClasslessStaticRoute(entries)) =
        ack.opts().get(OptionCode::ClasslessStaticRoute)
    {
        for (destination, gateway) in entries {
            routes.push(classless_route(*destination, *gateway));
        }
    } else if let Some(DhcpOption::Router(gateways)) = ack.opts().get(OptionCode::Router) {
        if let Some(gateway) = gateways.first() {
            routes.push(Route {
                destination: IpNet::V4(Ipv4Net::new(Ipv4Addr::UNSPECIFIED, 0).expect("0.0.0.0/0")),
                gateway: Some((*gateway).into()),
                source: None,
                scope: RouteScope::Universe,
            });
        }
    }

    Some(DhcpLease { address, routes })
}

/// a 0.0.0.0 next hop means directly connected, i.e. link scope
fn classless_route(destination: Ipv4Net, gateway: Ipv4Addr) -> Route {
    if gateway.is_unspecified() {
        Route {
            destination: IpNet::V4(destination),
            gateway: None,
            source: None,
            scope: RouteScope::Link,
        }
    } else {
        Route {
            destination: IpNet::V4(destination),
            gateway: Some(gateway.into()),
            source: None,
            scope: RouteScope::Universe,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ack(xid: u32, yiaddr: Ipv4Addr, opts: Vec<DhcpOption>) -> Message {
        let mut message = Message::default();
        message
            .set_opcode(Opcode::BootReply)
            .set_htype(HType::Eth)
            .set_xid(xid)
            .set_yiaddr(yiaddr);
        message
            .opts_mut()
            .insert(DhcpOption::MessageType(MessageType::Ack));
        for opt in opts {
            message.opts_mut().insert(opt);
        }
        message
    }

    #[test]
    fn test_parse_lease_with_router() {
        let message = ack(
            7,
            "169.254.0.5".parse().unwrap(),
            vec![
                DhcpOption::SubnetMask("255.255.255.0".parse().unwrap()),
                DhcpOption::Router(vec!["169.254.0.1".parse().unwrap()]),
            ],
        );
        let lease = parse_lease(&message).unwrap();
        assert_eq!(lease.address.to_string(), "169.254.0.5/24");
        assert_eq!(lease.routes.len(), 1);
        assert_eq!(lease.routes[0].destination.to_string(), "0.0.0.0/0");
        assert_eq!(
            lease.routes[0].gateway,
            Some("169.254.0.1".parse().unwrap())
        );
    }

    #[test]
    fn test_classless_routes_win_over_router() {
        let message = ack(
            7,
            "10.1.2.3".parse().unwrap(),
            vec![
                DhcpOption::SubnetMask("255.255.0.0".parse().unwrap()),
                DhcpOption::Router(vec!["10.1.0.1".parse().unwrap()]),
                DhcpOption::ClasslessStaticRoute(vec![
                    ("0.0.0.0/0".parse().unwrap(), "10.1.0.254".parse().unwrap()),
                    ("10.9.0.0/16".parse().unwrap(), "0.0.0.0".parse().unwrap()),
                ]),
            ],
        );
        let lease = parse_lease(&message).unwrap();
        assert_eq!(lease.routes.len(), 2);
        // the router option is ignored when option 121 is present
        assert_eq!(
            lease.routes[0].gateway,
            Some("10.1.0.254".parse().unwrap())
        );
        // a 0.0.0.0 next hop becomes a gateway-less link-scope route
        assert_eq!(lease.routes[1].gateway, None);
        assert_eq!(lease.routes[1].scope, RouteScope::Link);
    }

    #[test]
    fn test_unspecified_yiaddr_is_no_lease() {
        let message = ack(7, Ipv4Addr::UNSPECIFIED, vec![]);
        assert!(parse_lease(&message).is_none());
    }

    #[test]
    fn test_missing_mask_defaults_to_host_prefix() {
        let message = ack(7, "192.0.2.9".parse().unwrap(), vec![]);
        let lease = parse_lease(&message).unwrap();
        assert_eq!(lease.address.prefix_len(), 32);
    }

    #[test]
    fn test_discover_has_expected_options() {
        let message = build_message(
            42,
            &[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff],
            MessageType::Discover,
            None,
            None,
        )
        .unwrap();
        assert_eq!(message.xid(), 42);
        assert!(matches!(
            message.opts().get(OptionCode::MessageType),
            Some(DhcpOption::MessageType(MessageType::Discover))
        ));
        assert!(message.opts().get(OptionCode::ParameterRequestList).is_some());
        // round-trips through the wire codec
        let bytes = message.to_vec().unwrap();
        let decoded = Message::decode(&mut Decoder::new(&bytes)).unwrap();
        assert_eq!(decoded.xid(), 42);
    }
}
