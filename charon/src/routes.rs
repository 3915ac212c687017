//! Route installation inside the target namespace.
//!
//! Routes are issued in non-increasing scope order so link-scope routes
//! (gateway reachability) exist before the universe-scope routes that depend
//! on them. An `already exists` reply is success: retried sandbox callbacks
//! re-install the same routes.

use std::cmp::Reverse;
use std::net::IpAddr;

use anyhow::{Result, bail};
use ipnet::IpNet;
use netlink_packet_route::route::{RouteMessage, RouteScope as NlRouteScope};
use rtnetlink::{Handle, RouteMessageBuilder};
use tracing::debug;

use crate::config::Route;

/// Order routes for installation: link scope (253) before universe (0).
pub fn installation_order(routes: &[Route]) -> Vec<Route> {
    let mut ordered = routes.to_vec();
    ordered.sort_by_key(|route| Reverse(route.scope.as_u8()));
    ordered
}

fn build_message(route: &Route, ifindex: u32) -> Result<RouteMessage> {
    let mut message = match route.destination {
        IpNet::V4(dst) => {
            let mut builder = RouteMessageBuilder::<std::net::Ipv4Addr>::new()
                .destination_prefix(dst.addr(), dst.prefix_len())
                .output_interface(ifindex);
            if let Some(IpAddr::V4(gw)) = route.gateway {
                builder = builder.gateway(gw);
            } else if route.gateway.is_some() {
                bail!("route {} mixes IPv4 destination with IPv6 gateway", route);
            }
            if let Some(IpAddr::V4(src)) = route.source {
                builder = builder.pref_source(src);
            }
            builder.build()
        }
        IpNet::V6(dst) => {
            let mut builder = RouteMessageBuilder::<std::net::Ipv6Addr>::new()
                .destination_prefix(dst.addr(), dst.prefix_len())
                .output_interface(ifindex);
            if let Some(IpAddr::V6(gw)) = route.gateway {
                builder = builder.gateway(gw);
            } else if route.gateway.is_some() {
                bail!("route {} mixes IPv6 destination with IPv4 gateway", route);
            }
            if let Some(IpAddr::V6(src)) = route.source {
                builder = builder.pref_source(src);
            }
            builder.build()
        }
    };
    message.header.scope = NlRouteScope::from(route.scope.as_u8());
    Ok(message)
}

fn is_exist(err: &rtnetlink::Error) -> bool {
    matches!(err, rtnetlink::Error::NetlinkError(e) if e.raw_code() == -libc::EEXIST)
}

/// Install the routes on `ifindex` through a handle opened in the target
/// namespace. Failures are aggregated so one bad route does not hide the
/// rest.
pub async fn apply(handle: &Handle, ifindex: u32, routes: &[Route]) -> Result<()> {
    let mut errors = Vec::new();

    for route in installation_order(routes) {
        let message = match build_message(&route, ifindex) {
            Ok(message) => message,
            Err(err) => {
                errors.push(err.to_string());
                continue;
            }
        };
        match handle.route().add(message).execute().await {
            Ok(()) => debug!("installed route {}", route),
            Err(err) if is_exist(&err) => debug!("route {} already present", route),
            Err(err) => errors.push(format!("route {}: {}", route, err)),
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        bail!("{}", errors.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouteScope;
    use std::str::FromStr;

    fn route(dst: &str, gw: Option<&str>, scope: RouteScope) -> Route {
        Route {
            destination: IpNet::from_str(dst).unwrap(),
            gateway: gw.map(|g| IpAddr::from_str(g).unwrap()),
            source: None,
            scope,
        }
    }

    #[test]
    fn test_link_scope_installs_first() {
        let routes = vec![
            route("10.0.0.0/24", Some("10.0.0.1"), RouteScope::Universe),
            route("10.0.0.1/32", None, RouteScope::Link),
        ];
        let ordered = installation_order(&routes);
        assert_eq!(ordered[0].scope, RouteScope::Link);
        assert_eq!(ordered[1].scope, RouteScope::Universe);
    }

    #[test]
    fn test_order_is_non_increasing() {
        let routes = vec![
            route("10.0.0.0/24", Some("10.0.0.1"), RouteScope::Universe),
            route("10.0.0.1/32", None, RouteScope::Link),
            route("10.1.0.0/16", Some("10.0.0.1"), RouteScope::Universe),
            route("10.0.0.2/32", None, RouteScope::Link),
        ];
        let ordered = installation_order(&routes);
        let scopes: Vec<u8> = ordered.iter().map(|r| r.scope.as_u8()).collect();
        let mut sorted = scopes.clone();
        sorted.sort_by_key(|&s| Reverse(s));
        assert_eq!(scopes, sorted);
    }

    #[test]
    fn test_build_v4_message() {
        let message = build_message(
            &route("10.0.0.0/24", Some("10.0.0.1"), RouteScope::Universe),
            7,
        )
        .unwrap();
        assert_eq!(message.header.destination_prefix_length, 24);
        assert_eq!(message.header.scope, NlRouteScope::Universe);
    }

    #[test]
    fn test_build_link_scope_message() {
        let message = build_message(&route("10.0.0.1/32", None, RouteScope::Link), 7).unwrap();
        assert_eq!(message.header.scope, NlRouteScope::Link);
    }

    #[test]
    fn test_mixed_family_rejected() {
        let bad = Route {
            destination: IpNet::from_str("10.0.0.0/24").unwrap(),
            gateway: Some(IpAddr::from_str("fe80::1").unwrap()),
            source: None,
            scope: RouteScope::Universe,
        };
        assert!(build_message(&bad, 7).is_err());
    }
}
