use std::{
    net::{IpAddr, Ipv4Addr},
    str::FromStr,
};

use actix_web::HttpRequest;
use log::{debug, trace};

/// The address of the client that made the request, as reported to the payment providers.
///
/// The first entry of `X-Forwarded-For` wins, since the server normally sits behind a reverse proxy. Otherwise the
/// peer address from the connection info is used. If neither can be parsed, the loopback address is returned.
pub fn client_ip(req: &HttpRequest) -> IpAddr {
    let forwarded = req
        .headers()
        .get("X-Forwarded-For")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .and_then(|s| IpAddr::from_str(s.trim()).ok());
    if let Some(ip) = forwarded {
        debug!("Using X-Forwarded-For header for remote address: {ip}");
        return ip;
    }
    let peer = req.peer_addr().map(|a| a.ip());
    trace!("Using Peer address for remote address: {peer:?}");
    peer.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}
