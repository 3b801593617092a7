use crate::domain::session::ClientContext;
use axum::extract::ConnectInfo;
use axum::http::{header, HeaderMap};
use std::net::SocketAddr;

/// Upstream gateways put the authenticated user here.
pub const USER_ID_HEADER: &str = "x-user-id";
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Who is calling, from request headers and the peer address.
pub fn client_context(headers: &HeaderMap, peer: Option<ConnectInfo<SocketAddr>>) -> ClientContext {
    let user_id = header_str(headers, USER_ID_HEADER)
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(0);

    let forwarded = header_str(headers, FORWARDED_FOR_HEADER)
        .and_then(|raw| raw.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());
    let ip_address = match (forwarded, peer) {
        (Some(ip), _) => ip.to_string(),
        (None, Some(ConnectInfo(addr))) => addr.ip().to_string(),
        (None, None) => String::new(),
    };

    let user_agent = header_str(headers, header::USER_AGENT.as_str())
        .unwrap_or_default()
        .to_string();

    ClientContext {
        user_id,
        ip_address,
        user_agent,
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}
