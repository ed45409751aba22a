//! Client address resolution.
//!
//! Behind a reverse proxy the TCP peer is the proxy, not the client, so the
//! forwarding headers come first:
//!
//! 1. `X-Forwarded-For` — first comma-separated entry
//! 2. `X-Real-IP`
//! 3. the transport peer address, host part only
//!
//! The first candidate that is *present* is the one parsed. A present but
//! malformed header yields `None` (unknown) rather than falling through to a
//! weaker source.

use std::net::{IpAddr, SocketAddr};

use http::{HeaderMap, HeaderValue};

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";

/// Resolves the client address of a request. Pure.
pub fn resolve(headers: &HeaderMap, remote: Option<SocketAddr>) -> Option<IpAddr> {
    if let Some(value) = header(headers, X_FORWARDED_FOR) {
        return value.to_str().ok()?.split(',').next()?.trim().parse().ok();
    }
    if let Some(value) = header(headers, X_REAL_IP) {
        return value.to_str().ok()?.trim().parse().ok();
    }
    remote.map(|addr| addr.ip())
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a HeaderValue> {
    headers.get(name).filter(|v| !v.is_empty())
}
