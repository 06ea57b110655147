//! Network-level trust check for the analytics ingest surface.
//!
//! Ingest is deliberately unauthenticated: no bearer token, no role check.
//! The compensating control is that requests must originate inside the
//! private network — anything else is rejected before a body is read.

use std::net::IpAddr;

/// Loopback, RFC 1918 (v4), link-local, and IPv6 unique-local ranges.
pub fn is_private_addr(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            v6.is_loopback()
                // fc00::/7 unique-local
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                // fe80::/10 link-local
                || (v6.segments()[0] & 0xffc0) == 0xfe80
                // v4-mapped addresses delegate to the v4 rules
                || v6.to_ipv4_mapped().map(|v4| v4.is_loopback() || v4.is_private()).unwrap_or(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn private_ranges_are_accepted() {
        for addr in [
            "127.0.0.1",
            "10.0.0.5",
            "172.16.3.4",
            "192.168.1.1",
            "::1",
            "fc00::1",
            "fe80::1",
            "::ffff:10.0.0.1",
        ] {
            assert!(is_private_addr(ip(addr)), "{addr} should be private");
        }
    }

    #[test]
    fn public_addresses_are_rejected() {
        for addr in ["8.8.8.8", "172.32.0.1", "2001:4860:4860::8888", "::ffff:8.8.8.8"] {
            assert!(!is_private_addr(ip(addr)), "{addr} should be public");
        }
    }
}
