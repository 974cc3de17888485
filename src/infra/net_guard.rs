//! Outbound request guard shared by both disk caches.
//!
//! A URL is only fetched when it parses, uses `http` or `https`, and its host
//! is neither a loopback, private, link-local or unspecified address nor a
//! local-only name. Anything that fails to parse is treated as private.

use std::net::{Ipv4Addr, Ipv6Addr};

use url::{Host, Url};

pub fn is_private_target(raw: &str) -> bool {
    let Ok(url) = Url::parse(raw) else {
        return true;
    };
    if !matches!(url.scheme(), "http" | "https") {
        return true;
    }

    match url.host() {
        Some(Host::Ipv4(addr)) => is_private_v4(addr),
        Some(Host::Ipv6(addr)) => is_private_v6(addr),
        Some(Host::Domain(domain)) => is_local_name(domain),
        None => true,
    }
}

fn is_private_v4(addr: Ipv4Addr) -> bool {
    let [first, second, ..] = addr.octets();
    addr.is_private()
        || addr.is_loopback()
        || addr.is_link_local()
        || addr.is_unspecified()
        || addr.is_broadcast()
        || first == 0
        // 100.64.0.0/10, carrier-grade NAT
        || (first == 100 && (64..128).contains(&second))
}

fn is_private_v6(addr: Ipv6Addr) -> bool {
    if let Some(mapped) = addr.to_ipv4_mapped() {
        return is_private_v4(mapped);
    }
    let head = addr.segments()[0];
    addr.is_loopback()
        || addr.is_unspecified()
        || (head & 0xfe00) == 0xfc00
        || (head & 0xffc0) == 0xfe80
}

fn is_local_name(domain: &str) -> bool {
    let domain = domain.trim_end_matches('.').to_ascii_lowercase();
    domain == "localhost" || domain.ends_with(".localhost") || domain.ends_with(".local")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_private_and_local_targets() {
        for url in [
            "http://127.0.0.1/a.png",
            "http://10.0.0.8/a.png",
            "http://172.20.1.1/a.png",
            "http://192.168.1.10:8080/a.png",
            "http://169.254.169.254/latest/meta-data",
            "http://0.0.0.0/",
            "http://100.100.1.1/",
            "http://[::1]/a.png",
            "http://[fd00::1]/a.png",
            "http://[fe80::1]/a.png",
            "http://[::ffff:127.0.0.1]/a.png",
            "http://localhost/a.png",
            "http://LOCALHOST./a.png",
            "http://printer.local/a.png",
            "http://api.localhost/a.png",
        ] {
            assert!(is_private_target(url), "{url} should be blocked");
        }
    }

    #[test]
    fn blocks_unparseable_and_non_http() {
        for url in ["not a url", "cache/draw/a.png", "ftp://example.com/a.png", "file:///etc/passwd"] {
            assert!(is_private_target(url), "{url} should be blocked");
        }
    }

    #[test]
    fn allows_public_hosts() {
        for url in [
            "https://example.com/a.png",
            "http://i0.hdslb.com/bfs/face/abc.jpg@120w.webp",
            "http://8.8.8.8/",
            "http://172.32.0.1/",
            "http://[2606:4700::1111]/",
        ] {
            assert!(!is_private_target(url), "{url} should be allowed");
        }
    }
}
