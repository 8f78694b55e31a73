//! Per-flow external hostnames

use std::net::IpAddr;

use crate::topology::Ingress;

/// Derive the external host of a flow from an ingress host.
///
/// The host is taken apart as `[scheme://]hostname[:port][/path]`; only the
/// hostname's DNS labels change:
///
/// | labels | rule | example (`dev-1`) |
/// |---|---|---|
/// | three or more | leftmost label replaced | `shop.eu.example.com` -> `dev-1.eu.example.com` |
/// | exactly two | `flow_id` prepended | `example.com` -> `dev-1.example.com` |
/// | one | unchanged | `localhost` |
///
/// Scheme, port and path are carried over verbatim. IP addresses and hosts
/// with empty labels are returned unchanged.
pub fn flow_host(host: &str, flow_id: &str) -> String {
    let (scheme, rest) = ["https://", "http://"]
        .iter()
        .find_map(|scheme| host.strip_prefix(scheme).map(|rest| (*scheme, rest)))
        .unwrap_or(("", host));

    let (authority, path) = match rest.find('/') {
        Some(idx) => rest.split_at(idx),
        None => (rest, ""),
    };

    let (hostname, port) = match authority.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
            (name, &authority[name.len()..])
        }
        _ => (authority, ""),
    };
    if hostname.parse::<IpAddr>().is_ok() {
        return host.to_string();
    }

    let labels: Vec<&str> = hostname.split('.').collect();
    if labels.iter().any(|l| l.is_empty()) {
        return host.to_string();
    }

    let hostname = match labels.len() {
        0 | 1 => return host.to_string(),
        2 => format!("{flow_id}.{hostname}"),
        _ => format!("{flow_id}.{}", labels[1..].join(".")),
    };
    format!("{scheme}{hostname}{port}{path}")
}

/// External host serving `flow_id` through an ingress host.
///
/// The base flow keeps the declared host; every other flow gets its own.
pub fn host_for_flow(host: &str, flow_id: &str, base_version: &str) -> String {
    if flow_id == base_version {
        host.to_string()
    } else {
        flow_host(host, flow_id)
    }
}

/// `(flow id, external host)` for every active flow of an ingress with a host
pub fn ingress_flow_hosts(ingress: &Ingress, base_version: &str) -> Vec<(String, String)> {
    let Some(host) = ingress.host() else {
        return Vec::new();
    };
    let mut hosts: Vec<(String, String)> = Vec::new();
    for flow_id in &ingress.active_flow_ids {
        let flow_host = host_for_flow(host, flow_id, base_version);
        if !hosts.iter().any(|(_, h)| *h == flow_host) {
            hosts.push((flow_id.clone(), flow_host));
        }
    }
    hosts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::fixtures::ingress;

    #[test]
    fn replaces_leftmost_label() {
        assert_eq!(flow_host("web.example.com", "dev-1"), "dev-1.example.com");
        assert_eq!(flow_host("prod.app.localhost", "dev"), "dev.app.localhost");
        assert_eq!(flow_host("a.b.c.d", "f"), "f.b.c.d");
    }

    #[test]
    fn prepends_to_bare_domain() {
        assert_eq!(flow_host("example.com", "dev-1"), "dev-1.example.com");
    }

    #[test]
    fn single_label_is_unchanged() {
        assert_eq!(flow_host("localhost", "dev-1"), "localhost");
    }

    #[test]
    fn base_flow_keeps_declared_host() {
        assert_eq!(host_for_flow("web.example.com", "prod", "prod"), "web.example.com");
        assert_eq!(host_for_flow("web.example.com", "dev-1", "prod"), "dev-1.example.com");
    }

    #[test]
    fn ingress_hosts_follow_active_flows() {
        let hosted = ingress(
            "frontend-ingress",
            Some("web.example.com"),
            "frontend",
            &["prod", "dev-1", "dev-1"],
        );
        assert_eq!(
            ingress_flow_hosts(&hosted, "prod"),
            vec![
                ("prod".to_string(), "web.example.com".to_string()),
                ("dev-1".to_string(), "dev-1.example.com".to_string()),
            ]
        );

        let hostless = ingress("frontend-ingress", None, "frontend", &["prod"]);
        assert!(ingress_flow_hosts(&hostless, "prod").is_empty());
    }

    #[test]
    fn multi_label_hosts_keep_every_parent_label() {
        assert_eq!(flow_host("shop.eu.example.com", "dev-1"), "dev-1.eu.example.com");
        assert_eq!(
            flow_host("api.staging.eu.example.co.uk", "dev-1"),
            "dev-1.staging.eu.example.co.uk"
        );
        assert_eq!(flow_host("*.example.com", "dev-1"), "dev-1.example.com");
    }

    #[test]
    fn port_suffix_is_not_a_label() {
        assert_eq!(flow_host("web.example.com:8080", "dev-1"), "dev-1.example.com:8080");
        assert_eq!(flow_host("example.com:8080", "dev-1"), "dev-1.example.com:8080");
        assert_eq!(flow_host("localhost:8080", "dev-1"), "localhost:8080");
        assert_eq!(
            flow_host("shop.eu.example.com:443/cart", "dev-1"),
            "dev-1.eu.example.com:443/cart"
        );
    }

    #[test]
    fn ip_and_malformed_hosts_are_unchanged() {
        assert_eq!(flow_host("10.0.0.1", "dev-1"), "10.0.0.1");
        assert_eq!(flow_host("10.0.0.1:8080", "dev-1"), "10.0.0.1:8080");
        assert_eq!(flow_host("web..example.com", "dev-1"), "web..example.com");
        assert_eq!(flow_host(".example.com", "dev-1"), ".example.com");
    }

    #[test]
    fn keeps_scheme_port_and_path() {
        assert_eq!(
            flow_host("https://web.example.com:8443/shop", "dev-1"),
            "https://dev-1.example.com:8443/shop"
        );
        assert_eq!(
            flow_host("http://example.com/", "prod"),
            "http://prod.example.com/"
        );
    }
}
