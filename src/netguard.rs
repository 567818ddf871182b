//! Outbound network gate.
//!
//! Every URL an extension hands to any host API (including the polyfills)
//! passes through [`validate_domain`] before a request is built: parse the
//! URL, reject private/loopback/link-local targets and mDNS `.local` names,
//! then consult the manifest allow-list. IP literals are parsed and
//! classified rather than string-matched, so dotted-decimal tricks and
//! IPv6-mapped addresses cannot slip past the gate.

use crate::error::{Error, Result};
use crate::manifest::ExtensionManifest;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use url::Url;

/// Check whether `host` names a private, loopback, or link-local target.
///
/// Covers `localhost`, any name ending in `.local`, `127.0.0.0/8`,
/// `10.0.0.0/8`, `172.16.0.0/12`, `192.168.0.0/16`, `169.254.0.0/16`, and
/// their IPv6 equivalents (loopback, unique-local, link-local, v4-mapped).
pub fn is_private_host(host: &str) -> bool {
    let host = host.trim().trim_end_matches('.').to_ascii_lowercase();
    if host == "localhost" || host.ends_with(".local") {
        return true;
    }

    // URL host strings carry IPv6 literals in brackets.
    let bare = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(&host);

    match bare.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => is_private_v4(v4),
        Ok(IpAddr::V6(v6)) => is_private_v6(v6),
        Err(_) => false,
    }
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    ip.is_loopback() || ip.is_private() || ip.is_link_local() || ip.is_unspecified()
}

fn is_private_v6(ip: Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_private_v4(v4);
    }
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        // fc00::/7 unique local
        || (first & 0xfe00) == 0xfc00
        // fe80::/10 link local
        || (first & 0xffc0) == 0xfe80
}

/// Apply the domain gate to an outbound URL.
///
/// Returns an error naming the offending host when the URL fails to parse,
/// targets a private address, or is not covered by the manifest allow-list.
pub fn validate_domain(manifest: &ExtensionManifest, url_str: &str) -> Result<()> {
    let parsed =
        Url::parse(url_str).map_err(|err| Error::validation(format!("invalid URL: {err}")))?;

    let Some(host) = parsed.host_str() else {
        return Err(Error::validation(format!(
            "invalid URL: no host in '{url_str}'"
        )));
    };

    if is_private_host(host) {
        return Err(Error::sandbox(format!(
            "network access denied: private/local network '{host}' not allowed"
        )));
    }

    if !manifest.is_domain_allowed(host) {
        return Err(Error::permission(format!(
            "network access denied: domain '{host}' not in allowed list"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ExtensionPermissions;

    fn manifest_with(network: &[&str]) -> ExtensionManifest {
        ExtensionManifest {
            name: "t".into(),
            display_name: String::new(),
            version: String::new(),
            author: String::new(),
            description: String::new(),
            types: vec!["metadata_provider".into()],
            permissions: ExtensionPermissions {
                network: network.iter().map(|s| (*s).to_string()).collect(),
                file: false,
                storage: false,
            },
        }
    }

    #[test]
    fn private_host_table() {
        let blocked = [
            "localhost",
            "127.0.0.1",
            "127.0.0.2",
            "10.0.0.1",
            "10.255.255.255",
            "172.16.0.1",
            "172.31.255.255",
            "192.168.0.1",
            "192.168.255.255",
            "169.254.169.254",
            "router.local",
            "mydevice.local",
            "[::1]",
            "::1",
            "[::ffff:192.168.0.1]",
            "fe80::1",
            "fd12:3456::1",
        ];
        for host in blocked {
            assert!(is_private_host(host), "{host} should be blocked");
        }

        let allowed = [
            "8.8.8.8",
            "1.1.1.1",
            "api.example.com",
            "google.com",
            // Just outside the 172.16/12 and 192.168/16 ranges.
            "172.15.0.1",
            "172.32.0.1",
            "192.167.0.1",
            "2606:4700::1111",
        ];
        for host in allowed {
            assert!(!is_private_host(host), "{host} should be allowed");
        }
    }

    #[test]
    fn gate_blocks_private_targets() {
        let manifest = manifest_with(&["api.example.com"]);
        let blocked = [
            "http://localhost/admin",
            "http://127.0.0.1/admin",
            "http://192.168.1.1/admin",
            "http://10.0.0.1/admin",
            "http://172.16.0.1/admin",
            "http://169.254.169.254/latest/meta-data/",
            "http://router.local/admin",
            "http://[::1]/admin",
        ];
        for url in blocked {
            let err = validate_domain(&manifest, url).unwrap_err();
            assert!(
                matches!(err, Error::Sandbox(_)),
                "{url} should be a sandbox violation, got {err}"
            );
        }
    }

    #[test]
    fn gate_respects_allow_list() {
        let manifest = manifest_with(&["api.allowed.com", "*.wildcard.com"]);

        validate_domain(&manifest, "https://api.allowed.com/path").unwrap();
        validate_domain(&manifest, "https://sub.wildcard.com/path").unwrap();

        let err = validate_domain(&manifest, "https://blocked.com/path").unwrap_err();
        assert!(err.to_string().contains("not in allowed list"));
        assert!(validate_domain(&manifest, "https://notallowed.com/x").is_err());
    }

    #[test]
    fn gate_rejects_unparseable_urls() {
        let manifest = manifest_with(&["api.example.com"]);
        assert!(validate_domain(&manifest, "not a url").is_err());
        assert!(validate_domain(&manifest, "file:///etc/passwd").is_err());
    }
}
