use tracing::{debug, warn};

/// Address other brokers can reach this one at.
///
/// Prefers the first non-loopback IPv4 interface address, then any
/// non-loopback address, then the host name.
pub fn detect_host() -> String {
    match if_addrs::get_if_addrs() {
        Ok(interfaces) => {
            let mut candidates: Vec<_> = interfaces
                .iter()
                .filter(|iface| !iface.is_loopback())
                .map(|iface| iface.ip())
                .collect();
            candidates.sort_by_key(|ip| !ip.is_ipv4());
            if let Some(ip) = candidates.first() {
                debug!("Detected host address {}", ip);
                return ip.to_string();
            }
        }
        Err(e) => warn!("Failed to list network interfaces: {}", e),
    }

    match hostname::get().map(|name| name.into_string()) {
        Ok(Ok(name)) if !name.is_empty() => name,
        _ => {
            warn!("Could not determine host name, advertising 127.0.0.1");
            "127.0.0.1".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_host_is_not_empty() {
        assert!(!detect_host().is_empty());
    }
}
