// Firmware server discovery over mDNS

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;

use crate::config::OtaConfig;
use crate::error::DiscoveryError;

/// Name-to-address resolution on the local network.
///
/// Implementations bring the responder up inside `resolve` and tear it down
/// before returning, on success and on failure alike. Nothing is cached
/// between calls.
pub trait Discovery {
    fn resolve(&self, name: &str, timeout: Duration) -> Result<Ipv4Addr, DiscoveryError>;
}

/// IPv4 address the firmware server answered from. Resolved once per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceAddress(Ipv4Addr);

impl ServiceAddress {
    pub fn new(ip: Ipv4Addr) -> Self {
        Self(ip)
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.0
    }
}

impl fmt::Display for ServiceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Issue exactly one A query for the configured service name.
pub fn discover<D>(resolver: &D, config: &OtaConfig) -> Result<ServiceAddress, DiscoveryError>
where
    D: Discovery + ?Sized,
{
    let name = config.service_name.as_str();
    let timeout = config.query_timeout();
    log::info!("Querying mDNS for '{}' (timeout {} ms)", name, timeout.as_millis());

    let ip = match resolver.resolve(name, timeout) {
        Ok(ip) => ip,
        Err(e) => {
            log::info!("No firmware server found: {}", e);
            return Err(e);
        }
    };

    // A responder answering 0.0.0.0 or a group address is as good as silence
    if ip.is_unspecified() || ip.is_broadcast() || ip.is_multicast() {
        log::warn!("Ignoring unusable mDNS answer {} for '{}'", ip, name);
        return Err(DiscoveryError::NotFound { name: name.to_string() });
    }

    log::info!("Firmware server found at {}", ip);
    Ok(ServiceAddress::new(ip))
}
