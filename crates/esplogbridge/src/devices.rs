// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Static lookup from a sender's IP address to the device it belongs to.

use std::collections::HashMap;
use std::net::IpAddr;

use crate::errors::ConfigError;

/// Immutable IP -> device id table, built once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRegistry {
    devices: HashMap<String, String>,
}

impl DeviceRegistry {
    /// Builds the registry from `ip -> device_id` pairs.
    ///
    /// Keys that parse as IP addresses are stored in their canonical form (see
    /// [`canonical_ip`]), so `::ffff:10.0.0.5` and `10.0.0.5` name the same device.
    pub fn new<I, K, V>(entries: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut devices = HashMap::new();
        for (ip, id) in entries {
            let (ip, id) = (ip.as_ref().trim(), id.as_ref().trim());
            if ip.is_empty() || id.is_empty() {
                return Err(ConfigError::Invalid(
                    "devices contains empty ip or device_id".to_string(),
                ));
            }
            devices.insert(canonical_key(ip), id.to_string());
        }

        if devices.is_empty() {
            return Err(ConfigError::Invalid(
                "devices must contain at least one IP -> device_id mapping".to_string(),
            ));
        }

        Ok(DeviceRegistry { devices })
    }

    /// Returns the device id registered for `addr`, if any.
    #[must_use]
    pub fn lookup(&self, addr: IpAddr) -> Option<&str> {
        self.devices.get(&canonical_ip(addr)).map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// Renders an address the way registry keys are stored: IPv4-mapped IPv6 addresses become
/// dotted decimal, everything else uses the standard textual form.
#[must_use]
pub fn canonical_ip(addr: IpAddr) -> String {
    match addr {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => v6.to_string(),
        },
    }
}

fn canonical_key(ip: &str) -> String {
    match ip.parse::<IpAddr>() {
        Ok(addr) => canonical_ip(addr),
        Err(_) => ip.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_lookup_ipv4() {
        let registry = DeviceRegistry::new([("192.168.1.20", "porch")]).expect("valid registry");
        assert_eq!(
            registry.lookup(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20))),
            Some("porch")
        );
        assert_eq!(
            registry.lookup(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 21))),
            None
        );
    }

    #[test]
    fn test_lookup_ipv4_mapped_source() {
        let registry = DeviceRegistry::new([("192.168.1.20", "porch")]).expect("valid registry");
        let mapped = Ipv4Addr::new(192, 168, 1, 20).to_ipv6_mapped();
        assert_eq!(registry.lookup(IpAddr::V6(mapped)), Some("porch"));
    }

    #[test]
    fn test_ipv4_mapped_key_is_canonicalized() {
        let registry =
            DeviceRegistry::new([("::ffff:10.0.0.5", "kitchen")]).expect("valid registry");
        assert_eq!(
            registry.lookup(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5))),
            Some("kitchen")
        );
    }

    #[test]
    fn test_lookup_ipv6() {
        let registry = DeviceRegistry::new([("fe80::1", "garage")]).expect("valid registry");
        assert_eq!(
            registry.lookup(IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1))),
            Some("garage")
        );
    }

    #[test]
    fn test_canonical_ip() {
        assert_eq!(
            canonical_ip(IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3))),
            "10.1.2.3"
        );
        assert_eq!(
            canonical_ip(IpAddr::V6(Ipv4Addr::new(10, 1, 2, 3).to_ipv6_mapped())),
            "10.1.2.3"
        );
        assert_eq!(canonical_ip(IpAddr::V6(Ipv6Addr::LOCALHOST)), "::1");
    }

    #[test]
    fn test_rejects_empty_registry() {
        let entries: Vec<(String, String)> = Vec::new();
        assert!(DeviceRegistry::new(entries).is_err());
    }

    #[test]
    fn test_rejects_empty_entries() {
        assert!(DeviceRegistry::new([("", "porch")]).is_err());
        assert!(DeviceRegistry::new([("10.0.0.1", "  ")]).is_err());
    }
}
