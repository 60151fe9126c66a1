// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Network interface discovery and optional NIC tuning.
//!
//! Nothing here is on the hot path: the adapter is consulted at startup for
//! the interface addresses and MAC, and can fire a couple of out-of-band
//! ethtool commands to trade NIC-side batching for latency.

use log::*;

use std::fmt;
use std::fs;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::process::Command;

use crate::Error;

/// A hardware address, printed as `aa:bb:cc:dd:ee:ff`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MacAddress(pub [u8; 6]);

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let m = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

pub struct NetworkAdapter {
    interface: String,
    tune: bool,
    ip4: Option<Ipv4Addr>,
    ip6: Option<Ipv6Addr>,
}

impl NetworkAdapter {
    pub fn new(interface: &str, tune: bool) -> NetworkAdapter {
        NetworkAdapter {
            interface: interface.to_string(),
            tune,
            ip4: None,
            ip6: None,
        }
    }

    /// Looks up the interface addresses and, unless disabled, tunes the NIC.
    pub fn init(&mut self) -> Result<(), Error> {
        self.retrieve_interface_ip()?;
        if self.tune {
            self.tune_nic();
        }
        Ok(())
    }

    pub fn interface_name(&self) -> &str {
        &self.interface
    }

    pub fn interface_ip4(&self) -> Option<Ipv4Addr> {
        self.ip4
    }

    pub fn interface_ip6(&self) -> Option<Ipv6Addr> {
        self.ip6
    }

    /// Reads the interface's hardware address from sysfs.
    pub fn mac_address(&self) -> Option<MacAddress> {
        let path = format!("/sys/class/net/{}/address", self.interface);
        let text = fs::read_to_string(&path).ok()?;
        let mut mac = [0u8; 6];
        let mut parts = text.trim().split(':');
        for byte in mac.iter_mut() {
            *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
        }
        Some(MacAddress(mac))
    }

    fn retrieve_interface_ip(&mut self) -> Result<(), Error> {
        for ifaddr in nix::ifaddrs::getifaddrs()? {
            if ifaddr.interface_name != self.interface {
                continue;
            }
            let Some(address) = ifaddr.address else {
                continue;
            };
            if let Some(sin) = address.as_sockaddr_in() {
                let ip = sin.ip();
                info!("interface IP4 set to {ip}");
                self.ip4 = Some(ip);
            } else if let Some(sin6) = address.as_sockaddr_in6() {
                let ip = sin6.ip();
                info!("interface IP6 set to {ip}");
                self.ip6 = Some(ip);
            }
        }

        if self.ip4.is_none() && self.ip6.is_none() {
            warn!("no address found for interface {}", self.interface);
        }
        Ok(())
    }

    /// Turns off interrupt coalescing on the NIC. Failures are logged and
    /// ignored: the driver works on an untuned NIC, just with more latency
    /// jitter.
    fn tune_nic(&self) {
        let commands: [&[&str]; 2] = [
            &["ethtool", "-C", &self.interface, "adaptive-rx", "off"],
            &["ethtool", "-C", &self.interface, "rx-usecs", "0"],
        ];
        for command in commands {
            debug!("tuning NIC: {}", command.join(" "));
            match Command::new(command[0]).args(&command[1..]).status() {
                Ok(status) if status.success() => {}
                Ok(status) => warn!("'{}' exited with {status}", command.join(" ")),
                Err(e) => warn!("could not run '{}': {e}", command.join(" ")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_address_formatting() {
        let mac = MacAddress([0xaa, 0xbb, 0x0c, 0x1d, 0x2e, 0x3f]);
        assert_eq!(mac.to_string(), "aa:bb:0c:1d:2e:3f");
    }

    #[test]
    fn loopback_has_an_address() {
        let mut adapter = NetworkAdapter::new("lo", false);
        adapter.init().unwrap();
        assert_eq!(adapter.interface_ip4(), Some(Ipv4Addr::LOCALHOST));
    }
}
