/*
 * Copyright (C) 2024 The Nanocloud Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */


//! Address arithmetic over IPv4 CIDR blocks.

use crate::ovnstack::error::OverlayError;
use rand::RngCore;
use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// An address together with its prefix length. The address may carry host
/// bits (`172.16.0.5/24` names a host on `172.16.0.0/24`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cidr {
    pub address: Ipv4Addr,
    pub prefix: u8,
}

impl Cidr {
    /// Parses `a.b.c.d/N`. The escaped `a.b.c.d\N` form written into router
    /// ports is accepted too, so values read back from the database parse.
    pub fn parse(token: &str) -> Result<Self, OverlayError> {
        let token = token.trim();
        let (address, prefix) = token
            .split_once('/')
            .or_else(|| token.split_once('\\'))
            .ok_or_else(|| OverlayError::config(format!("invalid CIDR '{token}'")))?;
        let address = address
            .parse::<Ipv4Addr>()
            .map_err(|e| OverlayError::config(format!("invalid address in CIDR '{token}': {e}")))?;
        let prefix = prefix
            .parse::<u8>()
            .map_err(|e| OverlayError::config(format!("invalid prefix in CIDR '{token}': {e}")))?;
        if prefix > 32 {
            return Err(OverlayError::config(format!(
                "prefix length must be within 0-32: {token}"
            )));
        }
        Ok(Cidr { address, prefix })
    }

    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.address) & prefix_to_mask(self.prefix))
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network()) | !prefix_to_mask(self.prefix))
    }

    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr::from(prefix_to_mask(self.prefix))
    }

    /// First usable host: the address after the network address.
    pub fn first_host(&self) -> Ipv4Addr {
        next_ipv4(self.network())
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let mask = prefix_to_mask(self.prefix);
        u32::from(ip) & mask == u32::from(self.network())
    }

    /// Same prefix, different address.
    pub fn with_address(&self, address: Ipv4Addr) -> Cidr {
        Cidr {
            address,
            prefix: self.prefix,
        }
    }

    /// Network form, `10.1.1.0/24` for `10.1.1.7/24`.
    pub fn network_cidr(&self) -> Cidr {
        self.with_address(self.network())
    }

    /// The literal token the logical-network database expects for router
    /// port networks: address, backslash, prefix length.
    pub fn escaped(&self) -> String {
        escaped_cidr(self.address, self.prefix)
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix)
    }
}

pub fn escaped_cidr(address: impl fmt::Display, prefix: u8) -> String {
    format!("{address}\\{prefix}")
}

/// The address immediately after `ip` in its family, wrapping at the top.
pub fn next_address(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(v4) => IpAddr::V4(next_ipv4(v4)),
        IpAddr::V6(v6) => IpAddr::V6(Ipv6Addr::from(u128::from(v6).wrapping_add(1))),
    }
}

pub fn next_ipv4(ip: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip).wrapping_add(1))
}

/// Scans `pool` from its first usable host and returns the first address
/// whose string form is absent from `in_use`. The broadcast address is never
/// handed out.
pub fn first_unused(pool: &Cidr, in_use: &HashSet<String>) -> Result<Ipv4Addr, OverlayError> {
    let last = u32::from(pool.broadcast());
    let mut candidate = u32::from(pool.first_host());
    while candidate < last {
        let ip = Ipv4Addr::from(candidate);
        if !in_use.contains(&ip.to_string()) {
            return Ok(ip);
        }
        candidate += 1;
    }
    Err(OverlayError::PoolExhausted {
        pool: pool.network_cidr().to_string(),
    })
}

/// Strips quotes and any prefix suffix from a database value, leaving the
/// bare address text used in in-use sets.
pub fn bare_address(token: &str) -> String {
    let trimmed = token.trim().trim_matches(|c| c == '"' || c == '\'');
    trimmed
        .split(['/', '\\'])
        .next()
        .unwrap_or(trimmed)
        .to_string()
}

/// Random locally administered unicast MAC address.
pub fn generate_mac() -> String {
    let mut bytes = [0u8; 6];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes[0] = (bytes[0] & 0xfe) | 0x02;
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

fn prefix_to_mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        (!0u32) << (32 - prefix)
    }
}
