use std::net::IpAddr;
use std::str::FromStr;

use serde_json::{Map, Value};

use crate::{Error, Result};

pub mod polling;
pub mod quantity;
pub mod version;

/// Returns the entries which begin with the given prefix
pub fn filter_entries_by_prefix<'a>(prefix: &str, entries: &'a [String]) -> Vec<&'a str> {
    entries
        .iter()
        .map(String::as_str)
        .filter(|entry| entry.starts_with(prefix))
        .collect()
}

/// Returns `values` extended by an `enabled` key; when disabled only `enabled: false` remains.
pub fn generate_addon_config(values: Map<String, Value>, enabled: bool) -> Map<String, Value> {
    let mut config = Map::new();
    if enabled {
        config.extend(values);
    }
    config.insert("enabled".into(), Value::Bool(enabled));
    config
}

/// An IP network in CIDR notation, e.g. `100.64.0.0/11`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IpNet {
    addr: IpAddr,
    prefix_len: u8,
}

impl IpNet {
    pub fn new(addr: IpAddr, prefix_len: u8) -> Result<Self> {
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix_len > max {
            return Err(Error::InvalidOffsetIp(format!(
                "prefix length {prefix_len} exceeds {max}"
            )));
        }
        Ok(Self { addr, prefix_len })
    }

    fn bits(&self) -> u32 {
        match self.addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        }
    }

    /// Host bits of the network, all set
    fn host_mask(&self) -> u128 {
        let host_bits = self.bits() - u32::from(self.prefix_len);
        if host_bits == 0 {
            0
        } else {
            u128::MAX >> (128 - host_bits)
        }
    }

    fn network(&self) -> u128 {
        to_u128(self.addr) & !self.host_mask()
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.addr.is_ipv4() == ip.is_ipv4() && to_u128(ip) & !self.host_mask() == self.network()
    }
}

impl FromStr for IpNet {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, prefix_len) = s
            .split_once('/')
            .ok_or_else(|| Error::InvalidOffsetIp(format!("{s:?} is not in CIDR notation")))?;
        let addr = addr
            .parse::<IpAddr>()
            .map_err(|e| Error::InvalidOffsetIp(format!("{s:?}: {e}")))?;
        let prefix_len = prefix_len
            .parse::<u8>()
            .map_err(|e| Error::InvalidOffsetIp(format!("{s:?}: {e}")))?;
        IpNet::new(addr, prefix_len)
    }
}

impl std::fmt::Display for IpNet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

fn to_u128(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u128::from(u32::from(v4)),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

/// Offsets the address of `subnet` by `offset`, e.g. `100.64.0.0/11` + 10 = `100.64.0.10`.
/// Fails when the result leaves the subnet or is the IPv4 broadcast address.
pub fn compute_offset_ip(subnet: &IpNet, offset: u64) -> Result<IpAddr> {
    let too_small = || {
        Error::InvalidOffsetIp(format!(
            "cannot compute IP with offset {offset} - subnet {subnet} too small"
        ))
    };

    let value = subnet
        .network()
        .checked_add(u128::from(offset))
        .ok_or_else(too_small)?;

    let ip = match subnet.addr {
        IpAddr::V4(_) => {
            let v4 = u32::try_from(value).map_err(|_| too_small())?;
            IpAddr::V4(v4.into())
        }
        IpAddr::V6(_) => IpAddr::V6(value.into()),
    };

    if !subnet.contains(ip) {
        return Err(too_small());
    }

    // there is no broadcast address on IPv6
    if ip.is_ipv4() && value & subnet.host_mask() == subnet.host_mask() {
        return Err(Error::InvalidOffsetIp(format!(
            "computed IPv4 address {ip} is broadcast for subnet {subnet}"
        )));
    }

    Ok(ip)
}
