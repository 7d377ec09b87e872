//! CIDR expansion: turn a subnet into one uniformly-random host address.
//! Draws use the OS random source; v4 excludes network and broadcast.

use ipnet::IpNet;
use rand::rngs::OsRng;
use rand::RngCore;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::ScanError;
use crate::model::IpFamily;

/// Parse a CIDR string and check it against the expected family.
pub fn parse(subnet: &str, family: IpFamily) -> Result<IpNet, ScanError> {
    let net: IpNet = subnet
        .parse()
        .map_err(|e| ScanError::Validation(format!("invalid subnet {subnet}: {e}")))?;
    match (net, family) {
        (IpNet::V4(_), IpFamily::V4) | (IpNet::V6(_), IpFamily::V6) => Ok(net),
        _ => Err(ScanError::Validation(format!(
            "subnet {subnet} does not match family {family}"
        ))),
    }
}

/// Usable host count. v4 loses network and broadcast once there is more than
/// one host bit; v6 is clamped at 2^32 to keep the number meaningful.
pub fn capacity(net: &IpNet) -> u64 {
    match net {
        IpNet::V4(n) => {
            let host_bits = 32 - n.prefix_len() as u32;
            if host_bits <= 1 {
                1
            } else {
                (1u64 << host_bits) - 2
            }
        }
        IpNet::V6(n) => {
            let host_bits = 128 - n.prefix_len() as u32;
            if host_bits == 0 {
                1
            } else if host_bits > 32 {
                1u64 << 32
            } else {
                1u64 << host_bits
            }
        }
    }
}

/// Draw one random host address from the subnet.
pub fn draw(net: &IpNet) -> Result<IpAddr, ScanError> {
    match net {
        IpNet::V4(n) => {
            let host_bits = 32 - n.prefix_len() as u32;
            if host_bits <= 1 {
                // Single-host subnet: the network address is the only draw.
                return Ok(IpAddr::V4(n.network()));
            }
            let span = (1u64 << host_bits) - 2;
            let offset = 1 + secure_below(span)?;
            let base = u32::from(n.network());
            Ok(IpAddr::V4(Ipv4Addr::from(base + offset as u32)))
        }
        IpNet::V6(n) => {
            let host_bits = 128 - n.prefix_len() as u32;
            if host_bits == 0 {
                return Ok(IpAddr::V6(n.network()));
            }
            let mut octets = n.network().octets();
            // Randomise at most the trailing 8 bytes of the host portion,
            // keeping the prefix bits of the boundary byte.
            let host_bytes = (host_bits as usize).div_ceil(8).min(8);
            let mut random = [0u8; 8];
            fill_secure(&mut random[..host_bytes])?;
            for (j, octet) in octets.iter_mut().rev().take(host_bytes).enumerate() {
                let bits_here = host_bits.saturating_sub(j as u32 * 8).min(8);
                let mask: u8 = if bits_here >= 8 {
                    0xFF
                } else {
                    (1u8 << bits_here) - 1
                };
                *octet = (*octet & !mask) | (random[j] & mask);
            }
            Ok(IpAddr::V6(Ipv6Addr::from(octets)))
        }
    }
}

/// Fill from the OS random source, retrying the byte fill once.
fn fill_secure(buf: &mut [u8]) -> Result<(), ScanError> {
    if OsRng.try_fill_bytes(buf).is_ok() {
        return Ok(());
    }
    OsRng
        .try_fill_bytes(buf)
        .map_err(|e| ScanError::System(format!("random source failed: {e}")))
}

/// Unbiased draw from `[0, max)` by rejection sampling over a power-of-two mask.
fn secure_below(max: u64) -> Result<u64, ScanError> {
    debug_assert!(max > 0);
    let mask = max.next_power_of_two().wrapping_sub(1).max(1);
    loop {
        let mut buf = [0u8; 8];
        fill_secure(&mut buf)?;
        let v = u64::from_le_bytes(buf) & mask;
        if v < max {
            return Ok(v);
        }
    }
}
