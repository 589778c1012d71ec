//! Text parsers for resource specifications
//!
//! - CPU and node lists: `"4-7,10,12-13"`
//! - Sizes: `"2GB"`, `"512M"`, `"4096"` (binary units)
//! - Addresses: `"0x80000000"` or decimal
//! - Device references: `"eth0_vf1"`, `"nvme0_ns2"`, `"gpu0"`

use std::collections::BTreeSet;
use std::str::FromStr;

use crate::error::ParseError;
use crate::types::{CpuAffinity, DeviceClaim, MemoryPolicy, SubResource};

/// Parse a comma-separated list of ids and inclusive ranges
pub fn parse_id_list(input: &str) -> Result<BTreeSet<u32>, ParseError> {
    let mut ids = BTreeSet::new();
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(ParseError::cpu_list(input, "empty list"));
    }

    for part in trimmed.split(',') {
        let part = part.trim();
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo = parse_id(input, lo)?;
                let hi = parse_id(input, hi)?;
                if lo > hi {
                    return Err(ParseError::cpu_list(
                        input,
                        format!("range {}-{} is reversed", lo, hi),
                    ));
                }
                ids.extend(lo..=hi);
            }
            None => {
                ids.insert(parse_id(input, part)?);
            }
        }
    }

    Ok(ids)
}

fn parse_id(input: &str, part: &str) -> Result<u32, ParseError> {
    part.trim()
        .parse::<u32>()
        .map_err(|_| ParseError::cpu_list(input, format!("'{}' is not a number", part.trim())))
}

/// Parse a size with an optional binary unit suffix (K, M, G, T, with or
/// without a trailing `B`, case-insensitive)
pub fn parse_size(input: &str) -> Result<u64, ParseError> {
    let s = input.trim().to_ascii_uppercase();
    let s = s.strip_suffix('B').unwrap_or(&s);

    let (digits, shift) = match s.chars().last() {
        Some('K') => (&s[..s.len() - 1], 10),
        Some('M') => (&s[..s.len() - 1], 20),
        Some('G') => (&s[..s.len() - 1], 30),
        Some('T') => (&s[..s.len() - 1], 40),
        _ => (s, 0),
    };

    let value: u64 = digits
        .trim()
        .parse()
        .map_err(|_| ParseError::Size(input.to_string()))?;
    value
        .checked_mul(1u64 << shift)
        .ok_or_else(|| ParseError::Size(input.to_string()))
}

/// Parse a hexadecimal (`0x` prefix) or decimal address
pub fn parse_address(input: &str) -> Result<u64, ParseError> {
    let s = input.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse::<u64>(),
    };
    parsed.map_err(|_| ParseError::Address(input.to_string()))
}

/// Split a trailing `<tag><digits>` off a device reference
fn split_suffix<'a>(input: &'a str, tag: &str) -> Option<(&'a str, u32)> {
    let pos = input.rfind(tag)?;
    let (device, rest) = (&input[..pos], &input[pos + tag.len()..]);
    if device.is_empty() || rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    rest.parse().ok().map(|id| (device, id))
}

impl FromStr for DeviceClaim {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.contains(char::is_whitespace) {
            return Err(ParseError::DeviceClaim(s.to_string()));
        }
        if let Some((device, id)) = split_suffix(s, "_vf") {
            return Ok(DeviceClaim {
                device: device.to_string(),
                sub: SubResource::Vf(id),
            });
        }
        if let Some((device, id)) = split_suffix(s, "_ns") {
            return Ok(DeviceClaim {
                device: device.to_string(),
                sub: SubResource::Namespace(id),
            });
        }
        Ok(DeviceClaim::whole(s))
    }
}

impl FromStr for CpuAffinity {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "compact" => Ok(CpuAffinity::Compact),
            "spread" => Ok(CpuAffinity::Spread),
            "local" => Ok(CpuAffinity::Local),
            other => Err(ParseError::unknown("CPU affinity", other)),
        }
    }
}

impl FromStr for MemoryPolicy {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "local" => Ok(MemoryPolicy::Local),
            "interleave" => Ok(MemoryPolicy::Interleave),
            "bind" => Ok(MemoryPolicy::Bind),
            other => Err(ParseError::unknown("memory policy", other)),
        }
    }
}

/// Parse a comma-separated device reference list
pub fn parse_device_list(input: &str) -> Result<BTreeSet<DeviceClaim>, ParseError> {
    input
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(DeviceClaim::from_str)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_list() {
        let ids = parse_id_list("4-7, 10,12-13").unwrap();
        assert_eq!(ids, [4, 5, 6, 7, 10, 12, 13].into_iter().collect());
        assert_eq!(parse_id_list("3").unwrap(), [3].into_iter().collect());
    }

    #[test]
    fn test_id_list_errors() {
        assert!(parse_id_list("").is_err());
        assert!(parse_id_list("7-4").is_err());
        assert!(parse_id_list("a-b").is_err());
        assert!(parse_id_list("1,,2").is_err());
    }

    #[test]
    fn test_size_units() {
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("4K").unwrap(), 4096);
        assert_eq!(parse_size("512MB").unwrap(), 512 << 20);
        assert_eq!(parse_size("2gb").unwrap(), 2 << 30);
        assert_eq!(parse_size("1T").unwrap(), 1 << 40);
        assert!(parse_size("lots").is_err());
        assert!(parse_size("99999999999T").is_err());
    }

    #[test]
    fn test_address() {
        assert_eq!(parse_address("0x80000000").unwrap(), 0x8000_0000);
        assert_eq!(parse_address("4096").unwrap(), 4096);
        assert!(parse_address("0xZZ").is_err());
    }

    #[test]
    fn test_device_claims() {
        assert_eq!(
            "eth0_vf1".parse::<DeviceClaim>().unwrap(),
            DeviceClaim::vf("eth0", 1)
        );
        assert_eq!(
            "nvme0_ns2".parse::<DeviceClaim>().unwrap(),
            DeviceClaim::namespace("nvme0", 2)
        );
        assert_eq!(
            "gpu0".parse::<DeviceClaim>().unwrap(),
            DeviceClaim::whole("gpu0")
        );
        // Underscore names without a numeric suffix are whole devices
        assert_eq!(
            "my_vfio".parse::<DeviceClaim>().unwrap(),
            DeviceClaim::whole("my_vfio")
        );
        assert_eq!(
            "my_nic_vf12".parse::<DeviceClaim>().unwrap(),
            DeviceClaim::vf("my_nic", 12)
        );
        assert!("".parse::<DeviceClaim>().is_err());
    }

    #[test]
    fn test_policy_names() {
        assert_eq!("spread".parse::<CpuAffinity>().unwrap(), CpuAffinity::Spread);
        assert_eq!(
            "bind".parse::<MemoryPolicy>().unwrap(),
            MemoryPolicy::Bind
        );
        assert!("tight".parse::<CpuAffinity>().is_err());
    }

    #[test]
    fn test_device_list() {
        let list = parse_device_list("eth0_vf1, nvme0_ns2").unwrap();
        assert_eq!(list.len(), 2);
    }
}
