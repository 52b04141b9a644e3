//! MAC address handling
//!
//! Client identity on the L2 segment is keyed by MAC address. All MACs
//! entering the engine are normalized to lowercase colon-hex so that map
//! keys, rule text, and audit records agree on one spelling.

use crate::error::EngineError;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// A 48-bit hardware address, normalized lowercase colon-hex
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Locally administered bit set (first octet bit 1)
    pub fn is_locally_administered(&self) -> bool {
        self.0[0] & 0x02 != 0
    }

    pub fn is_broadcast(&self) -> bool {
        self.0 == [0xff; 6]
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = if s.contains(':') {
            s.split(':').collect()
        } else if s.contains('-') {
            s.split('-').collect()
        } else {
            return Err(EngineError::InvalidInput(format!("malformed MAC: {s}")));
        };

        if parts.len() != 6 {
            return Err(EngineError::InvalidInput(format!("malformed MAC: {s}")));
        }

        let mut octets = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            if part.len() != 2 {
                return Err(EngineError::InvalidInput(format!("malformed MAC: {s}")));
            }
            octets[i] = u8::from_str_radix(part, 16)
                .map_err(|_| EngineError::InvalidInput(format!("malformed MAC: {s}")))?;
        }

        Ok(MacAddr(octets))
    }
}

impl Serialize for MacAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Parse a dotted IPv4 address, mapping failures into the engine taxonomy
pub fn parse_ipv4(s: &str) -> Result<Ipv4Addr, EngineError> {
    s.parse()
        .map_err(|_| EngineError::InvalidInput(format!("malformed IPv4 address: {s}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_colon_hex() {
        let mac: MacAddr = "aa:bb:cc:dd:ee:01".parse().unwrap();
        assert_eq!(
            mac.octets(),
            [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01]
        );
    }

    #[test]
    fn test_normalizes_case_and_separator() {
        let upper: MacAddr = "AA:BB:CC:DD:EE:01".parse().unwrap();
        let hyphen: MacAddr = "aa-bb-cc-dd-ee-01".parse().unwrap();
        assert_eq!(upper, hyphen);
        assert_eq!(upper.to_string(), "aa:bb:cc:dd:ee:01");
    }

    #[test]
    fn test_rejects_malformed() {
        assert!("aa:bb:cc:dd:ee".parse::<MacAddr>().is_err());
        assert!("aa:bb:cc:dd:ee:zz".parse::<MacAddr>().is_err());
        assert!("aabbccddee01".parse::<MacAddr>().is_err());
        assert!("aa:bb:cc:dd:ee:011".parse::<MacAddr>().is_err());
    }

    #[test]
    fn test_serde_round_trip() {
        let mac: MacAddr = "aa:bb:cc:dd:ee:01".parse().unwrap();
        let json = serde_json::to_string(&mac).unwrap();
        assert_eq!(json, "\"aa:bb:cc:dd:ee:01\"");

        let back: MacAddr = serde_json::from_str(&json).unwrap();
        assert_eq!(back, mac);
    }

    #[test]
    fn test_parse_ipv4_errors() {
        assert!(parse_ipv4("192.168.4.10").is_ok());
        assert!(parse_ipv4("192.168.4").is_err());
        assert!(parse_ipv4("not-an-ip").is_err());
    }
}
