//! Device addresses
//!
//! A RAMSES-II device id is a 6-bit device type and an 18-bit serial number,
//! written `TT:NNNNNN` on the wire and packed into 3 bytes inside payloads.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::FramingError;

/// Wire form of an empty address slot
pub const NULL_ADDR: &str = "--:------";

/// A device id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    dev_type: u8,
    number: u32,
}

impl Address {
    /// Broadcast address `63:262142` (hex `FFFFFE`)
    pub const ALL_DEVICES: Address = Address {
        dev_type: 63,
        number: 262_142,
    };

    /// Placeholder id `18:000730` that gateways substitute with their own
    pub const GATEWAY: Address = Address {
        dev_type: 18,
        number: 730,
    };

    /// Create an address from its parts
    pub fn new(dev_type: u8, number: u32) -> Result<Self, FramingError> {
        if dev_type > 63 || number > 0x3_FFFF {
            return Err(FramingError::AddressMalformed(format!(
                "{dev_type:02}:{number:06}"
            )));
        }
        Ok(Self { dev_type, number })
    }

    /// Device type (the `TT` part)
    pub fn dev_type(&self) -> u8 {
        self.dev_type
    }

    /// Serial number (the `NNNNNN` part)
    pub fn number(&self) -> u32 {
        self.number
    }

    /// Device class implied by the device type
    pub fn class(&self) -> DeviceClass {
        DeviceClass::from_type(self.dev_type)
    }

    /// True for the `63:262142` broadcast address
    pub fn is_broadcast(&self) -> bool {
        *self == Self::ALL_DEVICES
    }

    /// True for ids in the `00:00000x` range used as "no device" inside payloads
    pub fn is_placeholder(&self) -> bool {
        self.dev_type == 0 && self.number < 3
    }

    /// Pack into the 3-byte payload representation
    pub fn to_hex(&self) -> [u8; 3] {
        let id = (u32::from(self.dev_type) << 18) | self.number;
        [(id >> 16) as u8, (id >> 8) as u8, id as u8]
    }

    /// Unpack from the 3-byte payload representation
    pub fn from_hex(bytes: [u8; 3]) -> Self {
        let id = (u32::from(bytes[0]) << 16) | (u32::from(bytes[1]) << 8) | u32::from(bytes[2]);
        Self {
            dev_type: ((id >> 18) & 0x3F) as u8,
            number: id & 0x3_FFFF,
        }
    }

    /// Parse one address slot; the null form yields `None`
    pub fn parse_slot(token: &str) -> Result<Option<Self>, FramingError> {
        if token == NULL_ADDR {
            return Ok(None);
        }
        token.parse().map(Some)
    }

    /// Render one address slot
    pub fn slot(addr: Option<Address>) -> String {
        addr.map_or_else(|| NULL_ADDR.to_string(), |a| a.to_string())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:06}", self.dev_type, self.number)
    }
}

impl FromStr for Address {
    type Err = FramingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || FramingError::AddressMalformed(s.to_string());
        let (dev_type, number) = s.split_once(':').ok_or_else(malformed)?;
        if dev_type.len() != 2
            || number.len() != 6
            || !dev_type.bytes().all(|b| b.is_ascii_digit())
            || !number.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(malformed());
        }
        let dev_type = dev_type.parse().map_err(|_| malformed())?;
        let number = number.parse().map_err(|_| malformed())?;
        Address::new(dev_type, number).map_err(|_| malformed())
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Broad device class, from the device type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    /// Evohome/Hometronics controller (01, 23)
    Controller,
    /// Underfloor heating controller (02)
    UfhController,
    /// Radiator valve (04)
    Trv,
    /// DHW sensor (07)
    DhwSensor,
    /// OpenTherm bridge (10)
    OpenThermBridge,
    /// Room thermostat (03, 12, 22, 34)
    Thermostat,
    /// Relay box (13)
    Relay,
    /// USB gateway (18)
    Gateway,
    /// RF gateway (30)
    RfGateway,
    /// Ventilation/HVAC device (20, 29, 32, 37)
    Hvac,
    /// Anything else
    Generic,
}

impl DeviceClass {
    /// Class for a device type
    pub fn from_type(dev_type: u8) -> Self {
        match dev_type {
            1 | 23 => DeviceClass::Controller,
            2 => DeviceClass::UfhController,
            4 => DeviceClass::Trv,
            7 => DeviceClass::DhwSensor,
            10 => DeviceClass::OpenThermBridge,
            3 | 12 | 22 | 34 => DeviceClass::Thermostat,
            13 => DeviceClass::Relay,
            18 => DeviceClass::Gateway,
            30 => DeviceClass::RfGateway,
            20 | 29 | 32 | 37 => DeviceClass::Hvac,
            _ => DeviceClass::Generic,
        }
    }

    /// Short slug as used in logs (CTL, TRV, ...)
    pub fn slug(&self) -> &'static str {
        match self {
            DeviceClass::Controller => "CTL",
            DeviceClass::UfhController => "UFC",
            DeviceClass::Trv => "TRV",
            DeviceClass::DhwSensor => "DHW",
            DeviceClass::OpenThermBridge => "OTB",
            DeviceClass::Thermostat => "THM",
            DeviceClass::Relay => "BDR",
            DeviceClass::Gateway => "HGI",
            DeviceClass::RfGateway => "RFG",
            DeviceClass::Hvac => "HVC",
            DeviceClass::Generic => "DEV",
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.slug())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let addr: Address = "01:145038".parse().unwrap();
        assert_eq!(addr.dev_type(), 1);
        assert_eq!(addr.number(), 145038);
        assert_eq!(addr.to_string(), "01:145038");
        assert_eq!(addr.class(), DeviceClass::Controller);
    }

    #[test]
    fn test_hex_packing() {
        let addr: Address = "29:123150".parse().unwrap();
        assert_eq!(addr.to_hex(), [0x75, 0xE1, 0x0E]);
        assert_eq!(Address::from_hex([0x75, 0xE1, 0x0E]), addr);

        let addr: Address = "29:099029".parse().unwrap();
        assert_eq!(addr.to_hex(), [0x75, 0x82, 0xD5]);

        assert_eq!(Address::from_hex([0xFF, 0xFF, 0xFE]), Address::ALL_DEVICES);
        assert_eq!(Address::from_hex([0x04, 0xD3, 0x9D]).to_string(), "01:054173");
    }

    #[test]
    fn test_null_slot() {
        assert_eq!(Address::parse_slot("--:------").unwrap(), None);
        assert_eq!(Address::slot(None), NULL_ADDR);
        assert!(Address::parse_slot("01:14503").is_err());
        assert!(Address::parse_slot("AB:145038").is_err());
        assert!(Address::parse_slot("64:000000").is_err());
    }

    #[test]
    fn test_serde_as_string() {
        let addr: Address = "04:189082".parse().unwrap();
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, r#""04:189082""#);
        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }

    #[test]
    fn test_classes() {
        assert_eq!(DeviceClass::from_type(4).slug(), "TRV");
        assert_eq!(DeviceClass::from_type(13), DeviceClass::Relay);
        assert_eq!(Address::GATEWAY.class(), DeviceClass::Gateway);
        assert!(Address::ALL_DEVICES.is_broadcast());
    }
}
