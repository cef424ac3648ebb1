//! Reconciliation primitives and the schema snapshot
//!
//! Schema values (zone names and types, topology) are [`Sticky`]: adopted on
//! first sight, then changed only when enough independent exchanges agree on
//! the new value. State values (temperatures, setpoints, modes) are
//! [`Stamped`]: the packet with the latest timestamp wins.
//!
//! An exchange is identified by the timestamp of the packet that carried it,
//! so the same message applied twice counts once.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use ramses_tx::codec::{BindTuple, DeviceInfo};
use ramses_tx::{Address, DeviceClass, HexByte};

/// Outcome of observing a schema value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// First value seen
    Adopted,
    /// Agrees with the current value
    Confirmed,
    /// Contradicts the current value; `evidence` exchanges so far
    Contested { evidence: usize },
    /// The contradiction was corroborated and the value changed
    Changed,
}

impl Observation {
    /// True when the stored value changed
    pub fn is_change(self) -> bool {
        matches!(self, Observation::Adopted | Observation::Changed)
    }
}

/// A write-once-then-confirm value
#[derive(Debug, Clone, PartialEq)]
pub struct Sticky<T> {
    value: Option<T>,
    candidate: Option<(T, BTreeSet<NaiveDateTime>)>,
}

impl<T> Default for Sticky<T> {
    fn default() -> Self {
        Self {
            value: None,
            candidate: None,
        }
    }
}

impl<T: Clone + PartialEq + fmt::Debug> Sticky<T> {
    /// A value seeded from a snapshot
    pub fn seeded(value: Option<T>) -> Self {
        Self {
            value,
            candidate: None,
        }
    }

    pub fn get(&self) -> Option<&T> {
        self.value.as_ref()
    }

    /// Record an observation made in the exchange stamped `exchange`
    ///
    /// A contradicting value replaces the current one once `corroboration`
    /// distinct exchanges have reported it.
    pub fn observe(&mut self, value: T, exchange: NaiveDateTime, corroboration: u8) -> Observation {
        let Some(current) = &self.value else {
            self.value = Some(value);
            return Observation::Adopted;
        };
        if *current == value {
            self.candidate = None;
            return Observation::Confirmed;
        }

        let evidence = match &mut self.candidate {
            Some((candidate, seen)) if *candidate == value => {
                seen.insert(exchange);
                seen.len()
            }
            _ => {
                self.candidate = Some((value.clone(), BTreeSet::from([exchange])));
                1
            }
        };
        if evidence >= usize::from(corroboration.max(1)) {
            tracing::debug!(from = ?current, to = ?value, evidence, "Schema value changed");
            self.value = Some(value);
            self.candidate = None;
            return Observation::Changed;
        }
        Observation::Contested { evidence }
    }
}

impl<T: Serialize> Serialize for Sticky<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.value.serialize(serializer)
    }
}

/// A last-write-wins value, stamped with the packet time that set it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Stamped<T> {
    value: Option<T>,
    updated: Option<NaiveDateTime>,
}

impl<T> Default for Stamped<T> {
    fn default() -> Self {
        Self {
            value: None,
            updated: None,
        }
    }
}

impl<T: PartialEq> Stamped<T> {
    pub fn get(&self) -> Option<&T> {
        self.value.as_ref()
    }

    /// Time of the packet that set the value
    pub fn updated(&self) -> Option<NaiveDateTime> {
        self.updated
    }

    /// Apply a value from a packet stamped `dtm`; returns true if it changed
    ///
    /// Older packets are ignored. Equal timestamps apply in arrival order.
    pub fn update(&mut self, value: T, dtm: NaiveDateTime) -> bool {
        if self.updated.is_some_and(|updated| dtm < updated) {
            return false;
        }
        self.updated = Some(dtm);
        if self.value.as_ref() == Some(&value) {
            return false;
        }
        self.value = Some(value);
        true
    }
}

/// Heating zone type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneType {
    /// Radiators with TRVs
    Radiator,
    /// Zone valve driven by a relay
    ZoneValve,
    /// Underfloor heating
    Underfloor,
    /// Electric heat
    Electric,
    /// Mixing valve
    Mixing,
}

impl ZoneType {
    /// Zone type of a `0005` zone-type code
    pub fn from_system_zones(zone_type: u8) -> Option<Self> {
        match zone_type {
            0x08 => Some(ZoneType::Radiator),
            0x09 => Some(ZoneType::Underfloor),
            0x0A => Some(ZoneType::ZoneValve),
            0x0B => Some(ZoneType::Mixing),
            0x11 => Some(ZoneType::Electric),
            _ => None,
        }
    }

    /// Zone types probed with `0005`
    pub const PROBED: [u8; 5] = [0x08, 0x09, 0x0A, 0x0B, 0x11];
}

impl fmt::Display for ZoneType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ZoneType::Radiator => write!(f, "radiator_valve"),
            ZoneType::ZoneValve => write!(f, "zone_valve"),
            ZoneType::Underfloor => write!(f, "underfloor_heating"),
            ZoneType::Electric => write!(f, "electric_heat"),
            ZoneType::Mixing => write!(f, "mixing_valve"),
        }
    }
}

/// Persisted topology: devices, zones, systems and bindings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    #[serde(default)]
    pub devices: Vec<DeviceSchema>,
    #[serde(default)]
    pub systems: Vec<SystemSchema>,
    #[serde(default)]
    pub bindings: Vec<BindingRecord>,
}

impl SchemaSnapshot {
    /// Load a snapshot from a JSON file
    pub fn load(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Save the snapshot as pretty JSON
    pub fn save(&self, path: impl AsRef<std::path::Path>) -> crate::Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }
}

/// Schema of one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSchema {
    pub id: Address,
    pub class: DeviceClass,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone_idx: Option<HexByte>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_info: Option<DeviceInfo>,
}

/// Schema of one system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemSchema {
    pub ctl: Address,
    #[serde(default)]
    pub zones: Vec<ZoneSchema>,
}

/// Schema of one zone
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneSchema {
    pub zone_idx: HexByte,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone_type: Option<ZoneType>,
    #[serde(default)]
    pub devices: Vec<Address>,
}

/// A completed binding between two devices
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingRecord {
    pub supplicant: Address,
    pub respondent: Address,
    /// Tuples offered by the supplicant
    pub offered: Vec<BindTuple>,
    /// Tuples accepted by the respondent
    pub accepted: Vec<BindTuple>,
}
