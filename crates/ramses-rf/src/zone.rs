//! Heating zones

use chrono::NaiveDateTime;
use serde::Serialize;
use std::collections::BTreeSet;

use ramses_tx::codec::{Schedule, ZoneMode, ZoneParams};
use ramses_tx::{Address, HexByte};

use crate::schema::{Stamped, Sticky, ZoneSchema, ZoneType};

/// A zone of a heating system, keyed by (controller, zone index)
#[derive(Debug, Clone, PartialEq)]
pub struct Zone {
    ctl: Address,
    idx: u8,
    pub(crate) name: Sticky<String>,
    pub(crate) zone_type: Sticky<ZoneType>,
    devices: BTreeSet<Address>,
    pub(crate) setpoint: Stamped<Option<f64>>,
    pub(crate) temperature: Stamped<Option<f64>>,
    pub(crate) heat_demand: Stamped<Option<f64>>,
    pub(crate) mode: Stamped<ZoneMode>,
    pub(crate) params: Stamped<ZoneParams>,
    schedule: Option<Schedule>,
}

impl Zone {
    pub fn new(ctl: Address, idx: u8) -> Self {
        Self {
            ctl,
            idx,
            name: Sticky::default(),
            zone_type: Sticky::default(),
            devices: BTreeSet::new(),
            setpoint: Stamped::default(),
            temperature: Stamped::default(),
            heat_demand: Stamped::default(),
            mode: Stamped::default(),
            params: Stamped::default(),
            schedule: None,
        }
    }

    /// A zone seeded from a snapshot
    pub fn from_schema(ctl: Address, schema: &ZoneSchema) -> Self {
        let mut zone = Self::new(ctl, schema.zone_idx.value());
        zone.name = Sticky::seeded(schema.name.clone());
        zone.zone_type = Sticky::seeded(schema.zone_type);
        zone.devices = schema.devices.iter().copied().collect();
        zone
    }

    pub fn ctl(&self) -> Address {
        self.ctl
    }

    pub fn idx(&self) -> u8 {
        self.idx
    }

    pub fn name(&self) -> Option<&str> {
        self.name.get().map(String::as_str)
    }

    pub fn zone_type(&self) -> Option<ZoneType> {
        self.zone_type.get().copied()
    }

    /// Member devices (lookups into the graph)
    pub fn devices(&self) -> impl Iterator<Item = Address> + '_ {
        self.devices.iter().copied()
    }

    pub fn setpoint(&self) -> Option<f64> {
        self.setpoint.get().copied().flatten()
    }

    pub fn temperature(&self) -> Option<f64> {
        self.temperature.get().copied().flatten()
    }

    pub fn heat_demand(&self) -> Option<f64> {
        self.heat_demand.get().copied().flatten()
    }

    pub fn mode(&self) -> Option<&ZoneMode> {
        self.mode.get()
    }

    pub fn params(&self) -> Option<&ZoneParams> {
        self.params.get()
    }

    /// Last schedule read from or written to the controller
    pub fn schedule(&self) -> Option<&Schedule> {
        self.schedule.as_ref()
    }

    pub(crate) fn set_schedule(&mut self, schedule: Schedule) {
        self.schedule = Some(schedule);
    }

    /// Add a member device; returns true if it is new
    pub(crate) fn add_device(&mut self, device: Address) -> bool {
        self.devices.insert(device)
    }

    pub fn to_schema(&self) -> ZoneSchema {
        ZoneSchema {
            zone_idx: HexByte(self.idx),
            name: self.name.get().cloned(),
            zone_type: self.zone_type(),
            devices: self.devices.iter().copied().collect(),
        }
    }

    /// State as JSON
    pub fn state_json(&self) -> serde_json::Value {
        #[derive(Serialize)]
        struct State<'a> {
            zone_idx: HexByte,
            name: Option<&'a str>,
            setpoint: &'a Stamped<Option<f64>>,
            temperature: &'a Stamped<Option<f64>>,
            heat_demand: &'a Stamped<Option<f64>>,
            mode: &'a Stamped<ZoneMode>,
            #[serde(skip_serializing_if = "Option::is_none")]
            schedule: Option<&'a Schedule>,
            updated: Option<NaiveDateTime>,
        }
        let updated = [
            self.setpoint.updated(),
            self.temperature.updated(),
            self.heat_demand.updated(),
            self.mode.updated(),
        ]
        .into_iter()
        .flatten()
        .max();
        serde_json::to_value(State {
            zone_idx: HexByte(self.idx),
            name: self.name(),
            setpoint: &self.setpoint,
            temperature: &self.temperature,
            heat_demand: &self.heat_demand,
            mode: &self.mode,
            schedule: self.schedule.as_ref(),
            updated,
        })
        .unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_zone_schema_round_trip() {
        let ctl: Address = "01:145038".parse().unwrap();
        let at = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap();
        let mut zone = Zone::new(ctl, 3);
        zone.name.observe("Study".to_string(), at, 2);
        zone.zone_type.observe(ZoneType::Underfloor, at, 2);
        zone.add_device("02:001107".parse().unwrap());
        zone.setpoint.update(Some(20.5), at);

        let seeded = Zone::from_schema(ctl, &zone.to_schema());
        assert_eq!(seeded.name(), Some("Study"));
        assert_eq!(seeded.zone_type(), Some(ZoneType::Underfloor));
        assert_eq!(seeded.devices().count(), 1);
        assert_eq!(seeded.setpoint(), None);
        assert_eq!(zone.state_json()["setpoint"]["value"], 20.5);
    }
}
