//! Heating systems: a controller and its zones

use chrono::NaiveDateTime;
use serde::Serialize;
use std::collections::BTreeMap;

use ramses_tx::codec::FaultEntry;
use ramses_tx::{Address, HexByte};

use crate::schema::{Stamped, SystemSchema};
use crate::zone::Zone;

/// A controller and the zones it owns
#[derive(Debug, Clone, PartialEq)]
pub struct System {
    ctl: Address,
    zones: BTreeMap<u8, Zone>,
    pub(crate) datetime: Stamped<Option<NaiveDateTime>>,
    pub(crate) schedule_version: Stamped<Option<u16>>,
    relay_demand: BTreeMap<HexByte, Stamped<Option<f64>>>,
    fault_log: BTreeMap<u8, Stamped<Option<FaultEntry>>>,
}

impl System {
    pub fn new(ctl: Address) -> Self {
        Self {
            ctl,
            zones: BTreeMap::new(),
            datetime: Stamped::default(),
            schedule_version: Stamped::default(),
            relay_demand: BTreeMap::new(),
            fault_log: BTreeMap::new(),
        }
    }

    pub fn from_schema(schema: &SystemSchema) -> Self {
        let mut system = Self::new(schema.ctl);
        for zone in &schema.zones {
            system
                .zones
                .insert(zone.zone_idx.value(), Zone::from_schema(schema.ctl, zone));
        }
        system
    }

    pub fn ctl(&self) -> Address {
        self.ctl
    }

    pub fn zone(&self, idx: u8) -> Option<&Zone> {
        self.zones.get(&idx)
    }

    pub fn zones(&self) -> impl Iterator<Item = &Zone> {
        self.zones.values()
    }

    /// Zone by index, created on first reference
    pub(crate) fn zone_mut(&mut self, idx: u8) -> &mut Zone {
        let ctl = self.ctl;
        self.zones
            .entry(idx)
            .or_insert_with(|| Zone::new(ctl, idx))
    }

    pub(crate) fn has_zone(&self, idx: u8) -> bool {
        self.zones.contains_key(&idx)
    }

    /// Controller clock as last reported
    pub fn datetime(&self) -> Option<NaiveDateTime> {
        self.datetime.get().copied().flatten()
    }

    /// Schedule change counter
    pub fn schedule_version(&self) -> Option<u16> {
        self.schedule_version.get().copied().flatten()
    }

    pub fn relay_demand(&self, domain_id: HexByte) -> Option<f64> {
        self.relay_demand
            .get(&domain_id)
            .and_then(|demand| demand.get().copied().flatten())
    }

    pub(crate) fn update_relay_demand(&mut self, domain_id: HexByte, demand: Option<f64>, dtm: NaiveDateTime) -> bool {
        self.relay_demand.entry(domain_id).or_default().update(demand, dtm)
    }

    /// Fault log entries read so far, newest first; `None` marks the end of the log
    pub fn fault_log(&self) -> impl Iterator<Item = (u8, Option<&FaultEntry>)> {
        self.fault_log
            .iter()
            .map(|(idx, entry)| (*idx, entry.get().and_then(Option::as_ref)))
    }

    pub(crate) fn update_fault(&mut self, log_idx: u8, entry: Option<FaultEntry>, dtm: NaiveDateTime) -> bool {
        self.fault_log.entry(log_idx).or_default().update(entry, dtm)
    }

    pub fn to_schema(&self) -> SystemSchema {
        SystemSchema {
            ctl: self.ctl,
            zones: self.zones.values().map(Zone::to_schema).collect(),
        }
    }

    /// State as JSON, zones included
    pub fn state_json(&self) -> serde_json::Value {
        #[derive(Serialize)]
        struct State<'a> {
            ctl: Address,
            datetime: &'a Stamped<Option<NaiveDateTime>>,
            schedule_version: &'a Stamped<Option<u16>>,
            relay_demand: &'a BTreeMap<HexByte, Stamped<Option<f64>>>,
            zones: Vec<serde_json::Value>,
        }
        serde_json::to_value(State {
            ctl: self.ctl,
            datetime: &self.datetime,
            schedule_version: &self.schedule_version,
            relay_demand: &self.relay_demand,
            zones: self.zones.values().map(Zone::state_json).collect(),
        })
        .unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(secs: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(8, 0, secs)
            .unwrap()
    }

    #[test]
    fn test_zones_created_on_reference() {
        let mut system = System::new("01:145038".parse().unwrap());
        assert!(!system.has_zone(2));
        system.zone_mut(2).setpoint.update(Some(21.0), at(0));
        assert!(system.has_zone(2));
        assert_eq!(system.zone(2).and_then(Zone::setpoint), Some(21.0));
        assert_eq!(system.zones().count(), 1);
    }

    #[test]
    fn test_relay_demand_per_domain() {
        let mut system = System::new("01:145038".parse().unwrap());
        assert!(system.update_relay_demand(HexByte(0xFC), Some(0.5), at(1)));
        assert!(!system.update_relay_demand(HexByte(0xFC), Some(0.0), at(0)));
        assert_eq!(system.relay_demand(HexByte(0xFC)), Some(0.5));
        assert_eq!(system.relay_demand(HexByte(0xF9)), None);
        assert_eq!(system.state_json()["relay_demand"]["FC"]["value"], 0.5);
    }
}
