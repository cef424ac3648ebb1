//! Device records

use chrono::NaiveDateTime;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use ramses_tx::codec::{BindTuple, DeviceInfo};
use ramses_tx::{Address, Code, DeviceClass, HexByte, Payload};

use crate::schema::{DeviceSchema, Observation, Stamped, Sticky};

/// A device seen on the air (or seeded from a snapshot)
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    id: Address,
    class: DeviceClass,
    first_seen: Option<NaiveDateTime>,
    last_seen: Option<NaiveDateTime>,
    codes_sent: BTreeSet<Code>,
    codes_received: BTreeSet<Code>,
    parent: Sticky<Address>,
    zone_idx: Sticky<HexByte>,
    device_info: Sticky<DeviceInfo>,
    bindings: Vec<BindTuple>,
    values: BTreeMap<Code, Stamped<Payload>>,
}

impl Device {
    /// A device first seen at `dtm`
    pub fn new(id: Address, dtm: Option<NaiveDateTime>) -> Self {
        Self {
            id,
            class: id.class(),
            first_seen: dtm,
            last_seen: dtm,
            codes_sent: BTreeSet::new(),
            codes_received: BTreeSet::new(),
            parent: Sticky::default(),
            zone_idx: Sticky::default(),
            device_info: Sticky::default(),
            bindings: Vec::new(),
            values: BTreeMap::new(),
        }
    }

    /// A device seeded from a snapshot
    pub fn from_schema(schema: &DeviceSchema) -> Self {
        let mut device = Self::new(schema.id, None);
        device.class = schema.class;
        device.parent = Sticky::seeded(schema.parent);
        device.zone_idx = Sticky::seeded(schema.zone_idx);
        device.device_info = Sticky::seeded(schema.device_info.clone());
        device
    }

    pub fn id(&self) -> Address {
        self.id
    }

    pub fn class(&self) -> DeviceClass {
        self.class
    }

    pub fn first_seen(&self) -> Option<NaiveDateTime> {
        self.first_seen
    }

    pub fn last_seen(&self) -> Option<NaiveDateTime> {
        self.last_seen
    }

    /// Codes this device has sent
    pub fn codes_sent(&self) -> &BTreeSet<Code> {
        &self.codes_sent
    }

    /// Codes addressed to this device
    pub fn codes_received(&self) -> &BTreeSet<Code> {
        &self.codes_received
    }

    /// Controller this device belongs to
    pub fn parent(&self) -> Option<Address> {
        self.parent.get().copied()
    }

    /// Zone this device belongs to
    pub fn zone_idx(&self) -> Option<HexByte> {
        self.zone_idx.get().copied()
    }

    pub fn device_info(&self) -> Option<&DeviceInfo> {
        self.device_info.get()
    }

    /// Negotiated bindings
    pub fn bindings(&self) -> impl Iterator<Item = &BindTuple> {
        self.bindings.iter()
    }

    /// Last known payload for a code
    pub fn value(&self, code: Code) -> Option<&Payload> {
        self.values.get(&code).and_then(Stamped::get)
    }

    /// Move last-seen forward; earlier times are ignored
    pub(crate) fn touch(&mut self, dtm: NaiveDateTime) {
        if self.first_seen.is_none() {
            self.first_seen = Some(dtm);
        }
        if self.last_seen.map_or(true, |seen| dtm > seen) {
            self.last_seen = Some(dtm);
        }
    }

    pub(crate) fn record_sent(&mut self, code: Code) {
        self.codes_sent.insert(code);
    }

    pub(crate) fn record_received(&mut self, code: Code) {
        self.codes_received.insert(code);
    }

    pub(crate) fn update_value(&mut self, code: Code, payload: Payload, dtm: NaiveDateTime) -> bool {
        self.values.entry(code).or_default().update(payload, dtm)
    }

    pub(crate) fn observe_parent(&mut self, ctl: Address, dtm: NaiveDateTime, corroboration: u8) -> Observation {
        self.parent.observe(ctl, dtm, corroboration)
    }

    pub(crate) fn observe_zone(&mut self, idx: HexByte, dtm: NaiveDateTime, corroboration: u8) -> Observation {
        self.zone_idx.observe(idx, dtm, corroboration)
    }

    pub(crate) fn observe_info(&mut self, info: DeviceInfo, dtm: NaiveDateTime, corroboration: u8) -> Observation {
        self.device_info.observe(info, dtm, corroboration)
    }

    /// Record tuples negotiated in a binding; returns true if any were new
    pub(crate) fn add_bindings(&mut self, tuples: &[BindTuple]) -> bool {
        let mut added = false;
        for tuple in tuples {
            if !self.bindings.contains(tuple) {
                self.bindings.push(*tuple);
                added = true;
            }
        }
        added
    }

    pub fn to_schema(&self) -> DeviceSchema {
        DeviceSchema {
            id: self.id,
            class: self.class,
            parent: self.parent(),
            zone_idx: self.zone_idx(),
            device_info: self.device_info.get().cloned(),
        }
    }

    /// State as JSON: last-known payload per code
    pub fn state_json(&self) -> serde_json::Value {
        #[derive(Serialize)]
        struct State<'a> {
            id: Address,
            class: DeviceClass,
            last_seen: Option<NaiveDateTime>,
            values: BTreeMap<String, &'a Stamped<Payload>>,
        }
        let state = State {
            id: self.id,
            class: self.class,
            last_seen: self.last_seen,
            values: self
                .values
                .iter()
                .map(|(code, value)| (code.to_string(), value))
                .collect(),
        };
        serde_json::to_value(state).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use ramses_tx::codec::ZoneTemperature;

    fn at(secs: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(8, 0, secs)
            .unwrap()
    }

    #[test]
    fn test_last_seen_only_moves_forward() {
        let mut device = Device::new("04:056053".parse().unwrap(), Some(at(10)));
        assert_eq!(device.class(), DeviceClass::Trv);
        device.touch(at(5));
        assert_eq!(device.last_seen(), Some(at(10)));
        device.touch(at(20));
        assert_eq!(device.last_seen(), Some(at(20)));
        assert_eq!(device.first_seen(), Some(at(10)));
    }

    #[test]
    fn test_values_are_last_write_wins() {
        let mut device = Device::new("04:056053".parse().unwrap(), Some(at(0)));
        let temp = |t| {
            Payload::Temperatures(vec![ZoneTemperature {
                zone_idx: HexByte(0),
                temperature: Some(t),
            }])
        };
        assert!(device.update_value(Code::TEMPERATURE, temp(19.5), at(10)));
        assert!(!device.update_value(Code::TEMPERATURE, temp(17.0), at(5)));
        assert_eq!(device.value(Code::TEMPERATURE), Some(&temp(19.5)));
        assert_eq!(device.state_json()["values"]["30C9"]["value"][0]["temperature"], 19.5);
    }

    #[test]
    fn test_schema_round_trip() {
        let mut device = Device::new("13:123456".parse().unwrap(), Some(at(0)));
        device.observe_parent("01:145038".parse().unwrap(), at(0), 2);
        device.observe_zone(HexByte(2), at(0), 2);
        let seeded = Device::from_schema(&device.to_schema());
        assert_eq!(seeded.parent(), device.parent());
        assert_eq!(seeded.zone_idx(), Some(HexByte(2)));
        assert_eq!(seeded.last_seen(), None);
    }
}
