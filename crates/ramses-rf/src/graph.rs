//! Entity graph
//!
//! The [`EntityGraph`] turns decoded messages into devices, systems and
//! zones. Every message is applied through [`EntityGraph::apply`], whether
//! it was heard unsolicited or is the reply to one of our own probes, and
//! the changes it caused are returned as [`GraphEvent`]s.
//!
//! Records live in maps keyed by address (devices, systems) and by zone
//! index within a system. References between them are addresses, resolved
//! by lookup.

use chrono::NaiveDateTime;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info};

use ramses_tx::codec::{BindTuple, Schedule};
use ramses_tx::{Address, Code, Command, DeviceClass, HexByte, Message, Payload, Priority};

use crate::config::GraphConfig;
use crate::device::Device;
use crate::schema::{BindingRecord, Observation, SchemaSnapshot, ZoneType};
use crate::system::System;
use crate::zone::Zone;

/// Zone indices above this are domains (`F9`, `FA`, `FC`, ...), not zones
pub const MAX_ZONE_IDX: u8 = 0x0F;

/// `000C` roles naming the sensor of a zone
const ROLE_SENSOR: u8 = 0x04;

/// `000C` roles that place a device in a zone
const ZONE_ROLES: [u8; 7] = [0x00, ROLE_SENSOR, 0x08, 0x09, 0x0A, 0x0B, 0x11];

/// An entity of the graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntityId {
    Device { id: Address },
    System { ctl: Address },
    Zone { ctl: Address, zone_idx: HexByte },
}

impl EntityId {
    fn zone(ctl: Address, idx: u8) -> Self {
        EntityId::Zone {
            ctl,
            zone_idx: HexByte(idx),
        }
    }
}

/// A change caused by applying a message
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GraphEvent {
    /// First sighting of a device
    DeviceAdded { id: Address, class: DeviceClass },
    /// A schema field was adopted or changed
    SchemaChanged { entity: EntityId, field: &'static str },
    /// A state value changed
    StateChanged { entity: EntityId, code: Code },
    /// A binding completed
    Bound(BindingRecord),
}

/// A schema field the graph has not learned yet
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MissingSchema {
    pub entity: EntityId,
    pub field: &'static str,
}

/// Devices, systems and zones learned from traffic
#[derive(Debug, Clone, PartialEq)]
pub struct EntityGraph {
    config: GraphConfig,
    devices: BTreeMap<Address, Device>,
    systems: BTreeMap<Address, System>,
    bindings: Vec<BindingRecord>,
}

impl EntityGraph {
    pub fn new(config: GraphConfig) -> Self {
        Self {
            config,
            devices: BTreeMap::new(),
            systems: BTreeMap::new(),
            bindings: Vec::new(),
        }
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    pub fn device(&self, id: Address) -> Option<&Device> {
        self.devices.get(&id)
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn system(&self, ctl: Address) -> Option<&System> {
        self.systems.get(&ctl)
    }

    pub fn systems(&self) -> impl Iterator<Item = &System> {
        self.systems.values()
    }

    pub fn zone(&self, ctl: Address, idx: u8) -> Option<&Zone> {
        self.systems.get(&ctl).and_then(|system| system.zone(idx))
    }

    /// Completed bindings
    pub fn bindings(&self) -> &[BindingRecord] {
        &self.bindings
    }

    // ===== Applying messages =====

    /// Apply one decoded message
    ///
    /// Applying the same message twice changes nothing the second time.
    pub fn apply(&mut self, msg: &Message) -> Vec<GraphEvent> {
        let mut events = Vec::new();
        let dtm = msg.dtm;

        self.see_device(msg.src, dtm, &mut events);
        if let Some(device) = self.devices.get_mut(&msg.src) {
            device.record_sent(msg.code);
        }

        let dst = msg
            .dst
            .filter(|dst| *dst != msg.src && !dst.is_broadcast() && !dst.is_placeholder());
        if let Some(dst) = dst {
            if self.config.eavesdrop {
                self.see_device(dst, dtm, &mut events);
            }
            if let Some(device) = self.devices.get_mut(&dst) {
                device.record_received(msg.code);
            }
        }

        // fragments arrive again as one assembled message; requests carry no state
        if msg.is_fragment() || msg.payload.is_request() {
            return events;
        }

        if let Some(device) = self.devices.get_mut(&msg.src) {
            if device.update_value(msg.code, msg.payload.clone(), dtm) {
                events.push(GraphEvent::StateChanged {
                    entity: EntityId::Device { id: msg.src },
                    code: msg.code,
                });
            }
        }

        if let Payload::DeviceInfo(info) = &msg.payload {
            let corroboration = self.config.corroboration;
            if let Some(device) = self.devices.get_mut(&msg.src) {
                let seen = device.observe_info(info.clone(), dtm, corroboration);
                push_schema(&mut events, seen, EntityId::Device { id: msg.src }, "device_info");
            }
        }

        if msg.src.class() == DeviceClass::Controller {
            self.apply_from_controller(msg, &mut events);
        } else if let Some(ctl) = dst.filter(|dst| dst.class() == DeviceClass::Controller) {
            self.apply_to_controller(msg, ctl, &mut events);
        }
        events
    }

    /// Create the device on first sighting and move its last-seen forward
    fn see_device(&mut self, id: Address, dtm: NaiveDateTime, events: &mut Vec<GraphEvent>) {
        let device = self.devices.entry(id).or_insert_with(|| {
            info!(device = %id, class = ?id.class(), "Device discovered");
            events.push(GraphEvent::DeviceAdded {
                id,
                class: id.class(),
            });
            Device::new(id, Some(dtm))
        });
        device.touch(dtm);

        if id.class() == DeviceClass::Controller && !self.systems.contains_key(&id) {
            debug!(ctl = %id, "System created");
            self.systems.insert(id, System::new(id));
        }
    }

    fn system_mut(&mut self, ctl: Address) -> &mut System {
        self.systems.entry(ctl).or_insert_with(|| System::new(ctl))
    }

    fn apply_from_controller(&mut self, msg: &Message, events: &mut Vec<GraphEvent>) {
        let ctl = msg.src;
        let dtm = msg.dtm;
        let corroboration = self.config.corroboration;

        match &msg.payload {
            Payload::ZoneName(zone_name) => {
                let idx = zone_name.zone_idx.value();
                if let Some(name) = &zone_name.name {
                    let seen = self
                        .system_mut(ctl)
                        .zone_mut(idx)
                        .name
                        .observe(name.clone(), dtm, corroboration);
                    push_schema(events, seen, EntityId::zone(ctl, idx), "name");
                }
            }
            Payload::SystemZones(groups) => {
                for group in groups {
                    let Some(zone_type) = ZoneType::from_system_zones(group.zone_type.value()) else {
                        continue;
                    };
                    for idx in group.zones.iter().map(|z| z.value()) {
                        self.observe_zone_type(ctl, idx, zone_type, dtm, events);
                    }
                }
            }
            Payload::ZoneDevices(zone_devices) => {
                let idx = zone_devices.zone_idx.value();
                let role = zone_devices.role.value();
                for &id in zone_devices.devices.iter().filter(|d| !d.is_placeholder()) {
                    self.see_device(id, dtm, events);
                    if let Some(device) = self.devices.get_mut(&id) {
                        let seen = device.observe_parent(ctl, dtm, corroboration);
                        push_schema(events, seen, EntityId::Device { id }, "parent");
                        if ZONE_ROLES.contains(&role) && idx <= MAX_ZONE_IDX {
                            let seen = device.observe_zone(HexByte(idx), dtm, corroboration);
                            push_schema(events, seen, EntityId::Device { id }, "zone_idx");
                        }
                    }
                    if ZONE_ROLES.contains(&role)
                        && idx <= MAX_ZONE_IDX
                        && self.system_mut(ctl).zone_mut(idx).add_device(id)
                    {
                        push_schema(events, Observation::Adopted, EntityId::zone(ctl, idx), "devices");
                    }
                }
                if let Some(zone_type) = ZoneType::from_system_zones(role) {
                    if idx <= MAX_ZONE_IDX && !zone_devices.devices.is_empty() {
                        self.observe_zone_type(ctl, idx, zone_type, dtm, events);
                    }
                }
            }
            Payload::Setpoints(setpoints) => {
                for sp in setpoints.iter().filter(|sp| sp.zone_idx.value() <= MAX_ZONE_IDX) {
                    let idx = sp.zone_idx.value();
                    let changed = self.system_mut(ctl).zone_mut(idx).setpoint.update(sp.setpoint, dtm);
                    push_state(events, changed, EntityId::zone(ctl, idx), msg.code);
                }
            }
            Payload::Temperatures(temps) => {
                for temp in temps.iter().filter(|t| t.zone_idx.value() <= MAX_ZONE_IDX) {
                    let idx = temp.zone_idx.value();
                    let changed = self
                        .system_mut(ctl)
                        .zone_mut(idx)
                        .temperature
                        .update(temp.temperature, dtm);
                    push_state(events, changed, EntityId::zone(ctl, idx), msg.code);
                }
            }
            Payload::HeatDemands(demands) => {
                for demand in demands.iter().filter(|d| d.zone_idx.value() <= MAX_ZONE_IDX) {
                    let idx = demand.zone_idx.value();
                    let changed = self
                        .system_mut(ctl)
                        .zone_mut(idx)
                        .heat_demand
                        .update(demand.heat_demand, dtm);
                    push_state(events, changed, EntityId::zone(ctl, idx), msg.code);
                }
            }
            Payload::ZoneMode(mode) if mode.zone_idx.value() <= MAX_ZONE_IDX => {
                let idx = mode.zone_idx.value();
                let changed = self.system_mut(ctl).zone_mut(idx).mode.update(mode.clone(), dtm);
                push_state(events, changed, EntityId::zone(ctl, idx), msg.code);
            }
            Payload::ZoneParams(params) => {
                for p in params.iter().filter(|p| p.zone_idx.value() <= MAX_ZONE_IDX) {
                    let idx = p.zone_idx.value();
                    let changed = self.system_mut(ctl).zone_mut(idx).params.update(p.clone(), dtm);
                    push_state(events, changed, EntityId::zone(ctl, idx), msg.code);
                }
            }
            Payload::RelayDemand(demand) => {
                let changed = self
                    .system_mut(ctl)
                    .update_relay_demand(demand.domain_id, demand.relay_demand, dtm);
                push_state(events, changed, EntityId::System { ctl }, msg.code);

                let idx = demand.domain_id.value();
                if self.config.eavesdrop && idx <= MAX_ZONE_IDX {
                    self.observe_zone_type(ctl, idx, ZoneType::Electric, dtm, events);
                }
            }
            Payload::DateTime(datetime) => {
                let changed = self.system_mut(ctl).datetime.update(datetime.datetime, dtm);
                push_state(events, changed, EntityId::System { ctl }, msg.code);
            }
            Payload::ScheduleVersion(version) => {
                let changed = self
                    .system_mut(ctl)
                    .schedule_version
                    .update(version.change_counter, dtm);
                push_state(events, changed, EntityId::System { ctl }, msg.code);
            }
            Payload::FaultLog(fault) => {
                let changed = self
                    .system_mut(ctl)
                    .update_fault(fault.log_idx.value(), fault.entry.clone(), dtm);
                push_state(events, changed, EntityId::System { ctl }, msg.code);
            }
            Payload::Schedule(schedule) => {
                events.extend(self.store_schedule(ctl, schedule.clone()));
            }
            _ => {}
        }
    }

    /// A device talking to a controller belongs to it
    fn apply_to_controller(&mut self, msg: &Message, ctl: Address, events: &mut Vec<GraphEvent>) {
        let src = msg.src;
        if matches!(src.class(), DeviceClass::Gateway | DeviceClass::RfGateway) {
            return;
        }
        let dtm = msg.dtm;
        let corroboration = self.config.corroboration;
        if let Some(device) = self.devices.get_mut(&src) {
            let seen = device.observe_parent(ctl, dtm, corroboration);
            push_schema(events, seen, EntityId::Device { id: src }, "parent");
        }

        if !self.config.eavesdrop {
            return;
        }
        let Payload::HeatDemands(demands) = &msg.payload else {
            return;
        };
        let zone_type = match src.class() {
            DeviceClass::Trv => ZoneType::Radiator,
            DeviceClass::Relay => ZoneType::ZoneValve,
            DeviceClass::UfhController => ZoneType::Underfloor,
            _ => return,
        };
        for idx in demands
            .iter()
            .map(|d| d.zone_idx.value())
            .filter(|idx| *idx <= MAX_ZONE_IDX)
        {
            self.observe_zone_type(ctl, idx, zone_type, dtm, events);
            if src.class() == DeviceClass::Trv {
                if let Some(device) = self.devices.get_mut(&src) {
                    let seen = device.observe_zone(HexByte(idx), dtm, corroboration);
                    push_schema(events, seen, EntityId::Device { id: src }, "zone_idx");
                }
            }
        }
    }

    fn observe_zone_type(
        &mut self,
        ctl: Address,
        idx: u8,
        zone_type: ZoneType,
        dtm: NaiveDateTime,
        events: &mut Vec<GraphEvent>,
    ) {
        let corroboration = self.config.corroboration;
        let seen = self
            .system_mut(ctl)
            .zone_mut(idx)
            .zone_type
            .observe(zone_type, dtm, corroboration);
        push_schema(events, seen, EntityId::zone(ctl, idx), "zone_type");
    }

    /// Keep a schedule read from (or written to) a controller
    pub fn store_schedule(&mut self, ctl: Address, schedule: Schedule) -> Vec<GraphEvent> {
        let idx = schedule.zone_idx.value();
        if schedule.dhw || idx > MAX_ZONE_IDX {
            return Vec::new();
        }
        let zone = self.system_mut(ctl).zone_mut(idx);
        if zone.schedule() == Some(&schedule) {
            return Vec::new();
        }
        zone.set_schedule(schedule);
        vec![GraphEvent::StateChanged {
            entity: EntityId::zone(ctl, idx),
            code: Code::SCHEDULE,
        }]
    }

    /// Record a completed binding on both devices
    ///
    /// Recording the same binding again changes nothing.
    pub fn record_binding(&mut self, record: BindingRecord, dtm: NaiveDateTime) -> Vec<GraphEvent> {
        if self.bindings.contains(&record) {
            return Vec::new();
        }
        let mut events = Vec::new();
        self.see_device(record.supplicant, dtm, &mut events);
        self.see_device(record.respondent, dtm, &mut events);
        if let Some(device) = self.devices.get_mut(&record.supplicant) {
            device.add_bindings(&record.accepted);
        }
        if let Some(device) = self.devices.get_mut(&record.respondent) {
            device.add_bindings(&record.offered);
        }
        self.bindings.retain(|b| {
            !(b.supplicant == record.supplicant && b.respondent == record.respondent)
        });
        info!(
            supplicant = %record.supplicant,
            respondent = %record.respondent,
            tuples = record.accepted.len(),
            "Binding recorded"
        );
        self.bindings.push(record.clone());
        events.push(GraphEvent::Bound(record));
        events
    }

    // ===== Discovery =====

    /// Schema fields not yet learned
    pub fn missing_schema(&self) -> Vec<MissingSchema> {
        let mut missing = Vec::new();
        for device in self.devices.values() {
            let answers_requests = matches!(
                device.class(),
                DeviceClass::Controller | DeviceClass::UfhController | DeviceClass::OpenThermBridge
            );
            if answers_requests && device.device_info().is_none() {
                missing.push(MissingSchema {
                    entity: EntityId::Device { id: device.id() },
                    field: "device_info",
                });
            }
        }
        for system in self.systems.values() {
            let ctl = system.ctl();
            if system.zones().next().is_none() {
                missing.push(MissingSchema {
                    entity: EntityId::System { ctl },
                    field: "zones",
                });
            }
            if system.schedule_version().is_none() {
                missing.push(MissingSchema {
                    entity: EntityId::System { ctl },
                    field: "schedule_version",
                });
            }
            for zone in system.zones() {
                let entity = EntityId::zone(ctl, zone.idx());
                if zone.name().is_none() {
                    missing.push(MissingSchema { entity, field: "name" });
                }
                if zone.zone_type().is_none() {
                    missing.push(MissingSchema { entity, field: "zone_type" });
                }
                if zone.devices().next().is_none() {
                    missing.push(MissingSchema { entity, field: "devices" });
                }
            }
        }
        missing
    }

    /// Requests that would fill in the missing schema, at low priority
    pub fn probe_commands(&self) -> Vec<Command> {
        let mut commands = Vec::new();
        let mut zone_types_probed = Vec::new();
        for missing in self.missing_schema() {
            match (missing.entity, missing.field) {
                (EntityId::Device { id }, _) => commands.push(Command::get_device_info(id)),
                (EntityId::System { ctl }, "schedule_version") => {
                    commands.push(Command::get_schedule_version(ctl))
                }
                (EntityId::System { ctl }, _) | (EntityId::Zone { ctl, .. }, "zone_type") => {
                    if !zone_types_probed.contains(&ctl) {
                        zone_types_probed.push(ctl);
                        commands.extend(
                            ZoneType::PROBED
                                .iter()
                                .map(|zone_type| Command::get_system_zones(ctl, *zone_type)),
                        );
                    }
                }
                (EntityId::Zone { ctl, zone_idx }, "name") => {
                    commands.push(Command::get_zone_name(ctl, zone_idx.value()))
                }
                (EntityId::Zone { ctl, zone_idx }, _) => {
                    commands.push(Command::get_zone_devices(ctl, zone_idx.value(), 0x00));
                    commands.push(Command::get_zone_devices(ctl, zone_idx.value(), ROLE_SENSOR));
                }
            }
        }
        commands
            .into_iter()
            .map(|command| command.with_priority(Priority::Low))
            .collect()
    }

    // ===== Snapshots =====

    /// Capture the learned topology
    pub fn snapshot(&self) -> SchemaSnapshot {
        SchemaSnapshot {
            devices: self.devices.values().map(Device::to_schema).collect(),
            systems: self.systems.values().map(System::to_schema).collect(),
            bindings: self.bindings.clone(),
        }
    }

    /// Seed topology from a snapshot; entities already known are kept
    pub fn load_snapshot(&mut self, snapshot: &SchemaSnapshot) {
        for schema in &snapshot.devices {
            self.devices
                .entry(schema.id)
                .or_insert_with(|| Device::from_schema(schema));
        }
        for schema in &snapshot.systems {
            self.systems
                .entry(schema.ctl)
                .or_insert_with(|| System::from_schema(schema));
        }
        for record in &snapshot.bindings {
            if self.bindings.contains(record) {
                continue;
            }
            if let Some(device) = self.devices.get_mut(&record.supplicant) {
                device.add_bindings(&record.accepted);
            }
            if let Some(device) = self.devices.get_mut(&record.respondent) {
                device.add_bindings(&record.offered);
            }
            self.bindings.push(record.clone());
        }
        info!(
            devices = self.devices.len(),
            systems = self.systems.len(),
            bindings = self.bindings.len(),
            "Schema loaded"
        );
    }

    /// Current state of every device and system as JSON
    pub fn state_json(&self) -> serde_json::Value {
        serde_json::json!({
            "devices": self.devices.values().map(Device::state_json).collect::<Vec<_>>(),
            "systems": self.systems.values().map(System::state_json).collect::<Vec<_>>(),
        })
    }

    /// Tuples a device has negotiated
    pub fn device_bindings(&self, id: Address) -> Vec<BindTuple> {
        self.devices
            .get(&id)
            .map(|device| device.bindings().copied().collect())
            .unwrap_or_default()
    }
}

fn push_schema(events: &mut Vec<GraphEvent>, seen: Observation, entity: EntityId, field: &'static str) {
    match seen {
        Observation::Adopted | Observation::Changed => {
            debug!(entity = ?entity, field, outcome = ?seen, "Schema updated");
            events.push(GraphEvent::SchemaChanged { entity, field });
        }
        Observation::Contested { evidence } => {
            debug!(entity = ?entity, field, evidence, "Schema value contested");
        }
        Observation::Confirmed => {}
    }
}

fn push_state(events: &mut Vec<GraphEvent>, changed: bool, entity: EntityId, code: Code) {
    if changed {
        events.push(GraphEvent::StateChanged { entity, code });
    }
}
