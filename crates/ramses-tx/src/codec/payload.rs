//! Decoded payload types
//!
//! Array codes always decode to a `Vec`, even when the packet carried a
//! single record, so that merged fragments and single packets have the same
//! shape.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::address::Address;
use crate::helpers::{hex_bytes, HexByte};
use crate::packet::Code;

/// A decoded payload
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    /// A request carrying only its context (e.g. the zone index)
    Request(Request),
    /// Payload of a code without a registered codec
    Opaque(Opaque),
    ZoneName(ZoneName),
    SystemZones(Vec<SystemZones>),
    ScheduleVersion(ScheduleVersion),
    RelayDemand(RelayDemand),
    ZoneParams(Vec<ZoneParams>),
    ZoneDevices(ZoneDevices),
    ScheduleFragment(ScheduleFragment),
    Schedule(Schedule),
    FaultLog(FaultLog),
    Battery(DeviceBattery),
    DeviceInfo(DeviceInfo),
    SystemSync(SystemSync),
    RfBind(RfBind),
    UfhSetpoints(Vec<UfhSetpoint>),
    FanMode(FanMode),
    Setpoints(Vec<ZoneSetpoint>),
    ZoneMode(ZoneMode),
    Temperatures(Vec<ZoneTemperature>),
    HeatDemands(Vec<HeatDemand>),
    DateTime(SystemDateTime),
    FanState(FanState),
    ActuatorState(ActuatorState),
}

impl Payload {
    /// Wrap a request context
    pub fn request(context: impl Into<Vec<u8>>) -> Self {
        Payload::Request(Request {
            context: context.into(),
        })
    }

    /// True for context-only requests
    pub fn is_request(&self) -> bool {
        matches!(self, Payload::Request(_))
    }

    /// Render as a JSON value
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Context-only request payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    #[serde(with = "hex_bytes")]
    pub context: Vec<u8>,
}

/// Undecoded payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Opaque {
    #[serde(with = "hex_bytes")]
    pub payload: Vec<u8>,
}

/// 0004: zone name
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZoneName {
    pub zone_idx: HexByte,
    /// `None` when the zone is not configured
    pub name: Option<String>,
}

/// 0005: zones of a given type present on a controller
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemZones {
    pub zone_type: HexByte,
    pub zones: Vec<HexByte>,
}

/// 0006: schedule change counter
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleVersion {
    pub change_counter: Option<u16>,
}

/// 0008: relay demand for a zone or domain
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelayDemand {
    pub domain_id: HexByte,
    pub relay_demand: Option<f64>,
}

/// 000A: zone configuration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZoneParams {
    pub zone_idx: HexByte,
    pub min_temp: Option<f64>,
    pub max_temp: Option<f64>,
    pub local_override: bool,
    pub openwindow_function: bool,
    pub multiroom_mode: bool,
}

/// 000C: devices bound to a zone in a given role
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZoneDevices {
    pub zone_idx: HexByte,
    pub role: HexByte,
    pub devices: Vec<Address>,
}

/// 0404: one fragment of a zone or DHW schedule
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleFragment {
    pub zone_idx: HexByte,
    pub dhw: bool,
    pub frag_number: u8,
    /// `None` when the controller has no schedule (or in a first request)
    pub total_frags: Option<u8>,
    #[serde(with = "hex_bytes")]
    pub fragment: Vec<u8>,
}

/// 0404: a complete schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub zone_idx: HexByte,
    #[serde(default)]
    pub dhw: bool,
    pub days: Vec<DaySchedule>,
}

/// Switchpoints for one day (0 = Monday)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaySchedule {
    pub day_of_week: u8,
    pub switchpoints: Vec<Switchpoint>,
}

/// A schedule switchpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Switchpoint {
    /// Minutes after midnight
    #[serde(with = "time_of_day")]
    pub time_of_day: u16,
    #[serde(flatten)]
    pub value: SwitchpointValue,
}

/// What a switchpoint sets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SwitchpointValue {
    /// Zone setpoint
    Setpoint { heat_setpoint: f64 },
    /// DHW on/off
    Enabled { enabled: bool },
}

mod time_of_day {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(minutes: &u16, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{:02}:{:02}", minutes / 60, minutes % 60))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u16, D::Error> {
        let s = String::deserialize(deserializer)?;
        let (h, m) = s
            .split_once(':')
            .ok_or_else(|| serde::de::Error::custom(format!("expecting HH:MM, got {s}")))?;
        let h: u16 = h.parse().map_err(serde::de::Error::custom)?;
        let m: u16 = m.parse().map_err(serde::de::Error::custom)?;
        if h > 23 || m > 59 {
            return Err(serde::de::Error::custom(format!("invalid time of day: {s}")));
        }
        Ok(h * 60 + m)
    }
}

/// 0418: one fault log slot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaultLog {
    pub log_idx: HexByte,
    /// `None` for an empty slot (end of log)
    pub entry: Option<FaultEntry>,
}

/// A fault log entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaultEntry {
    pub timestamp: NaiveDateTime,
    pub fault_state: FaultState,
    pub fault_type: FaultType,
    pub domain_idx: HexByte,
    pub device_class: FaultDeviceClass,
    pub device_id: Address,
}

macro_rules! byte_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $value:literal => $label:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant,)+
            Unknown(u8),
        }

        impl $name {
            pub fn from_byte(byte: u8) -> Self {
                match byte {
                    $($value => $name::$variant,)+
                    other => $name::Unknown(other),
                }
            }

            pub fn to_byte(self) -> u8 {
                match self {
                    $($name::$variant => $value,)+
                    $name::Unknown(other) => other,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self {
                    $($name::$variant => f.write_str($label),)+
                    $name::Unknown(other) => write!(f, "unknown_{other:02X}"),
                }
            }
        }

        impl Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }
    };
}

byte_enum!(
    /// Fault log entry state
    FaultState {
        Fault = 0x00 => "fault",
        Restore = 0x40 => "restore",
        UnknownC0 = 0xC0 => "unknown_c0",
    }
);

byte_enum!(
    /// Fault log entry type
    FaultType {
        SystemFault = 0x01 => "system_fault",
        MainsLow = 0x03 => "mains_low",
        BatteryLow = 0x04 => "battery_low",
        BatteryError = 0x05 => "battery_error",
        CommsFault = 0x06 => "comms_fault",
        SensorFault = 0x07 => "sensor_fault",
        SensorError = 0x0A => "sensor_error",
    }
);

byte_enum!(
    /// Class of the device a fault refers to
    FaultDeviceClass {
        Controller = 0x00 => "controller",
        Sensor = 0x01 => "sensor",
        Setpoint = 0x02 => "setpoint",
        Actuator = 0x04 => "actuator",
        DhwActuator = 0x05 => "dhw_actuator",
        RfGateway = 0x06 => "rf_gateway",
    }
);

byte_enum!(
    /// Zone override mode (2349)
    ZoneModeKind {
        FollowSchedule = 0x00 => "follow_schedule",
        AdvancedOverride = 0x01 => "advanced_override",
        PermanentOverride = 0x02 => "permanent_override",
        CountdownOverride = 0x03 => "countdown_override",
        TemporaryOverride = 0x04 => "temporary_override",
    }
);

/// 1060: battery state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceBattery {
    pub domain_id: HexByte,
    pub battery_low: bool,
    pub battery_level: Option<f64>,
}

/// 10E0: device identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub oem_code: HexByte,
    pub manufacturer_sub_id: HexByte,
    pub product_id: HexByte,
    pub date_1: Option<NaiveDate>,
    pub date_2: Option<NaiveDate>,
    pub description: String,
    /// Bytes 1..10 as sent, which carry the ids above
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
}

/// 1F09: system sync (time to next broadcast cycle)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemSync {
    pub domain_id: HexByte,
    pub remaining_seconds: f64,
}

/// Binding handshake phase, derived from verb and addressing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindPhase {
    Offer,
    Accept,
    Confirm,
}

impl fmt::Display for BindPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindPhase::Offer => write!(f, "offer"),
            BindPhase::Accept => write!(f, "accept"),
            BindPhase::Confirm => write!(f, "confirm"),
        }
    }
}

/// One (domain, code, device) tuple of a binding payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BindTuple(pub HexByte, pub Code, pub Address);

impl BindTuple {
    pub fn domain_id(&self) -> HexByte {
        self.0
    }

    pub fn code(&self) -> Code {
        self.1
    }

    pub fn device_id(&self) -> Address {
        self.2
    }
}

/// 1FC9: binding offer, accept or confirm
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RfBind {
    pub phase: Option<BindPhase>,
    pub bindings: Vec<BindTuple>,
    /// Context byte of a single-byte confirm
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<HexByte>,
}

/// Heating or cooling mode of a UFH circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UfhMode {
    Heat,
    Cool,
}

/// 22C9: UFH setpoint bounds for one circuit
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UfhSetpoint {
    pub ufh_idx: HexByte,
    pub mode: UfhMode,
    /// (low, high); either may be absent
    pub setpoint_bounds: (Option<f64>, Option<f64>),
}

/// 22F1: ventilation fan mode
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FanMode {
    pub mode_idx: u8,
    pub mode_max: Option<u8>,
}

/// 2309: zone setpoint
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZoneSetpoint {
    pub zone_idx: HexByte,
    pub setpoint: Option<f64>,
}

/// 2349: zone mode
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZoneMode {
    pub zone_idx: HexByte,
    pub mode: ZoneModeKind,
    pub setpoint: Option<f64>,
    /// Countdown in minutes
    pub duration: Option<u32>,
    pub until: Option<NaiveDateTime>,
}

/// 30C9: zone temperature
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZoneTemperature {
    pub zone_idx: HexByte,
    pub temperature: Option<f64>,
}

/// 3150: heat demand for a zone (or `FC` for the system)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeatDemand {
    pub zone_idx: HexByte,
    pub heat_demand: Option<f64>,
}

/// 313F: system datetime
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemDateTime {
    pub context: HexByte,
    pub datetime: Option<NaiveDateTime>,
    pub is_dst: bool,
}

/// 31D9: ventilation fan state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FanState {
    pub domain_id: HexByte,
    pub fan_mode: HexByte,
    pub passive: bool,
    pub damper_only: bool,
    pub filter_dirty: bool,
    pub frost_cycle: bool,
    pub has_fault: bool,
}

/// 3EF0: actuator (boiler/relay) state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActuatorState {
    pub modulation_level: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ch_active: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dhw_active: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flame_on: Option<bool>,
}
