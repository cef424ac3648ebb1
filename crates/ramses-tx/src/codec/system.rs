//! System-level codecs: topology, identity, faults, binding and time

use super::*;
use crate::helpers::{
    decode_date, decode_dtm, decode_dts, decode_str, encode_date, encode_dtm, encode_dts,
    encode_percent, HexByte,
};

pub(super) fn register(registry: &mut Registry) {
    registry.register(SystemZonesCodec);
    registry.register(ScheduleVersionCodec);
    registry.register(ZoneDevicesCodec);
    registry.register(FaultLogCodec);
    registry.register(BatteryCodec);
    registry.register(DeviceInfoCodec);
    registry.register(SystemSyncCodec);
    registry.register(RfBindCodec);
    registry.register(DateTimeCodec);
    registry.register(super::schedule::ScheduleCodec);
}

struct SystemZonesCodec;

impl PayloadCodec for SystemZonesCodec {
    fn code(&self) -> Code {
        Code::SYSTEM_ZONES
    }

    fn name(&self) -> &'static str {
        "system_zones"
    }

    fn decode(&self, ctx: &DecodeContext, payload: &[u8]) -> Result<Decoded, CodecError> {
        let len = payload.len();
        if ctx.verb == Verb::Rq && len == 2 {
            return Ok(request(payload));
        }
        let chunk = if len == 3 { 3 } else { 4 };
        let types = records(self.code(), payload, chunk)?
            .map(|r| {
                let mask = u16::from(r[2]) | r.get(3).map_or(0, |&hi| u16::from(hi) << 8);
                SystemZones {
                    zone_type: HexByte(r[1]),
                    zones: (0..16u8)
                        .filter(|i| mask & (1 << i) != 0)
                        .map(HexByte)
                        .collect(),
                }
            })
            .collect();
        Ok(Decoded::Complete(Payload::SystemZones(types)))
    }

    fn encode(&self, verb: Verb, payload: &Payload) -> Result<Vec<u8>, CodecError> {
        let Payload::SystemZones(types) = payload else {
            return Err(wrong_payload(self.code(), verb));
        };
        let mut out = Vec::with_capacity(types.len() * 4);
        for record in types {
            let mut mask = 0u16;
            for zone in &record.zones {
                if zone.0 >= 16 {
                    return Err(CodecError::request(
                        self.code(),
                        verb,
                        format!("zone index {zone} out of range"),
                    ));
                }
                mask |= 1 << zone.0;
            }
            let [lo, hi] = mask.to_le_bytes();
            out.extend([0x00, record.zone_type.0, lo, hi]);
        }
        Ok(out)
    }
}

struct ScheduleVersionCodec;

impl PayloadCodec for ScheduleVersionCodec {
    fn code(&self) -> Code {
        Code::SCHEDULE_VERSION
    }

    fn name(&self) -> &'static str {
        "schedule_version"
    }

    fn decode(&self, ctx: &DecodeContext, payload: &[u8]) -> Result<Decoded, CodecError> {
        match payload.len() {
            1 if ctx.verb == Verb::Rq => Ok(request(payload)),
            4 => {
                let change_counter = match [payload[2], payload[3]] {
                    [0xFF, 0xFF] => None,
                    bytes => Some(u16::from_be_bytes(bytes)),
                };
                Ok(Decoded::Complete(Payload::ScheduleVersion(ScheduleVersion {
                    change_counter,
                })))
            }
            len => Err(CodecError::length(self.code(), len)),
        }
    }

    fn encode(&self, verb: Verb, payload: &Payload) -> Result<Vec<u8>, CodecError> {
        let Payload::ScheduleVersion(version) = payload else {
            return Err(wrong_payload(self.code(), verb));
        };
        let [hi, lo] = version.change_counter.unwrap_or(0xFFFF).to_be_bytes();
        Ok(vec![0x00, 0x05, hi, lo])
    }
}

struct ZoneDevicesCodec;

impl PayloadCodec for ZoneDevicesCodec {
    fn code(&self) -> Code {
        Code::ZONE_DEVICES
    }

    fn name(&self) -> &'static str {
        "zone_devices"
    }

    fn decode(&self, ctx: &DecodeContext, payload: &[u8]) -> Result<Decoded, CodecError> {
        let len = payload.len();
        if ctx.verb == Verb::Rq && len == 2 {
            return Ok(request(payload));
        }
        // long form repeats the index in every element; short form gives it once
        let (zone_idx, elements) = if len % 6 == 0 {
            (payload[0], records(self.code(), payload, 6)?.map(|e| &e[1..]).collect::<Vec<_>>())
        } else if len > 1 && (len - 1) % 5 == 0 {
            (payload[0], payload[1..].chunks(5).collect())
        } else {
            return Err(CodecError::length(self.code(), len));
        };
        let role = elements[0][0];
        let devices = elements
            .iter()
            .filter(|e| e[1] != 0x7F && e[2..5] != [0xFF, 0xFF, 0xFF])
            .map(|e| Address::from_hex([e[2], e[3], e[4]]))
            .collect();
        Ok(Decoded::Complete(Payload::ZoneDevices(ZoneDevices {
            zone_idx: HexByte(zone_idx),
            role: HexByte(role),
            devices,
        })))
    }

    fn encode(&self, verb: Verb, payload: &Payload) -> Result<Vec<u8>, CodecError> {
        let Payload::ZoneDevices(zone) = payload else {
            return Err(wrong_payload(self.code(), verb));
        };
        if zone.devices.is_empty() {
            return Ok(vec![zone.zone_idx.0, zone.role.0, 0x7F, 0xFF, 0xFF, 0xFF]);
        }
        Ok(zone
            .devices
            .iter()
            .flat_map(|dev| {
                let [a, b, c] = dev.to_hex();
                [zone.zone_idx.0, zone.role.0, 0x00, a, b, c]
            })
            .collect())
    }
}

struct FaultLogCodec;

impl PayloadCodec for FaultLogCodec {
    fn code(&self) -> Code {
        Code::FAULT_LOG
    }

    fn name(&self) -> &'static str {
        "system_fault"
    }

    fn decode(&self, ctx: &DecodeContext, payload: &[u8]) -> Result<Decoded, CodecError> {
        match payload.len() {
            3 if ctx.verb == Verb::Rq => return Ok(request(payload)),
            22 => {}
            len => return Err(CodecError::length(self.code(), len)),
        }
        let mut dts = [0u8; 6];
        dts.copy_from_slice(&payload[9..15]);
        let timestamp = decode_dts(dts).map_err(|e| CodecError::invalid(self.code(), e))?;
        let entry = timestamp.map(|timestamp| FaultEntry {
            timestamp,
            fault_state: FaultState::from_byte(payload[1]),
            fault_type: FaultType::from_byte(payload[4]),
            domain_idx: HexByte(payload[5]),
            device_class: FaultDeviceClass::from_byte(payload[6]),
            device_id: Address::from_hex([payload[19], payload[20], payload[21]]),
        });
        Ok(Decoded::Complete(Payload::FaultLog(FaultLog {
            log_idx: HexByte(payload[2]),
            entry,
        })))
    }

    fn encode(&self, verb: Verb, payload: &Payload) -> Result<Vec<u8>, CodecError> {
        let Payload::FaultLog(log) = payload else {
            return Err(wrong_payload(self.code(), verb));
        };
        let mut out = vec![0x00; 22];
        out[2] = log.log_idx.0;
        out[3] = 0xB0;
        out[15..19].copy_from_slice(&[0xFF, 0xFF, 0x70, 0x00]);
        match &log.entry {
            None => out[9..15].copy_from_slice(&encode_dts(None)),
            Some(entry) => {
                out[1] = entry.fault_state.to_byte();
                out[4] = entry.fault_type.to_byte();
                out[5] = entry.domain_idx.0;
                out[6] = entry.device_class.to_byte();
                out[9..15].copy_from_slice(&encode_dts(Some(entry.timestamp)));
                out[19..22].copy_from_slice(&entry.device_id.to_hex());
            }
        }
        Ok(out)
    }
}

struct BatteryCodec;

impl PayloadCodec for BatteryCodec {
    fn code(&self) -> Code {
        Code::BATTERY_STATE
    }

    fn name(&self) -> &'static str {
        "device_battery"
    }

    fn decode(&self, ctx: &DecodeContext, payload: &[u8]) -> Result<Decoded, CodecError> {
        match payload.len() {
            1 if ctx.verb == Verb::Rq => Ok(request(payload)),
            3 => Ok(Decoded::Complete(Payload::Battery(DeviceBattery {
                domain_id: HexByte(payload[0]),
                battery_low: payload[2] == 0x00,
                battery_level: match payload[1] {
                    0x00 => None,
                    level => percent(self.code(), level)?,
                },
            }))),
            len => Err(CodecError::length(self.code(), len)),
        }
    }

    fn encode(&self, verb: Verb, payload: &Payload) -> Result<Vec<u8>, CodecError> {
        let Payload::Battery(battery) = payload else {
            return Err(wrong_payload(self.code(), verb));
        };
        let level = match battery.battery_level {
            None => 0xFF,
            level => encode_percent(level, true),
        };
        Ok(vec![
            battery.domain_id.0,
            level,
            u8::from(!battery.battery_low),
        ])
    }
}

struct DeviceInfoCodec;

impl DeviceInfoCodec {
    const MAX_DESCRIPTION: usize = 29;

    fn date(bytes: &[u8]) -> Option<chrono::NaiveDate> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(bytes);
        decode_date(raw).ok().flatten()
    }
}

impl PayloadCodec for DeviceInfoCodec {
    fn code(&self) -> Code {
        Code::DEVICE_INFO
    }

    fn name(&self) -> &'static str {
        "device_info"
    }

    fn decode(&self, _ctx: &DecodeContext, payload: &[u8]) -> Result<Decoded, CodecError> {
        match payload.len() {
            // requests, and devices with nothing to report
            1 => return Ok(request(payload)),
            len if len < 18 => return Err(CodecError::length(self.code(), len)),
            _ => {}
        }
        let text = &payload[18..];
        let end = text.iter().position(|&b| b == 0x00).unwrap_or(text.len());
        Ok(Decoded::Complete(Payload::DeviceInfo(DeviceInfo {
            oem_code: HexByte(payload[7]),
            manufacturer_sub_id: HexByte(payload[3]),
            product_id: HexByte(payload[4]),
            date_1: Self::date(&payload[14..18]),
            date_2: Self::date(&payload[10..14]),
            description: decode_str(&text[..end]),
            signature: payload[1..10].to_vec(),
        })))
    }

    fn encode(&self, verb: Verb, payload: &Payload) -> Result<Vec<u8>, CodecError> {
        let Payload::DeviceInfo(info) = payload else {
            return Err(wrong_payload(self.code(), verb));
        };
        if info.signature.len() != 9 {
            return Err(CodecError::request(
                self.code(),
                verb,
                "signature must be 9 bytes",
            ));
        }
        let mut out = vec![0x00];
        out.extend(&info.signature);
        out[3] = info.manufacturer_sub_id.0;
        out[4] = info.product_id.0;
        out[7] = info.oem_code.0;
        out.extend(encode_date(info.date_2));
        out.extend(encode_date(info.date_1));
        out.extend(
            info.description
                .bytes()
                .filter(|b| (0x20..0x7F).contains(b))
                .take(Self::MAX_DESCRIPTION),
        );
        out.push(0x00);
        Ok(out)
    }
}

struct SystemSyncCodec;

impl PayloadCodec for SystemSyncCodec {
    fn code(&self) -> Code {
        Code::SYSTEM_SYNC
    }

    fn name(&self) -> &'static str {
        "system_sync"
    }

    fn decode(&self, ctx: &DecodeContext, payload: &[u8]) -> Result<Decoded, CodecError> {
        match payload.len() {
            1 if ctx.verb == Verb::Rq => Ok(request(payload)),
            3 => Ok(Decoded::Complete(Payload::SystemSync(SystemSync {
                domain_id: HexByte(payload[0]),
                remaining_seconds: f64::from(u16::from_be_bytes([payload[1], payload[2]])) / 10.0,
            }))),
            len => Err(CodecError::length(self.code(), len)),
        }
    }

    fn encode(&self, verb: Verb, payload: &Payload) -> Result<Vec<u8>, CodecError> {
        let Payload::SystemSync(sync) = payload else {
            return Err(wrong_payload(self.code(), verb));
        };
        let tenths = (sync.remaining_seconds * 10.0).round();
        if !(0.0..=f64::from(u16::MAX)).contains(&tenths) {
            return Err(CodecError::request(self.code(), verb, "remaining_seconds out of range"));
        }
        let [hi, lo] = (tenths as u16).to_be_bytes();
        Ok(vec![sync.domain_id.0, hi, lo])
    }
}

struct RfBindCodec;

impl RfBindCodec {
    fn phase(ctx: &DecodeContext) -> Option<BindPhase> {
        match ctx.verb {
            Verb::I if ctx.dst.map_or(true, |d| d == ctx.src || d.is_broadcast()) => {
                Some(BindPhase::Offer)
            }
            Verb::I => Some(BindPhase::Confirm),
            Verb::W if !ctx.is_to_self() => Some(BindPhase::Accept),
            _ => None,
        }
    }
}

impl PayloadCodec for RfBindCodec {
    fn code(&self) -> Code {
        Code::RF_BIND
    }

    fn name(&self) -> &'static str {
        "rf_bind"
    }

    fn decode(&self, ctx: &DecodeContext, payload: &[u8]) -> Result<Decoded, CodecError> {
        if ctx.verb == Verb::Rq {
            return Ok(request(payload));
        }
        if ctx.verb == Verb::W && ctx.is_to_self() {
            return Err(CodecError::invalid(self.code(), "accept addressed to itself"));
        }
        let phase = Self::phase(ctx);
        if payload.len() == 1 {
            return Ok(Decoded::Complete(Payload::RfBind(RfBind {
                phase,
                bindings: Vec::new(),
                context: Some(HexByte(payload[0])),
            })));
        }
        let bindings = records(self.code(), payload, 6)?
            .map(|t| {
                BindTuple(
                    HexByte(t[0]),
                    Code(u16::from_be_bytes([t[1], t[2]])),
                    Address::from_hex([t[3], t[4], t[5]]),
                )
            })
            .collect();
        Ok(Decoded::Complete(Payload::RfBind(RfBind {
            phase,
            bindings,
            context: None,
        })))
    }

    fn encode(&self, verb: Verb, payload: &Payload) -> Result<Vec<u8>, CodecError> {
        let Payload::RfBind(bind) = payload else {
            return Err(wrong_payload(self.code(), verb));
        };
        if bind.bindings.is_empty() {
            return Ok(vec![bind.context.unwrap_or_default().0]);
        }
        Ok(bind
            .bindings
            .iter()
            .flat_map(|t| {
                let [c0, c1] = t.code().0.to_be_bytes();
                let [a, b, c] = t.device_id().to_hex();
                [t.domain_id().0, c0, c1, a, b, c]
            })
            .collect())
    }
}

struct DateTimeCodec;

impl PayloadCodec for DateTimeCodec {
    fn code(&self) -> Code {
        Code::DATETIME
    }

    fn name(&self) -> &'static str {
        "datetime"
    }

    fn decode(&self, ctx: &DecodeContext, payload: &[u8]) -> Result<Decoded, CodecError> {
        match payload.len() {
            1 if ctx.verb == Verb::Rq => Ok(request(payload)),
            9 => Ok(Decoded::Complete(Payload::DateTime(SystemDateTime {
                context: HexByte(payload[1]),
                datetime: decode_dtm(&payload[2..9])
                    .map_err(|e| CodecError::invalid(self.code(), e))?,
                is_dst: payload[2] & 0x80 != 0,
            }))),
            len => Err(CodecError::length(self.code(), len)),
        }
    }

    fn encode(&self, verb: Verb, payload: &Payload) -> Result<Vec<u8>, CodecError> {
        let Payload::DateTime(dt) = payload else {
            return Err(wrong_payload(self.code(), verb));
        };
        let mut out = vec![0x00, dt.context.0];
        out.extend(encode_dtm(dt.datetime, true));
        if dt.is_dst {
            out[2] |= 0x80;
        }
        Ok(out)
    }
}
