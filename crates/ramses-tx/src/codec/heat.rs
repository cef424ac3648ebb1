//! Heating zone codecs: names, parameters, setpoints, temperatures and demand

use super::*;
use crate::helpers::{decode_dtm, decode_str, encode_dtm, encode_percent, encode_str, encode_temp, temp_at, HexByte};

/// Device types that broadcast per-zone arrays
const ARRAY_SOURCES: [u8; 3] = [1, 12, 22];

pub(super) fn register(registry: &mut Registry) {
    registry.register(ZoneNameCodec);
    registry.register(RelayDemandCodec);
    registry.register(ZoneParamsCodec);
    registry.register(UfhSetpointCodec);
    registry.register(SetpointCodec);
    registry.register(ZoneModeCodec);
    registry.register(TemperatureCodec);
    registry.register(HeatDemandCodec);
    registry.register(ActuatorStateCodec);
}

struct ZoneNameCodec;

impl PayloadCodec for ZoneNameCodec {
    fn code(&self) -> Code {
        Code::ZONE_NAME
    }

    fn name(&self) -> &'static str {
        "zone_name"
    }

    fn decode(&self, ctx: &DecodeContext, payload: &[u8]) -> Result<Decoded, CodecError> {
        match payload.len() {
            2 if ctx.verb == Verb::Rq => Ok(request(payload)),
            22 => {
                let raw = &payload[2..];
                let name = if raw.iter().all(|&b| b == 0x7F) {
                    None
                } else {
                    Some(decode_str(raw))
                };
                Ok(Decoded::Complete(Payload::ZoneName(ZoneName {
                    zone_idx: HexByte(payload[0]),
                    name,
                })))
            }
            len => Err(CodecError::length(self.code(), len)),
        }
    }

    fn encode(&self, verb: Verb, payload: &Payload) -> Result<Vec<u8>, CodecError> {
        let Payload::ZoneName(zone) = payload else {
            return Err(wrong_payload(self.code(), verb));
        };
        let mut out = vec![zone.zone_idx.0, 0x00];
        match &zone.name {
            _ if verb == Verb::Rq => {}
            Some(name) => out.extend(encode_str(name, 20)),
            None => out.extend([0x7F; 20]),
        }
        Ok(out)
    }
}

struct RelayDemandCodec;

impl PayloadCodec for RelayDemandCodec {
    fn code(&self) -> Code {
        Code::RELAY_DEMAND
    }

    fn name(&self) -> &'static str {
        "relay_demand"
    }

    fn decode(&self, ctx: &DecodeContext, payload: &[u8]) -> Result<Decoded, CodecError> {
        match payload.len() {
            1 if ctx.verb == Verb::Rq => Ok(request(payload)),
            2 => Ok(Decoded::Complete(Payload::RelayDemand(RelayDemand {
                domain_id: HexByte(payload[0]),
                relay_demand: percent(self.code(), payload[1])?,
            }))),
            len => Err(CodecError::length(self.code(), len)),
        }
    }

    fn encode(&self, verb: Verb, payload: &Payload) -> Result<Vec<u8>, CodecError> {
        let Payload::RelayDemand(demand) = payload else {
            return Err(wrong_payload(self.code(), verb));
        };
        Ok(vec![
            demand.domain_id.0,
            encode_percent(demand.relay_demand, true),
        ])
    }
}

struct ZoneParamsCodec;

impl ZoneParamsCodec {
    fn decode_record(record: &[u8]) -> ZoneParams {
        let bitmap = record[1];
        ZoneParams {
            zone_idx: HexByte(record[0]),
            min_temp: temp_at(record, 2),
            max_temp: temp_at(record, 4),
            local_override: bitmap & 0x01 == 0,
            openwindow_function: bitmap & 0x02 == 0,
            multiroom_mode: bitmap & 0x10 == 0,
        }
    }

    fn encode_record(params: &ZoneParams) -> [u8; 6] {
        let bitmap = u8::from(!params.local_override)
            | u8::from(!params.openwindow_function) << 1
            | u8::from(!params.multiroom_mode) << 4;
        let min = encode_temp(params.min_temp);
        let max = encode_temp(params.max_temp);
        [params.zone_idx.0, bitmap, min[0], min[1], max[0], max[1]]
    }
}

impl PayloadCodec for ZoneParamsCodec {
    fn code(&self) -> Code {
        Code::ZONE_PARAMS
    }

    fn name(&self) -> &'static str {
        "zone_params"
    }

    fn decode(&self, ctx: &DecodeContext, payload: &[u8]) -> Result<Decoded, CodecError> {
        if ctx.verb == Verb::Rq && payload.len() <= 2 {
            return Ok(request(payload));
        }
        let zones: Vec<ZoneParams> = records(self.code(), payload, 6)?
            .map(Self::decode_record)
            .collect();
        if ctx.verb == Verb::I && ctx.is_to_self() && ctx.src_type_in(&ARRAY_SOURCES) {
            return Ok(array_part(payload.len(), 6, payload[0], Payload::ZoneParams(zones)));
        }
        if zones.len() > 1 && !is_array(ctx, payload.len(), 6, &ARRAY_SOURCES) {
            return Err(CodecError::length(self.code(), payload.len()));
        }
        Ok(Decoded::Complete(Payload::ZoneParams(zones)))
    }

    fn encode(&self, verb: Verb, payload: &Payload) -> Result<Vec<u8>, CodecError> {
        let Payload::ZoneParams(zones) = payload else {
            return Err(wrong_payload(self.code(), verb));
        };
        Ok(zones.iter().flat_map(Self::encode_record).collect())
    }

    fn assemble(&self, parts: Vec<Payload>) -> Result<Payload, CodecError> {
        merge_records(
            self.code(),
            parts,
            |p| match p {
                Payload::ZoneParams(zones) => Some(zones),
                _ => None,
            },
            |z| z.zone_idx.0,
        )
        .map(Payload::ZoneParams)
    }
}

struct UfhSetpointCodec;

impl UfhSetpointCodec {
    fn decode_record(code: Code, record: &[u8]) -> Result<UfhSetpoint, CodecError> {
        let mode = match record[5] {
            0x01 => UfhMode::Heat,
            0x02 => UfhMode::Cool,
            other => return Err(CodecError::invalid(code, format!("unknown mode {other:02X}"))),
        };
        Ok(UfhSetpoint {
            ufh_idx: HexByte(record[0]),
            mode,
            setpoint_bounds: (temp_at(record, 1), temp_at(record, 3)),
        })
    }

    fn mode_byte(mode: UfhMode) -> u8 {
        match mode {
            UfhMode::Heat => 0x01,
            UfhMode::Cool => 0x02,
        }
    }
}

impl PayloadCodec for UfhSetpointCodec {
    fn code(&self) -> Code {
        Code::UFH_SETPOINT
    }

    fn name(&self) -> &'static str {
        "ufh_setpoint"
    }

    fn decode(&self, ctx: &DecodeContext, payload: &[u8]) -> Result<Decoded, CodecError> {
        let len = payload.len();
        if ctx.verb == Verb::Rq && len <= 2 {
            return Ok(request(payload));
        }
        let from_ufc = ctx.src_type_in(&[2]) && ctx.is_to_self();
        let array = ctx.verb == Verb::I && ((len != 6 && len % 6 == 0) || from_ufc);
        if array {
            let circuits = records(self.code(), payload, 6)?
                .map(|r| Self::decode_record(self.code(), r))
                .collect::<Result<Vec<_>, _>>()?;
            let payload_out = Payload::UfhSetpoints(circuits);
            return Ok(if from_ufc {
                array_part(len, 6, payload[0], payload_out)
            } else {
                Decoded::Complete(payload_out)
            });
        }
        match len {
            6 => {}
            // single circuit with an extra `mode 03` suffix, seen only without an upper bound
            8 if payload[5] == payload[6] && payload[7] == 0x03 => {}
            8 => {
                return Err(CodecError::invalid(
                    self.code(),
                    format!("unexpected suffix {}", hex::encode_upper(&payload[5..])),
                ))
            }
            _ => return Err(CodecError::length(self.code(), len)),
        }
        let circuit = Self::decode_record(self.code(), &payload[..6])?;
        Ok(Decoded::Complete(Payload::UfhSetpoints(vec![circuit])))
    }

    fn encode(&self, verb: Verb, payload: &Payload) -> Result<Vec<u8>, CodecError> {
        let Payload::UfhSetpoints(circuits) = payload else {
            return Err(wrong_payload(self.code(), verb));
        };
        let mut out = Vec::with_capacity(circuits.len() * 6 + 2);
        for circuit in circuits {
            let (low, high) = circuit.setpoint_bounds;
            out.push(circuit.ufh_idx.0);
            out.extend(encode_temp(low));
            out.extend(encode_temp(high));
            out.push(Self::mode_byte(circuit.mode));
        }
        if let [single] = circuits.as_slice() {
            if verb == Verb::I && single.setpoint_bounds.1.is_none() {
                out.extend([Self::mode_byte(single.mode), 0x03]);
            }
        }
        Ok(out)
    }

    fn assemble(&self, parts: Vec<Payload>) -> Result<Payload, CodecError> {
        merge_records(
            self.code(),
            parts,
            |p| match p {
                Payload::UfhSetpoints(circuits) => Some(circuits),
                _ => None,
            },
            |c| c.ufh_idx.0,
        )
        .map(Payload::UfhSetpoints)
    }
}

struct SetpointCodec;

impl PayloadCodec for SetpointCodec {
    fn code(&self) -> Code {
        Code::SETPOINT
    }

    fn name(&self) -> &'static str {
        "setpoint"
    }

    fn decode(&self, ctx: &DecodeContext, payload: &[u8]) -> Result<Decoded, CodecError> {
        if ctx.verb == Verb::Rq && payload.len() <= 2 {
            return Ok(request(payload));
        }
        if payload.len() != 3 && !is_array(ctx, payload.len(), 3, &ARRAY_SOURCES) {
            return Err(CodecError::length(self.code(), payload.len()));
        }
        let zones = records(self.code(), payload, 3)?
            .map(|r| ZoneSetpoint {
                zone_idx: HexByte(r[0]),
                setpoint: temp_at(r, 1),
            })
            .collect();
        Ok(Decoded::Complete(Payload::Setpoints(zones)))
    }

    fn encode(&self, verb: Verb, payload: &Payload) -> Result<Vec<u8>, CodecError> {
        let Payload::Setpoints(zones) = payload else {
            return Err(wrong_payload(self.code(), verb));
        };
        Ok(zones
            .iter()
            .flat_map(|z| {
                let temp = encode_temp(z.setpoint);
                [z.zone_idx.0, temp[0], temp[1]]
            })
            .collect())
    }
}

struct ZoneModeCodec;

impl PayloadCodec for ZoneModeCodec {
    fn code(&self) -> Code {
        Code::ZONE_MODE
    }

    fn name(&self) -> &'static str {
        "zone_mode"
    }

    fn decode(&self, ctx: &DecodeContext, payload: &[u8]) -> Result<Decoded, CodecError> {
        let len = payload.len();
        if ctx.verb == Verb::Rq && len <= 2 {
            return Ok(request(payload));
        }
        if len != 7 && len != 13 {
            return Err(CodecError::length(self.code(), len));
        }
        let duration = match &payload[4..7] {
            [0xFF, 0xFF, 0xFF] => None,
            d => Some(u32::from_be_bytes([0, d[0], d[1], d[2]])),
        };
        let until = if len == 13 {
            decode_dtm(&payload[7..13]).map_err(|e| CodecError::invalid(self.code(), e))?
        } else {
            None
        };
        Ok(Decoded::Complete(Payload::ZoneMode(ZoneMode {
            zone_idx: HexByte(payload[0]),
            mode: ZoneModeKind::from_byte(payload[3]),
            setpoint: temp_at(payload, 1),
            duration,
            until,
        })))
    }

    fn encode(&self, verb: Verb, payload: &Payload) -> Result<Vec<u8>, CodecError> {
        let Payload::ZoneMode(mode) = payload else {
            return Err(wrong_payload(self.code(), verb));
        };
        let mut out = vec![mode.zone_idx.0];
        out.extend(encode_temp(mode.setpoint));
        out.push(mode.mode.to_byte());
        match mode.duration {
            None => out.extend([0xFF; 3]),
            Some(minutes) if minutes <= 0xFF_FFFE => out.extend(&minutes.to_be_bytes()[1..]),
            Some(minutes) => {
                return Err(CodecError::request(
                    self.code(),
                    verb,
                    format!("duration {minutes} too long"),
                ))
            }
        }
        // controllers always report the until field; writers omit it when unused
        if verb != Verb::W || mode.until.is_some() {
            out.extend(encode_dtm(mode.until, false));
        }
        Ok(out)
    }
}

struct TemperatureCodec;

impl PayloadCodec for TemperatureCodec {
    fn code(&self) -> Code {
        Code::TEMPERATURE
    }

    fn name(&self) -> &'static str {
        "temperature"
    }

    fn decode(&self, ctx: &DecodeContext, payload: &[u8]) -> Result<Decoded, CodecError> {
        if ctx.verb == Verb::Rq && payload.len() <= 2 {
            return Ok(request(payload));
        }
        if payload.len() != 3 && !is_array(ctx, payload.len(), 3, &ARRAY_SOURCES) {
            return Err(CodecError::length(self.code(), payload.len()));
        }
        let zones = records(self.code(), payload, 3)?
            .map(|r| ZoneTemperature {
                zone_idx: HexByte(r[0]),
                temperature: temp_at(r, 1),
            })
            .collect();
        Ok(Decoded::Complete(Payload::Temperatures(zones)))
    }

    fn encode(&self, verb: Verb, payload: &Payload) -> Result<Vec<u8>, CodecError> {
        let Payload::Temperatures(zones) = payload else {
            return Err(wrong_payload(self.code(), verb));
        };
        Ok(zones
            .iter()
            .flat_map(|z| {
                let temp = encode_temp(z.temperature);
                [z.zone_idx.0, temp[0], temp[1]]
            })
            .collect())
    }
}

struct HeatDemandCodec;

impl PayloadCodec for HeatDemandCodec {
    fn code(&self) -> Code {
        Code::HEAT_DEMAND
    }

    fn name(&self) -> &'static str {
        "heat_demand"
    }

    fn decode(&self, ctx: &DecodeContext, payload: &[u8]) -> Result<Decoded, CodecError> {
        if ctx.verb == Verb::Rq && payload.len() == 1 {
            return Ok(request(payload));
        }
        if payload.len() != 2 && !is_array(ctx, payload.len(), 2, &[2]) {
            return Err(CodecError::length(self.code(), payload.len()));
        }
        let zones = records(self.code(), payload, 2)?
            .map(|r| {
                Ok(HeatDemand {
                    zone_idx: HexByte(r[0]),
                    heat_demand: percent(self.code(), r[1])?,
                })
            })
            .collect::<Result<Vec<_>, CodecError>>()?;
        Ok(Decoded::Complete(Payload::HeatDemands(zones)))
    }

    fn encode(&self, verb: Verb, payload: &Payload) -> Result<Vec<u8>, CodecError> {
        let Payload::HeatDemands(zones) = payload else {
            return Err(wrong_payload(self.code(), verb));
        };
        Ok(zones
            .iter()
            .flat_map(|z| [z.zone_idx.0, encode_percent(z.heat_demand, true)])
            .collect())
    }
}

struct ActuatorStateCodec;

impl PayloadCodec for ActuatorStateCodec {
    fn code(&self) -> Code {
        Code::ACTUATOR_STATE
    }

    fn name(&self) -> &'static str {
        "actuator_state"
    }

    fn decode(&self, ctx: &DecodeContext, payload: &[u8]) -> Result<Decoded, CodecError> {
        let len = payload.len();
        if ctx.verb == Verb::Rq && len == 1 {
            return Ok(request(payload));
        }
        if !(3..=9).contains(&len) || (len > 3 && len < 6) {
            return Err(CodecError::length(self.code(), len));
        }
        let flag = |mask: u8| (len >= 6).then(|| payload[3] & mask != 0);
        Ok(Decoded::Complete(Payload::ActuatorState(ActuatorState {
            modulation_level: percent(self.code(), payload[1])?,
            ch_active: flag(0x02),
            dhw_active: flag(0x04),
            flame_on: flag(0x08),
        })))
    }

    fn encode(&self, verb: Verb, payload: &Payload) -> Result<Vec<u8>, CodecError> {
        let Payload::ActuatorState(state) = payload else {
            return Err(wrong_payload(self.code(), verb));
        };
        let level = encode_percent(state.modulation_level, true);
        let flags = [(state.ch_active, 0x02), (state.dhw_active, 0x04), (state.flame_on, 0x08)];
        if flags.iter().all(|(f, _)| f.is_none()) {
            return Ok(vec![0x00, level, 0xFF]);
        }
        let bits = flags
            .iter()
            .filter(|(f, _)| *f == Some(true))
            .fold(0u8, |acc, (_, mask)| acc | mask);
        Ok(vec![0x00, level, 0x10, bits, 0x00, 0xFF])
    }
}
