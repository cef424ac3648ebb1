//! Ventilation codecs

use super::*;
use crate::helpers::HexByte;

pub(super) fn register(registry: &mut Registry) {
    registry.register(FanModeCodec);
    registry.register(FanStateCodec);
}

struct FanModeCodec;

impl PayloadCodec for FanModeCodec {
    fn code(&self) -> Code {
        Code::FAN_MODE
    }

    fn name(&self) -> &'static str {
        "fan_mode"
    }

    fn decode(&self, ctx: &DecodeContext, payload: &[u8]) -> Result<Decoded, CodecError> {
        match payload.len() {
            1 if ctx.verb == Verb::Rq => Ok(request(payload)),
            2 | 3 => {
                let mode_max = payload.get(2).copied();
                if mode_max.is_some_and(|max| payload[1] > max) {
                    return Err(CodecError::invalid(
                        self.code(),
                        format!("mode {} exceeds maximum {}", payload[1], payload[2]),
                    ));
                }
                Ok(Decoded::Complete(Payload::FanMode(FanMode {
                    mode_idx: payload[1],
                    mode_max,
                })))
            }
            len => Err(CodecError::length(self.code(), len)),
        }
    }

    fn encode(&self, verb: Verb, payload: &Payload) -> Result<Vec<u8>, CodecError> {
        let Payload::FanMode(mode) = payload else {
            return Err(wrong_payload(self.code(), verb));
        };
        let mut out = vec![0x00, mode.mode_idx];
        out.extend(mode.mode_max);
        Ok(out)
    }
}

struct FanStateCodec;

impl FanStateCodec {
    const PASSIVE: u8 = 0x02;
    const DAMPER_ONLY: u8 = 0x04;
    const FILTER_DIRTY: u8 = 0x20;
    const FROST_CYCLE: u8 = 0x40;
    const HAS_FAULT: u8 = 0x80;
}

impl PayloadCodec for FanStateCodec {
    fn code(&self) -> Code {
        Code::FAN_STATE
    }

    fn name(&self) -> &'static str {
        "fan_state"
    }

    fn decode(&self, ctx: &DecodeContext, payload: &[u8]) -> Result<Decoded, CodecError> {
        match payload.len() {
            1 if ctx.verb == Verb::Rq => return Ok(request(payload)),
            len if len < 3 => return Err(CodecError::length(self.code(), len)),
            _ => {}
        }
        let flags = payload[1];
        Ok(Decoded::Complete(Payload::FanState(FanState {
            domain_id: HexByte(payload[0]),
            fan_mode: HexByte(payload[2]),
            passive: flags & Self::PASSIVE != 0,
            damper_only: flags & Self::DAMPER_ONLY != 0,
            filter_dirty: flags & Self::FILTER_DIRTY != 0,
            frost_cycle: flags & Self::FROST_CYCLE != 0,
            has_fault: flags & Self::HAS_FAULT != 0,
        })))
    }

    fn encode(&self, verb: Verb, payload: &Payload) -> Result<Vec<u8>, CodecError> {
        let Payload::FanState(state) = payload else {
            return Err(wrong_payload(self.code(), verb));
        };
        let flags = [
            (state.passive, Self::PASSIVE),
            (state.damper_only, Self::DAMPER_ONLY),
            (state.filter_dirty, Self::FILTER_DIRTY),
            (state.frost_cycle, Self::FROST_CYCLE),
            (state.has_fault, Self::HAS_FAULT),
        ]
        .iter()
        .filter(|(set, _)| *set)
        .fold(0u8, |acc, (_, bit)| acc | bit);
        Ok(vec![state.domain_id.0, flags, state.fan_mode.0])
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::ctx;
    use super::*;

    #[test]
    fn test_fan_mode() {
        let ctx = ctx(Verb::I, "29:123150", Some("63:262142"));
        let decoded = FanModeCodec.decode(&ctx, &[0x00, 0x02, 0x04]).unwrap();
        assert_eq!(
            decoded.payload(),
            &Payload::FanMode(FanMode {
                mode_idx: 2,
                mode_max: Some(4)
            })
        );
        assert_eq!(
            FanModeCodec.encode(Verb::I, decoded.payload()).unwrap(),
            vec![0x00, 0x02, 0x04]
        );
        assert!(FanModeCodec.decode(&ctx, &[0x00, 0x05, 0x04]).is_err());
    }

    #[test]
    fn test_fan_state_flags() {
        let ctx = ctx(Verb::I, "32:168090", Some("32:168090"));
        let decoded = FanStateCodec.decode(&ctx, &[0x00, 0x24, 0x3F]).unwrap();
        let Payload::FanState(state) = decoded.payload() else {
            panic!("expected fan state");
        };
        assert!(state.damper_only);
        assert!(state.filter_dirty);
        assert!(!state.passive);
        assert!(!state.has_fault);
        assert_eq!(state.fan_mode, HexByte(0x3F));
        assert_eq!(
            FanStateCodec.encode(Verb::I, decoded.payload()).unwrap(),
            vec![0x00, 0x24, 0x3F]
        );
    }
}
