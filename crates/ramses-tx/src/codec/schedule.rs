//! Zone and DHW schedules (0404)
//!
//! A schedule travels as a zlib blob split into fragments of at most
//! [`MAX_FRAGMENT_LEN`] bytes. Each fragment carries a 7-byte header:
//!
//! ```text
//! zz 20 00 08 ll nn tt data...    zone zz (DHW uses 00 23 00 08)
//! ```
//!
//! where `ll` is the data length, `nn` the 1-based fragment number and `tt`
//! the fragment count. Writes repeat the zone index in the third byte.

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};

use super::*;
use crate::helpers::HexByte;

/// Most data bytes a single fragment carries
pub const MAX_FRAGMENT_LEN: usize = 41;

const HEADER_LEN: usize = 7;
const RECORD_LEN: usize = 20;
const ZONE_KIND: u8 = 0x20;
const DHW_KIND: u8 = 0x23;
const MAX_BLOB_LEN: usize = 16 * 1024;

/// Build the payload of a fragment request (`total` is `None` for the first one)
pub fn request_fragment(zone_idx: u8, dhw: bool, frag_number: u8, total: Option<u8>) -> Payload {
    Payload::ScheduleFragment(ScheduleFragment {
        zone_idx: HexByte(zone_idx),
        dhw,
        frag_number,
        total_frags: total,
        fragment: Vec::new(),
    })
}

/// Build the payload of a fragment write
pub fn write_fragment(zone_idx: u8, dhw: bool, frag_number: u8, total: u8, data: Vec<u8>) -> Payload {
    Payload::ScheduleFragment(ScheduleFragment {
        zone_idx: HexByte(zone_idx),
        dhw,
        frag_number,
        total_frags: Some(total),
        fragment: data,
    })
}

/// Compress a schedule and split it into fragment data blocks
pub fn schedule_to_fragments(schedule: &Schedule) -> Result<Vec<Vec<u8>>, CodecError> {
    let idx = if schedule.dhw { 0 } else { schedule.zone_idx.0 };
    let mut raw = Vec::new();
    for day in &schedule.days {
        if day.day_of_week > 6 {
            return Err(CodecError::invalid(
                Code::SCHEDULE,
                format!("day of week {} out of range", day.day_of_week),
            ));
        }
        for sp in &day.switchpoints {
            let value = match (&sp.value, schedule.dhw) {
                (SwitchpointValue::Enabled { enabled }, true) => u16::from(*enabled),
                (SwitchpointValue::Setpoint { heat_setpoint }, false)
                    if (5.0..=35.0).contains(heat_setpoint) =>
                {
                    (heat_setpoint * 100.0).round() as u16
                }
                (value, _) => {
                    return Err(CodecError::invalid(
                        Code::SCHEDULE,
                        format!("switchpoint value {value:?} does not suit this schedule"),
                    ))
                }
            };
            let mut record = [0u8; RECORD_LEN];
            record[4] = idx;
            record[8] = day.day_of_week;
            record[12..14].copy_from_slice(&sp.time_of_day.to_le_bytes());
            record[16..18].copy_from_slice(&value.to_le_bytes());
            raw.extend_from_slice(&record);
        }
    }

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
    encoder
        .write_all(&raw)
        .map_err(|e| CodecError::invalid(Code::SCHEDULE, format!("compressing schedule: {e}")))?;
    let mut blob = encoder
        .finish()
        .map_err(|e| CodecError::invalid(Code::SCHEDULE, format!("compressing schedule: {e}")))?;
    // controllers write a 16K-window header; the stream itself is unaffected
    blob[0] = 0x68;
    blob[1] = 0x81;

    let fragments: Vec<Vec<u8>> = blob.chunks(MAX_FRAGMENT_LEN).map(<[u8]>::to_vec).collect();
    if fragments.len() > usize::from(u8::MAX) {
        return Err(CodecError::invalid(Code::SCHEDULE, "schedule too large"));
    }
    Ok(fragments)
}

/// Join fragment data blocks (in order) and decode the schedule they carry
pub fn fragments_to_schedule(
    zone_idx: HexByte,
    dhw: bool,
    fragments: &[Vec<u8>],
) -> Result<Schedule, CodecError> {
    let blob = fragments.concat();
    let mut raw = Vec::new();
    ZlibDecoder::new(blob.as_slice())
        .take(MAX_BLOB_LEN as u64 + 1)
        .read_to_end(&mut raw)
        .map_err(|e| CodecError::Assembly {
            code: Code::SCHEDULE,
            reason: format!("bad schedule blob: {e}"),
        })?;
    if raw.len() > MAX_BLOB_LEN {
        return Err(CodecError::Assembly {
            code: Code::SCHEDULE,
            reason: "schedule blob too large".into(),
        });
    }
    if raw.len() % RECORD_LEN != 0 {
        return Err(CodecError::Assembly {
            code: Code::SCHEDULE,
            reason: format!("schedule length {} is not a whole number of records", raw.len()),
        });
    }

    let mut days: Vec<DaySchedule> = Vec::new();
    for record in raw.chunks(RECORD_LEN) {
        let dow = record[8];
        let time_of_day = u16::from_le_bytes([record[12], record[13]]);
        let value = u16::from_le_bytes([record[16], record[17]]);
        let value = if dhw {
            SwitchpointValue::Enabled { enabled: value != 0 }
        } else {
            SwitchpointValue::Setpoint {
                heat_setpoint: f64::from(value) / 100.0,
            }
        };
        let switchpoint = Switchpoint { time_of_day, value };
        match days.last_mut() {
            Some(day) if day.day_of_week == dow => day.switchpoints.push(switchpoint),
            _ => days.push(DaySchedule {
                day_of_week: dow,
                switchpoints: vec![switchpoint],
            }),
        }
    }
    Ok(Schedule { zone_idx, dhw, days })
}

/// Codec for 0404
pub(crate) struct ScheduleCodec;

impl PayloadCodec for ScheduleCodec {
    fn code(&self) -> Code {
        Code::SCHEDULE
    }

    fn name(&self) -> &'static str {
        "zone_schedule"
    }

    fn decode(&self, ctx: &DecodeContext, payload: &[u8]) -> Result<Decoded, CodecError> {
        if payload.len() < HEADER_LEN {
            return Err(CodecError::length(self.code(), payload.len()));
        }
        let dhw = match payload[1] {
            ZONE_KIND => false,
            DHW_KIND => true,
            other => {
                return Err(CodecError::invalid(
                    self.code(),
                    format!("unexpected schedule kind {other:02X}"),
                ))
            }
        };
        if payload[3] != 0x08 || (payload[2] != 0x00 && payload[2] != payload[0]) {
            return Err(CodecError::invalid(self.code(), "malformed fragment header"));
        }

        let data = &payload[HEADER_LEN..];
        let frag_len = usize::from(payload[4]);
        let frag_number = payload[5];
        let count = payload[6];
        let header_only = matches!(ctx.verb, Verb::Rq | Verb::I);
        if !header_only && !(count == 0xFF && data.is_empty()) && frag_len != data.len() {
            return Err(CodecError::invalid(
                self.code(),
                format!("fragment length {frag_len} but {} bytes follow", data.len()),
            ));
        }
        if header_only && !data.is_empty() {
            return Err(CodecError::length(self.code(), payload.len()));
        }

        let total_frags = match (ctx.verb, count) {
            (Verb::Rq | Verb::Rp, 0x00) | (Verb::Rp, 0xFF) => None,
            (_, count) => Some(count),
        };
        let fragment = ScheduleFragment {
            zone_idx: HexByte(payload[0]),
            dhw,
            frag_number,
            total_frags,
            fragment: data.to_vec(),
        };
        match (ctx.verb, total_frags) {
            (Verb::Rp, Some(total)) => {
                if frag_number == 0 || frag_number > total {
                    return Err(CodecError::invalid(
                        self.code(),
                        format!("fragment {frag_number} of {total}"),
                    ));
                }
                Ok(Decoded::Fragment(FragmentPart {
                    index: frag_number,
                    total: Some(total),
                    is_first: frag_number == 1,
                    is_final: frag_number == total,
                    payload: Payload::ScheduleFragment(fragment),
                }))
            }
            _ => Ok(Decoded::Complete(Payload::ScheduleFragment(fragment))),
        }
    }

    fn encode(&self, verb: Verb, payload: &Payload) -> Result<Vec<u8>, CodecError> {
        let Payload::ScheduleFragment(frag) = payload else {
            return Err(wrong_payload(self.code(), verb));
        };
        if frag.frag_number == 0 {
            return Err(CodecError::request(self.code(), verb, "fragments are numbered from 1"));
        }
        if frag.fragment.len() > MAX_FRAGMENT_LEN {
            return Err(CodecError::request(
                self.code(),
                verb,
                format!("fragment of {} bytes is too long", frag.fragment.len()),
            ));
        }
        let idx = frag.zone_idx.0;
        let (kind, repeat) = if frag.dhw {
            (DHW_KIND, 0x00)
        } else {
            (ZONE_KIND, idx)
        };
        let data_len = frag.fragment.len() as u8;
        let mut out = match verb {
            Verb::Rq => {
                let total = frag.total_frags.unwrap_or(0);
                if frag.frag_number == 1 && total != 0 {
                    return Err(CodecError::request(
                        self.code(),
                        verb,
                        "the first request must not carry a total",
                    ));
                }
                if total != 0 && frag.frag_number > total {
                    return Err(CodecError::request(self.code(), verb, "fragment beyond total"));
                }
                vec![idx, kind, 0x00, 0x08, 0x00, frag.frag_number, total]
            }
            Verb::Rp => vec![
                idx,
                kind,
                0x00,
                0x08,
                data_len,
                frag.frag_number,
                frag.total_frags.unwrap_or(0xFF),
            ],
            Verb::W | Verb::I => {
                let total = frag.total_frags.ok_or_else(|| {
                    CodecError::request(self.code(), verb, "writes need a fragment count")
                })?;
                vec![idx, kind, repeat, 0x08, data_len, frag.frag_number, total]
            }
        };
        if verb != Verb::I && verb != Verb::Rq {
            out.extend_from_slice(&frag.fragment);
        }
        Ok(out)
    }

    fn assemble(&self, parts: Vec<Payload>) -> Result<Payload, CodecError> {
        let mut zone = None;
        let mut blocks = Vec::with_capacity(parts.len());
        for (n, part) in parts.into_iter().enumerate() {
            let Payload::ScheduleFragment(frag) = part else {
                return Err(CodecError::Assembly {
                    code: self.code(),
                    reason: "fragment has the wrong payload type".to_string(),
                });
            };
            if usize::from(frag.frag_number) != n + 1 {
                return Err(CodecError::Assembly {
                    code: self.code(),
                    reason: format!("fragment {} missing", n + 1),
                });
            }
            zone.get_or_insert((frag.zone_idx, frag.dhw));
            blocks.push(frag.fragment);
        }
        let (zone_idx, dhw) = zone.ok_or_else(|| CodecError::Assembly {
            code: self.code(),
            reason: "no fragments".to_string(),
        })?;
        fragments_to_schedule(zone_idx, dhw, &blocks).map(Payload::Schedule)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::ctx;
    use super::*;

    fn sample() -> Schedule {
        let day = |dow: u8| DaySchedule {
            day_of_week: dow,
            switchpoints: vec![
                Switchpoint {
                    time_of_day: 6 * 60 + 30,
                    value: SwitchpointValue::Setpoint { heat_setpoint: 21.0 },
                },
                Switchpoint {
                    time_of_day: 8 * 60,
                    value: SwitchpointValue::Setpoint { heat_setpoint: 18.5 },
                },
                Switchpoint {
                    time_of_day: 17 * 60,
                    value: SwitchpointValue::Setpoint { heat_setpoint: 21.0 },
                },
                Switchpoint {
                    time_of_day: 22 * 60 + 30,
                    value: SwitchpointValue::Setpoint { heat_setpoint: 15.0 },
                },
            ],
        };
        Schedule {
            zone_idx: HexByte(1),
            dhw: false,
            days: (0..7).map(day).collect(),
        }
    }

    #[test]
    fn test_request_header() {
        let codec = ScheduleCodec;
        let first = codec.encode(Verb::Rq, &request_fragment(1, false, 1, None)).unwrap();
        assert_eq!(hex::encode_upper(first), "01200008000100");
        let next = codec.encode(Verb::Rq, &request_fragment(1, false, 2, Some(3))).unwrap();
        assert_eq!(hex::encode_upper(next), "01200008000203");
        let dhw = codec.encode(Verb::Rq, &request_fragment(0, true, 1, None)).unwrap();
        assert_eq!(hex::encode_upper(dhw), "00230008000100");
        assert!(codec.encode(Verb::Rq, &request_fragment(1, false, 1, Some(3))).is_err());
    }

    #[test]
    fn test_no_schedule_reply() {
        let ctx = ctx(Verb::Rp, "01:145038", Some("18:013393"));
        let decoded = ScheduleCodec
            .decode(&ctx, &hex::decode("002300080001FF").unwrap())
            .unwrap();
        let Decoded::Complete(Payload::ScheduleFragment(frag)) = decoded else {
            panic!("expected a complete fragment");
        };
        assert!(frag.dhw);
        assert_eq!(frag.total_frags, None);
    }

    #[test]
    fn test_reply_is_a_fragment_part() {
        let ctx = ctx(Verb::Rp, "01:145038", Some("18:006402"));
        let raw = hex::decode("012000080401030102A3").unwrap();
        // wrong length byte
        assert!(ScheduleCodec.decode(&ctx, &raw).is_err());

        let raw = hex::decode("0120000803010301020A").unwrap();
        let decoded = ScheduleCodec.decode(&ctx, &raw).unwrap();
        assert!(matches!(
            decoded,
            Decoded::Fragment(FragmentPart { index: 1, total: Some(3), is_final: false, .. })
        ));
        assert_eq!(ScheduleCodec.encode(Verb::Rp, decoded.payload()).unwrap(), raw);
    }

    #[test]
    fn test_schedule_survives_fragmentation() {
        let schedule = sample();
        let blocks = schedule_to_fragments(&schedule).unwrap();
        assert!(blocks.len() > 1);
        assert!(blocks.iter().all(|b| b.len() <= MAX_FRAGMENT_LEN));
        assert_eq!(blocks[0][0], 0x68);

        let total = blocks.len() as u8;
        let parts = blocks
            .iter()
            .enumerate()
            .map(|(i, b)| write_fragment(1, false, i as u8 + 1, total, b.clone()))
            .collect();
        let assembled = ScheduleCodec.assemble(parts).unwrap();
        assert_eq!(assembled, Payload::Schedule(schedule));
    }

    #[test]
    fn test_assemble_needs_every_fragment() {
        let blocks = schedule_to_fragments(&sample()).unwrap();
        let total = blocks.len() as u8;
        let parts = blocks
            .iter()
            .enumerate()
            .skip(1)
            .map(|(i, b)| write_fragment(1, false, i as u8 + 1, total, b.clone()))
            .collect();
        assert!(ScheduleCodec.assemble(parts).is_err());
    }

    #[test]
    fn test_dhw_schedule_values() {
        let schedule = Schedule {
            zone_idx: HexByte(0),
            dhw: true,
            days: vec![DaySchedule {
                day_of_week: 2,
                switchpoints: vec![
                    Switchpoint {
                        time_of_day: 300,
                        value: SwitchpointValue::Enabled { enabled: true },
                    },
                    Switchpoint {
                        time_of_day: 1320,
                        value: SwitchpointValue::Enabled { enabled: false },
                    },
                ],
            }],
        };
        let blocks = schedule_to_fragments(&schedule).unwrap();
        let decoded = fragments_to_schedule(HexByte(0), true, &blocks).unwrap();
        assert_eq!(decoded, schedule);

        let mut bad = schedule.clone();
        bad.days[0].switchpoints[0].value = SwitchpointValue::Setpoint { heat_setpoint: 20.0 };
        assert!(schedule_to_fragments(&bad).is_err());
    }

    #[test]
    fn test_write_and_ack() {
        let codec = ScheduleCodec;
        let payload = write_fragment(8, false, 1, 4, vec![0xAA; 3]);
        let raw = codec.encode(Verb::W, &payload).unwrap();
        assert_eq!(hex::encode_upper(&raw), "08200808030104AAAAAA");

        let ack = ctx(Verb::I, "01:076010", Some("30:042165"));
        let decoded = codec
            .decode(&ack, &hex::decode("08200808290104").unwrap())
            .unwrap();
        assert!(matches!(
            decoded,
            Decoded::Complete(Payload::ScheduleFragment(ScheduleFragment {
                frag_number: 1,
                total_frags: Some(4),
                ..
            }))
        ));
    }
}
