//! Packet framing
//!
//! Converts one line of gateway output into a validated [`Packet`], and a
//! packet back into its wire form for transmission. A line looks like:
//!
//! ```text
//! 2024-01-01T10:00:00.123456 045  I --- 02:001107 --:------ 02:001107 22C9 024 0008340A2801...
//! ```
//!
//! The timestamp and signal strength are optional; comments (`#`), gateway
//! errors (`*`) and hints (`<`) after the payload are ignored.

use bytes::Bytes;
use chrono::{NaiveDateTime, NaiveTime};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::address::Address;
use crate::config::MAX_PAYLOAD_LEN;
use crate::error::FramingError;

/// Message verb
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Verb {
    /// Information (unsolicited broadcast or announcement)
    I,
    /// Write
    W,
    /// Request
    Rq,
    /// Response
    Rp,
}

impl Verb {
    /// Verb without padding
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::I => "I",
            Verb::W => "W",
            Verb::Rq => "RQ",
            Verb::Rp => "RP",
        }
    }
}

impl fmt::Display for Verb {
    /// Two-character wire form (` I`, ` W`, `RQ`, `RP`)
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:>2}", self.as_str())
    }
}

impl FromStr for Verb {
    type Err = FramingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "I" => Ok(Verb::I),
            "W" => Ok(Verb::W),
            "RQ" => Ok(Verb::Rq),
            "RP" => Ok(Verb::Rp),
            other => Err(FramingError::VerbMalformed(other.to_string())),
        }
    }
}

impl Serialize for Verb {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Verb {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Message code (4 hex digits)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Code(pub u16);

impl Code {
    pub const ZONE_NAME: Code = Code(0x0004);
    pub const SYSTEM_ZONES: Code = Code(0x0005);
    pub const SCHEDULE_VERSION: Code = Code(0x0006);
    pub const RELAY_DEMAND: Code = Code(0x0008);
    pub const ZONE_PARAMS: Code = Code(0x000A);
    pub const ZONE_DEVICES: Code = Code(0x000C);
    pub const SCHEDULE: Code = Code(0x0404);
    pub const FAULT_LOG: Code = Code(0x0418);
    pub const BATTERY_STATE: Code = Code(0x1060);
    pub const DEVICE_INFO: Code = Code(0x10E0);
    pub const SYSTEM_SYNC: Code = Code(0x1F09);
    pub const RF_BIND: Code = Code(0x1FC9);
    pub const UFH_SETPOINT: Code = Code(0x22C9);
    pub const FAN_MODE: Code = Code(0x22F1);
    pub const SETPOINT: Code = Code(0x2309);
    pub const ZONE_MODE: Code = Code(0x2349);
    pub const TEMPERATURE: Code = Code(0x30C9);
    pub const HEAT_DEMAND: Code = Code(0x3150);
    pub const DATETIME: Code = Code(0x313F);
    pub const FAN_STATE: Code = Code(0x31D9);
    pub const ACTUATOR_STATE: Code = Code(0x3EF0);
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}", self.0)
    }
}

impl FromStr for Code {
    type Err = FramingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 4 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(FramingError::CodeMalformed(s.to_string()));
        }
        u16::from_str_radix(s, 16)
            .map(Code)
            .map_err(|_| FramingError::CodeMalformed(s.to_string()))
    }
}

impl Serialize for Code {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Code {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A validated RAMSES-II frame
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    dtm: NaiveDateTime,
    rssi: Option<u16>,
    verb: Verb,
    seqn: Option<u16>,
    addrs: [Option<Address>; 3],
    src: Address,
    dst: Option<Address>,
    code: Code,
    payload: Bytes,
}

impl Packet {
    /// Build a packet, validating the address set and payload length
    pub fn new(
        dtm: NaiveDateTime,
        verb: Verb,
        addrs: [Option<Address>; 3],
        code: Code,
        payload: impl Into<Bytes>,
    ) -> Result<Self, FramingError> {
        let payload = payload.into();
        if payload.is_empty() {
            return Err(FramingError::MissingField("payload"));
        }
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(FramingError::PayloadTooLong(payload.len()));
        }
        let (src, dst) = resolve_addrs(&addrs)?;
        Ok(Self {
            dtm,
            rssi: None,
            verb,
            seqn: None,
            addrs,
            src,
            dst,
            code,
            payload,
        })
    }

    /// Set the sequence number
    pub fn with_seqn(mut self, seqn: Option<u16>) -> Self {
        self.seqn = seqn;
        self
    }

    /// Set the received signal strength
    pub fn with_rssi(mut self, rssi: Option<u16>) -> Self {
        self.rssi = rssi;
        self
    }

    /// Timestamp (from the line, or the time it was received)
    pub fn dtm(&self) -> NaiveDateTime {
        self.dtm
    }

    /// Received signal strength, if reported
    pub fn rssi(&self) -> Option<u16> {
        self.rssi
    }

    pub fn verb(&self) -> Verb {
        self.verb
    }

    pub fn seqn(&self) -> Option<u16> {
        self.seqn
    }

    /// The three address slots as they appear on the wire
    pub fn addrs(&self) -> [Option<Address>; 3] {
        self.addrs
    }

    /// Source: the first non-null slot
    pub fn src(&self) -> Address {
        self.src
    }

    /// Destination: the second non-null slot, or the source if sent to itself
    pub fn dst(&self) -> Option<Address> {
        self.dst
    }

    /// True when a device addresses itself (e.g. `01:xxx --:------ 01:xxx`)
    pub fn is_to_self(&self) -> bool {
        self.dst == Some(self.src)
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Frame for transmission, without timestamp or signal strength
    ///
    /// `RQ --- 18:000730 01:145038 --:------ 0004 002 0100`
    pub fn frame(&self) -> String {
        let seqn = self
            .seqn
            .map_or_else(|| "---".to_string(), |n| format!("{n:03}"));
        format!(
            "{} {} {} {} {} {} {:03} {}",
            self.verb,
            seqn,
            Address::slot(self.addrs[0]),
            Address::slot(self.addrs[1]),
            Address::slot(self.addrs[2]),
            self.code,
            self.payload.len(),
            hex::encode_upper(&self.payload)
        )
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rssi = self
            .rssi
            .map_or_else(|| "...".to_string(), |r| format!("{r:03}"));
        write!(
            f,
            "{} {} {}",
            self.dtm.format("%Y-%m-%dT%H:%M:%S%.6f"),
            rssi,
            self.frame()
        )
    }
}

/// Apply the address-set rules, returning (src, dst)
///
/// Valid layouts are `[dev, --, dev]`, `[dev, other dev, --]` and
/// `[--, --, dev]`; the broadcast address is never a source.
fn resolve_addrs(addrs: &[Option<Address>; 3]) -> Result<(Address, Option<Address>), FramingError> {
    let invalid = || {
        FramingError::AddressSetInvalid(
            addrs
                .iter()
                .map(|a| Address::slot(*a))
                .collect::<Vec<_>>()
                .join(" "),
        )
    };
    let first_ok = addrs[0].is_some_and(|a| !a.is_broadcast());
    let valid = match addrs {
        [Some(_), None, Some(_)] => first_ok,
        [Some(a0), Some(a1), None] => first_ok && a0 != a1,
        [None, None, Some(a2)] => !a2.is_broadcast(),
        _ => false,
    };
    if !valid {
        return Err(invalid());
    }
    let mut devices = addrs.iter().flatten().copied();
    let src = devices.next().ok_or_else(invalid)?;
    Ok((src, devices.next()))
}

/// Frame one line of gateway output
///
/// Returns `Ok(None)` for blank lines and pure comments. `received` stamps
/// lines that carry no timestamp of their own (a bare time-of-day takes its
/// date from `received`).
pub fn parse_line(line: &str, received: NaiveDateTime) -> Result<Option<Packet>, FramingError> {
    let line = strip_annotations(line);
    let mut tokens = line.split_whitespace().peekable();
    let Some(&first) = tokens.peek() else {
        return Ok(None);
    };

    let mut dtm = received;
    if looks_like_timestamp(first) {
        dtm = parse_timestamp(first, received)?;
        tokens.next();
    }

    let mut rssi = None;
    if let Some(&token) = tokens.peek() {
        if token == "..." || (token.len() == 3 && token.bytes().all(|b| b.is_ascii_digit())) {
            rssi = token.parse().ok();
            tokens.next();
        } else if token == "---" {
            // a bare `---` here is the RSSI slot only when followed by a verb
            let mut ahead = tokens.clone();
            ahead.next();
            if ahead.peek().is_some_and(|t| t.parse::<Verb>().is_ok()) {
                tokens.next();
            }
        }
    }

    let verb: Verb = tokens
        .next()
        .ok_or(FramingError::MissingField("verb"))?
        .parse()?;

    let seqn = match tokens.next().ok_or(FramingError::MissingField("sequence"))? {
        "---" => None,
        s if s.len() == 3 && s.bytes().all(|b| b.is_ascii_digit()) => s.parse().ok(),
        s => return Err(FramingError::SequenceMalformed(s.to_string())),
    };

    let mut addrs = [None; 3];
    for slot in addrs.iter_mut() {
        let token = tokens.next().ok_or(FramingError::MissingField("address"))?;
        *slot = Address::parse_slot(token)?;
    }

    let code: Code = tokens
        .next()
        .ok_or(FramingError::MissingField("code"))?
        .parse()?;

    let len_token = tokens.next().ok_or(FramingError::MissingField("length"))?;
    if len_token.len() != 3 || !len_token.bytes().all(|b| b.is_ascii_digit()) {
        return Err(FramingError::LengthMalformed(len_token.to_string()));
    }
    let declared: usize = len_token
        .parse()
        .map_err(|_| FramingError::LengthMalformed(len_token.to_string()))?;

    let payload_hex = tokens.next().ok_or(FramingError::MissingField("payload"))?;
    if payload_hex.len() % 2 != 0 {
        return Err(FramingError::OddLengthPayload(payload_hex.len()));
    }
    let payload = hex::decode(payload_hex)?;
    if payload.len() != declared {
        return Err(FramingError::LengthMismatch {
            declared,
            actual: payload.len(),
        });
    }

    Packet::new(dtm, verb, addrs, code, payload)
        .map(|pkt| Some(pkt.with_rssi(rssi).with_seqn(seqn)))
}

/// Drop trailing comments, gateway error reports and hints
fn strip_annotations(line: &str) -> &str {
    let end = line.find(['#', '*', '<']).unwrap_or(line.len());
    line[..end].trim()
}

fn looks_like_timestamp(token: &str) -> bool {
    let bytes = token.as_bytes();
    // full ISO datetime, or a bare time-of-day such as 16:27:56.942
    (bytes.len() >= 10 && bytes[4] == b'-')
        || (bytes.len() >= 8 && bytes[2] == b':' && bytes[5] == b':')
}

fn parse_timestamp(token: &str, received: NaiveDateTime) -> Result<NaiveDateTime, FramingError> {
    if token.as_bytes().get(4) == Some(&b'-') {
        return token
            .parse::<NaiveDateTime>()
            .map_err(|_| FramingError::TimestampMalformed(token.to_string()));
    }
    NaiveTime::parse_from_str(token, "%H:%M:%S%.f")
        .map(|time| received.date().and_time(time))
        .map_err(|_| FramingError::TimestampMalformed(token.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    #[test]
    fn test_parse_full_line() {
        let line = "2024-01-01T10:00:00.123456 045  I --- 02:001107 --:------ 02:001107 22C9 024 0008340A28010108340A28010208340A28010308340A2801";
        let pkt = parse_line(line, now()).unwrap().unwrap();
        assert_eq!(pkt.verb(), Verb::I);
        assert_eq!(pkt.rssi(), Some(45));
        assert_eq!(pkt.code(), Code::UFH_SETPOINT);
        assert_eq!(pkt.len(), 24);
        assert_eq!(pkt.src().to_string(), "02:001107");
        assert!(pkt.is_to_self());
        assert_eq!(pkt.dtm().to_string(), "2024-01-01 10:00:00.123456");
    }

    #[test]
    fn test_parse_without_timestamp_or_rssi() {
        let pkt = parse_line("RQ --- 18:000730 01:145038 --:------ 0004 002 0100", now())
            .unwrap()
            .unwrap();
        assert_eq!(pkt.dtm(), now());
        assert_eq!(pkt.rssi(), None);
        assert_eq!(pkt.src(), Address::GATEWAY);
        assert_eq!(pkt.dst().unwrap().to_string(), "01:145038");
    }

    #[test]
    fn test_parse_time_of_day_and_comment() {
        let line = "16:27:56.942 --- RP --- 01:145038 18:000730 --:------ 0006 004 00050008 # version";
        let pkt = parse_line(line, now()).unwrap().unwrap();
        assert_eq!(pkt.dtm().to_string(), "2024-01-01 16:27:56.942");
        assert_eq!(pkt.verb(), Verb::Rp);
        assert_eq!(pkt.payload().as_ref(), &[0x00, 0x05, 0x00, 0x08]);
    }

    #[test]
    fn test_blank_and_comment_lines() {
        assert!(parse_line("", now()).unwrap().is_none());
        assert!(parse_line("   # just a comment", now()).unwrap().is_none());
    }

    #[test]
    fn test_length_mismatch() {
        let line = "045  I --- 02:001107 --:------ 02:001107 22C9 024 0008340A28010108340A28010208340A28010308";
        assert_eq!(
            parse_line(line, now()).unwrap_err(),
            FramingError::LengthMismatch {
                declared: 24,
                actual: 20
            }
        );
    }

    #[test]
    fn test_malformed_fields() {
        let bad_code = "045  I --- 02:001107 --:------ 02:001107 22G9 001 00";
        assert!(matches!(
            parse_line(bad_code, now()),
            Err(FramingError::CodeMalformed(_))
        ));

        let odd = "045  I --- 02:001107 --:------ 02:001107 22C9 001 000";
        assert_eq!(
            parse_line(odd, now()).unwrap_err(),
            FramingError::OddLengthPayload(3)
        );

        let not_hex = "045  I --- 02:001107 --:------ 02:001107 22C9 001 0Z";
        assert!(matches!(
            parse_line(not_hex, now()),
            Err(FramingError::PayloadNotHex(_))
        ));

        let verb = "045 XX --- 02:001107 --:------ 02:001107 22C9 001 00";
        assert!(matches!(
            parse_line(verb, now()),
            Err(FramingError::VerbMalformed(_))
        ));

        let truncated = "045  I --- 02:001107 --:------";
        assert_eq!(
            parse_line(truncated, now()).unwrap_err(),
            FramingError::MissingField("address")
        );
    }

    #[test]
    fn test_address_layouts() {
        let ok = [
            " I --- 01:145038 --:------ 01:145038 1F09 003 FF04B5",
            "RQ --- 18:000730 01:145038 --:------ 0006 001 00",
            " I --- --:------ --:------ 10:105624 1FD4 003 000C6E",
        ];
        for line in ok {
            assert!(parse_line(line, now()).is_ok(), "{line}");
        }

        let bad = [
            "RQ --- 18:000730 18:000730 --:------ 0006 001 00",
            " I --- --:------ 01:145038 --:------ 0006 001 00",
            " I --- 63:262142 --:------ 63:262142 0006 001 00",
            " I --- --:------ --:------ 63:262142 1FD4 003 000C6E",
            " I --- 01:145038 01:145038 01:145038 0006 001 00",
        ];
        for line in bad {
            assert!(
                matches!(parse_line(line, now()), Err(FramingError::AddressSetInvalid(_))),
                "{line}"
            );
        }

        let pkt = parse_line(ok[2], now()).unwrap().unwrap();
        assert_eq!(pkt.src().to_string(), "10:105624");
        assert_eq!(pkt.dst(), None);
    }

    #[test]
    fn test_frame_round_trip() {
        let line = "RQ --- 18:000730 01:145038 --:------ 0004 002 0100";
        let pkt = parse_line(line, now()).unwrap().unwrap();
        assert_eq!(pkt.frame(), line);

        let line = " W 123 18:000730 01:145038 --:------ 2309 003 0107D0";
        let pkt = parse_line(line, now()).unwrap().unwrap();
        assert_eq!(pkt.seqn(), Some(123));
        assert_eq!(pkt.frame(), line);
    }

    #[test]
    fn test_payload_too_long() {
        let payload = "00".repeat(49);
        let line = format!(" I --- 01:145038 --:------ 01:145038 000A 049 {payload}");
        assert_eq!(
            parse_line(&line, now()).unwrap_err(),
            FramingError::PayloadTooLong(49)
        );
    }
}
