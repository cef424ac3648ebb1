//! Conversions between payload fields and native values
//!
//! Decoders return `Ok(None)` for the protocol's "absent" sentinels and
//! `Err(reason)` for values outside the field's domain.

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// A single payload byte rendered as two hex digits (zone indices, domain ids)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct HexByte(pub u8);

impl HexByte {
    /// Raw value
    pub fn value(self) -> u8 {
        self.0
    }
}

impl From<u8> for HexByte {
    fn from(value: u8) -> Self {
        HexByte(value)
    }
}

impl fmt::Display for HexByte {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}", self.0)
    }
}

impl std::str::FromStr for HexByte {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 2 {
            return Err(format!("expecting 2 hex digits: {s}"));
        }
        u8::from_str_radix(s, 16)
            .map(HexByte)
            .map_err(|e| format!("{s}: {e}"))
    }
}

impl Serialize for HexByte {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for HexByte {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Serde adapter for byte vectors as uppercase hex strings
pub mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode_upper(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

/// Decode a signed centi-degree temperature; `7FFF`, `7EFF` and `31FF` are absent
pub fn decode_temp(bytes: [u8; 2]) -> Option<f64> {
    match bytes {
        [0x7F, 0xFF] | [0x7E, 0xFF] | [0x31, 0xFF] => None,
        _ => Some(f64::from(i16::from_be_bytes(bytes)) / 100.0),
    }
}

/// Encode a temperature; absent is `7FFF`
pub fn encode_temp(value: Option<f64>) -> [u8; 2] {
    match value {
        None => [0x7F, 0xFF],
        Some(temp) => ((temp * 100.0).round() as i16).to_be_bytes(),
    }
}

/// Read a temperature at `offset`
pub fn temp_at(payload: &[u8], offset: usize) -> Option<f64> {
    decode_temp([payload[offset], payload[offset + 1]])
}

/// Decode a demand/level byte as a fraction in `0.0..=1.0`
///
/// `EF` and `Fx` are absent (no value, or a fault). A few devices report
/// values slightly over full scale, which are clamped.
pub fn decode_percent(byte: u8, high_res: bool) -> Result<Option<f64>, String> {
    if byte == 0xEF || byte & 0xF0 == 0xF0 {
        return Ok(None);
    }
    let scale = if high_res { 200.0 } else { 100.0 };
    let value = f64::from(byte) / scale;
    match value {
        v if v <= 1.0 => Ok(Some(v)),
        v if high_res && byte <= 0xCA => Ok(Some(v.min(1.0))),
        _ => Err(format!("percentage out of range: {byte:02X}")),
    }
}

/// Encode a fraction; absent is `EF`
pub fn encode_percent(value: Option<f64>, high_res: bool) -> u8 {
    let scale = if high_res { 200.0 } else { 100.0 };
    match value {
        None => 0xEF,
        Some(v) => (v.clamp(0.0, 1.0) * scale).round() as u8,
    }
}

/// Decode printable ASCII, dropping padding and control bytes
pub fn decode_str(bytes: &[u8]) -> String {
    bytes
        .iter()
        .filter(|b| (0x20..0x7F).contains(*b))
        .map(|&b| b as char)
        .collect::<String>()
        .trim_end()
        .to_string()
}

/// Encode a string into a fixed-width, zero-padded field
pub fn encode_str(value: &str, width: usize) -> Vec<u8> {
    let mut out: Vec<u8> = value
        .bytes()
        .filter(|b| (0x20..0x7F).contains(b))
        .take(width)
        .collect();
    out.resize(width, 0x00);
    out
}

/// Decode a 6- or 7-byte datetime `[sec] min hour day month year(2)`; all `FF` is absent
pub fn decode_dtm(bytes: &[u8]) -> Result<Option<NaiveDateTime>, String> {
    let (sec, rest) = match bytes.len() {
        7 => (bytes[0] & 0x7F, &bytes[1..]),
        6 => (0, bytes),
        len => return Err(format!("datetime must be 6 or 7 bytes, got {len}")),
    };
    if rest.iter().all(|&b| b == 0xFF) {
        return Ok(None);
    }
    let year = i32::from(u16::from_be_bytes([rest[4], rest[5]]));
    NaiveDate::from_ymd_opt(year, u32::from(rest[3]), u32::from(rest[2]))
        .and_then(|d| d.and_hms_opt(u32::from(rest[1] & 0x1F), u32::from(rest[0]), u32::from(sec)))
        .map(Some)
        .ok_or_else(|| format!("invalid datetime: {}", hex::encode_upper(bytes)))
}

/// Encode a datetime as 6 (no seconds) or 7 bytes; absent is all `FF`
pub fn encode_dtm(value: Option<NaiveDateTime>, with_seconds: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(7);
    match value {
        None => out.resize(if with_seconds { 7 } else { 6 }, 0xFF),
        Some(dtm) => {
            if with_seconds {
                out.push(dtm.second() as u8);
            }
            out.push(dtm.minute() as u8);
            out.push(dtm.hour() as u8);
            out.push(dtm.day() as u8);
            out.push(dtm.month() as u8);
            out.extend_from_slice(&(dtm.year() as u16).to_be_bytes());
        }
    }
    out
}

/// Decode a 4-byte date `day month year(2)`; `FFFFFFFF` is absent
pub fn decode_date(bytes: [u8; 4]) -> Result<Option<NaiveDate>, String> {
    if bytes == [0xFF; 4] {
        return Ok(None);
    }
    let year = i32::from(u16::from_be_bytes([bytes[2], bytes[3]]));
    NaiveDate::from_ymd_opt(year, u32::from(bytes[1]), u32::from(bytes[0] & 0x1F))
        .map(Some)
        .ok_or_else(|| format!("invalid date: {}", hex::encode_upper(bytes)))
}

/// Encode a date; absent is `FFFFFFFF`
pub fn encode_date(value: Option<NaiveDate>) -> [u8; 4] {
    match value {
        None => [0xFF; 4],
        Some(date) => {
            let year = (date.year() as u16).to_be_bytes();
            [date.day() as u8, date.month() as u8, year[0], year[1]]
        }
    }
}

const DTS_NULL: [u8; 6] = [0x00, 0x00, 0x00, 0x00, 0x00, 0x7F];

/// Decode a packed 48-bit timestamp (fault log); `00000000007F` is absent
pub fn decode_dts(bytes: [u8; 6]) -> Result<Option<NaiveDateTime>, String> {
    if bytes == DTS_NULL {
        return Ok(None);
    }
    let v = bytes.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b));
    let field = |shift: u32, mask: u64| ((v >> shift) & mask) as u32;
    NaiveDate::from_ymd_opt(2000 + field(24, 0x7F) as i32, field(36, 0x0F), field(31, 0x1F))
        .and_then(|d| d.and_hms_opt(field(19, 0x1F), field(13, 0x3F), field(7, 0x3F)))
        .map(Some)
        .ok_or_else(|| format!("invalid timestamp: {}", hex::encode_upper(bytes)))
}

/// Encode a packed 48-bit timestamp; absent is `00000000007F`
pub fn encode_dts(value: Option<NaiveDateTime>) -> [u8; 6] {
    let Some(dtm) = value else {
        return DTS_NULL;
    };
    let v = (u64::from(dtm.month()) << 36)
        | (u64::from(dtm.day()) << 31)
        | ((u64::from(dtm.year().max(2000) as u32) - 2000) & 0x7F) << 24
        | (u64::from(dtm.hour()) << 19)
        | (u64::from(dtm.minute()) << 13)
        | (u64::from(dtm.second()) << 7)
        | 0x7F;
    let b = v.to_be_bytes();
    [b[2], b[3], b[4], b[5], b[6], b[7]]
}
