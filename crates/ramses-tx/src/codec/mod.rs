//! Payload codec registry
//!
//! Each registered code has a [`PayloadCodec`] that turns payload bytes into
//! a typed [`Payload`] (and back, for codes the gateway transmits). Codes
//! that can span several packets decode to a [`FragmentPart`]; the
//! [`FragmentBuffer`](crate::fragment::FragmentBuffer) collects the parts and
//! the codec's [`assemble`](PayloadCodec::assemble) merges them.

mod heat;
mod hvac;
pub mod payload;
pub mod schedule;
mod system;

use chrono::NaiveDateTime;
use std::collections::HashMap;

use crate::address::Address;
use crate::config::MAX_PAYLOAD_LEN;
use crate::error::CodecError;
use crate::packet::{Code, Packet, Verb};

pub use payload::*;

/// Addressing context a payload is interpreted in
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodeContext {
    pub verb: Verb,
    pub src: Address,
    pub dst: Option<Address>,
    pub dtm: NaiveDateTime,
}

impl DecodeContext {
    /// Context of a received packet
    pub fn from_packet(pkt: &Packet) -> Self {
        Self {
            verb: pkt.verb(),
            src: pkt.src(),
            dst: pkt.dst(),
            dtm: pkt.dtm(),
        }
    }

    /// True when the source addresses itself
    pub fn is_to_self(&self) -> bool {
        self.dst == Some(self.src)
    }

    /// True when the source device type is one of `types`
    pub fn src_type_in(&self, types: &[u8]) -> bool {
        types.contains(&self.src.dev_type())
    }
}

/// One part of a multi-packet payload
#[derive(Debug, Clone, PartialEq)]
pub struct FragmentPart {
    /// Ordering key within the set (fragment number, or first array index)
    pub index: u8,
    /// Declared number of parts, when the protocol carries one
    pub total: Option<u8>,
    /// True when this part is known to start the set
    pub is_first: bool,
    /// True when this part is known to end the set
    pub is_final: bool,
    pub payload: Payload,
}

/// Result of decoding one packet
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// The packet carries a complete payload
    Complete(Payload),
    /// The packet carries one part of a larger payload
    Fragment(FragmentPart),
}

impl Decoded {
    /// The payload carried by this packet alone
    pub fn payload(&self) -> &Payload {
        match self {
            Decoded::Complete(payload) => payload,
            Decoded::Fragment(part) => &part.payload,
        }
    }

    pub fn into_payload(self) -> Payload {
        match self {
            Decoded::Complete(payload) => payload,
            Decoded::Fragment(part) => part.payload,
        }
    }
}

/// Codec for one message code
pub trait PayloadCodec: Send + Sync {
    /// Code handled
    fn code(&self) -> Code;

    /// Human-readable message name
    fn name(&self) -> &'static str;

    /// Decode payload bytes in the given context
    fn decode(&self, ctx: &DecodeContext, payload: &[u8]) -> Result<Decoded, CodecError>;

    /// Encode a logical payload for transmission
    fn encode(&self, verb: Verb, _payload: &Payload) -> Result<Vec<u8>, CodecError> {
        Err(CodecError::request(self.code(), verb, "no encoder"))
    }

    /// Merge fragment payloads (in part order) into one payload
    fn assemble(&self, _parts: Vec<Payload>) -> Result<Payload, CodecError> {
        Err(CodecError::Assembly {
            code: self.code(),
            reason: "code is not fragmentable".to_string(),
        })
    }
}

/// Registry of payload codecs, keyed by code
pub struct Registry {
    codecs: HashMap<Code, Box<dyn PayloadCodec>>,
}

impl Registry {
    /// Registry with no codecs
    pub fn empty() -> Self {
        Self {
            codecs: HashMap::new(),
        }
    }

    /// Registry with every built-in codec
    pub fn new() -> Self {
        let mut registry = Self::empty();
        system::register(&mut registry);
        heat::register(&mut registry);
        hvac::register(&mut registry);
        registry
    }

    /// Add (or replace) a codec, returning the one it replaced
    pub fn register<C: PayloadCodec + 'static>(
        &mut self,
        codec: C,
    ) -> Option<Box<dyn PayloadCodec>> {
        self.codecs.insert(codec.code(), Box::new(codec))
    }

    pub fn contains(&self, code: Code) -> bool {
        self.codecs.contains_key(&code)
    }

    /// Message name for a code
    pub fn name(&self, code: Code) -> &'static str {
        self.codecs.get(&code).map_or("unknown", |c| c.name())
    }

    /// Registered codes, in ascending order
    pub fn codes(&self) -> Vec<Code> {
        let mut codes: Vec<Code> = self.codecs.keys().copied().collect();
        codes.sort();
        codes
    }

    /// Decode a payload; unregistered codes yield an opaque payload
    pub fn decode(
        &self,
        code: Code,
        ctx: &DecodeContext,
        payload: &[u8],
    ) -> Result<Decoded, CodecError> {
        match self.codecs.get(&code) {
            Some(codec) => codec.decode(ctx, payload),
            None => Ok(Decoded::Complete(Payload::Opaque(Opaque {
                payload: payload.to_vec(),
            }))),
        }
    }

    /// Decode the payload of a packet
    pub fn decode_packet(&self, pkt: &Packet) -> Result<Decoded, CodecError> {
        self.decode(pkt.code(), &DecodeContext::from_packet(pkt), pkt.payload())
    }

    /// Encode a logical payload
    ///
    /// Context-only requests and opaque payloads pass through unchanged,
    /// but only for registered codes.
    pub fn encode(&self, code: Code, verb: Verb, payload: &Payload) -> Result<Vec<u8>, CodecError> {
        let codec = self.codecs.get(&code).ok_or(CodecError::UnknownCode(code))?;
        let bytes = match payload {
            Payload::Request(req) if verb == Verb::Rq => req.context.clone(),
            Payload::Opaque(raw) => raw.payload.clone(),
            _ => codec.encode(verb, payload)?,
        };
        if bytes.is_empty() || bytes.len() > MAX_PAYLOAD_LEN {
            return Err(CodecError::length(code, bytes.len()));
        }
        Ok(bytes)
    }

    /// Merge fragment payloads into one payload
    pub fn assemble(&self, code: Code, parts: Vec<Payload>) -> Result<Payload, CodecError> {
        let codec = self.codecs.get(&code).ok_or(CodecError::UnknownCode(code))?;
        codec.assemble(parts)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("codes", &self.codes())
            .finish()
    }
}

/// True when a packet of `len` bytes is an array of `elem`-byte records
///
/// Arrays are only ever broadcast (`I`) by the listed device types.
pub(crate) fn is_array(ctx: &DecodeContext, len: usize, elem: usize, src_types: &[u8]) -> bool {
    ctx.verb == Verb::I && ctx.src_type_in(src_types) && len != elem && len % elem == 0
}

/// Split an array payload into records, checking its length
pub(crate) fn records(code: Code, payload: &[u8], elem: usize) -> Result<std::slice::Chunks<'_, u8>, CodecError> {
    if payload.is_empty() || payload.len() % elem != 0 {
        return Err(CodecError::length(code, payload.len()));
    }
    Ok(payload.chunks(elem))
}

/// Wrap an array result: a completely filled packet may be continued by the next one
///
/// Record indices are unique and ascending, so a part whose first index is at
/// least a full packet's worth of records must follow an earlier part.
pub(crate) fn array_part(len: usize, elem: usize, first_idx: u8, payload: Payload) -> Decoded {
    Decoded::Fragment(FragmentPart {
        index: first_idx,
        total: None,
        is_first: usize::from(first_idx) < MAX_PAYLOAD_LEN / elem,
        is_final: len < MAX_PAYLOAD_LEN,
        payload,
    })
}

/// Merge array fragments, ordered by record index (later parts win on clashes)
pub(crate) fn merge_records<T: Clone>(
    code: Code,
    parts: Vec<Payload>,
    extract: impl Fn(Payload) -> Option<Vec<T>>,
    key: impl Fn(&T) -> u8,
) -> Result<Vec<T>, CodecError> {
    let mut merged: std::collections::BTreeMap<u8, T> = std::collections::BTreeMap::new();
    for part in parts {
        let records = extract(part).ok_or_else(|| CodecError::Assembly {
            code,
            reason: "fragment has the wrong payload type".to_string(),
        })?;
        for record in records {
            merged.insert(key(&record), record);
        }
    }
    Ok(merged.into_values().collect())
}

/// Decode a percentage byte, mapping range errors to the code
pub(crate) fn percent(code: Code, byte: u8) -> Result<Option<f64>, CodecError> {
    crate::helpers::decode_percent(byte, true).map_err(|e| CodecError::invalid(code, e))
}

/// A context-only request
pub(crate) fn request(payload: &[u8]) -> Decoded {
    Decoded::Complete(Payload::request(payload))
}

/// Error for a payload variant that does not belong to the codec
pub(crate) fn wrong_payload(code: Code, verb: Verb) -> CodecError {
    CodecError::request(code, verb, "payload type does not match code")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helpers::HexByte;
    use crate::packet::parse_line;
    use chrono::NaiveDate;

    pub(crate) fn ctx(verb: Verb, src: &str, dst: Option<&str>) -> DecodeContext {
        DecodeContext {
            verb,
            src: src.parse().unwrap(),
            dst: dst.map(|d| d.parse().unwrap()),
            dtm: NaiveDate::from_ymd_opt(2024, 1, 1)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap(),
        }
    }

    fn decode_line(line: &str) -> Result<Decoded, CodecError> {
        let now = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let pkt = parse_line(line, now).unwrap().unwrap();
        Registry::new().decode_packet(&pkt)
    }

    #[test]
    fn test_unknown_code_decodes_opaque() {
        let decoded = decode_line(" I --- 01:145038 --:------ 01:145038 7FFF 002 ABCD").unwrap();
        assert_eq!(
            decoded,
            Decoded::Complete(Payload::Opaque(Opaque {
                payload: vec![0xAB, 0xCD]
            }))
        );
        assert_eq!(Registry::new().name(Code(0x7FFF)), "unknown");
    }

    #[test]
    fn test_unknown_code_cannot_encode() {
        let registry = Registry::new();
        let err = registry
            .encode(Code(0x7FFF), Verb::Rq, &Payload::request(vec![0x00]))
            .unwrap_err();
        assert_eq!(err, CodecError::UnknownCode(Code(0x7FFF)));
    }

    #[test]
    fn test_ufh_setpoint_array() {
        let decoded = decode_line(
            "045  I --- 02:001107 --:------ 02:001107 22C9 024 0008340A28010108340A28010208340A28010308340A2801",
        )
        .unwrap();
        let Payload::UfhSetpoints(records) = decoded.payload() else {
            panic!("unexpected payload: {decoded:?}");
        };
        assert_eq!(records.len(), 4);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.ufh_idx, HexByte(i as u8));
            assert_eq!(record.setpoint_bounds, (Some(21.0), Some(26.0)));
            assert_eq!(record.mode, UfhMode::Heat);
        }
        // not full, so nothing can follow it
        assert!(matches!(decoded, Decoded::Fragment(FragmentPart { is_final: true, .. })));
    }

    #[test]
    fn test_ufh_setpoint_single_eight_byte_form() {
        let line = "...  I --- 02:250708 21:064743 --:------ 22C9 008 0307D07FFF020203";
        let decoded = decode_line(line).unwrap();
        assert_eq!(
            decoded,
            Decoded::Complete(Payload::UfhSetpoints(vec![UfhSetpoint {
                ufh_idx: HexByte(3),
                mode: UfhMode::Cool,
                setpoint_bounds: (Some(20.0), None),
            }]))
        );

        // the suffix must repeat the mode and end in 03
        let line = " I --- 02:250708 21:064743 --:------ 22C9 008 0307D07FFF020200";
        assert!(decode_line(line).is_err());
    }

    #[test]
    fn test_registry_lists_codes() {
        let registry = Registry::new();
        for code in [
            Code::ZONE_NAME,
            Code::SCHEDULE,
            Code::FAULT_LOG,
            Code::RF_BIND,
            Code::UFH_SETPOINT,
            Code::ZONE_MODE,
            Code::FAN_STATE,
        ] {
            assert!(registry.contains(code), "{code}");
        }
        assert_eq!(registry.name(Code::UFH_SETPOINT), "ufh_setpoint");
    }
}
