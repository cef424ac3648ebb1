//! Decoded messages
//!
//! A [`Message`] is a packet together with its decoded payload. The
//! [`MessageDecoder`] turns lines (or packets) into messages, running multi-part
//! payloads through the [`FragmentBuffer`] so that a completed set is delivered
//! as one assembled message after its parts.

use chrono::NaiveDateTime;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::address::Address;
use crate::codec::{Decoded, Payload, Registry};
use crate::config::FragmentConfig;
use crate::error::{CodecError, FramingError};
use crate::fragment::{FragmentBuffer, FragmentKey, FragmentStatus, ResolvedSet};
use crate::packet::{parse_line, Code, Packet, Verb};

/// Position of a per-packet part within a larger payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FragmentInfo {
    pub index: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u8>,
}

/// How an assembled payload was put together
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AssemblyInfo {
    pub parts: usize,
    /// True when the set was released before it completed
    pub expired: bool,
}

/// A decoded message
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub dtm: NaiveDateTime,
    pub verb: Verb,
    pub src: Address,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dst: Option<Address>,
    pub code: Code,
    pub name: &'static str,
    pub payload: Payload,
    /// Set when this message is one part of a larger payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fragment: Option<FragmentInfo>,
    /// Set when this message merges several parts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assembly: Option<AssemblyInfo>,
    #[serde(skip)]
    packet: Packet,
}

impl Message {
    /// A message for a packet decoded on its own
    pub fn new(packet: Packet, name: &'static str, payload: Payload) -> Self {
        Self {
            dtm: packet.dtm(),
            verb: packet.verb(),
            src: packet.src(),
            dst: packet.dst(),
            code: packet.code(),
            name,
            payload,
            fragment: None,
            assembly: None,
            packet,
        }
    }

    fn with_fragment(mut self, info: FragmentInfo) -> Self {
        self.fragment = Some(info);
        self
    }

    fn with_assembly(mut self, info: AssemblyInfo) -> Self {
        self.assembly = Some(info);
        self
    }

    /// The (last) packet this message was decoded from
    pub fn packet(&self) -> &Packet {
        &self.packet
    }

    /// True for a part that still awaits its siblings
    pub fn is_fragment(&self) -> bool {
        self.fragment.is_some()
    }

    /// True for a best-effort merge of an incomplete set
    pub fn is_partial(&self) -> bool {
        self.assembly.is_some_and(|a| a.expired)
    }

    /// Render as a JSON value
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} -> {} {} {}: {}",
            self.dtm.format("%H:%M:%S%.3f"),
            self.verb,
            self.src,
            Address::slot(self.dst),
            self.code,
            self.name,
            serde_json::to_string(&self.payload).unwrap_or_default()
        )
    }
}

/// Outcome of decoding one packet, or of releasing a fragment set
#[derive(Debug, Clone)]
pub enum Decoding {
    /// A decoded (or assembled) message
    Message(Message),
    /// The payload could not be decoded or assembled
    Failed { packet: Packet, error: CodecError },
}

/// Stateful decoder: codec lookup plus fragment reassembly
#[derive(Debug)]
pub struct MessageDecoder {
    registry: Arc<Registry>,
    fragments: FragmentBuffer,
}

impl MessageDecoder {
    /// Create a decoder
    pub fn new(registry: Arc<Registry>, config: &FragmentConfig) -> Self {
        Self {
            registry,
            fragments: FragmentBuffer::from_config(config),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Frame and decode one line; lines without a frame yield nothing
    pub fn decode_line(
        &mut self,
        line: &str,
        received: NaiveDateTime,
    ) -> Result<Vec<Decoding>, FramingError> {
        match parse_line(line, received)? {
            Some(pkt) => Ok(self.decode_packet(pkt)),
            None => Ok(Vec::new()),
        }
    }

    /// Decode a packet
    ///
    /// Sets that expired before this packet are released first. A part of a
    /// multi-packet payload is delivered as a fragment message, followed by
    /// the assembled message when it completes its set; a part that is a
    /// complete set on its own is delivered only as the assembled message.
    pub fn decode_packet(&mut self, pkt: Packet) -> Vec<Decoding> {
        let mut out = self.expire(pkt.dtm());
        let name = self.registry.name(pkt.code());

        let decoded = match self.registry.decode_packet(&pkt) {
            Ok(decoded) => decoded,
            Err(error) => {
                warn!(code = %pkt.code(), src = %pkt.src(), %error, "Codec failed");
                out.push(Decoding::Failed { packet: pkt, error });
                return out;
            }
        };

        match decoded {
            Decoded::Complete(payload) => {
                trace!(code = %pkt.code(), src = %pkt.src(), "Decoded {name}");
                out.push(Decoding::Message(Message::new(pkt, name, payload)));
            }
            Decoded::Fragment(part) => {
                let key = FragmentKey::of(&pkt);
                let info = FragmentInfo {
                    index: part.index,
                    total: part.total,
                };
                let fragment = Message::new(pkt.clone(), name, part.payload.clone())
                    .with_fragment(info);
                let mut resolved = self.fragments.push(&pkt, part).into_iter();
                // when the set of this packet completed, it is resolved last
                let current = if self.fragments.contains(&key) {
                    None
                } else {
                    resolved.next_back()
                };
                for set in resolved {
                    out.push(self.release(set));
                }
                match current {
                    Some(set) if set.parts.len() == 1 => out.push(
                        match self.resolve(set) {
                            Ok(msg) => Decoding::Message(Message {
                                assembly: None,
                                ..msg
                            }),
                            Err(failed) => failed,
                        },
                    ),
                    Some(set) => {
                        out.push(Decoding::Message(fragment));
                        out.push(self.release(set));
                    }
                    None => out.push(Decoding::Message(fragment)),
                }
            }
        }
        out
    }

    /// Release sets whose window has elapsed by `now`
    pub fn expire(&mut self, now: NaiveDateTime) -> Vec<Decoding> {
        self.fragments
            .expire(now)
            .into_iter()
            .map(|set| self.release(set))
            .collect()
    }

    /// Earliest time a pending fragment set will expire
    pub fn next_expiry(&self) -> Option<NaiveDateTime> {
        self.fragments.next_expiry()
    }

    fn release(&self, set: ResolvedSet) -> Decoding {
        self.resolve(set).map_or_else(|failed| failed, Decoding::Message)
    }

    fn resolve(&self, set: ResolvedSet) -> Result<Message, Decoding> {
        let code = set.key.code;
        let parts = set.parts.len();
        let expired = set.status == FragmentStatus::Expired;
        match self.registry.assemble(code, set.parts) {
            Ok(payload) => {
                debug!(%code, src = %set.key.src, parts, expired, "Assembled fragments");
                Ok(Message::new(set.packet, self.registry.name(code), payload)
                    .with_assembly(AssemblyInfo { parts, expired }))
            }
            Err(error) => {
                warn!(%code, src = %set.key.src, parts, %error, "Assembly failed");
                Err(Decoding::Failed {
                    packet: set.packet,
                    error,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::UfhSetpoint;
    use chrono::NaiveDate;

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn decoder() -> MessageDecoder {
        MessageDecoder::new(Arc::new(Registry::new()), &FragmentConfig::default())
    }

    fn messages(out: Vec<Decoding>) -> Vec<Message> {
        out.into_iter()
            .map(|d| match d {
                Decoding::Message(m) => m,
                Decoding::Failed { error, .. } => panic!("unexpected failure: {error}"),
            })
            .collect()
    }

    #[test]
    fn test_short_array_is_a_single_message() {
        let mut decoder = decoder();
        let out = decoder
            .decode_line(
                "045  I --- 02:001107 --:------ 02:001107 22C9 024 0008340A28010108340A28010208340A28010308340A2801",
                now(),
            )
            .unwrap();
        let msgs = messages(out);
        assert_eq!(msgs.len(), 1);
        assert!(!msgs[0].is_fragment());
        assert!(msgs[0].assembly.is_none());
        let Payload::UfhSetpoints(records) = &msgs[0].payload else {
            panic!("unexpected payload");
        };
        assert_eq!(records.len(), 4);
    }

    #[test]
    fn test_codec_failure_is_isolated() {
        let mut decoder = decoder();
        let out = decoder
            .decode_line(" I --- 02:250708 21:064743 --:------ 22C9 008 0307D07FFF020200", now())
            .unwrap();
        assert!(matches!(out.as_slice(), [Decoding::Failed { .. }]));

        let out = decoder
            .decode_line(" I --- 02:250708 21:064743 --:------ 22C9 008 0307D07FFF020203", now())
            .unwrap();
        let msgs = messages(out);
        assert_eq!(
            msgs[0].payload,
            Payload::UfhSetpoints(vec![UfhSetpoint {
                ufh_idx: crate::helpers::HexByte(3),
                mode: crate::codec::UfhMode::Cool,
                setpoint_bounds: (Some(20.0), None),
            }])
        );
    }

    #[test]
    fn test_blank_and_comment_lines() {
        let mut decoder = decoder();
        assert!(decoder.decode_line("", now()).unwrap().is_empty());
        assert!(decoder.decode_line("# evofw3 0.7.1", now()).unwrap().is_empty());
    }

    #[test]
    fn test_message_json() {
        let mut decoder = decoder();
        let out = decoder
            .decode_line("RP --- 01:145038 18:000730 --:------ 0006 004 00050008", now())
            .unwrap();
        let json = messages(out)[0].to_json();
        assert_eq!(json["verb"], "RP");
        assert_eq!(json["code"], "0006");
        assert_eq!(json["name"], "schedule_version");
        assert_eq!(json["payload"]["change_counter"], 8);
        assert!(json.get("fragment").is_none());
    }
}
