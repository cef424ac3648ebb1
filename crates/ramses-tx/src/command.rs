//! Outbound command requests
//!
//! A [`Command`] is the caller's intent to transmit: verb, addressing, code
//! and a logical payload that is only encoded when the command engine picks it
//! up. The constructors cover the requests the gateway issues itself; anything
//! else can be built by hand or parsed from text.

use chrono::{NaiveDateTime, Utc};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::address::Address;
use crate::codec::payload::{
    BindTuple, Opaque, Payload, RfBind, SystemDateTime, ZoneMode, ZoneModeKind, ZoneSetpoint,
};
use crate::codec::schedule::{request_fragment, write_fragment};
use crate::codec::Registry;
use crate::error::{FramingError, RamsesError};
use crate::helpers::HexByte;
use crate::packet::{parse_line, Code, Packet, Verb};

/// Transmission priority, highest first
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Lowest,
    Low,
    #[default]
    Default,
    High,
    Highest,
}

/// Selects the response timeout a command waits for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum CommandClass {
    /// Requests for state or schema
    #[default]
    Probe,
    /// Writes and schedule transfers
    Control,
    /// Binding handshake
    Binding,
}

/// An outbound command request
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub verb: Verb,
    /// Source address; the gateway address when `None`
    pub src: Option<Address>,
    pub dst: Address,
    pub code: Code,
    pub payload: Payload,
    pub priority: Priority,
    pub class: CommandClass,
    /// Overrides the configured retry budget
    pub max_retries: Option<u8>,
    /// Overrides the configured timeout for the command class
    pub timeout: Option<Duration>,
}

impl Command {
    /// Create a command with default priority and class
    pub fn new(verb: Verb, dst: Address, code: Code, payload: Payload) -> Self {
        let class = match verb {
            Verb::Rq => CommandClass::Probe,
            _ => CommandClass::Control,
        };
        Self {
            verb,
            src: None,
            dst,
            code,
            payload,
            priority: Priority::Default,
            class,
            max_retries: None,
            timeout: None,
        }
    }

    /// Context-only request
    pub fn request(dst: Address, code: Code, context: impl Into<Vec<u8>>) -> Self {
        Self::new(Verb::Rq, dst, code, Payload::request(context))
    }

    pub fn with_src(mut self, src: Address) -> Self {
        self.src = Some(src);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_class(mut self, class: CommandClass) -> Self {
        self.class = class;
        self
    }

    pub fn with_retries(mut self, retries: u8) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    // ===== Requests =====

    /// RQ 0004: zone name
    pub fn get_zone_name(ctl: Address, zone_idx: u8) -> Self {
        Self::request(ctl, Code::ZONE_NAME, vec![zone_idx, 0x00])
    }

    /// RQ 0005: zones of a given type (`08` = radiator valves, ...)
    pub fn get_system_zones(ctl: Address, zone_type: u8) -> Self {
        Self::request(ctl, Code::SYSTEM_ZONES, vec![0x00, zone_type])
    }

    /// RQ 0006: schedule change counter
    pub fn get_schedule_version(ctl: Address) -> Self {
        Self::request(ctl, Code::SCHEDULE_VERSION, vec![0x00])
    }

    /// RQ 000C: devices bound to a zone in a given role
    pub fn get_zone_devices(ctl: Address, zone_idx: u8, role: u8) -> Self {
        Self::request(ctl, Code::ZONE_DEVICES, vec![zone_idx, role])
    }

    /// RQ 0404: one schedule fragment; the first request carries no total
    pub fn get_schedule_fragment(
        ctl: Address,
        zone_idx: u8,
        dhw: bool,
        frag_number: u8,
        total: Option<u8>,
    ) -> Self {
        Self::new(
            Verb::Rq,
            ctl,
            Code::SCHEDULE,
            request_fragment(zone_idx, dhw, frag_number, total),
        )
        .with_class(CommandClass::Control)
    }

    /// W 0404: one schedule fragment
    pub fn set_schedule_fragment(
        ctl: Address,
        zone_idx: u8,
        dhw: bool,
        frag_number: u8,
        total: u8,
        data: Vec<u8>,
    ) -> Self {
        Self::new(
            Verb::W,
            ctl,
            Code::SCHEDULE,
            write_fragment(zone_idx, dhw, frag_number, total, data),
        )
    }

    /// RQ 0418: one fault log slot
    pub fn get_fault_log_entry(ctl: Address, log_idx: u8) -> Self {
        Self::request(ctl, Code::FAULT_LOG, vec![0x00, 0x00, log_idx])
    }

    /// RQ 10E0: device identity
    pub fn get_device_info(dst: Address) -> Self {
        Self::request(dst, Code::DEVICE_INFO, vec![0x00])
    }

    /// RQ 313F: system datetime
    pub fn get_system_time(ctl: Address) -> Self {
        Self::request(ctl, Code::DATETIME, vec![0x00])
    }

    // ===== Writes =====

    /// W 313F: set the system datetime
    pub fn set_system_time(ctl: Address, datetime: NaiveDateTime, is_dst: bool) -> Self {
        Self::new(
            Verb::W,
            ctl,
            Code::DATETIME,
            Payload::DateTime(SystemDateTime {
                context: HexByte(0x60),
                datetime: Some(datetime),
                is_dst,
            }),
        )
    }

    /// W 2309: zone setpoint (`None` resets to the scheduled value)
    pub fn set_zone_setpoint(ctl: Address, zone_idx: u8, setpoint: Option<f64>) -> Self {
        Self::new(
            Verb::W,
            ctl,
            Code::SETPOINT,
            Payload::Setpoints(vec![ZoneSetpoint {
                zone_idx: HexByte(zone_idx),
                setpoint,
            }]),
        )
    }

    /// W 2349: zone mode
    pub fn set_zone_mode(
        ctl: Address,
        zone_idx: u8,
        mode: ZoneModeKind,
        setpoint: Option<f64>,
        until: Option<NaiveDateTime>,
    ) -> Self {
        Self::new(
            Verb::W,
            ctl,
            Code::ZONE_MODE,
            Payload::ZoneMode(ZoneMode {
                zone_idx: HexByte(zone_idx),
                mode,
                setpoint,
                duration: None,
                until,
            }),
        )
    }

    /// 1FC9 binding packet sent as `src`
    ///
    /// The verb and destination select the phase: an offer is an `I` to self
    /// (or broadcast), an accept a `W` to the supplicant, a confirm an `I` to
    /// the respondent.
    pub fn put_bind(verb: Verb, src: Address, dst: Address, bindings: Vec<BindTuple>) -> Self {
        Self::new(
            verb,
            dst,
            Code::RF_BIND,
            Payload::RfBind(RfBind {
                phase: None,
                bindings,
                context: None,
            }),
        )
        .with_src(src)
        .with_class(CommandClass::Binding)
    }

    /// Source address, falling back to `gateway`
    pub fn src_or(&self, gateway: Address) -> Address {
        self.src.unwrap_or(gateway)
    }

    /// Address slots as transmitted: `[src, --, src]` to self, else `[src, dst, --]`
    pub fn addrs(&self, gateway: Address) -> [Option<Address>; 3] {
        let src = self.src_or(gateway);
        if self.dst == src {
            [Some(src), None, Some(src)]
        } else {
            [Some(src), Some(self.dst), None]
        }
    }

    /// Encode into the packet to transmit
    pub fn to_packet(
        &self,
        registry: &Registry,
        gateway: Address,
        dtm: NaiveDateTime,
    ) -> crate::Result<Packet> {
        let bytes = registry.encode(self.code, self.verb, &self.payload)?;
        Ok(Packet::new(dtm, self.verb, self.addrs(gateway), self.code, bytes)?)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.verb, self.dst, self.code)?;
        if let Payload::Request(req) = &self.payload {
            write!(f, " {}", hex::encode_upper(&req.context))?;
        }
        Ok(())
    }
}

impl FromStr for Command {
    type Err = RamsesError;

    /// Parse `RQ 01:145038 0004 0100`, or a full frame such as
    /// `RQ --- 18:000730 01:145038 --:------ 0004 002 0100`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tokens: Vec<&str> = s.split_whitespace().collect();
        match tokens.as_slice() {
            [verb, dst, code, payload] => {
                let verb: Verb = verb.parse()?;
                let dst: Address = dst.parse()?;
                let code: Code = code.parse()?;
                let bytes = hex::decode(payload).map_err(FramingError::from)?;
                let payload = match verb {
                    Verb::Rq => Payload::request(bytes),
                    _ => Payload::Opaque(Opaque { payload: bytes }),
                };
                Ok(Self::new(verb, dst, code, payload))
            }
            _ => {
                let pkt = parse_line(s, Utc::now().naive_utc())?
                    .ok_or(FramingError::MissingField("verb"))?;
                Ok(Self::from_packet(&pkt))
            }
        }
    }
}

impl Command {
    /// Rebuild a command from a framed packet, keeping its payload opaque
    pub fn from_packet(pkt: &Packet) -> Self {
        let payload = pkt.payload().to_vec();
        let payload = match pkt.verb() {
            Verb::Rq => Payload::request(payload),
            _ => Payload::Opaque(Opaque { payload }),
        };
        let mut cmd = Self::new(pkt.verb(), pkt.dst().unwrap_or(pkt.src()), pkt.code(), payload);
        if pkt.src() != Address::GATEWAY {
            cmd.src = Some(pkt.src());
        }
        cmd
    }
}

// ===== Correlation =====

/// How a received packet relates to a transmitted one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correlation {
    /// The gateway's own echo of the transmission
    Echo,
    /// The response the command waits for
    Response,
}

/// Bytes of a payload that identify what it is about
///
/// Schedule fragments are matched on their header and fragment number (not
/// the length byte), fault log entries on their slot, and everything else on
/// a leading context whose length depends on the code.
pub fn correlation_key(code: Code, payload: &[u8]) -> Vec<u8> {
    match code {
        Code::SCHEDULE if payload.len() >= 6 => {
            let mut key = payload[..4].to_vec();
            key.push(payload[5]);
            key
        }
        Code::FAULT_LOG => payload.get(2).copied().into_iter().collect(),
        Code::ZONE_NAME | Code::SYSTEM_ZONES | Code::ZONE_DEVICES => {
            payload.iter().take(2).copied().collect()
        }
        _ => payload.iter().take(1).copied().collect(),
    }
}

/// Check whether `rx` answers (or echoes) the transmitted packet `tx`
pub fn correlate(tx: &Packet, rx: &Packet) -> Option<Correlation> {
    if rx.code() != tx.code() {
        return None;
    }
    if is_echo(tx, rx) {
        return Some(Correlation::Echo);
    }
    let expected = match tx.verb() {
        Verb::Rq => Verb::Rp,
        Verb::W => Verb::I,
        Verb::I | Verb::Rp => return None,
    };
    let responder = tx.dst()?;
    if rx.verb() != expected || rx.src() != responder {
        return None;
    }
    if let (Some(a), Some(b)) = (tx.seqn(), rx.seqn()) {
        if a != b {
            return None;
        }
    }
    (correlation_key(tx.code(), tx.payload()) == correlation_key(rx.code(), rx.payload()))
        .then_some(Correlation::Response)
}

/// The gateway echoes each transmission, replacing a placeholder source with
/// its real address
fn is_echo(tx: &Packet, rx: &Packet) -> bool {
    let src_matches = rx.src() == tx.src()
        || (tx.src() == Address::GATEWAY && rx.src().dev_type() == Address::GATEWAY.dev_type());
    let dst_matches = rx.dst() == tx.dst() || (tx.is_to_self() && rx.is_to_self());
    rx.verb() == tx.verb() && src_matches && dst_matches && rx.payload() == tx.payload()
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

    fn line(s: &str) -> Packet {
        parse_line(s, now()).unwrap().unwrap()
    }

    fn ctl() -> Address {
        "01:145038".parse().unwrap()
    }

    #[test]
    fn test_request_frame() {
        let pkt = Command::get_zone_name(ctl(), 1)
            .to_packet(&Registry::new(), Address::GATEWAY, now())
            .unwrap();
        assert_eq!(pkt.frame(), "RQ --- 18:000730 01:145038 --:------ 0004 002 0100");
    }

    #[test]
    fn test_schedule_request_frame() {
        let pkt = Command::get_schedule_fragment(ctl(), 1, false, 1, None)
            .to_packet(&Registry::new(), Address::GATEWAY, now())
            .unwrap();
        assert_eq!(pkt.frame(), "RQ --- 18:000730 01:145038 --:------ 0404 007 01200008000100");
    }

    #[test]
    fn test_setpoint_frame() {
        let pkt = Command::set_zone_setpoint(ctl(), 2, Some(19.5))
            .to_packet(&Registry::new(), Address::GATEWAY, now())
            .unwrap();
        assert_eq!(pkt.frame(), " W --- 18:000730 01:145038 --:------ 2309 003 02079E");
    }

    #[test]
    fn test_bind_offer_to_self() {
        let supplicant: Address = "29:123150".parse().unwrap();
        let cmd = Command::put_bind(
            Verb::I,
            supplicant,
            supplicant,
            vec![BindTuple(HexByte(0), Code::FAN_MODE, supplicant)],
        );
        let pkt = cmd.to_packet(&Registry::new(), Address::GATEWAY, now()).unwrap();
        assert_eq!(pkt.frame(), " I --- 29:123150 --:------ 29:123150 1FC9 006 0022F175E10E");
    }

    #[test]
    fn test_unregistered_code_fails_to_encode() {
        let cmd: Command = "RQ 01:145038 7FFF 00".parse().unwrap();
        let err = cmd
            .to_packet(&Registry::new(), Address::GATEWAY, now())
            .unwrap_err();
        assert_eq!(err.error_code(), "CODEC_ERROR");
    }

    #[test]
    fn test_parse_compact_and_full_forms() {
        let compact: Command = "RQ 01:145038 0004 0100".parse().unwrap();
        let full: Command = "RQ --- 18:000730 01:145038 --:------ 0004 002 0100"
            .parse()
            .unwrap();
        assert_eq!(compact, full);
        assert_eq!(compact.to_string(), "RQ 01:145038 0004 0100");

        let write: Command = " W --- 18:000730 01:145038 --:------ 2309 003 02079E"
            .parse()
            .unwrap();
        assert_eq!(write.class, CommandClass::Control);
        assert!(matches!(write.payload, Payload::Opaque(_)));

        assert!("RQ 01:145038 00G4 0100".parse::<Command>().is_err());
    }

    #[test]
    fn test_correlate_request() {
        let tx = line("RQ --- 18:000730 01:145038 --:------ 0004 002 0100");
        let echo = line("RQ --- 18:006402 01:145038 --:------ 0004 002 0100");
        let reply = line("RP --- 01:145038 18:006402 --:------ 0004 022 0100486F6D6500000000000000000000000000000000");
        let other_zone = line("RP --- 01:145038 18:006402 --:------ 0004 022 0200486F6D6500000000000000000000000000000000");
        let other_device = line("RP --- 01:054173 18:006402 --:------ 0004 022 0100486F6D6500000000000000000000000000000000");

        assert_eq!(correlate(&tx, &echo), Some(Correlation::Echo));
        assert_eq!(correlate(&tx, &reply), Some(Correlation::Response));
        assert_eq!(correlate(&tx, &other_zone), None);
        assert_eq!(correlate(&tx, &other_device), None);
    }

    #[test]
    fn test_correlate_write_ack() {
        let tx = line(" W --- 18:000730 01:145038 --:------ 2309 003 02079E");
        let ack = line(" I --- 01:145038 18:006402 --:------ 2309 003 02079E");
        let other = line(" I --- 01:145038 --:------ 01:145038 2309 003 0107D0");
        assert_eq!(correlate(&tx, &ack), Some(Correlation::Response));
        assert_eq!(correlate(&tx, &other), None);
    }

    #[test]
    fn test_correlate_schedule_fragment_number() {
        let tx = line("RQ --- 18:000730 01:145038 --:------ 0404 007 01200008000203");
        let frag_2 = line("RP --- 01:145038 18:006402 --:------ 0404 010 0120000803020301020A");
        let frag_1 = line("RP --- 01:145038 18:006402 --:------ 0404 010 0120000803010301020A");
        assert_eq!(correlate(&tx, &frag_2), Some(Correlation::Response));
        assert_eq!(correlate(&tx, &frag_1), None);
    }

    #[test]
    fn test_correlate_fault_log_slot() {
        let tx = line("RQ --- 18:000730 01:145038 --:------ 0418 003 000005");
        let reply = line("RP --- 01:145038 18:006402 --:------ 0418 022 000005B0040000000000CD17B5AE7FFFFF700006368E");
        assert_eq!(correlate(&tx, &reply), Some(Correlation::Response));
        let tx = line("RQ --- 18:000730 01:145038 --:------ 0418 003 000006");
        assert_eq!(correlate(&tx, &reply), None);
    }

    #[test]
    fn test_priority_order() {
        assert!(Priority::Highest > Priority::High);
        assert!(Priority::Default > Priority::Low);
        assert!(Priority::Low > Priority::Lowest);
    }
}
