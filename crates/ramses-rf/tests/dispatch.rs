//! Recorded traffic through the dispatcher

use chrono::{NaiveDate, NaiveDateTime};
use ramses_rf::{
    BindingEvent, BindingState, DispatchEvent, Dispatcher, EntityGraph, FailureKind,
    GatewayConfig, GraphConfig, GraphEvent, Zone, ZoneType,
};
use ramses_rf::BindingRecord;
use ramses_tx::codec::BindTuple;
use ramses_tx::{Address, Code, FragmentConfig, HexByte, MessageDecoder, Registry};
use std::sync::Arc;

const OFFER: &str = "2024-01-01T08:00:00.000000 ...  I --- 29:123150 63:262142 --:------ 1FC9 012 0022F175E10E6710E075E10E";
const ACCEPT: &str = "2024-01-01T08:00:01.000000 ...  W --- 29:099029 29:123150 --:------ 1FC9 006 0031D97582D5";
const CONFIRM: &str = "2024-01-01T08:00:02.000000 ...  I --- 29:123150 29:099029 --:------ 1FC9 001 00";

fn received() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 1, 1)
        .unwrap()
        .and_hms_opt(12, 0, 0)
        .unwrap()
}

fn dispatcher() -> Dispatcher {
    Dispatcher::new(&GatewayConfig::default(), Arc::new(Registry::new()))
}

fn addr(s: &str) -> Address {
    s.parse().unwrap()
}

fn ctl() -> Address {
    addr("01:145038")
}

fn zone_type_line(secs: u32, zone_type: &str) -> String {
    format!("2024-01-01T08:00:{secs:02}.000000 045 RP --- 01:145038 18:000730 --:------ 0005 004 00{zone_type}0200")
}

fn bound(events: &[DispatchEvent]) -> Vec<BindingRecord> {
    events
        .iter()
        .filter_map(|e| match e {
            DispatchEvent::Binding(BindingEvent::Bound(record)) => Some(record.clone()),
            _ => None,
        })
        .collect()
}

fn feed(dispatcher: &mut Dispatcher, lines: &[&str]) -> Vec<DispatchEvent> {
    lines
        .iter()
        .flat_map(|line| dispatcher.process_line(line, received()))
        .collect()
}

#[test]
fn test_three_messages_bind_a_pair() {
    let mut dispatcher = dispatcher();
    let supplicant = addr("29:123150");
    let respondent = addr("29:099029");

    let events = feed(&mut dispatcher, &[OFFER, ACCEPT, CONFIRM]);
    let states: Vec<BindingState> = events
        .iter()
        .filter_map(|e| match e {
            DispatchEvent::Binding(BindingEvent::StateChanged { state, .. }) => Some(*state),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            BindingState::OfferReceived,
            BindingState::AcceptSent,
            BindingState::ConfirmReceived
        ]
    );
    assert_eq!(dispatcher.binding().state(supplicant), BindingState::Bound);

    let record = dispatcher.binding().record(supplicant).unwrap().clone();
    assert_eq!(record.respondent, respondent);
    assert_eq!(
        record.accepted,
        vec![BindTuple(HexByte(0x00), Code(0x31D9), respondent)]
    );
    assert_eq!(dispatcher.graph().bindings(), &[record.clone()]);
    assert_eq!(bound(&events), vec![record]);

    // replaying the exchange does not move a completed binding
    let replay = feed(&mut dispatcher, &[OFFER, ACCEPT, CONFIRM]);
    assert!(!replay
        .iter()
        .any(|e| matches!(e, DispatchEvent::Binding(_))));
    assert_eq!(dispatcher.binding().state(supplicant), BindingState::Bound);
    assert_eq!(dispatcher.graph().bindings().len(), 1);
}

#[test]
fn test_confirm_to_another_device_is_ignored() {
    let mut dispatcher = dispatcher();
    let stray = CONFIRM.replace("29:099029", "29:000001");
    feed(&mut dispatcher, &[OFFER, ACCEPT, &stray]);
    assert_eq!(
        dispatcher.binding().state(addr("29:123150")),
        BindingState::AcceptSent
    );
    assert!(dispatcher.graph().bindings().is_empty());
}

#[test]
fn test_applying_a_message_twice_changes_nothing() {
    let lines = [
        "2024-01-01T08:00:00.000000 045 RP --- 01:145038 18:000730 --:------ 0004 022 01004C6F756E67650000000000000000000000000000",
        "2024-01-01T08:00:01.000000 045 RP --- 01:145038 18:000730 --:------ 000C 006 01000035E240",
        "2024-01-01T08:00:02.000000 045  I --- 01:145038 --:------ 01:145038 30C9 003 0107C1",
    ];
    let mut decoder = MessageDecoder::new(Arc::new(Registry::new()), &FragmentConfig::default());
    let mut graph = EntityGraph::new(GraphConfig::default());
    for line in lines {
        for decoding in decoder.decode_line(line, received()).unwrap() {
            let ramses_tx::Decoding::Message(msg) = decoding else {
                panic!("decoding failed for {line}");
            };
            graph.apply(&msg);
            let once = graph.clone();
            assert!(graph.apply(&msg).is_empty());
            assert_eq!(graph, once);
        }
    }
    let zone = graph.zone(ctl(), 1).unwrap();
    assert_eq!(zone.name(), Some("Lounge"));
    assert_eq!(zone.temperature(), Some(19.85));
}

#[test]
fn test_zone_type_needs_corroboration_to_change() {
    let mut dispatcher = dispatcher();
    feed(&mut dispatcher, &[&zone_type_line(0, "08")]);
    let zone_type = |d: &Dispatcher| d.graph().zone(ctl(), 1).and_then(Zone::zone_type);
    assert_eq!(zone_type(&dispatcher), Some(ZoneType::Radiator));

    // one contradicting exchange, heard twice, is not enough
    let contradiction = zone_type_line(1, "0A");
    let events = feed(&mut dispatcher, &[&contradiction, &contradiction]);
    assert_eq!(zone_type(&dispatcher), Some(ZoneType::Radiator));
    assert!(!events.iter().any(|e| matches!(
        e,
        DispatchEvent::Graph(GraphEvent::SchemaChanged { field: "zone_type", .. })
    )));

    // a second, independent exchange is
    let events = feed(&mut dispatcher, &[&zone_type_line(2, "0A")]);
    assert_eq!(zone_type(&dispatcher), Some(ZoneType::ZoneValve));
    assert!(events.iter().any(|e| matches!(
        e,
        DispatchEvent::Graph(GraphEvent::SchemaChanged { field: "zone_type", .. })
    )));
}

#[test]
fn test_bad_lines_leave_the_graph_alone() {
    let mut dispatcher = dispatcher();
    feed(
        &mut dispatcher,
        &["2024-01-01T08:00:00.000000 045  I --- 01:145038 --:------ 01:145038 30C9 003 0107C1"],
    );
    let before = dispatcher.graph().clone();

    let events = feed(
        &mut dispatcher,
        &[
            "2024-01-01T08:00:01.000000 045  I --- 01:145038 --:------ 01:145038 30C9 002 0107",
            "2024-01-01T08:00:02.000000 045  I --- 01:14503 --:------ 01:145038 30C9 003 0107C1",
        ],
    );
    assert!(matches!(
        &events[..],
        [
            DispatchEvent::Failed { kind: FailureKind::Codec, .. },
            DispatchEvent::Failed { kind: FailureKind::Framing, .. },
        ]
    ));
    assert_eq!(dispatcher.graph(), &before);

    // and the next good line goes through
    let events = feed(
        &mut dispatcher,
        &["2024-01-01T08:00:03.000000 045  I --- 01:145038 --:------ 01:145038 30C9 003 0107D0"],
    );
    assert!(matches!(events[0], DispatchEvent::Message { .. }));
    assert_eq!(
        dispatcher.graph().zone(ctl(), 1).and_then(Zone::temperature),
        Some(20.0)
    );
    assert_eq!(dispatcher.stats().framing_errors, 1);
    assert_eq!(dispatcher.stats().codec_errors, 1);
}

#[test]
fn test_eavesdropped_demand_infers_zone_type() {
    let config = GatewayConfig {
        graph: GraphConfig {
            eavesdrop: true,
            ..GraphConfig::default()
        },
        ..GatewayConfig::default()
    };
    let mut dispatcher = Dispatcher::new(&config, Arc::new(Registry::new()));
    feed(
        &mut dispatcher,
        &["2024-01-01T08:00:00.000000 045  I --- 13:123456 --:------ 01:145038 3150 002 0264"],
    );
    let zone = dispatcher.graph().zone(ctl(), 2).unwrap();
    assert_eq!(zone.zone_type(), Some(ZoneType::ZoneValve));
    assert_eq!(
        dispatcher.graph().device(addr("13:123456")).unwrap().parent(),
        Some(ctl())
    );
}
