//! Command engine driven over a mock gateway

use chrono::Utc;
use ramses_tx::{
    Address, Code, Command, CommandEngine, Message, MessageDecoder, MockInterface, Payload,
    RamsesError, RamsesInterface, Registry, TestFixture, Verb,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

const CTL: &str = "01:145038";

/// Run the engine against the interface until `rx` has an outcome
async fn drive(
    engine: &mut CommandEngine,
    iface: &mut MockInterface,
    mut rx: oneshot::Receiver<ramses_tx::Result<Message>>,
) -> ramses_tx::Result<Message> {
    let mut decoder = MessageDecoder::new(Arc::new(Registry::new()), &Default::default());
    loop {
        if let Ok(outcome) = rx.try_recv() {
            return outcome;
        }
        if let Some(frame) = engine.poll_transmit(Instant::now()) {
            iface.write_frame(&frame).await.unwrap();
            continue;
        }
        let deadline = engine
            .next_deadline()
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(60));
        tokio::select! {
            line = iface.read_line() => {
                let Some(line) = line.unwrap() else { continue };
                let decoded = decoder
                    .decode_line(&line, Utc::now().naive_utc())
                    .unwrap_or_default();
                for d in decoded {
                    if let ramses_tx::Decoding::Message(msg) = d {
                        engine.on_message(&msg);
                    }
                }
            }
            _ = tokio::time::sleep_until(deadline) => {}
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_request_resolved_by_reply() {
    let fixture = TestFixture::new();
    let mut iface = fixture.interface.with_responder(|frame| {
        if frame.starts_with("RQ") && frame.contains(" 0004 ") {
            vec![format!(
                "RP --- {CTL} 18:000730 --:------ 0004 022 0100{}",
                hex::encode_upper(b"Lounge").to_string() + &"00".repeat(14)
            )]
        } else {
            Vec::new()
        }
    });
    let handle = fixture.handle;
    let mut engine = CommandEngine::new(fixture.config.transport, Arc::new(Registry::new()));

    let (tx, rx) = oneshot::channel();
    engine.submit(Command::get_zone_name(CTL.parse().unwrap(), 1), tx);
    let msg = drive(&mut engine, &mut iface, rx).await.unwrap();

    assert_eq!(msg.verb, Verb::Rp);
    let Payload::ZoneName(zone) = &msg.payload else {
        panic!("expected zone name, got {:?}", msg.payload);
    };
    assert_eq!(zone.name.as_deref(), Some("Lounge"));
    assert_eq!(
        handle.written(),
        vec!["RQ --- 18:000730 01:145038 --:------ 0004 002 0100".to_string()]
    );
    assert_eq!(engine.stats().resolved, 1);
    assert_eq!(engine.stats().retries, 0);
}

#[tokio::test(start_paused = true)]
async fn test_unregistered_code_never_transmitted() {
    let fixture = TestFixture::new();
    let mut iface = fixture.interface;
    let mut engine = CommandEngine::new(fixture.config.transport, Arc::new(Registry::new()));

    let cmd = Command::new(
        Verb::W,
        CTL.parse().unwrap(),
        Code(0x7FFF),
        Payload::request(vec![0x00]),
    );
    let (tx, rx) = oneshot::channel();
    engine.submit(cmd, tx);
    let err = drive(&mut engine, &mut iface, rx).await.unwrap_err();

    assert_eq!(err.error_code(), "CODEC_ERROR");
    assert!(fixture.handle.written().is_empty());
    assert_eq!(engine.stats().transmitted, 0);
    assert!(engine.is_idle());
}

#[tokio::test(start_paused = true)]
async fn test_silent_device_exhausts_retries() {
    let fixture = TestFixture::new();
    let mut iface = fixture.interface;
    let mut engine = CommandEngine::new(fixture.config.transport, Arc::new(Registry::new()));

    let (tx, rx) = oneshot::channel();
    let started = Instant::now();
    engine.submit(Command::get_device_info(CTL.parse::<Address>().unwrap()), tx);
    let err = drive(&mut engine, &mut iface, rx).await.unwrap_err();

    assert!(matches!(err, RamsesError::RetryExhausted { attempts: 4, .. }));
    // echoes arrive, but no reply: the first send plus three retries
    assert_eq!(fixture.handle.written().len(), 4);
    // 0.5s, 1s, 2s and 2s with the timeout doubling capped at 4x
    assert!(started.elapsed() >= Duration::from_millis(500 + 1000 + 2000 + 2000));
    assert_eq!(engine.stats().retries, 3);
}

#[tokio::test(start_paused = true)]
async fn test_write_acknowledged_by_broadcast() {
    let fixture = TestFixture::new();
    let mut iface = fixture.interface.with_responder(|frame| {
        if frame.starts_with(" W") && frame.contains(" 2309 ") {
            vec![format!(" I --- {CTL} --:------ {CTL} 2309 003 0107D0")]
        } else {
            Vec::new()
        }
    });
    let mut engine = CommandEngine::new(fixture.config.transport, Arc::new(Registry::new()));

    let (tx, rx) = oneshot::channel();
    engine.submit(
        Command::set_zone_setpoint(CTL.parse().unwrap(), 1, Some(20.0)),
        tx,
    );
    let msg = drive(&mut engine, &mut iface, rx).await.unwrap();
    assert_eq!(msg.verb, Verb::I);
    assert_eq!(msg.code, Code::SETPOINT);
}
