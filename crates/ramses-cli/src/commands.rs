//! Subcommand implementations

use anyhow::{bail, Context};
use chrono::{NaiveDateTime, Utc};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use ramses_rf::{DispatchEvent, Dispatcher, GatewayConfig, GatewayHandle, SchemaSnapshot};
use ramses_tx::codec::Schedule;
use ramses_tx::config::InterfaceConfig;
use ramses_tx::{Address, Command, HexByte, Registry};

type GatewayTask = JoinHandle<ramses_rf::Result<()>>;

/// Options of the `monitor` subcommand
pub struct MonitorOptions {
    pub raw: bool,
    pub discover: bool,
    pub schema: Option<PathBuf>,
    pub save_schema: Option<PathBuf>,
}

/// Start a gateway on `port`, seeded from `snapshot`
#[cfg(feature = "serial")]
fn connect(
    mut config: GatewayConfig,
    port: &Path,
    snapshot: Option<&SchemaSnapshot>,
) -> anyhow::Result<(GatewayHandle, GatewayTask)> {
    use ramses_rf::Gateway;
    use ramses_tx::SerialInterface;

    let InterfaceConfig::Serial { baud_rate, .. } = config.ramses.interface.clone();
    config.ramses.interface = InterfaceConfig::Serial {
        port: port.to_path_buf(),
        baud_rate,
    };
    config.validate()?;

    let interface = SerialInterface::from_config(&config.ramses.interface);
    let (mut gateway, handle) = Gateway::new(interface, config);
    if let Some(snapshot) = snapshot {
        gateway.load_snapshot(snapshot);
    }
    Ok((handle, tokio::spawn(gateway.run())))
}

#[cfg(not(feature = "serial"))]
fn connect(
    _config: GatewayConfig,
    port: &Path,
    _snapshot: Option<&SchemaSnapshot>,
) -> anyhow::Result<(GatewayHandle, GatewayTask)> {
    bail!(
        "cannot open {}: built without serial support (rebuild with --features serial)",
        port.display()
    )
}

/// Stop the gateway and surface how it ended
async fn finish(handle: GatewayHandle, task: GatewayTask) -> anyhow::Result<()> {
    if !task.is_finished() {
        handle.shutdown().await?;
    }
    task.await?.context("gateway failed")?;
    Ok(())
}

fn load_snapshot(path: Option<&Path>) -> anyhow::Result<Option<SchemaSnapshot>> {
    path.map(|path| {
        SchemaSnapshot::load(path).with_context(|| format!("loading schema from {}", path.display()))
    })
    .transpose()
}

/// Parse a zone argument: a hex index, or `HW` for hot water
pub fn parse_zone(zone: &str) -> anyhow::Result<(u8, bool)> {
    if zone.eq_ignore_ascii_case("hw") {
        return Ok((0, true));
    }
    let idx = u8::from_str_radix(zone, 16).with_context(|| format!("invalid zone {zone:?}"))?;
    if idx > ramses_rf::graph::MAX_ZONE_IDX {
        bail!("zone {zone} out of range");
    }
    Ok((idx, false))
}

fn parse_ctl(ctl: &str) -> anyhow::Result<Address> {
    ctl.parse()
        .with_context(|| format!("invalid controller address {ctl:?}"))
}

pub async fn monitor(
    mut config: GatewayConfig,
    port: &Path,
    options: MonitorOptions,
) -> anyhow::Result<()> {
    let snapshot = load_snapshot(options.schema.as_deref())?;
    if options.discover {
        config.graph.discovery = true;
    }
    let (handle, task) = connect(config, port, snapshot.as_ref())?;
    let mut events = handle.subscribe();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(DispatchEvent::Line { raw }) if options.raw => println!("{raw}"),
                Ok(DispatchEvent::Message { message }) => println!("{message}"),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Output fell behind"),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    if let (Some(path), false) = (&options.save_schema, task.is_finished()) {
        handle.snapshot().await?.save(path)?;
        info!(path = %path.display(), "Schema saved");
    }
    finish(handle, task).await
}

fn print_event(event: DispatchEvent, json: bool, out: &mut impl Write) -> anyhow::Result<()> {
    match event {
        event @ (DispatchEvent::Message { .. } | DispatchEvent::Failed { .. }) if json => {
            writeln!(out, "{}", serde_json::to_string(&event)?)?;
        }
        DispatchEvent::Message { message } => writeln!(out, "{message}")?,
        DispatchEvent::Failed {
            raw, kind, error, ..
        } => writeln!(out, "# {kind:?} error: {error}: {raw}")?,
        _ => {}
    }
    Ok(())
}

/// Feed every line of `input` through `dispatcher`, printing messages and failures
pub fn replay(
    dispatcher: &mut Dispatcher,
    input: impl BufRead,
    out: &mut impl Write,
    json: bool,
    received: NaiveDateTime,
) -> anyhow::Result<()> {
    for line in input.lines() {
        for event in dispatcher.process_line(&line?, received) {
            print_event(event, json, out)?;
        }
    }
    // release fragment sets still waiting for parts
    let end = dispatcher
        .next_expiry()
        .map_or(received, |at| at.max(received))
        + chrono::Duration::days(1);
    for event in dispatcher.expire(end) {
        print_event(event, json, out)?;
    }
    Ok(())
}

pub async fn parse(
    config: &GatewayConfig,
    file: &Path,
    schema: Option<&Path>,
    save_schema: Option<&Path>,
    json: bool,
) -> anyhow::Result<()> {
    let input = std::fs::File::open(file)
        .with_context(|| format!("opening {}", file.display()))?;
    let mut dispatcher = Dispatcher::new(config, Arc::new(Registry::new()));
    if let Some(snapshot) = load_snapshot(schema)? {
        dispatcher.load_snapshot(&snapshot);
    }

    let mut stdout = std::io::stdout().lock();
    replay(
        &mut dispatcher,
        BufReader::new(input),
        &mut stdout,
        json,
        Utc::now().naive_utc(),
    )?;

    let stats = dispatcher.stats();
    info!(
        lines = stats.lines,
        messages = stats.messages,
        framing_errors = stats.framing_errors,
        codec_errors = stats.codec_errors,
        "Parsed"
    );
    if let Some(path) = save_schema {
        dispatcher.graph().snapshot().save(path)?;
        info!(path = %path.display(), "Schema saved");
    }
    Ok(())
}

pub async fn execute(config: GatewayConfig, port: &Path, frames: &[String]) -> anyhow::Result<()> {
    let commands = frames
        .iter()
        .map(|frame| {
            frame
                .parse::<Command>()
                .with_context(|| format!("invalid command {frame:?}"))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let (handle, task) = connect(config, port, None)?;
    let mut failed = 0;
    for command in commands {
        let label = command.to_string();
        match handle.send_command(command).await {
            Ok(reply) => println!("{}", serde_json::to_string(&reply)?),
            Err(e) => {
                error!(command = %label, code = e.error_code(), error = %e, "Command failed");
                failed += 1;
            }
        }
    }
    finish(handle, task).await?;
    if failed > 0 {
        bail!("{failed} of {} commands failed", frames.len());
    }
    Ok(())
}

pub async fn get_schedule(
    config: GatewayConfig,
    port: &Path,
    ctl: &str,
    zone: &str,
) -> anyhow::Result<()> {
    let ctl = parse_ctl(ctl)?;
    let (idx, dhw) = parse_zone(zone)?;
    let (handle, task) = connect(config, port, None)?;

    let schedule = handle.get_schedule(ctl, idx, dhw).await;
    finish(handle, task).await?;
    println!("{}", serde_json::to_string_pretty(&schedule?)?);
    Ok(())
}

pub async fn set_schedule(
    config: GatewayConfig,
    port: &Path,
    ctl: &str,
    zone: &str,
    file: &Path,
) -> anyhow::Result<()> {
    let ctl = parse_ctl(ctl)?;
    let (idx, dhw) = parse_zone(zone)?;
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("reading schedule from {}", file.display()))?;
    let mut schedule: Schedule = serde_json::from_str(&text).context("invalid schedule")?;
    schedule.zone_idx = HexByte(idx);
    schedule.dhw = dhw;

    let (handle, task) = connect(config, port, None)?;
    let version = handle.set_schedule(ctl, &schedule).await;
    finish(handle, task).await?;
    match version? {
        Some(version) => info!(version, "Schedule written"),
        None => info!("Schedule written"),
    }
    Ok(())
}

pub async fn get_faults(
    config: GatewayConfig,
    port: &Path,
    ctl: &str,
    limit: u8,
) -> anyhow::Result<()> {
    let ctl = parse_ctl(ctl)?;
    let (handle, task) = connect(config, port, None)?;
    let faults = handle.get_faults(ctl, limit).await;
    finish(handle, task).await?;
    println!("{}", serde_json::to_string_pretty(&faults?)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn received() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    #[test]
    fn test_parse_zone() {
        assert_eq!(parse_zone("01").unwrap(), (1, false));
        assert_eq!(parse_zone("0A").unwrap(), (10, false));
        assert_eq!(parse_zone("HW").unwrap(), (0, true));
        assert!(parse_zone("10").is_err());
        assert!(parse_zone("zz").is_err());
    }

    #[test]
    fn test_replay_prints_messages_and_failures() {
        let log = "\
2024-01-01T08:00:00.000000 045  I --- 01:145038 --:------ 01:145038 30C9 003 0107C1
# a comment
2024-01-01T08:00:01.000000 045  I --- 01:145038 --:------ 01:145038 30C9 002 0107
";
        let mut dispatcher = Dispatcher::new(&GatewayConfig::default(), Arc::new(Registry::new()));
        let mut out = Vec::new();
        replay(&mut dispatcher, log.as_bytes(), &mut out, false, received()).unwrap();

        let out = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("01:145038"));
        assert!(lines[1].starts_with("# Codec error"));
        assert!(dispatcher.graph().system("01:145038".parse().unwrap()).is_some());
    }

    #[test]
    fn test_replay_json() {
        let log = "2024-01-01T08:00:00.000000 045  I --- 01:145038 --:------ 01:145038 30C9 003 0107C1\n";
        let mut dispatcher = Dispatcher::new(&GatewayConfig::default(), Arc::new(Registry::new()));
        let mut out = Vec::new();
        replay(&mut dispatcher, log.as_bytes(), &mut out, true, received()).unwrap();

        let event: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(event["type"], "message");
        assert_eq!(event["message"]["code"], "30C9");
    }
}
