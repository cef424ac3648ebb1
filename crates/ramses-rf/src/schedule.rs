//! Reading and writing zone schedules (`0404`)
//!
//! A schedule travels as a zlib blob split into fragments. Reading asks
//! for fragment 1 (which tells us the total), then for the rest, one
//! request each. Writing compresses the schedule, sends each fragment and
//! reads back the schedule change counter.

use tracing::{debug, info};

use ramses_tx::codec::schedule::{fragments_to_schedule, schedule_to_fragments};
use ramses_tx::codec::{Schedule, ScheduleFragment};
use ramses_tx::{Address, Command, HexByte, Message, Payload};

use crate::error::{Result, RfError};
use crate::gateway::GatewayHandle;

/// What a fragment request returned
enum Reply {
    /// The controller has no schedule for the zone
    Empty,
    /// One fragment of several
    Fragment(ScheduleFragment),
    /// The whole schedule (it fitted in one fragment)
    Complete(Schedule),
}

fn classify(command: &Command, msg: Message) -> Result<Reply> {
    match msg.payload {
        Payload::Schedule(schedule) => Ok(Reply::Complete(schedule)),
        Payload::ScheduleFragment(fragment) if fragment.total_frags.is_none() => Ok(Reply::Empty),
        Payload::ScheduleFragment(fragment) => Ok(Reply::Fragment(fragment)),
        other => Err(RfError::unexpected(
            command,
            format!("expected a schedule fragment, got {}", other.to_json()),
        )),
    }
}

impl GatewayHandle {
    /// Read the schedule of a zone (or of DHW); `None` if the controller has none
    pub async fn get_schedule(&self, ctl: Address, zone_idx: u8, dhw: bool) -> Result<Option<Schedule>> {
        let first = Command::get_schedule_fragment(ctl, zone_idx, dhw, 1, None);
        let reply = self.send_command(first.clone()).await?;
        let (total, mut fragments) = match classify(&first, reply)? {
            Reply::Empty => {
                info!(%ctl, zone_idx, "No schedule");
                return Ok(None);
            }
            Reply::Complete(schedule) => {
                self.store_schedule(ctl, schedule.clone()).await?;
                return Ok(Some(schedule));
            }
            Reply::Fragment(fragment) => (
                fragment.total_frags.unwrap_or(1),
                vec![fragment.fragment],
            ),
        };

        for frag_number in 2..=total {
            let command = Command::get_schedule_fragment(ctl, zone_idx, dhw, frag_number, Some(total));
            let reply = self.send_command(command.clone()).await?;
            match classify(&command, reply)? {
                Reply::Fragment(fragment) if fragment.frag_number == frag_number => {
                    debug!(%ctl, zone_idx, frag_number, total, "Schedule fragment");
                    fragments.push(fragment.fragment);
                }
                Reply::Fragment(fragment) => {
                    return Err(RfError::Schedule {
                        zone_idx,
                        reason: format!(
                            "asked for fragment {frag_number}, got {}",
                            fragment.frag_number
                        ),
                    })
                }
                Reply::Complete(schedule) => {
                    self.store_schedule(ctl, schedule.clone()).await?;
                    return Ok(Some(schedule));
                }
                Reply::Empty => {
                    return Err(RfError::Schedule {
                        zone_idx,
                        reason: "schedule disappeared while reading".to_string(),
                    })
                }
            }
        }

        let schedule = fragments_to_schedule(HexByte(zone_idx), dhw, &fragments).map_err(|e| {
            RfError::Schedule {
                zone_idx,
                reason: e.to_string(),
            }
        })?;
        info!(%ctl, zone_idx, fragments = fragments.len(), "Schedule read");
        self.store_schedule(ctl, schedule.clone()).await?;
        Ok(Some(schedule))
    }

    /// Write a schedule; returns the controller's new schedule change counter
    pub async fn set_schedule(&self, ctl: Address, schedule: &Schedule) -> Result<Option<u16>> {
        let zone_idx = schedule.zone_idx.value();
        let fragments = schedule_to_fragments(schedule).map_err(|e| RfError::Schedule {
            zone_idx,
            reason: e.to_string(),
        })?;
        let total = u8::try_from(fragments.len()).map_err(|_| RfError::Schedule {
            zone_idx,
            reason: format!("{} fragments", fragments.len()),
        })?;

        for (frag_number, data) in (1..=total).zip(fragments) {
            debug!(%ctl, zone_idx, frag_number, total, "Writing schedule fragment");
            self.send_command(Command::set_schedule_fragment(
                ctl,
                zone_idx,
                schedule.dhw,
                frag_number,
                total,
                data,
            ))
            .await?;
        }
        info!(%ctl, zone_idx, fragments = total, "Schedule written");
        self.store_schedule(ctl, schedule.clone()).await?;

        let command = Command::get_schedule_version(ctl);
        match self.send_command(command.clone()).await?.payload {
            Payload::ScheduleVersion(version) => Ok(version.change_counter),
            other => Err(RfError::unexpected(
                command,
                format!("expected a schedule version, got {}", other.to_json()),
            )),
        }
    }
}
